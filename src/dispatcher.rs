//! Outbound dispatch of a message to a destination.
//!
//! The dispatcher gates on destination state, retargets the message to the
//! destination's dialect, runs the send/retry loop and keeps the per
//! destination [`EndpointStatus`] record current. Status transitions are
//! serialized per destination; a success never clears a breaker that was
//! thrown after the exchange began.

use crate::config::{DispatchConfig, GatewayConfig, SettingsConfig};
use crate::destination::{CredentialCodec, Destination, DestinationDirectory};
use crate::fault::{
    ConnectionCode, Fault, FaultCode, FaultRegistry, HubClientCode, OperationCode, RetryStrategy,
    SecurityCode, SizeCode,
};
use crate::masking::mask_original_body;
use crate::model::{HubHeader, MessageBody, MessageModel};
use crate::parser::SoapReader;
use crate::status::{EndpointStatus, EndpointStatusStore, HeldStatuses, StatusLocks, StatusStoreError};
use crate::transaction::TransactionData;
use crate::transport::{OutboundRequest, Transport, TransportResponse};
use crate::writer::SoapWriter;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at saving one status record before it is held in memory.
const STATUS_SAVE_ATTEMPTS: u32 = 3;

/// Who is asking for the dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub principal: String,
    /// Elevated callers bypass the maintenance and circuit breaker gates
    pub elevated: bool,
}

impl CallerContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            elevated: false,
        }
    }

    pub fn admin(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            elevated: true,
        }
    }
}

/// Counters over the dispatcher's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    pub dispatched: u64,
    pub faulted: u64,
    pub retries: u64,
    pub breakers_thrown: u64,
}

/// Sends messages to configured destinations.
pub struct DestinationDispatcher {
    dispatch: DispatchConfig,
    settings: SettingsConfig,
    registry: Arc<FaultRegistry>,
    reader: SoapReader,
    transport: Arc<dyn Transport>,
    store: Arc<dyn EndpointStatusStore>,
    directory: Arc<dyn DestinationDirectory>,
    codec: Arc<dyn CredentialCodec>,
    locks: StatusLocks,
    held: HeldStatuses,
    dispatched: AtomicU64,
    faulted: AtomicU64,
    retries: AtomicU64,
    breakers_thrown: AtomicU64,
}

impl DestinationDispatcher {
    pub fn new(
        config: &GatewayConfig,
        registry: Arc<FaultRegistry>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn EndpointStatusStore>,
        directory: Arc<dyn DestinationDirectory>,
        codec: Arc<dyn CredentialCodec>,
    ) -> Self {
        let reader = SoapReader::new(Arc::clone(&registry), config.settings.reader_limits());
        Self {
            dispatch: config.dispatch.clone(),
            settings: config.settings.clone(),
            registry,
            reader,
            transport,
            store,
            directory,
            codec,
            locks: StatusLocks::new(),
            held: HeldStatuses::new(),
            dispatched: AtomicU64::new(0),
            faulted: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            breakers_thrown: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> DispatchMetrics {
        DispatchMetrics {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            breakers_thrown: self.breakers_thrown.load(Ordering::Relaxed),
        }
    }

    /// Send `message` to `dest_id` and return the response in the caller's
    /// dialect.
    pub async fn dispatch(
        &self,
        message: &MessageModel,
        dest_id: &str,
        caller: &CallerContext,
        tx: &mut TransactionData,
    ) -> Result<MessageModel, Fault> {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        tx.message_type = Some(message.kind());
        tx.dest_id = Some(dest_id.to_string());

        debug!(
            dest_id = %dest_id,
            principal = %caller.principal,
            message_type = %message.kind(),
            "Dispatching message"
        );

        let result = self.dispatch_inner(message, dest_id, caller, tx).await;
        match &result {
            Ok(_) => {
                info!(
                    dest_id = %dest_id,
                    retries = tx.retry_count,
                    elapsed_ms = tx.total_elapsed().as_millis() as u64,
                    "Dispatch succeeded"
                );
            }
            Err(fault) => {
                self.faulted.fetch_add(1, Ordering::Relaxed);
                tx.record_fault(fault);
                warn!(
                    dest_id = %dest_id,
                    fault = %fault.fault_name(),
                    code = %fault.code(),
                    retry = %fault.retry_strategy().as_str(),
                    retries = tx.retry_count,
                    "Dispatch failed"
                );
            }
        }
        result
    }

    /// Clear every thrown breaker, including trips the store refused.
    pub async fn reset_circuit_breakers(&self, by: &str) -> Result<usize, StatusStoreError> {
        let reset = self.held.release_thrown() + self.store.reset_circuit_breakers(by).await?;
        info!(by = %by, reset, "Circuit breakers reset");
        Ok(reset)
    }

    async fn dispatch_inner(
        &self,
        message: &MessageModel,
        dest_id: &str,
        caller: &CallerContext,
        tx: &mut TransactionData,
    ) -> Result<MessageModel, Fault> {
        let started_at = Utc::now();
        let destination = self.gate(dest_id, caller, started_at).await?;
        tx.dest_uri = Some(destination.dest_uri.clone());

        let outbound = self
            .prepare(message, &destination)
            .map_err(|f| f.with_destination(destination.dest_id(), &destination.dest_uri))?;

        let write_started = Instant::now();
        let body = SoapWriter::wire()
            .write(&outbound)
            .map_err(|e| self.registry.unexpected(&e))?;
        tx.write_elapsed += write_started.elapsed();
        tx.request_size = body.len();

        let request = OutboundRequest {
            uri: destination.dest_uri.clone(),
            action: outbound.wsa.action.clone().unwrap_or_default(),
            body,
            max_response_size: self.settings.max_body_size,
        };

        let mut retries = 0u32;
        loop {
            match self.attempt(&request, &destination, tx).await {
                Ok(response) => {
                    tx.retry_count = retries;
                    if let Err(e) = self.record_success(&destination, started_at, retries).await {
                        tx.status_error = Some(e.to_string());
                    }
                    return Ok(self.to_caller(response, message, &destination));
                }
                Err(fault) => {
                    let fault = fault.with_destination(destination.dest_id(), &destination.dest_uri);
                    if fault.retry_strategy() != RetryStrategy::CheckIisStatus
                        || !fault.is_retryable()
                        || fault.is_xml_cause()
                    {
                        return Err(fault);
                    }

                    retries += 1;
                    tx.retry_count = retries;
                    if retries > self.dispatch.max_retries {
                        if !fault.should_break_circuit() {
                            return Err(fault);
                        }
                        return match self.throw_breaker(&destination, retries, &fault).await {
                            Ok(()) => Err(fault),
                            Err(e) => {
                                tx.status_error = Some(e.to_string());
                                let diagnostics = format!(
                                    "{}; circuit breaker not persisted: {e}",
                                    fault.diagnostics().unwrap_or(fault.summary())
                                );
                                Err(fault.with_diagnostics(diagnostics))
                            }
                        };
                    }

                    self.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        dest_id = %destination.dest_id(),
                        attempt = retries + 1,
                        code = %fault.code(),
                        "Retrying destination"
                    );
                    self.dispatch.retry_policy.pause().await;
                }
            }
        }
    }

    /// Resolve the destination and refuse it when it is down.
    async fn gate(
        &self,
        dest_id: &str,
        caller: &CallerContext,
        now: DateTime<Utc>,
    ) -> Result<Destination, Fault> {
        let Some(destination) = self.directory.find(dest_id).await else {
            return Err(self
                .registry
                .connection(ConnectionCode::DestinationNotFound)
                .with_diagnostics(format!("No destination configured with id '{dest_id}'")));
        };
        let attach = |f: Fault| f.with_destination(destination.dest_id(), &destination.dest_uri);

        if destination.is_under_maintenance(now) && !caller.elevated {
            let reason = destination
                .maintenance_reason
                .clone()
                .unwrap_or_else(|| "Scheduled maintenance".to_string());
            return Err(attach(
                self.registry
                    .connection(ConnectionCode::UnderMaintenance)
                    .with_diagnostics(reason),
            ));
        }

        let lock = self.locks.lock_for(&destination.key);
        let _guard = lock.lock().await;

        let status = self
            .current_status(&destination, now)
            .await
            .map_err(|e| attach(self.registry.unexpected(&e)))?;

        let exempt =
            destination.skip_status_check || self.dispatch.is_status_check_exempt(dest_id);
        if status.is_circuit_breaker_thrown() && !caller.elevated && !exempt {
            let mut fault = self
                .registry
                .connection(ConnectionCode::CircuitBreakerThrown)
                .with_diagnostics(format!(
                    "Circuit breaker thrown at {} by {}",
                    status.status_at.to_rfc3339(),
                    status.status_by
                ));
            if let Some(detail) = status.detail.as_deref() {
                fault = fault.with_detail(detail);
            }
            return Err(attach(fault));
        }

        Ok(destination)
    }

    /// Copy of `message` addressed to `destination` in its dialect.
    fn prepare(&self, message: &MessageModel, destination: &Destination) -> Result<MessageModel, Fault> {
        let kind = message.kind();
        if !kind.is_request() {
            return Err(self
                .registry
                .fault(FaultCode::UnsupportedOperation(OperationCode::Operation))
                .with_diagnostics(format!("{kind} cannot be sent to a destination")));
        }

        let mut outbound = message.clone();
        outbound.schema = destination.schema();
        if !destination.is_hub() {
            outbound.hub_header = HubHeader::default();
        }

        if let MessageBody::SubmitSingleMessageRequest(request) = &mut outbound.body {
            request.credentials = self.codec.credentials_for(destination).map_err(|e| {
                self.registry
                    .security(SecurityCode::CredentialDecryption)
                    .with_diagnostics(e.to_string())
            })?;
        }

        outbound.wsa.message_id = Some(format!("urn:uuid:{}", Uuid::new_v4()));
        outbound.wsa.relates_to = None;
        outbound.wsa.to = Some(destination.dest_uri.clone());
        outbound.wsa.action = Some(outbound.derive_action());
        Ok(outbound)
    }

    /// One exchange with the destination.
    async fn attempt(
        &self,
        request: &OutboundRequest,
        destination: &Destination,
        tx: &mut TransactionData,
    ) -> Result<MessageModel, Fault> {
        let response = self
            .transport
            .exchange(request)
            .await
            .map_err(|e| self.registry.from_transport_error(&e))?;
        tx.connect_elapsed += response.connect_elapsed;
        tx.read_elapsed += response.read_elapsed;
        tx.response_size = response.body.len();
        self.interpret(&response, destination)
    }

    /// Turn an HTTP answer into a response message or a fault.
    fn interpret(&self, response: &TransportResponse, destination: &Destination) -> Result<MessageModel, Fault> {
        let original = || {
            mask_original_body(
                &String::from_utf8_lossy(&response.body),
                self.settings.original_body_limit,
            )
        };

        if !matches!(response.status, 200 | 400 | 500) {
            return Err(self
                .registry
                .from_http_status(response.status)
                .with_original_body(original()));
        }

        if response.body.len() > self.settings.max_body_size {
            return Err(self
                .registry
                .fault(FaultCode::MessageTooLarge(SizeCode::Response))
                .with_diagnostics(format!(
                    "Response body size {} exceeds maximum {}",
                    response.body.len(),
                    self.settings.max_body_size
                )));
        }

        let message = match self.reader.read(&response.body, Some(destination.schema())) {
            Ok(message) => message,
            Err(fault) if fault.is_source_attack() => return Err(fault),
            Err(fault) if response.status == 200 => {
                let cause = fault.diagnostics().unwrap_or(fault.summary()).to_string();
                return Err(self
                    .registry
                    .hub_client(HubClientCode::InvalidResponse)
                    .with_diagnostics(cause)
                    .with_original_body(original())
                    .caused_by_xml());
            }
            Err(_) => {
                return Err(self
                    .registry
                    .from_http_status(response.status)
                    .with_original_body(original()));
            }
        };

        if let Some(fault) = message.fault() {
            return Err(self
                .registry
                .from_destination_fault(fault, response.status)
                .with_original_body(original()));
        }

        if !message.kind().is_response() {
            let fault = if response.status == 200 {
                self.registry
                    .hub_client(HubClientCode::InvalidResponse)
                    .with_diagnostics(format!("Destination answered with {}", message.kind()))
            } else {
                self.registry.from_http_status(response.status)
            };
            return Err(fault.with_original_body(original()));
        }

        Ok(message)
    }

    /// Readdress the destination's response to the caller.
    fn to_caller(&self, mut response: MessageModel, request: &MessageModel, destination: &Destination) -> MessageModel {
        response.schema = request.schema;
        response.hub_header = if request.is_hub() {
            HubHeader::for_destination(destination.dest_id(), &destination.dest_uri)
        } else {
            HubHeader::default()
        };
        response.wsa.relates_to = request.wsa.message_id.clone();
        response.wsa.to = None;
        response.wsa.message_id = Some(format!("urn:uuid:{}", Uuid::new_v4()));
        response.wsa.action = Some(response.derive_action());
        response
    }

    /// Record for `destination`, created on first sight. A record the store
    /// refused earlier is saved again and wins over the stored one. Callers
    /// hold the destination lock.
    async fn current_status(
        &self,
        destination: &Destination,
        now: DateTime<Utc>,
    ) -> Result<EndpointStatus, StatusStoreError> {
        if let Some(status) = self.held.get(&destination.key) {
            if self.persist(&status).await.is_ok() {
                info!(dest_id = %destination.dest_id(), status = ?status.status, "Held endpoint status saved");
            }
            return Ok(status);
        }
        match self.store.find_by_id(&destination.key).await? {
            Some(status) => Ok(status),
            None => {
                let status = EndpointStatus::initial(destination, now, &self.dispatch.node_name);
                self.persist(&status).await?;
                Ok(status)
            }
        }
    }

    /// Save a record, retrying a refused write.
    async fn persist(&self, status: &EndpointStatus) -> Result<(), StatusStoreError> {
        let mut attempt = 1;
        loop {
            match self.store.save_and_flush(status).await {
                Ok(()) => {
                    self.held.release(&status.key);
                    return Ok(());
                }
                Err(e) if attempt < STATUS_SAVE_ATTEMPTS => {
                    debug!(dest_id = %status.key.dest_id, attempt, error = %e, "Retrying endpoint status save");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Save a record, holding it in memory when the store keeps refusing.
    async fn persist_or_hold(&self, status: EndpointStatus) -> Result<(), StatusStoreError> {
        if let Err(e) = self.persist(&status).await {
            warn!(
                dest_id = %status.key.dest_id,
                status = ?status.status,
                error = %e,
                "Failed to save endpoint status, holding it"
            );
            self.held.hold(status);
            return Err(e);
        }
        Ok(())
    }

    async fn record_success(
        &self,
        destination: &Destination,
        started_at: DateTime<Utc>,
        retries: u32,
    ) -> Result<(), StatusStoreError> {
        let lock = self.locks.lock_for(&destination.key);
        let _guard = lock.lock().await;

        let mut status = match self.current_status(destination, started_at).await {
            Ok(status) => status,
            Err(e) => {
                warn!(dest_id = %destination.dest_id(), error = %e, "Failed to read endpoint status");
                return Err(e);
            }
        };

        // A breaker thrown by a concurrent exchange after this one began stands.
        if status.is_circuit_breaker_thrown() && status.status_at >= started_at {
            debug!(dest_id = %destination.dest_id(), "Breaker thrown during exchange, leaving it");
            return Ok(());
        }

        status.mark_connected(Utc::now(), &self.dispatch.node_name, retries);
        self.persist_or_hold(status).await
    }

    async fn throw_breaker(
        &self,
        destination: &Destination,
        retries: u32,
        fault: &Fault,
    ) -> Result<(), StatusStoreError> {
        let lock = self.locks.lock_for(&destination.key);
        let _guard = lock.lock().await;
        let now = Utc::now();

        let mut status = match self.current_status(destination, now).await {
            Ok(status) => status,
            Err(e) => {
                warn!(dest_id = %destination.dest_id(), error = %e, "Failed to read endpoint status");
                EndpointStatus::initial(destination, now, &self.dispatch.node_name)
            }
        };

        status.mark_thrown(
            now,
            &self.dispatch.node_name,
            retries,
            fault.summary(),
            fault.diagnostics().map(str::to_string),
            fault.retry_strategy(),
        );
        self.breakers_thrown.fetch_add(1, Ordering::Relaxed);
        warn!(
            dest_id = %destination.dest_id(),
            code = %fault.code(),
            retries,
            "Circuit breaker thrown"
        );
        self.persist_or_hold(status).await
    }
}
