//! Fault taxonomy.
//!
//! Every failure the gateway reports is a [`Fault`]: a closed set of fault
//! types with subcodes, each resolved against an immutable
//! [`FaultRegistry`] into `(code, summary, detail, retry strategy)`.

mod mapping;
mod registry;

pub use mapping::{connection_code, destination_fault_code, status_code};
pub use registry::{FaultRegistry, FaultTemplate};

use crate::model::{FaultMessage, HubHeader};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Guidance given to the caller on what to do after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    /// Transient; retry as normal
    Normal,
    /// The message itself must be fixed
    CorrectMessage,
    /// The destination is unhealthy; check its status before retrying
    CheckIisStatus,
    /// Requires operator attention
    ContactSupport,
}

impl RetryStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::CorrectMessage => "CORRECT_MESSAGE",
            Self::CheckIisStatus => "CHECK_IIS_STATUS",
            Self::ContactSupport => "CONTACT_SUPPORT",
        }
    }

    /// HTTP status used when a fault with this strategy is returned.
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Normal => 503,
            Self::CorrectMessage => 400,
            Self::CheckIisStatus => 502,
            Self::ContactSupport => 500,
        }
    }

    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Normal | Self::CheckIisStatus)
    }

    /// Parse the wire form (`CHECK_IIS_STATUS`, case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Some(Self::Normal),
            "CORRECT_MESSAGE" => Some(Self::CorrectMessage),
            "CHECK_IIS_STATUS" => Some(Self::CheckIisStatus),
            "CONTACT_SUPPORT" => Some(Self::ContactSupport),
            _ => None,
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault type, i.e. the wire fault element name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    Security,
    DestinationConnection,
    HubClient,
    MessageTooLarge,
    UnsupportedOperation,
    UnexpectedException,
}

impl FaultType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Security => "SecurityFault",
            Self::DestinationConnection => "DestinationConnectionFault",
            Self::HubClient => "HubClientFault",
            Self::MessageTooLarge => "MessageTooLargeFault",
            Self::UnsupportedOperation => "UnsupportedOperationFault",
            Self::UnexpectedException => "UnexpectedExceptionFault",
        }
    }

    /// Resolve a wire fault name; the 2011 lower-camel form is accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            Self::Security,
            Self::DestinationConnection,
            Self::HubClient,
            Self::MessageTooLarge,
            Self::UnsupportedOperation,
            Self::UnexpectedException,
        ]
        .into_iter()
        .find(|t| t.name().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityCode {
    /// Hostile content (script elements, javascript values, entities)
    SourceAttack,
    /// Structurally invalid or duplicated content
    MalformedRequest,
    CredentialDecryption,
    UnauthorizedCaller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionCode {
    ConnectTimeout,
    ReadTimeout,
    ConnectionRefused,
    UnknownHost,
    InvalidUri,
    TlsAtGateway,
    TlsAtDestination,
    ConnectionFailed,
    DestinationNotFound,
    UnderMaintenance,
    CircuitBreakerThrown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubClientCode {
    Unclassified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTimeout,
    InternalServerError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    DestinationSecurityFault,
    DestinationMessageTooLarge,
    DestinationUnsupportedOperation,
    DestinationFault,
    DestinationConnectionFault,
    InvalidResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeCode {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationCode {
    Operation,
    Dialect,
}

/// `(fault type, subcode)` key into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    Security(SecurityCode),
    DestinationConnection(ConnectionCode),
    HubClient(HubClientCode),
    MessageTooLarge(SizeCode),
    UnsupportedOperation(OperationCode),
    UnexpectedException,
}

impl FaultCode {
    pub const fn fault_type(self) -> FaultType {
        match self {
            Self::Security(_) => FaultType::Security,
            Self::DestinationConnection(_) => FaultType::DestinationConnection,
            Self::HubClient(_) => FaultType::HubClient,
            Self::MessageTooLarge(_) => FaultType::MessageTooLarge,
            Self::UnsupportedOperation(_) => FaultType::UnsupportedOperation,
            Self::UnexpectedException => FaultType::UnexpectedException,
        }
    }
}

/// A typed gateway fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{fault_name} {code}: {summary}")]
pub struct Fault {
    kind: FaultCode,
    fault_name: &'static str,
    code: &'static str,
    summary: String,
    detail: String,
    diagnostics: Option<String>,
    retry_strategy: RetryStrategy,
    original_body: Option<String>,
    destination: HubHeader,
    xml_cause: bool,
}

impl Fault {
    pub(crate) fn from_template(kind: FaultCode, template: &FaultTemplate) -> Self {
        Self {
            kind,
            fault_name: kind.fault_type().name(),
            code: template.code,
            summary: template.summary.to_string(),
            detail: template.detail.to_string(),
            diagnostics: None,
            retry_strategy: template.retry_strategy,
            original_body: None,
            destination: HubHeader::default(),
            xml_cause: false,
        }
    }

    /// Attach diagnostics describing the underlying cause.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }

    /// Replace the template detail with a more specific one.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Retain upstream content; callers mask PHI before passing it in.
    #[must_use]
    pub fn with_original_body(mut self, body: impl Into<String>) -> Self {
        self.original_body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_destination(mut self, id: &str, uri: &str) -> Self {
        self.destination = HubHeader::for_destination(id, uri);
        self
    }

    /// Mark the root cause as an XML structural error.
    #[must_use]
    pub fn caused_by_xml(mut self) -> Self {
        self.xml_cause = true;
        self
    }

    pub fn kind(&self) -> FaultCode {
        self.kind
    }

    pub fn fault_type(&self) -> FaultType {
        self.kind.fault_type()
    }

    pub fn fault_name(&self) -> &'static str {
        self.fault_name
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        self.retry_strategy
    }

    pub fn original_body(&self) -> Option<&str> {
        self.original_body.as_deref()
    }

    pub fn destination(&self) -> &HubHeader {
        &self.destination
    }

    pub fn is_xml_cause(&self) -> bool {
        self.xml_cause
    }

    /// HTTP status to answer with.
    pub fn http_status(&self) -> u16 {
        self.retry_strategy.http_status()
    }

    /// Faults the submitter caused map to `soap:Sender`.
    pub fn is_sender_fault(&self) -> bool {
        self.retry_strategy == RetryStrategy::CorrectMessage
    }

    pub fn is_source_attack(&self) -> bool {
        self.kind == FaultCode::Security(SecurityCode::SourceAttack)
    }

    /// Maintenance and already-thrown breaker faults are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FaultCode::DestinationConnection(
                ConnectionCode::UnderMaintenance | ConnectionCode::CircuitBreakerThrown,
            ) => false,
            _ => self.retry_strategy.is_retryable(),
        }
    }

    /// Whether exhausting retries on this fault should throw the breaker.
    pub fn should_break_circuit(&self) -> bool {
        match self.kind {
            FaultCode::DestinationConnection(
                ConnectionCode::UnderMaintenance | ConnectionCode::CircuitBreakerThrown,
            ) => false,
            FaultCode::DestinationConnection(_) => self.is_retryable(),
            FaultCode::HubClient(code) => matches!(
                code,
                HubClientCode::NotFound
                    | HubClientCode::RequestTimeout
                    | HubClientCode::InternalServerError
                    | HubClientCode::BadGateway
                    | HubClientCode::ServiceUnavailable
                    | HubClientCode::GatewayTimeout
                    | HubClientCode::DestinationConnectionFault
            ),
            _ => false,
        }
    }

    /// Wire form of this fault.
    pub fn to_message(&self, event_id: impl Into<String>) -> FaultMessage {
        FaultMessage {
            fault_name: self.fault_name.to_string(),
            code: Some(self.code.to_string()),
            reason: Some(self.summary.clone()),
            summary: Some(self.summary.clone()),
            detail: Some(self.detail.clone()),
            diagnostics: self.diagnostics.clone(),
            retry_strategy: Some(self.retry_strategy),
            event_id: Some(event_id.into()),
            original_body: self.original_body.clone(),
            destination: self.destination.clone(),
        }
    }
}
