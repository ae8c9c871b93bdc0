//! Per-destination endpoint status records.

use crate::destination::{Destination, DestinationKey};
use crate::fault::RetryStrategy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Connectivity state of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointState {
    Connected,
    CircuitBreakerThrown,
    UnderMaintenance,
    Unknown,
}

/// Durable status record, one per destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub key: DestinationKey,
    pub status: EndpointState,
    pub detail: Option<String>,
    pub diagnostics: Option<String>,
    pub retry_strategy: Option<RetryStrategy>,
    pub status_at: DateTime<Utc>,
    pub status_by: String,
    /// Retries used by the exchange that last set this status
    pub retry_count: u32,
}

impl EndpointStatus {
    /// Initial record for a destination seen for the first time.
    pub fn initial(destination: &Destination, now: DateTime<Utc>, by: &str) -> Self {
        let (status, detail) = if destination.is_under_maintenance(now) {
            (
                EndpointState::UnderMaintenance,
                destination.maintenance_reason.clone(),
            )
        } else {
            (EndpointState::Unknown, None)
        };
        Self {
            key: destination.key.clone(),
            status,
            detail,
            diagnostics: None,
            retry_strategy: None,
            status_at: now,
            status_by: by.to_string(),
            retry_count: 0,
        }
    }

    pub fn is_circuit_breaker_thrown(&self) -> bool {
        self.status == EndpointState::CircuitBreakerThrown
    }

    /// Record a successful exchange.
    pub fn mark_connected(&mut self, now: DateTime<Utc>, by: &str, retry_count: u32) {
        self.status = EndpointState::Connected;
        self.detail = None;
        self.diagnostics = None;
        self.retry_strategy = None;
        self.status_at = now;
        self.status_by = by.to_string();
        self.retry_count = retry_count;
    }

    /// Throw the breaker with the fault that exhausted the retries.
    pub fn mark_thrown(
        &mut self,
        now: DateTime<Utc>,
        by: &str,
        retry_count: u32,
        detail: impl Into<String>,
        diagnostics: Option<String>,
        retry_strategy: RetryStrategy,
    ) {
        self.status = EndpointState::CircuitBreakerThrown;
        self.detail = Some(detail.into());
        self.diagnostics = diagnostics;
        self.retry_strategy = Some(retry_strategy);
        self.status_at = now;
        self.status_by = by.to_string();
        self.retry_count = retry_count;
    }
}

/// Result type for status store operations.
pub type StatusStoreResult<T> = Result<T, StatusStoreError>;

/// Status persistence contract.
#[async_trait]
pub trait EndpointStatusStore: Send + Sync {
    /// All records for a destination id, across destination types.
    async fn find(&self, dest_id: &str) -> StatusStoreResult<Vec<EndpointStatus>>;

    /// The record for one destination.
    async fn find_by_id(&self, key: &DestinationKey) -> StatusStoreResult<Option<EndpointStatus>>;

    /// Insert or replace a record and make it durable before returning.
    async fn save_and_flush(&self, status: &EndpointStatus) -> StatusStoreResult<()>;

    /// Clear every thrown breaker; returns how many were reset.
    async fn reset_circuit_breakers(&self, by: &str) -> StatusStoreResult<usize>;
}

/// Errors returned by status store implementations.
#[derive(Debug, Clone, Error)]
pub enum StatusStoreError {
    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl StatusStoreError {
    /// Wraps a persistence error.
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }
}

/// Thread-safe in-memory status store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStatusStore {
    records: Arc<RwLock<HashMap<DestinationKey, EndpointStatus>>>,
}

impl InMemoryStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(err: impl std::fmt::Display) -> StatusStoreError {
    StatusStoreError::persistence(std::io::Error::other(err.to_string()))
}

#[async_trait]
impl EndpointStatusStore for InMemoryStatusStore {
    async fn find(&self, dest_id: &str) -> StatusStoreResult<Vec<EndpointStatus>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .values()
            .filter(|r| r.key.dest_id == dest_id)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, key: &DestinationKey) -> StatusStoreResult<Option<EndpointStatus>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(key).cloned())
    }

    async fn save_and_flush(&self, status: &EndpointStatus) -> StatusStoreResult<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(status.key.clone(), status.clone());
        Ok(())
    }

    async fn reset_circuit_breakers(&self, by: &str) -> StatusStoreResult<usize> {
        let mut records = self.records.write().map_err(poisoned)?;
        let now = Utc::now();
        let mut reset = 0;
        for record in records.values_mut().filter(|r| r.is_circuit_breaker_thrown()) {
            record.status = EndpointState::Unknown;
            record.detail = None;
            record.diagnostics = None;
            record.retry_strategy = None;
            record.status_at = now;
            record.status_by = by.to_string();
            record.retry_count = 0;
            reset += 1;
        }
        Ok(reset)
    }
}

/// One async mutex per destination, serializing status transitions.
#[derive(Debug, Default)]
pub struct StatusLocks {
    locks: Mutex<HashMap<DestinationKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl StatusLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `key`'s record.
    pub fn lock_for(&self, key: &DestinationKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

/// Records the store refused to save, held until a later save succeeds so
/// that a thrown breaker is never forgotten.
#[derive(Debug, Default)]
pub struct HeldStatuses {
    held: Mutex<HashMap<DestinationKey, EndpointStatus>>,
}

impl HeldStatuses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `status` as the latest record for its destination.
    pub fn hold(&self, status: EndpointStatus) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(status.key.clone(), status);
    }

    pub fn get(&self, key: &DestinationKey) -> Option<EndpointStatus> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.get(key).cloned()
    }

    pub fn release(&self, key: &DestinationKey) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(key);
    }

    /// Drop every held thrown breaker; returns how many were dropped.
    pub fn release_thrown(&self) -> usize {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let before = held.len();
        held.retain(|_, status| !status.is_circuit_breaker_thrown());
        before - held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn destination() -> Destination {
        Destination::new("md", "https://md.example.org/iis")
    }

    #[test]
    fn test_initial_record() {
        let now = Utc::now();
        let record = EndpointStatus::initial(&destination(), now, "node-a");
        assert_eq!(record.status, EndpointState::Unknown);
        assert_eq!(record.status_by, "node-a");

        let mut down = destination();
        down.maintenance_start = Some(now - Duration::minutes(5));
        down.maintenance_reason = Some("Quarterly upgrade".to_string());
        let record = EndpointStatus::initial(&down, now, "node-a");
        assert_eq!(record.status, EndpointState::UnderMaintenance);
        assert_eq!(record.detail.as_deref(), Some("Quarterly upgrade"));
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let store = InMemoryStatusStore::new();
        let dest = destination();
        assert!(store.find_by_id(&dest.key).await.unwrap().is_none());

        let mut record = EndpointStatus::initial(&dest, Utc::now(), "node-a");
        record.mark_connected(Utc::now(), "node-a", 2);
        store.save_and_flush(&record).await.unwrap();

        let found = store.find_by_id(&dest.key).await.unwrap().unwrap();
        assert_eq!(found.status, EndpointState::Connected);
        assert_eq!(found.retry_count, 2);
        assert_eq!(store.find("md").await.unwrap().len(), 1);
        assert!(store.find("va").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_circuit_breakers() {
        let store = InMemoryStatusStore::new();
        let mut record = EndpointStatus::initial(&destination(), Utc::now(), "node-a");
        record.mark_thrown(
            Utc::now(),
            "node-a",
            4,
            "Connection Refused",
            None,
            RetryStrategy::CheckIisStatus,
        );
        store.save_and_flush(&record).await.unwrap();

        assert_eq!(store.reset_circuit_breakers("admin").await.unwrap(), 1);
        let found = store.find_by_id(&record.key).await.unwrap().unwrap();
        assert_eq!(found.status, EndpointState::Unknown);
        assert_eq!(found.status_by, "admin");
        assert_eq!(store.reset_circuit_breakers("admin").await.unwrap(), 0);
    }

    #[test]
    fn test_held_statuses() {
        let held = HeldStatuses::new();
        let mut thrown = EndpointStatus::initial(&destination(), Utc::now(), "node-a");
        thrown.mark_thrown(
            Utc::now(),
            "node-a",
            4,
            "Connection Refused",
            None,
            RetryStrategy::CheckIisStatus,
        );
        held.hold(thrown.clone());
        assert_eq!(held.get(&thrown.key), Some(thrown.clone()));

        held.release(&thrown.key);
        assert_eq!(held.get(&thrown.key), None);

        held.hold(thrown.clone());
        held.hold(EndpointStatus::initial(
            &Destination::new("va", "https://va.example.org/iis"),
            Utc::now(),
            "node-a",
        ));
        assert_eq!(held.release_thrown(), 1);
        assert_eq!(held.get(&thrown.key), None);
    }

    #[test]
    fn test_locks_are_shared_per_destination() {
        let locks = StatusLocks::new();
        let key = destination().key;
        let a = locks.lock_for(&key);
        let b = locks.lock_for(&key);
        let other = locks.lock_for(&DestinationKey::new("va", "prod"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
