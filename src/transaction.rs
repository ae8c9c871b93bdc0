//! Per-exchange transaction record.

use crate::fault::{Fault, RetryStrategy};
use crate::model::MessageKind;
use std::time::Duration;

/// What happened during one dispatched exchange, for logging and audit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionData {
    pub message_type: Option<MessageKind>,
    pub dest_id: Option<String>,
    pub dest_uri: Option<String>,
    pub request_size: usize,
    pub response_size: usize,
    pub retry_count: u32,
    /// Summed over all attempts
    pub connect_elapsed: Duration,
    /// Summed over all attempts
    pub read_elapsed: Duration,
    /// Time spent serializing outbound messages
    pub write_elapsed: Duration,
    pub fault_code: Option<String>,
    pub retry_strategy: Option<RetryStrategy>,
    /// Endpoint status change the store refused to save
    pub status_error: Option<String>,
}

impl TransactionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fault(&mut self, fault: &Fault) {
        self.fault_code = Some(format!("{}:{}", fault.fault_name(), fault.code()));
        self.retry_strategy = Some(fault.retry_strategy());
    }

    pub fn is_fault(&self) -> bool {
        self.fault_code.is_some()
    }

    pub fn total_elapsed(&self) -> Duration {
        self.connect_elapsed + self.read_elapsed + self.write_elapsed
    }
}
