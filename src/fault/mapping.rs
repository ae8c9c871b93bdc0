//! Mapping raw failure signals onto the fault taxonomy.

use super::{ConnectionCode, Fault, FaultCode, FaultRegistry, FaultType, HubClientCode, SizeCode};
use crate::model::FaultMessage;
use crate::transport::TransportError;

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout"];
const REFUSED_PATTERNS: &[&str] = &["refused"];

/// Select the connection subcode for a transport error.
pub fn connection_code(err: &TransportError) -> ConnectionCode {
    match err {
        TransportError::Connect(message) => {
            let message = message.to_ascii_lowercase();
            if TIMEOUT_PATTERNS.iter().any(|p| message.contains(p)) {
                ConnectionCode::ConnectTimeout
            } else if REFUSED_PATTERNS.iter().any(|p| message.contains(p)) {
                ConnectionCode::ConnectionRefused
            } else {
                ConnectionCode::ConnectionFailed
            }
        }
        TransportError::ReadTimeout(_) => ConnectionCode::ReadTimeout,
        TransportError::UnknownHost(_) => ConnectionCode::UnknownHost,
        TransportError::InvalidUri(_) => ConnectionCode::InvalidUri,
        TransportError::TlsAtGateway(_) => ConnectionCode::TlsAtGateway,
        TransportError::TlsAtDestination(_) => ConnectionCode::TlsAtDestination,
        TransportError::Io(_) | TransportError::ResponseTooLarge { .. } => {
            ConnectionCode::ConnectionFailed
        }
    }
}

/// Select the Hub client subcode for an HTTP status without a SOAP fault.
pub fn status_code(status: u16) -> HubClientCode {
    match status {
        400 => HubClientCode::BadRequest,
        401 => HubClientCode::Unauthorized,
        403 => HubClientCode::Forbidden,
        404 => HubClientCode::NotFound,
        408 => HubClientCode::RequestTimeout,
        500 => HubClientCode::InternalServerError,
        502 => HubClientCode::BadGateway,
        503 => HubClientCode::ServiceUnavailable,
        504 => HubClientCode::GatewayTimeout,
        _ => HubClientCode::Unclassified,
    }
}

/// Select the Hub client subcode for a fault the destination returned.
pub fn destination_fault_code(fault_name: &str) -> HubClientCode {
    match FaultType::from_name(fault_name) {
        Some(FaultType::Security) => HubClientCode::DestinationSecurityFault,
        Some(FaultType::MessageTooLarge) => HubClientCode::DestinationMessageTooLarge,
        Some(FaultType::UnsupportedOperation) => HubClientCode::DestinationUnsupportedOperation,
        Some(FaultType::DestinationConnection) => HubClientCode::DestinationConnectionFault,
        Some(FaultType::HubClient | FaultType::UnexpectedException) | None => {
            HubClientCode::DestinationFault
        }
    }
}

impl FaultRegistry {
    /// Classify a transport failure.
    pub fn from_transport_error(&self, err: &TransportError) -> Fault {
        let fault = match err {
            TransportError::ResponseTooLarge { .. } => {
                self.fault(FaultCode::MessageTooLarge(SizeCode::Response))
            }
            _ => self.connection(connection_code(err)),
        };
        fault.with_diagnostics(err.to_string())
    }

    /// Classify an HTTP status that carried no structured SOAP fault.
    pub fn from_http_status(&self, status: u16) -> Fault {
        self.hub_client(status_code(status))
            .with_diagnostics(format!("Destination returned HTTP {status}"))
    }

    /// Classify a SOAP fault the destination returned with HTTP `status`.
    ///
    /// The inner fault block names the fault type when there is one; a bare
    /// SOAP fault is classified by its HTTP status.
    pub fn from_destination_fault(&self, fault: &FaultMessage, status: u16) -> Fault {
        let (classified, mut diagnostics) = if fault.fault_name.is_empty() {
            (
                self.hub_client(status_code(status)),
                format!("Destination returned a SOAP fault with HTTP {status}"),
            )
        } else {
            (
                self.hub_client(destination_fault_code(&fault.fault_name)),
                format!("Destination returned {}", fault.fault_name),
            )
        };
        if let Some(code) = fault.code.as_deref() {
            diagnostics.push_str(&format!(" code {code}"));
        }
        if let Some(text) = fault.summary.as_deref().or(fault.reason.as_deref()) {
            diagnostics.push_str(&format!(": {text}"));
        }
        if let Some(detail) = fault.detail.as_deref() {
            diagnostics.push_str(&format!(" ({detail})"));
        }
        classified.with_diagnostics(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::RetryStrategy;

    #[test]
    fn test_connect_refused_maps_to_12() {
        let registry = FaultRegistry::standard();
        let fault = registry.from_transport_error(&TransportError::Connect(
            "tcp connect error: Connection refused (os error 111)".to_string(),
        ));
        assert_eq!(fault.code(), "12");
        assert_eq!(fault.retry_strategy(), RetryStrategy::CheckIisStatus);
    }

    #[test]
    fn test_connect_timeout_and_read_timeout_differ() {
        let connect = connection_code(&TransportError::Connect("operation timed out".to_string()));
        let read = connection_code(&TransportError::ReadTimeout("body".to_string()));
        assert_eq!(connect, ConnectionCode::ConnectTimeout);
        assert_eq!(read, ConnectionCode::ReadTimeout);

        let registry = FaultRegistry::standard();
        assert_eq!(registry.connection(connect).code(), "10");
        assert_eq!(registry.connection(read).code(), "11");
    }

    #[test]
    fn test_oversized_response_is_message_too_large() {
        let registry = FaultRegistry::standard();
        let fault = registry.from_transport_error(&TransportError::ResponseTooLarge {
            size: 9_000_000,
            limit: 5_242_880,
        });
        assert_eq!(fault.code(), "31");
        assert_eq!(fault.fault_name(), "MessageTooLargeFault");
        assert!(!fault.is_retryable());
    }

    #[test]
    fn test_other_transport_errors() {
        assert_eq!(
            connection_code(&TransportError::UnknownHost("nowhere.invalid".to_string())),
            ConnectionCode::UnknownHost
        );
        assert_eq!(
            connection_code(&TransportError::InvalidUri("http://plain".to_string())),
            ConnectionCode::InvalidUri
        );
        assert_eq!(
            connection_code(&TransportError::TlsAtGateway("bad key".to_string())),
            ConnectionCode::TlsAtGateway
        );
        assert_eq!(
            connection_code(&TransportError::TlsAtDestination("bad cert".to_string())),
            ConnectionCode::TlsAtDestination
        );
        assert_eq!(
            connection_code(&TransportError::Connect("network unreachable".to_string())),
            ConnectionCode::ConnectionFailed
        );
    }

    #[test]
    fn test_http_status_table() {
        let registry = FaultRegistry::standard();
        let cases = [
            (400, "201", RetryStrategy::CorrectMessage),
            (401, "202", RetryStrategy::CorrectMessage),
            (403, "203", RetryStrategy::CorrectMessage),
            (404, "204", RetryStrategy::CheckIisStatus),
            (408, "205", RetryStrategy::Normal),
            (500, "206", RetryStrategy::CheckIisStatus),
            (502, "207", RetryStrategy::CheckIisStatus),
            (503, "208", RetryStrategy::CheckIisStatus),
            (504, "209", RetryStrategy::CheckIisStatus),
            (418, "200", RetryStrategy::ContactSupport),
        ];
        for (status, code, strategy) in cases {
            let fault = registry.from_http_status(status);
            assert_eq!(fault.code(), code, "status {status}");
            assert_eq!(fault.retry_strategy(), strategy, "status {status}");
        }
    }

    #[test]
    fn test_destination_fault_by_inner_name() {
        let registry = FaultRegistry::standard();
        let fault = FaultMessage {
            fault_name: "securityFault".to_string(),
            code: Some("1".to_string()),
            summary: Some("Bad credentials".to_string()),
            ..Default::default()
        };
        let mapped = registry.from_destination_fault(&fault, 500);
        assert_eq!(mapped.code(), "210");
        assert!(mapped.diagnostics().is_some_and(|d| d.contains("Bad credentials")));

        let relayed = FaultMessage {
            fault_name: "DestinationConnectionFault".to_string(),
            ..Default::default()
        };
        let mapped = registry.from_destination_fault(&relayed, 500);
        assert_eq!(mapped.code(), "214");
        assert!(mapped.should_break_circuit());

        let unknown = FaultMessage {
            fault_name: "SomethingElseFault".to_string(),
            ..Default::default()
        };
        assert_eq!(registry.from_destination_fault(&unknown, 500).code(), "213");
    }

    #[test]
    fn test_bare_destination_fault_uses_status_table() {
        let registry = FaultRegistry::standard();
        let bare = FaultMessage {
            reason: Some("Server was unable to process request".to_string()),
            ..Default::default()
        };
        let mapped = registry.from_destination_fault(&bare, 500);
        assert_eq!(mapped.code(), "206");
        assert_eq!(mapped.retry_strategy(), RetryStrategy::CheckIisStatus);
        assert!(mapped.is_retryable());
        assert!(mapped
            .diagnostics()
            .is_some_and(|d| d.contains("HTTP 500") && d.contains("unable to process")));

        assert_eq!(registry.from_destination_fault(&bare, 400).code(), "201");
    }
}
