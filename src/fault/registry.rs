//! Immutable fault template registry.

use super::{
    ConnectionCode, Fault, FaultCode, HubClientCode, OperationCode, RetryStrategy, SecurityCode,
    SizeCode,
};
use super::RetryStrategy::{CheckIisStatus, ContactSupport, CorrectMessage, Normal};
use std::collections::HashMap;

/// Static text and retry guidance for one `(fault type, subcode)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultTemplate {
    pub code: &'static str,
    pub summary: &'static str,
    pub detail: &'static str,
    pub retry_strategy: RetryStrategy,
}

const fn template(
    code: &'static str,
    summary: &'static str,
    detail: &'static str,
    retry_strategy: RetryStrategy,
) -> FaultTemplate {
    FaultTemplate {
        code,
        summary,
        detail,
        retry_strategy,
    }
}

const UNEXPECTED: FaultTemplate = template(
    "50",
    "Unexpected Exception",
    "An unexpected error occurred while processing the message",
    ContactSupport,
);

const TEMPLATES: &[(FaultCode, FaultTemplate)] = &[
    (
        FaultCode::Security(SecurityCode::SourceAttack),
        template("1", "Source Attack", "The message contains content that is not permitted", CorrectMessage),
    ),
    (
        FaultCode::Security(SecurityCode::MalformedRequest),
        template("2", "Malformed Request", "The message is not a well-formed request for this protocol", CorrectMessage),
    ),
    (
        FaultCode::Security(SecurityCode::CredentialDecryption),
        template("3", "Credential Decryption Failure", "Stored destination credentials could not be decrypted", ContactSupport),
    ),
    (
        FaultCode::Security(SecurityCode::UnauthorizedCaller),
        template("4", "Unauthorized", "The caller is not permitted to perform this operation", CorrectMessage),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::ConnectTimeout),
        template("10", "Connection Timeout", "Timed out connecting to the destination", CheckIisStatus),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::ReadTimeout),
        template("11", "Read Timeout", "Timed out waiting for the destination to respond", CheckIisStatus),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::ConnectionRefused),
        template("12", "Connection Refused", "The destination refused the connection", CheckIisStatus),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::UnknownHost),
        template("13", "Unknown Host", "The destination host name could not be resolved", ContactSupport),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::InvalidUri),
        template("14", "Invalid Destination URI", "The destination URI is malformed or does not use HTTPS", ContactSupport),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::TlsAtGateway),
        template("15", "TLS Failure At Gateway", "The gateway could not establish its TLS configuration", ContactSupport),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::TlsAtDestination),
        template("16", "TLS Failure At Destination", "The TLS handshake with the destination failed", CheckIisStatus),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::ConnectionFailed),
        template("17", "Connection Failed", "The connection to the destination failed", Normal),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::DestinationNotFound),
        template("18", "Destination Not Found", "The requested destination is not configured", CorrectMessage),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::UnderMaintenance),
        template("20", "Destination Under Maintenance", "The destination is in a scheduled maintenance window", CheckIisStatus),
    ),
    (
        FaultCode::DestinationConnection(ConnectionCode::CircuitBreakerThrown),
        template("21", "Circuit Breaker Thrown", "Sends to the destination are suspended after repeated failures", CheckIisStatus),
    ),
    (
        FaultCode::HubClient(HubClientCode::Unclassified),
        template("200", "Unclassified Destination Error", "The destination returned an unexpected HTTP status", ContactSupport),
    ),
    (
        FaultCode::HubClient(HubClientCode::BadRequest),
        template("201", "Bad Request", "The destination rejected the message as invalid (HTTP 400)", CorrectMessage),
    ),
    (
        FaultCode::HubClient(HubClientCode::Unauthorized),
        template("202", "Unauthorized", "The destination rejected the credentials (HTTP 401)", CorrectMessage),
    ),
    (
        FaultCode::HubClient(HubClientCode::Forbidden),
        template("203", "Forbidden", "The destination refused access (HTTP 403)", CorrectMessage),
    ),
    (
        FaultCode::HubClient(HubClientCode::NotFound),
        template("204", "Not Found", "The destination endpoint was not found (HTTP 404)", CheckIisStatus),
    ),
    (
        FaultCode::HubClient(HubClientCode::RequestTimeout),
        template("205", "Request Timeout", "The destination timed out reading the request (HTTP 408)", Normal),
    ),
    (
        FaultCode::HubClient(HubClientCode::InternalServerError),
        template("206", "Internal Server Error", "The destination failed to process the message (HTTP 500)", CheckIisStatus),
    ),
    (
        FaultCode::HubClient(HubClientCode::BadGateway),
        template("207", "Bad Gateway", "A proxy in front of the destination failed (HTTP 502)", CheckIisStatus),
    ),
    (
        FaultCode::HubClient(HubClientCode::ServiceUnavailable),
        template("208", "Service Unavailable", "The destination is unavailable (HTTP 503)", CheckIisStatus),
    ),
    (
        FaultCode::HubClient(HubClientCode::GatewayTimeout),
        template("209", "Gateway Timeout", "A proxy in front of the destination timed out (HTTP 504)", CheckIisStatus),
    ),
    (
        FaultCode::HubClient(HubClientCode::DestinationSecurityFault),
        template("210", "Destination Security Fault", "The destination reported a security fault", CorrectMessage),
    ),
    (
        FaultCode::HubClient(HubClientCode::DestinationMessageTooLarge),
        template("211", "Destination Message Too Large", "The destination reported the message as too large", CorrectMessage),
    ),
    (
        FaultCode::HubClient(HubClientCode::DestinationUnsupportedOperation),
        template("212", "Destination Unsupported Operation", "The destination does not support this operation", ContactSupport),
    ),
    (
        FaultCode::HubClient(HubClientCode::DestinationFault),
        template("213", "Destination Fault", "The destination returned a fault", ContactSupport),
    ),
    (
        FaultCode::HubClient(HubClientCode::DestinationConnectionFault),
        template("214", "Destination Connection Fault", "An upstream hub could not reach its destination", CheckIisStatus),
    ),
    (
        FaultCode::HubClient(HubClientCode::InvalidResponse),
        template("215", "Invalid Response", "The destination response could not be read", ContactSupport),
    ),
    (
        FaultCode::MessageTooLarge(SizeCode::Request),
        template("30", "Request Too Large", "The request exceeds the maximum permitted size", CorrectMessage),
    ),
    (
        FaultCode::MessageTooLarge(SizeCode::Response),
        template("31", "Response Too Large", "The destination response exceeds the maximum permitted size", CorrectMessage),
    ),
    (
        FaultCode::UnsupportedOperation(OperationCode::Operation),
        template("40", "Unsupported Operation", "The requested operation is not supported", ContactSupport),
    ),
    (
        FaultCode::UnsupportedOperation(OperationCode::Dialect),
        template("41", "Unsupported Dialect", "The message is not in a supported dialect for this operation", ContactSupport),
    ),
    (FaultCode::UnexpectedException, UNEXPECTED),
];

/// Fault templates, built once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct FaultRegistry {
    templates: HashMap<FaultCode, FaultTemplate>,
}

impl FaultRegistry {
    /// The standard template table.
    pub fn standard() -> Self {
        Self {
            templates: TEMPLATES.iter().copied().collect(),
        }
    }

    pub fn template(&self, code: FaultCode) -> &FaultTemplate {
        self.templates.get(&code).unwrap_or(&UNEXPECTED)
    }

    /// Build a fault from its template.
    pub fn fault(&self, code: FaultCode) -> Fault {
        Fault::from_template(code, self.template(code))
    }

    pub fn security(&self, code: SecurityCode) -> Fault {
        self.fault(FaultCode::Security(code))
    }

    pub fn connection(&self, code: ConnectionCode) -> Fault {
        self.fault(FaultCode::DestinationConnection(code))
    }

    pub fn hub_client(&self, code: HubClientCode) -> Fault {
        self.fault(FaultCode::HubClient(code))
    }

    /// Wrap an error nothing else classifies.
    pub fn unexpected(&self, cause: &dyn std::error::Error) -> Fault {
        self.fault(FaultCode::UnexpectedException)
            .with_diagnostics(cause.to_string())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Default for FaultRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_code_is_unique_per_type() {
        let registry = FaultRegistry::standard();
        assert_eq!(registry.len(), TEMPLATES.len());

        let mut seen = HashSet::new();
        for (code, template) in TEMPLATES {
            assert!(
                seen.insert((code.fault_type(), template.code)),
                "duplicate code {} for {:?}",
                template.code,
                code.fault_type()
            );
        }
    }

    #[test]
    fn test_fault_from_template() {
        let registry = FaultRegistry::standard();
        let fault = registry.connection(ConnectionCode::ReadTimeout);
        assert_eq!(fault.code(), "11");
        assert_eq!(fault.fault_name(), "DestinationConnectionFault");
        assert_eq!(fault.summary(), "Read Timeout");
        assert_eq!(fault.retry_strategy(), RetryStrategy::CheckIisStatus);
    }

    #[test]
    fn test_display() {
        let registry = FaultRegistry::standard();
        let fault = registry.hub_client(HubClientCode::Unauthorized);
        assert_eq!(fault.to_string(), "HubClientFault 202: Unauthorized");
    }

    #[test]
    fn test_unexpected_keeps_cause() {
        let registry = FaultRegistry::standard();
        let err = std::io::Error::other("disk on fire");
        let fault = registry.unexpected(&err);
        assert_eq!(fault.code(), "50");
        assert_eq!(fault.diagnostics(), Some("disk on fire"));
    }
}
