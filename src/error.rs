//! Error types for the gateway.

use crate::destination::CredentialError;
use crate::fault::{FaultCode, OperationCode, SecurityCode, SizeCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Infrastructure errors outside the protocol fault taxonomy.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("XML write error: {0}")]
    XmlWrite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

/// Rule a parsed document broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationCode {
    /// Invalid XML syntax or encoding
    InvalidXml,
    /// Root element is not a SOAP envelope
    MissingEnvelope,
    /// Element name containing "script"
    ScriptElement,
    /// Attribute or text value containing "javascript"
    ScriptContent,
    /// DOCTYPE declaration (XXE)
    DoctypeDetected,
    /// Processing instruction
    ProcessingInstructionDetected,
    /// A field was supplied twice
    DuplicateElement,
    /// An element appeared where it is not allowed
    UnexpectedElement,
    /// Nesting depth exceeded
    DepthExceeded,
    /// Too many elements
    TooManyElements,
    /// Input larger than the configured maximum
    BodyTooLarge,
    /// Operation element not known in its dialect
    UnsupportedOperation,
    /// Elements from different dialects mixed in one message
    UnsupportedDialect,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidXml => "INVALID_XML",
            Self::MissingEnvelope => "MISSING_ENVELOPE",
            Self::ScriptElement => "SCRIPT_ELEMENT",
            Self::ScriptContent => "SCRIPT_CONTENT",
            Self::DoctypeDetected => "DOCTYPE_DETECTED",
            Self::ProcessingInstructionDetected => "PROCESSING_INSTRUCTION_DETECTED",
            Self::DuplicateElement => "DUPLICATE_ELEMENT",
            Self::UnexpectedElement => "UNEXPECTED_ELEMENT",
            Self::DepthExceeded => "DEPTH_EXCEEDED",
            Self::TooManyElements => "TOO_MANY_ELEMENTS",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            Self::UnsupportedDialect => "UNSUPPORTED_DIALECT",
        }
    }

    /// Structural XML problems, as opposed to hostile or oversized content.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidXml
                | Self::MissingEnvelope
                | Self::DuplicateElement
                | Self::UnexpectedElement
                | Self::DepthExceeded
        )
    }

    /// Fault this violation is reported as.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            Self::ScriptElement
            | Self::ScriptContent
            | Self::DoctypeDetected
            | Self::ProcessingInstructionDetected => FaultCode::Security(SecurityCode::SourceAttack),
            Self::InvalidXml
            | Self::MissingEnvelope
            | Self::DuplicateElement
            | Self::UnexpectedElement
            | Self::DepthExceeded => FaultCode::Security(SecurityCode::MalformedRequest),
            Self::TooManyElements | Self::BodyTooLarge => FaultCode::MessageTooLarge(SizeCode::Request),
            Self::UnsupportedOperation => FaultCode::UnsupportedOperation(OperationCode::Operation),
            Self::UnsupportedDialect => FaultCode::UnsupportedOperation(OperationCode::Dialect),
        }
    }
}

/// A rule violation detected while reading a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Violation code
    pub code: ViolationCode,
    /// Human-readable message
    pub message: String,
    /// Element path (if available)
    pub location: Option<String>,
}

impl Violation {
    /// Create a new violation.
    pub fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: None,
        }
    }

    /// Create a violation with location.
    pub fn with_location(code: ViolationCode, message: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: Some(location.into()),
        }
    }

    /// Diagnostics line: `[CODE] message at /path`.
    pub fn diagnostics(&self) -> String {
        match &self.location {
            Some(path) => format!("[{}] {} at {}", self.code.as_str(), self.message, path),
            None => format!("[{}] {}", self.code.as_str(), self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_code_as_str() {
        assert_eq!(ViolationCode::InvalidXml.as_str(), "INVALID_XML");
        assert_eq!(ViolationCode::DoctypeDetected.as_str(), "DOCTYPE_DETECTED");
    }

    #[test]
    fn test_hostile_content_is_source_attack() {
        for code in [
            ViolationCode::ScriptElement,
            ViolationCode::ScriptContent,
            ViolationCode::DoctypeDetected,
        ] {
            assert_eq!(code.fault_code(), FaultCode::Security(SecurityCode::SourceAttack));
        }
        assert_eq!(
            ViolationCode::DuplicateElement.fault_code(),
            FaultCode::Security(SecurityCode::MalformedRequest)
        );
    }

    #[test]
    fn test_structural_codes() {
        assert!(ViolationCode::DuplicateElement.is_structural());
        assert!(!ViolationCode::ScriptElement.is_structural());
        assert_eq!(
            ViolationCode::UnsupportedDialect.fault_code(),
            FaultCode::UnsupportedOperation(OperationCode::Dialect)
        );
    }

    #[test]
    fn test_diagnostics_include_location() {
        let v = Violation::with_location(
            ViolationCode::ScriptElement,
            "Element name not permitted",
            "/Envelope/Body/script",
        );
        assert_eq!(
            v.diagnostics(),
            "[SCRIPT_ELEMENT] Element name not permitted at /Envelope/Body/script"
        );
    }
}
