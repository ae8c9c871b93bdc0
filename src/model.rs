//! Dialect-neutral message model.
//!
//! Every wire message, whichever of the three SOAP dialects it arrived in,
//! is decoded into a [`MessageModel`]. The body is a closed set of message
//! kinds; dialect membership is derived from the schema and the Hub header.

use crate::destination::CredentialError;
use crate::fault::RetryStrategy;
use crate::secret::SealedSecret;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace of the 2011 IIS dialect.
pub const IIS_2011_NS: &str = "urn:cdc:iisb:2011";
/// Namespace of the 2014 IIS dialect.
pub const IIS_2014_NS: &str = "urn:cdc:iisb:2014";
/// Namespace of the harmonized Hub dialect.
pub const HUB_NS: &str = "urn:cdc:iisb:hub:2014";

/// Wire schema a message is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Schema {
    /// 2011 IIS schema
    #[serde(rename = "2011")]
    Iis2011,
    /// 2014 IIS schema
    #[serde(rename = "2014")]
    Iis2014,
    /// Hub schema
    #[serde(rename = "hub")]
    Hub,
}

impl Schema {
    /// Namespace URI for this schema.
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::Iis2011 => IIS_2011_NS,
            Self::Iis2014 => IIS_2014_NS,
            Self::Hub => HUB_NS,
        }
    }

    /// Resolve a schema from its namespace URI.
    pub fn from_namespace(ns: &str) -> Option<Self> {
        match ns {
            IIS_2011_NS => Some(Self::Iis2011),
            IIS_2014_NS => Some(Self::Iis2014),
            HUB_NS => Some(Self::Hub),
            _ => None,
        }
    }

    /// Dialect whose element names this schema uses.
    pub const fn naming_dialect(self) -> Dialect {
        match self {
            Self::Iis2011 => Dialect::Iis2011,
            Self::Iis2014 => Dialect::Iis2014,
            Self::Hub => Dialect::Hub,
        }
    }

    /// Resolve a schema from a destination version string.
    pub fn from_version(version: &str) -> Option<Self> {
        match version.trim().to_ascii_lowercase().as_str() {
            "2011" => Some(Self::Iis2011),
            "2014" => Some(Self::Iis2014),
            "hub" | "hub2014" => Some(Self::Hub),
            _ => None,
        }
    }
}

/// Dialect a message is written in. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// 2011 IIS dialect
    Iis2011,
    /// 2014 IIS dialect
    Iis2014,
    /// Hub dialect
    Hub,
}

impl Dialect {
    /// Short label used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iis2011 => "2011",
            Self::Iis2014 => "2014",
            Self::Hub => "hub",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hub routing header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubHeader {
    /// Destination identifier
    pub destination_id: Option<String>,
    /// Destination endpoint URI
    pub destination_uri: Option<String>,
}

impl HubHeader {
    /// Header naming a destination.
    pub fn for_destination(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            destination_id: Some(id.into()),
            destination_uri: Some(uri.into()),
        }
    }

    /// True when neither field carries a value.
    pub fn is_empty(&self) -> bool {
        is_blank(&self.destination_id) && is_blank(&self.destination_uri)
    }
}

/// WS-Addressing headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsaHeaders {
    pub message_id: Option<String>,
    pub relates_to: Option<String>,
    pub action: Option<String>,
    pub to: Option<String>,
    pub from: Option<String>,
}

/// Submitter credentials carried on a request, sealed while in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<SealedSecret>,
    pub password: Option<SealedSecret>,
}

impl Credentials {
    pub fn seal(
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            username: username.map(SealedSecret::seal).transpose()?,
            password: password.map(SealedSecret::seal).transpose()?,
        })
    }

    pub fn username(&self) -> Result<Option<String>, CredentialError> {
        self.username.as_ref().map(SealedSecret::reveal).transpose()
    }

    pub fn password(&self) -> Result<Option<String>, CredentialError> {
        self.password.as_ref().map(SealedSecret::reveal).transpose()
    }
}

/// Submit a single HL7 message to a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitSingleMessageRequest {
    pub credentials: Credentials,
    pub facility_id: Option<String>,
    pub hl7_message: Option<String>,
    /// Payload arrived inside a CDATA section
    pub cdata_wrapped: bool,
}

/// Registry answer to a submitted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitSingleMessageResponse {
    pub hl7_message: Option<String>,
    /// Payload arrived inside a CDATA section
    pub cdata_wrapped: bool,
}

/// Connectivity test request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityTestRequest {
    pub echo_back: Option<String>,
}

/// Connectivity test response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityTestResponse {
    pub echo_back: Option<String>,
}

/// A fault as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultMessage {
    /// Fault element name, e.g. `SecurityFault`
    pub fault_name: String,
    pub code: Option<String>,
    /// SOAP-level reason text
    pub reason: Option<String>,
    pub summary: Option<String>,
    pub detail: Option<String>,
    pub diagnostics: Option<String>,
    pub retry_strategy: Option<RetryStrategy>,
    pub event_id: Option<String>,
    /// Upstream content, PHI-masked before it is stored here
    pub original_body: Option<String>,
    /// Destination block of a Hub fault
    pub destination: HubHeader,
}

/// Message body, one variant per message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    SubmitSingleMessageRequest(SubmitSingleMessageRequest),
    SubmitSingleMessageResponse(SubmitSingleMessageResponse),
    ConnectivityTestRequest(ConnectivityTestRequest),
    ConnectivityTestResponse(ConnectivityTestResponse),
    Fault(FaultMessage),
    /// Content outside the protocol's element set (or a captured HTML page)
    Generic,
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SubmitSingleMessageRequest(_) => MessageKind::SubmitSingleMessageRequest,
            Self::SubmitSingleMessageResponse(_) => MessageKind::SubmitSingleMessageResponse,
            Self::ConnectivityTestRequest(_) => MessageKind::ConnectivityTestRequest,
            Self::ConnectivityTestResponse(_) => MessageKind::ConnectivityTestResponse,
            Self::Fault(_) => MessageKind::Fault,
            Self::Generic => MessageKind::Generic,
        }
    }

    /// Empty body of the given kind.
    pub fn empty(kind: MessageKind) -> Self {
        match kind {
            MessageKind::SubmitSingleMessageRequest => {
                Self::SubmitSingleMessageRequest(SubmitSingleMessageRequest::default())
            }
            MessageKind::SubmitSingleMessageResponse => {
                Self::SubmitSingleMessageResponse(SubmitSingleMessageResponse::default())
            }
            MessageKind::ConnectivityTestRequest => {
                Self::ConnectivityTestRequest(ConnectivityTestRequest::default())
            }
            MessageKind::ConnectivityTestResponse => {
                Self::ConnectivityTestResponse(ConnectivityTestResponse::default())
            }
            MessageKind::Fault => Self::Fault(FaultMessage::default()),
            MessageKind::Generic => Self::Generic,
        }
    }
}

/// Discriminant of [`MessageBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SubmitSingleMessageRequest,
    SubmitSingleMessageResponse,
    ConnectivityTestRequest,
    ConnectivityTestResponse,
    Fault,
    Generic,
}

impl MessageKind {
    /// Canonical (2014/Hub) element name of the body element.
    pub const fn canonical_name(self) -> &'static str {
        match self {
            Self::SubmitSingleMessageRequest => "SubmitSingleMessageRequest",
            Self::SubmitSingleMessageResponse => "SubmitSingleMessageResponse",
            Self::ConnectivityTestRequest => "ConnectivityTestRequest",
            Self::ConnectivityTestResponse => "ConnectivityTestResponse",
            Self::Fault => "Fault",
            Self::Generic => "Generic",
        }
    }

    /// True for kinds a submitter sends.
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            Self::SubmitSingleMessageRequest | Self::ConnectivityTestRequest
        )
    }

    /// True for kinds a registry answers with (faults excluded).
    pub const fn is_response(self) -> bool {
        matches!(
            self,
            Self::SubmitSingleMessageResponse | Self::ConnectivityTestResponse
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name())
    }
}

/// A decoded message in any dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageModel {
    pub schema: Schema,
    pub hub_header: HubHeader,
    pub wsa: WsaHeaders,
    pub body: MessageBody,
}

impl MessageModel {
    /// New message with empty headers.
    pub fn new(schema: Schema, body: MessageBody) -> Self {
        Self {
            schema,
            hub_header: HubHeader::default(),
            wsa: WsaHeaders::default(),
            body,
        }
    }

    /// Fault reply addressed back to `request`, in the request's dialect.
    pub fn fault_reply(request: &Self, fault: FaultMessage) -> Self {
        let mut reply = Self::new(request.schema, MessageBody::Fault(fault));
        reply.hub_header = request.hub_header.clone();
        reply.wsa.relates_to = request.wsa.message_id.clone();
        reply.wsa.action = Some(reply.derive_action());
        reply
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Dialect membership: a pure function of `schema` and the Hub header.
    pub fn dialect(&self) -> Dialect {
        match self.schema {
            Schema::Iis2011 => Dialect::Iis2011,
            Schema::Hub => Dialect::Hub,
            Schema::Iis2014 if self.hub_header.is_empty() => Dialect::Iis2014,
            Schema::Iis2014 => Dialect::Hub,
        }
    }

    pub fn is_2011(&self) -> bool {
        self.dialect() == Dialect::Iis2011
    }

    pub fn is_2014(&self) -> bool {
        self.dialect() == Dialect::Iis2014
    }

    pub fn is_hub(&self) -> bool {
        self.dialect() == Dialect::Hub
    }

    /// HL7 payload of a submit request or response.
    pub fn hl7_message(&self) -> Option<&str> {
        match &self.body {
            MessageBody::SubmitSingleMessageRequest(r) => r.hl7_message.as_deref(),
            MessageBody::SubmitSingleMessageResponse(r) => r.hl7_message.as_deref(),
            _ => None,
        }
    }

    pub fn fault(&self) -> Option<&FaultMessage> {
        match &self.body {
            MessageBody::Fault(f) => Some(f),
            _ => None,
        }
    }

    /// WS-Addressing action for this message's kind and dialect.
    pub fn derive_action(&self) -> String {
        let fault_name = self.fault().map(|f| f.fault_name.as_str());
        action_for(self.kind(), self.dialect(), fault_name)
    }
}

/// WS-Addressing action URI for a message kind in a dialect.
pub fn action_for(kind: MessageKind, dialect: Dialect, fault_name: Option<&str>) -> String {
    let base = match dialect {
        Dialect::Iis2011 => IIS_2011_NS.to_string(),
        Dialect::Iis2014 => format!("{IIS_2014_NS}:IISPortType"),
        Dialect::Hub => format!("{HUB_NS}:IISHubPortType"),
    };
    match kind {
        MessageKind::Fault => {
            let name = fault_name.filter(|n| !n.is_empty()).unwrap_or("UnknownFault");
            format!("{base}:Fault:{name}")
        }
        MessageKind::Generic => base,
        _ => {
            let name = match dialect {
                Dialect::Iis2011 => crate::writer::element_name(kind.canonical_name(), dialect),
                _ => kind.canonical_name().into(),
            };
            format!("{base}:{name}")
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
