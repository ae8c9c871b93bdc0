//! Streaming SOAP reader.
//!
//! Decodes a SOAP 1.2 document in any of the three dialects into a
//! [`MessageModel`] in one forward pass over `quick_xml` events. Every
//! element, attribute and text node is validated as it streams by, and the
//! first violation aborts the read: no partial model is ever returned.
//!
//! quick-xml never expands entities; DOCTYPE declarations other than a bare
//! HTML doctype are rejected outright.

use crate::error::{Violation, ViolationCode};
use crate::fault::{Fault, FaultRegistry, RetryStrategy};
use crate::model::{
    FaultMessage, HubHeader, MessageBody, MessageKind, MessageModel, Schema, WsaHeaders,
};
use crate::secret::SealedSecret;
use crate::validator::{ContentValidator, ReaderLimits};
use crate::writer::{element_name, RESPONSE_PAYLOAD_2011};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// SOAP 1.2 envelope namespace.
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
/// WS-Addressing namespace.
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";
/// Namespace of the fault metadata block.
pub const FAULT_META_NS: &str = "urn:cdc:iisb:hub:fault:2014";

/// Resolved element namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Ns {
    Soap,
    Wsa,
    FaultMeta,
    Dialect(Schema),
    /// Unqualified
    None,
    Other,
}

impl Ns {
    fn from_uri(uri: &[u8]) -> Self {
        match std::str::from_utf8(uri) {
            Ok(SOAP_12_NS) => Self::Soap,
            Ok(WSA_NS) => Self::Wsa,
            Ok(FAULT_META_NS) => Self::FaultMeta,
            Ok(other) => Schema::from_namespace(other).map_or(Self::Other, Self::Dialect),
            Err(_) => Self::Other,
        }
    }
}

/// What an open element means to the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Role {
    Envelope,
    Header,
    Body,
    HubHeader,
    WsaFrom,
    Operation,
    Fault,
    FaultCode,
    FaultReason,
    FaultDetail,
    FaultBlock,
    Metadata,
    Leaf(Leaf),
    /// Validated but otherwise ignored subtree
    Skip,
}

/// Text-only element whose content lands in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Leaf {
    MessageId,
    RelatesTo,
    Action,
    To,
    FromAddress,
    DestinationId,
    DestinationUri,
    Username,
    Password,
    FacilityId,
    Hl7Message,
    EchoBack,
    FaultValue,
    FaultReasonText,
    FaultCode,
    FaultDestinationId,
    FaultDestinationUri,
    EventId,
    Summary,
    Detail,
    Diagnostics,
    Retry,
    Original,
}

impl Leaf {
    fn is_sensitive(self) -> bool {
        matches!(self, Self::Username | Self::Password)
    }

    /// Identifier-like values are trimmed; payloads are kept verbatim.
    fn is_trimmed(self) -> bool {
        matches!(
            self,
            Self::MessageId
                | Self::RelatesTo
                | Self::Action
                | Self::To
                | Self::FromAddress
                | Self::DestinationId
                | Self::DestinationUri
                | Self::FacilityId
                | Self::FaultValue
                | Self::FaultCode
                | Self::FaultDestinationId
                | Self::FaultDestinationUri
                | Self::EventId
                | Self::Retry
        )
    }
}

/// Field elements of each body kind, by canonical name.
fn body_fields(kind: MessageKind) -> &'static [(&'static str, Leaf)] {
    match kind {
        MessageKind::SubmitSingleMessageRequest => &[
            ("Username", Leaf::Username),
            ("Password", Leaf::Password),
            ("FacilityID", Leaf::FacilityId),
            ("Hl7Message", Leaf::Hl7Message),
        ],
        MessageKind::SubmitSingleMessageResponse => &[("Hl7Message", Leaf::Hl7Message)],
        MessageKind::ConnectivityTestRequest | MessageKind::ConnectivityTestResponse => {
            &[("EchoBack", Leaf::EchoBack)]
        }
        MessageKind::Fault | MessageKind::Generic => &[],
    }
}

const SCHEMAS: [Schema; 3] = [Schema::Iis2011, Schema::Iis2014, Schema::Hub];

const OPERATIONS: [MessageKind; 4] = [
    MessageKind::SubmitSingleMessageRequest,
    MessageKind::SubmitSingleMessageResponse,
    MessageKind::ConnectivityTestRequest,
    MessageKind::ConnectivityTestResponse,
];

/// Operation element local names per schema.
static OPERATION_NAMES: LazyLock<HashMap<Schema, HashMap<String, MessageKind>>> =
    LazyLock::new(|| {
        SCHEMAS
            .into_iter()
            .map(|schema| {
                let names = OPERATIONS
                    .into_iter()
                    .map(|kind| (element_name(kind.canonical_name(), schema.naming_dialect()), kind))
                    .collect();
                (schema, names)
            })
            .collect()
    });

/// Field element local names per operation and schema. A 2011 response
/// payload also answers to the fixed `return` name.
static FIELD_NAMES: LazyLock<HashMap<(MessageKind, Schema), HashMap<String, Leaf>>> =
    LazyLock::new(|| {
        let mut table = HashMap::new();
        for kind in OPERATIONS {
            for schema in SCHEMAS {
                let mut fields: HashMap<String, Leaf> = body_fields(kind)
                    .iter()
                    .map(|(name, leaf)| (element_name(name, schema.naming_dialect()), *leaf))
                    .collect();
                if schema == Schema::Iis2011 && kind.is_response() {
                    if let Some((_, leaf)) = body_fields(kind).first() {
                        fields.insert(RESPONSE_PAYLOAD_2011.to_string(), *leaf);
                    }
                }
                table.insert((kind, schema), fields);
            }
        }
        table
    });

/// Fixed child elements of each structural role, keyed by parent role and
/// namespace. Roles with side effects (envelope order, operations, fields,
/// fault blocks) are classified by `ReadState` itself.
static STRUCTURE: LazyLock<HashMap<(Role, Ns), HashMap<&'static str, Role>>> =
    LazyLock::new(|| {
        let hub = Ns::Dialect(Schema::Hub);
        let mut entries = vec![
            (Role::Envelope, Ns::Soap, "Header", Role::Header),
            (Role::Envelope, Ns::Soap, "Body", Role::Body),
            (Role::Header, Ns::Wsa, "MessageID", Role::Leaf(Leaf::MessageId)),
            (Role::Header, Ns::Wsa, "RelatesTo", Role::Leaf(Leaf::RelatesTo)),
            (Role::Header, Ns::Wsa, "Action", Role::Leaf(Leaf::Action)),
            (Role::Header, Ns::Wsa, "To", Role::Leaf(Leaf::To)),
            (Role::Header, Ns::Wsa, "From", Role::WsaFrom),
            (Role::Header, hub, "HubRequestHeader", Role::HubHeader),
            (Role::Header, hub, "HubResponseHeader", Role::HubHeader),
            (Role::WsaFrom, Ns::Wsa, "Address", Role::Leaf(Leaf::FromAddress)),
            (Role::Fault, Ns::Soap, "Code", Role::FaultCode),
            (Role::Fault, Ns::Soap, "Reason", Role::FaultReason),
            (Role::Fault, Ns::Soap, "Detail", Role::FaultDetail),
            (Role::Fault, Ns::None, "Detail", Role::FaultDetail),
            // 2011 flat fault layout
            (Role::Fault, Ns::None, "Code", Role::Leaf(Leaf::FaultCode)),
            (Role::Fault, Ns::None, "Reason", Role::Leaf(Leaf::FaultReasonText)),
            (Role::FaultCode, Ns::Soap, "Value", Role::Leaf(Leaf::FaultValue)),
            (Role::FaultReason, Ns::Soap, "Text", Role::Leaf(Leaf::FaultReasonText)),
            (Role::FaultBlock, Ns::None, "Code", Role::Leaf(Leaf::FaultCode)),
            (Role::FaultBlock, Ns::None, "DestinationId", Role::Leaf(Leaf::FaultDestinationId)),
            (Role::FaultBlock, Ns::None, "DestinationUri", Role::Leaf(Leaf::FaultDestinationUri)),
        ];
        for ns in [hub, Ns::None] {
            entries.push((Role::HubHeader, ns, "DestinationId", Role::Leaf(Leaf::DestinationId)));
            entries.push((Role::HubHeader, ns, "DestinationUri", Role::Leaf(Leaf::DestinationUri)));
        }
        for ns in [Ns::FaultMeta, Ns::None] {
            for (local, leaf) in [
                ("EventID", Leaf::EventId),
                ("Summary", Leaf::Summary),
                ("Detail", Leaf::Detail),
                ("Diagnostics", Leaf::Diagnostics),
                ("Retry", Leaf::Retry),
                ("Original", Leaf::Original),
            ] {
                entries.push((Role::Metadata, ns, local, Role::Leaf(leaf)));
            }
        }

        let mut table: HashMap<(Role, Ns), HashMap<&'static str, Role>> = HashMap::new();
        for (parent, ns, local, role) in entries {
            table.entry((parent, ns)).or_default().insert(local, role);
        }
        table
    });

fn operation_kind(schema: Schema, local: &str) -> Option<MessageKind> {
    OPERATION_NAMES
        .get(&schema)
        .and_then(|names| names.get(local))
        .copied()
}

fn field_leaf(kind: MessageKind, schema: Schema, local: &str) -> Option<Leaf> {
    FIELD_NAMES
        .get(&(kind, schema))
        .and_then(|fields| fields.get(local))
        .copied()
}

fn structural(parent: Role, ns: Ns, local: &str) -> Option<Role> {
    // Fault block children are matched by local name alone.
    let ns = if parent == Role::FaultBlock { Ns::None } else { ns };
    STRUCTURE
        .get(&(parent, ns))
        .and_then(|names| names.get(local))
        .copied()
}

/// Fault element names are canonically upper-camel.
fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn xml_error(err: impl std::fmt::Display) -> Violation {
    Violation::new(ViolationCode::InvalidXml, format!("XML parse error: {err}"))
}

fn resolve(result: &ResolveResult<'_>) -> Result<Ns, Violation> {
    match result {
        ResolveResult::Bound(ns) => Ok(Ns::from_uri(ns.as_ref())),
        ResolveResult::Unbound => Ok(Ns::None),
        ResolveResult::Unknown(prefix) => Err(Violation::new(
            ViolationCode::InvalidXml,
            format!(
                "Undeclared namespace prefix '{}'",
                String::from_utf8_lossy(prefix)
            ),
        )),
    }
}

/// Store a value, rejecting a second non-empty occurrence.
fn set_once(slot: &mut Option<String>, value: String, path: &str) -> Result<(), Violation> {
    if slot.as_deref().is_some_and(|v| !v.is_empty()) {
        return Err(Violation::with_location(
            ViolationCode::DuplicateElement,
            "Field supplied more than once",
            path,
        ));
    }
    *slot = Some(value);
    Ok(())
}

/// Seal a credential value, rejecting a second non-blank occurrence.
fn set_sealed(slot: &mut Option<SealedSecret>, value: String, path: &str) -> Result<(), Violation> {
    if slot.as_ref().is_some_and(|v| !v.is_blank()) {
        return Err(Violation::with_location(
            ViolationCode::DuplicateElement,
            "Field supplied more than once",
            path,
        ));
    }
    let sealed = SealedSecret::seal(value).map_err(|e| {
        Violation::with_location(
            ViolationCode::InvalidXml,
            format!("Credential could not be sealed: {e}"),
            path,
        )
    })?;
    *slot = Some(sealed);
    Ok(())
}

#[derive(Debug)]
struct Frame {
    role: Role,
    local: String,
    /// Byte offset just past the start tag
    content_start: usize,
    cdata: bool,
}

/// Result of a successful read.
struct ReadOutput {
    model: MessageModel,
    redactions: Vec<Range<usize>>,
    html: bool,
}

/// Single-document read state.
struct ReadState<'a> {
    reader: NsReader<&'a [u8]>,
    validator: ContentValidator,
    stack: Vec<Frame>,
    text: String,
    redactions: Vec<Range<usize>>,
    html: bool,
    seen_envelope: bool,
    seen_header: bool,
    seen_body: bool,
    fault_block_seen: bool,
    schema: Option<Schema>,
    body: Option<MessageBody>,
    hub_header: HubHeader,
    wsa: WsaHeaders,
}

impl<'a> ReadState<'a> {
    fn new(xml: &'a str, validator: ContentValidator) -> Self {
        let mut reader = NsReader::from_str(xml);
        reader.config_mut().trim_text(false);
        Self {
            reader,
            validator,
            stack: Vec::new(),
            text: String::new(),
            redactions: Vec::new(),
            html: false,
            seen_envelope: false,
            seen_header: false,
            seen_body: false,
            fault_block_seen: false,
            schema: None,
            body: None,
            hub_header: HubHeader::default(),
            wsa: WsaHeaders::default(),
        }
    }

    fn position(&self) -> usize {
        usize::try_from(self.reader.buffer_position()).unwrap_or(usize::MAX)
    }

    fn path(&self) -> String {
        let mut path = String::new();
        for frame in &self.stack {
            path.push('/');
            path.push_str(&frame.local);
        }
        path
    }

    fn path_with(&self, local: &str) -> String {
        format!("{}/{}", self.path(), local)
    }

    fn run(&mut self) -> Result<(), Violation> {
        loop {
            let before = self.position();
            let (resolved, event) = self.reader.read_resolved_event().map_err(xml_error)?;
            let ns = resolve(&resolved)?;

            match event {
                Event::Start(e) => {
                    self.open(ns, &e)?;
                    if self.html {
                        return Ok(());
                    }
                }
                Event::Empty(e) => {
                    self.open(ns, &e)?;
                    if self.html {
                        return Ok(());
                    }
                    let end = self.position();
                    self.close(end)?;
                }
                Event::End(_) => self.close(before)?,
                Event::Text(t) => {
                    let text = t.unescape().map_err(xml_error)?;
                    self.content(&text, false)?;
                }
                Event::CData(c) => {
                    let bytes = c.into_inner();
                    let text = std::str::from_utf8(&bytes).map_err(xml_error)?;
                    self.content(text, true)?;
                }
                Event::DocType(d) => {
                    let content = String::from_utf8_lossy(&d);
                    self.validator.check_doctype(&content)?;
                }
                Event::PI(_) => {
                    let path = self.path();
                    self.validator.check_processing_instruction(&path)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }
        self.check_text()?;

        if !self.stack.is_empty() {
            return Err(Violation::with_location(
                ViolationCode::InvalidXml,
                "Document ended inside an open element",
                self.path(),
            ));
        }
        if !self.seen_envelope {
            return Err(Violation::new(
                ViolationCode::MissingEnvelope,
                "Document has no root element",
            ));
        }
        if !self.seen_body {
            return Err(Violation::new(
                ViolationCode::MissingEnvelope,
                "Envelope has no Body",
            ));
        }
        Ok(())
    }

    fn open(&mut self, ns: Ns, e: &BytesStart<'_>) -> Result<(), Violation> {
        let local = std::str::from_utf8(e.local_name().as_ref())
            .map_err(xml_error)?
            .to_string();

        if self.stack.is_empty() && local.eq_ignore_ascii_case("html") {
            self.validator.suppress();
            self.html = true;
            return Ok(());
        }

        self.check_text()?;
        self.text.clear();

        let path = self.path_with(&local);
        self.validator
            .check_element(&local, self.stack.len() + 1, &path)?;
        for attr in e.attributes() {
            let attr = attr.map_err(|err| {
                Violation::with_location(
                    ViolationCode::InvalidXml,
                    format!("Invalid attribute: {err}"),
                    &path,
                )
            })?;
            let value = attr.unescape_value().map_err(xml_error)?;
            self.validator.check_value(&value, &path)?;
        }

        let role = self.classify(ns, &local, &path)?;
        self.stack.push(Frame {
            role,
            local,
            content_start: self.position(),
            cdata: false,
        });
        Ok(())
    }

    fn close(&mut self, end: usize) -> Result<(), Violation> {
        let path = self.path();
        let Some(frame) = self.stack.pop() else {
            return Err(Violation::new(
                ViolationCode::InvalidXml,
                "Closing tag without a matching start",
            ));
        };
        self.validator.check_value(&self.text, &path)?;
        if let Role::Leaf(leaf) = frame.role {
            if leaf.is_sensitive() && end > frame.content_start {
                self.redactions.push(frame.content_start..end);
            }
            let raw = std::mem::take(&mut self.text);
            let value = if leaf.is_trimmed() {
                raw.trim().to_string()
            } else {
                raw
            };
            self.assign(leaf, value, frame.cdata, &path)?;
        } else {
            self.text.clear();
        }
        Ok(())
    }

    /// Character data is validated as one run between tag boundaries, so a
    /// comment or CDATA section cannot split a forbidden value in two.
    fn content(&mut self, text: &str, cdata: bool) -> Result<(), Violation> {
        self.text.push_str(text);
        if let Some(frame) = self.stack.last_mut() {
            frame.cdata |= cdata;
        }
        Ok(())
    }

    fn check_text(&mut self) -> Result<(), Violation> {
        if !self.text.is_empty() {
            let path = self.path();
            self.validator.check_value(&self.text, &path)?;
        }
        Ok(())
    }

    fn classify(&mut self, ns: Ns, local: &str, path: &str) -> Result<Role, Violation> {
        let unexpected = || {
            Violation::with_location(
                ViolationCode::UnexpectedElement,
                format!("Unexpected element '{local}'"),
                path,
            )
        };

        let Some(parent) = self.stack.last().map(|f| f.role) else {
            if ns == Ns::Soap && local == "Envelope" {
                self.seen_envelope = true;
                return Ok(Role::Envelope);
            }
            return Err(Violation::with_location(
                ViolationCode::MissingEnvelope,
                "Root element is not a SOAP 1.2 Envelope",
                path,
            ));
        };

        let role = match parent {
            Role::Envelope => match structural(parent, ns, local) {
                Some(Role::Header) if !self.seen_header && !self.seen_body => {
                    self.seen_header = true;
                    Role::Header
                }
                Some(Role::Body) if !self.seen_body => {
                    self.seen_body = true;
                    Role::Body
                }
                _ => return Err(unexpected()),
            },
            Role::Body => self.classify_operation(ns, local, path)?,
            Role::Operation => self.classify_field(ns, local, path)?,
            Role::FaultDetail => self.classify_fault_block(ns, local),
            Role::Skip => Role::Skip,
            Role::Leaf(_) => {
                return Err(Violation::with_location(
                    ViolationCode::UnexpectedElement,
                    format!("Element '{local}' nested in a text field"),
                    path,
                ))
            }
            Role::Header
            | Role::WsaFrom
            | Role::HubHeader
            | Role::Fault
            | Role::FaultCode
            | Role::FaultReason
            | Role::FaultBlock
            | Role::Metadata => structural(parent, ns, local).unwrap_or(Role::Skip),
        };
        Ok(role)
    }

    fn classify_operation(&mut self, ns: Ns, local: &str, path: &str) -> Result<Role, Violation> {
        match &self.body {
            Some(MessageBody::Generic) => return Ok(Role::Skip),
            Some(_) => {
                return Err(Violation::with_location(
                    ViolationCode::DuplicateElement,
                    "Body carries more than one operation element",
                    path,
                ))
            }
            None => {}
        }

        match ns {
            Ns::Soap if local == "Fault" => {
                self.body = Some(MessageBody::Fault(FaultMessage::default()));
                Ok(Role::Fault)
            }
            Ns::Dialect(schema) => {
                let kind = operation_kind(schema, local).ok_or_else(|| {
                    Violation::with_location(
                        ViolationCode::UnsupportedOperation,
                        format!(
                            "Operation '{local}' is not supported in the {} dialect",
                            schema.naming_dialect()
                        ),
                        path,
                    )
                })?;
                self.schema = Some(schema);
                self.body = Some(MessageBody::empty(kind));
                Ok(Role::Operation)
            }
            _ => {
                self.body = Some(MessageBody::Generic);
                Ok(Role::Skip)
            }
        }
    }

    fn classify_field(&mut self, ns: Ns, local: &str, path: &str) -> Result<Role, Violation> {
        let schema = self.schema.unwrap_or(Schema::Iis2014);
        match ns {
            Ns::None => {}
            Ns::Dialect(s) if s == schema => {}
            Ns::Dialect(_) => {
                return Err(Violation::with_location(
                    ViolationCode::UnsupportedDialect,
                    format!("Element '{local}' is not in its operation's dialect"),
                    path,
                ))
            }
            _ => return Ok(Role::Skip),
        }

        let kind = self
            .body
            .as_ref()
            .map_or(MessageKind::Generic, MessageBody::kind);
        field_leaf(kind, schema, local)
            .map(Role::Leaf)
            .ok_or_else(|| {
                Violation::with_location(
                    ViolationCode::UnexpectedElement,
                    format!("Unexpected element '{local}' in {kind}"),
                    path,
                )
            })
    }

    fn classify_fault_block(&mut self, ns: Ns, local: &str) -> Role {
        if ns == Ns::FaultMeta && local == "Metadata" {
            return Role::Metadata;
        }
        if self.fault_block_seen {
            return Role::Skip;
        }
        self.fault_block_seen = true;
        if let Ns::Dialect(schema) = ns {
            self.schema.get_or_insert(schema);
        }
        if let Some(MessageBody::Fault(fault)) = self.body.as_mut() {
            fault.fault_name = capitalize(local);
        }
        Role::FaultBlock
    }

    fn assign(&mut self, leaf: Leaf, value: String, cdata: bool, path: &str) -> Result<(), Violation> {
        match leaf {
            Leaf::MessageId => set_once(&mut self.wsa.message_id, value, path),
            Leaf::RelatesTo => set_once(&mut self.wsa.relates_to, value, path),
            Leaf::Action => set_once(&mut self.wsa.action, value, path),
            Leaf::To => set_once(&mut self.wsa.to, value, path),
            Leaf::FromAddress => set_once(&mut self.wsa.from, value, path),
            Leaf::DestinationId => set_once(&mut self.hub_header.destination_id, value, path),
            Leaf::DestinationUri => set_once(&mut self.hub_header.destination_uri, value, path),
            Leaf::FaultValue => Ok(()),
            Leaf::Username
            | Leaf::Password
            | Leaf::FacilityId
            | Leaf::Hl7Message
            | Leaf::EchoBack => self.assign_field(leaf, value, cdata, path),
            _ => self.assign_fault(leaf, value, path),
        }
    }

    fn assign_field(&mut self, leaf: Leaf, value: String, cdata: bool, path: &str) -> Result<(), Violation> {
        match (self.body.as_mut(), leaf) {
            (Some(MessageBody::SubmitSingleMessageRequest(r)), Leaf::Username) => {
                set_sealed(&mut r.credentials.username, value, path)
            }
            (Some(MessageBody::SubmitSingleMessageRequest(r)), Leaf::Password) => {
                set_sealed(&mut r.credentials.password, value, path)
            }
            (Some(MessageBody::SubmitSingleMessageRequest(r)), Leaf::FacilityId) => {
                set_once(&mut r.facility_id, value, path)
            }
            (Some(MessageBody::SubmitSingleMessageRequest(r)), Leaf::Hl7Message) => {
                r.cdata_wrapped |= cdata;
                set_once(&mut r.hl7_message, value, path)
            }
            (Some(MessageBody::SubmitSingleMessageResponse(r)), Leaf::Hl7Message) => {
                r.cdata_wrapped |= cdata;
                set_once(&mut r.hl7_message, value, path)
            }
            (Some(MessageBody::ConnectivityTestRequest(r)), Leaf::EchoBack) => {
                set_once(&mut r.echo_back, value, path)
            }
            (Some(MessageBody::ConnectivityTestResponse(r)), Leaf::EchoBack) => {
                set_once(&mut r.echo_back, value, path)
            }
            _ => Ok(()),
        }
    }

    fn assign_fault(&mut self, leaf: Leaf, value: String, path: &str) -> Result<(), Violation> {
        let Some(MessageBody::Fault(fault)) = self.body.as_mut() else {
            return Ok(());
        };
        match leaf {
            Leaf::FaultReasonText => {
                // Only the first of several language variants is kept.
                if fault.reason.is_none() {
                    fault.reason = Some(value);
                }
                Ok(())
            }
            Leaf::FaultCode => set_once(&mut fault.code, value, path),
            Leaf::FaultDestinationId => set_once(&mut fault.destination.destination_id, value, path),
            Leaf::FaultDestinationUri => {
                set_once(&mut fault.destination.destination_uri, value, path)
            }
            Leaf::EventId => set_once(&mut fault.event_id, value, path),
            Leaf::Summary => set_once(&mut fault.summary, value, path),
            Leaf::Detail => set_once(&mut fault.detail, value, path),
            Leaf::Diagnostics => set_once(&mut fault.diagnostics, value, path),
            Leaf::Retry => {
                fault.retry_strategy = RetryStrategy::parse(&value);
                Ok(())
            }
            Leaf::Original => set_once(&mut fault.original_body, value, path),
            _ => Ok(()),
        }
    }

    fn finish(self, hint: Option<Schema>) -> Result<ReadOutput, Violation> {
        if self.html {
            let mut model = MessageModel::new(hint.unwrap_or(Schema::Iis2014), MessageBody::Generic);
            model.wsa.action = Some(model.derive_action());
            return Ok(ReadOutput {
                model,
                redactions: Vec::new(),
                html: true,
            });
        }

        let schema = self.schema.or(hint).unwrap_or(Schema::Iis2014);
        if schema == Schema::Iis2011 && !self.hub_header.is_empty() {
            return Err(Violation::new(
                ViolationCode::UnsupportedDialect,
                "Hub routing header is not supported in the 2011 dialect",
            ));
        }

        let mut model = MessageModel {
            schema,
            hub_header: self.hub_header,
            wsa: self.wsa,
            body: self.body.unwrap_or(MessageBody::Generic),
        };
        model.wsa.action = Some(model.derive_action());
        Ok(ReadOutput {
            model,
            redactions: self.redactions,
            html: false,
        })
    }
}

/// Replace the given byte ranges of `xml` with the redaction token.
fn redact(xml: &str, ranges: &[Range<usize>]) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut cursor = 0;
    for range in ranges {
        if range.start < cursor || range.end > xml.len() {
            continue;
        }
        out.push_str(&xml[cursor..range.start]);
        out.push_str(crate::masking::REDACTION_TOKEN);
        cursor = range.end;
    }
    out.push_str(&xml[cursor..]);
    out
}

/// Streaming reader for all three dialects.
#[derive(Debug, Clone)]
pub struct SoapReader {
    registry: Arc<FaultRegistry>,
    limits: ReaderLimits,
}

impl SoapReader {
    pub fn new(registry: Arc<FaultRegistry>, limits: ReaderLimits) -> Self {
        Self { registry, limits }
    }

    pub fn limits(&self) -> ReaderLimits {
        self.limits
    }

    /// Decode a document. `hint` supplies the schema when the document
    /// itself does not pin one (generic content, faults without a block).
    pub fn read(&self, data: &[u8], hint: Option<Schema>) -> Result<MessageModel, Fault> {
        self.read_document(data, hint).map(|out| out.model)
    }

    /// Decode a document and also return it with credential values
    /// replaced by the redaction token. A captured HTML page is returned
    /// unchanged.
    pub fn read_with_passthrough(
        &self,
        data: &[u8],
        hint: Option<Schema>,
    ) -> Result<(MessageModel, String), Fault> {
        let out = self.read_document(data, hint)?;
        // read_document has already proven the input is UTF-8.
        let xml = String::from_utf8_lossy(data);
        let passthrough = if out.html {
            xml.into_owned()
        } else {
            redact(&xml, &out.redactions)
        };
        Ok((out.model, passthrough))
    }

    fn read_document(&self, data: &[u8], hint: Option<Schema>) -> Result<ReadOutput, Fault> {
        let validator = ContentValidator::new(self.limits);
        validator
            .check_size(data.len())
            .map_err(|v| self.violation_fault(&v))?;
        let xml = std::str::from_utf8(data).map_err(|e| {
            self.violation_fault(&Violation::new(
                ViolationCode::InvalidXml,
                format!("Invalid UTF-8: {e}"),
            ))
        })?;

        let mut state = ReadState::new(xml, validator);
        state.run().map_err(|v| self.violation_fault(&v))?;
        let elements = state.validator.element_count();
        let out = state.finish(hint).map_err(|v| self.violation_fault(&v))?;
        debug!(
            kind = %out.model.kind(),
            dialect = %out.model.dialect(),
            elements,
            "Read SOAP message"
        );
        Ok(out)
    }

    fn violation_fault(&self, violation: &Violation) -> Fault {
        debug!(
            code = violation.code.as_str(),
            location = ?violation.location,
            "Document rejected"
        );
        let fault = self
            .registry
            .fault(violation.code.fault_code())
            .with_diagnostics(violation.diagnostics());
        if violation.code.is_structural() {
            fault.caused_by_xml()
        } else {
            fault
        }
    }
}
