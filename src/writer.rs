//! SOAP writer for all three dialects.

use crate::config::Environment;
use crate::error::GatewayError;
use crate::fault::{FaultType, RetryStrategy};
use crate::masking::{mask_phi, should_filter, REDACTION_TOKEN};
use crate::model::{
    Dialect, FaultMessage, HubHeader, MessageBody, MessageModel, Schema, WsaHeaders, HUB_NS,
};
use crate::parser::{FAULT_META_NS, SOAP_12_NS, WSA_NS};
use quick_xml::escape::escape;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

/// 2011 name of the submit response payload element.
pub const RESPONSE_PAYLOAD_2011: &str = "return";

const SOAP: &str = "soap";
const WSA: &str = "wsa";
const IIS: &str = "iis";
const HUB: &str = "hub";
const META: &str = "f";

/// Dialect-specific element name for a canonical (2014/Hub) name.
///
/// The 2011 dialect uses lower-camel names and drops the `Request` suffix
/// from operation elements.
pub fn element_name(canonical: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::Iis2011 => {
            let base = canonical.strip_suffix("Request").unwrap_or(canonical);
            let mut chars = base.chars();
            match chars.next() {
                Some(first) => first.to_lowercase().chain(chars).collect(),
                None => String::new(),
            }
        }
        Dialect::Iis2014 | Dialect::Hub => canonical.to_string(),
    }
}

fn write_error(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::XmlWrite(err.to_string())
}

/// Serializes a [`MessageModel`] in its own dialect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoapWriter {
    filtering: bool,
}

impl SoapWriter {
    /// Writer for messages going on the wire: nothing is filtered.
    pub fn wire() -> Self {
        Self { filtering: false }
    }

    /// Writer for logs and diagnostics of `message`.
    ///
    /// Credentials are redacted and HL7 content masked unless the message
    /// is test traffic in a non-production environment.
    pub fn diagnostic(message: &MessageModel, environment: Environment) -> Self {
        Self {
            filtering: should_filter(message.hl7_message(), environment),
        }
    }

    /// Whether credentials and HL7 content are filtered out.
    pub fn is_filtering(&self) -> bool {
        self.filtering
    }

    pub fn write(&self, message: &MessageModel) -> Result<String, GatewayError> {
        let mut out = XmlOut::new(*self, message);
        out.document(message)?;
        out.finish()
    }
}

/// One serialization pass.
struct XmlOut {
    writer: Writer<Vec<u8>>,
    filtering: bool,
    dialect: Dialect,
    schema: Schema,
}

impl XmlOut {
    fn new(settings: SoapWriter, message: &MessageModel) -> Self {
        Self {
            writer: Writer::new(Vec::new()),
            filtering: settings.filtering,
            dialect: message.dialect(),
            schema: message.schema,
        }
    }

    fn finish(self) -> Result<String, GatewayError> {
        String::from_utf8(self.writer.into_inner()).map_err(write_error)
    }

    /// Prefix of body elements.
    fn body_prefix(&self) -> &'static str {
        if self.schema == Schema::Hub {
            HUB
        } else {
            IIS
        }
    }

    fn name(&self, canonical: &str) -> String {
        format!("{}:{}", self.body_prefix(), element_name(canonical, self.dialect))
    }

    fn event(&mut self, event: Event<'_>) -> Result<(), GatewayError> {
        self.writer.write_event(event).map_err(write_error)
    }

    fn start(&mut self, name: &str) -> Result<(), GatewayError> {
        self.event(Event::Start(BytesStart::new(name)))
    }

    fn end(&mut self, name: &str) -> Result<(), GatewayError> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn empty(&mut self, name: &str) -> Result<(), GatewayError> {
        self.event(Event::Empty(BytesStart::new(name)))
    }

    /// Text content; carriage returns survive as `&#13;`, and a payload
    /// that arrived as CDATA is written back as CDATA when it can be.
    fn text(&mut self, value: &str, cdata: bool) -> Result<(), GatewayError> {
        if cdata && !value.contains("]]>") {
            return self.event(Event::CData(BytesCData::new(value)));
        }
        let escaped = escape(value).replace('\r', "&#13;");
        self.event(Event::Text(BytesText::from_escaped(escaped)))
    }

    fn text_element(&mut self, name: &str, value: &str, cdata: bool) -> Result<(), GatewayError> {
        self.start(name)?;
        self.text(value, cdata)?;
        self.end(name)
    }

    fn optional_element(&mut self, name: &str, value: Option<&str>) -> Result<(), GatewayError> {
        match value {
            Some(value) => self.text_element(name, value, false),
            None => Ok(()),
        }
    }

    fn document(&mut self, message: &MessageModel) -> Result<(), GatewayError> {
        self.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let envelope = format!("{SOAP}:Envelope");
        let mut start = BytesStart::new(envelope.as_str());
        start.push_attribute(("xmlns:soap", SOAP_12_NS));
        start.push_attribute(("xmlns:wsa", WSA_NS));
        if self.schema != Schema::Hub {
            start.push_attribute(("xmlns:iis", self.schema.namespace()));
        }
        if self.dialect == Dialect::Hub {
            start.push_attribute(("xmlns:hub", HUB_NS));
        }
        if matches!(message.body, MessageBody::Fault(_)) {
            start.push_attribute(("xmlns:f", FAULT_META_NS));
        }
        self.event(Event::Start(start))?;

        self.header(message)?;

        let body = format!("{SOAP}:Body");
        self.start(&body)?;
        match &message.body {
            MessageBody::SubmitSingleMessageRequest(req) => {
                let op = self.name("SubmitSingleMessageRequest");
                self.start(&op)?;
                if self.filtering {
                    let username = req.credentials.username.as_ref().map(|_| REDACTION_TOKEN);
                    let password = req.credentials.password.as_ref().map(|_| REDACTION_TOKEN);
                    self.optional_element(&self.name("Username"), username)?;
                    self.optional_element(&self.name("Password"), password)?;
                } else {
                    let username = req.credentials.username()?;
                    self.optional_element(&self.name("Username"), username.as_deref())?;
                    let password = req.credentials.password()?;
                    self.optional_element(&self.name("Password"), password.as_deref())?;
                }
                self.optional_element(&self.name("FacilityID"), req.facility_id.as_deref())?;
                if let Some(hl7) = req.hl7_message.as_deref() {
                    self.hl7(&self.name("Hl7Message"), hl7, req.cdata_wrapped)?;
                }
                self.end(&op)?;
            }
            MessageBody::SubmitSingleMessageResponse(resp) => {
                let op = self.name("SubmitSingleMessageResponse");
                self.start(&op)?;
                if let Some(hl7) = resp.hl7_message.as_deref() {
                    let field = self.response_field("Hl7Message");
                    self.hl7(&field, hl7, resp.cdata_wrapped)?;
                }
                self.end(&op)?;
            }
            MessageBody::ConnectivityTestRequest(req) => {
                self.connectivity("ConnectivityTestRequest", req.echo_back.as_deref())?;
            }
            MessageBody::ConnectivityTestResponse(resp) => {
                let op = self.name("ConnectivityTestResponse");
                self.start(&op)?;
                let field = self.response_field("EchoBack");
                self.optional_element(&field, resp.echo_back.as_deref())?;
                self.end(&op)?;
            }
            MessageBody::Fault(fault) => self.fault(fault, &message.hub_header)?,
            MessageBody::Generic => {}
        }
        self.end(&body)?;

        self.end(&envelope)
    }

    fn hl7(&mut self, name: &str, hl7: &str, cdata: bool) -> Result<(), GatewayError> {
        if self.filtering {
            self.text_element(name, &mask_phi(hl7), cdata)
        } else {
            self.text_element(name, hl7, cdata)
        }
    }

    fn connectivity(&mut self, canonical: &str, echo_back: Option<&str>) -> Result<(), GatewayError> {
        let op = self.name(canonical);
        self.start(&op)?;
        self.optional_element(&self.name("EchoBack"), echo_back)?;
        self.end(&op)
    }

    /// 2011 response payloads all share one element name.
    fn response_field(&self, canonical: &str) -> String {
        if self.dialect == Dialect::Iis2011 {
            format!("{IIS}:{RESPONSE_PAYLOAD_2011}")
        } else {
            self.name(canonical)
        }
    }

    fn header(&mut self, message: &MessageModel) -> Result<(), GatewayError> {
        let wsa = &message.wsa;
        let has_wsa = wsa != &WsaHeaders::default();
        let hub = self.dialect == Dialect::Hub && !message.hub_header.is_empty();
        if !has_wsa && !hub {
            return Ok(());
        }

        let header = format!("{SOAP}:Header");
        self.start(&header)?;
        self.optional_element(&format!("{WSA}:MessageID"), wsa.message_id.as_deref())?;
        self.optional_element(&format!("{WSA}:RelatesTo"), wsa.relates_to.as_deref())?;
        self.optional_element(&format!("{WSA}:Action"), wsa.action.as_deref())?;
        self.optional_element(&format!("{WSA}:To"), wsa.to.as_deref())?;
        if let Some(from) = wsa.from.as_deref() {
            let name = format!("{WSA}:From");
            self.start(&name)?;
            self.text_element(&format!("{WSA}:Address"), from, false)?;
            self.end(&name)?;
        }
        if hub {
            let name = if message.kind().is_request() {
                format!("{HUB}:HubRequestHeader")
            } else {
                format!("{HUB}:HubResponseHeader")
            };
            self.start(&name)?;
            self.destination(HUB, &message.hub_header)?;
            self.end(&name)?;
        }
        self.end(&header)
    }

    fn destination(&mut self, prefix: &str, header: &HubHeader) -> Result<(), GatewayError> {
        self.optional_element(
            &format!("{prefix}:DestinationId"),
            header.destination_id.as_deref(),
        )?;
        self.optional_element(
            &format!("{prefix}:DestinationUri"),
            header.destination_uri.as_deref(),
        )
    }

    fn fault(&mut self, fault: &FaultMessage, hub_header: &HubHeader) -> Result<(), GatewayError> {
        let fault_name = if fault.fault_name.is_empty() {
            FaultType::UnexpectedException.name()
        } else {
            fault.fault_name.as_str()
        };
        let reason = fault
            .reason
            .as_deref()
            .or(fault.summary.as_deref())
            .unwrap_or(fault_name);

        let name = format!("{SOAP}:Fault");
        self.start(&name)?;
        if self.dialect == Dialect::Iis2011 {
            self.optional_element("Code", fault.code.as_deref())?;
            self.text_element("Reason", reason, false)?;
            self.start("Detail")?;
            self.empty(&self.name(fault_name))?;
            self.metadata(fault, fault_name)?;
            self.end("Detail")?;
        } else {
            let code = format!("{SOAP}:Code");
            self.start(&code)?;
            let value = if fault.retry_strategy == Some(RetryStrategy::CorrectMessage) {
                "soap:Sender"
            } else {
                "soap:Receiver"
            };
            self.text_element(&format!("{SOAP}:Value"), value, false)?;
            self.end(&code)?;

            let reason_name = format!("{SOAP}:Reason");
            self.start(&reason_name)?;
            let text = format!("{SOAP}:Text");
            let mut start = BytesStart::new(text.as_str());
            start.push_attribute(("xml:lang", "en"));
            self.event(Event::Start(start))?;
            self.text(reason, false)?;
            self.end(&text)?;
            self.end(&reason_name)?;

            let detail = format!("{SOAP}:Detail");
            self.start(&detail)?;
            let block = self.name(fault_name);
            self.start(&block)?;
            self.optional_element(&self.name("Code"), fault.code.as_deref())?;
            if self.dialect == Dialect::Hub {
                let destination = if fault.destination.is_empty() {
                    hub_header
                } else {
                    &fault.destination
                };
                let prefix = self.body_prefix();
                self.destination(prefix, destination)?;
            }
            self.end(&block)?;
            self.metadata(fault, fault_name)?;
            self.end(&detail)?;
        }
        self.end(&name)
    }

    fn metadata(&mut self, fault: &FaultMessage, fault_name: &str) -> Result<(), GatewayError> {
        let name = format!("{META}:Metadata");
        self.start(&name)?;
        self.optional_element(&format!("{META}:EventID"), fault.event_id.as_deref())?;
        self.optional_element(&format!("{META}:Summary"), fault.summary.as_deref())?;
        self.optional_element(&format!("{META}:Detail"), fault.detail.as_deref())?;
        self.optional_element(&format!("{META}:Diagnostics"), fault.diagnostics.as_deref())?;
        self.optional_element(
            &format!("{META}:Retry"),
            fault.retry_strategy.map(RetryStrategy::as_str),
        )?;
        if fault_name == FaultType::HubClient.name() {
            self.optional_element(&format!("{META}:Original"), fault.original_body.as_deref())?;
        }
        self.end(&name)
    }
}
