//! Integration tests for the iis-hub-gateway crate.
//!
//! These tests exercise the public API surface end-to-end, combining
//! reading, writing, fault mapping and dispatch together.

use async_trait::async_trait;
use iis_hub_gateway::config::{Environment, GatewayConfig, RetryPolicy};
use iis_hub_gateway::destination::{ConfiguredDirectory, Destination, DestinationKey, UnconfiguredCodec};
use iis_hub_gateway::dispatcher::{CallerContext, DestinationDispatcher};
use iis_hub_gateway::fault::FaultRegistry;
use iis_hub_gateway::masking::{mask_phi, REDACTION_TOKEN};
use iis_hub_gateway::model::{
    ConnectivityTestResponse, Dialect, MessageBody, MessageModel, Schema,
};
use iis_hub_gateway::parser::SoapReader;
use iis_hub_gateway::status::{EndpointState, EndpointStatusStore, InMemoryStatusStore};
use iis_hub_gateway::transaction::TransactionData;
use iis_hub_gateway::transport::{OutboundRequest, Transport, TransportError, TransportResponse};
use iis_hub_gateway::validator::ReaderLimits;
use iis_hub_gateway::writer::{element_name, SoapWriter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

const HL7: &str = "MSH|^~\\&|EHR|F001|IIS|MDIIS|20240101120000||VXU^V04^VXU_V04|MSG-1|P|2.5.1\rPID|1||12345^^^F001^MR||DOE^JANE||20200101|F";

fn reader() -> SoapReader {
    SoapReader::new(Arc::new(FaultRegistry::standard()), ReaderLimits::default())
}

fn submit_2011() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:iis="urn:cdc:iisb:2011">
  <soap:Body>
    <iis:submitSingleMessage>
      <iis:username>clinic</iis:username>
      <iis:password>s3cret</iis:password>
      <iis:facilityID>F001</iis:facilityID>
      <iis:hl7Message><![CDATA[{HL7}]]></iis:hl7Message>
    </iis:submitSingleMessage>
  </soap:Body>
</soap:Envelope>"#
    )
}

fn submit_2014() -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"
    xmlns:wsa="http://www.w3.org/2005/08/addressing" xmlns:iis="urn:cdc:iisb:2014">
  <soap:Header>
    <wsa:MessageID>urn:uuid:2014-req</wsa:MessageID>
  </soap:Header>
  <soap:Body>
    <iis:SubmitSingleMessageRequest>
      <iis:Username>clinic</iis:Username>
      <iis:Password>s3cret</iis:Password>
      <iis:FacilityID>F001</iis:FacilityID>
      <iis:Hl7Message>{}</iis:Hl7Message>
    </iis:SubmitSingleMessageRequest>
  </soap:Body>
</soap:Envelope>"#,
        HL7.replace('&', "&amp;").replace('\r', "&#13;")
    )
}

fn submit_hub() -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"
    xmlns:wsa="http://www.w3.org/2005/08/addressing" xmlns:hub="urn:cdc:iisb:hub:2014"
    xmlns:iis="urn:cdc:iisb:2014">
  <soap:Header>
    <wsa:MessageID>urn:uuid:hub-req</wsa:MessageID>
    <hub:HubRequestHeader>
      <hub:DestinationId>md</hub:DestinationId>
    </hub:HubRequestHeader>
  </soap:Header>
  <soap:Body>
    <iis:SubmitSingleMessageRequest>
      <iis:FacilityID>F001</iis:FacilityID>
      <iis:Hl7Message>{}</iis:Hl7Message>
    </iis:SubmitSingleMessageRequest>
  </soap:Body>
</soap:Envelope>"#,
        HL7.replace('&', "&amp;").replace('\r', "&#13;")
    )
}

/// Destination double: answers from a fixed outcome and counts attempts.
struct FixedTransport {
    outcome: Result<TransportResponse, TransportError>,
    attempts: AtomicUsize,
}

impl FixedTransport {
    fn new(outcome: Result<TransportResponse, TransportError>) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            attempts: AtomicUsize::new(0),
        })
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FixedTransport {
    async fn exchange(&self, _request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

fn http(status: u16, body: &str) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status,
        body: body.as_bytes().to_vec(),
        connect_elapsed: Duration::from_millis(2),
        read_elapsed: Duration::from_millis(3),
    })
}

fn dispatcher_for(
    transport: Arc<FixedTransport>,
    config: GatewayConfig,
) -> (DestinationDispatcher, Arc<InMemoryStatusStore>) {
    let store = Arc::new(InMemoryStatusStore::new());
    let dispatcher = DestinationDispatcher::new(
        &config,
        Arc::new(FaultRegistry::standard()),
        transport,
        store.clone(),
        Arc::new(ConfiguredDirectory::new(config.destinations.clone())),
        Arc::new(UnconfiguredCodec),
    );
    (dispatcher, store)
}

fn config_with(destination: Destination) -> GatewayConfig {
    GatewayConfig {
        destinations: vec![destination],
        ..GatewayConfig::default()
    }
}

fn md() -> Destination {
    Destination::new("md", "https://md.example.org/iis")
}

fn echo_request() -> MessageModel {
    let xml = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:iis="urn:cdc:iisb:2014"><soap:Body><iis:ConnectivityTestRequest><iis:EchoBack>ping</iis:EchoBack></iis:ConnectivityTestRequest></soap:Body></soap:Envelope>"#;
    reader().read(xml.as_bytes(), None).unwrap()
}

// ============================================================================
// Round trips through all three dialects
// ============================================================================

#[test]
fn test_e2e_round_trip_2011() {
    let first = reader().read(submit_2011().as_bytes(), None).unwrap();
    assert_eq!(first.dialect(), Dialect::Iis2011);
    assert_eq!(first.hl7_message(), Some(HL7));

    let xml = SoapWriter::wire().write(&first).unwrap();
    assert!(xml.contains("<iis:submitSingleMessage>"));
    assert!(xml.contains("<![CDATA[MSH|"));
    let second = reader().read(xml.as_bytes(), None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_e2e_round_trip_2014() {
    let first = reader().read(submit_2014().as_bytes(), None).unwrap();
    assert_eq!(first.dialect(), Dialect::Iis2014);
    assert_eq!(first.hl7_message(), Some(HL7));
    assert_eq!(first.wsa.message_id.as_deref(), Some("urn:uuid:2014-req"));

    let xml = SoapWriter::wire().write(&first).unwrap();
    assert!(xml.contains("<iis:SubmitSingleMessageRequest>"));
    assert!(xml.contains("&#13;PID"));
    let second = reader().read(xml.as_bytes(), None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_e2e_round_trip_hub() {
    let first = reader().read(submit_hub().as_bytes(), None).unwrap();
    assert_eq!(first.dialect(), Dialect::Hub);
    assert_eq!(first.hub_header.destination_id.as_deref(), Some("md"));
    assert_eq!(
        first.wsa.action.as_deref(),
        Some("urn:cdc:iisb:hub:2014:IISHubPortType:SubmitSingleMessageRequest")
    );

    let xml = SoapWriter::wire().write(&first).unwrap();
    assert!(xml.contains("<hub:HubRequestHeader>"));
    let second = reader().read(xml.as_bytes(), None).unwrap();
    assert_eq!(first, second);
}

// ============================================================================
// Hostile and malformed input
// ============================================================================

#[test]
fn test_e2e_script_injection_rejected() {
    let xml = submit_2014().replace("<iis:FacilityID>F001", "<iis:FacilityID>javascript:alert(1)");
    let fault = reader().read(xml.as_bytes(), None).unwrap_err();
    assert_eq!(fault.fault_name(), "SecurityFault");
    assert_eq!(fault.code(), "1");
    assert_eq!(fault.http_status(), 400);
}

#[test]
fn test_e2e_script_element_rejected() {
    let xml = submit_2014().replace(
        "<iis:FacilityID>F001</iis:FacilityID>",
        "<iis:FacilityID>F001</iis:FacilityID><script>alert(1)</script>",
    );
    let fault = reader().read(xml.as_bytes(), None).unwrap_err();
    assert_eq!(fault.code(), "1");
}

#[test]
fn test_e2e_entity_declaration_rejected() {
    let xml = format!(
        "<!DOCTYPE foo [<!ENTITY xxe SYSTEM \"file:///etc/passwd\">]>{}",
        submit_2014()
    );
    let fault = reader().read(xml.as_bytes(), None).unwrap_err();
    assert_eq!(fault.fault_name(), "SecurityFault");
}

#[test]
fn test_e2e_duplicate_field_rejected() {
    let xml = submit_2014().replace(
        "<iis:FacilityID>F001</iis:FacilityID>",
        "<iis:FacilityID>F001</iis:FacilityID><iis:FacilityID>F002</iis:FacilityID>",
    );
    let fault = reader().read(xml.as_bytes(), None).unwrap_err();
    assert_eq!(fault.code(), "2");
    assert!(fault.is_xml_cause());
}

// ============================================================================
// Dispatch: retries and circuit breaker
// ============================================================================

#[tokio::test]
async fn test_e2e_breaker_thrown_after_retries() {
    let transport = FixedTransport::new(Err(TransportError::Connect(
        "tcp connect error: Connection refused (os error 111)".to_string(),
    )));
    let (dispatcher, store) = dispatcher_for(transport.clone(), config_with(md()));
    let clinic = CallerContext::new("clinic");

    let mut tx = TransactionData::new();
    let fault = dispatcher
        .dispatch(&echo_request(), "md", &clinic, &mut tx)
        .await
        .unwrap_err();
    assert_eq!(fault.code(), "12");
    assert_eq!(transport.attempts(), 4);
    assert_eq!(tx.retry_count, 4);

    let status = store
        .find_by_id(&DestinationKey::new("md", "prod"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, EndpointState::CircuitBreakerThrown);
    assert_eq!(status.detail.as_deref(), Some("Connection Refused"));

    // Non-admin callers are refused without a network attempt.
    let fault = dispatcher
        .dispatch(&echo_request(), "md", &clinic, &mut TransactionData::new())
        .await
        .unwrap_err();
    assert_eq!(fault.code(), "21");
    assert_eq!(transport.attempts(), 4);

    // Admins still reach the destination.
    let fault = dispatcher
        .dispatch(&echo_request(), "md", &CallerContext::admin("ops"), &mut TransactionData::new())
        .await
        .unwrap_err();
    assert_eq!(fault.code(), "12");
    assert_eq!(transport.attempts(), 8);
}

#[tokio::test]
async fn test_e2e_exempt_destination_skips_breaker_gate() {
    let transport = FixedTransport::new(Err(TransportError::ReadTimeout(
        "operation timed out".to_string(),
    )));
    let mut config = config_with(md());
    config.dispatch.status_check_exempt = vec!["m*".to_string()];
    config.dispatch.max_retries = 1;
    let (dispatcher, _) = dispatcher_for(transport.clone(), config);

    let clinic = CallerContext::new("clinic");
    for _ in 0..2 {
        let fault = dispatcher
            .dispatch(&echo_request(), "md", &clinic, &mut TransactionData::new())
            .await
            .unwrap_err();
        assert_eq!(fault.code(), "11");
    }
    assert_eq!(transport.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_e2e_fixed_delay_retry_policy() {
    let transport = FixedTransport::new(http(503, "Service Unavailable"));
    let mut config = config_with(md());
    config.dispatch.retry_policy = RetryPolicy::FixedDelay { delay_ms: 1_000 };
    let (dispatcher, _) = dispatcher_for(transport.clone(), config);

    let started = tokio::time::Instant::now();
    let fault = dispatcher
        .dispatch(&echo_request(), "md", &CallerContext::new("clinic"), &mut TransactionData::new())
        .await
        .unwrap_err();
    assert_eq!(fault.code(), "208");
    assert_eq!(transport.attempts(), 4);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn test_e2e_maintenance_gate() {
    let mut destination = md();
    destination.maintenance_start = Some(chrono::Utc::now() - chrono::Duration::hours(1));
    destination.maintenance_end = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    let transport = FixedTransport::new(http(200, ""));
    let (dispatcher, _) = dispatcher_for(transport.clone(), config_with(destination));

    let fault = dispatcher
        .dispatch(&echo_request(), "md", &CallerContext::new("clinic"), &mut TransactionData::new())
        .await
        .unwrap_err();
    assert_eq!(fault.code(), "20");
    assert!(!fault.is_retryable());
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_e2e_successful_exchange_in_callers_dialect() {
    let response = SoapWriter::wire()
        .write(&MessageModel::new(
            Schema::Iis2014,
            MessageBody::ConnectivityTestResponse(ConnectivityTestResponse {
                echo_back: Some("pong".to_string()),
            }),
        ))
        .unwrap();
    let mut destination = md();
    destination.dest_version = Some("2014".to_string());
    let transport = FixedTransport::new(http(200, &response));
    let (dispatcher, store) = dispatcher_for(transport.clone(), config_with(destination));

    let mut request = echo_request();
    request.schema = Schema::Hub;
    request.wsa.message_id = Some("urn:uuid:hub-caller".to_string());

    let mut tx = TransactionData::new();
    let reply = dispatcher
        .dispatch(&request, "md", &CallerContext::new("clinic"), &mut tx)
        .await
        .unwrap();
    assert!(reply.is_hub());
    assert_eq!(reply.hub_header.destination_uri.as_deref(), Some("https://md.example.org/iis"));
    assert_eq!(reply.wsa.relates_to.as_deref(), Some("urn:uuid:hub-caller"));
    assert!(tx.request_size > 0);
    assert_eq!(tx.response_size, response.len());

    let xml = SoapWriter::wire().write(&reply).unwrap();
    assert!(xml.contains("<hub:HubResponseHeader>"));
    assert_eq!(
        store.find("md").await.unwrap()[0].status,
        EndpointState::Connected
    );
}

// ============================================================================
// Fault mapping
// ============================================================================

#[tokio::test]
async fn test_e2e_http_status_mapping() {
    for (status, code) in [(404, "204"), (401, "202"), (502, "207")] {
        let transport = FixedTransport::new(http(status, "<html>nope</html>"));
        let (dispatcher, _) = dispatcher_for(transport, config_with(md()));
        let fault = dispatcher
            .dispatch(&echo_request(), "md", &CallerContext::new("clinic"), &mut TransactionData::new())
            .await
            .unwrap_err();
        assert_eq!(fault.fault_name(), "HubClientFault");
        assert_eq!(fault.code(), code, "HTTP {status}");
        assert_eq!(fault.original_body(), Some("<html>nope</html>"));
    }
}

#[test]
fn test_e2e_transport_error_mapping() {
    let registry = FaultRegistry::standard();
    let cases = [
        (TransportError::Connect("connection timed out".to_string()), "10"),
        (TransportError::ReadTimeout("operation timed out".to_string()), "11"),
        (TransportError::Connect("Connection refused (os error 111)".to_string()), "12"),
        (TransportError::UnknownHost("md.invalid".to_string()), "13"),
    ];
    for (err, code) in cases {
        assert_eq!(registry.from_transport_error(&err).code(), code, "{err}");
    }
}

// ============================================================================
// Masking and element naming
// ============================================================================

#[test]
fn test_e2e_diagnostic_rendering_masks_phi() {
    let request = reader().read(submit_2014().as_bytes(), None).unwrap();

    let masked = SoapWriter::diagnostic(&request, Environment::Production)
        .write(&request)
        .unwrap();
    assert!(masked.contains(REDACTION_TOKEN));
    assert!(!masked.contains("s3cret"));
    assert!(!masked.contains("DOE^JANE"));

    let raw = SoapWriter::wire().write(&request).unwrap();
    assert!(raw.contains("s3cret"));
    assert!(raw.contains("DOE^JANE"));

    let masked_hl7 = mask_phi(HL7);
    assert!(masked_hl7.starts_with("MSH|"));
    assert!(!masked_hl7.contains("12345"));
}

#[test]
fn test_e2e_dialect_element_naming() {
    assert_eq!(element_name("SubmitSingleMessageRequest", Dialect::Iis2011), "submitSingleMessage");
    assert_eq!(element_name("ConnectivityTestRequest", Dialect::Iis2011), "connectivityTest");
    assert_eq!(element_name("Hl7Message", Dialect::Iis2011), "hl7Message");
    assert_eq!(element_name("SubmitSingleMessageRequest", Dialect::Iis2014), "SubmitSingleMessageRequest");
    assert_eq!(element_name("EchoBack", Dialect::Hub), "EchoBack");
}
