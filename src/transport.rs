//! Outbound HTTPS exchange with destinations.
//!
//! TLS trust and identity material live in an immutable [`TlsSnapshot`]. A
//! background task rebuilds the snapshot on an interval and swaps it in;
//! attempts already in flight keep the snapshot they started with.

use crate::config::TlsConfig;
use async_trait::async_trait;
use std::error::Error as StdError;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why an exchange produced no HTTP response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("read timed out: {0}")]
    ReadTimeout(String),

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("invalid destination URI: {0}")]
    InvalidUri(String),

    #[error("gateway TLS configuration unusable: {0}")]
    TlsAtGateway(String),

    #[error("TLS handshake with destination failed: {0}")]
    TlsAtDestination(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("response body of {size} bytes exceeds maximum {limit}")]
    ResponseTooLarge { size: u64, limit: usize },
}

/// One send attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub uri: String,
    pub action: String,
    pub body: String,
    /// Reading stops once the response body grows past this
    pub max_response_size: usize,
}

impl OutboundRequest {
    /// SOAP 1.2 content type carrying the action parameter.
    pub fn content_type(&self) -> String {
        format!("application/soap+xml;charset=UTF-8;action=\"{}\"", self.action)
    }
}

/// Raw HTTP answer from a destination.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Time until response headers arrived
    pub connect_elapsed: Duration,
    /// Time spent reading the response body
    pub read_elapsed: Duration,
}

/// Sends one SOAP request and returns the raw response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// TLS material loaded at one point in time.
#[derive(Debug)]
pub struct TlsSnapshot {
    client: Result<reqwest::Client, String>,
    pub loaded_at: Instant,
}

impl TlsSnapshot {
    /// Build a client from the configured trust store and identity.
    ///
    /// A failure is kept in the snapshot so sends report it as a gateway
    /// TLS fault until the next successful reload.
    pub async fn load(tls: &TlsConfig, timeouts: Timeouts) -> Self {
        Self {
            client: build_client(tls, timeouts).await,
            loaded_at: Instant::now(),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.client.is_ok()
    }
}

/// Per-attempt limits applied by every client the transport builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Establishing the connection, TLS handshake included
    pub connect: Duration,
    /// Longest wait for the next chunk of the response
    pub read: Duration,
}

async fn build_client(tls: &TlsConfig, timeouts: Timeouts) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(timeouts.connect)
        .read_timeout(timeouts.read);

    if let Some(path) = &tls.ca_bundle {
        let pem = tokio::fs::read(path)
            .await
            .map_err(|e| format!("reading CA bundle {}: {e}", path.display()))?;
        for cert in reqwest::Certificate::from_pem_bundle(&pem)
            .map_err(|e| format!("parsing CA bundle {}: {e}", path.display()))?
        {
            builder = builder.add_root_certificate(cert);
        }
    }

    if let Some(path) = &tls.identity {
        let pem = tokio::fs::read(path)
            .await
            .map_err(|e| format!("reading identity {}: {e}", path.display()))?;
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| format!("parsing identity {}: {e}", path.display()))?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(|e| error_chain(&e))
}

/// reqwest-backed transport with hot-reloaded TLS material.
pub struct HttpsTransport {
    tls: TlsConfig,
    timeouts: Timeouts,
    snapshot: RwLock<Arc<TlsSnapshot>>,
}

impl HttpsTransport {
    pub async fn new(tls: TlsConfig, timeouts: Timeouts) -> Self {
        let snapshot = TlsSnapshot::load(&tls, timeouts).await;
        if let Err(e) = &snapshot.client {
            warn!(error = %e, "Initial TLS material could not be loaded");
        }
        Self {
            tls,
            timeouts,
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Current snapshot; cheap to clone and safe to hold across awaits.
    pub fn snapshot(&self) -> Arc<TlsSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Rebuild the snapshot. A failed reload keeps the previous one.
    pub async fn reload(&self) -> Result<(), TransportError> {
        let fresh = TlsSnapshot::load(&self.tls, self.timeouts).await;
        if let Err(e) = &fresh.client {
            return Err(TransportError::TlsAtGateway(e.clone()));
        }
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(fresh);
        info!("TLS material reloaded");
        Ok(())
    }

    /// Reload TLS material every `reload_interval_secs`.
    pub fn spawn_reload(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.tls.reload_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.reload().await {
                    warn!(error = %e, "TLS reload failed, keeping previous material");
                }
            }
        })
    }

    fn check_uri(&self, uri: &str) -> Result<reqwest::Url, TransportError> {
        let url = reqwest::Url::parse(uri).map_err(|e| TransportError::InvalidUri(format!("{uri}: {e}")))?;
        if self.tls.require_https && url.scheme() != "https" {
            return Err(TransportError::InvalidUri(format!("{uri}: scheme must be https")));
        }
        if url.host_str().is_none() {
            return Err(TransportError::InvalidUri(format!("{uri}: missing host")));
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    async fn exchange(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let url = self.check_uri(&request.uri)?;
        let snapshot = self.snapshot();
        let client = snapshot
            .client
            .as_ref()
            .map_err(|e| TransportError::TlsAtGateway(e.clone()))?;

        debug!(uri = %url, action = %request.action, "Sending request");
        let started = Instant::now();
        let mut response = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, request.content_type())
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| classify(&e))?;
        let connect_elapsed = started.elapsed();

        let status = response.status().as_u16();
        let limit = request.max_response_size;
        if let Some(size) = response.content_length().filter(|&n| n > limit as u64) {
            return Err(TransportError::ResponseTooLarge { size, limit });
        }

        let read_started = Instant::now();
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(&e))? {
            if body.len() + chunk.len() > limit {
                let size = (body.len() + chunk.len()) as u64;
                return Err(TransportError::ResponseTooLarge { size, limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(TransportResponse {
            status,
            body,
            connect_elapsed,
            read_elapsed: read_started.elapsed(),
        })
    }
}

/// Map a reqwest failure onto a transport error kind.
fn classify(err: &reqwest::Error) -> TransportError {
    let chain = error_chain(err);
    let lower = chain.to_ascii_lowercase();
    if err.is_builder() {
        TransportError::InvalidUri(chain)
    } else if err.is_timeout() && err.is_connect() {
        TransportError::Connect(format!("connection timed out: {chain}"))
    } else if err.is_timeout() {
        TransportError::ReadTimeout(chain)
    } else if err.is_connect() && (lower.contains("dns") || lower.contains("lookup")) {
        TransportError::UnknownHost(chain)
    } else if err.is_connect()
        && ["certificate", "tls", "handshake"]
            .iter()
            .any(|p| lower.contains(p))
    {
        TransportError::TlsAtDestination(chain)
    } else if err.is_connect() {
        TransportError::Connect(chain)
    } else {
        TransportError::Io(chain)
    }
}

/// Render an error and its sources as one line.
fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tls(require_https: bool) -> TlsConfig {
        TlsConfig {
            require_https,
            ..TlsConfig::default()
        }
    }

    fn request(uri: &str) -> OutboundRequest {
        OutboundRequest {
            uri: uri.to_string(),
            action: "urn:cdc:iisb:2014:IISPortType:ConnectivityTestRequest".to_string(),
            body: String::new(),
            max_response_size: 1024,
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(200),
            read: Duration::from_millis(200),
        }
    }

    /// Serve one canned HTTP response on a local port, after reading the
    /// request headers and body.
    async fn serve_once(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if received.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/soap")
    }

    #[test]
    fn test_content_type_carries_action() {
        assert_eq!(
            request("https://x").content_type(),
            "application/soap+xml;charset=UTF-8;action=\"urn:cdc:iisb:2014:IISPortType:ConnectivityTestRequest\""
        );
    }

    #[tokio::test]
    async fn test_plain_http_rejected_when_https_required() {
        let transport = HttpsTransport::new(tls(true), timeouts()).await;
        let err = transport
            .exchange(&request("http://iis.example.org/soap"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUri(_)));

        let err = transport.exchange(&request("not a uri")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUri(_)));
    }

    #[tokio::test]
    async fn test_missing_tls_material_is_gateway_fault() {
        let config = TlsConfig {
            ca_bundle: Some(PathBuf::from("/nonexistent/ca-bundle.pem")),
            ..TlsConfig::default()
        };
        let transport = HttpsTransport::new(config, timeouts()).await;
        assert!(!transport.snapshot().is_usable());

        let err = transport
            .exchange(&request("https://iis.example.org/soap"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TlsAtGateway(_)));

        let before = transport.snapshot().loaded_at;
        assert!(transport.reload().await.is_err());
        assert_eq!(transport.snapshot().loaded_at, before);
    }

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let transport = HttpsTransport::new(tls(true), timeouts()).await;
        let held = transport.snapshot();
        transport.reload().await.unwrap();
        let current = transport.snapshot();
        assert!(!Arc::ptr_eq(&held, &current));
        assert!(held.is_usable());
    }

    #[tokio::test]
    async fn test_response_read_within_limit() {
        let body = "<soap:Envelope/>";
        let uri = serve_once(
            format!("HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}", body.len())
                .into_bytes(),
        )
        .await;
        let transport = HttpsTransport::new(tls(false), timeouts()).await;
        let response = transport.exchange(&request(&uri)).await.unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body, body.as_bytes());
    }

    #[tokio::test]
    async fn test_declared_oversized_response_refused() {
        let uri = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10000000\r\nConnection: close\r\n\r\n<soap:Envelope>"
                .to_vec(),
        )
        .await;
        let transport = HttpsTransport::new(tls(false), timeouts()).await;
        let err = transport.exchange(&request(&uri)).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::ResponseTooLarge {
                size: 10_000_000,
                limit: 1024
            }
        );
    }

    #[tokio::test]
    async fn test_undeclared_oversized_response_stops_reading() {
        let mut response = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
        response.extend(std::iter::repeat(b'x').take(64 * 1024));
        let uri = serve_once(response).await;
        let transport = HttpsTransport::new(tls(false), timeouts()).await;
        let err = transport.exchange(&request(&uri)).await.unwrap_err();
        assert!(
            matches!(err, TransportError::ResponseTooLarge { size, limit: 1024 } if size > 1024),
            "{err:?}"
        );
    }

    #[test]
    fn test_error_chain_joins_sources() {
        let inner = std::io::Error::other("connection reset");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        assert!(error_chain(&outer).contains("connection reset"));
    }
}
