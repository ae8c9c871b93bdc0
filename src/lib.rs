//! IIS Hub gateway core
//!
//! Routes immunization messages between submitting systems and
//! jurisdictional registries over the IIS SOAP dialects (2011, 2014 and the
//! harmonized Hub schema).
//!
//! # Features
//!
//! - Streaming SOAP reader that rejects hostile and malformed input
//! - Dialect-aware writer with credential redaction and HL7 PHI masking
//! - Stable fault taxonomy with retry guidance
//! - Dispatcher with bounded retries and a per-destination circuit breaker
//! - Hot-reloaded TLS material for outbound HTTPS
//!
//! # Example
//!
//! ```ignore
//! use iis_hub_gateway::{CallerContext, DestinationDispatcher, SoapReader, TransactionData};
//!
//! let request = reader.read(body, None)?;
//! let mut tx = TransactionData::new();
//! let response = dispatcher
//!     .dispatch(&request, "md", &CallerContext::new("clinic"), &mut tx)
//!     .await?;
//! ```

pub mod config;
pub mod destination;
pub mod dispatcher;
pub mod error;
pub mod fault;
pub mod masking;
pub mod model;
pub mod parser;
pub mod secret;
pub mod status;
pub mod transaction;
pub mod transport;
pub mod validator;
pub mod writer;

pub use config::GatewayConfig;
pub use destination::{
    AesGcmCredentialCodec, ConfiguredDirectory, CredentialCodec, Destination, DestinationDirectory,
    UnconfiguredCodec,
};
pub use dispatcher::{CallerContext, DestinationDispatcher};
pub use error::{GatewayError, ViolationCode};
pub use fault::{Fault, FaultRegistry, RetryStrategy};
pub use model::{Dialect, MessageBody, MessageKind, MessageModel, Schema};
pub use parser::SoapReader;
pub use secret::SealedSecret;
pub use status::{EndpointStatusStore, InMemoryStatusStore};
pub use transaction::TransactionData;
pub use transport::{HttpsTransport, Timeouts, Transport};
pub use writer::SoapWriter;
