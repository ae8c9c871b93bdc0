//! IIS Hub gateway binary.
//!
//! Run with: `iis-hub-gateway --config config.yaml --destination md --message request.xml`
//!
//! Reads one SOAP message, dispatches it to the destination and prints the
//! response or fault envelope in the caller's dialect.

use anyhow::{Context, Result};
use clap::Parser;
use iis_hub_gateway::{
    AesGcmCredentialCodec, CallerContext, ConfiguredDirectory, CredentialCodec,
    DestinationDispatcher, FaultRegistry, GatewayConfig, HttpsTransport, InMemoryStatusStore,
    MessageBody, MessageModel, Schema, SoapReader, SoapWriter, Timeouts, TransactionData,
    UnconfiguredCodec,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// Gateway between immunization submitters and IIS registries.
///
/// Dispatches a single SOAP message to a configured destination using the
/// destination's dialect, with retries and circuit breaker protection.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Destination id to send the message to
    #[arg(short, long)]
    destination: String,

    /// File holding the SOAP request envelope
    #[arg(short, long)]
    message: PathBuf,

    /// Dispatch as an elevated caller, bypassing maintenance and breaker gates
    #[arg(long)]
    admin: bool,

    /// Caller principal recorded on status changes
    #[arg(long, default_value = "cli")]
    principal: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting IIS Hub gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());

    let config = if args.config.exists() {
        GatewayConfig::load(&args.config)
            .await
            .context("Failed to load config file")?
    } else {
        info!("Config file not found, using defaults");
        GatewayConfig::default()
    };

    info!(
        destinations = config.destinations.len(),
        environment = ?config.settings.environment,
        max_retries = config.dispatch.max_retries,
        retry_policy = ?config.dispatch.retry_policy,
        "Configuration loaded"
    );

    let codec: Arc<dyn CredentialCodec> = match config.credentials.key.as_deref() {
        Some(key) => Arc::new(
            AesGcmCredentialCodec::from_base64(key).context("Invalid credential key")?,
        ),
        None => {
            info!("No credential key configured, stored passwords cannot be used");
            Arc::new(UnconfiguredCodec)
        }
    };

    let timeouts = Timeouts {
        connect: config.dispatch.connect_timeout(),
        read: config.dispatch.read_timeout(),
    };
    let transport = Arc::new(HttpsTransport::new(config.tls.clone(), timeouts).await);
    let reload = Arc::clone(&transport).spawn_reload();

    let registry = Arc::new(FaultRegistry::standard());
    let reader = SoapReader::new(Arc::clone(&registry), config.settings.reader_limits());
    let dispatcher = DestinationDispatcher::new(
        &config,
        Arc::clone(&registry),
        transport,
        Arc::new(InMemoryStatusStore::new()),
        Arc::new(ConfiguredDirectory::new(config.destinations.clone())),
        codec,
    );

    let body = tokio::fs::read(&args.message)
        .await
        .with_context(|| format!("Failed to read message file {}", args.message.display()))?;

    let request = match reader.read(&body, None) {
        Ok(request) => request,
        Err(fault) => {
            warn!(code = %fault.code(), "Inbound message rejected");
            let reply = MessageModel::fault_reply(
                &MessageModel::new(Schema::Iis2014, MessageBody::Generic),
                fault.to_message(Uuid::new_v4().to_string()),
            );
            println!("{}", SoapWriter::wire().write(&reply)?);
            return Ok(());
        }
    };

    let diagnostic = SoapWriter::diagnostic(&request, config.settings.environment);
    debug!(
        filtered = diagnostic.is_filtering(),
        message = %diagnostic.write(&request)?,
        "Inbound message"
    );

    let caller = if args.admin {
        CallerContext::admin(&args.principal)
    } else {
        CallerContext::new(&args.principal)
    };

    let mut tx = TransactionData::new();
    let reply = tokio::select! {
        result = dispatcher.dispatch(&request, &args.destination, &caller, &mut tx) => {
            match result {
                Ok(response) => response,
                Err(fault) => MessageModel::fault_reply(
                    &request,
                    fault.to_message(Uuid::new_v4().to_string()),
                ),
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, abandoning dispatch");
            reload.abort();
            return Ok(());
        }
    };
    reload.abort();

    info!(
        dest_id = %args.destination,
        message_type = ?tx.message_type,
        fault = ?tx.fault_code,
        retries = tx.retry_count,
        status_error = ?tx.status_error,
        request_size = tx.request_size,
        response_size = tx.response_size,
        elapsed_ms = tx.total_elapsed().as_millis() as u64,
        "Transaction complete"
    );

    println!("{}", SoapWriter::wire().write(&reply)?);
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
