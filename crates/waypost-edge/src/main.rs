//! Waypost edge client binary.
//!
//! ```bash
//! waypost-edge \
//!     --serv-cert-file ca.pem \
//!     --client-cert-file edge.pem --client-key-file edge-key.pem \
//!     --client-uuid 00112233445566778899aabbccddeeff \
//!     --serv-host telemetry.example.net
//! ```
//!
//! Exit status is nonzero on startup errors; once running the client
//! reconnects forever and never exits voluntarily.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use waypost_edge::{
    EdgeClient, EdgeConfig, SCAN_CHANNEL_CAP, SubprocessRunner, scanner, tls,
};
use waypost_proto::Uuid;

/// Waypost edge telemetry client
#[derive(Parser, Debug)]
#[command(name = "waypost-edge")]
#[command(about = "Beacon-scanning edge client for the Waypost pipeline")]
#[command(version)]
struct Args {
    /// Trusted server certificate file (PEM)
    #[arg(long = "serv-cert-file")]
    serv_cert_file: PathBuf,

    /// Client certificate file (PEM)
    #[arg(long = "client-cert-file")]
    client_cert_file: PathBuf,

    /// Client private key file (PEM)
    #[arg(long = "client-key-file")]
    client_key_file: PathBuf,

    /// UUID for this node, no dashes
    #[arg(long = "client-uuid")]
    client_uuid: String,

    /// Server host
    #[arg(long = "serv-host", default_value = "localhost")]
    serv_host: String,

    /// Server port
    #[arg(long = "serv-port", default_value_t = waypost_proto::DEFAULT_PORT)]
    serv_port: u16,

    /// Beacon-list refresh period in milliseconds
    #[arg(long = "timeout-beacon-refresh", default_value_t = 60_000)]
    timeout_beacon_refresh: u64,

    /// Maximum batch residency in milliseconds before a flush
    #[arg(long = "timeout-beacon", default_value_t = 10_000)]
    timeout_beacon: u64,

    /// Enable verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let uuid: Uuid = args.client_uuid.parse()?;
    let connector =
        tls::connector(&args.serv_cert_file, &args.client_cert_file, &args.client_key_file)?;

    let cancel = CancellationToken::new();

    // The capture handle owns the radio subprocesses; keep it alive so they
    // are killed on exit
    let mut capture = scanner::spawn_radio()?;
    let stdout = capture.take_stdout()?;
    let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAP);
    let scanner_task = tokio::spawn(scanner::run_scanner(stdout, tx, cancel.clone()));

    let config = EdgeConfig {
        uuid,
        host: args.serv_host,
        port: args.serv_port,
        beacon_refresh_interval: Duration::from_millis(args.timeout_beacon_refresh.max(1)),
        batch_flush_interval: Duration::from_millis(args.timeout_beacon.max(1)),
    };
    let client = EdgeClient::new(config, rx, Arc::new(SubprocessRunner), cancel.clone());

    tokio::select! {
        result = client.run(connector) => {
            result?;
        },
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received, shutting down");
        },
    }

    cancel.cancel();
    scanner_task.await?;
    drop(capture);
    Ok(())
}
