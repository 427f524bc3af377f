//! Waypost ingest server binary.
//!
//! ```bash
//! waypost-server \
//!     --serv-cert server.pem --serv-key server-key.pem \
//!     --db-driver-name memory --db-datasource-name ""
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use waypost_server::{FleetMonitor, MonitorConfig, Server, ServerConfig, TracingSink};

/// Waypost beacon ingest server
#[derive(Parser, Debug)]
#[command(name = "waypost-server")]
#[command(about = "Ingest server for Waypost edge telemetry")]
#[command(version)]
struct Args {
    /// x509 server public certificate file path (also the client trust root)
    #[arg(long = "serv-cert")]
    serv_cert: PathBuf,

    /// x509 server private key file path
    #[arg(long = "serv-key")]
    serv_key: PathBuf,

    /// Database driver name
    #[arg(long = "db-driver-name")]
    db_driver_name: String,

    /// Database datasource name, may be multiple tokens
    #[arg(long = "db-datasource-name")]
    db_datasource_name: String,

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

    let store = waypost_store::open(&args.db_driver_name, &args.db_datasource_name)?;

    let config = ServerConfig {
        bind_address: format!("0.0.0.0:{}", waypost_proto::DEFAULT_PORT),
        cert_path: args.serv_cert,
        key_path: args.serv_key,
    };
    let server = Server::bind(config, Arc::clone(&store)).await?;
    tracing::info!("listening on {}", server.local_addr()?);

    let cancel = CancellationToken::new();

    let monitor = FleetMonitor::new(store, Arc::new(TracingSink), MonitorConfig::default());
    let monitor_task = tokio::spawn(monitor.run(cancel.clone()));

    let server_cancel = cancel.clone();
    let server_task = tokio::spawn(server.run(server_cancel));

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    cancel.cancel();

    server_task.await??;
    monitor_task.await?;
    Ok(())
}
