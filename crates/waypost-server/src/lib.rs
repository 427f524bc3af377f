//! Waypost ingest server.
//!
//! Accepts mutually-authenticated TLS connections from edge nodes and runs
//! one [`Ingestor`] state machine per connection. Connection tasks share
//! nothing but the store handle and the process-wide shutdown token; the
//! [`FleetMonitor`] runs beside the accept loop and watches the error
//! ledger and edge liveness.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod control;
mod error;
mod ingest;
mod ledger;
mod monitor;
mod transport;

use std::sync::Arc;

pub use control::ControlDispatcher;
pub use error::ServerError;
pub use ingest::Ingestor;
pub use ledger::{DESYNC_COLLAPSE_WINDOW, ErrorLedger};
pub use monitor::{FleetMonitor, MonitorConfig, NotificationSink, TracingSink};
use tokio_util::sync::CancellationToken;
pub use transport::{TlsTransport, load_certs, load_key};
use waypost_store::Store;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:32969`.
    pub bind_address: String,
    /// Path to the PEM server certificate (also the client trust root).
    pub cert_path: std::path::PathBuf,
    /// Path to the PEM server private key.
    pub key_path: std::path::PathBuf,
}

/// The ingest server: TLS listener plus per-connection tasks.
pub struct Server {
    transport: TlsTransport,
    ingestor: Ingestor,
}

impl Server {
    /// Bind the listener and prepare the shared ingest context.
    pub async fn bind(config: ServerConfig, store: Arc<dyn Store>) -> Result<Self, ServerError> {
        let transport =
            TlsTransport::bind(&config.bind_address, &config.cert_path, &config.key_path).await?;
        Ok(Self { transport, ingestor: Ingestor::new(store) })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Accept connections until the token is cancelled.
    ///
    /// Each accepted connection runs on its own task with a child token, so
    /// shutdown reaches every suspension point. In-flight responses are
    /// best-effort: a cancelled task closes its socket without a partial
    /// frame.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        tracing::info!("ingest server accepting connections");
        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("shutdown signal received, stopping accept loop");
                    return Ok(());
                },
                accepted = self.transport.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "connection authenticated");
                    let ingestor = self.ingestor.clone();
                    let child = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = ingestor.serve_connection(stream, child).await {
                            tracing::warn!(%peer, error = %err, "connection failed");
                        }
                    });
                },
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    tracing::warn!(error = %err, "accept failed");
                },
            }
        }
    }
}
