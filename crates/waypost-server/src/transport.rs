//! Mutually-authenticated TLS listener.
//!
//! Wraps a TCP listener in a `tokio-rustls` acceptor configured to require
//! and verify client certificates. The trust root for client verification
//! is loaded from the same certificate file the server presents, matching
//! the deployment convention where one private CA signs both sides.

use std::{fs, io::BufReader, net::SocketAddr, path::Path, sync::Arc};

use rustls::{
    RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, server::TlsStream};

use crate::error::ServerError;

/// TLS listener handing out authenticated streams.
pub struct TlsTransport {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsTransport {
    /// Bind a listener using PEM certificate and key files.
    pub async fn bind(
        addr: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, ServerError> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let mut client_roots = RootCertStore::empty();
        for cert in &certs {
            client_roots
                .add(cert.clone())
                .map_err(|e| ServerError::Config(format!("bad trust root: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(client_roots))
            .build()
            .map_err(|e| ServerError::Config(format!("client verifier: {e}")))?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("bind {addr}: {e}")))?;

        tracing::info!(%addr, "TLS transport bound");
        Ok(Self { listener, acceptor: TlsAcceptor::from(Arc::new(config)) })
    }

    /// Accept one connection and complete its TLS handshake.
    ///
    /// An unauthenticated peer fails here and never reaches the ingest
    /// state machine.
    pub async fn accept(&self) -> Result<(TlsStream<TcpStream>, SocketAddr), ServerError> {
        let (tcp, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| ServerError::Transport(format!("accept: {e}")))?;
        let stream = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| ServerError::Transport(format!("TLS handshake with {peer}: {e}")))?;
        Ok((stream, peer))
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("local address: {e}")))
    }
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let pem = fs::read(path)
        .map_err(|e| ServerError::Config(format!("read cert {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(&pem[..]))
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Config(format!("parse cert {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

/// Load a PEM private key.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let pem = fs::read(path)
        .map_err(|e| ServerError::Config(format!("read key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(&pem[..]))
        .map_err(|e| ServerError::Config(format!("parse key {}: {e}", path.display())))?
        .ok_or_else(|| ServerError::Config(format!("no private key in {}", path.display())))
}
