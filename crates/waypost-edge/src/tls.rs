//! Client-side TLS configuration from PEM files.

use std::{fs, io::BufReader, path::Path, sync::Arc};

use rustls::{ClientConfig, RootCertStore, pki_types::PrivateKeyDer};
use tokio_rustls::TlsConnector;

use crate::error::EdgeError;

/// Build a connector that trusts `server_cert` and authenticates with the
/// client certificate and key.
pub fn connector(
    server_cert: &Path,
    client_cert: &Path,
    client_key: &Path,
) -> Result<TlsConnector, EdgeError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(server_cert)? {
        roots
            .add(cert)
            .map_err(|e| EdgeError::Config(format!("bad trust root: {e}")))?;
    }

    let chain = load_certs(client_cert)?;
    let key = load_key(client_key)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| EdgeError::Config(format!("client auth config: {e}")))?;
    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, EdgeError> {
    let pem = fs::read(path)
        .map_err(|e| EdgeError::Config(format!("read cert {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(&pem[..]))
        .collect::<Result<_, _>>()
        .map_err(|e| EdgeError::Config(format!("parse cert {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(EdgeError::Config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, EdgeError> {
    let pem = fs::read(path)
        .map_err(|e| EdgeError::Config(format!("read key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(&pem[..]))
        .map_err(|e| EdgeError::Config(format!("parse key {}: {e}", path.display())))?
        .ok_or_else(|| EdgeError::Config(format!("no private key in {}", path.display())))
}
