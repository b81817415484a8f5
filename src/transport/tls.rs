//! TLS configuration for `wss://`

use super::TransportError;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(format!("{}: {}", context, e))
}

/// Load TLS certificates from PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| tls_error(&format!("Failed to open cert file {}", path.display()), e))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error("Failed to parse PEM certificates", e))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load TLS private key from PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| tls_error(&format!("Failed to open key file {}", path.display()), e))?,
    );
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| tls_error("Failed to parse PEM private key", e))?
        .ok_or_else(|| TransportError::Tls(format!("No private key found in {}", path.display())))
}

/// Server side TLS from a PEM certificate chain and key
pub fn server_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("Unsupported protocol versions", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_error("Failed to build TLS server config", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client side TLS trusting the webpki roots plus an optional extra CA
pub fn client_connector(extra_ca: Option<&Path>) -> Result<TlsConnector, TransportError> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(path) = extra_ca {
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| tls_error("Invalid CA certificate", e))?;
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("Unsupported protocol versions", e))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
