//! TLS configuration and certificate loading.

use crate::config::TlsSettings;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Build the server-side rustls configuration from PEM files.
///
/// The root CA file must load even when client certificates are not
/// verified.
pub fn load_server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(ring::default_provider());

    let roots = load_roots(&settings.ca_file)?;
    let certs = load_certs(&settings.cert_file)?;
    let key = load_key(&settings.key_file)?;

    debug!(
        roots = roots.len(),
        chain = certs.len(),
        verify_client = settings.verify_client,
        "Loaded TLS material"
    );

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(TlsError::Rustls)?;

    let builder = if settings.verify_client {
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(TlsError::Verifier)?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(TlsError::Rustls)?;

    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::FileRead(path.to_path_buf(), e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::FileRead(path.to_path_buf(), e))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(TlsError::Rustls)?;
    }
    Ok(roots)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| TlsError::FileRead(path.to_path_buf(), e))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// TLS setup errors
#[derive(Debug)]
pub enum TlsError {
    FileRead(PathBuf, std::io::Error),
    NoCertificates(PathBuf),
    NoPrivateKey(PathBuf),
    Verifier(rustls::server::VerifierBuilderError),
    Rustls(rustls::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::FileRead(path, e) => {
                write!(f, "Failed to read '{}': {}", path.display(), e)
            }
            TlsError::NoCertificates(path) => {
                write!(f, "No certificates found in '{}'", path.display())
            }
            TlsError::NoPrivateKey(path) => {
                write!(f, "No private key found in '{}'", path.display())
            }
            TlsError::Verifier(e) => write!(f, "Client verifier setup failed: {}", e),
            TlsError::Rustls(e) => write!(f, "TLS configuration failed: {}", e),
        }
    }
}

impl std::error::Error for TlsError {}
