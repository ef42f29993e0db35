//! Keystore and truststore loading.
//!
//! All material is PEM. A keystore is a certificate chain (leaf first)
//! followed by its private key in the same file; a truststore is one or
//! more CA certificates.

use std::fs;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, warn};

use crate::secrets::Secret;
use crate::{Error, Result};

/// A TLS identity: certificate chain plus private key.
#[derive(Debug)]
pub struct Keystore {
    /// Certificate chain, leaf first.
    pub chain: Vec<CertificateDer<'static>>,
    /// Private key matching the leaf.
    pub key: PrivateKeyDer<'static>,
}

impl Clone for Keystore {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains no private key, or
/// the key format is unsupported.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::Config(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::Config(format!("No private key found in '{path}'")))
}

/// Load a keystore (chain + key) from a single PEM file.
///
/// # Errors
///
/// Returns an error if either the chain or the key is missing.
pub fn load_keystore(path: &str, password: Option<&Secret>) -> Result<Keystore> {
    ignore_password(path, password);
    let chain = load_certs(path)?;
    let key = load_private_key(path)?;
    debug!(path, chain_len = chain.len(), "keystore loaded");
    Ok(Keystore { chain, key })
}

/// Load a truststore into a rustls root store.
///
/// # Errors
///
/// Returns an error if the file holds no certificates or a certificate is
/// not a usable trust anchor.
pub fn load_truststore(path: &str, password: Option<&Secret>) -> Result<Arc<RootCertStore>> {
    ignore_password(path, password);
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("Failed to add '{path}' to trust store: {e}")))?;
    }
    debug!(path, anchors = roots.len(), "truststore loaded");
    Ok(Arc::new(roots))
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))
}

fn ignore_password(path: &str, password: Option<&Secret>) {
    if password.is_some_and(|p| !p.is_empty()) {
        warn!(path, "PEM stores are not encrypted, ignoring configured password");
    }
}
