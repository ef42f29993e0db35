//! TLS material and handshake observers.
//!
//! # Architecture
//!
//! ```text
//! realm keystore (PEM)   ─┐
//! realm truststore (PEM) ─┴→ ClientConfig  ──TLS──→  ServerConfig ← directory keystore
//!                               │                        │
//!                       ServerIdentityObserver    TrustAndRecordVerifier
//!                       (server certs seen)       (client certs seen)
//! ```
//!
//! # Modules
//!
//! - [`pem`]: keystore / truststore loading
//! - [`identity`]: subject DN extraction (`CertSubject`)
//! - [`recorder`]: `CertificateLedger` and the directory-side `TrustAndRecordVerifier`
//! - [`observer`]: the client-side `ServerIdentityObserver`
//! - [`generate`]: `rcgen`-backed CA / identity generation for tests and the `tls` CLI

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub mod generate;
pub mod identity;
pub mod observer;
pub mod pem;
pub mod recorder;

pub use generate::{CaParams, CertGenerator, GeneratedCert, LeafCertParams};
pub use identity::CertSubject;
pub use observer::ServerIdentityObserver;
pub use pem::{Keystore, load_certs, load_keystore, load_private_key, load_truststore};
pub use recorder::{CertificateLedger, CertificateRecord, TrustAndRecordVerifier, TrustDecision};

/// The crypto provider used for every client and server config.
#[must_use]
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}
