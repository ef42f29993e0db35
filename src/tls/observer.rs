//! Client-side observation of the directory's identity.
//!
//! Wraps the WebPKI server verifier built from a realm truststore and
//! records every server chain presented to an outbound connection. This is
//! kept apart from the directory's client-certificate ledger so "server
//! identity presented" and "client identity presented" are never counted
//! together.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::tls::recorder::{CertificateLedger, CertificateRecord};
use crate::{Error, Result};

/// Validates the directory's chain against a truststore and records it.
#[derive(Debug)]
pub struct ServerIdentityObserver {
    inner: Arc<WebPkiServerVerifier>,
    ledger: Arc<CertificateLedger>,
}

impl ServerIdentityObserver {
    /// Build an observer over `roots`, recording into `ledger`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the root store cannot back a verifier
    /// (e.g. it is empty).
    pub fn new(roots: Arc<RootCertStore>, ledger: Arc<CertificateLedger>) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, crate::tls::provider())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build server verifier: {e}")))?;
        Ok(Self { inner, ledger })
    }
}

impl ServerCertVerifier for ServerIdentityObserver {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let record = CertificateRecord::from_chain(end_entity, intermediates);
        debug!(subject = %record.subject_dn, server = ?server_name, "server certificate observed");
        self.ledger.record(record);

        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .inspect_err(|e| warn!(server = ?server_name, error = %e, "server certificate rejected"))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
