//! Certificate subject extraction.
//!
//! Parses a DER-encoded X.509 certificate and extracts the subject
//! distinguished name used by the recorders and in log events.

use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

/// Subject fields of a presented certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertSubject {
    /// Full subject DN in RFC 4514 form, e.g. `CN=JBAS, OU=realm`.
    pub dn: String,

    /// Common Name, if present.
    pub common_name: Option<String>,
}

impl CertSubject {
    /// Parse a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Config(format!("Failed to parse certificate: {e}")))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);

        Ok(Self {
            dn: cert.subject().to_string(),
            common_name,
        })
    }

    /// Subject DN of `der`, or an empty string if it does not parse.
    #[must_use]
    pub fn dn_lossy(der: &[u8]) -> String {
        Self::from_der(der).map(|s| s.dn).unwrap_or_default()
    }
}
