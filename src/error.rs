//! Error types for realm-ldaps

use std::io;

use ldap3_proto::LdapResultCode;
use thiserror::Error;

/// Result type alias for realm-ldaps
pub type Result<T> = std::result::Result<T, Error>;

/// realm-ldaps errors
///
/// A rejected user credential is not an error; it is reported as
/// [`AuthOutcome::Rejected`](crate::auth::AuthOutcome::Rejected).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No security realm with this name
    #[error("Security realm not found: {0}")]
    RealmNotFound(String),

    /// The realm exists but has no usable outbound LDAP connection
    #[error("No outbound LDAP connection bound to realm: {0}")]
    ConnectionNotBound(String),

    /// No security domain with this name
    #[error("Security domain not found: {0}")]
    DomainNotFound(String),

    /// TLS handshake failed (trust rejection, alert, or timeout)
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// Unexpected LDAP result on an operation that must succeed
    #[error("LDAP error {code:?}: {message}")]
    Ldap {
        /// Result code returned by the directory
        code: LdapResultCode,
        /// Diagnostic message returned by the directory
        message: String,
    },

    /// Malformed or unexpected LDAP message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport error (refused, reset, premature EOF)
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify an I/O error raised on a TLS stream.
    ///
    /// tokio-rustls surfaces rustls failures (including alerts received
    /// after the client considers the handshake done) as `InvalidData`
    /// wrapping a `rustls::Error`.
    #[must_use]
    pub fn from_tls_io(err: io::Error) -> Self {
        if let Some(tls) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Self::HandshakeFailed(tls.to_string());
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionRefused => Self::Transport(err.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Whether this error aborted the probe at the TLS layer.
    #[must_use]
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::HandshakeFailed(_))
    }
}
