//! Outbound LDAPS connections.
//!
//! An [`OutboundConnector`] turns a resolved [`ConnectionProfile`] into two
//! rustls client configs, one carrying the realm identity and one carrying
//! trust material only, and picks between them per [`ConnectionPurpose`]
//! according to the profile's [`ClientCertPolicy`].
//!
//! TLS 1.3 only. Session resumption is disabled so every connection runs a
//! full handshake and every presented certificate reaches the peer's
//! verifier.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::client::{ResolvesClientCert, Resumption};
use rustls::pki_types::ServerName;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::realm::ConnectionProfile;
use crate::tls::{self, CertificateLedger, CertificateRecord, Keystore, ServerIdentityObserver};
use crate::{Error, Result};

pub mod ldap;

pub use ldap::LdapSession;

/// Why a connection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPurpose {
    /// Manager connection bound with the search DN.
    Search,
    /// Connection on which the user's own credential is bound.
    UserVerification,
}

impl fmt::Display for ConnectionPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Search => f.write_str("search"),
            Self::UserVerification => f.write_str("user-verification"),
        }
    }
}

/// When the realm identity is presented.
///
/// TLS never allows a client certificate the server did not request, so
/// "always" means "offered on every connection of the profile", not
/// "presented to a server that does not ask".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCertPolicy {
    always: bool,
}

impl ClientCertPolicy {
    /// Policy for a profile's `always_send_client_cert` value.
    #[must_use]
    pub const fn new(always_send_client_cert: bool) -> Self {
        Self {
            always: always_send_client_cert,
        }
    }

    /// Whether connections opened for `purpose` carry the realm identity.
    #[must_use]
    pub const fn offers_identity(&self, purpose: ConnectionPurpose) -> bool {
        match purpose {
            ConnectionPurpose::Search => true,
            ConnectionPurpose::UserVerification => self.always,
        }
    }

    /// Whether a certificate is sent in a handshake for `purpose` in which
    /// the server did or did not request one.
    ///
    /// Decision table only: [`OutboundConnector::connect`] picks the config
    /// through [`offers_identity`](Self::offers_identity) and rustls applies
    /// the `server_requested` half by calling the resolver only when asked.
    #[must_use]
    pub const fn presents(&self, purpose: ConnectionPurpose, server_requested: bool) -> bool {
        server_requested && self.offers_identity(purpose)
    }

    /// Whether the user bind reuses the client-authenticated search
    /// connection instead of opening a new one.
    #[must_use]
    pub const fn reuses_search_connection(&self) -> bool {
        self.always
    }
}

/// Client certificate resolver that notes each time the identity is sent.
#[derive(Debug)]
struct PresentingResolver {
    key: Arc<CertifiedKey>,
    presented: Arc<CertificateLedger>,
}

impl ResolvesClientCert for PresentingResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        if let Some((leaf, rest)) = self.key.cert.split_first() {
            let record = CertificateRecord::from_chain(leaf, rest);
            debug!(subject = %record.subject_dn, "presenting client identity");
            self.presented.record(record);
        }
        Some(Arc::clone(&self.key))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Opens TLS connections to the directory on behalf of one profile.
pub struct OutboundConnector {
    profile: ConnectionProfile,
    policy: ClientCertPolicy,
    with_identity: Arc<ClientConfig>,
    trust_only: Arc<ClientConfig>,
}

impl fmt::Debug for OutboundConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundConnector")
            .field("connection", &self.profile.name)
            .field("host", &self.profile.host)
            .field("port", &self.profile.port)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl OutboundConnector {
    /// Build the client configs for `profile`.
    ///
    /// Server chains are recorded into `server_identities`; each time the
    /// realm identity is sent it is recorded into `presented`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the truststore is empty or the identity
    /// key cannot be loaded.
    pub fn new(
        profile: ConnectionProfile,
        server_identities: Arc<CertificateLedger>,
        presented: Arc<CertificateLedger>,
    ) -> Result<Self> {
        let observer: Arc<dyn ServerCertVerifier> = Arc::new(ServerIdentityObserver::new(
            Arc::clone(&profile.trust),
            server_identities,
        )?);

        let trust_only = {
            let mut config = client_builder()?
                .dangerous()
                .with_custom_certificate_verifier(Arc::clone(&observer))
                .with_no_client_auth();
            config.resumption = Resumption::disabled();
            Arc::new(config)
        };

        let with_identity = match &profile.identity {
            Some(identity) => {
                let resolver = PresentingResolver {
                    key: certified_key(identity)?,
                    presented,
                };
                let mut config = client_builder()?
                    .dangerous()
                    .with_custom_certificate_verifier(observer)
                    .with_client_cert_resolver(Arc::new(resolver));
                config.resumption = Resumption::disabled();
                Arc::new(config)
            }
            None => {
                warn!(
                    connection = %profile.name,
                    ssl_realm = %profile.ssl_realm,
                    "SSL realm has no identity; no client certificate will be presented"
                );
                Arc::clone(&trust_only)
            }
        };

        Ok(Self {
            policy: ClientCertPolicy::new(profile.always_send_client_cert),
            profile,
            with_identity,
            trust_only,
        })
    }

    /// The client certificate policy in force.
    #[must_use]
    pub fn policy(&self) -> ClientCertPolicy {
        self.policy
    }

    /// Connect and complete the TLS handshake for `purpose`.
    ///
    /// # Errors
    ///
    /// - `Error::HandshakeFailed` on trust rejection, a TLS alert, or when
    ///   connect plus handshake exceed the profile's timeout
    /// - `Error::Transport` if the TCP connection cannot be established
    pub async fn connect(&self, purpose: ConnectionPurpose) -> Result<TlsStream<TcpStream>> {
        let offers_identity = self.policy.offers_identity(purpose);
        let config = if offers_identity {
            Arc::clone(&self.with_identity)
        } else {
            Arc::clone(&self.trust_only)
        };
        let server_name = ServerName::try_from(self.profile.host.clone())
            .map_err(|e| Error::Config(format!("Invalid server name '{}': {e}", self.profile.host)))?;
        let connector = TlsConnector::from(config);

        debug!(
            connection = %self.profile.name,
            %purpose,
            offers_identity,
            host = %self.profile.host,
            port = self.profile.port,
            "opening LDAPS connection"
        );

        let handshake = async {
            let tcp = TcpStream::connect((self.profile.host.as_str(), self.profile.port))
                .await
                .map_err(Error::from_tls_io)?;
            connector
                .connect(server_name, tcp)
                .await
                .map_err(Error::from_tls_io)
        };

        let timeout = self.profile.handshake_timeout;
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(stream)) => {
                info!(connection = %self.profile.name, %purpose, "TLS handshake complete");
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!(connection = %self.profile.name, %purpose, error = %e, "TLS connection failed");
                Err(e)
            }
            Err(_) => {
                warn!(connection = %self.profile.name, %purpose, ?timeout, "TLS handshake timed out");
                Err(Error::HandshakeFailed(format!(
                    "handshake with {}:{} timed out after {timeout:?}",
                    self.profile.host, self.profile.port
                )))
            }
        }
    }

    /// Connect for `purpose` and wrap the stream in an LDAP session.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn open_session(&self, purpose: ConnectionPurpose) -> Result<LdapSession> {
        let stream = self.connect(purpose).await?;
        Ok(LdapSession::new(stream, purpose))
    }
}

fn client_builder()
-> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>> {
    ClientConfig::builder_with_provider(tls::provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS client config error: {e}")))
}

fn certified_key(identity: &Keystore) -> Result<Arc<CertifiedKey>> {
    let signing_key = tls::provider()
        .key_provider
        .load_private_key(identity.key.clone_key())
        .map_err(|e| Error::Config(format!("Unusable identity key: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(identity.chain.clone(), signing_key)))
}
