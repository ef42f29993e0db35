//! Embedded LDAPS directory.
//!
//! A small in-memory directory that speaks LDAP over TLS 1.3, records every
//! client certificate presented to it and serves the bind / search / unbind
//! subset realm authentication uses. It is the peer in integration tests
//! and in `realm-ldaps serve --directory`.
//!
//! ```no_run
//! # async fn demo(keystore: realm_ldaps::tls::Keystore) -> realm_ldaps::Result<()> {
//! use realm_ldaps::directory::{Directory, DirectoryConfig, DirectoryEntry, TransportConfig};
//!
//! let config = DirectoryConfig::builder()
//!     .suffix("dc=jboss,dc=org")
//!     .entry(DirectoryEntry::new("uid=jduke,ou=People,dc=jboss,dc=org").with("uid", "jduke"))
//!     .admin("uid=admin,ou=system", "secret")
//!     .keystore(keystore)
//!     .transport(TransportConfig::client_auth_required())
//!     .build()?;
//! let directory = Directory::start(config).await?;
//! directory.verifier().clear();
//! // ... probe ...
//! directory.stop().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ldap3_proto::LdapCodec;
use rustls::ServerConfig;
use rustls::server::NoServerSessionStorage;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::secrets::Secret;
use crate::tls::{self, Keystore, TrustAndRecordVerifier};
use crate::{Error, Result};

mod handler;
pub mod ldif;

use handler::DirectoryStore;

/// TLS transport of the directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Fail handshakes in which the client presents no certificate.
    #[serde(default)]
    pub need_client_auth: bool,

    /// Request a client certificate.
    #[serde(default)]
    pub want_client_auth: bool,
}

impl TransportConfig {
    /// `need_client_auth = want_client_auth = true`.
    #[must_use]
    pub const fn client_auth_required() -> Self {
        Self {
            need_client_auth: true,
            want_client_auth: true,
        }
    }
}

/// One directory entry. Attribute names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name.
    pub dn: String,
    /// Attributes in insertion order.
    pub attributes: Vec<(String, Vec<String>)>,
}

impl DirectoryEntry {
    /// An entry with no attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Builder form of [`push`](Self::push).
    #[must_use]
    pub fn with(mut self, attr: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(attr, value);
        self
    }

    /// Add a value, merging into an existing attribute of the same name.
    pub fn push(&mut self, attr: impl Into<String>, value: impl Into<String>) {
        let attr = attr.into();
        let value = value.into();
        match self
            .attributes
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(&attr))
        {
            Some((_, values)) => values.push(value),
            None => self.attributes.push((attr, vec![value])),
        }
    }

    /// All values of `attr`.
    #[must_use]
    pub fn values(&self, attr: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attr))
            .map_or(&[], |(_, values)| values.as_slice())
    }
}

/// Everything needed to start a [`Directory`].
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Partition suffix, e.g. `dc=jboss,dc=org`.
    pub suffix: String,
    /// Entries below (and including) the suffix.
    pub entries: Vec<DirectoryEntry>,
    /// Administrator DN.
    pub admin_dn: String,
    /// Administrator password.
    pub admin_password: Secret,
    /// Listen address; port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Directory TLS identity.
    pub keystore: Keystore,
    /// Client-auth settings.
    pub transport: TransportConfig,
    /// Limit on the TLS handshake of an inbound connection.
    pub handshake_timeout: Duration,
}

/// Default limit on an inbound TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

impl DirectoryConfig {
    /// Start building a config.
    #[must_use]
    pub fn builder() -> DirectoryConfigBuilder {
        DirectoryConfigBuilder::default()
    }
}

/// Builder for [`DirectoryConfig`].
#[derive(Debug, Default)]
pub struct DirectoryConfigBuilder {
    suffix: Option<String>,
    entries: Vec<DirectoryEntry>,
    admin_dn: Option<String>,
    admin_password: Option<Secret>,
    bind_addr: Option<SocketAddr>,
    keystore: Option<Keystore>,
    transport: TransportConfig,
    handshake_timeout: Option<Duration>,
}

impl DirectoryConfigBuilder {
    /// Partition suffix. A bare context entry is created for it unless one
    /// is added explicitly.
    #[must_use]
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Add one entry.
    #[must_use]
    pub fn entry(mut self, entry: DirectoryEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add the entries of an LDIF document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the LDIF is malformed.
    pub fn ldif(mut self, text: &str) -> Result<Self> {
        self.entries.extend(ldif::parse(text)?);
        Ok(self)
    }

    /// Administrator credential.
    #[must_use]
    pub fn admin(mut self, dn: impl Into<String>, password: impl Into<Secret>) -> Self {
        self.admin_dn = Some(dn.into());
        self.admin_password = Some(password.into());
        self
    }

    /// Listen address. Defaults to `127.0.0.1:0`.
    #[must_use]
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Directory TLS identity.
    #[must_use]
    pub fn keystore(mut self, keystore: Keystore) -> Self {
        self.keystore = Some(keystore);
        self
    }

    /// Client-auth settings.
    #[must_use]
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Limit on inbound TLS handshakes. Defaults to 10s.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the suffix, admin credential, or keystore
    /// is missing, or an entry lies outside the suffix.
    pub fn build(self) -> Result<DirectoryConfig> {
        let suffix = self
            .suffix
            .ok_or_else(|| Error::Config("directory suffix is required".to_string()))?;
        let (Some(admin_dn), Some(admin_password)) = (self.admin_dn, self.admin_password) else {
            return Err(Error::Config(
                "directory admin DN and password are required".to_string(),
            ));
        };
        let keystore = self
            .keystore
            .ok_or_else(|| Error::Config("directory keystore is required".to_string()))?;

        let norm_suffix = handler::normalize_dn(&suffix);
        let mut entries = self.entries;
        if let Some(outside) = entries.iter().find(|e| {
            let dn = handler::normalize_dn(&e.dn);
            dn != norm_suffix && !dn.ends_with(&format!(",{norm_suffix}"))
        }) {
            return Err(Error::Config(format!(
                "entry '{}' is outside suffix '{suffix}'",
                outside.dn
            )));
        }
        if !entries
            .iter()
            .any(|e| handler::normalize_dn(&e.dn) == norm_suffix)
        {
            entries.insert(0, DirectoryEntry::new(suffix.clone()));
        }

        Ok(DirectoryConfig {
            suffix,
            entries,
            admin_dn,
            admin_password,
            bind_addr: self
                .bind_addr
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0))),
            keystore,
            transport: self.transport,
            handshake_timeout: self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
        })
    }
}

/// A running directory. Dropping it without [`stop`](Self::stop) also
/// shuts the accept loop down.
#[derive(Debug)]
pub struct Directory {
    local_addr: SocketAddr,
    verifier: Arc<TrustAndRecordVerifier>,
    shutdown: watch::Sender<bool>,
    accept_loop: JoinHandle<()>,
}

impl Directory {
    /// Bind the listener and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the TLS config cannot be built or the
    /// admin password cannot be resolved, and `Error::Io` if the address
    /// cannot be bound.
    pub async fn start(config: DirectoryConfig) -> Result<Self> {
        let verifier = Arc::new(TrustAndRecordVerifier::new(
            config.transport.want_client_auth,
            config.transport.need_client_auth,
        ));
        let acceptor = TlsAcceptor::from(Arc::new(server_config(&config, Arc::clone(&verifier))?));
        let store = Arc::new(DirectoryStore::new(
            config.entries,
            &config.admin_dn,
            config.admin_password.expose()?,
        ));

        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            %local_addr,
            suffix = %config.suffix,
            need_client_auth = config.transport.need_client_auth,
            want_client_auth = config.transport.want_client_auth,
            "directory listening"
        );

        let accept_loop = tokio::spawn(accept_loop(
            listener,
            acceptor,
            store,
            config.handshake_timeout,
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            verifier,
            shutdown,
            accept_loop,
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ldaps://ip:port` URL of this directory.
    #[must_use]
    pub fn ldaps_url(&self) -> String {
        format!("ldaps://{}", self.local_addr)
    }

    /// The client-certificate recorder.
    #[must_use]
    pub fn verifier(&self) -> &Arc<TrustAndRecordVerifier> {
        &self.verifier
    }

    /// Stop accepting and wait for the accept loop to exit. Connections
    /// already being served finish on their own.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.accept_loop.await {
            warn!(error = %e, "directory accept loop panicked");
        }
        info!(local_addr = %self.local_addr, "directory stopped");
    }
}

fn server_config(config: &DirectoryConfig, verifier: Arc<TrustAndRecordVerifier>) -> Result<ServerConfig> {
    let mut server = ServerConfig::builder_with_provider(tls::provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS server config error: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(config.keystore.chain.clone(), config.keystore.key.clone_key())
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;
    server.session_storage = Arc::new(NoServerSessionStorage {});
    server.send_tls13_tickets = 0;
    Ok(server)
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    store: Arc<DirectoryStore>,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let peer = peer.to_string();
                    match tokio::time::timeout(handshake_timeout, acceptor.accept(tcp)).await {
                        Ok(Ok(stream)) => {
                            debug!(%peer, "TLS session established");
                            handler::serve(Framed::new(stream, LdapCodec::default()), store, peer).await;
                        }
                        Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake rejected"),
                        Err(_) => debug!(%peer, ?handshake_timeout, "TLS handshake timed out"),
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rustls::server::danger::ClientCertVerifier;

    use super::*;
    use crate::tls::{CaParams, CertGenerator, LeafCertParams};

    fn keystore() -> Keystore {
        let ca = CertGenerator::init_ca(&CaParams { cn: "CA", validity_days: 1 }).unwrap();
        let leaf = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn: "ldaps",
                ou: None,
                sans: vec!["127.0.0.1".to_string()],
                validity_days: 1,
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        let chain = rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
            .unwrap()
            .unwrap();
        Keystore { chain, key }
    }

    #[test]
    fn entry_attributes_merge_case_insensitively() {
        let entry = DirectoryEntry::new("uid=a")
            .with("objectClass", "top")
            .with("objectclass", "person");
        assert_eq!(entry.values("OBJECTCLASS"), ["top", "person"]);
        assert!(entry.values("missing").is_empty());
    }

    #[test]
    fn builder_requires_keystore() {
        let result = DirectoryConfig::builder()
            .suffix("dc=example")
            .admin("uid=admin,ou=system", "secret")
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn builder_adds_context_entry_and_rejects_outsiders() {
        let config = DirectoryConfig::builder()
            .suffix("dc=jboss,dc=org")
            .entry(DirectoryEntry::new("ou=People,dc=jboss,dc=org"))
            .admin("uid=admin,ou=system", "secret")
            .keystore(keystore())
            .build()
            .unwrap();
        assert_eq!(config.entries[0].dn, "dc=jboss,dc=org");
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);

        let outside = DirectoryConfig::builder()
            .suffix("dc=jboss,dc=org")
            .entry(DirectoryEntry::new("dc=other"))
            .admin("uid=admin,ou=system", "secret")
            .keystore(keystore())
            .build();
        assert!(outside.is_err());
    }

    #[tokio::test]
    async fn start_then_stop() {
        // GIVEN: a directory demanding client auth
        let config = DirectoryConfig::builder()
            .suffix("dc=example")
            .admin("uid=admin,ou=system", "secret")
            .keystore(keystore())
            .transport(TransportConfig::client_auth_required())
            .build()
            .unwrap();

        // WHEN: started
        let directory = Directory::start(config).await.unwrap();

        // THEN: it listens on a real port, has recorded nothing, and stops cleanly
        assert_ne!(directory.local_addr().port(), 0);
        assert!(directory.ldaps_url().starts_with("ldaps://127.0.0.1:"));
        assert_eq!(directory.verifier().count(), 0);
        assert!(directory.verifier().client_auth_mandatory());
        directory.stop().await;
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_handshake_timeout() {
        use tokio::io::AsyncReadExt;

        // GIVEN: a directory with a short handshake limit
        let config = DirectoryConfig::builder()
            .suffix("dc=example")
            .admin("uid=admin,ou=system", "secret")
            .keystore(keystore())
            .handshake_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let directory = Directory::start(config).await.unwrap();

        // WHEN: a client connects and never sends a ClientHello
        let mut tcp = tokio::net::TcpStream::connect(directory.local_addr()).await.unwrap();

        // THEN: the directory closes the connection
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), tcp.read(&mut buf))
            .await
            .expect("connection still open after the handshake timeout");
        assert!(matches!(read, Ok(0) | Err(_)));
        directory.stop().await;
    }
}
