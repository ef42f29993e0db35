//! Security realms, outbound LDAP connections and security domains.
//!
//! These are the management-model resources. A [`SecurityRealm`] that
//! authenticates against LDAP names an [`OutboundLdapConnection`]; that
//! connection names the realm supplying its SSL material. Resolution turns
//! the chain into one immutable [`ConnectionProfile`].
//!
//! ```yaml
//! security_realms:
//!   - name: ssl-conf-realm
//!     truststore: { path: /etc/realm-ldaps/jbas.truststore }
//!     server_identity: { path: /etc/realm-ldaps/jbas.keystore }
//!   - name: ldaps-authn-realm-always
//!     ldap:
//!       connection: test-ldaps-always
//!       base_dn: "ou=People,dc=jboss,dc=org"
//!       recursive: true
//!       username_attribute: uid
//! outbound_connections:
//!   - name: test-ldaps-always
//!     url: "ldaps://127.0.0.1:10636"
//!     search_dn: "uid=admin,ou=system"
//!     search_credential: "env:LDAP_ADMIN_PASSWORD"
//!     security_realm: ssl-conf-realm
//!     always_send_client_cert: true
//! ```

use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use serde::{Deserialize, Serialize};

use crate::secrets::Secret;
use crate::tls::Keystore;

pub mod management;

pub use management::ManagementModel;

/// A PEM keystore or truststore reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRef {
    /// Path to the PEM file.
    pub path: String,

    /// Store password. PEM stores are unencrypted; kept for parity with
    /// the management API and ignored with a warning.
    #[serde(default)]
    pub password: Option<Secret>,
}

/// LDAP-backed authentication of a realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapAuthentication {
    /// Name of the outbound LDAP connection.
    pub connection: String,

    /// Base DN under which users are searched.
    pub base_dn: String,

    /// Search the whole subtree (`true`) or one level below `base_dn`.
    #[serde(default)]
    pub recursive: bool,

    /// Attribute holding the username.
    #[serde(default = "default_username_attribute")]
    pub username_attribute: String,
}

fn default_username_attribute() -> String {
    "uid".to_string()
}

/// Properties-file authorization of a realm. Stored, not evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Path of the roles properties file.
    pub path: String,

    /// Base directory `path` is relative to.
    #[serde(default)]
    pub relative_to: Option<String>,
}

/// A named bundle of trust / identity material and authentication policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRealm {
    /// Unique realm name.
    pub name: String,

    /// CA certificates trusted for outbound TLS.
    #[serde(default)]
    pub truststore: Option<StoreRef>,

    /// The realm's own TLS identity (certificate chain + key).
    #[serde(default)]
    pub server_identity: Option<StoreRef>,

    /// LDAP authentication, if this realm authenticates against a directory.
    #[serde(default)]
    pub ldap: Option<LdapAuthentication>,

    /// Authorization source.
    #[serde(default)]
    pub authorization: Option<Authorization>,
}

impl SecurityRealm {
    /// A realm with no material and no authentication.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            truststore: None,
            server_identity: None,
            ldap: None,
            authorization: None,
        }
    }
}

/// An outbound LDAP connection as configured through the management model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundLdapConnection {
    /// Unique connection name.
    pub name: String,

    /// `ldaps://host:port` URL of the directory.
    pub url: String,

    /// DN used for the manager (search) bind.
    pub search_dn: String,

    /// Credential for the manager bind. Supports `env:VAR`.
    pub search_credential: Secret,

    /// Realm supplying the SSL identity and truststore.
    #[serde(default)]
    pub security_realm: Option<String>,

    /// Present the realm identity on every connection, including the one
    /// used to verify a user's own credential.
    #[serde(default)]
    pub always_send_client_cert: bool,

    /// Upper bound on TCP connect plus TLS handshake.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Login module of a security domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum LoginModule {
    /// Delegate authentication straight to a security realm.
    RealmDirect {
        /// Realm name.
        realm: String,
    },
}

/// A security domain used by deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityDomain {
    /// Unique domain name.
    pub name: String,

    /// How the domain authenticates.
    pub login_module: LoginModule,
}

impl SecurityDomain {
    /// A domain delegating to `realm`.
    pub fn realm_direct(name: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            login_module: LoginModule::RealmDirect {
                realm: realm.into(),
            },
        }
    }

    /// The realm this domain authenticates against.
    #[must_use]
    pub fn realm(&self) -> &str {
        match &self.login_module {
            LoginModule::RealmDirect { realm } => realm,
        }
    }
}

/// How to locate a user entry in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSearch {
    /// Search base.
    pub base_dn: String,
    /// Subtree (`true`) or one-level search.
    pub recursive: bool,
    /// Attribute matched against the username.
    pub username_attribute: String,
}

/// Everything needed to talk to the directory for one realm.
///
/// Immutable once resolved; a new profile is resolved per request.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    /// Connection name.
    pub name: String,
    /// Realm the profile was resolved for.
    pub realm: String,
    /// Directory host from the URL.
    pub host: String,
    /// Directory port from the URL (636 if absent).
    pub port: u16,
    /// Manager DN.
    pub search_dn: String,
    /// Manager credential.
    pub search_credential: Secret,
    /// Realm that supplied the SSL material.
    pub ssl_realm: String,
    /// See [`OutboundLdapConnection::always_send_client_cert`].
    pub always_send_client_cert: bool,
    /// Connect + handshake bound.
    pub handshake_timeout: Duration,
    /// User lookup settings.
    pub user_search: UserSearch,
    /// The SSL realm's identity, if it has one.
    pub identity: Option<Keystore>,
    /// The SSL realm's trust anchors.
    pub trust: Arc<RootCertStore>,
}
