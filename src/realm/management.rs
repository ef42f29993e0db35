//! The management model: CRUD over realms, connections and domains, and
//! realm → connection profile resolution.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::realm::{
    ConnectionProfile, OutboundLdapConnection, SecurityDomain, SecurityRealm, UserSearch,
};
use crate::tls;
use crate::{Error, Result};

const LDAPS_DEFAULT_PORT: u16 = 636;

#[derive(Debug, Default)]
struct Model {
    realms: HashMap<String, SecurityRealm>,
    connections: HashMap<String, OutboundLdapConnection>,
    domains: HashMap<String, SecurityDomain>,
}

/// In-memory configuration store the management operations act on.
///
/// Changes are visible to the next [`resolve`](Self::resolve); profiles
/// already handed out are not affected.
#[derive(Debug, Default)]
pub struct ManagementModel {
    inner: RwLock<Model>,
}

impl ManagementModel {
    /// Create an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a model from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on duplicate names.
    pub fn from_config(config: &Config) -> Result<Self> {
        let model = Self::new();
        for realm in &config.security_realms {
            model.add_security_realm(realm.clone())?;
        }
        for conn in &config.outbound_connections {
            model.add_outbound_connection(conn.clone())?;
        }
        for domain in &config.security_domains {
            model.add_security_domain(domain.clone())?;
        }
        Ok(model)
    }

    // ── security realms ─────────────────────────────────────────────────────

    /// Add a security realm.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the name is taken.
    pub fn add_security_realm(&self, realm: SecurityRealm) -> Result<()> {
        let mut model = self.inner.write();
        if model.realms.contains_key(&realm.name) {
            return Err(Error::Config(format!("Security realm '{}' already exists", realm.name)));
        }
        info!(realm = %realm.name, "security realm added");
        model.realms.insert(realm.name.clone(), realm);
        Ok(())
    }

    /// Replace an existing security realm.
    ///
    /// # Errors
    ///
    /// Returns `Error::RealmNotFound` if no realm has this name.
    pub fn update_security_realm(&self, realm: SecurityRealm) -> Result<()> {
        let mut model = self.inner.write();
        let slot = model
            .realms
            .get_mut(&realm.name)
            .ok_or_else(|| Error::RealmNotFound(realm.name.clone()))?;
        info!(realm = %realm.name, "security realm updated");
        *slot = realm;
        Ok(())
    }

    /// Remove a security realm.
    ///
    /// # Errors
    ///
    /// Returns `Error::RealmNotFound` if no realm has this name.
    pub fn remove_security_realm(&self, name: &str) -> Result<SecurityRealm> {
        let removed = self
            .inner
            .write()
            .realms
            .remove(name)
            .ok_or_else(|| Error::RealmNotFound(name.to_string()))?;
        info!(realm = name, "security realm removed");
        Ok(removed)
    }

    /// Read a security realm.
    #[must_use]
    pub fn security_realm(&self, name: &str) -> Option<SecurityRealm> {
        self.inner.read().realms.get(name).cloned()
    }

    // ── outbound connections ────────────────────────────────────────────────

    /// Add an outbound LDAP connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the name is taken or the URL is not
    /// `ldaps://`.
    pub fn add_outbound_connection(&self, conn: OutboundLdapConnection) -> Result<()> {
        parse_ldaps_url(&conn.url)?;
        let mut model = self.inner.write();
        if model.connections.contains_key(&conn.name) {
            return Err(Error::Config(format!(
                "Outbound LDAP connection '{}' already exists",
                conn.name
            )));
        }
        info!(
            connection = %conn.name,
            url = %conn.url,
            always_send_client_cert = conn.always_send_client_cert,
            "outbound LDAP connection added"
        );
        model.connections.insert(conn.name.clone(), conn);
        Ok(())
    }

    /// Replace an existing outbound LDAP connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionNotBound` if no connection has this name.
    pub fn update_outbound_connection(&self, conn: OutboundLdapConnection) -> Result<()> {
        parse_ldaps_url(&conn.url)?;
        let mut model = self.inner.write();
        let slot = model
            .connections
            .get_mut(&conn.name)
            .ok_or_else(|| Error::ConnectionNotBound(conn.name.clone()))?;
        info!(connection = %conn.name, "outbound LDAP connection updated");
        *slot = conn;
        Ok(())
    }

    /// Remove an outbound LDAP connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionNotBound` if no connection has this name.
    pub fn remove_outbound_connection(&self, name: &str) -> Result<OutboundLdapConnection> {
        let removed = self
            .inner
            .write()
            .connections
            .remove(name)
            .ok_or_else(|| Error::ConnectionNotBound(name.to_string()))?;
        info!(connection = name, "outbound LDAP connection removed");
        Ok(removed)
    }

    /// Read an outbound LDAP connection.
    #[must_use]
    pub fn outbound_connection(&self, name: &str) -> Option<OutboundLdapConnection> {
        self.inner.read().connections.get(name).cloned()
    }

    // ── security domains ────────────────────────────────────────────────────

    /// Add a security domain.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the name is taken.
    pub fn add_security_domain(&self, domain: SecurityDomain) -> Result<()> {
        let mut model = self.inner.write();
        if model.domains.contains_key(&domain.name) {
            return Err(Error::Config(format!(
                "Security domain '{}' already exists",
                domain.name
            )));
        }
        info!(domain = %domain.name, realm = domain.realm(), "security domain added");
        model.domains.insert(domain.name.clone(), domain);
        Ok(())
    }

    /// Replace an existing security domain.
    ///
    /// # Errors
    ///
    /// Returns `Error::DomainNotFound` if no domain has this name.
    pub fn update_security_domain(&self, domain: SecurityDomain) -> Result<()> {
        let mut model = self.inner.write();
        let slot = model
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| Error::DomainNotFound(domain.name.clone()))?;
        info!(domain = %domain.name, realm = domain.realm(), "security domain updated");
        *slot = domain;
        Ok(())
    }

    /// Remove a security domain.
    ///
    /// # Errors
    ///
    /// Returns `Error::DomainNotFound` if no domain has this name.
    pub fn remove_security_domain(&self, name: &str) -> Result<SecurityDomain> {
        let removed = self
            .inner
            .write()
            .domains
            .remove(name)
            .ok_or_else(|| Error::DomainNotFound(name.to_string()))?;
        info!(domain = name, "security domain removed");
        Ok(removed)
    }

    /// Read a security domain.
    ///
    /// # Errors
    ///
    /// Returns `Error::DomainNotFound` if no domain has this name.
    pub fn security_domain(&self, name: &str) -> Result<SecurityDomain> {
        self.inner
            .read()
            .domains
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DomainNotFound(name.to_string()))
    }

    // ── resolution ──────────────────────────────────────────────────────────

    /// Resolve the connection profile a realm authenticates through.
    ///
    /// Reads the SSL realm's PEM material but opens no connections.
    ///
    /// # Errors
    ///
    /// - `Error::RealmNotFound` if `realm_name` does not exist
    /// - `Error::ConnectionNotBound` if the realm has no LDAP
    ///   authentication, names an undefined connection, or the connection
    ///   has no usable SSL realm
    /// - `Error::Config` if the PEM material cannot be loaded
    pub fn resolve(&self, realm_name: &str) -> Result<ConnectionProfile> {
        let (realm, conn, ssl_realm) = {
            let model = self.inner.read();
            let realm = model
                .realms
                .get(realm_name)
                .cloned()
                .ok_or_else(|| Error::RealmNotFound(realm_name.to_string()))?;
            let ldap = realm.ldap.as_ref().ok_or_else(|| {
                Error::ConnectionNotBound(format!("{realm_name}: realm has no LDAP authentication"))
            })?;
            let conn = model.connections.get(&ldap.connection).cloned().ok_or_else(|| {
                Error::ConnectionNotBound(format!(
                    "{realm_name}: connection '{}' is not defined",
                    ldap.connection
                ))
            })?;
            let ssl_name = conn.security_realm.as_deref().ok_or_else(|| {
                Error::ConnectionNotBound(format!(
                    "{realm_name}: connection '{}' has no security realm",
                    conn.name
                ))
            })?;
            let ssl_realm = model.realms.get(ssl_name).cloned().ok_or_else(|| {
                Error::ConnectionNotBound(format!(
                    "{realm_name}: SSL realm '{ssl_name}' is not defined"
                ))
            })?;
            (realm, conn, ssl_realm)
        };

        let Some(ldap) = realm.ldap else {
            return Err(Error::ConnectionNotBound(realm_name.to_string()));
        };
        let truststore = ssl_realm.truststore.as_ref().ok_or_else(|| {
            Error::ConnectionNotBound(format!(
                "{realm_name}: SSL realm '{}' has no truststore",
                ssl_realm.name
            ))
        })?;
        let trust = tls::load_truststore(&truststore.path, truststore.password.as_ref())?;
        let identity = ssl_realm
            .server_identity
            .as_ref()
            .map(|ks| tls::load_keystore(&ks.path, ks.password.as_ref()))
            .transpose()?;

        let (host, port) = parse_ldaps_url(&conn.url)?;

        debug!(
            realm = realm_name,
            connection = %conn.name,
            ssl_realm = %ssl_realm.name,
            has_identity = identity.is_some(),
            always_send_client_cert = conn.always_send_client_cert,
            "connection profile resolved"
        );

        Ok(ConnectionProfile {
            name: conn.name,
            realm: realm.name,
            host,
            port,
            search_dn: conn.search_dn,
            search_credential: conn.search_credential,
            ssl_realm: ssl_realm.name,
            always_send_client_cert: conn.always_send_client_cert,
            handshake_timeout: conn.handshake_timeout,
            user_search: UserSearch {
                base_dn: ldap.base_dn,
                recursive: ldap.recursive,
                username_attribute: ldap.username_attribute,
            },
            identity,
            trust,
        })
    }
}

/// Split an `ldaps://host[:port]` URL.
fn parse_ldaps_url(raw: &str) -> Result<(String, u16)> {
    let url = Url::parse(raw).map_err(|e| Error::Config(format!("Invalid LDAP URL '{raw}': {e}")))?;
    if url.scheme() != "ldaps" {
        return Err(Error::Config(format!(
            "LDAP URL '{raw}' must use the ldaps scheme"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config(format!("LDAP URL '{raw}' has no host")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, url.port().unwrap_or(LDAPS_DEFAULT_PORT)))
}
