//! Configuration management

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::directory::{DirectoryConfig, TransportConfig};
use crate::realm::{OutboundLdapConnection, SecurityDomain, SecurityRealm, StoreRef};
use crate::secrets::Secret;
use crate::tls;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Embedded directory started by `serve --directory`
    pub directory: Option<DirectorySettings>,
    /// Security realms
    pub security_realms: Vec<SecurityRealm>,
    /// Outbound LDAP connections
    pub outbound_connections: Vec<OutboundLdapConnection>,
    /// Security domains
    pub security_domains: Vec<SecurityDomain>,
    /// Protected web deployments
    pub deployments: Vec<DeploymentConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or references undefined domains.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // REALM_LDAPS_SERVER__PORT=9000 etc.
        figment = figment.merge(Env::prefixed("REALM_LDAPS_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references that the management model does not.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on duplicate deployment names or a deployment
    /// naming an undefined security domain.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for deployment in &self.deployments {
            if !seen.insert(deployment.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate deployment '{}'",
                    deployment.name
                )));
            }
            if !self
                .security_domains
                .iter()
                .any(|d| d.name == deployment.security_domain)
            {
                return Err(Error::Config(format!(
                    "Deployment '{}' uses undefined security domain '{}'",
                    deployment.name, deployment.security_domain
                )));
            }
        }
        Ok(())
    }

}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout, including the LDAPS exchange
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long in-flight requests may drain after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// A web deployment guarded by a security domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// First path segment, e.g. `ldaps-authn-always`.
    pub name: String,
    /// Security domain authenticating requests.
    pub security_domain: String,
    /// Resource name → body.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

/// File-backed settings for the embedded directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySettings {
    /// Partition suffix
    pub suffix: String,
    /// LDIF file seeding the partition
    #[serde(default)]
    pub ldif: Option<String>,
    /// Administrator DN
    #[serde(default = "default_admin_dn")]
    pub admin_dn: String,
    /// Administrator password
    pub admin_password: Secret,
    /// Listen address
    #[serde(default = "default_directory_bind")]
    pub bind: SocketAddr,
    /// Directory TLS identity (PEM keystore)
    pub keystore: StoreRef,
    /// Client-auth settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Limit on inbound TLS handshakes
    #[serde(default = "default_directory_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

fn default_directory_handshake_timeout() -> Duration {
    crate::directory::DEFAULT_HANDSHAKE_TIMEOUT
}

fn default_admin_dn() -> String {
    "uid=admin,ou=system".to_string()
}

fn default_directory_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10636))
}

impl DirectorySettings {
    /// Read the keystore and LDIF and build a [`DirectoryConfig`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a file cannot be read or parsed.
    pub fn to_directory_config(&self) -> Result<DirectoryConfig> {
        let keystore = tls::load_keystore(&self.keystore.path, self.keystore.password.as_ref())?;
        let mut builder = DirectoryConfig::builder()
            .suffix(self.suffix.clone())
            .admin(self.admin_dn.clone(), self.admin_password.clone())
            .bind_addr(self.bind)
            .keystore(keystore)
            .transport(self.transport)
            .handshake_timeout(self.handshake_timeout);
        if let Some(path) = &self.ldif {
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("Failed to read LDIF '{path}': {e}")))?;
            builder = builder.ldif(&text)?;
        }
        builder.build()
    }
}
