//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Security-realm driven LDAPS authentication with client-certificate policy
#[derive(Parser, Debug)]
#[command(name = "realm-ldaps")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "REALM_LDAPS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "REALM_LDAPS_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "REALM_LDAPS_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP front (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "REALM_LDAPS_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "REALM_LDAPS_HOST")]
        host: Option<String>,

        /// Also start the embedded directory from the `directory` section
        #[arg(long)]
        directory: bool,
    },

    /// Authenticate once against a realm and print the outcome
    Probe {
        /// Security realm name
        #[arg(long)]
        realm: String,

        /// Username
        #[arg(long)]
        username: String,

        /// Password
        #[arg(long, env = "REALM_LDAPS_PROBE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Certificate management commands
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Create a self-signed CA
    InitCa {
        /// Common Name of the CA
        #[arg(long, default_value = "realm-ldaps CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,

        /// Output directory
        #[arg(long, default_value = "certs")]
        out: PathBuf,
    },

    /// Issue a directory or realm identity signed by the CA
    Issue {
        /// Common Name, e.g. JBAS
        #[arg(long)]
        cn: String,

        /// Organisational Unit
        #[arg(long)]
        ou: Option<String>,

        /// Subject Alternative Name (repeatable; IP literals become IP SANs)
        #[arg(long = "san")]
        sans: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// CA certificate (PEM)
        #[arg(long, default_value = "certs/ca.crt")]
        ca_cert: PathBuf,

        /// CA private key (PEM)
        #[arg(long, default_value = "certs/ca.key")]
        ca_key: PathBuf,

        /// Output directory
        #[arg(long, default_value = "certs")]
        out: PathBuf,

        /// File stem for the written files; defaults to the lower-cased CN
        #[arg(long)]
        name: Option<String>,
    },
}
