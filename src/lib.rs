//! realm-ldaps Library
//!
//! Security-realm driven outbound LDAP-over-TLS authentication.
//!
//! # Features
//!
//! - **Management model**: security realms, outbound LDAP connections and
//!   security domains, resolved per request into a `ConnectionProfile`
//! - **Client certificate policy**: `always_send_client_cert` decides whether
//!   the realm identity is offered when the user's own credential is bound
//! - **Certificate recording**: the directory side records every client
//!   chain; the client side records every directory chain
//! - **Embedded LDAPS directory**: bind / search / unbind with explicit
//!   `need_client_auth` / `want_client_auth`
//! - **HTTP front**: Basic-auth protected deployments, 200 / 401

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod realm;
pub mod secrets;
pub mod tls;
pub mod web;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
