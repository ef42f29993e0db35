//! HTTP front for protected deployments.
//!
//! `GET /{deployment}/{resource}` with HTTP Basic credentials. The
//! deployment's security domain names the realm, the evaluator decides,
//! and the outcome becomes 200 or 401.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{AuthOutcome, AuthenticationEvaluator};
use crate::config::DeploymentConfig;
use crate::{Error, Result};

/// Shared state of the HTTP front.
#[derive(Debug)]
pub struct AppState {
    evaluator: AuthenticationEvaluator,
    deployments: HashMap<String, DeploymentConfig>,
    request_timeout: Duration,
}

impl AppState {
    /// Build state from an evaluator and the configured deployments.
    #[must_use]
    pub fn new(
        evaluator: AuthenticationEvaluator,
        deployments: impl IntoIterator<Item = DeploymentConfig>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            evaluator,
            deployments: deployments
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            request_timeout,
        }
    }

}

/// Create the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{deployment}/{resource}", get(resource_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `listener` until Ctrl+C / SIGTERM, then give
/// in-flight requests up to `drain_timeout` to finish.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, router: Router, drain_timeout: Duration) -> Result<()> {
    serve_until(listener, router, shutdown_signal(), drain_timeout).await
}

/// Serve until `signal` resolves, then drain for at most `drain_timeout`.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_until<F>(
    listener: TcpListener,
    router: Router,
    signal: F,
    drain_timeout: Duration,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "HTTP front listening");

    let (draining_tx, mut draining) = watch::channel(false);
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.await;
            let _ = draining_tx.send(true);
        })
        .into_future();
    tokio::pin!(server);

    let deadline = async {
        if draining.wait_for(|started| *started).await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(drain_timeout).await;
    };

    tokio::select! {
        result = &mut server => result?,
        () = deadline => warn!(?drain_timeout, "in-flight requests still running; shutting down"),
    }
    info!("HTTP front stopped");
    Ok(())
}

async fn resource_handler(
    State(state): State<Arc<AppState>>,
    Path((deployment, resource)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(dep) = state.deployments.get(&deployment) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let domain = &dep.security_domain;

    let Some((username, password)) = basic_credentials(&headers) else {
        debug!(%deployment, "missing or malformed Basic credentials");
        return unauthorized(domain);
    };

    let realm = match state.evaluator.model().security_domain(domain) {
        Ok(d) => d.realm().to_string(),
        Err(e) => {
            warn!(%deployment, error = %e, "security domain unavailable");
            return unauthorized(domain);
        }
    };

    let outcome = tokio::time::timeout(
        state.request_timeout,
        state.evaluator.authenticate(&realm, &username, &password),
    )
    .await
    .unwrap_or_else(|_| Err(Error::Transport("authentication timed out".to_string())));

    match outcome {
        Ok(AuthOutcome::Accepted) => match dep.resources.get(&resource) {
            Some(body) => (StatusCode::OK, body.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Ok(AuthOutcome::Rejected) => unauthorized(domain),
        Err(e) => {
            warn!(%deployment, %realm, %username, error = %e, "authentication failed");
            unauthorized(domain)
        }
    }
}

/// Decode `Authorization: Basic base64(user:password)`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn unauthorized(domain: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, format!("Basic realm=\"{domain}\""))],
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
