//! Authentication outcome evaluation.
//!
//! [`AuthenticationEvaluator::authenticate`] resolves a realm, runs the
//! LDAPS exchange and classifies the result. A wrong credential is an
//! [`AuthOutcome::Rejected`] value; handshake and transport failures are
//! errors that abort the probe.
//!
//! ```text
//! Idle → HandshakeInProgress → HandshakeComplete → BindAttempted → Accepted
//!              │                     │    ▲                     └→ Rejected
//!              ▼                     │    │ (new user-verification connection)
//!        HandshakeFailed             ├────┘
//!                                    └→ Rejected (no such user / empty password)
//! ```

use std::fmt;
use std::sync::Arc;

use ldap3_proto::LdapResultCode;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionPurpose, LdapSession, OutboundConnector};
use crate::realm::ManagementModel;
use crate::tls::CertificateLedger;
use crate::{Error, Result};

/// Result of evaluating a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The directory accepted the user's bind.
    Accepted,
    /// The credential was wrong, empty, or names no user.
    Rejected,
}

impl fmt::Display for AuthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("accepted"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// Where a probe is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Nothing done yet.
    Idle,
    /// TCP connect and TLS handshake running.
    HandshakeInProgress,
    /// A TLS session is established.
    HandshakeComplete,
    /// The user's bind went over an established session.
    BindAttempted,
    /// Terminal: the user was authenticated.
    Accepted,
    /// Terminal: the user was not authenticated.
    Rejected,
    /// Terminal: trust rejection, transport error, or timeout.
    HandshakeFailed,
}

impl ProbeState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::HandshakeFailed)
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ProbeState::{
            Accepted, BindAttempted, HandshakeComplete, HandshakeFailed, HandshakeInProgress,
            Idle, Rejected,
        };
        matches!(
            (self, next),
            (Idle, HandshakeInProgress)
                | (Idle, Rejected)
                | (HandshakeInProgress, HandshakeComplete)
                | (HandshakeInProgress, HandshakeFailed)
                | (HandshakeComplete, HandshakeInProgress)
                | (HandshakeComplete, BindAttempted)
                | (HandshakeComplete, Rejected)
                | (BindAttempted, Accepted)
                | (BindAttempted, Rejected)
        )
    }
}

/// Tracks one `authenticate` call.
///
/// A connection only counts as established once its first LDAP response
/// arrives: under TLS 1.3 the directory's verdict on a client certificate
/// reaches the client after the client considers the handshake done.
#[derive(Debug)]
struct Probe<'a> {
    realm: &'a str,
    username: &'a str,
    state: ProbeState,
    history: Vec<ProbeState>,
}

impl<'a> Probe<'a> {
    fn new(realm: &'a str, username: &'a str) -> Self {
        Self {
            realm,
            username,
            state: ProbeState::Idle,
            history: vec![ProbeState::Idle],
        }
    }

    fn advance(&mut self, next: ProbeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Protocol(format!(
                "illegal probe transition {:?} -> {next:?}",
                self.state
            )));
        }
        debug!(realm = self.realm, username = self.username, from = ?self.state, to = ?next, "probe state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn finish(&mut self, outcome: AuthOutcome) -> Result<AuthOutcome> {
        self.advance(match outcome {
            AuthOutcome::Accepted => ProbeState::Accepted,
            AuthOutcome::Rejected => ProbeState::Rejected,
        })?;
        info!(realm = self.realm, username = self.username, %outcome, "authentication evaluated");
        Ok(outcome)
    }

    fn abort<T>(&mut self, purpose: ConnectionPurpose, err: Error) -> Result<T> {
        self.advance(ProbeState::HandshakeFailed)?;
        warn!(realm = self.realm, %purpose, error = %err, "probe aborted");
        Err(err)
    }

    /// Connect for `purpose`. The probe stays in `HandshakeInProgress`
    /// until [`established`](Self::established) sees the first response.
    async fn open(
        &mut self,
        connector: &OutboundConnector,
        purpose: ConnectionPurpose,
    ) -> Result<LdapSession> {
        self.advance(ProbeState::HandshakeInProgress)?;
        match connector.open_session(purpose).await {
            Ok(session) => Ok(session),
            Err(e) => self.abort(purpose, e),
        }
    }

    /// Classify the first exchange on a freshly opened connection.
    fn established<T>(&mut self, purpose: ConnectionPurpose, first: Result<T>) -> Result<T> {
        match first {
            Ok(value) => {
                self.advance(ProbeState::HandshakeComplete)?;
                Ok(value)
            }
            Err(e) if e.is_handshake_failure() || matches!(e, Error::Transport(_)) => {
                self.abort(purpose, e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Evaluates credentials against a realm's directory.
#[derive(Debug, Clone)]
pub struct AuthenticationEvaluator {
    model: Arc<ManagementModel>,
    server_identities: Arc<CertificateLedger>,
    presented_identities: Arc<CertificateLedger>,
}

impl AuthenticationEvaluator {
    /// Create an evaluator over `model` with fresh identity ledgers.
    #[must_use]
    pub fn new(model: Arc<ManagementModel>) -> Self {
        Self {
            model,
            server_identities: Arc::new(CertificateLedger::new()),
            presented_identities: Arc::new(CertificateLedger::new()),
        }
    }

    /// The management model realms are resolved from.
    #[must_use]
    pub fn model(&self) -> &Arc<ManagementModel> {
        &self.model
    }

    /// Directory certificates observed on outbound connections.
    #[must_use]
    pub fn server_identities(&self) -> &Arc<CertificateLedger> {
        &self.server_identities
    }

    /// Realm identities sent on outbound connections.
    #[must_use]
    pub fn presented_identities(&self) -> &Arc<CertificateLedger> {
        &self.presented_identities
    }

    /// Authenticate `username` / `password` against `realm`.
    ///
    /// # Errors
    ///
    /// - `Error::RealmNotFound` / `Error::ConnectionNotBound` from resolution
    /// - `Error::HandshakeFailed` / `Error::Transport` if a connection fails
    /// - `Error::Ldap` if the manager bind or the user search fails
    pub async fn authenticate(
        &self,
        realm: &str,
        username: &str,
        password: &str,
    ) -> Result<AuthOutcome> {
        let mut probe = Probe::new(realm, username);
        self.run(&mut probe, password).await
    }

    async fn run(&self, probe: &mut Probe<'_>, password: &str) -> Result<AuthOutcome> {
        let (realm, username) = (probe.realm, probe.username);
        let profile = self.model.resolve(realm)?;

        if password.is_empty() {
            debug!(realm, username, "empty password");
            return probe.finish(AuthOutcome::Rejected);
        }

        let manager_password = profile.search_credential.expose()?;
        let user_search = profile.user_search.clone();
        let search_dn = profile.search_dn.clone();
        let connector = OutboundConnector::new(
            profile,
            Arc::clone(&self.server_identities),
            Arc::clone(&self.presented_identities),
        )?;

        let mut search = probe.open(&connector, ConnectionPurpose::Search).await?;
        let manager = search.simple_bind(&search_dn, &manager_password).await;
        let manager = probe.established(ConnectionPurpose::Search, manager)?;
        if manager.code != LdapResultCode::Success {
            warn!(realm, dn = %search_dn, code = ?manager.code, "manager bind failed");
            return Err(Error::Ldap {
                code: manager.code,
                message: manager.message,
            });
        }

        let Some(user_dn) = search.find_user_dn(&user_search, username).await? else {
            debug!(realm, username, "no such user");
            close(search).await;
            return probe.finish(AuthOutcome::Rejected);
        };

        let bind = if connector.policy().reuses_search_connection() {
            probe.advance(ProbeState::BindAttempted)?;
            let bind = search.simple_bind(&user_dn, password).await?;
            close(search).await;
            bind
        } else {
            close(search).await;
            let purpose = ConnectionPurpose::UserVerification;
            let mut session = probe.open(&connector, purpose).await?;
            let bind = session.simple_bind(&user_dn, password).await;
            let bind = probe.established(purpose, bind)?;
            probe.advance(ProbeState::BindAttempted)?;
            close(session).await;
            bind
        };

        match bind.code {
            LdapResultCode::Success => probe.finish(AuthOutcome::Accepted),
            LdapResultCode::InvalidCredentials => probe.finish(AuthOutcome::Rejected),
            code => Err(Error::Ldap {
                code,
                message: bind.message,
            }),
        }
    }
}

async fn close(session: LdapSession) {
    let purpose = session.purpose();
    if let Err(e) = session.unbind().await {
        debug!(%purpose, error = %e, "unbind failed");
    }
}
