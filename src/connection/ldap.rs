//! Minimal LDAP client over an established TLS stream.
//!
//! Only what realm authentication needs: simple bind, a one-attribute
//! equality search for the user entry, and unbind.

use futures::{SinkExt, StreamExt};
use ldap3_proto::LdapCodec;
use ldap3_proto::proto::{
    LdapBindCred, LdapBindRequest, LdapDerefAliases, LdapFilter, LdapMsg, LdapOp, LdapResult,
    LdapResultCode, LdapSearchRequest, LdapSearchScope,
};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::connection::ConnectionPurpose;
use crate::realm::UserSearch;
use crate::{Error, Result};

/// "No attributes" selector from RFC 4511.
const NO_ATTRIBUTES: &str = "1.1";

/// An LDAP conversation on one TLS connection.
pub struct LdapSession {
    framed: Framed<TlsStream<TcpStream>, LdapCodec>,
    purpose: ConnectionPurpose,
    next_msgid: i32,
}

impl std::fmt::Debug for LdapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSession")
            .field("purpose", &self.purpose)
            .field("next_msgid", &self.next_msgid)
            .finish_non_exhaustive()
    }
}

impl LdapSession {
    /// Wrap an established TLS stream.
    #[must_use]
    pub fn new(stream: TlsStream<TcpStream>, purpose: ConnectionPurpose) -> Self {
        Self {
            framed: Framed::new(stream, LdapCodec::default()),
            purpose,
            next_msgid: 1,
        }
    }

    /// What this session was opened for.
    #[must_use]
    pub fn purpose(&self) -> ConnectionPurpose {
        self.purpose
    }

    async fn send(&mut self, op: LdapOp) -> Result<i32> {
        let msgid = self.next_msgid;
        self.next_msgid += 1;
        self.framed
            .send(LdapMsg {
                msgid,
                op,
                ctrl: vec![],
            })
            .await
            .map_err(Error::from_tls_io)?;
        Ok(msgid)
    }

    async fn receive(&mut self, msgid: i32) -> Result<LdapOp> {
        loop {
            let msg = match self.framed.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(Error::from_tls_io(e)),
                None => {
                    return Err(Error::Transport(
                        "directory closed the connection".to_string(),
                    ));
                }
            };
            if msg.msgid == msgid {
                return Ok(msg.op);
            }
            trace!(expected = msgid, got = msg.msgid, "skipping unrelated LDAP message");
        }
    }

    /// Simple bind. Returns the directory's result whatever its code; the
    /// caller decides whether a failure is a rejection or an error.
    ///
    /// # Errors
    ///
    /// Returns transport, handshake, or protocol errors only.
    pub async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<LdapResult> {
        let msgid = self
            .send(LdapOp::BindRequest(LdapBindRequest {
                dn: dn.to_string(),
                cred: LdapBindCred::Simple(password.to_string()),
            }))
            .await?;
        match self.receive(msgid).await? {
            LdapOp::BindResponse(resp) => {
                debug!(purpose = %self.purpose, dn, code = ?resp.res.code, "bind response");
                Ok(resp.res)
            }
            other => Err(Error::Protocol(format!(
                "expected BindResponse, got {other:?}"
            ))),
        }
    }

    /// Find the DN of the entry whose `username_attribute` equals
    /// `username`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Ldap` if the search does not complete with success,
    /// or `Error::Protocol` if more than one entry matches (including a
    /// directory cutting the search off with `SizeLimitExceeded`).
    pub async fn find_user_dn(
        &mut self,
        search: &UserSearch,
        username: &str,
    ) -> Result<Option<String>> {
        let scope = if search.recursive {
            LdapSearchScope::Subtree
        } else {
            LdapSearchScope::OneLevel
        };
        let msgid = self
            .send(LdapOp::SearchRequest(LdapSearchRequest {
                base: search.base_dn.clone(),
                scope,
                aliases: LdapDerefAliases::Never,
                sizelimit: 2,
                timelimit: 0,
                typesonly: false,
                filter: LdapFilter::Equality(
                    search.username_attribute.clone(),
                    username.to_string(),
                ),
                attrs: vec![NO_ATTRIBUTES.to_string()],
            }))
            .await?;

        let mut found: Vec<String> = Vec::new();
        let done = loop {
            match self.receive(msgid).await? {
                LdapOp::SearchResultEntry(entry) => found.push(entry.dn),
                LdapOp::SearchResultDone(res) => break res,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during search: {other:?}"
                    )));
                }
            }
        };

        debug!(
            purpose = %self.purpose,
            base = %search.base_dn,
            attribute = %search.username_attribute,
            matches = found.len(),
            code = ?done.code,
            "user search complete"
        );
        single_match(found, done.code, done.message, search, username)
    }

    /// Send an unbind and close the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the unbind cannot be written.
    pub async fn unbind(mut self) -> Result<()> {
        self.send(LdapOp::UnbindRequest).await?;
        self.framed.close().await.map_err(Error::from_tls_io)?;
        Ok(())
    }
}

/// The one DN a user search may yield.
fn single_match(
    mut found: Vec<String>,
    code: LdapResultCode,
    message: String,
    search: &UserSearch,
    username: &str,
) -> Result<Option<String>> {
    let ambiguous = || {
        Error::Protocol(format!(
            "more than one entry matches {}={username}",
            search.username_attribute
        ))
    };
    match code {
        LdapResultCode::Success if found.len() > 1 => Err(ambiguous()),
        LdapResultCode::Success => Ok(found.pop()),
        LdapResultCode::SizeLimitExceeded => Err(ambiguous()),
        code => Err(Error::Ldap { code, message }),
    }
}
