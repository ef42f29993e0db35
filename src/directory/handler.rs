//! LDAP operations of the embedded directory.
//!
//! Bind, search and unbind against an in-memory entry list. Everything
//! else is answered with `unwillingToPerform`.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use ldap3_proto::proto::{
    LdapBindResponse, LdapExtendedResponse, LdapFilter, LdapMsg, LdapOp, LdapPartialAttribute,
    LdapResult, LdapResultCode, LdapSearchResultEntry, LdapSearchScope,
};
use ldap3_proto::simple::{SearchRequest, ServerOps, SimpleBindRequest};
use ldap3_proto::LdapCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::directory::DirectoryEntry;

/// Attribute never returned by search.
const USER_PASSWORD: &str = "userPassword";

/// Entries plus the administrator credential.
#[derive(Debug)]
pub(crate) struct DirectoryStore {
    entries: Vec<DirectoryEntry>,
    admin_dn: String,
    admin_password: String,
}

impl DirectoryStore {
    pub(crate) fn new(entries: Vec<DirectoryEntry>, admin_dn: &str, admin_password: String) -> Self {
        Self {
            entries,
            admin_dn: normalize_dn(admin_dn),
            admin_password,
        }
    }

    /// Answer a simple bind; on success also return the bound DN.
    fn bind(&self, req: &SimpleBindRequest) -> (LdapMsg, Option<String>) {
        if req.dn.is_empty() && req.pw.is_empty() {
            return (req.gen_success(), None);
        }
        if req.pw.is_empty() {
            return (
                req.gen_error(
                    LdapResultCode::UnwillingToPerform,
                    "unauthenticated bind is not allowed".to_string(),
                ),
                None,
            );
        }

        let dn = normalize_dn(&req.dn);
        let accepted = if dn == self.admin_dn {
            req.pw == self.admin_password
        } else {
            self.entry(&dn)
                .is_some_and(|e| e.values(USER_PASSWORD).iter().any(|p| *p == req.pw))
        };

        if accepted {
            debug!(dn = %req.dn, "bind accepted");
            (req.gen_success(), Some(dn))
        } else {
            debug!(dn = %req.dn, "bind rejected");
            (
                req.gen_error(LdapResultCode::InvalidCredentials, String::new()),
                None,
            )
        }
    }

    fn search(&self, req: &SearchRequest, bound: Option<&str>) -> Vec<LdapMsg> {
        if bound.is_none() {
            return vec![req.gen_error(
                LdapResultCode::InsufficentAccessRights,
                "bind required".to_string(),
            )];
        }

        let base = normalize_dn(&req.base);
        if !base.is_empty() && self.entry(&base).is_none() {
            return vec![req.gen_error(LdapResultCode::NoSuchObject, req.base.clone())];
        }

        let mut out: Vec<LdapMsg> = self
            .entries
            .iter()
            .filter(|e| in_scope(&normalize_dn(&e.dn), &base, &req.scope))
            .filter(|e| matches_filter(e, &req.filter))
            .map(|e| req.gen_result_entry(project(e, &req.attrs)))
            .collect();
        debug!(base = %req.base, scope = ?req.scope, entries = out.len(), "search");
        out.push(req.gen_success());
        out
    }

    fn entry(&self, normalized_dn: &str) -> Option<&DirectoryEntry> {
        self.entries
            .iter()
            .find(|e| normalize_dn(&e.dn) == normalized_dn)
    }
}

/// Serve one client connection until unbind, EOF, or a protocol error.
pub(crate) async fn serve<IO>(mut framed: Framed<IO, LdapCodec>, store: Arc<DirectoryStore>, peer: String)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut bound: Option<String> = None;

    while let Some(next) = framed.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%peer, error = %e, "LDAP read failed");
                return;
            }
        };
        trace!(%peer, msgid = msg.msgid, "LDAP request");

        let fallback = unsupported(msg.msgid, &msg.op);
        let replies = match ServerOps::try_from(msg) {
            Ok(ServerOps::SimpleBind(req)) => {
                let (reply, dn) = store.bind(&req);
                bound = dn;
                vec![reply]
            }
            Ok(ServerOps::Search(req)) => store.search(&req, bound.as_deref()),
            Ok(ServerOps::Unbind(_)) => {
                debug!(%peer, "unbind");
                return;
            }
            _ => match fallback {
                Some(reply) => vec![reply],
                None => {
                    warn!(%peer, "unsupported LDAP operation; closing");
                    return;
                }
            },
        };

        for reply in replies {
            if let Err(e) = framed.send(reply).await {
                debug!(%peer, error = %e, "LDAP write failed");
                return;
            }
        }
    }
}

/// `unwillingToPerform` response for an operation this directory does
/// not implement, if the operation has a response at all.
fn unsupported(msgid: i32, op: &LdapOp) -> Option<LdapMsg> {
    let res = LdapResult {
        code: LdapResultCode::UnwillingToPerform,
        matcheddn: String::new(),
        message: "operation not supported".to_string(),
        referral: vec![],
    };
    let op = match op {
        LdapOp::BindRequest(_) => LdapOp::BindResponse(LdapBindResponse {
            res,
            saslcreds: None,
        }),
        LdapOp::SearchRequest(_) => LdapOp::SearchResultDone(res),
        LdapOp::AddRequest(_) => LdapOp::AddResponse(res),
        LdapOp::DelRequest(_) => LdapOp::DelResponse(res),
        LdapOp::ModifyRequest(_) => LdapOp::ModifyResponse(res),
        LdapOp::CompareRequest(_) => LdapOp::CompareResult(res),
        LdapOp::ExtendedRequest(_) => LdapOp::ExtendedResponse(LdapExtendedResponse {
            res,
            name: None,
            value: None,
        }),
        _ => return None,
    };
    Some(LdapMsg {
        msgid,
        op,
        ctrl: vec![],
    })
}

/// Lower-case a DN and drop whitespace around separators.
pub(crate) fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            rdn.split_once('=').map_or_else(
                || rdn.trim().to_ascii_lowercase(),
                |(a, v)| format!("{}={}", a.trim(), v.trim()).to_ascii_lowercase(),
            )
        })
        .filter(|rdn| !rdn.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn parent(dn: &str) -> &str {
    dn.split_once(',').map_or("", |(_, rest)| rest)
}

fn in_scope(dn: &str, base: &str, scope: &LdapSearchScope) -> bool {
    let under = |dn: &str| base.is_empty() || dn.ends_with(&format!(",{base}"));
    match scope {
        LdapSearchScope::Base => dn == base,
        LdapSearchScope::OneLevel => parent(dn) == base,
        LdapSearchScope::Subtree => dn == base || under(dn),
        LdapSearchScope::Children => dn != base && under(dn),
    }
}

fn matches_filter(entry: &DirectoryEntry, filter: &LdapFilter) -> bool {
    match filter {
        LdapFilter::And(all) => all.iter().all(|f| matches_filter(entry, f)),
        LdapFilter::Or(any) => any.iter().any(|f| matches_filter(entry, f)),
        LdapFilter::Not(inner) => !matches_filter(entry, inner),
        LdapFilter::Equality(attr, value) => entry
            .values(attr)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value)),
        LdapFilter::Present(attr) => {
            attr.eq_ignore_ascii_case("objectClass") || !entry.values(attr).is_empty()
        }
        _ => false,
    }
}

/// Select the attributes a search asked for.
fn project(entry: &DirectoryEntry, requested: &[String]) -> LdapSearchResultEntry {
    let no_attrs = requested.len() == 1 && requested[0] == "1.1";
    let all_user = requested.is_empty() || requested.iter().any(|a| a == "*");

    let attributes = if no_attrs {
        vec![]
    } else {
        entry
            .attributes
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(USER_PASSWORD))
            .filter(|(name, _)| {
                all_user || requested.iter().any(|r| r.eq_ignore_ascii_case(name))
            })
            .map(|(name, values)| LdapPartialAttribute {
                atype: name.clone(),
                vals: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            })
            .collect()
    };

    LdapSearchResultEntry {
        dn: entry.dn.clone(),
        attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DirectoryStore {
        DirectoryStore::new(
            vec![
                DirectoryEntry::new("dc=jboss,dc=org").with("dc", "jboss"),
                DirectoryEntry::new("ou=People,dc=jboss,dc=org").with("ou", "People"),
                DirectoryEntry::new("uid=jduke,ou=People,dc=jboss,dc=org")
                    .with("objectClass", "inetOrgPerson")
                    .with("uid", "jduke")
                    .with("cn", "Java Duke")
                    .with("userPassword", "theduke"),
            ],
            "uid=admin,ou=system",
            "secret".to_string(),
        )
    }

    fn bind(dn: &str, pw: &str) -> SimpleBindRequest {
        SimpleBindRequest {
            msgid: 1,
            dn: dn.to_string(),
            pw: pw.to_string(),
        }
    }

    fn search(base: &str, scope: LdapSearchScope, filter: LdapFilter) -> SearchRequest {
        SearchRequest {
            msgid: 2,
            base: base.to_string(),
            scope,
            filter,
            attrs: vec![],
        }
    }

    fn code(msg: &LdapMsg) -> LdapResultCode {
        match &msg.op {
            LdapOp::BindResponse(r) => r.res.code.clone(),
            LdapOp::SearchResultDone(r) => r.code.clone(),
            other => panic!("no result code in {other:?}"),
        }
    }

    fn entry_dns(msgs: &[LdapMsg]) -> Vec<String> {
        msgs.iter()
            .filter_map(|m| match &m.op {
                LdapOp::SearchResultEntry(e) => Some(e.dn.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn admin_and_user_binds() {
        let store = store();
        let (ok, dn) = store.bind(&bind("uid=admin, ou=system", "secret"));
        assert_eq!(code(&ok), LdapResultCode::Success);
        assert_eq!(dn.as_deref(), Some("uid=admin,ou=system"));

        let (ok, _) = store.bind(&bind("uid=jduke,ou=People,dc=jboss,dc=org", "theduke"));
        assert_eq!(code(&ok), LdapResultCode::Success);

        let (bad, dn) = store.bind(&bind("uid=jduke,ou=People,dc=jboss,dc=org", "bad_password"));
        assert_eq!(code(&bad), LdapResultCode::InvalidCredentials);
        assert!(dn.is_none());
    }

    #[test]
    fn unauthenticated_bind_is_refused() {
        let (reply, dn) = store().bind(&bind("uid=jduke,ou=People,dc=jboss,dc=org", ""));
        assert_eq!(code(&reply), LdapResultCode::UnwillingToPerform);
        assert!(dn.is_none());
    }

    #[test]
    fn search_requires_bind() {
        let req = search("dc=jboss,dc=org", LdapSearchScope::Subtree, LdapFilter::Present("objectClass".into()));
        let replies = store().search(&req, None);
        assert_eq!(replies.len(), 1);
        assert_eq!(code(&replies[0]), LdapResultCode::InsufficentAccessRights);
    }

    #[test]
    fn subtree_equality_search_finds_the_user() {
        // GIVEN: a bound admin
        let store = store();
        // WHEN: searching the people branch for uid=jduke
        let req = search(
            "ou=People,dc=jboss,dc=org",
            LdapSearchScope::Subtree,
            LdapFilter::Equality("uid".into(), "jduke".into()),
        );
        let replies = store.search(&req, Some("uid=admin,ou=system"));
        // THEN: exactly the user entry, then success
        assert_eq!(entry_dns(&replies), vec!["uid=jduke,ou=People,dc=jboss,dc=org"]);
        assert_eq!(code(replies.last().unwrap()), LdapResultCode::Success);
    }

    #[test]
    fn scopes() {
        let store = store();
        let all = LdapFilter::Present("objectClass".into());
        let bound = Some("uid=admin,ou=system");

        let base = store.search(&search("dc=jboss,dc=org", LdapSearchScope::Base, all.clone()), bound);
        assert_eq!(entry_dns(&base), vec!["dc=jboss,dc=org"]);

        let one = store.search(&search("dc=jboss,dc=org", LdapSearchScope::OneLevel, all.clone()), bound);
        assert_eq!(entry_dns(&one), vec!["ou=People,dc=jboss,dc=org"]);

        let sub = store.search(&search("dc=jboss,dc=org", LdapSearchScope::Subtree, all), bound);
        assert_eq!(entry_dns(&sub).len(), 3);
    }

    #[test]
    fn boolean_filters() {
        let store = store();
        let filter = LdapFilter::And(vec![
            LdapFilter::Equality("objectClass".into(), "inetorgperson".into()),
            LdapFilter::Not(Box::new(LdapFilter::Equality("uid".into(), "other".into()))),
            LdapFilter::Or(vec![
                LdapFilter::Present("cn".into()),
                LdapFilter::Present("mail".into()),
            ]),
        ]);
        let replies = store.search(&search("dc=jboss,dc=org", LdapSearchScope::Subtree, filter), Some("x"));
        assert_eq!(entry_dns(&replies), vec!["uid=jduke,ou=People,dc=jboss,dc=org"]);
    }

    #[test]
    fn missing_base_is_no_such_object() {
        let req = search("dc=nowhere", LdapSearchScope::Subtree, LdapFilter::Present("objectClass".into()));
        let replies = store().search(&req, Some("x"));
        assert_eq!(code(&replies[0]), LdapResultCode::NoSuchObject);
    }

    #[test]
    fn password_is_never_returned() {
        let entry = DirectoryEntry::new("uid=a").with("uid", "a").with("userPassword", "p");
        let projected = project(&entry, &[]);
        assert!(projected.attributes.iter().all(|a| a.atype != "userPassword"));
        assert!(project(&entry, &["1.1".to_string()]).attributes.is_empty());
    }

    #[test]
    fn unsupported_ops_get_unwilling_to_perform() {
        let reply = unsupported(7, &LdapOp::DelRequest("uid=a".to_string())).unwrap();
        assert_eq!(reply.msgid, 7);
        assert!(matches!(
            reply.op,
            LdapOp::DelResponse(LdapResult { code: LdapResultCode::UnwillingToPerform, .. })
        ));
        assert!(unsupported(8, &LdapOp::UnbindRequest).is_none());
    }

    #[test]
    fn dn_normalization() {
        assert_eq!(normalize_dn("UID=JDuke, ou=People ,DC=jboss"), "uid=jduke,ou=people,dc=jboss");
        assert_eq!(parent("uid=a,dc=b"), "dc=b");
        assert_eq!(parent("dc=b"), "");
    }
}
