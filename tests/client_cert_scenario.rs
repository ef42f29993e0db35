//! End-to-end client certificate presentation tests
//!
//! Runs the full flow against the embedded directory:
//! - HTTP Basic request → security domain → realm → outbound connection
//! - TLS 1.3 handshake with or without the realm identity
//! - LDAP manager bind, user search and user bind
//! - Directory-side recording of presented client certificates

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pretty_assertions::assert_eq;
use tower::ServiceExt;

use realm_ldaps::auth::{AuthOutcome, AuthenticationEvaluator};
use realm_ldaps::config::DeploymentConfig;
use realm_ldaps::directory::{Directory, DirectoryConfig, TransportConfig};
use realm_ldaps::realm::{
    LdapAuthentication, ManagementModel, OutboundLdapConnection, SecurityDomain, SecurityRealm,
    StoreRef,
};
use realm_ldaps::secrets::Secret;
use realm_ldaps::tls::recorder::DEFAULT_RETENTION;
use realm_ldaps::tls::{self, CaParams, CertGenerator, LeafCertParams};
use realm_ldaps::web::{AppState, create_router};

const PEOPLE_LDIF: &str = "\
dn: dc=jboss,dc=org
dc: jboss
objectClass: top
objectClass: domain

dn: ou=People,dc=jboss,dc=org
objectClass: top
objectClass: organizationalUnit
ou: People

dn: uid=jduke,ou=People,dc=jboss,dc=org
objectClass: top
objectClass: person
objectClass: inetOrgPerson
uid: jduke
cn: Java Duke
sn: Duke
userPassword: theduke
";

struct Harness {
    _certs: tempfile::TempDir,
    directory: Directory,
    evaluator: AuthenticationEvaluator,
    router: Router,
}

impl Harness {
    async fn start(transport: TransportConfig) -> Self {
        let certs = tempfile::tempdir().unwrap();
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "realm-ldaps test CA",
            validity_days: 1,
        })
        .unwrap();
        let ldaps = CertGenerator::issue_leaf(
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
        let jbas = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn: "JBAS",
                ou: None,
                sans: vec!["jbas".to_string()],
                validity_days: 1,
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        CertGenerator::write_to_dir(&ldaps, certs.path(), "ldaps").unwrap();
        CertGenerator::write_to_dir(&jbas, certs.path(), "jbas").unwrap();
        let truststore = certs.path().join("jbas.truststore");
        fs::write(&truststore, &ca.cert_pem).unwrap();

        let directory_keystore = certs.path().join("ldaps.keystore");
        let config = DirectoryConfig::builder()
            .suffix("dc=jboss,dc=org")
            .ldif(PEOPLE_LDIF)
            .unwrap()
            .admin("uid=admin,ou=system", "secret")
            .keystore(tls::load_keystore(&directory_keystore.to_string_lossy(), None).unwrap())
            .transport(transport)
            .build()
            .unwrap();
        let directory = Directory::start(config).await.unwrap();

        let model = ManagementModel::new();
        model
            .add_security_realm(SecurityRealm {
                truststore: Some(StoreRef {
                    path: truststore.to_string_lossy().into_owned(),
                    password: None,
                }),
                server_identity: Some(StoreRef {
                    path: certs.path().join("jbas.keystore").to_string_lossy().into_owned(),
                    password: None,
                }),
                ..SecurityRealm::named("ssl-conf-realm")
            })
            .unwrap();
        for (flavour, always) in [("sometimes", false), ("always", true)] {
            model
                .add_outbound_connection(OutboundLdapConnection {
                    name: format!("test-ldaps-{flavour}"),
                    url: directory.ldaps_url(),
                    search_dn: "uid=admin,ou=system".to_string(),
                    search_credential: Secret::new("secret"),
                    security_realm: Some("ssl-conf-realm".to_string()),
                    always_send_client_cert: always,
                    handshake_timeout: Duration::from_secs(5),
                })
                .unwrap();
            model
                .add_security_realm(SecurityRealm {
                    ldap: Some(LdapAuthentication {
                        connection: format!("test-ldaps-{flavour}"),
                        base_dn: "ou=People,dc=jboss,dc=org".to_string(),
                        recursive: true,
                        username_attribute: "uid".to_string(),
                    }),
                    ..SecurityRealm::named(format!("ldaps-authn-realm-{flavour}"))
                })
                .unwrap();
            model
                .add_security_domain(SecurityDomain::realm_direct(
                    format!("ldaps-authn-sd-{flavour}"),
                    format!("ldaps-authn-realm-{flavour}"),
                ))
                .unwrap();
        }

        let evaluator = AuthenticationEvaluator::new(Arc::new(model));
        let deployments = ["sometimes", "always"].map(|flavour| DeploymentConfig {
            name: format!("ldaps-authn-{flavour}"),
            security_domain: format!("ldaps-authn-sd-{flavour}"),
            resources: [("index.html".to_string(), "OK".to_string())].into(),
        });
        let router = create_router(Arc::new(AppState::new(
            evaluator.clone(),
            deployments,
            Duration::from_secs(10),
        )));

        Self {
            _certs: certs,
            directory,
            evaluator,
            router,
        }
    }

    /// Clear the recorder, make one request, return status and body.
    async fn probe(&self, deployment: &str, username: &str, password: &str) -> (StatusCode, String) {
        self.directory.verifier().clear();
        let credentials = STANDARD.encode(format!("{username}:{password}"));
        let request = Request::get(format!("/{deployment}/index.html"))
            .header(header::AUTHORIZATION, format!("Basic {credentials}"))
            .body(Body::empty())
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn client_cert_count(&self) -> usize {
        self.directory.verifier().count()
    }
}

#[tokio::test]
async fn sometimes_realm_with_bad_password_is_401_after_one_client_cert() {
    let harness = Harness::start(TransportConfig::client_auth_required()).await;

    let (status, _) = harness.probe("ldaps-authn-sometimes", "jduke", "bad_password").await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.client_cert_count(), 1);
    harness.directory.stop().await;
}

#[tokio::test]
async fn sometimes_realm_with_good_password_is_still_401() {
    // GIVEN: a directory that needs client auth and a realm that only sends
    // its identity on the search connection
    let harness = Harness::start(TransportConfig::client_auth_required()).await;

    // WHEN: the correct password is supplied
    let (status, _) = harness.probe("ldaps-authn-sometimes", "jduke", "theduke").await;

    // THEN: the user-verification handshake carries no certificate and fails
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.client_cert_count(), 1);
    assert!(harness.directory.verifier().contains_subject("CN=JBAS"));
    harness.directory.stop().await;
}

#[tokio::test]
async fn always_realm_with_bad_password_is_401_after_one_client_cert() {
    let harness = Harness::start(TransportConfig::client_auth_required()).await;

    let (status, _) = harness.probe("ldaps-authn-always", "jduke", "bad_password").await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.client_cert_count(), 1);
    harness.directory.stop().await;
}

#[tokio::test]
async fn always_realm_with_good_password_is_200_and_presents_jbas() {
    // GIVEN: a directory that needs client auth and a realm that always
    // presents its identity
    let harness = Harness::start(TransportConfig::client_auth_required()).await;

    // WHEN: the correct password is supplied
    let (status, body) = harness.probe("ldaps-authn-always", "jduke", "theduke").await;

    // THEN: accepted, one handshake, and the presented identity is CN=JBAS
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert_eq!(harness.client_cert_count(), 1);
    assert!(harness.directory.verifier().contains_subject("CN=JBAS"));
    harness.directory.stop().await;
}

#[tokio::test]
async fn scenario_in_sequence_with_clear_between_probes() {
    let harness = Harness::start(TransportConfig::client_auth_required()).await;

    let expected = [
        ("ldaps-authn-sometimes", "bad_password", StatusCode::UNAUTHORIZED),
        ("ldaps-authn-sometimes", "theduke", StatusCode::UNAUTHORIZED),
        ("ldaps-authn-always", "bad_password", StatusCode::UNAUTHORIZED),
        ("ldaps-authn-always", "theduke", StatusCode::OK),
    ];
    for (deployment, password, status) in expected {
        let (got, _) = harness.probe(deployment, "jduke", password).await;
        assert_eq!(got, status, "{deployment} / {password}");
        assert_eq!(harness.client_cert_count(), 1, "{deployment} / {password}");
    }

    harness.directory.verifier().clear();
    assert_eq!(harness.client_cert_count(), 0);
    harness.directory.stop().await;
}

#[tokio::test]
async fn server_and_client_identities_are_counted_separately() {
    let harness = Harness::start(TransportConfig::client_auth_required()).await;
    let servers = harness.evaluator.server_identities();

    // "always" re-binds on the search connection: one handshake
    servers.clear();
    harness.probe("ldaps-authn-always", "jduke", "theduke").await;
    assert_eq!(servers.count(), 1);
    assert!(servers.contains_subject("CN=ldaps"));
    assert!(!servers.contains_subject("CN=JBAS"));

    // "sometimes" opens a second, trust-only connection for the user bind
    servers.clear();
    harness.probe("ldaps-authn-sometimes", "jduke", "theduke").await;
    assert_eq!(servers.count(), 2);
    assert_eq!(harness.client_cert_count(), 1);
    harness.directory.stop().await;
}

#[tokio::test]
async fn ledgers_stay_bounded_across_many_requests() {
    // GIVEN: a directory that only asks for a certificate, so every
    // "sometimes" request opens two connections
    let harness = Harness::start(TransportConfig {
        need_client_auth: false,
        want_client_auth: true,
    })
    .await;
    let requests = DEFAULT_RETENTION / 2 + 1;

    // WHEN: more requests are served than the ledgers retain
    for _ in 0..requests {
        let credentials = STANDARD.encode("jduke:theduke");
        let request = Request::get("/ldaps-authn-sometimes/index.html")
            .header(header::AUTHORIZATION, format!("Basic {credentials}"))
            .body(Body::empty())
            .unwrap();
        let response = harness.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // THEN: every observation is counted but only the newest are kept
    let servers = harness.evaluator.server_identities();
    assert_eq!(servers.count(), requests * 2);
    assert_eq!(servers.records().len(), DEFAULT_RETENTION);
    assert_eq!(harness.evaluator.presented_identities().count(), requests);
    assert_eq!(harness.client_cert_count(), requests);
    assert!(harness.directory.verifier().ledger().records().len() <= DEFAULT_RETENTION);
    harness.directory.stop().await;
}

#[tokio::test]
async fn optional_client_auth_lets_sometimes_realm_accept() {
    // GIVEN: a directory that asks for, but does not need, a certificate
    let harness = Harness::start(TransportConfig {
        need_client_auth: false,
        want_client_auth: true,
    })
    .await;

    // WHEN: authenticating through the "sometimes" realm
    let (status, body) = harness.probe("ldaps-authn-sometimes", "jduke", "theduke").await;

    // THEN: the trust-only user bind succeeds; only the search connection
    // presented a certificate
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert_eq!(harness.client_cert_count(), 1);
    harness.directory.stop().await;
}

#[tokio::test]
async fn no_certificate_is_sent_when_the_directory_does_not_ask() {
    let harness = Harness::start(TransportConfig::default()).await;

    let (status, _) = harness.probe("ldaps-authn-always", "jduke", "theduke").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(harness.client_cert_count(), 0);
    assert_eq!(harness.evaluator.presented_identities().count(), 0);
    harness.directory.stop().await;
}

#[tokio::test]
async fn evaluator_outcomes_without_http() {
    let harness = Harness::start(TransportConfig::client_auth_required()).await;
    let evaluator = &harness.evaluator;

    assert_eq!(
        evaluator
            .authenticate("ldaps-authn-realm-always", "jduke", "theduke")
            .await
            .unwrap(),
        AuthOutcome::Accepted
    );
    assert_eq!(
        evaluator
            .authenticate("ldaps-authn-realm-always", "jduke", "bad_password")
            .await
            .unwrap(),
        AuthOutcome::Rejected
    );
    assert_eq!(
        evaluator
            .authenticate("ldaps-authn-realm-always", "nobody", "theduke")
            .await
            .unwrap(),
        AuthOutcome::Rejected
    );
    assert_eq!(
        evaluator
            .authenticate("ldaps-authn-realm-always", "jduke", "")
            .await
            .unwrap(),
        AuthOutcome::Rejected
    );

    let err = evaluator
        .authenticate("ldaps-authn-realm-sometimes", "jduke", "theduke")
        .await
        .unwrap_err();
    assert!(
        err.is_handshake_failure() || matches!(err, realm_ldaps::Error::Transport(_)),
        "unexpected error: {err}"
    );
    harness.directory.stop().await;
}

#[tokio::test]
async fn wrong_password_is_rejected_whatever_the_flag() {
    // GIVEN: a directory that asks for, but does not need, a certificate so
    // the "sometimes" user bind gets through the handshake
    let harness = Harness::start(TransportConfig {
        need_client_auth: false,
        want_client_auth: true,
    })
    .await;

    for realm in ["ldaps-authn-realm-always", "ldaps-authn-realm-sometimes"] {
        // WHEN: the password is wrong
        let outcome = harness
            .evaluator
            .authenticate(realm, "jduke", "bad_password")
            .await
            .unwrap();

        // THEN: a rejection value, not an error
        assert_eq!(outcome, AuthOutcome::Rejected, "{realm}");
    }
    harness.directory.stop().await;
}

#[tokio::test]
async fn wrong_manager_credential_is_an_error_not_a_rejection() {
    let harness = Harness::start(TransportConfig::client_auth_required()).await;
    let model = harness.evaluator.model();
    let mut conn = model.outbound_connection("test-ldaps-always").unwrap();
    conn.search_credential = Secret::new("wrong");
    model.update_outbound_connection(conn).unwrap();

    let err = harness
        .evaluator
        .authenticate("ldaps-authn-realm-always", "jduke", "theduke")
        .await
        .unwrap_err();

    assert!(matches!(err, realm_ldaps::Error::Ldap { .. }), "unexpected error: {err}");
    harness.directory.stop().await;
}
