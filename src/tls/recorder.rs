//! Certificate recording.
//!
//! [`CertificateLedger`] keeps the recent chains a peer presented until it
//! is cleared. [`TrustAndRecordVerifier`] is the directory-side rustls client
//! verifier: it records the chain first, then trusts it unconditionally so
//! the handshake completes and the test can assert on what was shown.
//!
//! The ledger's lock only protects memory. Counts are meaningful when the
//! caller serializes probes: clear, one request, assert.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::debug;

use crate::tls::identity::CertSubject;

/// One observed certificate chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    /// Subject DN of the leaf; empty if the leaf does not parse.
    pub subject_dn: String,
    /// DER bytes of each certificate, leaf first.
    pub raw_chain: Vec<Vec<u8>>,
}

impl CertificateRecord {
    /// Build a record from a presented chain.
    #[must_use]
    pub fn from_chain(end_entity: &CertificateDer<'_>, intermediates: &[CertificateDer<'_>]) -> Self {
        let raw_chain = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|c| c.as_ref().to_vec())
            .collect();
        Self {
            subject_dn: CertSubject::dn_lossy(end_entity.as_ref()),
            raw_chain,
        }
    }
}

/// Records retained by a ledger built with [`CertificateLedger::new`].
pub const DEFAULT_RETENTION: usize = 64;

#[derive(Debug, Default)]
struct Entries {
    retained: VecDeque<CertificateRecord>,
    seen: usize,
}

/// Observed chains, cleared explicitly.
///
/// Only the most recent `retention` records are kept; [`count`](Self::count)
/// still reports every record since the last clear.
#[derive(Debug)]
pub struct CertificateLedger {
    entries: Mutex<Entries>,
    retention: usize,
}

impl Default for CertificateLedger {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl CertificateLedger {
    /// Create an empty ledger keeping [`DEFAULT_RETENTION`] records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty ledger keeping at most `retention` records.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            retention: retention.max(1),
        }
    }

    /// Append a record, dropping the oldest one past the retention limit.
    pub fn record(&self, record: CertificateRecord) {
        let mut entries = self.entries.lock();
        if entries.retained.len() == self.retention {
            entries.retained.pop_front();
        }
        entries.retained.push_back(record);
        entries.seen += 1;
    }

    /// Number of records since the last [`clear`](Self::clear).
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.lock().seen
    }

    /// Whether any retained leaf subject DN contains `needle`.
    #[must_use]
    pub fn contains_subject(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .retained
            .iter()
            .any(|r| r.subject_dn.contains(needle))
    }

    /// Snapshot of the retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<CertificateRecord> {
        self.entries.lock().retained.iter().cloned().collect()
    }

    /// Drop all records and reset the count.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.retained.clear();
        entries.seen = 0;
    }
}

/// Outcome of the verifier's trust decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// The chain is trusted; the handshake continues.
    Accept,
}

/// Directory-side client certificate verifier that trusts any chain and
/// records each one it sees.
#[derive(Debug)]
pub struct TrustAndRecordVerifier {
    ledger: Arc<CertificateLedger>,
    want_client_auth: bool,
    need_client_auth: bool,
    provider: Arc<CryptoProvider>,
}

impl TrustAndRecordVerifier {
    /// Create a verifier with a fresh ledger.
    ///
    /// `want_client_auth` makes the server send a certificate request;
    /// `need_client_auth` additionally fails handshakes in which the client
    /// presents nothing. Needing implies wanting.
    #[must_use]
    pub fn new(want_client_auth: bool, need_client_auth: bool) -> Self {
        Self {
            ledger: Arc::new(CertificateLedger::new()),
            want_client_auth: want_client_auth || need_client_auth,
            need_client_auth,
            provider: crate::tls::provider(),
        }
    }

    /// The trust decision for a presented chain.
    #[must_use]
    pub fn decide(&self, _chain: &[CertificateDer<'_>]) -> TrustDecision {
        TrustDecision::Accept
    }

    /// Record a presented chain.
    pub fn record(&self, end_entity: &CertificateDer<'_>, intermediates: &[CertificateDer<'_>]) {
        let record = CertificateRecord::from_chain(end_entity, intermediates);
        debug!(subject = %record.subject_dn, chain_len = record.raw_chain.len(), "client certificate recorded");
        self.ledger.record(record);
    }

    /// Number of client chains recorded since the last clear.
    #[must_use]
    pub fn count(&self) -> usize {
        self.ledger.count()
    }

    /// Whether a recorded client leaf subject contains `needle`.
    #[must_use]
    pub fn contains_subject(&self, needle: &str) -> bool {
        self.ledger.contains_subject(needle)
    }

    /// Reset the recorded chains.
    pub fn clear(&self) {
        self.ledger.clear();
    }

    /// Shared handle to the underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> Arc<CertificateLedger> {
        Arc::clone(&self.ledger)
    }
}

impl ClientCertVerifier for TrustAndRecordVerifier {
    fn offer_client_auth(&self) -> bool {
        self.want_client_auth
    }

    fn client_auth_mandatory(&self) -> bool {
        self.need_client_auth
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.record(end_entity, intermediates);

        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());
        match self.decide(&chain) {
            TrustDecision::Accept => Ok(ClientCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName as RcgenDn, DnType, KeyPair};

    fn cert(cn: &str) -> CertificateDer<'static> {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let mut dn = RcgenDn::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().clone()
    }

    #[test]
    fn clear_then_count_is_zero() {
        let verifier = TrustAndRecordVerifier::new(true, true);
        verifier.record(&cert("JBAS"), &[]);
        verifier.clear();
        assert_eq!(verifier.count(), 0);
    }

    #[test]
    fn query_before_any_handshake_is_empty() {
        let verifier = TrustAndRecordVerifier::new(true, false);
        assert_eq!(verifier.count(), 0);
        assert!(!verifier.contains_subject("CN="));
    }

    #[test]
    fn verify_records_and_accepts() {
        // GIVEN: a verifier and a client leaf
        let verifier = TrustAndRecordVerifier::new(true, true);
        // WHEN: rustls asks it to verify the chain
        let result = verifier.verify_client_cert(&cert("JBAS"), &[], UnixTime::now());
        // THEN: accepted and recorded exactly once
        assert!(result.is_ok());
        assert_eq!(verifier.count(), 1);
        assert!(verifier.contains_subject("CN=JBAS"));
        assert!(!verifier.contains_subject("CN=other"));
    }

    #[test]
    fn malformed_leaf_is_recorded_as_is() {
        let verifier = TrustAndRecordVerifier::new(true, true);
        let junk = CertificateDer::from(vec![0x30, 0x00]);
        verifier.record(&junk, &[]);

        let records = verifier.ledger().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject_dn, "");
        assert_eq!(records[0].raw_chain, vec![vec![0x30, 0x00]]);
    }

    #[test]
    fn record_keeps_intermediates_leaf_first() {
        let leaf = cert("leaf");
        let intermediate = cert("intermediate");
        let record = CertificateRecord::from_chain(&leaf, std::slice::from_ref(&intermediate));
        assert_eq!(record.raw_chain.len(), 2);
        assert_eq!(record.raw_chain[0], leaf.as_ref().to_vec());
    }

    #[test]
    fn ledger_keeps_counting_past_retention() {
        // GIVEN: a ledger that retains two records
        let ledger = CertificateLedger::with_retention(2);
        let subjects = ["CN=first", "CN=second", "CN=third"];

        // WHEN: three chains are recorded
        for subject in subjects {
            ledger.record(CertificateRecord {
                subject_dn: subject.to_string(),
                raw_chain: vec![vec![0x30, 0x00]],
            });
        }

        // THEN: all three are counted but only the newest two are kept
        assert_eq!(ledger.count(), 3);
        assert_eq!(ledger.records().len(), 2);
        assert!(!ledger.contains_subject("CN=first"));
        assert!(ledger.contains_subject("CN=third"));

        ledger.clear();
        assert_eq!(ledger.count(), 0);
        assert!(ledger.records().is_empty());
    }

    #[test]
    fn default_ledger_is_bounded() {
        let verifier = TrustAndRecordVerifier::new(true, true);
        let leaf = cert("JBAS");
        for _ in 0..DEFAULT_RETENTION + 10 {
            verifier.record(&leaf, &[]);
        }
        assert_eq!(verifier.count(), DEFAULT_RETENTION + 10);
        assert_eq!(verifier.ledger().records().len(), DEFAULT_RETENTION);
    }

    #[test]
    fn need_implies_want() {
        let verifier = TrustAndRecordVerifier::new(false, true);
        assert!(verifier.offer_client_auth());
        assert!(verifier.client_auth_mandatory());

        let optional = TrustAndRecordVerifier::new(true, false);
        assert!(optional.offer_client_auth());
        assert!(!optional.client_auth_mandatory());

        let none = TrustAndRecordVerifier::new(false, false);
        assert!(!none.offer_client_auth());
    }
}
