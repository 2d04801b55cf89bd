//! Server certificate trust decisions, including the digest-pinning fallback.
//!
//! Pure and synchronous: no I/O happens here, so the TLS handshake can consult
//! it from inside certificate verification.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use ring::digest;
use rustls::pki_types::CertificateDer;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

pub const DIGEST_LEN: usize = 20;

/// SHA-1 digest of a DER certificate, the legacy pin format.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertDigest([u8; DIGEST_LEN]);

impl CertDigest {
    pub fn of(der: &[u8]) -> Self {
        let d = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, der);
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(d.as_ref());
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &CertDigest) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl FromStr for CertDigest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s.trim(), &mut out)?;
        Ok(Self(out))
    }
}

impl fmt::Display for CertDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CertDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertDigest({})", self.to_hex())
    }
}

/// One validation failure reported by the TLS stack, kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIssue(pub String);

impl From<&rustls::Error> for CertificateIssue {
    fn from(e: &rustls::Error) -> Self {
        Self(e.to_string())
    }
}

impl fmt::Display for CertificateIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDecision {
    pub trusted: bool,
    /// Empty when trusted.
    pub reasons: Vec<CertificateIssue>,
    /// Digest of the presented leaf, so a caller can offer to pin it.
    pub leaf_digest: Option<CertDigest>,
}

/// Read-only view of previously pinned certificate digests.
pub trait PinStore: Send + Sync {
    fn lookup_pinned_digest(&self, host: &str, port: u16) -> Option<CertDigest>;
}

/// In-memory pin store.
#[derive(Debug, Default)]
pub struct MemoryPinStore {
    pins: RwLock<HashMap<(String, u16), CertDigest>>,
}

impl MemoryPinStore {
    pub fn insert(&self, host: &str, port: u16, digest: CertDigest) {
        let mut pins = self.pins.write().unwrap_or_else(|p| p.into_inner());
        pins.insert((host.to_owned(), port), digest);
    }

    pub fn len(&self) -> usize {
        self.pins.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<((String, u16), CertDigest)> {
        let pins = self.pins.read().unwrap_or_else(|p| p.into_inner());
        pins.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

impl PinStore for MemoryPinStore {
    fn lookup_pinned_digest(&self, host: &str, port: u16) -> Option<CertDigest> {
        let pins = self.pins.read().unwrap_or_else(|p| p.into_inner());
        pins.get(&(host.to_owned(), port)).copied()
    }
}

/// Decide whether to trust `chain` for `(host, port)`.
///
/// `validation_errors` is what the TLS stack's own verification reported;
/// empty means it accepted the chain. Otherwise trust is granted only when the
/// leaf's SHA-1 digest equals the pin stored for this host and port.
pub fn evaluate(
    chain: &[CertificateDer<'_>],
    validation_errors: &[CertificateIssue],
    host: &str,
    port: u16,
    pins: &dyn PinStore,
) -> CertificateDecision {
    let leaf_digest = chain.first().map(|leaf| CertDigest::of(leaf.as_ref()));

    if validation_errors.is_empty() {
        debug!(host, port, "certificate chain accepted by native validation");
        return CertificateDecision {
            trusted: true,
            reasons: Vec::new(),
            leaf_digest,
        };
    }

    let pinned = pins.lookup_pinned_digest(host, port);
    let trusted = match (&leaf_digest, &pinned) {
        (Some(leaf), Some(pin)) => leaf.matches(pin),
        _ => false,
    };

    if trusted {
        info!(host, port, "untrusted certificate matches pinned digest, proceeding");
        CertificateDecision {
            trusted: true,
            reasons: Vec::new(),
            leaf_digest,
        }
    } else {
        if pinned.is_some() {
            warn!(
                host,
                port,
                "certificate digest does not match the pinned digest, possible man-in-the-middle"
            );
        }
        CertificateDecision {
            trusted: false,
            reasons: validation_errors.to_vec(),
            leaf_digest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(bytes: &[u8]) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(bytes.to_vec())]
    }

    fn issues() -> Vec<CertificateIssue> {
        vec![
            CertificateIssue("invalid peer certificate: UnknownIssuer".into()),
            CertificateIssue("certificate expired".into()),
        ]
    }

    #[test]
    fn digest_is_sha1() {
        let d = CertDigest::of(b"abc");
        assert_eq!(d.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn digest_hex_roundtrip() {
        let d = CertDigest::of(b"certificate");
        let parsed: CertDigest = d.to_hex().parse().unwrap();
        assert_eq!(parsed, d);
        assert!(parsed.matches(&d));
    }

    #[test]
    fn digest_parse_rejects_bad_hex() {
        assert!("zz".parse::<CertDigest>().is_err());
        assert!("a9993e36".parse::<CertDigest>().is_err());
    }

    #[test]
    fn native_accept_trusts_without_lookup() {
        let pins = MemoryPinStore::default();
        let decision = evaluate(&leaf(b"cert"), &[], "example.org", 9987, &pins);
        assert!(decision.trusted);
        assert!(decision.reasons.is_empty());
        assert_eq!(decision.leaf_digest, Some(CertDigest::of(b"cert")));
    }

    #[test]
    fn matching_pin_overrides_validation_errors() {
        let pins = MemoryPinStore::default();
        pins.insert("example.org", 9987, CertDigest::of(b"cert"));
        let decision = evaluate(&leaf(b"cert"), &issues(), "example.org", 9987, &pins);
        assert!(decision.trusted);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn mismatched_pin_keeps_reasons_verbatim() {
        let pins = MemoryPinStore::default();
        pins.insert("example.org", 9987, CertDigest::of(b"other"));
        let decision = evaluate(&leaf(b"cert"), &issues(), "example.org", 9987, &pins);
        assert!(!decision.trusted);
        assert_eq!(decision.reasons, issues());
    }

    #[test]
    fn pin_for_other_port_does_not_apply() {
        let pins = MemoryPinStore::default();
        pins.insert("example.org", 1234, CertDigest::of(b"cert"));
        let decision = evaluate(&leaf(b"cert"), &issues(), "example.org", 9987, &pins);
        assert!(!decision.trusted);
    }

    #[test]
    fn unpinned_is_rejected() {
        let pins = MemoryPinStore::default();
        let decision = evaluate(&leaf(b"cert"), &issues(), "example.org", 9987, &pins);
        assert!(!decision.trusted);
        assert_eq!(decision.reasons.len(), 2);
        assert_eq!(decision.leaf_digest, Some(CertDigest::of(b"cert")));
    }

    #[test]
    fn empty_chain_is_rejected() {
        let pins = MemoryPinStore::default();
        let decision = evaluate(&[], &issues(), "example.org", 9987, &pins);
        assert!(!decision.trusted);
        assert!(decision.leaf_digest.is_none());
    }

    #[test]
    fn only_leaf_is_digested() {
        let pins = MemoryPinStore::default();
        pins.insert("h", 1, CertDigest::of(b"leaf"));
        let chain = vec![
            CertificateDer::from(b"leaf".to_vec()),
            CertificateDer::from(b"intermediate".to_vec()),
        ];
        assert!(evaluate(&chain, &issues(), "h", 1, &pins).trusted);
    }
}
