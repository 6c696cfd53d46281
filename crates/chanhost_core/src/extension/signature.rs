//! Package signer comparison.
//!
//! # Responsibility
//! - Represent opaque package signer blobs.
//! - Decide whether a candidate package was signed by exactly the host signers.
//!
//! # Invariants
//! - Comparison is order-independent and all-or-nothing.
//! - A missing candidate signer list never matches.
//! - An empty host signer set never matches.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// One package signer certificate, kept as raw bytes.
///
/// Serialized as lowercase hex so manifests and config files stay textual.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parses a hex-encoded signer blob (case-insensitive, surrounding
    /// whitespace ignored).
    pub fn from_hex(value: &str) -> Result<Self, SignatureParseError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(SignatureParseError::Empty);
        }
        hex::decode(trimmed)
            .map(Self)
            .map_err(|err| SignatureParseError::InvalidHex(err.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Short sha256 fingerprint used in diagnostic log lines.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..8])
    }
}

impl TryFrom<String> for Signature {
    type Error = SignatureParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Signature> for String {
    fn from(value: Signature) -> Self {
        value.to_hex()
    }
}

/// Signer decode errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureParseError {
    Empty,
    InvalidHex(String),
}

impl Display for SignatureParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "signature value must not be empty"),
            Self::InvalidHex(err) => write!(f, "signature is not valid hex: {err}"),
        }
    }
}

impl Error for SignatureParseError {}

/// Returns whether `candidate` is signed by exactly the `host` signer set.
pub fn signers_match(host: &HashSet<Signature>, candidate: Option<&[Signature]>) -> bool {
    let Some(candidate) = candidate else {
        return false;
    };
    if host.is_empty() || candidate.len() != host.len() {
        return false;
    }
    let candidate: HashSet<&Signature> = candidate.iter().collect();
    candidate.len() == host.len() && candidate.iter().all(|signer| host.contains(*signer))
}

#[cfg(test)]
mod tests {
    use super::{signers_match, Signature, SignatureParseError};
    use std::collections::HashSet;

    fn set(values: &[&[u8]]) -> HashSet<Signature> {
        values.iter().map(|value| Signature::new(*value)).collect()
    }

    fn list(values: &[&[u8]]) -> Vec<Signature> {
        values.iter().map(|value| Signature::new(*value)).collect()
    }

    #[test]
    fn identical_sets_match_regardless_of_order() {
        let host = set(&[b"alpha", b"beta"]);
        assert!(signers_match(&host, Some(&list(&[b"alpha", b"beta"]))));
        assert!(signers_match(&host, Some(&list(&[b"beta", b"alpha"]))));
    }

    #[test]
    fn cardinality_mismatch_never_matches() {
        let host = set(&[b"alpha"]);
        assert!(!signers_match(&host, Some(&list(&[b"alpha", b"beta"]))));
        assert!(!signers_match(&host, Some(&[])));
    }

    #[test]
    fn duplicate_candidate_entries_do_not_fill_missing_signers() {
        let host = set(&[b"alpha", b"beta"]);
        assert!(!signers_match(&host, Some(&list(&[b"alpha", b"alpha"]))));
    }

    #[test]
    fn missing_candidate_list_or_unsigned_host_never_matches() {
        let host = set(&[b"alpha"]);
        assert!(!signers_match(&host, None));
        assert!(!signers_match(&HashSet::new(), Some(&[])));
    }

    #[test]
    fn different_membership_does_not_match() {
        let host = set(&[b"alpha", b"beta"]);
        assert!(!signers_match(&host, Some(&list(&[b"alpha", b"gamma"]))));
    }

    #[test]
    fn hex_roundtrip_and_parse_errors() {
        let signature = Signature::from_hex(" 0A0b ").expect("hex should parse");
        assert_eq!(signature.as_bytes(), &[0x0a, 0x0b]);
        assert_eq!(signature.to_hex(), "0a0b");
        assert_eq!(signature.fingerprint().len(), 16);

        assert_eq!(Signature::from_hex("  "), Err(SignatureParseError::Empty));
        assert!(matches!(
            Signature::from_hex("xyz"),
            Err(SignatureParseError::InvalidHex(_))
        ));
    }
}
