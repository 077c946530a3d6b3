//! Certificate verification collaborator
//!
//! Chain validation is delegated to a [`CertificateVerifier`]. The engine
//! only decides *when* to call it; what counts as a valid chain is up to
//! the implementation. [`PinnedCertificateVerifier`] is a small built-in
//! that pins SHA-256 fingerprints per subject.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// SHA-256 fingerprint of an encoded certificate
pub type Fingerprint = [u8; 32];

/// Compute the fingerprint of a certificate's encoding
pub fn fingerprint(certificate: &[u8]) -> Fingerprint {
    Sha256::digest(certificate).into()
}

/// Reasons a chain is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("empty certificate chain")]
    EmptyChain,

    #[error("no trust anchor matches the presented chain")]
    UntrustedChain,

    #[error("certificate is not valid for {0}")]
    IdentityMismatch(String),

    #[error("malformed trust anchor: {0}")]
    MalformedAnchor(String),

    #[error("{0}")]
    Other(String),
}

/// A trusted certificate, identified by subject and fingerprint
#[derive(Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    pub subject: String,
    pub fingerprint: Fingerprint,
}

impl TrustAnchor {
    pub fn new(subject: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            subject: subject.into(),
            fingerprint,
        }
    }

    /// Anchor that trusts exactly `certificate` for `subject`
    pub fn for_certificate(subject: impl Into<String>, certificate: &[u8]) -> Self {
        Self::new(subject, fingerprint(certificate))
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("subject", &self.subject)
            .field("fingerprint", &hex::encode(self.fingerprint))
            .finish()
    }
}

/// Parses `subject sha256-hex`
impl FromStr for TrustAnchor {
    type Err = CertificateError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let (Some(subject), Some(hex_fp), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CertificateError::MalformedAnchor(format!(
                "expected `subject fingerprint`, got {line:?}"
            )));
        };
        let bytes = hex::decode(hex_fp)
            .map_err(|e| CertificateError::MalformedAnchor(format!("{subject}: {e}")))?;
        let fingerprint: Fingerprint = bytes.try_into().map_err(|_| {
            CertificateError::MalformedAnchor(format!("{subject}: fingerprint must be 32 bytes"))
        })?;
        Ok(Self::new(subject, fingerprint))
    }
}

/// Parse a trust store: one anchor per line, `#` starts a comment
pub fn parse_trust_store(contents: &str) -> Result<Vec<TrustAnchor>, CertificateError> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}

/// Validates a peer's certificate chain
pub trait CertificateVerifier: Send + Sync {
    /// Check `chain` (leaf first) against `trust_anchors`.
    ///
    /// `expected_identity` is the server name a client dialed, or `None`
    /// when any trusted identity is acceptable.
    fn verify_chain(
        &self,
        chain: &[Vec<u8>],
        trust_anchors: &[TrustAnchor],
        expected_identity: Option<&str>,
    ) -> Result<(), CertificateError>;
}

/// Accepts a chain when one of its certificates is pinned by a trust anchor
#[derive(Debug, Default, Clone, Copy)]
pub struct PinnedCertificateVerifier;

impl CertificateVerifier for PinnedCertificateVerifier {
    fn verify_chain(
        &self,
        chain: &[Vec<u8>],
        trust_anchors: &[TrustAnchor],
        expected_identity: Option<&str>,
    ) -> Result<(), CertificateError> {
        if chain.is_empty() {
            return Err(CertificateError::EmptyChain);
        }

        let fingerprints: Vec<Fingerprint> = chain.iter().map(|c| fingerprint(c)).collect();
        let mut trusted = trust_anchors
            .iter()
            .filter(|anchor| fingerprints.contains(&anchor.fingerprint))
            .peekable();

        if trusted.peek().is_none() {
            return Err(CertificateError::UntrustedChain);
        }
        match expected_identity {
            None => Ok(()),
            Some(name) if trusted.any(|anchor| anchor.subject == name) => Ok(()),
            Some(name) => Err(CertificateError::IdentityMismatch(name.to_string())),
        }
    }
}
