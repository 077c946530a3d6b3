//! Endpoint signing identities (ML-DSA-65, FIPS 204)
//!
//! A leaf certificate is the encoded ML-DSA-65 verifying key of the
//! endpoint presenting it, so pinning a leaf pins a key. Possession of the
//! matching signing key is proven in the handshake's CertificateVerify
//! message, which signs the transcript digest.

use ml_dsa::signature::{Signer, Verifier};
use ml_dsa::{Keypair, MlDsa65, B32};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::schedule::DIGEST_LEN;

/// Encoded ML-DSA-65 verifying key (the leaf certificate)
pub const VERIFYING_KEY_LEN: usize = 1952;
/// Encoded ML-DSA-65 signature
pub const SIGNATURE_LEN: usize = 3309;
/// Seed a signing key is expanded from
pub const SEED_LEN: usize = 32;

const SERVER_CONTEXT: &[u8] = b"hybrid-tls server CertificateVerify";
const CLIENT_CONTEXT: &[u8] = b"hybrid-tls client CertificateVerify";

/// Long-term signing key, kept as its seed
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningIdentity {
    seed: [u8; SEED_LEN],
}

impl SigningIdentity {
    /// Fresh identity from the OS RNG
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        Self { seed }
    }

    pub fn from_seed(seed: [u8; SEED_LEN]) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> &[u8; SEED_LEN] {
        &self.seed
    }

    /// Leaf certificate for this identity
    pub fn certificate(&self) -> Vec<u8> {
        self.signing_key().verifying_key().encode().to_vec()
    }

    /// Sign the transcript digest for a CertificateVerify message
    pub fn sign_transcript(&self, from_client: bool, digest: &[u8; DIGEST_LEN]) -> Vec<u8> {
        let signature: ml_dsa::Signature<MlDsa65> =
            self.signing_key().sign(&signed_content(from_client, digest));
        signature.encode().to_vec()
    }

    fn signing_key(&self) -> ml_dsa::SigningKey<MlDsa65> {
        let seed: B32 = self.seed.into();
        ml_dsa::SigningKey::<MlDsa65>::from_seed(&seed)
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity").finish_non_exhaustive()
    }
}

/// Verifying key taken from a peer's leaf certificate
#[derive(Clone)]
pub struct PeerKey {
    key: ml_dsa::VerifyingKey<MlDsa65>,
}

impl PeerKey {
    /// `None` when the leaf is not an ML-DSA-65 verifying key
    pub fn from_certificate(leaf: &[u8]) -> Option<Self> {
        let bytes: [u8; VERIFYING_KEY_LEN] = leaf.try_into().ok()?;
        Some(Self {
            key: ml_dsa::VerifyingKey::<MlDsa65>::decode(&bytes.into()),
        })
    }

    /// Check a CertificateVerify signature over `digest`
    pub fn verify_transcript(
        &self,
        from_client: bool,
        digest: &[u8; DIGEST_LEN],
        signature: &[u8],
    ) -> bool {
        let Ok(bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        let Some(signature) = ml_dsa::Signature::<MlDsa65>::decode(&bytes.into()) else {
            return false;
        };
        self.key
            .verify(&signed_content(from_client, digest), &signature)
            .is_ok()
    }
}

/// `context || 0x00 || transcript digest`; the context keeps a client
/// signature from being replayed as a server one
fn signed_content(from_client: bool, digest: &[u8; DIGEST_LEN]) -> Vec<u8> {
    let context = if from_client {
        CLIENT_CONTEXT
    } else {
        SERVER_CONTEXT
    };
    let mut content = Vec::with_capacity(context.len() + 1 + DIGEST_LEN);
    content.extend_from_slice(context);
    content.push(0);
    content.extend_from_slice(digest);
    content
}
