//! Hybrid X25519 + ML-KEM key exchange
//!
//! The server offers a share carrying an X25519 public key and an ML-KEM
//! encapsulation key. The client answers with its own X25519 public key
//! and an ML-KEM ciphertext. Both sides then feed the two component
//! secrets, the transcript digest and the suite id into a versioned
//! HKDF combiner:
//!
//! ```text
//! shared = HKDF-SHA256(salt = "hybrid-tls combiner v1",
//!                      ikm  = x25519_ss || mlkem_ss || transcript || suite_id)
//! ```

use hkdf::Hkdf;
use kem::{Decapsulate, Encapsulate};
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use subtle::{Choice, ConstantTimeEq};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::KexError;
use crate::suite::{PqKem, SuiteId};

/// X25519 public key length
pub const X25519_PUBLIC_LEN: usize = 32;

/// Shared secret length produced by the combiner
pub const SHARED_SECRET_LEN: usize = 32;

/// Version tag of the combiner function
pub const COMBINER_VERSION: u8 = 1;

const COMBINER_SALT: &[u8] = b"hybrid-tls combiner v1";
const COMBINER_INFO: &[u8] = b"hybrid-tls shared secret";

/// One side's public contribution to the hybrid exchange.
///
/// `post_quantum` is an ML-KEM encapsulation key when sent by the server
/// and an ML-KEM ciphertext when sent by the client.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct HybridKeyShare {
    pub classical: Vec<u8>,
    pub post_quantum: Vec<u8>,
}

impl fmt::Debug for HybridKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridKeyShare")
            .field("classical_len", &self.classical.len())
            .field("post_quantum_len", &self.post_quantum.len())
            .finish()
    }
}

/// Private material kept between sending our share and deriving the secret.
///
/// Consumed by [`derive_secret`]; zeroized on drop.
pub enum LocalKeyMaterial {
    /// We published an encapsulation key and will decapsulate the peer's ciphertext
    Decapsulator {
        classical: StaticSecret,
        decapsulation_key: Zeroizing<Vec<u8>>,
    },
    /// We already encapsulated to the peer and hold the KEM secret
    Encapsulated {
        classical: StaticSecret,
        post_quantum: Zeroizing<[u8; 32]>,
    },
}

/// Combined secret handed to the key schedule
pub struct SharedSecret(Zeroizing<[u8; SHARED_SECRET_LEN]>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Generate a fresh share carrying an ML-KEM encapsulation key.
pub fn generate_share(suite: SuiteId) -> Result<(HybridKeyShare, LocalKeyMaterial), KexError> {
    let classical = StaticSecret::random_from_rng(OsRng);
    let classical_public = PublicKey::from(&classical);
    let (decapsulation_key, encapsulation_key) = kem_generate(suite.pq_kem())?;

    let share = HybridKeyShare {
        classical: classical_public.as_bytes().to_vec(),
        post_quantum: encapsulation_key,
    };
    let local = LocalKeyMaterial::Decapsulator {
        classical,
        decapsulation_key,
    };
    Ok((share, local))
}

/// Generate a fresh share answering `peer_share` with an ML-KEM ciphertext.
pub fn encapsulate_share(
    suite: SuiteId,
    peer_share: &HybridKeyShare,
) -> Result<(HybridKeyShare, LocalKeyMaterial), KexError> {
    let kem = suite.pq_kem();
    if peer_share.classical.len() != X25519_PUBLIC_LEN
        || peer_share.post_quantum.len() != kem.encapsulation_key_len()
    {
        return Err(KexError::KeyMismatch);
    }

    let classical = StaticSecret::random_from_rng(OsRng);
    let classical_public = PublicKey::from(&classical);
    let (ciphertext, post_quantum) = kem_encapsulate(kem, &peer_share.post_quantum)?;

    let share = HybridKeyShare {
        classical: classical_public.as_bytes().to_vec(),
        post_quantum: ciphertext,
    };
    let local = LocalKeyMaterial::Encapsulated {
        classical,
        post_quantum,
    };
    Ok((share, local))
}

/// Derive the combined secret from our private material and the peer's share.
///
/// Both components are always computed and their validity is folded into
/// a single [`Choice`], so the failure path does not depend on which
/// component was bad.
pub fn derive_secret(
    suite: SuiteId,
    local: LocalKeyMaterial,
    peer_share: &HybridKeyShare,
    transcript_digest: &[u8; 32],
) -> Result<SharedSecret, KexError> {
    let classical_len_ok = Choice::from((peer_share.classical.len() == X25519_PUBLIC_LEN) as u8);
    let mut peer_public = [0u8; X25519_PUBLIC_LEN];
    if peer_share.classical.len() == X25519_PUBLIC_LEN {
        peer_public.copy_from_slice(&peer_share.classical);
    }
    let peer_public = PublicKey::from(peer_public);

    let (classical_secret, pq_secret, pq_ok) = match local {
        LocalKeyMaterial::Decapsulator {
            classical,
            decapsulation_key,
        } => {
            let dh = classical.diffie_hellman(&peer_public);
            let (secret, ok) = kem_decapsulate_ct(
                suite.pq_kem(),
                &decapsulation_key,
                &peer_share.post_quantum,
            )?;
            (Zeroizing::new(*dh.as_bytes()), secret, ok)
        }
        LocalKeyMaterial::Encapsulated {
            classical,
            post_quantum,
        } => {
            let dh = classical.diffie_hellman(&peer_public);
            // Our share carried the ciphertext; the peer's post-quantum field
            // is its encapsulation key, already consumed during encapsulation.
            let ok = Choice::from(
                (peer_share.post_quantum.len() == suite.pq_kem().encapsulation_key_len()) as u8,
            );
            (Zeroizing::new(*dh.as_bytes()), post_quantum, ok)
        }
    };

    let contributory = !classical_secret[..].ct_eq(&[0u8; 32][..]);
    let valid = classical_len_ok & contributory & pq_ok;

    let combined = combine(suite, &classical_secret, &pq_secret, transcript_digest)?;
    if bool::from(valid) {
        Ok(combined)
    } else {
        Err(KexError::KeyMismatch)
    }
}

fn combine(
    suite: SuiteId,
    classical: &[u8; 32],
    post_quantum: &[u8; 32],
    transcript_digest: &[u8; 32],
) -> Result<SharedSecret, KexError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 3 + 2));
    ikm.extend_from_slice(classical);
    ikm.extend_from_slice(post_quantum);
    ikm.extend_from_slice(transcript_digest);
    ikm.extend_from_slice(&suite.to_u16().to_be_bytes());

    let hk = Hkdf::<Sha256>::new(Some(COMBINER_SALT), &ikm);
    let mut out = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
    hk.expand(COMBINER_INFO, &mut out[..])
        .map_err(|e| KexError::KeyGeneration(format!("combiner expand failed: {e}")))?;
    Ok(SharedSecret(out))
}

macro_rules! ml_kem_variant {
    ($module:ident, $kem:ty, $params:ty, $ek_len:expr, $dk_len:expr, $ct_len:expr) => {
        mod $module {
            use super::*;
            use ml_kem::kem::{DecapsulationKey, EncapsulationKey};
            use ml_kem::{EncodedSizeUser, KemCore};

            pub(super) fn generate() -> (Zeroizing<Vec<u8>>, Vec<u8>) {
                let (dk, ek) = <$kem>::generate(&mut OsRng);
                (
                    Zeroizing::new(dk.as_bytes().to_vec()),
                    ek.as_bytes().to_vec(),
                )
            }

            pub(super) fn encapsulate(
                ek_bytes: &[u8],
            ) -> Result<(Vec<u8>, Zeroizing<[u8; 32]>), KexError> {
                let ek_bytes: [u8; $ek_len] =
                    ek_bytes.try_into().map_err(|_| KexError::KeyMismatch)?;
                let ek = EncapsulationKey::<$params>::from_bytes(&ek_bytes.into());
                let (ct, ss) = ek
                    .encapsulate(&mut OsRng)
                    .map_err(|e| KexError::KeyGeneration(format!("encapsulation failed: {e:?}")))?;
                let mut secret = Zeroizing::new([0u8; 32]);
                secret.copy_from_slice(&ss[..]);
                Ok((ct[..].to_vec(), secret))
            }

            pub(super) fn decapsulate(
                dk_bytes: &[u8],
                ct_bytes: &[u8; $ct_len],
            ) -> Result<Zeroizing<[u8; 32]>, KexError> {
                let dk_bytes: Zeroizing<[u8; $dk_len]> = Zeroizing::new(
                    dk_bytes
                        .try_into()
                        .map_err(|_| KexError::KeyGeneration("bad decapsulation key".into()))?,
                );
                let dk = DecapsulationKey::<$params>::from_bytes(&(*dk_bytes).into());
                let ss = dk
                    .decapsulate(&(*ct_bytes).into())
                    .map_err(|_| KexError::KeyMismatch)?;
                let mut secret = Zeroizing::new([0u8; 32]);
                secret.copy_from_slice(&ss[..]);
                Ok(secret)
            }

            pub(super) fn decapsulate_any(
                dk_bytes: &[u8],
                ct: &[u8],
            ) -> Result<(Zeroizing<[u8; 32]>, Choice), KexError> {
                // A wrong-length ciphertext still runs a full decapsulation
                // over a zero ciphertext so both paths cost the same.
                let mut ct_bytes = [0u8; $ct_len];
                let len_ok = Choice::from((ct.len() == $ct_len) as u8);
                if ct.len() == $ct_len {
                    ct_bytes.copy_from_slice(ct);
                }
                let secret = decapsulate(dk_bytes, &ct_bytes)?;
                Ok((secret, len_ok))
            }
        }
    };
}

ml_kem_variant!(
    ml_kem_768,
    ml_kem::MlKem768,
    ml_kem::MlKem768Params,
    1184,
    2400,
    1088
);
ml_kem_variant!(
    ml_kem_1024,
    ml_kem::MlKem1024,
    ml_kem::MlKem1024Params,
    1568,
    3168,
    1568
);

fn kem_generate(kem: PqKem) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), KexError> {
    let (dk, ek) = match kem {
        PqKem::MlKem768 => ml_kem_768::generate(),
        PqKem::MlKem1024 => ml_kem_1024::generate(),
    };
    if dk.len() != kem.decapsulation_key_len() || ek.len() != kem.encapsulation_key_len() {
        return Err(KexError::KeyGeneration(format!(
            "unexpected {kem:?} key sizes"
        )));
    }
    Ok((dk, ek))
}

fn kem_encapsulate(kem: PqKem, ek: &[u8]) -> Result<(Vec<u8>, Zeroizing<[u8; 32]>), KexError> {
    match kem {
        PqKem::MlKem768 => ml_kem_768::encapsulate(ek),
        PqKem::MlKem1024 => ml_kem_1024::encapsulate(ek),
    }
}

fn kem_decapsulate_ct(
    kem: PqKem,
    dk: &[u8],
    ct: &[u8],
) -> Result<(Zeroizing<[u8; 32]>, Choice), KexError> {
    match kem {
        PqKem::MlKem768 => ml_kem_768::decapsulate_any(dk, ct),
        PqKem::MlKem1024 => ml_kem_1024::decapsulate_any(dk, ct),
    }
}
