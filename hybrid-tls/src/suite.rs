//! Cipher suite descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version carried in Hello messages
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Protocol label mixed into the transcript
pub const PROTOCOL_ID: &str = "/hybrid-tls/1.0.0";

/// A negotiated combination of classical KEX, post-quantum KEM, AEAD and KDF.
///
/// Every suite uses X25519 for the classical half and HKDF-SHA256 for key
/// derivation; they differ in ML-KEM parameter set and record AEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum SuiteId {
    #[serde(rename = "X25519_MLKEM768_AES256GCM_SHA256")]
    X25519MlKem768Aes256Gcm = 0x0101,
    #[serde(rename = "X25519_MLKEM768_CHACHA20_SHA256")]
    X25519MlKem768ChaCha20 = 0x0102,
    #[serde(rename = "X25519_MLKEM1024_AES256GCM_SHA256")]
    X25519MlKem1024Aes256Gcm = 0x0201,
    #[serde(rename = "X25519_MLKEM1024_CHACHA20_SHA256")]
    X25519MlKem1024ChaCha20 = 0x0202,
}

/// Post-quantum KEM parameter sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PqKem {
    /// ML-KEM-768 (NIST security level 3)
    MlKem768,
    /// ML-KEM-1024 (NIST security level 5)
    MlKem1024,
}

/// Record-layer AEAD algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl SuiteId {
    /// Every suite this implementation supports, strongest KEM first
    pub const ALL: [SuiteId; 4] = [
        SuiteId::X25519MlKem1024Aes256Gcm,
        SuiteId::X25519MlKem1024ChaCha20,
        SuiteId::X25519MlKem768Aes256Gcm,
        SuiteId::X25519MlKem768ChaCha20,
    ];

    /// Convert from wire format
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0101 => Some(Self::X25519MlKem768Aes256Gcm),
            0x0102 => Some(Self::X25519MlKem768ChaCha20),
            0x0201 => Some(Self::X25519MlKem1024Aes256Gcm),
            0x0202 => Some(Self::X25519MlKem1024ChaCha20),
            _ => None,
        }
    }

    /// Convert to wire format
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn pq_kem(self) -> PqKem {
        match self {
            Self::X25519MlKem768Aes256Gcm | Self::X25519MlKem768ChaCha20 => PqKem::MlKem768,
            Self::X25519MlKem1024Aes256Gcm | Self::X25519MlKem1024ChaCha20 => PqKem::MlKem1024,
        }
    }

    pub fn aead(self) -> AeadAlgorithm {
        match self {
            Self::X25519MlKem768Aes256Gcm | Self::X25519MlKem1024Aes256Gcm => {
                AeadAlgorithm::Aes256Gcm
            }
            Self::X25519MlKem768ChaCha20 | Self::X25519MlKem1024ChaCha20 => {
                AeadAlgorithm::ChaCha20Poly1305
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X25519MlKem768Aes256Gcm => "X25519_MLKEM768_AES256GCM_SHA256",
            Self::X25519MlKem768ChaCha20 => "X25519_MLKEM768_CHACHA20_SHA256",
            Self::X25519MlKem1024Aes256Gcm => "X25519_MLKEM1024_AES256GCM_SHA256",
            Self::X25519MlKem1024ChaCha20 => "X25519_MLKEM1024_CHACHA20_SHA256",
        }
    }
}

impl fmt::Display for SuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl PqKem {
    /// Encapsulation (public) key length in bytes
    pub fn encapsulation_key_len(self) -> usize {
        match self {
            PqKem::MlKem768 => 1184,
            PqKem::MlKem1024 => 1568,
        }
    }

    /// Decapsulation (private) key length in bytes
    pub fn decapsulation_key_len(self) -> usize {
        match self {
            PqKem::MlKem768 => 2400,
            PqKem::MlKem1024 => 3168,
        }
    }

    /// Ciphertext length in bytes
    pub fn ciphertext_len(self) -> usize {
        match self {
            PqKem::MlKem768 => 1088,
            PqKem::MlKem1024 => 1568,
        }
    }
}

/// Pick the suite for a connection: the first entry of the server's
/// ordered preference list that the client also offered.
pub fn select_suite(server_preference: &[SuiteId], client_offer: &[u16]) -> Option<SuiteId> {
    server_preference
        .iter()
        .copied()
        .find(|suite| client_offer.contains(&suite.to_u16()))
}
