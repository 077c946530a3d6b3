//! Record protection for established connections
//!
//! Each direction has its own [`RecordCipher`] with an independent key, IV
//! and sequence number. A sealed record is the AEAD encryption of
//!
//! ```text
//! inner = content || inner_type || zero padding (up to min_record_size)
//! ```
//!
//! with nonce `IV xor seq` and associated data
//! `0x17 || ciphertext_len(u32) || seq(u64)`, so a replayed, dropped or
//! reordered record fails authentication.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroizing;

use crate::error::{HybridTlsError, Result, Violation};
use crate::handshake::{HandshakeState, Role};
use crate::schedule::{DirectionKeys, SessionKeys, IV_LEN};
use crate::suite::{AeadAlgorithm, SuiteId};
use crate::wire::{Alert, ContentType, TAG_LEN};

/// Which way a record travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Content type carried inside the encrypted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InnerType {
    Alert = 0x15,
    ApplicationData = 0x17,
    KeyUpdate = 0x18,
}

impl InnerType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x15 => Some(Self::Alert),
            0x17 => Some(Self::ApplicationData),
            0x18 => Some(Self::KeyUpdate),
            _ => None,
        }
    }
}

/// Decrypted record contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordContent {
    ApplicationData(Vec<u8>),
    Alert(Alert),
    /// The peer ratcheted its send keys; the receive side has already followed
    KeyUpdate,
}

/// Size limits applied to every record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLimits {
    pub min_record_size: usize,
    pub max_record_size: usize,
}

impl RecordLimits {
    /// Largest ciphertext (without tag) a peer may legitimately send
    pub fn max_ciphertext_len(&self) -> usize {
        self.max_record_size.max(self.min_record_size) + 1
    }
}

enum AeadCipher {
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    fn new(algorithm: AeadAlgorithm, key: &[u8]) -> Result<Self> {
        let cipher = match algorithm {
            AeadAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(|c| AeadCipher::Aes256Gcm(Box::new(c))),
            AeadAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(|c| AeadCipher::ChaCha20Poly1305(Box::new(c))),
        };
        cipher.map_err(|e| HybridTlsError::KeyGeneration(format!("invalid record key: {e}")))
    }

    fn encrypt(&self, nonce: &[u8; IV_LEN], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
        match self {
            AeadCipher::Aes256Gcm(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload).ok(),
            AeadCipher::ChaCha20Poly1305(c) => c
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .ok(),
        }
    }

    fn decrypt(&self, nonce: &[u8; IV_LEN], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
        match self {
            AeadCipher::Aes256Gcm(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload).ok(),
            AeadCipher::ChaCha20Poly1305(c) => c
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .ok(),
        }
    }
}

/// AEAD state for one direction of a connection
pub struct RecordCipher {
    algorithm: AeadAlgorithm,
    keys: DirectionKeys,
    cipher: AeadCipher,
    seq: u64,
    generation: u64,
    limits: RecordLimits,
}

impl RecordCipher {
    fn new(algorithm: AeadAlgorithm, keys: DirectionKeys, limits: RecordLimits) -> Result<Self> {
        let cipher = AeadCipher::new(algorithm, &keys.key)?;
        Ok(Self {
            algorithm,
            keys,
            cipher,
            seq: 0,
            generation: 0,
            limits,
        })
    }

    /// Sequence number of the next record
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Number of key updates applied so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Seal `content` as a record of the given inner type.
    ///
    /// Returns `ciphertext || tag`.
    pub fn seal(&mut self, content: &[u8], inner_type: InnerType) -> Result<Vec<u8>> {
        if content.len() > self.limits.max_record_size {
            return Err(HybridTlsError::RecordTooLarge {
                size: content.len(),
                max: self.limits.max_record_size,
            });
        }
        if self.seq == u64::MAX {
            return Err(HybridTlsError::SequenceExhausted);
        }

        let inner_len = (content.len() + 1).max(self.limits.min_record_size);
        let mut inner = Zeroizing::new(Vec::with_capacity(inner_len));
        inner.extend_from_slice(content);
        inner.push(inner_type as u8);
        inner.resize(inner_len, 0);

        let nonce = self.nonce();
        let aad = record_aad(inner_len, self.seq);
        let sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &inner,
                    aad: &aad,
                },
            )
            .ok_or_else(|| HybridTlsError::KeyGeneration("record encryption failed".into()))?;
        self.seq += 1;
        Ok(sealed)
    }

    /// Open `ciphertext || tag`, returning the inner type and content
    pub fn open(&mut self, sealed: &[u8]) -> Result<(InnerType, Vec<u8>)> {
        if sealed.len() <= TAG_LEN {
            return Err(HybridTlsError::RecordFraming(format!(
                "record of {} bytes is shorter than its tag",
                sealed.len()
            )));
        }
        let ct_len = sealed.len() - TAG_LEN;
        if ct_len > self.limits.max_ciphertext_len() {
            return Err(HybridTlsError::RecordFraming(format!(
                "record of {ct_len} bytes exceeds maximum"
            )));
        }
        if self.seq == u64::MAX {
            return Err(HybridTlsError::SequenceExhausted);
        }

        let nonce = self.nonce();
        let aad = record_aad(ct_len, self.seq);
        let inner = Zeroizing::new(
            self.cipher
                .decrypt(
                    &nonce,
                    Payload {
                        msg: sealed,
                        aad: &aad,
                    },
                )
                .ok_or(HybridTlsError::AuthenticationFailed)?,
        );
        self.seq += 1;

        let type_pos = inner
            .iter()
            .rposition(|&b| b != 0)
            .ok_or_else(|| HybridTlsError::RecordFraming("record has no inner type".into()))?;
        let inner_type = InnerType::from_u8(inner[type_pos]).ok_or_else(|| {
            HybridTlsError::RecordFraming(format!("unknown inner type {:#04x}", inner[type_pos]))
        })?;
        Ok((inner_type, inner[..type_pos].to_vec()))
    }

    /// Replace the keys with the next generation and restart the sequence
    pub fn ratchet(&mut self) -> Result<()> {
        let next = self.keys.next_generation();
        self.cipher = AeadCipher::new(self.algorithm, &next.key)?;
        self.keys = next;
        self.seq = 0;
        self.generation += 1;
        Ok(())
    }

    fn nonce(&self) -> [u8; IV_LEN] {
        let mut nonce = self.keys.iv;
        for (n, s) in nonce[IV_LEN - 8..].iter_mut().zip(self.seq.to_be_bytes()) {
            *n ^= s;
        }
        nonce
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&mut self, seq: u64) {
        self.seq = seq;
    }
}

fn record_aad(ct_len: usize, seq: u64) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[0] = ContentType::ApplicationData as u8;
    aad[1..5].copy_from_slice(&(ct_len as u32).to_be_bytes());
    aad[5..].copy_from_slice(&seq.to_be_bytes());
    aad
}

fn decode_content(inner_type: InnerType, content: Vec<u8>) -> Result<RecordContent> {
    match inner_type {
        InnerType::ApplicationData => Ok(RecordContent::ApplicationData(content)),
        InnerType::Alert => Ok(RecordContent::Alert(Alert::decode(&content)?)),
        InnerType::KeyUpdate => Ok(RecordContent::KeyUpdate),
    }
}

/// Both directions of record protection for one connection.
///
/// Created at `KeysDerived` and inert until [`RecordEngine::activate`] is
/// called at `Established`.
pub struct RecordEngine {
    suite: SuiteId,
    client_to_server: RecordCipher,
    server_to_client: RecordCipher,
    active: bool,
}

impl RecordEngine {
    pub fn new(suite: SuiteId, keys: &SessionKeys, limits: RecordLimits) -> Result<Self> {
        let algorithm = suite.aead();
        Ok(Self {
            suite,
            client_to_server: RecordCipher::new(algorithm, keys.client_to_server.clone(), limits)?,
            server_to_client: RecordCipher::new(algorithm, keys.server_to_client.clone(), limits)?,
            active: false,
        })
    }

    pub fn suite(&self) -> SuiteId {
        self.suite
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn activate(&mut self) {
        self.active = true;
    }

    /// Seal application data travelling in `direction`
    pub fn seal(&mut self, plaintext: &[u8], direction: Direction) -> Result<Vec<u8>> {
        self.ensure_active()?;
        self.cipher(direction)
            .seal(plaintext, InnerType::ApplicationData)
    }

    /// Open a record travelling in `direction`
    pub fn open(&mut self, record: &[u8], direction: Direction) -> Result<RecordContent> {
        self.ensure_active()?;
        let cipher = self.cipher(direction);
        let (inner_type, content) = cipher.open(record)?;
        if inner_type == InnerType::KeyUpdate {
            cipher.ratchet()?;
        }
        decode_content(inner_type, content)
    }

    /// Seal a key update in `direction` and ratchet that direction's keys
    pub fn key_update(&mut self, direction: Direction) -> Result<Vec<u8>> {
        self.ensure_active()?;
        let cipher = self.cipher(direction);
        let sealed = cipher.seal(&[], InnerType::KeyUpdate)?;
        cipher.ratchet()?;
        Ok(sealed)
    }

    /// Split into the halves a connection endpoint of `role` uses
    pub fn into_halves(
        self,
        role: Role,
        rekey_after_records: u64,
    ) -> Result<(RecordSender, RecordReceiver)> {
        self.ensure_active()?;
        let (send, recv) = match role {
            Role::Client => (self.client_to_server, self.server_to_client),
            Role::Server => (self.server_to_client, self.client_to_server),
        };
        Ok((
            RecordSender {
                cipher: send,
                rekey_after_records,
            },
            RecordReceiver { cipher: recv },
        ))
    }

    fn cipher(&mut self, direction: Direction) -> &mut RecordCipher {
        match direction {
            Direction::ClientToServer => &mut self.client_to_server,
            Direction::ServerToClient => &mut self.server_to_client,
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(HybridTlsError::violation(
                HandshakeState::KeysDerived,
                Violation::NotEstablished,
            ))
        }
    }
}

/// Send half of an established connection's record protection
pub struct RecordSender {
    cipher: RecordCipher,
    rekey_after_records: u64,
}

impl RecordSender {
    pub fn seal_data(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.cipher.seal(data, InnerType::ApplicationData)
    }

    pub fn seal_alert(&mut self, alert: Alert) -> Result<Vec<u8>> {
        self.cipher.seal(&alert.encode(), InnerType::Alert)
    }

    /// Seal a key update and move to the next key generation
    pub fn key_update(&mut self) -> Result<Vec<u8>> {
        let sealed = self.cipher.seal(&[], InnerType::KeyUpdate)?;
        self.cipher.ratchet()?;
        Ok(sealed)
    }

    /// Whether the send counter has reached the automatic rekey threshold
    pub fn needs_rekey(&self) -> bool {
        self.cipher.sequence() >= self.rekey_after_records
    }

    pub fn sequence(&self) -> u64 {
        self.cipher.sequence()
    }

    pub fn generation(&self) -> u64 {
        self.cipher.generation()
    }
}

/// Receive half of an established connection's record protection
pub struct RecordReceiver {
    cipher: RecordCipher,
}

impl RecordReceiver {
    /// Open a record, following the peer's key updates
    pub fn open(&mut self, sealed: &[u8]) -> Result<RecordContent> {
        let (inner_type, content) = self.cipher.open(sealed)?;
        if inner_type == InnerType::KeyUpdate {
            self.cipher.ratchet()?;
        }
        decode_content(inner_type, content)
    }

    pub fn sequence(&self) -> u64 {
        self.cipher.sequence()
    }
}
