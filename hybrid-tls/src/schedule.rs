//! Handshake transcript and key schedule

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::kex::SharedSecret;
use crate::suite::PROTOCOL_ID;

/// Length of Finished MACs and transcript digests
pub const DIGEST_LEN: usize = 32;

/// AEAD key length (both AES-256-GCM and ChaCha20-Poly1305)
pub const KEY_LEN: usize = 32;

/// AEAD nonce / IV length
pub const IV_LEN: usize = 12;

const KEY_SCHEDULE_SALT: &[u8] = b"hybrid-tls key schedule v1";

/// Running hash over every handshake message, in order
#[derive(Clone)]
pub struct Transcript {
    hasher: Sha256,
}

impl Transcript {
    /// Create a new transcript seeded with the protocol label
    pub fn new() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(PROTOCOL_ID.as_bytes());
        Self { hasher }
    }

    /// Append an encoded handshake message
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Current digest, leaving the transcript open for more messages
    pub fn hash(&self) -> [u8; DIGEST_LEN] {
        self.hasher.clone().finalize().into()
    }

    /// Finalize and consume the transcript
    pub fn finalize(self) -> [u8; DIGEST_LEN] {
        self.hasher.finalize().into()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

/// Traffic secret, key and IV for one direction
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    traffic_secret: [u8; KEY_LEN],
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
}

impl DirectionKeys {
    fn from_traffic_secret(traffic_secret: [u8; KEY_LEN]) -> Self {
        let hk = expand_only(&traffic_secret);
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        expand(&hk, b"key", &mut key);
        expand(&hk, b"iv", &mut iv);
        Self {
            traffic_secret,
            key,
            iv,
        }
    }

    /// Keys for the next generation after a key update
    pub fn next_generation(&self) -> Self {
        let hk = expand_only(&self.traffic_secret);
        let mut next = [0u8; KEY_LEN];
        expand(&hk, b"traffic upd", &mut next);
        Self::from_traffic_secret(next)
    }
}

/// Session keys derived from the handshake's shared secret
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Client → server record protection
    pub client_to_server: DirectionKeys,
    /// Server → client record protection
    pub server_to_client: DirectionKeys,
    client_finished: [u8; KEY_LEN],
    server_finished: [u8; KEY_LEN],
}

impl SessionKeys {
    /// Run the key schedule over the combined hybrid secret
    pub fn derive(shared: SharedSecret) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(KEY_SCHEDULE_SALT), shared.as_bytes());

        let mut client_traffic = [0u8; KEY_LEN];
        let mut server_traffic = [0u8; KEY_LEN];
        let mut client_finished = [0u8; KEY_LEN];
        let mut server_finished = [0u8; KEY_LEN];
        expand(&hk, b"c ap traffic", &mut client_traffic);
        expand(&hk, b"s ap traffic", &mut server_traffic);
        expand(&hk, b"c finished", &mut client_finished);
        expand(&hk, b"s finished", &mut server_finished);

        let keys = Self {
            client_to_server: DirectionKeys::from_traffic_secret(client_traffic),
            server_to_client: DirectionKeys::from_traffic_secret(server_traffic),
            client_finished,
            server_finished,
        };
        client_traffic.zeroize();
        server_traffic.zeroize();
        keys
    }

    /// Finished MAC for the given sender over a transcript digest
    pub fn finished_mac(
        &self,
        from_client: bool,
        transcript_digest: &[u8; DIGEST_LEN],
    ) -> [u8; DIGEST_LEN] {
        let key = if from_client {
            &self.client_finished
        } else {
            &self.server_finished
        };
        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(transcript_digest);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time check of a peer's Finished MAC
    pub fn verify_finished(
        &self,
        from_client: bool,
        transcript_digest: &[u8; DIGEST_LEN],
        received: &[u8; DIGEST_LEN],
    ) -> bool {
        let expected = self.finished_mac(from_client, transcript_digest);
        expected[..].ct_eq(&received[..]).into()
    }
}

fn expand_only(prk: &[u8; KEY_LEN]) -> Hkdf<Sha256> {
    Hkdf::<Sha256>::from_prk(prk).expect("valid PRK length")
}

fn expand(hk: &Hkdf<Sha256>, label: &[u8], out: &mut [u8]) {
    hk.expand(label, out).expect("valid length");
}
