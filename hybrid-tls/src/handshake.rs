//! Hybrid handshake state machine
//!
//! The machine is sans-IO: feed it decoded [`HandshakeMessage`]s with
//! [`Handshake::handle`] and send whatever it returns.
//!
//! ```text
//! Client                                         Server
//! ClientHello               -------->
//!                                                ServerHello
//!                                                Certificate
//!                                                KeyExchange (x25519 pk, ML-KEM ek)
//!                           <--------            CertificateVerify
//! Certificate
//! KeyExchange (x25519 pk, ML-KEM ct)
//! [CertificateVerify]
//! Finished                  -------->
//!                           <--------            Finished
//! ```
//!
//! The hybrid secret is bound to the transcript up to the client's
//! KeyExchange. CertificateVerify signs the transcript with the key behind
//! the sender's leaf certificate; the client sends one only when it
//! presents a chain. Each Finished MAC covers everything before it.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

use crate::config::TlsConfig;
use crate::error::{HybridTlsError, Result, Violation};
use crate::identity::PeerKey;
use crate::kex::{self, HybridKeyShare, LocalKeyMaterial};
use crate::record::RecordEngine;
use crate::schedule::{SessionKeys, Transcript, DIGEST_LEN};
use crate::suite::{select_suite, SuiteId, PROTOCOL_VERSION};
use crate::wire::{
    CertificateMessage, CertificateVerify, ClientHello, Finished, HandshakeMessage, ServerHello,
    NONCE_LEN,
};

/// Handshake progress. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Init,
    HelloSent,
    HelloReceived,
    SuiteNegotiated,
    KeyExchanged,
    KeysDerived,
    PeerAuthenticated,
    Established,
    Failed,
    Closed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Failed | HandshakeState::Closed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Init => "Init",
            HandshakeState::HelloSent => "HelloSent",
            HandshakeState::HelloReceived => "HelloReceived",
            HandshakeState::SuiteNegotiated => "SuiteNegotiated",
            HandshakeState::KeyExchanged => "KeyExchanged",
            HandshakeState::KeysDerived => "KeysDerived",
            HandshakeState::PeerAuthenticated => "PeerAuthenticated",
            HandshakeState::Established => "Established",
            HandshakeState::Failed => "Failed",
            HandshakeState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Result of a completed handshake
pub struct Established {
    pub role: Role,
    pub suite: SuiteId,
    /// Active record engine holding both directions' keys
    pub records: RecordEngine,
    /// Digest over every handshake message, both Finished included
    pub transcript_digest: [u8; DIGEST_LEN],
    /// Peer's certificate chain as presented (empty if the client sent none)
    pub peer_certificates: Vec<Vec<u8>>,
}

/// Handshake state machine for one connection
pub struct Handshake {
    role: Role,
    config: TlsConfig,
    state: HandshakeState,
    transcript: Transcript,
    offered: Vec<u16>,
    suite: Option<SuiteId>,
    peer_certificate_seen: bool,
    peer_certificates: Vec<Vec<u8>>,
    /// Key behind the peer's verified leaf certificate
    peer_key: Option<PeerKey>,
    peer_verified: bool,
    /// Server share held until the server's CertificateVerify checks out
    peer_share: Option<HybridKeyShare>,
    local_key: Option<LocalKeyMaterial>,
    keys: Option<SessionKeys>,
    records: Option<RecordEngine>,
}

impl Handshake {
    /// Create the client side
    pub fn client(config: TlsConfig) -> Self {
        Self::new(Role::Client, config)
    }

    /// Create the server side
    pub fn server(config: TlsConfig) -> Self {
        Self::new(Role::Server, config)
    }

    fn new(role: Role, config: TlsConfig) -> Self {
        Self {
            role,
            config,
            state: HandshakeState::Init,
            transcript: Transcript::new(),
            offered: Vec::new(),
            suite: None,
            peer_certificate_seen: false,
            peer_certificates: Vec::new(),
            peer_key: None,
            peer_verified: false,
            peer_share: None,
            local_key: None,
            keys: None,
            records: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Suite agreed so far, if any
    pub fn suite(&self) -> Option<SuiteId> {
        self.suite
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Produce the opening flight. Servers send nothing until the ClientHello.
    pub fn start(&mut self) -> Result<Vec<HandshakeMessage>> {
        if self.state != HandshakeState::Init {
            return Err(self.fail(HybridTlsError::violation(
                self.state,
                Violation::UnexpectedMessage {
                    expected: self.expected(),
                    got: "start",
                },
            )));
        }
        if self.role == Role::Server {
            return Ok(Vec::new());
        }

        self.offered = self.config.settings.suites.iter().map(|s| s.to_u16()).collect();
        let hello = HandshakeMessage::ClientHello(ClientHello {
            version: PROTOCOL_VERSION,
            nonce: fresh_nonce(),
            suites: self.offered.clone(),
        });
        if let Err(err) = self.record(&hello) {
            return Err(self.fail(err));
        }
        self.advance(HandshakeState::HelloSent);
        Ok(vec![hello])
    }

    /// Process one message from the peer and return our reply flight.
    ///
    /// Any error leaves the machine in [`HandshakeState::Failed`] with all
    /// key material dropped.
    pub fn handle(&mut self, message: HandshakeMessage) -> Result<Vec<HandshakeMessage>> {
        if self.config.settings.verbose_logging {
            tracing::debug!(
                role = %self.role,
                state = %self.state,
                message = message.message_type().name(),
                "handshake message received"
            );
        }
        let result = match self.role {
            Role::Client => self.handle_client(message),
            Role::Server => self.handle_server(message),
        };
        result.map_err(|err| self.fail(err))
    }

    /// Abort the handshake, dropping all key material
    pub fn abort(&mut self) {
        self.wipe();
        if !self.state.is_terminal() {
            self.state = HandshakeState::Failed;
        }
    }

    /// Hand over the established session
    pub fn into_established(mut self) -> Result<Established> {
        let (Some(suite), Some(mut records)) = (self.suite, self.records.take()) else {
            return Err(HybridTlsError::violation(
                self.state,
                Violation::NotEstablished,
            ));
        };
        if self.state != HandshakeState::Established {
            return Err(HybridTlsError::violation(
                self.state,
                Violation::NotEstablished,
            ));
        }
        records.activate();
        Ok(Established {
            role: self.role,
            suite,
            records,
            transcript_digest: std::mem::take(&mut self.transcript).finalize(),
            peer_certificates: std::mem::take(&mut self.peer_certificates),
        })
    }

    fn handle_client(&mut self, message: HandshakeMessage) -> Result<Vec<HandshakeMessage>> {
        match (self.state, message) {
            (HandshakeState::HelloSent, HandshakeMessage::ServerHello(hello)) => {
                self.check_version(hello.version)?;
                let suite = SuiteId::from_u16(hello.suite)
                    .filter(|_| self.offered.contains(&hello.suite))
                    .ok_or_else(|| {
                        HybridTlsError::violation(
                            self.state,
                            Violation::UnsupportedSuite(hello.suite),
                        )
                    })?;
                self.record(&HandshakeMessage::ServerHello(hello))?;
                self.suite = Some(suite);
                self.advance(HandshakeState::SuiteNegotiated);
                Ok(Vec::new())
            }
            (HandshakeState::SuiteNegotiated, HandshakeMessage::Certificate(cert))
                if !self.peer_certificate_seen =>
            {
                self.verify_peer_chain(&cert.chain, self.config.server_name.clone())?;
                self.record(&HandshakeMessage::Certificate(cert.clone()))?;
                self.peer_certificate_seen = true;
                self.peer_certificates = cert.chain;
                Ok(Vec::new())
            }
            (HandshakeState::SuiteNegotiated, HandshakeMessage::KeyExchange(server_share))
                if self.peer_certificate_seen && self.peer_share.is_none() =>
            {
                self.record(&HandshakeMessage::KeyExchange(server_share.clone()))?;
                self.peer_share = Some(server_share);
                Ok(Vec::new())
            }
            (HandshakeState::SuiteNegotiated, HandshakeMessage::CertificateVerify(verify))
                if self.peer_share.is_some() =>
            {
                // The signature covers the server's share; check it before using the share
                self.verify_peer_signature(&verify)?;
                self.record(&HandshakeMessage::CertificateVerify(verify))?;
                let suite = self.negotiated()?;
                let server_share = self.peer_share.take().ok_or_else(|| {
                    HybridTlsError::violation(
                        self.state,
                        Violation::UnexpectedMessage {
                            expected: "KeyExchange",
                            got: "CertificateVerify",
                        },
                    )
                })?;

                let (client_share, local) = kex::encapsulate_share(suite, &server_share)
                    .map_err(|e| HybridTlsError::from_kex(e, self.state))?;
                self.advance(HandshakeState::KeyExchanged);

                let certificate = HandshakeMessage::Certificate(CertificateMessage {
                    chain: self.config.certificate_chain.clone(),
                });
                let key_exchange = HandshakeMessage::KeyExchange(client_share);
                self.record(&certificate)?;
                self.record(&key_exchange)?;
                let mut flight = vec![certificate, key_exchange];

                self.derive_keys(suite, local, &server_share)?;
                if let Some(verify) = self.certificate_verify()? {
                    self.record(&verify)?;
                    flight.push(verify);
                }
                let finished = HandshakeMessage::Finished(Finished {
                    mac: self.session_keys()?.finished_mac(true, &self.transcript.hash()),
                });
                self.record(&finished)?;
                flight.push(finished);
                Ok(flight)
            }
            (HandshakeState::KeysDerived, HandshakeMessage::Finished(finished)) => {
                self.verify_finished(false, &finished)?;
                self.record(&HandshakeMessage::Finished(finished))?;
                self.advance(HandshakeState::PeerAuthenticated);
                self.establish();
                Ok(Vec::new())
            }
            (_, other) => Err(self.unexpected(&other)),
        }
    }

    fn handle_server(&mut self, message: HandshakeMessage) -> Result<Vec<HandshakeMessage>> {
        match (self.state, message) {
            (HandshakeState::Init, HandshakeMessage::ClientHello(hello)) => {
                self.advance(HandshakeState::HelloReceived);
                self.check_version(hello.version)?;
                self.record(&HandshakeMessage::ClientHello(hello.clone()))?;

                let suite = select_suite(&self.config.settings.suites, &hello.suites)
                    .ok_or_else(|| {
                        HybridTlsError::violation(self.state, Violation::NoCommonSuite)
                    })?;
                self.suite = Some(suite);

                let (share, local) = kex::generate_share(suite)
                    .map_err(|e| HybridTlsError::from_kex(e, self.state))?;
                self.local_key = Some(local);

                let mut flight = vec![
                    HandshakeMessage::ServerHello(ServerHello {
                        version: PROTOCOL_VERSION,
                        nonce: fresh_nonce(),
                        suite: suite.to_u16(),
                    }),
                    HandshakeMessage::Certificate(CertificateMessage {
                        chain: self.config.certificate_chain.clone(),
                    }),
                    HandshakeMessage::KeyExchange(share),
                ];
                for message in &flight {
                    self.record(message)?;
                }
                if let Some(verify) = self.certificate_verify()? {
                    self.record(&verify)?;
                    flight.push(verify);
                }
                self.advance(HandshakeState::SuiteNegotiated);
                Ok(flight)
            }
            (HandshakeState::SuiteNegotiated, HandshakeMessage::Certificate(cert))
                if !self.peer_certificate_seen =>
            {
                if !cert.chain.is_empty() || self.config.settings.require_client_certificate {
                    self.verify_peer_chain(&cert.chain, None)?;
                }
                self.record(&HandshakeMessage::Certificate(cert.clone()))?;
                self.peer_certificate_seen = true;
                self.peer_certificates = cert.chain;
                Ok(Vec::new())
            }
            (HandshakeState::SuiteNegotiated, HandshakeMessage::KeyExchange(client_share))
                if self.peer_certificate_seen =>
            {
                let suite = self.negotiated()?;
                self.record(&HandshakeMessage::KeyExchange(client_share.clone()))?;
                self.advance(HandshakeState::KeyExchanged);

                let local = self.local_key.take().ok_or_else(|| {
                    HybridTlsError::KeyGeneration("server key share missing".into())
                })?;
                self.derive_keys(suite, local, &client_share)?;
                Ok(Vec::new())
            }
            (HandshakeState::KeysDerived, HandshakeMessage::CertificateVerify(verify))
                if self.peer_key.is_some() && !self.peer_verified =>
            {
                self.verify_peer_signature(&verify)?;
                self.record(&HandshakeMessage::CertificateVerify(verify))?;
                Ok(Vec::new())
            }
            (HandshakeState::KeysDerived, HandshakeMessage::Finished(finished))
                if self.peer_verified || self.peer_key.is_none() =>
            {
                self.verify_finished(true, &finished)?;
                self.record(&HandshakeMessage::Finished(finished))?;
                self.advance(HandshakeState::PeerAuthenticated);

                let reply = HandshakeMessage::Finished(Finished {
                    mac: self
                        .session_keys()?
                        .finished_mac(false, &self.transcript.hash()),
                });
                self.record(&reply)?;
                self.establish();
                Ok(vec![reply])
            }
            (_, other) => Err(self.unexpected(&other)),
        }
    }

    fn derive_keys(
        &mut self,
        suite: SuiteId,
        local: LocalKeyMaterial,
        peer_share: &HybridKeyShare,
    ) -> Result<()> {
        let digest = self.transcript.hash();
        let shared = kex::derive_secret(suite, local, peer_share, &digest)
            .map_err(|e| HybridTlsError::from_kex(e, self.state))?;
        let keys = SessionKeys::derive(shared);
        self.records = Some(RecordEngine::new(
            suite,
            &keys,
            self.config.settings.record_limits(),
        )?);
        self.keys = Some(keys);
        self.advance(HandshakeState::KeysDerived);
        Ok(())
    }

    fn verify_finished(&self, from_client: bool, finished: &Finished) -> Result<()> {
        let keys = self.session_keys()?;
        if keys.verify_finished(from_client, &self.transcript.hash(), &finished.mac) {
            Ok(())
        } else {
            Err(HybridTlsError::HandshakeAuthentication { state: self.state })
        }
    }

    fn verify_peer_chain(&mut self, chain: &[Vec<u8>], identity: Option<String>) -> Result<()> {
        self.config
            .verifier
            .verify_chain(chain, &self.config.trust_anchors, identity.as_deref())
            .map_err(|e| HybridTlsError::CertificateValidation {
                state: self.state,
                reason: e.to_string(),
            })?;
        let leaf = chain.first().ok_or(HybridTlsError::CertificateValidation {
            state: self.state,
            reason: "empty certificate chain".into(),
        })?;
        let key = PeerKey::from_certificate(leaf).ok_or(HybridTlsError::CertificateValidation {
            state: self.state,
            reason: "leaf certificate is not an ML-DSA-65 verifying key".into(),
        })?;
        tracing::debug!(
            role = %self.role,
            fingerprint = %hex::encode(crate::cert::fingerprint(leaf)),
            "peer certificate accepted"
        );
        self.peer_key = Some(key);
        Ok(())
    }

    /// Check the peer's CertificateVerify against the current transcript
    fn verify_peer_signature(&mut self, verify: &CertificateVerify) -> Result<()> {
        let from_client = self.role == Role::Server;
        let digest = self.transcript.hash();
        let valid = self
            .peer_key
            .as_ref()
            .is_some_and(|key| key.verify_transcript(from_client, &digest, &verify.signature));
        if !valid {
            return Err(HybridTlsError::HandshakeAuthentication { state: self.state });
        }
        self.peer_verified = true;
        Ok(())
    }

    /// Our CertificateVerify, when we present a chain
    fn certificate_verify(&self) -> Result<Option<HandshakeMessage>> {
        if self.config.certificate_chain.is_empty() {
            return Ok(None);
        }
        let identity = self.config.identity.as_ref().ok_or_else(|| {
            HybridTlsError::InvalidConfig(
                "certificate chain configured without a signing identity".into(),
            )
        })?;
        let signature =
            identity.sign_transcript(self.role == Role::Client, &self.transcript.hash());
        Ok(Some(HandshakeMessage::CertificateVerify(CertificateVerify {
            signature,
        })))
    }

    fn check_version(&self, remote: u16) -> Result<()> {
        if remote != PROTOCOL_VERSION {
            return Err(HybridTlsError::violation(
                self.state,
                Violation::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote,
                },
            ));
        }
        Ok(())
    }

    fn establish(&mut self) {
        // Finished keys are no longer needed; traffic keys live in the record engine
        self.keys = None;
        self.advance(HandshakeState::Established);
        if let Some(suite) = self.suite {
            tracing::info!(role = %self.role, suite = %suite, "handshake complete");
        }
    }

    fn record(&mut self, message: &HandshakeMessage) -> Result<()> {
        let encoded = message.encode()?;
        if encoded.len() > self.config.settings.max_handshake_message_size {
            return Err(HybridTlsError::RecordFraming(format!(
                "{} of {} bytes exceeds handshake message limit",
                message.message_type().name(),
                encoded.len()
            )));
        }
        self.transcript.update(&encoded);
        Ok(())
    }

    fn advance(&mut self, next: HandshakeState) {
        if self.config.settings.verbose_logging {
            tracing::debug!(role = %self.role, from = %self.state, to = %next, "handshake state");
        }
        self.state = next;
    }

    fn negotiated(&self) -> Result<SuiteId> {
        self.suite
            .ok_or_else(|| HybridTlsError::violation(self.state, Violation::NoCommonSuite))
    }

    fn session_keys(&self) -> Result<&SessionKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| HybridTlsError::violation(self.state, Violation::NotEstablished))
    }

    fn expected(&self) -> &'static str {
        match (self.role, self.state) {
            (_, HandshakeState::Init) => match self.role {
                Role::Client => "start",
                Role::Server => "ClientHello",
            },
            (Role::Client, HandshakeState::HelloSent) => "ServerHello",
            (_, HandshakeState::SuiteNegotiated) if !self.peer_certificate_seen => "Certificate",
            (Role::Client, HandshakeState::SuiteNegotiated) if self.peer_share.is_some() => {
                "CertificateVerify"
            }
            (_, HandshakeState::SuiteNegotiated) => "KeyExchange",
            (Role::Server, HandshakeState::KeysDerived)
                if self.peer_key.is_some() && !self.peer_verified =>
            {
                "CertificateVerify"
            }
            (_, HandshakeState::KeysDerived) => "Finished",
            _ => "nothing",
        }
    }

    fn unexpected(&self, message: &HandshakeMessage) -> HybridTlsError {
        HybridTlsError::violation(
            self.state,
            Violation::UnexpectedMessage {
                expected: self.expected(),
                got: message.message_type().name(),
            },
        )
    }

    fn fail(&mut self, err: HybridTlsError) -> HybridTlsError {
        tracing::warn!(
            role = %self.role,
            state = %self.state,
            error = %err,
            "handshake failed"
        );
        self.wipe();
        if !self.state.is_terminal() {
            self.state = HandshakeState::Failed;
        }
        err
    }

    fn wipe(&mut self) {
        self.peer_share = None;
        self.local_key = None;
        self.keys = None;
        self.records = None;
    }
}

fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::TrustAnchor;
    use crate::identity::SigningIdentity;
    use crate::record::{Direction, RecordContent};
    use std::sync::OnceLock;

    /// Identities are fixed per test binary; key generation is not what we test
    fn server_identity() -> &'static SigningIdentity {
        static IDENTITY: OnceLock<SigningIdentity> = OnceLock::new();
        IDENTITY.get_or_init(|| SigningIdentity::from_seed([0x51; 32]))
    }

    fn client_identity() -> &'static SigningIdentity {
        static IDENTITY: OnceLock<SigningIdentity> = OnceLock::new();
        IDENTITY.get_or_init(|| SigningIdentity::from_seed([0xc1; 32]))
    }

    fn server_config(suites: &[SuiteId]) -> TlsConfig {
        TlsConfig::builder()
            .identity(server_identity().clone())
            .trust_anchor(TrustAnchor::for_certificate(
                "client",
                &client_identity().certificate(),
            ))
            .suites(suites.to_vec())
            .build()
            .unwrap()
    }

    fn client_config(suites: &[SuiteId]) -> TlsConfig {
        TlsConfig::builder()
            .trust_anchor(TrustAnchor::for_certificate(
                "server.local",
                &server_identity().certificate(),
            ))
            .server_name("server.local")
            .suites(suites.to_vec())
            .build()
            .unwrap()
    }

    /// Shuttle messages until both sides are established or one fails
    fn run(client: &mut Handshake, server: &mut Handshake) -> Result<()> {
        let mut to_server = client.start()?;
        assert!(server.start()?.is_empty());
        while !to_server.is_empty() {
            let mut to_client = Vec::new();
            for message in to_server.drain(..) {
                to_client.extend(server.handle(message)?);
            }
            for message in to_client {
                to_server.extend(client.handle(message)?);
            }
        }
        Ok(())
    }

    /// Feed `flight` to `peer`, stopping at the first error
    fn deliver(
        peer: &mut Handshake,
        flight: Vec<HandshakeMessage>,
    ) -> Result<Vec<HandshakeMessage>> {
        let mut replies = Vec::new();
        for message in flight {
            replies.extend(peer.handle(message)?);
        }
        Ok(replies)
    }

    #[test]
    fn test_full_handshake_every_suite() {
        for suite in SuiteId::ALL {
            let mut client = Handshake::client(client_config(&[suite]));
            let mut server = Handshake::server(server_config(&[suite]));
            run(&mut client, &mut server).unwrap();

            assert_eq!(client.state(), HandshakeState::Established);
            assert_eq!(server.state(), HandshakeState::Established);

            let client = client.into_established().unwrap();
            let server = server.into_established().unwrap();
            assert_eq!(client.suite, suite);
            assert_eq!(server.suite, suite);
            assert_eq!(client.transcript_digest, server.transcript_digest);
            assert_eq!(
                client.peer_certificates,
                vec![server_identity().certificate()]
            );
            assert!(server.peer_certificates.is_empty());

            let mut client_records = client.records;
            let mut server_records = server.records;
            let sealed = client_records
                .seal(b"hello", Direction::ClientToServer)
                .unwrap();
            assert_eq!(
                server_records
                    .open(&sealed, Direction::ClientToServer)
                    .unwrap(),
                RecordContent::ApplicationData(b"hello".to_vec())
            );
        }
    }

    #[test]
    fn test_server_flight_ends_with_certificate_verify() {
        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        let mut server = Handshake::server(server_config(&SuiteId::ALL));
        let flight = deliver(&mut server, client.start().unwrap()).unwrap();
        let types: Vec<_> = flight.iter().map(|m| m.message_type().name()).collect();
        assert_eq!(
            types,
            ["ServerHello", "Certificate", "KeyExchange", "CertificateVerify"]
        );
    }

    #[test]
    fn test_server_preference_picks_common_suite() {
        let a = SuiteId::X25519MlKem768Aes256Gcm;
        let b = SuiteId::X25519MlKem768ChaCha20;
        let c = SuiteId::X25519MlKem1024Aes256Gcm;
        let mut client = Handshake::client(client_config(&[a, b]));
        let mut server = Handshake::server(server_config(&[b, c]));
        run(&mut client, &mut server).unwrap();
        assert_eq!(client.suite(), Some(b));
        assert_eq!(server.suite(), Some(b));
    }

    #[test]
    fn test_no_common_suite() {
        let mut client = Handshake::client(client_config(&[SuiteId::X25519MlKem768Aes256Gcm]));
        let mut server = Handshake::server(server_config(&[SuiteId::X25519MlKem1024ChaCha20]));
        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(
            err,
            HybridTlsError::ProtocolViolation {
                violation: Violation::NoCommonSuite,
                ..
            }
        ));
        assert_eq!(server.state(), HandshakeState::Failed);
        assert_ne!(client.state(), HandshakeState::Established);
    }

    #[test]
    fn test_finished_before_key_exchange() {
        let mut server = Handshake::server(server_config(&SuiteId::ALL));
        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        deliver(&mut server, client.start().unwrap()).unwrap();
        let err = server
            .handle(HandshakeMessage::Finished(Finished { mac: [0u8; 32] }))
            .unwrap_err();
        assert!(matches!(
            err,
            HybridTlsError::ProtocolViolation {
                state: HandshakeState::SuiteNegotiated,
                violation: Violation::UnexpectedMessage {
                    got: "Finished",
                    ..
                },
            }
        ));
        assert_eq!(server.state(), HandshakeState::Failed);

        // Processing stops once failed
        assert!(server
            .handle(HandshakeMessage::Certificate(CertificateMessage { chain: vec![] }))
            .is_err());
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_client_waits_for_certificate_verify() {
        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        let mut server = Handshake::server(server_config(&SuiteId::ALL));
        let mut flight = deliver(&mut server, client.start().unwrap()).unwrap();
        flight.pop();
        assert!(deliver(&mut client, flight).unwrap().is_empty());

        let err = client
            .handle(HandshakeMessage::Finished(Finished { mac: [0u8; 32] }))
            .unwrap_err();
        assert!(matches!(
            err,
            HybridTlsError::ProtocolViolation {
                violation: Violation::UnexpectedMessage {
                    expected: "CertificateVerify",
                    got: "Finished",
                },
                ..
            }
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let mut server = Handshake::server(server_config(&SuiteId::ALL));
        let err = server
            .handle(HandshakeMessage::ClientHello(ClientHello {
                version: 0x0002,
                nonce: [0u8; NONCE_LEN],
                suites: vec![SuiteId::X25519MlKem768Aes256Gcm.to_u16()],
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            HybridTlsError::ProtocolViolation {
                violation: Violation::VersionMismatch {
                    local: 0x0001,
                    remote: 0x0002
                },
                ..
            }
        ));
    }

    #[test]
    fn test_server_choosing_unoffered_suite() {
        let mut client = Handshake::client(client_config(&[SuiteId::X25519MlKem768Aes256Gcm]));
        client.start().unwrap();
        let err = client
            .handle(HandshakeMessage::ServerHello(ServerHello {
                version: PROTOCOL_VERSION,
                nonce: [0u8; NONCE_LEN],
                suite: SuiteId::X25519MlKem1024ChaCha20.to_u16(),
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            HybridTlsError::ProtocolViolation {
                violation: Violation::UnsupportedSuite(0x0202),
                ..
            }
        ));
    }

    #[test]
    fn test_untrusted_server_certificate() {
        let mut client = Handshake::client(
            TlsConfig::builder()
                .trust_anchor(TrustAnchor::for_certificate(
                    "server.local",
                    &client_identity().certificate(),
                ))
                .server_name("server.local")
                .build()
                .unwrap(),
        );
        let mut server = Handshake::server(server_config(&SuiteId::ALL));
        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, HybridTlsError::CertificateValidation { .. }));
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_copied_certificate_without_key_fails() {
        // The impostor presents the real server's certificate bytes but
        // can only sign with its own key
        let mut impostor = TlsConfig::builder()
            .identity(SigningIdentity::generate())
            .build()
            .unwrap();
        impostor.certificate_chain = vec![server_identity().certificate()];

        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        let mut server = Handshake::server(impostor);
        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(
            err,
            HybridTlsError::HandshakeAuthentication {
                state: HandshakeState::SuiteNegotiated
            }
        ));
        assert_eq!(client.state(), HandshakeState::Failed);
        assert_ne!(server.state(), HandshakeState::Established);
    }

    #[test]
    fn test_required_client_certificate() {
        let config = TlsConfig::builder()
            .identity(server_identity().clone())
            .trust_anchor(TrustAnchor::for_certificate(
                "client",
                &client_identity().certificate(),
            ))
            .require_client_certificate(true)
            .build()
            .unwrap();

        let mut server = Handshake::server(config.clone());
        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        let err = run(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, HybridTlsError::CertificateValidation { .. }));

        let mut server = Handshake::server(config);
        let mut client_config = client_config(&SuiteId::ALL);
        client_config.certificate_chain = vec![client_identity().certificate()];
        client_config.identity = Some(client_identity().clone());
        let mut client = Handshake::client(client_config);
        run(&mut client, &mut server).unwrap();
        let server = server.into_established().unwrap();
        assert_eq!(
            server.peer_certificates,
            vec![client_identity().certificate()]
        );
    }

    #[test]
    fn test_client_certificate_requires_signature() {
        let config = TlsConfig::builder()
            .identity(server_identity().clone())
            .trust_anchor(TrustAnchor::for_certificate(
                "client",
                &client_identity().certificate(),
            ))
            .require_client_certificate(true)
            .build()
            .unwrap();
        let mut server = Handshake::server(config);
        let mut client_config = client_config(&SuiteId::ALL);
        client_config.certificate_chain = vec![client_identity().certificate()];
        client_config.identity = Some(client_identity().clone());
        let mut client = Handshake::client(client_config);

        let to_client = deliver(&mut server, client.start().unwrap()).unwrap();
        let to_server: Vec<_> = deliver(&mut client, to_client)
            .unwrap()
            .into_iter()
            .filter(|m| !matches!(m, HandshakeMessage::CertificateVerify(_)))
            .collect();
        let err = deliver(&mut server, to_server).unwrap_err();
        assert!(matches!(
            err,
            HybridTlsError::ProtocolViolation {
                violation: Violation::UnexpectedMessage {
                    expected: "CertificateVerify",
                    got: "Finished",
                },
                ..
            }
        ));
    }

    #[test]
    fn test_tampered_server_share_fails_signature() {
        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        let mut server = Handshake::server(server_config(&SuiteId::ALL));
        let flight = deliver(&mut server, client.start().unwrap())
            .unwrap()
            .into_iter()
            .map(|message| match message {
                HandshakeMessage::KeyExchange(mut share) => {
                    share.classical = vec![0u8; 32];
                    HandshakeMessage::KeyExchange(share)
                }
                other => other,
            })
            .collect();
        let err = deliver(&mut client, flight).unwrap_err();
        assert!(matches!(
            err,
            HybridTlsError::HandshakeAuthentication { .. }
        ));
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_low_order_client_share() {
        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        let mut server = Handshake::server(server_config(&SuiteId::ALL));
        let to_client = deliver(&mut server, client.start().unwrap()).unwrap();
        let to_server = deliver(&mut client, to_client)
            .unwrap()
            .into_iter()
            .map(|message| match message {
                HandshakeMessage::KeyExchange(mut share) => {
                    share.classical = vec![0u8; 32];
                    HandshakeMessage::KeyExchange(share)
                }
                other => other,
            })
            .collect();
        let err = deliver(&mut server, to_server).unwrap_err();
        assert!(matches!(err, HybridTlsError::KeyMismatch { .. }));
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_tampered_post_quantum_share_fails_authentication() {
        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        let mut server = Handshake::server(server_config(&SuiteId::ALL));
        let to_client = deliver(&mut server, client.start().unwrap()).unwrap();
        let to_server = deliver(&mut client, to_client)
            .unwrap()
            .into_iter()
            .map(|message| match message {
                HandshakeMessage::KeyExchange(mut share) => {
                    share.post_quantum[0] ^= 0xff;
                    HandshakeMessage::KeyExchange(share)
                }
                other => other,
            })
            .collect();
        let outcome = deliver(&mut server, to_server);
        assert!(matches!(
            outcome,
            Err(HybridTlsError::HandshakeAuthentication { .. })
                | Err(HybridTlsError::KeyMismatch { .. })
        ));
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_into_established_requires_completion() {
        let mut client = Handshake::client(client_config(&SuiteId::ALL));
        client.start().unwrap();
        assert!(matches!(
            client.into_established(),
            Err(HybridTlsError::ProtocolViolation {
                violation: Violation::NotEstablished,
                ..
            })
        ));
    }
}
