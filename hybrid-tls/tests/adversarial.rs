use bytes::BytesMut;
use proptest::prelude::*;
use tokio_util::codec::Decoder;

use hybrid_tls::kex::HybridKeyShare;
use hybrid_tls::wire::{Finished, FrameCodec};
use hybrid_tls::{
    Direction, Established, Handshake, HandshakeMessage, HandshakeState, HybridTlsError,
    SigningIdentity, SuiteId, TlsConfig, TrustAnchor,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hybrid_tls=debug")
        .with_test_writer()
        .try_init();
}

fn configs(suite: SuiteId) -> (TlsConfig, TlsConfig) {
    let identity = SigningIdentity::generate();
    let client = TlsConfig::builder()
        .trust_anchor(TrustAnchor::for_certificate(
            "server.test",
            &identity.certificate(),
        ))
        .server_name("server.test")
        .suites(vec![suite])
        .build()
        .expect("client config");
    let server = TlsConfig::builder()
        .identity(identity)
        .suites(vec![suite])
        .build()
        .expect("server config");
    (client, server)
}

/// Run both machines in memory. `tamper` sees every message in flight,
/// along with the direction it travels, and may rewrite or reject it.
fn run_handshake(
    suite: SuiteId,
    mut tamper: impl FnMut(Direction, HandshakeMessage) -> Result<HandshakeMessage, HybridTlsError>,
) -> (Handshake, Handshake, Result<(), HybridTlsError>) {
    init_tracing();
    let (client_config, server_config) = configs(suite);
    let mut client = Handshake::client(client_config);
    let mut server = Handshake::server(server_config);

    let result: Result<(), HybridTlsError> = (|| {
        let mut to_server = client.start()?;
        while !to_server.is_empty() {
            let mut to_client = Vec::new();
            for message in to_server.drain(..) {
                to_client.extend(server.handle(tamper(Direction::ClientToServer, message)?)?);
            }
            for message in to_client {
                to_server.extend(client.handle(tamper(Direction::ServerToClient, message)?)?);
            }
        }
        Ok(())
    })();
    (client, server, result)
}

fn established_pair(suite: SuiteId) -> (Established, Established) {
    let (client, server, result) = run_handshake(suite, |_, m| Ok(m));
    result.expect("handshake");
    (
        client.into_established().expect("client established"),
        server.into_established().expect("server established"),
    )
}

fn suite_strategy() -> impl Strategy<Value = SuiteId> {
    prop::sample::select(SuiteId::ALL.to_vec())
}

fn direction_strategy() -> impl Strategy<Value = Direction> {
    prop::sample::select(vec![Direction::ClientToServer, Direction::ServerToClient])
}

/// Flip one bit anywhere in `classical || post_quantum`
fn flip_share_bit(share: &mut HybridKeyShare, index: prop::sample::Index, bit: u8) {
    let classical_len = share.classical.len();
    let at = index.index(classical_len + share.post_quantum.len());
    if at < classical_len {
        share.classical[at] ^= 1 << bit;
    } else {
        share.post_quantum[at - classical_len] ^= 1 << bit;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tampered_record_is_rejected(
        suite in suite_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (mut client, mut server) = established_pair(suite);
        let mut sealed = client
            .records
            .seal(&payload, Direction::ClientToServer)
            .expect("seal");
        let at = index.index(sealed.len());
        sealed[at] ^= 1 << bit;
        let result = server.records.open(&sealed, Direction::ClientToServer);
        prop_assert!(matches!(result, Err(HybridTlsError::AuthenticationFailed)));
    }

    #[test]
    fn tampered_finished_fails_authentication(
        suite in suite_strategy(),
        index in 0usize..32,
        bit in 0u8..8,
    ) {
        let (client, server, result) = run_handshake(suite, |direction, message| match message {
            HandshakeMessage::Finished(Finished { mut mac })
                if direction == Direction::ClientToServer =>
            {
                mac[index] ^= 1 << bit;
                Ok(HandshakeMessage::Finished(Finished { mac }))
            }
            other => Ok(other),
        });
        prop_assert!(
            matches!(result, Err(HybridTlsError::HandshakeAuthentication { .. })),
            "unexpected result {:?}", result
        );
        prop_assert_eq!(server.state(), HandshakeState::Failed);
        prop_assert_ne!(client.state(), HandshakeState::Established);
    }

    #[test]
    fn tampered_share_never_establishes(
        suite in suite_strategy(),
        target in direction_strategy(),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (client, server, result) = run_handshake(suite, |direction, message| match message {
            HandshakeMessage::KeyExchange(mut share) if direction == target => {
                flip_share_bit(&mut share, index, bit);
                Ok(HandshakeMessage::KeyExchange(share))
            }
            other => Ok(other),
        });
        prop_assert!(
            matches!(
                result,
                Err(HybridTlsError::HandshakeAuthentication { .. })
                    | Err(HybridTlsError::KeyMismatch { .. })
            ),
            "unexpected result {:?}", result
        );
        prop_assert_ne!(client.state(), HandshakeState::Established);
        prop_assert_ne!(server.state(), HandshakeState::Established);
    }

    #[test]
    fn tampered_key_exchange_encoding_never_establishes(
        suite in suite_strategy(),
        target in direction_strategy(),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        // Covers the type byte and length prefixes as well as the shares
        let (client, server, result) = run_handshake(suite, |direction, message| {
            if direction != target || !matches!(message, HandshakeMessage::KeyExchange(_)) {
                return Ok(message);
            }
            let mut encoded = message.encode()?.to_vec();
            let at = index.index(encoded.len());
            encoded[at] ^= 1 << bit;
            HandshakeMessage::decode(&encoded)
        });
        prop_assert!(result.is_err());
        prop_assert_ne!(client.state(), HandshakeState::Established);
        prop_assert_ne!(server.state(), HandshakeState::Established);
    }

    #[test]
    fn handshake_decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = HandshakeMessage::decode(&bytes);
    }

    #[test]
    fn frame_decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut codec = FrameCodec::new(1024, 1024);
        let mut buf = BytesMut::from(&bytes[..]);
        while let Ok(Some(_)) = codec.decode(&mut buf) {}
    }
}

#[test]
fn replayed_record_is_rejected() {
    let (mut client, mut server) = established_pair(SuiteId::X25519MlKem768Aes256Gcm);
    let sealed = client
        .records
        .seal(b"transfer 100", Direction::ClientToServer)
        .expect("seal");
    server
        .records
        .open(&sealed, Direction::ClientToServer)
        .expect("first delivery");
    let err = server
        .records
        .open(&sealed, Direction::ClientToServer)
        .expect_err("replay should fail");
    assert!(matches!(err, HybridTlsError::AuthenticationFailed));
}

#[test]
fn both_sides_agree_on_transcript() {
    for suite in SuiteId::ALL {
        let (client, server) = established_pair(suite);
        assert_eq!(client.suite, suite);
        assert_eq!(client.transcript_digest, server.transcript_digest);
    }
}

#[test]
fn impostor_with_copied_certificate_is_rejected() {
    init_tracing();
    let (client_config, server_config) = configs(SuiteId::X25519MlKem768Aes256Gcm);
    let mut impostor = TlsConfig::builder()
        .identity(SigningIdentity::generate())
        .suites(vec![SuiteId::X25519MlKem768Aes256Gcm])
        .build()
        .expect("impostor config");
    impostor.certificate_chain = server_config.certificate_chain.clone();

    let mut client = Handshake::client(client_config);
    let mut server = Handshake::server(impostor);
    let result: Result<(), HybridTlsError> = (|| {
        let mut flight = Vec::new();
        for message in client.start()? {
            flight.extend(server.handle(message)?);
        }
        for message in flight {
            client.handle(message)?;
        }
        Ok(())
    })();
    assert!(matches!(
        result,
        Err(HybridTlsError::HandshakeAuthentication { .. })
    ));
    assert_eq!(client.state(), HandshakeState::Failed);
}
