use std::time::Duration;
use tokio::net::TcpStream;

use hybrid_tls::{
    Connection, HybridTlsError, Listener, SigningIdentity, SuiteId, TlsConfig, TrustAnchor,
    Violation,
};

const SERVER_SEED: [u8; 32] = [0x42; 32];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hybrid_tls=debug")
        .with_test_writer()
        .try_init();
}

fn server_config(suites: Vec<SuiteId>) -> TlsConfig {
    TlsConfig::builder()
        .identity(SigningIdentity::from_seed(SERVER_SEED))
        .suites(suites)
        .build()
        .expect("server config")
}

fn client_config(suites: Vec<SuiteId>) -> TlsConfig {
    let server_certificate = SigningIdentity::from_seed(SERVER_SEED).certificate();
    TlsConfig::builder()
        .trust_anchor(TrustAnchor::for_certificate("localhost", &server_certificate))
        .server_name("localhost")
        .suites(suites)
        .handshake_timeout(Duration::from_secs(10))
        .build()
        .expect("client config")
}

/// Echo server that shuts its listener down on "kill"
async fn spawn_echo(config: TlsConfig) -> std::net::SocketAddr {
    init_tracing();
    let listener = Listener::bind("127.0.0.1:0", config)
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = listener.shutdown_signal();
    tokio::spawn(listener.serve(move |connection, _peer| {
        let shutdown = shutdown.clone();
        async move {
            while let Ok(Some(data)) = connection.receive().await {
                if data == b"kill" {
                    shutdown.trigger();
                }
                if connection.send(&data).await.is_err() {
                    break;
                }
            }
            let _ = connection.close().await;
        }
    }));
    addr
}

#[tokio::test]
async fn echo_over_tcp_for_every_suite() {
    let addr = spawn_echo(server_config(SuiteId::ALL.to_vec())).await;

    for suite in SuiteId::ALL {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let connection = Connection::connect(stream, &client_config(vec![suite]))
            .await
            .expect("handshake");
        assert_eq!(connection.suite(), suite);

        connection.send(b"hello over tcp").await.expect("send");
        let echoed = connection.receive().await.expect("receive");
        assert_eq!(echoed, Some(b"hello over tcp".to_vec()));
        connection.close().await.expect("close");
    }
}

#[tokio::test]
async fn concurrent_clients_are_independent() {
    let addr = spawn_echo(server_config(SuiteId::ALL.to_vec())).await;

    let mut clients = Vec::new();
    for i in 0..4u8 {
        clients.push(tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.expect("connect");
            let connection = Connection::connect(stream, &client_config(SuiteId::ALL.to_vec()))
                .await
                .expect("handshake");
            for round in 0..5u8 {
                let message = [i, round];
                connection.send(&message).await.expect("send");
                assert_eq!(
                    connection.receive().await.expect("receive"),
                    Some(message.to_vec())
                );
            }
            connection.close().await.expect("close");
        }));
    }
    for client in clients {
        client.await.expect("client task");
    }
}

#[tokio::test]
async fn no_common_suite_fails_both_sides() {
    let addr = spawn_echo(server_config(vec![SuiteId::X25519MlKem1024ChaCha20])).await;
    let stream = TcpStream::connect(addr).await.expect("connect");
    let result = Connection::connect(
        stream,
        &client_config(vec![SuiteId::X25519MlKem768Aes256Gcm]),
    )
    .await;
    // The server aborts with an alert; the client never reaches Established
    assert!(matches!(
        result,
        Err(HybridTlsError::ProtocolViolation {
            violation: Violation::PeerAlert(_) | Violation::ConnectionClosed,
            ..
        })
    ));
}

#[tokio::test]
async fn untrusted_server_is_rejected() {
    let addr = spawn_echo(server_config(SuiteId::ALL.to_vec())).await;
    let stream = TcpStream::connect(addr).await.expect("connect");
    let config = TlsConfig::builder()
        .trust_anchor(TrustAnchor::for_certificate(
            "localhost",
            &SigningIdentity::generate().certificate(),
        ))
        .server_name("localhost")
        .build()
        .expect("config");
    let result = Connection::connect(stream, &config).await;
    assert!(matches!(
        result,
        Err(HybridTlsError::CertificateValidation { .. })
    ));
}

#[tokio::test]
async fn server_replaying_certificate_is_rejected() {
    // Holds the genuine certificate bytes but not the key behind them
    let mut impostor = TlsConfig::builder()
        .identity(SigningIdentity::generate())
        .build()
        .expect("impostor config");
    impostor.certificate_chain = server_config(SuiteId::ALL.to_vec()).certificate_chain;
    let addr = spawn_echo(impostor).await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    let result = Connection::connect(stream, &client_config(SuiteId::ALL.to_vec())).await;
    assert!(matches!(
        result,
        Err(HybridTlsError::HandshakeAuthentication { .. })
    ));
}

#[tokio::test]
async fn kill_stops_the_listener() {
    let addr = spawn_echo(server_config(SuiteId::ALL.to_vec())).await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    let connection = Connection::connect(stream, &client_config(SuiteId::ALL.to_vec()))
        .await
        .expect("handshake");
    connection.send(b"kill").await.expect("send");
    assert_eq!(
        connection.receive().await.expect("receive"),
        Some(b"kill".to_vec())
    );

    // New handshakes are no longer served once the accept loop has exited
    tokio::time::sleep(Duration::from_millis(100)).await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), async {
        let stream = TcpStream::connect(addr).await?;
        Connection::connect(stream, &client_config(SuiteId::ALL.to_vec()))
            .await
            .map(|_| ())
    })
    .await;
    assert!(!matches!(outcome, Ok(Ok(()))));
}
