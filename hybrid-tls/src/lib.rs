//! Hybrid Post-Quantum Secure Transport
//!
//! A TLS-like protocol engine whose handshake combines:
//! - Classical X25519 ECDH
//! - ML-KEM-768 or ML-KEM-1024 encapsulation
//!
//! # Security Properties
//!
//! The hybrid approach ensures:
//! 1. If X25519 is broken but ML-KEM is secure → connection remains secure
//! 2. If ML-KEM is broken but X25519 is secure → connection remains secure
//! 3. Both must be broken simultaneously to compromise security
//!
//! # Protocol Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Hybrid Handshake                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  1. Hello              │  Version check, server picks suite     │
//! │  2. Certificate        │  Verified by a CertificateVerifier     │
//! │  3. CertificateVerify  │  ML-DSA-65 signature over transcript   │
//! │  4. X25519 + ML-KEM    │  HKDF(x25519 || mlkem || transcript)   │
//! │  5. Finished           │  HMAC over the transcript, both ways   │
//! │  6. Records            │  AES-256-GCM or ChaCha20-Poly1305      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use hybrid_tls::{Connection, TlsConfig, TrustAnchor};
//!
//! let config = TlsConfig::builder()
//!     .trust_anchor(TrustAnchor::for_certificate("server.local", &server_cert))
//!     .server_name("server.local")
//!     .build()?;
//!
//! let stream = tokio::net::TcpStream::connect(addr).await?;
//! let connection = Connection::connect(stream, &config).await?;
//! connection.send(b"Hello, quantum world!").await?;
//! let reply = connection.receive().await?;
//! connection.close().await?;
//! ```

pub mod cert;
pub mod config;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod kex;
pub mod listener;
pub mod record;
pub mod schedule;
pub mod session;
pub mod suite;
pub mod wire;

pub use cert::{CertificateError, CertificateVerifier, PinnedCertificateVerifier, TrustAnchor};
pub use config::{EarlyDataPolicy, SessionSettings, TlsConfig, TlsConfigBuilder};
pub use error::{HybridTlsError, Result, Violation};
pub use handshake::{Established, Handshake, HandshakeState, Role};
pub use identity::{PeerKey, SigningIdentity};
pub use listener::{Listener, ShutdownSignal};
pub use record::{Direction, RecordContent, RecordEngine};
pub use session::Connection;
pub use suite::{SuiteId, PROTOCOL_ID, PROTOCOL_VERSION};
pub use wire::HandshakeMessage;
