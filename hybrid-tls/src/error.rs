//! Error types for the hybrid TLS engine

use thiserror::Error;

use crate::handshake::HandshakeState;

/// Errors that can occur while establishing or using a connection.
///
/// Every variant except [`HybridTlsError::Transport`] is fatal to the
/// connection it was raised on. None of them carry key material.
#[derive(Debug, Error)]
pub enum HybridTlsError {
    /// Generating classical or post-quantum key material failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The peer's key share could not be combined with ours
    #[error("hybrid key share mismatch (state: {state})")]
    KeyMismatch { state: HandshakeState },

    /// The peer broke the handshake or record protocol
    #[error("protocol violation in state {state}: {violation}")]
    ProtocolViolation {
        state: HandshakeState,
        violation: Violation,
    },

    /// The peer's Finished MAC did not match our transcript
    #[error("handshake authentication failed (state: {state})")]
    HandshakeAuthentication { state: HandshakeState },

    /// The certificate collaborator rejected the peer's chain
    #[error("certificate validation failed in state {state}: {reason}")]
    CertificateValidation {
        state: HandshakeState,
        reason: String,
    },

    /// A record failed AEAD authentication
    #[error("record authentication failed")]
    AuthenticationFailed,

    /// Plaintext exceeds the configured maximum record size
    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    /// A frame from the peer was oversized, truncated or malformed
    #[error("record framing error: {0}")]
    RecordFraming(String),

    /// A sequence counter reached its maximum value
    #[error("record sequence number exhausted")]
    SequenceExhausted,

    /// I/O error on the underlying transport
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The handshake did not complete within the configured timeout
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The operation was interrupted because the connection was closed
    #[error("operation cancelled: connection closed")]
    Cancelled,

    /// The connection is closed or has failed
    #[error("connection is closed")]
    Closed,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Specific protocol violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// Message type does not match the current handshake state
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    /// Client and server share no cipher suite
    #[error("no common cipher suite")]
    NoCommonSuite,

    /// The server selected a suite the client never offered
    #[error("peer selected unsupported suite {0:#06x}")]
    UnsupportedSuite(u16),

    /// Protocol version mismatch
    #[error("protocol version mismatch: local={local:#06x}, remote={remote:#06x}")]
    VersionMismatch { local: u16, remote: u16 },

    /// Application data arrived before the handshake completed
    #[error("application data received before handshake completion")]
    EarlyData,

    /// Record protection used before the connection was established
    #[error("record layer used before connection was established")]
    NotEstablished,

    /// The peer aborted with an alert
    #[error("peer sent alert {0}")]
    PeerAlert(u8),

    /// Transport closed in the middle of the handshake
    #[error("connection closed during handshake")]
    ConnectionClosed,
}

/// Errors from the hybrid key exchange primitives
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KexError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key share mismatch")]
    KeyMismatch,
}

impl HybridTlsError {
    /// Handshake state at the time of failure, when known
    pub fn state(&self) -> Option<HandshakeState> {
        match self {
            HybridTlsError::KeyMismatch { state }
            | HybridTlsError::ProtocolViolation { state, .. }
            | HybridTlsError::HandshakeAuthentication { state }
            | HybridTlsError::CertificateValidation { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Whether this is an I/O failure rather than a protocol or crypto failure.
    ///
    /// Callers may retry transport failures with a fresh connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HybridTlsError::Transport(_) | HybridTlsError::HandshakeTimeout
        )
    }

    pub(crate) fn violation(state: HandshakeState, violation: Violation) -> Self {
        HybridTlsError::ProtocolViolation { state, violation }
    }

    pub(crate) fn from_kex(err: KexError, state: HandshakeState) -> Self {
        match err {
            KexError::KeyGeneration(reason) => HybridTlsError::KeyGeneration(reason),
            KexError::KeyMismatch => HybridTlsError::KeyMismatch { state },
        }
    }
}

/// Result type for hybrid TLS operations
pub type Result<T> = std::result::Result<T, HybridTlsError>;
