//! Configuration for hybrid TLS connections

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cert::{CertificateVerifier, PinnedCertificateVerifier, TrustAnchor};
use crate::error::{HybridTlsError, Result};
use crate::identity::SigningIdentity;
use crate::record::RecordLimits;
use crate::suite::SuiteId;

/// Hard upper bound on record plaintext
pub const MAX_RECORD_SIZE_LIMIT: usize = 16 * 1024;

/// What to do with application data that arrives before `Established`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyDataPolicy {
    /// Keep the sealed records (up to `max_early_data` bytes) and open them
    /// once the handshake completes
    #[default]
    Buffer,
    /// Abort the handshake with `ProtocolViolation(EarlyData)`
    Reject,
}

/// Tunables that can be loaded from a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Acceptable suites, most preferred first
    pub suites: Vec<SuiteId>,
    /// Records with less content are zero-padded to this size
    pub min_record_size: usize,
    /// Largest plaintext per record
    pub max_record_size: usize,
    pub handshake_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub early_data: EarlyDataPolicy,
    /// Bytes of sealed early data to buffer under [`EarlyDataPolicy::Buffer`]
    pub max_early_data: usize,
    pub max_handshake_message_size: usize,
    /// Send records before the connection rekeys on its own
    pub rekey_after_records: u64,
    /// Servers only: fail the handshake if the client sends no certificate
    pub require_client_certificate: bool,
    /// Log every handshake message at debug level
    pub verbose_logging: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            suites: SuiteId::ALL.to_vec(),
            min_record_size: 0,
            max_record_size: MAX_RECORD_SIZE_LIMIT,
            handshake_timeout_ms: 30_000,
            close_timeout_ms: 5_000,
            early_data: EarlyDataPolicy::Buffer,
            max_early_data: 64 * 1024,
            max_handshake_message_size: 64 * 1024, // 64 KB
            rekey_after_records: 1 << 24,
            require_client_certificate: false,
            verbose_logging: false,
        }
    }
}

impl SessionSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn record_limits(&self) -> RecordLimits {
        RecordLimits {
            min_record_size: self.min_record_size,
            max_record_size: self.max_record_size,
        }
    }

    /// Check the settings for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.suites.is_empty() {
            return Err(invalid("at least one suite is required"));
        }
        if self.max_record_size == 0 || self.max_record_size > MAX_RECORD_SIZE_LIMIT {
            return Err(invalid(format!(
                "max_record_size must be in 1..={MAX_RECORD_SIZE_LIMIT}, got {}",
                self.max_record_size
            )));
        }
        if self.min_record_size > self.max_record_size {
            return Err(invalid(format!(
                "min_record_size {} exceeds max_record_size {}",
                self.min_record_size, self.max_record_size
            )));
        }
        if self.handshake_timeout_ms == 0 || self.close_timeout_ms == 0 {
            return Err(invalid("timeouts must be non-zero"));
        }
        if self.max_handshake_message_size < 4 * 1024 {
            return Err(invalid("max_handshake_message_size must be at least 4096"));
        }
        if self.rekey_after_records == 0 {
            return Err(invalid("rekey_after_records must be non-zero"));
        }
        Ok(())
    }
}

/// Per-endpoint configuration: identity, trust and session settings
#[derive(Clone)]
pub struct TlsConfig {
    /// Our certificate chain, leaf first; may be empty for clients
    pub certificate_chain: Vec<Vec<u8>>,
    /// Key behind the leaf certificate; required whenever a chain is sent
    pub identity: Option<SigningIdentity>,
    pub trust_anchors: Vec<TrustAnchor>,
    pub verifier: Arc<dyn CertificateVerifier>,
    /// Expected server identity (clients only)
    pub server_name: Option<String>,
    pub settings: SessionSettings,
}

impl TlsConfig {
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::new()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("certificate_chain_len", &self.certificate_chain.len())
            .field("has_identity", &self.identity.is_some())
            .field("trust_anchors", &self.trust_anchors)
            .field("server_name", &self.server_name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TlsConfig`]
pub struct TlsConfigBuilder {
    certificate_chain: Vec<Vec<u8>>,
    identity: Option<SigningIdentity>,
    trust_anchors: Vec<TrustAnchor>,
    verifier: Arc<dyn CertificateVerifier>,
    server_name: Option<String>,
    settings: SessionSettings,
}

impl Default for TlsConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self {
            certificate_chain: Vec::new(),
            identity: None,
            trust_anchors: Vec::new(),
            verifier: Arc::new(PinnedCertificateVerifier),
            server_name: None,
            settings: SessionSettings::default(),
        }
    }

    pub fn certificate_chain(mut self, chain: Vec<Vec<u8>>) -> Self {
        self.certificate_chain = chain;
        self
    }

    /// Signing key for our leaf certificate. Without an explicit chain the
    /// chain is just the identity's own certificate.
    pub fn identity(mut self, identity: SigningIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn trust_anchors(mut self, anchors: Vec<TrustAnchor>) -> Self {
        self.trust_anchors = anchors;
        self
    }

    pub fn trust_anchor(mut self, anchor: TrustAnchor) -> Self {
        self.trust_anchors.push(anchor);
        self
    }

    /// Replace the built-in pinning verifier
    pub fn verifier(mut self, verifier: Arc<dyn CertificateVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set suites in preference order
    pub fn suites(mut self, suites: impl Into<Vec<SuiteId>>) -> Self {
        self.settings.suites = suites.into();
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.settings.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.settings.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn record_sizes(mut self, min: usize, max: usize) -> Self {
        self.settings.min_record_size = min;
        self.settings.max_record_size = max;
        self
    }

    pub fn early_data(mut self, policy: EarlyDataPolicy, max_bytes: usize) -> Self {
        self.settings.early_data = policy;
        self.settings.max_early_data = max_bytes;
        self
    }

    pub fn rekey_after_records(mut self, records: u64) -> Self {
        self.settings.rekey_after_records = records;
        self
    }

    pub fn require_client_certificate(mut self, require: bool) -> Self {
        self.settings.require_client_certificate = require;
        self
    }

    /// Enable verbose logging
    pub fn verbose(mut self) -> Self {
        self.settings.verbose_logging = true;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<TlsConfig> {
        self.settings.validate()?;
        if let Some(name) = &self.server_name {
            if name.is_empty() {
                return Err(invalid("server name must not be empty"));
            }
        }
        let mut certificate_chain = self.certificate_chain;
        match (&self.identity, certificate_chain.first()) {
            (Some(identity), None) => certificate_chain.push(identity.certificate()),
            (Some(identity), Some(leaf)) if *leaf != identity.certificate() => {
                return Err(invalid("leaf certificate does not match the signing identity"));
            }
            (None, Some(_)) => {
                return Err(invalid("certificate chain configured without a signing identity"));
            }
            _ => {}
        }
        Ok(TlsConfig {
            certificate_chain,
            identity: self.identity,
            trust_anchors: self.trust_anchors,
            verifier: self.verifier,
            server_name: self.server_name,
            settings: self.settings,
        })
    }
}

fn invalid(msg: impl Into<String>) -> HybridTlsError {
    HybridTlsError::InvalidConfig(msg.into())
}
