//! Shared setup for the echo client and server
//!
//! A config directory looks like:
//!
//! ```text
//! DIR/chains/server.chain     server certificates, one hex-encoded per line
//! DIR/private/server.private  hex seed of the server's ML-DSA-65 key
//! DIR/chains/client.chain     optional client certificates
//! DIR/private/client.private  client key, required with client.chain
//! DIR/certs/trust.store       `subject sha256-hex` per line
//! DIR/settings.json           optional SessionSettings
//! ```
//!
//! The leaf of each chain is the encoded verifying key of the matching
//! private seed; [`generate_identity`] writes both.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

use hybrid_tls::cert::{fingerprint, parse_trust_store};
use hybrid_tls::identity::SEED_LEN;
use hybrid_tls::{Connection, Role, SessionSettings, SigningIdentity, TlsConfig, TrustAnchor};

pub const SERVER_CHAIN: &str = "chains/server.chain";
pub const CLIENT_CHAIN: &str = "chains/client.chain";
pub const SERVER_KEY: &str = "private/server.private";
pub const CLIENT_KEY: &str = "private/client.private";
pub const TRUST_STORE: &str = "certs/trust.store";
pub const SETTINGS: &str = "settings.json";

/// Message that makes the echo server stop accepting connections
pub const KILL_COMMAND: &[u8] = b"kill\n";

/// Parse a chain file: one hex-encoded certificate per line, leaf first
pub fn parse_chain(contents: &str) -> Result<Vec<Vec<u8>>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(i, line)| hex::decode(line).with_context(|| format!("certificate {i} is not hex")))
        .collect()
}

pub fn load_chain(path: &Path) -> Result<Vec<Vec<u8>>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let chain = parse_chain(&contents).with_context(|| format!("in {}", path.display()))?;
    if chain.is_empty() {
        anyhow::bail!("{} holds no certificates", path.display());
    }
    Ok(chain)
}

/// Parse a private key file: the hex-encoded 32-byte seed
pub fn parse_identity(contents: &str) -> Result<SigningIdentity> {
    let bytes = hex::decode(contents.trim()).context("private key is not hex")?;
    let seed: [u8; SEED_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
        anyhow::anyhow!("private key must be {SEED_LEN} bytes, got {}", b.len())
    })?;
    Ok(SigningIdentity::from_seed(seed))
}

pub fn load_identity(path: &Path) -> Result<SigningIdentity> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    #[cfg(unix)]
    warn_if_key_permissions_loose(path);
    parse_identity(&contents).with_context(|| format!("in {}", path.display()))
}

#[cfg(unix)]
fn warn_if_key_permissions_loose(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "private key is readable by other users"
            );
        }
    }
}

/// Create a fresh identity for `role` under `config_dir`, writing its
/// private key and a one-certificate chain. Refuses to overwrite a key.
pub fn generate_identity(config_dir: &Path, role: Role) -> Result<SigningIdentity> {
    let (key_path, chain_path) = match role {
        Role::Server => (config_dir.join(SERVER_KEY), config_dir.join(SERVER_CHAIN)),
        Role::Client => (config_dir.join(CLIENT_KEY), config_dir.join(CLIENT_CHAIN)),
    };
    for path in [&key_path, &chain_path] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let identity = SigningIdentity::generate();
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&key_path)
        .with_context(|| format!("failed to create {}", key_path.display()))?;
    file.write_all(hex::encode(identity.seed()).as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .with_context(|| format!("failed to write {}", key_path.display()))?;

    fs::write(
        &chain_path,
        format!("# {role} leaf\n{}\n", hex::encode(identity.certificate())),
    )
    .with_context(|| format!("failed to write {}", chain_path.display()))?;
    tracing::info!(
        key = %key_path.display(),
        chain = %chain_path.display(),
        fingerprint = %hex::encode(fingerprint(&identity.certificate())),
        "generated {role} identity"
    );
    Ok(identity)
}

pub fn load_trust_store(path: &Path) -> Result<Vec<TrustAnchor>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_trust_store(&contents).with_context(|| format!("in {}", path.display()))
}

/// Settings from `DIR/settings.json`, or defaults when the file is absent
pub fn load_settings(config_dir: &Path) -> Result<SessionSettings> {
    let path = config_dir.join(SETTINGS);
    if !path.exists() {
        return Ok(SessionSettings::default());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("invalid {}", path.display()))
}

pub fn server_config(config_dir: &Path) -> Result<TlsConfig> {
    let chain = load_chain(&config_dir.join(SERVER_CHAIN))?;
    let identity = load_identity(&config_dir.join(SERVER_KEY))?;
    let trust_path = config_dir.join(TRUST_STORE);
    let anchors = if trust_path.exists() {
        load_trust_store(&trust_path)?
    } else {
        Vec::new()
    };
    tracing::info!(
        fingerprint = %hex::encode(fingerprint(&chain[0])),
        anchors = anchors.len(),
        "loaded server identity"
    );
    TlsConfig::builder()
        .certificate_chain(chain)
        .identity(identity)
        .trust_anchors(anchors)
        .settings(load_settings(config_dir)?)
        .build()
        .context("invalid server configuration")
}

pub fn client_config(config_dir: &Path, server_name: &str) -> Result<TlsConfig> {
    let anchors = load_trust_store(&config_dir.join(TRUST_STORE))?;
    let chain_path = config_dir.join(CLIENT_CHAIN);
    let mut builder = TlsConfig::builder();
    if chain_path.exists() {
        builder = builder
            .certificate_chain(load_chain(&chain_path)?)
            .identity(load_identity(&config_dir.join(CLIENT_KEY))?);
    }
    builder
        .trust_anchors(anchors)
        .server_name(server_name)
        .settings(load_settings(config_dir)?)
        .build()
        .context("invalid client configuration")
}

/// Trust store line pinning the first certificate of `chain` for `subject`
pub fn anchor_line(subject: &str, chain: &[Vec<u8>]) -> Option<String> {
    chain
        .first()
        .map(|leaf| format!("{subject} {}", hex::encode(fingerprint(leaf))))
}

/// Send `line` plus a newline and collect the echo, however the server
/// splits it into records. `None` if the server closed first.
pub async fn exchange_line<T>(connection: &Connection<T>, line: &str) -> Result<Option<Vec<u8>>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let message = format!("{line}\n").into_bytes();
    connection.send(&message).await?;
    let mut echoed = Vec::with_capacity(message.len());
    while echoed.len() < message.len() {
        match connection.receive().await? {
            Some(data) => echoed.extend(data),
            None => return Ok(None),
        }
    }
    Ok(Some(echoed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_parse_chain() {
        let chain = parse_chain("# leaf\n6c656166\n\n696e746572\n").unwrap();
        assert_eq!(chain, vec![b"leaf".to_vec(), b"inter".to_vec()]);
        assert!(parse_chain("not hex").is_err());
    }

    #[test]
    fn test_parse_identity() {
        let identity = parse_identity(&format!("{}\n", hex::encode([3u8; SEED_LEN]))).unwrap();
        assert_eq!(identity.seed(), &[3u8; SEED_LEN]);
        assert!(parse_identity("abcd").is_err());
        assert!(parse_identity("not hex").is_err());
    }

    #[test]
    fn test_config_dir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let identity = generate_identity(dir.path(), Role::Server).unwrap();
        let chain = vec![identity.certificate()];
        let anchor = anchor_line("echo.local", &chain).unwrap();
        write(dir.path(), TRUST_STORE, &format!("# demo\n{anchor}\n"));
        write(dir.path(), SETTINGS, r#"{ "max_record_size": 1024 }"#);

        let server = server_config(dir.path()).unwrap();
        assert_eq!(server.certificate_chain, chain);
        assert_eq!(server.settings.max_record_size, 1024);
        assert!(server.identity.is_some());

        let client = client_config(dir.path(), "echo.local").unwrap();
        assert!(client.certificate_chain.is_empty());
        assert!(client.identity.is_none());
        assert_eq!(client.server_name.as_deref(), Some("echo.local"));
        assert_eq!(
            client.trust_anchors,
            vec![TrustAnchor::for_certificate("echo.local", &chain[0])]
        );
    }

    #[test]
    fn test_client_identity_loaded_with_chain() {
        let dir = tempfile::tempdir().unwrap();
        let server = generate_identity(dir.path(), Role::Server).unwrap();
        let client = generate_identity(dir.path(), Role::Client).unwrap();
        let anchor = anchor_line("echo.local", &[server.certificate()]).unwrap();
        write(dir.path(), TRUST_STORE, &anchor);

        let config = client_config(dir.path(), "echo.local").unwrap();
        assert_eq!(config.certificate_chain, vec![client.certificate()]);
        assert!(config.identity.is_some());

        // A chain without its key is a configuration error
        fs::remove_file(dir.path().join(CLIENT_KEY)).unwrap();
        assert!(client_config(dir.path(), "echo.local").is_err());
    }

    #[test]
    fn test_generate_identity_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = generate_identity(dir.path(), Role::Server).unwrap();
        assert!(generate_identity(dir.path(), Role::Server).is_err());
        let loaded = load_identity(&dir.path().join(SERVER_KEY)).unwrap();
        assert_eq!(loaded.certificate(), first.certificate());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join(SERVER_KEY))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_server_chain_must_match_key() {
        let dir = tempfile::tempdir().unwrap();
        generate_identity(dir.path(), Role::Server).unwrap();
        let other = SigningIdentity::generate();
        write(
            dir.path(),
            SERVER_CHAIN,
            &hex::encode(other.certificate()),
        );
        assert!(server_config(dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_exchange_line_collects_split_echo() {
        let identity = SigningIdentity::generate();
        let client_config = TlsConfig::builder()
            .trust_anchor(TrustAnchor::for_certificate(
                "echo.local",
                &identity.certificate(),
            ))
            .server_name("echo.local")
            .build()
            .unwrap();
        let server_config = TlsConfig::builder().identity(identity).build().unwrap();

        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let (client, server) = tokio::join!(
            Connection::connect(client_stream, &client_config),
            Connection::accept(server_stream, &server_config)
        );
        let (client, server) = (client.unwrap(), server.unwrap());

        // Echo back in three-byte records
        let echo = tokio::spawn(async move {
            while let Ok(Some(data)) = server.receive().await {
                for chunk in data.chunks(3) {
                    server.send(chunk).await.unwrap();
                }
            }
        });

        let echoed = exchange_line(&client, "hello over hybrid-tls").await.unwrap();
        assert_eq!(echoed, Some(b"hello over hybrid-tls\n".to_vec()));
        let echoed = exchange_line(&client, "again").await.unwrap();
        assert_eq!(echoed, Some(b"again\n".to_vec()));

        client.close().await.unwrap();
        echo.await.unwrap();
    }

    #[test]
    fn test_missing_server_chain() {
        let dir = tempfile::tempdir().unwrap();
        assert!(server_config(dir.path()).is_err());
    }
}
