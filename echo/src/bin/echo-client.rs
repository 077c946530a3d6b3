use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hybrid_tls::{Connection, Role};
use hybrid_tls_echo::{client_config, exchange_line, generate_identity};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "echo-client",
    about = "Send stdin lines to an echo server; an empty line quits"
)]
struct Cli {
    /// Directory holding certs/trust.store and optionally chains/client.chain
    /// with private/client.private
    #[arg(long, env = "ECHO_CONFIG_DIR")]
    config_dir: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4433")]
    server: String,
    /// Identity the server's certificate must be pinned to
    #[arg(long, required_unless_present = "generate_identity")]
    server_name: Option<String>,
    /// Write a new client key and chain into the config directory and exit
    #[arg(long)]
    generate_identity: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    if cli.generate_identity {
        generate_identity(&cli.config_dir, Role::Client)?;
        return Ok(());
    }
    let server_name = cli
        .server_name
        .context("--server-name is required to connect")?;

    let config = client_config(&cli.config_dir, &server_name)?;
    let stream = TcpStream::connect(&cli.server)
        .await
        .with_context(|| format!("failed to connect to {}", cli.server))?;
    let connection = Connection::connect(stream, &config)
        .await
        .context("handshake failed")?;
    info!(server = %cli.server, suite = %connection.suite(), "connected");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            break;
        }
        match exchange_line(&connection, &line).await? {
            Some(echo) => print!("{}", String::from_utf8_lossy(&echo)),
            None => {
                info!("server closed the connection");
                break;
            }
        }
    }

    connection.close().await?;
    Ok(())
}
