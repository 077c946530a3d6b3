use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hybrid_tls::{Listener, Role};
use hybrid_tls_echo::{
    anchor_line, generate_identity, load_chain, server_config, KILL_COMMAND, SERVER_CHAIN,
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo-server", about = "Echo records back over a hybrid-tls connection")]
struct Cli {
    /// Directory holding chains/server.chain, private/server.private and
    /// optionally certs/trust.store
    #[arg(long, env = "ECHO_CONFIG_DIR")]
    config_dir: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4433")]
    listen: String,
    /// Print a trust store line for this subject and exit
    #[arg(long, value_name = "SUBJECT")]
    print_anchor: Option<String>,
    /// Write a new server key and chain into the config directory and exit
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
        generate_identity(&cli.config_dir, Role::Server)?;
        return Ok(());
    }

    if let Some(subject) = cli.print_anchor {
        let chain = load_chain(&cli.config_dir.join(SERVER_CHAIN))?;
        if let Some(line) = anchor_line(&subject, &chain) {
            println!("{line}");
        }
        return Ok(());
    }

    let config = server_config(&cli.config_dir)?;
    let listener = Listener::bind(cli.listen.as_str(), config)
        .await
        .with_context(|| format!("failed to listen on {}", cli.listen))?;
    let shutdown = listener.shutdown_signal();
    info!(addr = %listener.local_addr()?, "echo server online");

    let kill = shutdown.clone();
    let serving = listener.serve(move |connection, peer| {
        let kill = kill.clone();
        async move {
            loop {
                match connection.receive().await {
                    Ok(Some(data)) => {
                        if let Err(err) = connection.send(&data).await {
                            tracing::warn!(peer = %peer, error = %err, "echo failed");
                            break;
                        }
                        // Echo first: the process exits once the accept loop stops
                        if data == KILL_COMMAND {
                            info!(peer = %peer, "received kill command");
                            kill.trigger();
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(peer = %peer, error = %err, "receive failed");
                        break;
                    }
                }
            }
            let _ = connection.close().await;
            info!(peer = %peer, "connection finished");
        }
    });

    tokio::select! {
        result = serving => result.context("listener failed")?,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            shutdown.trigger();
        }
    }
    Ok(())
}
