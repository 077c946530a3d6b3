//! TCP accept loop

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::TlsConfig;
use crate::error::Result;
use crate::session::Connection;

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Stops a [`Listener`] from accepting new connections.
///
/// Cloneable; connection handlers can hold one to stop the listener they
/// were accepted by.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once [`ShutdownSignal::trigger`] has been called
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts TCP connections and runs the server handshake on each
pub struct Listener {
    inner: TcpListener,
    config: Arc<TlsConfig>,
    shutdown: ShutdownSignal,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs, config: TlsConfig) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self {
            inner,
            config: Arc::new(config),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Signal that stops this listener's accept loop
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Accept until shut down, handing each established connection to
    /// `handler` on its own task.
    ///
    /// Handshake failures are logged and only affect their own connection.
    /// Connections still running when the signal fires are left to finish.
    pub async fn serve<H, Fut>(self, handler: H) -> Result<()>
    where
        H: Fn(Connection<TcpStream>, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let local = self.local_addr()?;
        tracing::info!(addr = %local, "listening");

        let mut backoff = ACCEPT_BACKOFF_BASE;
        loop {
            let (socket, peer) = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                accepted = self.inner.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        // Typically fd exhaustion; retrying at once would spin
                        tracing::warn!(
                            error = %err,
                            backoff_ms = backoff.as_millis() as u64,
                            "accept failed"
                        );
                        tokio::select! {
                            biased;
                            _ = self.shutdown.triggered() => break,
                            _ = sleep(backoff) => {}
                        }
                        backoff = next_backoff(backoff);
                        continue;
                    }
                },
            };
            backoff = ACCEPT_BACKOFF_BASE;

            let config = Arc::clone(&self.config);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                match Connection::accept(socket, &config).await {
                    Ok(connection) => {
                        tracing::info!(
                            peer = %peer,
                            suite = %connection.suite(),
                            "connection established"
                        );
                        handler(connection, peer).await;
                    }
                    Err(err) => {
                        tracing::warn!(peer = %peer, error = %err, "handshake failed");
                    }
                }
            });
        }

        tracing::info!(addr = %local, "listener stopped");
        Ok(())
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(ACCEPT_BACKOFF_MAX)
}
