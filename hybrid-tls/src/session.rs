//! Established connections over an async byte stream

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use crate::config::{EarlyDataPolicy, SessionSettings, TlsConfig};
use crate::error::{HybridTlsError, Result, Violation};
use crate::handshake::{Established, Handshake, HandshakeState, Role};
use crate::record::{RecordContent, RecordReceiver, RecordSender};
use crate::schedule::DIGEST_LEN;
use crate::suite::SuiteId;
use crate::wire::{Alert, Frame, FrameCodec, HandshakeMessage};

struct WriteState<T> {
    sink: FramedWrite<WriteHalf<T>, FrameCodec>,
    records: RecordSender,
}

struct ReadState<T> {
    stream: FramedRead<ReadHalf<T>, FrameCodec>,
    records: RecordReceiver,
    /// Sealed records that arrived before the handshake completed
    early: VecDeque<Bytes>,
    peer_closed: bool,
}

/// A secure connection established by a completed handshake.
///
/// `send`, `receive`, `rekey` and `close` all take `&self`; share the
/// connection across tasks with an `Arc`. Writes are serialized on one
/// mutex and reads on another, so one task can read while another writes.
pub struct Connection<T> {
    role: Role,
    suite: SuiteId,
    transcript_digest: [u8; DIGEST_LEN],
    peer_certificates: Vec<Vec<u8>>,
    settings: SessionSettings,
    writer: Mutex<WriteState<T>>,
    reader: Mutex<ReadState<T>>,
    closed: AtomicBool,
    failed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the client handshake over `transport`
    pub async fn connect(transport: T, config: &TlsConfig) -> Result<Self> {
        config.settings.validate()?;
        Self::handshake(transport, Handshake::client(config.clone()), &config.settings).await
    }

    /// Run the server handshake over `transport`
    pub async fn accept(transport: T, config: &TlsConfig) -> Result<Self> {
        config.settings.validate()?;
        Self::handshake(transport, Handshake::server(config.clone()), &config.settings).await
    }

    async fn handshake(
        transport: T,
        handshake: Handshake,
        settings: &SessionSettings,
    ) -> Result<Self> {
        let role = handshake.role();
        match timeout(
            settings.handshake_timeout(),
            Self::run_handshake(transport, handshake, settings),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    role = %role,
                    timeout_ms = settings.handshake_timeout_ms,
                    "handshake timed out"
                );
                Err(HybridTlsError::HandshakeTimeout)
            }
        }
    }

    async fn run_handshake(
        transport: T,
        mut handshake: Handshake,
        settings: &SessionSettings,
    ) -> Result<Self> {
        let codec = FrameCodec::new(
            settings.max_handshake_message_size,
            settings.record_limits().max_ciphertext_len(),
        );
        let mut framed = Framed::new(transport, codec.clone());

        let result = match handshake.start() {
            Ok(flight) => drive(&mut framed, &mut handshake, flight, settings).await,
            Err(err) => Err(err),
        };
        let early = match result {
            Ok(early) => early,
            Err(err) => {
                handshake.abort();
                if should_alert_peer(&err) {
                    // Best effort; the handshake error is what the caller sees
                    let alert = Frame::Alert(Alert::for_error(&err));
                    let _ = timeout(settings.close_timeout(), framed.send(alert)).await;
                }
                return Err(err);
            }
        };

        let established = handshake.into_established()?;
        Self::from_established(framed, established, early, codec, settings.clone())
    }

    fn from_established(
        framed: Framed<T, FrameCodec>,
        established: Established,
        early: VecDeque<Bytes>,
        codec: FrameCodec,
        settings: SessionSettings,
    ) -> Result<Self> {
        let Established {
            role,
            suite,
            records,
            transcript_digest,
            peer_certificates,
        } = established;
        let (sender, receiver) = records.into_halves(role, settings.rekey_after_records)?;

        // Frames the peer sent right after its last handshake message may
        // already sit in the read buffer.
        let parts = framed.into_parts();
        let (read_half, write_half) = split(parts.io);
        let mut stream = FramedRead::new(read_half, codec.clone());
        stream.read_buffer_mut().extend_from_slice(&parts.read_buf);
        let sink = FramedWrite::new(write_half, codec);

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            role,
            suite,
            transcript_digest,
            peer_certificates,
            settings,
            writer: Mutex::new(WriteState {
                sink,
                records: sender,
            }),
            reader: Mutex::new(ReadState {
                stream,
                records: receiver,
                early,
                peer_closed: false,
            }),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn suite(&self) -> SuiteId {
        self.suite
    }

    /// Digest over the full handshake transcript
    pub fn transcript_digest(&self) -> &[u8; DIGEST_LEN] {
        &self.transcript_digest
    }

    /// Certificate chain the peer presented
    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        &self.peer_certificates
    }

    pub fn state(&self) -> HandshakeState {
        if self.closed.load(Ordering::Acquire) {
            HandshakeState::Closed
        } else if self.failed.load(Ordering::Acquire) {
            HandshakeState::Failed
        } else {
            HandshakeState::Established
        }
    }

    /// Send `data`, split into records of at most `max_record_size` bytes
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let result = self
            .cancellable(async {
                let mut writer = self.writer.lock().await;
                for chunk in data.chunks(self.settings.max_record_size) {
                    if writer.records.needs_rekey() {
                        let update = writer.records.key_update()?;
                        tracing::debug!(
                            role = %self.role,
                            generation = writer.records.generation(),
                            "automatic key update"
                        );
                        writer.sink.feed(Frame::ApplicationData(update.into())).await?;
                    }
                    let sealed = writer.records.seal_data(chunk)?;
                    writer.sink.feed(Frame::ApplicationData(sealed.into())).await?;
                }
                writer.sink.flush().await
            })
            .await;
        self.track(result)
    }

    /// Receive the next record's data; `None` once the peer has closed
    pub async fn receive(&self) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let result = self
            .cancellable(async {
                let mut reader = self.reader.lock().await;
                loop {
                    if reader.peer_closed {
                        return Ok(None);
                    }
                    let sealed = match reader.early.pop_front() {
                        Some(sealed) => sealed,
                        None => match reader.stream.next().await {
                            Some(Ok(Frame::ApplicationData(sealed))) => sealed,
                            // Alerts are sealed once established
                            Some(Ok(Frame::Alert(alert))) => {
                                return Err(HybridTlsError::RecordFraming(format!(
                                    "plaintext alert {} after handshake",
                                    alert.description
                                )));
                            }
                            Some(Ok(Frame::Handshake(body))) => {
                                let got = HandshakeMessage::decode(&body)
                                    .map(|m| m.message_type().name())
                                    .unwrap_or("malformed handshake");
                                return Err(HybridTlsError::violation(
                                    HandshakeState::Established,
                                    Violation::UnexpectedMessage {
                                        expected: "application data",
                                        got,
                                    },
                                ));
                            }
                            Some(Err(err)) => return Err(err),
                            None => {
                                return Err(HybridTlsError::violation(
                                    HandshakeState::Established,
                                    Violation::ConnectionClosed,
                                ));
                            }
                        },
                    };

                    match reader.records.open(&sealed)? {
                        RecordContent::ApplicationData(data) => return Ok(Some(data)),
                        RecordContent::KeyUpdate => {
                            tracing::debug!(role = %self.role, "peer updated its keys");
                        }
                        RecordContent::Alert(alert) if alert.description == Alert::CLOSE_NOTIFY => {
                            tracing::debug!(
                                role = %self.role,
                                sequence = reader.records.sequence(),
                                "peer sent close_notify"
                            );
                            reader.peer_closed = true;
                        }
                        RecordContent::Alert(alert) => {
                            return Err(HybridTlsError::violation(
                                HandshakeState::Established,
                                Violation::PeerAlert(alert.description),
                            ));
                        }
                    }
                }
            })
            .await;
        self.track(result)
    }

    /// Send a key update and switch to fresh send keys
    pub async fn rekey(&self) -> Result<()> {
        self.ensure_open()?;
        let result = self
            .cancellable(async {
                let mut writer = self.writer.lock().await;
                tracing::debug!(
                    role = %self.role,
                    sequence = writer.records.sequence(),
                    "key update requested"
                );
                let update = writer.records.key_update()?;
                writer.sink.send(Frame::ApplicationData(update.into())).await
            })
            .await;
        self.track(result)
    }

    /// Close the connection.
    ///
    /// In-flight calls fail with [`HybridTlsError::Cancelled`]. A sealed
    /// close_notify is attempted within `close_timeout`; whatever happens to
    /// it, the transport is then shut down under its own `close_timeout`.
    /// Calling `close` again does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let close_timeout = self.settings.close_timeout();
        if !self.failed.load(Ordering::Acquire) {
            let notify = timeout(close_timeout, async {
                let mut writer = self.writer.lock().await;
                let sealed = writer.records.seal_alert(Alert::close_notify())?;
                writer.sink.send(Frame::ApplicationData(sealed.into())).await?;
                Ok::<_, HybridTlsError>(writer.records.sequence())
            })
            .await;
            match notify {
                Ok(Ok(sequence)) => {
                    tracing::debug!(role = %self.role, sequence, "close_notify sent")
                }
                Ok(Err(err)) => {
                    tracing::debug!(role = %self.role, error = %err, "close_notify not delivered")
                }
                Err(_) => tracing::debug!(role = %self.role, "close_notify timed out"),
            }
        }

        // A stalled close_notify leaves unsent bytes in the sink; shut the
        // transport down directly so the peer still sees end of stream
        let shutdown = timeout(close_timeout, async {
            let mut writer = self.writer.lock().await;
            writer.sink.get_mut().shutdown().await
        })
        .await;
        match shutdown {
            Ok(Ok(())) => tracing::debug!(role = %self.role, "connection closed"),
            Ok(Err(err)) => {
                tracing::debug!(role = %self.role, error = %err, "transport shutdown failed")
            }
            Err(_) => tracing::debug!(role = %self.role, "transport shutdown timed out"),
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.failed.load(Ordering::Acquire) {
            Err(HybridTlsError::Closed)
        } else {
            Ok(())
        }
    }

    async fn cancellable<R>(&self, operation: impl Future<Output = Result<R>>) -> Result<R> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => Err(HybridTlsError::Cancelled),
            result = operation => result,
        }
    }

    /// Protocol and crypto failures are terminal for the connection
    fn track<R>(&self, result: Result<R>) -> Result<R> {
        if let Err(err) = &result {
            if !matches!(err, HybridTlsError::Cancelled | HybridTlsError::Closed) {
                tracing::warn!(role = %self.role, suite = %self.suite, error = %err, "connection failed");
                self.failed.store(true, Ordering::Release);
            }
        }
        result
    }
}

/// Exchange handshake messages until the machine is established.
///
/// Returns application records that arrived early, still sealed.
async fn drive<T>(
    framed: &mut Framed<T, FrameCodec>,
    handshake: &mut Handshake,
    first_flight: Vec<HandshakeMessage>,
    settings: &SessionSettings,
) -> Result<VecDeque<Bytes>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut early = VecDeque::new();
    let mut early_bytes = 0usize;

    send_flight(framed, first_flight).await?;
    while !handshake.is_established() {
        let frame = framed.next().await.ok_or_else(|| {
            HybridTlsError::violation(handshake.state(), Violation::ConnectionClosed)
        })??;
        match frame {
            Frame::Handshake(body) => {
                let message = HandshakeMessage::decode(&body)?;
                let replies = handshake.handle(message)?;
                send_flight(framed, replies).await?;
            }
            Frame::Alert(alert) => {
                tracing::warn!(
                    role = %handshake.role(),
                    state = %handshake.state(),
                    alert = alert.description,
                    "peer aborted handshake"
                );
                return Err(HybridTlsError::violation(
                    handshake.state(),
                    Violation::PeerAlert(alert.description),
                ));
            }
            Frame::ApplicationData(sealed) => {
                early_bytes += sealed.len();
                if settings.early_data == EarlyDataPolicy::Reject
                    || early_bytes > settings.max_early_data
                {
                    return Err(HybridTlsError::violation(
                        handshake.state(),
                        Violation::EarlyData,
                    ));
                }
                early.push_back(sealed);
            }
        }
    }
    Ok(early)
}

/// Whether the peer can still usefully be told why we gave up
fn should_alert_peer(err: &HybridTlsError) -> bool {
    !err.is_transport()
        && !matches!(
            err,
            HybridTlsError::ProtocolViolation {
                violation: Violation::PeerAlert(_) | Violation::ConnectionClosed,
                ..
            }
        )
}

async fn send_flight<T>(
    framed: &mut Framed<T, FrameCodec>,
    messages: Vec<HandshakeMessage>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if messages.is_empty() {
        return Ok(());
    }
    for message in messages {
        framed.feed(Frame::Handshake(message.encode()?)).await?;
    }
    framed.flush().await
}
