//! Wire format for frames and handshake messages
//!
//! ```text
//! frame            = content_type(u8) || length(u32) || payload
//! application data = 0x17 || ciphertext_len(u32) || ciphertext || tag[16]
//! handshake        = msg_type(u8) || body
//! cert verify      = 0x0f || sig_len(u16) || signature
//! alert            = level(u8) || description(u8)
//! ```
//!
//! All integers are big-endian. Every length prefix is checked against the
//! bytes that remain before it is used.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{HybridTlsError, Result};
use crate::kex::HybridKeyShare;
use crate::schedule::DIGEST_LEN;

/// Frame header: content type + length
pub const FRAME_HEADER_LEN: usize = 5;

/// AEAD tag length for every supported suite
pub const TAG_LEN: usize = 16;

/// Hello nonce length
pub const NONCE_LEN: usize = 32;

/// Outer content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    Alert = 0x15,
    Handshake = 0x16,
    ApplicationData = 0x17,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x15 => Some(Self::Alert),
            0x16 => Some(Self::Handshake),
            0x17 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

/// Alert descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: u8,
    pub description: u8,
}

impl Alert {
    pub const LEVEL_WARNING: u8 = 1;
    pub const LEVEL_FATAL: u8 = 2;

    pub const CLOSE_NOTIFY: u8 = 0;
    pub const UNEXPECTED_MESSAGE: u8 = 10;
    pub const BAD_RECORD_MAC: u8 = 20;
    pub const RECORD_OVERFLOW: u8 = 22;
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const BAD_CERTIFICATE: u8 = 42;
    pub const DECODE_ERROR: u8 = 50;
    pub const DECRYPT_ERROR: u8 = 51;
    pub const PROTOCOL_VERSION: u8 = 70;
    pub const INTERNAL_ERROR: u8 = 80;

    pub fn close_notify() -> Self {
        Self {
            level: Self::LEVEL_WARNING,
            description: Self::CLOSE_NOTIFY,
        }
    }

    pub fn fatal(description: u8) -> Self {
        Self {
            level: Self::LEVEL_FATAL,
            description,
        }
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.level, self.description]
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [level, description] => Ok(Self {
                level: *level,
                description: *description,
            }),
            _ => Err(framing("alert must be exactly 2 bytes")),
        }
    }

    /// Alert to send the peer when a local error aborts the connection
    pub fn for_error(err: &HybridTlsError) -> Self {
        let description = match err {
            HybridTlsError::ProtocolViolation { .. } => Self::UNEXPECTED_MESSAGE,
            HybridTlsError::KeyMismatch { .. } => Self::HANDSHAKE_FAILURE,
            HybridTlsError::HandshakeAuthentication { .. } => Self::DECRYPT_ERROR,
            HybridTlsError::CertificateValidation { .. } => Self::BAD_CERTIFICATE,
            HybridTlsError::AuthenticationFailed => Self::BAD_RECORD_MAC,
            HybridTlsError::RecordTooLarge { .. } => Self::RECORD_OVERFLOW,
            HybridTlsError::RecordFraming(_) => Self::DECODE_ERROR,
            _ => Self::INTERNAL_ERROR,
        };
        Self::fatal(description)
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Alert(Alert),
    /// Encoded handshake message (type byte + body)
    Handshake(Bytes),
    /// Sealed record: ciphertext followed by the tag
    ApplicationData(Bytes),
}

/// Handshake message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ClientHello = 0x01,
    ServerHello = 0x02,
    Certificate = 0x0b,
    CertificateVerify = 0x0f,
    KeyExchange = 0x10,
    Finished = 0x14,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            Self::ClientHello => "ClientHello",
            Self::ServerHello => "ServerHello",
            Self::Certificate => "Certificate",
            Self::CertificateVerify => "CertificateVerify",
            Self::KeyExchange => "KeyExchange",
            Self::Finished => "Finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: u16,
    pub nonce: [u8; NONCE_LEN],
    /// Offered suites in client preference order (raw ids; unknown ids are kept)
    pub suites: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub version: u16,
    pub nonce: [u8; NONCE_LEN],
    pub suite: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMessage {
    /// Opaque certificates, leaf first
    pub chain: Vec<Vec<u8>>,
}

/// Signature over the transcript with the key behind the sender's leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub mac: [u8; DIGEST_LEN],
}

/// Handshake messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    Certificate(CertificateMessage),
    CertificateVerify(CertificateVerify),
    KeyExchange(HybridKeyShare),
    Finished(Finished),
}

impl HandshakeMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            HandshakeMessage::ClientHello(_) => MessageType::ClientHello,
            HandshakeMessage::ServerHello(_) => MessageType::ServerHello,
            HandshakeMessage::Certificate(_) => MessageType::Certificate,
            HandshakeMessage::CertificateVerify(_) => MessageType::CertificateVerify,
            HandshakeMessage::KeyExchange(_) => MessageType::KeyExchange,
            HandshakeMessage::Finished(_) => MessageType::Finished,
        }
    }

    /// Encode as `msg_type || body`; this is also what the transcript hashes
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.message_type() as u8);
        match self {
            HandshakeMessage::ClientHello(hello) => {
                buf.put_u16(hello.version);
                buf.put_slice(&hello.nonce);
                buf.put_u16(u16_len(hello.suites.len(), "suite list")?);
                for suite in &hello.suites {
                    buf.put_u16(*suite);
                }
            }
            HandshakeMessage::ServerHello(hello) => {
                buf.put_u16(hello.version);
                buf.put_slice(&hello.nonce);
                buf.put_u16(hello.suite);
            }
            HandshakeMessage::Certificate(cert) => {
                buf.put_u16(u16_len(cert.chain.len(), "certificate chain")?);
                for der in &cert.chain {
                    buf.put_u32(u32_len(der.len(), "certificate")?);
                    buf.put_slice(der);
                }
            }
            HandshakeMessage::CertificateVerify(verify) => {
                buf.put_u16(u16_len(verify.signature.len(), "signature")?);
                buf.put_slice(&verify.signature);
            }
            HandshakeMessage::KeyExchange(share) => {
                buf.put_u16(u16_len(share.classical.len(), "classical share")?);
                buf.put_slice(&share.classical);
                buf.put_u16(u16_len(share.post_quantum.len(), "post-quantum share")?);
                buf.put_slice(&share.post_quantum);
            }
            HandshakeMessage::Finished(finished) => {
                buf.put_slice(&finished.mac);
            }
        }
        Ok(buf.freeze())
    }

    /// Decode `msg_type || body`, rejecting truncated input and trailing bytes
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let msg_type = take_u8(&mut buf)?;
        let message = match msg_type {
            0x01 => {
                let version = take_u16(&mut buf)?;
                let nonce = take_array::<NONCE_LEN>(&mut buf)?;
                let count = take_u16(&mut buf)? as usize;
                ensure_remaining(&buf, count * 2, "suite list")?;
                let suites = (0..count).map(|_| buf.get_u16()).collect();
                HandshakeMessage::ClientHello(ClientHello {
                    version,
                    nonce,
                    suites,
                })
            }
            0x02 => HandshakeMessage::ServerHello(ServerHello {
                version: take_u16(&mut buf)?,
                nonce: take_array::<NONCE_LEN>(&mut buf)?,
                suite: take_u16(&mut buf)?,
            }),
            0x0b => {
                let count = take_u16(&mut buf)? as usize;
                let mut chain = Vec::with_capacity(count.min(16));
                for _ in 0..count {
                    let len = take_u32(&mut buf)? as usize;
                    chain.push(take_bytes(&mut buf, len, "certificate")?);
                }
                HandshakeMessage::Certificate(CertificateMessage { chain })
            }
            0x0f => {
                let len = take_u16(&mut buf)? as usize;
                HandshakeMessage::CertificateVerify(CertificateVerify {
                    signature: take_bytes(&mut buf, len, "signature")?,
                })
            }
            0x10 => {
                let classical_len = take_u16(&mut buf)? as usize;
                let classical = take_bytes(&mut buf, classical_len, "classical share")?;
                let pq_len = take_u16(&mut buf)? as usize;
                let post_quantum = take_bytes(&mut buf, pq_len, "post-quantum share")?;
                HandshakeMessage::KeyExchange(HybridKeyShare {
                    classical,
                    post_quantum,
                })
            }
            0x14 => HandshakeMessage::Finished(Finished {
                mac: take_array::<DIGEST_LEN>(&mut buf)?,
            }),
            other => {
                return Err(framing(format!("unknown handshake message type {other:#04x}")));
            }
        };
        if buf.has_remaining() {
            return Err(framing(format!(
                "{} trailing bytes after {}",
                buf.remaining(),
                message.message_type().name()
            )));
        }
        Ok(message)
    }
}

/// Codec for [`Frame`]s over a byte stream
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_handshake_len: usize,
    max_ciphertext_len: usize,
}

impl FrameCodec {
    pub fn new(max_handshake_len: usize, max_ciphertext_len: usize) -> Self {
        Self {
            max_handshake_len,
            max_ciphertext_len,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = HybridTlsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let content_type = ContentType::from_u8(src[0])
            .ok_or_else(|| framing(format!("unknown content type {:#04x}", src[0])))?;
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        let body_len = match content_type {
            ContentType::Alert => {
                if length != 2 {
                    return Err(framing("alert frame must carry 2 bytes"));
                }
                length
            }
            ContentType::Handshake => {
                if length == 0 || length > self.max_handshake_len {
                    return Err(framing(format!(
                        "handshake frame of {length} bytes (max {})",
                        self.max_handshake_len
                    )));
                }
                length
            }
            ContentType::ApplicationData => {
                if length == 0 || length > self.max_ciphertext_len {
                    return Err(framing(format!(
                        "record of {length} bytes (max {})",
                        self.max_ciphertext_len
                    )));
                }
                length + TAG_LEN
            }
        };

        let total = FRAME_HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let body = src.split_to(body_len).freeze();
        let frame = match content_type {
            ContentType::Alert => Frame::Alert(Alert::decode(&body)?),
            ContentType::Handshake => Frame::Handshake(body),
            ContentType::ApplicationData => Frame::ApplicationData(body),
        };
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(framing(format!(
                "connection closed with {} bytes of a partial frame",
                src.len()
            ))),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = HybridTlsError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            Frame::Alert(alert) => {
                dst.reserve(FRAME_HEADER_LEN + 2);
                dst.put_u8(ContentType::Alert as u8);
                dst.put_u32(2);
                dst.put_slice(&alert.encode());
            }
            Frame::Handshake(body) => {
                dst.reserve(FRAME_HEADER_LEN + body.len());
                dst.put_u8(ContentType::Handshake as u8);
                dst.put_u32(u32_len(body.len(), "handshake frame")?);
                dst.put_slice(&body);
            }
            Frame::ApplicationData(sealed) => {
                if sealed.len() <= TAG_LEN {
                    return Err(framing("sealed record shorter than its tag"));
                }
                dst.reserve(FRAME_HEADER_LEN + sealed.len());
                dst.put_u8(ContentType::ApplicationData as u8);
                dst.put_u32(u32_len(sealed.len() - TAG_LEN, "record")?);
                dst.put_slice(&sealed);
            }
        }
        Ok(())
    }
}

fn framing(msg: impl Into<String>) -> HybridTlsError {
    HybridTlsError::RecordFraming(msg.into())
}

fn u16_len(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| framing(format!("{what} too long: {len}")))
}

fn u32_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| framing(format!("{what} too long: {len}")))
}

fn ensure_remaining(buf: &&[u8], needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(framing(format!(
            "truncated {what}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure_remaining(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure_remaining(buf, 2, "u16")?;
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure_remaining(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    ensure_remaining(buf, N, "fixed field")?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn take_bytes(buf: &mut &[u8], len: usize, what: &str) -> Result<Vec<u8>> {
    ensure_remaining(buf, len, what)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}
