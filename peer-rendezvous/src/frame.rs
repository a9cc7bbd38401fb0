//! Length-prefixed wire frames shared by the broker and its clients.
//!
//! ```text
//! [length:4][type:1][senderIdLength:1][senderId][payload]
//! ```
//!
//! `length` is big-endian and counts every byte after the length field. The
//! payload is opaque: commas, newlines or any other byte pass through
//! untouched, so nothing on the wire is split on a delimiter.

use std::{borrow::Cow, fmt, io};

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Upper bound on the bytes following the length prefix.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Sender id used on frames the broker originates itself.
pub const SERVER_ID: &str = "Server";

const HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Command = 0,
    Message = 1,
    Control = 2,
    Denied = 3,
    ConnectionRequest = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(FrameType::Command),
            1 => Ok(FrameType::Message),
            2 => Ok(FrameType::Control),
            3 => Ok(FrameType::Denied),
            4 => Ok(FrameType::ConnectionRequest),
            other => Err(FrameError::InvalidType(other)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Command => "command",
            FrameType::Message => "message",
            FrameType::Control => "control",
            FrameType::Denied => "denied",
            FrameType::ConnectionRequest => "connection_request",
        };
        f.write_str(name)
    }
}

/// Errors produced while encoding or decoding frames.
///
/// Every variant except [`FrameError::Io`] means the peer sent a malformed
/// frame; the owning connection is closed when one surfaces.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: truncated length prefix ({0} bytes)")]
    TruncatedLength(usize),
    #[error("malformed frame: body of {0} bytes is shorter than the header")]
    TruncatedHeader(usize),
    #[error("malformed frame: invalid type tag {0}")]
    InvalidType(u8),
    #[error("malformed frame: length field says {declared} bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("malformed frame: sender id of {declared} bytes overruns a {available} byte body")]
    SenderIdOverrun { declared: usize, available: usize },
    #[error("malformed frame: sender id is not valid utf-8")]
    InvalidSenderId,
    #[error("sender id is {0} bytes, the limit is 255")]
    SenderIdTooLong(usize),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

impl FrameError {
    /// True when the error describes bytes the peer sent, not a local I/O failure.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub sender: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameType, sender: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            payload: payload.into(),
        }
    }

    /// A frame originated by the broker.
    pub fn from_server(kind: FrameType, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(kind, SERVER_ID, payload)
    }

    pub fn command(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(FrameType::Command, sender, text.into().into_bytes())
    }

    pub fn message(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(FrameType::Message, sender, text.into().into_bytes())
    }

    /// Payload as text, replacing invalid utf-8 sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Encodes a single frame into a freshly allocated buffer.
pub fn encode(kind: FrameType, sender: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut dst = BytesMut::new();
    encode_into(kind, sender, payload, &mut dst)?;
    Ok(dst.to_vec())
}

/// Decodes exactly one complete frame, length prefix included.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < LENGTH_PREFIX_LEN {
        return Err(FrameError::TruncatedLength(bytes.len()));
    }
    let (prefix, body) = bytes.split_at(LENGTH_PREFIX_LEN);
    let declared = read_length(prefix);
    if declared != body.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    decode_body(body)
}

fn encode_into(
    kind: FrameType,
    sender: &str,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    let sender_len = u8::try_from(sender.len())
        .map_err(|_| FrameError::SenderIdTooLong(sender.len()))?;
    let body_len = HEADER_LEN + sender.len() + payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            size: body_len,
            max: MAX_FRAME_LEN,
        });
    }

    dst.reserve(LENGTH_PREFIX_LEN + body_len);
    // body_len <= MAX_FRAME_LEN, which fits in u32.
    dst.put_u32(body_len as u32);
    dst.put_u8(kind as u8);
    dst.put_u8(sender_len);
    dst.put_slice(sender.as_bytes());
    dst.put_slice(payload);
    Ok(())
}

fn decode_body(body: &[u8]) -> Result<Frame, FrameError> {
    if body.len() < HEADER_LEN {
        return Err(FrameError::TruncatedHeader(body.len()));
    }
    let kind = FrameType::try_from(body[0])?;
    let sender_len = usize::from(body[1]);
    let rest = &body[HEADER_LEN..];
    if sender_len > rest.len() {
        return Err(FrameError::SenderIdOverrun {
            declared: sender_len,
            available: rest.len(),
        });
    }

    let (sender, payload) = rest.split_at(sender_len);
    let sender = std::str::from_utf8(sender).map_err(|_| FrameError::InvalidSenderId)?;

    Ok(Frame {
        kind,
        sender: sender.to_string(),
        payload: payload.to_vec(),
    })
}

fn read_length(prefix: &[u8]) -> usize {
    let mut raw = [0u8; LENGTH_PREFIX_LEN];
    raw.copy_from_slice(&prefix[..LENGTH_PREFIX_LEN]);
    u32::from_be_bytes(raw) as usize
}

/// Stream codec that reassembles frames from partial reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let body_len = read_length(&src[..LENGTH_PREFIX_LEN]);
        if body_len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                size: body_len,
                max: MAX_FRAME_LEN,
            });
        }

        let total = LENGTH_PREFIX_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(body_len);
        decode_body(&body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_into(frame.kind, &frame.sender, &frame.payload, dst)
    }
}
