//! Frame codec for connection streams.
//!
//! Wraps [`tokio_util::codec::LengthDelimitedCodec`] (4-byte big-endian
//! length prefix) with a configurable maximum frame length, and splits each
//! frame into a fixed [`FrameHeader`] and an opaque payload.
//!
//! ```text
//! 0      4        6          8             16            24
//! +------+--------+----------+-------------+-------------+---------
//! | magic| flags  | reserved | identifier  | reply_to    | payload…
//! +------+--------+----------+-------------+-------------+---------
//! ```
//!
//! The payload is left encoded so that a malformed body fails only its own
//! decode; a malformed header is a protocol violation and fails the stream.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{AppError, Result};

/// `"DLNK"`.
pub const FRAME_MAGIC: u32 = 0x444C_4E4B;

/// Size of the fixed header following the length prefix.
pub const HEADER_LEN: usize = 24;

/// Sender waits for a correlated reply.
pub const FLAG_EXPECTS_REPLY: u16 = 0x1;

/// Frame answers the request named by `reply_to`.
pub const FLAG_IS_REPLY: u16 = 0x2;

/// Fixed per-frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bit set of `FLAG_*` values.
    pub flags: u16,
    /// Sender-assigned identifier, unique per direction of a connection.
    pub identifier: u64,
    /// Identifier of the request being answered; 0 unless a reply.
    pub reply_to: u64,
}

impl FrameHeader {
    /// Header for a fire-and-forget message.
    #[must_use]
    pub fn message(identifier: u64) -> Self {
        Self {
            flags: 0,
            identifier,
            reply_to: 0,
        }
    }

    /// Header for a message awaiting a reply.
    #[must_use]
    pub fn request(identifier: u64) -> Self {
        Self {
            flags: FLAG_EXPECTS_REPLY,
            identifier,
            reply_to: 0,
        }
    }

    /// Header for a reply to request `reply_to`.
    #[must_use]
    pub fn reply(identifier: u64, reply_to: u64) -> Self {
        Self {
            flags: FLAG_IS_REPLY,
            identifier,
            reply_to,
        }
    }

    /// Set on requests.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.flags & FLAG_EXPECTS_REPLY != 0
    }

    /// Set on replies; `reply_to` names the request.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_IS_REPLY != 0
    }

    /// Check flag combinations and identifiers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` if the header is self-contradictory.
    pub fn validate(&self) -> Result<()> {
        if self.expects_reply() && self.is_reply() {
            return Err(AppError::Codec(
                "frame is flagged both as request and reply".into(),
            ));
        }
        if self.is_reply() && self.reply_to == 0 {
            return Err(AppError::Codec("reply frame has no reply_to".into()));
        }
        if !self.is_reply() && self.reply_to != 0 {
            return Err(AppError::Codec(format!(
                "non-reply frame carries reply_to {}",
                self.reply_to
            )));
        }
        if self.identifier == 0 {
            return Err(AppError::Codec("frame identifier must be non-zero".into()));
        }
        Ok(())
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u32(FRAME_MAGIC);
        dst.put_u16(self.flags);
        dst.put_u16(0);
        dst.put_u64(self.identifier);
        dst.put_u64(self.reply_to);
    }

    fn parse(src: &mut BytesMut) -> Result<Self> {
        if src.len() < HEADER_LEN {
            return Err(AppError::Codec(format!(
                "frame of {} bytes is shorter than the {HEADER_LEN}-byte header",
                src.len()
            )));
        }

        let magic = src.get_u32();
        if magic != FRAME_MAGIC {
            return Err(AppError::Codec(format!("bad frame magic 0x{magic:08x}")));
        }
        let flags = src.get_u16();
        let _reserved = src.get_u16();
        let header = Self {
            flags,
            identifier: src.get_u64(),
            reply_to: src.get_u64(),
        };
        header.validate()?;
        Ok(header)
    }
}

/// A header plus its still-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Parsed fixed header.
    pub header: FrameHeader,
    /// Encoded value, decoded by the connection with its own depth limit.
    pub payload: Bytes,
}

/// Length-delimited frame codec with a maximum frame size.
///
/// # Decoder
///
/// Frames longer than the limit, short frames, bad magic, and invalid
/// headers return [`AppError::Codec`]. I/O errors map to [`AppError::Io`].
/// Either way the stream is finished: the caller must treat it as dead.
///
/// # Encoder
///
/// Frames over the limit are refused with [`AppError::Codec`] before any
/// byte is written.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a codec accepting frames of at most `max_frame_bytes`
    /// (header plus payload, excluding the length prefix).
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            inner,
            max_frame_bytes,
        }
    }

    /// Configured limit, header included.
    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Largest payload that fits in one frame.
    #[must_use]
    pub fn max_payload_bytes(&self) -> usize {
        self.max_frame_bytes.saturating_sub(HEADER_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AppError;

    /// Decode the next complete frame from `src`.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(mut raw) = self.inner.decode(src).map_err(|err| map_io_error(&err))? else {
            return Ok(None);
        };
        let header = FrameHeader::parse(&mut raw)?;
        Ok(Some(Frame {
            header,
            payload: raw.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let total = HEADER_LEN + item.payload.len();
        if total > self.max_frame_bytes {
            return Err(AppError::Codec(format!(
                "frame of {total} bytes exceeds limit of {} bytes",
                self.max_frame_bytes
            )));
        }

        let mut buf = BytesMut::with_capacity(total);
        item.header.put(&mut buf);
        buf.put_slice(&item.payload);
        self.inner
            .encode(buf.freeze(), dst)
            .map_err(|err| map_io_error(&err))
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

/// `LengthDelimitedCodec` reports oversize frames as `InvalidData`.
fn map_io_error(err: &io::Error) -> AppError {
    if err.kind() == io::ErrorKind::InvalidData {
        AppError::Codec(format!("frame rejected: {err}"))
    } else {
        AppError::Io(err.to_string())
    }
}
