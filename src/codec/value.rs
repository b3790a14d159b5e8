//! Binary payload encoding.
//!
//! Every value starts with a one-byte tag; multi-byte integers are
//! big-endian.
//!
//! | Tag    | Type       | Body                                              |
//! |--------|------------|---------------------------------------------------|
//! | `0x01` | string     | `u32` length, UTF-8 bytes                         |
//! | `0x02` | bytes      | `u32` length, raw bytes                           |
//! | `0x03` | integer    | `i64`                                             |
//! | `0x04` | dictionary | `u32` count, then per entry: `u32` key length, UTF-8 key, value |
//!
//! Both directions enforce the same nesting limit, so anything the encoder
//! accepts, a peer with the same limit can decode. Decoding also rejects
//! unknown tags, invalid UTF-8, duplicate keys and trailing bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::models::{Message, Value};
use crate::{AppError, Result};

/// UTF-8 string.
pub const TAG_STRING: u8 = 0x01;
/// Opaque byte string.
pub const TAG_BYTES: u8 = 0x02;
/// Signed 64-bit integer.
pub const TAG_INT: u8 = 0x03;
/// Nested dictionary.
pub const TAG_DICT: u8 = 0x04;

/// Nesting limit used by [`encode`] and [`decode`].
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Smallest possible encoded dictionary entry: empty key, empty string.
const MIN_ENTRY_BYTES: usize = 4 + 1 + 4;

/// Encode a message as a dictionary value, nested at most
/// [`DEFAULT_MAX_DEPTH`] levels.
///
/// # Errors
///
/// Returns `AppError::Codec` if a string, byte value, or entry count
/// does not fit in a `u32` length prefix, or if nesting is too deep.
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    put_dict(message, 1, DEFAULT_MAX_DEPTH, &mut dst)?;
    Ok(dst.freeze())
}

/// Encode any value.
///
/// `max_depth` bounds dictionary nesting exactly as in [`decode_value`].
///
/// # Errors
///
/// Returns `AppError::Codec` if a length does not fit in a `u32` prefix,
/// or if dictionaries nest deeper than `max_depth`.
pub fn encode_value(value: &Value, max_depth: usize) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    put_value(value, 0, max_depth, &mut dst)?;
    Ok(dst.freeze())
}

/// Decode bytes that must hold exactly one dictionary.
///
/// # Errors
///
/// Returns `AppError::Codec` on truncated or malformed input, or when the
/// root value is not a dictionary.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    match decode_value(bytes, DEFAULT_MAX_DEPTH)? {
        Value::Dict(message) => Ok(message),
        other => Err(AppError::Codec(format!(
            "expected dictionary at root, found {}",
            other.type_name()
        ))),
    }
}

/// Decode bytes that must hold exactly one value of any type.
///
/// `max_depth` bounds dictionary nesting; the root dictionary counts as
/// depth 1.
///
/// # Errors
///
/// Returns `AppError::Codec` on truncated or malformed input.
pub fn decode_value(bytes: &[u8], max_depth: usize) -> Result<Value> {
    let mut reader = Reader {
        buf: bytes,
        max_depth,
    };
    let value = reader.value(0)?;
    if reader.buf.has_remaining() {
        return Err(AppError::Codec(format!(
            "{} trailing bytes after value",
            reader.buf.remaining()
        )));
    }
    Ok(value)
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// `depth` is the nesting level of the enclosing dictionary, 0 at the root.
fn put_value(value: &Value, depth: usize, max_depth: usize, dst: &mut BytesMut) -> Result<()> {
    match value {
        Value::String(s) => {
            dst.put_u8(TAG_STRING);
            put_len_prefixed(s.as_bytes(), dst)
        }
        Value::Bytes(b) => {
            dst.put_u8(TAG_BYTES);
            put_len_prefixed(b, dst)
        }
        Value::Int(i) => {
            dst.put_u8(TAG_INT);
            dst.put_i64(*i);
            Ok(())
        }
        Value::Dict(m) => put_dict(m, depth + 1, max_depth, dst),
    }
}

fn put_dict(message: &Message, depth: usize, max_depth: usize, dst: &mut BytesMut) -> Result<()> {
    if depth > max_depth {
        return Err(AppError::Codec(format!("dictionary nesting exceeds {max_depth} levels")));
    }
    dst.put_u8(TAG_DICT);
    dst.put_u32(len_u32(message.len(), "entry count")?);
    for (key, value) in message.iter() {
        put_len_prefixed(key.as_bytes(), dst)?;
        put_value(value, depth, max_depth, dst)?;
    }
    Ok(())
}

fn put_len_prefixed(bytes: &[u8], dst: &mut BytesMut) -> Result<()> {
    dst.put_u32(len_u32(bytes.len(), "length")?);
    dst.put_slice(bytes);
    Ok(())
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| AppError::Codec(format!("{what} {len} exceeds u32 range")))
}

// ── Decoding ──────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    max_depth: usize,
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(AppError::Codec(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn slice(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.u32(what)? as usize;
        self.need(len, what)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let raw = self.slice(what)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|err| AppError::Codec(format!("invalid utf-8 in {what}: {err}")))
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        match self.u8("value tag")? {
            TAG_STRING => self.string("string").map(Value::String),
            TAG_BYTES => self.slice("bytes").map(|b| Value::Bytes(b.to_vec())),
            TAG_INT => {
                self.need(8, "integer")?;
                Ok(Value::Int(self.buf.get_i64()))
            }
            TAG_DICT => self.dict(depth + 1).map(Value::Dict),
            other => Err(AppError::Codec(format!("unknown value tag 0x{other:02x}"))),
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Message> {
        if depth > self.max_depth {
            return Err(AppError::Codec(format!(
                "dictionary nesting exceeds {} levels",
                self.max_depth
            )));
        }

        let count = self.u32("entry count")? as usize;
        if count > self.buf.remaining() / MIN_ENTRY_BYTES {
            return Err(AppError::Codec(format!(
                "truncated dictionary: {count} entries cannot fit in {} bytes",
                self.buf.remaining()
            )));
        }

        let mut message = Message::new();
        for _ in 0..count {
            let key = self.string("key")?;
            let value = self.value(depth)?;
            if message.insert(key.clone(), value).is_some() {
                return Err(AppError::Codec(format!("duplicate key '{key}'")));
            }
        }
        Ok(message)
    }
}
