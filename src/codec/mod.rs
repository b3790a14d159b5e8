//! Wire encoding for payloads and frames.
//!
//! - `value`: transport-independent binary encoding of [`Value`](crate::models::Value)
//!   and [`Message`](crate::models::Message).
//! - `frame`: [`LengthDelimitedCodec`](tokio_util::codec::LengthDelimitedCodec)-based
//!   framing with a fixed header carrying message identifiers and reply
//!   correlation.

pub mod frame;
pub mod value;

pub use frame::{Frame, FrameCodec, FrameHeader, FRAME_MAGIC, HEADER_LEN};
pub use value::{decode, decode_value, encode, encode_value};
