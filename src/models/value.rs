//! Message payload model.
//!
//! A [`Message`] is an ordered mapping from unique string keys to
//! [`Value`]s. Values are strings, raw bytes, signed 64-bit integers, or
//! nested messages; nothing else has a wire representation.

use std::fmt::{Display, Formatter, Write as _};

use crate::{AppError, Result};

/// Number of bytes rendered before a byte value is elided in `Display`.
const BYTES_PREVIEW: usize = 32;

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// UTF-8 string.
    String(String),
    /// Opaque byte string.
    Bytes(Vec<u8>),
    /// Signed 64-bit integer.
    Int(i64),
    /// Nested dictionary.
    Dict(Message),
}

impl Value {
    /// Short type label used in logs and error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Int(_) => "integer",
            Self::Dict(_) => "dictionary",
        }
    }

    /// Borrow the value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the value as raw bytes, if it is a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The integer, if the value is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow the value as a dictionary, if it is one.
    #[must_use]
    pub fn as_dict(&self) -> Option<&Message> {
        match self {
            Self::Dict(m) => Some(m),
            _ => None,
        }
    }

    /// Take the value as a dictionary, if it is one.
    #[must_use]
    pub fn into_dict(self) -> Option<Message> {
        match self {
            Self::Dict(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<Message> for Value {
    fn from(value: Message) -> Self {
        Self::Dict(value)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = AppError;

    /// Convert JSON into a payload value.
    ///
    /// Strings, integers that fit in `i64`, and objects convert. Floats,
    /// booleans, nulls, and arrays have no wire representation and fail
    /// with `AppError::UnsupportedType`.
    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => Ok(Self::String(s)),
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int).ok_or_else(|| {
                AppError::UnsupportedType(format!("number {n} is not a 64-bit signed integer"))
            }),
            serde_json::Value::Object(map) => Message::try_from_json_object(map).map(Self::Dict),
            serde_json::Value::Bool(_) => Err(AppError::UnsupportedType("boolean".into())),
            serde_json::Value::Null => Err(AppError::UnsupportedType("null".into())),
            serde_json::Value::Array(_) => Err(AppError::UnsupportedType("array".into())),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Dict(m) => write!(f, "{m}"),
            Self::Bytes(b) => {
                let mut hex = String::with_capacity(BYTES_PREVIEW * 2);
                for byte in b.iter().take(BYTES_PREVIEW) {
                    let _ = write!(hex, "{byte:02x}");
                }
                if b.len() > BYTES_PREVIEW {
                    write!(f, "<bytes: {hex}… ({} bytes)>", b.len())
                } else {
                    write!(f, "<bytes: {hex}>")
                }
            }
        }
    }
}

/// An ordered dictionary with unique string keys.
///
/// Insertion order is preserved on the wire, but equality ignores it.
#[derive(Debug, Clone, Default)]
pub struct Message {
    entries: Vec<(String, Value)>,
}

impl Message {
    /// An empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert `value` under `key`.
    ///
    /// An existing key keeps its position and has its value replaced; the
    /// previous value is returned.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        if let Some((_, slot)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(slot, value));
        }
        self.entries.push((key, value));
        None
    }

    /// Look up `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the message has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    fn try_from_json_object(map: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut message = Self::new();
        for (key, value) in map {
            let value = Value::try_from(value)
                .map_err(|err| AppError::UnsupportedType(format!("key '{key}': {err}")))?;
            message.insert(key, value);
        }
        Ok(message)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Eq for Message {}

impl<K, V> FromIterator<(K, V)> for Message
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut message = Self::new();
        for (k, v) in iter {
            message.insert(k, v);
        }
        message
    }
}

impl IntoIterator for Message {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl TryFrom<serde_json::Value> for Message {
    type Error = AppError;

    /// Convert a JSON object into a message.
    ///
    /// Any non-object root, and any unsupported nested value, fails with
    /// `AppError::UnsupportedType`.
    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => Self::try_from_json_object(map),
            other => Err(AppError::UnsupportedType(format!(
                "message root must be an object, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{ ")?;
        for (index, (key, value)) in self.entries.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key:?}: {value}")?;
        }
        f.write_str(" }")
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
