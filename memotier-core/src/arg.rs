//! Argument model for key generation.
//!
//! Decorators hand the engine an argument vector alongside the method id.
//! [`CacheArg`] captures each argument as a type-tagged value so that key
//! generation can disambiguate by both type and value: `Int(42)` and
//! `Str("42")` never collide.
//!
//! Arbitrary serializable values go through [`CacheArg::value`], which
//! never fails: values that serde can represent become self-describing
//! [`CacheArg::Json`]; anything else falls back to
//! [`CacheArg::Opaque`] built from the type name and a textual
//! representation with in-band separators escaped.

use bytes::Bytes;
use serde::Serialize;
use smol_str::SmolStr;

/// A single type-tagged argument in a cached operation's argument vector.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheArg {
    /// The unit argument (niladic position markers).
    Unit,
    /// Boolean value.
    Bool(bool),
    /// Signed integer, widened to 64 bits.
    Int(i64),
    /// Unsigned integer, widened to 64 bits.
    UInt(u64),
    /// Floating point value, widened to 64 bits.
    Float(f64),
    /// String value.
    Str(SmolStr),
    /// Raw byte payload.
    Bytes(Bytes),
    /// Self-describing serialized value for structured arguments.
    Json(serde_json::Value),
    /// Fallback for values serde cannot represent: type name plus an
    /// escaped textual representation.
    Opaque {
        /// Fully qualified type name of the original value.
        type_name: SmolStr,
        /// Escaped textual representation.
        repr: SmolStr,
    },
    /// Escape hatch: this argument's text **is** the entire cache key.
    /// The caller is responsible for global uniqueness.
    RawKey(SmolStr),
}

// Type tags for the fast digest. Stable across releases: changing a tag
// silently invalidates every cached key.
const TAG_UNIT: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_JSON: u8 = 7;
const TAG_OPAQUE: u8 = 8;

impl CacheArg {
    /// Captures any serializable value.
    ///
    /// Values serde can represent become [`CacheArg::Json`]; on
    /// serialization failure the value degrades to [`CacheArg::Opaque`]
    /// carrying the type name. This function never fails.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => CacheArg::Json(json),
            Err(_) => CacheArg::Opaque {
                type_name: SmolStr::new(std::any::type_name::<T>()),
                repr: SmolStr::new_static("<unserializable>"),
            },
        }
    }

    /// Builds an opaque argument from a type name and textual
    /// representation, escaping in-band separators.
    pub fn opaque(type_name: impl AsRef<str>, repr: impl AsRef<str>) -> Self {
        CacheArg::Opaque {
            type_name: SmolStr::new(type_name.as_ref()),
            repr: SmolStr::from(escape(repr.as_ref())),
        }
    }

    /// Marks a pre-computed key: its text becomes the entire cache key.
    pub fn raw_key(key: impl Into<SmolStr>) -> Self {
        CacheArg::RawKey(key.into())
    }

    /// Returns the raw key text if this argument is the raw-key escape hatch.
    pub fn as_raw_key(&self) -> Option<&str> {
        match self {
            CacheArg::RawKey(key) => Some(key),
            _ => None,
        }
    }

    /// Appends this argument's type-tagged, length-prefixed encoding.
    ///
    /// The encoding is the input to the fast key digest. Length prefixes
    /// keep adjacent variable-length arguments from colliding at their
    /// boundary, so no escaping is needed on this path.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            CacheArg::Unit => buf.push(TAG_UNIT),
            CacheArg::Bool(v) => {
                buf.push(TAG_BOOL);
                buf.push(*v as u8);
            }
            CacheArg::Int(v) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            CacheArg::UInt(v) => {
                buf.push(TAG_UINT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            CacheArg::Float(v) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            CacheArg::Str(v) => encode_bytes(buf, TAG_STR, v.as_bytes()),
            CacheArg::Bytes(v) => encode_bytes(buf, TAG_BYTES, v),
            CacheArg::Json(v) => {
                // serde_json writes maps in insertion order (preserve_order),
                // so equal values produce equal text.
                let text = v.to_string();
                encode_bytes(buf, TAG_JSON, text.as_bytes());
            }
            CacheArg::Opaque { type_name, repr } => {
                buf.push(TAG_OPAQUE);
                encode_bytes(buf, TAG_STR, type_name.as_bytes());
                encode_bytes(buf, TAG_STR, repr.as_bytes());
            }
            // Raw keys never reach the digest; generators short-circuit on
            // them before encoding.
            CacheArg::RawKey(v) => encode_bytes(buf, TAG_STR, v.as_bytes()),
        }
    }
}

fn encode_bytes(buf: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    buf.push(tag);
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Escapes the separators used by readable key text (`:`, `&`, `=`).
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\c"),
            '&' => out.push_str("\\a"),
            '=' => out.push_str("\\e"),
            _ => out.push(c),
        }
    }
    out
}

impl From<()> for CacheArg {
    fn from(_: ()) -> Self {
        CacheArg::Unit
    }
}

impl From<bool> for CacheArg {
    fn from(v: bool) -> Self {
        CacheArg::Bool(v)
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for CacheArg {
            fn from(v: $t) -> Self {
                CacheArg::Int(v as i64)
            }
        })*
    };
}

macro_rules! from_uint {
    ($($t:ty),*) => {
        $(impl From<$t> for CacheArg {
            fn from(v: $t) -> Self {
                CacheArg::UInt(v as u64)
            }
        })*
    };
}

from_int!(i8, i16, i32, i64);
from_uint!(u8, u16, u32, u64);

impl From<f32> for CacheArg {
    fn from(v: f32) -> Self {
        CacheArg::Float(v as f64)
    }
}

impl From<f64> for CacheArg {
    fn from(v: f64) -> Self {
        CacheArg::Float(v)
    }
}

impl From<&str> for CacheArg {
    fn from(v: &str) -> Self {
        CacheArg::Str(SmolStr::new(v))
    }
}

impl From<String> for CacheArg {
    fn from(v: String) -> Self {
        CacheArg::Str(SmolStr::from(v))
    }
}

impl From<SmolStr> for CacheArg {
    fn from(v: SmolStr) -> Self {
        CacheArg::Str(v)
    }
}

impl From<Bytes> for CacheArg {
    fn from(v: Bytes) -> Self {
        CacheArg::Bytes(v)
    }
}
