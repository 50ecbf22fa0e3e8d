//! Serialization formats for cached values.
//!
//! Out-of-process tiers store serialized bytes. The [`Format`] trait is the
//! dyn-compatible serializer contract: providers expose their format via
//! `value_format() -> &dyn Format`, which lets format selection happen at
//! runtime and lets heterogeneous providers coexist in one pipeline.
//!
//! Dyn-compatibility rules out generic methods, so the byte-level API is
//! erased: serialization takes `&dyn erased_serde::Serialize`, and
//! deserialization hands an erased deserializer to a callback. The typed
//! convenience layer lives in [`FormatExt`], which also owns the error
//! attribution: failures carry the concrete type name the caller was
//! working with.
//!
//! ## Semantics
//!
//! - Round-trip is the defining invariant: a successfully serialized value
//!   deserializes to an equal value.
//! - Empty input deserializes to `None`, never an error.
//! - Failures are recoverable [`FormatError`]s, one variant per direction.

use memotier_core::Raw;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

mod json;
mod msgpack;

pub use json::JsonFormat;
pub use msgpack::MsgpackFormat;

/// Errors from serialization and deserialization operations.
///
/// Both variants name the concrete Rust type involved so callers can tell
/// *what* failed to round-trip, not just that something did.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Serialization failed for the named type.
    #[error("serialization failed for `{type_name}`: {source}")]
    Serialize {
        /// The offending type.
        type_name: &'static str,
        /// The underlying serializer error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Deserialization failed for the named target type.
    #[error("deserialization failed for `{type_name}`: {source}")]
    Deserialize {
        /// The target type.
        type_name: &'static str,
        /// The underlying deserializer error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Callback used by [`Format::deserialize_erased`].
pub type DeserializeFn<'a> =
    dyn FnMut(&mut dyn erased_serde::Deserializer<'_>) -> Result<(), erased_serde::Error> + 'a;

/// Dyn-compatible serializer contract.
///
/// Implementations are stateless unit structs; the typed surface is
/// [`FormatExt`], blanket-implemented for every format.
pub trait Format: Send + Sync {
    /// MIME content type of the produced bytes
    /// (e.g. `application/x-msgpack`).
    fn content_type(&self) -> &'static str;

    /// Serializes an erased value to bytes.
    fn serialize_erased(
        &self,
        value: &dyn erased_serde::Serialize,
    ) -> Result<Raw, erased_serde::Error>;

    /// Drives `visit` with a deserializer positioned over `bytes`.
    ///
    /// The callback shape (rather than a returned deserializer) is what
    /// keeps the trait dyn-compatible: the deserializer borrows from
    /// format-internal state that cannot outlive this call.
    fn deserialize_erased(
        &self,
        bytes: &[u8],
        visit: &mut DeserializeFn<'_>,
    ) -> Result<(), erased_serde::Error>;
}

/// Typed convenience layer over [`Format`].
///
/// Automatically implemented for every format, including trait objects.
pub trait FormatExt: Format {
    /// Serializes a value, attributing failures to `T`.
    fn serialize_value<T>(&self, value: &T) -> Result<Raw, FormatError>
    where
        T: Serialize,
    {
        self.serialize_erased(value).map_err(|e| FormatError::Serialize {
            type_name: std::any::type_name::<T>(),
            source: Box::new(e),
        })
    }

    /// Deserializes a value, attributing failures to `T`.
    ///
    /// Empty input yields `Ok(None)`.
    fn deserialize_value<T>(&self, bytes: &[u8]) -> Result<Option<T>, FormatError>
    where
        T: DeserializeOwned,
    {
        if bytes.is_empty() {
            return Ok(None);
        }
        let mut out: Option<T> = None;
        self.deserialize_erased(bytes, &mut |deserializer| {
            out = Some(erased_serde::deserialize(deserializer)?);
            Ok(())
        })
        .map_err(|e| FormatError::Deserialize {
            type_name: std::any::type_name::<T>(),
            source: Box::new(e),
        })?;
        Ok(out)
    }
}

impl<F: Format + ?Sized> FormatExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        id: u64,
        name: String,
        scores: Vec<i32>,
    }

    fn sample() -> Payload {
        Payload {
            id: 42,
            name: "hello".into(),
            scores: vec![-1, 0, 7],
        }
    }

    fn formats() -> Vec<Box<dyn Format>> {
        vec![Box::new(MsgpackFormat), Box::new(JsonFormat)]
    }

    #[test]
    fn round_trip_preserves_values() {
        for format in formats() {
            let bytes = format.serialize_value(&sample()).unwrap();
            let back: Payload = format.deserialize_value(&bytes).unwrap().unwrap();
            assert_eq!(back, sample(), "{}", format.content_type());
        }
    }

    #[test]
    fn empty_input_deserializes_to_none() {
        for format in formats() {
            let out: Option<Payload> = format.deserialize_value(&[]).unwrap();
            assert!(out.is_none(), "{}", format.content_type());
        }
    }

    #[test]
    fn garbage_input_fails_with_target_type_name() {
        for format in formats() {
            let err = format
                .deserialize_value::<Payload>(&[0xff, 0x00, 0x13, 0x37])
                .unwrap_err();
            match err {
                FormatError::Deserialize { type_name, .. } => {
                    assert!(type_name.contains("Payload"));
                }
                other => panic!("expected deserialize failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn content_types_are_declared() {
        assert_eq!(MsgpackFormat.content_type(), "application/x-msgpack");
        assert_eq!(JsonFormat.content_type(), "application/json");
    }
}
