//! JSON format implementation.

use memotier_core::Raw;
use serde::ser::Error as _;

use super::{DeserializeFn, Format};

/// Self-describing JSON serialization.
///
/// Larger and slower than MessagePack but human-readable; useful when
/// cached payloads need to be inspected directly in the backing store.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonFormat;

impl Format for JsonFormat {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize_erased(
        &self,
        value: &dyn erased_serde::Serialize,
    ) -> Result<Raw, erased_serde::Error> {
        let mut buf = Vec::new();
        let mut serializer = serde_json::Serializer::new(&mut buf);
        erased_serde::serialize(value, &mut serializer).map_err(erased_serde::Error::custom)?;
        Ok(Raw::from(buf))
    }

    fn deserialize_erased(
        &self,
        bytes: &[u8],
        visit: &mut DeserializeFn<'_>,
    ) -> Result<(), erased_serde::Error> {
        let mut deserializer = serde_json::Deserializer::from_slice(bytes);
        let mut erased = <dyn erased_serde::Deserializer>::erase(&mut deserializer);
        visit(&mut erased)
    }
}
