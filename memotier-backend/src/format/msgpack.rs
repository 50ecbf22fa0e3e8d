//! MessagePack format implementation.

use memotier_core::Raw;
use serde::ser::Error as _;

use super::{DeserializeFn, Format};

/// Compact MessagePack serialization. The default value format.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgpackFormat;

impl Format for MsgpackFormat {
    fn content_type(&self) -> &'static str {
        "application/x-msgpack"
    }

    fn serialize_erased(
        &self,
        value: &dyn erased_serde::Serialize,
    ) -> Result<Raw, erased_serde::Error> {
        let mut buf = Vec::new();
        // Named struct encoding keeps payloads readable by other consumers
        // of the store and tolerant of field reordering.
        let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
        erased_serde::serialize(value, &mut serializer).map_err(erased_serde::Error::custom)?;
        Ok(Raw::from(buf))
    }

    fn deserialize_erased(
        &self,
        bytes: &[u8],
        visit: &mut DeserializeFn<'_>,
    ) -> Result<(), erased_serde::Error> {
        let mut deserializer = rmp_serde::Deserializer::new(bytes);
        let mut erased = <dyn erased_serde::Deserializer>::erase(&mut deserializer);
        visit(&mut erased)
    }
}
