#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod arg;
pub mod health;
pub mod key;
pub mod keygen;
pub mod policy;
pub mod stats;
pub mod value;

pub use arg::CacheArg;
pub use health::HealthStatus;
pub use key::{CacheKey, Tag};
pub use keygen::{FastKeyGenerator, KeyGenerator, ReadableKeyGenerator};
pub use policy::{
    CachePolicy, LockBehavior, LockOptions, PolicyContribution, PolicyFields, PolicyFragment,
    PolicyResolution, StampedeOptions,
};
#[doc(hidden)]
pub use smol_str::SmolStr;
pub use stats::LayerStats;
pub use value::{CacheMeta, CacheValue};

/// Raw byte data type used for serialized cache values.
/// Using `Bytes` provides cheap zero-copy cloning via reference counting.
pub type Raw = bytes::Bytes;
