#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod backplane;
pub mod error;
pub mod format;
pub mod provider;

pub use backplane::{Backplane, BackplaneMessage, BroadcastBackplane, Invalidation};
pub use error::{BackendError, BackendResult};
pub use format::{Format, FormatError, FormatExt, JsonFormat, MsgpackFormat};
pub use provider::{
    DeleteStatus, PersistentStorage, RawEntry, Storage, StorageProvider, SyncStorage,
};
