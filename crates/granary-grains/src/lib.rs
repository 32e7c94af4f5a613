//! granary-grains — persisted state for grains.
//!
//! Each grain owns one entry addressed by its [`GrainKey`]. Writes and
//! clears carry the [`ETag`] the caller last observed; the store applies
//! them only if that is still the stored eTag, and reports a conflict
//! otherwise. Conflicts are never retried or merged here.

pub mod error;
pub mod key;
pub mod store;

pub use error::{GrainResult, GrainStorageError};
pub use key::{ETag, GrainKey};
pub use store::{GrainState, GrainStateStore};
