//! Local cache tiers for fetched images.
//!
//! - [`MemoryCache`]: bounded LRU keyed by the raw identifier, sized by a
//!   caller-supplied measure.
//! - [`DiskCache`]: journal-backed blob store keyed by [`derive_key`], which
//!   survives restarts and crashes.

pub mod disk;
pub mod hash;
mod journal;
pub mod memory;

pub use crate::Error;

pub use disk::{DiskCache, Editor, Snapshot};
pub use hash::{KEY_LEN, derive_key};
pub use journal::validate_key;
pub use memory::{MemoryCache, MemoryCacheBuilder, MemoryStats};
