//! Image caching.
//!
//! - [`key`]: Key validation, cache keys per rendition, hashed disk keys
//! - [`memory`]: Cost-bounded memory LRU
//! - [`journal`]: Append-only index journal for the disk tier
//! - [`disk`]: Size-bounded disk LRU with edit / commit / abort writes
//! - [`tiered`]: `ImageCache`, the two tiers composed read-through

pub mod disk;
pub mod journal;
pub mod key;
pub mod memory;
pub mod tiered;

pub use tiered::{CacheStats, ImageCache};
