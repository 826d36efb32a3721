//! image-cache-tier: admission-controlled image fetching over a two-tier cache.
//!
//! A request for a URL is answered from one of three places, fastest first:
//!   memory LRU (hot) → disk LRU (warm) → network fetch (cold)
//!
//! Network fetches are wrapped in cancellable tasks, queued behind an admission
//! gate that bounds how many run at once, and their results are delivered on a
//! single ordered callback context.

pub mod cache;
pub mod config;
pub mod executor;
pub mod loader;
pub mod request;
pub mod transfer;

pub use config::Config;
pub use loader::{Consumer, ImageLoader, ImageSink, LoadOutcome, SizeHint, Variant};
pub use transfer::codec::Bitmap;
