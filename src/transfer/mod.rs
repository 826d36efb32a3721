//! Data transfer into the cache.
//!
//! - [`transport`]: Network fetch (`Transport`, reqwest-backed `HttpTransport`)
//! - [`codec`]: Decode / encode / scale / round bitmaps (`ImageCodec`, `PngCodec`)

pub mod codec;
pub mod transport;
