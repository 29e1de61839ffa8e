//! Fetch pipeline for pixcache.
//!
//! This crate wires the cache tiers from `pixcache-core` to the network:
//! a bounded pool of HTTP fetches, an opaque decode/encode seam, and a
//! channel that delivers tagged results back to the consumer.

pub mod codec;
pub mod coordinator;
pub mod fetch;
pub mod router;

#[cfg(feature = "image")]
pub use codec::ImageCodec;
pub use codec::{BytesCodec, Codec};
pub use coordinator::{CacheOptions, CacheStats, ImageCache, Lookup};
pub use fetch::{FetchConfig, Fetcher, HttpFetcher};
pub use router::{Deliveries, Delivery, Router};
