//! Demand-paged GPU splat cache
//!
//! A fixed pool of page-sized GPU slots, LRU-managed, filled by a
//! bounded pool of parallel fetchers and prioritized by the traverser's
//! touched-chunk list.

pub mod fetch;
pub mod pool;
pub mod splat_cache;

pub use fetch::{ChunkSource, FetchFuture, FetchPool, FetchedChunk};
pub use pool::{AllocatedPage, ObjectId, PagePool};
pub use splat_cache::SplatCache;
