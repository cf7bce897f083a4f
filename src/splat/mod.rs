//! Splat encodings and containers
//!
//! Two wire encodings coexist: a compact 16-byte form for paged
//! streaming and a 32-byte extended form for large or precise scenes.
//! Spherical harmonics are packed per coefficient with a shared
//! exponent. [`SplatStore`] exposes the uniform capability set the rest
//! of the engine consumes.

pub mod encode;
pub mod extended;
pub mod packed;
pub mod sh;
pub mod store;

pub use encode::SplatEncoding;
pub use extended::{ExtSplats, EXT_WORDS};
pub use packed::{PackedSplats, PACKED_WORDS};
pub use store::{ChunkSplats, PagedSplats, Splat, SplatStore};
