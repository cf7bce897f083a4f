//! splatstream - level-of-detail streaming engine for 3D Gaussian
//! splat scenes
//!
//! Given splat objects organized into hierarchical downsampling trees,
//! the engine selects, streams and presents a bounded working set of
//! splats for real-time rendering from a moving viewpoint:
//!
//! - a multi-tree traversal cuts all visible trees jointly against a
//!   global splat budget, weighted by foveation ([`lod`]);
//! - a demand-paged, LRU-managed GPU splat cache streams container
//!   chunks through a bounded fetcher pool ([`cache`], [`format`]);
//! - an asynchronous radix sort produces back-to-front orderings from
//!   depth readbacks ([`sort`]);
//! - a render driver composes versioned display sets and swaps them
//!   atomically with their orderings ([`render`]).

pub mod cache;
pub mod core;
pub mod format;
pub mod lod;
pub mod render;
pub mod sort;
pub mod splat;

pub use crate::core::{EngineConfig, Error, Result};
pub use crate::render::{FrameInput, ObjectSource, RenderDriver, SceneObject};
