//! Render driver and display-set plumbing

pub mod accumulator;
pub mod driver;
pub mod ordering;
pub mod pools;

pub use accumulator::{Accumulator, AccumulatorSet, ComposeOutcome, ObjectSpan};
pub use driver::{EngineOverride, FrameInput, ObjectSource, RenderDriver, SceneObject};
pub use ordering::OrderingTable;
pub use pools::{CpuSplatPools, SplatPools, WgpuSplatPools};
