//! Hierarchical level-of-detail trees
//!
//! Trees whose leaves are source splats and whose interior nodes are
//! aggregated splats. The registry owns tree payloads behind integer
//! handles; the traverser cuts the forest against a global splat budget.

pub mod node;
pub mod registry;
pub mod traverse;

pub use node::{LodNode, NODE_WORDS, NO_PAGE};
pub use registry::{TreeId, TreeRegistry, TreeUpdate};
pub use traverse::{
    InstanceSelection, TraverseInstance, TraverseOutput, TraverseParams, INDEX_TABLE_ROW,
};
