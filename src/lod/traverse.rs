//! Multi-tree LoD traversal
//!
//! Selects, across all visible instances jointly, the cut through the
//! forest of LoD trees that maximizes the minimum projected splat size
//! under a global splat budget. A single max-heap frontier keyed by
//! projected pixel scale expands nodes in strictly decreasing order, so
//! the same threshold normalizes detail across every object; the
//! smallest scale the frontier ever reached is returned as the
//! threshold for warm starting the next frame.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ahash::AHashSet;
use glam::{Mat4, Vec3A};
use ordered_float::OrderedFloat;

use crate::core::{Error, Result};
use crate::lod::node::{index_offset, index_page, paged_index, LodNode, NO_PAGE};
use crate::lod::registry::{TreeId, TreeRegistry, TreeView};

/// Rows of the per-instance index tables; output lengths round up to a
/// multiple of this so GPU textures never reallocate per splat.
pub const INDEX_TABLE_ROW: usize = 16_384;

/// Global traversal parameters for one frame.
#[derive(Clone, Debug)]
pub struct TraverseParams {
    /// Global splat budget across all instances.
    pub max_splats: usize,
    /// Smallest acceptable projected splat radius in normalized pixel
    /// units; zero disables the floor.
    pub pixel_scale_limit: f32,
    /// Threshold achieved last frame, accepted as a warm start. The
    /// frontier expansion order makes the cut independent of this seed;
    /// it is validated and carried for protocol symmetry.
    pub last_pixel_limit: Option<f32>,
}

/// One rendered instance of a LoD tree.
#[derive(Clone, Debug)]
pub struct TraverseInstance {
    pub tree: TreeId,
    /// Page holding the root chunk, when known; resolved through the
    /// tree's residency map otherwise.
    pub root_page: Option<u32>,
    /// View-to-object transform (camera axes in object space).
    pub view_to_object: Mat4,
    pub lod_scale: f32,
    pub behind_foveate: f32,
    /// Full-resolution cone angle, degrees; 0 disables.
    pub cone_fov0: f32,
    /// Outer cone angle, degrees; 0 disables.
    pub cone_fov: f32,
    pub cone_foveate: f32,
}

impl TraverseInstance {
    pub fn new(tree: TreeId, view_to_object: Mat4) -> Self {
        Self {
            tree,
            root_page: None,
            view_to_object,
            lod_scale: 1.0,
            behind_foveate: 1.0,
            cone_fov0: 0.0,
            cone_fov: 0.0,
            cone_foveate: 1.0,
        }
    }
}

/// Selection for one instance: paged splat indices, sorted ascending,
/// in a buffer padded to a multiple of [`INDEX_TABLE_ROW`].
#[derive(Clone, Debug)]
pub struct InstanceSelection {
    pub tree: TreeId,
    pub num_splats: u32,
    pub indices: Vec<u32>,
}

/// Result of one traversal.
#[derive(Clone, Debug)]
pub struct TraverseOutput {
    pub instances: Vec<InstanceSelection>,
    /// `(tree, chunk)` referenced this frame, most important first.
    pub touched: Vec<(TreeId, u32)>,
    /// Achieved threshold, for warm starting.
    pub pixel_limit: f32,
}

/// Per-instance projection context.
struct InstanceCtx<'a> {
    tree: TreeId,
    view: TreeView<'a>,
    origin: Vec3A,
    forward: Vec3A,
    lod_scale: f32,
    behind_foveate: f32,
    cone_foveate: f32,
    cone_dot0: f32,
    cone_dot: f32,
    root_page: u32,
}

/// Foveation-weighted projected pixel scale of one node.
///
/// Piecewise linear in the view-axis cosine: 1 inside the inner cone,
/// falling to `cone_foveate` at the outer cone and to `behind_foveate`
/// at 90 degrees and beyond.
fn pixel_scale(node: &LodNode, ctx: &InstanceCtx) -> f32 {
    let delta = node.center() - ctx.origin;
    let distance = delta.length().max(1.0e-6);
    let inv_distance = 1.0 / distance;
    let scale = node.size() * inv_distance * ctx.lod_scale;

    let forward_dot = delta.dot(ctx.forward);
    let foveate = if forward_dot <= 0.0 {
        ctx.behind_foveate
    } else {
        let dot = forward_dot * inv_distance;
        if dot >= ctx.cone_dot0 {
            1.0
        } else if dot >= ctx.cone_dot {
            let t = (dot - ctx.cone_dot) / (ctx.cone_dot0 - ctx.cone_dot);
            ctx.cone_foveate + (1.0 - ctx.cone_foveate) * t
        } else {
            let t = dot / ctx.cone_dot;
            ctx.behind_foveate + (ctx.cone_foveate - ctx.behind_foveate) * t
        }
    };
    foveate * scale
}

fn resident_page(view: &TreeView, chunk: u32) -> Option<u32> {
    match view.chunk_to_page.get(chunk as usize) {
        Some(&page) if page != NO_PAGE => Some(page),
        _ => None,
    }
}

impl TreeRegistry {
    /// Traverse all instance trees jointly under a global splat budget.
    pub fn traverse(
        &self,
        params: &TraverseParams,
        instances: &[TraverseInstance],
    ) -> Result<TraverseOutput> {
        if let Some(last) = params.last_pixel_limit {
            if !(last >= 0.0) {
                return Err(Error::InvalidArgument(format!(
                    "last_pixel_limit ({last}) must be non-negative"
                )));
            }
        }

        let mut contexts = Vec::with_capacity(instances.len());
        for (inst_index, instance) in instances.iter().enumerate() {
            let m = instance.view_to_object;
            if m.to_cols_array().iter().any(|v| !v.is_finite()) {
                return Err(Error::DegenerateProjection(inst_index));
            }
            let view = self.tree_view(instance.tree)?;
            contexts.push(InstanceCtx {
                tree: instance.tree,
                view,
                origin: Vec3A::from(m.w_axis.truncate()),
                forward: -Vec3A::from(m.z_axis.truncate()).normalize_or_zero(),
                lod_scale: instance.lod_scale,
                behind_foveate: instance.behind_foveate,
                cone_foveate: instance.cone_foveate,
                cone_dot0: cone_cos(instance.cone_fov0),
                cone_dot: cone_cos(instance.cone_fov),
                root_page: instance.root_page.unwrap_or(NO_PAGE),
            });
        }

        let floor = params.pixel_scale_limit;
        let mut frontier: BinaryHeap<(OrderedFloat<f32>, Reverse<u32>, Reverse<u32>)> =
            BinaryHeap::new();
        let mut children: Vec<(f32, u32)> = Vec::new();
        let mut output: Vec<(u32, u32)> = Vec::new();
        let mut num_splats = 0usize;
        let mut min_scale = f32::INFINITY;

        let mut touched: Vec<(TreeId, u32)> = Vec::new();
        let mut touched_set: AHashSet<(TreeId, u32)> = AHashSet::new();
        let mut touch = |tree: TreeId, chunk: u32, touched: &mut Vec<(TreeId, u32)>| {
            if touched_set.insert((tree, chunk)) {
                touched.push((tree, chunk));
            }
        };

        // Seed every instance's root. An instance whose root chunk is not
        // resident contributes nothing until it arrives.
        for (inst_index, ctx) in contexts.iter().enumerate() {
            touch(ctx.tree, 0, &mut touched);
            let root_page = if ctx.root_page != NO_PAGE {
                Some(ctx.root_page)
            } else {
                resident_page(&ctx.view, 0)
            };
            let Some(root_page) = root_page else { continue };
            let root = paged_index(root_page, 0);
            let Some(node) = ctx.view.nodes.get(root as usize) else { continue };

            let scale = pixel_scale(node, ctx);
            if floor > 0.0 && scale <= floor {
                continue;
            }
            frontier.push((OrderedFloat(scale), Reverse(inst_index as u32), Reverse(root)));
            num_splats += 1;
        }

        while let Some(&(OrderedFloat(scale), Reverse(inst_index), Reverse(paged))) =
            frontier.peek()
        {
            min_scale = min_scale.min(scale);

            let ctx = &contexts[inst_index as usize];
            let node = ctx.view.nodes[paged as usize];
            if node.is_leaf() {
                frontier.pop();
                output.push((inst_index, paged));
                continue;
            }

            let child_count = node.child_count as u32;
            let new_num_splats = num_splats - 1 + child_count as usize;
            if new_num_splats > params.max_splats {
                break;
            }

            frontier.pop();

            let first_chunk = index_page(node.child_start);
            let last_chunk = index_page(node.child_start + child_count - 1);
            touch(ctx.tree, first_chunk, &mut touched);
            if last_chunk != first_chunk {
                touch(ctx.tree, last_chunk, &mut touched);
            }

            // Paged gating: children in a non-resident chunk cannot be
            // selected, so the parent stays in the cut.
            if resident_page(&ctx.view, first_chunk).is_none()
                || resident_page(&ctx.view, last_chunk).is_none()
            {
                output.push((inst_index, paged));
                continue;
            }

            // Pixel-scale floor: refinement stops before producing any
            // sub-threshold splat; the parent stays in the cut and the
            // budget under-fills.
            children.clear();
            let mut expand = true;
            for child in node.child_start..node.child_start + child_count {
                let page = resident_page(&ctx.view, index_page(child)).expect("checked resident");
                let child_paged = paged_index(page, index_offset(child));
                let Some(child_node) = ctx.view.nodes.get(child_paged as usize) else {
                    expand = false;
                    break;
                };
                let scale = pixel_scale(child_node, ctx);
                if floor > 0.0 && scale <= floor {
                    expand = false;
                    break;
                }
                children.push((scale, child_paged));
            }
            if !expand {
                output.push((inst_index, paged));
                continue;
            }

            num_splats = new_num_splats;
            for (scale, child_paged) in children.drain(..) {
                frontier.push((OrderedFloat(scale), Reverse(inst_index), Reverse(child_paged)));
            }
        }

        for (OrderedFloat(scale), Reverse(inst_index), Reverse(paged)) in frontier.drain() {
            min_scale = min_scale.min(scale);
            output.push((inst_index, paged));
        }

        let mut selections: Vec<InstanceSelection> = instances
            .iter()
            .map(|instance| InstanceSelection {
                tree: instance.tree,
                num_splats: 0,
                indices: Vec::new(),
            })
            .collect();
        for &(inst_index, paged) in &output {
            selections[inst_index as usize].indices.push(paged);
        }
        for selection in &mut selections {
            selection.indices.sort_unstable();
            selection.num_splats = selection.indices.len() as u32;
            let capacity = selection.indices.len().div_ceil(INDEX_TABLE_ROW) * INDEX_TABLE_ROW;
            selection.indices.resize(capacity, 0);
        }

        Ok(TraverseOutput {
            instances: selections,
            touched,
            pixel_limit: min_scale,
        })
    }
}

fn cone_cos(fov_degrees: f32) -> f32 {
    if fov_degrees > 0.0 {
        (0.5 * fov_degrees).to_radians().cos()
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lod::node::encode_nodes;

    /// Balanced binary tree of the given depth with sizes halving per
    /// level (root size `4.0`), laid out root-first, level by level.
    fn balanced_tree(depth: u32) -> Vec<LodNode> {
        let mut nodes = Vec::new();
        let mut level_base = 0u32;
        for level in 0..=depth {
            let count = 1u32 << level;
            let child_base = level_base + count;
            for i in 0..count {
                let size = 4.0 / (1 << level) as f32;
                let spread = 0.5 / (1 << level) as f32;
                let x = (i as f32 - (count - 1) as f32 * 0.5) * spread;
                if level == depth {
                    nodes.push(LodNode::new(Vec3A::new(x, 0.0, 0.0), size, 0, 0));
                } else {
                    nodes.push(LodNode::new(Vec3A::new(x, 0.0, 0.0), size, child_base + i * 2, 2));
                }
            }
            level_base = child_base;
        }
        nodes
    }

    /// Root with `fanout` children, each carrying `leaves` leaf splats.
    fn two_level_tree(fanout: u16, leaves: u16) -> Vec<LodNode> {
        let mut nodes = vec![LodNode::new(Vec3A::ZERO, 4.0, 1, fanout)];
        let leaf_base = 1 + fanout as u32;
        for child in 0..fanout as u32 {
            nodes.push(LodNode::new(
                Vec3A::new(child as f32 * 0.25, 0.0, 0.0),
                2.0,
                leaf_base + child * leaves as u32,
                leaves,
            ));
        }
        for leaf in 0..(fanout as u32 * leaves as u32) {
            nodes.push(LodNode::new(Vec3A::new(leaf as f32 * 0.05, 0.0, 0.0), 1.0, 0, 0));
        }
        nodes
    }

    fn camera_at(distance: f32) -> Mat4 {
        // Camera on +z looking toward the origin (view -z maps to -z)
        Mat4::from_translation(glam::Vec3::new(0.0, 0.0, distance))
    }

    fn uniform_instance(tree: TreeId, distance: f32) -> TraverseInstance {
        TraverseInstance::new(tree, camera_at(distance))
    }

    fn params(max_splats: usize) -> TraverseParams {
        TraverseParams { max_splats, pixel_scale_limit: 0.0, last_pixel_limit: None }
    }

    #[test]
    fn test_single_tree_budget_two_selects_level_one() {
        // S1: 8 leaves, depth 2, budget 2 -> exactly the root's children
        let mut registry = TreeRegistry::new();
        let nodes = two_level_tree(2, 4);
        let tree = registry.init_tree(nodes.len() as u32, &encode_nodes(&nodes)).unwrap();

        let out = registry
            .traverse(&params(2), &[uniform_instance(tree, 10.0)])
            .unwrap();

        assert_eq!(out.instances[0].num_splats, 2);
        assert_eq!(&out.instances[0].indices[..2], &[1, 2]);
        assert_eq!(out.instances[0].indices.len(), INDEX_TABLE_ROW);
    }

    #[test]
    fn test_two_objects_closer_gets_more() {
        // S2: identical trees, one 2x closer, budget 6 -> 4 / 2 split
        let mut registry = TreeRegistry::new();
        let nodes = balanced_tree(2);
        let words = encode_nodes(&nodes);
        let near = registry.init_tree(nodes.len() as u32, &words).unwrap();
        let far = registry.init_tree(nodes.len() as u32, &words).unwrap();

        let out = registry
            .traverse(
                &params(6),
                &[uniform_instance(near, 10.0), uniform_instance(far, 20.0)],
            )
            .unwrap();

        let near_count = out.instances[0].num_splats as i32;
        let far_count = out.instances[1].num_splats as i32;
        assert!(near_count + far_count <= 6);
        assert!((near_count - 4).abs() <= 1, "near got {near_count}");
        assert!((far_count - 2).abs() <= 1, "far got {far_count}");
    }

    #[test]
    fn test_missing_root_contributes_nothing() {
        // S3: A resident, B's chunk 0 absent -> A fills the budget, B
        // contributes zero and its root chunk heads the touched list.
        let mut registry = TreeRegistry::new();
        let nodes = two_level_tree(2, 4);
        let a = registry.init_tree(nodes.len() as u32, &encode_nodes(&nodes)).unwrap();
        let b = registry.new_tree(crate::core::PAGE_SIZE as usize);

        let out = registry
            .traverse(
                &params(10),
                &[uniform_instance(b, 5.0), uniform_instance(a, 10.0)],
            )
            .unwrap();

        assert_eq!(out.instances[0].num_splats, 0);
        assert_eq!(out.instances[1].num_splats, 8);
        assert_eq!(out.touched[0], (b, 0));
    }

    #[test]
    fn test_budget_bound_holds() {
        let mut registry = TreeRegistry::new();
        let nodes = balanced_tree(4);
        let words = encode_nodes(&nodes);
        let trees: Vec<_> = (0..3)
            .map(|_| registry.init_tree(nodes.len() as u32, &words).unwrap())
            .collect();

        for budget in [1usize, 3, 7, 20, 100] {
            let instances: Vec<_> = trees
                .iter()
                .enumerate()
                .map(|(i, &tree)| uniform_instance(tree, 5.0 + i as f32 * 3.0))
                .collect();
            let out = registry.traverse(&params(budget), &instances).unwrap();
            let total: u32 = out.instances.iter().map(|s| s.num_splats).sum();
            assert!(total as usize <= budget, "budget {budget} got {total}");
        }
    }

    #[test]
    fn test_cut_respects_threshold() {
        let mut registry = TreeRegistry::new();
        let nodes = balanced_tree(3);
        let tree = registry.init_tree(nodes.len() as u32, &encode_nodes(&nodes)).unwrap();
        let instance = uniform_instance(tree, 10.0);

        let out = registry.traverse(&params(5), &[instance.clone()]).unwrap();
        let tau = out.pixel_limit;
        assert!(tau.is_finite());

        let view = registry.tree_view(tree).unwrap();
        let ctx_scale = |index: u32| {
            let m = instance.view_to_object;
            let origin = Vec3A::from(m.w_axis.truncate());
            let node = &view.nodes[index as usize];
            node.size() / (node.center() - origin).length().max(1.0e-6)
        };

        // Each selected node projects at least tau; each selected
        // non-root node's parent projects above tau (it was expanded).
        let selected: Vec<u32> =
            out.instances[0].indices[..out.instances[0].num_splats as usize].to_vec();
        for &index in &selected {
            assert!(ctx_scale(index) >= tau - 1.0e-6);
            if index != 0 {
                let parent = (0..nodes.len() as u32)
                    .find(|&p| {
                        let n = &view.nodes[p as usize];
                        !n.is_leaf()
                            && index >= n.child_start
                            && index < n.child_start + n.child_count as u32
                    })
                    .expect("parent exists");
                assert!(ctx_scale(parent) > tau - 1.0e-6);
            }
        }
    }

    #[test]
    fn test_warm_start_yields_same_cut() {
        let mut registry = TreeRegistry::new();
        let nodes = balanced_tree(3);
        let words = encode_nodes(&nodes);
        let a = registry.init_tree(nodes.len() as u32, &words).unwrap();
        let b = registry.init_tree(nodes.len() as u32, &words).unwrap();
        let instances = [uniform_instance(a, 8.0), uniform_instance(b, 13.0)];

        let cold = registry.traverse(&params(9), &instances).unwrap();
        let warm = registry
            .traverse(
                &TraverseParams {
                    max_splats: 9,
                    pixel_scale_limit: 0.0,
                    last_pixel_limit: Some(cold.pixel_limit),
                },
                &instances,
            )
            .unwrap();

        for (c, w) in cold.instances.iter().zip(warm.instances.iter()) {
            assert_eq!(c.num_splats, w.num_splats);
            assert_eq!(c.indices, w.indices);
        }
        assert_eq!(cold.pixel_limit, warm.pixel_limit);
    }

    #[test]
    fn test_pixel_floor_underfills_budget() {
        let mut registry = TreeRegistry::new();
        let nodes = balanced_tree(3);
        let tree = registry.init_tree(nodes.len() as u32, &encode_nodes(&nodes)).unwrap();

        // Floor above the leaf scale (leaves: size 0.5 at distance 10)
        let out = registry
            .traverse(
                &TraverseParams {
                    max_splats: 100,
                    pixel_scale_limit: 0.09,
                    last_pixel_limit: None,
                },
                &[uniform_instance(tree, 10.0)],
            )
            .unwrap();

        let selected = out.instances[0].num_splats as usize;
        assert_eq!(selected, 4, "refinement stops at the level-2 nodes");
        // Nothing selected projects below the floor
        let view = registry.tree_view(tree).unwrap();
        for &index in &out.instances[0].indices[..selected] {
            let node = &view.nodes[index as usize];
            let scale = node.size() / (node.center() - Vec3A::new(0.0, 0.0, 10.0)).length();
            assert!(scale > 0.09);
        }
    }

    #[test]
    fn test_degenerate_matrix_rejected() {
        let mut registry = TreeRegistry::new();
        let nodes = two_level_tree(2, 2);
        let tree = registry.init_tree(nodes.len() as u32, &encode_nodes(&nodes)).unwrap();
        let mut instance = uniform_instance(tree, 10.0);
        instance.view_to_object = Mat4::from_cols_array(&[f32::NAN; 16]);
        assert!(matches!(
            registry.traverse(&params(4), &[instance]),
            Err(Error::DegenerateProjection(0))
        ));
    }

    #[test]
    fn test_behind_foveation_reduces_detail() {
        let mut registry = TreeRegistry::new();
        let nodes = balanced_tree(3);
        let words = encode_nodes(&nodes);
        let front = registry.init_tree(nodes.len() as u32, &words).unwrap();
        let behind = registry.init_tree(nodes.len() as u32, &words).unwrap();

        let mut front_instance = uniform_instance(front, 10.0);
        front_instance.behind_foveate = 0.1;
        // Same distance but behind the camera (+z side of the origin)
        let mut behind_instance = TraverseInstance::new(behind, camera_at(-10.0));
        behind_instance.behind_foveate = 0.1;

        let out = registry
            .traverse(&params(10), &[front_instance, behind_instance])
            .unwrap();
        assert!(out.instances[0].num_splats > out.instances[1].num_splats);
    }
}
