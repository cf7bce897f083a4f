//! Per-frame render driver
//!
//! The single orchestrator of the engine: owns the registry, the cache,
//! the accumulators and the sort worker, and serially mutates all of
//! them once per frame. Traversal, fetching and sorting all complete on
//! other threads; their results are drained here, so the display set
//! the rasterizer samples never changes mid-frame and only swaps
//! together with an ordering sorted against it.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use glam::{Mat4, Vec3A};

use crate::cache::{ChunkSource, ObjectId, SplatCache};
use crate::core::{EngineConfig, Error, Result};
use crate::lod::{InstanceSelection, TraverseInstance, TraverseParams, TreeId, TreeRegistry};
use crate::render::accumulator::AccumulatorSet;
use crate::render::ordering::OrderingTable;
use crate::render::pools::SplatPools;
use crate::sort::{SortRequest, SortWorker};

/// View movement below these thresholds does not retrigger LoD work.
const EPS_POS: f32 = 1.0e-4;
const EPS_DIR: f32 = 1.0e-5;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ENGINE_OVERRIDE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Lexically scoped engine override: while the guard lives, shader
/// binding resolves pools through the named engine instead of the
/// default. Set before rasterization, cleared on drop.
pub struct EngineOverride {
    prev: Option<u64>,
}

impl EngineOverride {
    pub fn scope(engine: u64) -> Self {
        let prev = ENGINE_OVERRIDE.with(|cell| cell.replace(Some(engine)));
        Self { prev }
    }

    /// Engine id the rasterizer should bind against, if overridden.
    pub fn current() -> Option<u64> {
        ENGINE_OVERRIDE.with(|cell| cell.get())
    }
}

impl Drop for EngineOverride {
    fn drop(&mut self) {
        let prev = self.prev;
        ENGINE_OVERRIDE.with(|cell| cell.set(prev));
    }
}

/// Where an object's splat data comes from.
#[derive(Clone, Debug)]
pub enum ObjectSource {
    /// Self-contained LoD tree blob, ingested on first encounter
    Tree { num_splats: u32, words: Arc<Vec<u32>> },
    /// Streamed container, demand-paged through the cache
    Paged { num_chunks: u32 },
}

/// One visible splat object this frame.
#[derive(Clone, Debug)]
pub struct SceneObject {
    pub object: ObjectId,
    pub view_to_object: Mat4,
    /// Viewer distance, used to order root-chunk bootstrap
    pub distance: f32,
    pub lod_scale: f32,
    pub source: ObjectSource,
}

/// Per-frame input.
#[derive(Clone, Debug)]
pub struct FrameInput {
    pub view_position: Vec3A,
    pub view_direction: Vec3A,
    pub fov_y_degrees: f32,
    /// Render target height in pixels; 0 disables the pixel floor
    pub render_height: u32,
    pub objects: Vec<SceneObject>,
}

struct ObjectLod {
    tree: TreeId,
    paged: bool,
    last_touch: Instant,
}

/// The engine: per-frame orchestration of traversal, caching, sorting
/// and display-set swaps.
pub struct RenderDriver {
    engine_id: u64,
    config: EngineConfig,
    registry: TreeRegistry,
    cache: SplatCache,
    sort: SortWorker,
    accumulators: AccumulatorSet,
    ordering: OrderingTable,
    /// Primary tree whose payload is the pooled node array; every paged
    /// object holds a shared handle onto it
    pool_tree: TreeId,
    lod_ids: AHashMap<ObjectId, ObjectLod>,
    selections: AHashMap<ObjectId, InstanceSelection>,
    last_view: Option<(Vec3A, Vec3A)>,
    last_objects: Vec<ObjectId>,
    last_pixel_limit: Option<f32>,
    /// Composition version a depth readback is in flight for
    readback_pending: Option<u64>,
    /// Composition version the sort worker is busy with
    sort_inflight: Option<u64>,
    disposed: bool,
}

impl RenderDriver {
    pub fn new(config: EngineConfig, source: Arc<dyn ChunkSource>) -> Result<Self> {
        config.validate()?;
        let mut registry = TreeRegistry::new();
        let pool_tree = registry.new_tree(config.max_paged_splats as usize);
        let cache = SplatCache::new(config.page_count(), config.num_fetchers, config.max_sh, source);
        let sort = SortWorker::new(Duration::from_millis(config.min_sort_interval_ms));

        Ok(Self {
            engine_id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            registry,
            cache,
            sort,
            accumulators: AccumulatorSet::new(),
            ordering: OrderingTable::default(),
            pool_tree,
            lod_ids: AHashMap::new(),
            selections: AHashMap::new(),
            last_view: None,
            last_objects: Vec::new(),
            last_pixel_limit: None,
            readback_pending: None,
            sort_inflight: None,
            disposed: false,
        })
    }

    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    pub fn registry(&self) -> &TreeRegistry {
        &self.registry
    }

    /// Last selection for an object, if any (kept across failed
    /// traversals as the last known good).
    pub fn selection(&self, object: ObjectId) -> Option<&InstanceSelection> {
        self.selections.get(&object)
    }

    /// Currently displayed composition, if any.
    pub fn displayed_version(&self) -> Option<u64> {
        self.accumulators.displayed().map(|a| a.composition_version)
    }

    pub fn displayed_count(&self) -> u32 {
        self.accumulators.displayed().map_or(0, |a| a.active_count)
    }

    /// Tear down the engine. Later frames fail with `Disposed`.
    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    /// Run one frame of the engine.
    pub fn frame(&mut self, input: &FrameInput, pools: &mut dyn SplatPools) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }

        // Housekeeping runs even on gated frames: fetch completions,
        // page promotion, registry updates and finished sorts.
        self.cache.poll_fetched();
        self.cache.promote(pools);
        let updates = self.cache.drain_updates();
        let residency_changed = !updates.is_empty();
        for update in updates {
            match self.registry.update_trees(std::slice::from_ref(&update)) {
                Ok(()) => {}
                // A blob can arrive for a tree disposed in the interim
                Err(Error::UnknownTree(tree)) => {
                    log::debug!("dropping update for disposed tree {tree}")
                }
                Err(e) => return Err(e),
            }
        }
        self.finish_sorts(pools);

        let objects_now: Vec<ObjectId> = input.objects.iter().map(|o| o.object).collect();
        let view_changed = match self.last_view {
            None => true,
            Some((position, direction)) => {
                (position - input.view_position).length() > EPS_POS
                    || direction.dot(input.view_direction) < 1.0 - EPS_DIR
            }
        };
        let composition_changed = objects_now != self.last_objects;

        if !view_changed && !composition_changed && !residency_changed {
            self.drive_sort(pools)?;
            self.evict_idle(&objects_now);
            return Ok(());
        }

        if self.config.enable_lod && self.config.enable_drive_lod {
            self.ensure_trees(input);
            self.drive_lod(input, pools);
        }

        // Compose the display set from the current selections, in the
        // scene's draw order. An unchanged mapping swaps in directly;
        // otherwise the composition waits for its sort.
        let sources: Vec<(ObjectId, u32)> = input
            .objects
            .iter()
            .filter_map(|scene_object| {
                let selection = self.selections.get(&scene_object.object)?;
                (selection.num_splats > 0).then_some((scene_object.object, selection.num_splats))
            })
            .collect();
        self.accumulators.compose(&sources);

        self.drive_sort(pools)?;
        self.evict_idle(&objects_now);

        self.last_view = Some((input.view_position, input.view_direction));
        self.last_objects = objects_now;
        Ok(())
    }

    /// Create registry trees and cache registrations for any visible
    /// object seen for the first time, and touch the rest.
    fn ensure_trees(&mut self, input: &FrameInput) {
        let now = Instant::now();
        for scene_object in &input.objects {
            if let Some(lod) = self.lod_ids.get_mut(&scene_object.object) {
                lod.last_touch = now;
                continue;
            }
            let entry = match &scene_object.source {
                ObjectSource::Tree { num_splats, words } => {
                    match self.registry.init_tree(*num_splats, words) {
                        Ok(tree) => ObjectLod { tree, paged: false, last_touch: now },
                        Err(e) => {
                            log::warn!("failed to ingest tree for object {}: {e}", scene_object.object);
                            continue;
                        }
                    }
                }
                ObjectSource::Paged { num_chunks } => {
                    let tree = self
                        .registry
                        .new_shared_tree(self.pool_tree)
                        .expect("pool tree is alive");
                    self.cache.register_object(scene_object.object, tree, *num_chunks);
                    ObjectLod { tree, paged: true, last_touch: now }
                }
            };
            self.lod_ids.insert(scene_object.object, entry);
        }
    }

    /// Traverse all visible instances, publish index tables, and feed
    /// the cache its priorities.
    fn drive_lod(&mut self, input: &FrameInput, pools: &mut dyn SplatPools) {
        let budget = self.config.splat_budget() as usize;
        let pixel_floor = if input.render_height > 0 {
            (0.5 * input.fov_y_degrees).to_radians().tan() * 2.0 / input.render_height as f32
                * self.config.lod_render_scale
        } else {
            0.0
        };

        let mut tree_to_object: AHashMap<TreeId, ObjectId> = AHashMap::new();
        let mut instances = Vec::new();
        let mut instance_objects = Vec::new();
        for scene_object in &input.objects {
            let Some(lod) = self.lod_ids.get(&scene_object.object) else { continue };
            tree_to_object.insert(lod.tree, scene_object.object);
            instances.push(TraverseInstance {
                tree: lod.tree,
                root_page: lod.paged.then(|| self.cache.root_page(scene_object.object)).flatten(),
                view_to_object: scene_object.view_to_object,
                lod_scale: scene_object.lod_scale,
                behind_foveate: self.config.behind_foveate,
                cone_fov0: self.config.cone_fov0,
                cone_fov: self.config.cone_fov,
                cone_foveate: self.config.cone_foveate,
            });
            instance_objects.push(scene_object.object);
        }

        let params = TraverseParams {
            max_splats: budget,
            pixel_scale_limit: pixel_floor,
            last_pixel_limit: self.last_pixel_limit,
        };
        let output = match self.registry.traverse(&params, &instances) {
            Ok(output) => output,
            Err(e) => {
                // Keep last known good selections; render degrades to
                // the previous frame's cut
                log::warn!("traversal failed: {e}");
                return;
            }
        };
        if output.pixel_limit.is_finite() {
            self.last_pixel_limit = Some(output.pixel_limit);
        }

        for (object, selection) in instance_objects.iter().zip(output.instances) {
            pools.write_index_table(*object, &selection.indices);
            self.selections.insert(*object, selection);
        }

        let touched: Vec<(ObjectId, u32)> = output
            .touched
            .iter()
            .filter_map(|&(tree, chunk)| Some((*tree_to_object.get(&tree)?, chunk)))
            .collect();
        let distances: Vec<(ObjectId, f32)> = input
            .objects
            .iter()
            .filter(|o| matches!(o.source, ObjectSource::Paged { .. }))
            .map(|o| (o.object, o.distance))
            .collect();
        self.cache.submit_priorities(&touched, &distances);
        self.cache.kick_fetchers();
    }

    /// Step the sort pipeline: request and collect the depth readback
    /// for the oldest pending composition, then hand it to the worker.
    fn drive_sort(&mut self, pools: &mut dyn SplatPools) -> Result<()> {
        let Some(awaiting) = self.accumulators.awaiting_sort() else {
            return Ok(());
        };
        let version = awaiting.composition_version;
        let active = awaiting.active_count;

        if active == 0 {
            // Nothing to sort; swap in directly
            self.ordering.update(&[], 0, version);
            pools.write_ordering(self.ordering.as_slice(), version);
            self.accumulators.promote();
            self.readback_pending = None;
            return Ok(());
        }

        if self.sort_inflight == Some(version) {
            return Ok(());
        }
        if self.readback_pending != Some(version) {
            pools.request_depth_readback(active);
            self.readback_pending = Some(version);
            return Ok(());
        }

        if let Some(depth) = pools.poll_depth_readback() {
            self.sort.submit(SortRequest {
                num_splats: active as usize,
                readback: depth,
                version,
            })?;
            self.sort_inflight = Some(version);
            self.readback_pending = None;
        }
        Ok(())
    }

    /// Install completed sorts: the ordering table and the display swap
    /// land together, so the rasterizer never samples a displayed set
    /// against a foreign ordering.
    fn finish_sorts(&mut self, pools: &mut dyn SplatPools) {
        for result in self.sort.poll_completed() {
            if self.sort_inflight == Some(result.version) {
                self.sort_inflight = None;
            }
            let Some(awaiting) = self.accumulators.awaiting_sort() else {
                continue;
            };
            if result.version != awaiting.composition_version {
                // Superseded by a newer composition
                continue;
            }
            self.ordering.update(&result.ordering, result.active, result.version);
            pools.write_ordering(self.ordering.as_slice(), result.version);
            self.accumulators.promote();
        }
    }

    /// Dispose the single oldest tree that has been idle past the
    /// configured timeout. Objects visible this frame are never idle.
    fn evict_idle(&mut self, visible: &[ObjectId]) {
        let timeout = Duration::from_millis(self.config.dispose_timeout_ms);
        let now = Instant::now();
        let oldest = self
            .lod_ids
            .iter()
            .filter(|(object, lod)| {
                !visible.contains(object) && now.duration_since(lod.last_touch) >= timeout
            })
            .min_by_key(|(_, lod)| lod.last_touch)
            .map(|(&object, _)| object);

        if let Some(object) = oldest {
            let lod = self.lod_ids.remove(&object).expect("just found");
            if lod.paged {
                self.cache.remove_object(object);
            }
            if let Err(e) = self.registry.dispose(lod.tree) {
                log::warn!("disposing idle tree {}: {e}", lod.tree);
            }
            self.selections.remove(&object);
            log::debug!("evicted idle LoD tree for object {object}");
        }
    }
}
