//! Paged splat cache
//!
//! Keeps a GPU-resident, fixed-capacity, page-aligned working set of
//! splat data populated on demand by the fetcher pool. Each frame the
//! traverser's touched list refreshes the LRU state and becomes the
//! fetch priority list; fetched chunks are promoted FIFO into pool
//! pages, emitting tree updates so the registry's residency maps track
//! the pool exactly. Root chunks bootstrap first, ordered by viewer
//! distance, because an object without its root contributes nothing to
//! traversal.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashSet;

use crate::cache::fetch::{ChunkSource, FetchPool, FetchedChunk};
use crate::cache::pool::{ObjectId, PagePool};
use crate::core::{Error, PAGE_SIZE};
use crate::lod::{TreeId, TreeUpdate};
use crate::render::pools::SplatPools;

/// One object registered for paged streaming.
#[derive(Clone, Copy, Debug)]
struct PagedObject {
    /// Shared tree handle whose residency maps mirror this object's pages
    tree: TreeId,
    num_chunks: u32,
}

/// The paged splat cache.
pub struct SplatCache {
    pool: PagePool,
    fetch: FetchPool,
    num_fetchers: usize,
    /// Highest SH band kept at upload; higher bands are stripped
    max_sh: u32,
    objects: ahash::AHashMap<ObjectId, PagedObject>,
    /// Fetched chunks awaiting upload, oldest first
    fetched: VecDeque<FetchedChunk>,
    queued_for_upload: AHashSet<(ObjectId, u32)>,
    /// Tree updates for the registry, eviction before residency
    pending_updates: Vec<TreeUpdate>,
    /// This frame's fetch candidates, most important first
    priorities: Vec<(ObjectId, u32)>,
    needed: AHashSet<(ObjectId, u32)>,
    over_capacity_warned: bool,
}

impl SplatCache {
    pub fn new(
        page_count: u32,
        num_fetchers: usize,
        max_sh: u32,
        source: Arc<dyn ChunkSource>,
    ) -> Self {
        Self {
            pool: PagePool::new(page_count),
            fetch: FetchPool::new(source, num_fetchers),
            num_fetchers,
            max_sh,
            objects: ahash::AHashMap::new(),
            fetched: VecDeque::new(),
            queued_for_upload: AHashSet::new(),
            pending_updates: Vec::new(),
            priorities: Vec::new(),
            needed: AHashSet::new(),
            over_capacity_warned: false,
        }
    }

    /// Register a paged object backed by the given shared tree handle.
    pub fn register_object(&mut self, object: ObjectId, tree: TreeId, num_chunks: u32) {
        self.pool.register_object(object, num_chunks);
        self.objects.insert(object, PagedObject { tree, num_chunks });

        if self.objects.len() > self.pool.page_count() && !self.over_capacity_warned {
            self.over_capacity_warned = true;
            log::warn!(
                "{}",
                Error::OverCapacity {
                    objects: self.objects.len(),
                    pages: self.pool.page_count(),
                }
            );
        }
    }

    /// Remove an object, returning its pages to the free list in the
    /// same call. Queued uploads for it are dropped.
    pub fn remove_object(&mut self, object: ObjectId) -> Vec<u32> {
        self.objects.remove(&object);
        self.fetched.retain(|chunk| chunk.object != object);
        self.queued_for_upload.retain(|&(o, _)| o != object);
        self.pending_updates.retain(|update| {
            self.objects.values().any(|obj| obj.tree == update.tree)
        });
        self.pool.remove_object(object)
    }

    pub fn is_registered(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    pub fn object_tree(&self, object: ObjectId) -> Option<TreeId> {
        self.objects.get(&object).map(|o| o.tree)
    }

    pub fn is_resident(&self, object: ObjectId, chunk: u32) -> bool {
        self.pool.is_resident(object, chunk)
    }

    pub fn root_page(&self, object: ObjectId) -> Option<u32> {
        self.pool.lookup(object, 0)
    }

    pub fn is_over_capacity(&self) -> bool {
        self.over_capacity_warned
    }

    /// Replace this frame's priority list with the traverser's touched
    /// chunks (most important first) and the viewer distance per
    /// visible object, used to order root-chunk bootstrap.
    ///
    /// Touched pages are refreshed in reverse priority order so the
    /// most important is freshest; everything untouched becomes
    /// evictable. The stored fetch list contains no entry that is
    /// already resident.
    pub fn submit_priorities(
        &mut self,
        touched: &[(ObjectId, u32)],
        object_distances: &[(ObjectId, f32)],
    ) {
        self.needed.clear();
        for &(object, chunk) in touched {
            if self.objects.contains_key(&object) {
                self.needed.insert((object, chunk));
            }
        }

        for &(object, chunk) in touched.iter().rev() {
            self.pool.touch(object, chunk);
        }
        self.pool.rebuild_freeable(&self.needed);

        self.priorities.clear();
        let mut queued: AHashSet<(ObjectId, u32)> = AHashSet::new();

        // Root chunks first, nearest object first
        let mut roots: Vec<(ObjectId, f32)> = object_distances
            .iter()
            .filter(|(object, _)| {
                self.objects.contains_key(object) && !self.pool.is_resident(*object, 0)
            })
            .copied()
            .collect();
        roots.sort_by(|a, b| a.1.total_cmp(&b.1));
        for (object, _) in roots {
            if queued.insert((object, 0)) {
                self.priorities.push((object, 0));
            }
        }

        for &(object, chunk) in touched {
            if !self.objects.contains_key(&object) || self.pool.is_resident(object, chunk) {
                continue;
            }
            if queued.insert((object, chunk)) {
                self.priorities.push((object, chunk));
            }
        }
    }

    /// The current fetch priority list, most important first.
    pub fn priorities(&self) -> &[(ObjectId, u32)] {
        &self.priorities
    }

    /// Dispatch fetches down the priority list until the fetcher pool
    /// is saturated.
    pub fn kick_fetchers(&mut self) {
        for &(object, chunk) in &self.priorities {
            if self.fetch.in_flight_count() >= self.num_fetchers {
                break;
            }
            if self.pool.is_resident(object, chunk)
                || self.queued_for_upload.contains(&(object, chunk))
                || self.fetch.is_in_flight(object, chunk)
            {
                continue;
            }
            self.fetch.dispatch(object, chunk);
        }
    }

    /// Drain fetch completions into the upload queue.
    pub fn poll_fetched(&mut self) {
        for chunk in self.fetch.poll_completed() {
            if !self.objects.contains_key(&chunk.object) {
                // Object removed while the fetch was in flight
                continue;
            }
            self.queued_for_upload.insert((chunk.object, chunk.chunk));
            self.fetched.push_back(chunk);
        }
    }

    /// Promote fetched chunks into pool pages, FIFO. For every page
    /// reclaimed by eviction, the "gone" tree update is emitted before
    /// the new residency update, so the registry never sees two chunks
    /// co-resident in one page.
    pub fn promote(&mut self, pools: &mut dyn SplatPools) {
        while let Some(mut fetched) = self.fetched.pop_front() {
            if self.max_sh < 3 {
                fetched.payload.splats.sh3 = None;
            }
            if self.max_sh < 2 {
                fetched.payload.splats.sh2 = None;
            }
            if self.max_sh < 1 {
                fetched.payload.splats.sh1 = None;
            }
            self.queued_for_upload.remove(&(fetched.object, fetched.chunk));
            let Some(&object) = self.objects.get(&fetched.object) else {
                continue;
            };
            if fetched.chunk >= object.num_chunks {
                log::warn!(
                    "{}",
                    Error::ChunkDecodeFailed {
                        object: fetched.object,
                        chunk: fetched.chunk,
                        reason: format!("chunk beyond object's {} chunks", object.num_chunks),
                    }
                );
                continue;
            }
            let Some(lod_words) = fetched.payload.lod_words else {
                log::warn!(
                    "{}",
                    Error::ChunkDecodeFailed {
                        object: fetched.object,
                        chunk: fetched.chunk,
                        reason: "chunk carries no tree nodes".into(),
                    }
                );
                continue;
            };

            let Some(alloc) = self.pool.allocate(fetched.object, fetched.chunk) else {
                continue;
            };
            if let Some((prev_object, prev_chunk)) = alloc.evicted {
                if let Some(prev) = self.objects.get(&prev_object) {
                    self.pending_updates.push(TreeUpdate {
                        tree: prev.tree,
                        page_base: alloc.page * PAGE_SIZE,
                        chunk_base: prev_chunk * PAGE_SIZE,
                        count: PAGE_SIZE,
                        words: None,
                    });
                }
            }

            pools.upload_page(alloc.page, &fetched.payload.splats);
            self.pending_updates.push(TreeUpdate {
                tree: object.tree,
                page_base: alloc.page * PAGE_SIZE,
                chunk_base: fetched.chunk * PAGE_SIZE,
                count: fetched.payload.splats.count as u32,
                words: Some(lod_words),
            });
        }
    }

    /// Take the pending tree updates for the registry.
    pub fn drain_updates(&mut self) -> Vec<TreeUpdate> {
        std::mem::take(&mut self.pending_updates)
    }

    #[cfg(test)]
    pub(crate) fn inject_fetched(&mut self, chunk: FetchedChunk) {
        self.queued_for_upload.insert((chunk.object, chunk.chunk));
        self.fetched.push_back(chunk);
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &PagePool {
        &self.pool
    }
}
