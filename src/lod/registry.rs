//! LoD tree registry
//!
//! Allocates opaque integer tree handles, applies batched ranged writes
//! to tree payloads, and serves level queries. Payloads are reference
//! counted so a paged root tree and its shared handles alias the same
//! node array while keeping disposal deterministic: handles are ids,
//! never shared pointers.

use ahash::AHashMap;

use crate::core::{Error, Result, PAGE_SIZE};
use crate::lod::node::{LodNode, NODE_WORDS, NO_PAGE};

/// Opaque tree handle.
pub type TreeId = u32;

/// One ranged write of the tree-update protocol (registry <- cache).
///
/// `page_base` and `chunk_base` are in splat units and page-aligned.
/// `words` absent means "evicted": residency over the covered pages is
/// cleared and the nodes keep their last contents (the parent side of
/// the cut no longer descends into them). Present means "populate".
#[derive(Clone, Debug)]
pub struct TreeUpdate {
    pub tree: TreeId,
    pub page_base: u32,
    pub chunk_base: u32,
    pub count: u32,
    pub words: Option<Vec<u32>>,
}

struct TreePayload {
    nodes: Vec<LodNode>,
    capacity: usize,
    refs: u32,
}

struct TreeEntry {
    payload: u32,
    /// page -> chunk currently stored there (NO_PAGE when empty)
    page_to_chunk: Vec<u32>,
    /// chunk -> resident page (NO_PAGE when not resident)
    chunk_to_page: Vec<u32>,
}

/// Registry of LoD trees, keyed by integer id.
#[derive(Default)]
pub struct TreeRegistry {
    next_tree: TreeId,
    next_payload: u32,
    payloads: AHashMap<u32, TreePayload>,
    trees: AHashMap<TreeId, TreeEntry>,
}

impl TreeRegistry {
    pub fn new() -> Self {
        Self {
            next_tree: 1000,
            next_payload: 0,
            payloads: AHashMap::new(),
            trees: AHashMap::new(),
        }
    }

    fn alloc_payload(&mut self, capacity: usize) -> u32 {
        let id = self.next_payload;
        self.next_payload += 1;
        self.payloads.insert(
            id,
            TreePayload { nodes: Vec::new(), capacity, refs: 1 },
        );
        id
    }

    fn alloc_tree(&mut self, entry: TreeEntry) -> TreeId {
        let id = self.next_tree;
        self.next_tree += 1;
        self.trees.insert(id, entry);
        id
    }

    /// Create an empty tree that will be filled by ranged updates.
    /// `capacity` bounds the paged node array, in splats.
    pub fn new_tree(&mut self, capacity: usize) -> TreeId {
        let payload = self.alloc_payload(capacity);
        self.alloc_tree(TreeEntry {
            payload,
            page_to_chunk: Vec::new(),
            chunk_to_page: Vec::new(),
        })
    }

    /// Create a second handle over an existing tree's payload, with its
    /// own residency maps. The new handle must not outlive the primary.
    pub fn new_shared_tree(&mut self, primary: TreeId) -> Result<TreeId> {
        let payload = self.trees.get(&primary).ok_or(Error::UnknownTree(primary))?.payload;
        self.payloads.get_mut(&payload).expect("payload of live tree").refs += 1;
        Ok(self.alloc_tree(TreeEntry {
            payload,
            page_to_chunk: Vec::new(),
            chunk_to_page: Vec::new(),
        }))
    }

    /// Ingest a self-contained tree: all chunks present, identity
    /// chunk-to-page mapping.
    pub fn init_tree(&mut self, num_splats: u32, words: &[u32]) -> Result<TreeId> {
        if words.len() != num_splats as usize * NODE_WORDS {
            return Err(Error::InvalidArgument(format!(
                "tree blob has {} words for {} splats",
                words.len(),
                num_splats
            )));
        }
        let pages = num_splats.div_ceil(PAGE_SIZE);
        let payload = self.alloc_payload(num_splats as usize);
        let tree = self.alloc_tree(TreeEntry {
            payload,
            page_to_chunk: (0..pages).collect(),
            chunk_to_page: (0..pages).collect(),
        });
        self.write_nodes(payload, 0, num_splats, words);
        Ok(tree)
    }

    /// Release a handle; the payload is freed with its last handle.
    pub fn dispose(&mut self, tree: TreeId) -> Result<()> {
        let entry = self.trees.remove(&tree).ok_or(Error::UnknownTree(tree))?;
        let payload = self.payloads.get_mut(&entry.payload).expect("payload of live tree");
        payload.refs -= 1;
        if payload.refs == 0 {
            self.payloads.remove(&entry.payload);
        }
        Ok(())
    }

    pub fn contains(&self, tree: TreeId) -> bool {
        self.trees.contains_key(&tree)
    }

    /// Apply a batch of ranged updates. The batch is validated before
    /// any range is applied, so a bad range leaves the registry
    /// untouched.
    pub fn update_trees(&mut self, ranges: &[TreeUpdate]) -> Result<()> {
        for range in ranges {
            let entry = self.trees.get(&range.tree).ok_or(Error::UnknownTree(range.tree))?;
            if range.page_base % PAGE_SIZE != 0 || range.chunk_base % PAGE_SIZE != 0 {
                return Err(Error::InvalidArgument(format!(
                    "update bases ({}, {}) must be page aligned",
                    range.page_base, range.chunk_base
                )));
            }
            let capacity = self.payloads[&entry.payload].capacity;
            if (range.page_base + range.count) as usize > capacity {
                return Err(Error::OutOfRange(format!(
                    "update [{}, {}) exceeds tree capacity {}",
                    range.page_base,
                    range.page_base + range.count,
                    capacity
                )));
            }
            if let Some(words) = &range.words {
                if words.len() != range.count as usize * NODE_WORDS {
                    return Err(Error::InvalidArgument(format!(
                        "update blob has {} words for {} nodes",
                        words.len(),
                        range.count
                    )));
                }
            }
        }

        for range in ranges {
            let pages = range.count.div_ceil(PAGE_SIZE);
            let base_page = range.page_base >> 16;
            let base_chunk = range.chunk_base >> 16;

            let entry = self.trees.get_mut(&range.tree).expect("validated");
            if ((base_page + pages) as usize) > entry.page_to_chunk.len() {
                entry.page_to_chunk.resize((base_page + pages) as usize, NO_PAGE);
            }
            if ((base_chunk + pages) as usize) > entry.chunk_to_page.len() {
                entry.chunk_to_page.resize((base_chunk + pages) as usize, NO_PAGE);
            }

            match &range.words {
                None => {
                    for page in 0..pages {
                        entry.page_to_chunk[(base_page + page) as usize] = NO_PAGE;
                        entry.chunk_to_page[(base_chunk + page) as usize] = NO_PAGE;
                    }
                }
                Some(words) => {
                    for page in 0..pages {
                        entry.page_to_chunk[(base_page + page) as usize] = base_chunk + page;
                        entry.chunk_to_page[(base_chunk + page) as usize] = base_page + page;
                    }
                    let payload = entry.payload;
                    self.write_nodes(payload, range.page_base, range.count, words);
                }
            }
        }
        Ok(())
    }

    fn write_nodes(&mut self, payload: u32, page_base: u32, count: u32, words: &[u32]) {
        let payload = self.payloads.get_mut(&payload).expect("payload of live tree");
        let end = (page_base + count) as usize;
        if end > payload.nodes.len() {
            let grown = (payload.nodes.len() * 2).max(end).min(payload.capacity);
            payload.nodes.resize_with(grown, Default::default);
        }
        for i in 0..count as usize {
            payload.nodes[page_base as usize + i] =
                LodNode::from_words(&words[i * NODE_WORDS..(i + 1) * NODE_WORDS]);
        }
    }

    /// Nodes and residency maps of one tree, for traversal.
    pub(crate) fn tree_view(&self, tree: TreeId) -> Result<TreeView<'_>> {
        let entry = self.trees.get(&tree).ok_or(Error::UnknownTree(tree))?;
        Ok(TreeView {
            nodes: &self.payloads[&entry.payload].nodes,
            page_to_chunk: &entry.page_to_chunk,
            chunk_to_page: &entry.chunk_to_page,
        })
    }

    /// Indices of all nodes at the given tree level, where each level
    /// shrinks the admissible node size by a factor of 1.25.
    pub fn get_level(&self, tree: TreeId, level: u32) -> Result<Vec<u32>> {
        let view = self.tree_view(tree)?;
        if view.nodes.is_empty() {
            return Ok(Vec::new());
        }

        let root_size = view.nodes[0].size();
        let level_size = root_size / 1.25f32.powi(level as i32);

        let mut frontier = vec![0u32];
        let mut output = Vec::new();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for index in frontier {
                let node = &view.nodes[index as usize];
                if node.size() <= level_size || node.is_leaf() {
                    output.push(index);
                } else {
                    next.extend(node.child_start..node.child_start + node.child_count as u32);
                }
            }
            frontier = next;
        }
        Ok(output)
    }
}

/// Borrowed view of one tree's data.
pub(crate) struct TreeView<'a> {
    pub nodes: &'a [LodNode],
    pub page_to_chunk: &'a [u32],
    pub chunk_to_page: &'a [u32],
}
