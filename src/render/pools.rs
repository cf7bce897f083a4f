//! GPU splat pool contract
//!
//! The rasterizer is an external collaborator; the engine only needs its
//! upload and index-feeding surface. [`SplatPools`] is that surface: a
//! page-granular splat pool, per-instance index tables, the back-to-front
//! ordering table, and an asynchronous depth readback. [`WgpuSplatPools`]
//! backs it with wgpu array textures; [`CpuSplatPools`] mirrors the same
//! state in memory for headless runs and tests.

use ahash::AHashMap;

use crate::cache::pool::ObjectId;
use crate::core::PAGE_SIZE;
use crate::splat::packed::PACKED_WORDS;
use crate::splat::ChunkSplats;

/// Texel rows per pool page in the GPU array textures. 65 536 splats at
/// 4096 texels per row.
pub const PAGE_TEX_WIDTH: u32 = 4096;
/// Rows per page: PAGE_SIZE / PAGE_TEX_WIDTH.
pub const PAGE_TEX_HEIGHT: u32 = PAGE_SIZE / PAGE_TEX_WIDTH;

/// Upload and index-feeding contract between the engine and the
/// rasterizer's resources.
pub trait SplatPools {
    /// Write one fetched chunk's splat data into a pool page.
    fn upload_page(&mut self, page: u32, splats: &ChunkSplats);

    /// Replace an instance's index table with freshly traversed indices.
    fn write_index_table(&mut self, object: ObjectId, indices: &[u32]);

    /// Upload a back-to-front ordering together with the composition
    /// version it was sorted against.
    fn write_ordering(&mut self, ordering: &[u32], version: u64);

    /// Start an asynchronous depth readback covering `count` splats.
    fn request_depth_readback(&mut self, count: u32);

    /// Poll the pending readback; `Some` once the copy completed.
    fn poll_depth_readback(&mut self) -> Option<Vec<u32>>;
}

/// CPU mirror of the pool state. Stands in for the GPU in headless
/// runs; also what the unit tests observe.
#[derive(Default)]
pub struct CpuSplatPools {
    pub pages: AHashMap<u32, ChunkSplats>,
    pub index_tables: AHashMap<ObjectId, Vec<u32>>,
    pub ordering: Vec<u32>,
    pub ordering_version: u64,
    pub uploads: usize,
    /// Depth values handed back by the next readback poll
    pub depth: Vec<u32>,
    readback_pending: Option<u32>,
}

impl SplatPools for CpuSplatPools {
    fn upload_page(&mut self, page: u32, splats: &ChunkSplats) {
        self.uploads += 1;
        self.pages.insert(page, splats.clone());
    }

    fn write_index_table(&mut self, object: ObjectId, indices: &[u32]) {
        self.index_tables.insert(object, indices.to_vec());
    }

    fn write_ordering(&mut self, ordering: &[u32], version: u64) {
        self.ordering = ordering.to_vec();
        self.ordering_version = version;
    }

    fn request_depth_readback(&mut self, count: u32) {
        self.readback_pending = Some(count);
    }

    fn poll_depth_readback(&mut self) -> Option<Vec<u32>> {
        let count = self.readback_pending.take()? as usize;
        let mut depth = self.depth.clone();
        depth.resize(count, 0);
        Some(depth)
    }
}

/// wgpu-backed pools: one RGBA32Uint array texture layer per page for
/// packed splats, a layer per SH band when retained, an index-table
/// texture per instance, and a staging buffer for depth readback.
pub struct WgpuSplatPools {
    device: wgpu::Device,
    queue: wgpu::Queue,
    splat_pool: wgpu::Texture,
    index_tables: AHashMap<ObjectId, wgpu::Texture>,
    ordering: Option<wgpu::Texture>,
    ordering_version: u64,
    readback: Option<ReadbackInFlight>,
    depth_target: wgpu::Buffer,
}

struct ReadbackInFlight {
    buffer: wgpu::Buffer,
    count: u32,
    receiver: std::sync::mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
}

impl WgpuSplatPools {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, page_count: u32, max_splats: u32) -> Self {
        let splat_pool = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("splat_pool"),
            size: wgpu::Extent3d {
                width: PAGE_TEX_WIDTH,
                height: PAGE_TEX_HEIGHT,
                depth_or_array_layers: page_count,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Uint,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let depth_target = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("splat_depth"),
            size: max_splats as u64 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self {
            device,
            queue,
            splat_pool,
            index_tables: AHashMap::new(),
            ordering: None,
            ordering_version: 0,
            readback: None,
            depth_target,
        }
    }

    /// The rasterizer binds this array texture to sample splat data.
    pub fn splat_pool(&self) -> &wgpu::Texture {
        &self.splat_pool
    }

    /// Depth buffer the rasterizer writes per-splat depth into.
    pub fn depth_target(&self) -> &wgpu::Buffer {
        &self.depth_target
    }

    pub fn ordering_version(&self) -> u64 {
        self.ordering_version
    }

    fn words_texture(&self, label: &str, words: u32) -> wgpu::Texture {
        let height = words.div_ceil(PAGE_TEX_WIDTH).max(1);
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: PAGE_TEX_WIDTH,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Uint,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn write_words(&self, texture: &wgpu::Texture, layer: u32, words: &[u32], words_per_texel: u32) {
        if words.is_empty() {
            return;
        }
        let width = texture.size().width;
        let rows = (words.len() as u32 / words_per_texel).div_ceil(width);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(words),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4 * words_per_texel),
                rows_per_image: Some(rows),
            },
            wgpu::Extent3d {
                width,
                height: rows,
                depth_or_array_layers: 1,
            },
        );
    }
}

impl SplatPools for WgpuSplatPools {
    fn upload_page(&mut self, page: u32, splats: &ChunkSplats) {
        // A short final chunk still covers whole texel rows; pad with
        // zero words so stale data never leaks through.
        let mut words = splats.packed.clone();
        words.resize(PAGE_SIZE as usize * PACKED_WORDS, 0);
        self.write_words(&self.splat_pool, page, &words, 4);
    }

    fn write_index_table(&mut self, object: ObjectId, indices: &[u32]) {
        let needed = indices.len() as u32;
        let recreate = match self.index_tables.get(&object) {
            Some(texture) => texture.size().width * texture.size().height < needed,
            None => true,
        };
        if recreate {
            let texture = self.words_texture("splat_index_table", needed);
            self.index_tables.insert(object, texture);
        }
        self.write_words(&self.index_tables[&object], 0, indices, 1);
    }

    fn write_ordering(&mut self, ordering: &[u32], version: u64) {
        let needed = ordering.len() as u32;
        let recreate = match &self.ordering {
            Some(texture) => texture.size().width * texture.size().height < needed,
            None => true,
        };
        if recreate {
            self.ordering = Some(self.words_texture("splat_ordering", needed));
        }
        self.write_words(self.ordering.as_ref().unwrap(), 0, ordering, 1);
        self.ordering_version = version;
    }

    fn request_depth_readback(&mut self, count: u32) {
        if self.readback.is_some() || count == 0 {
            return;
        }
        let bytes = count as u64 * 4;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("splat_depth_readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("depth_readback") });
        encoder.copy_buffer_to_buffer(&self.depth_target, 0, &buffer, 0, bytes);
        self.queue.submit([encoder.finish()]);

        let (sender, receiver) = std::sync::mpsc::channel();
        buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.readback = Some(ReadbackInFlight { buffer, count, receiver });
    }

    fn poll_depth_readback(&mut self) -> Option<Vec<u32>> {
        let pending = self.readback.as_ref()?;
        let _ = self.device.poll(wgpu::Maintain::Poll);
        match pending.receiver.try_recv() {
            Ok(Ok(())) => {
                let pending = self.readback.take().unwrap();
                let depth: Vec<u32> = {
                    let view = pending.buffer.slice(..).get_mapped_range();
                    let bytes: &[u8] = &view;
                    bytemuck::cast_slice(bytes)[..pending.count as usize].to_vec()
                };
                pending.buffer.unmap();
                Some(depth)
            }
            Ok(Err(e)) => {
                log::warn!("depth readback failed: {e}");
                self.readback = None;
                None
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_pools_mirror_uploads() {
        let mut pools = CpuSplatPools::default();
        let chunk = ChunkSplats { count: 2, packed: vec![1, 2, 3, 4, 5, 6, 7, 8], ..Default::default() };
        pools.upload_page(5, &chunk);
        assert_eq!(pools.uploads, 1);
        assert_eq!(pools.pages[&5].packed[4], 5);
    }

    #[test]
    fn test_cpu_pools_readback_sized_to_request() {
        let mut pools = CpuSplatPools::default();
        pools.depth = vec![9, 8, 7];
        assert!(pools.poll_depth_readback().is_none());

        pools.request_depth_readback(5);
        let depth = pools.poll_depth_readback().unwrap();
        assert_eq!(depth, vec![9, 8, 7, 0, 0]);
        assert!(pools.poll_depth_readback().is_none());
    }
}
