//! Splat container sum type
//!
//! Uniform capability set over the coexisting splat encodings: splat
//! count, whether view-directional SH color is available, and random
//! access to a decoded splat (optionally SH-shaded toward a view
//! origin). The paged variant serves only chunks that are currently
//! resident.

use glam::Vec3A;

use crate::core::PAGE_SIZE;
use crate::splat::encode::SplatEncoding;
use crate::splat::extended::ExtSplats;
use crate::splat::packed::{decode_packed_splat, PackedSplats, PACKED_WORDS};
use crate::splat::sh::{decode_sh_band, SH1_WORDS, SH2_WORDS, SH3_WORDS};

/// One decoded 3D Gaussian primitive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Splat {
    pub center: Vec3A,
    pub scales: Vec3A,
    pub rotation: glam::Quat,
    pub rgb: [f32; 3],
    pub opacity: f32,
}

impl Default for Splat {
    fn default() -> Self {
        Self {
            center: Vec3A::ZERO,
            scales: Vec3A::ZERO,
            rotation: glam::Quat::IDENTITY,
            rgb: [0.0; 3],
            opacity: 0.0,
        }
    }
}

/// One resident chunk of a paged container: compact splat words plus
/// optional SH bands, exactly what a container chunk decodes to.
#[derive(Clone, Debug, Default)]
pub struct ChunkSplats {
    /// Splats in this chunk (the final chunk may be short)
    pub count: usize,
    /// 4 words per splat
    pub packed: Vec<u32>,
    pub sh1: Option<Vec<u32>>,
    pub sh2: Option<Vec<u32>>,
    pub sh3: Option<Vec<u32>>,
}

/// A paged splat container: chunk payloads come and go with cache
/// residency; indices are in chunk space (`chunk << 16 | offset`).
#[derive(Debug, Default)]
pub struct PagedSplats {
    pub num_splats: usize,
    pub max_sh_level: u32,
    pub encoding: SplatEncoding,
    chunks: Vec<Option<Box<ChunkSplats>>>,
}

impl PagedSplats {
    pub fn new(num_splats: usize, max_sh_level: u32, encoding: SplatEncoding) -> Self {
        let num_chunks = num_splats.div_ceil(PAGE_SIZE as usize);
        Self {
            num_splats,
            max_sh_level,
            encoding,
            chunks: (0..num_chunks).map(|_| None).collect(),
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn install_chunk(&mut self, chunk: u32, payload: ChunkSplats) {
        if let Some(slot) = self.chunks.get_mut(chunk as usize) {
            *slot = Some(Box::new(payload));
        }
    }

    pub fn evict_chunk(&mut self, chunk: u32) {
        if let Some(slot) = self.chunks.get_mut(chunk as usize) {
            *slot = None;
        }
    }

    pub fn is_resident(&self, chunk: u32) -> bool {
        matches!(self.chunks.get(chunk as usize), Some(Some(_)))
    }

    fn chunk(&self, index: usize) -> Option<(&ChunkSplats, usize)> {
        let chunk = index >> 16;
        let offset = index & 0xffff;
        let payload = self.chunks.get(chunk)?.as_deref()?;
        (offset < payload.count).then_some((payload, offset))
    }
}

/// Sum type over the splat container encodings.
#[derive(Debug)]
pub enum SplatStore {
    Packed(PackedSplats),
    Extended(ExtSplats),
    Paged(PagedSplats),
}

impl SplatStore {
    pub fn num_splats(&self) -> usize {
        match self {
            SplatStore::Packed(s) => s.num_splats,
            SplatStore::Extended(s) => s.num_splats,
            SplatStore::Paged(s) => s.num_splats,
        }
    }

    /// Whether view-directional SH color is available.
    pub fn has_sh_direction(&self) -> bool {
        match self {
            SplatStore::Packed(s) => s.max_sh_level() > 0,
            SplatStore::Extended(s) => s.max_sh_level() > 0,
            SplatStore::Paged(s) => s.max_sh_level > 0,
        }
    }

    /// Fetch one splat. Returns `None` for a paged index whose chunk is
    /// not resident, or any index out of bounds. When `view_origin` is
    /// given and SH data is present, the SH contribution along the view
    /// direction is added to the base color.
    pub fn fetch_splat(&self, index: usize, view_origin: Option<Vec3A>) -> Option<Splat> {
        let (mut splat, sh) = match self {
            SplatStore::Packed(s) => {
                if index >= s.num_splats {
                    return None;
                }
                (s.get(index), gather_sh(&s.sh1, &s.sh2, &s.sh3, index))
            }
            SplatStore::Extended(s) => {
                if index >= s.num_splats {
                    return None;
                }
                (s.get(index), gather_sh(&s.sh1, &s.sh2, &s.sh3, index))
            }
            SplatStore::Paged(s) => {
                let (payload, offset) = s.chunk(index)?;
                let base = offset * PACKED_WORDS;
                let splat = decode_packed_splat(&payload.packed[base..base + PACKED_WORDS], &s.encoding);
                (splat, gather_sh(&payload.sh1, &payload.sh2, &payload.sh3, offset))
            }
        };

        if let (Some(origin), Some(sh)) = (view_origin, sh) {
            let dir = (splat.center - origin).normalize_or_zero();
            if dir != Vec3A::ZERO {
                let shaded = eval_sh(&sh, dir);
                for d in 0..3 {
                    splat.rgb[d] += shaded[d];
                }
            }
        }
        Some(splat)
    }
}

/// Decoded SH coefficients for one splat, bands 1..=3 concatenated
/// (up to 15 RGB triplets).
struct ShCoeffs {
    coeffs: [[f32; 3]; 15],
    count: usize,
}

fn gather_sh(
    sh1: &Option<Vec<u32>>,
    sh2: &Option<Vec<u32>>,
    sh3: &Option<Vec<u32>>,
    index: usize,
) -> Option<ShCoeffs> {
    sh1.as_ref()?;
    let mut out = ShCoeffs { coeffs: [[0.0; 3]; 15], count: 0 };
    let mut scratch = [0.0f32; SH3_WORDS * 3];

    let mut take = |words: &[u32], n: usize, out: &mut ShCoeffs| {
        decode_sh_band(words, &mut scratch[..n * 3]);
        for i in 0..n {
            out.coeffs[out.count] = [scratch[i * 3], scratch[i * 3 + 1], scratch[i * 3 + 2]];
            out.count += 1;
        }
    };

    if let Some(words) = sh1 {
        take(&words[index * SH1_WORDS..(index + 1) * SH1_WORDS], SH1_WORDS, &mut out);
    }
    if let Some(words) = sh2 {
        take(&words[index * SH2_WORDS..(index + 1) * SH2_WORDS], SH2_WORDS, &mut out);
    }
    if let Some(words) = sh3 {
        take(&words[index * SH3_WORDS..(index + 1) * SH3_WORDS], SH3_WORDS, &mut out);
    }
    Some(out)
}

/// Evaluate real SH bands 1..=3 along `dir` and sum the coefficients.
fn eval_sh(sh: &ShCoeffs, dir: Vec3A) -> [f32; 3] {
    let (x, y, z) = (dir.x, dir.y, dir.z);
    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);

    let mut basis = [0.0f32; 15];
    // Band 1
    basis[0] = -0.488_602_5 * y;
    basis[1] = 0.488_602_5 * z;
    basis[2] = -0.488_602_5 * x;
    // Band 2
    basis[3] = 1.092_548_4 * xy;
    basis[4] = -1.092_548_4 * yz;
    basis[5] = 0.315_391_57 * (2.0 * zz - xx - yy);
    basis[6] = -1.092_548_4 * xz;
    basis[7] = 0.546_274_2 * (xx - yy);
    // Band 3
    basis[8] = -0.590_043_6 * y * (3.0 * xx - yy);
    basis[9] = 2.890_611_4 * xy * z;
    basis[10] = -0.457_045_8 * y * (4.0 * zz - xx - yy);
    basis[11] = 0.373_176_33 * z * (2.0 * zz - 3.0 * xx - 3.0 * yy);
    basis[12] = -0.457_045_8 * x * (4.0 * zz - xx - yy);
    basis[13] = 1.445_305_7 * z * (xx - yy);
    basis[14] = -0.590_043_6 * x * (xx - 3.0 * yy);

    let mut rgb = [0.0f32; 3];
    for i in 0..sh.count {
        for d in 0..3 {
            rgb[d] += basis[i] * sh.coeffs[i][d];
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::packed::PackedSplats;

    fn paged_with_one_chunk() -> PagedSplats {
        let encoding = SplatEncoding::default();
        let mut packed = PackedSplats::new(3, encoding.clone());
        for i in 0..3 {
            packed.set(
                i,
                &Splat {
                    center: Vec3A::new(i as f32, 0.0, 0.0),
                    scales: Vec3A::splat(0.1),
                    rotation: glam::Quat::IDENTITY,
                    rgb: [0.5; 3],
                    opacity: 1.0,
                },
            );
        }
        let mut paged = PagedSplats::new(3, 0, encoding);
        paged.install_chunk(
            0,
            ChunkSplats { count: 3, packed: packed.words, sh1: None, sh2: None, sh3: None },
        );
        paged
    }

    #[test]
    fn test_paged_fetch_resident() {
        let store = SplatStore::Paged(paged_with_one_chunk());
        assert_eq!(store.num_splats(), 3);
        assert!(!store.has_sh_direction());

        let splat = store.fetch_splat(2, None).unwrap();
        assert!((splat.center.x - 2.0).abs() < 1.0e-3);
        assert!(store.fetch_splat(3, None).is_none());
    }

    #[test]
    fn test_paged_fetch_missing_chunk() {
        let mut paged = paged_with_one_chunk();
        paged.evict_chunk(0);
        let store = SplatStore::Paged(paged);
        assert!(store.fetch_splat(0, None).is_none());
    }

    #[test]
    fn test_sh_shading_changes_color() {
        let encoding = SplatEncoding::default();
        let mut packed = PackedSplats::new(1, encoding);
        packed.set(
            0,
            &Splat {
                center: Vec3A::new(0.0, 0.0, 5.0),
                scales: Vec3A::splat(0.1),
                rotation: glam::Quat::IDENTITY,
                rgb: [0.5; 3],
                opacity: 1.0,
            },
        );
        let mut sh1 = vec![0u32; SH1_WORDS];
        crate::splat::sh::encode_sh_band(
            &[0.0, 0.0, 0.0, 0.4, 0.4, 0.4, 0.0, 0.0, 0.0],
            &mut sh1,
        );
        packed.sh1 = Some(sh1);

        let store = SplatStore::Packed(packed);
        assert!(store.has_sh_direction());

        let plain = store.fetch_splat(0, None).unwrap();
        let shaded = store.fetch_splat(0, Some(Vec3A::ZERO)).unwrap();
        assert_eq!(plain.rgb, [0.5; 3]);
        // Viewing along +z picks up the z-linear band-1 term
        assert!((shaded.rgb[0] - (0.5 + 0.488_602_5 * 0.4)).abs() < 0.01);
    }
}
