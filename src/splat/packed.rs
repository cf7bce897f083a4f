//! Compact packed splats: 16 bytes per splat
//!
//! Four u32 words per splat, matching the GPU pool texel layout:
//!
//! - word 0: rgba, 8 bits per channel
//! - word 1: center.x | center.y as f16
//! - word 2: center.z as f16 | scale.x (8-bit log) | scale.y
//! - word 3: scale.z | octahedral quaternion u, v, angle
//!
//! Quantization ranges come from the accompanying [`SplatEncoding`].

use glam::{Quat, Vec3A};

use crate::splat::encode::{
    decode_quat_oct888, decode_scale8, decode_unorm8, encode_quat_oct888, encode_scale8,
    encode_unorm8, pack_f16x2, unpack_f16x2, SplatEncoding,
};
use crate::splat::Splat;

/// Words per packed splat.
pub const PACKED_WORDS: usize = 4;

/// Encode one splat into four words.
pub fn encode_packed_splat(out: &mut [u32], splat: &Splat, encoding: &SplatEncoding) {
    let rgb = splat.rgb;
    let r = encode_unorm8(rgb[0], encoding.rgb_min, encoding.rgb_max) as u32;
    let g = encode_unorm8(rgb[1], encoding.rgb_min, encoding.rgb_max) as u32;
    let b = encode_unorm8(rgb[2], encoding.rgb_min, encoding.rgb_max) as u32;
    let a = encode_unorm8(splat.opacity, 0.0, 1.0) as u32;
    out[0] = r | (g << 8) | (b << 16) | (a << 24);

    out[1] = pack_f16x2(splat.center.x, splat.center.y);

    let sx = encode_scale8(splat.scales.x, encoding.ln_scale_min, encoding.ln_scale_max) as u32;
    let sy = encode_scale8(splat.scales.y, encoding.ln_scale_min, encoding.ln_scale_max) as u32;
    let sz = encode_scale8(splat.scales.z, encoding.ln_scale_min, encoding.ln_scale_max) as u32;
    out[2] = (pack_f16x2(splat.center.z, 0.0) & 0xffff) | (sx << 16) | (sy << 24);

    let oct = encode_quat_oct888(splat.rotation.to_array());
    out[3] = sz | ((oct[0] as u32) << 8) | ((oct[1] as u32) << 16) | ((oct[2] as u32) << 24);
}

/// Decode one splat from four words.
pub fn decode_packed_splat(words: &[u32], encoding: &SplatEncoding) -> Splat {
    let r = decode_unorm8((words[0] & 0xff) as u8, encoding.rgb_min, encoding.rgb_max);
    let g = decode_unorm8(((words[0] >> 8) & 0xff) as u8, encoding.rgb_min, encoding.rgb_max);
    let b = decode_unorm8(((words[0] >> 16) & 0xff) as u8, encoding.rgb_min, encoding.rgb_max);
    let opacity = decode_unorm8((words[0] >> 24) as u8, 0.0, 1.0);

    let (cx, cy) = unpack_f16x2(words[1]);
    let (cz, _) = unpack_f16x2(words[2] & 0xffff);

    let scales = Vec3A::new(
        decode_scale8(((words[2] >> 16) & 0xff) as u8, encoding.ln_scale_min, encoding.ln_scale_max),
        decode_scale8((words[2] >> 24) as u8, encoding.ln_scale_min, encoding.ln_scale_max),
        decode_scale8((words[3] & 0xff) as u8, encoding.ln_scale_min, encoding.ln_scale_max),
    );

    let rotation = Quat::from_array(decode_quat_oct888([
        ((words[3] >> 8) & 0xff) as u8,
        ((words[3] >> 16) & 0xff) as u8,
        (words[3] >> 24) as u8,
    ]));

    Splat {
        center: Vec3A::new(cx, cy, cz),
        scales,
        rotation,
        rgb: [r, g, b],
        opacity,
    }
}

/// Array of compact splats plus optional SH bands.
#[derive(Clone, Debug, Default)]
pub struct PackedSplats {
    pub num_splats: usize,
    pub encoding: SplatEncoding,
    /// 4 words per splat
    pub words: Vec<u32>,
    /// 3 words per splat when present
    pub sh1: Option<Vec<u32>>,
    /// 5 words per splat when present
    pub sh2: Option<Vec<u32>>,
    /// 7 words per splat when present
    pub sh3: Option<Vec<u32>>,
}

impl PackedSplats {
    pub fn new(num_splats: usize, encoding: SplatEncoding) -> Self {
        Self {
            num_splats,
            encoding,
            words: vec![0; num_splats * PACKED_WORDS],
            sh1: None,
            sh2: None,
            sh3: None,
        }
    }

    /// Highest SH level carried.
    pub fn max_sh_level(&self) -> u32 {
        if self.sh3.is_some() {
            3
        } else if self.sh2.is_some() {
            2
        } else if self.sh1.is_some() {
            1
        } else {
            0
        }
    }

    pub fn set(&mut self, index: usize, splat: &Splat) {
        let base = index * PACKED_WORDS;
        encode_packed_splat(&mut self.words[base..base + PACKED_WORDS], splat, &self.encoding);
    }

    pub fn get(&self, index: usize) -> Splat {
        let base = index * PACKED_WORDS;
        decode_packed_splat(&self.words[base..base + PACKED_WORDS], &self.encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_splat() -> Splat {
        Splat {
            center: Vec3A::new(1.0, -2.5, 0.75),
            scales: Vec3A::new(0.02, 0.05, 0.01),
            rotation: Quat::from_axis_angle(glam::Vec3::new(0.2, 0.9, -0.4).normalize(), 1.1),
            rgb: [0.8, 0.4, 0.1],
            opacity: 0.9,
        }
    }

    #[test]
    fn test_packed_roundtrip_precision() {
        let mut splats = PackedSplats::new(1, SplatEncoding::default());
        let splat = sample_splat();
        splats.set(0, &splat);
        let decoded = splats.get(0);

        // Centers are f16: <= 0.1% relative error at these magnitudes
        for d in 0..3 {
            let (orig, dec) = (splat.center[d], decoded.center[d]);
            assert!(
                (dec - orig).abs() <= orig.abs() * 1.0e-3,
                "center[{}] {} decoded as {}",
                d,
                orig,
                dec
            );
        }

        // Color within one 8-bit step
        for d in 0..3 {
            assert!((decoded.rgb[d] - splat.rgb[d]).abs() <= 1.0 / 255.0);
        }
        assert!((decoded.opacity - splat.opacity).abs() <= 1.0 / 255.0);

        // Log-scale codes: ~5% relative
        for d in 0..3 {
            assert!((decoded.scales[d] / splat.scales[d]).ln().abs() < 0.05);
        }

        // Rotation within a degree
        assert!(splat.rotation.dot(decoded.rotation).abs() > 0.999);
    }

    #[test]
    fn test_packed_words_stride() {
        let splats = PackedSplats::new(7, SplatEncoding::default());
        assert_eq!(splats.words.len(), 7 * PACKED_WORDS);
        assert_eq!(splats.max_sh_level(), 0);
    }
}
