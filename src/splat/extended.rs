//! Extended splats: 32 bytes per splat
//!
//! Eight u32 words: full f32 centers for large scenes, half-float color
//! and log-scales, and the same 3-byte octahedral rotation as the
//! compact encoding.
//!
//! - words 0-2: center.xyz as f32 bits
//! - word 3: color.r | color.g as f16
//! - word 4: color.b | opacity as f16
//! - word 5: ln(scale.x) | ln(scale.y) as f16
//! - word 6: ln(scale.z) as f16 | low rotation bytes
//! - word 7: high rotation byte, remaining bytes zero

use glam::{Quat, Vec3A};

use crate::splat::encode::{decode_quat_oct888, encode_quat_oct888, pack_f16x2, unpack_f16x2};
use crate::splat::Splat;

/// Words per extended splat.
pub const EXT_WORDS: usize = 8;

const LN_ZERO: f32 = -30.0;

/// Encode one splat into eight words.
pub fn encode_ext_splat(out: &mut [u32], splat: &Splat) {
    out[0] = splat.center.x.to_bits();
    out[1] = splat.center.y.to_bits();
    out[2] = splat.center.z.to_bits();
    out[3] = pack_f16x2(splat.rgb[0], splat.rgb[1]);
    out[4] = pack_f16x2(splat.rgb[2], splat.opacity);

    let ln = splat.scales.to_array().map(|s| if s > 0.0 { s.ln() } else { LN_ZERO });
    out[5] = pack_f16x2(ln[0], ln[1]);

    let oct = encode_quat_oct888(splat.rotation.to_array());
    out[6] = (pack_f16x2(ln[2], 0.0) & 0xffff) | ((oct[0] as u32) << 16) | ((oct[1] as u32) << 24);
    out[7] = oct[2] as u32;
}

/// Decode one splat from eight words.
pub fn decode_ext_splat(words: &[u32]) -> Splat {
    let center = Vec3A::new(
        f32::from_bits(words[0]),
        f32::from_bits(words[1]),
        f32::from_bits(words[2]),
    );
    let (r, g) = unpack_f16x2(words[3]);
    let (b, opacity) = unpack_f16x2(words[4]);

    let (ln_x, ln_y) = unpack_f16x2(words[5]);
    let (ln_z, _) = unpack_f16x2(words[6] & 0xffff);
    let scales = Vec3A::new(ln_x, ln_y, ln_z).to_array().map(|ln| {
        if ln <= LN_ZERO {
            0.0
        } else {
            ln.exp()
        }
    });

    let rotation = Quat::from_array(decode_quat_oct888([
        ((words[6] >> 16) & 0xff) as u8,
        (words[6] >> 24) as u8,
        (words[7] & 0xff) as u8,
    ]));

    Splat {
        center,
        scales: Vec3A::from_array(scales),
        rotation,
        rgb: [r, g, b],
        opacity,
    }
}

/// Array of extended splats plus optional SH bands.
#[derive(Clone, Debug, Default)]
pub struct ExtSplats {
    pub num_splats: usize,
    /// 8 words per splat
    pub words: Vec<u32>,
    pub sh1: Option<Vec<u32>>,
    pub sh2: Option<Vec<u32>>,
    pub sh3: Option<Vec<u32>>,
}

impl ExtSplats {
    pub fn new(num_splats: usize) -> Self {
        Self {
            num_splats,
            words: vec![0; num_splats * EXT_WORDS],
            sh1: None,
            sh2: None,
            sh3: None,
        }
    }

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
        let base = index * EXT_WORDS;
        encode_ext_splat(&mut self.words[base..base + EXT_WORDS], splat);
    }

    pub fn get(&self, index: usize) -> Splat {
        let base = index * EXT_WORDS;
        decode_ext_splat(&self.words[base..base + EXT_WORDS])
    }
}
