//! Scalar codecs shared by the splat encodings
//!
//! Log-scale bias encoding, octahedral quaternion packing, and the
//! half-float word packing used by the GPU-facing splat arrays.

use glam::Quat;
use half::f16;
use serde::{Deserialize, Serialize};

/// Quantization ranges carried alongside encoded splat data.
///
/// The compact encoding is lossy; these ranges define the mapping between
/// quantized codes and real values and travel with the data (in container
/// headers and chunk metadata).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplatEncoding {
    #[serde(rename = "rgbMin")]
    pub rgb_min: f32,
    #[serde(rename = "rgbMax")]
    pub rgb_max: f32,
    #[serde(rename = "lnScaleMin")]
    pub ln_scale_min: f32,
    #[serde(rename = "lnScaleMax")]
    pub ln_scale_max: f32,
    /// Opacity channel holds LoD aggregate weights instead of alpha.
    #[serde(rename = "lodOpacity")]
    pub lod_opacity: bool,
}

impl Default for SplatEncoding {
    fn default() -> Self {
        Self {
            rgb_min: 0.0,
            rgb_max: 1.0,
            ln_scale_min: -12.0,
            ln_scale_max: 9.0,
            lod_opacity: false,
        }
    }
}

/// Encode a linear scale into a biased 8-bit log code. Code 0 is the
/// exact-zero sentinel; codes 1..=255 span `[ln_min, ln_max]` linearly.
pub fn encode_scale8(scale: f32, ln_min: f32, ln_max: f32) -> u8 {
    if scale <= 0.0 {
        return 0;
    }
    let t = (scale.ln() - ln_min) / (ln_max - ln_min);
    (t * 254.0).round().clamp(0.0, 254.0) as u8 + 1
}

/// Decode an 8-bit log-scale code.
pub fn decode_scale8(code: u8, ln_min: f32, ln_max: f32) -> f32 {
    if code == 0 {
        return 0.0;
    }
    let t = (code - 1) as f32 / 254.0;
    (ln_min + t * (ln_max - ln_min)).exp()
}

/// Encode a unit value into 8 bits over `[min, max]`.
pub fn encode_unorm8(value: f32, min: f32, max: f32) -> u8 {
    (((value - min) / (max - min)) * 255.0).clamp(0.0, 255.0).round() as u8
}

/// Decode an 8-bit code over `[min, max]`.
pub fn decode_unorm8(code: u8, min: f32, max: f32) -> f32 {
    code as f32 / 255.0 * (max - min) + min
}

fn oct_wrap(v: f32, other: f32) -> f32 {
    (1.0 - other.abs()) * if v >= 0.0 { 1.0 } else { -1.0 }
}

/// Pack a rotation into 3 bytes: octahedral-mapped axis (8+8 bits) plus
/// rotation angle (8 bits over `[0, pi]`).
pub fn encode_quat_oct888(quat: [f32; 4]) -> [u8; 3] {
    let q = Quat::from_array(quat).normalize();
    // Canonical hemisphere: w >= 0 keeps the angle in [0, pi].
    let q = if q.w < 0.0 { -q } else { q };

    let sin_half = (1.0 - q.w * q.w).max(0.0).sqrt();
    let (axis, angle) = if sin_half < 1.0e-6 {
        (glam::Vec3::Z, 0.0)
    } else {
        (
            glam::Vec3::new(q.x, q.y, q.z) / sin_half,
            2.0 * q.w.clamp(-1.0, 1.0).acos(),
        )
    };

    let denom = axis.x.abs() + axis.y.abs() + axis.z.abs();
    let mut u = axis.x / denom;
    let mut v = axis.y / denom;
    if axis.z < 0.0 {
        let (ou, ov) = (u, v);
        u = oct_wrap(ou, ov);
        v = oct_wrap(ov, ou);
    }

    [
        ((u * 0.5 + 0.5) * 255.0).round().clamp(0.0, 255.0) as u8,
        ((v * 0.5 + 0.5) * 255.0).round().clamp(0.0, 255.0) as u8,
        (angle / std::f32::consts::PI * 255.0).round().clamp(0.0, 255.0) as u8,
    ]
}

/// Unpack a 3-byte octahedral rotation.
pub fn decode_quat_oct888(packed: [u8; 3]) -> [f32; 4] {
    let u = packed[0] as f32 / 255.0 * 2.0 - 1.0;
    let v = packed[1] as f32 / 255.0 * 2.0 - 1.0;
    let angle = packed[2] as f32 / 255.0 * std::f32::consts::PI;

    let z = 1.0 - u.abs() - v.abs();
    let axis = if z < 0.0 {
        glam::Vec3::new(oct_wrap(u, v), oct_wrap(v, u), z)
    } else {
        glam::Vec3::new(u, v, z)
    }
    .normalize();

    Quat::from_axis_angle(axis, angle).to_array()
}

/// Pack two half-floats into one u32, low half first.
pub fn pack_f16x2(a: f32, b: f32) -> u32 {
    (f16::from_f32(a).to_bits() as u32) | ((f16::from_f32(b).to_bits() as u32) << 16)
}

/// Unpack two half-floats from one u32.
pub fn unpack_f16x2(word: u32) -> (f32, f32) {
    (
        f16::from_bits((word & 0xffff) as u16).to_f32(),
        f16::from_bits((word >> 16) as u16).to_f32(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale8_roundtrip() {
        let enc = SplatEncoding::default();
        for scale in [0.001, 0.01, 0.1, 1.0, 10.0] {
            let code = encode_scale8(scale, enc.ln_scale_min, enc.ln_scale_max);
            let decoded = decode_scale8(code, enc.ln_scale_min, enc.ln_scale_max);
            // 254 steps over 21 ln-units: ~4% relative per half-step
            assert!(
                (decoded / scale).ln().abs() < 0.05,
                "scale {} decoded as {}",
                scale,
                decoded
            );
        }
    }

    #[test]
    fn test_scale8_zero_sentinel() {
        assert_eq!(encode_scale8(0.0, -12.0, 9.0), 0);
        assert_eq!(decode_scale8(0, -12.0, 9.0), 0.0);
    }

    #[test]
    fn test_unorm8_roundtrip() {
        for value in [0.0, 0.25, 0.5, 1.0] {
            let code = encode_unorm8(value, 0.0, 1.0);
            assert!((decode_unorm8(code, 0.0, 1.0) - value).abs() <= 0.5 / 255.0);
        }
    }

    #[test]
    fn test_quat_oct888_roundtrip() {
        let cases = [
            Quat::IDENTITY,
            Quat::from_axis_angle(glam::Vec3::Y, 0.7),
            Quat::from_axis_angle(glam::Vec3::new(1.0, -1.0, 0.5).normalize(), 2.0),
            Quat::from_axis_angle(glam::Vec3::new(-0.3, 0.2, -0.9).normalize(), 3.0),
        ];
        for q in cases {
            let packed = encode_quat_oct888(q.to_array());
            let decoded = Quat::from_array(decode_quat_oct888(packed));
            // Compare as rotations (q and -q are the same rotation)
            let dot = q.dot(decoded).abs();
            assert!(dot > 0.999, "quat {:?} decoded as {:?} (dot {})", q, decoded, dot);
        }
    }

    #[test]
    fn test_f16x2_roundtrip() {
        let word = pack_f16x2(1.5, -0.25);
        let (a, b) = unpack_f16x2(word);
        assert_eq!(a, 1.5);
        assert_eq!(b, -0.25);
    }
}
