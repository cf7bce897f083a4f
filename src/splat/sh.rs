//! Spherical-harmonic coefficient packing
//!
//! Each SH coefficient is an RGB triplet packed into one u32: a shared
//! 5-bit power-of-two exponent, three 8-bit magnitudes relative to it,
//! and three sign bits. Band widths per splat: SH1 = 3 words,
//! SH2 = 5 words, SH3 = 7 words.

/// Words per splat for SH band 1 (coefficients 1..4).
pub const SH1_WORDS: usize = 3;
/// Words per splat for SH band 2 (coefficients 4..9).
pub const SH2_WORDS: usize = 5;
/// Words per splat for SH band 3 (coefficients 9..16).
pub const SH3_WORDS: usize = 7;

const EXP_BIAS: i32 = 16;

/// Pack one RGB triplet into a shared-exponent word.
pub fn encode_sh_triplet(rgb: [f32; 3]) -> u32 {
    let max = rgb.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if max == 0.0 || !max.is_finite() {
        return 0;
    }

    // Smallest power of two >= max so magnitudes stay in range
    let exp = max.log2().ceil().clamp(-(EXP_BIAS as f32), (EXP_BIAS - 1) as f32) as i32;
    let scale = (exp as f32).exp2();

    let mut word = ((exp + EXP_BIAS) as u32) << 27;
    for (channel, &value) in rgb.iter().enumerate() {
        let mag = ((value.abs() / scale) * 255.0).round().clamp(0.0, 255.0) as u32;
        word |= mag << (channel * 8);
        if value < 0.0 {
            word |= 1 << (24 + channel);
        }
    }
    word
}

/// Unpack one shared-exponent word into an RGB triplet.
pub fn decode_sh_triplet(word: u32) -> [f32; 3] {
    if word == 0 {
        return [0.0; 3];
    }
    let exp = ((word >> 27) & 0x1f) as i32 - EXP_BIAS;
    let scale = (exp as f32).exp2();

    let mut rgb = [0.0f32; 3];
    for (channel, value) in rgb.iter_mut().enumerate() {
        let mag = ((word >> (channel * 8)) & 0xff) as f32 / 255.0 * scale;
        *value = if word & (1 << (24 + channel)) != 0 { -mag } else { mag };
    }
    rgb
}

/// Pack a band of SH coefficients laid out `[c0r, c0g, c0b, c1r, ...]`.
/// `out` holds one word per coefficient.
pub fn encode_sh_band(coeffs: &[f32], out: &mut [u32]) {
    debug_assert_eq!(coeffs.len(), out.len() * 3);
    for (i, word) in out.iter_mut().enumerate() {
        *word = encode_sh_triplet([coeffs[i * 3], coeffs[i * 3 + 1], coeffs[i * 3 + 2]]);
    }
}

/// Unpack a band of SH coefficients.
pub fn decode_sh_band(words: &[u32], out: &mut [f32]) {
    debug_assert_eq!(out.len(), words.len() * 3);
    for (i, &word) in words.iter().enumerate() {
        let rgb = decode_sh_triplet(word);
        out[i * 3..i * 3 + 3].copy_from_slice(&rgb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_triplet_roundtrip() {
        let cases = [
            [0.5, -0.25, 0.125],
            [0.0, 0.0, 0.0],
            [-1.5, 2.0, -0.01],
            [1.0e-4, -1.0e-4, 5.0e-5],
        ];
        for rgb in cases {
            let decoded = decode_sh_triplet(encode_sh_triplet(rgb));
            let max = rgb.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            for d in 0..3 {
                // 8-bit magnitude relative to the shared scale (<= 2*max)
                assert!(
                    (decoded[d] - rgb[d]).abs() <= max * 2.0 / 255.0 + f32::EPSILON,
                    "{:?} decoded as {:?}",
                    rgb,
                    decoded
                );
            }
        }
    }

    #[test]
    fn test_sh_band_roundtrip() {
        let coeffs: Vec<f32> = (0..SH2_WORDS * 3).map(|i| (i as f32 - 7.0) * 0.1).collect();
        let mut words = vec![0u32; SH2_WORDS];
        encode_sh_band(&coeffs, &mut words);
        let mut decoded = vec![0.0f32; SH2_WORDS * 3];
        decode_sh_band(&words, &mut decoded);
        for (orig, dec) in coeffs.iter().zip(decoded.iter()) {
            assert!((orig - dec).abs() < 0.02);
        }
    }

    #[test]
    fn test_sh_signs() {
        let decoded = decode_sh_triplet(encode_sh_triplet([-0.5, 0.5, -0.5]));
        assert!(decoded[0] < 0.0 && decoded[1] > 0.0 && decoded[2] < 0.0);
    }
}
