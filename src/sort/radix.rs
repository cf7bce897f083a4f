//! Depth sort kernels
//!
//! Back-to-front permutations over per-splat depth readbacks. A depth
//! of zero marks a splat the rasterizer culled (alpha below threshold
//! or out of bounds); everything else sorts greater-depth-first with
//! ties broken by splat index ascending.
//!
//! The 32-bit kernel is a stable four-pass LSD radix over complemented
//! keys; the 16-bit variant (legacy depth encodings) is a single
//! counting pass over 65 536 buckets.

use rayon::prelude::*;

use crate::core::{Error, Result};

/// Output buffers are sized in rows of this many entries.
pub const ORDERING_ROW: usize = 16_384;

/// Input sizes at or above this use the parallel histogram pass.
const PAR_HISTOGRAM_THRESHOLD: usize = 1 << 19;

/// Required output capacity for `num_splats` entries.
pub fn ordering_capacity(num_splats: usize) -> usize {
    num_splats.div_ceil(ORDERING_ROW) * ORDERING_ROW
}

fn check_buffers(num_splats: usize, readback_len: usize, ordering_len: usize) -> Result<()> {
    if num_splats > readback_len {
        return Err(Error::InvalidArgument(format!(
            "num_splats {num_splats} exceeds readback length {readback_len}"
        )));
    }
    let needed = ordering_capacity(num_splats);
    if ordering_len < needed {
        return Err(Error::InvalidBuffer { needed, have: ordering_len });
    }
    Ok(())
}

/// Reusable scratch for [`sort32_with`].
#[derive(Default)]
pub struct Sort32Buffers {
    keys: Vec<u32>,
    indices: Vec<u32>,
    scratch_keys: Vec<u32>,
    scratch_indices: Vec<u32>,
}

fn histogram(keys: &[u32], shift: u32) -> [u32; 256] {
    if keys.len() >= PAR_HISTOGRAM_THRESHOLD {
        keys.par_chunks(1 << 16)
            .map(|chunk| {
                let mut hist = [0u32; 256];
                for &key in chunk {
                    hist[((key >> shift) & 0xff) as usize] += 1;
                }
                hist
            })
            .reduce(
                || [0u32; 256],
                |mut a, b| {
                    for (a, b) in a.iter_mut().zip(b.iter()) {
                        *a += b;
                    }
                    a
                },
            )
    } else {
        let mut hist = [0u32; 256];
        for &key in keys {
            hist[((key >> shift) & 0xff) as usize] += 1;
        }
        hist
    }
}

/// Sort with caller-provided scratch. Returns the visible splat count;
/// `ordering[0..active]` holds the permutation, later slots are
/// unspecified.
pub fn sort32_with(
    buffers: &mut Sort32Buffers,
    num_splats: usize,
    readback: &[u32],
    ordering: &mut [u32],
) -> Result<u32> {
    check_buffers(num_splats, readback.len(), ordering.len())?;

    // Compact visible splats; complemented keys make an ascending
    // stable sort yield back-to-front with index-ascending ties.
    buffers.keys.clear();
    buffers.indices.clear();
    for (index, &depth) in readback[..num_splats].iter().enumerate() {
        if depth != 0 {
            buffers.keys.push(!depth);
            buffers.indices.push(index as u32);
        }
    }
    let active = buffers.keys.len();
    buffers.scratch_keys.resize(active, 0);
    buffers.scratch_indices.resize(active, 0);

    let Sort32Buffers { keys, indices, scratch_keys, scratch_indices } = buffers;
    let (mut src_keys, mut src_indices) = (keys, indices);
    let (mut dst_keys, mut dst_indices) = (scratch_keys, scratch_indices);

    for shift in [0u32, 8, 16, 24] {
        let hist = histogram(&src_keys[..active], shift);
        if hist.iter().any(|&count| count as usize == active) {
            // Every key shares this byte
            continue;
        }
        let mut offsets = [0u32; 256];
        let mut total = 0;
        for (bucket, &count) in hist.iter().enumerate() {
            offsets[bucket] = total;
            total += count;
        }
        for i in 0..active {
            let key = src_keys[i];
            let bucket = ((key >> shift) & 0xff) as usize;
            let at = offsets[bucket] as usize;
            offsets[bucket] += 1;
            dst_keys[at] = key;
            dst_indices[at] = src_indices[i];
        }
        std::mem::swap(&mut src_keys, &mut dst_keys);
        std::mem::swap(&mut src_indices, &mut dst_indices);
    }

    ordering[..active].copy_from_slice(&src_indices[..active]);
    Ok(active as u32)
}

/// Sort a 32-bit depth readback, allocating scratch internally.
pub fn sort32(num_splats: usize, readback: &[u32], ordering: &mut [u32]) -> Result<u32> {
    sort32_with(&mut Sort32Buffers::default(), num_splats, readback, ordering)
}

/// Sort a legacy 16-bit depth readback: one counting pass.
pub fn sort16(num_splats: usize, readback: &[u16], ordering: &mut [u32]) -> Result<u32> {
    check_buffers(num_splats, readback.len(), ordering.len())?;

    let mut counts = vec![0u32; 1 << 16];
    let mut active = 0u32;
    for &depth in &readback[..num_splats] {
        if depth != 0 {
            counts[depth as usize] += 1;
            active += 1;
        }
    }

    // Greater depth first
    let mut offsets = vec![0u32; 1 << 16];
    let mut total = 0;
    for depth in (1..1usize << 16).rev() {
        offsets[depth] = total;
        total += counts[depth];
    }

    for (index, &depth) in readback[..num_splats].iter().enumerate() {
        if depth != 0 {
            let at = offsets[depth as usize] as usize;
            offsets[depth as usize] += 1;
            ordering[at] = index as u32;
        }
    }
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_back_to_front(readback: &[u32], ordering: &[u32], active: u32) {
        for pair in ordering[..active as usize].windows(2) {
            let (a, b) = (readback[pair[0] as usize], readback[pair[1] as usize]);
            assert!(a >= b, "depth order violated: {a} before {b}");
            if a == b {
                assert!(pair[0] < pair[1], "tie not index-ascending");
            }
        }
    }

    #[test]
    fn test_sort32_orders_back_to_front() {
        let readback = vec![5u32, 0, 9, 1, 9, 3, 0xffff_ffff, 2];
        let mut ordering = vec![0u32; ordering_capacity(readback.len())];
        let active = sort32(readback.len(), &readback, &mut ordering).unwrap();
        assert_eq!(active, 7); // one culled
        assert_eq!(ordering[0], 6);
        assert_eq!(&ordering[1..3], &[2, 4]); // equal depths keep index order
        assert_back_to_front(&readback, &ordering, active);
    }

    #[test]
    fn test_sort32_large_random() {
        // Deterministic pseudo-random depths, enough to hit every pass
        let mut seed = 0x1234_5678u32;
        let readback: Vec<u32> = (0..100_000)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                seed >> 4
            })
            .collect();
        let mut ordering = vec![0u32; ordering_capacity(readback.len())];
        let active = sort32(readback.len(), &readback, &mut ordering).unwrap();
        assert_back_to_front(&readback, &ordering, active);
        assert_eq!(
            active as usize,
            readback.iter().filter(|&&d| d != 0).count()
        );
    }

    #[test]
    fn test_sort32_rejects_small_buffer() {
        let readback = vec![1u32; 10];
        let mut ordering = vec![0u32; 10];
        assert!(matches!(
            sort32(10, &readback, &mut ordering),
            Err(Error::InvalidBuffer { needed, .. }) if needed == ORDERING_ROW
        ));
    }

    #[test]
    fn test_sort32_partial_count() {
        // Only the first num_splats entries participate
        let readback = vec![3u32, 7, 1, 100, 200];
        let mut ordering = vec![0u32; ORDERING_ROW];
        let active = sort32(3, &readback, &mut ordering).unwrap();
        assert_eq!(active, 3);
        assert_eq!(&ordering[..3], &[1, 0, 2]);
    }

    #[test]
    fn test_sort16_matches_semantics() {
        let readback = vec![5u16, 0, 9, 1, 9, 3];
        let mut ordering = vec![0u32; ORDERING_ROW];
        let active = sort16(readback.len(), &readback, &mut ordering).unwrap();
        assert_eq!(active, 5);
        assert_eq!(&ordering[..5], &[2, 4, 0, 5, 3]);
    }

    #[test]
    fn test_sort_empty() {
        let mut ordering = vec![0u32; 0];
        assert_eq!(sort32(0, &[], &mut ordering).unwrap(), 0);
    }
}
