//! Back-to-front ordering table
//!
//! CPU mirror of the ordering texture the rasterizer samples. Capacity
//! only ever grows, in whole rows; within capacity the table updates in
//! place, beyond it the storage is recreated. The version records which
//! composition the permutation was sorted against; the content is only
//! valid while that composition is displayed.

use crate::sort::radix::{ordering_capacity, ORDERING_ROW};

/// The ordering table state.
#[derive(Default)]
pub struct OrderingTable {
    data: Vec<u32>,
    active: u32,
    version: u64,
    /// Storage generation; bumps when capacity is exceeded
    generation: u32,
}

impl OrderingTable {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn active(&self) -> u32 {
        self.active
    }

    /// Composition version the current content was sorted against.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    /// Install a completed sort. `ordering` is row-padded already.
    pub fn update(&mut self, ordering: &[u32], active: u32, version: u64) {
        debug_assert_eq!(ordering.len() % ORDERING_ROW, 0);
        let needed = ordering_capacity(active as usize);
        if needed > self.data.len() {
            self.data = ordering.to_vec();
            self.generation += 1;
        } else {
            self.data[..ordering.len()].copy_from_slice(ordering);
        }
        self.active = active;
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_grows_in_rows_and_monotonically() {
        let mut table = OrderingTable::default();
        assert_eq!(table.capacity(), 0);

        table.update(&vec![0; ORDERING_ROW], 100, 1);
        assert_eq!(table.capacity(), ORDERING_ROW);
        assert_eq!(table.generation(), 1);

        // Within capacity: in place, same storage generation
        table.update(&vec![0; ORDERING_ROW], 200, 2);
        assert_eq!(table.generation(), 1);
        assert_eq!(table.version(), 2);

        // Beyond capacity: recreated, still a row multiple
        table.update(&vec![0; 2 * ORDERING_ROW], ORDERING_ROW as u32 + 5, 3);
        assert_eq!(table.generation(), 2);
        assert_eq!(table.capacity(), 2 * ORDERING_ROW);
        assert_eq!(table.capacity() % ORDERING_ROW, 0);
    }
}
