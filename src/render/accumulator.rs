//! Rotating splat accumulators
//!
//! An accumulator is one composed display set: the ordered per-object
//! spans of the concatenated index tables, the active splat count, and
//! the versions that tie it to a sort ordering. Three rotate so
//! composition can proceed while the displayed set keeps rendering and
//! an earlier composition waits for its sort.
//!
//! The mapping version bumps only when the span layout changes; a
//! recomposition with an identical layout keeps the displayed set's
//! mapping version and can swap in immediately, reusing the existing
//! ordering.

use std::collections::VecDeque;

use crate::cache::pool::ObjectId;

/// One object's span within the composed display set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectSpan {
    pub object: ObjectId,
    /// First slot in the composed table
    pub base: u32,
    pub count: u32,
}

/// One composed display set.
#[derive(Clone, Debug, Default)]
pub struct Accumulator {
    pub layout: Vec<ObjectSpan>,
    pub active_count: u32,
    pub mapping_version: u64,
    pub composition_version: u64,
}

/// What a composition did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeOutcome {
    /// Same mapping as displayed: swapped in immediately, the existing
    /// sort ordering remains valid
    Swapped,
    /// New mapping: held as current until its sort completes
    AwaitingSort,
}

/// Three rotating accumulators: one displayed, up to two queued behind
/// sorts, the rest free.
pub struct AccumulatorSet {
    slots: [Accumulator; 3],
    free: Vec<usize>,
    displayed: Option<usize>,
    /// Compositions awaiting sort, oldest first; a later one never
    /// supersedes an earlier one whose sort has not begun
    pending: VecDeque<usize>,
    next_mapping: u64,
    next_composition: u64,
}

impl Default for AccumulatorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AccumulatorSet {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            free: vec![0, 1, 2],
            displayed: None,
            pending: VecDeque::new(),
            next_mapping: 0,
            next_composition: 0,
        }
    }

    pub fn displayed(&self) -> Option<&Accumulator> {
        self.displayed.map(|slot| &self.slots[slot])
    }

    /// Oldest composition still waiting for its sort.
    pub fn awaiting_sort(&self) -> Option<&Accumulator> {
        self.pending.front().map(|&slot| &self.slots[slot])
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    /// Compose a new display set from per-object counts (in draw
    /// order). Returns `None` when no accumulator is free, i.e. two
    /// compositions are already queued behind sorts.
    pub fn compose(&mut self, sources: &[(ObjectId, u32)]) -> Option<ComposeOutcome> {
        let slot = self.free.pop()?;

        let mut layout = Vec::with_capacity(sources.len());
        let mut base = 0;
        for &(object, count) in sources {
            layout.push(ObjectSpan { object, base, count });
            base += count;
        }

        let same_mapping = self
            .displayed()
            .is_some_and(|displayed| displayed.layout == layout);
        let mapping_version = if same_mapping {
            self.displayed().unwrap().mapping_version
        } else {
            self.next_mapping += 1;
            self.next_mapping
        };
        self.next_composition += 1;

        self.slots[slot] = Accumulator {
            layout,
            active_count: base,
            mapping_version,
            composition_version: self.next_composition,
        };

        if same_mapping && self.pending.is_empty() {
            if let Some(old) = self.displayed.replace(slot) {
                self.free.push(old);
            }
            Some(ComposeOutcome::Swapped)
        } else {
            self.pending.push_back(slot);
            Some(ComposeOutcome::AwaitingSort)
        }
    }

    /// Swap the oldest pending composition in as displayed, once its
    /// ordering is in place.
    pub fn promote(&mut self) -> Option<&Accumulator> {
        let slot = self.pending.pop_front()?;
        if let Some(old) = self.displayed.replace(slot) {
            self.free.push(old);
        }
        Some(&self.slots[slot])
    }

    /// Abandon the oldest pending composition (its sort became moot).
    pub fn discard_pending(&mut self) {
        if let Some(slot) = self.pending.pop_front() {
            self.free.push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_composition_awaits_sort() {
        let mut set = AccumulatorSet::new();
        let outcome = set.compose(&[(1, 100), (2, 50)]).unwrap();
        assert_eq!(outcome, ComposeOutcome::AwaitingSort);
        assert!(set.displayed().is_none());

        let displayed = set.promote().unwrap();
        assert_eq!(displayed.active_count, 150);
        assert_eq!(displayed.layout[1].base, 100);
    }

    #[test]
    fn test_same_mapping_swaps_immediately() {
        let mut set = AccumulatorSet::new();
        set.compose(&[(1, 100)]).unwrap();
        set.promote().unwrap();
        let first_mapping = set.displayed().unwrap().mapping_version;
        let first_composition = set.displayed().unwrap().composition_version;

        let outcome = set.compose(&[(1, 100)]).unwrap();
        assert_eq!(outcome, ComposeOutcome::Swapped);
        let displayed = set.displayed().unwrap();
        assert_eq!(displayed.mapping_version, first_mapping);
        assert!(displayed.composition_version > first_composition);
    }

    #[test]
    fn test_changed_mapping_waits() {
        let mut set = AccumulatorSet::new();
        set.compose(&[(1, 100)]).unwrap();
        set.promote().unwrap();

        let outcome = set.compose(&[(1, 120)]).unwrap();
        assert_eq!(outcome, ComposeOutcome::AwaitingSort);
        // Displayed is unchanged until promote
        assert_eq!(set.displayed().unwrap().active_count, 100);
        set.promote().unwrap();
        assert_eq!(set.displayed().unwrap().active_count, 120);
    }

    #[test]
    fn test_pending_queue_preserves_order() {
        let mut set = AccumulatorSet::new();
        set.compose(&[(1, 10)]).unwrap();
        set.compose(&[(1, 20)]).unwrap();
        set.compose(&[(1, 30)]).unwrap();
        // All three slots are queued behind sorts now
        assert!(set.compose(&[(1, 40)]).is_none());

        assert_eq!(set.awaiting_sort().unwrap().active_count, 10);
        set.promote().unwrap();
        assert_eq!(set.awaiting_sort().unwrap().active_count, 20);
    }

    #[test]
    fn test_discard_pending_frees_slot() {
        let mut set = AccumulatorSet::new();
        set.compose(&[(1, 10)]).unwrap();
        set.discard_pending();
        assert!(set.awaiting_sort().is_none());
        assert!(set.has_free());
    }
}
