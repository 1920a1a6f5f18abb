//! Accepted key range sets.

use dot_proto::keys::{self, KeyCode, KeyRange};

/// An ordered set of disjoint, non-adjacent inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRangeSet {
    ranges: Vec<KeyRange>,
}

impl KeyRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every code.
    pub fn full() -> Self {
        Self {
            ranges: vec![KeyRange::FULL],
        }
    }

    /// Every code except the commands the owning application keeps for
    /// itself.
    pub fn without_reserved() -> Self {
        let mut set = Self::full();
        for range in keys::RESERVED_COMMANDS {
            set.remove(range);
        }
        set
    }

    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, code: KeyCode) -> bool {
        let idx = self.ranges.partition_point(|r| r.last < code);
        self.ranges.get(idx).is_some_and(|r| r.contains(code))
    }

    pub fn add(&mut self, range: KeyRange) {
        let mut first = range.first;
        let mut last = range.last;
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for r in self.ranges.drain(..) {
            if r.last.saturating_add(1) < first {
                merged.push(r);
            } else if last.saturating_add(1) < r.first {
                if !placed {
                    merged.push(KeyRange::new(first, last));
                    placed = true;
                }
                merged.push(r);
            } else {
                first = first.min(r.first);
                last = last.max(r.last);
            }
        }
        if !placed {
            merged.push(KeyRange::new(first, last));
        }
        self.ranges = merged;
    }

    pub fn remove(&mut self, range: KeyRange) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.last < range.first || r.first > range.last {
                kept.push(r);
                continue;
            }
            if r.first < range.first {
                kept.push(KeyRange::new(r.first, range.first - 1));
            }
            if r.last > range.last {
                kept.push(KeyRange::new(range.last + 1, r.last));
            }
        }
        self.ranges = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dot_proto::keys::{blk, cmd, command};

    #[test]
    fn add_merges_overlapping_and_adjacent() {
        let mut set = KeyRangeSet::new();
        set.add(KeyRange::new(10, 20));
        set.add(KeyRange::new(30, 40));
        set.add(KeyRange::new(21, 29));
        assert_eq!(set.ranges(), &[KeyRange::new(10, 40)]);

        set.add(KeyRange::new(0, 5));
        set.add(KeyRange::new(3, 12));
        assert_eq!(set.ranges(), &[KeyRange::new(0, 40)]);
    }

    #[test]
    fn remove_splits() {
        let mut set = KeyRangeSet::full();
        set.remove(KeyRange::new(100, 200));
        assert!(set.contains(99));
        assert!(!set.contains(100));
        assert!(!set.contains(200));
        assert!(set.contains(201));
        assert!(set.contains(u64::MAX));
        assert_eq!(set.ranges().len(), 2);
    }

    #[test]
    fn full_range_edges() {
        let mut set = KeyRangeSet::new();
        set.add(KeyRange::new(u64::MAX, u64::MAX));
        set.add(KeyRange::new(0, u64::MAX - 1));
        assert_eq!(set, KeyRangeSet::full());

        set.remove(KeyRange::FULL);
        assert!(set.is_empty());
    }

    #[test]
    fn reserved_commands_are_excluded() {
        let set = KeyRangeSet::without_reserved();
        assert!(!set.contains(command(blk::BASIC, cmd::OFFLINE)));
        assert!(!set.contains(command(blk::BASIC, cmd::NOOP) | 0x10));
        assert!(!set.contains(command(blk::PASSXT, 0x1c)));
        assert!(set.contains(command(blk::BASIC, cmd::LNUP)));
        assert!(set.contains(command(blk::PASSDOTS, 0x07)));
        assert!(set.contains(0));
    }
}
