use std::collections::BTreeMap;

/// A set of `u64` values stored as disjoint, non-adjacent half-open ranges. Used for stream
/// offsets (sent, acknowledged, received) and for received packet numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        RangeSet { ranges: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn insert(&mut self, mut start: u64, mut end: u64) {
        if start >= end {
            return;
        }

        if let Some((&prev_start, &prev_end)) = self.ranges.range(..=start).next_back() {
            if prev_end >= start {
                start = prev_start;
                end = end.max(prev_end);
            }
        }

        let absorbed: Vec<(u64, u64)> = self.ranges
            .range(start..=end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in absorbed {
            self.ranges.remove(&s);
            end = end.max(e);
        }

        self.ranges.insert(start, end);
    }

    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let overlapping: Vec<(u64, u64)> = self.ranges
            .range(..end)
            .rev()
            .take_while(|(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
    }

    /// If `pos` is in the set, the end of the range containing it.
    pub fn covering(&self, pos: u64) -> Option<u64> {
        match self.ranges.range(..=pos).next_back() {
            Some((_, &e)) if e > pos => Some(e),
            _ => None,
        }
    }

    pub fn contains(&self, pos: u64) -> bool {
        self.covering(pos).is_some()
    }

    /// Whether every value in `start..end` is in the set.
    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        start >= end || self.covering(start).map_or(false, |e| e >= end)
    }

    /// Start of the first range beginning strictly after `pos`.
    pub fn next_start_after(&self, pos: u64) -> Option<u64> {
        self.ranges.range(pos.saturating_add(1)..).next().map(|(&s, _)| s)
    }

    /// End of the run of values beginning at `from`, or `from` itself when `from` is absent.
    pub fn contiguous_from(&self, from: u64) -> u64 {
        self.covering(from).unwrap_or(from)
    }

    pub fn min(&self) -> Option<u64> {
        self.ranges.keys().next().copied()
    }

    /// One past the largest value in the set.
    pub fn max_end(&self) -> Option<u64> {
        self.ranges.values().next_back().copied()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    /// Drops the lowest ranges until at most `max` remain.
    pub fn truncate_low(&mut self, max: usize) {
        while self.ranges.len() > max {
            let first = *self.ranges.keys().next().unwrap_or(&0);
            self.ranges.remove(&first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RangeSet;

    fn ranges(set: &RangeSet) -> Vec<(u64, u64)> {
        set.iter().collect()
    }

    #[test]
    fn insert_merges_overlapping_and_adjacent() {
        let mut set = RangeSet::new();
        set.insert(10, 20);
        set.insert(30, 40);
        set.insert(20, 25);
        assert_eq!(ranges(&set), vec![(10, 25), (30, 40)]);
        set.insert(5, 35);
        assert_eq!(ranges(&set), vec![(5, 40)]);
        set.insert(0, 0);
        assert_eq!(ranges(&set), vec![(5, 40)]);
    }

    #[test]
    fn remove_splits() {
        let mut set = RangeSet::new();
        set.insert(0, 100);
        set.remove(10, 20);
        set.remove(50, 60);
        assert_eq!(ranges(&set), vec![(0, 10), (20, 50), (60, 100)]);
        set.remove(5, 70);
        assert_eq!(ranges(&set), vec![(0, 5), (70, 100)]);
        set.remove(0, 200);
        assert!(set.is_empty());
    }

    #[test]
    fn lookups() {
        let mut set = RangeSet::new();
        set.insert(0, 5);
        set.insert(10, 15);
        assert_eq!(set.covering(3), Some(5));
        assert_eq!(set.covering(5), None);
        assert!(set.contains_range(10, 15));
        assert!(!set.contains_range(3, 11));
        assert_eq!(set.next_start_after(0), Some(10));
        assert_eq!(set.next_start_after(10), None);
        assert_eq!(set.contiguous_from(0), 5);
        assert_eq!(set.contiguous_from(7), 7);
        assert_eq!(set.max_end(), Some(15));
    }

    #[test]
    fn truncate_low_keeps_newest() {
        let mut set = RangeSet::new();
        for i in 0..5 {
            set.insert(i * 10, i * 10 + 1);
        }
        set.truncate_low(2);
        assert_eq!(ranges(&set), vec![(30, 31), (40, 41)]);
    }
}
