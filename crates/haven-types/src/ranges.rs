/// Acknowledged-chunk tracking as a list of coalesced half-open ranges.
///
/// ```text
/// acked: 0 1 2 3 . . 6 7 8 . 10
/// set:   [0, 4) [6, 9) [10, 11)
/// ```
///
/// Ranges are sorted, never overlap and never touch: inserting `4` and `5`
/// above would collapse the first two ranges into `[0, 9)`. A transfer that
/// is mostly in order therefore stays at one or two ranges no matter how
/// many chunks it has, which keeps ACK frames and persisted records small.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(u32, u32)>", into = "Vec<(u32, u32)>")]
pub struct RangeSet {
    ranges: Vec<(u32, u32)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding every sequence number in `[0, total)`.
    pub fn full(total: u32) -> Self {
        let mut set = Self::new();
        set.insert_range(0, total);
        set
    }

    /// Mark a single sequence number. Returns true if it was not already present.
    #[inline]
    pub fn insert(&mut self, seq: u32) -> bool {
        self.insert_range(seq, seq.saturating_add(1)) == 1
    }

    /// Mark `[start, end)`. Returns how many sequence numbers were newly added.
    pub fn insert_range(&mut self, start: u32, end: u32) -> u64 {
        if start >= end {
            return 0;
        }
        let before = self.len();

        // Everything in lo..hi overlaps or touches the new range.
        let lo = self.ranges.partition_point(|&(_, e)| e < start);
        let hi = self.ranges.partition_point(|&(s, _)| s <= end);

        if lo == hi {
            self.ranges.insert(lo, (start, end));
        } else {
            let merged = (start.min(self.ranges[lo].0), end.max(self.ranges[hi - 1].1));
            self.ranges.drain(lo + 1..hi);
            self.ranges[lo] = merged;
        }

        self.len() - before
    }

    /// Merge every range of `other` into `self`. Returns true if anything changed.
    pub fn merge(&mut self, other: &RangeSet) -> bool {
        let mut added = 0;
        for &(s, e) in &other.ranges {
            added += self.insert_range(s, e);
        }
        added > 0
    }

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn intersection(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a_s, a_e) = self.ranges[i];
            let (b_s, b_e) = other.ranges[j];
            let s = a_s.max(b_s);
            let e = a_e.min(b_e);
            if s < e {
                out.push((s, e));
            }
            if a_e < b_e {
                i += 1;
            } else {
                j += 1;
            }
        }
        RangeSet { ranges: out }
    }

    pub fn contains(&self, seq: u32) -> bool {
        let idx = self.ranges.partition_point(|&(_, e)| e <= seq);
        self.ranges.get(idx).is_some_and(|&(s, _)| s <= seq)
    }

    /// Number of sequence numbers in the set.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|&(s, e)| (e - s) as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True when every sequence in `[0, total)` is present.
    pub fn is_complete(&self, total: u32) -> bool {
        total == 0 || self.ranges.first().is_some_and(|&(s, e)| s == 0 && e >= total)
    }

    /// Length of the run starting at zero.
    pub fn contiguous_prefix(&self) -> u32 {
        match self.ranges.first() {
            Some(&(0, e)) => e,
            _ => 0,
        }
    }

    /// Lowest sequence in `[0, total)` that is not present.
    pub fn first_missing(&self, total: u32) -> Option<u32> {
        let prefix = self.contiguous_prefix();
        (prefix < total).then_some(prefix)
    }

    /// Complement of the set within `[0, total)`.
    pub fn missing(&self, total: u32) -> RangeSet {
        let mut out = Vec::new();
        let mut cursor = 0u32;
        for &(s, e) in &self.ranges {
            if s >= total {
                break;
            }
            if s > cursor {
                out.push((cursor, s));
            }
            cursor = e;
        }
        if cursor < total {
            out.push((cursor, total));
        }
        RangeSet { ranges: out }
    }

    /// Copy holding at most the first `max` ranges.
    pub fn truncated(&self, max: usize) -> RangeSet {
        RangeSet {
            ranges: self.ranges.iter().take(max).copied().collect(),
        }
    }

    /// The ranges as `(start, end_exclusive)` pairs, lowest first.
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Every sequence number in the set, ascending.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(s, e)| s..e)
    }
}

impl From<Vec<(u32, u32)>> for RangeSet {
    fn from(pairs: Vec<(u32, u32)>) -> Self {
        let mut set = RangeSet::new();
        for (s, e) in pairs {
            set.insert_range(s, e);
        }
        set
    }
}

impl From<RangeSet> for Vec<(u32, u32)> {
    fn from(set: RangeSet) -> Self {
        set.ranges
    }
}

impl FromIterator<u32> for RangeSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for seq in iter {
            set.insert(seq);
        }
        set
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|&(s, e)| {
                if e - s == 1 {
                    s.to_string()
                } else {
                    format!("{}-{}", s, e - 1)
                }
            })
            .collect();
        write!(f, "[{}]", parts.join(","))
    }
}
