//! Dirty range tracking

/// One closed interval of bytes, `first` and `last` inclusive.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Span {
    pub first: u64,
    pub last: u64,
}

impl Span {
    /// The "nothing here" value returned by queries that found no intersection.
    pub const NONE: Self = Self { first: 0, last: 0 };

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    pub fn bytes(self) -> u64 {
        1 + self.last - self.first
    }
}

/// Monotonically ordered list of disjoint closed intervals.
///
/// Neighboring intervals are always merged, so after any mutation
/// `a.last + 1 < b.first` holds for each adjacent pair.
#[derive(Clone, Debug, Default)]
pub struct RangeSet {
    spans: Vec<Span>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add by offset and size.
    pub fn add_os(&mut self, offset: u64, size: u64) {
        if size > 0 {
            self.add(offset, offset + size - 1);
        }
    }

    /// Insert `[start, end]`, merging with any touching or overlapping interval.
    pub fn add(&mut self, start: u64, end: u64) {
        assert!(start <= end);
        if end == 0 {
            return;
        }

        // First interval that could merge with us: anything whose end reaches
        // to at least one byte before our start.
        let lo = self
            .spans
            .partition_point(|s| start > 0 && s.last < start - 1);
        // One past the last interval that could merge with us.
        let hi = self.spans.partition_point(|s| s.first <= end.saturating_add(1));

        if lo == hi {
            self.spans.insert(lo, Span { first: start, last: end });
            return;
        }

        let first = self.spans[lo].first.min(start);
        let last = self.spans[hi - 1].last.max(end);
        self.spans.splice(lo..hi, [Span { first, last }]);
    }

    /// Fetch by offset and size, see [`Self::fetch`].
    pub fn fetch_os(&mut self, offset: u64, size: u64, keep: bool) -> Span {
        self.fetch(offset, offset + size - 1, keep)
    }

    /// Return the minimal interval inside `[start, end]` covering every
    /// intersected element, or [`Span::NONE`] if nothing intersects.
    ///
    /// With `keep` false the queried region is subtracted from the set,
    /// splitting an interval in two when the query is fully enclosed by it.
    pub fn fetch(&mut self, start: u64, end: u64, keep: bool) -> Span {
        let mut found: Option<Span> = None;
        let mut i = 0;
        while i < self.spans.len() {
            let s = self.spans[i];
            if s.first > end {
                break;
            }
            if s.last < start {
                i += 1;
                continue;
            }

            let hit = Span {
                first: s.first.max(start),
                last: s.last.min(end),
            };
            found = Some(match found {
                Some(f) => Span {
                    first: f.first.min(hit.first),
                    last: f.last.max(hit.last),
                },
                None => hit,
            });

            if keep {
                i += 1;
            } else if s.first >= start && s.last <= end {
                // consumed entirely
                self.spans.remove(i);
            } else if s.first < start && s.last > end {
                // split in two
                self.spans[i].last = start - 1;
                self.spans.insert(i + 1, Span { first: end + 1, last: s.last });
                i += 2;
            } else if s.first >= start {
                // remove from the front of the interval
                self.spans[i].first = end + 1;
                i += 1;
            } else {
                // remove from the back of the interval
                self.spans[i].last = start - 1;
                i += 1;
            }
        }

        found.unwrap_or(Span::NONE)
    }

    /// Cheap overlap test against another set, optionally offsetting `other`.
    pub fn overlap(&self, other: &RangeSet, offset: u64) -> Span {
        if self.spans.is_empty() || other.spans.is_empty() {
            return Span::NONE;
        }

        let first = (other.spans[0].first + offset).max(self.spans[0].first);
        let last = (other.spans.last().unwrap().last + offset).min(self.spans.last().unwrap().last);
        if first > last {
            return Span::NONE;
        }

        Span { first, last }
    }

    /// Span covering all contained elements.
    pub fn span(&self) -> Span {
        if self.spans.is_empty() {
            return Span::NONE;
        }

        Span {
            first: self.spans[0].first,
            last: self.spans.last().unwrap().last,
        }
    }

    /// Total number of bytes covered.
    pub fn bytes(&self) -> u64 {
        self.spans.iter().map(|s| s.bytes()).sum()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = Span> + '_ {
        self.spans.iter().copied()
    }

    /// Asserts monotonicity and `first <= last` for every interval.
    pub fn self_test(&self) {
        let mut prev: Option<u64> = None;
        for s in &self.spans {
            assert!(s.first <= s.last);
            if let Some(p) = prev {
                assert!(p + 1 < s.first, "touching intervals must have been merged");
            }
            prev = Some(s.last);
        }
    }
}
