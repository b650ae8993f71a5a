use std::fmt::{Display, Formatter};
use std::ops::Range;

use logvol_error::{LogVolResult, logvol_err};

/// A half-open range of absolute byte offsets in the underlying container.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub begin: u64,
    pub end: u64,
}

impl Display for ByteRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

impl ByteRange {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end, "Range begin must not be after its end");
        Self { begin, end }
    }

    pub fn with_len(begin: u64, len: u64) -> Self {
        Self::new(begin, begin + len)
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn to_range(&self) -> LogVolResult<Range<usize>> {
        Ok(Range {
            start: usize::try_from(self.begin)
                .map_err(|_| logvol_err!("range start {} too big for usize", self.begin))?,
            end: usize::try_from(self.end)
                .map_err(|_| logvol_err!("range end {} too big for usize", self.end))?,
        })
    }
}

/// Merge ranges whose gap is at most `max_gap` bytes into a sorted, non-overlapping list.
///
/// Empty ranges are dropped.
pub fn coalesce_ranges(mut ranges: Vec<ByteRange>, max_gap: u64) -> Vec<ByteRange> {
    ranges.retain(|r| !r.is_empty());
    if ranges.is_empty() {
        return Vec::new();
    }

    ranges.sort_unstable_by_key(|r| r.begin);
    let mut merged_ranges: Vec<ByteRange> = Vec::with_capacity(ranges.len());

    let mut start_idx = 0;
    let mut end_idx = 1;

    while start_idx < ranges.len() {
        let mut range_end = ranges[start_idx].end;

        while end_idx < ranges.len()
            && ranges[end_idx]
                .begin
                .checked_sub(range_end)
                .is_none_or(|gap| gap <= max_gap)
        {
            range_end = range_end.max(ranges[end_idx].end);
            end_idx += 1;
        }

        merged_ranges.push(ByteRange::new(ranges[start_idx].begin, range_end));
        start_idx = end_idx;
        end_idx += 1;
    }

    merged_ranges
}
