//! Byte-range segments of a job's content and range planning.

use serde::{Deserialize, Serialize};

use super::transport::ByteRange;

/// One byte range `[start, end)` of a job's content.
///
/// Segment bounds are fixed at planning time; only `written` moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (exclusive).
    pub end: u64,
    /// Bytes of this range already on disk, counted from `start`.
    #[serde(default)]
    pub written: u64,
}

impl Segment {
    /// Creates an empty segment for `[start, end)`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            written: 0,
        }
    }

    /// Length of this segment in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the segment covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every byte of the range is on disk.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.written >= self.len()
    }

    /// Absolute offset of the next byte to fetch.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.start + self.written.min(self.len())
    }

    /// Range still missing, `None` once complete.
    #[must_use]
    pub fn remaining(&self) -> Option<ByteRange> {
        (!self.is_complete()).then(|| ByteRange::bounded(self.cursor(), self.end))
    }
}

/// Splits `[0, total_size)` into `count` contiguous near-equal segments.
///
/// The first `total_size % count` segments are one byte longer. The count is
/// clamped to `total_size` so no segment is empty; returns an empty plan when
/// either argument is zero.
#[must_use]
pub fn plan_segments(total_size: u64, count: usize) -> Vec<Segment> {
    if total_size == 0 || count == 0 {
        return Vec::new();
    }

    let count = (count as u64).min(total_size);
    let base = total_size / count;
    let remainder = total_size % count;

    let mut out = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
    let mut offset = 0u64;
    for i in 0..count {
        let len = base + u64::from(i < remainder);
        out.push(Segment::new(offset, offset + len));
        offset += len;
    }
    out
}

/// Checks that `segments` partition `[0, total_size)` with no gap or overlap.
#[must_use]
pub fn is_partition(segments: &[Segment], total_size: u64) -> bool {
    let mut offset = 0u64;
    for segment in segments {
        if segment.start != offset || segment.end < segment.start {
            return false;
        }
        offset = segment.end;
    }
    offset == total_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_even_split() {
        let segs = plan_segments(1000, 4);
        assert_eq!(
            segs,
            vec![
                Segment::new(0, 250),
                Segment::new(250, 500),
                Segment::new(500, 750),
                Segment::new(750, 1000),
            ]
        );
    }

    #[test]
    fn test_plan_remainder_goes_to_leading_segments() {
        let segs = plan_segments(10, 4);
        let lens: Vec<u64> = segs.iter().map(Segment::len).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
        assert!(is_partition(&segs, 10));
    }

    #[test]
    fn test_plan_count_clamped_to_size() {
        let segs = plan_segments(3, 8);
        assert_eq!(segs.len(), 3);
        assert!(segs.iter().all(|s| s.len() == 1));
    }

    #[test]
    fn test_plan_degenerate_inputs() {
        assert!(plan_segments(0, 4).is_empty());
        assert!(plan_segments(100, 0).is_empty());
        assert!(is_partition(&[], 0));
    }

    #[test]
    fn test_plans_always_partition() {
        for total in [1u64, 7, 1024, 10 * 1024 * 1024 + 3] {
            for count in 1..=16 {
                let segs = plan_segments(total, count);
                assert!(is_partition(&segs, total), "total={total} count={count}");
            }
        }
    }

    #[test]
    fn test_partition_detects_gap_and_overlap() {
        let gap = [Segment::new(0, 10), Segment::new(11, 20)];
        assert!(!is_partition(&gap, 20));
        let overlap = [Segment::new(0, 10), Segment::new(9, 20)];
        assert!(!is_partition(&overlap, 20));
        let short = [Segment::new(0, 10)];
        assert!(!is_partition(&short, 20));
    }

    #[test]
    fn test_remaining_tracks_written() {
        let mut seg = Segment::new(100, 200);
        assert_eq!(seg.remaining(), Some(ByteRange::bounded(100, 200)));
        seg.written = 40;
        assert_eq!(seg.cursor(), 140);
        assert_eq!(seg.remaining(), Some(ByteRange::bounded(140, 200)));
        seg.written = 100;
        assert!(seg.is_complete());
        assert_eq!(seg.remaining(), None);
    }
}
