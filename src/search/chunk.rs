//! Range and chunk model.
//!
//! Raw match offsets are turned into [`Range`]s (line and rune column aware),
//! grouped into [`RangeChunk`]s of nearby ranges, and finally materialised as
//! [`ChunkMatch`]es whose content is an owned copy of the context-expanded
//! lines.

use crate::protocol::{ChunkMatch, Location, Range};
use memchr::{memchr, memchr_iter, memrchr};

/// A group of ranges close enough to be displayed together.
///
/// `cover` spans from the start of the first range to the furthest end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeChunk {
    pub cover: Range,
    pub ranges: Vec<Range>,
}

/// Group ranges into chunks. Ranges are sorted by start offset; a range joins
/// the previous chunk when it starts no more than `inter_chunk_lines` lines
/// after that chunk ends.
pub fn chunk_ranges(mut ranges: Vec<Range>, inter_chunk_lines: u32) -> Vec<RangeChunk> {
    ranges.sort_by_key(|r| r.start.offset);

    let mut chunks: Vec<RangeChunk> = Vec::new();
    for rr in ranges {
        if let Some(last) = chunks.last_mut() {
            if last.cover.end.line.saturating_add(inter_chunk_lines) >= rr.start.line {
                if rr.end.offset > last.cover.end.offset {
                    last.cover.end = rr.end;
                }
                last.ranges.push(rr);
                continue;
            }
        }
        chunks.push(RangeChunk {
            cover: rr,
            ranges: vec![rr],
        });
    }
    chunks
}

/// Materialise chunks as owned [`ChunkMatch`]es, widening each to full lines
/// plus `context_lines` on either side. Invalid UTF-8 is replaced.
pub fn chunks_to_matches(buf: &[u8], chunks: Vec<RangeChunk>, context_lines: u32) -> Vec<ChunkMatch> {
    chunks
        .into_iter()
        .map(|chunk| {
            let with_context =
                add_context_lines(extend_range_to_lines(chunk.cover, buf), buf, context_lines);
            let start = with_context.start.offset as usize;
            let end = with_context.end.offset as usize;
            ChunkMatch {
                content: String::from_utf8_lossy(&buf[start..end]).into_owned(),
                content_start: with_context.start,
                ranges: chunk.ranges,
            }
        })
        .collect()
}

/// Convert sorted, non-overlapping `(start, end)` byte offsets into ranges.
///
/// Line numbers are tracked cumulatively from the previous match so the buffer
/// is scanned once overall, not once per match.
pub fn locs_to_ranges(buf: &[u8], locs: &[(usize, usize)]) -> Vec<Range> {
    let mut ranges = Vec::with_capacity(locs.len());
    let mut columns = ColumnHelper::new(buf);

    let mut prev_end = 0usize;
    let mut prev_end_line = 0u32;
    for &(start, end) in locs {
        let start_line = prev_end_line + count_newlines(&buf[prev_end.min(start)..start]);
        let end_line = start_line + count_newlines(&buf[start..end]);

        let start_column = columns.get(line_start(buf, start), start);
        let end_column = columns.get(line_start(buf, end), end);

        ranges.push(Range::new(
            Location::new(start as u32, start_line, start_column),
            Location::new(end as u32, end_line, end_column),
        ));

        prev_end = end;
        prev_end_line = end_line;
    }
    ranges
}

/// Widen a range to cover whole lines.
///
/// The end is pushed to the next newline at or after `end.offset`, so a range
/// ending exactly at a line start (including a zero-width range there) is
/// extended over that following line.
pub fn extend_range_to_lines(range: Range, buf: &[u8]) -> Range {
    let first_line_start = line_start(buf, range.start.offset as usize);
    let last_line_start = line_start(buf, range.end.offset as usize);
    let last_line_end = line_end(buf, range.end.offset as usize);
    Range::new(
        Location::new(first_line_start as u32, range.start.line, 0),
        Location::new(
            last_line_end as u32,
            range.end.line,
            rune_count(&buf[last_line_start..last_line_end]),
        ),
    )
}

/// Add up to `n` lines before and after a line-aligned range, stopping at the
/// buffer bounds. A trailing newline at end of file does not open a new line.
pub fn add_context_lines(range: Range, buf: &[u8], n: u32) -> Range {
    let mut first_line_start = range.start.offset as usize;
    let mut last_line_end = range.end.offset as usize;
    let mut preceding = 0u32;
    let mut succeeding = 0u32;

    for _ in 0..n {
        if first_line_start > 0 {
            first_line_start = line_start(buf, first_line_start - 1);
            preceding += 1;
        }
        if last_line_end + 1 < buf.len() {
            last_line_end = line_end(buf, last_line_end + 1);
            succeeding += 1;
        }
    }

    Range::new(
        Location::new(
            first_line_start as u32,
            range.start.line.saturating_sub(preceding),
            0,
        ),
        Location::new(
            last_line_end as u32,
            range.end.line + succeeding,
            rune_count(&buf[line_start(buf, last_line_end)..last_line_end]),
        ),
    )
}

/// Offset of the first byte of the line containing `offset`.
pub fn line_start(buf: &[u8], offset: usize) -> usize {
    memrchr(b'\n', &buf[..offset]).map_or(0, |i| i + 1)
}

/// Offset of the newline terminating the line containing `offset`, or the
/// buffer length.
pub fn line_end(buf: &[u8], offset: usize) -> usize {
    memchr(b'\n', &buf[offset..]).map_or(buf.len(), |i| offset + i)
}

fn count_newlines(buf: &[u8]) -> u32 {
    memchr_iter(b'\n', buf).count() as u32
}

/// Number of runes in `buf`. Invalid bytes count as one rune each, which
/// keeps the count additive over any split point.
pub fn rune_count(buf: &[u8]) -> u32 {
    buf.iter().filter(|&&b| (b & 0xC0) != 0x80).count() as u32
}

/// Incremental rune column computation.
///
/// Remembers the last `(line_offset, offset)` query; a forward query on the
/// same line only counts the new bytes, anything else recounts from the start
/// of the line.
pub struct ColumnHelper<'a> {
    data: &'a [u8],
    last_line_offset: usize,
    last_offset: usize,
    last_rune_count: u32,
}

impl<'a> ColumnHelper<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            last_line_offset: 0,
            last_offset: 0,
            last_rune_count: 0,
        }
    }

    pub fn get(&mut self, line_offset: usize, offset: usize) -> u32 {
        let (from, base) = if line_offset == self.last_line_offset && offset >= self.last_offset {
            (self.last_offset, self.last_rune_count)
        } else {
            (line_offset, 0)
        };
        let count = base + rune_count(&self.data[from..offset]);

        self.last_line_offset = line_offset;
        self.last_offset = offset;
        self.last_rune_count = count;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(offset: u32, line: u32, column: u32) -> Location {
        Location::new(offset, line, column)
    }

    fn line_range(start_line: u32, end_line: u32, offset: u32) -> Range {
        Range::new(loc(offset, start_line, 0), loc(offset + 1, end_line, 1))
    }

    #[test]
    fn test_chunk_ranges_merges_adjacent_lines() {
        let ranges = vec![
            line_range(5, 5, 50),
            line_range(0, 0, 0),
            line_range(1, 1, 10),
            line_range(9, 9, 90),
        ];
        let chunks = chunk_ranges(ranges, 1);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].ranges.len(), 2);
        assert_eq!(chunks[0].cover.start.line, 0);
        assert_eq!(chunks[0].cover.end.line, 1);
        assert_eq!(chunks[1].cover.start.line, 5);
        assert_eq!(chunks[2].cover.start.line, 9);
    }

    #[test]
    fn test_chunk_ranges_gap_invariant() {
        // pseudo-random ranges; the ordering and gap invariant must hold for
        // every inter-chunk distance
        let mut seed = 7u32;
        let mut ranges = Vec::new();
        for _ in 0..200 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let line = (seed >> 8) % 500;
            let span = (seed >> 4) % 3;
            ranges.push(Range::new(
                loc(line * 10, line, 0),
                loc((line + span) * 10 + 3, line + span, 3),
            ));
        }
        for n in 0..4 {
            let chunks = chunk_ranges(ranges.clone(), n);
            let total: usize = chunks.iter().map(|c| c.ranges.len()).sum();
            assert_eq!(total, ranges.len());
            for pair in chunks.windows(2) {
                assert!(pair[0].cover.start.offset <= pair[1].cover.start.offset);
                assert!(pair[0].cover.end.line + n < pair[1].cover.start.line);
            }
        }
    }

    #[test]
    fn test_chunk_cover_takes_furthest_end() {
        let long = Range::new(loc(0, 0, 0), loc(30, 3, 0));
        let short = Range::new(loc(5, 0, 5), loc(6, 0, 6));
        let chunks = chunk_ranges(vec![short, long], 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].cover.end.offset, 30);
    }

    #[test]
    fn test_locs_to_ranges_lines_and_columns() {
        let buf = "# Hello World\n\nHello world example in go".as_bytes();
        let ranges = locs_to_ranges(buf, &[(8, 13), (21, 26)]);
        assert_eq!(ranges[0], Range::new(loc(8, 0, 8), loc(13, 0, 13)));
        assert_eq!(ranges[1], Range::new(loc(21, 2, 6), loc(26, 2, 11)));
    }

    #[test]
    fn test_locs_to_ranges_multiline_and_runes() {
        let buf = "héllo\nwörld\n".as_bytes();
        // "llo\nw" starting after the two-byte é
        let ranges = locs_to_ranges(buf, &[(3, 8)]);
        assert_eq!(ranges[0].start, loc(3, 0, 2));
        assert_eq!(ranges[0].end, loc(8, 1, 1));
    }

    #[test]
    fn test_column_helper_agrees_with_direct_count() {
        let buf = "aé€😀b\nxyz é\n".as_bytes();
        let mut helper = ColumnHelper::new(buf);
        // forward on one line
        for offset in 0..=12 {
            assert_eq!(helper.get(0, offset), rune_count(&buf[..offset]));
        }
        // arbitrary jumps, including backwards and across lines
        let queries = [(0, 12), (0, 3), (13, 17), (13, 14), (0, 1), (13, 19), (0, 12)];
        for (line, offset) in queries {
            assert_eq!(helper.get(line, offset), rune_count(&buf[line..offset]));
        }
    }

    #[test]
    fn test_extend_range_to_lines() {
        let buf = b"first\nsecond line\nthird";
        let r = Range::new(loc(9, 1, 3), loc(12, 1, 6));
        let extended = extend_range_to_lines(r, buf);
        assert_eq!(extended.start, loc(6, 1, 0));
        assert_eq!(extended.end, loc(17, 1, 11));
    }

    #[test]
    fn test_zero_width_at_line_start_snaps_to_that_line() {
        let buf = b"first\nsecond\n";
        let r = Range::new(loc(6, 1, 0), loc(6, 1, 0));
        let extended = extend_range_to_lines(r, buf);
        assert_eq!(extended.start.offset, 6);
        assert_eq!(extended.end.offset, 12);
        assert_eq!(&buf[6..12], b"second");
    }

    #[test]
    fn test_range_ending_at_line_start_extends_over_next_line() {
        let buf = b"first\nsecond\n";
        // "first\n" ends exactly at the start of line 1
        let r = Range::new(loc(0, 0, 0), loc(6, 1, 0));
        let extended = extend_range_to_lines(r, buf);
        assert_eq!(extended.end.offset, 12);
        assert_eq!(extended.end.column, 6);
    }

    #[test]
    fn test_add_context_lines_stops_at_bounds() {
        let buf = b"a\nb\nc\nd\n";
        let r = Range::new(loc(2, 1, 0), loc(3, 1, 1));
        let with_ctx = add_context_lines(r, buf, 5);
        assert_eq!(with_ctx.start, loc(0, 0, 0));
        // trailing newline does not add a phantom empty line
        assert_eq!(with_ctx.end, loc(7, 3, 1));

        let one = add_context_lines(r, buf, 1);
        assert_eq!(&buf[one.start.offset as usize..one.end.offset as usize], b"a\nb\nc");
        assert_eq!(one.start.line, 0);
        assert_eq!(one.end.line, 2);
    }

    #[test]
    fn test_chunks_to_matches_copies_valid_utf8() {
        let buf = b"ok\nbad \xff byte\nend";
        let ranges = locs_to_ranges(buf, &[(7, 8)]);
        let matches = chunks_to_matches(buf, chunk_ranges(ranges, 0), 0);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].content, "bad \u{FFFD} byte");
        assert_eq!(matches[0].content_start, loc(3, 1, 0));
        assert_eq!(matches[0].ranges[0].start.offset, 7);
    }
}
