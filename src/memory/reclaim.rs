//! Returning unused physical pages of a live shared mapping to the kernel.
//!
//! The sweep in [`uncovered_gaps`] finds every sub-range of a byte range that
//! no committed span covers. [`Reclaimer`] rounds those gaps inward to page
//! boundaries and hands the page-aligned remainder to a [`PageAdvisor`].
//!
//! ```text
//!   0                                                              size
//!   ├──────────┬───────────────┬─────────────┬──────────────┬──────────┤
//!   │   gap    │    span A     │     gap     │    span B    │   gap    │
//!   └──────────┴───────────────┴─────────────┴──────────────┴──────────┘
//!      ├─pages─┤                 ├──pages──┤                 ├─pages──┤
//! ```
//!
//! The sweep itself is pure. Running two reclamations over overlapping
//! sub-ranges of the same arena at the same time is not safe; the arena
//! manager serializes span changes per arena.

use super::defaults::{align_down, align_up};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

/// System page size, fetched once per process.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(rustix::param::page_size)
}

/// Find the sub-ranges of `range` not covered by any of `spans`.
///
/// `spans` are `(offset, len)` pairs and may overlap each other. Parts of a
/// span outside `range` are ignored. The result is sorted and contains no
/// empty or adjacent ranges.
pub fn uncovered_gaps(range: Range<usize>, spans: &[(usize, usize)]) -> Vec<Range<usize>> {
    if range.start >= range.end {
        return Vec::new();
    }

    // +1 where a span starts, -1 where it ends, plus markers at both bounds.
    let mut points: BTreeMap<usize, i64> = BTreeMap::new();
    points.insert(range.start, 0);
    points.insert(range.end, 0);
    for &(offset, len) in spans {
        let start = offset.max(range.start);
        let end = offset.saturating_add(len).min(range.end);
        if start >= end {
            continue;
        }
        *points.entry(start).or_insert(0) += 1;
        *points.entry(end).or_insert(0) -= 1;
    }

    let mut gaps: Vec<Range<usize>> = Vec::new();
    let mut coverage = 0i64;
    let mut iter = points.iter().peekable();
    while let Some((&point, &delta)) = iter.next() {
        coverage += delta;
        let Some(&(&next, _)) = iter.peek() else {
            break;
        };
        if coverage == 0 {
            match gaps.last_mut() {
                Some(last) if last.end == point => last.end = next,
                _ => gaps.push(point..next),
            }
        }
    }
    gaps
}

/// Receives page-aligned ranges whose physical backing may be dropped.
///
/// Implementations must keep the virtual mapping valid: later reads of the
/// range return zeros and later writes succeed.
pub trait PageAdvisor: Send + Sync {
    /// Advise that `[address, address + len)` is unused. Both are page-aligned.
    fn release(&self, address: usize, len: usize);
}

/// Advisor that punches the range out of the shared mapping with
/// `madvise(MADV_REMOVE)`.
///
/// `MADV_DONTNEED` is not enough for memfd mappings: it only drops this
/// process's page table entries while the shmem pages stay allocated.
/// `MADV_REMOVE` frees the backing pages, keeps the mapping, and makes the
/// range read back as zeros.
#[derive(Debug, Default, Clone, Copy)]
pub struct MadviseAdvisor;

impl PageAdvisor for MadviseAdvisor {
    fn release(&self, address: usize, len: usize) {
        let result = unsafe {
            rustix::mm::madvise(
                address as *mut std::ffi::c_void,
                len,
                rustix::mm::Advice::LinuxRemove,
            )
        };
        if let Err(e) = result {
            tracing::error!(address = format_args!("{address:#x}"), len, "madvise failed: {e}");
        }
    }
}

/// Sweeps ranges of a mapping and advises the uncovered pages.
#[derive(Clone)]
pub struct Reclaimer {
    advisor: Arc<dyn PageAdvisor>,
}

impl Reclaimer {
    /// Create a reclaimer issuing advisories through `advisor`.
    pub fn new(advisor: Arc<dyn PageAdvisor>) -> Self {
        Self { advisor }
    }

    /// Reclaim every page of `range` (offsets relative to `base`) that no
    /// span covers. Returns the number of bytes advised.
    ///
    /// `base` must be page-aligned, as every fresh mapping is.
    pub fn reclaim(&self, base: usize, range: Range<usize>, spans: &[(usize, usize)]) -> usize {
        uncovered_gaps(range, spans)
            .into_iter()
            .map(|gap| self.reclaim_gap(base, gap))
            .sum()
    }

    /// Round one gap inward to pages and advise it if anything is left.
    fn reclaim_gap(&self, base: usize, gap: Range<usize>) -> usize {
        let page_size = page_size();
        let left = align_up(base + gap.start, page_size);
        let right = align_down(base + gap.end, page_size);
        if left >= right {
            return 0;
        }
        tracing::trace!(
            from = format_args!("{:#x}", base + gap.start),
            to = format_args!("{:#x}", base + gap.end),
            aligned_from = format_args!("{left:#x}"),
            aligned_to = format_args!("{right:#x}"),
            "recycle memory"
        );
        self.advisor.release(left, right - left);
        right - left
    }
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new(Arc::new(MadviseAdvisor))
    }
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(usize, usize)>>);

    impl PageAdvisor for Recorder {
        fn release(&self, address: usize, len: usize) {
            self.0.lock().push((address, len));
        }
    }

    /// Small deterministic generator so the property test needs no extra crate.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((self.0 >> 33) as usize) % bound
        }
    }

    fn brute_force(size: usize, spans: &[(usize, usize)]) -> Vec<bool> {
        let mut covered = vec![false; size];
        for &(offset, len) in spans {
            for byte in offset..(offset + len).min(size) {
                covered[byte] = true;
            }
        }
        covered
    }

    #[test]
    fn test_no_spans_is_one_gap() {
        assert_eq!(uncovered_gaps(0..100, &[]), vec![0..100]);
    }

    #[test]
    fn test_empty_range() {
        assert!(uncovered_gaps(10..10, &[(0, 5)]).is_empty());
    }

    #[test]
    fn test_gaps_between_spans() {
        let gaps = uncovered_gaps(0..100, &[(10, 20), (50, 10)]);
        assert_eq!(gaps, vec![0..10, 30..50, 60..100]);
    }

    #[test]
    fn test_overlapping_spans() {
        let gaps = uncovered_gaps(0..100, &[(10, 30), (20, 30), (45, 10)]);
        assert_eq!(gaps, vec![0..10, 55..100]);
    }

    #[test]
    fn test_adjacent_and_zero_length_spans() {
        let gaps = uncovered_gaps(0..100, &[(0, 10), (10, 10), (40, 0)]);
        assert_eq!(gaps, vec![20..100]);
    }

    #[test]
    fn test_fully_covered() {
        assert!(uncovered_gaps(0..64, &[(0, 64)]).is_empty());
        assert!(uncovered_gaps(0..64, &[(0, 100)]).is_empty());
    }

    #[test]
    fn test_spans_clipped_to_range() {
        let gaps = uncovered_gaps(100..200, &[(50, 80), (190, 50)]);
        assert_eq!(gaps, vec![130..190]);
    }

    #[test]
    fn test_sweep_matches_brute_force() {
        let mut rng = Lcg(0x5eed);
        for _ in 0..500 {
            let size = 1 + rng.next(96);
            let count = rng.next(6);
            let spans: Vec<(usize, usize)> = (0..count)
                .map(|_| {
                    let offset = rng.next(size);
                    (offset, rng.next(size - offset + 1))
                })
                .collect();

            let covered = brute_force(size, &spans);
            let mut swept = vec![true; size];
            for gap in uncovered_gaps(0..size, &spans) {
                for byte in gap {
                    swept[byte] = false;
                }
            }
            assert_eq!(swept, covered, "size {size}, spans {spans:?}");
        }
    }

    #[test]
    fn test_reclaim_rounds_inward_to_pages() {
        let page = page_size();
        let recorder = Arc::new(Recorder::default());
        let reclaimer = Reclaimer::new(recorder.clone());
        let base = 16 * page;

        // gap [page/2, 3*page + 1) -> pages [page, 3*page)
        let advised = reclaimer.reclaim(base, page / 2..3 * page + 1, &[]);
        assert_eq!(advised, 2 * page);
        assert_eq!(recorder.0.lock().as_slice(), &[(base + page, 2 * page)]);
    }

    #[test]
    fn test_reclaim_skips_sub_page_gaps() {
        let page = page_size();
        let recorder = Arc::new(Recorder::default());
        let reclaimer = Reclaimer::new(recorder.clone());

        let advised = reclaimer.reclaim(0, 0..2 * page, &[(10, page)]);
        // gaps [0,10) and [page+10, 2*page): neither contains a whole page
        assert_eq!(advised, 0);
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn test_page_size_is_cached_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(page_size(), page_size());
    }
}
