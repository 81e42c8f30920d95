use crate::pool::Pool;
use crate::task::TaskHandle;
use core::ops::Range;

/// An index range `[begin, end)` chopped into blocks of `block_size`.
///
/// Each block becomes one work unit of the submitted task: unit `i` covers
/// `[begin + i·block_size, min(begin + (i+1)·block_size, end))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedRange {
    begin: u32,
    end: u32,
    block_size: u32,
}

impl BlockedRange {
    /// # Panics
    /// If `block_size` is zero.
    pub fn new(begin: u32, end: u32, block_size: u32) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            begin,
            end,
            block_size,
        }
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of work units this range fans out into.
    pub(crate) fn blocks(&self) -> u32 {
        let len = u64::from(self.end.saturating_sub(self.begin));
        let block = u64::from(self.block_size);
        ((len + block - 1) / block) as u32
    }

    /// Sub-range covered by work unit `index`.
    pub(crate) fn block(&self, index: u32) -> Range<u32> {
        let start = u64::from(self.begin) + u64::from(index) * u64::from(self.block_size);
        let end = (start + u64::from(self.block_size)).min(u64::from(self.end));
        start as u32..end as u32
    }
}

/// Runs `body` over every block of `range` on `pool`, in parallel with the
/// calling thread helping, and returns when the whole range is processed.
///
/// An empty range submits nothing. A single-block range executes inline on
/// the calling thread. The body may borrow from the caller's stack.
///
/// # Panics
/// Re-raises the first panic captured from any block, with its original
/// payload when possible.
pub fn parallel_for<F>(pool: &Pool, range: BlockedRange, body: F)
where
    F: Fn(Range<u32>) + Send + Sync,
{
    if range.blocks() == 0 {
        return;
    }
    if let Err(error) = pool.run(range.blocks(), move |index| body(range.block(index))) {
        error.resume();
    }
}

/// Asynchronous [`parallel_for`]: submits the range as a task that becomes
/// ready once every handle in `parents` has completed, and returns its
/// handle without waiting.
///
/// If a parent fails, `body` never runs and the error resurfaces when the
/// returned handle is waited on.
pub fn parallel_for_async<F>(
    pool: &Pool,
    range: BlockedRange,
    parents: &[&TaskHandle],
    body: F,
) -> TaskHandle
where
    F: Fn(Range<u32>) + Send + Sync + 'static,
{
    pool.spawn_after(parents, range.blocks(), move |index| body(range.block(index)))
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::BlockedRange;

    #[test]
    fn block_count() {
        assert_eq!(BlockedRange::new(0, 1000, 5).blocks(), 200);
        assert_eq!(BlockedRange::new(0, 10, 3).blocks(), 4);
        assert_eq!(BlockedRange::new(0, 0, 1).blocks(), 0);
        assert_eq!(BlockedRange::new(5, 5, 4).blocks(), 0);
        assert_eq!(BlockedRange::new(7, 5, 4).blocks(), 0);
    }

    #[test]
    fn block_bounds() {
        let range = BlockedRange::new(10, 25, 4);
        assert_eq!(range.blocks(), 4);
        assert_eq!(range.block(0), 10..14);
        assert_eq!(range.block(1), 14..18);
        assert_eq!(range.block(2), 18..22);
        assert_eq!(range.block(3), 22..25);
    }
}
