use std::num::NonZeroUsize;
use std::ops::Range;

/// Balanced split of `total` samples among `world_size` ranks: the shard for `rank`.
///
/// Ranges are contiguous, disjoint and cover `[0..total)`. Sizes differ by at most 1.
/// The training loop does not read these ranges as is: [`ShardSpec::range`] trims
/// each one to `total / world_size` samples, so every rank runs the same number of
/// batches per pass. The extra sample of each larger shard is left out.
pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Range<usize> {
    assert!(world_size > 0);
    assert!(rank < world_size);

    let base = total / world_size;
    let rem = total % world_size;

    let start = rank * base + rank.min(rem);
    let extra = if rank < rem { 1 } else { 0 };
    let end = start + base + extra;

    start..end
}

/// Which slice of a dataset a rank reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub world_size: NonZeroUsize,
}

impl ShardSpec {
    pub fn new(rank: usize, world_size: NonZeroUsize) -> Self {
        assert!(rank < world_size.get(), "rank out of range");
        Self { rank, world_size }
    }

    /// The whole dataset.
    pub fn single() -> Self {
        Self::new(0, NonZeroUsize::MIN)
    }

    /// Range read by this rank, cut to the same length on every rank so all
    /// ranks see the same number of batches.
    #[inline]
    pub fn range(self, total: usize) -> Range<usize> {
        let range = shard_range(total, self.rank, self.world_size.get());
        let even = total / self.world_size.get();
        range.start..range.start + even
    }
}
