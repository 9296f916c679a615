//! Free-block selection policies.

use super::block::BlockId;

/// How a pool picks a free block for an allocation.
///
/// Candidates are always offered in address order, so "first found" means
/// lowest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocationStrategy {
    /// First block large enough.
    FirstFit,
    /// Smallest block large enough; ties go to the lowest address.
    #[default]
    BestFit,
    /// Largest block; ties go to the lowest address.
    WorstFit,
    /// Power-of-two sizes. The request is rounded up to a power of two, the
    /// best-fitting block is chosen and then halved while the half still fits.
    Buddy,
}

/// A free block able to hold the request, offered to [`AllocationStrategy::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub id: BlockId,
    pub size: usize,
}

impl AllocationStrategy {
    /// Pick one of `candidates`, which must all fit the request.
    pub(crate) fn select<I>(self, candidates: I) -> Option<Candidate>
    where
        I: IntoIterator<Item = Candidate>,
    {
        let mut candidates = candidates.into_iter();
        match self {
            AllocationStrategy::FirstFit => candidates.next(),
            AllocationStrategy::BestFit | AllocationStrategy::Buddy => {
                candidates.fold(None, |best: Option<Candidate>, c| match best {
                    Some(b) if b.size <= c.size => Some(b),
                    _ => Some(c),
                })
            }
            AllocationStrategy::WorstFit => {
                candidates.fold(None, |best: Option<Candidate>, c| match best {
                    Some(b) if b.size >= c.size => Some(b),
                    _ => Some(c),
                })
            }
        }
    }

    /// Size actually reserved for a request of `size` bytes at `alignment`.
    ///
    /// Returns `None` on overflow.
    pub(crate) fn round_request(self, size: usize, alignment: usize) -> Option<usize> {
        let aligned = super::defaults::align_up(size.max(1), alignment)?;
        match self {
            AllocationStrategy::Buddy => aligned.max(alignment).checked_next_power_of_two(),
            _ => Some(aligned),
        }
    }

    /// Whether selected blocks are halved down towards the request size.
    pub(crate) fn splits_in_halves(self) -> bool {
        matches!(self, AllocationStrategy::Buddy)
    }

    /// Short lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStrategy::FirstFit => "first-fit",
            AllocationStrategy::BestFit => "best-fit",
            AllocationStrategy::WorstFit => "worst-fit",
            AllocationStrategy::Buddy => "buddy",
        }
    }
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
