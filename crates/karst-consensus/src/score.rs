//! Deterministic chain scoring.
//!
//! All arithmetic is integer; the per-block score saturates at zero instead
//! of going negative, and the 128-bit chain sum cannot overflow for any
//! realistic chain length.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use karst_core::types::{Block, Hash256};

/// Total-ordered score of a chain: the sum of its per-block scores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainScore(pub u128);

impl ChainScore {
    pub const ZERO: Self = Self(0);
}

impl Add for ChainScore {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for ChainScore {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for ChainScore {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, s| acc + s)
    }
}

impl fmt::Display for ChainScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-block score:
/// `(2^64 - 1) - child.difficulty * (child.timestamp - parent.timestamp)`,
/// saturating at zero. Faster blocks at higher difficulty score higher.
pub fn block_score(parent_timestamp: u64, child_timestamp: u64, child_difficulty: u64) -> ChainScore {
    let time_diff = child_timestamp.saturating_sub(parent_timestamp) as u128;
    let penalty = (child_difficulty as u128).saturating_mul(time_diff);
    ChainScore((u64::MAX as u128).saturating_sub(penalty))
}

/// Score contributed by `child` on top of `parent`.
pub fn score_between(parent: &Block, child: &Block) -> ChainScore {
    block_score(parent.timestamp, child.timestamp, child.difficulty)
}

/// Thread-safe holder of the local chain's current score.
///
/// Written only by the commit stage; read by the synchronizer and the
/// chain-info responder.
pub struct ScoreTracker {
    score: parking_lot::RwLock<ChainScore>,
}

impl ScoreTracker {
    pub fn new(initial: ChainScore) -> Self {
        Self { score: parking_lot::RwLock::new(initial) }
    }

    pub fn current(&self) -> ChainScore {
        *self.score.read()
    }

    /// Add a block's score after an extension commit.
    pub fn add(&self, delta: ChainScore) {
        *self.score.write() += delta;
    }

    /// Replace the score after a reorganization.
    pub fn set(&self, score: ChainScore) {
        *self.score.write() = score;
    }
}

/// The chain-selection rule: a candidate `(score, tip hash)` beats the
/// current one iff its score is strictly higher, or equal with a lower tip
/// hash.
pub fn is_better_chain(
    candidate: (ChainScore, &Hash256),
    current: (ChainScore, &Hash256),
) -> bool {
    candidate.0 > current.0 || (candidate.0 == current.0 && candidate.1 < current.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faster_blocks_score_higher() {
        let fast = block_score(0, 10_000, 1_000);
        let slow = block_score(0, 30_000, 1_000);
        assert!(fast > slow);
    }

    #[test]
    fn higher_difficulty_scores_lower_for_equal_spacing() {
        // The penalty term grows with difficulty; the difficulty adjustment
        // compensates by shrinking the spacing on a healthy chain.
        let easy = block_score(0, 10_000, 1_000);
        let hard = block_score(0, 10_000, 2_000);
        assert!(easy > hard);
    }

    #[test]
    fn score_saturates_at_zero() {
        assert_eq!(block_score(0, u64::MAX, u64::MAX), ChainScore::ZERO);
    }

    #[test]
    fn zero_spacing_scores_maximum() {
        assert_eq!(block_score(500, 500, 1_000), ChainScore(u64::MAX as u128));
    }

    #[test]
    fn child_before_parent_clamps_to_maximum() {
        // Defensively treated as zero spacing rather than underflowing.
        assert_eq!(block_score(1_000, 500, 1_000), ChainScore(u64::MAX as u128));
    }

    #[test]
    fn sum_is_associative_enough_for_chains() {
        let scores = [
            block_score(0, 10_000, 500),
            block_score(10_000, 25_000, 500),
            block_score(25_000, 31_000, 600),
        ];
        let forward: ChainScore = scores.iter().copied().sum();
        let mut backward = ChainScore::ZERO;
        for s in scores.iter().rev() {
            backward += *s;
        }
        assert_eq!(forward, backward);
    }

    #[test]
    fn chain_sum_saturates_instead_of_overflowing() {
        let max = ChainScore(u128::MAX);
        assert_eq!(max + ChainScore(1), ChainScore(u128::MAX));
    }

    // --- Chain selection ---

    #[test]
    fn higher_score_wins() {
        let lo = Hash256([0x01; 32]);
        let hi = Hash256([0x02; 32]);
        assert!(is_better_chain((ChainScore(10), &hi), (ChainScore(9), &lo)));
        assert!(!is_better_chain((ChainScore(9), &lo), (ChainScore(10), &hi)));
    }

    #[test]
    fn tie_breaks_on_lower_tip_hash() {
        let lo = Hash256([0x01; 32]);
        let hi = Hash256([0x02; 32]);
        assert!(is_better_chain((ChainScore(10), &lo), (ChainScore(10), &hi)));
        assert!(!is_better_chain((ChainScore(10), &hi), (ChainScore(10), &lo)));
    }

    #[test]
    fn identical_chains_never_beat_each_other() {
        let tip = Hash256([0x03; 32]);
        assert!(!is_better_chain((ChainScore(10), &tip), (ChainScore(10), &tip)));
    }

    #[test]
    fn score_tracker_add_and_set() {
        let tracker = ScoreTracker::new(ChainScore(100));
        tracker.add(ChainScore(50));
        assert_eq!(tracker.current(), ChainScore(150));
        tracker.set(ChainScore(7));
        assert_eq!(tracker.current(), ChainScore(7));
    }

    #[test]
    fn selection_is_total() {
        // For distinct (score, hash) pairs exactly one direction wins.
        let a = (ChainScore(10), Hash256([0x01; 32]));
        let b = (ChainScore(10), Hash256([0x02; 32]));
        assert!(is_better_chain((a.0, &a.1), (b.0, &b.1)) != is_better_chain((b.0, &b.1), (a.0, &a.1)));
    }
}
