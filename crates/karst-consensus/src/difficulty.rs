//! Block difficulty calculation.
//!
//! The difficulty for a new block derives from the timestamp spacing of up
//! to `max_difficulty_blocks` recent blocks: when blocks arrive faster than
//! the target interval the difficulty rises, and vice versa. Single-step
//! movement is clamped to 5% so one outlier block cannot swing the chain.

use karst_core::chain_config::ChainConfig;

/// Floor for the calculated difficulty.
pub const MIN_DIFFICULTY: u64 = 1_000;

/// Maximum single-step adjustment, as a percentage of the average.
const MAX_STEP_PERCENT: u128 = 5;

/// Compute the difficulty for the block following `samples`.
///
/// `samples` are `(timestamp_ms, difficulty)` pairs of the most recent
/// blocks in ascending height order; the caller caps the window at
/// `max_difficulty_blocks`. With fewer than two samples the parent
/// difficulty (or the floor) is carried forward.
pub fn next_difficulty(samples: &[(u64, u64)], config: &ChainConfig) -> u64 {
    let Some((_, parent_difficulty)) = samples.last() else {
        return MIN_DIFFICULTY;
    };
    if samples.len() < 2 {
        return (*parent_difficulty).max(MIN_DIFFICULTY);
    }

    let first_ts = samples[0].0;
    let last_ts = samples[samples.len() - 1].0;
    let steps = (samples.len() - 1) as u128;
    let observed_spacing = ((last_ts.saturating_sub(first_ts)) as u128 / steps).max(1);

    let average: u128 =
        samples.iter().map(|(_, d)| *d as u128).sum::<u128>() / samples.len() as u128;

    // Scale by target/observed, clamped to +-5% of the window average.
    let scaled = average * config.block_time_interval_ms as u128 / observed_spacing;
    let max_step = average * MAX_STEP_PERCENT / 100;
    let clamped = scaled.clamp(average.saturating_sub(max_step), average + max_step);

    (clamped as u64).max(MIN_DIFFICULTY)
}
