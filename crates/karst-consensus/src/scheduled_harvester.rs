//! The scheduled harvesting task.
//!
//! A thin wrapper invoked by the task runner. It forges at most one block
//! at a time: a single-slot atomic flag stays set from submission until the
//! pipeline reports any terminal outcome for the forged block, and clears
//! on every path so the next tick can retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use karst_core::clock::NetworkClock;
use karst_core::element::BlockElement;
use karst_core::types::Block;

use crate::harvester::Harvester;

/// Callback handed to the range consumer; invoked exactly once when the
/// submitted block reaches a terminal state (accepted, rejected, or
/// discarded).
pub type HarvestCompletionHandler = Box<dyn FnOnce() + Send>;

/// Consumes a harvested block, usually by submitting it to the pipeline.
pub type HarvestedBlockConsumer = Arc<dyn Fn(Block, HarvestCompletionHandler) + Send + Sync>;

/// Wiring for the scheduled harvesting task.
pub struct ScheduledHarvesterTaskOptions {
    /// Gate consulted before any work happens.
    pub harvesting_allowed: Arc<dyn Fn() -> bool + Send + Sync>,
    /// Supplies the current chain tip element.
    pub last_block_element_supplier: Arc<dyn Fn() -> Arc<BlockElement> + Send + Sync>,
    /// Supplies the trailing difficulty window for the tip.
    pub difficulty_sampler: Arc<dyn Fn() -> Vec<(u64, u64)> + Send + Sync>,
    /// Network time source.
    pub time_supplier: Arc<dyn NetworkClock>,
    /// Receives the forged block together with its completion handler.
    pub range_consumer: HarvestedBlockConsumer,
}

pub struct ScheduledHarvesterTask {
    options: ScheduledHarvesterTaskOptions,
    harvester: Harvester,
    pending: Arc<AtomicBool>,
}

impl ScheduledHarvesterTask {
    pub fn new(options: ScheduledHarvesterTaskOptions, harvester: Harvester) -> Self {
        Self { options, harvester, pending: Arc::new(AtomicBool::new(false)) }
    }

    /// Whether a previously harvested block is still in flight.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Run one harvesting round. All failures are non-fatal; the task
    /// retries on its next tick.
    pub fn harvest(&self) {
        if !(self.options.harvesting_allowed)() {
            return;
        }
        // Claim the single submission slot; lose the race, skip the round.
        if self
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let parent = (self.options.last_block_element_supplier)();
        let now_ms = self.options.time_supplier.now_ms();
        let samples = (self.options.difficulty_sampler)();

        match self.harvester.harvest(&parent, now_ms, &samples) {
            Some(block) => {
                debug!(height = block.height, hash = %block.entity_hash(), "harvested block");
                let pending = Arc::clone(&self.pending);
                (self.options.range_consumer)(
                    block,
                    Box::new(move || pending.store(false, Ordering::SeqCst)),
                );
            }
            None => self.pending.store(false, Ordering::SeqCst),
        }
    }
}
