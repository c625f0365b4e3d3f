use super::{InstructionEvent, LaunchInfo, TraceGenerator};
use crate::sync::Mutex;
use indexmap::IndexMap;

/// Counts how many threads entered each basic block, per kernel.
#[derive(Debug, Default)]
pub struct BasicBlockCounter {
    counts: Mutex<IndexMap<String, IndexMap<String, u64>>>,
}

impl BasicBlockCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread executions of block `label` in `kernel`.
    #[must_use]
    pub fn count(&self, kernel: &str, label: &str) -> u64 {
        self.counts
            .lock()
            .get(kernel)
            .and_then(|blocks| blocks.get(label))
            .copied()
            .unwrap_or(0)
    }

    /// Per block counts of `kernel` in first execution order.
    #[must_use]
    pub fn counts(&self, kernel: &str) -> IndexMap<String, u64> {
        self.counts.lock().get(kernel).cloned().unwrap_or_default()
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

impl TraceGenerator for BasicBlockCounter {
    fn pre_instruction(&self, event: &InstructionEvent<'_>) {
        let Some(label) = event.block_start else {
            return;
        };
        let threads = event.mask.count_ones() as u64;
        let mut counts = self.counts.lock();
        let blocks = counts.entry(event.kernel.to_string()).or_default();
        *blocks.entry(label.to_string()).or_default() += threads;
    }

    fn finish(&self, launch: &LaunchInfo<'_>) {
        if log::log_enabled!(log::Level::Debug) {
            for (label, count) in self.counts(launch.kernel) {
                log::debug!("{}: block {label:<20} executed by {count:>8} threads", launch.kernel);
            }
        }
    }
}
