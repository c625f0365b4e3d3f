use crate::cta::{mask, ActiveMask};

/// Arrival state of the named barriers of one thread block.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone)]
pub struct BarrierSet {
    max_barriers_per_block: usize,
    /// Threads waiting at each barrier.
    arrived: Box<[ActiveMask]>,
    /// Explicit thread count of each barrier, if one was given.
    expected: Box<[Option<usize>]>,
}

impl BarrierSet {
    #[must_use]
    pub fn new(max_barriers_per_block: usize, num_threads: usize) -> Self {
        Self {
            max_barriers_per_block,
            arrived: vec![ActiveMask::repeat(false, num_threads); max_barriers_per_block]
                .into_boxed_slice(),
            expected: vec![None; max_barriers_per_block].into_boxed_slice(),
        }
    }

    /// Check whether any thread is waiting at barrier `id`.
    #[must_use]
    pub fn is_waiting(&self, id: usize) -> bool {
        self.arrived.get(id).is_some_and(|arrived| arrived.any())
    }

    #[must_use]
    pub fn any_waiting(&self) -> bool {
        self.arrived.iter().any(|arrived| arrived.any())
    }

    /// Threads reached barrier `id`.
    ///
    /// Returns `false` for an id outside the supported range.
    #[must_use]
    pub fn arrive(&mut self, id: usize, threads: &ActiveMask, count: Option<usize>) -> bool {
        if id >= self.max_barriers_per_block {
            return false;
        }
        mask::or_assign(&mut self.arrived[id], threads);
        if count.is_some() {
            self.expected[id] = count;
        }
        true
    }

    /// Threads exited and no longer take part in any barrier.
    pub fn threads_exited(&mut self, threads: &ActiveMask) {
        for arrived in self.arrived.iter_mut() {
            *arrived = mask::and_not(arrived, threads);
        }
    }

    /// Release every barrier whose arrivals are complete.
    ///
    /// A barrier is complete once the explicit thread count arrived, or
    /// otherwise when every thread in `running` arrived.
    pub fn release(&mut self, running: &ActiveMask) -> Vec<usize> {
        let mut released = Vec::new();
        for id in 0..self.max_barriers_per_block {
            let arrived = &self.arrived[id];
            if !arrived.any() {
                continue;
            }
            let complete = match self.expected[id] {
                Some(count) => arrived.count_ones() >= count,
                None => mask::and_not(running, arrived).not_any(),
            };
            if complete {
                self.arrived[id].fill(false);
                self.expected[id] = None;
                released.push(id);
            }
        }
        released
    }
}
