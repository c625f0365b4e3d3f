//! Linear scan register allocation over the instruction sequence.

use crate::error::Error;
use crate::instruction::{Pc, Reg};
use crate::sequence::Sequence;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeSet;

/// Inclusive PC interval in which a virtual register holds a value.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize)]
pub struct LiveRange {
    pub start: Pc,
    pub end: Pc,
}

impl LiveRange {
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn cover(&mut self, pc: Pc) {
        self.start = self.start.min(pc);
        self.end = self.end.max(pc);
    }
}

/// Virtual register to physical slot assignment shared by all threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegisterMap {
    pub slots: IndexMap<String, u32>,
    pub ranges: IndexMap<String, LiveRange>,
    /// Number of slots a register file needs.
    pub count: usize,
}

impl RegisterMap {
    #[must_use]
    pub fn slot(&self, name: &str) -> Option<u32> {
        self.slots.get(name).copied()
    }
}

/// Live ranges of all virtual registers.
///
/// `pinned` registers live through the whole sequence. Ranges that
/// intersect a loop are widened to the whole loop, so values carried from
/// one iteration to the next keep their slot.
#[must_use]
pub fn live_ranges(sequence: &Sequence, pinned: &[String]) -> IndexMap<String, LiveRange> {
    let mut ranges: IndexMap<String, LiveRange> = IndexMap::new();
    let last = sequence.len().saturating_sub(1);
    for name in pinned {
        ranges.insert(name.clone(), LiveRange { start: 0, end: last });
    }
    for inst in &sequence.instructions {
        for reg in inst.registers() {
            if let Reg::Virtual(name) = reg {
                ranges
                    .entry(name.clone())
                    .and_modify(|range| range.cover(inst.pc))
                    .or_insert(LiveRange {
                        start: inst.pc,
                        end: inst.pc,
                    });
            }
        }
    }

    let loops: Vec<LiveRange> = sequence
        .instructions
        .iter()
        .filter_map(|inst| {
            let target = inst.target()?;
            (target <= inst.pc).then_some(LiveRange {
                start: target,
                end: inst.pc,
            })
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for range in ranges.values_mut() {
            for body in &loops {
                let covered = range.start <= body.start && body.end <= range.end;
                if range.overlaps(body) && !covered {
                    range.cover(body.start);
                    range.cover(body.end);
                    changed = true;
                }
            }
        }
    }
    ranges
}

/// Assign slots and rewrite every virtual register of `sequence`.
pub fn allocate(
    kernel: &str,
    sequence: &mut Sequence,
    pinned: &[String],
    limit: usize,
) -> Result<RegisterMap, Error> {
    let ranges = live_ranges(sequence, pinned);

    let mut order: Vec<(usize, &LiveRange)> = ranges.values().enumerate().collect();
    order.sort_by_key(|(idx, range)| (range.start, range.end, *idx));

    let mut slots: IndexMap<String, u32> = IndexMap::with_capacity(ranges.len());
    let mut active: Vec<(Pc, u32)> = Vec::new();
    let mut free: BTreeSet<u32> = BTreeSet::new();
    let mut count: u32 = 0;
    for (idx, range) in order {
        active.retain(|(end, slot)| {
            let expired = *end < range.start;
            if expired {
                free.insert(*slot);
            }
            !expired
        });
        let slot = free.pop_first().unwrap_or_else(|| {
            count += 1;
            count - 1
        });
        active.push((range.end, slot));
        if let Some((name, _)) = ranges.get_index(idx) {
            slots.insert(name.clone(), slot);
        }
    }

    if crate::is_debug() {
        for ((a, range_a), (b, range_b)) in ranges.iter().tuple_combinations() {
            debug_assert!(
                !range_a.overlaps(range_b) || slots.get(a) != slots.get(b),
                "{kernel}: live registers {a} and {b} share a slot"
            );
        }
    }

    let count = count as usize;
    if count > limit {
        return Err(Error::OutOfRegisters {
            kernel: kernel.to_string(),
            required: count,
            limit,
        });
    }

    for inst in &mut sequence.instructions {
        for reg in inst.registers_mut() {
            if let Reg::Virtual(name) = reg {
                if let Some(slot) = slots.get(name.as_str()) {
                    *reg = Reg::Slot(*slot);
                }
            }
        }
    }
    log::debug!(
        "{kernel}: {} virtual registers in {count} slots",
        slots.len()
    );
    Ok(RegisterMap {
        slots,
        ranges,
        count,
    })
}
