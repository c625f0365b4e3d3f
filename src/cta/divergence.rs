//! Explicit reconvergence stack of a thread block.
//!
//! Each entry is a group of threads (a pass) running at a common PC until it
//! reaches its reconvergence PC. A divergent branch turns the running entry
//! into a record that waits at the reconvergence PC with the full pre-branch
//! mask, and pushes one pass per branch direction above it.

use super::{mask, ActiveMask};
use crate::instruction::Pc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Pass,
    /// Waits for the passes above it to reconverge.
    Record,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub pc: Pc,
    pub mask: ActiveMask,
    /// Where this entry rejoins the entry below it.
    pub rpc: Option<Pc>,
    pub kind: Kind,
    /// Barrier the entry is parked at.
    pub barrier: Option<usize>,
}

impl Entry {
    #[must_use]
    pub fn new(pc: Pc, mask: ActiveMask, rpc: Option<Pc>) -> Self {
        Self {
            pc,
            mask,
            rpc,
            kind: Kind::Pass,
            barrier: None,
        }
    }

    fn is_done(&self) -> bool {
        self.mask.not_any() || (self.kind == Kind::Pass && Some(self.pc) == self.rpc)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stack {
    entries: Vec<Entry>,
}

impl Stack {
    #[must_use]
    pub fn new(mask: ActiveMask) -> Self {
        Self {
            entries: vec![Entry::new(0, mask, None)],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[must_use]
    pub fn entry(&self, idx: usize) -> &Entry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut Entry {
        &mut self.entries[idx]
    }

    /// Index of the entry to execute next.
    ///
    /// This is the topmost pass not parked at a barrier. A record only runs
    /// once it is on top, at which point it becomes a pass again.
    pub fn select(&mut self) -> Option<usize> {
        let top = self.entries.len().checked_sub(1)?;
        for idx in (0..=top).rev() {
            let entry = &mut self.entries[idx];
            if entry.barrier.is_some() {
                continue;
            }
            match entry.kind {
                Kind::Pass => return Some(idx),
                Kind::Record if idx == top => {
                    entry.kind = Kind::Pass;
                    return Some(idx);
                }
                Kind::Record => {}
            }
        }
        None
    }

    /// Resolve a branch of entry `idx`: `taken` threads go to `target`, the
    /// rest continue after the branch.
    ///
    /// Returns whether the entry diverged.
    pub fn branch(
        &mut self,
        idx: usize,
        taken: &ActiveMask,
        target: Pc,
        reconverge: Option<Pc>,
    ) -> bool {
        let entry = &mut self.entries[idx];
        let taken = mask::and(&entry.mask, taken);
        let not_taken = mask::and_not(&entry.mask, &taken);
        if taken.not_any() {
            entry.pc += 1;
            return false;
        }
        if not_taken.not_any() {
            entry.pc = target;
            return false;
        }

        let fallthrough = entry.pc + 1;
        let outer = entry.rpc;
        match reconverge {
            Some(rpc) if outer != Some(rpc) => {
                entry.kind = Kind::Record;
                entry.pc = rpc;
                self.entries.splice(
                    idx + 1..idx + 1,
                    [
                        Entry::new(fallthrough, not_taken, Some(rpc)),
                        Entry::new(target, taken, Some(rpc)),
                    ],
                );
            }
            _ => {
                // already inside a region reconverging at the same place
                entry.pc = fallthrough;
                entry.mask = not_taken;
                self.entries
                    .insert(idx + 1, Entry::new(target, taken, outer));
            }
        }
        true
    }

    /// Remove exited threads from every entry.
    pub fn remove_threads(&mut self, exited: &ActiveMask) {
        for entry in &mut self.entries {
            entry.mask = mask::and_not(&entry.mask, exited);
        }
    }

    /// Park entry `idx` at barrier `id`.
    pub fn park(&mut self, idx: usize, id: usize) {
        self.entries[idx].barrier = Some(id);
    }

    /// Move every entry parked at barrier `id` past the barrier.
    pub fn release(&mut self, id: usize) {
        for entry in &mut self.entries {
            if entry.barrier == Some(id) {
                entry.barrier = None;
                entry.pc += 1;
            }
        }
    }

    #[must_use]
    pub fn is_parked(&self) -> bool {
        self.entries.iter().any(|entry| entry.barrier.is_some())
    }

    /// Drop empty entries and passes that reached their reconvergence PC.
    pub fn normalize(&mut self) {
        self.entries.retain(|entry| !entry.is_done());
    }
}
