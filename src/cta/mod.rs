//! Interpretation of one thread block.

pub mod alu;
pub mod divergence;
mod exec;
pub mod mask;

use crate::barrier::BarrierSet;
use crate::config;
use crate::error::Error;
use crate::instruction::Pc;
use crate::kernel::{EmulatedKernel, FrameInfo};
use crate::memory::{GlobalMemory, Memory, Segment};
use crate::sequence::Sequence;
use crate::sync::Arc;
use crate::trace::Generators;
use ptx::{Dim, Point};
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::HashMap;

pub type ActiveMask = bitvec::vec::BitVec;

/// Launch wide state shared by every thread block.
pub struct Context<'a> {
    pub kernel: &'a EmulatedKernel,
    pub memory: &'a Memory,
    /// Register slots of the kernel's own frame.
    pub registers: usize,
    pub grid: Dim,
    pub block: Dim,
    pub generators: &'a Generators,
    pub global: &'a dyn GlobalMemory,
    pub config: &'a config::Emulator,
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("kernel", &self.kernel.name())
            .field("registers", &self.registers)
            .field("grid", &self.grid)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize)]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Created,
    Running,
    AtBarrier,
    Diverged,
    Completed,
    Faulted,
}

/// Activation record of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub registers: Vec<u64>,
    pub return_pc: Pc,
    /// Offset of the frame in the thread's stack segment.
    pub stack_base: u64,
    pub frame_size: u64,
    /// Caller slot receiving each callee return slot.
    pub returns: SmallVec<[(u32, u32); 2]>,
}

impl Frame {
    fn new(registers: usize) -> Self {
        Self {
            registers: vec![0; registers],
            return_pc: 0,
            stack_base: 0,
            frame_size: 0,
            returns: SmallVec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    /// Call frames, the kernel frame first.
    pub frames: Vec<Frame>,
    pub local: Vec<u8>,
    /// Allocated on the first call.
    pub stack: Vec<u8>,
}

impl Thread {
    fn frame(&self) -> &Frame {
        // the kernel frame is never popped
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut Frame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }
}

/// State of a thread block after it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub block_id: Point,
    pub status: Status,
    /// PC of the faulting instruction.
    pub pc: Option<Pc>,
    /// Kernel frame registers of every thread.
    pub registers: Vec<Vec<u64>>,
    pub shared: Vec<u8>,
}

pub struct Cta<'a> {
    ctx: &'a Context<'a>,
    block_id: Point,
    program: Arc<Sequence>,
    threads: Vec<Thread>,
    shared: Vec<u8>,
    global_shared: Vec<u8>,
    stack: divergence::Stack,
    barriers: BarrierSet,
    exited: ActiveMask,
    status: Status,
    fault_pc: Option<Pc>,
    steps: u64,
    callees: HashMap<Pc, FrameInfo>,
}

impl std::fmt::Debug for Cta<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cta")
            .field("block_id", &self.block_id)
            .field("status", &self.status)
            .field("stack", &self.stack)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl<'a> Cta<'a> {
    #[must_use]
    pub fn new(ctx: &'a Context<'a>, block_id: Point) -> Self {
        let num_threads = ctx.block.size() as usize;
        let local_size = ctx.memory.size(Segment::Local) as usize;
        let threads = (0..num_threads)
            .map(|_| Thread {
                frames: vec![Frame::new(ctx.registers)],
                local: vec![0; local_size],
                stack: Vec::new(),
            })
            .collect();
        Self {
            ctx,
            block_id,
            program: ctx.kernel.program(),
            threads,
            shared: vec![0; ctx.memory.size(Segment::Shared) as usize],
            global_shared: vec![0; ctx.memory.size(Segment::GlobalShared) as usize],
            stack: divergence::Stack::new(mask::full(num_threads)),
            barriers: BarrierSet::new(ctx.config.max_barriers_per_block, num_threads),
            exited: ActiveMask::repeat(false, num_threads),
            status: Status::Created,
            fault_pc: None,
            steps: 0,
            callees: HashMap::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn block_id(&self) -> Point {
        self.block_id
    }

    #[must_use]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    #[must_use]
    pub fn shared(&self) -> &[u8] {
        &self.shared
    }

    /// Run the block to completion.
    ///
    /// On error the block stays in [`Status::Faulted`] and can still be
    /// inspected.
    pub fn run(&mut self) -> Result<(), Error> {
        self.status = Status::Running;
        log::trace!(
            "{}: running block {} with {} threads",
            self.ctx.kernel.name(),
            self.block_id.to_dim(),
            self.threads.len()
        );
        loop {
            self.stack.normalize();
            if self.stack.is_empty() {
                self.status = Status::Completed;
                return Ok(());
            }
            let Some(idx) = self.stack.select() else {
                let pc = self.stack.entries().last().map_or(0, |entry| entry.pc);
                self.status = Status::Faulted;
                self.fault_pc = Some(pc);
                return Err(Error::fault(
                    pc,
                    format!(
                        "barrier deadlock in block {}: no thread can make progress",
                        self.block_id.to_dim()
                    ),
                ));
            };
            let pc = self.stack.entry(idx).pc;
            if let Err(err) = self.step(idx) {
                log::debug!(
                    "{}: block {} faulted at pc={pc}: {err}",
                    self.ctx.kernel.name(),
                    self.block_id.to_dim()
                );
                self.status = Status::Faulted;
                self.fault_pc = Some(pc);
                return Err(err);
            }
            self.status = if self.stack.is_parked() {
                Status::AtBarrier
            } else if self.stack.len() > 1 {
                Status::Diverged
            } else {
                Status::Running
            };
        }
    }

    /// Threads that have not exited.
    fn running(&self) -> ActiveMask {
        mask::and_not(&mask::full(self.threads.len()), &self.exited)
    }

    fn release_barriers(&mut self) {
        let running = self.running();
        for id in self.barriers.release(&running) {
            log::trace!("block {}: released barrier {id}", self.block_id.to_dim());
            self.stack.release(id);
        }
    }

    /// Frame layout of the function whose entry is at `pc`.
    fn callee(&mut self, pc: Pc) -> Result<&FrameInfo, Error> {
        if !self.callees.contains_key(&pc) {
            let kernel = self.ctx.kernel.get_kernel(pc).ok_or_else(|| {
                Error::fault(pc, format!("no function is linked at pc={pc}"))
            })?;
            self.callees.insert(pc, kernel.frame_info());
        }
        self.callees
            .get(&pc)
            .ok_or_else(|| Error::fault(pc, "missing frame layout"))
    }

    #[must_use]
    pub fn into_snapshot(self) -> Snapshot {
        Snapshot {
            block_id: self.block_id,
            status: self.status,
            pc: self.fault_pc,
            registers: self
                .threads
                .into_iter()
                .map(|thread| {
                    thread
                        .frames
                        .into_iter()
                        .next()
                        .map(|frame| frame.registers)
                        .unwrap_or_default()
                })
                .collect(),
            shared: self.shared,
        }
    }
}
