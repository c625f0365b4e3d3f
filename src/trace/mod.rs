//! Instrumentation hooks invoked while kernels execute.

pub mod basic_block;

pub use basic_block::BasicBlockCounter;

use crate::cta::ActiveMask;
use crate::instruction::{Instruction, Pc};
use crate::memory::AccessKind;
use crate::sync::{Arc, RwLock};
use ptx::{Dim, Point};

#[derive(Debug, Clone, Copy)]
pub struct LaunchInfo<'a> {
    pub kernel: &'a str,
    pub grid: Dim,
    pub block: Dim,
}

#[derive(Debug, Clone, Copy)]
pub struct InstructionEvent<'a> {
    pub kernel: &'a str,
    pub block_id: Point,
    pub instruction: &'a Instruction,
    /// Label of the basic block that starts at this instruction.
    pub block_start: Option<&'a str>,
    /// Threads of the executing pass.
    pub mask: &'a ActiveMask,
    /// Threads of the pass whose guard holds.
    pub active: &'a ActiveMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEvent<'a> {
    pub kernel: &'a str,
    pub block_id: Point,
    pub pc: Pc,
    pub thread: u32,
    pub address: u64,
    pub size: u64,
    pub kind: AccessKind,
    /// Loaded or stored value; only known after the access.
    pub value: Option<u64>,
}

/// Observer of kernel execution.
///
/// Generators may be invoked concurrently from several thread blocks and
/// only ever see shared references to emulator state.
pub trait TraceGenerator: Send + Sync {
    fn initialize(&self, _launch: &LaunchInfo<'_>) {}

    fn pre_instruction(&self, _event: &InstructionEvent<'_>) {}

    fn post_instruction(&self, _event: &InstructionEvent<'_>) {}

    fn pre_memory(&self, _event: &MemoryEvent<'_>) {}

    fn post_memory(&self, _event: &MemoryEvent<'_>) {}

    fn finish(&self, _launch: &LaunchInfo<'_>) {}
}

fn same_generator(a: &Arc<dyn TraceGenerator>, b: &Arc<dyn TraceGenerator>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ordered set of generators attached to a kernel.
#[derive(Default)]
pub struct Registry {
    generators: RwLock<Vec<Arc<dyn TraceGenerator>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("generators", &self.len())
            .finish()
    }
}

impl Registry {
    /// Add a generator unless it is already registered.
    pub fn add(&self, generator: Arc<dyn TraceGenerator>) {
        let mut generators = self.generators.write();
        if !generators.iter().any(|g| same_generator(g, &generator)) {
            generators.push(generator);
        }
    }

    /// Remove a generator, returning whether it was registered.
    pub fn remove(&self, generator: &Arc<dyn TraceGenerator>) -> bool {
        let mut generators = self.generators.write();
        let before = generators.len();
        generators.retain(|g| !same_generator(g, generator));
        generators.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.generators.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generators at this point in time.
    ///
    /// A launch works on a snapshot, so registration changes during a launch
    /// only affect later launches.
    #[must_use]
    pub fn snapshot(&self) -> Generators {
        Generators(self.generators.read().clone())
    }

    /// Snapshot including `extra` generators that are not registered already.
    #[must_use]
    pub fn snapshot_with(&self, extra: &[Arc<dyn TraceGenerator>]) -> Generators {
        let mut generators = self.generators.read().clone();
        for generator in extra {
            if !generators.iter().any(|g| same_generator(g, generator)) {
                generators.push(Arc::clone(generator));
            }
        }
        Generators(generators)
    }
}

/// Snapshot of a [`Registry`] used for one launch.
#[derive(Clone, Default)]
pub struct Generators(Vec<Arc<dyn TraceGenerator>>);

impl Generators {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn initialize(&self, launch: &LaunchInfo<'_>) {
        self.0.iter().for_each(|g| g.initialize(launch));
    }

    pub fn pre_instruction(&self, event: &InstructionEvent<'_>) {
        self.0.iter().for_each(|g| g.pre_instruction(event));
    }

    pub fn post_instruction(&self, event: &InstructionEvent<'_>) {
        self.0.iter().for_each(|g| g.post_instruction(event));
    }

    pub fn pre_memory(&self, event: &MemoryEvent<'_>) {
        self.0.iter().for_each(|g| g.pre_memory(event));
    }

    pub fn post_memory(&self, event: &MemoryEvent<'_>) {
        self.0.iter().for_each(|g| g.post_memory(event));
    }

    pub fn finish(&self, launch: &LaunchInfo<'_>) {
        self.0.iter().for_each(|g| g.finish(launch));
    }
}
