//! Emulation context of one kernel or device function.

use crate::cta::{self, Context, Cta, Snapshot};
use crate::device::LaunchConfig;
use crate::error::Error;
use crate::instruction::{Base, Operand, Pc, Reg};
use crate::linker::Linker;
use crate::memory::{
    next_multiple, AccessKind, GlobalMemory, Memory, Segment, PARAM_BASE, WINDOW_SIZE,
};
use crate::module::{ModuleSymbols, TextureBinding};
use crate::regalloc::{self, RegisterMap};
use crate::sequence::{self, Sequence};
use crate::sync::{Arc, Mutex, RwLock, Weak};
use crate::trace::{LaunchInfo, Registry, TraceGenerator};
use crate::config;
use indexmap::IndexMap;
use ptx::{Dim, Opcode, Point, Space};
use serde::Serialize;
use std::collections::HashSet;

/// Name of the region holding the call stack of each thread.
pub const STACK_REGION: &str = "$stack";

const FRAME_ALIGNMENT: u64 = 16;

/// Register and stack layout of a function's call frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameInfo {
    pub registers: usize,
    /// Register slot of each parameter.
    pub params: Vec<u32>,
    /// Register slot of each return value.
    pub returns: Vec<u32>,
    /// Bytes of stack memory used by the frame.
    pub frame_size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct KernelAttributes {
    pub registers: usize,
    pub shared_bytes: u64,
    pub const_bytes: u64,
    pub local_bytes: u64,
    pub param_bytes: u64,
    pub max_threads_per_block: u32,
}

/// Where a named variable ended up.
enum Placement {
    Absolute(u64),
    /// Offset into the current call frame.
    Frame(u64),
    Register(String),
}

#[derive(Debug)]
struct State {
    initialized: bool,
    shape: Dim,
    extern_shared: u64,
    /// Prepared body, before any function is linked into it.
    sequence: Arc<Sequence>,
    registers: RegisterMap,
    memory: Memory,
    /// Extern shared variables sharing the dynamic shared region.
    aliases: IndexMap<String, u64>,
    textures: Vec<String>,
    /// Module scope const and shared variables the body refers to.
    module_variables: Vec<String>,
    frame: FrameInfo,
}

/// A kernel prepared for emulation.
///
/// Device functions are emulation contexts too: their prepared body is what
/// gets linked into calling kernels.
pub struct EmulatedKernel {
    this: Weak<Self>,
    function: Arc<ptx::Function>,
    symbols: Arc<ModuleSymbols>,
    global: Arc<dyn GlobalMemory>,
    config: Arc<config::Emulator>,
    state: RwLock<State>,
    linker: RwLock<Linker>,
    arguments: Mutex<Vec<u8>>,
    trace_generators: Registry,
    worker_threads: Mutex<Option<usize>>,
    /// Held from setup to completion of a launch.
    launch_lock: Mutex<()>,
    last_block: Mutex<Option<Snapshot>>,
}

impl std::fmt::Debug for EmulatedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedKernel")
            .field("name", &self.name())
            .field("module", &self.symbols.name())
            .field("linkage", &self.function.linkage)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for EmulatedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let program = self.program();
        writeln!(
            f,
            ".{} {} // {} instructions",
            self.function.linkage,
            self.name(),
            program.len()
        )?;
        for inst in &program.instructions {
            if let Some(label) = program.block_starts.get(&inst.pc) {
                writeln!(f, "{label}:")?;
            }
            writeln!(f, "    {inst}")?;
        }
        Ok(())
    }
}

fn rewrite_symbols(
    sequence: &mut Sequence,
    mut place: impl FnMut(&str) -> Result<Option<Placement>, Error>,
) -> Result<(), Error> {
    for inst in &mut sequence.instructions {
        for operand in inst.operands_mut() {
            let replacement = match &*operand {
                Operand::Symbol(name) => place(name)?.map(|placement| match placement {
                    Placement::Absolute(address) => Operand::Immediate(address),
                    Placement::Frame(offset) => Operand::Address {
                        base: Base::Frame,
                        offset: offset as i64,
                    },
                    Placement::Register(reg) => Operand::Register(Reg::Virtual(reg)),
                }),
                Operand::Address {
                    base: Base::Symbol(name),
                    offset,
                } => place(name)?.map(|placement| match placement {
                    Placement::Absolute(address) => Operand::Address {
                        base: Base::Absolute(address),
                        offset: *offset,
                    },
                    Placement::Frame(frame_offset) => Operand::Address {
                        base: Base::Frame,
                        offset: frame_offset as i64 + offset,
                    },
                    Placement::Register(reg) => Operand::Address {
                        base: Base::Register(Reg::Virtual(reg)),
                        offset: *offset,
                    },
                }),
                _ => None,
            };
            if let Some(replacement) = replacement {
                *operand = replacement;
            }
        }
    }
    Ok(())
}

impl EmulatedKernel {
    #[must_use]
    pub fn new(
        function: Arc<ptx::Function>,
        symbols: Arc<ModuleSymbols>,
        global: Arc<dyn GlobalMemory>,
        config: Arc<config::Emulator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| {
            let state = State {
                initialized: false,
                shape: Dim::ONE,
                extern_shared: 0,
                sequence: Arc::new(Sequence::default()),
                registers: RegisterMap::default(),
                memory: Memory::new(&function.name, &config),
                aliases: IndexMap::new(),
                textures: Vec::new(),
                module_variables: Vec::new(),
                frame: FrameInfo::default(),
            };
            Self {
                this: this.clone(),
                function,
                symbols,
                global,
                config,
                state: RwLock::new(state),
                linker: RwLock::new(Linker::new(Sequence::default())),
                arguments: Mutex::new(Vec::new()),
                trace_generators: Registry::default(),
                worker_threads: Mutex::new(None),
                launch_lock: Mutex::new(()),
                last_block: Mutex::new(None),
            }
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.function.name
    }

    #[must_use]
    pub fn function(&self) -> &Arc<ptx::Function> {
        &self.function
    }

    #[must_use]
    pub fn symbols(&self) -> &Arc<ModuleSymbols> {
        &self.symbols
    }

    /// Whether this is an entry kernel that can be launched.
    #[must_use]
    pub fn executable(&self) -> bool {
        self.function.is_entry()
    }

    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.function.file.as_deref()
    }

    /// Prepare the kernel for execution.
    ///
    /// Builds the instruction sequence, rewrites parameter references,
    /// allocates registers, lays out memory, resolves variables and textures
    /// and finally invalidates every call target.
    pub fn initialize(&self) -> Result<(), Error> {
        let mut state = self.state.write();
        let mut sequence = sequence::sequence(&self.function)?;
        let textures = self.texture_discovery(&sequence)?;
        let (memory, aliases) = self.layout_memory(state.extern_shared, &textures)?;

        self.update_param_references(&mut sequence, &memory)?;

        let pinned: Vec<String> = if self.executable() {
            Vec::new()
        } else {
            self.function
                .params
                .iter()
                .chain(&self.function.returns)
                .map(|param| param.name.clone())
                .collect()
        };
        let registers = regalloc::allocate(
            self.name(),
            &mut sequence,
            &pinned,
            self.config.max_registers_per_thread,
        )?;

        let module_variables = self.resolve_symbols(&mut sequence, &memory, &aliases)?;

        let slots = |params: &[ptx::Param]| -> Result<Vec<u32>, Error> {
            params
                .iter()
                .map(|param| {
                    registers.slot(&param.name).ok_or_else(|| {
                        Error::invalid_kernel(
                            self.name(),
                            format!("parameter {} has no register", param.name),
                        )
                    })
                })
                .collect()
        };
        let frame = if self.executable() {
            FrameInfo {
                registers: registers.count,
                ..FrameInfo::default()
            }
        } else {
            FrameInfo {
                registers: registers.count,
                params: slots(&self.function.params)?,
                returns: slots(&self.function.returns)?,
                frame_size: next_multiple(memory.size(Segment::Stack), FRAME_ALIGNMENT),
            }
        };

        log::debug!(
            "initialized {} ({} instructions, {} registers, {} bytes shared)",
            self.name(),
            sequence.len(),
            registers.count,
            memory.size(Segment::Shared)
        );

        let mut linker = Linker::new(sequence.clone());
        linker.invalidate_call_targets();
        *self.linker.write() = linker;

        state.sequence = Arc::new(sequence);
        state.registers = registers;
        state.memory = memory;
        state.aliases = aliases;
        state.textures = textures;
        state.module_variables = module_variables;
        state.frame = frame;
        state.initialized = true;
        drop(state);

        self.update_globals()
    }

    /// Texture references used by the program, in order of first use.
    fn texture_discovery(&self, sequence: &Sequence) -> Result<Vec<String>, Error> {
        let mut textures: Vec<String> = Vec::new();
        for operand in sequence.instructions.iter().flat_map(|inst| inst.operands()) {
            let Operand::Texture(name) = operand else {
                continue;
            };
            if !self.symbols.has_texture(name) {
                return Err(Error::invalid_kernel(
                    self.name(),
                    format!("unknown texture reference {name}"),
                ));
            }
            if !textures.contains(name) {
                textures.push(name.clone());
            }
        }
        Ok(textures)
    }

    fn layout_memory(
        &self,
        extern_shared: u64,
        textures: &[String],
    ) -> Result<(Memory, IndexMap<String, u64>), Error> {
        let entry = self.executable();
        let module = self.symbols.module();
        let mut memory = Memory::new(self.name(), &self.config);
        let mut aliases = IndexMap::new();

        if entry {
            for param in &self.function.params {
                memory.declare(Segment::Param, &param.name, param.size, param.align)?;
            }
        }

        // module scope variables come first so they have the same address in
        // every kernel of the module
        for var in &module.variables {
            match var.space {
                Space::Const => {
                    memory.declare(Segment::Const, &var.name, var.size(), var.align)?;
                }
                Space::Shared if !var.external => {
                    memory.declare(Segment::GlobalShared, &var.name, var.size(), var.align)?;
                }
                _ => {}
            }
        }

        let mut dynamic = Vec::new();
        for var in &self.function.variables {
            let segment = match (var.space, entry) {
                (Space::Shared, true) if var.external => {
                    dynamic.push(var);
                    continue;
                }
                (Space::Shared, true) => Segment::Shared,
                (Space::Const, true) => Segment::Const,
                (Space::Local, true) => Segment::Local,
                (Space::Local, false) => Segment::Stack,
                (space, _) => {
                    return Err(Error::invalid_kernel(
                        self.name(),
                        format!(
                            "{space} variable {} is not supported in .{} functions",
                            var.name, self.function.linkage
                        ),
                    ));
                }
            };
            memory.declare(segment, &var.name, var.size(), var.align)?;
        }

        if entry {
            dynamic.extend(
                module
                    .variables
                    .iter()
                    .filter(|var| var.space == Space::Shared && var.external),
            );
            // all extern shared arrays start at the dynamic shared region
            if let Some((first, rest)) = dynamic.split_first() {
                let region =
                    memory.declare(Segment::Shared, &first.name, extern_shared, first.align)?;
                for var in rest {
                    aliases.insert(var.name.clone(), region.address());
                }
            }
            let stack_size = self.config.stack_size_per_thread.min(WINDOW_SIZE);
            memory.declare(Segment::Stack, STACK_REGION, stack_size, FRAME_ALIGNMENT)?;
        }

        for texture in textures {
            memory.declare(Segment::Texture, texture, 8, 8)?;
        }
        Ok((memory, aliases))
    }

    /// Rewrite references to parameters.
    ///
    /// Kernel parameters live in parameter memory. Device function
    /// parameters and return values are passed in registers, so their loads
    /// and stores become moves.
    fn update_param_references(&self, sequence: &mut Sequence, memory: &Memory) -> Result<(), Error> {
        if self.executable() {
            return rewrite_symbols(sequence, |name| {
                Ok(memory
                    .resolve(Segment::Param, name)
                    .map(|region| Placement::Absolute(region.address())))
            });
        }

        let names: HashSet<&str> = self
            .function
            .params
            .iter()
            .chain(&self.function.returns)
            .map(|param| param.name.as_str())
            .collect();
        for inst in &mut sequence.instructions {
            let param = match &inst.a {
                Some(Operand::Address {
                    base: Base::Symbol(name),
                    offset,
                }) if names.contains(name.as_str()) => Some((name.clone(), *offset)),
                _ => None,
            };
            let Some((name, offset)) = param else {
                continue;
            };
            if !matches!(inst.opcode, Opcode::Ld(Space::Param) | Opcode::St(Space::Param)) {
                continue;
            }
            if offset != 0 {
                return Err(Error::invalid_kernel(
                    self.name(),
                    format!("parameter {name} is accessed at offset {offset}"),
                ));
            }
            if inst.opcode == Opcode::Ld(Space::Param) {
                inst.a = Some(Operand::Register(Reg::Virtual(name)));
            } else {
                inst.d = Some(Operand::Register(Reg::Virtual(name)));
                inst.a = inst.b.take();
            }
            inst.opcode = Opcode::Mov;
        }
        rewrite_symbols(sequence, |name| {
            Ok(names
                .contains(name)
                .then(|| Placement::Register(name.to_string())))
        })
    }

    /// Replace every variable name with its address.
    ///
    /// Returns the module scope const and shared variables that were
    /// resolved into this kernel's own memory windows.
    fn resolve_symbols(
        &self,
        sequence: &mut Sequence,
        memory: &Memory,
        aliases: &IndexMap<String, u64>,
    ) -> Result<Vec<String>, Error> {
        let mut module_variables: Vec<String> = Vec::new();
        rewrite_symbols(sequence, |name| {
            if let Some(address) = aliases.get(name) {
                return Ok(Some(Placement::Absolute(*address)));
            }
            if let Some(region) = memory.lookup(name) {
                let placement = match region.segment {
                    Segment::Stack => Placement::Frame(region.offset),
                    Segment::Const | Segment::GlobalShared => {
                        if !module_variables.iter().any(|var| var == name) {
                            module_variables.push(name.to_string());
                        }
                        Placement::Absolute(region.address())
                    }
                    _ => Placement::Absolute(region.address()),
                };
                return Ok(Some(placement));
            }
            if let Some(symbol) = self.symbols.global(name) {
                return Ok(Some(Placement::Absolute(symbol.address)));
            }
            Err(Error::invalid_kernel(
                self.name(),
                format!("unresolved symbol {name}"),
            ))
        })?;
        Ok(module_variables)
    }

    pub fn set_kernel_shape(&self, x: u32, y: u32, z: u32) {
        let shape = Dim::new(x, y, z);
        let mut state = self.state.write();
        if state.shape != shape {
            log::debug!("{}: block shape {} -> {shape}", self.name(), state.shape);
            state.shape = shape;
        }
    }

    #[must_use]
    pub fn kernel_shape(&self) -> Dim {
        self.state.read().shape
    }

    /// Set the size of dynamically sized shared memory.
    ///
    /// The kernel is left unchanged if the new size does not fit.
    pub fn set_extern_shared_memory_size(&self, bytes: u64) -> Result<(), Error> {
        let mut state = self.state.write();
        if state.extern_shared == bytes {
            return Ok(());
        }
        if !state.initialized {
            state.extern_shared = bytes;
            return Ok(());
        }
        let (memory, aliases) = self.layout_memory(bytes, &state.textures)?;
        log::debug!("{}: extern shared memory {} -> {bytes} bytes", self.name(), state.extern_shared);
        state.extern_shared = bytes;
        state.memory = memory;
        state.aliases = aliases;
        drop(state);
        self.update_argument_memory()?;
        self.update_globals()
    }

    /// Rebuild the memory layout for the current extern shared size.
    ///
    /// Parameter and constant contents are reloaded.
    pub fn update_memory(&self) -> Result<(), Error> {
        {
            let mut state = self.state.write();
            let (memory, aliases) = self.layout_memory(state.extern_shared, &state.textures)?;
            state.memory = memory;
            state.aliases = aliases;
        }
        self.update_argument_memory()?;
        self.update_globals()
    }

    /// Copy constant memory from the device, or from initializers for
    /// variables without a device allocation.
    pub fn update_globals(&self) -> Result<(), Error> {
        let module = self.symbols.module();
        let mut state = self.state.write();
        let memory = &mut state.memory;
        let mut constant = vec![0u8; memory.size(Segment::Const) as usize];
        for region in memory.regions(Segment::Const).filter(|region| region.size > 0) {
            let range = region.offset as usize..(region.offset + region.size) as usize;
            let bytes = &mut constant[range];
            let device = self
                .symbols
                .global(&region.name)
                .filter(|symbol| symbol.size == region.size);
            if let Some(symbol) = device {
                self.global.read(symbol.address, bytes)?;
                continue;
            }
            let initializer = self
                .function
                .variables
                .iter()
                .chain(&module.variables)
                .find(|var| var.name == region.name)
                .and_then(|var| var.initializer.as_ref());
            if let Some(initializer) = initializer {
                let len = initializer.len().min(bytes.len());
                bytes[..len].copy_from_slice(&initializer[..len]);
            }
        }
        memory.constant = constant;
        Ok(())
    }

    /// Replace the argument block of the next launch.
    pub fn set_arguments(&self, arguments: &[u8]) {
        *self.arguments.lock() = arguments.to_vec();
    }

    /// Set a single named argument of the next launch.
    pub fn set_argument(&self, name: &str, value: &[u8]) -> Result<(), Error> {
        let state = self.state.read();
        let region = state
            .memory
            .resolve(Segment::Param, name)
            .ok_or_else(|| Error::UnresolvedSymbol {
                symbol: name.to_string(),
            })?;
        if value.len() as u64 > region.size {
            return Err(Error::InvalidMemoryAccess {
                kind: AccessKind::Write,
                address: region.address(),
                size: value.len() as u64,
                pc: 0,
                thread: 0,
            });
        }
        let size = state.memory.size(Segment::Param) as usize;
        let mut arguments = self.arguments.lock();
        if arguments.len() < size {
            arguments.resize(size, 0);
        }
        let start = region.offset as usize;
        arguments[start..start + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Copy the argument block into parameter memory.
    pub fn update_argument_memory(&self) -> Result<(), Error> {
        let mut state = self.state.write();
        let arguments = self.arguments.lock();
        let size = state.memory.size(Segment::Param);
        if arguments.len() as u64 > size {
            return Err(Error::InvalidMemoryAccess {
                kind: AccessKind::Write,
                address: PARAM_BASE,
                size: arguments.len() as u64,
                pc: 0,
                thread: 0,
            });
        }
        let mut param = arguments.clone();
        param.resize(size as usize, 0);
        state.memory.param = param;
        Ok(())
    }

    pub fn set_worker_threads(&self, threads: Option<usize>) {
        *self.worker_threads.lock() = threads;
    }

    #[must_use]
    pub fn num_worker_threads(&self) -> usize {
        self.worker_threads
            .lock()
            .map_or_else(|| self.config.num_worker_threads(), |threads| threads.max(1))
    }

    pub fn add_trace_generator(&self, generator: Arc<dyn TraceGenerator>) {
        self.trace_generators.add(generator);
    }

    pub fn remove_trace_generator(&self, generator: &Arc<dyn TraceGenerator>) -> bool {
        self.trace_generators.remove(generator)
    }

    /// Prepared body, without linked functions.
    #[must_use]
    pub fn sequence(&self) -> Arc<Sequence> {
        Arc::clone(&self.state.read().sequence)
    }

    /// Executable program including all functions linked so far.
    #[must_use]
    pub fn program(&self) -> Arc<Sequence> {
        self.linker.read().program()
    }

    #[must_use]
    pub fn frame_info(&self) -> FrameInfo {
        self.state.read().frame.clone()
    }

    #[must_use]
    pub fn register_map(&self) -> RegisterMap {
        self.state.read().registers.clone()
    }

    /// Link the function `name` called at `call_pc`, returning its entry PC.
    ///
    /// Linking an already linked function only patches the call site.
    pub fn lazy_link(&self, call_pc: Pc, name: &str) -> Result<Pc, Error> {
        let mut linker = self.linker.write();
        if let Some(entry) = linker.entry_point(name) {
            linker.patch(call_pc, entry)?;
            return Ok(entry);
        }
        let callee = self
            .symbols
            .function(name)
            .ok_or_else(|| Error::UnresolvedSymbol {
                symbol: name.to_string(),
            })?;
        if callee.executable() {
            return Err(Error::invalid_kernel(
                self.name(),
                format!("cannot call entry kernel {name}"),
            ));
        }
        if !Arc::ptr_eq(callee.symbols(), &self.symbols) {
            // const, module shared and texture addresses are laid out per module
            let used = callee
                .module_variables()
                .into_iter()
                .chain(callee.texture_references())
                .next();
            if let Some(var) = used {
                return Err(Error::invalid_kernel(
                    self.name(),
                    format!(
                        "{name} of module {} uses {var}, which is not visible from module {}",
                        callee.symbols().name(),
                        self.symbols.name()
                    ),
                ));
            }
        }
        let entry = linker.link(&callee);
        linker.patch(call_pc, entry)?;
        Ok(entry)
    }

    /// Function owning the entry point at `pc`.
    #[must_use]
    pub fn get_kernel(&self, pc: Pc) -> Option<Arc<EmulatedKernel>> {
        if pc == 0 {
            return self.this.upgrade();
        }
        self.linker.read().get_kernel(pc)
    }

    /// Check that `pc` is a resolved entry point.
    pub fn jump_to_pc(&self, pc: Pc) -> Result<(), Error> {
        if self.linker.read().is_entry(pc) {
            Ok(())
        } else {
            Err(Error::UnresolvedSymbol {
                symbol: format!("<pc {pc}>"),
            })
        }
    }

    /// Module scope const and shared variables used by the body.
    #[must_use]
    pub fn module_variables(&self) -> Vec<String> {
        self.state.read().module_variables.clone()
    }

    #[must_use]
    pub fn texture_references(&self) -> Vec<String> {
        self.state.read().textures.clone()
    }

    #[must_use]
    pub fn texture_binding(&self, name: &str) -> Option<TextureBinding> {
        self.symbols.texture(name)
    }

    /// Whether an access of `size` bytes at `address` lies inside exactly one
    /// region permitting `kind`, either in kernel memory or in device memory.
    #[must_use]
    pub fn check_memory_access(&self, address: u64, size: u64, kind: AccessKind) -> bool {
        match Segment::of(address) {
            Some(_) => self.state.read().memory.check_access(address, size, kind),
            None => self.global.contains(address, size),
        }
    }

    /// Source location of the instruction at `pc`.
    #[must_use]
    pub fn location(&self, pc: Pc) -> Option<String> {
        let program = self.program();
        let location = program.get(pc)?.location.as_ref()?;
        Some(location.to_string())
    }

    /// Label of the basic block containing `pc`.
    #[must_use]
    pub fn instruction_block(&self, pc: Pc) -> Option<String> {
        self.program().block_of(pc).map(str::to_string)
    }

    #[must_use]
    pub fn attributes(&self) -> KernelAttributes {
        let state = self.state.read();
        let memory = &state.memory;
        KernelAttributes {
            registers: state.registers.count,
            shared_bytes: memory.size(Segment::Shared) + memory.size(Segment::GlobalShared),
            const_bytes: memory.size(Segment::Const),
            local_bytes: if self.executable() {
                memory.size(Segment::Local)
            } else {
                state.frame.frame_size
            },
            param_bytes: memory.size(Segment::Param),
            max_threads_per_block: self.config.max_threads_per_block,
        }
    }

    /// State of the last thread block of the last launch.
    ///
    /// After a fault this is the faulting block.
    #[must_use]
    pub fn last_block(&self) -> Option<Snapshot> {
        self.last_block.lock().clone()
    }

    /// Kernel frame registers of every thread of the last block.
    #[must_use]
    pub fn current_register_file(&self) -> Vec<Vec<u64>> {
        self.last_block
            .lock()
            .as_ref()
            .map(|block| block.registers.clone())
            .unwrap_or_default()
    }

    /// Value of virtual register `name` of `thread` in the last block.
    #[must_use]
    pub fn register(&self, thread: usize, name: &str) -> Option<u64> {
        let slot = self.state.read().registers.slot(name)?;
        let last = self.last_block.lock();
        last.as_ref()?
            .registers
            .get(thread)?
            .get(slot as usize)
            .copied()
    }

    /// Shared memory of the last block.
    #[must_use]
    pub fn shared_memory(&self) -> Vec<u8> {
        self.last_block
            .lock()
            .as_ref()
            .map(|block| block.shared.clone())
            .unwrap_or_default()
    }

    fn keep_snapshot(&self, snapshot: Snapshot) {
        let mut last = self.last_block.lock();
        let faulted = last
            .as_ref()
            .is_some_and(|block| block.status == cta::Status::Faulted);
        if !faulted {
            *last = Some(snapshot);
        }
    }

    fn run_block(&self, ctx: &Context<'_>, block_id: Point) -> Result<(), Error> {
        let mut cta = Cta::new(ctx, block_id);
        let result = cta.run();
        self.keep_snapshot(cta.into_snapshot());
        result
    }

    fn run_blocks(&self, ctx: &Context<'_>) -> Result<(), Error> {
        let blocks: Vec<Point> = ctx.grid.points().collect();

        #[cfg(feature = "parallel")]
        let workers = self.num_worker_threads().min(blocks.len());
        #[cfg(feature = "parallel")]
        if workers > 1 {
            match crate::parallel::rayon_pool(workers) {
                Ok(pool) => {
                    use rayon::prelude::*;
                    log::debug!("{}: running {} blocks on {workers} workers", self.name(), blocks.len());
                    return pool.install(|| {
                        blocks
                            .par_iter()
                            .try_for_each(|block_id| self.run_block(ctx, *block_id))
                    });
                }
                Err(err) => {
                    log::warn!("{}: failed to build worker pool ({err}), running serially", self.name());
                }
            }
        }

        log::debug!("{}: running {} blocks serially", self.name(), blocks.len());
        blocks
            .into_iter()
            .try_for_each(|block_id| self.run_block(ctx, block_id))
    }

    /// Run a `width` x `height` grid of thread blocks.
    ///
    /// Blocks run to completion independently of each other. The first
    /// failing block aborts the launch.
    #[tracing::instrument(skip(self))]
    pub fn launch_grid(&self, width: u32, height: u32) -> Result<(), Error> {
        let _launch = self.launch_lock.lock();
        self.run_grid(width, height, &[])
    }

    /// Configure and run one launch.
    ///
    /// Launches of the same kernel are serialised, so each one runs with its
    /// own block shape, shared memory size and arguments. `generators` only
    /// observe this launch.
    pub fn launch(
        &self,
        launch: &LaunchConfig,
        worker_threads: Option<usize>,
        generators: &[Arc<dyn TraceGenerator>],
    ) -> Result<(), Error> {
        let _launch = self.launch_lock.lock();
        let block = launch.block;
        self.set_kernel_shape(block.x, block.y, block.z);
        self.set_extern_shared_memory_size(launch.shared_memory)?;
        self.set_worker_threads(worker_threads);
        self.set_arguments(&launch.arguments);
        self.update_argument_memory()?;
        self.update_globals()?;
        self.run_grid(launch.grid.x, launch.grid.y, generators)
    }

    fn run_grid(
        &self,
        width: u32,
        height: u32,
        extra_generators: &[Arc<dyn TraceGenerator>],
    ) -> Result<(), Error> {
        let grid = Dim::new(width, height, 1);
        let state = self.state.read();
        if !state.initialized {
            return Err(Error::invalid_kernel(self.name(), "kernel is not initialized"));
        }
        if !self.executable() {
            return Err(Error::invalid_kernel(
                self.name(),
                "device functions cannot be launched",
            ));
        }
        let block = state.shape;
        if block.size() == 0 || block.size() > u64::from(self.config.max_threads_per_block) {
            return Err(Error::invalid_kernel(
                self.name(),
                format!(
                    "block {block} has {} threads (limit is {})",
                    block.size(),
                    self.config.max_threads_per_block
                ),
            ));
        }

        *self.last_block.lock() = None;
        let generators = self.trace_generators.snapshot_with(extra_generators);
        let launch = LaunchInfo {
            kernel: self.name(),
            grid,
            block,
        };
        log::debug!("launch {} with grid {grid} and block {block}", self.name());
        generators.initialize(&launch);
        let ctx = Context {
            kernel: self,
            memory: &state.memory,
            registers: state.registers.count,
            grid,
            block,
            generators: &generators,
            global: self.global.as_ref(),
            config: &self.config,
        };
        let result = self.run_blocks(&ctx);
        generators.finish(&launch);
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::config;
    use crate::cta::Status;
    use crate::device::{Device, LaunchConfig};
    use crate::error::Error;
    use crate::memory::{AccessKind, PARAM_BASE};
    use crate::sync::Arc;
    use crate::testing::{self, kernels, Recorder};
    use crate::trace::{BasicBlockCounter, TraceGenerator};
    use color_eyre::eyre;
    use ptx::builder::*;
    use ptx::{Space, Type, Variable};
    use similar_asserts as diff;

    #[test]
    fn test_kernel_shape() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::vector_add()))?;
        let kernel = device.kernel("vector_add", "vector_add")?;
        diff::assert_eq!(have: kernel.kernel_shape(), want: ptx::Dim::ONE);
        kernel.set_kernel_shape(4, 4, 1);
        diff::assert_eq!(have: kernel.kernel_shape(), want: ptx::Dim::new(4, 4, 1));
        diff::assert_eq!(have: kernel.kernel_shape().to_string(), want: "(4,4,1)");
        Ok(())
    }

    #[test]
    fn test_jump_to_pc_only_accepts_entry_points() -> eyre::Result<()> {
        let device = testing::device();
        device.load(kernels::calls())?;
        let kernel = device.kernel("calls", "squares")?;
        kernel.jump_to_pc(0)?;
        diff::assert_eq!(
            have: kernel.jump_to_pc(2),
            want: Err(Error::UnresolvedSymbol { symbol: "<pc 2>".to_string() })
        );

        let call_pc = kernel
            .program()
            .instructions
            .iter()
            .find(|inst| inst.call.is_some())
            .map(|inst| inst.pc)
            .ok_or_else(|| eyre::eyre!("no call"))?;
        let entry = kernel.lazy_link(call_pc, "sum_of_squares")?;
        kernel.jump_to_pc(entry)?;
        assert!(kernel.jump_to_pc(entry + 1).is_err());
        Ok(())
    }

    #[test]
    fn test_lazy_link_is_idempotent() -> eyre::Result<()> {
        let device = testing::device();
        device.load(kernels::calls())?;
        let kernel = device.kernel("calls", "squares")?;
        let body = kernel.program().len();
        let call_pc = kernel
            .program()
            .instructions
            .iter()
            .find(|inst| inst.call.is_some())
            .map(|inst| inst.pc)
            .ok_or_else(|| eyre::eyre!("no call"))?;

        let entry = kernel.lazy_link(call_pc, "sum_of_squares")?;
        diff::assert_eq!(have: entry, want: body);
        let linked = kernel.program().len();
        diff::assert_eq!(have: kernel.lazy_link(call_pc, "sum_of_squares")?, want: entry);
        diff::assert_eq!(have: kernel.program().len(), want: linked);

        let owner = kernel.get_kernel(entry).ok_or_else(|| eyre::eyre!("no owner"))?;
        diff::assert_eq!(have: owner.name(), want: "sum_of_squares");
        diff::assert_eq!(have: kernel.get_kernel(0).map(|k| k.name().to_string()), want: Some("squares".to_string()));
        diff::assert_eq!(have: kernel.get_kernel(entry + 1).map(|k| k.name().to_string()), want: None);

        diff::assert_eq!(
            have: kernel.lazy_link(call_pc, "nowhere"),
            want: Err(Error::UnresolvedSymbol { symbol: "nowhere".to_string() })
        );
        assert!(matches!(
            kernel.lazy_link(call_pc, "squares"),
            Err(Error::InvalidKernel { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_divergent_arms_produce_per_thread_values() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::divergent_arms()))?;
        let have = testing::run_with_output(&device, "divergent_arms", "divergent_arms", LaunchConfig::new(1u32, 4u32))?;
        diff::assert_eq!(have: have, want: vec![10, 11, 102, 103]);

        let kernel = device.kernel("divergent_arms", "divergent_arms")?;
        let registers: Vec<_> = (0..4).map(|tid| kernel.register(tid, "%r")).collect();
        diff::assert_eq!(have: registers, want: vec![Some(10), Some(11), Some(102), Some(103)]);
        diff::assert_eq!(have: kernel.current_register_file().len(), want: 4);
        Ok(())
    }

    #[test]
    fn test_barrier_rendezvous_of_divergent_halves() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::barrier_split()))?;
        let recorder = Arc::new(Recorder::default());
        device.add_trace_generator(recorder.clone());
        let have = testing::run_with_output(&device, "barrier_split", "barrier_split", LaunchConfig::new(1u32, 4u32))?;
        diff::assert_eq!(have: have, want: vec![30, 20, 2, 1]);

        let join: Vec<_> = recorder
            .instructions()
            .into_iter()
            .filter(|executed| executed.block.as_deref() == Some("join"))
            .map(|executed| executed.active.count_ones())
            .collect();
        diff::assert_eq!(have: join, want: vec![4]);

        let kernel = device.kernel("barrier_split", "barrier_split")?;
        let shared: Vec<u32> = kernel
            .shared_memory()
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        diff::assert_eq!(have: shared, want: vec![1, 2, 20, 30]);
        Ok(())
    }

    #[test]
    fn test_barrier_deadlock_is_detected() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::barrier_deadlock()))?;
        let result = device.launch("barrier_deadlock", "barrier_deadlock", &LaunchConfig::new(1u32, 4u32));
        match result {
            Err(Error::ExecutionFault { message, .. }) => assert!(message.contains("deadlock"), "{message}"),
            other => eyre::bail!("expected a deadlock, got {other:?}"),
        }
        let kernel = device.kernel("barrier_deadlock", "barrier_deadlock")?;
        let block = kernel.last_block().ok_or_else(|| eyre::eyre!("no snapshot"))?;
        diff::assert_eq!(have: block.status, want: Status::Faulted);
        Ok(())
    }

    #[test]
    fn test_predication() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::predicated()))?;
        let have = testing::run_with_output(&device, "predicated", "predicated", LaunchConfig::new(1u32, 4u32))?;
        diff::assert_eq!(have: have, want: vec![6, 7, 6, 6]);
        Ok(())
    }

    #[test]
    fn test_nested_calls_with_stack_variables() -> eyre::Result<()> {
        let device = testing::device();
        device.load(kernels::calls())?;
        let have = testing::run_with_output(&device, "calls", "squares", LaunchConfig::new(2u32, 4u32))?;
        let want: Vec<u32> = (0..2).flat_map(|_| (0..4).map(|t| t * t + 9)).collect();
        diff::assert_eq!(have: have, want: want);

        let function = device.kernel("calls", "sum_of_squares")?;
        diff::assert_eq!(have: function.frame_info().params.len(), want: 2);
        diff::assert_eq!(have: function.frame_info().frame_size, want: 16);
        assert!(!function.executable());
        assert!(function.launch_grid(1, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_unresolved_call_faults_when_reached() -> eyre::Result<()> {
        let device = testing::device();
        device.load(kernels::missing_call())?;
        let result = testing::run_with_output(&device, "missing", "calls_missing", LaunchConfig::new(1u32, 2u32));
        assert!(result.is_err());
        diff::assert_eq!(
            have: device.last_error(),
            want: Some(Error::UnresolvedSymbol { symbol: "nowhere".to_string() })
        );
        let kernel = device.kernel("missing", "calls_missing")?;
        let block = kernel.last_block().ok_or_else(|| eyre::eyre!("no snapshot"))?;
        diff::assert_eq!(have: block.status, want: Status::Faulted);
        diff::assert_eq!(have: block.pc, want: Some(1));
        Ok(())
    }

    #[test]
    fn test_calls_across_modules() -> eyre::Result<()> {
        let device = testing::device();
        device.load(kernels::remote_caller())?;
        device.load(kernels::library())?;
        let have = testing::run_with_output(&device, "caller", "remote_square", LaunchConfig::new(1u32, 4u32))?;
        diff::assert_eq!(have: have, want: vec![0, 1, 4, 9]);
        Ok(())
    }

    #[test]
    fn test_module_constants_in_linked_functions() -> eyre::Result<()> {
        let device = testing::device();
        device.load(kernels::constant_module())?;
        let getter = device.kernel("constant_module", "get")?;
        diff::assert_eq!(have: getter.module_variables(), want: vec!["lut".to_string()]);
        let have = testing::run_with_output(&device, "constant_module", "read_lut", LaunchConfig::new(1u32, 2u32))?;
        diff::assert_eq!(have: have, want: vec![7, 7]);
        Ok(())
    }

    #[test]
    fn test_calls_across_modules_reject_module_constants() -> eyre::Result<()> {
        let device = testing::device();
        device.load(kernels::constant_caller())?;
        device.load(kernels::constant_library())?;
        let result = testing::run_with_output(&device, "constant_caller", "read_lut", LaunchConfig::new(1u32, 2u32));
        let err = result.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::InvalidKernel { kernel, message }) => {
                diff::assert_eq!(have: kernel.as_str(), want: "read_lut");
                assert!(message.contains("lut"), "{message}");
            }
            other => eyre::bail!("unexpected error {other:?}"),
        }
        assert!(matches!(device.last_error(), Some(Error::InvalidKernel { .. })));
        Ok(())
    }

    #[test]
    fn test_basic_block_counter()-> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::vector_add()))?;
        let counter = Arc::new(BasicBlockCounter::new());
        let kernel = device.kernel("vector_add", "vector_add")?;
        let generator: Arc<dyn TraceGenerator> = counter.clone();
        kernel.add_trace_generator(generator.clone());

        let n = 40u32;
        let a = testing::upload(&device, &[1; 64])?;
        let b = testing::upload(&device, &[2; 64])?;
        let c = device.allocate(64 * 4)?;
        let launch = LaunchConfig::new((2u32, 1u32), 32u32)
            .arg(&a.to_le_bytes())
            .arg(&b.to_le_bytes())
            .arg(&c.to_le_bytes())
            .arg(&n.to_le_bytes());
        device.launch("vector_add", "vector_add", &launch)?;

        diff::assert_eq!(have: counter.count("vector_add", "$entry"), want: 64);
        diff::assert_eq!(have: counter.count("vector_add", "body"), want: 40);
        diff::assert_eq!(have: counter.count("vector_add", "done"), want: 64);
        let c = testing::download(&device, c, 64)?;
        diff::assert_eq!(have: c.iter().filter(|value| **value == 3).count(), want: 40);

        assert!(kernel.remove_trace_generator(&generator));
        assert!(!kernel.remove_trace_generator(&generator));
        Ok(())
    }

    #[test]
    fn test_parallel_and_serial_launches_agree() -> eyre::Result<()> {
        let n = 3u32;
        let launch = LaunchConfig::new(8u32, 8u32).arg(&n.to_le_bytes());
        let run = |threads: usize| -> eyre::Result<Vec<u32>> {
            let device = testing::device();
            device.limit_worker_threads(Some(threads));
            device.load(testing::module(kernels::loop_sum()))?;
            testing::run_with_output(&device, "loop_sum", "loop_sum", launch.clone())
        };
        let serial = run(1)?;
        let parallel = run(4)?;
        diff::assert_eq!(have: &parallel, want: &serial);
        let want: Vec<u32> = (0..8)
            .flat_map(|_| (0..8).map(|t| (n + t) * (n + t - 1) / 2))
            .collect();
        diff::assert_eq!(have: serial, want: want);
        Ok(())
    }

    #[test]
    fn test_atomics_across_blocks() -> eyre::Result<()> {
        let device = testing::device();
        device.limit_worker_threads(Some(4));
        device.load(testing::module(kernels::atomic_count()))?;
        let counter = device.allocate(4)?;
        let launch = LaunchConfig::new(8u32, 16u32).arg(&counter.to_le_bytes());
        device.launch("atomic_count", "atomic_count", &launch)?;
        diff::assert_eq!(have: testing::download(&device, counter, 1)?, want: vec![128]);
        Ok(())
    }

    #[test]
    fn test_dynamic_shared_memory() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::dynamic_shared()))?;
        let launch = LaunchConfig::new(1u32, 8u32).shared_memory(8 * 4);
        let have = testing::run_with_output(&device, "dynamic_shared", "dynamic_shared", launch)?;
        diff::assert_eq!(have: have, want: vec![1, 2, 3, 4, 5, 6, 7, 0]);

        // the extern arrays are empty unless a size is requested
        let launch = LaunchConfig::new(1u32, 8u32);
        let result = testing::run_with_output(&device, "dynamic_shared", "dynamic_shared", launch);
        assert!(result.is_err());
        assert!(matches!(device.last_error(), Some(Error::InvalidMemoryAccess { .. })));
        Ok(())
    }

    #[test]
    fn test_shared_memory_overflow() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::dynamic_shared()))?;
        let kernel = device.kernel("dynamic_shared", "dynamic_shared")?;
        let capacity = device.properties().shared_memory_per_block;
        kernel.set_extern_shared_memory_size(capacity)?;
        assert!(matches!(
            kernel.set_extern_shared_memory_size(capacity + 1),
            Err(Error::OutOfMemory { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_register_budget_rejects_kernel() {
        let device = testing::device_with_config(config::Emulator {
            max_registers_per_thread: 2,
            ..config::Emulator::default()
        });
        let result = device.load(testing::module(kernels::vector_add()));
        assert!(matches!(result, Err(Error::OutOfRegisters { limit: 2, .. })), "{result:?}");
        diff::assert_eq!(have: device.modules(), want: Vec::<String>::new());
    }

    #[test]
    fn test_unsupported_variables_are_rejected() {
        let func = FunctionBuilder::func("f")
            .variable(Variable::new("cache", Space::Shared, Type::U32, 4))
            .push(ret())
            .build();
        let device = testing::device();
        let result = device.load(testing::module(func));
        assert!(matches!(result, Err(Error::InvalidKernel { .. })), "{result:?}");
    }

    #[test]
    fn test_unknown_texture_is_rejected() {
        let entry = FunctionBuilder::entry("k")
            .push(tex(ptx::TexGeometry::D1, Type::U32, reg("%v"), "missing", imm(0), None))
            .build();
        let device = testing::device();
        let result = device.load(testing::module(entry));
        assert!(matches!(result, Err(Error::InvalidKernel { .. })), "{result:?}");
    }

    #[test]
    fn test_texture_references() -> eyre::Result<()> {
        let device = testing::device();
        device.load(kernels::texture_fetch())?;
        let kernel = device.kernel("textures", "fetch")?;
        diff::assert_eq!(have: kernel.texture_references(), want: vec!["tex".to_string()]);
        Ok(())
    }

    #[test]
    fn test_check_memory_access() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::vector_add()))?;
        let kernel = device.kernel("vector_add", "vector_add")?;
        assert!(kernel.check_memory_access(PARAM_BASE, 8, AccessKind::Read));
        assert!(kernel.check_memory_access(PARAM_BASE + 24, 4, AccessKind::Read));
        assert!(!kernel.check_memory_access(PARAM_BASE, 8, AccessKind::Write));
        assert!(!kernel.check_memory_access(PARAM_BASE + 24, 8, AccessKind::Read));

        let buffer = device.allocate(16)?;
        assert!(kernel.check_memory_access(buffer, 16, AccessKind::Write));
        assert!(!kernel.check_memory_access(buffer + 8, 16, AccessKind::Write));
        assert!(!kernel.check_memory_access(0, 4, AccessKind::Read));
        Ok(())
    }

    #[test]
    fn test_arguments() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::vector_add()))?;
        let kernel = device.kernel("vector_add", "vector_add")?;

        kernel.set_argument("n", &7u32.to_le_bytes())?;
        kernel.update_argument_memory()?;
        diff::assert_eq!(have: kernel.attributes().param_bytes, want: 28);
        assert!(matches!(
            kernel.set_argument("n", &7u64.to_le_bytes()),
            Err(Error::InvalidMemoryAccess { .. })
        ));
        assert!(matches!(
            kernel.set_argument("m", &7u32.to_le_bytes()),
            Err(Error::UnresolvedSymbol { .. })
        ));

        kernel.set_arguments(&[0; 32]);
        diff::assert_eq!(
            have: kernel.update_argument_memory(),
            want: Err(Error::InvalidMemoryAccess {
                kind: AccessKind::Write,
                address: PARAM_BASE,
                size: 32,
                pc: 0,
                thread: 0,
            })
        );
        Ok(())
    }

    #[test]
    fn test_source_information() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::vector_add()))?;
        let kernel = device.kernel("vector_add", "vector_add")?;
        assert!(kernel.executable());
        diff::assert_eq!(have: kernel.file_name(), want: Some("vector_add.cu"));
        diff::assert_eq!(have: kernel.location(3), want: Some("vector_add.cu:3".to_string()));
        diff::assert_eq!(have: kernel.location(0), want: None);
        diff::assert_eq!(have: kernel.instruction_block(0).as_deref(), want: Some("$entry"));
        diff::assert_eq!(have: kernel.instruction_block(7).as_deref(), want: Some("body"));

        let listing = kernel.to_string();
        assert!(listing.starts_with(".entry vector_add"), "{listing}");
        assert!(listing.contains("body:"), "{listing}");
        Ok(())
    }

    #[test]
    fn test_launch_notifies_generators() -> eyre::Result<()> {
        let device = testing::device();
        device.load(testing::module(kernels::predicated()))?;
        let kernel = device.kernel("predicated", "predicated")?;
        let recorder = Arc::new(Recorder::default());
        kernel.add_trace_generator(recorder.clone());
        testing::run_with_output(&device, "predicated", "predicated", LaunchConfig::new(1u32, 4u32))?;
        diff::assert_eq!(have: recorder.launches(), want: vec!["predicated".to_string()]);
        diff::assert_eq!(have: recorder.finished(), want: vec!["predicated".to_string()]);
        let stores: Vec<_> = recorder
            .memory()
            .into_iter()
            .filter(|access| access.kind == AccessKind::Write)
            .filter_map(|access| access.value)
            .collect();
        diff::assert_eq!(have: stores, want: vec![6, 7, 6, 6]);

        let oversized = LaunchConfig::new(1u32, 2048u32);
        assert!(matches!(
            device.launch("predicated", "predicated", &oversized),
            Err(Error::InvalidKernel { .. })
        ));
        Ok(())
    }
}
