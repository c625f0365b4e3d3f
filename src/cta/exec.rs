use super::{alu, mask, ActiveMask, Cta, Frame};
use crate::error::Error;
use crate::instruction::{Base, CallTarget, Instruction, Operand, Pc, Reg};
use crate::memory::{self, AccessKind, Segment, STACK_BASE};
use crate::sync::Arc;
use crate::trace::{InstructionEvent, MemoryEvent};
use ptx::{AtomOp, Axis, Dim, Opcode, Space, Special, Type};
use smallvec::SmallVec;

/// Where a memory access lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Segment(Segment),
    Global,
}

fn invalid_access(kind: AccessKind, address: u64, size: u64, pc: Pc, tid: usize) -> Error {
    Error::InvalidMemoryAccess {
        kind,
        address,
        size,
        pc,
        thread: u32::try_from(tid).unwrap_or(u32::MAX),
    }
}

fn slot(reg: &Reg, pc: Pc) -> Result<usize, Error> {
    match reg {
        Reg::Slot(slot) => Ok(*slot as usize),
        Reg::Virtual(name) => Err(Error::fault(pc, format!("register {name} was never allocated"))),
    }
}

fn required<'i>(operand: Option<&'i Operand>, pc: Pc, role: &str) -> Result<&'i Operand, Error> {
    operand.ok_or_else(|| Error::fault(pc, format!("missing {role} operand")))
}

fn component(dim: Dim, axis: Axis) -> u64 {
    u64::from(match axis {
        Axis::X => dim.x,
        Axis::Y => dim.y,
        Axis::Z => dim.z,
    })
}

impl<'a> Cta<'a> {
    /// Execute the instruction of the divergence stack entry `idx` for all
    /// of its threads.
    pub(super) fn step(&mut self, idx: usize) -> Result<(), Error> {
        let ctx = self.ctx;
        let program = Arc::clone(&self.program);
        let entry = self.stack.entry(idx);
        let pc = entry.pc;
        let inst = program.get(pc).ok_or_else(|| {
            Error::fault(
                pc,
                format!("pc is outside of the program ({} instructions)", program.len()),
            )
        })?;
        let mask = entry.mask.clone();
        let active = self.guard(inst, &mask)?;

        let event = InstructionEvent {
            kernel: ctx.kernel.name(),
            block_id: self.block_id,
            instruction: inst,
            block_start: program.block_starts.get(&pc).map(String::as_str),
            mask: &mask,
            active: &active,
        };
        ctx.generators.pre_instruction(&event);
        log::trace!(
            "{}[{}] {inst} mask={}",
            ctx.kernel.name(),
            self.block_id.to_dim(),
            mask::to_bit_string(&active)
        );
        self.steps += 1;

        match inst.opcode {
            Opcode::Bra { .. } => self.branch(idx, inst, &active)?,
            Opcode::Exit => self.exit(idx, &active),
            Opcode::Ret => self.ret(idx, inst, &mask, &active)?,
            Opcode::Call { .. } => self.call(idx, inst, &mask, &active)?,
            Opcode::Bar => self.barrier(idx, inst, &mask, &active)?,
            _ => {
                for tid in active.iter_ones() {
                    self.execute(tid, inst)?;
                }
                self.stack.entry_mut(idx).pc += 1;
            }
        }

        ctx.generators.post_instruction(&event);
        Ok(())
    }

    /// Threads of `mask` whose guard predicate holds.
    fn guard(&self, inst: &Instruction, mask: &ActiveMask) -> Result<ActiveMask, Error> {
        let Some(guard) = &inst.guard else {
            return Ok(mask.clone());
        };
        let mut active = mask.clone();
        for tid in mask.iter_ones() {
            let holds = self.read_register(tid, &guard.reg, inst.pc)? & 1 != 0;
            active.set(tid, holds != guard.negated);
        }
        Ok(active)
    }

    fn read_register(&self, tid: usize, reg: &Reg, pc: Pc) -> Result<u64, Error> {
        let slot = slot(reg, pc)?;
        self.threads[tid]
            .frame()
            .registers
            .get(slot)
            .copied()
            .ok_or_else(|| Error::fault(pc, format!("register {reg} is outside of the frame")))
    }

    fn write_register(&mut self, tid: usize, reg: &Reg, value: u64, pc: Pc) -> Result<(), Error> {
        let slot = slot(reg, pc)?;
        let register = self.threads[tid]
            .frame_mut()
            .registers
            .get_mut(slot)
            .ok_or_else(|| Error::fault(pc, format!("register {reg} is outside of the frame")))?;
        *register = value;
        Ok(())
    }

    fn special(&self, tid: usize, special: Special) -> u64 {
        let block = self.ctx.block;
        let tid = tid as u64;
        let warp_size = u64::from(self.ctx.config.warp_size.max(1));
        match special {
            Special::Tid(axis) => {
                let (x, y) = (u64::from(block.x.max(1)), u64::from(block.y.max(1)));
                match axis {
                    Axis::X => tid % x,
                    Axis::Y => (tid / x) % y,
                    Axis::Z => tid / (x * y),
                }
            }
            Special::Ntid(axis) => component(block, axis),
            Special::Ctaid(axis) => component(self.block_id.to_dim(), axis),
            Special::Nctaid(axis) => component(self.ctx.grid, axis),
            Special::LaneId => tid % warp_size,
            Special::WarpId => tid / warp_size,
            Special::Clock => self.steps,
        }
    }

    fn value(&self, tid: usize, operand: &Operand, pc: Pc) -> Result<u64, Error> {
        match operand {
            Operand::Register(reg) => self.read_register(tid, reg, pc),
            Operand::Immediate(value) => Ok(*value),
            Operand::Special(special) => Ok(self.special(tid, *special)),
            Operand::Address { base, offset } => {
                let base = match base {
                    Base::Register(reg) => self.read_register(tid, reg, pc)?,
                    Base::Absolute(address) => *address,
                    Base::Frame => STACK_BASE + self.threads[tid].frame().stack_base,
                    Base::Symbol(name) => {
                        return Err(Error::UnresolvedSymbol {
                            symbol: name.clone(),
                        })
                    }
                };
                Ok(base.wrapping_add_signed(*offset))
            }
            Operand::Symbol(name) => Err(Error::UnresolvedSymbol {
                symbol: name.clone(),
            }),
            Operand::Target(_) | Operand::Texture(_) => {
                Err(Error::fault(pc, format!("{operand} is not a value")))
            }
        }
    }

    fn source(&self, tid: usize, inst: &Instruction, operand: Option<&Operand>, role: &str) -> Result<u64, Error> {
        self.value(tid, required(operand, inst.pc, role)?, inst.pc)
    }

    /// Execute a data instruction for thread `tid`.
    fn execute(&mut self, tid: usize, inst: &Instruction) -> Result<(), Error> {
        let pc = inst.pc;
        let ty = inst.ty;
        let fault = |message: String| Error::fault(pc, message);
        let a = || self.source(tid, inst, inst.a.as_ref(), "first source");
        let b = || self.source(tid, inst, inst.b.as_ref(), "second source");
        let c = || self.source(tid, inst, inst.c.as_ref(), "third source");

        let value = match inst.opcode {
            Opcode::Mov | Opcode::Cvta { .. } => a()?,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul(_)
            | Opcode::Div
            | Opcode::Rem
            | Opcode::Min
            | Opcode::Max
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr => alu::binary(inst.opcode, ty, a()?, b()?).map_err(fault)?,
            Opcode::Mad(mode) => alu::multiply_add(mode, ty, a()?, b()?, c()?).map_err(fault)?,
            Opcode::Neg | Opcode::Abs | Opcode::Not => alu::unary(inst.opcode, ty, a()?).map_err(fault)?,
            Opcode::Setp(cmp) => u64::from(alu::compare(cmp, ty, a()?, b()?)),
            Opcode::Selp => {
                if c()? & 1 != 0 {
                    a()?
                } else {
                    b()?
                }
            }
            Opcode::Cvt { from } => alu::convert(ty, from, a()?),
            Opcode::Ld(space) => {
                let address = a()?;
                self.load(tid, pc, space, ty, address)?
            }
            Opcode::St(space) => {
                let (address, value) = (a()?, b()?);
                return self.store(tid, pc, space, ty, address, value);
            }
            Opcode::Atom(space, op) => {
                let address = a()?;
                let operand = b()?;
                let swap = if op == AtomOp::Cas { c()? } else { 0 };
                self.atomic(tid, pc, space, op, ty, address, operand, swap)?
            }
            Opcode::Tex(_) => self.texture(tid, inst)?,
            Opcode::Membar => return Ok(()),
            Opcode::Bra { .. } | Opcode::Call { .. } | Opcode::Ret | Opcode::Exit | Opcode::Bar => {
                return Err(fault(format!("{} cannot execute per thread", inst.opcode)));
            }
        };

        let Some(Operand::Register(dest)) = &inst.d else {
            return Err(fault(format!("{} needs a destination register", inst.opcode)));
        };
        let value = alu::truncate(value, alu::result_bits(inst.opcode, ty));
        self.write_register(tid, dest, value, pc)
    }

    /// Check an access and find the storage behind it.
    fn route(
        &self,
        tid: usize,
        pc: Pc,
        space: Space,
        address: u64,
        size: u64,
        kind: AccessKind,
    ) -> Result<Target, Error> {
        let permitted = match Segment::of(address) {
            Some(segment) => {
                let space_matches = space == Space::Generic || space == segment.space();
                (space_matches && self.ctx.memory.check_access(address, size, kind))
                    .then_some(Target::Segment(segment))
            }
            None => {
                let space_matches = matches!(space, Space::Global | Space::Generic);
                (space_matches && self.ctx.global.contains(address, size)).then_some(Target::Global)
            }
        };
        permitted.ok_or_else(|| invalid_access(kind, address, size, pc, tid))
    }

    fn segment_bytes(&self, tid: usize, segment: Segment) -> Option<&[u8]> {
        let bytes = match segment {
            Segment::Param => &self.ctx.memory.param,
            Segment::Const => &self.ctx.memory.constant,
            Segment::Shared => &self.shared,
            Segment::GlobalShared => &self.global_shared,
            Segment::Local => &self.threads[tid].local,
            Segment::Stack => &self.threads[tid].stack,
            // texture handles carry no data
            Segment::Texture => return None,
        };
        Some(bytes.as_slice())
    }

    fn segment_bytes_mut(&mut self, tid: usize, segment: Segment) -> Option<&mut [u8]> {
        let bytes = match segment {
            Segment::Shared => &mut self.shared,
            Segment::GlobalShared => &mut self.global_shared,
            Segment::Local => &mut self.threads[tid].local,
            Segment::Stack => &mut self.threads[tid].stack,
            Segment::Param | Segment::Const | Segment::Texture => return None,
        };
        Some(bytes.as_mut_slice())
    }

    fn read_segment(&self, tid: usize, segment: Segment, address: u64, size: u64) -> Option<u64> {
        if segment == Segment::Texture {
            return Some(0);
        }
        let offset = (address - segment.base()) as usize;
        let bytes = self.segment_bytes(tid, segment)?;
        let bytes = bytes.get(offset..offset + size as usize)?;
        Some(memory::read_value(bytes, size))
    }

    fn write_segment(&mut self, tid: usize, segment: Segment, address: u64, size: u64, value: u64) -> bool {
        let offset = (address - segment.base()) as usize;
        let Some(bytes) = self.segment_bytes_mut(tid, segment) else {
            return false;
        };
        match bytes.get_mut(offset..offset + size as usize) {
            Some(bytes) => {
                memory::write_value(bytes, size, value);
                true
            }
            None => false,
        }
    }

    fn memory_event(
        &self,
        tid: usize,
        pc: Pc,
        address: u64,
        size: u64,
        kind: AccessKind,
        value: Option<u64>,
    ) -> MemoryEvent<'a> {
        let ctx = self.ctx;
        MemoryEvent {
            kernel: ctx.kernel.name(),
            block_id: self.block_id,
            pc,
            thread: u32::try_from(tid).unwrap_or(u32::MAX),
            address,
            size,
            kind,
            value,
        }
    }

    fn load(&mut self, tid: usize, pc: Pc, space: Space, ty: Type, address: u64) -> Result<u64, Error> {
        let size = ty.size();
        let kind = AccessKind::Read;
        let target = self.route(tid, pc, space, address, size, kind)?;
        let generators = self.ctx.generators;
        generators.pre_memory(&self.memory_event(tid, pc, address, size, kind, None));
        let value = match target {
            Target::Global => {
                let mut buf = [0u8; 8];
                self.ctx
                    .global
                    .read(address, &mut buf[..size as usize])
                    .map_err(|_| invalid_access(kind, address, size, pc, tid))?;
                u64::from_le_bytes(buf)
            }
            Target::Segment(segment) => self
                .read_segment(tid, segment, address, size)
                .ok_or_else(|| invalid_access(kind, address, size, pc, tid))?,
        };
        generators.post_memory(&self.memory_event(tid, pc, address, size, kind, Some(value)));
        Ok(value)
    }

    fn store(&mut self, tid: usize, pc: Pc, space: Space, ty: Type, address: u64, value: u64) -> Result<(), Error> {
        let size = ty.size();
        let kind = AccessKind::Write;
        let target = self.route(tid, pc, space, address, size, kind)?;
        let generators = self.ctx.generators;
        generators.pre_memory(&self.memory_event(tid, pc, address, size, kind, Some(value)));
        match target {
            Target::Global => {
                let bytes = value.to_le_bytes();
                self.ctx
                    .global
                    .write(address, &bytes[..size as usize])
                    .map_err(|_| invalid_access(kind, address, size, pc, tid))?;
            }
            Target::Segment(segment) => {
                if !self.write_segment(tid, segment, address, size, value) {
                    return Err(invalid_access(kind, address, size, pc, tid));
                }
            }
        }
        generators.post_memory(&self.memory_event(tid, pc, address, size, kind, Some(value)));
        Ok(())
    }

    /// Read-modify-write, returning the old value.
    #[allow(clippy::too_many_arguments)]
    fn atomic(
        &mut self,
        tid: usize,
        pc: Pc,
        space: Space,
        op: AtomOp,
        ty: Type,
        address: u64,
        operand: u64,
        swap: u64,
    ) -> Result<u64, Error> {
        let size = ty.size();
        let kind = AccessKind::Atomic;
        let target = self.route(tid, pc, space, address, size, kind)?;
        let generators = self.ctx.generators;
        generators.pre_memory(&self.memory_event(tid, pc, address, size, kind, Some(operand)));

        let mut failure = None;
        let mut update = |old: u64| match alu::atomic(op, ty, old, operand, swap) {
            Ok(new) => new,
            Err(message) => {
                failure = Some(message);
                old
            }
        };
        let old = match target {
            Target::Global => self
                .ctx
                .global
                .atomic(address, size, &mut update)
                .map_err(|_| invalid_access(kind, address, size, pc, tid))?,
            Target::Segment(segment) => {
                let old = self
                    .read_segment(tid, segment, address, size)
                    .ok_or_else(|| invalid_access(kind, address, size, pc, tid))?;
                let new = update(old);
                if !self.write_segment(tid, segment, address, size, new) {
                    return Err(invalid_access(kind, address, size, pc, tid));
                }
                old
            }
        };
        if let Some(message) = failure {
            return Err(Error::fault(pc, message));
        }
        generators.post_memory(&self.memory_event(tid, pc, address, size, kind, Some(old)));
        Ok(old)
    }

    /// Fetch one texel of a bound texture, clamping the coordinates.
    fn texture(&mut self, tid: usize, inst: &Instruction) -> Result<u64, Error> {
        let pc = inst.pc;
        let Some(Operand::Texture(name)) = &inst.a else {
            return Err(Error::fault(pc, "texture fetch without a texture reference"));
        };
        let binding = self
            .ctx
            .kernel
            .texture_binding(name)
            .ok_or_else(|| Error::fault(pc, format!("texture {name} is not bound")))?;
        let x = self.source(tid, inst, inst.b.as_ref(), "x coordinate")?;
        let y = match &inst.c {
            Some(operand) => self.value(tid, operand, pc)?,
            None => 0,
        };
        let clamp = |coord: u64, extent: u64| {
            let coord = alu::sign_extend(coord, 32).max(0) as u64;
            coord.min(extent.max(1) - 1)
        };
        let (x, y) = (clamp(x, binding.width), clamp(y, binding.height));
        let element = binding.ty.size();
        let address = binding.address + (y * binding.width.max(1) + x) * element;

        let size = inst.ty.size().min(element);
        let kind = AccessKind::Read;
        if !self.ctx.global.contains(address, size) {
            return Err(invalid_access(kind, address, size, pc, tid));
        }
        let generators = self.ctx.generators;
        generators.pre_memory(&self.memory_event(tid, pc, address, size, kind, None));
        let mut buf = [0u8; 8];
        self.ctx
            .global
            .read(address, &mut buf[..size as usize])
            .map_err(|_| invalid_access(kind, address, size, pc, tid))?;
        let value = u64::from_le_bytes(buf);
        generators.post_memory(&self.memory_event(tid, pc, address, size, kind, Some(value)));
        Ok(value)
    }

    fn branch(&mut self, idx: usize, inst: &Instruction, taken: &ActiveMask) -> Result<(), Error> {
        let target = inst
            .target()
            .ok_or_else(|| Error::fault(inst.pc, "branch without a resolved target"))?;
        if self.stack.branch(idx, taken, target, inst.reconverge) {
            log::trace!(
                "block {}: divergent branch at pc={} (reconverge at {:?})",
                self.block_id.to_dim(),
                inst.pc,
                inst.reconverge
            );
        }
        Ok(())
    }

    pub(super) fn exit(&mut self, idx: usize, exiting: &ActiveMask) {
        mask::or_assign(&mut self.exited, exiting);
        self.stack.remove_threads(exiting);
        self.barriers.threads_exited(exiting);
        self.stack.entry_mut(idx).pc += 1;
        self.release_barriers();
    }

    fn ret(&mut self, idx: usize, inst: &Instruction, mask: &ActiveMask, active: &ActiveMask) -> Result<(), Error> {
        let pc = inst.pc;
        if active.not_any() {
            self.stack.entry_mut(idx).pc += 1;
            return Ok(());
        }
        let in_call = active
            .iter_ones()
            .filter(|tid| self.threads[*tid].frames.len() > 1)
            .count();
        if in_call == 0 {
            // returning from the kernel itself
            self.exit(idx, active);
            return Ok(());
        }
        if in_call != active.count_ones() || active != mask {
            return Err(Error::fault(pc, "divergent return"));
        }

        let mut return_pc = pc + 1;
        for tid in active.iter_ones() {
            let thread = &mut self.threads[tid];
            let Some(frame) = thread.frames.pop() else {
                continue;
            };
            let caller = thread.frame_mut();
            for (caller_slot, callee_slot) in &frame.returns {
                let value = frame.registers.get(*callee_slot as usize).copied().unwrap_or(0);
                if let Some(register) = caller.registers.get_mut(*caller_slot as usize) {
                    *register = value;
                }
            }
            return_pc = frame.return_pc;
        }
        self.stack.entry_mut(idx).pc = return_pc;
        Ok(())
    }

    fn call(&mut self, idx: usize, inst: &Instruction, mask: &ActiveMask, active: &ActiveMask) -> Result<(), Error> {
        let pc = inst.pc;
        let call = inst
            .call
            .as_ref()
            .ok_or_else(|| Error::fault(pc, "call without a call site"))?;
        if active.not_any() {
            self.stack.entry_mut(idx).pc += 1;
            return Ok(());
        }
        if active != mask {
            return Err(Error::fault(pc, format!("divergent call to {}", call.function)));
        }

        let entry = match call.target {
            CallTarget::Resolved(entry) => entry,
            CallTarget::Unresolved => {
                let entry = self.ctx.kernel.lazy_link(pc, &call.function)?;
                self.program = self.ctx.kernel.program();
                entry
            }
        };
        self.ctx.kernel.jump_to_pc(entry)?;
        let callee = self.callee(entry)?.clone();
        if call.arguments.len() != callee.params.len() || call.returns.len() != callee.returns.len() {
            return Err(Error::fault(
                pc,
                format!(
                    "{} takes {} arguments and {} return values, got {} and {}",
                    call.function,
                    callee.params.len(),
                    callee.returns.len(),
                    call.arguments.len(),
                    call.returns.len()
                ),
            ));
        }
        let returns: SmallVec<[(u32, u32); 2]> = call
            .returns
            .iter()
            .zip(&callee.returns)
            .map(|(operand, callee_slot)| match operand {
                Operand::Register(Reg::Slot(slot)) => Ok((*slot, *callee_slot)),
                other => Err(Error::fault(pc, format!("return value {other} is not a register"))),
            })
            .collect::<Result<_, _>>()?;

        let stack_size = self.ctx.memory.size(Segment::Stack);
        for tid in active.iter_ones() {
            let arguments: SmallVec<[u64; 4]> = call
                .arguments
                .iter()
                .map(|argument| self.value(tid, argument, pc))
                .collect::<Result<_, _>>()?;
            let caller = self.threads[tid].frame();
            let stack_base = caller.stack_base + caller.frame_size;
            if stack_base + callee.frame_size > stack_size {
                return Err(Error::fault(
                    pc,
                    format!("stack overflow calling {} ({stack_size} bytes per thread)", call.function),
                ));
            }

            let mut frame = Frame::new(callee.registers);
            for (slot, value) in callee.params.iter().zip(arguments) {
                if let Some(register) = frame.registers.get_mut(*slot as usize) {
                    *register = value;
                }
            }
            frame.return_pc = pc + 1;
            frame.stack_base = stack_base;
            frame.frame_size = callee.frame_size;
            frame.returns = returns.clone();

            let thread = &mut self.threads[tid];
            if (thread.stack.len() as u64) < stack_size {
                thread.stack.resize(stack_size as usize, 0);
            }
            thread.frames.push(frame);
        }
        self.stack.entry_mut(idx).pc = entry;
        Ok(())
    }

    fn barrier(&mut self, idx: usize, inst: &Instruction, mask: &ActiveMask, active: &ActiveMask) -> Result<(), Error> {
        let pc = inst.pc;
        let Some(first) = active.first_one() else {
            self.stack.entry_mut(idx).pc += 1;
            return Ok(());
        };
        if active != mask {
            return Err(Error::fault(pc, "divergent barrier"));
        }
        let id = self.source(first, inst, inst.a.as_ref(), "barrier id")? as usize;
        let count = match &inst.b {
            Some(operand) => Some(self.value(first, operand, pc)? as usize),
            None => None,
        };
        if !self.barriers.arrive(id, active, count) {
            return Err(Error::fault(
                pc,
                format!(
                    "barrier {id} is out of range (at most {} barriers)",
                    self.ctx.config.max_barriers_per_block
                ),
            ));
        }
        self.stack.park(idx, id);
        self.release_barriers();
        Ok(())
    }
}
