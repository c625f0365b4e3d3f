//! Executable, PC-indexed instruction form.

use ptx::{Location, Opcode, Special, Type};
use smallvec::SmallVec;

pub type Pc = usize;

/// A register before and after allocation.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Reg {
    Virtual(String),
    Slot(u32),
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Virtual(name) => write!(f, "{name}"),
            Self::Slot(slot) => write!(f, "$r{slot}"),
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Base {
    Register(Reg),
    /// Named variable, replaced by an absolute address during preparation.
    Symbol(String),
    Absolute(u64),
    /// Start of the current call frame in the stack segment.
    Frame,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Operand {
    Register(Reg),
    Immediate(u64),
    Special(Special),
    /// Address of a named variable, replaced by an immediate during preparation.
    Symbol(String),
    Address { base: Base, offset: i64 },
    Target(Pc),
    Texture(String),
}

impl Operand {
    #[must_use]
    pub fn reg(&self) -> Option<&Reg> {
        match self {
            Self::Register(reg)
            | Self::Address {
                base: Base::Register(reg),
                ..
            } => Some(reg),
            _ => None,
        }
    }

    pub fn reg_mut(&mut self) -> Option<&mut Reg> {
        match self {
            Self::Register(reg)
            | Self::Address {
                base: Base::Register(reg),
                ..
            } => Some(reg),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(reg) => write!(f, "{reg}"),
            Self::Immediate(value) => write!(f, "{value:#x}"),
            Self::Special(special) => write!(f, "{special}"),
            Self::Symbol(name) | Self::Texture(name) => write!(f, "{name}"),
            Self::Target(pc) => write!(f, "<pc {pc}>"),
            Self::Address { base, offset } => {
                match base {
                    Base::Register(reg) => write!(f, "[{reg}")?,
                    Base::Symbol(name) => write!(f, "[{name}")?,
                    Base::Absolute(address) => write!(f, "[{address:#x}")?,
                    Base::Frame => write!(f, "[%frame")?,
                }
                match offset {
                    0 => write!(f, "]"),
                    off if *off < 0 => write!(f, "{off}]"),
                    off => write!(f, "+{off}]"),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Guard {
    pub reg: Reg,
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum CallTarget {
    Unresolved,
    Resolved(Pc),
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Call {
    pub function: String,
    pub target: CallTarget,
    pub returns: SmallVec<[Operand; 2]>,
    pub arguments: SmallVec<[Operand; 4]>,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Instruction {
    pub pc: Pc,
    pub opcode: Opcode,
    pub ty: Type,
    pub guard: Option<Guard>,
    pub d: Option<Operand>,
    pub a: Option<Operand>,
    pub b: Option<Operand>,
    pub c: Option<Operand>,
    pub call: Option<Call>,
    /// Where divergent threads of this branch meet again.
    pub reconverge: Option<Pc>,
    pub location: Option<Location>,
}

impl Instruction {
    pub fn operands(&self) -> impl Iterator<Item = &Operand> + '_ {
        let call = self
            .call
            .iter()
            .flat_map(|call| call.returns.iter().chain(call.arguments.iter()));
        [&self.d, &self.a, &self.b, &self.c]
            .into_iter()
            .filter_map(Option::as_ref)
            .chain(call)
    }

    pub fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> + '_ {
        let call = self
            .call
            .iter_mut()
            .flat_map(|call| call.returns.iter_mut().chain(call.arguments.iter_mut()));
        [&mut self.d, &mut self.a, &mut self.b, &mut self.c]
            .into_iter()
            .filter_map(Option::as_mut)
            .chain(call)
    }

    /// Every register read or written, including the guard.
    pub fn registers(&self) -> impl Iterator<Item = &Reg> + '_ {
        self.guard
            .as_ref()
            .map(|guard| &guard.reg)
            .into_iter()
            .chain(self.operands().filter_map(Operand::reg))
    }

    pub fn registers_mut(&mut self) -> impl Iterator<Item = &mut Reg> + '_ {
        let Self {
            guard,
            d,
            a,
            b,
            c,
            call,
            ..
        } = self;
        let call = call
            .iter_mut()
            .flat_map(|call| call.returns.iter_mut().chain(call.arguments.iter_mut()));
        guard.as_mut().map(|guard| &mut guard.reg).into_iter().chain(
            [d, a, b, c]
                .into_iter()
                .filter_map(Option::as_mut)
                .chain(call)
                .filter_map(Operand::reg_mut),
        )
    }

    #[must_use]
    pub fn target(&self) -> Option<Pc> {
        match (&self.opcode, &self.a) {
            (Opcode::Bra { .. }, Some(Operand::Target(pc))) => Some(*pc),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.guard.is_none() && matches!(self.opcode, Opcode::Bra { .. } | Opcode::Ret | Opcode::Exit)
    }

    /// Move every PC this instruction refers to by `delta`.
    pub fn relocate(&mut self, delta: Pc) {
        self.pc += delta;
        if let Some(pc) = self.reconverge.as_mut() {
            *pc += delta;
        }
        for operand in self.operands_mut() {
            if let Operand::Target(pc) = operand {
                *pc += delta;
            }
        }
        if let Some(call) = self.call.as_mut() {
            call.target = CallTarget::Unresolved;
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:>4}: ", self.pc)?;
        if let Some(Guard { reg, negated }) = &self.guard {
            write!(f, "@{}{reg} ", if *negated { "!" } else { "" })?;
        }
        write!(f, "{}", self.opcode)?;
        if self.opcode.is_typed() {
            write!(f, ".{}", self.ty)?;
        }
        if let Opcode::Cvt { from } = self.opcode {
            write!(f, ".{from}")?;
        }
        if let Some(call) = &self.call {
            write!(f, " {}", call.function)?;
            if let CallTarget::Resolved(pc) = call.target {
                write!(f, " <pc {pc}>")?;
            }
        }
        let mut operands = [&self.d, &self.a, &self.b, &self.c]
            .into_iter()
            .filter_map(Option::as_ref)
            .peekable();
        if operands.peek().is_some() {
            write!(f, " ")?;
        }
        for (i, operand) in operands.enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{operand}")?;
        }
        if let Some(pc) = self.reconverge {
            write!(f, " // reconverge at {pc}")?;
        }
        Ok(())
    }
}
