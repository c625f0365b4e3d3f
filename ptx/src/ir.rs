//! Immutable kernel program representation.
//!
//! A [`Module`] groups entry kernels and device functions together with
//! module-scope variables and texture references. Functions are control-flow
//! graphs of [`BasicBlock`]s holding typed [`Instruction`]s.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(
    Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum Type {
    Pred,
    B8,
    B16,
    B32,
    B64,
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
}

impl Type {
    /// Size of one element in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Pred | Self::B8 | Self::U8 | Self::S8 => 1,
            Self::B16 | Self::U16 | Self::S16 => 2,
            Self::B32 | Self::U32 | Self::S32 | Self::F32 => 4,
            Self::B64 | Self::U64 | Self::S64 | Self::F64 => 8,
        }
    }

    #[must_use]
    pub fn bits(&self) -> u32 {
        match self {
            Self::Pred => 1,
            // at most 64
            other => u32::try_from(other.size() * 8).unwrap_or(64),
        }
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S32 | Self::S64)
    }

    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

/// State space of a variable or memory access.
#[derive(
    Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum Space {
    Param,
    Const,
    Global,
    Shared,
    Local,
    Texture,
    Generic,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum AtomOp {
    Add,
    Min,
    Max,
    Exch,
    Cas,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum MulMode {
    Lo,
    Hi,
    Wide,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
pub enum TexGeometry {
    #[strum(serialize = "1d")]
    D1,
    #[strum(serialize = "2d")]
    D2,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Read-only special registers.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Special {
    Tid(Axis),
    Ntid(Axis),
    Ctaid(Axis),
    Nctaid(Axis),
    LaneId,
    WarpId,
    Clock,
}

impl std::fmt::Display for Special {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tid(axis) => write!(f, "%tid.{axis}"),
            Self::Ntid(axis) => write!(f, "%ntid.{axis}"),
            Self::Ctaid(axis) => write!(f, "%ctaid.{axis}"),
            Self::Nctaid(axis) => write!(f, "%nctaid.{axis}"),
            Self::LaneId => write!(f, "%laneid"),
            Self::WarpId => write!(f, "%warpid"),
            Self::Clock => write!(f, "%clock"),
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Mov,
    Add,
    Sub,
    Mul(MulMode),
    Mad(MulMode),
    Div,
    Rem,
    Min,
    Max,
    Neg,
    Abs,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Setp(CmpOp),
    Selp,
    Cvt { from: Type },
    Cvta { space: Space, to_generic: bool },
    Ld(Space),
    St(Space),
    Atom(Space, AtomOp),
    Tex(TexGeometry),
    Bra { uni: bool },
    Call { uni: bool },
    Ret,
    Exit,
    Bar,
    Membar,
}

impl Opcode {
    /// Whether the instruction carries a data type suffix.
    #[must_use]
    pub fn is_typed(&self) -> bool {
        !matches!(
            self,
            Self::Bra { .. } | Self::Call { .. } | Self::Ret | Self::Exit | Self::Bar | Self::Membar
        )
    }

    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(self, Self::Bra { .. })
    }

    #[must_use]
    pub fn accesses_memory(&self) -> bool {
        matches!(self, Self::Ld(_) | Self::St(_) | Self::Atom(..) | Self::Tex(_))
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mov => write!(f, "mov"),
            Self::Add => write!(f, "add"),
            Self::Sub => write!(f, "sub"),
            Self::Mul(mode) => write!(f, "mul.{mode}"),
            Self::Mad(mode) => write!(f, "mad.{mode}"),
            Self::Div => write!(f, "div"),
            Self::Rem => write!(f, "rem"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Neg => write!(f, "neg"),
            Self::Abs => write!(f, "abs"),
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
            Self::Xor => write!(f, "xor"),
            Self::Not => write!(f, "not"),
            Self::Shl => write!(f, "shl"),
            Self::Shr => write!(f, "shr"),
            Self::Setp(cmp) => write!(f, "setp.{cmp}"),
            Self::Selp => write!(f, "selp"),
            Self::Cvt { .. } => write!(f, "cvt"),
            Self::Cvta {
                space,
                to_generic: true,
            } => write!(f, "cvta.{space}"),
            Self::Cvta {
                space,
                to_generic: false,
            } => write!(f, "cvta.to.{space}"),
            Self::Ld(space) => write!(f, "ld.{space}"),
            Self::St(space) => write!(f, "st.{space}"),
            Self::Atom(space, op) => write!(f, "atom.{space}.{op}"),
            Self::Tex(geometry) => write!(f, "tex.{geometry}"),
            Self::Bra { uni: false } => write!(f, "bra"),
            Self::Bra { uni: true } => write!(f, "bra.uni"),
            Self::Call { uni: false } => write!(f, "call"),
            Self::Call { uni: true } => write!(f, "call.uni"),
            Self::Ret => write!(f, "ret"),
            Self::Exit => write!(f, "exit"),
            Self::Bar => write!(f, "bar.sync"),
            Self::Membar => write!(f, "membar.gl"),
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressBase {
    Register(String),
    Symbol(String),
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// A virtual register such as `%r1`.
    Register(String),
    /// Raw bit pattern of an immediate value.
    Immediate(u64),
    Special(Special),
    /// Address of a named variable.
    Symbol(String),
    /// Memory operand `[base+offset]`.
    Address { base: AddressBase, offset: i64 },
    Label(String),
    Texture(String),
}

impl Operand {
    #[must_use]
    pub fn register(&self) -> Option<&str> {
        match self {
            Self::Register(name)
            | Self::Address {
                base: AddressBase::Register(name),
                ..
            } => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(name) | Self::Symbol(name) | Self::Label(name) | Self::Texture(name) => {
                write!(f, "{name}")
            }
            Self::Immediate(value) => write!(f, "{value}"),
            Self::Special(special) => write!(f, "{special}"),
            Self::Address { base, offset } => {
                let base = match base {
                    AddressBase::Register(name) | AddressBase::Symbol(name) => name,
                };
                match offset {
                    0 => write!(f, "[{base}]"),
                    off if *off < 0 => write!(f, "[{base}{off}]"),
                    off => write!(f, "[{base}+{off}]"),
                }
            }
        }
    }
}

/// Predicate guard `@p` or `@!p`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    pub register: String,
    pub negated: bool,
}

impl std::fmt::Display for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negated {
            write!(f, "@!{}", self.register)
        } else {
            write!(f, "@{}", self.register)
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub function: String,
    pub returns: Vec<Operand>,
    pub arguments: Vec<Operand>,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// One typed instruction.
///
/// Operand roles by opcode:
/// - arithmetic and `setp`: `d = a op b [op c]`
/// - `ld`: `d = [a]`, `st`: `[a] = b`
/// - `atom`: `d = [a] op b`, with `c` as the swap value for `cas`
/// - `tex`: `d = tex(a)[b, c]`
/// - `bra`: target label in `a`
/// - `bar.sync`: barrier id in `a`, optional thread count in `b`
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub ty: Type,
    pub guard: Option<Guard>,
    pub d: Option<Operand>,
    pub a: Option<Operand>,
    pub b: Option<Operand>,
    pub c: Option<Operand>,
    pub call: Option<CallSite>,
    pub location: Option<Location>,
}

impl Instruction {
    #[must_use]
    pub fn new(opcode: Opcode, ty: Type) -> Self {
        Self {
            opcode,
            ty,
            guard: None,
            d: None,
            a: None,
            b: None,
            c: None,
            call: None,
            location: None,
        }
    }

    /// Operands in `d, a, b, c` order.
    pub fn operands(&self) -> impl Iterator<Item = &Operand> + '_ {
        [&self.d, &self.a, &self.b, &self.c]
            .into_iter()
            .filter_map(Option::as_ref)
    }

    /// All virtual registers this instruction reads or writes.
    pub fn registers(&self) -> impl Iterator<Item = &str> + '_ {
        let guard = self.guard.as_ref().map(|guard| guard.register.as_str());
        let call = self
            .call
            .iter()
            .flat_map(|call| call.returns.iter().chain(call.arguments.iter()));
        guard
            .into_iter()
            .chain(self.operands().chain(call).filter_map(Operand::register))
    }

    /// Unconditional control transfer that ends a basic block.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.guard.is_none() && matches!(self.opcode, Opcode::Bra { .. } | Opcode::Ret | Opcode::Exit)
    }

    #[must_use]
    pub fn branch_target(&self) -> Option<&str> {
        match (&self.opcode, &self.a) {
            (Opcode::Bra { .. }, Some(Operand::Label(label))) => Some(label),
            _ => None,
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(guard) = &self.guard {
            write!(f, "{guard} ")?;
        }
        write!(f, "{}", self.opcode)?;
        if self.opcode.is_typed() {
            write!(f, ".{}", self.ty)?;
        }
        if let Opcode::Cvt { from } = self.opcode {
            write!(f, ".{from}")?;
        }
        if let Some(call) = &self.call {
            let list = |ops: &[Operand]| ops.iter().map(ToString::to_string).join(", ");
            write!(f, " ")?;
            if !call.returns.is_empty() {
                write!(f, "({}), ", list(&call.returns))?;
            }
            write!(f, "{}", call.function)?;
            if !call.arguments.is_empty() {
                write!(f, ", ({})", list(&call.arguments))?;
            }
        } else {
            let operands = self.operands().map(ToString::to_string).join(", ");
            if !operands.is_empty() {
                write!(f, " {operands}")?;
            }
        }
        write!(f, ";")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: String,
    pub instructions: Vec<Instruction>,
    /// Block that control reaches when the last instruction is not a terminator.
    pub fallthrough: Option<String>,
}

impl BasicBlock {
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.instructions
            .last()
            .is_some_and(Instruction::is_terminator)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub space: Space,
    pub ty: Type,
    /// Number of elements; zero for an unsized `extern` array.
    pub count: u64,
    pub align: u64,
    pub initializer: Option<Vec<u8>>,
    pub external: bool,
}

impl Variable {
    #[must_use]
    pub fn new(name: impl Into<String>, space: Space, ty: Type, count: u64) -> Self {
        Self {
            name: name.into(),
            space,
            ty,
            count,
            align: ty.size(),
            initializer: None,
            external: false,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.ty.size() * self.count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub size: u64,
    pub align: u64,
}

impl Param {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            size: ty.size(),
            align: ty.size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDecl {
    pub name: String,
    pub ty: Type,
    pub geometry: TexGeometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum Linkage {
    Entry,
    Func,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    pub params: Vec<Param>,
    pub returns: Vec<Param>,
    pub variables: Vec<Variable>,
    /// Control flow graph; the first block is the entry.
    pub blocks: Vec<BasicBlock>,
    pub file: Option<String>,
}

impl Function {
    #[must_use]
    pub fn is_entry(&self) -> bool {
        self.linkage == Linkage::Entry
    }

    #[must_use]
    pub fn block(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.iter().find(|block| block.label == label)
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|param| param.name == name)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.blocks.iter().flat_map(|block| block.instructions.iter())
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let params = |params: &[Param]| {
            params
                .iter()
                .map(|param| format!(".param .{} {}", param.ty, param.name))
                .join(", ")
        };
        write!(f, ".{} ", self.linkage)?;
        if !self.returns.is_empty() {
            write!(f, "({}) ", params(&self.returns))?;
        }
        writeln!(f, "{}({})", self.name, params(&self.params))?;
        writeln!(f, "{{")?;
        for var in &self.variables {
            writeln!(f, "\t.{} .{} {}[{}];", var.space, var.ty, var.name, var.count)?;
        }
        for block in &self.blocks {
            writeln!(f, "{}:", block.label)?;
            for instruction in &block.instructions {
                writeln!(f, "\t{instruction}")?;
            }
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Arc<Function>>,
    /// Module scope variables (global, const and shared).
    pub variables: Vec<Variable>,
    pub textures: Vec<TextureDecl>,
}

impl Module {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Arc<Function>> {
        self.functions.iter().find(|func| func.name == name)
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|var| var.name == name)
    }

    #[must_use]
    pub fn texture(&self, name: &str) -> Option<&TextureDecl> {
        self.textures.iter().find(|tex| tex.name == name)
    }

    pub fn kernels(&self) -> impl Iterator<Item = &Arc<Function>> + '_ {
        self.functions.iter().filter(|func| func.is_entry())
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "// module {}", self.name)?;
        for var in &self.variables {
            writeln!(f, ".{} .{} {}[{}];", var.space, var.ty, var.name, var.count)?;
        }
        for tex in &self.textures {
            writeln!(f, ".tex .{} {}; // {}", tex.ty, tex.name, tex.geometry)?;
        }
        for func in &self.functions {
            writeln!(f, "{func}")?;
        }
        Ok(())
    }
}
