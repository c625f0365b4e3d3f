//! Helpers for building kernel programs in code.

use crate::ir::{
    AddressBase, AtomOp, BasicBlock, CallSite, CmpOp, Function, Guard, Instruction, Linkage,
    Location, Module, MulMode, Opcode, Operand, Param, Space, Special, TexGeometry, TextureDecl,
    Type, Variable,
};
use std::sync::Arc;

#[must_use]
pub fn reg(name: &str) -> Operand {
    Operand::Register(name.to_string())
}

#[must_use]
pub fn imm(value: u64) -> Operand {
    Operand::Immediate(value)
}

#[must_use]
pub fn imm_s(value: i64) -> Operand {
    Operand::Immediate(value as u64)
}

#[must_use]
pub fn imm_f32(value: f32) -> Operand {
    Operand::Immediate(u64::from(value.to_bits()))
}

#[must_use]
pub fn imm_f64(value: f64) -> Operand {
    Operand::Immediate(value.to_bits())
}

#[must_use]
pub fn special(special: Special) -> Operand {
    Operand::Special(special)
}

#[must_use]
pub fn sym(name: &str) -> Operand {
    Operand::Symbol(name.to_string())
}

/// `[reg+offset]`
#[must_use]
pub fn addr(register: &str, offset: i64) -> Operand {
    Operand::Address {
        base: AddressBase::Register(register.to_string()),
        offset,
    }
}

/// `[symbol+offset]`
#[must_use]
pub fn sym_addr(symbol: &str, offset: i64) -> Operand {
    Operand::Address {
        base: AddressBase::Symbol(symbol.to_string()),
        offset,
    }
}

#[must_use]
pub fn label(name: &str) -> Operand {
    Operand::Label(name.to_string())
}

impl Instruction {
    #[must_use]
    pub fn d(mut self, operand: Operand) -> Self {
        self.d = Some(operand);
        self
    }

    #[must_use]
    pub fn a(mut self, operand: Operand) -> Self {
        self.a = Some(operand);
        self
    }

    #[must_use]
    pub fn b(mut self, operand: Operand) -> Self {
        self.b = Some(operand);
        self
    }

    #[must_use]
    pub fn c(mut self, operand: Operand) -> Self {
        self.c = Some(operand);
        self
    }

    /// Guard with `@predicate`.
    #[must_use]
    pub fn when(mut self, predicate: &str) -> Self {
        self.guard = Some(Guard {
            register: predicate.to_string(),
            negated: false,
        });
        self
    }

    /// Guard with `@!predicate`.
    #[must_use]
    pub fn unless(mut self, predicate: &str) -> Self {
        self.guard = Some(Guard {
            register: predicate.to_string(),
            negated: true,
        });
        self
    }

    #[must_use]
    pub fn at(mut self, file: &str, line: u32) -> Self {
        self.location = Some(Location {
            file: file.to_string(),
            line,
        });
        self
    }
}

#[must_use]
pub fn op(opcode: Opcode, ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    Instruction::new(opcode, ty).d(d).a(a).b(b)
}

#[must_use]
pub fn mov(ty: Type, d: Operand, a: Operand) -> Instruction {
    Instruction::new(Opcode::Mov, ty).d(d).a(a)
}

#[must_use]
pub fn add(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Add, ty, d, a, b)
}

#[must_use]
pub fn sub(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Sub, ty, d, a, b)
}

#[must_use]
pub fn div(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Div, ty, d, a, b)
}

#[must_use]
pub fn rem(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Rem, ty, d, a, b)
}

#[must_use]
pub fn and(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::And, ty, d, a, b)
}

#[must_use]
pub fn or(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Or, ty, d, a, b)
}

#[must_use]
pub fn xor(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Xor, ty, d, a, b)
}

#[must_use]
pub fn shl(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Shl, ty, d, a, b)
}

#[must_use]
pub fn shr(ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Shr, ty, d, a, b)
}

#[must_use]
pub fn mul(mode: MulMode, ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Mul(mode), ty, d, a, b)
}

#[must_use]
pub fn mad(mode: MulMode, ty: Type, d: Operand, a: Operand, b: Operand, c: Operand) -> Instruction {
    op(Opcode::Mad(mode), ty, d, a, b).c(c)
}

#[must_use]
pub fn setp(cmp: CmpOp, ty: Type, d: Operand, a: Operand, b: Operand) -> Instruction {
    op(Opcode::Setp(cmp), ty, d, a, b)
}

#[must_use]
pub fn selp(ty: Type, d: Operand, a: Operand, b: Operand, predicate: Operand) -> Instruction {
    op(Opcode::Selp, ty, d, a, b).c(predicate)
}

#[must_use]
pub fn cvt(to: Type, from: Type, d: Operand, a: Operand) -> Instruction {
    Instruction::new(Opcode::Cvt { from }, to).d(d).a(a)
}

#[must_use]
pub fn ld(space: Space, ty: Type, d: Operand, address: Operand) -> Instruction {
    Instruction::new(Opcode::Ld(space), ty).d(d).a(address)
}

#[must_use]
pub fn st(space: Space, ty: Type, address: Operand, value: Operand) -> Instruction {
    Instruction::new(Opcode::St(space), ty).a(address).b(value)
}

#[must_use]
pub fn atom(space: Space, atom: AtomOp, ty: Type, d: Operand, address: Operand, b: Operand) -> Instruction {
    Instruction::new(Opcode::Atom(space, atom), ty)
        .d(d)
        .a(address)
        .b(b)
}

#[must_use]
pub fn tex(geometry: TexGeometry, ty: Type, d: Operand, texture: &str, x: Operand, y: Option<Operand>) -> Instruction {
    let mut inst = Instruction::new(Opcode::Tex(geometry), ty)
        .d(d)
        .a(Operand::Texture(texture.to_string()))
        .b(x);
    inst.c = y;
    inst
}

#[must_use]
pub fn bra(target: &str) -> Instruction {
    Instruction::new(Opcode::Bra { uni: false }, Type::B32).a(label(target))
}

#[must_use]
pub fn bra_uni(target: &str) -> Instruction {
    Instruction::new(Opcode::Bra { uni: true }, Type::B32).a(label(target))
}

#[must_use]
pub fn call(function: &str, returns: Vec<Operand>, arguments: Vec<Operand>) -> Instruction {
    let mut inst = Instruction::new(Opcode::Call { uni: false }, Type::B32);
    inst.call = Some(CallSite {
        function: function.to_string(),
        returns,
        arguments,
    });
    inst
}

#[must_use]
pub fn ret() -> Instruction {
    Instruction::new(Opcode::Ret, Type::B32)
}

#[must_use]
pub fn exit() -> Instruction {
    Instruction::new(Opcode::Exit, Type::B32)
}

/// `bar.sync id`
#[must_use]
pub fn bar(id: u64) -> Instruction {
    Instruction::new(Opcode::Bar, Type::B32).a(imm(id))
}

/// `bar.sync id, count`
#[must_use]
pub fn bar_count(id: u64, count: u64) -> Instruction {
    bar(id).b(imm(count))
}

#[must_use]
pub fn membar() -> Instruction {
    Instruction::new(Opcode::Membar, Type::B32)
}

/// Incrementally builds a [`Function`].
///
/// Starting a new block links the previous one to it by fall-through
/// unless the previous block ends in a terminator.
#[derive(Debug)]
pub struct FunctionBuilder {
    function: Function,
    current: Option<BasicBlock>,
}

impl FunctionBuilder {
    fn new(name: &str, linkage: Linkage) -> Self {
        Self {
            function: Function {
                name: name.to_string(),
                linkage,
                params: Vec::new(),
                returns: Vec::new(),
                variables: Vec::new(),
                blocks: Vec::new(),
                file: None,
            },
            current: None,
        }
    }

    #[must_use]
    pub fn entry(name: &str) -> Self {
        Self::new(name, Linkage::Entry)
    }

    #[must_use]
    pub fn func(name: &str) -> Self {
        Self::new(name, Linkage::Func)
    }

    #[must_use]
    pub fn param(mut self, name: &str, ty: Type) -> Self {
        self.function.params.push(Param::new(name, ty));
        self
    }

    #[must_use]
    pub fn returns(mut self, name: &str, ty: Type) -> Self {
        self.function.returns.push(Param::new(name, ty));
        self
    }

    #[must_use]
    pub fn variable(mut self, variable: Variable) -> Self {
        self.function.variables.push(variable);
        self
    }

    #[must_use]
    pub fn file(mut self, file: &str) -> Self {
        self.function.file = Some(file.to_string());
        self
    }

    fn close_block(&mut self, next: Option<&str>) {
        if let Some(mut block) = self.current.take() {
            if !block.is_terminated() {
                block.fallthrough = next.map(ToString::to_string);
            }
            self.function.blocks.push(block);
        }
    }

    #[must_use]
    pub fn block(mut self, label: &str) -> Self {
        self.close_block(Some(label));
        self.current = Some(BasicBlock {
            label: label.to_string(),
            instructions: Vec::new(),
            fallthrough: None,
        });
        self
    }

    #[must_use]
    pub fn push(mut self, instruction: Instruction) -> Self {
        let block = self.current.get_or_insert_with(|| BasicBlock {
            label: "$entry".to_string(),
            instructions: Vec::new(),
            fallthrough: None,
        });
        block.instructions.push(instruction);
        self
    }

    #[must_use]
    pub fn extend(self, instructions: impl IntoIterator<Item = Instruction>) -> Self {
        instructions.into_iter().fold(self, Self::push)
    }

    #[must_use]
    pub fn build(mut self) -> Function {
        self.close_block(None);
        self.function
    }
}

impl Module {
    #[must_use]
    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(Arc::new(function));
        self
    }

    #[must_use]
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    #[must_use]
    pub fn with_texture(mut self, name: &str, ty: Type, geometry: TexGeometry) -> Self {
        self.textures.push(TextureDecl {
            name: name.to_string(),
            ty,
            geometry,
        });
        self
    }
}

impl Variable {
    #[must_use]
    pub fn extern_shared(name: &str, ty: Type) -> Self {
        let mut var = Self::new(name, Space::Shared, ty, 0);
        var.external = true;
        var
    }

    #[must_use]
    pub fn with_initializer(mut self, bytes: Vec<u8>) -> Self {
        self.initializer = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }
}
