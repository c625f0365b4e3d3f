//! Small kernels exercising one feature each.

use ptx::builder::*;
use ptx::{
    Axis, AtomOp, CmpOp, Function, Instruction, Module, MulMode, Operand, Space, Special,
    TexGeometry, Type, Variable,
};

fn tid() -> Operand {
    special(Special::Tid(Axis::X))
}

/// `out[ctaid.x * ntid.x + tid.x] = value`
#[must_use]
pub fn store_per_thread(out: &str, value: &str) -> Vec<Instruction> {
    vec![
        mov(Type::U32, reg("%st.tid"), tid()),
        mov(Type::U32, reg("%st.ctaid"), special(Special::Ctaid(Axis::X))),
        mov(Type::U32, reg("%st.ntid"), special(Special::Ntid(Axis::X))),
        mad(
            MulMode::Lo,
            Type::U32,
            reg("%st.idx"),
            reg("%st.ctaid"),
            reg("%st.ntid"),
            reg("%st.tid"),
        ),
        ld(Space::Param, Type::U64, reg("%st.out"), sym_addr(out, 0)),
        mul(MulMode::Wide, Type::U32, reg("%st.off"), reg("%st.idx"), imm(4)),
        add(Type::U64, reg("%st.addr"), reg("%st.out"), reg("%st.off")),
        st(Space::Global, Type::U32, addr("%st.addr", 0), reg(value)),
    ]
}

/// `c[i] = a[i] + b[i]` for `i < n`.
#[must_use]
pub fn vector_add() -> Function {
    FunctionBuilder::entry("vector_add")
        .param("a", Type::U64)
        .param("b", Type::U64)
        .param("c", Type::U64)
        .param("n", Type::U32)
        .file("vector_add.cu")
        .extend([
            mov(Type::U32, reg("%tid"), tid()),
            mov(Type::U32, reg("%ntid"), special(Special::Ntid(Axis::X))),
            mov(Type::U32, reg("%ctaid"), special(Special::Ctaid(Axis::X))),
            mad(MulMode::Lo, Type::U32, reg("%i"), reg("%ctaid"), reg("%ntid"), reg("%tid"))
                .at("vector_add.cu", 3),
            ld(Space::Param, Type::U32, reg("%n"), sym_addr("n", 0)),
            setp(CmpOp::Ge, Type::U32, reg("%p"), reg("%i"), reg("%n")).at("vector_add.cu", 4),
            bra("done").when("%p"),
        ])
        .block("body")
        .extend([
            ld(Space::Param, Type::U64, reg("%a"), sym_addr("a", 0)),
            ld(Space::Param, Type::U64, reg("%b"), sym_addr("b", 0)),
            ld(Space::Param, Type::U64, reg("%c"), sym_addr("c", 0)),
            mul(MulMode::Wide, Type::U32, reg("%off"), reg("%i"), imm(4)),
            add(Type::U64, reg("%pa"), reg("%a"), reg("%off")),
            add(Type::U64, reg("%pb"), reg("%b"), reg("%off")),
            add(Type::U64, reg("%pc"), reg("%c"), reg("%off")),
            ld(Space::Global, Type::U32, reg("%x"), addr("%pa", 0)).at("vector_add.cu", 5),
            ld(Space::Global, Type::U32, reg("%y"), addr("%pb", 0)).at("vector_add.cu", 5),
            add(Type::U32, reg("%z"), reg("%x"), reg("%y")).at("vector_add.cu", 5),
            st(Space::Global, Type::U32, addr("%pc", 0), reg("%z")).at("vector_add.cu", 5),
        ])
        .block("done")
        .push(exit())
        .build()
}

/// Threads below 2 compute `tid + 10`, the others `tid + 100`.
#[must_use]
pub fn divergent_arms() -> Function {
    FunctionBuilder::entry("divergent_arms")
        .param("out", Type::U64)
        .extend([
            mov(Type::U32, reg("%t"), tid()),
            setp(CmpOp::Lt, Type::U32, reg("%p"), reg("%t"), imm(2)),
            bra("then").when("%p"),
        ])
        .block("else")
        .extend([
            add(Type::U32, reg("%b"), reg("%t"), imm(100)),
            mov(Type::U32, reg("%r"), reg("%b")),
            bra("join"),
        ])
        .block("then")
        .extend([
            add(Type::U32, reg("%a"), reg("%t"), imm(10)),
            mov(Type::U32, reg("%r"), reg("%a")),
        ])
        .block("join")
        .extend(store_per_thread("out", "%r"))
        .push(exit())
        .build()
}

/// Thread `t` sums `0..n + t` in a loop, so threads leave the loop one by one.
#[must_use]
pub fn loop_sum() -> Function {
    FunctionBuilder::entry("loop_sum")
        .param("out", Type::U64)
        .param("n", Type::U32)
        .extend([
            ld(Space::Param, Type::U32, reg("%n"), sym_addr("n", 0)),
            mov(Type::U32, reg("%t"), tid()),
            add(Type::U32, reg("%limit"), reg("%n"), reg("%t")),
            mov(Type::U32, reg("%acc"), imm(0)),
            mov(Type::U32, reg("%i"), imm(0)),
        ])
        .block("loop")
        .extend([
            add(Type::U32, reg("%acc"), reg("%acc"), reg("%i")),
            add(Type::U32, reg("%i"), reg("%i"), imm(1)),
            setp(CmpOp::Lt, Type::U32, reg("%p"), reg("%i"), reg("%limit")),
            bra("loop").when("%p"),
        ])
        .block("done")
        .extend(store_per_thread("out", "%acc"))
        .push(exit())
        .build()
}

/// `y = x * x`
#[must_use]
pub fn square_function() -> Function {
    FunctionBuilder::func("square")
        .param("x", Type::U32)
        .returns("y", Type::U32)
        .extend([
            ld(Space::Param, Type::U32, reg("%x"), sym_addr("x", 0)),
            mul(MulMode::Lo, Type::U32, reg("%y"), reg("%x"), reg("%x")),
            st(Space::Param, Type::U32, sym_addr("y", 0), reg("%y")),
            ret(),
        ])
        .build()
}

/// `s = a * a + b * b`, keeping `a * a` in a stack variable across the second call.
#[must_use]
pub fn sum_of_squares_function() -> Function {
    FunctionBuilder::func("sum_of_squares")
        .param("a", Type::U32)
        .param("b", Type::U32)
        .returns("s", Type::U32)
        .variable(Variable::new("tmp", Space::Local, Type::U32, 1))
        .extend([
            ld(Space::Param, Type::U32, reg("%a"), sym_addr("a", 0)),
            ld(Space::Param, Type::U32, reg("%b"), sym_addr("b", 0)),
            call("square", vec![reg("%sa")], vec![reg("%a")]),
            st(Space::Local, Type::U32, sym_addr("tmp", 0), reg("%sa")),
            call("square", vec![reg("%sb")], vec![reg("%b")]),
            ld(Space::Local, Type::U32, reg("%tmp"), sym_addr("tmp", 0)),
            add(Type::U32, reg("%s"), reg("%tmp"), reg("%sb")),
            st(Space::Param, Type::U32, sym_addr("s", 0), reg("%s")),
            ret(),
        ])
        .build()
}

/// `out[i] = tid * tid + 9` through nested device function calls.
#[must_use]
pub fn calls() -> Module {
    let entry = FunctionBuilder::entry("squares")
        .param("out", Type::U64)
        .push(mov(Type::U32, reg("%t"), tid()))
        .push(call("sum_of_squares", vec![reg("%r")], vec![reg("%t"), imm(3)]))
        .extend(store_per_thread("out", "%r"))
        .push(exit())
        .build();
    Module::new("calls")
        .with_function(entry)
        .with_function(sum_of_squares_function())
        .with_function(square_function())
}

/// Calls a function that exists in no module.
#[must_use]
pub fn missing_call() -> Module {
    let entry = FunctionBuilder::entry("calls_missing")
        .param("out", Type::U64)
        .push(mov(Type::U32, reg("%t"), tid()))
        .push(call("nowhere", vec![reg("%r")], vec![reg("%t")]))
        .extend(store_per_thread("out", "%r"))
        .push(exit())
        .build();
    Module::new("missing").with_function(entry)
}

/// Calls `square` defined in [`library`].
#[must_use]
pub fn remote_caller() -> Module {
    let entry = FunctionBuilder::entry("remote_square")
        .param("out", Type::U64)
        .push(mov(Type::U32, reg("%t"), tid()))
        .push(call("square", vec![reg("%r")], vec![reg("%t")]))
        .extend(store_per_thread("out", "%r"))
        .push(exit())
        .build();
    Module::new("caller").with_function(entry)
}

#[must_use]
pub fn library() -> Module {
    Module::new("library").with_function(square_function())
}

/// Exchange values between the halves of a four thread block.
///
/// Both halves write shared memory on their own path and wait at barrier 0
/// before reading the value of thread `3 - tid`.
#[must_use]
pub fn barrier_split() -> Function {
    FunctionBuilder::entry("barrier_split")
        .param("out", Type::U64)
        .variable(Variable::new("buf", Space::Shared, Type::U32, 4))
        .extend([
            mov(Type::U32, reg("%t"), tid()),
            mul(MulMode::Wide, Type::U32, reg("%off"), reg("%t"), imm(4)),
            mov(Type::U64, reg("%buf"), sym("buf")),
            add(Type::U64, reg("%mine"), reg("%buf"), reg("%off")),
            setp(CmpOp::Lt, Type::U32, reg("%p"), reg("%t"), imm(2)),
            bra("low").when("%p"),
        ])
        .block("high")
        .extend([
            mul(MulMode::Lo, Type::U32, reg("%v"), reg("%t"), imm(10)),
            st(Space::Shared, Type::U32, addr("%mine", 0), reg("%v")),
            bar(0),
            bra("join"),
        ])
        .block("low")
        .extend([
            add(Type::U32, reg("%v"), reg("%t"), imm(1)),
            st(Space::Shared, Type::U32, addr("%mine", 0), reg("%v")),
            bar(0),
        ])
        .block("join")
        .extend([
            xor(Type::B32, reg("%other"), reg("%t"), imm(3)),
            mul(MulMode::Wide, Type::U32, reg("%other_off"), reg("%other"), imm(4)),
            add(Type::U64, reg("%theirs"), reg("%buf"), reg("%other_off")),
            ld(Space::Shared, Type::U32, reg("%w"), addr("%theirs", 0)),
        ])
        .extend(store_per_thread("out", "%w"))
        .push(exit())
        .build()
}

/// The halves wait at different barriers, each expecting the whole block.
#[must_use]
pub fn barrier_deadlock() -> Function {
    FunctionBuilder::entry("barrier_deadlock")
        .extend([
            mov(Type::U32, reg("%t"), tid()),
            setp(CmpOp::Lt, Type::U32, reg("%p"), reg("%t"), imm(2)),
            bra("low").when("%p"),
        ])
        .block("high")
        .extend([bar(1), exit()])
        .block("low")
        .extend([bar(0), exit()])
        .build()
}

/// Thread 1 computes 7, every other thread 6.
#[must_use]
pub fn predicated() -> Function {
    FunctionBuilder::entry("predicated")
        .param("out", Type::U64)
        .extend([
            mov(Type::U32, reg("%t"), tid()),
            setp(CmpOp::Eq, Type::U32, reg("%p"), reg("%t"), imm(1)),
            mov(Type::U32, reg("%r"), imm(5)),
            mov(Type::U32, reg("%r"), imm(7)).when("%p"),
            add(Type::U32, reg("%r"), reg("%r"), imm(1)).unless("%p"),
        ])
        .extend(store_per_thread("out", "%r"))
        .push(exit())
        .build()
}

/// Every thread of every block increments `*counter`.
#[must_use]
pub fn atomic_count() -> Function {
    FunctionBuilder::entry("atomic_count")
        .param("counter", Type::U64)
        .extend([
            ld(Space::Param, Type::U64, reg("%counter"), sym_addr("counter", 0)),
            atom(
                Space::Global,
                AtomOp::Add,
                Type::U32,
                reg("%old"),
                addr("%counter", 0),
                imm(1),
            ),
            exit(),
        ])
        .build()
}

/// `out[i] = tex[tid - 1]`, reading out of range coordinates clamped.
#[must_use]
pub fn texture_fetch() -> Module {
    let entry = FunctionBuilder::entry("fetch")
        .param("out", Type::U64)
        .extend([
            mov(Type::U32, reg("%t"), tid()),
            sub(Type::S32, reg("%x"), reg("%t"), imm(1)),
            tex(TexGeometry::D1, Type::U32, reg("%v"), "tex", reg("%x"), None),
        ])
        .extend(store_per_thread("out", "%v"))
        .push(exit())
        .build();
    Module::new("textures")
        .with_texture("tex", Type::U32, TexGeometry::D1)
        .with_function(entry)
}

/// `out[i] = table[tid % 4]` from module constant memory.
#[must_use]
pub fn const_lookup() -> Module {
    let table: Vec<u8> = [10u32, 20, 30, 40]
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect();
    let entry = FunctionBuilder::entry("lookup")
        .param("out", Type::U64)
        .extend([
            mov(Type::U32, reg("%t"), tid()),
            and(Type::B32, reg("%idx"), reg("%t"), imm(3)),
            mul(MulMode::Wide, Type::U32, reg("%off"), reg("%idx"), imm(4)),
            mov(Type::U64, reg("%table"), sym("table")),
            add(Type::U64, reg("%addr"), reg("%table"), reg("%off")),
            ld(Space::Const, Type::U32, reg("%v"), addr("%addr", 0)),
        ])
        .extend(store_per_thread("out", "%v"))
        .push(exit())
        .build();
    Module::new("constants")
        .with_variable(Variable::new("table", Space::Const, Type::U32, 4).with_initializer(table))
        .with_function(entry)
}

/// Threads write `tid` through one extern shared array and read their
/// neighbour's value through another one aliasing it.
#[must_use]
pub fn dynamic_shared() -> Function {
    FunctionBuilder::entry("dynamic_shared")
        .param("out", Type::U64)
        .variable(Variable::extern_shared("dyn", Type::U32))
        .variable(Variable::extern_shared("dyn_alias", Type::U32))
        .extend([
            mov(Type::U32, reg("%t"), tid()),
            mov(Type::U32, reg("%n"), special(Special::Ntid(Axis::X))),
            mul(MulMode::Wide, Type::U32, reg("%off"), reg("%t"), imm(4)),
            mov(Type::U64, reg("%dyn"), sym("dyn")),
            add(Type::U64, reg("%mine"), reg("%dyn"), reg("%off")),
            st(Space::Shared, Type::U32, addr("%mine", 0), reg("%t")),
            bar(0),
            add(Type::U32, reg("%next"), reg("%t"), imm(1)),
            rem(Type::U32, reg("%next"), reg("%next"), reg("%n")),
            mul(MulMode::Wide, Type::U32, reg("%next_off"), reg("%next"), imm(4)),
            mov(Type::U64, reg("%alias"), sym("dyn_alias")),
            add(Type::U64, reg("%theirs"), reg("%alias"), reg("%next_off")),
            ld(Space::Shared, Type::U32, reg("%v"), addr("%theirs", 0)),
        ])
        .extend(store_per_thread("out", "%v"))
        .push(exit())
        .build()
}

/// `v = lut[0]`, read from constant memory of the function's own module.
#[must_use]
pub fn constant_getter() -> Function {
    FunctionBuilder::func("get")
        .returns("v", Type::U32)
        .extend([
            ld(Space::Const, Type::U32, reg("%v"), sym_addr("lut", 0)),
            st(Space::Param, Type::U32, sym_addr("v", 0), reg("%v")),
            ret(),
        ])
        .build()
}

fn constant_reader() -> Function {
    FunctionBuilder::entry("read_lut")
        .param("out", Type::U64)
        .push(call("get", vec![reg("%r")], vec![]))
        .extend(store_per_thread("out", "%r"))
        .push(exit())
        .build()
}

fn lut() -> Variable {
    Variable::new("lut", Space::Const, Type::U32, 1).with_initializer(7u32.to_le_bytes().to_vec())
}

/// Exposes `get` reading its own `lut`.
#[must_use]
pub fn constant_library() -> Module {
    Module::new("constant_library")
        .with_variable(lut())
        .with_function(constant_getter())
}

/// Calls `get` of [`constant_library`] from a module with constants of its own.
#[must_use]
pub fn constant_caller() -> Module {
    Module::new("constant_caller")
        .with_variable(
            Variable::new("mine", Space::Const, Type::U32, 1)
                .with_initializer(1u32.to_le_bytes().to_vec()),
        )
        .with_function(constant_reader())
}

/// `lut`, `get` and the calling kernel in one module.
#[must_use]
pub fn constant_module() -> Module {
    Module::new("constant_module")
        .with_variable(lut())
        .with_function(constant_reader())
        .with_function(constant_getter())
}
