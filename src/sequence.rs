//! Flattening of a function's control flow graph into a PC-indexed sequence.

use crate::error::Error;
use crate::instruction::{Base, Call, CallTarget, Guard, Instruction, Operand, Pc, Reg};
use indexmap::IndexMap;
use petgraph::algo::dominators;
use petgraph::prelude::*;
use petgraph::visit::Reversed;
use ptx::builder;
use std::collections::BTreeMap;

/// Packed instruction array and its basic block maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    pub instructions: Vec<Instruction>,
    /// Start PC of every block that some branch targets.
    pub branch_targets: BTreeMap<Pc, String>,
    /// PC of the last instruction of every block.
    pub block_ends: BTreeMap<Pc, String>,
    /// PC of the first instruction of every block.
    pub block_starts: BTreeMap<Pc, String>,
}

impl Sequence {
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    #[must_use]
    pub fn get(&self, pc: Pc) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    /// Label of the block containing `pc`.
    #[must_use]
    pub fn block_of(&self, pc: Pc) -> Option<&str> {
        if pc >= self.len() {
            return None;
        }
        self.block_starts
            .range(..=pc)
            .next_back()
            .map(|(_, label)| label.as_str())
    }

    /// Append `other`, moving its PCs behind the current end.
    ///
    /// Block labels of the appended part are prefixed with `prefix`.
    /// Returns the PC of the first appended instruction.
    pub fn append(&mut self, other: &Sequence, prefix: &str) -> Pc {
        let base = self.len();
        self.instructions
            .extend(other.instructions.iter().cloned().map(|mut inst| {
                inst.relocate(base);
                inst
            }));
        let relabel = |(pc, label): (&Pc, &String)| (pc + base, format!("{prefix}.{label}"));
        self.branch_targets
            .extend(other.branch_targets.iter().map(relabel));
        self.block_ends.extend(other.block_ends.iter().map(relabel));
        self.block_starts.extend(other.block_starts.iter().map(relabel));
        base
    }
}

struct Block {
    label: String,
    instructions: Vec<ptx::Instruction>,
}

/// Order blocks so that fall-through successors follow their predecessor
/// wherever possible.
fn layout(function: &ptx::Function) -> Result<Vec<Block>, Error> {
    let invalid = |message: String| Error::invalid_kernel(&function.name, message);
    if function.blocks.is_empty() {
        return Err(invalid("function has no basic blocks".to_string()));
    }
    let mut labels: IndexMap<&str, usize> = IndexMap::new();
    for (idx, block) in function.blocks.iter().enumerate() {
        if labels.insert(block.label.as_str(), idx).is_some() {
            return Err(invalid(format!("duplicate label {:?}", block.label)));
        }
    }

    let end: fn() -> ptx::Instruction = if function.is_entry() {
        builder::exit
    } else {
        builder::ret
    };

    let mut placed = vec![false; function.blocks.len()];
    let mut order = Vec::with_capacity(function.blocks.len());
    for start in 0..function.blocks.len() {
        let mut current = Some(start);
        while let Some(idx) = current.take() {
            if placed[idx] {
                break;
            }
            placed[idx] = true;
            let block = &function.blocks[idx];
            let mut instructions = block.instructions.clone();
            if !block.is_terminated() {
                match &block.fallthrough {
                    Some(next_label) => {
                        let next = *labels.get(next_label.as_str()).ok_or_else(|| {
                            invalid(format!(
                                "block {:?} falls through to unknown label {next_label:?}",
                                block.label
                            ))
                        })?;
                        if placed[next] || instructions.is_empty() {
                            instructions.push(builder::bra(next_label));
                        }
                        if !placed[next] {
                            current = Some(next);
                        }
                    }
                    None => instructions.push(end()),
                }
            }
            order.push(Block {
                label: block.label.clone(),
                instructions,
            });
        }
    }
    Ok(order)
}

/// Route every `ret` of a device function through one trailing return block.
fn single_return(function: &ptx::Function, blocks: &mut Vec<Block>) -> Result<(), Error> {
    let label = format!("$return_{}", function.name);
    if blocks.iter().any(|block| block.label == label) {
        return Err(Error::invalid_kernel(
            &function.name,
            format!("reserved label {label:?} is already used"),
        ));
    }
    for inst in blocks.iter_mut().flat_map(|block| block.instructions.iter_mut()) {
        if inst.opcode == ptx::Opcode::Ret {
            let guard = inst.guard.take();
            let location = inst.location.take();
            *inst = builder::bra(&label);
            inst.guard = guard;
            inst.location = location;
        }
    }
    blocks.push(Block {
        label,
        instructions: vec![builder::ret()],
    });
    Ok(())
}

fn convert_operand(
    operand: &ptx::Operand,
    labels: &IndexMap<String, Pc>,
    kernel: &str,
) -> Result<Operand, Error> {
    let operand = match operand {
        ptx::Operand::Register(name) => Operand::Register(Reg::Virtual(name.clone())),
        ptx::Operand::Immediate(value) => Operand::Immediate(*value),
        ptx::Operand::Special(special) => Operand::Special(*special),
        ptx::Operand::Symbol(name) => Operand::Symbol(name.clone()),
        ptx::Operand::Texture(name) => Operand::Texture(name.clone()),
        ptx::Operand::Address { base, offset } => {
            let base = match base {
                ptx::AddressBase::Register(name) => Base::Register(Reg::Virtual(name.clone())),
                ptx::AddressBase::Symbol(name) => Base::Symbol(name.clone()),
            };
            Operand::Address {
                base,
                offset: *offset,
            }
        }
        ptx::Operand::Label(label) => {
            let pc = labels.get(label).ok_or_else(|| {
                Error::invalid_kernel(kernel, format!("branch to unknown label {label:?}"))
            })?;
            Operand::Target(*pc)
        }
    };
    Ok(operand)
}

fn convert(
    inst: &ptx::Instruction,
    pc: Pc,
    labels: &IndexMap<String, Pc>,
    kernel: &str,
) -> Result<Instruction, Error> {
    let operand = |operand: &Option<ptx::Operand>| {
        operand
            .as_ref()
            .map(|operand| convert_operand(operand, labels, kernel))
            .transpose()
    };
    let call = match &inst.call {
        Some(call) => {
            let convert_all = |operands: &[ptx::Operand]| {
                operands
                    .iter()
                    .map(|operand| convert_operand(operand, labels, kernel))
                    .collect::<Result<Vec<_>, _>>()
            };
            Some(Call {
                function: call.function.clone(),
                target: CallTarget::Unresolved,
                returns: convert_all(&call.returns)?.into(),
                arguments: convert_all(&call.arguments)?.into(),
            })
        }
        None => None,
    };
    Ok(Instruction {
        pc,
        opcode: inst.opcode,
        ty: inst.ty,
        guard: inst.guard.as_ref().map(|guard| Guard {
            reg: Reg::Virtual(guard.register.clone()),
            negated: guard.negated,
        }),
        d: operand(&inst.d)?,
        a: operand(&inst.a)?,
        b: operand(&inst.b)?,
        c: operand(&inst.c)?,
        call,
        reconverge: None,
        location: inst.location.clone(),
    })
}

/// Set the reconvergence PC of every conditional branch to the start of the
/// immediate post-dominator of its block.
fn compute_reconvergence(sequence: &mut Sequence) {
    let starts: Vec<Pc> = sequence.block_starts.keys().copied().collect();
    let block_index = |pc: Pc| starts.partition_point(|start| *start <= pc) - 1;

    let mut cfg: DiGraph<Option<Pc>, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = starts.iter().map(|start| cfg.add_node(Some(*start))).collect();
    let exit = cfg.add_node(None);

    for (idx, start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(sequence.len());
        for inst in &sequence.instructions[*start..end] {
            if let Some(target) = inst.target() {
                cfg.update_edge(nodes[idx], nodes[block_index(target)], ());
            }
            if matches!(inst.opcode, ptx::Opcode::Exit | ptx::Opcode::Ret) {
                cfg.update_edge(nodes[idx], exit, ());
            }
        }
        let last = &sequence.instructions[end - 1];
        if !last.is_terminator() {
            let next = nodes.get(idx + 1).copied().unwrap_or(exit);
            cfg.update_edge(nodes[idx], next, ());
        }
    }

    let post_dominators = dominators::simple_fast(Reversed(&cfg), exit);
    for (idx, start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(sequence.len());
        let reconverge = post_dominators
            .immediate_dominator(nodes[idx])
            .and_then(|node| cfg[node]);
        for inst in &mut sequence.instructions[*start..end] {
            if inst.opcode.is_branch() && inst.guard.is_some() {
                inst.reconverge = reconverge;
            }
        }
    }
}

/// Build the executable sequence of `function`.
pub fn sequence(function: &ptx::Function) -> Result<Sequence, Error> {
    let mut blocks = layout(function)?;
    if !function.is_entry() {
        single_return(function, &mut blocks)?;
    }

    let mut labels: IndexMap<String, Pc> = IndexMap::new();
    let mut pc = 0;
    for block in &blocks {
        labels.insert(block.label.clone(), pc);
        pc += block.instructions.len();
    }

    let mut sequence = Sequence::default();
    for block in &blocks {
        let start = sequence.len();
        for inst in &block.instructions {
            let pc = sequence.len();
            sequence
                .instructions
                .push(convert(inst, pc, &labels, &function.name)?);
        }
        sequence.block_starts.insert(start, block.label.clone());
        sequence
            .block_ends
            .insert(sequence.len() - 1, block.label.clone());
    }
    let targets: Vec<Pc> = sequence
        .instructions
        .iter()
        .filter_map(Instruction::target)
        .collect();
    for target in targets {
        if let Some(label) = sequence.block_starts.get(&target) {
            sequence.branch_targets.insert(target, label.clone());
        }
    }
    compute_reconvergence(&mut sequence);

    log::debug!(
        "sequenced {} into {} instructions in {} blocks",
        function.name,
        sequence.len(),
        sequence.block_starts.len()
    );
    Ok(sequence)
}
