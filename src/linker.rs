//! Lazy linking of device functions into a kernel's instruction sequence.

use crate::error::Error;
use crate::instruction::{CallTarget, Pc};
use crate::kernel::EmulatedKernel;
use crate::sequence::Sequence;
use crate::sync::Arc;
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// Program of a kernel together with the functions linked into it so far.
///
/// Linked code is only ever appended, so PCs stay valid once handed out.
#[derive(Debug)]
pub struct Linker {
    program: Arc<Sequence>,
    function_entry_points: IndexMap<String, Pc>,
    kernel_entry_points: BTreeMap<Pc, Arc<EmulatedKernel>>,
}

impl Linker {
    #[must_use]
    pub fn new(program: Sequence) -> Self {
        Self {
            program: Arc::new(program),
            function_entry_points: IndexMap::new(),
            kernel_entry_points: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn program(&self) -> Arc<Sequence> {
        Arc::clone(&self.program)
    }

    /// Entry PC of a linked function.
    #[must_use]
    pub fn entry_point(&self, name: &str) -> Option<Pc> {
        self.function_entry_points.get(name).copied()
    }

    #[must_use]
    pub fn entry_points(&self) -> &IndexMap<String, Pc> {
        &self.function_entry_points
    }

    /// Append `callee` unless it is already linked, returning its entry PC.
    pub fn link(&mut self, callee: &Arc<EmulatedKernel>) -> Pc {
        if let Some(pc) = self.entry_point(callee.name()) {
            return pc;
        }
        let body = callee.sequence();
        let program = Arc::make_mut(&mut self.program);
        let entry = program.append(&body, callee.name());
        log::debug!(
            "linked {} at pc={entry} ({} instructions)",
            callee.name(),
            body.len()
        );
        self.function_entry_points
            .insert(callee.name().to_string(), entry);
        self.kernel_entry_points.insert(entry, Arc::clone(callee));
        entry
    }

    /// Point the call at `call_pc` to `entry`.
    pub fn patch(&mut self, call_pc: Pc, entry: Pc) -> Result<(), Error> {
        let resolved = CallTarget::Resolved(entry);
        let already = self
            .program
            .get(call_pc)
            .and_then(|inst| inst.call.as_ref())
            .map(|call| call.target == resolved);
        match already {
            None => Err(Error::fault(call_pc, "not a call instruction")),
            Some(true) => Ok(()),
            Some(false) => {
                let program = Arc::make_mut(&mut self.program);
                if let Some(call) = program.instructions[call_pc].call.as_mut() {
                    call.target = resolved;
                }
                Ok(())
            }
        }
    }

    /// Whether `pc` starts the kernel itself or a linked function.
    #[must_use]
    pub fn is_entry(&self, pc: Pc) -> bool {
        pc == 0 || self.kernel_entry_points.contains_key(&pc)
    }

    /// Function owning the entry at `pc`.
    #[must_use]
    pub fn get_kernel(&self, pc: Pc) -> Option<Arc<EmulatedKernel>> {
        self.kernel_entry_points.get(&pc).cloned()
    }

    /// Mark every call site unresolved.
    pub fn invalidate_call_targets(&mut self) {
        let program = Arc::make_mut(&mut self.program);
        for call in program
            .instructions
            .iter_mut()
            .filter_map(|inst| inst.call.as_mut())
        {
            call.target = CallTarget::Unresolved;
        }
    }
}
