//! The work queue shared by the researchers.

use crate::containers::InsertionOrderedSet;
use crate::ircode::{FunctionRef, OperationRef, Program, ValueRef};
use std::collections::BTreeMap;

/// Operations still to be researched, grouped per function. Researching an operation may queue
/// more (e.g. once it is known that a value is an address, the operations around it are worth
/// another look).
#[derive(Default, Debug)]
pub struct ResearcherPropagationContext {
    /// The operation being researched
    pub operation: Option<OperationRef>,
    next_operations: BTreeMap<FunctionRef, InsertionOrderedSet<OperationRef>>,
}

impl ResearcherPropagationContext {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queue `op`, unless it is already queued (or being researched right now).
    pub fn add_next_operation(&mut self, program: &Program, op: OperationRef) {
        if self.operation == Some(op) {
            return;
        }
        let function = program.block(program.operation(op).block).function;
        self.next_operations.entry(function).or_default().insert(op);
    }

    /// Queue every live operation touching `value`: the one that produced it and its readers.
    pub fn mark_value_as_affected(&mut self, program: &Program, value: ValueRef) {
        let v = program.value(value);
        for op in v.source().into_iter().chain(v.uses.iter().copied()) {
            if !program.operation(op).removed {
                self.add_next_operation(program, op);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.next_operations.values().all(|ops| ops.is_empty())
    }

    /// Pop the next operation to research (the earliest queued one of the first function) and
    /// make it the current one.
    pub fn next(&mut self) -> Option<OperationRef> {
        loop {
            let (&function, ops) = self.next_operations.iter_mut().next()?;
            match ops.pop_front() {
                Some(op) => {
                    self.operation = Some(op);
                    return Some(op);
                }
                None => {
                    self.next_operations.remove(&function);
                }
            }
        }
    }

    /// Research queued operations with `f` until nothing is left.
    pub fn collect(&mut self, mut f: impl FnMut(&mut Self, OperationRef)) {
        while let Some(op) = self.next() {
            f(self, op);
        }
        self.operation = None;
    }
}
