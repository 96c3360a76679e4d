//! Constant branch conditions: which `var == C` facts hold when control reaches a block.

use crate::containers::BitSet;
use crate::events::{Event, EventPipe};
use crate::ircode::{FunctionRef, IRcodeEvent, OperationId, Program, ValueRef};
use crate::log::*;
use crate::pcode::BlockRef;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConstantConditionType {
    Equal,
    NotEqual,
}

/// A fact about a variable, valid within some block
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConstantCondition {
    pub cond_type: ConstantConditionType,
    pub variable: ValueRef,
    pub value: u64,
}

impl ConstantCondition {
    pub fn describe(&self, program: &Program) -> String {
        let op = match self.cond_type {
            ConstantConditionType::Equal => "==",
            ConstantConditionType::NotEqual => "!=",
        };
        format!("{} {} {}", program.variable_name(self.variable), op, self.value)
    }
}

/// The comparison a conditional block branches on
#[derive(Clone, Debug)]
struct Condition {
    variable: ValueRef,
    value: u64,
    block: BlockRef,
    /// `INT_NOTEQUAL`: the branch is taken when the values differ
    inverted: bool,
    /// Blocks reachable from the branch target (taken when the comparison holds)
    then_blocks: BitSet,
    /// Blocks reachable from the fall-through block
    else_blocks: BitSet,
}

/// Records the `(variable, constant)` comparisons blocks branch on, per function.
pub struct ConstConditionRepository {
    program: Rc<RefCell<Program>>,
    conditions: RefCell<BTreeMap<FunctionRef, Vec<Condition>>>,
}

impl ConstConditionRepository {
    pub fn new(program: Rc<RefCell<Program>>) -> Rc<Self> {
        Rc::new(Self {
            program,
            conditions: Default::default(),
        })
    }

    /// The pipe to send IR-code events to
    pub fn event_pipe(self: &Rc<Self>) -> EventPipe<Event> {
        let pipe = EventPipe::new();
        let this: Weak<Self> = Rc::downgrade(self);
        pipe.subscribe_topic::<IRcodeEvent>(move |event| {
            if let Some(this) = this.upgrade() {
                this.handle(event);
            }
        });
        pipe
    }

    fn handle(&self, event: &IRcodeEvent) {
        match event {
            IRcodeEvent::FunctionDecompiled { function, blocks } => {
                let program = self.program.borrow();
                let mut conditions = self.conditions.borrow_mut();
                let function_conditions = conditions.entry(*function).or_default();
                function_conditions.clear();
                for block in blocks {
                    if let Some(cond) = research_block(&program, *block) {
                        trace!("Constant condition found";
                            "block" => program.block_name(*block),
                            "variable" => program.variable_name(cond.variable),
                            "value" => cond.value);
                        function_conditions.push(cond);
                    }
                }
            }
            IRcodeEvent::BlockRemoved(block) => {
                for conds in self.conditions.borrow_mut().values_mut() {
                    conds.retain(|c| c.block != *block);
                    for cond in conds.iter_mut() {
                        cond.then_blocks.set(block.0, false);
                        cond.else_blocks.set(block.0, false);
                    }
                }
            }
            IRcodeEvent::FunctionRemoved(function) => {
                self.conditions.borrow_mut().remove(function);
            }
            _ => {}
        }
    }

    /// The facts known to hold when control reaches `block`. A condition only says something about
    /// the blocks reachable from exactly one of its two branches.
    pub fn find_conditions(&self, program: &Program, block: BlockRef) -> Vec<ConstantCondition> {
        let function = program.block(block).function;
        let conditions = self.conditions.borrow();
        let mut res = vec![];
        for cond in conditions.get(&function).into_iter().flatten() {
            let in_then = cond.then_blocks.get(block.0);
            let in_else = cond.else_blocks.get(block.0);
            if in_then == in_else {
                continue;
            }
            let cond_type = if in_then ^ cond.inverted {
                ConstantConditionType::Equal
            } else {
                ConstantConditionType::NotEqual
            };
            res.push(ConstantCondition {
                cond_type,
                variable: cond.variable,
                value: cond.value,
            });
        }
        res
    }
}

fn research_block(program: &Program, block: BlockRef) -> Option<Condition> {
    let cond_var = program.block(block).condition?;
    let op = program.operation(program.value(cond_var).source()?);
    let inverted = match op.id {
        OperationId::IntEqual => false,
        OperationId::IntNotEqual => true,
        _ => return None,
    };
    let (input1, input2) = op.binary_inputs()?;
    if !program.value(input1).is_variable() {
        return None;
    }
    let value = program.value(input2).constant()?;
    let pcode_block = program.pcode_block(block);
    let (far, near) = (pcode_block.far?, pcode_block.near?);
    Some(Condition {
        variable: input1,
        value,
        block,
        inverted,
        then_blocks: reachable_blocks(program, far, block),
        else_blocks: reachable_blocks(program, near, block),
    })
}

/// Blocks reachable from `start` without going through `stop`
fn reachable_blocks(program: &Program, start: BlockRef, stop: BlockRef) -> BitSet {
    let mut visited = BitSet::new();
    let mut queue = VecDeque::from(vec![start]);
    while let Some(block) = queue.pop_front() {
        if block == stop || visited.get(block.0) {
            continue;
        }
        visited.set(block.0, true);
        queue.extend(program.pcode_block(block).successors());
    }
    visited
}

/// The facts of each block of `function` which has any, `Block B3:` followed by one indented
/// `var2 != 5` line per fact.
pub fn print_conditions(
    program: &Program,
    repo: &ConstConditionRepository,
    function: FunctionRef,
) -> String {
    let mut lines = vec![];
    for block in &program.function(function).blocks {
        let conditions = repo.find_conditions(program, *block);
        if conditions.is_empty() {
            continue;
        }
        lines.push(format!("Block {}:", program.block_name(*block)));
        for cond in conditions {
            lines.push(format!("    {}", cond.describe(program)));
        }
    }
    lines.join("\n")
}
