//! IR-code: an SSA-like representation built over p-code.
//!
//! Every value, operation, block and function lives in an arena owned by the [`Program`] and is
//! addressed by a copyable handle. Removed operations (and blocks, and functions) stay in their
//! arena flagged as removed, so that the handles carried by removal events remain inspectable.

use crate::calling_convention::{CallingConvention, FunctionSignature};
use crate::containers::unordered::UnorderedSet;
use crate::hashing::{hash_all, Hash};
use crate::log::*;
use crate::pcode::{self, BlockRef, InstructionOffset};
use std::collections::{BTreeMap, VecDeque};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ValueRef(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct OperationRef(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct FunctionRef(pub usize);

/// Salt mixed into the hash of each kind of value
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueTag {
    Constant = 0,
    Register = 1,
    Variable = 2,
}

/// Where a variable lives: a base (identified by `base_addr_hash`, e.g. a register, or the value
/// some pointer was computed from) plus a byte offset. The address `value` is `None` for virtual
/// variables, which are not stored anywhere (PHI, CONCAT, LOAD results, ...).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MemoryAddress {
    pub value: Option<ValueRef>,
    pub base_addr_hash: Hash,
    pub offset: u64,
}

impl MemoryAddress {
    pub fn is_virtual(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Constant {
        value: u64,
        size: usize,
    },
    Register {
        register: pcode::Register,
    },
    Variable {
        /// `0` for variables made while looking values up without generating code
        id: usize,
        mem_address: MemoryAddress,
        size: usize,
        /// The operation that produced the variable
        source: Option<OperationRef>,
    },
}

#[derive(Clone, Debug)]
pub struct Value {
    pub kind: ValueKind,
    pub hash: Hash,
    pub linear_expr: LinearExpression,
    /// Operations reading this value
    pub uses: Vec<OperationRef>,
}

impl Value {
    pub fn size(&self) -> usize {
        match &self.kind {
            ValueKind::Constant { size, .. } => *size,
            ValueKind::Register { register } => register.size,
            ValueKind::Variable { size, .. } => *size,
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, ValueKind::Variable { .. })
    }

    pub fn mem_address(&self) -> Option<&MemoryAddress> {
        match &self.kind {
            ValueKind::Variable { mem_address, .. } => Some(mem_address),
            _ => None,
        }
    }

    pub fn register(&self) -> Option<&pcode::Register> {
        match &self.kind {
            ValueKind::Register { register } => Some(register),
            _ => None,
        }
    }

    pub fn constant(&self) -> Option<u64> {
        match &self.kind {
            ValueKind::Constant { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn source(&self) -> Option<OperationRef> {
        match &self.kind {
            ValueKind::Variable { source, .. } => *source,
            _ => None,
        }
    }

    pub fn is_used(&self) -> bool {
        !self.uses.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Term {
    pub value: ValueRef,
    /// Hash of `value`; terms over the same hash are merged
    pub hash: Hash,
    pub factor: u64,
}

/// `Σ term.value * term.factor + const_term`
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct LinearExpression {
    terms: Vec<Term>,
    const_term: u64,
}

impl LinearExpression {
    pub fn constant(value: u64) -> Self {
        Self {
            terms: vec![],
            const_term: value,
        }
    }

    pub fn term(value: ValueRef, hash: Hash) -> Self {
        Self {
            terms: vec![Term {
                value,
                hash,
                factor: 1,
            }],
            const_term: 0,
        }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn const_term_value(&self) -> u64 {
        self.const_term
    }

    /// Does the expression index into something (`base + idx * 4`), rather than just offset a
    /// base
    pub fn is_array_type(&self) -> bool {
        self.terms.len() > 1 || self.terms.iter().any(|t| t.factor != 1)
    }

    /// The product, if one side is a constant; `None` otherwise (non-linear).
    pub fn checked_mul(&self, other: &LinearExpression) -> Option<LinearExpression> {
        if other.terms.is_empty() {
            Some(self.scale(other.const_term))
        } else if self.terms.is_empty() {
            Some(other.scale(self.const_term))
        } else {
            None
        }
    }

    pub fn scale(&self, factor: u64) -> LinearExpression {
        if factor == 0 {
            return Self::constant(0);
        }
        Self {
            terms: self
                .terms
                .iter()
                .map(|t| Term {
                    factor: t.factor.wrapping_mul(factor),
                    ..*t
                })
                .collect(),
            const_term: self.const_term.wrapping_mul(factor),
        }
    }
}

impl std::ops::Add for &LinearExpression {
    type Output = LinearExpression;
    fn add(self, other: &LinearExpression) -> LinearExpression {
        let mut res = self.clone();
        for term in &other.terms {
            match res.terms.iter_mut().find(|t| t.hash == term.hash) {
                Some(t) => t.factor = t.factor.wrapping_add(term.factor),
                None => res.terms.push(*term),
            }
        }
        res.terms.retain(|t| t.factor != 0);
        res.const_term = res.const_term.wrapping_add(other.const_term);
        res
    }
}

impl std::ops::Add<u64> for &LinearExpression {
    type Output = LinearExpression;
    fn add(self, c: u64) -> LinearExpression {
        let mut res = self.clone();
        res.const_term = res.const_term.wrapping_add(c);
        res
    }
}

macro_rules! operation_ids {
    ($($id:ident => $name:literal),* $(,)?) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
        pub enum OperationId {
            $($id),*
        }

        impl OperationId {
            pub fn name(&self) -> &'static str {
                match self {
                    $(OperationId::$id => $name),*
                }
            }
        }
    };
}

operation_ids! {
    Copy => "COPY",
    Ref => "REF",
    Load => "LOAD",
    Extract => "EXTRACT",
    Concat => "CONCAT",
    Phi => "PHI",
    Call => "CALL",
    IntAdd => "INT_ADD",
    IntSub => "INT_SUB",
    IntCarry => "INT_CARRY",
    IntSCarry => "INT_SCARRY",
    IntSBorrow => "INT_SBORROW",
    Int2Comp => "INT_2COMP",
    IntMult => "INT_MULT",
    IntDiv => "INT_DIV",
    IntSDiv => "INT_SDIV",
    IntRem => "INT_REM",
    IntSRem => "INT_SREM",
    IntNegate => "INT_NEGATE",
    IntXor => "INT_XOR",
    IntAnd => "INT_AND",
    IntOr => "INT_OR",
    IntLeft => "INT_LEFT",
    IntRight => "INT_RIGHT",
    IntSRight => "INT_SRIGHT",
    IntZext => "INT_ZEXT",
    IntSext => "INT_SEXT",
    IntEqual => "INT_EQUAL",
    IntNotEqual => "INT_NOTEQUAL",
    IntSLess => "INT_SLESS",
    IntSLessEqual => "INT_SLESSEQUAL",
    IntLess => "INT_LESS",
    IntLessEqual => "INT_LESSEQUAL",
    BoolNegate => "BOOL_NEGATE",
    BoolXor => "BOOL_XOR",
    BoolAnd => "BOOL_AND",
    BoolOr => "BOOL_OR",
    FloatAdd => "FLOAT_ADD",
    FloatSub => "FLOAT_SUB",
    FloatMult => "FLOAT_MULT",
    FloatDiv => "FLOAT_DIV",
    FloatNeg => "FLOAT_NEG",
    FloatAbs => "FLOAT_ABS",
    FloatSqrt => "FLOAT_SQRT",
    FloatNan => "FLOAT_NAN",
    FloatEqual => "FLOAT_EQUAL",
    FloatNotEqual => "FLOAT_NOTEQUAL",
    FloatLess => "FLOAT_LESS",
    FloatLessEqual => "FLOAT_LESSEQUAL",
}

impl OperationId {
    /// The operation generated one-to-one for a p-code instruction, for the instructions that are
    /// translated that way
    pub fn from_instruction(id: pcode::InstructionId) -> Option<Self> {
        use pcode::InstructionId as I;
        use OperationId as O;
        Some(match id {
            I::IntAdd => O::IntAdd,
            I::IntSub => O::IntSub,
            I::IntCarry => O::IntCarry,
            I::IntSCarry => O::IntSCarry,
            I::IntSBorrow => O::IntSBorrow,
            I::Int2Comp => O::Int2Comp,
            I::IntMult => O::IntMult,
            I::IntDiv => O::IntDiv,
            I::IntSDiv => O::IntSDiv,
            I::IntRem => O::IntRem,
            I::IntSRem => O::IntSRem,
            I::IntNegate => O::IntNegate,
            I::IntXor => O::IntXor,
            I::IntAnd => O::IntAnd,
            I::IntOr => O::IntOr,
            I::IntLeft => O::IntLeft,
            I::IntRight => O::IntRight,
            I::IntSRight => O::IntSRight,
            I::IntZext => O::IntZext,
            I::IntSext => O::IntSext,
            I::IntEqual => O::IntEqual,
            I::IntNotEqual => O::IntNotEqual,
            I::IntSLess => O::IntSLess,
            I::IntSLessEqual => O::IntSLessEqual,
            I::IntLess => O::IntLess,
            I::IntLessEqual => O::IntLessEqual,
            I::BoolNegate => O::BoolNegate,
            I::BoolXor => O::BoolXor,
            I::BoolAnd => O::BoolAnd,
            I::BoolOr => O::BoolOr,
            I::FloatAdd => O::FloatAdd,
            I::FloatSub => O::FloatSub,
            I::FloatMult => O::FloatMult,
            I::FloatDiv => O::FloatDiv,
            I::FloatNeg => O::FloatNeg,
            I::FloatAbs => O::FloatAbs,
            I::FloatSqrt => O::FloatSqrt,
            I::FloatNan => O::FloatNan,
            I::FloatEqual => O::FloatEqual,
            I::FloatNotEqual => O::FloatNotEqual,
            I::FloatLess => O::FloatLess,
            I::FloatLessEqual => O::FloatLessEqual,
            _ => return None,
        })
    }
}

/// The location a REF operation takes its value from: a variable of another block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Reference {
    pub block: BlockRef,
    pub base_addr_hash: Hash,
    pub offset: u64,
    pub size: usize,
}

impl Reference {
    pub fn hash(&self) -> Hash {
        hash_all(
            0,
            &[
                self.block.0 as u64,
                self.base_addr_hash,
                self.offset,
                self.size as u64,
            ],
        )
    }
}

#[derive(Clone, Debug)]
pub enum OperationKind {
    Unary {
        input: ValueRef,
    },
    Binary {
        input1: ValueRef,
        input2: ValueRef,
    },
    Extract {
        input: ValueRef,
        offset: u64,
    },
    Concat {
        input1: ValueRef,
        input2: ValueRef,
        offset: u64,
    },
    Ref {
        input: ValueRef,
        reference: Reference,
    },
    Call {
        destination: ValueRef,
        arguments: Vec<ValueRef>,
    },
}

#[derive(Clone, Debug)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub output: ValueRef,
    pub block: BlockRef,
    /// The p-code instruction this operation was generated for
    pub instruction: InstructionOffset,
    /// Variables whose storage the output (partially) overwrote
    pub overwritten: Vec<ValueRef>,
    pub removed: bool,
}

impl Operation {
    pub fn inputs(&self) -> Vec<ValueRef> {
        match &self.kind {
            OperationKind::Unary { input }
            | OperationKind::Extract { input, .. }
            | OperationKind::Ref { input, .. } => vec![*input],
            OperationKind::Binary { input1, input2 }
            | OperationKind::Concat { input1, input2, .. } => vec![*input1, *input2],
            OperationKind::Call {
                destination,
                arguments,
            } => std::iter::once(*destination)
                .chain(arguments.iter().copied())
                .collect(),
        }
    }

    /// The single input of unary-shaped operations (COPY, LOAD, REF, EXTRACT, ...)
    pub fn unary_input(&self) -> Option<ValueRef> {
        match &self.kind {
            OperationKind::Unary { input }
            | OperationKind::Extract { input, .. }
            | OperationKind::Ref { input, .. } => Some(*input),
            _ => None,
        }
    }

    pub fn binary_inputs(&self) -> Option<(ValueRef, ValueRef)> {
        match &self.kind {
            OperationKind::Binary { input1, input2 }
            | OperationKind::Concat { input1, input2, .. } => Some((*input1, *input2)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IRcodeEvent {
    FunctionCreated(FunctionRef),
    FunctionRemoved(FunctionRef),
    FunctionDecompiled {
        function: FunctionRef,
        blocks: Vec<BlockRef>,
    },
    FunctionSignatureChanged {
        function: FunctionRef,
        old_param_vars: Vec<Option<ValueRef>>,
        old_return_var: Option<ValueRef>,
    },
    BlockCreated(BlockRef),
    BlockRemoved(BlockRef),
    OperationAdded(OperationRef),
    OperationRemoved(OperationRef),
}

/// The variables live at one base address, most recently written first.
#[derive(Clone, Debug, Default)]
pub struct MemorySubspace {
    pub variables: VecDeque<ValueRef>,
    /// Variables only visible from within the block
    pub block_scoped: UnorderedSet<ValueRef>,
}

#[derive(Clone, Debug, Default)]
pub struct MemorySpace {
    subspaces: BTreeMap<Hash, MemorySubspace>,
}

impl MemorySpace {
    pub fn subspace(&self, base_addr_hash: Hash) -> Option<&MemorySubspace> {
        self.subspaces.get(&base_addr_hash)
    }

    pub fn subspace_mut(&mut self, base_addr_hash: Hash) -> &mut MemorySubspace {
        self.subspaces.entry(base_addr_hash).or_default()
    }

    pub fn clear(&mut self) {
        self.subspaces.clear()
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub function: FunctionRef,
    /// Live operations, in generation order
    pub operations: Vec<OperationRef>,
    pub memory: MemorySpace,
    /// Value a terminating CBRANCH jumps on
    pub condition: Option<ValueRef>,
    pub removed: bool,
}

#[derive(Clone, Debug)]
pub struct Function {
    /// Index of the p-code function graph
    pub graph: usize,
    pub entry: BlockRef,
    /// Blocks, sorted by level and offset
    pub blocks: Vec<BlockRef>,
    pub signature: FunctionSignature,
    pub param_vars: Vec<Option<ValueRef>>,
    pub return_var: Option<ValueRef>,
    pub next_var_id: usize,
    pub removed: bool,
}

/// The IR-code of a whole program.
#[derive(Debug)]
pub struct Program {
    pub graph: pcode::Graph,
    pub calling_convention: Box<dyn CallingConvention>,
    values: Vec<Value>,
    operations: Vec<Operation>,
    blocks: BTreeMap<BlockRef, Block>,
    functions: Vec<Function>,
    /// Events produced by mutations, to be sent by the owner once it is safe to do so
    pub pending_events: Vec<IRcodeEvent>,
}

impl Program {
    pub fn new(graph: pcode::Graph, calling_convention: Box<dyn CallingConvention>) -> Self {
        let mut res = Self {
            graph,
            calling_convention,
            values: vec![],
            operations: vec![],
            blocks: Default::default(),
            functions: vec![],
            pending_events: vec![],
        };
        res.sync_graph();
        res
    }

    /// Create the IR functions and blocks of p-code function graphs which do not have any yet.
    pub fn sync_graph(&mut self) {
        for graph_idx in self.functions.len()..self.graph.functions.len() {
            let function = FunctionRef(self.functions.len());
            let fgraph = &self.graph.functions[graph_idx];
            let blocks = fgraph.blocks.clone();
            self.functions.push(Function {
                graph: graph_idx,
                entry: fgraph.entry,
                blocks: blocks.clone(),
                signature: FunctionSignature::empty(self.calling_convention.as_ref()),
                param_vars: vec![],
                return_var: None,
                next_var_id: 1,
                removed: false,
            });
            trace!("Function created"; "function" => self.function_name(function));
            self.pending_events
                .push(IRcodeEvent::FunctionCreated(function));
            for block in blocks {
                self.blocks.insert(
                    block,
                    Block {
                        function,
                        operations: vec![],
                        memory: Default::default(),
                        condition: None,
                        removed: false,
                    },
                );
                self.pending_events.push(IRcodeEvent::BlockCreated(block));
            }
        }
    }

    pub fn value(&self, value: ValueRef) -> &Value {
        &self.values[value.0]
    }

    pub fn value_mut(&mut self, value: ValueRef) -> &mut Value {
        &mut self.values[value.0]
    }

    pub fn operation(&self, op: OperationRef) -> &Operation {
        &self.operations[op.0]
    }

    pub fn block(&self, block: BlockRef) -> &Block {
        &self.blocks[&block]
    }

    pub fn block_mut(&mut self, block: BlockRef) -> &mut Block {
        self.blocks
            .get_mut(&block)
            .unwrap_or_else(|| panic!("no IR block for {:?}", block))
    }

    pub fn pcode_block(&self, block: BlockRef) -> &pcode::Block {
        self.graph.block(block)
    }

    pub fn block_name(&self, block: BlockRef) -> String {
        self.graph.block(block).name()
    }

    pub fn function(&self, function: FunctionRef) -> &Function {
        &self.functions[function.0]
    }

    pub fn function_mut(&mut self, function: FunctionRef) -> &mut Function {
        &mut self.functions[function.0]
    }

    /// The live functions
    pub fn functions(&self) -> impl Iterator<Item = FunctionRef> + '_ {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.removed)
            .map(|(i, _)| FunctionRef(i))
    }

    pub fn function_entry_offset(&self, function: FunctionRef) -> InstructionOffset {
        self.graph.block(self.function(function).entry).min_offset()
    }

    pub fn function_name(&self, function: FunctionRef) -> String {
        format!(
            "function_{:x}",
            self.function_entry_offset(function).byte_offset
        )
    }

    /// The function whose entry is at `offset`
    pub fn function_at(&self, offset: InstructionOffset) -> Option<FunctionRef> {
        let graph_idx = self.graph.function_at(offset)?;
        self.functions()
            .find(|f| self.function(*f).graph == graph_idx)
    }

    /// The number of values made so far, a mark for [`Self::discard_values_from`]
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Forget the values made since `mark`. Nothing may refer to them.
    pub fn discard_values_from(&mut self, mark: usize) {
        debug_assert!(self.values[mark..].iter().all(|v| v.uses.is_empty()));
        self.values.truncate(mark);
    }

    pub fn add_value(&mut self, kind: ValueKind, hash: Hash) -> ValueRef {
        let r = ValueRef(self.values.len());
        self.values.push(Value {
            kind,
            hash,
            linear_expr: LinearExpression::term(r, hash),
            uses: vec![],
        });
        r
    }

    /// Append `op` to its block. The output variable gets `op` as its source, unless it already
    /// has one.
    pub fn add_operation(&mut self, op: Operation) -> OperationRef {
        let r = OperationRef(self.operations.len());
        for input in op.inputs() {
            let uses = &mut self.values[input.0].uses;
            if !uses.contains(&r) {
                uses.push(r);
            }
        }
        if let ValueKind::Variable { source, .. } = &mut self.values[op.output.0].kind {
            if source.is_none() {
                *source = Some(r);
            }
        }
        let block = op.block;
        self.operations.push(op);
        self.block_mut(block).operations.push(r);
        self.pending_events.push(IRcodeEvent::OperationAdded(r));
        r
    }

    pub fn remove_operation(&mut self, op: OperationRef) {
        if self.operations[op.0].removed {
            return;
        }
        self.operations[op.0].removed = true;
        for input in self.operations[op.0].inputs() {
            self.values[input.0].uses.retain(|o| *o != op);
        }
        let block = self.operations[op.0].block;
        self.block_mut(block).operations.retain(|o| *o != op);
        self.pending_events.push(IRcodeEvent::OperationRemoved(op));
    }

    /// Drop the operations and memory of a block (before generating it again)
    pub fn clear_block(&mut self, block: BlockRef) {
        let ops: Vec<OperationRef> = self.block(block).operations.iter().rev().copied().collect();
        for op in ops {
            self.remove_operation(op);
        }
        let b = self.block_mut(block);
        b.memory.clear();
        b.condition = None;
    }

    pub fn remove_block(&mut self, block: BlockRef) {
        if self.block(block).removed {
            return;
        }
        self.clear_block(block);
        self.block_mut(block).removed = true;
        let function = self.block(block).function;
        self.function_mut(function).blocks.retain(|b| *b != block);
        self.pending_events.push(IRcodeEvent::BlockRemoved(block));
    }

    pub fn remove_function(&mut self, function: FunctionRef) {
        if self.function(function).removed {
            return;
        }
        for block in self.function(function).blocks.clone() {
            self.remove_block(block);
        }
        self.function_mut(function).removed = true;
        self.pending_events
            .push(IRcodeEvent::FunctionRemoved(function));
    }

    /// The function a variable was generated in
    pub fn function_of_value(&self, value: ValueRef) -> Option<FunctionRef> {
        let op = self.value(value).source()?;
        Some(self.block(self.operation(op).block).function)
    }

    /// `varN`
    pub fn variable_name(&self, value: ValueRef) -> String {
        match &self.value(value).kind {
            ValueKind::Variable { id, .. } => format!("var{}", id),
            ValueKind::Register { register } => register.name(),
            ValueKind::Constant { value, .. } => format!("{:#x}", value),
        }
    }

    /// `B<hex offset of the function's entry block>:varN`
    pub fn full_variable_name(&self, value: ValueRef) -> String {
        match self.function_of_value(value) {
            Some(f) => format!(
                "{}:{}",
                self.block_name(self.function(f).entry),
                self.variable_name(value)
            ),
            None => self.variable_name(value),
        }
    }

    /// The outputs of the live operations of a function, in block order
    pub fn function_variables(&self, function: FunctionRef) -> Vec<ValueRef> {
        let mut res = vec![];
        for block in &self.function(function).blocks {
            for op in &self.block(*block).operations {
                let output = self.operation(*op).output;
                if !res.contains(&output) {
                    res.push(output);
                }
            }
        }
        res
    }

    /// The live CALL operations whose destination is the entry of `function`
    pub fn call_operations_to(&self, function: FunctionRef) -> Vec<OperationRef> {
        let entry = self.function_entry_offset(function);
        self.functions()
            .flat_map(|f| self.function(f).blocks.iter())
            .flat_map(|b| self.block(*b).operations.iter().copied())
            .filter(|op| {
                let op = self.operation(*op);
                match &op.kind {
                    OperationKind::Call { destination, .. } => {
                        self.value(*destination).constant().map(InstructionOffset::from_full)
                            == Some(entry)
                    }
                    _ => false,
                }
            })
            .collect()
    }

    pub fn set_signature(&mut self, function: FunctionRef, signature: FunctionSignature) {
        let f = self.function_mut(function);
        f.param_vars = vec![None; signature.parameters.len()];
        f.return_var = None;
        f.signature = signature;
    }

    pub fn take_events(&mut self) -> Vec<IRcodeEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

/// Follow COPY chains (and REF ones, if `go_through_ref`) and return the linear expression of the
/// value found at the end.
pub fn get_linear_expr(program: &Program, value: ValueRef, go_through_ref: bool) -> LinearExpression {
    let mut value = value;
    while let Some(op) = program.value(value).source() {
        let op = program.operation(op);
        match (&op.kind, op.id) {
            (OperationKind::Unary { input }, OperationId::Copy) => value = *input,
            (OperationKind::Ref { input, .. }, _) if go_through_ref => value = *input,
            _ => break,
        }
    }
    program.value(value).linear_expr.clone()
}

/// The terms of `expr` that can be a base address: unit factor, pointer sized.
pub fn to_base_terms(program: &Program, expr: &LinearExpression, pointer_size: usize) -> Vec<ValueRef> {
    expr.terms()
        .iter()
        .filter(|t| t.factor == 1 && program.value(t.value).size() == pointer_size)
        .map(|t| t.value)
        .collect()
}

/// The register a value was (directly, or through COPY/REF/LOAD) read from.
pub fn extract_register(program: &Program, value: ValueRef) -> Option<pcode::Register> {
    let mut value = value;
    loop {
        let v = program.value(value);
        if let Some(reg) = v.register() {
            return Some(*reg);
        }
        let op = program.operation(v.source()?);
        match op.id {
            OperationId::Copy | OperationId::Ref | OperationId::Load => {
                value = op.unary_input()?;
            }
            _ => return None,
        }
    }
}

/// The address a value was loaded from, looking through COPY and REF.
pub fn extract_address_value(program: &Program, value: ValueRef) -> Option<ValueRef> {
    let mut value = value;
    loop {
        let op = program.operation(program.value(value).source()?);
        match op.id {
            OperationId::Copy | OperationId::Ref => value = op.unary_input()?,
            OperationId::Load => return op.unary_input(),
            _ => return None,
        }
    }
}

/// The constant a value is a copy of, if any.
pub fn extract_constant(program: &Program, value: ValueRef) -> Option<u64> {
    let mut value = value;
    loop {
        let v = program.value(value);
        if let Some(c) = v.constant() {
            return Some(c);
        }
        let op = program.operation(v.source()?);
        match op.id {
            OperationId::Copy | OperationId::Ref => value = op.unary_input()?,
            _ => return None,
        }
    }
}
