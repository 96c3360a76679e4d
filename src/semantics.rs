//! Semantics of variables: what the code says about the values they hold (a data type, being the
//! parameter or return value of some function, pointing into a symbol table, ...). Facts flow along
//! the operations and along the data flow between functions until nothing new is learned.

use crate::calling_convention::ScalarType;
use crate::config::CONFIG;
use crate::dataflow::{DataFlowNodeType, DataFlowRepository};
use crate::events::{Event, EventPipe};
use crate::ircode::{
    extract_register, get_linear_expr, to_base_terms, FunctionRef, IRcodeEvent, OperationId,
    OperationKind, OperationRef, Program, ValueRef,
};
use crate::log::*;
use crate::researcher::ResearcherPropagationContext;
use itertools::Itertools;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum DataType {
    Bool,
    Int { size: usize, signed: bool },
    Float { size: usize },
}

impl From<ScalarType> for DataType {
    fn from(ty: ScalarType) -> Self {
        if ty.is_float {
            DataType::Float { size: ty.size }
        } else {
            DataType::Int {
                size: ty.size,
                signed: false,
            }
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int { size, signed: true } => write!(f, "int{}_t", size * 8),
            DataType::Int { size, signed: false } => write!(f, "uint{}_t", size * 8),
            DataType::Float { size } => ScalarType::float(*size).fmt(f),
        }
    }
}

/// The table a symbol pointer points into
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum SymbolTable {
    /// Addressed relative to the instruction pointer
    Global,
    /// The stack frame of a function
    Stack(FunctionRef),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Semantics {
    DataType(DataType),
    FunctionParameter { function: FunctionRef, index: usize },
    FunctionReturn { function: FunctionRef },
    /// The value is the address of the symbol at `offset` in `table`
    SymbolPointer { table: SymbolTable, offset: u64 },
    /// The value was loaded from (or stored to) the symbol at `offset` in `table`
    Symbol {
        table: SymbolTable,
        offset: u64,
        size: usize,
    },
}

impl Semantics {
    pub fn describe(&self, program: &Program) -> String {
        let table_name = |table: &SymbolTable| match table {
            SymbolTable::Global => "global".to_string(),
            SymbolTable::Stack(f) => format!("stack of {}", program.function_name(*f)),
        };
        match self {
            Semantics::DataType(ty) => ty.to_string(),
            Semantics::FunctionParameter { function, index } => {
                format!("param {} of {}", index + 1, program.function_name(*function))
            }
            Semantics::FunctionReturn { function } => {
                format!("return of {}", program.function_name(*function))
            }
            Semantics::SymbolPointer { table, offset } => {
                format!("pointer to {:#x} ({})", offset, table_name(table))
            }
            Semantics::Symbol {
                table,
                offset,
                size,
            } => format!("symbol {:#x}:{} ({})", offset, size, table_name(table)),
        }
    }
}

/// The facts known about each variable
#[derive(Debug, Default)]
pub struct SemanticsRepository {
    facts: BTreeMap<ValueRef, BTreeSet<Semantics>>,
}

impl SemanticsRepository {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn semantics(&self, value: ValueRef) -> impl Iterator<Item = &Semantics> + '_ {
        self.facts.get(&value).into_iter().flatten()
    }

    pub fn data_types(&self, value: ValueRef) -> Vec<DataType> {
        self.semantics(value)
            .filter_map(|s| match s {
                Semantics::DataType(ty) => Some(*ty),
                _ => None,
            })
            .collect()
    }

    /// Returns whether `semantics` is new to `value`
    pub fn add(&mut self, value: ValueRef, semantics: Semantics) -> bool {
        self.facts.entry(value).or_default().insert(semantics)
    }

    pub fn remove_value(&mut self, value: ValueRef) {
        self.facts.remove(&value);
    }
}

/// Propagates semantics through the operations of decompiled functions.
pub struct SemanticsResearcher {
    program: Rc<RefCell<Program>>,
    repo: Rc<RefCell<SemanticsRepository>>,
    dataflow: Rc<RefCell<DataFlowRepository>>,
}

impl SemanticsResearcher {
    pub fn new(
        program: Rc<RefCell<Program>>,
        repo: Rc<RefCell<SemanticsRepository>>,
        dataflow: Rc<RefCell<DataFlowRepository>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            program,
            repo,
            dataflow,
        })
    }

    /// The pipe to send IR-code events to. It expects parameter variables and the data flow to
    /// be up to date, so it goes after their pipes.
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
        let program = self.program.borrow();
        let mut ctx = ResearcherPropagationContext::new();
        match event {
            IRcodeEvent::FunctionDecompiled { blocks, .. } => {
                for block in blocks {
                    for op in &program.block(*block).operations {
                        ctx.add_next_operation(&program, *op);
                    }
                }
            }
            IRcodeEvent::FunctionSignatureChanged { function, .. } => {
                let f = program.function(*function);
                for var in f.param_vars.iter().flatten().chain(f.return_var.iter()) {
                    ctx.mark_value_as_affected(&program, *var);
                }
            }
            IRcodeEvent::OperationRemoved(op) => {
                self.repo
                    .borrow_mut()
                    .remove_value(program.operation(*op).output);
                return;
            }
            _ => return,
        }
        let dataflow = self.dataflow.borrow();
        let mut repo = self.repo.borrow_mut();
        let mut propagator = Propagator {
            program: &program,
            dataflow: &dataflow,
            repo: &mut repo,
        };
        ctx.collect(|ctx, op| propagator.research(ctx, op));
    }
}

struct Propagator<'a> {
    program: &'a Program,
    dataflow: &'a DataFlowRepository,
    repo: &'a mut SemanticsRepository,
}

impl<'a> Propagator<'a> {
    /// Give `value` a new fact. Readers of the value, and variables of other functions it flows
    /// into, get researched again.
    fn add(&mut self, ctx: &mut ResearcherPropagationContext, value: ValueRef, semantics: Semantics) {
        if !self.program.value(value).is_variable() || !self.repo.add(value, semantics) {
            return;
        }
        trace!("Semantics added";
            "variable" => self.program.full_variable_name(value),
            "semantics" => semantics.describe(self.program));
        ctx.mark_value_as_affected(self.program, value);
        let node = match self.dataflow.get_node(value) {
            Some(node) => node,
            None => return,
        };
        for succ in &self.dataflow.node(node).successors {
            let succ = self.dataflow.node(*succ);
            if succ.node_type != DataFlowNodeType::Copy {
                continue;
            }
            if let Some(source) = succ.value.and_then(|v| self.program.value(v).source()) {
                if !self.program.operation(source).removed {
                    ctx.add_next_operation(self.program, source);
                }
            }
        }
    }

    fn add_data_type(
        &mut self,
        ctx: &mut ResearcherPropagationContext,
        value: ValueRef,
        data_type: DataType,
    ) {
        self.add(ctx, value, Semantics::DataType(data_type));
    }

    fn copy_all(&mut self, ctx: &mut ResearcherPropagationContext, from: ValueRef, to: ValueRef) {
        let facts = self.repo.semantics(from).copied().collect_vec();
        for s in facts {
            self.add(ctx, to, s);
        }
    }

    /// The symbol tables a base term is the start of
    fn symbol_table(&self, function: FunctionRef, base: ValueRef) -> Option<SymbolTable> {
        let reg = extract_register(self.program, base)?;
        if reg.is_instruction_pointer() {
            Some(SymbolTable::Global)
        } else if reg.is_stack_pointer() {
            Some(SymbolTable::Stack(function))
        } else {
            None
        }
    }

    /// A value read from or written to `address` is the symbol `address` points to.
    fn research_address(
        &mut self,
        ctx: &mut ResearcherPropagationContext,
        address: ValueRef,
        value: ValueRef,
    ) {
        let size = self.program.value(value).size();
        let symbols = self
            .repo
            .semantics(address)
            .filter_map(|s| match s {
                Semantics::SymbolPointer { table, offset } => Some(Semantics::Symbol {
                    table: *table,
                    offset: *offset,
                    size,
                }),
                _ => None,
            })
            .collect_vec();
        for s in symbols {
            self.add(ctx, value, s);
        }
    }

    fn research(&mut self, ctx: &mut ResearcherPropagationContext, op: OperationRef) {
        let program = self.program;
        let operation = program.operation(op);
        let function = program.block(operation.block).function;
        let output = operation.output;
        let inputs = operation.inputs();

        let f = program.function(function);
        if let Some(idx) = f.param_vars.iter().position(|v| *v == Some(output)) {
            if let Some(param) = f.signature.parameters.get(idx) {
                self.add_data_type(ctx, output, param.ty.into());
            }
            self.add(
                ctx,
                output,
                Semantics::FunctionParameter {
                    function,
                    index: idx,
                },
            );
        }
        if f.return_var == Some(output) {
            if let Some(ty) = f.signature.return_type {
                self.add_data_type(ctx, output, ty.into());
            }
            self.add(ctx, output, Semantics::FunctionReturn { function });
        }

        match operation.id {
            OperationId::Copy | OperationId::Load => {
                // Values copied in from other functions bring their facts along
                if let Some(node) = self.dataflow.get_node(output) {
                    let preds = self.dataflow.node(node).predecessors.clone();
                    if self.dataflow.node(node).node_type == DataFlowNodeType::Copy {
                        for pred in preds {
                            if let Some(v) = self.dataflow.node(pred).value {
                                self.copy_all(ctx, v, output);
                            }
                        }
                    }
                }
                let input = match operation.unary_input() {
                    Some(input) => input,
                    None => return,
                };
                if operation.id == OperationId::Load {
                    if let Some(table) = program
                        .value(input)
                        .register()
                        .and_then(|_| self.symbol_table(function, input))
                    {
                        self.add(ctx, output, Semantics::SymbolPointer { table, offset: 0 });
                    } else if program.value(input).is_variable() {
                        self.research_address(ctx, input, output);
                    }
                } else {
                    if program.value(input).is_variable() {
                        self.copy_all(ctx, input, output);
                    }
                    if let Some(addr) = program.value(output).mem_address().and_then(|a| a.value) {
                        if program.value(addr).is_variable() {
                            self.research_address(ctx, addr, output);
                        }
                    }
                }
            }
            OperationId::IntAdd | OperationId::IntMult => {
                let expr = get_linear_expr(program, output, false);
                for base in to_base_terms(program, &expr, CONFIG.pointer_size) {
                    if let Some(table) = self.symbol_table(function, base) {
                        let offset = expr.const_term_value();
                        self.add(ctx, output, Semantics::SymbolPointer { table, offset });
                    }
                }
                self.research_arithmetic(ctx, &inputs, output);
            }
            OperationId::IntSub | OperationId::IntDiv | OperationId::IntRem => {
                self.research_arithmetic(ctx, &inputs, output);
            }
            OperationId::Int2Comp | OperationId::IntSDiv | OperationId::IntSRem => {
                let size = program.value(output).size();
                self.add_data_type(ctx, output, DataType::Int { size, signed: true });
            }
            OperationId::IntEqual
            | OperationId::IntNotEqual
            | OperationId::IntLess
            | OperationId::IntLessEqual
            | OperationId::IntSLess
            | OperationId::IntSLessEqual
            | OperationId::IntCarry
            | OperationId::IntSCarry
            | OperationId::IntSBorrow => {
                self.add_data_type(ctx, output, DataType::Bool);
            }
            OperationId::BoolNegate
            | OperationId::BoolAnd
            | OperationId::BoolOr
            | OperationId::BoolXor => {
                for v in inputs.iter().copied().chain(std::iter::once(output)) {
                    self.add_data_type(ctx, v, DataType::Bool);
                }
            }
            OperationId::FloatEqual
            | OperationId::FloatNotEqual
            | OperationId::FloatLess
            | OperationId::FloatLessEqual => {
                for v in &inputs {
                    let size = program.value(*v).size();
                    self.add_data_type(ctx, *v, DataType::Float { size });
                }
                self.add_data_type(ctx, output, DataType::Bool);
            }
            OperationId::FloatAdd
            | OperationId::FloatSub
            | OperationId::FloatMult
            | OperationId::FloatDiv
            | OperationId::FloatNeg
            | OperationId::FloatAbs
            | OperationId::FloatSqrt => {
                for v in inputs.iter().copied().chain(std::iter::once(output)) {
                    let size = program.value(v).size();
                    self.add_data_type(ctx, v, DataType::Float { size });
                }
            }
            OperationId::Phi => {
                for input in inputs {
                    self.copy_all(ctx, input, output);
                }
            }
            OperationId::Call => self.research_call(ctx, op),
            _ => {}
        }
    }

    /// Signedness carries over from the inputs of integer arithmetic to its result.
    fn research_arithmetic(
        &mut self,
        ctx: &mut ResearcherPropagationContext,
        inputs: &[ValueRef],
        output: ValueRef,
    ) {
        let size = self.program.value(output).size();
        let signed = inputs.iter().any(|v| {
            self.repo
                .data_types(*v)
                .contains(&DataType::Int { size, signed: true })
        });
        if signed {
            self.add_data_type(ctx, output, DataType::Int { size, signed: true });
        }
    }

    /// Arguments get the types of the callee's parameters, the result the type of its return
    /// value.
    fn research_call(&mut self, ctx: &mut ResearcherPropagationContext, op: OperationRef) {
        let program = self.program;
        let operation = program.operation(op);
        let (destination, arguments) = match &operation.kind {
            OperationKind::Call {
                destination,
                arguments,
            } => (*destination, arguments),
            _ => return,
        };
        let callee = match program
            .value(destination)
            .constant()
            .and_then(|c| program.function_at(crate::pcode::InstructionOffset::from_full(c)))
        {
            Some(f) => f,
            None => return,
        };
        let signature = &program.function(callee).signature;
        for (index, (arg, param)) in arguments.iter().zip(&signature.parameters).enumerate() {
            self.add_data_type(ctx, *arg, param.ty.into());
            self.add(
                ctx,
                *arg,
                Semantics::FunctionParameter {
                    function: callee,
                    index,
                },
            );
        }
        if let Some(ty) = signature.return_type {
            let output = operation.output;
            self.add_data_type(ctx, output, ty.into());
            self.add(ctx, output, Semantics::FunctionReturn { function: callee });
        }
    }
}

/// One line per variable of `function` with any known semantics: `var3: uint32_t, param 1 of
/// function_0`.
pub fn print_semantics(
    program: &Program,
    repo: &SemanticsRepository,
    function: FunctionRef,
) -> String {
    program
        .function_variables(function)
        .into_iter()
        .filter_map(|var| {
            let facts = repo.semantics(var).map(|s| s.describe(program)).collect_vec();
            if facts.is_empty() {
                None
            } else {
                Some(format!("{}: {}", program.variable_name(var), facts.join(", ")))
            }
        })
        .join("\n")
}
