//! Function signatures: which variables are the parameters and the return value of a function, and
//! what signature the code of a function suggests.

use crate::calling_convention::{
    FunctionSignature, Parameter, ScalarType, Storage, StorageInfo, StorageKind, UseType,
};
use crate::config::CONFIG;
use crate::containers::InsertionOrderedSet;
use crate::events::{Event, EventPipe};
use crate::ircode::{
    extract_register, get_linear_expr, FunctionRef, IRcodeEvent, OperationId, OperationRef,
    Program, ValueKind, ValueRef,
};
use crate::log::*;
use crate::researcher::ResearcherPropagationContext;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

/// The storage `value` refers to, when used with `use_type`: a register, or a location relative to
/// the stack (or instruction) pointer.
fn value_storage(program: &Program, value: ValueRef, use_type: UseType) -> Option<Storage> {
    let v = program.value(value);
    match &v.kind {
        ValueKind::Register { register } => Some(Storage::register(use_type, register.id)),
        ValueKind::Variable { .. } => {
            let expr = get_linear_expr(program, value, true);
            let term = expr.terms().iter().find(|t| {
                t.factor == 1 && program.value(t.value).size() == CONFIG.pointer_size
            })?;
            let base = extract_register(program, term.value)?;
            (base.is_stack_pointer() || base.is_instruction_pointer()).then(|| Storage {
                use_type,
                register_id: base.id,
                offset: expr.const_term_value(),
            })
        }
        ValueKind::Constant { .. } => None,
    }
}

/// The storages an operation touches: what a LOAD reads, and where an output nobody reads goes
/// (which only matters once the function returns).
fn operation_storages(program: &Program, op: OperationRef) -> Vec<Storage> {
    let operation = program.operation(op);
    let mut res = vec![];
    if operation.id == OperationId::Load {
        if let Some(input) = operation.unary_input() {
            res.extend(value_storage(program, input, UseType::Read));
        }
    }
    let output = program.value(operation.output);
    if !output.is_used() {
        if let Some(addr) = output.mem_address().and_then(|a| a.value) {
            res.extend(value_storage(program, addr, UseType::Write));
        }
    }
    res
}

/// Find the parameter and return variables of `function` according to its current signature.
pub fn map_signature_variables(program: &mut Program, function: FunctionRef) {
    let mut ctx = ResearcherPropagationContext::new();
    for block in program.function(function).blocks.clone() {
        for op in program.block(block).operations.clone() {
            ctx.add_next_operation(program, op);
        }
    }
    let param_count = program.function(function).signature.parameters.len();
    let mut param_vars = vec![None; param_count];
    let mut return_var = None;
    ctx.collect(|_, op| {
        let signature = &program.function(function).signature;
        for storage in operation_storages(program, op) {
            let info = match signature.find_storage_info(&storage) {
                Some(info) => info,
                None => continue,
            };
            let output = program.operation(op).output;
            match info.kind {
                StorageKind::Return => return_var = Some(output),
                StorageKind::Parameter => {
                    if let Some(var) = param_vars.get_mut(info.param_idx) {
                        *var = Some(output);
                    }
                }
            }
        }
    });
    let f = program.function_mut(function);
    f.param_vars = param_vars;
    f.return_var = return_var;
}

/// Keeps the parameter and return variables of functions in sync with their code. Its pipe must be
/// connected ahead of anything relying on those variables.
pub struct SignatureVariableMapper {
    program: Rc<RefCell<Program>>,
}

impl SignatureVariableMapper {
    pub fn new(program: Rc<RefCell<Program>>) -> Rc<Self> {
        Rc::new(Self { program })
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
        let mut program = self.program.borrow_mut();
        match event {
            IRcodeEvent::FunctionDecompiled { function, .. } => {
                map_signature_variables(&mut program, *function);
            }
            IRcodeEvent::OperationRemoved(op) => {
                let output = program.operation(*op).output;
                let function = program.block(program.operation(*op).block).function;
                let f = program.function_mut(function);
                if f.return_var == Some(output) {
                    f.return_var = None;
                }
                for var in f.param_vars.iter_mut() {
                    if *var == Some(output) {
                        *var = None;
                    }
                }
            }
            _ => {}
        }
    }
}

/// A storage used by a function, along with the variables seen using it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureStorage {
    pub info: StorageInfo,
    pub variables: Vec<ValueRef>,
}

/// The storages a function was seen to use, in the order they were found
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResearchedSignature {
    pub storages: Vec<SignatureStorage>,
}

impl ResearchedSignature {
    fn scalar_type(program: &Program, storage: &SignatureStorage) -> ScalarType {
        let size = storage
            .variables
            .iter()
            .map(|v| program.value(*v).size())
            .max()
            .unwrap_or(0);
        ScalarType {
            size,
            is_float: storage.info.is_float,
        }
    }

    /// The signature described by the storages. Parameters nobody was seen to use get a 1-byte
    /// placeholder, so that the used ones keep their position.
    pub fn to_signature(&self, program: &Program) -> FunctionSignature {
        let params: BTreeMap<usize, &SignatureStorage> = self
            .storages
            .iter()
            .filter(|s| s.info.kind == StorageKind::Parameter)
            .map(|s| (s.info.param_idx, s))
            .collect();
        let mut parameters = vec![];
        for (param_idx, storage) in params {
            while parameters.len() < param_idx {
                parameters.push(Parameter {
                    name: format!("unk_param{}", parameters.len() + 1),
                    ty: ScalarType::int(1),
                });
            }
            parameters.push(Parameter {
                name: format!("param{}", param_idx + 1),
                ty: Self::scalar_type(program, storage),
            });
        }
        let return_type = self
            .storages
            .iter()
            .find(|s| s.info.kind == StorageKind::Return)
            .map(|s| Self::scalar_type(program, s));
        FunctionSignature::new(program.calling_convention.as_ref(), parameters, return_type)
    }
}

#[derive(Debug, Default)]
pub struct SignatureRepository {
    signatures: BTreeMap<FunctionRef, ResearchedSignature>,
}

impl SignatureRepository {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn signature(&self, function: FunctionRef) -> Option<&ResearchedSignature> {
        self.signatures.get(&function)
    }

    pub fn add_storage_info(&mut self, function: FunctionRef, info: StorageInfo, variable: ValueRef) {
        let signature = self.signatures.entry(function).or_default();
        let idx = match signature.storages.iter().position(|s| s.info == info) {
            Some(idx) => idx,
            None => {
                signature.storages.push(SignatureStorage {
                    info,
                    variables: vec![],
                });
                signature.storages.len() - 1
            }
        };
        let variables = &mut signature.storages[idx].variables;
        if !variables.contains(&variable) {
            variables.push(variable);
        }
    }

    /// Forget `variable`, and the storages only it was seen using
    pub fn remove_variable(&mut self, function: FunctionRef, variable: ValueRef) {
        if let Some(signature) = self.signatures.get_mut(&function) {
            for storage in signature.storages.iter_mut() {
                storage.variables.retain(|v| *v != variable);
            }
            signature.storages.retain(|s| !s.variables.is_empty());
        }
    }

    pub fn remove_function(&mut self, function: FunctionRef) {
        self.signatures.remove(&function);
    }
}

/// Researches the signatures of decompiled functions. Signatures differing from the current one of
/// their function are queued; applying them is up to the owner, since it means re-decompiling the
/// callers.
pub struct SignatureResearcher {
    program: Rc<RefCell<Program>>,
    repo: Rc<RefCell<SignatureRepository>>,
    changed: RefCell<InsertionOrderedSet<FunctionRef>>,
}

impl SignatureResearcher {
    pub fn new(program: Rc<RefCell<Program>>, repo: Rc<RefCell<SignatureRepository>>) -> Rc<Self> {
        Rc::new(Self {
            program,
            repo,
            changed: RefCell::new(InsertionOrderedSet::new()),
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
        let program = self.program.borrow();
        let mut repo = self.repo.borrow_mut();
        match event {
            IRcodeEvent::FunctionDecompiled { function, blocks } => {
                let mut ctx = ResearcherPropagationContext::new();
                for block in blocks {
                    for op in &program.block(*block).operations {
                        ctx.add_next_operation(&program, *op);
                    }
                }
                ctx.collect(|_, op| {
                    let function = program.block(program.operation(op).block).function;
                    let output = program.operation(op).output;
                    for storage in operation_storages(&program, op) {
                        if let Some(info) = program.calling_convention.storage_info(&storage) {
                            repo.add_storage_info(function, info, output);
                        }
                    }
                });
                let signature = repo
                    .signature(*function)
                    .map(|s| s.to_signature(&program))
                    .unwrap_or_else(|| FunctionSignature::empty(program.calling_convention.as_ref()));
                if signature != program.function(*function).signature {
                    debug!("Signature researched";
                        "function" => program.function_name(*function),
                        "params" => signature.parameters.len(),
                        OptionalKV("return", signature.return_type.map(|t| t.to_string())));
                    self.changed.borrow_mut().insert(*function);
                } else {
                    self.changed.borrow_mut().remove(function);
                }
            }
            IRcodeEvent::OperationRemoved(op) => {
                let function = program.block(program.operation(*op).block).function;
                repo.remove_variable(function, program.operation(*op).output);
            }
            IRcodeEvent::FunctionRemoved(function) => {
                repo.remove_function(*function);
                self.changed.borrow_mut().remove(function);
            }
            _ => {}
        }
    }

    /// The researched signatures differing from the current ones, oldest first. The queue is
    /// emptied.
    pub fn take_changed_signatures(&self) -> Vec<(FunctionRef, FunctionSignature)> {
        let changed = std::mem::take(&mut *self.changed.borrow_mut());
        let program = self.program.borrow();
        let repo = self.repo.borrow();
        changed
            .into_vec()
            .into_iter()
            .filter(|f| !program.function(*f).removed)
            .map(|f| {
                let signature = repo
                    .signature(f)
                    .map(|s| s.to_signature(&program))
                    .unwrap_or_else(|| FunctionSignature::empty(program.calling_convention.as_ref()));
                (f, signature)
            })
            .filter(|(f, s)| *s != program.function(*f).signature)
            .collect()
    }
}
