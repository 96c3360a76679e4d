//! A decompilation session: the IR program of a p-code graph, the event pipe, and every repository
//! and researcher listening to it.

use crate::calling_convention::{FastcallCallingConvention, FunctionSignature};
use crate::config::CONFIG;
use crate::const_condition::{print_conditions, ConstConditionRepository};
use crate::dataflow::{generate_dot, print_data_flow_for_function, DataFlowCollector, DataFlowRepository};
use crate::events::{CommitScope, Event, EventPipe};
use crate::generator::decompile_function;
use crate::ircode::{FunctionRef, Program};
use crate::log::*;
use crate::pcode::{BlockRef, Graph, InstructionOffset};
use crate::pcode_parser::{parse_listing, ParseError};
use crate::printer::print_function;
use crate::semantics::{print_semantics, SemanticsRepository, SemanticsResearcher};
use crate::signature::{SignatureRepository, SignatureResearcher, SignatureVariableMapper};
use crate::structure::{
    log_structure_events, print_structures, structure_changes_pipe, StructureRepository,
    StructureResearcher,
};
use std::cell::RefCell;
use std::rc::Rc;

pub struct Session {
    pub program: Rc<RefCell<Program>>,
    pub pipe: EventPipe<Event>,
    pub dataflow: Rc<RefCell<DataFlowRepository>>,
    pub const_conditions: Rc<ConstConditionRepository>,
    pub structures: Rc<RefCell<StructureRepository>>,
    pub signatures: Rc<RefCell<SignatureRepository>>,
    pub semantics: Rc<RefCell<SemanticsRepository>>,
    /// Coalesced structure changes, sent once per outermost commit
    pub structure_changes: EventPipe<Event>,
    signature_researcher: Rc<SignatureResearcher>,
    // kept alive for the pipes, which only hold weak references
    _variable_mapper: Rc<SignatureVariableMapper>,
    _dataflow_collector: Rc<DataFlowCollector>,
    _structure_researcher: Rc<StructureResearcher>,
    _semantics_researcher: Rc<SemanticsResearcher>,
}

impl Session {
    /// A session over the functions of `graph`, none of them decompiled yet.
    pub fn new(graph: Graph) -> Self {
        let program = Rc::new(RefCell::new(Program::new(
            graph,
            Box::new(FastcallCallingConvention),
        )));
        let pipe = EventPipe::new();

        let variable_mapper = SignatureVariableMapper::new(program.clone());
        pipe.connect(variable_mapper.event_pipe());

        let const_conditions = ConstConditionRepository::new(program.clone());
        if CONFIG.enable_const_conditions {
            pipe.connect(const_conditions.event_pipe());
        }

        let dataflow = Rc::new(RefCell::new(DataFlowRepository::new()));
        let dataflow_collector =
            DataFlowCollector::new(program.clone(), dataflow.clone(), pipe.clone());
        pipe.connect(dataflow_collector.event_pipe());

        let structure_changes = pipe.connect(structure_changes_pipe());
        let structures = Rc::new(RefCell::new(StructureRepository::new()));
        log_structure_events(&structure_changes, structures.clone());
        let structure_researcher = StructureResearcher::new(
            program.clone(),
            structures.clone(),
            dataflow.clone(),
            const_conditions.clone(),
            pipe.clone(),
        );
        if CONFIG.enable_structure_research {
            pipe.connect(structure_researcher.event_pipe());
        }

        let signatures = Rc::new(RefCell::new(SignatureRepository::new()));
        let signature_researcher = SignatureResearcher::new(program.clone(), signatures.clone());
        if CONFIG.enable_signature_research {
            pipe.connect(signature_researcher.event_pipe());
        }

        let semantics = Rc::new(RefCell::new(SemanticsRepository::new()));
        let semantics_researcher =
            SemanticsResearcher::new(program.clone(), semantics.clone(), dataflow.clone());
        if CONFIG.enable_semantics_research {
            pipe.connect(semantics_researcher.event_pipe());
        }

        let session = Self {
            program,
            pipe,
            dataflow,
            const_conditions,
            structures,
            signatures,
            semantics,
            structure_changes,
            signature_researcher,
            _variable_mapper: variable_mapper,
            _dataflow_collector: dataflow_collector,
            _structure_researcher: structure_researcher,
            _semantics_researcher: semantics_researcher,
        };
        session.flush();
        session
    }

    /// A session over the functions reachable from `entries` (the first instruction if there are
    /// none) in a textual p-code listing.
    pub fn from_listing(listing: &str, entries: &[InstructionOffset]) -> Result<Self, ParseError> {
        let instructions = parse_listing(listing)?;
        let first = instructions.first().map(|i| i.offset);
        let mut graph = Graph::new(instructions);
        let entries = if entries.is_empty() {
            first.into_iter().collect()
        } else {
            entries.to_vec()
        };
        for entry in entries {
            if graph.explore(entry).is_empty() && graph.function_at(entry).is_none() {
                warn!("No function at entry"; "entry" => ?entry);
            }
        }
        Ok(Self::new(graph))
    }

    /// Send the events the program queued. Must not be called while the program is borrowed.
    fn flush(&self) {
        loop {
            let events = self.program.borrow_mut().take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.pipe.send(&Event::IRcode(event));
            }
        }
    }

    pub fn functions(&self) -> Vec<FunctionRef> {
        self.program.borrow().functions().collect()
    }

    /// The function whose entry is the instruction at `byte_offset`
    pub fn function_at(&self, byte_offset: u64) -> Option<FunctionRef> {
        self.program
            .borrow()
            .function_at(InstructionOffset::new(byte_offset, 0))
    }

    /// (Re-)generate the IR-code of one function
    pub fn decompile_function(&self, function: FunctionRef) {
        let _commit = CommitScope::new(&self.pipe);
        decompile_function(&mut self.program.borrow_mut(), function);
        self.flush();
    }

    /// Decompile every function, then apply the signatures researched along the way.
    pub fn decompile(&self) {
        {
            let _commit = CommitScope::new(&self.pipe);
            for function in self.functions() {
                decompile_function(&mut self.program.borrow_mut(), function);
                self.flush();
            }
        }
        if CONFIG.enable_signature_research {
            self.apply_researched_signatures();
        }
    }

    pub fn remove_block(&self, block: BlockRef) {
        let _commit = CommitScope::new(&self.pipe);
        self.program.borrow_mut().remove_block(block);
        self.flush();
    }

    /// Give `function` a new signature. Its parameter and return variables are looked up again,
    /// and its callers are decompiled again so that calls pass the right arguments.
    pub fn set_function_signature(&self, function: FunctionRef, signature: FunctionSignature) {
        let _commit = CommitScope::new(&self.pipe);
        let callers = {
            let mut program = self.program.borrow_mut();
            info!("Signature changed";
                "function" => program.function_name(function),
                "signature" => signature.to_string());
            let old_param_vars = program.function(function).param_vars.clone();
            let old_return_var = program.function(function).return_var;
            program.set_signature(function, signature);
            crate::signature::map_signature_variables(&mut program, function);
            program
                .pending_events
                .push(crate::ircode::IRcodeEvent::FunctionSignatureChanged {
                    function,
                    old_param_vars,
                    old_return_var,
                });
            let mut callers = vec![];
            for op in program.call_operations_to(function) {
                let caller = program.block(program.operation(op).block).function;
                if !callers.contains(&caller) {
                    callers.push(caller);
                }
            }
            callers
        };
        self.flush();
        for caller in callers {
            self.decompile_function(caller);
        }
    }

    /// Apply researched signatures until they settle (or the configured number of rounds is
    /// exhausted). Returns the number of signatures applied.
    pub fn apply_researched_signatures(&self) -> usize {
        let mut applied = 0;
        for _ in 0..CONFIG.max_signature_rounds {
            let changed = self.signature_researcher.take_changed_signatures();
            if changed.is_empty() {
                return applied;
            }
            let _commit = CommitScope::new(&self.pipe);
            for (function, signature) in changed {
                self.set_function_signature(function, signature);
                applied += 1;
            }
        }
        warn!("Signatures did not settle"; "rounds" => CONFIG.max_signature_rounds);
        applied
    }

    pub fn dump_ircode(&self, function: FunctionRef) -> String {
        print_function(&self.program.borrow(), function)
    }

    pub fn dump_data_flow(&self, function: FunctionRef) -> String {
        print_data_flow_for_function(&self.program.borrow(), &self.dataflow.borrow(), function)
    }

    pub fn dump_conditions(&self, function: FunctionRef) -> String {
        print_conditions(&self.program.borrow(), &self.const_conditions, function)
    }

    pub fn dump_structures(&self) -> String {
        print_structures(&self.structures.borrow())
    }

    pub fn dump_semantics(&self, function: FunctionRef) -> String {
        print_semantics(&self.program.borrow(), &self.semantics.borrow(), function)
    }

    pub fn dump_signature(&self, function: FunctionRef) -> String {
        self.program.borrow().function(function).signature.to_string()
    }

    pub fn dump_dot(&self) -> String {
        generate_dot(&self.program.borrow(), &self.dataflow.borrow())
    }
}
