//! Data-flow research: where does each value come from.
//!
//! The [`DataFlowRepository`] holds a provenance graph over IR values. Each node classifies its
//! value as a copy of its predecessors (possibly at a constant offset: `p + 0x10`), a read through
//! an address, or a write of a value through an address. A distinguished `Start` node stands for
//! the program image, i.e. everything addressed relative to the instruction pointer.
//!
//! The [`DataFlowCollector`] keeps the graph in sync with the IR-code: it researches the
//! operations of every decompiled function, and drops the nodes of removed operations.

use crate::config::CONFIG;
use crate::containers::unordered::UnorderedMap;
use crate::events::{Event, EventPipe};
use crate::ircode::{
    get_linear_expr, to_base_terms, FunctionRef, IRcodeEvent, OperationId, OperationKind,
    OperationRef, Program, ValueKind, ValueRef,
};
use crate::log::*;
use crate::researcher::ResearcherPropagationContext;
use itertools::Itertools;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeRef(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DataFlowNodeType {
    Unknown,
    Start,
    Copy,
    Write,
    Read,
}

#[derive(Clone, Debug)]
pub struct DataFlowNode {
    pub node_type: DataFlowNodeType,
    /// `None` for the start node
    pub value: Option<ValueRef>,
    pub offset: u64,
    pub predecessors: Vec<NodeRef>,
    pub successors: Vec<NodeRef>,
    is_variable: bool,
    pub removed: bool,
}

impl DataFlowNode {
    pub fn is_variable(&self) -> bool {
        self.is_variable
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataFlowEvent {
    NodeCreated(NodeRef),
    /// The node's type or predecessors changed
    NodeUpdated(NodeRef),
    /// The node keeps its edges, so its position at the time of the removal can be inspected
    NodeRemoved(NodeRef),
    /// The node was visited by a [`DataFlowRepository::pass_successors`] walk
    NodePassed {
        node: NodeRef,
        next_nodes: Vec<NodeRef>,
    },
}

#[derive(Debug)]
pub struct DataFlowRepository {
    nodes: Vec<DataFlowNode>,
    by_value: UnorderedMap<ValueRef, NodeRef>,
    start: NodeRef,
    pending_events: Vec<DataFlowEvent>,
}

impl Default for DataFlowRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFlowRepository {
    pub fn new() -> Self {
        Self {
            nodes: vec![DataFlowNode {
                node_type: DataFlowNodeType::Start,
                value: None,
                offset: 0,
                predecessors: vec![],
                successors: vec![],
                is_variable: false,
                removed: false,
            }],
            by_value: Default::default(),
            start: NodeRef(0),
            pending_events: vec![],
        }
    }

    pub fn global_start_node(&self) -> NodeRef {
        self.start
    }

    pub fn node(&self, node: NodeRef) -> &DataFlowNode {
        &self.nodes[node.0]
    }

    /// All live nodes, the start node first
    pub fn nodes(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.removed)
            .map(|(i, _)| NodeRef(i))
    }

    pub fn get_node(&self, value: ValueRef) -> Option<NodeRef> {
        self.by_value.get(&value).copied()
    }

    /// The node of `value`, made with `node_type` and `offset` if there is none yet. A node of
    /// unknown type is refined, any other keeps its type.
    pub fn get_or_create_node(
        &mut self,
        program: &Program,
        value: ValueRef,
        node_type: DataFlowNodeType,
        offset: u64,
    ) -> NodeRef {
        if let Some(node) = self.get_node(value) {
            let n = &mut self.nodes[node.0];
            if n.node_type == DataFlowNodeType::Unknown && node_type != DataFlowNodeType::Unknown {
                n.node_type = node_type;
                n.offset = offset;
                self.pending_events.push(DataFlowEvent::NodeUpdated(node));
            }
            return node;
        }
        let node = NodeRef(self.nodes.len());
        self.nodes.push(DataFlowNode {
            node_type,
            value: Some(value),
            offset,
            predecessors: vec![],
            successors: vec![],
            is_variable: program.value(value).is_variable(),
            removed: false,
        });
        self.by_value.insert(value, node);
        self.pending_events.push(DataFlowEvent::NodeCreated(node));
        node
    }

    /// Link `node` to `successor`. Returns whether the edge is new.
    pub fn add_successor(&mut self, node: NodeRef, successor: NodeRef) -> bool {
        if self.nodes[node.0].successors.contains(&successor) {
            return false;
        }
        self.nodes[node.0].successors.push(successor);
        self.nodes[successor.0].predecessors.push(node);
        self.pending_events
            .push(DataFlowEvent::NodeUpdated(successor));
        true
    }

    /// Unlink `node` from `successor`. Returns whether there was such an edge.
    pub fn remove_successor(&mut self, node: NodeRef, successor: NodeRef) -> bool {
        if !self.nodes[node.0].successors.contains(&successor) {
            return false;
        }
        self.nodes[node.0].successors.retain(|n| *n != successor);
        self.nodes[successor.0].predecessors.retain(|n| *n != node);
        self.pending_events
            .push(DataFlowEvent::NodeUpdated(successor));
        true
    }

    pub fn remove_node(&mut self, node: NodeRef) {
        if self.nodes[node.0].removed || node == self.start {
            return;
        }
        self.pending_events.push(DataFlowEvent::NodeRemoved(node));
        let (preds, succs) = {
            let n = &self.nodes[node.0];
            (n.predecessors.clone(), n.successors.clone())
        };
        for pred in preds {
            self.nodes[pred.0].successors.retain(|n| *n != node);
        }
        for succ in succs {
            self.nodes[succ.0].predecessors.retain(|n| *n != node);
        }
        self.nodes[node.0].removed = true;
        if let Some(value) = self.nodes[node.0].value {
            self.by_value.remove(&value);
        }
    }

    /// Predecessors holding variables (constants and the start node do not count)
    pub fn var_predecessor_count(&self, node: NodeRef) -> usize {
        self.nodes[node.0]
            .predecessors
            .iter()
            .filter(|p| self.nodes[p.0].is_variable)
            .count()
    }

    /// Walk the graph from `start_node`, depth first. A node is only visited once it was knocked
    /// on by as many predecessors as it has variable predecessors; when nothing else is left, the
    /// earliest pending node is let through regardless, which is what breaks cycles.
    ///
    /// `callback` is given the visited node and the list of nodes to go on with (its successors,
    /// which it may extend), and returns whether to go on at all. Every visit is recorded as a
    /// [`DataFlowEvent::NodePassed`] in `passed`.
    pub fn pass_successors(
        &self,
        start_node: NodeRef,
        passed: &mut Vec<DataFlowEvent>,
        mut callback: impl FnMut(NodeRef, &mut VecDeque<NodeRef>) -> bool,
    ) {
        let mut node_knocks: BTreeMap<NodeRef, usize> = Default::default();
        let mut nodes_to_visit: VecDeque<NodeRef> = VecDeque::from(vec![start_node]);
        loop {
            while let Some(node) = nodes_to_visit.pop_front() {
                let knocks = node_knocks.entry(node).or_insert(0);
                *knocks += 1;
                if *knocks < self.var_predecessor_count(node) {
                    continue;
                }
                node_knocks.remove(&node);
                if self.nodes[node.0].removed {
                    continue;
                }
                let mut next_nodes: VecDeque<NodeRef> =
                    self.nodes[node.0].successors.iter().copied().collect();
                if callback(node, &mut next_nodes) {
                    for next in next_nodes.into_iter().rev() {
                        nodes_to_visit.push_front(next);
                    }
                }
                if CONFIG.log_data_flow_passes {
                    trace!("Data-flow node passed"; "node" => node.0, "pending" => nodes_to_visit.len());
                }
                passed.push(DataFlowEvent::NodePassed {
                    node,
                    next_nodes: nodes_to_visit.iter().copied().collect(),
                });
            }
            match node_knocks.keys().next() {
                Some(node) => nodes_to_visit.push_back(*node),
                None => break,
            }
        }
    }

    pub fn take_events(&mut self) -> Vec<DataFlowEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

/// Keeps a [`DataFlowRepository`] in sync with the IR-code of a program.
pub struct DataFlowCollector {
    program: Rc<RefCell<Program>>,
    repo: Rc<RefCell<DataFlowRepository>>,
    pipe: EventPipe<Event>,
}

impl DataFlowCollector {
    /// A collector emitting the repository's events to `pipe`
    pub fn new(
        program: Rc<RefCell<Program>>,
        repo: Rc<RefCell<DataFlowRepository>>,
        pipe: EventPipe<Event>,
    ) -> Rc<Self> {
        Rc::new(Self {
            program,
            repo,
            pipe,
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
        {
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
                    ctx.collect(|ctx, op| research(&program, &mut repo, ctx, op));
                    // the callers may refer to variables which are gone now
                    for call_op in program.call_operations_to(*function) {
                        research_call_operation(&program, &mut repo, call_op, *function);
                    }
                }
                IRcodeEvent::OperationRemoved(op) => {
                    let output = program.operation(*op).output;
                    if let Some(node) = repo.get_node(output) {
                        repo.remove_node(node);
                    }
                }
                IRcodeEvent::FunctionSignatureChanged {
                    function,
                    old_param_vars,
                    old_return_var,
                } => {
                    for call_op in program.call_operations_to(*function) {
                        unlink_call_operation(
                            &program,
                            &mut repo,
                            call_op,
                            old_param_vars,
                            *old_return_var,
                        );
                        research_call_operation(&program, &mut repo, call_op, *function);
                    }
                }
                _ => {}
            }
        }
        self.flush();
    }

    fn flush(&self) {
        let events = self.repo.borrow_mut().take_events();
        for event in events {
            self.pipe.send(&Event::DataFlow(event));
        }
    }
}

/// Classify the output of `op`.
fn research(
    program: &Program,
    repo: &mut DataFlowRepository,
    ctx: &mut ResearcherPropagationContext,
    op: OperationRef,
) {
    use DataFlowNodeType::*;
    let operation = program.operation(op);
    if operation.removed {
        return;
    }
    let output = operation.output;
    match (&operation.kind, operation.id) {
        (OperationKind::Unary { input }, OperationId::Load) => {
            match program.value(*input).register() {
                Some(reg) => {
                    if reg.is_instruction_pointer() {
                        let start = repo.global_start_node();
                        let copy = repo.get_or_create_node(program, output, Copy, 0);
                        repo.add_successor(start, copy);
                    }
                }
                None => {
                    let input_node = repo.get_or_create_node(program, *input, Unknown, 0);
                    let read = repo.get_or_create_node(program, output, Read, 0);
                    repo.add_successor(input_node, read);
                }
            }
        }
        (OperationKind::Unary { input }, OperationId::Copy)
        | (OperationKind::Ref { input, .. }, OperationId::Ref) => {
            let input_node = repo.get_or_create_node(program, *input, Unknown, 0);
            let addr_var = program
                .value(output)
                .mem_address()
                .and_then(|a| a.value)
                .filter(|v| program.value(*v).is_variable());
            match addr_var {
                Some(addr_var) => {
                    let addr_node = repo.get_or_create_node(program, addr_var, Unknown, 0);
                    let write = repo.get_or_create_node(program, output, Write, 0);
                    if repo.add_successor(addr_node, write) {
                        // now known to be an address
                        ctx.mark_value_as_affected(program, addr_var);
                    }
                    repo.add_successor(input_node, write);
                }
                None => {
                    let copy = repo.get_or_create_node(program, output, Copy, 0);
                    repo.add_successor(input_node, copy);
                }
            }
        }
        (OperationKind::Binary { .. }, OperationId::IntAdd | OperationId::IntMult) => {
            let expr = get_linear_expr(program, output, false);
            let offset = expr.const_term_value();
            let base_terms = to_base_terms(program, &expr, CONFIG.pointer_size);
            let term = base_terms
                .into_iter()
                .find(|t| matches!(program.value(*t).kind, ValueKind::Variable { .. }));
            if let Some(term) = term {
                // an address only once either side is known to be part of the data flow
                if repo.get_node(output).is_some() || repo.get_node(term).is_some() {
                    let input_node = repo.get_or_create_node(program, term, Unknown, 0);
                    let copy = repo.get_or_create_node(program, output, Copy, offset);
                    repo.add_successor(input_node, copy);
                }
            }
        }
        (OperationKind::Binary { input1, input2 }, OperationId::Phi) => {
            let node1 = repo.get_or_create_node(program, *input1, Unknown, 0);
            let node2 = repo.get_or_create_node(program, *input2, Unknown, 0);
            let copy = repo.get_or_create_node(program, output, Copy, 0);
            repo.add_successor(node1, copy);
            repo.add_successor(node2, copy);
        }
        (OperationKind::Call { destination, .. }, OperationId::Call) => {
            let callee = program
                .value(*destination)
                .constant()
                .map(crate::pcode::InstructionOffset::from_full)
                .and_then(|o| program.function_at(o));
            if let Some(callee) = callee {
                research_call_operation(program, repo, op, callee);
            }
        }
        _ => {}
    }
}

/// Link the arguments of a call to the parameters of `function`, and its return value to the
/// call's output.
fn research_call_operation(
    program: &Program,
    repo: &mut DataFlowRepository,
    call_op: OperationRef,
    function: FunctionRef,
) {
    use DataFlowNodeType::*;
    let operation = program.operation(call_op);
    let arguments = match &operation.kind {
        OperationKind::Call { arguments, .. } => arguments,
        _ => return,
    };
    let f = program.function(function);
    if arguments.len() != f.param_vars.len() {
        // the call site is re-decompiled against the new signature later on
        debug!("Argument count mismatch";
            "function" => program.function_name(function),
            "args" => arguments.len(),
            "params" => f.param_vars.len());
    }
    for (arg, param) in arguments.iter().zip(f.param_vars.iter()) {
        if let Some(param) = param {
            let arg_node = repo.get_or_create_node(program, *arg, Unknown, 0);
            let param_node = repo.get_or_create_node(program, *param, Copy, 0);
            repo.add_successor(arg_node, param_node);
        }
    }
    if let Some(return_var) = f.return_var {
        let output_node = repo.get_or_create_node(program, operation.output, Copy, 0);
        let return_node = repo.get_or_create_node(program, return_var, Unknown, 0);
        repo.add_successor(return_node, output_node);
    }
}

/// Undo [`research_call_operation`] for the previous parameter and return variables.
fn unlink_call_operation(
    program: &Program,
    repo: &mut DataFlowRepository,
    call_op: OperationRef,
    old_param_vars: &[Option<ValueRef>],
    old_return_var: Option<ValueRef>,
) {
    let operation = program.operation(call_op);
    if let OperationKind::Call { arguments, .. } = &operation.kind {
        for (arg, param) in arguments.iter().zip(old_param_vars) {
            if let (Some(arg_node), Some(param_node)) =
                (repo.get_node(*arg), param.and_then(|p| repo.get_node(p)))
            {
                repo.remove_successor(arg_node, param_node);
            }
        }
    }
    if let (Some(return_node), Some(output_node)) = (
        old_return_var.and_then(|r| repo.get_node(r)),
        repo.get_node(operation.output),
    ) {
        repo.remove_successor(return_node, output_node);
    }
}

/// `varN`, qualified with its function's entry block when it is not a variable of `function`.
pub fn node_name(
    program: &Program,
    repo: &DataFlowRepository,
    node: NodeRef,
    function: Option<FunctionRef>,
) -> String {
    let n = repo.node(node);
    match n.value {
        None => "Start".to_string(),
        Some(value) => match &program.value(value).kind {
            ValueKind::Constant { value, .. } => format!("{:#x}", value),
            ValueKind::Register { register } => register.name(),
            ValueKind::Variable { .. } => {
                if function.is_some() && program.function_of_value(value) == function {
                    program.variable_name(value)
                } else {
                    program.full_variable_name(value)
                }
            }
        },
    }
}

/// The data flow into the variables of `function` (and into the variables of other functions fed
/// by them), one edge per line: `var2 <- Copy var1 + 0x10`.
pub fn print_data_flow_for_function(
    program: &Program,
    repo: &DataFlowRepository,
    function: FunctionRef,
) -> String {
    let mut variables = program.function_variables(function);
    let mut ext_variables = vec![];
    for var in &variables {
        let node = match repo.get_node(*var) {
            Some(n) => n,
            None => continue,
        };
        for succ in &repo.node(node).successors {
            if let Some(succ_var) = repo.node(*succ).value {
                if program.value(succ_var).is_variable()
                    && !variables.contains(&succ_var)
                    && !ext_variables.contains(&succ_var)
                {
                    ext_variables.push(succ_var);
                }
            }
        }
    }
    let sort_key = |v: &ValueRef| {
        let function_name = program
            .function_of_value(*v)
            .map(|f| program.function_name(f))
            .unwrap_or_default();
        let id = match program.value(*v).kind {
            ValueKind::Variable { id, .. } => id,
            _ => 0,
        };
        (function_name, id)
    };
    variables.sort_by_key(sort_key);
    ext_variables.sort_by_key(sort_key);
    variables.extend(ext_variables);

    let mut lines = vec![];
    for var in variables {
        let node = match repo.get_node(var) {
            Some(n) => n,
            None => continue,
        };
        let n = repo.node(node);
        let name = node_name(program, repo, node, Some(function));
        if n.predecessors.is_empty() {
            lines.push(format!("{} <- Unknown", name));
            continue;
        }
        let var_function = program.function_of_value(var);
        for pred in &n.predecessors {
            if let Some(pred_value) = repo.node(*pred).value {
                if program.value(pred_value).is_variable()
                    && var_function != Some(function)
                    && program.function_of_value(pred_value) != Some(function)
                {
                    continue;
                }
            }
            let kind = match n.node_type {
                DataFlowNodeType::Copy => "Copy ",
                DataFlowNodeType::Write => "Write ",
                DataFlowNodeType::Read => "Read ",
                DataFlowNodeType::Unknown | DataFlowNodeType::Start => "",
            };
            let offset = if n.offset > 0 {
                format!(" + {:#x}", n.offset)
            } else {
                String::new()
            };
            lines.push(format!(
                "{} <- {}{}{}",
                name,
                kind,
                node_name(program, repo, *pred, Some(function)),
                offset
            ));
        }
    }
    lines.into_iter().join("\n")
}

/// Render the whole data-flow graph as a graphviz digraph.
pub fn generate_dot(program: &Program, repo: &DataFlowRepository) -> String {
    type Edge = (NodeRef, NodeRef, String);

    struct Graph<'a> {
        program: &'a Program,
        repo: &'a DataFlowRepository,
    }

    impl<'a> dot::Labeller<'a, NodeRef, Edge> for Graph<'a> {
        fn graph_id(&'a self) -> dot::Id<'a> {
            dot::Id::new("DataFlow").unwrap()
        }
        fn node_id(&'a self, n: &NodeRef) -> dot::Id<'a> {
            dot::Id::new(format!("n{}", n.0)).unwrap()
        }
        fn node_label<'b>(&'b self, n: &NodeRef) -> dot::LabelText<'b> {
            dot::LabelText::label(node_name(self.program, self.repo, *n, None))
        }
        fn node_shape(&'a self, n: &NodeRef) -> Option<dot::LabelText<'a>> {
            (*n == self.repo.global_start_node()).then(|| dot::LabelText::label("note"))
        }
        fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
            dot::LabelText::label(e.2.clone())
        }
    }

    impl<'a> dot::GraphWalk<'a, NodeRef, Edge> for Graph<'a> {
        fn nodes(&self) -> dot::Nodes<'a, NodeRef> {
            self.repo.nodes().collect::<Vec<_>>().into()
        }
        fn edges(&'a self) -> dot::Edges<'a, Edge> {
            let mut edges = vec![];
            for node in self.repo.nodes() {
                let n = self.repo.node(node);
                for succ in &n.successors {
                    let s = self.repo.node(*succ);
                    let label = match (s.node_type, s.offset) {
                        (t, 0) => format!("{:?}", t),
                        (t, offset) => format!("{:?} + {:#x}", t, offset),
                    };
                    edges.push((node, *succ, label));
                }
            }
            edges.into()
        }
        fn source(&self, e: &Edge) -> NodeRef {
            e.0
        }
        fn target(&self, e: &Edge) -> NodeRef {
            e.1
        }
    }

    let mut s: Vec<u8> = vec![];
    let g = Graph { program, repo };
    // writing to a vec never fails
    let _ = dot::render(&g, &mut s);
    String::from_utf8_lossy(&s).into_owned()
}
