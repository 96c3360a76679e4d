//! Structure research: recovering record layouts from the data flow.
//!
//! Every data-flow node that can be dereferenced gets linked to a [`Structure`] (possibly at an
//! offset into it). Reads and writes through a linked address register fields on the structure,
//! constants written to it are remembered, and constant branch conditions on a field (think
//! `if (obj->kind == 1)`) split off more specific child structures for the guarded code.
//!
//! A node's hash in the [`StructureRepository`] combines the identity and version of the structure
//! it is linked to. Research walks the data-flow successors of an updated node and only goes on
//! past a node when that hash changed, which is what makes it terminate.

use crate::config::CONFIG;
use crate::const_condition::{ConstConditionRepository, ConstantConditionType};
use crate::containers::InsertionOrderedSet;
use crate::dataflow::{node_name, DataFlowEvent, DataFlowNodeType, DataFlowRepository, NodeRef};
use crate::events::{topic_filter, Event, EventPipe};
use crate::hashing::{hash_all, hash_combine, Hash};
use crate::ircode::{get_linear_expr, to_base_terms, OperationId, OperationRef, Program};
use crate::log::*;
use crate::pcode::BlockRef;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::{Rc, Weak};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct StructureRef(pub usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructureEvent {
    Created(StructureRef),
    /// Only emitted by the [`structure_changes_pipe`]
    Updated(StructureRef),
    Removed(StructureRef),
    ChildAdded {
        structure: StructureRef,
        child: StructureRef,
    },
    ChildRemoved {
        structure: StructureRef,
        child: StructureRef,
    },
    LinkCreated {
        node: NodeRef,
        structure: StructureRef,
        offset: u64,
    },
}

/// Sets of constant values, per offset
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConstantSet {
    values: BTreeMap<u64, BTreeSet<u64>>,
}

impl ConstantSet {
    pub fn values(&self) -> &BTreeMap<u64, BTreeSet<u64>> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn insert(&mut self, offset: u64, value: u64) {
        self.values.entry(offset).or_default().insert(value);
    }

    pub fn remove(&mut self, offset: u64) {
        self.values.remove(&offset);
    }

    /// Add the values of `other`; with `clear`, they replace the values at the offsets `other` has
    pub fn merge(&mut self, other: &ConstantSet, clear: bool) {
        for (offset, values) in &other.values {
            let entry = self.values.entry(*offset).or_default();
            if clear {
                entry.clear();
            }
            entry.extend(values.iter().copied());
        }
    }

    pub fn clear(&mut self) {
        self.values.clear()
    }

    pub fn hash(&self) -> Hash {
        let mut res = 0;
        for (offset, values) in &self.values {
            hash_combine(&mut res, *offset);
            for v in values {
                hash_combine(&mut res, *v);
            }
        }
        res
    }
}

#[derive(Clone, Debug)]
pub struct Structure {
    pub name: String,
    /// Bumped by [`StructureRepository::mark_as_updated`]
    pub version: usize,
    /// The node the structure was made for (`None` for field structures)
    pub source_node: Option<NodeRef>,
    pub parents: BTreeSet<StructureRef>,
    pub childs: BTreeSet<StructureRef>,
    /// Structures values flow from
    pub inputs: BTreeSet<StructureRef>,
    /// Structures values flow to
    pub outputs: BTreeSet<StructureRef>,
    /// Field structures by offset; the children of a field structure are the structures of the
    /// values read from and written to the field
    pub fields: BTreeMap<u64, StructureRef>,
    /// Field values guaranteed by branch conditions
    pub conditions: ConstantSet,
    /// Constants written to fields
    pub constants: ConstantSet,
    pub linked_nodes: BTreeSet<NodeRef>,
    pub removed: bool,
}

/// How a data-flow node relates to a structure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    pub structure: StructureRef,
    pub offset: u64,
    /// Version of the structure when the link was made
    pub version: usize,
    /// The structure was made for this very node
    pub own: bool,
}

#[derive(Debug, Default)]
pub struct StructureRepository {
    structures: Vec<Structure>,
    node_to_structure: BTreeMap<NodeRef, Link>,
    node_to_constant: BTreeMap<NodeRef, u64>,
    node_to_hash: BTreeMap<NodeRef, Hash>,
    pending_events: Vec<StructureEvent>,
}

impl StructureRepository {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn structure(&self, structure: StructureRef) -> &Structure {
        &self.structures[structure.0]
    }

    pub fn structure_mut(&mut self, structure: StructureRef) -> &mut Structure {
        &mut self.structures[structure.0]
    }

    /// All live structures, in creation order
    pub fn structures(&self) -> impl Iterator<Item = StructureRef> + '_ {
        self.structures
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.removed)
            .map(|(i, _)| StructureRef(i))
    }

    /// The live structures without parents
    pub fn root_structures(&self) -> impl Iterator<Item = StructureRef> + '_ {
        self.structures()
            .filter(move |s| self.structure(*s).parents.is_empty())
    }

    pub fn set_constant(&mut self, node: NodeRef, value: u64) {
        self.node_to_constant.insert(node, value);
    }

    pub fn constant(&self, node: NodeRef) -> Option<u64> {
        self.node_to_constant.get(&node).copied()
    }

    pub fn link(&self, node: NodeRef) -> Option<Link> {
        self.node_to_structure.get(&node).copied()
    }

    pub fn create_structure(&mut self, name: String) -> StructureRef {
        let structure = StructureRef(self.structures.len());
        debug!("Structure created"; "name" => &name);
        self.structures.push(Structure {
            name,
            version: 0,
            source_node: None,
            parents: Default::default(),
            childs: Default::default(),
            inputs: Default::default(),
            outputs: Default::default(),
            fields: Default::default(),
            conditions: Default::default(),
            constants: Default::default(),
            linked_nodes: Default::default(),
            removed: false,
        });
        self.pending_events.push(StructureEvent::Created(structure));
        structure
    }

    /// A structure of `node`'s own, linked to it at offset 0
    pub fn create_structure_for_node(&mut self, node: NodeRef, name: String) -> StructureRef {
        let structure = self.create_structure(name);
        self.structure_mut(structure).source_node = Some(node);
        self.add_link(node, structure, 0, true);
        structure
    }

    /// The structure of `node`'s own. A node merely linked to another node's structure gets a new
    /// one.
    pub fn get_or_create_structure(&mut self, node: NodeRef, name: impl FnOnce() -> String) -> StructureRef {
        match self.link(node) {
            Some(link) if link.own => link.structure,
            _ => self.create_structure_for_node(node, name()),
        }
    }

    pub fn remove_structure(&mut self, structure: StructureRef) {
        if self.structure(structure).removed {
            return;
        }
        self.clear_structure(structure);
        debug!("Structure removed"; "name" => &self.structure(structure).name);
        self.pending_events.push(StructureEvent::Removed(structure));
        let linked_nodes = std::mem::take(&mut self.structure_mut(structure).linked_nodes);
        for node in linked_nodes {
            if self.link(node).map(|l| l.structure) == Some(structure) {
                self.node_to_structure.remove(&node);
            }
        }
        self.structure_mut(structure).removed = true;
    }

    /// Detach a structure from all others and drop its fields and conditions. Its links stay.
    pub fn clear_structure(&mut self, structure: StructureRef) {
        let parents = std::mem::take(&mut self.structure_mut(structure).parents);
        for parent in parents {
            self.structure_mut(parent).childs.remove(&structure);
            self.pending_events.push(StructureEvent::ChildRemoved {
                structure: parent,
                child: structure,
            });
        }
        let childs = std::mem::take(&mut self.structure_mut(structure).childs);
        for child in childs {
            self.structure_mut(child).parents.remove(&structure);
            self.pending_events.push(StructureEvent::ChildRemoved {
                structure,
                child,
            });
        }
        let inputs = std::mem::take(&mut self.structure_mut(structure).inputs);
        for input in inputs {
            self.structure_mut(input).outputs.remove(&structure);
        }
        let outputs = std::mem::take(&mut self.structure_mut(structure).outputs);
        for output in outputs {
            self.structure_mut(output).inputs.remove(&structure);
        }
        let fields = std::mem::take(&mut self.structure_mut(structure).fields);
        for field in fields.into_values() {
            self.remove_structure(field);
        }
        self.structure_mut(structure).conditions.clear();
    }

    /// Bump the version of a structure, which changes the hash of the nodes linked to it from now
    /// on.
    pub fn mark_as_updated(&mut self, structure: StructureRef) {
        let s = self.structure_mut(structure);
        s.version += 1;
        if let Some(source_node) = s.source_node {
            self.add_link(source_node, structure, 0, true);
        }
    }

    /// Record that `var_structure` is read from (or, with `write`, written to) the field at
    /// `offset` of `structure`.
    pub fn add_field(
        &mut self,
        structure: StructureRef,
        offset: u64,
        var_structure: StructureRef,
        write: bool,
    ) {
        let field = match self.structure(structure).fields.get(&offset) {
            Some(field) => *field,
            None => {
                let name = format!("{}_{:#x}", self.structure(structure).name, offset);
                let field = self.create_structure(name);
                self.structure_mut(structure).fields.insert(offset, field);
                field
            }
        };
        self.add_child(field, var_structure);
        if write {
            self.add_output(var_structure, field);
        } else {
            self.add_output(field, var_structure);
        }
    }

    pub fn add_child(&mut self, structure: StructureRef, child: StructureRef) {
        if !self.structure_mut(structure).childs.insert(child) {
            return;
        }
        self.structure_mut(child).parents.insert(structure);
        self.pending_events
            .push(StructureEvent::ChildAdded { structure, child });
    }

    pub fn add_output(&mut self, structure: StructureRef, output: StructureRef) {
        if self.structure_mut(structure).outputs.insert(output) {
            self.structure_mut(output).inputs.insert(structure);
        }
    }

    /// Link `node` to `structure` at `offset`, replacing any previous link of the node. `own` marks
    /// the structure as made for the node.
    pub fn add_link(&mut self, node: NodeRef, structure: StructureRef, offset: u64, own: bool) {
        let s = self.structure_mut(structure);
        s.linked_nodes.insert(node);
        let version = s.version;
        self.node_to_structure.insert(
            node,
            Link {
                structure,
                offset,
                version,
                own,
            },
        );
        self.pending_events.push(StructureEvent::LinkCreated {
            node,
            structure,
            offset,
        });
    }

    /// Forget everything about a removed data-flow node
    pub fn remove_node(&mut self, node: NodeRef) {
        if let Some(link) = self.link(node) {
            if link.own {
                self.remove_structure(link.structure);
            }
            self.node_to_structure.remove(&node);
        }
        self.node_to_constant.remove(&node);
        self.node_to_hash.remove(&node);
    }

    /// The hash a node was last researched with (see the multi-predecessor and conditional cases
    /// of the researcher)
    fn stored_hash(&self, node: NodeRef) -> Hash {
        self.node_to_hash.get(&node).copied().unwrap_or(0)
    }

    fn set_stored_hash(&mut self, node: NodeRef, hash: Hash) {
        self.node_to_hash.insert(node, hash);
    }

    /// What research knows about `node`: the identity and version of its structure, or the
    /// constant it holds.
    pub fn get_hash(&self, node: NodeRef) -> Hash {
        match self.link(node) {
            Some(link) => hash_all(0, &[link.structure.0 as u64, link.version as u64]),
            None => self.constant(node).unwrap_or(0),
        }
    }

    /// Visit `start` and the structures its values flow to. Like
    /// [`DataFlowRepository::pass_successors`], a structure is visited once all of its inputs
    /// knocked on it, the earliest pending one being let through when the walk is stuck.
    pub fn pass_descendants(
        &self,
        start: StructureRef,
        mut callback: impl FnMut(StructureRef, &mut VecDeque<StructureRef>),
    ) {
        let mut knocks: BTreeMap<StructureRef, usize> = Default::default();
        let mut to_visit = VecDeque::from(vec![start]);
        loop {
            while let Some(structure) = to_visit.pop_front() {
                let k = knocks.entry(structure).or_insert(0);
                *k += 1;
                if *k < self.structure(structure).inputs.len() {
                    continue;
                }
                knocks.remove(&structure);
                let mut next = VecDeque::new();
                callback(structure, &mut next);
                for s in next.into_iter().rev() {
                    to_visit.push_front(s);
                }
            }
            match knocks.keys().next() {
                Some(s) => to_visit.push_back(*s),
                None => break,
            }
        }
    }

    pub fn take_events(&mut self) -> Vec<StructureEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

/// The name of the structure made for a node: the full name of its variable
fn structure_name(program: &Program, dataflow: &DataFlowRepository, node: NodeRef) -> String {
    if node == dataflow.global_start_node() {
        return "root".to_string();
    }
    node_name(program, dataflow, node, None)
}

/// Keeps a [`StructureRepository`] up to date with the data flow.
pub struct StructureResearcher {
    program: Rc<RefCell<Program>>,
    structure_repo: Rc<RefCell<StructureRepository>>,
    dataflow_repo: Rc<RefCell<DataFlowRepository>>,
    const_cond_repo: Rc<ConstConditionRepository>,
    pipe: EventPipe<Event>,
}

struct ResearchContext<'a> {
    program: &'a Program,
    dataflow: &'a DataFlowRepository,
    repo: &'a mut StructureRepository,
    const_cond_repo: &'a ConstConditionRepository,
}

impl StructureResearcher {
    /// A researcher emitting structure (and data-flow pass) events to `pipe`. The root structure,
    /// the one of the start node, is made right away.
    pub fn new(
        program: Rc<RefCell<Program>>,
        structure_repo: Rc<RefCell<StructureRepository>>,
        dataflow_repo: Rc<RefCell<DataFlowRepository>>,
        const_cond_repo: Rc<ConstConditionRepository>,
        pipe: EventPipe<Event>,
    ) -> Rc<Self> {
        {
            let start = dataflow_repo.borrow().global_start_node();
            structure_repo
                .borrow_mut()
                .get_or_create_structure(start, || "root".to_string());
        }
        let res = Rc::new(Self {
            program,
            structure_repo,
            dataflow_repo,
            const_cond_repo,
            pipe,
        });
        res.flush(vec![]);
        res
    }

    /// The pipe to send data-flow events to. Nodes created or updated within a commit are
    /// researched once, after the commit.
    pub fn event_pipe(self: &Rc<Self>) -> EventPipe<Event> {
        let pipe = EventPipe::new();
        let updated_nodes: Rc<RefCell<InsertionOrderedSet<NodeRef>>> = Default::default();
        let (optimized, commit_in) = EventPipe::optimized_commit(
            topic_filter::<Event, DataFlowEvent>,
            {
                let updated_nodes = updated_nodes.clone();
                move |next| loop {
                    let node = updated_nodes.borrow_mut().pop_front();
                    match node {
                        Some(node) => next(&Event::DataFlow(DataFlowEvent::NodeUpdated(node))),
                        None => break,
                    }
                }
            },
        );
        commit_in.subscribe_topic::<DataFlowEvent>(move |event| match event {
            DataFlowEvent::NodeCreated(node) | DataFlowEvent::NodeUpdated(node) => {
                updated_nodes.borrow_mut().insert(*node);
            }
            DataFlowEvent::NodeRemoved(node) => {
                updated_nodes.borrow_mut().remove(node);
            }
            DataFlowEvent::NodePassed { .. } => {}
        });
        pipe.connect(optimized.clone());
        let this: Weak<Self> = Rc::downgrade(self);
        optimized.subscribe_topic::<DataFlowEvent>(move |event| {
            if let (DataFlowEvent::NodeUpdated(node), Some(this)) = (event, this.upgrade()) {
                this.research(*node);
            }
        });
        let this: Weak<Self> = Rc::downgrade(self);
        pipe.subscribe_topic::<DataFlowEvent>(move |event| {
            if let (DataFlowEvent::NodeRemoved(node), Some(this)) = (event, this.upgrade()) {
                this.structure_repo.borrow_mut().remove_node(*node);
                this.flush(vec![]);
            }
        });
        pipe
    }

    /// Research `node` and, as long as that changes anything, its data-flow successors.
    pub fn research(&self, node: NodeRef) {
        let mut passed = vec![];
        {
            let program = self.program.borrow();
            let dataflow = self.dataflow_repo.borrow();
            if dataflow.node(node).removed {
                return;
            }
            let mut repo = self.structure_repo.borrow_mut();
            let mut ctx = ResearchContext {
                program: &*program,
                dataflow: &*dataflow,
                repo: &mut *repo,
                const_cond_repo: &self.const_cond_repo,
            };
            dataflow.pass_successors(node, &mut passed, |node, next| ctx.research(node, next));
        }
        self.flush(passed);
    }

    fn flush(&self, passed: Vec<DataFlowEvent>) {
        for event in passed {
            self.pipe.send(&Event::DataFlow(event));
        }
        let events = self.structure_repo.borrow_mut().take_events();
        for event in events {
            self.pipe.send(&Event::Structure(event));
        }
    }
}

impl<'a> ResearchContext<'a> {
    /// Returns whether to go on with the successors of `node`
    fn research(&mut self, node: NodeRef, next: &mut VecDeque<NodeRef>) -> bool {
        let hash = self.repo.get_hash(node);
        self.research_constants(node);
        self.research_structures(node, next);
        let new_hash = self.repo.get_hash(node);
        trace!("Structure research";
            "node" => node_name(self.program, self.dataflow, node, None),
            "changed" => hash != new_hash);
        hash != new_hash
    }

    fn research_constants(&mut self, node: NodeRef) {
        let dataflow = self.dataflow;
        let n = dataflow.node(node);
        match n.node_type {
            DataFlowNodeType::Copy => {
                if let [pred] = n.predecessors[..] {
                    if let Some(c) = self.repo.constant(pred) {
                        self.repo.set_constant(node, c);
                    }
                }
            }
            DataFlowNodeType::Unknown => {
                if let Some(c) = n.value.and_then(|v| self.program.value(v).constant()) {
                    self.repo.set_constant(node, c);
                }
            }
            _ => {}
        }
    }

    fn get_or_create_structure(&mut self, node: NodeRef) -> StructureRef {
        let (program, dataflow) = (self.program, self.dataflow);
        self.repo
            .get_or_create_structure(node, || structure_name(program, dataflow, node))
    }

    fn research_structures(&mut self, node: NodeRef, next: &mut VecDeque<NodeRef>) {
        let dataflow = self.dataflow;
        let n = dataflow.node(node);
        let preds = n.predecessors.clone();
        match n.node_type {
            DataFlowNodeType::Copy => {
                if !preds.iter().any(|p| self.repo.link(*p).is_some()) {
                    return;
                }
                for pred in &preds {
                    if self.repo.link(*pred).is_none() {
                        self.get_or_create_structure(*pred);
                    }
                }
                if let [pred] = preds[..] {
                    self.research_single_copy(node, pred);
                } else {
                    self.research_confluence(node, &preds, next);
                }
            }
            DataFlowNodeType::Read => {
                let addr_link = match preds.first().and_then(|p| self.repo.link(*p)) {
                    Some(link) => link,
                    None => return,
                };
                let structure = self.get_or_create_structure(node);
                self.repo
                    .add_field(addr_link.structure, addr_link.offset, structure, false);
            }
            DataFlowNodeType::Write => {
                let (addr, value) = match preds[..] {
                    [addr, value] => (addr, value),
                    _ => return,
                };
                let addr_link = match self.repo.link(addr) {
                    Some(link) => link,
                    None => return,
                };
                self.repo
                    .structure_mut(addr_link.structure)
                    .constants
                    .remove(addr_link.offset);
                if let Some(value_link) = self.repo.link(value) {
                    // a pointer into the middle of a structure is not a field of its own
                    if value_link.offset == 0 {
                        self.repo.add_field(
                            addr_link.structure,
                            addr_link.offset,
                            value_link.structure,
                            true,
                        );
                        self.repo.add_link(node, value_link.structure, 0, false);
                    }
                } else if let Some(c) = self.repo.constant(value) {
                    self.repo
                        .structure_mut(addr_link.structure)
                        .constants
                        .insert(addr_link.offset, c);
                }
            }
            DataFlowNodeType::Unknown => {
                if n.is_variable() {
                    self.get_or_create_structure(node);
                }
            }
            DataFlowNodeType::Start => {
                self.get_or_create_structure(node);
            }
        }
    }

    /// A copy of a single node: it shares the structure of its predecessor, unless branch
    /// conditions guarantee field values the predecessor's structure does not, in which case it
    /// gets a more specific child structure.
    fn research_single_copy(&mut self, node: NodeRef, pred: NodeRef) {
        let pred_link = match self.repo.link(pred) {
            Some(link) => link,
            None => return,
        };
        let dataflow = self.dataflow;
        let n = dataflow.node(node);
        if n.offset == 0 {
            let block = n
                .value
                .and_then(|v| self.program.value(v).source())
                .map(|op| self.program.operation(op).block);
            let conditions = match block {
                Some(block) => self.find_conditions(block),
                None => Default::default(),
            };
            if let Some(new_conditions) = conditions.get(&pred_link.structure) {
                let new_cond_hash = new_conditions.hash();
                if new_cond_hash != self.repo.structure(pred_link.structure).conditions.hash() {
                    let structure = self.get_or_create_structure(node);
                    let new_hash = hash_all(new_cond_hash, &[pred_link.structure.0 as u64]);
                    if self.repo.stored_hash(node) != new_hash {
                        self.repo.mark_as_updated(structure);
                        self.repo.clear_structure(structure);
                        self.repo.set_stored_hash(node, new_hash);
                    }
                    self.repo.structure_mut(structure).conditions = new_conditions.clone();
                    self.repo.add_child(pred_link.structure, structure);
                    self.repo.add_output(pred_link.structure, structure);
                    return;
                }
            }
        }
        if let Some(link) = self.repo.link(node) {
            if link.own {
                self.repo.remove_structure(link.structure);
            }
        }
        self.repo
            .add_link(node, pred_link.structure, pred_link.offset + n.offset, false);
    }

    /// Several values meet (PHI, a parameter fed by several call sites): the node gets a structure
    /// of its own, the parent of the structures of all of them.
    fn research_confluence(&mut self, node: NodeRef, preds: &[NodeRef], next: &mut VecDeque<NodeRef>) {
        if let Some(link) = self.repo.link(node) {
            if !link.own {
                // used to be a copy of one of them: redo that structure from where it was made
                if let Some(source_node) = self.repo.structure(link.structure).source_node {
                    next.push_back(source_node);
                }
                self.repo.remove_structure(link.structure);
                return;
            }
        }
        let structure = self.get_or_create_structure(node);
        let pred_structures: Vec<StructureRef> = preds
            .iter()
            .filter_map(|p| self.repo.link(*p))
            .map(|l| l.structure)
            .collect();
        let new_hash = hash_all(
            0,
            &pred_structures.iter().map(|s| s.0 as u64).collect::<Vec<_>>(),
        );
        if self.repo.stored_hash(node) != new_hash {
            self.repo.mark_as_updated(structure);
            self.repo.clear_structure(structure);
            self.repo.set_stored_hash(node, new_hash);
        }
        for pred_structure in pred_structures {
            self.repo.add_child(structure, pred_structure);
            self.repo.add_output(pred_structure, structure);
        }
    }

    /// The field values the branch conditions of `block` guarantee, per structure
    fn find_conditions(&self, block: BlockRef) -> BTreeMap<StructureRef, ConstantSet> {
        let mut res: BTreeMap<StructureRef, ConstantSet> = Default::default();
        for cond in self.const_cond_repo.find_conditions(self.program, block) {
            if cond.cond_type != ConstantConditionType::Equal {
                continue;
            }
            let load_op = match self
                .program
                .value(cond.variable)
                .source()
                .and_then(|op| go_to_load_operation(self.program, op))
            {
                Some(op) => op,
                None => continue,
            };
            let address = match self.program.operation(load_op).unary_input() {
                Some(address) => address,
                None => continue,
            };
            let expr = get_linear_expr(self.program, address, false);
            let offset = expr.const_term_value();
            for term in to_base_terms(self.program, &expr, CONFIG.pointer_size) {
                if !self.program.value(term).is_variable() {
                    continue;
                }
                if let Some(link) = self.dataflow.get_node(term).and_then(|n| self.repo.link(n)) {
                    res.entry(link.structure)
                        .or_default()
                        .insert(offset, cond.value);
                }
            }
        }
        res
    }
}

/// The LOAD a value was copied from
fn go_to_load_operation(program: &Program, op: OperationRef) -> Option<OperationRef> {
    let mut op = op;
    loop {
        let operation = program.operation(op);
        match operation.id {
            OperationId::Copy | OperationId::Ref => {
                let input = operation.unary_input()?;
                op = program.value(input).source()?;
            }
            OperationId::Load => return Some(op),
            _ => return None,
        }
    }
}

/// A pipe turning the structure events of each commit into one [`StructureEvent::Updated`] per
/// touched structure, emitted once the commit ends. Removed structures are not reported.
pub fn structure_changes_pipe() -> EventPipe<Event> {
    let updated: Rc<RefCell<InsertionOrderedSet<StructureRef>>> = Default::default();
    let (pipe, commit_in) = EventPipe::optimized_commit(topic_filter::<Event, StructureEvent>, {
        let updated = updated.clone();
        move |next| loop {
            let structure = updated.borrow_mut().pop_front();
            match structure {
                Some(s) => next(&Event::Structure(StructureEvent::Updated(s))),
                None => break,
            }
        }
    });
    commit_in.subscribe_topic::<StructureEvent>(move |event| {
        let mut updated = updated.borrow_mut();
        match event {
            StructureEvent::Created(s) | StructureEvent::Updated(s) => {
                updated.insert(*s);
            }
            StructureEvent::Removed(s) => {
                updated.remove(s);
            }
            StructureEvent::ChildAdded { structure, child }
            | StructureEvent::ChildRemoved { structure, child } => {
                updated.insert(*structure);
                updated.insert(*child);
            }
            StructureEvent::LinkCreated { structure, .. } => {
                updated.insert(*structure);
            }
        }
    });
    pipe
}

/// Log structure events (at debug level)
pub fn log_structure_events(pipe: &EventPipe<Event>, repo: Rc<RefCell<StructureRepository>>) {
    pipe.subscribe_topic::<StructureEvent>(move |event| {
        let repo = match repo.try_borrow() {
            Ok(repo) => repo,
            Err(_) => return,
        };
        let name = |s: &StructureRef| repo.structure(*s).name.clone();
        match event {
            StructureEvent::ChildAdded { structure, child } => {
                debug!("Child added"; "structure" => name(structure), "child" => name(child));
            }
            StructureEvent::ChildRemoved { structure, child } => {
                debug!("Child removed"; "structure" => name(structure), "child" => name(child));
            }
            StructureEvent::LinkCreated {
                node,
                structure,
                offset,
            } => {
                debug!("Link created";
                    "node" => node.0,
                    "structure" => name(structure),
                    "offset" => format!("{:#x}", offset));
            }
            StructureEvent::Created(_) | StructureEvent::Updated(_) | StructureEvent::Removed(_) => {}
        }
    });
}

/// All structures with fields, constants or conditions:
///
/// ```text
/// struct B0:var5 : root_0x100 {
///     0x0: B0:var12
///     0x8: 0x5, 0x6
///     0x10 == 0x1
/// }
/// ```
///
/// Root structures come first, sorted by name, each followed by its descendants (breadth first,
/// children sorted by name); structures not reachable that way follow, sorted by name. Fields list
/// the structures of the values read from and written to them.
pub fn print_structures(repo: &StructureRepository) -> String {
    let by_name = |structures: &mut Vec<StructureRef>| {
        structures.sort_by(|a, b| {
            repo.structure(*a)
                .name
                .cmp(&repo.structure(*b).name)
                .then(a.cmp(b))
        })
    };
    let mut order: InsertionOrderedSet<StructureRef> = InsertionOrderedSet::new();
    let mut roots: Vec<StructureRef> = repo.root_structures().collect();
    by_name(&mut roots);
    for root in roots {
        let mut queue = VecDeque::from(vec![root]);
        while let Some(s) = queue.pop_front() {
            if !order.insert(s) {
                continue;
            }
            let mut childs: Vec<StructureRef> =
                repo.structure(s).childs.iter().copied().collect();
            by_name(&mut childs);
            queue.extend(childs);
        }
    }
    let mut rest: Vec<StructureRef> = repo.structures().collect();
    by_name(&mut rest);
    for s in rest {
        order.insert(s);
    }

    let mut blocks = vec![];
    for s in order.iter() {
        let structure = repo.structure(*s);
        if structure.fields.is_empty()
            && structure.constants.is_empty()
            && structure.conditions.is_empty()
        {
            continue;
        }
        blocks.push(print_structure(repo, *s));
    }
    blocks.join("\n\n")
}

fn print_structure(repo: &StructureRepository, structure: StructureRef) -> String {
    let s = repo.structure(structure);
    let names = |structures: &BTreeSet<StructureRef>| {
        let mut names: Vec<&str> = structures
            .iter()
            .map(|s| repo.structure(*s).name.as_str())
            .collect();
        names.sort_unstable();
        names.join(", ")
    };
    let hex_values = |values: &BTreeSet<u64>| {
        values
            .iter()
            .map(|v| format!("{:#x}", v))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut lines = vec![];
    if s.parents.is_empty() {
        lines.push(format!("struct {} {{", s.name));
    } else {
        lines.push(format!("struct {} : {} {{", s.name, names(&s.parents)));
    }
    let offsets: BTreeSet<u64> = s
        .fields
        .keys()
        .chain(s.constants.values().keys())
        .chain(s.conditions.values().keys())
        .copied()
        .collect();
    for offset in offsets {
        if let Some(field) = s.fields.get(&offset) {
            let field = repo.structure(*field);
            if field.childs.is_empty() {
                lines.push(format!("    {:#x}: {}", offset, field.name));
            } else {
                lines.push(format!("    {:#x}: {}", offset, names(&field.childs)));
            }
        }
        if let Some(values) = s.constants.values().get(&offset) {
            lines.push(format!("    {:#x}: {}", offset, hex_values(values)));
        }
        if let Some(values) = s.conditions.values().get(&offset) {
            lines.push(format!("    {:#x} == {}", offset, hex_values(values)));
        }
    }
    lines.push("}".to_string());
    lines.join("\n")
}
