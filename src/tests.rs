use crate::containers::InsertionOrderedSet;
use crate::dataflow::{DataFlowEvent, DataFlowNodeType, DataFlowRepository};
use crate::events::{topic_filter, CommitEvent, CommitScope, Event, EventPipe};
use crate::ircode::{
    FunctionRef, IRcodeEvent, OperationId, OperationKind, Program, ValueKind, ValueRef,
};
use crate::pcode::{BlockRef, Graph, InstructionId, InstructionOffset, Varnode};
use crate::pcode_parser::parse_listing;
use crate::semantics::{DataType, Semantics, SymbolTable};
use crate::session::Session;
use std::cell::RefCell;
use std::rc::Rc;

fn session(listing: &str) -> Session {
    Session::from_listing(listing, &[]).expect("listing should parse")
}

fn first_function(session: &Session) -> FunctionRef {
    session.functions()[0]
}

/// The output of the operation of `function` named `name`
fn variable(program: &Program, function: FunctionRef, name: &str) -> ValueRef {
    program
        .function_variables(function)
        .into_iter()
        .find(|v| program.variable_name(*v) == name)
        .unwrap_or_else(|| panic!("no variable {}", name))
}

const GLOBAL_VAR_ASSIGNMENT: &str = "
    r10:8 = INT_ADD rip:8, 0x10:8
    STORE r10:8, xmm0:Da
    rax:4 = LOAD r10:8
";

const IF_ELSE: &str = "
    zf:1 = INT_EQUAL rcx:8, 0x5:8
    CBRANCH <then>, zf:1
    rax:8 = COPY 0x1:8
    BRANCH <end>
    <then>:
    rax:8 = COPY 0x2:8
    <end>:
    RETURN
";

#[test]
fn parse_labels_and_varnodes() {
    let instructions = parse_listing(
        "
        rax:1:1 = COPY 2:1          // second byte
        CBRANCH <target>, zf:1
        xmm0:Db = COPY $U1:4
        <target>:
        $2:8 = INT_ADD rip:8, -1:8
        ",
    )
    .unwrap();
    assert_eq!(instructions.len(), 4);
    assert_eq!(instructions[3].offset, InstructionOffset::new(3, 0));

    let rax = instructions[0].output.unwrap();
    let rax = rax.register().unwrap();
    assert_eq!((rax.size, rax.bit_offset), (1, 8));

    assert_eq!(instructions[1].id, InstructionId::CBranch);
    assert_eq!(
        instructions[1].input0.and_then(|v| v.target()),
        Some(InstructionOffset::new(3, 0))
    );

    let xmm0 = instructions[2].output.unwrap();
    let xmm0 = xmm0.register().unwrap();
    assert_eq!((xmm0.size, xmm0.bit_offset), (4, 32));

    assert_eq!(
        instructions[3].input1,
        Some(Varnode::constant(u64::MAX, 8))
    );
    assert_eq!(
        instructions[3].output.map(|v| v.register().map(|r| r.reg_type)),
        instructions[2]
            .input0
            .map(|v| v.register().map(|r| r.reg_type))
    );
}

#[test]
fn parse_error_names_line() {
    let err = parse_listing("rax:8 = COPY 0x1:8\n\nrax:8 = FROB rax:8").unwrap_err();
    assert_eq!(err.line, 3);
    assert!(err.to_string().starts_with("line 3:"));

    assert!(parse_listing("BRANCH <nowhere>").is_err());
    assert!(parse_listing("rax:8 = COPY 1").is_err());
}

#[test]
fn graph_levels_and_successors() {
    let mut graph = Graph::new(parse_listing(IF_ELSE).unwrap());
    assert_eq!(graph.explore(InstructionOffset::new(0, 0)), vec![0]);
    // already explored
    assert!(graph.explore(InstructionOffset::new(0, 0)).is_empty());

    let function = &graph.functions[0];
    let blocks: Vec<(String, usize)> = function
        .blocks
        .iter()
        .map(|b| (graph.block(*b).name(), graph.block(*b).level))
        .collect();
    assert_eq!(
        blocks,
        vec![
            ("B0".to_string(), 1),
            ("B2".to_string(), 2),
            ("B4".to_string(), 2),
            ("B5".to_string(), 3),
        ]
    );

    let entry = graph.block(function.entry);
    let name = |b: Option<BlockRef>| b.map(|b| graph.block(b).name());
    assert_eq!(name(entry.near), Some("B2".to_string()));
    assert_eq!(name(entry.far), Some("B4".to_string()));
    let end = graph.block_at(InstructionOffset::new(5, 0)).unwrap();
    assert_eq!(graph.block(end).referenced_blocks.len(), 2);
}

#[test]
fn nested_commits_reach_commit_pipes_once() {
    let pipe: EventPipe<Event> = EventPipe::new();
    let plain_log = Rc::new(RefCell::new(vec![]));
    let commit_log = Rc::new(RefCell::new(vec![]));
    {
        let plain_log = plain_log.clone();
        pipe.subscribe_topic::<CommitEvent>(move |e| plain_log.borrow_mut().push(*e));
    }
    let commit_pipe = pipe.connect(EventPipe::commit());
    {
        let commit_log = commit_log.clone();
        commit_pipe.subscribe_topic::<CommitEvent>(move |e| commit_log.borrow_mut().push(*e));
    }

    {
        let _outer = CommitScope::new(&pipe);
        let _inner = CommitScope::new(&pipe);
    }
    assert_eq!(plain_log.borrow().len(), 4);
    assert_eq!(
        *commit_log.borrow(),
        vec![CommitEvent::Begin, CommitEvent::End]
    );
}

#[test]
fn optimized_commit_deduplicates_and_drops_undone_work() {
    let pending: Rc<RefCell<InsertionOrderedSet<BlockRef>>> = Default::default();
    let (optimized, commit_in) =
        EventPipe::optimized_commit(topic_filter::<Event, IRcodeEvent>, {
            let pending = pending.clone();
            move |next| loop {
                let block = pending.borrow_mut().pop_front();
                match block {
                    Some(b) => next(&Event::IRcode(IRcodeEvent::BlockCreated(b))),
                    None => break,
                }
            }
        });
    {
        let pending = pending.clone();
        commit_in.subscribe_topic::<IRcodeEvent>(move |event| match event {
            IRcodeEvent::BlockCreated(b) => {
                pending.borrow_mut().insert(*b);
            }
            IRcodeEvent::BlockRemoved(b) => {
                pending.borrow_mut().remove(b);
            }
            _ => {}
        });
    }

    let pipe: EventPipe<Event> = EventPipe::new();
    let output = pipe.connect(optimized);
    let received = Rc::new(RefCell::new(vec![]));
    {
        let received = received.clone();
        output.subscribe_topic::<IRcodeEvent>(move |e| received.borrow_mut().push(e.clone()));
    }

    {
        let _commit = CommitScope::new(&pipe);
        for block in [1, 2, 1] {
            pipe.send(&Event::IRcode(IRcodeEvent::BlockCreated(BlockRef(block))));
        }
        pipe.send(&Event::IRcode(IRcodeEvent::BlockRemoved(BlockRef(2))));
        // other topics never make it through
        pipe.send(&Event::Commit(CommitEvent::Begin));
        pipe.send(&Event::Commit(CommitEvent::End));
        assert!(received.borrow().is_empty());
    }
    assert_eq!(
        *received.borrow(),
        vec![IRcodeEvent::BlockCreated(BlockRef(1))]
    );

    // outside of a commit, events pass straight through
    pipe.send(&Event::IRcode(IRcodeEvent::BlockRemoved(BlockRef(7))));
    assert_eq!(received.borrow().len(), 2);
}

#[test]
fn dataflow_edges_are_idempotent() {
    let session = session("rax:8 = COPY 0x1:8\nrcx:8 = COPY rax:8");
    let function = first_function(&session);
    session.decompile_function(function);
    let program = session.program.borrow();
    let var1 = variable(&program, function, "var1");

    let mut repo = DataFlowRepository::new();
    let start = repo.global_start_node();
    let node = repo.get_or_create_node(&program, var1, DataFlowNodeType::Copy, 0);
    assert!(repo.add_successor(start, node));
    assert!(!repo.add_successor(start, node));
    assert_eq!(repo.node(node).predecessors, vec![start]);
    assert_eq!(repo.node(start).successors, vec![node]);
    assert_eq!(
        repo.get_or_create_node(&program, var1, DataFlowNodeType::Write, 0),
        node
    );
    assert_eq!(repo.node(node).node_type, DataFlowNodeType::Copy);

    assert!(repo.remove_successor(start, node));
    assert!(!repo.remove_successor(start, node));
    assert!(repo.node(node).predecessors.is_empty());
}

#[test]
fn removed_node_keeps_its_edges() {
    let session = session("rax:8 = COPY 0x1:8");
    let function = first_function(&session);
    session.decompile_function(function);
    let program = session.program.borrow();
    let var1 = variable(&program, function, "var1");

    let mut repo = DataFlowRepository::new();
    let start = repo.global_start_node();
    let node = repo.get_or_create_node(&program, var1, DataFlowNodeType::Copy, 0);
    repo.add_successor(start, node);
    repo.take_events();

    repo.remove_node(node);
    assert_eq!(repo.take_events(), vec![DataFlowEvent::NodeRemoved(node)]);
    assert!(repo.node(node).removed);
    assert_eq!(repo.node(node).predecessors, vec![start]);
    assert!(repo.node(start).successors.is_empty());
    assert_eq!(repo.get_node(var1), None);
}

#[test]
fn generate_register_copies() {
    let session = session("rax:8 = COPY 0x1:8\nrax:8 = INT_ADD rax:8, 0x1:8");
    let function = first_function(&session);
    session.decompile_function(function);
    assert_eq!(
        session.dump_ircode(function),
        "Block B0(level: 1):
    var1[rax]:8 = COPY 0x1:8
    var2[rax]:8 = INT_ADD var1, 0x1:8"
    );
}

#[test]
fn generate_extract_for_partial_read() {
    let session = session("rax:8 = COPY 0x1:8\nrcx:4 = COPY rax:4");
    let function = first_function(&session);
    session.decompile_function(function);
    assert_eq!(
        session.dump_ircode(function),
        "Block B0(level: 1):
    var1[rax]:8 = COPY 0x1:8
    var2:4 = EXTRACT var1, 0
    var3[rcx]:4 = COPY var2"
    );
}

#[test]
fn generate_phi_after_branches() {
    let listing = IF_ELSE.replace("RETURN", "rdx:8 = COPY rax:8");
    let session = session(&listing);
    let function = first_function(&session);
    session.decompile_function(function);
    let ircode = session.dump_ircode(function);
    let end_block = ircode
        .split("Block B5(level: 3):")
        .nth(1)
        .expect("end block is printed");
    assert!(end_block.contains("= PHI "), "{}", ircode);
    assert!(end_block.contains("[rdx]:8 = COPY "), "{}", ircode);
}

#[test]
fn generate_global_var_assignment() {
    let session = session(GLOBAL_VAR_ASSIGNMENT);
    session.decompile();
    let function = first_function(&session);
    assert_eq!(
        session.dump_ircode(function),
        "Block B0(level: 1):
    var1:8 = LOAD rip
    var2[r10]:8 = INT_ADD var1, 0x10:8
    var3:4 = LOAD xmm0 // param1
    var4[var2]:4 = COPY var3
    var5[rax]:4 = COPY var4 // return"
    );
    assert_eq!(
        session.dump_data_flow(function),
        "var1 <- Copy Start
var2 <- Copy var1 + 0x10
var3 <- Unknown
var4 <- Write var2
var4 <- Write var3
var5 <- Copy var4"
    );
    assert_eq!(
        session.dump_signature(function),
        "signature fastcall uint32_t (float param1)"
    );
}

#[test]
fn research_global_var_structure() {
    let session = session(GLOBAL_VAR_ASSIGNMENT);
    session.decompile();
    let structures = session.dump_structures();
    assert!(structures.starts_with("struct root {"), "{}", structures);
    assert!(structures.contains("    0x10: B0:var3"), "{}", structures);
}

#[test]
fn research_global_var_semantics() {
    let session = session(GLOBAL_VAR_ASSIGNMENT);
    session.decompile();
    let function = first_function(&session);
    let program = session.program.borrow();
    let semantics = session.semantics.borrow();
    let facts = |name: &str| -> Vec<Semantics> {
        semantics
            .semantics(variable(&program, function, name))
            .copied()
            .collect()
    };

    assert!(facts("var1").contains(&Semantics::SymbolPointer {
        table: SymbolTable::Global,
        offset: 0
    }));
    assert!(facts("var2").contains(&Semantics::SymbolPointer {
        table: SymbolTable::Global,
        offset: 0x10
    }));
    let var3 = facts("var3");
    assert!(var3.contains(&Semantics::DataType(DataType::Float { size: 4 })));
    assert!(var3.contains(&Semantics::FunctionParameter { function, index: 0 }));
    assert!(facts("var4").contains(&Semantics::Symbol {
        table: SymbolTable::Global,
        offset: 0x10,
        size: 4
    }));
    assert!(facts("var5").contains(&Semantics::FunctionReturn { function }));

    drop(semantics);
    drop(program);
    let dump = session.dump_semantics(function);
    assert!(dump.contains("var3: float"), "{}", dump);
}

#[test]
fn research_return_through_call() {
    let session = session(
        "
        CALL <getValue>
        RETURN
        <getValue>:
        rax:4 = COPY 1000:4
        RETURN
        ",
    );
    session.decompile();
    let main = session.function_at(0).unwrap();
    let get_value = session.function_at(2).unwrap();

    assert_eq!(
        session.dump_ircode(get_value),
        "Block B2(level: 1):
    var1[rax]:4 = COPY 0x3e8:4 // return"
    );
    assert_eq!(
        session.dump_ircode(main),
        "Block B0(level: 1):
    var1[rax]:4 = CALL 0x200:8 // return"
    );
    assert_eq!(session.dump_signature(get_value), "signature fastcall uint32_t ()");
    assert_eq!(session.dump_signature(main), "signature fastcall uint32_t ()");
}

#[test]
fn const_conditions_of_branches() {
    let session = session(IF_ELSE);
    session.decompile();
    let function = first_function(&session);
    assert_eq!(
        session.dump_conditions(function),
        "Block B2:
    var1 != 5
Block B4:
    var1 == 5"
    );
    // both branches reach the join block
    let join = session.program.borrow().function(function).blocks[3];
    let program = session.program.borrow();
    assert!(session
        .const_conditions
        .find_conditions(&program, join)
        .is_empty());
}

#[test]
fn remove_block_sends_event() {
    let session = session(IF_ELSE);
    session.decompile();
    let removed = Rc::new(RefCell::new(vec![]));
    {
        let removed = removed.clone();
        session.pipe.subscribe_topic::<IRcodeEvent>(move |e| {
            if let IRcodeEvent::BlockRemoved(b) = e {
                removed.borrow_mut().push(*b);
            }
        });
    }
    let block = session
        .program
        .borrow()
        .function(first_function(&session))
        .blocks[2];
    session.remove_block(block);
    assert_eq!(*removed.borrow(), vec![block]);
    assert!(!session
        .program
        .borrow()
        .function(first_function(&session))
        .blocks
        .contains(&block));
}

/// The printed IR-code from the header of `block` on
fn block_section<'a>(ircode: &'a str, block: &str) -> &'a str {
    ircode
        .split(&format!("Block {}(", block))
        .nth(1)
        .unwrap_or_else(|| panic!("block {} is not printed:\n{}", block, ircode))
}

#[test]
fn generate_phi_for_write_on_one_path() {
    let session = session(
        "
        r8:8 = COPY r9:8
        zf:1 = INT_EQUAL rcx:8, 0x0:8
        CBRANCH <end>, zf:1
        STORE r9:8, rdx:8
        <end>:
        rax:8 = LOAD r9:8
        RETURN
        ",
    );
    let function = first_function(&session);
    session.decompile_function(function);
    let ircode = session.dump_ircode(function);
    let end_block = block_section(&ircode, "B4");
    assert_eq!(end_block.matches("= PHI ").count(), 1, "{}", ircode);
    assert_eq!(end_block.matches("[rax]:8 = COPY ").count(), 1, "{}", ircode);
}

#[test]
fn generate_no_phi_for_same_value_on_both_paths() {
    let session = session(
        "
        rax:8 = COPY 0x7:8
        zf:1 = INT_EQUAL rcx:8, 0x5:8
        CBRANCH <then>, zf:1
        rcx:8 = COPY 0x1:8
        BRANCH <end>
        <then>:
        rcx:8 = COPY 0x2:8
        <end>:
        rdx:8 = COPY rax:8
        ",
    );
    let function = first_function(&session);
    session.decompile_function(function);
    let ircode = session.dump_ircode(function);
    let end_block = block_section(&ircode, "B6");
    assert!(!end_block.contains("PHI"), "{}", ircode);
    assert!(end_block.contains("= REF var1"), "{}", ircode);
    assert!(end_block.contains("[rdx]:8 = COPY "), "{}", ircode);
}

#[test]
fn generate_loop_terminates() {
    let session = session(
        "
        rax:8 = COPY 0x0:8
        <loop>:
        rax:8 = INT_ADD rax:8, 0x1:8
        zf:1 = INT_NOTEQUAL rax:8, 0xa:8
        CBRANCH <loop>, zf:1
        RETURN
        ",
    );
    let function = first_function(&session);
    session.decompile_function(function);
    let ircode = session.dump_ircode(function);
    let loop_block = block_section(&ircode, "B1");
    assert!(loop_block.contains("INT_ADD"), "{}", ircode);
    assert!(loop_block.contains("= REF var1"), "{}", ircode);
    assert!(!ircode.contains("PHI"), "{}", ircode);
}

#[test]
fn generate_array_load() {
    let session = session(
        "
        rdx:8 = INT_MULT rdx:8, 0x4:8
        r8:8 = INT_ADD rcx:8, rdx:8
        rax:4 = LOAD r8:8
        ",
    );
    let function = first_function(&session);
    session.decompile_function(function);
    assert_eq!(
        session.dump_ircode(function),
        "Block B0(level: 1):
    var1:8 = LOAD rdx
    var2[rdx]:8 = INT_MULT var1, 0x4:8
    var3:8 = LOAD rcx
    var4[r8]:8 = INT_ADD var3, var2
    var5:4 = LOAD var4
    var6[rax]:4 = COPY var5"
    );
}

#[test]
fn load_address_lookup_leaves_no_values_behind() {
    let session = session("rax:8 = LOAD rcx:8\nrdx:8 = LOAD rax:8");
    let function = first_function(&session);
    session.decompile_function(function);
    let program = session.program.borrow();
    for i in 0..program.value_count() {
        assert!(
            !matches!(program.value(ValueRef(i)).kind, ValueKind::Variable { id: 0, .. }),
            "value {} was made by a lookup",
            i
        );
    }
}

#[test]
fn research_stack_argument_of_call() {
    let session = session(
        "
        r11:8 = INT_ADD rsp:8, 0x28:8
        STORE r11:8, 0x7:8
        CALL <callee>
        RETURN
        <callee>:
        r10:8 = INT_ADD rsp:8, 0x28:8
        rax:8 = LOAD r10:8
        RETURN
        ",
    );
    session.decompile();
    let main = session.function_at(0).unwrap();
    let callee = session.function_at(4).unwrap();
    let signature = session.dump_signature(callee);
    assert!(signature.ends_with(", uint64_t param5)"), "{}", signature);

    let program = session.program.borrow();
    let call = program
        .function(main)
        .blocks
        .iter()
        .flat_map(|b| program.block(*b).operations.iter())
        .map(|op| program.operation(*op))
        .find(|op| op.id == OperationId::Call)
        .expect("main calls the callee");
    let arguments = match &call.kind {
        OperationKind::Call { arguments, .. } => arguments.clone(),
        kind => panic!("not a call: {:?}", kind),
    };
    assert_eq!(arguments.len(), 5);
    // the fifth argument is the value stored above the shadow space
    let stored = program.value(arguments[4]).source().unwrap();
    assert_eq!(
        program.operation(stored).instruction,
        InstructionOffset::new(1, 0)
    );

    let dataflow = session.dataflow.borrow();
    let node = |v: ValueRef| dataflow.get_node(v).expect("value has a data-flow node");
    let param = program.function(callee).param_vars[4].expect("param5 is mapped");
    assert!(dataflow
        .node(node(param))
        .predecessors
        .contains(&node(arguments[4])));
    let ret = program.function(callee).return_var.expect("return is mapped");
    assert!(dataflow
        .node(node(call.output))
        .predecessors
        .contains(&node(ret)));
}

#[test]
fn research_conditional_structures_per_value() {
    let session = session(
        "
        rax:8 = LOAD rcx:8
        zf:1 = INT_EQUAL rax:8, 0x1:8
        CBRANCH <one>, zf:1
        zf:1 = INT_EQUAL rax:8, 0x2:8
        CBRANCH <two>, zf:1
        BRANCH <end>
        <one>:
        rdx:8 = INT_ADD rcx:8, 0x10:8
        STORE rdx:8, 0x64:4
        BRANCH <end>
        <two>:
        rdx:8 = INT_ADD rcx:8, 0x18:8
        STORE rdx:8, 0xc8:4
        <end>:
        RETURN
        ",
    );
    session.decompile();
    let dump = session.dump_structures();
    let structures: Vec<&str> = dump.split("\n\n").collect();
    let with = |line: &str| -> &str {
        structures
            .iter()
            .copied()
            .find(|s| s.contains(line))
            .unwrap_or_else(|| panic!("no structure with {:?}:\n{}", line, dump))
    };
    assert!(with("    0x0 == 0x1").contains("    0x10: 0x64"), "{}", dump);
    assert!(with("    0x0 == 0x2").contains("    0x18: 0xc8"), "{}", dump);
    let parent = with("struct B0:var1 {");
    assert!(!parent.contains("0x64"), "{}", dump);
    assert!(!parent.contains("0xc8"), "{}", dump);
}

#[test]
fn removed_block_leaves_no_conditions() {
    let session = session(IF_ELSE);
    session.decompile();
    let function = first_function(&session);
    let blocks = session.program.borrow().function(function).blocks.clone();
    let (else_block, then_block) = (blocks[1], blocks[2]);
    session.remove_block(then_block);

    let program = session.program.borrow();
    assert!(session
        .const_conditions
        .find_conditions(&program, then_block)
        .is_empty());
    assert_eq!(
        session
            .const_conditions
            .find_conditions(&program, else_block)
            .len(),
        1
    );
    drop(program);
    assert_eq!(session.dump_conditions(function), "Block B2:\n    var1 != 5");
}
