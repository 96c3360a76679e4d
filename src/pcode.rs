//! The p-code consumed by the IR-code generator.
//!
//! P-code is a register transfer language: every instruction reads at most two operands
//! ([`Varnode`]s: registers or constants) and writes at most one register. Memory is only reached
//! through `LOAD` and `STORE`. Instructions are grouped into basic [`Block`]s, and the blocks
//! reachable from an entry point form a [`FunctionGraph`]; all of them live in a [`Graph`].

use crate::containers::unordered::UnorderedSet;
use crate::log::*;
use std::collections::BTreeMap;

pub type RegisterId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum RegisterType {
    Generic,
    Vector,
    Flag,
    Virtual,
}

/// An occurrence of (a part of) a register.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Register {
    pub id: RegisterId,
    /// Distinguishes virtual registers, `0` for all others
    pub index: usize,
    pub reg_type: RegisterType,
    /// Offset (in bits) of the accessed part within the full register
    pub bit_offset: usize,
    /// Accessed size, in bytes
    pub size: usize,
}

/// Names, ids, types and full sizes of the registers of the (x86-64) platform.
const REGISTERS: &[(&str, RegisterId, RegisterType, usize)] = &[
    ("rax", 0, RegisterType::Generic, 8),
    ("rcx", 1, RegisterType::Generic, 8),
    ("rdx", 2, RegisterType::Generic, 8),
    ("rbx", 3, RegisterType::Generic, 8),
    ("rsp", 4, RegisterType::Generic, 8),
    ("rbp", 5, RegisterType::Generic, 8),
    ("rsi", 6, RegisterType::Generic, 8),
    ("rdi", 7, RegisterType::Generic, 8),
    ("r8", 8, RegisterType::Generic, 8),
    ("r9", 9, RegisterType::Generic, 8),
    ("r10", 10, RegisterType::Generic, 8),
    ("r11", 11, RegisterType::Generic, 8),
    ("r12", 12, RegisterType::Generic, 8),
    ("r13", 13, RegisterType::Generic, 8),
    ("r14", 14, RegisterType::Generic, 8),
    ("r15", 15, RegisterType::Generic, 8),
    ("rip", 16, RegisterType::Generic, 8),
    ("xmm0", 17, RegisterType::Vector, 16),
    ("xmm1", 18, RegisterType::Vector, 16),
    ("xmm2", 19, RegisterType::Vector, 16),
    ("xmm3", 20, RegisterType::Vector, 16),
    ("xmm4", 21, RegisterType::Vector, 16),
    ("xmm5", 22, RegisterType::Vector, 16),
    ("xmm6", 23, RegisterType::Vector, 16),
    ("xmm7", 24, RegisterType::Vector, 16),
    ("zf", 40, RegisterType::Flag, 1),
    ("cf", 41, RegisterType::Flag, 1),
    ("sf", 42, RegisterType::Flag, 1),
    ("of", 43, RegisterType::Flag, 1),
];

impl Register {
    pub const INSTRUCTION_POINTER_ID: RegisterId = 16;
    pub const STACK_POINTER_ID: RegisterId = 4;
    pub const VIRTUAL_ID: RegisterId = 1000;

    /// The full register named `name`, if any
    pub fn by_name(name: &str) -> Option<Self> {
        REGISTERS
            .iter()
            .find(|(n, ..)| *n == name)
            .map(|(_, id, reg_type, size)| Self {
                id: *id,
                index: 0,
                reg_type: *reg_type,
                bit_offset: 0,
                size: *size,
            })
    }

    /// The register with id `id` accessed with size `size` (from its lowest byte).
    pub fn by_id(id: RegisterId, size: usize) -> Option<Self> {
        REGISTERS
            .iter()
            .find(|(_, i, ..)| *i == id)
            .map(|(_, id, reg_type, _)| Self {
                id: *id,
                index: 0,
                reg_type: *reg_type,
                bit_offset: 0,
                size,
            })
    }

    pub fn virtual_register(index: usize, size: usize) -> Self {
        Self {
            id: Self::VIRTUAL_ID,
            index,
            reg_type: RegisterType::Virtual,
            bit_offset: 0,
            size,
        }
    }

    pub fn is_instruction_pointer(&self) -> bool {
        self.id == Self::INSTRUCTION_POINTER_ID
    }

    pub fn is_stack_pointer(&self) -> bool {
        self.id == Self::STACK_POINTER_ID
    }

    /// The name of the full register
    pub fn name(&self) -> String {
        if self.reg_type == RegisterType::Virtual {
            return format!("$U{:x}", self.index);
        }
        REGISTERS
            .iter()
            .find(|(_, id, ..)| *id == self.id)
            .map(|(n, ..)| n.to_string())
            .unwrap_or_else(|| format!("reg{}", self.id))
    }
}

/// An operand of a p-code instruction
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Varnode {
    Register(Register),
    Constant {
        value: u64,
        size: usize,
        /// Set for branch/call targets, whose value is a full instruction offset
        is_address: bool,
    },
}

impl Varnode {
    pub fn constant(value: u64, size: usize) -> Self {
        Varnode::Constant {
            value,
            size,
            is_address: false,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Varnode::Register(r) => r.size,
            Varnode::Constant { size, .. } => *size,
        }
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Varnode::Register(_))
    }

    pub fn register(&self) -> Option<&Register> {
        match self {
            Varnode::Register(r) => Some(r),
            Varnode::Constant { .. } => None,
        }
    }

    /// The target of a branch or call
    pub fn target(&self) -> Option<InstructionOffset> {
        match self {
            Varnode::Constant { value, .. } => Some(InstructionOffset::from_full(*value)),
            Varnode::Register(_) => None,
        }
    }
}

impl std::fmt::Display for Varnode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Varnode::Register(r) => write!(f, "{}", r.name()),
            Varnode::Constant { value, size, .. } => write!(f, "{:#x}:{}", value, size),
        }
    }
}

macro_rules! instruction_ids {
    ($($id:ident => $name:literal),* $(,)?) => {
        /// A p-code operation
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
        pub enum InstructionId {
            $($id),*
        }

        impl InstructionId {
            pub fn name(&self) -> &'static str {
                match self {
                    $(InstructionId::$id => $name),*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(InstructionId::$id),)*
                    _ => None,
                }
            }
        }
    };
}

instruction_ids! {
    Nop => "NOP",
    Unknown => "UNKNOWN",
    Copy => "COPY",
    Load => "LOAD",
    Store => "STORE",
    Branch => "BRANCH",
    CBranch => "CBRANCH",
    BranchInd => "BRANCHIND",
    Call => "CALL",
    CallInd => "CALLIND",
    Return => "RETURN",
    IntEqual => "INT_EQUAL",
    IntNotEqual => "INT_NOTEQUAL",
    IntSLess => "INT_SLESS",
    IntSLessEqual => "INT_SLESSEQUAL",
    IntLess => "INT_LESS",
    IntLessEqual => "INT_LESSEQUAL",
    IntZext => "INT_ZEXT",
    IntSext => "INT_SEXT",
    IntAdd => "INT_ADD",
    IntSub => "INT_SUB",
    IntCarry => "INT_CARRY",
    IntSCarry => "INT_SCARRY",
    IntSBorrow => "INT_SBORROW",
    Int2Comp => "INT_2COMP",
    IntNegate => "INT_NEGATE",
    IntXor => "INT_XOR",
    IntAnd => "INT_AND",
    IntOr => "INT_OR",
    IntLeft => "INT_LEFT",
    IntRight => "INT_RIGHT",
    IntSRight => "INT_SRIGHT",
    IntMult => "INT_MULT",
    IntDiv => "INT_DIV",
    IntSDiv => "INT_SDIV",
    IntRem => "INT_REM",
    IntSRem => "INT_SREM",
    BoolNegate => "BOOL_NEGATE",
    BoolXor => "BOOL_XOR",
    BoolAnd => "BOOL_AND",
    BoolOr => "BOOL_OR",
    FloatEqual => "FLOAT_EQUAL",
    FloatNotEqual => "FLOAT_NOTEQUAL",
    FloatLess => "FLOAT_LESS",
    FloatLessEqual => "FLOAT_LESSEQUAL",
    FloatNan => "FLOAT_NAN",
    FloatAdd => "FLOAT_ADD",
    FloatDiv => "FLOAT_DIV",
    FloatMult => "FLOAT_MULT",
    FloatSub => "FLOAT_SUB",
    FloatNeg => "FLOAT_NEG",
    FloatAbs => "FLOAT_ABS",
    FloatSqrt => "FLOAT_SQRT",
}

impl InstructionId {
    pub fn is_commutative(&self) -> bool {
        use InstructionId::*;
        matches!(
            self,
            IntAdd
                | IntMult
                | IntXor
                | IntAnd
                | IntOr
                | IntEqual
                | IntNotEqual
                | IntCarry
                | IntSCarry
                | BoolXor
                | BoolAnd
                | BoolOr
                | FloatAdd
                | FloatMult
                | FloatEqual
                | FloatNotEqual
        )
    }

    /// Does an instruction with this id end a basic block
    pub fn is_terminator(&self) -> bool {
        use InstructionId::*;
        matches!(self, Branch | CBranch | BranchInd | Return)
    }
}

/// Location of an instruction: the machine instruction's byte offset, and the index of the p-code
/// instruction within it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Default)]
pub struct InstructionOffset {
    pub byte_offset: u64,
    pub index: u64,
}

impl InstructionOffset {
    pub fn new(byte_offset: u64, index: u64) -> Self {
        Self { byte_offset, index }
    }

    pub fn from_full(full: u64) -> Self {
        Self {
            byte_offset: full >> 8,
            index: full & 0xff,
        }
    }

    pub fn full(&self) -> u64 {
        (self.byte_offset << 8) | self.index
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub id: InstructionId,
    pub input0: Option<Varnode>,
    pub input1: Option<Varnode>,
    pub output: Option<Varnode>,
    pub offset: InstructionOffset,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(out) = &self.output {
            write!(f, "{} = ", out)?;
        }
        write!(f, "{}", self.id.name())?;
        let inputs = [self.input0, self.input1];
        for (i, v) in inputs.iter().flatten().enumerate() {
            write!(f, "{}{}", if i == 0 { " " } else { ", " }, v)?;
        }
        Ok(())
    }
}

/// Index of a block in its [`Graph`]. IR-code blocks share the index of their p-code block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct BlockRef(pub usize);

#[derive(Clone, Debug)]
pub struct Block {
    pub index: usize,
    pub instructions: Vec<InstructionOffset>,
    /// Fall-through successor
    pub near: Option<BlockRef>,
    /// Jump successor
    pub far: Option<BlockRef>,
    /// Predecessors, in the order their edges were made
    pub referenced_blocks: Vec<BlockRef>,
    /// 1 for the entry block, otherwise one more than the deepest forward predecessor
    pub level: usize,
    /// Index of the owning function graph in [`Graph::functions`]
    pub function: usize,
}

impl Block {
    pub fn min_offset(&self) -> InstructionOffset {
        self.instructions[0]
    }

    pub fn name(&self) -> String {
        format!("B{:x}", self.min_offset().byte_offset)
    }

    pub fn successors(&self) -> impl Iterator<Item = BlockRef> {
        self.near.into_iter().chain(self.far)
    }
}

#[derive(Clone, Debug)]
pub struct FunctionGraph {
    pub entry: BlockRef,
    /// All blocks of the function, sorted by level and offset
    pub blocks: Vec<BlockRef>,
}

/// All instructions, blocks and function graphs of a program
#[derive(Clone, Debug, Default)]
pub struct Graph {
    pub instructions: BTreeMap<InstructionOffset, Instruction>,
    pub blocks: Vec<Block>,
    pub functions: Vec<FunctionGraph>,
    block_at: BTreeMap<InstructionOffset, BlockRef>,
}

impl Graph {
    pub fn new(instructions: impl IntoIterator<Item = Instruction>) -> Self {
        Self {
            instructions: instructions.into_iter().map(|i| (i.offset, i)).collect(),
            ..Default::default()
        }
    }

    pub fn block(&self, block: BlockRef) -> &Block {
        &self.blocks[block.0]
    }

    pub fn instruction(&self, offset: InstructionOffset) -> Option<&Instruction> {
        self.instructions.get(&offset)
    }

    pub fn block_at(&self, offset: InstructionOffset) -> Option<BlockRef> {
        self.block_at.get(&offset).copied()
    }

    /// The function graph whose entry block starts at `offset`
    pub fn function_at(&self, offset: InstructionOffset) -> Option<usize> {
        let block = self.block_at(offset)?;
        self.functions.iter().position(|f| f.entry == block)
    }

    fn next_offset(&self, offset: InstructionOffset) -> Option<InstructionOffset> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.instructions
            .range((Excluded(offset), Unbounded))
            .next()
            .map(|(o, _)| *o)
    }

    /// Build the function graph starting at `entry`, and the ones of every function it (directly
    /// or indirectly) calls. Returns the indexes of the newly created function graphs.
    pub fn explore(&mut self, entry: InstructionOffset) -> Vec<usize> {
        let mut created = vec![];
        let mut pending = vec![entry];
        while let Some(entry) = pending.pop() {
            if self.block_at.contains_key(&entry) || !self.instructions.contains_key(&entry) {
                continue;
            }
            let (function, calls) = self.build_function(entry);
            created.push(function);
            pending.extend(calls.into_iter().rev());
        }
        created
    }

    /// Leader-based basic block construction for the code reachable from `entry`.
    fn build_function(&mut self, entry: InstructionOffset) -> (usize, Vec<InstructionOffset>) {
        let mut reachable: UnorderedSet<InstructionOffset> = Default::default();
        let mut leaders: UnorderedSet<InstructionOffset> = Default::default();
        let mut calls = vec![];
        leaders.insert(entry);
        let mut stack = vec![entry];
        while let Some(offset) = stack.pop() {
            let instr = match self.instructions.get(&offset) {
                Some(i) => i,
                None => continue,
            };
            if self.block_at.contains_key(&offset) || !reachable.insert(offset) {
                continue;
            }
            let next = self.next_offset(offset);
            let target = instr.input0.as_ref().and_then(|v| v.target());
            match instr.id {
                InstructionId::Branch | InstructionId::CBranch => {
                    if let Some(target) = target {
                        leaders.insert(target);
                        stack.push(target);
                    } else {
                        warn!("Branch without a constant target"; "offset" => ?offset);
                    }
                    if let Some(next) = next {
                        leaders.insert(next);
                        if instr.id == InstructionId::CBranch {
                            stack.push(next);
                        }
                    }
                }
                InstructionId::BranchInd | InstructionId::Return => {
                    if let Some(next) = next {
                        leaders.insert(next);
                    }
                }
                id => {
                    if id == InstructionId::Call {
                        calls.extend(target);
                    }
                    stack.extend(next);
                }
            }
        }

        // make the blocks
        let function = self.functions.len();
        let mut offsets: Vec<InstructionOffset> = reachable.iter().copied().collect();
        offsets.sort();
        let mut new_blocks: Vec<BlockRef> = vec![];
        for offset in offsets {
            let starts_block = leaders.contains(&offset)
                || new_blocks.last().map_or(true, |b| {
                    let last = *self.blocks[b.0].instructions.last().unwrap_or(&offset);
                    self.next_offset(last) != Some(offset)
                });
            if starts_block {
                let block = BlockRef(self.blocks.len());
                self.blocks.push(Block {
                    index: block.0,
                    instructions: vec![],
                    near: None,
                    far: None,
                    referenced_blocks: vec![],
                    level: 0,
                    function,
                });
                self.block_at.insert(offset, block);
                new_blocks.push(block);
            }
            if let Some(block) = new_blocks.last() {
                self.blocks[block.0].instructions.push(offset);
            }
        }

        // connect the blocks
        for &block in &new_blocks {
            let last = match self.blocks[block.0].instructions.last() {
                Some(l) => *l,
                None => continue,
            };
            let instr = &self.instructions[&last];
            let far = match instr.id {
                InstructionId::Branch | InstructionId::CBranch => instr
                    .input0
                    .as_ref()
                    .and_then(|v| v.target())
                    .and_then(|t| self.block_at(t)),
                _ => None,
            };
            let near = match instr.id {
                InstructionId::Branch | InstructionId::BranchInd | InstructionId::Return => None,
                _ => self.next_offset(last).and_then(|n| self.block_at(n)),
            };
            self.blocks[block.0].near = near;
            self.blocks[block.0].far = far;
            for succ in near.into_iter().chain(far) {
                if !self.blocks[succ.0].referenced_blocks.contains(&block) {
                    self.blocks[succ.0].referenced_blocks.push(block);
                }
            }
        }

        let entry_block = new_blocks[0];
        self.compute_levels(entry_block, &new_blocks);
        let mut blocks = new_blocks;
        blocks.sort_by_key(|b| (self.blocks[b.0].level, self.blocks[b.0].min_offset()));
        debug!("Function graph explored"; "entry" => ?entry, "blocks" => blocks.len());
        self.functions.push(FunctionGraph {
            entry: entry_block,
            blocks,
        });
        (function, calls)
    }

    /// Longest path from the entry over forward edges (edges into a block that is still on the DFS
    /// stack are back edges and are ignored).
    fn compute_levels(&mut self, entry: BlockRef, blocks: &[BlockRef]) {
        let mut back_edges: UnorderedSet<(BlockRef, BlockRef)> = Default::default();
        let mut on_stack: UnorderedSet<BlockRef> = Default::default();
        let mut visited: UnorderedSet<BlockRef> = Default::default();
        let mut post_order = vec![];
        // iterative DFS: (block, index of the next successor to look at)
        let mut stack = vec![(entry, 0usize)];
        visited.insert(entry);
        on_stack.insert(entry);
        while let Some(&(block, i)) = stack.last() {
            match self.blocks[block.0].successors().nth(i) {
                Some(succ) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    if on_stack.contains(&succ) {
                        back_edges.insert((block, succ));
                    } else if visited.insert(succ) {
                        on_stack.insert(succ);
                        stack.push((succ, 0));
                    }
                }
                None => {
                    on_stack.remove(&block);
                    post_order.push(block);
                    stack.pop();
                }
            }
        }
        for &block in blocks {
            self.blocks[block.0].level = 0;
        }
        self.blocks[entry.0].level = 1;
        for &block in post_order.iter().rev() {
            let level = self.blocks[block.0].level.max(1);
            let succs: Vec<BlockRef> = self.blocks[block.0].successors().collect();
            for succ in succs {
                if back_edges.contains(&(block, succ)) {
                    continue;
                }
                if self.blocks[succ.0].level < level + 1 {
                    self.blocks[succ.0].level = level + 1;
                }
            }
        }
    }
}
