//! Translation of p-code into IR-code.
//!
//! The generator works one block at a time. Registers and memory are both modelled as *memory
//! subspaces* keyed by a base address hash: writing a register or storing through a pointer
//! records the written variable in the block's subspace, and reading looks the requested byte
//! range up there, falling back to the predecessor blocks (through REF operations, joined by PHI
//! where paths disagree) and finally to a LOAD of the untouched background value.

use crate::containers::unordered::UnorderedMap;
use crate::containers::{BitMask, BitSet};
use crate::hashing::{hash_all, Hash};
use crate::ircode::{
    FunctionRef, IRcodeEvent, LinearExpression, MemoryAddress, Operation, OperationId,
    OperationKind, OperationRef, Program, Reference, ValueKind, ValueRef, ValueTag,
};
use crate::log::*;
use crate::config::CONFIG;
use crate::pcode::{
    BlockRef, Instruction, InstructionId, InstructionOffset, Register, RegisterType, Varnode,
};
use std::collections::VecDeque;

/// A variable satisfying (part of) a read, and the byte offset it lands at within the read.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct VariableReadInfo {
    variable: ValueRef,
    offset: u64,
}

type ReadInfos = VecDeque<VariableReadInfo>;

#[derive(Clone)]
struct CachedRead {
    infos: ReadInfos,
    /// The bits the cached read satisfied
    read_mask: BitMask,
}

/// State shared by the recursive walk over predecessors for one read.
struct BlockReadContext {
    mem_addr: MemoryAddress,
    read_size: usize,
    background_value: Option<ValueRef>,
    visited_blocks: BitSet,
    cache: UnorderedMap<(BlockRef, BitMask), CachedRead>,
}

pub struct IRcodeGenerator<'a> {
    program: &'a mut Program,
    block: BlockRef,
    function: FunctionRef,
    cur_instr: InstructionOffset,
    generation_enabled: bool,
    overwritten: Vec<ValueRef>,
    /// REF aliases made in this block, by reference hash
    refs: UnorderedMap<Hash, ValueRef>,
    generated: Vec<OperationRef>,
}

impl<'a> IRcodeGenerator<'a> {
    pub fn new(program: &'a mut Program, block: BlockRef) -> Self {
        let function = program.block(block).function;
        Self {
            program,
            block,
            function,
            cur_instr: Default::default(),
            generation_enabled: true,
            overwritten: vec![],
            refs: Default::default(),
            generated: vec![],
        }
    }

    /// The operations generated for the last ingested instruction
    pub fn generated_operations(&self) -> &[OperationRef] {
        &self.generated
    }

    pub fn ingest(&mut self, instr: &Instruction) {
        self.cur_instr = instr.offset;
        self.generated.clear();
        if matches!(instr.id, InstructionId::Nop | InstructionId::Unknown) {
            return;
        }

        // the output, when there is one, is always a register
        let mut output_mem_addr = MemoryAddress::default();
        match &instr.output {
            Some(Varnode::Register(reg)) => output_mem_addr = self.register_memory_address(reg),
            Some(v) => warn!("Output varnode is not a register"; "instr" => %instr, "output" => %v),
            None => {}
        }

        if let Some(op_id) = OperationId::from_instruction(instr.id) {
            self.gen_generic_operation(instr, op_id, output_mem_addr);
            return;
        }
        match instr.id {
            InstructionId::Call => self.gen_call_operation(instr),
            InstructionId::CBranch => {
                if let Some(cond) = &instr.input1 {
                    let cond = self.gen_read_varnode(cond);
                    self.program.block_mut(self.block).condition = Some(cond);
                }
            }
            InstructionId::Copy | InstructionId::Load | InstructionId::Store => {
                self.gen_copy_load_store(instr, output_mem_addr)
            }
            _ => trace!("Instruction produces no IR-code"; "instr" => %instr),
        }
    }

    fn gen_copy_load_store(&mut self, instr: &Instruction, mut output_mem_addr: MemoryAddress) {
        let input_is_register = |v: &Option<Varnode>| v.as_ref().map_or(false, Varnode::is_register);
        match instr.id {
            // constant copying (`rax:4 = COPY 100:4`) and storing (`STORE rax:8, 100:4`)
            InstructionId::Copy if !input_is_register(&instr.input0) => {
                return self.gen_generic_operation(instr, OperationId::Copy, output_mem_addr)
            }
            InstructionId::Store if !input_is_register(&instr.input1) => {
                return self.gen_generic_operation(instr, OperationId::Copy, output_mem_addr)
            }
            _ => {}
        }

        let mut read_infos = ReadInfos::new();
        match (instr.id, &instr.input0, &instr.input1) {
            (InstructionId::Copy, Some(Varnode::Register(reg)), _) => {
                read_infos = self.gen_read_register(reg);
            }
            (InstructionId::Store, Some(addr), Some(Varnode::Register(reg))) => {
                read_infos = self.gen_read_register(reg);
                let addr_value = self.gen_read_varnode(addr);
                output_mem_addr = self.memory_address(addr_value);
            }
            (InstructionId::Load, Some(addr), _) => {
                let addr_value = self.read_load_address(addr);
                let mem_addr = self.memory_address(addr_value);
                let load_size = instr.output.as_ref().map_or(addr.size(), Varnode::size);
                if !self.program.value(addr_value).linear_expr.is_array_type() {
                    let mut read_mask = BitMask::new(load_size, 0);
                    read_infos = self.gen_read_memory(mem_addr, load_size, &mut read_mask);
                } else {
                    // `rax:4 = LOAD [rcx + rdx * 4 + 0x10]`: the whole symbolic address at once
                    let var = self.gen_load_operation(&mem_addr, load_size);
                    read_infos.push_front(VariableReadInfo {
                        variable: var,
                        offset: 0,
                    });
                }
            }
            _ => {
                warn!("Malformed instruction"; "instr" => %instr);
                return;
            }
        }

        for info in read_infos {
            let src = self.program.value(info.variable);
            let (src_hash, src_size, src_expr) = (src.hash, src.size(), src.linear_expr.clone());
            let mut dst_mem_addr = output_mem_addr;
            dst_mem_addr.offset = dst_mem_addr.offset.wrapping_add(info.offset);
            let dst = self.create_variable(dst_mem_addr, src_hash, src_size);
            self.program.value_mut(dst).linear_expr = src_expr;
            self.gen_write_memory(dst, false);
            self.gen_operation(
                OperationId::Copy,
                OperationKind::Unary {
                    input: info.variable,
                },
                dst,
            );
        }
    }

    /// Read the address of a LOAD. The lookup is done without generating code first, since a
    /// load that resolves from memory does not need the address; if the address is only
    /// reachable through synthesized values, it is read again for real. The values made by the
    /// lookup are dropped unless the address is one of them.
    fn read_load_address(&mut self, addr: &Varnode) -> ValueRef {
        let mark = self.program.value_count();
        self.generation_enabled = false;
        let addr_value = self.gen_read_varnode(addr);
        self.generation_enabled = true;
        match self.program.value(addr_value).kind {
            ValueKind::Variable { id: 0, .. } => {
                self.program.discard_values_from(mark);
                self.gen_read_varnode(addr)
            }
            _ => {
                if addr_value.0 < mark {
                    self.program.discard_values_from(mark);
                }
                addr_value
            }
        }
    }

    /// Record `variable` in its subspace, evicting the variables it fully covers.
    fn gen_write_memory(&mut self, variable: ValueRef, block_scope: bool) {
        let (new_offset, new_size, base) = {
            let v = self.program.value(variable);
            let addr = v.mem_address().copied().unwrap_or_default();
            (addr.offset, v.size() as u64, addr.base_addr_hash)
        };
        let mut overwritten = vec![];
        let mut evicted = vec![];
        {
            let program = &*self.program;
            let subspace = program.block(self.block).memory.subspace(base);
            for var in subspace.into_iter().flat_map(|s| s.variables.iter()) {
                let v = program.value(*var);
                let offset = v.mem_address().map_or(0, |a| a.offset);
                let size = v.size() as u64;
                if offset < new_offset + new_size && offset + size > new_offset {
                    overwritten.push(*var);
                }
                if offset >= new_offset && offset + size <= new_offset + new_size {
                    evicted.push(*var);
                }
            }
        }
        for var in overwritten {
            if !self.overwritten.contains(&var) {
                self.overwritten.push(var);
            }
        }
        let subspace = self.program.block_mut(self.block).memory.subspace_mut(base);
        subspace.variables.retain(|v| !evicted.contains(v));
        for var in &evicted {
            subspace.block_scoped.remove(var);
        }
        subspace.variables.push_front(variable);
        if block_scope {
            subspace.block_scoped.insert(variable);
        }
    }

    /// Look the range up in the subspace of `block` only.
    fn gen_read_block_memory(
        &mut self,
        block: BlockRef,
        mem_addr: &MemoryAddress,
        read_size: usize,
        read_mask: &mut BitMask,
    ) -> ReadInfos {
        let mut res = ReadInfos::new();
        let is_current_block = block == self.block;
        let base = mem_addr.base_addr_hash;
        let read_offset = mem_addr.offset as i64;
        let read_size_i = read_size as i64;
        let variables: Vec<ValueRef> = match self.program.block(block).memory.subspace(base) {
            Some(s) => s
                .variables
                .iter()
                .filter(|v| is_current_block || !s.block_scoped.contains(*v))
                .copied()
                .collect(),
            None => return res,
        };

        for variable in variables {
            let (var_offset, var_size) = {
                let v = self.program.value(variable);
                (v.mem_address().map_or(0, |a| a.offset) as i64, v.size() as i64)
            };
            if var_offset + var_size <= read_offset || read_offset + read_size_i <= var_offset {
                continue;
            }
            let start_delta = var_offset - read_offset;
            let end_delta = (var_offset + var_size) - (read_offset + read_size_i);
            let (var_mask, extract_offset, extract_size) = match (start_delta >= 0, end_delta <= 0)
            {
                // ----|--====--|----
                (true, true) => (BitMask::new(var_size as usize, start_delta as usize), 0, 0),
                // ----|------==|==--
                (true, false) => {
                    let size = (var_size - end_delta) as usize;
                    (BitMask::new(size, start_delta as usize), 0, size)
                }
                // --==|==------|----
                (false, true) => {
                    let size = (var_size + start_delta) as usize;
                    (BitMask::new(size, 0), (-start_delta) as u64, size)
                }
                // --==|========|==--
                (false, false) => (BitMask::new(read_size, 0), (-start_delta) as u64, read_size),
            };

            let new_read_mask = *read_mask & !var_mask;
            if new_read_mask == *read_mask {
                continue;
            }
            let mut result = variable;
            if !is_current_block {
                let reference = Reference {
                    block,
                    base_addr_hash: base,
                    offset: var_offset as u64,
                    size: var_size as usize,
                };
                result = self.gen_ref_operation(reference, variable);
            }
            if extract_size != 0 {
                let input = result;
                let hash = hash_all(
                    0,
                    &[
                        OperationId::Extract as u64,
                        self.program.value(input).hash,
                        extract_offset,
                    ],
                );
                let addr = MemoryAddress {
                    offset: extract_offset,
                    ..Default::default()
                };
                result = self.create_variable(addr, hash, extract_size);
                self.gen_operation(
                    OperationId::Extract,
                    OperationKind::Extract {
                        input,
                        offset: extract_offset,
                    },
                    result,
                );
            }
            res.push_front(VariableReadInfo {
                variable: result,
                offset: (var_mask.bit_offset() / 8) as u64,
            });
            *read_mask = new_read_mask;
            if read_mask.is_zero() {
                break;
            }
        }
        res
    }

    fn gen_ref_operation(&mut self, reference: Reference, variable: ValueRef) -> ValueRef {
        let hash = reference.hash();
        if let Some(var) = self.refs.get(&hash) {
            return *var;
        }
        let size = self.program.value(variable).size();
        // a REF is a base term of its own, apart from the referenced variable
        let ref_var = self.create_variable(MemoryAddress::default(), hash, size);
        self.gen_operation(
            OperationId::Ref,
            OperationKind::Ref {
                input: variable,
                reference,
            },
            ref_var,
        );
        if self.generation_enabled {
            self.refs.insert(hash, ref_var);
        }
        ref_var
    }

    /// Resolve a read in `block`, then (for the bits still missing) in its predecessors.
    fn gen_read_memory_in(
        &mut self,
        block: BlockRef,
        read_mask: &mut BitMask,
        ctx: &mut BlockReadContext,
    ) -> ReadInfos {
        let cache_key = (block, *read_mask);
        if let Some(cached) = ctx.cache.get(&cache_key) {
            *read_mask = *read_mask & !cached.read_mask;
            return cached.infos.clone();
        }
        let prev_read_mask = *read_mask;
        let mem_addr = ctx.mem_addr;
        let mut infos = self.gen_read_block_memory(block, &mem_addr, ctx.read_size, read_mask);

        if !read_mask.is_zero() {
            let mut remain_infos = ReadInfos::new();
            let mut remain_read_mask = BitMask::zero();
            let preds = self.program.pcode_block(block).referenced_blocks.clone();
            for pred in preds {
                if ctx.visited_blocks.get(pred.0) {
                    continue;
                }
                let mut pred_read_mask = *read_mask;
                ctx.visited_blocks.set(pred.0, true);
                let mut pred_infos = self.gen_read_memory_in(pred, &mut pred_read_mask, ctx);
                ctx.visited_blocks.set(pred.0, false);
                if pred_infos.is_empty() && !pred_read_mask.is_zero() {
                    // nothing was written along this path
                    let var = self.gen_load_background_value(ctx);
                    pred_infos.push_front(VariableReadInfo {
                        variable: var,
                        offset: 0,
                    });
                    pred_read_mask = BitMask::zero();
                }
                remain_read_mask = remain_read_mask | pred_read_mask;
                if remain_infos.is_empty() {
                    remain_infos = pred_infos;
                } else if pred_infos != remain_infos {
                    // the paths disagree
                    if !remain_read_mask.is_zero() {
                        let var = self.gen_load_background_value(ctx);
                        remain_infos.push_front(VariableReadInfo {
                            variable: var,
                            offset: 0,
                        });
                    }
                    if !pred_read_mask.is_zero() {
                        let var = self.gen_load_background_value(ctx);
                        pred_infos.push_front(VariableReadInfo {
                            variable: var,
                            offset: 0,
                        });
                    }
                    let var1 = self.join_variables(remain_infos, ctx.read_size);
                    let var2 = self.join_variables(pred_infos, ctx.read_size);
                    let hash = hash_all(
                        0,
                        &[
                            OperationId::Phi as u64,
                            self.program.value(var1).hash,
                            self.program.value(var2).hash,
                        ],
                    );
                    let phi = self.create_variable(MemoryAddress::default(), hash, ctx.read_size);
                    self.gen_operation(
                        OperationId::Phi,
                        OperationKind::Binary {
                            input1: var1,
                            input2: var2,
                        },
                        phi,
                    );
                    remain_infos = ReadInfos::from(vec![VariableReadInfo {
                        variable: phi,
                        offset: 0,
                    }]);
                    remain_read_mask = BitMask::zero();
                }
            }
            if !remain_infos.is_empty() {
                *read_mask = *read_mask & remain_read_mask;
                for info in remain_infos.into_iter().rev() {
                    infos.push_front(info);
                }
            }
        }

        ctx.cache.insert(
            cache_key,
            CachedRead {
                infos: infos.clone(),
                read_mask: prev_read_mask ^ *read_mask,
            },
        );
        infos
    }

    /// The value the memory held before the function ran; one LOAD per read.
    fn gen_load_background_value(&mut self, ctx: &mut BlockReadContext) -> ValueRef {
        if let Some(var) = ctx.background_value {
            return var;
        }
        let var = self.gen_load_operation(&ctx.mem_addr, ctx.read_size);
        if let ValueKind::Variable { mem_address, .. } = &mut self.program.value_mut(var).kind {
            mem_address.base_addr_hash = ctx.mem_addr.base_addr_hash;
            mem_address.offset = ctx.mem_addr.offset;
        }
        if self.generation_enabled {
            self.program
                .block_mut(self.block)
                .memory
                .subspace_mut(ctx.mem_addr.base_addr_hash)
                .variables
                .push_back(var);
        }
        ctx.background_value = Some(var);
        var
    }

    fn gen_read_memory(
        &mut self,
        mem_addr: MemoryAddress,
        read_size: usize,
        read_mask: &mut BitMask,
    ) -> ReadInfos {
        let mut ctx = BlockReadContext {
            mem_addr,
            read_size,
            background_value: None,
            visited_blocks: BitSet::new(),
            cache: Default::default(),
        };
        let mut infos = self.gen_read_memory_in(self.block, read_mask, &mut ctx);
        if !read_mask.is_zero() {
            let var = self.gen_load_background_value(&mut ctx);
            infos.push_front(VariableReadInfo {
                variable: var,
                offset: 0,
            });
        }
        infos
    }

    /// Stitch the parts of a read together with CONCAT operations.
    fn join_variables(&mut self, infos: ReadInfos, size: usize) -> ValueRef {
        let mut infos = infos.into_iter();
        let mut concat = match infos.next() {
            Some(info) => info.variable,
            None => unreachable!("a read always yields at least one variable"),
        };
        for info in infos {
            let hash = hash_all(
                0,
                &[
                    OperationId::Concat as u64,
                    self.program.value(concat).hash,
                    self.program.value(info.variable).hash,
                    info.offset,
                ],
            );
            let new_concat = self.create_variable(MemoryAddress::default(), hash, size);
            self.gen_operation(
                OperationId::Concat,
                OperationKind::Concat {
                    input1: concat,
                    input2: info.variable,
                    offset: info.offset,
                },
                new_concat,
            );
            concat = new_concat;
        }
        concat
    }

    fn register_memory_address(&mut self, reg: &Register) -> MemoryAddress {
        let mut base_addr_hash = reg.id as Hash;
        let mut offset = 0;
        if reg.reg_type == RegisterType::Virtual {
            base_addr_hash = hash_all(base_addr_hash, &[reg.index as u64]);
        } else {
            offset = (reg.bit_offset / 8) as u64;
        }
        let mut mem_addr = MemoryAddress {
            value: None,
            base_addr_hash,
            offset,
        };
        let value = self.create_register(reg, &mem_addr);
        // for ah/xmm lanes
        let expr = &self.program.value(value).linear_expr + offset;
        self.program.value_mut(value).linear_expr = expr;
        mem_addr.value = Some(value);
        mem_addr
    }

    /// Split an address value into its base (the first term) and offset (the constant term).
    fn memory_address(&self, addr_value: ValueRef) -> MemoryAddress {
        let expr = &self.program.value(addr_value).linear_expr;
        let base_addr_hash = match expr.terms().first() {
            Some(term) => {
                let size = self.program.value(term.value).size();
                if size != CONFIG.pointer_size {
                    warn!("Invalid address size"; "size" => size);
                }
                self.program.value(term.value).hash
            }
            None => {
                debug!("Absolute address"; "address" => expr.const_term_value());
                0
            }
        };
        MemoryAddress {
            value: Some(addr_value),
            base_addr_hash,
            offset: expr.const_term_value(),
        }
    }

    fn gen_read_register(&mut self, reg: &Register) -> ReadInfos {
        let mem_addr = self.register_memory_address(reg);
        let mut read_mask = BitMask::new(reg.size, 0);
        self.gen_read_memory(mem_addr, reg.size, &mut read_mask)
    }

    fn gen_read_varnode(&mut self, varnode: &Varnode) -> ValueRef {
        match varnode {
            Varnode::Register(reg) => {
                let infos = self.gen_read_register(reg);
                self.join_variables(infos, reg.size)
            }
            Varnode::Constant { value, size, .. } => self.create_constant(*value, *size),
        }
    }

    fn gen_operation(&mut self, id: OperationId, kind: OperationKind, output: ValueRef) {
        let overwritten = std::mem::take(&mut self.overwritten);
        if !self.generation_enabled {
            return;
        }
        let op = self.program.add_operation(Operation {
            id,
            kind,
            output,
            block: self.block,
            instruction: self.cur_instr,
            overwritten,
            removed: false,
        });
        self.generated.push(op);
    }

    fn gen_generic_operation(
        &mut self,
        instr: &Instruction,
        op_id: OperationId,
        mut output_mem_addr: MemoryAddress,
    ) {
        let mut input1 = instr.input0.as_ref().map(|v| self.gen_read_varnode(v));
        let mut input2 = instr.input1.as_ref().map(|v| self.gen_read_varnode(v));
        let mut output_size = output_mem_addr
            .value
            .map(|v| self.program.value(v).size())
            .unwrap_or(0);

        // STORE: the first input is the destination address, the second the value
        if instr.id == InstructionId::Store {
            if let Some(addr) = input1 {
                output_mem_addr = self.memory_address(addr);
            }
            input1 = input2.take();
            output_size = input1.map_or(0, |v| self.program.value(v).size());
        }
        let input1 = match input1 {
            Some(i) => i,
            None => {
                warn!("Instruction without input"; "instr" => %instr);
                return;
            }
        };
        if output_mem_addr.value.is_none() {
            output_size = output_size.max(self.program.value(input1).size());
        }

        let h1 = self.program.value(input1).hash;
        let hash = match (instr.id.is_commutative(), input2) {
            // address arithmetic: [x+4y]*2 == 2x+8y == 8y+2x
            (true, Some(input2)) if instr.id == InstructionId::IntAdd => {
                h1.wrapping_add(self.program.value(input2).hash)
            }
            (true, Some(input2)) if instr.id == InstructionId::IntMult => {
                h1.wrapping_mul(self.program.value(input2).hash)
            }
            (true, Some(input2)) => hash_all(
                0,
                &[op_id as u64, h1.wrapping_add(self.program.value(input2).hash)],
            ),
            (_, Some(input2)) => hash_all(0, &[op_id as u64, h1, self.program.value(input2).hash]),
            (_, None) => hash_all(0, &[op_id as u64, h1]),
        };

        let output = self.create_variable(output_mem_addr, hash, output_size);
        self.gen_write_memory(output, false);

        match input2 {
            Some(input2) => {
                let expr1 = &self.program.value(input1).linear_expr;
                let expr2 = &self.program.value(input2).linear_expr;
                let expr = match instr.id {
                    InstructionId::IntAdd => Some(expr1 + expr2),
                    InstructionId::IntMult => expr1.checked_mul(expr2),
                    _ => None,
                };
                if let Some(expr) = expr {
                    self.program.value_mut(output).linear_expr = expr;
                }
                self.gen_operation(op_id, OperationKind::Binary { input1, input2 }, output);
            }
            None => self.gen_operation(op_id, OperationKind::Unary { input: input1 }, output),
        }
    }

    fn gen_load_operation(&mut self, mem_addr: &MemoryAddress, load_size: usize) -> ValueRef {
        let addr_value = match mem_addr.value {
            Some(v) => v,
            None => unreachable!("loads always have an address value"),
        };
        let hash = hash_all(0, &[OperationId::Load as u64, self.program.value(addr_value).hash]);
        let var = self.create_variable(MemoryAddress::default(), hash, load_size);
        self.gen_operation(
            OperationId::Load,
            OperationKind::Unary { input: addr_value },
            var,
        );
        var
    }

    fn gen_call_operation(&mut self, instr: &Instruction) {
        let hash = hash_all(0, &[OperationId::Call as u64, instr.offset.full()]);
        let dest = match &instr.input0 {
            Some(v) => self.gen_read_varnode(v),
            None => {
                warn!("CALL without destination"; "offset" => ?instr.offset);
                return;
            }
        };
        let pointer_size = CONFIG.pointer_size;
        let callee = instr
            .input0
            .as_ref()
            .and_then(Varnode::target)
            .and_then(|t| self.program.function_at(t));

        let mut arguments = vec![];
        let output = match callee {
            Some(callee) => {
                let signature = self.program.function(callee).signature.clone();
                for (i, param) in signature.parameters.iter().enumerate() {
                    let storage = match signature.parameter_storage(i) {
                        Some(s) => *s,
                        None => {
                            warn!("Parameter without storage"; "param" => &param.name);
                            continue;
                        }
                    };
                    let is_sp_or_ip = storage.register_id == Register::STACK_POINTER_ID
                        || storage.register_id == Register::INSTRUCTION_POINTER_ID;
                    let reg_size = if is_sp_or_ip { pointer_size } else { param.ty.size };
                    let reg = match Register::by_id(storage.register_id, reg_size) {
                        Some(r) => r,
                        None => {
                            warn!("Unknown storage register"; "id" => storage.register_id);
                            continue;
                        }
                    };
                    let reg_value = self.gen_read_varnode(&Varnode::Register(reg));
                    if !is_sp_or_ip {
                        arguments.push(reg_value);
                        continue;
                    }
                    // stack argument: read [rsp + offset]
                    let offset = self.create_constant(storage.offset, pointer_size);
                    let addr_hash = hash_all(hash, &[i as u64]);
                    let addr_var =
                        self.create_variable(MemoryAddress::default(), addr_hash, pointer_size);
                    let expr = &self.program.value(reg_value).linear_expr
                        + &self.program.value(offset).linear_expr;
                    self.program.value_mut(addr_var).linear_expr = expr;
                    self.gen_operation(
                        OperationId::IntAdd,
                        OperationKind::Binary {
                            input1: reg_value,
                            input2: offset,
                        },
                        addr_var,
                    );
                    let mem_addr = self.memory_address(addr_var);
                    let mut read_mask = BitMask::new(param.ty.size, 0);
                    let infos = self.gen_read_memory(mem_addr, param.ty.size, &mut read_mask);
                    let arg = self.join_variables(infos, param.ty.size);
                    arguments.push(arg);
                }

                let result_size = signature.return_size().max(1);
                let return_reg = signature
                    .return_storage()
                    .and_then(|s| Register::by_id(s.register_id, result_size));
                match return_reg {
                    Some(reg) => {
                        let mem_addr = self.register_memory_address(&reg);
                        let output = self.create_variable(mem_addr, hash, result_size);
                        self.gen_write_memory(output, false);
                        output
                    }
                    None => self.create_variable(MemoryAddress::default(), hash, result_size),
                }
            }
            None => {
                debug!("Call to an unknown function"; "offset" => ?instr.offset);
                self.create_variable(MemoryAddress::default(), hash, 1)
            }
        };
        self.gen_operation(
            OperationId::Call,
            OperationKind::Call {
                destination: dest,
                arguments,
            },
            output,
        );
    }

    fn create_constant(&mut self, value: u64, size: usize) -> ValueRef {
        let hash = hash_all(value, &[ValueTag::Constant as u64]);
        let c = self
            .program
            .add_value(ValueKind::Constant { value, size }, hash);
        self.program.value_mut(c).linear_expr = LinearExpression::constant(value);
        c
    }

    fn create_register(&mut self, reg: &Register, mem_addr: &MemoryAddress) -> ValueRef {
        let hash = hash_all(
            mem_addr.base_addr_hash,
            &[mem_addr.offset, reg.size as u64, ValueTag::Register as u64],
        );
        self.program
            .add_value(ValueKind::Register { register: *reg }, hash)
    }

    fn create_variable(&mut self, mem_address: MemoryAddress, hash: Hash, size: usize) -> ValueRef {
        let hash = hash_all(hash, &[size as u64, ValueTag::Variable as u64]);
        let id = if self.generation_enabled {
            let function = self.program.function_mut(self.function);
            let id = function.next_var_id;
            function.next_var_id += 1;
            id
        } else {
            0
        };
        self.program.add_value(
            ValueKind::Variable {
                id,
                mem_address,
                size,
                source: None,
            },
            hash,
        )
    }
}

/// Generate the IR-code of every block of `function`, dropping whatever was generated before.
/// Blocks are generated in level order, so forward predecessors are always done first.
pub fn decompile_function(program: &mut Program, function: FunctionRef) {
    let blocks = program.function(function).blocks.clone();
    for block in blocks.iter().rev() {
        program.clear_block(*block);
    }
    program.function_mut(function).next_var_id = 1;
    for &block in &blocks {
        let instructions: Vec<Instruction> = program
            .pcode_block(block)
            .instructions
            .iter()
            .filter_map(|o| program.graph.instruction(*o).cloned())
            .collect();
        let mut generator = IRcodeGenerator::new(program, block);
        for instr in &instructions {
            generator.ingest(instr);
        }
    }
    debug!("Function decompiled"; "function" => program.function_name(function), "blocks" => blocks.len());
    program
        .pending_events
        .push(IRcodeEvent::FunctionDecompiled { function, blocks });
}
