//! Textual dump of the IR-code of a function:
//!
//! ```text
//! Block B0(level: 1, near: B2, far: B4, cond: var2):
//!     var1[rax]:8 = COPY 0x0:8
//!     var2:1 = INT_EQUAL var1, 0x5:8
//! Block B2(level: 2):
//!     empty
//! ```

use crate::ircode::{FunctionRef, OperationKind, OperationRef, Program, ValueKind, ValueRef};
use crate::pcode::BlockRef;
use itertools::Itertools;

/// A value as an operand: `varN`, a register name, or `0x10:8` for constants
pub fn value_to_string(program: &Program, value: ValueRef) -> String {
    match &program.value(value).kind {
        ValueKind::Constant { value, size } => format!("{:#x}:{}", value, size),
        ValueKind::Register { register } => register.name(),
        ValueKind::Variable { .. } => program.variable_name(value),
    }
}

/// The output of an operation: `varN[address]:size`, the address being the value the location was
/// addressed through, or `varN:size` for virtual variables
fn output_to_string(program: &Program, value: ValueRef) -> String {
    let v = program.value(value);
    match v.mem_address().and_then(|a| a.value) {
        Some(addr) => format!(
            "{}[{}]:{}",
            program.variable_name(value),
            value_to_string(program, addr),
            v.size()
        ),
        None => format!("{}:{}", program.variable_name(value), v.size()),
    }
}

pub fn operation_to_string(program: &Program, op: OperationRef) -> String {
    let operation = program.operation(op);
    let operand = |v: &ValueRef| value_to_string(program, *v);
    let operands = match &operation.kind {
        OperationKind::Unary { input } | OperationKind::Ref { input, .. } => operand(input),
        OperationKind::Extract { input, offset } => format!("{}, {}", operand(input), offset),
        OperationKind::Binary { input1, input2 } => {
            format!("{}, {}", operand(input1), operand(input2))
        }
        OperationKind::Concat {
            input1,
            input2,
            offset,
        } => format!("{}, {}, {}", operand(input1), operand(input2), offset),
        OperationKind::Call {
            destination,
            arguments,
        } => std::iter::once(destination)
            .chain(arguments.iter())
            .map(operand)
            .join(", "),
    };
    let mut res = format!(
        "{} = {} {}",
        output_to_string(program, operation.output),
        operation.id.name(),
        operands
    );

    let function = program.function(program.block(operation.block).function);
    if let Some(idx) = function
        .param_vars
        .iter()
        .position(|v| *v == Some(operation.output))
    {
        res += &format!(" // param{}", idx + 1);
    } else if function.return_var == Some(operation.output) {
        res += " // return";
    }
    res
}

pub fn block_header(program: &Program, block: BlockRef) -> String {
    let pcode_block = program.pcode_block(block);
    let mut attrs = vec![format!("level: {}", pcode_block.level)];
    if let Some(near) = pcode_block.near {
        attrs.push(format!("near: {}", program.block_name(near)));
    }
    if let Some(far) = pcode_block.far {
        attrs.push(format!("far: {}", program.block_name(far)));
    }
    if let Some(cond) = program.block(block).condition {
        attrs.push(format!("cond: {}", value_to_string(program, cond)));
    }
    format!("Block {}({}):", program.block_name(block), attrs.join(", "))
}

pub fn print_block(program: &Program, block: BlockRef) -> String {
    let ops = &program.block(block).operations;
    let mut lines = vec![block_header(program, block)];
    if ops.is_empty() {
        lines.push("    empty".to_string());
    }
    lines.extend(
        ops.iter()
            .map(|op| format!("    {}", operation_to_string(program, *op))),
    );
    lines.join("\n")
}

/// The blocks of `function` in level order
pub fn print_function(program: &Program, function: FunctionRef) -> String {
    program
        .function(function)
        .blocks
        .iter()
        .map(|b| print_block(program, *b))
        .join("\n")
}
