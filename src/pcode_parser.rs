//! A reader for a small textual p-code listing format.
//!
//! One instruction per line, `//` starts a comment:
//!
//! ```text
//!     rax:8 = COPY 0x0:8
//!     CBRANCH <labelElse>, zf:1
//!     rax:1:1 = COPY 2:1          // size 1, byte offset 1
//!     BRANCH <labelEnd>
//!     <labelElse>:
//!     xmm0:Da = COPY $U1:4         // lanes Da..Dd (4 bytes), Qa..Qb (8 bytes)
//!     $2:8 = INT_ADD rip:8, 0x10:8 // `$2` is `$U2`
//!     <labelEnd>:
//!     CALL <func>
//! ```
//!
//! Instruction `i` of the listing (labels excluded) is placed at byte offset `i`, so blocks get
//! predictable names (`B0`, `B2`, ...).

use crate::pcode::{Instruction, InstructionId, InstructionOffset, Register, Varnode};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

fn err<T>(line: usize, message: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError {
        line,
        message: message.into(),
    })
}

/// Parse a listing into instructions.
pub fn parse_listing(listing: &str) -> Result<Vec<Instruction>, ParseError> {
    // first pass: drop comments, resolve labels
    let mut labels: BTreeMap<&str, u64> = Default::default();
    let mut lines: Vec<(usize, &str)> = vec![];
    for (lineno, line) in listing.lines().enumerate() {
        let line = match line.split_once("//") {
            Some((code, _comment)) => code,
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('<') && line.ends_with(">:") {
            labels.insert(&line[1..line.len() - 2], lines.len() as u64);
        } else {
            lines.push((lineno + 1, line));
        }
    }

    lines
        .into_iter()
        .enumerate()
        .map(|(idx, (lineno, line))| {
            parse_instruction(line, &labels, lineno).map(|mut instr| {
                instr.offset = InstructionOffset::new(idx as u64, 0);
                instr
            })
        })
        .collect()
}

fn parse_instruction(
    line: &str,
    labels: &BTreeMap<&str, u64>,
    lineno: usize,
) -> Result<Instruction, ParseError> {
    let (output, rest) = match line.split_once(" = ") {
        Some((out, rest)) => (Some(parse_varnode(out.trim(), labels, lineno)?), rest.trim()),
        None => (None, line),
    };
    let (name, operands) = match rest.split_once(char::is_whitespace) {
        Some((name, operands)) => (name, operands.trim()),
        None => (rest, ""),
    };
    let id = match InstructionId::from_name(name) {
        Some(id) => id,
        None => return err(lineno, format!("unknown instruction {:?}", name)),
    };
    let mut inputs = operands
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(|o| parse_varnode(o, labels, lineno));
    let input0 = inputs.next().transpose()?;
    let input1 = inputs.next().transpose()?;
    if inputs.next().is_some() {
        return err(lineno, "too many operands");
    }
    Ok(Instruction {
        id,
        input0,
        input1,
        output,
        offset: Default::default(),
    })
}

fn parse_number(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(neg) = s.strip_prefix('-') {
        neg.parse::<u64>().ok().map(|v| v.wrapping_neg())
    } else {
        s.parse().ok()
    }
}

fn parse_varnode(
    s: &str,
    labels: &BTreeMap<&str, u64>,
    lineno: usize,
) -> Result<Varnode, ParseError> {
    let mut parts = s.split(':');
    let head = parts.next().unwrap_or_default();
    let size = parts.next();
    let extra = parts.next();

    // labels (branch and call targets)
    if let Some(label) = head.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
        let offset = match labels.get(label) {
            Some(o) => *o,
            None => return err(lineno, format!("unknown label {:?}", label)),
        };
        let size = size.and_then(parse_number).unwrap_or(8) as usize;
        return Ok(Varnode::Constant {
            value: InstructionOffset::new(offset, 0).full(),
            size,
            is_address: true,
        });
    }

    // constants
    if head.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        let size = match size.and_then(parse_number) {
            Some(s) => s as usize,
            None => return err(lineno, format!("constant {:?} without size", s)),
        };
        let value = if head.contains('.') {
            match (head.parse::<f64>(), size) {
                (Ok(f), 4) => (f as f32).to_bits() as u64,
                (Ok(f), _) => f.to_bits(),
                (Err(_), _) => return err(lineno, format!("bad float {:?}", head)),
            }
        } else {
            match parse_number(head) {
                Some(v) => v,
                None => return err(lineno, format!("bad number {:?}", head)),
            }
        };
        return Ok(Varnode::constant(value, size));
    }

    // virtual registers
    if let Some(index) = head.strip_prefix("$U").or_else(|| head.strip_prefix('$')) {
        let index = match usize::from_str_radix(index, 16) {
            Ok(i) => i,
            Err(_) => return err(lineno, format!("bad virtual register {:?}", head)),
        };
        let size = size.and_then(parse_number).unwrap_or(8) as usize;
        return Ok(Varnode::Register(Register::virtual_register(index, size)));
    }

    // registers
    let mut reg = match Register::by_name(&head.to_lowercase()) {
        Some(r) => r,
        None => return err(lineno, format!("unknown register {:?}", head)),
    };
    if let Some(size) = size {
        let lane = |lane_size: usize, c: char| (c as usize - 'a' as usize) * lane_size;
        match (size.chars().next(), size.chars().nth(1), size.len()) {
            (Some('D'), Some(c), 2) if ('a'..='d').contains(&c) => {
                reg.size = 4;
                reg.bit_offset = lane(4, c) * 8;
            }
            (Some('Q'), Some(c), 2) if ('a'..='b').contains(&c) => {
                reg.size = 8;
                reg.bit_offset = lane(8, c) * 8;
            }
            _ => {
                reg.size = match parse_number(size) {
                    Some(s) => s as usize,
                    None => return err(lineno, format!("bad register size {:?}", s)),
                };
                if let Some(byte_offset) = extra {
                    reg.bit_offset = match parse_number(byte_offset) {
                        Some(o) => o as usize * 8,
                        None => return err(lineno, format!("bad register offset {:?}", s)),
                    };
                }
            }
        }
    }
    Ok(Varnode::Register(reg))
}
