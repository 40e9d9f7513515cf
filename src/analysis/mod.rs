//! Stream-oriented analysis primitives: the arithmetic operation catalog and
//! the chainable pattern matchers built on top of it.

pub mod arith;
pub mod matcher;
pub mod vm_matcher;

use iced_x86::{Instruction, OpKind};

/// Byte width of operand `op` as it appears in `instruction`.
///
/// Registers report their own width, memory operands the accessed width and
/// immediates their encoded width.
pub(crate) fn operand_byte_size(instruction: &Instruction, op: u32) -> usize {
    match instruction.op_kind(op) {
        OpKind::Register => instruction.op_register(op).size(),
        OpKind::Memory => instruction.memory_size().size(),
        OpKind::Immediate8 | OpKind::Immediate8_2nd => 1,
        OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
        OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
        OpKind::Immediate64 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => 8,
        _ => 0,
    }
}
