//! The virtual instruction-set catalog: one descriptor per virtual opcode,
//! each pairing a stream-template match function with an IR emission function.
//!
//! Descriptors are tried in catalog order by [`VmHandler::from_stream`]
//! (`super::handler`); the order matters where templates overlap, so more
//! specific variants come first. Match functions receive a private copy of the
//! caller's stream and only commit it on success.

use bitflags::bitflags;
use iced_x86::{Mnemonic, Register};

use super::handler::{CustomData, VmInstruction, VmInstructionInfo, VmOperand, VmOperandKind};
use super::{Direction, VmState};
use crate::analysis::arith::{Expression, truncate};
use crate::analysis::matcher::{Matcher, StackSlot, bound, capture};
use crate::analysis::vm_matcher::{STACK_ALIGNMENT, VmMatcher};
use crate::disasm::InstructionStream;
use crate::ir::{BasicBlock, Flag, Operand, Reg};

bitflags! {
    /// Behavioral flags of a virtual opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmOpcodeFlags: u32 {
        /// The instruction redirects the VIP.
        const BRANCH = 1 << 0;
        /// The instruction leaves the virtual machine.
        const VMEXIT = 1 << 1;
        /// The instruction changes the VM state (register assignment,
        /// direction, flow).
        const UPDATES_STATE = 1 << 3;
        /// The instruction starts a new basic block without branching.
        const CREATES_BASIC_BLOCK = 1 << 4;
    }
}

/// A virtual-instruction descriptor: name, operand count, flags and the two
/// dispatch functions.
pub struct VmOpcodeDesc {
    pub name: &'static str,
    pub operand_count: u32,
    pub flags: VmOpcodeFlags,
    pub matches: fn(&VmState, &mut InstructionStream, &mut VmInstructionInfo) -> bool,
    pub emit: fn(&mut BasicBlock, &VmInstruction),
}

/// All virtual instructions, in matching order.
pub static INSTRUCTION_SET: &[&VmOpcodeDesc] = &[
    &PUSH, &POP, &PUSHSTK, &POPSTK, &LDD, &STR, &ADD, &NAND, &NOR, &SHLD, &SHRD, &SHL, &SHR,
    &DIV, &IDIV, &MUL, &IMUL, &RET, &NOP, &POPF, &VMEXIT, &RDTSC, &CPUID, &PUSHREG, &POPREG,
    &LOCKOR,
];

const CF: Reg = Reg::Flag(Flag::Cf);
const ZF: Reg = Reg::Flag(Flag::Zf);
const SF: Reg = Reg::Flag(Flag::Sf);
const OF: Reg = Reg::Flag(Flag::Of);

fn base_equal(a: Register, b: Register) -> bool {
    a.full_register() == b.full_register()
}

fn is_debug_or_control(reg: Register) -> bool {
    let r = reg as u32;
    (r >= Register::DR0 as u32 && r <= Register::DR15 as u32)
        || (r >= Register::CR0 as u32 && r <= Register::CR15 as u32)
}

/// Virtual register-file slot addressed by a decoded operand index.
fn virtual_reg(operand: u64, size: usize) -> Reg {
    Reg::Virtual {
        slot: (operand / 8) as u16,
        bit_offset: ((operand % 8) * 8) as u16,
        bits: (size * 8) as u16,
    }
}

fn sizes<'h>(instruction: &VmInstruction<'h>) -> &'h [usize] {
    &instruction.handler.info.sizes
}

// --- PUSH ------------------------------------------------------------------

pub static PUSH: VmOpcodeDesc = VmOpcodeDesc {
    name: "PUSH",
    operand_count: 1,
    flags: VmOpcodeFlags::empty(),
    matches: match_push,
    emit: emit_push,
};

fn match_push(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    // Immediate variant: the VIP value itself lands on the virtual stack.
    {
        let mut chain = Expression::new();
        let mut attempt = stream.clone();
        let mut m = VmMatcher::new(&mut attempt, state);

        let mut operand_reg = Register::None;
        let mut operand_size = 0usize;
        let mut store_size = 0usize;

        m.fetch_vip(capture(&mut operand_reg), capture(&mut operand_size));
        m.record_encryption(operand_reg, &mut chain);
        m.store_vsp(bound(&mut operand_reg), capture(&mut store_size));

        if m.ok() {
            drop(m);
            *stream = attempt;
            info.operands.push((
                VmOperand {
                    kind: VmOperandKind::Imm,
                    size: store_size,
                    vip_length: operand_size,
                },
                chain,
            ));
            return true;
        }
    }

    // Register variant: the VIP value indexes the register file.
    {
        let mut chain = Expression::new();
        let mut attempt = stream.clone();
        let mut m = VmMatcher::new(&mut attempt, state);

        let mut operand_reg = Register::None;
        let mut context_reg = Register::None;
        let mut operand_size = 0usize;
        let mut store_size = 0usize;

        m.fetch_vip(capture(&mut operand_reg), capture(&mut operand_size));
        m.record_encryption(operand_reg, &mut chain);
        m.fetch_ctx(capture(&mut context_reg), capture(&mut store_size), bound(&mut operand_reg));
        m.align(&mut store_size, STACK_ALIGNMENT);
        m.store_vsp(bound(&mut context_reg), bound(&mut store_size));

        if m.ok() {
            drop(m);
            *stream = attempt;
            info.operands.push((
                VmOperand {
                    kind: VmOperandKind::Reg,
                    size: store_size,
                    vip_length: operand_size,
                },
                chain,
            ));
            return true;
        }
    }

    false
}

fn emit_push(block: &mut BasicBlock, instruction: &VmInstruction) {
    let value = instruction.operands[0];
    let operand = &instruction.handler.info.operands[0].0;

    match operand.kind {
        VmOperandKind::Imm => {
            block.push(Operand::imm(truncate(value, operand.size), (operand.size * 8) as u16));
        }
        VmOperandKind::Reg => {
            block.push(virtual_reg(value, operand.size));
        }
    }
}

// --- POP -------------------------------------------------------------------

pub static POP: VmOpcodeDesc = VmOpcodeDesc {
    name: "POP",
    operand_count: 1,
    flags: VmOpcodeFlags::empty(),
    matches: match_pop,
    emit: emit_pop,
};

fn match_pop(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut chain = Expression::new();
    let mut m = VmMatcher::new(stream, state);

    let mut pop_reg = Register::None;
    let mut operand_reg = Register::None;
    let mut pop_size = 0usize;
    let mut operand_size = 0usize;
    let mut store_size = 0usize;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut pop_reg), capture(&mut pop_size), bound(&mut initial_disp));
    let mut vsp_offset = pop_size as u64;
    m.add_vsp(bound(&mut vsp_offset));
    m.fetch_vip(capture(&mut operand_reg), capture(&mut operand_size));
    m.record_encryption(operand_reg, &mut chain);
    m.store_ctx(bound(&mut pop_reg), capture(&mut store_size), bound(&mut operand_reg));

    if !m.ok() {
        return false;
    }

    info.operands.push((
        VmOperand {
            kind: VmOperandKind::Reg,
            size: pop_size,
            vip_length: operand_size,
        },
        chain,
    ));
    true
}

fn emit_pop(block: &mut BasicBlock, instruction: &VmInstruction) {
    let operand = &instruction.handler.info.operands[0].0;
    block.pop(virtual_reg(instruction.operands[0], operand.size));
}

// --- PUSHSTK / POPSTK ------------------------------------------------------

pub static PUSHSTK: VmOpcodeDesc = VmOpcodeDesc {
    name: "PUSHSTK",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_pushstk,
    emit: emit_pushstk,
};

fn match_pushstk(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut stored_reg = Register::None;
    let mut stack_reg = state.stack_reg;
    let mut store_size = 0usize;

    m.mov_reg_reg(capture(&mut stored_reg), bound(&mut stack_reg), true);
    m.store_vsp(bound(&mut stored_reg), capture(&mut store_size));

    if !m.ok() {
        return false;
    }
    info.sizes.push(store_size);
    true
}

fn emit_pushstk(block: &mut BasicBlock, instruction: &VmInstruction) {
    let t0 = block.tmp((sizes(instruction)[0] * 8) as u16);
    block.mov(t0, Reg::Sp).push(t0);
}

pub static POPSTK: VmOpcodeDesc = VmOpcodeDesc {
    name: "POPSTK",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_popstk,
    emit: emit_popstk,
};

fn match_popstk(state: &VmState, stream: &mut InstructionStream, _info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut stack_reg = state.stack_reg;
    let mut pop_size = 8usize;
    let mut disp = 0i64;

    m.fetch_vsp(bound(&mut stack_reg), bound(&mut pop_size), bound(&mut disp));
    m.ok()
}

fn emit_popstk(block: &mut BasicBlock, _instruction: &VmInstruction) {
    block.pop(Reg::Sp);
}

// --- LDD / STR -------------------------------------------------------------

pub static LDD: VmOpcodeDesc = VmOpcodeDesc {
    name: "LDD",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_ldd,
    emit: emit_ldd,
};

fn match_ldd(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut aligned_size = 0usize;
    let mut size = 0usize;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut aligned_size), bound(&mut initial_disp));
    m.fetch_memory(capture(&mut r1), bound(&mut r0), capture(&mut size));
    m.store_vsp(bound(&mut r1), bound(&mut size));

    if !m.ok() {
        return false;
    }
    info.sizes.push(aligned_size);
    info.sizes.push(size);
    true
}

fn emit_ldd(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let [t0, t1] = block.tmps([(s[0] * 8) as u16, (s[1] * 8) as u16]);
    block.pop(t0).ldd(t1, t0, Operand::imm64(0)).push(t1);
}

pub static STR: VmOpcodeDesc = VmOpcodeDesc {
    name: "STR",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_str,
    emit: emit_str,
};

fn match_str(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut s0 = 0usize;
    let mut s1 = 0usize;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut s0), bound(&mut initial_disp));
    let mut second_disp = s0 as i64;
    m.fetch_vsp(capture(&mut r1), capture(&mut s1), bound(&mut second_disp));
    m.store_memory(bound(&mut r0), bound(&mut r1), bound(&mut s1));

    if !m.ok() {
        return false;
    }
    info.sizes.push(s0);
    info.sizes.push(s1);
    true
}

fn emit_str(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let [t0, t1] = block.tmps([(s[0] * 8) as u16, (s[1] * 8) as u16]);
    block.pop(t0).pop(t1).str_(t0, Operand::imm64(0), t1);
}

// --- Binary arithmetic -----------------------------------------------------

pub static ADD: VmOpcodeDesc = VmOpcodeDesc {
    name: "ADD",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_add,
    emit: emit_add,
};

fn match_add(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut s0 = 0usize;
    let mut s1 = 0usize;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut s0), bound(&mut initial_disp));
    let mut second_disp = s0 as i64;
    m.fetch_vsp(capture(&mut r1), capture(&mut s1), bound(&mut second_disp));
    m.add_reg_reg(bound(&mut r0), bound(&mut r1));
    m.id(Mnemonic::Pushfq);

    if !m.ok() {
        return false;
    }
    info.sizes.push(s0);
    info.sizes.push(s1);
    true
}

fn emit_add(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let [lhs, rhs, result] =
        block.tmps([(s[0] * 8) as u16, (s[1] * 8) as u16, (s[0] * 8) as u16]);
    let [lhs_sign, rhs_sign, result_sign] = block.tmps([1, 1, 1]);

    block
        .pop(lhs)
        .pop(rhs)
        .mov(result, lhs)
        .add(result, rhs)
        .tl(SF, result, Operand::imm64(0))
        .te(ZF, result, Operand::imm64(0))
        .tul(CF, result, lhs)
        .tl(lhs_sign, lhs, Operand::imm64(0))
        .tl(rhs_sign, rhs, Operand::imm64(0))
        .tl(result_sign, result, Operand::imm64(0))
        .bxor(lhs_sign, result_sign)
        .bxor(rhs_sign, result_sign)
        .band(lhs_sign, rhs_sign)
        .mov(OF, lhs_sign)
        .push(result)
        .pushf();
}

pub static NAND: VmOpcodeDesc = VmOpcodeDesc {
    name: "NAND",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_nand,
    emit: emit_nand,
};

fn match_nand(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut s0 = 0usize;
    let mut s1 = 0usize;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut s0), bound(&mut initial_disp));
    let mut second_disp = s0 as i64;
    m.fetch_vsp(capture(&mut r1), capture(&mut s1), bound(&mut second_disp));
    m.not_reg(bound(&mut r0));
    m.not_reg(bound(&mut r1));
    m.or_reg_reg(bound(&mut r0), bound(&mut r1));

    if !m.ok() {
        return false;
    }
    info.sizes.push(s0);
    info.sizes.push(s1);
    true
}

fn emit_nand(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let [lhs, rhs, result] =
        block.tmps([(s[0] * 8) as u16, (s[1] * 8) as u16, (s[0] * 8) as u16]);

    block
        .pop(lhs)
        .pop(rhs)
        .bnot(lhs)
        .bnot(rhs)
        .mov(result, lhs)
        .bor(result, rhs)
        .mov(OF, Operand::imm64(0))
        .mov(CF, Operand::imm64(0))
        .tl(SF, result, Operand::imm64(0))
        .te(ZF, result, Operand::imm64(0))
        .push(result)
        .pushf();
}

pub static NOR: VmOpcodeDesc = VmOpcodeDesc {
    name: "NOR",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_nor,
    emit: emit_nor,
};

fn match_nor(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut s0 = 0usize;
    let mut s1 = 0usize;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut s0), bound(&mut initial_disp));
    let mut second_disp = s0 as i64;
    m.fetch_vsp(capture(&mut r1), capture(&mut s1), bound(&mut second_disp));
    m.not_reg(bound(&mut r0));
    m.not_reg(bound(&mut r1));
    m.and_reg_reg(bound(&mut r0), bound(&mut r1));

    if !m.ok() {
        return false;
    }
    info.sizes.push(s0);
    info.sizes.push(s1);
    true
}

fn emit_nor(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let [lhs, rhs, result] =
        block.tmps([(s[0] * 8) as u16, (s[1] * 8) as u16, (s[0] * 8) as u16]);

    block
        .pop(lhs)
        .pop(rhs)
        .bnot(lhs)
        .bnot(rhs)
        .mov(result, lhs)
        .band(result, rhs)
        .mov(OF, Operand::imm64(0))
        .mov(CF, Operand::imm64(0))
        .tl(SF, result, Operand::imm64(0))
        .te(ZF, result, Operand::imm64(0))
        .push(result)
        .pushf();
}

// --- Shifts ----------------------------------------------------------------

pub static SHLD: VmOpcodeDesc = VmOpcodeDesc {
    name: "SHLD",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_shld,
    emit: emit_shld,
};

fn match_shld(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut r2 = Register::None;
    let mut size = 0usize;
    let mut shift_size = 0usize;
    let mut last_disp = 0i64;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut size), bound(&mut initial_disp));
    let mut second_disp = size as i64;
    m.fetch_vsp(capture(&mut r1), bound(&mut size), bound(&mut second_disp));
    m.fetch_vsp(capture(&mut r2), capture(&mut shift_size), capture(&mut last_disp));
    m.shld_reg_reg_reg(bound(&mut r0), bound(&mut r1), bound(&mut r2));

    if !m.ok() {
        return false;
    }
    info.sizes.push(size);
    info.sizes.push(shift_size);
    true
}

fn emit_shld(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let (size_bits, shift_bits) = ((s[0] * 8) as u16, (s[1] * 8) as u16);
    let [t0, t1, t2, t4, t5] = block.tmps([size_bits, size_bits, shift_bits, size_bits, size_bits]);

    // shld t0, t1, t2 = (t0 << t2) | (t1 >> (size - t2))
    block
        .pop(t0)
        .pop(t1)
        .pop(t2)
        .mov(t5, t0)
        .bshl(t0, t2)
        .mov(t4, Operand::imm64(size_bits as u64))
        .sub(t4, t2)
        .bshr(t1, t4)
        .bor(t0, t1)
        .bshr(t5, t4)
        .mov(CF, t5)
        .tl(SF, t0, Operand::imm64(0))
        .te(ZF, t0, Operand::imm64(0))
        .mov(OF, Operand::Undefined)
        .push(t0)
        .pushf();
}

pub static SHRD: VmOpcodeDesc = VmOpcodeDesc {
    name: "SHRD",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_shrd,
    emit: emit_shrd,
};

fn match_shrd(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut r2 = Register::None;
    let mut size = 0usize;
    let mut shift_size = 0usize;
    let mut last_disp = 0i64;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut size), bound(&mut initial_disp));
    let mut second_disp = size as i64;
    m.fetch_vsp(capture(&mut r1), bound(&mut size), bound(&mut second_disp));
    m.fetch_vsp(capture(&mut r2), capture(&mut shift_size), capture(&mut last_disp));
    m.shrd_reg_reg_reg(bound(&mut r0), bound(&mut r1), bound(&mut r2));

    if !m.ok() {
        return false;
    }
    info.sizes.push(size);
    info.sizes.push(shift_size);
    true
}

fn emit_shrd(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let (size_bits, shift_bits) = ((s[0] * 8) as u16, (s[1] * 8) as u16);
    let [t0, t1, t2, t4, t5] = block.tmps([size_bits, size_bits, shift_bits, size_bits, size_bits]);

    // shrd t0, t1, t2 = (t0 >> t2) | (t1 << (size - t2))
    block
        .pop(t0)
        .pop(t1)
        .pop(t2)
        .mov(t5, t0)
        .bshr(t0, t2)
        .mov(t4, Operand::imm64(size_bits as u64))
        .sub(t4, t2)
        .bshl(t1, t4)
        .bor(t0, t1)
        .sub(t2, Operand::imm64(1))
        .bshr(t5, t2)
        .mov(CF, t5)
        .tl(SF, t5, Operand::imm64(0))
        .te(ZF, t5, Operand::imm64(0))
        .mov(OF, Operand::Undefined)
        .push(t0)
        .pushf();
}

pub static SHL: VmOpcodeDesc = VmOpcodeDesc {
    name: "SHL",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_shl,
    emit: emit_shl,
};

fn match_shl(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut s0 = 0usize;
    let mut s1 = 0usize;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut s0), bound(&mut initial_disp));
    m.align(&mut s0, STACK_ALIGNMENT);
    let mut second_disp = s0 as i64;
    m.fetch_vsp(capture(&mut r1), capture(&mut s1), bound(&mut second_disp));
    m.align(&mut s1, STACK_ALIGNMENT);
    m.shl_reg_reg(bound(&mut r0), bound(&mut r1));

    if !m.ok() {
        return false;
    }
    info.sizes.push(s0);
    info.sizes.push(s1);
    true
}

fn emit_shl(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let (s0_bits, s1_bits) = ((s[0] * 8) as u16, (s[1] * 8) as u16);
    let [lhs, rhs, result] = block.tmps([s0_bits, s1_bits, s0_bits]);
    let [t0, t1] = block.tmps([s0_bits, s1_bits]);

    block
        .pop(lhs)
        .pop(rhs)
        .mov(result, lhs)
        .bshl(result, rhs)
        .mov(t1, Operand::imm64(s0_bits as u64))
        .sub(t1, rhs)
        .mov(t0, lhs)
        .bshr(t0, t1)
        .mov(CF, t0)
        .tl(SF, result, Operand::imm64(0))
        .te(ZF, result, Operand::imm64(0))
        .mov(OF, Operand::Undefined)
        .push(result)
        .pushf();
}

pub static SHR: VmOpcodeDesc = VmOpcodeDesc {
    name: "SHR",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_shr,
    emit: emit_shr,
};

fn match_shr(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut s0 = 0usize;
    let mut s1 = 0usize;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut s0), bound(&mut initial_disp));
    m.align(&mut s0, STACK_ALIGNMENT);
    let mut second_disp = s0 as i64;
    m.fetch_vsp(capture(&mut r1), capture(&mut s1), bound(&mut second_disp));
    m.align(&mut s1, STACK_ALIGNMENT);
    m.shr_reg_reg(bound(&mut r0), bound(&mut r1));

    if !m.ok() {
        return false;
    }
    info.sizes.push(s0);
    info.sizes.push(s1);
    true
}

fn emit_shr(block: &mut BasicBlock, instruction: &VmInstruction) {
    let s = sizes(instruction);
    let (s0_bits, s1_bits) = ((s[0] * 8) as u16, (s[1] * 8) as u16);
    let [lhs, rhs, result] = block.tmps([s0_bits, s1_bits, s0_bits]);
    let [t0, t1] = block.tmps([s0_bits, s1_bits]);

    block
        .pop(lhs)
        .pop(rhs)
        .mov(result, lhs)
        .bshr(result, rhs)
        .mov(t1, rhs)
        .sub(t1, Operand::imm64(1))
        .mov(t0, lhs)
        .bshr(t0, t1)
        .mov(CF, t0)
        .tl(SF, result, Operand::imm64(0))
        .te(ZF, result, Operand::imm64(0))
        .mov(OF, Operand::Undefined)
        .push(result)
        .pushf();
}

// --- Division / multiplication ---------------------------------------------

pub static DIV: VmOpcodeDesc = VmOpcodeDesc {
    name: "DIV",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_div,
    emit: emit_div,
};

fn match_div(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    match_div_like(state, stream, info, Mnemonic::Div)
}

pub static IDIV: VmOpcodeDesc = VmOpcodeDesc {
    name: "IDIV",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_idiv,
    emit: emit_idiv,
};

fn match_idiv(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    match_div_like(state, stream, info, Mnemonic::Idiv)
}

fn match_div_like(
    state: &VmState,
    stream: &mut InstructionStream,
    info: &mut VmInstructionInfo,
    mnemonic: Mnemonic,
) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut r2 = Register::None;
    let mut s0 = 0usize;
    let mut s1 = 0usize;
    let mut disp = 0i64;
    let mut divisor_disp = 0i64;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut s0), capture(&mut disp));
    m.fetch_vsp(capture(&mut r1), bound(&mut s0), bound(&mut initial_disp));
    m.fetch_vsp(capture(&mut r2), capture(&mut s1), capture(&mut divisor_disp));
    m.generic_reg(mnemonic, bound(&mut r2), true);

    if !m.ok() {
        return false;
    }

    // Implicit dividend registers of (i)div.
    if !base_equal(r0, Register::RAX) || !base_equal(r1, Register::RDX) {
        return false;
    }

    info.sizes.push(s0);
    info.sizes.push(s1);
    true
}

fn emit_div_like(block: &mut BasicBlock, instruction: &VmInstruction, signed: bool) {
    let s = sizes(instruction);
    let (s0_bits, s1_bits) = ((s[0] * 8) as u16, (s[1] * 8) as u16);
    let [t0, t1, t2, t3] = block.tmps([s0_bits, s0_bits, s0_bits, s1_bits]);

    // t0 = dx, t1 = ax, t3 = divisor.
    block.pop(t0).pop(t1).mov(t2, t1).pop(t3);
    if signed {
        block.idiv(t1, t0, t3).irem(t2, t0, t3);
    }
    else {
        block.div(t1, t0, t3).rem(t2, t0, t3);
    }
    block
        .mov(CF, Operand::Undefined)
        .mov(OF, Operand::Undefined)
        .mov(SF, Operand::Undefined)
        .mov(ZF, Operand::Undefined)
        .push(t1)
        .push(t2)
        .pushf();
}

fn emit_div(block: &mut BasicBlock, instruction: &VmInstruction) {
    emit_div_like(block, instruction, false);
}

fn emit_idiv(block: &mut BasicBlock, instruction: &VmInstruction) {
    emit_div_like(block, instruction, true);
}

pub static MUL: VmOpcodeDesc = VmOpcodeDesc {
    name: "MUL",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_mul,
    emit: emit_mul,
};

fn match_mul(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    match_mul_like(state, stream, info, Mnemonic::Mul)
}

pub static IMUL: VmOpcodeDesc = VmOpcodeDesc {
    name: "IMUL",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_imul,
    emit: emit_imul,
};

fn match_imul(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    match_mul_like(state, stream, info, Mnemonic::Imul)
}

fn match_mul_like(
    state: &VmState,
    stream: &mut InstructionStream,
    info: &mut VmInstructionInfo,
    mnemonic: Mnemonic,
) -> bool {
    let mut m = VmMatcher::new(stream, state);

    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut s0 = 0usize;
    let mut disp = 0i64;
    let mut initial_disp = 0i64;

    m.fetch_vsp(capture(&mut r0), capture(&mut s0), capture(&mut disp));
    m.fetch_vsp(capture(&mut r1), bound(&mut s0), bound(&mut initial_disp));
    m.generic_reg(mnemonic, bound(&mut r1), true);

    if !m.ok() {
        return false;
    }

    if !base_equal(r0, Register::RAX) || !base_equal(r1, Register::RDX) {
        return false;
    }

    info.sizes.push(s0);
    true
}

fn emit_mul_like(block: &mut BasicBlock, instruction: &VmInstruction, signed: bool) {
    let bits = (sizes(instruction)[0] * 8) as u16;
    let [t0, t1, t2, t3] = block.tmps([bits, bits, bits, bits]);

    // t0 = dx, t1 = ax.
    block.pop(t0).mov(t2, t0).pop(t1).mov(t3, t1);

    if signed {
        let [losign, sxd] = block.tmps([1, bits]);
        block
            .imul(t0, t1)
            .imulhi(t2, t3)
            .tl(losign, t0, Operand::imm64(0))
            .ifs(sxd, losign, Operand::imm(truncate(u64::MAX, bits as usize / 8), bits))
            .tne(CF, t2, sxd)
            .tne(OF, t2, sxd);
    }
    else {
        block
            .mul(t0, t1)
            .mulhi(t2, t3)
            .tne(CF, t2, Operand::imm64(0))
            .tne(OF, t2, Operand::imm64(0));
    }

    block
        .mov(SF, Operand::Undefined)
        .mov(ZF, Operand::Undefined)
        .push(t0)
        .push(t2)
        .pushf();
}

fn emit_mul(block: &mut BasicBlock, instruction: &VmInstruction) {
    emit_mul_like(block, instruction, false);
}

fn emit_imul(block: &mut BasicBlock, instruction: &VmInstruction) {
    emit_mul_like(block, instruction, true);
}

// --- RET (branch synthesis) ------------------------------------------------

pub static RET: VmOpcodeDesc = VmOpcodeDesc {
    name: "RET",
    operand_count: 0,
    flags: VmOpcodeFlags::BRANCH.union(VmOpcodeFlags::UPDATES_STATE),
    matches: match_ret,
    emit: emit_ret,
};

fn match_ret(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    // Pass 1: the value popped as the new flow, and the new flow base, while
    // following renames of the virtual stack register. The caller's stream is
    // never advanced; the embedded bridge is re-discovered from the handler
    // start under the updated state.
    let mut first_pass = stream.clone();

    let mut reg = Register::None;
    let mut reg_size = 8usize;
    let mut initial_disp = 0i64;
    let mut flow_reg = Register::None;
    let mut new_flow = 0u64;
    let mut stack_reg = state.stack_reg;

    let mut m = VmMatcher::new(&mut first_pass, state);
    m.fetch_vsp(capture(&mut reg), bound(&mut reg_size), bound(&mut initial_disp));
    m.track_registers(std::slice::from_mut(&mut stack_reg), |m| {
        m.set_flow(capture(&mut flow_reg), capture(&mut new_flow))
    });
    if !m.ok() {
        return false;
    }
    drop(m);

    // Pass 2: the new VIP register, identified by the first 4-byte read
    // through it after the flow switch.
    let mut second_pass = first_pass.clone();
    let mut vip_fetch_reg = Register::None;
    let mut vip_reg = Register::None;
    let mut vip_fetch_size = 4usize;

    let mut m = Matcher::new(&mut second_pass);
    m.fetch_memory(capture(&mut vip_fetch_reg), capture(&mut vip_reg), bound(&mut vip_fetch_size));
    if !m.ok() {
        return false;
    }
    drop(m);

    // Pass 3: fresh scan for the new rolling key register and the new VIP
    // direction.
    let mut third_pass = stream.clone();
    let mut reloc_reg = Register::None;
    let mut reloc_imm = 0u64;
    let mut rolling_key_reg = Register::None;
    let mut vip_offset_mnemonic = Mnemonic::INVALID;
    let mut vip_offset = 4u64;

    let mut m = Matcher::new(&mut third_pass);
    m.mov_reg_imm64(capture(&mut reloc_reg), capture(&mut reloc_imm));
    m.generic_reg_reg(Mnemonic::Sub, capture(&mut rolling_key_reg), bound(&mut reloc_reg), false);
    m.update_reg(capture(&mut vip_offset_mnemonic), bound(&mut vip_reg), bound(&mut vip_offset));
    m.begin_encryption(bound(&mut vip_fetch_reg), bound(&mut rolling_key_reg));
    if !m.ok() {
        return false;
    }

    info.updated_state = Some(VmState {
        stack_reg,
        vip_reg,
        context_reg: state.context_reg,
        rolling_key_reg,
        flow_reg,
        direction: if vip_offset_mnemonic == Mnemonic::Add {
            Direction::Down
        }
        else {
            Direction::Up
        },
        flow: new_flow,
    });
    true
}

fn emit_ret(block: &mut BasicBlock, instruction: &VmInstruction) {
    let t0 = block.tmp(64);
    block.pop(t0);

    // Bias upward streams by -1 so that up/down streams reaching the same
    // address produce distinct block identities.
    let updated = instruction.handler.info.updated_state.as_ref();
    if updated.map(|s| s.direction) == Some(Direction::Up) {
        block.sub(t0, Operand::imm64(1));
    }

    block.jmp(t0);
}

// --- NOP / POPF ------------------------------------------------------------

pub static NOP: VmOpcodeDesc = VmOpcodeDesc {
    name: "NOP",
    operand_count: 0,
    flags: VmOpcodeFlags::CREATES_BASIC_BLOCK.union(VmOpcodeFlags::UPDATES_STATE),
    matches: match_nop,
    emit: emit_nop,
};

fn match_nop(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut flow_reg = state.flow_reg;
    let mut flow_rva = 0u64;

    let mut m = Matcher::new(stream);
    m.set_flow(bound(&mut flow_reg), capture(&mut flow_rva));
    if !m.ok() {
        return false;
    }

    info.updated_state = Some(VmState {
        flow: flow_rva,
        ..*state
    });
    true
}

fn emit_nop(block: &mut BasicBlock, _instruction: &VmInstruction) {
    block.nop();
}

pub static POPF: VmOpcodeDesc = VmOpcodeDesc {
    name: "POPF",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_popf,
    emit: emit_popf,
};

fn match_popf(state: &VmState, stream: &mut InstructionStream, _info: &mut VmInstructionInfo) -> bool {
    let mut stack_reg = state.stack_reg;
    let mut size = 8usize;

    let mut m = Matcher::new(stream);
    m.push_memory(bound(&mut stack_reg), bound(&mut size));
    m.id(Mnemonic::Popfq);
    m.ok()
}

fn emit_popf(block: &mut BasicBlock, _instruction: &VmInstruction) {
    block.popf();
}

// --- VMEXIT ----------------------------------------------------------------

pub static VMEXIT: VmOpcodeDesc = VmOpcodeDesc {
    name: "VMEXIT",
    operand_count: 0,
    flags: VmOpcodeFlags::VMEXIT,
    matches: match_vmexit,
    emit: emit_vmexit,
};

fn match_vmexit(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut rsp = Register::RSP;
    let mut vsp = state.stack_reg;
    let mut restored = Vec::new();

    let mut m = Matcher::new(stream);
    m.mov_reg_reg(bound(&mut rsp), bound(&mut vsp), true);
    m.record_pops(&mut restored, |m| m.id(Mnemonic::Ret));

    // A real context restoration pops the whole entry frame.
    if !m.ok() || restored.len() < 10 {
        return false;
    }

    info.custom = CustomData::Slots(restored);
    true
}

fn emit_vmexit(block: &mut BasicBlock, instruction: &VmInstruction) {
    let CustomData::Slots(slots) = &instruction.handler.info.custom
    else {
        return;
    };
    for slot in slots {
        match slot {
            StackSlot::Flags => block.pop(Reg::Flags),
            StackSlot::Register(reg) => block.pop(Reg::Phys(*reg)),
        };
    }
}

// --- Opaque passthrough ----------------------------------------------------

pub static RDTSC: VmOpcodeDesc = VmOpcodeDesc {
    name: "RDTSC",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_rdtsc,
    emit: emit_rdtsc,
};

fn match_rdtsc(_state: &VmState, stream: &mut InstructionStream, _info: &mut VmInstructionInfo) -> bool {
    let mut m = Matcher::new(stream);
    m.id(Mnemonic::Rdtsc);
    m.ok()
}

fn emit_rdtsc(block: &mut BasicBlock, _instruction: &VmInstruction) {
    block
        .vemits("rdtsc")
        .vpinw(Register::RDX)
        .vpinw(Register::RAX)
        .push(Reg::Phys(Register::EDX))
        .push(Reg::Phys(Register::EAX));
}

pub static CPUID: VmOpcodeDesc = VmOpcodeDesc {
    name: "CPUID",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_cpuid,
    emit: emit_cpuid,
};

fn match_cpuid(state: &VmState, stream: &mut InstructionStream, _info: &mut VmInstructionInfo) -> bool {
    let mut r0 = Register::None;
    let mut s0 = 0usize;
    let mut initial_disp = 0i64;

    let mut m = VmMatcher::new(stream, state);
    m.fetch_vsp(capture(&mut r0), capture(&mut s0), bound(&mut initial_disp));
    m.id(Mnemonic::Cpuid);
    m.ok()
}

fn emit_cpuid(block: &mut BasicBlock, _instruction: &VmInstruction) {
    let leaf = block.tmp(32);
    block
        .pop(leaf)
        .mov(Reg::Phys(Register::EAX), leaf)
        .vpinr(Register::EAX)
        .vemits("cpuid")
        .vpinw(Register::EAX)
        .vpinw(Register::EBX)
        .vpinw(Register::ECX)
        .vpinw(Register::EDX)
        .push(Reg::Phys(Register::EAX))
        .push(Reg::Phys(Register::EBX))
        .push(Reg::Phys(Register::ECX))
        .push(Reg::Phys(Register::EDX));
}

// --- Privileged register moves ---------------------------------------------

pub static PUSHREG: VmOpcodeDesc = VmOpcodeDesc {
    name: "PUSHREG",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_pushreg,
    emit: emit_pushreg,
};

fn match_pushreg(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut store_size = 8usize;

    let mut m = VmMatcher::new(stream, state);
    m.mov_reg_reg(capture(&mut r0), capture(&mut r1), true);
    m.store_vsp(bound(&mut r0), bound(&mut store_size));

    if !m.ok() || !is_debug_or_control(r1) {
        return false;
    }
    info.custom = CustomData::Reg(r1);
    true
}

fn emit_pushreg(block: &mut BasicBlock, instruction: &VmInstruction) {
    if let CustomData::Reg(reg) = instruction.handler.info.custom {
        block.push(Reg::Phys(reg));
    }
}

pub static POPREG: VmOpcodeDesc = VmOpcodeDesc {
    name: "POPREG",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_popreg,
    emit: emit_popreg,
};

fn match_popreg(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut pop_size = 8usize;
    let mut initial_disp = 0i64;

    let mut m = VmMatcher::new(stream, state);
    m.fetch_vsp(capture(&mut r0), bound(&mut pop_size), bound(&mut initial_disp));
    m.mov_reg_reg(capture(&mut r1), bound(&mut r0), true);

    if !m.ok() || !is_debug_or_control(r1) {
        return false;
    }
    info.custom = CustomData::Reg(r1);
    true
}

fn emit_popreg(block: &mut BasicBlock, instruction: &VmInstruction) {
    if let CustomData::Reg(reg) = instruction.handler.info.custom {
        block.pop(Reg::Phys(reg));
    }
}

// --- LOCKOR ----------------------------------------------------------------

pub static LOCKOR: VmOpcodeDesc = VmOpcodeDesc {
    name: "LOCKOR",
    operand_count: 0,
    flags: VmOpcodeFlags::empty(),
    matches: match_lockor,
    emit: emit_lockor,
};

fn match_lockor(state: &VmState, stream: &mut InstructionStream, info: &mut VmInstructionInfo) -> bool {
    let mut r0 = Register::None;
    let mut r1 = Register::None;
    let mut s0 = 8usize;
    let mut s1 = 0usize;
    let mut initial_disp = 0i64;
    let mut second_disp = 8i64;
    let mut or_instruction = None;

    let mut m = VmMatcher::new(stream, state);
    m.fetch_vsp(capture(&mut r0), bound(&mut s0), bound(&mut initial_disp));
    m.fetch_vsp(capture(&mut r1), capture(&mut s1), bound(&mut second_disp));
    m.id_captured(Mnemonic::Or, &mut or_instruction);

    if !m.ok() {
        return false;
    }

    // The atomic variant is the whole point of this handler.
    let Some(or_instruction) = or_instruction
    else {
        return false;
    };
    if !or_instruction.has_lock_prefix() {
        return false;
    }

    info.custom = CustomData::Regs(vec![r0, r1]);
    true
}

fn emit_lockor(block: &mut BasicBlock, instruction: &VmInstruction) {
    let CustomData::Regs(regs) = &instruction.handler.info.custom
    else {
        return;
    };
    // No IR op models an atomic RMW; emit it as opaque assembly.
    let assembly = format!(
        "lock or [{}], {}",
        format!("{:?}", regs[0]).to_lowercase(),
        format!("{:?}", regs[1]).to_lowercase()
    );
    block.vemits(assembly);
}

#[cfg(test)]
mod tests {
    use iced_x86::code_asm::*;

    use super::*;
    use crate::disasm::decode_linear;

    fn test_state() -> VmState {
        VmState {
            stack_reg: iced_x86::Register::RBP,
            vip_reg: iced_x86::Register::RSI,
            context_reg: iced_x86::Register::RSP,
            rolling_key_reg: iced_x86::Register::RBX,
            flow_reg: iced_x86::Register::RDI,
            direction: Direction::Down,
            flow: 0,
        }
    }

    fn assemble_at(ip: u64, build: impl FnOnce(&mut CodeAssembler)) -> InstructionStream {
        let mut asm = CodeAssembler::new(64).unwrap();
        build(&mut asm);
        let code = asm.assemble(ip).unwrap();
        decode_linear(&code, ip)
    }

    #[test]
    fn pop_handler_template_matches() {
        let mut stream = assemble_at(0x2000, |asm| {
            asm.mov(rax, qword_ptr(rbp)).unwrap(); // fetch [VSP]
            asm.add(rbp, 8).unwrap(); // advance VSP
            asm.movzx(ecx, word_ptr(rsi)).unwrap(); // operand index from VIP
            asm.xor(cx, bx).unwrap(); // key xor
            asm.ror(cx, 5).unwrap(); // decryption chain
            asm.xor(bx, cx).unwrap(); // fold into key
            asm.mov(qword_ptr(rsp + rcx), rax).unwrap(); // store into VCTX
        });

        let state = test_state();
        let mut info = VmInstructionInfo::default();
        assert!(match_pop(&state, &mut stream, &mut info));

        let (operand, chain) = &info.operands[0];
        assert_eq!(operand.kind, VmOperandKind::Reg);
        assert_eq!(operand.size, 8);
        assert_eq!(operand.vip_length, 2);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.compute(0x00F1, 2), 0x00F1u16.rotate_right(5) as u64);
    }

    #[test]
    fn push_prefers_immediate_variant_then_register_variant() {
        // Immediate variant.
        let mut stream = assemble_at(0x2000, |asm| {
            asm.mov(rdx, qword_ptr(rsi)).unwrap();
            asm.xor(rdx, rbx).unwrap();
            asm.bswap(rdx).unwrap();
            asm.xor(rbx, rdx).unwrap();
            asm.mov(qword_ptr(rbp), rdx).unwrap();
        });
        let state = test_state();
        let mut info = VmInstructionInfo::default();
        assert!(match_push(&state, &mut stream, &mut info));
        assert_eq!(info.operands[0].0.kind, VmOperandKind::Imm);
        assert_eq!(info.operands[0].0.size, 8);
        assert_eq!(info.operands[0].0.vip_length, 8);

        // Register variant: the VIP value indexes the context.
        let mut stream = assemble_at(0x2000, |asm| {
            asm.movzx(edx, word_ptr(rsi)).unwrap();
            asm.xor(dx, bx).unwrap();
            asm.not(dx).unwrap();
            asm.xor(bx, dx).unwrap();
            asm.mov(rcx, qword_ptr(rsp + rdx)).unwrap();
            asm.mov(qword_ptr(rbp), rcx).unwrap();
        });
        let mut info = VmInstructionInfo::default();
        assert!(match_push(&state, &mut stream, &mut info));
        assert_eq!(info.operands[0].0.kind, VmOperandKind::Reg);
        assert_eq!(info.operands[0].0.size, 8);
        assert_eq!(info.operands[0].0.vip_length, 2);
    }

    #[test]
    fn div_requires_implicit_dividend_registers() {
        let state = test_state();

        // Correct: ax/dx carry the dividend.
        let mut stream = assemble_at(0x2000, |asm| {
            asm.mov(rax, qword_ptr(rbp + 8)).unwrap();
            asm.mov(rdx, qword_ptr(rbp)).unwrap();
            asm.mov(rcx, qword_ptr(rbp + 16)).unwrap();
            asm.div(rcx).unwrap();
        });
        let mut info = VmInstructionInfo::default();
        assert!(match_div(&state, &mut stream, &mut info));
        assert_eq!(info.sizes.as_slice(), &[8, 8]);

        // Wrong registers: the template itself matches but the constraint
        // rejects it.
        let mut stream = assemble_at(0x2000, |asm| {
            asm.mov(r8, qword_ptr(rbp + 8)).unwrap();
            asm.mov(r9, qword_ptr(rbp)).unwrap();
            asm.mov(rcx, qword_ptr(rbp + 16)).unwrap();
            asm.div(rcx).unwrap();
        });
        let mut info = VmInstructionInfo::default();
        assert!(!match_div(&state, &mut stream, &mut info));
    }

    #[test]
    fn vmexit_records_the_restored_frame() {
        let mut stream = assemble_at(0x2000, |asm| {
            asm.mov(rsp, rbp).unwrap();
            asm.pop(rax).unwrap();
            asm.pop(rcx).unwrap();
            asm.pop(rdx).unwrap();
            asm.pop(rbx).unwrap();
            asm.pop(rbp).unwrap();
            asm.pop(rsi).unwrap();
            asm.pop(rdi).unwrap();
            asm.pop(r8).unwrap();
            asm.popfq().unwrap();
            asm.pop(r9).unwrap();
            asm.pop(r10).unwrap();
            asm.ret().unwrap();
        });

        let state = test_state();
        let mut info = VmInstructionInfo::default();
        assert!(match_vmexit(&state, &mut stream, &mut info));

        let CustomData::Slots(slots) = &info.custom
        else {
            panic!("expected restored slots");
        };
        assert_eq!(slots.len(), 11);
        assert_eq!(slots[8], StackSlot::Flags);
    }

    #[test]
    fn vmexit_rejects_short_frames() {
        let mut stream = assemble_at(0x2000, |asm| {
            asm.mov(rsp, rbp).unwrap();
            asm.pop(rax).unwrap();
            asm.pop(rcx).unwrap();
            asm.ret().unwrap();
        });

        let state = test_state();
        let mut info = VmInstructionInfo::default();
        assert!(!match_vmexit(&state, &mut stream, &mut info));
    }

    #[test]
    fn ret_recovers_the_new_state_and_direction() {
        let mut code: Vec<u8> = Vec::new();
        code.extend_from_slice(b"\x48\x8b\x55\x00"); // mov rdx, [rbp]: popped new flow
        code.extend_from_slice(b"\x48\x89\xe8"); // mov rax, rbp: VSP rename
        code.extend_from_slice(b"\x48\x8d\x3d\xf9\xff\xff\xff"); // lea rdi, [rip-7]: new flow base
        code.extend_from_slice(b"\x41\x8b\x09"); // mov ecx, [r9]: first 4-byte read, new VIP
        code.extend_from_slice(b"\x49\xba\x00\x00\x00\x00\x00\x00\x00\x00"); // movabs r10, 0
        code.extend_from_slice(b"\x4c\x29\xd3"); // sub rbx, r10: new rolling key register
        code.extend_from_slice(b"\x49\x83\xe9\x04"); // sub r9, 4: the new stream runs upward
        code.extend_from_slice(b"\x31\xd9"); // xor ecx, ebx: key xor of the embedded bridge
        code.extend_from_slice(b"\x51"); // push rcx
        code.extend_from_slice(b"\xc3"); // ret
        let mut stream = decode_linear(&code, 0x3000);
        let restart = stream.clone();

        let state = test_state();
        let mut info = VmInstructionInfo::default();
        assert!(match_ret(&state, &mut stream, &mut info));

        let updated = info.updated_state.unwrap();
        assert_eq!(updated.stack_reg, iced_x86::Register::RAX);
        assert_eq!(updated.vip_reg, iced_x86::Register::R9);
        assert_eq!(updated.rolling_key_reg, iced_x86::Register::RBX);
        assert_eq!(updated.flow_reg, iced_x86::Register::RDI);
        assert_eq!(updated.direction, Direction::Up);
        // The lea sits after the two 3/4-byte movs.
        assert_eq!(updated.flow, 0x3007);

        // The caller's stream is left at the handler start so the embedded
        // bridge can be parsed from it.
        assert_eq!(stream.rva(), restart.rva());
    }

    #[test]
    fn ret_emits_the_direction_bias() {
        let mut updated = test_state();
        updated.direction = Direction::Up;

        let handler = crate::vm::handler::VmHandler {
            rva: 0,
            descriptor: &RET,
            info: VmInstructionInfo {
                updated_state: Some(updated),
                ..Default::default()
            },
            bridge: None,
        };
        let instruction = VmInstruction {
            handler: &handler,
            operands: Default::default(),
        };

        let mut routine = crate::ir::Routine::new(0);
        let block = routine.block_mut(0);
        emit_ret(block, &instruction);
        assert_eq!(
            block.ops,
            vec![
                crate::ir::Op::Pop(Reg::Tmp { id: 0, bits: 64 }),
                crate::ir::Op::Sub(Reg::Tmp { id: 0, bits: 64 }, Operand::imm64(1)),
                crate::ir::Op::Jmp(Operand::Reg(Reg::Tmp { id: 0, bits: 64 })),
            ]
        );
    }

    #[test]
    fn nop_reestablishes_the_flow_base() {
        let mut code = Vec::new();
        code.extend_from_slice(b"\x48\x8d\x3d\xf9\xff\xff\xff"); // lea rdi, [rip-7]
        let mut stream = decode_linear(&code, 0x5000);

        let state = test_state();
        let mut info = VmInstructionInfo::default();
        assert!(match_nop(&state, &mut stream, &mut info));
        let updated = info.updated_state.unwrap();
        assert_eq!(updated.flow, 0x5000);
        assert_eq!(updated.direction, state.direction);
        assert!(NOP.flags.contains(VmOpcodeFlags::CREATES_BASIC_BLOCK));
    }

    #[test]
    fn lockor_requires_the_lock_prefix() {
        let state = test_state();

        let mut stream = assemble_at(0x2000, |asm| {
            asm.mov(rax, qword_ptr(rbp)).unwrap();
            asm.mov(rcx, qword_ptr(rbp + 8)).unwrap();
            asm.lock().or(qword_ptr(rax), rcx).unwrap();
        });
        let mut info = VmInstructionInfo::default();
        assert!(match_lockor(&state, &mut stream, &mut info));

        let mut stream = assemble_at(0x2000, |asm| {
            asm.mov(rax, qword_ptr(rbp)).unwrap();
            asm.mov(rcx, qword_ptr(rbp + 8)).unwrap();
            asm.or(qword_ptr(rax), rcx).unwrap();
        });
        let mut info = VmInstructionInfo::default();
        assert!(!match_lockor(&state, &mut stream, &mut info));
    }
}
