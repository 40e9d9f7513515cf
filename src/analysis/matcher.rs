//! Chainable pattern matcher over an instruction stream.
//!
//! Every primitive consumes instructions until one matches its template or the
//! stream runs dry. A failed primitive poisons the matcher: all subsequent
//! chain calls (and observer scopes) become no-ops, so a whole template can be
//! written as one chain and checked once at the end with [`Matcher::ok`].
//!
//! Primitives take in/out binding cells built with [`bound`] (the matched
//! value must equal the cell's current content) or [`capture`] (the cell is
//! overwritten with the matched value). Register cells compare by base
//! register unless a primitive documents strict comparison.
//!
//! Side-channel observers can be installed for the duration of a sub-chain;
//! they fire on *every* instruction consumed in their scope, including ones a
//! primitive rejected, and disarm when the scope exits even if the inner chain
//! failed.

use iced_x86::{Instruction, Mnemonic, OpKind, Register};

use super::arith::{Expression, Operation, desc_for_instruction};
use crate::disasm::InstructionStream;

/// An in/out binding cell for match templates.
pub struct Cell<'a, T> {
    slot: &'a mut T,
    bound: bool,
}

/// Cell that must equal the matched value for the match to succeed.
pub fn bound<T>(slot: &mut T) -> Cell<'_, T> {
    Cell { slot, bound: true }
}

/// Cell that is overwritten with the matched value on success.
pub fn capture<T>(slot: &mut T) -> Cell<'_, T> {
    Cell { slot, bound: false }
}

impl<T: Copy + PartialEq> Cell<'_, T> {
    pub(crate) fn accepts(&self, value: T) -> bool {
        !self.bound || *self.slot == value
    }

    pub(crate) fn assign(&mut self, value: T) {
        *self.slot = value;
    }
}

impl Cell<'_, Register> {
    /// Base-register comparison: `rax`, `eax`, `ax` and `al` all share the
    /// `rax` base.
    pub(crate) fn accepts_base(&self, value: Register) -> bool {
        !self.bound || self.slot.full_register() == value.full_register()
    }
}

/// A value recorded by the push/pop observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSlot {
    Register(Register),
    /// `pushfq` / `popfq` and friends.
    Flags,
}

struct ExpressionRecorder {
    target: Register,
    expression: Expression,
}

/// The chainable matcher. See the module documentation.
pub struct Matcher<'s> {
    stream: &'s mut InstructionStream,
    failed: bool,
    recorder: Option<ExpressionRecorder>,
    tracked: Vec<Register>,
    pushes: Option<Vec<StackSlot>>,
    pops: Option<Vec<StackSlot>>,
}

pub(crate) fn is_reg(instruction: &Instruction, op: u32) -> bool {
    instruction.op_kind(op) == OpKind::Register
}

pub(crate) fn is_mem(instruction: &Instruction, op: u32) -> bool {
    instruction.op_kind(op) == OpKind::Memory
}

fn is_imm(instruction: &Instruction, op: u32) -> bool {
    matches!(
        instruction.op_kind(op),
        OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

fn immediate(instruction: &Instruction, op: u32) -> u64 {
    instruction.try_immediate(op).unwrap_or(0)
}

fn is_push_flags(mnemonic: Mnemonic) -> bool {
    matches!(mnemonic, Mnemonic::Pushf | Mnemonic::Pushfd | Mnemonic::Pushfq)
}

fn is_pop_flags(mnemonic: Mnemonic) -> bool {
    matches!(mnemonic, Mnemonic::Popf | Mnemonic::Popfd | Mnemonic::Popfq)
}

impl<'s> Matcher<'s> {
    pub fn new(stream: &'s mut InstructionStream) -> Self {
        Self {
            stream,
            failed: false,
            recorder: None,
            tracked: Vec::new(),
            pushes: None,
            pops: None,
        }
    }

    /// Whether the chain so far has fully matched.
    pub fn ok(&self) -> bool {
        !self.failed
    }

    /// Run the universal side-channel updates for one consumed instruction.
    fn process(&mut self, instruction: &Instruction) {
        if let Some(recorder) = &mut self.recorder
            && desc_for_instruction(instruction).is_some()
            && is_reg(instruction, 0)
            && instruction.op0_register().full_register() == recorder.target.full_register()
            && let Some(operation) = Operation::from_instruction(instruction)
        {
            recorder.expression.push(operation);
        }

        if !self.tracked.is_empty()
            && matches!(instruction.mnemonic(), Mnemonic::Mov | Mnemonic::Xchg)
            && is_reg(instruction, 0)
            && is_reg(instruction, 1)
        {
            let (dst, src) = (instruction.op0_register(), instruction.op1_register());
            for tracked in &mut self.tracked {
                match instruction.mnemonic() {
                    Mnemonic::Mov if *tracked == src => *tracked = dst,
                    Mnemonic::Xchg if *tracked == dst => *tracked = src,
                    Mnemonic::Xchg if *tracked == src => *tracked = dst,
                    _ => {}
                }
            }
        }

        if let Some(pushes) = &mut self.pushes {
            if instruction.mnemonic() == Mnemonic::Push && is_reg(instruction, 0) {
                pushes.push(StackSlot::Register(instruction.op0_register()));
            }
            else if is_push_flags(instruction.mnemonic()) {
                pushes.push(StackSlot::Flags);
            }
        }

        if let Some(pops) = &mut self.pops {
            if instruction.mnemonic() == Mnemonic::Pop && is_reg(instruction, 0) {
                pops.push(StackSlot::Register(instruction.op0_register()));
            }
            else if is_pop_flags(instruction.mnemonic()) {
                pops.push(StackSlot::Flags);
            }
        }
    }

    /// Consume instructions until `template` matches one or the stream ends.
    pub(crate) fn match_with(
        &mut self,
        mut template: impl FnMut(&Instruction) -> bool,
    ) -> &mut Self {
        if self.failed {
            return self;
        }
        while let Some(instruction) = self.stream.next() {
            self.process(&instruction);
            if template(&instruction) {
                return self;
            }
        }
        self.failed = true;
        self
    }

    // --- Observer scopes ---------------------------------------------------

    /// Follow register renames (`mov`/`xchg reg, reg`) for the given registers
    /// while `chain` runs. On exit the slice holds each register's new home.
    pub fn track_registers<F>(&mut self, registers: &mut [Register], chain: F) -> &mut Self
    where
        F: FnOnce(&mut Self) -> &mut Self,
    {
        if self.failed {
            return self;
        }
        self.tracked = registers.to_vec();
        let _ = chain(&mut *self);
        for (slot, tracked) in registers.iter_mut().zip(self.tracked.drain(..)) {
            *slot = tracked;
        }
        self
    }

    /// Record every `push reg` / `pushf` consumed while `chain` runs.
    pub fn record_pushes<F>(&mut self, out: &mut Vec<StackSlot>, chain: F) -> &mut Self
    where
        F: FnOnce(&mut Self) -> &mut Self,
    {
        if self.failed {
            return self;
        }
        self.pushes = Some(std::mem::take(out));
        let _ = chain(&mut *self);
        *out = self.pushes.take().unwrap_or_default();
        self
    }

    /// Record every `pop reg` / `popf` consumed while `chain` runs.
    pub fn record_pops<F>(&mut self, out: &mut Vec<StackSlot>, chain: F) -> &mut Self
    where
        F: FnOnce(&mut Self) -> &mut Self,
    {
        if self.failed {
            return self;
        }
        self.pops = Some(std::mem::take(out));
        let _ = chain(&mut *self);
        *out = self.pops.take().unwrap_or_default();
        self
    }

    /// Append every arithmetic transform that writes `target`'s base register
    /// to `expression` while `chain` runs. This is how operand decryption
    /// chains are learned.
    pub fn record_expression<F>(
        &mut self,
        target: Register,
        expression: &mut Expression,
        chain: F,
    ) -> &mut Self
    where
        F: FnOnce(&mut Self) -> &mut Self,
    {
        if self.failed {
            return self;
        }
        self.recorder = Some(ExpressionRecorder {
            target,
            expression: std::mem::take(expression),
        });
        let _ = chain(&mut *self);
        if let Some(recorder) = self.recorder.take() {
            *expression = recorder.expression;
        }
        self
    }

    // --- Chain helpers -----------------------------------------------------

    /// Align `value` up to a multiple of `modulus`. Chain no-op, no stream
    /// consumption.
    pub fn align(&mut self, value: &mut usize, modulus: usize) -> &mut Self {
        if self.failed {
            return self;
        }
        let rem = *value % modulus;
        if rem != 0 {
            *value += modulus - rem;
        }
        self
    }

    // --- Primitives --------------------------------------------------------

    /// Match any instruction with the given mnemonic.
    pub fn id(&mut self, mnemonic: Mnemonic) -> &mut Self {
        self.match_with(|ins| ins.mnemonic() == mnemonic)
    }

    /// Match any instruction with the given mnemonic, handing the instruction
    /// back for out-of-chain inspection (prefixes etc.).
    pub fn id_captured(
        &mut self,
        mnemonic: Mnemonic,
        captured: &mut Option<Instruction>,
    ) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != mnemonic {
                return false;
            }
            *captured = Some(*ins);
            true
        })
    }

    /// `push %reg`
    pub fn push(&mut self, mut reg: Cell<Register>) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != Mnemonic::Push || ins.op_count() != 1 || !is_reg(ins, 0) {
                return false;
            }
            if !reg.accepts(ins.op0_register()) {
                return false;
            }
            reg.assign(ins.op0_register());
            true
        })
    }

    /// `%mnemonic %reg` with exactly one register operand.
    pub fn generic_reg(
        &mut self,
        mnemonic: Mnemonic,
        mut reg: Cell<Register>,
        match_bases: bool,
    ) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != mnemonic || ins.op_count() != 1 || !is_reg(ins, 0) {
                return false;
            }
            let matched = ins.op0_register();
            let accepted = if match_bases { reg.accepts_base(matched) } else { reg.accepts(matched) };
            if !accepted {
                return false;
            }
            reg.assign(matched);
            true
        })
    }

    /// `%mnemonic %r0, %r1` with two register operands.
    pub fn generic_reg_reg(
        &mut self,
        mnemonic: Mnemonic,
        mut r0: Cell<Register>,
        mut r1: Cell<Register>,
        match_bases: bool,
    ) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != mnemonic
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_reg(ins, 1)
            {
                return false;
            }
            let (m0, m1) = (ins.op0_register(), ins.op1_register());
            let accepted = if match_bases {
                r0.accepts_base(m0) && r1.accepts_base(m1)
            }
            else {
                r0.accepts(m0) && r1.accepts(m1)
            };
            if !accepted {
                return false;
            }
            r0.assign(m0);
            r1.assign(m1);
            true
        })
    }

    /// `%mnemonic %r0, %r1, %r2` with three register operands.
    pub fn generic_reg_reg_reg(
        &mut self,
        mnemonic: Mnemonic,
        mut r0: Cell<Register>,
        mut r1: Cell<Register>,
        mut r2: Cell<Register>,
        match_bases: bool,
    ) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != mnemonic
                || ins.op_count() != 3
                || !is_reg(ins, 0)
                || !is_reg(ins, 1)
                || !is_reg(ins, 2)
            {
                return false;
            }
            let (m0, m1, m2) = (ins.op0_register(), ins.op1_register(), ins.op2_register());
            let accepted = if match_bases {
                r0.accepts_base(m0) && r1.accepts_base(m1) && r2.accepts_base(m2)
            }
            else {
                r0.accepts(m0) && r1.accepts(m1) && r2.accepts(m2)
            };
            if !accepted {
                return false;
            }
            r0.assign(m0);
            r1.assign(m1);
            r2.assign(m2);
            true
        })
    }

    /// `%mnemonic %reg, %imm`
    pub fn generic_reg_imm(
        &mut self,
        mnemonic: Mnemonic,
        mut reg: Cell<Register>,
        mut imm: Cell<u64>,
        match_bases: bool,
    ) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != mnemonic
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_imm(ins, 1)
            {
                return false;
            }
            let matched_reg = ins.op0_register();
            let matched_imm = immediate(ins, 1);
            let reg_accepted =
                if match_bases { reg.accepts_base(matched_reg) } else { reg.accepts(matched_reg) };
            if !reg_accepted || !imm.accepts(matched_imm) {
                return false;
            }
            reg.assign(matched_reg);
            imm.assign(matched_imm);
            true
        })
    }

    /// `mov(zx) %size:%dst, [%src]` with zero displacement and no index.
    /// Registers compare strictly.
    pub fn fetch_memory(
        &mut self,
        mut dst: Cell<Register>,
        mut src: Cell<Register>,
        mut size: Cell<usize>,
    ) -> &mut Self {
        self.match_with(|ins| {
            if !matches!(ins.mnemonic(), Mnemonic::Mov | Mnemonic::Movzx)
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_mem(ins, 1)
            {
                return false;
            }
            if ins.memory_displacement64() != 0 || ins.memory_index() != Register::None {
                return false;
            }
            let matched_dst = ins.op0_register();
            let matched_size = matched_dst.size();
            let matched_src = ins.memory_base();
            if !dst.accepts(matched_dst) || !size.accepts(matched_size) || !src.accepts(matched_src)
            {
                return false;
            }
            dst.assign(matched_dst);
            size.assign(matched_size);
            src.assign(matched_src);
            true
        })
    }

    /// `mov(zx) [%dst], %size:%src`. Registers compare strictly.
    pub fn store_memory(
        &mut self,
        mut dst: Cell<Register>,
        mut src: Cell<Register>,
        mut size: Cell<usize>,
    ) -> &mut Self {
        self.match_with(|ins| {
            if !matches!(ins.mnemonic(), Mnemonic::Mov | Mnemonic::Movzx)
                || ins.op_count() != 2
                || !is_mem(ins, 0)
                || !is_reg(ins, 1)
            {
                return false;
            }
            let matched_dst = ins.memory_base();
            let matched_src = ins.op1_register();
            let matched_size = matched_src.size();
            if !dst.accepts(matched_dst) || !size.accepts(matched_size) || !src.accepts(matched_src)
            {
                return false;
            }
            dst.assign(matched_dst);
            size.assign(matched_size);
            src.assign(matched_src);
            true
        })
    }

    /// `push %size:[%src]` with zero displacement and unit scale.
    pub fn push_memory(&mut self, mut src: Cell<Register>, mut size: Cell<usize>) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != Mnemonic::Push || ins.op_count() != 1 || !is_mem(ins, 0) {
                return false;
            }
            if ins.memory_displacement64() != 0 || ins.memory_index_scale() != 1 {
                return false;
            }
            let matched_src = ins.memory_base();
            let matched_size = ins.memory_size().size();
            if !size.accepts(matched_size) || !src.accepts(matched_src) {
                return false;
            }
            size.assign(matched_size);
            src.assign(matched_src);
            true
        })
    }

    /// `add %reg, %imm` or `sub %reg, %imm`; the mnemonic cell reports which.
    pub fn update_reg(
        &mut self,
        mut mnemonic: Cell<Mnemonic>,
        mut reg: Cell<Register>,
        mut offset: Cell<u64>,
    ) -> &mut Self {
        self.match_with(|ins| {
            if !matches!(ins.mnemonic(), Mnemonic::Add | Mnemonic::Sub)
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_imm(ins, 1)
            {
                return false;
            }
            let matched_offset = immediate(ins, 1);
            if !mnemonic.accepts(ins.mnemonic())
                || !reg.accepts(ins.op0_register())
                || !offset.accepts(matched_offset)
            {
                return false;
            }
            mnemonic.assign(ins.mnemonic());
            reg.assign(ins.op0_register());
            offset.assign(matched_offset);
            true
        })
    }

    /// `lea %reg, [%reg + %offset_reg]` (unit scale, zero displacement) or
    /// `add %reg, %offset_reg`; the mnemonic cell reports which.
    pub fn offset_reg(
        &mut self,
        mut mnemonic: Cell<Mnemonic>,
        mut reg: Cell<Register>,
        mut offset_reg: Cell<Register>,
    ) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() == Mnemonic::Lea
                && mnemonic.accepts(Mnemonic::Lea)
                && is_reg(ins, 0)
                && is_mem(ins, 1)
            {
                let dst = ins.op0_register();
                if !reg.accepts(dst) {
                    return false;
                }
                if ins.memory_base() != dst
                    || ins.memory_index() == Register::None
                    || ins.memory_displacement64() != 0
                    || ins.memory_index_scale() != 1
                {
                    return false;
                }
                if !offset_reg.accepts(ins.memory_index()) {
                    return false;
                }
                mnemonic.assign(Mnemonic::Lea);
                reg.assign(dst);
                offset_reg.assign(ins.memory_index());
                return true;
            }

            if ins.mnemonic() == Mnemonic::Add
                && mnemonic.accepts(Mnemonic::Add)
                && is_reg(ins, 0)
                && is_reg(ins, 1)
            {
                if !reg.accepts(ins.op0_register()) || !offset_reg.accepts(ins.op1_register()) {
                    return false;
                }
                mnemonic.assign(Mnemonic::Add);
                reg.assign(ins.op0_register());
                offset_reg.assign(ins.op1_register());
                return true;
            }

            false
        })
    }

    /// `xor %reg, %rkey` — the start of a rolling-key decryption sequence.
    /// On success `rkey` is widened to its architecture-largest alias.
    pub fn begin_encryption(
        &mut self,
        mut reg: Cell<Register>,
        mut rkey: Cell<Register>,
    ) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != Mnemonic::Xor
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_reg(ins, 1)
            {
                return false;
            }
            if !reg.accepts_base(ins.op0_register()) || !rkey.accepts_base(ins.op1_register()) {
                return false;
            }
            reg.assign(ins.op0_register());
            rkey.assign(ins.op1_register().full_register());
            true
        })
    }

    /// `push %rkey` or `xor %rkey, %reg` — the end of a rolling-key
    /// decryption sequence. `rkey` is widened on success.
    pub fn end_encryption(&mut self, mut reg: Cell<Register>, mut rkey: Cell<Register>) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() == Mnemonic::Push && ins.op_count() == 1 && is_reg(ins, 0) {
                if !rkey.accepts_base(ins.op0_register()) {
                    return false;
                }
                rkey.assign(ins.op0_register().full_register());
                return true;
            }

            if ins.mnemonic() == Mnemonic::Xor
                && ins.op_count() == 2
                && is_reg(ins, 0)
                && is_reg(ins, 1)
            {
                if !rkey.accepts_base(ins.op0_register()) || !reg.accepts_base(ins.op1_register()) {
                    return false;
                }
                rkey.assign(ins.op0_register().full_register());
                reg.assign(ins.op1_register());
                return true;
            }

            false
        })
    }

    /// `mov %reg, [rsp + %offset]` — fetches the encrypted VIP seed from the
    /// native stack.
    pub fn fetch_encrypted_vip(
        &mut self,
        mut reg: Cell<Register>,
        mut offset: Cell<u64>,
    ) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != Mnemonic::Mov
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_mem(ins, 1)
            {
                return false;
            }
            if ins.memory_base() != Register::RSP || ins.memory_index() != Register::None {
                return false;
            }
            let matched_offset = ins.memory_displacement64();
            if !reg.accepts(ins.op0_register()) || !offset.accepts(matched_offset) {
                return false;
            }
            reg.assign(ins.op0_register());
            offset.assign(matched_offset);
            true
        })
    }

    /// `lea %reg, [rip - instruction_length]` — loads the instruction's own
    /// address, establishing the handler-dispatch base.
    pub fn set_flow(&mut self, mut reg: Cell<Register>, mut flow: Cell<u64>) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != Mnemonic::Lea
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_mem(ins, 1)
            {
                return false;
            }
            if ins.memory_base() != Register::RIP
                || ins.memory_index() != Register::None
                || ins.memory_displacement64() != ins.ip()
            {
                return false;
            }
            let matched_flow = ins.ip();
            if !reg.accepts(ins.op0_register()) || !flow.accepts(matched_flow) {
                return false;
            }
            reg.assign(ins.op0_register());
            flow.assign(matched_flow);
            true
        })
    }

    /// `sub rsp, %imm` — the VM's native stack scratch allocation.
    pub fn allocate_stack(&mut self, mut imm: Cell<u64>) -> &mut Self {
        self.match_with(|ins| {
            if ins.mnemonic() != Mnemonic::Sub
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_imm(ins, 1)
            {
                return false;
            }
            if ins.op0_register() != Register::RSP {
                return false;
            }
            let matched = immediate(ins, 1);
            if !imm.accepts(matched) {
                return false;
            }
            imm.assign(matched);
            true
        })
    }

    // --- Named wrappers used by the instruction-set templates ---------------

    pub fn mov_reg_reg(
        &mut self,
        dst: Cell<Register>,
        src: Cell<Register>,
        match_bases: bool,
    ) -> &mut Self {
        self.generic_reg_reg(Mnemonic::Mov, dst, src, match_bases)
    }

    pub fn xor_reg_reg(&mut self, dst: Cell<Register>, src: Cell<Register>) -> &mut Self {
        self.generic_reg_reg(Mnemonic::Xor, dst, src, true)
    }

    pub fn add_reg_reg(&mut self, dst: Cell<Register>, src: Cell<Register>) -> &mut Self {
        self.generic_reg_reg(Mnemonic::Add, dst, src, true)
    }

    pub fn or_reg_reg(&mut self, dst: Cell<Register>, src: Cell<Register>) -> &mut Self {
        self.generic_reg_reg(Mnemonic::Or, dst, src, true)
    }

    pub fn and_reg_reg(&mut self, dst: Cell<Register>, src: Cell<Register>) -> &mut Self {
        self.generic_reg_reg(Mnemonic::And, dst, src, true)
    }

    pub fn shl_reg_reg(&mut self, dst: Cell<Register>, src: Cell<Register>) -> &mut Self {
        self.generic_reg_reg(Mnemonic::Shl, dst, src, true)
    }

    pub fn shr_reg_reg(&mut self, dst: Cell<Register>, src: Cell<Register>) -> &mut Self {
        self.generic_reg_reg(Mnemonic::Shr, dst, src, true)
    }

    pub fn shld_reg_reg_reg(
        &mut self,
        dst: Cell<Register>,
        src: Cell<Register>,
        shift: Cell<Register>,
    ) -> &mut Self {
        self.generic_reg_reg_reg(Mnemonic::Shld, dst, src, shift, true)
    }

    pub fn shrd_reg_reg_reg(
        &mut self,
        dst: Cell<Register>,
        src: Cell<Register>,
        shift: Cell<Register>,
    ) -> &mut Self {
        self.generic_reg_reg_reg(Mnemonic::Shrd, dst, src, shift, true)
    }

    pub fn not_reg(&mut self, dst: Cell<Register>) -> &mut Self {
        self.generic_reg(Mnemonic::Not, dst, true)
    }

    /// `mov %r64, imm64` (the movabs encoding).
    pub fn mov_reg_imm64(&mut self, mut reg: Cell<Register>, mut imm: Cell<u64>) -> &mut Self {
        self.match_with(|ins| {
            if ins.code() != iced_x86::Code::Mov_r64_imm64 {
                return false;
            }
            let matched_imm = immediate(ins, 1);
            if !reg.accepts(ins.op0_register()) || !imm.accepts(matched_imm) {
                return false;
            }
            reg.assign(ins.op0_register());
            imm.assign(matched_imm);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::code_asm::*;

    use super::*;
    use crate::disasm::decode_linear;

    fn assemble(build: impl FnOnce(&mut CodeAssembler)) -> InstructionStream {
        let mut asm = CodeAssembler::new(64).unwrap();
        build(&mut asm);
        let code = asm.assemble(0x1000).unwrap();
        decode_linear(&code, 0x1000)
    }

    #[test]
    fn chain_skips_non_matching_instructions() {
        let mut stream = assemble(|asm| {
            asm.nop().unwrap();
            asm.xor(ecx, ecx).unwrap();
            asm.push(rbx).unwrap();
            asm.mov(rax, rcx).unwrap();
        });

        let mut pushed = Register::None;
        let mut dst = Register::None;
        let mut src = Register::None;
        let mut m = Matcher::new(&mut stream);
        m.push(capture(&mut pushed))
            .mov_reg_reg(capture(&mut dst), capture(&mut src), true);
        assert!(m.ok());
        assert_eq!(pushed, Register::RBX);
        assert_eq!((dst, src), (Register::RAX, Register::RCX));
    }

    #[test]
    fn bound_cell_rejects_mismatch_and_failure_is_absorbing() {
        let mut stream = assemble(|asm| {
            asm.push(rbx).unwrap();
            asm.mov(rax, rcx).unwrap();
        });

        let mut pushed = Register::RDX;
        let mut m = Matcher::new(&mut stream);
        m.push(bound(&mut pushed));
        assert!(!m.ok());

        // Subsequent calls on a failed chain are no-ops.
        let mut dst = Register::None;
        let mut src = Register::None;
        m.mov_reg_reg(capture(&mut dst), capture(&mut src), true);
        assert!(!m.ok());
        assert_eq!(dst, Register::None);
    }

    #[test]
    fn base_register_comparison() {
        let mut stream = assemble(|asm| {
            asm.xor(eax, edx).unwrap();
        });

        // eax/rax share a base; strict comparison would reject this.
        let mut r0 = Register::RAX;
        let mut r1 = Register::RDX;
        let mut m = Matcher::new(&mut stream);
        m.generic_reg_reg(Mnemonic::Xor, bound(&mut r0), bound(&mut r1), true);
        assert!(m.ok());
        assert_eq!(r0, Register::EAX);

        let mut stream = assemble(|asm| {
            asm.xor(eax, edx).unwrap();
        });
        let mut r0 = Register::RAX;
        let mut r1 = Register::RDX;
        let mut m = Matcher::new(&mut stream);
        m.generic_reg_reg(Mnemonic::Xor, bound(&mut r0), bound(&mut r1), false);
        assert!(!m.ok());
    }

    #[test]
    fn restart_determinism() {
        let stream = assemble(|asm| {
            asm.mov(rax, rcx).unwrap();
            asm.add(rax, 4i32).unwrap();
        });

        // A failing chain consumes the whole copy it ran on.
        let mut failing_copy = stream.clone();
        let mut m = Matcher::new(&mut failing_copy);
        m.id(Mnemonic::Ret);
        assert!(!m.ok());

        // A fresh copy matches as if the failure never happened.
        let mut fresh = stream.clone();
        let mut mnemonic = Mnemonic::INVALID;
        let mut reg = Register::None;
        let mut offset = 0u64;
        let mut m = Matcher::new(&mut fresh);
        m.update_reg(capture(&mut mnemonic), capture(&mut reg), capture(&mut offset));
        assert!(m.ok());
        assert_eq!((mnemonic, reg, offset), (Mnemonic::Add, Register::RAX, 4));
    }

    #[test]
    fn observers_fire_once_per_instruction_and_only_in_scope() {
        let mut stream = assemble(|asm| {
            asm.push(rax).unwrap();
            asm.push(rbx).unwrap();
            asm.pushfq().unwrap();
            asm.mov(rdx, rcx).unwrap();
            asm.push(rsi).unwrap(); // outside the recorder scope
            asm.ret().unwrap();
        });

        let mut pushes = Vec::new();
        let mut dst = Register::None;
        let mut src = Register::None;
        let mut m = Matcher::new(&mut stream);
        m.record_pushes(&mut pushes, |m| {
            m.mov_reg_reg(capture(&mut dst), capture(&mut src), true)
        });
        m.id(Mnemonic::Ret);
        assert!(m.ok());
        assert_eq!(
            pushes,
            vec![
                StackSlot::Register(Register::RAX),
                StackSlot::Register(Register::RBX),
                StackSlot::Flags,
            ]
        );
    }

    #[test]
    fn observer_disarms_on_failed_inner_chain() {
        let mut stream = assemble(|asm| {
            asm.push(rax).unwrap();
        });

        let mut pushes = Vec::new();
        let mut m = Matcher::new(&mut stream);
        m.record_pushes(&mut pushes, |m| m.id(Mnemonic::Ret));
        assert!(!m.ok());
        // Still harvested what was consumed before exhaustion.
        assert_eq!(pushes, vec![StackSlot::Register(Register::RAX)]);

        // The observer is gone: a new matcher consuming more instructions
        // must not grow the vector.
        let mut stream = assemble(|asm| {
            asm.push(rbx).unwrap();
            asm.ret().unwrap();
        });
        let mut m = Matcher::new(&mut stream);
        m.id(Mnemonic::Ret);
        assert!(m.ok());
        assert_eq!(pushes.len(), 1);
    }

    #[test]
    fn tracked_register_follows_mov_and_xchg() {
        let mut stream = assemble(|asm| {
            asm.mov(rbp, rsp).unwrap();
            asm.xchg(rbp, r8).unwrap();
            asm.ret().unwrap();
        });

        let mut tracked = [Register::RSP];
        let mut m = Matcher::new(&mut stream);
        m.track_registers(&mut tracked, |m| m.id(Mnemonic::Ret));
        assert!(m.ok());
        // rsp moved into rbp, then rbp swapped into r8.
        assert_eq!(tracked[0], Register::R8);
    }

    #[test]
    fn expression_recorder_learns_decryption_chain() {
        let mut stream = assemble(|asm| {
            asm.xor(rax, rbx).unwrap(); // begin_encryption, not recorded
            asm.bswap(rax).unwrap();
            asm.add(rax, 0x1337i32).unwrap();
            asm.ror(rax, 7i32).unwrap();
            asm.inc(rcx).unwrap(); // writes a different base, ignored
            asm.xor(rbx, rax).unwrap(); // end_encryption
        });

        let mut expression = Expression::new();
        let mut reg = Register::RAX;
        let mut rkey = Register::RBX;
        let mut m = Matcher::new(&mut stream);
        m.begin_encryption(bound(&mut reg), bound(&mut rkey));
        m.record_expression(Register::RAX, &mut expression, |m| {
            m.end_encryption(bound(&mut reg), bound(&mut rkey))
        });
        assert!(m.ok());
        assert_eq!(expression.len(), 3);

        let expected = 0x11223344u64
            .swap_bytes()
            .wrapping_add(0x1337)
            .rotate_right(7);
        assert_eq!(expression.compute(0x11223344, 8), expected);
    }

    #[test]
    fn set_flow_binds_instruction_address() {
        // lea rbx, [rip - 7] encoded at 0x1000; the lea is 7 bytes long, so it
        // loads its own address.
        let stream = decode_linear(b"\x48\x8d\x1d\xf9\xff\xff\xff", 0x1000);
        let mut stream = stream;
        let mut reg = Register::None;
        let mut flow = 0u64;
        let mut m = Matcher::new(&mut stream);
        m.set_flow(capture(&mut reg), capture(&mut flow));
        assert!(m.ok());
        assert_eq!(reg, Register::RBX);
        assert_eq!(flow, 0x1000);
    }
}
