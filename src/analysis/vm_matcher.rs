//! [`Matcher`] specialization that binds the VM-state registers (VSP, VIP,
//! VCTX, rolling key, flow) into templates, so handler patterns can be written
//! against "the virtual stack" instead of concrete physical registers.
//!
//! All base [`Matcher`] primitives and observers remain reachable through
//! deref, so templates freely mix generic and VM-specific steps.

use iced_x86::{Mnemonic, Register};

use super::arith::Expression;
use super::matcher::{Cell, Matcher, bound, is_mem, is_reg};
use crate::disasm::InstructionStream;
use crate::vm::VmState;

/// Stack alignment applied to virtual stack slot sizes.
pub const STACK_ALIGNMENT: usize = 2;

/// A [`Matcher`] with a bound [`VmState`].
pub struct VmMatcher<'s, 'v> {
    inner: Matcher<'s>,
    state: &'v VmState,
}

impl<'s> std::ops::Deref for VmMatcher<'s, '_> {
    type Target = Matcher<'s>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::ops::DerefMut for VmMatcher<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<'s, 'v> VmMatcher<'s, 'v> {
    pub fn new(stream: &'s mut InstructionStream, state: &'v VmState) -> Self {
        Self {
            inner: Matcher::new(stream),
            state,
        }
    }

    /// `mov VIP, %reg`
    pub fn set_vip(&mut self, reg: Cell<Register>) -> &mut Self {
        let mut vip = self.state.vip_reg;
        self.inner.generic_reg_reg(Mnemonic::Mov, bound(&mut vip), reg, false);
        self
    }

    /// `add VSP, %imm`
    pub fn add_vsp(&mut self, imm: Cell<u64>) -> &mut Self {
        let mut stack = self.state.stack_reg;
        self.inner.generic_reg_imm(Mnemonic::Add, bound(&mut stack), imm, false);
        self
    }

    /// `add VIP, %imm` or `sub VIP, %imm`; the mnemonic cell reports which.
    pub fn update_vip(&mut self, mnemonic: Cell<Mnemonic>, offset: Cell<u64>) -> &mut Self {
        let mut vip = self.state.vip_reg;
        self.inner.update_reg(mnemonic, bound(&mut vip), offset);
        self
    }

    /// `lea VIP, [VIP + %offset_reg]` or `add VIP, %offset_reg`.
    pub fn offset_vip(&mut self, mnemonic: Cell<Mnemonic>, offset_reg: Cell<Register>) -> &mut Self {
        let mut vip = self.state.vip_reg;
        self.inner.offset_reg(mnemonic, bound(&mut vip), offset_reg);
        self
    }

    /// `mov(zx) %reg, %size:[VIP]` — a read from the bytecode stream.
    pub fn fetch_vip(&mut self, mut reg: Cell<Register>, mut size: Cell<usize>) -> &mut Self {
        let state = self.state;
        self.inner.match_with(|ins| {
            if !matches!(ins.mnemonic(), Mnemonic::Mov | Mnemonic::Movzx)
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_mem(ins, 1)
            {
                return false;
            }
            if ins.memory_base() != state.vip_reg || ins.memory_index() != Register::None {
                return false;
            }
            let matched_size = ins.memory_size().size();
            if !reg.accepts(ins.op0_register()) || !size.accepts(matched_size) {
                return false;
            }
            reg.assign(ins.op0_register());
            size.assign(matched_size);
            true
        });
        self
    }

    /// `mov(zx) %size:%dst, [VSP + %disp]` — a read from the virtual stack.
    pub fn fetch_vsp(
        &mut self,
        mut dst: Cell<Register>,
        mut size: Cell<usize>,
        mut disp: Cell<i64>,
    ) -> &mut Self {
        let state = self.state;
        self.inner.match_with(|ins| {
            if !matches!(ins.mnemonic(), Mnemonic::Mov | Mnemonic::Movzx)
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_mem(ins, 1)
            {
                return false;
            }
            if ins.memory_base() != state.stack_reg || ins.memory_index() != Register::None {
                return false;
            }
            let matched_size = ins.op0_register().size();
            let matched_disp = ins.memory_displacement64() as i64;
            if !dst.accepts(ins.op0_register())
                || !size.accepts(matched_size)
                || !disp.accepts(matched_disp)
            {
                return false;
            }
            dst.assign(ins.op0_register());
            size.assign(matched_size);
            disp.assign(matched_disp);
            true
        });
        self
    }

    /// `mov %size:[VSP], %src` — a write to the top of the virtual stack.
    /// The source register compares by base.
    pub fn store_vsp(&mut self, mut src: Cell<Register>, mut size: Cell<usize>) -> &mut Self {
        let state = self.state;
        self.inner.match_with(|ins| {
            if ins.mnemonic() != Mnemonic::Mov
                || ins.op_count() != 2
                || !is_mem(ins, 0)
                || !is_reg(ins, 1)
            {
                return false;
            }
            if ins.memory_base() != state.stack_reg
                || ins.memory_index() != Register::None
                || ins.memory_displacement64() != 0
            {
                return false;
            }
            let matched_size = ins.memory_size().size();
            if !src.accepts_base(ins.op1_register()) || !size.accepts(matched_size) {
                return false;
            }
            src.assign(ins.op1_register());
            size.assign(matched_size);
            true
        });
        self
    }

    /// `mov(zx) %dst, %size:[VCTX + %disp_reg]` — a virtual register-file
    /// read. The displacement register compares by base.
    pub fn fetch_ctx(
        &mut self,
        mut dst: Cell<Register>,
        mut size: Cell<usize>,
        mut disp: Cell<Register>,
    ) -> &mut Self {
        let state = self.state;
        self.inner.match_with(|ins| {
            if !matches!(ins.mnemonic(), Mnemonic::Mov | Mnemonic::Movzx)
                || ins.op_count() != 2
                || !is_reg(ins, 0)
                || !is_mem(ins, 1)
            {
                return false;
            }
            if ins.memory_base() != state.context_reg
                || ins.memory_displacement64() != 0
                || ins.memory_index_scale() != 1
            {
                return false;
            }
            let matched_size = ins.memory_size().size();
            if !dst.accepts(ins.op0_register())
                || !size.accepts(matched_size)
                || !disp.accepts_base(ins.memory_index())
            {
                return false;
            }
            dst.assign(ins.op0_register());
            size.assign(matched_size);
            disp.assign(ins.memory_index());
            true
        });
        self
    }

    /// `mov %size:[VCTX + %disp_reg], %src` — a virtual register-file write.
    /// Source and displacement registers compare by base.
    pub fn store_ctx(
        &mut self,
        mut src: Cell<Register>,
        mut size: Cell<usize>,
        mut disp: Cell<Register>,
    ) -> &mut Self {
        let state = self.state;
        self.inner.match_with(|ins| {
            if ins.mnemonic() != Mnemonic::Mov
                || ins.op_count() != 2
                || !is_mem(ins, 0)
                || !is_reg(ins, 1)
            {
                return false;
            }
            if ins.memory_base() != state.context_reg
                || ins.memory_displacement64() != 0
                || ins.memory_index_scale() != 1
            {
                return false;
            }
            let matched_size = ins.memory_size().size();
            if !src.accepts_base(ins.op1_register())
                || !size.accepts(matched_size)
                || !disp.accepts_base(ins.memory_index())
            {
                return false;
            }
            src.assign(ins.op1_register());
            size.assign(matched_size);
            disp.assign(ins.memory_index());
            true
        });
        self
    }

    /// Advance over a rolling-key decryption sequence of `reg`, recording the
    /// arithmetic chain between the opening and closing key operations.
    pub fn record_encryption(&mut self, reg: Register, expression: &mut Expression) -> &mut Self {
        if !self.ok() {
            return self;
        }
        let mut target = reg;
        let mut rkey = self.state.rolling_key_reg;
        self.inner.begin_encryption(bound(&mut target), bound(&mut rkey));
        self.inner.record_expression(reg, expression, |m| {
            m.end_encryption(bound(&mut target), bound(&mut rkey))
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::code_asm::*;

    use super::*;
    use crate::analysis::matcher::capture;
    use crate::disasm::decode_linear;
    use crate::vm::Direction;

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

    fn assemble(build: impl FnOnce(&mut CodeAssembler)) -> InstructionStream {
        let mut asm = CodeAssembler::new(64).unwrap();
        build(&mut asm);
        let code = asm.assemble(0x1000).unwrap();
        decode_linear(&code, 0x1000)
    }

    #[test]
    fn fetch_vsp_and_store_ctx_bind_vm_registers() {
        let mut stream = assemble(|asm| {
            asm.mov(rax, qword_ptr(rbp)).unwrap();
            asm.add(rbp, 8i32).unwrap();
            asm.mov(qword_ptr(rsp + rdx), rax).unwrap();
        });

        let state = test_state();
        let mut m = VmMatcher::new(&mut stream, &state);

        let mut dst = iced_x86::Register::None;
        let mut size = 0usize;
        let mut disp = 0i64;
        let mut store_size = 0usize;
        let mut index = iced_x86::Register::RDX;
        let mut vsp_add = 8u64;

        m.fetch_vsp(capture(&mut dst), capture(&mut size), bound(&mut disp))
            .add_vsp(bound(&mut vsp_add));
        let mut src = dst;
        m.store_ctx(bound(&mut src), capture(&mut store_size), bound(&mut index));
        assert!(m.ok());
        assert_eq!(dst, iced_x86::Register::RAX);
        assert_eq!(size, 8);
        assert_eq!(store_size, 8);
    }

    #[test]
    fn fetch_vip_requires_the_vip_base_register() {
        let mut stream = assemble(|asm| {
            // reads through rcx, not the VIP register
            asm.mov(eax, dword_ptr(rcx)).unwrap();
        });

        let state = test_state();
        let mut m = VmMatcher::new(&mut stream, &state);
        let mut reg = iced_x86::Register::None;
        let mut size = 0usize;
        m.fetch_vip(capture(&mut reg), capture(&mut size));
        assert!(!m.ok());
    }

    #[test]
    fn record_encryption_scopes_the_chain() {
        let mut stream = assemble(|asm| {
            asm.xor(rax, rbx).unwrap(); // begin
            asm.not(rax).unwrap();
            asm.add(rax, 0x11i32).unwrap();
            asm.push(rbx).unwrap(); // end (stack variant)
        });

        let state = test_state();
        let mut m = VmMatcher::new(&mut stream, &state);
        let mut expression = Expression::new();
        m.record_encryption(iced_x86::Register::RAX, &mut expression);
        assert!(m.ok());
        assert_eq!(expression.len(), 2);
        assert_eq!(expression.compute(5, 8), (!5u64).wrapping_add(0x11));
    }

    #[test]
    fn update_vip_reports_direction_mnemonic() {
        let mut stream = assemble(|asm| {
            asm.sub(rsi, 4i32).unwrap();
        });

        let state = test_state();
        let mut m = VmMatcher::new(&mut stream, &state);
        let mut mnemonic = Mnemonic::INVALID;
        let mut offset = 4u64;
        m.update_vip(capture(&mut mnemonic), bound(&mut offset));
        assert!(m.ok());
        assert_eq!(mnemonic, Mnemonic::Sub);
    }
}
