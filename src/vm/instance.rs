//! A per-VMENTRY virtual machine instance: the register assignment and VIP
//! decryption chain recovered from the entry prologue, the entry bridge, and
//! the shared handler cache.

use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;
use iced_x86::{Mnemonic, Register};

use super::bridge::VmBridge;
use super::handler::VmHandler;
use super::{Direction, VmContext, VmState};
use crate::analysis::arith::Expression;
use crate::analysis::matcher::{Matcher, StackSlot, bound, capture};
use crate::disasm::InstructionStream;
use crate::image::MappedImage;

/// Constant the obfuscator folds into decrypted VIP seeds; together with the
/// truncation to 32 bits it reconstitutes a preferred-image-base address.
const VIP_BASE_FIXUP: u64 = 0x1_0000_0000;

/// A reconstructed VM instance, shared by every routine entering through the
/// same VMENTRY.
pub struct VmInstance {
    /// RVA of the VMENTRY's first instruction.
    pub rva: u64,
    /// The entry bridge resolving the first handler.
    pub bridge: VmBridge,
    /// Registers pushed at VMENTRY, in push order, with the trailing
    /// image-base fixup push already dropped.
    pub entry_frame: Vec<StackSlot>,
    initial_state: VmState,
    /// Decrypts the entry stub into the initial logical VIP.
    vip_expression: Expression,
    handlers: Mutex<FxHashMap<u64, Arc<VmHandler>>>,
}

impl VmInstance {
    /// Reconstruct a VM instance from its VMENTRY instruction stream.
    ///
    /// The prologue is a fixed pattern: the encrypted VIP seed is loaded from
    /// the native stack (past the register spill whose pushes form the entry
    /// frame), decrypted and rebased, then the virtual stack, rolling key and
    /// flow registers are established in order.
    pub fn from_stream(stream: &InstructionStream) -> Option<VmInstance> {
        let mut stream = stream.clone();

        let mut vip_expression = Expression::new();
        let mut pushed = Vec::new();

        let mut vip_reg = Register::None;
        let mut vip_stack_offset = 0u64;
        let mut vip_offset_mnemonic = Mnemonic::INVALID;
        let mut vip_offset_reg = Register::None;

        let mut rsp = Register::RSP;
        let mut stack_reg = Register::None;
        let mut stack_alloc = 0u64;

        let mut rolling_key_reg = Register::None;
        let mut flow_reg = Register::None;
        let mut flow_rva = 0u64;

        let mut m = Matcher::new(&mut stream);
        m.record_pushes(&mut pushed, |m| {
            m.fetch_encrypted_vip(capture(&mut vip_reg), capture(&mut vip_stack_offset))
        });
        let vip = vip_reg;
        m.record_expression(vip, &mut vip_expression, |m| {
            m.offset_reg(
                capture(&mut vip_offset_mnemonic),
                bound(&mut vip_reg),
                capture(&mut vip_offset_reg),
            )
        });
        m.mov_reg_reg(capture(&mut stack_reg), bound(&mut rsp), false);
        m.allocate_stack(capture(&mut stack_alloc));
        m.mov_reg_reg(capture(&mut rolling_key_reg), bound(&mut vip_reg), true);
        m.set_flow(capture(&mut flow_reg), capture(&mut flow_rva));
        if !m.ok() {
            return None;
        }
        drop(m);

        // Peek into the entry bridge: the 4-byte VIP step tells us which way
        // the stream runs.
        let mut peek = stream.clone();
        let mut update_mnemonic = Mnemonic::INVALID;
        let mut step = 4u64;

        let mut m = Matcher::new(&mut peek);
        m.update_reg(capture(&mut update_mnemonic), bound(&mut vip_reg), bound(&mut step));
        if !m.ok() {
            return None;
        }
        drop(m);

        let initial_state = VmState {
            stack_reg,
            vip_reg,
            context_reg: Register::RSP,
            rolling_key_reg,
            flow_reg,
            direction: if update_mnemonic == Mnemonic::Add {
                Direction::Down
            }
            else {
                Direction::Up
            },
            flow: flow_rva,
        };

        let bridge = VmBridge::from_stream(&initial_state, &stream)?;

        // The last push is the image-base fixup the obfuscator synthesizes;
        // the lifter re-pushes it against the live base instead.
        pushed.pop();

        Some(VmInstance {
            rva: stream.base(),
            bridge,
            entry_frame: pushed,
            initial_state,
            vip_expression,
            handlers: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn initial_state(&self) -> &VmState {
        &self.initial_state
    }

    /// Decrypt `stub` into the initial logical VIP.
    pub fn initial_vip(&self, stub: u64) -> u64 {
        (self.vip_expression.compute(stub, 8) as u32 as u64) + VIP_BASE_FIXUP
    }

    /// Build the initial [`VmContext`] for an entry stub.
    ///
    /// `load_delta` converts logical (preferred-base) addresses into offsets
    /// of the mapped image; the rolling key seeds from the logical VIP.
    pub fn initialize_context<'i>(
        &self,
        image: &'i MappedImage,
        stub: u64,
        load_delta: i64,
    ) -> VmContext<'i> {
        let vip = self.initial_vip(stub);
        let absolute_vip = vip.wrapping_add_signed(load_delta);
        VmContext::new(image, self.initial_state, vip, absolute_vip)
    }

    /// Look up a cached handler by RVA.
    pub fn find_handler(&self, rva: u64) -> Option<Arc<VmHandler>> {
        self.handlers.lock().unwrap().get(&rva).cloned()
    }

    /// Insert a freshly matched handler, returning the shared copy.
    ///
    /// If another task raced us to it, the earlier insertion wins.
    pub fn add_handler(&self, handler: VmHandler) -> Arc<VmHandler> {
        self.handlers
            .lock()
            .unwrap()
            .entry(handler.rva)
            .or_insert_with(|| Arc::new(handler))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::code_asm::*;

    use super::*;
    use crate::disasm::decode_linear;
    use crate::vm::handler::VmInstructionInfo;
    use crate::vm::isa;

    /// Assemble a synthetic VMENTRY prologue in the obfuscator's shape:
    /// spill the registers, load and decrypt the VIP seed, establish the VM
    /// registers, then begin the entry bridge.
    fn vmentry_stream() -> InstructionStream {
        let mut asm = CodeAssembler::new(64).unwrap();

        // Entry frame: 13 registers, flags, then the image-base fixup.
        for reg in [rax, rcx, rdx, rbx, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13] {
            asm.push(reg).unwrap();
        }
        asm.pushfq().unwrap();
        asm.push(r14).unwrap(); // image-base fixup, dropped from the frame

        // Fetch and decrypt the encrypted VIP seed.
        asm.mov(rsi, qword_ptr(rsp + 0x90)).unwrap();
        asm.not(rsi).unwrap();
        asm.bswap(rsi).unwrap();
        asm.add(rsi, r14).unwrap(); // image-base rebase (offset_reg form)

        // Virtual stack, scratch area, rolling key.
        asm.mov(rbp, rsp).unwrap();
        asm.sub(rsp, 0x140).unwrap();
        asm.mov(rbx, rsi).unwrap();
        let code = asm.assemble(0x6000).unwrap();

        // lea rdi, [rip-7], then the entry bridge: fetch 4 VIP bytes, key
        // xor, decryption chain, dispatch push.
        let mut full = code;
        full.extend_from_slice(b"\x48\x8d\x3d\xf9\xff\xff\xff");

        let mut asm = CodeAssembler::new(64).unwrap();
        asm.mov(edx, dword_ptr(rsi)).unwrap();
        asm.add(rsi, 4).unwrap();
        asm.xor(edx, ebx).unwrap();
        asm.sub(edx, 0x1122).unwrap();
        asm.push(rdx).unwrap();
        asm.ret().unwrap();
        full.extend_from_slice(&asm.assemble(0).unwrap());

        decode_linear(&full, 0x6000)
    }

    #[test]
    fn vmentry_discovery_recovers_the_full_state() {
        let stream = vmentry_stream();
        let instance = VmInstance::from_stream(&stream).unwrap();

        assert_eq!(instance.rva, 0x6000);
        let state = instance.initial_state();
        assert_eq!(state.vip_reg, iced_x86::Register::RSI);
        assert_eq!(state.stack_reg, iced_x86::Register::RBP);
        assert_eq!(state.rolling_key_reg, iced_x86::Register::RBX);
        assert_eq!(state.flow_reg, iced_x86::Register::RDI);
        assert_eq!(state.context_reg, iced_x86::Register::RSP);
        assert_eq!(state.direction, Direction::Down);

        // 15 pushes recorded, the trailing fixup dropped.
        assert_eq!(instance.entry_frame.len(), 14);
        assert_eq!(instance.entry_frame[13], StackSlot::Flags);

        // The stub decryption chain is not/bswap (the register rebase is not
        // an immediate transform and stays out of the chain).
        let seed = 0x0011_2233_4455_6677u64;
        assert_eq!(
            instance.initial_vip(seed),
            ((!seed).swap_bytes() as u32 as u64) + 0x1_0000_0000
        );

        // Entry bridge decryption chain: the sub after the key xor.
        assert_eq!(instance.bridge.expression.len(), 1);
    }

    #[test]
    fn initialize_context_applies_the_load_delta() {
        let stream = vmentry_stream();
        let instance = VmInstance::from_stream(&stream).unwrap();
        let image = MappedImage::from_parts(vec![0; 0x100], 0x1_4000_0000, Vec::new());

        let seed = 0x55u64;
        let vip = instance.initial_vip(seed);
        let ctx = instance.initialize_context(&image, seed, -(0x1_4000_0000i64));
        assert_eq!(ctx.rolling_key, vip);
        assert_eq!(ctx.vip, vip.wrapping_add_signed(-(0x1_4000_0000i64)));
    }

    #[test]
    fn handler_cache_is_idempotent() {
        let stream = vmentry_stream();
        let instance = VmInstance::from_stream(&stream).unwrap();

        assert!(instance.find_handler(0x1234).is_none());
        let inserted = instance.add_handler(VmHandler {
            rva: 0x1234,
            descriptor: isa::INSTRUCTION_SET[0],
            info: VmInstructionInfo::default(),
            bridge: None,
        });

        let found = instance.find_handler(0x1234).unwrap();
        assert!(Arc::ptr_eq(&inserted, &found));

        // Re-inserting hands back the original.
        let second = instance.add_handler(VmHandler {
            rva: 0x1234,
            descriptor: isa::INSTRUCTION_SET[1],
            info: VmInstructionInfo::default(),
            bridge: None,
        });
        assert!(Arc::ptr_eq(&inserted, &second));
    }
}
