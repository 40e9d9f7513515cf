//! The native glue that follows every non-exit handler: it decrypts the next
//! handler's signed 32-bit offset from the VIP stream and adds it to the flow
//! address.

use iced_x86::{Mnemonic, Register};

use super::{VmContext, VmState};
use crate::analysis::arith::Expression;
use crate::analysis::matcher::{bound, capture};
use crate::analysis::vm_matcher::VmMatcher;
use crate::disasm::InstructionStream;

/// A parsed bridge: where it lives and how the handler offset is decrypted.
pub struct VmBridge {
    pub rva: u64,
    /// Decryption chain applied after the rolling-key XOR.
    pub expression: Expression,
}

impl VmBridge {
    /// Resolve the next handler, updating the rolling key, flow and VIP.
    ///
    /// Handler offsets are signed; the 32→64 sign extension matters.
    pub fn advance(&self, ctx: &mut VmContext) -> u64 {
        let mut next = ctx.fetch(4) as u32 ^ ctx.rolling_key as u32;
        next = self.expression.compute(next as u64, 8) as u32;

        ctx.rolling_key ^= next as u64;
        ctx.state.flow = ctx.state.flow.wrapping_add_signed(next as i32 as i64);
        ctx.state.flow
    }

    /// Parse a bridge from the stream position a handler match left behind.
    ///
    /// The pattern is a 4-byte VIP fetch, the rolling-key XOR, then an
    /// arithmetic chain ending at the `push` that carries the decrypted
    /// offset towards the dispatch jump.
    pub fn from_stream(state: &VmState, stream: &InstructionStream) -> Option<VmBridge> {
        let mut stream = stream.clone();
        let mut expression = Expression::new();

        let mut fetch_reg = Register::None;
        let mut fetch_size = 4usize;
        let mut rolling_key_reg = state.rolling_key_reg;

        let mut m = VmMatcher::new(&mut stream, state);
        m.fetch_vip(capture(&mut fetch_reg), bound(&mut fetch_size));
        let target = fetch_reg;
        m.xor_reg_reg(bound(&mut fetch_reg), bound(&mut rolling_key_reg));
        m.record_expression(target, &mut expression, |m| m.id(Mnemonic::Push));

        if !m.ok() {
            return None;
        }
        drop(m);

        Some(VmBridge {
            rva: stream.base(),
            expression,
        })
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::code_asm::*;

    use super::*;
    use crate::analysis::arith::{Operation, SUB};
    use crate::disasm::decode_linear;
    use crate::image::MappedImage;
    use crate::vm::{Direction, VmContext};

    fn test_state() -> VmState {
        VmState {
            stack_reg: iced_x86::Register::RBP,
            vip_reg: iced_x86::Register::RSI,
            context_reg: iced_x86::Register::RSP,
            rolling_key_reg: iced_x86::Register::RBX,
            flow_reg: iced_x86::Register::RDI,
            direction: Direction::Down,
            flow: 0x7000,
        }
    }

    #[test]
    fn parse_records_the_decryption_chain() {
        let mut asm = CodeAssembler::new(64).unwrap();
        asm.mov(eax, dword_ptr(rsi)).unwrap(); // fetch 4 bytes from VIP
        asm.xor(eax, ebx).unwrap(); // rolling-key xor
        asm.sub(eax, 0x1337).unwrap(); // decryption chain
        asm.bswap(eax).unwrap();
        asm.push(rax).unwrap(); // offset captured
        asm.ret().unwrap();
        let code = asm.assemble(0x4000).unwrap();
        let stream = decode_linear(&code, 0x4000);

        let state = test_state();
        let bridge = VmBridge::from_stream(&state, &stream).unwrap();
        assert_eq!(bridge.rva, 0x4000);
        assert_eq!(bridge.expression.len(), 2);
        assert_eq!(
            bridge.expression.compute(0x11223344, 4),
            0x1122_3344u32.wrapping_sub(0x1337).swap_bytes() as u64
        );
    }

    #[test]
    fn advance_matches_the_bridge_identities() {
        // Identity decryption chain: next = fetch ^ key32, sign-extended into
        // the flow.
        let bridge = VmBridge {
            rva: 0,
            expression: Expression::new(),
        };

        let encrypted: u32 = 0xFFFF_FF00 ^ 0x1234_5678; // decrypts to -256
        let image = MappedImage::from_parts(encrypted.to_le_bytes().to_vec(), 0, Vec::new());
        let mut ctx = VmContext::new(&image, test_state(), 0x9999_0000_1234_5678, 0);

        let next = bridge.advance(&mut ctx);
        assert_eq!(next, 0x7000 - 256);
        assert_eq!(ctx.state.flow, next);
        assert_eq!(ctx.rolling_key, 0x9999_0000_1234_5678u64 ^ 0xFFFF_FF00);
        assert_eq!(ctx.vip, 4);
    }

    #[test]
    fn negative_offset_sign_extends() {
        let mut expression = Expression::new();
        expression.push(Operation {
            descriptor: &SUB,
            extra: [0x10u64].into_iter().collect(),
        });
        let bridge = VmBridge { rva: 0, expression };

        // fetch ^ key = 8, expression yields 8 - 0x10 = -8 as u32.
        let image = MappedImage::from_parts(8u32.to_le_bytes().to_vec(), 0, Vec::new());
        let mut ctx = VmContext::new(&image, test_state(), 0, 0);
        let next = bridge.advance(&mut ctx);
        assert_eq!(next, 0x7000 - 8);
        assert_eq!(ctx.rolling_key, 0xFFFF_FFF8);
    }
}
