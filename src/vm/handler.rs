//! A decoded VM handler: the matched descriptor, its operand templates with
//! their decryption chains, and the bridge that resolves the next handler.

use iced_x86::Register;
use smallvec::SmallVec;

use super::bridge::VmBridge;
use super::isa::{self, VmOpcodeDesc, VmOpcodeFlags};
use super::{VmContext, VmState};
use crate::analysis::arith::{Expression, truncate};
use crate::analysis::matcher::StackSlot;
use crate::disasm::InstructionStream;

/// What a VIP-decoded operand denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOperandKind {
    /// An immediate value.
    Imm,
    /// An index into the virtual register file.
    Reg,
}

/// Decoding template for one operand of a virtual instruction.
#[derive(Debug, Clone, Copy)]
pub struct VmOperand {
    pub kind: VmOperandKind,
    /// Logical width in bytes, e.g. the virtual-register slot width.
    pub size: usize,
    /// How many bytes the operand consumes from the VIP stream. A register
    /// index typically occupies fewer bytes than the slot it addresses.
    pub vip_length: usize,
}

/// Handler-specific data remembered during matching for emission.
#[derive(Debug, Clone, Default)]
pub enum CustomData {
    #[default]
    None,
    /// A pinned physical register (`PUSHREG` / `POPREG`).
    Reg(Register),
    /// A pinned register pair (`LOCKOR`).
    Regs(Vec<Register>),
    /// The restored register sequence of a `VMEXIT`.
    Slots(Vec<StackSlot>),
}

/// Everything learned about a handler while matching it, minus anything
/// VIP-derived.
#[derive(Default)]
pub struct VmInstructionInfo {
    /// Operand templates paired with their decryption expressions.
    pub operands: Vec<(VmOperand, Expression)>,
    /// Arbitrary sizes captured during matching, consumed by emission.
    pub sizes: SmallVec<[usize; 4]>,
    pub custom: CustomData,
    /// Present when the handler mutates the VM state mid-routine.
    pub updated_state: Option<VmState>,
}

/// A matched handler at a specific RVA.
pub struct VmHandler {
    pub rva: u64,
    pub descriptor: &'static VmOpcodeDesc,
    pub info: VmInstructionInfo,
    /// Absent on `VMEXIT`: nothing follows it.
    pub bridge: Option<VmBridge>,
}

impl VmHandler {
    /// Try each descriptor of the instruction set against a copy of `stream`,
    /// in catalog order; the first match wins.
    ///
    /// If the matched handler updates the VM state, `state` is overwritten
    /// from the recovered update before the bridge is parsed.
    pub fn from_stream(state: &mut VmState, stream: &InstructionStream) -> Option<VmHandler> {
        let rva = stream.rva();

        for &descriptor in isa::INSTRUCTION_SET {
            let mut info = VmInstructionInfo::default();
            let mut attempt = stream.clone();

            if !(descriptor.matches)(state, &mut attempt, &mut info) {
                continue;
            }

            if descriptor.flags.contains(VmOpcodeFlags::UPDATES_STATE)
                && let Some(updated) = info.updated_state
            {
                *state = updated;
            }

            if descriptor.flags.contains(VmOpcodeFlags::VMEXIT) {
                return Some(VmHandler {
                    rva,
                    descriptor,
                    info,
                    bridge: None,
                });
            }

            // The bridge always immediately follows the handler, and matching
            // advanced the attempt stream exactly there.
            let bridge = VmBridge::from_stream(state, &attempt)?;
            return Some(VmHandler {
                rva,
                descriptor,
                info,
                bridge: Some(bridge),
            });
        }

        None
    }

    /// Decode the handler's operands from the VIP stream, advancing `ctx` and
    /// folding each decrypted value back into the rolling key.
    pub fn decode<'h>(&'h self, ctx: &mut VmContext) -> VmInstruction<'h> {
        let mut operands = SmallVec::new();

        for (operand, expression) in &self.info.operands {
            let mut value = ctx.fetch(operand.vip_length);
            value ^= truncate(ctx.rolling_key, operand.vip_length);
            value = expression.compute(value, operand.vip_length);
            ctx.rolling_key ^= value;
            operands.push(value);
        }

        VmInstruction {
            handler: self,
            operands,
        }
    }
}

/// A fully decoded virtual instruction: a handler plus the operand values
/// fetched from the VIP stream.
pub struct VmInstruction<'h> {
    pub handler: &'h VmHandler,
    pub operands: SmallVec<[u64; 2]>,
}

impl std::fmt::Display for VmInstruction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\t", self.handler.descriptor.name)?;
        for (i, value) in self.operands.iter().enumerate() {
            let operand = &self.handler.info.operands[i].0;
            match operand.kind {
                VmOperandKind::Imm => write!(f, "{}:0x{value:x}", operand.size)?,
                VmOperandKind::Reg => write!(f, "REG:{}:0x{value:x}", operand.size)?,
            }
            if i + 1 != self.operands.len() {
                write!(f, ",\t")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::arith::{Expression, Operation, XOR};
    use crate::image::MappedImage;
    use crate::vm::Direction;

    fn test_state() -> VmState {
        VmState {
            stack_reg: Register::RBP,
            vip_reg: Register::RSI,
            context_reg: Register::RSP,
            rolling_key_reg: Register::RBX,
            flow_reg: Register::RDI,
            direction: Direction::Down,
            flow: 0,
        }
    }

    #[test]
    fn decode_follows_the_rolling_key_contract() {
        // One 4-byte register-index operand whose decryption chain is a
        // constant xor.
        let mut expression = Expression::new();
        expression.push(Operation {
            descriptor: &XOR,
            extra: [0x1111_1111u64].into_iter().collect(),
        });

        let handler = VmHandler {
            rva: 0,
            descriptor: isa::INSTRUCTION_SET[0],
            info: VmInstructionInfo {
                operands: vec![(
                    VmOperand {
                        kind: VmOperandKind::Reg,
                        size: 8,
                        vip_length: 4,
                    },
                    expression,
                )],
                ..Default::default()
            },
            bridge: None,
        };

        let encrypted: u32 = 0xAABBCCDD;
        let image = MappedImage::from_parts(encrypted.to_le_bytes().to_vec(), 0, Vec::new());
        let key = 0xDEAD_BEEF_0102_0304u64;
        let mut ctx = VmContext::new(&image, test_state(), key, 0);

        let decoded = handler.decode(&mut ctx);
        let expected = (encrypted as u64 ^ (key & 0xFFFF_FFFF)) ^ 0x1111_1111;
        assert_eq!(decoded.operands.as_slice(), &[expected]);
        // Decoded operand folds back into the rolling key.
        assert_eq!(ctx.rolling_key, key ^ expected);
        assert_eq!(ctx.vip, 4);
    }
}
