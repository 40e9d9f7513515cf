//! Disassembly front-end: turns mapped image bytes into restartable
//! instruction streams for the pattern matchers.
//!
//! VMProtect splinters its handlers with unconditional `jmp` glue, so the
//! default walk follows `jmp imm` transparently (without emitting it) and only
//! stops once real control flow is reached. Entry-stub analysis instead wants
//! the branch instruction itself, which [`disassemble_stub`] provides.

use fxhash::FxHashSet;
use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory, OpAccess, OpKind,
    Register,
};

use crate::image::MappedImage;

/// Upper bound on instructions decoded into a single stream.
const MAX_STREAM_LEN: usize = 0x10000;

/// An ordered, restartable view over a decoded instruction sequence.
///
/// Cloning is cheap and produces an independent cursor over the same
/// underlying instructions, which is how "try a match, restart on failure" is
/// implemented throughout the crate.
#[derive(Debug, Clone)]
pub struct InstructionStream {
    instructions: std::sync::Arc<[Instruction]>,
    index: usize,
    base: u64,
}

impl InstructionStream {
    pub fn new(instructions: Vec<Instruction>, base: u64) -> Self {
        Self {
            instructions: instructions.into(),
            index: 0,
            base,
        }
    }

    /// Return the instruction under the cursor and advance past it.
    pub fn next(&mut self) -> Option<Instruction> {
        let instruction = self.instructions.get(self.index).copied()?;
        self.index += 1;
        Some(instruction)
    }

    /// RVA the stream was disassembled from.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// RVA of the instruction currently under the cursor.
    pub fn rva(&self) -> u64 {
        match self.instructions.get(self.index) {
            Some(instruction) => instruction.ip(),
            None => self.instructions.last().map(|i| i.next_ip()).unwrap_or(self.base),
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The full decoded sequence, ignoring the cursor.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}

fn decode_at(image: &MappedImage, rva: u64) -> Option<Instruction> {
    let bytes = image.read(rva, 1)?;
    let window = &bytes[..bytes.len().min(0x20)];
    let mut decoder = Decoder::with_ip(64, window, rva, DecoderOptions::NONE);
    let instruction = decoder.decode();
    (!instruction.is_invalid()).then_some(instruction)
}

pub(crate) fn is_jmp_imm(instruction: &Instruction) -> bool {
    instruction.flow_control() == FlowControl::UnconditionalBranch
        && matches!(
            instruction.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        )
}

/// Disassemble a handler-shaped run of code starting at `rva`.
///
/// Unconditional `jmp imm` glue is followed without being emitted; the walk
/// ends after a `ret`, any computed branch, a call, a conditional branch, an
/// invalid instruction or a revisited jump target.
pub fn disassemble(image: &MappedImage, rva: u64) -> InstructionStream {
    let mut instructions = Vec::new();
    let mut visited_targets = FxHashSet::default();
    let mut ip = rva;

    while instructions.len() < MAX_STREAM_LEN {
        let Some(instruction) = decode_at(image, ip)
        else {
            break;
        };

        if is_jmp_imm(&instruction) {
            ip = instruction.near_branch_target();
            if !visited_targets.insert(ip) {
                log::trace!("jump cycle at {ip:x}, ending stream");
                break;
            }
            continue;
        }

        instructions.push(instruction);

        match instruction.flow_control() {
            FlowControl::Next => ip = instruction.next_ip(),
            _ => break,
        }
    }

    InstructionStream::new(instructions, rva)
}

/// Disassemble from `rva`, stopping at (and including) the first branching
/// instruction. Used for entry-stub analysis where the terminating
/// `call imm` is part of the pattern.
pub fn disassemble_stub(image: &MappedImage, rva: u64) -> InstructionStream {
    let mut instructions = Vec::new();
    let mut ip = rva;

    while instructions.len() < MAX_STREAM_LEN {
        let Some(instruction) = decode_at(image, ip)
        else {
            break;
        };
        instructions.push(instruction);
        match instruction.flow_control() {
            FlowControl::Next => ip = instruction.next_ip(),
            _ => break,
        }
    }

    InstructionStream::new(instructions, rva)
}

/// Linearly decode every instruction in `[start, end)`, skipping nothing.
pub fn disassemble_simple(image: &MappedImage, start: u64, end: u64) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut ip = start;

    while ip < end {
        let Some(instruction) = decode_at(image, ip)
        else {
            break;
        };
        ip = instruction.next_ip();
        instructions.push(instruction);
    }

    instructions
}

/// Decode a straight-line run of raw code bytes into a stream.
pub fn decode_linear(code: &[u8], ip: u64) -> InstructionStream {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            break;
        }
        instructions.push(instruction);
    }
    InstructionStream::new(instructions, ip)
}

/// Registers read and written by `instruction`, including implicit accesses.
pub fn regs_accessed(instruction: &Instruction) -> (Vec<Register>, Vec<Register>) {
    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(instruction);

    let mut read = Vec::new();
    let mut written = Vec::new();
    for reg in info.used_registers() {
        match reg.access() {
            OpAccess::Read | OpAccess::CondRead => read.push(reg.register()),
            OpAccess::Write | OpAccess::CondWrite => written.push(reg.register()),
            OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                read.push(reg.register());
                written.push(reg.register());
            }
            _ => {}
        }
    }
    (read, written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MappedImage;

    #[test]
    fn stream_cursor_and_restart() {
        // mov rax, 1; add rax, 2; ret
        let code = b"\x48\xc7\xc0\x01\x00\x00\x00\x48\x83\xc0\x02\xc3";
        let mut stream = decode_linear(code, 0x1000);
        assert_eq!(stream.base(), 0x1000);
        assert_eq!(stream.rva(), 0x1000);

        let restart = stream.clone();
        assert!(stream.next().is_some());
        assert_eq!(stream.rva(), 0x1007);

        // The copy is unaffected by advancement of the original.
        let mut restart = restart;
        assert_eq!(restart.rva(), 0x1000);
        assert_eq!(restart.next().unwrap().ip(), 0x1000);
    }

    #[test]
    fn disassemble_follows_jmp_glue() {
        // 0x0: jmp 0x10
        // 0x10: xor eax, eax; ret
        let mut buffer = vec![0xcc; 0x20];
        buffer[0..2].copy_from_slice(b"\xeb\x0e");
        buffer[0x10..0x13].copy_from_slice(b"\x31\xc0\xc3");
        let image = MappedImage::from_parts(buffer, 0, Vec::new());

        let stream = disassemble(&image, 0);
        let mnemonics: Vec<_> = stream.instructions().iter().map(|i| i.mnemonic()).collect();
        assert_eq!(
            mnemonics,
            vec![iced_x86::Mnemonic::Xor, iced_x86::Mnemonic::Ret]
        );
    }

    #[test]
    fn disassemble_stub_keeps_branch() {
        // push 0x11223344; call rel32
        let mut buffer = vec![0u8; 0x20];
        buffer[0..5].copy_from_slice(b"\x68\x44\x33\x22\x11");
        buffer[5..10].copy_from_slice(b"\xe8\x10\x00\x00\x00");
        let image = MappedImage::from_parts(buffer, 0, Vec::new());

        let stream = disassemble_stub(&image, 0);
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.instructions()[1].mnemonic(), iced_x86::Mnemonic::Call);
    }
}
