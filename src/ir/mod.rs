//! The intermediate representation lifted routines are emitted into.
//!
//! The shape is deliberately small: a routine is an ordered map of basic
//! blocks keyed by their virtual instruction pointer, each block a flat list
//! of register-machine ops. Blocks chain into their successors via `fork`,
//! which is how the lifter mirrors the VM's control flow. Rendering a routine
//! with [`Display`](std::fmt::Display) produces the serialized listing the
//! CLI writes to disk.

pub mod opt;
pub mod tracer;

use indexmap::IndexMap;

/// Individual rflags bits modeled as one-bit registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    If,
    Df,
    Of,
}

/// A register in the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// A physical x86 register.
    Phys(iced_x86::Register),
    /// A slot of the virtual register file. `bit_offset`/`bits` select the
    /// accessed part of the 64-bit slot.
    Virtual { slot: u16, bit_offset: u16, bits: u16 },
    /// A block-local temporary.
    Tmp { id: u32, bits: u16 },
    /// The flags aggregate pushed by `pushf`.
    Flags,
    /// A single flag bit.
    Flag(Flag),
    /// The symbolic image base the obfuscator threads through its streams.
    ImageBase,
    /// The virtual stack pointer.
    Sp,
}

impl Reg {
    pub fn bits(&self) -> u16 {
        match self {
            Reg::Phys(r) => (r.size() * 8) as u16,
            Reg::Virtual { bits, .. } | Reg::Tmp { bits, .. } => *bits,
            Reg::Flags | Reg::ImageBase | Reg::Sp => 64,
            Reg::Flag(_) => 1,
        }
    }
}

/// An operand: a register, an immediate of a given width, or an explicitly
/// undefined value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm { value: u64, bits: u16 },
    Undefined,
}

impl Operand {
    pub fn imm(value: u64, bits: u16) -> Self {
        Operand::Imm { value, bits }
    }

    pub fn imm64(value: u64) -> Self {
        Operand::Imm { value, bits: 64 }
    }
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Reg(reg)
    }
}

/// One IR operation. Variants map one-to-one onto the block builder methods.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Push(Operand),
    Pop(Reg),
    Mov(Reg, Operand),
    Add(Reg, Operand),
    Sub(Reg, Operand),
    /// `dst = lo(dst * src)` / `dst = hi(dst * src)`, unsigned then signed.
    Mul(Reg, Operand),
    Mulhi(Reg, Operand),
    Imul(Reg, Operand),
    Imulhi(Reg, Operand),
    /// `dst = [hi:dst] / src` and the remainder counterpart, unsigned then
    /// signed. Operands are (dst, hi, src).
    Div(Reg, Operand, Operand),
    Rem(Reg, Operand, Operand),
    Idiv(Reg, Operand, Operand),
    Irem(Reg, Operand, Operand),
    Bshl(Reg, Operand),
    Bshr(Reg, Operand),
    Bor(Reg, Operand),
    Band(Reg, Operand),
    Bxor(Reg, Operand),
    Bnot(Reg),
    /// `mem[base + offset] := value`
    Str { base: Reg, offset: Operand, value: Operand },
    /// `dst := mem[base + offset]`
    Ldd { dst: Reg, base: Reg, offset: Operand },
    Jmp(Operand),
    /// Call into another virtualized entry; execution resumes afterwards.
    Vxcall(Operand),
    /// Leave virtualized execution for good.
    Vexit(Operand),
    /// Opaque byte emitted verbatim into the output stream.
    Vemit(u8),
    /// Opaque assembly emitted verbatim.
    Vemits(String),
    /// Pin a physical register as read by following opaque bytes.
    Vpinr(iced_x86::Register),
    /// Pin a physical register as written by preceding opaque bytes.
    Vpinw(iced_x86::Register),
    Nop,
    Popf,
    Pushf,
    /// `dst := (a <s b)`, `dst := (a == b)`, `dst := (a != b)`,
    /// `dst := (a <u b)`.
    Tl(Reg, Operand, Operand),
    Te(Reg, Operand, Operand),
    Tne(Reg, Operand, Operand),
    Tul(Reg, Operand, Operand),
    /// `dst := cond ? value : 0`
    Ifs(Reg, Operand, Operand),
    Label(String),
}

/// One basic block of a lifted routine, identified by its entry VIP.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    vip: u64,
    pub ops: Vec<Op>,
    pub prev: Vec<u64>,
    pub next: Vec<u64>,
    next_tmp: u32,
}

impl BasicBlock {
    fn new(vip: u64) -> Self {
        Self {
            vip,
            ops: Vec::new(),
            prev: Vec::new(),
            next: Vec::new(),
            next_tmp: 0,
        }
    }

    pub fn entry_vip(&self) -> u64 {
        self.vip
    }

    /// Allocate a fresh block-local temporary of the given bit width.
    pub fn tmp(&mut self, bits: u16) -> Reg {
        let id = self.next_tmp;
        self.next_tmp += 1;
        Reg::Tmp { id, bits }
    }

    /// Allocate several temporaries at once.
    pub fn tmps<const N: usize>(&mut self, bits: [u16; N]) -> [Reg; N] {
        bits.map(|b| self.tmp(b))
    }

    /// A block is complete once it ends in a branch or an exit.
    pub fn is_complete(&self) -> bool {
        matches!(self.ops.last(), Some(Op::Jmp(_)) | Some(Op::Vexit(_)))
    }

    pub fn push(&mut self, value: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Push(value.into()));
        self
    }

    pub fn pop(&mut self, reg: Reg) -> &mut Self {
        self.ops.push(Op::Pop(reg));
        self
    }

    pub fn mov(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Mov(dst, src.into()));
        self
    }

    pub fn add(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Add(dst, src.into()));
        self
    }

    pub fn sub(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Sub(dst, src.into()));
        self
    }

    pub fn mul(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Mul(dst, src.into()));
        self
    }

    pub fn mulhi(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Mulhi(dst, src.into()));
        self
    }

    pub fn imul(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Imul(dst, src.into()));
        self
    }

    pub fn imulhi(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Imulhi(dst, src.into()));
        self
    }

    pub fn div(&mut self, dst: Reg, hi: impl Into<Operand>, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Div(dst, hi.into(), src.into()));
        self
    }

    pub fn rem(&mut self, dst: Reg, hi: impl Into<Operand>, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Rem(dst, hi.into(), src.into()));
        self
    }

    pub fn idiv(&mut self, dst: Reg, hi: impl Into<Operand>, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Idiv(dst, hi.into(), src.into()));
        self
    }

    pub fn irem(&mut self, dst: Reg, hi: impl Into<Operand>, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Irem(dst, hi.into(), src.into()));
        self
    }

    pub fn bshl(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Bshl(dst, src.into()));
        self
    }

    pub fn bshr(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Bshr(dst, src.into()));
        self
    }

    pub fn bor(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Bor(dst, src.into()));
        self
    }

    pub fn band(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Band(dst, src.into()));
        self
    }

    pub fn bxor(&mut self, dst: Reg, src: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Bxor(dst, src.into()));
        self
    }

    pub fn bnot(&mut self, dst: Reg) -> &mut Self {
        self.ops.push(Op::Bnot(dst));
        self
    }

    pub fn str_(&mut self, base: Reg, offset: impl Into<Operand>, value: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Str {
            base,
            offset: offset.into(),
            value: value.into(),
        });
        self
    }

    pub fn ldd(&mut self, dst: Reg, base: Reg, offset: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Ldd {
            dst,
            base,
            offset: offset.into(),
        });
        self
    }

    pub fn jmp(&mut self, dest: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Jmp(dest.into()));
        self
    }

    pub fn vxcall(&mut self, dest: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Vxcall(dest.into()));
        self
    }

    pub fn vexit(&mut self, dest: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Vexit(dest.into()));
        self
    }

    pub fn vemit(&mut self, byte: u8) -> &mut Self {
        self.ops.push(Op::Vemit(byte));
        self
    }

    pub fn vemits(&mut self, assembly: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Vemits(assembly.into()));
        self
    }

    pub fn vpinr(&mut self, reg: iced_x86::Register) -> &mut Self {
        self.ops.push(Op::Vpinr(reg));
        self
    }

    pub fn vpinw(&mut self, reg: iced_x86::Register) -> &mut Self {
        self.ops.push(Op::Vpinw(reg));
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.ops.push(Op::Nop);
        self
    }

    pub fn popf(&mut self) -> &mut Self {
        self.ops.push(Op::Popf);
        self
    }

    pub fn pushf(&mut self) -> &mut Self {
        self.ops.push(Op::Pushf);
        self
    }

    pub fn tl(&mut self, dst: Reg, a: impl Into<Operand>, b: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Tl(dst, a.into(), b.into()));
        self
    }

    pub fn te(&mut self, dst: Reg, a: impl Into<Operand>, b: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Te(dst, a.into(), b.into()));
        self
    }

    pub fn tne(&mut self, dst: Reg, a: impl Into<Operand>, b: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Tne(dst, a.into(), b.into()));
        self
    }

    pub fn tul(&mut self, dst: Reg, a: impl Into<Operand>, b: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Tul(dst, a.into(), b.into()));
        self
    }

    pub fn ifs(&mut self, dst: Reg, cond: impl Into<Operand>, value: impl Into<Operand>) -> &mut Self {
        self.ops.push(Op::Ifs(dst, cond.into(), value.into()));
        self
    }

    pub fn label(&mut self, text: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Label(text.into()));
        self
    }
}

/// A lifted routine: an entry VIP plus the ordered set of its blocks.
#[derive(Debug, Clone)]
pub struct Routine {
    pub entry_vip: u64,
    pub blocks: IndexMap<u64, BasicBlock>,
}

impl Routine {
    /// Create a routine with an empty entry block at `entry_vip`.
    pub fn new(entry_vip: u64) -> Self {
        let mut blocks = IndexMap::new();
        blocks.insert(entry_vip, BasicBlock::new(entry_vip));
        Self { entry_vip, blocks }
    }

    pub fn block(&self, vip: u64) -> Option<&BasicBlock> {
        self.blocks.get(&vip)
    }

    pub fn block_mut(&mut self, vip: u64) -> &mut BasicBlock {
        self.blocks.get_mut(&vip).expect("block exists")
    }

    /// Fork a successor block at `vip` off the block at `from`.
    ///
    /// Links the edge either way; returns the new block's VIP, or [`None`] if
    /// a block at `vip` already exists (it is linked but not re-created, so
    /// the caller must not lift into it again).
    pub fn fork(&mut self, from: u64, vip: u64) -> Option<u64> {
        let exists = self.blocks.contains_key(&vip);
        if !exists {
            self.blocks.insert(vip, BasicBlock::new(vip));
        }
        let from_block = self.blocks.get_mut(&from).expect("source block exists");
        if !from_block.next.contains(&vip) {
            from_block.next.push(vip);
        }
        let to_block = self.blocks.get_mut(&vip).expect("just ensured");
        if !to_block.prev.contains(&from) {
            to_block.prev.push(from);
        }
        (!exists).then_some(vip)
    }
}

// --- Rendering -------------------------------------------------------------

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Flag::Cf => "$cf",
            Flag::Pf => "$pf",
            Flag::Af => "$af",
            Flag::Zf => "$zf",
            Flag::Sf => "$sf",
            Flag::If => "$if",
            Flag::Df => "$df",
            Flag::Of => "$of",
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reg::Phys(r) => write!(f, "{}", format!("{r:?}").to_lowercase()),
            Reg::Virtual { slot, bit_offset: 0, bits } => write!(f, "vr{slot}:{bits}"),
            Reg::Virtual { slot, bit_offset, bits } => write!(f, "vr{slot}@{bit_offset}:{bits}"),
            Reg::Tmp { id, bits } => write!(f, "t{id}:{bits}"),
            Reg::Flags => f.write_str("$flags"),
            Reg::Flag(flag) => write!(f, "{flag}"),
            Reg::ImageBase => f.write_str("imgbase"),
            Reg::Sp => f.write_str("$sp"),
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Imm { value, bits } => write!(f, "0x{value:x}:{bits}"),
            Operand::Undefined => f.write_str("UD"),
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Push(a) => write!(f, "push    {a}"),
            Op::Pop(a) => write!(f, "pop     {a}"),
            Op::Mov(a, b) => write!(f, "mov     {a}, {b}"),
            Op::Add(a, b) => write!(f, "add     {a}, {b}"),
            Op::Sub(a, b) => write!(f, "sub     {a}, {b}"),
            Op::Mul(a, b) => write!(f, "mul     {a}, {b}"),
            Op::Mulhi(a, b) => write!(f, "mulhi   {a}, {b}"),
            Op::Imul(a, b) => write!(f, "imul    {a}, {b}"),
            Op::Imulhi(a, b) => write!(f, "imulhi  {a}, {b}"),
            Op::Div(a, b, c) => write!(f, "div     {a}, {b}, {c}"),
            Op::Rem(a, b, c) => write!(f, "rem     {a}, {b}, {c}"),
            Op::Idiv(a, b, c) => write!(f, "idiv    {a}, {b}, {c}"),
            Op::Irem(a, b, c) => write!(f, "irem    {a}, {b}, {c}"),
            Op::Bshl(a, b) => write!(f, "bshl    {a}, {b}"),
            Op::Bshr(a, b) => write!(f, "bshr    {a}, {b}"),
            Op::Bor(a, b) => write!(f, "bor     {a}, {b}"),
            Op::Band(a, b) => write!(f, "band    {a}, {b}"),
            Op::Bxor(a, b) => write!(f, "bxor    {a}, {b}"),
            Op::Bnot(a) => write!(f, "bnot    {a}"),
            Op::Str { base, offset, value } => write!(f, "str     {base}, {offset}, {value}"),
            Op::Ldd { dst, base, offset } => write!(f, "ldd     {dst}, {base}, {offset}"),
            Op::Jmp(a) => write!(f, "jmp     {a}"),
            Op::Vxcall(a) => write!(f, "vxcall  {a}"),
            Op::Vexit(a) => write!(f, "vexit   {a}"),
            Op::Vemit(byte) => write!(f, "vemit   0x{byte:02x}"),
            Op::Vemits(assembly) => write!(f, "vemits  \"{assembly}\""),
            Op::Vpinr(r) => write!(f, "vpinr   {}", format!("{r:?}").to_lowercase()),
            Op::Vpinw(r) => write!(f, "vpinw   {}", format!("{r:?}").to_lowercase()),
            Op::Nop => f.write_str("nop"),
            Op::Popf => f.write_str("popf"),
            Op::Pushf => f.write_str("pushf"),
            Op::Tl(a, b, c) => write!(f, "tl      {a}, {b}, {c}"),
            Op::Te(a, b, c) => write!(f, "te      {a}, {b}, {c}"),
            Op::Tne(a, b, c) => write!(f, "tne     {a}, {b}, {c}"),
            Op::Tul(a, b, c) => write!(f, "tul     {a}, {b}, {c}"),
            Op::Ifs(a, b, c) => write!(f, "ifs     {a}, {b}, {c}"),
            Op::Label(text) => write!(f, "; {text}"),
        }
    }
}

impl std::fmt::Display for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "; routine 0x{:x} ({} blocks)", self.entry_vip, self.blocks.len())?;
        for block in self.blocks.values() {
            write!(f, "0x{:x}:", block.entry_vip())?;
            if !block.prev.is_empty() {
                write!(f, " ; from")?;
                for p in &block.prev {
                    write!(f, " 0x{p:x}")?;
                }
            }
            writeln!(f)?;
            for op in &block.ops {
                writeln!(f, "\t{op}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_links_edges_and_rejects_duplicates() {
        let mut routine = Routine::new(0x1000);
        assert_eq!(routine.fork(0x1000, 0x2000), Some(0x2000));
        assert_eq!(routine.fork(0x1000, 0x2000), None);
        assert_eq!(routine.block(0x2000).unwrap().prev, vec![0x1000]);
        assert_eq!(routine.block(0x1000).unwrap().next, vec![0x2000]);
    }

    #[test]
    fn completeness_tracks_terminal_ops() {
        let mut routine = Routine::new(0);
        let block = routine.block_mut(0);
        assert!(!block.is_complete());
        let t = block.tmp(64);
        block.pop(t);
        assert!(!block.is_complete());
        block.jmp(Operand::imm64(0x1234));
        assert!(block.is_complete());
    }

    #[test]
    fn tmp_ids_are_block_local_and_fresh() {
        let mut routine = Routine::new(0);
        routine.fork(0, 1);
        let [a, b] = routine.block_mut(0).tmps([64, 32]);
        let c = routine.block_mut(1).tmp(8);
        assert_ne!(a, b);
        assert_eq!(c, Reg::Tmp { id: 0, bits: 8 });
    }
}
