//! Catalog of the bit- and byte-level transforms VMProtect composes into its
//! operand decryption chains, plus the expression type that replays a recorded
//! chain over a value.

use iced_x86::{Instruction, Mnemonic};
use smallvec::SmallVec;

use super::operand_byte_size;

/// Truncate `value` to `bytes` little-endian bytes.
pub fn truncate(value: u64, bytes: usize) -> u64 {
    if bytes >= 8 {
        value
    }
    else {
        value & ((1u64 << (bytes * 8)) - 1)
    }
}

/// Describes one arithmetic transform and how to recognize it in a
/// disassembled instruction.
pub struct OperationDesc {
    /// Mnemonic the transform is recognized by. Not unique across the catalog;
    /// width-constrained variants share one mnemonic.
    pub mnemonic: Mnemonic,
    /// Extra operands beyond the value being transformed, e.g. 1 for
    /// `xor reg, imm` and 0 for `neg reg`.
    pub extra_operands: u8,
    /// The transform itself. `extra` holds the captured extra operands.
    pub transform: fn(value: u64, extra: &[u64]) -> u64,
    /// Required first-operand byte width, if the transform only exists at one
    /// width.
    pub input_size: Option<usize>,
}

const fn desc(
    mnemonic: Mnemonic,
    extra_operands: u8,
    transform: fn(u64, &[u64]) -> u64,
) -> OperationDesc {
    OperationDesc {
        mnemonic,
        extra_operands,
        transform,
        input_size: None,
    }
}

const fn sized_desc(
    mnemonic: Mnemonic,
    extra_operands: u8,
    transform: fn(u64, &[u64]) -> u64,
    input_size: usize,
) -> OperationDesc {
    OperationDesc {
        mnemonic,
        extra_operands,
        transform,
        input_size: Some(input_size),
    }
}

pub static ADD: OperationDesc = desc(Mnemonic::Add, 1, |d, a| d.wrapping_add(a[0]));
pub static SUB: OperationDesc = desc(Mnemonic::Sub, 1, |d, a| d.wrapping_sub(a[0]));

pub static BSWAP64: OperationDesc = sized_desc(Mnemonic::Bswap, 0, |d, _| d.swap_bytes(), 8);
pub static BSWAP32: OperationDesc =
    sized_desc(Mnemonic::Bswap, 0, |d, _| (d as u32).swap_bytes() as u64, 4);
pub static BSWAP16: OperationDesc =
    sized_desc(Mnemonic::Bswap, 0, |d, _| (d as u16).swap_bytes() as u64, 2);

pub static INC: OperationDesc = desc(Mnemonic::Inc, 0, |d, _| d.wrapping_add(1));
pub static DEC: OperationDesc = desc(Mnemonic::Dec, 0, |d, _| d.wrapping_sub(1));

pub static NOT: OperationDesc = desc(Mnemonic::Not, 0, |d, _| !d);
pub static NEG: OperationDesc = desc(Mnemonic::Neg, 0, |d, _| d.wrapping_neg());
pub static XOR: OperationDesc = desc(Mnemonic::Xor, 1, |d, a| d ^ a[0]);

pub static ROL64: OperationDesc =
    sized_desc(Mnemonic::Rol, 1, |d, a| d.rotate_left(a[0] as u32), 8);
pub static ROL32: OperationDesc =
    sized_desc(Mnemonic::Rol, 1, |d, a| (d as u32).rotate_left(a[0] as u32) as u64, 4);
pub static ROL16: OperationDesc =
    sized_desc(Mnemonic::Rol, 1, |d, a| (d as u16).rotate_left(a[0] as u32) as u64, 2);
pub static ROL8: OperationDesc =
    sized_desc(Mnemonic::Rol, 1, |d, a| (d as u8).rotate_left(a[0] as u32) as u64, 1);

pub static ROR64: OperationDesc =
    sized_desc(Mnemonic::Ror, 1, |d, a| d.rotate_right(a[0] as u32), 8);
pub static ROR32: OperationDesc =
    sized_desc(Mnemonic::Ror, 1, |d, a| (d as u32).rotate_right(a[0] as u32) as u64, 4);
pub static ROR16: OperationDesc =
    sized_desc(Mnemonic::Ror, 1, |d, a| (d as u16).rotate_right(a[0] as u32) as u64, 2);
pub static ROR8: OperationDesc =
    sized_desc(Mnemonic::Ror, 1, |d, a| (d as u8).rotate_right(a[0] as u32) as u64, 1);

/// All operation descriptors, in resolution order.
pub static DESCRIPTORS: &[&OperationDesc] = &[
    &ADD, &SUB, &BSWAP64, &BSWAP32, &BSWAP16, &INC, &DEC, &NOT, &NEG, &XOR, &ROL64, &ROL32,
    &ROL16, &ROL8, &ROR64, &ROR32, &ROR16, &ROR8,
];

/// Resolve the operation descriptor matching `instruction`, if any.
///
/// A candidate matches when its mnemonic equals the instruction's and its
/// input-size constraint (when present) equals the first operand's byte width.
pub fn desc_for_instruction(instruction: &Instruction) -> Option<&'static OperationDesc> {
    DESCRIPTORS.iter().copied().find(|desc| {
        desc.mnemonic == instruction.mnemonic()
            && desc
                .input_size
                .is_none_or(|size| size == operand_byte_size(instruction, 0))
    })
}

/// One transform bound to the extra operands captured from its instruction.
#[derive(Clone)]
pub struct Operation {
    pub descriptor: &'static OperationDesc,
    pub extra: SmallVec<[u64; 1]>,
}

impl Operation {
    /// Bind `descriptor` to the immediates of `instruction`.
    ///
    /// Every operand past the first must be an immediate; anything else is an
    /// unsupported operand kind and yields [`None`].
    pub fn bind(
        descriptor: &'static OperationDesc,
        instruction: &Instruction,
    ) -> Option<Self> {
        let mut extra = SmallVec::new();
        for op in 1..instruction.op_count() {
            extra.push(instruction.try_immediate(op).ok()?);
        }
        Some(Self { descriptor, extra })
    }

    /// Resolve a descriptor for `instruction` and bind it.
    pub fn from_instruction(instruction: &Instruction) -> Option<Self> {
        Self::bind(desc_for_instruction(instruction)?, instruction)
    }

    pub fn apply(&self, value: u64) -> u64 {
        (self.descriptor.transform)(value, &self.extra)
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{:x?}", self.descriptor.mnemonic, self.extra.as_slice())
    }
}

/// An ordered composition of [`Operation`]s applied to a seed value.
///
/// Immutable once recorded; evaluation is pure.
#[derive(Clone, Default, Debug)]
pub struct Expression {
    operations: Vec<Operation>,
}

impl Expression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Apply each operation in order, truncating the running value to
    /// `width_bytes` after every step.
    pub fn compute(&self, input: u64, width_bytes: usize) -> u64 {
        self.operations
            .iter()
            .fold(input, |value, op| truncate(op.apply(value), width_bytes))
    }
}
