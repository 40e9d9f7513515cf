//! The reconstructed virtual machine: its register assignment, execution
//! cursor, handler decoding and per-VMENTRY instances.

pub mod bridge;
pub mod handler;
pub mod instance;
pub mod isa;

use iced_x86::Register;

use crate::image::MappedImage;

/// Direction the VIP moves through the bytecode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// VIP is decremented before each read (`sub vip, n` bridges).
    Up,
    /// VIP is incremented after each read (`add vip, n` bridges).
    Down,
}

/// The active virtualization scheme at a program point: which physical
/// registers hold the VM's stack, instruction pointer, register-file base,
/// rolling key and dispatch base, plus the fetch direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmState {
    pub stack_reg: Register,
    pub vip_reg: Register,
    pub context_reg: Register,
    pub rolling_key_reg: Register,
    pub flow_reg: Register,
    pub direction: Direction,
    /// Absolute address handler offsets are applied to.
    pub flow: u64,
}

/// The dynamic execution cursor: a state copy, the rolling decryption key and
/// the absolute VIP mapped into the image buffer.
#[derive(Clone)]
pub struct VmContext<'i> {
    pub state: VmState,
    pub rolling_key: u64,
    pub vip: u64,
    image: &'i MappedImage,
}

impl<'i> VmContext<'i> {
    pub fn new(image: &'i MappedImage, state: VmState, rolling_key: u64, vip: u64) -> Self {
        Self {
            state,
            rolling_key,
            vip,
            image,
        }
    }

    /// Read `size` bytes from the VIP stream, zero-extended to 64 bits.
    ///
    /// When the direction is up the VIP points one past the value, so it is
    /// pre-decremented; when down it is post-incremented.
    pub fn fetch(&mut self, size: usize) -> u64 {
        if self.state.direction == Direction::Up {
            self.vip -= size as u64;
        }
        let value = self.image.read_int(self.vip, size).unwrap_or_else(|| {
            log::warn!("vip read out of mapped image at {:x}", self.vip);
            0
        });
        if self.state.direction == Direction::Down {
            self.vip += size as u64;
        }
        value
    }
}
