#![doc = include_str!("../README.md")]

pub mod analysis;
pub mod devirt;
pub mod disasm;
pub mod image;
pub mod ir;
pub mod vm;

pub use self::{
    devirt::{Devirtualizer, EntryStubAnalysis, LiftingJob, ScanResult},
    image::MappedImage,
    ir::Routine,
};

/// Re-export of the `iced_x86` crate.
pub use iced_x86;
/// Re-export of the `pelite` crate.
pub use pelite;
