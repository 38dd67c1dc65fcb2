//! Decoder traits.

use crate::DecodeError;
use snapvm_core::{DecodedInstruction, GuestArch};

/// Trait for architecture-specific instruction decoders.
pub trait InstructionDecoder {
    /// Decode a single instruction from `bytes`, the readable window
    /// starting at virtual address `pc`.
    fn decode(&self, bytes: &[u8], pc: u64) -> Result<DecodedInstruction, DecodeError>;

    /// Longest possible encoding, in bytes. The trace walker reads at
    /// most this many bytes per instruction.
    fn max_instruction_size(&self) -> usize;

    /// The architecture this decoder handles.
    fn arch(&self) -> GuestArch;
}
