//! # snapvm-core
//!
//! Core abstractions for the snapvm emulator. This crate defines the
//! guest-facing types shared by every other crate: architecture and OS
//! identifiers, the decoded-instruction model with its control-flow
//! categories, instruction operands, and the byte-backed guest register
//! bank restored from snapshots.

pub mod arch;
pub mod bank;
pub mod error;
pub mod instruction;
pub mod operand;
pub mod register;

pub use arch::{page_align_down, page_align_up, page_of, GuestArch, GuestOs, PAGE_MASK, PAGE_SIZE};
pub use bank::{Flag, RegisterBank};
pub use error::Error;
pub use instruction::{Category, Condition, DecodedInstruction, HyperCall, Operation};
pub use operand::{Immediate, MemoryRef, Operand};
pub use register::Register;
