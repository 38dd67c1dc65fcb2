//! # snapvm-disasm
//!
//! The decoder front end: an x86-32 instruction decoder and the
//! work-list trace walker that grows a connected region of decoded
//! instructions from a root pc, reading bytes through an
//! executable-view callback.

pub mod error;
pub mod trace;
pub mod traits;
pub mod x86;

pub use error::DecodeError;
pub use trace::decode_trace;
pub use traits::InstructionDecoder;
pub use x86::X86Decoder;
