//! x86-32 instruction decoding.

mod decoder;
mod modrm;
mod prefix;

pub use decoder::X86Decoder;
pub use modrm::{ModRM, Sib};
pub use prefix::Prefixes;
