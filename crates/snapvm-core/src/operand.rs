//! Instruction operand types.

use crate::Register;
use serde::{Deserialize, Serialize};

/// An instruction operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// Register operand.
    Register(Register),
    /// Immediate value.
    Immediate(Immediate),
    /// Memory reference.
    Memory(MemoryRef),
    /// PC-relative branch target, already resolved.
    PcRelative { target: u64 },
}

impl Operand {
    /// Creates a register operand.
    pub fn reg(reg: Register) -> Self {
        Self::Register(reg)
    }

    /// Creates a sign-extended immediate operand.
    pub fn imm(value: i64, size: u8) -> Self {
        Self::Immediate(Immediate { value, size })
    }

    /// Creates a resolved PC-relative operand.
    pub fn pc_rel(target: u64) -> Self {
        Self::PcRelative { target }
    }

    /// Returns true if this is a memory operand.
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }
}

/// Immediate value operand. The value is sign-extended from its original
/// encoding width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Immediate {
    pub value: i64,
    /// Original size in bits.
    pub size: u8,
}

impl Immediate {
    /// Returns the value zero-truncated to u32, as a 32-bit guest sees it.
    pub fn as_u32(&self) -> u32 {
        self.value as u32
    }
}

/// Memory reference operand: `[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryRef {
    pub base: Option<Register>,
    pub index: Option<Register>,
    /// Scale factor for the index (1, 2, 4, or 8).
    pub scale: u8,
    pub displacement: i32,
    /// Access size in bytes.
    pub size: u8,
}

impl MemoryRef {
    /// A reference through a base register alone.
    pub fn base(reg: Register, size: u8) -> Self {
        Self {
            base: Some(reg),
            index: None,
            scale: 1,
            displacement: 0,
            size,
        }
    }

    /// A base register plus displacement.
    pub fn base_disp(base: Register, displacement: i32, size: u8) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            displacement,
            size,
        }
    }

    /// An absolute (displacement-only) address.
    pub fn absolute(address: i32, size: u8) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            displacement: address,
            size,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(reg) => write!(f, "{}", reg),
            Self::Immediate(imm) => {
                if imm.value < 0 {
                    write!(f, "-{:#x}", -imm.value)
                } else {
                    write!(f, "{:#x}", imm.value)
                }
            }
            Self::Memory(mem) => {
                write!(f, "[")?;
                let mut has_content = false;
                if let Some(ref base) = mem.base {
                    write!(f, "{}", base)?;
                    has_content = true;
                }
                if let Some(ref index) = mem.index {
                    if has_content {
                        write!(f, " + ")?;
                    }
                    write!(f, "{}", index)?;
                    if mem.scale > 1 {
                        write!(f, "*{}", mem.scale)?;
                    }
                    has_content = true;
                }
                if mem.displacement != 0 || !has_content {
                    if has_content {
                        if mem.displacement >= 0 {
                            write!(f, " + {:#x}", mem.displacement)?;
                        } else {
                            write!(f, " - {:#x}", -(mem.displacement as i64))?;
                        }
                    } else {
                        write!(f, "{:#x}", mem.displacement)?;
                    }
                }
                write!(f, "]")
            }
            Self::PcRelative { target } => write!(f, "{:#x}", target),
        }
    }
}
