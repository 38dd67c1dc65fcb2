//! ModR/M and SIB byte decoding for 32-bit addressing.

use crate::error::DecodeError;
use snapvm_core::{MemoryRef, Operand, Register};

/// Decoded ModR/M byte.
#[derive(Debug, Clone, Copy)]
pub struct ModRM {
    /// Mod field (2 bits).
    pub mod_: u8,
    /// Reg field (3 bits): a register number or a group opcode extension.
    pub reg: u8,
    /// R/M field (3 bits).
    pub rm: u8,
}

impl ModRM {
    pub fn parse(byte: u8) -> Self {
        Self {
            mod_: (byte >> 6) & 0x3,
            reg: (byte >> 3) & 0x7,
            rm: byte & 0x7,
        }
    }

    /// True if the r/m operand is a register (mod=11).
    pub fn is_register(&self) -> bool {
        self.mod_ == 0b11
    }
}

/// Decoded SIB byte.
#[derive(Debug, Clone, Copy)]
pub struct Sib {
    pub scale: u8,
    pub index: u8,
    pub base: u8,
}

impl Sib {
    pub fn parse(byte: u8) -> Self {
        Self {
            scale: (byte >> 6) & 0x3,
            index: (byte >> 3) & 0x7,
            base: byte & 0x7,
        }
    }

    /// The actual scale factor (1, 2, 4, or 8).
    pub fn scale_factor(&self) -> u8 {
        1 << self.scale
    }
}

/// Decodes a register at the given width from a 3-bit number.
pub fn decode_gpr(num: u8, bits: u8) -> Register {
    match bits {
        8 => Register::gpr8(num),
        16 => Register::gpr16(num),
        _ => Register::gpr32(num),
    }
}

/// Decodes the reg field of ModR/M as a register operand.
pub fn decode_modrm_reg(modrm: ModRM, bits: u8) -> Operand {
    Operand::Register(decode_gpr(modrm.reg, bits))
}

/// Decodes the r/m operand. `bytes` starts right after the ModR/M byte;
/// `pc` is the instruction address (for error reporting only). Returns
/// the operand and the number of displacement/SIB bytes consumed.
pub fn decode_modrm_rm(
    bytes: &[u8],
    pc: u64,
    modrm: ModRM,
    bits: u8,
) -> Result<(Operand, usize), DecodeError> {
    if modrm.is_register() {
        return Ok((Operand::Register(decode_gpr(modrm.rm, bits)), 0));
    }

    let size = bits / 8;
    let mut offset = 0;

    // SIB byte when rm=100.
    let (base, index, scale) = if modrm.rm == 0b100 {
        let sib_byte = *bytes
            .first()
            .ok_or_else(|| DecodeError::truncated(pc, 1, 0))?;
        offset += 1;
        let sib = Sib::parse(sib_byte);
        let base = if sib.base == 0b101 && modrm.mod_ == 0b00 {
            None // disp32 follows instead of a base register
        } else {
            Some(Register::gpr32(sib.base))
        };
        let index = if sib.index == 0b100 {
            None
        } else {
            Some(Register::gpr32(sib.index))
        };
        (base, index, sib.scale_factor())
    } else if modrm.rm == 0b101 && modrm.mod_ == 0b00 {
        (None, None, 1) // absolute disp32
    } else {
        (Some(Register::gpr32(modrm.rm)), None, 1)
    };

    let needs_disp32 =
        modrm.mod_ == 0b10 || (modrm.mod_ == 0b00 && (modrm.rm == 0b101 || base.is_none()));
    let displacement = if modrm.mod_ == 0b01 {
        let disp = *bytes
            .get(offset)
            .ok_or_else(|| DecodeError::truncated(pc, offset + 1, bytes.len()))? as i8;
        offset += 1;
        disp as i32
    } else if needs_disp32 {
        let end = offset + 4;
        if bytes.len() < end {
            return Err(DecodeError::truncated(pc, end, bytes.len()));
        }
        let disp = i32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        offset = end;
        disp
    } else {
        0
    };

    Ok((
        Operand::Memory(MemoryRef {
            base,
            index,
            scale,
            displacement,
            size,
        }),
        offset,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvm_core::register::x86;

    #[test]
    fn register_form() {
        // mod=11, reg=000, rm=001 -> ecx
        let modrm = ModRM::parse(0xC1);
        let (op, used) = decode_modrm_rm(&[], 0, modrm, 32).unwrap();
        assert_eq!(used, 0);
        assert_eq!(op, Operand::Register(Register::gpr32(x86::ECX)));
    }

    #[test]
    fn base_plus_disp8() {
        // mod=01, rm=011 (ebx), disp8 = -4
        let modrm = ModRM::parse(0b01_000_011);
        let (op, used) = decode_modrm_rm(&[0xFC], 0, modrm, 32).unwrap();
        assert_eq!(used, 1);
        match op {
            Operand::Memory(m) => {
                assert_eq!(m.base, Some(Register::gpr32(x86::EBX)));
                assert_eq!(m.displacement, -4);
            }
            other => panic!("expected memory operand, got {:?}", other),
        }
    }

    #[test]
    fn absolute_disp32() {
        // mod=00, rm=101 -> [disp32]
        let modrm = ModRM::parse(0b00_000_101);
        let (op, used) = decode_modrm_rm(&[0x00, 0x20, 0x00, 0x00], 0, modrm, 32).unwrap();
        assert_eq!(used, 4);
        match op {
            Operand::Memory(m) => {
                assert_eq!(m.base, None);
                assert_eq!(m.displacement, 0x2000);
            }
            other => panic!("expected memory operand, got {:?}", other),
        }
    }

    #[test]
    fn sib_with_scaled_index() {
        // mod=00, rm=100, sib: scale=2 (x4), index=esi, base=ebx
        let modrm = ModRM::parse(0b00_000_100);
        let (op, used) = decode_modrm_rm(&[0b10_110_011], 0, modrm, 32).unwrap();
        assert_eq!(used, 1);
        match op {
            Operand::Memory(m) => {
                assert_eq!(m.base, Some(Register::gpr32(x86::EBX)));
                assert_eq!(m.index, Some(Register::gpr32(x86::ESI)));
                assert_eq!(m.scale, 4);
            }
            other => panic!("expected memory operand, got {:?}", other),
        }
    }

    #[test]
    fn truncated_displacement_is_an_error() {
        let modrm = ModRM::parse(0b10_000_011); // mod=10 needs disp32
        let err = decode_modrm_rm(&[0x01, 0x02], 0x1000, modrm, 32).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }
}
