//! x86 legacy prefix parsing.

/// Legacy prefixes found in front of a 32-bit instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    /// 0x66: operand size flips to 16-bit.
    pub operand_size: bool,
    /// 0x67: address size flips to 16-bit. Consumed; 16-bit addressing
    /// forms are rejected at ModR/M decoding.
    pub address_size: bool,
    /// 0xF0.
    pub lock: bool,
    /// 0xF3.
    pub rep: bool,
    /// 0xF2.
    pub repne: bool,
    /// Segment-override prefix byte, if present. Flat address space:
    /// recorded but ignored.
    pub segment: Option<u8>,
}

impl Prefixes {
    /// Parses leading prefix bytes. Returns the prefixes and how many
    /// bytes they consumed.
    pub fn parse(bytes: &[u8]) -> (Self, usize) {
        let mut prefixes = Self::default();
        let mut offset = 0;
        for &byte in bytes {
            match byte {
                0x66 => prefixes.operand_size = true,
                0x67 => prefixes.address_size = true,
                0xF0 => prefixes.lock = true,
                0xF3 => prefixes.rep = true,
                0xF2 => prefixes.repne = true,
                0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => prefixes.segment = Some(byte),
                _ => break,
            }
            offset += 1;
        }
        (prefixes, offset)
    }

    /// Operand size in bits for word-sized operations.
    pub fn operand_bits(&self) -> u8 {
        if self.operand_size {
            16
        } else {
            32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stacked_prefixes() {
        let (p, n) = Prefixes::parse(&[0x66, 0x2E, 0xF3, 0x90]);
        assert_eq!(n, 3);
        assert!(p.operand_size);
        assert!(p.rep);
        assert_eq!(p.segment, Some(0x2E));
        assert_eq!(p.operand_bits(), 16);
    }

    #[test]
    fn stops_at_opcode() {
        let (p, n) = Prefixes::parse(&[0x90]);
        assert_eq!(n, 0);
        assert!(!p.operand_size);
    }
}
