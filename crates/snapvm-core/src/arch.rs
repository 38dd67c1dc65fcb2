//! Guest architecture and OS identification.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Page size of the guest address space (the permission granule).
pub const PAGE_SIZE: u64 = 4096;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Returns the page number containing `addr`.
pub fn page_of(addr: u64) -> u64 {
    addr >> 12
}

/// Rounds `addr` down to its page base.
pub fn page_align_down(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Rounds `addr` up to the next page boundary.
pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Guest CPU architectures the emulator can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestArch {
    /// 32-bit x86. Feature-suffixed snapshot strings (`x86_avx`,
    /// `x86_avx512`) map here as well; the extra register file is carried
    /// opaquely in the state blob.
    X86,
}

impl GuestArch {
    /// Returns the guest pointer size in bytes.
    pub fn pointer_size(&self) -> usize {
        match self {
            Self::X86 => 4,
        }
    }

    /// Longest instruction encoding, in bytes.
    pub fn max_instruction_size(&self) -> usize {
        match self {
            Self::X86 => 15,
        }
    }

    /// Returns the canonical snapshot string for this architecture.
    pub fn name(&self) -> &'static str {
        match self {
            Self::X86 => "x86",
        }
    }
}

impl FromStr for GuestArch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "x86" | "x86_avx" | "x86_avx512" => Ok(Self::X86),
            other => Err(Error::InvalidArch(other.to_string())),
        }
    }
}

/// Guest operating systems recognized in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestOs {
    VxWorks,
    Linux,
}

impl GuestOs {
    /// Returns the canonical snapshot string for this OS.
    pub fn name(&self) -> &'static str {
        match self {
            Self::VxWorks => "vxworks",
            Self::Linux => "linux",
        }
    }
}

impl FromStr for GuestOs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "vxworks" => Ok(Self::VxWorks),
            "linux" => Ok(Self::Linux),
            other => Err(Error::InvalidOs(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_parsing() {
        assert_eq!("x86".parse::<GuestArch>().unwrap(), GuestArch::X86);
        assert_eq!("x86_avx".parse::<GuestArch>().unwrap(), GuestArch::X86);
        assert!("mips".parse::<GuestArch>().is_err());
    }

    #[test]
    fn os_parsing() {
        assert_eq!("vxworks".parse::<GuestOs>().unwrap(), GuestOs::VxWorks);
        assert!("plan9".parse::<GuestOs>().is_err());
    }

    #[test]
    fn page_math() {
        assert_eq!(page_of(0x1fff), 1);
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
    }
}
