//! Decode error types.

use thiserror::Error;

/// Error type for instruction decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Unknown opcode encountered.
    #[error("unknown opcode at {address:#x}: {bytes:02x?}")]
    UnknownOpcode { address: u64, bytes: Vec<u8> },

    /// Instruction was truncated (not enough readable bytes).
    #[error("truncated instruction at {address:#x}: need {needed} bytes, have {available}")]
    Truncated {
        address: u64,
        needed: usize,
        available: usize,
    },

    /// Encoding is valid x86 but outside the supported guest subset.
    #[error("unsupported instruction at {address:#x}: {reason}")]
    Unsupported { address: u64, reason: String },
}

impl DecodeError {
    pub fn unknown_opcode(address: u64, bytes: &[u8]) -> Self {
        Self::UnknownOpcode {
            address,
            bytes: bytes.to_vec(),
        }
    }

    pub fn truncated(address: u64, needed: usize, available: usize) -> Self {
        Self::Truncated {
            address,
            needed,
            available,
        }
    }

    pub fn unsupported(address: u64, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            address,
            reason: reason.into(),
        }
    }
}
