//! Error types for snapvm-core.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Architecture string not recognized.
    #[error("invalid guest architecture: {0:?}")]
    InvalidArch(String),

    /// OS string not recognized.
    #[error("invalid guest OS: {0:?}")]
    InvalidOs(String),

    /// Register-state blob is too small to hold the architectural registers.
    #[error("register state blob is {len} bytes, need at least {min}")]
    StateTooSmall { len: usize, min: usize },
}
