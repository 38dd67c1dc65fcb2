//! Runtime error taxonomy.
//!
//! Configuration and snapshot-consistency failures surface here and end
//! the process at startup. Guest faults never do: they funnel through
//! the error intrinsic and mark only their task.

use crate::snapshot::SnapshotError;
use snapvm_ir::ModuleError;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime bitcode not found at {path}")]
    MissingRuntimeBitcode { path: PathBuf },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Core(#[from] snapvm_core::Error),

    #[error("missing task variable {name:?} in runtime module")]
    MissingTaskVariable { name: String },
}
