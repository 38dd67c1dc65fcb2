//! Workspace path conventions.
//!
//! A workspace directory holds everything one emulated program needs:
//! the snapshot record, the page backing files under `memory/`, the
//! runtime IR module, and the locally persisted module with lifted code.

use std::path::{Path, PathBuf};

/// A workspace directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The snapshot record.
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("snapshot")
    }

    /// Directory of page backing files.
    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    /// The backing file of one page range.
    pub fn memory_path(&self, name: &str) -> PathBuf {
        self.memory_dir().join(name)
    }

    /// The runtime module loaded at startup.
    pub fn runtime_bitcode_path(&self) -> PathBuf {
        self.root.join("runtime.bc")
    }

    /// The module persisted at shutdown, with lifted functions included.
    pub fn local_runtime_bitcode_path(&self) -> PathBuf {
        self.root.join("runtime.local.bc")
    }

    /// Creates the directory layout.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.memory_dir())
    }
}
