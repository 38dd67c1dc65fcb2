//! IR modules and their on-disk form.

use crate::function::Function;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// Intrinsic symbols every runtime module must declare.
pub const REQUIRED_INTRINSICS: [&str; 6] = [
    "error",
    "missing_block",
    "jump",
    "function_call",
    "function_return",
    "async_hyper_call",
];

/// The global variable the first task binds to. Later tasks get
/// `task_<i>` globals cloned from this one's shape.
pub const FIRST_TASK_VARIABLE: &str = "task_0";

/// Errors loading, storing, or validating a module.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("runtime module is missing required intrinsic declaration {0:?}")]
    MissingIntrinsic(&'static str),

    #[error("runtime module is missing the {FIRST_TASK_VARIABLE:?} global")]
    MissingTaskVariable,

    #[error("failed to read module from {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write module to {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed module file {path}: {source}")]
    Decode {
        path: String,
        source: bincode::Error,
    },

    #[error("failed to encode module: {0}")]
    Encode(#[source] bincode::Error),
}

/// A mutable global carried by a module. Task state slots are globals
/// named `task_<i>`; their initializer is the zero value of the slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub init: Vec<u8>,
}

impl Global {
    /// A zero-initialized global of the same shape as this one.
    pub fn zeroed_like(&self) -> Self {
        Self {
            init: vec![0; self.init.len()],
        }
    }
}

/// An IR module: lifted functions plus the globals and intrinsic
/// declarations of the runtime they link against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    /// Runtime symbols lifted code may tail-call.
    pub declarations: BTreeSet<String>,
    /// Mutable globals, keyed by name.
    pub globals: BTreeMap<String, Global>,
    /// Lifted functions, keyed by their `$pc_hash` name.
    pub functions: BTreeMap<String, Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declarations: BTreeSet::new(),
            globals: BTreeMap::new(),
            functions: BTreeMap::new(),
        }
    }

    /// Builds the seed runtime module: all required intrinsic
    /// declarations plus a zeroed `task_0` global of `state_size` bytes.
    pub fn runtime_seed(state_size: usize) -> Self {
        let mut module = Self::new("runtime");
        for name in REQUIRED_INTRINSICS {
            module.declarations.insert(name.to_string());
        }
        module.globals.insert(
            FIRST_TASK_VARIABLE.to_string(),
            Global {
                init: vec![0; state_size],
            },
        );
        module
    }

    /// Checks the runtime-module contract: every intrinsic declared and
    /// the first task variable present.
    pub fn validate_runtime(&self) -> Result<(), ModuleError> {
        for name in REQUIRED_INTRINSICS {
            if !self.declarations.contains(name) {
                return Err(ModuleError::MissingIntrinsic(name));
            }
        }
        if !self.globals.contains_key(FIRST_TASK_VARIABLE) {
            return Err(ModuleError::MissingTaskVariable);
        }
        Ok(())
    }

    /// Loads a module from its bincode file.
    pub fn read_from(path: &Path) -> Result<Self, ModuleError> {
        let display = path.display().to_string();
        let mut file = std::fs::File::open(path).map_err(|source| ModuleError::Read {
            path: display.clone(),
            source,
        })?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|source| ModuleError::Read {
            path: display.clone(),
            source,
        })?;
        bincode::deserialize(&bytes).map_err(|source| ModuleError::Decode {
            path: display,
            source,
        })
    }

    /// Stores the module to a bincode file.
    pub fn write_to(&self, path: &Path) -> Result<(), ModuleError> {
        let display = path.display().to_string();
        let bytes = bincode::serialize(self).map_err(ModuleError::Encode)?;
        let mut file = std::fs::File::create(path).map_err(|source| ModuleError::Write {
            path: display.clone(),
            source,
        })?;
        file.write_all(&bytes).map_err(|source| ModuleError::Write {
            path: display,
            source,
        })
    }
}

/// The name a lifted function gets. It encodes both the position of the
/// trace (`pc`) and the contents of memory there (the byte hash), which
/// makes cached lookups sensitive to self-modifying code.
pub fn lifted_function_name(pc: u64, hash: u64) -> String {
    format!("${:x}_{:x}", pc, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_module_passes_validation() {
        let module = Module::runtime_seed(64);
        assert!(module.validate_runtime().is_ok());
    }

    #[test]
    fn missing_intrinsic_is_rejected() {
        let mut module = Module::runtime_seed(64);
        module.declarations.remove("jump");
        assert!(matches!(
            module.validate_runtime(),
            Err(ModuleError::MissingIntrinsic("jump"))
        ));
    }

    #[test]
    fn missing_task_variable_is_rejected() {
        let mut module = Module::runtime_seed(64);
        module.globals.clear();
        assert!(matches!(
            module.validate_runtime(),
            Err(ModuleError::MissingTaskVariable)
        ));
    }

    #[test]
    fn lifted_names_are_deterministic() {
        assert_eq!(lifted_function_name(0x1000, 0xdead), "$1000_dead");
        assert_eq!(
            lifted_function_name(0x1000, 0xdead),
            lifted_function_name(0x1000, 0xdead)
        );
    }

    #[test]
    fn module_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.bc");

        let mut module = Module::runtime_seed(64);
        module
            .functions
            .insert("$1000_1".to_string(), Function::new("$1000_1", 0x1000));
        module.write_to(&path).unwrap();

        let loaded = Module::read_from(&path).unwrap();
        assert_eq!(loaded, module);
    }
}
