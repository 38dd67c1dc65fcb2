//! The lifted-trace cache.
//!
//! Maps `(address-space id, pc)` to a lifted function name. Entries stay
//! valid until the owning space reports a write to executable memory;
//! from then on they are stale and the next lookup re-decodes and
//! re-hashes. Unchanged bytes re-validate cheaply (the lifter sees the
//! name already in the module); changed bytes lift under a new name and
//! the old function simply becomes unreachable through this key.

use crate::lifter::{LiftError, TraceLifter};
use log::debug;
use rustc_hash::FxHashMap;
use snapvm_disasm::InstructionDecoder;
use snapvm_ir::Module;

#[derive(Debug, Clone)]
struct TraceEntry {
    hash: u64,
    name: String,
    stale: bool,
}

/// Cache of lifted functions, resilient to self-modifying code.
#[derive(Debug, Default)]
pub struct TraceManager {
    entries: FxHashMap<(u64, u64), TraceEntry>,
}

impl TraceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lifted function name for `(space_id, pc)`, lifting on
    /// miss. `wrote_exec` is the space's consumed write-to-exec flag; a
    /// true value marks every entry of that space stale before lookup.
    pub fn get_or_lift<D: InstructionDecoder>(
        &mut self,
        module: &mut Module,
        lifter: &TraceLifter<D>,
        space_id: u64,
        wrote_exec: bool,
        pc: u64,
        read_byte: impl FnMut(u64) -> Option<u8>,
    ) -> Result<String, LiftError> {
        if wrote_exec {
            self.mark_stale(space_id);
        }

        let key = (space_id, pc);
        if let Some(entry) = self.entries.get(&key) {
            if !entry.stale {
                return Ok(entry.name.clone());
            }
        }

        let lifted = lifter.lift_into_module(pc, read_byte, module)?;
        if let Some(prev) = self.entries.get(&key) {
            if prev.hash != lifted.hash {
                debug!(
                    "space {} pc {:#x}: bytes changed, {} supersedes {}",
                    space_id, pc, lifted.name, prev.name
                );
            }
        }
        self.entries.insert(
            key,
            TraceEntry {
                hash: lifted.hash,
                name: lifted.name.clone(),
                stale: false,
            },
        );
        Ok(lifted.name)
    }

    /// Drops every entry tied to an address space (on kill).
    pub fn invalidate(&mut self, space_id: u64) {
        self.entries.retain(|(sid, _), _| *sid != space_id);
    }

    /// Number of live cache entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn mark_stale(&mut self, space_id: u64) {
        for ((sid, _), entry) in self.entries.iter_mut() {
            if *sid == space_id {
                entry.stale = true;
            }
        }
    }
}
