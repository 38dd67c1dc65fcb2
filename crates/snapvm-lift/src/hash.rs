//! Trace content hashing.
//!
//! The "version" of a trace is a 64-bit hash of its instruction bytes in
//! pc order. Lifted function names embed it, so a write that changes
//! executable bytes yields a different name on the next decode and the
//! stale function is simply never looked up again. FxHash is used
//! because the hash must be stable across runs: names are persisted in
//! `runtime.local.bc`.

use rustc_hash::FxHasher;
use snapvm_core::DecodedInstruction;
use std::collections::BTreeMap;
use std::hash::Hasher;

/// Hashes the instruction bytes of a decoded trace in pc order.
pub fn trace_hash(insts: &BTreeMap<u64, DecodedInstruction>) -> u64 {
    let mut hasher = FxHasher::default();
    for inst in insts.values() {
        hasher.write(&inst.bytes);
    }
    hasher.finish()
}
