//! Lifted functions and their blocks.

use crate::op::{Intrinsic, Op, Src};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One lifted trace: a function of basic blocks keyed by guest pc.
///
/// The lifted prototype is `(state, pc, memory) -> memory`; the
/// interpreter supplies all three, and every terminator communicates the
/// next pc through the bank's EIP slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// `$<hex pc>_<hex hash>`, see [`crate::module::lifted_function_name`].
    pub name: String,
    /// The root pc of the trace; execution always enters here.
    pub entry_pc: u64,
    /// Blocks, one per decoded instruction, keyed by their pc.
    pub blocks: BTreeMap<u64, Block>,
    /// Number of temporaries allocated across all blocks.
    pub temp_count: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, entry_pc: u64) -> Self {
        Self {
            name: name.into(),
            entry_pc,
            blocks: BTreeMap::new(),
            temp_count: 0,
        }
    }

    pub fn block(&self, pc: u64) -> Option<&Block> {
        self.blocks.get(&pc)
    }
}

/// A basic block: straight-line ops plus one terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub ops: Vec<Op>,
    pub term: Terminator,
}

impl Block {
    /// A block that immediately reports a missing trace at `pc`.
    pub fn missing_stub(pc: u64) -> Self {
        Self {
            ops: vec![Op::WriteReg {
                reg: crate::op::BankReg::Eip,
                src: Src::Imm(pc),
            }],
            term: Terminator::TailCall {
                intrinsic: Intrinsic::MissingBlock { pc },
            },
        }
    }
}

/// How a block ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    /// Unconditional branch to another block of the same function.
    Branch { target: u64 },
    /// Two-way branch on a 0/1 value.
    CondBranch {
        cond: Src,
        taken: u64,
        not_taken: u64,
    },
    /// Leave the function through a runtime intrinsic.
    TailCall { intrinsic: Intrinsic },
    /// Conditionally leave through an intrinsic, else branch on.
    /// This is the shape of a conditional async hypercall.
    CondTailCall {
        cond: Src,
        intrinsic: Intrinsic,
        not_taken: u64,
    },
}

impl Terminator {
    /// Intra-function successor pcs.
    pub fn targets(&self) -> Vec<u64> {
        match self {
            Self::Branch { target } => vec![*target],
            Self::CondBranch { taken, not_taken, .. } => vec![*taken, *not_taken],
            Self::TailCall { .. } => vec![],
            Self::CondTailCall { not_taken, .. } => vec![*not_taken],
        }
    }
}
