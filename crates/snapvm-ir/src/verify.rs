//! Structural verification of lifted functions.
//!
//! Runs before and after optimization. The checks are the ones the
//! interpreter relies on: the entry block exists, every branch target
//! resolves, and every temp is defined earlier in its own block (temps
//! do not flow between blocks).

use crate::function::Function;
use crate::op::TempId;
use std::collections::HashSet;
use thiserror::Error;

/// A structural defect in a lifted function.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerifyError {
    #[error("function {func}: entry block {pc:#x} does not exist")]
    MissingEntry { func: String, pc: u64 },

    #[error("function {func}: block {block:#x} branches to missing block {target:#x}")]
    MissingTarget {
        func: String,
        block: u64,
        target: u64,
    },

    #[error("function {func}: block {block:#x} uses temp t{temp} before definition")]
    UseBeforeDef {
        func: String,
        block: u64,
        temp: u32,
    },

    #[error("function {func}: temp t{temp} exceeds declared temp count {count}")]
    TempOutOfRange { func: String, temp: u32, count: u32 },
}

/// Verifies one function.
pub fn verify(func: &Function) -> Result<(), VerifyError> {
    if !func.blocks.contains_key(&func.entry_pc) {
        return Err(VerifyError::MissingEntry {
            func: func.name.clone(),
            pc: func.entry_pc,
        });
    }

    for (&pc, block) in &func.blocks {
        let mut defined: HashSet<TempId> = HashSet::new();
        for op in &block.ops {
            for used in op.uses() {
                if used.0 >= func.temp_count {
                    return Err(VerifyError::TempOutOfRange {
                        func: func.name.clone(),
                        temp: used.0,
                        count: func.temp_count,
                    });
                }
                if !defined.contains(&used) {
                    return Err(VerifyError::UseBeforeDef {
                        func: func.name.clone(),
                        block: pc,
                        temp: used.0,
                    });
                }
            }
            if let Some(def) = op.def() {
                if def.0 >= func.temp_count {
                    return Err(VerifyError::TempOutOfRange {
                        func: func.name.clone(),
                        temp: def.0,
                        count: func.temp_count,
                    });
                }
                defined.insert(def);
            }
        }

        for used in term_uses(block) {
            if !defined.contains(&used) {
                return Err(VerifyError::UseBeforeDef {
                    func: func.name.clone(),
                    block: pc,
                    temp: used.0,
                });
            }
        }

        for target in block.term.targets() {
            if !func.blocks.contains_key(&target) {
                return Err(VerifyError::MissingTarget {
                    func: func.name.clone(),
                    block: pc,
                    target,
                });
            }
        }
    }

    Ok(())
}

fn term_uses(block: &crate::function::Block) -> Vec<TempId> {
    use crate::function::Terminator;
    use crate::op::Src;
    match &block.term {
        Terminator::CondBranch { cond: Src::Temp(t), .. }
        | Terminator::CondTailCall { cond: Src::Temp(t), .. } => vec![*t],
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::function::Terminator;
    use crate::op::{BinOp, Intrinsic, Src, Width};

    #[test]
    fn well_formed_function_verifies() {
        let mut b = FunctionBuilder::new("$10_1", 0x10);
        {
            let mut entry = b.block(0x10);
            let lhs = entry.constant(1);
            let sum = entry.binary(BinOp::Add, Src::Temp(lhs), Src::Imm(2), Width::W32);
            entry.terminate(Terminator::CondBranch {
                cond: Src::Temp(sum),
                taken: 0x20,
                not_taken: 0x20,
            });
        }
        {
            let mut next = b.block(0x20);
            next.terminate(Terminator::TailCall {
                intrinsic: Intrinsic::FunctionReturn,
            });
        }
        assert!(verify(&b.finish()).is_ok());
    }

    #[test]
    fn dangling_branch_target_is_caught() {
        let mut b = FunctionBuilder::new("$10_1", 0x10);
        b.block(0x10).terminate(Terminator::Branch { target: 0x99 });
        let err = verify(&b.finish()).unwrap_err();
        assert!(matches!(err, VerifyError::MissingTarget { target: 0x99, .. }));
    }

    #[test]
    fn temps_do_not_flow_between_blocks() {
        let mut b = FunctionBuilder::new("$10_1", 0x10);
        let t = {
            let mut entry = b.block(0x10);
            let t = entry.constant(7);
            entry.terminate(Terminator::Branch { target: 0x20 });
            t
        };
        {
            let mut next = b.block(0x20);
            // Use the entry block's temp without a local definition.
            next.binary(BinOp::Add, Src::Temp(t), Src::Imm(1), Width::W32);
            next.terminate(Terminator::TailCall {
                intrinsic: Intrinsic::Error,
            });
        }
        let err = verify(&b.finish()).unwrap_err();
        assert!(matches!(err, VerifyError::UseBeforeDef { .. }));
    }
}
