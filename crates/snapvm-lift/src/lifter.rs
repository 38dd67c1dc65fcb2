//! The trace lifter.
//!
//! Produces one optimized IR function per decoded trace. The function's
//! name encodes `(pc, byte-hash)`, so lifting is idempotent: a module
//! that already holds the name is returned as-is, and self-modified
//! bytes land under a fresh name.

use crate::hash::trace_hash;
use crate::semantics::{self, Lifted};
use log::{debug, warn};
use snapvm_core::Category;
use snapvm_disasm::{decode_trace, InstructionDecoder};
use snapvm_ir::{
    lifted_function_name, opt, FunctionBuilder, Intrinsic, Module, Terminator, VerifyError,
};
use thiserror::Error;

/// Lifting failures. Per-instruction semantic gaps are not errors (they
/// terminate their block with the error intrinsic); only a lifted
/// function failing verification is.
#[derive(Error, Debug)]
pub enum LiftError {
    #[error("lifted function failed verification: {0}")]
    Verify(#[from] VerifyError),
}

/// A lifted trace: where it is, what its bytes hashed to, and the name
/// of the function in the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiftedTrace {
    pub pc: u64,
    pub hash: u64,
    pub name: String,
}

/// Lifts decoded traces into IR functions.
pub struct TraceLifter<D> {
    decoder: D,
}

impl<D: InstructionDecoder> TraceLifter<D> {
    pub fn new(decoder: D) -> Self {
        Self { decoder }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Decodes the trace rooted at `pc` through `read_byte`, lifts it,
    /// and inserts the optimized function into `module`.
    pub fn lift_into_module(
        &self,
        pc: u64,
        read_byte: impl FnMut(u64) -> Option<u8>,
        module: &mut Module,
    ) -> Result<LiftedTrace, LiftError> {
        let insts = decode_trace(&self.decoder, pc, read_byte);
        let hash = trace_hash(&insts);
        let name = lifted_function_name(pc, hash);

        // Already lifted; don't re-do things.
        if module.functions.contains_key(&name) {
            return Ok(LiftedTrace { pc, hash, name });
        }

        debug!(
            "lifting trace at {:#x}: {} instructions, hash {:#x}",
            pc,
            insts.len(),
            hash
        );

        let mut builder = FunctionBuilder::new(&name, pc);

        // Guarantee an entry block even if the root failed to decode.
        if !insts.contains_key(&pc) {
            builder.block(pc).terminate(Terminator::TailCall {
                intrinsic: Intrinsic::Error,
            });
        }

        for inst in insts.values() {
            let mut block = builder.block(inst.pc);

            let lifted = match semantics::lift_instruction(inst, &mut block) {
                Ok(lifted) => lifted,
                Err(err) => {
                    if inst.category != Category::Invalid {
                        warn!("cannot lift {:#x}: {}", inst.pc, err);
                    }
                    block.terminate(Terminator::TailCall {
                        intrinsic: Intrinsic::Error,
                    });
                    continue;
                }
            };

            let term = terminator_for(inst, &lifted);
            block.terminate(term);
        }

        // Terminate any stragglers: targets referenced but not decoded
        // re-enter the runtime through the missing-block intrinsic.
        builder.stub_missing_targets();

        let mut func = builder.finish();
        opt::optimize(&mut func)?;

        module.functions.insert(name.clone(), func);
        Ok(LiftedTrace { pc, hash, name })
    }
}

/// Connects a lifted block to its successors according to category.
fn terminator_for(inst: &snapvm_core::DecodedInstruction, lifted: &Lifted) -> Terminator {
    let error = Terminator::TailCall {
        intrinsic: Intrinsic::Error,
    };
    match inst.category {
        Category::Invalid | Category::Error => error,

        Category::Normal | Category::NoOp => Terminator::Branch {
            target: inst.next_pc,
        },

        Category::DirectJump | Category::DirectCall => match inst.branch_taken_pc {
            Some(target) => Terminator::Branch { target },
            None => error,
        },

        Category::IndirectJump => Terminator::TailCall {
            intrinsic: Intrinsic::Jump,
        },
        Category::IndirectCall => Terminator::TailCall {
            intrinsic: Intrinsic::FunctionCall,
        },
        Category::Return => Terminator::TailCall {
            intrinsic: Intrinsic::FunctionReturn,
        },

        Category::ConditionalBranch => {
            match (lifted.branch_taken, inst.branch_taken_pc, inst.branch_not_taken_pc) {
                (Some(cond), Some(taken), Some(not_taken)) => Terminator::CondBranch {
                    cond,
                    taken,
                    not_taken,
                },
                _ => error,
            }
        }

        Category::AsyncHyperCall => match inst.hyper_call {
            Some(call) => Terminator::TailCall {
                intrinsic: Intrinsic::AsyncHyperCall { call },
            },
            None => error,
        },

        Category::ConditionalAsyncHyperCall => {
            match (lifted.branch_taken, inst.hyper_call, inst.branch_not_taken_pc) {
                (Some(cond), Some(call), Some(not_taken)) => Terminator::CondTailCall {
                    cond,
                    intrinsic: Intrinsic::AsyncHyperCall { call },
                    not_taken,
                },
                _ => error,
            }
        }
    }
}
