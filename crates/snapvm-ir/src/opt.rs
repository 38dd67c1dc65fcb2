//! Function optimization pipeline.
//!
//! Lifted functions run through constant folding, branch simplification,
//! unreachable-block removal, and dead-op elimination, bracketed by the
//! verifier on both sides. Passes may reshape the IR but never its
//! observable semantics.

use crate::function::{Function, Terminator};
use crate::op::{Op, Src, TempId};
use crate::verify::{verify, VerifyError};
use std::collections::{HashMap, HashSet, VecDeque};

/// Runs the whole pipeline over one function.
pub fn optimize(func: &mut Function) -> Result<(), VerifyError> {
    verify(func)?;
    fold_constants(func);
    simplify_branches(func);
    remove_unreachable_blocks(func);
    eliminate_dead_ops(func);
    verify(func)
}

/// Folds constant subexpressions and propagates known temps into later
/// operands within each block.
pub fn fold_constants(func: &mut Function) {
    for block in func.blocks.values_mut() {
        let mut known: HashMap<TempId, u64> = HashMap::new();
        let resolve = |src: Src, known: &HashMap<TempId, u64>| -> Src {
            match src {
                Src::Temp(t) => known.get(&t).map_or(src, |&v| Src::Imm(v)),
                imm => imm,
            }
        };

        for op in &mut block.ops {
            match op {
                Op::Const { dst, value } => {
                    known.insert(*dst, *value);
                }
                Op::Binary {
                    dst,
                    op: bin,
                    lhs,
                    rhs,
                    width,
                } => {
                    *lhs = resolve(*lhs, &known);
                    *rhs = resolve(*rhs, &known);
                    if let (Src::Imm(l), Src::Imm(r)) = (*lhs, *rhs) {
                        let value = bin.eval(l, r, *width);
                        known.insert(*dst, value);
                        *op = Op::Const { dst: *dst, value };
                    }
                }
                Op::Unary {
                    dst,
                    op: un,
                    src,
                    width,
                } => {
                    *src = resolve(*src, &known);
                    if let Src::Imm(v) = *src {
                        let value = un.eval(v, *width);
                        known.insert(*dst, value);
                        *op = Op::Const { dst: *dst, value };
                    }
                }
                Op::WriteReg { src, .. } => {
                    *src = resolve(*src, &known);
                }
                Op::Load { addr, .. } => {
                    *addr = resolve(*addr, &known);
                }
                Op::Store { addr, src, .. } => {
                    *addr = resolve(*addr, &known);
                    *src = resolve(*src, &known);
                }
                Op::ReadReg { .. } => {}
            }
        }

        match &mut block.term {
            Terminator::CondBranch { cond, .. } | Terminator::CondTailCall { cond, .. } => {
                *cond = resolve(*cond, &known);
            }
            _ => {}
        }
    }
}

/// Rewrites conditional terminators whose condition folded to a constant.
pub fn simplify_branches(func: &mut Function) {
    for block in func.blocks.values_mut() {
        block.term = match block.term.clone() {
            Terminator::CondBranch {
                cond: Src::Imm(c),
                taken,
                not_taken,
            } => Terminator::Branch {
                target: if c != 0 { taken } else { not_taken },
            },
            Terminator::CondTailCall {
                cond: Src::Imm(c),
                intrinsic,
                not_taken,
            } => {
                if c != 0 {
                    Terminator::TailCall { intrinsic }
                } else {
                    Terminator::Branch { target: not_taken }
                }
            }
            other => other,
        };
    }
}

/// Drops blocks no path from the entry reaches.
pub fn remove_unreachable_blocks(func: &mut Function) {
    let mut reachable: HashSet<u64> = HashSet::new();
    let mut work = VecDeque::from([func.entry_pc]);
    while let Some(pc) = work.pop_front() {
        if !reachable.insert(pc) {
            continue;
        }
        if let Some(block) = func.blocks.get(&pc) {
            for target in block.term.targets() {
                if !reachable.contains(&target) {
                    work.push_back(target);
                }
            }
        }
    }
    func.blocks.retain(|pc, _| reachable.contains(pc));
}

/// Removes pure ops whose result nothing consumes. Runs per block,
/// backwards, so chains of dead ops disappear in one pass.
pub fn eliminate_dead_ops(func: &mut Function) {
    for block in func.blocks.values_mut() {
        let mut live: HashSet<TempId> = HashSet::new();
        match &block.term {
            Terminator::CondBranch { cond: Src::Temp(t), .. }
            | Terminator::CondTailCall { cond: Src::Temp(t), .. } => {
                live.insert(*t);
            }
            _ => {}
        }

        let mut kept: Vec<Op> = Vec::with_capacity(block.ops.len());
        for op in block.ops.iter().rev() {
            let dead = op
                .def()
                .map_or(false, |d| !live.contains(&d) && op.is_pure());
            if dead {
                continue;
            }
            for used in op.uses() {
                live.insert(used);
            }
            kept.push(op.clone());
        }
        kept.reverse();
        block.ops = kept;
    }
}
