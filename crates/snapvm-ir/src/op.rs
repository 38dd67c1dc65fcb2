//! IR operations.
//!
//! The IR is a flat register-transfer code over block-local temporaries.
//! Guest-visible state is reached only through [`BankReg`] reads/writes
//! and sized memory loads/stores; everything else is pure arithmetic on
//! temps. That split is what lets the interpreter service memory through
//! runtime callbacks while keeping the ALU evaluation self-contained.

use serde::{Deserialize, Serialize};
use snapvm_core::{Flag, HyperCall};

/// A block-local temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId(pub u32);

/// An operand of an IR operation: a temp or an inline constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Src {
    Temp(TempId),
    Imm(u64),
}

/// A slot of the guest register bank addressable from IR.
///
/// Registers are always accessed at full width here; sub-word guest
/// accesses are expressed as mask-and-merge sequences by the lifter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BankReg {
    /// 32-bit general-purpose register by encoding number.
    Gpr(u8),
    /// Program counter.
    Eip,
    /// One status flag, read/written as 0 or 1.
    Flag(Flag),
}

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemSize {
    U8,
    U16,
    U32,
    U64,
}

impl MemSize {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }

    /// Maps a byte count to a size, if it is one we can access.
    pub fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            1 => Some(Self::U8),
            2 => Some(Self::U16),
            4 => Some(Self::U32),
            8 => Some(Self::U64),
            _ => None,
        }
    }
}

/// ALU operation width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    pub fn bits(&self) -> u32 {
        match self {
            Self::W8 => 8,
            Self::W16 => 16,
            Self::W32 => 32,
        }
    }

    pub fn mask(&self) -> u64 {
        match self {
            Self::W8 => 0xFF,
            Self::W16 => 0xFFFF,
            Self::W32 => 0xFFFF_FFFF,
        }
    }

    /// Mask selecting the sign bit at this width.
    pub fn sign_bit(&self) -> u64 {
        1 << (self.bits() - 1)
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(Self::W8),
            16 => Some(Self::W16),
            32 => Some(Self::W32),
            _ => None,
        }
    }
}

/// Binary ALU operations. Results are truncated to the operation width;
/// comparison results are 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    CmpEq,
    CmpNe,
    CmpUlt,
    CmpUle,
    CmpSlt,
    CmpSle,
}

impl BinOp {
    /// Evaluates the op at `width`. This is the single definition of ALU
    /// semantics, shared by the interpreter and the constant folder.
    pub fn eval(&self, lhs: u64, rhs: u64, width: Width) -> u64 {
        let mask = width.mask();
        let bits = width.bits();
        let l = lhs & mask;
        let r = rhs & mask;
        let sign = width.sign_bit();
        let sext = |v: u64| -> i64 {
            if v & sign != 0 {
                (v | !mask) as i64
            } else {
                v as i64
            }
        };
        let result = match self {
            Self::Add => l.wrapping_add(r),
            Self::Sub => l.wrapping_sub(r),
            Self::Mul => l.wrapping_mul(r),
            Self::And => l & r,
            Self::Or => l | r,
            Self::Xor => l ^ r,
            // Shift counts at or past the width drain the value rather
            // than wrapping around.
            Self::Shl => {
                let shift = (r & 0xFF) as u32;
                if shift >= bits {
                    0
                } else {
                    l << shift
                }
            }
            Self::Shr => {
                let shift = (r & 0xFF) as u32;
                if shift >= bits {
                    0
                } else {
                    l >> shift
                }
            }
            Self::Sar => {
                let shift = ((r & 0xFF) as u32).min(bits - 1);
                (sext(l) >> shift) as u64
            }
            Self::CmpEq => (l == r) as u64,
            Self::CmpNe => (l != r) as u64,
            Self::CmpUlt => (l < r) as u64,
            Self::CmpUle => (l <= r) as u64,
            Self::CmpSlt => (sext(l) < sext(r)) as u64,
            Self::CmpSle => (sext(l) <= sext(r)) as u64,
        };
        result & mask
    }
}

/// Unary ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
    Popcount,
}

impl UnOp {
    /// Evaluates the op at `width`; see [`BinOp::eval`].
    pub fn eval(&self, src: u64, width: Width) -> u64 {
        let mask = width.mask();
        let v = src & mask;
        let result = match self {
            Self::Not => !v,
            Self::Neg => v.wrapping_neg(),
            Self::Popcount => v.count_ones() as u64,
        };
        result & mask
    }
}

/// One IR operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Materialize a constant.
    Const { dst: TempId, value: u64 },
    /// Read a bank slot into a temp.
    ReadReg { dst: TempId, reg: BankReg },
    /// Write a value into a bank slot.
    WriteReg { reg: BankReg, src: Src },
    /// Load from guest memory. Faults end the trace via the error path.
    Load { dst: TempId, size: MemSize, addr: Src },
    /// Store to guest memory.
    Store { size: MemSize, addr: Src, src: Src },
    /// Binary ALU operation.
    Binary {
        dst: TempId,
        op: BinOp,
        lhs: Src,
        rhs: Src,
        width: Width,
    },
    /// Unary ALU operation.
    Unary {
        dst: TempId,
        op: UnOp,
        src: Src,
        width: Width,
    },
}

impl Op {
    /// The temp this op defines, if any.
    pub fn def(&self) -> Option<TempId> {
        match self {
            Op::Const { dst, .. }
            | Op::ReadReg { dst, .. }
            | Op::Load { dst, .. }
            | Op::Binary { dst, .. }
            | Op::Unary { dst, .. } => Some(*dst),
            Op::WriteReg { .. } | Op::Store { .. } => None,
        }
    }

    /// The temps this op uses.
    pub fn uses(&self) -> Vec<TempId> {
        fn temp(src: &Src, out: &mut Vec<TempId>) {
            if let Src::Temp(t) = src {
                out.push(*t);
            }
        }
        let mut out = Vec::new();
        match self {
            Op::Const { .. } | Op::ReadReg { .. } => {}
            Op::WriteReg { src, .. } | Op::Unary { src, .. } => temp(src, &mut out),
            Op::Load { addr, .. } => temp(addr, &mut out),
            Op::Store { addr, src, .. } => {
                temp(addr, &mut out);
                temp(src, &mut out);
            }
            Op::Binary { lhs, rhs, .. } => {
                temp(lhs, &mut out);
                temp(rhs, &mut out);
            }
        }
        out
    }

    /// True if removing this op (when its def is unused) cannot change
    /// observable behavior. Loads stay: a faulting address is observable.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Op::Const { .. } | Op::ReadReg { .. } | Op::Binary { .. } | Op::Unary { .. }
        )
    }
}

/// Runtime intrinsics that lifted code tail-calls at trace boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Intrinsic {
    /// Guest fault: undecodable bytes, bad memory access.
    Error,
    /// Control reached a pc outside the decoded trace; the runtime
    /// re-enters the lifter there.
    MissingBlock { pc: u64 },
    /// Indirect jump; the new pc is in the bank's EIP.
    Jump,
    /// Indirect call; the new pc is in the bank's EIP.
    FunctionCall,
    /// Return; the new pc is in the bank's EIP.
    FunctionReturn,
    /// Yield to the runtime.
    AsyncHyperCall { call: HyperCall },
}

impl Intrinsic {
    /// The runtime symbol this intrinsic resolves against. A runtime
    /// module must declare every one of these.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::MissingBlock { .. } => "missing_block",
            Self::Jump => "jump",
            Self::FunctionCall => "function_call",
            Self::FunctionReturn => "function_return",
            Self::AsyncHyperCall { .. } => "async_hyper_call",
        }
    }
}
