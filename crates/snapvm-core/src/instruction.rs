//! Decoded guest instructions and their control-flow categories.

use crate::Operand;
use serde::{Deserialize, Serialize};

/// A decoded guest instruction, carrying everything the trace walker and
/// the lifter need: raw bytes (hashed into the trace key), the operation
/// and operands for the semantics, and successor edges per category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedInstruction {
    /// Virtual address of the first byte.
    pub pc: u64,
    /// Raw instruction bytes.
    pub bytes: Vec<u8>,
    /// High-level operation.
    pub operation: Operation,
    /// Operands (destination first, then sources).
    pub operands: Vec<Operand>,
    /// Condition for conditional branches.
    pub condition: Option<Condition>,
    /// Hypercall kind for async-hyper-call instructions.
    pub hyper_call: Option<HyperCall>,
    /// Control-flow category.
    pub category: Category,
    /// Address of the next sequential instruction.
    pub next_pc: u64,
    /// Branch target when taken.
    pub branch_taken_pc: Option<u64>,
    /// Fall-through target of a conditional branch.
    pub branch_not_taken_pc: Option<u64>,
}

impl DecodedInstruction {
    /// Builds an invalid-category placeholder for a pc where decoding
    /// failed. The trace walker records these so the lifter can terminate
    /// the block with the error intrinsic.
    pub fn invalid(pc: u64, bytes: Vec<u8>) -> Self {
        Self {
            pc,
            next_pc: pc,
            bytes,
            operation: Operation::Invalid,
            operands: Vec::new(),
            condition: None,
            hyper_call: None,
            category: Category::Invalid,
            branch_taken_pc: None,
            branch_not_taken_pc: None,
        }
    }

    /// Size of the encoding in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Successor pcs that stay inside the trace. Indirect, returning,
    /// async, and invalid instructions have none: they end the trace.
    pub fn trace_successors(&self) -> Vec<u64> {
        match self.category {
            Category::Normal | Category::NoOp => vec![self.next_pc],
            Category::DirectJump | Category::DirectCall => {
                self.branch_taken_pc.into_iter().collect()
            }
            Category::ConditionalBranch | Category::ConditionalAsyncHyperCall => self
                .branch_taken_pc
                .into_iter()
                .chain(self.branch_not_taken_pc)
                .collect(),
            Category::IndirectJump
            | Category::IndirectCall
            | Category::Return
            | Category::AsyncHyperCall
            | Category::Invalid
            | Category::Error => vec![],
        }
    }
}

/// Control-flow category of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Bytes did not decode.
    Invalid,
    /// Decoded, but execution of it is an error (e.g. privileged).
    Error,
    /// Plain computation; falls through.
    Normal,
    /// No effect; falls through.
    NoOp,
    /// Unconditional branch to a known target.
    DirectJump,
    /// Branch through a register or memory.
    IndirectJump,
    /// Call to a known target.
    DirectCall,
    /// Call through a register or memory.
    IndirectCall,
    /// Return from a function.
    Return,
    /// Branch on a condition to a known target, else fall through.
    ConditionalBranch,
    /// Yields to the runtime (interrupt, halt).
    AsyncHyperCall,
    /// Conditionally yields to the runtime, else falls through.
    ConditionalAsyncHyperCall,
}

/// High-level operations of the supported x86-32 guest subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Invalid,
    Mov,
    Lea,
    Add,
    Sub,
    Cmp,
    And,
    Or,
    Xor,
    Test,
    Not,
    Neg,
    Inc,
    Dec,
    Shl,
    Shr,
    Sar,
    Push,
    Pop,
    Jump,
    ConditionalJump,
    Call,
    Return,
    Nop,
    Halt,
    Interrupt,
    InterruptOnOverflow,
}

/// Branch condition for conditional jumps, in x86 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Overflow,
    NotOverflow,
    Below,
    AboveOrEqual,
    Equal,
    NotEqual,
    BelowOrEqual,
    Above,
    Sign,
    NotSign,
    Parity,
    NotParity,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
}

impl Condition {
    /// Decodes the condition from the low nibble of a jcc opcode.
    pub fn from_encoding(nibble: u8) -> Self {
        match nibble & 0x0F {
            0x0 => Self::Overflow,
            0x1 => Self::NotOverflow,
            0x2 => Self::Below,
            0x3 => Self::AboveOrEqual,
            0x4 => Self::Equal,
            0x5 => Self::NotEqual,
            0x6 => Self::BelowOrEqual,
            0x7 => Self::Above,
            0x8 => Self::Sign,
            0x9 => Self::NotSign,
            0xA => Self::Parity,
            0xB => Self::NotParity,
            0xC => Self::Less,
            0xD => Self::GreaterOrEqual,
            0xE => Self::LessOrEqual,
            _ => Self::Greater,
        }
    }

    /// Returns the x86 mnemonic suffix for this condition.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Overflow => "o",
            Self::NotOverflow => "no",
            Self::Below => "b",
            Self::AboveOrEqual => "ae",
            Self::Equal => "e",
            Self::NotEqual => "ne",
            Self::BelowOrEqual => "be",
            Self::Above => "a",
            Self::Sign => "s",
            Self::NotSign => "ns",
            Self::Parity => "p",
            Self::NotParity => "np",
            Self::Less => "l",
            Self::GreaterOrEqual => "ge",
            Self::LessOrEqual => "le",
            Self::Greater => "g",
        }
    }
}

/// What an async-hyper-call instruction asks of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HyperCall {
    /// `hlt`: the task is done.
    Halt,
    /// `int n`: software interrupt.
    Interrupt { vector: u8 },
    /// `int3`: debug trap.
    Trap,
    /// `into`: overflow interrupt.
    Overflow,
}
