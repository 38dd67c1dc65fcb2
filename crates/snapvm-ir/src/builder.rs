//! Incremental function construction for the lifter.

use crate::function::{Block, Function, Terminator};
use crate::op::{BankReg, BinOp, Intrinsic, MemSize, Op, Src, TempId, UnOp, Width};

/// Builds one lifted function. Blocks are created on demand; temps are
/// allocated function-wide so ops never collide across blocks.
pub struct FunctionBuilder {
    func: Function,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, entry_pc: u64) -> Self {
        Self {
            func: Function::new(name, entry_pc),
        }
    }

    /// Opens (or reopens) the block at `pc` for appending.
    pub fn block(&mut self, pc: u64) -> BlockBuilder<'_> {
        let block = self.func.blocks.entry(pc).or_insert_with(|| Block {
            ops: Vec::new(),
            // Placeholder until the lifter terminates the block; anything
            // still carrying this after lifting becomes a missing stub.
            term: Terminator::TailCall {
                intrinsic: Intrinsic::MissingBlock { pc },
            },
        });
        BlockBuilder {
            block,
            temp_count: &mut self.func.temp_count,
        }
    }

    /// True if a block already exists at `pc`.
    pub fn has_block(&self, pc: u64) -> bool {
        self.func.blocks.contains_key(&pc)
    }

    /// Ensures every pc referenced by a terminator resolves to a block,
    /// stubbing absent targets with the missing-block intrinsic.
    pub fn stub_missing_targets(&mut self) {
        let mut missing = Vec::new();
        for block in self.func.blocks.values() {
            for target in block.term.targets() {
                if !self.func.blocks.contains_key(&target) {
                    missing.push(target);
                }
            }
        }
        missing.sort_unstable();
        missing.dedup();
        for pc in missing {
            self.func.blocks.insert(pc, Block::missing_stub(pc));
        }
    }

    pub fn finish(self) -> Function {
        self.func
    }
}

/// Appends ops to one block.
pub struct BlockBuilder<'a> {
    block: &'a mut Block,
    temp_count: &'a mut u32,
}

impl BlockBuilder<'_> {
    /// Allocates a fresh temp.
    pub fn temp(&mut self) -> TempId {
        let id = TempId(*self.temp_count);
        *self.temp_count += 1;
        id
    }

    /// Materializes a constant into a temp.
    pub fn constant(&mut self, value: u64) -> TempId {
        let dst = self.temp();
        self.block.ops.push(Op::Const { dst, value });
        dst
    }

    /// Reads a bank slot.
    pub fn read(&mut self, reg: BankReg) -> TempId {
        let dst = self.temp();
        self.block.ops.push(Op::ReadReg { dst, reg });
        dst
    }

    /// Writes a bank slot.
    pub fn write(&mut self, reg: BankReg, src: Src) {
        self.block.ops.push(Op::WriteReg { reg, src });
    }

    /// Loads from guest memory.
    pub fn load(&mut self, size: MemSize, addr: Src) -> TempId {
        let dst = self.temp();
        self.block.ops.push(Op::Load { dst, size, addr });
        dst
    }

    /// Stores to guest memory.
    pub fn store(&mut self, size: MemSize, addr: Src, src: Src) {
        self.block.ops.push(Op::Store { size, addr, src });
    }

    /// Emits a binary ALU op.
    pub fn binary(&mut self, op: BinOp, lhs: Src, rhs: Src, width: Width) -> TempId {
        let dst = self.temp();
        self.block.ops.push(Op::Binary {
            dst,
            op,
            lhs,
            rhs,
            width,
        });
        dst
    }

    /// Emits a unary ALU op.
    pub fn unary(&mut self, op: UnOp, src: Src, width: Width) -> TempId {
        let dst = self.temp();
        self.block.ops.push(Op::Unary {
            dst,
            op,
            src,
            width,
        });
        dst
    }

    /// Sets the block terminator.
    pub fn terminate(&mut self, term: Terminator) {
        self.block.term = term;
    }
}
