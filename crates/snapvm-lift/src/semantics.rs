//! Per-instruction semantics.
//!
//! Each supported operation lifts into IR ops appended to the
//! instruction's block. Every instruction first writes its fall-through
//! pc into EIP, so a trace boundary taken anywhere afterwards always
//! finds the correct resume point there; control-flow instructions
//! overwrite it with their target.
//!
//! A lift failure is not a lifter failure: the caller terminates the
//! block with the error intrinsic and the trace stays usable.

use snapvm_core::register::x86;
use snapvm_core::{
    Condition, DecodedInstruction, Flag, MemoryRef, Operand, Operation, Register,
};
use snapvm_ir::builder::BlockBuilder;
use snapvm_ir::{BankReg, BinOp, MemSize, Src, UnOp, Width};
use thiserror::Error;

/// What instruction lifting hands back to the trace lifter.
pub struct Lifted {
    /// The branch-taken value for conditional categories, 0 or 1.
    pub branch_taken: Option<Src>,
}

/// Why an instruction could not be lifted.
#[derive(Error, Debug)]
pub enum SemanticsError {
    #[error("no semantics for {op:?}")]
    Unsupported { op: Operation },

    #[error("malformed operands for {op:?}")]
    Operands { op: Operation },
}

/// Lifts one decoded instruction into its block.
pub fn lift_instruction(
    inst: &DecodedInstruction,
    b: &mut BlockBuilder<'_>,
) -> Result<Lifted, SemanticsError> {
    // Resume point for any trace boundary taken below.
    b.write(BankReg::Eip, Src::Imm(inst.next_pc));

    let mut lifted = Lifted { branch_taken: None };
    match inst.operation {
        Operation::Nop => {}

        Operation::Mov => {
            let (dst, src) = two_operands(inst)?;
            let width = op_width(inst)?;
            let value = read_operand(b, src, width)?;
            write_operand(b, dst, value, inst)?;
        }

        Operation::Lea => {
            let (dst, src) = two_operands(inst)?;
            let Operand::Memory(mem) = src else {
                return Err(SemanticsError::Operands { op: inst.operation });
            };
            let addr = address_of(b, mem);
            write_operand(b, dst, addr, inst)?;
        }

        Operation::Add
        | Operation::Sub
        | Operation::Cmp
        | Operation::And
        | Operation::Or
        | Operation::Xor
        | Operation::Test => lift_alu(inst, b)?,

        Operation::Inc | Operation::Dec => {
            let dst = one_operand(inst)?;
            let width = op_width(inst)?;
            let value = read_operand(b, dst, width)?;
            let bin = if inst.operation == Operation::Inc {
                BinOp::Add
            } else {
                BinOp::Sub
            };
            let result = Src::Temp(b.binary(bin, value, Src::Imm(1), width));
            set_result_flags(b, result, width);
            if inst.operation == Operation::Inc {
                set_add_overflow_adjust(b, value, Src::Imm(1), result, width);
            } else {
                set_sub_overflow_adjust(b, value, Src::Imm(1), result, width);
            }
            // CF is architecturally untouched by inc/dec.
            write_operand(b, dst, result, inst)?;
        }

        Operation::Not => {
            let dst = one_operand(inst)?;
            let width = op_width(inst)?;
            let value = read_operand(b, dst, width)?;
            let result = Src::Temp(b.unary(UnOp::Not, value, width));
            write_operand(b, dst, result, inst)?;
        }

        Operation::Neg => {
            let dst = one_operand(inst)?;
            let width = op_width(inst)?;
            let value = read_operand(b, dst, width)?;
            let result = Src::Temp(b.unary(UnOp::Neg, value, width));
            set_result_flags(b, result, width);
            let cf = b.binary(BinOp::CmpNe, value, Src::Imm(0), width);
            b.write(BankReg::Flag(Flag::Carry), Src::Temp(cf));
            set_sub_overflow_adjust(b, Src::Imm(0), value, result, width);
            write_operand(b, dst, result, inst)?;
        }

        Operation::Shl | Operation::Shr | Operation::Sar => lift_shift(inst, b)?,

        Operation::Push => {
            let src = one_operand(inst)?;
            let bytes = push_size(src);
            let width = Width::from_bits(bytes * 8)
                .ok_or(SemanticsError::Operands { op: inst.operation })?;
            let size = MemSize::from_bytes(bytes)
                .ok_or(SemanticsError::Operands { op: inst.operation })?;
            let value = read_operand(b, src, width)?;
            let esp = Src::Temp(b.read(BankReg::Gpr(x86::ESP)));
            let new_esp = Src::Temp(b.binary(BinOp::Sub, esp, Src::Imm(bytes as u64), Width::W32));
            b.store(size, new_esp, value);
            b.write(BankReg::Gpr(x86::ESP), new_esp);
        }

        Operation::Pop => {
            let dst = one_operand(inst)?;
            let bytes = push_size(dst);
            let size = MemSize::from_bytes(bytes)
                .ok_or(SemanticsError::Operands { op: inst.operation })?;
            let esp = Src::Temp(b.read(BankReg::Gpr(x86::ESP)));
            let value = Src::Temp(b.load(size, esp));
            let new_esp = Src::Temp(b.binary(BinOp::Add, esp, Src::Imm(bytes as u64), Width::W32));
            b.write(BankReg::Gpr(x86::ESP), new_esp);
            write_operand(b, dst, value, inst)?;
        }

        Operation::Jump => {
            let target = read_operand(b, one_operand(inst)?, Width::W32)?;
            b.write(BankReg::Eip, target);
        }

        Operation::Call => {
            let target = read_operand(b, one_operand(inst)?, Width::W32)?;
            let esp = Src::Temp(b.read(BankReg::Gpr(x86::ESP)));
            let new_esp = Src::Temp(b.binary(BinOp::Sub, esp, Src::Imm(4), Width::W32));
            b.store(MemSize::U32, new_esp, Src::Imm(inst.next_pc));
            b.write(BankReg::Gpr(x86::ESP), new_esp);
            b.write(BankReg::Eip, target);
        }

        Operation::Return => {
            let extra = match inst.operands.first() {
                Some(Operand::Immediate(imm)) => imm.as_u32() as u64,
                _ => 0,
            };
            let esp = Src::Temp(b.read(BankReg::Gpr(x86::ESP)));
            let ret = Src::Temp(b.load(MemSize::U32, esp));
            let new_esp =
                Src::Temp(b.binary(BinOp::Add, esp, Src::Imm(4 + extra), Width::W32));
            b.write(BankReg::Gpr(x86::ESP), new_esp);
            b.write(BankReg::Eip, ret);
        }

        Operation::ConditionalJump => {
            let cond = inst
                .condition
                .ok_or(SemanticsError::Operands { op: inst.operation })?;
            lifted.branch_taken = Some(condition_value(b, cond));
        }

        // EIP already holds the resume point; the terminator carries the
        // hypercall kind.
        Operation::Halt | Operation::Interrupt => {}

        Operation::InterruptOnOverflow => {
            lifted.branch_taken = Some(condition_value(b, Condition::Overflow));
        }

        Operation::Invalid => {
            return Err(SemanticsError::Unsupported { op: inst.operation });
        }
    }

    Ok(lifted)
}

/// add/sub/cmp/and/or/xor/test share operand handling and differ only in
/// the computation, flag recipe, and whether the result is written back.
fn lift_alu(inst: &DecodedInstruction, b: &mut BlockBuilder<'_>) -> Result<(), SemanticsError> {
    let (dst, src) = two_operands(inst)?;
    let width = op_width(inst)?;
    let lhs = read_operand(b, dst, width)?;
    let rhs = read_operand(b, src, width)?;

    let (bin, writeback, arithmetic) = match inst.operation {
        Operation::Add => (BinOp::Add, true, true),
        Operation::Sub => (BinOp::Sub, true, true),
        Operation::Cmp => (BinOp::Sub, false, true),
        Operation::And => (BinOp::And, true, false),
        Operation::Or => (BinOp::Or, true, false),
        Operation::Xor => (BinOp::Xor, true, false),
        _ => (BinOp::And, false, false), // Test
    };

    let result = Src::Temp(b.binary(bin, lhs, rhs, width));
    set_result_flags(b, result, width);

    if arithmetic {
        if inst.operation == Operation::Add {
            let cf = b.binary(BinOp::CmpUlt, result, lhs, width);
            b.write(BankReg::Flag(Flag::Carry), Src::Temp(cf));
            set_add_overflow_adjust(b, lhs, rhs, result, width);
        } else {
            let cf = b.binary(BinOp::CmpUlt, lhs, rhs, width);
            b.write(BankReg::Flag(Flag::Carry), Src::Temp(cf));
            set_sub_overflow_adjust(b, lhs, rhs, result, width);
        }
    } else {
        // Logic ops clear carry and overflow.
        b.write(BankReg::Flag(Flag::Carry), Src::Imm(0));
        b.write(BankReg::Flag(Flag::Overflow), Src::Imm(0));
        b.write(BankReg::Flag(Flag::Adjust), Src::Imm(0));
    }

    if writeback {
        write_operand(b, dst, result, inst)?;
    }
    Ok(())
}

fn lift_shift(inst: &DecodedInstruction, b: &mut BlockBuilder<'_>) -> Result<(), SemanticsError> {
    let (dst, count_op) = two_operands(inst)?;
    let width = op_width(inst)?;
    let value = read_operand(b, dst, width)?;
    let raw_count = read_operand(b, count_op, Width::W32)?;
    let count = Src::Temp(b.binary(BinOp::And, raw_count, Src::Imm(0x1F), Width::W32));

    let bin = match inst.operation {
        Operation::Shl => BinOp::Shl,
        Operation::Shr => BinOp::Shr,
        _ => BinOp::Sar,
    };
    let result = Src::Temp(b.binary(bin, value, count, width));
    set_result_flags(b, result, width);

    // Carry is the last bit shifted out.
    let count_m1 = Src::Temp(b.binary(BinOp::Sub, count, Src::Imm(1), Width::W32));
    let cf = match bin {
        BinOp::Shl => {
            let pre = Src::Temp(b.binary(BinOp::Shl, value, count_m1, width));
            let top = Src::Temp(b.binary(
                BinOp::Shr,
                pre,
                Src::Imm((width.bits() - 1) as u64),
                width,
            ));
            b.binary(BinOp::And, top, Src::Imm(1), width)
        }
        _ => {
            let shift = if bin == BinOp::Shr { BinOp::Shr } else { BinOp::Sar };
            let pre = Src::Temp(b.binary(shift, value, count_m1, width));
            b.binary(BinOp::And, pre, Src::Imm(1), width)
        }
    };
    b.write(BankReg::Flag(Flag::Carry), Src::Temp(cf));
    b.write(BankReg::Flag(Flag::Overflow), Src::Imm(0));

    write_operand(b, dst, result, inst)
}

/// Evaluates a branch condition from the flag slots, yielding 0 or 1.
pub fn condition_value(b: &mut BlockBuilder<'_>, cond: Condition) -> Src {
    use Condition::*;
    let flag = |b: &mut BlockBuilder<'_>, f: Flag| Src::Temp(b.read(BankReg::Flag(f)));
    let not = |b: &mut BlockBuilder<'_>, v: Src| {
        Src::Temp(b.binary(BinOp::CmpEq, v, Src::Imm(0), Width::W32))
    };
    match cond {
        Overflow => flag(b, Flag::Overflow),
        NotOverflow => {
            let of = flag(b, Flag::Overflow);
            not(b, of)
        }
        Below => flag(b, Flag::Carry),
        AboveOrEqual => {
            let cf = flag(b, Flag::Carry);
            not(b, cf)
        }
        Equal => flag(b, Flag::Zero),
        NotEqual => {
            let zf = flag(b, Flag::Zero);
            not(b, zf)
        }
        BelowOrEqual => {
            let cf = flag(b, Flag::Carry);
            let zf = flag(b, Flag::Zero);
            Src::Temp(b.binary(BinOp::Or, cf, zf, Width::W32))
        }
        Above => {
            let cf = flag(b, Flag::Carry);
            let zf = flag(b, Flag::Zero);
            let either = Src::Temp(b.binary(BinOp::Or, cf, zf, Width::W32));
            not(b, either)
        }
        Sign => flag(b, Flag::Sign),
        NotSign => {
            let sf = flag(b, Flag::Sign);
            not(b, sf)
        }
        Parity => flag(b, Flag::Parity),
        NotParity => {
            let pf = flag(b, Flag::Parity);
            not(b, pf)
        }
        Less => {
            let sf = flag(b, Flag::Sign);
            let of = flag(b, Flag::Overflow);
            Src::Temp(b.binary(BinOp::Xor, sf, of, Width::W32))
        }
        GreaterOrEqual => {
            let sf = flag(b, Flag::Sign);
            let of = flag(b, Flag::Overflow);
            let ne = Src::Temp(b.binary(BinOp::Xor, sf, of, Width::W32));
            not(b, ne)
        }
        LessOrEqual => {
            let sf = flag(b, Flag::Sign);
            let of = flag(b, Flag::Overflow);
            let ne = Src::Temp(b.binary(BinOp::Xor, sf, of, Width::W32));
            let zf = flag(b, Flag::Zero);
            Src::Temp(b.binary(BinOp::Or, ne, zf, Width::W32))
        }
        Greater => {
            let sf = flag(b, Flag::Sign);
            let of = flag(b, Flag::Overflow);
            let ne = Src::Temp(b.binary(BinOp::Xor, sf, of, Width::W32));
            let zf = flag(b, Flag::Zero);
            let either = Src::Temp(b.binary(BinOp::Or, ne, zf, Width::W32));
            not(b, either)
        }
    }
}

// ---------------------------------------------------------------------------
// Operand plumbing

fn two_operands(inst: &DecodedInstruction) -> Result<(&Operand, &Operand), SemanticsError> {
    match inst.operands.as_slice() {
        [a, b] => Ok((a, b)),
        _ => Err(SemanticsError::Operands { op: inst.operation }),
    }
}

fn one_operand(inst: &DecodedInstruction) -> Result<&Operand, SemanticsError> {
    inst.operands
        .first()
        .ok_or(SemanticsError::Operands { op: inst.operation })
}

/// Operation width, taken from the destination operand.
fn op_width(inst: &DecodedInstruction) -> Result<Width, SemanticsError> {
    let bits = match inst.operands.first() {
        Some(Operand::Register(r)) => r.size,
        Some(Operand::Memory(m)) => m.size * 8,
        Some(Operand::Immediate(imm)) => imm.size,
        Some(Operand::PcRelative { .. }) | None => 32,
    };
    Width::from_bits(bits).ok_or(SemanticsError::Operands { op: inst.operation })
}

/// Stack slot size for a push/pop operand. Immediates push at the
/// operand size of the instruction (32 unless prefixed).
fn push_size(operand: &Operand) -> u8 {
    match operand {
        Operand::Register(r) => r.size / 8,
        Operand::Memory(m) => m.size,
        Operand::Immediate(imm) if imm.size == 16 => 2,
        _ => 4,
    }
}

fn read_reg(b: &mut BlockBuilder<'_>, reg: Register) -> Src {
    let full = Src::Temp(b.read(BankReg::Gpr(reg.num)));
    match (reg.size, reg.high_byte) {
        (32, _) => full,
        (16, _) => Src::Temp(b.binary(BinOp::And, full, Src::Imm(0xFFFF), Width::W32)),
        (8, false) => Src::Temp(b.binary(BinOp::And, full, Src::Imm(0xFF), Width::W32)),
        _ => {
            let shifted = Src::Temp(b.binary(BinOp::Shr, full, Src::Imm(8), Width::W32));
            Src::Temp(b.binary(BinOp::And, shifted, Src::Imm(0xFF), Width::W32))
        }
    }
}

fn write_reg(b: &mut BlockBuilder<'_>, reg: Register, value: Src) {
    let slot = BankReg::Gpr(reg.num);
    match (reg.size, reg.high_byte) {
        (32, _) => b.write(slot, value),
        (16, _) => {
            let full = Src::Temp(b.read(slot));
            let cleared = Src::Temp(b.binary(BinOp::And, full, Src::Imm(0xFFFF_0000), Width::W32));
            let masked = Src::Temp(b.binary(BinOp::And, value, Src::Imm(0xFFFF), Width::W32));
            let merged = Src::Temp(b.binary(BinOp::Or, cleared, masked, Width::W32));
            b.write(slot, merged);
        }
        (8, false) => {
            let full = Src::Temp(b.read(slot));
            let cleared =
                Src::Temp(b.binary(BinOp::And, full, Src::Imm(0xFFFF_FF00), Width::W32));
            let masked = Src::Temp(b.binary(BinOp::And, value, Src::Imm(0xFF), Width::W32));
            let merged = Src::Temp(b.binary(BinOp::Or, cleared, masked, Width::W32));
            b.write(slot, merged);
        }
        _ => {
            let full = Src::Temp(b.read(slot));
            let cleared =
                Src::Temp(b.binary(BinOp::And, full, Src::Imm(0xFFFF_00FF), Width::W32));
            let masked = Src::Temp(b.binary(BinOp::And, value, Src::Imm(0xFF), Width::W32));
            let shifted = Src::Temp(b.binary(BinOp::Shl, masked, Src::Imm(8), Width::W32));
            let merged = Src::Temp(b.binary(BinOp::Or, cleared, shifted, Width::W32));
            b.write(slot, merged);
        }
    }
}

/// Effective address of a memory operand, with 32-bit wrap.
fn address_of(b: &mut BlockBuilder<'_>, mem: &MemoryRef) -> Src {
    let mut acc = Src::Imm(mem.displacement as u32 as u64);
    if let Some(base) = mem.base {
        let base_val = read_reg(b, base);
        acc = Src::Temp(b.binary(BinOp::Add, acc, base_val, Width::W32));
    }
    if let Some(index) = mem.index {
        let index_val = read_reg(b, index);
        let scaled = Src::Temp(b.binary(
            BinOp::Mul,
            index_val,
            Src::Imm(mem.scale as u64),
            Width::W32,
        ));
        acc = Src::Temp(b.binary(BinOp::Add, acc, scaled, Width::W32));
    }
    acc
}

fn read_operand(
    b: &mut BlockBuilder<'_>,
    operand: &Operand,
    width: Width,
) -> Result<Src, SemanticsError> {
    match operand {
        Operand::Register(r) => Ok(read_reg(b, *r)),
        Operand::Immediate(imm) => Ok(Src::Imm(imm.as_u32() as u64 & width.mask())),
        Operand::Memory(mem) => {
            let size = MemSize::from_bytes(mem.size)
                .ok_or(SemanticsError::Operands { op: Operation::Mov })?;
            let addr = address_of(b, mem);
            Ok(Src::Temp(b.load(size, addr)))
        }
        Operand::PcRelative { target } => Ok(Src::Imm(*target)),
    }
}

fn write_operand(
    b: &mut BlockBuilder<'_>,
    operand: &Operand,
    value: Src,
    inst: &DecodedInstruction,
) -> Result<(), SemanticsError> {
    match operand {
        Operand::Register(r) => {
            write_reg(b, *r, value);
            Ok(())
        }
        Operand::Memory(mem) => {
            let size = MemSize::from_bytes(mem.size)
                .ok_or(SemanticsError::Operands { op: inst.operation })?;
            let addr = address_of(b, mem);
            b.store(size, addr, value);
            Ok(())
        }
        _ => Err(SemanticsError::Operands { op: inst.operation }),
    }
}

// ---------------------------------------------------------------------------
// Flag recipes

/// ZF, SF, PF from a result.
fn set_result_flags(b: &mut BlockBuilder<'_>, result: Src, width: Width) {
    let zf = b.binary(BinOp::CmpEq, result, Src::Imm(0), width);
    b.write(BankReg::Flag(Flag::Zero), Src::Temp(zf));

    let sign = Src::Temp(b.binary(BinOp::And, result, Src::Imm(width.sign_bit()), width));
    let sf = b.binary(BinOp::CmpNe, sign, Src::Imm(0), width);
    b.write(BankReg::Flag(Flag::Sign), Src::Temp(sf));

    // Parity of the low byte: even population count sets PF.
    let low = Src::Temp(b.binary(BinOp::And, result, Src::Imm(0xFF), Width::W32));
    let ones = Src::Temp(b.unary(UnOp::Popcount, low, Width::W32));
    let odd = Src::Temp(b.binary(BinOp::And, ones, Src::Imm(1), Width::W32));
    let pf = b.binary(BinOp::CmpEq, odd, Src::Imm(0), Width::W32);
    b.write(BankReg::Flag(Flag::Parity), Src::Temp(pf));
}

/// OF and AF for `lhs + rhs = result`.
fn set_add_overflow_adjust(
    b: &mut BlockBuilder<'_>,
    lhs: Src,
    rhs: Src,
    result: Src,
    width: Width,
) {
    let x1 = Src::Temp(b.binary(BinOp::Xor, lhs, result, width));
    let x2 = Src::Temp(b.binary(BinOp::Xor, rhs, result, width));
    let both = Src::Temp(b.binary(BinOp::And, x1, x2, width));
    let sign = Src::Temp(b.binary(BinOp::And, both, Src::Imm(width.sign_bit()), width));
    let of = b.binary(BinOp::CmpNe, sign, Src::Imm(0), width);
    b.write(BankReg::Flag(Flag::Overflow), Src::Temp(of));
    set_adjust(b, lhs, rhs, result, width);
}

/// OF and AF for `lhs - rhs = result`.
fn set_sub_overflow_adjust(
    b: &mut BlockBuilder<'_>,
    lhs: Src,
    rhs: Src,
    result: Src,
    width: Width,
) {
    let x1 = Src::Temp(b.binary(BinOp::Xor, lhs, rhs, width));
    let x2 = Src::Temp(b.binary(BinOp::Xor, lhs, result, width));
    let both = Src::Temp(b.binary(BinOp::And, x1, x2, width));
    let sign = Src::Temp(b.binary(BinOp::And, both, Src::Imm(width.sign_bit()), width));
    let of = b.binary(BinOp::CmpNe, sign, Src::Imm(0), width);
    b.write(BankReg::Flag(Flag::Overflow), Src::Temp(of));
    set_adjust(b, lhs, rhs, result, width);
}

fn set_adjust(b: &mut BlockBuilder<'_>, lhs: Src, rhs: Src, result: Src, width: Width) {
    let x1 = Src::Temp(b.binary(BinOp::Xor, lhs, rhs, width));
    let x2 = Src::Temp(b.binary(BinOp::Xor, x1, result, width));
    let nibble = Src::Temp(b.binary(BinOp::And, x2, Src::Imm(0x10), width));
    let af = b.binary(BinOp::CmpNe, nibble, Src::Imm(0), width);
    b.write(BankReg::Flag(Flag::Adjust), Src::Temp(af));
}
