//! x86-32 instruction decoder.
//!
//! Covers the guest subset the semantics library can lift: data movement,
//! the ALU family, stack operations, control flow, and the hypercall
//! instructions (`hlt`, `int`, `int3`, `into`). Valid x86 outside the
//! subset decodes to [`DecodeError::Unsupported`]; garbage decodes to
//! [`DecodeError::UnknownOpcode`]. The trace walker records either as an
//! invalid-category instruction.

use super::modrm::{decode_gpr, decode_modrm_reg, decode_modrm_rm, ModRM};
use super::prefix::Prefixes;
use crate::error::DecodeError;
use crate::traits::InstructionDecoder;
use snapvm_core::{
    Category, Condition, DecodedInstruction, GuestArch, HyperCall, Operand, Operation, Register,
};

/// x86-32 instruction decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86Decoder;

impl X86Decoder {
    pub fn new() -> Self {
        Self
    }
}

impl InstructionDecoder for X86Decoder {
    fn decode(&self, bytes: &[u8], pc: u64) -> Result<DecodedInstruction, DecodeError> {
        decode_one(bytes, pc)
    }

    fn max_instruction_size(&self) -> usize {
        15
    }

    fn arch(&self) -> GuestArch {
        GuestArch::X86
    }
}

/// A branch target, computed with 32-bit wrap.
fn rel_target(next_pc: u64, disp: i64) -> u64 {
    (next_pc as u32).wrapping_add(disp as u32) as u64
}

/// Reads a little-endian immediate of `bits` width, sign-extended.
fn read_imm(bytes: &[u8], offset: usize, bits: u8, pc: u64) -> Result<(i64, usize), DecodeError> {
    let n = (bits / 8) as usize;
    let end = offset + n;
    if bytes.len() < end {
        return Err(DecodeError::truncated(pc, end, bytes.len()));
    }
    let value = match n {
        1 => bytes[offset] as i8 as i64,
        2 => i16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as i64,
        _ => i32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as i64,
    };
    Ok((value, end))
}

/// Reads and decodes a ModR/M byte plus its r/m operand.
fn read_modrm(
    bytes: &[u8],
    offset: usize,
    bits: u8,
    pc: u64,
) -> Result<(ModRM, Operand, usize), DecodeError> {
    let byte = *bytes
        .get(offset)
        .ok_or_else(|| DecodeError::truncated(pc, offset + 1, bytes.len()))?;
    let modrm = ModRM::parse(byte);
    let (rm, consumed) = decode_modrm_rm(&bytes[offset + 1..], pc, modrm, bits)?;
    Ok((modrm, rm, offset + 1 + consumed))
}

fn make(
    pc: u64,
    raw: &[u8],
    len: usize,
    operation: Operation,
    operands: Vec<Operand>,
) -> DecodedInstruction {
    DecodedInstruction {
        pc,
        bytes: raw[..len].to_vec(),
        operation,
        operands,
        condition: None,
        hyper_call: None,
        category: Category::Normal,
        next_pc: pc + len as u64,
        branch_taken_pc: None,
        branch_not_taken_pc: None,
    }
}

fn decode_one(bytes: &[u8], pc: u64) -> Result<DecodedInstruction, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::truncated(pc, 1, 0));
    }

    let (prefixes, prefix_len) = Prefixes::parse(bytes);
    let mut offset = prefix_len;
    let opcode = *bytes
        .get(offset)
        .ok_or_else(|| DecodeError::truncated(pc, offset + 1, bytes.len()))?;
    offset += 1;
    let bits = prefixes.operand_bits();

    match opcode {
        // ALU families: add/or/and/sub/xor/cmp, six encodings each.
        0x00..=0x05 | 0x08..=0x0D | 0x20..=0x25 | 0x28..=0x2D | 0x30..=0x35 | 0x38..=0x3D => {
            let (operation, base) = match opcode & 0xF8 {
                0x00 => (Operation::Add, 0x00),
                0x08 => (Operation::Or, 0x08),
                0x20 => (Operation::And, 0x20),
                0x28 => (Operation::Sub, 0x28),
                0x30 => (Operation::Xor, 0x30),
                _ => (Operation::Cmp, 0x38),
            };
            let (operands, end) = alu_operands(bytes, offset, opcode - base, bits, pc)?;
            Ok(make(pc, bytes, end, operation, operands))
        }

        // inc/dec r32.
        0x40..=0x47 => {
            let reg = decode_gpr(opcode & 7, bits);
            Ok(make(pc, bytes, offset, Operation::Inc, vec![Operand::reg(reg)]))
        }
        0x48..=0x4F => {
            let reg = decode_gpr(opcode & 7, bits);
            Ok(make(pc, bytes, offset, Operation::Dec, vec![Operand::reg(reg)]))
        }

        // push/pop r.
        0x50..=0x57 => {
            let reg = decode_gpr(opcode & 7, bits);
            Ok(make(pc, bytes, offset, Operation::Push, vec![Operand::reg(reg)]))
        }
        0x58..=0x5F => {
            let reg = decode_gpr(opcode & 7, bits);
            Ok(make(pc, bytes, offset, Operation::Pop, vec![Operand::reg(reg)]))
        }

        // push imm.
        0x68 => {
            let (value, end) = read_imm(bytes, offset, bits.min(32), pc)?;
            Ok(make(
                pc,
                bytes,
                end,
                Operation::Push,
                vec![Operand::imm(value, bits)],
            ))
        }
        0x6A => {
            let (value, end) = read_imm(bytes, offset, 8, pc)?;
            Ok(make(
                pc,
                bytes,
                end,
                Operation::Push,
                vec![Operand::imm(value, 8)],
            ))
        }

        // jcc rel8.
        0x70..=0x7F => {
            let (disp, end) = read_imm(bytes, offset, 8, pc)?;
            let mut inst = make(pc, bytes, end, Operation::ConditionalJump, vec![]);
            let target = rel_target(inst.next_pc, disp);
            inst.operands = vec![Operand::pc_rel(target)];
            inst.condition = Some(Condition::from_encoding(opcode));
            inst.category = Category::ConditionalBranch;
            inst.branch_taken_pc = Some(target);
            inst.branch_not_taken_pc = Some(inst.next_pc);
            Ok(inst)
        }

        // Group 1: ALU r/m, imm.
        0x80 | 0x81 | 0x83 => {
            let op_bits = if opcode == 0x80 { 8 } else { bits };
            let (modrm, rm, after_rm) = read_modrm(bytes, offset, op_bits, pc)?;
            let operation = match modrm.reg {
                0 => Operation::Add,
                1 => Operation::Or,
                4 => Operation::And,
                5 => Operation::Sub,
                6 => Operation::Xor,
                7 => Operation::Cmp,
                _ => return Err(DecodeError::unsupported(pc, "adc/sbb")),
            };
            let imm_bits = if opcode == 0x81 { op_bits.min(32) } else { 8 };
            let (value, end) = read_imm(bytes, after_rm, imm_bits, pc)?;
            Ok(make(
                pc,
                bytes,
                end,
                operation,
                vec![rm, Operand::imm(value, op_bits)],
            ))
        }

        // test r/m, r.
        0x84 | 0x85 => {
            let op_bits = if opcode == 0x84 { 8 } else { bits };
            let (modrm, rm, end) = read_modrm(bytes, offset, op_bits, pc)?;
            Ok(make(
                pc,
                bytes,
                end,
                Operation::Test,
                vec![rm, decode_modrm_reg(modrm, op_bits)],
            ))
        }

        // mov r/m, r and mov r, r/m.
        0x88 | 0x89 | 0x8A | 0x8B => {
            let op_bits = if opcode & 1 == 0 { 8 } else { bits };
            let (modrm, rm, end) = read_modrm(bytes, offset, op_bits, pc)?;
            let reg = decode_modrm_reg(modrm, op_bits);
            let operands = if opcode < 0x8A {
                vec![rm, reg]
            } else {
                vec![reg, rm]
            };
            Ok(make(pc, bytes, end, Operation::Mov, operands))
        }

        // lea r, m.
        0x8D => {
            let (modrm, rm, end) = read_modrm(bytes, offset, bits, pc)?;
            if !rm.is_memory() {
                return Err(DecodeError::unknown_opcode(pc, &bytes[..end.min(bytes.len())]));
            }
            Ok(make(
                pc,
                bytes,
                end,
                Operation::Lea,
                vec![decode_modrm_reg(modrm, bits), rm],
            ))
        }

        // nop (and pause = f3 90).
        0x90 => Ok({
            let mut inst = make(pc, bytes, offset, Operation::Nop, vec![]);
            inst.category = Category::NoOp;
            inst
        }),

        // test al/eax, imm.
        0xA8 | 0xA9 => {
            let op_bits = if opcode == 0xA8 { 8 } else { bits };
            let (value, end) = read_imm(bytes, offset, op_bits.min(32), pc)?;
            let acc = decode_gpr(0, op_bits);
            Ok(make(
                pc,
                bytes,
                end,
                Operation::Test,
                vec![Operand::reg(acc), Operand::imm(value, op_bits)],
            ))
        }

        // mov r8, imm8.
        0xB0..=0xB7 => {
            let (value, end) = read_imm(bytes, offset, 8, pc)?;
            Ok(make(
                pc,
                bytes,
                end,
                Operation::Mov,
                vec![
                    Operand::reg(Register::gpr8(opcode & 7)),
                    Operand::imm(value, 8),
                ],
            ))
        }

        // mov r, imm.
        0xB8..=0xBF => {
            let (value, end) = read_imm(bytes, offset, bits.min(32), pc)?;
            Ok(make(
                pc,
                bytes,
                end,
                Operation::Mov,
                vec![
                    Operand::reg(decode_gpr(opcode & 7, bits)),
                    Operand::imm(value, bits),
                ],
            ))
        }

        // Group 2: shifts.
        0xC0 | 0xC1 | 0xD0 | 0xD1 | 0xD2 | 0xD3 => {
            let op_bits = if opcode & 1 == 0 { 8 } else { bits };
            let (modrm, rm, after_rm) = read_modrm(bytes, offset, op_bits, pc)?;
            let operation = match modrm.reg {
                4 => Operation::Shl,
                5 => Operation::Shr,
                7 => Operation::Sar,
                _ => return Err(DecodeError::unsupported(pc, "rotate")),
            };
            let (count, end) = match opcode {
                0xC0 | 0xC1 => {
                    let (value, end) = read_imm(bytes, after_rm, 8, pc)?;
                    (Operand::imm(value, 8), end)
                }
                0xD0 | 0xD1 => (Operand::imm(1, 8), after_rm),
                _ => (Operand::reg(Register::gpr8(1)), after_rm), // cl
            };
            Ok(make(pc, bytes, end, operation, vec![rm, count]))
        }

        // ret.
        0xC2 => {
            let (value, end) = read_imm(bytes, offset, 16, pc)?;
            let mut inst = make(
                pc,
                bytes,
                end,
                Operation::Return,
                vec![Operand::imm(value, 16)],
            );
            inst.category = Category::Return;
            Ok(inst)
        }
        0xC3 => {
            let mut inst = make(pc, bytes, offset, Operation::Return, vec![]);
            inst.category = Category::Return;
            Ok(inst)
        }

        // mov r/m, imm.
        0xC6 | 0xC7 => {
            let op_bits = if opcode == 0xC6 { 8 } else { bits };
            let (modrm, rm, after_rm) = read_modrm(bytes, offset, op_bits, pc)?;
            if modrm.reg != 0 {
                return Err(DecodeError::unknown_opcode(
                    pc,
                    &bytes[..after_rm.min(bytes.len())],
                ));
            }
            let (value, end) = read_imm(bytes, after_rm, op_bits.min(32), pc)?;
            Ok(make(
                pc,
                bytes,
                end,
                Operation::Mov,
                vec![rm, Operand::imm(value, op_bits)],
            ))
        }

        // int3 / int imm8 / into.
        0xCC => {
            let mut inst = make(pc, bytes, offset, Operation::Interrupt, vec![]);
            inst.category = Category::AsyncHyperCall;
            inst.hyper_call = Some(HyperCall::Trap);
            Ok(inst)
        }
        0xCD => {
            let (value, end) = read_imm(bytes, offset, 8, pc)?;
            let mut inst = make(
                pc,
                bytes,
                end,
                Operation::Interrupt,
                vec![Operand::imm(value, 8)],
            );
            inst.category = Category::AsyncHyperCall;
            inst.hyper_call = Some(HyperCall::Interrupt {
                vector: value as u8,
            });
            Ok(inst)
        }
        0xCE => {
            let mut inst = make(pc, bytes, offset, Operation::InterruptOnOverflow, vec![]);
            inst.category = Category::ConditionalAsyncHyperCall;
            inst.hyper_call = Some(HyperCall::Overflow);
            inst.branch_not_taken_pc = Some(inst.next_pc);
            Ok(inst)
        }

        // call rel32.
        0xE8 => {
            let (disp, end) = read_imm(bytes, offset, 32, pc)?;
            let mut inst = make(pc, bytes, end, Operation::Call, vec![]);
            let target = rel_target(inst.next_pc, disp);
            inst.operands = vec![Operand::pc_rel(target)];
            inst.category = Category::DirectCall;
            inst.branch_taken_pc = Some(target);
            Ok(inst)
        }

        // jmp rel32 / rel8.
        0xE9 | 0xEB => {
            let (disp, end) = read_imm(bytes, offset, if opcode == 0xE9 { 32 } else { 8 }, pc)?;
            let mut inst = make(pc, bytes, end, Operation::Jump, vec![]);
            let target = rel_target(inst.next_pc, disp);
            inst.operands = vec![Operand::pc_rel(target)];
            inst.category = Category::DirectJump;
            inst.branch_taken_pc = Some(target);
            Ok(inst)
        }

        // hlt.
        0xF4 => {
            let mut inst = make(pc, bytes, offset, Operation::Halt, vec![]);
            inst.category = Category::AsyncHyperCall;
            inst.hyper_call = Some(HyperCall::Halt);
            Ok(inst)
        }

        // Group 3: test imm / not / neg.
        0xF6 | 0xF7 => {
            let op_bits = if opcode == 0xF6 { 8 } else { bits };
            let (modrm, rm, after_rm) = read_modrm(bytes, offset, op_bits, pc)?;
            match modrm.reg {
                0 | 1 => {
                    let (value, end) = read_imm(bytes, after_rm, op_bits.min(32), pc)?;
                    Ok(make(
                        pc,
                        bytes,
                        end,
                        Operation::Test,
                        vec![rm, Operand::imm(value, op_bits)],
                    ))
                }
                2 => Ok(make(pc, bytes, after_rm, Operation::Not, vec![rm])),
                3 => Ok(make(pc, bytes, after_rm, Operation::Neg, vec![rm])),
                _ => Err(DecodeError::unsupported(pc, "mul/div family")),
            }
        }

        // Group 4: inc/dec r/m8.
        0xFE => {
            let (modrm, rm, end) = read_modrm(bytes, offset, 8, pc)?;
            match modrm.reg {
                0 => Ok(make(pc, bytes, end, Operation::Inc, vec![rm])),
                1 => Ok(make(pc, bytes, end, Operation::Dec, vec![rm])),
                _ => Err(DecodeError::unknown_opcode(pc, &bytes[..end.min(bytes.len())])),
            }
        }

        // Group 5: inc/dec/call/jmp/push r/m.
        0xFF => {
            let (modrm, rm, end) = read_modrm(bytes, offset, bits, pc)?;
            match modrm.reg {
                0 => Ok(make(pc, bytes, end, Operation::Inc, vec![rm])),
                1 => Ok(make(pc, bytes, end, Operation::Dec, vec![rm])),
                2 => {
                    let mut inst = make(pc, bytes, end, Operation::Call, vec![rm]);
                    inst.category = Category::IndirectCall;
                    Ok(inst)
                }
                4 => {
                    let mut inst = make(pc, bytes, end, Operation::Jump, vec![rm]);
                    inst.category = Category::IndirectJump;
                    Ok(inst)
                }
                6 => Ok(make(pc, bytes, end, Operation::Push, vec![rm])),
                3 | 5 => Err(DecodeError::unsupported(pc, "far call/jmp")),
                _ => Err(DecodeError::unknown_opcode(pc, &bytes[..end.min(bytes.len())])),
            }
        }

        // Two-byte escape.
        0x0F => {
            let second = *bytes
                .get(offset)
                .ok_or_else(|| DecodeError::truncated(pc, offset + 1, bytes.len()))?;
            offset += 1;
            match second {
                // jcc rel32.
                0x80..=0x8F => {
                    let (disp, end) = read_imm(bytes, offset, 32, pc)?;
                    let mut inst = make(pc, bytes, end, Operation::ConditionalJump, vec![]);
                    let target = rel_target(inst.next_pc, disp);
                    inst.operands = vec![Operand::pc_rel(target)];
                    inst.condition = Some(Condition::from_encoding(second));
                    inst.category = Category::ConditionalBranch;
                    inst.branch_taken_pc = Some(target);
                    inst.branch_not_taken_pc = Some(inst.next_pc);
                    Ok(inst)
                }
                // Long nop: 0f 1f /0.
                0x1F => {
                    let (_, _, end) = read_modrm(bytes, offset, bits, pc)?;
                    let mut inst = make(pc, bytes, end, Operation::Nop, vec![]);
                    inst.category = Category::NoOp;
                    Ok(inst)
                }
                _ => Err(DecodeError::unknown_opcode(
                    pc,
                    &bytes[..offset.min(bytes.len())],
                )),
            }
        }

        _ => Err(DecodeError::unknown_opcode(
            pc,
            &bytes[..offset.min(bytes.len())],
        )),
    }
}

/// Decodes the six-encoding ALU operand family. `delta` selects the form:
/// 0 = r/m8,r8; 1 = r/m,r; 2 = r8,r/m8; 3 = r,r/m; 4 = al,imm8; 5 = acc,imm.
fn alu_operands(
    bytes: &[u8],
    offset: usize,
    delta: u8,
    bits: u8,
    pc: u64,
) -> Result<(Vec<Operand>, usize), DecodeError> {
    match delta {
        0 | 1 | 2 | 3 => {
            let op_bits = if delta & 1 == 0 { 8 } else { bits };
            let (modrm, rm, end) = read_modrm(bytes, offset, op_bits, pc)?;
            let reg = decode_modrm_reg(modrm, op_bits);
            let operands = if delta < 2 {
                vec![rm, reg]
            } else {
                vec![reg, rm]
            };
            Ok((operands, end))
        }
        4 => {
            let (value, end) = read_imm(bytes, offset, 8, pc)?;
            Ok((
                vec![Operand::reg(Register::gpr8(0)), Operand::imm(value, 8)],
                end,
            ))
        }
        _ => {
            let (value, end) = read_imm(bytes, offset, bits.min(32), pc)?;
            Ok((
                vec![
                    Operand::reg(decode_gpr(0, bits)),
                    Operand::imm(value, bits),
                ],
                end,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvm_core::register::x86;

    fn decode(bytes: &[u8], pc: u64) -> DecodedInstruction {
        X86Decoder::new().decode(bytes, pc).unwrap()
    }

    #[test]
    fn nop_and_hlt() {
        let nop = decode(&[0x90], 0x1000);
        assert_eq!(nop.category, Category::NoOp);
        assert_eq!(nop.next_pc, 0x1001);

        let hlt = decode(&[0xF4], 0x1001);
        assert_eq!(hlt.category, Category::AsyncHyperCall);
        assert_eq!(hlt.hyper_call, Some(HyperCall::Halt));
    }

    #[test]
    fn mov_r32_imm32() {
        let inst = decode(&[0xB8, 0x78, 0x56, 0x34, 0x12], 0x1000);
        assert_eq!(inst.operation, Operation::Mov);
        assert_eq!(inst.size(), 5);
        assert_eq!(
            inst.operands,
            vec![
                Operand::reg(Register::gpr32(x86::EAX)),
                Operand::imm(0x12345678, 32)
            ]
        );
    }

    #[test]
    fn jmp_rel8_forward_and_backward() {
        let fwd = decode(&[0xEB, 0x0E], 0x1000);
        assert_eq!(fwd.category, Category::DirectJump);
        assert_eq!(fwd.branch_taken_pc, Some(0x1010));

        let back = decode(&[0xEB, 0xFC], 0x1000);
        assert_eq!(back.branch_taken_pc, Some(0xFFE));
    }

    #[test]
    fn jcc_rel8_has_both_edges() {
        // jne +4
        let inst = decode(&[0x75, 0x04], 0x2000);
        assert_eq!(inst.category, Category::ConditionalBranch);
        assert_eq!(inst.condition, Some(Condition::NotEqual));
        assert_eq!(inst.branch_taken_pc, Some(0x2008));
        assert_eq!(inst.branch_not_taken_pc, Some(0x2002));
    }

    #[test]
    fn jcc_rel32_via_0f_escape() {
        // jz +0x100
        let inst = decode(&[0x0F, 0x84, 0x00, 0x01, 0x00, 0x00], 0x1000);
        assert_eq!(inst.category, Category::ConditionalBranch);
        assert_eq!(inst.condition, Some(Condition::Equal));
        assert_eq!(inst.branch_taken_pc, Some(0x1106));
    }

    #[test]
    fn call_and_ret() {
        let call = decode(&[0xE8, 0x10, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(call.category, Category::DirectCall);
        assert_eq!(call.branch_taken_pc, Some(0x1015));

        let ret = decode(&[0xC3], 0x1000);
        assert_eq!(ret.category, Category::Return);

        let ret_imm = decode(&[0xC2, 0x08, 0x00], 0x1000);
        assert_eq!(ret_imm.category, Category::Return);
        assert_eq!(ret_imm.operands, vec![Operand::imm(8, 16)]);
    }

    #[test]
    fn indirect_jmp_through_register() {
        // jmp eax
        let inst = decode(&[0xFF, 0xE0], 0x1000);
        assert_eq!(inst.category, Category::IndirectJump);
        assert_eq!(
            inst.operands,
            vec![Operand::reg(Register::gpr32(x86::EAX))]
        );
    }

    #[test]
    fn int_carries_its_vector() {
        let inst = decode(&[0xCD, 0x21], 0x1000);
        assert_eq!(inst.category, Category::AsyncHyperCall);
        assert_eq!(inst.hyper_call, Some(HyperCall::Interrupt { vector: 0x21 }));

        let into = decode(&[0xCE], 0x1000);
        assert_eq!(into.category, Category::ConditionalAsyncHyperCall);
        assert_eq!(into.branch_not_taken_pc, Some(0x1001));
    }

    #[test]
    fn group1_sign_extended_imm8() {
        // add ebx, -1 (83 /0 ib)
        let inst = decode(&[0x83, 0xC3, 0xFF], 0x1000);
        assert_eq!(inst.operation, Operation::Add);
        assert_eq!(
            inst.operands,
            vec![
                Operand::reg(Register::gpr32(x86::EBX)),
                Operand::imm(-1, 32)
            ]
        );
    }

    #[test]
    fn mov_through_memory() {
        // mov [ebx+8], ecx
        let inst = decode(&[0x89, 0x4B, 0x08], 0x1000);
        assert_eq!(inst.operation, Operation::Mov);
        assert!(inst.operands[0].is_memory());
    }

    #[test]
    fn operand_size_prefix_gives_16_bit() {
        // 66 b8 34 12 -> mov ax, 0x1234
        let inst = decode(&[0x66, 0xB8, 0x34, 0x12], 0x1000);
        assert_eq!(inst.size(), 4);
        assert_eq!(
            inst.operands[0],
            Operand::reg(Register::gpr16(x86::EAX))
        );
    }

    #[test]
    fn unknown_and_unsupported_are_distinct() {
        let unknown = X86Decoder::new().decode(&[0x0F, 0x05], 0x1000);
        assert!(matches!(unknown, Err(DecodeError::UnknownOpcode { .. })));

        // f7 /6 = div
        let unsupported = X86Decoder::new().decode(&[0xF7, 0xF3], 0x1000);
        assert!(matches!(unsupported, Err(DecodeError::Unsupported { .. })));
    }

    #[test]
    fn truncated_immediate() {
        let err = X86Decoder::new().decode(&[0xB8, 0x01], 0x1000);
        assert!(matches!(err, Err(DecodeError::Truncated { .. })));
    }
}
