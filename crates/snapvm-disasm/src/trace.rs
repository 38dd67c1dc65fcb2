//! Work-list trace decoding.
//!
//! Starting from a root pc, decode instructions and follow their
//! intra-trace edges (fall-through, direct branches, both arms of
//! conditional branches) until every path ends at a trace boundary:
//! an indirect transfer, a return, an async hypercall, or bytes that
//! fail to decode.

use crate::traits::InstructionDecoder;
use log::trace;
use snapvm_core::DecodedInstruction;
use std::collections::{BTreeMap, VecDeque};

/// Decodes the trace rooted at `start_pc`, reading bytes through
/// `read_byte` (an executable view of guest memory). Pcs that fail to
/// read or decode are recorded as invalid-category instructions so the
/// lifter can terminate them with the error intrinsic. The first decode
/// at a pc wins; later conflicting edges are dropped.
pub fn decode_trace<D: InstructionDecoder>(
    decoder: &D,
    start_pc: u64,
    mut read_byte: impl FnMut(u64) -> Option<u8>,
) -> BTreeMap<u64, DecodedInstruction> {
    let mut insts: BTreeMap<u64, DecodedInstruction> = BTreeMap::new();
    let mut work: VecDeque<u64> = VecDeque::from([start_pc]);

    while let Some(pc) = work.pop_front() {
        if insts.contains_key(&pc) {
            continue;
        }

        let mut window = Vec::with_capacity(decoder.max_instruction_size());
        for i in 0..decoder.max_instruction_size() as u64 {
            match read_byte(pc + i) {
                Some(byte) => window.push(byte),
                None => break,
            }
        }

        if window.is_empty() {
            trace!("trace {:#x}: no executable bytes at {:#x}", start_pc, pc);
            insts.insert(pc, DecodedInstruction::invalid(pc, Vec::new()));
            continue;
        }

        match decoder.decode(&window, pc) {
            Ok(inst) => {
                for succ in inst.trace_successors() {
                    if !insts.contains_key(&succ) {
                        work.push_back(succ);
                    }
                }
                insts.insert(pc, inst);
            }
            Err(err) => {
                trace!("trace {:#x}: decode failed at {:#x}: {}", start_pc, pc, err);
                insts.insert(pc, DecodedInstruction::invalid(pc, window[..1].to_vec()));
            }
        }
    }

    insts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::X86Decoder;
    use snapvm_core::Category;

    fn reader(code: &'static [u8], base: u64) -> impl FnMut(u64) -> Option<u8> {
        move |addr| {
            let offset = addr.checked_sub(base)? as usize;
            code.get(offset).copied()
        }
    }

    #[test]
    fn straight_line_stops_at_hypercall() {
        let code: &[u8] = &[0x90, 0x90, 0xF4, 0x90];
        let insts = decode_trace(&X86Decoder::new(), 0x1000, reader(code, 0x1000));

        assert_eq!(insts.len(), 3);
        assert_eq!(insts[&0x1002].category, Category::AsyncHyperCall);
        // The nop after hlt is beyond the boundary.
        assert!(!insts.contains_key(&0x1003));
    }

    #[test]
    fn direct_jump_pulls_in_its_target() {
        // 0x1000: jmp 0x1010; 0x1010: ret
        let code: &[u8] = &[
            0xEB, 0x0E, // jmp +14
            0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
            0xC3, // ret at 0x1010
        ];
        let insts = decode_trace(&X86Decoder::new(), 0x1000, reader(code, 0x1000));

        assert_eq!(insts.len(), 2);
        assert_eq!(insts[&0x1000].category, Category::DirectJump);
        assert_eq!(insts[&0x1010].category, Category::Return);
        // The nops in between were never reached.
        assert!(!insts.contains_key(&0x1002));
    }

    #[test]
    fn conditional_branch_walks_both_arms() {
        // 0x1000: jne +2; 0x1002: hlt; 0x1003: nop; 0x1004: ret
        let code: &[u8] = &[0x75, 0x02, 0xF4, 0x90, 0xC3];
        let insts = decode_trace(&X86Decoder::new(), 0x1000, reader(code, 0x1000));

        assert_eq!(insts.len(), 3);
        assert!(insts.contains_key(&0x1002)); // not-taken arm
        assert!(insts.contains_key(&0x1004)); // taken arm
    }

    #[test]
    fn unreadable_root_is_recorded_invalid() {
        let insts = decode_trace(&X86Decoder::new(), 0xdead, |_| None);
        assert_eq!(insts.len(), 1);
        assert_eq!(insts[&0xdead].category, Category::Invalid);
    }

    #[test]
    fn undecodable_bytes_become_invalid_entries() {
        // jmp +1 lands on 0xFF 0xFF (invalid modrm ext), recorded invalid.
        let code: &[u8] = &[0xEB, 0x00, 0xFF, 0xFF];
        let insts = decode_trace(&X86Decoder::new(), 0x1000, reader(code, 0x1000));
        assert_eq!(insts[&0x1002].category, Category::Invalid);
    }

    #[test]
    fn first_decode_wins_on_overlap() {
        // A trace that jumps back into the immediate of an earlier
        // instruction: both pcs decode, each exactly once.
        // 0x1000: mov eax, 0x90909090 ; 0x1005: jmp 0x1002
        let code: &[u8] = &[0xB8, 0x90, 0x90, 0x90, 0x90, 0xEB, 0xFB, 0xC3];
        let insts = decode_trace(&X86Decoder::new(), 0x1000, reader(code, 0x1000));

        assert!(insts.contains_key(&0x1000));
        assert!(insts.contains_key(&0x1002)); // overlapping decode of the imm bytes
        let again = decode_trace(&X86Decoder::new(), 0x1000, reader(code, 0x1000));
        assert_eq!(insts, again);
    }
}
