//! The concrete IR interpreter.
//!
//! Evaluates lifted functions against a task's register bank and address
//! space. The interpret loop runs trace to trace: intrinsics that name a
//! next pc (missing block, jump, call, return) continue in place without
//! unwinding; async hypercalls pause the task through its coroutine;
//! the error intrinsic and memory faults mark the task errored.

use crate::address_space::AddressSpace;
use crate::executor::RuntimeCtx;
use crate::task::{Task, TaskStatus};
use log::{debug, warn};
use snapvm_core::{HyperCall, RegisterBank};
use snapvm_ir::{BankReg, Function, Intrinsic, MemSize, Op, Src, Terminator};
use thiserror::Error;

/// A guest-visible fault that ends a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuestFault {
    #[error("memory read of {size} bytes at {addr:#x} failed")]
    MemoryRead { addr: u64, size: u64 },

    #[error("memory write of {size} bytes at {addr:#x} failed")]
    MemoryWrite { addr: u64, size: u64 },

    #[error("error intrinsic at {pc:#x}")]
    ErrorIntrinsic { pc: u64 },

    #[error("lifted function {name:?} disappeared from the module")]
    MissingFunction { name: String },

    #[error("lifted function has no block at {pc:#x}")]
    MissingBlockBody { pc: u64 },

    #[error("step limit exceeded")]
    StepLimit,
}

/// How one trace execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceExit {
    /// Continue at this pc (next trace).
    Next(u64),
    /// Yield to the runtime; resume at `resume_pc` afterwards.
    Async { call: HyperCall, resume_pc: u64 },
    /// The task faulted.
    Fault(GuestFault),
}

/// Interpreter over lifted traces. The concrete variant is the only one
/// implemented; a symbolic variant would plug in here.
pub trait Interpreter {
    /// Runs `task` until it terminates, pauses, or faults. The runtime
    /// context supplies lifted code and memory.
    fn interpret(&mut self, task: &mut Task, ctx: &mut RuntimeCtx<'_>);
}

/// The concrete interpreter.
#[derive(Debug, Default)]
pub struct ConcreteInterpreter;

impl ConcreteInterpreter {
    pub fn new() -> Self {
        Self
    }
}

impl Interpreter for ConcreteInterpreter {
    fn interpret(&mut self, task: &mut Task, ctx: &mut RuntimeCtx<'_>) {
        // A suspended task resumes at its saved continuation; a fresh
        // one just enters.
        if let Some(resume_pc) = task.coroutine.resume(&mut task.state) {
            task.pc = resume_pc;
        } else {
            task.coroutine.enter();
        }
        task.status = TaskStatus::Running;

        let mut blocks_run: u64 = 0;
        loop {
            let name = match ctx.request_func(task.pc, task.memory) {
                Ok(name) => name,
                Err(err) => {
                    warn!("lifting failed at {:#x}: {}", task.pc, err);
                    task.status = TaskStatus::Errored;
                    task.coroutine.leave();
                    return;
                }
            };

            // Disjoint borrows: lifted code is read from the module
            // while the task's address space is written through.
            let max_steps = ctx.max_steps;
            let exit = {
                let func = ctx.module.functions.get(&name);
                let space = &mut ctx.memories[task.memory];
                match func {
                    Some(func) => {
                        run_trace(func, &mut task.state, space, &mut blocks_run, max_steps)
                    }
                    None => TraceExit::Fault(GuestFault::MissingFunction { name }),
                }
            };

            match exit {
                TraceExit::Next(pc) => {
                    task.pc = pc;
                }
                TraceExit::Async { call, resume_pc } => match call {
                    HyperCall::Halt => {
                        debug!("task halted at {:#x}", resume_pc);
                        task.pc = resume_pc;
                        task.status = TaskStatus::Terminated;
                        task.coroutine.leave();
                        return;
                    }
                    _ => {
                        debug!("task paused on {:?} at {:#x}", call, resume_pc);
                        task.coroutine.pause(&task.state, resume_pc);
                        task.pc = resume_pc;
                        task.status = TaskStatus::Paused;
                        return;
                    }
                },
                TraceExit::Fault(fault) => {
                    warn!("task faulted: {}", fault);
                    task.status = TaskStatus::Errored;
                    task.coroutine.leave();
                    return;
                }
            }
        }
    }
}

/// Evaluates one lifted function from its entry until a tail-call
/// intrinsic. `blocks_run` accumulates executed blocks across the whole
/// dispatch; exceeding `max_steps` faults the task, even inside a loop
/// that never leaves this trace.
fn run_trace(
    func: &Function,
    bank: &mut RegisterBank,
    space: &mut AddressSpace,
    blocks_run: &mut u64,
    max_steps: Option<u64>,
) -> TraceExit {
    let mut temps = vec![0u64; func.temp_count as usize];
    let mut pc = func.entry_pc;

    loop {
        let Some(block) = func.blocks.get(&pc) else {
            return TraceExit::Fault(GuestFault::MissingBlockBody { pc });
        };
        *blocks_run += 1;
        if let Some(cap) = max_steps {
            if *blocks_run > cap {
                warn!("step limit of {} exceeded at {:#x}", cap, pc);
                return TraceExit::Fault(GuestFault::StepLimit);
            }
        }

        for op in &block.ops {
            let eval = |src: &Src, temps: &[u64]| -> u64 {
                match src {
                    Src::Temp(t) => temps[t.0 as usize],
                    Src::Imm(v) => *v,
                }
            };
            match op {
                Op::Const { dst, value } => temps[dst.0 as usize] = *value,
                Op::ReadReg { dst, reg } => temps[dst.0 as usize] = read_bank(bank, *reg),
                Op::WriteReg { reg, src } => {
                    let value = eval(src, &temps);
                    write_bank(bank, *reg, value);
                }
                Op::Load { dst, size, addr } => {
                    let addr = eval(addr, &temps);
                    match read_sized(space, *size, addr) {
                        Some(value) => temps[dst.0 as usize] = value,
                        None => {
                            return TraceExit::Fault(GuestFault::MemoryRead {
                                addr,
                                size: size.bytes(),
                            })
                        }
                    }
                }
                Op::Store { size, addr, src } => {
                    let addr = eval(addr, &temps);
                    let value = eval(src, &temps);
                    if !write_sized(space, *size, addr, value) {
                        return TraceExit::Fault(GuestFault::MemoryWrite {
                            addr,
                            size: size.bytes(),
                        });
                    }
                }
                Op::Binary {
                    dst,
                    op,
                    lhs,
                    rhs,
                    width,
                } => {
                    let l = eval(lhs, &temps);
                    let r = eval(rhs, &temps);
                    temps[dst.0 as usize] = op.eval(l, r, *width);
                }
                Op::Unary { dst, op, src, width } => {
                    let v = eval(src, &temps);
                    temps[dst.0 as usize] = op.eval(v, *width);
                }
            }
        }

        let eval = |src: &Src| -> u64 {
            match src {
                Src::Temp(t) => temps[t.0 as usize],
                Src::Imm(v) => *v,
            }
        };
        match &block.term {
            Terminator::Branch { target } => pc = *target,
            Terminator::CondBranch {
                cond,
                taken,
                not_taken,
            } => {
                pc = if eval(cond) != 0 { *taken } else { *not_taken };
            }
            Terminator::TailCall { intrinsic } => return exit_for(*intrinsic, bank),
            Terminator::CondTailCall {
                cond,
                intrinsic,
                not_taken,
            } => {
                if eval(cond) != 0 {
                    return exit_for(*intrinsic, bank);
                }
                pc = *not_taken;
            }
        }
    }
}

/// Maps a boundary intrinsic to a trace exit. Next-pc intrinsics read
/// the pc the lifted code left in EIP.
fn exit_for(intrinsic: Intrinsic, bank: &RegisterBank) -> TraceExit {
    match intrinsic {
        Intrinsic::Error => TraceExit::Fault(GuestFault::ErrorIntrinsic {
            pc: bank.eip() as u64,
        }),
        Intrinsic::MissingBlock { pc } => TraceExit::Next(pc),
        Intrinsic::Jump | Intrinsic::FunctionCall | Intrinsic::FunctionReturn => {
            TraceExit::Next(bank.eip() as u64)
        }
        Intrinsic::AsyncHyperCall { call } => TraceExit::Async {
            call,
            resume_pc: bank.eip() as u64,
        },
    }
}

fn read_bank(bank: &RegisterBank, reg: BankReg) -> u64 {
    match reg {
        BankReg::Gpr(num) => bank.gpr(num) as u64,
        BankReg::Eip => bank.eip() as u64,
        BankReg::Flag(flag) => bank.flag(flag) as u64,
    }
}

fn write_bank(bank: &mut RegisterBank, reg: BankReg, value: u64) {
    match reg {
        BankReg::Gpr(num) => bank.set_gpr(num, value as u32),
        BankReg::Eip => bank.set_eip(value as u32),
        BankReg::Flag(flag) => bank.set_flag(flag, value != 0),
    }
}

/// Little-endian sized read through the byte interface; sizes 1/2/4/8.
pub fn read_sized(space: &AddressSpace, size: MemSize, addr: u64) -> Option<u64> {
    let mut value: u64 = 0;
    for i in 0..size.bytes() {
        let byte = space.read_byte(addr.wrapping_add(i))?;
        value |= (byte as u64) << (i * 8);
    }
    Some(value)
}

/// Little-endian sized write through the byte interface; sizes 1/2/4/8.
pub fn write_sized(space: &mut AddressSpace, size: MemSize, addr: u64, value: u64) -> bool {
    for i in 0..size.bytes() {
        if !space.write_byte(addr.wrapping_add(i), (value >> (i * 8)) as u8) {
            return false;
        }
    }
    true
}
