//! End-to-end scenarios through the executor: lift, interpret, suspend,
//! self-modify.

use snapvm_core::register::x86;
use snapvm_core::RegisterBank;
use snapvm_ir::{Module, Terminator};
use snapvm_runtime::{
    AddressSpace, Executor, PageRangeKind, Perms, Task, TaskStatus, Workspace,
};

fn executor_with_code(code: &[u8], base: u64) -> (Executor, usize) {
    let mut exec = Executor::new(Module::runtime_seed(RegisterBank::MIN_LEN)).unwrap();
    let mut space = AddressSpace::new(1);
    space
        .add_map(base, 0x1000, Perms::RWX, PageRangeKind::Anonymous, "code")
        .unwrap();
    assert!(space.write(base, code));
    // Loading code through the writable view trips the write-to-exec
    // flag; consume it so scenarios observe only their own writes.
    space.consume_write_to_exec();
    let mem = exec.add_memory(space);
    (exec, mem)
}

fn run_to_completion(exec: &mut Executor, task: &mut Task) {
    // Drive one task by hand, re-dispatching while it pauses, so the
    // intermediate states stay observable.
    for _ in 0..64 {
        exec.step_task(task);
        if task.status != TaskStatus::Paused {
            return;
        }
    }
    panic!("task did not settle");
}

/// S1: a single block of nop; nop; hlt runs to completion through the
/// hypercall path.
#[test]
fn single_block_runs_to_halt() {
    let (mut exec, mem) = executor_with_code(&[0x90, 0x90, 0xF4], 0x1000);
    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);

    exec.step_task(&mut task);

    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(task.pc, 0x1003);
}

/// S1 through the queue: add_initial_task + run drains cleanly.
#[test]
fn run_drains_the_queue() {
    let (mut exec, mem) = executor_with_code(&[0x90, 0x90, 0xF4], 0x1000);
    exec.add_initial_task(vec![0; RegisterBank::MIN_LEN], 0x1000, mem)
        .unwrap();
    exec.run();
    assert_eq!(exec.cached_traces(), 1);
}

/// S2: a direct branch trace lifts source and target into one function,
/// and the pc after the trace is the target reported by the return.
#[test]
fn direct_branch_trace_returns_through_the_stack() {
    let mut code = vec![0u8; 0x200];
    code[0x000] = 0xEB; // jmp +14 -> 0x1010
    code[0x001] = 0x0E;
    code[0x010] = 0xC3; // ret
    code[0x100] = 0xF4; // hlt at the return target 0x1100
    let (mut exec, mem) = executor_with_code(&code, 0x1000);

    // Stack at 0x1800 holding the return target 0x1100.
    let space = exec.memory(mem).unwrap();
    assert!(space.write(0x1800, &0x1100u32.to_le_bytes()));
    space.consume_write_to_exec();

    let mut bank = RegisterBank::zeroed();
    bank.set_gpr(x86::ESP, 0x1800);
    let mut task = Task::new(bank, 0x1000, mem);

    exec.step_task(&mut task);

    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(task.pc, 0x1101);
    assert_eq!(task.state.gpr(x86::ESP), 0x1804);

    // One lifted function holds both the jump source and its target.
    let func = exec
        .module()
        .functions
        .values()
        .find(|f| f.entry_pc == 0x1000)
        .expect("trace at 0x1000 was lifted");
    assert!(func.blocks.contains_key(&0x1000));
    assert!(func.blocks.contains_key(&0x1010));
}

/// S3: a load from unmapped memory faults the task through the error
/// path without disturbing the executor.
#[test]
fn unmapped_read_errors_the_task() {
    // mov eax, [0xdead]; hlt
    let code = [0x8B, 0x05, 0xAD, 0xDE, 0x00, 0x00, 0xF4];
    let (mut exec, mem) = executor_with_code(&code, 0x1000);
    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);

    exec.step_task(&mut task);

    assert_eq!(task.status, TaskStatus::Errored);
}

/// S4: overwriting the next trace's bytes makes the next trace request
/// hash and lift fresh code; the old function is never used for it.
#[test]
fn self_modifying_code_lifts_a_fresh_trace() {
    // 0x1000: mov byte [0x1009], 0x90   (patches the hlt below to a nop)
    // 0x1007: int 0x20                  (trace boundary, suspends)
    // 0x1009: hlt                       (patched to nop before it runs)
    // 0x100a: hlt
    let code = [
        0xC6, 0x05, 0x09, 0x10, 0x00, 0x00, 0x90, // mov byte [0x1009], 0x90
        0xCD, 0x20, // int 0x20
        0xF4, // hlt (to be patched)
        0xF4, // hlt
    ];
    let (mut exec, mem) = executor_with_code(&code, 0x1000);
    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);

    exec.step_task(&mut task);
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.pc, 0x1009);
    // The store to executable memory was observed.
    assert!(exec.memory(mem).unwrap().seen_write_to_exec());
    assert_eq!(exec.memory(mem).unwrap().read_byte(0x1009), Some(0x90));

    exec.step_task(&mut task);
    assert_eq!(task.status, TaskStatus::Terminated);
    // Terminated by the hlt at 0x100a, not the patched one.
    assert_eq!(task.pc, 0x100B);

    // The trace lifted at 0x1009 saw the patched bytes: its root block
    // falls through to the hlt instead of halting itself.
    let func = exec
        .module()
        .functions
        .values()
        .find(|f| f.entry_pc == 0x1009)
        .expect("patched trace was lifted");
    assert_eq!(
        func.blocks[&0x1009].term,
        Terminator::Branch { target: 0x100A }
    );
}

/// S5: after cloning, parent writes stay invisible to the child.
#[test]
fn cow_clone_isolates_parent_writes() {
    let (mut exec, mem) = executor_with_code(&[0xF4], 0x1000);
    let child = {
        let parent = exec.memory(mem).unwrap();
        parent.write_byte(0x1100, 0x55);
        parent.clone_with_id(2)
    };
    let child_mem = exec.add_memory(child);

    let parent = exec.memory(mem).unwrap();
    assert!(parent.write_byte(0x1100, 0xAA));
    assert_eq!(parent.read_byte(0x1100), Some(0xAA));

    let child = exec.memory(child_mem).unwrap();
    assert_eq!(child.read_byte(0x1100), Some(0x55));
}

/// S6: an async hypercall pauses the task mid-trace; resumption
/// continues at the following instruction with register and memory
/// state intact.
#[test]
fn async_hypercall_suspends_and_resumes() {
    // mov eax, 5; int 0x21; mov ebx, eax; hlt
    let code = [
        0xB8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
        0xCD, 0x21, // int 0x21
        0x89, 0xC3, // mov ebx, eax
        0xF4, // hlt
    ];
    let (mut exec, mem) = executor_with_code(&code, 0x1000);

    let space = exec.memory(mem).unwrap();
    assert!(space.write_byte(0x1200, 0x7E));
    space.consume_write_to_exec();

    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);

    exec.step_task(&mut task);
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.pc, 0x1007);
    assert_eq!(task.state.gpr(x86::EAX), 5);
    assert!(!task.coroutine.is_executing());

    exec.step_task(&mut task);
    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(task.state.gpr(x86::EBX), 5);
    // Memory written before the suspension survived it.
    assert_eq!(exec.memory(mem).unwrap().read_byte(0x1200), Some(0x7E));
}

/// Conditional flow: a jne taken/not-taken pair steers by the zero flag.
#[test]
fn conditional_branch_follows_the_flags() {
    // cmp eax, 1; jne +1; hlt; (taken:) inc ebx; hlt
    let code = [
        0x83, 0xF8, 0x01, // cmp eax, 1
        0x75, 0x01, // jne +1
        0xF4, // hlt (fall-through when eax == 1)
        0x43, // inc ebx (taken when eax != 1)
        0xF4, // hlt
    ];

    // eax == 1: equal, fall through to the first hlt.
    let (mut exec, mem) = executor_with_code(&code, 0x1000);
    let mut bank = RegisterBank::zeroed();
    bank.set_gpr(x86::EAX, 1);
    let mut task = Task::new(bank, 0x1000, mem);
    exec.step_task(&mut task);
    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(task.pc, 0x1006);
    assert_eq!(task.state.gpr(x86::EBX), 0);

    // eax != 1: branch taken, ebx increments.
    let (mut exec, mem) = executor_with_code(&code, 0x1000);
    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);
    exec.step_task(&mut task);
    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(task.pc, 0x1008);
    assert_eq!(task.state.gpr(x86::EBX), 1);
}

/// Indirect jumps leave the trace and re-enter the lifter at the
/// computed pc.
#[test]
fn indirect_jump_reenters_at_the_computed_target() {
    // mov eax, 0x1100; jmp eax; ... 0x1100: hlt
    let mut code = vec![0u8; 0x200];
    code[0] = 0xB8; // mov eax, 0x1100
    code[1..5].copy_from_slice(&0x1100u32.to_le_bytes());
    code[5] = 0xFF; // jmp eax
    code[6] = 0xE0;
    code[0x100] = 0xF4; // hlt
    let (mut exec, mem) = executor_with_code(&code, 0x1000);
    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);

    exec.step_task(&mut task);

    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(task.pc, 0x1101);
    // Two traces: the jump source and the landing pad.
    assert_eq!(exec.cached_traces(), 2);
}

/// A killed address space drops its cached traces and fails its tasks
/// at the next trace boundary.
#[test]
fn killed_space_errors_its_task() {
    let (mut exec, mem) = executor_with_code(&[0x90, 0xF4], 0x1000);

    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);
    exec.step_task(&mut task);
    assert_eq!(task.status, TaskStatus::Terminated);
    assert_eq!(exec.cached_traces(), 1);

    exec.kill_memory(mem);
    assert_eq!(exec.cached_traces(), 0);

    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);
    exec.step_task(&mut task);
    assert_eq!(task.status, TaskStatus::Errored);
}

/// The step cap surfaces runaway tasks as errors.
#[test]
fn step_limit_errors_a_spinning_task() {
    use snapvm_runtime::ExecutorConfig;

    // jmp $ (tight loop)
    let code = [0xEB, 0xFE];
    let mut exec = Executor::with_config(
        Module::runtime_seed(RegisterBank::MIN_LEN),
        ExecutorConfig {
            max_steps: Some(16),
        },
    )
    .unwrap();
    let mut space = AddressSpace::new(1);
    space
        .add_map(0x1000, 0x1000, Perms::RWX, PageRangeKind::Anonymous, "code")
        .unwrap();
    space.write(0x1000, &code);
    space.consume_write_to_exec();
    let mem = exec.add_memory(space);

    let mut task = Task::new(RegisterBank::zeroed(), 0x1000, mem);
    run_to_completion(&mut exec, &mut task);
    assert_eq!(task.status, TaskStatus::Errored);
}

/// Shutdown persists lifted code; a fresh executor over the same
/// workspace starts from it.
#[test]
fn shutdown_persists_lifted_code_for_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.ensure_dirs().unwrap();

    // Seed runtime module plus a snapshot with one halting task.
    Module::runtime_seed(RegisterBank::MIN_LEN)
        .write_to(&ws.runtime_bitcode_path())
        .unwrap();
    let mut page = vec![0u8; 0x1000];
    page[0] = 0x90;
    page[1] = 0xF4;
    std::fs::write(ws.memory_path("code"), &page).unwrap();
    snapvm_runtime::snapshot::write_snapshot(
        &ws,
        &snapvm_runtime::ProgramSnapshot {
            arch: "x86".into(),
            os: "vxworks".into(),
            address_spaces: vec![snapvm_runtime::AddressSpaceRecord {
                id: 1,
                parent_id: None,
                page_ranges: vec![snapvm_runtime::PageRangeRecord {
                    base: 0x1000,
                    limit: 0x2000,
                    can_read: true,
                    can_write: true,
                    can_exec: true,
                    kind: PageRangeKind::Anonymous,
                    name: "code".into(),
                }],
            }],
            tasks: vec![snapvm_runtime::TaskRecord {
                pc: 0x1000,
                state: vec![0; RegisterBank::MIN_LEN],
                address_space_id: 1,
            }],
        },
    )
    .unwrap();

    {
        let mut exec = Executor::from_workspace(ws.clone()).unwrap();
        exec.run();
        exec.shutdown().unwrap();
    }
    assert!(ws.local_runtime_bitcode_path().exists());

    // The persisted module carries the lifted function and zeroed task
    // variables.
    let persisted = Module::read_from(&ws.local_runtime_bitcode_path()).unwrap();
    assert_eq!(persisted.functions.len(), 1);
    assert!(persisted.globals["task_0"].init.iter().all(|&b| b == 0));

    // A new executor prefers the local module: the trace is pre-lifted.
    let exec = Executor::from_workspace(ws).unwrap();
    assert_eq!(exec.module().functions.len(), 1);
}
