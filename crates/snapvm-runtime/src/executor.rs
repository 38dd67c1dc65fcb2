//! The task executor.
//!
//! Owns the IR module hosting lifted code, the address spaces, the FIFO
//! task queue, and the lifting machinery. Runs one task at a time,
//! cooperatively: suspension happens only at async-hypercall boundaries.
//! Everything the interpreter needs back from the runtime flows through
//! an explicit [`RuntimeCtx`] rather than a global.

use crate::address_space::AddressSpace;
use crate::error::RuntimeError;
use crate::interp::{read_sized, write_sized, ConcreteInterpreter, Interpreter};
use crate::snapshot;
use crate::task::{Task, TaskStatus};
use crate::workspace::Workspace;
use log::{debug, info, warn};
use snapvm_core::{GuestArch, GuestOs, RegisterBank};
use snapvm_disasm::X86Decoder;
use snapvm_ir::{MemSize, Module};
use snapvm_lift::{LiftError, TraceLifter, TraceManager};
use std::collections::VecDeque;

/// Tunables layered on top of the core contracts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorConfig {
    /// Optional per-dispatch cap on executed IR blocks; exceeding it
    /// marks the task errored.
    pub max_steps: Option<u64>,
}

/// The runtime context handed to the interpreter: lifted code, the
/// lifting machinery, and the address spaces, borrowed for one dispatch.
pub struct RuntimeCtx<'a> {
    pub module: &'a mut Module,
    pub manager: &'a mut TraceManager,
    pub lifter: &'a TraceLifter<X86Decoder>,
    pub memories: &'a mut Vec<AddressSpace>,
    pub max_steps: Option<u64>,
}

impl RuntimeCtx<'_> {
    /// Returns the lifted function for `(memory, pc)`, lifting on miss.
    /// Consumes the space's write-to-exec flag so stale cached traces
    /// are re-hashed first.
    pub fn request_func(&mut self, pc: u64, memory_index: usize) -> Result<String, LiftError> {
        let space = &mut self.memories[memory_index];
        let wrote_exec = space.consume_write_to_exec();
        let space_id = space.id();
        self.manager.get_or_lift(
            self.module,
            self.lifter,
            space_id,
            wrote_exec,
            pc,
            |addr| space.read_exec_byte(addr),
        )
    }

    /// Sized guest memory read; sizes 1/2/4/8.
    pub fn do_read(&mut self, size: u64, memory_index: usize, addr: u64) -> Option<u64> {
        let size = MemSize::from_bytes(size as u8)?;
        read_sized(self.memories.get(memory_index)?, size, addr)
    }

    /// Sized guest memory write; sizes 1/2/4/8.
    pub fn do_write(&mut self, size: u64, memory_index: usize, addr: u64, value: u64) -> bool {
        let Some(size) = MemSize::from_bytes(size as u8) else {
            warn!("invalid write size {}", size);
            return false;
        };
        match self.memories.get_mut(memory_index) {
            Some(space) => write_sized(space, size, addr, value),
            None => false,
        }
    }
}

/// The executor: task queue, memories, lifted-code module.
pub struct Executor {
    module: Module,
    manager: TraceManager,
    lifter: TraceLifter<X86Decoder>,
    interpreter: ConcreteInterpreter,
    memories: Vec<AddressSpace>,
    tasks: VecDeque<Task>,
    config: ExecutorConfig,
    task_count: usize,
    workspace: Option<Workspace>,
    shut_down: bool,
}

impl Executor {
    /// Builds an executor over a validated runtime module.
    pub fn new(module: Module) -> Result<Self, RuntimeError> {
        Self::with_config(module, ExecutorConfig::default())
    }

    pub fn with_config(module: Module, config: ExecutorConfig) -> Result<Self, RuntimeError> {
        module.validate_runtime()?;
        Ok(Self {
            module,
            manager: TraceManager::new(),
            lifter: TraceLifter::new(X86Decoder::new()),
            interpreter: ConcreteInterpreter::new(),
            memories: Vec::new(),
            tasks: VecDeque::new(),
            config,
            task_count: 0,
            workspace: None,
            shut_down: false,
        })
    }

    /// Builds an executor from a workspace: loads the runtime module
    /// (preferring a previously persisted local module so unchanged
    /// traces skip lifting), the snapshot, its address spaces, and its
    /// tasks.
    pub fn from_workspace(ws: Workspace) -> Result<Self, RuntimeError> {
        Self::from_workspace_with_config(ws, ExecutorConfig::default())
    }

    pub fn from_workspace_with_config(
        ws: Workspace,
        config: ExecutorConfig,
    ) -> Result<Self, RuntimeError> {
        let local = ws.local_runtime_bitcode_path();
        let module_path = if local.exists() {
            local
        } else {
            ws.runtime_bitcode_path()
        };
        if !module_path.exists() {
            return Err(RuntimeError::MissingRuntimeBitcode { path: module_path });
        }
        info!("loading runtime bitcode from {}", module_path.display());
        let module = Module::read_from(&module_path)?;

        let mut executor = Self::with_config(module, config)?;

        let snap = snapshot::read_snapshot(&ws)?;
        // The architecture and OS names come from the snapshot and must
        // be ones we know.
        let _arch: GuestArch = snap.arch.parse()?;
        let _os: GuestOs = snap.os.parse()?;

        let (spaces, by_id) = snapshot::load_address_spaces(&ws, &snap)?;
        executor.memories = spaces;

        for task in &snap.tasks {
            let &index = by_id.get(&task.address_space_id).ok_or(
                snapshot::SnapshotError::UnknownTaskSpace {
                    id: task.address_space_id,
                },
            )?;
            info!(
                "adding task at {:#x} in address space {}",
                task.pc, task.address_space_id
            );
            executor.add_initial_task(task.state.clone(), task.pc, index)?;
        }

        executor.workspace = Some(ws);
        Ok(executor)
    }

    /// Registers an address space, returning the index tasks use as
    /// their memory handle.
    pub fn add_memory(&mut self, space: AddressSpace) -> usize {
        self.memories.push(space);
        self.memories.len() - 1
    }

    /// The address space behind a memory index.
    pub fn memory(&mut self, index: usize) -> Option<&mut AddressSpace> {
        self.memories.get_mut(index)
    }

    /// Kills an address space and drops its cached traces. Tasks bound
    /// to it fault at their next trace boundary.
    pub fn kill_memory(&mut self, index: usize) {
        if let Some(space) = self.memories.get_mut(index) {
            let id = space.id();
            space.kill();
            self.manager.invalidate(id);
        }
    }

    /// Adds a task from snapshot state. Ensures the backing `task_<i>`
    /// global exists in the module, cloning the shape of the previous
    /// one when absent.
    pub fn add_initial_task(
        &mut self,
        state: Vec<u8>,
        pc: u64,
        memory: usize,
    ) -> Result<(), RuntimeError> {
        let bank = RegisterBank::from_bytes(state)?;
        self.ensure_task_variable(self.task_count)?;
        self.task_count += 1;
        self.tasks.push_back(Task::new(bank, pc, memory));
        Ok(())
    }

    /// Appends a task to the queue.
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    /// Removes the next runnable task.
    pub fn next_task(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// The runtime context for one dispatch.
    fn ctx(&mut self) -> RuntimeCtx<'_> {
        RuntimeCtx {
            module: &mut self.module,
            manager: &mut self.manager,
            lifter: &self.lifter,
            memories: &mut self.memories,
            max_steps: self.config.max_steps,
        }
    }

    /// Runtime callback: the lifted function for `(memory, pc)`.
    pub fn request_func(&mut self, pc: u64, memory_index: usize) -> Result<String, LiftError> {
        self.ctx().request_func(pc, memory_index)
    }

    /// Runtime callback: sized guest memory read (1/2/4/8 bytes).
    pub fn do_read(&mut self, size: u64, memory_index: usize, addr: u64) -> Option<u64> {
        self.ctx().do_read(size, memory_index, addr)
    }

    /// Runtime callback: sized guest memory write (1/2/4/8 bytes).
    pub fn do_write(&mut self, size: u64, memory_index: usize, addr: u64, value: u64) -> bool {
        self.ctx().do_write(size, memory_index, addr, value)
    }

    /// Dequeue-and-interpret until the queue drains. Paused tasks are
    /// re-enqueued and resume from their saved continuation.
    pub fn run(&mut self) {
        while let Some(mut task) = self.tasks.pop_front() {
            let mut ctx = RuntimeCtx {
                module: &mut self.module,
                manager: &mut self.manager,
                lifter: &self.lifter,
                memories: &mut self.memories,
                max_steps: self.config.max_steps,
            };
            self.interpreter.interpret(&mut task, &mut ctx);

            match task.status {
                TaskStatus::Paused => {
                    task.status = TaskStatus::Ready;
                    self.tasks.push_back(task);
                }
                TaskStatus::Terminated => {
                    debug!("task terminated at {:#x}", task.pc);
                }
                TaskStatus::Errored => {
                    warn!("task errored at {:#x}", task.pc);
                }
                status => {
                    warn!("task left the interpreter in state {:?}", status);
                }
            }
        }
    }

    /// Runs exactly one dispatch of one task and hands the task back;
    /// scenario tests use this to observe intermediate states.
    pub fn step_task(&mut self, task: &mut Task) {
        let mut ctx = RuntimeCtx {
            module: &mut self.module,
            manager: &mut self.manager,
            lifter: &self.lifter,
            memories: &mut self.memories,
            max_steps: self.config.max_steps,
        };
        self.interpreter.interpret(task, &mut ctx);
    }

    /// The lifted-code module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Number of cached lifted traces.
    pub fn cached_traces(&self) -> usize {
        self.manager.len()
    }

    /// Resets the task variables to their zero values and, when bound to
    /// a workspace, persists the module (lifted code included) so the
    /// next run starts from it.
    pub fn shutdown(&mut self) -> Result<(), RuntimeError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        for index in 0.. {
            let name = format!("task_{}", index);
            match self.module.globals.get_mut(&name) {
                Some(global) => *global = global.zeroed_like(),
                None => break,
            }
        }

        if let Some(ws) = &self.workspace {
            let path = ws.local_runtime_bitcode_path();
            info!(
                "persisting {} lifted functions to {}",
                self.module.functions.len(),
                path.display()
            );
            self.module.write_to(&path)?;
        }
        Ok(())
    }

    fn ensure_task_variable(&mut self, index: usize) -> Result<(), RuntimeError> {
        let name = format!("task_{}", index);
        if self.module.globals.contains_key(&name) {
            return Ok(());
        }
        // Task variables may not have gaps: each new one clones the
        // shape of its predecessor, and task_0 must come from the
        // runtime module itself.
        if index == 0 {
            return Err(RuntimeError::MissingTaskVariable { name });
        }
        let prev_name = format!("task_{}", index - 1);
        let prev = self
            .module
            .globals
            .get(&prev_name)
            .ok_or(RuntimeError::MissingTaskVariable { name: prev_name })?;
        let zeroed = prev.zeroed_like();
        debug!("creating task variable {}", name);
        self.module.globals.insert(name, zeroed);
        Ok(())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("executor shutdown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvm_ir::Module;

    fn executor() -> Executor {
        Executor::new(Module::runtime_seed(RegisterBank::MIN_LEN)).unwrap()
    }

    #[test]
    fn rejects_a_module_without_the_contract() {
        let module = Module::new("empty");
        assert!(Executor::new(module).is_err());
    }

    #[test]
    fn task_variables_grow_without_gaps() {
        let mut exec = executor();
        let mut space = AddressSpace::new(1);
        space
            .add_map(
                0x1000,
                0x1000,
                crate::address_space::Perms::RWX,
                crate::address_space::PageRangeKind::Anonymous,
                "code",
            )
            .unwrap();
        let mem = exec.add_memory(space);

        exec.add_initial_task(vec![0; 64], 0x1000, mem).unwrap();
        exec.add_initial_task(vec![0; 64], 0x1000, mem).unwrap();
        exec.add_initial_task(vec![0; 64], 0x1000, mem).unwrap();

        assert!(exec.module().globals.contains_key("task_0"));
        assert!(exec.module().globals.contains_key("task_1"));
        assert!(exec.module().globals.contains_key("task_2"));
    }

    #[test]
    fn short_state_blob_is_rejected() {
        let mut exec = executor();
        let mem = exec.add_memory(AddressSpace::new(1));
        assert!(exec.add_initial_task(vec![0; 8], 0x1000, mem).is_err());
    }

    #[test]
    fn sized_callbacks_reject_bad_sizes_and_bad_indexes() {
        let mut exec = executor();
        let mut space = AddressSpace::new(1);
        space
            .add_map(
                0x1000,
                0x1000,
                crate::address_space::Perms::RW,
                crate::address_space::PageRangeKind::Anonymous,
                "data",
            )
            .unwrap();
        let mem = exec.add_memory(space);

        assert!(exec.do_write(4, mem, 0x1000, 0xAABBCCDD));
        assert_eq!(exec.do_read(4, mem, 0x1000), Some(0xAABBCCDD));
        assert_eq!(exec.do_read(2, mem, 0x1002), Some(0xAABB));

        // 3-byte accesses are not a thing.
        assert_eq!(exec.do_read(3, mem, 0x1000), None);
        assert!(!exec.do_write(3, mem, 0x1000, 0));

        // Out-of-range memory index.
        assert_eq!(exec.do_read(4, 99, 0x1000), None);
        assert!(!exec.do_write(4, 99, 0x1000, 0));
    }
}
