//! # snapvm-runtime
//!
//! The execution substrate: paged guest address spaces with
//! copy-on-write cloning and write-to-executable detection, snapshot
//! loading and saving, the cooperative task executor, the concrete IR
//! interpreter, and the pause/resume coroutine mechanism.

pub mod address_space;
pub mod coroutine;
pub mod error;
pub mod executor;
pub mod interp;
pub mod snapshot;
pub mod task;
pub mod workspace;

pub use address_space::{AddressSpace, AddressSpaceError, MemoryMap, PageRangeKind, Perms};
pub use coroutine::Coroutine;
pub use error::RuntimeError;
pub use executor::{Executor, ExecutorConfig, RuntimeCtx};
pub use interp::{ConcreteInterpreter, GuestFault, Interpreter, TraceExit};
pub use snapshot::{
    AddressSpaceRecord, PageRangeRecord, ProgramSnapshot, SnapshotError, TaskRecord,
};
pub use task::{Task, TaskStatus};
pub use workspace::Workspace;
