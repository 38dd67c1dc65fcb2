//! # snapvm-ir
//!
//! The register-transfer IR that lifted guest traces are expressed in.
//! A [`Module`] holds lifted [`Function`]s, the globals backing task
//! state slots, and declarations of the runtime intrinsics that lifted
//! code tail-calls at trace boundaries. Modules persist to disk
//! (`runtime.bc` / `runtime.local.bc`) in bincode form so later runs can
//! skip lifting of unchanged traces.

pub mod builder;
pub mod function;
pub mod module;
pub mod op;
pub mod opt;
pub mod verify;

pub use builder::FunctionBuilder;
pub use function::{Block, Function, Terminator};
pub use module::{lifted_function_name, Global, Module, ModuleError};
pub use op::{BankReg, BinOp, Intrinsic, MemSize, Op, Src, TempId, UnOp, Width};
pub use verify::{verify, VerifyError};
