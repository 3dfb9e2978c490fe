//! Virtual machine execution and context management.

pub mod context;
pub mod interpreter;

pub use context::{ContextOptions, ExecutionContext, JitEngine};
pub use interpreter::{BuiltinDispatch, ExecFlags, ExecResult, NativeDispatch, RuntimeError, Vm};
