//! The Raya execution core: the stack-based bytecode interpreter, object
//! header/vtable layout, and execution context that a host embeds.
//!
//! What lives here versus its collaborators:
//! - The front-end compiler that *produces* a [`raya_bytecode::CompiledProgram`]
//!   is out of scope; this crate only consumes one.
//! - The builtin runtime library (strings, 64-bit emulation, refcount
//!   primitives, object construction) lives in `raya-builtins` and is
//!   reached through the [`vm::interpreter::BuiltinDispatch`] trait so this
//!   crate never depends on it directly.
//! - Native host functions are reached through [`vm::interpreter::NativeDispatch`].
//! - The x86/x64 JIT lives in `raya-jit` and is reached through
//!   [`vm::context::JitEngine`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]

pub mod abi;
pub mod debug;
pub mod object;
pub mod stack;
pub mod vm;

pub use abi::{FromStack, NativeFn, NativeRegistry, ToStack};
pub use object::{Delegate, ObjectHeader, RawObjectPtr};
pub use stack::{Stack, StackError, Word};
pub use vm::context::{ContextOptions, ExecutionContext};
pub use vm::interpreter::{ExecFlags, ExecResult, RuntimeError, Vm};

/// Errors surfaced at API boundaries that are not themselves one of the
/// bytecode-level runtime error kinds (spec §7) — configuration and linkage
/// mistakes a host makes before ever running a single instruction.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The program has not been linked, or a `CALL` targets an unlinked PC.
    #[error("no program loaded")]
    NoProgram,

    /// A named function/method does not exist in the linked program.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// A stack operation failed (overflow, underflow, out-of-range offset).
    #[error(transparent)]
    Stack(#[from] stack::StackError),

    /// A bytecode-level runtime error occurred during execution.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Convenience alias for fallible core operations.
pub type VmResult<T> = Result<T, VmError>;
