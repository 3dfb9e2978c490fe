//! Raya VM bytecode definitions.
//!
//! This crate owns the 32-bit instruction encoding, the per-program
//! constant pool and global data arena, the linked `CompiledProgram` format
//! the execution core consumes, a structural bytecode verifier, and a
//! disassembler. It does not produce bytecode (the front-end compiler that
//! does is out of scope, per spec §1) — only consume and describe it.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod constants;
pub mod disasm;
pub mod encoder;
pub mod module;
pub mod opcode;
pub mod verify;

pub use constants::{ConstantPool, GlobalArena, GlobalSlot};
pub use disasm::disassemble;
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError, Instruction, Operand};
pub use module::{
    CompiledProgram, DataType, DataTypeTag, FuncMapEntry, FunctionDef, LineEntry, LinkOptions,
    MemberDef, Metadata, MethodSlot, ModuleError, NativeClassDescriptor, NativeFunctionSig,
    SwitchTableRange, VtblRegion,
};
pub use opcode::{Opcode, OperandLayout};
pub use verify::{verify_program, VerifyError};
