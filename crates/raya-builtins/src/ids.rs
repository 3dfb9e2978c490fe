//! Builtin index assignments (spec §4.4). Not part of the wire format: a
//! linked [`raya_bytecode::module::CompiledProgram`] carries `BCALL`/
//! `BMCALL`/`BCALL_TRAP` instructions whose operand is already the index a
//! front-end compiler baked in; this table is simply *our* side of that
//! in-process convention, mirroring how `raya_core::vm::context::builtin_ids`
//! fixes 0-8 for the object/array family the host calls directly.

pub use raya_core::vm::context::builtin_ids::{
    ARRAY_CLEAR, ARRAY_ERASE, ARRAY_ERASE_FAST, ARRAY_INSERT, ARRAY_POP, ARRAY_PUSH,
    ARRAY_RESERVE, ARRAY_RESIZE, NEW_DYNAMIC,
};

// ---- 64-bit integer emulation (spec §4.4 "64-bit on 32-bit") ----
pub const LONG_ADD: u32 = 9;
pub const LONG_SUB: u32 = 10;
pub const LONG_MUL: u32 = 11;
pub const LONG_DIV: u32 = 12;
pub const LONG_MOD: u32 = 13;
pub const LONG_CMP: u32 = 14;
pub const LONG_NEG: u32 = 15;
pub const LONG_LOAD: u32 = 16;
pub const LONG_STORE: u32 = 17;
pub const LONG_TO_INT: u32 = 18;
pub const INT_TO_LONG: u32 = 19;
/// Trap variants, routed through `BCALL_TRAP` rather than `BCALL`.
pub const LONG_DIV_TRAP: u32 = 20;
pub const LONG_MOD_TRAP: u32 = 21;

// ---- string value semantics ----
pub const STRING_LOAD: u32 = 22;
pub const STRING_STORE: u32 = 23;
pub const STRING_CLEANUP: u32 = 24;
pub const STRING_APPEND: u32 = 25;
pub const STRING_COMPARE: u32 = 26;
pub const INT_TO_STRING: u32 = 27;
pub const FLOAT_TO_STRING: u32 = 28;
pub const DOUBLE_TO_STRING: u32 = 29;

// ---- smart-pointer refcount primitives (spec §4.4) ----
pub const ADD_STRONG: u32 = 30;
pub const DEC_STRONG: u32 = 31;
pub const STRONG_ZERO: u32 = 32;
pub const ADD_WEAK: u32 = 33;
pub const DEC_WEAK: u32 = 34;
pub const FIX_WEAK: u32 = 35;
pub const ADD_STRONG_AFTER_NEW: u32 = 36;
pub const ISA: u32 = 37;

// ---- bit intrinsics ----
pub const BSF32: u32 = 38;
pub const BSR32: u32 = 39;
pub const POPCNT32: u32 = 40;
pub const BSWAP32: u32 = 41;
pub const BSF64: u32 = 42;
pub const BSR64: u32 = 43;
pub const POPCNT64: u32 = 44;
pub const BSWAP64: u32 = 45;

// ---- misc ----
pub const DELEGATE_EQ: u32 = 46;
pub const SET_STATE_LABEL: u32 = 47;
pub const PROFILE_ENTER: u32 = 48;
pub const PROFILE_EXIT: u32 = 49;
