//! The giant-switch bytecode interpreter (spec §4.3).
//!
//! The real engine templates its inner loop on two flags — whether the
//! debugger is attached, and whether an external break can ever be requested
//! — so the hot release path never pays for a breakpoint check it cannot
//! hit. Rust's const generics give us the same zero-cost specialization
//! without `#[cfg]`-ing three copies of the loop by hand: [`run`] is
//! monomorphized per `(DEBUG, NO_BREAK)` pair, and [`Vm::run`] picks the
//! instantiation at the one call site that knows which build it's in.
//!
//! Builtins and native calls are reached through [`BuiltinDispatch`] and
//! [`NativeDispatch`] rather than a direct dependency on `raya-builtins` /
//! `raya-native`, so this crate stays the bottom of the stack.

use std::sync::Arc;

use raya_bytecode::encoder::{Instruction, Operand};
use raya_bytecode::module::CompiledProgram;
use raya_bytecode::opcode::Opcode;

use crate::object::ObjectHeader;
use crate::stack::{Stack, Word, HALT_SENTINEL_PC};

/// Bytecode-level runtime faults (spec §7). These are distinct from
/// [`crate::VmError`]: a `RuntimeError` can only occur once execution has
/// actually started running instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("arithmetic trap: divide by zero")]
    DivideByZero,
    #[error("bounds violation: index {index} not in [0, {limit})")]
    IndexOutOfBounds { index: i32, limit: i32 },
    #[error("null dereference")]
    NullDereference,
    #[error("stack overflow")]
    StackOverflow,
}

impl From<crate::stack::StackError> for RuntimeError {
    fn from(e: crate::stack::StackError) -> Self {
        match e {
            crate::stack::StackError::Overflow { .. } => RuntimeError::StackOverflow,
            crate::stack::StackError::Underflow { .. } | crate::stack::StackError::OutOfRange(_) => {
                RuntimeError::NullDereference
            }
        }
    }
}

/// What a single call into the interpreter loop resolved to (spec §6 exit
/// codes, minus the ones that can only happen before a single instruction
/// runs — `NoJit`/`NoProg` are reported by [`crate::vm::context`] instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// Ran to a `Halt`/sentinel `Ret` cleanly.
    Ok,
    /// `Call`/`FCall`/`VCall` targeted a PC outside the linked program, or
    /// inside an inline switch table.
    InvalidPc,
    /// `FCallDg`/`VCall` dereferenced a null receiver.
    NullInstance,
    /// A bytecode-level fault (spec §7).
    Exception(RuntimeError),
    /// `OpcBreak` was hit: the debugger's patched-in opcode. Carries the PC
    /// so the caller can look up (and eventually restore) the patch.
    Breakpoint(u32),
    /// An external `breakExecution` request was observed between
    /// instructions (spec §5 `Break()`).
    Break,
}

/// Selects which monomorphization of [`run`] to call (spec §4.3: "templated
/// on `{debug, no_break}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecFlags {
    /// Poll `OpcBreak` patch-in-place and the step/breakpoint machinery.
    pub debug: bool,
    /// Skip the per-instruction external-break poll entirely (the embedder
    /// never calls `Break()` on this context).
    pub no_break: bool,
}

impl ExecFlags {
    pub const RELEASE: Self = Self { debug: false, no_break: true };
    pub const DEBUG: Self = Self { debug: true, no_break: false };
}

impl Default for ExecFlags {
    fn default() -> Self {
        Self::RELEASE
    }
}

/// The builtin runtime library (spec §4.4), reached by table index rather
/// than a direct dependency so `raya-core` does not know `raya-builtins`
/// exists.
pub trait BuiltinDispatch {
    /// `BCALL idx`: a free-function-shaped builtin.
    fn call(&mut self, index: u32, stack: &mut Stack, globals: &mut [u8]) -> Result<(), RuntimeError>;
    /// `BMCALL idx`: a method-shaped builtin; the receiver is already on the
    /// stack per the same convention as a script method call.
    fn call_method(&mut self, index: u32, stack: &mut Stack, globals: &mut [u8]) -> Result<(), RuntimeError>;
    /// `BCALLTRAP idx`: never raises — on failure the implementation pushes
    /// a char-pointer error message in place of the normal result itself
    /// (spec §4.4 "soft-fail" builtins, e.g. bounds-checked array access).
    fn call_trap(&mut self, index: u32, stack: &mut Stack, globals: &mut [u8]);
}

/// The native-call ABI (spec §6), reached by table index.
pub trait NativeDispatch {
    /// `NCALL idx`: a native static/free function.
    fn call_function(&mut self, index: u32, stack: &mut Stack, globals: &mut [u8]) -> Result<(), RuntimeError>;
    /// `NMCALL idx`: a native method; the receiver is already on the stack.
    fn call_method(&mut self, index: u32, stack: &mut Stack, globals: &mut [u8]) -> Result<(), RuntimeError>;
}

/// Owns the linked program the interpreter dispatches against. Does not own
/// the [`Stack`] or the global arena bytes — those are supplied per call so
/// one `Vm` can drive several concurrently executing stacks (spec §5
/// "multiple execution contexts may share one linked program").
pub struct Vm {
    program: Arc<CompiledProgram>,
}

impl Vm {
    pub fn new(program: Arc<CompiledProgram>) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &CompiledProgram {
        &self.program
    }

    /// Run starting at `start_pc` until `Halt`, a sentinel `Ret`, a fault,
    /// or (in a debug build) a breakpoint/external break.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        stack: &mut Stack,
        globals: &mut [u8],
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
        start_pc: u32,
        flags: ExecFlags,
    ) -> ExecResult {
        match (flags.debug, flags.no_break) {
            (false, _) => run::<false, true>(&self.program, stack, globals, builtins, natives, start_pc),
            (true, false) => run::<true, false>(&self.program, stack, globals, builtins, natives, start_pc),
            (true, true) => run::<true, true>(&self.program, stack, globals, builtins, natives, start_pc),
        }
    }
}

// ---- global-arena byte access (spec §4.1 global family: raw byte offsets) ----

fn g_i8(g: &[u8], off: usize) -> i32 {
    g[off] as i8 as i32
}
fn g_u8(g: &[u8], off: usize) -> i32 {
    g[off] as i32
}
fn g_i16(g: &[u8], off: usize) -> i32 {
    i16::from_le_bytes([g[off], g[off + 1]]) as i32
}
fn g_u16(g: &[u8], off: usize) -> i32 {
    u16::from_le_bytes([g[off], g[off + 1]]) as i32
}
fn g_i32(g: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(g[off..off + 4].try_into().unwrap())
}
fn g_f32(g: &[u8], off: usize) -> f32 {
    f32::from_le_bytes(g[off..off + 4].try_into().unwrap())
}
fn g_f64(g: &[u8], off: usize) -> f64 {
    f64::from_le_bytes(g[off..off + 8].try_into().unwrap())
}
fn g_u64(g: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(g[off..off + 8].try_into().unwrap())
}
fn g_set8(g: &mut [u8], off: usize, v: i32) {
    g[off] = v as u8;
}
fn g_set16(g: &mut [u8], off: usize, v: i32) {
    g[off..off + 2].copy_from_slice(&(v as u16).to_le_bytes());
}
fn g_set32(g: &mut [u8], off: usize, v: i32) {
    g[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn g_set_f32(g: &mut [u8], off: usize, v: f32) {
    g[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn g_set_f64(g: &mut [u8], off: usize, v: f64) {
    g[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
fn g_set64(g: &mut [u8], off: usize, v: u64) {
    g[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Locals live one-per-word on the stack (spec §3: "every slot is one word";
/// sub-word values are extended into it), so a local's documented *byte*
/// offset is always a multiple of the word size — convert once here rather
/// than at every `LPush*`/`LStore*` site.
fn local_word(byte_offset: u32) -> usize {
    (byte_offset as usize) / std::mem::size_of::<Word>()
}

/// `ptr + offset*scale`, as a raw byte address (spec §4.1 indirect family:
/// "scaled by `uimm24` bytes").
fn scaled_addr(ptr: Word, index: i32, scale: u32) -> u64 {
    (ptr as i64 + (index as i64) * (scale as i64)) as u64
}

fn branch_target(pc: u32, offset: i32) -> u32 {
    ((pc as i64) + 1 + (offset as i64)) as u32
}

/// `i -> u32` for `ToUi`/unsigned-destination narrowing: Rust's `as` casts
/// between float and integer types have been saturating (and NaN -> 0)
/// since 1.45, which is exactly the "well-defined on out-of-range input"
/// behavior spec §4.1 asks for — no manual clamping needed.
fn well_defined_to_u32(v: f64) -> u32 {
    v as u32
}

#[allow(clippy::too_many_arguments)]
fn run<const DEBUG: bool, const NO_BREAK: bool>(
    program: &CompiledProgram,
    stack: &mut Stack,
    globals: &mut [u8],
    builtins: &mut dyn BuiltinDispatch,
    natives: &mut dyn NativeDispatch,
    start_pc: u32,
) -> ExecResult {
    let mut pc = start_pc;
    stack.enter_nested();
    let result = loop {
        if DEBUG && !NO_BREAK && stack.break_requested() {
            break ExecResult::Break;
        }

        if pc as usize >= program.instructions.len() {
            break ExecResult::InvalidPc;
        }
        if program.is_switch_table_pc(pc) {
            break ExecResult::InvalidPc;
        }

        let word = program.fetch_instruction_word(pc);
        let instr = match Instruction::decode(word) {
            Ok(i) => i,
            Err(_) => break ExecResult::InvalidPc,
        };

        if DEBUG {
            stack.set_program_counter(pc);
        }

        macro_rules! fault {
            ($e:expr) => {
                break ExecResult::Exception($e)
            };
        }
        macro_rules! check {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => fault!(RuntimeError::from(e)),
                }
            };
        }

        let mut next_pc = pc + 1;

        match instr.opcode {
            // ---- stack manipulation & constant push ----
            Opcode::Nop => {}
            Opcode::Pop => {
                let Operand::UImm24(n) = instr.operand else { unreachable!() };
                check!(stack.pop(n as usize));
            }
            Opcode::Dup => check!(stack.dup()),
            Opcode::Swap => check!(stack.swap()),
            Opcode::PushIConst => {
                let Operand::Imm24(v) = instr.operand else { unreachable!() };
                check!(stack.push_int(v));
            }
            Opcode::PushCIConst => {
                let Operand::UImm24(idx) = instr.operand else { unreachable!() };
                let v = program.constants.get_integer(idx).unwrap_or(0);
                check!(stack.push_int(v));
            }
            Opcode::PushCFConst => {
                let Operand::UImm24(idx) = instr.operand else { unreachable!() };
                let v = program.constants.get_float(idx).unwrap_or(0.0);
                check!(stack.push_float(v));
            }
            Opcode::PushCDConst => {
                let Operand::UImm24(idx) = instr.operand else { unreachable!() };
                let v = program.constants.get_double(idx).unwrap_or(0.0);
                check!(stack.push_double(v));
            }
            Opcode::PushCLConst => {
                let Operand::UImm24(idx) = instr.operand else { unreachable!() };
                let v = program.constants.get_long(idx).unwrap_or(0);
                check!(stack.push_long(v));
            }
            Opcode::PushCStr => {
                let Operand::UImm24(idx) = instr.operand else { unreachable!() };
                let s = program.constants.get_string(idx).unwrap_or("");
                check!(stack.push_string(s.as_ptr() as Word, s.len() as Word));
            }
            Opcode::PushCName => {
                let Operand::UImm24(idx) = instr.operand else { unreachable!() };
                check!(stack.push_name(idx));
            }
            Opcode::PushFunc => {
                let Operand::Imm24(off) = instr.operand else { unreachable!() };
                let target = branch_target(pc, off);
                check!(stack.push_ptr(target as Word));
            }
            Opcode::PushRawZero => {
                let Operand::UImm24(n) = instr.operand else { unreachable!() };
                check!(stack.push_raw_zero(n as usize));
            }
            Opcode::PushRaw => {
                let Operand::UImm24(n) = instr.operand else { unreachable!() };
                check!(stack.push_raw(n as usize));
            }
            Opcode::PushStruct => {
                let Operand::Fields8x2(align, size_words) = instr.operand else { unreachable!() };
                check!(stack.push_struct(align as usize, size_words as usize * std::mem::size_of::<Word>()));
            }
            Opcode::ChkStk => {
                let Operand::UImm24(n) = instr.operand else { unreachable!() };
                check!(stack.check_headroom(n as usize));
            }

            // ---- local variable access ----
            Opcode::LPush8 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(local_word(off))) as i8 as i32;
                check!(stack.push_int(v));
            }
            Opcode::LPush8U => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(local_word(off))) as u8 as i32;
                check!(stack.push_int(v));
            }
            Opcode::LPush16 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(local_word(off))) as i16 as i32;
                check!(stack.push_int(v));
            }
            Opcode::LPush16U => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(local_word(off))) as u16 as i32;
                check!(stack.push_int(v));
            }
            Opcode::LPush32 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(local_word(off)));
                check!(stack.push_int(v));
            }
            Opcode::LPush32F => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_float(local_word(off)));
                check!(stack.push_float(v));
            }
            Opcode::LPush64D => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_double(local_word(off)));
                check!(stack.push_double(v));
            }
            Opcode::LPushPtr => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_ptr(local_word(off)));
                check!(stack.push_ptr(v));
            }
            Opcode::LPushAdr => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let addr = check!(stack.addr_of(local_word(off)));
                check!(stack.push_ptr(addr));
            }
            Opcode::LStore8 | Opcode::LStore16 | Opcode::LStore32 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(0));
                check!(stack.pop(1));
                check!(stack.set_int(local_word(off), v));
            }
            Opcode::LStore32F => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_float(0));
                check!(stack.pop(1));
                check!(stack.set_float(local_word(off), v));
            }
            Opcode::LStore64D => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_double(0));
                check!(stack.pop(1));
                check!(stack.set_double(local_word(off), v));
            }
            Opcode::LStorePtr => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                check!(stack.set_ptr(local_word(off), v));
            }
            Opcode::LPush32IConst => {
                let Operand::Field8Tail16(local_off, imm) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(local_word(local_off as u32)));
                check!(stack.push_int(v));
                check!(stack.push_int(imm as i16 as i32));
            }

            // ---- global data arena access ----
            Opcode::GLoad8 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                check!(stack.push_int(g_i8(globals, off as usize)));
            }
            Opcode::GLoad8U => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                check!(stack.push_int(g_u8(globals, off as usize)));
            }
            Opcode::GLoad16 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                check!(stack.push_int(g_i16(globals, off as usize)));
            }
            Opcode::GLoad16U => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                check!(stack.push_int(g_u16(globals, off as usize)));
            }
            Opcode::GLoad32 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                check!(stack.push_int(g_i32(globals, off as usize)));
            }
            Opcode::GLoad32F => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                check!(stack.push_float(g_f32(globals, off as usize)));
            }
            Opcode::GLoad64D => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                check!(stack.push_double(g_f64(globals, off as usize)));
            }
            Opcode::GLoadPtr => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                check!(stack.push_ptr(g_u64(globals, off as usize)));
            }
            Opcode::GLoadAdr => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let addr = unsafe { globals.as_mut_ptr().add(off as usize) } as Word;
                check!(stack.push_ptr(addr));
            }
            Opcode::GStore8 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(0));
                check!(stack.pop(1));
                g_set8(globals, off as usize, v);
            }
            Opcode::GStore16 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(0));
                check!(stack.pop(1));
                g_set16(globals, off as usize, v);
            }
            Opcode::GStore32 => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(0));
                check!(stack.pop(1));
                g_set32(globals, off as usize, v);
            }
            Opcode::GStore32F => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_float(0));
                check!(stack.pop(1));
                g_set_f32(globals, off as usize, v);
            }
            Opcode::GStore64D => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_double(0));
                check!(stack.pop(1));
                g_set_f64(globals, off as usize, v);
            }
            Opcode::GStorePtr => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                g_set64(globals, off as usize, v);
            }
            Opcode::LMove32 => {
                let Operand::Fields8x2(dst, src) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(local_word(src as u32)));
                check!(stack.set_int(local_word(dst as u32), v));
            }

            // ---- indirect (pointer-relative) access ----
            Opcode::PLoad8 | Opcode::PLoad8U | Opcode::PLoad16 | Opcode::PLoad16U | Opcode::PLoad32
            | Opcode::PLoad32F | Opcode::PLoad64D | Opcode::PLoadPtr => {
                let Operand::UImm24(scale) = instr.operand else { unreachable!() };
                let index = check!(stack.get_int(0));
                let ptr = check!(stack.get_ptr(1));
                check!(stack.pop(2));
                if ptr == 0 {
                    fault!(RuntimeError::NullDereference);
                }
                let addr = scaled_addr(ptr, index, scale) as *const u8;
                unsafe {
                    match instr.opcode {
                        Opcode::PLoad8 => check!(stack.push_int(addr.read() as i8 as i32)),
                        Opcode::PLoad8U => check!(stack.push_int(addr.read() as i32)),
                        Opcode::PLoad16 => {
                            check!(stack.push_int((addr as *const i16).read_unaligned() as i32))
                        }
                        Opcode::PLoad16U => {
                            check!(stack.push_int((addr as *const u16).read_unaligned() as i32))
                        }
                        Opcode::PLoad32 => {
                            check!(stack.push_int((addr as *const i32).read_unaligned()))
                        }
                        Opcode::PLoad32F => {
                            check!(stack.push_float((addr as *const f32).read_unaligned()))
                        }
                        Opcode::PLoad64D => {
                            check!(stack.push_double((addr as *const f64).read_unaligned()))
                        }
                        Opcode::PLoadPtr => {
                            check!(stack.push_ptr((addr as *const u64).read_unaligned()))
                        }
                        _ => unreachable!(),
                    }
                }
            }
            Opcode::PLoad32Imm => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let ptr = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                if ptr == 0 {
                    fault!(RuntimeError::NullDereference);
                }
                let addr = (ptr + off as u64) as *const i32;
                check!(stack.push_int(unsafe { addr.read_unaligned() }));
            }
            Opcode::PStore32Imm => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let ptr = check!(stack.get_ptr(0));
                let v = check!(stack.get_int(1));
                check!(stack.pop(2));
                if ptr == 0 {
                    fault!(RuntimeError::NullDereference);
                }
                let addr = (ptr + off as u64) as *mut i32;
                unsafe { addr.write_unaligned(v) };
            }
            Opcode::PStorePtrImm => {
                let Operand::UImm24(off) = instr.operand else { unreachable!() };
                let ptr = check!(stack.get_ptr(0));
                let v = check!(stack.get_ptr(1));
                check!(stack.pop(2));
                if ptr == 0 {
                    fault!(RuntimeError::NullDereference);
                }
                let addr = (ptr + off as u64) as *mut u64;
                unsafe { addr.write_unaligned(v) };
            }
            Opcode::PIncPre => {
                let Operand::Imm24(delta) = instr.operand else { unreachable!() };
                let ptr = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                if ptr == 0 {
                    fault!(RuntimeError::NullDereference);
                }
                let addr = ptr as *mut i32;
                let new_val = unsafe { addr.read_unaligned() } + delta;
                unsafe { addr.write_unaligned(new_val) };
                check!(stack.push_int(new_val));
            }
            Opcode::PIncPost => {
                let Operand::Imm24(delta) = instr.operand else { unreachable!() };
                let ptr = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                if ptr == 0 {
                    fault!(RuntimeError::NullDereference);
                }
                let addr = ptr as *mut i32;
                let old_val = unsafe { addr.read_unaligned() };
                unsafe { addr.write_unaligned(old_val + delta) };
                check!(stack.push_int(old_val));
            }
            Opcode::LAAdd => {
                let Operand::UImm24(local_off) = instr.operand else { unreachable!() };
                let base = check!(stack.get_ptr(local_word(local_off)));
                let ptr = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                check!(stack.push_ptr(ptr.wrapping_add(base)));
            }
            Opcode::RangeIConst => {
                let Operand::UImm24(limit) = instr.operand else { unreachable!() };
                let idx = check!(stack.get_int(0));
                if idx < 0 || idx as u32 >= limit {
                    fault!(RuntimeError::IndexOutOfBounds { index: idx, limit: limit as i32 });
                }
            }
            Opcode::Range => {
                let idx = check!(stack.get_int(0));
                let limit = check!(stack.get_int(1));
                check!(stack.pop(2));
                if idx < 0 || idx >= limit {
                    fault!(RuntimeError::IndexOutOfBounds { index: idx, limit });
                }
                check!(stack.push_int(idx));
            }

            // ---- arithmetic / bitwise ----
            Opcode::Iadd => binop_i(stack, |a, b| a.wrapping_add(b), |e| fault!(e)),
            Opcode::Isub => binop_i(stack, |a, b| a.wrapping_sub(b), |e| fault!(e)),
            Opcode::Imul => binop_i(stack, |a, b| a.wrapping_mul(b), |e| fault!(e)),
            Opcode::Idiv => {
                let b = check!(stack.get_int(0));
                let a = check!(stack.get_int(1));
                check!(stack.pop(2));
                if b == 0 {
                    fault!(RuntimeError::DivideByZero);
                }
                check!(stack.push_int(a.wrapping_div(b)));
            }
            Opcode::Imod => {
                let b = check!(stack.get_int(0));
                let a = check!(stack.get_int(1));
                check!(stack.pop(2));
                if b == 0 {
                    fault!(RuntimeError::DivideByZero);
                }
                check!(stack.push_int(a.wrapping_rem(b)));
            }
            Opcode::Ineg => {
                let a = check!(stack.get_int(0));
                check!(stack.set_int(0, a.wrapping_neg()));
            }
            Opcode::Iand => binop_i(stack, |a, b| a & b, |e| fault!(e)),
            Opcode::Ior => binop_i(stack, |a, b| a | b, |e| fault!(e)),
            Opcode::Ixor => binop_i(stack, |a, b| a ^ b, |e| fault!(e)),
            Opcode::Inot => {
                let a = check!(stack.get_int(0));
                check!(stack.set_int(0, !a));
            }
            Opcode::Ishl => binop_i(stack, |a, b| a.wrapping_shl(b as u32), |e| fault!(e)),
            Opcode::Ishr => binop_i(stack, |a, b| a.wrapping_shr(b as u32), |e| fault!(e)),
            Opcode::Ushr => {
                binop_i(stack, |a, b| (a as u32).wrapping_shr(b as u32) as i32, |e| fault!(e))
            }
            Opcode::IaddIConst => {
                let Operand::Imm24(imm) = instr.operand else { unreachable!() };
                let a = check!(stack.get_int(0));
                check!(stack.set_int(0, a.wrapping_add(imm)));
            }
            Opcode::LIaddIConst => {
                let Operand::Field8Tail16(local_off, imm) = instr.operand else { unreachable!() };
                let a = check!(stack.get_int(local_word(local_off as u32)));
                check!(stack.push_int(a.wrapping_add(imm as i16 as i32)));
            }
            Opcode::Fadd => binop_f(stack, |a, b| a + b, |e| fault!(e)),
            Opcode::Fsub => binop_f(stack, |a, b| a - b, |e| fault!(e)),
            Opcode::Fmul => binop_f(stack, |a, b| a * b, |e| fault!(e)),
            Opcode::Fdiv => binop_f(stack, |a, b| a / b, |e| fault!(e)),
            Opcode::Fneg => {
                let a = check!(stack.get_float(0));
                check!(stack.set_float(0, -a));
            }
            Opcode::Dadd => binop_d(stack, |a, b| a + b, |e| fault!(e)),
            Opcode::Dsub => binop_d(stack, |a, b| a - b, |e| fault!(e)),
            Opcode::Dmul => binop_d(stack, |a, b| a * b, |e| fault!(e)),
            Opcode::Ddiv => binop_d(stack, |a, b| a / b, |e| fault!(e)),
            Opcode::Dneg => {
                let a = check!(stack.get_double(0));
                check!(stack.set_double(0, -a));
            }
            Opcode::Itof => {
                let a = check!(stack.get_int(0));
                check!(stack.set_float(0, a as f32));
            }
            Opcode::Itod => {
                let a = check!(stack.get_int(0));
                check!(stack.pop(1));
                check!(stack.push_double(a as f64));
            }
            Opcode::Ftoi => {
                let a = check!(stack.get_float(0));
                check!(stack.set_int(0, a as i32));
            }
            Opcode::Dtoi => {
                let a = check!(stack.get_double(0));
                check!(stack.pop(1));
                check!(stack.push_int(a as i32));
            }
            Opcode::Ftod => {
                let a = check!(stack.get_float(0));
                check!(stack.pop(1));
                check!(stack.push_double(a as f64));
            }
            Opcode::Dtof => {
                let a = check!(stack.get_double(0));
                check!(stack.pop(1));
                check!(stack.push_float(a as f32));
            }
            Opcode::ToUi => {
                let a = check!(stack.get_double(0));
                check!(stack.pop(1));
                check!(stack.push_int(well_defined_to_u32(a) as i32));
            }

            // ---- comparisons (+ fused compare-and-branch) ----
            Opcode::Ieq => cmp_i(stack, |a, b| a == b, |e| fault!(e)),
            Opcode::Ine => cmp_i(stack, |a, b| a != b, |e| fault!(e)),
            Opcode::Ilt => cmp_i(stack, |a, b| a < b, |e| fault!(e)),
            Opcode::Ile => cmp_i(stack, |a, b| a <= b, |e| fault!(e)),
            Opcode::Igt => cmp_i(stack, |a, b| a > b, |e| fault!(e)),
            Opcode::Ige => cmp_i(stack, |a, b| a >= b, |e| fault!(e)),
            // `F*` compares at double width: Rust's `==`/`<`/... on `f64`
            // already implement "unordered is false except `!=`" for NaN,
            // so no special-casing is needed here.
            Opcode::Feq => cmp_d(stack, |a, b| a == b, |e| fault!(e)),
            Opcode::Fne => cmp_d(stack, |a, b| a != b, |e| fault!(e)),
            Opcode::Flt => cmp_d(stack, |a, b| a < b, |e| fault!(e)),
            Opcode::Fle => cmp_d(stack, |a, b| a <= b, |e| fault!(e)),
            Opcode::Fgt => cmp_d(stack, |a, b| a > b, |e| fault!(e)),
            Opcode::Fge => cmp_d(stack, |a, b| a >= b, |e| fault!(e)),
            Opcode::IBeq | Opcode::IBne | Opcode::IBlt | Opcode::IBge => {
                let Operand::BranchOffset(off) = instr.operand else { unreachable!() };
                let b = check!(stack.get_int(0));
                let a = check!(stack.get_int(1));
                check!(stack.pop(2));
                let take = match instr.opcode {
                    Opcode::IBeq => a == b,
                    Opcode::IBne => a != b,
                    Opcode::IBlt => a < b,
                    Opcode::IBge => a >= b,
                    _ => unreachable!(),
                };
                if take {
                    next_pc = branch_target(pc, off);
                }
            }

            // ---- branches ----
            Opcode::Br => {
                let Operand::BranchOffset(off) = instr.operand else { unreachable!() };
                next_pc = branch_target(pc, off);
            }
            Opcode::IBzP | Opcode::IBnzP => {
                let Operand::BranchOffset(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(0));
                check!(stack.pop(1));
                let take = (v == 0) == matches!(instr.opcode, Opcode::IBzP);
                if take {
                    next_pc = branch_target(pc, off);
                }
            }
            Opcode::FBzP | Opcode::FBnzP => {
                let Operand::BranchOffset(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_float(0));
                check!(stack.pop(1));
                let take = (v == 0.0) == matches!(instr.opcode, Opcode::FBzP);
                if take {
                    next_pc = branch_target(pc, off);
                }
            }
            Opcode::DBzP | Opcode::DBnzP => {
                let Operand::BranchOffset(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_double(0));
                check!(stack.pop(1));
                let take = (v == 0.0) == matches!(instr.opcode, Opcode::DBzP);
                if take {
                    next_pc = branch_target(pc, off);
                }
            }
            Opcode::IBz | Opcode::IBnz => {
                let Operand::BranchOffset(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_int(0));
                let zero_branches = matches!(instr.opcode, Opcode::IBz);
                if (v == 0) == zero_branches {
                    next_pc = branch_target(pc, off);
                } else {
                    check!(stack.pop(1));
                }
            }
            Opcode::PBzP | Opcode::PBnzP => {
                let Operand::BranchOffset(off) = instr.operand else { unreachable!() };
                let v = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                let take = (v == 0) == matches!(instr.opcode, Opcode::PBzP);
                if take {
                    next_pc = branch_target(pc, off);
                }
            }

            // ---- `this` discipline ----
            Opcode::LoadThis => {
                let new_this = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                let old = stack.this_ptr();
                check!(stack.push_ptr(old));
                stack.set_this_ptr(new_this);
            }
            Opcode::LoadThisImm => {
                let new_this = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                stack.set_this_ptr(new_this);
            }
            Opcode::PushThis | Opcode::PushThisTemp => {
                check!(stack.push_ptr(stack.this_ptr()));
            }
            Opcode::PopThis => {
                let saved = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                stack.set_this_ptr(saved);
            }

            // ---- function invocation ----
            Opcode::Call => {
                let Operand::Imm24(off) = instr.operand else { unreachable!() };
                let target = branch_target(pc, off);
                check!(stack.push_ptr(next_pc as Word));
                next_pc = target;
            }
            Opcode::FCall => {
                let target = check!(stack.get_ptr(0));
                check!(stack.pop(1));
                check!(stack.push_ptr(next_pc as Word));
                next_pc = target as u32;
            }
            Opcode::FCallDg => {
                let target_word = check!(stack.get_ptr(0));
                let instance = check!(stack.get_ptr(1));
                check!(stack.pop(2));
                if instance == 0 {
                    break ExecResult::NullInstance;
                }
                let delegate = crate::object::Delegate { instance_ptr: instance, target: target_word };
                let entry = if let Some(index) = delegate.vtable_index() {
                    let vtbl_off = unsafe { (instance as *const ObjectHeader).read() }.script_vtbl;
                    g_u64(globals, vtbl_off as usize + (index as usize) * 8) as u32
                } else {
                    delegate.code_pointer().unwrap_or(0) as u32
                };
                check!(stack.push_ptr(next_pc as Word));
                stack.set_this_ptr(instance);
                next_pc = entry;
            }
            Opcode::VCall => {
                let Operand::UImm24(index) = instr.operand else { unreachable!() };
                let receiver = check!(stack.get_ptr(0));
                if receiver == 0 {
                    break ExecResult::NullInstance;
                }
                let vtbl_off = unsafe { (receiver as *const ObjectHeader).read() }.script_vtbl;
                let entry = g_u64(globals, vtbl_off as usize + (index as usize) * 8) as u32;
                check!(stack.push_ptr(next_pc as Word));
                next_pc = entry;
            }
            Opcode::NCall => {
                let Operand::UImm24(index) = instr.operand else { unreachable!() };
                stack.publish_top();
                let r = natives.call_function(index, stack, globals);
                stack.reload_top();
                if let Err(e) = r {
                    fault!(e);
                }
            }
            Opcode::NMCall => {
                let Operand::UImm24(index) = instr.operand else { unreachable!() };
                stack.publish_top();
                let r = natives.call_method(index, stack, globals);
                stack.reload_top();
                if let Err(e) = r {
                    fault!(e);
                }
            }
            Opcode::Ret => {
                let Operand::UImm24(extra) = instr.operand else { unreachable!() };
                let retaddr = check!(stack.get_ptr(0));
                check!(stack.pop(1 + extra as usize));
                if retaddr as u32 == HALT_SENTINEL_PC {
                    break ExecResult::Ok;
                }
                next_pc = retaddr as u32;
            }
            Opcode::Halt => break ExecResult::Ok,

            // ---- switch / builtin call family ----
            Opcode::Switch => {
                let Operand::SwitchRange(range) = instr.operand else { unreachable!() };
                let idx = check!(stack.get_int(0)) as u32;
                check!(stack.pop(1));
                let table_start = pc + 1;
                let table_end = table_start + range + 1;
                let slot = if idx < range { table_start + idx } else { table_end - 1 };
                let offset = program.instructions[slot as usize] as i32;
                next_pc = branch_target(table_end - 1, offset);
            }
            Opcode::BCall => {
                let Operand::BuiltinIndex(index) = instr.operand else { unreachable!() };
                if let Err(e) = builtins.call(index, stack, globals) {
                    fault!(e);
                }
            }
            Opcode::BMCall => {
                let Operand::BuiltinIndex(index) = instr.operand else { unreachable!() };
                if let Err(e) = builtins.call_method(index, stack, globals) {
                    fault!(e);
                }
            }
            Opcode::BCallTrap => {
                let Operand::BuiltinIndex(index) = instr.operand else { unreachable!() };
                builtins.call_trap(index, stack, globals);
            }

            Opcode::OpcBreak => {
                if DEBUG {
                    break ExecResult::Breakpoint(pc);
                }
                // Should never be emitted outside a debug session; treat as
                // a no-op rather than silently skipping the debugger hook.
            }
        }

        pc = next_pc;
    };
    stack.exit_nested();
    result
}

fn binop_i(stack: &mut Stack, f: impl FnOnce(i32, i32) -> i32, on_err: impl FnOnce(RuntimeError)) {
    let b = match stack.get_int(0) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    let a = match stack.get_int(1) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    if let Err(e) = stack.pop(2) {
        return on_err(e.into());
    }
    if let Err(e) = stack.push_int(f(a, b)) {
        on_err(e.into());
    }
}

fn binop_f(stack: &mut Stack, f: impl FnOnce(f32, f32) -> f32, on_err: impl FnOnce(RuntimeError)) {
    let b = match stack.get_float(0) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    let a = match stack.get_float(1) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    if let Err(e) = stack.pop(2) {
        return on_err(e.into());
    }
    if let Err(e) = stack.push_float(f(a, b)) {
        on_err(e.into());
    }
}

fn binop_d(stack: &mut Stack, f: impl FnOnce(f64, f64) -> f64, on_err: impl FnOnce(RuntimeError)) {
    let b = match stack.get_double(0) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    let a = match stack.get_double(1) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    if let Err(e) = stack.pop(2) {
        return on_err(e.into());
    }
    if let Err(e) = stack.push_double(f(a, b)) {
        on_err(e.into());
    }
}

fn cmp_i(stack: &mut Stack, f: impl FnOnce(i32, i32) -> bool, on_err: impl FnOnce(RuntimeError)) {
    let b = match stack.get_int(0) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    let a = match stack.get_int(1) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    if let Err(e) = stack.pop(2) {
        return on_err(e.into());
    }
    if let Err(e) = stack.push_int(f(a, b) as i32) {
        on_err(e.into());
    }
}

fn cmp_d(stack: &mut Stack, f: impl FnOnce(f64, f64) -> bool, on_err: impl FnOnce(RuntimeError)) {
    let b = match stack.get_double(0) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    let a = match stack.get_double(1) {
        Ok(v) => v,
        Err(e) => return on_err(e.into()),
    };
    if let Err(e) = stack.pop(2) {
        return on_err(e.into());
    }
    if let Err(e) = stack.push_int(f(a, b) as i32) {
        on_err(e.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raya_bytecode::module::{FuncMapEntry, FunctionDef};

    struct NoBuiltins;
    impl BuiltinDispatch for NoBuiltins {
        fn call(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn call_method(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn call_trap(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) {}
    }
    struct NoNatives;
    impl NativeDispatch for NoNatives {
        fn call_function(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn call_method(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn make_vm(program: CompiledProgram) -> (Vm, Stack) {
        (Vm::new(Arc::new(program)), Stack::new(64))
    }

    #[test]
    fn adds_two_constants_and_halts() {
        let mut p = CompiledProgram::new("t");
        let c3 = p.constants.add_integer(3);
        let c4 = p.constants.add_integer(4);
        p.instructions.push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(c3)).encode());
        p.instructions.push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(c4)).encode());
        p.instructions.push(Instruction::new(Opcode::Iadd, Operand::None).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
        p.functions.push(FunctionDef { name: "main".into(), entry_pc: 0, param_count: 0, local_count: 0, is_method: false });
        p.func_map.push(FuncMapEntry { pc: 0, function_index: 0 });

        let (vm, mut stack) = make_vm(p);
        let mut globals = Vec::new();
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(stack.get_int(0).unwrap(), 7);
    }

    #[test]
    fn division_by_zero_traps() {
        let mut p = CompiledProgram::new("t");
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(1)).encode());
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(0)).encode());
        p.instructions.push(Instruction::new(Opcode::Idiv, Operand::None).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());

        let (vm, mut stack) = make_vm(p);
        let mut globals = Vec::new();
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Exception(RuntimeError::DivideByZero));
    }

    #[test]
    fn unconditional_branch_skips_instructions() {
        let mut p = CompiledProgram::new("t");
        p.instructions.push(Instruction::new(Opcode::Br, Operand::BranchOffset(1)).encode());
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(999)).encode());
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(5)).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());

        let (vm, mut stack) = make_vm(p);
        let mut globals = Vec::new();
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(stack.get_int(0).unwrap(), 5);
    }

    #[test]
    fn fused_compare_and_branch_takes_the_jump() {
        let mut p = CompiledProgram::new("t");
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(2)).encode());
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(2)).encode());
        p.instructions.push(Instruction::new(Opcode::IBeq, Operand::BranchOffset(1)).encode());
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(0)).encode());
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(1)).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());

        let (vm, mut stack) = make_vm(p);
        let mut globals = Vec::new();
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(stack.get_int(0).unwrap(), 1);
    }

    #[test]
    fn nan_compares_false_except_not_equal() {
        let mut p = CompiledProgram::new("t");
        let nan = p.constants.add_double(f64::NAN);
        let one = p.constants.add_double(1.0);
        p.instructions.push(Instruction::new(Opcode::PushCDConst, Operand::UImm24(nan)).encode());
        p.instructions.push(Instruction::new(Opcode::PushCDConst, Operand::UImm24(one)).encode());
        p.instructions.push(Instruction::new(Opcode::Feq, Operand::None).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());

        let (vm, mut stack) = make_vm(p);
        let mut globals = Vec::new();
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(stack.get_int(0).unwrap(), 0);
    }

    #[test]
    fn global_store_and_load_roundtrip() {
        let mut p = CompiledProgram::new("t");
        p.global_arena.allocate("counter", 4, 4);
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(42)).encode());
        p.instructions.push(Instruction::new(Opcode::GStore32, Operand::UImm24(0)).encode());
        p.instructions.push(Instruction::new(Opcode::GLoad32, Operand::UImm24(0)).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());

        let (vm, mut stack) = make_vm(p);
        let mut globals = vec![0u8; 4];
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(stack.get_int(0).unwrap(), 42);
    }

    #[test]
    fn local_store_and_push_roundtrip() {
        let mut p = CompiledProgram::new("t");
        p.instructions.push(Instruction::new(Opcode::PushRawZero, Operand::UImm24(1)).encode());
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(13)).encode());
        p.instructions.push(Instruction::new(Opcode::LStore32, Operand::UImm24(8)).encode());
        p.instructions.push(Instruction::new(Opcode::LPush32, Operand::UImm24(0)).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());

        let (vm, mut stack) = make_vm(p);
        let mut globals = Vec::new();
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(stack.get_int(0).unwrap(), 13);
    }

    #[test]
    fn call_and_ret_restores_caller_pc() {
        let mut p = CompiledProgram::new("t");
        p.instructions.push(Instruction::new(Opcode::Call, Operand::Imm24(2)).encode()); // pc0: target pc3
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode()); // pc1
        p.instructions.push(Instruction::new(Opcode::Nop, Operand::None).encode()); // pc2 filler
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(77)).encode()); // pc3
        p.instructions.push(Instruction::new(Opcode::Swap, Operand::None).encode()); // pc4
        p.instructions.push(Instruction::new(Opcode::Ret, Operand::UImm24(0)).encode()); // pc5

        let (vm, mut stack) = make_vm(p);
        let mut globals = Vec::new();
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(stack.get_int(0).unwrap(), 77);
    }

    #[test]
    fn switch_dispatches_to_the_matching_case() {
        let mut p = CompiledProgram::new("t");
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(1)).encode()); // pc0: index = 1
        p.instructions.push(Instruction::new(Opcode::Switch, Operand::SwitchRange(2)).encode()); // pc1
        p.instructions.push(0); // pc2: case 0 offset (unused)
        p.instructions.push(0); // pc3: case 1 offset -> branch_target(table_end - 1, 0) == pc5
        p.instructions.push(0); // pc4: default offset (unused)
        p.switch_ranges.push(raya_bytecode::module::SwitchTableRange { table_start: 2, table_end: 5 });
        p.instructions.push(Instruction::new(Opcode::PushIConst, Operand::Imm24(111)).encode()); // pc5
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode()); // pc6

        let (vm, mut stack) = make_vm(p);
        let mut globals = Vec::new();
        let result = vm.run(&mut stack, &mut globals, &mut NoBuiltins, &mut NoNatives, 0, ExecFlags::RELEASE);
        assert_eq!(result, ExecResult::Ok);
        assert_eq!(stack.get_int(0).unwrap(), 111);
    }
}
