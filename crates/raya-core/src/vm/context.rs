//! The execution context a host embeds (spec §4.7): one [`Stack`], one
//! [`Vm`], an optional shared JIT, and every publicly callable entry point a
//! host drives a script through. Also owns the debug-break state (§4.8) and
//! the concurrency discipline of §5 ("the context carries a recursive
//! mutex; all public entry points lock it").

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use raya_bytecode::module::CompiledProgram;

use crate::debug::{unwind, BreakpointTable, Frame, StepCommand, StepSnapshot, StepState};
use crate::object::{Delegate, RawObjectPtr};
use crate::stack::{validate_pc, Stack, HALT_SENTINEL_PC};
use crate::vm::interpreter::{BuiltinDispatch, ExecFlags, ExecResult, NativeDispatch, RuntimeError, Vm};

/// Fixed builtin-table indices the context calls directly rather than
/// through compiled bytecode (spec §4.7 `NewObject`, §4.4 array natives).
/// `raya-builtins`'s [`BuiltinDispatch`] implementation is built against
/// these same constants; they are not part of the wire format, only an
/// in-process convention between the two crates.
pub mod builtin_ids {
    /// `NEW_DYNAMIC(type_index) -> object_ptr` (spec §4.4, used by `NewObject`).
    pub const NEW_DYNAMIC: u32 = 0;
    pub const ARRAY_RESIZE: u32 = 1;
    pub const ARRAY_RESERVE: u32 = 2;
    pub const ARRAY_PUSH: u32 = 3;
    pub const ARRAY_POP: u32 = 4;
    pub const ARRAY_CLEAR: u32 = 5;
    pub const ARRAY_ERASE: u32 = 6;
    pub const ARRAY_ERASE_FAST: u32 = 7;
    pub const ARRAY_INSERT: u32 = 8;
}

/// The dynamic-array native method a host can invoke directly through
/// [`ExecutionContext::array_interface`] (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayCommand {
    Resize,
    Reserve,
    Push,
    Pop,
    Clear,
    Erase,
    EraseFast,
    Insert,
}

impl ArrayCommand {
    fn builtin_index(self) -> u32 {
        use builtin_ids::*;
        match self {
            ArrayCommand::Resize => ARRAY_RESIZE,
            ArrayCommand::Reserve => ARRAY_RESERVE,
            ArrayCommand::Push => ARRAY_PUSH,
            ArrayCommand::Pop => ARRAY_POP,
            ArrayCommand::Clear => ARRAY_CLEAR,
            ArrayCommand::Erase => ARRAY_ERASE,
            ArrayCommand::EraseFast => ARRAY_ERASE_FAST,
            ArrayCommand::Insert => ARRAY_INSERT,
        }
    }
}

/// Compiled entry points a shared JIT can offer for a program's functions
/// (spec §4.6). `raya-core` only ever sees this trait — never `raya-jit`
/// itself — exactly like [`BuiltinDispatch`]/[`NativeDispatch`] keep
/// `raya-builtins`/`raya-native` out of this crate's dependency graph.
pub trait JitEngine: Send + Sync {
    /// Attempt to run `program` starting at `pc` using compiled code. Returns
    /// `None` if the function is not (yet) compiled or is JIT-ineligible, in
    /// which case the caller falls back to the interpreter; compilation may
    /// be triggered as a side effect (eligible-but-uncompiled functions are
    /// queued, not compiled synchronously, per spec §4.6 "tiered").
    #[allow(clippy::too_many_arguments)]
    fn try_run(
        &self,
        program: &Arc<CompiledProgram>,
        stack: &mut Stack,
        globals: &mut [u8],
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
        pc: u32,
    ) -> Option<ExecResult>;

    /// Invalidate any compiled code cached for `program` (called after a
    /// breakpoint patch changes its instructions, since compiled code does
    /// not re-check `fetch_instruction_word`'s overlay).
    fn invalidate(&self, program: &Arc<CompiledProgram>);
}

/// Builder for [`ExecutionContext`] (spec §4.7; ambient "Configuration"
/// stack item). No config-file parsing — the host sets these
/// programmatically.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub stack_capacity_words: usize,
    pub debug: bool,
    pub jit_enabled: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            stack_capacity_words: 64 * 1024,
            debug: false,
            jit_enabled: true,
        }
    }
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_capacity_words(mut self, words: usize) -> Self {
        self.stack_capacity_words = words;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn jit_enabled(mut self, enabled: bool) -> Self {
        self.jit_enabled = enabled;
        self
    }

    fn exec_flags(&self) -> ExecFlags {
        if self.debug {
            ExecFlags::DEBUG
        } else {
            ExecFlags::RELEASE
        }
    }
}

/// The debug-break state a context carries across calls (spec §4.8
/// `ScriptContextDebugData`).
#[derive(Default)]
struct DebugState {
    breakpoints: BreakpointTable,
    step: StepState,
    in_break_mode: bool,
}

/// Line-callback and runtime-error hooks a host may install (§2 "Supplemented
/// features": `onLineCallback`/`onRuntimeError` from `original_source/`).
pub type LineCallback = Box<dyn Fn(&ExecutionContext, u32) + Send + Sync>;
pub type RuntimeErrorCallback = Box<dyn Fn(&ExecutionContext, RuntimeError, u32) + Send + Sync>;

/// One script execution context (spec §4.7): a stack, a VM bound to a
/// linked program, optional JIT, and the debug-observability state layered
/// on top. Every public entry point locks `call_lock` first — a
/// `parking_lot::ReentrantMutex` so a native call that reenters the VM on
/// the same thread (native -> script -> native -> script) does not
/// deadlock itself (spec §5 "the context carries a recursive mutex").
pub struct ExecutionContext {
    program: Arc<CompiledProgram>,
    vm: Vm,
    stack: RefCell<Stack>,
    call_lock: ReentrantMutex<()>,
    jit: Option<Arc<dyn JitEngine>>,
    options: ContextOptions,
    break_execution: Arc<AtomicBool>,
    debug_state: RefCell<DebugState>,
    /// A delegate installed via `SET_STATE_LABEL` (§4.4); polled externally
    /// by a host scheduler rather than driven by the core's own control flow
    /// (§2 "state delegate tick").
    state_delegate: RefCell<Option<Delegate>>,
    line_callback: Option<LineCallback>,
    runtime_error_callback: Option<RuntimeErrorCallback>,
}

// Safety: `stack`/`debug_state`/`state_delegate` are only ever touched while
// `call_lock` is held, which is every public entry point's first action —
// the same "single-threaded cooperative" contract spec §5 describes.
unsafe impl Sync for ExecutionContext {}

impl ExecutionContext {
    /// Build a context bound to `program`, with no JIT attached.
    pub fn new(program: Arc<CompiledProgram>, options: ContextOptions) -> Self {
        Self::with_jit(program, options, None)
    }

    /// Build a context bound to `program`, sharing `jit` with any other
    /// context running the same program (spec §5: "multiple contexts may
    /// run on multiple threads in parallel, sharing the read-only
    /// `CompiledProgram`").
    pub fn with_jit(program: Arc<CompiledProgram>, options: ContextOptions, jit: Option<Arc<dyn JitEngine>>) -> Self {
        let break_execution = Arc::new(AtomicBool::new(false));
        let stack = Stack::with_break_flag(options.stack_capacity_words, break_execution.clone());
        tracing::debug!(program = %program.metadata.name, "execution context created");
        Self {
            vm: Vm::new(program.clone()),
            program,
            stack: RefCell::new(stack),
            call_lock: ReentrantMutex::new(()),
            jit: jit.filter(|_| options.jit_enabled),
            options,
            break_execution,
            debug_state: RefCell::new(DebugState::default()),
            state_delegate: RefCell::new(None),
            line_callback: None,
            runtime_error_callback: None,
        }
    }

    pub fn with_line_callback(mut self, cb: LineCallback) -> Self {
        self.line_callback = Some(cb);
        self
    }

    pub fn with_runtime_error_callback(mut self, cb: RuntimeErrorCallback) -> Self {
        self.runtime_error_callback = Some(cb);
        self
    }

    pub fn program(&self) -> &Arc<CompiledProgram> {
        &self.program
    }

    // ---- call entry points (spec §4.7) ----
    //
    // Every variant pushes `HALT_SENTINEL_PC` at the bottom of the call
    // before jumping in, so the callee's terminal `Ret` pops onto a PC the
    // interpreter recognizes as "stop cleanly" rather than walking off the
    // program (spec §4.7: "ensures the halt-opcode return sentinel is at the
    // bottom of the call").

    /// Call a function by name.
    pub fn call(
        &self,
        name: &str,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<ExecResult, RuntimeError> {
        let func = self
            .program
            .functions
            .iter()
            .find(|f| f.name == name)
            .ok_or(RuntimeError::NullDereference)?;
        self.call_offset(func.entry_pc, builtins, natives)
    }

    /// Call a function at a known entry PC.
    pub fn call_offset(
        &self,
        pc: u32,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<ExecResult, RuntimeError> {
        let _guard = self.call_lock.lock();
        if !validate_pc(&self.program, pc) {
            return Ok(ExecResult::InvalidPc);
        }
        Ok(self.run_with_sentinel(pc, builtins, natives))
    }

    /// Call through a raw code pointer (JIT-resolved or host-held).
    pub fn call_pointer(
        &self,
        raw_pc: u32,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<ExecResult, RuntimeError> {
        self.call_offset(raw_pc, builtins, natives)
    }

    /// Call a method by name against `instance` (sets `this` before the
    /// call; spec §4.9 "leading `thisPtr` slot for methods").
    pub fn call_method(
        &self,
        name: &str,
        instance: RawObjectPtr,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<ExecResult, RuntimeError> {
        let func = self
            .program
            .functions
            .iter()
            .find(|f| f.name == name && f.is_method)
            .ok_or(RuntimeError::NullDereference)?;
        self.call_method_offset(func.entry_pc, instance, builtins, natives)
    }

    /// Call a method by its vtable slot (signed: negative = virtual slot,
    /// matching [`raya_bytecode::module::MethodSlot::decode`]).
    pub fn call_method_by_index(
        &self,
        signed_index: i32,
        instance: RawObjectPtr,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<ExecResult, RuntimeError> {
        use raya_bytecode::module::MethodSlot;
        let pc = match MethodSlot::decode(signed_index) {
            MethodSlot::Code(pc) => pc,
            MethodSlot::Virtual(slot) => {
                let header = instance.header();
                let vtbl_base = header.script_vtbl;
                let slot_ptr = (vtbl_base as usize + (slot as usize) * std::mem::size_of::<u64>()) as *const u64;
                // Safety: `script_vtbl` points into the linked program's
                // global arena, populated by `CompiledProgram::link`.
                unsafe { *slot_ptr } as u32
            }
            MethodSlot::Absent => return Ok(ExecResult::NullInstance),
        };
        self.call_method_offset(pc, instance, builtins, natives)
    }

    fn call_method_offset(
        &self,
        pc: u32,
        instance: RawObjectPtr,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<ExecResult, RuntimeError> {
        let _guard = self.call_lock.lock();
        if !validate_pc(&self.program, pc) {
            return Ok(ExecResult::InvalidPc);
        }
        self.stack.borrow_mut().set_this_ptr(instance.as_word());
        Ok(self.run_with_sentinel(pc, builtins, natives))
    }

    /// Call through a [`Delegate`] (spec §4.5 "Delegate"): resolves the
    /// bound instance and either a direct code pointer or a vtable slot.
    pub fn call_delegate(
        &self,
        dg: Delegate,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<ExecResult, RuntimeError> {
        // Safety: a live `Delegate`'s `instance_ptr` was produced from a
        // `RawObjectPtr::as_word` by the caller that built it.
        let instance = unsafe { RawObjectPtr::from_word(dg.instance_ptr) };
        match (dg.code_pointer(), instance) {
            (Some(pc), Some(instance)) => {
                let _guard = self.call_lock.lock();
                if !validate_pc(&self.program, pc as u32) {
                    return Ok(ExecResult::InvalidPc);
                }
                self.stack.borrow_mut().set_this_ptr(instance.as_word());
                Ok(self.run_with_sentinel(pc as u32, builtins, natives))
            }
            (None, Some(instance)) => self.call_method_by_index(
                -(dg.vtable_index().unwrap() as i32) - 1,
                instance,
                builtins,
                natives,
            ),
            _ => Ok(ExecResult::NullInstance),
        }
    }

    /// `NewObject(name)` (spec §4.7): calls `NEW_DYNAMIC`, then the type's
    /// constructor via a follow-up `CallPointer`, and returns the object.
    pub fn new_object(
        &self,
        type_name: &str,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<RawObjectPtr, RuntimeError> {
        let _guard = self.call_lock.lock();
        let type_index = *self
            .program
            .type_hash
            .get(type_name)
            .ok_or(RuntimeError::NullDereference)?;

        let mut stack = self.stack.borrow_mut();
        stack.push_int(type_index as i32)?;
        builtins.call(builtin_ids::NEW_DYNAMIC, &mut stack, &mut [])?;
        let ptr_word = stack.get_ptr(0)?;
        stack.pop(1)?;
        drop(stack);

        let instance =
            unsafe { RawObjectPtr::from_word(ptr_word) }.ok_or(RuntimeError::NullDereference)?;

        let data_type = &self.program.types[type_index as usize];
        if let Some(ctor_pc) = data_type.ctor_pc {
            self.stack.borrow_mut().set_this_ptr(instance.as_word());
            self.run_with_sentinel(ctor_pc, builtins, natives);
        }
        Ok(instance)
    }

    /// `ConstructObject(name, instance)`: run the constructor in place over
    /// host-owned memory (no allocation).
    pub fn construct_object(
        &self,
        type_name: &str,
        instance: RawObjectPtr,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<(), RuntimeError> {
        let _guard = self.call_lock.lock();
        let type_index = *self
            .program
            .type_hash
            .get(type_name)
            .ok_or(RuntimeError::NullDereference)?;
        if let Some(ctor_pc) = self.program.types[type_index as usize].ctor_pc {
            self.stack.borrow_mut().set_this_ptr(instance.as_word());
            self.run_with_sentinel(ctor_pc, builtins, natives);
        }
        Ok(())
    }

    /// `DestructObject(name, instance)`: the mirror of [`Self::construct_object`].
    pub fn destruct_object(
        &self,
        type_name: &str,
        instance: RawObjectPtr,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<(), RuntimeError> {
        let _guard = self.call_lock.lock();
        let type_index = *self
            .program
            .type_hash
            .get(type_name)
            .ok_or(RuntimeError::NullDereference)?;
        if let Some(dtor_pc) = self.program.types[type_index as usize].dtor_pc {
            self.stack.borrow_mut().set_this_ptr(instance.as_word());
            self.run_with_sentinel(dtor_pc, builtins, natives);
        }
        Ok(())
    }

    /// Invoke the program's global-constructor entry point, if it has one.
    pub fn run_constructors(
        &self,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<(), RuntimeError> {
        let _guard = self.call_lock.lock();
        if let Some(pc) = self.program.global_const_index {
            self.run_with_sentinel(pc, builtins, natives);
        }
        Ok(())
    }

    /// Invoke the program's global-destructor entry point, if it has one.
    pub fn run_destructors(
        &self,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> Result<(), RuntimeError> {
        let _guard = self.call_lock.lock();
        if let Some(pc) = self.program.global_dest_index {
            self.run_with_sentinel(pc, builtins, natives);
        }
        Ok(())
    }

    /// The externally-callable dynamic-array dispatcher (spec §4.7
    /// `ArrayInterface`).
    pub fn array_interface(
        &self,
        cmd: ArrayCommand,
        array_ptr: u64,
        param: u64,
        int_param: i32,
        builtins: &mut dyn BuiltinDispatch,
    ) -> Result<(), RuntimeError> {
        let _guard = self.call_lock.lock();
        let mut stack = self.stack.borrow_mut();
        stack.push_ptr(array_ptr)?;
        stack.push_ptr(param)?;
        stack.push_int(int_param)?;
        builtins.call(cmd.builtin_index(), &mut stack, &mut [])?;
        stack.pop(3)?;
        Ok(())
    }

    /// Push the halt sentinel and drive the interpreter (or JIT, if
    /// attached and the function is eligible) from `pc` to completion.
    fn run_with_sentinel(
        &self,
        pc: u32,
        builtins: &mut dyn BuiltinDispatch,
        natives: &mut dyn NativeDispatch,
    ) -> ExecResult {
        let mut stack = self.stack.borrow_mut();
        let pushed_sentinel = stack.push_ptr(HALT_SENTINEL_PC as u64).is_ok();
        stack.enter_nested();

        // The context copies the linked program's initial global-data image
        // once per call rather than holding one mutable byte buffer across
        // the context's lifetime; a single context only ever runs one call
        // at a time (the `call_lock`), so this is equivalent to holding a
        // persistent buffer for anything the bytecode itself does within a
        // call, while keeping `ExecutionContext` trivially `Sync`.
        let mut globals = self.program.global_arena.as_bytes().to_vec();

        let result = if let Some(jit) = &self.jit {
            match jit.try_run(&self.program, &mut stack, &mut globals, builtins, natives, pc) {
                Some(r) => r,
                None => self.vm.run(&mut stack, &mut globals, builtins, natives, pc, self.options.exec_flags()),
            }
        } else {
            self.vm.run(&mut stack, &mut globals, builtins, natives, pc, self.options.exec_flags())
        };

        stack.exit_nested();
        if pushed_sentinel {
            let _ = stack.pop(1);
        }

        if let ExecResult::Exception(err) = result {
            if let Some(cb) = &self.runtime_error_callback {
                cb(self, err, stack.program_counter());
            }
        }

        result
    }

    // ---- debug observability (spec §4.8) ----

    /// `SetBreakpoint(file, pc, enabled)`.
    pub fn set_breakpoint(&self, file: impl Into<String>, pc: u32, enabled: bool) {
        self.debug_state.borrow_mut().breakpoints.set(&self.program, pc, file, enabled);
        if enabled {
            if let Some(jit) = &self.jit {
                jit.invalidate(&self.program);
            }
        }
    }

    pub fn toggle_breakpoint(&self, file: impl Into<String>, pc: u32) -> bool {
        let enabled = self.debug_state.borrow_mut().breakpoints.toggle(&self.program, pc, file);
        if let Some(jit) = &self.jit {
            jit.invalidate(&self.program);
        }
        enabled
    }

    pub fn delete_all_breakpoints(&self) {
        self.debug_state.borrow_mut().breakpoints.clear(&self.program);
    }

    /// Arm a step command before resuming from a breakpoint (spec §4.8).
    pub fn arm_step(&self, command: StepCommand) {
        let pc = self.stack.borrow().program_counter();
        let depth = unwind(&self.program, &self.stack.borrow()).len();
        if let Some(snap) = StepSnapshot::capture(&self.program, pc, depth) {
            self.debug_state.borrow_mut().step.arm(command, snap);
        }
    }

    /// Resume execution after a break (spec §4.7 `Resume`).
    pub fn resume(&self) {
        self.debug_state.borrow_mut().in_break_mode = false;
        self.break_execution.store(false, Ordering::Release);
    }

    /// Request an interrupt at the next polled instruction (spec §4.7 `Break`).
    pub fn request_break(&self) {
        self.break_execution.store(true, Ordering::Release);
    }

    pub fn in_break_mode(&self) -> bool {
        self.debug_state.borrow().in_break_mode
    }

    /// Snapshot the call stack (debug-server `getcallstack`, spec §6).
    pub fn call_stack(&self) -> Vec<Frame> {
        unwind(&self.program, &self.stack.borrow())
    }

    /// The `SET_STATE_LABEL` delegate, if one is installed (§2 "state
    /// delegate tick"); a host scheduler polls this to drive cooperative
    /// resumption outside the core's own control flow.
    pub fn state_delegate(&self) -> Option<Delegate> {
        *self.state_delegate.borrow()
    }

    pub fn set_state_delegate(&self, dg: Option<Delegate>) {
        *self.state_delegate.borrow_mut() = dg;
    }

    /// Fire the installed line callback, if any (§2 `onLineCallback`).
    pub fn notify_line(&self, line: u32) {
        if let Some(cb) = &self.line_callback {
            cb(self, line);
        }
    }

    pub fn break_flag(&self) -> Arc<AtomicBool> {
        self.break_execution.clone()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("program", &self.program.metadata.name)
            .field("jit_enabled", &self.options.jit_enabled)
            .field("in_break_mode", &self.in_break_mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raya_bytecode::encoder::{Instruction, Operand};
    use raya_bytecode::module::FunctionDef;
    use raya_bytecode::opcode::Opcode;

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

    fn halt_program(name: &str) -> CompiledProgram {
        let mut p = CompiledProgram::new(name);
        p.instructions = vec![Instruction::new(Opcode::Halt, Operand::None).encode()];
        p.functions.push(FunctionDef {
            name: "main".into(),
            entry_pc: 0,
            param_count: 0,
            local_count: 0,
            is_method: false,
        });
        p
    }

    #[test]
    fn call_by_name_runs_to_halt() {
        let program = Arc::new(halt_program("ctx-test"));
        let ctx = ExecutionContext::new(program, ContextOptions::new());
        let result = ctx.call("main", &mut NoBuiltins, &mut NoNatives).unwrap();
        assert_eq!(result, ExecResult::Ok);
    }

    #[test]
    fn call_unknown_function_is_an_error() {
        let program = Arc::new(halt_program("ctx-test"));
        let ctx = ExecutionContext::new(program, ContextOptions::new());
        assert!(ctx.call("nope", &mut NoBuiltins, &mut NoNatives).is_err());
    }

    #[test]
    fn breakpoint_round_trip_through_context() {
        let program = Arc::new(halt_program("ctx-bp"));
        let ctx = ExecutionContext::new(program.clone(), ContextOptions::new().debug(true));
        ctx.set_breakpoint("main.raya", 0, true);
        assert!(program.is_breakpoint_patched(0));
        ctx.delete_all_breakpoints();
        assert!(!program.is_breakpoint_patched(0));
    }

    #[test]
    fn resume_clears_break_mode_and_flag() {
        let program = Arc::new(halt_program("ctx-resume"));
        let ctx = ExecutionContext::new(program, ContextOptions::new());
        ctx.request_break();
        assert!(ctx.break_flag().load(Ordering::Acquire));
        ctx.resume();
        assert!(!ctx.break_flag().load(Ordering::Acquire));
        assert!(!ctx.in_break_mode());
    }

    #[test]
    fn state_delegate_round_trips() {
        let program = Arc::new(halt_program("ctx-state"));
        let ctx = ExecutionContext::new(program, ContextOptions::new());
        assert!(ctx.state_delegate().is_none());
        ctx.set_state_delegate(Some(Delegate::direct(1, 2)));
        assert_eq!(ctx.state_delegate(), Some(Delegate::direct(1, 2)));
    }
}
