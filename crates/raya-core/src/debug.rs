//! Debug observability (spec §4.8): breakpoints, the single-step state
//! machine, stack unwinding, live local-variable reconstruction, and the
//! `this`-register reconstruction heuristic.
//!
//! Breakpoint *patching* itself lives on [`raya_bytecode::module::CompiledProgram`]
//! (`fetch_instruction_word`/`set_breakpoint_patch`) since it mutates program
//! data shared by every context; this module is the higher-level state a
//! debugger-attached [`crate::vm::context::ExecutionContext`] keeps on top of
//! that: which PCs have breakpoints registered (independent of whether the
//! patch is currently installed), the step command in flight, and the
//! read-only reconstruction queries a debug server issues once execution has
//! stopped.

use rustc_hash::FxHashMap;

use raya_bytecode::module::CompiledProgram;
use raya_bytecode::opcode::Opcode;

use crate::stack::Stack;

/// One registered breakpoint (spec §4.8: "records `{pc, file, enabled}` in a
/// free-list").
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub pc: u32,
    pub file: String,
    pub enabled: bool,
}

/// The set of breakpoints a debug session has registered against one
/// program, independent of any particular [`crate::vm::context::ExecutionContext`]
/// (a host may attach several contexts to the same program and expects a
/// breakpoint to apply to all of them).
#[derive(Debug, Default)]
pub struct BreakpointTable {
    by_pc: FxHashMap<u32, Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or update) a breakpoint at `pc` and apply/remove its patch
    /// on `program` immediately, matching its `enabled` flag.
    pub fn set(&mut self, program: &CompiledProgram, pc: u32, file: impl Into<String>, enabled: bool) {
        program.set_breakpoint_patch(pc, enabled);
        self.by_pc.insert(pc, Breakpoint { pc, file: file.into(), enabled });
    }

    /// Flip a breakpoint's enabled state (debug-server `toggle_breakpoint`,
    /// spec §6), inserting a fresh (enabled) one if none was registered yet.
    pub fn toggle(&mut self, program: &CompiledProgram, pc: u32, file: impl Into<String>) -> bool {
        let enabled = match self.by_pc.get(&pc) {
            Some(bp) => !bp.enabled,
            None => true,
        };
        self.set(program, pc, file, enabled);
        enabled
    }

    /// Remove a breakpoint entirely, restoring the original instruction.
    pub fn remove(&mut self, program: &CompiledProgram, pc: u32) {
        program.set_breakpoint_patch(pc, false);
        self.by_pc.remove(&pc);
    }

    /// Remove every breakpoint (debug-server `delete_all_breakpoints`).
    pub fn clear(&mut self, program: &CompiledProgram) {
        for pc in self.by_pc.keys().copied().collect::<Vec<_>>() {
            program.set_breakpoint_patch(pc, false);
        }
        self.by_pc.clear();
    }

    pub fn get(&self, pc: u32) -> Option<&Breakpoint> {
        self.by_pc.get(&pc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.by_pc.values()
    }
}

/// A pending step request (spec §4.8 `stepCmd`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepCommand {
    #[default]
    None,
    Into,
    Over,
    Out,
}

/// The snapshot captured the last time the break handler ran, used to decide
/// whether a subsequent stop should resume transparently (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSnapshot {
    pub pc: u32,
    pub file_name_index: u32,
    pub line: u32,
    /// Call-stack depth at the moment the step was requested (number of
    /// frames found by [`unwind`]).
    pub depth: usize,
    /// Function index owning `pc` at the moment the step was requested.
    pub function_index: u32,
}

impl StepSnapshot {
    pub fn capture(program: &CompiledProgram, pc: u32, depth: usize) -> Option<Self> {
        let line = program.line_at(pc)?;
        let function_index = function_index_at(program, pc)?;
        Some(Self {
            pc,
            file_name_index: line.file,
            line: line.line,
            depth,
            function_index,
        })
    }
}

/// Binary-search `func_map` for the function owning `pc` (spec §6 `funcMap`).
fn function_index_at(program: &CompiledProgram, pc: u32) -> Option<u32> {
    let idx = match program.func_map.binary_search_by_key(&pc, |e| e.pc) {
        Ok(i) => i,
        Err(0) => return None,
        Err(i) => i - 1,
    };
    program.func_map.get(idx).map(|e| e.function_index)
}

/// Per-context stepping state (spec §4.8 `ScriptContextDebugData`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StepState {
    pub command: StepCommand,
    pub snapshot: Option<StepSnapshot>,
}

impl StepState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, command: StepCommand, snapshot: StepSnapshot) {
        self.command = command;
        self.snapshot = Some(snapshot);
    }

    pub fn clear(&mut self) {
        self.command = StepCommand::None;
        self.snapshot = None;
    }

    /// Decide whether a break at `current` should be resumed transparently
    /// (spec §4.8's `over`/`into`/`out` rules) rather than surfaced to the
    /// debugger. Returns `true` to keep running.
    ///
    /// `ctor_dtor_skip_pc` is the first entry in the function's
    /// `codeToLine` map — compiler-generated ctor/dtor preamble sits before
    /// it, and `into` is allowed to skip over that range (spec §4.8 "with an
    /// allowance to skip compiler-generated ctor/dtor ranges located before
    /// the first entry in the `codeToLine` map").
    pub fn should_resume(&self, current: &StepSnapshot, ctor_dtor_skip_pc: Option<u32>) -> bool {
        let Some(start) = self.snapshot else { return false };
        match self.command {
            StepCommand::None => false,
            StepCommand::Over => {
                let same_frame = current.function_index == start.function_index
                    && current.file_name_index == start.file_name_index;
                (same_frame && current.line == start.line)
                    || current.depth > start.depth
                    || (current.depth == start.depth && same_frame && current.line <= start.line)
            }
            StepCommand::Into => {
                if let Some(skip_pc) = ctor_dtor_skip_pc {
                    if current.pc < skip_pc {
                        return true;
                    }
                }
                current.line == start.line
            }
            StepCommand::Out => current.depth >= start.depth,
        }
    }
}

/// One reconstructed call frame (spec §4.8 "stack unwinding").
#[derive(Debug, Clone)]
pub struct Frame {
    pub return_pc: u32,
    pub function_index: u32,
    pub function_name: String,
    pub line: Option<u32>,
    pub file_name_index: Option<u32>,
}

/// True if the low byte of `word` decodes to a recognized call/halt opcode —
/// the marker [`unwind`] looks for when scanning the stack downward for the
/// next return address (spec §4.8: "find the next downward slot that holds
/// a valid code pointer whose instruction byte is a recognized call/halt
/// opcode").
fn looks_like_return_address(program: &CompiledProgram, candidate_pc: u32) -> bool {
    if candidate_pc as usize >= program.instructions.len() {
        return candidate_pc == crate::stack::HALT_SENTINEL_PC;
    }
    let word = program.instructions[candidate_pc as usize];
    match Opcode::from_u8((word & 0xFF) as u8) {
        Some(op) => op.is_call() || op == Opcode::Halt,
        None => false,
    }
}

/// Walk the stack from its current top downward, reconstructing call frames
/// (spec §4.8). Each frame is annotated with its function name (via
/// `program.function_at`) and source location (via `program.line_at`).
pub fn unwind(program: &CompiledProgram, stack: &Stack) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut idx = stack.top_index();
    let bottom = stack.bottom_index();

    while idx < bottom {
        let Some(word) = stack.word_at(idx) else { break };
        let candidate_pc = word as u32;
        if looks_like_return_address(program, candidate_pc) {
            let owner_pc = candidate_pc.wrapping_sub(1);
            if let Some(func) = program.function_at(owner_pc) {
                let function_index = function_index_at(program, owner_pc).unwrap_or(0);
                let line = program.line_at(owner_pc);
                frames.push(Frame {
                    return_pc: candidate_pc,
                    function_index,
                    function_name: func.name.clone(),
                    line: line.map(|l| l.line),
                    file_name_index: line.map(|l| l.file),
                });
            }
        }
        idx += 1;
    }
    frames
}

/// One entry of the `{scope-index, offset} -> {name, type, startPC, endPC}`
/// local-variable map (spec §4.8 `localVars`).
#[derive(Debug, Clone)]
pub struct LocalVarEntry {
    pub scope_index: u32,
    pub offset: u32,
    pub name: String,
    pub type_index: u32,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// A function's local-variable debug map.
#[derive(Debug, Clone, Default)]
pub struct LocalVarTable {
    entries: Vec<LocalVarEntry>,
}

impl LocalVarTable {
    pub fn new(entries: Vec<LocalVarEntry>) -> Self {
        Self { entries }
    }

    /// The set of variables live at `pc` (spec §4.8: "the set of variables
    /// with `startPC <= PC < endPC` is the live set").
    pub fn live_at(&self, pc: u32) -> Vec<&LocalVarEntry> {
        self.entries
            .iter()
            .filter(|e| e.start_pc <= pc && pc < e.end_pc)
            .collect()
    }
}

/// Reconstruct whether `this` is reliable at `current_pc` within a function
/// that began at `function_start_pc` (spec §4.8 "Reconstruction of `this`").
///
/// Scans forward counting `LoadThis`/`PushThis` pushes against `PopThis`
/// pops; an unmatched `LoadThis` (opened but never closed by a `PopThis`
/// before `current_pc`) means the frame's owning instance may have been
/// replaced by a nested call's `this`, so the caller should omit it.
pub fn this_is_reliable(program: &CompiledProgram, function_start_pc: u32, current_pc: u32) -> bool {
    let mut open = 0i32;
    let mut pc = function_start_pc;
    while pc < current_pc && (pc as usize) < program.instructions.len() {
        if program.is_switch_table_pc(pc) {
            pc += 1;
            continue;
        }
        let word = program.instructions[pc as usize];
        match Opcode::from_u8((word & 0xFF) as u8) {
            Some(Opcode::LoadThis) | Some(Opcode::PushThis) => open += 1,
            Some(Opcode::PopThis) => open -= 1,
            _ => {}
        }
        pc += 1;
    }
    open <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_program() -> CompiledProgram {
        let mut p = CompiledProgram::new("dbg");
        p.instructions = vec![
            raya_bytecode::encoder::Instruction::new(Opcode::Nop, raya_bytecode::encoder::Operand::None).encode(),
            raya_bytecode::encoder::Instruction::new(Opcode::Halt, raya_bytecode::encoder::Operand::None).encode(),
        ];
        p
    }

    #[test]
    fn breakpoint_table_applies_and_clears_patch() {
        let program = sample_program();
        let mut table = BreakpointTable::new();
        table.set(&program, 0, "main.raya", true);
        assert!(program.is_breakpoint_patched(0));
        assert_eq!(table.get(0).unwrap().file, "main.raya");

        table.set(&program, 0, "main.raya", false);
        assert!(!program.is_breakpoint_patched(0));
    }

    #[test]
    fn toggle_flips_enabled_state() {
        let program = sample_program();
        let mut table = BreakpointTable::new();
        assert!(table.toggle(&program, 1, "a.raya"));
        assert!(program.is_breakpoint_patched(1));
        assert!(!table.toggle(&program, 1, "a.raya"));
        assert!(!program.is_breakpoint_patched(1));
    }

    #[test]
    fn step_over_resumes_on_same_line_deeper_frame() {
        let snap = StepSnapshot { pc: 10, file_name_index: 0, line: 5, depth: 2, function_index: 0 };
        let mut state = StepState::new();
        state.arm(StepCommand::Over, snap);

        let deeper = StepSnapshot { pc: 20, file_name_index: 0, line: 7, depth: 3, function_index: 1 };
        assert!(state.should_resume(&deeper, None));

        let same_frame_later_line = StepSnapshot { pc: 12, file_name_index: 0, line: 6, depth: 2, function_index: 0 };
        assert!(!state.should_resume(&same_frame_later_line, None));
    }

    #[test]
    fn step_out_resumes_while_deeper_than_capture() {
        let snap = StepSnapshot { pc: 10, file_name_index: 0, line: 5, depth: 2, function_index: 0 };
        let mut state = StepState::new();
        state.arm(StepCommand::Out, snap);

        let deeper = StepSnapshot { pc: 20, file_name_index: 0, line: 7, depth: 3, function_index: 1 };
        assert!(state.should_resume(&deeper, None));

        let shallower = StepSnapshot { pc: 30, file_name_index: 0, line: 1, depth: 1, function_index: 2 };
        assert!(!state.should_resume(&shallower, None));
    }

    #[test]
    fn local_var_table_filters_by_pc_range() {
        let table = LocalVarTable::new(vec![LocalVarEntry {
            scope_index: 0,
            offset: 0,
            name: "x".into(),
            type_index: 0,
            start_pc: 5,
            end_pc: 10,
        }]);
        assert!(table.live_at(4).is_empty());
        assert_eq!(table.live_at(5).len(), 1);
        assert_eq!(table.live_at(9).len(), 1);
        assert!(table.live_at(10).is_empty());
    }

    #[test]
    fn this_reliability_tracks_balanced_pairs() {
        let mut p = CompiledProgram::new("this-track");
        p.instructions = vec![
            raya_bytecode::encoder::Instruction::new(Opcode::LoadThis, raya_bytecode::encoder::Operand::None).encode(),
            raya_bytecode::encoder::Instruction::new(Opcode::Nop, raya_bytecode::encoder::Operand::None).encode(),
            raya_bytecode::encoder::Instruction::new(Opcode::PopThis, raya_bytecode::encoder::Operand::None).encode(),
            raya_bytecode::encoder::Instruction::new(Opcode::Nop, raya_bytecode::encoder::Operand::None).encode(),
        ];
        assert!(!this_is_reliable(&p, 0, 1)); // inside the open LoadThis..PopThis span
        assert!(this_is_reliable(&p, 0, 3)); // after the matching PopThis
    }
}
