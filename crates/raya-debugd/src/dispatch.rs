//! Maps [`ClientCommand`]s onto the [`raya_core::ExecutionContext`] API a
//! host has already wired up — the "interfaces are specified" half of spec
//! §6, as opposed to the socket transport that carries the bytes (not in
//! scope, per spec §1).
//!
//! A host that owns a real TCP/pipe transport reads a frame, splits it into
//! lines, calls [`ClientCommand::parse`], passes the result through
//! [`Dispatcher::handle`], and writes the returned [`ServerMessage`]'s
//! `to_lines()` back out. Everything about *how bytes become lines* is the
//! host's problem.

use rustc_hash::FxHashMap;

use raya_core::debug::StepCommand;
use raya_core::ExecutionContext;

use crate::protocol::{CallStackFrame, ClientCommand, ServerMessage};

/// A named set of live contexts (spec §6 `getcontexts`), the unit a debug
/// server's commands address by `<ctxname>`.
pub struct Dispatcher<'a> {
    contexts: FxHashMap<&'a str, &'a ExecutionContext>,
}

impl<'a> Dispatcher<'a> {
    pub fn new() -> Self {
        Self { contexts: FxHashMap::default() }
    }

    /// Register a context under the name a debugger's `<ctxname>` commands
    /// will refer to it by.
    pub fn register(&mut self, name: &'a str, ctx: &'a ExecutionContext) {
        self.contexts.insert(name, ctx);
    }

    fn get(&self, name: &str) -> Option<&'a ExecutionContext> {
        self.contexts.get(name).copied()
    }

    /// Handle one command, returning the reply to send back (`None` for
    /// commands spec §6 documents as "no reply", or when the named context
    /// does not exist).
    pub fn handle(&self, command: &ClientCommand) -> Option<ServerMessage> {
        match command {
            ClientCommand::GetContexts => {
                let mut names: Vec<String> = self.contexts.keys().map(|s| s.to_string()).collect();
                names.sort();
                Some(ServerMessage::Contexts { names })
            }
            ClientCommand::ResumeAll => {
                for ctx in self.contexts.values() {
                    ctx.resume();
                }
                None
            }
            ClientCommand::BreakAll => {
                for ctx in self.contexts.values() {
                    ctx.request_break();
                }
                None
            }
            ClientCommand::DeleteAllBreakpoints => {
                for ctx in self.contexts.values() {
                    ctx.delete_all_breakpoints();
                }
                None
            }
            ClientCommand::Disassemble => {
                // Every registered context running the same program would
                // disassemble identically; the first one found stands in
                // for "the" program a single-module debug session attaches.
                let ctx = self.contexts.values().next()?;
                Some(ServerMessage::Disassembly { text: raya_bytecode::disasm::disassemble(ctx.program()) })
            }
            ClientCommand::ToggleBreakpoint { file, line } => {
                // `line` here is a source line, not a `pc`; a host compiler
                // resolves source line -> pc via its own line table before
                // this crate ever sees the command. We accept it already
                // resolved: callers that have a line->pc map should
                // construct `ClientCommand::ToggleBreakpoint` with `line`
                // already holding the resolved pc.
                let ctx = self.contexts.values().next()?;
                let enabled = ctx.toggle_breakpoint(file.clone(), *line);
                tracing::debug!(file, line, enabled, "breakpoint toggled via debug protocol");
                None
            }
            ClientCommand::ContinueContext { ctx } => {
                self.get(ctx)?.resume();
                None
            }
            ClientCommand::GetCallStack { ctx } => {
                let ctx = self.get(ctx)?;
                let constants = &ctx.program().constants;
                let frames = ctx
                    .call_stack()
                    .into_iter()
                    .map(|f| CallStackFrame {
                        function_name: f.function_name,
                        file: f
                            .file_name_index
                            .and_then(|idx| constants.get_name(idx))
                            .unwrap_or("")
                            .to_string(),
                        line: f.line.unwrap_or(0),
                    })
                    .collect();
                Some(ServerMessage::CallStack { frames })
            }
            ClientCommand::StepOver { ctx } => {
                self.get(ctx)?.arm_step(StepCommand::Over);
                None
            }
            ClientCommand::StepInto { ctx } => {
                self.get(ctx)?.arm_step(StepCommand::Into);
                None
            }
            ClientCommand::StepOut { ctx } => {
                self.get(ctx)?.arm_step(StepCommand::Out);
                None
            }
            // Source-file access, project-folder resolution, go-to-definition,
            // script reloading, and the raw internal-script dump are host
            // (compiler/filesystem) concerns with no `ExecutionContext`
            // counterpart; a host answers these directly rather than through
            // this dispatcher.
            ClientCommand::QueryFile { .. }
            | ClientCommand::GetProjectFolder
            | ClientCommand::GotoDefinition { .. }
            | ClientCommand::ReloadScripts
            | ClientCommand::GetInternalScript => None,
        }
    }
}

impl<'a> Default for Dispatcher<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raya_bytecode::encoder::{Instruction, Operand};
    use raya_bytecode::module::{CompiledProgram, FunctionDef};
    use raya_bytecode::opcode::Opcode;
    use raya_core::ContextOptions;
    use std::sync::Arc;

    fn halt_program() -> CompiledProgram {
        let mut p = CompiledProgram::new("debugd-test");
        p.instructions = vec![Instruction::new(Opcode::Halt, Operand::None).encode()];
        p.functions.push(FunctionDef { name: "main".into(), entry_pc: 0, param_count: 0, local_count: 0, is_method: false });
        p
    }

    #[test]
    fn getcontexts_lists_registered_names() {
        let program = Arc::new(halt_program());
        let ctx = ExecutionContext::new(program, ContextOptions::new());
        let mut d = Dispatcher::new();
        d.register("main", &ctx);
        assert_eq!(d.handle(&ClientCommand::GetContexts), Some(ServerMessage::Contexts { names: vec!["main".into()] }));
    }

    #[test]
    fn continue_unknown_context_yields_no_reply() {
        let d = Dispatcher::new();
        assert_eq!(d.handle(&ClientCommand::ContinueContext { ctx: "ghost".into() }), None);
    }

    #[test]
    fn disassemble_returns_program_text() {
        let program = Arc::new(halt_program());
        let ctx = ExecutionContext::new(program, ContextOptions::new());
        let mut d = Dispatcher::new();
        d.register("main", &ctx);
        match d.handle(&ClientCommand::Disassemble) {
            Some(ServerMessage::Disassembly { text }) => assert!(text.contains("Halt")),
            other => panic!("expected Disassembly, got {other:?}"),
        }
    }

    #[test]
    fn break_all_sets_every_context_break_flag() {
        let program = Arc::new(halt_program());
        let ctx = ExecutionContext::new(program, ContextOptions::new());
        let mut d = Dispatcher::new();
        d.register("main", &ctx);
        d.handle(&ClientCommand::BreakAll);
        assert!(ctx.break_flag().load(std::sync::atomic::Ordering::Acquire));
    }
}
