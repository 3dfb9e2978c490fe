//! The line-oriented, newline-delimited text wire protocol (spec §6
//! "Debug-server wire protocol"). This module only encodes and decodes the
//! messages described there; per spec §1's explicit Non-goal ("the debug
//! server's network transport ... is not" in scope) no socket or framing
//! code lives here. A caller that already has a transport (TCP, a pipe, an
//! in-process channel) is responsible for splitting its byte stream into the
//! discrete line groups one [`ClientCommand`]/[`ServerMessage`] consumes;
//! [`ClientCommand::parse`] and [`ServerMessage::parse`] each consume exactly
//! the lines their variant needs and hand back anything left over.

use thiserror::Error;

/// A decode failure: an unrecognized command name, or too few lines for the
/// fields a recognized command requires.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unrecognized command: {0:?}")]
    UnknownCommand(String),
    #[error("{command}: expected at least {expected} line(s), got {got}")]
    Truncated { command: &'static str, expected: usize, got: usize },
    #[error("{field} is not a valid integer: {value:?}")]
    BadInteger { field: &'static str, value: String },
}

fn parse_u32(field: &'static str, s: &str) -> Result<u32, ProtocolError> {
    s.parse()
        .map_err(|_| ProtocolError::BadInteger { field, value: s.to_string() })
}

/// Debugger -> server commands (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    QueryFile { path: String },
    GetProjectFolder,
    GotoDefinition { file: String, col: u32, line: u32 },
    ReloadScripts,
    ResumeAll,
    BreakAll,
    DeleteAllBreakpoints,
    Disassemble,
    GetInternalScript,
    GetContexts,
    ToggleBreakpoint { file: String, line: u32 },
    ContinueContext { ctx: String },
    GetCallStack { ctx: String },
    StepOver { ctx: String },
    StepInto { ctx: String },
    StepOut { ctx: String },
}

impl ClientCommand {
    /// Parse one command from the front of `lines`, returning it along with
    /// the remaining, unconsumed lines.
    pub fn parse<'a>(lines: &'a [&'a str]) -> Result<(Self, &'a [&'a str]), ProtocolError> {
        let Some((&head, rest)) = lines.split_first() else {
            return Err(ProtocolError::UnknownCommand(String::new()));
        };
        macro_rules! need {
            ($n:expr) => {
                if rest.len() < $n {
                    return Err(ProtocolError::Truncated { command: "command", expected: $n, got: rest.len() });
                }
            };
        }
        match head {
            "query_file" => {
                need!(1);
                Ok((ClientCommand::QueryFile { path: rest[0].to_string() }, &rest[1..]))
            }
            "get_project_folder" => Ok((ClientCommand::GetProjectFolder, rest)),
            "goto_definition" => {
                need!(3);
                Ok((
                    ClientCommand::GotoDefinition {
                        file: rest[0].to_string(),
                        col: parse_u32("col", rest[1])?,
                        line: parse_u32("line", rest[2])?,
                    },
                    &rest[3..],
                ))
            }
            "reload_scripts" => Ok((ClientCommand::ReloadScripts, rest)),
            "resume_all" => Ok((ClientCommand::ResumeAll, rest)),
            "break_all" => Ok((ClientCommand::BreakAll, rest)),
            "delete_all_breakpoints" => Ok((ClientCommand::DeleteAllBreakpoints, rest)),
            "disassemble" => Ok((ClientCommand::Disassemble, rest)),
            "getinternalscript" => Ok((ClientCommand::GetInternalScript, rest)),
            "getcontexts" => Ok((ClientCommand::GetContexts, rest)),
            "toggle_breakpoint" => {
                need!(2);
                Ok((
                    ClientCommand::ToggleBreakpoint { file: rest[0].to_string(), line: parse_u32("line", rest[1])? },
                    &rest[2..],
                ))
            }
            "continue_context" => {
                need!(1);
                Ok((ClientCommand::ContinueContext { ctx: rest[0].to_string() }, &rest[1..]))
            }
            "getcallstack" => {
                need!(1);
                Ok((ClientCommand::GetCallStack { ctx: rest[0].to_string() }, &rest[1..]))
            }
            "step_over" => {
                need!(1);
                Ok((ClientCommand::StepOver { ctx: rest[0].to_string() }, &rest[1..]))
            }
            "step_into" => {
                need!(1);
                Ok((ClientCommand::StepInto { ctx: rest[0].to_string() }, &rest[1..]))
            }
            "step_out" => {
                need!(1);
                Ok((ClientCommand::StepOut { ctx: rest[0].to_string() }, &rest[1..]))
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Render as the line group a transport would send.
    pub fn to_lines(&self) -> Vec<String> {
        match self {
            ClientCommand::QueryFile { path } => vec!["query_file".into(), path.clone()],
            ClientCommand::GetProjectFolder => vec!["get_project_folder".into()],
            ClientCommand::GotoDefinition { file, col, line } => {
                vec!["goto_definition".into(), file.clone(), col.to_string(), line.to_string()]
            }
            ClientCommand::ReloadScripts => vec!["reload_scripts".into()],
            ClientCommand::ResumeAll => vec!["resume_all".into()],
            ClientCommand::BreakAll => vec!["break_all".into()],
            ClientCommand::DeleteAllBreakpoints => vec!["delete_all_breakpoints".into()],
            ClientCommand::Disassemble => vec!["disassemble".into()],
            ClientCommand::GetInternalScript => vec!["getinternalscript".into()],
            ClientCommand::GetContexts => vec!["getcontexts".into()],
            ClientCommand::ToggleBreakpoint { file, line } => {
                vec!["toggle_breakpoint".into(), file.clone(), line.to_string()]
            }
            ClientCommand::ContinueContext { ctx } => vec!["continue_context".into(), ctx.clone()],
            ClientCommand::GetCallStack { ctx } => vec!["getcallstack".into(), ctx.clone()],
            ClientCommand::StepOver { ctx } => vec!["step_over".into(), ctx.clone()],
            ClientCommand::StepInto { ctx } => vec!["step_into".into(), ctx.clone()],
            ClientCommand::StepOut { ctx } => vec!["step_out".into(), ctx.clone()],
        }
    }
}

/// One frame of a `getcallstack` reply (spec §4.8 unwinding, flattened to
/// the wire format: a function name and a source location).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStackFrame {
    pub function_name: String,
    pub file: String,
    pub line: u32,
}

/// Server -> debugger messages: both request/response replies and
/// unsolicited pushes (spec §6) share one wire shape, so one enum covers
/// both directions of server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    File { path: String, contents: String },
    ProjectFolder { cwd: String },
    GotoDefinition { def_file: String, def_line: u32, def_col: u32 },
    ReloadSuccess,
    ReloadFailure,
    Disassembly { text: String },
    InternalScript { text: String },
    Contexts { names: Vec<String> },
    CallStack { frames: Vec<CallStackFrame> },
    DebugBreak { ctx: String, line: u32, file: String },
    DebugContinue { ctx: String },
    DebugOutput { msg: String },
    Error { file: String, line: u32, col: u32, msg: String, warn_id: String },
}

impl ServerMessage {
    /// Render as the line group a transport would send. Variable-length
    /// payloads (file contents, name lists, call-stack frames) occupy every
    /// remaining line; per this module's doc comment, the caller's transport
    /// owns delimiting one message's lines from the next.
    pub fn to_lines(&self) -> Vec<String> {
        match self {
            ServerMessage::File { path, contents } => {
                let mut lines = vec!["file".into(), path.clone()];
                lines.extend(contents.lines().map(str::to_string));
                if contents.is_empty() {
                    lines.push(String::new());
                }
                lines
            }
            ServerMessage::ProjectFolder { cwd } => vec!["project_folder".into(), cwd.clone()],
            ServerMessage::GotoDefinition { def_file, def_line, def_col } => {
                vec!["goto_definition".into(), def_file.clone(), def_line.to_string(), def_col.to_string()]
            }
            ServerMessage::ReloadSuccess => vec!["reload_success".into()],
            ServerMessage::ReloadFailure => vec!["reload_failure".into()],
            ServerMessage::Disassembly { text } => {
                let mut lines = vec!["disassemble".into()];
                lines.extend(text.lines().map(str::to_string));
                lines
            }
            ServerMessage::InternalScript { text } => {
                let mut lines = vec!["getinternalscript".into()];
                lines.extend(text.lines().map(str::to_string));
                lines
            }
            ServerMessage::Contexts { names } => {
                let mut lines = vec!["getcontexts".into()];
                lines.extend(names.iter().cloned());
                lines
            }
            ServerMessage::CallStack { frames } => {
                let mut lines = vec!["getcallstack".into()];
                for f in frames {
                    lines.push(f.function_name.clone());
                    lines.push(f.file.clone());
                    lines.push(f.line.to_string());
                }
                lines
            }
            ServerMessage::DebugBreak { ctx, line, file } => {
                vec!["debug_break".into(), ctx.clone(), line.to_string(), file.clone()]
            }
            ServerMessage::DebugContinue { ctx } => vec!["debug_continue".into(), ctx.clone()],
            ServerMessage::DebugOutput { msg } => vec!["debug_output".into(), msg.clone()],
            ServerMessage::Error { file, line, col, msg, warn_id } => {
                vec!["error".into(), file.clone(), line.to_string(), col.to_string(), msg.clone(), warn_id.clone()]
            }
        }
    }

    /// Parse the fixed-arity variants (`debug_break`, `debug_continue`,
    /// `debug_output`, `error`, `reload_success`/`reload_failure`,
    /// `project_folder`, `goto_definition`). Variable-arity server replies
    /// (`file`, `getcontexts`, `getcallstack`, `disassemble`,
    /// `getinternalscript`) are transport-specific enough (how many trailing
    /// lines belong to them) that a host wires those up directly against the
    /// fields above rather than through this parser.
    pub fn parse(lines: &[&str]) -> Result<Self, ProtocolError> {
        let Some((&head, rest)) = lines.split_first() else {
            return Err(ProtocolError::UnknownCommand(String::new()));
        };
        match head {
            "project_folder" => {
                if rest.is_empty() {
                    return Err(ProtocolError::Truncated { command: "project_folder", expected: 1, got: 0 });
                }
                Ok(ServerMessage::ProjectFolder { cwd: rest[0].to_string() })
            }
            "goto_definition" => {
                if rest.len() < 3 {
                    return Err(ProtocolError::Truncated { command: "goto_definition", expected: 3, got: rest.len() });
                }
                Ok(ServerMessage::GotoDefinition {
                    def_file: rest[0].to_string(),
                    def_line: parse_u32("def_line", rest[1])?,
                    def_col: parse_u32("def_col", rest[2])?,
                })
            }
            "reload_success" => Ok(ServerMessage::ReloadSuccess),
            "reload_failure" => Ok(ServerMessage::ReloadFailure),
            "debug_break" => {
                if rest.len() < 3 {
                    return Err(ProtocolError::Truncated { command: "debug_break", expected: 3, got: rest.len() });
                }
                Ok(ServerMessage::DebugBreak {
                    ctx: rest[0].to_string(),
                    line: parse_u32("line", rest[1])?,
                    file: rest[2].to_string(),
                })
            }
            "debug_continue" => {
                if rest.is_empty() {
                    return Err(ProtocolError::Truncated { command: "debug_continue", expected: 1, got: 0 });
                }
                Ok(ServerMessage::DebugContinue { ctx: rest[0].to_string() })
            }
            "debug_output" => {
                if rest.is_empty() {
                    return Err(ProtocolError::Truncated { command: "debug_output", expected: 1, got: 0 });
                }
                Ok(ServerMessage::DebugOutput { msg: rest[0].to_string() })
            }
            "error" => {
                if rest.len() < 5 {
                    return Err(ProtocolError::Truncated { command: "error", expected: 5, got: rest.len() });
                }
                Ok(ServerMessage::Error {
                    file: rest[0].to_string(),
                    line: parse_u32("line", rest[1])?,
                    col: parse_u32("col", rest[2])?,
                    msg: rest[3].to_string(),
                    warn_id: rest[4].to_string(),
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_file_round_trips() {
        let cmd = ClientCommand::QueryFile { path: "main.raya".into() };
        let lines = cmd.to_lines();
        let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (parsed, rest) = ClientCommand::parse(&borrowed).unwrap();
        assert_eq!(parsed, cmd);
        assert!(rest.is_empty());
    }

    #[test]
    fn goto_definition_round_trips() {
        let cmd = ClientCommand::GotoDefinition { file: "a.raya".into(), col: 4, line: 10 };
        let lines = cmd.to_lines();
        let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (parsed, _) = ClientCommand::parse(&borrowed).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn step_commands_carry_context_name() {
        let borrowed = ["step_over", "ctx1"];
        let (parsed, _) = ClientCommand::parse(&borrowed).unwrap();
        assert_eq!(parsed, ClientCommand::StepOver { ctx: "ctx1".into() });
    }

    #[test]
    fn unknown_command_is_rejected() {
        let borrowed = ["not_a_command"];
        assert!(matches!(ClientCommand::parse(&borrowed), Err(ProtocolError::UnknownCommand(_))));
    }

    #[test]
    fn truncated_command_is_rejected() {
        let borrowed = ["toggle_breakpoint", "a.raya"];
        assert!(matches!(
            ClientCommand::parse(&borrowed),
            Err(ProtocolError::Truncated { command: "command", expected: 2, .. })
        ));
    }

    #[test]
    fn debug_break_push_round_trips() {
        let msg = ServerMessage::DebugBreak { ctx: "main".into(), line: 12, file: "a.raya".into() };
        let lines = msg.to_lines();
        let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
        assert_eq!(ServerMessage::parse(&borrowed).unwrap(), msg);
    }

    #[test]
    fn error_push_round_trips() {
        let msg = ServerMessage::Error {
            file: "a.raya".into(),
            line: 3,
            col: 7,
            msg: "unexpected token".into(),
            warn_id: "E001".into(),
        };
        let lines = msg.to_lines();
        let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
        assert_eq!(ServerMessage::parse(&borrowed).unwrap(), msg);
    }

    #[test]
    fn getcontexts_lists_every_name() {
        let msg = ServerMessage::Contexts { names: vec!["a".into(), "b".into(), "c".into()] };
        assert_eq!(msg.to_lines(), vec!["getcontexts", "a", "b", "c"]);
    }
}
