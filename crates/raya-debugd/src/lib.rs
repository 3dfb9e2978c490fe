//! The Raya debug-server wire protocol (spec §6): message types only.
//!
//! Per spec §1's explicit Non-goal, the network transport itself ("the
//! debug server's network transport ... socket code is not [in scope]") is
//! not part of this crate. What is in scope is everything spec §6 actually
//! describes: the line-oriented command/reply/push shapes
//! ([`protocol::ClientCommand`], [`protocol::ServerMessage`]) and how those
//! map onto the [`raya_core::ExecutionContext`] operations a host has
//! already built ([`dispatch::Dispatcher`]).

#![warn(rust_2018_idioms)]

pub mod dispatch;
pub mod protocol;

pub use dispatch::Dispatcher;
pub use protocol::{CallStackFrame, ClientCommand, ProtocolError, ServerMessage};
