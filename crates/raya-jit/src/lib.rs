//! Cranelift-backed tiered JIT for the Raya VM (spec §4.6).
//!
//! This crate never touches `raya-core` beyond the [`raya_core::vm::context::JitEngine`]
//! trait object boundary it implements: the interpreter has no idea whether a
//! given call is served by compiled code or not, and neither does a host.
//!
//! The compiled subset is deliberately narrow — see [`eligibility`] for the
//! exact opcode allowlist and the reasoning behind it (no calls, no `this`,
//! no locals/globals, integers only). [`codegen`] lowers an
//! [`eligibility::EligibleFunction`] straight into Cranelift IR without an
//! intermediate JIT-specific IR: the stack-machine semantics map cleanly
//! enough onto Cranelift's own SSA construction (via `Variable`/`use_var`/
//! `def_var`, exactly as Cranelift's own frontend is designed to be driven)
//! that a separate IR layer would only duplicate what Cranelift already
//! does. [`cache`] stores compiled entry points keyed by `(program, pc)` and
//! [`engine`] ties it together behind the tiered `try_run`/`invalidate`
//! contract, compiling on a background thread once a `pc` crosses a call-count
//! threshold rather than blocking the caller on first sight (spec §4.6
//! "tiered").

pub mod cache;
pub mod codegen;
pub mod eligibility;
pub mod engine;
mod lower;

pub use eligibility::{analyze, EligibleFunction, Ineligible};
pub use engine::{CraneliftJit, JitConfig};
