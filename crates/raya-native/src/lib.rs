// raya-native: ergonomic Rust-side wrapper macros for the native-call ABI
// (spec §4.9/§6).
//
// Provides two proc-macros:
// - #[function] wraps a plain Rust function into the `raya_core::NativeFn`
//   shape (`fn(&mut Stack) -> Result<(), RuntimeError>`), generating the
//   argument-pop/result-push glue via `raya_core::{FromStack, ToStack}`.
// - #[module] checks that a registration function has the shape a host
//   expects (`fn init() -> raya_core::NativeRegistry`).
//
// Example:
// ```ignore
// use raya_native::{function, module};
//
// #[function]
// fn add(a: i32, b: i32) -> i32 {
//     a + b
// }
//
// #[module]
// fn init() -> raya_core::NativeRegistry {
//     let mut registry = raya_core::NativeRegistry::new();
//     registry.register_function("add", add_ffi);
//     registry
// }
// ```

use proc_macro::TokenStream;
use syn::{parse_macro_input, ItemFn};

mod function;
mod module;
mod traits;

/// Marks a Rust function as a native module function.
///
/// Generates a sibling `<name>_ffi` wrapper with the exact signature of
/// `raya_core::NativeFn`: it pops each argument off the stack (in reverse
/// declaration order, since the caller pushed them in order and the last one
/// is on top), calls the original function, and pushes its return value.
///
/// # Example
///
/// ```ignore
/// #[function]
/// fn greet(name_len: i32) -> i32 {
///     name_len + 1
/// }
/// ```
///
/// This generates `greet_ffi`, registerable with
/// `NativeRegistry::register_function`/`register_method`.
#[proc_macro_attribute]
pub fn function(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    function::expand_function(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

/// Validates a native module's registration function.
///
/// Must be applied to a parameterless function named `init` that returns
/// `raya_core::NativeRegistry`. There's no codegen here beyond the
/// signature check — a host calls `init()` directly and links the resulting
/// registry into its `ExecutionContext` (spec §4.7/§4.9); no dynamic-loading
/// ABI is in scope.
///
/// # Example
///
/// ```ignore
/// #[function]
/// fn add(a: i32, b: i32) -> i32 {
///     a + b
/// }
///
/// #[module]
/// fn init() -> raya_core::NativeRegistry {
///     let mut registry = raya_core::NativeRegistry::new();
///     registry.register_function("add", add_ffi);
///     registry
/// }
/// ```
#[proc_macro_attribute]
pub fn module(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    module::expand_module(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}
