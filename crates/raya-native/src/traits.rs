// Codegen helpers shared by `function.rs`: small `quote!` snippets kept out
// of the macro-expansion function body so that one reads as plain assembly
// of parts instead of one wall of `quote!`.
//
// The marshalling contract itself (`FromStack`/`ToStack`) lives in
// `raya_core::abi` (spec §4.9/§6 — a native function "receives a `&Stack`");
// this module only emits calls into it.

use proc_macro2::TokenStream;
use quote::quote;

/// Pops one typed argument off the stack via `raya_core::FromStack`.
///
/// Arguments are popped in reverse declaration order: the caller pushes them
/// in declared order (spec §4.9), so the last-declared argument is the one
/// sitting on top and must come off first.
pub fn generate_arg_pop(arg_name: &syn::Ident, arg_type: &syn::Type) -> TokenStream {
    quote! {
        let #arg_name = <#arg_type as raya_core::FromStack>::from_stack(stack)?;
    }
}

/// Pushes the wrapped function's return value via `raya_core::ToStack`.
pub fn generate_result_push(result: &syn::Ident) -> TokenStream {
    quote! {
        raya_core::ToStack::to_stack(#result, stack)?;
    }
}
