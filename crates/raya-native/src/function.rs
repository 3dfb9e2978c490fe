// #[function] proc-macro implementation
//
// Generates a `raya_core::NativeFn`-shaped wrapper around a plain Rust
// function so it can be registered with a `raya_core::NativeRegistry`
// (spec §4.9/§6: a native function "receives a `&Stack`. It may read args
// off the top, pop them, and push up to the number of slots the code
// generator reserved at the call site").

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{ItemFn, Result};

use crate::traits::{generate_arg_pop, generate_result_push};

/// Expands the `#[function]` attribute macro.
///
/// Input: a plain Rust function.
/// Output: the original function, plus a sibling `<name>_ffi` wrapper with
/// signature `fn(&mut raya_core::Stack) -> Result<(), raya_core::RuntimeError>`
/// — the exact shape of `raya_core::NativeFn`, ready to hand to
/// `NativeRegistry::register_function`/`register_method`.
///
/// ```ignore
/// #[function]
/// fn add(a: i32, b: i32) -> i32 {
///     a + b
/// }
///
/// // generates:
/// fn add_ffi(stack: &mut raya_core::Stack) -> Result<(), raya_core::RuntimeError> {
///     let b = <i32 as raya_core::FromStack>::from_stack(stack)?;
///     let a = <i32 as raya_core::FromStack>::from_stack(stack)?;
///     let result = add(a, b);
///     raya_core::ToStack::to_stack(result, stack)?;
///     Ok(())
/// }
/// ```
pub fn expand_function(func: ItemFn) -> Result<TokenStream> {
    if func.sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            &func.sig,
            "#[function] does not support async fn: native calls run synchronously \
             on the bytecode stack (spec §5 has no suspension point for a native call)",
        ));
    }

    let func_name = &func.sig.ident;
    let ffi_name = format_ident!("{}_ffi", func_name);

    let mut arg_names = Vec::new();
    let mut arg_types = Vec::new();
    for arg in &func.sig.inputs {
        match arg {
            syn::FnArg::Typed(pat_type) => {
                if let syn::Pat::Ident(pat_ident) = &*pat_type.pat {
                    arg_names.push(pat_ident.ident.clone());
                    arg_types.push((*pat_type.ty).clone());
                } else {
                    return Err(syn::Error::new_spanned(
                        arg,
                        "only simple identifiers are supported as #[function] arguments",
                    ));
                }
            }
            syn::FnArg::Receiver(_) => {
                return Err(syn::Error::new_spanned(
                    arg,
                    "methods (self) are not supported in #[function]; use a plain function \
                     taking the receiver as its first argument instead",
                ));
            }
        }
    }

    // Pop in reverse (last-pushed argument is on top), then call the
    // original function in its natural declared order.
    let pops: Vec<TokenStream> = arg_names
        .iter()
        .zip(arg_types.iter())
        .rev()
        .map(|(name, ty)| generate_arg_pop(name, ty))
        .collect();

    let result_ident = format_ident!("__raya_result");
    let push_result = generate_result_push(&result_ident);

    let call_args = arg_names.iter();

    let wrapper = quote! {
        #func

        /// Generated by `#[raya_native::function]`: the `raya_core::NativeFn`
        /// wrapper for the function above.
        #[allow(non_snake_case)]
        pub fn #ffi_name(stack: &mut raya_core::Stack) -> ::std::result::Result<(), raya_core::RuntimeError> {
            #(#pops)*
            let #result_ident = #func_name(#(#call_args),*);
            #push_result
            Ok(())
        }
    };

    Ok(wrapper)
}
