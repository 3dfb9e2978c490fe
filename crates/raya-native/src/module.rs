// #[module] proc-macro implementation
//
// Validates the shape of a native module's registration function. There is
// no dynamic-loading ABI in scope here (spec §1 excludes the front-end/host
// tooling around native modules, only the native-call ABI itself, §4.9/§6,
// is specified) — a host links a `raya_core::NativeRegistry` into its
// `ExecutionContext` directly, so `#[module]` is a compile-time contract
// check rather than a codegen step that invents FFI surface the spec
// doesn't describe.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{ItemFn, Result};

/// Expands the `#[module]` attribute macro.
///
/// Must be applied to a parameterless function named `init` returning
/// `raya_core::NativeRegistry`; each native function it registers should
/// already carry `#[raya_native::function]`, handing `register_function`/
/// `register_method` the generated `<name>_ffi` pointer.
///
/// ```ignore
/// #[function]
/// fn add(a: i32, b: i32) -> i32 { a + b }
///
/// #[module]
/// fn init() -> raya_core::NativeRegistry {
///     let mut registry = raya_core::NativeRegistry::new();
///     registry.register_function("add", add_ffi);
///     registry
/// }
/// ```
pub fn expand_module(func: ItemFn) -> Result<TokenStream> {
    if func.sig.ident != "init" {
        return Err(syn::Error::new_spanned(
            &func.sig.ident,
            "#[module] must be applied to a function named 'init'",
        ));
    }

    if !func.sig.inputs.is_empty() {
        return Err(syn::Error::new_spanned(
            &func.sig.inputs,
            "a module's init function must not take parameters",
        ));
    }

    let returns_native_registry = match &func.sig.output {
        syn::ReturnType::Type(_, ty) => {
            if let syn::Type::Path(type_path) = &**ty {
                type_path
                    .path
                    .segments
                    .last()
                    .map(|s| s.ident == "NativeRegistry")
                    .unwrap_or(false)
            } else {
                false
            }
        }
        _ => false,
    };

    if !returns_native_registry {
        return Err(syn::Error::new_spanned(
            &func.sig.output,
            "a module's init function must return raya_core::NativeRegistry",
        ));
    }

    Ok(quote! { #func })
}
