//! The native-call ABI's Rust-side marshalling layer (spec §4.9, §6).
//!
//! A native function "receives a `&Stack`. It may read args off the top,
//! pop them, and push up to the number of slots the code generator reserved
//! at the call site" — the wire contract is just words on the bytecode
//! stack. [`FromStack`]/[`ToStack`] give that contract typed edges so
//! `raya-native`'s wrapper macros can generate the pop/push glue instead of
//! handwriting it per function. Receiver dispatch for `NMCALL` goes through
//! `thisPtr` (already loaded by the caller's `LOADTHIS`), not an extra
//! stack slot, per spec §4.9 "native functions must not... alter `thisPtr`
//! outside of `CallMethod`-style helpers".

use crate::object::RawObjectPtr;
use crate::stack::Stack;
use crate::vm::interpreter::{NativeDispatch, RuntimeError};

/// Pull a typed value off the top of the stack, in argument-popping order.
///
/// Implementations pop exactly the words their wire representation occupies
/// and must leave the stack untouched on error.
pub trait FromStack: Sized {
    /// Number of stack words this type occupies.
    const WORDS: usize;

    /// Pop one value off the top of `stack`.
    fn from_stack(stack: &mut Stack) -> Result<Self, RuntimeError>;
}

/// Push a typed value's wire representation onto the stack.
pub trait ToStack {
    /// Number of stack words this type occupies.
    const WORDS: usize;

    /// Push `self` onto `stack`.
    fn to_stack(self, stack: &mut Stack) -> Result<(), RuntimeError>;
}

macro_rules! impl_int_abi {
    ($ty:ty, $get:ident, $push:ident) => {
        impl FromStack for $ty {
            const WORDS: usize = 1;
            fn from_stack(stack: &mut Stack) -> Result<Self, RuntimeError> {
                let v = stack.$get(0)?;
                stack.pop(1)?;
                Ok(v as $ty)
            }
        }
        impl ToStack for $ty {
            const WORDS: usize = 1;
            fn to_stack(self, stack: &mut Stack) -> Result<(), RuntimeError> {
                stack.$push(self as _)?;
                Ok(())
            }
        }
    };
}

impl_int_abi!(i32, get_int, push_int);
impl_int_abi!(u32, get_int, push_int);
impl_int_abi!(i64, get_long, push_long);
impl_int_abi!(u64, get_ptr, push_ptr);

impl FromStack for bool {
    const WORDS: usize = 1;
    fn from_stack(stack: &mut Stack) -> Result<Self, RuntimeError> {
        let v = stack.get_int(0)?;
        stack.pop(1)?;
        Ok(v != 0)
    }
}
impl ToStack for bool {
    const WORDS: usize = 1;
    fn to_stack(self, stack: &mut Stack) -> Result<(), RuntimeError> {
        stack.push_int(self as i32)?;
        Ok(())
    }
}

impl FromStack for f32 {
    const WORDS: usize = 1;
    fn from_stack(stack: &mut Stack) -> Result<Self, RuntimeError> {
        let v = stack.get_float(0)?;
        stack.pop(1)?;
        Ok(v)
    }
}
impl ToStack for f32 {
    const WORDS: usize = 1;
    fn to_stack(self, stack: &mut Stack) -> Result<(), RuntimeError> {
        stack.push_float(self)?;
        Ok(())
    }
}

impl FromStack for f64 {
    const WORDS: usize = 1;
    fn from_stack(stack: &mut Stack) -> Result<Self, RuntimeError> {
        let v = stack.get_double(0)?;
        stack.pop(1)?;
        Ok(v)
    }
}
impl ToStack for f64 {
    const WORDS: usize = 1;
    fn to_stack(self, stack: &mut Stack) -> Result<(), RuntimeError> {
        stack.push_double(self)?;
        Ok(())
    }
}

impl FromStack for RawObjectPtr {
    const WORDS: usize = 1;
    fn from_stack(stack: &mut Stack) -> Result<Self, RuntimeError> {
        let word = stack.get_ptr(0)?;
        stack.pop(1)?;
        unsafe { RawObjectPtr::from_word(word) }.ok_or(RuntimeError::NullDereference)
    }
}
impl ToStack for RawObjectPtr {
    const WORDS: usize = 1;
    fn to_stack(self, stack: &mut Stack) -> Result<(), RuntimeError> {
        stack.push_ptr(self.as_word())?;
        Ok(())
    }
}

impl ToStack for () {
    const WORDS: usize = 0;
    fn to_stack(self, _stack: &mut Stack) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Signature every `#[raya_native::function]`-generated wrapper and every
/// hand-written native function conforms to: pop args, push results, report
/// a trap instead of unwinding.
pub type NativeFn = fn(&mut Stack) -> Result<(), RuntimeError>;

/// An index-keyed table of native functions/methods, implementing
/// [`NativeDispatch`] by direct array lookup. `raya-native`'s generated
/// `register` calls populate one of these; the host links it into an
/// [`crate::vm::context::ExecutionContext`] alongside the compiled
/// program's native-function table (matched up by name at link time,
/// spec §3 "lookup is by fully qualified string name at link time,
/// yielding a stable index").
#[derive(Default)]
pub struct NativeRegistry {
    functions: Vec<(String, NativeFn)>,
    methods: Vec<(String, NativeFn)>,
}

impl NativeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native (static) function, returning the index `NCALL`
    /// sites should be linked against.
    pub fn register_function(&mut self, name: impl Into<String>, f: NativeFn) -> u32 {
        self.functions.push((name.into(), f));
        (self.functions.len() - 1) as u32
    }

    /// Register a native method, returning the index `NMCALL` sites should
    /// be linked against.
    pub fn register_method(&mut self, name: impl Into<String>, f: NativeFn) -> u32 {
        self.methods.push((name.into(), f));
        (self.methods.len() - 1) as u32
    }

    /// Resolve a previously registered function's index by name (used at
    /// link time to translate the program's [`raya_bytecode::module::NativeFunctionSig`]
    /// table into call-site indices).
    pub fn find_function_index(&self, name: &str) -> Option<u32> {
        self.functions.iter().position(|(n, _)| n == name).map(|i| i as u32)
    }

    /// Resolve a previously registered method's index by name.
    pub fn find_method_index(&self, name: &str) -> Option<u32> {
        self.methods.iter().position(|(n, _)| n == name).map(|i| i as u32)
    }
}

impl NativeDispatch for NativeRegistry {
    fn call_function(
        &mut self,
        index: u32,
        stack: &mut Stack,
        globals: &mut [u8],
    ) -> Result<(), RuntimeError> {
        let (_, f) = self
            .functions
            .get(index as usize)
            .ok_or(RuntimeError::NullDereference)?;
        let _ = globals;
        f(stack)
    }

    fn call_method(
        &mut self,
        index: u32,
        stack: &mut Stack,
        globals: &mut [u8],
    ) -> Result<(), RuntimeError> {
        let (_, f) = self
            .methods
            .get(index as usize)
            .ok_or(RuntimeError::NullDereference)?;
        let _ = globals;
        f(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double_it(stack: &mut Stack) -> Result<(), RuntimeError> {
        let a = i32::from_stack(stack)?;
        (a * 2).to_stack(stack)
    }

    #[test]
    fn registry_dispatches_by_index() {
        let mut registry = NativeRegistry::new();
        let idx = registry.register_function("double_it", double_it);
        let mut stack = Stack::new(16);
        let mut globals = Vec::new();
        stack.push_int(21).unwrap();
        registry.call_function(idx, &mut stack, &mut globals).unwrap();
        assert_eq!(stack.get_int(0).unwrap(), 42);
    }

    #[test]
    fn find_index_looks_up_by_name() {
        let mut registry = NativeRegistry::new();
        registry.register_function("double_it", double_it);
        assert_eq!(registry.find_function_index("double_it"), Some(0));
        assert_eq!(registry.find_function_index("missing"), None);
    }
}
