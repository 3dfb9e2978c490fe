//! Smart-pointer refcount primitives (spec §4.4): "the only code allowed to
//! mutate the `strong/weakRefCount` fields directly."
//!
//! These all need the owning object's size/alignment to free it, which
//! means they need the type table — supplied by [`crate::StandardBuiltins`]
//! via its `type_of` lookup (the object header only carries a vtable
//! offset, not a type index, so resolving one requires the reverse map
//! `StandardBuiltins` builds at construction).

use std::sync::atomic::Ordering;

use raya_bytecode::module::DataType;
use raya_core::object::{dealloc_object, RawObjectPtr};
use raya_core::vm::interpreter::RuntimeError;
use raya_core::Stack;

/// Resolves an object's [`DataType`] from its header's vtable offset.
pub trait TypeOf {
    fn type_of(&self, ptr: RawObjectPtr) -> Option<&DataType>;
}

fn read_ptr(stack: &mut Stack) -> Result<Option<RawObjectPtr>, RuntimeError> {
    let word = stack.get_ptr(0)?;
    stack.pop(1)?;
    Ok(unsafe { RawObjectPtr::from_word(word) })
}

/// `ADD_STRONG(ptr)`: increments strong count iff the pointer is non-null.
pub fn add_strong(stack: &mut Stack) -> Result<(), RuntimeError> {
    if let Some(ptr) = read_ptr(stack)? {
        ptr.header().strong_ref_count.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

/// `ADD_STRONG_AFTER_NEW(ptr)`: like [`add_strong`], plus the engine's
/// "new object" callback for native mirror setup.
pub fn add_strong_after_new(
    stack: &mut Stack,
    on_new_object: Option<&(dyn Fn(RawObjectPtr) + Send + Sync)>,
) -> Result<(), RuntimeError> {
    if let Some(ptr) = read_ptr(stack)? {
        ptr.header().strong_ref_count.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = on_new_object {
            cb(ptr);
        }
    }
    Ok(())
}

/// `DEC_STRONG(ptr)`: decrements strong count, pushes the new value back so
/// the caller can branch on zero.
pub fn dec_strong(stack: &mut Stack) -> Result<(), RuntimeError> {
    match read_ptr(stack)? {
        Some(ptr) => {
            let prev = ptr.header().strong_ref_count.fetch_sub(1, Ordering::Release);
            if prev == 1 {
                std::sync::atomic::fence(Ordering::Acquire);
            }
            stack.push_int((prev - 1) as i32)?;
        }
        None => stack.push_int(0)?,
    }
    Ok(())
}

/// `STRONG_ZERO(ptr)`: strong count has already reached zero; decrement the
/// weak count (the strong group held one weak reference) and free the
/// object if that also reaches zero.
pub fn strong_zero(
    stack: &mut Stack,
    types: &dyn TypeOf,
) -> Result<(), RuntimeError> {
    if let Some(ptr) = read_ptr(stack)? {
        dec_weak_ptr(ptr, types);
    }
    Ok(())
}

/// `ADD_WEAK(ptr)`.
pub fn add_weak(stack: &mut Stack) -> Result<(), RuntimeError> {
    if let Some(ptr) = read_ptr(stack)? {
        ptr.header().weak_ref_count.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

/// `DEC_WEAK(slot_addr)`: takes the *address of the pointer slot* (not the
/// pointer itself) since it may need to null the caller's copy. Decrements
/// the weak count; frees on zero; nulls the slot if the strong count is
/// already zero (spec §4.4).
pub fn dec_weak(stack: &mut Stack, types: &dyn TypeOf) -> Result<(), RuntimeError> {
    let slot_addr = stack.get_ptr(0)?;
    stack.pop(1)?;
    if slot_addr == 0 {
        return Err(RuntimeError::NullDereference);
    }
    let slot = slot_addr as *mut u64;
    let word = unsafe { slot.read_unaligned() };
    let Some(ptr) = (unsafe { RawObjectPtr::from_word(word) }) else {
        return Ok(());
    };
    let strong_now_zero = ptr.header().strong_ref_count.load(Ordering::Acquire) == 0;
    dec_weak_ptr(ptr, types);
    if strong_now_zero {
        unsafe { slot.write_unaligned(0) };
    }
    Ok(())
}

/// `FIX_WEAK(slot_addr)`: used on load/copy of a weak reference; nulls the
/// slot if the strong count has already reached zero.
pub fn fix_weak(stack: &mut Stack) -> Result<(), RuntimeError> {
    let slot_addr = stack.get_ptr(0)?;
    stack.pop(1)?;
    if slot_addr == 0 {
        return Err(RuntimeError::NullDereference);
    }
    let slot = slot_addr as *mut u64;
    let word = unsafe { slot.read_unaligned() };
    if let Some(ptr) = unsafe { RawObjectPtr::from_word(word) } {
        if ptr.header().strong_ref_count.load(Ordering::Acquire) == 0 {
            unsafe { slot.write_unaligned(0) };
        }
    }
    Ok(())
}

/// `ISA(ptr, type_name)`: dynamic-cast test via the object's runtime type's
/// sorted base-chain. `BuiltinDispatch::call` has no access to the linked
/// program's constant pool, so the name arrives as an ordinary string value
/// (the two words `STRING_LOAD`/a string literal would already leave on the
/// stack) rather than a constant-pool index; the caller still owns and frees
/// it like any other by-value string argument.
pub fn isa(stack: &mut Stack, types: &dyn TypeOf) -> Result<(), RuntimeError> {
    let name_ptr = stack.get_ptr(0)?;
    let name_len = stack.get_ptr(1)?;
    let ptr = stack.get_ptr(2)?;
    stack.pop(3)?;
    let name = unsafe { std::str::from_utf8_unchecked(crate::string::read_buffer(name_ptr, name_len)) };
    let result = unsafe { RawObjectPtr::from_word(ptr) }
        .and_then(|p| types.type_of(p))
        .is_some_and(|dt| dt.isa(name));
    stack.push_int(result as i32)?;
    Ok(())
}

fn dec_weak_ptr(ptr: RawObjectPtr, types: &dyn TypeOf) {
    let prev = ptr.header().weak_ref_count.fetch_sub(1, Ordering::Release);
    if prev == 1 {
        std::sync::atomic::fence(Ordering::Acquire);
        let (size, align) = types
            .type_of(ptr)
            .map(|dt| (dt.size as usize, dt.align as usize))
            .unwrap_or((std::mem::size_of::<raya_core::ObjectHeader>(), 8));
        unsafe { dealloc_object(ptr, size, align) };
    }
}
