//! Dynamic-array methods (spec §4.4, §4.7 `ArrayInterface`).
//!
//! Per spec §1's Non-goal ("native collection types... the core... knows
//! only their memory layout"), the element type itself is out of scope; we
//! fix the element width at one [`raya_core::Word`] (8 bytes). A real
//! front-end would emit per-element-size variants or pass a size alongside,
//! but [`ExecutionContext::array_interface`] only ever forwards three words
//! (`array_ptr, param, int_param`), so a fixed element width is the only
//! reading of "knows only memory layout" that fits the existing call frame
//! without inventing a fourth ABI parameter (documented in `DESIGN.md`).
//!
//! Layout: `array_ptr` addresses a 3-word header `{data, len, cap}`
//! (mirroring `Vec`'s own shape) that the host or a struct member owns;
//! the element buffer is a separate heap allocation this module manages.

use raya_core::vm::interpreter::RuntimeError;
use raya_core::{Stack, Word};

#[repr(C)]
struct ArrayHeader {
    data: u64,
    len: u64,
    cap: u64,
}

unsafe fn header<'a>(array_ptr: u64) -> &'a mut ArrayHeader {
    &mut *(array_ptr as *mut ArrayHeader)
}

unsafe fn grow_to(h: &mut ArrayHeader, new_cap: u64) {
    if new_cap <= h.cap {
        return;
    }
    let word_size = std::mem::size_of::<Word>();
    let layout = std::alloc::Layout::array::<u8>(new_cap as usize * word_size).unwrap();
    let new_data = std::alloc::alloc_zeroed(layout) as u64;
    if h.data != 0 && h.len > 0 {
        std::ptr::copy_nonoverlapping(
            h.data as *const u8,
            new_data as *mut u8,
            h.len as usize * word_size,
        );
    }
    if h.data != 0 && h.cap > 0 {
        let old_layout = std::alloc::Layout::array::<u8>(h.cap as usize * word_size).unwrap();
        std::alloc::dealloc(h.data as *mut u8, old_layout);
    }
    h.data = new_data;
    h.cap = new_cap;
}

fn require_ptr(stack: &mut Stack, i: usize) -> Result<u64, RuntimeError> {
    let v = stack.get_ptr(i)?;
    if v == 0 {
        return Err(RuntimeError::NullDereference);
    }
    Ok(v)
}

/// `ARRAY_RESIZE(array_ptr, _, new_len)`.
pub fn resize(stack: &mut Stack) -> Result<(), RuntimeError> {
    let array_ptr = require_ptr(stack, 2)?;
    let new_len = stack.get_int(0)? as u64;
    let h = unsafe { header(array_ptr) };
    if new_len > h.cap {
        unsafe { grow_to(h, new_len.max(h.cap * 2).max(4)) };
    }
    h.len = new_len;
    Ok(())
}

/// `ARRAY_RESERVE(array_ptr, _, new_cap)`.
pub fn reserve(stack: &mut Stack) -> Result<(), RuntimeError> {
    let array_ptr = require_ptr(stack, 2)?;
    let new_cap = stack.get_int(0)? as u64;
    let h = unsafe { header(array_ptr) };
    unsafe { grow_to(h, new_cap) };
    Ok(())
}

/// `ARRAY_PUSH(array_ptr, value, _)`.
pub fn push(stack: &mut Stack) -> Result<(), RuntimeError> {
    let array_ptr = require_ptr(stack, 2)?;
    let value = stack.get_ptr(1)?;
    let h = unsafe { header(array_ptr) };
    if h.len == h.cap {
        unsafe { grow_to(h, (h.cap * 2).max(4)) };
    }
    unsafe { (h.data as *mut Word).add(h.len as usize).write(value) };
    h.len += 1;
    Ok(())
}

/// `ARRAY_POP(array_ptr, out_addr, _)`: `out_addr == 0` discards the value.
pub fn pop(stack: &mut Stack) -> Result<(), RuntimeError> {
    let array_ptr = require_ptr(stack, 2)?;
    let out_addr = stack.get_ptr(1)?;
    let h = unsafe { header(array_ptr) };
    if h.len == 0 {
        return Err(RuntimeError::IndexOutOfBounds { index: -1, limit: 0 });
    }
    h.len -= 1;
    let value = unsafe { (h.data as *const Word).add(h.len as usize).read() };
    if out_addr != 0 {
        unsafe { (out_addr as *mut Word).write(value) };
    }
    Ok(())
}

/// `ARRAY_CLEAR(array_ptr, _, _)`.
pub fn clear(stack: &mut Stack) -> Result<(), RuntimeError> {
    let array_ptr = require_ptr(stack, 2)?;
    unsafe { header(array_ptr) }.len = 0;
    Ok(())
}

/// `ARRAY_ERASE(array_ptr, _, index)`: order-preserving removal.
pub fn erase(stack: &mut Stack) -> Result<(), RuntimeError> {
    let array_ptr = require_ptr(stack, 2)?;
    let index = stack.get_int(0)? as u64;
    let h = unsafe { header(array_ptr) };
    if index >= h.len {
        return Err(RuntimeError::IndexOutOfBounds { index: index as i32, limit: h.len as i32 });
    }
    unsafe {
        let base = h.data as *mut Word;
        std::ptr::copy(base.add(index as usize + 1), base.add(index as usize), (h.len - index - 1) as usize);
    }
    h.len -= 1;
    Ok(())
}

/// `ARRAY_ERASE_FAST(array_ptr, _, index)`: swap-with-last removal.
pub fn erase_fast(stack: &mut Stack) -> Result<(), RuntimeError> {
    let array_ptr = require_ptr(stack, 2)?;
    let index = stack.get_int(0)? as u64;
    let h = unsafe { header(array_ptr) };
    if index >= h.len {
        return Err(RuntimeError::IndexOutOfBounds { index: index as i32, limit: h.len as i32 });
    }
    unsafe {
        let base = h.data as *mut Word;
        let last = base.add((h.len - 1) as usize).read();
        base.add(index as usize).write(last);
    }
    h.len -= 1;
    Ok(())
}

/// `ARRAY_INSERT(array_ptr, value, index)`.
pub fn insert(stack: &mut Stack) -> Result<(), RuntimeError> {
    let array_ptr = require_ptr(stack, 2)?;
    let value = stack.get_ptr(1)?;
    let index = stack.get_int(0)? as u64;
    let h = unsafe { header(array_ptr) };
    if index > h.len {
        return Err(RuntimeError::IndexOutOfBounds { index: index as i32, limit: h.len as i32 });
    }
    if h.len == h.cap {
        unsafe { grow_to(h, (h.cap * 2).max(4)) };
    }
    unsafe {
        let base = h.data as *mut Word;
        std::ptr::copy(base.add(index as usize), base.add(index as usize + 1), (h.len - index) as usize);
        base.add(index as usize).write(value);
    }
    h.len += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_header() -> ArrayHeader {
        ArrayHeader { data: 0, len: 0, cap: 0 }
    }

    /// Mirrors `ExecutionContext::array_interface`'s push order: `array_ptr`
    /// first (deepest), then `param`, then `int_param` (topmost).
    fn push_frame(stack: &mut Stack, array_ptr: u64, param: u64, int_param: i32) {
        stack.push_ptr(array_ptr).unwrap();
        stack.push_ptr(param).unwrap();
        stack.push_int(int_param).unwrap();
    }

    #[test]
    fn push_then_pop_round_trips() {
        let mut h = new_header();
        let array_ptr = &mut h as *mut ArrayHeader as u64;
        let mut stack = Stack::new(64);

        push_frame(&mut stack, array_ptr, 42, 0);
        push(&mut stack).unwrap();
        stack.pop(3).unwrap();
        assert_eq!(h.len, 1);

        let mut out = 0u64;
        push_frame(&mut stack, array_ptr, &mut out as *mut u64 as u64, 0);
        pop(&mut stack).unwrap();
        stack.pop(3).unwrap();
        assert_eq!(out, 42);
        assert_eq!(h.len, 0);
    }

    #[test]
    fn erase_fast_swaps_with_last() {
        let mut h = new_header();
        let array_ptr = &mut h as *mut ArrayHeader as u64;
        let mut stack = Stack::new(64);
        for v in [10u64, 20, 30] {
            push_frame(&mut stack, array_ptr, v, 0);
            push(&mut stack).unwrap();
            stack.pop(3).unwrap();
        }
        push_frame(&mut stack, array_ptr, 0, 0);
        erase_fast(&mut stack).unwrap();
        stack.pop(3).unwrap();
        assert_eq!(h.len, 2);
        let slice = unsafe { std::slice::from_raw_parts(h.data as *const u64, 2) };
        assert_eq!(slice, &[30, 20]);
    }
}
