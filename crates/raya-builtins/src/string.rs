//! String value semantics (spec §4.4 "string value semantics (load, store,
//! cleanup, append, compare)" and "numeric-to-string conversions").
//!
//! A string value is the 2-word `{data_ptr, len}` slot spec §4.2 describes
//! ("String slots occupy `ceil(sizeof(String)/word)` words"); each slot owns
//! a heap buffer allocated here. Builtins that take a string *by value* pop
//! it straight off the stack and own its destruction; builtins that take a
//! string *by reference* (an address of a 2-word slot living in a local,
//! global, or struct member) read/write through that pointer instead,
//! mirroring the `PLoad*`/`PStore*` indirect-access family.

use raya_core::vm::interpreter::RuntimeError;
use raya_core::Stack;

/// Allocate an owned heap buffer for a string slot's payload. Shared with
/// `refcount::isa` (the type name pushed before the call) and the crate
/// root (`BCALL_TRAP`'s error-message slot).
pub(crate) unsafe fn alloc_buffer(bytes: &[u8]) -> (u64, u64) {
    if bytes.is_empty() {
        return (0, 0);
    }
    let boxed: Box<[u8]> = bytes.to_vec().into_boxed_slice();
    let len = boxed.len() as u64;
    let ptr = Box::into_raw(boxed) as *mut u8 as u64;
    (ptr, len)
}

pub(crate) unsafe fn free_buffer(ptr: u64, len: u64) {
    if ptr != 0 {
        drop(Box::from_raw(std::slice::from_raw_parts_mut(ptr as *mut u8, len as usize)));
    }
}

pub(crate) unsafe fn read_buffer<'a>(ptr: u64, len: u64) -> &'a [u8] {
    if ptr == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr as *const u8, len as usize)
    }
}

unsafe fn read_slot(addr: u64) -> (u64, u64) {
    let p = addr as *const u64;
    (p.read_unaligned(), p.add(1).read_unaligned())
}

unsafe fn write_slot(addr: u64, ptr: u64, len: u64) {
    let p = addr as *mut u64;
    p.write_unaligned(ptr);
    p.add(1).write_unaligned(len);
}

/// `STRING_LOAD(src_addr)`: deep-copy the string slot at `*src_addr` and
/// push the copy.
pub fn load(stack: &mut Stack) -> Result<(), RuntimeError> {
    let src_addr = stack.get_ptr(0)?;
    stack.pop(1)?;
    if src_addr == 0 {
        return Err(RuntimeError::NullDereference);
    }
    let (ptr, len) = unsafe { read_slot(src_addr) };
    let (new_ptr, new_len) = unsafe { alloc_buffer(read_buffer(ptr, len)) };
    stack.push_string(new_ptr, new_len)?;
    Ok(())
}

/// `STRING_STORE(dst_addr)`: destroy whatever string currently lives at
/// `*dst_addr`, then move the string on top of the stack into it.
pub fn store(stack: &mut Stack) -> Result<(), RuntimeError> {
    let new_ptr = stack.get_ptr(0)?;
    let new_len = stack.get_ptr(1)?;
    let dst_addr = stack.get_ptr(2)?;
    stack.pop(3)?;
    if dst_addr == 0 {
        return Err(RuntimeError::NullDereference);
    }
    let (old_ptr, old_len) = unsafe { read_slot(dst_addr) };
    unsafe {
        free_buffer(old_ptr, old_len);
        write_slot(dst_addr, new_ptr, new_len);
    }
    Ok(())
}

/// `STRING_CLEANUP`: destroy the string on top of the stack (spec §4.2
/// "their destructor must run before the slot is popped").
pub fn cleanup(stack: &mut Stack) -> Result<(), RuntimeError> {
    let ptr = stack.get_ptr(0)?;
    let len = stack.get_ptr(1)?;
    stack.pop(2)?;
    unsafe { free_buffer(ptr, len) };
    Ok(())
}

/// `STRING_APPEND`: pop two strings by value, push their concatenation,
/// and free both inputs (spec §4.4 "a builtin that returns a string...
/// is responsible for destroying consumed string arguments").
pub fn append(stack: &mut Stack) -> Result<(), RuntimeError> {
    let rhs_ptr = stack.get_ptr(0)?;
    let rhs_len = stack.get_ptr(1)?;
    let lhs_ptr = stack.get_ptr(2)?;
    let lhs_len = stack.get_ptr(3)?;
    stack.pop(4)?;

    let mut combined = Vec::with_capacity((lhs_len + rhs_len) as usize);
    unsafe {
        combined.extend_from_slice(read_buffer(lhs_ptr, lhs_len));
        combined.extend_from_slice(read_buffer(rhs_ptr, rhs_len));
        free_buffer(lhs_ptr, lhs_len);
        free_buffer(rhs_ptr, rhs_len);
        let (new_ptr, new_len) = alloc_buffer(&combined);
        stack.push_string(new_ptr, new_len)?;
    }
    Ok(())
}

/// `STRING_COMPARE(lhs_addr, rhs_addr)`: lexicographic comparison, read-only
/// (no destructors run — comparisons take their operands by reference).
/// Pushes `-1`/`0`/`1`.
pub fn compare(stack: &mut Stack) -> Result<(), RuntimeError> {
    let rhs_addr = stack.get_ptr(0)?;
    let lhs_addr = stack.get_ptr(1)?;
    stack.pop(2)?;
    if lhs_addr == 0 || rhs_addr == 0 {
        return Err(RuntimeError::NullDereference);
    }
    let (lp, ll) = unsafe { read_slot(lhs_addr) };
    let (rp, rl) = unsafe { read_slot(rhs_addr) };
    let ordering = unsafe { read_buffer(lp, ll).cmp(read_buffer(rp, rl)) };
    stack.push_int(match ordering {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    })?;
    Ok(())
}

pub fn int_to_string(stack: &mut Stack) -> Result<(), RuntimeError> {
    let v = stack.get_int(0)?;
    stack.pop(1)?;
    let text = v.to_string();
    let (ptr, len) = unsafe { alloc_buffer(text.as_bytes()) };
    stack.push_string(ptr, len)?;
    Ok(())
}

pub fn float_to_string(stack: &mut Stack) -> Result<(), RuntimeError> {
    let v = stack.get_float(0)?;
    stack.pop(1)?;
    let text = v.to_string();
    let (ptr, len) = unsafe { alloc_buffer(text.as_bytes()) };
    stack.push_string(ptr, len)?;
    Ok(())
}

pub fn double_to_string(stack: &mut Stack) -> Result<(), RuntimeError> {
    let v = stack.get_double(0)?;
    stack.pop(1)?;
    let text = v.to_string();
    let (ptr, len) = unsafe { alloc_buffer(text.as_bytes()) };
    stack.push_string(ptr, len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_owned(stack: &mut Stack, s: &str) {
        let (ptr, len) = unsafe { alloc_buffer(s.as_bytes()) };
        stack.push_string(ptr, len).unwrap();
    }

    #[test]
    fn append_concatenates_and_frees_inputs() {
        let mut stack = Stack::new(64);
        push_owned(&mut stack, "foo");
        push_owned(&mut stack, "bar");
        append(&mut stack).unwrap();
        let ptr = stack.get_ptr(0).unwrap();
        let len = stack.get_ptr(1).unwrap();
        let text = unsafe { std::str::from_utf8_unchecked(read_buffer(ptr, len)) };
        assert_eq!(text, "foobar");
        cleanup(&mut stack).unwrap();
    }

    #[test]
    fn int_to_string_formats_decimal() {
        let mut stack = Stack::new(64);
        stack.push_int(-42).unwrap();
        int_to_string(&mut stack).unwrap();
        let ptr = stack.get_ptr(0).unwrap();
        let len = stack.get_ptr(1).unwrap();
        assert_eq!(unsafe { read_buffer(ptr, len) }, b"-42");
        cleanup(&mut stack).unwrap();
    }

    #[test]
    fn store_frees_previous_value_and_moves_new_one_in() {
        let mut stack = Stack::new(64);
        let mut slot: [u64; 2] = [0, 0];
        push_owned(&mut stack, "first");
        let slot_addr = slot.as_mut_ptr() as u64;
        stack.push_ptr(slot_addr).unwrap();
        // stack: [first(2w), slot_addr(1w)]
        // store() expects [new_ptr, new_len, dst_addr] top-down, which is
        // exactly this layout.
        store(&mut stack).unwrap();
        assert_eq!(unsafe { read_buffer(slot[0], slot[1]) }, b"first");

        push_owned(&mut stack, "second");
        stack.push_ptr(slot_addr).unwrap();
        store(&mut stack).unwrap();
        assert_eq!(unsafe { read_buffer(slot[0], slot[1]) }, b"second");
        unsafe { free_buffer(slot[0], slot[1]) };
    }
}
