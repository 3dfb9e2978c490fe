//! 64-bit integer emulation (spec §4.4 "64-bit on 32-bit"): on a host whose
//! native word is 32 bits, a script `long` needs two-word software
//! arithmetic routed through builtins rather than a native opcode. This
//! port fixes `Word = u64` (`raya_core::stack`), so a `long` already fits in
//! a single stack slot; these are thin single-word wrappers kept under the
//! same index space and calling convention a 32-bit target would use.

use raya_core::vm::interpreter::RuntimeError;
use raya_core::Stack;

pub fn add(stack: &mut Stack) -> Result<(), RuntimeError> {
    let b = stack.get_long(0)?;
    let a = stack.get_long(1)?;
    stack.pop(2)?;
    stack.push_long(a.wrapping_add(b))?;
    Ok(())
}

pub fn sub(stack: &mut Stack) -> Result<(), RuntimeError> {
    let b = stack.get_long(0)?;
    let a = stack.get_long(1)?;
    stack.pop(2)?;
    stack.push_long(a.wrapping_sub(b))?;
    Ok(())
}

pub fn mul(stack: &mut Stack) -> Result<(), RuntimeError> {
    let b = stack.get_long(0)?;
    let a = stack.get_long(1)?;
    stack.pop(2)?;
    stack.push_long(a.wrapping_mul(b))?;
    Ok(())
}

pub fn div(stack: &mut Stack) -> Result<(), RuntimeError> {
    let b = stack.get_long(0)?;
    let a = stack.get_long(1)?;
    stack.pop(2)?;
    if b == 0 {
        return Err(RuntimeError::DivideByZero);
    }
    stack.push_long(a.wrapping_div(b))?;
    Ok(())
}

pub fn rem(stack: &mut Stack) -> Result<(), RuntimeError> {
    let b = stack.get_long(0)?;
    let a = stack.get_long(1)?;
    stack.pop(2)?;
    if b == 0 {
        return Err(RuntimeError::DivideByZero);
    }
    stack.push_long(a.wrapping_rem(b))?;
    Ok(())
}

/// Pushes `-1`/`0`/`1`.
pub fn cmp(stack: &mut Stack) -> Result<(), RuntimeError> {
    let b = stack.get_long(0)?;
    let a = stack.get_long(1)?;
    stack.pop(2)?;
    stack.push_int(match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    })?;
    Ok(())
}

pub fn neg(stack: &mut Stack) -> Result<(), RuntimeError> {
    let a = stack.get_long(0)?;
    stack.pop(1)?;
    stack.push_long(a.wrapping_neg())?;
    Ok(())
}

/// `LONG_LOAD(addr)`.
pub fn load(stack: &mut Stack) -> Result<(), RuntimeError> {
    let addr = stack.get_ptr(0)?;
    stack.pop(1)?;
    if addr == 0 {
        return Err(RuntimeError::NullDereference);
    }
    let v = unsafe { (addr as *const i64).read_unaligned() };
    stack.push_long(v)?;
    Ok(())
}

/// `LONG_STORE(addr, value)`.
pub fn store(stack: &mut Stack) -> Result<(), RuntimeError> {
    let value = stack.get_long(0)?;
    let addr = stack.get_ptr(1)?;
    stack.pop(2)?;
    if addr == 0 {
        return Err(RuntimeError::NullDereference);
    }
    unsafe { (addr as *mut i64).write_unaligned(value) };
    Ok(())
}

pub fn to_int(stack: &mut Stack) -> Result<(), RuntimeError> {
    let v = stack.get_long(0)?;
    stack.pop(1)?;
    stack.push_int(v as i32)?;
    Ok(())
}

pub fn from_int(stack: &mut Stack) -> Result<(), RuntimeError> {
    let v = stack.get_int(0)?;
    stack.pop(1)?;
    stack.push_long(v as i64)?;
    Ok(())
}

/// `LONG_DIV_TRAP`: routed through `BCALL_TRAP`, so it never raises itself —
/// consumes its operands either way and reports the zero-divisor case back
/// to the caller as `Ok(None)` instead of an error.
pub fn div_trap(stack: &mut Stack) -> Result<Option<i64>, RuntimeError> {
    let b = stack.get_long(0)?;
    let a = stack.get_long(1)?;
    stack.pop(2)?;
    Ok((b != 0).then(|| a.wrapping_div(b)))
}

pub fn mod_trap(stack: &mut Stack) -> Result<Option<i64>, RuntimeError> {
    let b = stack.get_long(0)?;
    let a = stack.get_long(1)?;
    stack.pop(2)?;
    Ok((b != 0).then(|| a.wrapping_rem(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_round_trip() {
        let mut stack = Stack::new(16);
        stack.push_long(40).unwrap();
        stack.push_long(2).unwrap();
        add(&mut stack).unwrap();
        assert_eq!(stack.get_long(0).unwrap(), 42);
    }

    #[test]
    fn div_trap_reports_zero_divisor_without_raising() {
        let mut stack = Stack::new(16);
        stack.push_long(10).unwrap();
        stack.push_long(0).unwrap();
        assert_eq!(div_trap(&mut stack).unwrap(), None);
    }

    #[test]
    fn plain_div_raises_on_zero_divisor() {
        let mut stack = Stack::new(16);
        stack.push_long(10).unwrap();
        stack.push_long(0).unwrap();
        assert!(div(&mut stack).is_err());
    }

    #[test]
    fn load_store_round_trip() {
        let mut cell: i64 = 0;
        let addr = &mut cell as *mut i64 as u64;
        let mut stack = Stack::new(16);
        stack.push_long(7).unwrap();
        stack.push_ptr(addr).unwrap();
        store(&mut stack).unwrap();
        assert_eq!(cell, 7);

        stack.push_ptr(addr).unwrap();
        load(&mut stack).unwrap();
        assert_eq!(stack.get_long(0).unwrap(), 7);
    }
}
