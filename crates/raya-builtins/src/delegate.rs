//! `DELEGATE_EQ` (spec §4.4 "compares two two-word values; equal iff both
//! words match").

use raya_core::object::Delegate;
use raya_core::vm::interpreter::RuntimeError;
use raya_core::Stack;

pub fn eq(stack: &mut Stack) -> Result<(), RuntimeError> {
    let rhs_target = stack.get_ptr(0)?;
    let rhs_instance = stack.get_ptr(1)?;
    let lhs_target = stack.get_ptr(2)?;
    let lhs_instance = stack.get_ptr(3)?;
    stack.pop(4)?;
    let lhs = Delegate { instance_ptr: lhs_instance, target: lhs_target };
    let rhs = Delegate { instance_ptr: rhs_instance, target: rhs_target };
    stack.push_int(lhs.equals(rhs) as i32)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_delegates_compare_true() {
        let mut stack = Stack::new(16);
        stack.push_ptr(0x10).unwrap();
        stack.push_ptr(0x20).unwrap();
        stack.push_ptr(0x10).unwrap();
        stack.push_ptr(0x20).unwrap();
        eq(&mut stack).unwrap();
        assert_eq!(stack.get_int(0).unwrap(), 1);
    }

    #[test]
    fn differing_target_compares_false() {
        let mut stack = Stack::new(16);
        stack.push_ptr(0x10).unwrap();
        stack.push_ptr(0x20).unwrap();
        stack.push_ptr(0x10).unwrap();
        stack.push_ptr(0x21).unwrap();
        eq(&mut stack).unwrap();
        assert_eq!(stack.get_int(0).unwrap(), 0);
    }
}
