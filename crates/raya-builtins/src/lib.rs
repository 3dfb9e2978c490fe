//! Builtin runtime library (spec §4.4): the operations too wide for the
//! 256-opcode budget, reached from compiled bytecode through `BCALL`/
//! `BMCALL`/`BCALL_TRAP` by table index, and from `raya-core` directly for
//! `NewObject`/array natives (`raya_core::vm::context::builtin_ids`).
//!
//! `raya-core` depends on neither this crate nor `raya-native`, to avoid a
//! dependency cycle with the compiler/host side — it calls through the
//! [`raya_core::vm::interpreter::BuiltinDispatch`] trait object instead.
//! [`StandardBuiltins`] is the production implementation a host constructs
//! from its linked [`raya_bytecode::module::CompiledProgram`] and passes to
//! every [`raya_core::vm::context::ExecutionContext`] entry point.
//!
//! Index assignments live in [`ids`]; each focused module (`refcount`,
//! `string`, `array`, `delegate`, `cpu`, `long`) implements one family and
//! knows nothing about dispatch or the others.

pub mod array;
pub mod cpu;
pub mod delegate;
pub mod ids;
pub mod long;
pub mod refcount;
pub mod string;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use raya_bytecode::module::{CompiledProgram, DataType, DataTypeTag};
use raya_core::object::{Delegate, RawObjectPtr};
use raya_core::vm::interpreter::{BuiltinDispatch, RuntimeError};
use raya_core::Stack;
use refcount::TypeOf;
use rustc_hash::FxHashMap;

/// Size/alignment/vtable-address a class type needs for `NEW_DYNAMIC`, kept
/// separate from [`DataType`] so lookup by type index is a plain `Vec`
/// index rather than a hash lookup on the hot allocation path.
#[derive(Debug, Clone, Copy)]
struct ClassLayout {
    size: u32,
    align: u32,
    vtbl_addr: u64,
}

/// The production [`BuiltinDispatch`] (spec §4.4 component 5). Built once
/// per linked program; a host shares one instance across every
/// `ExecutionContext` running that program (spec §5: "multiple execution
/// contexts may share one linked program").
pub struct StandardBuiltins {
    types: Vec<DataType>,
    layouts: Vec<Option<ClassLayout>>,
    /// Reverse map from a live object's `script_vtbl` address back to its
    /// type index, for [`TypeOf`] — the header only carries the address,
    /// not which type it belongs to.
    vtbl_to_index: FxHashMap<u64, u32>,
    /// `ADD_STRONG_AFTER_NEW`'s native-mirror hook (spec §4.7 "native
    /// classes" setup); absent for a host with no native-backed types.
    on_new_object: Option<Box<dyn Fn(RawObjectPtr) + Send + Sync>>,
    /// `SET_STATE_LABEL`'s slot: per design notes §9, the runtime only
    /// needs to read/write a two-word delegate value, not resolve names
    /// itself.
    state_delegate: Mutex<Option<Delegate>>,
    profile_depth: AtomicU32,
}

impl StandardBuiltins {
    /// Builds the type/layout tables from a linked program. `globals_base`
    /// is the address of the host's global-arena allocation (vtable regions
    /// are offsets into it; spec §4.7 "the global arena... one contiguous
    /// allocation").
    pub fn new(program: &CompiledProgram, globals_base: u64) -> Self {
        let mut layouts = Vec::with_capacity(program.types.len());
        let mut vtbl_to_index = FxHashMap::default();
        for (i, ty) in program.types.iter().enumerate() {
            let layout = match (ty.tag, program.vtbls.get(i)) {
                (DataTypeTag::Class, Some(region)) => {
                    let vtbl_addr = globals_base + region.global_offset as u64 * 8;
                    vtbl_to_index.insert(vtbl_addr, i as u32);
                    Some(ClassLayout { size: ty.size, align: ty.align, vtbl_addr })
                }
                _ => None,
            };
            layouts.push(layout);
        }
        Self {
            types: program.types.clone(),
            layouts,
            vtbl_to_index,
            on_new_object: None,
            state_delegate: Mutex::new(None),
            profile_depth: AtomicU32::new(0),
        }
    }

    /// Installs the native-mirror hook `ADD_STRONG_AFTER_NEW` invokes.
    pub fn with_new_object_hook(mut self, hook: impl Fn(RawObjectPtr) + Send + Sync + 'static) -> Self {
        self.on_new_object = Some(Box::new(hook));
        self
    }

    /// The delegate `SET_STATE_LABEL` last wrote, if any.
    pub fn state_delegate(&self) -> Option<Delegate> {
        *self.state_delegate.lock().unwrap()
    }

    /// Current `PROFILE_ENTER`/`PROFILE_EXIT` nesting depth.
    pub fn profile_depth(&self) -> u32 {
        self.profile_depth.load(Ordering::Relaxed)
    }

    fn new_dynamic(&self, stack: &mut Stack) -> Result<(), RuntimeError> {
        let type_index = stack.get_int(0)?;
        stack.pop(1)?;
        let layout = self
            .layouts
            .get(type_index as usize)
            .ok_or(RuntimeError::IndexOutOfBounds { index: type_index, limit: self.layouts.len() as i32 })?
            .as_ref()
            .ok_or(RuntimeError::NullDereference)?;
        let ptr = raya_core::object::alloc_object(layout.size as usize, layout.align as usize, layout.vtbl_addr)
            .expect("object allocation failed");
        stack.push_ptr(ptr.as_word())?;
        Ok(())
    }

    fn set_state_label(&self, stack: &mut Stack) -> Result<(), RuntimeError> {
        let target = stack.get_ptr(0)?;
        let instance_ptr = stack.get_ptr(1)?;
        stack.pop(2)?;
        *self.state_delegate.lock().unwrap() = Some(Delegate { instance_ptr, target });
        Ok(())
    }
}

impl TypeOf for StandardBuiltins {
    fn type_of(&self, ptr: RawObjectPtr) -> Option<&DataType> {
        self.vtbl_to_index.get(&ptr.header().script_vtbl).map(|&i| &self.types[i as usize])
    }
}

fn unary_int(stack: &mut Stack, f: fn(u32) -> u32) -> Result<(), RuntimeError> {
    let v = stack.get_int(0)? as u32;
    stack.pop(1)?;
    stack.push_int(f(v) as i32)?;
    Ok(())
}

fn unary_long_to_count(stack: &mut Stack, f: fn(u64) -> u32) -> Result<(), RuntimeError> {
    let v = stack.get_long(0)? as u64;
    stack.pop(1)?;
    stack.push_int(f(v) as i32)?;
    Ok(())
}

fn bswap64_op(stack: &mut Stack) -> Result<(), RuntimeError> {
    let v = stack.get_long(0)? as u64;
    stack.pop(1)?;
    stack.push_long(cpu::bswap64(v) as i64)?;
    Ok(())
}

fn push_trap_message(stack: &mut Stack, msg: &str) {
    let (ptr, len) = unsafe { string::alloc_buffer(msg.as_bytes()) };
    let _ = stack.push_string(ptr, len);
}

impl BuiltinDispatch for StandardBuiltins {
    fn call(&mut self, index: u32, stack: &mut Stack, globals: &mut [u8]) -> Result<(), RuntimeError> {
        let _ = globals;
        match index {
            ids::NEW_DYNAMIC => self.new_dynamic(stack),
            ids::ARRAY_RESIZE => array::resize(stack),
            ids::ARRAY_RESERVE => array::reserve(stack),
            ids::ARRAY_PUSH => array::push(stack),
            ids::ARRAY_POP => array::pop(stack),
            ids::ARRAY_CLEAR => array::clear(stack),
            ids::ARRAY_ERASE => array::erase(stack),
            ids::ARRAY_ERASE_FAST => array::erase_fast(stack),
            ids::ARRAY_INSERT => array::insert(stack),

            ids::LONG_ADD => long::add(stack),
            ids::LONG_SUB => long::sub(stack),
            ids::LONG_MUL => long::mul(stack),
            ids::LONG_DIV => long::div(stack),
            ids::LONG_MOD => long::rem(stack),
            ids::LONG_CMP => long::cmp(stack),
            ids::LONG_NEG => long::neg(stack),
            ids::LONG_LOAD => long::load(stack),
            ids::LONG_STORE => long::store(stack),
            ids::LONG_TO_INT => long::to_int(stack),
            ids::INT_TO_LONG => long::from_int(stack),

            ids::STRING_LOAD => string::load(stack),
            ids::STRING_STORE => string::store(stack),
            ids::STRING_CLEANUP => string::cleanup(stack),
            ids::STRING_APPEND => string::append(stack),
            ids::STRING_COMPARE => string::compare(stack),
            ids::INT_TO_STRING => string::int_to_string(stack),
            ids::FLOAT_TO_STRING => string::float_to_string(stack),
            ids::DOUBLE_TO_STRING => string::double_to_string(stack),

            ids::ADD_STRONG => refcount::add_strong(stack),
            ids::ADD_STRONG_AFTER_NEW => refcount::add_strong_after_new(stack, self.on_new_object.as_deref()),
            ids::DEC_STRONG => refcount::dec_strong(stack),
            ids::STRONG_ZERO => refcount::strong_zero(stack, &*self),
            ids::ADD_WEAK => refcount::add_weak(stack),
            ids::DEC_WEAK => refcount::dec_weak(stack, &*self),
            ids::FIX_WEAK => refcount::fix_weak(stack),
            ids::ISA => refcount::isa(stack, &*self),

            ids::BSF32 => unary_int(stack, cpu::bsf32),
            ids::BSR32 => unary_int(stack, cpu::bsr32),
            ids::POPCNT32 => unary_int(stack, cpu::popcnt32),
            ids::BSWAP32 => unary_int(stack, cpu::bswap32),
            ids::BSF64 => unary_long_to_count(stack, cpu::bsf64),
            ids::BSR64 => unary_long_to_count(stack, cpu::bsr64),
            ids::POPCNT64 => unary_long_to_count(stack, cpu::popcnt64),
            ids::BSWAP64 => bswap64_op(stack),

            ids::DELEGATE_EQ => delegate::eq(stack),
            ids::SET_STATE_LABEL => self.set_state_label(stack),
            ids::PROFILE_ENTER => {
                self.profile_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            ids::PROFILE_EXIT => {
                self.profile_depth.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }

            other => Err(RuntimeError::IndexOutOfBounds { index: other as i32, limit: ids::PROFILE_EXIT as i32 + 1 }),
        }
    }

    /// `BMCALL`: every builtin this crate defines is free-function-shaped —
    /// a method-shaped caller already puts the receiver in the normal
    /// argument position, so the dispatch itself doesn't differ.
    fn call_method(&mut self, index: u32, stack: &mut Stack, globals: &mut [u8]) -> Result<(), RuntimeError> {
        self.call(index, stack, globals)
    }

    fn call_trap(&mut self, index: u32, stack: &mut Stack, globals: &mut [u8]) {
        match index {
            ids::LONG_DIV_TRAP => match long::div_trap(stack) {
                Ok(Some(v)) => {
                    let _ = stack.push_long(v);
                }
                Ok(None) => push_trap_message(stack, "divide by zero"),
                Err(e) => push_trap_message(stack, &e.to_string()),
            },
            ids::LONG_MOD_TRAP => match long::mod_trap(stack) {
                Ok(Some(v)) => {
                    let _ = stack.push_long(v);
                }
                Ok(None) => push_trap_message(stack, "divide by zero"),
                Err(e) => push_trap_message(stack, &e.to_string()),
            },
            other => {
                if let Err(e) = self.call(other, stack, globals) {
                    push_trap_message(stack, &e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raya_bytecode::module::{MemberDef, VtblRegion};

    fn program_with_one_class(size: u32) -> (CompiledProgram, u64) {
        let mut program = CompiledProgram::new("test");
        program.types.push(DataType {
            name: "Foo".into(),
            tag: DataTypeTag::Class,
            size,
            align: 8,
            members: Vec::<MemberDef>::new(),
            base_type: None,
            element_type: None,
            ctor_pc: None,
            dtor_pc: None,
            assign_pc: None,
            virtual_ctor_pc: None,
            virtual_dtor_pc: Some(0),
            virtual_assign_pc: None,
            native_ctor: None,
            native_dtor: None,
            base_chain: vec!["Foo".to_string()],
            methods: FxHashMap::default(),
        });
        program.type_hash.insert("Foo".to_string(), 0);
        program.vtbls.push(VtblRegion { global_offset: 0, count: 1 });
        let globals_base = 0x1000;
        (program, globals_base)
    }

    #[test]
    fn new_dynamic_allocates_zeroed_object_with_zero_strong_count() {
        let (program, globals_base) = program_with_one_class(32);
        let mut builtins = StandardBuiltins::new(&program, globals_base);
        let mut stack = Stack::new(16);
        stack.push_int(0).unwrap();
        builtins.call(ids::NEW_DYNAMIC, &mut stack, &mut []).unwrap();
        let ptr = stack.get_ptr(0).unwrap();
        let obj = unsafe { RawObjectPtr::from_word(ptr) }.unwrap();
        assert_eq!(obj.header().strong_ref_count.load(Ordering::Relaxed), 0);
        assert_eq!(obj.header().script_vtbl, globals_base);
    }

    #[test]
    fn type_of_resolves_through_vtbl_address() {
        let (program, globals_base) = program_with_one_class(32);
        let mut builtins = StandardBuiltins::new(&program, globals_base);
        let mut stack = Stack::new(16);
        stack.push_int(0).unwrap();
        builtins.call(ids::NEW_DYNAMIC, &mut stack, &mut []).unwrap();
        let ptr = unsafe { RawObjectPtr::from_word(stack.get_ptr(0).unwrap()) }.unwrap();
        assert_eq!(builtins.type_of(ptr).unwrap().name, "Foo");
    }

    #[test]
    fn add_strong_after_new_then_strong_zero_frees_via_type_lookup() {
        let (program, globals_base) = program_with_one_class(32);
        let mut builtins = StandardBuiltins::new(&program, globals_base);
        let mut stack = Stack::new(16);
        stack.push_int(0).unwrap();
        builtins.call(ids::NEW_DYNAMIC, &mut stack, &mut []).unwrap();
        let ptr = stack.get_ptr(0).unwrap();

        stack.push_ptr(ptr).unwrap();
        builtins.call(ids::ADD_STRONG_AFTER_NEW, &mut stack, &mut []).unwrap();
        let obj = unsafe { RawObjectPtr::from_word(ptr) }.unwrap();
        assert_eq!(obj.header().strong_ref_count.load(Ordering::Relaxed), 1);

        stack.push_ptr(ptr).unwrap();
        builtins.call(ids::DEC_STRONG, &mut stack, &mut []).unwrap();
        assert_eq!(stack.get_int(0).unwrap(), 0);
        stack.pop(1).unwrap();

        stack.push_ptr(ptr).unwrap();
        builtins.call(ids::STRONG_ZERO, &mut stack, &mut []).unwrap();
    }

    #[test]
    fn set_state_label_round_trips_through_state_delegate() {
        let (program, globals_base) = program_with_one_class(32);
        let mut builtins = StandardBuiltins::new(&program, globals_base);
        let mut stack = Stack::new(16);
        stack.push_ptr(0x10).unwrap();
        stack.push_ptr(0x20).unwrap();
        builtins.call(ids::SET_STATE_LABEL, &mut stack, &mut []).unwrap();
        let d = builtins.state_delegate().unwrap();
        assert_eq!(d.instance_ptr, 0x10);
        assert_eq!(d.target, 0x20);
    }

    #[test]
    fn call_trap_reports_divide_by_zero_as_a_string_instead_of_raising() {
        let (program, globals_base) = program_with_one_class(32);
        let mut builtins = StandardBuiltins::new(&program, globals_base);
        let mut stack = Stack::new(16);
        stack.push_long(10).unwrap();
        stack.push_long(0).unwrap();
        builtins.call_trap(ids::LONG_DIV_TRAP, &mut stack, &mut []);
        let ptr = stack.get_ptr(0).unwrap();
        let len = stack.get_ptr(1).unwrap();
        let msg = unsafe { std::str::from_utf8_unchecked(string::read_buffer(ptr, len)) };
        assert_eq!(msg, "divide by zero");
    }

    #[test]
    fn unknown_index_is_an_index_out_of_bounds_error() {
        let (program, globals_base) = program_with_one_class(32);
        let mut builtins = StandardBuiltins::new(&program, globals_base);
        let mut stack = Stack::new(16);
        let err = builtins.call(9999, &mut stack, &mut []).unwrap_err();
        assert!(matches!(err, RuntimeError::IndexOutOfBounds { .. }));
    }
}
