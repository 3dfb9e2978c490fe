//! Object header layout, vtable structure, and the smart-pointer protocol
//! (spec §3 "Object header", §4.5 "Smart-pointer and object protocol").
//!
//! The actual refcount mutation builtins (`ADD_STRONG`, `DEC_STRONG`,
//! `STRONG_ZERO`, ...) live in `raya-builtins` per spec §4.4 ("smart-pointer
//! builtins are the only code allowed to mutate the strong/weakRefCount
//! fields directly") — this module owns the memory layout they operate on
//! and the parts of the protocol that are not themselves builtins: raw
//! allocation, the vtable's fixed negative-offset slots, delegates, and
//! `isa` dynamic casting.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use raya_bytecode::module::DataType;

/// Prefix of every heap-allocated class instance (spec §3 "Object header").
#[repr(C)]
pub struct ObjectHeader {
    /// Pointer to the per-class vtable region in the global data arena.
    pub script_vtbl: u64,
    /// Atomic; when this reaches zero the object is logically dead even if
    /// weak references remain.
    pub strong_ref_count: AtomicU32,
    /// Atomic; initialized to 1 (the "strong group" holds one weak
    /// reference). Reaching zero frees the backing memory.
    pub weak_ref_count: AtomicU32,
}

impl ObjectHeader {
    fn new(script_vtbl: u64) -> Self {
        Self {
            script_vtbl,
            strong_ref_count: AtomicU32::new(0),
            weak_ref_count: AtomicU32::new(1),
        }
    }
}

/// Fixed vtable slot holding the engine's back-pointer (spec §3: "engine-
/// back-pointer (slot -2)").
pub const VTBL_ENGINE_BACKPTR_SLOT: i32 = -2;
/// Fixed vtable slot holding the destructor trampoline (spec §3: "destructor
/// trampoline (slot -1)"); the virtual destructor always lives at slot 0.
pub const VTBL_DTOR_TRAMPOLINE_SLOT: i32 = -1;
/// The virtual destructor's slot, present for every class type (spec §4.5).
pub const VTBL_VIRTUAL_DTOR_SLOT: u32 = 0;

/// A raw pointer to a heap object's header. Strong/weak ref-count discipline
/// is the *caller's* responsibility (enforced by the builtins that mutate
/// the counts); this type is just the address, matching the "raw" flavor of
/// spec §4.5's pointer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawObjectPtr(NonNull<ObjectHeader>);

impl RawObjectPtr {
    /// # Safety
    /// `ptr` must point at a live `ObjectHeader` allocated by [`alloc_object`].
    pub unsafe fn from_raw(ptr: NonNull<ObjectHeader>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut ObjectHeader {
        self.0.as_ptr()
    }

    pub fn header(&self) -> &ObjectHeader {
        // Safety: constructing a `RawObjectPtr` requires a live header.
        unsafe { self.0.as_ref() }
    }

    /// Address of the first byte *after* the header: where member fields
    /// the data-type descriptor lays out begin.
    pub fn fields_ptr(&self) -> *mut u8 {
        unsafe { (self.0.as_ptr() as *mut u8).add(std::mem::size_of::<ObjectHeader>()) }
    }

    pub fn as_word(self) -> u64 {
        self.0.as_ptr() as u64
    }

    /// # Safety
    /// `word` must be a value previously produced by [`RawObjectPtr::as_word`]
    /// for a still-live object, or zero (treated as null by callers).
    pub unsafe fn from_word(word: u64) -> Option<Self> {
        NonNull::new(word as *mut ObjectHeader).map(Self)
    }
}

/// Allocate and zero `size` bytes (header + fields) aligned to `align`,
/// install `strongRefCount = 0, weakRefCount = 1` (spec §4.4 `NEW`). The
/// class constructor runs afterward through an ordinary `CallPointer`.
pub fn alloc_object(total_size: usize, align: usize, script_vtbl: u64) -> Option<RawObjectPtr> {
    let align = align.max(std::mem::align_of::<ObjectHeader>());
    let size = total_size.max(std::mem::size_of::<ObjectHeader>());
    let layout = Layout::from_size_align(size, align).ok()?;
    // Safety: layout is non-zero-sized and well-formed.
    let raw = unsafe { alloc_zeroed(layout) } as *mut ObjectHeader;
    let ptr = NonNull::new(raw)?;
    // Safety: freshly allocated, exclusively owned.
    unsafe {
        ptr.as_ptr().write(ObjectHeader::new(script_vtbl));
    }
    Some(RawObjectPtr(ptr))
}

/// Free an object's backing memory. Only valid once `weakRefCount` has
/// transitioned to zero (spec invariant: "an object is freed exactly once").
///
/// # Safety
/// `ptr` must not be accessed by any other `RawObjectPtr` after this call.
pub unsafe fn dealloc_object(ptr: RawObjectPtr, total_size: usize, align: usize) {
    let align = align.max(std::mem::align_of::<ObjectHeader>());
    let size = total_size.max(std::mem::size_of::<ObjectHeader>());
    let layout = Layout::from_size_align_unchecked(size, align);
    dealloc(ptr.as_ptr() as *mut u8, layout);
}

/// `isa`-testing against a class's pre-built sorted base-chain array (spec
/// §4.5): "uses the class's pre-built sorted name array... and binary-
/// searches." Delegates to [`DataType::isa`]; kept here because the protocol
/// section of the spec names this as core's responsibility, not the
/// compiler's.
pub fn isa(data_type: &DataType, type_name: &str) -> bool {
    data_type.isa(type_name)
}

/// A two-word bound-callable value (spec §3 "Delegate").
///
/// If the low bit of `target` is 1, the remaining bits (shifted right by 2)
/// encode a vtable index rather than a direct code pointer; bit 1 marks the
/// instance as a struct-by-value rather than an object, so dereferencing
/// skips the vtable path entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delegate {
    pub instance_ptr: u64,
    pub target: u64,
}

impl Delegate {
    const VTABLE_BIT: u64 = 1;
    const STRUCT_BIT: u64 = 2;

    pub fn direct(instance_ptr: u64, code_ptr: u64) -> Self {
        debug_assert_eq!(code_ptr & (Self::VTABLE_BIT | Self::STRUCT_BIT), 0);
        Self { instance_ptr, target: code_ptr }
    }

    pub fn virtual_slot(instance_ptr: u64, vtable_index: u32, is_struct: bool) -> Self {
        let mut target = ((vtable_index as u64) << 2) | Self::VTABLE_BIT;
        if is_struct {
            target |= Self::STRUCT_BIT;
        }
        Self { instance_ptr, target }
    }

    pub fn is_vtable_indexed(self) -> bool {
        self.target & Self::VTABLE_BIT != 0
    }

    pub fn is_struct_instance(self) -> bool {
        self.target & Self::STRUCT_BIT != 0
    }

    /// Decode the vtable index, if `is_vtable_indexed()`.
    pub fn vtable_index(self) -> Option<u32> {
        self.is_vtable_indexed().then(|| (self.target >> 2) as u32)
    }

    /// Decode the direct code pointer, if not vtable-indexed.
    pub fn code_pointer(self) -> Option<u64> {
        (!self.is_vtable_indexed()).then_some(self.target)
    }

    /// Delegate comparison builtin's contract (spec §4.4): equal iff both
    /// words match.
    pub fn equals(self, other: Delegate) -> bool {
        self.instance_ptr == other.instance_ptr && self.target == other.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn make_object_type(name: &str, chain: &[&str]) -> DataType {
        DataType {
            name: name.to_string(),
            tag: raya_bytecode::module::DataTypeTag::Class,
            size: 16,
            align: 8,
            members: vec![],
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
            base_chain: chain.iter().map(|s| s.to_string()).collect(),
            methods: FxHashMap::default(),
        }
    }

    #[test]
    fn alloc_object_starts_at_zero_strong_one_weak() {
        let ptr = alloc_object(64, 8, 0xABCD).expect("alloc");
        assert_eq!(ptr.header().strong_ref_count.load(Ordering::Relaxed), 0);
        assert_eq!(ptr.header().weak_ref_count.load(Ordering::Relaxed), 1);
        assert_eq!(ptr.header().script_vtbl, 0xABCD);
        unsafe { dealloc_object(ptr, 64, 8) };
    }

    #[test]
    fn fields_ptr_follows_the_header() {
        let ptr = alloc_object(64, 8, 0).unwrap();
        let header_end = ptr.as_ptr() as usize + std::mem::size_of::<ObjectHeader>();
        assert_eq!(ptr.fields_ptr() as usize, header_end);
        unsafe { dealloc_object(ptr, 64, 8) };
    }

    #[test]
    fn word_roundtrip_preserves_identity() {
        let ptr = alloc_object(64, 8, 0).unwrap();
        let word = ptr.as_word();
        let back = unsafe { RawObjectPtr::from_word(word) }.unwrap();
        assert_eq!(ptr, back);
        unsafe { dealloc_object(ptr, 64, 8) };
    }

    #[test]
    fn null_word_decodes_to_none() {
        assert!(unsafe { RawObjectPtr::from_word(0) }.is_none());
    }

    #[test]
    fn isa_walks_sorted_base_chain() {
        let ty = make_object_type("Derived", &["Base", "Derived", "Object"]);
        assert!(isa(&ty, "Base"));
        assert!(!isa(&ty, "Unrelated"));
    }

    #[test]
    fn delegate_direct_vs_vtable_indexed() {
        let direct = Delegate::direct(0x1000, 0x2000);
        assert!(!direct.is_vtable_indexed());
        assert_eq!(direct.code_pointer(), Some(0x2000));

        let virt = Delegate::virtual_slot(0x1000, 3, false);
        assert!(virt.is_vtable_indexed());
        assert_eq!(virt.vtable_index(), Some(3));
        assert!(!virt.is_struct_instance());
    }

    #[test]
    fn delegate_struct_bit_is_independent_of_vtable_bit() {
        let d = Delegate::virtual_slot(0x4000, 1, true);
        assert!(d.is_struct_instance());
        assert!(d.is_vtable_indexed());
    }

    #[test]
    fn delegate_equality_matches_both_words() {
        let a = Delegate::direct(1, 2);
        let b = Delegate::direct(1, 2);
        let c = Delegate::direct(1, 3);
        assert!(a.equals(b));
        assert!(!a.equals(c));
    }
}
