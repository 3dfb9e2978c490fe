//! Cache of compiled entry points, keyed by `(program, pc)`.
//!
//! Mirrors the teacher's `jit::runtime::code_cache::CodeCache`: entries are
//! never physically freed on invalidation, only flagged — a function pointer
//! handed out by a prior `get()` may still be executing on another thread
//! when `invalidate()` runs (spec §4.6: invalidation happens whenever a
//! breakpoint is toggled on a program, which can race an in-flight call),
//! so the backing `JITModule` memory has to outlive every entry that ever
//! pointed into it. `CompiledProgram` has no stable numeric id of its own,
//! so the key uses the `Arc`'s pointer identity instead — sound because a
//! `CompiledProgram` is only ever constructed once and shared by `Arc` for
//! the rest of its life (see `raya_bytecode::module`).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Native entry point for a compiled function: `fn(entry_ptr) -> new_top_ptr`
/// (see [`crate::codegen`] module docs for the exact ABI).
pub type CompiledFn = extern "C" fn(*mut u64) -> *mut u64;

/// A compiled kernel plus the headroom it needs below the caller's current
/// `top` before it's safe to call. Compiled code itself never re-checks this
/// (`ChkStk` lowers to a no-op — see [`crate::codegen`]); the caller is
/// required to call [`Stack::check_headroom`](raya_core::stack::Stack::check_headroom)
/// with this value first and take the interpreter fallback on failure,
/// exactly as the interpreter's own `ChkStk` opcode would fault instead of
/// silently underflowing the stack array.
#[derive(Clone, Copy)]
pub struct CompiledEntryPoint {
    pub code: CompiledFn,
    pub required_headroom: u32,
}

type CacheKey = (usize, u32);

struct CacheEntry {
    point: CompiledEntryPoint,
    invalidated: AtomicBool,
}

/// Thread-safe cache of compiled kernels, keyed by `(Arc::as_ptr(program) as
/// usize, pc)`.
pub struct CodeCache {
    entries: RwLock<FxHashMap<CacheKey, CacheEntry>>,
    entry_count: AtomicUsize,
}

impl CodeCache {
    pub fn new() -> Self {
        CodeCache {
            entries: RwLock::new(FxHashMap::default()),
            entry_count: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, program_id: usize, pc: u32, point: CompiledEntryPoint) {
        let key = (program_id, pc);
        let mut entries = self.entries.write();
        if entries
            .insert(key, CacheEntry { point, invalidated: AtomicBool::new(false) })
            .is_none()
        {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Look up a compiled entry point. Returns `None` if never compiled, or
    /// compiled and then invalidated.
    pub fn get(&self, program_id: usize, pc: u32) -> Option<CompiledEntryPoint> {
        let entries = self.entries.read();
        let entry = entries.get(&(program_id, pc))?;
        if entry.invalidated.load(Ordering::Acquire) {
            return None;
        }
        Some(entry.point)
    }

    /// Flag every entry belonging to `program_id` as invalidated. Called
    /// whenever `JitEngine::invalidate` fires for a program (breakpoint
    /// toggled, program about to be dropped) — the entries stay in the map,
    /// just permanently unreachable via `get`.
    pub fn invalidate_program(&self, program_id: usize) {
        let entries = self.entries.read();
        for (key, entry) in entries.iter() {
            if key.0 == program_id {
                entry.invalidated.store(true, Ordering::Release);
            }
        }
    }

    pub fn contains(&self, program_id: usize, pc: u32) -> bool {
        self.get(program_id, pc).is_some()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy(p: *mut u64) -> *mut u64 {
        p
    }

    fn dummy_point() -> CompiledEntryPoint {
        CompiledEntryPoint { code: dummy, required_headroom: 4 }
    }

    #[test]
    fn insert_and_get_round_trips() {
        let cache = CodeCache::new();
        assert!(!cache.contains(1, 0));
        cache.insert(1, 0, dummy_point());
        assert!(cache.contains(1, 0));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn invalidate_hides_entries_without_removing_them() {
        let cache = CodeCache::new();
        cache.insert(1, 0, dummy_point());
        cache.insert(1, 4, dummy_point());
        cache.insert(2, 0, dummy_point());

        cache.invalidate_program(1);
        assert!(!cache.contains(1, 0));
        assert!(!cache.contains(1, 4));
        assert!(cache.contains(2, 0));
        assert_eq!(cache.entry_count(), 3);
    }

    #[test]
    fn distinct_programs_with_the_same_pc_do_not_collide() {
        let cache = CodeCache::new();
        cache.insert(1, 10, dummy_point());
        cache.insert(2, 10, dummy_point());
        assert_eq!(cache.entry_count(), 2);
        cache.invalidate_program(1);
        assert!(!cache.contains(1, 10));
        assert!(cache.contains(2, 10));
    }
}
