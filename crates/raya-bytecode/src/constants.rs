//! Constant pool and global data arena (spec §3).
//!
//! A [`ConstantPool`] is a per-program collection of sub-arenas, one per
//! literal kind, each with a hash-deduplicating `add_*` path that returns the
//! element's stable index. Numeric arenas dedup on the literal's bit pattern
//! (not `PartialEq`) so that `-0.0`/`0.0` and distinct NaN payloads are kept
//! apart, matching IEEE-754 bit-exact constant folding upstream.
//!
//! The [`GlobalArena`] is the separate, mutable, cache-aligned byte store
//! for program-wide globals; it is allocated from at link time and is not
//! part of the constant pool (the pool is read-only, the arena is not).

use rustc_hash::FxHashMap;

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};

/// Deduplicated literal tables for one compiled program.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    /// Packed booleans/bytes.
    pub bytes: Vec<u8>,
    /// 16-bit integers.
    pub shorts: Vec<i16>,
    /// 32-bit integers.
    pub integers: Vec<i32>,
    /// 64-bit integers ("longs"; occupy two stack words on 32-bit hosts).
    pub longs: Vec<i64>,
    /// 32-bit floats.
    pub floats: Vec<f32>,
    /// 64-bit doubles.
    pub doubles: Vec<f64>,
    /// String literals.
    pub strings: Vec<String>,
    /// Interned identifiers ("names"), compared by index identity at runtime.
    pub names: Vec<String>,

    byte_index: FxHashMap<u8, u32>,
    short_index: FxHashMap<i16, u32>,
    int_index: FxHashMap<i32, u32>,
    long_index: FxHashMap<i64, u32>,
    float_index: FxHashMap<u32, u32>,
    double_index: FxHashMap<u64, u32>,
    string_index: FxHashMap<String, u32>,
    name_index: FxHashMap<String, u32>,
}

macro_rules! dedup_add {
    ($self:ident, $index_map:ident, $arena:ident, $key:expr, $value:expr) => {{
        if let Some(&idx) = $self.$index_map.get(&$key) {
            return idx;
        }
        let idx = $self.$arena.len() as u32;
        $self.$arena.push($value);
        $self.$index_map.insert($key, idx);
        idx
    }};
}

impl ConstantPool {
    /// Create an empty constant pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a byte/bool literal, returning its (possibly pre-existing) index.
    pub fn add_byte(&mut self, value: u8) -> u32 {
        dedup_add!(self, byte_index, bytes, value, value)
    }

    /// Add a 16-bit integer literal.
    pub fn add_short(&mut self, value: i16) -> u32 {
        dedup_add!(self, short_index, shorts, value, value)
    }

    /// Add a 32-bit integer literal.
    pub fn add_integer(&mut self, value: i32) -> u32 {
        dedup_add!(self, int_index, integers, value, value)
    }

    /// Add a 64-bit integer ("long") literal.
    pub fn add_long(&mut self, value: i64) -> u32 {
        dedup_add!(self, long_index, longs, value, value)
    }

    /// Add a 32-bit float literal, deduplicated on bit pattern.
    pub fn add_float(&mut self, value: f32) -> u32 {
        let key = value.to_bits();
        dedup_add!(self, float_index, floats, key, value)
    }

    /// Add a 64-bit double literal, deduplicated on bit pattern.
    pub fn add_double(&mut self, value: f64) -> u32 {
        let key = value.to_bits();
        dedup_add!(self, double_index, doubles, key, value)
    }

    /// Add a string literal.
    pub fn add_string(&mut self, value: impl Into<String>) -> u32 {
        let value = value.into();
        dedup_add!(self, string_index, strings, value.clone(), value)
    }

    /// Add an interned name, returning a stable integer-identity index.
    pub fn add_name(&mut self, value: impl Into<String>) -> u32 {
        let value = value.into();
        dedup_add!(self, name_index, names, value.clone(), value)
    }

    /// Look up a byte constant by index.
    pub fn get_byte(&self, index: u32) -> Option<u8> {
        self.bytes.get(index as usize).copied()
    }

    /// Look up a short constant by index.
    pub fn get_short(&self, index: u32) -> Option<i16> {
        self.shorts.get(index as usize).copied()
    }

    /// Look up an integer constant by index.
    pub fn get_integer(&self, index: u32) -> Option<i32> {
        self.integers.get(index as usize).copied()
    }

    /// Look up a long constant by index.
    pub fn get_long(&self, index: u32) -> Option<i64> {
        self.longs.get(index as usize).copied()
    }

    /// Look up a float constant by index.
    pub fn get_float(&self, index: u32) -> Option<f32> {
        self.floats.get(index as usize).copied()
    }

    /// Look up a double constant by index.
    pub fn get_double(&self, index: u32) -> Option<f64> {
        self.doubles.get(index as usize).copied()
    }

    /// Look up a string constant by index.
    pub fn get_string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    /// Look up an interned name by index.
    pub fn get_name(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    /// Encode the pool to a binary writer.
    pub fn encode(&self, w: &mut BytecodeWriter) {
        w.emit_u32(self.bytes.len() as u32);
        w.buffer.extend_from_slice(&self.bytes);

        w.emit_u32(self.shorts.len() as u32);
        for &v in &self.shorts {
            w.emit_u16(v as u16);
        }

        w.emit_u32(self.integers.len() as u32);
        for &v in &self.integers {
            w.emit_i32(v);
        }

        w.emit_u32(self.longs.len() as u32);
        for &v in &self.longs {
            w.buffer.extend_from_slice(&v.to_le_bytes());
        }

        w.emit_u32(self.floats.len() as u32);
        for &v in &self.floats {
            w.buffer.extend_from_slice(&v.to_le_bytes());
        }

        w.emit_u32(self.doubles.len() as u32);
        for &v in &self.doubles {
            w.emit_f64(v);
        }

        w.emit_u32(self.strings.len() as u32);
        for s in &self.strings {
            w.emit_u32(s.len() as u32);
            w.buffer.extend_from_slice(s.as_bytes());
        }

        w.emit_u32(self.names.len() as u32);
        for s in &self.names {
            w.emit_u32(s.len() as u32);
            w.buffer.extend_from_slice(s.as_bytes());
        }
    }

    /// Decode the pool from a binary reader, rebuilding dedup indices.
    pub fn decode(r: &mut BytecodeReader) -> Result<Self, DecodeError> {
        let mut pool = Self::new();

        let n = r.read_u32()? as usize;
        let bytes = r.read_bytes(n)?;
        for b in bytes {
            pool.add_byte(b);
        }

        let n = r.read_u32()?;
        for _ in 0..n {
            pool.add_short(r.read_u16()? as i16);
        }

        let n = r.read_u32()?;
        for _ in 0..n {
            pool.add_integer(r.read_i32()?);
        }

        let n = r.read_u32()?;
        for _ in 0..n {
            pool.add_long(r.read_i64()?);
        }

        let n = r.read_u32()?;
        for _ in 0..n {
            pool.add_float(r.read_f32()?);
        }

        let n = r.read_u32()?;
        for _ in 0..n {
            pool.add_double(r.read_f64()?);
        }

        let n = r.read_u32()?;
        for _ in 0..n {
            pool.add_string(r.read_string()?);
        }

        let n = r.read_u32()?;
        for _ in 0..n {
            pool.add_name(r.read_string()?);
        }

        Ok(pool)
    }
}

/// The program-wide mutable global data arena (spec §3).
///
/// A flat, cache-aligned byte buffer. Allocation hands out an aligned byte
/// offset; the compiler front-end is responsible for mapping variable names
/// to those offsets (tracked here only for debugger convenience via
/// [`GlobalArena::slots`]).
#[derive(Debug, Clone, Default)]
pub struct GlobalArena {
    data: Vec<u8>,
    /// Name -> byte offset, for the debugger's global lookup.
    pub slots: Vec<GlobalSlot>,
}

/// One named allocation inside the global arena.
#[derive(Debug, Clone)]
pub struct GlobalSlot {
    /// The variable's name as seen by the debugger.
    pub name: String,
    /// Byte offset into the arena.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
}

/// Default alignment for global allocations: a cache line.
pub const GLOBAL_ALIGN: usize = 64;

impl GlobalArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `size` bytes aligned to `align`, returning the byte offset.
    pub fn allocate(&mut self, name: impl Into<String>, size: usize, align: usize) -> u32 {
        let align = align.max(1);
        let padded = (self.data.len() + align - 1) / align * align;
        self.data.resize(padded, 0);
        let offset = self.data.len() as u32;
        self.data.resize(self.data.len() + size, 0);
        self.slots.push(GlobalSlot {
            name: name.into(),
            offset,
            size: size as u32,
        });
        offset
    }

    /// Total size of the arena in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if nothing has been allocated yet.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes (for linking into the running process's global store).
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Encode for serialization.
    pub fn encode(&self, w: &mut BytecodeWriter) {
        w.emit_u32(self.data.len() as u32);
        w.buffer.extend_from_slice(&self.data);
        w.emit_u32(self.slots.len() as u32);
        for slot in &self.slots {
            w.emit_u32(slot.name.len() as u32);
            w.buffer.extend_from_slice(slot.name.as_bytes());
            w.emit_u32(slot.offset);
            w.emit_u32(slot.size);
        }
    }

    /// Decode from a reader.
    pub fn decode(r: &mut BytecodeReader) -> Result<Self, DecodeError> {
        let len = r.read_u32()? as usize;
        let data = r.read_bytes(len)?;
        let n = r.read_u32()?;
        let mut slots = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let name = r.read_string()?;
            let offset = r.read_u32()?;
            let size = r.read_u32()?;
            slots.push(GlobalSlot { name, offset, size });
        }
        Ok(Self { data, slots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_integers() {
        let mut pool = ConstantPool::new();
        let a = pool.add_integer(42);
        let b = pool.add_integer(42);
        let c = pool.add_integer(43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.get_integer(a), Some(42));
    }

    #[test]
    fn negative_zero_and_nan_kept_distinct() {
        let mut pool = ConstantPool::new();
        let pos_zero = pool.add_double(0.0);
        let neg_zero = pool.add_double(-0.0);
        assert_ne!(pos_zero, neg_zero);

        let nan1 = pool.add_double(f64::from_bits(0x7ff8000000000001));
        let nan2 = pool.add_double(f64::from_bits(0x7ff8000000000002));
        assert_ne!(nan1, nan2);
    }

    #[test]
    fn names_are_interned() {
        let mut pool = ConstantPool::new();
        let a = pool.add_name("foo");
        let b = pool.add_name("foo");
        let c = pool.add_name("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn roundtrip_encode_decode() {
        let mut pool = ConstantPool::new();
        pool.add_integer(7);
        pool.add_double(1.5);
        pool.add_string("hello");
        pool.add_name("Foo::bar");

        let mut w = BytecodeWriter::new();
        pool.encode(&mut w);
        let bytes = w.into_bytes();

        let mut r = BytecodeReader::new(&bytes);
        let decoded = ConstantPool::decode(&mut r).unwrap();
        assert_eq!(decoded.get_integer(0), Some(7));
        assert_eq!(decoded.get_double(0), Some(1.5));
        assert_eq!(decoded.get_string(0), Some("hello"));
        assert_eq!(decoded.get_name(0), Some("Foo::bar"));
    }

    #[test]
    fn global_arena_alignment() {
        let mut arena = GlobalArena::new();
        let off_a = arena.allocate("a", 1, 1);
        let off_b = arena.allocate("b", 8, 8);
        assert_eq!(off_a, 0);
        assert_eq!(off_b % 8, 0);
        assert!(arena.len() >= (off_b as usize + 8));
    }
}
