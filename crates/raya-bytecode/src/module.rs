//! The compiled-program format the execution core consumes (spec §6).
//!
//! A [`CompiledProgram`] is what the external front-end compiler hands to
//! the core: read-only after [`CompiledProgram::link`]. Everything here is
//! data — no behavior belongs to the compiler is implied or required by this
//! module; the core only ever *reads* these tables.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::constants::{ConstantPool, GlobalArena};
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::opcode::Opcode;

/// Magic number for Raya bytecode files: "RAYA"
pub const MAGIC: [u8; 4] = *b"RAYA";

/// Current bytecode version. The bytecode is word-size-specific (spec §1
/// Non-goals: "portable bytecode across word sizes" is explicitly out of
/// scope), so this is bumped whenever the encoding or a word-size-dependent
/// layout assumption changes, not on every feature addition.
pub const VERSION: u32 = 1;

/// Errors raised while decoding or linking a [`CompiledProgram`].
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid magic number: expected RAYA, got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported bytecode version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("instruction at pc {0} decodes to an unallocated opcode")]
    BadInstruction(u32),

    #[error("duplicate type name during link: {0}")]
    DuplicateType(String),
}

/// Module-level flags.
pub mod flags {
    pub const HAS_DEBUG_INFO: u32 = 1 << 0;
    pub const HAS_REFLECTION: u32 = 1 << 1;
}

/// `{tableStart, tableEnd}`: a PC range occupied by an inline switch jump
/// table rather than instructions (spec §4.1 `Switch`, §6 `switchRange[]`).
/// Sorted by `table_start`; the disassembler and JIT consult this to skip
/// decoding these words as instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchTableRange {
    pub table_start: u32,
    pub table_end: u32,
}

/// `pc -> function index`, sorted by `pc` (spec §6 `funcMap`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncMapEntry {
    pub pc: u32,
    pub function_index: u32,
}

/// `{pc, line, file}`, sorted by `pc` (spec §6 `codeToLine[]`). `file` is an
/// index into the constant pool's name arena (interned source path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub pc: u32,
    pub line: u32,
    pub file: u32,
}

/// A vtable region in the global data arena: `{globalOffset, count}` (spec §6
/// `vtbls[]`). After linking this is patched from PC-encoded method table
/// entries to absolute code pointers (JIT) or left as PCs (interpreter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtblRegion {
    pub global_offset: u32,
    pub count: u32,
}

/// One script-level function or method (spec §6 `functions[]`).
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub entry_pc: u32,
    pub param_count: u32,
    pub local_count: u32,
    /// True if the first argument slot is an implicit `this`.
    pub is_method: bool,
}

/// A host native function registered with the engine. The table only ever
/// carries the *name*; the core resolves the name to a native function
/// pointer through `raya-native`'s registry at link time (spec §3 "Native
/// function table ... lookup is by fully qualified string name at link
/// time, yielding a stable index").
#[derive(Debug, Clone)]
pub struct NativeFunctionSig {
    pub name: String,
}

/// A host-registered native composite type (spec §3 "Native class
/// descriptor").
#[derive(Debug, Clone)]
pub struct NativeClassDescriptor {
    pub name: String,
    pub size: u32,
    pub align: u32,
    pub is_struct: bool,
    /// Index into `native_functions`, if the host supplied a ctor/dtor.
    pub native_ctor: Option<u32>,
    pub native_dtor: Option<u32>,
    pub members: Vec<MemberDef>,
}

/// One field of a composite (struct/class/native-class) type.
#[derive(Debug, Clone)]
pub struct MemberDef {
    pub name: String,
    /// Index into `CompiledProgram::types`.
    pub type_index: u32,
    pub offset: u32,
}

/// The tag of a [`DataType`] descriptor (spec §3). A flat sum type rather
/// than the original engine's deep `asCDataType`/`asCObjectType` inheritance
/// — the inheritance was an AST artifact, out of this core's scope; cross-
/// references between descriptors (class <-> member-of <-> array-element-of
/// cycles) are indices into `CompiledProgram::types`, not owned pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataTypeTag {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    String,
    Enum,
    Struct,
    Class,
    StrongPtr,
    WeakPtr,
    RawPtr,
    StaticArray,
    DynamicArray,
    ArrayRef,
    FuncPtr,
    Delegate,
    Name,
}

/// A method table entry's resolution (spec §3: "positive = PC, negative =
/// negated vtable slot, zero = absent").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSlot {
    Absent,
    Code(u32),
    Virtual(u32),
}

impl MethodSlot {
    pub fn encode(self) -> i32 {
        match self {
            MethodSlot::Absent => 0,
            MethodSlot::Code(pc) => pc as i32,
            MethodSlot::Virtual(slot) => -((slot as i32) + 1),
        }
    }

    pub fn decode(raw: i32) -> Self {
        match raw.cmp(&0) {
            std::cmp::Ordering::Equal => MethodSlot::Absent,
            std::cmp::Ordering::Greater => MethodSlot::Code(raw as u32),
            std::cmp::Ordering::Less => MethodSlot::Virtual((-raw - 1) as u32),
        }
    }
}

/// One script-visible type descriptor (spec §3 "Data type descriptor").
#[derive(Debug, Clone)]
pub struct DataType {
    pub name: String,
    pub tag: DataTypeTag,
    pub size: u32,
    pub align: u32,
    pub members: Vec<MemberDef>,
    /// Base type, for class inheritance (index into `types`).
    pub base_type: Option<u32>,
    /// Element type, for arrays and pointer flavors (index into `types`).
    pub element_type: Option<u32>,
    pub ctor_pc: Option<u32>,
    pub dtor_pc: Option<u32>,
    pub assign_pc: Option<u32>,
    pub virtual_ctor_pc: Option<u32>,
    pub virtual_dtor_pc: Option<u32>,
    pub virtual_assign_pc: Option<u32>,
    /// Index into `native_functions`, when the type is backed by a native
    /// ctor/dtor instead of (or in addition to) a bytecode one.
    pub native_ctor: Option<u32>,
    pub native_dtor: Option<u32>,
    /// Sorted set of ancestor/self type names, for `isa`'s binary search
    /// (spec §4.5 `GenBaseChain`).
    pub base_chain: Vec<String>,
    /// method name -> resolution.
    pub methods: FxHashMap<String, MethodSlot>,
}

impl DataType {
    pub fn isa(&self, type_name: &str) -> bool {
        self.base_chain.binary_search_by(|n| n.as_str().cmp(type_name)).is_ok()
    }
}

/// Module-level metadata (name, source file).
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub name: String,
    pub source_file: Option<String>,
}

/// The read-only, linked artifact the execution core runs (spec §6).
///
/// Built once by the external compiler (out of scope here); the core reads
/// it through [`CompiledProgram::link`] and never mutates it afterward,
/// except for the single-byte breakpoint patch-in-place described in
/// spec §4.8/§9 (guarded by the engine's breakpoint mutex, not represented
/// in this data structure itself — see `raya-core::vm::debug`).
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub magic: [u8; 4],
    pub version: u32,
    pub flags: u32,

    pub constants: ConstantPool,
    pub global_arena: GlobalArena,

    /// Dense array of 32-bit instructions.
    pub instructions: Vec<u32>,
    /// Sorted PC list: JIT optimization barriers (branch targets, call
    /// sites, entry points).
    pub barriers: Vec<u32>,
    /// Sorted PC list: loop back-edge targets, for JIT alignment decisions.
    pub loops: Vec<u32>,
    /// Inline switch-table PC ranges, sorted by `table_start`.
    pub switch_ranges: Vec<SwitchTableRange>,

    pub functions: Vec<FunctionDef>,
    /// Sorted by `pc`.
    pub func_map: Vec<FuncMapEntry>,
    /// Sorted by `pc`.
    pub code_to_line: Vec<LineEntry>,

    pub types: Vec<DataType>,
    pub type_hash: FxHashMap<String, u32>,
    pub class_type_hash: FxHashMap<String, u32>,

    pub native_functions: Vec<NativeFunctionSig>,
    pub native_classes: Vec<NativeClassDescriptor>,

    /// PC of the global-ctor entry point, if the program has one.
    pub global_const_index: Option<u32>,
    /// PC of the global-dtor entry point, if the program has one.
    pub global_dest_index: Option<u32>,

    pub vtbls: Vec<VtblRegion>,

    pub metadata: Metadata,

    /// Breakpoint patch overlay: `pc -> original low byte` (spec §4.8,
    /// §9 "bytecode instructions: mutable only for breakpoint patching;
    /// original opcode bytes are saved in a parallel array"). Rather than
    /// mutate `instructions` in place — which would require every other
    /// reader of a shared `Arc<CompiledProgram>` to synchronize on it even
    /// when no breakpoint is ever set — the patch is modeled as a side
    /// overlay consulted by [`CompiledProgram::fetch_instruction_word`].
    /// An `Arc` so cloning a linked program (rare; tests mostly) still
    /// shares one breakpoint table, matching "many contexts may share one
    /// linked program" (spec §5).
    pub breakpoints: Arc<RwLock<FxHashMap<u32, u8>>>,
}

/// Flags controlling [`CompiledProgram::link`] (spec §8 property 7:
/// "Idempotent `Link()`").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Keep the external compiler's side tables alive after linking
    /// (`LINK_KEEP_COMPILER` in spec.md's discussion). The core itself never
    /// reads them either way; this flag only affects whether a re-`link()`
    /// is observably a no-op, which it always is here since `link` performs
    /// no destructive transform of `self`.
    pub keep_compiler: bool,
}

impl CompiledProgram {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags: 0,
            constants: ConstantPool::new(),
            global_arena: GlobalArena::new(),
            instructions: Vec::new(),
            barriers: Vec::new(),
            loops: Vec::new(),
            switch_ranges: Vec::new(),
            functions: Vec::new(),
            func_map: Vec::new(),
            code_to_line: Vec::new(),
            types: Vec::new(),
            type_hash: FxHashMap::default(),
            class_type_hash: FxHashMap::default(),
            native_functions: Vec::new(),
            native_classes: Vec::new(),
            global_const_index: None,
            global_dest_index: None,
            vtbls: Vec::new(),
            metadata: Metadata {
                name: name.into(),
                source_file: None,
            },
            breakpoints: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    /// Fetch the instruction word at `pc`, applying the breakpoint overlay
    /// if one is patched in at that PC (spec §4.8: enabling a breakpoint
    /// "overwrite[s] the low byte of the instruction ... with `OPC_BREAK`").
    /// This is the only read path the interpreter and JIT should use to
    /// fetch a raw instruction word; indexing `instructions` directly
    /// bypasses the debugger.
    pub fn fetch_instruction_word(&self, pc: u32) -> u32 {
        let raw = self.instructions[pc as usize];
        let table = self.breakpoints.read();
        if table.contains_key(&pc) {
            (raw & !0xFF) | (Opcode::OpcBreak as u32)
        } else {
            raw
        }
    }

    /// Enable or disable a breakpoint patch at `pc`. Enabling saves the
    /// instruction's original low byte (if not already saved); disabling
    /// removes the overlay entry, restoring the original opcode on the next
    /// fetch. Idempotent in both directions (spec §8 property 6:
    /// "setting a breakpoint ... and immediately clearing it leaves the
    /// program's observable behavior unchanged").
    pub fn set_breakpoint_patch(&self, pc: u32, enabled: bool) {
        let mut table = self.breakpoints.write();
        if enabled {
            table.entry(pc).or_insert_with(|| (self.instructions[pc as usize] & 0xFF) as u8);
        } else {
            table.remove(&pc);
        }
    }

    /// True if `pc` currently has a breakpoint patch installed.
    pub fn is_breakpoint_patched(&self, pc: u32) -> bool {
        self.breakpoints.read().contains_key(&pc)
    }

    /// The original (unpatched) low byte at `pc`, if a breakpoint is
    /// currently installed there.
    pub fn saved_opcode_byte(&self, pc: u32) -> Option<u8> {
        self.breakpoints.read().get(&pc).copied()
    }

    pub fn validate_header(&self) -> Result<(), ModuleError> {
        if self.magic != MAGIC {
            return Err(ModuleError::InvalidMagic(self.magic));
        }
        if self.version != VERSION {
            return Err(ModuleError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    /// Resolve the function owning `pc`, if any (binary search over
    /// `func_map`, which is sorted by `pc`).
    pub fn function_at(&self, pc: u32) -> Option<&FunctionDef> {
        let idx = match self.func_map.binary_search_by_key(&pc, |e| e.pc) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        self.functions.get(self.func_map[idx].function_index as usize)
    }

    /// Look up the `{line, file}` for `pc` (binary search over
    /// `code_to_line`, sorted by `pc`).
    pub fn line_at(&self, pc: u32) -> Option<LineEntry> {
        let idx = match self.code_to_line.binary_search_by_key(&pc, |e| e.pc) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        self.code_to_line.get(idx).copied()
    }

    /// True if `pc` falls inside an inline switch table and must not be
    /// decoded as an instruction.
    pub fn is_switch_table_pc(&self, pc: u32) -> bool {
        self.switch_ranges
            .iter()
            .any(|r| pc >= r.table_start && pc < r.table_end)
    }

    /// Link the program: validate structural invariants and rebuild the
    /// name-hash lookup tables. Idempotent — calling it twice yields
    /// identical executable behavior (spec §8 property 7), since it mutates
    /// only the derived `type_hash`/`class_type_hash` indices rather than
    /// `instructions`/`constants`/`types` themselves.
    pub fn link(&mut self, _options: LinkOptions) -> Result<(), ModuleError> {
        self.validate_header()?;

        self.type_hash.clear();
        self.class_type_hash.clear();
        for (idx, ty) in self.types.iter().enumerate() {
            if self.type_hash.insert(ty.name.clone(), idx as u32).is_some() {
                return Err(ModuleError::DuplicateType(ty.name.clone()));
            }
            if matches!(ty.tag, DataTypeTag::Class) {
                self.class_type_hash.insert(ty.name.clone(), idx as u32);
            }
        }

        for pc in 0..self.instructions.len() as u32 {
            if self.is_switch_table_pc(pc) {
                continue;
            }
            crate::encoder::Instruction::decode(self.instructions[pc as usize])
                .map_err(|_| ModuleError::BadInstruction(pc))?;
        }

        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = BytecodeWriter::new();
        w.buffer.extend_from_slice(&self.magic);
        w.emit_u32(self.version);
        w.emit_u32(self.flags);
        let checksum_at = w.reserve_u32();

        self.constants.encode(&mut w);
        self.global_arena.encode(&mut w);

        w.emit_u32(self.instructions.len() as u32);
        for &i in &self.instructions {
            w.emit_u32(i);
        }
        w.emit_u32(self.barriers.len() as u32);
        for &p in &self.barriers {
            w.emit_u32(p);
        }
        w.emit_u32(self.loops.len() as u32);
        for &p in &self.loops {
            w.emit_u32(p);
        }
        w.emit_u32(self.switch_ranges.len() as u32);
        for r in &self.switch_ranges {
            w.emit_u32(r.table_start);
            w.emit_u32(r.table_end);
        }

        w.emit_u32(self.functions.len() as u32);
        for f in &self.functions {
            w.emit_u32(f.name.len() as u32);
            w.buffer.extend_from_slice(f.name.as_bytes());
            w.emit_u32(f.entry_pc);
            w.emit_u32(f.param_count);
            w.emit_u32(f.local_count);
            w.emit_u8(f.is_method as u8);
        }

        w.emit_u32(self.func_map.len() as u32);
        for e in &self.func_map {
            w.emit_u32(e.pc);
            w.emit_u32(e.function_index);
        }

        w.emit_u32(self.code_to_line.len() as u32);
        for e in &self.code_to_line {
            w.emit_u32(e.pc);
            w.emit_u32(e.line);
            w.emit_u32(e.file);
        }

        encode_types(&self.types, &mut w);

        w.emit_u32(self.native_functions.len() as u32);
        for nf in &self.native_functions {
            w.emit_u32(nf.name.len() as u32);
            w.buffer.extend_from_slice(nf.name.as_bytes());
        }

        w.emit_u32(self.native_classes.len() as u32);
        for nc in &self.native_classes {
            w.emit_u32(nc.name.len() as u32);
            w.buffer.extend_from_slice(nc.name.as_bytes());
            w.emit_u32(nc.size);
            w.emit_u32(nc.align);
            w.emit_u8(nc.is_struct as u8);
            encode_opt_u32(&mut w, nc.native_ctor);
            encode_opt_u32(&mut w, nc.native_dtor);
            encode_members(&nc.members, &mut w);
        }

        encode_opt_u32(&mut w, self.global_const_index);
        encode_opt_u32(&mut w, self.global_dest_index);

        w.emit_u32(self.vtbls.len() as u32);
        for v in &self.vtbls {
            w.emit_u32(v.global_offset);
            w.emit_u32(v.count);
        }

        w.emit_u32(self.metadata.name.len() as u32);
        w.buffer.extend_from_slice(self.metadata.name.as_bytes());
        match &self.metadata.source_file {
            Some(p) => {
                w.emit_u8(1);
                w.emit_u32(p.len() as u32);
                w.buffer.extend_from_slice(p.as_bytes());
            }
            None => w.emit_u8(0),
        }

        let payload = &w.buffer[12..];
        let checksum = crc32fast::hash(payload);
        w.patch_u32(checksum_at, checksum);
        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        let mut r = BytecodeReader::new(data);
        let magic: [u8; 4] = r.read_bytes(4)?.try_into().unwrap();
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }
        let flags = r.read_u32()?;
        let stored_checksum = r.read_u32()?;
        let payload = &data[12..];
        let actual = crc32fast::hash(payload);
        if actual != stored_checksum {
            return Err(ModuleError::ChecksumMismatch {
                expected: stored_checksum,
                actual,
            });
        }

        let constants = ConstantPool::decode(&mut r)?;
        let global_arena = GlobalArena::decode(&mut r)?;

        let n = r.read_u32()? as usize;
        let mut instructions = Vec::with_capacity(n);
        for _ in 0..n {
            instructions.push(r.read_u32()?);
        }
        let n = r.read_u32()? as usize;
        let mut barriers = Vec::with_capacity(n);
        for _ in 0..n {
            barriers.push(r.read_u32()?);
        }
        let n = r.read_u32()? as usize;
        let mut loops = Vec::with_capacity(n);
        for _ in 0..n {
            loops.push(r.read_u32()?);
        }
        let n = r.read_u32()? as usize;
        let mut switch_ranges = Vec::with_capacity(n);
        for _ in 0..n {
            switch_ranges.push(SwitchTableRange {
                table_start: r.read_u32()?,
                table_end: r.read_u32()?,
            });
        }

        let n = r.read_u32()? as usize;
        let mut functions = Vec::with_capacity(n);
        for _ in 0..n {
            let name = r.read_string()?;
            let entry_pc = r.read_u32()?;
            let param_count = r.read_u32()?;
            let local_count = r.read_u32()?;
            let is_method = r.read_u8()? != 0;
            functions.push(FunctionDef {
                name,
                entry_pc,
                param_count,
                local_count,
                is_method,
            });
        }

        let n = r.read_u32()? as usize;
        let mut func_map = Vec::with_capacity(n);
        for _ in 0..n {
            func_map.push(FuncMapEntry {
                pc: r.read_u32()?,
                function_index: r.read_u32()?,
            });
        }

        let n = r.read_u32()? as usize;
        let mut code_to_line = Vec::with_capacity(n);
        for _ in 0..n {
            code_to_line.push(LineEntry {
                pc: r.read_u32()?,
                line: r.read_u32()?,
                file: r.read_u32()?,
            });
        }

        let types = decode_types(&mut r)?;

        let n = r.read_u32()? as usize;
        let mut native_functions = Vec::with_capacity(n);
        for _ in 0..n {
            native_functions.push(NativeFunctionSig { name: r.read_string()? });
        }

        let n = r.read_u32()? as usize;
        let mut native_classes = Vec::with_capacity(n);
        for _ in 0..n {
            let name = r.read_string()?;
            let size = r.read_u32()?;
            let align = r.read_u32()?;
            let is_struct = r.read_u8()? != 0;
            let native_ctor = decode_opt_u32(&mut r)?;
            let native_dtor = decode_opt_u32(&mut r)?;
            let members = decode_members(&mut r)?;
            native_classes.push(NativeClassDescriptor {
                name,
                size,
                align,
                is_struct,
                native_ctor,
                native_dtor,
                members,
            });
        }

        let global_const_index = decode_opt_u32(&mut r)?;
        let global_dest_index = decode_opt_u32(&mut r)?;

        let n = r.read_u32()? as usize;
        let mut vtbls = Vec::with_capacity(n);
        for _ in 0..n {
            vtbls.push(VtblRegion {
                global_offset: r.read_u32()?,
                count: r.read_u32()?,
            });
        }

        let name = r.read_string()?;
        let has_source = r.read_u8()? != 0;
        let source_file = if has_source { Some(r.read_string()?) } else { None };

        Ok(Self {
            magic,
            version,
            flags,
            constants,
            global_arena,
            instructions,
            barriers,
            loops,
            switch_ranges,
            functions,
            func_map,
            code_to_line,
            types,
            type_hash: FxHashMap::default(),
            class_type_hash: FxHashMap::default(),
            native_functions,
            native_classes,
            global_const_index,
            global_dest_index,
            vtbls,
            metadata: Metadata { name, source_file },
            breakpoints: Arc::new(RwLock::new(FxHashMap::default())),
        })
    }
}

fn encode_opt_u32(w: &mut BytecodeWriter, v: Option<u32>) {
    match v {
        Some(x) => {
            w.emit_u8(1);
            w.emit_u32(x);
        }
        None => w.emit_u8(0),
    }
}

fn decode_opt_u32(r: &mut BytecodeReader) -> Result<Option<u32>, DecodeError> {
    Ok(if r.read_u8()? != 0 { Some(r.read_u32()?) } else { None })
}

fn encode_members(members: &[MemberDef], w: &mut BytecodeWriter) {
    w.emit_u32(members.len() as u32);
    for m in members {
        w.emit_u32(m.name.len() as u32);
        w.buffer.extend_from_slice(m.name.as_bytes());
        w.emit_u32(m.type_index);
        w.emit_u32(m.offset);
    }
}

fn decode_members(r: &mut BytecodeReader) -> Result<Vec<MemberDef>, DecodeError> {
    let n = r.read_u32()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(MemberDef {
            name: r.read_string()?,
            type_index: r.read_u32()?,
            offset: r.read_u32()?,
        });
    }
    Ok(out)
}

fn tag_to_u8(tag: DataTypeTag) -> u8 {
    use DataTypeTag::*;
    match tag {
        Void => 0,
        Bool => 1,
        Int8 => 2,
        Int16 => 3,
        Int32 => 4,
        Int64 => 5,
        Float => 6,
        Double => 7,
        String => 8,
        Enum => 9,
        Struct => 10,
        Class => 11,
        StrongPtr => 12,
        WeakPtr => 13,
        RawPtr => 14,
        StaticArray => 15,
        DynamicArray => 16,
        ArrayRef => 17,
        FuncPtr => 18,
        Delegate => 19,
        Name => 20,
    }
}

fn tag_from_u8(b: u8) -> Option<DataTypeTag> {
    use DataTypeTag::*;
    Some(match b {
        0 => Void,
        1 => Bool,
        2 => Int8,
        3 => Int16,
        4 => Int32,
        5 => Int64,
        6 => Float,
        7 => Double,
        8 => String,
        9 => Enum,
        10 => Struct,
        11 => Class,
        12 => StrongPtr,
        13 => WeakPtr,
        14 => RawPtr,
        15 => StaticArray,
        16 => DynamicArray,
        17 => ArrayRef,
        18 => FuncPtr,
        19 => Delegate,
        20 => Name,
        _ => return None,
    })
}

fn encode_types(types: &[DataType], w: &mut BytecodeWriter) {
    w.emit_u32(types.len() as u32);
    for t in types {
        w.emit_u32(t.name.len() as u32);
        w.buffer.extend_from_slice(t.name.as_bytes());
        w.emit_u8(tag_to_u8(t.tag));
        w.emit_u32(t.size);
        w.emit_u32(t.align);
        encode_members(&t.members, w);
        encode_opt_u32(w, t.base_type);
        encode_opt_u32(w, t.element_type);
        encode_opt_u32(w, t.ctor_pc);
        encode_opt_u32(w, t.dtor_pc);
        encode_opt_u32(w, t.assign_pc);
        encode_opt_u32(w, t.virtual_ctor_pc);
        encode_opt_u32(w, t.virtual_dtor_pc);
        encode_opt_u32(w, t.virtual_assign_pc);
        encode_opt_u32(w, t.native_ctor);
        encode_opt_u32(w, t.native_dtor);
        w.emit_u32(t.base_chain.len() as u32);
        for n in &t.base_chain {
            w.emit_u32(n.len() as u32);
            w.buffer.extend_from_slice(n.as_bytes());
        }
        w.emit_u32(t.methods.len() as u32);
        for (name, slot) in &t.methods {
            w.emit_u32(name.len() as u32);
            w.buffer.extend_from_slice(name.as_bytes());
            w.emit_i32(slot.encode());
        }
    }
}

fn decode_types(r: &mut BytecodeReader) -> Result<Vec<DataType>, DecodeError> {
    let n = r.read_u32()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let name = r.read_string()?;
        let tag_byte = r.read_u8()?;
        let tag = tag_from_u8(tag_byte).ok_or(DecodeError::InvalidUtf8)?;
        let size = r.read_u32()?;
        let align = r.read_u32()?;
        let members = decode_members(r)?;
        let base_type = decode_opt_u32(r)?;
        let element_type = decode_opt_u32(r)?;
        let ctor_pc = decode_opt_u32(r)?;
        let dtor_pc = decode_opt_u32(r)?;
        let assign_pc = decode_opt_u32(r)?;
        let virtual_ctor_pc = decode_opt_u32(r)?;
        let virtual_dtor_pc = decode_opt_u32(r)?;
        let virtual_assign_pc = decode_opt_u32(r)?;
        let native_ctor = decode_opt_u32(r)?;
        let native_dtor = decode_opt_u32(r)?;
        let chain_n = r.read_u32()? as usize;
        let mut base_chain = Vec::with_capacity(chain_n);
        for _ in 0..chain_n {
            base_chain.push(r.read_string()?);
        }
        let method_n = r.read_u32()? as usize;
        let mut methods = FxHashMap::default();
        for _ in 0..method_n {
            let mname = r.read_string()?;
            let raw = r.read_i32()?;
            methods.insert(mname, MethodSlot::decode(raw));
        }
        out.push(DataType {
            name,
            tag,
            size,
            align,
            members,
            base_type,
            element_type,
            ctor_pc,
            dtor_pc,
            assign_pc,
            virtual_ctor_pc,
            virtual_dtor_pc,
            virtual_assign_pc,
            native_ctor,
            native_dtor,
            base_chain,
            methods,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Instruction, Operand};
    use crate::opcode::Opcode;

    fn sample_program() -> CompiledProgram {
        let mut p = CompiledProgram::new("test");
        let c3 = p.constants.add_integer(3);
        let c4 = p.constants.add_integer(4);
        p.instructions.push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(c3)).encode());
        p.instructions.push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(c4)).encode());
        p.instructions.push(Instruction::new(Opcode::Iadd, Operand::None).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
        p.functions.push(FunctionDef {
            name: "main".to_string(),
            entry_pc: 0,
            param_count: 0,
            local_count: 0,
            is_method: false,
        });
        p.func_map.push(FuncMapEntry { pc: 0, function_index: 0 });
        p
    }

    #[test]
    fn link_is_idempotent() {
        let mut p = sample_program();
        p.link(LinkOptions::default()).unwrap();
        let before = format!("{:?}", p.type_hash);
        p.link(LinkOptions { keep_compiler: true }).unwrap();
        assert_eq!(before, format!("{:?}", p.type_hash));
    }

    #[test]
    fn roundtrip_encode_decode() {
        let mut p = sample_program();
        p.link(LinkOptions::default()).unwrap();
        let bytes = p.encode();
        let decoded = CompiledProgram::decode(&bytes).unwrap();
        assert_eq!(decoded.instructions, p.instructions);
        assert_eq!(decoded.functions.len(), 1);
        assert_eq!(decoded.functions[0].name, "main");
        assert_eq!(decoded.metadata.name, "test");
    }

    #[test]
    fn function_at_resolves_by_pc() {
        let mut p = sample_program();
        p.instructions.push(Instruction::new(Opcode::Nop, Operand::None).encode());
        p.functions.push(FunctionDef {
            name: "second".to_string(),
            entry_pc: 4,
            param_count: 0,
            local_count: 0,
            is_method: false,
        });
        p.func_map.push(FuncMapEntry { pc: 4, function_index: 1 });
        assert_eq!(p.function_at(0).unwrap().name, "main");
        assert_eq!(p.function_at(3).unwrap().name, "main");
        assert_eq!(p.function_at(4).unwrap().name, "second");
    }

    #[test]
    fn checksum_catches_corruption() {
        let p = sample_program();
        let mut bytes = p.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(CompiledProgram::decode(&bytes), Err(ModuleError::ChecksumMismatch { .. })));
    }

    #[test]
    fn method_slot_roundtrip() {
        assert_eq!(MethodSlot::decode(MethodSlot::Code(42).encode()), MethodSlot::Code(42));
        assert_eq!(MethodSlot::decode(MethodSlot::Virtual(3).encode()), MethodSlot::Virtual(3));
        assert_eq!(MethodSlot::decode(MethodSlot::Absent.encode()), MethodSlot::Absent);
    }

    #[test]
    fn isa_binary_search() {
        let ty = DataType {
            name: "Derived".into(),
            tag: DataTypeTag::Class,
            size: 8,
            align: 8,
            members: vec![],
            base_type: None,
            element_type: None,
            ctor_pc: None,
            dtor_pc: None,
            assign_pc: None,
            virtual_ctor_pc: None,
            virtual_dtor_pc: None,
            virtual_assign_pc: None,
            native_ctor: None,
            native_dtor: None,
            base_chain: vec!["Base".into(), "Derived".into(), "Object".into()],
            methods: FxHashMap::default(),
        };
        assert!(ty.isa("Base"));
        assert!(ty.isa("Derived"));
        assert!(!ty.isa("Unrelated"));
    }
}
