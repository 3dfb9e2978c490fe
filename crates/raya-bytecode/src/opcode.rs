//! Bytecode opcodes for the Raya execution core
//!
//! All opcodes are encoded as the low byte of a 32-bit instruction word (see
//! [`crate::encoder`]). The remaining 24 bits carry either a signed/unsigned
//! immediate, a pair of 8-bit fields plus a 16-bit tail, or three 8-bit fields;
//! which layout applies is determined by the opcode (see [`Opcode::operand_layout`]).
//!
//! The primary opcode space is a single byte (256 slots), but the builtin
//! runtime library (64-bit emulation, strings, refcounting, ...) is far wider
//! than that. `BCall`/`BMCall`/`BCallTrap` resolve a *builtin index* at
//! runtime rather than consuming an opcode slot per operation, which is how
//! the instruction set stays inside one byte while still exposing 100+
//! builtin operations (see `raya-builtins`).
//!
//! Families, by primary byte range:
//! - 0x00-0x0F: stack manipulation & constant push
//! - 0x10-0x1F: local variable access (+ fused compounds)
//! - 0x20-0x2F: global data arena access
//! - 0x30-0x3F: indirect (pointer-relative) access
//! - 0x40-0x5F: arithmetic / bitwise
//! - 0x60-0x6F: comparisons (+ fused compare-and-branch)
//! - 0x70-0x7F: branches
//! - 0x80-0x8F: `this` discipline
//! - 0x90-0x9F: function invocation
//! - 0xA0-0xAF: switch / builtin call family
//! - 0xFE: `OPC_BREAK` (debugger patch-in-place target)
//! - 0xFF: reserved (never emitted by a conforming encoder)

/// How the 24 operand bits following the opcode byte are carved up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLayout {
    /// No operand; the instruction is exactly one word.
    None,
    /// A single signed 24-bit immediate.
    Imm24,
    /// A single unsigned 24-bit immediate (constant-pool index, byte offset, ...).
    UImm24,
    /// A PC-relative signed 24-bit branch offset, counted from the word after
    /// this instruction.
    BranchOffset,
    /// Two 8-bit fields (a, b) followed by an unused byte.
    Fields8x2,
    /// One 8-bit field plus a 16-bit tail (used by fused local+const ops).
    Field8Tail16,
    /// A `range` count; the instruction is followed by `range` inline u32
    /// relative jump offsets plus one default-target offset (see `Switch`).
    SwitchRange,
    /// Builtin-call family: a 24-bit unsigned index into the builtin table.
    BuiltinIndex,
}

macro_rules! opcodes {
    (
        $( $(#[$meta:meta])* $variant:ident = $val:expr => $layout:expr ),+ $(,)?
    ) => {
        /// Bytecode opcode enumeration.
        ///
        /// Every variant is the authoritative low byte of an instruction word.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $(#[$meta])* $variant = $val, )+
        }

        impl Opcode {
            /// Decode a byte into an opcode, if it names a valid instruction.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $( $val => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// The operand layout this opcode expects.
            pub fn operand_layout(self) -> OperandLayout {
                match self {
                    $( Self::$variant => $layout, )+
                }
            }

            /// The canonical assembly mnemonic, as emitted by the disassembler.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )+
                }
            }
        }
    };
}

opcodes! {
    // ===== Stack manipulation & constant push (0x00-0x0F) =====
    /// No operation.
    Nop = 0x00 => OperandLayout::None,
    /// Pop `uimm24` words without running destructors.
    Pop = 0x01 => OperandLayout::UImm24,
    /// Duplicate the top word.
    Dup = 0x02 => OperandLayout::None,
    /// Swap the top two words.
    Swap = 0x03 => OperandLayout::None,
    /// Push a signed 24-bit int immediate; falls back to `PushCIConst` when
    /// the literal does not fit.
    PushIConst = 0x04 => OperandLayout::Imm24,
    /// Push an int from the int constant-pool sub-arena (uimm24 index).
    PushCIConst = 0x05 => OperandLayout::UImm24,
    /// Push a float from the float constant-pool sub-arena.
    PushCFConst = 0x06 => OperandLayout::UImm24,
    /// Push a double from the double constant-pool sub-arena.
    PushCDConst = 0x07 => OperandLayout::UImm24,
    /// Push a 64-bit long constant (index into the long sub-arena); on
    /// 32-bit hosts the value occupies two stack words.
    PushCLConst = 0x08 => OperandLayout::UImm24,
    /// Push a string constant (index into the string sub-arena).
    PushCStr = 0x09 => OperandLayout::UImm24,
    /// Push an interned name (index into the name sub-arena).
    PushCName = 0x0A => OperandLayout::UImm24,
    /// Push a function pointer: `imm24` PC-relative offset to the target.
    PushFunc = 0x0B => OperandLayout::Imm24,
    /// Push a raw zeroed slot, reserving room for a local (`uimm24` words).
    PushRawZero = 0x0C => OperandLayout::UImm24,
    /// Push `uimm24` raw (uninitialized) words.
    PushRaw = 0x0D => OperandLayout::UImm24,
    /// Reserve and align a struct-by-value slot: fields (align, size_words).
    PushStruct = 0x0E => OperandLayout::Fields8x2,
    /// Validate remaining stack headroom against `uimm24` words; traps on
    /// underflow. Emitted at function entry.
    ChkStk = 0x0F => OperandLayout::UImm24,

    // ===== Local variable access (0x10-0x1F) =====
    /// Load an 8-bit signed local (`uimm24` byte offset from top).
    LPush8 = 0x10 => OperandLayout::UImm24,
    LPush8U = 0x11 => OperandLayout::UImm24,
    LPush16 = 0x12 => OperandLayout::UImm24,
    LPush16U = 0x13 => OperandLayout::UImm24,
    LPush32 = 0x14 => OperandLayout::UImm24,
    LPush32F = 0x15 => OperandLayout::UImm24,
    /// Load a 64-bit double local (two words).
    LPush64D = 0x16 => OperandLayout::UImm24,
    LPushPtr = 0x17 => OperandLayout::UImm24,
    /// Push the address of a local (`uimm24` byte offset).
    LPushAdr = 0x18 => OperandLayout::UImm24,
    /// Store top-of-stack into an 8-bit local, then pop.
    LStore8 = 0x19 => OperandLayout::UImm24,
    LStore16 = 0x1A => OperandLayout::UImm24,
    LStore32 = 0x1B => OperandLayout::UImm24,
    LStore32F = 0x1C => OperandLayout::UImm24,
    LStore64D = 0x1D => OperandLayout::UImm24,
    LStorePtr = 0x1E => OperandLayout::UImm24,
    /// Fused: push local (`uimm8` offset) then push an inline int const
    /// (`uimm16` tail). Mandatory fusion target for `LPUSHADR + PLOAD32_IMM`-
    /// style code generator patterns; the JIT's address-mode fuser depends
    /// on this opcode existing rather than two separate instructions.
    LPush32IConst = 0x1F => OperandLayout::Field8Tail16,

    // ===== Global data arena access (0x20-0x2F) =====
    GLoad8 = 0x20 => OperandLayout::UImm24,
    GLoad8U = 0x21 => OperandLayout::UImm24,
    GLoad16 = 0x22 => OperandLayout::UImm24,
    GLoad16U = 0x23 => OperandLayout::UImm24,
    GLoad32 = 0x24 => OperandLayout::UImm24,
    GLoad32F = 0x25 => OperandLayout::UImm24,
    GLoad64D = 0x26 => OperandLayout::UImm24,
    GLoadPtr = 0x27 => OperandLayout::UImm24,
    /// Push the address of a global (`uimm24` byte offset).
    GLoadAdr = 0x28 => OperandLayout::UImm24,
    GStore8 = 0x29 => OperandLayout::UImm24,
    GStore16 = 0x2A => OperandLayout::UImm24,
    GStore32 = 0x2B => OperandLayout::UImm24,
    GStore32F = 0x2C => OperandLayout::UImm24,
    GStore64D = 0x2D => OperandLayout::UImm24,
    GStorePtr = 0x2E => OperandLayout::UImm24,
    /// Move within the current frame without touching top: (dst, src) local
    /// byte offsets packed as two 8-bit fields.
    LMove32 = 0x2F => OperandLayout::Fields8x2,

    // ===== Indirect (pointer-relative) access (0x30-0x3F) =====
    /// Pointer and offset already on stack; scaled by `uimm24` bytes.
    PLoad8 = 0x30 => OperandLayout::UImm24,
    PLoad8U = 0x31 => OperandLayout::UImm24,
    PLoad16 = 0x32 => OperandLayout::UImm24,
    PLoad16U = 0x33 => OperandLayout::UImm24,
    PLoad32 = 0x34 => OperandLayout::UImm24,
    PLoad32F = 0x35 => OperandLayout::UImm24,
    PLoad64D = 0x36 => OperandLayout::UImm24,
    PLoadPtr = 0x37 => OperandLayout::UImm24,
    /// Top-of-stack is a raw pointer; load `[ptr + uimm24]` directly (the
    /// `_IMM` family, the result of `LPUSHADR + PLOAD32_IMM` fusion upstream).
    PLoad32Imm = 0x38 => OperandLayout::UImm24,
    PStore32Imm = 0x39 => OperandLayout::UImm24,
    PStorePtrImm = 0x3A => OperandLayout::UImm24,
    /// Pre-increment: pop ptr, add `imm24`, store, push the new value.
    PIncPre = 0x3B => OperandLayout::Imm24,
    /// Post-increment: pop ptr, add `imm24`, store, push the old value.
    PIncPost = 0x3C => OperandLayout::Imm24,
    /// Scaled pointer add: local index (`uimm24`) selects the base local,
    /// which is scale-added onto the pointer at the top of stack.
    LAAdd = 0x3D => OperandLayout::UImm24,
    /// Static-array bounds check against an immediate limit; traps with
    /// "array index out of bounds" on failure.
    RangeIConst = 0x3E => OperandLayout::UImm24,
    /// Dynamic array / array-ref bounds check: pops index, limit; pushes index.
    Range = 0x3F => OperandLayout::None,

    // ===== Arithmetic / bitwise (0x40-0x5F) =====
    Iadd = 0x40 => OperandLayout::None,
    Isub = 0x41 => OperandLayout::None,
    Imul = 0x42 => OperandLayout::None,
    /// Integer division; traps "divide by zero" on a zero denominator.
    Idiv = 0x43 => OperandLayout::None,
    /// Integer modulo; traps "divide by zero" on a zero denominator.
    Imod = 0x44 => OperandLayout::None,
    Ineg = 0x45 => OperandLayout::None,
    Iand = 0x46 => OperandLayout::None,
    Ior = 0x47 => OperandLayout::None,
    Ixor = 0x48 => OperandLayout::None,
    Inot = 0x49 => OperandLayout::None,
    Ishl = 0x4A => OperandLayout::None,
    Ishr = 0x4B => OperandLayout::None,
    Ushr = 0x4C => OperandLayout::None,
    /// One-operand form: the second operand comes from `imm24`.
    IaddIConst = 0x4D => OperandLayout::Imm24,
    /// Fused: add two locals (`uimm8` offsets) with an inline constant tail.
    LIaddIConst = 0x4E => OperandLayout::Field8Tail16,
    Fadd = 0x4F => OperandLayout::None,
    Fsub = 0x50 => OperandLayout::None,
    Fmul = 0x51 => OperandLayout::None,
    Fdiv = 0x52 => OperandLayout::None,
    Fneg = 0x53 => OperandLayout::None,
    Dadd = 0x54 => OperandLayout::None,
    Dsub = 0x55 => OperandLayout::None,
    Dmul = 0x56 => OperandLayout::None,
    Ddiv = 0x57 => OperandLayout::None,
    Dneg = 0x58 => OperandLayout::None,
    /// `i32 -> f32` conversion.
    Itof = 0x59 => OperandLayout::None,
    /// `i32 -> f64` conversion.
    Itod = 0x5A => OperandLayout::None,
    /// `f32 -> i32`, well-defined on out-of-range input (see
    /// `WellDefinedFloatToUnsigned` in the interpreter).
    Ftoi = 0x5B => OperandLayout::None,
    /// `f64 -> i32`, well-defined on out-of-range input.
    Dtoi = 0x5C => OperandLayout::None,
    /// `f32 -> f64` widening conversion.
    Ftod = 0x5D => OperandLayout::None,
    /// `f64 -> f32` narrowing conversion.
    Dtof = 0x5E => OperandLayout::None,
    /// `f32/f64 -> u32`, well-defined for negative and overflowing inputs.
    ToUi = 0x5F => OperandLayout::None,

    // ===== Comparisons incl. fused compare-and-branch (0x60-0x6F) =====
    Ieq = 0x60 => OperandLayout::None,
    Ine = 0x61 => OperandLayout::None,
    Ilt = 0x62 => OperandLayout::None,
    Ile = 0x63 => OperandLayout::None,
    Igt = 0x64 => OperandLayout::None,
    Ige = 0x65 => OperandLayout::None,
    /// Float/double compare results are 0/1; NaN is "ordered false" for every
    /// relation except `!=`, which returns 1 for NaN operands.
    Feq = 0x66 => OperandLayout::None,
    Fne = 0x67 => OperandLayout::None,
    Flt = 0x68 => OperandLayout::None,
    Fle = 0x69 => OperandLayout::None,
    Fgt = 0x6A => OperandLayout::None,
    Fge = 0x6B => OperandLayout::None,
    /// Fused compare-and-branch: pop b, pop a; branch (`BranchOffset`) if
    /// `a == b`. The `IB*` family folds a comparison and a conditional jump
    /// into one instruction so the JIT never has to materialize the boolean.
    IBeq = 0x6C => OperandLayout::BranchOffset,
    IBne = 0x6D => OperandLayout::BranchOffset,
    IBlt = 0x6E => OperandLayout::BranchOffset,
    IBge = 0x6F => OperandLayout::BranchOffset,

    // ===== Branches (0x70-0x7F) =====
    /// Unconditional branch.
    Br = 0x70 => OperandLayout::BranchOffset,
    /// Pop int; branch if zero.
    IBzP = 0x71 => OperandLayout::BranchOffset,
    /// Pop int; branch if nonzero.
    IBnzP = 0x72 => OperandLayout::BranchOffset,
    FBzP = 0x73 => OperandLayout::BranchOffset,
    FBnzP = 0x74 => OperandLayout::BranchOffset,
    DBzP = 0x75 => OperandLayout::BranchOffset,
    DBnzP = 0x76 => OperandLayout::BranchOffset,
    /// Branch-or-pop: the value is kept on the stack when the branch *is*
    /// taken; used for short-circuit `&&`/`||` evaluation. Branches when the
    /// top is zero, otherwise pops.
    IBz = 0x77 => OperandLayout::BranchOffset,
    /// Branch-or-pop: branches when the top is nonzero, otherwise pops.
    IBnz = 0x78 => OperandLayout::BranchOffset,
    /// Jump if the top pointer is null (pop).
    PBzP = 0x79 => OperandLayout::BranchOffset,
    /// Jump if the top pointer is non-null (pop).
    PBnzP = 0x7A => OperandLayout::BranchOffset,

    // ===== `this` discipline (0x80-0x8F) =====
    /// Install a new `this`, saving the old value on the stack first.
    LoadThis = 0x80 => OperandLayout::None,
    /// Install a new `this` without saving the old value (leaf call site).
    LoadThisImm = 0x81 => OperandLayout::None,
    /// Save the current `this` onto the stack (paired with `PopThis`).
    PushThis = 0x82 => OperandLayout::None,
    /// Push an ephemeral copy of `this` for a nested call, without touching
    /// the saved-`this` stack slot that `PopThis` will restore.
    PushThisTemp = 0x83 => OperandLayout::None,
    /// Restore `this` from the stack (must pair with a prior `PushThis`).
    PopThis = 0x84 => OperandLayout::None,

    // ===== Function invocation (0x90-0x9F) =====
    /// Call by PC-relative `imm24` target; pushes one return-address slot.
    Call = 0x90 => OperandLayout::Imm24,
    /// Call through a code pointer already on the stack.
    FCall = 0x91 => OperandLayout::None,
    /// Call through a delegate `{this, target}` pair; bit 0 of the target
    /// word selects vtable-index vs direct-code-pointer decoding, bit 1
    /// marks a struct (non-object) instance.
    FCallDg = 0x92 => OperandLayout::None,
    /// Virtual call: index into the receiver's vtable (`uimm24`).
    VCall = 0x93 => OperandLayout::UImm24,
    /// Call a native static function by table index (`uimm24`).
    NCall = 0x94 => OperandLayout::UImm24,
    /// Call a native method by table index (`uimm24`).
    NMCall = 0x95 => OperandLayout::UImm24,
    /// Return, popping the return slot plus `uimm24` extra argument words.
    Ret = 0x96 => OperandLayout::UImm24,
    /// Unconditional halt: stops interpretation cleanly (sentinel return).
    Halt = 0x97 => OperandLayout::None,

    // ===== Switch / builtin call family (0xA0-0xAF) =====
    /// Pop an unsigned int `i`; if `i >= range` branch to the inline default
    /// target, else branch to the `i`-th inline relative offset. See
    /// [`OperandLayout::SwitchRange`].
    Switch = 0xA0 => OperandLayout::SwitchRange,
    /// Call a builtin by table index (`uimm24`); see `raya-builtins`.
    BCall = 0xA1 => OperandLayout::BuiltinIndex,
    /// Call a builtin as a method (receiver already on stack).
    BMCall = 0xA2 => OperandLayout::BuiltinIndex,
    /// Call a builtin that may fail; on failure leaves a char-pointer error
    /// message on the stack instead of a normal result.
    BCallTrap = 0xA3 => OperandLayout::BuiltinIndex,

    /// Debugger patch-in-place target: records the PC and returns
    /// `Breakpoint`. Never emitted by the encoder; only installed by
    /// the debugger's breakpoint machinery (see `raya-core::vm::debug`).
    OpcBreak = 0xFE => OperandLayout::None,
}

impl Opcode {
    /// True if this opcode is one of the branch forms (unconditional,
    /// conditional-pop, or branch-or-pop).
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Self::Br
                | Self::IBzP
                | Self::IBnzP
                | Self::FBzP
                | Self::FBnzP
                | Self::DBzP
                | Self::DBnzP
                | Self::IBz
                | Self::IBnz
                | Self::PBzP
                | Self::PBnzP
                | Self::IBeq
                | Self::IBne
                | Self::IBlt
                | Self::IBge
        )
    }

    /// True if this opcode invokes a callee (bytecode, native, or builtin).
    pub fn is_call(self) -> bool {
        matches!(
            self,
            Self::Call
                | Self::FCall
                | Self::FCallDg
                | Self::VCall
                | Self::NCall
                | Self::NMCall
                | Self::BCall
                | Self::BMCall
                | Self::BCallTrap
        )
    }

    /// True if execution cannot fall through to the next instruction.
    pub fn is_terminator(self) -> bool {
        self.is_branch() || matches!(self, Self::Ret | Self::Halt | Self::Switch)
    }

    /// True if this is a `this`-discipline opcode the debugger's frame
    /// reconstruction must track (§4.8).
    pub fn is_this_discipline(self) -> bool {
        matches!(
            self,
            Self::LoadThis | Self::LoadThisImm | Self::PushThis | Self::PushThisTemp | Self::PopThis
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_every_opcode() {
        for byte in 0u8..=255 {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn invalid_bytes_reject() {
        assert_eq!(Opcode::from_u8(0xC0), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn families_classify_correctly() {
        assert!(Opcode::Br.is_branch());
        assert!(Opcode::IBeq.is_branch());
        assert!(!Opcode::Call.is_branch());

        assert!(Opcode::Call.is_call());
        assert!(Opcode::BCall.is_call());
        assert!(!Opcode::Iadd.is_call());

        assert!(Opcode::Ret.is_terminator());
        assert!(Opcode::Switch.is_terminator());
        assert!(!Opcode::Iadd.is_terminator());

        assert!(Opcode::LoadThis.is_this_discipline());
        assert!(!Opcode::PushIConst.is_this_discipline());
    }

    #[test]
    fn divide_family_present() {
        assert_eq!(Opcode::Idiv.name(), "Idiv");
        assert_eq!(Opcode::Imod.operand_layout(), OperandLayout::None);
    }
}
