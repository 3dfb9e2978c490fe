//! Integration tests spanning the constant pool, encoder, module format,
//! and verifier together — the things a single unit test can't exercise
//! because they require a realistic, fully-linked program.

use raya_bytecode::encoder::{Instruction, Operand};
use raya_bytecode::module::{FuncMapEntry, FunctionDef, LinkOptions, LineEntry, VtblRegion};
use raya_bytecode::{verify_program, CompiledProgram, Opcode};

fn push_i(p: &mut CompiledProgram, v: i32) {
    let idx = p.constants.add_integer(v);
    p.instructions
        .push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(idx)).encode());
}

/// `E1` from spec §8: `PUSH_ICONST 3; PUSH_ICONST 4; IADD; HALT` leaves 7 on
/// the stack top.
#[test]
fn e1_three_plus_four_links_and_verifies() {
    let mut p = CompiledProgram::new("e1");
    push_i(&mut p, 3);
    push_i(&mut p, 4);
    p.instructions.push(Instruction::new(Opcode::Iadd, Operand::None).encode());
    p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
    p.functions.push(FunctionDef {
        name: "main".into(),
        entry_pc: 0,
        param_count: 0,
        local_count: 0,
        is_method: false,
    });
    p.func_map.push(FuncMapEntry { pc: 0, function_index: 0 });

    p.link(LinkOptions::default()).expect("link");
    verify_program(&p).expect("verify");

    let roundtrip = CompiledProgram::decode(&p.encode()).expect("decode");
    assert_eq!(roundtrip.instructions, p.instructions);
    assert_eq!(roundtrip.function_at(2).unwrap().name, "main");
}

/// A branching control-flow shape (branch back to entry) must survive
/// link + verify + roundtrip, exercising branch-offset math and the
/// `funcMap`/`codeToLine` binary searches together.
#[test]
fn branching_program_with_debug_info() {
    let mut p = CompiledProgram::new("loopy");
    // pc0: br +1 (to pc2)
    p.instructions.push(Instruction::new(Opcode::Br, Operand::BranchOffset(1)).encode());
    // pc1: dead nop, never reached by this test's flow but must still decode
    p.instructions.push(Instruction::new(Opcode::Nop, Operand::None).encode());
    // pc2: halt
    p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());

    p.loops.push(0);
    p.barriers.push(0);
    p.barriers.push(2);

    let file = p.constants.add_name("loopy.rs");
    p.code_to_line.push(LineEntry { pc: 0, line: 10, file });
    p.code_to_line.push(LineEntry { pc: 2, line: 12, file });

    p.functions.push(FunctionDef {
        name: "main".into(),
        entry_pc: 0,
        param_count: 0,
        local_count: 0,
        is_method: false,
    });
    p.func_map.push(FuncMapEntry { pc: 0, function_index: 0 });

    p.link(LinkOptions::default()).unwrap();
    verify_program(&p).unwrap();

    assert_eq!(p.line_at(1).unwrap().line, 10);
    assert_eq!(p.line_at(2).unwrap().line, 12);

    let decoded = CompiledProgram::decode(&p.encode()).unwrap();
    assert_eq!(decoded.loops, vec![0]);
    assert_eq!(decoded.barriers, vec![0, 2]);
}

/// A switch's inline jump table must round-trip and must never be mistaken
/// for instructions by the verifier.
#[test]
fn switch_table_roundtrips_and_is_skipped() {
    let mut p = CompiledProgram::new("switchy");
    p.instructions
        .push(Instruction::new(Opcode::Switch, Operand::SwitchRange(2)).encode());
    p.instructions.push(10); // case 0 offset
    p.instructions.push(20); // case 1 offset
    p.instructions.push(30); // default offset
    p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
    p.switch_ranges.push(raya_bytecode::module::SwitchTableRange {
        table_start: 1,
        table_end: 4,
    });

    verify_program(&p).unwrap();
    assert!(p.is_switch_table_pc(1));
    assert!(p.is_switch_table_pc(3));
    assert!(!p.is_switch_table_pc(4));

    let decoded = CompiledProgram::decode(&p.encode()).unwrap();
    assert_eq!(decoded.switch_ranges.len(), 1);
}

/// Vtable regions and a class's method table (mixed PC/vtable-slot
/// resolutions) must survive a full encode/decode cycle.
#[test]
fn class_vtable_roundtrip() {
    use raya_bytecode::module::{DataType, DataTypeTag, MethodSlot};
    use rustc_hash::FxHashMap;

    let mut p = CompiledProgram::new("withclass");
    let mut methods = FxHashMap::default();
    methods.insert("speak".to_string(), MethodSlot::Virtual(0));
    methods.insert("helper".to_string(), MethodSlot::Code(100));

    p.types.push(DataType {
        name: "Animal".into(),
        tag: DataTypeTag::Class,
        size: 16,
        align: 8,
        members: vec![],
        base_type: None,
        element_type: None,
        ctor_pc: Some(4),
        dtor_pc: Some(8),
        assign_pc: None,
        virtual_ctor_pc: None,
        virtual_dtor_pc: Some(0),
        virtual_assign_pc: None,
        native_ctor: None,
        native_dtor: None,
        base_chain: vec!["Animal".into()],
        methods,
    });
    p.vtbls.push(VtblRegion { global_offset: 64, count: 3 });

    p.link(LinkOptions::default()).unwrap();
    assert_eq!(p.class_type_hash.get("Animal"), Some(&0));

    let decoded = CompiledProgram::decode(&p.encode()).unwrap();
    assert_eq!(decoded.types.len(), 1);
    assert_eq!(decoded.types[0].methods.get("speak"), Some(&MethodSlot::Virtual(0)));
    assert_eq!(decoded.types[0].methods.get("helper"), Some(&MethodSlot::Code(100)));
    assert_eq!(decoded.vtbls[0].count, 3);
}
