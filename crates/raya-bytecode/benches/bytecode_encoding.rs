use criterion::{black_box, criterion_group, criterion_main, Criterion};
use raya_bytecode::encoder::{Instruction, Operand};
use raya_bytecode::module::{FuncMapEntry, FunctionDef, LinkOptions};
use raya_bytecode::{CompiledProgram, Opcode};

fn build_program(n: usize) -> CompiledProgram {
    let mut p = CompiledProgram::new("bench");
    for i in 0..n {
        let idx = p.constants.add_integer(i as i32);
        p.instructions
            .push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(idx)).encode());
        p.instructions.push(Instruction::new(Opcode::Iadd, Operand::None).encode());
    }
    p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
    p.functions.push(FunctionDef {
        name: "main".into(),
        entry_pc: 0,
        param_count: 0,
        local_count: 0,
        is_method: false,
    });
    p.func_map.push(FuncMapEntry { pc: 0, function_index: 0 });
    p
}

fn bench_encode_decode(c: &mut Criterion) {
    let mut program = build_program(1000);
    program.link(LinkOptions::default()).unwrap();

    c.bench_function("compiled_program_encode_1000", |b| {
        b.iter(|| black_box(program.encode()))
    });

    let bytes = program.encode();
    c.bench_function("compiled_program_decode_1000", |b| {
        b.iter(|| black_box(CompiledProgram::decode(&bytes).unwrap()))
    });

    c.bench_function("instruction_decode_single", |b| {
        let word = Instruction::new(Opcode::Iadd, Operand::None).encode();
        b.iter(|| black_box(Instruction::decode(black_box(word)).unwrap()))
    });
}

criterion_group!(benches, bench_encode_decode);
criterion_main!(benches);
