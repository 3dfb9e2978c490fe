use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use raya_bytecode::encoder::{Instruction, Operand};
use raya_bytecode::module::{FuncMapEntry, FunctionDef};
use raya_bytecode::{CompiledProgram, Opcode};
use raya_core::vm::interpreter::{BuiltinDispatch, ExecFlags, NativeDispatch, RuntimeError, Vm};
use raya_core::Stack;

struct NoBuiltins;
impl BuiltinDispatch for NoBuiltins {
    fn call(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) -> Result<(), RuntimeError> {
        Ok(())
    }
    fn call_method(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) -> Result<(), RuntimeError> {
        Ok(())
    }
    fn call_trap(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) {}
}

struct NoNatives;
impl NativeDispatch for NoNatives {
    fn call_function(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) -> Result<(), RuntimeError> {
        Ok(())
    }
    fn call_method(&mut self, _: u32, _: &mut Stack, _: &mut [u8]) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// `n` copies of `push-const; iadd` ending in `Halt` — the same dispatch mix
/// `raya-bytecode`'s encode/decode bench exercises, run through the
/// interpreter instead.
fn build_program(n: usize) -> CompiledProgram {
    let mut p = CompiledProgram::new("bench");
    let idx = p.constants.add_integer(1);
    for _ in 0..n {
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

fn bench_interpreter_dispatch(c: &mut Criterion) {
    let program = Arc::new(build_program(10_000));
    let vm = Vm::new(program);

    c.bench_function("interpreter_release_10k_ops", |b| {
        b.iter(|| {
            let mut stack = Stack::new(4096);
            stack.push_int(0).unwrap();
            let mut globals = Vec::new();
            black_box(vm.run(
                &mut stack,
                &mut globals,
                &mut NoBuiltins,
                &mut NoNatives,
                0,
                ExecFlags::RELEASE,
            ))
        })
    });

    c.bench_function("interpreter_debug_10k_ops", |b| {
        b.iter(|| {
            let mut stack = Stack::new(4096);
            stack.push_int(0).unwrap();
            let mut globals = Vec::new();
            black_box(vm.run(
                &mut stack,
                &mut globals,
                &mut NoBuiltins,
                &mut NoNatives,
                0,
                ExecFlags::DEBUG,
            ))
        })
    });
}

criterion_group!(benches, bench_interpreter_dispatch);
criterion_main!(benches);
