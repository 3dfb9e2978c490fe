//! Bytecode verification.
//!
//! A conservative structural check run once at link time (and available to
//! hosts that want to re-verify before trusting untrusted bytecode): every
//! instruction decodes to an allocated opcode, every branch target lands on
//! an instruction boundary (never inside an inline switch table), constant-
//! pool references are in range, and every function's entry point is a
//! valid instruction offset.
//!
//! This is not a full dataflow verifier (the original engine doesn't ship
//! one either — trust in the bytecode comes from trusting the compiler that
//! produced it); it exists to turn corrupted or hand-assembled bytecode into
//! an early, precise error instead of a later out-of-bounds panic.

use thiserror::Error;

use crate::encoder::{DecodeError, Instruction, Operand};
use crate::module::{CompiledProgram, FunctionDef};
use crate::opcode::Opcode;

/// Bytecode verification errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("decode error at pc {pc}: {source}")]
    Decode { pc: u32, source: DecodeError },

    #[error("branch at pc {pc} targets {target}, which is outside the instruction stream")]
    BranchOutOfBounds { pc: u32, target: i64 },

    #[error("branch at pc {pc} targets {target}, which falls inside a switch table")]
    BranchIntoSwitchTable { pc: u32, target: u32 },

    #[error("switch at pc {pc} has an inline table that runs past the end of the instruction stream")]
    SwitchTableOutOfBounds { pc: u32 },

    #[error("function `{name}` entry pc {entry_pc} is out of bounds")]
    BadFunctionEntry { name: String, entry_pc: u32 },

    #[error("constant pool reference {index} out of range (len {len}) at pc {pc}")]
    BadConstantRef { pc: u32, index: u32, len: u32 },
}

/// Verify every structural invariant [`CompiledProgram`] must hold before a
/// linked program is safe to execute.
pub fn verify_program(program: &CompiledProgram) -> Result<(), VerifyError> {
    let len = program.instructions.len() as u32;

    let mut pc = 0u32;
    while pc < len {
        if program.is_switch_table_pc(pc) {
            pc += 1;
            continue;
        }
        let word = program.instructions[pc as usize];
        let instr = Instruction::decode(word).map_err(|e| VerifyError::Decode { pc, source: e })?;

        match (instr.opcode, instr.operand) {
            (_, Operand::BranchOffset(offset)) => {
                let target = (pc as i64) + 1 + (offset as i64);
                if target < 0 || target as u64 >= len as u64 {
                    return Err(VerifyError::BranchOutOfBounds { pc, target });
                }
                if program.is_switch_table_pc(target as u32) {
                    return Err(VerifyError::BranchIntoSwitchTable { pc, target: target as u32 });
                }
            }
            (_, Operand::SwitchRange(range)) => {
                let table_start = pc + 1;
                let table_end = table_start + range + 1; // +1 for the inline default target
                if table_end as u64 > len as u64 {
                    return Err(VerifyError::SwitchTableOutOfBounds { pc });
                }
            }
            (Opcode::PushCIConst, Operand::UImm24(idx)) => {
                check_const_ref(pc, idx, program.constants.integers.len() as u32)?;
            }
            (Opcode::PushCFConst, Operand::UImm24(idx)) => {
                check_const_ref(pc, idx, program.constants.floats.len() as u32)?;
            }
            (Opcode::PushCDConst, Operand::UImm24(idx)) => {
                check_const_ref(pc, idx, program.constants.doubles.len() as u32)?;
            }
            (Opcode::PushCLConst, Operand::UImm24(idx)) => {
                check_const_ref(pc, idx, program.constants.longs.len() as u32)?;
            }
            (Opcode::PushCStr, Operand::UImm24(idx)) => {
                check_const_ref(pc, idx, program.constants.strings.len() as u32)?;
            }
            (Opcode::PushCName, Operand::UImm24(idx)) => {
                check_const_ref(pc, idx, program.constants.names.len() as u32)?;
            }
            _ => {}
        }

        pc += 1;
    }

    for f in &program.functions {
        verify_function_entry(f, len)?;
    }

    Ok(())
}

fn check_const_ref(pc: u32, index: u32, len: u32) -> Result<(), VerifyError> {
    if index >= len {
        return Err(VerifyError::BadConstantRef { pc, index, len });
    }
    Ok(())
}

fn verify_function_entry(f: &FunctionDef, instr_len: u32) -> Result<(), VerifyError> {
    if f.entry_pc >= instr_len {
        return Err(VerifyError::BadFunctionEntry {
            name: f.name.clone(),
            entry_pc: f.entry_pc,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ConstantPool;
    use crate::encoder::{Instruction, Operand};
    use crate::module::{CompiledProgram, FuncMapEntry, FunctionDef, SwitchTableRange};
    use crate::opcode::Opcode;

    fn base_program() -> CompiledProgram {
        let mut p = CompiledProgram::new("t");
        p.constants = ConstantPool::new();
        p
    }

    #[test]
    fn accepts_wellformed_program() {
        let mut p = base_program();
        let c = p.constants.add_integer(1);
        p.instructions.push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(c)).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
        p.functions.push(FunctionDef {
            name: "main".into(),
            entry_pc: 0,
            param_count: 0,
            local_count: 0,
            is_method: false,
        });
        p.func_map.push(FuncMapEntry { pc: 0, function_index: 0 });
        assert!(verify_program(&p).is_ok());
    }

    #[test]
    fn rejects_branch_out_of_bounds() {
        let mut p = base_program();
        p.instructions.push(Instruction::new(Opcode::Br, Operand::BranchOffset(100)).encode());
        assert!(matches!(verify_program(&p), Err(VerifyError::BranchOutOfBounds { .. })));
    }

    #[test]
    fn rejects_branch_into_switch_table() {
        let mut p = base_program();
        p.instructions.push(Instruction::new(Opcode::Br, Operand::BranchOffset(0)).encode());
        p.instructions.push(0); // inline table word
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
        p.switch_ranges.push(SwitchTableRange { table_start: 1, table_end: 2 });
        assert!(matches!(verify_program(&p), Err(VerifyError::BranchIntoSwitchTable { .. })));
    }

    #[test]
    fn rejects_bad_constant_ref() {
        let mut p = base_program();
        p.instructions.push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(5)).encode());
        assert!(matches!(verify_program(&p), Err(VerifyError::BadConstantRef { .. })));
    }

    #[test]
    fn rejects_bad_function_entry() {
        let mut p = base_program();
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
        p.functions.push(FunctionDef {
            name: "ghost".into(),
            entry_pc: 50,
            param_count: 0,
            local_count: 0,
            is_method: false,
        });
        assert!(matches!(verify_program(&p), Err(VerifyError::BadFunctionEntry { .. })));
    }

    #[test]
    fn switch_table_out_of_bounds_rejected() {
        let mut p = base_program();
        p.instructions.push(Instruction::new(Opcode::Switch, Operand::SwitchRange(4)).encode());
        assert!(matches!(verify_program(&p), Err(VerifyError::SwitchTableOutOfBounds { .. })));
    }
}
