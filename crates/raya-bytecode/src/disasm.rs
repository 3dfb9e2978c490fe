//! A disassembler: pure `&[u32] -> String`, no I/O.
//!
//! Supplements the distilled spec with a capability `original_source/`
//! carries (the original engine's own disassembler, which backs the debug
//! server's `disassemble` command, spec §6). Skips inline switch tables per
//! [`CompiledProgram::is_switch_table_pc`] rather than attempting to decode
//! them as instructions.

use std::fmt::Write as _;

use crate::encoder::{Instruction, Operand};
use crate::module::CompiledProgram;

/// Disassemble every instruction in `program`, one line per PC.
pub fn disassemble(program: &CompiledProgram) -> String {
    let mut out = String::new();
    let len = program.instructions.len() as u32;
    let mut pc = 0u32;
    while pc < len {
        if program.is_switch_table_pc(pc) {
            let _ = writeln!(out, "{pc:>6}: <switch table word 0x{:08X}>", program.instructions[pc as usize]);
            pc += 1;
            continue;
        }
        let word = program.instructions[pc as usize];
        match Instruction::decode(word) {
            Ok(instr) => {
                let _ = writeln!(out, "{pc:>6}: {}", format_instruction(pc, instr));
            }
            Err(e) => {
                let _ = writeln!(out, "{pc:>6}: <bad instruction 0x{word:08X}: {e}>");
            }
        }
        pc += 1;
    }
    out
}

fn format_instruction(pc: u32, instr: Instruction) -> String {
    let mnemonic = instr.opcode.name();
    match instr.operand {
        Operand::None => mnemonic.to_string(),
        Operand::Imm24(v) => format!("{mnemonic} {v}"),
        Operand::UImm24(v) => format!("{mnemonic} {v}"),
        Operand::BranchOffset(off) => {
            let target = (pc as i64) + 1 + (off as i64);
            format!("{mnemonic} {off:+} -> {target}")
        }
        Operand::Fields8x2(a, b) => format!("{mnemonic} {a}, {b}"),
        Operand::Field8Tail16(a, tail) => format!("{mnemonic} {a}, {tail}"),
        Operand::SwitchRange(range) => format!("{mnemonic} range={range}"),
        Operand::BuiltinIndex(idx) => format!("{mnemonic} #{idx}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Instruction, Operand};
    use crate::module::CompiledProgram;
    use crate::opcode::Opcode;

    #[test]
    fn disassembles_simple_program() {
        let mut p = CompiledProgram::new("t");
        let idx = p.constants.add_integer(7);
        p.instructions.push(Instruction::new(Opcode::PushCIConst, Operand::UImm24(idx)).encode());
        p.instructions.push(Instruction::new(Opcode::Halt, Operand::None).encode());
        let text = disassemble(&p);
        assert!(text.contains("PushCIConst 0"));
        assert!(text.contains("Halt"));
    }

    #[test]
    fn branch_offsets_show_resolved_target() {
        let mut p = CompiledProgram::new("t");
        p.instructions.push(Instruction::new(Opcode::Br, Operand::BranchOffset(2)).encode());
        let text = disassemble(&p);
        assert!(text.contains("-> 3"));
    }

    #[test]
    fn switch_table_words_are_not_decoded_as_instructions() {
        let mut p = CompiledProgram::new("t");
        p.instructions.push(Instruction::new(Opcode::Switch, Operand::SwitchRange(1)).encode());
        p.instructions.push(0xFFFF_FFFF); // would not decode as a valid instruction
        p.instructions.push(0);
        p.switch_ranges.push(crate::module::SwitchTableRange { table_start: 1, table_end: 3 });
        let text = disassemble(&p);
        assert!(text.contains("switch table word"));
    }
}
