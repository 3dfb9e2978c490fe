//! Decides whether a bytecode function starting at a given `pc` is a safe
//! JIT candidate, and decodes its instructions into a small linear form the
//! lowering pass consumes (spec §4.6 "structure").
//!
//! The eligible subset is deliberately narrow: pure-stack integer arithmetic,
//! comparisons, and branches, with no calls of any kind (`Call`, `FCall`,
//! `VCall`, `NCall`, `BCall`, ...), no `this`, no locals/globals, no structs
//! or strings. The no-calls restriction is what makes the whole-function
//! compilation scheme sound: a function that never transfers control into
//! another bytecode function can never have a return address on the stack
//! other than the halt sentinel `ExecutionContext::run_with_sentinel` pushes
//! immediately before invoking it, so every `Ret` the compiled code executes
//! is known, at compile time, to terminate the call successfully.

use raya_bytecode::encoder::{Instruction, Operand};
use raya_bytecode::module::CompiledProgram;
use raya_bytecode::Opcode;

/// One decoded instruction, tagged with its absolute program `pc`.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstr {
    pub pc: u32,
    pub opcode: Opcode,
    pub operand: Operand,
}

/// A function body accepted for JIT compilation: a flat instruction list
/// plus the set of `pc`s that are branch targets (block boundaries).
#[derive(Debug, Clone)]
pub struct EligibleFunction {
    pub entry_pc: u32,
    pub instructions: Vec<DecodedInstr>,
    pub block_starts: Vec<u32>,
}

/// Why a function was rejected. Purely diagnostic (`tracing` only) — the
/// caller's only real decision is "eligible or not".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    UnsupportedOpcode(Opcode),
    TooFewInstructions,
    NoTerminator,
    RunawayScan,
}

/// Instruction budget for the forward scan, guarding against decode loops on
/// malformed `pc`s (the scan has no other way to detect "this isn't really a
/// function entry").
const MAX_SCAN_INSTRUCTIONS: usize = 4096;

/// Minimum body size to bother compiling (mirrors the teacher's
/// `min_instruction_count` heuristic — trivial functions aren't worth a
/// compile).
const MIN_INSTRUCTIONS: usize = 6;

fn opcode_supported(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Nop
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::Swap
            | Opcode::PushIConst
            | Opcode::PushCIConst
            | Opcode::ChkStk
            | Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Idiv
            | Opcode::Imod
            | Opcode::Ineg
            | Opcode::Iand
            | Opcode::Ior
            | Opcode::Ixor
            | Opcode::Inot
            | Opcode::Ishl
            | Opcode::Ishr
            | Opcode::Ushr
            | Opcode::IaddIConst
            | Opcode::Ieq
            | Opcode::Ine
            | Opcode::Ilt
            | Opcode::Ile
            | Opcode::Igt
            | Opcode::Ige
            | Opcode::IBeq
            | Opcode::IBne
            | Opcode::IBlt
            | Opcode::IBge
            | Opcode::Br
            | Opcode::IBzP
            | Opcode::IBnzP
            | Opcode::IBz
            | Opcode::IBnz
            | Opcode::Ret
            | Opcode::Halt
    )
}

fn branch_target_of(instr: &DecodedInstr) -> Option<u32> {
    match instr.operand {
        Operand::BranchOffset(off) => Some(((instr.pc as i64) + 1 + (off as i64)) as u32),
        _ => None,
    }
}

/// Decode and validate the function body reachable from `entry_pc`. Walks
/// every control-flow edge (fallthrough *and* branch target) with a
/// worklist, so an `if`/`else`'s untaken arm is decoded and checked even
/// though a single linear scan would walk past it. Returns `Err` with the
/// first disqualifying reason found; the caller's only use for it is a
/// debug log before permanently marking the `pc` ineligible.
pub fn analyze(program: &CompiledProgram, entry_pc: u32) -> Result<EligibleFunction, Ineligible> {
    let mut decoded: std::collections::BTreeMap<u32, DecodedInstr> = std::collections::BTreeMap::new();
    let mut block_starts = vec![entry_pc];
    let mut worklist = vec![entry_pc];

    while let Some(pc) = worklist.pop() {
        if decoded.contains_key(&pc) {
            continue;
        }
        if decoded.len() >= MAX_SCAN_INSTRUCTIONS {
            return Err(Ineligible::RunawayScan);
        }
        if pc as usize >= program.instructions.len() || program.is_switch_table_pc(pc) {
            return Err(Ineligible::NoTerminator);
        }
        let word = program.fetch_instruction_word(pc);
        let instr = match Instruction::decode(word) {
            Ok(i) => i,
            Err(_) => return Err(Ineligible::NoTerminator),
        };
        if !opcode_supported(instr.opcode) {
            return Err(Ineligible::UnsupportedOpcode(instr.opcode));
        }
        let this = DecodedInstr { pc, opcode: instr.opcode, operand: instr.operand };

        let is_terminator = matches!(instr.opcode, Opcode::Ret | Opcode::Halt);
        let is_unconditional_jump = matches!(instr.opcode, Opcode::Br);
        if let Some(target) = branch_target_of(&this) {
            block_starts.push(target);
            worklist.push(target);
        }
        if !is_terminator && !is_unconditional_jump {
            worklist.push(pc + 1);
        }

        decoded.insert(pc, this);
    }

    if decoded.len() < MIN_INSTRUCTIONS {
        return Err(Ineligible::TooFewInstructions);
    }
    if !decoded.values().any(|i| matches!(i.opcode, Opcode::Ret | Opcode::Halt)) {
        return Err(Ineligible::NoTerminator);
    }

    block_starts.sort_unstable();
    block_starts.dedup();
    block_starts.retain(|pc| decoded.contains_key(pc));

    Ok(EligibleFunction {
        entry_pc,
        instructions: decoded.into_values().collect(),
        block_starts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use raya_bytecode::module::{FuncMapEntry, FunctionDef};

    fn push(p: &mut CompiledProgram, op: Opcode, operand: Operand) {
        p.instructions.push(Instruction::new(op, operand).encode());
    }

    #[test]
    fn straight_line_arithmetic_is_eligible() {
        let mut p = CompiledProgram::new("t");
        let idx = p.constants.add_integer(2);
        push(&mut p, Opcode::PushCIConst, Operand::UImm24(idx));
        push(&mut p, Opcode::PushCIConst, Operand::UImm24(idx));
        push(&mut p, Opcode::Iadd, Operand::None);
        push(&mut p, Opcode::PushIConst, Operand::Imm24(1));
        push(&mut p, Opcode::Isub, Operand::None);
        push(&mut p, Opcode::Ret, Operand::UImm24(0));
        p.functions.push(FunctionDef {
            name: "f".into(),
            entry_pc: 0,
            param_count: 0,
            local_count: 0,
            is_method: false,
        });
        p.func_map.push(FuncMapEntry { pc: 0, function_index: 0 });

        let f = analyze(&p, 0).expect("should be eligible");
        assert_eq!(f.instructions.len(), 6);
    }

    #[test]
    fn a_call_opcode_disqualifies_the_function() {
        let mut p = CompiledProgram::new("t");
        push(&mut p, Opcode::PushIConst, Operand::Imm24(1));
        push(&mut p, Opcode::Call, Operand::Imm24(0));
        push(&mut p, Opcode::Ret, Operand::UImm24(0));

        let err = analyze(&p, 0).unwrap_err();
        assert_eq!(err, Ineligible::UnsupportedOpcode(Opcode::Call));
    }

    #[test]
    fn a_loop_with_a_backward_branch_is_eligible() {
        let mut p = CompiledProgram::new("t");
        // pc0: push 10   pc1: push 1   pc2: isub   pc3: dup
        // pc4: ibnzp -3 (loop back to pc1)   pc5: ret
        push(&mut p, Opcode::PushIConst, Operand::Imm24(10));
        push(&mut p, Opcode::PushIConst, Operand::Imm24(1));
        push(&mut p, Opcode::Isub, Operand::None);
        push(&mut p, Opcode::Dup, Operand::None);
        push(&mut p, Opcode::IBnzP, Operand::BranchOffset(-4));
        push(&mut p, Opcode::Ret, Operand::UImm24(0));

        let f = analyze(&p, 0).expect("loop should be eligible");
        assert!(f.block_starts.contains(&1));
    }

    #[test]
    fn too_short_a_body_is_rejected() {
        let mut p = CompiledProgram::new("t");
        push(&mut p, Opcode::PushIConst, Operand::Imm24(1));
        push(&mut p, Opcode::Ret, Operand::UImm24(0));
        assert_eq!(analyze(&p, 0).unwrap_err(), Ineligible::TooFewInstructions);
    }
}
