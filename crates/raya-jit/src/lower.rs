//! Per-`pc` virtual stack depth computation (spec §4.6 "stack-pointer
//! optimization"): the pass [`codegen`](crate::codegen) needs before it can
//! size Cranelift block parameters — except we don't use block parameters
//! for stack values at all (see [`crate::codegen`]'s module doc); this pass
//! instead tells codegen how many `Variable` slots the function needs and
//! lets it bail out before touching Cranelift at all if the bytecode's
//! stack-height invariant doesn't actually hold (a defensive check — the
//! compiler that emitted this program is trusted to have verified it, but a
//! miscompile here would corrupt the native stack rather than raise a
//! bytecode-level exception, so the JIT re-derives it independently).

use std::collections::BTreeMap;

use raya_bytecode::encoder::Operand;
use raya_bytecode::Opcode;

use crate::eligibility::EligibleFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LowerError {
    #[error("stack depth at pc {0} disagrees between two predecessors")]
    DepthMismatch(u32),
    #[error("stack underflow computing static depth at pc {0}")]
    StackUnderflow(u32),
    #[error("branch at pc {0} has no resolvable target")]
    MissingTarget(u32),
    #[error("pc {0} falls outside the decoded instruction set")]
    DanglingEdge(u32),
}

/// Net virtual-stack height change of a "linear" opcode (one that falls
/// through to `pc + 1` unconditionally, with no branch-dependent effect).
fn linear_delta(opcode: Opcode, operand: Operand) -> Option<i64> {
    use Opcode::*;
    Some(match opcode {
        Nop | Swap | ChkStk | Ineg | Inot | IaddIConst => 0,
        Pop => {
            let Operand::UImm24(n) = operand else { return None };
            -(n as i64)
        }
        Dup | PushIConst | PushCIConst => 1,
        Iadd | Isub | Imul | Idiv | Imod | Iand | Ior | Ixor | Ishl | Ishr | Ushr | Ieq | Ine
        | Ilt | Ile | Igt | Ige => -1,
        _ => return None,
    })
}

/// Per-`pc` depth map plus the function's maximum simultaneous virtual
/// depth (how many `Variable`s codegen must declare).
pub struct DepthInfo {
    pub depth_at: BTreeMap<u32, u32>,
    pub max_depth: u32,
}

pub fn compute_depths(f: &EligibleFunction) -> Result<DepthInfo, LowerError> {
    let instrs: BTreeMap<u32, &crate::eligibility::DecodedInstr> =
        f.instructions.iter().map(|i| (i.pc, i)).collect();

    let mut depth_at: BTreeMap<u32, u32> = BTreeMap::new();
    let mut worklist: Vec<(u32, u32)> = vec![(f.entry_pc, 0)];

    let sub = |depth: u32, n: u32, pc: u32| -> Result<u32, LowerError> {
        depth.checked_sub(n).ok_or(LowerError::StackUnderflow(pc))
    };

    while let Some((pc, depth)) = worklist.pop() {
        if let Some(&seen) = depth_at.get(&pc) {
            if seen != depth {
                return Err(LowerError::DepthMismatch(pc));
            }
            continue;
        }
        depth_at.insert(pc, depth);

        let instr = instrs.get(&pc).ok_or(LowerError::DanglingEdge(pc))?;
        match instr.opcode {
            Opcode::Ret | Opcode::Halt => {}
            Opcode::Br => {
                let Operand::BranchOffset(off) = instr.operand else {
                    return Err(LowerError::MissingTarget(pc));
                };
                let target = ((pc as i64) + 1 + (off as i64)) as u32;
                worklist.push((target, depth));
            }
            Opcode::IBeq | Opcode::IBne | Opcode::IBlt | Opcode::IBge => {
                let Operand::BranchOffset(off) = instr.operand else {
                    return Err(LowerError::MissingTarget(pc));
                };
                let target = ((pc as i64) + 1 + (off as i64)) as u32;
                let nd = sub(depth, 2, pc)?;
                worklist.push((target, nd));
                worklist.push((pc + 1, nd));
            }
            Opcode::IBzP | Opcode::IBnzP => {
                let Operand::BranchOffset(off) = instr.operand else {
                    return Err(LowerError::MissingTarget(pc));
                };
                let target = ((pc as i64) + 1 + (off as i64)) as u32;
                let nd = sub(depth, 1, pc)?;
                worklist.push((target, nd));
                worklist.push((pc + 1, nd));
            }
            Opcode::IBz | Opcode::IBnz => {
                let Operand::BranchOffset(off) = instr.operand else {
                    return Err(LowerError::MissingTarget(pc));
                };
                let target = ((pc as i64) + 1 + (off as i64)) as u32;
                // Taken edge keeps the tested value; fallthrough pops it.
                worklist.push((target, depth));
                let nd = sub(depth, 1, pc)?;
                worklist.push((pc + 1, nd));
            }
            other => {
                let delta = linear_delta(other, instr.operand).ok_or(LowerError::MissingTarget(pc))?;
                let nd = if delta >= 0 {
                    depth
                        .checked_add(delta as u32)
                        .ok_or(LowerError::StackUnderflow(pc))?
                } else {
                    sub(depth, (-delta) as u32, pc)?
                };
                worklist.push((pc + 1, nd));
            }
        }
    }

    let max_depth = depth_at.values().copied().max().unwrap_or(0);
    Ok(DepthInfo { depth_at, max_depth })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::analyze;
    use raya_bytecode::encoder::Instruction;
    use raya_bytecode::module::CompiledProgram;

    fn push(p: &mut CompiledProgram, op: Opcode, operand: Operand) {
        p.instructions.push(Instruction::new(op, operand).encode());
    }

    #[test]
    fn straight_line_depths_grow_by_one_per_push() {
        let mut p = CompiledProgram::new("t");
        push(&mut p, Opcode::PushIConst, Operand::Imm24(1));
        push(&mut p, Opcode::PushIConst, Operand::Imm24(2));
        push(&mut p, Opcode::Iadd, Operand::None);
        push(&mut p, Opcode::PushIConst, Operand::Imm24(3));
        push(&mut p, Opcode::Isub, Operand::None);
        push(&mut p, Opcode::Ret, Operand::UImm24(0));

        let f = analyze(&p, 0).unwrap();
        let info = compute_depths(&f).unwrap();
        assert_eq!(info.depth_at[&0], 0);
        assert_eq!(info.depth_at[&1], 1);
        assert_eq!(info.depth_at[&2], 2);
        assert_eq!(info.depth_at[&3], 1);
        assert_eq!(info.max_depth, 2);
    }

    #[test]
    fn loop_back_edge_agrees_with_forward_depth() {
        let mut p = CompiledProgram::new("t");
        push(&mut p, Opcode::PushIConst, Operand::Imm24(10));
        push(&mut p, Opcode::PushIConst, Operand::Imm24(1));
        push(&mut p, Opcode::Isub, Operand::None);
        push(&mut p, Opcode::Dup, Operand::None);
        push(&mut p, Opcode::IBnzP, Operand::BranchOffset(-4));
        push(&mut p, Opcode::Ret, Operand::UImm24(0));

        let f = analyze(&p, 0).unwrap();
        let info = compute_depths(&f).unwrap();
        assert_eq!(info.depth_at[&1], 1);
        assert_eq!(info.max_depth, 2);
    }

    #[test]
    fn branch_or_pop_keeps_value_only_on_the_taken_edge() {
        let mut p = CompiledProgram::new("t");
        push(&mut p, Opcode::PushIConst, Operand::Imm24(1));
        push(&mut p, Opcode::PushIConst, Operand::Imm24(0)); // pc1
        push(&mut p, Opcode::IBz, Operand::BranchOffset(1)); // pc2: taken -> pc4, fallthrough -> pc3
        push(&mut p, Opcode::Ret, Operand::UImm24(0)); // pc3 (fallthrough: tested value popped, depth 1)
        push(&mut p, Opcode::Ret, Operand::UImm24(0)); // pc4 (taken: value kept, depth 2)

        let f = analyze(&p, 0).unwrap();
        let info = compute_depths(&f).unwrap();
        assert_eq!(info.depth_at[&2], 2);
        assert_eq!(info.depth_at[&3], 1);
        assert_eq!(info.depth_at[&4], 2);
    }
}
