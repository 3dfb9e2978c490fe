//! Lowering an [`EligibleFunction`] straight into Cranelift IR.
//!
//! # ABI
//!
//! A compiled kernel has the signature `extern "C" fn(entry_ptr: i64) -> i64`.
//! `entry_ptr` is the address of the stack word at the function's `top` at
//! entry (i.e. `stack.words_base_ptr().add(stack.top_index())`); the return
//! value is the address the stack's `top` should be set to afterward
//! (`(new_ptr - words_base_ptr) / 8` on the Rust side — [`crate::engine`]
//! does this conversion, this module only ever deals in pointers).
//!
//! # Why no JIT-specific IR
//!
//! Cranelift's `FunctionBuilder` already does SSA construction for us via
//! `Variable`/`use_var`/`def_var` — exactly the facility the teacher crate's
//! own `LoweringContext` drives (see its `declare_all_regs`). We reuse the
//! same trick for the bytecode's stack slots instead of inventing a
//! register-allocated IR of our own: slot `k` (0 = first word pushed by this
//! function, counting up) becomes `Variable(k)`, declared once per function.
//! Reading "the word `idx` words below the current top" is then just
//! "`Variable(depth - 1 - idx)`" when `idx` is still within the function's
//! own pushes, or a real memory load at `entry_ptr + (idx - depth) * 8`
//! words when `idx` reaches below everything this function has pushed (the
//! caller's frame, including the halt sentinel `Ret` pops). Control-flow
//! merges (loop back-edges, `if`/`else` joins) need no block parameters at
//! all for stack values — Cranelift's own SSA builder resolves them via the
//! `Variable` mechanism, the same way it resolves any other local.
//!
//! `depth` itself — how many of a block's slots are Variable-backed versus
//! memory-backed at any given `pc` — is plain Rust bookkeeping driven by
//! [`crate::lower::compute_depths`]; Cranelift never sees it.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, types, AbiParam, InstBuilder, MemFlags, TrapCode};
use cranelift_codegen::isa::CallConv;
use cranelift_codegen::Context as ClContext;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_module::{FuncId, Linkage, Module};
use rustc_hash::{FxHashMap, FxHashSet};

use raya_bytecode::encoder::Operand;
use raya_bytecode::module::CompiledProgram;
use raya_bytecode::Opcode;

use crate::eligibility::{DecodedInstr, EligibleFunction};
use crate::lower::{compute_depths, LowerError};

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error("cranelift module error: {0}")]
    Module(#[from] cranelift_module::ModuleError),
    #[error("cranelift codegen error: {0}")]
    Codegen(#[from] cranelift_codegen::CodegenError),
}

/// Trap code signalled by an integer divide/modulo by zero inside compiled
/// code. Release-mode divide-by-zero is a hardware-style trap (spec §7:
/// "fatal traps in release mode compile to int3-equivalent ... and do not
/// unwind") — matched here instead of threaded through as a `RuntimeError`,
/// since a compiled kernel has no way to report one mid-function.
fn div_zero_trap() -> TrapCode {
    TrapCode::user(1).expect("1 is a valid user trap code")
}

fn jit_entry_signature(call_conv: CallConv) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // entry_ptr
    sig.returns.push(AbiParam::new(types::I64)); // new top pointer
    sig
}

/// Identify loop headers (blocks with a predecessor whose `pc` is >= their
/// own), mirroring the teacher's `identify_loop_headers` — sealing those
/// must be deferred until every edge into them has been emitted.
fn identify_loop_headers(f: &EligibleFunction, edges: &FxHashMap<u32, Vec<u32>>) -> FxHashSet<u32> {
    let mut headers = FxHashSet::default();
    for &start in &f.block_starts {
        if let Some(preds) = edges.get(&start) {
            for &pred in preds {
                if pred >= start {
                    headers.insert(start);
                }
            }
        }
    }
    headers
}

/// Compute, for every block, the set of blocks that branch or fall through
/// into it — used only to find loop headers for sealing order.
fn predecessor_map(f: &EligibleFunction, instrs: &FxHashMap<u32, DecodedInstr>) -> FxHashMap<u32, Vec<u32>> {
    let block_set: FxHashSet<u32> = f.block_starts.iter().copied().collect();
    let mut preds: FxHashMap<u32, Vec<u32>> = FxHashMap::default();
    for &start in &f.block_starts {
        let mut pc = start;
        loop {
            let Some(instr) = instrs.get(&pc) else { break };
            match instr.opcode {
                Opcode::Ret | Opcode::Halt => break,
                Opcode::Br => {
                    let target = branch_target(instr);
                    preds.entry(target).or_default().push(start);
                    break;
                }
                Opcode::IBeq | Opcode::IBne | Opcode::IBlt | Opcode::IBge | Opcode::IBzP | Opcode::IBnzP
                | Opcode::IBz | Opcode::IBnz => {
                    let target = branch_target(instr);
                    preds.entry(target).or_default().push(start);
                    preds.entry(pc + 1).or_default().push(start);
                    break;
                }
                _ => {
                    pc += 1;
                    if block_set.contains(&pc) {
                        preds.entry(pc).or_default().push(start);
                        break;
                    }
                }
            }
        }
    }
    preds
}

fn branch_target(instr: &DecodedInstr) -> u32 {
    match instr.operand {
        Operand::BranchOffset(off) => ((instr.pc as i64) + 1 + (off as i64)) as u32,
        _ => unreachable!("branch_target called on a non-branch instruction"),
    }
}

/// Per-function lowering state: the Cranelift blocks, the stack-slot
/// variables, and the `entry_ptr` pointer value captured once at entry.
struct Lowering<'a> {
    instrs: FxHashMap<u32, DecodedInstr>,
    depth_at: std::collections::BTreeMap<u32, u32>,
    block_map: FxHashMap<u32, ir::Block>,
    block_set: FxHashSet<u32>,
    vars: Vec<Variable>,
    entry_ptr: ir::Value,
    program: &'a CompiledProgram,
}

impl<'a> Lowering<'a> {
    fn get(&self, builder: &mut FunctionBuilder, depth: u32, idx: u32) -> ir::Value {
        if idx < depth {
            builder.use_var(self.vars[(depth - 1 - idx) as usize])
        } else {
            let extra = (idx - depth) as i64;
            let addr = offset_ptr(builder, self.entry_ptr, extra * 8);
            builder.ins().load(types::I64, MemFlags::trusted(), addr, 0)
        }
    }

    fn set(&self, builder: &mut FunctionBuilder, depth: u32, idx: u32, val: ir::Value) {
        if idx < depth {
            builder.def_var(self.vars[(depth - 1 - idx) as usize], val);
        } else {
            let extra = (idx - depth) as i64;
            let addr = offset_ptr(builder, self.entry_ptr, extra * 8);
            builder.ins().store(MemFlags::trusted(), val, addr, 0);
        }
    }

    /// Narrow a word-wide slot value down to the logical `i32` it carries
    /// (spec §4.2: sub-word payloads live zero/sign-extended in the low bits
    /// of a full word).
    fn get_i32(&self, builder: &mut FunctionBuilder, depth: u32, idx: u32) -> ir::Value {
        let w = self.get(builder, depth, idx);
        builder.ins().ireduce(types::I32, w)
    }

    fn push_i32(&self, builder: &mut FunctionBuilder, depth: u32, idx: u32, v: ir::Value) {
        let w = builder.ins().uextend(types::I64, v);
        self.set(builder, depth, idx, w);
    }

    /// Flush every still-live virtual slot (`0..depth`) to its real stack
    /// address and return the pointer the stack's `top` should become
    /// (spec §4.6 "flushing ... before returns, all cached dirty registers
    /// spill to their stack slots").
    fn flush_and_finish(&self, builder: &mut FunctionBuilder, depth: u32, below: i64) {
        for k in 0..depth {
            let val = builder.use_var(self.vars[k as usize]);
            let word_offset = below - 1 - k as i64;
            let addr = offset_ptr(builder, self.entry_ptr, word_offset * 8);
            builder.ins().store(MemFlags::trusted(), val, addr, 0);
        }
        let new_ptr = offset_ptr(builder, self.entry_ptr, (below - depth as i64) * 8);
        builder.ins().return_(&[new_ptr]);
    }
}

fn offset_ptr(builder: &mut FunctionBuilder, base: ir::Value, byte_offset: i64) -> ir::Value {
    if byte_offset == 0 {
        base
    } else {
        builder.ins().iadd_imm(base, byte_offset)
    }
}

/// Division/modulo that matches `i32::wrapping_div`/`wrapping_rem` exactly,
/// including the `MIN / -1` case (which would otherwise overflow the
/// hardware `idiv` Cranelift's `sdiv`/`srem` lower to). Traps on zero, same
/// as the interpreter's `RuntimeError::DivideByZero` in release mode.
fn emit_checked_div(builder: &mut FunctionBuilder, a: ir::Value, b: ir::Value, is_mod: bool) -> ir::Value {
    let zero = builder.ins().iconst(types::I32, 0);
    let is_zero = builder.ins().icmp(IntCC::Equal, b, zero);
    builder.ins().trapnz(is_zero, div_zero_trap());

    let neg1 = builder.ins().iconst(types::I32, -1);
    let is_neg1 = builder.ins().icmp(IntCC::Equal, b, neg1);
    let one = builder.ins().iconst(types::I32, 1);
    let safe_b = builder.ins().select(is_neg1, one, b);

    if is_mod {
        let raw = builder.ins().srem(a, safe_b);
        let zero_rem = builder.ins().iconst(types::I32, 0);
        builder.ins().select(is_neg1, zero_rem, raw)
    } else {
        let raw = builder.ins().sdiv(a, safe_b);
        let negated = builder.ins().ineg(a);
        builder.ins().select(is_neg1, negated, raw)
    }
}

/// Lower one instruction, mutating `depth` in place. Returns `true` if the
/// instruction ended the current block (terminator or jump already emitted).
fn lower_instr(
    low: &Lowering,
    builder: &mut FunctionBuilder,
    depth: &mut u32,
    instr: &DecodedInstr,
) -> bool {
    let d = *depth;
    match instr.opcode {
        Opcode::Nop => {}
        // Lowered to a no-op: the interpreter's ChkStk raises a bytecode
        // fault on insufficient headroom mid-function, but compiled code has
        // no way to unwind partway through. Instead `compile_function` folds
        // every ChkStk operand (and the function's own peak depth) into
        // `required_headroom`, which the caller checks once, up front, via
        // `Stack::check_headroom` before ever invoking the compiled kernel.
        Opcode::ChkStk => {}
        Opcode::Pop => {
            let Operand::UImm24(n) = instr.operand else { unreachable!() };
            *depth -= n;
        }
        Opcode::Dup => {
            let v = low.get(builder, d, 0);
            *depth = d + 1;
            low.set(builder, *depth, 0, v);
        }
        Opcode::Swap => {
            let a = low.get(builder, d, 0);
            let b = low.get(builder, d, 1);
            low.set(builder, d, 0, b);
            low.set(builder, d, 1, a);
        }
        Opcode::PushIConst => {
            let Operand::Imm24(v) = instr.operand else { unreachable!() };
            let word = (v as u32) as i64;
            let val = builder.ins().iconst(types::I64, word);
            *depth = d + 1;
            low.set(builder, *depth, 0, val);
        }
        Opcode::PushCIConst => {
            let Operand::UImm24(idx) = instr.operand else { unreachable!() };
            let v = low.program.constants.get_integer(idx).unwrap_or(0);
            let word = (v as u32) as i64;
            let val = builder.ins().iconst(types::I64, word);
            *depth = d + 1;
            low.set(builder, *depth, 0, val);
        }
        Opcode::Iadd | Opcode::Isub | Opcode::Imul | Opcode::Iand | Opcode::Ior | Opcode::Ixor
        | Opcode::Ishl | Opcode::Ishr | Opcode::Ushr => {
            let b = low.get_i32(builder, d, 0);
            let a = low.get_i32(builder, d, 1);
            let r = match instr.opcode {
                Opcode::Iadd => builder.ins().iadd(a, b),
                Opcode::Isub => builder.ins().isub(a, b),
                Opcode::Imul => builder.ins().imul(a, b),
                Opcode::Iand => builder.ins().band(a, b),
                Opcode::Ior => builder.ins().bor(a, b),
                Opcode::Ixor => builder.ins().bxor(a, b),
                Opcode::Ishl => builder.ins().ishl(a, b),
                Opcode::Ishr => builder.ins().sshr(a, b),
                Opcode::Ushr => builder.ins().ushr(a, b),
                _ => unreachable!(),
            };
            *depth = d - 2;
            low.push_i32(builder, *depth, 0, r);
        }
        Opcode::Idiv | Opcode::Imod => {
            let b = low.get_i32(builder, d, 0);
            let a = low.get_i32(builder, d, 1);
            let r = emit_checked_div(builder, a, b, instr.opcode == Opcode::Imod);
            *depth = d - 2;
            low.push_i32(builder, *depth, 0, r);
        }
        Opcode::Ineg => {
            let a = low.get_i32(builder, d, 0);
            let r = builder.ins().ineg(a);
            low.push_i32(builder, d, 0, r);
        }
        Opcode::Inot => {
            let a = low.get_i32(builder, d, 0);
            let r = builder.ins().bnot(a);
            low.push_i32(builder, d, 0, r);
        }
        Opcode::IaddIConst => {
            let Operand::Imm24(imm) = instr.operand else { unreachable!() };
            let a = low.get_i32(builder, d, 0);
            let r = builder.ins().iadd_imm(a, imm as i64);
            low.push_i32(builder, d, 0, r);
        }
        Opcode::Ieq | Opcode::Ine | Opcode::Ilt | Opcode::Ile | Opcode::Igt | Opcode::Ige => {
            let b = low.get_i32(builder, d, 0);
            let a = low.get_i32(builder, d, 1);
            let cc = match instr.opcode {
                Opcode::Ieq => IntCC::Equal,
                Opcode::Ine => IntCC::NotEqual,
                Opcode::Ilt => IntCC::SignedLessThan,
                Opcode::Ile => IntCC::SignedLessThanOrEqual,
                Opcode::Igt => IntCC::SignedGreaterThan,
                Opcode::Ige => IntCC::SignedGreaterThanOrEqual,
                _ => unreachable!(),
            };
            let cmp = builder.ins().icmp(cc, a, b);
            let as_i32 = builder.ins().uextend(types::I32, cmp);
            *depth = d - 2;
            low.push_i32(builder, *depth, 0, as_i32);
        }
        _ => unreachable!("non-linear opcode reached lower_instr: {:?}", instr.opcode),
    }
    false
}

/// Lower one block, starting at `start`, through to its terminator or an
/// implicit fallthrough jump into the next block. Mutates nothing outside
/// `builder`; block-local `depth` starts from the precomputed map.
fn lower_block(low: &Lowering, builder: &mut FunctionBuilder, start: u32) {
    let mut pc = start;
    let mut depth = low.depth_at[&start];
    loop {
        let instr = low.instrs[&pc];
        match instr.opcode {
            Opcode::Ret => {
                let Operand::UImm24(extra) = instr.operand else { unreachable!() };
                let total_pop = 1 + extra;
                if total_pop <= depth {
                    low.flush_and_finish(builder, depth - total_pop, 0);
                } else {
                    low.flush_and_finish(builder, 0, (total_pop - depth) as i64);
                }
                return;
            }
            Opcode::Halt => {
                low.flush_and_finish(builder, depth, 0);
                return;
            }
            Opcode::Br => {
                let target = branch_target(&instr);
                builder.ins().jump(low.block_map[&target], &[]);
                return;
            }
            Opcode::IBeq | Opcode::IBne | Opcode::IBlt | Opcode::IBge => {
                let b = low.get_i32(builder, depth, 0);
                let a = low.get_i32(builder, depth, 1);
                let cc = match instr.opcode {
                    Opcode::IBeq => IntCC::Equal,
                    Opcode::IBne => IntCC::NotEqual,
                    Opcode::IBlt => IntCC::SignedLessThan,
                    Opcode::IBge => IntCC::SignedGreaterThanOrEqual,
                    _ => unreachable!(),
                };
                let cond = builder.ins().icmp(cc, a, b);
                let target = branch_target(&instr);
                let then_block = low.block_map[&target];
                let else_block = low.block_map[&(pc + 1)];
                builder.ins().brif(cond, then_block, &[], else_block, &[]);
                return;
            }
            Opcode::IBzP | Opcode::IBnzP => {
                let v = low.get_i32(builder, depth, 0);
                depth -= 1;
                let zero = builder.ins().iconst(types::I32, 0);
                let cc = if instr.opcode == Opcode::IBzP { IntCC::Equal } else { IntCC::NotEqual };
                let cond = builder.ins().icmp(cc, v, zero);
                let target = branch_target(&instr);
                let then_block = low.block_map[&target];
                let else_block = low.block_map[&(pc + 1)];
                builder.ins().brif(cond, then_block, &[], else_block, &[]);
                return;
            }
            Opcode::IBz | Opcode::IBnz => {
                let v = low.get_i32(builder, depth, 0);
                let zero = builder.ins().iconst(types::I32, 0);
                let taken_on_zero = instr.opcode == Opcode::IBz;
                let cc = if taken_on_zero { IntCC::Equal } else { IntCC::NotEqual };
                let cond = builder.ins().icmp(cc, v, zero);
                let target = branch_target(&instr);
                let then_block = low.block_map[&target]; // keeps v: depth unchanged
                let else_block = low.block_map[&(pc + 1)]; // pops v
                builder.ins().brif(cond, then_block, &[], else_block, &[]);
                return;
            }
            _ => {
                lower_instr(low, builder, &mut depth, &instr);
                pc += 1;
                if low.block_set.contains(&pc) {
                    builder.ins().jump(low.block_map[&pc], &[]);
                    return;
                }
            }
        }
    }
}

/// Maximum headroom (in words) this function can ever demand: its own peak
/// virtual depth, plus the largest explicit `ChkStk` it contains (emitted by
/// the compiler for locals/temporaries this analysis doesn't otherwise see).
fn required_headroom(func: &EligibleFunction, max_depth: u32) -> u32 {
    func.instructions
        .iter()
        .filter_map(|i| match (i.opcode, i.operand) {
            (Opcode::ChkStk, Operand::UImm24(n)) => Some(n),
            _ => None,
        })
        .fold(max_depth, u32::max)
}

/// Compile one eligible function into `module`, returning its [`FuncId`] and
/// the headroom the caller must verify before invoking it. The caller is
/// responsible for `module.finalize_definitions()` and resolving the
/// pointer afterward.
pub fn compile_function(
    module: &mut dyn Module,
    program: &CompiledProgram,
    func: &EligibleFunction,
    name: &str,
) -> Result<(FuncId, u32), CodegenError> {
    let info = compute_depths(func)?;
    let headroom = required_headroom(func, info.max_depth);

    let sig = jit_entry_signature(module.isa().default_call_conv());
    let func_id = module.declare_function(name, Linkage::Export, &sig)?;

    let mut ctx = ClContext::new();
    ctx.func.signature = sig;
    let mut fb_ctx = FunctionBuilderContext::new();

    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);

        let instrs: FxHashMap<u32, DecodedInstr> =
            func.instructions.iter().map(|i| (i.pc, *i)).collect();
        let block_set: FxHashSet<u32> = func.block_starts.iter().copied().collect();
        let preds = predecessor_map(func, &instrs);
        let loop_headers = identify_loop_headers(func, &preds);

        let mut block_map = FxHashMap::default();
        for &pc in &func.block_starts {
            block_map.insert(pc, builder.create_block());
        }

        let entry_block = block_map[&func.entry_pc];
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        let entry_ptr = builder.block_params(entry_block)[0];

        let mut vars = Vec::with_capacity(info.max_depth as usize);
        for _ in 0..info.max_depth {
            vars.push(builder.declare_var(types::I64));
        }

        let low = Lowering {
            instrs,
            depth_at: info.depth_at,
            block_map,
            block_set,
            vars,
            entry_ptr,
            program,
        };

        if !loop_headers.contains(&func.entry_pc) {
            builder.seal_block(entry_block);
        }
        lower_block(&low, &mut builder, func.entry_pc);

        for &pc in &func.block_starts {
            if pc == func.entry_pc {
                continue; // entry block already switched-to and lowered above
            }
            let block = low.block_map[&pc];
            builder.switch_to_block(block);
            if !loop_headers.contains(&pc) {
                builder.seal_block(block);
            }
            lower_block(&low, &mut builder, pc);
        }

        for &pc in &loop_headers {
            builder.seal_block(low.block_map[&pc]);
        }

        builder.finalize();
    }

    module.define_function(func_id, &mut ctx)?;
    module.clear_context(&mut ctx);
    Ok((func_id, headroom))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::analyze;
    use cranelift_codegen::settings::{self, Configurable};
    use cranelift_jit::{JITBuilder, JITModule};
    use raya_bytecode::encoder::Instruction;

    fn push(p: &mut CompiledProgram, op: Opcode, operand: Operand) {
        p.instructions.push(Instruction::new(op, operand).encode());
    }

    fn make_module() -> JITModule {
        let mut flag_builder = settings::builder();
        flag_builder.set("is_pic", "false").unwrap();
        flag_builder.set("opt_level", "speed").unwrap();
        let isa_builder = cranelift_native::builder().expect("host ISA available");
        let isa = isa_builder.finish(settings::Flags::new(flag_builder)).unwrap();
        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        JITModule::new(builder)
    }

    #[test]
    fn compiles_straight_line_arithmetic() {
        let mut p = CompiledProgram::new("t");
        push(&mut p, Opcode::PushIConst, Operand::Imm24(20));
        push(&mut p, Opcode::PushIConst, Operand::Imm24(22));
        push(&mut p, Opcode::Iadd, Operand::None);
        push(&mut p, Opcode::Nop, Operand::None);
        push(&mut p, Opcode::Dup, Operand::None);
        push(&mut p, Opcode::Ret, Operand::UImm24(0));
        push(&mut p, Opcode::Halt, Operand::None);

        let f = analyze(&p, 0).expect("eligible");
        let mut module = make_module();
        let (id, headroom) = compile_function(&mut module, &p, &f, "t0").expect("compiles");
        assert_eq!(headroom, 2);
        module.finalize_definitions().expect("finalize");
        let code = module.get_finalized_function(id);

        let mut words = [0u64; 4];
        words[2] = 0xDEAD_BEEF; // sentinel retaddr slot
        let entry_ptr = unsafe { words.as_mut_ptr().add(2) };
        let f: extern "C" fn(*mut u64) -> *mut u64 = unsafe { std::mem::transmute(code) };
        let new_top = f(entry_ptr);
        let offset = unsafe { new_top.offset_from(words.as_mut_ptr()) };
        assert_eq!(offset, 1);
        assert_eq!(unsafe { *new_top }, 42);
    }

    #[test]
    fn compiles_a_countdown_loop() {
        let mut p = CompiledProgram::new("t");
        push(&mut p, Opcode::PushIConst, Operand::Imm24(5));
        push(&mut p, Opcode::PushIConst, Operand::Imm24(1)); // pc1: loop header
        push(&mut p, Opcode::Isub, Operand::None);
        push(&mut p, Opcode::Dup, Operand::None);
        push(&mut p, Opcode::IBnzP, Operand::BranchOffset(-4));
        push(&mut p, Opcode::Ret, Operand::UImm24(0));

        let f = analyze(&p, 0).expect("eligible");
        let mut module = make_module();
        let (id, _headroom) = compile_function(&mut module, &p, &f, "t1").expect("compiles");
        module.finalize_definitions().expect("finalize");
        let code = module.get_finalized_function(id);

        let mut words = [0u64; 4];
        words[2] = 0xDEAD_BEEF;
        let entry_ptr = unsafe { words.as_mut_ptr().add(2) };
        let f: extern "C" fn(*mut u64) -> *mut u64 = unsafe { std::mem::transmute(code) };
        let new_top = f(entry_ptr);
        assert_eq!(unsafe { *new_top } as i64 as i32, 0);
    }
}
