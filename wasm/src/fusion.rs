//! Peephole fusion over compiled function code.
//!
//! Runs once per function at instantiation, after lowering. Short windows of
//! adjacent ops are replaced by one fused op that reads its operands straight
//! from locals or immediates and may write its result straight into a local:
//!
//! - `local.get a; i32.const c; i32.add` → `FusedBinary(local a, const c)`
//! - `<producer>; <binop>; local.set d` → result written to local `d`
//! - `local.get s; local.set d` → `LocalCopy`
//! - `<const>; local.set d` → `LocalConstSet`
//! - `local.get a; <load>` → `LocalLoad`
//!
//! Only integer binary ops that cannot trap are fused, so every trap still
//! happens at the same source instruction. A window never spans a branch
//! target or a block boundary (`block`, `loop`, `else`, `end`): only its
//! first op may follow one. The rewritten code is checked before it is used;
//! on any inconsistency the unfused code is kept.

use alloc::vec;
use alloc::vec::Vec;

use crate::code::{BinOp, CompiledFunc, Dest, Op, Operand};
use crate::interpreter::Value;

/// Fuse one function. Returns the input unchanged when nothing applies or
/// the rewrite fails verification.
pub fn fuse(func: CompiledFunc) -> CompiledFunc {
    let marks = boundaries(&func);

    let mut ops = Vec::with_capacity(func.ops.len());
    let mut heights = Vec::with_capacity(func.ops.len());
    let mut sources = Vec::with_capacity(func.ops.len());
    // New op index -> old op index it starts at.
    let mut origins = Vec::with_capacity(func.ops.len());
    // Old op index -> new op index; one extra slot for the end of the body.
    let mut remap = vec![0u32; func.ops.len() + 1];

    let mut pc = 0;
    while pc < func.ops.len() {
        let (op, width) = match fuse_at(&func, &marks, pc) {
            Some(fused) => fused,
            None => (func.ops[pc].clone(), 1),
        };
        for slot in &mut remap[pc..pc + width] {
            *slot = ops.len() as u32;
        }
        ops.push(op);
        heights.push(func.heights[pc]);
        sources.push(func.sources[pc + width - 1]);
        origins.push(pc);
        pc += width;
    }
    remap[func.ops.len()] = ops.len() as u32;

    if ops.len() == func.ops.len() {
        return func;
    }

    for op in &mut ops {
        op.for_each_pc(|pc| {
            if let Some(&new) = remap.get(*pc as usize) {
                *pc = new;
            }
        });
    }

    let fused = CompiledFunc {
        ops,
        heights,
        sources,
        ..func.clone()
    };
    if let Err(reason) = verify(&func, &fused, &origins) {
        log::warn!(
            "fusion of function {} rejected ({}), running unfused",
            func.func_index,
            reason
        );
        return func;
    }

    log::trace!(
        "fused function {}: {} ops -> {} ops",
        fused.func_index,
        func.ops.len(),
        fused.ops.len()
    );
    fused
}

fn branch_pcs(ops: &[Op]) -> Vec<u32> {
    let mut pcs = Vec::new();
    for op in ops {
        let mut op = op.clone();
        op.for_each_pc(|pc| pcs.push(*pc));
    }
    pcs
}

/// Ops some branch may jump to, or that follow a structured instruction.
/// Those emit no op of their own, so they show up as a gap in `sources`.
fn boundaries(func: &CompiledFunc) -> Vec<bool> {
    let mut marks = vec![false; func.ops.len() + 1];
    for pc in branch_pcs(&func.ops) {
        if let Some(slot) = marks.get_mut(pc as usize) {
            *slot = true;
        }
    }
    for (i, pair) in func.sources.windows(2).enumerate() {
        if pair[1] != pair[0] + 1 {
            marks[i + 1] = true;
        }
    }
    marks
}

/// Longest fusable window starting at `pc`.
fn fuse_at(func: &CompiledFunc, marks: &[bool], pc: usize) -> Option<(Op, usize)> {
    // Dead code is left alone.
    func.heights.get(pc).copied().flatten()?;

    let window = |width: usize| {
        let ops = func.ops.get(pc..pc + width)?;
        let interior_is_marked = (pc + 1..pc + width).any(|i| marks[i]);
        (!interior_is_marked).then_some(ops)
    };

    if let Some([a, b, bin, Op::LocalSet(dst)]) = window(4) {
        if let (Some(lhs), Some(rhs), Some(op)) = (producer(a), producer(b), bin_op(bin)) {
            if accepts(op, &lhs) && accepts(op, &rhs) {
                return Some((binary(op, lhs, rhs, Dest::Local(*dst)), 4));
            }
        }
    }

    if let Some([a, b, c]) = window(3) {
        if let (Some(lhs), Some(rhs), Some(op)) = (producer(a), producer(b), bin_op(c)) {
            if accepts(op, &lhs) && accepts(op, &rhs) {
                return Some((binary(op, lhs, rhs, Dest::Stack), 3));
            }
        }
        if let (Some(rhs), Some(op), Op::LocalSet(dst)) = (producer(a), bin_op(b), c) {
            if accepts(op, &rhs) {
                return Some((binary(op, Operand::Stack, rhs, Dest::Local(*dst)), 3));
            }
        }
    }

    let [a, b] = window(2)? else {
        return None;
    };
    if let (Some(rhs), Some(op)) = (producer(a), bin_op(b)) {
        if accepts(op, &rhs) {
            return Some((binary(op, Operand::Stack, rhs, Dest::Stack), 2));
        }
    }
    if let (Some(op), Op::LocalSet(dst)) = (bin_op(a), b) {
        return Some((binary(op, Operand::Stack, Operand::Stack, Dest::Local(*dst)), 2));
    }
    let fused = match (a, b) {
        (Op::LocalGet(src), Op::LocalSet(dst)) => Op::LocalCopy {
            src: *src,
            dst: *dst,
        },
        (Op::Const(value), Op::LocalSet(dst)) => Op::LocalConstSet {
            value: *value,
            dst: *dst,
        },
        (Op::LocalGet(local), Op::Load { kind, mem, offset }) => Op::LocalLoad {
            local: *local,
            kind: *kind,
            mem: *mem,
            offset: *offset,
        },
        _ => return None,
    };
    Some((fused, 2))
}

fn binary(op: BinOp, lhs: Operand, rhs: Operand, dest: Dest) -> Op {
    Op::FusedBinary { op, lhs, rhs, dest }
}

fn producer(op: &Op) -> Option<Operand> {
    match op {
        Op::LocalGet(i) => Some(Operand::Local(*i)),
        Op::Const(v @ (Value::I32(_) | Value::I64(_))) => Some(Operand::Const(*v)),
        _ => None,
    }
}

fn bin_op(op: &Op) -> Option<BinOp> {
    match op {
        Op::Numeric(instr) => BinOp::of(instr),
        _ => None,
    }
}

/// A constant operand must already have the op's operand type.
fn accepts(op: BinOp, operand: &Operand) -> bool {
    match operand {
        Operand::Const(v) => v.has_type(op.operand_type()),
        _ => true,
    }
}

/// Check the rewrite: no source instruction lost or duplicated, side tables
/// in step, and every branch landing on the op that starts at the same
/// original op.
fn verify(original: &CompiledFunc, fused: &CompiledFunc, origins: &[usize]) -> Result<(), &'static str> {
    let before: u64 = original.ops.iter().map(Op::cost).sum();
    let after: u64 = fused.ops.iter().map(Op::cost).sum();
    if before != after {
        return Err("instruction count changed");
    }
    if fused.heights.len() != fused.ops.len()
        || fused.sources.len() != fused.ops.len()
        || origins.len() != fused.ops.len()
    {
        return Err("side tables out of step");
    }

    let old_pcs = branch_pcs(&original.ops);
    let new_pcs = branch_pcs(&fused.ops);
    if old_pcs.len() != new_pcs.len() {
        return Err("branch count changed");
    }
    for (old, new) in old_pcs.iter().zip(&new_pcs) {
        let (old, new) = (*old as usize, *new as usize);
        let lands = if new == fused.ops.len() {
            old == original.ops.len()
        } else {
            origins.get(new) == Some(&old)
        };
        if !lands {
            return Err("branch target moved");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::compile;
    use crate::module::{FunctionBody, Module};
    use crate::opcodes::Instruction;
    use crate::types::{BlockType, FuncType, SubType, ValType};
    use crate::validator::validate;

    fn compiled(ty: FuncType, locals: Vec<(u32, ValType)>, code: Vec<Instruction>) -> CompiledFunc {
        let mut module = Module::empty();
        module.types.push(SubType::func(ty));
        module.functions.push(0);
        module.code.push(FunctionBody {
            locals,
            instructions: code,
        });
        let info = validate(&module).unwrap();
        compile(&module, 0, &info.functions[0]).unwrap()
    }

    #[test]
    fn test_fuse_local_const_add() {
        let func = compiled(
            FuncType::new(vec![ValType::I32], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::LocalGet(0),
                Instruction::I32Const(5),
                Instruction::I32Add,
                Instruction::End,
            ],
        );
        let fused = fuse(func);
        assert_eq!(
            fused.ops,
            vec![
                Op::FusedBinary {
                    op: BinOp::I32Add,
                    lhs: Operand::Local(0),
                    rhs: Operand::Const(Value::I32(5)),
                    dest: Dest::Stack,
                },
                Op::Return,
            ]
        );
        assert_eq!(fused.heights, vec![Some(0), Some(1)]);
        assert_eq!(fused.sources, vec![2, 3]);
    }

    #[test]
    fn test_fuse_into_local_set() {
        let func = compiled(
            FuncType::new(vec![ValType::I64], vec![]),
            vec![],
            vec![
                Instruction::LocalGet(0),
                Instruction::I64Const(1),
                Instruction::I64Sub,
                Instruction::LocalSet(0),
                Instruction::End,
            ],
        );
        let fused = fuse(func);
        assert_eq!(
            fused.ops[0],
            Op::FusedBinary {
                op: BinOp::I64Sub,
                lhs: Operand::Local(0),
                rhs: Operand::Const(Value::I64(1)),
                dest: Dest::Local(0),
            }
        );
        assert_eq!(fused.ops[0].cost(), 4);
    }

    #[test]
    fn test_trapping_ops_not_fused() {
        let func = compiled(
            FuncType::new(vec![ValType::I32], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::LocalGet(0),
                Instruction::I32Const(0),
                Instruction::I32DivS,
                Instruction::End,
            ],
        );
        let before = func.ops.clone();
        let fused = fuse(func);
        assert_eq!(fused.ops, before);
    }

    #[test]
    fn test_window_starts_at_branch_target() {
        // The `br_if` lands on the const, so `local.get; local.get` before
        // it cannot join the `const; add` window.
        let func = compiled(
            FuncType::new(vec![ValType::I32], vec![ValType::I32]),
            vec![],
            vec![
                Instruction::LocalGet(0),
                Instruction::Block(BlockType::Empty),
                Instruction::LocalGet(0),
                Instruction::BrIf(0),
                Instruction::End,
                Instruction::I32Const(1),
                Instruction::I32Add,
                Instruction::End,
            ],
        );
        let fused = fuse(func);
        assert_eq!(fused.ops.len(), 5);
        assert_eq!(fused.ops[0], Op::LocalGet(0));
        match &fused.ops[2] {
            Op::BrIf(target) => assert_eq!(target.pc, 3),
            other => panic!("expected br_if, got {:?}", other),
        }
        assert_eq!(
            fused.ops[3],
            Op::FusedBinary {
                op: BinOp::I32Add,
                lhs: Operand::Stack,
                rhs: Operand::Const(Value::I32(1)),
                dest: Dest::Stack,
            }
        );
    }

    #[test]
    fn test_window_does_not_span_block_boundary() {
        let func = compiled(
            FuncType::new(vec![ValType::I32], vec![]),
            vec![],
            vec![
                Instruction::I32Const(1),
                Instruction::Block(BlockType::Empty),
                Instruction::End,
                Instruction::LocalSet(0),
                Instruction::End,
            ],
        );
        let before = func.ops.clone();
        let fused = fuse(func);
        assert_eq!(fused.ops, before);
    }

    #[test]
    fn test_branch_targets_remapped() {
        // loop: local.get 0; i32.const 1; i32.sub; local.tee 0; br_if 0
        let func = compiled(
            FuncType::new(vec![ValType::I32], vec![]),
            vec![],
            vec![
                Instruction::Loop(BlockType::Empty),
                Instruction::LocalGet(0),
                Instruction::I32Const(1),
                Instruction::I32Sub,
                Instruction::LocalTee(0),
                Instruction::BrIf(0),
                Instruction::End,
                Instruction::End,
            ],
        );
        let fused = fuse(func);
        assert_eq!(fused.ops.len(), 4);
        match &fused.ops[2] {
            Op::BrIf(target) => assert_eq!(target.pc, 0),
            other => panic!("expected br_if, got {:?}", other),
        }
    }

    #[test]
    fn test_local_copy_and_const_set() {
        let func = compiled(
            FuncType::new(vec![ValType::F64], vec![]),
            vec![(1, ValType::F64)],
            vec![
                Instruction::LocalGet(0),
                Instruction::LocalSet(1),
                Instruction::F64Const(2.5),
                Instruction::LocalSet(0),
                Instruction::End,
            ],
        );
        let fused = fuse(func);
        assert_eq!(
            fused.ops,
            vec![
                Op::LocalCopy { src: 0, dst: 1 },
                Op::LocalConstSet {
                    value: Value::F64(2.5),
                    dst: 0
                },
                Op::Return,
            ]
        );
    }
}
