//! Constant expression evaluation.
//!
//! Global, table and segment initialisers are evaluated during instantiation
//! against the addresses allocated so far. Validation has already restricted
//! them to constant instructions and checked that `global.get` only reads
//! imported or earlier globals.

use alloc::vec::Vec;

use crate::interpreter::{Ref, Trap, Value};
use crate::module::ConstExpr;
use crate::opcodes::Instruction;
use crate::store::{FuncAddr, GlobalAddr, Store};

/// What a constant expression can see.
pub struct ConstContext<'a> {
    pub store: &'a Store,
    pub funcs: &'a [FuncAddr],
    pub globals: &'a [GlobalAddr],
}

fn not_constant(instr: &Instruction) -> Trap {
    Trap::internal(alloc::format!("{} in constant expression", instr.name()))
}

macro_rules! const_binop {
    ($stack:ident, $variant:ident, $op:ident, $instr:ident) => {{
        let rhs = $stack.pop();
        let lhs = $stack.pop();
        match (lhs, rhs) {
            (Some(Value::$variant(a)), Some(Value::$variant(b))) => {
                $stack.push(Value::$variant(a.$op(b)))
            }
            _ => return Err(not_constant($instr)),
        }
    }};
}

/// Evaluate `expr` to its single result.
pub fn eval(expr: &ConstExpr, ctx: &ConstContext<'_>) -> Result<Value, Trap> {
    let mut stack: Vec<Value> = Vec::with_capacity(4);
    for instr in expr.instructions() {
        match instr {
            Instruction::I32Const(v) => stack.push(Value::I32(*v)),
            Instruction::I64Const(v) => stack.push(Value::I64(*v)),
            Instruction::F32Const(v) => stack.push(Value::F32(*v)),
            Instruction::F64Const(v) => stack.push(Value::F64(*v)),
            Instruction::RefNull(_) => stack.push(Value::Ref(Ref::Null)),
            Instruction::RefFunc(idx) => {
                let addr = ctx
                    .funcs
                    .get(*idx as usize)
                    .ok_or_else(|| not_constant(instr))?;
                stack.push(Value::Ref(Ref::Func(*addr)));
            }
            Instruction::GlobalGet(idx) => {
                let addr = ctx
                    .globals
                    .get(*idx as usize)
                    .ok_or_else(|| not_constant(instr))?;
                stack.push(ctx.store.global_ref(*addr)?.value);
            }
            Instruction::RefI31 => match stack.pop() {
                Some(Value::I32(v)) => stack.push(Value::Ref(Ref::i31(v))),
                _ => return Err(not_constant(instr)),
            },
            Instruction::I32Add => const_binop!(stack, I32, wrapping_add, instr),
            Instruction::I32Sub => const_binop!(stack, I32, wrapping_sub, instr),
            Instruction::I32Mul => const_binop!(stack, I32, wrapping_mul, instr),
            Instruction::I64Add => const_binop!(stack, I64, wrapping_add, instr),
            Instruction::I64Sub => const_binop!(stack, I64, wrapping_sub, instr),
            Instruction::I64Mul => const_binop!(stack, I64, wrapping_mul, instr),
            Instruction::End => break,
            other => return Err(not_constant(other)),
        }
    }
    match stack.as_slice() {
        [value] => Ok(*value),
        _ => Err(Trap::internal("constant expression must produce one value")),
    }
}

/// Evaluate an `i32` offset expression.
pub fn eval_offset(expr: &ConstExpr, ctx: &ConstContext<'_>) -> Result<u32, Trap> {
    match eval(expr, ctx)? {
        Value::I32(v) => Ok(v as u32),
        other => Err(Trap::internal(alloc::format!(
            "offset expression produced {}",
            other
        ))),
    }
}
