//! Runtime values, operand stack, call frames and traps.
//!
//! These are the pieces of machine state shared by the executor, the host
//! binding layer and the linker's constant evaluator.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use thiserror::Error;

use crate::code::CompiledFunc;
use crate::opcodes::Opcode;
use crate::store::{FuncAddr, ModuleInstance};
use crate::types::{HeapType, ValType};

/// Canonical NaN bit patterns.
pub const F32_CANONICAL_NAN: u32 = 0x7FC0_0000;
pub const F64_CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

// ============================================================================
// WASM Values
// ============================================================================

/// A reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ref {
    Null,
    Func(FuncAddr),
    /// Host-chosen external handle.
    Extern(u32),
    /// Unboxed 31-bit integer (stored zero-extended).
    I31(u32),
}

impl Ref {
    pub fn is_null(&self) -> bool {
        matches!(self, Ref::Null)
    }

    /// `ref.i31`: keep the low 31 bits.
    pub fn i31(value: i32) -> Ref {
        Ref::I31(value as u32 & 0x7FFF_FFFF)
    }

    /// Whether this reference inhabits the abstract heap type `heap`.
    /// Concrete heap types accept any function reference here;
    /// [`Store::value_matches`](crate::store::Store::value_matches) resolves
    /// the signature.
    pub fn matches_heap(&self, heap: HeapType) -> bool {
        use HeapType::*;
        match self {
            Ref::Null => true,
            Ref::Func(_) => matches!(heap, Func | Concrete(_)),
            Ref::Extern(_) => heap == Extern,
            Ref::I31(_) => matches!(heap, I31 | Eq | Any),
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ref::Null => f.write_str("ref.null"),
            Ref::Func(addr) => write!(f, "ref.func {}", addr.0),
            Ref::Extern(h) => write!(f, "ref.extern {}", h),
            Ref::I31(v) => write!(f, "ref.i31 {}", v),
        }
    }
}

/// A runtime WASM value.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
    Ref(Ref),
}

impl Value {
    /// Zero value for a defaultable type; `None` for non-nullable references.
    pub fn default_for(ty: ValType) -> Option<Self> {
        Some(match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
            ValType::V128 => Value::V128(0),
            ValType::Ref(rt) if rt.nullable => Value::Ref(Ref::Null),
            ValType::Ref(_) => return None,
        })
    }

    /// Dynamic type check used at the host boundary.
    pub fn has_type(&self, ty: ValType) -> bool {
        match (self, ty) {
            (Value::I32(_), ValType::I32)
            | (Value::I64(_), ValType::I64)
            | (Value::F32(_), ValType::F32)
            | (Value::F64(_), ValType::F64)
            | (Value::V128(_), ValType::V128) => true,
            (Value::Ref(Ref::Null), ValType::Ref(rt)) => rt.nullable,
            (Value::Ref(r), ValType::Ref(rt)) => r.matches_heap(rt.heap),
            _ => false,
        }
    }

    /// Quiet NaN with an all-zero payload.
    pub fn is_canonical_nan(&self) -> bool {
        match self {
            Value::F32(v) => v.to_bits() & 0x7FFF_FFFF == F32_CANONICAL_NAN,
            Value::F64(v) => v.to_bits() & 0x7FFF_FFFF_FFFF_FFFF == F64_CANONICAL_NAN,
            _ => false,
        }
    }

    /// Any quiet NaN.
    pub fn is_arithmetic_nan(&self) -> bool {
        match self {
            Value::F32(v) => v.is_nan() && v.to_bits() & 0x0040_0000 != 0,
            Value::F64(v) => v.is_nan() && v.to_bits() & 0x0008_0000_0000_0000 != 0,
            _ => false,
        }
    }
}

/// Type and bit-pattern equality: two NaNs are equal only if their bits are.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::V128(a), Value::V128(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<Ref> for Value {
    fn from(r: Ref) -> Self {
        Value::Ref(r)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "i32:{}", v),
            Value::I64(v) => write!(f, "i64:{}", v),
            Value::F32(v) => write!(f, "f32:{}", v),
            Value::F64(v) => write!(f, "f64:{}", v),
            Value::V128(v) => write!(f, "v128:{:#034x}", v),
            Value::Ref(r) => write!(f, "{}", r),
        }
    }
}

// ============================================================================
// Trap (Runtime Error)
// ============================================================================

/// Trap conditions. Display strings follow the conformance suite wording.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrapKind {
    #[error("unreachable")]
    Unreachable,
    #[error("integer divide by zero")]
    DivideByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    #[error("out of bounds memory access")]
    OutOfBoundsMemoryAccess,
    #[error("out of bounds table access")]
    OutOfBoundsTableAccess,
    #[error("uninitialized element")]
    UninitializedElement,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("null reference")]
    NullReference,
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("value stack exhausted")]
    ValueStackExhausted,
    #[error("all fuel consumed")]
    OutOfFuel,
    #[error("host error: {0}")]
    Host(String),
    /// Broken engine invariant; never caused by a valid module.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A runtime fault, with the instruction and operands that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    pub kind: TrapKind,
    pub opcode: Option<Opcode>,
    pub mnemonic: Option<&'static str>,
    pub operands: Vec<Value>,
}

impl Trap {
    pub fn new(kind: TrapKind) -> Self {
        Trap {
            kind,
            opcode: None,
            mnemonic: None,
            operands: Vec::new(),
        }
    }

    pub fn host(message: impl Into<String>) -> Self {
        Trap::new(TrapKind::Host(message.into()))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Trap::new(TrapKind::Internal(message.into()))
    }

    pub fn with_operands(mut self, operands: impl Into<Vec<Value>>) -> Self {
        self.operands = operands.into();
        self
    }

    /// Attach the faulting instruction unless one is already recorded.
    pub fn at(mut self, opcode: Opcode, mnemonic: &'static str) -> Self {
        if self.opcode.is_none() {
            self.opcode = Some(opcode);
            self.mnemonic = Some(mnemonic);
        }
        self
    }

    pub fn kind(&self) -> &TrapKind {
        &self.kind
    }
}

impl From<TrapKind> for Trap {
    fn from(kind: TrapKind) -> Self {
        Trap::new(kind)
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let (Some(opcode), Some(name)) = (self.opcode, self.mnemonic) {
            write!(f, " at {} ({})", name, opcode)?;
        }
        if !self.operands.is_empty() {
            f.write_str(" with operands [")?;
            for (i, v) in self.operands.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", v)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl core::error::Error for Trap {}

// ============================================================================
// Value Stack
// ============================================================================

/// The operand stack shared by all frames of one invocation.
#[derive(Debug)]
pub struct ValueStack {
    values: Vec<Value>,
    max_depth: usize,
}

fn type_confusion(expected: &str) -> Trap {
    Trap::internal(alloc::format!("operand is not {}", expected))
}

macro_rules! typed_pop {
    ($name:ident, $variant:ident, $ty:ty, $what:literal) => {
        pub fn $name(&mut self) -> Result<$ty, Trap> {
            match self.pop()? {
                Value::$variant(v) => Ok(v),
                _ => Err(type_confusion($what)),
            }
        }
    };
}

impl ValueStack {
    pub fn new(max_depth: usize) -> Self {
        ValueStack {
            values: Vec::with_capacity(max_depth.min(256)),
            max_depth,
        }
    }

    pub fn push(&mut self, value: impl Into<Value>) -> Result<(), Trap> {
        if self.values.len() >= self.max_depth {
            return Err(Trap::new(TrapKind::ValueStackExhausted));
        }
        self.values.push(value.into());
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, Trap> {
        self.values
            .pop()
            .ok_or_else(|| Trap::internal("operand stack underflow"))
    }

    typed_pop!(pop_i32, I32, i32, "an i32");
    typed_pop!(pop_i64, I64, i64, "an i64");
    typed_pop!(pop_f32, F32, f32, "an f32");
    typed_pop!(pop_f64, F64, f64, "an f64");
    typed_pop!(pop_ref, Ref, Ref, "a reference");

    /// Pop an `i32` used as an unsigned index or length.
    pub fn pop_u32(&mut self) -> Result<u32, Trap> {
        self.pop_i32().map(|v| v as u32)
    }

    pub fn peek(&self) -> Result<&Value, Trap> {
        self.values
            .last()
            .ok_or_else(|| Trap::internal("operand stack underflow"))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    /// Remove and return the top `n` values, bottom first.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Trap> {
        let at = self
            .values
            .len()
            .checked_sub(n)
            .ok_or_else(|| Trap::internal("operand stack underflow"))?;
        Ok(self.values.split_off(at))
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = Value>) -> Result<(), Trap> {
        for v in values {
            self.push(v)?;
        }
        Ok(())
    }

    /// Keep the top `arity` values and drop everything between `height`
    /// and them. This is the stack effect of a taken branch.
    pub fn keep_top(&mut self, height: usize, arity: usize) -> Result<(), Trap> {
        let len = self.values.len();
        let start = len
            .checked_sub(arity)
            .filter(|s| *s >= height)
            .ok_or_else(|| Trap::internal("branch below label height"))?;
        if start != height {
            self.values.drain(height..start);
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }
}

// ============================================================================
// Call Frame
// ============================================================================

/// An activation of a Wasm function.
#[derive(Debug, Clone)]
pub struct Frame {
    pub func: FuncAddr,
    /// Instance the function was defined in.
    pub instance: Arc<ModuleInstance>,
    pub code: Arc<CompiledFunc>,
    /// Parameters followed by declared locals.
    pub locals: Vec<Value>,
    /// Index of the next op to execute.
    pub pc: usize,
    /// Operand stack height at entry.
    pub base: usize,
    pub arity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RefType;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn test_value_equality_is_bitwise() {
        assert_eq!(Value::F32(f32::NAN), Value::F32(f32::NAN));
        assert_ne!(Value::F32(f32::NAN), Value::F32(-f32::NAN));
        assert_ne!(Value::F64(0.0), Value::F64(-0.0));
        assert_ne!(Value::I32(1), Value::I64(1));
        assert_eq!(Value::Ref(Ref::Null), Value::Ref(Ref::Null));
    }

    #[test]
    fn test_nan_classes() {
        assert!(Value::F32(f32::from_bits(F32_CANONICAL_NAN)).is_canonical_nan());
        assert!(Value::F64(f64::from_bits(F64_CANONICAL_NAN | 1 << 63)).is_canonical_nan());
        let payload = Value::F32(f32::from_bits(0x7FC0_0001));
        assert!(!payload.is_canonical_nan());
        assert!(payload.is_arithmetic_nan());
        let signalling = Value::F32(f32::from_bits(0x7F80_0001));
        assert!(!signalling.is_arithmetic_nan());
    }

    #[test]
    fn test_default_values() {
        assert_eq!(Value::default_for(ValType::I64), Some(Value::I64(0)));
        assert_eq!(
            Value::default_for(ValType::FUNCREF),
            Some(Value::Ref(Ref::Null))
        );
        let non_null = ValType::Ref(RefType::new(false, HeapType::Func));
        assert_eq!(Value::default_for(non_null), None);
    }

    #[test]
    fn test_has_type() {
        assert!(Value::I32(0).has_type(ValType::I32));
        assert!(!Value::I32(0).has_type(ValType::I64));
        assert!(Value::Ref(Ref::Null).has_type(ValType::EXTERNREF));
        assert!(Value::Ref(Ref::Extern(3)).has_type(ValType::EXTERNREF));
        assert!(!Value::Ref(Ref::Extern(3)).has_type(ValType::FUNCREF));
        let non_null = ValType::Ref(RefType::new(false, HeapType::Extern));
        assert!(!Value::Ref(Ref::Null).has_type(non_null));
    }

    #[test]
    fn test_i31_truncates() {
        assert_eq!(Ref::i31(-1), Ref::I31(0x7FFF_FFFF));
        assert_eq!(Ref::i31(5), Ref::I31(5));
    }

    #[test]
    fn test_stack_limits() {
        let mut stack = ValueStack::new(2);
        stack.push(1i32).unwrap();
        stack.push(2i32).unwrap();
        let err = stack.push(3i32).unwrap_err();
        assert_eq!(err.kind, TrapKind::ValueStackExhausted);
        assert_eq!(stack.pop_i32().unwrap(), 2);
        assert!(matches!(
            stack.pop_i64().unwrap_err().kind,
            TrapKind::Internal(_)
        ));
    }

    #[test]
    fn test_keep_top() {
        let mut stack = ValueStack::new(16);
        for v in 0..6 {
            stack.push(v as i32).unwrap();
        }
        stack.keep_top(2, 2).unwrap();
        assert_eq!(
            stack.as_slice(),
            &[Value::I32(0), Value::I32(1), Value::I32(4), Value::I32(5)]
        );
        stack.keep_top(1, 0).unwrap();
        assert_eq!(stack.as_slice(), &[Value::I32(0)]);
        assert!(stack.keep_top(1, 1).is_err());
    }

    #[test]
    fn test_trap_display() {
        let trap = Trap::new(TrapKind::DivideByZero)
            .with_operands(vec![Value::I32(1), Value::I32(0)])
            .at(Opcode::Core(0x6D), "i32.div_s");
        assert_eq!(
            trap.to_string(),
            "integer divide by zero at i32.div_s (0x6d) with operands [i32:1, i32:0]"
        );
        // The first recorded instruction wins.
        let trap = trap.at(Opcode::Core(0x00), "unreachable");
        assert_eq!(trap.mnemonic, Some("i32.div_s"));
    }
}
