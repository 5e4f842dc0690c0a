//! Numeric instruction semantics.
//!
//! Integer arithmetic wraps, except division and remainder which trap on
//! zero divisors and signed overflow. Float operations follow IEEE 754 with
//! the Wasm rules for `min`/`max` (NaN-propagating, `-0 < +0`) and
//! round-half-to-even `nearest`. Sign operations (`abs`, `neg`, `copysign`)
//! act on the bit pattern only and preserve NaN payloads.

use alloc::vec;

use crate::interpreter::{Trap, TrapKind, Value, ValueStack};
use crate::opcodes::Instruction;

// ============================================================================
// Integer Operations
// ============================================================================

macro_rules! int_div {
    ($($div_s:ident, $div_u:ident, $rem_s:ident, $rem_u:ident: $s:ty, $u:ty;)*) => {$(
        pub fn $div_s(a: $s, b: $s) -> Result<$s, TrapKind> {
            if b == 0 {
                return Err(TrapKind::DivideByZero);
            }
            a.checked_div(b).ok_or(TrapKind::IntegerOverflow)
        }

        pub fn $div_u(a: $s, b: $s) -> Result<$s, TrapKind> {
            if b == 0 {
                return Err(TrapKind::DivideByZero);
            }
            Ok(((a as $u) / (b as $u)) as $s)
        }

        /// `MIN % -1` is 0, not an overflow.
        pub fn $rem_s(a: $s, b: $s) -> Result<$s, TrapKind> {
            if b == 0 {
                return Err(TrapKind::DivideByZero);
            }
            Ok(a.wrapping_rem(b))
        }

        pub fn $rem_u(a: $s, b: $s) -> Result<$s, TrapKind> {
            if b == 0 {
                return Err(TrapKind::DivideByZero);
            }
            Ok(((a as $u) % (b as $u)) as $s)
        }
    )*};
}

int_div! {
    i32_div_s, i32_div_u, i32_rem_s, i32_rem_u: i32, u32;
    i64_div_s, i64_div_u, i64_rem_s, i64_rem_u: i64, u64;
}

// ============================================================================
// Float Operations
// ============================================================================

macro_rules! float_ops {
    ($($min:ident, $max:ident, $nearest:ident, $copysign:ident, $abs:ident, $neg:ident:
       $f:ty, $bits:ty, $rint:path;)*) => {$(
        pub fn $min(a: $f, b: $f) -> $f {
            if a.is_nan() || b.is_nan() {
                return a + b;
            }
            if a == b {
                // Equal zeros of either sign: the negative one wins.
                return <$f>::from_bits(a.to_bits() | b.to_bits());
            }
            if a < b { a } else { b }
        }

        pub fn $max(a: $f, b: $f) -> $f {
            if a.is_nan() || b.is_nan() {
                return a + b;
            }
            if a == b {
                return <$f>::from_bits(a.to_bits() & b.to_bits());
            }
            if a > b { a } else { b }
        }

        pub fn $nearest(a: $f) -> $f {
            $rint(a)
        }

        pub fn $copysign(a: $f, b: $f) -> $f {
            let sign: $bits = 1 << (<$bits>::BITS - 1);
            <$f>::from_bits((a.to_bits() & !sign) | (b.to_bits() & sign))
        }

        pub fn $abs(a: $f) -> $f {
            let sign: $bits = 1 << (<$bits>::BITS - 1);
            <$f>::from_bits(a.to_bits() & !sign)
        }

        pub fn $neg(a: $f) -> $f {
            let sign: $bits = 1 << (<$bits>::BITS - 1);
            <$f>::from_bits(a.to_bits() ^ sign)
        }
    )*};
}

float_ops! {
    f32_min, f32_max, f32_nearest, f32_copysign, f32_abs, f32_neg: f32, u32, libm::rintf;
    f64_min, f64_max, f64_nearest, f64_copysign, f64_abs, f64_neg: f64, u64, libm::rint;
}

// ============================================================================
// Float to Integer Conversion
// ============================================================================

/// Truncate toward zero, trapping on NaN and on results outside `[lo, hi)`.
/// Bounds are exact powers of two, so the comparison in `f64` is exact for
/// both `f32` and `f64` inputs.
fn checked_trunc(x: f64, lo: f64, hi: f64) -> Result<f64, TrapKind> {
    if x.is_nan() {
        return Err(TrapKind::InvalidConversionToInteger);
    }
    let t = libm::trunc(x);
    if t < lo || t >= hi {
        return Err(TrapKind::IntegerOverflow);
    }
    Ok(t)
}

const TWO_31: f64 = 2147483648.0;
const TWO_32: f64 = 4294967296.0;
const TWO_63: f64 = 9223372036854775808.0;
const TWO_64: f64 = 18446744073709551616.0;

pub fn i32_trunc_s(x: f64) -> Result<i32, TrapKind> {
    checked_trunc(x, -TWO_31, TWO_31).map(|t| t as i32)
}

pub fn i32_trunc_u(x: f64) -> Result<i32, TrapKind> {
    checked_trunc(x, 0.0, TWO_32).map(|t| t as u32 as i32)
}

pub fn i64_trunc_s(x: f64) -> Result<i64, TrapKind> {
    checked_trunc(x, -TWO_63, TWO_63).map(|t| t as i64)
}

pub fn i64_trunc_u(x: f64) -> Result<i64, TrapKind> {
    checked_trunc(x, 0.0, TWO_64).map(|t| t as u64 as i64)
}

// ============================================================================
// Dispatch
// ============================================================================

macro_rules! unop {
    ($stack:ident, $pop:ident, $variant:ident, |$a:ident| $e:expr) => {{
        let $a = $stack.$pop()?;
        $stack.push(Value::$variant($e))?;
    }};
}

macro_rules! binop {
    ($stack:ident, $pop:ident, $variant:ident, |$a:ident, $b:ident| $e:expr) => {{
        let $b = $stack.$pop()?;
        let $a = $stack.$pop()?;
        $stack.push(Value::$variant($e))?;
    }};
}

macro_rules! cmpop {
    ($stack:ident, $pop:ident, |$a:ident, $b:ident| $e:expr) => {{
        let $b = $stack.$pop()?;
        let $a = $stack.$pop()?;
        $stack.push(Value::I32(($e) as i32))?;
    }};
}

/// Binary op that may trap; the trap records both operands.
macro_rules! trapping_binop {
    ($stack:ident, $pop:ident, $variant:ident, $f:path) => {{
        let b = $stack.$pop()?;
        let a = $stack.$pop()?;
        match $f(a, b) {
            Ok(v) => $stack.push(Value::$variant(v))?,
            Err(kind) => {
                return Err(Trap::new(kind).with_operands(vec![Value::$variant(a), Value::$variant(b)]))
            }
        }
    }};
}

/// Float-to-int conversion that may trap; the trap records the operand.
macro_rules! trapping_trunc {
    ($stack:ident, $pop:ident, $src:ident, $variant:ident, $f:path) => {{
        let a = $stack.$pop()?;
        match $f(a as f64) {
            Ok(v) => $stack.push(Value::$variant(v))?,
            Err(kind) => return Err(Trap::new(kind).with_operands(vec![Value::$src(a)])),
        }
    }};
}

/// Execute a numeric (pure stack-to-stack) instruction.
pub fn execute(instr: &Instruction, stack: &mut ValueStack) -> Result<(), Trap> {
    use Instruction::*;

    match instr {
        // ====== i32 ======
        I32Eqz => unop!(stack, pop_i32, I32, |a| (a == 0) as i32),
        I32Eq => cmpop!(stack, pop_i32, |a, b| a == b),
        I32Ne => cmpop!(stack, pop_i32, |a, b| a != b),
        I32LtS => cmpop!(stack, pop_i32, |a, b| a < b),
        I32LtU => cmpop!(stack, pop_i32, |a, b| (a as u32) < (b as u32)),
        I32GtS => cmpop!(stack, pop_i32, |a, b| a > b),
        I32GtU => cmpop!(stack, pop_i32, |a, b| (a as u32) > (b as u32)),
        I32LeS => cmpop!(stack, pop_i32, |a, b| a <= b),
        I32LeU => cmpop!(stack, pop_i32, |a, b| (a as u32) <= (b as u32)),
        I32GeS => cmpop!(stack, pop_i32, |a, b| a >= b),
        I32GeU => cmpop!(stack, pop_i32, |a, b| (a as u32) >= (b as u32)),
        I32Clz => unop!(stack, pop_i32, I32, |a| a.leading_zeros() as i32),
        I32Ctz => unop!(stack, pop_i32, I32, |a| a.trailing_zeros() as i32),
        I32Popcnt => unop!(stack, pop_i32, I32, |a| a.count_ones() as i32),
        I32Add => binop!(stack, pop_i32, I32, |a, b| a.wrapping_add(b)),
        I32Sub => binop!(stack, pop_i32, I32, |a, b| a.wrapping_sub(b)),
        I32Mul => binop!(stack, pop_i32, I32, |a, b| a.wrapping_mul(b)),
        I32DivS => trapping_binop!(stack, pop_i32, I32, i32_div_s),
        I32DivU => trapping_binop!(stack, pop_i32, I32, i32_div_u),
        I32RemS => trapping_binop!(stack, pop_i32, I32, i32_rem_s),
        I32RemU => trapping_binop!(stack, pop_i32, I32, i32_rem_u),
        I32And => binop!(stack, pop_i32, I32, |a, b| a & b),
        I32Or => binop!(stack, pop_i32, I32, |a, b| a | b),
        I32Xor => binop!(stack, pop_i32, I32, |a, b| a ^ b),
        I32Shl => binop!(stack, pop_i32, I32, |a, b| a.wrapping_shl(b as u32)),
        I32ShrS => binop!(stack, pop_i32, I32, |a, b| a.wrapping_shr(b as u32)),
        I32ShrU => binop!(stack, pop_i32, I32, |a, b| (a as u32).wrapping_shr(b as u32) as i32),
        I32Rotl => binop!(stack, pop_i32, I32, |a, b| a.rotate_left(b as u32 % 32)),
        I32Rotr => binop!(stack, pop_i32, I32, |a, b| a.rotate_right(b as u32 % 32)),
        I32Extend8S => unop!(stack, pop_i32, I32, |a| a as i8 as i32),
        I32Extend16S => unop!(stack, pop_i32, I32, |a| a as i16 as i32),

        // ====== i64 ======
        I64Eqz => unop!(stack, pop_i64, I32, |a| (a == 0) as i32),
        I64Eq => cmpop!(stack, pop_i64, |a, b| a == b),
        I64Ne => cmpop!(stack, pop_i64, |a, b| a != b),
        I64LtS => cmpop!(stack, pop_i64, |a, b| a < b),
        I64LtU => cmpop!(stack, pop_i64, |a, b| (a as u64) < (b as u64)),
        I64GtS => cmpop!(stack, pop_i64, |a, b| a > b),
        I64GtU => cmpop!(stack, pop_i64, |a, b| (a as u64) > (b as u64)),
        I64LeS => cmpop!(stack, pop_i64, |a, b| a <= b),
        I64LeU => cmpop!(stack, pop_i64, |a, b| (a as u64) <= (b as u64)),
        I64GeS => cmpop!(stack, pop_i64, |a, b| a >= b),
        I64GeU => cmpop!(stack, pop_i64, |a, b| (a as u64) >= (b as u64)),
        I64Clz => unop!(stack, pop_i64, I64, |a| a.leading_zeros() as i64),
        I64Ctz => unop!(stack, pop_i64, I64, |a| a.trailing_zeros() as i64),
        I64Popcnt => unop!(stack, pop_i64, I64, |a| a.count_ones() as i64),
        I64Add => binop!(stack, pop_i64, I64, |a, b| a.wrapping_add(b)),
        I64Sub => binop!(stack, pop_i64, I64, |a, b| a.wrapping_sub(b)),
        I64Mul => binop!(stack, pop_i64, I64, |a, b| a.wrapping_mul(b)),
        I64DivS => trapping_binop!(stack, pop_i64, I64, i64_div_s),
        I64DivU => trapping_binop!(stack, pop_i64, I64, i64_div_u),
        I64RemS => trapping_binop!(stack, pop_i64, I64, i64_rem_s),
        I64RemU => trapping_binop!(stack, pop_i64, I64, i64_rem_u),
        I64And => binop!(stack, pop_i64, I64, |a, b| a & b),
        I64Or => binop!(stack, pop_i64, I64, |a, b| a | b),
        I64Xor => binop!(stack, pop_i64, I64, |a, b| a ^ b),
        I64Shl => binop!(stack, pop_i64, I64, |a, b| a.wrapping_shl(b as u32)),
        I64ShrS => binop!(stack, pop_i64, I64, |a, b| a.wrapping_shr(b as u32)),
        I64ShrU => binop!(stack, pop_i64, I64, |a, b| (a as u64).wrapping_shr(b as u32) as i64),
        I64Rotl => binop!(stack, pop_i64, I64, |a, b| a.rotate_left((b as u64 % 64) as u32)),
        I64Rotr => binop!(stack, pop_i64, I64, |a, b| a.rotate_right((b as u64 % 64) as u32)),
        I64Extend8S => unop!(stack, pop_i64, I64, |a| a as i8 as i64),
        I64Extend16S => unop!(stack, pop_i64, I64, |a| a as i16 as i64),
        I64Extend32S => unop!(stack, pop_i64, I64, |a| a as i32 as i64),

        // ====== f32 ======
        F32Eq => cmpop!(stack, pop_f32, |a, b| a == b),
        F32Ne => cmpop!(stack, pop_f32, |a, b| a != b),
        F32Lt => cmpop!(stack, pop_f32, |a, b| a < b),
        F32Gt => cmpop!(stack, pop_f32, |a, b| a > b),
        F32Le => cmpop!(stack, pop_f32, |a, b| a <= b),
        F32Ge => cmpop!(stack, pop_f32, |a, b| a >= b),
        F32Abs => unop!(stack, pop_f32, F32, |a| f32_abs(a)),
        F32Neg => unop!(stack, pop_f32, F32, |a| f32_neg(a)),
        F32Ceil => unop!(stack, pop_f32, F32, |a| libm::ceilf(a)),
        F32Floor => unop!(stack, pop_f32, F32, |a| libm::floorf(a)),
        F32Trunc => unop!(stack, pop_f32, F32, |a| libm::truncf(a)),
        F32Nearest => unop!(stack, pop_f32, F32, |a| f32_nearest(a)),
        F32Sqrt => unop!(stack, pop_f32, F32, |a| libm::sqrtf(a)),
        F32Add => binop!(stack, pop_f32, F32, |a, b| a + b),
        F32Sub => binop!(stack, pop_f32, F32, |a, b| a - b),
        F32Mul => binop!(stack, pop_f32, F32, |a, b| a * b),
        F32Div => binop!(stack, pop_f32, F32, |a, b| a / b),
        F32Min => binop!(stack, pop_f32, F32, |a, b| f32_min(a, b)),
        F32Max => binop!(stack, pop_f32, F32, |a, b| f32_max(a, b)),
        F32Copysign => binop!(stack, pop_f32, F32, |a, b| f32_copysign(a, b)),

        // ====== f64 ======
        F64Eq => cmpop!(stack, pop_f64, |a, b| a == b),
        F64Ne => cmpop!(stack, pop_f64, |a, b| a != b),
        F64Lt => cmpop!(stack, pop_f64, |a, b| a < b),
        F64Gt => cmpop!(stack, pop_f64, |a, b| a > b),
        F64Le => cmpop!(stack, pop_f64, |a, b| a <= b),
        F64Ge => cmpop!(stack, pop_f64, |a, b| a >= b),
        F64Abs => unop!(stack, pop_f64, F64, |a| f64_abs(a)),
        F64Neg => unop!(stack, pop_f64, F64, |a| f64_neg(a)),
        F64Ceil => unop!(stack, pop_f64, F64, |a| libm::ceil(a)),
        F64Floor => unop!(stack, pop_f64, F64, |a| libm::floor(a)),
        F64Trunc => unop!(stack, pop_f64, F64, |a| libm::trunc(a)),
        F64Nearest => unop!(stack, pop_f64, F64, |a| f64_nearest(a)),
        F64Sqrt => unop!(stack, pop_f64, F64, |a| libm::sqrt(a)),
        F64Add => binop!(stack, pop_f64, F64, |a, b| a + b),
        F64Sub => binop!(stack, pop_f64, F64, |a, b| a - b),
        F64Mul => binop!(stack, pop_f64, F64, |a, b| a * b),
        F64Div => binop!(stack, pop_f64, F64, |a, b| a / b),
        F64Min => binop!(stack, pop_f64, F64, |a, b| f64_min(a, b)),
        F64Max => binop!(stack, pop_f64, F64, |a, b| f64_max(a, b)),
        F64Copysign => binop!(stack, pop_f64, F64, |a, b| f64_copysign(a, b)),

        // ====== Conversions ======
        I32WrapI64 => unop!(stack, pop_i64, I32, |a| a as i32),
        I32TruncF32S => trapping_trunc!(stack, pop_f32, F32, I32, i32_trunc_s),
        I32TruncF32U => trapping_trunc!(stack, pop_f32, F32, I32, i32_trunc_u),
        I32TruncF64S => trapping_trunc!(stack, pop_f64, F64, I32, i32_trunc_s),
        I32TruncF64U => trapping_trunc!(stack, pop_f64, F64, I32, i32_trunc_u),
        I64ExtendI32S => unop!(stack, pop_i32, I64, |a| a as i64),
        I64ExtendI32U => unop!(stack, pop_i32, I64, |a| a as u32 as i64),
        I64TruncF32S => trapping_trunc!(stack, pop_f32, F32, I64, i64_trunc_s),
        I64TruncF32U => trapping_trunc!(stack, pop_f32, F32, I64, i64_trunc_u),
        I64TruncF64S => trapping_trunc!(stack, pop_f64, F64, I64, i64_trunc_s),
        I64TruncF64U => trapping_trunc!(stack, pop_f64, F64, I64, i64_trunc_u),
        F32ConvertI32S => unop!(stack, pop_i32, F32, |a| a as f32),
        F32ConvertI32U => unop!(stack, pop_i32, F32, |a| a as u32 as f32),
        F32ConvertI64S => unop!(stack, pop_i64, F32, |a| a as f32),
        F32ConvertI64U => unop!(stack, pop_i64, F32, |a| a as u64 as f32),
        F32DemoteF64 => unop!(stack, pop_f64, F32, |a| a as f32),
        F64ConvertI32S => unop!(stack, pop_i32, F64, |a| a as f64),
        F64ConvertI32U => unop!(stack, pop_i32, F64, |a| a as u32 as f64),
        F64ConvertI64S => unop!(stack, pop_i64, F64, |a| a as f64),
        F64ConvertI64U => unop!(stack, pop_i64, F64, |a| a as u64 as f64),
        F64PromoteF32 => unop!(stack, pop_f32, F64, |a| a as f64),
        I32ReinterpretF32 => unop!(stack, pop_f32, I32, |a| a.to_bits() as i32),
        I64ReinterpretF64 => unop!(stack, pop_f64, I64, |a| a.to_bits() as i64),
        F32ReinterpretI32 => unop!(stack, pop_i32, F32, |a| f32::from_bits(a as u32)),
        F64ReinterpretI64 => unop!(stack, pop_i64, F64, |a| f64::from_bits(a as u64)),

        // ====== Saturating Truncation ======
        // `as` saturates and maps NaN to zero.
        I32TruncSatF32S => unop!(stack, pop_f32, I32, |a| a as i32),
        I32TruncSatF32U => unop!(stack, pop_f32, I32, |a| a as u32 as i32),
        I32TruncSatF64S => unop!(stack, pop_f64, I32, |a| a as i32),
        I32TruncSatF64U => unop!(stack, pop_f64, I32, |a| a as u32 as i32),
        I64TruncSatF32S => unop!(stack, pop_f32, I64, |a| a as i64),
        I64TruncSatF32U => unop!(stack, pop_f32, I64, |a| a as u64 as i64),
        I64TruncSatF64S => unop!(stack, pop_f64, I64, |a| a as i64),
        I64TruncSatF64U => unop!(stack, pop_f64, I64, |a| a as u64 as i64),

        other => {
            return Err(Trap::internal(alloc::format!(
                "{} is not a numeric instruction",
                other.name()
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(instr: Instruction, args: &[Value]) -> Result<Value, Trap> {
        let mut stack = ValueStack::new(16);
        stack.extend(args.iter().copied())?;
        execute(&instr, &mut stack)?;
        stack.pop()
    }

    #[test]
    fn test_integer_division_traps() {
        assert_eq!(i32_div_s(7, -2), Ok(-3));
        assert_eq!(i32_div_s(1, 0), Err(TrapKind::DivideByZero));
        assert_eq!(i32_div_s(i32::MIN, -1), Err(TrapKind::IntegerOverflow));
        assert_eq!(i32_rem_s(i32::MIN, -1), Ok(0));
        assert_eq!(i32_div_u(-1, 2), Ok(i32::MAX));
        assert_eq!(i64_rem_u(-1, 10), Ok((u64::MAX % 10) as i64));
        assert_eq!(i64_div_s(i64::MIN, -1), Err(TrapKind::IntegerOverflow));
    }

    #[test]
    fn test_div_trap_records_operands() {
        let trap = run(Instruction::I32DivS, &[Value::I32(1), Value::I32(0)]).unwrap_err();
        assert_eq!(trap.kind, TrapKind::DivideByZero);
        assert_eq!(trap.operands, vec![Value::I32(1), Value::I32(0)]);
    }

    #[test]
    fn test_shifts_and_rotates_mask_count() {
        assert_eq!(run(Instruction::I32Shl, &[1.into(), 33.into()]), Ok(Value::I32(2)));
        assert_eq!(
            run(Instruction::I32ShrU, &[(-1).into(), 31.into()]),
            Ok(Value::I32(1))
        );
        assert_eq!(
            run(Instruction::I32ShrS, &[(-8).into(), 1.into()]),
            Ok(Value::I32(-4))
        );
        assert_eq!(
            run(Instruction::I64Rotl, &[Value::I64(1), Value::I64(65)]),
            Ok(Value::I64(2))
        );
        assert_eq!(
            run(Instruction::I32Rotr, &[1.into(), (-1).into()]),
            Ok(Value::I32(2))
        );
    }

    #[test]
    fn test_float_min_max() {
        assert_eq!(f32_min(0.0, -0.0).to_bits(), (-0.0f32).to_bits());
        assert_eq!(f32_max(-0.0, 0.0).to_bits(), 0.0f32.to_bits());
        assert!(f64_min(f64::NAN, 1.0).is_nan());
        assert!(f64_max(1.0, f64::NAN).is_nan());
        assert_eq!(f64_min(1.0, 2.0), 1.0);
    }

    #[test]
    fn test_nearest_rounds_half_to_even() {
        assert_eq!(f32_nearest(2.5), 2.0);
        assert_eq!(f32_nearest(3.5), 4.0);
        assert_eq!(f64_nearest(-0.5).to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn test_sign_ops_preserve_nan_payload() {
        let nan = f32::from_bits(0x7FA0_0001);
        assert_eq!(f32_neg(nan).to_bits(), 0xFFA0_0001);
        assert_eq!(f32_abs(f32::from_bits(0xFFA0_0001)).to_bits(), 0x7FA0_0001);
        assert_eq!(f64_copysign(1.0, -0.0), -1.0);
    }

    #[test]
    fn test_trunc_traps() {
        assert_eq!(i32_trunc_s(-2147483648.9), Ok(i32::MIN));
        assert_eq!(i32_trunc_s(2147483648.0), Err(TrapKind::IntegerOverflow));
        assert_eq!(i32_trunc_u(-0.9), Ok(0));
        assert_eq!(i32_trunc_u(-1.0), Err(TrapKind::IntegerOverflow));
        assert_eq!(i32_trunc_u(4294967295.0), Ok(-1));
        assert_eq!(
            i64_trunc_s(f64::NAN),
            Err(TrapKind::InvalidConversionToInteger)
        );
        assert_eq!(i64_trunc_u(f64::INFINITY), Err(TrapKind::IntegerOverflow));
        let trap = run(Instruction::I32TruncF32S, &[Value::F32(f32::NAN)]).unwrap_err();
        assert_eq!(trap.kind, TrapKind::InvalidConversionToInteger);
    }

    #[test]
    fn test_trunc_sat_clamps() {
        assert_eq!(
            run(Instruction::I32TruncSatF32S, &[Value::F32(1e10)]),
            Ok(Value::I32(i32::MAX))
        );
        assert_eq!(
            run(Instruction::I32TruncSatF64U, &[Value::F64(-5.0)]),
            Ok(Value::I32(0))
        );
        assert_eq!(
            run(Instruction::I64TruncSatF64S, &[Value::F64(f64::NAN)]),
            Ok(Value::I64(0))
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            run(Instruction::I64ExtendI32U, &[Value::I32(-1)]),
            Ok(Value::I64(0xFFFF_FFFF))
        );
        assert_eq!(
            run(Instruction::F32ConvertI64U, &[Value::I64(-1)]),
            Ok(Value::F32(18446744073709551616.0))
        );
        assert_eq!(
            run(Instruction::I32Extend8S, &[Value::I32(0x80)]),
            Ok(Value::I32(-128))
        );
        assert_eq!(
            run(Instruction::F64ReinterpretI64, &[Value::I64(0x3FF0_0000_0000_0000)]),
            Ok(Value::F64(1.0))
        );
    }

    #[test]
    fn test_non_numeric_is_internal_error() {
        let trap = run(Instruction::Nop, &[]).unwrap_err();
        assert!(matches!(trap.kind, TrapKind::Internal(_)));
    }
}
