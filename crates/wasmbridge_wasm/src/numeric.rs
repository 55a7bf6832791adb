//! Numeric instruction semantics.
//!
//! Integer arithmetic wraps; division, remainder and float-to-int
//! truncation are the only operations that trap.

use crate::instr::{ConvOp, FloatOp, IntOp, NumOp};
use crate::trap::TrapKind;
use wasmbridge_core::Value;

macro_rules! int_ops {
    ($unary:ident, $binary:ident, $t:ty, $ut:ty, $variant:ident) => {
        fn $unary(op: IntOp, x: $t) -> Result<Value, TrapKind> {
            Ok(match op {
                IntOp::Eqz => Value::I32(i32::from(x == 0)),
                IntOp::Clz => Value::$variant(x.leading_zeros() as $t),
                IntOp::Ctz => Value::$variant(x.trailing_zeros() as $t),
                IntOp::Popcnt => Value::$variant(x.count_ones() as $t),
                IntOp::Extend8S => Value::$variant(x as i8 as $t),
                IntOp::Extend16S => Value::$variant(x as i16 as $t),
                IntOp::Extend32S => Value::$variant(x as i32 as $t),
                _ => return Err(TrapKind::OperandMismatch),
            })
        }

        fn $binary(op: IntOp, a: $t, b: $t) -> Result<Value, TrapKind> {
            let (ua, ub) = (a as $ut, b as $ut);
            let shift = (b as u32) & (<$t>::BITS - 1);
            let cmp = |c: bool| Value::I32(i32::from(c));
            Ok(match op {
                IntOp::Eq => cmp(a == b),
                IntOp::Ne => cmp(a != b),
                IntOp::LtS => cmp(a < b),
                IntOp::LtU => cmp(ua < ub),
                IntOp::GtS => cmp(a > b),
                IntOp::GtU => cmp(ua > ub),
                IntOp::LeS => cmp(a <= b),
                IntOp::LeU => cmp(ua <= ub),
                IntOp::GeS => cmp(a >= b),
                IntOp::GeU => cmp(ua >= ub),
                IntOp::Add => Value::$variant(a.wrapping_add(b)),
                IntOp::Sub => Value::$variant(a.wrapping_sub(b)),
                IntOp::Mul => Value::$variant(a.wrapping_mul(b)),
                IntOp::DivS => {
                    if b == 0 {
                        return Err(TrapKind::DivideByZero);
                    }
                    if a == <$t>::MIN && b == -1 {
                        return Err(TrapKind::IntegerOverflow);
                    }
                    Value::$variant(a / b)
                }
                IntOp::DivU => {
                    if b == 0 {
                        return Err(TrapKind::DivideByZero);
                    }
                    Value::$variant((ua / ub) as $t)
                }
                IntOp::RemS => {
                    if b == 0 {
                        return Err(TrapKind::DivideByZero);
                    }
                    // MIN % -1 is 0, not a trap
                    Value::$variant(a.wrapping_rem(b))
                }
                IntOp::RemU => {
                    if b == 0 {
                        return Err(TrapKind::DivideByZero);
                    }
                    Value::$variant((ua % ub) as $t)
                }
                IntOp::And => Value::$variant(a & b),
                IntOp::Or => Value::$variant(a | b),
                IntOp::Xor => Value::$variant(a ^ b),
                IntOp::Shl => Value::$variant(a << shift),
                IntOp::ShrS => Value::$variant(a >> shift),
                IntOp::ShrU => Value::$variant((ua >> shift) as $t),
                IntOp::Rotl => Value::$variant(a.rotate_left(shift)),
                IntOp::Rotr => Value::$variant(a.rotate_right(shift)),
                _ => return Err(TrapKind::OperandMismatch),
            })
        }
    };
}

macro_rules! float_ops {
    ($unary:ident, $binary:ident, $t:ty, $variant:ident) => {
        fn $unary(op: FloatOp, x: $t) -> Result<Value, TrapKind> {
            Ok(Value::$variant(match op {
                FloatOp::Abs => x.abs(),
                FloatOp::Neg => -x,
                FloatOp::Ceil => x.ceil(),
                FloatOp::Floor => x.floor(),
                FloatOp::Trunc => x.trunc(),
                FloatOp::Nearest => x.round_ties_even(),
                FloatOp::Sqrt => x.sqrt(),
                _ => return Err(TrapKind::OperandMismatch),
            }))
        }

        fn $binary(op: FloatOp, a: $t, b: $t) -> Result<Value, TrapKind> {
            let cmp = |c: bool| Value::I32(i32::from(c));
            Ok(match op {
                FloatOp::Eq => cmp(a == b),
                FloatOp::Ne => cmp(a != b),
                FloatOp::Lt => cmp(a < b),
                FloatOp::Gt => cmp(a > b),
                FloatOp::Le => cmp(a <= b),
                FloatOp::Ge => cmp(a >= b),
                FloatOp::Add => Value::$variant(a + b),
                FloatOp::Sub => Value::$variant(a - b),
                FloatOp::Mul => Value::$variant(a * b),
                FloatOp::Div => Value::$variant(a / b),
                FloatOp::Min => Value::$variant(if a.is_nan() || b.is_nan() {
                    <$t>::NAN
                } else if a == b {
                    // -0 and +0 compare equal; min prefers the negative one
                    if a.is_sign_negative() { a } else { b }
                } else {
                    a.min(b)
                }),
                FloatOp::Max => Value::$variant(if a.is_nan() || b.is_nan() {
                    <$t>::NAN
                } else if a == b {
                    if a.is_sign_positive() { a } else { b }
                } else {
                    a.max(b)
                }),
                FloatOp::Copysign => Value::$variant(a.copysign(b)),
                _ => return Err(TrapKind::OperandMismatch),
            })
        }
    };
}

int_ops!(i32_unary, i32_binary, i32, u32, I32);
int_ops!(i64_unary, i64_binary, i64, u64, I64);
float_ops!(f32_unary, f32_binary, f32, F32);
float_ops!(f64_unary, f64_binary, f64, F64);

/// Truncate toward zero, trapping unless the result lies strictly between
/// the two bounds
fn truncate(x: f64, above: f64, below: f64) -> Result<f64, TrapKind> {
    if x.is_nan() {
        return Err(TrapKind::InvalidConversionToInteger);
    }
    if x > above && x < below {
        Ok(x.trunc())
    } else {
        Err(TrapKind::IntegerOverflow)
    }
}

const I32_RANGE: (f64, f64) = (-2_147_483_649.0, 2_147_483_648.0);
const U32_RANGE: (f64, f64) = (-1.0, 4_294_967_296.0);
// First f64 below -2^63 and 2^63 itself
const I64_RANGE: (f64, f64) = (-9_223_372_036_854_777_856.0, 9_223_372_036_854_775_808.0);
const U64_RANGE: (f64, f64) = (-1.0, 18_446_744_073_709_551_616.0);

fn trunc_i32(x: f64) -> Result<Value, TrapKind> {
    truncate(x, I32_RANGE.0, I32_RANGE.1).map(|t| Value::I32(t as i32))
}

fn trunc_u32(x: f64) -> Result<Value, TrapKind> {
    truncate(x, U32_RANGE.0, U32_RANGE.1).map(|t| Value::I32(t as u32 as i32))
}

fn trunc_i64(x: f64) -> Result<Value, TrapKind> {
    truncate(x, I64_RANGE.0, I64_RANGE.1).map(|t| Value::I64(t as i64))
}

fn trunc_u64(x: f64) -> Result<Value, TrapKind> {
    truncate(x, U64_RANGE.0, U64_RANGE.1).map(|t| Value::I64(t as u64 as i64))
}

fn convert(op: ConvOp, v: Value) -> Result<Value, TrapKind> {
    use ConvOp as C;
    use Value::{F32, F64, I32, I64};

    Ok(match (op, v) {
        (C::I32WrapI64, I64(x)) => I32(x as i32),
        (C::I32TruncF32S, F32(x)) => trunc_i32(f64::from(x))?,
        (C::I32TruncF32U, F32(x)) => trunc_u32(f64::from(x))?,
        (C::I32TruncF64S, F64(x)) => trunc_i32(x)?,
        (C::I32TruncF64U, F64(x)) => trunc_u32(x)?,
        (C::I64ExtendI32S, I32(x)) => I64(i64::from(x)),
        (C::I64ExtendI32U, I32(x)) => I64(i64::from(x as u32)),
        (C::I64TruncF32S, F32(x)) => trunc_i64(f64::from(x))?,
        (C::I64TruncF32U, F32(x)) => trunc_u64(f64::from(x))?,
        (C::I64TruncF64S, F64(x)) => trunc_i64(x)?,
        (C::I64TruncF64U, F64(x)) => trunc_u64(x)?,
        (C::F32ConvertI32S, I32(x)) => F32(x as f32),
        (C::F32ConvertI32U, I32(x)) => F32(x as u32 as f32),
        (C::F32ConvertI64S, I64(x)) => F32(x as f32),
        (C::F32ConvertI64U, I64(x)) => F32(x as u64 as f32),
        (C::F32DemoteF64, F64(x)) => F32(x as f32),
        (C::F64ConvertI32S, I32(x)) => F64(f64::from(x)),
        (C::F64ConvertI32U, I32(x)) => F64(f64::from(x as u32)),
        (C::F64ConvertI64S, I64(x)) => F64(x as f64),
        (C::F64ConvertI64U, I64(x)) => F64(x as u64 as f64),
        (C::F64PromoteF32, F32(x)) => F64(f64::from(x)),
        (C::I32ReinterpretF32, F32(x)) => I32(x.to_bits() as i32),
        (C::I64ReinterpretF64, F64(x)) => I64(x.to_bits() as i64),
        (C::F32ReinterpretI32, I32(x)) => F32(f32::from_bits(x as u32)),
        (C::F64ReinterpretI64, I64(x)) => F64(f64::from_bits(x as u64)),
        // `as` saturates and maps NaN to zero
        (C::I32TruncSatF32S, F32(x)) => I32(x as i32),
        (C::I32TruncSatF32U, F32(x)) => I32(x as u32 as i32),
        (C::I32TruncSatF64S, F64(x)) => I32(x as i32),
        (C::I32TruncSatF64U, F64(x)) => I32(x as u32 as i32),
        (C::I64TruncSatF32S, F32(x)) => I64(x as i64),
        (C::I64TruncSatF32U, F32(x)) => I64(x as u64 as i64),
        (C::I64TruncSatF64S, F64(x)) => I64(x as i64),
        (C::I64TruncSatF64U, F64(x)) => I64(x as u64 as i64),
        _ => return Err(TrapKind::OperandMismatch),
    })
}

/// Apply a one-operand numeric instruction
///
/// # Errors
///
/// Traps on failed conversions, or `OperandMismatch` if `v` has the wrong type
pub fn unary(op: NumOp, v: Value) -> Result<Value, TrapKind> {
    match (op, v) {
        (NumOp::I32(op), Value::I32(x)) => i32_unary(op, x),
        (NumOp::I64(op), Value::I64(x)) => i64_unary(op, x),
        (NumOp::F32(op), Value::F32(x)) => f32_unary(op, x),
        (NumOp::F64(op), Value::F64(x)) => f64_unary(op, x),
        (NumOp::Conv(op), v) => convert(op, v),
        _ => Err(TrapKind::OperandMismatch),
    }
}

/// Apply a two-operand numeric instruction
///
/// # Errors
///
/// Traps on division by zero and signed overflow, or `OperandMismatch` if
/// the operands have the wrong type
pub fn binary(op: NumOp, a: Value, b: Value) -> Result<Value, TrapKind> {
    match (op, a, b) {
        (NumOp::I32(op), Value::I32(a), Value::I32(b)) => i32_binary(op, a, b),
        (NumOp::I64(op), Value::I64(a), Value::I64(b)) => i64_binary(op, a, b),
        (NumOp::F32(op), Value::F32(a), Value::F32(b)) => f32_binary(op, a, b),
        (NumOp::F64(op), Value::F64(a), Value::F64(b)) => f64_binary(op, a, b),
        _ => Err(TrapKind::OperandMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn i32_op(op: IntOp, a: i32, b: i32) -> Result<Value, TrapKind> {
        binary(NumOp::I32(op), Value::I32(a), Value::I32(b))
    }

    fn conv(op: ConvOp, v: Value) -> Result<Value, TrapKind> {
        unary(NumOp::Conv(op), v)
    }

    #[test]
    fn test_add_wraps() {
        assert_eq!(i32_op(IntOp::Add, i32::MAX, 1), Ok(Value::I32(i32::MIN)));
        assert_eq!(
            binary(NumOp::I64(IntOp::Sub), Value::I64(i64::MIN), Value::I64(1)),
            Ok(Value::I64(i64::MAX))
        );
    }

    #[test]
    fn test_division_traps() {
        assert_eq!(i32_op(IntOp::DivS, 1, 0), Err(TrapKind::DivideByZero));
        assert_eq!(i32_op(IntOp::RemU, 1, 0), Err(TrapKind::DivideByZero));
        assert_eq!(i32_op(IntOp::DivS, i32::MIN, -1), Err(TrapKind::IntegerOverflow));
        assert_eq!(i32_op(IntOp::RemS, i32::MIN, -1), Ok(Value::I32(0)));
        assert_eq!(i32_op(IntOp::DivU, -1, 2), Ok(Value::I32(i32::MAX)));
        assert_eq!(i32_op(IntOp::DivS, -7, 2), Ok(Value::I32(-3)));
        assert_eq!(i32_op(IntOp::RemS, -7, 2), Ok(Value::I32(-1)));
    }

    #[test]
    fn test_shifts_mask_count() {
        assert_eq!(i32_op(IntOp::Shl, 1, 33), Ok(Value::I32(2)));
        assert_eq!(i32_op(IntOp::ShrS, -8, 1), Ok(Value::I32(-4)));
        assert_eq!(i32_op(IntOp::ShrU, -8, 1), Ok(Value::I32(0x7FFF_FFFC)));
        assert_eq!(
            i32_op(IntOp::Rotl, 0x8000_0001_u32 as i32, 1),
            Ok(Value::I32(3))
        );
        assert_eq!(i32_op(IntOp::Rotr, 1, 1), Ok(Value::I32(i32::MIN)));
    }

    #[test]
    fn test_unsigned_compare() {
        assert_eq!(i32_op(IntOp::LtU, -1, 1), Ok(Value::I32(0)));
        assert_eq!(i32_op(IntOp::LtS, -1, 1), Ok(Value::I32(1)));
    }

    #[test]
    fn test_bit_counts_and_extend() {
        assert_eq!(unary(NumOp::I32(IntOp::Clz), Value::I32(1)), Ok(Value::I32(31)));
        assert_eq!(unary(NumOp::I64(IntOp::Ctz), Value::I64(0)), Ok(Value::I64(64)));
        assert_eq!(unary(NumOp::I32(IntOp::Popcnt), Value::I32(-1)), Ok(Value::I32(32)));
        assert_eq!(unary(NumOp::I32(IntOp::Extend8S), Value::I32(0x80)), Ok(Value::I32(-128)));
        assert_eq!(
            unary(NumOp::I64(IntOp::Extend32S), Value::I64(0xFFFF_FFFF)),
            Ok(Value::I64(-1))
        );
        assert_eq!(unary(NumOp::I32(IntOp::Eqz), Value::I32(0)), Ok(Value::I32(1)));
    }

    #[test]
    fn test_float_min_max_zero_and_nan() {
        let min = binary(NumOp::F64(FloatOp::Min), Value::F64(0.0), Value::F64(-0.0)).unwrap();
        assert!(min.as_f64().unwrap().is_sign_negative());
        let max = binary(NumOp::F32(FloatOp::Max), Value::F32(-0.0), Value::F32(0.0)).unwrap();
        assert!(max.as_f32().unwrap().is_sign_positive());
        let nan = binary(NumOp::F32(FloatOp::Min), Value::F32(f32::NAN), Value::F32(1.0)).unwrap();
        assert!(nan.as_f32().unwrap().is_nan());
    }

    #[test]
    fn test_nearest_ties_to_even() {
        assert_eq!(unary(NumOp::F64(FloatOp::Nearest), Value::F64(2.5)), Ok(Value::F64(2.0)));
        assert_eq!(unary(NumOp::F32(FloatOp::Nearest), Value::F32(-3.5)), Ok(Value::F32(-4.0)));
    }

    #[test]
    fn test_float_compare_nan() {
        let ne = binary(NumOp::F64(FloatOp::Ne), Value::F64(f64::NAN), Value::F64(f64::NAN));
        assert_eq!(ne, Ok(Value::I32(1)));
        let eq = binary(NumOp::F64(FloatOp::Eq), Value::F64(f64::NAN), Value::F64(f64::NAN));
        assert_eq!(eq, Ok(Value::I32(0)));
    }

    #[test]
    fn test_truncation_ranges() {
        assert_eq!(conv(ConvOp::I32TruncF32S, Value::F32(-2_147_483_648.0)), Ok(Value::I32(i32::MIN)));
        assert_eq!(
            conv(ConvOp::I32TruncF32S, Value::F32(2_147_483_648.0)),
            Err(TrapKind::IntegerOverflow)
        );
        assert_eq!(conv(ConvOp::I32TruncF64S, Value::F64(-2_147_483_648.9)), Ok(Value::I32(i32::MIN)));
        assert_eq!(
            conv(ConvOp::I32TruncF64S, Value::F64(-2_147_483_649.0)),
            Err(TrapKind::IntegerOverflow)
        );
        assert_eq!(conv(ConvOp::I32TruncF64U, Value::F64(-0.9)), Ok(Value::I32(0)));
        assert_eq!(conv(ConvOp::I32TruncF64U, Value::F64(-1.0)), Err(TrapKind::IntegerOverflow));
        assert_eq!(conv(ConvOp::I32TruncF64U, Value::F64(4_294_967_295.0)), Ok(Value::I32(-1)));
        assert_eq!(
            conv(ConvOp::I64TruncF64S, Value::F64(9_223_372_036_854_775_808.0)),
            Err(TrapKind::IntegerOverflow)
        );
        assert_eq!(
            conv(ConvOp::I64TruncF64S, Value::F64(-9_223_372_036_854_775_808.0)),
            Ok(Value::I64(i64::MIN))
        );
        assert_eq!(
            conv(ConvOp::I64TruncF32U, Value::F32(f32::NAN)),
            Err(TrapKind::InvalidConversionToInteger)
        );
    }

    #[test]
    fn test_saturating_truncation() {
        assert_eq!(conv(ConvOp::I32TruncSatF32S, Value::F32(f32::NAN)), Ok(Value::I32(0)));
        assert_eq!(conv(ConvOp::I32TruncSatF64S, Value::F64(1e10)), Ok(Value::I32(i32::MAX)));
        assert_eq!(conv(ConvOp::I32TruncSatF64U, Value::F64(-5.0)), Ok(Value::I32(0)));
        assert_eq!(conv(ConvOp::I64TruncSatF64U, Value::F64(f64::INFINITY)), Ok(Value::I64(-1)));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(conv(ConvOp::I64ExtendI32U, Value::I32(-1)), Ok(Value::I64(0xFFFF_FFFF)));
        assert_eq!(conv(ConvOp::I32WrapI64, Value::I64(0x1_0000_0005)), Ok(Value::I32(5)));
        assert_eq!(conv(ConvOp::F64ConvertI32U, Value::I32(-1)), Ok(Value::F64(4_294_967_295.0)));
        assert_eq!(
            conv(ConvOp::I32ReinterpretF32, Value::F32(1.0)),
            Ok(Value::I32(0x3F80_0000))
        );
    }

    #[test]
    fn test_wrong_operand_type() {
        assert_eq!(
            binary(NumOp::I32(IntOp::Add), Value::I32(1), Value::I64(1)),
            Err(TrapKind::OperandMismatch)
        );
    }

    proptest! {
        #[test]
        fn prop_i32_add_wraps(a in any::<i32>(), b in any::<i32>()) {
            prop_assert_eq!(i32_op(IntOp::Add, a, b), Ok(Value::I32(a.wrapping_add(b))));
        }

        #[test]
        fn prop_i64_mul_wraps(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(
                binary(NumOp::I64(IntOp::Mul), Value::I64(a), Value::I64(b)),
                Ok(Value::I64(a.wrapping_mul(b)))
            );
        }

        #[test]
        fn prop_div_rem_identity(a in any::<i32>(), b in any::<i32>().prop_filter("nonzero", |b| *b != 0)) {
            prop_assume!(!(a == i32::MIN && b == -1));
            let q = i32_op(IntOp::DivS, a, b).unwrap().as_i32().unwrap();
            let r = i32_op(IntOp::RemS, a, b).unwrap().as_i32().unwrap();
            prop_assert_eq!(q.wrapping_mul(b).wrapping_add(r), a);
        }
    }
}
