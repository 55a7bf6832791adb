//! Native value marshalling.
//!
//! Platform shells hand over plain numbers. Each parameter has a declared
//! native type fixing width and signedness; a number that does not fit
//! that type exactly is rejected, never clipped.

use serde::{Deserialize, Serialize};
use std::fmt;
use wasmbridge_core::{FuncType, ValType, Value};

/// A number as it crosses the bridge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NativeValue {
    /// Signed integer
    Int(i64),
    /// Unsigned integer above `i64::MAX`, or one declared unsigned
    UInt(u64),
    /// Floating point
    Float(f64),
}

impl NativeValue {
    /// Widest core type of the same class, used when reporting arity errors
    #[must_use]
    pub const fn val_type(self) -> ValType {
        match self {
            Self::Int(_) | Self::UInt(_) => ValType::I64,
            Self::Float(_) => ValType::F64,
        }
    }
}

impl fmt::Display for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for NativeValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for NativeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for NativeValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for NativeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Declared width and signedness of a native parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeType {
    /// 32-bit signed
    I32,
    /// 32-bit unsigned, carried as an i32 bit pattern
    U32,
    /// 64-bit signed
    I64,
    /// 64-bit unsigned, carried as an i64 bit pattern
    U64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl NativeType {
    /// Signed default for a core type
    #[must_use]
    pub const fn default_for(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Self::I32,
            ValType::I64 => Self::I64,
            ValType::F32 => Self::F32,
            ValType::F64 => Self::F64,
        }
    }

    /// Core type this native type is carried in
    #[must_use]
    pub const fn val_type(self) -> ValType {
        match self {
            Self::I32 | Self::U32 => ValType::I32,
            Self::I64 | Self::U64 => ValType::I64,
            Self::F32 => ValType::F32,
            Self::F64 => ValType::F64,
        }
    }

    const fn int_range(self) -> Option<(i128, i128)> {
        match self {
            Self::I32 => Some((i32::MIN as i128, i32::MAX as i128)),
            Self::U32 => Some((0, u32::MAX as i128)),
            Self::I64 => Some((i64::MIN as i128, i64::MAX as i128)),
            Self::U64 => Some((0, u64::MAX as i128)),
            Self::F32 | Self::F64 => None,
        }
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Marshalling errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarshalError {
    /// Wrong number of arguments or declared types
    #[error("Expected {expected} arguments, got {found}")]
    Arity {
        /// Parameters in the signature
        expected: usize,
        /// Values supplied
        found: usize,
    },

    /// Declared native type is not carried by the parameter's core type
    #[error("Argument {index} declared {declared}, but the export takes {expected}")]
    Declared {
        /// Argument position
        index: usize,
        /// Declared native type
        declared: NativeType,
        /// Parameter type in the signature
        expected: ValType,
    },

    /// Value does not fit the declared type
    #[error("Argument {index} value {value} is out of range for {ty}")]
    OutOfRange {
        /// Argument position
        index: usize,
        /// Offending value
        value: NativeValue,
        /// Target native type
        ty: NativeType,
    },

    /// Fractional or non-finite value for an integer type
    #[error("Argument {index} value {value} is not an integer, {ty} required")]
    NotIntegral {
        /// Argument position
        index: usize,
        /// Offending value
        value: NativeValue,
        /// Target native type
        ty: NativeType,
    },

    /// Value is not exactly representable in the declared float type
    #[error("Argument {index} value {value} is not exactly representable as {ty}")]
    PrecisionLoss {
        /// Argument position
        index: usize,
        /// Offending value
        value: NativeValue,
        /// Target native type
        ty: NativeType,
    },
}

fn integer(index: usize, value: NativeValue, ty: NativeType) -> Result<i128, MarshalError> {
    let wide = match value {
        NativeValue::Int(v) => i128::from(v),
        NativeValue::UInt(v) => i128::from(v),
        NativeValue::Float(f) => {
            if !f.is_finite() || f.fract() != 0.0 {
                return Err(MarshalError::NotIntegral { index, value, ty });
            }
            f as i128
        }
    };
    match ty.int_range() {
        Some((min, max)) if (min..=max).contains(&wide) => Ok(wide),
        _ => Err(MarshalError::OutOfRange { index, value, ty }),
    }
}

fn float(index: usize, value: NativeValue, ty: NativeType) -> Result<f64, MarshalError> {
    let loss = || MarshalError::PrecisionLoss { index, value, ty };
    let exact_int = |wide: i128| match ty {
        NativeType::F32 => (wide as f32) as i128 == wide,
        _ => (wide as f64) as i128 == wide,
    };
    match value {
        NativeValue::Int(v) if exact_int(i128::from(v)) => Ok(v as f64),
        NativeValue::UInt(v) if exact_int(i128::from(v)) => Ok(v as f64),
        NativeValue::Int(_) | NativeValue::UInt(_) => Err(loss()),
        NativeValue::Float(f) if ty == NativeType::F32 => {
            let narrow = f as f32;
            if f.is_finite() && narrow.is_infinite() {
                Err(MarshalError::OutOfRange { index, value, ty })
            } else if f.is_nan() || f64::from(narrow) == f {
                Ok(f)
            } else {
                Err(loss())
            }
        }
        NativeValue::Float(f) => Ok(f),
    }
}

/// Convert one native value to a core value of the declared type
///
/// # Errors
///
/// Returns error if the value does not fit `ty` exactly
pub fn to_value(index: usize, value: NativeValue, ty: NativeType) -> Result<Value, MarshalError> {
    Ok(match ty {
        NativeType::I32 | NativeType::U32 => Value::I32(integer(index, value, ty)? as u32 as i32),
        NativeType::I64 | NativeType::U64 => Value::I64(integer(index, value, ty)? as u64 as i64),
        NativeType::F32 => Value::F32(float(index, value, ty)? as f32),
        NativeType::F64 => Value::F64(float(index, value, ty)?),
    })
}

/// Convert a core value back to a native value
#[must_use]
pub fn from_value(value: Value, ty: NativeType) -> NativeValue {
    match (value, ty) {
        (Value::I32(v), NativeType::U32) => NativeValue::UInt(u64::from(v as u32)),
        (Value::I32(v), _) => NativeValue::Int(i64::from(v)),
        (Value::I64(v), NativeType::U64) => NativeValue::UInt(v as u64),
        (Value::I64(v), _) => NativeValue::Int(v),
        (Value::F32(v), _) => NativeValue::Float(f64::from(v)),
        (Value::F64(v), _) => NativeValue::Float(v),
    }
}

fn resolve_types(
    core: &[ValType],
    declared: Option<&[NativeType]>,
) -> Result<Vec<NativeType>, MarshalError> {
    let Some(declared) = declared else {
        return Ok(core.iter().copied().map(NativeType::default_for).collect());
    };
    if declared.len() != core.len() {
        return Err(MarshalError::Arity {
            expected: core.len(),
            found: declared.len(),
        });
    }
    for (index, (native, expected)) in declared.iter().zip(core).enumerate() {
        if native.val_type() != *expected {
            return Err(MarshalError::Declared {
                index,
                declared: *native,
                expected: *expected,
            });
        }
    }
    Ok(declared.to_vec())
}

/// Marshal arguments for a call against an export signature
///
/// Without declared types, integers default to signed.
///
/// # Errors
///
/// Returns the first argument that does not fit
pub fn marshal_args(
    signature: &FuncType,
    args: &[NativeValue],
    declared: Option<&[NativeType]>,
) -> Result<Vec<Value>, MarshalError> {
    if args.len() != signature.params.len() {
        return Err(MarshalError::Arity {
            expected: signature.params.len(),
            found: args.len(),
        });
    }
    let types = resolve_types(&signature.params, declared)?;
    args.iter()
        .zip(types)
        .enumerate()
        .map(|(index, (value, ty))| to_value(index, *value, ty))
        .collect()
}

/// Convert results back, honouring declared result types when they fit
#[must_use]
pub fn unmarshal_results(values: &[Value], declared: Option<&[NativeType]>) -> Vec<NativeValue> {
    let core: Vec<ValType> = values.iter().map(Value::ty).collect();
    let types = resolve_types(&core, declared)
        .unwrap_or_else(|_| core.iter().copied().map(NativeType::default_for).collect());
    values
        .iter()
        .zip(types)
        .map(|(value, ty)| from_value(*value, ty))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn add_sig() -> FuncType {
        FuncType::new([ValType::I32, ValType::I32], [ValType::I32])
    }

    #[test]
    fn test_marshal_defaults_to_signature() {
        let values = marshal_args(&add_sig(), &[17.into(), (-25).into()], None).unwrap();
        assert_eq!(values, vec![Value::I32(17), Value::I32(-25)]);
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let err = marshal_args(&add_sig(), &[NativeValue::Int(1 << 31), 0.into()], None).unwrap_err();
        assert!(matches!(err, MarshalError::OutOfRange { index: 0, ty: NativeType::I32, .. }));

        let err = to_value(0, NativeValue::Int(-1), NativeType::U32).unwrap_err();
        assert!(matches!(err, MarshalError::OutOfRange { .. }));
        let err = to_value(0, NativeValue::UInt(u64::MAX), NativeType::I64).unwrap_err();
        assert!(matches!(err, MarshalError::OutOfRange { .. }));
    }

    #[test]
    fn test_unsigned_bit_patterns() {
        assert_eq!(
            to_value(0, NativeValue::UInt(u64::from(u32::MAX)), NativeType::U32).unwrap(),
            Value::I32(-1)
        );
        assert_eq!(
            to_value(0, NativeValue::UInt(u64::MAX), NativeType::U64).unwrap(),
            Value::I64(-1)
        );
        assert_eq!(from_value(Value::I32(-1), NativeType::U32), NativeValue::UInt(4_294_967_295));
        assert_eq!(from_value(Value::I32(-1), NativeType::I32), NativeValue::Int(-1));
    }

    #[test]
    fn test_floats_for_integers() {
        assert_eq!(
            to_value(0, NativeValue::Float(42.0), NativeType::I32).unwrap(),
            Value::I32(42)
        );
        let err = to_value(0, NativeValue::Float(1.5), NativeType::I32).unwrap_err();
        assert!(matches!(err, MarshalError::NotIntegral { .. }));
        let err = to_value(0, NativeValue::Float(f64::NAN), NativeType::I64).unwrap_err();
        assert!(matches!(err, MarshalError::NotIntegral { .. }));
        let err = to_value(0, NativeValue::Float(4_294_967_296.0), NativeType::U32).unwrap_err();
        assert!(matches!(err, MarshalError::OutOfRange { .. }));
    }

    #[test]
    fn test_float_precision() {
        assert_eq!(
            to_value(0, NativeValue::Float(0.5), NativeType::F32).unwrap(),
            Value::F32(0.5)
        );
        let err = to_value(0, NativeValue::Float(0.1), NativeType::F32).unwrap_err();
        assert!(matches!(err, MarshalError::PrecisionLoss { .. }));
        let err = to_value(0, NativeValue::Float(1e300), NativeType::F32).unwrap_err();
        assert!(matches!(err, MarshalError::OutOfRange { .. }));
        assert_eq!(
            to_value(0, NativeValue::Float(0.1), NativeType::F64).unwrap(),
            Value::F64(0.1)
        );
        let err = to_value(0, NativeValue::Int((1 << 24) + 1), NativeType::F32).unwrap_err();
        assert!(matches!(err, MarshalError::PrecisionLoss { .. }));
        let err = to_value(0, NativeValue::Int(i64::MAX), NativeType::F64).unwrap_err();
        assert!(matches!(err, MarshalError::PrecisionLoss { .. }));
    }

    #[test]
    fn test_arity_and_declared_types() {
        let err = marshal_args(&add_sig(), &[1.into()], None).unwrap_err();
        assert_eq!(err, MarshalError::Arity { expected: 2, found: 1 });

        let declared = [NativeType::U32, NativeType::I64];
        let err = marshal_args(&add_sig(), &[1.into(), 2.into()], Some(&declared)).unwrap_err();
        assert!(matches!(err, MarshalError::Declared { index: 1, .. }));
    }

    #[test]
    fn test_json_numbers() {
        let values: Vec<NativeValue> =
            serde_json::from_str("[42, -7, 18446744073709551615, 2.5]").unwrap();
        assert_eq!(
            values,
            vec![
                NativeValue::Int(42),
                NativeValue::Int(-7),
                NativeValue::UInt(u64::MAX),
                NativeValue::Float(2.5)
            ]
        );
        let types: Vec<NativeType> = serde_json::from_str(r#"["u32", "f64"]"#).unwrap();
        assert_eq!(types, vec![NativeType::U32, NativeType::F64]);
    }

    #[test]
    fn test_unmarshal_ignores_mismatched_declarations() {
        let results = unmarshal_results(&[Value::I32(-1)], Some(&[NativeType::F64]));
        assert_eq!(results, vec![NativeValue::Int(-1)]);
        let results = unmarshal_results(&[Value::I64(-1)], Some(&[NativeType::U64]));
        assert_eq!(results, vec![NativeValue::UInt(u64::MAX)]);
    }

    proptest! {
        #[test]
        fn prop_i32_round_trip(v in any::<i32>()) {
            let value = to_value(0, v.into(), NativeType::I32).unwrap();
            prop_assert_eq!(value, Value::I32(v));
            prop_assert_eq!(from_value(value, NativeType::I32), NativeValue::Int(i64::from(v)));
        }

        #[test]
        fn prop_i64_outside_i32_rejected(v in any::<i64>()) {
            let fits = i32::try_from(v).is_ok();
            prop_assert_eq!(to_value(0, v.into(), NativeType::I32).is_ok(), fits);
        }
    }
}
