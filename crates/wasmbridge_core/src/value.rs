//! Value types, runtime values and function signatures.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A WebAssembly number type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValType {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit IEEE-754 float
    F32,
    /// 64-bit IEEE-754 float
    F64,
}

impl ValType {
    /// Binary encoding of this type
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::I32 => 0x7F,
            Self::I64 => 0x7E,
            Self::F32 => 0x7D,
            Self::F64 => 0x7C,
        }
    }

    /// Decode a type from its binary encoding
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7F => Some(Self::I32),
            0x7E => Some(Self::I64),
            0x7D => Some(Self::F32),
            0x7C => Some(Self::F64),
            _ => None,
        }
    }

    /// Text name of this type
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i32" => Ok(Self::I32),
            "i64" => Ok(Self::I64),
            "f32" => Ok(Self::F32),
            "f64" => Ok(Self::F64),
            other => Err(CoreError::UnknownValType {
                name: other.to_string(),
            }),
        }
    }
}

/// A runtime value
///
/// Integers are stored signed; signedness is a property of the operation
/// applied to them, not of the value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
}

impl Value {
    /// The zero value of a type, used for fresh locals
    #[must_use]
    pub const fn default_for(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Self::I32(0),
            ValType::I64 => Self::I64(0),
            ValType::F32 => Self::F32(0.0),
            ValType::F64 => Self::F64(0.0),
        }
    }

    /// Type of this value
    #[must_use]
    pub const fn ty(&self) -> ValType {
        match self {
            Self::I32(_) => ValType::I32,
            Self::I64(_) => ValType::I64,
            Self::F32(_) => ValType::F32,
            Self::F64(_) => ValType::F64,
        }
    }

    /// Get as i32 if this is an i32
    #[must_use]
    pub const fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as i64 if this is an i64
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as f32 if this is an f32
    #[must_use]
    pub const fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as f64 if this is an f64
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Bitwise equality, so NaN payloads compare equal to themselves
    #[must_use]
    pub fn bits_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::F32(a), Self::F32(b)) => a.to_bits() == b.to_bits(),
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{}:i32", v),
            Self::I64(v) => write!(f, "{}:i64", v),
            Self::F32(v) => write!(f, "{}:f32", v),
            Self::F64(v) => write!(f, "{}:f64", v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

/// A function signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FuncType {
    /// Parameter types, in order
    pub params: Vec<ValType>,
    /// Result types, in order
    pub results: Vec<ValType>,
}

impl FuncType {
    /// Create a new signature
    #[must_use]
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// Check whether a list of values matches the parameter types
    #[must_use]
    pub fn accepts(&self, args: &[Value]) -> bool {
        args.len() == self.params.len()
            && args.iter().zip(&self.params).all(|(v, t)| v.ty() == *t)
    }
}

fn write_types(f: &mut fmt::Formatter<'_>, types: &[ValType]) -> fmt::Result {
    f.write_str("(")?;
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", ty)?;
    }
    f.write_str(")")
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_types(f, &self.params)?;
        f.write_str(" -> ")?;
        write_types(f, &self.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valtype_byte_roundtrip() {
        for ty in [ValType::I32, ValType::I64, ValType::F32, ValType::F64] {
            assert_eq!(ValType::from_byte(ty.to_byte()), Some(ty));
        }
        assert_eq!(ValType::from_byte(0x7B), None);
    }

    #[test]
    fn test_valtype_parse() {
        assert_eq!("f64".parse::<ValType>().unwrap(), ValType::F64);
        assert!("v128".parse::<ValType>().is_err());
    }

    #[test]
    fn test_value_default_and_type() {
        assert_eq!(Value::default_for(ValType::I64), Value::I64(0));
        assert_eq!(Value::F32(1.5).ty(), ValType::F32);
        assert_eq!(Value::I32(7).as_i32(), Some(7));
        assert_eq!(Value::I32(7).as_i64(), None);
    }

    #[test]
    fn test_value_bits_eq_nan() {
        let nan = Value::F64(f64::NAN);
        assert_ne!(nan, nan);
        assert!(nan.bits_eq(&nan));
        assert!(!Value::F32(0.0).bits_eq(&Value::F32(-0.0)));
    }

    #[test]
    fn test_value_serde() {
        let json = serde_json::to_string(&Value::I32(42)).unwrap();
        assert_eq!(json, r#"{"type":"i32","value":42}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::I32(42));
    }

    #[test]
    fn test_functype_display_and_accepts() {
        let sig = FuncType::new([ValType::I32, ValType::I32], [ValType::I32]);
        assert_eq!(sig.to_string(), "(i32, i32) -> (i32)");
        assert!(sig.accepts(&[Value::I32(1), Value::I32(2)]));
        assert!(!sig.accepts(&[Value::I32(1)]));
        assert!(!sig.accepts(&[Value::I32(1), Value::I64(2)]));
    }
}
