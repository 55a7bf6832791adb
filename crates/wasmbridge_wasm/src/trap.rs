//! Execution-time faults.

use serde::{Deserialize, Serialize};

/// Why an invocation was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TrapKind {
    /// `unreachable` executed
    #[error("unreachable executed")]
    Unreachable,

    /// Integer division or remainder by zero
    #[error("integer divide by zero")]
    DivideByZero,

    /// Signed `MIN / -1`, or a float truncation out of the target range
    #[error("integer overflow")]
    IntegerOverflow,

    /// NaN truncated to an integer
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,

    /// Load or store past the end of linear memory
    #[error("out of bounds memory access")]
    OutOfBoundsMemory,

    /// Call depth or operand stack limit reached
    #[error("call stack exhausted")]
    CallStackExhausted,

    /// No function export with this name
    #[error("undefined export {0:?}")]
    UndefinedExport(String),

    /// `call_indirect` index past the end of the table
    #[error("undefined element")]
    UndefinedElement,

    /// `call_indirect` through a null table slot
    #[error("uninitialized element")]
    UninitializedElement,

    /// `call_indirect` callee signature differs from the expected type
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,

    /// Fuel budget spent
    #[error("all fuel consumed")]
    OutOfFuel,

    /// Cancellation token fired
    #[error("execution cancelled")]
    Cancelled,

    /// A host function reported an error or broke its signature
    #[error("host function failed: {0}")]
    Host(String),

    /// Operand stack did not match what validation guaranteed
    #[error("operand stack corrupted")]
    OperandMismatch,
}

/// A trap with the location it was raised at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("trap: {kind}{}", location(.func_index, .offset))]
pub struct Trap {
    /// What went wrong
    pub kind: TrapKind,
    /// Function executing when the trap was raised
    pub func_index: Option<u32>,
    /// Module byte offset of the trapping instruction
    pub offset: Option<u32>,
}

fn location(func_index: &Option<u32>, offset: &Option<u32>) -> String {
    match (func_index, offset) {
        (Some(func), Some(offset)) => format!(" in function {} at offset {}", func, offset),
        (Some(func), None) => format!(" in function {}", func),
        _ => String::new(),
    }
}

impl Trap {
    /// A trap with no location
    #[must_use]
    pub fn new(kind: TrapKind) -> Self {
        Self {
            kind,
            func_index: None,
            offset: None,
        }
    }

    /// A trap raised at an instruction
    #[must_use]
    pub fn at(kind: TrapKind, func_index: u32, offset: u32) -> Self {
        Self {
            kind,
            func_index: Some(func_index),
            offset: Some(offset),
        }
    }
}

impl From<TrapKind> for Trap {
    fn from(kind: TrapKind) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_display() {
        let trap = Trap::at(TrapKind::DivideByZero, 2, 57);
        assert_eq!(
            trap.to_string(),
            "trap: integer divide by zero in function 2 at offset 57"
        );
        assert_eq!(Trap::new(TrapKind::Cancelled).to_string(), "trap: execution cancelled");
    }

    #[test]
    fn test_trap_kind_serde() {
        let json = serde_json::to_string(&TrapKind::Host("boom".to_string())).unwrap();
        assert_eq!(json, r#"{"Host":"boom"}"#);
        let back: TrapKind = serde_json::from_str(r#""OutOfFuel""#).unwrap();
        assert_eq!(back, TrapKind::OutOfFuel);
    }
}
