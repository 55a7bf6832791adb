//! Structural declarations carried by a parsed module.

use crate::instr::ConstExpr;
use serde::{Deserialize, Serialize};
use std::fmt;
use wasmbridge_core::{FuncType, ValType};

/// Maximum number of 64 KiB pages a 32-bit memory can hold
pub const MAX_PAGES: u32 = 65536;

/// Size of one memory page in bytes
pub const PAGE_SIZE: usize = 65536;

/// Initial and optional maximum size of a memory or table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Initial size
    pub min: u32,
    /// Maximum size, if declared
    pub max: Option<u32>,
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "{}..{}", self.min, max),
            None => write!(f, "{}..", self.min),
        }
    }
}

/// Declared linear memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryType {
    /// Page limits
    pub limits: Limits,
}

/// Declared function table (always `funcref` in the supported subset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableType {
    /// Element limits
    pub limits: Limits,
}

/// Type and mutability of a global
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalType {
    /// Value type
    pub ty: ValType,
    /// Whether `global.set` is permitted
    pub mutable: bool,
}

impl fmt::Display for GlobalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mutable {
            write!(f, "mut {}", self.ty)
        } else {
            write!(f, "{}", self.ty)
        }
    }
}

/// What an import expects to receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportDesc {
    /// Function with the signature at this type index
    Func(u32),
    /// Table
    Table(TableType),
    /// Memory
    Memory(MemoryType),
    /// Global
    Global(GlobalType),
}

impl ImportDesc {
    /// Short kind name for diagnostics
    #[must_use]
    pub const fn kind(&self) -> ExternKind {
        match self {
            Self::Func(_) => ExternKind::Func,
            Self::Table(_) => ExternKind::Table,
            Self::Memory(_) => ExternKind::Memory,
            Self::Global(_) => ExternKind::Global,
        }
    }
}

/// A declared import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Module namespace, e.g. `env`
    pub module: String,
    /// Field name within the namespace
    pub field: String,
    /// Expected kind and type
    pub desc: ImportDesc,
}

/// Kind of an import or export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternKind {
    /// Function
    Func,
    /// Table
    Table,
    /// Memory
    Memory,
    /// Global
    Global,
}

impl ExternKind {
    /// Decode from the binary kind byte
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Func),
            0x01 => Some(Self::Table),
            0x02 => Some(Self::Memory),
            0x03 => Some(Self::Global),
            _ => None,
        }
    }
}

impl fmt::Display for ExternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Func => "func",
            Self::Table => "table",
            Self::Memory => "memory",
            Self::Global => "global",
        })
    }
}

/// A declared export: name → index in the kind's index space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    /// Export name (case-sensitive)
    pub name: String,
    /// Kind of the exported item
    pub kind: ExternKind,
    /// Index in the kind's index space
    pub index: u32,
}

/// A module-defined global
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    /// Declared type
    pub ty: GlobalType,
    /// Initializer
    pub init: ConstExpr,
}

/// Active element segment writing function indices into table 0
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSegment {
    /// Start offset in the table
    pub offset: ConstExpr,
    /// Function indices, `None` for a null reference
    pub items: Vec<Option<u32>>,
}

/// Active data segment copied into memory 0
#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    /// Start offset in memory
    pub offset: ConstExpr,
    /// Bytes to copy
    pub bytes: Vec<u8>,
}

/// Signature view used by diagnostics and the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSignature {
    /// Export name
    pub name: String,
    /// Export kind
    pub kind: ExternKind,
    /// Function signature when the export is a function
    pub signature: Option<FuncType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_display() {
        assert_eq!(Limits { min: 1, max: Some(4) }.to_string(), "1..4");
        assert_eq!(Limits { min: 2, max: None }.to_string(), "2..");
    }

    #[test]
    fn test_extern_kind_from_byte() {
        assert_eq!(ExternKind::from_byte(0), Some(ExternKind::Func));
        assert_eq!(ExternKind::from_byte(3), Some(ExternKind::Global));
        assert_eq!(ExternKind::from_byte(4), None);
    }

    #[test]
    fn test_global_type_display() {
        let g = GlobalType {
            ty: ValType::I64,
            mutable: true,
        };
        assert_eq!(g.to_string(), "mut i64");
    }
}
