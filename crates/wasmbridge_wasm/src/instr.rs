//! Instruction set and function-body decoding.
//!
//! Bodies are decoded once into a flat `Vec<Instr>`. Structured control
//! instructions carry the index of their matching `else`/`end`, patched in
//! while decoding, so the interpreter never scans for a branch target.

use crate::load::{LoadConfig, LoadError, WasmFeature};
use crate::reader::Reader;
use wasmbridge_core::ValType;

/// Upper bound on declared locals per function
pub const MAX_LOCALS: u32 = 50_000;

/// Type of a structured block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// `[] -> []`
    Empty,
    /// `[] -> [t]`
    Value(ValType),
    /// Signature at a type index (multi-value)
    Func(u32),
}

/// Static offset and alignment hint of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    /// log2 of the alignment hint
    pub align: u32,
    /// Constant added to the dynamic address
    pub offset: u32,
}

/// Memory load variants (opcodes 0x28..=0x35)
///
/// Variants are named after their text-format mnemonics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    I32Load,
    I64Load,
    F32Load,
    F64Load,
    I32Load8S,
    I32Load8U,
    I32Load16S,
    I32Load16U,
    I64Load8S,
    I64Load8U,
    I64Load16S,
    I64Load16U,
    I64Load32S,
    I64Load32U,
}

impl LoadOp {
    const ALL: [LoadOp; 14] = [
        Self::I32Load,
        Self::I64Load,
        Self::F32Load,
        Self::F64Load,
        Self::I32Load8S,
        Self::I32Load8U,
        Self::I32Load16S,
        Self::I32Load16U,
        Self::I64Load8S,
        Self::I64Load8U,
        Self::I64Load16S,
        Self::I64Load16U,
        Self::I64Load32S,
        Self::I64Load32U,
    ];

    /// Bytes read from memory
    #[must_use]
    pub const fn width(self) -> u32 {
        match self {
            Self::I32Load8S | Self::I32Load8U | Self::I64Load8S | Self::I64Load8U => 1,
            Self::I32Load16S | Self::I32Load16U | Self::I64Load16S | Self::I64Load16U => 2,
            Self::I32Load | Self::F32Load | Self::I64Load32S | Self::I64Load32U => 4,
            Self::I64Load | Self::F64Load => 8,
        }
    }

    /// Type pushed on the operand stack
    #[must_use]
    pub const fn result(self) -> ValType {
        match self {
            Self::I32Load
            | Self::I32Load8S
            | Self::I32Load8U
            | Self::I32Load16S
            | Self::I32Load16U => ValType::I32,
            Self::F32Load => ValType::F32,
            Self::F64Load => ValType::F64,
            _ => ValType::I64,
        }
    }
}

/// Memory store variants (opcodes 0x36..=0x3E)
///
/// Variants are named after their text-format mnemonics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    I32Store,
    I64Store,
    F32Store,
    F64Store,
    I32Store8,
    I32Store16,
    I64Store8,
    I64Store16,
    I64Store32,
}

impl StoreOp {
    const ALL: [StoreOp; 9] = [
        Self::I32Store,
        Self::I64Store,
        Self::F32Store,
        Self::F64Store,
        Self::I32Store8,
        Self::I32Store16,
        Self::I64Store8,
        Self::I64Store16,
        Self::I64Store32,
    ];

    /// Bytes written to memory
    #[must_use]
    pub const fn width(self) -> u32 {
        match self {
            Self::I32Store8 | Self::I64Store8 => 1,
            Self::I32Store16 | Self::I64Store16 => 2,
            Self::I32Store | Self::F32Store | Self::I64Store32 => 4,
            Self::I64Store | Self::F64Store => 8,
        }
    }

    /// Type popped from the operand stack
    #[must_use]
    pub const fn operand(self) -> ValType {
        match self {
            Self::I32Store | Self::I32Store8 | Self::I32Store16 => ValType::I32,
            Self::F32Store => ValType::F32,
            Self::F64Store => ValType::F64,
            _ => ValType::I64,
        }
    }
}

/// Integer operations, shared by i32 and i64
///
/// Variants are named after their text-format mnemonics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Eqz,
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
    Clz,
    Ctz,
    Popcnt,
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
    Extend8S,
    Extend16S,
    Extend32S,
}

/// Float operations, shared by f32 and f64
///
/// Variants are named after their text-format mnemonics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Abs,
    Neg,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Copysign,
}

/// Conversions between number types
///
/// Variants are named after their text-format mnemonics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvOp {
    I32WrapI64,
    I32TruncF32S,
    I32TruncF32U,
    I32TruncF64S,
    I32TruncF64U,
    I64ExtendI32S,
    I64ExtendI32U,
    I64TruncF32S,
    I64TruncF32U,
    I64TruncF64S,
    I64TruncF64U,
    F32ConvertI32S,
    F32ConvertI32U,
    F32ConvertI64S,
    F32ConvertI64U,
    F32DemoteF64,
    F64ConvertI32S,
    F64ConvertI32U,
    F64ConvertI64S,
    F64ConvertI64U,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,
}

impl ConvOp {
    /// Opcodes 0xA7..=0xBF in order
    const MVP: [ConvOp; 25] = [
        Self::I32WrapI64,
        Self::I32TruncF32S,
        Self::I32TruncF32U,
        Self::I32TruncF64S,
        Self::I32TruncF64U,
        Self::I64ExtendI32S,
        Self::I64ExtendI32U,
        Self::I64TruncF32S,
        Self::I64TruncF32U,
        Self::I64TruncF64S,
        Self::I64TruncF64U,
        Self::F32ConvertI32S,
        Self::F32ConvertI32U,
        Self::F32ConvertI64S,
        Self::F32ConvertI64U,
        Self::F32DemoteF64,
        Self::F64ConvertI32S,
        Self::F64ConvertI32U,
        Self::F64ConvertI64S,
        Self::F64ConvertI64U,
        Self::F64PromoteF32,
        Self::I32ReinterpretF32,
        Self::I64ReinterpretF64,
        Self::F32ReinterpretI32,
        Self::F64ReinterpretI64,
    ];

    /// `0xFC` sub-opcodes 0..=7 in order
    const SATURATING: [ConvOp; 8] = [
        Self::I32TruncSatF32S,
        Self::I32TruncSatF32U,
        Self::I32TruncSatF64S,
        Self::I32TruncSatF64U,
        Self::I64TruncSatF32S,
        Self::I64TruncSatF32U,
        Self::I64TruncSatF64S,
        Self::I64TruncSatF64U,
    ];

    /// Operand and result type
    #[must_use]
    pub const fn types(self) -> (ValType, ValType) {
        use ValType::{F32, F64, I32, I64};
        match self {
            Self::I32WrapI64 => (I64, I32),
            Self::I32TruncF32S | Self::I32TruncF32U => (F32, I32),
            Self::I32TruncF64S | Self::I32TruncF64U => (F64, I32),
            Self::I64ExtendI32S | Self::I64ExtendI32U => (I32, I64),
            Self::I64TruncF32S | Self::I64TruncF32U => (F32, I64),
            Self::I64TruncF64S | Self::I64TruncF64U => (F64, I64),
            Self::F32ConvertI32S | Self::F32ConvertI32U => (I32, F32),
            Self::F32ConvertI64S | Self::F32ConvertI64U => (I64, F32),
            Self::F32DemoteF64 => (F64, F32),
            Self::F64ConvertI32S | Self::F64ConvertI32U => (I32, F64),
            Self::F64ConvertI64S | Self::F64ConvertI64U => (I64, F64),
            Self::F64PromoteF32 => (F32, F64),
            Self::I32ReinterpretF32 => (F32, I32),
            Self::I64ReinterpretF64 => (F64, I64),
            Self::F32ReinterpretI32 => (I32, F32),
            Self::F64ReinterpretI64 => (I64, F64),
            Self::I32TruncSatF32S | Self::I32TruncSatF32U => (F32, I32),
            Self::I32TruncSatF64S | Self::I32TruncSatF64U => (F64, I32),
            Self::I64TruncSatF32S | Self::I64TruncSatF32U => (F32, I64),
            Self::I64TruncSatF64S | Self::I64TruncSatF64U => (F64, I64),
        }
    }
}

/// A numeric instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumOp {
    /// i32 operation
    I32(IntOp),
    /// i64 operation
    I64(IntOp),
    /// f32 operation
    F32(FloatOp),
    /// f64 operation
    F64(FloatOp),
    /// Conversion
    Conv(ConvOp),
}

/// Operand type, operand count and result type of a numeric instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumSignature {
    /// Type of every operand
    pub operand: ValType,
    /// Number of operands (1 or 2)
    pub arity: usize,
    /// Result type
    pub result: ValType,
}

impl NumOp {
    /// Typing rule of this instruction
    #[must_use]
    pub const fn signature(self) -> NumSignature {
        let (ty, op) = match self {
            Self::I32(op) => (ValType::I32, Ok(op)),
            Self::I64(op) => (ValType::I64, Ok(op)),
            Self::F32(op) => (ValType::F32, Err(op)),
            Self::F64(op) => (ValType::F64, Err(op)),
            Self::Conv(op) => {
                let (operand, result) = op.types();
                return NumSignature {
                    operand,
                    arity: 1,
                    result,
                };
            }
        };
        let (arity, result) = match op {
            Ok(IntOp::Eqz) => (1, ValType::I32),
            Ok(
                IntOp::Eq
                | IntOp::Ne
                | IntOp::LtS
                | IntOp::LtU
                | IntOp::GtS
                | IntOp::GtU
                | IntOp::LeS
                | IntOp::LeU
                | IntOp::GeS
                | IntOp::GeU,
            ) => (2, ValType::I32),
            Ok(IntOp::Clz | IntOp::Ctz | IntOp::Popcnt)
            | Ok(IntOp::Extend8S | IntOp::Extend16S | IntOp::Extend32S) => (1, ty),
            Ok(_) => (2, ty),
            Err(
                FloatOp::Eq | FloatOp::Ne | FloatOp::Lt | FloatOp::Gt | FloatOp::Le | FloatOp::Ge,
            ) => (2, ValType::I32),
            Err(
                FloatOp::Abs
                | FloatOp::Neg
                | FloatOp::Ceil
                | FloatOp::Floor
                | FloatOp::Trunc
                | FloatOp::Nearest
                | FloatOp::Sqrt,
            ) => (1, ty),
            Err(_) => (2, ty),
        };
        NumSignature {
            operand: ty,
            arity,
            result,
        }
    }

    /// Extension a module must be allowed to use this instruction
    #[must_use]
    pub const fn feature(self) -> Option<WasmFeature> {
        match self {
            Self::I32(IntOp::Extend8S | IntOp::Extend16S)
            | Self::I64(IntOp::Extend8S | IntOp::Extend16S | IntOp::Extend32S) => {
                Some(WasmFeature::SignExtension)
            }
            Self::Conv(
                ConvOp::I32TruncSatF32S
                | ConvOp::I32TruncSatF32U
                | ConvOp::I32TruncSatF64S
                | ConvOp::I32TruncSatF64U
                | ConvOp::I64TruncSatF32S
                | ConvOp::I64TruncSatF32U
                | ConvOp::I64TruncSatF64S
                | ConvOp::I64TruncSatF64U,
            ) => Some(WasmFeature::SaturatingFloatToInt),
            _ => None,
        }
    }

    /// Decode a single-byte numeric opcode (0x45..=0xC4)
    #[must_use]
    pub fn from_opcode(op: u8) -> Option<Self> {
        const INT_CMP: [IntOp; 10] = [
            IntOp::Eq,
            IntOp::Ne,
            IntOp::LtS,
            IntOp::LtU,
            IntOp::GtS,
            IntOp::GtU,
            IntOp::LeS,
            IntOp::LeU,
            IntOp::GeS,
            IntOp::GeU,
        ];
        const INT_ARITH: [IntOp; 18] = [
            IntOp::Clz,
            IntOp::Ctz,
            IntOp::Popcnt,
            IntOp::Add,
            IntOp::Sub,
            IntOp::Mul,
            IntOp::DivS,
            IntOp::DivU,
            IntOp::RemS,
            IntOp::RemU,
            IntOp::And,
            IntOp::Or,
            IntOp::Xor,
            IntOp::Shl,
            IntOp::ShrS,
            IntOp::ShrU,
            IntOp::Rotl,
            IntOp::Rotr,
        ];
        const FLOAT_CMP: [FloatOp; 6] = [
            FloatOp::Eq,
            FloatOp::Ne,
            FloatOp::Lt,
            FloatOp::Gt,
            FloatOp::Le,
            FloatOp::Ge,
        ];
        const FLOAT_ARITH: [FloatOp; 14] = [
            FloatOp::Abs,
            FloatOp::Neg,
            FloatOp::Ceil,
            FloatOp::Floor,
            FloatOp::Trunc,
            FloatOp::Nearest,
            FloatOp::Sqrt,
            FloatOp::Add,
            FloatOp::Sub,
            FloatOp::Mul,
            FloatOp::Div,
            FloatOp::Min,
            FloatOp::Max,
            FloatOp::Copysign,
        ];

        let at = |base: u8| usize::from(op - base);
        Some(match op {
            0x45 => Self::I32(IntOp::Eqz),
            0x46..=0x4F => Self::I32(INT_CMP[at(0x46)]),
            0x50 => Self::I64(IntOp::Eqz),
            0x51..=0x5A => Self::I64(INT_CMP[at(0x51)]),
            0x5B..=0x60 => Self::F32(FLOAT_CMP[at(0x5B)]),
            0x61..=0x66 => Self::F64(FLOAT_CMP[at(0x61)]),
            0x67..=0x78 => Self::I32(INT_ARITH[at(0x67)]),
            0x79..=0x8A => Self::I64(INT_ARITH[at(0x79)]),
            0x8B..=0x98 => Self::F32(FLOAT_ARITH[at(0x8B)]),
            0x99..=0xA6 => Self::F64(FLOAT_ARITH[at(0x99)]),
            0xA7..=0xBF => Self::Conv(ConvOp::MVP[at(0xA7)]),
            0xC0 => Self::I32(IntOp::Extend8S),
            0xC1 => Self::I32(IntOp::Extend16S),
            0xC2 => Self::I64(IntOp::Extend8S),
            0xC3 => Self::I64(IntOp::Extend16S),
            0xC4 => Self::I64(IntOp::Extend32S),
            _ => return None,
        })
    }
}

/// A decoded instruction
///
/// Variants are named after their text-format mnemonics.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Unreachable,
    Nop,
    /// `end` is the index of the matching `End`
    Block {
        /// Block signature
        ty: BlockType,
        /// Index of the matching `end`
        end: u32,
    },
    Loop {
        /// Block signature
        ty: BlockType,
    },
    /// `else_at` is the index of the matching `Else`, if any
    If {
        /// Block signature
        ty: BlockType,
        /// Index of the `else`, if any
        else_at: Option<u32>,
        /// Index of the matching `end`
        end: u32,
    },
    /// Reached only by falling out of the `then` arm
    Else {
        /// Index of the matching `end`
        end: u32,
    },
    End,
    Br(u32),
    BrIf(u32),
    BrTable {
        /// Label depths indexed by operand
        targets: Box<[u32]>,
        /// Depth taken when the operand is out of range
        default: u32,
    },
    Return,
    Call(u32),
    CallIndirect(u32),
    Drop,
    /// Operand type annotation of the typed form
    Select(Option<ValType>),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load(LoadOp, MemArg),
    Store(StoreOp, MemArg),
    MemorySize,
    MemoryGrow,
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    Num(NumOp),
}

/// A decoded function body
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    /// Declared locals, excluding parameters
    pub locals: Vec<ValType>,
    /// Flat instruction sequence ending in `End`
    pub code: Vec<Instr>,
    /// Absolute byte offset of each instruction, for diagnostics
    pub offsets: Vec<u32>,
}

/// Constant initializer of a global or segment offset
///
/// Variants are named after their text-format mnemonics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Value of an imported immutable global
    GlobalGet(u32),
}

impl ConstExpr {
    /// Decode `instr end`
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for anything but a single constant instruction
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, LoadError> {
        let expr = match r.read_u8()? {
            0x41 => Self::I32(r.read_i32()?),
            0x42 => Self::I64(r.read_i64()?),
            0x43 => Self::F32(r.read_f32()?),
            0x44 => Self::F64(r.read_f64()?),
            0x23 => Self::GlobalGet(r.read_u32()?),
            other => {
                return Err(r.malformed(format!(
                    "constant expression required, found opcode 0x{:02X}",
                    other
                )));
            }
        };
        if r.read_u8()? != 0x0B {
            return Err(r.malformed("constant expression must end after one instruction"));
        }
        Ok(expr)
    }
}

#[derive(Debug)]
struct OpenBlock {
    at: usize,
    else_at: Option<usize>,
}

fn decode_block_type(r: &mut Reader<'_>) -> Result<BlockType, LoadError> {
    match r.peek_u8() {
        Some(0x40) => {
            r.read_u8()?;
            Ok(BlockType::Empty)
        }
        Some(byte) if ValType::from_byte(byte).is_some() => {
            r.read_u8()?;
            Ok(ValType::from_byte(byte).map_or(BlockType::Empty, BlockType::Value))
        }
        _ => {
            let idx = r.read_s33()?;
            u32::try_from(idx)
                .map(BlockType::Func)
                .map_err(|_| r.malformed(format!("invalid block type {}", idx)))
        }
    }
}

fn decode_memarg(r: &mut Reader<'_>) -> Result<MemArg, LoadError> {
    let align = r.read_u32()?;
    let offset = r.read_u32()?;
    Ok(MemArg { align, offset })
}

fn require(
    config: &LoadConfig,
    feature: WasmFeature,
    offset: usize,
) -> Result<(), LoadError> {
    if config.is_feature_allowed(&feature) {
        Ok(())
    } else {
        Err(LoadError::Unsupported {
            offset,
            feature: feature.to_string(),
        })
    }
}

fn unsupported(offset: usize, feature: &str) -> LoadError {
    LoadError::Unsupported {
        offset,
        feature: feature.to_string(),
    }
}

/// Decode the locals and instructions of one code-section entry
///
/// # Errors
///
/// Returns `Malformed` on bad encodings or unbalanced structure and
/// `Unsupported` for instructions of disabled or unknown extensions
pub fn decode_body(r: &mut Reader<'_>, config: &LoadConfig) -> Result<FunctionBody, LoadError> {
    let mut locals = Vec::new();
    let mut total: u32 = 0;
    let groups = r.read_count()?;
    for _ in 0..groups {
        let count = r.read_u32()?;
        total = total
            .checked_add(count)
            .filter(|t| *t <= MAX_LOCALS)
            .ok_or_else(|| r.malformed("too many locals"))?;
        let byte = r.read_u8()?;
        let ty = ValType::from_byte(byte)
            .ok_or_else(|| r.malformed(format!("invalid local type 0x{:02X}", byte)))?;
        locals.extend(std::iter::repeat_n(ty, count as usize));
    }

    let mut code = Vec::new();
    let mut offsets = Vec::new();
    let mut open: Vec<OpenBlock> = Vec::new();

    loop {
        if r.is_empty() {
            return Err(r.malformed("unexpected end of function body"));
        }
        let start = r.offset();
        let idx = code.len();
        let opcode = r.read_u8()?;
        let instr = match opcode {
            0x00 => Instr::Unreachable,
            0x01 => Instr::Nop,
            0x02 => {
                open.push(OpenBlock { at: idx, else_at: None });
                Instr::Block {
                    ty: decode_block_type(r)?,
                    end: 0,
                }
            }
            0x03 => {
                open.push(OpenBlock { at: idx, else_at: None });
                Instr::Loop {
                    ty: decode_block_type(r)?,
                }
            }
            0x04 => {
                open.push(OpenBlock { at: idx, else_at: None });
                Instr::If {
                    ty: decode_block_type(r)?,
                    else_at: None,
                    end: 0,
                }
            }
            0x05 => {
                let top = open
                    .last_mut()
                    .filter(|b| b.else_at.is_none() && matches!(code[b.at], Instr::If { .. }))
                    .ok_or_else(|| LoadError::Malformed {
                        offset: start,
                        reason: "else without matching if".to_string(),
                    })?;
                top.else_at = Some(idx);
                Instr::Else { end: 0 }
            }
            0x0B => {
                match open.pop() {
                    Some(block) => patch_end(&mut code, &block, idx),
                    None => {
                        code.push(Instr::End);
                        offsets.push(start as u32);
                        if !r.is_empty() {
                            return Err(r.malformed("operators after final end"));
                        }
                        return Ok(FunctionBody {
                            locals,
                            code,
                            offsets,
                        });
                    }
                }
                Instr::End
            }
            0x0C => Instr::Br(r.read_u32()?),
            0x0D => Instr::BrIf(r.read_u32()?),
            0x0E => {
                let count = r.read_count()?;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(r.read_u32()?);
                }
                Instr::BrTable {
                    targets: targets.into_boxed_slice(),
                    default: r.read_u32()?,
                }
            }
            0x0F => Instr::Return,
            0x10 => Instr::Call(r.read_u32()?),
            0x11 => {
                let ty = r.read_u32()?;
                if r.read_u8()? != 0x00 {
                    return Err(unsupported(start, "multiple tables"));
                }
                Instr::CallIndirect(ty)
            }
            0x12 | 0x13 => return Err(unsupported(start, "tail calls")),
            0x1A => Instr::Drop,
            0x1B => Instr::Select(None),
            0x1C => {
                if r.read_u32()? != 1 {
                    return Err(r.malformed("typed select must name one type"));
                }
                let byte = r.read_u8()?;
                match ValType::from_byte(byte) {
                    Some(ty) => Instr::Select(Some(ty)),
                    None => return Err(unsupported(start, "reference types")),
                }
            }
            0x20 => Instr::LocalGet(r.read_u32()?),
            0x21 => Instr::LocalSet(r.read_u32()?),
            0x22 => Instr::LocalTee(r.read_u32()?),
            0x23 => Instr::GlobalGet(r.read_u32()?),
            0x24 => Instr::GlobalSet(r.read_u32()?),
            0x25 | 0x26 | 0xD0..=0xD2 => return Err(unsupported(start, "reference types")),
            0x28..=0x35 => Instr::Load(LoadOp::ALL[usize::from(opcode - 0x28)], decode_memarg(r)?),
            0x36..=0x3E => {
                Instr::Store(StoreOp::ALL[usize::from(opcode - 0x36)], decode_memarg(r)?)
            }
            0x3F | 0x40 => {
                if r.read_u8()? != 0x00 {
                    return Err(unsupported(start, "multiple memories"));
                }
                if opcode == 0x3F {
                    Instr::MemorySize
                } else {
                    Instr::MemoryGrow
                }
            }
            0x41 => Instr::I32Const(r.read_i32()?),
            0x42 => Instr::I64Const(r.read_i64()?),
            0x43 => Instr::F32Const(r.read_f32()?),
            0x44 => Instr::F64Const(r.read_f64()?),
            0x45..=0xC4 => {
                let op = NumOp::from_opcode(opcode).ok_or_else(|| LoadError::Malformed {
                    offset: start,
                    reason: format!("unknown opcode 0x{:02X}", opcode),
                })?;
                if let Some(feature) = op.feature() {
                    require(config, feature, start)?;
                }
                Instr::Num(op)
            }
            0xFC => {
                let sub = r.read_u32()?;
                match sub {
                    0..=7 => {
                        require(config, WasmFeature::SaturatingFloatToInt, start)?;
                        Instr::Num(NumOp::Conv(ConvOp::SATURATING[sub as usize]))
                    }
                    8..=17 => return Err(unsupported(start, "bulk memory")),
                    _ => {
                        return Err(LoadError::Malformed {
                            offset: start,
                            reason: format!("unknown opcode 0xFC {}", sub),
                        });
                    }
                }
            }
            0xFD => return Err(unsupported(start, "simd")),
            0xFE => return Err(unsupported(start, "threads")),
            other => {
                return Err(LoadError::Malformed {
                    offset: start,
                    reason: format!("unknown opcode 0x{:02X}", other),
                });
            }
        };
        code.push(instr);
        offsets.push(start as u32);
    }
}

fn patch_end(code: &mut [Instr], block: &OpenBlock, end_idx: usize) {
    let end_idx = end_idx as u32;
    match &mut code[block.at] {
        Instr::Block { end, .. } => *end = end_idx,
        Instr::If { else_at, end, .. } => {
            *end = end_idx;
            *else_at = block.else_at.map(|e| e as u32);
        }
        _ => {}
    }
    if let Some(at) = block.else_at {
        if let Instr::Else { end } = &mut code[at] {
            *end = end_idx;
        }
    }
}
