//! Module loading: binary decoding, structural checks and validation.

use crate::instr::{ConstExpr, FunctionBody, decode_body};
use crate::reader::Reader;
use crate::types::{
    DataSegment, ElementSegment, Export, ExportSignature, ExternKind, Global, GlobalType, Import,
    ImportDesc, Limits, MAX_PAGES, MemoryType, TableType,
};
use crate::validate::{self, ModuleContext};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use wasmbridge_core::{FuncType, Hash, ValType};

const MAGIC: &[u8; 4] = b"\0asm";
const VERSION: &[u8; 4] = b"\x01\x00\x00\x00";

/// Extensions beyond the MVP a module may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WasmFeature {
    /// Multiple results and block parameters
    MultiValue,
    /// `i32.extend8_s` and friends
    SignExtension,
    /// `trunc_sat` conversions
    SaturatingFloatToInt,
}

impl WasmFeature {
    /// Every recognised extension
    pub const ALL: [WasmFeature; 3] = [
        Self::MultiValue,
        Self::SignExtension,
        Self::SaturatingFloatToInt,
    ];
}

impl fmt::Display for WasmFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MultiValue => "multi-value",
            Self::SignExtension => "sign-extension",
            Self::SaturatingFloatToInt => "saturating float-to-int",
        })
    }
}

/// Load errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// Bad magic number or version
    #[error("Invalid WASM binary: {reason}")]
    Format {
        /// What was wrong
        reason: String,
    },

    /// Undecodable bytes
    #[error("Malformed module at offset {offset}: {reason}")]
    Malformed {
        /// Byte offset of the fault
        offset: usize,
        /// What was wrong
        reason: String,
    },

    /// Well-formed but ill-typed or referencing something undeclared
    #[error("Validation failed{}: {reason}", location(.func_index, .offset))]
    Validation {
        /// Function that failed, if any
        func_index: Option<u32>,
        /// Byte offset of the instruction
        offset: usize,
        /// What was wrong
        reason: String,
    },

    /// Extension that is disabled or not implemented
    #[error("Unsupported feature at offset {offset}: {feature}")]
    Unsupported {
        /// Byte offset of the construct
        offset: usize,
        /// Extension that is disabled or unknown
        feature: String,
    },

    /// Module too large
    #[error("Module size {size} exceeds limit {limit}")]
    SizeLimitExceeded {
        /// Binary size in bytes
        size: usize,
        /// Configured limit in bytes
        limit: usize,
    },
}

fn location(func_index: &Option<u32>, offset: &usize) -> String {
    match func_index {
        Some(idx) => format!(" in function {} at offset {}", idx, offset),
        None => format!(" at offset {}", offset),
    }
}

fn invalid(offset: usize, reason: impl Into<String>) -> LoadError {
    LoadError::Validation {
        func_index: None,
        offset,
        reason: reason.into(),
    }
}

/// Loader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Largest accepted binary in bytes
    pub max_module_size: usize,
    /// Allowed extensions
    pub allowed_features: HashSet<WasmFeature>,
}

impl LoadConfig {
    /// Create a config with every extension enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_module_size: 10 * 1024 * 1024,
            allowed_features: HashSet::from(WasmFeature::ALL),
        }
    }

    /// MVP only
    #[must_use]
    pub fn mvp() -> Self {
        Self {
            allowed_features: HashSet::new(),
            ..Self::new()
        }
    }

    /// Set the module size limit
    #[must_use]
    pub fn with_max_module_size(mut self, limit: usize) -> Self {
        self.max_module_size = limit;
        self
    }

    /// Add an allowed feature
    #[must_use]
    pub fn with_feature(mut self, feature: WasmFeature) -> Self {
        self.allowed_features.insert(feature);
        self
    }

    /// Remove an allowed feature
    #[must_use]
    pub fn without_feature(mut self, feature: &WasmFeature) -> Self {
        self.allowed_features.remove(feature);
        self
    }

    /// Check if a feature is allowed
    #[must_use]
    pub fn is_feature_allowed(&self, feature: &WasmFeature) -> bool {
        self.allowed_features.contains(feature)
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated, immutable module
///
/// Function and global index spaces place imports first, followed by the
/// module's own definitions.
#[derive(Debug, Clone)]
pub struct Module {
    pub(crate) types: Vec<FuncType>,
    pub(crate) imports: Vec<Import>,
    /// Type index of every function in the index space
    pub(crate) func_types: Vec<u32>,
    pub(crate) num_imported_funcs: u32,
    /// Type of every global in the index space
    pub(crate) global_types: Vec<GlobalType>,
    pub(crate) num_imported_globals: u32,
    pub(crate) globals: Vec<Global>,
    pub(crate) table: Option<TableType>,
    pub(crate) memory: Option<MemoryType>,
    pub(crate) exports: IndexMap<String, Export>,
    pub(crate) start: Option<u32>,
    pub(crate) elements: Vec<ElementSegment>,
    pub(crate) data: Vec<DataSegment>,
    pub(crate) bodies: Vec<FunctionBody>,
    hash: Hash,
    size: usize,
}

impl Module {
    /// Decode and validate a binary
    ///
    /// # Errors
    ///
    /// Returns the first format, decoding or validation failure
    pub fn from_bytes(bytes: &[u8], config: &LoadConfig) -> Result<Self, LoadError> {
        if bytes.len() > config.max_module_size {
            return Err(LoadError::SizeLimitExceeded {
                size: bytes.len(),
                limit: config.max_module_size,
            });
        }
        if bytes.len() < 4 || &bytes[0..4] != MAGIC {
            return Err(LoadError::Format {
                reason: "magic header not detected".to_string(),
            });
        }
        if bytes.len() < 8 || &bytes[4..8] != VERSION {
            return Err(LoadError::Format {
                reason: format!("unknown binary version {:02X?}", &bytes[4..bytes.len().min(8)]),
            });
        }

        let mut parser = Parser::new(config, Hash::compute(bytes), bytes.len());
        let mut r = Reader::new(bytes);
        r.read_bytes(8)?;
        parser.parse_sections(&mut r)?;
        let module = parser.finish()?;

        tracing::debug!(
            hash = %module.hash.short(),
            size = module.size,
            functions = module.func_types.len(),
            exports = module.exports.len(),
            "loaded module"
        );
        Ok(module)
    }

    /// BLAKE3 hash of the source bytes
    #[must_use]
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Size of the source bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Declared imports in order
    #[must_use]
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// Declared exports in order
    pub fn exports(&self) -> impl Iterator<Item = &Export> {
        self.exports.values()
    }

    /// Look up an export by exact name
    #[must_use]
    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    /// Signature of a function in the index space
    #[must_use]
    pub fn func_type(&self, func_index: u32) -> Option<&FuncType> {
        let ty = *self.func_types.get(func_index as usize)?;
        self.types.get(ty as usize)
    }

    /// Signature at a type index
    #[must_use]
    pub fn signature(&self, type_index: u32) -> Option<&FuncType> {
        self.types.get(type_index as usize)
    }

    /// Declared memory, if any
    #[must_use]
    pub fn memory(&self) -> Option<&MemoryType> {
        self.memory.as_ref()
    }

    /// Declared table, if any
    #[must_use]
    pub fn table(&self) -> Option<&TableType> {
        self.table.as_ref()
    }

    /// Start function index, if any
    #[must_use]
    pub fn start(&self) -> Option<u32> {
        self.start
    }

    /// Number of functions including imports
    #[must_use]
    pub fn function_count(&self) -> usize {
        self.func_types.len()
    }

    /// Exports paired with their function signatures
    #[must_use]
    pub fn export_signatures(&self) -> Vec<ExportSignature> {
        self.exports
            .values()
            .map(|e| ExportSignature {
                name: e.name.clone(),
                kind: e.kind,
                signature: match e.kind {
                    ExternKind::Func => self.func_type(e.index).cloned(),
                    _ => None,
                },
            })
            .collect()
    }

    pub(crate) fn body(&self, func_index: u32) -> Option<&FunctionBody> {
        let defined = func_index.checked_sub(self.num_imported_funcs)?;
        self.bodies.get(defined as usize)
    }
}

/// Load and validate a binary with the default configuration
///
/// # Errors
///
/// Returns a `LoadError` if the bytes are not a valid module
pub fn load(bytes: &[u8]) -> Result<Arc<Module>, LoadError> {
    Module::from_bytes(bytes, &LoadConfig::default()).map(Arc::new)
}

/// Rank of each known section id in the mandated order
fn section_rank(id: u8) -> Option<u8> {
    match id {
        1..=9 => Some(id),
        12 => Some(10),
        10 => Some(11),
        11 => Some(12),
        _ => None,
    }
}

struct Parser<'c> {
    config: &'c LoadConfig,
    hash: Hash,
    size: usize,
    types: Vec<FuncType>,
    imports: Vec<Import>,
    func_types: Vec<u32>,
    num_imported_funcs: u32,
    global_types: Vec<GlobalType>,
    num_imported_globals: u32,
    globals: Vec<Global>,
    tables: Vec<TableType>,
    memories: Vec<MemoryType>,
    exports: IndexMap<String, Export>,
    start: Option<u32>,
    elements: Vec<ElementSegment>,
    data: Vec<DataSegment>,
    data_count: Option<u32>,
    bodies: Vec<FunctionBody>,
    code_offset: usize,
    seen_code: bool,
}

impl<'c> Parser<'c> {
    fn new(config: &'c LoadConfig, hash: Hash, size: usize) -> Self {
        Self {
            config,
            hash,
            size,
            types: Vec::new(),
            imports: Vec::new(),
            func_types: Vec::new(),
            num_imported_funcs: 0,
            global_types: Vec::new(),
            num_imported_globals: 0,
            globals: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            exports: IndexMap::new(),
            start: None,
            elements: Vec::new(),
            data: Vec::new(),
            data_count: None,
            bodies: Vec::new(),
            code_offset: 0,
            seen_code: false,
        }
    }

    fn parse_sections(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let mut last_rank = 0u8;
        while !r.is_empty() {
            let id_offset = r.offset();
            let id = r.read_u8()?;
            let len = r.read_u32()? as usize;
            let mut section = r.split(len)?;

            if id == 0 {
                section.read_name()?;
                continue;
            }
            let rank = section_rank(id).ok_or_else(|| LoadError::Malformed {
                offset: id_offset,
                reason: format!("malformed section id {}", id),
            })?;
            if rank <= last_rank {
                return Err(LoadError::Malformed {
                    offset: id_offset,
                    reason: format!("unexpected section id {}: duplicate or out of order", id),
                });
            }
            last_rank = rank;

            match id {
                1 => self.parse_types(&mut section)?,
                2 => self.parse_imports(&mut section)?,
                3 => self.parse_functions(&mut section)?,
                4 => self.parse_tables(&mut section)?,
                5 => self.parse_memories(&mut section)?,
                6 => self.parse_globals(&mut section)?,
                7 => self.parse_exports(&mut section)?,
                8 => self.parse_start(&mut section)?,
                9 => self.parse_elements(&mut section)?,
                12 => self.data_count = Some(section.read_u32()?),
                10 => self.parse_code(&mut section)?,
                11 => self.parse_data(&mut section)?,
                _ => {}
            }
            section.expect_end("section")?;
        }
        Ok(())
    }

    fn read_valtype(r: &mut Reader<'_>) -> Result<ValType, LoadError> {
        let offset = r.offset();
        let byte = r.read_u8()?;
        match byte {
            0x7B => Err(LoadError::Unsupported {
                offset,
                feature: "simd".to_string(),
            }),
            0x70 | 0x6F => Err(LoadError::Unsupported {
                offset,
                feature: "reference types".to_string(),
            }),
            _ => ValType::from_byte(byte).ok_or_else(|| LoadError::Malformed {
                offset,
                reason: format!("invalid value type 0x{:02X}", byte),
            }),
        }
    }

    fn read_limits(r: &mut Reader<'_>) -> Result<Limits, LoadError> {
        let offset = r.offset();
        match r.read_u8()? {
            0x00 => Ok(Limits {
                min: r.read_u32()?,
                max: None,
            }),
            0x01 => Ok(Limits {
                min: r.read_u32()?,
                max: Some(r.read_u32()?),
            }),
            0x02 | 0x03 => Err(LoadError::Unsupported {
                offset,
                feature: "threads".to_string(),
            }),
            0x04..=0x07 => Err(LoadError::Unsupported {
                offset,
                feature: "memory64".to_string(),
            }),
            other => Err(LoadError::Malformed {
                offset,
                reason: format!("integer too large: limits flag 0x{:02X}", other),
            }),
        }
    }

    fn read_table_type(r: &mut Reader<'_>) -> Result<TableType, LoadError> {
        let offset = r.offset();
        match r.read_u8()? {
            0x70 => {}
            0x6F => {
                return Err(LoadError::Unsupported {
                    offset,
                    feature: "reference types".to_string(),
                });
            }
            other => {
                return Err(LoadError::Malformed {
                    offset,
                    reason: format!("malformed reference type 0x{:02X}", other),
                });
            }
        }
        let limits_offset = r.offset();
        let limits = Self::read_limits(r)?;
        if limits.max.is_some_and(|max| limits.min > max) {
            return Err(invalid(limits_offset, "size minimum must not be greater than maximum"));
        }
        Ok(TableType { limits })
    }

    fn read_memory_type(r: &mut Reader<'_>) -> Result<MemoryType, LoadError> {
        let offset = r.offset();
        let limits = Self::read_limits(r)?;
        if limits.min > MAX_PAGES || limits.max.is_some_and(|max| max > MAX_PAGES) {
            return Err(invalid(offset, "memory size must be at most 65536 pages (4GiB)"));
        }
        if limits.max.is_some_and(|max| limits.min > max) {
            return Err(invalid(offset, "size minimum must not be greater than maximum"));
        }
        Ok(MemoryType { limits })
    }

    fn read_global_type(r: &mut Reader<'_>) -> Result<GlobalType, LoadError> {
        let ty = Self::read_valtype(r)?;
        let mutable = match r.read_u8()? {
            0x00 => false,
            0x01 => true,
            _ => return Err(r.malformed("malformed mutability")),
        };
        Ok(GlobalType { ty, mutable })
    }

    fn check_type_index(&self, idx: u32, offset: usize) -> Result<(), LoadError> {
        if (idx as usize) < self.types.len() {
            Ok(())
        } else {
            Err(invalid(offset, format!("unknown type {}", idx)))
        }
    }

    fn check_func_index(&self, idx: u32, offset: usize) -> Result<(), LoadError> {
        if (idx as usize) < self.func_types.len() {
            Ok(())
        } else {
            Err(invalid(offset, format!("unknown function {}", idx)))
        }
    }

    fn parse_types(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_count()?;
        for _ in 0..count {
            let offset = r.offset();
            if r.read_u8()? != 0x60 {
                return Err(LoadError::Malformed {
                    offset,
                    reason: "malformed function type form".to_string(),
                });
            }
            let params = (0..r.read_count()?)
                .map(|_| Self::read_valtype(r))
                .collect::<Result<Vec<_>, _>>()?;
            let results = (0..r.read_count()?)
                .map(|_| Self::read_valtype(r))
                .collect::<Result<Vec<_>, _>>()?;
            if results.len() > 1 && !self.config.is_feature_allowed(&WasmFeature::MultiValue) {
                return Err(LoadError::Unsupported {
                    offset,
                    feature: WasmFeature::MultiValue.to_string(),
                });
            }
            self.types.push(FuncType::new(params, results));
        }
        Ok(())
    }

    fn parse_imports(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_count()?;
        for _ in 0..count {
            let module = r.read_name()?;
            let field = r.read_name()?;
            let offset = r.offset();
            let desc = match r.read_u8()? {
                0x00 => {
                    let idx_offset = r.offset();
                    let idx = r.read_u32()?;
                    self.check_type_index(idx, idx_offset)?;
                    self.func_types.push(idx);
                    self.num_imported_funcs += 1;
                    ImportDesc::Func(idx)
                }
                0x01 => {
                    let table = Self::read_table_type(r)?;
                    self.tables.push(table);
                    ImportDesc::Table(table)
                }
                0x02 => {
                    let memory = Self::read_memory_type(r)?;
                    self.memories.push(memory);
                    ImportDesc::Memory(memory)
                }
                0x03 => {
                    let global = Self::read_global_type(r)?;
                    self.global_types.push(global);
                    self.num_imported_globals += 1;
                    ImportDesc::Global(global)
                }
                other => {
                    return Err(LoadError::Malformed {
                        offset,
                        reason: format!("malformed import kind 0x{:02X}", other),
                    });
                }
            };
            self.imports.push(Import {
                module,
                field,
                desc,
            });
        }
        Ok(())
    }

    fn parse_functions(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_count()?;
        for _ in 0..count {
            let offset = r.offset();
            let idx = r.read_u32()?;
            self.check_type_index(idx, offset)?;
            self.func_types.push(idx);
        }
        Ok(())
    }

    fn parse_tables(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_count()?;
        for _ in 0..count {
            let table = Self::read_table_type(r)?;
            self.tables.push(table);
        }
        if self.tables.len() > 1 {
            return Err(invalid(r.offset(), "multiple tables"));
        }
        Ok(())
    }

    fn parse_memories(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_count()?;
        for _ in 0..count {
            let memory = Self::read_memory_type(r)?;
            self.memories.push(memory);
        }
        if self.memories.len() > 1 {
            return Err(invalid(r.offset(), "multiple memories"));
        }
        Ok(())
    }

    fn parse_globals(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_count()?;
        for _ in 0..count {
            let ty = Self::read_global_type(r)?;
            let offset = r.offset();
            let init = ConstExpr::decode(r)?;
            self.check_const_expr(&init, ty.ty, offset)?;
            self.global_types.push(ty);
            self.globals.push(Global { ty, init });
        }
        Ok(())
    }

    fn parse_exports(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_count()?;
        for _ in 0..count {
            let offset = r.offset();
            let name = r.read_name()?;
            let kind_offset = r.offset();
            let kind_byte = r.read_u8()?;
            let kind = ExternKind::from_byte(kind_byte).ok_or_else(|| LoadError::Malformed {
                offset: kind_offset,
                reason: format!("malformed export kind 0x{:02X}", kind_byte),
            })?;
            let index = r.read_u32()?;
            let bound = match kind {
                ExternKind::Func => self.func_types.len(),
                ExternKind::Table => self.tables.len(),
                ExternKind::Memory => self.memories.len(),
                ExternKind::Global => self.global_types.len(),
            };
            if index as usize >= bound {
                return Err(invalid(kind_offset, format!("unknown {} {}", kind, index)));
            }
            if self.exports.contains_key(&name) {
                return Err(invalid(offset, format!("duplicate export name {:?}", name)));
            }
            self.exports
                .insert(name.clone(), Export { name, kind, index });
        }
        Ok(())
    }

    fn parse_start(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let offset = r.offset();
        let idx = r.read_u32()?;
        self.check_func_index(idx, offset)?;
        let ty = &self.types[self.func_types[idx as usize] as usize];
        if !ty.params.is_empty() || !ty.results.is_empty() {
            return Err(invalid(offset, format!("start function {} must have type [] -> []", idx)));
        }
        self.start = Some(idx);
        Ok(())
    }

    fn read_elem_exprs(&self, r: &mut Reader<'_>) -> Result<Vec<Option<u32>>, LoadError> {
        let count = r.read_count()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = r.offset();
            let item = match r.read_u8()? {
                0xD2 => {
                    let idx_offset = r.offset();
                    let idx = r.read_u32()?;
                    self.check_func_index(idx, idx_offset)?;
                    Some(idx)
                }
                0xD0 => {
                    if r.read_u8()? != 0x70 {
                        return Err(LoadError::Unsupported {
                            offset,
                            feature: "reference types".to_string(),
                        });
                    }
                    None
                }
                _ => {
                    return Err(LoadError::Malformed {
                        offset,
                        reason: "element expression must be ref.func or ref.null".to_string(),
                    });
                }
            };
            if r.read_u8()? != 0x0B {
                return Err(r.malformed("element expression must end after one instruction"));
            }
            items.push(item);
        }
        Ok(items)
    }

    fn read_func_indices(&self, r: &mut Reader<'_>) -> Result<Vec<Option<u32>>, LoadError> {
        let count = r.read_count()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = r.offset();
            let idx = r.read_u32()?;
            self.check_func_index(idx, offset)?;
            items.push(Some(idx));
        }
        Ok(items)
    }

    fn read_segment_offset(&self, r: &mut Reader<'_>) -> Result<ConstExpr, LoadError> {
        let offset = r.offset();
        let expr = ConstExpr::decode(r)?;
        self.check_const_expr(&expr, ValType::I32, offset)?;
        Ok(expr)
    }

    fn parse_elements(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let count = r.read_count()?;
        for _ in 0..count {
            let offset = r.offset();
            let flags = r.read_u32()?;
            let (table_index, segment_offset, items) = match flags {
                0 => {
                    let at = self.read_segment_offset(r)?;
                    (0, at, self.read_func_indices(r)?)
                }
                2 => {
                    let table = r.read_u32()?;
                    let at = self.read_segment_offset(r)?;
                    if r.read_u8()? != 0x00 {
                        return Err(r.malformed("malformed element kind"));
                    }
                    (table, at, self.read_func_indices(r)?)
                }
                4 => {
                    let at = self.read_segment_offset(r)?;
                    (0, at, self.read_elem_exprs(r)?)
                }
                1 | 3 | 5..=7 => {
                    return Err(LoadError::Unsupported {
                        offset,
                        feature: "bulk memory".to_string(),
                    });
                }
                _ => {
                    return Err(LoadError::Malformed {
                        offset,
                        reason: format!("malformed element segment flags {}", flags),
                    });
                }
            };
            if table_index as usize >= self.tables.len() {
                return Err(invalid(offset, format!("unknown table {}", table_index)));
            }
            self.elements.push(ElementSegment {
                offset: segment_offset,
                items,
            });
        }
        Ok(())
    }

    fn parse_code(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        self.seen_code = true;
        self.code_offset = r.offset();
        let count = r.read_count()?;
        let defined = self.func_types.len() - self.num_imported_funcs as usize;
        if count != defined {
            return Err(r.malformed("function and code section have inconsistent lengths"));
        }
        for _ in 0..count {
            let size = r.read_u32()? as usize;
            let mut body_reader = r.split(size)?;
            self.bodies.push(decode_body(&mut body_reader, self.config)?);
        }
        Ok(())
    }

    fn parse_data(&mut self, r: &mut Reader<'_>) -> Result<(), LoadError> {
        let section_offset = r.offset();
        let count = r.read_count()?;
        if self.data_count.is_some_and(|n| n as usize != count) {
            return Err(LoadError::Malformed {
                offset: section_offset,
                reason: "data count and data section have inconsistent lengths".to_string(),
            });
        }
        for _ in 0..count {
            let offset = r.offset();
            let flags = r.read_u32()?;
            let memory_index = match flags {
                0 => 0,
                2 => r.read_u32()?,
                1 => {
                    return Err(LoadError::Unsupported {
                        offset,
                        feature: "bulk memory".to_string(),
                    });
                }
                _ => {
                    return Err(LoadError::Malformed {
                        offset,
                        reason: format!("malformed data segment flags {}", flags),
                    });
                }
            };
            if memory_index as usize >= self.memories.len() {
                return Err(invalid(offset, format!("unknown memory {}", memory_index)));
            }
            let at = self.read_segment_offset(r)?;
            let len = r.read_u32()? as usize;
            let bytes = r.read_bytes(len)?.to_vec();
            self.data.push(DataSegment { offset: at, bytes });
        }
        Ok(())
    }

    /// Type-check a constant initializer
    fn check_const_expr(
        &self,
        expr: &ConstExpr,
        expected: ValType,
        offset: usize,
    ) -> Result<(), LoadError> {
        let actual = match expr {
            ConstExpr::I32(_) => ValType::I32,
            ConstExpr::I64(_) => ValType::I64,
            ConstExpr::F32(_) => ValType::F32,
            ConstExpr::F64(_) => ValType::F64,
            ConstExpr::GlobalGet(idx) => {
                if *idx >= self.num_imported_globals {
                    return Err(invalid(offset, format!("unknown global {}", idx)));
                }
                let global = self.global_types[*idx as usize];
                if global.mutable {
                    return Err(invalid(offset, "constant expression required"));
                }
                global.ty
            }
        };
        if actual != expected {
            return Err(invalid(
                offset,
                format!("type mismatch: expected {}, found {}", expected, actual),
            ));
        }
        Ok(())
    }

    fn finish(self) -> Result<Module, LoadError> {
        let defined = self.func_types.len() - self.num_imported_funcs as usize;
        if defined > 0 && !self.seen_code {
            return Err(LoadError::Malformed {
                offset: self.size,
                reason: "function and code section have inconsistent lengths".to_string(),
            });
        }
        if self.data_count.is_some_and(|n| n as usize != self.data.len()) {
            return Err(LoadError::Malformed {
                offset: self.size,
                reason: "data count and data section have inconsistent lengths".to_string(),
            });
        }

        let ctx = ModuleContext {
            types: &self.types,
            func_types: &self.func_types,
            global_types: &self.global_types,
            has_memory: !self.memories.is_empty(),
            has_table: !self.tables.is_empty(),
            config: self.config,
        };
        for (i, body) in self.bodies.iter().enumerate() {
            let func_index = self.num_imported_funcs + i as u32;
            let ty = &self.types[self.func_types[func_index as usize] as usize];
            validate::validate_function(&ctx, func_index, ty, body)?;
        }

        Ok(Module {
            types: self.types,
            imports: self.imports,
            func_types: self.func_types,
            num_imported_funcs: self.num_imported_funcs,
            global_types: self.global_types,
            num_imported_globals: self.num_imported_globals,
            globals: self.globals,
            table: self.tables.first().copied(),
            memory: self.memories.first().copied(),
            exports: self.exports,
            start: self.start,
            elements: self.elements,
            data: self.data,
            bodies: self.bodies,
            hash: self.hash,
            size: self.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD: &[u8] = &[
        0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, 0x01, 0x07, 0x01, 0x60, 0x02, 0x7F, 0x7F,
        0x01, 0x7F, 0x03, 0x02, 0x01, 0x00, 0x07, 0x07, 0x01, 0x03, 0x61, 0x64, 0x64, 0x00, 0x00,
        0x0A, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B,
    ];

    fn wat(src: &str) -> Vec<u8> {
        wat::parse_str(src).unwrap()
    }

    #[test]
    fn test_load_add_bytes() {
        let module = load(ADD).unwrap();
        assert_eq!(module.function_count(), 1);
        let export = module.export("add").unwrap();
        assert_eq!(export.kind, ExternKind::Func);
        assert_eq!(
            module.func_type(export.index).unwrap().to_string(),
            "(i32, i32) -> (i32)"
        );
        assert_eq!(module.hash(), &Hash::compute(ADD));
        assert_eq!(module.size(), ADD.len());
    }

    #[test]
    fn test_export_lookup_is_case_sensitive() {
        let module = load(ADD).unwrap();
        assert!(module.export("Add").is_none());
    }

    #[test]
    fn test_bad_magic() {
        let err = load(b"\0asn\x01\x00\x00\x00").unwrap_err();
        assert!(matches!(err, LoadError::Format { .. }));
        assert!(matches!(load(b"\0as").unwrap_err(), LoadError::Format { .. }));
    }

    #[test]
    fn test_bad_version() {
        let err = load(b"\0asm\x02\x00\x00\x00").unwrap_err();
        assert!(matches!(err, LoadError::Format { .. }));
    }

    #[test]
    fn test_empty_module() {
        let module = load(b"\0asm\x01\x00\x00\x00").unwrap();
        assert_eq!(module.function_count(), 0);
        assert!(module.memory().is_none());
    }

    #[test]
    fn test_truncated_module() {
        let err = load(&ADD[..ADD.len() - 3]).unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }));
    }

    #[test]
    fn test_size_limit() {
        let config = LoadConfig::new().with_max_module_size(16);
        let err = Module::from_bytes(ADD, &config).unwrap_err();
        assert_eq!(
            err,
            LoadError::SizeLimitExceeded {
                size: ADD.len(),
                limit: 16
            }
        );
    }

    #[test]
    fn test_sections_out_of_order() {
        // export section (7) before function section (3)
        let bytes = [
            0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, 0x01, 0x04, 0x01, 0x60, 0x00, 0x00,
            0x07, 0x01, 0x00, 0x03, 0x02, 0x01, 0x00,
        ];
        let err = load(&bytes).unwrap_err();
        assert!(err.to_string().contains("out of order"));
    }

    #[test]
    fn test_custom_sections_skipped() {
        let mut bytes = ADD.to_vec();
        bytes.extend_from_slice(&[0x00, 0x05, 0x04, b'n', b'o', b't', b'e']);
        assert!(load(&bytes).is_ok());
    }

    #[test]
    fn test_missing_code_section() {
        let bytes = [
            0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, 0x01, 0x04, 0x01, 0x60, 0x00, 0x00,
            0x03, 0x02, 0x01, 0x00,
        ];
        let err = load(&bytes).unwrap_err();
        assert!(err.to_string().contains("inconsistent lengths"));
    }

    #[test]
    fn test_result_type_mismatch_fails_validation() {
        let bytes = wat(r#"(module (func (export "f") (result i32) i64.const 1))"#);
        match load(&bytes).unwrap_err() {
            LoadError::Validation { func_index, .. } => assert_eq!(func_index, Some(0)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_export() {
        let bytes = wat(
            r#"(module (func $f) (export "a" (func $f)) (export "a" (func $f)))"#,
        );
        let err = load(&bytes).unwrap_err();
        assert!(err.to_string().contains("duplicate export"));
    }

    #[test]
    fn test_memory_limits_checked() {
        let bytes = wat("(module (memory 2 1))");
        assert!(load(&bytes).unwrap_err().to_string().contains("minimum"));
        let bytes = wat("(module (memory 65537))");
        assert!(load(&bytes).unwrap_err().to_string().contains("65536 pages"));
    }

    #[test]
    fn test_start_must_be_nullary() {
        let bytes = wat("(module (func $s (param i32)) (start $s))");
        assert!(load(&bytes).unwrap_err().to_string().contains("start function"));
    }

    #[test]
    fn test_multi_value_requires_feature() {
        let bytes = wat("(module (func (result i32 i32) i32.const 1 i32.const 2))");
        assert!(load(&bytes).is_ok());
        let err = Module::from_bytes(&bytes, &LoadConfig::mvp()).unwrap_err();
        assert!(matches!(err, LoadError::Unsupported { .. }));
    }

    #[test]
    fn test_global_init_type_checked() {
        let bytes = wat("(module (global i32 (i64.const 0)))");
        assert!(matches!(load(&bytes).unwrap_err(), LoadError::Validation { .. }));
    }

    #[test]
    fn test_export_signatures() {
        let bytes = wat(
            r#"(module
                (memory (export "mem") 1)
                (func (export "neg") (param f64) (result f64) local.get 0 f64.neg))"#,
        );
        let module = load(&bytes).unwrap();
        let sigs = module.export_signatures();
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].kind, ExternKind::Memory);
        assert!(sigs[0].signature.is_none());
        assert_eq!(sigs[1].signature.as_ref().unwrap().to_string(), "(f64) -> (f64)");
    }

    #[test]
    fn test_load_config_serde() {
        let config = LoadConfig::new().without_feature(&WasmFeature::SignExtension);
        let json = serde_json::to_string(&config).unwrap();
        let back: LoadConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        let partial: LoadConfig = serde_json::from_str(r#"{"max_module_size": 1024}"#).unwrap();
        assert_eq!(partial.max_module_size, 1024);
        assert!(partial.is_feature_allowed(&WasmFeature::MultiValue));
    }

    #[test]
    fn test_error_display() {
        let err = LoadError::Validation {
            func_index: Some(3),
            offset: 42,
            reason: "type mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Validation failed in function 3 at offset 42: type mismatch"
        );
    }
}
