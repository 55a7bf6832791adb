//! Instantiation and invocation.

use crate::exec::{Executor, StackLimits};
use crate::fuel::FuelMeter;
use crate::host::{HostFunction, ImportValue, Imports};
use crate::instr::ConstExpr;
use crate::load::Module;
use crate::memory::{LinearMemory, MemoryError, MemoryLimit};
use crate::trap::{Trap, TrapKind};
use crate::types::{ExternKind, ImportDesc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wasmbridge_core::{FuncType, Hash, InstanceId, ValType, Value};

/// Per-instance resource limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Maximum nested calls per invocation
    pub max_call_depth: usize,
    /// Maximum operand stack plus locals, in values
    pub max_operand_stack: usize,
    /// Cap on linear memory, applied on top of the declared maximum
    pub memory_limit: MemoryLimit,
    /// Cap on table elements, checked against the declared minimum
    pub max_table_elements: u32,
    /// Default fuel budget per invocation; `None` is unmetered
    pub fuel: Option<u64>,
}

impl InstanceConfig {
    /// Create a config with default limits
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_call_depth: 1024,
            max_operand_stack: 1024 * 1024,
            memory_limit: MemoryLimit::default(),
            max_table_elements: 65536,
            fuel: None,
        }
    }

    /// Set the call depth limit
    #[must_use]
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Set the operand stack limit
    #[must_use]
    pub fn with_max_operand_stack(mut self, values: usize) -> Self {
        self.max_operand_stack = values;
        self
    }

    /// Set the memory cap
    #[must_use]
    pub fn with_memory_limit(mut self, limit: MemoryLimit) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Set the table element cap
    #[must_use]
    pub fn with_max_table_elements(mut self, elements: u32) -> Self {
        self.max_table_elements = elements;
        self
    }

    /// Set a default fuel budget
    #[must_use]
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    fn stack_limits(&self) -> StackLimits {
        StackLimits {
            max_call_depth: self.max_call_depth,
            max_operand_stack: self.max_operand_stack,
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Import resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// No value offered for an import
    #[error("Unknown import {module}.{field}")]
    Missing {
        /// Import module name
        module: String,
        /// Import field name
        field: String,
    },

    /// Offered value has the wrong kind
    #[error("Import {module}.{field} expects a {expected}, got a {found}")]
    KindMismatch {
        /// Import module name
        module: String,
        /// Import field name
        field: String,
        /// Kind the import declares
        expected: ExternKind,
        /// Kind offered
        found: ExternKind,
    },

    /// Host function signature differs from the import's
    #[error("Import {module}.{field} expects signature {expected}, got {found}")]
    SignatureMismatch {
        /// Import module name
        module: String,
        /// Import field name
        field: String,
        /// Signature the import declares
        expected: FuncType,
        /// Signature of the host function
        found: FuncType,
    },

    /// Global type or mutability differs from the import's
    #[error("Import {module}.{field} expects global {expected}, got {found}")]
    GlobalMismatch {
        /// Import module name
        module: String,
        /// Import field name
        field: String,
        /// Global type the import declares
        expected: String,
        /// Global type offered
        found: String,
    },

    /// Import kind the engine cannot provide
    #[error("Import {module}.{field}: {kind} imports are not supported")]
    Unsupported {
        /// Import module name
        module: String,
        /// Import field name
        field: String,
        /// Kind of the import
        kind: ExternKind,
    },
}

/// Instantiation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstantiationError {
    /// Import resolution failed
    #[error(transparent)]
    Link(#[from] LinkError),

    /// An active segment does not fit its table or memory
    #[error("{kind} segment {index} does not fit: offset {offset} + {len} > {size}")]
    SegmentOutOfBounds {
        /// Table or memory
        kind: ExternKind,
        /// Segment index
        index: usize,
        /// Evaluated start offset
        offset: u32,
        /// Segment length
        len: usize,
        /// Current table or memory size
        size: usize,
    },

    /// The start function trapped
    #[error("Start function failed: {0}")]
    Start(Trap),

    /// Memory could not be provided
    #[error("Resource limit: {0}")]
    ResourceLimit(#[from] MemoryError),

    /// Table could not be provided
    #[error("Table of {requested} elements exceeds limit of {limit}")]
    TableLimit {
        /// Declared minimum elements
        requested: u32,
        /// Configured cap, or what the allocator could provide
        limit: u32,
    },
}

/// Invocation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    /// Arguments do not match the export signature; nothing ran
    #[error("Type mismatch calling {name}: expected {expected}, got {found:?}")]
    TypeMismatch {
        /// Export name
        name: String,
        /// Export signature
        expected: FuncType,
        /// Types of the supplied arguments
        found: Vec<ValType>,
    },

    /// Execution trapped
    #[error(transparent)]
    Trap(#[from] Trap),
}

/// Lifecycle of the most recent invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// No invocation yet
    Ready,
    /// An invocation is in progress
    Running,
    /// Last invocation returned normally
    Returned,
    /// Last invocation trapped
    Trapped(TrapKind),
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Cooperative cancellation, checked at loops, backward branches and calls
    pub cancel: Option<CancellationToken>,
    /// Fuel budget overriding the instance default
    pub fuel: Option<u64>,
}

impl InvokeOptions {
    /// Create empty options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Set a fuel budget
    #[must_use]
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }
}

/// A live instantiation of a module
#[derive(Debug)]
pub struct Instance {
    id: InstanceId,
    module: Arc<Module>,
    memory: Option<LinearMemory>,
    table: Vec<Option<u32>>,
    globals: Vec<Value>,
    host_funcs: Vec<HostFunction>,
    config: InstanceConfig,
    state: ExecutionState,
    fuel_consumed: Option<u64>,
}

fn eval_const(expr: &ConstExpr, globals: &[Value]) -> Value {
    match expr {
        ConstExpr::I32(v) => Value::I32(*v),
        ConstExpr::I64(v) => Value::I64(*v),
        ConstExpr::F32(v) => Value::F32(*v),
        ConstExpr::F64(v) => Value::F64(*v),
        // Validated to name an imported global, which is already resolved
        ConstExpr::GlobalGet(idx) => globals.get(*idx as usize).copied().unwrap_or(Value::I32(0)),
    }
}

fn segment_start(expr: &ConstExpr, globals: &[Value]) -> u32 {
    eval_const(expr, globals).as_i32().unwrap_or_default() as u32
}

/// Resolve imports against a module and record the host functions and
/// global values they provide
fn link(
    module: &Module,
    imports: &Imports,
) -> Result<(Vec<HostFunction>, Vec<Value>), LinkError> {
    let mut host_funcs = Vec::new();
    let mut globals = Vec::new();
    for import in module.imports() {
        let (m, f) = (import.module.clone(), import.field.clone());
        let offered = imports.get(&import.module, &import.field).ok_or_else(|| {
            LinkError::Missing {
                module: m.clone(),
                field: f.clone(),
            }
        })?;
        match (&import.desc, offered) {
            (ImportDesc::Func(type_index), ImportValue::Func(func)) => {
                let expected = module.signature(*type_index).cloned().unwrap_or_default();
                if func.signature != expected {
                    return Err(LinkError::SignatureMismatch {
                        module: m,
                        field: f,
                        expected,
                        found: func.signature.clone(),
                    });
                }
                host_funcs.push(func.clone());
            }
            (ImportDesc::Global(ty), ImportValue::Global { value, mutable }) => {
                if value.ty() != ty.ty || *mutable != ty.mutable {
                    let found = if *mutable {
                        format!("mut {}", value.ty())
                    } else {
                        value.ty().to_string()
                    };
                    return Err(LinkError::GlobalMismatch {
                        module: m,
                        field: f,
                        expected: ty.to_string(),
                        found,
                    });
                }
                globals.push(*value);
            }
            (ImportDesc::Memory(_) | ImportDesc::Table(_), _) => {
                return Err(LinkError::Unsupported {
                    module: m,
                    field: f,
                    kind: import.desc.kind(),
                });
            }
            (desc, offered) => {
                return Err(LinkError::KindMismatch {
                    module: m,
                    field: f,
                    expected: desc.kind(),
                    found: offered.kind(),
                });
            }
        }
    }
    Ok((host_funcs, globals))
}

fn allocate_table(
    min: u32,
    config: &InstanceConfig,
) -> Result<Vec<Option<u32>>, InstantiationError> {
    let exceeded = InstantiationError::TableLimit {
        requested: min,
        limit: config.max_table_elements,
    };
    if min > config.max_table_elements {
        return Err(exceeded);
    }
    let mut table = Vec::new();
    table.try_reserve_exact(min as usize).map_err(|_| exceeded)?;
    table.resize(min as usize, None);
    Ok(table)
}

impl Instance {
    /// Link, allocate, initialise and run the start function
    ///
    /// # Errors
    ///
    /// Returns error if an import cannot be resolved, a segment does not
    /// fit, memory cannot be allocated or the start function traps; no
    /// instance is produced in any of these cases
    pub fn new(
        module: Arc<Module>,
        imports: &Imports,
        config: InstanceConfig,
    ) -> Result<Self, InstantiationError> {
        let (host_funcs, mut globals) = link(&module, imports).inspect_err(|e| {
            tracing::warn!(module = %module.hash().short(), error = %e, "link failed");
        })?;

        for global in &module.globals {
            let value = eval_const(&global.init, &globals);
            globals.push(value);
        }

        let mut memory = module
            .memory()
            .map(|ty| LinearMemory::new(ty, &config.memory_limit))
            .transpose()?;

        let mut table = allocate_table(module.table().map_or(0, |t| t.limits.min), &config)?;
        for (index, segment) in module.elements.iter().enumerate() {
            let start = segment_start(&segment.offset, &globals);
            let end = start as usize + segment.items.len();
            if end > table.len() {
                return Err(InstantiationError::SegmentOutOfBounds {
                    kind: ExternKind::Table,
                    index,
                    offset: start,
                    len: segment.items.len(),
                    size: table.len(),
                });
            }
            table[start as usize..end].copy_from_slice(&segment.items);
        }

        for (index, segment) in module.data.iter().enumerate() {
            let start = segment_start(&segment.offset, &globals);
            let size = memory.as_ref().map_or(0, |m| m.data().len());
            let fits = memory
                .as_mut()
                .is_some_and(|m| m.store(start, 0, &segment.bytes).is_ok());
            if !fits {
                return Err(InstantiationError::SegmentOutOfBounds {
                    kind: ExternKind::Memory,
                    index,
                    offset: start,
                    len: segment.bytes.len(),
                    size,
                });
            }
        }

        let mut instance = Self {
            id: InstanceId::new(),
            module,
            memory,
            table,
            globals,
            host_funcs,
            config,
            state: ExecutionState::Ready,
            fuel_consumed: None,
        };

        if let Some(start) = instance.module.start() {
            instance
                .run(start, &[], &InvokeOptions::default())
                .map_err(|trap| {
                    tracing::warn!(error = %trap, "start function trapped");
                    InstantiationError::Start(trap)
                })?;
        }

        tracing::debug!(
            instance = %instance.id,
            module = %instance.module.hash().short(),
            "instantiated"
        );
        Ok(instance)
    }

    /// Handle of this instance
    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The module this instance was created from
    #[must_use]
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Outcome of the most recent invocation
    #[must_use]
    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Fuel used by the most recent metered invocation
    #[must_use]
    pub fn fuel_consumed(&self) -> Option<u64> {
        self.fuel_consumed
    }

    /// Resource limits of this instance
    #[must_use]
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Signature of a function export
    #[must_use]
    pub fn func_signature(&self, name: &str) -> Option<&FuncType> {
        let export = self.module.export(name)?;
        if export.kind != ExternKind::Func {
            return None;
        }
        self.module.func_type(export.index)
    }

    /// Current value of an exported global
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Value> {
        let export = self.module.export(name)?;
        if export.kind != ExternKind::Global {
            return None;
        }
        self.globals.get(export.index as usize).copied()
    }

    /// Linear memory contents, if the module declares a memory
    #[must_use]
    pub fn memory(&self) -> Option<&[u8]> {
        self.memory.as_ref().map(LinearMemory::data)
    }

    /// Linear memory contents, mutable
    #[must_use]
    pub fn memory_mut(&mut self) -> Option<&mut [u8]> {
        self.memory.as_mut().map(LinearMemory::data_mut)
    }

    /// BLAKE3 hash of linear memory
    #[must_use]
    pub fn memory_checksum(&self) -> Option<Hash> {
        self.memory.as_ref().map(LinearMemory::checksum)
    }

    /// Invoke an exported function with default options
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` if `args` do not fit the signature, or `Trap`
    pub fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        self.invoke_with(name, args, &InvokeOptions::default())
    }

    /// Invoke an exported function
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` if `args` do not fit the signature, or `Trap`
    pub fn invoke_with(
        &mut self,
        name: &str,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<Vec<Value>, InvokeError> {
        let module = Arc::clone(&self.module);
        let func = match module.export(name) {
            Some(export) if export.kind == ExternKind::Func => export.index,
            _ => {
                return Err(Trap::new(TrapKind::UndefinedExport(name.to_string())).into());
            }
        };
        let signature = module
            .func_type(func)
            .ok_or_else(|| Trap::new(TrapKind::UndefinedExport(name.to_string())))?;
        if !signature.accepts(args) {
            return Err(InvokeError::TypeMismatch {
                name: name.to_string(),
                expected: signature.clone(),
                found: args.iter().map(Value::ty).collect(),
            });
        }

        tracing::debug!(instance = %self.id, export = name, args = args.len(), "invoke");
        let results = self.run(func, args, options)?;
        Ok(results)
    }

    fn run(
        &mut self,
        func: u32,
        args: &[Value],
        options: &InvokeOptions,
    ) -> Result<Vec<Value>, Trap> {
        self.state = ExecutionState::Running;
        let fuel = options.fuel.or(self.config.fuel).map(FuelMeter::new);
        let mut executor = Executor::new(
            &self.module,
            self.memory.as_mut(),
            &self.table,
            &mut self.globals,
            &self.host_funcs,
            self.config.stack_limits(),
            fuel,
            options.cancel.as_ref(),
        );
        let outcome = executor.execute(func, args);
        let fuel_consumed = executor.fuel().map(FuelMeter::consumed);
        drop(executor);

        self.fuel_consumed = fuel_consumed;
        match &outcome {
            Ok(_) => self.state = ExecutionState::Returned,
            Err(trap) => {
                tracing::warn!(instance = %self.id, error = %trap, "trapped");
                self.state = ExecutionState::Trapped(trap.kind.clone());
            }
        }
        outcome
    }
}

/// Instantiate a module with default limits
///
/// # Errors
///
/// See [`Instance::new`]
pub fn instantiate(module: Arc<Module>, imports: &Imports) -> Result<Instance, InstantiationError> {
    Instance::new(module, imports, InstanceConfig::default())
}
