//! Host functions and the import set handed to instantiation.

use crate::memory::LinearMemory;
use crate::trap::TrapKind;
use crate::types::ExternKind;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use wasmbridge_core::{FuncType, ValType, Value};

/// Host function implementation
pub type HostFn =
    Arc<dyn Fn(&mut HostContext<'_>, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync>;

/// Error returned by a host function; surfaces as a `Host` trap
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    /// Create an error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<TrapKind> for HostError {
    fn from(kind: TrapKind) -> Self {
        Self(kind.to_string())
    }
}

/// What a host function can see of the calling instance
pub struct HostContext<'a> {
    memory: Option<&'a mut LinearMemory>,
}

impl<'a> HostContext<'a> {
    pub(crate) fn new(memory: Option<&'a mut LinearMemory>) -> Self {
        Self { memory }
    }

    /// Whether the instance has a linear memory
    #[must_use]
    pub fn has_memory(&self) -> bool {
        self.memory.is_some()
    }

    /// Copy `len` bytes out of guest memory
    ///
    /// # Errors
    ///
    /// Returns error if there is no memory or the range is out of bounds
    pub fn read_memory(&self, addr: u32, len: usize) -> Result<Vec<u8>, HostError> {
        let memory = self
            .memory
            .as_deref()
            .ok_or_else(|| HostError::new("instance has no memory"))?;
        Ok(memory.read(addr, len)?.to_vec())
    }

    /// Write bytes into guest memory
    ///
    /// # Errors
    ///
    /// Returns error if there is no memory or the range is out of bounds
    pub fn write_memory(&mut self, addr: u32, bytes: &[u8]) -> Result<(), HostError> {
        let memory = self
            .memory
            .as_deref_mut()
            .ok_or_else(|| HostError::new("instance has no memory"))?;
        memory.store(addr, 0, bytes)?;
        Ok(())
    }
}

/// Host function definition
#[derive(Clone)]
pub struct HostFunction {
    /// Declared signature; must match the import exactly
    pub signature: FuncType,
    /// The function implementation
    implementation: HostFn,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl HostFunction {
    /// Create a new host function
    #[must_use]
    pub fn new(signature: FuncType, implementation: HostFn) -> Self {
        Self {
            signature,
            implementation,
        }
    }

    /// Wrap a closure
    #[must_use]
    pub fn wrap<F>(
        params: impl Into<Vec<ValType>>,
        results: impl Into<Vec<ValType>>,
        f: F,
    ) -> Self
    where
        F: Fn(&mut HostContext<'_>, &[Value]) -> Result<Vec<Value>, HostError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(FuncType::new(params, results), Arc::new(f))
    }

    /// Call the host function and check its results against the signature
    ///
    /// # Errors
    ///
    /// Traps with `Host` if the implementation fails or returns values that
    /// do not match the declared results
    pub fn call(&self, ctx: &mut HostContext<'_>, args: &[Value]) -> Result<Vec<Value>, TrapKind> {
        let results = (self.implementation)(ctx, args).map_err(|e| TrapKind::Host(e.0))?;
        let matches = results.len() == self.signature.results.len()
            && results
                .iter()
                .zip(&self.signature.results)
                .all(|(v, t)| v.ty() == *t);
        if !matches {
            return Err(TrapKind::Host(format!(
                "host function returned {:?}, declared {}",
                results.iter().map(Value::ty).collect::<Vec<_>>(),
                self.signature
            )));
        }
        Ok(results)
    }
}

/// A value offered to satisfy one import
#[derive(Debug, Clone)]
pub enum ImportValue {
    /// Host function
    Func(HostFunction),
    /// Global with an initial value
    Global {
        /// Initial value; also fixes the type
        value: Value,
        /// Whether the guest may `global.set` it
        mutable: bool,
    },
}

impl ImportValue {
    /// Kind of this value
    #[must_use]
    pub const fn kind(&self) -> ExternKind {
        match self {
            Self::Func(_) => ExternKind::Func,
            Self::Global { .. } => ExternKind::Global,
        }
    }
}

/// Named values resolved against a module's imports by exact `(module, field)`
#[derive(Debug, Clone, Default)]
pub struct Imports {
    entries: HashMap<(String, String), ImportValue>,
}

impl Imports {
    /// Create an empty import set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define an entry, replacing any previous one
    pub fn define(&mut self, module: &str, field: &str, value: ImportValue) -> &mut Self {
        self.entries
            .insert((module.to_string(), field.to_string()), value);
        self
    }

    /// Define a host function
    pub fn func(&mut self, module: &str, field: &str, func: HostFunction) -> &mut Self {
        self.define(module, field, ImportValue::Func(func))
    }

    /// Define an immutable global
    pub fn global(&mut self, module: &str, field: &str, value: Value) -> &mut Self {
        self.define(
            module,
            field,
            ImportValue::Global {
                value,
                mutable: false,
            },
        )
    }

    /// Look up an entry
    #[must_use]
    pub fn get(&self, module: &str, field: &str) -> Option<&ImportValue> {
        self.entries.get(&(module.to_string(), field.to_string()))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLimit;
    use crate::types::{Limits, MemoryType};

    fn double() -> HostFunction {
        HostFunction::wrap([ValType::I32], [ValType::I32], |_ctx, args| {
            let x = args[0].as_i32().unwrap_or_default();
            Ok(vec![Value::I32(x.wrapping_mul(2))])
        })
    }

    #[test]
    fn test_host_function_call() {
        let mut ctx = HostContext::new(None);
        let result = double().call(&mut ctx, &[Value::I32(21)]).unwrap();
        assert_eq!(result, vec![Value::I32(42)]);
    }

    #[test]
    fn test_host_function_result_type_checked() {
        let bad = HostFunction::wrap([], [ValType::I64], |_ctx, _args| Ok(vec![Value::I32(1)]));
        let mut ctx = HostContext::new(None);
        assert!(matches!(bad.call(&mut ctx, &[]), Err(TrapKind::Host(_))));
    }

    #[test]
    fn test_host_function_error_becomes_trap() {
        let failing = HostFunction::wrap([], [], |_ctx, _args| Err(HostError::new("denied")));
        let mut ctx = HostContext::new(None);
        assert_eq!(
            failing.call(&mut ctx, &[]),
            Err(TrapKind::Host("denied".to_string()))
        );
    }

    #[test]
    fn test_host_context_memory() {
        let mut memory = LinearMemory::new(
            &MemoryType {
                limits: Limits { min: 1, max: None },
            },
            &MemoryLimit::default(),
        )
        .unwrap();
        let mut ctx = HostContext::new(Some(&mut memory));
        ctx.write_memory(16, b"hi").unwrap();
        assert_eq!(ctx.read_memory(16, 2).unwrap(), b"hi");
        assert!(ctx.read_memory(65535, 2).is_err());
        assert!(!HostContext::new(None).has_memory());
    }

    #[test]
    fn test_imports_lookup() {
        let mut imports = Imports::new();
        imports
            .func("env", "double", double())
            .global("env", "base", Value::I64(7));
        assert_eq!(imports.len(), 2);
        assert_eq!(imports.get("env", "double").unwrap().kind(), ExternKind::Func);
        assert!(imports.get("env", "Double").is_none());
        assert!(imports.get("other", "double").is_none());
    }
}
