//! Engine: one configuration driving load and instantiate.

use crate::host::Imports;
use crate::instance::{Instance, InstanceConfig, InstantiationError};
use crate::load::{LoadConfig, LoadError, Module};
use crate::memory::MemoryLimit;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Loader settings
    pub load: LoadConfig,
    /// Limits applied to every instance
    pub instance: InstanceConfig,
}

impl EngineConfig {
    /// Create a new engine config
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set loader settings
    #[must_use]
    pub fn with_load(mut self, load: LoadConfig) -> Self {
        self.load = load;
        self
    }

    /// Set instance limits
    #[must_use]
    pub fn with_instance(mut self, instance: InstanceConfig) -> Self {
        self.instance = instance;
        self
    }

    /// Set a default fuel budget per invocation
    #[must_use]
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.instance.fuel = Some(fuel);
        self
    }

    /// Set the memory cap in bytes
    #[must_use]
    pub fn with_memory_limit(mut self, max_bytes: u64) -> Self {
        self.instance.memory_limit = MemoryLimit::new(max_bytes);
        self
    }
}

/// Loads modules and instantiates them under one configuration
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    /// Create a new engine
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Get the engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check a binary without keeping the module
    ///
    /// # Errors
    ///
    /// Returns the first load or validation failure
    pub fn validate(&self, bytes: &[u8]) -> Result<(), LoadError> {
        Module::from_bytes(bytes, &self.config.load).map(|_| ())
    }

    /// Load and validate a binary
    ///
    /// # Errors
    ///
    /// Returns the first load or validation failure
    pub fn load(&self, bytes: &[u8]) -> Result<Arc<Module>, LoadError> {
        Module::from_bytes(bytes, &self.config.load).map(Arc::new)
    }

    /// Instantiate a module with the engine's instance limits
    ///
    /// # Errors
    ///
    /// See [`Instance::new`]
    pub fn instantiate(
        &self,
        module: Arc<Module>,
        imports: &Imports,
    ) -> Result<Instance, InstantiationError> {
        Instance::new(module, imports, self.config.instance.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::WasmFeature;
    use wasmbridge_core::Value;

    #[test]
    fn test_engine_round_trip() {
        let engine = Engine::default();
        let bytes = wat::parse_str(
            r#"(module (func (export "mul") (param i64 i64) (result i64)
                local.get 0 local.get 1 i64.mul))"#,
        )
        .unwrap();
        let module = engine.load(&bytes).unwrap();
        let mut inst = engine.instantiate(module, &Imports::new()).unwrap();
        assert_eq!(
            inst.invoke("mul", &[Value::I64(6), Value::I64(7)]).unwrap(),
            vec![Value::I64(42)]
        );
    }

    #[test]
    fn test_engine_applies_load_config() {
        let engine = Engine::new(
            EngineConfig::new().with_load(LoadConfig::new().without_feature(&WasmFeature::SignExtension)),
        );
        let bytes = wat::parse_str(
            r#"(module (func (param i32) (result i32) local.get 0 i32.extend8_s))"#,
        )
        .unwrap();
        assert!(matches!(
            engine.validate(&bytes),
            Err(LoadError::Unsupported { .. })
        ));
        assert!(Engine::default().validate(&bytes).is_ok());
    }

    #[test]
    fn test_engine_applies_instance_config() {
        let engine = Engine::new(EngineConfig::new().with_fuel(50));
        let bytes = wat::parse_str(r#"(module (func (export "spin") (loop (br 0))))"#).unwrap();
        let module = engine.load(&bytes).unwrap();
        let mut inst = engine.instantiate(module, &Imports::new()).unwrap();
        assert!(inst.invoke("spin", &[]).is_err());
        assert_eq!(inst.fuel_consumed(), Some(50));
    }

    #[test]
    fn test_engine_config_from_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"instance": {"max_call_depth": 64, "fuel": 1000}}"#,
        )
        .unwrap();
        assert_eq!(config.instance.max_call_depth, 64);
        assert_eq!(config.instance.fuel, Some(1000));
        assert_eq!(config.load, LoadConfig::default());
    }
}
