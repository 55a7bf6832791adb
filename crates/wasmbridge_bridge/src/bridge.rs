//! Handle registry and the `call_export` entry points.

use crate::asset::read_asset;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::{NativeType, NativeValue, marshal_args, unmarshal_results};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wasmbridge_core::{FuncType, InstanceId, ModuleId};
use wasmbridge_wasm::{
    Engine, Imports, Instance, InvokeError, InvokeOptions, Module, Trap, TrapKind,
};

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Declared native parameter types; signed defaults when unset
    pub param_types: Option<Vec<NativeType>>,
    /// Declared native result types; signed defaults when unset
    pub result_types: Option<Vec<NativeType>>,
    /// Cooperative cancellation
    pub cancel: Option<CancellationToken>,
    /// Fuel budget for this call
    pub fuel: Option<u64>,
}

impl CallOptions {
    /// Create empty options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare parameter types
    #[must_use]
    pub fn with_param_types(mut self, types: impl Into<Vec<NativeType>>) -> Self {
        self.param_types = Some(types.into());
        self
    }

    /// Declare result types
    #[must_use]
    pub fn with_result_types(mut self, types: impl Into<Vec<NativeType>>) -> Self {
        self.result_types = Some(types.into());
        self
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

#[derive(Debug, Default)]
struct DefaultSlot {
    module: Option<ModuleId>,
    instance: Option<InstanceId>,
}

/// Registry of loaded modules and live instances behind opaque handles
pub struct Bridge {
    config: BridgeConfig,
    engine: Engine,
    modules: RwLock<HashMap<ModuleId, Arc<Module>>>,
    instances: RwLock<HashMap<InstanceId, Arc<Mutex<Instance>>>>,
    default: Mutex<DefaultSlot>,
}

impl Bridge {
    /// Create a new bridge
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            engine: Engine::new(config.engine.clone()),
            config,
            modules: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            default: Mutex::new(DefaultSlot::default()),
        }
    }

    /// Get the bridge configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Load and register a module
    ///
    /// # Errors
    ///
    /// Returns `Load` if the bytes are rejected; nothing is registered
    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub fn load(&self, bytes: &[u8]) -> BridgeResult<ModuleId> {
        let module = self.engine.load(bytes).inspect_err(|e| {
            tracing::warn!(error = %e, "module rejected");
        })?;
        let id = ModuleId::new();
        tracing::info!(module = %id, hash = %module.hash().short(), "module registered");
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, module);
        Ok(id)
    }

    /// Load the configured asset, or the built-in `add` module
    ///
    /// # Errors
    ///
    /// Returns `Asset` if the configured file cannot be read, or `Load`
    pub fn load_asset(&self) -> BridgeResult<ModuleId> {
        let bytes = read_asset(self.config.asset_path.as_deref())?;
        self.load(&bytes)
    }

    /// Look up a registered module
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule` if the handle is not registered
    pub fn module(&self, id: ModuleId) -> BridgeResult<Arc<Module>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(BridgeError::UnknownModule(id))
    }

    /// Instantiate a registered module
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule` or `Instantiate`; no handle is produced
    #[tracing::instrument(skip(self, imports), fields(module = %module))]
    pub fn instantiate(&self, module: ModuleId, imports: &Imports) -> BridgeResult<InstanceId> {
        let module = self.module(module)?;
        let instance = self.engine.instantiate(module, imports)?;
        let id = instance.id();
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Mutex::new(instance)));
        tracing::info!(instance = %id, "instance registered");
        Ok(id)
    }

    /// Drop an instance; returns whether it was registered
    pub fn release(&self, id: InstanceId) -> bool {
        let removed = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            tracing::info!(instance = %id, "instance released");
        }
        removed
    }

    /// Drop a module; live instances keep their own reference
    pub fn release_module(&self, id: ModuleId) -> bool {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Number of registered modules
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of live instances
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn instance(&self, id: InstanceId) -> BridgeResult<Arc<Mutex<Instance>>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(BridgeError::UnknownInstance(id))
    }

    /// Signature of a function export
    ///
    /// # Errors
    ///
    /// Returns `UnknownInstance`, or a `TRAP` error if there is no such export
    pub fn signature(&self, instance: InstanceId, export: &str) -> BridgeResult<FuncType> {
        let handle = self.instance(instance)?;
        let guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .func_signature(export)
            .cloned()
            .ok_or_else(|| undefined_export(export))
    }

    /// Call an export with signed default marshalling
    ///
    /// # Errors
    ///
    /// See [`Bridge::call_export_with`]
    pub fn call_export(
        &self,
        instance: InstanceId,
        export: &str,
        args: &[NativeValue],
    ) -> BridgeResult<Vec<NativeValue>> {
        self.call_export_with(instance, export, args, &CallOptions::default())
    }

    /// Call an export
    ///
    /// Calls on one instance are serialized; calls on different instances
    /// run in parallel.
    ///
    /// # Errors
    ///
    /// Returns `UnknownInstance`, `Invoke` with `TypeMismatch` on a wrong
    /// argument count, `Marshal` if an argument does not fit its declared
    /// type (nothing runs in either case), or `Invoke`
    #[tracing::instrument(skip(self, args, options), fields(instance = %instance))]
    pub fn call_export_with(
        &self,
        instance: InstanceId,
        export: &str,
        args: &[NativeValue],
        options: &CallOptions,
    ) -> BridgeResult<Vec<NativeValue>> {
        let handle = self.instance(instance)?;
        let mut guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        let signature = guard
            .func_signature(export)
            .cloned()
            .ok_or_else(|| undefined_export(export))?;
        if args.len() != signature.params.len() {
            return Err(InvokeError::TypeMismatch {
                name: export.to_string(),
                found: args.iter().map(|a| a.val_type()).collect(),
                expected: signature,
            }
            .into());
        }
        let values = marshal_args(&signature, args, options.param_types.as_deref())?;

        let invoke = InvokeOptions {
            cancel: options.cancel.clone(),
            fuel: options.fuel,
        };
        let results = guard.invoke_with(export, &values, &invoke)?;
        Ok(unmarshal_results(&results, options.result_types.as_deref()))
    }

    /// Call an export on the blocking pool
    ///
    /// With a deadline (`timeout`, else the configured default) the call is
    /// cancelled through its token once the deadline passes and `Timeout`
    /// is returned; the instance stays usable.
    ///
    /// # Errors
    ///
    /// See [`Bridge::call_export_with`], plus `Timeout` and `Task`
    pub async fn call_export_async(
        self: &Arc<Self>,
        instance: InstanceId,
        export: &str,
        args: Vec<NativeValue>,
        timeout: Option<Duration>,
    ) -> BridgeResult<Vec<NativeValue>> {
        let token = CancellationToken::new();
        let options = CallOptions::new().with_cancel(token.clone());
        let bridge = Arc::clone(self);
        let name = export.to_string();
        let task = tokio::task::spawn_blocking(move || {
            bridge.call_export_with(instance, &name, &args, &options)
        });

        let joined = match timeout.or_else(|| self.config.timeout()) {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    token.cancel();
                    tracing::warn!(instance = %instance, export, ?limit, "call timed out");
                    return Err(BridgeError::Timeout {
                        export: export.to_string(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
            None => task.await,
        };
        joined.map_err(|e| BridgeError::Task(e.to_string()))?
    }

    /// The cached instance backing `add`, created on first use
    ///
    /// # Errors
    ///
    /// Returns error if the asset cannot be loaded or instantiated
    pub fn default_instance(&self) -> BridgeResult<InstanceId> {
        let mut slot = self.default.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = slot.instance {
            if self.instance(id).is_ok() {
                return Ok(id);
            }
        }
        let module = match slot.module {
            Some(id) if self.module(id).is_ok() => id,
            _ => self.load_asset()?,
        };
        slot.module = Some(module);
        let id = self.instantiate(module, &Imports::new())?;
        slot.instance = Some(id);
        tracing::info!(instance = %id, "default instance ready");
        Ok(id)
    }

    /// `add(a, b)` on the default instance
    ///
    /// # Errors
    ///
    /// Returns error if the default instance cannot be created or the call
    /// fails
    pub fn add(&self, a: i32, b: i32) -> BridgeResult<i32> {
        let id = self.default_instance()?;
        let results = self.call_export(id, "add", &[a.into(), b.into()])?;
        let sum = single_i32("add", &results)?;
        tracing::debug!(a, b, sum, "add");
        Ok(sum)
    }

    /// `add(a, b)` on the blocking pool, honouring the configured deadline
    ///
    /// # Errors
    ///
    /// See [`Bridge::add`] and [`Bridge::call_export_async`]
    pub async fn add_async(self: &Arc<Self>, a: i32, b: i32) -> BridgeResult<i32> {
        // may read the asset and instantiate while holding the default slot
        let bridge = Arc::clone(self);
        let id = tokio::task::spawn_blocking(move || bridge.default_instance())
            .await
            .map_err(|e| BridgeError::Task(e.to_string()))??;
        let results = self
            .call_export_async(id, "add", vec![a.into(), b.into()], None)
            .await?;
        single_i32("add", &results)
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

fn undefined_export(export: &str) -> BridgeError {
    InvokeError::Trap(Trap::new(TrapKind::UndefinedExport(export.to_string()))).into()
}

fn single_i32(export: &str, results: &[NativeValue]) -> BridgeResult<i32> {
    match results {
        [NativeValue::Int(v)] => i32::try_from(*v).map_err(|e| BridgeError::UnexpectedResult {
            export: export.to_string(),
            reason: e.to_string(),
        }),
        other => Err(BridgeError::UnexpectedResult {
            export: export.to_string(),
            reason: format!("expected one i32, got {:?}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wasmbridge_core::{ValType, Value};
    use wasmbridge_wasm::HostFunction;

    const CALC: &str = r#"(module
        (memory 1)
        (global $calls (mut i32) (i32.const 0))
        (func (export "div") (param i32 i32) (result i32)
          (global.set $calls (i32.add (global.get $calls) (i32.const 1)))
          (i32.div_s (local.get 0) (local.get 1)))
        (func (export "calls") (result i32) (global.get $calls))
        (func (export "widen") (param i32) (result i64) (i64.extend_i32_u (local.get 0)))
        (func (export "half") (param f32) (result f32) (f32.mul (local.get 0) (f32.const 0.5)))
        (func (export "spin") (loop (br 0))))"#;

    fn calc(bridge: &Bridge) -> InstanceId {
        let module = bridge.load(&wat::parse_str(CALC).unwrap()).unwrap();
        bridge.instantiate(module, &Imports::new()).unwrap()
    }

    #[test]
    fn test_add() {
        let bridge = Bridge::default();
        assert_eq!(bridge.add(17, 25).unwrap(), 42);
        assert_eq!(bridge.add(i32::MAX, 1).unwrap(), i32::MIN);
    }

    proptest! {
        #[test]
        fn prop_add_wraps(a in any::<i32>(), b in any::<i32>()) {
            let bridge = Bridge::default();
            prop_assert_eq!(bridge.add(a, b).unwrap(), a.wrapping_add(b));
        }
    }

    #[test]
    fn test_add_instance_is_cached() {
        let bridge = Bridge::default();
        for i in 0..10 {
            assert_eq!(bridge.add(i, i).unwrap(), 2 * i);
        }
        assert_eq!(bridge.instance_count(), 1);
        assert_eq!(bridge.module_count(), 1);

        let id = bridge.default_instance().unwrap();
        assert!(bridge.release(id));
        assert_eq!(bridge.add(1, 2).unwrap(), 3);
        assert_eq!(bridge.instance_count(), 1);
        assert_eq!(bridge.module_count(), 1);
    }

    #[test]
    fn test_add_with_missing_asset() {
        let bridge = Bridge::new(BridgeConfig::new().with_asset_path("/nonexistent/main.wasm"));
        let err = bridge.add(1, 2).unwrap_err();
        assert_eq!(err.code(), "ASSET_ERROR");
        assert_eq!(bridge.instance_count(), 0);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let bridge = Bridge::default();
        let err = bridge.load(b"not wasm").unwrap_err();
        assert_eq!(err.code(), "LOAD_ERROR");
        assert_eq!(bridge.module_count(), 0);
    }

    #[test]
    fn test_unknown_handles() {
        let bridge = Bridge::default();
        let err = bridge.instantiate(ModuleId::new(), &Imports::new()).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_HANDLE");
        let err = bridge.call_export(InstanceId::new(), "add", &[]).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_HANDLE");
        assert!(!bridge.release(InstanceId::new()));
    }

    #[test]
    fn test_trap_then_recover() {
        let bridge = Bridge::default();
        let id = calc(&bridge);
        let err = bridge.call_export(id, "div", &[1.into(), 0.into()]).unwrap_err();
        assert_eq!(err.code(), "TRAP");
        let ok = bridge.call_export(id, "div", &[10.into(), 2.into()]).unwrap();
        assert_eq!(ok, vec![NativeValue::Int(5)]);
        // the trapping call had already counted itself
        assert_eq!(bridge.call_export(id, "calls", &[]).unwrap(), vec![NativeValue::Int(2)]);
    }

    #[test]
    fn test_marshal_error_runs_nothing() {
        let bridge = Bridge::default();
        let id = calc(&bridge);
        let err = bridge
            .call_export(id, "div", &[NativeValue::Int(1 << 40), 1.into()])
            .unwrap_err();
        assert_eq!(err.code(), "MARSHAL_ERROR");
        assert_eq!(bridge.call_export(id, "calls", &[]).unwrap(), vec![NativeValue::Int(0)]);
    }

    #[test]
    fn test_wrong_arity_is_type_mismatch() {
        let bridge = Bridge::default();
        let id = calc(&bridge);
        let err = bridge.call_export(id, "div", &[1.into()]).unwrap_err();
        assert_eq!(err.code(), "TYPE_MISMATCH");
        assert!(matches!(
            err,
            BridgeError::Invoke(InvokeError::TypeMismatch { ref name, .. }) if name == "div"
        ));
        let err = bridge
            .call_export(id, "div", &[1.into(), 2.into(), 3.into()])
            .unwrap_err();
        assert_eq!(err.code(), "TYPE_MISMATCH");
        assert_eq!(bridge.call_export(id, "calls", &[]).unwrap(), vec![NativeValue::Int(0)]);

        let def = bridge.default_instance().unwrap();
        let err = bridge.call_export(def, "add", &[1.into()]).unwrap_err();
        assert_eq!(err.code(), "TYPE_MISMATCH");
    }

    #[test]
    fn test_unknown_export() {
        let bridge = Bridge::default();
        let id = calc(&bridge);
        let err = bridge.call_export(id, "mul", &[]).unwrap_err();
        assert_eq!(err.code(), "TRAP");
        assert!(bridge.signature(id, "mul").is_err());
        assert_eq!(
            bridge.signature(id, "div").unwrap(),
            FuncType::new([ValType::I32, ValType::I32], [ValType::I32])
        );
    }

    #[test]
    fn test_declared_types() {
        let bridge = Bridge::default();
        let id = calc(&bridge);
        let options = CallOptions::new().with_param_types([NativeType::U32]);
        let result = bridge
            .call_export_with(id, "widen", &[NativeValue::UInt(u64::from(u32::MAX))], &options)
            .unwrap();
        assert_eq!(result, vec![NativeValue::Int(i64::from(u32::MAX))]);

        let result = bridge.call_export(id, "half", &[NativeValue::Float(3.0)]).unwrap();
        assert_eq!(result, vec![NativeValue::Float(1.5)]);
        let err = bridge.call_export(id, "half", &[NativeValue::Float(0.1)]).unwrap_err();
        assert_eq!(err.code(), "MARSHAL_ERROR");
    }

    #[test]
    fn test_fuel_through_bridge() {
        let bridge = Bridge::default();
        let id = calc(&bridge);
        let err = bridge
            .call_export_with(id, "spin", &[], &CallOptions::new().with_fuel(100))
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Invoke(InvokeError::Trap(Trap { kind: TrapKind::OutOfFuel, .. }))
        ));
    }

    #[test]
    fn test_host_imports_through_bridge() {
        let bridge = Bridge::default();
        let module = bridge
            .load(
                &wat::parse_str(
                    r#"(module
                        (import "env" "twice" (func $twice (param i64) (result i64)))
                        (func (export "quad") (param i64) (result i64)
                          (call $twice (call $twice (local.get 0)))))"#,
                )
                .unwrap(),
            )
            .unwrap();
        let err = bridge.instantiate(module, &Imports::new()).unwrap_err();
        assert_eq!(err.code(), "LINK_ERROR");
        assert_eq!(bridge.instance_count(), 0);

        let mut imports = Imports::new();
        imports.func(
            "env",
            "twice",
            HostFunction::wrap([ValType::I64], [ValType::I64], |_ctx, args| {
                Ok(vec![Value::I64(args[0].as_i64().unwrap_or_default() * 2)])
            }),
        );
        let id = bridge.instantiate(module, &imports).unwrap();
        assert_eq!(
            bridge.call_export(id, "quad", &[NativeValue::Int(5)]).unwrap(),
            vec![NativeValue::Int(20)]
        );
    }

    #[tokio::test]
    async fn test_add_async() {
        let bridge = Arc::new(Bridge::default());
        assert_eq!(bridge.add_async(17, 25).await.unwrap(), 42);
        assert_eq!(bridge.add_async(i32::MAX, 1).await.unwrap(), i32::MIN);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_add_async_prepares_default_off_runtime() {
        let bridge = Arc::new(Bridge::default());
        assert_eq!(bridge.instance_count(), 0);
        assert_eq!(bridge.add_async(2, 3).await.unwrap(), 5);
        assert_eq!(bridge.add_async(4, 5).await.unwrap(), 9);
        assert_eq!(bridge.instance_count(), 1);

        let missing = BridgeConfig::new().with_asset_path("/nonexistent/add.wasm");
        let bridge = Arc::new(Bridge::new(missing));
        let err = bridge.add_async(1, 2).await.unwrap_err();
        assert_eq!(err.code(), "ASSET_ERROR");
    }

    #[tokio::test]
    async fn test_async_timeout_cancels() {
        let bridge = Arc::new(Bridge::default());
        let id = calc(&bridge);
        let err = bridge
            .call_export_async(id, "spin", vec![], Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");

        // the cancelled call releases the instance
        let ok = bridge
            .call_export_async(id, "div", vec![9.into(), 3.into()], None)
            .await
            .unwrap();
        assert_eq!(ok, vec![NativeValue::Int(3)]);
    }

    #[tokio::test]
    async fn test_configured_timeout() {
        let bridge = Arc::new(Bridge::new(BridgeConfig::new().with_timeout_ms(20)));
        let id = calc(&bridge);
        let err = bridge
            .call_export_async(id, "spin", vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_instances() {
        let bridge = Arc::new(Bridge::default());
        let module = bridge.load_asset().unwrap();
        let first = bridge.instantiate(module, &Imports::new()).unwrap();
        let second = bridge.instantiate(module, &Imports::new()).unwrap();

        let (a, b) = tokio::join!(
            bridge.call_export_async(first, "add", vec![1.into(), 2.into()], None),
            bridge.call_export_async(second, "add", vec![100.into(), 200.into()], None),
        );
        assert_eq!(a.unwrap(), vec![NativeValue::Int(3)]);
        assert_eq!(b.unwrap(), vec![NativeValue::Int(300)]);
    }
}
