//! wasmbridge WASM execution core
//!
//! A self-contained WebAssembly interpreter: binaries are decoded and
//! type-checked once into an immutable [`Module`], instantiated with
//! host-provided imports into an [`Instance`], and driven through
//! [`Instance::invoke`]. Execution is bounded by call depth, operand stack,
//! memory cap, optional fuel and a cooperative cancellation token.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod fuel;
pub mod host;
pub mod instance;
pub mod instr;
pub mod load;
pub mod memory;
pub mod numeric;
pub mod reader;
pub mod trap;
pub mod types;

mod exec;
mod validate;

pub use engine::{Engine, EngineConfig};
pub use fuel::{FuelError, FuelMeter};
pub use host::{HostContext, HostError, HostFn, HostFunction, ImportValue, Imports};
pub use instance::{
    instantiate, ExecutionState, Instance, InstanceConfig, InstantiationError, InvokeError,
    InvokeOptions, LinkError,
};
pub use load::{load, LoadConfig, LoadError, Module, WasmFeature};
pub use memory::{LinearMemory, MemoryError, MemoryLimit};
pub use trap::{Trap, TrapKind};
pub use types::{Export, ExportSignature, ExternKind, Import, ImportDesc};

pub use tokio_util::sync::CancellationToken;
pub use wasmbridge_core::{FuncType, ValType, Value};
