//! wasmbridge Core Types
//!
//! Pure types shared by the execution core and the host bridge.
//! Nothing in this crate performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;
pub mod value;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use hash::{Hash, HashError};
pub use id::{InstanceId, ModuleId};
pub use value::{FuncType, ValType, Value};
