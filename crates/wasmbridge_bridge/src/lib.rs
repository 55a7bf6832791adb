//! wasmbridge host bridge
//!
//! The narrow boundary platform shells drive the execution core through:
//! opaque module and instance handles, checked native value marshalling,
//! a cancellable async call path and the cached `add` method. The [`ffi`]
//! module exposes the same surface as a C ABI.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod asset;
pub mod bridge;
pub mod config;
pub mod error;
pub mod ffi;
pub mod marshal;

pub use asset::{ADD_MODULE, read_asset};
pub use bridge::{Bridge, CallOptions};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use marshal::{MarshalError, NativeType, NativeValue};
