//! C ABI for platform shells.
//!
//! Every function returns [`WASMBRIDGE_OK`] or [`WASMBRIDGE_ERROR`]; on
//! error the message, prefixed with its code, is available from
//! [`wasmbridge_last_error`] on the same thread.

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use once_cell::sync::OnceCell;
use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char};
use std::ptr;

/// Success
pub const WASMBRIDGE_OK: i32 = 0;
/// Failure; see `wasmbridge_last_error`
pub const WASMBRIDGE_ERROR: i32 = -1;

static BRIDGE: OnceCell<Bridge> = OnceCell::new();

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// The process-wide bridge, created with defaults on first use
pub fn global() -> &'static Bridge {
    BRIDGE.get_or_init(Bridge::default)
}

fn record(result: BridgeResult<()>) -> i32 {
    match result {
        Ok(()) => {
            LAST_ERROR.with(|slot| slot.borrow_mut().take());
            WASMBRIDGE_OK
        }
        Err(err) => {
            tracing::warn!(code = err.code(), error = %err, "bridge call failed");
            let message = format!("{}: {}", err.code(), err).replace('\0', " ");
            LAST_ERROR.with(|slot| *slot.borrow_mut() = CString::new(message).ok());
            WASMBRIDGE_ERROR
        }
    }
}

fn init(config_path: Option<&CStr>) -> BridgeResult<()> {
    let config = match config_path {
        None => BridgeConfig::default(),
        Some(path) => {
            let path = path
                .to_str()
                .map_err(|e| BridgeError::Config(e.to_string()))?;
            BridgeConfig::from_json_file(path)?
        }
    };
    BRIDGE
        .set(Bridge::new(config))
        .map_err(|_| BridgeError::Config("bridge already initialised".to_string()))?;
    global().default_instance()?;
    Ok(())
}

/// Create the bridge and its default instance
///
/// `config_path` may be null for defaults.
///
/// # Safety
///
/// `config_path` must be null or point to a NUL-terminated string valid for
/// the duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wasmbridge_init(config_path: *const c_char) -> i32 {
    let path = if config_path.is_null() {
        None
    } else {
        // SAFETY: non-null and NUL-terminated per the contract above
        Some(unsafe { CStr::from_ptr(config_path) })
    };
    record(init(path))
}

/// `add(a, b)` on the default instance, written to `out`
///
/// # Safety
///
/// `out` must be null or valid for a write of one `i32`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn wasmbridge_add(a: i32, b: i32, out: *mut i32) -> i32 {
    let result = if out.is_null() {
        Err(BridgeError::Config("null output pointer".to_string()))
    } else {
        global().add(a, b).map(|sum| {
            // SAFETY: non-null and writable per the contract above
            unsafe { out.write(sum) };
        })
    };
    record(result)
}

/// Message of the last failed call on this thread, or null
///
/// The pointer stays valid until the next bridge call on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn wasmbridge_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_error() -> Option<String> {
        let ptr = wasmbridge_last_error();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
        }
    }

    #[test]
    fn test_ffi_lifecycle() {
        assert_eq!(unsafe { wasmbridge_init(ptr::null()) }, WASMBRIDGE_OK);
        assert!(last_error().is_none());

        assert_eq!(unsafe { wasmbridge_init(ptr::null()) }, WASMBRIDGE_ERROR);
        assert!(last_error().unwrap().starts_with("CONFIG_ERROR"));

        let mut out = 0;
        assert_eq!(unsafe { wasmbridge_add(17, 25, &mut out) }, WASMBRIDGE_OK);
        assert_eq!(out, 42);
        assert!(last_error().is_none());

        assert_eq!(unsafe { wasmbridge_add(i32::MAX, 1, &mut out) }, WASMBRIDGE_OK);
        assert_eq!(out, i32::MIN);

        assert_eq!(
            unsafe { wasmbridge_add(1, 2, ptr::null_mut()) },
            WASMBRIDGE_ERROR
        );
        assert!(last_error().unwrap().contains("null output pointer"));
        assert_eq!(global().instance_count(), 1);
    }
}
