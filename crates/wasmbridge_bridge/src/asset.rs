//! Module bytes backing the `add` bridge method.

use crate::error::{BridgeError, BridgeResult};
use std::path::Path;

/// Built-in module exporting `add: (i32, i32) -> i32`
///
/// `(module (func (export "add") (param i32 i32) (result i32)
///    local.get 0 local.get 1 i32.add))`
pub const ADD_MODULE: &[u8] = &[
    0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
    0x01, 0x07, 0x01, 0x60, 0x02, 0x7F, 0x7F, 0x01, 0x7F, // type
    0x03, 0x02, 0x01, 0x00, // function
    0x07, 0x07, 0x01, 0x03, b'a', b'd', b'd', 0x00, 0x00, // export
    0x0A, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B, // code
];

/// Read module bytes from a bundled asset, or use the built-in module
///
/// # Errors
///
/// Returns error if a configured asset cannot be read
pub fn read_asset(path: Option<&Path>) -> BridgeResult<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).map_err(|e| BridgeError::Asset {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        None => Ok(ADD_MODULE.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmbridge_wasm::{ExternKind, ValType, load};

    #[test]
    fn test_builtin_module_loads() {
        let module = load(ADD_MODULE).unwrap();
        let export = module.export("add").unwrap();
        assert_eq!(export.kind, ExternKind::Func);
        let sig = module.func_type(export.index).unwrap();
        assert_eq!(sig.params, vec![ValType::I32, ValType::I32]);
        assert_eq!(sig.results, vec![ValType::I32]);
    }

    #[test]
    fn test_missing_asset() {
        let err = read_asset(Some(Path::new("/nonexistent/main.wasm"))).unwrap_err();
        assert_eq!(err.code(), "ASSET_ERROR");
        assert_eq!(read_asset(None).unwrap(), ADD_MODULE);
    }
}
