//! Bridge configuration.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wasmbridge_wasm::EngineConfig;

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Module backing `add`; the built-in module when unset
    pub asset_path: Option<PathBuf>,
    /// Deadline for async calls that do not pass their own
    pub timeout_ms: Option<u64>,
    /// Loader and instance limits
    pub engine: EngineConfig,
}

impl BridgeConfig {
    /// Create a new bridge config
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Set the asset path
    #[must_use]
    pub fn with_asset_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.asset_path = Some(path.into());
        self
    }

    /// Set the default async deadline
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the engine config
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Default async deadline
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_from_json_file() {
        let file = config_file(
            r#"{"asset_path": "main.wasm", "timeout_ms": 250, "engine": {"instance": {"fuel": 5000}}}"#,
        );
        let config = BridgeConfig::from_json_file(file.path()).unwrap();

        assert_eq!(config.asset_path, Some(PathBuf::from("main.wasm")));
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.engine.instance.fuel, Some(5000));
        assert_eq!(config.engine.instance.max_call_depth, 1024);
        assert_eq!(config.engine.instance.max_table_elements, 65536);
    }

    #[test]
    fn test_config_errors() {
        let err = BridgeConfig::from_json_file("/nonexistent/wasmbridge.json").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");

        let file = config_file("{ not json");
        let err = BridgeConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
