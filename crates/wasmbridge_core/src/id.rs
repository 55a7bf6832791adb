//! Opaque handles handed across the bridge.
//!
//! Handles are UUIDs rendered with a kind prefix so a platform shell can
//! round-trip them as strings.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

fn parse_prefixed(s: &str, prefix: &str) -> Result<Uuid, CoreError> {
    let rest = s.strip_prefix(prefix).ok_or_else(|| CoreError::InvalidId {
        reason: format!("expected prefix '{}' in '{}'", prefix, s),
    })?;
    Uuid::parse_str(rest).map_err(|e| CoreError::InvalidId {
        reason: e.to_string(),
    })
}

/// Module identifier - names one loaded, validated module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(Uuid);

impl ModuleId {
    /// Create a new random ModuleId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ModuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mod_{}", self.0)
    }
}

impl FromStr for ModuleId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, "mod_").map(Self)
    }
}

/// Instance identifier - names one live instantiation held by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new random InstanceId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inst_{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, "inst_").map(Self)
    }
}
