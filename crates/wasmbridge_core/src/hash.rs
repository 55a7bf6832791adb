//! BLAKE3 content hashes.
//!
//! A module is fingerprinted by the hash of its source bytes, and an
//! instance can report the hash of its linear memory so a caller can check
//! that a rejected call left memory untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LEN: usize = 32;
const SHORT_LEN: usize = 6;

/// BLAKE3 digest of a byte string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; LEN]);

impl Hash {
    /// Hash a byte string
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Full lowercase hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex digits, for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..SHORT_LEN])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = HashError;

    /// Parses the hex form, with or without a `blake3:` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("blake3:").unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| HashError::InvalidHex(e.to_string()))?;
        let found = bytes.len();
        let bytes: [u8; LEN] = bytes
            .try_into()
            .map_err(|_| HashError::InvalidLength { found })?;
        Ok(Self(bytes))
    }
}

/// Hash parse errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Not hex
    InvalidHex(String),
    /// Decoded to the wrong number of bytes
    InvalidLength {
        /// Decoded length in bytes
        found: usize,
    },
}

impl std::error::Error for HashError {}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHex(reason) => write!(f, "Invalid hex digest: {}", reason),
            Self::InvalidLength { found } => {
                write!(f, "Digest is {} bytes, expected {}", found, LEN)
            }
        }
    }
}
