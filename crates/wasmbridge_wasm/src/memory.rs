//! Linear memory and the embedder's memory cap.

use crate::trap::TrapKind;
use crate::types::{MAX_PAGES, MemoryType, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use wasmbridge_core::Hash;

/// Memory limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimit {
    /// Maximum memory in bytes
    pub max_bytes: u64,
}

impl MemoryLimit {
    /// Create a new memory limit
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Create a limit of whole 64 KiB pages
    #[must_use]
    pub fn with_pages(max_pages: u32) -> Self {
        Self::new(u64::from(max_pages) * PAGE_SIZE as u64)
    }

    /// Whole pages that fit within the limit
    #[must_use]
    pub fn max_pages(&self) -> u32 {
        let pages = self.max_bytes / PAGE_SIZE as u64;
        pages.min(u64::from(MAX_PAGES)) as u32
    }

    /// Check if byte count is within limit
    #[must_use]
    pub fn within_limit(&self, bytes: u64) -> bool {
        bytes <= self.max_bytes
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024) // 16MB default
    }
}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// Declared initial size is above the embedder's cap
    #[error("Initial memory of {pages} pages exceeds limit of {limit} pages")]
    InitialExceedsLimit {
        /// Declared initial pages
        pages: u32,
        /// Pages allowed by the cap
        limit: u32,
    },

    /// Allocation failed
    #[error("Out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested
        requested: u64,
    },
}

/// A growable, bounds-checked byte array in 64 KiB pages
#[derive(Debug, Clone)]
pub struct LinearMemory {
    data: Vec<u8>,
    max_pages: u32,
}

impl LinearMemory {
    /// Allocate the declared initial size
    ///
    /// # Errors
    ///
    /// Returns error if the initial size is above the cap or cannot be allocated
    pub fn new(ty: &MemoryType, limit: &MemoryLimit) -> Result<Self, MemoryError> {
        let cap = limit.max_pages();
        if ty.limits.min > cap {
            return Err(MemoryError::InitialExceedsLimit {
                pages: ty.limits.min,
                limit: cap,
            });
        }
        let bytes = ty.limits.min as usize * PAGE_SIZE;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| MemoryError::OutOfMemory {
                requested: bytes as u64,
            })?;
        data.resize(bytes, 0);
        Ok(Self {
            data,
            max_pages: ty.limits.max.unwrap_or(MAX_PAGES).min(cap),
        })
    }

    /// Current size in pages
    #[must_use]
    pub fn size_pages(&self) -> u32 {
        (self.data.len() / PAGE_SIZE) as u32
    }

    /// Largest size `grow` may reach
    #[must_use]
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Current contents
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Current contents, mutable
    #[must_use]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// BLAKE3 hash of the current contents
    #[must_use]
    pub fn checksum(&self) -> Hash {
        Hash::compute(&self.data)
    }

    /// Grow by `delta` pages, returning the old size, or `None` if the
    /// maximum would be exceeded or allocation fails
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let old = self.size_pages();
        let new = old.checked_add(delta)?;
        if new > self.max_pages {
            return None;
        }
        let extra = delta as usize * PAGE_SIZE;
        self.data.try_reserve_exact(extra).ok()?;
        self.data.resize(new as usize * PAGE_SIZE, 0);
        Some(old)
    }

    fn range(&self, addr: u32, offset: u32, len: usize) -> Result<Range<usize>, TrapKind> {
        let start = u64::from(addr) + u64::from(offset);
        let end = start + len as u64;
        if end > self.data.len() as u64 {
            return Err(TrapKind::OutOfBoundsMemory);
        }
        Ok(start as usize..end as usize)
    }

    /// Read `N` bytes at `addr + offset`
    ///
    /// # Errors
    ///
    /// Traps with `OutOfBoundsMemory` if any byte is past the end
    pub fn load<const N: usize>(&self, addr: u32, offset: u32) -> Result<[u8; N], TrapKind> {
        let range = self.range(addr, offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[range]);
        Ok(out)
    }

    /// Write `bytes` at `addr + offset`; nothing is written on failure
    ///
    /// # Errors
    ///
    /// Traps with `OutOfBoundsMemory` if any byte is past the end
    pub fn store(&mut self, addr: u32, offset: u32, bytes: &[u8]) -> Result<(), TrapKind> {
        let range = self.range(addr, offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Read `len` bytes at `addr`
    ///
    /// # Errors
    ///
    /// Traps with `OutOfBoundsMemory` if the range is past the end
    pub fn read(&self, addr: u32, len: usize) -> Result<&[u8], TrapKind> {
        let range = self.range(addr, 0, len)?;
        Ok(&self.data[range])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Limits;

    fn memory(min: u32, max: Option<u32>) -> LinearMemory {
        LinearMemory::new(
            &MemoryType {
                limits: Limits { min, max },
            },
            &MemoryLimit::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_memory_limit_pages() {
        assert_eq!(MemoryLimit::default().max_pages(), 256);
        assert_eq!(MemoryLimit::with_pages(10).max_bytes, 10 * 65536);
        assert_eq!(MemoryLimit::new(65536 + 1).max_pages(), 1);
        assert_eq!(MemoryLimit::new(u64::MAX).max_pages(), MAX_PAGES);
    }

    #[test]
    fn test_memory_limit_within_limit() {
        let limit = MemoryLimit::new(1024);
        assert!(limit.within_limit(1024));
        assert!(!limit.within_limit(1025));
    }

    #[test]
    fn test_initial_size() {
        let mem = memory(2, None);
        assert_eq!(mem.size_pages(), 2);
        assert_eq!(mem.data().len(), 2 * PAGE_SIZE);
        assert_eq!(mem.max_pages(), 256);
    }

    #[test]
    fn test_initial_above_cap() {
        let ty = MemoryType {
            limits: Limits { min: 4, max: None },
        };
        let err = LinearMemory::new(&ty, &MemoryLimit::with_pages(2)).unwrap_err();
        assert_eq!(err, MemoryError::InitialExceedsLimit { pages: 4, limit: 2 });
    }

    #[test]
    fn test_grow_to_declared_max() {
        let mut mem = memory(1, Some(3));
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.grow(1), Some(2));
        assert_eq!(mem.grow(1), None);
        assert_eq!(mem.size_pages(), 3);
        assert_eq!(mem.grow(0), Some(3));
    }

    #[test]
    fn test_load_store() {
        let mut mem = memory(1, None);
        mem.store(8, 4, &42u32.to_le_bytes()).unwrap();
        assert_eq!(u32::from_le_bytes(mem.load(12, 0).unwrap()), 42);
        assert_eq!(mem.read(12, 4).unwrap(), &[42, 0, 0, 0]);
    }

    #[test]
    fn test_out_of_bounds_writes_nothing() {
        let mut mem = memory(1, None);
        let before = mem.checksum();
        let last = (PAGE_SIZE - 2) as u32;
        assert_eq!(
            mem.store(last, 0, &[1, 2, 3, 4]),
            Err(TrapKind::OutOfBoundsMemory)
        );
        assert_eq!(mem.checksum(), before);
        assert_eq!(mem.load::<4>(u32::MAX, u32::MAX), Err(TrapKind::OutOfBoundsMemory));
    }
}
