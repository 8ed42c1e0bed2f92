// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Common types and utilities for the storage engine

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest block size the engine accepts
pub const MIN_BLOCK_SIZE: usize = 512;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// Default lock timeout for new transactions
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Identifier of a block within one store.
///
/// Block 0 is never allocated; it doubles as the null link in block chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockId(pub u64);

impl BlockId {
    /// The null block id
    pub const NULL: BlockId = BlockId(0);

    /// Returns the raw block id value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Whether this is the null link
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Store-relative byte address of the first byte of this block
    pub fn address(&self, block_size: usize) -> u64 {
        self.0 * block_size as u64
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identifier of an open store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(pub u64);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store-{}", self.0)
    }
}

/// Identifier of a transaction, used as the lock holder identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xa-{}", self.0)
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the store file
    pub path: PathBuf,
    /// Size of each block payload in bytes
    pub block_size: usize,
    /// Number of unreferenced frames the store keeps cached
    pub block_cache_size: usize,
    /// Default lock acquisition timeout for new transactions
    pub lock_timeout_ms: u64,
    /// Whether commit syncs the backing file after flushing
    pub sync_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/blockdb.db"),
            block_size: DEFAULT_BLOCK_SIZE,
            block_cache_size: 1024,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            sync_on_commit: false,
        }
    }
}

impl StorageConfig {
    /// Default configuration for a store at `path`
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Lock timeout as a duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Checks that the configuration can back a store
    pub fn validate(&self) -> StorageResult<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(StorageError::InvalidConfig(format!(
                "block_size must be a power of two >= {}, got {}",
                MIN_BLOCK_SIZE, self.block_size
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(StorageError::InvalidConfig(format!("block_size {} is too large", self.block_size)));
        }
        if self.block_cache_size == 0 {
            return Err(StorageError::InvalidConfig("block_cache_size must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Error types specific to the storage engine
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("lock timeout on {resource} after {elapsed:?}")]
    LockTimeout { resource: String, elapsed: Duration },

    #[error("transaction {0} is rollback-only")]
    RollbackOnly(TransactionId),

    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("commit failed: {0}")]
    CommitFailed(#[source] Box<StorageError>),

    #[error("Block {0} not found")]
    BlockNotFound(BlockId),

    #[error("Corrupted storage: {0}")]
    Corruption(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    /// Whether a caller may retry the unit of work after rolling back
    pub fn is_recoverable(&self) -> bool {
        match self {
            StorageError::LockTimeout { .. } | StorageError::RollbackOnly(_) => true,
            StorageError::CommitFailed(inner) => inner.is_recoverable(),
            _ => false,
        }
    }

    /// Whether the backing storage failed, as opposed to a caller or locking error
    pub fn is_io_failure(&self) -> bool {
        match self {
            StorageError::Io(_) | StorageError::Corruption(_) => true,
            StorageError::CommitFailed(inner) => inner.is_io_failure(),
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Calculate CRC32 checksum for data integrity
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// A backing device for fixed-size blocks.
///
/// Implementations are driven by [`Store`](crate::storage_engine::Store), which
/// serializes access, so methods take `&mut self`.
pub trait BlockStorage: Send {
    /// Payload size of every block
    fn block_size(&self) -> usize;
    /// Fill `buffer` with the payload of block `id`
    fn read_block(&mut self, id: BlockId, buffer: &mut [u8]) -> StorageResult<()>;
    /// Overwrite the payload of block `id`
    fn write_block(&mut self, id: BlockId, buffer: &[u8]) -> StorageResult<()>;
    /// Reserve a zeroed block, reusing freed blocks first
    fn allocate_block(&mut self) -> StorageResult<BlockId>;
    /// Return block `id` to the free list
    fn free_block(&mut self, id: BlockId) -> StorageResult<()>;
    /// Whether block `id` is currently allocated
    fn is_allocated(&mut self, id: BlockId) -> StorageResult<bool>;
    /// Number of allocated blocks
    fn allocated_count(&mut self) -> StorageResult<u64>;
    /// Make previous writes durable
    fn sync(&mut self) -> StorageResult<()>;
}
