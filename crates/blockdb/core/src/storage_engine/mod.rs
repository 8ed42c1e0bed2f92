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

// Storage Engine Module
// Transactional block storage: a block store with reference-counted frames, per-resource
// read/write locks, inode chains for large values and the transactions tying them together.

pub mod block;
pub mod file_format;
pub mod inode;
pub mod lib;
pub mod lock;
pub mod memory;
pub mod store;
pub mod transaction;

// Public exports
pub use block::{Block, BlockHandle, CommitPolicy, WriteBlock};
pub use file_format::FileFormat;
pub use inode::{CHAIN_HEADER_SIZE, Inode, InodeCursor};
pub use lib::{BlockId, BlockStorage, DEFAULT_BLOCK_SIZE, DEFAULT_LOCK_TIMEOUT_MS, MIN_BLOCK_SIZE, StorageConfig, StorageError, StorageResult, StoreId, TransactionId, calculate_checksum};
pub use lock::{Lock, LockManager, LockStatistics};
pub use memory::MemoryStorage;
pub use store::{Store, StoreStats, StoreStatsSnapshot};
pub use transaction::{Transaction, TransactionState};
