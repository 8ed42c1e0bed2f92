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

//! BlockDB Core Library
//!
//! A transactional block-storage engine. Values live in fixed-size blocks of a [`Store`];
//! a [`Transaction`] takes [`Lock`]s on the resources it touches, buffers its block writes
//! until commit and defers inode and block reclamation until its outcome is known.

pub mod storage_engine;

pub use storage_engine::{
    Block, BlockHandle, BlockId, BlockStorage, CommitPolicy, Inode, InodeCursor, Lock, LockManager, StorageConfig, StorageError, StorageResult, Store, StoreId, Transaction,
    TransactionId, TransactionState, WriteBlock,
};
