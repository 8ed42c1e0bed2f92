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

// Block handles
// A Block is a reference-counted, read-only view of a cached frame owned by a Store. A
// WriteBlock stages mutations to one block in a private buffer and publishes them to the
// store according to its CommitPolicy: on release for auto-commit, on transaction commit for
// explicit transactions.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};

use crate::storage_engine::lib::{BlockId, StorageError, StorageResult, TransactionId};
use crate::storage_engine::store::Store;

/// Arena slot holding the committed bytes of one block
pub(crate) struct BlockFrame {
    id: BlockId,
    data: RwLock<Vec<u8>>,
    ref_count: AtomicUsize,
    /// Set while a publish is rewriting this frame
    dirty: AtomicBool,
}

impl BlockFrame {
    pub(crate) fn new(id: BlockId, data: Vec<u8>) -> Self {
        Self {
            id,
            data: RwLock::new(data),
            ref_count: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> BlockId {
        self.id
    }

    pub(crate) fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // Undo the wrap-around; an unbalanced release is a bug, not a reason to corrupt the count
            self.ref_count.fetch_add(1, Ordering::AcqRel);
            error!(block = %self.id, "block released more often than acquired");
        }
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub(crate) fn replace_data(&self, bytes: &[u8]) {
        self.data.write().copy_from_slice(bytes);
    }
}

fn check_range(id: BlockId, len: usize, offset: usize, count: usize) -> StorageResult<()> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(StorageError::InvalidOperation(format!(
            "range {}..{} out of bounds for block {} of {} bytes",
            offset,
            offset.saturating_add(count),
            id,
            len
        ))),
    }
}

/// A shared, read-only handle to a block owned by a [`Store`].
///
/// Every handle counts as one acquisition of the underlying frame; dropping the handle
/// releases it exactly once. Cloning acquires again.
pub struct Block {
    store: Arc<Store>,
    frame: Arc<BlockFrame>,
}

impl Block {
    /// Wraps a frame that the caller has already acquired
    pub(crate) fn from_acquired(store: Arc<Store>, frame: Arc<BlockFrame>) -> Self {
        Self { store, frame }
    }

    pub fn id(&self) -> BlockId {
        self.frame.id
    }

    /// The store owning this block
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Number of live handles on this block
    pub fn ref_count(&self) -> usize {
        self.frame.ref_count()
    }

    pub fn len(&self) -> usize {
        self.frame.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `buffer.len()` bytes starting at `offset`
    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> StorageResult<()> {
        let data = self.frame.data.read();
        check_range(self.id(), data.len(), offset, buffer.len())?;
        buffer.copy_from_slice(&data[offset..offset + buffer.len()]);
        Ok(())
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.frame.data.read())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.frame.data.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn frame_for_test(&self) -> Arc<BlockFrame> {
        self.frame.clone()
    }
}

impl Clone for Block {
    fn clone(&self) -> Self {
        self.frame.acquire();
        Self {
            store: self.store.clone(),
            frame: self.frame.clone(),
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.frame.release();
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("store", &self.store.id()).field("id", &self.id()).field("ref_count", &self.ref_count()).finish()
    }
}

/// When a [`WriteBlock`]'s mutations reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Published as soon as the holding operation releases the write block
    AutoCommit,
    /// Buffered in the owning transaction until it commits
    Explicit,
}

struct WriteBlockInner {
    block: Block,
    policy: CommitPolicy,
    owner: TransactionId,
    buffer: Mutex<Vec<u8>>,
    /// Buffer holds mutations not yet published
    dirty: AtomicBool,
}

impl WriteBlockInner {
    fn flush(&self) -> StorageResult<()> {
        let buffer = self.buffer.lock();
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        self.block.store.publish(&self.block.frame, &buffer)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for WriteBlockInner {
    fn drop(&mut self) {
        if self.policy == CommitPolicy::AutoCommit && self.dirty.load(Ordering::Acquire) {
            if let Err(e) = self.flush() {
                warn!(block = %self.block.id(), txn = %self.owner, error = %e, "failed to flush auto-commit block on release");
            }
        }
    }
}

/// A block staged for mutation under a [`CommitPolicy`].
///
/// Clones share one staging buffer, so every clone is the same write block.
#[derive(Clone)]
pub struct WriteBlock {
    inner: Arc<WriteBlockInner>,
}

impl WriteBlock {
    /// Stage `block` for mutation; the staging buffer starts as a copy of the committed bytes
    pub(crate) fn new(block: Block, policy: CommitPolicy, owner: TransactionId) -> Self {
        let buffer = block.to_vec();
        Self {
            inner: Arc::new(WriteBlockInner {
                block,
                policy,
                owner,
                buffer: Mutex::new(buffer),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> BlockId {
        self.inner.block.id()
    }

    pub fn store(&self) -> &Arc<Store> {
        self.inner.block.store()
    }

    /// The committed block this write block stages changes for
    pub fn block(&self) -> &Block {
        &self.inner.block
    }

    pub fn policy(&self) -> CommitPolicy {
        self.inner.policy
    }

    /// Transaction that created this write block
    pub fn owner(&self) -> TransactionId {
        self.inner.owner
    }

    /// Whether there are staged mutations not yet published
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy staged bytes starting at `offset`
    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> StorageResult<()> {
        let data = self.inner.buffer.lock();
        check_range(self.id(), data.len(), offset, buffer.len())?;
        buffer.copy_from_slice(&data[offset..offset + buffer.len()]);
        Ok(())
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.buffer.lock())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.buffer.lock().clone()
    }

    /// Overwrite staged bytes starting at `offset`
    pub fn write(&self, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.inner.buffer.lock();
        check_range(self.id(), data.len(), offset, bytes.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.inner.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Mutate the whole staging buffer in place
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.inner.buffer.lock();
        let result = f(&mut data);
        self.inner.dirty.store(true, Ordering::Release);
        result
    }

    /// Ends the holding operation's use of this handle.
    ///
    /// Auto-commit write blocks publish their staged bytes here so the caller sees any
    /// I/O failure; explicit write blocks stay buffered in their transaction.
    pub fn release(self) -> StorageResult<()> {
        match self.inner.policy {
            CommitPolicy::AutoCommit => self.inner.flush(),
            CommitPolicy::Explicit => Ok(()),
        }
    }

    /// Publish staged bytes to the store
    pub(crate) fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }

    /// Drop staged mutations without publishing them
    pub(crate) fn discard(&self) {
        self.inner.dirty.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn same_as(&self, other: &WriteBlock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WriteBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBlock")
            .field("store", &self.store().id())
            .field("id", &self.id())
            .field("policy", &self.policy())
            .field("owner", &self.owner())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Result of a transactional block read: either the committed block or the reading
/// transaction's own buffered write block.
#[derive(Debug, Clone)]
pub enum BlockHandle {
    Committed(Block),
    Buffered(WriteBlock),
}

impl BlockHandle {
    pub fn id(&self) -> BlockId {
        match self {
            BlockHandle::Committed(block) => block.id(),
            BlockHandle::Buffered(write_block) => write_block.id(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        match self {
            BlockHandle::Committed(block) => block.store(),
            BlockHandle::Buffered(write_block) => write_block.store(),
        }
    }

    /// Whether this read observed the transaction's own uncommitted bytes
    pub fn is_buffered(&self) -> bool {
        matches!(self, BlockHandle::Buffered(_))
    }

    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> StorageResult<()> {
        match self {
            BlockHandle::Committed(block) => block.read(offset, buffer),
            BlockHandle::Buffered(write_block) => write_block.read(offset, buffer),
        }
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            BlockHandle::Committed(block) => block.with_data(f),
            BlockHandle::Buffered(write_block) => write_block.with_data(f),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_data(|data| data.to_vec())
    }
}

impl From<Block> for BlockHandle {
    fn from(block: Block) -> Self {
        BlockHandle::Committed(block)
    }
}

impl From<WriteBlock> for BlockHandle {
    fn from(write_block: WriteBlock) -> Self {
        BlockHandle::Buffered(write_block)
    }
}
