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

// Transaction management module
// A transaction is one unit of work over one or more stores. It holds the resource locks it
// acquired, buffers write blocks of explicit transactions, and tracks inode and block
// lifecycle work that only happens once the outcome is known: deletions and deallocations on
// commit, freeing allocated blocks and restoring changed inodes on rollback. Locks are released in bulk at the end, write
// locks before read locks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::storage_engine::block::{Block, BlockHandle, CommitPolicy, WriteBlock};
use crate::storage_engine::inode::{Inode, InodeState};
use crate::storage_engine::lib::{BlockId, StorageConfig, StorageError, StorageResult, StoreId, TransactionId};
use crate::storage_engine::lock::Lock;
use crate::storage_engine::store::Store;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction can perform operations
    Active,
    /// Commit is applying pending work
    Committing,
    /// Rollback is discarding pending work
    RollingBack,
    /// Transaction finished; no operation is accepted any more
    Closed,
}

/// A unit of work holding locks and buffered block mutations
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    policy: CommitPolicy,
    timeout: Duration,
    sync_on_commit: bool,
    rollback_only: bool,
    read_locks: Vec<Arc<Lock>>,
    write_locks: Vec<Arc<Lock>>,
    /// Buffered write blocks of an explicit transaction, one per block
    write_blocks: BTreeMap<(StoreId, BlockId), WriteBlock>,
    /// Inodes reclaimed on commit
    delete_inodes: Vec<Inode>,
    /// Inodes reclaimed on rollback
    add_inodes: Vec<Inode>,
    /// Blocks freed on commit
    deallocate_blocks: Vec<(Arc<Store>, BlockId)>,
    /// Blocks allocated by an explicit transaction, freed on rollback
    allocate_blocks: Vec<(Arc<Store>, BlockId)>,
    /// Inodes changed by an explicit transaction with their state before the first change
    inode_snapshots: Vec<(Inode, InodeState)>,
}

fn position_of(locks: &[Arc<Lock>], lock: &Arc<Lock>) -> Option<usize> {
    locks.iter().position(|held| Arc::ptr_eq(held, lock))
}

fn contains_block(blocks: &[(Arc<Store>, BlockId)], store: &Store, id: BlockId) -> bool {
    blocks.iter().any(|(known, known_id)| known.id() == store.id() && *known_id == id)
}

fn remember_store(stores: &mut Vec<Arc<Store>>, store: &Arc<Store>) {
    if !stores.iter().any(|known| known.id() == store.id()) {
        stores.push(store.clone());
    }
}

impl Transaction {
    /// Create an explicit transaction; its writes stay buffered until [`Transaction::commit`]
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_policy(config, CommitPolicy::Explicit)
    }

    /// Create an auto-commit transaction; each write block publishes when released
    pub fn auto_commit(config: &StorageConfig) -> Self {
        Self::with_policy(config, CommitPolicy::AutoCommit)
    }

    fn with_policy(config: &StorageConfig, policy: CommitPolicy) -> Self {
        let id = TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed));
        trace!(txn = %id, ?policy, "transaction started");
        Self {
            id,
            state: TransactionState::Active,
            policy,
            timeout: config.lock_timeout(),
            sync_on_commit: config.sync_on_commit,
            rollback_only: false,
            read_locks: Vec::new(),
            write_locks: Vec::new(),
            write_blocks: BTreeMap::new(),
            delete_inodes: Vec::new(),
            add_inodes: Vec::new(),
            deallocate_blocks: Vec::new(),
            allocate_blocks: Vec::new(),
            inode_snapshots: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_auto_commit(&self) -> bool {
        self.policy == CommitPolicy::AutoCommit
    }

    /// Switch the commit policy for write blocks created from now on.
    ///
    /// Blocks already buffered stay buffered and are published at commit.
    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.policy = if auto_commit { CommitPolicy::AutoCommit } else { CommitPolicy::Explicit };
    }

    /// Lock acquisition timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn has_read_lock(&self, lock: &Arc<Lock>) -> bool {
        position_of(&self.read_locks, lock).is_some()
    }

    pub fn has_write_lock(&self, lock: &Arc<Lock>) -> bool {
        position_of(&self.write_locks, lock).is_some()
    }

    /// Number of buffered write blocks
    pub fn write_block_count(&self) -> usize {
        self.write_blocks.len()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(StorageError::InternalConsistency(format!("transaction {} used while {:?}", self.id, state))),
        }
    }

    fn ensure_usable(&self) -> StorageResult<()> {
        self.ensure_open()?;
        if self.rollback_only {
            return Err(StorageError::RollbackOnly(self.id));
        }
        Ok(())
    }

    /// Marks the transaction rollback-only after a failure and hands the error back
    fn doom(&mut self, error: StorageError) -> StorageError {
        debug!(txn = %self.id, error = %error, "operation failed, transaction is rollback-only");
        self.set_rollback_only();
        error
    }

    fn storage_failure(&mut self, error: StorageError) -> StorageError {
        if error.is_io_failure() { self.doom(error) } else { error }
    }

    /// Acquires a shared lock held until the transaction ends.
    ///
    /// A timeout marks the transaction rollback-only before the error is returned.
    pub fn lock_read(&mut self, lock: &Arc<Lock>) -> StorageResult<()> {
        self.ensure_usable()?;
        if self.has_read_lock(lock) {
            return Ok(());
        }

        lock.lock_read(self.id, self.timeout).map_err(|e| self.doom(e))?;
        self.read_locks.push(lock.clone());
        Ok(())
    }

    /// Acquires the exclusive lock, upgrading a held read lock or taking both at once
    pub fn lock_write(&mut self, lock: &Arc<Lock>) -> StorageResult<()> {
        self.ensure_usable()?;
        if self.has_write_lock(lock) {
            return Ok(());
        }

        if self.has_read_lock(lock) {
            lock.lock_write(self.id, self.timeout).map_err(|e| self.doom(e))?;
        } else {
            lock.lock_read_and_write(self.id, self.timeout).map_err(|e| self.doom(e))?;
            self.read_locks.push(lock.clone());
        }
        self.write_locks.push(lock.clone());
        Ok(())
    }

    /// Ends a read lock taken for a single auto-commit operation; explicit transactions
    /// keep it until they finish
    pub fn auto_commit_read(&mut self, lock: &Arc<Lock>) {
        if !self.is_auto_commit() {
            return;
        }
        if let Some(index) = position_of(&self.read_locks, lock) {
            let lock = self.read_locks.remove(index);
            lock.unlock_read(self.id);
        }
    }

    /// Ends a write operation of an auto-commit transaction: commits, then releases both
    /// holds on `lock` whether or not the commit succeeded
    pub fn auto_commit_write(&mut self, lock: &Arc<Lock>) -> StorageResult<()> {
        if !self.is_auto_commit() {
            return Ok(());
        }

        let held_read = position_of(&self.read_locks, lock).map(|index| self.read_locks.remove(index)).is_some();
        let held_write = position_of(&self.write_locks, lock).map(|index| self.write_locks.remove(index)).is_some();

        let result = if held_write { self.commit() } else { Ok(()) };

        if held_write {
            lock.unlock_write(self.id);
        }
        if held_read {
            lock.unlock_read(self.id);
        }
        result
    }

    /// Reads a block, returning this transaction's buffered write block when it has one
    pub fn read_block(&mut self, store: &Arc<Store>, id: BlockId) -> StorageResult<BlockHandle> {
        self.ensure_open()?;
        if let Some(write_block) = self.write_blocks.get(&(store.id(), id)) {
            return Ok(BlockHandle::Buffered(write_block.clone()));
        }

        let block = store.read_block(id).map_err(|e| self.storage_failure(e))?;
        Ok(BlockHandle::Committed(block))
    }

    /// Reads the block containing store-relative byte `address`
    pub fn read_block_at(&mut self, store: &Arc<Store>, address: u64) -> StorageResult<BlockHandle> {
        self.read_block(store, store.address_to_block_id(address))
    }

    /// The buffered write block for `id`, if this transaction has one
    pub fn get_write_block(&self, store: &Store, id: BlockId) -> Option<WriteBlock> {
        self.write_blocks.get(&(store.id(), id)).cloned()
    }

    fn wrap(&mut self, block: Block) -> WriteBlock {
        let write_block = WriteBlock::new(block, self.policy, self.id);
        if self.policy == CommitPolicy::Explicit {
            let key = (write_block.store().id(), write_block.id());
            self.write_blocks.insert(key, write_block.clone());
        }
        write_block
    }

    /// Returns the write block to mutate `block` through.
    ///
    /// The caller must hold the write lock guarding the block. Repeated calls for the same
    /// block return the same buffered write block.
    pub fn create_write_block(&mut self, block: impl Into<BlockHandle>) -> StorageResult<WriteBlock> {
        self.ensure_usable()?;
        let block = match block.into() {
            BlockHandle::Buffered(write_block) if write_block.owner() == self.id => return Ok(write_block),
            BlockHandle::Buffered(write_block) => {
                return Err(StorageError::InternalConsistency(format!(
                    "write block {} belongs to {}, not {}",
                    write_block.id(),
                    write_block.owner(),
                    self.id
                )));
            }
            BlockHandle::Committed(block) => block,
        };

        if let Some(existing) = self.write_blocks.get(&(block.store().id(), block.id())) {
            return Ok(existing.clone());
        }
        Ok(self.wrap(block))
    }

    /// Reads the block containing `address` and wraps it for mutation
    pub fn create_write_block_at(&mut self, store: &Arc<Store>, address: u64) -> StorageResult<WriteBlock> {
        let handle = self.read_block_at(store, address)?;
        self.create_write_block(handle)
    }

    /// Allocates a fresh block and wraps it for mutation
    pub fn allocate_row(&mut self, store: &Arc<Store>) -> StorageResult<WriteBlock> {
        self.ensure_usable()?;
        let block = store.allocate_row().map_err(|e| self.storage_failure(e))?;
        let write_block = self.wrap(block);
        if self.policy == CommitPolicy::Explicit {
            self.allocate_blocks.push((store.clone(), write_block.id()));
        }
        Ok(write_block)
    }

    /// Frees a block: at once for auto-commit, at commit otherwise
    pub fn deallocate_block(&mut self, store: &Arc<Store>, id: BlockId) -> StorageResult<()> {
        self.ensure_open()?;
        match self.policy {
            CommitPolicy::AutoCommit => store.free_block(id).map_err(|e| self.storage_failure(e)),
            CommitPolicy::Explicit => {
                if !contains_block(&self.deallocate_blocks, store, id) {
                    self.deallocate_blocks.push((store.clone(), id));
                }
                Ok(())
            }
        }
    }

    /// Schedule `inode` to be reclaimed when the transaction commits
    pub fn add_delete_inode(&mut self, inode: Inode) -> StorageResult<()> {
        self.ensure_open()?;
        if !self.delete_inodes.iter().any(|known| known.same_as(&inode)) {
            self.delete_inodes.push(inode);
        }
        Ok(())
    }

    /// Schedule `inode` to be reclaimed if the transaction rolls back
    pub fn add_add_inode(&mut self, inode: Inode) -> StorageResult<()> {
        self.ensure_open()?;
        if !self.add_inodes.iter().any(|known| known.same_as(&inode)) {
            self.add_inodes.push(inode);
        }
        Ok(())
    }

    /// Remembers the state of `inode` before its first change in an explicit transaction,
    /// so rollback can put it back
    pub(crate) fn track_inode(&mut self, inode: &Inode) -> StorageResult<()> {
        self.ensure_open()?;
        if self.policy == CommitPolicy::Explicit && !self.inode_snapshots.iter().any(|(known, _)| known.same_as(inode)) {
            self.inode_snapshots.push((inode.clone(), inode.snapshot()));
        }
        Ok(())
    }

    /// Discards buffered writes and releases every lock now.
    ///
    /// Later lock requests fail with [`StorageError::RollbackOnly`]; the transaction still
    /// has to be rolled back.
    pub fn set_rollback_only(&mut self) {
        if !self.rollback_only {
            debug!(txn = %self.id, "transaction marked rollback-only");
        }
        self.rollback_only = true;
        self.discard_write_blocks();
        self.release_locks();
    }

    /// Applies pending work and releases all locks.
    ///
    /// Pending inode deletions run first, then every buffered write block is flushed, then
    /// pending deallocations. Any failure stops the remaining steps and is returned as
    /// [`StorageError::CommitFailed`]; the transaction is closed and its locks released
    /// either way. A rollback-only transaction is rolled back instead.
    pub fn commit(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        if self.rollback_only {
            debug!(txn = %self.id, "commit of rollback-only transaction, rolling back");
            self.rollback();
            return Err(StorageError::RollbackOnly(self.id));
        }

        self.state = TransactionState::Committing;
        debug!(txn = %self.id, write_blocks = self.write_blocks.len(), "committing transaction");

        let result = self.apply_pending();

        self.discard_write_blocks();
        self.add_inodes.clear();
        self.delete_inodes.clear();
        self.deallocate_blocks.clear();
        self.allocate_blocks.clear();
        self.inode_snapshots.clear();
        self.release_locks();
        self.state = TransactionState::Closed;

        result.map_err(|e| {
            warn!(txn = %self.id, error = %e, "commit failed");
            StorageError::CommitFailed(Box::new(e))
        })
    }

    fn apply_pending(&mut self) -> StorageResult<()> {
        let mut stores: Vec<Arc<Store>> = Vec::new();

        for inode in std::mem::take(&mut self.delete_inodes) {
            // A freed block must not be rewritten by a later flush
            let store_id = inode.store().id();
            for id in inode.block_ids() {
                if let Some(write_block) = self.write_blocks.remove(&(store_id, id)) {
                    write_block.discard();
                }
            }
            remember_store(&mut stores, inode.store());
            inode.reclaim()?;
        }

        let deallocate_blocks = std::mem::take(&mut self.deallocate_blocks);
        for (store, id) in &deallocate_blocks {
            if let Some(write_block) = self.write_blocks.remove(&(store.id(), *id)) {
                write_block.discard();
            }
        }

        for write_block in self.write_blocks.values() {
            write_block.flush()?;
            remember_store(&mut stores, write_block.store());
        }

        for (store, id) in &deallocate_blocks {
            store.free_block(*id)?;
            remember_store(&mut stores, store);
        }

        if self.sync_on_commit {
            for store in &stores {
                store.sync()?;
            }
        }
        Ok(())
    }

    /// Discards buffered writes and pending work, frees the blocks this transaction
    /// allocated or added through inodes, restores changed inodes and releases all locks.
    /// Never fails; cleanup problems are logged. Rolling back a closed transaction does
    /// nothing.
    pub fn rollback(&mut self) {
        if self.state == TransactionState::Closed {
            trace!(txn = %self.id, "rollback of closed transaction ignored");
            return;
        }

        self.state = TransactionState::RollingBack;
        debug!(txn = %self.id, write_blocks = self.write_blocks.len(), "rolling back transaction");

        self.discard_write_blocks();

        let mut released = std::mem::take(&mut self.allocate_blocks);
        for inode in std::mem::take(&mut self.add_inodes) {
            for id in inode.block_ids() {
                if !contains_block(&released, inode.store(), id) {
                    released.push((inode.store().clone(), id));
                }
            }
            inode.restore(InodeState::default());
        }
        for (inode, snapshot) in std::mem::take(&mut self.inode_snapshots) {
            inode.restore(snapshot);
        }
        for (store, id) in &released {
            if let Err(e) = store.free_block(*id) {
                warn!(txn = %self.id, block = %id, error = %e, "failed to free block during rollback");
            }
        }

        self.delete_inodes.clear();
        self.deallocate_blocks.clear();
        self.release_locks();
        self.state = TransactionState::Closed;
    }

    fn discard_write_blocks(&mut self) {
        for write_block in self.write_blocks.values() {
            write_block.discard();
        }
        self.write_blocks.clear();
    }

    fn release_locks(&mut self) {
        let id = self.id;
        for lock in self.write_locks.drain(..) {
            lock.unlock_write(id);
        }
        for lock in self.read_locks.drain(..) {
            lock.unlock_read(id);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Closed {
            warn!(txn = %self.id, "transaction dropped while open, rolling back");
            self.rollback();
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("policy", &self.policy)
            .field("rollback_only", &self.rollback_only)
            .field("read_locks", &self.read_locks.len())
            .field("write_locks", &self.write_locks.len())
            .field("write_blocks", &self.write_blocks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> StorageConfig {
        StorageConfig {
            block_size: 512,
            lock_timeout_ms: 50,
            ..StorageConfig::default()
        }
    }

    fn committed_block(store: &Arc<Store>, bytes: &[u8]) -> BlockId {
        let mut xa = Transaction::new(store.config());
        let write_block = xa.allocate_row(store).unwrap();
        write_block.write(0, bytes).unwrap();
        let id = write_block.id();
        xa.commit().unwrap();
        id
    }

    #[test]
    fn test_read_your_writes() {
        let store = Store::in_memory(test_config()).unwrap();
        let id = committed_block(&store, b"AB");

        let mut xa = Transaction::new(store.config());
        let handle = xa.read_block(&store, id).unwrap();
        assert!(!handle.is_buffered());
        let write_block = xa.create_write_block(handle).unwrap();
        write_block.write(0, b"CD").unwrap();

        let reread = xa.read_block(&store, id).unwrap();
        assert!(reread.is_buffered());
        assert_eq!(&reread.to_vec()[..2], b"CD");
        // Others still see the committed bytes
        assert_eq!(&store.read_block(id).unwrap().to_vec()[..2], b"AB");
        xa.rollback();
    }

    #[test]
    fn test_write_block_reused_per_block() {
        let store = Store::in_memory(test_config()).unwrap();
        let id = committed_block(&store, b"AB");

        let mut xa = Transaction::new(store.config());
        let first = xa.create_write_block(store.read_block(id).unwrap()).unwrap();
        let second = xa.create_write_block(store.read_block(id).unwrap()).unwrap();
        let third = xa.create_write_block_at(&store, id.address(store.block_size()) + 3).unwrap();
        assert!(first.same_as(&second));
        assert!(first.same_as(&third));
        assert_eq!(xa.write_block_count(), 1);
        assert!(xa.get_write_block(&store, id).is_some());
        xa.rollback();
    }

    #[test]
    fn test_foreign_write_block_rejected() {
        let store = Store::in_memory(test_config()).unwrap();
        let id = committed_block(&store, b"AB");

        let mut owner = Transaction::new(store.config());
        let write_block = owner.create_write_block(store.read_block(id).unwrap()).unwrap();

        let mut other = Transaction::new(store.config());
        let result = other.create_write_block(write_block);
        assert!(matches!(result, Err(StorageError::InternalConsistency(_))));
        owner.rollback();
        other.rollback();
    }

    #[test]
    fn test_commit_publishes_and_closes() {
        let store = Store::in_memory(test_config()).unwrap();
        let lock = Arc::new(Lock::new("rows"));

        let mut xa = Transaction::new(store.config());
        xa.lock_write(&lock).unwrap();
        let write_block = xa.allocate_row(&store).unwrap();
        write_block.write(0, b"AB").unwrap();
        let id = write_block.id();
        assert_eq!(&store.read_block(id).unwrap().to_vec()[..2], &[0, 0]);

        xa.commit().unwrap();
        assert_eq!(xa.state(), TransactionState::Closed);
        assert_eq!(&store.read_block(id).unwrap().to_vec()[..2], b"AB");
        assert_eq!(lock.reader_count(), 0);
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_closed_transaction_rejects_work() {
        let store = Store::in_memory(test_config()).unwrap();
        let mut xa = Transaction::new(store.config());
        xa.commit().unwrap();

        assert!(matches!(xa.commit(), Err(StorageError::InternalConsistency(_))));
        assert!(matches!(xa.allocate_row(&store), Err(StorageError::InternalConsistency(_))));
        assert!(matches!(xa.lock_read(&Arc::new(Lock::new("r"))), Err(StorageError::InternalConsistency(_))));
    }

    #[test]
    fn test_lock_write_upgrades_and_combines() {
        let config = test_config();
        let upgraded = Arc::new(Lock::new("upgraded"));
        let combined = Arc::new(Lock::new("combined"));

        let mut xa = Transaction::new(&config);
        xa.lock_read(&upgraded).unwrap();
        xa.lock_write(&upgraded).unwrap();
        xa.lock_write(&combined).unwrap();

        assert!(xa.has_read_lock(&upgraded) && xa.has_write_lock(&upgraded));
        assert!(xa.has_read_lock(&combined) && xa.has_write_lock(&combined));
        assert!(combined.is_read_locked_by(xa.id()));

        // Repeated requests do not stack holds
        xa.lock_read(&combined).unwrap();
        xa.lock_write(&combined).unwrap();

        xa.rollback();
        for lock in [&upgraded, &combined] {
            assert_eq!(lock.reader_count(), 0);
            assert!(!lock.is_write_locked());
        }
    }

    #[test]
    fn test_timeout_makes_transaction_rollback_only() {
        let config = test_config();
        let lock = Arc::new(Lock::new("contended"));
        let other_lock = Arc::new(Lock::new("other"));

        let mut holder = Transaction::new(&config);
        holder.lock_write(&lock).unwrap();

        let mut waiter = Transaction::new(&config);
        waiter.lock_read(&other_lock).unwrap();
        assert!(matches!(waiter.lock_write(&lock), Err(StorageError::LockTimeout { .. })));
        assert!(waiter.is_rollback_only());
        // Locks were released immediately
        assert_eq!(other_lock.reader_count(), 0);
        assert!(matches!(waiter.lock_read(&other_lock), Err(StorageError::RollbackOnly(_))));

        assert!(matches!(waiter.commit(), Err(StorageError::RollbackOnly(_))));
        assert_eq!(waiter.state(), TransactionState::Closed);
        holder.commit().unwrap();
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let store = Store::in_memory(test_config()).unwrap();
        let lock = Arc::new(Lock::new("rows"));

        let mut xa = Transaction::new(store.config());
        xa.lock_write(&lock).unwrap();
        xa.set_rollback_only();
        xa.set_rollback_only();
        xa.rollback();
        xa.rollback();
        assert_eq!(xa.state(), TransactionState::Closed);
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_explicit_deallocate_waits_for_commit() {
        let store = Store::in_memory(test_config()).unwrap();
        let id = committed_block(&store, b"AB");

        let mut xa = Transaction::new(store.config());
        xa.deallocate_block(&store, id).unwrap();
        xa.deallocate_block(&store, id).unwrap();
        assert!(store.is_allocated(id).unwrap());
        xa.rollback();
        assert!(store.is_allocated(id).unwrap());

        let mut xa = Transaction::new(store.config());
        let write_block = xa.create_write_block(store.read_block(id).unwrap()).unwrap();
        write_block.write(0, b"ZZ").unwrap();
        xa.deallocate_block(&store, id).unwrap();
        xa.commit().unwrap();
        assert!(!store.is_allocated(id).unwrap());
    }

    #[test]
    fn test_rollback_frees_allocated_blocks() {
        let store = Store::in_memory(test_config()).unwrap();
        let kept = committed_block(&store, b"AB");

        let mut xa = Transaction::new(store.config());
        let ids: Vec<BlockId> = (0..3).map(|_| xa.allocate_row(&store).unwrap().id()).collect();
        // Freed once even when also scheduled for deallocation
        xa.deallocate_block(&store, ids[0]).unwrap();
        assert_eq!(store.allocated_blocks().unwrap(), 4);
        xa.rollback();

        assert_eq!(store.allocated_blocks().unwrap(), 1);
        assert!(store.is_allocated(kept).unwrap());
        assert!(ids.iter().all(|id| !store.is_allocated(*id).unwrap()));
    }

    #[test]
    fn test_auto_commit_publishes_on_release() {
        let store = Store::in_memory(test_config()).unwrap();
        let mut xa = Transaction::auto_commit(store.config());
        assert!(xa.is_auto_commit());

        let write_block = xa.allocate_row(&store).unwrap();
        let id = write_block.id();
        write_block.write(0, b"AB").unwrap();
        write_block.release().unwrap();

        assert_eq!(xa.write_block_count(), 0);
        assert_eq!(&store.read_block(id).unwrap().to_vec()[..2], b"AB");

        xa.deallocate_block(&store, id).unwrap();
        assert!(!store.is_allocated(id).unwrap());
        xa.commit().unwrap();
    }

    #[test]
    fn test_auto_commit_write_releases_lock() {
        let store = Store::in_memory(test_config()).unwrap();
        let lock = Arc::new(Lock::new("rows"));

        let mut xa = Transaction::auto_commit(store.config());
        xa.lock_write(&lock).unwrap();
        let write_block = xa.allocate_row(&store).unwrap();
        write_block.write(0, b"AB").unwrap();
        write_block.release().unwrap();

        xa.auto_commit_write(&lock).unwrap();
        assert_eq!(xa.state(), TransactionState::Closed);
        assert_eq!(lock.reader_count(), 0);
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_auto_commit_read_releases_only_in_auto_mode() {
        let config = test_config();
        let lock = Arc::new(Lock::new("rows"));

        let mut explicit = Transaction::new(&config);
        explicit.lock_read(&lock).unwrap();
        explicit.auto_commit_read(&lock);
        assert!(explicit.has_read_lock(&lock));
        explicit.rollback();

        let mut auto = Transaction::auto_commit(&config);
        auto.lock_read(&lock).unwrap();
        auto.auto_commit_read(&lock);
        assert!(!auto.has_read_lock(&lock));
        assert_eq!(lock.reader_count(), 0);
        auto.commit().unwrap();
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let store = Store::in_memory(test_config()).unwrap();
        let lock = Arc::new(Lock::new("rows"));
        let id = committed_block(&store, b"AB");

        {
            let mut xa = Transaction::new(store.config());
            xa.lock_write(&lock).unwrap();
            let write_block = xa.create_write_block(store.read_block(id).unwrap()).unwrap();
            write_block.write(0, b"CD").unwrap();
        }

        assert!(!lock.is_write_locked());
        assert_eq!(&store.read_block(id).unwrap().to_vec()[..2], b"AB");
    }

    #[test]
    fn test_sync_on_commit_with_file_store() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("sync.db"),
            sync_on_commit: true,
            ..test_config()
        };
        let store = Store::open(config.clone()).unwrap();
        let id = committed_block(&store, b"durable");
        drop(store);

        let store = Store::open(config).unwrap();
        assert_eq!(&store.read_block(id).unwrap().to_vec()[..7], b"durable");
    }

    #[test]
    fn test_set_timeout_overrides_config() {
        let mut xa = Transaction::new(&test_config());
        assert_eq!(xa.timeout(), Duration::from_millis(50));
        xa.set_timeout(Duration::from_secs(2));
        assert_eq!(xa.timeout(), Duration::from_secs(2));
        xa.set_auto_commit(true);
        assert!(xa.is_auto_commit());
        xa.rollback();
    }
}
