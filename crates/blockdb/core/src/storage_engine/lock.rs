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

//! Resource Locks
//!
//! A [`Lock`] guards one named resource with a reentrant shared/exclusive lock held on
//! behalf of transactions. Acquisition blocks on a condition variable until the lock is
//! grantable or the caller's timeout elapses; there is no deadlock detector, a transaction
//! that times out is expected to roll back and release what it holds.
//!
//! Writers are served from a FIFO queue. While any writer is queued, transactions that do
//! not already hold the lock cannot take new read holds, which bounds writer starvation.
//! Upgrades (a reader asking for the write lock) jump to the front of the queue since they
//! only wait for the other readers to drain.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::storage_engine::lib::{StorageError, StorageResult, TransactionId};

#[derive(Debug, Default)]
struct LockState {
    /// Read hold count per transaction
    readers: HashMap<TransactionId, usize>,
    /// Exclusive holder and its hold count
    writer: Option<(TransactionId, usize)>,
    /// Transactions waiting for the write lock, served front first
    write_queue: VecDeque<TransactionId>,
}

impl LockState {
    fn holds_read(&self, txn: TransactionId) -> bool {
        self.readers.contains_key(&txn)
    }

    fn holds_write(&self, txn: TransactionId) -> bool {
        matches!(self.writer, Some((holder, _)) if holder == txn)
    }

    fn can_read(&self, txn: TransactionId) -> bool {
        match self.writer {
            Some((holder, _)) if holder != txn => false,
            Some(_) => true,
            // Existing holders re-enter freely, newcomers yield to queued writers
            None => self.holds_read(txn) || self.write_queue.is_empty(),
        }
    }

    fn can_write(&self, txn: TransactionId) -> bool {
        self.writer.is_none() && self.readers.keys().all(|&reader| reader == txn) && self.write_queue.front() == Some(&txn)
    }

    fn enqueue_writer(&mut self, txn: TransactionId) {
        if self.holds_read(txn) {
            self.write_queue.push_front(txn);
        } else {
            self.write_queue.push_back(txn);
        }
    }

    fn dequeue_writer(&mut self, txn: TransactionId) {
        self.write_queue.retain(|&waiting| waiting != txn);
    }

    fn add_reader(&mut self, txn: TransactionId) {
        *self.readers.entry(txn).or_insert(0) += 1;
    }
}

/// A reentrant read/write lock on one resource
pub struct Lock {
    name: String,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Lock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// Name of the guarded resource
    pub fn name(&self) -> &str {
        &self.name
    }

    fn timeout_error(&self, txn: TransactionId, start: Instant) -> StorageError {
        let elapsed = start.elapsed();
        debug!(resource = %self.name, txn = %txn, elapsed_ms = elapsed.as_millis() as u64, "lock timeout");
        StorageError::LockTimeout {
            resource: self.name.clone(),
            elapsed,
        }
    }

    /// Acquires a shared hold for `txn`, waiting at most `timeout` for an exclusive holder
    /// or queued writers to clear.
    pub fn lock_read(&self, txn: TransactionId, timeout: Duration) -> StorageResult<()> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = self.state.lock();

        loop {
            if state.can_read(txn) {
                state.add_reader(txn);
                trace!(resource = %self.name, txn = %txn, "read lock granted");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.timeout_error(txn, start));
            }
            self.cond.wait_until(&mut state, deadline);
        }
    }

    /// Acquires the exclusive hold for `txn`, normally as an upgrade of a read hold
    pub fn lock_write(&self, txn: TransactionId, timeout: Duration) -> StorageResult<()> {
        self.acquire_write(txn, timeout, false)
    }

    /// Acquires a shared and the exclusive hold in one step, so no other transaction can
    /// slip in between the two
    pub fn lock_read_and_write(&self, txn: TransactionId, timeout: Duration) -> StorageResult<()> {
        self.acquire_write(txn, timeout, true)
    }

    fn acquire_write(&self, txn: TransactionId, timeout: Duration, with_read: bool) -> StorageResult<()> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = self.state.lock();

        if state.holds_write(txn) {
            if let Some((_, count)) = state.writer.as_mut() {
                *count += 1;
            }
            if with_read {
                state.add_reader(txn);
            }
            return Ok(());
        }

        state.enqueue_writer(txn);
        loop {
            if state.can_write(txn) {
                state.dequeue_writer(txn);
                state.writer = Some((txn, 1));
                if with_read {
                    state.add_reader(txn);
                }
                trace!(resource = %self.name, txn = %txn, "write lock granted");
                return Ok(());
            }
            if Instant::now() >= deadline {
                state.dequeue_writer(txn);
                // Readers held back by this writer may proceed now
                self.cond.notify_all();
                return Err(self.timeout_error(txn, start));
            }
            self.cond.wait_until(&mut state, deadline);
        }
    }

    /// Releases one shared hold of `txn`.
    ///
    /// Releasing a hold that is not there is logged and reported as `false`; cleanup paths
    /// call this and must not fail on a second release.
    pub fn unlock_read(&self, txn: TransactionId) -> bool {
        let mut state = self.state.lock();
        let released = match state.readers.get_mut(&txn) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                state.readers.remove(&txn);
                true
            }
            None => false,
        };
        drop(state);

        if released {
            self.cond.notify_all();
        } else {
            warn!(resource = %self.name, txn = %txn, "unlock_read without a read hold");
        }
        released
    }

    /// Releases one exclusive hold of `txn`, with the same tolerance as [`Lock::unlock_read`]
    pub fn unlock_write(&self, txn: TransactionId) -> bool {
        let mut state = self.state.lock();
        let released = match state.writer {
            Some((holder, count)) if holder == txn => {
                state.writer = if count > 1 { Some((holder, count - 1)) } else { None };
                true
            }
            _ => false,
        };
        drop(state);

        if released {
            self.cond.notify_all();
        } else {
            warn!(resource = %self.name, txn = %txn, "unlock_write without the write hold");
        }
        released
    }

    pub fn is_read_locked_by(&self, txn: TransactionId) -> bool {
        self.state.lock().holds_read(txn)
    }

    pub fn is_write_locked_by(&self, txn: TransactionId) -> bool {
        self.state.lock().holds_write(txn)
    }

    /// Number of transactions holding a shared hold
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Number of transactions queued for the write lock
    pub fn waiting_writers(&self) -> usize {
        self.state.lock().write_queue.len()
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.readers.is_empty() && state.writer.is_none() && state.write_queue.is_empty()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("readers", &state.readers.len())
            .field("writer", &state.writer.map(|(holder, _)| holder))
            .field("waiting_writers", &state.write_queue.len())
            .finish()
    }
}

/// Named lock table handing out one shared [`Lock`] per resource
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Lock>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `name`, created on first use
    pub fn lock(&self, name: &str) -> Arc<Lock> {
        let mut locks = self.locks.lock();
        locks.entry(name.to_string()).or_insert_with(|| Arc::new(Lock::new(name))).clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Lock>> {
        self.locks.lock().get(name).cloned()
    }

    /// Drops table entries nobody holds, waits on or references; returns how many
    pub fn remove_idle(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || !lock.is_idle());
        before - locks.len()
    }

    pub fn get_statistics(&self) -> LockStatistics {
        let locks = self.locks.lock();
        let mut statistics = LockStatistics {
            locks: locks.len(),
            ..LockStatistics::default()
        };

        for lock in locks.values() {
            let state = lock.state.lock();
            statistics.read_holds += state.readers.len();
            statistics.write_holds += usize::from(state.writer.is_some());
            statistics.waiting_writers += state.write_queue.len();
        }

        statistics
    }
}

/// Statistics about the lock table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStatistics {
    /// Number of locks in the table
    pub locks: usize,
    /// Number of transactions holding shared holds, summed over locks
    pub read_holds: usize,
    /// Number of locks with an exclusive holder
    pub write_holds: usize,
    /// Number of queued write requests
    pub waiting_writers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_readers_share() {
        let lock = Lock::new("table");
        lock.lock_read(TransactionId(1), SHORT).unwrap();
        lock.lock_read(TransactionId(2), SHORT).unwrap();
        assert_eq!(lock.reader_count(), 2);
        assert!(lock.unlock_read(TransactionId(1)));
        assert!(lock.unlock_read(TransactionId(2)));
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Lock::new("table");
        lock.lock_read_and_write(TransactionId(1), SHORT).unwrap();
        assert!(lock.is_write_locked_by(TransactionId(1)));
        assert!(lock.is_read_locked_by(TransactionId(1)));

        let result = lock.lock_read(TransactionId(2), SHORT);
        assert!(matches!(result, Err(StorageError::LockTimeout { .. })));
    }

    #[test]
    fn test_timeout_reports_resource_and_elapsed() {
        let lock = Lock::new("accounts");
        lock.lock_read_and_write(TransactionId(1), SHORT).unwrap();

        let start = Instant::now();
        match lock.lock_read_and_write(TransactionId(2), SHORT) {
            Err(StorageError::LockTimeout { resource, elapsed }) => {
                assert_eq!(resource, "accounts");
                assert!(elapsed >= SHORT);
                assert!(start.elapsed() >= SHORT);
            }
            other => panic!("expected lock timeout, got {other:?}"),
        }
        // The abandoned request does not linger in the queue
        assert_eq!(lock.waiting_writers(), 0);
    }

    #[test]
    fn test_upgrade_does_not_block_on_own_read() {
        let lock = Lock::new("table");
        lock.lock_read(TransactionId(1), SHORT).unwrap();
        lock.lock_write(TransactionId(1), SHORT).unwrap();
        assert!(lock.is_write_locked_by(TransactionId(1)));
    }

    #[test]
    fn test_upgrade_waits_for_other_readers() {
        let lock = Lock::new("table");
        lock.lock_read(TransactionId(1), SHORT).unwrap();
        lock.lock_read(TransactionId(2), SHORT).unwrap();
        assert!(lock.lock_write(TransactionId(1), SHORT).is_err());

        lock.unlock_read(TransactionId(2));
        lock.lock_write(TransactionId(1), SHORT).unwrap();
    }

    #[test]
    fn test_reentrant_holds() {
        let lock = Lock::new("table");
        lock.lock_read(TransactionId(1), SHORT).unwrap();
        lock.lock_read(TransactionId(1), SHORT).unwrap();
        lock.unlock_read(TransactionId(1));
        assert!(lock.is_read_locked_by(TransactionId(1)));
        lock.unlock_read(TransactionId(1));
        assert!(!lock.is_read_locked_by(TransactionId(1)));
    }

    #[test]
    fn test_double_release_is_tolerated() {
        let lock = Lock::new("table");
        lock.lock_read_and_write(TransactionId(1), SHORT).unwrap();
        assert!(lock.unlock_write(TransactionId(1)));
        assert!(!lock.unlock_write(TransactionId(1)));
        assert!(lock.unlock_read(TransactionId(1)));
        assert!(!lock.unlock_read(TransactionId(1)));
        assert!(!lock.unlock_read(TransactionId(9)));
    }

    #[test]
    fn test_waiting_writer_wakes_on_release() {
        let lock = Arc::new(Lock::new("table"));
        lock.lock_read(TransactionId(1), SHORT).unwrap();

        let writer_lock = lock.clone();
        let writer = thread::spawn(move || writer_lock.lock_read_and_write(TransactionId(2), LONG));

        while lock.waiting_writers() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        lock.unlock_read(TransactionId(1));

        writer.join().unwrap().unwrap();
        assert!(lock.is_write_locked_by(TransactionId(2)));
    }

    #[test]
    fn test_queued_writer_blocks_new_readers() {
        let lock = Arc::new(Lock::new("table"));
        lock.lock_read(TransactionId(1), SHORT).unwrap();

        let writer_lock = lock.clone();
        let writer = thread::spawn(move || writer_lock.lock_read_and_write(TransactionId(2), LONG));

        while lock.waiting_writers() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        // A newcomer may not overtake the queued writer
        assert!(lock.lock_read(TransactionId(3), SHORT).is_err());
        // The existing reader may still re-enter
        lock.lock_read(TransactionId(1), SHORT).unwrap();

        lock.unlock_read(TransactionId(1));
        lock.unlock_read(TransactionId(1));
        writer.join().unwrap().unwrap();

        lock.unlock_write(TransactionId(2));
        lock.unlock_read(TransactionId(2));
        lock.lock_read(TransactionId(3), SHORT).unwrap();
    }

    #[test]
    fn test_writers_served_in_order() {
        let lock = Arc::new(Lock::new("table"));
        lock.lock_read_and_write(TransactionId(1), SHORT).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for txn in [2u64, 3u64] {
            let worker_lock = lock.clone();
            let worker_order = order.clone();
            handles.push(thread::spawn(move || {
                worker_lock.lock_read_and_write(TransactionId(txn), LONG).unwrap();
                worker_order.lock().push(txn);
                worker_lock.unlock_write(TransactionId(txn));
                worker_lock.unlock_read(TransactionId(txn));
            }));
            // Make the queue order deterministic
            while lock.waiting_writers() < (txn - 1) as usize {
                thread::sleep(Duration::from_millis(1));
            }
        }

        lock.unlock_write(TransactionId(1));
        lock.unlock_read(TransactionId(1));
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![2, 3]);
    }

    #[test]
    fn test_lock_manager_shares_locks() {
        let manager = LockManager::new();
        let a = manager.lock("users");
        let b = manager.lock("users");
        assert!(Arc::ptr_eq(&a, &b));

        a.lock_read(TransactionId(1), SHORT).unwrap();
        let stats = manager.get_statistics();
        assert_eq!(stats.locks, 1);
        assert_eq!(stats.read_holds, 1);

        drop(b);
        a.unlock_read(TransactionId(1));
        assert_eq!(manager.remove_idle(), 0);
        drop(a);
        assert_eq!(manager.remove_idle(), 1);
        assert!(manager.get("users").is_none());
    }
}
