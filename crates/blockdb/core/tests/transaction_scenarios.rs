// Transaction scenarios across stores, locks and threads
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use blockdb_core::storage_engine::MemoryStorage;
use blockdb_core::{BlockId, BlockStorage, Lock, StorageConfig, StorageError, StorageResult, Store, Transaction, TransactionState};

fn test_config() -> StorageConfig {
    StorageConfig {
        block_size: 512,
        lock_timeout_ms: 50,
        ..StorageConfig::default()
    }
}

/// Switches that make the matching storage calls fail with an I/O error
#[derive(Default)]
struct Faults {
    reads: AtomicBool,
    writes: AtomicBool,
    allocs: AtomicBool,
    frees: AtomicBool,
}

fn inject(switch: &AtomicBool, operation: &str) -> StorageResult<()> {
    if switch.load(Ordering::SeqCst) {
        return Err(io::Error::other(format!("injected {operation} failure")).into());
    }
    Ok(())
}

/// Memory storage whose calls can be made to fail
struct FailingStorage {
    inner: MemoryStorage,
    faults: Arc<Faults>,
}

impl BlockStorage for FailingStorage {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn read_block(&mut self, id: BlockId, buffer: &mut [u8]) -> StorageResult<()> {
        inject(&self.faults.reads, "read")?;
        self.inner.read_block(id, buffer)
    }

    fn write_block(&mut self, id: BlockId, buffer: &[u8]) -> StorageResult<()> {
        inject(&self.faults.writes, "write")?;
        self.inner.write_block(id, buffer)
    }

    fn allocate_block(&mut self) -> StorageResult<BlockId> {
        inject(&self.faults.allocs, "allocate")?;
        self.inner.allocate_block()
    }

    fn free_block(&mut self, id: BlockId) -> StorageResult<()> {
        inject(&self.faults.frees, "free")?;
        self.inner.free_block(id)
    }

    fn is_allocated(&mut self, id: BlockId) -> StorageResult<bool> {
        self.inner.is_allocated(id)
    }

    fn allocated_count(&mut self) -> StorageResult<u64> {
        self.inner.allocated_count()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }
}

#[test]
fn test_rolled_back_write_never_visible() {
    let store = Store::in_memory(test_config()).unwrap();
    let lock = Arc::new(Lock::new("block"));

    let mut t1 = Transaction::new(store.config());
    t1.lock_write(&lock).unwrap();
    let write_block = t1.allocate_row(&store).unwrap();
    let id = write_block.id();
    write_block.write(0, b"AB").unwrap();
    t1.commit().unwrap();

    let mut t2 = Transaction::new(store.config());
    t2.lock_write(&lock).unwrap();
    let handle = t2.read_block(&store, id).unwrap();
    assert_eq!(&handle.to_vec()[..2], b"AB");
    let write_block = t2.create_write_block(handle).unwrap();
    write_block.write(0, b"CD").unwrap();
    assert_eq!(&t2.read_block(&store, id).unwrap().to_vec()[..2], b"CD");
    t2.rollback();

    let mut t3 = Transaction::new(store.config());
    t3.lock_read(&lock).unwrap();
    assert_eq!(&t3.read_block(&store, id).unwrap().to_vec()[..2], b"AB");
    t3.commit().unwrap();
}

#[test]
fn test_lock_timeout_dooms_transaction() {
    let config = test_config();
    let resource = Arc::new(Lock::new("R"));
    let unrelated = Arc::new(Lock::new("S"));

    let mut t2 = Transaction::new(&config);
    t2.lock_write(&resource).unwrap();

    let mut t1 = Transaction::new(&config);
    t1.set_timeout(Duration::from_millis(50));
    let start = Instant::now();
    match t1.lock_write(&resource) {
        Err(StorageError::LockTimeout { resource: name, elapsed }) => {
            assert_eq!(name, "R");
            assert!(elapsed >= Duration::from_millis(50));
        }
        other => panic!("expected lock timeout, got {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(t1.is_rollback_only());
    assert!(matches!(t1.lock_read(&unrelated), Err(StorageError::RollbackOnly(_))));

    t1.rollback();
    t1.rollback();
    t2.commit().unwrap();
    assert_eq!(resource.reader_count(), 0);
}

#[test]
fn test_writes_invisible_until_write_lock_released() {
    let store = Store::in_memory(test_config()).unwrap();
    let lock = Arc::new(Lock::new("row"));

    let mut setup = Transaction::new(store.config());
    let write_block = setup.allocate_row(&store).unwrap();
    write_block.write(0, b"AB").unwrap();
    let id = write_block.id();
    setup.commit().unwrap();

    let mut writer = Transaction::new(store.config());
    writer.lock_write(&lock).unwrap();
    let write_block = writer.create_write_block(store.read_block(id).unwrap()).unwrap();
    write_block.write(0, b"XY").unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let reader_store = store.clone();
    let reader_lock = lock.clone();
    let reader = thread::spawn(move || {
        let mut xa = Transaction::new(reader_store.config());
        xa.set_timeout(Duration::from_secs(5));
        started_tx.send(()).unwrap();
        xa.lock_read(&reader_lock).unwrap();
        let bytes = xa.read_block(&reader_store, id).unwrap().to_vec();
        xa.commit().unwrap();
        bytes
    });

    started_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(30));
    // The reader is parked on the lock and the committed bytes are unchanged
    assert_eq!(&store.read_block(id).unwrap().to_vec()[..2], b"AB");
    writer.commit().unwrap();

    let seen = reader.join().unwrap();
    assert_eq!(&seen[..2], b"XY");
}

#[test]
fn test_concurrent_writers_serialize_on_lock() {
    let store = Store::in_memory(test_config()).unwrap();
    let lock = Arc::new(Lock::new("counter"));

    let mut setup = Transaction::new(store.config());
    let id = setup.allocate_row(&store).unwrap().id();
    setup.commit().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let lock = lock.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    let mut xa = Transaction::new(store.config());
                    xa.set_timeout(Duration::from_secs(10));
                    xa.lock_write(&lock).unwrap();
                    let handle = xa.read_block(&store, id).unwrap();
                    let write_block = xa.create_write_block(handle).unwrap();
                    write_block.with_data_mut(|data| data[0] += 1);
                    xa.commit().unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.read_block(id).unwrap().to_vec()[0], 40);
}

/// A store over failing storage holding one committed block the store has not cached yet
fn failing_store() -> (Arc<Store>, Arc<Faults>, BlockId) {
    let mut inner = MemoryStorage::new(512);
    let id = inner.allocate_block().unwrap();
    let mut payload = vec![0u8; 512];
    payload[..2].copy_from_slice(b"AB");
    inner.write_block(id, &payload).unwrap();

    let faults = Arc::new(Faults::default());
    let storage = FailingStorage {
        inner,
        faults: faults.clone(),
    };
    let store = Store::with_storage(test_config(), Box::new(storage)).unwrap();
    (store, faults, id)
}

fn assert_doomed(xa: &mut Transaction, lock: &Arc<Lock>) {
    assert!(xa.is_rollback_only());
    assert_eq!(lock.reader_count(), 0);
    assert!(!lock.is_write_locked());
    assert!(matches!(xa.lock_read(lock), Err(StorageError::RollbackOnly(_))));
    assert!(matches!(xa.commit(), Err(StorageError::RollbackOnly(_))));
    assert_eq!(xa.state(), TransactionState::Closed);
}

#[test]
fn test_commit_failure_closes_and_releases() {
    let (store, faults, _) = failing_store();
    let lock = Arc::new(Lock::new("row"));

    let mut xa = Transaction::new(store.config());
    xa.lock_write(&lock).unwrap();
    let write_block = xa.allocate_row(&store).unwrap();
    write_block.write(0, b"AB").unwrap();
    let id = write_block.id();

    faults.writes.store(true, Ordering::SeqCst);
    let error = xa.commit().unwrap_err();
    assert!(matches!(error, StorageError::CommitFailed(_)));
    assert!(error.is_io_failure());
    assert_eq!(xa.state(), TransactionState::Closed);
    assert!(!lock.is_write_locked());
    assert_eq!(lock.reader_count(), 0);

    // The failed block kept its previous contents
    faults.writes.store(false, Ordering::SeqCst);
    assert_eq!(&store.read_block(id).unwrap().to_vec()[..2], &[0, 0]);

    let mut retry = Transaction::new(store.config());
    retry.lock_write(&lock).unwrap();
    retry.commit().unwrap();
}

#[test]
fn test_read_failure_dooms_transaction() {
    let (store, faults, id) = failing_store();
    let lock = Arc::new(Lock::new("row"));

    let mut xa = Transaction::new(store.config());
    xa.lock_write(&lock).unwrap();
    faults.reads.store(true, Ordering::SeqCst);
    let error = xa.read_block(&store, id).unwrap_err();
    assert!(matches!(error, StorageError::Io(_)));
    assert_doomed(&mut xa, &lock);

    // Storage recovers, the block was never touched
    faults.reads.store(false, Ordering::SeqCst);
    let mut reader = Transaction::new(store.config());
    assert_eq!(&reader.read_block(&store, id).unwrap().to_vec()[..2], b"AB");
    reader.commit().unwrap();
}

#[test]
fn test_allocate_failure_dooms_transaction() {
    let (store, faults, _) = failing_store();
    let lock = Arc::new(Lock::new("row"));

    let mut xa = Transaction::new(store.config());
    xa.lock_write(&lock).unwrap();
    let first = xa.allocate_row(&store).unwrap().id();
    faults.allocs.store(true, Ordering::SeqCst);
    assert!(matches!(xa.allocate_row(&store), Err(StorageError::Io(_))));
    assert_doomed(&mut xa, &lock);

    // The block allocated before the failure went away with the rollback
    assert!(!store.is_allocated(first).unwrap());
    assert_eq!(store.allocated_blocks().unwrap(), 1);
}

#[test]
fn test_auto_commit_free_failure_dooms_transaction() {
    let (store, faults, id) = failing_store();
    let lock = Arc::new(Lock::new("row"));

    let mut xa = Transaction::auto_commit(store.config());
    xa.lock_write(&lock).unwrap();
    faults.frees.store(true, Ordering::SeqCst);
    assert!(matches!(xa.deallocate_block(&store, id), Err(StorageError::Io(_))));
    assert_doomed(&mut xa, &lock);

    faults.frees.store(false, Ordering::SeqCst);
    assert!(store.is_allocated(id).unwrap());
}

#[test]
fn test_missing_block_does_not_doom_transaction() {
    let (store, _, id) = failing_store();
    let lock = Arc::new(Lock::new("row"));

    let mut xa = Transaction::new(store.config());
    xa.lock_write(&lock).unwrap();
    assert!(matches!(xa.read_block(&store, BlockId(999)), Err(StorageError::BlockNotFound(_))));
    assert!(!xa.is_rollback_only());
    assert!(lock.is_write_locked_by(xa.id()));

    let handle = xa.read_block(&store, id).unwrap();
    let write_block = xa.create_write_block(handle).unwrap();
    write_block.write(0, b"CD").unwrap();
    xa.commit().unwrap();
    assert_eq!(&store.read_block(id).unwrap().to_vec()[..2], b"CD");
}
