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

// Store module
// The Store owns a backing BlockStorage and an arena of cached block frames indexed by block
// id. Frames are reference counted by Block handles; a frame is only evicted once its count
// drops to zero. Allocation and deallocation go through the narrow read/allocate/free surface
// used by transactions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::storage_engine::block::{Block, BlockFrame};
use crate::storage_engine::file_format::FileFormat;
use crate::storage_engine::lib::{BlockId, BlockStorage, StorageConfig, StorageResult, StoreId};
use crate::storage_engine::memory::MemoryStorage;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Store statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Number of block reads served
    pub reads: AtomicU64,
    /// Number of blocks written to storage
    pub writes: AtomicU64,
    /// Number of reads served from the frame cache
    pub hits: AtomicU64,
    /// Number of reads that went to storage
    pub misses: AtomicU64,
    /// Number of frames evicted
    pub evictions: AtomicU64,
    /// Number of blocks allocated
    pub allocations: AtomicU64,
    /// Number of blocks freed
    pub frees: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StoreStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub allocations: u64,
    pub frees: u64,
    pub hit_ratio: f64,
}

impl StoreStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 { 0.0 } else { hits as f64 / total as f64 }
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            hit_ratio: self.get_hit_ratio(),
        }
    }
}

/// A block store: backing storage plus the frame arena.
///
/// Lock order is `frames` before `storage`; publishing only takes `storage`.
pub struct Store {
    id: StoreId,
    config: StorageConfig,
    block_size: usize,
    storage: Mutex<Box<dyn BlockStorage>>,
    frames: Mutex<HashMap<BlockId, Arc<BlockFrame>>>,
    stats: StoreStats,
}

impl Store {
    /// Open (or create) the file-backed store named by `config.path`
    pub fn open(config: StorageConfig) -> StorageResult<Arc<Self>> {
        let format = FileFormat::open(&config)?;
        Self::with_storage(config, Box::new(format))
    }

    /// Create a volatile store
    pub fn in_memory(config: StorageConfig) -> StorageResult<Arc<Self>> {
        config.validate()?;
        let storage = MemoryStorage::new(config.block_size);
        Self::with_storage(config, Box::new(storage))
    }

    /// Create a store over any backing device
    pub fn with_storage(config: StorageConfig, storage: Box<dyn BlockStorage>) -> StorageResult<Arc<Self>> {
        config.validate()?;
        let block_size = storage.block_size();
        let id = StoreId(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed));
        debug!(store = %id, block_size, "opened store");

        Ok(Arc::new(Self {
            id,
            config,
            block_size,
            storage: Mutex::new(storage),
            frames: Mutex::new(HashMap::new()),
            stats: StoreStats::default(),
        }))
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Block containing the store-relative byte `address`
    pub fn address_to_block_id(&self, address: u64) -> BlockId {
        BlockId(address / self.block_size as u64)
    }

    /// Number of frames currently cached
    pub fn cached_blocks(&self) -> usize {
        self.frames.lock().len()
    }

    /// Returns a handle on the committed contents of block `id`
    pub fn read_block(self: &Arc<Self>, id: BlockId) -> StorageResult<Block> {
        StoreStats::inc(&self.stats.reads);
        let mut frames = self.frames.lock();

        if let Some(frame) = frames.get(&id) {
            StoreStats::inc(&self.stats.hits);
            frame.acquire();
            return Ok(Block::from_acquired(self.clone(), frame.clone()));
        }

        StoreStats::inc(&self.stats.misses);
        let mut data = vec![0u8; self.block_size];
        self.storage.lock().read_block(id, &mut data)?;

        let frame = Arc::new(BlockFrame::new(id, data));
        frame.acquire();
        frames.insert(id, frame.clone());
        self.evict_unreferenced(&mut frames);

        Ok(Block::from_acquired(self.clone(), frame))
    }

    /// Allocates a fresh zeroed block
    pub fn allocate_row(self: &Arc<Self>) -> StorageResult<Block> {
        let mut frames = self.frames.lock();
        let id = self.storage.lock().allocate_block()?;
        StoreStats::inc(&self.stats.allocations);
        trace!(store = %self.id, block = %id, "allocated block");

        let frame = Arc::new(BlockFrame::new(id, vec![0u8; self.block_size]));
        frame.acquire();
        // A stale frame of a previous incarnation of this id is replaced outright
        frames.insert(id, frame.clone());
        self.evict_unreferenced(&mut frames);

        Ok(Block::from_acquired(self.clone(), frame))
    }

    /// Returns block `id` to the free list
    pub fn free_block(&self, id: BlockId) -> StorageResult<()> {
        let mut frames = self.frames.lock();
        self.storage.lock().free_block(id)?;
        frames.remove(&id);
        StoreStats::inc(&self.stats.frees);
        trace!(store = %self.id, block = %id, "freed block");
        Ok(())
    }

    pub fn is_allocated(&self, id: BlockId) -> StorageResult<bool> {
        self.storage.lock().is_allocated(id)
    }

    /// Number of live blocks in backing storage
    pub fn allocated_blocks(&self) -> StorageResult<u64> {
        self.storage.lock().allocated_count()
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.storage.lock().sync()
    }

    /// Writes `bytes` through to storage and then into the cached frame.
    ///
    /// Storage is written first so a failed write leaves the frame untouched.
    pub(crate) fn publish(&self, frame: &BlockFrame, bytes: &[u8]) -> StorageResult<()> {
        let mut storage = self.storage.lock();
        frame.set_dirty(true);
        let result = storage.write_block(frame.id(), bytes);
        if result.is_ok() {
            frame.replace_data(bytes);
            StoreStats::inc(&self.stats.writes);
            trace!(store = %self.id, block = %frame.id(), "published block");
        }
        frame.set_dirty(false);
        result
    }

    fn evict_unreferenced(&self, frames: &mut HashMap<BlockId, Arc<BlockFrame>>) {
        let capacity = self.config.block_cache_size;
        if frames.len() <= capacity {
            return;
        }

        let overflow = frames.len() - capacity;
        let victims: Vec<BlockId> = frames
            .iter()
            .filter(|(_, frame)| frame.ref_count() == 0 && !frame.is_dirty())
            .map(|(id, _)| *id)
            .take(overflow)
            .collect();

        for id in victims {
            frames.remove(&id);
            StoreStats::inc(&self.stats.evictions);
        }
    }

    #[cfg(test)]
    pub(crate) fn read_from_storage(&self, id: BlockId, buffer: &mut [u8]) -> StorageResult<()> {
        self.storage.lock().read_block(id, buffer)
    }
}
