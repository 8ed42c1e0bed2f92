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

//! In-memory block storage for scratch stores and tests.

use std::collections::{BTreeSet, HashMap};

use crate::storage_engine::lib::{BlockId, BlockStorage, StorageError, StorageResult};

/// Volatile [`BlockStorage`] keeping every block in a hash map.
pub struct MemoryStorage {
    block_size: usize,
    blocks: HashMap<BlockId, Vec<u8>>,
    /// Freed ids, lowest reused first
    free_blocks: BTreeSet<BlockId>,
    next_block: u64,
}

impl MemoryStorage {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: HashMap::new(),
            free_blocks: BTreeSet::new(),
            next_block: 1,
        }
    }

    fn check_payload(&self, len: usize) -> StorageResult<()> {
        if len != self.block_size {
            return Err(StorageError::InvalidOperation(format!("payload of {} bytes does not match block size {}", len, self.block_size)));
        }
        Ok(())
    }
}

impl BlockStorage for MemoryStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, id: BlockId, buffer: &mut [u8]) -> StorageResult<()> {
        self.check_payload(buffer.len())?;
        let data = self.blocks.get(&id).ok_or(StorageError::BlockNotFound(id))?;
        buffer.copy_from_slice(data);
        Ok(())
    }

    fn write_block(&mut self, id: BlockId, buffer: &[u8]) -> StorageResult<()> {
        self.check_payload(buffer.len())?;
        let data = self.blocks.get_mut(&id).ok_or(StorageError::BlockNotFound(id))?;
        data.copy_from_slice(buffer);
        Ok(())
    }

    fn allocate_block(&mut self) -> StorageResult<BlockId> {
        let id = match self.free_blocks.pop_first() {
            Some(id) => id,
            None => {
                let id = BlockId(self.next_block);
                self.next_block += 1;
                id
            }
        };
        self.blocks.insert(id, vec![0; self.block_size]);
        Ok(id)
    }

    fn free_block(&mut self, id: BlockId) -> StorageResult<()> {
        if self.blocks.remove(&id).is_none() {
            return Err(StorageError::InvalidOperation(format!("Block {id} is not allocated")));
        }
        self.free_blocks.insert(id);
        Ok(())
    }

    fn is_allocated(&mut self, id: BlockId) -> StorageResult<bool> {
        Ok(self.blocks.contains_key(&id))
    }

    fn allocated_count(&mut self) -> StorageResult<u64> {
        Ok(self.blocks.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
