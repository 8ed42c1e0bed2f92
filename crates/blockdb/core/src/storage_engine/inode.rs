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

// Inode module
// An inode stores one large value as a chain of blocks. Each chain block starts with a small
// header linking to the next block, followed by payload bytes. Every block but the last is
// full. All reads and writes go through the owning transaction, so buffered chain blocks are
// visible to the writer and nobody else until commit.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::storage_engine::block::{BlockHandle, WriteBlock};
use crate::storage_engine::lib::{BlockId, StorageError, StorageResult};
use crate::storage_engine::store::Store;
use crate::storage_engine::transaction::Transaction;

/// Size of the header at the start of each chain block
pub const CHAIN_HEADER_SIZE: usize = 16;

/// Chain blocks and length of an inode; transactions keep copies to restore on rollback
#[derive(Debug, Default, Clone)]
pub(crate) struct InodeState {
    blocks: Vec<BlockId>,
    len: u64,
}

/// A large value stored as a block chain.
///
/// Clones share state, so a clone registered with a transaction sees later appends.
#[derive(Clone)]
pub struct Inode {
    store: Arc<Store>,
    state: Arc<Mutex<InodeState>>,
}

fn write_next(write_block: &WriteBlock, next: BlockId) -> StorageResult<()> {
    let mut bytes = [0u8; 8];
    LittleEndian::write_u64(&mut bytes, next.value());
    write_block.write(0, &bytes)
}

fn write_used(write_block: &WriteBlock, used: usize) -> StorageResult<()> {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, used as u32);
    write_block.write(8, &bytes)
}

fn read_header(handle: &BlockHandle) -> StorageResult<(BlockId, usize)> {
    let mut header = [0u8; CHAIN_HEADER_SIZE];
    handle.read(0, &mut header)?;
    let next = BlockId(LittleEndian::read_u64(&header[0..8]));
    let used = LittleEndian::read_u32(&header[8..12]) as usize;
    Ok((next, used))
}

impl Inode {
    /// Size of the descriptor a row slot stores to refer to an inode
    pub const DESCRIPTOR_SIZE: usize = 16;

    /// Creates an empty inode in `store`.
    ///
    /// The inode is registered with `xa` as added, so rolling `xa` back reclaims whatever
    /// gets appended to it.
    pub fn create(xa: &mut Transaction, store: &Arc<Store>) -> StorageResult<Self> {
        let inode = Self {
            store: store.clone(),
            state: Arc::new(Mutex::new(InodeState::default())),
        };
        xa.add_add_inode(inode.clone())?;
        Ok(inode)
    }

    /// Opens the inode described by `descriptor`, walking its chain through `xa`
    pub fn open(xa: &mut Transaction, store: &Arc<Store>, descriptor: &[u8]) -> StorageResult<Self> {
        if descriptor.len() != Self::DESCRIPTOR_SIZE {
            return Err(StorageError::InvalidOperation(format!(
                "inode descriptor must be {} bytes, got {}",
                Self::DESCRIPTOR_SIZE,
                descriptor.len()
            )));
        }
        let len = LittleEndian::read_u64(&descriptor[0..8]);
        let first = BlockId(LittleEndian::read_u64(&descriptor[8..16]));

        let capacity = Self::capacity_of(store) as u64;
        let expected_blocks = len.div_ceil(capacity);
        let mut blocks = Vec::new();
        let mut total = 0u64;
        let mut next = first;

        while !next.is_null() {
            if blocks.len() as u64 >= expected_blocks {
                return Err(StorageError::Corruption(format!("inode chain starting at {first} is longer than its length {len}")));
            }
            let handle = xa.read_block(store, next)?;
            let (following, used) = read_header(&handle)?;
            if used as u64 > capacity {
                return Err(StorageError::Corruption(format!("chain block {next} claims {used} used bytes")));
            }
            blocks.push(next);
            total += used as u64;
            next = following;
        }

        if total != len {
            return Err(StorageError::Corruption(format!("inode chain starting at {first} holds {total} bytes, descriptor says {len}")));
        }

        Ok(Self {
            store: store.clone(),
            state: Arc::new(Mutex::new(InodeState { blocks, len })),
        })
    }

    fn capacity_of(store: &Store) -> usize {
        store.block_size() - CHAIN_HEADER_SIZE
    }

    /// Payload bytes per chain block
    pub fn payload_capacity(&self) -> usize {
        Self::capacity_of(&self.store)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Logical length in bytes
    pub fn len(&self) -> u64 {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chain blocks in order
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.state.lock().blocks.clone()
    }

    /// The chain as runs of consecutive block ids, as `(first, count)`.
    ///
    /// A value may span several discontiguous runs once the free list is in use.
    pub fn block_runs(&self) -> Vec<(BlockId, u64)> {
        let state = self.state.lock();
        let mut runs: Vec<(BlockId, u64)> = Vec::new();
        for &id in &state.blocks {
            match runs.last_mut() {
                Some((start, count)) if start.value() + *count == id.value() => *count += 1,
                _ => runs.push((id, 1)),
            }
        }
        runs
    }

    /// Descriptor bytes: length then first block, little-endian
    pub fn descriptor(&self) -> [u8; Self::DESCRIPTOR_SIZE] {
        let state = self.state.lock();
        let mut descriptor = [0u8; Self::DESCRIPTOR_SIZE];
        LittleEndian::write_u64(&mut descriptor[0..8], state.len);
        LittleEndian::write_u64(&mut descriptor[8..16], state.blocks.first().copied().unwrap_or(BlockId::NULL).value());
        descriptor
    }

    pub(crate) fn same_as(&self, other: &Inode) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn snapshot(&self) -> InodeState {
        self.state.lock().clone()
    }

    pub(crate) fn restore(&self, snapshot: InodeState) {
        *self.state.lock() = snapshot;
    }

    /// Appends `bytes`, filling the last block before allocating new ones.
    ///
    /// Existing blocks are only changed through write blocks of `xa`. If an explicit `xa`
    /// rolls back, the new blocks are freed and the inode returns to its previous length.
    pub fn append(&self, xa: &mut Transaction, bytes: &[u8]) -> StorageResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        xa.track_inode(self)?;
        let capacity = self.payload_capacity();
        let mut state = self.state.lock();
        let mut remaining = bytes;
        let mut tail: Option<WriteBlock> = None;

        if let Some(&last) = state.blocks.last() {
            let used = (state.len - (state.blocks.len() as u64 - 1) * capacity as u64) as usize;
            let take = (capacity - used).min(remaining.len());
            let handle = xa.read_block(&self.store, last)?;
            let write_block = xa.create_write_block(handle)?;
            if take > 0 {
                write_block.write(CHAIN_HEADER_SIZE + used, &remaining[..take])?;
                write_used(&write_block, used + take)?;
                state.len += take as u64;
                remaining = &remaining[take..];
            }
            tail = Some(write_block);
        }

        while !remaining.is_empty() {
            let take = capacity.min(remaining.len());
            let write_block = xa.allocate_row(&self.store)?;
            write_next(&write_block, BlockId::NULL)?;
            write_used(&write_block, take)?;
            write_block.write(CHAIN_HEADER_SIZE, &remaining[..take])?;

            if let Some(previous) = tail.take() {
                write_next(&previous, write_block.id())?;
                previous.release()?;
            }

            state.blocks.push(write_block.id());
            state.len += take as u64;
            remaining = &remaining[take..];
            tail = Some(write_block);
        }

        match tail {
            Some(write_block) => write_block.release(),
            None => Ok(()),
        }
    }

    /// Shrinks the value to `len` bytes; surplus blocks are deallocated through `xa`
    pub fn truncate(&self, xa: &mut Transaction, len: u64) -> StorageResult<()> {
        xa.track_inode(self)?;
        let capacity = self.payload_capacity() as u64;
        let mut state = self.state.lock();
        if len > state.len {
            return Err(StorageError::InvalidOperation(format!("cannot truncate inode of {} bytes to {}", state.len, len)));
        }
        if len == state.len {
            return Ok(());
        }

        let keep = len.div_ceil(capacity) as usize;
        for &id in &state.blocks[keep..] {
            xa.deallocate_block(&self.store, id)?;
        }

        if keep > 0 {
            let last = state.blocks[keep - 1];
            let handle = xa.read_block(&self.store, last)?;
            let write_block = xa.create_write_block(handle)?;
            write_next(&write_block, BlockId::NULL)?;
            write_used(&write_block, (len - (keep as u64 - 1) * capacity) as usize)?;
            write_block.release()?;
        }

        state.blocks.truncate(keep);
        state.len = len;
        Ok(())
    }

    /// Schedules the inode for deletion when `xa` commits; nothing is unlinked now
    pub fn remove(&self, xa: &mut Transaction) -> StorageResult<()> {
        xa.add_delete_inode(self.clone())
    }

    /// Frees every chain block. Only commit calls this, for removed inodes.
    pub(crate) fn reclaim(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        let mut first_error = None;
        for &id in &state.blocks {
            if let Err(e) = self.store.free_block(id) {
                first_error.get_or_insert(e);
            }
        }
        state.blocks.clear();
        state.len = 0;
        first_error.map_or(Ok(()), Err)
    }

    /// A reader over the value as `xa` sees it
    pub fn cursor<'a>(&self, xa: &'a mut Transaction) -> InodeCursor<'a> {
        let state = self.state.lock();
        InodeCursor {
            xa,
            store: self.store.clone(),
            blocks: state.blocks.clone(),
            len: state.len,
            capacity: self.payload_capacity(),
            position: 0,
            current: None,
        }
    }

    /// Reads the whole value
    pub fn read_all(&self, xa: &mut Transaction) -> StorageResult<Vec<u8>> {
        let (blocks, len) = {
            let state = self.state.lock();
            (state.blocks.clone(), state.len)
        };

        let mut value = Vec::with_capacity(len as usize);
        for id in blocks {
            let handle = xa.read_block(&self.store, id)?;
            let (_, used) = read_header(&handle)?;
            let start = value.len();
            value.resize(start + used, 0);
            handle.read(CHAIN_HEADER_SIZE, &mut value[start..])?;
        }

        if value.len() as u64 != len {
            return Err(StorageError::Corruption(format!("inode read {} bytes, expected {}", value.len(), len)));
        }
        Ok(value)
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Inode")
            .field("store", &self.store.id())
            .field("len", &state.len)
            .field("blocks", &state.blocks.len())
            .finish()
    }
}

/// Sequential reader over an inode's bytes
pub struct InodeCursor<'a> {
    xa: &'a mut Transaction,
    store: Arc<Store>,
    blocks: Vec<BlockId>,
    len: u64,
    capacity: usize,
    position: u64,
    current: Option<(usize, BlockHandle)>,
}

impl InodeCursor<'_> {
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left to read
    pub fn remaining(&self) -> u64 {
        self.len - self.position
    }

    fn handle_for(&mut self, index: usize) -> StorageResult<&BlockHandle> {
        let cached = matches!(&self.current, Some((current, _)) if *current == index);
        if !cached {
            let id = self.blocks[index];
            let handle = self.xa.read_block(&self.store, id)?;
            self.current = Some((index, handle));
        }
        match &self.current {
            Some((_, handle)) => Ok(handle),
            None => Err(StorageError::InternalConsistency("cursor lost its current block".to_string())),
        }
    }
}

impl Read for InodeCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.len {
            return Ok(0);
        }

        let capacity = self.capacity as u64;
        let index = (self.position / capacity) as usize;
        let offset = (self.position % capacity) as usize;
        let count = (self.capacity - offset).min((self.len - self.position) as usize).min(buf.len());

        let handle = self.handle_for(index).map_err(into_io_error)?;
        handle.read(CHAIN_HEADER_SIZE + offset, &mut buf[..count]).map_err(into_io_error)?;
        self.position += count as u64;
        Ok(count)
    }
}

fn into_io_error(error: StorageError) -> io::Error {
    match error {
        StorageError::Io(e) => e,
        other => io::Error::other(other),
    }
}
