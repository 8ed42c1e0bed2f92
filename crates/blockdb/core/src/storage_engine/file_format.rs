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

// File format module
// This module defines the on-disk layout of a block store: a fixed file header followed by
// block slots, each slot being a small block header plus the block payload. Freed slots are
// chained into an on-disk free list that allocation drains before growing the file.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::storage_engine::lib::{BlockId, BlockStorage, MIN_BLOCK_SIZE, StorageConfig, StorageError, StorageResult, calculate_checksum};

/// Magic number to identify our file format (BKDB)
const FILE_MAGIC: [u8; 4] = *b"BKDB";
/// Current format version
const FORMAT_VERSION: u32 = 1;
/// Size of the file header in bytes
const HEADER_SIZE: u64 = 4096;
/// Size of the per-slot block header in bytes
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Allocation state of a block slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Slot holds a live block
    Used = 1,
    /// Slot is on the free list
    Free = 2,
}

impl TryFrom<u8> for BlockState {
    type Error = StorageError;

    fn try_from(value: u8) -> StorageResult<Self> {
        match value {
            1 => Ok(BlockState::Used),
            2 => Ok(BlockState::Free),
            other => Err(StorageError::Corruption(format!("unknown block state {other}"))),
        }
    }
}

/// Block header structure (fixed size)
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    state: BlockState,
    /// CRC32 of the payload, only meaningful for used blocks
    checksum: u32,
    /// Next free slot, only meaningful for free blocks
    next_free: BlockId,
}

impl BlockHeader {
    fn serialize(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buffer = [0u8; BLOCK_HEADER_SIZE];
        buffer[0] = self.state as u8;
        buffer[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buffer[8..16].copy_from_slice(&self.next_free.0.to_le_bytes());
        buffer
    }

    fn deserialize(buffer: &[u8]) -> StorageResult<Self> {
        if buffer.len() < BLOCK_HEADER_SIZE {
            return Err(StorageError::Io(io::Error::new(io::ErrorKind::InvalidInput, "Buffer too small for block header")));
        }

        let state = BlockState::try_from(buffer[0])?;
        let mut cursor = Cursor::new(&buffer[4..BLOCK_HEADER_SIZE]);
        let checksum = cursor.read_u32::<LittleEndian>()?;
        let next_free = BlockId(cursor.read_u64::<LittleEndian>()?);

        Ok(Self { state, checksum, next_free })
    }
}

/// File header structure
#[derive(Debug, Clone)]
struct FileHeader {
    /// Format version
    version: u32,
    /// Size of block payloads in bytes
    block_size: u32,
    /// One past the highest block id ever allocated
    total_blocks: u64,
    /// Number of live blocks
    allocated: u64,
    /// Head of the free list
    first_free_block: BlockId,
}

impl FileHeader {
    fn new(block_size: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            block_size,
            // Block 0 is the null link and never lives on disk
            total_blocks: 1,
            allocated: 0,
            first_free_block: BlockId::NULL,
        }
    }

    fn serialize(&self) -> StorageResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(HEADER_SIZE as usize);
        buffer.extend_from_slice(&FILE_MAGIC);
        buffer.write_u32::<LittleEndian>(self.version)?;
        buffer.write_u32::<LittleEndian>(self.block_size)?;
        buffer.write_u64::<LittleEndian>(self.total_blocks)?;
        buffer.write_u64::<LittleEndian>(self.allocated)?;
        buffer.write_u64::<LittleEndian>(self.first_free_block.0)?;
        buffer.resize(HEADER_SIZE as usize, 0);
        Ok(buffer)
    }

    fn deserialize(buffer: &[u8]) -> StorageResult<Self> {
        if buffer.len() < 36 {
            return Err(StorageError::Corruption("File header truncated".to_string()));
        }

        if buffer[0..4] != FILE_MAGIC {
            return Err(StorageError::Corruption("Invalid file format".to_string()));
        }

        let mut cursor = Cursor::new(&buffer[4..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version > FORMAT_VERSION {
            return Err(StorageError::Corruption(format!("Unsupported format version: {version}")));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        if (block_size as usize) < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(StorageError::Corruption(format!("Invalid block size in header: {block_size}")));
        }
        let total_blocks = cursor.read_u64::<LittleEndian>()?;
        let allocated = cursor.read_u64::<LittleEndian>()?;
        let first_free_block = BlockId(cursor.read_u64::<LittleEndian>()?);

        if total_blocks == 0 || allocated >= total_blocks {
            return Err(StorageError::Corruption(format!("Inconsistent block counts: total={total_blocks} allocated={allocated}")));
        }

        Ok(Self {
            version,
            block_size,
            total_blocks,
            allocated,
            first_free_block,
        })
    }
}

/// FileFormat manages the store file: slot addressing, block headers, checksums and the free list.
pub struct FileFormat {
    /// Path to the store file
    path: PathBuf,
    /// The store file
    file: File,
    /// File header
    header: FileHeader,
}

impl FileFormat {
    /// Open the store file named by `config`, creating it when missing.
    ///
    /// An existing file keeps the block size it was created with.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        Self::open_path(&config.path, config.block_size)
    }

    fn open_path(path: &Path, block_size: usize) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let is_new = !path.exists() || std::fs::metadata(path)?.len() == 0;
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;

        let header = if is_new {
            let header = FileHeader::new(block_size as u32);
            file.set_len(HEADER_SIZE)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.serialize()?)?;
            debug!(path = %path.display(), block_size, "created store file");
            header
        } else {
            let mut buffer = vec![0; HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buffer)?;
            let header = FileHeader::deserialize(&buffer)?;
            if header.block_size as usize != block_size {
                debug!(
                    path = %path.display(),
                    configured = block_size,
                    on_disk = header.block_size,
                    "using block size recorded in store file"
                );
            }
            header
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
        })
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One past the highest block id ever allocated
    pub fn total_blocks(&self) -> u64 {
        self.header.total_blocks
    }

    fn slot_size(&self) -> u64 {
        (BLOCK_HEADER_SIZE + self.header.block_size as usize) as u64
    }

    fn slot_offset(&self, id: BlockId) -> u64 {
        HEADER_SIZE + (id.0 - 1) * self.slot_size()
    }

    fn check_range(&self, id: BlockId) -> StorageResult<()> {
        if id.is_null() || id.0 >= self.header.total_blocks {
            return Err(StorageError::BlockNotFound(id));
        }
        Ok(())
    }

    fn check_payload(&self, len: usize) -> StorageResult<()> {
        if len != self.header.block_size as usize {
            return Err(StorageError::InvalidOperation(format!(
                "payload of {} bytes does not match block size {}",
                len, self.header.block_size
            )));
        }
        Ok(())
    }

    fn write_header(&mut self) -> StorageResult<()> {
        let buffer = self.header.serialize()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buffer)?;
        Ok(())
    }

    fn read_block_header(&mut self, id: BlockId) -> StorageResult<BlockHeader> {
        let mut buffer = [0u8; BLOCK_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(self.slot_offset(id)))?;
        self.file.read_exact(&mut buffer)?;
        BlockHeader::deserialize(&buffer)
    }

    fn write_slot(&mut self, id: BlockId, header: BlockHeader, payload: &[u8]) -> StorageResult<()> {
        let mut buffer = Vec::with_capacity(self.slot_size() as usize);
        buffer.extend_from_slice(&header.serialize());
        buffer.extend_from_slice(payload);
        self.file.seek(SeekFrom::Start(self.slot_offset(id)))?;
        self.file.write_all(&buffer)?;
        Ok(())
    }

    fn require_used(&mut self, id: BlockId) -> StorageResult<BlockHeader> {
        self.check_range(id)?;
        let header = self.read_block_header(id)?;
        if header.state != BlockState::Used {
            return Err(StorageError::BlockNotFound(id));
        }
        Ok(header)
    }
}

impl BlockStorage for FileFormat {
    fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    /// Reads a block payload and verifies its checksum.
    fn read_block(&mut self, id: BlockId, buffer: &mut [u8]) -> StorageResult<()> {
        self.check_payload(buffer.len())?;
        let header = self.require_used(id)?;

        self.file.read_exact(buffer)?;

        if calculate_checksum(buffer) != header.checksum {
            return Err(StorageError::Corruption(format!("Block {id} has invalid checksum")));
        }
        Ok(())
    }

    fn write_block(&mut self, id: BlockId, buffer: &[u8]) -> StorageResult<()> {
        self.check_payload(buffer.len())?;
        self.require_used(id)?;

        let header = BlockHeader {
            state: BlockState::Used,
            checksum: calculate_checksum(buffer),
            next_free: BlockId::NULL,
        };
        self.write_slot(id, header, buffer)
    }

    /// Allocates a zeroed block.
    ///
    /// Steps:
    /// 1. Pop the head of the on-disk free list if there is one.
    /// 2. Otherwise grow the file by one slot.
    /// 3. Write the zeroed slot and the updated file header.
    fn allocate_block(&mut self) -> StorageResult<BlockId> {
        let id = if self.header.first_free_block.is_null() {
            let id = BlockId(self.header.total_blocks);
            self.header.total_blocks += 1;
            id
        } else {
            let id = self.header.first_free_block;
            let free_header = self.read_block_header(id)?;
            if free_header.state != BlockState::Free {
                return Err(StorageError::Corruption(format!("Free list head {id} is not a free block")));
            }
            self.header.first_free_block = free_header.next_free;
            id
        };

        let zeroed = vec![0u8; self.header.block_size as usize];
        let header = BlockHeader {
            state: BlockState::Used,
            checksum: calculate_checksum(&zeroed),
            next_free: BlockId::NULL,
        };
        self.write_slot(id, header, &zeroed)?;

        self.header.allocated += 1;
        self.write_header()?;

        Ok(id)
    }

    /// Frees a block by pushing its slot onto the free list.
    fn free_block(&mut self, id: BlockId) -> StorageResult<()> {
        self.check_range(id)?;
        let header = self.read_block_header(id)?;
        if header.state == BlockState::Free {
            return Err(StorageError::InvalidOperation(format!("Block {id} is already free")));
        }

        let free_header = BlockHeader {
            state: BlockState::Free,
            checksum: 0,
            next_free: self.header.first_free_block,
        };
        self.file.seek(SeekFrom::Start(self.slot_offset(id)))?;
        self.file.write_all(&free_header.serialize())?;

        self.header.first_free_block = id;
        self.header.allocated -= 1;
        self.write_header()
    }

    fn is_allocated(&mut self, id: BlockId) -> StorageResult<bool> {
        if id.is_null() || id.0 >= self.header.total_blocks {
            return Ok(false);
        }
        Ok(self.read_block_header(id)?.state == BlockState::Used)
    }

    fn allocated_count(&mut self) -> StorageResult<u64> {
        Ok(self.header.allocated)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
