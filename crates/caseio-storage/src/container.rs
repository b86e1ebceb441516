//! Block container codec
//!
//! A block container holds the payloads of a contiguous rank range in one
//! file. Container layout:
//! ```text
//! +----------------------+  offset 0
//! |   Header (36B)       |  magic, version, rank range, index offset, crc
//! +----------------------+
//! |   Section 0          |  payload of rank group_start
//! |   ...                |
//! |   Section n-1        |  payload of rank group_start + n - 1
//! +----------------------+  index_offset
//! |   Index (n x 20B)    |  (offset u64, length u64, crc32c u32) per slot
//! +----------------------+
//! ```
//! Index entries have a fixed size, so a slot is located in O(1).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use caseio_common::{Error, Rank, Result};

/// Magic number for block containers
pub const CONTAINER_MAGIC: [u8; 8] = *b"CASEBLK1";

/// Current container format version
pub const CONTAINER_VERSION: u32 = 1;

/// Header size in bytes
pub const CONTAINER_HEADER_SIZE: usize = 36;

/// Index entry size in bytes
pub const INDEX_ENTRY_SIZE: usize = 20;

/// Header stored at the beginning of every container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    /// First rank held
    pub group_start: Rank,
    /// Number of slots
    pub group_size: u32,
    /// Rank count of the run that wrote the container
    pub total: u32,
    /// Byte offset of the index
    pub index_offset: u64,
}

impl ContainerHeader {
    /// Offset of the checksum field: everything before it is covered
    const CHECKSUM_OFFSET: usize = 32;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; CONTAINER_HEADER_SIZE] {
        let mut buf = [0u8; CONTAINER_HEADER_SIZE];
        let mut cursor = &mut buf[..];

        cursor.put_slice(&CONTAINER_MAGIC);
        cursor.put_u32_le(CONTAINER_VERSION);
        cursor.put_u32_le(self.group_start.get());
        cursor.put_u32_le(self.group_size);
        cursor.put_u32_le(self.total);
        cursor.put_u64_le(self.index_offset);

        let checksum = crc32c::crc32c(&buf[..Self::CHECKSUM_OFFSET]);
        buf[Self::CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CONTAINER_HEADER_SIZE {
            return Err(Error::corrupt_container(format!(
                "container too small for header: {} bytes",
                data.len()
            )));
        }

        let mut buf = &data[..CONTAINER_HEADER_SIZE];
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != CONTAINER_MAGIC {
            return Err(Error::corrupt_container("invalid container magic"));
        }

        let version = buf.get_u32_le();
        if version != CONTAINER_VERSION {
            return Err(Error::corrupt_container(format!(
                "unsupported container version: {version}"
            )));
        }

        let header = Self {
            group_start: Rank::new(buf.get_u32_le()),
            group_size: buf.get_u32_le(),
            total: buf.get_u32_le(),
            index_offset: buf.get_u64_le(),
        };

        let checksum = buf.get_u32_le();
        if crc32c::crc32c(&data[..Self::CHECKSUM_OFFSET]) != checksum {
            return Err(Error::corrupt_container("container header checksum mismatch"));
        }

        Ok(header)
    }

    /// Slot of `rank`, if the container holds it
    #[must_use]
    pub fn slot(&self, rank: Rank) -> Option<u32> {
        rank.get()
            .checked_sub(self.group_start.get())
            .filter(|slot| *slot < self.group_size)
    }
}

/// Location of one slot's payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u64,
    pub checksum: u32,
}

impl IndexEntry {
    fn read(mut buf: &[u8]) -> Self {
        Self {
            offset: buf.get_u64_le(),
            length: buf.get_u64_le(),
            checksum: buf.get_u32_le(),
        }
    }
}

/// A parsed container over shared bytes
#[derive(Clone, Debug)]
pub struct BlockContainer {
    header: ContainerHeader,
    data: Bytes,
}

impl BlockContainer {
    /// Validate the header and index bounds of `data`
    pub fn parse(data: Bytes) -> Result<Self> {
        let header = ContainerHeader::from_bytes(&data)?;

        if u64::from(header.group_start.get()) + u64::from(header.group_size)
            > u64::from(header.total)
        {
            return Err(Error::corrupt_container(format!(
                "ranks {}+{} exceed run of {}",
                header.group_start, header.group_size, header.total
            )));
        }

        let index_len = u64::from(header.group_size) * INDEX_ENTRY_SIZE as u64;
        let index_end = header.index_offset.checked_add(index_len);
        if header.index_offset < CONTAINER_HEADER_SIZE as u64
            || index_end != Some(data.len() as u64)
        {
            return Err(Error::corrupt_container(format!(
                "index at {} for {} slots does not end the {}-byte container",
                header.index_offset,
                header.group_size,
                data.len()
            )));
        }

        Ok(Self { header, data })
    }

    /// Container header
    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.header.group_size as usize
    }

    /// True for a container without slots
    pub fn is_empty(&self) -> bool {
        self.header.group_size == 0
    }

    /// Index entry of a slot
    pub fn entry(&self, slot: u32) -> Result<IndexEntry> {
        if slot >= self.header.group_size {
            return Err(Error::corrupt_container(format!(
                "slot {slot} outside index of {} slots",
                self.header.group_size
            )));
        }
        let at = self.header.index_offset as usize + slot as usize * INDEX_ENTRY_SIZE;
        Ok(IndexEntry::read(&self.data[at..at + INDEX_ENTRY_SIZE]))
    }

    /// Payload of a slot, checksum verified
    pub fn block(&self, slot: u32) -> Result<Bytes> {
        let entry = self.entry(slot)?;
        let end = entry.offset.checked_add(entry.length);
        if entry.offset < CONTAINER_HEADER_SIZE as u64
            || end.is_none_or(|end| end > self.header.index_offset)
        {
            return Err(Error::corrupt_container(format!(
                "slot {slot} section {}+{} outside data region",
                entry.offset, entry.length
            )));
        }

        let block = self
            .data
            .slice(entry.offset as usize..(entry.offset + entry.length) as usize);
        if crc32c::crc32c(&block) != entry.checksum {
            return Err(Error::corrupt_container(format!(
                "slot {slot} checksum mismatch"
            )));
        }
        Ok(block)
    }

    /// Payload belonging to `rank`
    pub fn block_for_rank(&self, rank: Rank) -> Result<Bytes> {
        let slot = self.header.slot(rank).ok_or_else(|| {
            Error::corrupt_container(format!(
                "rank {rank} outside container range {}..{}",
                self.header.group_start,
                u64::from(self.header.group_start.get()) + u64::from(self.header.group_size)
            ))
        })?;
        self.block(slot)
    }
}

/// Packs and unpacks per-rank payloads of a shared file
pub struct BlockCodec;

impl BlockCodec {
    /// Pack `blocks[i]` as the payload of rank `group_start + i`
    pub fn encode(group_start: Rank, blocks: &[Bytes], total: u32) -> Result<Bytes> {
        let group_size = u32::try_from(blocks.len())
            .map_err(|_| Error::invalid_argument("too many blocks for one container"))?;
        if group_size == 0 {
            return Err(Error::invalid_argument("container needs at least one block"));
        }
        if u64::from(group_start.get()) + u64::from(group_size) > u64::from(total) {
            return Err(Error::invalid_argument(format!(
                "ranks {group_start}..{} exceed run of {total}",
                u64::from(group_start.get()) + u64::from(group_size)
            )));
        }

        let data_len: usize = blocks.iter().map(Bytes::len).sum();
        let index_offset = (CONTAINER_HEADER_SIZE + data_len) as u64;
        let header = ContainerHeader {
            group_start,
            group_size,
            total,
            index_offset,
        };

        let mut buf = BytesMut::with_capacity(
            CONTAINER_HEADER_SIZE + data_len + blocks.len() * INDEX_ENTRY_SIZE,
        );
        buf.put_slice(&header.to_bytes());

        let mut index = Vec::with_capacity(blocks.len());
        for block in blocks {
            index.push(IndexEntry {
                offset: buf.len() as u64,
                length: block.len() as u64,
                checksum: crc32c::crc32c(block),
            });
            buf.put_slice(block);
        }

        for entry in index {
            buf.put_u64_le(entry.offset);
            buf.put_u64_le(entry.length);
            buf.put_u32_le(entry.checksum);
        }

        Ok(buf.freeze())
    }

    /// Extract the payload of `rank` from a container expected to hold
    /// ranks `group_start..group_start + group_size`
    pub fn decode(stream: Bytes, rank: Rank, group_start: Rank, group_size: u32) -> Result<Bytes> {
        let container = BlockContainer::parse(stream)?;
        let header = container.header();
        if header.group_start != group_start || header.group_size != group_size {
            return Err(Error::corrupt_container(format!(
                "container declares ranks {}+{}, expected {group_start}+{group_size}",
                header.group_start, header.group_size
            )));
        }
        container.block_for_rank(rank)
    }
}
