//! Per-table root descriptor recorded in every revision.

use crate::config::{self, BLOCKSIZE_SHIFT};
use crate::error::Result;
use crate::pack::{pack_string, pack_uint, unpack_string, unpack_u32, unpack_uint};
use crate::{BlockNumber, TableSize};
use serde::{Deserialize, Serialize};

/// Where a table's root lives in one revision, plus summary metadata.
///
/// The root block number is opaque outside the owning table. The free list is
/// the table's own serialized free-block list, carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootInfo {
    root_block: BlockNumber,
    level: u32,
    num_entries: TableSize,
    root_is_fake: bool,
    sequential: bool,
    blocksize: u32,
    compress_min: u32,
    free_list: Vec<u8>,
}

impl RootInfo {
    /// Descriptor for a freshly created, empty table.
    pub fn new(blocksize: u32, compress_min: u32) -> Result<Self> {
        config::check_blocksize(blocksize)?;
        config::check_compress_min(compress_min)?;
        Ok(Self {
            root_block: 0,
            level: 0,
            num_entries: 0,
            root_is_fake: true,
            sequential: true,
            blocksize,
            compress_min,
            free_list: Vec::new(),
        })
    }

    pub fn root_block(&self) -> BlockNumber {
        self.root_block
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn num_entries(&self) -> TableSize {
        self.num_entries
    }

    pub fn root_is_fake(&self) -> bool {
        self.root_is_fake
    }

    pub fn sequential(&self) -> bool {
        self.sequential
    }

    pub fn blocksize(&self) -> u32 {
        self.blocksize
    }

    pub fn compress_min(&self) -> u32 {
        self.compress_min
    }

    pub fn free_list(&self) -> &[u8] {
        &self.free_list
    }

    pub fn set_root_block(&mut self, root_block: BlockNumber) {
        self.root_block = root_block;
    }

    pub fn set_level(&mut self, level: u32) {
        self.level = level;
    }

    pub fn set_num_entries(&mut self, num_entries: TableSize) {
        self.num_entries = num_entries;
    }

    pub fn set_root_is_fake(&mut self, fake: bool) {
        self.root_is_fake = fake;
    }

    pub fn set_sequential(&mut self, sequential: bool) {
        self.sequential = sequential;
    }

    /// Fails without modifying `self` if `blocksize` is not a legal block size.
    pub fn set_blocksize(&mut self, blocksize: u32) -> Result<()> {
        config::check_blocksize(blocksize)?;
        self.blocksize = blocksize;
        Ok(())
    }

    /// Fails without modifying `self` unless `compress_min` is 0 or >= 4.
    pub fn set_compress_min(&mut self, compress_min: u32) -> Result<()> {
        config::check_compress_min(compress_min)?;
        self.compress_min = compress_min;
        Ok(())
    }

    pub fn set_free_list(&mut self, free_list: Vec<u8>) {
        self.free_list = free_list;
    }

    /// Append the encoded descriptor to `buf`.
    ///
    /// Layout: root, `level << 2 | sequential << 1 | root_is_fake`, entry
    /// count, `blocksize >> 11`, compress_min, then the length-prefixed free
    /// list. Every integer is a varint.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        pack_uint(buf, u64::from(self.root_block));
        let flags = (u64::from(self.level) << 2)
            | (u64::from(self.sequential) << 1)
            | u64::from(self.root_is_fake);
        pack_uint(buf, flags);
        pack_uint(buf, self.num_entries);
        pack_uint(buf, u64::from(self.blocksize >> BLOCKSIZE_SHIFT));
        pack_uint(buf, u64::from(self.compress_min));
        pack_string(buf, &self.free_list);
    }

    /// Decode a descriptor, advancing `cursor` past it.
    ///
    /// Returns `None` if the input is short or a field is out of range; the
    /// caller should treat that as a corrupt version file.
    pub fn unserialize(cursor: &mut &[u8]) -> Option<Self> {
        let root_block = unpack_u32(cursor)?;
        let flags = unpack_uint(cursor)?;
        let num_entries = unpack_uint(cursor)?;
        let blocksize = unpack_u32(cursor)?.checked_mul(1 << BLOCKSIZE_SHIFT)?;
        let compress_min = unpack_u32(cursor)?;
        let free_list = unpack_string(cursor)?;

        if config::check_blocksize(blocksize).is_err()
            || config::check_compress_min(compress_min).is_err()
        {
            return None;
        }
        let level = u32::try_from(flags >> 2).ok()?;

        Some(Self {
            root_block,
            level,
            num_entries,
            root_is_fake: flags & 0x01 != 0,
            sequential: flags & 0x02 != 0,
            blocksize,
            compress_min,
            free_list,
        })
    }
}
