//! Fixed-layout, big-endian store header (§3.1, §4.2).
//!
//! Contrast with [`crate::tlv`], which is little-endian throughout — the
//! header and block headers are big-endian and that is never "fixed" to
//! match the TLV side (Design Note 4).

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::constants::{
    HeaderFlags, StorageMode, CURRENT_VERSION, DEFAULT_METADATA_OFFSET, HEADER_SIZE,
    MAGIC_DEFS, MAGIC_FRAG, MIN_SUPPORTED_VERSION,
};
use crate::error::{FragmentaError, Result};

/// The on-disk store header, §3.1. `Checksum` is reserved for a future
/// header integrity digest and is carried through unvalidated.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub flags: HeaderFlags,
    pub creation_timestamp: i64,
    pub last_modified: i64,
    pub storage_mode: StorageMode,
    pub reserved1: u8,
    pub reserved2: u8,
    pub metadata_offset: u64,
    pub metadata_size: u64,
    pub block_offset: u64,
    pub block_size: u64,
    pub index_offset: u64,
    pub index_size: u64,
    pub total_size: u64,
    pub user_defined_id: [u8; 16],
    pub checksum: [u8; 64],
}

impl StoreHeader {
    /// Builds the header written by `Store::create`: current version,
    /// `MetadataOffset = 256`, everything else zeroed.
    pub fn new(storage_mode: StorageMode, user_defined_id: [u8; 16]) -> Self {
        StoreHeader {
            magic: MAGIC_FRAG,
            version: CURRENT_VERSION,
            flags: HeaderFlags::empty(),
            creation_timestamp: 0,
            last_modified: 0,
            storage_mode,
            reserved1: 0,
            reserved2: 0,
            metadata_offset: DEFAULT_METADATA_OFFSET,
            metadata_size: 0,
            block_offset: 0,
            block_size: 0,
            index_offset: 0,
            index_size: 0,
            total_size: HEADER_SIZE,
            user_defined_id,
            checksum: [0u8; 64],
        }
    }

    /// Seeks to offset 0 and writes every field in §3.1 order, big-endian,
    /// padding out to [`HEADER_SIZE`]. Leaves the cursor at `HEADER_SIZE`.
    pub fn write_to<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        w.seek(SeekFrom::Start(0))?;
        w.write_all(&self.magic)?;
        w.write_u16::<BigEndian>(self.version)?;
        w.write_u16::<BigEndian>(self.flags.bits())?;
        w.write_i64::<BigEndian>(self.creation_timestamp)?;
        w.write_i64::<BigEndian>(self.last_modified)?;
        w.write_u8(self.storage_mode as u8)?;
        w.write_u8(self.reserved1)?;
        w.write_u8(self.reserved2)?;
        w.write_u64::<BigEndian>(self.metadata_offset)?;
        w.write_u64::<BigEndian>(self.metadata_size)?;
        w.write_u64::<BigEndian>(self.block_offset)?;
        w.write_u64::<BigEndian>(self.block_size)?;
        w.write_u64::<BigEndian>(self.index_offset)?;
        w.write_u64::<BigEndian>(self.index_size)?;
        w.write_u64::<BigEndian>(self.total_size)?;
        w.write_all(&self.user_defined_id)?;
        w.write_all(&self.checksum)?;

        let written = Self::WIRE_SIZE;
        debug_assert!(written <= HEADER_SIZE as usize);
        w.write_all(&vec![0u8; HEADER_SIZE as usize - written])?;
        w.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(())
    }

    /// Mirrors [`Self::write_to`]: reads every field and validates magic
    /// and version immediately. Leaves the cursor at `HEADER_SIZE`.
    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        r.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        let version = r.read_u16::<BigEndian>()?;
        let flags = HeaderFlags::from_bits_truncate(r.read_u16::<BigEndian>()?);
        let creation_timestamp = r.read_i64::<BigEndian>()?;
        let last_modified = r.read_i64::<BigEndian>()?;
        let storage_mode_raw = r.read_u8()?;
        let reserved1 = r.read_u8()?;
        let reserved2 = r.read_u8()?;
        let metadata_offset = r.read_u64::<BigEndian>()?;
        let metadata_size = r.read_u64::<BigEndian>()?;
        let block_offset = r.read_u64::<BigEndian>()?;
        let block_size = r.read_u64::<BigEndian>()?;
        let index_offset = r.read_u64::<BigEndian>()?;
        let index_size = r.read_u64::<BigEndian>()?;
        let total_size = r.read_u64::<BigEndian>()?;
        let mut user_defined_id = [0u8; 16];
        r.read_exact(&mut user_defined_id)?;
        let mut checksum = [0u8; 64];
        r.read_exact(&mut checksum)?;

        r.seek(SeekFrom::Start(HEADER_SIZE))?;

        let storage_mode = StorageMode::from_u8(storage_mode_raw)
            .ok_or_else(|| FragmentaError::invalid_format(format!("unknown storage mode {storage_mode_raw}")))?;

        let header = StoreHeader {
            magic,
            version,
            flags,
            creation_timestamp,
            last_modified,
            storage_mode,
            reserved1,
            reserved2,
            metadata_offset,
            metadata_size,
            block_offset,
            block_size,
            index_offset,
            index_size,
            total_size,
            user_defined_id,
            checksum,
        };
        header.validate()?;
        Ok(header)
    }

    /// Bytes actually occupied by the fields above, before padding to `HEADER_SIZE`.
    const WIRE_SIZE: usize = 4 + 2 + 2 + 8 + 8 + 1 + 1 + 1 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 16 + 64;

    /// Validates magic, version, and the region-layout invariants of §3.1.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC_FRAG && self.magic != MAGIC_DEFS {
            return Err(FragmentaError::invalid_format(format!(
                "bad magic {:02x?}",
                self.magic
            )));
        }
        if self.version < MIN_SUPPORTED_VERSION || self.version > CURRENT_VERSION {
            return Err(FragmentaError::UnsupportedVersion {
                version: self.version,
                min: MIN_SUPPORTED_VERSION,
                max: CURRENT_VERSION,
            });
        }
        if self.metadata_offset < HEADER_SIZE {
            return Err(FragmentaError::invalid_format("metadata_offset below header size"));
        }
        if self.block_offset != 0 && self.block_offset < self.metadata_offset + self.metadata_size {
            return Err(FragmentaError::invalid_format(
                "block_offset overlaps the metadata region",
            ));
        }
        if self.total_size < self.block_offset + self.block_size {
            return Err(FragmentaError::invalid_format("total_size smaller than block region"));
        }
        Ok(())
    }
}
