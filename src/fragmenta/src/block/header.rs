//! The 64-byte, big-endian block header that precedes every block payload (§3.3).

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::constants::{BlockFlags, BlockType, BLOCK_HEADER_SIZE, CHECKSUM_SIZE};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_id: u32,
    pub block_type: BlockType,
    pub flags: BlockFlags,
    pub reserved: u16,
    pub payload_size: u32,
    pub checksum: [u8; CHECKSUM_SIZE],
    pub previous_block: u32,
    pub next_block: u32,
    pub timestamp: i64,
}

/// Bytes occupied by the fields above, before the header is padded to `BLOCK_HEADER_SIZE`.
const WIRE_SIZE: usize = 4 + 1 + 1 + 2 + 4 + CHECKSUM_SIZE + 4 + 4 + 8;

impl BlockHeader {
    pub fn new(block_id: u32, block_type: BlockType, payload_size: u32, timestamp: i64) -> Self {
        BlockHeader {
            block_id,
            block_type,
            flags: BlockFlags::empty(),
            reserved: 0,
            payload_size,
            checksum: [0u8; CHECKSUM_SIZE],
            previous_block: 0,
            next_block: 0,
            timestamp,
        }
    }

    /// Bytes a block (header + payload) occupies on disk.
    pub fn total_size(&self) -> u64 {
        BLOCK_HEADER_SIZE + self.payload_size as u64
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(self.block_id)?;
        w.write_u8(self.block_type as u8)?;
        w.write_u8(self.flags.bits())?;
        w.write_u16::<BigEndian>(self.reserved)?;
        w.write_u32::<BigEndian>(self.payload_size)?;
        w.write_all(&self.checksum)?;
        w.write_u32::<BigEndian>(self.previous_block)?;
        w.write_u32::<BigEndian>(self.next_block)?;
        w.write_i64::<BigEndian>(self.timestamp)?;
        w.write_all(&vec![0u8; BLOCK_HEADER_SIZE as usize - WIRE_SIZE])?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let block_id = r.read_u32::<BigEndian>()?;
        let block_type_raw = r.read_u8()?;
        let flags = BlockFlags::from_bits_truncate(r.read_u8()?);
        let reserved = r.read_u16::<BigEndian>()?;
        let payload_size = r.read_u32::<BigEndian>()?;
        let mut checksum = [0u8; CHECKSUM_SIZE];
        r.read_exact(&mut checksum)?;
        let previous_block = r.read_u32::<BigEndian>()?;
        let next_block = r.read_u32::<BigEndian>()?;
        let timestamp = r.read_i64::<BigEndian>()?;
        let mut padding = [0u8; BLOCK_HEADER_SIZE as usize - WIRE_SIZE];
        r.read_exact(&mut padding)?;

        let block_type = BlockType::from_u8(block_type_raw).unwrap_or(BlockType::Normal);

        Ok(BlockHeader {
            block_id,
            block_type,
            flags,
            reserved,
            payload_size,
            checksum,
            previous_block,
            next_block,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let mut header = BlockHeader::new(7, BlockType::Normal, 128, 42);
        header.previous_block = 3;
        header.next_block = 9;
        header.checksum = [9u8; CHECKSUM_SIZE];

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), BLOCK_HEADER_SIZE as usize);

        let read_back = BlockHeader::read_from(&mut &buf[..]).unwrap();
        assert_eq!(read_back, header);
    }
}
