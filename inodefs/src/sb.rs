use std::mem;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{FsError, Result};

pub const SB_MAGIC: u32 = 0x4946_5342; // IFSB

/// Bytes per inode field. Every field, block numbers included, is one native `u32`.
pub const INODE_WIDTH: u32 = mem::size_of::<u32>() as u32;

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Most fields describe the geometry of the inode table; the rest locate the
/// two free bitmaps. All fields are stored in native byte order.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case IFSB.
    pub sb_magic: u32,
    pub bytes_per_block: u32,
    pub total_blocks: u32,
    /// First block of the inode free bitmap.
    pub inode_bitmap_start: u32,
    /// First block of the data block free bitmap.
    pub block_bitmap_start: u32,
    /// First block of the inode table.
    pub inodes_start: u32,
    pub inodes_count: u32,
    /// Bytes per inode field.
    pub inode_width: u32,
    /// Fields per inode, type tag and file size included.
    pub inode_height: u32,
    /// Blocks occupied by the inode table.
    pub inode_blocks: u32,
    pub inodes_per_block: u32,
    /// Direct block pointers per inode.
    pub direct_count: u32,
    /// Longest file name plus its terminator.
    pub name_max: u32,
}

impl SuperBlock {
    pub const SIZE: usize = mem::size_of::<SuperBlock>();

    pub fn new() -> Self {
        Self {
            sb_magic: SB_MAGIC,
            ..Self::new_zeroed()
        }
    }

    /// Reads the super block from the head of a block buffer.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let sb = Self::read_from_prefix(buf).ok_or_else(|| {
            FsError::Corrupt(format!("{} byte buffer cannot hold a super block", buf.len()))
        })?;
        if sb.sb_magic != SB_MAGIC {
            return Err(FsError::Corrupt(format!(
                "super block magic {:#010x} invalid",
                sb.sb_magic
            )));
        }
        Ok(sb)
    }

    /// Serializes the SuperBlock into a zero padded buffer of `block_bytes` for
    /// writing to disk.
    pub fn serialize(&self, block_bytes: usize) -> Vec<u8> {
        let mut encoded = vec![0; block_bytes.max(Self::SIZE)];
        encoded[..Self::SIZE].copy_from_slice(self.as_bytes());
        encoded
    }

    /// Indirect pointers an inode of the given height carries.
    pub fn indirect_levels_for(height: u32) -> u32 {
        match height {
            0..=4 => 0,
            5 => 1,
            6 => 2,
            _ => 3,
        }
    }

    pub fn indirect_levels(&self) -> u32 {
        Self::indirect_levels_for(self.inode_height)
    }

    /// Block numbers held by one index block.
    pub fn index_fanout(&self) -> u32 {
        self.bytes_per_block / self.inode_width
    }

    /// Field holding the type tag.
    pub fn type_field(&self) -> usize {
        self.inode_height as usize - 2
    }

    /// Field holding the size in bytes.
    pub fn size_field(&self) -> usize {
        self.inode_height as usize - 1
    }

    /// Number of logical blocks a single file may address.
    pub fn max_file_blocks(&self) -> u64 {
        let fanout = u64::from(self.index_fanout());
        (1..=self.indirect_levels())
            .map(|level| fanout.pow(level))
            .sum::<u64>()
            + u64::from(self.direct_count)
    }
}

impl Default for SuperBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(bytes_per_block: u32, inode_height: u32) -> SuperBlock {
        let mut sb = SuperBlock::new();
        sb.bytes_per_block = bytes_per_block;
        sb.inode_width = INODE_WIDTH;
        sb.inode_height = inode_height;
        sb.direct_count = inode_height - 2 - SuperBlock::indirect_levels_for(inode_height);
        sb
    }

    #[test]
    fn can_encode_and_decode_superblocks() {
        let mut sb = geometry(512, 7);
        sb.inodes_count = 64;
        sb.total_blocks = 1024;
        sb.name_max = 16;
        let encoded = sb.serialize(512);
        assert_eq!(encoded.len(), 512);

        let parsed = SuperBlock::parse(&encoded).unwrap();

        assert_eq!(parsed, sb);
    }

    #[test]
    fn parsing_buffer_with_invalid_magic_fails() {
        let zero_buffer_with_right_size = vec![0; 512];
        match SuperBlock::parse(&zero_buffer_with_right_size) {
            Err(FsError::Corrupt(msg)) => assert!(msg.contains("magic")),
            other => panic!("expected corrupt volume, got {:?}", other),
        }
    }

    #[test]
    fn parsing_short_buffer_fails() {
        assert!(SuperBlock::parse(&[0; 8]).is_err());
    }

    #[test]
    fn height_decides_indirect_levels() {
        assert_eq!(SuperBlock::indirect_levels_for(3), 0);
        assert_eq!(SuperBlock::indirect_levels_for(4), 0);
        assert_eq!(SuperBlock::indirect_levels_for(5), 1);
        assert_eq!(SuperBlock::indirect_levels_for(6), 2);
        assert_eq!(SuperBlock::indirect_levels_for(7), 3);
        assert_eq!(SuperBlock::indirect_levels_for(12), 3);
    }

    #[test]
    fn triple_indirect_capacity_for_512_byte_blocks() {
        let sb = geometry(512, 7);
        assert_eq!(sb.direct_count, 2);
        assert_eq!(sb.index_fanout(), 128);
        assert_eq!(sb.type_field(), 5);
        assert_eq!(sb.size_field(), 6);
        assert_eq!(sb.max_file_blocks(), 2 + 128 + 128 * 128 + 128 * 128 * 128);
    }

    #[test]
    fn direct_only_capacity() {
        let sb = geometry(512, 4);
        assert_eq!(sb.direct_count, 2);
        assert_eq!(sb.max_file_blocks(), 2);
    }
}
