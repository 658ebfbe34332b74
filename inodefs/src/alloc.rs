use crate::error::Result;
use crate::io::BlockStorage;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// Tracks which members of one resource class (inodes or blocks) are free,
/// one bit per member. On disk a set bit means free, so a freshly zeroed
/// region reads as fully allocated until the volume is formatted.
///
/// The bitmap lives in `blocks_needed(len)` consecutive blocks starting at
/// `start_block`. Every `set` rewrites the block holding the changed bit
/// before returning.
#[derive(Debug)]
pub struct FreeBitmap {
    start_block: usize,
    block_bytes: usize,
    /// Number of tracked members.
    len: u32,
    bytes: Vec<u8>,
}

impl FreeBitmap {
    /// A bitmap where every member is free. Nothing is written until `flush`.
    pub fn new(start_block: usize, len: u32, block_bytes: usize) -> Self {
        let mut bytes = vec![0; Self::blocks_needed(len, block_bytes) * block_bytes];
        for i in 0..len as usize {
            bytes[i / 8] |= 1 << (i % 8);
        }
        Self {
            start_block,
            block_bytes,
            len,
            bytes,
        }
    }

    /// Reads a bitmap previously written by `flush`.
    pub fn load<T: BlockStorage>(
        dev: &mut T,
        start_block: usize,
        len: u32,
        block_bytes: usize,
    ) -> Result<Self> {
        let nblocks = Self::blocks_needed(len, block_bytes);
        let mut bytes = vec![0; nblocks * block_bytes];
        for (i, chunk) in bytes.chunks_mut(block_bytes).enumerate() {
            dev.read_block(start_block + i, chunk)?;
        }
        Ok(Self {
            start_block,
            block_bytes,
            len,
            bytes,
        })
    }

    /// Blocks needed to hold `len` bits.
    pub fn blocks_needed(len: u32, block_bytes: usize) -> usize {
        let bits_per_block = block_bytes * 8;
        (len as usize + bits_per_block - 1) / bits_per_block
    }

    /// Writes every bitmap block.
    pub fn flush<T: BlockStorage>(&self, dev: &mut T) -> Result<()> {
        for (i, chunk) in self.bytes.chunks(self.block_bytes).enumerate() {
            dev.write_block(self.start_block + i, chunk)?;
        }
        Ok(())
    }

    pub fn get(&self, index: u32) -> State {
        assert!(index < self.len, "bitmap index {} out of range", index);
        let i = index as usize;
        match (self.bytes[i / 8] >> (i % 8)) & 0b1 {
            1 => State::Free,
            _ => State::Used,
        }
    }

    /// Changes one member's state and persists the bitmap block holding it.
    pub fn set<T: BlockStorage>(&mut self, dev: &mut T, index: u32, state: State) -> Result<()> {
        assert!(index < self.len, "bitmap index {} out of range", index);
        let i = index as usize;
        let mask = 0b1 << (i % 8);
        match state {
            State::Free => self.bytes[i / 8] |= mask,
            State::Used => self.bytes[i / 8] &= !mask,
        }

        let block = i / 8 / self.block_bytes;
        let start = block * self.block_bytes;
        dev.write_block(
            self.start_block + block,
            &self.bytes[start..start + self.block_bytes],
        )?;
        Ok(())
    }

    /// Lowest free member, if any.
    pub fn first_free(&self) -> Option<u32> {
        self.free_members().next()
    }

    pub fn count_free(&self) -> u32 {
        self.free_members().count() as u32
    }

    fn free_members(&self) -> FreeMembers<'_> {
        FreeMembers {
            marker: 0,
            bitmap: self,
        }
    }
}

/// Walks the free members of a bitmap in ascending order, skipping whole
/// bytes with no free bit.
struct FreeMembers<'a> {
    /// Keeps track of the next starting place for looking for free members.
    marker: u32,
    bitmap: &'a FreeBitmap,
}

impl<'a> Iterator for FreeMembers<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        while self.marker < self.bitmap.len {
            let i = self.marker;
            if i % 8 == 0 && self.bitmap.bytes[i as usize / 8] == 0 {
                self.marker += 8;
                continue;
            }
            self.marker += 1;
            if let State::Free = self.bitmap.get(i) {
                return Some(i);
            }
        }
        None
    }
}
