use std::io;
use std::path::Path;

/// Index of a block on the medium, from 0 up to `block_count() - 1`.
pub type BlockNumber = usize;

/// Block addressed storage a volume is laid out on. Every call is
/// synchronous: a write has been handed to the medium when it returns, and
/// `sync_disk` waits for it to land.
pub trait BlockStorage {
    /// Attaches to an existing image of `nblocks` blocks of `block_bytes`
    /// each. The contents are not checked; `Volume::open` does that.
    fn open_disk<P: AsRef<Path>>(path: P, nblocks: usize, block_bytes: usize) -> io::Result<Self>
    where
        Self: Sized;

    /// Fills the head of `buf` with block `blocknr`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a block past the end or a buffer shorter than a block.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> io::Result<()>;

    /// Stores `buf` at block `blocknr`. Anything past one block is dropped; a
    /// shorter buffer only overwrites the head of the block.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a block past the end.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> io::Result<()>;

    fn sync_disk(&mut self) -> io::Result<()>;

    fn block_bytes(&self) -> usize;

    fn block_count(&self) -> usize;
}
