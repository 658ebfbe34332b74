use crate::io::block::{BlockNumber, BlockStorage};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// Matches a common disk sector size, small enough that indirect blocks are
/// exercised by modest files.
pub const DEFAULT_BLOCK_BYTES: usize = 512;

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is only meant to be used for file system development and testing.
#[derive(Debug)]
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
    /// Bytes per block.
    block_bytes: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("block {} out of range ({} blocks)", blocknr, self.block_count),
            ));
        }
        Ok(())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nblocks: usize, block_bytes: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        let have = file.metadata()?.len();
        if have < (nblocks * block_bytes) as u64 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "disk image is smaller than the requested block count",
            ));
        }
        Ok(FileBlockEmulator {
            fd: file,
            block_count: nblocks,
            block_bytes,
        })
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if buf.len() < self.block_bytes {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((blocknr * self.block_bytes) as u64))?;
        self.fd.read_exact(&mut buf[..self.block_bytes])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        self.fd
            .seek(SeekFrom::Start((blocknr * self.block_bytes) as u64))?;

        let max = buf.len().min(self.block_bytes);
        self.fd.write_all(&buf[..max])
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }

    fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    fn block_count(&self) -> usize {
        self.block_count
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    block_bytes: usize,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            block_count: 0,
            block_bytes: DEFAULT_BLOCK_BYTES,
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Starts a builder over an anonymous temporary file that disappears with
    /// the emulator.
    pub fn scratch() -> std::io::Result<Self> {
        Ok(Self::from(tempfile::tempfile()?))
    }

    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Sets the size of a single block in bytes.
    pub fn with_block_bytes(mut self, bytes: usize) -> Self {
        self.block_bytes = bytes;
        self
    }

    /// Whether `build` zeroes the medium. Defaults to true; turn it off to
    /// reattach to an image that already holds a file system.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 || self.block_bytes == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block count and block size must be non-zero",
            ));
        }
        if self.clear {
            self.zero_blocks()?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
            block_bytes: self.block_bytes,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        let zeros = vec![0x00; self.block_bytes];
        // Buffer each write to prevent excessive syscalls.
        for _ in 0..self.block_count {
            bfd.write_all(&zeros)?;
        }
        bfd.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_disk(blocks: usize) -> FileBlockEmulator {
        FileBlockEmulatorBuilder::scratch()
            .unwrap()
            .with_block_count(blocks)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let mut disk_emu = small_disk(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 4 * 512);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let mut disk_emu = small_disk(4);

        disk_emu.write_block(2, &[0x55; 512]).unwrap();

        let mut read_block = vec![0x00; 512];
        // Read a different block.
        disk_emu.read_block(3, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; 512]);

        // Read the block with data.
        disk_emu.read_block(2, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x55; 512]);
    }

    #[test]
    fn honours_custom_block_size() {
        let mut disk_emu = FileBlockEmulatorBuilder::scratch()
            .unwrap()
            .with_block_count(3)
            .with_block_bytes(64)
            .build()
            .unwrap();
        disk_emu.write_block(1, &[0xAA; 64]).unwrap();

        let mut buf = vec![0; 64];
        disk_emu.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 64]);
        disk_emu.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0xAA; 64]);
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 3 * 64);
    }

    #[test]
    fn access_beyond_range_is_an_error() {
        let mut disk_emu = small_disk(1);

        assert!(disk_emu.write_block(1, &[0x55; 512]).is_err());
        assert!(disk_emu.read_block(1, &mut [0; 512]).is_err());
    }

    #[test]
    fn reading_into_short_buffer_is_an_error() {
        let mut disk_emu = small_disk(1);
        assert!(disk_emu.read_block(0, &mut [0; 100]).is_err());
    }

    #[test]
    fn writing_less_than_a_block_only_touches_the_head() {
        let mut disk_emu = small_disk(1);
        disk_emu.write_block(0, &[0x11; 512]).unwrap();
        disk_emu
            .write_block(0, &[0x22; 256])
            .expect("failed to write block");

        let mut buf = vec![0; 512];
        disk_emu.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..256], &[0x22; 256][..]);
        assert_eq!(&buf[256..], &[0x11; 256][..]);
    }

    #[test]
    fn reattaching_without_clearing_keeps_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut emu = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .build()
            .unwrap();
        emu.write_block(1, &[0x42; 512]).unwrap();
        emu.sync_disk().unwrap();

        let mut emu = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .clear_medium(false)
            .build()
            .unwrap();
        let mut buf = vec![0; 512];
        emu.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x42; 512]);

        let mut opened = FileBlockEmulator::open_disk(disk.path(), 2, 512).unwrap();
        opened.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x42; 512]);
    }
}
