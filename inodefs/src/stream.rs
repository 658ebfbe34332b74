use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::io::BlockStorage;

/// A byte cursor over the content of one inode.
///
/// The stream does not borrow the volume; every call takes it explicitly, so
/// a stream can outlive any single operation. It keeps the last data block it
/// read, which is dropped whenever the stream itself changes the file. Two
/// streams over the same inode do not see each other's cached block.
#[derive(Debug)]
pub struct FileStream {
    inum: u32,
    pos: u32,
    window: Option<Window>,
}

#[derive(Debug)]
struct Window {
    /// Logical block index held in `data`.
    index: u32,
    /// File size when the block was read.
    size: u32,
    data: Vec<u8>,
}

impl FileStream {
    pub fn new(inum: u32) -> Self {
        Self {
            inum,
            pos: 0,
            window: None,
        }
    }

    pub fn inode(&self) -> u32 {
        self.inum
    }

    pub fn position(&self) -> u32 {
        self.pos
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    fn invalidate(&mut self) {
        self.window = None;
    }

    /// Next byte under the cursor, or `None` at the end of the file.
    pub fn next_byte<T: BlockStorage>(&mut self, vol: &mut Volume<T>) -> Result<Option<u8>> {
        let block_bytes = vol.block_bytes() as u32;
        let index = self.pos / block_bytes;

        let stale = match &self.window {
            Some(w) => w.index != index,
            None => true,
        };
        if stale {
            let size = vol.inodes().get_file_size(self.inum)?;
            if self.pos >= size {
                return Ok(None);
            }
            let bn = vol.inodes().get_block_number(self.inum, index)?;
            let mut data = vec![0; block_bytes as usize];
            vol.read_block(bn, &mut data)?;
            self.window = Some(Window { index, size, data });
        }

        match &self.window {
            Some(w) if self.pos < w.size => {
                let byte = w.data[(self.pos % block_bytes) as usize];
                self.pos += 1;
                Ok(Some(byte))
            }
            _ => Ok(None),
        }
    }

    /// Fills `buf` from the cursor onward, returning how many bytes were read.
    pub fn read<T: BlockStorage>(&mut self, vol: &mut Volume<T>, buf: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.next_byte(vol)? {
                Some(byte) => buf[n] = byte,
                None => break,
            }
            n += 1;
        }
        Ok(n)
    }

    /// Reads from `offset` without moving the cursor.
    pub fn read_at<T: BlockStorage>(
        &self,
        vol: &mut Volume<T>,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let size = vol.inodes().get_file_size(self.inum)?;
        let end = size.min(offset.saturating_add(buf.len() as u32));
        let block_bytes = vol.block_bytes() as u32;
        let mut block = vec![0; block_bytes as usize];

        let mut at = offset;
        while at < end {
            let bn = vol.inodes().get_block_number(self.inum, at / block_bytes)?;
            vol.read_block(bn, &mut block)?;
            let start = at % block_bytes;
            let n = (block_bytes - start).min(end - at);
            let dst = (at - offset) as usize;
            buf[dst..dst + n as usize].copy_from_slice(&block[start as usize..(start + n) as usize]);
            at += n;
        }
        Ok(end.saturating_sub(offset) as usize)
    }

    /// Overwrites bytes at `offset`. The range must lie within the file.
    pub fn write_at<T: BlockStorage>(&mut self, vol: &mut Volume<T>, offset: u32, bytes: &[u8]) -> Result<()> {
        let size = vol.inodes().get_file_size(self.inum)?;
        let end = offset
            .checked_add(bytes.len() as u32)
            .filter(|&end| end <= size)
            .ok_or_else(|| {
                FsError::InvalidArgument(format!(
                    "write of {} bytes at {} past end of {} byte file",
                    bytes.len(),
                    offset,
                    size
                ))
            })?;
        self.invalidate();

        let block_bytes = vol.block_bytes() as u32;
        let mut block = vec![0; block_bytes as usize];
        let mut at = offset;
        while at < end {
            let bn = vol.inodes().get_block_number(self.inum, at / block_bytes)?;
            vol.read_block(bn, &mut block)?;
            let start = at % block_bytes;
            let n = (block_bytes - start).min(end - at);
            let src = (at - offset) as usize;
            block[start as usize..(start + n) as usize].copy_from_slice(&bytes[src..src + n as usize]);
            vol.write_block(bn, &block)?;
            at += n;
        }
        Ok(())
    }

    /// Appends `bytes` to the end of the file, mapping new blocks as needed.
    /// Either every byte lands or the file is restored to its prior size.
    pub fn append<T: BlockStorage>(&mut self, vol: &mut Volume<T>, bytes: &[u8]) -> Result<()> {
        self.invalidate();
        let prior = vol.inodes().get_file_size(self.inum)?;
        if let Err(e) = self.append_blocks(vol, bytes) {
            self.truncate(vol, prior)?;
            return Err(e);
        }
        Ok(())
    }

    fn append_blocks<T: BlockStorage>(&mut self, vol: &mut Volume<T>, bytes: &[u8]) -> Result<()> {
        let block_bytes = vol.block_bytes();
        let mut block = vec![0; block_bytes];
        let mut written = 0;
        while written < bytes.len() {
            let size = vol.inodes().get_file_size(self.inum)?;
            let start = size as usize % block_bytes;
            let bn = if start == 0 {
                let bn = vol.alloc_block()?;
                if let Err(e) = vol.inodes().add_block_number(self.inum, bn) {
                    vol.release_block(bn)?;
                    return Err(e);
                }
                block.iter_mut().for_each(|b| *b = 0);
                bn
            } else {
                let bn = vol
                    .inodes()
                    .get_block_number(self.inum, size / block_bytes as u32)?;
                vol.read_block(bn, &mut block)?;
                bn
            };

            let n = (block_bytes - start).min(bytes.len() - written);
            block[start..start + n].copy_from_slice(&bytes[written..written + n]);
            vol.write_block(bn, &block)?;
            vol.inodes().inc_file_size(self.inum, n as i64)?;
            written += n;
        }
        Ok(())
    }

    /// Shrinks the file to `size` bytes, releasing blocks it no longer spans.
    pub fn truncate<T: BlockStorage>(&mut self, vol: &mut Volume<T>, size: u32) -> Result<()> {
        self.invalidate();
        let current = vol.inodes().get_file_size(self.inum)?;
        if size > current {
            return Err(FsError::InvalidArgument(format!(
                "cannot truncate a {} byte file to {} bytes",
                current, size
            )));
        }
        let block_bytes = vol.block_bytes() as u32;
        let keep = size / block_bytes + u32::from(size % block_bytes != 0);
        while vol.inodes().block_count(self.inum)? > keep {
            vol.inodes().remove_last_block(self.inum)?;
        }
        vol.inodes().set_file_size(self.inum, size)?;
        self.pos = self.pos.min(size);
        Ok(())
    }

    /// Removes `len` bytes at `offset`, shifting everything after them left.
    pub fn delete_range<T: BlockStorage>(&mut self, vol: &mut Volume<T>, offset: u32, len: u32) -> Result<()> {
        let size = vol.inodes().get_file_size(self.inum)?;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(FsError::InvalidArgument(format!(
                "range {}+{} outside {} byte file",
                offset, len, size
            )));
        }
        if len == 0 {
            return Ok(());
        }

        let mut chunk = vec![0; vol.block_bytes()];
        let mut src = offset + len;
        let mut dst = offset;
        while src < size {
            let n = self.read_at(vol, src, &mut chunk)?;
            self.write_at(vol, dst, &chunk[..n])?;
            src += n as u32;
            dst += n as u32;
        }
        self.truncate(vol, size - len)
    }

    /// Removes the `n` bytes just before the cursor and steps the cursor back
    /// over them.
    pub fn delete_preceding<T: BlockStorage>(&mut self, vol: &mut Volume<T>, n: u32) -> Result<()> {
        if n > self.pos {
            return Err(FsError::InvalidArgument(format!(
                "cannot delete {} bytes before position {}",
                n, self.pos
            )));
        }
        let start = self.pos - n;
        self.delete_range(vol, start, n)?;
        self.pos = start;
        Ok(())
    }
}
