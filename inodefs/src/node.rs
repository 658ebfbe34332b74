use std::io::Write;

use log::debug;

use crate::alloc::State;
use crate::error::{FsError, Resource, Result};
use crate::fs::Volume;
use crate::io::BlockStorage;
use crate::sb::{SuperBlock, INODE_WIDTH};

/// Type tag stored in the second to last field of an inode.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    /// Freshly allocated, not yet tagged.
    Unset = 0,
    Ordinary = 1,
    Directory = 2,
}

impl InodeKind {
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(InodeKind::Unset),
            1 => Ok(InodeKind::Ordinary),
            2 => Ok(InodeKind::Directory),
            other => Err(FsError::Corrupt(format!("unknown inode type tag {}", other))),
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// An owned copy of one inode record. Changes only reach the disk through
/// `InodeTable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    fields: Vec<u32>,
}

impl DiskInode {
    fn zeroed(height: u32) -> Self {
        Self {
            fields: vec![0; height as usize],
        }
    }

    /// Raw fields: direct pointers, indirect pointers, type tag, size.
    pub fn fields(&self) -> &[u32] {
        &self.fields
    }

    pub fn size(&self) -> u32 {
        self.fields[self.fields.len() - 1]
    }

    pub fn type_tag(&self) -> u32 {
        self.fields[self.fields.len() - 2]
    }

    fn set_size(&mut self, size: u32) {
        let last = self.fields.len() - 1;
        self.fields[last] = size;
    }
}

/// Where a logical block number is recorded.
#[derive(Debug, PartialEq, Eq)]
enum Slot {
    /// Index of a direct pointer field.
    Direct(usize),
    /// Offset within the tree hanging off the indirect pointer of `level`.
    Indirect { level: u32, offset: u64 },
}

/// The inode table of a volume: fixed size records packed
/// `inodes_per_block` to a block, each mapping logical block indices of a
/// file to physical block numbers.
///
/// Every mutation is written back before the call returns. Records are read
/// into owned `DiskInode` values, so nothing read here aliases a shared buffer.
pub struct InodeTable<'v, T: BlockStorage> {
    vol: &'v mut Volume<T>,
}

impl<'v, T: BlockStorage> InodeTable<'v, T> {
    pub fn new(vol: &'v mut Volume<T>) -> Self {
        Self { vol }
    }

    /// Lays out an inode table of `inode_count` records of `height` fields
    /// starting at `first_block`, recording the derived geometry in the super
    /// block. The table blocks are zeroed and marked in use. Returns the
    /// number of inodes created.
    pub fn create(vol: &mut Volume<T>, first_block: u32, inode_count: u32, height: u32) -> Result<u32> {
        if height < 3 {
            return Err(FsError::InvalidArgument(format!(
                "inode height {} leaves no room for a block pointer",
                height
            )));
        }
        let block_bytes = vol.block_bytes() as u32;
        let inodes_per_block = block_bytes / (INODE_WIDTH * height);
        if inodes_per_block == 0 {
            return Err(FsError::InvalidArgument(format!(
                "an inode of {} fields does not fit in a {} byte block",
                height, block_bytes
            )));
        }
        if inode_count < 2 {
            return Err(FsError::InvalidArgument(
                "inode table needs room for inode 0 and the root".to_string(),
            ));
        }
        let inode_blocks = (inode_count + inodes_per_block - 1) / inodes_per_block;
        if first_block + inode_blocks > vol.super_block().total_blocks {
            return Err(FsError::InvalidArgument(format!(
                "inode table of {} blocks does not fit on the volume",
                inode_blocks
            )));
        }

        let sb = vol.super_block_mut();
        sb.inodes_start = first_block;
        sb.inodes_count = inode_count;
        sb.inode_width = INODE_WIDTH;
        sb.inode_height = height;
        sb.inode_blocks = inode_blocks;
        sb.inodes_per_block = inodes_per_block;
        sb.direct_count = height - 2 - SuperBlock::indirect_levels_for(height);

        let zeros = vec![0; block_bytes as usize];
        for bn in first_block..first_block + inode_blocks {
            vol.write_block(bn, &zeros)?;
            vol.set_block_state(bn, State::Used)?;
        }
        vol.write_super_block()?;
        Ok(inode_count)
    }

    fn sb(&self) -> &SuperBlock {
        self.vol.super_block()
    }

    pub(crate) fn check_inode(&self, inum: u32) -> Result<()> {
        if inum == 0 || inum >= self.sb().inodes_count {
            return Err(FsError::InvalidArgument(format!(
                "inode number {} outside 1..{}",
                inum,
                self.sb().inodes_count
            )));
        }
        Ok(())
    }

    /// Table block holding `inum` and the index of its first field there.
    fn locate(&self, inum: u32) -> (u32, usize) {
        let sb = self.sb();
        let block = sb.inodes_start + inum / sb.inodes_per_block;
        let first = ((inum % sb.inodes_per_block) * sb.inode_height) as usize;
        (block, first)
    }

    /// Reads a copy of the record for `inum`.
    pub fn read(&mut self, inum: u32) -> Result<DiskInode> {
        self.check_inode(inum)?;
        let (block, first) = self.locate(inum);
        let height = self.sb().inode_height as usize;
        let words = self.vol.read_words(block)?;
        Ok(DiskInode {
            fields: words[first..first + height].to_vec(),
        })
    }

    fn write(&mut self, inum: u32, inode: &DiskInode) -> Result<()> {
        let (block, first) = self.locate(inum);
        let mut words = self.vol.read_words(block)?;
        words[first..first + inode.fields.len()].copy_from_slice(&inode.fields);
        self.vol.write_words(block, &words)
    }

    fn set_field(&mut self, inum: u32, field: usize, value: u32) -> Result<u32> {
        let mut inode = self.read(inum)?;
        inode.fields[field] = value;
        self.write(inum, &inode)?;
        Ok(value)
    }

    /// Allocates a free inode, zeroing its record. Fails with
    /// `Exhausted(Inode)` when the table is full.
    pub fn get_free(&mut self) -> Result<u32> {
        let inum = self
            .vol
            .first_free_inode()
            .ok_or(FsError::Exhausted(Resource::Inode))?;
        let height = self.sb().inode_height;
        self.check_inode(inum)?;
        self.write(inum, &DiskInode::zeroed(height))?;
        self.vol.set_inode_state(inum, State::Used)?;
        debug!("allocated inode {}", inum);
        Ok(inum)
    }

    pub fn get_type(&mut self, inum: u32) -> Result<InodeKind> {
        InodeKind::from_tag(self.read(inum)?.type_tag())
    }

    pub fn set_type(&mut self, inum: u32, kind: InodeKind) -> Result<InodeKind> {
        let field = self.sb().type_field();
        self.set_field(inum, field, kind.tag())?;
        Ok(kind)
    }

    pub fn get_file_size(&mut self, inum: u32) -> Result<u32> {
        Ok(self.read(inum)?.size())
    }

    pub fn set_file_size(&mut self, inum: u32, size: u32) -> Result<u32> {
        let field = self.sb().size_field();
        self.set_field(inum, field, size)
    }

    /// Adjusts the size by `delta` bytes and returns the new size.
    pub fn inc_file_size(&mut self, inum: u32, delta: i64) -> Result<u32> {
        let mut inode = self.read(inum)?;
        let size = i64::from(inode.size()) + delta;
        if size < 0 || size > i64::from(u32::MAX) {
            return Err(FsError::InvalidArgument(format!(
                "size {} of inode {} out of range",
                size, inum
            )));
        }
        inode.set_size(size as u32);
        self.write(inum, &inode)?;
        Ok(size as u32)
    }

    fn blocks_for(&self, inode: &DiskInode) -> u32 {
        let block_bytes = self.sb().bytes_per_block;
        let size = inode.size();
        size / block_bytes + u32::from(size % block_bytes != 0)
    }

    /// Number of blocks the file spans, derived from its size.
    pub fn block_count(&mut self, inum: u32) -> Result<u32> {
        let inode = self.read(inum)?;
        Ok(self.blocks_for(&inode))
    }

    fn slot(&self, nth: u32) -> Option<Slot> {
        let sb = self.sb();
        let direct = sb.direct_count;
        if nth < direct {
            return Some(Slot::Direct(nth as usize));
        }
        let fanout = u64::from(sb.index_fanout());
        let mut rest = u64::from(nth - direct);
        for level in 1..=sb.indirect_levels() {
            let span = fanout.pow(level);
            if rest < span {
                return Some(Slot::Indirect { level, offset: rest });
            }
            rest -= span;
        }
        None
    }

    /// Field holding the indirect pointer for `level`.
    fn pointer_field(&self, level: u32) -> usize {
        (self.sb().direct_count + level - 1) as usize
    }

    /// Entries under one slot of an index block at `level`.
    fn span(&self, level: u32) -> u64 {
        u64::from(self.sb().index_fanout()).pow(level - 1)
    }

    /// Physical block holding logical block `nth` of the file. Fails with
    /// `DoesNotExist` past the end of the file.
    pub fn get_block_number(&mut self, inum: u32, nth: u32) -> Result<u32> {
        let inode = self.read(inum)?;
        if nth >= self.blocks_for(&inode) {
            return Err(FsError::DoesNotExist);
        }
        let bn = match self.slot(nth) {
            Some(Slot::Direct(field)) => inode.fields[field],
            Some(Slot::Indirect { level, offset }) => {
                let root = inode.fields[self.pointer_field(level)];
                self.resolve(level, root, offset)?
            }
            None => return Err(FsError::Exhausted(Resource::FileCapacity)),
        };
        if bn == 0 {
            return Err(FsError::Corrupt(format!(
                "block {} of inode {} is unmapped",
                nth, inum
            )));
        }
        Ok(bn)
    }

    /// Follows `offset` down from the index block at `level` to a data block number.
    fn resolve(&mut self, level: u32, index_block: u32, offset: u64) -> Result<u32> {
        if index_block == 0 {
            return Err(FsError::Corrupt(format!("missing level {} index block", level)));
        }
        let entries = self.vol.read_words(index_block)?;
        let span = self.span(level);
        let entry = entries[(offset / span) as usize];
        if level == 1 {
            return Ok(entry);
        }
        self.resolve(level - 1, entry, offset % span)
    }

    /// Appends physical block `bn` as the next logical block of `inum`, at
    /// index `block_count(inum)`. The size is left alone; whoever fills the
    /// block grows it.
    ///
    /// Index blocks along the way are allocated on first use. On failure
    /// nothing is left allocated and the record is unchanged.
    pub fn add_block_number(&mut self, inum: u32, bn: u32) -> Result<()> {
        self.check_inode(inum)?;
        if bn == 0 || bn >= self.sb().total_blocks {
            return Err(FsError::InvalidArgument(format!("block number {}", bn)));
        }
        let mut inode = self.read(inum)?;
        let next = self.blocks_for(&inode);
        match self.slot(next) {
            Some(Slot::Direct(field)) => inode.fields[field] = bn,
            Some(Slot::Indirect { level, offset }) => {
                let field = self.pointer_field(level);
                inode.fields[field] = self.ensure_and_set(level, inode.fields[field], offset, bn)?;
            }
            None => return Err(FsError::Exhausted(Resource::FileCapacity)),
        }
        self.write(inum, &inode)
    }

    /// Stores `value` at `offset` below the index block at `level`,
    /// allocating the index block when `index_block` is 0. Returns the
    /// (possibly new) index block number.
    fn ensure_and_set(&mut self, level: u32, index_block: u32, offset: u64, value: u32) -> Result<u32> {
        let fresh = index_block == 0;
        let block = if fresh {
            let block = self.vol.alloc_block()?;
            debug!("allocated level {} index block {}", level, block);
            block
        } else {
            index_block
        };

        if let Err(e) = self.store(level, block, offset, value) {
            if fresh {
                self.vol.release_block(block)?;
            }
            return Err(e);
        }
        Ok(block)
    }

    fn store(&mut self, level: u32, block: u32, offset: u64, value: u32) -> Result<()> {
        let mut entries = self.vol.read_words(block)?;
        let span = self.span(level);
        let slot = (offset / span) as usize;
        entries[slot] = if level == 1 {
            value
        } else {
            self.ensure_and_set(level - 1, entries[slot], offset % span, value)?
        };
        self.vol.write_words(block, &entries)
    }

    /// Drops the last logical block of `inum`: the block is released, its
    /// slot zeroed, index blocks left empty are released too, and the size
    /// shrinks to cover one block fewer. Returns the released block.
    pub fn remove_last_block(&mut self, inum: u32) -> Result<u32> {
        let mut inode = self.read(inum)?;
        let count = self.blocks_for(&inode);
        if count == 0 {
            return Err(FsError::DoesNotExist);
        }
        let last = count - 1;
        let freed = match self.slot(last) {
            Some(Slot::Direct(field)) => std::mem::replace(&mut inode.fields[field], 0),
            Some(Slot::Indirect { level, offset }) => {
                let field = self.pointer_field(level);
                let (freed, emptied) = self.clear_last(level, inode.fields[field], offset)?;
                if emptied {
                    self.vol.release_block(inode.fields[field])?;
                    inode.fields[field] = 0;
                }
                freed
            }
            None => {
                return Err(FsError::Corrupt(format!(
                    "inode {} spans more blocks than it can address",
                    inum
                )))
            }
        };
        if freed != 0 {
            self.vol.release_block(freed)?;
        }
        inode.set_size(last * self.sb().bytes_per_block);
        self.write(inum, &inode)?;
        Ok(freed)
    }

    /// Zeroes the entry for `offset` below `block`. Returns the data block
    /// that was recorded there and whether `block` is now empty, in which
    /// case the caller releases it.
    fn clear_last(&mut self, level: u32, block: u32, offset: u64) -> Result<(u32, bool)> {
        if block == 0 {
            return Err(FsError::Corrupt(format!("missing level {} index block", level)));
        }
        let mut entries = self.vol.read_words(block)?;
        let span = self.span(level);
        let slot = (offset / span) as usize;
        let freed = if level == 1 {
            std::mem::replace(&mut entries[slot], 0)
        } else {
            let (freed, emptied) = self.clear_last(level - 1, entries[slot], offset % span)?;
            if emptied {
                self.vol.release_block(entries[slot])?;
                entries[slot] = 0;
            }
            freed
        };

        if entries.iter().all(|&e| e == 0) {
            return Ok((freed, true));
        }
        self.vol.write_words(block, &entries)?;
        Ok((freed, false))
    }

    /// Releases every block of `inum`, last to first, index blocks included,
    /// then the inode itself. Returns the number of data blocks released.
    pub fn set_free(&mut self, inum: u32) -> Result<u32> {
        self.check_inode(inum)?;
        let mut freed = 0;
        while self.block_count(inum)? > 0 {
            self.remove_last_block(inum)?;
            freed += 1;
        }
        self.set_file_size(inum, 0)?;
        self.vol.set_inode_state(inum, State::Free)?;
        debug!("released inode {} and {} blocks", inum, freed);
        Ok(freed)
    }

    /// Writes the raw fields of `inum` in a readable form.
    pub fn show<W: Write>(&mut self, inum: u32, out: &mut W) -> Result<()> {
        let inode = self.read(inum)?;
        let size_field = self.sb().size_field();
        write!(out, "inode #{} == [", inum)?;
        for (x, field) in inode.fields[..size_field].iter().enumerate() {
            write!(out, " {}:{}", x, field)?;
        }
        writeln!(out, " size={}]", inode.size())?;
        Ok(())
    }
}
