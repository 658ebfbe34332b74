use log::{debug, info};
use zerocopy::AsBytes;

use crate::alloc::{FreeBitmap, State};
use crate::dir::Directory;
use crate::error::{FsError, Resource, Result};
use crate::io::BlockStorage;
use crate::node::InodeTable;
use crate::sb::{SuperBlock, INODE_WIDTH};

/// Known locations.
const SUPERBLOCK_INDEX: u32 = 0;
const INODE_BMP: u32 = 1;

/// Inode of the root directory. Inode 0 is never allocated so that 0 can
/// stand for "no inode".
pub const ROOT_INODE: u32 = 1;

/// Parameters a volume is formatted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    block_bytes: u32,
    total_blocks: u32,
    inode_count: u32,
    inode_height: u32,
    name_max: u32,
}

impl Default for Geometry {
    /// A small teaching volume: 1 MiB of 512 byte blocks, 128 inodes with
    /// direct, single, double and triple indirect pointers, and names of up
    /// to 15 bytes.
    fn default() -> Self {
        Self {
            block_bytes: 512,
            total_blocks: 2048,
            inode_count: 128,
            inode_height: 7,
            name_max: 16,
        }
    }
}

impl Geometry {
    pub fn builder() -> GeometryBuilder {
        GeometryBuilder {
            geometry: Geometry::default(),
        }
    }

    pub fn block_bytes(&self) -> u32 {
        self.block_bytes
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn inode_count(&self) -> u32 {
        self.inode_count
    }

    pub fn inode_height(&self) -> u32 {
        self.inode_height
    }

    pub fn name_max(&self) -> u32 {
        self.name_max
    }

    /// Blocks taken by the super block, both bitmaps and the inode table.
    fn metadata_blocks(&self) -> u32 {
        let block_bytes = self.block_bytes as usize;
        let inodes_per_block = self.block_bytes / (INODE_WIDTH * self.inode_height);
        1 + FreeBitmap::blocks_needed(self.inode_count, block_bytes) as u32
            + FreeBitmap::blocks_needed(self.total_blocks, block_bytes) as u32
            + (self.inode_count + inodes_per_block - 1) / inodes_per_block
    }
}

pub struct GeometryBuilder {
    geometry: Geometry,
}

impl GeometryBuilder {
    /// Size of a block in bytes, a multiple of the inode field width.
    pub fn block_bytes(mut self, bytes: u32) -> Self {
        self.geometry.block_bytes = bytes;
        self
    }

    pub fn total_blocks(mut self, blocks: u32) -> Self {
        self.geometry.total_blocks = blocks;
        self
    }

    /// Size of the inode table, inode 0 included.
    pub fn inode_count(mut self, inodes: u32) -> Self {
        self.geometry.inode_count = inodes;
        self
    }

    /// Fields per inode. Heights 5, 6 and 7 add single, double and triple
    /// indirect pointers; anything taller adds direct pointers.
    pub fn inode_height(mut self, height: u32) -> Self {
        self.geometry.inode_height = height;
        self
    }

    /// Longest file name, counting its terminator.
    pub fn name_max(mut self, name_max: u32) -> Self {
        self.geometry.name_max = name_max;
        self
    }

    pub fn build(self) -> Result<Geometry> {
        let g = self.geometry;
        let invalid = |msg: String| Err(FsError::InvalidArgument(msg));
        if g.block_bytes % INODE_WIDTH != 0 || (g.block_bytes as usize) < SuperBlock::SIZE {
            return invalid(format!("block size {} unusable", g.block_bytes));
        }
        if g.inode_height < 3 {
            return invalid(format!("inode height {} below 3", g.inode_height));
        }
        if g.block_bytes / (INODE_WIDTH * g.inode_height) == 0 {
            return invalid(format!(
                "inode of height {} exceeds a {} byte block",
                g.inode_height, g.block_bytes
            ));
        }
        if g.inode_count < 2 {
            return invalid("at least two inodes are needed".to_string());
        }
        if g.name_max < 2 {
            return invalid(format!("name length {} leaves no room for a name", g.name_max));
        }
        if g.total_blocks <= g.metadata_blocks() {
            return invalid(format!(
                "{} blocks leave no data region after {} metadata blocks",
                g.total_blocks,
                g.metadata_blocks()
            ));
        }
        Ok(g)
    }
}

/// Recomputes what `format` derives from the block size, inode count and
/// height, and rejects a super block that disagrees.
fn check_layout(sb: &SuperBlock) -> Result<()> {
    let mismatch = |field: &str, found: u32, expected: u64| {
        Err(FsError::Corrupt(format!(
            "super block {} is {}, expected {}",
            field, found, expected
        )))
    };
    if (sb.bytes_per_block as usize) < SuperBlock::SIZE || sb.bytes_per_block % INODE_WIDTH != 0 {
        return Err(FsError::Corrupt(format!(
            "block size {} unusable",
            sb.bytes_per_block
        )));
    }
    if sb.inodes_count < 2 || sb.name_max < 2 {
        return Err(FsError::Corrupt(format!(
            "{} inodes with names of {} bytes",
            sb.inodes_count, sb.name_max
        )));
    }

    let block_bytes = sb.bytes_per_block as usize;
    let inode_bytes = u64::from(INODE_WIDTH) * u64::from(sb.inode_height);
    let inodes_per_block = u64::from(sb.bytes_per_block) / inode_bytes;
    if inodes_per_block == 0 || u64::from(sb.inodes_per_block) != inodes_per_block {
        return mismatch("inodes per block", sb.inodes_per_block, inodes_per_block);
    }
    let direct = u64::from(sb.inode_height) - 2 - u64::from(sb.indirect_levels());
    if u64::from(sb.direct_count) != direct {
        return mismatch("direct count", sb.direct_count, direct);
    }
    if sb.inode_bitmap_start != INODE_BMP {
        return mismatch("inode bitmap start", sb.inode_bitmap_start, INODE_BMP.into());
    }
    let block_bitmap_start =
        u64::from(INODE_BMP) + FreeBitmap::blocks_needed(sb.inodes_count, block_bytes) as u64;
    if u64::from(sb.block_bitmap_start) != block_bitmap_start {
        return mismatch("block bitmap start", sb.block_bitmap_start, block_bitmap_start);
    }
    let inodes_start =
        block_bitmap_start + FreeBitmap::blocks_needed(sb.total_blocks, block_bytes) as u64;
    if u64::from(sb.inodes_start) != inodes_start {
        return mismatch("inode table start", sb.inodes_start, inodes_start);
    }
    let inode_blocks = (u64::from(sb.inodes_count) + inodes_per_block - 1) / inodes_per_block;
    if u64::from(sb.inode_blocks) != inode_blocks {
        return mismatch("inode table length", sb.inode_blocks, inode_blocks);
    }
    if inodes_start + inode_blocks >= u64::from(sb.total_blocks) {
        return mismatch("total blocks", sb.total_blocks, inodes_start + inode_blocks + 1);
    }
    Ok(())
}

/// A formatted volume on block storage.
///
/// # Layout
/// ==============================================================================
/// | SuperBlock | Bitmap (inodes) | Bitmap (blocks) | Inode table | Data Region |
/// ==============================================================================
#[derive(Debug)]
pub struct Volume<T: BlockStorage> {
    dev: T,
    super_block: SuperBlock,
    inode_map: FreeBitmap,
    block_map: FreeBitmap,
}

impl<T: BlockStorage> Volume<T> {
    /// Formats `dev` and creates the root directory at `ROOT_INODE`, which is
    /// its own parent.
    pub fn format(dev: T, geometry: &Geometry) -> Result<Self> {
        let block_bytes = dev.block_bytes();
        if block_bytes != geometry.block_bytes as usize {
            return Err(FsError::InvalidArgument(format!(
                "device blocks are {} bytes, geometry wants {}",
                block_bytes, geometry.block_bytes
            )));
        }
        if geometry.total_blocks as usize > dev.block_count() {
            return Err(FsError::InvalidArgument(format!(
                "device holds {} blocks, geometry wants {}",
                dev.block_count(),
                geometry.total_blocks
            )));
        }

        let mut super_block = SuperBlock::new();
        super_block.bytes_per_block = geometry.block_bytes;
        super_block.total_blocks = geometry.total_blocks;
        super_block.name_max = geometry.name_max;
        super_block.inode_bitmap_start = INODE_BMP;
        super_block.block_bitmap_start =
            INODE_BMP + FreeBitmap::blocks_needed(geometry.inode_count, block_bytes) as u32;
        let inodes_start = super_block.block_bitmap_start
            + FreeBitmap::blocks_needed(geometry.total_blocks, block_bytes) as u32;

        let mut vol = Volume {
            inode_map: FreeBitmap::new(INODE_BMP as usize, geometry.inode_count, block_bytes),
            block_map: FreeBitmap::new(
                super_block.block_bitmap_start as usize,
                geometry.total_blocks,
                block_bytes,
            ),
            dev,
            super_block,
        };
        vol.inode_map.flush(&mut vol.dev)?;
        vol.block_map.flush(&mut vol.dev)?;
        for bn in SUPERBLOCK_INDEX..inodes_start {
            vol.set_block_state(bn, State::Used)?;
        }
        vol.set_inode_state(0, State::Used)?;

        InodeTable::create(
            &mut vol,
            inodes_start,
            geometry.inode_count,
            geometry.inode_height,
        )?;

        let root = vol.inodes().get_free()?;
        debug_assert_eq!(root, ROOT_INODE);
        Directory::new(&mut vol, root, root)?;
        vol.sync()?;

        info!(
            "formatted volume: {} blocks of {} bytes, {} inodes of height {}, {} blocks free",
            geometry.total_blocks,
            geometry.block_bytes,
            geometry.inode_count,
            geometry.inode_height,
            vol.free_blocks()
        );
        Ok(vol)
    }

    /// Attaches to a volume previously written by `format`.
    pub fn open(mut dev: T) -> Result<Self> {
        let mut block_buf = vec![0; dev.block_bytes().max(SuperBlock::SIZE)];
        dev.read_block(SUPERBLOCK_INDEX as usize, &mut block_buf)?;
        let super_block = SuperBlock::parse(&block_buf)?;

        if super_block.bytes_per_block as usize != dev.block_bytes() {
            return Err(FsError::Corrupt(format!(
                "volume has {} byte blocks, device has {}",
                super_block.bytes_per_block,
                dev.block_bytes()
            )));
        }
        if super_block.total_blocks as usize > dev.block_count() {
            return Err(FsError::Corrupt(format!(
                "volume spans {} blocks, device has {}",
                super_block.total_blocks,
                dev.block_count()
            )));
        }
        if super_block.inode_width != INODE_WIDTH || super_block.inode_height < 3 {
            return Err(FsError::Corrupt(format!(
                "unsupported inode shape {}x{}",
                super_block.inode_width, super_block.inode_height
            )));
        }
        check_layout(&super_block)?;

        let block_bytes = dev.block_bytes();
        let inode_map = FreeBitmap::load(
            &mut dev,
            super_block.inode_bitmap_start as usize,
            super_block.inodes_count,
            block_bytes,
        )?;
        let block_map = FreeBitmap::load(
            &mut dev,
            super_block.block_bitmap_start as usize,
            super_block.total_blocks,
            block_bytes,
        )?;

        info!(
            "opened volume: {} blocks ({} free), {} inodes ({} free)",
            super_block.total_blocks,
            block_map.count_free(),
            super_block.inodes_count,
            inode_map.count_free()
        );
        Ok(Volume {
            dev,
            super_block,
            inode_map,
            block_map,
        })
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub(crate) fn super_block_mut(&mut self) -> &mut SuperBlock {
        &mut self.super_block
    }

    pub(crate) fn write_super_block(&mut self) -> Result<()> {
        let encoded = self.super_block.serialize(self.block_bytes());
        self.write_block(SUPERBLOCK_INDEX, &encoded)
    }

    pub fn block_bytes(&self) -> usize {
        self.dev.block_bytes()
    }

    pub fn inodes(&mut self) -> InodeTable<'_, T> {
        InodeTable::new(self)
    }

    pub fn root(&mut self) -> Directory<'_, T> {
        Directory::open(self, ROOT_INODE)
    }

    /// Binds to the existing directory at `inum` without touching the disk.
    pub fn directory(&mut self, inum: u32) -> Directory<'_, T> {
        Directory::open(self, inum)
    }

    pub fn read_block(&mut self, bn: u32, buf: &mut [u8]) -> Result<()> {
        self.dev.read_block(bn as usize, buf)?;
        Ok(())
    }

    pub fn write_block(&mut self, bn: u32, buf: &[u8]) -> Result<()> {
        self.dev.write_block(bn as usize, buf)?;
        Ok(())
    }

    /// Reads a block as an array of native `u32`s: inode table and index blocks.
    pub(crate) fn read_words(&mut self, bn: u32) -> Result<Vec<u32>> {
        let mut words = vec![0u32; self.block_bytes() / INODE_WIDTH as usize];
        self.dev.read_block(bn as usize, words.as_bytes_mut())?;
        Ok(words)
    }

    pub(crate) fn write_words(&mut self, bn: u32, words: &[u32]) -> Result<()> {
        self.dev.write_block(bn as usize, words.as_bytes())?;
        Ok(())
    }

    /// Reserves the lowest free block and zero fills it.
    pub fn alloc_block(&mut self) -> Result<u32> {
        let bn = self
            .block_map
            .first_free()
            .ok_or(FsError::Exhausted(Resource::Block))?;
        let zeros = vec![0; self.block_bytes()];
        self.write_block(bn, &zeros)?;
        self.block_map.set(&mut self.dev, bn, State::Used)?;
        debug!("allocated block {}", bn);
        Ok(bn)
    }

    pub fn release_block(&mut self, bn: u32) -> Result<()> {
        if bn == 0 || bn >= self.super_block.total_blocks {
            return Err(FsError::InvalidArgument(format!("block number {}", bn)));
        }
        self.block_map.set(&mut self.dev, bn, State::Free)?;
        debug!("released block {}", bn);
        Ok(())
    }

    /// Whether block `bn` is allocated.
    pub fn block_state(&self, bn: u32) -> Result<State> {
        if bn >= self.super_block.total_blocks {
            return Err(FsError::InvalidArgument(format!("block number {}", bn)));
        }
        Ok(self.block_map.get(bn))
    }

    pub(crate) fn set_block_state(&mut self, bn: u32, state: State) -> Result<()> {
        self.block_map.set(&mut self.dev, bn, state)
    }

    pub fn inode_state(&self, inum: u32) -> Result<State> {
        if inum >= self.super_block.inodes_count {
            return Err(FsError::InvalidArgument(format!("inode number {}", inum)));
        }
        Ok(self.inode_map.get(inum))
    }

    pub(crate) fn first_free_inode(&self) -> Option<u32> {
        self.inode_map.first_free()
    }

    pub(crate) fn set_inode_state(&mut self, inum: u32, state: State) -> Result<()> {
        self.inode_map.set(&mut self.dev, inum, state)
    }

    pub fn free_blocks(&self) -> u32 {
        self.block_map.count_free()
    }

    pub fn free_inodes(&self) -> u32 {
        self.inode_map.count_free()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync_disk()?;
        Ok(())
    }

    /// Returns ownership of the underlying storage to the caller.
    pub fn into_device(self) -> T {
        self.dev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileBlockEmulator, FileBlockEmulatorBuilder};

    fn create_test_device(blocks: usize) -> FileBlockEmulator {
        FileBlockEmulatorBuilder::scratch()
            .unwrap()
            .with_block_count(blocks)
            .build()
            .expect("Could not initialize disk emulator.")
    }

    #[test]
    fn default_geometry_is_valid() {
        let built = Geometry::builder().build().unwrap();
        assert_eq!(built, Geometry::default());
    }

    #[test]
    fn builder_rejects_degenerate_geometry() {
        assert!(Geometry::builder().inode_height(2).build().is_err());
        assert!(Geometry::builder().block_bytes(510).build().is_err());
        assert!(Geometry::builder().block_bytes(32).build().is_err());
        assert!(Geometry::builder().inode_count(1).build().is_err());
        assert!(Geometry::builder().name_max(1).build().is_err());
        assert!(Geometry::builder().total_blocks(4).build().is_err());
        // 64 byte blocks cannot hold an inode of 17 four byte fields.
        assert!(Geometry::builder()
            .block_bytes(64)
            .inode_height(17)
            .build()
            .is_err());
    }

    #[test]
    fn format_lays_out_metadata_and_root() {
        let mut vol = Volume::format(create_test_device(2048), &Geometry::default()).unwrap();
        let sb = *vol.super_block();
        assert_eq!(sb.inode_bitmap_start, 1);
        assert_eq!(sb.block_bitmap_start, 2);
        assert_eq!(sb.inodes_start, 3);
        assert_eq!(sb.inode_blocks, 8);

        for bn in 0..sb.inodes_start + sb.inode_blocks {
            assert_eq!(vol.block_state(bn).unwrap(), State::Used);
        }
        assert_eq!(vol.inode_state(0).unwrap(), State::Used);
        assert_eq!(vol.inode_state(ROOT_INODE).unwrap(), State::Used);
        assert_eq!(vol.free_inodes(), 126);
        // Metadata plus the root directory's first block.
        assert_eq!(vol.free_blocks(), 2048 - 11 - 1);

        let mut root = vol.root();
        assert_eq!(root.lookup(".").unwrap(), ROOT_INODE);
        assert_eq!(root.lookup("..").unwrap(), ROOT_INODE);
    }

    #[test]
    fn format_rejects_mismatched_device() {
        let geometry = Geometry::builder().block_bytes(1024).build().unwrap();
        assert!(Volume::format(create_test_device(2048), &geometry).is_err());

        let geometry = Geometry::builder().total_blocks(4096).build().unwrap();
        assert!(Volume::format(create_test_device(2048), &geometry).is_err());
    }

    #[test]
    fn alloc_block_zero_fills_and_release_frees() {
        let mut vol = Volume::format(create_test_device(2048), &Geometry::default()).unwrap();
        let bn = vol.alloc_block().unwrap();
        vol.write_block(bn, &[0xEE; 512]).unwrap();
        vol.release_block(bn).unwrap();
        assert_eq!(vol.block_state(bn).unwrap(), State::Free);

        let again = vol.alloc_block().unwrap();
        assert_eq!(again, bn);
        let mut buf = vec![0xFF; 512];
        vol.read_block(again, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 512]);
    }

    #[test]
    fn release_rejects_reserved_numbers() {
        let mut vol = Volume::format(create_test_device(2048), &Geometry::default()).unwrap();
        assert!(vol.release_block(0).is_err());
        assert!(vol.release_block(2048).is_err());
    }

    #[test]
    fn state_of_unknown_numbers_is_an_error() {
        let vol = Volume::format(create_test_device(2048), &Geometry::default()).unwrap();
        assert_eq!(vol.block_state(2047).unwrap(), State::Free);
        assert!(matches!(vol.block_state(2048), Err(FsError::InvalidArgument(_))));
        assert_eq!(vol.inode_state(127).unwrap(), State::Free);
        assert!(matches!(vol.inode_state(128), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn open_rejects_inconsistent_layout() {
        let tamper: [fn(&mut SuperBlock); 4] = [
            |sb| sb.inodes_per_block = 0,
            |sb| sb.direct_count += 1,
            |sb| sb.inodes_start -= 1,
            |sb| sb.inode_blocks = 1,
        ];
        for edit in tamper.iter() {
            let mut vol = Volume::format(create_test_device(2048), &Geometry::default()).unwrap();
            edit(vol.super_block_mut());
            vol.write_super_block().unwrap();
            match Volume::open(vol.into_device()) {
                Err(FsError::Corrupt(_)) => (),
                other => panic!("expected corrupt volume, got {:?}", other.map(|_| ())),
            }
        }

        // Untouched, the same image opens.
        let vol = Volume::format(create_test_device(2048), &Geometry::default()).unwrap();
        assert!(Volume::open(vol.into_device()).is_ok());
    }

    #[test]
    fn can_create_and_reopen_initialized_filesystem() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2048)
            .build()
            .unwrap();
        let mut vol = Volume::format(dev, &Geometry::default()).unwrap();
        let file = vol.root().create_file("notes", false).unwrap();
        let free_blocks = vol.free_blocks();
        let sb = *vol.super_block();
        drop(vol);

        let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2048)
            // Don't reset initialized disk.
            .clear_medium(false)
            .build()
            .unwrap();
        let mut vol = Volume::open(dev).unwrap();
        assert_eq!(*vol.super_block(), sb);
        assert_eq!(vol.free_blocks(), free_blocks);
        assert_eq!(vol.inode_state(file).unwrap(), State::Used);
        assert_eq!(vol.root().lookup("notes").unwrap(), file);
    }

    #[test]
    fn opening_unformatted_disk_fails() {
        match Volume::open(create_test_device(16)) {
            Err(FsError::Corrupt(_)) => (),
            other => panic!("expected corrupt volume, got {:?}", other.map(|_| ())),
        }
    }
}
