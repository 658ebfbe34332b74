use tempfile::NamedTempFile;

use inodefs::io::{FileBlockEmulator, FileBlockEmulatorBuilder};
use inodefs::{
    Directory, FileStream, FsError, Geometry, InodeKind, Resource, Sentinel, State, Volume,
    ROOT_INODE,
};

fn scratch_volume(geometry: &Geometry) -> Volume<FileBlockEmulator> {
    let dev = FileBlockEmulatorBuilder::scratch()
        .unwrap()
        .with_block_count(geometry.total_blocks() as usize)
        .with_block_bytes(geometry.block_bytes() as usize)
        .build()
        .expect("Could not initialize disk emulator.");
    Volume::format(dev, geometry).unwrap()
}

#[test]
fn file_at_capacity_cannot_grow() {
    let mut vol = scratch_volume(&Geometry::default());
    let sb = *vol.super_block();
    assert_eq!(sb.index_fanout(), 128);
    assert_eq!(sb.direct_count, 2);
    let capacity = 2 + 128 + 128 * 128 + 128 * 128 * 128;
    assert_eq!(sb.max_file_blocks(), capacity);

    // Pretend the file is full; the append is refused before any block is touched.
    let inum = vol.inodes().get_free().unwrap();
    vol.inodes()
        .set_file_size(inum, (capacity * 512) as u32)
        .unwrap();
    let before = vol.inodes().read(inum).unwrap();
    let bn = vol.alloc_block().unwrap();
    match vol.inodes().add_block_number(inum, bn) {
        Err(FsError::Exhausted(Resource::FileCapacity)) => (),
        other => panic!("expected capacity error, got {:?}", other),
    }
    assert_eq!(vol.inodes().read(inum).unwrap(), before);
}

#[test]
fn child_directory_links_back_to_root() {
    let mut vol = scratch_volume(&Geometry::default());
    // Binding with parent 0 writes nothing.
    let root_size = vol.inodes().get_file_size(ROOT_INODE).unwrap();
    Directory::new(&mut vol, ROOT_INODE, 0).unwrap();
    assert_eq!(vol.inodes().get_file_size(ROOT_INODE).unwrap(), root_size);

    let child = vol.inodes().get_free().unwrap();
    assert_eq!(child, 2);
    let mut dir = Directory::new(&mut vol, child, ROOT_INODE).unwrap();
    assert_eq!(dir.lookup("..").unwrap(), ROOT_INODE);
    assert_eq!(dir.lookup(".").unwrap(), child);
    assert_eq!(vol.inodes().get_type(child).unwrap(), InodeKind::Directory);
}

#[test]
fn duplicate_names_keep_the_first_inode() {
    let mut vol = scratch_volume(&Geometry::default());
    let mut root = vol.root();
    root.insert("a.txt", 5).unwrap();
    assert!(root.insert("a.txt", 9).is_err());
    assert_eq!(root.lookup("a.txt").unwrap(), 5);
}

#[test]
fn over_long_names_are_stored_truncated() {
    let mut vol = scratch_volume(&Geometry::default());
    let mut root = vol.root();
    root.insert("longnamefile_with_tail", 6).unwrap();
    // name_max is 16, so 15 bytes plus the terminator are kept.
    assert_eq!(root.lookup("longnamefile_wi").unwrap(), 6);
    assert_eq!(root.lookup("longnamefile_with_tail").or_sentinel(), 0);
}

#[test]
fn seeds_survive_other_inserts_and_deletes() {
    let mut vol = scratch_volume(&Geometry::default());
    let sub = vol.root().create_file("sub", true).unwrap();
    let mut dir = vol.directory(sub);
    for name in &["x", "y", "z"] {
        dir.create_file(name, false).unwrap();
    }
    dir.delete("y", true).unwrap();
    dir.delete("x", true).unwrap();
    assert_eq!(dir.lookup(".").unwrap(), sub);
    assert_eq!(dir.lookup("..").unwrap(), ROOT_INODE);
    assert!(dir.lookup("z").is_ok());
}

#[test]
fn deleting_a_large_file_frees_every_block() {
    let mut vol = scratch_volume(&Geometry::default());
    let free_blocks = vol.free_blocks();
    let free_inodes = vol.free_inodes();

    let inum = vol.root().create_file("big", false).unwrap();
    // 200 blocks reach into the double indirect range.
    let content: Vec<u8> = (0..200 * 512).map(|i| (i % 253) as u8).collect();
    FileStream::new(inum).append(&mut vol, &content).unwrap();
    assert_eq!(vol.inodes().block_count(inum).unwrap(), 200);
    let blocks: Vec<u32> = (0..200)
        .map(|nth| vol.inodes().get_block_number(inum, nth).unwrap())
        .collect();

    let mut read_back = vec![0; content.len()];
    FileStream::new(inum).read(&mut vol, &mut read_back).unwrap();
    assert_eq!(read_back, content);

    assert_eq!(vol.root().delete("big", true).unwrap(), inum);
    for bn in blocks {
        assert_eq!(vol.block_state(bn).unwrap(), State::Free);
    }
    assert_eq!(vol.free_blocks(), free_blocks);
    assert_eq!(vol.free_inodes(), free_inodes);
    assert_eq!(vol.inodes().get_free().unwrap(), inum);
}

#[test]
fn volume_survives_reopening() {
    let disk = NamedTempFile::new().unwrap();
    let geometry = Geometry::builder()
        .block_bytes(256)
        .total_blocks(1024)
        .inode_count(64)
        .build()
        .unwrap();
    let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(1024)
        .with_block_bytes(256)
        .build()
        .unwrap();
    let mut vol = Volume::format(dev, &geometry).unwrap();
    let docs = vol.root().create_file("docs", true).unwrap();
    let readme = vol.directory(docs).create_file("readme", false).unwrap();
    FileStream::new(readme)
        .append(&mut vol, b"inodes all the way down\n")
        .unwrap();
    vol.sync().unwrap();
    drop(vol);

    let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(1024)
        .with_block_bytes(256)
        .clear_medium(false)
        .build()
        .unwrap();
    let mut vol = Volume::open(dev).unwrap();
    assert_eq!(vol.root().lookup("docs").unwrap(), docs);
    assert_eq!(vol.directory(docs).lookup("readme").unwrap(), readme);
    assert_eq!(vol.directory(docs).lookup("..").unwrap(), ROOT_INODE);

    let mut buf = vec![0; 64];
    let n = FileStream::new(readme).read(&mut vol, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"inodes all the way down\n");

    // Allocation picks up where the first session stopped.
    let next = vol.inodes().get_free().unwrap();
    assert!(next > readme);
}

#[test]
fn running_out_of_inodes_is_reported() {
    let geometry = Geometry::builder().inode_count(4).build().unwrap();
    let mut vol = scratch_volume(&geometry);
    let mut root = vol.root();
    root.create_file("a", false).unwrap();
    root.create_file("b", false).unwrap();
    match root.create_file("c", false) {
        Err(FsError::Exhausted(Resource::Inode)) => (),
        other => panic!("expected inode exhaustion, got {:?}", other),
    }
    assert_eq!(root.create_file("d", false).or_sentinel(), 0);
    assert!(root.lookup("c").is_err());
}

#[test]
fn unformatted_images_are_rejected() {
    let disk = NamedTempFile::new().unwrap();
    let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(64)
        .build()
        .unwrap();
    assert!(matches!(Volume::open(dev), Err(FsError::Corrupt(_))));
}
