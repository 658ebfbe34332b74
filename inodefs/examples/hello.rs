use std::io;

use inodefs::io::FileBlockEmulatorBuilder;
use inodefs::{FileStream, Geometry, Volume};

pub fn main() -> inodefs::Result<()> {
    let geometry = Geometry::default();
    let dev = FileBlockEmulatorBuilder::scratch()?
        .with_block_count(geometry.total_blocks() as usize)
        .build()?;

    // create a new volume on the device and populate /
    let mut vol = Volume::format(dev, &geometry)?;
    let docs = vol.root().create_file("docs", true)?;
    let hello = vol.directory(docs).create_file("hello", false)?;
    FileStream::new(hello).append(&mut vol, b"hello, inodes\n")?;

    let mut out = io::stdout();
    vol.root().list(&mut out)?;
    vol.directory(docs).list(&mut out)?;
    vol.inodes().show(hello, &mut out)?;
    Ok(())
}
