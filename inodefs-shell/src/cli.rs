use std::path::PathBuf;

use clap::Parser;
use inodefs::Geometry;

/// Interactive shell over an inodefs disk image.
#[derive(Parser)]
pub struct Cli {
    /// Disk image to open; a scratch volume is used when omitted
    pub image: Option<PathBuf>,

    /// Format the image instead of opening the file system already on it
    #[arg(long)]
    pub format: bool,

    /// Read commands from this file instead of stdin
    #[arg(long, short)]
    pub script: Option<PathBuf>,

    /// Bytes per block
    #[arg(long, default_value_t = 512)]
    pub block_bytes: u32,

    /// Blocks on a freshly formatted volume
    #[arg(long, default_value_t = 2048)]
    pub blocks: u32,

    /// Inodes on a freshly formatted volume, inode 0 included
    #[arg(long, default_value_t = 128)]
    pub inodes: u32,

    /// Fields per inode; 5, 6 and 7 add single, double and triple indirect pointers
    #[arg(long, default_value_t = 7)]
    pub inode_height: u32,

    /// Longest file name, counting its terminator
    #[arg(long, default_value_t = 16)]
    pub name_max: u32,
}

impl Cli {
    pub fn geometry(&self) -> inodefs::Result<Geometry> {
        Geometry::builder()
            .block_bytes(self.block_bytes)
            .total_blocks(self.blocks)
            .inode_count(self.inodes)
            .inode_height(self.inode_height)
            .name_max(self.name_max)
            .build()
    }
}
