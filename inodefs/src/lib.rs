//! A small Unix style file system kept in a host file.
//!
//! A volume is carved into a super block, two free bitmaps, an inode table
//! and a data region. Files are inodes whose blocks are reached through
//! direct pointers and up to three levels of indirect index blocks;
//! directories are files holding packed name records.
//!
//! ```no_run
//! use inodefs::io::FileBlockEmulatorBuilder;
//! use inodefs::{Geometry, Volume};
//!
//! let dev = FileBlockEmulatorBuilder::scratch()?
//!     .with_block_count(2048)
//!     .build()?;
//! let mut vol = Volume::format(dev, &Geometry::default())?;
//! let notes = vol.root().create_file("notes", false)?;
//! assert_eq!(vol.root().lookup("notes")?, notes);
//! # Ok::<(), inodefs::FsError>(())
//! ```
mod alloc;
mod dir;
mod error;
mod fs;
pub mod io;
mod node;
mod sb;
mod stream;

pub use crate::alloc::State;
pub use crate::dir::{DirEntry, Directory, Entries};
pub use crate::error::{FsError, Resource, Result, Sentinel};
pub use crate::fs::{Geometry, GeometryBuilder, Volume, ROOT_INODE};
pub use crate::node::{DiskInode, InodeKind, InodeTable};
pub use crate::sb::SuperBlock;
pub use crate::stream::FileStream;
