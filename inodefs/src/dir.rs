use std::io::Write;

use log::debug;

use crate::alloc::State;
use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::io::BlockStorage;
use crate::node::InodeKind;
use crate::sb::INODE_WIDTH;
use crate::stream::FileStream;

const DOT: &[u8] = b".";
const DOTDOT: &[u8] = b"..";

/// One record of a directory: a name and the inode it refers to.
///
/// On disk a record is the name bytes, a NUL terminator, then the inode
/// number as a native `u32`. Records are packed back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: Vec<u8>,
    inode: u32,
}

impl DirEntry {
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn inode(&self) -> u32 {
        self.inode
    }

    /// `.` or `..`, written when the directory is created.
    pub fn is_seed(&self) -> bool {
        self.name == DOT || self.name == DOTDOT
    }

    fn record_len(&self) -> u32 {
        self.name.len() as u32 + 1 + INODE_WIDTH
    }

    fn encode(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(self.record_len() as usize);
        record.extend_from_slice(&self.name);
        record.push(0);
        record.extend_from_slice(&self.inode.to_ne_bytes());
        record
    }
}

/// Reads the record under the cursor, or `None` at the end of the directory.
fn read_record<T: BlockStorage>(vol: &mut Volume<T>, stream: &mut FileStream) -> Result<Option<DirEntry>> {
    let mut name = Vec::new();
    loop {
        match stream.next_byte(vol)? {
            Some(0) => break,
            Some(b) => name.push(b),
            None if name.is_empty() => return Ok(None),
            None => {
                return Err(FsError::Corrupt(format!(
                    "directory {} ends inside a name",
                    stream.inode()
                )))
            }
        }
    }
    if name.is_empty() {
        return Err(FsError::Corrupt(format!(
            "directory {} holds an empty name",
            stream.inode()
        )));
    }

    let mut number = [0; INODE_WIDTH as usize];
    if stream.read(vol, &mut number)? != number.len() {
        return Err(FsError::Corrupt(format!(
            "directory {} ends inside an inode number",
            stream.inode()
        )));
    }
    Ok(Some(DirEntry {
        name,
        inode: u32::from_ne_bytes(number),
    }))
}

/// Checks the syntax of a single path component and cuts it down to at
/// most `name_max - 1` bytes. The cut never splits a character, so the
/// stored form is always a valid `&str` to look up.
fn leaf_name(name: &str, name_max: u32) -> Result<Vec<u8>> {
    let starts_well = name
        .bytes()
        .next()
        .map_or(false, |b| b.is_ascii_alphanumeric() || b == b'.');
    if !starts_well || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidArgument(format!("bad file name {:?}", name)));
    }
    let mut end = name.len().min(name_max.saturating_sub(1) as usize);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    Ok(name[..end].as_bytes().to_vec())
}

/// Walks the records of one directory in order.
pub struct Entries<'a, T: BlockStorage> {
    vol: &'a mut Volume<T>,
    stream: FileStream,
    done: bool,
}

impl<'a, T: BlockStorage> Iterator for Entries<'a, T> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record(self.vol, &mut self.stream) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A directory: a file whose content is a sequence of name records.
pub struct Directory<'v, T: BlockStorage> {
    vol: &'v mut Volume<T>,
    inum: u32,
}

impl<'v, T: BlockStorage> Directory<'v, T> {
    /// Binds to directory `inum`. With a nonzero `parent` the inode is
    /// formatted as a new directory first: marked in use, tagged, emptied
    /// and seeded with `.` and `..`.
    pub fn new(vol: &'v mut Volume<T>, inum: u32, parent: u32) -> Result<Self> {
        vol.inodes().check_inode(inum)?;
        if parent != 0 {
            vol.inodes().check_inode(parent)?;
            vol.set_inode_state(inum, State::Used)?;
            vol.inodes().set_type(inum, InodeKind::Directory)?;
            FileStream::new(inum).truncate(vol, 0)?;
        }

        let mut dir = Directory { vol, inum };
        if parent != 0 {
            dir.insert_leaf(DOT.to_vec(), inum)?;
            dir.insert_leaf(DOTDOT.to_vec(), parent)?;
            debug!("formatted directory {} under {}", inum, parent);
        }
        Ok(dir)
    }

    /// Binds to an existing directory without touching the disk.
    pub fn open(vol: &'v mut Volume<T>, inum: u32) -> Self {
        Directory { vol, inum }
    }

    pub fn inode(&self) -> u32 {
        self.inum
    }

    /// Records in insertion order, seeds included. Each call starts over
    /// from the first record.
    pub fn entries(&mut self) -> Entries<'_, T> {
        Entries {
            vol: &mut *self.vol,
            stream: FileStream::new(self.inum),
            done: false,
        }
    }

    /// The first record named `name`, and a stream positioned just past it.
    fn find(&mut self, name: &[u8]) -> Result<Option<(DirEntry, FileStream)>> {
        let mut stream = FileStream::new(self.inum);
        while let Some(entry) = read_record(self.vol, &mut stream)? {
            if entry.name == name {
                return Ok(Some((entry, stream)));
            }
        }
        Ok(None)
    }

    /// Inode recorded under `name`. Names are compared byte for byte, so a
    /// name stored truncated is only found by its truncated form.
    pub fn lookup(&mut self, name: &str) -> Result<u32> {
        match self.find(name.as_bytes())? {
            Some((entry, _)) => Ok(entry.inode),
            None => Err(FsError::DoesNotExist),
        }
    }

    /// Record referring to `inum`, if any.
    pub fn name_of(&mut self, inum: u32) -> Result<DirEntry> {
        for entry in self.entries() {
            let entry = entry?;
            if entry.inode == inum && !entry.is_seed() {
                return Ok(entry);
            }
        }
        Err(FsError::DoesNotExist)
    }

    /// Refuses to add records to an inode that is not a directory.
    fn ensure_directory(&mut self) -> Result<()> {
        match self.vol.inodes().get_type(self.inum)? {
            InodeKind::Directory => Ok(()),
            _ => Err(FsError::Refused(format!(
                "inode {} is not a directory",
                self.inum
            ))),
        }
    }

    /// Appends a record for `name`. Names longer than the volume allows are
    /// cut short; an existing record of the same name is left alone and the
    /// insert refused.
    pub fn insert(&mut self, name: &str, inum: u32) -> Result<()> {
        if inum == 0 {
            return Err(FsError::InvalidArgument(format!(
                "cannot link {:?} to inode 0",
                name
            )));
        }
        self.ensure_directory()?;
        let name = leaf_name(name, self.vol.super_block().name_max)?;
        self.insert_leaf(name, inum)
    }

    fn insert_leaf(&mut self, name: Vec<u8>, inum: u32) -> Result<()> {
        if self.find(&name)?.is_some() {
            return Err(FsError::Refused(format!(
                "{} already exists in directory {}",
                String::from_utf8_lossy(&name),
                self.inum
            )));
        }
        let record = DirEntry { name, inode: inum }.encode();
        FileStream::new(self.inum).append(self.vol, &record)
    }

    /// Removes the record for `name` and returns its inode, releasing the
    /// inode and all its blocks when `release` is set. `.` and `..` are
    /// never removed.
    pub fn delete(&mut self, name: &str, release: bool) -> Result<u32> {
        if name.as_bytes() == DOT || name.as_bytes() == DOTDOT {
            return Err(FsError::Refused(format!("cannot delete {:?}", name)));
        }
        let (entry, mut stream) = self.find(name.as_bytes())?.ok_or(FsError::DoesNotExist)?;
        stream.delete_preceding(self.vol, entry.record_len())?;
        if release {
            self.vol.inodes().set_free(entry.inode)?;
        }
        debug!("unlinked {} (inode {}) from {}", name, entry.inode, self.inum);
        Ok(entry.inode)
    }

    /// True when nothing but `.` and `..` is recorded.
    pub fn is_empty(&mut self) -> Result<bool> {
        for entry in self.entries() {
            if !entry?.is_seed() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Writes a line per record other than `.` and `..`, in the manner of
    /// `ls -l`, and returns how many were written.
    pub fn list<W: Write>(&mut self, out: &mut W) -> Result<u32> {
        let entries = self.entries().collect::<Result<Vec<_>>>()?;
        let mut count = 0;
        for entry in entries.iter().filter(|e| !e.is_seed()) {
            let mut inodes = self.vol.inodes();
            let kind = match inodes.get_type(entry.inode)? {
                InodeKind::Directory => 'd',
                _ => '-',
            };
            let size = inodes.get_file_size(entry.inode)?;
            writeln!(
                out,
                "{:7} {}rw-rw-rw- {:7} {}",
                entry.inode,
                kind,
                size,
                entry.name_lossy()
            )?;
            count += 1;
        }
        Ok(count)
    }

    /// Creates `name` as an empty file or directory, returning its inode.
    /// An existing entry of that name is returned as is.
    pub fn create_file(&mut self, name: &str, as_dir: bool) -> Result<u32> {
        self.ensure_directory()?;
        let leaf = leaf_name(name, self.vol.super_block().name_max)?;
        if let Some((entry, _)) = self.find(&leaf)? {
            return Ok(entry.inode);
        }

        let inum = self.vol.inodes().get_free()?;
        let made = if as_dir {
            Directory::new(&mut *self.vol, inum, self.inum).map(|_| ())
        } else {
            self.vol.inodes().set_type(inum, InodeKind::Ordinary).map(|_| ())
        };
        if let Err(e) = made.and_then(|_| self.insert_leaf(leaf, inum)) {
            self.vol.inodes().set_free(inum)?;
            return Err(e);
        }
        Ok(inum)
    }

    /// Moves the record `name` from directory `from` into this one, keeping
    /// its inode. A moved directory has its `..` pointed here.
    pub fn move_entry(&mut self, name: &str, from: u32) -> Result<u32> {
        let bytes = name.as_bytes();
        if bytes == DOT || bytes == DOTDOT {
            return Err(FsError::Refused(format!("cannot move {:?}", name)));
        }
        self.ensure_directory()?;
        let inum = Directory::open(&mut *self.vol, from).lookup(name)?;
        if self.find(bytes)?.is_some() {
            return Err(FsError::Refused(format!(
                "{} already exists in directory {}",
                name, self.inum
            )));
        }
        let is_dir = self.vol.inodes().get_type(inum)? == InodeKind::Directory;
        if is_dir && self.descends_from(inum)? {
            return Err(FsError::Refused(format!(
                "cannot move directory {} into itself",
                name
            )));
        }

        Directory::open(&mut *self.vol, from).delete(name, false)?;
        if let Err(e) = self.insert_leaf(bytes.to_vec(), inum) {
            Directory::open(&mut *self.vol, from).insert_leaf(bytes.to_vec(), inum)?;
            return Err(e);
        }
        if is_dir {
            Directory::open(&mut *self.vol, inum).relink_parent(self.inum)?;
        }
        debug!("moved {} (inode {}) from {} to {}", name, inum, from, self.inum);
        Ok(inum)
    }

    /// Whether this directory is `ancestor` or lies somewhere below it.
    fn descends_from(&mut self, ancestor: u32) -> Result<bool> {
        let mut at = self.inum;
        loop {
            if at == ancestor {
                return Ok(true);
            }
            let parent = Directory::open(&mut *self.vol, at).lookup("..")?;
            if parent == at {
                return Ok(false);
            }
            at = parent;
        }
    }

    /// Rewrites the inode number of `..` in place.
    fn relink_parent(&mut self, parent: u32) -> Result<()> {
        let (_, mut stream) = self
            .find(DOTDOT)?
            .ok_or_else(|| FsError::Corrupt(format!("directory {} has no parent link", self.inum)))?;
        let at = stream.position() - INODE_WIDTH;
        stream.write_at(self.vol, at, &parent.to_ne_bytes())
    }
}
