use std::fs;
use std::io::{self, Write};

use inodefs::io::BlockStorage;
use inodefs::{FileStream, FsError, InodeKind, Sentinel, Volume, ROOT_INODE};
use log::warn;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("host i/o: {0}")]
    Host(#[from] io::Error),
    #[error("{0}")]
    Usage(String),
}

type Result<T> = std::result::Result<T, ShellError>;

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// The mounted volume and the working directory commands run against.
pub struct Session<T: BlockStorage> {
    vol: Volume<T>,
    cwd: u32,
}

fn usage(msg: &str) -> ShellError {
    ShellError::Usage(format!("usage: {}", msg))
}

/// Prints the inode number an operation returned, 0 when it failed.
fn report<W: Write>(out: &mut W, what: &str, result: inodefs::Result<u32>) -> Result<()> {
    if let Err(e) = &result {
        warn!("{}: {}", what, e);
        writeln!(out, "{}: {}", what, e)?;
    }
    writeln!(out, "{} returns {}.", what, result.or_sentinel())?;
    Ok(())
}

impl<T: BlockStorage> Session<T> {
    pub fn new(vol: Volume<T>) -> Self {
        Self {
            vol,
            cwd: ROOT_INODE,
        }
    }

    pub fn volume(&mut self) -> &mut Volume<T> {
        &mut self.vol
    }

    /// Runs one command line. Blank lines and `#` comments do nothing.
    pub fn execute<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(Flow::Continue);
        }
        let args: Vec<&str> = line.split_whitespace().collect();
        match args.as_slice() {
            ["q"] | ["quit"] => {
                self.vol.sync()?;
                return Ok(Flow::Quit);
            }
            ["echo", words @ ..] => writeln!(out, "{}", words.join(" "))?,
            ["ls"] | ["lslong"] => self.ls(out)?,
            ["mkdir", name] => {
                let r = self.vol.directory(self.cwd).create_file(name, true);
                report(out, &format!("mkdir {}", name), r)?;
            }
            ["touch", name] => {
                let r = self.vol.directory(self.cwd).create_file(name, false);
                report(out, &format!("touch {}", name), r)?;
            }
            ["rm", name] => {
                let r = self.remove(name, false);
                report(out, &format!("rm {}", name), r)?;
            }
            ["rmdir", name] => {
                let r = self.remove(name, true);
                report(out, &format!("rmdir {}", name), r)?;
            }
            ["mv", name, dir] => {
                let r = self.move_into(name, dir);
                report(out, &format!("mv {} {}", name, dir), r)?;
            }
            ["cd"] => self.cwd = ROOT_INODE,
            ["cd", name] => self.cd(name)?,
            ["pwd"] => writeln!(out, "{}", self.pwd()?)?,
            ["inode", n] => {
                let inum = n
                    .parse::<u32>()
                    .map_err(|_| usage("inode <number>"))?;
                self.vol.inodes().show(inum, out)?;
            }
            ["cp", from, to] => self.copy(from, to, out)?,
            ["cat", name] => {
                let content = self.read_file(name)?;
                out.write_all(&content)?;
                if !content.ends_with(b"\n") && !content.is_empty() {
                    writeln!(out)?;
                }
            }
            ["df"] => self.df(out)?,
            [cmd, ..] => {
                return Err(ShellError::Usage(format!(
                    "unknown command or wrong arguments: {}",
                    cmd
                )))
            }
            [] => (),
        }
        Ok(Flow::Continue)
    }

    fn ls<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let count = self.vol.directory(self.cwd).list(out)?;
        writeln!(out, "{} file(s)", count)?;
        Ok(())
    }

    fn kind_of(&mut self, name: &str) -> inodefs::Result<(u32, InodeKind)> {
        let inum = self.vol.directory(self.cwd).lookup(name)?;
        Ok((inum, self.vol.inodes().get_type(inum)?))
    }

    /// Unlinks `name` and releases its inode. Directories go only through
    /// `rmdir`, and only once empty.
    fn remove(&mut self, name: &str, dir: bool) -> inodefs::Result<u32> {
        let (inum, kind) = self.kind_of(name)?;
        match (dir, kind) {
            (true, InodeKind::Directory) => {
                if !self.vol.directory(inum).is_empty()? {
                    return Err(FsError::Refused(format!("directory {} is not empty", name)));
                }
            }
            (true, _) => return Err(FsError::Refused(format!("{} is not a directory", name))),
            (false, InodeKind::Directory) => {
                return Err(FsError::Refused(format!("{} is a directory", name)))
            }
            (false, _) => (),
        }
        self.vol.directory(self.cwd).delete(name, true)
    }

    fn move_into(&mut self, name: &str, dir: &str) -> inodefs::Result<u32> {
        let (dest, kind) = self.kind_of(dir)?;
        if kind != InodeKind::Directory {
            return Err(FsError::Refused(format!("{} is not a directory", dir)));
        }
        self.vol.directory(dest).move_entry(name, self.cwd)
    }

    fn cd(&mut self, name: &str) -> Result<()> {
        if name == "/" {
            self.cwd = ROOT_INODE;
            return Ok(());
        }
        let (inum, kind) = self.kind_of(name)?;
        if kind != InodeKind::Directory {
            return Err(FsError::Refused(format!("{} is not a directory", name)).into());
        }
        self.cwd = inum;
        Ok(())
    }

    /// Absolute path of the working directory, found by climbing `..`.
    pub fn pwd(&mut self) -> Result<String> {
        let mut parts = Vec::new();
        let mut at = self.cwd;
        while at != ROOT_INODE {
            let parent = self.vol.directory(at).lookup("..")?;
            parts.push(self.vol.directory(parent).name_of(at)?.name_lossy());
            at = parent;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let (inum, kind) = self.kind_of(name)?;
        if kind == InodeKind::Directory {
            return Err(FsError::Refused(format!("{} is a directory", name)).into());
        }
        let size = self.vol.inodes().get_file_size(inum)?;
        let mut content = vec![0; size as usize];
        let n = FileStream::new(inum).read_at(&mut self.vol, 0, &mut content)?;
        content.truncate(n);
        Ok(content)
    }

    /// Replaces the content of `name`, creating it as needed.
    fn write_file(&mut self, name: &str, content: &[u8]) -> inodefs::Result<u32> {
        let inum = self.vol.directory(self.cwd).create_file(name, false)?;
        if self.vol.inodes().get_type(inum)? == InodeKind::Directory {
            return Err(FsError::Refused(format!("{} is a directory", name)));
        }
        let mut stream = FileStream::new(inum);
        stream.truncate(&mut self.vol, 0)?;
        stream.append(&mut self.vol, content)?;
        Ok(inum)
    }

    /// `cp @host name` imports, `cp name @host` exports, and two plain
    /// names copy within the volume.
    fn copy<W: Write>(&mut self, from: &str, to: &str, out: &mut W) -> Result<()> {
        match (from.strip_prefix('@'), to.strip_prefix('@')) {
            (Some(host), None) => {
                let content = fs::read(host)?;
                let r = self.write_file(to, &content);
                report(out, &format!("cp @{} {}", host, to), r)
            }
            (None, Some(host)) => {
                let content = self.read_file(from)?;
                fs::write(host, &content)?;
                writeln!(out, "cp {} @{}: {} bytes", from, host, content.len())?;
                Ok(())
            }
            (None, None) => {
                let content = self.read_file(from)?;
                let r = self.write_file(to, &content);
                report(out, &format!("cp {} {}", from, to), r)
            }
            (Some(_), Some(_)) => Err(usage("cp @host name | cp name @host | cp name name")),
        }
    }

    fn df<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let sb = *self.vol.super_block();
        writeln!(
            out,
            "blocks: {} of {} free ({} bytes each)",
            self.vol.free_blocks(),
            sb.total_blocks,
            sb.bytes_per_block
        )?;
        writeln!(
            out,
            "inodes: {} of {} free",
            self.vol.free_inodes(),
            sb.inodes_count
        )?;
        Ok(())
    }
}
