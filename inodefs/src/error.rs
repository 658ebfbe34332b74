use std::fmt;

use thiserror::Error;

/// What ran out when an allocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Inode,
    Block,
    /// The file already holds the most blocks its inode can address.
    FileCapacity,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Inode => f.write_str("inodes"),
            Resource::Block => f.write_str("blocks"),
            Resource::FileCapacity => f.write_str("addressable blocks in file"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no free {0} left")]
    Exhausted(Resource),
    #[error("found no such entry")]
    DoesNotExist,
    #[error("refused: {0}")]
    Refused(String),
    #[error("corrupt volume: {0}")]
    Corrupt(String),
    #[error("invalid file system block layout")]
    InvalidBlock(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Collapses a result onto the on-disk sentinel convention, where 0 is never
/// a valid inode or block number.
pub trait Sentinel {
    fn or_sentinel(self) -> u32;
}

impl Sentinel for Result<u32> {
    fn or_sentinel(self) -> u32 {
        match self {
            Ok(n) => n,
            Err(e) => {
                log::debug!("sentinel result: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_collapse_to_zero() {
        let found: Result<u32> = Ok(7);
        let missing: Result<u32> = Err(FsError::DoesNotExist);
        let exhausted: Result<u32> = Err(FsError::Exhausted(Resource::Inode));

        assert_eq!(found.or_sentinel(), 7);
        assert_eq!(missing.or_sentinel(), 0);
        assert_eq!(exhausted.or_sentinel(), 0);
    }

    #[test]
    fn messages_name_the_resource() {
        let e = FsError::Exhausted(Resource::Block);
        assert_eq!(e.to_string(), "no free blocks left");
    }
}
