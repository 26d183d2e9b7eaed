//! Kernel error kinds surfaced by the file system and VM cores.
//!
//! Most variants are local and carry enough information for a syscall
//! dispatcher to marshal a POSIX-style return code. A handful of conditions
//! — an inode with a bad magic number, a free-map bit released twice, the
//! swap device running out of slots mid-eviction — indicate an on-disk or
//! bookkeeping invariant has already broken, so those panic directly at the
//! point of detection instead of being represented here at all.

use thiserror::Error;

/// A unified error type for every fallible operation in the core.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum KernelError {
    /// A path component or directory entry does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// `create` targeted a name that already exists in the parent directory.
    #[error("file already exists")]
    AlreadyExists,

    /// The free-sector map or swap pool has no room for the requested
    /// allocation.
    #[error("no space left on device")]
    NoSpace,

    /// A byte offset or length exceeds the maximum file size.
    #[error("file too large")]
    TooLarge,

    /// An argument was structurally invalid (empty path, bad descriptor
    /// content, zero-length name, ...).
    #[error("invalid argument")]
    InvalidArgument,

    /// `remove` targeted a directory that still has entries besides `.`/`..`.
    #[error("directory not empty")]
    DirectoryNotEmpty,

    /// `remove` targeted a directory that is open by more than its caller.
    #[error("directory in use")]
    DirectoryInUse,

    /// An operation expected a directory inode but found a regular file.
    #[error("not a directory")]
    NotADirectory,

    /// An operation expected a regular file but found a directory.
    #[error("is a directory")]
    IsADirectory,

    /// A file descriptor did not name an open handle.
    #[error("bad file descriptor")]
    BadDescriptor,

    /// A reserved file (the free map) read or wrote fewer bytes than its
    /// fixed size, or a directory entry's name was not valid UTF-8.
    #[error("on-disk structure corrupted: {0}")]
    Corrupted(&'static str),
}

impl KernelError {
    /// Maps to a negative `isize` the way a syscall dispatcher would return
    /// it to user space.
    pub fn into_neg_isize(self) -> isize {
        match self {
            KernelError::NotFound => -2,
            KernelError::NoSpace => -28,
            KernelError::TooLarge => -27,
            KernelError::InvalidArgument => -22,
            KernelError::AlreadyExists => -17,
            KernelError::DirectoryNotEmpty => -39,
            KernelError::DirectoryInUse => -16,
            KernelError::NotADirectory => -20,
            KernelError::IsADirectory => -21,
            KernelError::BadDescriptor => -9,
            KernelError::Corrupted(_) => -5,
        }
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
