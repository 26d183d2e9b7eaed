//! The file handle layer.
//!
//! Thin wrapper around an open inode plus two independent cursors: a byte
//! cursor used by `read`/`write`/`seek`/`tell`, and a separate `dir_pos`
//! advanced only by `readdir`, so interleaving reads and directory
//! iteration on the same handle never disturbs each other.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, Result};
use crate::fs::directory;
use crate::fs::freemap::FreeMap;
use crate::fs::inode::{InodeHandle, InodeTable};

/// An open file or directory. Must be passed to [`FileHandle::close`]
/// exactly once; dropping it without closing leaks the inode's open count,
/// matching the non-RAII discipline of the inode layer underneath it.
pub struct FileHandle {
    inode: InodeHandle,
    pos: AtomicU32,
    dir_pos: AtomicU32,
}

impl FileHandle {
    pub(crate) fn new(inode: InodeHandle) -> Self {
        Self {
            inode,
            pos: AtomicU32::new(0),
            dir_pos: AtomicU32::new(0),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.inode.inner().is_directory()
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inner().sector()
    }

    pub fn tell(&self) -> u32 {
        self.pos.load(Ordering::SeqCst)
    }

    pub fn seek(&self, offset: u32) {
        self.pos.store(offset, Ordering::SeqCst);
    }

    pub fn length(&self) -> u32 {
        self.inode.inner().length()
    }

    /// Reads at the current cursor, advancing it by the number of bytes
    /// actually read. Fails on a directory handle.
    pub fn read(&self, inodes: &InodeTable, dst: &mut [u8]) -> Result<usize> {
        if self.is_directory() {
            return Err(KernelError::IsADirectory);
        }
        let offset = self.pos.load(Ordering::SeqCst);
        let n = inodes.read_at(&self.inode, dst, offset)?;
        self.pos.store(offset + n as u32, Ordering::SeqCst);
        Ok(n)
    }

    /// Writes at the current cursor, advancing it by the number of bytes
    /// actually written. Fails on a directory handle.
    pub fn write(&self, inodes: &InodeTable, free_map: &FreeMap, src: &[u8]) -> Result<usize> {
        if self.is_directory() {
            return Err(KernelError::IsADirectory);
        }
        let offset = self.pos.load(Ordering::SeqCst);
        let n = inodes.write_at(free_map, &self.inode, src, offset)?;
        self.pos.store(offset + n as u32, Ordering::SeqCst);
        Ok(n)
    }

    /// `readdir`: returns the next entry name, advancing the independent
    /// `dir_pos` cursor. Fails on a non-directory handle.
    pub fn readdir(&self, inodes: &InodeTable) -> Result<Option<String>> {
        if !self.is_directory() {
            return Err(KernelError::NotADirectory);
        }
        let mut dir_pos = self.dir_pos.load(Ordering::SeqCst);
        let result = directory::readdir(inodes, &self.inode, &mut dir_pos)?;
        self.dir_pos.store(dir_pos, Ordering::SeqCst);
        Ok(result)
    }

    pub(crate) fn inode_handle(&self) -> &InodeHandle {
        &self.inode
    }

    pub(crate) fn into_inode_handle(self) -> InodeHandle {
        self.inode
    }
}
