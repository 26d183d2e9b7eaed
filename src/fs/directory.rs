//! The directory layer.
//!
//! A directory is an inode whose data is a packed array of fixed-size
//! entries, read and written through the inode layer's own `read_at`/
//! `write_at`. Every mutating operation here acquires the inode's `dir`
//! lock, so two concurrent `add`/`remove` calls against the same directory
//! never interleave their scan-then-mutate steps.

use std::mem::size_of;

use arrayvec::ArrayString;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::device::SECTOR_SIZE;
use crate::error::{KernelError, Result};
use crate::fs::freemap::FreeMap;
use crate::fs::inode::{InodeHandle, InodeTable};

/// Maximum directory entry name length.
pub const NAME_MAX: usize = 14;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct RawDirEntry {
    in_use: u8,
    name: [u8; NAME_MAX + 1],
    inode_sector: u32,
}

const_assert_eq!(size_of::<RawDirEntry>(), 20);

impl RawDirEntry {
    fn free() -> Self {
        Self {
            in_use: 0,
            name: [0u8; NAME_MAX + 1],
            inode_sector: 0,
        }
    }

    /// Decodes the NUL-terminated name into a stack-allocated string,
    /// bounded at [`NAME_MAX`] the same way the on-disk field is.
    fn name_str(&self) -> Result<ArrayString<NAME_MAX>> {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        let s = std::str::from_utf8(&self.name[..end]).map_err(|_| KernelError::Corrupted("non-utf8 dirent name"))?;
        ArrayString::from(s).map_err(|_| KernelError::Corrupted("dirent name exceeds NAME_MAX"))
    }

    fn set_name(&mut self, name: &str) -> Result<()> {
        let packed = ArrayString::<NAME_MAX>::from(name).map_err(|_| KernelError::InvalidArgument)?;
        if packed.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        self.name = [0u8; NAME_MAX + 1];
        self.name[..packed.len()].copy_from_slice(packed.as_bytes());
        Ok(())
    }
}

const ENTRY_SIZE: usize = size_of::<RawDirEntry>();

/// Walks the directory inode's entries, calling `f` with each slot's index
/// and decoded entry. `f` returning `Some` stops the scan and its value is
/// returned.
fn scan<T>(
    inodes: &InodeTable,
    dir: &InodeHandle,
    mut f: impl FnMut(u32, &RawDirEntry) -> Option<T>,
) -> Result<Option<T>> {
    let length = dir.inner().length();
    let mut offset = 0u32;
    let mut buf = [0u8; ENTRY_SIZE];
    while offset < length {
        let n = inodes.read_at(dir, &mut buf, offset)?;
        if n != ENTRY_SIZE {
            return Err(KernelError::Corrupted("short directory entry read"));
        }
        let entry = RawDirEntry::read_from(&buf[..]).expect("entry-sized buffer");
        if let Some(result) = f(offset, &entry) {
            return Ok(Some(result));
        }
        offset += ENTRY_SIZE as u32;
    }
    Ok(None)
}

/// `dir_lookup`: returns the inode sector for `name`, or `NotFound`.
pub fn lookup(inodes: &InodeTable, dir: &InodeHandle, name: &str) -> Result<u32> {
    if !dir.inner().is_directory() {
        return Err(KernelError::NotADirectory);
    }
    let found = scan(inodes, dir, |_, e| {
        if e.in_use != 0 && e.name_str().map(|n| n.as_str() == name).unwrap_or(false) {
            Some(e.inode_sector)
        } else {
            None
        }
    })?;
    found.ok_or(KernelError::NotFound)
}

/// `dir_add`: inserts `name -> inode_sector`, reusing a free slot if one
/// exists, otherwise extending the directory file by one entry. Fails if
/// `name` already exists. Serialized by the directory inode's `dir` lock.
pub fn add(inodes: &InodeTable, free_map: &FreeMap, dir: &InodeHandle, name: &str, inode_sector: u32) -> Result<()> {
    if !dir.inner().is_directory() {
        return Err(KernelError::NotADirectory);
    }
    let _guard = dir.inner().dir.lock().unwrap();

    let mut free_slot: Option<u32> = None;
    let collision = scan(inodes, dir, |offset, e| {
        if e.in_use == 0 {
            if free_slot.is_none() {
                free_slot = Some(offset);
            }
            None
        } else if e.name_str().map(|n| n.as_str() == name).unwrap_or(false) {
            Some(())
        } else {
            None
        }
    })?;
    if collision.is_some() {
        return Err(KernelError::AlreadyExists);
    }

    let mut entry = RawDirEntry::free();
    entry.in_use = 1;
    entry.set_name(name)?;
    entry.inode_sector = inode_sector;
    let bytes: [u8; ENTRY_SIZE] = entry.as_bytes().try_into().unwrap();

    let offset = free_slot.unwrap_or_else(|| dir.inner().length());
    let n = inodes.write_at(free_map, dir, &bytes, offset)?;
    if n != ENTRY_SIZE {
        return Err(KernelError::NoSpace);
    }
    Ok(())
}

/// `dir_remove`: clears the slot named `name`. Refuses to remove a
/// non-empty subdirectory or one with more than one opener.
pub fn remove(inodes: &InodeTable, free_map: &FreeMap, dir: &InodeHandle, name: &str) -> Result<()> {
    if !dir.inner().is_directory() {
        return Err(KernelError::NotADirectory);
    }
    let _guard = dir.inner().dir.lock().unwrap();

    let target = scan(inodes, dir, |offset, e| {
        if e.in_use != 0 && e.name_str().map(|n| n.as_str() == name).unwrap_or(false) {
            Some((offset, e.inode_sector))
        } else {
            None
        }
    })?;
    let (offset, sector) = target.ok_or(KernelError::NotFound)?;

    let child = inodes.open(sector)?;
    let result = (|| {
        if child.inner().is_directory() {
            if child.inner().open_count() > 1 {
                return Err(KernelError::DirectoryInUse);
            }
            if !is_empty(inodes, &child)? {
                return Err(KernelError::DirectoryNotEmpty);
            }
        }
        let mut entry = RawDirEntry::free();
        entry.in_use = 0;
        let bytes: [u8; ENTRY_SIZE] = entry.as_bytes().try_into().unwrap();
        let n = inodes.write_at(free_map, dir, &bytes, offset)?;
        if n != ENTRY_SIZE {
            return Err(KernelError::Corrupted("short directory entry write"));
        }
        inodes.mark_removed(&child);
        Ok(())
    })();
    inodes.close(free_map, child)?;
    result
}

/// True if `dir` has no entries besides `.`/`..`. `.` is synthesized and
/// never stored, so only a stray `..` is expected; anything else in use
/// means non-empty.
fn is_empty(inodes: &InodeTable, dir: &InodeHandle) -> Result<bool> {
    let non_dotdot = scan(inodes, dir, |_, e| {
        if e.in_use != 0 && e.name_str().map(|n| n.as_str() != "..").unwrap_or(true) {
            Some(())
        } else {
            None
        }
    })?;
    Ok(non_dotdot.is_none())
}

/// Returns the next in-use entry's name at or after `*dir_pos`, advancing it
/// past that entry. Returns `Ok(None)` at end of directory. `.`/`..` are
/// never surfaced to `readdir` callers.
pub fn readdir(inodes: &InodeTable, dir: &InodeHandle, dir_pos: &mut u32) -> Result<Option<String>> {
    if !dir.inner().is_directory() {
        return Err(KernelError::NotADirectory);
    }
    let length = dir.inner().length();
    let mut buf = [0u8; ENTRY_SIZE];
    while *dir_pos < length {
        let offset = *dir_pos;
        let n = inodes.read_at(dir, &mut buf, offset)?;
        *dir_pos += ENTRY_SIZE as u32;
        if n != ENTRY_SIZE {
            return Err(KernelError::Corrupted("short directory entry read"));
        }
        let entry = RawDirEntry::read_from(&buf[..]).expect("entry-sized buffer");
        if entry.in_use != 0 {
            let name = entry.name_str()?;
            if name != "." && name != ".." {
                return Ok(Some(name.to_string()));
            }
        }
    }
    Ok(None)
}

/// Inserts the `..` entry pointing at `parent_sector` into a freshly
/// created (still-empty) directory inode. Used by the facade's `create`
/// when building a new subdirectory, before the child is linked into its
/// parent.
pub fn link_parent(inodes: &InodeTable, free_map: &FreeMap, dir: &InodeHandle, parent_sector: u32) -> Result<()> {
    add(inodes, free_map, dir, "..", parent_sector)
}
