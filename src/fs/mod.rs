//! The on-disk file system: free-sector map, inode layer, directory layer,
//! path resolver, and file-handle layer, unified behind [`FileSystem`], the
//! single facade an embedder's syscall dispatcher drives.

pub mod directory;
pub mod freemap;
pub mod handle;
pub mod inode;
pub mod path;

use std::sync::Arc;

use crate::device::BlockDevice;
use crate::error::{KernelError, Result};
use crate::fs::freemap::{FreeMap, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use crate::fs::handle::FileHandle;
use crate::fs::inode::{InodeHandle, InodeTable};
use crate::thread::CurrentThread;

/// The file-system facade: the single entry point an embedder's syscall
/// dispatcher drives. Owns the open-inode table and the free-sector map and
/// wires path resolution, directory mutation, and inode I/O together.
pub struct FileSystem {
    inodes: InodeTable,
    free_map: FreeMap,
}

impl FileSystem {
    /// `filesys_format`-equivalent: lays down a fresh free map and an empty
    /// root directory on a blank device.
    pub fn format(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let num_sectors = device.num_sectors();
        log::info!("formatting file system: {} sectors", num_sectors);
        let free_map = FreeMap::format(num_sectors);
        let inodes = InodeTable::new(device);
        inodes.create(&free_map, FREE_MAP_SECTOR, free_map.byte_len() as u32, false)?;
        inodes.create(&free_map, ROOT_DIR_SECTOR, 0, true)?;
        free_map.persist(&inodes)?;
        Ok(Self { inodes, free_map })
    }

    /// `filesys_init`-equivalent: loads an existing file system from the
    /// device's persisted free map.
    pub fn open(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let num_sectors = device.num_sectors();
        let inodes = InodeTable::new(device);
        let free_map = FreeMap::load(&inodes, num_sectors)?;
        log::debug!("file system opened: {} sectors, {} allocated", num_sectors, free_map.count_allocated());
        Ok(Self { inodes, free_map })
    }

    fn resolve(&self, thread: &dyn CurrentThread, path: &str) -> Result<(InodeHandle, String)> {
        path::get_dir(&self.inodes, &self.free_map, thread.cwd_sector(), path)
    }

    /// `filesys_create`: allocates a fresh inode sector, builds the inode,
    /// and links it into its parent directory. For `is_dir`, additionally
    /// inserts the `..` entry before linking the child into the parent.
    /// Unwinds all allocation on any failure: no dangling inode, index
    /// tree, or directory entry survives a failed `create`.
    pub fn create(&self, thread: &dyn CurrentThread, path: &str, size: u32, is_dir: bool) -> Result<()> {
        let (dir, name) = self.resolve(thread, path)?;
        let result = self.create_in(&dir, &name, size, is_dir);
        self.inodes.close(&self.free_map, dir)?;
        result
    }

    fn create_in(&self, dir: &InodeHandle, name: &str, size: u32, is_dir: bool) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(KernelError::InvalidArgument);
        }
        let sector = self.free_map.allocate(1)?;
        if let Err(e) = self.inodes.create(&self.free_map, sector, size, is_dir) {
            self.free_map.release(sector, 1);
            return Err(e);
        }

        if is_dir {
            // The child inode already exists on disk; a failed link fully
            // finalizes it here (open, mark removed, close releases its
            // sector and any data it holds), so the caller never needs a
            // second unwind pass over `sector`.
            let child = self.inodes.open(sector)?;
            let r = directory::link_parent(&self.inodes, &self.free_map, &child, dir.inner().sector())
                .and_then(|_| directory::add(&self.inodes, &self.free_map, dir, name, sector));
            if r.is_err() {
                log::debug!("mkdir {:?} failed after inode allocation, unwinding sector {}", name, sector);
                self.inodes.mark_removed(&child);
            }
            self.inodes.close(&self.free_map, child)?;
            return r;
        }

        let link_result = directory::add(&self.inodes, &self.free_map, dir, name, sector);
        if link_result.is_err() {
            // No entry was ever linked to `sector`: reopening, marking
            // removed, and closing releases the inode sector plus any data
            // or index-tree sectors it already holds.
            log::debug!("create {:?} failed after inode allocation, unwinding sector {}", name, sector);
            if let Ok(handle) = self.inodes.open(sector) {
                self.inodes.mark_removed(&handle);
                let _ = self.inodes.close(&self.free_map, handle);
            }
        }
        link_result
    }

    /// `filesys_open`: resolves `path` and opens the named inode, or the
    /// directory itself when `path` resolves to `.`.
    pub fn open(&self, thread: &dyn CurrentThread, path: &str) -> Result<FileHandle> {
        let (dir, name) = self.resolve(thread, path)?;
        let result = if name == "." {
            self.inodes.open(dir.inner().sector())
        } else {
            directory::lookup(&self.inodes, &dir, &name).and_then(|sector| self.inodes.open(sector))
        };
        self.inodes.close(&self.free_map, dir)?;
        Ok(FileHandle::new(result?))
    }

    /// `filesys_remove`: refuses `.`/`..`, otherwise delegates to the
    /// directory layer's non-empty/in-use checks.
    pub fn remove(&self, thread: &dyn CurrentThread, path: &str) -> Result<()> {
        let (dir, name) = self.resolve(thread, path)?;
        let result = if name == "." || name == ".." {
            Err(KernelError::InvalidArgument)
        } else {
            directory::remove(&self.inodes, &self.free_map, &dir, &name)
        };
        self.inodes.close(&self.free_map, dir)?;
        result
    }

    /// `mkdir`: creates a zero-length directory inode at `path`.
    pub fn mkdir(&self, thread: &dyn CurrentThread, path: &str) -> Result<()> {
        self.create(thread, path, 0, true)
    }

    /// `chdir`: resolves `path` to a directory inode sector and updates the
    /// calling thread's current directory.
    pub fn chdir(&self, thread: &dyn CurrentThread, path: &str) -> Result<()> {
        let (dir, name) = self.resolve(thread, path)?;
        let lookup_result = if name == "." {
            Ok(dir.inner().sector())
        } else {
            directory::lookup(&self.inodes, &dir, &name)
        };
        self.inodes.close(&self.free_map, dir)?;
        let sector = lookup_result?;

        let target = self.inodes.open(sector)?;
        let is_dir = target.inner().is_directory();
        self.inodes.close(&self.free_map, target)?;
        if !is_dir {
            return Err(KernelError::NotADirectory);
        }
        thread.set_cwd_sector(sector);
        Ok(())
    }

    /// `readdir`: thin pass-through to the handle's own cursor.
    pub fn readdir(&self, handle: &FileHandle) -> Result<Option<String>> {
        handle.readdir(&self.inodes)
    }

    pub fn read(&self, handle: &FileHandle, dst: &mut [u8]) -> Result<usize> {
        handle.read(&self.inodes, dst)
    }

    pub fn write(&self, handle: &FileHandle, src: &[u8]) -> Result<usize> {
        handle.write(&self.inodes, &self.free_map, src)
    }

    /// Freezes a handle's backing inode against writes, used to protect a
    /// running process's executable.
    pub fn deny_write(&self, handle: &FileHandle) {
        self.inodes.deny_write(handle.inode_handle());
    }

    pub fn allow_write(&self, handle: &FileHandle) {
        self.inodes.allow_write(handle.inode_handle());
    }

    /// Closes a handle, decrementing the backing inode's open count and
    /// finalizing removal if it was the last opener of a removed inode.
    pub fn close(&self, handle: FileHandle) -> Result<()> {
        self.inodes.close(&self.free_map, handle.into_inode_handle())
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn free_map(&self) -> &FreeMap {
        &self.free_map
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::device::MemBlockDevice;
    use crate::thread::{ThreadContext, ThreadId};

    struct TestThread {
        cwd: AtomicU32,
    }

    impl TestThread {
        fn new(cwd: u32) -> Self {
            Self { cwd: AtomicU32::new(cwd) }
        }
    }

    impl CurrentThread for TestThread {
        fn id(&self) -> ThreadId {
            ThreadId(0)
        }

        fn cwd_sector(&self) -> u32 {
            self.cwd.load(Ordering::SeqCst)
        }

        fn set_cwd_sector(&self, sector: u32) {
            self.cwd.store(sector, Ordering::SeqCst);
        }

        fn vm_context(&self) -> ThreadContext {
            ThreadContext {
                id: self.id(),
                user_stack_pointer: 0,
                user_top: 0,
            }
        }
    }

    fn setup(num_sectors: u32) -> FileSystem {
        let device = Arc::new(MemBlockDevice::new(num_sectors));
        FileSystem::format(device).unwrap()
    }

    #[test]
    fn create_open_write_read_close_round_trips_through_the_facade() {
        let fs = setup(64);
        let thread = TestThread::new(ROOT_DIR_SECTOR);

        fs.create(&thread, "/greeting.txt", 0, false).unwrap();
        let handle = fs.open(&thread, "/greeting.txt").unwrap();
        fs.write(&handle, b"hello").unwrap();

        let handle = {
            fs.close(handle).unwrap();
            fs.open(&thread, "/greeting.txt").unwrap()
        };
        let mut buf = [0u8; 5];
        fs.read(&handle, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        fs.close(handle).unwrap();
    }

    #[test]
    fn create_refuses_a_duplicate_path() {
        let fs = setup(64);
        let thread = TestThread::new(ROOT_DIR_SECTOR);
        fs.create(&thread, "/a", 0, false).unwrap();
        assert_eq!(fs.create(&thread, "/a", 0, false), Err(KernelError::AlreadyExists));
    }

    #[test]
    fn mkdir_refuses_a_duplicate_path_without_leaking_the_sector() {
        let fs = setup(64);
        let thread = TestThread::new(ROOT_DIR_SECTOR);
        fs.mkdir(&thread, "/a").unwrap();
        let before = fs.free_map().count_allocated();

        assert_eq!(fs.mkdir(&thread, "/a"), Err(KernelError::AlreadyExists));

        // The failed mkdir's child inode must be fully unwound: no sector
        // leaked, and the original "/a" is still intact and open-able.
        assert_eq!(fs.free_map().count_allocated(), before);
        let handle = fs.open(&thread, "/a").unwrap();
        assert!(handle.is_directory());
        fs.close(handle).unwrap();
    }

    #[test]
    fn mkdir_chdir_then_relative_create_lands_in_the_new_directory() {
        let fs = setup(64);
        let thread = TestThread::new(ROOT_DIR_SECTOR);

        fs.mkdir(&thread, "/a").unwrap();
        fs.chdir(&thread, "/a").unwrap();
        fs.create(&thread, "c", 0, false).unwrap();

        let handle = fs.open(&thread, "/a/c").unwrap();
        assert!(!handle.is_directory());
        fs.close(handle).unwrap();
    }

    #[test]
    fn directory_recursion_scenario() {
        let fs = setup(128);
        let thread = TestThread::new(ROOT_DIR_SECTOR);

        fs.mkdir(&thread, "/a").unwrap();
        fs.mkdir(&thread, "/a/b").unwrap();
        fs.chdir(&thread, "/a").unwrap();
        fs.mkdir(&thread, "c").unwrap();

        let b = fs.open(&thread, "/a/b").unwrap();
        let c = fs.open(&thread, "/a/c").unwrap();
        assert!(b.is_directory());
        assert!(c.is_directory());

        let a_sector = {
            let a = fs.open(&thread, "/a").unwrap();
            let sector = a.inumber();
            fs.close(a).unwrap();
            sector
        };

        let dotdot_of_b = directory::lookup(fs.inodes(), b.inode_handle(), "..").unwrap();
        assert_eq!(dotdot_of_b, a_sector);

        fs.close(b).unwrap();
        fs.close(c).unwrap();

        thread.set_cwd_sector(ROOT_DIR_SECTOR);
        assert_eq!(fs.remove(&thread, "/a"), Err(KernelError::DirectoryNotEmpty));

        fs.remove(&thread, "/a/b").unwrap();
        fs.remove(&thread, "/a/c").unwrap();
        fs.remove(&thread, "/a").unwrap();

        assert_eq!(fs.open(&thread, "/a"), Err(KernelError::NotFound));
    }

    #[test]
    fn deny_write_through_the_facade_zeroes_out_writes() {
        let fs = setup(64);
        let thread = TestThread::new(ROOT_DIR_SECTOR);
        fs.create(&thread, "/exe", 0, false).unwrap();
        let handle = fs.open(&thread, "/exe").unwrap();

        fs.deny_write(&handle);
        assert_eq!(fs.write(&handle, b"no").unwrap(), 0);
        fs.allow_write(&handle);
        assert_eq!(fs.write(&handle, b"yes").unwrap(), 3);

        fs.close(handle).unwrap();
    }

    #[test]
    fn remove_rejects_dot_and_dotdot() {
        let fs = setup(64);
        let thread = TestThread::new(ROOT_DIR_SECTOR);
        assert_eq!(fs.remove(&thread, "/."), Err(KernelError::InvalidArgument));
        assert_eq!(fs.remove(&thread, "/.."), Err(KernelError::InvalidArgument));
    }
}
