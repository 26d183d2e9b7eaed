//! Cross-module scenarios spanning the file system facade and the VM core
//! together: loading a file-backed page through a fault, evicting it, and
//! the locked-executable scenario that only makes sense once both sides are
//! wired up to the same `FileSystem`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kerncore::device::MemBlockDevice;
use kerncore::fs::freemap::ROOT_DIR_SECTOR;
use kerncore::fs::inode::MAX_FILE_LEN;
use kerncore::mmu::SimMmu;
use kerncore::vm::frame::FrameEngine;
use kerncore::vm::page_table::{Location, PageTable, PAGE_SIZE};
use kerncore::vm::swap::SwapPool;
use kerncore::{CurrentThread, FileSystem, KernelError, ThreadContext, ThreadId};

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

fn setup(fs_sectors: u32, frames: usize, swap_pages: u32) -> (Arc<FileSystem>, FrameEngine, Arc<SimMmu>) {
    let fs = Arc::new(FileSystem::format(Arc::new(MemBlockDevice::new(fs_sectors))).unwrap());
    let swap = Arc::new(SwapPool::new(Arc::new(MemBlockDevice::new(
        swap_pages * PAGE_SIZE as u32 / 512,
    ))));
    let mmu = Arc::new(SimMmu::new());
    let engine = FrameEngine::new(frames, swap, mmu.clone(), fs.clone());
    (fs, engine, mmu)
}

#[test]
fn file_backed_page_fault_loads_content_and_clears_the_transient_filesys_bit() {
    let (fs, engine, _mmu) = setup(64, 4, 8);
    let thread = TestThread::new(ROOT_DIR_SECTOR);

    fs.create(&thread, "/exe", PAGE_SIZE as u32, false).unwrap();
    let handle = fs.open(&thread, "/exe").unwrap();
    let pattern = vec![0x42u8; 100];
    fs.write(&handle, &pattern).unwrap();
    let inode_sector = handle.inumber();
    fs.close(handle).unwrap();

    let table = PageTable::new();
    let entry = table.insert_file_backed(0x4000_0000, false, inode_sector, 0, 100);
    engine.get_frame(&entry, ThreadId(0)).unwrap();

    let state = entry.access.lock().unwrap();
    assert!(state.loc.contains(Location::IN_FRAME));
    assert!(!state.loc.contains(Location::IN_FILESYS));
}

#[test]
fn a_clean_file_backed_page_is_dropped_on_eviction_without_touching_swap() {
    const FRAMES: usize = 2;
    const SWAP_PAGES: u32 = 8;
    let (fs, engine, _mmu) = setup(64, FRAMES, SWAP_PAGES);
    let thread = TestThread::new(ROOT_DIR_SECTOR);

    fs.create(&thread, "/exe", PAGE_SIZE as u32, false).unwrap();
    let handle = fs.open(&thread, "/exe").unwrap();
    fs.write(&handle, &vec![0x7Eu8; 100]).unwrap();
    let inode_sector = handle.inumber();
    fs.close(handle).unwrap();

    let table = PageTable::new();
    let exe_page = table.insert_file_backed(0x4000_0000, false, inode_sector, 0, 100);
    engine.get_frame(&exe_page, ThreadId(0)).unwrap();
    let swap_free_before = engine.swap_free_count();

    // Never write through `exe_page` (its mapping is read-only and the
    // simulated MMU's dirty bit stays clear), so evicting it to make room for
    // the next two pages must drop it rather than burn a swap slot.
    for i in 1..=FRAMES {
        let entry = table.get_or_insert((i as u64) * PAGE_SIZE as u64);
        engine.get_frame(&entry, ThreadId(0)).unwrap();
    }

    let state = exe_page.access.lock().unwrap();
    assert_eq!(state.frame, None);
    assert_eq!(state.swap_slot, None);
    assert!(state.loc.contains(Location::IN_FILESYS));
    assert_eq!(engine.swap_free_count(), swap_free_before, "no swap slot should have been spent");
}

#[test]
fn exec_locked_for_write_scenario() {
    let fs = Arc::new(FileSystem::format(Arc::new(MemBlockDevice::new(64))).unwrap());
    let thread = TestThread::new(ROOT_DIR_SECTOR);

    fs.create(&thread, "/exe", 0, false).unwrap();
    let handle = fs.open(&thread, "/exe").unwrap();

    fs.deny_write(&handle);
    assert_eq!(fs.write(&handle, b"while running").unwrap(), 0);

    // Process exit: the loader's matching `allow_write` runs.
    fs.allow_write(&handle);
    assert_eq!(fs.write(&handle, b"after exit").unwrap(), "after exit".len());

    fs.close(handle).unwrap();
}

#[test]
fn double_indirect_maximum_scenario() {
    // MAX_FILE_LEN plus its own index-tree overhead, the free-map file, the
    // root directory, and slack: comfortably over budget at 17000 sectors.
    let fs = Arc::new(FileSystem::format(Arc::new(MemBlockDevice::new(17_000))).unwrap());
    let thread = TestThread::new(ROOT_DIR_SECTOR);

    let len = MAX_FILE_LEN as u32;
    fs.create(&thread, "/big", len, false).unwrap();
    let handle = fs.open(&thread, "/big").unwrap();
    assert_eq!(handle.length(), len);

    for &offset in &[0u32, 1_000_000, len - 1] {
        let byte = (offset % 256) as u8;
        handle.seek(offset);
        fs.write(&handle, &[byte]).unwrap();
        handle.seek(offset);
        let mut readback = [0u8];
        fs.read(&handle, &mut readback).unwrap();
        assert_eq!(readback[0], byte);
    }

    fs.close(handle).unwrap();
}

#[test]
fn remove_then_open_reports_not_found() {
    let fs = Arc::new(FileSystem::format(Arc::new(MemBlockDevice::new(64))).unwrap());
    let thread = TestThread::new(ROOT_DIR_SECTOR);

    fs.create(&thread, "/gone", 0, false).unwrap();
    fs.remove(&thread, "/gone").unwrap();
    assert_eq!(fs.open(&thread, "/gone"), Err(KernelError::NotFound));
}
