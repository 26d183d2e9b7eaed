//! The supplemental page table.
//!
//! Per-process map from page-aligned user virtual address to the metadata
//! the frame engine needs to fault a page in or evict it. The location tag
//! is a `bitflags` set rather than a plain `enum` because more than one
//! location bit can be true transiently during eviction (a dropped clean
//! page keeps `IN_FILESYS` set while `IN_FRAME` is cleared).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::vm::frame::FrameId;
use crate::vm::swap::SwapSlot;

pub const PAGE_SIZE: u64 = crate::vm::swap::PAGE_SIZE as u64;

/// Rounds `addr` down to its containing page boundary.
pub fn page_floor(addr: u64) -> u64 {
    addr - (addr % PAGE_SIZE)
}

bitflags! {
    /// Which locations currently (or transiently, mid-eviction) hold valid
    /// contents for a page. At most one of `IN_FRAME`/`IN_SWAP`/`IN_FILESYS`
    /// is set once the page is quiescent; exactly one is authoritative by
    /// the time a fault handler returns.
    pub struct Location: u8 {
        const IN_FRAME = 0b0001;
        const IN_SWAP = 0b0010;
        const IN_FILESYS = 0b0100;
        const ZERO_FILL = 0b1000;
    }
}

/// Backing-location bits and payload for a supplemental page entry.
pub struct PageState {
    pub loc: Location,
    pub frame: Option<FrameId>,
    pub swap_slot: Option<SwapSlot>,
    /// Inode sector of the backing executable, valid when `IN_FILESYS`.
    pub file_inode_sector: u32,
    /// Byte offset into the backing executable file, valid when
    /// `IN_FILESYS`.
    pub file_offset: u32,
    /// Bytes to read from the file before zero-filling the remainder of
    /// the page, valid when `IN_FILESYS`.
    pub read_bytes: u32,
}

impl PageState {
    fn fresh_zero_fill() -> Self {
        Self {
            loc: Location::ZERO_FILL,
            frame: None,
            swap_slot: None,
            file_inode_sector: 0,
            file_offset: 0,
            read_bytes: 0,
        }
    }
}

/// One page's worth of supplemental metadata. The `access` mutex is the
/// per-page lock: it serializes state transitions (install / evict /
/// fault-in) for this page alone.
pub struct SupplementalEntry {
    pub vaddr: u64,
    pub writable: bool,
    locked: AtomicBool,
    pub access: Mutex<PageState>,
}

impl SupplementalEntry {
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }
}

/// Per-process supplemental page table.
pub struct PageTable {
    entries: Mutex<HashMap<u64, Arc<SupplementalEntry>>>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the entry for the page containing `addr`, if any.
    pub fn get(&self, addr: u64) -> Option<Arc<SupplementalEntry>> {
        self.entries.lock().unwrap().get(&page_floor(addr)).cloned()
    }

    /// Returns the existing entry for `addr`'s page, or inserts a fresh
    /// writable, unlocked, zero-fill entry and returns that.
    pub fn get_or_insert(&self, addr: u64) -> Arc<SupplementalEntry> {
        let page = page_floor(addr);
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(page)
            .or_insert_with(|| {
                Arc::new(SupplementalEntry {
                    vaddr: page,
                    writable: true,
                    locked: AtomicBool::new(false),
                    access: Mutex::new(PageState::fresh_zero_fill()),
                })
            })
            .clone()
    }

    /// Inserts an entry backed by `read_bytes` of an executable file's
    /// inode at `file_offset`, used when loading a process's segments.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_file_backed(
        &self,
        addr: u64,
        writable: bool,
        file_inode_sector: u32,
        file_offset: u32,
        read_bytes: u32,
    ) -> Arc<SupplementalEntry> {
        let page = page_floor(addr);
        let entry = Arc::new(SupplementalEntry {
            vaddr: page,
            writable,
            locked: AtomicBool::new(false),
            access: Mutex::new(PageState {
                loc: Location::IN_FILESYS,
                frame: None,
                swap_slot: None,
                file_inode_sector,
                file_offset,
                read_bytes,
            }),
        });
        self.entries.lock().unwrap().insert(page, entry.clone());
        entry
    }

    /// Removes and returns every entry, used by process exit to tear down
    /// all owned frames and swap slots.
    pub fn drain(&self) -> Vec<Arc<SupplementalEntry>> {
        self.entries.lock().unwrap().drain().map(|(_, v)| v).collect()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
