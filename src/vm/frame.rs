//! The frame engine: owns the arena of physical page frames and the global
//! clock queue used to pick an eviction victim when every frame is taken.
//!
//! Frames are referenced by index ([`FrameId`]) rather than by pointer, and
//! a frame's back-pointer to its supplemental entry is a [`Weak`] reference
//! since the per-process page table is the sole owner of that entry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{KernelError, Result};
use crate::fs::FileSystem;
use crate::mmu::Mmu;
use crate::sync::Semaphore;
use crate::thread::ThreadId;
use crate::vm::page_table::{page_floor, Location, PageTable, SupplementalEntry};
use crate::vm::swap::{SwapPool, PAGE_SIZE};

/// Index into the frame arena. Stands in for a kernel-accessible physical
/// address in [`Mmu::install`]; a real kernel would install the actual
/// `kaddr` instead.
pub type FrameId = usize;

/// Bytes of push-ahead below the stack pointer treated as legitimate stack
/// growth (covers instructions, like a multi-register push, that fault
/// before the pointer itself has been decremented).
const STACK_PUSH_AHEAD: u64 = 32;

/// Largest a user stack is allowed to implicitly grow to.
const MAX_STACK_SIZE: u64 = 8 * 1024 * 1024;

struct FrameRecord {
    owner: ThreadId,
    entry: Weak<SupplementalEntry>,
}

/// The global frame table and clock queue.
pub struct FrameEngine {
    storage: Mutex<Vec<[u8; PAGE_SIZE]>>,
    records: Mutex<Vec<Option<FrameRecord>>>,
    queue: Mutex<VecDeque<FrameId>>,
    free_list: Mutex<Vec<FrameId>>,
    /// Released whenever a page is installed; evictors that found every
    /// frame pinned wait here before retrying the scan.
    available: Semaphore,
    swap: Arc<SwapPool>,
    mmu: Arc<dyn Mmu>,
    fs: Arc<FileSystem>,
}

impl FrameEngine {
    pub fn new(num_frames: usize, swap: Arc<SwapPool>, mmu: Arc<dyn Mmu>, fs: Arc<FileSystem>) -> Self {
        Self {
            storage: Mutex::new(vec![[0u8; PAGE_SIZE]; num_frames]),
            records: Mutex::new((0..num_frames).map(|_| None).collect()),
            queue: Mutex::new(VecDeque::new()),
            free_list: Mutex::new((0..num_frames).collect()),
            available: Semaphore::new(0),
            swap,
            mmu,
            fs,
        }
    }

    /// `get_frame`: transitions `entry` into the `in_frame` state, loading
    /// its contents from swap, the executable, or zero-filling, then
    /// installs the mapping and enqueues the frame. A no-op if the entry is
    /// already resident.
    pub fn get_frame(&self, entry: &Arc<SupplementalEntry>, owner: ThreadId) -> Result<()> {
        let mut state = entry.access.lock().unwrap();
        if state.loc.contains(Location::IN_FRAME) {
            return Ok(());
        }

        let frame_id = self.obtain_frame()?;
        {
            let mut storage = self.storage.lock().unwrap();
            if state.loc.contains(Location::IN_SWAP) {
                let slot = state.swap_slot.take().expect("IN_SWAP implies a slot");
                self.swap.read_page(slot, &mut storage[frame_id]);
                self.swap.release(slot);
                state.loc.remove(Location::IN_SWAP);
            } else if state.loc.contains(Location::IN_FILESYS) && state.read_bytes > 0 {
                storage[frame_id] = [0u8; PAGE_SIZE];
                let read_bytes = state.read_bytes as usize;
                let handle = self.fs.inodes().open(state.file_inode_sector)?;
                let n = self
                    .fs
                    .inodes()
                    .read_at(&handle, &mut storage[frame_id][..read_bytes], state.file_offset);
                self.fs.inodes().close(self.fs.free_map(), handle)?;
                let n = n?;
                if n != read_bytes {
                    return Err(KernelError::Corrupted("short read loading page from executable"));
                }
                state.loc.remove(Location::IN_FILESYS);
            } else {
                storage[frame_id] = [0u8; PAGE_SIZE];
                state.loc.remove(Location::IN_FILESYS | Location::ZERO_FILL);
            }
        }

        self.mmu.install(owner, entry.vaddr, frame_id, entry.writable);
        self.records.lock().unwrap()[frame_id] = Some(FrameRecord {
            owner,
            entry: Arc::downgrade(entry),
        });
        self.queue.lock().unwrap().push_back(frame_id);
        state.loc.insert(Location::IN_FRAME);
        state.frame = Some(frame_id);
        drop(state);
        self.available.up();
        Ok(())
    }

    /// Pins `entry` after ensuring it is resident. Callers call `get_frame`
    /// explicitly rather than touching user memory to provoke a fault first,
    /// so a kernel-side read of a user buffer can't itself be evicted out
    /// from under it mid-copy.
    pub fn pin(&self, entry: &Arc<SupplementalEntry>, owner: ThreadId) -> Result<()> {
        self.get_frame(entry, owner)?;
        entry.set_locked(true);
        Ok(())
    }

    pub fn unpin(&self, entry: &SupplementalEntry) {
        entry.set_locked(false);
    }

    /// Free slots remaining in the swap pool, for callers that want to
    /// observe eviction pressure without reaching into the pool directly.
    pub fn swap_free_count(&self) -> usize {
        self.swap.free_count()
    }

    fn obtain_frame(&self) -> Result<FrameId> {
        if let Some(f) = self.free_list.lock().unwrap().pop() {
            return Ok(f);
        }
        self.evict()
    }

    /// Scans the clock queue for a victim, retrying whenever every frame
    /// examined turned out pinned. Never busy-loops: a retry only happens
    /// after `available` is signalled by some other installation or
    /// unpin-adjacent event.
    fn evict(&self) -> Result<FrameId> {
        loop {
            let limit = {
                let queue = self.queue.lock().unwrap();
                2 * queue.len().max(1)
            };
            let mut scanned = 0;
            while scanned < limit {
                scanned += 1;
                let candidate = match self.queue.lock().unwrap().pop_front() {
                    Some(c) => c,
                    None => break,
                };
                let (owner, entry_weak) = {
                    let records = self.records.lock().unwrap();
                    match &records[candidate] {
                        Some(r) => (r.owner, r.entry.clone()),
                        None => continue,
                    }
                };
                let entry = match entry_weak.upgrade() {
                    Some(e) => e,
                    None => {
                        // Owning page table was torn down without routing
                        // through us (shouldn't normally happen); reclaim.
                        self.records.lock().unwrap()[candidate] = None;
                        return Ok(candidate);
                    }
                };
                if entry.is_locked() {
                    self.queue.lock().unwrap().push_back(candidate);
                    continue;
                }
                if self.mmu.is_accessed(owner, entry.vaddr) {
                    self.mmu.clear_accessed(owner, entry.vaddr);
                    self.queue.lock().unwrap().push_back(candidate);
                    continue;
                }
                let mut state = entry.access.lock().unwrap();
                if entry.is_locked() {
                    drop(state);
                    self.queue.lock().unwrap().push_back(candidate);
                    continue;
                }
                self.evict_victim(candidate, owner, &entry, &mut state);
                return Ok(candidate);
            }
            log::debug!("eviction scan found every frame pinned, waiting for a release");
            self.available.down();
        }
    }

    /// Clears the mapping and either drops a clean file-backed page or
    /// writes it to swap, then frees the frame-table slot.
    fn evict_victim(
        &self,
        frame_id: FrameId,
        owner: ThreadId,
        entry: &SupplementalEntry,
        state: &mut crate::vm::page_table::PageState,
    ) {
        self.mmu.clear(owner, entry.vaddr);
        // `loc` no longer carries IN_FILESYS by this point (get_frame clears it
        // on load, since at most one location is authoritative while resident);
        // whether this frame still holds an unmodified copy of the executable
        // is read from the entry's permanent file-backing metadata instead.
        let read_only_file_backed = !entry.writable && state.read_bytes > 0;
        if read_only_file_backed && !self.mmu.is_dirty(owner, entry.vaddr) {
            // Clean, unmodified copy of the executable: drop it, a future
            // fault reloads the same bytes from the file.
            log::trace!("evicting frame {} for vaddr {:#x}: dropped, clean file-backed", frame_id, entry.vaddr);
            // Not resident anywhere now; its home reverts to the executable
            // so the next get_frame reloads the same bytes from it.
            state.loc.insert(Location::IN_FILESYS);
        } else {
            let slot = self.swap.acquire();
            let data = self.storage.lock().unwrap()[frame_id];
            self.swap.write_page(slot, &data);
            state.swap_slot = Some(slot);
            state.loc.insert(Location::IN_SWAP);
            log::trace!("evicting frame {} for vaddr {:#x}: written to swap", frame_id, entry.vaddr);
        }
        state.loc.remove(Location::IN_FRAME);
        state.frame = None;
        self.records.lock().unwrap()[frame_id] = None;
    }

    /// Handles a page fault at `fault_addr`: fetches the existing entry, or
    /// treats the address as implicit stack growth when it qualifies, or
    /// signals that the reference is illegal.
    pub fn handle_fault(
        &self,
        page_table: &PageTable,
        owner: ThreadId,
        fault_addr: u64,
        user_stack_pointer: u64,
        user_top: u64,
    ) -> Result<()> {
        if let Some(entry) = page_table.get(fault_addr) {
            return self.get_frame(&entry, owner);
        }
        if is_stack_growth(fault_addr, user_stack_pointer, user_top) {
            let entry = page_table.get_or_insert(fault_addr);
            return self.get_frame(&entry, owner);
        }
        log::warn!("invalid page fault at {:#x} (sp={:#x})", fault_addr, user_stack_pointer);
        Err(KernelError::InvalidArgument)
    }

    /// Tears down every entry in an exiting process's page table: unmaps
    /// and frees any owned frame, returns any owned swap slot. Locking each
    /// entry first drains any eviction already in flight against it before
    /// it is discarded.
    pub fn destroy_page_table(&self, owner: ThreadId, table: &PageTable) {
        for entry in table.drain() {
            entry.set_locked(true);
            let mut state = entry.access.lock().unwrap();
            if let Some(frame_id) = state.frame.take() {
                self.mmu.clear(owner, entry.vaddr);
                self.records.lock().unwrap()[frame_id] = None;
                self.free_list.lock().unwrap().push(frame_id);
                state.loc.remove(Location::IN_FRAME);
                self.available.up();
            }
            if let Some(slot) = state.swap_slot.take() {
                self.swap.release(slot);
                state.loc.remove(Location::IN_SWAP);
            }
        }
    }
}

fn is_stack_growth(fault_addr: u64, user_stack_pointer: u64, user_top: u64) -> bool {
    if fault_addr >= user_top {
        return false;
    }
    let min_allowed = user_stack_pointer.saturating_sub(STACK_PUSH_AHEAD);
    if fault_addr < min_allowed {
        return false;
    }
    user_top - page_floor(fault_addr) <= MAX_STACK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::mmu::SimMmu;

    fn setup(num_frames: usize, swap_pages: u32) -> (FrameEngine, Arc<SimMmu>) {
        let fs_device = Arc::new(MemBlockDevice::new(64));
        let fs = Arc::new(FileSystem::format(fs_device).unwrap());
        let swap_device = Arc::new(MemBlockDevice::new(swap_pages * PAGE_SIZE as u32 / 512));
        let swap = Arc::new(SwapPool::new(swap_device));
        let mmu = Arc::new(SimMmu::new());
        (FrameEngine::new(num_frames, swap, mmu.clone(), fs), mmu)
    }

    #[test]
    fn get_frame_zero_fills_a_fresh_entry() {
        let (engine, _mmu) = setup(4, 8);
        let table = PageTable::new();
        let entry = table.get_or_insert(0x1000);
        engine.get_frame(&entry, ThreadId(0)).unwrap();
        assert!(entry.access.lock().unwrap().loc.contains(Location::IN_FRAME));
    }

    #[test]
    fn get_frame_is_a_no_op_when_already_resident() {
        let (engine, _mmu) = setup(4, 8);
        let table = PageTable::new();
        let entry = table.get_or_insert(0x1000);
        engine.get_frame(&entry, ThreadId(0)).unwrap();
        let frame_before = entry.access.lock().unwrap().frame;
        engine.get_frame(&entry, ThreadId(0)).unwrap();
        assert_eq!(entry.access.lock().unwrap().frame, frame_before);
    }

    #[test]
    fn pin_correctness_a_read_spanning_every_frame_completes_and_then_unpins() {
        const FRAMES: usize = 4;
        let (engine, _mmu) = setup(FRAMES, 8);
        let table = PageTable::new();

        let mut entries = Vec::new();
        for i in 0..FRAMES {
            let entry = table.get_or_insert((i as u64) * PAGE_SIZE);
            engine.pin(&entry, ThreadId(0)).unwrap();
            entries.push(entry);
        }
        for e in &entries {
            assert!(e.is_locked());
        }
        for e in &entries {
            engine.unpin(e);
        }
        for e in &entries {
            assert!(!e.is_locked());
        }

        // With every page unpinned, a fresh page can now evict one of them.
        let fresh = table.get_or_insert((FRAMES as u64) * PAGE_SIZE);
        engine.get_frame(&fresh, ThreadId(0)).unwrap();
        assert!(fresh.access.lock().unwrap().loc.contains(Location::IN_FRAME));
    }

    #[test]
    fn eviction_round_trip_preserves_page_contents() {
        const FRAMES: usize = 3;
        let (engine, mmu) = setup(FRAMES, 8);
        let table = PageTable::new();
        let thread = ThreadId(0);

        let mut entries = Vec::new();
        for i in 0..FRAMES + 1 {
            let vaddr = (i as u64) * PAGE_SIZE;
            let entry = table.get_or_insert(vaddr);
            engine.get_frame(&entry, thread).unwrap();
            let kaddr = mmu.kaddr_of(thread, entry.vaddr).unwrap();
            // Write a distinct pattern directly into the backing frame
            // storage through the simulated physical address, then mark the
            // mapping dirty so eviction is forced to preserve it via swap
            // rather than silently dropping it.
            {
                let mut storage = engine.storage.lock().unwrap();
                storage[kaddr] = [i as u8; PAGE_SIZE];
            }
            mmu.mark_dirty(thread, entry.vaddr);
            entries.push(entry);
        }

        assert!(engine.swap.free_count() < 8, "at least one page should have been swapped out");

        for (i, entry) in entries.iter().enumerate().rev() {
            engine.get_frame(entry, thread).unwrap();
            let kaddr = mmu.kaddr_of(thread, entry.vaddr).unwrap();
            let storage = engine.storage.lock().unwrap();
            assert_eq!(storage[kaddr], [i as u8; PAGE_SIZE]);
        }
    }

    #[test]
    fn handle_fault_grows_the_stack_within_the_allowed_range() {
        let (engine, _mmu) = setup(4, 8);
        let table = PageTable::new();
        let user_top = 0x8000_0000u64;
        let sp = user_top - PAGE_SIZE as u64;

        engine
            .handle_fault(&table, ThreadId(0), sp - 4, sp, user_top)
            .unwrap();
        assert!(table.get(sp - 4).is_some());
    }

    #[test]
    fn handle_fault_rejects_an_address_far_below_the_stack_pointer() {
        let (engine, _mmu) = setup(4, 8);
        let table = PageTable::new();
        let user_top = 0x8000_0000u64;
        let sp = user_top - PAGE_SIZE as u64;

        let far_below = sp - STACK_PUSH_AHEAD - PAGE_SIZE as u64;
        assert_eq!(
            engine.handle_fault(&table, ThreadId(0), far_below, sp, user_top),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn destroy_page_table_frees_frames_and_swap_slots() {
        const FRAMES: usize = 2;
        let (engine, _mmu) = setup(FRAMES, 8);
        let table = PageTable::new();
        let thread = ThreadId(0);

        for i in 0..FRAMES + 1 {
            let entry = table.get_or_insert((i as u64) * PAGE_SIZE);
            engine.get_frame(&entry, thread).unwrap();
        }
        let swap_free_before = engine.swap.free_count();

        engine.destroy_page_table(thread, &table);

        assert_eq!(engine.free_list.lock().unwrap().len(), FRAMES);
        assert!(engine.swap.free_count() >= swap_free_before);
    }
}
