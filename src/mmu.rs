//! The MMU / page-table interface the VM core needs from its embedder,
//! specified here as a trait plus a host-side simulation good enough to
//! drive the frame engine's clock algorithm from tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::thread::ThreadId;

/// What the frame engine needs from the page-table hardware: install or
/// clear a user→kernel mapping, and query/clear the accessed and dirty
/// bits the clock algorithm and eviction decisions key off of.
pub trait Mmu: Send + Sync {
    /// Installs a mapping from `vaddr` in `thread`'s address space to
    /// `kaddr`, a kernel-accessible address of a physical page.
    fn install(&self, thread: ThreadId, vaddr: u64, kaddr: usize, writable: bool);

    /// Removes the mapping for `vaddr` in `thread`'s address space, if any.
    fn clear(&self, thread: ThreadId, vaddr: u64);

    /// Whether the mapping has been read or written since install or the
    /// last `clear_accessed`.
    fn is_accessed(&self, thread: ThreadId, vaddr: u64) -> bool;

    /// Clears the accessed bit, used by the clock algorithm's second
    /// chance.
    fn clear_accessed(&self, thread: ThreadId, vaddr: u64);

    /// Whether the mapping has been written to since install.
    fn is_dirty(&self, thread: ThreadId, vaddr: u64) -> bool;
}

#[derive(Clone, Copy)]
struct Mapping {
    kaddr: usize,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// An in-memory page-table simulation. Since there is no real hardware to
/// set the accessed/dirty bits as a side effect of user memory access,
/// tests drive them explicitly via [`SimMmu::touch`] and
/// [`SimMmu::mark_dirty`].
pub struct SimMmu {
    table: Mutex<HashMap<(ThreadId, u64), Mapping>>,
}

impl SimMmu {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Simulates a read or write access: sets the accessed bit (and the
    /// dirty bit, if `write`).
    pub fn touch(&self, thread: ThreadId, vaddr: u64, write: bool) {
        let mut table = self.table.lock().unwrap();
        if let Some(m) = table.get_mut(&(thread, vaddr)) {
            m.accessed = true;
            if write {
                m.dirty = true;
            }
        }
    }

    /// Directly marks a mapping dirty without going through `touch`,
    /// useful for constructing an eviction scenario in a test.
    pub fn mark_dirty(&self, thread: ThreadId, vaddr: u64) {
        let mut table = self.table.lock().unwrap();
        if let Some(m) = table.get_mut(&(thread, vaddr)) {
            m.dirty = true;
        }
    }

    pub fn kaddr_of(&self, thread: ThreadId, vaddr: u64) -> Option<usize> {
        self.table.lock().unwrap().get(&(thread, vaddr)).map(|m| m.kaddr)
    }
}

impl Default for SimMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu for SimMmu {
    fn install(&self, thread: ThreadId, vaddr: u64, kaddr: usize, writable: bool) {
        self.table.lock().unwrap().insert(
            (thread, vaddr),
            Mapping {
                kaddr,
                writable,
                accessed: false,
                dirty: false,
            },
        );
    }

    fn clear(&self, thread: ThreadId, vaddr: u64) {
        self.table.lock().unwrap().remove(&(thread, vaddr));
    }

    fn is_accessed(&self, thread: ThreadId, vaddr: u64) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(&(thread, vaddr))
            .map(|m| m.accessed)
            .unwrap_or(false)
    }

    fn clear_accessed(&self, thread: ThreadId, vaddr: u64) {
        if let Some(m) = self.table.lock().unwrap().get_mut(&(thread, vaddr)) {
            m.accessed = false;
        }
    }

    fn is_dirty(&self, thread: ThreadId, vaddr: u64) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(&(thread, vaddr))
            .map(|m| m.dirty)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_clear_accessed_resets_the_bit() {
        let mmu = SimMmu::new();
        let thread = ThreadId(1);
        mmu.install(thread, 0x1000, 42, true);
        mmu.touch(thread, 0x1000, false);
        assert!(mmu.is_accessed(thread, 0x1000));
        mmu.clear_accessed(thread, 0x1000);
        assert!(!mmu.is_accessed(thread, 0x1000));
    }

    #[test]
    fn a_write_touch_sets_both_accessed_and_dirty() {
        let mmu = SimMmu::new();
        let thread = ThreadId(1);
        mmu.install(thread, 0x2000, 7, true);
        mmu.touch(thread, 0x2000, true);
        assert!(mmu.is_accessed(thread, 0x2000));
        assert!(mmu.is_dirty(thread, 0x2000));
    }

    #[test]
    fn clear_removes_the_mapping() {
        let mmu = SimMmu::new();
        let thread = ThreadId(1);
        mmu.install(thread, 0x3000, 1, false);
        mmu.clear(thread, 0x3000);
        assert_eq!(mmu.kaddr_of(thread, 0x3000), None);
    }

    #[test]
    fn an_untouched_mapping_is_neither_accessed_nor_dirty() {
        let mmu = SimMmu::new();
        let thread = ThreadId(1);
        mmu.install(thread, 0x4000, 2, true);
        assert!(!mmu.is_accessed(thread, 0x4000));
        assert!(!mmu.is_dirty(thread, 0x4000));
    }
}
