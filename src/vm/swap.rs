//! The swap-sector pool: a free list of page-sized runs over the swap
//! device, built once at startup from the device's sector count.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::device::{BlockDevice, SectorBuf, SECTOR_SIZE};

/// Bytes per virtual-memory page. Spans [`SECTORS_PER_PAGE`] device sectors.
pub const PAGE_SIZE: usize = 4096;

/// Sectors consumed by one page-sized swap slot.
pub const SECTORS_PER_PAGE: u32 = (PAGE_SIZE / SECTOR_SIZE) as u32;

/// Opaque handle to one page-sized run on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(u32);

/// The swap device's free-slot pool.
pub struct SwapPool {
    device: Arc<dyn BlockDevice>,
    free: Mutex<VecDeque<u32>>,
}

impl SwapPool {
    /// Builds the free list from the swap device's full capacity.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let num_slots = device.num_sectors() / SECTORS_PER_PAGE;
        let free = (0..num_slots).collect();
        Self {
            device,
            free: Mutex::new(free),
        }
    }

    /// Pops a free slot off the front of the list. The swap device running
    /// out of room mid-eviction leaves a dirty page with nowhere to go, so
    /// this panics rather than returning an error the caller could ignore.
    pub fn acquire(&self) -> SwapSlot {
        self.free.lock().unwrap().pop_front().map(SwapSlot).unwrap_or_else(|| {
            panic!("swap pool exhausted");
        })
    }

    /// Pushes `slot` onto the back of the free list.
    pub fn release(&self, slot: SwapSlot) {
        self.free.lock().unwrap().push_back(slot.0);
    }

    /// Reads the full page stored at `slot` into `buf`.
    pub fn read_page(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) {
        let base = slot.0 * SECTORS_PER_PAGE;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            self.device.read(base + i, &mut sector_buf);
            let start = i as usize * SECTOR_SIZE;
            buf[start..start + SECTOR_SIZE].copy_from_slice(&sector_buf);
        }
    }

    /// Writes the full page `buf` into `slot`.
    pub fn write_page(&self, slot: SwapSlot, buf: &[u8; PAGE_SIZE]) {
        let base = slot.0 * SECTORS_PER_PAGE;
        for i in 0..SECTORS_PER_PAGE {
            let start = i as usize * SECTOR_SIZE;
            let chunk: &SectorBuf = (&buf[start..start + SECTOR_SIZE]).try_into().unwrap();
            self.device.write(base + i, chunk);
        }
    }

    /// Number of slots currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    #[test]
    fn write_then_read_round_trips_a_page() {
        let device = Arc::new(MemBlockDevice::new(4 * SECTORS_PER_PAGE));
        let pool = SwapPool::new(device);
        let slot = pool.acquire();

        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        pool.write_page(slot, &page);

        let mut readback = [0u8; PAGE_SIZE];
        pool.read_page(slot, &mut readback);
        assert_eq!(readback, page);

        pool.release(slot);
    }

    #[test]
    #[should_panic(expected = "swap pool exhausted")]
    fn acquire_panics_once_every_slot_is_taken() {
        let device = Arc::new(MemBlockDevice::new(2 * SECTORS_PER_PAGE));
        let pool = SwapPool::new(device);
        let _slot = pool.acquire();
        pool.acquire();
    }

    #[test]
    fn acquire_succeeds_again_after_a_release() {
        let device = Arc::new(MemBlockDevice::new(2 * SECTORS_PER_PAGE));
        let pool = SwapPool::new(device);
        let slot = pool.acquire();
        pool.release(slot);
        pool.acquire();
    }

    #[test]
    fn free_count_tracks_acquire_and_release() {
        let device = Arc::new(MemBlockDevice::new(4 * SECTORS_PER_PAGE));
        let pool = SwapPool::new(device);
        let before = pool.free_count();
        let slot = pool.acquire();
        assert_eq!(pool.free_count(), before - 1);
        pool.release(slot);
        assert_eq!(pool.free_count(), before);
    }
}
