//! The free-sector map: a bitmap of which device sectors are in use, mirrored
//! to a reserved file on disk so it survives a remount. Allocation scans for a
//! run of `n` clear bits starting from a rotating hint and wraps to the
//! beginning on a miss; the hint advances past the run it just handed out so
//! consecutive allocations tend to stay contiguous.

use std::sync::Mutex;

use crate::device::UNALLOCATED_SECTOR;
use crate::error::{KernelError, Result};
use crate::fs::inode::InodeTable;

/// Sector 0: the free-map file's inode.
pub const FREE_MAP_SECTOR: u32 = 0;
/// Sector 1: the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

struct FreeMapState {
    /// One bit per device sector; bit set means allocated.
    bits: Vec<bool>,
    /// Rotating cursor: the next scan starts here.
    start_hint: u32,
}

/// The bitmap free-space map for the file system device.
pub struct FreeMap {
    state: Mutex<FreeMapState>,
    num_sectors: u32,
}

impl FreeMap {
    /// Formats a fresh, in-memory bitmap, marking [`FREE_MAP_SECTOR`] and
    /// [`ROOT_DIR_SECTOR`] in use. Does not touch the device; callers persist
    /// it once the free-map file's inode exists (see [`FreeMap::persist`]).
    pub fn format(num_sectors: u32) -> Self {
        let mut bits = vec![false; num_sectors as usize];
        bits[FREE_MAP_SECTOR as usize] = true;
        bits[ROOT_DIR_SECTOR as usize] = true;
        Self {
            state: Mutex::new(FreeMapState {
                bits,
                start_hint: 2,
            }),
            num_sectors,
        }
    }

    /// Loads a bitmap shape (all-clear) ready to be filled in by
    /// [`FreeMap::load`] from the on-disk free-map file.
    fn empty(num_sectors: u32) -> Self {
        Self {
            state: Mutex::new(FreeMapState {
                bits: vec![false; num_sectors as usize],
                start_hint: 0,
            }),
            num_sectors,
        }
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.num_sectors.div_ceil(8) as usize
    }

    fn to_bytes(&self, bits: &[bool]) -> Vec<u8> {
        let mut out = vec![0u8; self.byte_len()];
        for (i, &b) in bits.iter().enumerate() {
            if b {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    fn from_bytes(bits: &mut [bool], bytes: &[u8]) {
        for (i, b) in bits.iter_mut().enumerate() {
            *b = bytes[i / 8] & (1 << (i % 8)) != 0;
        }
    }

    /// Persists the current bitmap to the free-map file (inode at
    /// [`FREE_MAP_SECTOR`], which must already exist with room for the full
    /// bitmap).
    pub fn persist(&self, inodes: &InodeTable) -> Result<()> {
        let bytes = {
            let state = self.state.lock().unwrap();
            self.to_bytes(&state.bits)
        };
        inodes.write_reserved_file(FREE_MAP_SECTOR, &bytes)
    }

    /// Loads the bitmap back from the free-map file on an existing file
    /// system.
    pub fn load(inodes: &InodeTable, num_sectors: u32) -> Result<Self> {
        let map = Self::empty(num_sectors);
        let byte_len = map.byte_len();
        let mut bytes = vec![0u8; byte_len];
        inodes.read_reserved_file(FREE_MAP_SECTOR, &mut bytes)?;
        let mut state = map.state.lock().unwrap();
        Self::from_bytes(&mut state.bits, &bytes);
        drop(state);
        Ok(map)
    }

    /// Allocates `n` consecutive clear sectors, sets them, and returns the
    /// first index. Retries from zero if the scan from `start_hint` fails;
    /// advances `start_hint` to one past the run on success.
    pub fn allocate(&self, n: u32) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let first = Self::scan_and_flip(&mut state.bits, state.start_hint, n)
            .or_else(|| Self::scan_and_flip(&mut state.bits, 0, n));
        match first {
            Some(sector) => {
                state.start_hint = sector + n;
                Ok(sector)
            }
            None => {
                log::warn!("free map exhausted: no run of {} free sectors", n);
                Err(KernelError::NoSpace)
            }
        }
    }

    /// Releases `n` sectors starting at `sector`. All of them must currently
    /// be set; releasing an already-free sector means the bitmap no longer
    /// matches what is live on disk, so this panics rather than returning an
    /// error a caller could paper over.
    pub fn release(&self, sector: u32, n: u32) {
        let mut state = self.state.lock().unwrap();
        for i in sector..sector + n {
            if !state.bits[i as usize] {
                panic!("releasing sector {} which was already free", i);
            }
        }
        for i in sector..sector + n {
            state.bits[i as usize] = false;
        }
    }

    fn scan_and_flip(bits: &mut [bool], start: u32, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }
        let len = bits.len() as u32;
        if start + n > len {
            return None;
        }
        let mut run_start = start;
        while run_start + n <= len {
            if bits[run_start as usize..(run_start + n) as usize]
                .iter()
                .all(|&b| !b)
            {
                for b in &mut bits[run_start as usize..(run_start + n) as usize] {
                    *b = true;
                }
                return Some(run_start);
            }
            // Skip past the first set bit found in this window.
            let offset = bits[run_start as usize..(run_start + n) as usize]
                .iter()
                .position(|&b| b)
                .unwrap();
            run_start += offset as u32 + 1;
        }
        None
    }

    /// Number of bits currently set.
    pub fn count_allocated(&self) -> usize {
        self.state.lock().unwrap().bits.iter().filter(|&&b| b).count()
    }

    pub fn is_allocated(&self, sector: u32) -> bool {
        self.state.lock().unwrap().bits[sector as usize]
    }
}

/// Never actually returned by the core but kept for readability at call
/// sites that pattern-match on allocation results against the sentinel.
pub const fn sentinel() -> u32 {
    UNALLOCATED_SECTOR
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::MemBlockDevice;
    use crate::fs::inode::InodeTable;

    #[test]
    fn format_reserves_free_map_and_root_sectors() {
        let map = FreeMap::format(64);
        assert!(map.is_allocated(FREE_MAP_SECTOR));
        assert!(map.is_allocated(ROOT_DIR_SECTOR));
        assert_eq!(map.count_allocated(), 2);
    }

    #[test]
    fn allocate_and_release_round_trip_preserves_bit_count() {
        let map = FreeMap::format(64);
        let before = map.count_allocated();
        let sector = map.allocate(5).unwrap();
        assert_eq!(map.count_allocated(), before + 5);
        map.release(sector, 5);
        assert_eq!(map.count_allocated(), before);
    }

    #[test]
    fn allocate_never_hands_out_an_already_set_bit() {
        let map = FreeMap::format(16);
        let a = map.allocate(4).unwrap();
        let b = map.allocate(4).unwrap();
        let a_range: Vec<u32> = (a..a + 4).collect();
        let b_range: Vec<u32> = (b..b + 4).collect();
        assert!(a_range.iter().all(|s| !b_range.contains(s)));
    }

    #[test]
    fn exhaustion_returns_no_space() {
        let map = FreeMap::format(4);
        assert_eq!(map.allocate(3), Err(KernelError::NoSpace));
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn release_of_a_free_sector_panics() {
        let map = FreeMap::format(16);
        map.release(10, 1);
    }

    #[test]
    fn persist_then_load_reproduces_the_same_bitmap() {
        let device = Arc::new(MemBlockDevice::new(64));
        let inodes = InodeTable::new(device);
        let map = FreeMap::format(64);
        inodes
            .create(&map, FREE_MAP_SECTOR, map.byte_len() as u32, false)
            .unwrap();
        let extra = map.allocate(3).unwrap();
        map.persist(&inodes).unwrap();

        let reloaded = FreeMap::load(&inodes, 64).unwrap();
        assert!(reloaded.is_allocated(extra));
        assert_eq!(reloaded.count_allocated(), map.count_allocated());
    }
}
