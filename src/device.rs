//! Block device abstraction.
//!
//! An external collaborator exposing synchronous, fixed-size sector
//! `read`/`write` and a total sector count. This module defines that trait
//! plus a simple in-memory implementation used by the test suite and by any
//! embedder that does not yet have a real driver to plug in.

use std::sync::Mutex;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Sentinel sector reference meaning "unallocated": all-ones.
pub const UNALLOCATED_SECTOR: u32 = u32::MAX;

/// One sector's worth of bytes.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// A synchronous, fixed-size-sector block device.
///
/// Implementations may block the calling thread; the core never assumes
/// otherwise.
pub trait BlockDevice: Send + Sync {
    /// Reads sector `sector` into `buf`.
    ///
    /// # Panics
    /// Implementations may panic if `sector >= num_sectors()`; the core never
    /// calls this out of range in correct operation.
    fn read(&self, sector: u32, buf: &mut SectorBuf);

    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &SectorBuf);

    /// Total number of addressable sectors on this device.
    fn num_sectors(&self) -> u32;
}

/// An in-memory block device, used by tests and as a reference
/// implementation for embedders without a driver yet.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<SectorBuf>>,
}

impl MemBlockDevice {
    /// Creates a zero-filled device with `num_sectors` sectors.
    pub fn new(num_sectors: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; num_sectors as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, sector: u32, buf: &mut SectorBuf) {
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[sector as usize]);
    }

    fn write(&self, sector: u32, buf: &SectorBuf) {
        let mut sectors = self.sectors.lock().unwrap();
        sectors[sector as usize].copy_from_slice(buf);
    }

    fn num_sectors(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}
