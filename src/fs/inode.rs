//! The inode layer: on-disk inode layout, the byte-to-sector walk through
//! direct, single-indirect, and double-indirect pointer tiers, and the
//! in-memory open-inode table that keeps at most one [`InMemoryInode`] per
//! sector alive while it has openers.
//!
//! Every inode write that allocates or frees a sector persists the free map
//! before returning, so the on-disk bitmap never drifts from what is
//! actually live on disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::device::{BlockDevice, SectorBuf, SECTOR_SIZE, UNALLOCATED_SECTOR};
use crate::error::{KernelError, Result};
use crate::fs::freemap::FreeMap;

const INODE_MAGIC: u32 = 0x494e_4f44;

/// Sector references that fit in a single index sector.
pub const REFS_PER_SECTOR: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Direct pointers that fit in a `RawDiskInode` once the other fixed fields
/// are accounted for.
pub const N_DIRECT: usize = 123;

/// Maximum file length in bytes: `(N_direct + P + P^2) * SECTOR_SIZE`.
pub const MAX_FILE_LEN: u64 =
    ((N_DIRECT + REFS_PER_SECTOR + REFS_PER_SECTOR * REFS_PER_SECTOR) * SECTOR_SIZE) as u64;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct RawDiskInode {
    magic: u32,
    is_directory: u32,
    length: u32,
    direct: [u32; N_DIRECT],
    single_indirect: u32,
    double_indirect: u32,
}

const_assert_eq!(core::mem::size_of::<RawDiskInode>(), SECTOR_SIZE);

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct IndexBlock {
    refs: [u32; REFS_PER_SECTOR],
}

const_assert_eq!(core::mem::size_of::<IndexBlock>(), SECTOR_SIZE);

impl IndexBlock {
    fn unallocated() -> Self {
        Self {
            refs: [UNALLOCATED_SECTOR; REFS_PER_SECTOR],
        }
    }
}

struct PointerTree {
    direct: [u32; N_DIRECT],
    single_indirect: u32,
    double_indirect: u32,
}

struct InodeState {
    open_count: u32,
    deny_write_count: u32,
    removed: bool,
}

/// The in-memory inode. Shared and reference counted; at most one instance
/// exists per disk sector, reachable through [`InodeTable`]'s open table.
pub struct InMemoryInode {
    sector: u32,
    is_directory: AtomicBool,
    length: AtomicU32,
    tree: Mutex<PointerTree>,
    state: Mutex<InodeState>,
    /// Held exclusively from construction until the initial disk-image read
    /// completes; concurrent openers block by acquiring-then-releasing it.
    load_gate: Mutex<()>,
    /// Serializes length-extending writes.
    extend: Mutex<()>,
    /// Serializes directory-entry-table mutations (component C).
    pub(crate) dir: Mutex<()>,
}

impl InMemoryInode {
    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory.load(Ordering::SeqCst)
    }

    pub fn length(&self) -> u32 {
        self.length.load(Ordering::SeqCst)
    }

    pub fn deny_write_count(&self) -> u32 {
        self.state.lock().unwrap().deny_write_count
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().unwrap().open_count
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }
}

/// A caller's reference to an open inode. Must be returned to
/// [`InodeTable::close`] exactly once; dropping it without closing leaks the
/// open-count entry.
#[derive(Clone)]
pub struct InodeHandle(pub(crate) Arc<InMemoryInode>);

impl InodeHandle {
    pub fn inner(&self) -> &InMemoryInode {
        &self.0
    }
}

/// Global open-inode table plus the sector-level I/O routines of the inode
/// layer.
pub struct InodeTable {
    device: Arc<dyn BlockDevice>,
    open: Mutex<HashMap<u32, Arc<InMemoryInode>>>,
}

impl InodeTable {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            open: Mutex::new(HashMap::new()),
        }
    }

    fn read_sector(&self, sector: u32, buf: &mut SectorBuf) {
        self.device.read(sector, buf);
    }

    fn write_sector(&self, sector: u32, buf: &SectorBuf) {
        self.device.write(sector, buf);
    }

    fn zero_sector(&self, sector: u32) {
        self.write_sector(sector, &[0u8; SECTOR_SIZE]);
    }

    fn read_index_block(&self, sector: u32) -> IndexBlock {
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_sector(sector, &mut buf);
        IndexBlock::read_from(&buf[..]).expect("sector-sized buffer")
    }

    fn write_index_block(&self, sector: u32, block: &IndexBlock) {
        self.write_sector(sector, block.as_bytes().try_into().unwrap());
    }

    /// `inode_open`: finds or creates the in-memory inode for `sector`.
    pub fn open(&self, sector: u32) -> Result<InodeHandle> {
        {
            let mut table = self.open.lock().unwrap();
            if let Some(existing) = table.get(&sector).cloned() {
                drop(table);
                // Wait for a concurrent initial load to finish.
                drop(existing.load_gate.lock().unwrap());
                existing.state.lock().unwrap().open_count += 1;
                return Ok(InodeHandle(existing));
            }

            let inode = Arc::new(InMemoryInode {
                sector,
                is_directory: AtomicBool::new(false),
                length: AtomicU32::new(0),
                tree: Mutex::new(PointerTree {
                    direct: [UNALLOCATED_SECTOR; N_DIRECT],
                    single_indirect: UNALLOCATED_SECTOR,
                    double_indirect: UNALLOCATED_SECTOR,
                }),
                state: Mutex::new(InodeState {
                    open_count: 1,
                    deny_write_count: 0,
                    removed: false,
                }),
                load_gate: Mutex::new(()),
                extend: Mutex::new(()),
                dir: Mutex::new(()),
            });
            // Hold the gate before publishing so concurrent openers block.
            let gate = inode.load_gate.lock().unwrap();
            table.insert(sector, inode.clone());
            drop(table);

            let mut buf = [0u8; SECTOR_SIZE];
            self.read_sector(sector, &mut buf);
            let raw = RawDiskInode::read_from(&buf[..]).expect("sector-sized buffer");
            if raw.magic != INODE_MAGIC {
                panic!("sector {} has bad inode magic {:#x}", sector, raw.magic);
            }
            // SAFETY-free publication: we are the sole holder at this point
            // (load_gate is held), so direct field mutation is fine through
            // the inner locks.
            *inode.tree.lock().unwrap() = PointerTree {
                direct: raw.direct,
                single_indirect: raw.single_indirect,
                double_indirect: raw.double_indirect,
            };
            inode.length.store(raw.length, Ordering::SeqCst);
            inode.is_directory.store(raw.is_directory != 0, Ordering::SeqCst);
            drop(gate);
            Ok(InodeHandle(inode))
        }
    }

    /// `inode_create`: preallocates sectors for `length` bytes and writes the
    /// disk image at `sector`. Rolls back all partial allocation on failure.
    pub fn create(
        &self,
        free_map: &FreeMap,
        sector: u32,
        length: u32,
        is_directory: bool,
    ) -> Result<()> {
        if length as u64 > MAX_FILE_LEN {
            return Err(KernelError::TooLarge);
        }
        let mut sectors_needed = length.div_ceil(SECTOR_SIZE as u32) as usize;
        let mut direct = [UNALLOCATED_SECTOR; N_DIRECT];
        let mut single_indirect = UNALLOCATED_SECTOR;
        let mut double_indirect = UNALLOCATED_SECTOR;

        let result: Result<()> = (|| {
            for slot in direct.iter_mut() {
                if sectors_needed == 0 {
                    break;
                }
                let s = free_map.allocate(1)?;
                self.zero_sector(s);
                *slot = s;
                sectors_needed -= 1;
            }
            if sectors_needed > 0 {
                single_indirect = self.create_index_tree(free_map, &mut sectors_needed, 1)?;
            }
            if sectors_needed > 0 {
                double_indirect = self.create_index_tree(free_map, &mut sectors_needed, 2)?;
            }
            Ok(())
        })();

        // Free everything allocated so far on any error, so a failed create
        // never leaves a partial index tree behind.
        if let Err(e) = result {
            for &d in direct.iter() {
                if d != UNALLOCATED_SECTOR {
                    free_map.release(d, 1);
                }
            }
            if single_indirect != UNALLOCATED_SECTOR {
                self.free_index_tree(free_map, single_indirect, 1);
            }
            if double_indirect != UNALLOCATED_SECTOR {
                self.free_index_tree(free_map, double_indirect, 2);
            }
            return Err(e);
        }

        let raw = RawDiskInode {
            magic: INODE_MAGIC,
            is_directory: is_directory as u32,
            length,
            direct,
            single_indirect,
            double_indirect,
        };
        self.write_sector(sector, raw.as_bytes().try_into().unwrap());
        free_map.persist(self)?;
        Ok(())
    }

    /// Recursively allocates an index tree of the given tier that can hold up
    /// to `*remaining` data sectors, consuming from `*remaining` as it goes.
    fn create_index_tree(&self, free_map: &FreeMap, remaining: &mut usize, tier: u32) -> Result<u32> {
        let index_sector = match free_map.allocate(1) {
            Ok(s) => s,
            Err(e) => return Err(e),
        };
        let capacity_per_slot = REFS_PER_SECTOR.pow(tier - 1);
        let mut block = IndexBlock::unallocated();
        let failure: std::result::Result<(), KernelError> = (|| {
            for slot in block.refs.iter_mut() {
                if *remaining == 0 {
                    break;
                }
                let take = (*remaining).min(capacity_per_slot);
                if tier == 1 {
                    let s = free_map.allocate(1)?;
                    self.zero_sector(s);
                    *slot = s;
                } else {
                    *slot = self.create_index_tree(free_map, remaining, tier - 1)?;
                    continue;
                }
                *remaining -= take;
            }
            Ok(())
        })();
        if let Err(e) = failure {
            for &r in block.refs.iter() {
                if r != UNALLOCATED_SECTOR {
                    if tier == 1 {
                        free_map.release(r, 1);
                    } else {
                        self.free_index_tree(free_map, r, tier - 1);
                    }
                }
            }
            free_map.release(index_sector, 1);
            return Err(e);
        }
        self.write_index_block(index_sector, &block);
        Ok(index_sector)
    }

    /// Releases an index tree and everything it points to.
    fn free_index_tree(&self, free_map: &FreeMap, sector: u32, tier: u32) {
        if sector == UNALLOCATED_SECTOR {
            return;
        }
        if tier == 0 {
            free_map.release(sector, 1);
            return;
        }
        let block = self.read_index_block(sector);
        for &r in block.refs.iter() {
            if r != UNALLOCATED_SECTOR {
                self.free_index_tree(free_map, r, tier - 1);
            }
        }
        free_map.release(sector, 1);
    }

    /// `byte_to_sector`: returns the backing sector for `offset`, allocating
    /// lazily through each tier when `allocate` is set and `free_map` is
    /// supplied.
    fn byte_to_sector(
        &self,
        free_map: Option<&FreeMap>,
        inode: &InMemoryInode,
        offset: u64,
        allocate: bool,
    ) -> Result<u32> {
        if offset >= MAX_FILE_LEN {
            return Err(KernelError::TooLarge);
        }
        let mut index = (offset / SECTOR_SIZE as u64) as usize;
        let mut tree = inode.tree.lock().unwrap();

        if index < N_DIRECT {
            if tree.direct[index] == UNALLOCATED_SECTOR && allocate {
                let fm = free_map.expect("allocate requires free_map");
                let s = fm.allocate(1)?;
                self.zero_sector(s);
                tree.direct[index] = s;
            }
            return Ok(tree.direct[index]);
        }
        index -= N_DIRECT;

        if index < REFS_PER_SECTOR {
            let single = self.ensure_index_sector(free_map, &mut tree.single_indirect, allocate)?;
            return self.resolve_leaf(free_map, single, index, allocate);
        }
        index -= REFS_PER_SECTOR;

        let double = self.ensure_index_sector(free_map, &mut tree.double_indirect, allocate)?;
        if double == UNALLOCATED_SECTOR {
            return Ok(UNALLOCATED_SECTOR);
        }
        let mid_idx = index / REFS_PER_SECTOR;
        let leaf_idx = index % REFS_PER_SECTOR;
        let mut mid_block = self.read_index_block(double);
        let mid_sector = self.ensure_index_sector(free_map, &mut mid_block.refs[mid_idx], allocate)?;
        if mid_block.refs[mid_idx] != UNALLOCATED_SECTOR {
            self.write_index_block(double, &mid_block);
        }
        self.resolve_leaf(free_map, mid_sector, leaf_idx, allocate)
    }

    fn ensure_index_sector(
        &self,
        free_map: Option<&FreeMap>,
        slot: &mut u32,
        allocate: bool,
    ) -> Result<u32> {
        if *slot == UNALLOCATED_SECTOR && allocate {
            let fm = free_map.expect("allocate requires free_map");
            let s = fm.allocate(1)?;
            self.write_index_block(s, &IndexBlock::unallocated());
            *slot = s;
        }
        Ok(*slot)
    }

    fn resolve_leaf(
        &self,
        free_map: Option<&FreeMap>,
        index_sector: u32,
        leaf_idx: usize,
        allocate: bool,
    ) -> Result<u32> {
        if index_sector == UNALLOCATED_SECTOR {
            return Ok(UNALLOCATED_SECTOR);
        }
        let mut block = self.read_index_block(index_sector);
        if block.refs[leaf_idx] == UNALLOCATED_SECTOR && allocate {
            let fm = free_map.expect("allocate requires free_map");
            let s = fm.allocate(1)?;
            self.zero_sector(s);
            block.refs[leaf_idx] = s;
            self.write_index_block(index_sector, &block);
        }
        Ok(block.refs[leaf_idx])
    }

    /// `inode_read_at`: sparse-read semantics, clamped to the current length.
    pub fn read_at(&self, handle: &InodeHandle, dst: &mut [u8], offset: u32) -> Result<usize> {
        let inode = handle.inner();
        let length = inode.length();
        if offset >= length {
            return Ok(0);
        }
        let mut total = 0usize;
        let size = dst.len().min((length - offset) as usize);
        let mut off = offset as u64;
        while total < size {
            let sector_ofs = (off % SECTOR_SIZE as u64) as usize;
            let chunk = size_chunk(size - total, sector_ofs);
            let sector = self.byte_to_sector(None, inode, off, false)?;
            if sector == UNALLOCATED_SECTOR {
                dst[total..total + chunk].fill(0);
            } else {
                let mut buf = [0u8; SECTOR_SIZE];
                self.read_sector(sector, &mut buf);
                dst[total..total + chunk].copy_from_slice(&buf[sector_ofs..sector_ofs + chunk]);
            }
            total += chunk;
            off += chunk as u64;
        }
        Ok(total)
    }

    /// `inode_write_at`: allocates lazily, serializing with `extend` when the
    /// write grows the file. Returns 0 while `deny_write_count > 0`.
    pub fn write_at(
        &self,
        free_map: &FreeMap,
        handle: &InodeHandle,
        src: &[u8],
        offset: u32,
    ) -> Result<usize> {
        self.write_at_inner(Some(free_map), handle, src, offset)
    }

    /// Writes without ever allocating a new sector; used for reserved files
    /// whose length is fixed at creation time, so no [`FreeMap`] is needed.
    fn write_at_existing(&self, handle: &InodeHandle, src: &[u8], offset: u32) -> Result<usize> {
        self.write_at_inner(None, handle, src, offset)
    }

    fn write_at_inner(
        &self,
        free_map: Option<&FreeMap>,
        handle: &InodeHandle,
        src: &[u8],
        offset: u32,
    ) -> Result<usize> {
        let inode = handle.inner();
        if inode.state.lock().unwrap().deny_write_count > 0 {
            return Ok(0);
        }
        let extending = offset as u64 + src.len() as u64 > inode.length() as u64;
        let _extend_guard = extending.then(|| inode.extend.lock().unwrap());

        if offset as u64 + src.len() as u64 > MAX_FILE_LEN {
            return Err(KernelError::TooLarge);
        }

        let mut total = 0usize;
        let mut off = offset as u64;
        while total < src.len() {
            let sector_ofs = (off % SECTOR_SIZE as u64) as usize;
            let chunk = size_chunk(src.len() - total, sector_ofs);
            let sector = self.byte_to_sector(free_map, inode, off, free_map.is_some())?;
            if sector == UNALLOCATED_SECTOR {
                return Err(KernelError::NoSpace);
            }
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                self.write_sector(sector, src[total..total + chunk].try_into().unwrap());
            } else {
                let mut buf = [0u8; SECTOR_SIZE];
                self.read_sector(sector, &mut buf);
                buf[sector_ofs..sector_ofs + chunk].copy_from_slice(&src[total..total + chunk]);
                self.write_sector(sector, &buf);
            }
            total += chunk;
            off += chunk as u64;
        }
        if off as u32 > inode.length() {
            inode.length.store(off as u32, Ordering::SeqCst);
        }
        if let Some(fm) = free_map {
            fm.persist(self)?;
        }
        Ok(total)
    }

    pub fn deny_write(&self, handle: &InodeHandle) {
        handle.inner().state.lock().unwrap().deny_write_count += 1;
    }

    pub fn allow_write(&self, handle: &InodeHandle) {
        let mut state = handle.inner().state.lock().unwrap();
        assert!(state.deny_write_count > 0);
        state.deny_write_count -= 1;
    }

    pub fn mark_removed(&self, handle: &InodeHandle) {
        handle.inner().state.lock().unwrap().removed = true;
    }

    /// `inode_close`: decrements open count; frees disk sectors if the inode
    /// was marked removed and this was the last opener.
    pub fn close(&self, free_map: &FreeMap, handle: InodeHandle) -> Result<()> {
        let inode = handle.0;
        let (should_finalize, removed) = {
            let mut state = inode.state.lock().unwrap();
            state.open_count -= 1;
            (state.open_count == 0, state.removed)
        };
        if !should_finalize {
            return Ok(());
        }
        self.open.lock().unwrap().remove(&inode.sector);
        if removed {
            let tree = inode.tree.lock().unwrap();
            for &d in tree.direct.iter() {
                if d != UNALLOCATED_SECTOR {
                    free_map.release(d, 1);
                }
            }
            if tree.single_indirect != UNALLOCATED_SECTOR {
                self.free_index_tree(free_map, tree.single_indirect, 1);
            }
            if tree.double_indirect != UNALLOCATED_SECTOR {
                self.free_index_tree(free_map, tree.double_indirect, 2);
            }
            drop(tree);
            free_map.release(inode.sector, 1);
            free_map.persist(self)?;
        } else {
            self.flush(&inode);
        }
        Ok(())
    }

    fn flush(&self, inode: &InMemoryInode) {
        let tree = inode.tree.lock().unwrap();
        let raw = RawDiskInode {
            magic: INODE_MAGIC,
            is_directory: inode.is_directory() as u32,
            length: inode.length(),
            direct: tree.direct,
            single_indirect: tree.single_indirect,
            double_indirect: tree.double_indirect,
        };
        self.write_sector(inode.sector, raw.as_bytes().try_into().unwrap());
    }

    /// Reads the full contents of a reserved, never-growing file (used by
    /// the free-map file at sector [`crate::fs::freemap::FREE_MAP_SECTOR`]).
    pub fn read_reserved_file(&self, sector: u32, dst: &mut [u8]) -> Result<()> {
        let handle = self.open(sector)?;
        let n = self.read_at(&handle, dst, 0)?;
        if n != dst.len() {
            return Err(KernelError::Corrupted("short read of reserved file"));
        }
        let inode = handle.0.clone();
        self.release_without_free(inode);
        Ok(())
    }

    /// Writes the full contents of a reserved, never-growing file.
    pub fn write_reserved_file(&self, sector: u32, src: &[u8]) -> Result<()> {
        let handle = self.open(sector)?;
        let n = self.write_at_existing(&handle, src, 0)?;
        if n != src.len() {
            return Err(KernelError::Corrupted("short write of reserved file"));
        }
        let inode = handle.0.clone();
        self.release_without_free(inode);
        Ok(())
    }

    fn release_without_free(&self, inode: Arc<InMemoryInode>) {
        let mut state = inode.state.lock().unwrap();
        state.open_count -= 1;
        if state.open_count == 0 {
            drop(state);
            self.open.lock().unwrap().remove(&inode.sector);
            self.flush(&inode);
        }
    }
}

fn size_chunk(remaining: usize, sector_ofs: usize) -> usize {
    remaining.min(SECTOR_SIZE - sector_ofs)
}
