//! An on-disk file system and demand-paged virtual memory core for a small
//! kernel: a pluggable, host-testable subsystem rather than a `no_std`
//! kernel image.
//!
//! Embedders supply a [`device::BlockDevice`] per role (filesystem and
//! swap), an [`mmu::Mmu`], and implement [`thread::CurrentThread`] for
//! their own scheduler's notion of "the calling thread". Everything else —
//! inodes, directories, path resolution, frame eviction — lives here.

pub mod device;
pub mod error;
pub mod fs;
pub mod mmu;
pub mod sync;
pub mod thread;
pub mod vm;

pub use device::{BlockDevice, MemBlockDevice};
pub use error::{KernelError, Result};
pub use fs::FileSystem;
pub use mmu::{Mmu, SimMmu};
pub use thread::{CurrentThread, ThreadContext, ThreadId};
