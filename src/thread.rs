//! Current-thread identity: the one piece of scheduler state the core
//! observes. It never schedules or enumerates threads itself — only asks
//! "who is calling" and "where is their stack".

/// Opaque identifier for a kernel thread/process, used to attribute frames to
/// their owner in the clock queue and to look up the faulting thread's
/// supplemental page table and saved stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

/// What the VM core needs to know about the thread that owns a page: where
/// its saved user stack pointer currently sits, for the implicit
/// stack-growth heuristic, and the top of its user address space.
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext {
    pub id: ThreadId,
    /// Saved user stack pointer at the most recent trap into the kernel.
    pub user_stack_pointer: u64,
    /// One past the highest legal user virtual address for this thread.
    pub user_top: u64,
}

/// What the embedder exposes about "the calling thread": its identity, its
/// current-working-directory inode sector (the only per-process state the
/// path resolver needs), and its VM context for stack-growth decisions.
///
/// The core never schedules or looks up threads by id beyond this; it asks
/// "who am I" and gets back everything it needs to resolve a relative path
/// or service a page fault.
pub trait CurrentThread {
    /// This thread's identity.
    fn id(&self) -> ThreadId;

    /// The inode sector of this thread's current working directory.
    fn cwd_sector(&self) -> u32;

    /// Updates this thread's current working directory, used by `chdir`.
    fn set_cwd_sector(&self, sector: u32);

    /// This thread's saved stack pointer and user address space bound, for
    /// the frame engine's implicit stack-growth heuristic.
    fn vm_context(&self) -> ThreadContext;
}
