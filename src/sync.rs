//! The two blocking primitives the core relies on: a blocking mutex (std's
//! own) and a counting semaphore.
//!
//! `std::sync::Mutex` is re-exported under the core's own name so call sites
//! read the same whether the lock is std's or this crate's; `Semaphore`
//! fills the gap std does not cover, used by the frame engine to park an
//! evictor when every frame is pinned.

use std::sync::{Condvar, Mutex};

pub use std::sync::Mutex as BlockingMutex;

/// A counting semaphore built from a mutex and a condition variable, the way
/// a semaphore is commonly implemented on top of a kernel's own blocking
/// mutex and wait-queue primitive.
pub struct Semaphore {
    count: Mutex<usize>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cvar: Condvar::new(),
        }
    }

    /// `P()` / `wait()`: blocks until the count is positive, then decrements it.
    pub fn down(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// `V()` / `signal()`: increments the count and wakes one waiter.
    pub fn up(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cvar.notify_one();
    }
}
