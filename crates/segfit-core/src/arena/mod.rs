//! The memory arena.
//!
//! Owns one contiguous region of private anonymous virtual memory,
//! `[heap_start, heap_end)`, acquired from the OS once at initialization
//! and released at teardown, plus a movable `brk` cursor inside it. The
//! owned portion is `[heap_start, brk)`; `[brk, heap_end)` is reserve.
//!
//! `heap_start <= brk <= heap_end` holds at every observable moment.
//! Before initialization and after teardown all three addresses are null.
//!
//! Failures are reported both as a typed `Err` and through the
//! process-wide error slot, mirroring the classic sbrk/errno contract.

use crate::errno::{self, MmErrno};

/// Granularity of arena acquisition.
pub const PAGE_SIZE: usize = 4096;

/// A privately-mapped anonymous memory region with a brk cursor.
///
/// Addresses are carried as `usize` (0 = null); they are only
/// dereferenced through the block primitives.
#[derive(Debug)]
pub struct Arena {
    heap_start: usize,
    brk: usize,
    heap_end: usize,
}

impl Arena {
    /// Creates an uninitialized arena; all three boundaries are null.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap_start: 0,
            brk: 0,
            heap_end: 0,
        }
    }

    /// Returns true once a mapping is held.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap_start != 0
    }

    /// Start of the mapped region (null when uninitialized).
    #[must_use]
    pub fn heap_start(&self) -> *const u8 {
        self.heap_start as *const u8
    }

    /// Current brk cursor (null when uninitialized).
    #[must_use]
    pub fn brk(&self) -> *const u8 {
        self.brk as *const u8
    }

    /// End of the mapped region, exclusive (null when uninitialized).
    #[must_use]
    pub fn heap_end(&self) -> *const u8 {
        self.heap_end as *const u8
    }

    /// Start address as a raw integer (0 when uninitialized).
    #[must_use]
    pub fn heap_start_addr(&self) -> usize {
        self.heap_start
    }

    /// Brk address as a raw integer (0 when uninitialized).
    #[must_use]
    pub fn brk_addr(&self) -> usize {
        self.brk
    }

    /// End address as a raw integer (0 when uninitialized).
    #[must_use]
    pub fn heap_end_addr(&self) -> usize {
        self.heap_end
    }

    /// Acquires a region of `ceil(size, PAGE_SIZE)` bytes of private
    /// anonymous memory.
    ///
    /// On success `heap_start == brk` and `heap_end` is the end of the
    /// rounded region.
    ///
    /// # Errors
    ///
    /// - [`MmErrno::InvalidArgument`] when `size` is 0 or the page
    ///   rounding overflows.
    /// - [`MmErrno::Internal`] when already initialized.
    /// - [`MmErrno::NoMemory`] when the OS mapping fails.
    pub fn init(&mut self, size: usize) -> Result<(), MmErrno> {
        if size == 0 {
            return Err(self.fail(MmErrno::InvalidArgument));
        }
        if self.is_initialized() {
            return Err(self.fail(MmErrno::Internal));
        }
        let rounded = size
            .checked_add(PAGE_SIZE - 1)
            .ok_or_else(|| self.fail(MmErrno::InvalidArgument))?
            & !(PAGE_SIZE - 1);

        // SAFETY: requests a fresh private anonymous mapping; no existing
        // memory is affected. The result is checked against MAP_FAILED.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(self.fail(MmErrno::NoMemory));
        }

        self.heap_start = base as usize;
        self.brk = self.heap_start;
        self.heap_end = self.heap_start + rounded;
        Ok(())
    }

    /// Returns the mapping to the OS and nulls the boundaries.
    ///
    /// Idempotent when uninitialized: succeeds without action.
    ///
    /// # Errors
    ///
    /// - [`MmErrno::Corruption`] if the boundaries violate
    ///   `heap_start <= heap_end`.
    /// - [`MmErrno::Internal`] if the OS rejects the unmap.
    pub fn deinit(&mut self) -> Result<(), MmErrno> {
        if !self.is_initialized() {
            return Ok(());
        }
        if self.heap_start > self.heap_end {
            return Err(self.fail(MmErrno::Corruption));
        }

        let len = self.heap_end - self.heap_start;
        // SAFETY: unmaps exactly the region obtained from mmap in init.
        let rc = unsafe { libc::munmap(self.heap_start as *mut libc::c_void, len) };
        if rc != 0 {
            return Err(self.fail(MmErrno::Internal));
        }

        self.heap_start = 0;
        self.brk = 0;
        self.heap_end = 0;
        Ok(())
    }

    /// Adjusts `brk` by the signed `delta` in bytes and returns the
    /// previous brk address. On failure `brk` is unchanged.
    ///
    /// The upper bound is exclusive: a `delta` that would make the new
    /// brk reach or exceed `heap_end` is rejected. (The reserve
    /// `[brk, heap_end)` may therefore never become empty; the test
    /// suite pins this.)
    ///
    /// # Errors
    ///
    /// - [`MmErrno::Internal`] when uninitialized.
    /// - [`MmErrno::InvalidArgument`] when the new brk would fall below
    ///   `heap_start`.
    /// - [`MmErrno::NoMemory`] when the new brk would reach or exceed
    ///   `heap_end`.
    pub fn sbrk(&mut self, delta: isize) -> Result<usize, MmErrno> {
        if !self.is_initialized() {
            return Err(self.fail(MmErrno::Internal));
        }

        let old = self.brk;
        let new = (old as isize).checked_add(delta);
        let new = match new {
            Some(n) if n >= 0 => n as usize,
            _ => return Err(self.fail(MmErrno::InvalidArgument)),
        };

        if new < self.heap_start {
            return Err(self.fail(MmErrno::InvalidArgument));
        }
        if new >= self.heap_end {
            return Err(self.fail(MmErrno::NoMemory));
        }

        self.brk = new;
        Ok(old)
    }

    /// Records `err` in the process-wide slot and hands it back.
    fn fail(&self, err: MmErrno) -> MmErrno {
        errno::set(err);
        err
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Explicit deinit is the primary teardown path; dropping an
        // initialized arena returns the mapping without reporting.
        if self.is_initialized() && self.heap_start <= self.heap_end {
            let len = self.heap_end - self.heap_start;
            // SAFETY: unmaps exactly the region obtained from mmap.
            unsafe {
                libc::munmap(self.heap_start as *mut libc::c_void, len);
            }
            self.heap_start = 0;
            self.brk = 0;
            self.heap_end = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rounds_to_page_and_aligns_boundaries() {
        let mut arena = Arena::new();
        arena.init(100).expect("init");
        assert!(arena.is_initialized());
        assert_eq!(arena.heap_start_addr(), arena.brk_addr());
        assert_eq!(arena.heap_end_addr() - arena.heap_start_addr(), PAGE_SIZE);
        assert_eq!(arena.heap_start_addr() % PAGE_SIZE, 0);
        arena.deinit().expect("deinit");
    }

    #[test]
    fn init_zero_is_invalid() {
        let mut arena = Arena::new();
        assert_eq!(arena.init(0), Err(MmErrno::InvalidArgument));
        assert!(!arena.is_initialized());
        assert!(arena.heap_start().is_null());
    }

    #[test]
    fn double_init_is_internal_error() {
        let mut arena = Arena::new();
        arena.init(PAGE_SIZE).expect("init");
        assert_eq!(arena.init(PAGE_SIZE), Err(MmErrno::Internal));
        arena.deinit().expect("deinit");
    }

    #[test]
    fn deinit_without_init_is_a_no_op() {
        let mut arena = Arena::new();
        assert_eq!(arena.deinit(), Ok(()));
        assert_eq!(arena.deinit(), Ok(()));
    }

    #[test]
    fn deinit_nulls_all_boundaries() {
        let mut arena = Arena::new();
        arena.init(PAGE_SIZE).expect("init");
        arena.deinit().expect("deinit");
        assert!(arena.heap_start().is_null());
        assert!(arena.brk().is_null());
        assert!(arena.heap_end().is_null());
    }

    #[test]
    fn sbrk_moves_and_returns_previous_brk() {
        let mut arena = Arena::new();
        arena.init(PAGE_SIZE).expect("init");

        let start = arena.heap_start_addr();
        assert_eq!(arena.sbrk(0), Ok(start));
        assert_eq!(arena.sbrk(1024), Ok(start));
        assert_eq!(arena.brk_addr(), start + 1024);
        assert_eq!(arena.sbrk(1024), Ok(start + 1024));
        assert_eq!(arena.brk_addr(), start + 2048);

        arena.deinit().expect("deinit");
    }

    #[test]
    fn sbrk_underflow_is_invalid_and_leaves_brk() {
        let mut arena = Arena::new();
        arena.init(PAGE_SIZE * 2).expect("init");

        let start = arena.heap_start_addr();
        assert_eq!(arena.sbrk(-4096), Err(MmErrno::InvalidArgument));
        assert_eq!(arena.brk_addr(), start);

        // A shrink that stays at or above heap_start is fine.
        arena.sbrk(4096).expect("grow");
        assert_eq!(arena.sbrk(-4096), Ok(start + 4096));
        assert_eq!(arena.brk_addr(), start);

        arena.deinit().expect("deinit");
    }

    #[test]
    fn sbrk_exact_fill_is_rejected() {
        let mut arena = Arena::new();
        arena.init(PAGE_SIZE).expect("init");

        let start = arena.heap_start_addr();
        // Exclusive upper bound: brk may never reach heap_end.
        assert_eq!(arena.sbrk(PAGE_SIZE as isize), Err(MmErrno::NoMemory));
        assert_eq!(arena.brk_addr(), start);
        assert_eq!(arena.sbrk(PAGE_SIZE as isize - 8), Ok(start));
        assert_eq!(arena.brk_addr(), start + PAGE_SIZE - 8);

        arena.deinit().expect("deinit");
    }

    #[test]
    fn sbrk_uninitialized_is_internal_error() {
        let mut arena = Arena::new();
        for delta in [-1024, 0, 1, 4096] {
            assert_eq!(arena.sbrk(delta), Err(MmErrno::Internal));
            assert!(arena.brk().is_null());
        }
    }

    #[test]
    fn drop_releases_the_mapping() {
        let mut arena = Arena::new();
        arena.init(PAGE_SIZE).expect("init");
        drop(arena);
        // Nothing to assert beyond not leaking/crashing; the munmap path
        // is shared with deinit, which the other tests exercise.
    }
}
