//! The allocator core.
//!
//! Segregated free-list state over the arena: eight sentinel-anchored
//! circular doubly linked lists, LIFO first-fit placement with
//! splitting, boundary-tag coalescing, and heap extension.
//!
//! The heap layout after `init`:
//!
//! ```text
//! heap_start
//! | pad | prologue 0 .. prologue 7 | regular blocks ... | epilogue |
//!   8B        8 x 32 B                                       8B    ^brk
//! ```
//!
//! Each prologue is a permanently-allocated minimum-size block whose
//! payload words anchor one class list. The epilogue is a lone header
//! `(size=0, allocated=1)` at `brk - WORD`; heap extension overwrites
//! it with the new block's header and writes a fresh epilogue at the
//! new brk, so it always rides at the top of the owned region.

pub mod size_class;
pub mod stats;

use crate::arena::{Arena, PAGE_SIZE};
use crate::block::{self, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, WORD};
use crate::config::{self, HardeningLevel};
use crate::errno::{self, MmErrno};

pub use size_class::NUM_SIZE_CLASSES;
use size_class::class_index;
use stats::{HeapLogRecord, HeapStats, LogLevel};

/// Bytes reserved at the bottom of the arena by `init`: one alignment
/// pad word, eight 32-byte prologue sentinels, one epilogue word.
pub const BOOTSTRAP_BYTES: usize = (2 + 4 * NUM_SIZE_CLASSES) * WORD;

/// The allocator context: arena, free-list state, counters, lifecycle
/// log. All process-wide state of the allocator is grouped here; the
/// free-list heads themselves live inside the arena (in the prologue
/// payloads).
#[derive(Debug)]
pub struct Heap {
    arena: Arena,
    stats: HeapStats,
    log: Vec<HeapLogRecord>,
    next_decision_id: u64,
    initialized: bool,
    hardening_override: Option<HardeningLevel>,
}

impl Heap {
    /// Creates an uninitialized heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            stats: HeapStats::default(),
            log: Vec::new(),
            next_decision_id: 1,
            initialized: false,
            hardening_override: None,
        }
    }

    /// Returns true between a successful [`init`](Self::init) and the
    /// matching [`deinit`](Self::deinit).
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Operation counters and occupancy gauges.
    #[must_use]
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Accumulated lifecycle records.
    #[must_use]
    pub fn log(&self) -> &[HeapLogRecord] {
        &self.log
    }

    /// Drains the lifecycle records, handing them to the embedder.
    pub fn drain_log(&mut self) -> Vec<HeapLogRecord> {
        std::mem::take(&mut self.log)
    }

    /// Start of the mapped region (null when uninitialized).
    #[must_use]
    pub fn heap_start(&self) -> *const u8 {
        self.arena.heap_start()
    }

    /// Current brk cursor (null when uninitialized).
    #[must_use]
    pub fn brk(&self) -> *const u8 {
        self.arena.brk()
    }

    /// End of the mapped region (null when uninitialized).
    #[must_use]
    pub fn heap_end(&self) -> *const u8 {
        self.arena.heap_end()
    }

    /// Overrides the env-configured hardening level for this heap.
    /// `None` restores the process-wide configuration.
    pub fn set_hardening(&mut self, level: Option<HardeningLevel>) {
        self.hardening_override = level;
    }

    fn hardening(&self) -> HardeningLevel {
        self.hardening_override
            .unwrap_or_else(config::hardening_level)
    }

    /// Initializes the heap: acquires the arena, installs the prologue
    /// sentinels and the epilogue, and extends the heap by one page of
    /// free space.
    ///
    /// `size` is the requested usable budget; the arena acquired is
    /// `size + BOOTSTRAP_BYTES`, page-rounded. When the arena is too
    /// small for the initial one-page extension, `init` still succeeds
    /// and leaves no free space; the first `malloc` then fails with
    /// *no-memory*.
    ///
    /// # Errors
    ///
    /// - [`MmErrno::InvalidArgument`] when `size` is 0.
    /// - [`MmErrno::Internal`] when already initialized, or on an
    ///   unexpected arena failure.
    /// - [`MmErrno::NoMemory`] when the OS mapping fails.
    pub fn init(&mut self, size: usize) -> Result<(), MmErrno> {
        if self.initialized {
            errno::set(MmErrno::Internal);
            self.record_failure("init", "already_initialized", None, MmErrno::Internal);
            return Err(MmErrno::Internal);
        }
        if size == 0 {
            errno::set(MmErrno::InvalidArgument);
            self.record_failure("init", "zero_size", Some(0), MmErrno::InvalidArgument);
            return Err(MmErrno::InvalidArgument);
        }
        let total = match size.checked_add(BOOTSTRAP_BYTES) {
            Some(t) => t,
            None => {
                errno::set(MmErrno::InvalidArgument);
                self.record_failure("init", "size_overflow", Some(size), MmErrno::InvalidArgument);
                return Err(MmErrno::InvalidArgument);
            }
        };
        if let Err(e) = self.arena.init(total) {
            self.record_failure("init", "arena_init_failed", Some(size), e);
            return Err(e);
        }

        let base = match self.arena.sbrk(BOOTSTRAP_BYTES as isize) {
            Ok(b) => b,
            Err(_) => {
                // The rounded arena always holds the bootstrap region;
                // a failure here means the arena layer is inconsistent.
                let _ = self.arena.deinit();
                errno::set(MmErrno::Internal);
                self.record_failure("init", "bootstrap_reserve_failed", None, MmErrno::Internal);
                return Err(MmErrno::Internal);
            }
        };

        // SAFETY: [base, base + BOOTSTRAP_BYTES) was just obtained from
        // sbrk and lies inside the fresh mapping.
        unsafe {
            block::write_word(base, 0); // alignment pad
            for class in 0..NUM_SIZE_CLASSES {
                let sentinel = base + DSIZE + class * MIN_BLOCK_SIZE;
                block::set_tags(sentinel, MIN_BLOCK_SIZE, true);
                block::set_list_prev(sentinel, sentinel);
                block::set_list_next(sentinel, sentinel);
            }
            // Epilogue header at brk - WORD.
            block::set_header(base + BOOTSTRAP_BYTES, 0, true);
        }

        self.stats = HeapStats::default();
        self.initialized = true;

        let saved_errno = errno::get_code();
        match self.extend_heap(PAGE_SIZE) {
            Ok(_) => {
                self.record(
                    LogLevel::Info,
                    "init",
                    "ready",
                    None,
                    Some(size),
                    None,
                    "success",
                    None,
                );
                Ok(())
            }
            Err(MmErrno::NoMemory) => {
                // Tiny arena: the bootstrap region fits but one page of
                // free space does not. Documented behavior: init
                // succeeds with no free space and the first malloc
                // fails with no-memory.
                errno::set_code(saved_errno);
                self.record(
                    LogLevel::Warn,
                    "init",
                    "initial_extension_skipped",
                    None,
                    Some(PAGE_SIZE),
                    None,
                    "no_free_space",
                    None,
                );
                Ok(())
            }
            Err(e) => {
                self.initialized = false;
                let _ = self.arena.deinit();
                errno::set(e);
                self.record_failure("init", "initial_extension_failed", Some(PAGE_SIZE), e);
                Err(e)
            }
        }
    }

    /// Tears the heap down by releasing the arena. No per-block
    /// teardown: outstanding payload pointers dangle. Idempotent when
    /// uninitialized.
    ///
    /// # Errors
    ///
    /// - [`MmErrno::Corruption`] if the arena boundaries are inverted.
    /// - [`MmErrno::Internal`] if the OS rejects the unmap.
    pub fn deinit(&mut self) -> Result<(), MmErrno> {
        match self.arena.deinit() {
            Ok(()) => {
                if self.initialized {
                    self.initialized = false;
                    self.record(
                        LogLevel::Info,
                        "deinit",
                        "released",
                        None,
                        None,
                        None,
                        "success",
                        None,
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.record_failure("deinit", "arena_deinit_failed", None, e);
                Err(e)
            }
        }
    }

    /// Allocates a block with at least `size` usable bytes and returns
    /// its payload address, 16-aligned.
    ///
    /// Returns null on failure with the error slot set (*no-memory* when
    /// the heap cannot be extended, *invalid-argument* for
    /// unrepresentable sizes, *internal* before `init`). `size == 0`
    /// returns null without touching the error slot.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        if !self.initialized {
            errno::set(MmErrno::Internal);
            self.stats.malloc_failures += 1;
            self.record_failure("malloc", "uninitialized", Some(size), MmErrno::Internal);
            return std::ptr::null_mut();
        }
        if size == 0 {
            self.record(
                LogLevel::Trace,
                "malloc",
                "zero_request",
                None,
                Some(0),
                None,
                "noop",
                None,
            );
            return std::ptr::null_mut();
        }
        let Some(adjusted) = adjust_request(size) else {
            errno::set(MmErrno::InvalidArgument);
            self.stats.malloc_failures += 1;
            self.record_failure(
                "malloc",
                "unrepresentable_size",
                Some(size),
                MmErrno::InvalidArgument,
            );
            return std::ptr::null_mut();
        };

        let payload = match self.find_fit(adjusted) {
            // SAFETY: find_fit returned a free block on a class list.
            Some(fit) => unsafe {
                self.list_remove(fit);
                fit
            },
            None => match self.extend_heap(adjusted.max(PAGE_SIZE)) {
                // SAFETY: extend_heap inserted the (possibly merged)
                // free block before returning it.
                Ok(fresh) => unsafe {
                    self.list_remove(fresh);
                    fresh
                },
                Err(e) => {
                    self.stats.malloc_failures += 1;
                    self.record(
                        LogLevel::Warn,
                        "malloc",
                        "oom",
                        None,
                        Some(adjusted),
                        Some(class_index(adjusted)),
                        "failed",
                        Some(e),
                    );
                    return std::ptr::null_mut();
                }
            },
        };

        // SAFETY: payload heads a free block of at least `adjusted`
        // bytes, no longer on any list.
        let bsize = unsafe {
            self.place(payload, adjusted);
            block::size(payload)
        };

        self.stats.mallocs += 1;
        self.stats.live_blocks += 1;
        self.stats.live_bytes += bsize;
        self.stats.peak_live_bytes = self.stats.peak_live_bytes.max(self.stats.live_bytes);
        self.record(
            LogLevel::Trace,
            "malloc",
            "alloc",
            self.offset_of(payload),
            Some(bsize),
            Some(class_index(bsize)),
            "success",
            None,
        );
        payload as *mut u8
    }

    /// Frees the block whose payload is `ptr`. Null is a no-op.
    ///
    /// The freed block is coalesced with free physical neighbors and
    /// inserted at the head of its class list.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload returned by [`malloc`](Self::malloc)
    /// on this heap that has not been freed since. Under the `check` and
    /// `abort` hardening levels violations are detected and rejected
    /// (error slot set to *corruption* or *alignment*), but the default
    /// level performs no validation.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            self.record(
                LogLevel::Trace,
                "free",
                "free_null",
                None,
                None,
                None,
                "noop",
                None,
            );
            return;
        }
        let p = ptr as usize;
        let level = self.hardening();
        if level.validation_enabled() {
            if let Err(e) = self.validate_free_target(p) {
                if level.aborts() {
                    panic!("invalid free of {ptr:p}: {}", e.label());
                }
                errno::set(e);
                self.record(
                    LogLevel::Warn,
                    "free",
                    "rejected_pointer",
                    self.offset_of(p),
                    None,
                    None,
                    "denied",
                    Some(e),
                );
                return;
            }
        }

        // SAFETY: p heads an allocated block per the caller's contract
        // (or the validation above).
        unsafe {
            let size = block::size(p);
            self.stats.frees += 1;
            self.stats.live_blocks = self.stats.live_blocks.saturating_sub(1);
            self.stats.live_bytes = self.stats.live_bytes.saturating_sub(size);
            block::set_tags(p, size, false);
            self.coalesce(p);
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    /// Payload address of the sentinel anchoring `class`.
    pub(crate) fn sentinel(&self, class: usize) -> usize {
        self.arena.heap_start_addr() + DSIZE + class * MIN_BLOCK_SIZE
    }

    pub(crate) fn arena_ref(&self) -> &Arena {
        &self.arena
    }

    fn offset_of(&self, addr: usize) -> Option<usize> {
        addr.checked_sub(self.arena.heap_start_addr())
    }

    /// First-fit scan from the class of `adjusted` through class 7.
    fn find_fit(&self, adjusted: usize) -> Option<usize> {
        for class in class_index(adjusted)..NUM_SIZE_CLASSES {
            let sentinel = self.sentinel(class);
            // SAFETY: sentinels and their list nodes are maintained by
            // list_insert/list_remove and carry valid link words.
            unsafe {
                let mut cur = block::list_next(sentinel);
                while cur != sentinel {
                    if block::size(cur) >= adjusted {
                        return Some(cur);
                    }
                    cur = block::list_next(cur);
                }
            }
        }
        None
    }

    /// Inserts the free block at the head of its class list (LIFO).
    ///
    /// # Safety
    ///
    /// `p` must head a free block with valid tags that is not on any
    /// list.
    unsafe fn list_insert(&mut self, p: usize) {
        // SAFETY: per the caller's contract; sentinel links are valid.
        let size = unsafe {
            let size = block::size(p);
            let sentinel = self.sentinel(class_index(size));
            let head = block::list_next(sentinel);
            block::set_list_next(sentinel, p);
            block::set_list_prev(p, sentinel);
            block::set_list_next(p, head);
            block::set_list_prev(head, p);
            size
        };
        self.stats.free_blocks += 1;
        self.stats.free_bytes += size;
    }

    /// Unlinks the free block from its class list.
    ///
    /// # Safety
    ///
    /// `p` must head a free block currently on a class list.
    unsafe fn list_remove(&mut self, p: usize) {
        // SAFETY: per the caller's contract, p's neighbors are list
        // nodes with valid link words.
        let size = unsafe {
            let prev = block::list_prev(p);
            let next = block::list_next(p);
            block::set_list_next(prev, next);
            block::set_list_prev(next, prev);
            block::size(p)
        };
        self.stats.free_blocks -= 1;
        self.stats.free_bytes -= size;
    }

    /// Places an allocation of `adjusted` bytes into the free block at
    /// `p`, splitting when the remainder is a legal block.
    ///
    /// # Safety
    ///
    /// `p` must head a free block of at least `adjusted` bytes that is
    /// not on any list.
    unsafe fn place(&mut self, p: usize, adjusted: usize) {
        // SAFETY: per the caller's contract.
        unsafe {
            let csize = block::size(p);
            if csize - adjusted >= MIN_BLOCK_SIZE {
                block::set_tags(p, adjusted, true);
                let remainder = p + adjusted;
                block::set_tags(remainder, csize - adjusted, false);
                self.list_insert(remainder);
                self.stats.splits += 1;
                self.record(
                    LogLevel::Trace,
                    "malloc",
                    "split",
                    self.offset_of(remainder),
                    Some(csize - adjusted),
                    Some(class_index(csize - adjusted)),
                    "success",
                    None,
                );
            } else {
                block::set_tags(p, csize, true);
            }
        }
    }

    /// Merges the free block at `p` with free physical neighbors and
    /// inserts the result at the head of its class list. Returns the
    /// merged block's payload.
    ///
    /// Before a neighbor is merged its two tags are cross-checked. For
    /// the predecessor a disagreement means its footer area holds
    /// payload bytes (allocated blocks own those bytes), so the merge is
    /// silently skipped; for the successor the header is authoritative
    /// and a disagreement sets *corruption*.
    ///
    /// # Safety
    ///
    /// `p` must head a free block with valid tags that is not on any
    /// list, inside the owned region with the epilogue in place.
    unsafe fn coalesce(&mut self, p: usize) -> usize {
        // SAFETY: every regular block and prologue carries both tags,
        // so the word below the header is the predecessor's footer and
        // the word at the block's end is the successor's header (the
        // epilogue at the top).
        let (size, prev_word, next, next_word) = unsafe {
            let size = block::size(p);
            let next = p + size;
            (
                size,
                block::prev_footer_word(p),
                next,
                block::read_word(block::header(next)),
            )
        };

        // An allocated predecessor's footer area belongs to its payload
        // and may hold arbitrary user bytes, so a free-looking word is
        // only trusted when the header it implies agrees with it. A
        // disagreement here is the expected payload-clobber case, not
        // corruption: treat the predecessor as allocated and move on.
        // SAFETY: the agreement check stays within the owned region.
        let prev_free =
            !block::unpack_alloc(prev_word) && unsafe { self.prev_tags_agree(p, prev_word) };

        // The successor's header is never payload; if it claims a free
        // block, its footer must agree. Disagreement is real corruption:
        // abandon the merge but keep the heap navigable.
        let mut next_free = !block::unpack_alloc(next_word);
        // SAFETY: the agreement check stays within the owned region.
        if next_free && !unsafe { self.next_tags_agree(next, next_word) } {
            errno::set(MmErrno::Corruption);
            self.record(
                LogLevel::Error,
                "free",
                "successor_tag_mismatch",
                self.offset_of(next),
                None,
                None,
                "skipped_merge",
                Some(MmErrno::Corruption),
            );
            next_free = false;
        }

        // SAFETY: merge targets carry agreeing tags and are on lists.
        let merged = unsafe {
            match (prev_free, next_free) {
                // Both neighbors allocated: the block stands alone.
                (false, false) => {
                    self.stats.coalesce_none += 1;
                    p
                }
                // Successor free: absorb it.
                (false, true) => {
                    self.list_remove(next);
                    block::set_tags(p, size + block::unpack_size(next_word), false);
                    self.stats.coalesce_next += 1;
                    p
                }
                // Predecessor free: grow it over this block.
                (true, false) => {
                    let prev = p - block::unpack_size(prev_word);
                    self.list_remove(prev);
                    block::set_tags(prev, block::unpack_size(prev_word) + size, false);
                    self.stats.coalesce_prev += 1;
                    prev
                }
                // Both free: one span from the predecessor's header to
                // the successor's footer.
                (true, true) => {
                    let prev = p - block::unpack_size(prev_word);
                    self.list_remove(prev);
                    self.list_remove(next);
                    block::set_tags(
                        prev,
                        block::unpack_size(prev_word) + size + block::unpack_size(next_word),
                        false,
                    );
                    self.stats.coalesce_both += 1;
                    prev
                }
            }
        };

        // SAFETY: merged heads a free block that is not on any list.
        unsafe { self.list_insert(merged) };
        merged
    }

    /// Checks that the free predecessor implied by `prev_word` is
    /// plausible and carries an agreeing header.
    ///
    /// # Safety
    ///
    /// `p` must head a block inside the owned region.
    unsafe fn prev_tags_agree(&self, p: usize, prev_word: u64) -> bool {
        let s = block::unpack_size(prev_word);
        if s < MIN_BLOCK_SIZE || s % DSIZE != 0 {
            return false;
        }
        let Some(prev) = p.checked_sub(s) else {
            return false;
        };
        if prev < self.arena.heap_start_addr() + BOOTSTRAP_BYTES {
            return false;
        }
        // SAFETY: prev's header is inside the owned region.
        unsafe { block::read_word(block::header(prev)) == prev_word }
    }

    /// Checks that the free successor starting at `next` is plausible
    /// and carries an agreeing footer.
    ///
    /// # Safety
    ///
    /// `next` must be a payload address inside the owned region.
    unsafe fn next_tags_agree(&self, next: usize, next_word: u64) -> bool {
        let s = block::unpack_size(next_word);
        if s < MIN_BLOCK_SIZE || s % DSIZE != 0 {
            return false;
        }
        // The block must end at or before the epilogue header.
        if block::header(next) + s > self.arena.brk_addr() - WORD {
            return false;
        }
        // SAFETY: the footer address was just bounds-checked.
        unsafe { block::read_word(next + s - DSIZE) == next_word }
    }

    /// Grows the heap by at least `bytes` (rounded to an even number of
    /// words), installs a free block over the new span, pushes the
    /// epilogue forward, and coalesces. Returns the resulting free
    /// block's payload.
    fn extend_heap(&mut self, bytes: usize) -> Result<usize, MmErrno> {
        let words = bytes.div_ceil(WORD);
        let words = if words % 2 == 0 { words } else { words + 1 };
        let delta = words * WORD;
        if delta > MAX_BLOCK_SIZE || delta > isize::MAX as usize {
            errno::set(MmErrno::InvalidArgument);
            return Err(MmErrno::InvalidArgument);
        }

        let old_brk = self.arena.sbrk(delta as isize)?;

        // The previous brk becomes the new free block's payload; its
        // header overwrites the old epilogue.
        // SAFETY: [old_brk - WORD, old_brk + delta) lies inside the
        // owned region after the successful sbrk.
        let merged = unsafe {
            block::set_tags(old_brk, delta, false);
            block::set_header(old_brk + delta, 0, true);
            self.coalesce(old_brk)
        };
        self.stats.extensions += 1;

        // SAFETY: merged heads the freshly coalesced free block.
        let msize = unsafe { block::size(merged) };
        self.record(
            LogLevel::Debug,
            "heap",
            "extend",
            self.offset_of(merged),
            Some(msize),
            Some(class_index(msize)),
            "success",
            None,
        );
        Ok(merged)
    }

    /// Validates a free target under the `check`/`abort` hardening
    /// levels.
    fn validate_free_target(&self, p: usize) -> Result<(), MmErrno> {
        let start = self.arena.heap_start_addr();
        let brk = self.arena.brk_addr();
        if !self.initialized || p < start + BOOTSTRAP_BYTES || p >= brk {
            return Err(MmErrno::Corruption);
        }
        if p % DSIZE != 0 {
            return Err(MmErrno::Alignment);
        }
        // SAFETY: p is inside [heap_start + BOOTSTRAP_BYTES, brk), so
        // its header word is readable.
        let word = unsafe { block::read_word(block::header(p)) };
        if !block::unpack_alloc(word) {
            // Double free (or a pointer into a free block's interior).
            return Err(MmErrno::Corruption);
        }
        let size = block::unpack_size(word);
        if size < MIN_BLOCK_SIZE || size % DSIZE != 0 {
            return Err(MmErrno::Corruption);
        }
        if block::header(p) + size > brk - WORD {
            return Err(MmErrno::Corruption);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        level: LogLevel,
        op: &'static str,
        event: &'static str,
        offset: Option<usize>,
        size: Option<usize>,
        class: Option<usize>,
        outcome: &'static str,
        err: Option<MmErrno>,
    ) {
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        self.log.push(HeapLogRecord {
            decision_id,
            level,
            op,
            event,
            offset,
            size,
            class,
            outcome,
            errno: err.map(MmErrno::code),
        });
    }

    fn record_failure(
        &mut self,
        op: &'static str,
        event: &'static str,
        size: Option<usize>,
        err: MmErrno,
    ) {
        self.record(LogLevel::Warn, op, event, None, size, None, "failed", Some(err));
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Adjusted block size for a request of `size` usable bytes: header
/// added, rounded to the double word, floored at the minimum block
/// size. `None` when the result cannot be represented in the size
/// field.
fn adjust_request(size: usize) -> Option<usize> {
    let with_header = size.checked_add(WORD)?;
    let rounded = with_header.checked_add(DSIZE - 1)? & !(DSIZE - 1);
    let adjusted = rounded.max(MIN_BLOCK_SIZE);
    (adjusted <= MAX_BLOCK_SIZE).then_some(adjusted)
}
