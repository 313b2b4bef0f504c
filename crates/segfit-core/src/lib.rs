//! # segfit-core
//!
//! A user-space dynamic memory allocator over a single privately-mapped
//! arena of anonymous virtual memory: segregated free lists, boundary-tag
//! coalescing, LIFO first-fit placement, eight power-of-two size classes.
//!
//! Layers, bottom-up:
//!
//! - [`errno`]: process-wide diagnostic error slot.
//! - [`arena`]: the mapped region `[heap_start, heap_end)` and its movable
//!   `brk` cursor.
//! - [`block`]: pure address arithmetic over the 64-bit header/footer
//!   metadata word. All raw heap reads and writes live here.
//! - [`heap`]: the allocator proper: free-list state, placement,
//!   splitting, coalescing, heap extension.
//! - [`check`]: a full-heap walker that verifies the block invariants and
//!   produces snapshots for tests and embedders.
//!
//! The allocator is not thread-safe; a [`Heap`] is a plain value owned by
//! its caller. Process-wide `extern "C"` exports live in `segfit-abi`.

pub mod arena;
pub mod block;
pub mod check;
pub mod config;
pub mod errno;
pub mod heap;

pub use arena::Arena;
pub use check::{BlockInfo, CheckError, ClassOccupancy, HeapSnapshot};
pub use config::HardeningLevel;
pub use errno::MmErrno;
pub use heap::stats::{HeapLogRecord, HeapStats, LogLevel, write_jsonl};
pub use heap::{Heap, NUM_SIZE_CLASSES};
