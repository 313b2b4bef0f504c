//! Heap consistency checking.
//!
//! A full walk of the arena that verifies the block invariants
//! (payload alignment, tag consistency, minimum and granularity of
//! sizes, no adjacent free blocks, containment, epilogue placement,
//! and agreement between the allocated bits and the class lists) and
//! produces a snapshot of the block sequence for tests and embedders.
//!
//! The walk is read-only and runs in time linear in the number of
//! blocks. It is deliberately paranoid: every read is bounds-checked
//! against the owned region before it happens, so the checker itself
//! stays safe on a corrupted heap.

use std::collections::HashMap;

use thiserror::Error;

use crate::block::{self, DSIZE, MIN_BLOCK_SIZE, WORD};
use crate::heap::size_class::class_index;
use crate::heap::{BOOTSTRAP_BYTES, Heap, NUM_SIZE_CLASSES};

/// One block observed by the walker. Offsets are payload offsets from
/// `heap_start`, stable across mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload offset from `heap_start`.
    pub offset: usize,
    /// Block size in bytes, tags included.
    pub size: usize,
    /// Allocated flag from the header.
    pub allocated: bool,
}

/// The verified block sequence of a heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapSnapshot {
    /// Regular blocks in physical order (prologues and the epilogue are
    /// excluded).
    pub blocks: Vec<BlockInfo>,
}

impl HeapSnapshot {
    /// The free blocks as sorted `(offset, size)` pairs: the
    /// observable free-list state, independent of list order.
    #[must_use]
    pub fn free_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(usize, usize)> = self
            .blocks
            .iter()
            .filter(|b| !b.allocated)
            .map(|b| (b.offset, b.size))
            .collect();
        pairs.sort_unstable();
        pairs
    }

    /// Total bytes in free blocks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| !b.allocated)
            .map(|b| b.size)
            .sum()
    }

    /// Total bytes in allocated blocks.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.allocated)
            .map(|b| b.size)
            .sum()
    }

    /// Free blocks and bytes per size class.
    #[must_use]
    pub fn class_census(&self) -> [ClassOccupancy; NUM_SIZE_CLASSES] {
        let mut census = [ClassOccupancy::default(); NUM_SIZE_CLASSES];
        for b in self.blocks.iter().filter(|b| !b.allocated) {
            let entry = &mut census[class_index(b.size)];
            entry.blocks += 1;
            entry.bytes += b.size;
        }
        census
    }
}

/// Free-list occupancy of one size class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassOccupancy {
    /// Free blocks in the class.
    pub blocks: usize,
    /// Bytes across those blocks, tags included.
    pub bytes: usize,
}

/// An invariant violation found by the walker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("heap is not initialized")]
    Uninitialized,
    #[error("prologue sentinel {class} is damaged")]
    DamagedPrologue { class: usize },
    #[error("payload at offset {offset} is not 16-byte aligned")]
    MisalignedPayload { offset: usize },
    #[error("block at offset {offset} has size {size}, below the 32-byte minimum")]
    UndersizedBlock { offset: usize, size: usize },
    #[error("block at offset {offset} has size {size}, not a multiple of 16")]
    MisalignedSize { offset: usize, size: usize },
    #[error("block at offset {offset} extends past the owned region")]
    OutOfBounds { offset: usize },
    #[error("free block at offset {offset}: header {header:#x} and footer {footer:#x} disagree")]
    TagMismatch {
        offset: usize,
        header: u64,
        footer: u64,
    },
    #[error("adjacent free blocks at offsets {first} and {second}")]
    AdjacentFree { first: usize, second: usize },
    #[error("epilogue missing or malformed at brk - 8")]
    BadEpilogue,
    #[error("class list {class} is cyclic or damaged")]
    DamagedList { class: usize },
    #[error("list {class} entry at offset {offset} is not a free block of that class")]
    WrongList { class: usize, offset: usize },
    #[error("free block at offset {offset} appears {count} times on the class lists")]
    ListMembership { offset: usize, count: usize },
}

impl Heap {
    /// Walks the heap, verifying every invariant, and returns the block
    /// sequence.
    ///
    /// # Errors
    ///
    /// The first violation found, as a [`CheckError`].
    pub fn check(&self) -> Result<HeapSnapshot, CheckError> {
        if !self.is_initialized() {
            return Err(CheckError::Uninitialized);
        }
        let start = self.arena_ref().heap_start_addr();
        let brk = self.arena_ref().brk_addr();
        let epilogue_header = brk - WORD;

        // Prologue region: eight intact minimum-size sentinels.
        for class in 0..NUM_SIZE_CLASSES {
            let sentinel = self.sentinel(class);
            let expected = block::pack(MIN_BLOCK_SIZE, true);
            // SAFETY: the bootstrap region is inside the owned region.
            let intact = unsafe {
                block::read_word(block::header(sentinel)) == expected
                    && block::read_word(sentinel + DSIZE) == expected
            };
            if !intact {
                return Err(CheckError::DamagedPrologue { class });
            }
        }

        // Physical walk of the regular blocks.
        let mut blocks = Vec::new();
        let mut prev: Option<BlockInfo> = None;
        let mut p = start + BOOTSTRAP_BYTES;
        loop {
            let haddr = block::header(p);
            if haddr > epilogue_header {
                return Err(CheckError::BadEpilogue);
            }
            // SAFETY: haddr <= epilogue_header < brk, inside the owned
            // region.
            let word = unsafe { block::read_word(haddr) };
            if haddr == epilogue_header {
                if word != block::pack(0, true) {
                    return Err(CheckError::BadEpilogue);
                }
                break;
            }

            let offset = p - start;
            let size = block::unpack_size(word);
            let allocated = block::unpack_alloc(word);
            if p % DSIZE != 0 {
                return Err(CheckError::MisalignedPayload { offset });
            }
            if size < MIN_BLOCK_SIZE {
                return Err(CheckError::UndersizedBlock { offset, size });
            }
            if size % DSIZE != 0 {
                return Err(CheckError::MisalignedSize { offset, size });
            }
            if haddr + size > epilogue_header {
                return Err(CheckError::OutOfBounds { offset });
            }
            if !allocated {
                // SAFETY: the footer address was just bounds-checked.
                let foot = unsafe { block::read_word(p + size - DSIZE) };
                if foot != word {
                    return Err(CheckError::TagMismatch {
                        offset,
                        header: word,
                        footer: foot,
                    });
                }
                if let Some(prior) = prev
                    && !prior.allocated
                {
                    return Err(CheckError::AdjacentFree {
                        first: prior.offset,
                        second: offset,
                    });
                }
            }

            let info = BlockInfo {
                offset,
                size,
                allocated,
            };
            blocks.push(info);
            prev = Some(info);
            p += size;
        }

        // List sweep: the free blocks and the class lists must agree.
        let free: HashMap<usize, usize> = blocks
            .iter()
            .filter(|b| !b.allocated)
            .map(|b| (b.offset, b.size))
            .collect();
        let mut seen: HashMap<usize, usize> = HashMap::new();
        for class in 0..NUM_SIZE_CLASSES {
            let sentinel = self.sentinel(class);
            // SAFETY: sentinel link words were verified intact above;
            // each hop is checked against the free set before use.
            let mut cur = unsafe { block::list_next(sentinel) };
            let mut hops = 0usize;
            while cur != sentinel {
                hops += 1;
                if hops > free.len() + 1 {
                    return Err(CheckError::DamagedList { class });
                }
                let offset = match cur.checked_sub(start) {
                    Some(o) => o,
                    None => return Err(CheckError::DamagedList { class }),
                };
                let Some(&size) = free.get(&offset) else {
                    return Err(CheckError::WrongList { class, offset });
                };
                if class_index(size) != class {
                    return Err(CheckError::WrongList { class, offset });
                }
                *seen.entry(offset).or_insert(0) += 1;
                // SAFETY: cur is a verified free block; its link words
                // lie in its payload.
                cur = unsafe { block::list_next(cur) };
            }
        }
        for (&offset, _) in &free {
            match seen.get(&offset) {
                Some(1) => {}
                Some(&count) => return Err(CheckError::ListMembership { offset, count }),
                None => return Err(CheckError::ListMembership { offset, count: 0 }),
            }
        }

        Ok(HeapSnapshot { blocks })
    }
}
