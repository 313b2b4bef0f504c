//! Size-class schedule.
//!
//! Eight power-of-two buckets partitioning block sizes. Each class is
//! anchored by one prologue sentinel; a free block of size `n` lives on
//! the list of class `max(0, min(7, floor(log2(n)) - 5))`:
//!
//! | class | block-size range |
//! |-------|------------------|
//! | 0     | [32, 64)         |
//! | 1     | [64, 128)        |
//! | 2     | [128, 256)       |
//! | 3     | [256, 512)       |
//! | 4     | [512, 1024)      |
//! | 5     | [1024, 2048)     |
//! | 6     | [2048, 4096)     |
//! | 7     | [4096, ∞)        |

/// Number of size classes (and prologue sentinels).
pub const NUM_SIZE_CLASSES: usize = 8;

/// Computes the class index for a block of `size` bytes.
///
/// `size` is a full block size (tags included), never below the minimum
/// block size in a well-formed heap.
#[must_use]
pub fn class_index(size: usize) -> usize {
    if size < 64 {
        return 0;
    }
    let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
    (log2 - 5).min(NUM_SIZE_CLASSES - 1)
}

/// Lower bound of the byte range covered by `class`.
#[must_use]
pub const fn class_lower_bound(class: usize) -> usize {
    if class == 0 { 32 } else { 64 << (class - 1) }
}
