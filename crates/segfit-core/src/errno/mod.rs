//! Diagnostic error channel.
//!
//! A single process-wide integer slot holding the last error kind, with
//! get/set accessors. This mirrors the conventional `errno` pattern: the
//! allocator reports failure through a sentinel return value and records
//! the reason here. The slot promises nothing under concurrent mutation
//! beyond freedom from tearing.

use std::sync::atomic::{AtomicI32, Ordering};

/// Recognized error kinds, with stable numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum MmErrno {
    /// No error occurred; the last operation was successful.
    #[default]
    None = 0,
    /// Allocation failed due to insufficient space (e.g. sbrk failure).
    NoMemory = 1,
    /// An invalid argument was passed to a memory routine.
    InvalidArgument = 2,
    /// Memory alignment error.
    Alignment = 3,
    /// Heap corruption detected (e.g. tag mismatch, double free).
    Corruption = 4,
    /// Internal allocator error (unexpected state).
    Internal = 5,
}

impl MmErrno {
    /// The stable numeric code for this error kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Maps a numeric code back to its error kind.
    ///
    /// Unrecognized codes map to [`MmErrno::Internal`]: the slot can be
    /// set to an arbitrary integer through the C accessor, and a foreign
    /// value still has to read back as *some* failure.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::NoMemory,
            2 => Self::InvalidArgument,
            3 => Self::Alignment,
            4 => Self::Corruption,
            _ => Self::Internal,
        }
    }

    /// Short lowercase label, used in lifecycle log records.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NoMemory => "no-memory",
            Self::InvalidArgument => "invalid-argument",
            Self::Alignment => "alignment",
            Self::Corruption => "corruption",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for MmErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

static MM_ERRNO: AtomicI32 = AtomicI32::new(0);

/// Returns the current value of the error slot.
#[must_use]
pub fn get() -> MmErrno {
    MmErrno::from_code(get_code())
}

/// Returns the raw integer in the error slot.
#[must_use]
pub fn get_code() -> i32 {
    MM_ERRNO.load(Ordering::Relaxed)
}

/// Sets the error slot.
pub fn set(err: MmErrno) {
    set_code(err.code());
}

/// Sets the error slot from a raw integer (C accessor path).
pub fn set_code(code: i32) {
    MM_ERRNO.store(code, Ordering::Relaxed);
}

/// Resets the error slot to [`MmErrno::None`].
pub fn clear() {
    set(MmErrno::None);
}
