//! Runtime hardening configuration.
//!
//! The hardening level is set via the `SEGFIT_HARDENING` environment
//! variable:
//! - `off` (default): no pointer validation. Freeing a bad pointer is
//!   undefined.
//! - `check`: `free` validates its argument (containment, alignment,
//!   allocated bit, sane size) and rejects violations with the
//!   *corruption* error code instead of corrupting the heap.
//! - `abort`: same validation, but violations panic.

use std::sync::atomic::{AtomicU8, Ordering};

/// How aggressively the allocator validates caller-supplied pointers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardeningLevel {
    /// No validation. Invalid frees are undefined behavior.
    #[default]
    Off,
    /// Validate frees; reject violations with the corruption error code.
    Check,
    /// Validate frees; panic on violations.
    Abort,
}

impl HardeningLevel {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "check" | "validate" | "on" => Self::Check,
            "abort" | "panic" | "fatal" => Self::Abort,
            _ => Self::Off,
        }
    }

    /// Returns true if free-pointer validation is active.
    #[must_use]
    pub const fn validation_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Returns true if a validation failure should panic.
    #[must_use]
    pub const fn aborts(self) -> bool {
        matches!(self, Self::Abort)
    }
}

// Atomic cache: 0=unresolved, 1=Off, 2=Check, 3=Abort, 255=resolving.
// A non-blocking state machine rather than OnceLock, so a reentrant call
// arriving while the env var is being read observes RESOLVING and falls
// back to Off instead of deadlocking.
static CACHED_LEVEL: AtomicU8 = AtomicU8::new(0);

const LEVEL_UNRESOLVED: u8 = 0;
const LEVEL_OFF: u8 = 1;
const LEVEL_CHECK: u8 = 2;
const LEVEL_ABORT: u8 = 3;
const LEVEL_RESOLVING: u8 = 255;

fn level_to_u8(level: HardeningLevel) -> u8 {
    match level {
        HardeningLevel::Off => LEVEL_OFF,
        HardeningLevel::Check => LEVEL_CHECK,
        HardeningLevel::Abort => LEVEL_ABORT,
    }
}

fn u8_to_level(v: u8) -> HardeningLevel {
    match v {
        LEVEL_CHECK => HardeningLevel::Check,
        LEVEL_ABORT => HardeningLevel::Abort,
        _ => HardeningLevel::Off,
    }
}

/// Get the configured hardening level (reads the env var on first call,
/// caches thereafter).
#[must_use]
pub fn hardening_level() -> HardeningLevel {
    let cached = CACHED_LEVEL.load(Ordering::Relaxed);

    // Fast path: already resolved.
    if cached != LEVEL_UNRESOLVED && cached != LEVEL_RESOLVING {
        return u8_to_level(cached);
    }

    // Reentrant call during resolution: Off is the safe default.
    if cached == LEVEL_RESOLVING {
        return HardeningLevel::Off;
    }

    // Try to claim the resolution slot.
    if CACHED_LEVEL
        .compare_exchange(
            LEVEL_UNRESOLVED,
            LEVEL_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_LEVEL.load(Ordering::Relaxed);
        return if v != LEVEL_UNRESOLVED && v != LEVEL_RESOLVING {
            u8_to_level(v)
        } else {
            HardeningLevel::Off
        };
    }

    let level = std::env::var("SEGFIT_HARDENING")
        .map(|v| HardeningLevel::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_LEVEL.store(level_to_u8(level), Ordering::Release);
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(HardeningLevel::from_str_loose("off"), HardeningLevel::Off);
        assert_eq!(
            HardeningLevel::from_str_loose("check"),
            HardeningLevel::Check
        );
        assert_eq!(HardeningLevel::from_str_loose("CHECK"), HardeningLevel::Check);
        assert_eq!(
            HardeningLevel::from_str_loose("validate"),
            HardeningLevel::Check
        );
        assert_eq!(
            HardeningLevel::from_str_loose("abort"),
            HardeningLevel::Abort
        );
        assert_eq!(
            HardeningLevel::from_str_loose("panic"),
            HardeningLevel::Abort
        );
        assert_eq!(HardeningLevel::from_str_loose("bogus"), HardeningLevel::Off);
    }

    #[test]
    fn default_is_off() {
        assert_eq!(HardeningLevel::default(), HardeningLevel::Off);
    }

    #[test]
    fn validation_except_off() {
        assert!(!HardeningLevel::Off.validation_enabled());
        assert!(HardeningLevel::Check.validation_enabled());
        assert!(HardeningLevel::Abort.validation_enabled());
    }

    #[test]
    fn only_abort_aborts() {
        assert!(!HardeningLevel::Off.aborts());
        assert!(!HardeningLevel::Check.aborts());
        assert!(HardeningLevel::Abort.aborts());
    }

    #[test]
    fn cached_level_is_process_sticky_until_cache_reset() {
        let previous = CACHED_LEVEL.swap(LEVEL_CHECK, Ordering::SeqCst);
        assert_eq!(hardening_level(), HardeningLevel::Check);
        assert_eq!(hardening_level(), HardeningLevel::Check);

        CACHED_LEVEL.store(LEVEL_ABORT, Ordering::SeqCst);
        assert_eq!(hardening_level(), HardeningLevel::Abort);

        CACHED_LEVEL.store(previous, Ordering::SeqCst);
    }
}
