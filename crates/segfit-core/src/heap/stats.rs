//! Heap statistics and lifecycle records.
//!
//! Counters track the allocator's decision mix (fits, splits, the four
//! coalesce cases, extensions); structured records capture lifecycle
//! transitions and every failure. Records serialize to JSONL for the
//! embedding program's log pipeline via [`write_jsonl`].

use std::io::Write;

use serde::Serialize;

/// Severity level for lifecycle records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured heap lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Severity level.
    pub level: LogLevel,
    /// API symbol (`init`, `malloc`, `free`, `deinit`).
    pub op: &'static str,
    /// Event kind (`alloc`, `split`, `coalesce_both`, `oom`, ...).
    pub event: &'static str,
    /// Payload offset from heap start, when one is involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Size value involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Size-class index involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Error code recorded with the event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

/// Operation counters and occupancy gauges.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// `malloc` calls that returned a payload.
    pub mallocs: u64,
    /// `malloc` calls that failed.
    pub malloc_failures: u64,
    /// `free` calls that released a block (null no-ops excluded).
    pub frees: u64,
    /// Heap extensions performed.
    pub extensions: u64,
    /// Placements that split the fit block.
    pub splits: u64,
    /// Coalesce outcomes: both neighbors allocated.
    pub coalesce_none: u64,
    /// Coalesce outcomes: merged with the successor.
    pub coalesce_next: u64,
    /// Coalesce outcomes: merged with the predecessor.
    pub coalesce_prev: u64,
    /// Coalesce outcomes: merged with both neighbors.
    pub coalesce_both: u64,
    /// Currently allocated regular blocks.
    pub live_blocks: usize,
    /// Bytes in allocated regular blocks (tags included).
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_live_bytes: usize,
    /// Free regular blocks on the class lists.
    pub free_blocks: usize,
    /// Bytes in free regular blocks (tags included).
    pub free_bytes: usize,
}

/// Writes records as JSONL, one record per line.
///
/// # Errors
///
/// Propagates serialization and I/O failures.
pub fn write_jsonl<W: Write>(records: &[HeapLogRecord], mut out: W) -> std::io::Result<()> {
    for record in records {
        let line = serde_json::to_string(record)?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
    }
    Ok(())
}
