//! Per-session capture statistics.
//!
//! The endpoint updates these counters inline; the `Capture` handle reads
//! them through a shared cell. The one-line summary is logged when a
//! session stops.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Counters for one capture endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    /// Messages emitted through the router.
    pub handled: u64,
    /// Bytes emitted through the router.
    pub handled_bytes: u64,
    /// Fragments admitted by the sequence tracker.
    pub fragments: u64,
    /// ULog stream bytes handed to the file (header + records).
    pub bytes_written: u64,
    /// LOGGING_ACK messages emitted.
    pub acked: u64,
    /// Sequence gaps observed.
    pub gaps: u64,
    /// Fragments lost inside those gaps.
    pub lost_fragments: u64,
    /// Retransmitted fragments discarded.
    pub retransmits: u64,
    /// Staging overflows forcing a resync.
    pub overflows: u64,
}

impl fmt::Display for CaptureStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handled {} packets ({} bytes), {} fragments, {} bytes written, \
             {} acked, {} gaps ({} lost), {} retransmits, {} overflows",
            self.handled,
            self.handled_bytes,
            self.fragments,
            self.bytes_written,
            self.acked,
            self.gaps,
            self.lost_fragments,
            self.retransmits,
            self.overflows
        )
    }
}

/// Shared handle to a session's counters.
pub type SharedStats = Arc<RwLock<CaptureStats>>;

/// A fresh zeroed stats cell.
pub fn shared() -> SharedStats {
    Arc::new(RwLock::new(CaptureStats::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_line_mentions_every_counter() {
        let stats = CaptureStats {
            handled: 10,
            handled_bytes: 2560,
            fragments: 8,
            bytes_written: 1984,
            acked: 8,
            gaps: 1,
            lost_fragments: 3,
            retransmits: 2,
            overflows: 0,
        };
        let line = stats.to_string();
        for needle in ["10", "2560", "8", "1984", "1", "3", "2", "0"] {
            assert!(line.contains(needle), "missing {needle} in {line}");
        }
    }
}
