//! Per-instance traffic accounting.
//!
//! Counters are plain atomics bumped from the copy pumps and the accept
//! loop, and read by the statistics ticker. Reads are individually atomic
//! but not consistent across counters; the output is diagnostic only.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::session::Direction;

/// Live counters shared by every task belonging to one proxy instance.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    /// Number of session drivers that have been counted in but not yet out.
    pub(crate) open: AtomicI64,
    /// Bytes that crossed the front→back pump.
    pub(crate) bytes_in: AtomicU64,
    /// Bytes that crossed the back→front pump.
    pub(crate) bytes_out: AtomicU64,
}

impl Counters {
    pub(crate) fn add_bytes(&self, dir: Direction, n: u64) {
        match dir {
            Direction::Inbound => self.bytes_in.fetch_add(n, Ordering::Relaxed),
            Direction::Outbound => self.bytes_out.fetch_add(n, Ordering::Relaxed),
        };
    }

    pub(crate) fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            open_connections: self.open.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of an instance's traffic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub open_connections: i64,
}

/// Render a byte count in human-readable form using a 1024 divisor.
///
/// Below 1 KB the exact count is printed; above it, two decimals and the
/// matching unit (KB through EB).
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.2} {}B", bytes as f64 / div as f64, ["K", "M", "G", "T", "P", "E"][exp])
}
