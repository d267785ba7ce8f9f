//! Per-connection statistics counters, updated lock-free in the syscall
//! path and copied out consistently by `snapshot` (spec §4.2).

use std::sync::atomic::{AtomicU64, Ordering};

const HISTOGRAM_BINS: usize = 16;

/// 16 exponential buckets: `< 32, < 64, ... , < 32 * 2^15`.
fn bucket_for(size: usize) -> usize {
    let mut bound = 32usize;
    for bin in 0..HISTOGRAM_BINS - 1 {
        if size < bound {
            return bin;
        }
        bound = bound.saturating_mul(2);
    }
    HISTOGRAM_BINS - 1
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub buffers_sent: u64,
    pub buffers_received: u64,
    pub send_errors: u64,
    pub send_timeouts: u64,
    pub receive_errors: u64,
    pub send_size_histogram: [u64; HISTOGRAM_BINS],
    pub receive_size_histogram: [u64; HISTOGRAM_BINS],
}

pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    buffers_sent: AtomicU64,
    buffers_received: AtomicU64,
    send_errors: AtomicU64,
    send_timeouts: AtomicU64,
    receive_errors: AtomicU64,
    send_size_histogram: [AtomicU64; HISTOGRAM_BINS],
    receive_size_histogram: [AtomicU64; HISTOGRAM_BINS],
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            buffers_sent: AtomicU64::new(0),
            buffers_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            send_timeouts: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            send_size_histogram: std::array::from_fn(|_| AtomicU64::new(0)),
            receive_size_histogram: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl ConnectionStats {
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.buffers_sent.fetch_add(1, Ordering::Relaxed);
        self.send_size_histogram[bucket_for(bytes)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.buffers_received.fetch_add(1, Ordering::Relaxed);
        self.receive_size_histogram[bucket_for(bytes)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_timeout(&self) {
        self.send_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies out a consistent snapshot. The caller is expected to hold the
    /// connection's read, write, and connect mutexes while calling this, per
    /// spec §4.2; this function itself just does the atomic loads.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snap = StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            buffers_sent: self.buffers_sent.load(Ordering::Relaxed),
            buffers_received: self.buffers_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            ..Default::default()
        };
        for i in 0..HISTOGRAM_BINS {
            snap.send_size_histogram[i] = self.send_size_histogram[i].load(Ordering::Relaxed);
            snap.receive_size_histogram[i] = self.receive_size_histogram[i].load(Ordering::Relaxed);
        }
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(bucket_for(0), 0);
        assert_eq!(bucket_for(31), 0);
        assert_eq!(bucket_for(32), 1);
        assert_eq!(bucket_for(63), 1);
        assert_eq!(bucket_for(1_000_000), HISTOGRAM_BINS - 1);
    }

    #[test]
    fn record_and_snapshot() {
        let stats = ConnectionStats::default();
        stats.record_send(100);
        stats.record_receive(50);
        stats.record_send_timeout();
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_received, 50);
        assert_eq!(snap.send_timeouts, 1);
    }
}
