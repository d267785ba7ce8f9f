//! Adaptive-send controller: decides whether a peer's send engine should
//! flush immediately or hold for more arrivals, bounded by a latency target
//! (spec §4.6).
//!
//! Grounded on spec §4.6's decision/statistics/adjustment procedure;
//! deliberately kept as two running sums and a count rather than a
//! streaming percentile estimator (design notes §9).

use std::time::Duration;

const MAX_SENDS_TRACKED: u32 = 64;
const MAX_SEND_TIMERS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    SendNow,
    Wait,
}

/// Per-peer adaptive state. Always accessed while the caller already holds
/// the peer's send mutex (spec §4.6's "called while holding the peer mutex").
pub struct AdaptiveState {
    max_wait_ns: u64,
    max_num_waits: u32,
    num_waits: u32,
    first_buffered_timer: Option<u64>,
    last_send_timers: [u64; MAX_SEND_TIMERS],
    timer_index: usize,
    timer_count: usize,
    tot_curr_wait_time: u64,
    tot_wait_time_plus_one: u64,
    num_stats: u64,
}

impl AdaptiveState {
    pub fn new(max_wait_ns: u64, initial_max_num_waits: u32) -> Self {
        Self {
            max_wait_ns,
            max_num_waits: initial_max_num_waits.min(MAX_SENDS_TRACKED),
            num_waits: 0,
            first_buffered_timer: None,
            last_send_timers: [0; MAX_SEND_TIMERS],
            timer_index: 0,
            timer_count: 0,
            tot_curr_wait_time: 0,
            tot_wait_time_plus_one: 0,
            num_stats: 0,
        }
    }

    pub fn max_num_waits(&self) -> u32 {
        self.max_num_waits
    }

    /// Decision procedure, spec §4.6 steps 1-3. `now_ns` is a monotonic
    /// nanosecond timestamp supplied by the caller (send.rs), never read
    /// from the system clock in here so the whole module stays test-pure.
    pub fn decide(&mut self, now_ns: u64) -> Decision {
        if self.num_waits >= self.max_num_waits {
            self.reset_batch();
            return Decision::SendNow;
        }
        if let Some(first) = self.first_buffered_timer {
            if now_ns.saturating_sub(first) > self.max_wait_ns {
                self.reset_batch();
                return Decision::SendNow;
            }
        }
        if self.first_buffered_timer.is_none() {
            self.first_buffered_timer = Some(now_ns);
        }
        self.num_waits += 1;
        Decision::Wait
    }

    fn reset_batch(&mut self) {
        self.num_waits = 0;
        self.first_buffered_timer = None;
    }

    /// Statistics update, spec §4.6: record every arrival's timestamp and
    /// fold the elapsed time at `max_num_waits` and `max_num_waits + 1`
    /// arrivals back into the running sums.
    pub fn record_arrival(&mut self, now_ns: u64) {
        let slot = self.timer_index % MAX_SEND_TIMERS;
        self.last_send_timers[slot] = now_ns;
        self.timer_index += 1;
        self.timer_count = (self.timer_count + 1).min(MAX_SEND_TIMERS);

        if self.timer_index >= MAX_SEND_TIMERS {
            self.compact();
        }

        let back = |n: u32| -> Option<u64> {
            let n = n as usize;
            if n == 0 || n > self.timer_count {
                return None;
            }
            let idx = (self.timer_index - 1 + MAX_SEND_TIMERS - n) % MAX_SEND_TIMERS;
            Some(self.last_send_timers[idx])
        };

        if let Some(t) = back(self.max_num_waits) {
            self.tot_curr_wait_time += now_ns.saturating_sub(t);
            self.num_stats += 1;
        }
        if let Some(t) = back(self.max_num_waits + 1) {
            self.tot_wait_time_plus_one += now_ns.saturating_sub(t);
        }
    }

    /// When the ring buffer index wraps, compact the last `MAX_SENDS_TRACKED`
    /// entries to the front so `back()`'s modular indexing stays simple.
    fn compact(&mut self) {
        let keep = MAX_SENDS_TRACKED as usize;
        let mut compacted = [0u64; MAX_SEND_TIMERS];
        for i in 0..keep.min(self.timer_count) {
            let src = (self.timer_index - 1 + MAX_SEND_TIMERS - i) % MAX_SEND_TIMERS;
            compacted[keep - 1 - i] = self.last_send_timers[src];
        }
        self.last_send_timers = compacted;
        self.timer_count = keep.min(self.timer_count);
        self.timer_index = self.timer_count;
    }

    /// Periodic adjustment, spec §4.6: shrink the batch if waits are running
    /// long, grow it if there's slack, then reset the sums for the next
    /// window.
    pub fn adjust(&mut self) {
        if self.num_stats == 0 {
            return;
        }
        let mean_curr = self.tot_curr_wait_time / self.num_stats;
        let mean_plus_one = self.tot_wait_time_plus_one / self.num_stats;
        let limit = self.max_wait_ns / 2;

        if mean_curr > limit {
            self.max_num_waits = self.max_num_waits.saturating_sub(1);
        } else if mean_plus_one < limit {
            self.max_num_waits = (self.max_num_waits + 1).min(MAX_SENDS_TRACKED);
        }
        self.tot_curr_wait_time = 0;
        self.tot_wait_time_plus_one = 0;
        self.num_stats = 0;
    }

    pub fn mean_curr_wait(&self) -> Option<Duration> {
        if self.num_stats == 0 {
            None
        } else {
            Some(Duration::from_nanos(self.tot_curr_wait_time / self.num_stats))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_arrival_forces_send_with_batch_of_two() {
        let mut state = AdaptiveState::new(1_000_000, 2);
        assert_eq!(state.decide(0), Decision::Wait);
        assert_eq!(state.decide(100), Decision::Wait);
        assert_eq!(state.decide(200), Decision::SendNow);
    }

    #[test]
    fn elapsed_past_max_wait_forces_send() {
        let mut state = AdaptiveState::new(1_000, 10);
        assert_eq!(state.decide(0), Decision::Wait);
        assert_eq!(state.decide(5_000), Decision::SendNow);
    }

    #[test]
    fn adjustment_shrinks_batch_when_waits_run_long() {
        let mut state = AdaptiveState::new(1_000, 4);
        for i in 0..10 {
            state.record_arrival(i * 2_000);
        }
        state.adjust();
        assert!(state.max_num_waits() <= 4);
    }

    #[test]
    fn adjustment_grows_batch_when_waits_are_short() {
        let mut state = AdaptiveState::new(1_000_000, 2);
        for i in 0..10 {
            state.record_arrival(i);
        }
        state.adjust();
        assert!(state.max_num_waits() >= 2);
    }
}
