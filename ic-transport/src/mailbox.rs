//! Per-application-thread inbox: a mutex-protected chain of signals waiting
//! to be executed, plus a local free list of pages the thread hasn't
//! returned yet and a wake condition (spec §3, `AppInbox`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::pool::LocalPageCache;
use crate::signal::SignalChain;

struct Inner {
    pending: SignalChain,
}

/// One application thread's inbox. `slow` is flipped by the overload policy
/// (spec §5) when the thread falls behind draining `pending`; while set, the
/// transport refuses new `send` calls from this thread.
pub struct AppInbox {
    inner: Mutex<Inner>,
    wake: Condvar,
    slow: AtomicBool,
    overload_threshold: usize,
    local_pages: Mutex<LocalPageCache>,
}

impl AppInbox {
    pub fn new(overload_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { pending: Vec::new() }),
            wake: Condvar::new(),
            slow: AtomicBool::new(false),
            overload_threshold,
            local_pages: Mutex::new(LocalPageCache::new()),
        }
    }

    /// Splice `chain` onto the pending list and wake the thread if waiting.
    /// Called by the receive engine while posting, spec §4.4.
    pub fn post(&self, mut chain: SignalChain) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.append(&mut chain);
        if inner.pending.len() >= self.overload_threshold {
            self.slow.store(true, Ordering::Release);
        }
        self.wake.notify_one();
    }

    /// Drain everything currently pending, waiting up to `timeout` for the
    /// first signal to arrive if the inbox is empty.
    pub fn poll(&self, timeout: Duration) -> SignalChain {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.is_empty() {
            let (guard, _) = self
                .wake
                .wait_timeout_while(inner, timeout, |i| i.pending.is_empty())
                .unwrap();
            inner = guard;
        }
        let drained = std::mem::take(&mut inner.pending);
        if drained.len() < self.overload_threshold {
            self.slow.store(false, Ordering::Release);
        }
        drained
    }

    pub fn is_slow(&self) -> bool {
        self.slow.load(Ordering::Acquire)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn local_pages(&self) -> &Mutex<LocalPageCache> {
        &self.local_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_poll_returns_fifo_chain() {
        let inbox = AppInbox::new(1000);
        assert_eq!(inbox.poll(Duration::from_millis(1)).len(), 0);
        assert!(!inbox.is_slow());
    }

    #[test]
    fn overload_threshold_marks_inbox_slow() {
        let inbox = AppInbox::new(0);
        inbox.post(SignalChain::new());
        assert!(inbox.is_slow());
    }
}
