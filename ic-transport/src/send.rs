//! Per-peer send engine: a queue of outgoing pages, a vectored writer, and
//! the helper thread that drains the queue when the originating application
//! thread can't (spec §4.5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::adaptive::{AdaptiveState, Decision};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::PageHandle;

const MAX_SEND_BUFFERS: usize = 64;
const MAX_SEND_SIZE: usize = 256 * 1024;

struct SendInner {
    outgoing: VecDeque<PageHandle>,
    queued_bytes: usize,
    send_active: bool,
    helper_wanted: bool,
    /// A window already detached from `outgoing` that the adaptive
    /// controller voted to hold; the helper thread is responsible for
    /// eventually writing it (spec §4.5 step 2c).
    pending_window: Option<Vec<PageHandle>>,
    adaptive: AdaptiveState,
    busy_arrivals: u64,
}

/// Per-(cluster, node) peer send state. One `SendPeer` per directory entry.
pub struct SendPeer {
    connection: Arc<Connection>,
    inner: Mutex<SendInner>,
    cond: Condvar,
    node_up: Arc<AtomicBool>,
    stop_ordered: AtomicBool,
    epoch: Instant,
    write_deadline: Duration,
}

impl SendPeer {
    pub fn new(
        connection: Arc<Connection>,
        node_up: Arc<AtomicBool>,
        max_wait_ns: u64,
        initial_max_num_waits: u32,
        write_deadline: Duration,
    ) -> Self {
        Self {
            connection,
            inner: Mutex::new(SendInner {
                outgoing: VecDeque::new(),
                queued_bytes: 0,
                send_active: false,
                helper_wanted: false,
                pending_window: None,
                adaptive: AdaptiveState::new(max_wait_ns, initial_max_num_waits),
                busy_arrivals: 0,
            }),
            cond: Condvar::new(),
            node_up,
            stop_ordered: AtomicBool::new(false),
            epoch: Instant::now(),
            write_deadline,
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub fn is_up(&self) -> bool {
        self.node_up.load(Ordering::Acquire)
    }

    /// Entry point, spec §4.5. `chain` is the caller's page list in send
    /// order; ownership of every handle moves into the peer's outgoing
    /// queue (or is consumed directly by this call's own write).
    pub fn send(&self, mut chain: Vec<PageHandle>, force: bool) -> Result<()> {
        let total_bytes: usize = chain.iter().map(|p| p.len()).sum();
        let now = self.now_ns();

        let write_window: Option<Vec<PageHandle>>;
        {
            let mut inner = self.inner.lock().unwrap();
            if !self.is_up() {
                return Err(Error::NodeDown);
            }
            for page in chain.drain(..) {
                inner.outgoing.push_back(page);
            }
            inner.queued_bytes += total_bytes;

            if !inner.send_active {
                inner.send_active = true;
                let window = detach_window(&mut inner);
                inner.adaptive.record_arrival(now);

                if !force && matches!(inner.adaptive.decide(now), Decision::Wait) {
                    inner.pending_window = Some(window);
                    inner.helper_wanted = true;
                    self.cond.notify_one();
                    write_window = None;
                } else {
                    write_window = Some(window);
                }
            } else {
                inner.busy_arrivals += 1;
                inner.adaptive.record_arrival(now);
                write_window = None;
            }
        }

        let Some(window) = write_window else {
            return Ok(());
        };
        self.write_and_finish(window)
    }

    fn write_and_finish(&self, window: Vec<PageHandle>) -> Result<()> {
        let bufs: Vec<&[u8]> = window.iter().map(|p| p.as_slice()).collect();
        let result = self.connection.write_vectored_all(&bufs, self.write_deadline);
        drop(bufs);
        drop(window);

        match result {
            Ok(_) => self.send_done(),
            Err(e) => {
                self.node_up.store(false, Ordering::Release);
                let _ = self.send_done();
                let _ = e;
                Err(Error::NodeDown)
            }
        }
    }

    /// Send-done critical section, spec §4.5 step 4.
    fn send_done(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !self.is_up() {
            inner.send_active = false;
            return Err(Error::NodeDown);
        }
        if !inner.outgoing.is_empty() || inner.pending_window.is_some() {
            inner.helper_wanted = true;
            self.cond.notify_one();
        } else {
            inner.send_active = false;
        }
        Ok(())
    }

    /// Helper-thread body: waits for `helper_wanted`, drains the queue one
    /// window at a time until empty, then idles again. Runs until
    /// `request_stop` is observed.
    pub fn helper_loop(&self) {
        loop {
            let window = {
                let mut inner = self.inner.lock().unwrap();
                while !inner.helper_wanted && !self.stop_ordered.load(Ordering::Acquire) {
                    inner = self.cond.wait(inner).unwrap();
                }
                if self.stop_ordered.load(Ordering::Acquire) {
                    return;
                }
                inner.helper_wanted = false;
                if let Some(pending) = inner.pending_window.take() {
                    pending
                } else {
                    detach_window(&mut inner)
                }
            };
            if window.is_empty() || !self.is_up() {
                // Either nothing to do, or `node_up` went false between
                // `helper_wanted` being set and this thread waking: drop
                // the window (returning its pages) instead of writing to a
                // peer that's already been failed, spec §4.7 step 3.
                let mut inner = self.inner.lock().unwrap();
                if inner.outgoing.is_empty() && inner.pending_window.is_none() {
                    inner.send_active = false;
                }
                continue;
            }
            if self.write_and_finish(window).is_err() {
                return;
            }
        }
    }

    pub fn request_stop(&self) {
        self.stop_ordered.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Node-failure drain (spec §4.7 step 2): return every still-queued page
    /// to its pool by dropping the handles.
    pub fn drain_outgoing(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.outgoing.clear();
        inner.pending_window = None;
        inner.queued_bytes = 0;
        inner.send_active = false;
    }

    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().unwrap().queued_bytes
    }

    /// Periodic adjustment, spec §4.6 "Adjustment": fold the latest
    /// statistics window into `max_num_waits`. `original_source/`'s
    /// `adaptive_send_algorithm_adjust` is defined but never wired to a
    /// caller; this crate wires it to a periodic thread (see
    /// `Transport::new`) so the per-window bound in spec §8's "Adaptive
    /// bound" invariant actually holds at runtime rather than only in tests
    /// that call it directly.
    pub fn adjust_adaptive(&self) {
        self.inner.lock().unwrap().adaptive.adjust();
    }
}

fn detach_window(inner: &mut SendInner) -> Vec<PageHandle> {
    let mut window = Vec::new();
    let mut window_bytes = 0usize;
    while window.len() < MAX_SEND_BUFFERS && window_bytes < MAX_SEND_SIZE {
        let Some(page) = inner.outgoing.pop_front() else {
            break;
        };
        window_bytes += page.len();
        inner.queued_bytes = inner.queued_bytes.saturating_sub(page.len());
        window.push(page);
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::{ConnectMode, Connection};
    use crate::pool::{LocalPageCache, Pool};
    use std::net::TcpListener;

    fn page_with(pool: &Pool, local: &mut LocalPageCache, bytes: &[u8]) -> PageHandle {
        let mut page = pool.acquire(local, 4).unwrap();
        page.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        page.set_len(bytes.len());
        page
    }

    fn loopback_pair() -> (Arc<Connection>, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_thread = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            stream
        });
        let client = Connection::connect_active(addr, crate::config::SocketTunables::lan(), ConnectMode::Blocking, None).unwrap();
        let server_std = server_thread.join().unwrap();
        let server = Connection::from_accepted_stream(server_std, crate::config::SocketTunables::lan()).unwrap();
        (client, server)
    }

    #[test]
    fn forced_send_writes_immediately() {
        let (client, server) = loopback_pair();
        let node_up = Arc::new(AtomicBool::new(true));
        let peer = SendPeer::new(
            client,
            node_up,
            1_000_000,
            2,
            Duration::from_secs(2),
        );
        let pool = Pool::new(PoolConfig {
            page_size: 64,
            max_segments: 2,
            pages_per_segment: 4,
            batch_n: 2,
        })
        .unwrap();
        let mut local = LocalPageCache::new();
        let page = page_with(&pool, &mut local, b"hello");
        peer.send(vec![page], true).unwrap();

        let mut buf = [0u8; 5];
        server.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
