//! Poll-set abstraction: a uniform readiness interface over the OS
//! multiplexer, used one-per-receive-thread (spec §4.3).
//!
//! Grounded on `examples/original_source/comm/ic_poll_set.c` /
//! `include/ic_poll_set.h`: `add`/`remove`/`check`/`next_ready`, a fixed
//! registration capacity, and the rule that removing an fd also drops it
//! from the current ready batch so no stale event is reported. The original
//! hand-selects epoll/event-ports/kqueue/IOCP/poll at compile time; `mio`
//! already performs exactly that selection (and is what the sibling game
//! server example's `neutronium` networking crate, and this teacher's own
//! `interop-server`, reach for when they need this same abstraction), so we
//! build the uniform interface on top of it instead of re-deriving the
//! per-OS backends by hand.

use std::collections::HashSet;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};

pub const CAPACITY: usize = 1024;

/// One readiness registration returned by `next_ready`.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: usize,
    pub readable: bool,
    pub error: bool,
}

pub struct PollSet {
    poll: Poll,
    events: Events,
    registered: HashSet<usize>,
    ready_batch: Vec<Ready>,
    ready_pos: usize,
}

impl PollSet {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new().map_err(Error::from)?,
            events: Events::with_capacity(CAPACITY),
            registered: HashSet::new(),
            ready_batch: Vec::new(),
            ready_pos: 0,
        })
    }

    /// Register `source` under `token`. Returns `Error::SetFull` once the
    /// set already holds `CAPACITY` registrations.
    pub fn add(&mut self, source: &mut impl mio::event::Source, token: usize) -> Result<()> {
        if self.registered.len() >= CAPACITY {
            return Err(Error::SetFull);
        }
        self.poll
            .registry()
            .register(source, Token(token), Interest::READABLE)
            .map_err(Error::from)?;
        self.registered.insert(token);
        Ok(())
    }

    /// Deregister `token`. Returns `Error::NotFound` if it wasn't registered.
    /// Also removes `token` from the current ready batch if present, so a
    /// caller iterating `next_ready` after a mid-batch `remove` never sees
    /// the removed fd again.
    pub fn remove(&mut self, source: &mut impl mio::event::Source, token: usize) -> Result<()> {
        if !self.registered.remove(&token) {
            return Err(Error::NotFound);
        }
        let _ = self.poll.registry().deregister(source);
        self.ready_batch.retain(|r| r.token != token);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.registered.len() >= CAPACITY
    }

    /// Block until at least one registration is ready or `timeout` elapses.
    pub fn check(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.poll.poll(&mut self.events, timeout).map_err(Error::from)?;
        self.ready_batch.clear();
        self.ready_pos = 0;
        for event in self.events.iter() {
            let token = event.token().0;
            if !self.registered.contains(&token) {
                continue;
            }
            self.ready_batch.push(Ready {
                token,
                readable: event.is_readable(),
                error: event.is_error(),
            });
        }
        Ok(())
    }

    /// Yields each readable registration from the last `check` exactly once,
    /// then `None`.
    pub fn next_ready(&mut self) -> Option<Ready> {
        if self.ready_pos >= self.ready_batch.len() {
            return None;
        }
        let ready = self.ready_batch[self.ready_pos];
        self.ready_pos += 1;
        Some(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::io::Write;

    #[test]
    fn add_remove_and_capacity() {
        let mut set = PollSet::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut listener = listener;
        set.add(&mut listener, 1).unwrap();
        assert!(matches!(set.remove(&mut listener, 999), Err(Error::NotFound)));
        set.remove(&mut listener, 1).unwrap();
        let _ = addr;
    }

    #[test]
    fn readiness_round_trip_over_loopback() {
        let mut set = PollSet::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut listener = listener;
        set.add(&mut listener, 1).unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"hi").unwrap();

        set.check(Some(Duration::from_secs(2))).unwrap();
        let ready = set.next_ready().expect("listener should be readable");
        assert_eq!(ready.token, 1);
        assert!(set.next_ready().is_none());
    }

    #[test]
    fn removing_mid_batch_hides_it_from_next_ready() {
        let mut set = PollSet::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        set.add(&mut listener, 7).unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();
        set.check(Some(Duration::from_secs(2))).unwrap();
        set.remove(&mut listener, 7).unwrap();
        assert!(set.next_ready().is_none());
    }
}
