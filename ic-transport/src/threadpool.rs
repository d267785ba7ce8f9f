//! Worker thread allocator: hands out named OS threads up to a configured
//! cap and joins them on shutdown (spec §4's Thread Pool component).
//!
//! Grounded on `examples/original_source/util/ic_threadpool.c`: a
//! fixed-size table of thread slots, `ThreadPoolFull` once exhausted, and a
//! `stop_flag` each worker observes at its own wait boundaries. Simplified
//! to `std::thread` since nothing here needs slot recycling beyond
//! join-on-shutdown.

use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::error::{Error, Result};

pub struct ThreadPool {
    cap: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `f` as a named worker thread. Returns `Error::ThreadPoolFull`
    /// once `cap` threads are outstanding.
    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        if handles.len() >= self.cap {
            return Err(Error::ThreadPoolFull);
        }
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(f)
            .map_err(Error::from)?;
        handles.push(handle);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Join every outstanding worker. Called once, from node shutdown.
    pub fn join_all(&self) {
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join_all();
    }
}
