//! Signal descriptors: references into a shared page, never a copy unless
//! the signal straddled two reads (spec §4.4 step 4).

use std::ops::Range;

use crate::pool::PageHandle;
use crate::wire::{Header, MAX_SEGMENTS};

/// One parsed signal: a header plus byte ranges into `page` for the main
/// message and up to three segments. `page` holds one unit of the page's
/// own atomic refcount (via `PageHandle::share`), so a single received page
/// can back several signals, each dropped independently as the owning
/// application thread consumes them one at a time; the page returns to its
/// pool when the last signal referencing it is dropped.
pub struct SignalRef {
    pub header: Header,
    page: PageHandle,
    pub main: Range<usize>,
    pub segments: [Option<Range<usize>>; MAX_SEGMENTS],
}

impl SignalRef {
    pub fn new(
        header: Header,
        page: PageHandle,
        main: Range<usize>,
        segments: [Option<Range<usize>>; MAX_SEGMENTS],
    ) -> Self {
        Self {
            header,
            page,
            main,
            segments,
        }
    }

    pub fn main_bytes(&self) -> &[u8] {
        &self.page.as_slice()[self.main.clone()]
    }

    pub fn segment_bytes(&self, i: usize) -> Option<&[u8]> {
        self.segments[i].clone().map(|r| &self.page.as_slice()[r])
    }

    /// The full byte range of the signal on the page it was parsed from,
    /// for integrity checks (spec §8 "Signal integrity").
    pub fn total_len(&self) -> usize {
        self.header.length_bytes()
    }

    pub fn page(&self) -> &PageHandle {
        &self.page
    }
}

/// A chain of signals produced by one receive-thread wake, in arrival order.
/// Represented as a plain `Vec` rather than an intrusive list (see design
/// notes: either form is acceptable, and a `Vec` keeps this module free of
/// unsafe code since the splice here is not as hot a path as the page pool's
/// free list).
pub type SignalChain = Vec<SignalRef>;
