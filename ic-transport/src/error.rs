//! Error kinds shared across the transport. Mirrors the kinds enumerated in
//! the NDB transport design: pool exhaustion, peer-down, timeouts, malformed
//! wire data, and the poll-set/thread-pool capacity errors.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// A page pool has no free pages and has reached its segment cap.
    OutOfMemory,
    /// The peer is marked down; the caller should stop sending to it.
    NodeDown,
    /// A deadline elapsed before the operation completed. `sent` carries how
    /// many bytes made it onto the wire before the timeout, for writes.
    Timeout { sent: usize },
    /// A signal header was malformed, had an impossible length, or failed
    /// its checksum.
    ProtocolError(&'static str),
    /// The accepted peer's address did not match the configured identity.
    Disallowed,
    /// The peer closed its end of the connection cleanly.
    EndOfFile,
    /// An underlying syscall failed for a reason other than the above.
    IoError(io::Error),
    /// A poll set is already at its registration capacity.
    SetFull,
    /// Attempted to remove a registration that isn't present.
    NotFound,
    /// The thread pool has no free worker slot.
    ThreadPoolFull,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "page pool exhausted"),
            Error::NodeDown => write!(f, "peer is down"),
            Error::Timeout { sent } => write!(f, "operation timed out after {sent} bytes"),
            Error::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
            Error::Disallowed => write!(f, "peer identity not allowed"),
            Error::EndOfFile => write!(f, "peer closed the connection"),
            Error::IoError(e) => write!(f, "io error: {e}"),
            Error::SetFull => write!(f, "poll set is full"),
            Error::NotFound => write!(f, "fd not registered in poll set"),
            Error::ThreadPoolFull => write!(f, "no worker thread slot available"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Error::Timeout { sent: 0 },
            io::ErrorKind::UnexpectedEof => Error::EndOfFile,
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => Error::NodeDown,
            _ => Error::IoError(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
