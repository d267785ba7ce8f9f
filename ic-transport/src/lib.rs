//! The iClaustron NDB transport layer: a page-pool-backed, multi-threaded
//! send/receive engine for the NDB cluster protocol over TCP.
//!
//! See `Transport` for the facade application code is expected to use;
//! the other modules are the engine underneath it and are public so a
//! binary can assemble a different threading model on top of them.

pub mod adaptive;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod logging;
pub mod mailbox;
pub mod node;
pub mod poll;
pub mod pool;
pub mod recv;
pub mod send;
pub mod signal;
pub mod threadpool;
pub mod transport;
pub mod wire;

pub use error::{Error, Result};
pub use transport::Transport;
