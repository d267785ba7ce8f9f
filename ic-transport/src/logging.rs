//! Subscriber install helper for binaries built on this crate.
//!
//! The library itself never installs a subscriber (mirrors
//! `s2n-quic-core`, which only ever calls `tracing::{trace,debug,...}!` and
//! leaves subscriber choice to the binary); this module is the ambient
//! convenience a production binary would reach for, not something the
//! transport depends on.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber driven by `RUST_LOG` (defaulting to `info`).
/// Returns an error if a global subscriber is already set.
pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
}
