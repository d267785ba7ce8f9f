//! The static configuration snapshot the transport is built from.
//!
//! This is deliberately a plain struct, not a parser: loading it from a
//! cluster-configuration file is out of scope for this crate (see
//! `original_source/include/ic_apic_data.h` for the full config surface this
//! is carved out of). Everything here is read once at `Transport::new` and
//! is immutable for the lifetime of the transport.

use std::net::SocketAddr;
use std::time::Duration;

/// Socket tunables for one peer link, carried from the cluster config.
#[derive(Debug, Clone, Copy)]
pub struct SocketTunables {
    pub tcp_maxseg_size: u32,
    pub socket_read_buffer_size: u32,
    pub socket_write_buffer_size: u32,
    pub socket_kernel_read_buffer_size: u32,
    pub socket_kernel_write_buffer_size: u32,
    pub socket_max_wait_in_nanos: u64,
    pub is_wan_connection: bool,
}

impl SocketTunables {
    /// WAN preset from spec §4.2: 4 MiB buffers, 60 KiB MSS.
    pub fn wan() -> Self {
        Self {
            tcp_maxseg_size: 60 * 1024,
            socket_read_buffer_size: 4 * 1024 * 1024,
            socket_write_buffer_size: 4 * 1024 * 1024,
            socket_kernel_read_buffer_size: 4 * 1024 * 1024,
            socket_kernel_write_buffer_size: 4 * 1024 * 1024,
            socket_max_wait_in_nanos: Duration::from_secs(5).as_nanos() as u64,
            is_wan_connection: true,
        }
    }

    pub fn lan() -> Self {
        Self {
            tcp_maxseg_size: 0,
            socket_read_buffer_size: 256 * 1024,
            socket_write_buffer_size: 256 * 1024,
            socket_kernel_read_buffer_size: 0,
            socket_kernel_write_buffer_size: 0,
            socket_max_wait_in_nanos: Duration::from_secs(5).as_nanos() as u64,
            is_wan_connection: false,
        }
    }
}

/// Configuration for one (cluster_id, node_id) peer link.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub cluster_id: u8,
    pub node_id: u8,
    pub first_node_id: u8,
    pub second_node_id: u8,
    pub hostname: String,
    pub server_port: u16,
    /// When set, only accept connections from this address (client
    /// filtering). Also what tells apart peers that share one listening
    /// port (spec §4.2 listener retention) when this node is the listener.
    pub client_address: Option<SocketAddr>,
    pub tunables: SocketTunables,
    pub use_checksum: bool,
    pub use_message_id: bool,
    pub backlog: i32,
    /// Client-side TLS config for this link, already built by the caller.
    /// Cert handling is out of scope for this crate.
    #[cfg(feature = "tls")]
    pub tls_client: Option<std::sync::Arc<rustls::ClientConfig>>,
}

/// Page-pool sizing for one node's two pools (receive-buffer, signal-descriptor).
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub page_size: u32,
    pub max_segments: u32,
    pub pages_per_segment: u32,
    pub batch_n: u32,
}

impl PoolConfig {
    pub fn receive_default() -> Self {
        Self {
            page_size: 32 * 1024,
            max_segments: 8,
            pages_per_segment: 64,
            batch_n: 10,
        }
    }

    pub fn signal_default() -> Self {
        Self {
            page_size: 256,
            max_segments: 8,
            pages_per_segment: 256,
            batch_n: 25,
        }
    }
}

/// Tuning for the adaptive-send controller, spec §4.6.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveConfig {
    pub max_wait_ns: u64,
    pub initial_max_num_waits: u32,
    /// How often the periodic adjustment (spec §4.6 "Adjustment") runs per
    /// peer. The original source defines the adjustment step but never
    /// calls it; this crate drives it from a dedicated thread on this
    /// interval (see `Transport::new`).
    pub stats_window: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_wait_ns: Duration::from_micros(200).as_nanos() as u64,
            initial_max_num_waits: 1,
            stats_window: Duration::from_millis(50),
        }
    }
}

/// The full configuration snapshot consumed by `Transport::new`.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub own_node_id: u8,
    pub cluster_id: u8,
    pub peers: Vec<PeerConfig>,
    pub receive_pool: PoolConfig,
    pub signal_pool: PoolConfig,
    pub adaptive: AdaptiveConfig,
    pub num_receive_threads: usize,
    pub mailbox_overload_pages: usize,
    /// Server-side TLS config used for every incoming link, already built by
    /// the caller. Cert handling is out of scope for this crate.
    #[cfg(feature = "tls")]
    pub tls_server: Option<std::sync::Arc<rustls::ServerConfig>>,
}
