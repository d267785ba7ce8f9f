//! Per-peer failure model and shutdown coordination (spec §4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::recv::RecvPeer;
use crate::send::SendPeer;

/// One (cluster_id, node_id) peer: the connection plus its independent send
/// and receive state, and the shared `node_up` flag both sides observe.
pub struct Peer {
    pub cluster_id: u8,
    pub node_id: u8,
    pub connection: Arc<Connection>,
    pub send: SendPeer,
    pub recv: Mutex<RecvPeer>,
    node_up: Arc<AtomicBool>,
}

impl Peer {
    pub fn new(
        cluster_id: u8,
        node_id: u8,
        connection: Arc<Connection>,
        send: SendPeer,
        recv: RecvPeer,
        node_up: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cluster_id,
            node_id,
            connection,
            send,
            recv: Mutex::new(recv),
            node_up,
        }
    }

    pub fn is_up(&self) -> bool {
        self.node_up.load(Ordering::Acquire)
    }

    /// Node failure handling, spec §4.7 steps 1-3 and 5. Idempotent: calling
    /// this on an already-down peer is a no-op beyond re-draining (which is
    /// itself a no-op on an empty queue).
    pub fn fail(&self, reason: &str) {
        let was_up = self.node_up.swap(false, Ordering::AcqRel);
        if was_up {
            tracing::warn!(cluster_id = self.cluster_id, node_id = self.node_id, reason, "peer marked down");
        }
        self.send.drain_outgoing();
        self.connection.close();
        // Step 3 (signal the helper thread so it observes `node_up = false`
        // and idles) happens implicitly: any helper thread already woken
        // for this peer re-checks `is_up()` before writing (send.rs).
        // Step 4 (mark in-flight mailbox holders) needs no separate action:
        // `SendPeer::send` already returns `Error::NodeDown` once
        // `node_up` is false, and holders can still drain/release pages
        // they already have.
    }

    /// Full shutdown: step 1 of the coordinator loop in spec §4.7's final
    /// paragraph, for one peer. The caller is responsible for joining the
    /// peer's helper and receive threads afterward (they own the
    /// `JoinHandle`s via the transport's `ThreadPool`).
    pub fn shutdown(&self) {
        self.node_up.store(false, Ordering::Release);
        self.send.request_stop();
        self.connection.close();
        self.connection.close_listener();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketTunables;
    use crate::connection::ConnectMode;
    use crate::pool::Pool;
    use crate::config::PoolConfig;
    use crate::wire::ByteOrderKind;
    use std::net::TcpListener;
    use std::time::Duration;

    fn make_peer() -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_thread = std::thread::spawn(move || listener.accept().unwrap().0);
        let connection = Connection::connect_active(addr, SocketTunables::lan(), ConnectMode::Blocking, None).unwrap();
        let _server = server_thread.join().unwrap();

        let node_up = Arc::new(AtomicBool::new(true));
        let send = SendPeer::new(connection.clone(), node_up.clone(), 1_000_000, 2, Duration::from_secs(2));
        let receive_pool = Pool::new(PoolConfig {
            page_size: 256,
            max_segments: 2,
            pages_per_segment: 2,
            batch_n: 1,
        })
        .unwrap();
        let signal_pool = receive_pool.clone();
        let recv = RecvPeer::new(receive_pool, signal_pool, ByteOrderKind::Native);
        Peer::new(1, 2, connection, send, recv, node_up)
    }

    #[test]
    fn fail_marks_peer_down_and_drains_queue() {
        let peer = make_peer();
        assert!(peer.is_up());
        peer.fail("simulated io error");
        assert!(!peer.is_up());
        assert_eq!(peer.send.queued_bytes(), 0);
        assert!(matches!(peer.send.send(Vec::new(), true), Err(crate::error::Error::NodeDown)));
    }
}
