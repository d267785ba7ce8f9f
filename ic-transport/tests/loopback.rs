//! End-to-end loopback test: two `Transport`s connected over real TCP,
//! exercising the single-signal round-trip law from spec §8.

use std::time::Duration;

use ic_transport::config::{AdaptiveConfig, ClusterConfig, PeerConfig, PoolConfig, SocketTunables};
use ic_transport::wire::{Header, Priority, MIN_HEADER_SIZE, WORD_SIZE};
use ic_transport::Transport;

const MAILBOX_ID: u32 = 32768;

fn cluster_config(own_node_id: u8, peer_node_id: u8, port: u16) -> ClusterConfig {
    ClusterConfig {
        own_node_id,
        cluster_id: 1,
        peers: vec![PeerConfig {
            cluster_id: 1,
            node_id: peer_node_id,
            first_node_id: own_node_id.min(peer_node_id),
            second_node_id: own_node_id.max(peer_node_id),
            hostname: "127.0.0.1".to_string(),
            server_port: port,
            client_address: None,
            tunables: SocketTunables::lan(),
            use_checksum: false,
            use_message_id: false,
            backlog: 16,
            #[cfg(feature = "tls")]
            tls_client: None,
        }],
        receive_pool: PoolConfig {
            page_size: 4096,
            max_segments: 4,
            pages_per_segment: 8,
            batch_n: 4,
        },
        signal_pool: PoolConfig {
            page_size: 256,
            max_segments: 4,
            pages_per_segment: 16,
            batch_n: 4,
        },
        adaptive: AdaptiveConfig::default(),
        num_receive_threads: 1,
        mailbox_overload_pages: 1000,
        #[cfg(feature = "tls")]
        tls_server: None,
    }
}

fn encode_signal(payload: &[u8]) -> Vec<u8> {
    let total_words = (MIN_HEADER_SIZE + payload.len()).div_ceil(WORD_SIZE);
    let mut buf = vec![0u8; total_words * WORD_SIZE];
    let header = Header {
        length_words: total_words as u32,
        signal_number: 7,
        priority: Priority::Normal,
        num_segments: 0,
        sender_module: 1,
        receiver_module: MAILBOX_ID,
    };
    header.encode(&mut buf[..MIN_HEADER_SIZE]);
    buf[MIN_HEADER_SIZE..MIN_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    buf
}

#[test]
fn single_signal_round_trip_over_real_tcp() {
    let port = free_port();
    // node 1 listens (smaller node id), node 2 connects.
    let server_cfg = cluster_config(1, 2, port);
    let client_cfg = cluster_config(2, 1, port);

    let server_handle = std::thread::spawn(move || Transport::new(server_cfg).unwrap());
    std::thread::sleep(Duration::from_millis(50));
    let client = Transport::new(client_cfg).unwrap();
    let server = server_handle.join().unwrap();

    let payload = b"round trip payload, sixty four bytes long for the assertion!!!!!".to_vec();
    let wire = encode_signal(&payload);

    let mut local = ic_transport::pool::LocalPageCache::new();
    let mut page = client.signal_pool().acquire(&mut local, 4).unwrap();
    page.as_mut_slice()[..wire.len()].copy_from_slice(&wire);
    page.set_len(wire.len());

    client.send(1, 1, vec![page], true).unwrap();

    let chain = server.poll_inbox(MAILBOX_ID, Duration::from_secs(2));
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].main_bytes(), &payload[..]);

    // The signal shares a page out of the server's *receive* pool
    // (zero-copy dispatch), not its signal-descriptor pool.
    let free_before = server.receive_pool().free_count();
    drop(chain);
    assert!(server.receive_pool().free_count() > free_before);
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
