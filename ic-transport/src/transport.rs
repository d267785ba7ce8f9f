//! Public facade: the three operations application code calls, plus the
//! constructor that wires up the pools, directory, and threads (spec §6
//! "Internal interfaces to collaborators").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{ClusterConfig, PeerConfig};
use crate::connection::{ConnectMode, Connection, EndpointFilter, ListenConfig};
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::mailbox::AppInbox;
use crate::node::Peer;
use crate::pool::{PageHandle, Pool};
use crate::recv::{self, RecvPeer};
use crate::send::SendPeer;
use crate::signal::SignalChain;
use crate::threadpool::ThreadPool;
use crate::wire::ByteOrderKind;

/// The transport: owns the directory, both page pools, the thread pool, and
/// every application thread's mailbox. `Drop` runs the shutdown sequence
/// from spec §4.7's final paragraph.
pub struct Transport {
    directory: Directory,
    receive_pool: Pool,
    signal_pool: Pool,
    mailboxes: Arc<Mutex<HashMap<u32, Arc<AppInbox>>>>,
    threads: ThreadPool,
    config: ClusterConfig,
    shutting_down: Arc<AtomicBool>,
}

impl Transport {
    /// Loads the configuration snapshot, builds the two page pools, and
    /// establishes every configured peer link. Whichever side has the
    /// numerically smaller node id listens; the other connects — the
    /// cluster config doesn't single out a listener, so this is this
    /// crate's resolution (recorded in DESIGN.md), applied symmetrically by
    /// both nodes in a link.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let receive_pool = Pool::new(config.receive_pool)?;
        let signal_pool = Pool::new(config.signal_pool)?;
        let threads = ThreadPool::new(config.num_receive_threads * 2 + config.peers.len() * 2 + 4);
        let mut directory = Directory::new();
        let mut connections = establish_connections(&config)?;

        for peer_cfg in &config.peers {
            let connection = connections
                .remove(&(peer_cfg.cluster_id, peer_cfg.node_id))
                .expect("establish_connections produces one entry per configured peer");
            let byte_order = negotiate_byte_order(&connection)?;
            let node_up = Arc::new(AtomicBool::new(true));

            let send = SendPeer::new(
                connection.clone(),
                node_up.clone(),
                config.adaptive.max_wait_ns,
                config.adaptive.initial_max_num_waits,
                Duration::from_nanos(peer_cfg.tunables.socket_max_wait_in_nanos),
            );
            let recv_peer = RecvPeer::new(receive_pool.clone(), signal_pool.clone(), byte_order);
            let peer = Arc::new(Peer::new(
                peer_cfg.cluster_id,
                peer_cfg.node_id,
                connection,
                send,
                recv_peer,
                node_up,
            ));
            directory.insert(peer_cfg.cluster_id, peer_cfg.node_id, peer.clone());

            let helper_peer = peer.clone();
            threads.spawn(format!("ic-send-{}-{}", peer_cfg.cluster_id, peer_cfg.node_id), move || {
                helper_peer.send.helper_loop();
            })?;
        }

        let peers: Vec<Arc<Peer>> = directory.iter().cloned().collect();
        let shutting_down = Arc::new(AtomicBool::new(false));
        let stats_window = config.adaptive.stats_window;
        let adjust_peers = peers.clone();
        let adjust_stop = shutting_down.clone();
        threads.spawn("ic-adaptive-adjust", move || loop {
            std::thread::sleep(stats_window);
            if adjust_stop.load(Ordering::Acquire) {
                return;
            }
            for peer in &adjust_peers {
                peer.send.adjust_adaptive();
            }
        })?;

        let transport = Self {
            directory,
            receive_pool,
            signal_pool,
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            threads,
            config,
            shutting_down,
        };

        for peer in &peers {
            transport.spawn_receive_thread(peer.clone())?;
        }

        Ok(transport)
    }

    fn spawn_receive_thread(&self, peer: Arc<Peer>) -> Result<()> {
        let mailboxes = self.mailboxes.clone();
        let overload_threshold = self.config.mailbox_overload_pages;
        self.threads.spawn(format!("ic-recv-{}-{}", peer.cluster_id, peer.node_id), move || {
            loop {
                if !peer.is_up() {
                    return;
                }
                let mut local = crate::pool::LocalPageCache::new();
                let pumped = {
                    let mut recv_peer = peer.recv.lock().unwrap();
                    recv_peer.pump(&peer.connection, &mut local)
                };
                match pumped {
                    Ok(chain) => dispatch(&mailboxes, overload_threshold, chain),
                    Err(Error::EndOfFile) | Err(Error::NodeDown) => {
                        peer.fail("receive path closed");
                        return;
                    }
                    Err(Error::ProtocolError(msg)) => {
                        tracing::error!(msg, "protocol error on receive path, closing connection");
                        peer.fail(msg);
                        return;
                    }
                    Err(_) => {
                        peer.fail("receive io error");
                        return;
                    }
                }
            }
        })
    }

    fn mailbox(&self, thread_id: u32) -> Arc<AppInbox> {
        let mut map = self.mailboxes.lock().unwrap();
        map.entry(thread_id)
            .or_insert_with(|| Arc::new(AppInbox::new(self.config.mailbox_overload_pages)))
            .clone()
    }

    /// `send(cluster_id, node_id, page_chain, force)`, spec §6.
    pub fn send(&self, cluster_id: u8, node_id: u8, page_chain: Vec<PageHandle>, force: bool) -> Result<()> {
        let peer = self
            .directory
            .get(cluster_id, node_id)
            .ok_or(Error::NodeDown)?;
        peer.send.send(page_chain, force)
    }

    /// `poll_inbox(thread_id, timeout) -> signal_chain`, spec §6.
    pub fn poll_inbox(&self, thread_id: u32, timeout: Duration) -> SignalChain {
        self.mailbox(thread_id).poll(timeout)
    }

    /// `return_page(page)`, spec §6: releasing the handle returns it to its
    /// pool the moment its refcount reaches zero.
    pub fn return_page(&self, page: PageHandle) {
        drop(page);
    }

    pub fn receive_pool(&self) -> &Pool {
        &self.receive_pool
    }

    pub fn signal_pool(&self) -> &Pool {
        &self.signal_pool
    }
}

/// Establishes every configured peer link: whichever side has the
/// numerically smaller node id listens, the other connects — the cluster
/// config doesn't single out a listener, so this is this crate's
/// resolution (recorded in DESIGN.md), applied symmetrically by both nodes
/// in a link. Peers that share one listening port are told apart by
/// `client_address` via a retained, forked listener (spec §4.2 listener
/// retention); a port used by exactly one peer keeps today's dedicated,
/// single-accept listener.
fn establish_connections(config: &ClusterConfig) -> Result<HashMap<(u8, u8), Arc<Connection>>> {
    let mut connections = HashMap::new();

    let mut listen_groups: HashMap<u16, Vec<&PeerConfig>> = HashMap::new();
    for peer_cfg in &config.peers {
        if config.own_node_id < peer_cfg.node_id {
            listen_groups.entry(peer_cfg.server_port).or_default().push(peer_cfg);
        }
    }

    for (port, members) in listen_groups {
        if members.len() == 1 {
            let peer_cfg = members[0];
            let listen_cfg = ListenConfig {
                backlog: peer_cfg.backlog,
                retain_listener_on_accept: false,
            };
            let filter = EndpointFilter {
                client_name: peer_cfg.client_address.map(|a| a.ip().to_string()),
                client_port: peer_cfg.client_address.map(|a| a.port()),
            };
            let bind_addr = format!("0.0.0.0:{port}").parse().unwrap();
            let listener = Connection::listen(bind_addr, peer_cfg.tunables, filter, listen_cfg)?;
            listener.accept()?;
            #[cfg(feature = "tls")]
            if let Some(tls_cfg) = &config.tls_server {
                listener.upgrade_to_tls_server(tls_cfg.clone())?;
            }
            connections.insert((peer_cfg.cluster_id, peer_cfg.node_id), Arc::new(listener));
        } else {
            for peer_cfg in &members {
                if peer_cfg.client_address.is_none() {
                    return Err(Error::ProtocolError(
                        "peers sharing a listening port need client_address set to be told apart",
                    ));
                }
            }
            let listen_cfg = ListenConfig {
                backlog: members[0].backlog,
                retain_listener_on_accept: true,
            };
            let bind_addr = format!("0.0.0.0:{port}").parse().unwrap();
            let shared_listener =
                Connection::listen(bind_addr, members[0].tunables, EndpointFilter::default(), listen_cfg)?;
            for _ in 0..members.len() {
                let forked = shared_listener.fork_accept()?;
                #[cfg(feature = "tls")]
                if let Some(tls_cfg) = &config.tls_server {
                    forked.upgrade_to_tls_server(tls_cfg.clone())?;
                }
                let peer_ip = forked
                    .peer_addr()
                    .ok_or(Error::ProtocolError("forked connection missing peer address"))?
                    .ip();
                let peer_cfg = members
                    .iter()
                    .find(|p| p.client_address.map(|a| a.ip()) == Some(peer_ip))
                    .ok_or(Error::ProtocolError("accepted peer did not match any configured client_address"))?;
                connections.insert((peer_cfg.cluster_id, peer_cfg.node_id), Arc::new(forked));
            }
            shared_listener.close_listener();
        }
    }

    for peer_cfg in &config.peers {
        if config.own_node_id < peer_cfg.node_id {
            continue;
        }
        let addr = format!("{}:{}", peer_cfg.hostname, peer_cfg.server_port)
            .parse()
            .map_err(|_| Error::ProtocolError("invalid peer hostname:port"))?;
        let connection = Connection::connect_active(addr, peer_cfg.tunables, ConnectMode::Blocking, None)?;
        #[cfg(feature = "tls")]
        if let Some(tls_cfg) = &peer_cfg.tls_client {
            let server_name = rustls::pki_types::ServerName::try_from(peer_cfg.hostname.clone())
                .map_err(|_| Error::ProtocolError("invalid tls server name"))?;
            connection.upgrade_to_tls_client(tls_cfg.clone(), server_name)?;
        }
        connections.insert((peer_cfg.cluster_id, peer_cfg.node_id), connection);
    }

    Ok(connections)
}

/// Exchanges a magic `u32` with the peer immediately after the connection
/// is established to detect whether its native byte order differs from
/// ours (spec §6). TCP is full-duplex, so a blocking write followed by a
/// blocking read of the same size never deadlocks against a peer running
/// the identical exchange.
fn negotiate_byte_order(connection: &Connection) -> Result<ByteOrderKind> {
    const MAGIC: u32 = 0x4944_4253;
    connection.write_vectored_all(&[&MAGIC.to_ne_bytes()], Duration::from_secs(5))?;
    let mut buf = [0u8; 4];
    let mut read = 0;
    while read < buf.len() {
        read += connection.read(&mut buf[read..])?;
    }
    match u32::from_ne_bytes(buf) {
        m if m == MAGIC => Ok(ByteOrderKind::Native),
        m if m == MAGIC.swap_bytes() => Ok(ByteOrderKind::Swapped),
        _ => Err(Error::ProtocolError("byte-order handshake magic mismatch")),
    }
}

fn dispatch(mailboxes: &Mutex<HashMap<u32, Arc<AppInbox>>>, overload_threshold: usize, chain: SignalChain) {
    let mut by_dest: HashMap<u32, SignalChain> = HashMap::new();
    for signal in chain {
        by_dest.entry(signal.header.receiver_module).or_default().push(signal);
    }
    let mut map = mailboxes.lock().unwrap();
    for (dest, signals) in by_dest {
        let inbox = map
            .entry(dest)
            .or_insert_with(|| Arc::new(AppInbox::new(overload_threshold)))
            .clone();
        drop(map);
        recv::post(&inbox, signals);
        map = mailboxes.lock().unwrap();
    }
}

impl Drop for Transport {
    /// Shutdown, spec §4.7 final paragraph: stop every peer, join every
    /// thread, let the pools drop with them.
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        for peer in self.directory.iter() {
            peer.shutdown();
        }
        self.threads.join_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdaptiveConfig, PoolConfig, SocketTunables};
    use std::net::{IpAddr, SocketAddr, TcpListener};

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn peer_config(node_id: u8, port: u16, client_address: Option<SocketAddr>) -> PeerConfig {
        PeerConfig {
            cluster_id: 1,
            node_id,
            first_node_id: 1.min(node_id),
            second_node_id: 1.max(node_id),
            hostname: "127.0.0.1".to_string(),
            server_port: port,
            client_address,
            tunables: SocketTunables::lan(),
            use_checksum: false,
            use_message_id: false,
            backlog: 16,
            #[cfg(feature = "tls")]
            tls_client: None,
        }
    }

    fn connect_from(addr: SocketAddr, bind_ip: IpAddr) -> std::net::TcpStream {
        use socket2::{Domain, Socket, Type};
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        socket.bind(&SocketAddr::new(bind_ip, 0).into()).unwrap();
        socket.connect(&addr.into()).unwrap();
        socket.into()
    }

    #[test]
    fn byte_order_handshake_agrees_on_native_for_same_machine_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_thread = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let conn = Connection::from_accepted_stream(stream, SocketTunables::lan()).unwrap();
            negotiate_byte_order(&conn).unwrap()
        });
        let client = Connection::connect_active(addr, SocketTunables::lan(), ConnectMode::Blocking, None).unwrap();
        let client_order = negotiate_byte_order(&client).unwrap();
        let server_order = server_thread.join().unwrap();
        assert_eq!(client_order, ByteOrderKind::Native);
        assert_eq!(server_order, ByteOrderKind::Native);
    }

    #[test]
    fn two_peers_sharing_one_port_are_told_apart_by_client_address() {
        let port = free_port();

        let server_cfg = ClusterConfig {
            own_node_id: 1,
            cluster_id: 1,
            peers: vec![
                peer_config(2, port, Some("127.0.0.2:0".parse().unwrap())),
                peer_config(3, port, Some("127.0.0.3:0".parse().unwrap())),
            ],
            receive_pool: PoolConfig { page_size: 256, max_segments: 2, pages_per_segment: 2, batch_n: 1 },
            signal_pool: PoolConfig { page_size: 256, max_segments: 2, pages_per_segment: 2, batch_n: 1 },
            adaptive: AdaptiveConfig::default(),
            num_receive_threads: 1,
            mailbox_overload_pages: 100,
            #[cfg(feature = "tls")]
            tls_server: None,
        };

        let server_thread = std::thread::spawn(move || establish_connections(&server_cfg).unwrap());
        std::thread::sleep(Duration::from_millis(50));

        let target: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let stream_3 = connect_from(target, "127.0.0.3".parse().unwrap());
        let stream_2 = connect_from(target, "127.0.0.2".parse().unwrap());

        let connections = server_thread.join().unwrap();
        assert!(connections.contains_key(&(1, 2)));
        assert!(connections.contains_key(&(1, 3)));
        drop(stream_2);
        drop(stream_3);
    }
}
