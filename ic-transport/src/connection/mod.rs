//! Byte-level TCP connection: active (connecting) or passive
//! (listening/accepting), with optional TLS layered on top (spec §4.2).
//!
//! Grounded on `examples/original_source/include/ic_connection.h` and
//! `comm/socket_conn.c`: a state machine (unconnected/connecting/
//! connected/closed/failed), independent read/write/connect mutexes so the
//! send and receive paths never serialize on each other, and the
//! client-address filtering used on accept.

pub mod stats;
#[cfg(feature = "tls")]
pub mod tls;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, TcpKeepalive, Type};

use crate::config::SocketTunables;
use crate::error::{Error, Result};
use crate::threadpool::ThreadPool;
use stats::ConnectionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconnected,
    Connecting,
    Connected,
    Closed,
    Failed,
}

/// Where a client should bind before connecting, and/or who a server
/// should only accept from.
#[derive(Debug, Clone, Default)]
pub struct EndpointFilter {
    pub client_name: Option<String>,
    pub client_port: Option<u16>,
}

/// Blocking connect, or hand the connect off to the thread pool and poll
/// `Connection::state()` — `original_source/include/ic_connection.h`'s
/// `is_connect_thread_used`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Blocking,
    Background,
}

pub struct ListenConfig {
    pub backlog: i32,
    pub retain_listener_on_accept: bool,
}

/// The underlying byte channel: plain TCP, or (with the `tls` feature) a
/// TLS session layered immediately post-connect/accept (spec §4.2). Both
/// `read` and `write` hold a `Channel`; for `Tls` they share the same
/// `TlsConnection`, which serializes the two sides under its own mutex.
enum Channel {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Arc<tls::TlsConnection>),
}

/// One TCP endpoint. Read, write, and connect state are independently
/// mutex-protected so the send and receive paths never block on each other.
pub struct Connection {
    state: Mutex<State>,
    read: Mutex<Option<Channel>>,
    write: Mutex<Option<Channel>>,
    connect: Mutex<()>,
    listener: Mutex<Option<TcpListener>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    tunables: SocketTunables,
    filter: EndpointFilter,
    stats: ConnectionStats,
    failed: AtomicBool,
    /// A clone of the connected stream kept outside the read/write mutexes
    /// so `close()` can shut the socket down (and unblock a thread parked in
    /// a blocking `read`) without waiting on a lock that blocked thread is
    /// holding for the duration of its syscall.
    shutdown_handle: Mutex<Option<TcpStream>>,
}

impl Connection {
    fn new(tunables: SocketTunables, filter: EndpointFilter) -> Self {
        Self {
            state: Mutex::new(State::Unconnected),
            read: Mutex::new(None),
            write: Mutex::new(None),
            connect: Mutex::new(()),
            listener: Mutex::new(None),
            peer_addr: Mutex::new(None),
            tunables,
            filter,
            stats: ConnectionStats::default(),
            failed: AtomicBool::new(false),
            shutdown_handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// The peer address this connection is talking to, once connected or
    /// accepted. Used to tell apart peers that share one listening port
    /// (spec §4.2 listener retention).
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().unwrap()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Grabs all three path mutexes in a fixed order (read, write, connect)
    /// so a concurrent send/receive can't interleave with a stats read,
    /// then copies out a consistent snapshot (spec §4.2).
    pub fn stats_snapshot(&self) -> stats::StatsSnapshot {
        let _r = self.read.lock().unwrap();
        let _w = self.write.lock().unwrap();
        let _c = self.connect.lock().unwrap();
        self.stats.snapshot()
    }

    fn apply_socket_options(socket: &Socket, tunables: &SocketTunables) -> Result<()> {
        socket.set_nodelay(true)?;
        socket.set_reuse_address(true)?;
        if tunables.socket_kernel_read_buffer_size > 0 {
            socket.set_recv_buffer_size(tunables.socket_kernel_read_buffer_size as usize)?;
        }
        if tunables.socket_kernel_write_buffer_size > 0 {
            socket.set_send_buffer_size(tunables.socket_kernel_write_buffer_size as usize)?;
        }
        #[cfg(target_os = "linux")]
        if tunables.tcp_maxseg_size > 0 {
            let _ = socket.set_mss(tunables.tcp_maxseg_size);
        }
        // SIGPIPE suppression: on BSD/macOS SO_NOSIGPIPE is the socket
        // option, applied here. On Linux the Rust runtime already sets
        // SIGPIPE to SIG_IGN at process start, so there's nothing to set
        // per-send.
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        {
            let _ = socket.set_nosigpipe(true);
        }
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
        let _ = socket.set_tcp_keepalive(&keepalive);
        Ok(())
    }

    /// Active role: connect out to `addr`. `ConnectMode::Background` hands
    /// the connect off to `thread_pool` and returns immediately with the
    /// connection in `State::Connecting`; the caller polls `state()` for
    /// `Connected`/`Failed`. Returns an `Arc` so the worker thread and the
    /// caller observe the same state through the same handle.
    pub fn connect_active(
        addr: SocketAddr,
        tunables: SocketTunables,
        mode: ConnectMode,
        thread_pool: Option<&ThreadPool>,
    ) -> Result<Arc<Self>> {
        let conn = Arc::new(Self::new(tunables, EndpointFilter::default()));
        *conn.state.lock().unwrap() = State::Connecting;
        match mode {
            ConnectMode::Blocking => conn.do_connect(addr)?,
            ConnectMode::Background => {
                let pool = thread_pool.ok_or(Error::ProtocolError(
                    "ConnectMode::Background requires a thread pool",
                ))?;
                let worker_conn = conn.clone();
                pool.spawn(format!("ic-connect-{addr}"), move || {
                    if worker_conn.do_connect(addr).is_err() {
                        worker_conn.failed.store(true, Ordering::Release);
                        *worker_conn.state.lock().unwrap() = State::Failed;
                    }
                })?;
            }
        }
        Ok(conn)
    }

    fn do_connect(&self, addr: SocketAddr) -> Result<()> {
        let _guard = self.connect.lock().unwrap();
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        Self::apply_socket_options(&socket, &self.tunables)?;
        socket.connect(&addr.into())?;
        let stream: TcpStream = socket.into();
        *self.peer_addr.lock().unwrap() = Some(addr);
        *self.shutdown_handle.lock().unwrap() = Some(stream.try_clone()?);
        *self.read.lock().unwrap() = Some(Channel::Plain(stream.try_clone()?));
        *self.write.lock().unwrap() = Some(Channel::Plain(stream));
        *self.state.lock().unwrap() = State::Connected;
        tracing::info!(?addr, "connection established (active)");
        Ok(())
    }

    /// Wrap an already-accepted `std::net::TcpStream` as a connected
    /// `Connection`. Used by callers (tests, and any listener driven outside
    /// this module's own `accept`) that obtained the stream some other way.
    pub fn from_accepted_stream(stream: TcpStream, tunables: SocketTunables) -> Result<Self> {
        let conn = Self::new(tunables, EndpointFilter::default());
        let peer = stream.peer_addr().ok();
        let socket = Socket::from(stream);
        Self::apply_socket_options(&socket, &tunables)?;
        let stream: TcpStream = socket.into();
        *conn.peer_addr.lock().unwrap() = peer;
        *conn.shutdown_handle.lock().unwrap() = Some(stream.try_clone()?);
        *conn.read.lock().unwrap() = Some(Channel::Plain(stream.try_clone()?));
        *conn.write.lock().unwrap() = Some(Channel::Plain(stream));
        *conn.state.lock().unwrap() = State::Connected;
        Ok(conn)
    }

    /// Passive role: bind and listen.
    pub fn listen(
        bind_addr: SocketAddr,
        tunables: SocketTunables,
        filter: EndpointFilter,
        listen_cfg: ListenConfig,
    ) -> Result<Self> {
        let conn = Self::new(tunables, filter);
        let domain = if bind_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        socket.listen(listen_cfg.backlog)?;
        *conn.listener.lock().unwrap() = Some(socket.into());
        *conn.state.lock().unwrap() = State::Connecting;
        Ok(conn)
    }

    /// Accept one connection. On success the accepted peer becomes `self`'s
    /// connected state; if the listen config retains the listener, it stays
    /// usable for further `accept` calls from the same `Connection`.
    pub fn accept(&self) -> Result<()> {
        let listener_guard = self.listener.lock().unwrap();
        let listener = listener_guard.as_ref().ok_or(Error::NodeDown)?;
        let (stream, peer) = listener.accept()?;
        drop(listener_guard);

        if let Some(name) = &self.filter.client_name {
            if peer.ip().to_string() != *name {
                return Err(Error::Disallowed);
            }
        }
        if let Some(port) = self.filter.client_port {
            if peer.port() != port {
                return Err(Error::Disallowed);
            }
        }

        let socket = Socket::from(stream);
        Self::apply_socket_options(&socket, &self.tunables)?;
        let stream: TcpStream = socket.into();
        *self.peer_addr.lock().unwrap() = Some(peer);
        *self.shutdown_handle.lock().unwrap() = Some(stream.try_clone()?);
        *self.read.lock().unwrap() = Some(Channel::Plain(stream.try_clone()?));
        *self.write.lock().unwrap() = Some(Channel::Plain(stream));
        *self.state.lock().unwrap() = State::Connected;
        tracing::info!(%peer, "connection accepted (passive)");
        Ok(())
    }

    /// Fork a fresh `Connection` for an accepted peer while `self` keeps
    /// listening, mirroring `ic_fork_accept_connection`.
    pub fn fork_accept(&self) -> Result<Self> {
        let forked = Self::new(self.tunables, self.filter.clone());
        let listener_guard = self.listener.lock().unwrap();
        let listener = listener_guard.as_ref().ok_or(Error::NodeDown)?;
        let (stream, peer) = listener.accept()?;
        drop(listener_guard);

        if let Some(name) = &self.filter.client_name {
            if peer.ip().to_string() != *name {
                return Err(Error::Disallowed);
            }
        }
        if let Some(port) = self.filter.client_port {
            if peer.port() != port {
                return Err(Error::Disallowed);
            }
        }

        let socket = Socket::from(stream);
        Self::apply_socket_options(&socket, &forked.tunables)?;
        let stream: TcpStream = socket.into();
        *forked.peer_addr.lock().unwrap() = Some(peer);
        *forked.shutdown_handle.lock().unwrap() = Some(stream.try_clone()?);
        *forked.read.lock().unwrap() = Some(Channel::Plain(stream.try_clone()?));
        *forked.write.lock().unwrap() = Some(Channel::Plain(stream));
        *forked.state.lock().unwrap() = State::Connected;
        Ok(forked)
    }

    /// Upgrades an already-connected plain channel to a TLS client session,
    /// consuming a caller-supplied `rustls::ClientConfig` (cert handling is
    /// out of scope here, spec §4.2).
    #[cfg(feature = "tls")]
    pub fn upgrade_to_tls_client(
        &self,
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<()> {
        let stream = self.take_plain_stream()?;
        let conn = Arc::new(tls::TlsConnection::connect(stream, config, server_name)?);
        *self.read.lock().unwrap() = Some(Channel::Tls(conn.clone()));
        *self.write.lock().unwrap() = Some(Channel::Tls(conn));
        Ok(())
    }

    /// Server-side counterpart of `upgrade_to_tls_client`.
    #[cfg(feature = "tls")]
    pub fn upgrade_to_tls_server(&self, config: Arc<rustls::ServerConfig>) -> Result<()> {
        let stream = self.take_plain_stream()?;
        let conn = Arc::new(tls::TlsConnection::accept(stream, config)?);
        *self.read.lock().unwrap() = Some(Channel::Tls(conn.clone()));
        *self.write.lock().unwrap() = Some(Channel::Tls(conn));
        Ok(())
    }

    /// Reclaims the write-side plain stream for a TLS upgrade and drops the
    /// read-side duplicate fd; `shutdown_handle` stays valid since it's an
    /// independent clone of the same socket.
    #[cfg(feature = "tls")]
    fn take_plain_stream(&self) -> Result<TcpStream> {
        let mut write_guard = self.write.lock().unwrap();
        let stream = match write_guard.take() {
            Some(Channel::Plain(stream)) => stream,
            Some(other) => {
                *write_guard = Some(other);
                return Err(Error::ProtocolError("connection already upgraded to tls"));
            }
            None => return Err(Error::NodeDown),
        };
        *self.read.lock().unwrap() = None;
        Ok(stream)
    }

    pub fn raw_read_fd(&self) -> Option<i32> {
        use std::os::unix::io::AsRawFd;
        match self.read.lock().unwrap().as_ref() {
            Some(Channel::Plain(stream)) => Some(stream.as_raw_fd()),
            #[cfg(feature = "tls")]
            Some(Channel::Tls(_)) => None,
            None => None,
        }
    }

    /// Blocking read, EINTR retried, reports `Error::EndOfFile` on a clean
    /// close.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.read.lock().unwrap();
        let channel = guard.as_mut().ok_or(Error::NodeDown)?;
        match channel {
            Channel::Plain(stream) => loop {
                match stream.read(buf) {
                    Ok(0) => {
                        self.stats.record_receive_error();
                        return Err(Error::EndOfFile);
                    }
                    Ok(n) => {
                        self.stats.record_receive(n);
                        return Ok(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.stats.record_receive_error();
                        return Err(Error::from(e));
                    }
                }
            },
            #[cfg(feature = "tls")]
            Channel::Tls(conn) => match conn.read(buf) {
                Ok(n) => {
                    self.stats.record_receive(n);
                    Ok(n)
                }
                Err(e) => {
                    self.stats.record_receive_error();
                    Err(e)
                }
            },
        }
    }

    /// All-or-error vectored write with a seconds-to-try deadline. On
    /// timeout returns `Error::Timeout { sent }` with however many bytes
    /// actually made it out. Advances past fully-written leading buffers and
    /// re-slices a partially-written one so a retried `writev` never resends
    /// bytes the kernel already accepted, without copying the payload.
    pub fn write_vectored_all(&self, bufs: &[&[u8]], deadline: Duration) -> Result<usize> {
        let mut guard = self.write.lock().unwrap();
        let channel = guard.as_mut().ok_or(Error::NodeDown)?;
        match channel {
            Channel::Plain(stream) => self.write_vectored_plain(stream, bufs, deadline),
            #[cfg(feature = "tls")]
            Channel::Tls(conn) => {
                let combined: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
                match conn.write_all(&combined, deadline) {
                    Ok(n) => {
                        self.stats.record_send(n);
                        Ok(n)
                    }
                    Err(e) => {
                        self.stats.record_send_error();
                        self.failed.store(true, Ordering::Release);
                        Err(e)
                    }
                }
            }
        }
    }

    fn write_vectored_plain(&self, stream: &mut TcpStream, bufs: &[&[u8]], deadline: Duration) -> Result<usize> {
        let start = Instant::now();
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut sent_total = 0usize;
        let mut remaining: Vec<&[u8]> = bufs.to_vec();

        while sent_total < total {
            if start.elapsed() >= deadline {
                self.stats.record_send_timeout();
                return Err(Error::Timeout { sent: sent_total });
            }
            remaining.retain(|b| !b.is_empty());
            if remaining.is_empty() {
                break;
            }
            let slices: Vec<io::IoSlice> = remaining.iter().map(|b| io::IoSlice::new(b)).collect();
            match stream.write_vectored(&slices) {
                Ok(0) => {
                    self.stats.record_send_error();
                    return Err(Error::IoError(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(mut n) => {
                    sent_total += n;
                    while n > 0 {
                        if n >= remaining[0].len() {
                            n -= remaining[0].len();
                            remaining.remove(0);
                        } else {
                            remaining[0] = &remaining[0][n..];
                            n = 0;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stats.record_send_error();
                    self.failed.store(true, Ordering::Release);
                    return Err(Error::from(e));
                }
            }
        }
        self.stats.record_send(sent_total);
        Ok(sent_total)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Shuts the socket down first so a thread parked in a blocking `read`
    /// or `write_vectored` wakes up with an error and releases its mutex,
    /// then clears the guarded handles. Shutting down through
    /// `shutdown_handle` (rather than locking `read`/`write` directly) is
    /// what makes this safe to call while another thread holds one of
    /// those locks for the duration of a blocking syscall.
    pub fn close(&self) {
        if let Some(stream) = self.shutdown_handle.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        *self.read.lock().unwrap() = None;
        *self.write.lock().unwrap() = None;
        *self.state.lock().unwrap() = State::Closed;
    }

    pub fn close_listener(&self) {
        *self.listener.lock().unwrap() = None;
    }
}
