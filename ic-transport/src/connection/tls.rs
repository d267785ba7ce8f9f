//! Optional TLS wrapper around a raw TCP stream, feature-gated behind
//! `tls`. Per spec §4.2: the handshake runs immediately after connect or
//! accept, and once active every read/write on the connection goes through
//! the TLS engine under a single mutex (TLS engines are not thread-safe,
//! unlike the plain-TCP path's independent read/write mutexes).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, StreamOwned};

use crate::error::{Error, Result};

enum Role {
    Client(StreamOwned<ClientConnection, TcpStream>),
    Server(StreamOwned<ServerConnection, TcpStream>),
}

/// A TLS-wrapped byte endpoint. Read and write share one mutex (unlike
/// `Connection`, which keeps them independent) because a `rustls`
/// connection's record layer is not safe to drive from two threads at once.
pub struct TlsConnection {
    stream: Mutex<Role>,
}

impl TlsConnection {
    pub fn connect(stream: TcpStream, config: Arc<ClientConfig>, server_name: rustls::pki_types::ServerName<'static>) -> Result<Self> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::ProtocolError(leak(format!("tls client setup: {e}"))))?;
        Ok(Self {
            stream: Mutex::new(Role::Client(StreamOwned::new(conn, stream))),
        })
    }

    pub fn accept(stream: TcpStream, config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::ProtocolError(leak(format!("tls server setup: {e}"))))?;
        Ok(Self {
            stream: Mutex::new(Role::Server(StreamOwned::new(conn, stream))),
        })
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.stream.lock().unwrap();
        let n = match &mut *guard {
            Role::Client(s) => s.read(buf),
            Role::Server(s) => s.read(buf),
        };
        match n {
            Ok(0) => Err(Error::EndOfFile),
            Ok(n) => Ok(n),
            Err(e) => Err(Error::from(e)),
        }
    }

    pub fn write_all(&self, buf: &[u8], deadline: Duration) -> Result<usize> {
        let start = Instant::now();
        let mut guard = self.stream.lock().unwrap();
        let result = match &mut *guard {
            Role::Client(s) => s.write_all(buf),
            Role::Server(s) => s.write_all(buf),
        };
        match result {
            Ok(()) => Ok(buf.len()),
            Err(_) if start.elapsed() >= deadline => Err(Error::Timeout { sent: 0 }),
            Err(e) => Err(Error::from(e)),
        }
    }
}

/// `rustls`'s error type borrows nothing useful past this call, and
/// `Error::ProtocolError` wants a `'static` message; this is the one spot
/// that needs an owned, leaked string rather than a literal.
fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leak_produces_a_static_str() {
        let s = leak("boom".to_string());
        assert_eq!(s, "boom");
    }
}
