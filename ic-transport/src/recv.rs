//! Receive engine: the per-connection chunking loop that turns a TCP byte
//! stream into a chain of zero-copy signal descriptors (spec §4.4).

use std::ops::Range;

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mailbox::AppInbox;
use crate::pool::{LocalPageCache, PageHandle, Pool};
use crate::signal::{SignalChain, SignalRef};
use crate::wire::{self, ByteOrderKind, Header, MIN_HEADER_SIZE};

/// Per-connection receive state: the in-flight page and how much of it is
/// filled, plus whether the next signal's header has already been parsed.
pub struct RecvPeer {
    receive_pool: Pool,
    signal_pool: Pool,
    byte_order: ByteOrderKind,
    in_flight: Option<PageHandle>,
    bytes_present: usize,
    read_offset: usize,
    pending_header: Option<Header>,
}

impl RecvPeer {
    pub fn new(receive_pool: Pool, signal_pool: Pool, byte_order: ByteOrderKind) -> Self {
        Self {
            receive_pool,
            signal_pool,
            byte_order,
            in_flight: None,
            bytes_present: 0,
            read_offset: 0,
            pending_header: None,
        }
    }

    /// The signal-descriptor pool backing this peer, for piggyback control
    /// buffers (spec §4.1's zero-page-size special case). Segment unpacking
    /// beyond the main message is not implemented: `original_source/`
    /// itself stubs out the segment bodies in `ndb_receive`, and no wire
    /// layout for segment lengths is pinned anywhere in the retrieved
    /// source, so `Header::num_segments` is parsed and carried on
    /// `SignalRef` but never split into extra ranges here.
    pub fn signal_pool(&self) -> &Pool {
        &self.signal_pool
    }

    /// One wake's worth of work on `connection`: read whatever is available,
    /// chunk it into signals, and return the chain produced (possibly
    /// empty). The caller is responsible for posting the chain to the
    /// destination mailboxes (`Connection::read` already reports
    /// `Error::EndOfFile` on clean close, which the caller should route to
    /// node failure handling, spec §4.4 "End of file").
    pub fn pump(&mut self, connection: &Connection, local: &mut LocalPageCache) -> Result<SignalChain> {
        if self.in_flight.is_none() {
            let page = self
                .receive_pool
                .acquire(local, PoolConfig::receive_default().batch_n)?;
            self.bytes_present = 0;
            self.read_offset = 0;
            self.in_flight = Some(page);
        }

        {
            let page = self.in_flight.as_mut().unwrap();
            let capacity = page.capacity();
            let space = capacity - self.bytes_present;
            if space == 0 {
                return Err(Error::ProtocolError("receive page full without a complete header"));
            }
            let n = {
                let buf = &mut page.as_mut_slice()[self.bytes_present..self.bytes_present + space];
                connection.read(buf)?
            };
            self.bytes_present += n;
            page.set_len(self.read_offset + self.bytes_present);
        }

        let mut chain = SignalChain::new();
        loop {
            if self.bytes_present < MIN_HEADER_SIZE {
                break;
            }
            if self.pending_header.is_none() {
                let page = self.in_flight.as_ref().unwrap();
                let slice = &page.as_slice()[self.read_offset..self.read_offset + MIN_HEADER_SIZE];
                let header = Header::decode(slice, self.byte_order).map_err(Error::ProtocolError)?;
                self.pending_header = Some(header);
            }
            let header = self.pending_header.unwrap();
            let signal_size = header.length_bytes();
            if signal_size > self.bytes_present {
                break;
            }

            if self.byte_order == ByteOrderKind::Swapped {
                let page = self.in_flight.as_mut().unwrap();
                let body_start = self.read_offset + MIN_HEADER_SIZE;
                let body_end = self.read_offset + signal_size;
                wire::swap_words_in_place(&mut page.as_mut_slice()[body_start..body_end]);
            }

            let page = self.in_flight.as_ref().unwrap();
            let shared = page.share();
            let main: Range<usize> = self.read_offset + MIN_HEADER_SIZE..self.read_offset + signal_size;
            chain.push(SignalRef::new(header, shared, main, [None, None, None]));

            self.read_offset += signal_size;
            self.bytes_present -= signal_size;
            self.pending_header = None;
        }

        if self.bytes_present > 0 {
            if !chain.is_empty() {
                let straggler_start = self.read_offset;
                let straggler_len = self.bytes_present;
                let old_page = self.in_flight.take().unwrap();
                let mut new_page = self
                    .receive_pool
                    .acquire(local, PoolConfig::receive_default().batch_n)?;
                new_page.as_mut_slice()[..straggler_len]
                    .copy_from_slice(&old_page.as_slice()[straggler_start..straggler_start + straggler_len]);
                new_page.set_len(straggler_len);
                drop(old_page);
                self.in_flight = Some(new_page);
                self.bytes_present = straggler_len;
                self.read_offset = 0;
            }
        } else {
            self.in_flight = None;
            self.read_offset = 0;
        }

        Ok(chain)
    }
}

/// Posting helper: splice a chain's signals onto `inbox`, taking the
/// mailbox's mutex exactly once regardless of chain length. Callers with
/// signals destined for more than one mailbox should partition `chain`
/// first and call this once per destination (spec §4.4 "Posting").
pub fn post(inbox: &AppInbox, chain: SignalChain) {
    if chain.is_empty() {
        return;
    }
    inbox.post(chain);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketTunables;
    use crate::connection::{ConnectMode, Connection};
    use crate::wire::{Priority, WORD_SIZE};
    use std::io::Write;
    use std::net::TcpListener;

    fn pools() -> (Pool, Pool) {
        let receive = Pool::new(PoolConfig {
            page_size: 256,
            max_segments: 4,
            pages_per_segment: 4,
            batch_n: 2,
        })
        .unwrap();
        let signal = Pool::new(PoolConfig {
            page_size: 64,
            max_segments: 4,
            pages_per_segment: 4,
            batch_n: 2,
        })
        .unwrap();
        (receive, signal)
    }

    fn encode_signal(payload: &[u8]) -> Vec<u8> {
        let total_words = (MIN_HEADER_SIZE + payload.len()).div_ceil(WORD_SIZE);
        let mut buf = vec![0u8; total_words * WORD_SIZE];
        let header = Header {
            length_words: total_words as u32,
            signal_number: 1,
            priority: Priority::Normal,
            num_segments: 0,
            sender_module: 1,
            receiver_module: 32768,
        };
        header.encode(&mut buf[..MIN_HEADER_SIZE]);
        buf[MIN_HEADER_SIZE..MIN_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        buf
    }

    #[test]
    fn single_signal_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let wire = encode_signal(b"hello world, 64 bytes of payload for the roundtrip case!!");
        let wire_for_send = wire.clone();
        let sender = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&wire_for_send).unwrap();
        });

        let client = Connection::connect_active(addr, SocketTunables::lan(), ConnectMode::Blocking, None).unwrap();
        sender.join().unwrap();

        let (receive_pool, signal_pool) = pools();
        let mut recv_peer = RecvPeer::new(receive_pool, signal_pool, ByteOrderKind::Native);
        let mut local = LocalPageCache::new();
        let chain = recv_peer.pump(&client, &mut local).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].main_bytes().len(), wire.len() - MIN_HEADER_SIZE);
    }

    #[test]
    fn swapped_byte_order_unswaps_header_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = *b"abcd1234"; // a whole number of 4-byte words
        let mut wire = encode_signal(&payload);
        wire::swap_words_in_place(&mut wire);
        let wire_for_send = wire.clone();
        let sender = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&wire_for_send).unwrap();
        });

        let client = Connection::connect_active(addr, SocketTunables::lan(), ConnectMode::Blocking, None).unwrap();
        sender.join().unwrap();

        let (receive_pool, signal_pool) = pools();
        let mut recv_peer = RecvPeer::new(receive_pool, signal_pool, ByteOrderKind::Swapped);
        let mut local = LocalPageCache::new();
        let chain = recv_peer.pump(&client, &mut local).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].main_bytes(), &payload[..]);
    }

    #[test]
    fn straddled_signal_is_posted_intact_after_second_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = vec![7u8; 92];
        let wire = encode_signal(&payload);
        let first_chunk = wire[..wire.len() - 20].to_vec();
        let second_chunk = wire[wire.len() - 20..].to_vec();

        let sender = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&first_chunk).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            stream.write_all(&second_chunk).unwrap();
        });

        let client = Connection::connect_active(addr, SocketTunables::lan(), ConnectMode::Blocking, None).unwrap();
        let (receive_pool, signal_pool) = pools();
        let mut recv_peer = RecvPeer::new(receive_pool, signal_pool, ByteOrderKind::Native);
        let mut local = LocalPageCache::new();

        let chain1 = recv_peer.pump(&client, &mut local).unwrap();
        assert!(chain1.is_empty());
        let chain2 = recv_peer.pump(&client, &mut local).unwrap();
        assert_eq!(chain2.len(), 1);
        assert_eq!(chain2[0].main_bytes(), &payload[..]);
        sender.join().unwrap();
    }
}
