//! Binds the crypto library's datagram I/O abstraction to OS sockets.
//!
//! `PeerChannel` plays the role the spec calls `BioAdapter`: it is handed
//! to `openssl`'s `SslStreamBuilder`/`SslStream` as the underlying
//! `Read + Write` transport, so "binding the BIO" is just Rust's ordinary
//! move-by-value — the strategy §9's design notes recommend for avoiding a
//! double free is simply what the borrow checker already enforces.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::demux::DemuxHandle;

/// Where a channel pulls its inbound bytes from.
enum Reader {
    /// Client-side: reads directly off the (connected) OS socket.
    Socket(Arc<UdpSocket>),
    /// Server-side: reads from a per-peer (or overflow) demux queue.
    Demux(DemuxHandle),
}

/// Adapts one peer's datagram traffic to `Read + Write`.
///
/// Write destination and read source are independent: on the server side,
/// writes go out through the listener's shared socket addressed to the
/// remembered peer, while reads come from the demux queue the socket
/// itself never touches directly.
pub struct PeerChannel {
    write_socket: Arc<UdpSocket>,
    reader: Reader,
    peer: Mutex<Option<SocketAddr>>,
    connected: bool,
    timeout: Mutex<Option<Duration>>,
}

impl PeerChannel {
    /// A client-side channel: reads and writes go through the same
    /// (eventually `connect`ed) socket.
    pub fn client(socket: Arc<UdpSocket>) -> Self {
        Self {
            write_socket: Arc::clone(&socket),
            reader: Reader::Socket(socket),
            peer: Mutex::new(None),
            connected: false,
            timeout: Mutex::new(None),
        }
    }

    /// A server-side channel: writes go through the listener's shared
    /// socket, reads come from a demux handle (per-peer queue, or the
    /// overflow queue for the listener itself).
    pub fn demuxed(write_socket: Arc<UdpSocket>, handle: DemuxHandle) -> Self {
        let peer = handle.peer();
        Self {
            write_socket,
            reader: Reader::Demux(handle),
            peer: Mutex::new(peer),
            connected: false,
            timeout: Mutex::new(None),
        }
    }

    /// Toggle non-blocking semantics to match the association's socket
    /// timeout: `Some(d)` bounds each read to at most `d` before surfacing
    /// a would-block condition; `None` blocks indefinitely.
    pub fn set_nbio(&self, timeout: Option<Duration>) {
        *self.timeout.lock().unwrap() = timeout;
    }

    pub fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock().unwrap() = Some(addr);
    }

    pub fn get_peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap()
    }

    /// The socket writes go out on — shared with whatever owns the demux
    /// (the listener) or, client-side, this channel's own socket.
    pub fn write_socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.write_socket)
    }

    /// Mark this as a client channel connected to a single peer (the OS
    /// socket itself has also been `connect`ed).
    pub fn set_connected(&mut self, addr: SocketAddr) {
        self.connected = true;
        self.set_peer(addr);
    }

    fn current_timeout(&self) -> Option<Duration> {
        *self.timeout.lock().unwrap()
    }
}

impl Read for PeerChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.current_timeout();
        match &self.reader {
            Reader::Socket(sock) => {
                match timeout {
                    Some(d) if d.is_zero() => {
                        sock.set_nonblocking(true)?;
                    }
                    other => {
                        sock.set_nonblocking(false)?;
                        sock.set_read_timeout(other)?;
                    }
                }
                match sock.recv(buf) {
                    Ok(n) => Ok(n),
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                        Err(io::Error::new(io::ErrorKind::WouldBlock, "dtls: would block on read"))
                    }
                    Err(e) => Err(e),
                }
            }
            Reader::Demux(handle) => {
                let datagram = handle.recv(timeout).map_err(|_| {
                    io::Error::new(io::ErrorKind::WouldBlock, "dtls: would block on read")
                })?;
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
        }
    }
}

impl Write for PeerChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.connected {
            return self.write_socket.send(buf);
        }
        let peer = self
            .get_peer()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "dtls: no peer address set"))?;
        self.write_socket.send_to(buf, peer)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
