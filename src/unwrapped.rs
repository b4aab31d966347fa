//! Post-shutdown plaintext façade over an already-classified channel (§6.3).
//!
//! Returned by `PeerAssociation::shutdown`. Behaves like a connected
//! datagram socket bound to the peer the association negotiated with,
//! without re-doing any address classification: `recv`/`recvfrom` keep
//! draining the same demux path (or, client-side, the same connected OS
//! socket) the encrypted channel used.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::demux::DemuxHandle;
use crate::error::Error;

enum Reader {
    Demux(DemuxHandle),
    Socket(Arc<UdpSocket>),
}

pub struct UnwrappedSocket {
    write_socket: Arc<UdpSocket>,
    reader: Reader,
    peer: SocketAddr,
}

impl UnwrappedSocket {
    pub(crate) fn from_demux(write_socket: Arc<UdpSocket>, handle: DemuxHandle, peer: SocketAddr) -> Self {
        Self {
            write_socket,
            reader: Reader::Demux(handle),
            peer,
        }
    }

    pub(crate) fn from_socket(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            write_socket: Arc::clone(&socket),
            reader: Reader::Socket(socket),
            peer,
        }
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.write_socket.send_to(buf, self.peer)
    }

    pub fn sendto(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.write_socket.send_to(buf, addr)
    }

    pub fn sendall(&self, buf: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.send(&buf[sent..])?;
        }
        Ok(())
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        match &self.reader {
            Reader::Demux(handle) => handle.recv(timeout),
            Reader::Socket(sock) => {
                sock.set_read_timeout(timeout).map_err(Error::Io)?;
                let mut buf = [0u8; 64 * 1024];
                let n = sock.recv(&mut buf).map_err(|e| {
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
                        Error::WantRead
                    } else {
                        Error::Io(e)
                    }
                })?;
                Ok(buf[..n].to_vec())
            }
        }
    }

    pub fn recvfrom(&self, timeout: Option<Duration>) -> Result<(Vec<u8>, SocketAddr), Error> {
        let buf = self.recv(timeout)?;
        Ok((buf, self.peer))
    }

    pub fn getpeername(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn write_socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.write_socket)
    }

    /// The demux handle backing this façade's reads, if server-side.
    /// Needed to re-enter the encrypted state via
    /// [`crate::connection::PeerAssociation::from_unwrapped`].
    pub fn demux_handle(&self) -> Option<DemuxHandle> {
        match &self.reader {
            Reader::Demux(handle) => Some(handle.clone()),
            Reader::Socket(_) => None,
        }
    }

    /// Always rejected: the peer address is fixed by the handshake that
    /// produced this façade.
    pub fn connect(&self, _addr: SocketAddr) -> Result<(), Error> {
        Err(Error::InvalidSocket)
    }
}
