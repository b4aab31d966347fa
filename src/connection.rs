//! The per-peer handshake/read/write/shutdown state machine (§4.6).

use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use openssl::error::ErrorStack;
use openssl::ssl::{HandshakeError, MidHandshakeSslStream, Ssl, ShutdownResult, SslStream, SslStreamBuilder};
use tracing::{debug, info, warn};

use crate::bio::PeerChannel;
use crate::cert::{self, PeerCertificate};
use crate::context::{CertReqs, Context};
use crate::demux::DemuxHandle;
use crate::error::Error;
use crate::ffi;
use crate::unwrapped::UnwrappedSocket;

/// Which of the three construction variants (§4.6) produced this association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRole {
    Client,
    ServerAccepted,
}

/// Decoded peer certificate, or the raw DER bytes — mirrors the
/// `binary` flag on the original `getpeercert`.
pub enum PeerCert {
    Der(Vec<u8>),
    Parsed(PeerCertificate),
}

/// Negotiated cipher suite, reported by `cipher()`.
pub struct CipherInfo {
    pub name: String,
    pub protocol_version: String,
    pub secret_bits: i32,
}

enum Handshake {
    /// Not yet driven. `is_client` selects `connect()` vs `accept()`.
    NotStarted(SslStreamBuilder<PeerChannel>, bool),
    InProgress(MidHandshakeSslStream<PeerChannel>),
    Done(SslStream<PeerChannel>),
    /// Transient placeholder used only inside `drive()`'s `mem::replace` dance.
    Taken,
}

pub struct PeerAssociation {
    role: AssociationRole,
    context: Arc<Context>,
    handshake: Handshake,
    handshake_done: bool,
    socket_timeout: Option<Duration>,
    suppress_ragged_eofs: bool,
    peer_addr: SocketAddr,
    write_socket: Arc<UdpSocket>,
    /// Present only for server-accepted associations — needed to rebuild
    /// an [`UnwrappedSocket`] on shutdown without re-classifying the peer.
    read_handle: Option<DemuxHandle>,
}

impl PeerAssociation {
    /// Client construction variant: an unconnected UDP socket plus a
    /// context configured for `Role::Client`. Call [`Self::connect`] next.
    pub fn client(
        socket: UdpSocket,
        context: Arc<Context>,
        suppress_ragged_eofs: bool,
    ) -> Result<Self, Error> {
        let write_socket = Arc::new(socket);
        Ok(Self {
            role: AssociationRole::Client,
            context,
            handshake: Handshake::Taken,
            handshake_done: false,
            socket_timeout: None,
            suppress_ragged_eofs,
            peer_addr: "0.0.0.0:0".parse().unwrap(),
            write_socket,
            read_handle: None,
        })
    }

    /// Connect to `addr`, optionally driving the handshake synchronously.
    pub fn connect(&mut self, addr: SocketAddr, do_handshake_on_connect: bool) -> Result<(), Error> {
        self.write_socket.connect(addr).map_err(Error::Io)?;
        self.peer_addr = addr;

        let mut channel = PeerChannel::client(Arc::clone(&self.write_socket));
        channel.set_connected(addr);

        let ssl = Ssl::new(&self.context.ssl_context).map_err(Error::fatal)?;
        let builder = SslStreamBuilder::new(ssl, channel);
        self.handshake = Handshake::NotStarted(builder, true);

        if do_handshake_on_connect {
            self.do_handshake()?;
        }
        Ok(())
    }

    /// Server-accepted construction variant: inherits the context and the
    /// partially-validated SSL session from a [`crate::listener::Listener`]
    /// that just completed a stateless cookie round for `addr`.
    pub(crate) fn from_listener_handoff(
        context: Arc<Context>,
        builder: SslStreamBuilder<PeerChannel>,
        addr: SocketAddr,
        do_handshake_on_connect: bool,
    ) -> Result<Self, Error> {
        let write_socket = builder.get_ref().write_socket();
        let mut assoc = Self {
            role: AssociationRole::ServerAccepted,
            context,
            handshake: Handshake::NotStarted(builder, false),
            handshake_done: false,
            socket_timeout: None,
            suppress_ragged_eofs: true,
            peer_addr: addr,
            write_socket,
            read_handle: None,
        };
        if do_handshake_on_connect {
            assoc.do_handshake()?;
        }
        Ok(assoc)
    }

    /// Re-enter the encrypted state on an already-demuxed channel that was
    /// previously unwrapped by [`Self::shutdown`].
    pub fn from_unwrapped(
        unwrapped: UnwrappedSocket,
        context: Arc<Context>,
        is_client: bool,
    ) -> Result<Self, Error> {
        let peer_addr = unwrapped.getpeername();
        let write_socket = unwrapped.write_socket();
        let read_handle = unwrapped.demux_handle();

        let channel = match &read_handle {
            Some(handle) => PeerChannel::demuxed(Arc::clone(&write_socket), handle.clone()),
            None => {
                let mut channel = PeerChannel::client(Arc::clone(&write_socket));
                channel.set_connected(peer_addr);
                channel
            }
        };
        channel.set_peer(peer_addr);

        let ssl = Ssl::new(&context.ssl_context).map_err(Error::fatal)?;
        let builder = SslStreamBuilder::new(ssl, channel);
        Ok(Self {
            role: if is_client { AssociationRole::Client } else { AssociationRole::ServerAccepted },
            context,
            handshake: Handshake::NotStarted(builder, is_client),
            handshake_done: false,
            socket_timeout: None,
            suppress_ragged_eofs: true,
            peer_addr,
            write_socket,
            read_handle,
        })
    }

    pub fn role(&self) -> AssociationRole {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Finite timeout → non-blocking-with-deadline BIO; `None` → block
    /// indefinitely. Applied before every I/O operation (§4.6 "Blocking-mode
    /// tracking").
    pub fn set_socket_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_timeout = timeout;
        if let Some(channel) = self.channel_mut() {
            channel.set_nbio(timeout);
        }
    }

    fn channel_mut(&mut self) -> Option<&mut PeerChannel> {
        match &mut self.handshake {
            Handshake::NotStarted(builder, _) => Some(builder.get_mut()),
            Handshake::InProgress(mid) => Some(mid.get_mut()),
            Handshake::Done(stream) => Some(stream.get_mut()),
            Handshake::Taken => None,
        }
    }

    fn configure_blocking_mode(&mut self) {
        let timeout = self.socket_timeout;
        if let Some(channel) = self.channel_mut() {
            channel.set_nbio(timeout);
        }
    }

    pub fn do_handshake(&mut self) -> Result<(), Error> {
        self.configure_blocking_mode();
        self.drive()
    }

    fn drive(&mut self) -> Result<(), Error> {
        loop {
            match mem::replace(&mut self.handshake, Handshake::Taken) {
                Handshake::Done(stream) => {
                    self.handshake = Handshake::Done(stream);
                    self.handshake_done = true;
                    return Ok(());
                }
                Handshake::NotStarted(builder, is_client) => {
                    let result = if is_client { builder.connect() } else { builder.accept() };
                    match result {
                        Ok(stream) => {
                            info!(peer = %self.peer_addr, "handshake complete");
                            self.handshake = Handshake::Done(stream);
                            self.handshake_done = true;
                            return Ok(());
                        }
                        Err(HandshakeError::WouldBlock(mid)) => {
                            let err = self.classify_ssl_error(mid.error());
                            self.handshake = Handshake::InProgress(mid);
                            return Err(err);
                        }
                        Err(HandshakeError::Failure(mid)) => {
                            return Err(self.classify_ssl_error(mid.error()));
                        }
                        Err(HandshakeError::SetupFailure(stack)) => return Err(Error::fatal(stack)),
                    }
                }
                Handshake::InProgress(mid) => match mid.handshake() {
                    Ok(stream) => {
                        info!(peer = %self.peer_addr, "handshake complete");
                        self.handshake = Handshake::Done(stream);
                        self.handshake_done = true;
                        return Ok(());
                    }
                    Err(HandshakeError::WouldBlock(mid)) => {
                        let err = self.classify_ssl_error(mid.error());
                        self.handshake = Handshake::InProgress(mid);
                        return Err(err);
                    }
                    Err(HandshakeError::Failure(mid)) => {
                        return Err(self.classify_ssl_error(mid.error()));
                    }
                    Err(HandshakeError::SetupFailure(stack)) => return Err(Error::fatal(stack)),
                },
                Handshake::Taken => unreachable!("drive() re-entered while already in progress"),
            }
        }
    }

    fn classify_ssl_error(&self, err: &openssl::ssl::Error) -> Error {
        use openssl::ssl::ErrorCode;
        if let Some(io_err) = err.io_error() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return Error::port_unreachable();
            }
        }
        match err.code() {
            ErrorCode::WANT_READ => {
                if self.is_finite_timeout() {
                    Error::handshake_timeout()
                } else {
                    Error::WantRead
                }
            }
            ErrorCode::WANT_WRITE => Error::WantWrite,
            _ => match err.ssl_error() {
                Some(stack) => Error::fatal(stack.clone()),
                None => Error::fatal(ErrorStack::get()),
            },
        }
    }

    fn is_finite_timeout(&self) -> bool {
        matches!(self.socket_timeout, Some(d) if d > Duration::ZERO)
    }

    fn classify_io_error(&self, err: io::Error) -> Error {
        if let Some(ssl_err) = err.get_ref().and_then(|e| e.downcast_ref::<openssl::ssl::Error>()) {
            return self.classify_ssl_error(ssl_err);
        }
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                if self.is_finite_timeout() {
                    Error::handshake_timeout()
                } else {
                    Error::WantRead
                }
            }
            io::ErrorKind::ConnectionRefused => Error::port_unreachable(),
            _ => Error::Io(err),
        }
    }

    /// Read up to `buf.len()` decrypted bytes. `Ok(0)` on an orderly
    /// close-notify unless `suppress_ragged_eofs` is false, in which case
    /// the underlying error is surfaced instead.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if !self.handshake_done {
            return Err(Error::InvalidSocket);
        }
        self.configure_blocking_mode();
        let suppress = self.suppress_ragged_eofs;
        let stream = self.stream_mut()?;
        match stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let classified = self.classify_io_error(e);
                if suppress {
                    if let Error::Fatal { .. } = &classified {
                        return Ok(0);
                    }
                }
                Err(classified)
            }
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if !self.handshake_done {
            return Err(Error::InvalidSocket);
        }
        self.configure_blocking_mode();
        let stream = self.stream_mut()?;
        stream.write(buf).map_err(|e| self.classify_io_error(e))
    }

    fn stream_mut(&mut self) -> Result<&mut SslStream<PeerChannel>, Error> {
        match &mut self.handshake {
            Handshake::Done(stream) => Ok(stream),
            _ => Err(Error::InvalidSocket),
        }
    }

    /// Duration until the next DTLS retransmission is due, or `None` if no
    /// timer is armed.
    pub fn get_timeout(&self) -> Option<Duration> {
        self.ssl_ref().and_then(ffi::dtls_get_timeout)
    }

    /// Resend the current flight if the timer retrieved from
    /// [`Self::get_timeout`] has actually elapsed.
    pub fn handle_timeout(&mut self) -> Result<bool, Error> {
        let ssl = self.ssl_ref().ok_or(Error::InvalidSocket)?;
        ffi::dtls_handle_timeout(ssl).map_err(Error::fatal)
    }

    fn ssl_ref(&self) -> Option<&openssl::ssl::SslRef> {
        match &self.handshake {
            Handshake::NotStarted(builder, _) => Some(builder.ssl()),
            Handshake::InProgress(mid) => Some(mid.ssl()),
            Handshake::Done(stream) => Some(stream.ssl()),
            Handshake::Taken => None,
        }
    }

    /// `None` iff the handshake has not completed (§8 invariant).
    pub fn cipher(&self) -> Option<CipherInfo> {
        let ssl = match &self.handshake {
            Handshake::Done(stream) => stream.ssl(),
            _ => return None,
        };
        let cipher = ssl.current_cipher()?;
        Some(CipherInfo {
            name: cipher.name().to_string(),
            protocol_version: cipher.version().to_string(),
            secret_bits: cipher.bits().secret,
        })
    }

    pub fn pending(&self) -> usize {
        match &self.handshake {
            Handshake::Done(stream) => stream.ssl().pending(),
            _ => 0,
        }
    }

    /// `None` if the peer sent no certificate; an empty dictionary if one
    /// was sent but this context's `cert_reqs` never required it to be
    /// verified (`binary = false` only — binary form always reports the
    /// raw DER of whatever the peer sent).
    pub fn getpeercert(&self, binary: bool) -> Option<PeerCert> {
        let ssl = match &self.handshake {
            Handshake::Done(stream) => stream.ssl(),
            _ => return None,
        };
        let x509 = ssl.peer_certificate()?;
        if binary {
            return x509.to_der().ok().map(PeerCert::Der);
        }
        if self.context.cert_reqs() == CertReqs::None {
            return Some(PeerCert::Parsed(PeerCertificate::default()));
        }
        Some(PeerCert::Parsed(cert::describe(&x509)))
    }

    /// Sends close-notify and (per the double-call quirk, §4.6/§9) consumes
    /// the peer's own close-notify in the same call when the crypto layer
    /// reports it was just sent. Returns a plaintext façade retaining the
    /// same demux path.
    pub fn shutdown(mut self) -> Result<UnwrappedSocket, Error> {
        self.configure_blocking_mode();
        if let Handshake::Done(stream) = &mut self.handshake {
            match stream.shutdown() {
                Ok(ShutdownResult::Sent) => match stream.shutdown() {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(peer = %self.peer_addr, error = %e, "second shutdown call did not complete cleanly");
                    }
                },
                Ok(ShutdownResult::Received) => {}
                Err(e) => {
                    let classified = self.classify_ssl_error(&e);
                    warn!(peer = %self.peer_addr, error = %classified, "shutdown failed");
                }
            }
        }
        debug!(peer = %self.peer_addr, "association unwrapped");
        Ok(match self.read_handle.take() {
            Some(handle) => UnwrappedSocket::from_demux(self.write_socket, handle, self.peer_addr),
            None => UnwrappedSocket::from_socket(self.write_socket, self.peer_addr),
        })
    }
}
