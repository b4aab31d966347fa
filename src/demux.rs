//! Per-peer UDP demultiplexer over one shared, bound socket.
//!
//! A single socket receives datagrams from arbitrarily many peers. The
//! demux classifies each by source address and routes it to the matching
//! peer's queue, creating one on first contact; `forward()` is what creates
//! that queue for a brand-new peer so its ClientHello is there for the
//! cookie exchange to read. The separate overflow queue (`get_connection(None)`)
//! is a listener-only handle with no peer address of its own.
//!
//! Single-threaded cooperative use only: `service` is not safe to call
//! concurrently from multiple threads (§4.2 edge cases, §5).

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::Error;

struct DemuxState {
    queues: HashMap<SocketAddr, VecDeque<Vec<u8>>>,
    overflow: VecDeque<Vec<u8>>,
    pending_new: Option<(SocketAddr, Vec<u8>)>,
}

/// Shared router for one bound UDP socket.
pub struct Demux {
    socket: UdpSocket,
    state: Mutex<DemuxState>,
}

impl Demux {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            state: Mutex::new(DemuxState {
                queues: HashMap::new(),
                overflow: VecDeque::new(),
                pending_new: None,
            }),
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Read one datagram from the shared socket and classify it.
    ///
    /// Returns `Ok(Some(addr))` when the datagram came from an address with
    /// no registered queue yet (a candidate new peer) — the datagram itself
    /// is held back until [`Self::forward`] is called. Returns `Ok(None)`
    /// when the datagram belonged to an already-registered peer (it has
    /// already been queued) or when the read timed out.
    pub fn service(&self) -> Result<Option<SocketAddr>, Error> {
        let mut buf = [0u8; 64 * 1024];
        let (len, src) = match self.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let datagram = buf[..len].to_vec();

        let mut state = self.state.lock().unwrap();
        if let Some(queue) = state.queues.get_mut(&src) {
            trace!(peer = %src, bytes = len, "demux: routed to known peer");
            queue.push_back(datagram);
            return Ok(None);
        }

        debug!(peer = %src, bytes = len, "demux: datagram from unregistered peer");
        state.pending_new = Some((src, datagram));
        Ok(Some(src))
    }

    /// Deliver the datagram most recently observed by [`Self::service`] for
    /// a new peer into that peer's own queue, creating it if this is the
    /// peer's first datagram. Must be called at most once per `service()`
    /// call that returned `Some(addr)`; a redundant call is a harmless
    /// no-op. The cookie exchange reads from this same queue (via
    /// `get_connection(Some(addr))`), so the ClientHello that triggered the
    /// new-peer event must land there, not in the overflow queue.
    pub fn forward(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some((addr, datagram)) = state.pending_new.take() {
            trace!(peer = %addr, "demux: forwarding new-peer datagram to its own queue");
            state.queues.entry(addr).or_insert_with(VecDeque::new).push_back(datagram);
        }
    }

    /// Obtain a read/write handle for one peer. `addr = None` is the
    /// overflow handle used by the cookie-exchange listener.
    pub fn get_connection(self: &std::sync::Arc<Self>, addr: Option<SocketAddr>) -> DemuxHandle {
        if let Some(addr) = addr {
            self.state
                .lock()
                .unwrap()
                .queues
                .entry(addr)
                .or_insert_with(VecDeque::new);
        }
        DemuxHandle {
            demux: std::sync::Arc::clone(self),
            addr,
        }
    }

    fn try_pop(&self, addr: Option<SocketAddr>) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        match addr {
            Some(addr) => state.queues.get_mut(&addr).and_then(|q| q.pop_front()),
            None => state.overflow.pop_front(),
        }
    }

    /// Block (bounded by `deadline`, if any) until a datagram is available
    /// for `addr`, pumping the shared socket in the meantime. Other
    /// peers' datagrams observed along the way are routed to their own
    /// queues or left as a pending new-peer candidate, exactly as
    /// `service`/`forward` would do outside this loop.
    pub(crate) fn recv_for(
        &self,
        addr: Option<SocketAddr>,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(datagram) = self.try_pop(addr) {
                return Ok(datagram);
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::WantRead);
                }
                self.socket.set_read_timeout(Some(deadline - now))?;
            } else {
                self.socket.set_read_timeout(None)?;
            }
            match self.service()? {
                Some(new_addr) if Some(new_addr) == addr || addr.is_none() => self.forward(),
                _ => {}
            }
        }
    }
}

/// A read/write handle bound to one peer (or, for the listener, the
/// overflow channel). Cheap to clone; all handles share the same
/// underlying [`Demux`].
#[derive(Clone)]
pub struct DemuxHandle {
    demux: std::sync::Arc<Demux>,
    addr: Option<SocketAddr>,
}

impl DemuxHandle {
    pub fn peer(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        let deadline = timeout.map(|d| Instant::now() + d);
        self.demux.recv_for(self.addr, deadline)
    }
}
