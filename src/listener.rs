//! Server-side cookie-exchange acceptor (§4.5).
//!
//! Each candidate peer address gets its own ephemeral [`Ssl`] for the
//! stateless cookie round — `openssl`'s `stateless()` (OpenSSL's
//! `SSL_stateless`) was built specifically to replace the older
//! `DTLSv1_listen` pattern that required one warm, reused listening SSL
//! object swapped out at accept time. Because nothing here is shared
//! across candidates, the "atomic swap" the original design called for
//! has nothing left to swap — see DESIGN.md for the full note.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use openssl::ssl::{Ssl, SslStreamBuilder};
use tracing::{debug, info, warn};

use crate::bio::PeerChannel;
use crate::connection::PeerAssociation;
use crate::context::Context;
use crate::demux::Demux;
use crate::error::Error;

/// Bound on concurrent in-progress cookie attempts, independent of how
/// many spoofed source addresses an attacker tries — resident memory for
/// rejected attempts stays O(this), never O(datagrams received). Modeled
/// directly on `SynCookies`' `max_pending`/TTL bookkeeping.
const DEFAULT_MAX_PENDING: usize = 4096;
const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30);

/// Bounded, TTL-evicted set of addresses with an in-progress cookie
/// exchange. Deliberately ignorant of cryptography: the cap on resident
/// memory holds regardless of whether attempts are ever legitimate.
struct AttemptTracker {
    attempts: HashMap<SocketAddr, Instant>,
    max_pending: usize,
    ttl: Duration,
}

impl AttemptTracker {
    fn new(max_pending: usize, ttl: Duration) -> Self {
        Self {
            attempts: HashMap::new(),
            max_pending,
            ttl,
        }
    }

    fn evict_expired(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(self.ttl) else {
            return;
        };
        self.attempts.retain(|_, first_seen| *first_seen >= cutoff);
    }

    /// `true` if `addr` is (now) tracked: either already present, or
    /// admitted because the table had room.
    fn admit(&mut self, addr: SocketAddr) -> bool {
        if self.attempts.contains_key(&addr) {
            return true;
        }
        if self.attempts.len() >= self.max_pending {
            return false;
        }
        self.attempts.insert(addr, Instant::now());
        true
    }

    fn remove(&mut self, addr: &SocketAddr) {
        self.attempts.remove(addr);
    }

    fn len(&self) -> usize {
        self.attempts.len()
    }
}

/// Everything captured about a peer that has echoed a valid cookie but
/// has not yet been promoted by [`Listener::accept`].
struct PendingPeer {
    addr: SocketAddr,
    builder: SslStreamBuilder<PeerChannel>,
}

pub struct Listener {
    demux: Arc<Demux>,
    write_socket: Arc<UdpSocket>,
    context: Arc<Context>,
    pending: Mutex<Option<PendingPeer>>,
    attempts: Mutex<AttemptTracker>,
    socket_timeout: Mutex<Option<Duration>>,
    do_handshake_on_connect: bool,
}

impl Listener {
    pub fn new(socket: UdpSocket, context: Arc<Context>, do_handshake_on_connect: bool) -> Result<Self, Error> {
        let write_socket = Arc::new(socket.try_clone().map_err(Error::Io)?);
        let demux = Arc::new(Demux::new(socket));
        Ok(Self {
            demux,
            write_socket,
            context,
            pending: Mutex::new(None),
            attempts: Mutex::new(AttemptTracker::new(DEFAULT_MAX_PENDING, DEFAULT_PENDING_TTL)),
            socket_timeout: Mutex::new(None),
            do_handshake_on_connect,
        })
    }

    pub fn demux(&self) -> &Arc<Demux> {
        &self.demux
    }

    /// Bound every blocking read `listen()` performs — on the shared
    /// socket and on a candidate peer's cookie-exchange channel alike — by
    /// this timeout. `None` blocks indefinitely. Mirrors
    /// `PeerAssociation::configure_blocking_mode`.
    pub fn set_socket_timeout(&self, timeout: Option<Duration>) {
        *self.socket_timeout.lock().unwrap() = timeout;
    }

    fn configure_blocking_mode(&self) -> Result<(), Error> {
        let timeout = *self.socket_timeout.lock().unwrap();
        self.demux.socket().set_read_timeout(timeout).map_err(Error::Io)
    }

    /// Drive one step of the cookie-exchange state machine. Returns the
    /// pending peer's address once a valid cookie has been echoed;
    /// otherwise `None` and the caller is expected to call again.
    pub fn listen(&self) -> Result<Option<SocketAddr>, Error> {
        if let Some(pending) = self.pending.lock().unwrap().as_ref() {
            return Ok(Some(pending.addr));
        }

        self.configure_blocking_mode()?;
        let Some(addr) = self.demux.service()? else {
            return Ok(None);
        };
        // Known-peer datagrams are already queued by `service`; only a
        // new-peer event carries a forwardable payload.
        self.demux.forward();
        let admitted = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.evict_expired();
            attempts.admit(addr)
        };
        if !admitted {
            warn!(peer = %addr, "listener: dropping cookie attempt, pending table is full");
            return Ok(None);
        }

        self.context.set_candidate_peer(addr);
        let ssl = Ssl::new(&self.context.ssl_context).map_err(Error::fatal)?;
        let channel = PeerChannel::demuxed(Arc::clone(&self.write_socket), self.demux.get_connection(Some(addr)));
        channel.set_peer(addr);
        channel.set_nbio(*self.socket_timeout.lock().unwrap());
        let mut builder = SslStreamBuilder::new(ssl, channel);

        match builder.stateless() {
            Ok(true) => {
                debug!(peer = %addr, "listener: cookie exchange complete, peer pending accept");
                self.attempts.lock().unwrap().remove(&addr);
                *self.pending.lock().unwrap() = Some(PendingPeer { addr, builder });
                Ok(Some(addr))
            }
            Ok(false) => Ok(None),
            Err(stack) => {
                warn!(peer = %addr, error = %stack, "listener: cookie mismatch or malformed hello, dropping");
                Ok(None)
            }
        }
    }

    /// Promote the pending peer into a full [`PeerAssociation`]. Blocks
    /// (subject to the listening socket's configured timeout) until a
    /// peer completes the cookie exchange if none is pending yet.
    pub fn accept(&self) -> Result<PeerAssociation, Error> {
        loop {
            if let Some(pending) = self.pending.lock().unwrap().take() {
                info!(peer = %pending.addr, "listener: accepting peer");
                return PeerAssociation::from_listener_handoff(
                    Arc::clone(&self.context),
                    pending.builder,
                    pending.addr,
                    self.do_handshake_on_connect,
                );
            }
            self.listen()?;
        }
    }

    /// No-op: shutting down a Listener has no state to tear down (§8,
    /// shutdown idempotence on listeners).
    pub fn shutdown(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Number of in-progress cookie attempts currently tracked. Exposed
    /// for tests asserting bounded memory under a cookie-flood (§8 scenario 2).
    pub fn pending_attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("198.51.100.1:{port}").parse().unwrap()
    }

    #[test]
    fn admits_up_to_capacity_then_rejects() {
        let mut tracker = AttemptTracker::new(2, Duration::from_secs(30));
        assert!(tracker.admit(addr(1)));
        assert!(tracker.admit(addr(2)));
        assert!(!tracker.admit(addr(3)));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn re_admitting_a_tracked_address_is_a_no_op() {
        let mut tracker = AttemptTracker::new(1, Duration::from_secs(30));
        assert!(tracker.admit(addr(1)));
        assert!(tracker.admit(addr(1)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn expired_entries_are_evicted_and_free_up_capacity() {
        let mut tracker = AttemptTracker::new(1, Duration::from_millis(1));
        assert!(tracker.admit(addr(1)));
        std::thread::sleep(Duration::from_millis(20));
        tracker.evict_expired();
        assert_eq!(tracker.len(), 0);
        assert!(tracker.admit(addr(2)));
    }

    #[test]
    fn remove_frees_a_slot_immediately() {
        let mut tracker = AttemptTracker::new(1, Duration::from_secs(30));
        assert!(tracker.admit(addr(1)));
        tracker.remove(&addr(1));
        assert!(tracker.admit(addr(2)));
    }
}
