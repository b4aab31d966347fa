//! Error taxonomy for the DTLS peer-association engine.

use openssl::error::ErrorStack;
use thiserror::Error;

/// A single entry drained from OpenSSL's per-thread error queue.
///
/// The queue is sticky: an unread error from a previous operation falsely
/// attributes to the next one unless drained at the raise site. We attach
/// whatever was pending so callers get a real diagnostic instead of a stale
/// one.
#[derive(Debug, Clone)]
pub struct OpensslErrorEntry {
    pub library: String,
    pub function: String,
    pub reason: String,
}

pub(crate) fn drain_error_queue() -> Vec<OpensslErrorEntry> {
    ErrorStack::get()
        .errors()
        .iter()
        .map(|e| OpensslErrorEntry {
            library: e.library().unwrap_or("unknown").to_string(),
            function: e.function().unwrap_or("unknown").to_string(),
            reason: e.reason().unwrap_or("unknown").to_string(),
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("socket is not a UDP datagram socket, or is in an incompatible connected/unconnected state for the requested role")]
    InvalidSocket,

    #[error("keyfile and certfile must be specified together")]
    BothKeyAndCertRequired,

    #[error("server-side context requires both keyfile and certfile")]
    ServerRequiresKeyAndCert,

    #[error("cert_reqs is not none but no trust anchors (ca_certs) were supplied")]
    NoTrustAnchors,

    #[error("cipher list {0:?} matched no ciphers")]
    NoCipher(String),

    #[error("unsupported address family on this platform")]
    UnsupportedAddressFamily,

    /// Internal, non-fatal: a presented DTLS cookie did not match. Never
    /// escapes `Listener::listen` — callers only ever see a `None` return
    /// and a logged warning.
    #[error("DTLS cookie mismatch")]
    CookieMismatch,

    #[error("handshake timed out waiting for a response")]
    HandshakeTimeout { errors: Vec<OpensslErrorEntry> },

    #[error("destination port unreachable")]
    PortUnreachable { errors: Vec<OpensslErrorEntry> },

    #[error("operation would block on read; retry once more data or a timeout elapses")]
    WantRead,

    #[error("operation would block on write; retry once the socket is writable")]
    WantWrite,

    #[error("fatal DTLS error: {source}")]
    Fatal {
        #[source]
        source: ErrorStack,
        errors: Vec<OpensslErrorEntry>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn fatal(source: ErrorStack) -> Self {
        let errors = drain_error_queue();
        Error::Fatal { source, errors }
    }

    pub(crate) fn handshake_timeout() -> Self {
        Error::HandshakeTimeout {
            errors: drain_error_queue(),
        }
    }

    pub(crate) fn port_unreachable() -> Self {
        Error::PortUnreachable {
            errors: drain_error_queue(),
        }
    }
}
