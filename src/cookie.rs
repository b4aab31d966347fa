//! Stateless HMAC cookie generation/verification for the DTLS listener.
//!
//! Unlike a connection-tracking SYN-cookie table, this engine holds no
//! per-peer state at all: a cookie is `HMAC(secret, serialize(peer_addr))`,
//! recomputed and compared on every call. The only process-lifetime state
//! is the 16-byte secret itself (§3, invariant 4 — never rotates mid-process).

use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of the process-lifetime cookie secret, in bytes.
pub const COOKIE_SECRET_LEN: usize = 16;

/// Generates and verifies DTLS cookies against a fixed, random secret.
///
/// Cheap to share: `generate`/`verify` take `&self`, so a single instance
/// can be wrapped in an `Arc` and handed to every cookie callback without
/// synchronization (the secret is never mutated after construction).
pub struct CookieEngine {
    secret: [u8; COOKIE_SECRET_LEN],
}

impl CookieEngine {
    /// Generate a fresh, cryptographically random secret for this process.
    pub fn new() -> Result<Self, Error> {
        let mut secret = [0u8; COOKIE_SECRET_LEN];
        getrandom::getrandom(&mut secret)
            .map_err(|e| Error::Config(format!("failed to seed cookie secret: {e}")))?;
        Ok(Self { secret })
    }

    /// Build an engine around an explicit secret. Exposed for tests that
    /// need deterministic cookies; production callers should use [`Self::new`].
    pub fn with_secret(secret: [u8; COOKIE_SECRET_LEN]) -> Self {
        Self { secret }
    }

    pub fn generate(&self, peer: SocketAddr) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(&Self::serialize(peer));
        mac.finalize().into_bytes().to_vec()
    }

    /// Constant-time comparison via `Mac::verify_slice`.
    pub fn verify(&self, peer: SocketAddr, presented: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(&Self::serialize(peer));
        mac.verify_slice(presented).is_ok()
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length")
    }

    /// Canonical byte representation of a peer address, stable across the
    /// IPv4/IPv6 + port (and, for IPv6, flow label/scope) fields.
    fn serialize(addr: SocketAddr) -> Vec<u8> {
        match addr {
            SocketAddr::V4(v4) => {
                let mut buf = Vec::with_capacity(6);
                buf.extend_from_slice(&v4.ip().octets());
                buf.extend_from_slice(&v4.port().to_be_bytes());
                buf
            }
            SocketAddr::V6(v6) => {
                let mut buf = Vec::with_capacity(24);
                buf.extend_from_slice(&v6.ip().octets());
                buf.extend_from_slice(&v6.port().to_be_bytes());
                buf.extend_from_slice(&v6.flowinfo().to_be_bytes());
                buf.extend_from_slice(&v6.scope_id().to_be_bytes());
                buf
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn verify_accepts_own_cookie() {
        let engine = CookieEngine::with_secret([7u8; COOKIE_SECRET_LEN]);
        let a = addr("198.51.100.1:5000");
        let cookie = engine.generate(a);
        assert!(engine.verify(a, &cookie));
    }

    #[test]
    fn verify_rejects_cookie_for_different_peer() {
        let engine = CookieEngine::with_secret([7u8; COOKIE_SECRET_LEN]);
        let a = addr("198.51.100.1:5000");
        let b = addr("198.51.100.2:5000");
        let cookie = engine.generate(a);
        assert!(!engine.verify(b, &cookie));
    }

    #[test]
    fn different_port_is_a_different_peer() {
        let engine = CookieEngine::with_secret([1u8; COOKIE_SECRET_LEN]);
        let a = addr("198.51.100.1:5000");
        let b = addr("198.51.100.1:5001");
        let cookie = engine.generate(a);
        assert!(!engine.verify(b, &cookie));
    }

    #[test]
    fn generate_is_deterministic_for_same_secret_and_peer() {
        let engine = CookieEngine::with_secret([3u8; COOKIE_SECRET_LEN]);
        let a = addr("203.0.113.9:443");
        assert_eq!(engine.generate(a), engine.generate(a));
    }

    #[test]
    fn different_secrets_produce_different_cookies() {
        let e1 = CookieEngine::with_secret([1u8; COOKIE_SECRET_LEN]);
        let e2 = CookieEngine::with_secret([2u8; COOKIE_SECRET_LEN]);
        let a = addr("203.0.113.9:443");
        assert_ne!(e1.generate(a), e2.generate(a));
    }

    #[test]
    fn garbage_cookie_is_rejected() {
        let engine = CookieEngine::with_secret([9u8; COOKIE_SECRET_LEN]);
        let a = addr("192.0.2.50:9000");
        assert!(!engine.verify(a, b"not a real cookie"));
    }

    #[test]
    fn fresh_engine_has_random_secret() {
        let e1 = CookieEngine::new().unwrap();
        let e2 = CookieEngine::new().unwrap();
        let a = addr("192.0.2.1:1");
        // Overwhelmingly likely with 16 random bytes of secret.
        assert_ne!(e1.generate(a), e2.generate(a));
    }
}
