//! Process-wide DTLS configuration: roles, certificate requirements, and
//! the underlying crypto-library context handle.
//!
//! Validation happens once, at construction, and fails fast — nothing
//! downstream re-checks that a server has a certificate or that
//! `cert_reqs = required` implies trust anchors were supplied.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use openssl::ssl::{SslContext, SslContextBuilder, SslFiletype, SslMethod, SslSessionCacheMode, SslVerifyMode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cookie::CookieEngine;
use crate::error::Error;

/// Which end of the association this context configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Peer-certificate requirement level, matching the platform's standard
/// TLS-socket enumeration (`0 = none`, `1 = optional`, `2 = required`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertReqs {
    None = 0,
    Optional = 1,
    Required = 2,
}

impl CertReqs {
    pub fn from_i32(value: i32) -> Result<Self, Error> {
        match value {
            0 => Ok(CertReqs::None),
            1 => Ok(CertReqs::Optional),
            2 => Ok(CertReqs::Required),
            other => Err(Error::Config(format!(
                "cert_reqs must be 0 (none), 1 (optional), or 2 (required); got {other}"
            ))),
        }
    }
}

/// Arguments accepted by [`Context::new`], mirroring the constructor
/// signature of a standard TLS-socket wrapper (§6.2).
pub struct ContextParams<'a> {
    pub role: Role,
    pub keyfile: Option<&'a Path>,
    pub certfile: Option<&'a Path>,
    pub ca_certs: Option<&'a Path>,
    pub cert_reqs: CertReqs,
    pub ciphers: Option<&'a str>,
}

/// Owns the crypto-library context handle plus the process-lifetime
/// cookie secret. Shared by reference between a server [`crate::listener::Listener`]
/// and each association it spawns.
pub struct Context {
    pub(crate) role: Role,
    pub(crate) cert_reqs: CertReqs,
    pub(crate) ssl_context: SslContext,
    pub(crate) cookie_engine: Arc<CookieEngine>,
    /// The peer address a cookie callback should bind against for its next
    /// invocation. `Listener` sets this immediately before handing a
    /// datagram to the DTLS listen primitive; it is the cycle-free
    /// replacement for the original's weak-reference trampoline (see
    /// DESIGN.md).
    pub(crate) candidate_peer: Arc<Mutex<Option<SocketAddr>>>,
}

impl Context {
    /// Validate and build a context. Fails fast per §4.7's argument rules.
    pub fn new(params: ContextParams) -> Result<Self, Error> {
        if params.keyfile.is_some() != params.certfile.is_some() {
            return Err(Error::BothKeyAndCertRequired);
        }
        if params.role == Role::Server && (params.keyfile.is_none() || params.certfile.is_none()) {
            return Err(Error::ServerRequiresKeyAndCert);
        }
        if params.cert_reqs != CertReqs::None && params.ca_certs.is_none() {
            return Err(Error::NoTrustAnchors);
        }

        let mut builder = SslContextBuilder::new(SslMethod::dtls()).map_err(Error::fatal)?;
        builder.set_session_cache_mode(SslSessionCacheMode::OFF);
        builder.set_read_ahead(true);

        let verify_mode = match params.cert_reqs {
            CertReqs::None => SslVerifyMode::NONE,
            CertReqs::Optional => SslVerifyMode::PEER,
            CertReqs::Required => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        };
        builder.set_verify(verify_mode);

        if let (Some(key), Some(cert)) = (params.keyfile, params.certfile) {
            builder
                .set_private_key_file(key, SslFiletype::PEM)
                .map_err(Error::fatal)?;
            builder
                .set_certificate_chain_file(cert)
                .map_err(Error::fatal)?;
        }
        if let Some(ca) = params.ca_certs {
            builder.set_ca_file(ca).map_err(Error::fatal)?;
        }

        let cipher_list = params.ciphers.unwrap_or("DEFAULT");
        builder
            .set_cipher_list(cipher_list)
            .map_err(|_| Error::NoCipher(cipher_list.to_string()))?;

        let cookie_engine = Arc::new(CookieEngine::new()?);
        let candidate_peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

        let gen_engine = Arc::clone(&cookie_engine);
        let gen_peer = Arc::clone(&candidate_peer);
        builder.set_cookie_generate_cb(move |_ssl, cookie_buf| {
            let Some(peer) = *gen_peer.lock().unwrap() else {
                warn!("cookie generate callback invoked with no candidate peer set");
                return Err(openssl::error::ErrorStack::get());
            };
            let cookie = gen_engine.generate(peer);
            let n = cookie.len().min(cookie_buf.len());
            cookie_buf[..n].copy_from_slice(&cookie[..n]);
            Ok(n)
        });

        let verify_engine = Arc::clone(&cookie_engine);
        let verify_peer = Arc::clone(&candidate_peer);
        builder.set_cookie_verify_cb(move |_ssl, presented| {
            match *verify_peer.lock().unwrap() {
                Some(peer) => verify_engine.verify(peer, presented),
                None => {
                    warn!("cookie verify callback invoked with no candidate peer set");
                    false
                }
            }
        });

        Ok(Context {
            role: params.role,
            cert_reqs: params.cert_reqs,
            ssl_context: builder.build(),
            cookie_engine,
            candidate_peer,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn cert_reqs(&self) -> CertReqs {
        self.cert_reqs
    }

    pub(crate) fn set_candidate_peer(&self, addr: SocketAddr) {
        *self.candidate_peer.lock().unwrap() = Some(addr);
    }
}

fn default_cert_reqs() -> i32 {
    CertReqs::None as i32
}

fn default_ciphers() -> String {
    "DEFAULT".to_string()
}

/// File-loadable convenience wrapper around [`ContextParams`]. `Context`
/// itself is always constructed programmatically (§6.2's constructor
/// contract); this type exists for applications that prefer to keep
/// role/cert paths/cipher list/`cert_reqs` in a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub server_side: bool,
    pub keyfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub ca_certs: Option<PathBuf>,
    #[serde(default = "default_cert_reqs")]
    pub cert_reqs: i32,
    #[serde(default = "default_ciphers")]
    pub ciphers: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            server_side: false,
            keyfile: None,
            certfile: None,
            ca_certs: None,
            cert_reqs: default_cert_reqs(),
            ciphers: default_ciphers(),
        }
    }
}

impl ContextConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::Config(format!("invalid context config: {e}")))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(Error::Io)?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("failed to serialize context config: {e}")))
    }

    /// Validate and build a [`Context`], mapping the `i32` `cert_reqs`
    /// encoding to [`CertReqs`] first.
    pub fn build(&self) -> Result<Context, Error> {
        let role = if self.server_side { Role::Server } else { Role::Client };
        let cert_reqs = CertReqs::from_i32(self.cert_reqs)?;
        Context::new(ContextParams {
            role,
            keyfile: self.keyfile.as_deref(),
            certfile: self.certfile.as_deref(),
            ca_certs: self.ca_certs.as_deref(),
            cert_reqs,
            ciphers: Some(&self.ciphers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_with_no_cert_reqs_is_valid() {
        let ctx = Context::new(ContextParams {
            role: Role::Client,
            keyfile: None,
            certfile: None,
            ca_certs: None,
            cert_reqs: CertReqs::None,
            ciphers: None,
        });
        assert!(ctx.is_ok());
    }

    #[test]
    fn required_without_trust_anchors_fails() {
        let err = Context::new(ContextParams {
            role: Role::Client,
            keyfile: None,
            certfile: None,
            ca_certs: None,
            cert_reqs: CertReqs::Required,
            ciphers: None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::NoTrustAnchors));
    }

    #[test]
    fn server_without_cert_fails() {
        let err = Context::new(ContextParams {
            role: Role::Server,
            keyfile: None,
            certfile: None,
            ca_certs: None,
            cert_reqs: CertReqs::None,
            ciphers: None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::ServerRequiresKeyAndCert));
    }

    #[test]
    fn keyfile_without_certfile_fails() {
        let err = Context::new(ContextParams {
            role: Role::Client,
            keyfile: Some(Path::new("/tmp/does-not-matter.key")),
            certfile: None,
            ca_certs: None,
            cert_reqs: CertReqs::None,
            ciphers: None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::BothKeyAndCertRequired));
    }

    #[test]
    fn cert_reqs_from_i32_rejects_out_of_range() {
        assert!(CertReqs::from_i32(3).is_err());
        assert!(CertReqs::from_i32(0).is_ok());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = ContextConfig::default();
        let s = cfg.to_toml_string().unwrap();
        let back = ContextConfig::from_toml_str(&s).unwrap();
        assert_eq!(back.server_side, cfg.server_side);
        assert_eq!(back.cert_reqs, cfg.cert_reqs);
        assert_eq!(back.ciphers, cfg.ciphers);
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let cfg = ContextConfig::from_toml_str("server_side = false\n").unwrap();
        assert_eq!(cfg.cert_reqs, CertReqs::None as i32);
        assert_eq!(cfg.ciphers, "DEFAULT");
    }

    #[test]
    fn missing_file_returns_config_error() {
        let err = ContextConfig::from_toml_file("/nonexistent/path/context.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
