//! Conversion between host-address tuples and `SocketAddr`.
//!
//! The original C binding marshalled between `sockaddr_in`/`sockaddr_in6`
//! and Python tuples by hand; `std::net::SocketAddr` already carries the
//! same fields (including IPv6 `flowinfo`/`scope_id`), so this module is a
//! thin, explicit seam rather than real marshalling work.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::Error;

/// A peer address in either of the two shapes applications pass around:
/// a 2-tuple for IPv4, a 4-tuple (with flow label and scope id) for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrTuple {
    V4 { host: Ipv4Addr, port: u16 },
    V6 {
        host: Ipv6Addr,
        port: u16,
        flowinfo: u32,
        scope_id: u32,
    },
}

/// Stateless encode/decode pair between [`AddrTuple`] and `SocketAddr`.
pub struct AddrCodec;

impl AddrCodec {
    /// Encode a tuple into the storage representation the crypto library
    /// expects. Fails with [`Error::UnsupportedAddressFamily`] only when the
    /// platform cannot represent the requested family at all.
    pub fn encode(tuple: AddrTuple) -> Result<SocketAddr, Error> {
        match tuple {
            AddrTuple::V4 { host, port } => Ok(SocketAddr::V4(SocketAddrV4::new(host, port))),
            AddrTuple::V6 {
                host,
                port,
                flowinfo,
                scope_id,
            } => {
                if !ipv6_supported() {
                    return Err(Error::UnsupportedAddressFamily);
                }
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    host, port, flowinfo, scope_id,
                )))
            }
        }
    }

    /// Inverse of [`Self::encode`]. Always succeeds: a `SocketAddr` already
    /// in hand necessarily came from a family the platform supports.
    pub fn decode(addr: SocketAddr) -> AddrTuple {
        match addr {
            SocketAddr::V4(v4) => AddrTuple::V4 {
                host: *v4.ip(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => AddrTuple::V6 {
                host: *v6.ip(),
                port: v6.port(),
                flowinfo: v6.flowinfo(),
                scope_id: v6.scope_id(),
            },
        }
    }
}

/// Whether this process can open IPv6 datagram sockets. Cheap and cached
/// after first use; only matters on the handful of platforms that ship
/// without an IPv6 stack compiled in.
fn ipv6_supported() -> bool {
    use std::net::UdpSocket;
    use std::sync::OnceLock;
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| UdpSocket::bind("[::1]:0").is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trips() {
        let tuple = AddrTuple::V4 {
            host: Ipv4Addr::new(192, 0, 2, 1),
            port: 4433,
        };
        let encoded = AddrCodec::encode(tuple).unwrap();
        assert_eq!(AddrCodec::decode(encoded), tuple);
    }

    #[test]
    fn v6_round_trips_when_supported() {
        if !ipv6_supported() {
            return;
        }
        let tuple = AddrTuple::V6 {
            host: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            port: 4433,
            flowinfo: 0,
            scope_id: 0,
        };
        let encoded = AddrCodec::encode(tuple).unwrap();
        assert_eq!(AddrCodec::decode(encoded), tuple);
    }

    #[test]
    fn decode_is_inverse_of_encode_for_v4() {
        let addr: SocketAddr = "203.0.113.7:9000".parse().unwrap();
        let tuple = AddrCodec::decode(addr);
        assert_eq!(AddrCodec::encode(tuple).unwrap(), addr);
    }
}
