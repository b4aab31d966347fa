//! Minimal DTLS echo client: connects, sends one message, reads the reply.

use std::net::UdpSocket;
use std::sync::Arc;

use dtls_peer::{CertReqs, Context, ContextParams, PeerAssociation, Role};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let server_addr: std::net::SocketAddr = std::env::args()
        .nth(1)
        .expect("usage: dtls-echo-client <server-addr>")
        .parse()?;

    let context = Arc::new(Context::new(ContextParams {
        role: Role::Client,
        keyfile: None,
        certfile: None,
        ca_certs: None,
        cert_reqs: CertReqs::None,
        ciphers: None,
    })?);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let mut assoc = PeerAssociation::client(socket, context, true)?;
    assoc.connect(server_addr, true)?;
    tracing::info!(cipher = ?assoc.cipher().map(|c| c.name), "handshake complete");

    assoc.write(b"ping")?;
    let mut buf = [0u8; 2048];
    let n = assoc.read(&mut buf)?;
    tracing::info!(reply = %String::from_utf8_lossy(&buf[..n]), "got reply");

    assoc.shutdown()?;
    Ok(())
}
