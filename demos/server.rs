//! Minimal DTLS echo server: accepts one peer, echoes whatever it reads
//! back, then shuts the association down cleanly.

use std::net::UdpSocket;
use std::sync::Arc;

use dtls_peer::{CertReqs, Context, ContextParams, Listener, Role};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let certfile = std::env::args().nth(1).expect("usage: dtls-echo-server <cert.pem> <key.pem>");
    let keyfile = std::env::args().nth(2).expect("usage: dtls-echo-server <cert.pem> <key.pem>");

    let context = Arc::new(Context::new(ContextParams {
        role: Role::Server,
        keyfile: Some(std::path::Path::new(&keyfile)),
        certfile: Some(std::path::Path::new(&certfile)),
        ca_certs: None,
        cert_reqs: CertReqs::None,
        ciphers: None,
    })?);

    let socket = UdpSocket::bind("127.0.0.1:0")?;
    tracing::info!(addr = %socket.local_addr()?, "listening");

    let listener = Listener::new(socket, context, true)?;
    let mut assoc = listener.accept()?;
    tracing::info!(peer = %assoc.peer_addr(), "accepted peer");

    let mut buf = [0u8; 2048];
    let n = assoc.read(&mut buf)?;
    tracing::info!(bytes = n, "echoing back");
    assoc.write(&buf[..n])?;

    assoc.shutdown()?;
    Ok(())
}
