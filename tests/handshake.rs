mod common;

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use dtls_peer::{CertReqs, Context, ContextParams, Listener, PeerAssociation, Role};

fn server_context(certfile: &std::path::Path, keyfile: &std::path::Path) -> Arc<Context> {
    Arc::new(
        Context::new(ContextParams {
            role: Role::Server,
            keyfile: Some(keyfile),
            certfile: Some(certfile),
            ca_certs: None,
            cert_reqs: CertReqs::None,
            ciphers: None,
        })
        .unwrap(),
    )
}

fn client_context() -> Arc<Context> {
    Arc::new(
        Context::new(ContextParams {
            role: Role::Client,
            keyfile: None,
            certfile: None,
            ca_certs: None,
            cert_reqs: CertReqs::None,
            ciphers: None,
        })
        .unwrap(),
    )
}

#[test]
fn basic_client_server_exchange() {
    let tmp = tempfile::tempdir().unwrap();
    let (certfile, keyfile) = common::self_signed_cert_pair(tmp.path());

    let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let listener = Listener::new(server_socket, server_context(&certfile, &keyfile), true).unwrap();
    listener.set_socket_timeout(Some(Duration::from_secs(5)));

    let server_thread = std::thread::spawn(move || {
        let mut assoc = listener.accept().unwrap();
        assert!(assoc.cipher().is_some());
        let mut buf = [0u8; 16];
        let n = assoc.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assoc.write(b"pong").unwrap();
    });

    let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut client = PeerAssociation::client(client_socket, client_context(), true).unwrap();
    client.set_socket_timeout(Some(Duration::from_secs(5)));
    client.connect(server_addr, true).unwrap();
    assert!(client.cipher().is_some());

    client.write(b"ping").unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");

    server_thread.join().unwrap();
}

#[test]
fn multiplexed_peers_see_only_their_own_traffic() {
    let tmp = tempfile::tempdir().unwrap();
    let (certfile, keyfile) = common::self_signed_cert_pair(tmp.path());

    let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let listener = Arc::new(Listener::new(server_socket, server_context(&certfile, &keyfile), true).unwrap());
    listener.set_socket_timeout(Some(Duration::from_secs(5)));

    let server_thread = {
        let listener = Arc::clone(&listener);
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let mut assoc = listener.accept().unwrap();
                let mut buf = [0u8; 16];
                let n = assoc.read(&mut buf).unwrap();
                seen.push((assoc.peer_addr(), buf[..n].to_vec()));
            }
            seen
        })
    };

    let mut clients = Vec::new();
    for tag in [b"one-".as_slice(), b"two-".as_slice()] {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut client = PeerAssociation::client(socket, client_context(), true).unwrap();
        client.set_socket_timeout(Some(Duration::from_secs(5)));
        client.connect(server_addr, true).unwrap();
        client.write(tag).unwrap();
        clients.push(client);
    }

    let seen = server_thread.join().unwrap();
    assert_eq!(seen.len(), 2);
    let peers: std::collections::HashSet<_> = seen.iter().map(|(addr, _)| *addr).collect();
    assert_eq!(peers.len(), 2, "each accepted association must see a distinct peer");
}

#[test]
fn bidirectional_shutdown_yields_plaintext_facades() {
    let tmp = tempfile::tempdir().unwrap();
    let (certfile, keyfile) = common::self_signed_cert_pair(tmp.path());

    let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let listener = Listener::new(server_socket, server_context(&certfile, &keyfile), true).unwrap();
    listener.set_socket_timeout(Some(Duration::from_secs(5)));

    let server_thread = std::thread::spawn(move || {
        let assoc = listener.accept().unwrap();
        let unwrapped = assoc.shutdown().unwrap();
        unwrapped.send(b"post-shutdown").unwrap();
    });

    let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut client = PeerAssociation::client(client_socket, client_context(), true).unwrap();
    client.set_socket_timeout(Some(Duration::from_secs(5)));
    client.connect(server_addr, true).unwrap();

    client.set_socket_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "peer's close-notify surfaces as an empty read");

    let unwrapped = client.shutdown().unwrap();
    let reply = unwrapped.recv(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(reply, b"post-shutdown");

    server_thread.join().unwrap();
}
