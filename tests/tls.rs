//! End-to-end TLS: certificate builder → TLS listener → nonblocking
//! client handshake → echo over the secured stream.

#![cfg(feature = "tls")]

use reactnet::dns::HostResolver;
use reactnet::reactor::{ReadinessBackend, Scheduler};
use reactnet::server::{
    ConnectionHandler, ListenerConfig, RouterConfig, ServerConfig, ServerConnection, SocketServer,
    TlsBlob,
};
use reactnet::socket::{Protocol, Socket, SocketAddress};
use reactnet::tls::{CertificateBuilder, TlsOptions, TransportContextCache};
use reactnet::Multiplexer;
use std::sync::Arc;
use std::time::Duration;

struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_open(&self, server: &Arc<SocketServer>, conn: Arc<ServerConnection>) {
        let Some(socket) = conn.socket() else {
            return server.finalize(conn);
        };
        let mux = Arc::clone(server.multiplexer());
        let server = Arc::clone(server);
        let write_sock = socket.clone();
        let write_mux = Arc::clone(&mux);
        socket.read_until_queued(&mux, b"\n", 4096, move |result| match result {
            Ok(mut line) => {
                line.push(b'\n');
                write_sock.write_queued(&write_mux, line, move |result| match result {
                    Ok(_) => server.next(conn),
                    Err(_) => {
                        conn.abort();
                        server.finalize(conn);
                    }
                });
            }
            Err(_) => {
                conn.abort();
                server.finalize(conn);
            }
        });
    }
}

#[test]
fn test_tls_echo_round_trip() {
    let pair = CertificateBuilder::self_signed("localhost", "127.0.0.1", "localhost").unwrap();

    let mux = Multiplexer::new(ReadinessBackend::new().unwrap(), Scheduler::new(4));
    let server = SocketServer::new(
        Arc::clone(&mux),
        HostResolver::new(),
        ServerConfig::default(),
        Arc::new(EchoHandler),
    );
    server
        .configure(RouterConfig {
            listeners: vec![ListenerConfig {
                host: "127.0.0.1".into(),
                service: "0".into(),
                tls: Some("front".into()),
            }],
            tls: vec![TlsBlob {
                name: "front".into(),
                cert_pem: String::from_utf8(pair.cert_pem).unwrap(),
                key_pem: String::from_utf8(pair.key_pem).unwrap(),
                verify_depth: -1,
                ciphers: None,
                min_version: Some("1.2".into()),
                max_version: None,
            }],
        })
        .unwrap();
    server.listen().unwrap();
    let addr = server.listener_addresses()[0].as_socket().unwrap();

    // Client: plain connect, then a no-verify handshake against the
    // self-signed listener.
    let target = SocketAddress::from_std(addr, Protocol::Tcp);
    let socket = Socket::new_tcp(target.domain()).unwrap();
    socket
        .connect_promise(&mux, &target)
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    let cache = TransportContextCache::new();
    let context = cache
        .create_client_context(-1, &TlsOptions::default(), None)
        .unwrap();
    socket.secure_client(&context, Some("localhost")).unwrap();
    assert!(socket.is_handshaking());

    let (tx, rx) = flume::bounded(1);
    socket.handshake_queued(&mux, move |result| {
        let _ = tx.send(result);
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(socket.is_secured());
    cache.free_client_context(context);

    socket
        .write_promise(&mux, b"over tls\n".to_vec())
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    let reply = socket
        .read_until_promise(&mux, b"\n", 4096)
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"over tls");

    socket.close(&mux).unwrap();
    server.unlisten(false);
}
