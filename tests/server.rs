//! Server lifecycle tests over real loopback connections.

use reactnet::reactor::{ReadinessBackend, Scheduler};
use reactnet::server::{
    ConnectionHandler, ListenerConfig, RouterConfig, ServerConfig, ServerConnection, SocketServer,
};
use reactnet::dns::HostResolver;
use reactnet::Multiplexer;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

/// Reads one LF-terminated line and echoes it back, then yields the
/// connection for another exchange.
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

fn start_server(config: ServerConfig) -> (Arc<SocketServer>, std::net::SocketAddr) {
    let mux = Multiplexer::new(ReadinessBackend::new().unwrap(), Scheduler::new(4));
    let server = SocketServer::new(mux, HostResolver::new(), config, Arc::new(EchoHandler));
    server
        .configure(RouterConfig {
            listeners: vec![ListenerConfig {
                host: "127.0.0.1".into(),
                service: "0".into(),
                tls: None,
            }],
            tls: vec![],
        })
        .unwrap();
    server.listen().unwrap();
    let addr = server.listener_addresses()[0].as_socket().unwrap();
    (server, addr)
}

fn send_line(stream: &mut TcpStream, line: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(line)?;
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "closed",
            ));
        }
        reply.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(reply);
        }
    }
}

#[test]
fn test_echo_round_trip() {
    let (server, addr) = start_server(ServerConfig::default());
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let reply = send_line(&mut stream, b"hello server\n").unwrap();
    assert_eq!(reply, b"hello server\n");
    drop(stream);
    server.unlisten(false);
}

#[test]
fn test_keep_alive_budget_closes_after_three_exchanges() {
    let (server, addr) = start_server(ServerConfig {
        keep_alive_max_count: 3,
        ..ServerConfig::default()
    });
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for i in 0..3 {
        let line = format!("exchange {i}\n");
        let reply = send_line(&mut stream, line.as_bytes()).unwrap();
        assert_eq!(reply, line.as_bytes());
    }
    // Budget exhausted: the server closes instead of serving a fourth.
    let result = send_line(&mut stream, b"one too many\n");
    assert!(result.is_err() || result.unwrap().is_empty());
    server.unlisten(false);
}

#[test]
fn test_capacity_refusal_is_immediate() {
    let (server, addr) = start_server(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    });
    let mut first = TcpStream::connect(addr).unwrap();
    first
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let reply = send_line(&mut first, b"held\n").unwrap();
    assert_eq!(reply, b"held\n");

    // The first connection still holds its keep-alive slot, so the second
    // one is refused rather than queued.
    let mut second = TcpStream::connect(addr).unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 8];
    let outcome = second.read(&mut buf);
    assert!(matches!(outcome, Ok(0) | Err(_)));
    server.unlisten(false);
}

#[test]
fn test_unlisten_aborts_and_returns_to_idle() {
    let (server, addr) = start_server(ServerConfig {
        shutdown_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    });
    // Park a connection mid-exchange.
    let mut held = TcpStream::connect(addr).unwrap();
    held.write_all(b"no newline yet").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(server.active_connections(), 1);

    server.unlisten(false);
    assert_eq!(server.active_connections(), 0);

    // Idle again: a fresh listen cycle works.
    server.listen().unwrap();
    let addr = server.listener_addresses()[0].as_socket().unwrap();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let reply = send_line(&mut stream, b"back\n").unwrap();
    assert_eq!(reply, b"back\n");
    server.unlisten(false);
}
