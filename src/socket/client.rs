//! Outbound connection establishment.
//!
//! [`SocketClient`] ties the resolver, the multiplexer, the transport
//! context cache and (optionally) the uplinks pool into one connect call:
//! pool acquisition first when reuse is allowed, otherwise resolve on a
//! worker thread (the OS resolver blocks), race the candidates, queued
//! connect, then the TLS handshake retry loop when peer verification is
//! requested. Every failure path closes the socket and returns any charged
//! uplink slot before the callback sees the error.

use crate::base::neterror::NetError;
use crate::dns::{HostResolver, ResolverRole, RACE_TIMEOUT};
use crate::reactor::multiplexer::Multiplexer;
use crate::socket::address::Protocol;
use crate::socket::stream::{Promise, Socket};
use crate::socket::uplinks::{PoolAcquire, UplinksPool};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tls")]
use crate::tls::context::{TlsOptions, TransportContextCache};

pub type ConnectCallback = Box<dyn FnOnce(Result<Socket, NetError>) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Certificate chain verification depth; negative means plain TCP.
    pub verify_peers: i32,
    /// Try the uplinks pool before connecting, and allow `disconnect` to
    /// return the socket there.
    pub reuse: bool,
    /// Applied to the connect and handshake phases; cleared once the
    /// connection is established. Zero means untimed.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            verify_peers: -1,
            reuse: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

pub struct SocketClient {
    mux: Arc<Multiplexer>,
    resolver: Arc<HostResolver>,
    #[cfg(feature = "tls")]
    tls_cache: Arc<TransportContextCache>,
    uplinks: Option<Arc<UplinksPool>>,
}

impl SocketClient {
    pub fn new(
        mux: Arc<Multiplexer>,
        resolver: Arc<HostResolver>,
        uplinks: Option<Arc<UplinksPool>>,
    ) -> Arc<Self> {
        mux.activate();
        Arc::new(Self {
            mux,
            resolver,
            #[cfg(feature = "tls")]
            tls_cache: TransportContextCache::new(),
            uplinks,
        })
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    #[cfg(feature = "tls")]
    pub fn transport_contexts(&self) -> &Arc<TransportContextCache> {
        &self.tls_cache
    }

    /// Pool key for a target; `disconnect` must use the same one.
    pub fn pool_key(host: &str, service: &str) -> String {
        format!("{host}:{service}")
    }

    /// Connects to `host:service`. The callback receives the connected
    /// (and, when requested, secured) socket or the first hard error.
    pub fn connect(
        self: &Arc<Self>,
        host: &str,
        service: &str,
        opts: ConnectOptions,
        cb: impl FnOnce(Result<Socket, NetError>) + Send + 'static,
    ) {
        let cb: ConnectCallback = Box::new(cb);
        let host = host.to_string();
        let service = service.to_string();
        match (&self.uplinks, opts.reuse) {
            (Some(pool), true) => {
                let key = Self::pool_key(&host, &service);
                let client = Arc::clone(self);
                let pool_key = key.clone();
                pool.pop_connection_queued(&pool_key, move |acquire| match acquire {
                    PoolAcquire::Reused(socket) => cb(Ok(socket)),
                    PoolAcquire::Fresh => {
                        client.connect_fresh(host, service, opts, Some(key), cb)
                    }
                });
            }
            _ => self.connect_fresh(host, service, opts, None, cb),
        }
    }

    pub fn connect_promise(
        self: &Arc<Self>,
        host: &str,
        service: &str,
        opts: ConnectOptions,
    ) -> Promise<Result<Socket, NetError>> {
        let (tx, promise) = Promise::pair();
        self.connect(host, service, opts, move |result| {
            let _ = tx.send(result);
        });
        promise
    }

    /// Hands a finished connection back. With reuse policy and an open
    /// socket it returns to the uplinks pool; otherwise it is closed and
    /// the charged slot released.
    pub fn disconnect(self: &Arc<Self>, host: &str, service: &str, socket: Socket, reusable: bool) {
        let key = Self::pool_key(host, service);
        match &self.uplinks {
            Some(pool) if reusable && socket.is_open() => pool.push_connection(&key, socket),
            Some(pool) => {
                let _ = socket.close(&self.mux);
                pool.release_slot(&key);
            }
            None => {
                let _ = socket.close(&self.mux);
            }
        }
    }

    fn connect_fresh(
        self: &Arc<Self>,
        host: String,
        service: String,
        opts: ConnectOptions,
        slot_key: Option<String>,
        cb: ConnectCallback,
    ) {
        let client = Arc::clone(self);
        self.mux.scheduler().spawn(move || {
            let addresses = match client.resolver.lookup(
                &host,
                &service,
                ResolverRole::Connect,
                Protocol::Tcp,
            ) {
                Ok(addresses) => addresses,
                Err(err) => return client.fail(slot_key, cb, err),
            };

            if addresses.len() > 1 {
                match HostResolver::race_connect(&addresses, RACE_TIMEOUT) {
                    Ok((socket, _winner)) => {
                        client.secure_phase(socket, host, opts, slot_key, cb)
                    }
                    Err(err) => client.fail(slot_key, cb, err),
                }
                return;
            }

            let addr = addresses[0].clone();
            let socket = match Socket::new_tcp(addr.domain()) {
                Ok(socket) => socket,
                Err(err) => return client.fail(slot_key, cb, err),
            };
            if !opts.connect_timeout.is_zero() {
                socket.set_timeout(opts.connect_timeout);
            }
            let sock = socket.clone();
            let inner = Arc::clone(&client);
            socket.connect_queued(&client.mux, &addr, move |result| match result {
                Ok(()) => inner.secure_phase(sock, host, opts, slot_key, cb),
                Err(err) => {
                    let _ = sock.shutdown(&inner.mux);
                    inner.fail(slot_key, cb, err);
                }
            });
        });
    }

    #[cfg(feature = "tls")]
    fn secure_phase(
        self: &Arc<Self>,
        socket: Socket,
        host: String,
        opts: ConnectOptions,
        slot_key: Option<String>,
        cb: ConnectCallback,
    ) {
        if opts.verify_peers < 0 {
            socket.set_timeout(Duration::ZERO);
            return cb(Ok(socket));
        }
        let context = match self.tls_cache.create_client_context(
            opts.verify_peers,
            &TlsOptions::default(),
            None,
        ) {
            Ok(context) => context,
            Err(err) => {
                let _ = socket.shutdown(&self.mux);
                return self.fail(slot_key, cb, err);
            }
        };
        if let Err(err) = socket.secure_client(&context, Some(&host)) {
            self.tls_cache.free_client_context(context);
            let _ = socket.shutdown(&self.mux);
            return self.fail(slot_key, cb, err);
        }
        let client = Arc::clone(self);
        let sock = socket.clone();
        socket.handshake_queued(&self.mux, move |result| {
            client.tls_cache.free_client_context(context);
            match result {
                Ok(()) => {
                    sock.set_timeout(Duration::ZERO);
                    cb(Ok(sock));
                }
                Err(err) => {
                    let _ = sock.shutdown(&client.mux);
                    client.fail(slot_key, cb, err);
                }
            }
        });
    }

    #[cfg(not(feature = "tls"))]
    fn secure_phase(
        self: &Arc<Self>,
        socket: Socket,
        _host: String,
        opts: ConnectOptions,
        slot_key: Option<String>,
        cb: ConnectCallback,
    ) {
        if opts.verify_peers < 0 {
            socket.set_timeout(Duration::ZERO);
            return cb(Ok(socket));
        }
        let _ = socket.shutdown(&self.mux);
        self.fail(slot_key, cb, NetError::TlsNotSupported);
    }

    fn fail(&self, slot_key: Option<String>, cb: ConnectCallback, err: NetError) {
        if let (Some(key), Some(pool)) = (slot_key, &self.uplinks) {
            pool.release_slot(&key);
        }
        tracing::debug!(error = %err, "connect failed");
        cb(Err(err));
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.mux.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{ReadinessBackend, Scheduler};
    use std::net::TcpListener;

    fn client(uplinks_budget: Option<usize>) -> Arc<SocketClient> {
        let mux = Multiplexer::new(ReadinessBackend::new().unwrap(), Scheduler::new(2));
        let uplinks = uplinks_budget.map(|n| UplinksPool::new(Arc::clone(&mux), n));
        SocketClient::new(mux, HostResolver::new(), uplinks)
    }

    #[test]
    fn test_plain_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            use std::io::{Read, Write};
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let client = client(None);
        let socket = client
            .connect_promise(
                "127.0.0.1",
                &addr.port().to_string(),
                ConnectOptions::default(),
            )
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();

        let mux = Arc::clone(client.multiplexer());
        let written = socket
            .write_promise(&mux, b"ping".to_vec())
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(written, 4);
        let echoed = socket
            .read_promise(&mux, 16)
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(echoed, b"ping");
        server.join().unwrap();
        let _ = socket.close(&mux);
    }

    #[test]
    fn test_unresolvable_host_fails() {
        let client = client(None);
        let result = client
            .connect_promise(
                "does-not-exist.invalid",
                "80",
                ConnectOptions::default(),
            )
            .wait_timeout(Duration::from_secs(10))
            .unwrap();
        assert!(matches!(result, Err(NetError::NameNotResolved)));
    }

    #[test]
    fn test_reuse_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = std::thread::spawn(move || {
            let mut held = Vec::new();
            while let Ok((conn, _)) = listener.accept() {
                held.push(conn);
            }
        });

        let client = client(Some(2));
        let service = addr.port().to_string();
        let opts = ConnectOptions {
            reuse: true,
            ..ConnectOptions::default()
        };

        let socket = client
            .connect_promise("127.0.0.1", &service, opts)
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        let id = socket.id();
        client.disconnect("127.0.0.1", &service, socket, true);

        // Second connect reuses the pooled socket instead of dialing.
        let socket = client
            .connect_promise("127.0.0.1", &service, opts)
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(socket.id(), id);
        client.disconnect("127.0.0.1", &service, socket, false);
    }
}
