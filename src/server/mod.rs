//! The socket server.
//!
//! [`SocketServer`] runs the listener lifecycle `Idle → Working → Stopping
//! → Idle`. `configure` validates a [`router::RouterConfig`] up front and
//! fails fatally on any problem; `listen` binds every listener and arms
//! queued accepts; accepted sockets are migrated into pooled
//! [`connection::ServerConnection`] objects, optionally run through the
//! nonblocking TLS accept loop, and handed to the [`ConnectionHandler`].
//! Keep-alive reuse is budgeted per connection; `unlisten` drains or aborts
//! everything and reports leaks.

pub mod connection;
pub mod router;

pub use connection::ServerConnection;
pub use router::{ListenerConfig, RouterConfig, TlsBlob};

use crate::base::neterror::NetError;
use crate::dns::{HostResolver, ResolverRole};
use crate::reactor::multiplexer::{Multiplexer, SocketEvent};
use crate::socket::address::{Protocol, SocketAddress};
use crate::socket::stream::Socket;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tls")]
use crate::tls::context::{ServerIdentity, TlsOptions, TlsVersion, TransportContextCache};
#[cfg(feature = "tls")]
use boring::pkey::PKey;
#[cfg(feature = "tls")]
use boring::x509::X509;

/// Application hooks. `on_open` starts (or restarts, under keep-alive) one
/// exchange on the connection; the handler eventually calls
/// [`SocketServer::next`] or [`SocketServer::finalize`].
pub trait ConnectionHandler: Send + Sync {
    fn on_open(&self, server: &Arc<SocketServer>, conn: Arc<ServerConnection>);
    fn on_close(&self, _conn: &Arc<ServerConnection>) {}
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub backlog: i32,
    /// Accepted connections beyond this are refused immediately.
    pub max_connections: usize,
    /// Exchanges one connection may serve before it is closed.
    pub keep_alive_max_count: u32,
    pub shutdown_timeout: Duration,
    /// Per-socket timeout applied to accepted connections.
    pub connection_timeout: Duration,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub linger: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: 128,
            max_connections: 1024,
            keep_alive_max_count: 100,
            shutdown_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(60),
            keep_alive: true,
            no_delay: true,
            linger: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    Working,
    Stopping,
}

#[cfg(feature = "tls")]
struct ListenerSecurity {
    identity: ServerIdentity,
    verify_depth: i32,
    ciphers: Option<String>,
    options: TlsOptions,
}

#[cfg(not(feature = "tls"))]
struct ListenerSecurity;

#[derive(Clone)]
struct PendingListener {
    host: String,
    service: String,
    tls: Option<Arc<ListenerSecurity>>,
}

pub struct SocketServer {
    mux: Arc<Multiplexer>,
    resolver: Arc<HostResolver>,
    #[cfg(feature = "tls")]
    tls_cache: Arc<TransportContextCache>,
    config: ServerConfig,
    handler: Arc<dyn ConnectionHandler>,
    state: Mutex<ServerState>,
    pending: Mutex<Vec<PendingListener>>,
    listeners: Mutex<Vec<Socket>>,
    active: Mutex<Vec<Arc<ServerConnection>>>,
    idle_pool: Mutex<Vec<Arc<ServerConnection>>>,
}

impl SocketServer {
    pub fn new(
        mux: Arc<Multiplexer>,
        resolver: Arc<HostResolver>,
        config: ServerConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mux,
            resolver,
            #[cfg(feature = "tls")]
            tls_cache: TransportContextCache::new(),
            config,
            handler,
            state: Mutex::new(ServerState::Idle),
            pending: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            idle_pool: Mutex::new(Vec::new()),
        })
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    #[cfg(feature = "tls")]
    pub fn transport_contexts(&self) -> &Arc<TransportContextCache> {
        &self.tls_cache
    }

    pub fn active_connections(&self) -> usize {
        self.active.lock().len()
    }

    /// Validates and stores the router. Fatal on an empty listener list, an
    /// unknown TLS name, an unparsable certificate or key, or an unknown
    /// protocol version string.
    pub fn configure(&self, router: RouterConfig) -> Result<(), NetError> {
        if *self.state.lock() != ServerState::Idle {
            return Err(NetError::Configuration(
                "cannot reconfigure while running".into(),
            ));
        }
        if router.listeners.is_empty() {
            return Err(NetError::Configuration("no listeners configured".into()));
        }
        let mut pending = Vec::with_capacity(router.listeners.len());
        for listener in router.listeners {
            let tls = match &listener.tls {
                None => None,
                Some(name) => {
                    let blob = router
                        .tls
                        .iter()
                        .find(|b| &b.name == name)
                        .ok_or_else(|| {
                            NetError::Configuration(format!("unknown TLS configuration '{name}'"))
                        })?;
                    Some(Arc::new(Self::security_from(blob)?))
                }
            };
            pending.push(PendingListener {
                host: listener.host,
                service: listener.service,
                tls,
            });
        }
        *self.pending.lock() = pending;
        Ok(())
    }

    #[cfg(feature = "tls")]
    fn security_from(blob: &TlsBlob) -> Result<ListenerSecurity, NetError> {
        X509::from_pem(blob.cert_pem.as_bytes()).map_err(|_| {
            NetError::Configuration(format!("unparsable certificate in '{}'", blob.name))
        })?;
        PKey::private_key_from_pem(blob.key_pem.as_bytes()).map_err(|_| {
            NetError::Configuration(format!("unparsable private key in '{}'", blob.name))
        })?;
        let options = TlsOptions {
            min_version: Self::parse_version(&blob.min_version, &blob.name)?,
            max_version: Self::parse_version(&blob.max_version, &blob.name)?,
        };
        Ok(ListenerSecurity {
            identity: ServerIdentity {
                cert_pem: blob.cert_pem.clone().into_bytes(),
                key_pem: blob.key_pem.clone().into_bytes(),
            },
            verify_depth: blob.verify_depth,
            ciphers: blob.ciphers.clone(),
            options,
        })
    }

    #[cfg(feature = "tls")]
    fn parse_version(
        version: &Option<String>,
        blob_name: &str,
    ) -> Result<Option<TlsVersion>, NetError> {
        match version.as_deref() {
            None => Ok(None),
            Some("1.0") => Ok(Some(TlsVersion::Tls10)),
            Some("1.1") => Ok(Some(TlsVersion::Tls11)),
            Some("1.2") => Ok(Some(TlsVersion::Tls12)),
            Some("1.3") => Ok(Some(TlsVersion::Tls13)),
            Some(other) => Err(NetError::Configuration(format!(
                "unknown TLS version '{other}' in '{blob_name}'"
            ))),
        }
    }

    #[cfg(not(feature = "tls"))]
    fn security_from(_blob: &TlsBlob) -> Result<ListenerSecurity, NetError> {
        Err(NetError::TlsNotSupported)
    }

    /// Binds every configured listener and starts accepting.
    pub fn listen(self: &Arc<Self>) -> Result<(), NetError> {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Idle {
                return Err(NetError::Configuration("server is not idle".into()));
            }
            *state = ServerState::Working;
        }
        let pending = self.pending.lock().clone();
        if pending.is_empty() {
            *self.state.lock() = ServerState::Idle;
            return Err(NetError::Configuration("no listeners configured".into()));
        }

        let mut bound: Vec<(Socket, Option<Arc<ListenerSecurity>>)> = Vec::new();
        for listener in pending {
            let result = self
                .resolver
                .lookup(
                    &listener.host,
                    &listener.service,
                    ResolverRole::Bind,
                    Protocol::Tcp,
                )
                .and_then(|addrs| Socket::open_listener(&addrs[0], self.config.backlog));
            match result {
                Ok(socket) => {
                    if let Ok(addr) = socket.local_address() {
                        tracing::info!(address = %addr, "listening");
                    }
                    bound.push((socket, listener.tls));
                }
                Err(err) => {
                    for (socket, _) in bound {
                        let _ = socket.shutdown(&self.mux);
                    }
                    *self.state.lock() = ServerState::Idle;
                    return Err(err);
                }
            }
        }

        *self.listeners.lock() = bound.iter().map(|(s, _)| s.clone()).collect();
        self.mux.activate();
        for (socket, tls) in bound {
            self.arm_accept(socket, tls);
        }
        Ok(())
    }

    /// Addresses actually bound, for tests and for port-0 listeners.
    pub fn listener_addresses(&self) -> Vec<SocketAddress> {
        self.listeners
            .lock()
            .iter()
            .filter_map(|s| s.local_address().ok())
            .collect()
    }

    fn arm_accept(self: &Arc<Self>, listener: Socket, tls: Option<Arc<ListenerSecurity>>) {
        let server = Arc::clone(self);
        let accept_socket = listener.clone();
        let _ = self.mux.when_readable(
            &listener,
            Box::new(move |event| {
                if event != SocketEvent::Ready {
                    return; // listener torn down
                }
                loop {
                    match accept_socket.accept() {
                        Ok((socket, peer)) => server.admit(socket, peer, tls.clone()),
                        Err(NetError::WouldBlock) => break,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            break;
                        }
                    }
                }
                if accept_socket.is_open() {
                    server.arm_accept(accept_socket, tls);
                }
            }),
        );
    }

    fn admit(
        self: &Arc<Self>,
        socket: Socket,
        peer: SocketAddress,
        tls: Option<Arc<ListenerSecurity>>,
    ) {
        if *self.state.lock() != ServerState::Working {
            let _ = socket.shutdown(&self.mux);
            return;
        }
        if let Err(err) = socket.set_stream_options(
            self.config.keep_alive,
            self.config.no_delay,
            self.config.linger,
        ) {
            tracing::warn!(error = %err, "stream options failed");
            let _ = socket.shutdown(&self.mux);
            return;
        }
        socket.set_timeout(self.config.connection_timeout);

        let conn = self
            .idle_pool
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(ServerConnection::new()));
        conn.adopt(socket.clone(), peer.clone(), self.config.keep_alive_max_count);

        // At capacity the connection is refused right here, never queued.
        let refused = {
            let mut active = self.active.lock();
            if active.len() >= self.config.max_connections {
                true
            } else {
                active.push(Arc::clone(&conn));
                false
            }
        };
        if refused {
            tracing::debug!(peer = %peer, "connection refused: at capacity");
            let _ = socket.shutdown(&self.mux);
            conn.recycle();
            self.idle_pool.lock().push(conn);
            return;
        }

        match tls {
            None => self.open(conn),
            Some(security) => self.secure_admit(socket, conn, security),
        }
    }

    #[cfg(feature = "tls")]
    fn secure_admit(
        self: &Arc<Self>,
        socket: Socket,
        conn: Arc<ServerConnection>,
        security: Arc<ListenerSecurity>,
    ) {
        let context = match self.tls_cache.create_server_context(
            security.verify_depth,
            &security.options,
            security.ciphers.as_deref(),
            &security.identity,
        ) {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(error = %err, "server transport context failed");
                return self.finalize(conn);
            }
        };
        if let Err(err) = socket.secure_server(&context) {
            tracing::warn!(error = %err, "tls attach failed");
            self.tls_cache.free_server_context(context);
            return self.finalize(conn);
        }
        let server = Arc::clone(self);
        socket.handshake_queued(&self.mux, move |result| {
            server.tls_cache.free_server_context(context);
            match result {
                Ok(()) => server.open(conn),
                Err(err) => {
                    tracing::debug!(error = %err, "tls accept failed");
                    server.finalize(conn);
                }
            }
        });
    }

    #[cfg(not(feature = "tls"))]
    fn secure_admit(
        self: &Arc<Self>,
        _socket: Socket,
        conn: Arc<ServerConnection>,
        _security: Arc<ListenerSecurity>,
    ) {
        // configure() rejects TLS listeners without the feature.
        self.finalize(conn);
    }

    fn open(self: &Arc<Self>, conn: Arc<ServerConnection>) {
        let server = Arc::clone(self);
        let handler = Arc::clone(&self.handler);
        self.mux.scheduler().spawn(move || {
            handler.on_open(&server, conn);
        });
    }

    /// One exchange finished. Reuse budget left, not aborted, not stopping
    /// → reset per-exchange state and re-enter the open hook; otherwise the
    /// connection is finalized.
    pub fn next(self: &Arc<Self>, conn: Arc<ServerConnection>) {
        let stopping = *self.state.lock() == ServerState::Stopping;
        if conn.consume_reuse() && !conn.is_aborted() && !stopping {
            conn.reset_exchange();
            self.open(conn);
        } else {
            self.finalize(conn);
        }
    }

    /// Closes the connection and recycles its object into the idle pool.
    pub fn finalize(self: &Arc<Self>, conn: Arc<ServerConnection>) {
        self.handler.on_close(&conn);
        let aborted = conn.is_aborted();
        if let Some(socket) = conn.take_socket() {
            let result = if aborted {
                socket.shutdown(&self.mux)
            } else {
                socket.close(&self.mux)
            };
            if let Err(err) = result {
                tracing::debug!(error = %err, "connection close failed");
            }
        }
        {
            let mut active = self.active.lock();
            if let Some(pos) = active.iter().position(|c| Arc::ptr_eq(c, &conn)) {
                active.swap_remove(pos);
            }
        }
        conn.recycle();
        let mut idle = self.idle_pool.lock();
        if idle.len() < self.config.backlog as usize {
            idle.push(conn);
        }
    }

    /// Stops accepting, aborts or drains active connections, waits up to
    /// the shutdown timeout, reports leaks, and returns to idle.
    pub fn unlisten(&self, graceful: bool) {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Working {
                return;
            }
            *state = ServerState::Stopping;
        }
        let listeners: Vec<Socket> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            let _ = listener.shutdown(&self.mux);
        }

        let snapshot: Vec<Arc<ServerConnection>> = self.active.lock().clone();
        for conn in &snapshot {
            conn.abort();
            if !graceful {
                if let Some(socket) = conn.socket() {
                    // Reset pending callbacks so handlers observe the abort.
                    let _ = socket.shutdown(&self.mux);
                }
            }
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while Instant::now() < deadline {
            if self.active.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let leaked: Vec<Arc<ServerConnection>> = self.active.lock().drain(..).collect();
        if !leaked.is_empty() {
            tracing::warn!(count = leaked.len(), "connections leaked past shutdown");
            for conn in &leaked {
                if let Some(socket) = conn.take_socket() {
                    let _ = socket.shutdown(&self.mux);
                }
            }
        }
        *self.state.lock() = ServerState::Idle;
        self.mux.deactivate();
        tracing::info!("server stopped");
    }
}
