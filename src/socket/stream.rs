//! The nonblocking socket handle.
//!
//! [`Socket`] is a cheaply clonable handle owning at most one OS descriptor
//! and at most one TLS session, plus the two callback slots the multiplexer
//! drives. Core operations come in three forms:
//!
//! - *direct*: returns the value, [`NetError::WouldBlock`], or a hard error;
//! - *queued*: on would-block, registers a multiplexer callback and resumes
//!   the operation when it fires;
//! - *promise*: the queued form delivering into a [`Promise`], consumable
//!   either blocking or as a future.
//!
//! `close` performs a graceful half-close and drains remaining input for a
//! bounded interval before releasing the descriptor; `shutdown` tears down
//! immediately. Both cancel any multiplexer registration first, and the
//! descriptor is released exactly once.

use crate::base::neterror::NetError;
use crate::reactor::multiplexer::{EventState, Multiplexer, SocketEvent};
use crate::reactor::Token;
use crate::socket::address::{Protocol, SocketAddress};
use parking_lot::Mutex;
use socket2::{Domain, Type};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tls")]
use crate::tls::context::TransportContext;
#[cfg(feature = "tls")]
use boring::ssl::{ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslStream};

/// Bound on the input drain performed by a graceful close.
const GRACEFUL_DRAIN_MS: u64 = 500;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>, NetError>) + Send + 'static>;
pub type WriteCallback = Box<dyn FnOnce(Result<usize, NetError>) + Send + 'static>;
pub type DoneCallback = Box<dyn FnOnce(Result<(), NetError>) + Send + 'static>;

/// Outcome of one TLS handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    WantRead,
    WantWrite,
}

/// Non-owning byte stream over a raw descriptor, used to hand the
/// descriptor to the TLS library without giving up ownership.
#[cfg(feature = "tls")]
#[derive(Debug)]
pub(crate) struct FdStream {
    fd: RawFd,
}

#[cfg(feature = "tls")]
impl io::Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n =
            unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(feature = "tls")]
impl io::Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                send_flags(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn send_flags() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(target_os = "linux"))]
fn send_flags() -> libc::c_int {
    0
}

enum Transport {
    Plain,
    #[cfg(feature = "tls")]
    Pending { ssl: Box<Ssl>, server: bool },
    #[cfg(feature = "tls")]
    Handshaking(MidHandshakeSslStream<FdStream>),
    #[cfg(feature = "tls")]
    Secured(SslStream<FdStream>),
}

struct IoState {
    fd: Option<socket2::Socket>,
    transport: Transport,
    /// Bytes read off the wire but not yet consumed (delimiter overshoot).
    pushback: Vec<u8>,
}

struct SocketInner {
    id: Token,
    io: Mutex<IoState>,
    events: Mutex<EventState>,
    /// Milliseconds; 0 means untimed.
    timeout_ms: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Socket {}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("fd", &self.raw_fd())
            .field("bytes_read", &self.bytes_read())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

impl Socket {
    fn wrap(sock: socket2::Socket) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                io: Mutex::new(IoState {
                    fd: Some(sock),
                    transport: Transport::Plain,
                    pushback: Vec::new(),
                }),
                events: Mutex::new(EventState::default()),
                timeout_ms: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
        }
    }

    /// Fresh nonblocking TCP socket for the given address family.
    pub fn new_tcp(domain: Domain) -> Result<Self, NetError> {
        let sock = socket2::Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))
            .map_err(NetError::from_os)?;
        sock.set_nonblocking(true).map_err(NetError::from_os)?;
        Ok(Self::wrap(sock))
    }

    /// Bound, listening, nonblocking socket.
    pub fn open_listener(addr: &SocketAddress, backlog: i32) -> Result<Self, NetError> {
        let sock = socket2::Socket::new(addr.domain(), Type::STREAM, Some(socket2::Protocol::TCP))
            .map_err(NetError::from_os)?;
        sock.set_reuse_address(true).map_err(NetError::from_os)?;
        sock.set_nonblocking(true).map_err(NetError::from_os)?;
        sock.bind(addr.raw()).map_err(NetError::from_os)?;
        sock.listen(backlog).map_err(NetError::from_os)?;
        Ok(Self::wrap(sock))
    }

    /// Adopts an accepted or externally created descriptor.
    pub(crate) fn from_socket2(sock: socket2::Socket) -> Self {
        Self::wrap(sock)
    }

    /// Adopts a connected standard-library stream (tests, embedders).
    pub fn from_std_stream(stream: std::net::TcpStream) -> Result<Self, NetError> {
        stream.set_nonblocking(true).map_err(NetError::from_os)?;
        Ok(Self::wrap(socket2::Socket::from(stream)))
    }

    pub fn id(&self) -> Token {
        self.inner.id
    }

    pub(crate) fn event_state(&self) -> &Mutex<EventState> {
        &self.inner.events
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.inner.io.lock().fd.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn is_open(&self) -> bool {
        self.inner.io.lock().fd.is_some()
    }

    /// Per-socket timeout, re-armed each time interest is registered with
    /// the multiplexer. `Duration::ZERO` means untimed.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.inner.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn local_address(&self) -> Result<SocketAddress, NetError> {
        let io = self.inner.io.lock();
        let sock = io.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
        let addr = sock.local_addr().map_err(NetError::from_os)?;
        Ok(SocketAddress::new(addr, Protocol::Tcp, None))
    }

    pub fn peer_address(&self) -> Result<SocketAddress, NetError> {
        let io = self.inner.io.lock();
        let sock = io.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
        let addr = sock.peer_addr().map_err(NetError::from_os)?;
        Ok(SocketAddress::new(addr, Protocol::Tcp, None))
    }

    /// Applies the per-connection stream options the server sets on accept.
    pub fn set_stream_options(
        &self,
        keep_alive: bool,
        no_delay: bool,
        linger: Option<Duration>,
    ) -> Result<(), NetError> {
        let io = self.inner.io.lock();
        let sock = io.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
        sock.set_keepalive(keep_alive).map_err(NetError::from_os)?;
        sock.set_nodelay(no_delay).map_err(NetError::from_os)?;
        sock.set_linger(linger).map_err(NetError::from_os)?;
        Ok(())
    }

    // -- direct forms -------------------------------------------------------

    /// Nonblocking read. Pushed-back bytes are returned before the wire is
    /// touched. Zero bytes from the peer surfaces as [`NetError::Closed`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut io = self.inner.io.lock();
        if !io.pushback.is_empty() {
            let n = buf.len().min(io.pushback.len());
            buf[..n].copy_from_slice(&io.pushback[..n]);
            io.pushback.drain(..n);
            // Counted when it first came off the wire.
            return Ok(n);
        }
        let n = io.read_raw(buf)?;
        self.inner.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Nonblocking write of as much of `buf` as the kernel accepts.
    pub fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut io = self.inner.io.lock();
        let n = io.write_raw(buf)?;
        self.inner
            .bytes_written
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Nonblocking, non-destructive peek at pending input. The uplinks pool
    /// uses this to detect peer-initiated close while a socket sits idle.
    pub fn peek(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        let io = self.inner.io.lock();
        if !io.pushback.is_empty() {
            let n = buf.len().min(io.pushback.len());
            buf[..n].copy_from_slice(&io.pushback[..n]);
            return Ok(n);
        }
        let sock = io.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
        let n = unsafe {
            libc::recv(
                sock.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_PEEK,
            )
        };
        if n < 0 {
            return Err(NetError::from_errno());
        }
        if n == 0 {
            return Err(NetError::Closed);
        }
        Ok(n as usize)
    }

    /// Returns overshoot bytes to the front of the read path.
    pub(crate) fn push_back(&self, bytes: &[u8]) {
        self.inner.io.lock().pushback.extend_from_slice(bytes);
    }

    /// Nonblocking connect. `EINPROGRESS` surfaces as would-block; the
    /// queued form awaits writeability and then checks the socket error
    /// state to distinguish success from refusal.
    pub fn connect(&self, addr: &SocketAddress) -> Result<(), NetError> {
        let io = self.inner.io.lock();
        let sock = io.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
        match sock.connect(addr.raw()) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Err(NetError::WouldBlock),
            Err(e) if e.raw_os_error() == Some(libc::EISCONN) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(NetError::WouldBlock),
            Err(e) => Err(NetError::from_os(e)),
        }
    }

    pub(crate) fn connect_outcome(&self) -> Result<(), NetError> {
        let io = self.inner.io.lock();
        let sock = io.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
        match sock.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(NetError::from_os(err)),
            Err(err) => Err(NetError::from_os(err)),
        }
    }

    /// Accepts one pending connection on a listening socket.
    pub fn accept(&self) -> Result<(Socket, SocketAddress), NetError> {
        let io = self.inner.io.lock();
        let sock = io.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
        let (accepted, peer) = sock.accept().map_err(NetError::from_os)?;
        accepted.set_nonblocking(true).map_err(NetError::from_os)?;
        Ok((
            Socket::from_socket2(accepted),
            SocketAddress::new(peer, Protocol::Tcp, None),
        ))
    }

    // -- queued forms -------------------------------------------------------

    pub fn connect_queued(
        &self,
        mux: &Arc<Multiplexer>,
        addr: &SocketAddress,
        cb: impl FnOnce(Result<(), NetError>) + Send + 'static,
    ) {
        match self.connect(addr) {
            Ok(()) => cb(Ok(())),
            Err(NetError::WouldBlock) => {
                let sock = self.clone();
                let _ = mux.when_writeable(
                    self,
                    Box::new(move |event| match event {
                        SocketEvent::Ready => cb(sock.connect_outcome()),
                        other => cb(Err(event_error(other))),
                    }),
                );
            }
            Err(err) => cb(Err(err)),
        }
    }

    /// Reads up to `max_len` bytes, suspending on would-block.
    pub fn read_queued(
        &self,
        mux: &Arc<Multiplexer>,
        max_len: usize,
        cb: impl FnOnce(Result<Vec<u8>, NetError>) + Send + 'static,
    ) {
        resume_read(self.clone(), Arc::clone(mux), max_len, Box::new(cb));
    }

    /// Writes all of `data`, suspending on would-block, and reports the
    /// total byte count.
    pub fn write_queued(
        &self,
        mux: &Arc<Multiplexer>,
        data: Vec<u8>,
        cb: impl FnOnce(Result<usize, NetError>) + Send + 'static,
    ) {
        resume_write(self.clone(), Arc::clone(mux), data, 0, Box::new(cb));
    }

    /// Byte-at-a-time delimiter read; see [`ReadUntil`].
    pub fn read_until_queued(
        &self,
        mux: &Arc<Multiplexer>,
        delimiter: &[u8],
        max_len: usize,
        cb: impl FnOnce(Result<Vec<u8>, NetError>) + Send + 'static,
    ) {
        let state = ReadUntil::new(delimiter, max_len);
        resume_read_until(self.clone(), Arc::clone(mux), state, Box::new(cb));
    }

    /// Chunked variant of [`Socket::read_until_queued`]; overshoot past the
    /// delimiter is pushed back for the next read.
    pub fn read_until_chunked_queued(
        &self,
        mux: &Arc<Multiplexer>,
        delimiter: &[u8],
        chunk: usize,
        max_len: usize,
        cb: impl FnOnce(Result<Vec<u8>, NetError>) + Send + 'static,
    ) {
        let state = ReadUntil::chunked(delimiter, chunk, max_len);
        resume_read_until(self.clone(), Arc::clone(mux), state, Box::new(cb));
    }

    // -- promise forms ------------------------------------------------------

    pub fn connect_promise(
        &self,
        mux: &Arc<Multiplexer>,
        addr: &SocketAddress,
    ) -> Promise<Result<(), NetError>> {
        let (tx, promise) = Promise::pair();
        self.connect_queued(mux, addr, move |result| {
            let _ = tx.send(result);
        });
        promise
    }

    pub fn read_promise(
        &self,
        mux: &Arc<Multiplexer>,
        max_len: usize,
    ) -> Promise<Result<Vec<u8>, NetError>> {
        let (tx, promise) = Promise::pair();
        self.read_queued(mux, max_len, move |result| {
            let _ = tx.send(result);
        });
        promise
    }

    pub fn write_promise(
        &self,
        mux: &Arc<Multiplexer>,
        data: Vec<u8>,
    ) -> Promise<Result<usize, NetError>> {
        let (tx, promise) = Promise::pair();
        self.write_queued(mux, data, move |result| {
            let _ = tx.send(result);
        });
        promise
    }

    pub fn read_until_promise(
        &self,
        mux: &Arc<Multiplexer>,
        delimiter: &[u8],
        max_len: usize,
    ) -> Promise<Result<Vec<u8>, NetError>> {
        let (tx, promise) = Promise::pair();
        self.read_until_queued(mux, delimiter, max_len, move |result| {
            let _ = tx.send(result);
        });
        promise
    }

    // -- TLS ---------------------------------------------------------------

    /// Attaches a client-side TLS session. Does not perform the handshake;
    /// drive it with [`Socket::handshake_step`] or
    /// [`Socket::handshake_queued`].
    #[cfg(feature = "tls")]
    pub fn secure_client(
        &self,
        context: &TransportContext,
        hostname: Option<&str>,
    ) -> Result<(), NetError> {
        self.secure(context, hostname, false)
    }

    /// Server-side counterpart of [`Socket::secure_client`].
    #[cfg(feature = "tls")]
    pub fn secure_server(&self, context: &TransportContext) -> Result<(), NetError> {
        self.secure(context, None, true)
    }

    #[cfg(feature = "tls")]
    fn secure(
        &self,
        context: &TransportContext,
        hostname: Option<&str>,
        server: bool,
    ) -> Result<(), NetError> {
        let mut io = self.inner.io.lock();
        if io.fd.is_none() {
            return Err(NetError::AlreadyClosed);
        }
        if !matches!(io.transport, Transport::Plain) {
            return Err(NetError::Tls("session already attached".into()));
        }
        let mut ssl = Ssl::new(context.context())?;
        if let Some(host) = hostname {
            // SNI must not carry IP literals.
            if host.parse::<std::net::IpAddr>().is_err() {
                ssl.set_hostname(host)?;
            }
        }
        io.transport = Transport::Pending {
            ssl: Box::new(ssl),
            server,
        };
        Ok(())
    }

    /// Advances the TLS handshake by one step. On a plain or already
    /// established socket this reports `Complete` immediately, so callers
    /// can drive it unconditionally.
    pub fn handshake_step(&self) -> Result<HandshakeStatus, NetError> {
        #[cfg(not(feature = "tls"))]
        {
            Ok(HandshakeStatus::Complete)
        }
        #[cfg(feature = "tls")]
        {
            let mut io = self.inner.io.lock();
            let fd = io
                .fd
                .as_ref()
                .map(|s| s.as_raw_fd())
                .ok_or(NetError::AlreadyClosed)?;
            let result = match std::mem::replace(&mut io.transport, Transport::Plain) {
                Transport::Plain => return Ok(HandshakeStatus::Complete),
                Transport::Secured(stream) => {
                    io.transport = Transport::Secured(stream);
                    return Ok(HandshakeStatus::Complete);
                }
                Transport::Pending { ssl, server } => {
                    let stream = FdStream { fd };
                    if server {
                        (*ssl).accept(stream)
                    } else {
                        (*ssl).connect(stream)
                    }
                }
                Transport::Handshaking(mid) => mid.handshake(),
            };
            match result {
                Ok(stream) => {
                    io.transport = Transport::Secured(stream);
                    Ok(HandshakeStatus::Complete)
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    let status = if mid.error().code() == ErrorCode::WANT_WRITE {
                        HandshakeStatus::WantWrite
                    } else {
                        HandshakeStatus::WantRead
                    };
                    io.transport = Transport::Handshaking(mid);
                    Ok(status)
                }
                Err(HandshakeError::Failure(mid)) => Err(NetError::Tls(mid.error().to_string())),
                Err(HandshakeError::SetupFailure(stack)) => Err(NetError::Tls(stack.to_string())),
            }
        }
    }

    /// Runs the handshake to completion, re-arming on want-read/want-write.
    pub fn handshake_queued(
        &self,
        mux: &Arc<Multiplexer>,
        cb: impl FnOnce(Result<(), NetError>) + Send + 'static,
    ) {
        resume_handshake(self.clone(), Arc::clone(mux), Box::new(cb));
    }

    pub fn is_secured(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            matches!(self.inner.io.lock().transport, Transport::Secured(_))
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    pub fn is_handshaking(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            matches!(
                self.inner.io.lock().transport,
                Transport::Pending { .. } | Transport::Handshaking(_)
            )
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    // -- teardown ----------------------------------------------------------

    /// Graceful close: cancel registration, TLS close-notify and TCP
    /// half-close, then drain remaining input for a bounded interval before
    /// releasing the descriptor. The drain deliberately blocks the caller.
    pub fn close(&self, mux: &Multiplexer) -> Result<(), NetError> {
        mux.cancel_events(self, SocketEvent::Finish);
        let mut io = self.inner.io.lock();
        let sock = io.fd.take().ok_or(NetError::AlreadyClosed)?;
        io.pushback.clear();
        #[cfg(feature = "tls")]
        if let Transport::Secured(mut stream) =
            std::mem::replace(&mut io.transport, Transport::Plain)
        {
            let _ = stream.shutdown();
        }
        let _ = sock.shutdown(std::net::Shutdown::Write);
        drain_input(sock.as_raw_fd(), Duration::from_millis(GRACEFUL_DRAIN_MS));
        tracing::debug!(token = self.id(), "socket closed");
        Ok(())
    }

    /// Immediate teardown without the graceful drain. Pending callbacks are
    /// notified with a reset event.
    pub fn shutdown(&self, mux: &Multiplexer) -> Result<(), NetError> {
        mux.cancel_events(self, SocketEvent::Reset);
        let mut io = self.inner.io.lock();
        let sock = io.fd.take().ok_or(NetError::AlreadyClosed)?;
        io.pushback.clear();
        io.transport = Transport::Plain;
        drop(sock);
        tracing::debug!(token = self.id(), "socket shut down");
        Ok(())
    }
}

impl IoState {
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        match &mut self.transport {
            Transport::Plain => {
                let sock = self.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
                let n = unsafe {
                    libc::recv(
                        sock.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    return Err(NetError::from_errno());
                }
                if n == 0 {
                    return Err(NetError::Closed);
                }
                Ok(n as usize)
            }
            #[cfg(feature = "tls")]
            Transport::Secured(stream) => match stream.ssl_read(buf) {
                Ok(0) => Err(NetError::Closed),
                Ok(n) => Ok(n),
                Err(err) => Err(map_ssl_error(err)),
            },
            #[cfg(feature = "tls")]
            Transport::Pending { .. } | Transport::Handshaking(_) => Err(NetError::NotConnected),
        }
    }

    fn write_raw(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        match &mut self.transport {
            Transport::Plain => {
                let sock = self.fd.as_ref().ok_or(NetError::AlreadyClosed)?;
                let n = unsafe {
                    libc::send(
                        sock.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        send_flags(),
                    )
                };
                if n < 0 {
                    return Err(NetError::from_errno());
                }
                Ok(n as usize)
            }
            #[cfg(feature = "tls")]
            Transport::Secured(stream) => match stream.ssl_write(buf) {
                Ok(n) => Ok(n),
                Err(err) => Err(map_ssl_error(err)),
            },
            #[cfg(feature = "tls")]
            Transport::Pending { .. } | Transport::Handshaking(_) => Err(NetError::NotConnected),
        }
    }
}

#[cfg(feature = "tls")]
fn map_ssl_error(err: boring::ssl::Error) -> NetError {
    match err.code() {
        ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => NetError::WouldBlock,
        ErrorCode::ZERO_RETURN => NetError::Closed,
        ErrorCode::SYSCALL => match err.io_error() {
            Some(ioe) if ioe.kind() == io::ErrorKind::WouldBlock => NetError::WouldBlock,
            Some(ioe) => NetError::from_os(io::Error::new(ioe.kind(), ioe.to_string())),
            // Peer vanished mid-record.
            None => NetError::Closed,
        },
        _ => NetError::Tls(err.to_string()),
    }
}

fn event_error(event: SocketEvent) -> NetError {
    match event {
        SocketEvent::Timeout => NetError::TimedOut,
        SocketEvent::Reset => NetError::Reset,
        SocketEvent::Ready | SocketEvent::Superseded | SocketEvent::Finish => NetError::Canceled,
    }
}

fn resume_read(socket: Socket, mux: Arc<Multiplexer>, max_len: usize, cb: ReadCallback) {
    let mut buf = vec![0u8; max_len];
    match socket.read(&mut buf) {
        Ok(n) => {
            buf.truncate(n);
            cb(Ok(buf));
        }
        Err(NetError::WouldBlock) => {
            let sock = socket.clone();
            let m = Arc::clone(&mux);
            let _ = mux.when_readable(
                &socket,
                Box::new(move |event| match event {
                    SocketEvent::Ready => resume_read(sock, m, max_len, cb),
                    other => cb(Err(event_error(other))),
                }),
            );
        }
        Err(err) => cb(Err(err)),
    }
}

fn resume_write(
    socket: Socket,
    mux: Arc<Multiplexer>,
    data: Vec<u8>,
    mut written: usize,
    cb: WriteCallback,
) {
    while written < data.len() {
        match socket.write(&data[written..]) {
            Ok(n) => written += n,
            Err(NetError::WouldBlock) => {
                let sock = socket.clone();
                let m = Arc::clone(&mux);
                let _ = mux.when_writeable(
                    &socket,
                    Box::new(move |event| match event {
                        SocketEvent::Ready => resume_write(sock, m, data, written, cb),
                        other => cb(Err(event_error(other))),
                    }),
                );
                return;
            }
            Err(err) => return cb(Err(err)),
        }
    }
    cb(Ok(written))
}

fn resume_read_until(socket: Socket, mux: Arc<Multiplexer>, mut state: ReadUntil, cb: ReadCallback) {
    match state.step(&socket) {
        Ok(payload) => cb(Ok(payload)),
        Err(NetError::WouldBlock) => {
            let sock = socket.clone();
            let m = Arc::clone(&mux);
            let _ = mux.when_readable(
                &socket,
                Box::new(move |event| match event {
                    SocketEvent::Ready => resume_read_until(sock, m, state, cb),
                    other => cb(Err(event_error(other))),
                }),
            );
        }
        Err(err) => cb(Err(err)),
    }
}

fn resume_handshake(socket: Socket, mux: Arc<Multiplexer>, cb: DoneCallback) {
    match socket.handshake_step() {
        Ok(HandshakeStatus::Complete) => cb(Ok(())),
        Ok(status) => {
            let sock = socket.clone();
            let m = Arc::clone(&mux);
            let handler: crate::reactor::EventCallback = Box::new(move |event| match event {
                SocketEvent::Ready => resume_handshake(sock, m, cb),
                other => cb(Err(event_error(other))),
            });
            let _ = match status {
                HandshakeStatus::WantWrite => mux.when_writeable(&socket, handler),
                _ => mux.when_readable(&socket, handler),
            };
        }
        Err(err) => cb(Err(err)),
    }
}

fn drain_input(fd: RawFd, budget: Duration) {
    let deadline = Instant::now() + budget;
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n == 0 {
            return; // orderly EOF
        }
        if n < 0 {
            if io::Error::last_os_error().kind() != io::ErrorKind::WouldBlock {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as i32) };
            if rc <= 0 {
                return;
            }
            continue;
        }
        if Instant::now() >= deadline {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Delimiter matching
// ---------------------------------------------------------------------------

/// Incremental matcher for an arbitrary delimiter sequence. The match index
/// carries forward across feeds, so a scan survives any number of
/// would-block suspensions. A prefix-function table keeps self-overlapping
/// delimiters (`aab`, `\r\n\r\n`) correct.
pub struct DelimiterMatcher {
    delimiter: Vec<u8>,
    failure: Vec<usize>,
    matched: usize,
}

impl DelimiterMatcher {
    pub fn new(delimiter: &[u8]) -> Self {
        debug_assert!(!delimiter.is_empty());
        let mut failure = vec![0usize; delimiter.len()];
        let mut k = 0;
        for i in 1..delimiter.len() {
            while k > 0 && delimiter[i] != delimiter[k] {
                k = failure[k - 1];
            }
            if delimiter[i] == delimiter[k] {
                k += 1;
            }
            failure[i] = k;
        }
        Self {
            delimiter: delimiter.to_vec(),
            failure,
            matched: 0,
        }
    }

    /// Feeds one byte; true when the full delimiter has just matched.
    pub fn feed(&mut self, byte: u8) -> bool {
        while self.matched > 0 && byte != self.delimiter[self.matched] {
            self.matched = self.failure[self.matched - 1];
        }
        if byte == self.delimiter[self.matched] {
            self.matched += 1;
        }
        if self.matched == self.delimiter.len() {
            self.matched = 0;
            true
        } else {
            false
        }
    }

    pub fn delimiter_len(&self) -> usize {
        self.delimiter.len()
    }

    pub fn matched(&self) -> usize {
        self.matched
    }
}

/// Resumable delimiter read. This is the direct form: `step` returns the
/// payload (without the delimiter), [`NetError::WouldBlock`] to suspend, or
/// a hard error; all scan state survives between calls. Bytes read past the
/// delimiter are pushed back onto the socket.
pub struct ReadUntil {
    matcher: DelimiterMatcher,
    collected: Vec<u8>,
    chunk: usize,
    max_len: usize,
}

impl ReadUntil {
    /// Byte-at-a-time scan.
    pub fn new(delimiter: &[u8], max_len: usize) -> Self {
        Self::chunked(delimiter, 1, max_len)
    }

    pub fn chunked(delimiter: &[u8], chunk: usize, max_len: usize) -> Self {
        Self {
            matcher: DelimiterMatcher::new(delimiter),
            collected: Vec::new(),
            chunk: chunk.max(1),
            max_len,
        }
    }

    pub fn step(&mut self, socket: &Socket) -> Result<Vec<u8>, NetError> {
        let mut buf = vec![0u8; self.chunk];
        loop {
            let n = socket.read(&mut buf)?;
            for i in 0..n {
                let byte = buf[i];
                self.collected.push(byte);
                if self.matcher.feed(byte) {
                    let payload_len = self.collected.len() - self.matcher.delimiter_len();
                    self.collected.truncate(payload_len);
                    if i + 1 < n {
                        socket.push_back(&buf[i + 1..n]);
                    }
                    return Ok(std::mem::take(&mut self.collected));
                }
            }
            if self.collected.len() > self.max_len {
                return Err(NetError::LimitExceeded);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Promise form
// ---------------------------------------------------------------------------

/// Single-delivery result of a queued operation, consumable blocking
/// (`wait`) or as a future (`recv`).
pub struct Promise<T> {
    rx: flume::Receiver<T>,
}

impl<T> Promise<T> {
    pub(crate) fn pair() -> (flume::Sender<T>, Self) {
        let (tx, rx) = flume::bounded(1);
        (tx, Self { rx })
    }

    pub fn wait(self) -> Result<T, NetError> {
        self.rx.recv().map_err(|_| NetError::Canceled)
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, NetError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            flume::RecvTimeoutError::Timeout => NetError::TimedOut,
            flume::RecvTimeoutError::Disconnected => NetError::Canceled,
        })
    }

    pub async fn recv(self) -> Result<T, NetError> {
        self.rx.recv_async().await.map_err(|_| NetError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Multiplexer, ReadinessBackend, Scheduler};
    use std::net::{TcpListener, TcpStream};

    fn mux() -> Arc<Multiplexer> {
        let scheduler = Scheduler::new(2);
        Multiplexer::new(ReadinessBackend::new().unwrap(), scheduler)
    }

    fn socket_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = TcpStream::connect(addr).unwrap();
        let (local, _) = listener.accept().unwrap();
        (Socket::from_std_stream(local).unwrap(), remote)
    }

    #[test]
    fn test_read_would_block_then_data() {
        let (socket, mut remote) = socket_pair();
        let mut buf = [0u8; 16];
        assert!(matches!(socket.read(&mut buf), Err(NetError::WouldBlock)));

        use std::io::Write;
        remote.write_all(b"hello").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(socket.bytes_read(), n as u64);
    }

    #[test]
    fn test_read_eof_is_closed() {
        let (socket, remote) = socket_pair();
        drop(remote);
        std::thread::sleep(Duration::from_millis(50));
        let mut buf = [0u8; 8];
        assert!(matches!(socket.read(&mut buf), Err(NetError::Closed)));
    }

    #[test]
    fn test_double_close_reports_already_closed() {
        let mux = mux();
        let (socket, _remote) = socket_pair();
        socket.close(&mux).unwrap();
        assert!(!socket.is_open());
        assert!(matches!(socket.close(&mux), Err(NetError::AlreadyClosed)));
        mux.scheduler().shutdown();
    }

    #[test]
    fn test_pushback_precedes_wire() {
        let (socket, mut remote) = socket_pair();
        use std::io::Write;
        remote.write_all(b"wire").unwrap();
        socket.push_back(b"push");
        std::thread::sleep(Duration::from_millis(50));
        let mut buf = [0u8; 16];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"push");
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"wire");
    }

    #[test]
    fn test_delimiter_matcher_overlap() {
        let mut m = DelimiterMatcher::new(b"aab");
        let mut hits = 0;
        for &b in b"aaab".iter() {
            if m.feed(b) {
                hits += 1;
            }
        }
        assert_eq!(hits, 1);

        let mut m = DelimiterMatcher::new(b"\r\n\r\n");
        let mut done = false;
        for &b in b"x\r\n\r\r\n\r\n".iter() {
            if m.feed(b) {
                done = true;
            }
        }
        assert!(done);
    }

    #[test]
    fn test_read_until_pushes_back_overshoot() {
        let (socket, mut remote) = socket_pair();
        use std::io::Write;
        remote.write_all(b"payload\r\nEXTRA").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut state = ReadUntil::chunked(b"\r\n", 64, 1024);
        let payload = state.step(&socket).unwrap();
        assert_eq!(payload, b"payload");

        let mut buf = [0u8; 16];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"EXTRA");
    }

    #[test]
    fn test_read_until_queued_across_suspensions() {
        let mux = mux();
        mux.activate();
        let (socket, mut remote) = socket_pair();

        let (tx, rx) = flume::bounded(1);
        socket.read_until_queued(&mux, b"||", 1 << 20, move |result| {
            let _ = tx.send(result);
        });

        use std::io::Write;
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        // Dribble the payload so the reader suspends repeatedly.
        for chunk in payload.chunks(4096) {
            remote.write_all(chunk).unwrap();
            remote.flush().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        remote.write_all(b"||").unwrap();

        let result = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        assert_eq!(result, payload);

        mux.deactivate();
        mux.scheduler().shutdown();
    }

    #[test]
    fn test_write_queued_reports_total() {
        let mux = mux();
        mux.activate();
        let (socket, mut remote) = socket_pair();

        let data = vec![7u8; 1 << 20];
        let (tx, rx) = flume::bounded(1);
        socket.write_queued(&mux, data.clone(), move |result| {
            let _ = tx.send(result);
        });

        use std::io::Read;
        let mut received = Vec::new();
        let mut buf = [0u8; 65536];
        while received.len() < data.len() {
            let n = remote.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received.len(), data.len());
        let written = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        assert_eq!(written, data.len());
        assert_eq!(socket.bytes_written(), data.len() as u64);

        mux.deactivate();
        mux.scheduler().shutdown();
    }

    #[test]
    fn test_connect_promise_refused() {
        let mux = mux();
        mux.activate();
        // Bind then drop a listener so the port is (very likely) refusing.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr = SocketAddress::try_parse("127.0.0.1", port, Protocol::Tcp).unwrap();
        let socket = Socket::new_tcp(addr.domain()).unwrap();
        let result = socket
            .connect_promise(&mux, &addr)
            .wait_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(result.is_err());
        mux.deactivate();
        mux.scheduler().shutdown();
    }

    #[test]
    fn test_cancel_clears_slots_and_timeouts() {
        let mux = mux();
        let (socket, _remote) = socket_pair();
        socket.set_timeout(Duration::from_secs(30));

        let (tx, rx) = flume::bounded(2);
        let tx2 = tx.clone();
        mux.when_readable(
            &socket,
            Box::new(move |ev| {
                let _ = tx.send(ev);
            }),
        )
        .unwrap();
        mux.when_writeable(
            &socket,
            Box::new(move |ev| {
                let _ = tx2.send(ev);
            }),
        )
        .unwrap();
        assert!(mux.is_tracked(&socket));

        mux.cancel_events(&socket, SocketEvent::Reset);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            SocketEvent::Reset
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            SocketEvent::Reset
        );
        assert!(!mux.is_tracked(&socket));
        {
            let ev = socket.event_state().lock();
            assert!(ev.read_cb.is_none());
            assert!(ev.write_cb.is_none());
            assert!(!ev.registered);
        }
        // Idempotent.
        mux.cancel_events(&socket, SocketEvent::Reset);
        mux.scheduler().shutdown();
    }

    #[test]
    fn test_timeout_fires_once() {
        let mux = mux();
        mux.activate();
        let (socket, _remote) = socket_pair();
        socket.set_timeout(Duration::from_millis(100));

        let (tx, rx) = flume::bounded(1);
        mux.when_readable(
            &socket,
            Box::new(move |ev| {
                let _ = tx.send(ev);
            }),
        )
        .unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            SocketEvent::Timeout
        );
        assert!(!mux.is_tracked(&socket));
        mux.deactivate();
        mux.scheduler().shutdown();
    }

    #[test]
    fn test_superseded_callback_notified() {
        let mux = mux();
        let (socket, _remote) = socket_pair();

        let (tx, rx) = flume::bounded(1);
        mux.when_readable(
            &socket,
            Box::new(move |ev| {
                let _ = tx.send(ev);
            }),
        )
        .unwrap();
        mux.when_readable(&socket, Box::new(|_| {})).unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            SocketEvent::Superseded
        );
        mux.cancel_events(&socket, SocketEvent::Finish);
        mux.scheduler().shutdown();
    }
}
