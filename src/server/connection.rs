//! Server-side connection object.
//!
//! A [`ServerConnection`] outlives any one TCP connection: the server keeps
//! finished objects in an idle pool and migrates a freshly accepted socket
//! into one, so steady-state accept does not allocate. Per-exchange
//! metadata is reset between keep-alive exchanges; everything is cleared
//! when the object is recycled.

use crate::socket::address::SocketAddress;
use crate::socket::stream::Socket;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

pub struct ServerConnection {
    socket: Mutex<Option<Socket>>,
    peer: Mutex<Option<SocketAddress>>,
    opened_at: Mutex<Option<Instant>>,
    aborted: AtomicBool,
    /// Exchanges this connection may still serve, including the current one.
    remaining_reuses: AtomicU32,
    /// Exchanges served across the object's lifetime, surviving recycling.
    exchanges_total: AtomicU64,
}

impl ServerConnection {
    pub(crate) fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            peer: Mutex::new(None),
            opened_at: Mutex::new(None),
            aborted: AtomicBool::new(false),
            remaining_reuses: AtomicU32::new(0),
            exchanges_total: AtomicU64::new(0),
        }
    }

    /// Migrates an accepted socket in and arms the reuse budget.
    pub(crate) fn adopt(&self, socket: Socket, peer: SocketAddress, reuses: u32) {
        *self.socket.lock() = Some(socket);
        *self.peer.lock() = Some(peer);
        *self.opened_at.lock() = Some(Instant::now());
        self.aborted.store(false, Ordering::Release);
        self.remaining_reuses.store(reuses, Ordering::Release);
    }

    pub fn socket(&self) -> Option<Socket> {
        self.socket.lock().clone()
    }

    pub fn peer(&self) -> Option<SocketAddress> {
        self.peer.lock().clone()
    }

    pub fn opened_at(&self) -> Option<Instant> {
        *self.opened_at.lock()
    }

    pub fn exchanges_total(&self) -> u64 {
        self.exchanges_total.load(Ordering::Relaxed)
    }

    /// Marks the connection for teardown; the next `next()` finalizes it.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Consumes one exchange from the reuse budget; true when another
    /// exchange may follow.
    pub(crate) fn consume_reuse(&self) -> bool {
        self.exchanges_total.fetch_add(1, Ordering::Relaxed);
        loop {
            let current = self.remaining_reuses.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .remaining_reuses
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return current > 1;
            }
        }
    }

    /// Between keep-alive exchanges: the socket stays, timestamps restart.
    pub(crate) fn reset_exchange(&self) {
        *self.opened_at.lock() = Some(Instant::now());
    }

    pub(crate) fn take_socket(&self) -> Option<Socket> {
        self.socket.lock().take()
    }

    /// Clears connection state for return to the idle pool.
    pub(crate) fn recycle(&self) {
        *self.socket.lock() = None;
        *self.peer.lock() = None;
        *self.opened_at.lock() = None;
        self.aborted.store(false, Ordering::Release);
        self.remaining_reuses.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::address::Protocol;

    #[test]
    fn test_reuse_budget_counts_down() {
        let conn = ServerConnection::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _remote = std::net::TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        conn.adopt(
            Socket::from_std_stream(stream).unwrap(),
            SocketAddress::from_std(peer, Protocol::Tcp),
            3,
        );

        // Three exchanges: two more allowed after the first and second.
        assert!(conn.consume_reuse());
        assert!(conn.consume_reuse());
        assert!(!conn.consume_reuse());
        assert_eq!(conn.exchanges_total(), 3);

        conn.recycle();
        assert!(conn.socket().is_none());
        assert!(!conn.consume_reuse());
    }

    #[test]
    fn test_abort_flag() {
        let conn = ServerConnection::new();
        assert!(!conn.is_aborted());
        conn.abort();
        assert!(conn.is_aborted());
        conn.recycle();
        assert!(!conn.is_aborted());
    }
}
