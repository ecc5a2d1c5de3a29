//! Uplinks pool: connection reuse toward upstream peers.
//!
//! Connections are pooled per peer-address identity. Each key carries an
//! outstanding-socket budget (`max_duplicates`): a pop hands back an idle
//! socket, or a `Fresh` grant when budget is left, or queues the caller
//! until a slot frees. While idle, every socket is watched with a one-byte
//! `MSG_PEEK` probe so a peer-initiated close (or protocol garbage) evicts
//! it instead of poisoning the next borrower.
//!
//! Lock discipline: decide under the map guard, act after dropping it.
//! Callbacks and multiplexer calls never run under the map lock.

use crate::base::neterror::NetError;
use crate::reactor::multiplexer::{Multiplexer, SocketEvent};
use crate::socket::stream::Socket;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// What a pop handed back.
pub enum PoolAcquire {
    /// A pooled connection, already connected (and possibly secured); its
    /// idle watch has been cancelled.
    Reused(Socket),
    /// No idle connection; a budget slot has been charged and the caller
    /// must connect, then `push_connection` or `release_slot` eventually.
    Fresh,
}

pub type AcquireCallback = Box<dyn FnOnce(PoolAcquire) + Send + 'static>;

#[derive(Default)]
struct UplinkEntry {
    idle: VecDeque<Socket>,
    waiters: VecDeque<AcquireCallback>,
    /// Charged budget slots: in-use plus idle sockets.
    outstanding: usize,
}

enum PopAction {
    Reuse(Socket),
    Fresh,
    Queued,
}

pub struct UplinksPool {
    mux: Arc<Multiplexer>,
    max_duplicates: usize,
    // The waiter queue holds FnOnce boxes, so the map sits behind one
    // mutex rather than a sharded concurrent map.
    entries: Mutex<HashMap<String, UplinkEntry>>,
}

impl UplinksPool {
    pub fn new(mux: Arc<Multiplexer>, max_duplicates: usize) -> Arc<Self> {
        Arc::new(Self {
            mux,
            max_duplicates: max_duplicates.max(1),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn max_duplicates(&self) -> usize {
        self.max_duplicates
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.idle.len())
    }

    pub fn outstanding(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.outstanding)
    }

    /// Acquires a connection for `key`. The callback fires inline with
    /// `Reused`/`Fresh`, or later when a queued acquisition is granted.
    pub fn pop_connection_queued(
        self: &Arc<Self>,
        key: &str,
        cb: impl FnOnce(PoolAcquire) + Send + 'static,
    ) {
        let mut cb: AcquireCallback = Box::new(cb);
        let action = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_default();
            if let Some(socket) = entry.idle.pop_front() {
                PopAction::Reuse(socket)
            } else if entry.outstanding < self.max_duplicates {
                entry.outstanding += 1;
                PopAction::Fresh
            } else {
                entry.waiters.push_back(cb);
                cb = Box::new(|_| {});
                PopAction::Queued
            }
        };
        match action {
            PopAction::Reuse(socket) => {
                // Silent cancel: the watch must not observe its own removal.
                self.mux.cancel_events(&socket, SocketEvent::Finish);
                tracing::debug!(key, token = socket.id(), "uplink reused");
                cb(PoolAcquire::Reused(socket));
            }
            PopAction::Fresh => {
                tracing::debug!(key, "uplink slot granted");
                cb(PoolAcquire::Fresh);
            }
            PopAction::Queued => {
                tracing::debug!(key, "uplink acquisition queued");
            }
        }
    }

    /// Returns a connection to the pool. A queued acquirer is served
    /// directly; otherwise the socket goes idle under a close-probe watch.
    /// With no budget slot left for idling, the socket is closed instead.
    pub fn push_connection(self: &Arc<Self>, key: &str, socket: Socket) {
        enum PushAction {
            HandOff(AcquireCallback, Socket),
            Idle(Socket),
            Overflow(Socket),
        }
        let action = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_default();
            if let Some(waiter) = entry.waiters.pop_front() {
                PushAction::HandOff(waiter, socket)
            } else if entry.idle.len() < self.max_duplicates {
                entry.idle.push_back(socket.clone());
                PushAction::Idle(socket)
            } else {
                entry.outstanding = entry.outstanding.saturating_sub(1);
                PushAction::Overflow(socket)
            }
        };
        match action {
            PushAction::HandOff(waiter, socket) => {
                tracing::debug!(key, token = socket.id(), "uplink handed to waiter");
                waiter(PoolAcquire::Reused(socket));
            }
            PushAction::Idle(socket) => {
                self.arm_idle_watch(key.to_string(), socket);
            }
            PushAction::Overflow(socket) => {
                tracing::debug!(key, token = socket.id(), "uplink pool full, closing");
                let _ = socket.shutdown(&self.mux);
                self.grant_waiter_if_possible(key);
            }
        }
    }

    /// Returns a charged budget slot without a socket: a fresh connect
    /// failed, or the borrower closed the connection instead of returning
    /// it. May grant a queued acquirer.
    pub fn release_slot(self: &Arc<Self>, key: &str) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.outstanding = entry.outstanding.saturating_sub(1);
        }
        self.grant_waiter_if_possible(key);
    }

    fn grant_waiter_if_possible(self: &Arc<Self>, key: &str) {
        let granted = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            if !entry.waiters.is_empty() && entry.outstanding < self.max_duplicates {
                entry.outstanding += 1;
                entry.waiters.pop_front()
            } else {
                None
            }
        };
        if let Some(waiter) = granted {
            tracing::debug!(key, "queued uplink acquisition granted");
            waiter(PoolAcquire::Fresh);
        }
    }

    fn arm_idle_watch(self: &Arc<Self>, key: String, socket: Socket) {
        let pool = Arc::clone(self);
        let probe = socket.clone();
        let watch_key = key.clone();
        let result = self.mux.when_readable(
            &socket,
            Box::new(move |event| match event {
                SocketEvent::Ready => {
                    let mut byte = [0u8; 1];
                    match probe.peek(&mut byte) {
                        // Spurious wakeup, still idle and quiet.
                        Err(NetError::WouldBlock) => pool.arm_idle_watch(watch_key, probe),
                        // EOF, error, or data nobody asked for.
                        _ => pool.evict_idle(&watch_key, &probe),
                    }
                }
                SocketEvent::Finish | SocketEvent::Superseded => {}
                SocketEvent::Timeout | SocketEvent::Reset => pool.evict_idle(&watch_key, &probe),
            }),
        );
        if result.is_err() {
            self.evict_idle(&key, &socket);
        }
    }

    fn evict_idle(self: &Arc<Self>, key: &str, socket: &Socket) {
        let removed = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            match entry.idle.iter().position(|s| s == socket) {
                Some(pos) => {
                    entry.idle.remove(pos);
                    entry.outstanding = entry.outstanding.saturating_sub(1);
                    true
                }
                // Raced with a reuse; the borrower owns it now.
                None => false,
            }
        };
        if removed {
            tracing::debug!(key, token = socket.id(), "idle uplink evicted");
            let _ = socket.shutdown(&self.mux);
            self.grant_waiter_if_possible(key);
        }
    }
}
