//! The multiplexer: readiness and timeout signals turned into callbacks.
//!
//! One multiplexer owns one readiness backend and is shared by every
//! component that suspends on socket readiness (server, client, uplinks
//! pool). Callback slots live on the socket itself, guarded by a per-socket
//! mutex so registration and cancellation on one socket are serialized
//! without contending on the multiplexer-wide bookkeeping lock.
//!
//! Locking discipline:
//! - backend registration happens under the owning socket's event lock, so
//!   no two threads can race conflicting interest for one descriptor;
//! - the multiplexer's own lock guards only the token map and timeout map,
//!   and is never held while user code runs or while a socket lock is held;
//! - callbacks are always handed to the scheduler, never invoked inline.

use crate::base::neterror::NetError;
use crate::reactor::backend::{Event, ReadinessBackend, Token};
use crate::reactor::scheduler::Scheduler;
use crate::socket::stream::Socket;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Scratch buffer size for one backend wait.
pub const MAX_EVENTS: usize = 256;

/// Dispatch tick while the self-scheduling loop is active.
const TICK_MS: i32 = 50;

/// Why a pending callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// The awaited readiness condition is (possibly) met; retry the
    /// operation and re-arm on would-block.
    Ready,
    /// A newer callback replaced this one before it fired.
    Superseded,
    /// The socket's deadline elapsed.
    Timeout,
    /// The socket is being torn down.
    Reset,
    /// Terminal cancellation: slots are cleared without being invoked.
    Finish,
}

pub type EventCallback = Box<dyn FnOnce(SocketEvent) + Send + 'static>;

/// Per-socket callback slots and registration flag. Owned by the socket,
/// driven by the multiplexer.
#[derive(Default)]
pub struct EventState {
    pub(crate) read_cb: Option<EventCallback>,
    pub(crate) write_cb: Option<EventCallback>,
    pub(crate) registered: bool,
    /// Bumped on every arm. Tracking-map removals that run after the event
    /// lock is dropped carry the generation they observed, so they cannot
    /// erase a registration armed in between.
    pub(crate) generation: u64,
}

enum Direction {
    Read,
    Write,
}

struct SocketReg {
    socket: Socket,
    deadline: Option<Instant>,
    generation: u64,
}

#[derive(Default)]
struct MuxState {
    /// All registered sockets, timed or not, keyed by token.
    sockets: HashMap<Token, SocketReg>,
    /// Absolute deadlines for sockets with a nonzero timeout.
    deadlines: BTreeMap<(Instant, Token), ()>,
}

pub struct Multiplexer {
    backend: ReadinessBackend,
    scheduler: Arc<Scheduler>,
    state: Mutex<MuxState>,
    active: AtomicUsize,
    looping: AtomicBool,
}

impl Multiplexer {
    pub fn new(backend: ReadinessBackend, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            scheduler,
            state: Mutex::new(MuxState::default()),
            active: AtomicUsize::new(0),
            looping: AtomicBool::new(false),
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Arms `cb` to fire when `socket` becomes readable. An already-present
    /// read callback is immediately scheduled with
    /// [`SocketEvent::Superseded`]. Also (re)arms the socket's timeout.
    pub fn when_readable(&self, socket: &Socket, cb: EventCallback) -> Result<(), NetError> {
        self.register(socket, cb, Direction::Read)
    }

    /// Write-interest counterpart of [`Multiplexer::when_readable`].
    pub fn when_writeable(&self, socket: &Socket, cb: EventCallback) -> Result<(), NetError> {
        self.register(socket, cb, Direction::Write)
    }

    fn register(
        &self,
        socket: &Socket,
        cb: EventCallback,
        dir: Direction,
    ) -> Result<(), NetError> {
        let Some(fd) = socket.raw_fd() else {
            // Closed underneath the caller: notify through the event path so
            // resources are released on the same code path as live sockets.
            self.scheduler.spawn(move || cb(SocketEvent::Reset));
            return Err(NetError::NotConnected);
        };
        let token = socket.id();

        let superseded;
        let backend_result;
        let generation;
        {
            let mut ev = socket.event_state().lock();
            superseded = match dir {
                Direction::Read => ev.read_cb.replace(cb),
                Direction::Write => ev.write_cb.replace(cb),
            };
            let readable = ev.read_cb.is_some();
            let writeable = ev.write_cb.is_some();
            backend_result = if ev.registered {
                self.backend.update(fd, token, readable, writeable)
            } else {
                self.backend.add(fd, token, readable, writeable)
            };
            ev.registered = backend_result.is_ok();
            ev.generation += 1;
            generation = ev.generation;
        }

        if let Some(old) = superseded {
            self.scheduler.spawn(move || old(SocketEvent::Superseded));
        }

        if let Err(err) = backend_result {
            // Registration failure is fatal for this socket.
            tracing::warn!(token, error = %err, "readiness registration failed");
            self.cancel_events(socket, SocketEvent::Reset);
            return Err(err);
        }

        let mut st = self.state.lock();
        let timeout = socket.timeout();
        let old_deadline = match st.sockets.entry(token) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let reg = e.get_mut();
                reg.generation = generation;
                reg.deadline.take()
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(SocketReg {
                    socket: socket.clone(),
                    deadline: None,
                    generation,
                });
                None
            }
        };
        if let Some(old) = old_deadline {
            st.deadlines.remove(&(old, token));
        }
        if !timeout.is_zero() {
            let deadline = Instant::now() + timeout;
            if let Some(reg) = st.sockets.get_mut(&token) {
                reg.deadline = Some(deadline);
            }
            st.deadlines.insert((deadline, token), ());
        }
        Ok(())
    }

    /// Clears both callback slots, deregisters the socket and removes its
    /// timeout entry. Unless `event` is [`SocketEvent::Finish`], the cleared
    /// callbacks are scheduled with `event` so callers can release resources
    /// deterministically. Idempotent and safe from any thread.
    pub fn cancel_events(&self, socket: &Socket, event: SocketEvent) {
        let token = socket.id();
        let (read_cb, write_cb, was_registered, generation) = {
            let mut ev = socket.event_state().lock();
            let was = std::mem::replace(&mut ev.registered, false);
            if was {
                if let Some(fd) = socket.raw_fd() {
                    let _ = self.backend.remove(fd);
                }
            }
            (ev.read_cb.take(), ev.write_cb.take(), was, ev.generation)
        };

        if was_registered {
            self.forget(token, generation);
        }

        if event != SocketEvent::Finish {
            if let Some(cb) = write_cb {
                self.scheduler.spawn(move || cb(event));
            }
            if let Some(cb) = read_cb {
                self.scheduler.spawn(move || cb(event));
            }
        }
    }

    /// One backend wait plus a timeout sweep. Returns the number of sockets
    /// whose callbacks fired. Normally driven by the activation loop; tests
    /// and embedders may call it directly.
    pub fn dispatch(&self, timeout_ms: i32) -> Result<usize, NetError> {
        let mut events: Vec<Event> = Vec::with_capacity(MAX_EVENTS);
        self.backend.wait(&mut events, MAX_EVENTS, timeout_ms)?;

        let mut fired = 0usize;
        for event in &events {
            let socket = {
                let st = self.state.lock();
                st.sockets.get(&event.token).map(|reg| reg.socket.clone())
            };
            let Some(socket) = socket else { continue };

            let mut callbacks: Vec<EventCallback> = Vec::with_capacity(2);
            let deregistered;
            let generation;
            {
                let mut ev = socket.event_state().lock();
                if !ev.registered {
                    continue;
                }
                // Write before read when both fire in one tick. A closed
                // condition releases both; the resumed operations observe
                // EOF or the socket error themselves.
                if event.writeable || event.closed {
                    if let Some(cb) = ev.write_cb.take() {
                        callbacks.push(cb);
                    }
                }
                if event.readable || event.closed {
                    if let Some(cb) = ev.read_cb.take() {
                        callbacks.push(cb);
                    }
                }
                if callbacks.is_empty() {
                    continue;
                }
                let readable = ev.read_cb.is_some();
                let writeable = ev.write_cb.is_some();
                match socket.raw_fd() {
                    Some(fd) if readable || writeable => {
                        let _ = self.backend.update(fd, event.token, readable, writeable);
                    }
                    Some(fd) => {
                        // Invariant: a registered handle has at least one
                        // callback set; once both are cleared, deregister.
                        let _ = self.backend.remove(fd);
                        ev.registered = false;
                    }
                    None => {
                        ev.registered = false;
                    }
                }
                deregistered = !ev.registered;
                generation = ev.generation;
            }
            if deregistered {
                self.forget(event.token, generation);
            }
            fired += 1;
            for cb in callbacks {
                self.scheduler.spawn(move || cb(SocketEvent::Ready));
            }
        }

        fired += self.sweep_timeouts();
        Ok(fired)
    }

    /// Drops the tracking entry for `token`, but only while it still belongs
    /// to the registration that requested the removal. A re-arm that slipped
    /// in after the event lock was dropped carries a newer generation and
    /// keeps its entry.
    fn forget(&self, token: Token, generation: u64) {
        let mut st = self.state.lock();
        if st
            .sockets
            .get(&token)
            .is_some_and(|reg| reg.generation == generation)
        {
            if let Some(reg) = st.sockets.remove(&token) {
                if let Some(deadline) = reg.deadline {
                    st.deadlines.remove(&(deadline, token));
                }
            }
        }
    }

    fn sweep_timeouts(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(Socket, u64)> = {
            let mut st = self.state.lock();
            let keys: Vec<(Instant, Token)> = st
                .deadlines
                .range(..=(now, Token::MAX))
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    st.deadlines.remove(&key);
                    st.sockets
                        .remove(&key.1)
                        .map(|reg| (reg.socket, reg.generation))
                })
                .collect()
        };

        let mut fired = 0;
        for (socket, generation) in expired {
            let (read_cb, write_cb) = {
                let mut ev = socket.event_state().lock();
                // A re-arm may have replaced the expired registration after
                // the tracking entry was removed; its deadline is managed by
                // the register path, not here.
                if !ev.registered || ev.generation != generation {
                    continue;
                }
                ev.registered = false;
                if let Some(fd) = socket.raw_fd() {
                    let _ = self.backend.remove(fd);
                }
                (ev.read_cb.take(), ev.write_cb.take())
            };
            tracing::debug!(token = socket.id(), "socket timed out");
            fired += 1;
            if let Some(cb) = write_cb {
                self.scheduler.spawn(move || cb(SocketEvent::Timeout));
            }
            if let Some(cb) = read_cb {
                self.scheduler.spawn(move || cb(SocketEvent::Timeout));
            }
        }
        fired
    }

    /// Reference-counted activation. The first activation starts the
    /// self-scheduling dispatch loop; server, client and uplinks pool each
    /// hold their own activation so they can share one multiplexer.
    pub fn activate(self: &Arc<Self>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        if !self.looping.swap(true, Ordering::AcqRel) {
            let mux = Arc::clone(self);
            self.scheduler.spawn(move || mux.run_once());
        }
    }

    pub fn deactivate(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    fn run_once(self: Arc<Self>) {
        if self.active.load(Ordering::Acquire) == 0 {
            self.looping.store(false, Ordering::Release);
            // Re-check: an activation may have raced the store.
            if self.active.load(Ordering::Acquire) > 0
                && !self.looping.swap(true, Ordering::AcqRel)
            {
                let mux = Arc::clone(&self);
                self.scheduler.spawn(move || mux.run_once());
            }
            return;
        }
        if let Err(err) = self.dispatch(TICK_MS) {
            tracing::warn!(error = %err, "dispatch tick failed");
        }
        let mux = Arc::clone(&self);
        if !self.scheduler.spawn(move || mux.run_once()) {
            self.looping.store(false, Ordering::Release);
        }
    }

    /// Test/introspection hook: whether the socket currently has a timeout
    /// entry or liveness tracking in the multiplexer.
    pub fn is_tracked(&self, socket: &Socket) -> bool {
        self.state.lock().sockets.contains_key(&socket.id())
    }
}
