//! The reactor: readiness backends, worker pool and multiplexer.
//!
//! Dependency order within the crate: readiness backend → multiplexer →
//! socket → {transport-context cache, DNS resolver} → uplinks pool →
//! {socket server, socket client}.
//!
//! - [`backend`]: level-triggered `poll(2)` and Linux `epoll` backends
//! - [`scheduler`]: worker-thread pool executing deferred callbacks
//! - [`multiplexer`]: per-socket interest, timeouts and callback dispatch

pub mod backend;
pub mod multiplexer;
pub mod scheduler;

pub use backend::{Event, ReadinessBackend, Token};
pub use multiplexer::{EventCallback, Multiplexer, SocketEvent, MAX_EVENTS};
pub use scheduler::Scheduler;
