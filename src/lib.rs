//! reactnet: an asynchronous socket I/O core.
//!
//! The crate is a callback-driven transport layer: a readiness backend
//! (`epoll` on Linux, portable `poll(2)` elsewhere) feeds a multiplexer
//! that drives per-socket callbacks on a worker pool. On top of that sit
//! the nonblocking [`socket::Socket`] handle with direct / queued / promise
//! operation forms, a TLS transport-context cache and certificate builder,
//! a caching DNS resolver with connect-racing, a per-peer connection-reuse
//! pool, and server/client connection lifecycles.
//!
//! A typical embedding builds one [`reactor::Multiplexer`] over one
//! [`reactor::Scheduler`] and shares it between a [`server::SocketServer`]
//! and a [`socket::SocketClient`]; each holds its own activation so the
//! dispatch loop runs while either is live.

pub mod base;
pub mod dns;
pub mod reactor;
pub mod server;
pub mod socket;
#[cfg(feature = "tls")]
pub mod tls;

pub use base::NetError;
pub use reactor::{Multiplexer, ReadinessBackend, Scheduler, SocketEvent};
pub use socket::{ConnectOptions, Socket, SocketAddress, SocketClient, UplinksPool};
pub use server::{ConnectionHandler, ServerConfig, SocketServer};
