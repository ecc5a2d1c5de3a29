//! Sockets: addresses, the nonblocking handle, connection reuse, and the
//! outbound client.
//!
//! - [`address`]: immutable socket-address value type
//! - [`stream`]: the [`stream::Socket`] handle and its direct / queued /
//!   promise operation forms
//! - [`uplinks`]: per-peer connection-reuse pool with idle close probing
//! - [`client`]: resolve → race → connect → secure pipeline

pub mod address;
pub mod client;
pub mod stream;
pub mod uplinks;

pub use address::{Protocol, SocketAddress};
pub use client::{ConnectOptions, SocketClient};
pub use stream::{DelimiterMatcher, HandshakeStatus, Promise, ReadUntil, Socket};
pub use uplinks::{PoolAcquire, UplinksPool};
