//! TLS transport contexts and certificate material.
//!
//! - [`context`]: reuse-or-rebuild cache of client/server transport
//!   contexts; trust-store loading happens at most once per context.
//! - [`cert`]: X.509 certificate builder and self-signed shortcuts.
//!
//! Everything here rides on BoringSSL via the `boring` crate and is gated
//! behind the default-on `tls` cargo feature.

pub mod cert;
pub mod context;

pub use cert::{CertificateBuilder, CertifiedKeyPair};
pub use context::{ServerIdentity, TlsOptions, TlsVersion, TransportContext, TransportContextCache};
