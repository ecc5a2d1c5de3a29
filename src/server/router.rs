//! Router configuration.
//!
//! Deserializable description of what a [`crate::server::SocketServer`]
//! listens on: one entry per listener, optionally referencing a named TLS
//! block by name. Validation lives in `SocketServer::configure`, where any
//! problem is a fatal [`crate::base::NetError::Configuration`].

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub tls: Vec<TlsBlob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Bind host; empty means the wildcard address.
    #[serde(default)]
    pub host: String,
    /// Numeric port or service name.
    pub service: String,
    /// Name of a [`TlsBlob`] in the router; plain TCP when absent.
    #[serde(default)]
    pub tls: Option<String>,
}

/// Inline TLS material for one or more listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsBlob {
    pub name: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// Client-certificate verification depth; negative (the default)
    /// requests no client certificates.
    #[serde(default = "default_verify_depth")]
    pub verify_depth: i32,
    #[serde(default)]
    pub ciphers: Option<String>,
    /// `"1.0"` through `"1.3"`; unknown values fail configuration.
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub max_version: Option<String>,
}

fn default_verify_depth() -> i32 {
    -1
}
