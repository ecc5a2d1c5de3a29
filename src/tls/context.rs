//! Transport-context cache.
//!
//! Building an `SslContext` is expensive, mostly because loading the system
//! trust store is expensive. The cache keeps freed contexts in two
//! role-separated idle pools and hands one back whenever its trust material
//! is sufficient for the request: a context built for verify depth N serves
//! any request with depth ≤ N, and a server context is only reused for the
//! same certificate identity. Anything else is a rebuild, observable through
//! the [`TransportContextCache::trust_store_loads`] counter.

use crate::base::neterror::NetError;
use boring::pkey::PKey;
use boring::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use boring::x509::X509;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Protocol versions expressible in router configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    #[serde(rename = "1.0")]
    Tls10,
    #[serde(rename = "1.1")]
    Tls11,
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    fn raw(self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }
}

/// Version bounds applied to a context. `None` leaves the library default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TlsOptions {
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
}

/// Server certificate and key, PEM-encoded. Two identities compare equal
/// exactly when their PEM bytes do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// A built `SslContext` plus the cache bookkeeping deciding its reuse.
pub struct TransportContext {
    context: SslContext,
    verify_depth: i32,
    /// Hash of cert identity + ciphers + version bounds; `None` for client
    /// contexts, which are distinguished by verify depth alone.
    fingerprint: Option<u64>,
}

impl TransportContext {
    pub(crate) fn context(&self) -> &SslContext {
        &self.context
    }

    pub fn verify_depth(&self) -> i32 {
        self.verify_depth
    }
}

pub struct TransportContextCache {
    client_idle: Mutex<Vec<TransportContext>>,
    server_idle: Mutex<Vec<TransportContext>>,
    trust_store_loads: AtomicU64,
}

impl TransportContextCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client_idle: Mutex::new(Vec::new()),
            server_idle: Mutex::new(Vec::new()),
            trust_store_loads: AtomicU64::new(0),
        })
    }

    /// Number of trust-store loads performed so far. Reuse paths do not
    /// bump it; the reuse policy is asserted against this counter.
    pub fn trust_store_loads(&self) -> u64 {
        self.trust_store_loads.load(Ordering::Relaxed)
    }

    /// Client context with peer verification to `verify_depth` chain links
    /// (negative disables verification). An idle context whose depth is
    /// already sufficient is reused without touching the trust store;
    /// verification is never silently downgraded.
    pub fn create_client_context(
        &self,
        verify_depth: i32,
        options: &TlsOptions,
        ciphers: Option<&str>,
    ) -> Result<TransportContext, NetError> {
        let fingerprint = fingerprint_of(None, ciphers, options);
        {
            let mut idle = self.client_idle.lock();
            if let Some(pos) = idle.iter().position(|ctx| {
                ctx.verify_depth >= verify_depth && ctx.fingerprint == Some(fingerprint)
            }) {
                tracing::debug!(verify_depth, "client transport context reused");
                return Ok(idle.swap_remove(pos));
            }
        }
        let context = self.build_client(verify_depth, options, ciphers)?;
        Ok(TransportContext {
            context,
            verify_depth,
            fingerprint: Some(fingerprint),
        })
    }

    pub fn free_client_context(&self, context: TransportContext) {
        self.client_idle.lock().push(context);
    }

    /// Server context for one certificate identity. Reused only when both
    /// the identity fingerprint matches and the idle context's verify depth
    /// is sufficient.
    pub fn create_server_context(
        &self,
        verify_depth: i32,
        options: &TlsOptions,
        ciphers: Option<&str>,
        identity: &ServerIdentity,
    ) -> Result<TransportContext, NetError> {
        let fingerprint = fingerprint_of(Some(identity), ciphers, options);
        {
            let mut idle = self.server_idle.lock();
            if let Some(pos) = idle.iter().position(|ctx| {
                ctx.verify_depth >= verify_depth && ctx.fingerprint == Some(fingerprint)
            }) {
                tracing::debug!(verify_depth, "server transport context reused");
                return Ok(idle.swap_remove(pos));
            }
        }
        let context = self.build_server(verify_depth, options, ciphers, identity)?;
        Ok(TransportContext {
            context,
            verify_depth,
            fingerprint: Some(fingerprint),
        })
    }

    pub fn free_server_context(&self, context: TransportContext) {
        self.server_idle.lock().push(context);
    }

    fn build_client(
        &self,
        verify_depth: i32,
        options: &TlsOptions,
        ciphers: Option<&str>,
    ) -> Result<SslContext, NetError> {
        let mut builder = SslContextBuilder::new(SslMethod::tls())?;
        apply_options(&mut builder, options, ciphers)?;
        if verify_depth >= 0 {
            builder.set_verify(SslVerifyMode::PEER);
            builder.set_verify_depth(verify_depth as u32);
            builder.set_default_verify_paths()?;
            self.trust_store_loads.fetch_add(1, Ordering::Relaxed);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }
        tracing::debug!(verify_depth, "client transport context built");
        Ok(builder.build())
    }

    fn build_server(
        &self,
        verify_depth: i32,
        options: &TlsOptions,
        ciphers: Option<&str>,
        identity: &ServerIdentity,
    ) -> Result<SslContext, NetError> {
        let cert = X509::from_pem(&identity.cert_pem)?;
        let key = PKey::private_key_from_pem(&identity.key_pem)?;
        let mut builder = SslContextBuilder::new(SslMethod::tls())?;
        apply_options(&mut builder, options, ciphers)?;
        builder.set_certificate(&cert)?;
        builder.set_private_key(&key)?;
        builder.check_private_key()?;
        if verify_depth >= 0 {
            builder.set_verify(SslVerifyMode::PEER);
            builder.set_verify_depth(verify_depth as u32);
            builder.set_default_verify_paths()?;
            self.trust_store_loads.fetch_add(1, Ordering::Relaxed);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }
        tracing::debug!(verify_depth, "server transport context built");
        Ok(builder.build())
    }
}

fn apply_options(
    builder: &mut SslContextBuilder,
    options: &TlsOptions,
    ciphers: Option<&str>,
) -> Result<(), NetError> {
    if let Some(min) = options.min_version {
        builder.set_min_proto_version(Some(min.raw()))?;
    }
    if let Some(max) = options.max_version {
        builder.set_max_proto_version(Some(max.raw()))?;
    }
    if let Some(list) = ciphers {
        builder.set_cipher_list(list)?;
    }
    Ok(())
}

fn fingerprint_of(
    identity: Option<&ServerIdentity>,
    ciphers: Option<&str>,
    options: &TlsOptions,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    identity.hash(&mut hasher);
    ciphers.hash(&mut hasher);
    options.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_reuse_skips_trust_store() {
        let cache = TransportContextCache::new();
        let opts = TlsOptions::default();
        let ctx = cache.create_client_context(3, &opts, None).unwrap();
        assert_eq!(cache.trust_store_loads(), 1);
        cache.free_client_context(ctx);

        // Shallower request reuses the deeper context.
        let ctx = cache.create_client_context(1, &opts, None).unwrap();
        assert_eq!(cache.trust_store_loads(), 1);
        assert_eq!(ctx.verify_depth(), 3);
        cache.free_client_context(ctx);

        // Deeper request rebuilds.
        let ctx = cache.create_client_context(5, &opts, None).unwrap();
        assert_eq!(cache.trust_store_loads(), 2);
        cache.free_client_context(ctx);
    }

    #[test]
    fn test_server_reuse_requires_same_identity() {
        let cache = TransportContextCache::new();
        let opts = TlsOptions::default();
        let pair_a = crate::tls::cert::CertificateBuilder::self_signed("a.test", "", "a.test")
            .unwrap();
        let pair_b = crate::tls::cert::CertificateBuilder::self_signed("b.test", "", "b.test")
            .unwrap();
        let id_a = ServerIdentity {
            cert_pem: pair_a.cert_pem.clone(),
            key_pem: pair_a.key_pem.clone(),
        };
        let id_b = ServerIdentity {
            cert_pem: pair_b.cert_pem,
            key_pem: pair_b.key_pem,
        };

        let ctx = cache.create_server_context(-1, &opts, None, &id_a).unwrap();
        cache.free_server_context(ctx);
        // Different identity never reuses.
        let _ctx_b = cache.create_server_context(-1, &opts, None, &id_b).unwrap();
        let ctx_a = cache.create_server_context(-1, &opts, None, &id_a).unwrap();
        // No verification requested anywhere, so no trust-store loads.
        assert_eq!(cache.trust_store_loads(), 0);
        cache.free_server_context(ctx_a);
    }

    #[test]
    fn test_server_depth_reuse_and_reload() {
        let cache = TransportContextCache::new();
        let opts = TlsOptions::default();
        let pair = crate::tls::cert::CertificateBuilder::self_signed("d.test", "", "d.test")
            .unwrap();
        let identity = ServerIdentity {
            cert_pem: pair.cert_pem,
            key_pem: pair.key_pem,
        };

        let ctx = cache.create_server_context(2, &opts, None, &identity).unwrap();
        assert_eq!(cache.trust_store_loads(), 1);
        cache.free_server_context(ctx);

        // Shallower request reuses the freed context without a reload.
        let ctx = cache.create_server_context(0, &opts, None, &identity).unwrap();
        assert_eq!(cache.trust_store_loads(), 1);
        assert_eq!(ctx.verify_depth(), 2);
        cache.free_server_context(ctx);

        // Deeper request must rebuild.
        let ctx = cache.create_server_context(4, &opts, None, &identity).unwrap();
        assert_eq!(cache.trust_store_loads(), 2);
        cache.free_server_context(ctx);
    }

    #[test]
    fn test_bad_pem_is_rejected() {
        let cache = TransportContextCache::new();
        let identity = ServerIdentity {
            cert_pem: b"not a certificate".to_vec(),
            key_pem: b"not a key".to_vec(),
        };
        assert!(cache
            .create_server_context(-1, &TlsOptions::default(), None, &identity)
            .is_err());
    }
}
