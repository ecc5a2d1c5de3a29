//! Host resolution and the resolver cache.
//!
//! [`HostResolver`] fronts the OS resolver (`getaddrinfo`) with a
//! fixed-TTL cache keyed by a hash of every discriminating lookup field.
//! Expired entries are evicted lazily on lookup; concurrent lookups for one
//! key race benignly, last write wins. [`HostResolver::race_connect`]
//! implements the connect-role selection: one nonblocking socket per
//! candidate, one bounded `poll(2)`, IPv4 candidates first, first
//! descriptor writeable without a pending socket error wins.

use crate::base::neterror::NetError;
use crate::socket::address::{Protocol, SocketAddress};
use crate::socket::stream::Socket;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::ffi::{CStr, CString};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cached entries live this long regardless of record TTLs.
const CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Budget for the connect-role candidate race.
pub const RACE_TIMEOUT: Duration = Duration::from_millis(300);

/// What the resolved addresses will be used for. Bind-role lookups pass
/// `AI_PASSIVE` and accept an empty hostname as the wildcard address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolverRole {
    Bind,
    Connect,
}

struct CacheEntry {
    addresses: Vec<SocketAddress>,
    stored_at: Instant,
}

pub struct HostResolver {
    cache: DashMap<u64, CacheEntry>,
    ttl: Duration,
    resolutions: AtomicU64,
}

impl HostResolver {
    pub fn new() -> Arc<Self> {
        Self::with_ttl(CACHE_TTL)
    }

    /// Custom TTL, for tests that need expiry without waiting hours.
    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            cache: DashMap::new(),
            ttl,
            resolutions: AtomicU64::new(0),
        })
    }

    /// Number of OS resolutions performed; cache hits and IP-literal fast
    /// paths do not count.
    pub fn resolution_count(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Resolves `hostname:service`, IPv4 candidates ordered first. IP
    /// literals with a numeric service never touch the cache or the OS.
    pub fn lookup(
        &self,
        hostname: &str,
        service: &str,
        role: ResolverRole,
        protocol: Protocol,
    ) -> Result<Vec<SocketAddress>, NetError> {
        if let Ok(port) = service.parse::<u16>() {
            if let Some(addr) = SocketAddress::try_parse(hostname, port, protocol) {
                return Ok(vec![addr]);
            }
        }

        let key = {
            let mut hasher = DefaultHasher::new();
            hostname.hash(&mut hasher);
            service.hash(&mut hasher);
            role.hash(&mut hasher);
            protocol.hash(&mut hasher);
            hasher.finish()
        };

        if let Some(entry) = self.cache.get(&key) {
            if entry.stored_at.elapsed() < self.ttl {
                return Ok(entry.addresses.clone());
            }
            drop(entry);
            self.cache.remove(&key);
        }

        let addresses = self.os_resolve(hostname, service, role, protocol)?;
        self.cache.insert(
            key,
            CacheEntry {
                addresses: addresses.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(addresses)
    }

    /// Reverse lookup via `getnameinfo`. Uncached.
    pub fn reverse_lookup(&self, addr: &SocketAddress) -> Result<String, NetError> {
        let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
        let rc = unsafe {
            libc::getnameinfo(
                addr.raw().as_ptr(),
                addr.raw().len(),
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                std::ptr::null_mut(),
                0,
                libc::NI_NAMEREQD,
            )
        };
        if rc != 0 {
            return Err(NetError::NameNotResolved);
        }
        let name = unsafe { CStr::from_ptr(host.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    /// Races a nonblocking connect against every candidate and returns the
    /// winning connected socket. Candidates are tried IPv4 first; losers
    /// are closed.
    pub fn race_connect(
        candidates: &[SocketAddress],
        timeout: Duration,
    ) -> Result<(Socket, SocketAddress), NetError> {
        if candidates.is_empty() {
            return Err(NetError::NameNotResolved);
        }
        let ordered: Vec<&SocketAddress> = candidates
            .iter()
            .filter(|a| a.is_ipv4())
            .chain(candidates.iter().filter(|a| !a.is_ipv4()))
            .collect();

        let mut racers: Vec<(Socket, SocketAddress)> = Vec::with_capacity(ordered.len());
        let mut last_error = NetError::Refused;
        for addr in ordered {
            let sock = match Socket::new_tcp(addr.domain()) {
                Ok(sock) => sock,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };
            match sock.connect(addr) {
                Ok(()) => return Ok((sock, (*addr).clone())),
                Err(NetError::WouldBlock) => racers.push((sock, (*addr).clone())),
                Err(err) => last_error = err,
            }
        }
        if racers.is_empty() {
            return Err(last_error);
        }

        let deadline = Instant::now() + timeout;
        while !racers.is_empty() {
            let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(racers.len());
            for (sock, _) in &racers {
                let Some(fd) = sock.raw_fd() else {
                    return Err(NetError::AlreadyClosed);
                };
                pfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NetError::TimedOut);
            }
            let rc = unsafe {
                libc::poll(
                    pfds.as_mut_ptr(),
                    pfds.len() as libc::nfds_t,
                    remaining.as_millis() as i32,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(NetError::from_os(err));
            }
            if rc == 0 {
                return Err(NetError::TimedOut);
            }
            // Scan preserves the v4-first ordering, so a v4 winner in the
            // same tick beats a v6 one.
            let mut failed: Vec<usize> = Vec::new();
            for (i, pfd) in pfds.iter().enumerate() {
                if pfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) == 0 {
                    continue;
                }
                match racers[i].0.connect_outcome() {
                    Ok(()) => {
                        let (sock, addr) = racers.swap_remove(i);
                        return Ok((sock, addr));
                    }
                    Err(err) => {
                        last_error = err;
                        failed.push(i);
                    }
                }
            }
            for i in failed.into_iter().rev() {
                racers.swap_remove(i);
            }
        }
        Err(last_error)
    }

    fn os_resolve(
        &self,
        hostname: &str,
        service: &str,
        role: ResolverRole,
        protocol: Protocol,
    ) -> Result<Vec<SocketAddress>, NetError> {
        let c_host = CString::new(hostname)
            .map_err(|_| NetError::AddressInvalid(hostname.to_string()))?;
        let c_service =
            CString::new(service).map_err(|_| NetError::AddressInvalid(service.to_string()))?;

        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        match protocol {
            Protocol::Tcp => {
                hints.ai_socktype = libc::SOCK_STREAM;
                hints.ai_protocol = libc::IPPROTO_TCP;
            }
            Protocol::Udp => {
                hints.ai_socktype = libc::SOCK_DGRAM;
                hints.ai_protocol = libc::IPPROTO_UDP;
            }
        }
        let host_ptr = if hostname.is_empty() && role == ResolverRole::Bind {
            hints.ai_flags = libc::AI_PASSIVE;
            std::ptr::null()
        } else {
            if role == ResolverRole::Bind {
                hints.ai_flags = libc::AI_PASSIVE;
            }
            c_host.as_ptr()
        };

        let mut list: *mut libc::addrinfo = std::ptr::null_mut();
        let rc = unsafe { libc::getaddrinfo(host_ptr, c_service.as_ptr(), &hints, &mut list) };
        if rc != 0 {
            tracing::debug!(hostname, service, code = rc, "resolution failed");
            return Err(NetError::NameNotResolved);
        }
        self.resolutions.fetch_add(1, Ordering::Relaxed);

        let mut addresses = Vec::new();
        let mut node = list;
        while !node.is_null() {
            let info = unsafe { &*node };
            if !info.ai_addr.is_null() {
                let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
                let len = (info.ai_addrlen as usize)
                    .min(std::mem::size_of::<libc::sockaddr_storage>());
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        info.ai_addr as *const u8,
                        &mut storage as *mut _ as *mut u8,
                        len,
                    );
                }
                let raw = unsafe { socket2::SockAddr::new(storage, len as libc::socklen_t) };
                addresses.push(
                    SocketAddress::new(raw, protocol, None).with_hostname(hostname.to_string()),
                );
            }
            node = info.ai_next;
        }
        unsafe { libc::freeaddrinfo(list) };

        // Connect-role callers try candidates in order; prefer v4.
        addresses.sort_by_key(|a| !a.is_ipv4());
        if addresses.is_empty() {
            return Err(NetError::NameNotResolved);
        }
        tracing::debug!(hostname, service, count = addresses.len(), "hostname resolved");
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_literal_skips_resolver() {
        let resolver = HostResolver::new();
        let addrs = resolver
            .lookup("127.0.0.1", "8080", ResolverRole::Connect, Protocol::Tcp)
            .unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].identity(), "127.0.0.1:8080");
        assert_eq!(resolver.resolution_count(), 0);
    }

    #[test]
    fn test_second_lookup_within_ttl_is_cached() {
        let resolver = HostResolver::new();
        let first = resolver
            .lookup("localhost", "80", ResolverRole::Connect, Protocol::Tcp)
            .unwrap();
        assert!(!first.is_empty());
        assert_eq!(resolver.resolution_count(), 1);
        let second = resolver
            .lookup("localhost", "80", ResolverRole::Connect, Protocol::Tcp)
            .unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(resolver.resolution_count(), 1);
    }

    #[test]
    fn test_expired_entry_resolves_again() {
        let resolver = HostResolver::with_ttl(Duration::from_millis(10));
        resolver
            .lookup("localhost", "80", ResolverRole::Connect, Protocol::Tcp)
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        resolver
            .lookup("localhost", "80", ResolverRole::Connect, Protocol::Tcp)
            .unwrap();
        assert_eq!(resolver.resolution_count(), 2);
    }

    #[test]
    fn test_distinct_roles_do_not_share_entries() {
        let resolver = HostResolver::new();
        resolver
            .lookup("localhost", "80", ResolverRole::Connect, Protocol::Tcp)
            .unwrap();
        resolver
            .lookup("localhost", "80", ResolverRole::Bind, Protocol::Tcp)
            .unwrap();
        assert_eq!(resolver.resolution_count(), 2);
    }

    #[test]
    fn test_unknown_host_is_name_not_resolved() {
        let resolver = HostResolver::new();
        assert!(matches!(
            resolver.lookup(
                "does-not-exist.invalid",
                "80",
                ResolverRole::Connect,
                Protocol::Tcp
            ),
            Err(NetError::NameNotResolved)
        ));
    }

    #[test]
    fn test_race_connect_picks_live_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap();
        // A candidate that refuses plus one that accepts.
        let dead_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let candidates = vec![
            SocketAddress::try_parse("127.0.0.1", dead_port, Protocol::Tcp).unwrap(),
            SocketAddress::from_std(live, Protocol::Tcp),
        ];
        let (sock, winner) =
            HostResolver::race_connect(&candidates, Duration::from_secs(2)).unwrap();
        assert_eq!(winner.identity(), live.to_string());
        assert!(sock.is_open());
    }
}
