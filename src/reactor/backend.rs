//! OS readiness backends.
//!
//! A readiness backend reports which registered descriptors are readable,
//! writeable or closed. Two implementations sit behind one tagged-variant
//! abstraction, selected at construction time and never at a call site:
//!
//! - [`EpollBackend`] (Linux): level-triggered `epoll`, the scalable path.
//!   `epoll_ctl` is safe concurrently with a blocked `epoll_wait`, so
//!   interest changes need no explicit wake-up.
//! - [`PollBackend`] (any POSIX): a registration table snapshotted into a
//!   `pollfd` array per wait. A nonblocking self-pipe is always polled so a
//!   blocked wait can be interrupted promptly when interest changes;
//!   redundant wake-ups are coalesced with a generation counter.

use crate::base::neterror::NetError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a registered socket in readiness events. Assigned by the
/// socket layer; the backend treats it as opaque.
pub type Token = u64;

/// One readiness report for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writeable: bool,
    /// Hang-up or error condition on the descriptor.
    pub closed: bool,
}

/// Uniform add/update/remove/wait contract over the platform backends.
pub enum ReadinessBackend {
    Poll(PollBackend),
    #[cfg(target_os = "linux")]
    Epoll(EpollBackend),
}

impl ReadinessBackend {
    /// The scalable backend where the platform has one, otherwise the
    /// portable poll backend.
    pub fn new() -> Result<Self, NetError> {
        #[cfg(target_os = "linux")]
        {
            Ok(ReadinessBackend::Epoll(EpollBackend::new()?))
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(ReadinessBackend::Poll(PollBackend::new()?))
        }
    }

    /// The portable poll backend, on any platform.
    pub fn new_portable() -> Result<Self, NetError> {
        Ok(ReadinessBackend::Poll(PollBackend::new()?))
    }

    pub fn add(
        &self,
        fd: RawFd,
        token: Token,
        readable: bool,
        writeable: bool,
    ) -> Result<(), NetError> {
        match self {
            ReadinessBackend::Poll(b) => b.add(fd, token, readable, writeable),
            #[cfg(target_os = "linux")]
            ReadinessBackend::Epoll(b) => b.add(fd, token, readable, writeable),
        }
    }

    pub fn update(
        &self,
        fd: RawFd,
        token: Token,
        readable: bool,
        writeable: bool,
    ) -> Result<(), NetError> {
        match self {
            ReadinessBackend::Poll(b) => b.update(fd, token, readable, writeable),
            #[cfg(target_os = "linux")]
            ReadinessBackend::Epoll(b) => b.update(fd, token, readable, writeable),
        }
    }

    pub fn remove(&self, fd: RawFd) -> Result<(), NetError> {
        match self {
            ReadinessBackend::Poll(b) => b.remove(fd),
            #[cfg(target_os = "linux")]
            ReadinessBackend::Epoll(b) => b.remove(fd),
        }
    }

    /// Blocks for up to `timeout_ms` (`-1` = indefinitely) and appends up to
    /// `max` events to `out`. Returning 0 is an empty tick, not an error.
    pub fn wait(
        &self,
        out: &mut Vec<Event>,
        max: usize,
        timeout_ms: i32,
    ) -> Result<usize, NetError> {
        match self {
            ReadinessBackend::Poll(b) => b.wait(out, max, timeout_ms),
            #[cfg(target_os = "linux")]
            ReadinessBackend::Epoll(b) => b.wait(out, max, timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Portable poll backend
// ---------------------------------------------------------------------------

struct PollEntry {
    token: Token,
    readable: bool,
    writeable: bool,
}

/// Level-triggered `poll(2)` backend usable on any POSIX system.
pub struct PollBackend {
    entries: Mutex<HashMap<RawFd, PollEntry>>,
    wake_rx: RawFd,
    wake_tx: RawFd,
    /// Bumped on every interest change.
    wake_gen: AtomicU64,
    /// Last generation the waiter observed when snapshotting the table.
    /// A wake byte is written only when the waiter is (possibly) blocked on
    /// the previous generation, so concurrent updates produce one wake-up,
    /// not a storm.
    seen_gen: AtomicU64,
}

fn set_nonblocking_cloexec(fd: RawFd) -> Result<(), NetError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(NetError::from_errno());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(NetError::from_errno());
        }
    }
    Ok(())
}

impl PollBackend {
    pub fn new() -> Result<Self, NetError> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(NetError::from_errno());
        }
        for fd in fds {
            if let Err(e) = set_nonblocking_cloexec(fd) {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(e);
            }
        }
        Ok(Self {
            entries: Mutex::new(HashMap::new()),
            wake_rx: fds[0],
            wake_tx: fds[1],
            wake_gen: AtomicU64::new(0),
            seen_gen: AtomicU64::new(0),
        })
    }

    pub fn add(
        &self,
        fd: RawFd,
        token: Token,
        readable: bool,
        writeable: bool,
    ) -> Result<(), NetError> {
        self.entries
            .lock()
            .insert(fd, PollEntry { token, readable, writeable });
        self.wake();
        Ok(())
    }

    pub fn update(
        &self,
        fd: RawFd,
        token: Token,
        readable: bool,
        writeable: bool,
    ) -> Result<(), NetError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&fd) {
            Some(entry) => {
                entry.token = token;
                entry.readable = readable;
                entry.writeable = writeable;
            }
            // Tolerate update-after-remove races the same way epoll's
            // EEXIST/ENOENT handling does: fall back to an insert.
            None => {
                entries.insert(fd, PollEntry { token, readable, writeable });
            }
        }
        drop(entries);
        self.wake();
        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> Result<(), NetError> {
        self.entries.lock().remove(&fd);
        self.wake();
        Ok(())
    }

    /// Interrupts a blocked `wait` so it re-snapshots the interest table.
    fn wake(&self) {
        let gen = self.wake_gen.fetch_add(1, Ordering::AcqRel);
        if gen == self.seen_gen.load(Ordering::Acquire) {
            let byte = [1u8];
            unsafe {
                // A full pipe means a wake-up is already pending; fine.
                libc::write(self.wake_tx, byte.as_ptr() as *const libc::c_void, 1);
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.wake_rx, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    pub fn wait(
        &self,
        out: &mut Vec<Event>,
        max: usize,
        timeout_ms: i32,
    ) -> Result<usize, NetError> {
        let mut pfds: Vec<libc::pollfd> = Vec::new();
        let mut tokens: Vec<Token> = Vec::new();
        {
            let entries = self.entries.lock();
            self.seen_gen
                .store(self.wake_gen.load(Ordering::Acquire), Ordering::Release);
            pfds.push(libc::pollfd {
                fd: self.wake_rx,
                events: libc::POLLIN,
                revents: 0,
            });
            for (fd, entry) in entries.iter() {
                let mut events: libc::c_short = 0;
                if entry.readable {
                    events |= libc::POLLIN;
                }
                if entry.writeable {
                    events |= libc::POLLOUT;
                }
                pfds.push(libc::pollfd { fd: *fd, events, revents: 0 });
                tokens.push(entry.token);
            }
        }

        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(NetError::Io(err));
        }

        if pfds[0].revents != 0 {
            self.drain_wake_pipe();
        }

        let mut count = 0;
        for (i, pfd) in pfds.iter().enumerate().skip(1) {
            if count >= max {
                break;
            }
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            out.push(Event {
                token: tokens[i - 1],
                readable: revents & libc::POLLIN != 0,
                writeable: revents & libc::POLLOUT != 0,
                closed: revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
            });
            count += 1;
        }
        Ok(count)
    }
}

impl Drop for PollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_rx);
            libc::close(self.wake_tx);
        }
    }
}

// ---------------------------------------------------------------------------
// Linux epoll backend
// ---------------------------------------------------------------------------

/// Scalable level-triggered `epoll` backend.
#[cfg(target_os = "linux")]
pub struct EpollBackend {
    epfd: RawFd,
}

#[cfg(target_os = "linux")]
impl EpollBackend {
    pub fn new() -> Result<Self, NetError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::from_errno());
        }
        Ok(Self { epfd })
    }

    fn mask(readable: bool, writeable: bool) -> u32 {
        let mut mask = libc::EPOLLRDHUP as u32;
        if readable {
            mask |= libc::EPOLLIN as u32;
        }
        if writeable {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32, token: Token) -> Result<(), NetError> {
        let mut event = libc::epoll_event { events: mask, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(NetError::from_errno());
        }
        Ok(())
    }

    pub fn add(
        &self,
        fd: RawFd,
        token: Token,
        readable: bool,
        writeable: bool,
    ) -> Result<(), NetError> {
        let mask = Self::mask(readable, writeable);
        match self.ctl(libc::EPOLL_CTL_ADD, fd, mask, token) {
            Err(NetError::Io(ref e)) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, mask, token)
            }
            other => other,
        }
    }

    pub fn update(
        &self,
        fd: RawFd,
        token: Token,
        readable: bool,
        writeable: bool,
    ) -> Result<(), NetError> {
        let mask = Self::mask(readable, writeable);
        match self.ctl(libc::EPOLL_CTL_MOD, fd, mask, token) {
            Err(NetError::Io(ref e)) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, mask, token)
            }
            other => other,
        }
    }

    pub fn remove(&self, fd: RawFd) -> Result<(), NetError> {
        // Pass a dummy event for pre-2.6.9 kernel compatibility.
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            Err(NetError::Io(ref e)) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    pub fn wait(
        &self,
        out: &mut Vec<Event>,
        max: usize,
        timeout_ms: i32,
    ) -> Result<usize, NetError> {
        let mut raw: Vec<libc::epoll_event> =
            vec![libc::epoll_event { events: 0, u64: 0 }; max];
        let rc = unsafe { libc::epoll_wait(self.epfd, raw.as_mut_ptr(), max as i32, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(NetError::Io(err));
        }
        for ev in raw.iter().take(rc as usize) {
            let events = ev.events;
            let token = ev.u64;
            out.push(Event {
                token,
                readable: events & libc::EPOLLIN as u32 != 0,
                writeable: events & libc::EPOLLOUT as u32 != 0,
                closed: events
                    & (libc::EPOLLHUP as u32
                        | libc::EPOLLRDHUP as u32
                        | libc::EPOLLERR as u32)
                    != 0,
            });
        }
        Ok(rc as usize)
    }
}

#[cfg(target_os = "linux")]
impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn check_backend(backend: ReadinessBackend) {
        let (mut a, b) = connected_pair();
        let fd = b.as_raw_fd();

        backend.add(fd, 7, true, false).unwrap();

        // Nothing to read yet: empty tick.
        let mut out = Vec::new();
        let n = backend.wait(&mut out, 16, 0).unwrap();
        assert_eq!(n, 0);

        a.write_all(b"x").unwrap();
        let mut out = Vec::new();
        let n = backend.wait(&mut out, 16, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].token, 7);
        assert!(out[0].readable);

        // Writable interest reports immediately on an open stream.
        backend.update(fd, 7, false, true).unwrap();
        let mut out = Vec::new();
        let n = backend.wait(&mut out, 16, 1000).unwrap();
        assert_eq!(n, 1);
        assert!(out[0].writeable);

        backend.remove(fd).unwrap();
        let mut out = Vec::new();
        let n = backend.wait(&mut out, 16, 0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_poll_backend_readiness() {
        check_backend(ReadinessBackend::new_portable().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_epoll_backend_readiness() {
        check_backend(ReadinessBackend::Epoll(EpollBackend::new().unwrap()));
    }

    #[test]
    fn test_poll_wake_interrupts_wait() {
        let backend = std::sync::Arc::new(PollBackend::new().unwrap());
        let b2 = std::sync::Arc::clone(&backend);
        let (_a, b) = connected_pair();
        let fd = b.as_raw_fd();

        let handle = std::thread::spawn(move || {
            let mut out = Vec::new();
            let start = std::time::Instant::now();
            // Would block for 5s without the interest-change wake-up.
            b2.wait(&mut out, 16, 5000).unwrap();
            start.elapsed()
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        backend.add(fd, 1, false, true).unwrap();
        let elapsed = handle.join().unwrap();
        assert!(elapsed < std::time::Duration::from_secs(4));
    }

    #[test]
    fn test_poll_wake_coalesces() {
        let backend = PollBackend::new().unwrap();
        // No waiter has observed anything yet; many interest changes must
        // produce at most one pending wake byte.
        for _ in 0..100 {
            backend.wake();
        }
        let mut buf = [0u8; 16];
        let n = unsafe {
            libc::read(
                backend.wake_rx,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        assert_eq!(n, 1);
    }
}
