//! Role-tagged readiness polling over `poll(2)`.
//!
//! The listener watches three kinds of descriptors at once: the TCP
//! listening socket, accepted TCP peers and worker IPC channels. Each
//! registration carries a tag so dispatch branches on the tag instead of
//! comparing handles.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Which readiness a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Wake when the source has data (or hung up).
    pub readable: bool,
    /// Wake when the source accepts more bytes.
    pub writable: bool,
}

impl Interest {
    /// Readability only.
    pub const READABLE: Self = Self { readable: true, writable: false };
    /// Writability only.
    pub const WRITABLE: Self = Self { readable: false, writable: true };

    /// Interest in `readable` and/or `writable`.
    pub fn new(readable: bool, writable: bool) -> Self {
        Self { readable, writable }
    }

    /// Whether this waits for nothing at all.
    pub fn is_none(self) -> bool {
        !self.readable && !self.writable
    }

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= libc::POLLIN;
        }
        if self.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// One ready source returned by [`Poller::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready<T> {
    /// Tag given at registration.
    pub tag: T,
    /// Data, hang-up or an error is pending.
    pub readable: bool,
    /// The source accepts writes (or has an error to report on write).
    pub writable: bool,
}

/// Readiness set rebuilt by the caller before each [`Poller::poll`].
pub struct Poller<T> {
    tags: Vec<T>,
    fds: Vec<libc::pollfd>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Poller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> Poller<T> {
    /// Create an empty poller.
    pub fn new() -> Self {
        Self {
            tags: Vec::new(),
            fds: Vec::new(),
        }
    }

    /// Drop all registrations.
    pub fn clear(&mut self) {
        self.tags.clear();
        self.fds.clear();
    }

    /// Watch `source` for readability under `tag`.
    pub fn register(&mut self, source: &impl AsRawFd, tag: T) {
        self.register_fd(source.as_raw_fd(), tag, Interest::READABLE);
    }

    /// Watch `source` for `interest` under `tag`.
    pub fn register_with(&mut self, source: &impl AsRawFd, tag: T, interest: Interest) {
        self.register_fd(source.as_raw_fd(), tag, interest);
    }

    fn register_fd(&mut self, fd: RawFd, tag: T, interest: Interest) {
        self.fds.push(libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        });
        self.tags.push(tag);
    }

    /// Wait up to `timeout` and return the ready sources, in registration
    /// order.
    ///
    /// Hang-up and error conditions count as readable: the following read
    /// reports EOF or the error to the owner. Errors also count as writable.
    /// An interrupted wait returns nothing.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Vec<Ready<T>>> {
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd for
        // the duration of the call and its length is passed alongside.
        let ready = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(Vec::new());
        }

        Ok(self
            .fds
            .iter()
            .zip(&self.tags)
            .filter_map(|(pfd, tag)| {
                let readable = pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
                let writable = pfd.revents & (libc::POLLOUT | libc::POLLERR) != 0;
                (readable || writable).then(|| Ready {
                    tag: tag.clone(),
                    readable,
                    writable,
                })
            })
            .collect())
    }
}

impl<T: Clone> Default for Poller<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[derive(Debug, Clone, PartialEq)]
    enum Tag {
        A,
        B,
    }

    fn tags(ready: Vec<Ready<Tag>>) -> Vec<Tag> {
        ready.into_iter().map(|r| r.tag).collect()
    }

    #[test]
    fn test_nothing_ready_times_out() {
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let mut poller = Poller::new();
        poller.register(&a, Tag::A);
        assert!(poller.poll(Duration::from_millis(10)).unwrap().is_empty());
    }

    #[test]
    fn test_reports_only_readable_tags() {
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, mut b_peer) = UnixStream::pair().unwrap();
        b_peer.write_all(b"x").unwrap();

        let mut poller = Poller::new();
        poller.register(&a, Tag::A);
        poller.register(&b, Tag::B);
        let ready = poller.poll(Duration::from_millis(100)).unwrap();
        assert_eq!(ready, vec![Ready { tag: Tag::B, readable: true, writable: false }]);
    }

    #[test]
    fn test_hangup_counts_as_readable() {
        let (a, a_peer) = UnixStream::pair().unwrap();
        drop(a_peer);

        let mut poller = Poller::new();
        poller.register(&a, Tag::A);
        assert_eq!(tags(poller.poll(Duration::from_millis(100)).unwrap()), vec![Tag::A]);
    }

    #[test]
    fn test_write_interest_reports_writable_socket() {
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();

        let mut poller = Poller::new();
        poller.register(&a, Tag::A);
        poller.register_with(&b, Tag::B, Interest::WRITABLE);
        let ready = poller.poll(Duration::from_millis(100)).unwrap();
        assert_eq!(ready, vec![Ready { tag: Tag::B, readable: false, writable: true }]);
    }

    #[test]
    fn test_full_socket_is_not_writable() {
        let (a, _a_peer) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let chunk = [0u8; 4096];
        while (&a).write(&chunk).is_ok() {}

        let mut poller = Poller::new();
        poller.register_with(&a, Tag::A, Interest::WRITABLE);
        assert!(poller.poll(Duration::from_millis(10)).unwrap().is_empty());
    }

    #[test]
    fn test_clear_empties_set() {
        let (a, mut a_peer) = UnixStream::pair().unwrap();
        a_peer.write_all(b"x").unwrap();
        let mut poller = Poller::new();
        poller.register(&a, Tag::A);
        poller.clear();
        assert!(poller.poll(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_interest_none() {
        assert!(Interest::new(false, false).is_none());
        assert!(!Interest::READABLE.is_none());
        assert!(!Interest::WRITABLE.is_none());
    }
}
