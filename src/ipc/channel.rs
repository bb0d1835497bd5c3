//! Byte-stream channels shared by the listener and the workers.
//!
//! [`Channel`] is the common interface for TCP peers and Unix-socket IPC
//! connections so both can sit in one [`crate::poller::Poller`].
//! [`WorkerChannel`] is the listener's end of one worker's IPC connection.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};

use super::protocol::{Command, Event, LineDecoder};
use crate::constants::{
    IPC_READS_PER_WAKE, IPC_READ_BUFFER_SIZE, MAX_SOCK_PATH, WORKER_CONNECT_RETRY,
    WORKER_CONNECT_TIMEOUT,
};

/// A readable, writable, closable byte stream backed by a file descriptor.
pub trait Channel: Read + Write + AsRawFd {
    /// Shut down both directions. Idempotent.
    fn close(&mut self);
}

impl Channel for TcpStream {
    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl Channel for UnixStream {
    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

/// Result of draining a readable channel.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    /// Zero or more complete messages were decoded; the channel is still open.
    Messages(Vec<Result<T>>),
    /// The other end closed the connection.
    Closed,
}

/// Bytes waiting to be written to a non-blocking stream.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    buf: Vec<u8>,
    start: usize,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` behind everything already queued.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.is_empty() {
            self.buf.clear();
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes not yet written.
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Whether everything queued has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write queued bytes until the queue is empty or `writer` would block.
    pub fn write_to(&mut self, writer: &mut impl Write) -> io::Result<()> {
        while self.start < self.buf.len() {
            match writer.write(&self.buf[self.start..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.start += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if self.is_empty() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > self.buf.len() / 2 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        Ok(())
    }
}

/// Listener-side connection to one worker's IPC endpoint.
///
/// The socket is non-blocking once connected. Events are queued by
/// [`WorkerChannel::send`] and written as the worker drains them; the owner
/// calls [`WorkerChannel::flush`] whenever the socket turns writable.
#[derive(Debug)]
pub struct WorkerChannel {
    worker_id: usize,
    stream: UnixStream,
    decoder: LineDecoder,
    outbound: OutboundQueue,
}

impl WorkerChannel {
    /// Connect to a worker endpoint, retrying until
    /// [`WORKER_CONNECT_TIMEOUT`] while the worker (re)binds.
    pub fn connect(worker_id: usize, path: &Path) -> Result<Self> {
        let deadline = Instant::now() + WORKER_CONNECT_TIMEOUT;
        let stream = loop {
            match UnixStream::connect(path) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    log::debug!("[router] worker {worker_id} not reachable yet ({e}), retrying");
                    std::thread::sleep(WORKER_CONNECT_RETRY);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("connect to worker {worker_id} endpoint: {}", path.display())
                    });
                }
            }
        };
        stream
            .set_nonblocking(true)
            .context("set worker channel non-blocking")?;
        log::debug!("[router] connected to worker {worker_id} at {}", path.display());
        Ok(Self {
            worker_id,
            stream,
            decoder: LineDecoder::new(),
            outbound: OutboundQueue::new(),
        })
    }

    /// Queue one event line and write as much as the socket takes now.
    pub fn send(&mut self, event: &Event) -> Result<()> {
        let line = event.encode()?;
        self.outbound.push(&line);
        self.flush()
    }

    /// Write queued events until done or the socket would block.
    pub fn flush(&mut self) -> Result<()> {
        self.outbound
            .write_to(&mut self.stream)
            .with_context(|| format!("write to worker {}", self.worker_id))
    }

    /// Bytes queued but not yet taken by the worker.
    pub fn backlog(&self) -> usize {
        self.outbound.len()
    }

    /// Whether queued bytes are waiting for the socket to turn writable.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Read what is available, up to [`IPC_READS_PER_WAKE`] buffers, and
    /// decode the complete command lines.
    ///
    /// `Closed` is reported once no complete lines remain to hand out.
    pub fn read_commands(&mut self) -> Result<ReadOutcome<Command>> {
        let mut buf = [0u8; IPC_READ_BUFFER_SIZE];
        let mut commands = Vec::new();
        for _ in 0..IPC_READS_PER_WAKE {
            let n = match self.stream.read(&mut buf) {
                Ok(0) => return Ok(self.closed_with(commands)),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    return Ok(self.closed_with(commands));
                }
                Err(e) => return Err(e).context("read from worker channel"),
            };
            let lines = self.decoder.feed(&buf[..n])?;
            commands.extend(lines.iter().map(|line| Command::decode(line)));
        }
        Ok(ReadOutcome::Messages(commands))
    }

    fn closed_with(&self, commands: Vec<Result<Command>>) -> ReadOutcome<Command> {
        if !commands.is_empty() {
            // The next read reports EOF again.
            return ReadOutcome::Messages(commands);
        }
        if self.decoder.has_partial() {
            log::warn!("[router] worker {} closed its channel mid-line", self.worker_id);
        }
        ReadOutcome::Closed
    }
}

impl AsRawFd for WorkerChannel {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.stream.as_raw_fd()
    }
}

/// Endpoint path for a worker: `{runtime_dir}/{worker_id}.sock`.
///
/// Length is validated against the macOS 104-byte `sun_path` limit.
pub fn endpoint_path(runtime_dir: &Path, worker_id: usize) -> Result<PathBuf> {
    let path = runtime_dir.join(format!("{worker_id}.sock"));
    let len = path.as_os_str().len();
    if len >= MAX_SOCK_PATH {
        bail!(
            "worker socket path too long ({len} bytes, max {}): {}",
            MAX_SOCK_PATH - 1,
            path.display()
        );
    }
    Ok(path)
}

/// Bind a worker endpoint, replacing any stale socket file from a previous
/// instance. The socket is restricted to the owner (0600).
pub fn bind_endpoint(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create runtime dir: {}", parent.display()))?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed stale endpoint {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("remove stale endpoint: {}", path.display()));
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("bind worker endpoint: {}", path.display()))?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod worker endpoint: {}", path.display()))?;
    }

    Ok(listener)
}
