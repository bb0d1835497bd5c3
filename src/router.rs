//! Listener/Router: the top-level process loop.
//!
//! Owns the public TCP socket, every accepted peer and the listener end of
//! each worker's IPC channel. One thread, one `poll(2)` set:
//!
//! ```text
//!            ┌──────────── Router ─────────────┐
//! TCP peer ─►│ Peer(addr) ──receive/close──┐   │
//!            │                             ▼   │
//!            │ Listener ──connect──► Worker(id)│◄──► worker process
//! TCP peer ◄─│ Peer(addr) ◄──send/close────┘   │
//!            └─────────────────────────────────┘
//! ```
//!
//! Each peer is pinned to `route(addr, worker_num)`, so every event for a
//! peer travels over the same worker channel in the order it was read.
//! Worker channels are opened on first use and reopened after a failure.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::constants::{BACKLOG_HIGH_WATER, PEER_BACKLOG_LIMIT, POLL_INTERVAL, READ_BUFFER_SIZE};
use crate::ipc::{endpoint_path, Channel, Command, Event, OutboundQueue, ReadOutcome, WorkerChannel};
use crate::lifecycle::{Lifecycle, Notification, NotificationSource};
use crate::poller::{Interest, Poller};
use crate::process::{self, Pid};
use crate::routing::route;

/// What a readiness entry stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// The public TCP listening socket.
    Listener,
    /// An accepted TCP peer, keyed by its `ip:port`.
    Peer(String),
    /// A peer its worker closed, still flushing queued replies.
    Closing(String),
    /// The IPC channel to a worker.
    Worker(usize),
}

/// An accepted, non-blocking TCP peer.
#[derive(Debug)]
struct PeerConn {
    stream: TcpStream,
    worker_id: usize,
    outbound: OutboundQueue,
}

impl PeerConn {
    fn flush(&mut self) -> io::Result<()> {
        self.outbound.write_to(&mut self.stream)
    }
}

/// Listener-side state and event loop.
#[derive(Debug)]
pub struct Router {
    listener: TcpListener,
    runtime_dir: PathBuf,
    worker_num: usize,
    peers: HashMap<String, PeerConn>,
    closing: HashMap<String, PeerConn>,
    workers: HashMap<usize, WorkerChannel>,
    poller: Poller<Role>,
    state: Lifecycle,
}

impl Router {
    /// Route peers accepted on `listener` to `worker_num` workers whose
    /// endpoints live in `runtime_dir`.
    pub fn new(listener: TcpListener, runtime_dir: PathBuf, worker_num: usize) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .context("set TCP listener non-blocking")?;
        Ok(Self {
            listener,
            runtime_dir,
            worker_num,
            peers: HashMap::new(),
            closing: HashMap::new(),
            workers: HashMap::new(),
            poller: Poller::new(),
            state: Lifecycle::Running,
        })
    }

    /// Address the TCP listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("TCP listener address")
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Number of tracked peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Run until the supervisor process `supervisor` has ended.
    ///
    /// Termination and broadcast signals are forwarded to the supervisor as
    /// received. On return all peers are closed and worker endpoint files
    /// are removed.
    pub fn run(&mut self, notifications: &mut dyn NotificationSource, supervisor: Pid) -> Result<()> {
        log::info!(
            "[router] routing {} to {} worker(s)",
            self.local_addr()?,
            self.worker_num
        );

        let result = self.run_until_stopped(notifications, supervisor);
        self.shutdown();
        result
    }

    fn run_until_stopped(
        &mut self,
        notifications: &mut dyn NotificationSource,
        supervisor: Pid,
    ) -> Result<()> {
        while self.state.is_live() {
            for notification in notifications.pending() {
                if let Some(signal) = self.notify(notification) {
                    process::kill(supervisor, signal);
                }
            }

            match process::try_wait(supervisor) {
                Ok(None) => {}
                Ok(Some(kind)) => {
                    log::info!("[router] supervisor (pid {supervisor}) exited with {kind}");
                    self.notify(Notification::ChildrenGone);
                    continue;
                }
                Err(e) => {
                    log::error!("[router] lost track of supervisor (pid {supervisor}): {e:#}");
                    self.notify(Notification::ChildrenGone);
                    continue;
                }
            }

            self.run_once(POLL_INTERVAL)?;
        }
        Ok(())
    }

    /// Fold one notification into the lifecycle.
    ///
    /// Returns the signal to forward to the supervisor, if any.
    pub fn notify(&mut self, notification: Notification) -> Option<libc::c_int> {
        self.state = self.state.on(notification);
        match notification {
            Notification::Terminate { signal } => {
                log::info!("[router] signal {signal}: no longer accepting, waiting for workers");
                Some(signal)
            }
            Notification::RestartAll { signal } => {
                log::info!("[router] signal {signal}: restarting workers");
                Some(signal)
            }
            Notification::ChildrenGone => None,
        }
    }

    /// One poll cycle: wait up to `timeout`, then handle ready sources.
    ///
    /// Sources are registered and therefore handled in role order: the
    /// listener (only while running), worker channels, then peers. Nothing
    /// here blocks beyond the poll itself, except opening a worker channel.
    ///
    /// A peer is not read while its replies or its worker channel are
    /// backed up past [`BACKLOG_HIGH_WATER`].
    pub fn run_once(&mut self, timeout: Duration) -> Result<()> {
        let Self { listener, peers, closing, workers, poller, state, .. } = self;
        poller.clear();
        if *state == Lifecycle::Running {
            poller.register(&*listener, Role::Listener);
        }
        for (worker_id, channel) in workers.iter() {
            let interest = Interest::new(true, channel.wants_write());
            poller.register_with(channel, Role::Worker(*worker_id), interest);
        }
        for (peer, conn) in peers.iter() {
            let worker_backlog = workers.get(&conn.worker_id).map_or(0, WorkerChannel::backlog);
            let throttled =
                conn.outbound.len() >= BACKLOG_HIGH_WATER || worker_backlog >= BACKLOG_HIGH_WATER;
            let interest = Interest::new(!throttled, !conn.outbound.is_empty());
            if !interest.is_none() {
                poller.register_with(&conn.stream, Role::Peer(peer.clone()), interest);
            }
        }
        for (peer, conn) in closing.iter() {
            poller.register_with(&conn.stream, Role::Closing(peer.clone()), Interest::WRITABLE);
        }

        for ready in self.poller.poll(timeout).context("poll")? {
            match ready.tag {
                Role::Listener => self.accept(),
                Role::Worker(worker_id) => {
                    if ready.writable {
                        self.flush_worker(worker_id);
                    }
                    if ready.readable {
                        self.drain_worker(worker_id);
                    }
                }
                Role::Peer(peer) => {
                    if ready.writable {
                        self.flush_peer(&peer);
                    }
                    if ready.readable {
                        self.read_peer(&peer);
                    }
                }
                Role::Closing(peer) => self.flush_closing(&peer),
            }
        }
        Ok(())
    }

    fn accept(&mut self) {
        match self.listener.accept() {
            Ok((stream, addr)) => self.admit(stream, addr.to_string()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("[router] accept failed: {e}"),
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: String) {
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("[router] failed to configure {peer}: {e}");
            return;
        }

        let Some(worker_id) = route(&peer, self.worker_num) else {
            log::warn!("[router] no workers configured, dropping {peer}");
            return;
        };

        if self.send_to_worker(worker_id, &Event::Connect { peer: peer.clone() }) {
            log::debug!("[router] {peer} connected, worker {worker_id}");
            let conn = PeerConn { stream, worker_id, outbound: OutboundQueue::new() };
            if let Some(mut stale) = self.peers.insert(peer, conn) {
                stale.stream.close();
            }
        } else {
            log::warn!("[router] worker {worker_id} unreachable, dropping {peer}");
        }
    }

    fn read_peer(&mut self, peer: &str) {
        let Some(conn) = self.peers.get_mut(peer) else {
            return;
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        match conn.stream.read(&mut buf) {
            Ok(0) => {
                log::debug!("[router] {peer} disconnected");
                self.drop_peer(peer, true);
            }
            Ok(n) => {
                let worker_id = conn.worker_id;
                let event = Event::Receive {
                    peer: peer.to_owned(),
                    payload: buf[..n].to_vec(),
                };
                if !self.send_to_worker(worker_id, &event) {
                    log::warn!("[router] could not forward data from {peer}, dropping it");
                    self.drop_peer(peer, false);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                log::debug!("[router] read from {peer} failed: {e}");
                self.drop_peer(peer, true);
            }
        }
    }

    fn flush_peer(&mut self, peer: &str) {
        let Some(conn) = self.peers.get_mut(peer) else {
            return;
        };
        if let Err(e) = conn.flush() {
            log::debug!("[router] write to {peer} failed: {e}");
            self.drop_peer(peer, true);
        }
    }

    fn flush_closing(&mut self, peer: &str) {
        let Some(conn) = self.closing.get_mut(peer) else {
            return;
        };
        let done = match conn.flush() {
            Ok(()) => conn.outbound.is_empty(),
            Err(e) => {
                log::debug!("[router] final write to {peer} failed: {e}");
                true
            }
        };
        if done {
            if let Some(mut conn) = self.closing.remove(peer) {
                conn.stream.close();
            }
        }
    }

    fn flush_worker(&mut self, worker_id: usize) {
        let Some(channel) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if let Err(e) = channel.flush() {
            log::warn!("[router] {e:#}, dropping channel");
            self.workers.remove(&worker_id);
        }
    }

    fn drain_worker(&mut self, worker_id: usize) {
        let Some(channel) = self.workers.get_mut(&worker_id) else {
            return;
        };

        match channel.read_commands() {
            Ok(ReadOutcome::Messages(commands)) => {
                for command in commands {
                    match command {
                        Ok(command) => self.apply(command),
                        Err(e) => log::warn!("[router] worker {worker_id}: {e:#}"),
                    }
                }
            }
            Ok(ReadOutcome::Closed) => {
                log::info!("[router] worker {worker_id} channel closed");
                self.workers.remove(&worker_id);
            }
            Err(e) => {
                log::warn!("[router] worker {worker_id} channel failed: {e:#}");
                self.workers.remove(&worker_id);
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Send { peer, payload } => {
                let Some(conn) = self.peers.get_mut(&peer) else {
                    log::debug!("[router] send to unknown peer {peer} ignored");
                    return;
                };
                conn.outbound.push(&payload);
                match conn.flush() {
                    Err(e) => {
                        log::debug!("[router] write to {peer} failed: {e}");
                        self.drop_peer(&peer, true);
                    }
                    Ok(()) if conn.outbound.len() > PEER_BACKLOG_LIMIT => {
                        log::warn!(
                            "[router] {peer} left {} bytes unread, dropping it",
                            conn.outbound.len()
                        );
                        self.drop_peer(&peer, true);
                    }
                    Ok(()) => {}
                }
            }
            Command::Close { peer } => match self.peers.remove(&peer) {
                Some(conn) => {
                    log::debug!("[router] closing {peer} on worker request");
                    self.linger(peer, conn);
                }
                None => log::debug!("[router] close for unknown peer {peer} ignored"),
            },
        }
    }

    /// Close `conn` once its queued replies are written.
    fn linger(&mut self, peer: String, mut conn: PeerConn) {
        match conn.flush() {
            Ok(()) if !conn.outbound.is_empty() => {
                self.closing.insert(peer, conn);
            }
            Ok(()) => conn.stream.close(),
            Err(e) => {
                log::debug!("[router] final write to {peer} failed: {e}");
                conn.stream.close();
            }
        }
    }

    /// Remove `peer`, optionally telling its worker with a `close` event.
    fn drop_peer(&mut self, peer: &str, notify_worker: bool) {
        let Some(mut conn) = self.peers.remove(peer) else {
            return;
        };
        conn.stream.close();

        if notify_worker {
            self.send_to_worker(conn.worker_id, &Event::Close { peer: peer.to_owned() });
        }
    }

    /// Queue `event` for a worker, reconnecting once if the channel is broken.
    fn send_to_worker(&mut self, worker_id: usize, event: &Event) -> bool {
        for _ in 0..2 {
            let channel = match self.worker_channel(worker_id) {
                Ok(channel) => channel,
                Err(e) => {
                    log::error!("[router] {e:#}");
                    return false;
                }
            };
            match channel.send(event) {
                Ok(()) => return true,
                Err(e) => {
                    log::warn!("[router] {e:#}, reconnecting");
                    self.workers.remove(&worker_id);
                }
            }
        }
        false
    }

    fn worker_channel(&mut self, worker_id: usize) -> Result<&mut WorkerChannel> {
        match self.workers.entry(worker_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(_) if self.state != Lifecycle::Running => {
                bail!("worker {worker_id} channel is gone and workers are shutting down")
            }
            Entry::Vacant(entry) => {
                let path = endpoint_path(&self.runtime_dir, worker_id)?;
                Ok(entry.insert(WorkerChannel::connect(worker_id, &path)?))
            }
        }
    }

    /// Close every peer and worker channel and remove worker endpoint files.
    ///
    /// Queued replies get one last non-blocking write attempt.
    pub fn shutdown(&mut self) {
        for (_, mut conn) in self.peers.drain().chain(self.closing.drain()) {
            let _ = conn.flush();
            conn.stream.close();
        }
        self.workers.clear();

        for worker_id in 0..self.worker_num {
            let Ok(path) = endpoint_path(&self.runtime_dir, worker_id) else {
                continue;
            };
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("[router] removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("[router] failed to remove {}: {e}", path.display()),
            }
        }
        // Only succeeds once empty; a shared directory is left alone.
        let _ = std::fs::remove_dir(&self.runtime_dir);
    }
}
