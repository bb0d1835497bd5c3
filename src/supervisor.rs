//! Worker process supervisor.
//!
//! Owns a fixed set of [`WorkerSlot`]s. Each slot keeps its worker id for
//! the lifetime of the server while the pid behind it churns: a child that
//! exits is replaced with a new process under the same id as long as the
//! [`Lifecycle`] is `Running`.
//!
//! The reap loop never blocks in `waitpid`. Each tick it folds pending
//! notifications into the lifecycle, then reaps at most one child, sleeping
//! [`REAP_INTERVAL`] when nothing changed. It ends when no children remain
//! and none are due to be respawned.

use std::rc::Rc;

use anyhow::Result;

use crate::constants::REAP_INTERVAL;
use crate::lifecycle::{Lifecycle, Notification, NotificationSource};
use crate::process::{EntryFn, ExitKind, ForkOps, Pid, ProcessOps, Reaped};

/// One worker position.
pub struct WorkerSlot {
    worker_id: usize,
    entry: Rc<EntryFn>,
    pid: Option<Pid>,
}

impl WorkerSlot {
    /// Stable worker id (0-based).
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Current process, if one is running.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }
}

impl std::fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("worker_id", &self.worker_id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Forks, reaps and restarts workers.
#[derive(Debug)]
pub struct Supervisor<P: ProcessOps = ForkOps> {
    ops: P,
    slots: Vec<WorkerSlot>,
    state: Lifecycle,
}

impl Supervisor<ForkOps> {
    /// Supervisor backed by real processes.
    pub fn new() -> Self {
        Self::with_ops(ForkOps)
    }
}

impl Default for Supervisor<ForkOps> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProcessOps> Supervisor<P> {
    /// Supervisor driving the given process operations.
    pub fn with_ops(ops: P) -> Self {
        Self {
            ops,
            slots: Vec::new(),
            state: Lifecycle::Running,
        }
    }

    /// Append `n` slots that all run `entry`, numbered after existing slots.
    pub fn add_batch(&mut self, n: usize, entry: Rc<EntryFn>) {
        let first = self.slots.len();
        self.slots.extend((first..first + n).map(|worker_id| WorkerSlot {
            worker_id,
            entry: Rc::clone(&entry),
            pid: None,
        }));
    }

    /// Current slots in worker id order.
    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Spawn every slot, then supervise until no children remain.
    ///
    /// Individual spawn failures are logged and retried on later ticks, even
    /// when no other child is left to wait for. Only an unexpected `waitpid`
    /// failure is returned.
    pub fn start(&mut self, notifications: &mut dyn NotificationSource) -> Result<()> {
        log::info!("[supervisor] starting {} worker(s)", self.slots.len());
        for index in 0..self.slots.len() {
            self.spawn_slot(index);
        }

        while self.state.is_live() {
            for notification in notifications.pending() {
                self.handle(notification);
            }

            match self.ops.try_wait_any()? {
                Reaped::NoChildren if self.state.restarts() && self.has_empty_slot() => {
                    log::warn!("[supervisor] no workers running, retrying failed spawns");
                    self.spawn_empty_slots();
                    self.ops.pause(REAP_INTERVAL);
                }
                Reaped::NoChildren => {
                    log::info!("[supervisor] no workers left");
                    self.state = self.state.on(Notification::ChildrenGone);
                }
                Reaped::Pending => {
                    if self.state.restarts() {
                        self.spawn_empty_slots();
                    }
                    self.ops.pause(REAP_INTERVAL);
                }
                Reaped::Child { pid, kind } => self.on_child_exit(pid, kind),
            }
        }

        log::info!("[supervisor] stopped");
        Ok(())
    }

    fn handle(&mut self, notification: Notification) {
        match notification {
            Notification::Terminate { signal } => {
                log::info!("[supervisor] signal {signal}: stopping workers");
                self.state = self.state.on(notification);
                self.kill_all(signal);
            }
            Notification::RestartAll { signal } => {
                log::info!("[supervisor] signal {signal}: restarting all workers");
                self.state = self.state.on(notification);
                self.kill_all(libc::SIGTERM);
            }
            Notification::ChildrenGone => {
                self.state = self.state.on(notification);
            }
        }
    }

    fn kill_all(&mut self, signal: libc::c_int) {
        for pid in self.slots.iter().filter_map(|slot| slot.pid) {
            self.ops.kill(pid, signal);
        }
    }

    fn on_child_exit(&mut self, pid: Pid, kind: ExitKind) {
        let Some(index) = self.slots.iter().position(|slot| slot.pid == Some(pid)) else {
            log::debug!("[supervisor] reaped untracked process {pid} ({kind})");
            return;
        };
        let worker_id = self.slots[index].worker_id;
        self.slots[index].pid = None;

        if self.state.restarts() {
            log::warn!("[supervisor] worker {worker_id} (pid {pid}) exited with {kind}, respawning");
            self.spawn_slot(index);
        } else {
            log::info!("[supervisor] worker {worker_id} (pid {pid}) exited with {kind}");
        }
    }

    fn has_empty_slot(&self) -> bool {
        self.slots.iter().any(|slot| slot.pid.is_none())
    }

    fn spawn_empty_slots(&mut self) {
        for index in 0..self.slots.len() {
            if self.slots[index].pid.is_none() {
                self.spawn_slot(index);
            }
        }
    }

    fn spawn_slot(&mut self, index: usize) {
        let worker_id = self.slots[index].worker_id;
        let entry = Rc::clone(&self.slots[index].entry);
        match self.ops.spawn(worker_id, &*entry) {
            Ok(pid) => {
                log::info!("[supervisor] worker {worker_id} started (pid {pid})");
                self.slots[index].pid = Some(pid);
            }
            Err(e) => {
                log::error!("[supervisor] failed to start worker {worker_id}: {e:#}");
                self.slots[index].pid = None;
            }
        }
    }
}
