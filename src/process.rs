//! Process management primitives for the supervisor and the listener.
//!
//! Thin wrappers over `fork(2)`, `kill(2)` and `waitpid(2)`, plus the
//! [`ProcessOps`] seam the supervisor drives so the reap loop can run
//! against a fake in tests.
//!
//! # Child side of a fork
//!
//! [`spawn`] never returns in the child. The entry closure runs under
//! `catch_unwind`, its outcome becomes the exit code and the child leaves
//! via `_exit`, so a failing child can never unwind back into the parent's
//! copy of the call stack.
//!
//! Rust guideline compliant 2026-02

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use anyhow::{Context, Result};

/// Operating-system process identifier.
pub type Pid = libc::pid_t;

/// Exit code of a child whose entry function returned `Ok`.
pub const EXIT_OK: i32 = 0;
/// Exit code of a child whose entry function returned `Err`.
pub const EXIT_ERROR: i32 = 1;
/// Exit code of a child whose entry function panicked.
pub const EXIT_PANIC: i32 = 101;

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited normally with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(libc::c_int),
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exit code {code}"),
            ExitKind::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Outcome of a non-blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    /// A child ended and was reaped.
    Child {
        /// Identifier of the reaped child.
        pid: Pid,
        /// How it ended.
        kind: ExitKind,
    },
    /// Children exist but none changed state.
    Pending,
    /// There are no children left to wait for.
    NoChildren,
}

/// Fork the current process and run `entry` in the child.
///
/// Returns the child's pid in the parent. In the child, `entry` runs and the
/// process exits with [`EXIT_OK`], [`EXIT_ERROR`] or [`EXIT_PANIC`].
pub fn spawn<F>(entry: F) -> Result<Pid>
where
    F: FnOnce() -> Result<()>,
{
    // SAFETY: the child only runs `entry` and then `_exit`s; it never returns
    // into code that assumes the parent's threads or locks still exist.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(io::Error::last_os_error()).context("fork"),
        0 => run_child(entry),
        pid => Ok(pid),
    }
}

fn run_child<F>(entry: F) -> !
where
    F: FnOnce() -> Result<()>,
{
    let code = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(Ok(())) => EXIT_OK,
        Ok(Err(e)) => {
            log::error!("[process {}] exiting on error: {e:#}", std::process::id());
            EXIT_ERROR
        }
        Err(_) => {
            log::error!("[process {}] exiting after panic", std::process::id());
            EXIT_PANIC
        }
    };
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    // SAFETY: `_exit` terminates the process immediately; nothing runs after it.
    unsafe { libc::_exit(code) }
}

/// Send `signal` to `pid`. Returns whether the signal was delivered.
pub fn kill(pid: Pid, signal: libc::c_int) -> bool {
    // SAFETY: kill has no memory-safety preconditions.
    let delivered = unsafe { libc::kill(pid, signal) } == 0;
    if !delivered {
        log::debug!(
            "kill({pid}, {signal}) failed: {}",
            io::Error::last_os_error()
        );
    }
    delivered
}

/// Reap any one child without blocking.
pub fn try_wait_any() -> Result<Reaped> {
    wait_nohang(-1)
}

/// Reap `pid` without blocking.
///
/// Returns `Some` once the child has ended; `None` while it is running.
pub fn try_wait(pid: Pid) -> Result<Option<ExitKind>> {
    match wait_nohang(pid)? {
        Reaped::Child { kind, .. } => Ok(Some(kind)),
        Reaped::Pending => Ok(None),
        Reaped::NoChildren => Ok(Some(ExitKind::Exited(EXIT_OK))),
    }
}

fn wait_nohang(target: Pid) -> Result<Reaped> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let pid = unsafe { libc::waitpid(target, &mut status, libc::WNOHANG) };
        if pid == 0 {
            return Ok(Reaped::Pending);
        }
        if pid < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ECHILD) => Ok(Reaped::NoChildren),
                Some(libc::EINTR) => continue,
                _ => Err(err).context("waitpid"),
            };
        }
        if libc::WIFEXITED(status) {
            return Ok(Reaped::Child { pid, kind: ExitKind::Exited(libc::WEXITSTATUS(status)) });
        }
        if libc::WIFSIGNALED(status) {
            return Ok(Reaped::Child { pid, kind: ExitKind::Signaled(libc::WTERMSIG(status)) });
        }
        // Stopped/continued reports are not requested; keep waiting.
    }
}

/// Entry function run inside a worker process, given its worker id.
pub type EntryFn = dyn Fn(usize) -> Result<()>;

/// Process control as seen by the supervisor.
pub trait ProcessOps {
    /// Start a child running `entry(worker_id)`.
    fn spawn(&mut self, worker_id: usize, entry: &EntryFn) -> Result<Pid>;
    /// Deliver `signal` to `pid`.
    fn kill(&mut self, pid: Pid, signal: libc::c_int);
    /// Reap one child without blocking.
    fn try_wait_any(&mut self) -> Result<Reaped>;
    /// Sleep before the next reap attempt.
    fn pause(&mut self, interval: Duration);
}

/// [`ProcessOps`] backed by real `fork`/`kill`/`waitpid`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkOps;

impl ProcessOps for ForkOps {
    fn spawn(&mut self, worker_id: usize, entry: &EntryFn) -> Result<Pid> {
        spawn(|| {
            crate::lifecycle::reset_child_signals();
            entry(worker_id)
        })
        .with_context(|| format!("spawn worker {worker_id}"))
    }

    fn kill(&mut self, pid: Pid, signal: libc::c_int) {
        kill(pid, signal);
    }

    fn try_wait_any(&mut self) -> Result<Reaped> {
        try_wait_any()
    }

    fn pause(&mut self, interval: Duration) {
        std::thread::sleep(interval);
    }
}
