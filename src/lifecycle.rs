//! Shutdown state machine shared by the listener and the supervisor.
//!
//! Signals are turned into [`Notification`]s by a [`NotificationSource`]
//! and folded into a [`Lifecycle`] by the owning loop. Nothing is mutated
//! from inside a signal handler.
//!
//! ```text
//!            Terminate              ChildrenGone
//! Running ──────────────► Draining ─────────────► Stopped
//!    │  ▲                                            ▲
//!    └──┘ RestartAll                                 │
//!    └───────────────────── ChildrenGone ────────────┘
//! ```

use std::io;
use std::mem::MaybeUninit;

use anyhow::{Context, Result};
use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

/// Signals that start a full shutdown.
pub const TERMINATION_SIGNALS: [libc::c_int; 2] = [SIGTERM, SIGINT];

/// Signals that ask every worker to restart.
pub const BROADCAST_SIGNALS: [libc::c_int; 2] = [SIGUSR1, SIGUSR2];

/// Where a process tier is in its shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Normal operation; crashed workers are respawned.
    Running,
    /// Termination requested; children are exiting and are not replaced.
    Draining,
    /// Nothing left to supervise; the loop exits.
    Stopped,
}

/// A named occurrence that can move the [`Lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Termination signal received (SIGTERM, SIGINT).
    Terminate {
        /// The signal that triggered it, forwarded as-is.
        signal: libc::c_int,
    },
    /// Broadcast-restart signal received (SIGUSR1, SIGUSR2).
    RestartAll {
        /// The signal that triggered it.
        signal: libc::c_int,
    },
    /// Every supervised child has exited.
    ChildrenGone,
}

impl Notification {
    /// Map a delivered signal to its notification.
    pub fn from_signal(signal: libc::c_int) -> Option<Self> {
        if TERMINATION_SIGNALS.contains(&signal) {
            Some(Notification::Terminate { signal })
        } else if BROADCAST_SIGNALS.contains(&signal) {
            Some(Notification::RestartAll { signal })
        } else {
            None
        }
    }
}

impl Lifecycle {
    /// Apply one notification.
    pub fn on(self, notification: Notification) -> Self {
        match (self, notification) {
            (Lifecycle::Stopped, _) | (_, Notification::ChildrenGone) => Lifecycle::Stopped,
            (Lifecycle::Running | Lifecycle::Draining, Notification::Terminate { .. }) => {
                Lifecycle::Draining
            }
            (state, Notification::RestartAll { .. }) => state,
        }
    }

    /// Whether crashed children should be replaced.
    pub fn restarts(self) -> bool {
        self == Lifecycle::Running
    }

    /// Whether the owning loop should keep going.
    pub fn is_live(self) -> bool {
        self != Lifecycle::Stopped
    }
}

/// Non-blocking supply of pending notifications.
pub trait NotificationSource {
    /// Return every notification that arrived since the last call.
    fn pending(&mut self) -> Vec<Notification>;
}

impl NotificationSource for std::sync::mpsc::Receiver<Notification> {
    fn pending(&mut self) -> Vec<Notification> {
        self.try_iter().collect()
    }
}

/// Process signals delivered through signal-hook's self-pipe.
pub struct SignalNotifications {
    signals: Signals,
}

impl std::fmt::Debug for SignalNotifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalNotifications").finish_non_exhaustive()
    }
}

impl SignalNotifications {
    /// Install handlers for the termination and broadcast signals.
    pub fn register() -> Result<Self> {
        let mut wanted = TERMINATION_SIGNALS.to_vec();
        wanted.extend_from_slice(&BROADCAST_SIGNALS);
        let signals = Signals::new(&wanted).context("register signal handlers")?;
        Ok(Self { signals })
    }
}

impl NotificationSource for SignalNotifications {
    fn pending(&mut self) -> Vec<Notification> {
        self.signals
            .pending()
            .filter_map(Notification::from_signal)
            .collect()
    }
}

/// Keeps the termination and broadcast signals blocked for the calling
/// thread until dropped.
///
/// Signals that arrive in the meantime stay pending and reach whatever
/// handler is installed when the block is lifted. A child forked while the
/// guard is alive starts with the signals blocked and lifts them itself
/// with [`unblock_signals`].
#[derive(Debug)]
pub struct SignalBlock(());

impl SignalBlock {
    /// Block the signals.
    pub fn new() -> Result<Self> {
        set_mask(libc::SIG_BLOCK)?;
        Ok(Self(()))
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if let Err(e) = unblock_signals() {
            log::error!("{e:#}");
        }
    }
}

/// Unblock the termination and broadcast signals for the calling thread.
pub fn unblock_signals() -> Result<()> {
    set_mask(libc::SIG_UNBLOCK)
}

fn set_mask(how: libc::c_int) -> Result<()> {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset initializes `set` before sigaddset and
    // pthread_sigmask read it; every signal number is valid.
    let rc = unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        for signal in TERMINATION_SIGNALS.iter().chain(&BROADCAST_SIGNALS) {
            libc::sigaddset(set.as_mut_ptr(), *signal);
        }
        libc::pthread_sigmask(how, set.as_ptr(), std::ptr::null_mut())
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc)).context("pthread_sigmask");
    }
    Ok(())
}

/// Reset signal dispositions to the default in a freshly forked child so the
/// parent's handlers do not leak into it.
pub fn reset_child_signals() {
    for signal in TERMINATION_SIGNALS.iter().chain(&BROADCAST_SIGNALS) {
        // SAFETY: installing SIG_DFL for a valid signal number has no
        // memory-safety preconditions.
        unsafe {
            libc::signal(*signal, libc::SIG_DFL);
        }
    }
}
