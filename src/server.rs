//! Public entry point tying the three process tiers together.
//!
//! ```text
//! forkserve (listener, Router)
//!   └── supervisor (Supervisor)
//!         ├── worker 0 (worker::run)
//!         ├── worker 1
//!         └── ...
//! ```
//!
//! [`Server::start`] binds the TCP socket first, so a bind failure leaves
//! nothing behind. It then forks the supervisor, which forks the workers,
//! and runs the router in the calling process until the supervisor ends.

use std::net::TcpListener;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::config::ServerConfig;
use crate::ipc::endpoint_path;
use crate::lifecycle::{self, SignalBlock, SignalNotifications};
use crate::process::{self, Pid};
use crate::router::Router;
use crate::supervisor::Supervisor;
use crate::worker::{self, Handlers, WorkerContext, WorkerSetup};

/// A prefork TCP server.
///
/// ```no_run
/// let mut server = forkserve::Server::new("127.0.0.1", 9000);
/// server.set(serde_json::json!({"worker_num": 4}))?;
/// server.on_receive(|ctx, peer, payload| {
///     ctx.send(peer, payload);
///     Ok(())
/// });
/// server.start()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct Server {
    host: String,
    port: u16,
    config: ServerConfig,
    handlers: Handlers,
}

impl Server {
    /// Server for `host:port` with the default configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_config(host, port, ServerConfig::default())
    }

    /// Server for `host:port` with an explicit configuration.
    pub fn with_config(host: impl Into<String>, port: u16, config: ServerConfig) -> Self {
        Self {
            host: host.into(),
            port,
            config,
            handlers: Handlers::new(),
        }
    }

    /// Merge a JSON object of options into the configuration.
    ///
    /// See [`ServerConfig::merge`].
    pub fn set(&mut self, options: Value) -> Result<()> {
        self.config.merge(&options)
    }

    /// Current configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Hook run in each worker process before it starts serving.
    pub fn on_worker_start<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(usize) -> Result<()> + 'static,
    {
        self.handlers.on_worker_start(f);
        self
    }

    /// Callback for a newly accepted peer.
    pub fn on_connect<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut WorkerContext<'_>, &str) -> Result<()> + 'static,
    {
        self.handlers.on_connect(f);
        self
    }

    /// Callback for a peer that disconnected.
    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut WorkerContext<'_>, &str) -> Result<()> + 'static,
    {
        self.handlers.on_close(f);
        self
    }

    /// Callback for data received from a peer.
    pub fn on_receive<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut WorkerContext<'_>, &str, &[u8]) -> Result<()> + 'static,
    {
        self.handlers.on_receive(f);
        self
    }

    /// Bind, spawn the workers and serve until shut down by a signal.
    ///
    /// # Errors
    ///
    /// Startup failures: the TCP bind, the runtime directory, an endpoint
    /// path that is too long, the fork of the supervisor or signal
    /// registration.
    pub fn start(self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .with_context(|| format!("bind {}:{}", self.host, self.port))?;
        let addr = listener.local_addr().context("TCP listener address")?;

        let worker_num = self.config.worker_num;
        let runtime_dir = self.config.resolved_runtime_dir(addr.port());
        prepare_runtime_dir(&runtime_dir, worker_num)?;
        log::info!(
            "[server] listening on {addr}, {worker_num} worker(s), endpoints in {}",
            runtime_dir.display()
        );

        let setup = Rc::new(WorkerSetup {
            runtime_dir: runtime_dir.clone(),
            handlers: self.handlers,
        });
        let listener_fd = listener.as_raw_fd();
        // Held until the router's handlers are installed; the supervisor
        // inherits the block and lifts it after installing its own.
        let blocked = SignalBlock::new()?;
        let supervisor = process::spawn(move || {
            // The supervisor never accepts; only the listener process keeps
            // the TCP socket open.
            // SAFETY: `listener_fd` is this process's inherited copy and the
            // owning `TcpListener` is never dropped here because the child
            // leaves through `_exit`.
            unsafe {
                libc::close(listener_fd);
            }
            run_supervisor(worker_num, setup)
        })
        .context("fork supervisor")?;
        log::info!("[server] supervisor started (pid {supervisor})");

        let notifications = SignalNotifications::register();
        drop(blocked);
        let result = notifications.and_then(|mut notifications| {
            let mut router = Router::new(listener, runtime_dir, worker_num)?;
            router.run(&mut notifications, supervisor)
        });
        if let Err(e) = &result {
            log::error!("[server] {e:#}; stopping supervisor");
            stop_supervisor(supervisor);
        }
        log::info!("[server] stopped");
        result
    }
}

/// Supervisor process body. Starts with the lifecycle signals blocked.
fn run_supervisor(worker_num: usize, setup: Rc<WorkerSetup>) -> Result<()> {
    let mut notifications = SignalNotifications::register()?;
    lifecycle::unblock_signals()?;
    let mut supervisor = Supervisor::new();
    supervisor.add_batch(worker_num, Rc::new(move |worker_id| worker::run(worker_id, &setup)));
    supervisor.start(&mut notifications)
}

fn stop_supervisor(supervisor: Pid) {
    process::kill(supervisor, libc::SIGTERM);
}

/// Create the endpoint directory (0700) and check every endpoint path fits.
fn prepare_runtime_dir(runtime_dir: &Path, worker_num: usize) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(runtime_dir)
        .with_context(|| format!("create runtime dir: {}", runtime_dir.display()))?;
    if let Some(last) = worker_num.checked_sub(1) {
        endpoint_path(runtime_dir, last)?;
    }
    Ok(())
}
