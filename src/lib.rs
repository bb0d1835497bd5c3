//! forkserve - prefork TCP server with supervised worker processes.
//!
//! One listener process owns every TCP connection and multiplexes their
//! I/O. Worker processes run the user callbacks and never touch a peer
//! socket. They talk to the listener over one Unix socket each, using a
//! small line protocol.
//!
//! # Architecture
//!
//! - **Router** - listener loop: accepts peers, pins each one to a worker by
//!   CRC32 of its address, relays events and applies worker commands
//! - **Supervisor** - forks the workers, respawns crashed ones under the
//!   same id, forwards termination signals
//! - **Worker** - per-process runtime feeding events to [`Handlers`]
//! - **IPC** - `kind|peer|payload` lines between router and workers
//!
//! # Modules
//!
//! - [`server`] - public [`Server`] facade
//! - [`config`] - configuration loading and merging
//! - [`ipc`] - wire protocol and channels
//! - [`lifecycle`] - shutdown state machine and signal intake

// Library modules
pub mod config;
pub mod constants;
pub mod ipc;
pub mod lifecycle;
pub mod poller;
pub mod process;
pub mod router;
pub mod routing;
pub mod server;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types
pub use config::ServerConfig;
pub use lifecycle::{Lifecycle, Notification};
pub use routing::route;
pub use server::Server;
pub use worker::{Handlers, WorkerContext};
