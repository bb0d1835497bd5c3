//! Unix domain socket IPC between the listener and its workers.
//!
//! Each worker binds one endpoint and accepts one long-lived connection
//! from the listener. Every peer routed to that worker shares the
//! connection; the peer address in each line demultiplexes them.
//!
//! # Architecture
//!
//! ```text
//! Listener Process                         Worker Process (id N)
//! ┌───────────────────┐                   ┌───────────────────┐
//! │ Router            │  connect/receive/ │ WorkerRuntime     │
//! │  WorkerChannel N ─┼──── close ───────►│  UnixListener     │
//! │                   │◄─── send/close ───┼─ {runtime}/N.sock │
//! └───────────────────┘                   └───────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! Newline-terminated lines: `kind|peer|payload`.
//!
//! See [`protocol`] for kinds, escaping and the decoder.
//!
//! Rust guideline compliant 2026-02

pub mod channel;
pub mod protocol;

pub use channel::{bind_endpoint, endpoint_path, Channel, OutboundQueue, ReadOutcome, WorkerChannel};
pub use protocol::{Command, Event, LineDecoder};
