//! Tuning constants shared by the listener, supervisor and workers.
//!
//! Grouped by the process tier that uses them. Anything an operator is
//! expected to change lives in [`crate::config::ServerConfig`] instead.

use std::time::Duration;

// ============================================================================
// Listener/Router
// ============================================================================

/// Readiness poll timeout for the listener loop.
///
/// Bounds how long a pending signal or a finished supervisor can go
/// unnoticed. The TCP listener is part of the poll set, so new peers
/// wake the loop immediately regardless of this value.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum bytes read from a TCP peer per readiness event.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Delay between attempts to reach a worker's IPC endpoint.
pub const WORKER_CONNECT_RETRY: Duration = Duration::from_millis(25);

/// How long the listener keeps retrying a worker endpoint before giving up.
///
/// Covers the window where a respawned worker has not yet re-bound its
/// socket.
pub const WORKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Queued bytes at which the listener stops reading more input.
///
/// A peer is not read while its own outbound queue or its worker channel's
/// outbound queue holds at least this much, so a slow consumer throttles
/// its producer instead of growing memory.
pub const BACKLOG_HIGH_WATER: usize = 256 * 1024;

/// Outbound bytes a peer may leave unread before it is disconnected.
///
/// Workers can push data a peer never asked for; past this limit the peer
/// is treated as gone.
pub const PEER_BACKLOG_LIMIT: usize = 16 * 1024 * 1024;

// ============================================================================
// Supervisor
// ============================================================================

/// Sleep between non-blocking `waitpid` polls when no child changed state.
pub const REAP_INTERVAL: Duration = Duration::from_millis(200);

// ============================================================================
// IPC
// ============================================================================

/// Maximum length of one framed line (16 MB).
pub const MAX_LINE_LEN: usize = 16 * 1024 * 1024;

/// Maximum path length for a Unix domain socket (macOS kernel limit; Linux
/// allows 108).
pub const MAX_SOCK_PATH: usize = 104;

/// Bytes read from a worker IPC connection per call.
pub const IPC_READ_BUFFER_SIZE: usize = 8192;

/// Reads taken from one readable worker channel per listener iteration.
pub const IPC_READS_PER_WAKE: usize = 16;
