//! Worker runtime: the code that runs inside each forked worker process.
//!
//! A worker binds `{runtime_dir}/{worker_id}.sock`, accepts the listener's
//! connection and processes events from it strictly in arrival order. User
//! callbacks never touch peer sockets. They get a [`WorkerContext`] whose
//! `send`/`close` write commands back over the same IPC connection.
//!
//! If the listener disconnects the worker goes back to `accept`. A callback
//! returning `Err` ends the process with an error, and the supervisor
//! replaces it.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::constants::IPC_READ_BUFFER_SIZE;
use crate::ipc::protocol::{Command, Event, LineDecoder};
use crate::ipc::{bind_endpoint, endpoint_path};

/// Hook run once in each worker process before it binds its endpoint.
pub type WorkerStartFn = dyn Fn(usize) -> Result<()>;
/// Callback for `connect` and `close` events.
pub type PeerFn = dyn Fn(&mut WorkerContext<'_>, &str) -> Result<()>;
/// Callback for `receive` events.
pub type ReceiveFn = dyn Fn(&mut WorkerContext<'_>, &str, &[u8]) -> Result<()>;

/// User callbacks, one optional slot per event.
///
/// Registering a callback for an event replaces any earlier one.
#[derive(Default)]
pub struct Handlers {
    worker_start: Option<Box<WorkerStartFn>>,
    connect: Option<Box<PeerFn>>,
    close: Option<Box<PeerFn>>,
    receive: Option<Box<ReceiveFn>>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("worker_start", &self.worker_start.is_some())
            .field("connect", &self.connect.is_some())
            .field("close", &self.close.is_some())
            .field("receive", &self.receive.is_some())
            .finish()
    }
}

impl Handlers {
    /// Empty handler set; every event is accepted and ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the per-process start hook.
    pub fn on_worker_start<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(usize) -> Result<()> + 'static,
    {
        self.worker_start = Some(Box::new(f));
        self
    }

    /// Register the `connect` callback.
    pub fn on_connect<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut WorkerContext<'_>, &str) -> Result<()> + 'static,
    {
        self.connect = Some(Box::new(f));
        self
    }

    /// Register the `close` callback.
    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut WorkerContext<'_>, &str) -> Result<()> + 'static,
    {
        self.close = Some(Box::new(f));
        self
    }

    /// Register the `receive` callback.
    pub fn on_receive<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut WorkerContext<'_>, &str, &[u8]) -> Result<()> + 'static,
    {
        self.receive = Some(Box::new(f));
        self
    }

    fn dispatch(&self, ctx: &mut WorkerContext<'_>, event: &Event) -> Result<()> {
        match event {
            Event::Connect { peer } => match &self.connect {
                Some(f) => f(ctx, peer).with_context(|| format!("connect callback for {peer}")),
                None => Ok(()),
            },
            Event::Receive { peer, payload } => match &self.receive {
                Some(f) => f(ctx, peer, payload)
                    .with_context(|| format!("receive callback for {peer}")),
                None => Ok(()),
            },
            Event::Close { peer } => match &self.close {
                Some(f) => f(ctx, peer).with_context(|| format!("close callback for {peer}")),
                None => Ok(()),
            },
        }
    }
}

/// Everything a worker process needs, handed to it at spawn time.
#[derive(Debug)]
pub struct WorkerSetup {
    /// Directory holding the worker endpoints.
    pub runtime_dir: PathBuf,
    /// User callbacks.
    pub handlers: Handlers,
}

/// Capability handle passed into every callback.
///
/// Writes `send`/`close` commands to the listener over the worker's IPC
/// connection.
pub struct WorkerContext<'a> {
    worker_id: usize,
    writer: &'a mut dyn Write,
}

impl std::fmt::Debug for WorkerContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl<'a> WorkerContext<'a> {
    /// Context for worker `worker_id` writing commands to `writer`.
    pub fn new(worker_id: usize, writer: &'a mut dyn Write) -> Self {
        Self { worker_id, writer }
    }

    /// Id of the worker running this callback.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Ask the listener to write `payload` to `peer`.
    ///
    /// Returns whether the command reached the IPC connection.
    pub fn send(&mut self, peer: &str, payload: impl AsRef<[u8]>) -> bool {
        self.emit(&Command::Send {
            peer: peer.to_owned(),
            payload: payload.as_ref().to_vec(),
        })
    }

    /// Ask the listener to close `peer`.
    ///
    /// Returns whether the command reached the IPC connection.
    pub fn close(&mut self, peer: &str) -> bool {
        self.emit(&Command::Close { peer: peer.to_owned() })
    }

    fn emit(&mut self, command: &Command) -> bool {
        let result = command
            .encode()
            .and_then(|line| self.writer.write_all(&line).map_err(Into::into));
        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[worker {}] failed to emit command for {}: {e:#}", self.worker_id, command.peer());
                false
            }
        }
    }
}

/// Worker process entry point.
///
/// Runs the start hook, binds the endpoint and serves listener connections
/// one after another. Returns only on a fatal error.
pub fn run(worker_id: usize, setup: &WorkerSetup) -> Result<()> {
    log::info!("[worker {worker_id}] starting (pid {})", std::process::id());

    if let Some(start) = &setup.handlers.worker_start {
        start(worker_id).context("worker start hook")?;
    }

    let path = endpoint_path(&setup.runtime_dir, worker_id)?;
    let listener = bind_endpoint(&path)?;
    log::debug!("[worker {worker_id}] listening on {}", path.display());

    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted) => {
                log::debug!("[worker {worker_id}] accept interrupted: {e}");
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("accept on {}", path.display())),
        };
        log::debug!("[worker {worker_id}] listener connected");

        let mut writer = &stream;
        serve_connection(worker_id, &stream, &mut writer, &setup.handlers)?;
        log::info!("[worker {worker_id}] listener disconnected, waiting for reconnect");
    }
}

/// Process events read from `reader` until end of stream.
///
/// Malformed lines are logged and skipped. A callback error is returned.
pub fn serve_connection(
    worker_id: usize,
    mut reader: impl Read,
    writer: &mut dyn Write,
    handlers: &Handlers,
) -> Result<()> {
    let mut decoder = LineDecoder::new();
    let mut buf = [0u8; IPC_READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => break,
            Err(e) => return Err(e).context("read from listener"),
        };

        let lines = match decoder.feed(&buf[..n]) {
            Ok(lines) => lines,
            Err(e) => {
                log::error!("[worker {worker_id}] {e:#}, discarding buffered data");
                continue;
            }
        };

        for line in lines {
            let event = match Event::decode(&line) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("[worker {worker_id}] {e:#}");
                    continue;
                }
            };
            let mut ctx = WorkerContext::new(worker_id, writer);
            handlers.dispatch(&mut ctx, &event)?;
        }
    }

    if decoder.has_partial() {
        log::warn!("[worker {worker_id}] listener disconnected mid-line, dropping the partial event");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    use anyhow::bail;

    use crate::ipc::{ReadOutcome, WorkerChannel};

    fn recording_handlers(log: &Rc<RefCell<Vec<String>>>) -> Handlers {
        let mut handlers = Handlers::new();
        let l = Rc::clone(log);
        handlers.on_connect(move |_, peer| {
            l.borrow_mut().push(format!("connect {peer}"));
            Ok(())
        });
        let l = Rc::clone(log);
        handlers.on_receive(move |_, peer, payload| {
            l.borrow_mut().push(format!("receive {peer} {}", String::from_utf8_lossy(payload)));
            Ok(())
        });
        let l = Rc::clone(log);
        handlers.on_close(move |_, peer| {
            l.borrow_mut().push(format!("close {peer}"));
            Ok(())
        });
        handlers
    }

    fn lines(events: &[Event]) -> Vec<u8> {
        events.iter().flat_map(|e| e.encode().unwrap()).collect()
    }

    #[test]
    fn test_events_are_dispatched_in_arrival_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let handlers = recording_handlers(&log);
        let peer = "10.0.0.1:5000".to_string();
        let input = lines(&[
            Event::Connect { peer: peer.clone() },
            Event::Receive { peer: peer.clone(), payload: b"a".to_vec() },
            Event::Receive { peer: peer.clone(), payload: b"b".to_vec() },
            Event::Close { peer: peer.clone() },
        ]);

        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(&input).unwrap();
        drop(theirs);

        let mut out = Vec::new();
        serve_connection(0, &ours, &mut out, &handlers).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "connect 10.0.0.1:5000",
                "receive 10.0.0.1:5000 a",
                "receive 10.0.0.1:5000 b",
                "close 10.0.0.1:5000",
            ]
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_unknown_event_is_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let handlers = recording_handlers(&log);
        let input: &[u8] = b"explode|p:1|\nreceive|p:1|x\n";

        let mut out = Vec::new();
        serve_connection(0, input, &mut out, &handlers).unwrap();
        assert_eq!(*log.borrow(), vec!["receive p:1 x"]);
    }

    #[test]
    fn test_line_split_across_reads() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let handlers = recording_handlers(&log);
        let input = lines(&[Event::Receive { peer: "p:1".into(), payload: b"hello".to_vec() }]);
        let (first, second) = input.split_at(5);
        let reader = first.chain(second);

        let mut out = Vec::new();
        serve_connection(0, reader, &mut out, &handlers).unwrap();
        assert_eq!(*log.borrow(), vec!["receive p:1 hello"]);
    }

    #[test]
    fn test_partial_line_at_end_of_stream_is_not_dispatched() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let handlers = recording_handlers(&log);
        let input: &[u8] = b"receive|p:1|whole\nreceive|p:1|cut sh";

        let mut out = Vec::new();
        serve_connection(0, input, &mut out, &handlers).unwrap();
        assert_eq!(*log.borrow(), vec!["receive p:1 whole"]);
    }

    #[test]
    fn test_context_send_and_close_emit_commands() {
        let mut handlers = Handlers::new();
        handlers.on_receive(|ctx, peer, payload| {
            assert_eq!(ctx.worker_id(), 4);
            assert!(ctx.send(peer, [payload, b"!".as_slice()].concat()));
            assert!(ctx.close(peer));
            Ok(())
        });
        let input = lines(&[Event::Receive { peer: "p:9".into(), payload: b"hi".to_vec() }]);

        let mut out = Vec::new();
        serve_connection(4, input.as_slice(), &mut out, &handlers).unwrap();
        assert_eq!(out, b"send|p:9|hi!\nclose|p:9|\n");
    }

    #[test]
    fn test_send_to_invalid_peer_reports_failure() {
        let mut out = Vec::new();
        let mut ctx = WorkerContext::new(0, &mut out);
        assert!(!ctx.send("bad|peer", "x"));
        assert!(out.is_empty());
    }

    #[test]
    fn test_callback_error_stops_serving() {
        let mut handlers = Handlers::new();
        handlers.on_connect(|_, _| bail!("boom"));
        let input: &[u8] = b"connect|p:1|\nconnect|p:2|\n";

        let mut out = Vec::new();
        let err = serve_connection(0, input, &mut out, &handlers).unwrap_err();
        assert!(format!("{err:#}").contains("boom"), "{err:#}");
        assert!(err.to_string().contains("p:1"), "{err}");
    }

    #[test]
    fn test_registering_twice_replaces_handler() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut handlers = Handlers::new();
        let l = Rc::clone(&log);
        handlers.on_connect(move |_, _| {
            l.borrow_mut().push("first");
            Ok(())
        });
        let l = Rc::clone(&log);
        handlers.on_connect(move |_, _| {
            l.borrow_mut().push("second");
            Ok(())
        });

        let mut out = Vec::new();
        serve_connection(0, b"connect|p:1|\n".as_slice(), &mut out, &handlers).unwrap();
        assert_eq!(*log.borrow(), vec!["second"]);
    }

    #[test]
    fn test_run_serves_listener_over_endpoint() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runtime_dir = tmp.path().to_path_buf();
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let dir = runtime_dir.clone();
        std::thread::spawn(move || {
            let mut handlers = Handlers::new();
            handlers.on_worker_start(move |id| {
                started_tx.send(id).unwrap();
                Ok(())
            });
            handlers.on_receive(|ctx, peer, payload| {
                ctx.send(peer, payload);
                Ok(())
            });
            let setup = WorkerSetup { runtime_dir: dir, handlers };
            let _ = run(3, &setup);
        });

        let path = endpoint_path(&runtime_dir, 3).unwrap();
        let mut channel = WorkerChannel::connect(3, &path).unwrap();
        assert_eq!(started_rx.recv().unwrap(), 3);

        channel
            .send(&Event::Receive { peer: "127.0.0.1:1".into(), payload: b"echo".to_vec() })
            .unwrap();
        let mut commands = Vec::new();
        while commands.is_empty() {
            match channel.read_commands().unwrap() {
                ReadOutcome::Messages(batch) => commands.extend(batch),
                ReadOutcome::Closed => panic!("Worker closed the channel"),
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(
            commands[0].as_ref().unwrap(),
            &Command::Send { peer: "127.0.0.1:1".into(), payload: b"echo".to_vec() }
        );
    }
}
