// Shared helpers for tests that drive the `forkserve` binary.

#![allow(dead_code, reason = "each test file uses a different subset")]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

/// Upper bound for anything the server is expected to do "promptly".
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A `forkserve serve` process with its own port and runtime directory.
pub struct ServerProcess {
    child: Child,
    port: u16,
    _runtime: TempDir,
}

impl ServerProcess {
    /// Start `forkserve serve --app <app> --workers <workers>`.
    pub fn spawn(app: &str, workers: usize) -> Self {
        let runtime = TempDir::new().expect("Failed to create runtime dir");
        let port = free_port();
        let child = Command::new(env!("CARGO_BIN_EXE_forkserve"))
            .args(["serve", "--host", "127.0.0.1"])
            .args(["--port", &port.to_string()])
            .args(["--workers", &workers.to_string()])
            .args(["--app", app])
            .arg("--runtime-dir")
            .arg(runtime.path())
            .env_remove("FORKSERVE_WORKER_NUM")
            .env_remove("FORKSERVE_RUNTIME_DIR")
            .env_remove("FORKSERVE_LOG_FILE")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to spawn forkserve");

        let server = Self { child, port, _runtime: runtime };
        server.wait_until_listening();
        server
    }

    fn wait_until_listening(&self) {
        let deadline = Instant::now() + TIMEOUT;
        while TcpStream::connect(("127.0.0.1", self.port)).is_err() {
            assert!(Instant::now() < deadline, "forkserve never started listening");
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Pid of the listener process.
    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Open a client connection with a read timeout.
    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("Failed to connect");
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    /// Send `payload` on a fresh connection and read one `\n`-terminated reply.
    ///
    /// Returns `None` if the server dropped the connection first.
    pub fn request_line(&self, payload: &[u8]) -> Option<String> {
        let mut stream = self.connect();
        stream.write_all(payload).ok()?;
        read_line(&mut stream)
    }

    /// Deliver `signal` to the listener process.
    pub fn signal(&self, signal: i32) {
        send_signal(self.pid(), signal);
    }

    /// Wait up to `timeout` for the listener process to exit.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let start = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {
                    if start.elapsed() > timeout {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        self.signal(libc::SIGTERM);
        if self.wait_with_timeout(TIMEOUT).is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Reply of the `whoami` app: `worker_id:pid:ppid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhoAmI {
    pub worker_id: usize,
    pub pid: i32,
    pub ppid: i32,
}

impl WhoAmI {
    pub fn parse(line: &str) -> Self {
        let fields: Vec<&str> = line.trim_end().split(':').collect();
        assert_eq!(fields.len(), 3, "Unexpected whoami reply: {line:?}");
        Self {
            worker_id: fields[0].parse().unwrap(),
            pid: fields[1].parse().unwrap(),
            ppid: fields[2].parse().unwrap(),
        }
    }
}

/// Poll `probe` until it returns `Some` or [`TIMEOUT`] passes.
pub fn eventually<T>(mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if let Some(value) = probe() {
            return Some(value);
        }
        thread::sleep(Duration::from_millis(100));
    }
    None
}

/// Read until `\n` or EOF.
pub fn read_line(stream: &mut TcpStream) -> Option<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    return Some(String::from_utf8_lossy(&line).into_owned());
                }
            }
        }
    }
}

pub fn send_signal(pid: i32, signal: i32) {
    // SAFETY: kill has no memory-safety preconditions.
    unsafe {
        libc::kill(pid, signal);
    }
}

pub fn is_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to find a free port");
    listener.local_addr().unwrap().port()
}
