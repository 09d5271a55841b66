//! Client side of the daemon socket: one-shot requests, compile
//! registrations and daemon auto-start.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::coordinator::Registration;
use crate::storage::Storage;

use super::protocol::{Request, Response, PROTOCOL_NAME, PROTOCOL_VERSION};

/// How long `ensure_daemon` waits for a freshly spawned daemon's socket.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Check if daemon is running by checking PID file and process.
pub fn is_daemon_running(root: &Path) -> bool {
    let pid_file = Storage::open(root).pid_path();

    // Read PID and check if process is alive
    let Ok(pid_str) = std::fs::read_to_string(&pid_file) else {
        return false;
    };
    match pid_str.trim().parse::<i32>() {
        // Signal 0 only checks existence.
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, 0) == 0 },
        _ => false,
    }
}

/// Send a single request to the daemon and get a response.
pub fn send_request(root: &Path, request: Request) -> Result<Response> {
    let mut client = Client::connect_raw(root)?;
    client.request(&request)
}

/// Start a daemon for `root` unless one is running, then wait until its
/// socket accepts connections.
pub fn ensure_daemon(root: &Path) -> Result<()> {
    let sock_path = Storage::open(root).socket_path();
    if is_daemon_running(root) && UnixStream::connect(&sock_path).is_ok() {
        return Ok(());
    }

    let exe = std::env::current_exe().context("cannot locate the modulard executable")?;
    info!(root = %root.display(), "starting daemon");
    Command::new(exe)
        .arg("--root")
        .arg(root)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("cannot spawn daemon")?;

    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while Instant::now() < deadline {
        if UnixStream::connect(&sock_path).is_ok() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
    bail!("daemon did not come up within {}s", STARTUP_TIMEOUT.as_secs())
}

/// Final answer to a compile registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileReply {
    Built { artifacts: BTreeMap<String, PathBuf> },
    Failed { module: String, message: String },
}

/// A connection to the daemon.
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Client {
    /// Connect and complete the protocol handshake.
    pub fn connect(root: &Path) -> Result<Self> {
        let mut client = Self::connect_raw(root)?;
        match client.request(&Request::handshake())? {
            Response::Welcome { protocol, version, pid } => {
                if protocol != PROTOCOL_NAME || version != PROTOCOL_VERSION {
                    bail!("daemon speaks {protocol} v{version}, expected {PROTOCOL_NAME} v{PROTOCOL_VERSION}");
                }
                debug!(pid, "connected to daemon");
                Ok(client)
            }
            Response::Error { message } => bail!("handshake rejected: {message}"),
            other => bail!("unexpected handshake response: {other:?}"),
        }
    }

    fn connect_raw(root: &Path) -> Result<Self> {
        let sock_path = Storage::open(root).socket_path();
        let stream = UnixStream::connect(&sock_path)
            .with_context(|| format!("cannot connect to daemon at {}", sock_path.display()))?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        })
    }

    /// Send a request and read one response.
    pub fn request(&mut self, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request)?;
        writeln!(self.writer, "{}", request_json)?;
        self.read_response()
    }

    fn read_response(&mut self) -> Result<Response> {
        let mut response_line = String::new();
        if self.reader.read_line(&mut response_line)? == 0 {
            bail!("daemon closed the connection");
        }
        let response: Response = serde_json::from_str(&response_line)?;
        Ok(response)
    }

    /// Register a translation unit and block until its modules are built
    /// or one of them fails.
    pub fn compile(mut self, unit: Registration) -> Result<CompileReply> {
        match self.request(&Request::Register { unit })? {
            Response::ScanAccepted { tu, session, modules } => {
                debug!(%tu, %session, modules, "scan accepted");
            }
            Response::Error { message } => return Err(anyhow!(message)),
            other => bail!("unexpected response to register: {other:?}"),
        }
        match self.read_response()? {
            Response::Built { artifacts } => Ok(CompileReply::Built { artifacts }),
            Response::BuildFailed { module, message } => Ok(CompileReply::Failed { module, message }),
            Response::Error { message } => Err(anyhow!(message)),
            other => bail!("unexpected build response: {other:?}"),
        }
    }
}
