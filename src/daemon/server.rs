//! Daemon server: Unix socket server handling client connections.

use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::cache::start_sweeper;
use crate::config::{ConfigOverrides, DaemonConfig};
use crate::coordinator::{BuildOutcome, Coordinator};
use crate::executor::WorkerPool;
use crate::storage::Storage;

use super::client::is_daemon_running;
use super::connection::{ConnectionId, ConnectionState, ShutdownReason};
use super::protocol::{Request, Response, PROTOCOL_NAME, PROTOCOL_VERSION};

/// Start the daemon for a project and serve until shutdown.
pub fn start_daemon(root: &Path, overrides: &ConfigOverrides) -> Result<ShutdownReason> {
    let root = root
        .canonicalize()
        .with_context(|| format!("project root {} does not exist", root.display()))?;
    if is_daemon_running(&root) {
        bail!("a daemon is already running for {}", root.display());
    }

    let storage = Storage::init(&root)?;
    let mut config = DaemonConfig::load(storage.root())?;
    config.apply_overrides(overrides)?;

    // Write PID file
    std::fs::write(storage.pid_path(), std::process::id().to_string())?;

    info!(
        root = %root.display(),
        policy = ?config.daemon.policy,
        max_concurrency = config.daemon.max_concurrency,
        idle_timeout_secs = config.daemon.idle_timeout_secs,
        "starting daemon"
    );
    let coord = Arc::new(Coordinator::with_toolchain(config, storage.clone())?);
    let result = serve(coord);

    let _ = std::fs::remove_file(storage.pid_path());
    result
}

/// Serve clients on the coordinator's socket until a shutdown request or
/// idle expiry. Running builds finish before this returns.
pub fn serve(coord: Arc<Coordinator>) -> Result<ShutdownReason> {
    let sock_path = coord.storage().socket_path();

    // Remove stale socket if exists
    if sock_path.exists() {
        std::fs::remove_file(&sock_path)?;
    }
    let listener = UnixListener::bind(&sock_path)
        .with_context(|| format!("cannot bind {}", sock_path.display()))?;
    info!(socket = %sock_path.display(), "daemon listening");

    let pool = WorkerPool::spawn(Arc::clone(&coord), coord.config().daemon.max_concurrency)?;
    let sweeper = start_sweeper(Arc::clone(coord.cache()), coord.config().prune_interval())?;

    let watcher = {
        let coord = Arc::clone(&coord);
        let sock_path = sock_path.clone();
        thread::Builder::new().name("idle-watch".to_string()).spawn(move || {
            let reason = coord.connections().wait_for_shutdown();
            coord.begin_shutdown();
            // Wake the accept loop.
            let _ = UnixStream::connect(&sock_path);
            reason
        })?
    };

    for stream in listener.incoming() {
        if coord.is_shutting_down() {
            break;
        }
        match stream {
            Ok(stream) => {
                let coord = Arc::clone(&coord);
                let conn = coord.connections().open();
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &coord, conn) {
                        debug!(connection = %conn, error = %e, "client handler error");
                    }
                    coord.connections().close(conn);
                });
            }
            Err(e) => {
                error!(error = %e, "accept error");
            }
        }
    }

    // Cleanup
    info!("daemon shutting down, waiting for running builds");
    pool.join();
    drop(sweeper);
    let reason = watcher.join().unwrap_or(ShutdownReason::Requested);
    let _ = std::fs::remove_file(&sock_path);
    info!(reason = ?reason, "daemon stopped");
    Ok(reason)
}

/// Handle one client connection: any number of requests, at most one
/// registration.
fn handle_client(stream: UnixStream, coord: &Arc<Coordinator>, conn: ConnectionId) -> Result<()> {
    let timeout = Some(coord.config().io_timeout());
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut greeted = false;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                send(&mut writer, &Response::error(format!("malformed request: {e}")))?;
                return Ok(());
            }
        };
        debug!(connection = %conn, ?request, "received request");

        match request {
            Request::Handshake { protocol, version } => {
                if protocol != PROTOCOL_NAME || version != PROTOCOL_VERSION {
                    let _ = coord.connections().transition(conn, ConnectionState::Failed);
                    send(
                        &mut writer,
                        &Response::error(format!(
                            "unsupported protocol {protocol} v{version}, expected {PROTOCOL_NAME} v{PROTOCOL_VERSION}"
                        )),
                    )?;
                    return Ok(());
                }
                greeted = true;
                send(&mut writer, &Response::welcome())?;
            }
            Request::Register { unit } => {
                if !greeted {
                    send(&mut writer, &Response::error("handshake required before register"))?;
                    return Ok(());
                }
                serve_registration(&mut writer, coord, conn, unit)?;
                return Ok(());
            }
            other => {
                let shutdown = matches!(other, Request::Shutdown);
                send(&mut writer, &process_request(other, coord))?;
                if shutdown {
                    return Ok(());
                }
            }
        }
    }
}

/// Register a unit and answer once its modules are built or one failed.
/// The connection is only seen to close when the answer is written.
fn serve_registration(
    writer: &mut UnixStream,
    coord: &Arc<Coordinator>,
    conn: ConnectionId,
    unit: crate::coordinator::Registration,
) -> Result<()> {
    let registered = match coord.register(conn, unit) {
        Ok(registered) => registered,
        Err(e) => {
            send(writer, &Response::error(e.to_string()))?;
            return Ok(());
        }
    };
    send(
        writer,
        &Response::ScanAccepted {
            tu: registered.tu.to_string(),
            session: registered.session.to_string(),
            modules: registered.required.len(),
        },
    )?;

    // The builds belong to the daemon, not to this connection: a client
    // that disconnects here changes nothing in flight. Its connection
    // stays registered until the wait below returns, so it still counts
    // toward the concurrency limit and holds off the idle timer.
    match coord.wait_for(&registered.required) {
        BuildOutcome::Built { artifacts, pinned } => {
            let _ = coord.connections().transition(conn, ConnectionState::Completed);
            let sent = send(writer, &Response::Built { artifacts });
            coord.release_pins(&pinned);
            if let Err(e) = sent {
                debug!(connection = %conn, error = %e, "client went away before its response");
            }
        }
        BuildOutcome::Failed { module, message } => {
            let _ = coord.connections().transition(conn, ConnectionState::Failed);
            if let Err(e) = send(writer, &Response::BuildFailed { module, message }) {
                debug!(connection = %conn, error = %e, "client went away before its response");
            }
        }
        BuildOutcome::ShuttingDown => {
            let _ = coord.connections().transition(conn, ConnectionState::Failed);
            let _ = send(writer, &Response::error("daemon is shutting down"));
        }
    }
    Ok(())
}

fn send(writer: &mut UnixStream, response: &Response) -> Result<()> {
    let response_json = serde_json::to_string(response)?;
    writeln!(writer, "{}", response_json)?;
    Ok(())
}

/// Process an administrative request and return a response.
fn process_request(request: Request, coord: &Coordinator) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::Shutdown => {
            coord.connections().request_shutdown(ShutdownReason::Requested);
            Response::Goodbye
        }

        Request::Status => Response::ok(coord.status()),

        Request::Prune => {
            let report = coord.prune();
            Response::ok(report)
        }

        Request::InvalidateSession { session } => {
            let removed = coord.invalidate_session(&crate::session::SessionId::new(session.clone()));
            if !removed {
                warn!(session = %session, "invalidate requested for unknown session");
            }
            Response::ok(serde_json::json!({
                "session": session,
                "invalidated": removed
            }))
        }

        Request::Handshake { .. } | Request::Register { .. } => Response::error("unexpected request"),
    }
}
