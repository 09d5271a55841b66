//! Client connection tracking and idle shutdown.
//!
//! ```text
//! Connected -> Registered -> ScanRequested -> AwaitingBuilds -> Completed | Failed -> Disconnected
//! ```
//!
//! When the last connection closes, an idle timer starts. A new connection
//! cancels it; expiry requests a graceful shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DaemonError, Result};
use crate::hash::TuId;
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Registered,
    ScanRequested,
    AwaitingBuilds,
    Completed,
    Failed,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Completed, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Connected, Registered)
            | (Registered, ScanRequested)
            | (ScanRequested, AwaitingBuilds)
            | (AwaitingBuilds, Completed) => true,
            _ => false,
        }
    }

    /// Holding a translation unit that is being scanned or built.
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            ConnectionState::Registered | ConnectionState::ScanRequested | ConnectionState::AwaitingBuilds
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Registered => "registered",
            ConnectionState::ScanRequested => "scan_requested",
            ConnectionState::AwaitingBuilds => "awaiting_builds",
            ConnectionState::Completed => "completed",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub opened_at: DateTime<Utc>,
    pub tu: Option<TuId>,
    pub session: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// A client asked for it.
    Requested,
    /// No connection arrived within the idle interval.
    Idle,
}

#[derive(Debug)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionInfo>,
    /// When the live count last dropped to zero; `None` while any
    /// connection is open.
    idle_since: Option<Instant>,
    shutdown: Option<ShutdownReason>,
}

#[derive(Debug)]
pub struct ConnectionManager {
    idle_timeout: Duration,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl ConnectionManager {
    /// The idle timer runs from creation until the first connection.
    pub fn new(idle_timeout: Duration) -> Self {
        Self::new_at(idle_timeout, Instant::now())
    }

    pub fn new_at(idle_timeout: Duration, now: Instant) -> Self {
        Self {
            idle_timeout,
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                idle_since: Some(now),
                shutdown: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new connection, cancelling any pending idle timer.
    pub fn open(&self) -> ConnectionId {
        let id = ConnectionId::new();
        let mut inner = self.lock();
        inner.connections.insert(
            id,
            ConnectionInfo {
                id,
                state: ConnectionState::Connected,
                opened_at: Utc::now(),
                tu: None,
                session: None,
            },
        );
        if inner.idle_since.take().is_some() {
            debug!("idle timer cancelled");
        }
        self.changed.notify_all();
        id
    }

    pub fn transition(&self, id: ConnectionId, next: ConnectionState) -> Result<()> {
        let mut inner = self.lock();
        let info = inner
            .connections
            .get_mut(&id)
            .ok_or_else(|| DaemonError::Protocol(format!("unknown connection {id}")))?;
        if !info.state.can_transition_to(next) {
            return Err(DaemonError::InvalidTransition {
                from: info.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(connection = %id, from = %info.state, to = %next, "connection transition");
        info.state = next;
        Ok(())
    }

    /// Bind a translation unit to a connection and move it to `Registered`.
    pub fn attach(&self, id: ConnectionId, tu: TuId, session: SessionId) -> Result<()> {
        self.transition(id, ConnectionState::Registered)?;
        let mut inner = self.lock();
        if let Some(info) = inner.connections.get_mut(&id) {
            info.tu = Some(tu);
            info.session = Some(session);
        }
        Ok(())
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.lock().connections.get(&id).map(|c| c.state)
    }

    pub fn close(&self, id: ConnectionId) {
        self.close_at(id, Instant::now())
    }

    /// Forget a connection. Closing the last one starts the idle timer.
    pub fn close_at(&self, id: ConnectionId, now: Instant) {
        let mut inner = self.lock();
        if inner.connections.remove(&id).is_none() {
            return;
        }
        debug!(connection = %id, "connection closed");
        if inner.connections.is_empty() {
            inner.idle_since = Some(now);
            debug!(timeout_secs = self.idle_timeout.as_secs(), "idle timer started");
        }
        self.changed.notify_all();
    }

    pub fn live_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn registered_count(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.state.is_registered())
            .count()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self.lock().connections.values().cloned().collect();
        all.sort_by_key(|c| c.opened_at);
        all
    }

    pub fn is_idle_expired(&self, now: Instant) -> bool {
        let inner = self.lock();
        self.expired(&inner, now)
    }

    fn expired(&self, inner: &Inner, now: Instant) -> bool {
        inner
            .idle_since
            .map_or(false, |since| now.saturating_duration_since(since) >= self.idle_timeout)
    }

    pub fn request_shutdown(&self, reason: ShutdownReason) {
        let mut inner = self.lock();
        if inner.shutdown.is_none() {
            info!(reason = ?reason, "shutdown requested");
            inner.shutdown = Some(reason);
        }
        self.changed.notify_all();
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.lock().shutdown
    }

    /// Block until a shutdown is requested or the idle timer expires.
    pub fn wait_for_shutdown(&self) -> ShutdownReason {
        let mut inner = self.lock();
        loop {
            if let Some(reason) = inner.shutdown {
                return reason;
            }
            let now = Instant::now();
            if self.expired(&inner, now) {
                info!(timeout_secs = self.idle_timeout.as_secs(), "idle timeout expired");
                inner.shutdown = Some(ShutdownReason::Idle);
                return ShutdownReason::Idle;
            }
            let wait = inner
                .idle_since
                .and_then(|since| since.checked_add(self.idle_timeout))
                .map_or(Duration::from_secs(3600), |deadline| deadline.saturating_duration_since(now));
            inner = self
                .changed
                .wait_timeout(inner, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}
