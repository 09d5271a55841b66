//! Daemon protocol: newline-delimited JSON requests and responses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::coordinator::Registration;

pub const PROTOCOL_NAME: &str = "modulard";
pub const PROTOCOL_VERSION: u32 = 1;

/// Request from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Request {
    /// Must precede `register` on a connection.
    #[serde(rename = "handshake")]
    Handshake { protocol: String, version: u32 },

    /// Register a translation unit and wait for its modules.
    #[serde(rename = "register")]
    Register { unit: Registration },

    /// Graph, cache and connection summary
    #[serde(rename = "status")]
    Status,

    /// Check if daemon is alive
    #[serde(rename = "ping")]
    Ping,

    /// Run a cache sweep now
    #[serde(rename = "prune")]
    Prune,

    #[serde(rename = "invalidate_session")]
    InvalidateSession { session: String },

    /// Shutdown the daemon
    #[serde(rename = "shutdown")]
    Shutdown,
}

impl Request {
    pub fn handshake() -> Self {
        Request::Handshake {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }
}

/// Response from daemon to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "welcome")]
    Welcome { protocol: String, version: u32, pid: u32 },

    /// The scan succeeded; build results follow on the same connection.
    #[serde(rename = "scan_accepted")]
    ScanAccepted { tu: String, session: String, modules: usize },

    /// Artifact of every required module and its dependencies, by name.
    #[serde(rename = "built")]
    Built { artifacts: BTreeMap<String, PathBuf> },

    /// `module` is the first failing module on the path to a requirement.
    #[serde(rename = "build_failed")]
    BuildFailed { module: String, message: String },

    /// Successful response with JSON data
    #[serde(rename = "ok")]
    Ok { data: serde_json::Value },

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },

    /// Pong response (daemon is alive)
    #[serde(rename = "pong")]
    Pong,

    /// Shutdown acknowledgment
    #[serde(rename = "goodbye")]
    Goodbye,
}

impl Response {
    pub fn ok<T: Serialize>(data: T) -> Self {
        Response::Ok {
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { message: msg.into() }
    }

    pub fn welcome() -> Self {
        Response::Welcome {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
            pid: std::process::id(),
        }
    }
}
