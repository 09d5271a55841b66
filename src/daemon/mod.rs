//! Daemon module: the long-lived process that owns the module graph and
//! the artifact cache, and the client side that talks to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           modulard daemon               │
//! │  - module graph + scheduler             │
//! │  - worker pool, artifact cache          │
//! │  - Unix socket server                   │
//! └─────────────────────────────────────────┘
//!           ▲
//!           │ .modulard/daemon.sock
//!           ▼
//! ┌─────────────────────────────────────────┐
//! │      modulard compile / status ...      │
//! │  - handshake, register a unit           │
//! │  - wait for artifact paths              │
//! └─────────────────────────────────────────┘
//! ```

pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;

pub use client::{ensure_daemon, is_daemon_running, send_request, Client, CompileReply};
pub use connection::{ConnectionId, ConnectionInfo, ConnectionManager, ConnectionState, ShutdownReason};
pub use protocol::{Request, Response, PROTOCOL_NAME, PROTOCOL_VERSION};
pub use server::{serve, start_daemon};
