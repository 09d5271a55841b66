//! # modulard
//!
//! A build-system-agnostic daemon that builds C++ named modules on demand.
//!
//! Build systems hand each translation unit to the daemon instead of
//! ordering module builds themselves. The daemon scans the unit, merges its
//! modules into one shared dependency graph, builds what is missing in
//! dependency order and answers with the artifact path of every module the
//! unit needs.
//!
//! ## Key Features
//!
//! - **Shared graph**: a module required by many units is built once
//! - **Scheduling**: fan-in first, or one unit at a time
//! - **Persistent cache**: artifacts survive daemon restarts
//! - **Sessions**: sources are revalidated once per build session
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modulard::coordinator::Registration;
//! use modulard::daemon::{ensure_daemon, Client, CompileReply};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let root = Path::new(".");
//! ensure_daemon(root)?;
//! let reply = Client::connect(root)?.compile(Registration {
//!     working_directory: root.to_path_buf(),
//!     command: vec!["clang++".into(), "-std=c++20".into(), "-c".into(), "main.cpp".into()],
//!     ..Default::default()
//! })?;
//! if let CompileReply::Built { artifacts } = reply {
//!     for (module, path) in artifacts {
//!         println!("-fmodule-file={}={}", module, path.display());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod graph;
pub mod hash;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod toolchain;

// Re-exports for convenience
pub use config::{DaemonConfig, SchedulingPolicy};
pub use coordinator::{BuildOutcome, Coordinator, Registration};
pub use error::{DaemonError, Result};
