//! Error types for the module build daemon.

use std::path::PathBuf;

/// Errors raised by the daemon core and its collaborators.
///
/// Only `ScanFailure`, `CycleDetected` and `CompileFailure` ever reach a
/// client. Cache problems degrade to misses or a disabled cache.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The dependency scan of a translation unit failed.
    #[error("scan failed for {tu}: {reason}")]
    ScanFailure { tu: String, reason: String },

    /// Merging a scan result would have introduced a dependency cycle.
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// The compiler rejected a module.
    #[error("failed to compile module {module}: {diagnostic}")]
    CompileFailure { module: String, diagnostic: String },

    /// A cached artifact did not match its recorded size or checksum.
    #[error("corrupt cache artifact {}: {reason}", .path.display())]
    CacheCorruption { path: PathBuf, reason: String },

    /// The cache could not reclaim enough space for new entries.
    #[error("cache exhausted: {used} bytes in use, limit {limit}")]
    ResourceExhaustion { used: u64, limit: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid connection transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("serialization error: {0}")]
    SerializeError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

impl DaemonError {
    /// Whether this error is reported back to the registering client.
    pub fn is_client_facing(&self) -> bool {
        matches!(
            self,
            DaemonError::ScanFailure { .. }
                | DaemonError::CycleDetected { .. }
                | DaemonError::CompileFailure { .. }
                | DaemonError::Protocol(_)
                | DaemonError::ShuttingDown
        )
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::SerializeError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_display_joins_path() {
        let err = DaemonError::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn compile_failure_display() {
        let err = DaemonError::CompileFailure {
            module: "std.core".to_string(),
            diagnostic: "expected ';'".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("std.core"));
        assert!(msg.contains("expected ';'"));
    }

    #[test]
    fn cache_errors_stay_internal() {
        let corrupt = DaemonError::CacheCorruption {
            path: PathBuf::from("/tmp/x.pcm"),
            reason: "checksum".to_string(),
        };
        let full = DaemonError::ResourceExhaustion { used: 10, limit: 5 };
        assert!(!corrupt.is_client_facing());
        assert!(!full.is_client_facing());
        assert!(DaemonError::CycleDetected { cycle: vec![] }.is_client_facing());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DaemonError = io.into();
        assert!(err.to_string().starts_with("I/O error"));
    }
}
