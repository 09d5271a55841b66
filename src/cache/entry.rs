//! Cache entries and their keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::graph::ModuleKey;
use crate::hash::ContentHash;
use crate::session::SessionId;

/// Key of a cached artifact: the module plus the composite hash of its
/// source, context and dependency artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub module: ModuleKey,
    pub hash: ContentHash,
}

impl EntryKey {
    pub fn new(module: ModuleKey, hash: ContentHash) -> Self {
        Self { module, hash }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.module, self.hash)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: EntryKey,
    /// Session that produced the artifact.
    pub session: SessionId,
    pub artifact: PathBuf,
    pub size: u64,
    /// Checksum of the artifact bytes.
    pub checksum: ContentHash,
    pub ttl: Duration,
    pub access_count: u64,
    pub last_access: Instant,
    pub committed_at: DateTime<Utc>,
    /// In-flight builds and pending client responses using the artifact.
    pub pins: usize,
    /// Remove as soon as the last pin is released.
    pub doomed: bool,
}

impl CacheEntry {
    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContextHash;

    fn entry(ttl: Duration) -> CacheEntry {
        CacheEntry {
            key: EntryKey::new(ModuleKey::new("m", ContextHash(1)), ContentHash::from_bytes(b"m")),
            session: SessionId::new("s"),
            artifact: PathBuf::from("/tmp/m.pcm"),
            size: 1,
            checksum: ContentHash::from_bytes(b"x"),
            ttl,
            access_count: 0,
            last_access: Instant::now(),
            committed_at: Utc::now(),
            pins: 0,
            doomed: false,
        }
    }

    #[test]
    fn expiry_is_relative_to_last_access() {
        let e = entry(Duration::from_secs(10));
        assert!(!e.is_expired(e.last_access + Duration::from_secs(10)));
        assert!(e.is_expired(e.last_access + Duration::from_secs(11)));
    }

    #[test]
    fn key_display_names_module_and_hash() {
        let e = entry(Duration::ZERO);
        let text = e.key.to_string();
        assert!(text.starts_with("m@0000000000000001#"));
    }
}
