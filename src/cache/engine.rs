//! Content-addressed artifact cache with ttl and LFU eviction.
//!
//! Ttl grows with a module's depth in the graph: deep modules are costly to
//! rebuild, so they stay longer. Entries referenced by an in-flight build or
//! an unsent client response are pinned and never evicted.
//!
//! Eviction only edits the in-memory map. Artifact files and the index are
//! written once the lock is released, see [`Evicted`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::{CacheEntry, EntryKey};
use super::index::{CacheIndex, IndexRow};
use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::graph::ModuleKey;
use crate::hash::ContentHash;
use crate::session::SessionId;
use crate::storage::Storage;

/// Cache tuning derived from the `[cache]` and `[toolchain]` config sections.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub prune_after: Duration,
    pub prune_extend: Duration,
    pub max_size: u64,
    pub reclaim_target: u64,
    pub extension: String,
}

impl CacheSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            prune_after: Duration::from_secs(config.cache.prune_after_secs),
            prune_extend: Duration::from_secs(config.cache.prune_extend_secs),
            max_size: config.cache.max_size_bytes,
            reclaim_target: config.cache.reclaim_target_bytes,
            extension: config.toolchain.artifact_extension.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepTrigger {
    /// Periodic or manual sweep: free up to the reclaim target.
    Interval,
    /// The cache grew past its size limit.
    Pressure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub trigger: SweepTrigger,
    pub evicted: usize,
    pub freed_bytes: u64,
    /// Expired entries kept because they are pinned.
    pub pinned_expired: usize,
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Indexed { artifact: PathBuf },
    /// The cache is disabled; the artifact was moved to scratch space.
    Unindexed { artifact: PathBuf },
}

impl CommitOutcome {
    pub fn artifact(&self) -> &Path {
        match self {
            CommitOutcome::Indexed { artifact } | CommitOutcome::Unindexed { artifact } => artifact,
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, CommitOutcome::Indexed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub pinned: usize,
    pub disabled: bool,
}

/// Entries already taken out of the cache whose artifacts are still on
/// disk. Pass it to [`CacheEngine::release`] once no lock is held.
#[must_use]
#[derive(Debug, Default)]
pub struct Evicted(Vec<CacheEntry>);

impl Evicted {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: Evicted) {
        self.0.extend(other.0);
    }

    fn push(&mut self, entry: CacheEntry) {
        self.0.push(entry);
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<EntryKey, CacheEntry>,
    total_bytes: u64,
    disabled: bool,
    /// Hits changed ttl or access counts that the index does not have yet.
    dirty: bool,
}

impl CacheState {
    fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_bytes += entry.size;
        let old = self.entries.insert(entry.key.clone(), entry)?;
        self.total_bytes = self.total_bytes.saturating_sub(old.size);
        Some(old)
    }

    fn remove(&mut self, key: &EntryKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn rows(&self) -> Vec<IndexRow> {
        let mut rows: Vec<IndexRow> = self.entries.values().map(row_for).collect();
        rows.sort_by(|a, b| a.committed_at.cmp(&b.committed_at));
        rows
    }
}

/// The cache engine. All methods take `&self`; state sits behind one mutex
/// that is never held across file I/O or compilation.
#[derive(Debug)]
pub struct CacheEngine {
    storage: Storage,
    settings: CacheSettings,
    index: CacheIndex,
    state: Mutex<CacheState>,
    /// Orders index writes. Never acquired while `state` is held.
    io: Mutex<()>,
}

impl CacheEngine {
    /// Open the cache, adopting every indexed artifact that still exists
    /// with its recorded size.
    pub fn open(storage: &Storage, settings: CacheSettings) -> Result<Self> {
        fs::create_dir_all(storage.artifacts_dir())?;
        fs::create_dir_all(storage.scratch_dir())?;
        let cleared = storage.clear_scratch()?;
        if cleared > 0 {
            debug!(files = cleared, "cleared scratch artifacts");
        }

        let index = CacheIndex::new(storage.index_path());
        let (rows, skipped) = index.load()?;
        let row_count = rows.len();
        let now = Instant::now();
        let mut state = CacheState::default();
        for row in rows {
            let on_disk = fs::metadata(&row.artifact).map(|m| m.len()).ok();
            if on_disk != Some(row.size) {
                debug!(artifact = %row.artifact.display(), "dropping index row without a matching artifact");
                continue;
            }
            state.insert(CacheEntry {
                key: EntryKey::new(ModuleKey::new(row.module, row.context), row.content_hash),
                session: row.session,
                artifact: row.artifact,
                size: row.size,
                checksum: row.checksum,
                ttl: Duration::from_secs(row.ttl_secs),
                access_count: row.access_count,
                last_access: now,
                committed_at: row.committed_at,
                pins: 0,
                doomed: false,
            });
        }

        if skipped > 0 || state.entries.len() != row_count {
            index.rewrite(&state.rows())?;
        }
        let orphans = remove_orphans(&storage.artifacts_dir(), &state)?;
        if orphans > 0 {
            debug!(files = orphans, "removed unindexed artifacts");
        }
        state.disabled = state.total_bytes > settings.max_size;
        info!(
            entries = state.entries.len(),
            bytes = state.total_bytes,
            disabled = state.disabled,
            "cache opened"
        );

        Ok(Self {
            storage: storage.clone(),
            settings,
            index,
            state: Mutex::new(state),
            io: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Where a build for `key` should write its artifact. Every call names
    /// a new file, so deleting an evicted artifact never removes a later
    /// build of the same key.
    pub fn output_path(&self, key: &EntryKey) -> PathBuf {
        let dir = if self.is_disabled() {
            self.storage.scratch_dir()
        } else {
            self.storage.artifacts_dir()
        };
        dir.join(self.file_name(key))
    }

    fn file_name(&self, key: &EntryKey) -> String {
        let name: String = key
            .module
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
            .collect();
        let nonce = Uuid::new_v4().simple().to_string();
        format!(
            "{name}-{}-{}-{}.{}",
            key.module.context,
            key.hash,
            &nonce[..8],
            self.settings.extension
        )
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.lock().entries.get(key).map_or(false, |e| !e.doomed)
    }

    /// Delete the artifacts of evicted entries and rewrite the index.
    pub fn release(&self, evicted: Evicted) {
        if evicted.is_empty() {
            return;
        }
        for entry in &evicted.0 {
            match fs::remove_file(&entry.artifact) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(artifact = %entry.artifact.display(), error = %e, "failed to delete artifact"),
            }
        }
        self.compact();
    }

    /// Look up `key` and verify the artifact. A hit extends the entry's ttl
    /// by `depth * prune_extend`. A corrupt artifact is evicted and reported
    /// as a miss.
    pub fn reuse(&self, key: &EntryKey, depth: u32) -> Option<PathBuf> {
        let (artifact, size, checksum) = {
            let mut state = self.lock();
            let entry = state.entries.get_mut(key).filter(|e| !e.doomed)?;
            // Hold a pin while verifying so a sweep cannot delete the file.
            entry.pins += 1;
            (entry.artifact.clone(), entry.size, entry.checksum)
        };

        let verified = verify_artifact(&artifact, size, checksum);

        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return None;
        };
        entry.pins = entry.pins.saturating_sub(1);
        if entry.doomed {
            if !entry.is_pinned() {
                let evicted = self.evict_locked(&mut state, key);
                drop(state);
                self.release(evicted);
            }
            return None;
        }
        match verified {
            Ok(()) => {
                entry.ttl += self.settings.prune_extend * depth;
                entry.access_count += 1;
                entry.last_access = Instant::now();
                debug!(key = %key, ttl_secs = entry.ttl.as_secs(), "cache hit");
                state.dirty = true;
                Some(artifact)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt cache entry, rebuilding");
                if entry.is_pinned() {
                    entry.doomed = true;
                } else {
                    let evicted = self.evict_locked(&mut state, key);
                    drop(state);
                    self.release(evicted);
                }
                None
            }
        }
    }

    /// Record a freshly built artifact with `ttl = depth * prune_after`.
    ///
    /// When even a pressure sweep cannot make room, the cache is disabled
    /// for new entries and the artifact is moved to scratch space.
    pub fn commit(&self, key: &EntryKey, session: &SessionId, produced: &Path, depth: u32) -> Result<CommitOutcome> {
        let bytes = fs::read(produced)?;
        let size = bytes.len() as u64;
        let checksum = ContentHash::from_bytes(&bytes);
        drop(bytes);

        let mut state = self.lock();
        let mut evicted = Evicted::default();
        if !state.disabled && state.total_bytes + size > self.settings.max_size {
            let (_, swept) = self.sweep_locked(&mut state, SweepTrigger::Pressure, Instant::now(), size);
            evicted = swept;
            if state.total_bytes + size > self.settings.max_size {
                let err = DaemonError::ResourceExhaustion {
                    used: state.total_bytes + size,
                    limit: self.settings.max_size,
                };
                warn!(error = %err, "disabling cache for new entries");
                state.disabled = true;
            }
        }

        if state.disabled || !produced.starts_with(self.storage.artifacts_dir()) {
            drop(state);
            self.release(evicted);
            let artifact = self.move_to_scratch(key, produced)?;
            debug!(key = %key, artifact = %artifact.display(), "artifact not indexed");
            return Ok(CommitOutcome::Unindexed { artifact });
        }

        let entry = CacheEntry {
            key: key.clone(),
            session: session.clone(),
            artifact: produced.to_path_buf(),
            size,
            checksum,
            ttl: self.settings.prune_after * depth,
            access_count: 0,
            last_access: Instant::now(),
            committed_at: Utc::now(),
            pins: state.entries.get(key).map_or(0, |e| e.pins),
            doomed: false,
        };
        let row = row_for(&entry);
        if let Some(old) = state.insert(entry) {
            // A pinned file stays until the next start.
            if old.artifact != row.artifact && !old.is_pinned() {
                evicted.push(old);
            }
        }
        drop(state);

        if evicted.is_empty() {
            let _io = self.lock_io();
            if let Err(e) = self.index.append(&row) {
                warn!(error = %e, "failed to append cache index row");
            }
        } else {
            self.release(evicted);
        }
        debug!(key = %key, size, ttl_secs = row.ttl_secs, "artifact committed");
        Ok(CommitOutcome::Indexed {
            artifact: produced.to_path_buf(),
        })
    }

    fn move_to_scratch(&self, key: &EntryKey, produced: &Path) -> Result<PathBuf> {
        let scratch = self.storage.scratch_dir();
        if produced.starts_with(&scratch) {
            return Ok(produced.to_path_buf());
        }
        fs::create_dir_all(&scratch)?;
        let target = scratch.join(self.file_name(key));
        fs::rename(produced, &target)?;
        Ok(target)
    }

    /// Keep `key` from being evicted. Fails when the entry is gone or
    /// already doomed.
    pub fn pin(&self, key: &EntryKey) -> bool {
        match self.lock().entries.get_mut(key).filter(|e| !e.doomed) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    /// Release one pin. A doomed entry is removed with its last pin.
    pub fn unpin(&self, key: &EntryKey) {
        let evicted = self.unpin_deferred(key);
        self.release(evicted);
    }

    /// Like [`CacheEngine::unpin`], for callers holding another lock.
    pub fn unpin_deferred(&self, key: &EntryKey) -> Evicted {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return Evicted::default();
        };
        entry.pins = entry.pins.saturating_sub(1);
        if entry.pins == 0 && entry.doomed {
            self.evict_locked(&mut state, key)
        } else {
            Evicted::default()
        }
    }

    /// Drop a single entry whose artifact turned out to be unusable. A
    /// pinned entry is removed once released.
    pub fn discard(&self, key: &EntryKey) -> Evicted {
        let mut state = self.lock();
        match state.entries.get_mut(key) {
            Some(entry) if entry.is_pinned() => {
                entry.doomed = true;
                Evicted::default()
            }
            Some(_) => self.evict_locked(&mut state, key),
            None => Evicted::default(),
        }
    }

    /// Take every entry of `module` out of the cache, typically because its
    /// source changed. Pinned entries are doomed and go with their last pin.
    pub fn take_module(&self, module: &ModuleKey) -> Evicted {
        let mut state = self.lock();
        let keys: Vec<EntryKey> = state
            .entries
            .keys()
            .filter(|k| &k.module == module)
            .cloned()
            .collect();
        let mut evicted = Evicted::default();
        for key in &keys {
            match state.entries.get_mut(key) {
                Some(entry) if entry.is_pinned() => entry.doomed = true,
                Some(_) => evicted.merge(self.evict_locked(&mut state, key)),
                None => {}
            }
        }
        if !evicted.is_empty() {
            debug!(module = %module, removed = evicted.len(), "cache entries invalidated");
        }
        evicted
    }

    pub fn sweep(&self, trigger: SweepTrigger) -> SweepReport {
        self.sweep_at(trigger, Instant::now())
    }

    /// Evict expired, unpinned entries, least frequently used first. An
    /// interval sweep also persists ttl and access counts changed by hits.
    pub fn sweep_at(&self, trigger: SweepTrigger, now: Instant) -> SweepReport {
        let mut state = self.lock();
        let (report, evicted) = self.sweep_locked(&mut state, trigger, now, 0);
        let persist = state.dirty && trigger == SweepTrigger::Interval;
        drop(state);
        if !evicted.is_empty() {
            self.release(evicted);
        } else if persist {
            self.compact();
        }
        report
    }

    fn sweep_locked(
        &self,
        state: &mut CacheState,
        trigger: SweepTrigger,
        now: Instant,
        incoming: u64,
    ) -> (SweepReport, Evicted) {
        let mut candidates: Vec<(u64, Instant, EntryKey)> = Vec::new();
        let mut pinned_expired = 0;
        for entry in state.entries.values() {
            if !entry.is_expired(now) {
                continue;
            }
            if entry.is_pinned() {
                pinned_expired += 1;
            } else {
                candidates.push((entry.access_count, entry.last_access, entry.key.clone()));
            }
        }
        candidates.sort();

        let limit = self.settings.max_size;
        let target = self.settings.reclaim_target;
        let mut evicted = Evicted::default();
        let mut freed = 0u64;
        for (_, _, key) in candidates {
            let over_limit = state.total_bytes + incoming > limit;
            let done = match trigger {
                SweepTrigger::Pressure => !over_limit,
                SweepTrigger::Interval => target > 0 && freed >= target && !over_limit,
            };
            if done {
                break;
            }
            let removed = self.evict_locked(state, &key);
            freed += removed.0.iter().map(|e| e.size).sum::<u64>();
            evicted.merge(removed);
        }

        if state.disabled && state.total_bytes + incoming <= limit {
            info!(bytes = state.total_bytes, "cache re-enabled");
            state.disabled = false;
        }

        let report = SweepReport {
            trigger,
            evicted: evicted.len(),
            freed_bytes: freed,
            pinned_expired,
            remaining_entries: state.entries.len(),
            remaining_bytes: state.total_bytes,
            disabled: state.disabled,
        };
        if !evicted.is_empty() || pinned_expired > 0 {
            info!(
                trigger = ?trigger,
                evicted = report.evicted,
                freed_bytes = freed,
                pinned_expired,
                remaining = report.remaining_entries,
                "cache sweep"
            );
        }
        (report, evicted)
    }

    fn evict_locked(&self, state: &mut CacheState, key: &EntryKey) -> Evicted {
        let mut evicted = Evicted::default();
        if let Some(entry) = state.remove(key) {
            evicted.push(entry);
        }
        evicted
    }

    fn lock_io(&self) -> MutexGuard<'_, ()> {
        self.io.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rewrite the index from a snapshot taken after every earlier writer
    /// finished.
    fn compact(&self) {
        let _io = self.lock_io();
        let rows = {
            let mut state = self.lock();
            state.dirty = false;
            state.rows()
        };
        if let Err(e) = self.index.rewrite(&rows) {
            warn!(error = %e, "failed to compact cache index");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.total_bytes,
            pinned: state.entries.values().filter(|e| e.is_pinned()).count(),
            disabled: state.disabled,
        }
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, key: &EntryKey) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }
}

/// Delete files in the artifact directory that no entry refers to.
fn remove_orphans(dir: &Path, state: &CacheState) -> Result<usize> {
    let known: HashSet<&Path> = state.entries.values().map(|e| e.artifact.as_path()).collect();
    let mut removed = 0;
    for item in fs::read_dir(dir)? {
        let path = item?.path();
        if path.is_file() && !known.contains(path.as_path()) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn row_for(entry: &CacheEntry) -> IndexRow {
    IndexRow {
        session: entry.session.clone(),
        content_hash: entry.key.hash,
        module: entry.key.module.name.clone(),
        context: entry.key.module.context,
        artifact: entry.artifact.clone(),
        size: entry.size,
        checksum: entry.checksum,
        ttl_secs: entry.ttl.as_secs(),
        access_count: entry.access_count,
        committed_at: entry.committed_at,
    }
}

fn verify_artifact(path: &Path, size: u64, checksum: ContentHash) -> Result<()> {
    let corrupt = |reason: String| DaemonError::CacheCorruption {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| corrupt(e.to_string()))?;
    if bytes.len() as u64 != size {
        return Err(corrupt(format!("size {} != recorded {size}", bytes.len())));
    }
    if ContentHash::from_bytes(&bytes) != checksum {
        return Err(corrupt("checksum mismatch".to_string()));
    }
    Ok(())
}
