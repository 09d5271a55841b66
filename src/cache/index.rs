//! Persisted cache index.
//!
//! One JSON row per cached artifact, appended on every commit. Compaction
//! rewrites the whole file atomically (write to .tmp, fsync, rename), so a
//! crash leaves either the old or the new index. A row torn by a crash
//! mid-append is skipped on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hash::{ContentHash, ContextHash};
use crate::session::SessionId;

/// A durable index row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    pub session: SessionId,
    pub content_hash: ContentHash,
    pub module: String,
    pub context: ContextHash,
    pub artifact: PathBuf,
    pub size: u64,
    pub checksum: ContentHash,
    pub ttl_secs: u64,
    #[serde(default)]
    pub access_count: u64,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheIndex {
    path: PathBuf,
}

impl CacheIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every well-formed row. Returns the rows and the number of lines
    /// that had to be skipped.
    pub fn load(&self) -> Result<(Vec<IndexRow>, usize)> {
        if !self.path.exists() {
            return Ok((Vec::new(), 0));
        }
        let file = fs::File::open(&self.path)?;
        let mut rows = Vec::new();
        let mut skipped = 0;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexRow>(&line) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping unreadable cache index row");
                    skipped += 1;
                }
            }
        }
        info!(path = %self.path.display(), rows = rows.len(), skipped, "cache index loaded");
        Ok((rows, skipped))
    }

    pub fn append(&self, row: &IndexRow) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Replace the index with exactly `rows`.
    pub fn rewrite(&self, rows: &[IndexRow]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        let file = fs::File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for row in rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        debug!(rows = rows.len(), "cache index compacted");
        Ok(())
    }
}
