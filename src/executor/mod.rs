//! Build executor: a fixed pool of worker threads draining the ready queue.
//!
//! Each worker takes a job from the coordinator, tries the cache, compiles
//! on a miss and reports back. Workers hold no lock while compiling.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEngine, EntryKey};
use crate::coordinator::Coordinator;
use crate::error::{DaemonError, Result};
use crate::graph::ModuleId;
use crate::hash::ContentHash;
use crate::session::SessionId;
use crate::toolchain::{CompileJob, Compiler};

/// A module handed to a worker. Built under the coordinator lock; carries
/// everything needed to finish without it.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub id: ModuleId,
    pub module: String,
    /// Cache key: source, context and dependency keys.
    pub entry: EntryKey,
    pub depth: u32,
    /// Skip the cache and compile.
    pub stale: bool,
    pub source: PathBuf,
    pub working_directory: PathBuf,
    pub template: Vec<String>,
    /// Transitive dependency artifacts, by module name.
    pub dependencies: Vec<(String, PathBuf)>,
    /// Dependency cache entries pinned for the job's duration.
    pub pinned: Vec<EntryKey>,
    pub session: SessionId,
    /// Source hash at dispatch time.
    pub source_hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Reused { artifact: PathBuf },
    Rebuilt { artifact: PathBuf, indexed: bool },
    Failed { message: String },
}

/// Build one module: cache hit, or compile and commit.
pub fn execute(job: &BuildJob, cache: &CacheEngine, compiler: &dyn Compiler) -> JobResult {
    if !job.stale {
        if let Some(artifact) = cache.reuse(&job.entry, job.depth) {
            return JobResult::Reused { artifact };
        }
    }

    let output = cache.output_path(&job.entry);
    let compile = CompileJob {
        module: job.module.clone(),
        source: job.source.clone(),
        working_directory: job.working_directory.clone(),
        template: job.template.clone(),
        dependencies: job.dependencies.clone(),
        output: output.clone(),
    };
    if let Err(e) = compiler.compile(&compile) {
        let message = match e {
            DaemonError::CompileFailure { diagnostic, .. } => diagnostic,
            other => other.to_string(),
        };
        return JobResult::Failed { message };
    }

    match cache.commit(&job.entry, &job.session, &output, job.depth) {
        Ok(outcome) => JobResult::Rebuilt {
            indexed: outcome.is_indexed(),
            artifact: outcome.artifact().to_path_buf(),
        },
        Err(e) => {
            warn!(module = %job.module, error = %e, "could not record artifact in cache");
            JobResult::Rebuilt {
                artifact: output,
                indexed: false,
            }
        }
    }
}

fn worker_loop(coord: &Coordinator, index: usize) {
    debug!(worker = index, "worker started");
    while let Some(job) = coord.next_job() {
        debug!(worker = index, module = %job.module, stale = job.stale, "job started");
        let result = panic::catch_unwind(AssertUnwindSafe(|| execute(&job, coord.cache(), coord.compiler())))
            .unwrap_or_else(|_| {
                error!(worker = index, module = %job.module, "worker panicked while building");
                JobResult::Failed {
                    message: "internal error while building module".to_string(),
                }
            });
        coord.finish_job(job, result);
    }
    debug!(worker = index, "worker stopped");
}

/// Fixed-size pool of build workers.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers. They run until the coordinator begins shutting
    /// down and their current job is finished.
    pub fn spawn(coord: Arc<Coordinator>, size: usize) -> Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let coord = Arc::clone(&coord);
            let handle = thread::Builder::new()
                .name(format!("build-worker-{index}"))
                .spawn(move || worker_loop(&coord, index))?;
            workers.push(handle);
        }
        info!(workers = size, "worker pool started");
        Ok(Self { workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit.
    pub fn join(self) {
        for handle in self.workers {
            if handle.join().is_err() {
                error!("build worker exited with a panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::graph::ModuleKey;
    use crate::hash::ContextHash;
    use crate::storage::Storage;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct WriteCompiler {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Compiler for WriteCompiler {
        fn compile(&self, job: &CompileJob) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DaemonError::CompileFailure {
                    module: job.module.clone(),
                    diagnostic: "error: expected ';'".to_string(),
                });
            }
            fs::write(&job.output, format!("pcm:{}", job.module))?;
            Ok(())
        }
    }

    fn cache(dir: &std::path::Path) -> CacheEngine {
        let storage = Storage::init(dir).unwrap();
        CacheEngine::open(
            &storage,
            CacheSettings {
                prune_after: Duration::from_secs(60),
                prune_extend: Duration::from_secs(10),
                max_size: 1 << 20,
                reclaim_target: 0,
                extension: "pcm".to_string(),
            },
        )
        .unwrap()
    }

    fn job(stale: bool) -> BuildJob {
        BuildJob {
            id: ModuleId(0),
            module: "m".to_string(),
            entry: EntryKey::new(ModuleKey::new("m", ContextHash(0)), ContentHash::from_bytes(b"m")),
            depth: 1,
            stale,
            source: PathBuf::from("m.cppm"),
            working_directory: PathBuf::from("/"),
            template: vec!["c++".to_string()],
            dependencies: Vec::new(),
            pinned: Vec::new(),
            session: SessionId::new("s"),
            source_hash: ContentHash::from_bytes(b"m"),
        }
    }

    #[test]
    fn miss_compiles_then_hit_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let compiler = WriteCompiler {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        let first = execute(&job(false), &cache, &compiler);
        assert!(matches!(first, JobResult::Rebuilt { indexed: true, .. }));
        let second = execute(&job(false), &cache, &compiler);
        assert!(matches!(second, JobResult::Reused { .. }));
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_job_skips_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let compiler = WriteCompiler {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        execute(&job(false), &cache, &compiler);
        let again = execute(&job(true), &cache, &compiler);
        assert!(matches!(again, JobResult::Rebuilt { .. }));
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn compile_failure_carries_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let compiler = WriteCompiler {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        match execute(&job(false), &cache, &compiler) {
            JobResult::Failed { message } => assert_eq!(message, "error: expected ';'"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
