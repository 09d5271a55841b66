//! The coordinator owns every piece of shared daemon state.
//!
//! Graph, scheduler and sessions sit behind one mutex. Each merge and each
//! dequeue is a single short critical section; scans and compiles run with
//! the lock released. Lock order is build state, then cache, then
//! connections. Cache file deletion and index writes wait until the state
//! lock is dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::{CacheEngine, CacheSettings, CacheStats, EntryKey, Evicted, SweepReport, SweepTrigger};
use crate::config::{DaemonConfig, SchedulingPolicy};
use crate::daemon::connection::{ConnectionId, ConnectionManager, ConnectionState};
use crate::error::{DaemonError, Result};
use crate::executor::{BuildJob, JobResult};
use crate::graph::{ArtifactRef, GraphStats, GraphStore, MergeRequest, ModuleId, ModuleNode, ModuleState};
use crate::hash::{ContentHash, TuId};
use crate::scheduler::Scheduler;
use crate::session::{Revalidation, SessionId, SessionRegistry};
use crate::storage::Storage;
use crate::toolchain::{CommandCompiler, Compiler, P1689Scanner, ScanResult, Scanner, TranslationUnit};

/// A registration request as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub working_directory: PathBuf,
    pub command: Vec<String>,
    #[serde(default)]
    pub file_mapping: BTreeMap<String, PathBuf>,
    /// External build-session marker.
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegisteredTu {
    pub tu: TuId,
    pub session: SessionId,
    pub required: Vec<ModuleId>,
}

/// Final answer for a waiting connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Every required module and its dependencies, by name. The listed
    /// cache entries stay pinned until [`Coordinator::release_pins`].
    Built {
        artifacts: BTreeMap<String, PathBuf>,
        pinned: Vec<EntryKey>,
    },
    /// `module` is the first failing module on the path to a requirement.
    Failed { module: String, message: String },
    ShuttingDown,
}

enum Verdict {
    Done(BuildOutcome),
    Pending,
    /// Built modules lost their artifacts and were sent back for building.
    Reset(Evicted),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub policy: SchedulingPolicy,
    pub graph: GraphStats,
    pub ready: usize,
    pub in_flight: usize,
    pub cache: CacheStats,
    pub connections: usize,
    pub registered: usize,
    pub sessions: Vec<SessionId>,
    pub shutting_down: bool,
}

#[derive(Debug)]
pub struct BuildState {
    pub graph: GraphStore,
    pub scheduler: Scheduler,
    pub sessions: SessionRegistry,
    in_flight: usize,
    next_rank: u64,
}

pub struct Coordinator {
    config: DaemonConfig,
    storage: Storage,
    state: Mutex<BuildState>,
    /// Signalled when work may have become available to a worker.
    work_ready: Condvar,
    /// Signalled when a module finished or the daemon began shutting down.
    progress: Condvar,
    cache: Arc<CacheEngine>,
    connections: ConnectionManager,
    scanner: Arc<dyn Scanner>,
    compiler: Arc<dyn Compiler>,
    shutting_down: AtomicBool,
}

impl Coordinator {
    pub fn new(
        config: DaemonConfig,
        storage: Storage,
        scanner: Arc<dyn Scanner>,
        compiler: Arc<dyn Compiler>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(CacheEngine::open(&storage, CacheSettings::from_config(&config))?);
        let connections = ConnectionManager::new(config.idle_timeout());
        Ok(Self {
            state: Mutex::new(BuildState {
                graph: GraphStore::new(),
                scheduler: Scheduler::new(config.daemon.policy),
                sessions: SessionRegistry::new(),
                in_flight: 0,
                next_rank: 0,
            }),
            work_ready: Condvar::new(),
            progress: Condvar::new(),
            cache,
            connections,
            scanner,
            compiler,
            shutting_down: AtomicBool::new(false),
            config,
            storage,
        })
    }

    /// A coordinator using the configured external scanner and the units'
    /// own compilers.
    pub fn with_toolchain(config: DaemonConfig, storage: Storage) -> Result<Self> {
        let scanner = Arc::new(P1689Scanner::new(config.toolchain.scanner.clone()));
        Self::new(config, storage, scanner, Arc::new(CommandCompiler::new()))
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.cache
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn compiler(&self) -> &dyn Compiler {
        self.compiler.as_ref()
    }

    fn lock_state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with the build state locked.
    pub fn with_state<T>(&self, f: impl FnOnce(&BuildState) -> T) -> T {
        f(&self.lock_state())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Register a translation unit: scan it, merge the result into the
    /// graph, validate it against the session and schedule what is missing.
    pub fn register(&self, conn: ConnectionId, registration: Registration) -> Result<RegisteredTu> {
        if self.is_shutting_down() {
            return Err(DaemonError::ShuttingDown);
        }
        let tu = TranslationUnit::new(
            registration.working_directory,
            registration.command,
            registration.file_mapping,
        );
        let marker = SessionId::from_marker(registration.session.as_deref());
        let single_use = marker.is_none();
        let session = marker.unwrap_or_else(|| SessionId::for_connection(conn));
        self.connections.attach(conn, tu.id, session.clone())?;
        self.connections.transition(conn, ConnectionState::ScanRequested)?;

        let result = self
            .scanner
            .scan(&tu)
            .and_then(|scan| self.merge(&tu, &session, single_use, &scan));
        let required = match result {
            Ok(required) => required,
            Err(e) => {
                warn!(tu = %tu.id, error = %e, "registration rejected");
                self.connections.transition(conn, ConnectionState::Failed)?;
                return Err(e);
            }
        };

        self.work_ready.notify_all();
        self.progress.notify_all();
        self.connections.transition(conn, ConnectionState::AwaitingBuilds)?;
        info!(tu = %tu.id, session = %session, required = required.len(), "translation unit registered");
        Ok(RegisteredTu {
            tu: tu.id,
            session,
            required,
        })
    }

    fn merge(
        &self,
        tu: &TranslationUnit,
        session: &SessionId,
        single_use: bool,
        scan: &ScanResult,
    ) -> Result<Vec<ModuleId>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let rank = state.next_rank;
        let outcome = state.graph.merge(MergeRequest {
            tu: tu.id,
            rank,
            context: tu.context(),
            working_directory: &tu.working_directory,
            command: &tu.command,
            scan,
        })?;
        state.next_rank += 1;
        state.scheduler.admit(&mut state.graph, &outcome);

        let cache = &self.cache;
        let revalidation = state.sessions.validate(session, &mut state.graph, &outcome.reported, |node| {
            artifact_live(cache, node)
        });
        if single_use {
            state.sessions.invalidate(session);
        }
        let evicted = if revalidation.is_empty() {
            Evicted::default()
        } else {
            self.apply_revalidation(state, &revalidation)
        };
        drop(guard);
        self.cache.release(evicted);
        Ok(outcome.required)
    }

    /// Returns the cache entries of changed modules, already out of the
    /// cache, for deletion once the state lock is released.
    fn apply_revalidation(&self, state: &mut BuildState, revalidation: &Revalidation) -> Evicted {
        let mut evicted = Evicted::default();
        for &id in &revalidation.invalidate {
            evicted.merge(self.cache.take_module(&state.graph.get(id).key));
        }
        let BuildState { graph, scheduler, .. } = state;
        if !revalidation.changed.is_empty() || !revalidation.requeue.is_empty() {
            let mut roots = revalidation.changed.clone();
            roots.extend(revalidation.requeue.iter().copied());
            scheduler.reset(graph, &roots, true);
        }
        if !revalidation.retry.is_empty() {
            scheduler.reset(graph, &revalidation.retry, false);
        }
        if !revalidation.missing.is_empty() {
            scheduler.reset(graph, &revalidation.missing, false);
        }
        debug!(
            changed = revalidation.changed.len(),
            retry = revalidation.retry.len(),
            missing = revalidation.missing.len(),
            requeue = revalidation.requeue.len(),
            "session revalidation applied"
        );
        evicted
    }

    /// Block until every module in `required` is built or one of them
    /// failed. A successful outcome pins the artifacts it lists.
    pub fn wait_for(&self, required: &[ModuleId]) -> BuildOutcome {
        let mut state = self.lock_state();
        loop {
            match self.evaluate(&mut state, required) {
                Verdict::Done(outcome) => return outcome,
                Verdict::Reset(evicted) => {
                    drop(state);
                    self.cache.release(evicted);
                    self.work_ready.notify_all();
                    state = self.lock_state();
                    continue;
                }
                Verdict::Pending => {}
            }
            if self.is_shutting_down() {
                return BuildOutcome::ShuttingDown;
            }
            state = self.progress.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn evaluate(&self, state: &mut BuildState, required: &[ModuleId]) -> Verdict {
        let graph = &state.graph;
        for &id in required {
            let node = graph.get(id);
            if node.state == ModuleState::Failed {
                let (root, message) = match &node.failure {
                    Some(f) => (f.root, f.message.clone()),
                    None => (id, "build failed".to_string()),
                };
                return Verdict::Done(BuildOutcome::Failed {
                    module: graph.get(root).name().to_string(),
                    message,
                });
            }
        }

        let closure = graph.closure(required);
        if closure.iter().any(|id| graph.get(*id).state != ModuleState::Built) {
            return Verdict::Pending;
        }
        let (pinned, dead) = self.pin_artifacts(graph, &closure);
        if !dead.is_empty() {
            return Verdict::Reset(self.reset_dead(state, &dead, pinned));
        }
        let mut artifacts = BTreeMap::new();
        for id in closure {
            if let Some(artifact) = &graph.get(id).artifact {
                artifacts.insert(graph.get(id).name().to_string(), artifact.path.clone());
            }
        }
        Verdict::Done(BuildOutcome::Built { artifacts, pinned })
    }

    /// Pin the cached artifacts of `ids`. Returns the pins taken and the
    /// modules whose entry has left the cache.
    fn pin_artifacts(&self, graph: &GraphStore, ids: &[ModuleId]) -> (Vec<EntryKey>, Vec<ModuleId>) {
        let mut pinned = Vec::new();
        let mut dead = Vec::new();
        for &id in ids {
            let Some(ArtifactRef { entry: Some(key), .. }) = &graph.get(id).artifact else {
                continue;
            };
            if self.cache.pin(key) {
                pinned.push(key.clone());
            } else {
                dead.push(id);
            }
        }
        (pinned, dead)
    }

    /// Send built modules whose artifacts were evicted back for building and
    /// drop the pins taken alongside them.
    fn reset_dead(&self, state: &mut BuildState, dead: &[ModuleId], pinned: Vec<EntryKey>) -> Evicted {
        for &id in dead {
            let node = state.graph.get_mut(id);
            node.artifact = None;
            debug!(module = %node.key, "artifact left the cache, rebuilding");
        }
        state.scheduler.reset(&mut state.graph, dead, false);
        let mut evicted = Evicted::default();
        for key in &pinned {
            evicted.merge(self.cache.unpin_deferred(key));
        }
        evicted
    }

    pub fn release_pins(&self, pinned: &[EntryKey]) {
        for key in pinned {
            self.cache.unpin(key);
        }
    }

    /// Number of builds allowed to run at once: one per registered
    /// connection, at least one, at most the configured maximum.
    pub fn concurrency_limit(&self) -> usize {
        self.connections
            .registered_count()
            .clamp(1, self.config.daemon.max_concurrency)
    }

    /// Block until a module can be dispatched. Returns `None` once the
    /// daemon is shutting down.
    pub fn next_job(&self) -> Option<BuildJob> {
        let mut state = self.lock_state();
        loop {
            if self.is_shutting_down() {
                return None;
            }
            if state.in_flight < self.concurrency_limit() {
                let st = &mut *state;
                if let Some(id) = st.scheduler.dequeue_next(&mut st.graph) {
                    match self.prepare_job(st, id) {
                        Ok(job) => {
                            st.in_flight += 1;
                            return Some(job);
                        }
                        Err(evicted) => {
                            drop(state);
                            self.cache.release(evicted);
                            state = self.lock_state();
                            continue;
                        }
                    }
                }
            }
            state = self.work_ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Fails when a dependency's artifact has left the cache; the
    /// dependency is reset and `id` waits for it again.
    fn prepare_job(&self, state: &mut BuildState, id: ModuleId) -> std::result::Result<BuildJob, Evicted> {
        let transitive = {
            let graph = &state.graph;
            graph.closure(&graph.get(id).deps)
        };
        let (pinned, dead) = self.pin_artifacts(&state.graph, &transitive);
        if !dead.is_empty() {
            let evicted = self.reset_dead(state, &dead, pinned);
            state.scheduler.requeue(&mut state.graph, id);
            return Err(evicted);
        }

        let graph = &mut state.graph;
        let mut deps: Vec<ModuleId> = graph.get(id).deps.clone();
        deps.sort_by(|a, b| graph.get(*a).name().cmp(graph.get(*b).name()));

        let node = graph.get(id);
        let context = node.key.context.0.to_le_bytes();
        let mut parts: Vec<Vec<u8>> = vec![node.content_hash.as_bytes().to_vec(), context.to_vec()];
        for &dep in &deps {
            let dep_node = graph.get(dep);
            parts.push(dep_node.name().as_bytes().to_vec());
            if let Some(hash) = dep_node.build_hash {
                parts.push(hash.as_bytes().to_vec());
            }
        }
        let build_hash = ContentHash::from_parts(parts.iter().map(Vec::as_slice));
        let entry = EntryKey::new(node.key.clone(), build_hash);

        let mut dependencies = Vec::new();
        for dep in transitive {
            let dep_node = graph.get(dep);
            if let Some(artifact) = &dep_node.artifact {
                dependencies.push((dep_node.name().to_string(), artifact.path.clone()));
            }
        }

        let job = BuildJob {
            id,
            module: node.name().to_string(),
            entry,
            depth: node.depth,
            stale: node.stale,
            source: node.origin.source.clone(),
            working_directory: node.origin.working_directory.clone(),
            template: node.origin.command.clone(),
            dependencies,
            pinned,
            session: node
                .session
                .clone()
                .unwrap_or_else(|| SessionId::new("unknown")),
            source_hash: node.content_hash,
        };
        graph.get_mut(id).build_hash = Some(build_hash);
        Ok(job)
    }

    /// Record a worker's result and wake whoever it unblocks.
    pub fn finish_job(&self, job: BuildJob, result: JobResult) {
        self.release_pins(&job.pinned);
        let mut evicted = Evicted::default();
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            state.in_flight = state.in_flight.saturating_sub(1);
            let node = state.graph.get(job.id);
            let obsolete = node.requeue || node.content_hash != job.source_hash;

            if obsolete {
                debug!(module = %job.module, "discarding result of an outdated build");
                if let JobResult::Rebuilt { indexed: true, .. } = &result {
                    evicted = self.cache.discard(&job.entry);
                }
                state.scheduler.requeue(&mut state.graph, job.id);
            } else {
                match result {
                    JobResult::Reused { artifact } => {
                        state.graph.get_mut(job.id).artifact = Some(ArtifactRef {
                            path: artifact,
                            entry: Some(job.entry.clone()),
                        });
                        state.scheduler.complete(&mut state.graph, job.id, false);
                        info!(module = %job.module, "module reused from cache");
                    }
                    JobResult::Rebuilt { artifact, indexed } => {
                        state.graph.get_mut(job.id).artifact = Some(ArtifactRef {
                            path: artifact,
                            entry: indexed.then(|| job.entry.clone()),
                        });
                        state.scheduler.complete(&mut state.graph, job.id, true);
                        info!(module = %job.module, indexed, "module built");
                    }
                    JobResult::Failed { message } => {
                        let failed = state.scheduler.fail(&mut state.graph, job.id, message);
                        warn!(module = %job.module, failed = failed.len(), "module failed");
                    }
                }
            }
        }
        self.cache.release(evicted);
        self.work_ready.notify_all();
        self.progress.notify_all();
    }

    /// Forget a session so its next registration revalidates everything.
    pub fn invalidate_session(&self, session: &SessionId) -> bool {
        let removed = self.lock_state().sessions.invalidate(session);
        if removed {
            info!(session = %session, "session invalidated");
        }
        removed
    }

    pub fn prune(&self) -> SweepReport {
        self.cache.sweep(SweepTrigger::Interval)
    }

    pub fn status(&self) -> StatusReport {
        let state = self.lock_state();
        StatusReport {
            policy: state.scheduler.policy(),
            graph: state.graph.stats(),
            ready: state.scheduler.ready_len(),
            in_flight: state.in_flight,
            cache: self.cache.stats(),
            connections: self.connections.live_count(),
            registered: self.connections.registered_count(),
            sessions: state.sessions.ids(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Stop dispatching new work and release every waiter. Builds already
    /// running finish and commit their results.
    pub fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown started");
        // Taking the lock orders the flag before any waiter's next check.
        drop(self.lock_state());
        self.work_ready.notify_all();
        self.progress.notify_all();
    }

    /// Block until no build is running.
    pub fn wait_idle(&self) {
        let mut state = self.lock_state();
        while state.in_flight > 0 {
            state = self.progress.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Names of modules currently being built.
    pub fn building(&self) -> Vec<String> {
        let state = self.lock_state();
        state
            .graph
            .ids()
            .filter(|id| state.graph.get(*id).state == ModuleState::Building)
            .map(|id| state.graph.get(id).name().to_string())
            .collect()
    }
}

/// Unindexed artifacts live in scratch space, which is only cleared when
/// the daemon starts.
fn artifact_live(cache: &CacheEngine, node: &ModuleNode) -> bool {
    match &node.artifact {
        Some(ArtifactRef { entry: Some(key), .. }) => cache.contains(key),
        Some(ArtifactRef { entry: None, .. }) => true,
        None => false,
    }
}
