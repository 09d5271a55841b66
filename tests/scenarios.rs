//! End-to-end behaviour of the daemon core with an in-memory toolchain:
//! a fake scanner that serves a module table and a fake compiler that
//! records what it was asked to build.

use modulard::cache::SweepTrigger;
use modulard::config::{DaemonConfig, SchedulingPolicy};
use modulard::coordinator::{BuildOutcome, Coordinator, Registration};
use modulard::daemon::{serve, send_request, Client, CompileReply, Request, Response, ShutdownReason};
use modulard::error::{DaemonError, Result};
use modulard::executor::WorkerPool;
use modulard::graph::ModuleState;
use modulard::hash::ContentHash;
use modulard::storage::Storage;
use modulard::toolchain::{CompileJob, Compiler, ScanResult, ScannedModule, Scanner, TranslationUnit};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct FakeModule {
    requires: Vec<String>,
    content: String,
}

/// Module table plus the direct imports of each translation unit, keyed by
/// the unit's source file.
#[derive(Default)]
struct Project {
    modules: Mutex<BTreeMap<String, FakeModule>>,
    units: Mutex<HashMap<String, Vec<String>>>,
}

impl Project {
    fn module(&self, name: &str, requires: &[&str], content: &str) {
        self.modules.lock().unwrap().insert(
            name.to_string(),
            FakeModule {
                requires: requires.iter().map(|s| s.to_string()).collect(),
                content: content.to_string(),
            },
        );
    }

    fn unit(&self, source: &str, requires: &[&str]) {
        self.units
            .lock()
            .unwrap()
            .insert(source.to_string(), requires.iter().map(|s| s.to_string()).collect());
    }

    fn edit(&self, name: &str, content: &str) {
        if let Some(m) = self.modules.lock().unwrap().get_mut(name) {
            m.content = content.to_string();
        }
    }
}

impl Scanner for Project {
    fn scan(&self, tu: &TranslationUnit) -> Result<ScanResult> {
        let source = tu
            .source()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let requires = self.units.lock().unwrap().get(&source).cloned().ok_or_else(|| {
            DaemonError::ScanFailure {
                tu: source.clone(),
                reason: "no such unit".to_string(),
            }
        })?;

        let modules = self.modules.lock().unwrap();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = requires.iter().cloned().collect();
        let mut scanned = Vec::new();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(module) = modules.get(&name) else {
                return Err(DaemonError::ScanFailure {
                    tu: source,
                    reason: format!("module {name} not found"),
                });
            };
            queue.extend(module.requires.iter().cloned());
            scanned.push(ScannedModule {
                name: name.clone(),
                source: PathBuf::from(format!("{name}.cppm")),
                content_hash: ContentHash::from_bytes(module.content.as_bytes()),
                requires: module.requires.clone(),
            });
        }
        Ok(ScanResult {
            requires,
            modules: scanned,
        })
    }
}

#[derive(Default)]
struct FakeCompiler {
    calls: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    active: Mutex<HashSet<String>>,
    overlap: AtomicBool,
    missing_dependency: AtomicBool,
    delay: Duration,
}

impl FakeCompiler {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn calls(&self, module: &str) -> usize {
        self.calls.lock().unwrap().get(module).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn fail(&self, module: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(module.to_string());
        } else {
            set.remove(module);
        }
    }
}

impl Compiler for FakeCompiler {
    fn compile(&self, job: &CompileJob) -> Result<()> {
        *self.calls.lock().unwrap().entry(job.module.clone()).or_default() += 1;
        if !self.active.lock().unwrap().insert(job.module.clone()) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        if job.dependencies.iter().any(|(_, path)| !path.exists()) {
            self.missing_dependency.store(true, Ordering::SeqCst);
        }
        thread::sleep(self.delay);
        self.active.lock().unwrap().remove(&job.module);

        if self.failing.lock().unwrap().contains(&job.module) {
            return Err(DaemonError::CompileFailure {
                module: job.module.clone(),
                diagnostic: format!("{}.cppm:1:1: error: expected declaration", job.module),
            });
        }
        std::fs::write(&job.output, format!("pcm {}", job.module))?;
        Ok(())
    }
}

fn config(policy: SchedulingPolicy) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.daemon.max_concurrency = 4;
    config.daemon.policy = policy;
    config
}

fn command(source: &str) -> Vec<String> {
    ["clang++", "-std=c++20", "-c", source].iter().map(|s| s.to_string()).collect()
}

fn coordinator(
    root: &Path,
    project: &Arc<Project>,
    compiler: &Arc<FakeCompiler>,
    config: DaemonConfig,
) -> Arc<Coordinator> {
    let storage = Storage::init(root).unwrap();
    let coord = Coordinator::new(
        config,
        storage,
        Arc::clone(project) as Arc<dyn Scanner>,
        Arc::clone(compiler) as Arc<dyn Compiler>,
    )
    .unwrap();
    Arc::new(coord)
}

struct Daemon {
    root: PathBuf,
    coord: Arc<Coordinator>,
    pool: Option<WorkerPool>,
}

impl Daemon {
    fn start(root: &Path, project: &Arc<Project>, compiler: &Arc<FakeCompiler>, config: DaemonConfig) -> Self {
        let mut daemon = Self::idle(root, project, compiler, config);
        let workers = daemon.coord.config().daemon.max_concurrency;
        daemon.pool = Some(WorkerPool::spawn(Arc::clone(&daemon.coord), workers).unwrap());
        daemon
    }

    /// A coordinator without workers: registered modules stay queued.
    fn idle(root: &Path, project: &Arc<Project>, compiler: &Arc<FakeCompiler>, config: DaemonConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            coord: coordinator(root, project, compiler, config),
            pool: None,
        }
    }

    fn registration(&self, source: &str, session: &str) -> Registration {
        Registration {
            working_directory: self.root.clone(),
            command: command(source),
            file_mapping: BTreeMap::new(),
            session: Some(session.to_string()),
        }
    }

    /// Register a unit and wait for its modules, as one client connection.
    fn compile(&self, source: &str, session: &str) -> Result<BuildOutcome> {
        self.submit(self.registration(source, session))
    }

    fn submit(&self, registration: Registration) -> Result<BuildOutcome> {
        let conn = self.coord.connections().open();
        let outcome = self
            .coord
            .register(conn, registration)
            .map(|registered| self.coord.wait_for(&registered.required));
        if let Ok(BuildOutcome::Built { pinned, .. }) = &outcome {
            self.coord.release_pins(pinned);
        }
        self.coord.connections().close(conn);
        outcome
    }

    fn state_of(&self, name: &str) -> Vec<ModuleState> {
        self.coord.with_state(|s| {
            s.graph
                .find_by_name(name)
                .into_iter()
                .map(|id| s.graph.get(id).state)
                .collect()
        })
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.coord.begin_shutdown();
        if let Some(pool) = self.pool.take() {
            pool.join();
        }
    }
}

fn built(outcome: BuildOutcome) -> BTreeMap<String, PathBuf> {
    match outcome {
        BuildOutcome::Built { artifacts, .. } => artifacts,
        other => panic!("expected a successful build, got {other:?}"),
    }
}

#[test]
fn shared_module_is_queued_first_by_fan_in() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    for name in ["X", "Y", "Z"] {
        project.module(name, &[], name);
    }
    project.unit("tu1.cpp", &["X", "Y"]);
    project.unit("tu2.cpp", &["Y", "Z"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::idle(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));

    for source in ["tu1.cpp", "tu2.cpp"] {
        let conn = daemon.coord.connections().open();
        daemon.coord.register(conn, daemon.registration(source, "s1")).unwrap();
    }

    daemon.coord.with_state(|s| {
        let fan_in = |name: &str| s.graph.get(s.graph.find_by_name(name)[0]).fan_in();
        assert_eq!(fan_in("Y"), 2);
        assert_eq!(fan_in("X"), 1);
        assert_eq!(fan_in("Z"), 1);
        let order: Vec<&str> = s
            .scheduler
            .ready_order()
            .into_iter()
            .map(|id| s.graph.get(id).name())
            .collect();
        assert_eq!(order, vec!["Y", "X", "Z"]);
    });
    assert_eq!(compiler.total_calls(), 0);
}

#[test]
fn unchanged_module_is_reused_in_a_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "export module M;");
    project.unit("main.cpp", &["M"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));

    let first = built(daemon.compile("main.cpp", "s1").unwrap());
    assert_eq!(compiler.calls("M"), 1);

    let second = built(daemon.compile("main.cpp", "s2").unwrap());
    assert_eq!(compiler.calls("M"), 1);
    assert_eq!(first, second);
    assert!(second["M"].exists());
}

#[test]
fn changed_module_rebuilds_its_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "export module M; int v = 1;");
    project.module("N", &["M"], "export module N; import M;");
    project.module("K", &[], "export module K;");
    project.unit("main.cpp", &["N", "K"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));

    let before = built(daemon.compile("main.cpp", "s1").unwrap());
    assert_eq!((compiler.calls("M"), compiler.calls("N"), compiler.calls("K")), (1, 1, 1));

    project.edit("M", "export module M; int v = 2;");
    // Same session: sources are not looked at again.
    daemon.compile("main.cpp", "s1").unwrap();
    assert_eq!(compiler.calls("M"), 1);

    let after = built(daemon.compile("main.cpp", "s2").unwrap());
    assert_eq!((compiler.calls("M"), compiler.calls("N"), compiler.calls("K")), (2, 2, 1));
    assert_ne!(before["M"], after["M"]);
    assert_eq!(before["K"], after["K"]);
    assert!(!compiler.missing_dependency.load(Ordering::SeqCst));
}

#[test]
fn failure_reaches_every_dependent_request() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "export module M;");
    project.module("N", &["M"], "export module N; import M;");
    project.unit("a.cpp", &["N"]);
    project.unit("b.cpp", &["N"]);
    let compiler = Arc::new(FakeCompiler::default());
    compiler.fail("M", true);
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));

    match daemon.compile("a.cpp", "s1").unwrap() {
        BuildOutcome::Failed { module, message } => {
            assert_eq!(module, "M");
            assert!(message.contains("expected declaration"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(
        daemon.compile("b.cpp", "s1").unwrap(),
        BuildOutcome::Failed { ref module, .. } if module == "M"
    ));
    assert_eq!(compiler.calls("M"), 1);
    assert_eq!(compiler.calls("N"), 0);
    assert_eq!(daemon.state_of("N"), vec![ModuleState::Failed]);

    // A new session retries the module that failed on its own.
    compiler.fail("M", false);
    built(daemon.compile("a.cpp", "s2").unwrap());
    assert_eq!((compiler.calls("M"), compiler.calls("N")), (2, 1));
}

#[test]
fn scan_failure_is_reported_to_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.unit("main.cpp", &["missing"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));

    let err = daemon.compile("main.cpp", "s1").unwrap_err();
    assert!(matches!(err, DaemonError::ScanFailure { .. }));
    assert!(err.is_client_facing());
}

#[test]
fn cycle_is_rejected_without_touching_the_graph() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("A", &["B"], "A");
    project.module("B", &["A"], "B");
    project.module("C", &[], "C");
    project.unit("bad.cpp", &["A"]);
    project.unit("good.cpp", &["C"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));

    let err = daemon.compile("bad.cpp", "s1").unwrap_err();
    assert!(matches!(err, DaemonError::CycleDetected { .. }));
    assert!(daemon.state_of("A").is_empty());

    built(daemon.compile("good.cpp", "s1").unwrap());
}

#[test]
fn concurrent_units_build_each_module_once() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("core", &[], "core");
    project.module("util", &["core"], "util");
    project.module("io", &["core"], "io");
    project.module("net", &["io", "util"], "net");
    let units: Vec<String> = (0..8).map(|i| format!("tu{i}.cpp")).collect();
    for (i, unit) in units.iter().enumerate() {
        let imports: &[&str] = if i % 2 == 0 { &["net", "util"] } else { &["io"] };
        project.unit(unit, imports);
    }
    let compiler = Arc::new(FakeCompiler::with_delay(Duration::from_millis(20)));
    let daemon = Arc::new(Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn)));

    let handles: Vec<_> = units
        .into_iter()
        .map(|unit| {
            let daemon = Arc::clone(&daemon);
            thread::spawn(move || daemon.compile(&unit, "s1").unwrap())
        })
        .collect();
    for handle in handles {
        let artifacts = built(handle.join().unwrap());
        assert!(artifacts.contains_key("core"));
    }

    assert!(!compiler.overlap.load(Ordering::SeqCst));
    assert!(!compiler.missing_dependency.load(Ordering::SeqCst));
    for name in ["core", "util", "io", "net"] {
        assert_eq!(compiler.calls(name), 1, "{name} compiled more than once");
    }
}

#[test]
fn one_unit_at_a_time_still_completes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("base", &[], "base");
    project.module("a", &["base"], "a");
    project.module("b", &["base"], "b");
    project.unit("first.cpp", &["a"]);
    project.unit("second.cpp", &["b", "base"]);
    let compiler = Arc::new(FakeCompiler::with_delay(Duration::from_millis(10)));
    let daemon = Arc::new(Daemon::start(
        dir.path(),
        &project,
        &compiler,
        config(SchedulingPolicy::TuAtATime),
    ));

    let handles: Vec<_> = ["second.cpp", "first.cpp"]
        .into_iter()
        .map(|unit| {
            let daemon = Arc::clone(&daemon);
            thread::spawn(move || daemon.compile(unit, "s1").unwrap())
        })
        .collect();
    for handle in handles {
        built(handle.join().unwrap());
    }
    assert_eq!(compiler.total_calls(), 3);
}

#[test]
fn pinned_artifacts_survive_a_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "M");
    project.unit("main.cpp", &["M"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));

    let conn = daemon.coord.connections().open();
    let registered = daemon.coord.register(conn, daemon.registration("main.cpp", "s1")).unwrap();
    let (artifacts, pinned) = match daemon.coord.wait_for(&registered.required) {
        BuildOutcome::Built { artifacts, pinned } => (artifacts, pinned),
        other => panic!("expected a successful build, got {other:?}"),
    };
    assert_eq!(pinned.len(), 1);

    let far_future = Instant::now() + Duration::from_secs(365 * 24 * 3600);
    let report = daemon.coord.cache().sweep_at(SweepTrigger::Interval, far_future);
    assert_eq!(report.evicted, 0);
    assert_eq!(report.pinned_expired, 1);
    assert!(artifacts["M"].exists());

    daemon.coord.release_pins(&pinned);
    daemon.coord.connections().close(conn);
    let report = daemon.coord.cache().sweep_at(SweepTrigger::Interval, far_future);
    assert_eq!(report.evicted, 1);
    assert!(!artifacts["M"].exists());
}

#[test]
fn restart_reuses_the_persisted_cache() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "M");
    project.module("N", &["M"], "N");
    project.unit("main.cpp", &["N"]);
    let compiler = Arc::new(FakeCompiler::default());

    let first = {
        let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));
        built(daemon.compile("main.cpp", "s1").unwrap())
    };
    assert_eq!(compiler.total_calls(), 2);

    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));
    assert_eq!(daemon.coord.cache().stats().entries, 2);
    let second = built(daemon.compile("main.cpp", "s1").unwrap());
    assert_eq!(compiler.total_calls(), 2);
    assert_eq!(first, second);
}

#[test]
fn removed_artifact_is_rebuilt_in_a_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "M");
    project.unit("main.cpp", &["M"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));

    let artifacts = built(daemon.compile("main.cpp", "s1").unwrap());
    let far_future = Instant::now() + Duration::from_secs(365 * 24 * 3600);
    daemon.coord.cache().sweep_at(SweepTrigger::Interval, far_future);
    assert!(!artifacts["M"].exists());

    let again = built(daemon.compile("main.cpp", "s2").unwrap());
    assert_eq!(compiler.calls("M"), 2);
    assert!(again["M"].exists());
}

#[test]
fn unmarked_registrations_see_every_edit() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "export module M; int v = 1;");
    project.unit("main.cpp", &["M"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));
    let unmarked = || Registration {
        session: None,
        ..daemon.registration("main.cpp", "")
    };

    let first = built(daemon.submit(unmarked()).unwrap());
    let unchanged = built(daemon.submit(unmarked()).unwrap());
    assert_eq!(compiler.calls("M"), 1);
    assert_eq!(first, unchanged);

    project.edit("M", "export module M; int v = 2;");
    let edited = built(daemon.submit(unmarked()).unwrap());
    assert_eq!(compiler.calls("M"), 2);
    assert_ne!(first["M"], edited["M"]);
    assert!(edited["M"].exists());
    assert!(daemon.coord.status().sessions.is_empty());
}

#[test]
fn evicted_artifact_is_rebuilt_within_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "M");
    project.module("N", &["M"], "N");
    project.unit("a.cpp", &["M"]);
    project.unit("b.cpp", &["N"]);
    let compiler = Arc::new(FakeCompiler::default());
    let daemon = Daemon::start(dir.path(), &project, &compiler, config(SchedulingPolicy::FanIn));
    let far_future = Instant::now() + Duration::from_secs(365 * 24 * 3600);

    let first = built(daemon.compile("a.cpp", "s1").unwrap());
    daemon.coord.cache().sweep_at(SweepTrigger::Interval, far_future);
    assert!(!first["M"].exists());

    // N needs M, which is Built in the graph but gone from the cache.
    let with_n = built(daemon.compile("b.cpp", "s1").unwrap());
    assert_eq!(compiler.calls("M"), 2);
    assert!(!compiler.missing_dependency.load(Ordering::SeqCst));
    assert!(with_n["M"].exists());
    assert!(with_n["N"].exists());

    // M is required directly this time.
    daemon.coord.cache().sweep_at(SweepTrigger::Interval, far_future);
    let again = built(daemon.compile("a.cpp", "s1").unwrap());
    assert_eq!(compiler.calls("M"), 3);
    assert!(again["M"].exists());
}

fn spawn_server(root: &Path, project: &Arc<Project>, compiler: &Arc<FakeCompiler>, idle_secs: u64) -> thread::JoinHandle<ShutdownReason> {
    let mut config = config(SchedulingPolicy::FanIn);
    config.daemon.idle_timeout_secs = idle_secs;
    let coord = coordinator(root, project, compiler, config);
    let handle = thread::spawn(move || serve(coord).unwrap());

    let socket = Storage::open(root).socket_path();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    handle
}

#[test]
fn socket_round_trip_and_requested_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "M");
    project.unit("main.cpp", &["M"]);
    let compiler = Arc::new(FakeCompiler::default());
    let server = spawn_server(dir.path(), &project, &compiler, 300);

    assert_eq!(send_request(dir.path(), Request::Ping).unwrap(), Response::Pong);
    let reply = Client::connect(dir.path())
        .unwrap()
        .compile(Registration {
            working_directory: dir.path().to_path_buf(),
            command: command("main.cpp"),
            ..Default::default()
        })
        .unwrap();
    match reply {
        CompileReply::Built { artifacts } => assert!(artifacts["M"].exists()),
        other => panic!("expected a successful build, got {other:?}"),
    }

    match send_request(dir.path(), Request::Status).unwrap() {
        Response::Ok { data } => assert_eq!(data["graph"]["built"], 1),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(send_request(dir.path(), Request::Shutdown).unwrap(), Response::Goodbye);
    assert_eq!(server.join().unwrap(), ShutdownReason::Requested);
    assert!(!Storage::open(dir.path()).socket_path().exists());
}

#[test]
fn register_without_handshake_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    let compiler = Arc::new(FakeCompiler::default());
    let server = spawn_server(dir.path(), &project, &compiler, 300);

    let response = send_request(
        dir.path(),
        Request::Register {
            unit: Registration::default(),
        },
    )
    .unwrap();
    assert!(matches!(response, Response::Error { .. }));

    send_request(dir.path(), Request::Shutdown).unwrap();
    server.join().unwrap();
}

fn registered_connections(root: &Path) -> u64 {
    match send_request(root, Request::Status).unwrap() {
        Response::Ok { data } => data["registered"].as_u64().unwrap(),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn departed_client_counts_until_its_builds_finish() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    project.module("M", &[], "M");
    project.unit("main.cpp", &["M"]);
    let compiler = Arc::new(FakeCompiler::with_delay(Duration::from_millis(800)));
    let server = spawn_server(dir.path(), &project, &compiler, 300);

    let mut client = Client::connect(dir.path()).unwrap();
    let accepted = client
        .request(&Request::Register {
            unit: Registration {
                working_directory: dir.path().to_path_buf(),
                command: command("main.cpp"),
                ..Default::default()
            },
        })
        .unwrap();
    assert!(matches!(accepted, Response::ScanAccepted { .. }));
    drop(client);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(registered_connections(dir.path()), 1);

    let deadline = Instant::now() + Duration::from_secs(10);
    while registered_connections(dir.path()) > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(registered_connections(dir.path()), 0);
    assert_eq!(compiler.calls("M"), 1);

    send_request(dir.path(), Request::Shutdown).unwrap();
    server.join().unwrap();
}

#[test]
fn idle_daemon_shuts_down_unless_a_client_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let project = Arc::new(Project::default());
    let compiler = Arc::new(FakeCompiler::default());
    let started = Instant::now();
    let server = spawn_server(dir.path(), &project, &compiler, 1);

    // Arrives before expiry and stays connected past it.
    let client = Client::connect(dir.path()).unwrap();
    thread::sleep(Duration::from_millis(1500));
    assert!(!server.is_finished());

    drop(client);
    assert_eq!(server.join().unwrap(), ShutdownReason::Idle);
    assert!(started.elapsed() >= Duration::from_millis(2500));
}
