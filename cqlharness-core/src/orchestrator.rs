//! Lifecycle Orchestration - one embedded engine per process
//!
//! [`LifecycleOrchestrator`] is the service object tests share (by `Arc`) to
//! get a ready session. The first [`ensure_started`] call brings the engine
//! up; every later call reuses it. All callers then make sure the keyspace
//! exists and replay their fixture scripts.
//!
//! # Bring-up sequence:
//! 1. Validate the keyspace name (before any state is touched)
//! 2. Take the process-wide lock
//! 3. Validate and clean the data folders
//! 4. Resolve ports: explicit values are checked, the rest are reserved
//! 5. Attach to an instance already answering on the JMX port, or start the
//!    engine on its worker thread and wait for readiness
//! 6. Connect the session, register engine and session for shutdown
//! 7. Release the lock, ensure the keyspace, replay scripts
//!
//! A failed bring-up past the folder checks poisons the orchestrator: the
//! engine thread, ports and folders may be in any state, so later calls fail
//! fast with [`HarnessError::StartupFailed`] instead of retrying.
//!
//! [`ensure_started`]: LifecycleOrchestrator::ensure_started

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{validate_keyspace_name, HarnessConfig, PortSetting, PortSettings};
use crate::engine::folders::{clean_folder, ensure_folder, validate_folder};
use crate::engine::probe::{is_listening, DEFAULT_PROBE_TIMEOUT};
use crate::engine::worker::start_engine;
use crate::engine::{
    EngineFactory, EngineHandle, HeldSockets, PortAllocator, PortMap, PortName, PortReservation,
};
use crate::error::{HarnessError, Result};
use crate::metrics::{EngineStartTimer, HarnessMetrics};
use crate::script::{ResourceLocator, ScriptExecutor};
use crate::session::{ConnectTarget, Session, SessionFactory};
use crate::shutdown::{SessionResource, ShutdownRegistry, ShutdownReport};

/// Native port of an externally managed instance when none is configured.
pub const DEFAULT_CQL_PORT: u16 = 9042;

/// How the current session reaches its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Started by this orchestrator.
    Embedded,
    /// Found already running on the configured ports.
    Attached,
    /// Managed outside the test process (`external_host`).
    External,
}

/// Process-wide bring-up state, only touched under the orchestrator lock.
#[derive(Default)]
pub struct OrchestratorState {
    started: bool,
    mode: Option<EngineMode>,
    session: Option<Arc<dyn Session>>,
    engine: Option<Arc<EngineHandle>>,
    bound_ports: PortMap,
    /// Why the orchestrator refuses to start again.
    failure: Option<String>,
}

/// Brings the engine up once and hands out ready sessions.
pub struct LifecycleOrchestrator {
    engine_factory: Arc<dyn EngineFactory>,
    session_factory: Arc<dyn SessionFactory>,
    allocator: Arc<PortAllocator>,
    registry: Arc<ShutdownRegistry>,
    metrics: Arc<HarnessMetrics>,
    state: Mutex<OrchestratorState>,
}

impl LifecycleOrchestrator {
    pub fn new(
        engine_factory: Arc<dyn EngineFactory>,
        session_factory: Arc<dyn SessionFactory>,
    ) -> Self {
        let metrics = HarnessMetrics::new();
        Self {
            engine_factory,
            session_factory,
            allocator: Arc::new(PortAllocator::new()),
            registry: ShutdownRegistry::with_metrics(Arc::clone(&metrics)),
            metrics,
            state: Mutex::new(OrchestratorState::default()),
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ShutdownRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Use `metrics` for every counter. Replaces the registry with one
    /// reporting to `metrics`; call [`with_registry`](Self::with_registry)
    /// afterwards to supply a custom one.
    pub fn with_metrics(mut self, metrics: Arc<HarnessMetrics>) -> Self {
        self.registry = ShutdownRegistry::with_metrics(Arc::clone(&metrics));
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Arc<ShutdownRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<HarnessMetrics> {
        &self.metrics
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Start the engine if needed and return a session with the keyspace
    /// created and all configured scripts replayed.
    pub async fn ensure_started(&self, config: &HarnessConfig) -> Result<Arc<dyn Session>> {
        validate_keyspace_name(&config.keyspace_name)?;

        let session = {
            let mut state = self.state.lock().await;
            if let Some(reason) = &state.failure {
                return Err(HarnessError::StartupFailed(format!(
                    "the embedded engine cannot be started again: {reason}"
                )));
            }

            if state.started {
                check_port_conflicts(&state.bound_ports, &config.ports)?;
                debug!(keyspace = %config.keyspace_name, "Engine already started, reusing session");
            } else if let Err(e) = self.bring_up(config, &mut state).await {
                if e.is_fatal() || state.engine.is_some() {
                    poison(&mut state, &e);
                }
                return Err(e);
            }

            state.session.clone().ok_or_else(|| {
                HarnessError::StartupFailed("engine started without a session".into())
            })?
        };

        self.ensure_keyspace(session.as_ref(), config).await?;
        self.replay_scripts(&session, config).await?;
        Ok(session)
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    pub async fn mode(&self) -> Option<EngineMode> {
        self.state.lock().await.mode
    }

    /// Ports in use by the current engine; empty before the first start.
    pub async fn bound_ports(&self) -> PortMap {
        self.state.lock().await.bound_ports.clone()
    }

    pub async fn session(&self) -> Option<Arc<dyn Session>> {
        self.state.lock().await.session.clone()
    }

    /// Close every registered resource, sessions first. Later
    /// [`ensure_started`](Self::ensure_started) calls fail.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut state = self.state.lock().await;
        if state.failure.is_none() {
            state.failure = Some("the harness was shut down".into());
        }
        state.started = false;
        state.session = None;
        state.engine = None;
        drop(state);

        let report = self.registry.close_all().await;
        info!(
            closed = report.closed.len(),
            failures = report.failures.len(),
            "Harness shut down"
        );
        report
    }

    /// Close registered resources on Ctrl-C, unless shut down explicitly first.
    pub fn install_exit_hook(&self) -> JoinHandle<()> {
        self.registry.install_exit_hook()
    }

    async fn bring_up(&self, config: &HarnessConfig, state: &mut OrchestratorState) -> Result<()> {
        if let Some(host) = &config.external_host {
            let port = config
                .ports
                .cql
                .resolve(PortName::Cql)?
                .unwrap_or(DEFAULT_CQL_PORT);
            info!(host = %host, port, "Using externally managed instance, skipping embedded start");
            let session = self.connect(host, port, config).await?;
            let ports = PortMap::from([(PortName::Cql, port)]);
            publish(state, EngineMode::External, session, ports);
            return Ok(());
        }

        self.prepare_folders(config)?;

        let mut explicit = PortMap::new();
        for name in PortName::ALL {
            if let Some(port) = config.ports.get(name).resolve(name)? {
                explicit.insert(name, port);
            }
        }

        if let Some(&jmx) = explicit.get(&PortName::Jmx) {
            if is_listening(&config.listen_address, jmx, DEFAULT_PROBE_TIMEOUT) {
                return self.attach(config, state, explicit, jmx).await;
            }
        }

        let reservations = self.reserve_ports(&explicit)?;
        let mut ports = explicit;
        ports.extend(reservations.iter().map(|r| (r.name(), r.port())));
        info!(ports = ?ports, "Resolved engine ports");

        let settings = config.engine_settings(ports.clone());
        let engine = self
            .engine_factory
            .create(&settings)
            .map_err(|e| HarnessError::StartupFailed(format!("{e:#}")))?;

        let timer = EngineStartTimer::new(&self.metrics);
        let handle = match start_engine(
            engine,
            settings,
            HeldSockets::new(reservations),
            config.startup_timeout(),
        )
        .await
        {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                timer.disarm();
                return Err(e);
            }
        };
        drop(timer);
        self.registry.register(handle.clone());
        state.engine = Some(handle);

        let cql = ports.get(&PortName::Cql).copied().unwrap_or(DEFAULT_CQL_PORT);
        let session = self.connect(&config.rpc_address, cql, config).await?;
        publish(state, EngineMode::Embedded, session, ports);
        Ok(())
    }

    /// Reuse an engine left running by another process.
    async fn attach(
        &self,
        config: &HarnessConfig,
        state: &mut OrchestratorState,
        explicit: PortMap,
        jmx: u16,
    ) -> Result<()> {
        let Some(&cql) = explicit.get(&PortName::Cql) else {
            return Err(HarnessError::config(format!(
                "An instance already answers on JMX port '{jmx}'; set the cql port explicitly to attach to it"
            )));
        };
        warn!(jmx, cql, "Engine already running, attaching instead of starting a new one");
        let session = self.connect(&config.rpc_address, cql, config).await?;
        publish(state, EngineMode::Attached, session, explicit);
        Ok(())
    }

    fn prepare_folders(&self, config: &HarnessConfig) -> Result<()> {
        for (key, folder) in config.folders() {
            debug!(key, folder = %folder.display(), "Validating folder");
            validate_folder(folder, HarnessConfig::is_test_managed(folder))?;
        }
        if config.clean_data_at_startup {
            for folder in config.physical_data_folders() {
                clean_folder(folder)?;
            }
        }
        ensure_folder(&config.triggers_folder)
    }

    /// Reserve every port the caller left on auto.
    ///
    /// Explicit ports are claimed first: the bands overlap (cql and rpc), so
    /// an explicit port may sit inside another interface's band.
    fn reserve_ports(&self, explicit: &PortMap) -> Result<Vec<PortReservation>> {
        for &port in explicit.values() {
            self.allocator.claim(port);
        }
        let reservations = PortName::ALL
            .into_iter()
            .filter(|name| !explicit.contains_key(name))
            .map(|name| self.allocator.reserve(name, name.default_policy()))
            .collect::<Result<Vec<_>>>()?;
        self.metrics.record_port_allocation(reservations.len());
        Ok(reservations)
    }

    async fn connect(&self, host: &str, port: u16, config: &HarnessConfig) -> Result<Arc<dyn Session>> {
        let target = ConnectTarget {
            host: host.to_string(),
            port,
            cluster_name: config.cluster_name.clone(),
        };
        info!(target = %target, "Connecting session");
        let session = self
            .session_factory
            .connect(&target)
            .await
            .map_err(|e| HarnessError::Session(e.context(format!("cannot connect to {target}"))))?;
        self.registry
            .register(Arc::new(SessionResource(Arc::clone(&session))));
        Ok(session)
    }

    async fn ensure_keyspace(&self, session: &dyn Session, config: &HarnessConfig) -> Result<()> {
        let keyspace = &config.keyspace_name;
        info!(keyspace = %keyspace, durable_writes = config.durable_writes, "Ensuring keyspace exists");
        let statement = keyspace_statement(keyspace, config.durable_writes);
        session.execute(&statement).await.map_err(|e| {
            HarnessError::Session(e.context(format!("cannot create keyspace '{keyspace}'")))
        })?;
        self.metrics.record_keyspace_ensure();
        Ok(())
    }

    async fn replay_scripts(&self, session: &Arc<dyn Session>, config: &HarnessConfig) -> Result<()> {
        if config.scripts.is_empty() && config.script_templates.is_empty() {
            return Ok(());
        }
        let executor = ScriptExecutor::with_metrics(
            Arc::clone(session),
            ResourceLocator::new(config.script_roots.iter().cloned()),
            Arc::clone(&self.metrics),
        );
        for location in &config.scripts {
            executor.execute_script(location).await?;
        }
        for template in &config.script_templates {
            executor
                .execute_script_template(&template.location, &template.values)
                .await?;
        }
        Ok(())
    }
}

fn publish(state: &mut OrchestratorState, mode: EngineMode, session: Arc<dyn Session>, ports: PortMap) {
    state.session = Some(session);
    state.bound_ports = ports;
    state.mode = Some(mode);
    state.started = true;
    info!(mode = ?mode, "Engine ready");
}

fn poison(state: &mut OrchestratorState, error: &HarnessError) {
    warn!(error = %error, "Engine bring-up failed, refusing further starts in this process");
    state.failure = Some(error.to_string());
}

/// Reject explicit port values that disagree with the bound ones.
fn check_port_conflicts(bound: &PortMap, requested: &PortSettings) -> Result<()> {
    for (name, setting) in requested.explicit() {
        let (Some(&port), PortSetting::Fixed(value)) = (bound.get(&name), setting)
        else {
            continue;
        };
        if i64::from(port) != value {
            return Err(HarnessError::PortConflict {
                name,
                bound: port,
                requested: value,
            });
        }
    }
    Ok(())
}

/// The idempotent keyspace creation statement.
pub fn keyspace_statement(keyspace: &str, durable_writes: bool) -> String {
    format!(
        "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = \
         {{'class': 'SimpleStrategy', 'replication_factor': 1}} AND durable_writes = {durable_writes}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineSettings};
    use crate::session::ExecutionOutcome;
    use async_trait::async_trait;
    use std::net::TcpListener;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        stopped: AtomicUsize,
        connects: AtomicUsize,
    }

    struct FakeEngine {
        counters: Arc<Counters>,
        delay: Duration,
    }

    impl Engine for FakeEngine {
        fn complete_setup(&mut self, _: &EngineSettings, _: &mut HeldSockets) -> anyhow::Result<()> {
            Ok(())
        }

        fn activate(&mut self) -> anyhow::Result<()> {
            std::thread::sleep(self.delay);
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> &str {
            "fake"
        }
    }

    struct FakeSession {
        id: usize,
        statements: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Session for FakeSession {
        fn id(&self) -> String {
            self.id.to_string()
        }

        async fn execute(&self, statement: &str) -> anyhow::Result<ExecutionOutcome> {
            self.statements.lock().unwrap().push(statement.to_string());
            Ok(ExecutionOutcome::applied())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FakeSessions {
        counters: Arc<Counters>,
        targets: std::sync::Mutex<Vec<ConnectTarget>>,
    }

    #[async_trait]
    impl SessionFactory for FakeSessions {
        async fn connect(&self, target: &ConnectTarget) -> anyhow::Result<Arc<dyn Session>> {
            let id = self.counters.connects.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(target.clone());
            Ok(Arc::new(FakeSession {
                id,
                statements: Default::default(),
            }))
        }
    }

    fn orchestrator(delay: Duration) -> (LifecycleOrchestrator, Arc<Counters>, Arc<FakeSessions>) {
        let counters = Arc::new(Counters::default());
        let engine_counters = Arc::clone(&counters);
        let factory = move |_: &EngineSettings| -> anyhow::Result<Box<dyn Engine>> {
            engine_counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeEngine {
                counters: Arc::clone(&engine_counters),
                delay,
            }))
        };
        let sessions = Arc::new(FakeSessions {
            counters: Arc::clone(&counters),
            targets: Default::default(),
        });
        let orchestrator = LifecycleOrchestrator::new(Arc::new(factory), sessions.clone());
        (orchestrator, counters, sessions)
    }

    fn config_in(root: &Path) -> crate::config::HarnessConfigBuilder {
        for kind in ["data", "commitlog", "saved_caches", "hints", "cdc_raw", "triggers"] {
            std::fs::create_dir_all(root.join(kind)).unwrap();
        }
        HarnessConfig::builder()
            .folders_under(root)
            .listen_address("127.0.0.1")
            .rpc_address("127.0.0.1")
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_explicit_port_inside_another_band_is_not_reused() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, _, _) = orchestrator(Duration::ZERO);
        // 9160 opens the rpc band and also lies inside the cql band.
        let config = config_in(root.path()).cql_port(9160).build().unwrap();
        orchestrator.ensure_started(&config).await.unwrap();

        let ports = orchestrator.bound_ports().await;
        assert_eq!(ports[&PortName::Cql], 9160);
        assert_ne!(ports[&PortName::Rpc], 9160);
        let mut distinct: Vec<u16> = ports.values().copied().collect();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), PortName::ALL.len());
    }

    #[test]
    fn test_keyspace_statement() {
        assert_eq!(
            keyspace_statement("fixtures", false),
            "CREATE KEYSPACE IF NOT EXISTS fixtures WITH replication = \
             {'class': 'SimpleStrategy', 'replication_factor': 1} AND durable_writes = false"
        );
        assert!(keyspace_statement("k", true).ends_with("durable_writes = true"));
    }

    #[test]
    fn test_port_conflict_check() {
        let bound = PortMap::from([(PortName::Cql, 9042), (PortName::Jmx, 8100)]);
        let mut requested = PortSettings::default();
        check_port_conflicts(&bound, &requested).unwrap();

        requested.cql = PortSetting::Fixed(9042);
        check_port_conflicts(&bound, &requested).unwrap();

        requested.jmx = PortSetting::Fixed(8101);
        let err = check_port_conflicts(&bound, &requested).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::PortConflict { name: PortName::Jmx, bound: 8100, requested: 8101 }
        ));
    }

    #[tokio::test]
    async fn test_first_start_then_reentry() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, counters, _) = orchestrator(Duration::ZERO);
        let config = config_in(root.path()).build().unwrap();

        let first = orchestrator.ensure_started(&config).await.unwrap();
        let ports = orchestrator.bound_ports().await;
        assert_eq!(ports.len(), 5);
        assert_eq!(orchestrator.mode().await, Some(EngineMode::Embedded));

        let second = orchestrator.ensure_started(&config).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(orchestrator.bound_ports().await, ports);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);

        let snapshot = orchestrator.metrics().snapshot();
        assert_eq!(snapshot.engine_starts, 1);
        assert_eq!(snapshot.port_allocation_rounds, 1);
        assert_eq!(snapshot.keyspace_ensures, 2);
    }

    #[tokio::test]
    async fn test_invalid_keyspace_has_no_side_effects() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, counters, _) = orchestrator(Duration::ZERO);
        for name in ["", "9lives", "bad-name"] {
            let config = config_in(root.path()).keyspace_name(name).build().unwrap();
            let err = orchestrator.ensure_started(&config).await.err().unwrap();
            assert!(matches!(err, HarnessError::Configuration(_)));
        }
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.allocator().issued_count(), 0);
        assert!(!orchestrator.is_started().await);
    }

    #[tokio::test]
    async fn test_conflicting_port_on_reentry() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, _, _) = orchestrator(Duration::ZERO);
        let cql = free_port();
        let config = config_in(root.path()).cql_port(cql).build().unwrap();
        orchestrator.ensure_started(&config).await.unwrap();
        assert_eq!(orchestrator.bound_ports().await[&PortName::Cql], cql);

        let other = config_in(root.path())
            .cql_port(cql.wrapping_add(1).max(1025))
            .build()
            .unwrap();
        let err = orchestrator.ensure_started(&other).await.err().unwrap();
        assert!(matches!(err, HarnessError::PortConflict { name: PortName::Cql, .. }));

        // Leaving the port on auto never conflicts, and the conflict did not poison.
        let auto = config_in(root.path()).build().unwrap();
        orchestrator.ensure_started(&auto).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_poisons_orchestrator() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, counters, _) = orchestrator(Duration::from_millis(400));
        let config = config_in(root.path())
            .startup_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let err = orchestrator.ensure_started(&config).await.err().unwrap();
        assert!(matches!(err, HarnessError::StartupTimeout { .. }));

        let err = orchestrator.ensure_started(&config).await.err().unwrap();
        assert!(matches!(err, HarnessError::StartupFailed(_)));
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.metrics().snapshot().engine_starts, 0);
    }

    #[tokio::test]
    async fn test_missing_user_folder() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, counters, _) = orchestrator(Duration::ZERO);
        let config = config_in(root.path())
            .data_folder(root.path().join("not-created"))
            .build()
            .unwrap();
        let err = orchestrator.ensure_started(&config).await.err().unwrap();
        assert!(matches!(err, HarnessError::Configuration(ref m) if m.contains("does not exist")));
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);

        // Not fatal: a corrected configuration still starts.
        orchestrator
            .ensure_started(&config_in(root.path()).build().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clean_at_startup() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, _, _) = orchestrator(Duration::ZERO);
        let config = config_in(root.path()).build().unwrap();
        let stale = root.path().join("data/old.db");
        let hint = root.path().join("hints/keep.hint");
        std::fs::write(&stale, "x").unwrap();
        std::fs::write(&hint, "x").unwrap();

        orchestrator.ensure_started(&config).await.unwrap();
        assert!(!stale.exists());
        assert!(hint.exists());
    }

    #[tokio::test]
    async fn test_attach_to_running_instance() {
        let root = tempfile::tempdir().unwrap();
        let jmx = TcpListener::bind("127.0.0.1:0").unwrap();
        let jmx_port = jmx.local_addr().unwrap().port();
        let (orchestrator, counters, sessions) = orchestrator(Duration::ZERO);

        let without_cql = config_in(root.path()).jmx_port(jmx_port).build().unwrap();
        let err = orchestrator.ensure_started(&without_cql).await.err().unwrap();
        assert!(matches!(err, HarnessError::Configuration(_)));

        let config = config_in(root.path())
            .jmx_port(jmx_port)
            .cql_port(9142)
            .build()
            .unwrap();
        orchestrator.ensure_started(&config).await.unwrap();
        assert_eq!(orchestrator.mode().await, Some(EngineMode::Attached));
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
        assert_eq!(sessions.targets.lock().unwrap()[0].port, 9142);
        assert_eq!(orchestrator.allocator().issued_count(), 0);
    }

    #[tokio::test]
    async fn test_external_host() {
        let (orchestrator, counters, sessions) = orchestrator(Duration::ZERO);
        let config = HarnessConfig::builder()
            .external_host("db.test")
            .data_folder("/does/not/matter")
            .build()
            .unwrap();
        orchestrator.ensure_started(&config).await.unwrap();

        assert_eq!(orchestrator.mode().await, Some(EngineMode::External));
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
        let target = sessions.targets.lock().unwrap()[0].clone();
        assert_eq!((target.host.as_str(), target.port), ("db.test", DEFAULT_CQL_PORT));
    }

    #[tokio::test]
    async fn test_shutdown_closes_once_and_blocks_restart() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, counters, _) = orchestrator(Duration::ZERO);
        let config = config_in(root.path()).build().unwrap();
        orchestrator.ensure_started(&config).await.unwrap();

        let report = orchestrator.shutdown().await;
        assert!(report.all_succeeded());
        assert_eq!(report.closed.len(), 2);
        assert!(report.closed[0].starts_with("session:"));
        assert!(report.closed[1].starts_with("engine:fake:"));
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);

        assert_eq!(orchestrator.shutdown().await.attempted(), 0);
        let err = orchestrator.ensure_started(&config).await.err().unwrap();
        assert!(matches!(err, HarnessError::StartupFailed(_)));
    }
}
