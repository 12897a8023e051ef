//! Ordered, idempotent shutdown of sessions and engine processes
//!
//! Every live resource created during bring-up is registered here. Closing
//! happens group by group (sessions before the engine, so clients disconnect
//! before the server goes away) and in registration order within a group.
//!
//! Two paths can trigger shutdown: an explicit call from the test run and the
//! process-termination hook installed with
//! [`ShutdownRegistry::install_exit_hook`]. Pending entries are drained under
//! the registry lock, so whichever path gets there first closes a resource and
//! the other one finds nothing left to do.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::HarnessMetrics;
use crate::session::Session;

/// Closing order of registered resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownGroup {
    /// Client sessions connected to the engine.
    Sessions,
    /// The engine process itself.
    Engine,
}

impl fmt::Display for ShutdownGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sessions => write!(f, "sessions"),
            Self::Engine => write!(f, "engine"),
        }
    }
}

/// A resource the registry knows how to close.
#[async_trait]
pub trait Closeable: Send + Sync {
    /// Stable identity; two registrations with the same id are one resource.
    fn resource_id(&self) -> String;

    fn group(&self) -> ShutdownGroup;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Registers a [`Session`] with the shutdown registry.
pub struct SessionResource(pub Arc<dyn Session>);

#[async_trait]
impl Closeable for SessionResource {
    fn resource_id(&self) -> String {
        format!("session:{}", self.0.id())
    }

    fn group(&self) -> ShutdownGroup {
        ShutdownGroup::Sessions
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.0.close().await
    }
}

/// One resource that failed to close.
#[derive(Debug, Clone)]
pub struct CloseFailure {
    pub resource_id: String,
    pub message: String,
}

/// Outcome of a [`ShutdownRegistry::close_all`] run.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Ids closed successfully, in closing order.
    pub closed: Vec<String>,
    pub failures: Vec<CloseFailure>,
}

impl ShutdownReport {
    /// Returns `true` when every resource closed cleanly.
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of resources this run touched.
    pub fn attempted(&self) -> usize {
        self.closed.len() + self.failures.len()
    }
}

struct Entries {
    pending: Vec<Arc<dyn Closeable>>,
    known: HashSet<String>,
}

/// Tracks live resources and closes each of them at most once.
pub struct ShutdownRegistry {
    entries: Mutex<Entries>,
    exit_hook: CancellationToken,
    metrics: Arc<HarnessMetrics>,
}

impl ShutdownRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_metrics(HarnessMetrics::new())
    }

    pub fn with_metrics(metrics: Arc<HarnessMetrics>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Entries {
                pending: Vec::new(),
                known: HashSet::new(),
            }),
            exit_hook: CancellationToken::new(),
            metrics,
        })
    }

    /// Register a resource for shutdown.
    ///
    /// Returns `false` when a resource with the same id was registered
    /// before, even if it has already been closed.
    pub fn register(&self, resource: Arc<dyn Closeable>) -> bool {
        let id = resource.resource_id();
        let mut entries = self.lock_entries();
        if !entries.known.insert(id.clone()) {
            debug!(resource = %id, "Resource already registered for shutdown");
            return false;
        }
        debug!(resource = %id, group = %resource.group(), "Registered resource for shutdown");
        entries.pending.push(resource);
        true
    }

    /// Number of resources registered and not yet closed.
    pub fn pending_count(&self) -> usize {
        self.lock_entries().pending.len()
    }

    /// Close every pending resource, sessions first.
    ///
    /// A failing resource is logged and reported; the remaining resources are
    /// still closed.
    pub async fn close_all(&self) -> ShutdownReport {
        self.exit_hook.cancel();

        let mut batch = std::mem::take(&mut self.lock_entries().pending);
        // Stable sort keeps registration order within a group.
        batch.sort_by_key(|resource| resource.group());

        let mut report = ShutdownReport::default();
        if batch.is_empty() {
            return report;
        }
        info!(resources = batch.len(), "Closing registered resources");

        for resource in batch {
            let id = resource.resource_id();
            let start = Instant::now();
            match resource.close().await {
                Ok(()) => {
                    info!(resource = %id, elapsed_ms = start.elapsed().as_millis(), "Closed resource");
                    self.metrics.record_resource_closed();
                    report.closed.push(id);
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    warn!(resource = %id, error = %message, "Failed to close resource");
                    self.metrics.record_close_failure();
                    report.failures.push(CloseFailure {
                        resource_id: id,
                        message,
                    });
                }
            }
        }
        report
    }

    /// Close everything when the process receives Ctrl-C / SIGINT.
    ///
    /// The hook stops listening once [`close_all`](Self::close_all) runs
    /// through any other path. Must be called from within a Tokio runtime.
    pub fn install_exit_hook(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let token = self.exit_hook.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Exit hook disarmed");
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "Cannot listen for process termination");
                        return;
                    }
                    info!("Termination requested, shutting down embedded resources");
                    let report = registry.close_all().await;
                    if !report.all_succeeded() {
                        warn!(failures = report.failures.len(), "Shutdown finished with failures");
                    }
                }
            }
        })
    }

    fn lock_entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
