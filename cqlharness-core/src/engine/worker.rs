//! Dedicated Engine Thread and Readiness Latch
//!
//! The engine's lifecycle calls are blocking and may take seconds, so they
//! never run on the caller's thread or on a Tokio worker. A dedicated OS
//! thread owns the engine for its whole life:
//!
//! ```text
//! caller                          engine thread
//!   | spawn ---------------------> complete_setup()
//!   |                              release unadopted sockets
//!   |                              activate()
//!   | <---- readiness (oneshot) -- |
//!   | ...                          park on stop channel
//!   | stop command --------------> stop()
//!   | <---- stop result ---------- exit
//! ```
//!
//! The caller waits for readiness with a bounded timeout. A timeout is fatal:
//! the thread may still be stuck inside the engine and nothing about the
//! port or folder state can be trusted afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{Engine, EngineSettings, HeldSockets};
use crate::error::{HarnessError, Result};
use crate::shutdown::{Closeable, ShutdownGroup};

static ENGINE_SEQ: AtomicU64 = AtomicU64::new(1);

type StopReply = oneshot::Sender<anyhow::Result<()>>;

/// Start `engine` on its own thread and wait until it is ready.
pub async fn start_engine(
    engine: Box<dyn Engine>,
    settings: EngineSettings,
    sockets: HeldSockets,
    timeout: Duration,
) -> Result<EngineHandle> {
    let kind = engine.kind().to_string();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<StopReply>();

    info!(engine = %kind, timeout_ms = timeout.as_millis(), "Starting engine");
    let thread = std::thread::Builder::new()
        .name("cqlharness-engine".into())
        .spawn(move || run_engine(engine, settings, sockets, ready_tx, stop_rx))
        .map_err(|e| HarnessError::StartupFailed(format!("cannot spawn engine thread: {e}")))?;

    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => {
            info!(engine = %kind, "Engine ready");
            Ok(EngineHandle::new(kind, stop_tx, thread))
        }
        Ok(Ok(Err(e))) => {
            error!(engine = %kind, error = %format!("{e:#}"), "Engine failed to start");
            Err(HarnessError::StartupFailed(format!("{e:#}")))
        }
        Ok(Err(_)) => Err(HarnessError::StartupFailed(
            "engine thread exited before signalling readiness".into(),
        )),
        Err(_) => {
            error!(engine = %kind, timeout_ms = timeout.as_millis(), "Timeout starting engine");
            Err(HarnessError::StartupTimeout { timeout })
        }
    }
}

fn run_engine(
    mut engine: Box<dyn Engine>,
    settings: EngineSettings,
    mut sockets: HeldSockets,
    ready: oneshot::Sender<anyhow::Result<()>>,
    stop: mpsc::Receiver<StopReply>,
) {
    if settings.unsafe_mode {
        warn!("Starting unsafe embedded engine. Only use this for unit testing or development");
    }

    let outcome = engine
        .complete_setup(&settings, &mut sockets)
        .and_then(|()| {
            debug!(adopted = sockets.held_count(), "Engine setup complete");
            sockets.release_all();
            engine.activate()
        });
    if let Err(e) = &outcome {
        // Whatever setup or activation acquired before failing must go.
        debug!(engine = %engine.kind(), error = %format!("{e:#}"), "Engine start failed, stopping it");
        if let Err(e) = engine.stop() {
            warn!(error = %format!("{e:#}"), "Failed to stop engine after a failed start");
        }
    }
    let started = outcome.is_ok();

    if ready.send(outcome).is_err() {
        // Nobody is waiting any more: the caller timed out.
        warn!(engine = %engine.kind(), "Readiness signalled after the caller gave up");
        if started {
            if let Err(e) = engine.stop() {
                warn!(error = %format!("{e:#}"), "Failed to stop abandoned engine");
            }
        }
        return;
    }
    if !started {
        return;
    }

    match stop.recv() {
        Ok(reply) => {
            let result = engine.stop();
            let _ = reply.send(result);
        }
        Err(_) => {
            debug!(engine = %engine.kind(), "Engine handle dropped, stopping engine");
            if let Err(e) = engine.stop() {
                warn!(error = %format!("{e:#}"), "Failed to stop engine");
            }
        }
    }
}

/// Owner-side handle of a running engine thread.
///
/// Registered with the [`crate::shutdown::ShutdownRegistry`]; dropping the
/// handle without closing it still stops the engine.
pub struct EngineHandle {
    id: u64,
    kind: String,
    stop_tx: Mutex<Option<mpsc::Sender<StopReply>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EngineHandle {
    fn new(kind: String, stop_tx: mpsc::Sender<StopReply>, thread: JoinHandle<()>) -> Self {
        Self {
            id: ENGINE_SEQ.fetch_add(1, Ordering::Relaxed),
            kind,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns `true` once [`stop`](Self::stop) has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop the engine and join its thread. Later calls return `Ok(())`.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let Some(stop_tx) = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        info!(engine = %self.kind, "Calling stop on embedded engine");
        let (reply_tx, reply_rx) = oneshot::channel();
        let result = match stop_tx.send(reply_tx) {
            Ok(()) => reply_rx
                .await
                .unwrap_or_else(|_| Err(anyhow!("engine thread exited before reporting stop"))),
            Err(_) => Err(anyhow!("engine thread already exited")),
        };

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(engine = %self.kind, "Engine thread panicked");
            }
        }
        result
    }
}

#[async_trait]
impl Closeable for EngineHandle {
    fn resource_id(&self) -> String {
        format!("engine:{}:{}", self.kind, self.id)
    }

    fn group(&self) -> ShutdownGroup {
        ShutdownGroup::Engine
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::sample_settings;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        setup: AtomicUsize,
        activate: AtomicUsize,
        stop: AtomicUsize,
    }

    struct ScriptedEngine {
        calls: Arc<Calls>,
        activate_delay: Duration,
        fail_activate: bool,
    }

    impl ScriptedEngine {
        fn boxed(calls: &Arc<Calls>) -> Box<dyn Engine> {
            Box::new(Self {
                calls: Arc::clone(calls),
                activate_delay: Duration::ZERO,
                fail_activate: false,
            })
        }
    }

    impl Engine for ScriptedEngine {
        fn complete_setup(&mut self, _: &EngineSettings, _: &mut HeldSockets) -> anyhow::Result<()> {
            self.calls.setup.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn activate(&mut self) -> anyhow::Result<()> {
            std::thread::sleep(self.activate_delay);
            self.calls.activate.fetch_add(1, Ordering::SeqCst);
            if self.fail_activate {
                anyhow::bail!("storage service refused to start");
            }
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.calls.stop.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let calls = Arc::new(Calls::default());
        let handle = start_engine(
            ScriptedEngine::boxed(&calls),
            sample_settings(),
            HeldSockets::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(calls.setup.load(Ordering::SeqCst), 1);
        assert_eq!(calls.activate.load(Ordering::SeqCst), 1);
        assert!(!handle.is_stopped());

        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
        assert!(handle.is_stopped());
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activation_failure_is_reported() {
        let calls = Arc::new(Calls::default());
        let engine = Box::new(ScriptedEngine {
            calls: Arc::clone(&calls),
            activate_delay: Duration::ZERO,
            fail_activate: true,
        });
        let err = start_engine(engine, sample_settings(), HeldSockets::default(), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::StartupFailed(ref m) if m.contains("refused")));
        // The failed engine is stopped before the error reaches the caller.
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_activation_failure_still_stops_engine() {
        let calls = Arc::new(Calls::default());
        let engine = Box::new(ScriptedEngine {
            calls: Arc::clone(&calls),
            activate_delay: Duration::from_millis(200),
            fail_activate: true,
        });
        let err = start_engine(
            engine,
            sample_settings(),
            HeldSockets::default(),
            Duration::from_millis(20),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, HarnessError::StartupTimeout { .. }));

        for _ in 0..100 {
            if calls.stop.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.activate.load(Ordering::SeqCst), 1);
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let calls = Arc::new(Calls::default());
        let engine = Box::new(ScriptedEngine {
            calls: Arc::clone(&calls),
            activate_delay: Duration::from_millis(500),
            fail_activate: false,
        });
        let err = start_engine(
            engine,
            sample_settings(),
            HeldSockets::default(),
            Duration::from_millis(50),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, HarnessError::StartupTimeout { .. }));
        assert!(err.is_fatal());

        // The late engine notices nobody is waiting and stops itself.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_engine() {
        let calls = Arc::new(Calls::default());
        let handle = start_engine(
            ScriptedEngine::boxed(&calls),
            sample_settings(),
            HeldSockets::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        drop(handle);

        for _ in 0..50 {
            if calls.stop.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resource_id_is_unique() {
        let calls = Arc::new(Calls::default());
        let mut ids = Vec::new();
        for _ in 0..2 {
            let handle = start_engine(
                ScriptedEngine::boxed(&calls),
                sample_settings(),
                HeldSockets::default(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
            ids.push(handle.resource_id());
            handle.close().await.unwrap();
        }
        assert_ne!(ids[0], ids[1]);
        assert!(ids[0].starts_with("engine:scripted:"));
    }
}
