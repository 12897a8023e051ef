//! cqlharness Core - embedded CQL database lifecycle for tests
//!
//! Brings a single-process CQL database up once per test process, provisions
//! a keyspace in it, replays fixture scripts and hands out a ready session.
//!
//! # Building Blocks:
//! - [`LifecycleOrchestrator`] - once-per-process bring-up, idempotent re-entry
//! - [`PortAllocator`] - free ports with randomized probing and held sockets
//! - [`script`] - line-oriented statement tokenizer with `${variable}` templates
//! - [`ShutdownRegistry`] - ordered, at-most-once closing of sessions and engines
//!
//! The engine and the client session are collaborators supplied by the
//! caller through the [`Engine`]/[`EngineFactory`] and
//! [`Session`]/[`SessionFactory`] traits.

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod script;
pub mod session;
pub mod shutdown;

pub use config::{HarnessConfig, HarnessConfigBuilder, PortSetting, PortSettings, ScriptTemplate};
pub use engine::process::{ProcessEngine, ProcessEngineConfig};
pub use engine::{
    Engine, EngineFactory, EngineHandle, EngineSettings, HeldSockets, PortAllocator, PortMap,
    PortName, PortPolicy, PortReservation,
};
pub use error::{HarnessError, Result, ScriptError};
pub use metrics::{HarnessMetrics, MetricsSnapshot};
pub use orchestrator::{EngineMode, LifecycleOrchestrator};
pub use script::{tokenize, tokenize_raw, ResourceLocator, ScriptExecutor, TemplateVariables};
pub use session::{ConnectTarget, ExecutionOutcome, Session, SessionFactory};
pub use shutdown::{Closeable, ShutdownGroup, ShutdownRegistry, ShutdownReport};

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call repeatedly, e.g. from every test; only the first call
/// installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("cqlharness v{} tracing initialized", env!("CARGO_PKG_VERSION"));
    }
}
