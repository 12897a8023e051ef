//! Engine module - the embedded database process and its surroundings
//!
//! The database engine itself is opaque. The harness only needs three
//! lifecycle calls from it ([`Engine`]) and takes care of everything around
//! them: ports, data folders, the dedicated worker thread and readiness.

pub mod folders;
pub mod ports;
pub mod probe;
pub mod process;
pub mod worker;

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;

pub use ports::{PortAllocator, PortMap, PortName, PortPolicy, PortReservation};
pub use worker::EngineHandle;

/// Everything an engine needs to know to configure itself.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSettings {
    pub cluster_name: String,
    pub listen_address: String,
    pub rpc_address: String,
    pub broadcast_address: String,
    pub broadcast_rpc_address: String,
    pub ports: PortMap,
    pub data_folder: PathBuf,
    pub commit_log_folder: PathBuf,
    pub saved_caches_folder: PathBuf,
    pub hints_folder: PathBuf,
    pub cdc_raw_folder: PathBuf,
    pub triggers_folder: PathBuf,
    pub concurrent_reads: u32,
    pub concurrent_writes: u32,
    /// Skip durability safeguards; only meant for tests.
    pub unsafe_mode: bool,
    pub num_tokens: u32,
}

impl EngineSettings {
    /// Port bound to `name`, if resolved.
    pub fn port(&self, name: PortName) -> Option<u16> {
        self.ports.get(&name).copied()
    }

    /// Flatten the settings into `CQLHARNESS_*` environment variables.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("CQLHARNESS_CLUSTER_NAME".into(), self.cluster_name.clone());
        env.insert("CQLHARNESS_LISTEN_ADDRESS".into(), self.listen_address.clone());
        env.insert("CQLHARNESS_RPC_ADDRESS".into(), self.rpc_address.clone());
        env.insert(
            "CQLHARNESS_BROADCAST_ADDRESS".into(),
            self.broadcast_address.clone(),
        );
        env.insert(
            "CQLHARNESS_BROADCAST_RPC_ADDRESS".into(),
            self.broadcast_rpc_address.clone(),
        );
        for (name, port) in &self.ports {
            env.insert(
                format!("CQLHARNESS_{}_PORT", name.to_string().to_uppercase()),
                port.to_string(),
            );
        }
        let folders = [
            ("DATA", &self.data_folder),
            ("COMMITLOG", &self.commit_log_folder),
            ("SAVED_CACHES", &self.saved_caches_folder),
            ("HINTS", &self.hints_folder),
            ("CDC_RAW", &self.cdc_raw_folder),
            ("TRIGGERS", &self.triggers_folder),
        ];
        for (key, folder) in folders {
            env.insert(
                format!("CQLHARNESS_{key}_FOLDER"),
                folder.display().to_string(),
            );
        }
        env.insert(
            "CQLHARNESS_CONCURRENT_READS".into(),
            self.concurrent_reads.to_string(),
        );
        env.insert(
            "CQLHARNESS_CONCURRENT_WRITES".into(),
            self.concurrent_writes.to_string(),
        );
        env.insert("CQLHARNESS_NUM_TOKENS".into(), self.num_tokens.to_string());
        env
    }
}

/// Listening sockets still held by the harness when the engine is set up.
///
/// An engine able to adopt an already bound socket takes it from here, which
/// closes the window between probing a port and binding it. Whatever is left
/// after [`Engine::complete_setup`] is released before [`Engine::activate`].
#[derive(Debug, Default)]
pub struct HeldSockets {
    reservations: Vec<PortReservation>,
}

impl HeldSockets {
    pub fn new(reservations: Vec<PortReservation>) -> Self {
        Self { reservations }
    }

    /// Take ownership of the listener held for `name`.
    pub fn take(&mut self, name: PortName) -> Option<TcpListener> {
        self.reservations
            .iter_mut()
            .find(|r| r.name() == name)
            .and_then(PortReservation::take_listener)
    }

    /// Number of listeners still held.
    pub fn held_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.is_held()).count()
    }

    /// Close every listener nobody adopted.
    pub fn release_all(&mut self) {
        for reservation in &mut self.reservations {
            reservation.release();
        }
    }
}

/// Lifecycle calls of the embedded database engine.
///
/// All three calls run on the engine's dedicated worker thread, never on the
/// caller's thread.
///
/// # Contract:
/// - `complete_setup()` applies settings; it may adopt held sockets
/// - `activate()` blocks until the engine accepts client connections
/// - `stop()` is called at most once, after a successful activation
pub trait Engine: Send {
    fn complete_setup(&mut self, settings: &EngineSettings, sockets: &mut HeldSockets)
        -> Result<()>;

    fn activate(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Short identifier used in logs.
    fn kind(&self) -> &str;
}

/// Creates a fresh engine for a bring-up.
pub trait EngineFactory: Send + Sync {
    fn create(&self, settings: &EngineSettings) -> Result<Box<dyn Engine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EngineSettings) -> Result<Box<dyn Engine>> + Send + Sync,
{
    fn create(&self, settings: &EngineSettings) -> Result<Box<dyn Engine>> {
        self(settings)
    }
}
