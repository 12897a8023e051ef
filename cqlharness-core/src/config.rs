//! Harness configuration
//!
//! A [`HarnessConfig`] is an immutable value once built. It comes from
//! [`HarnessConfig::default`], the fluent [`HarnessConfigBuilder`] or a JSON
//! file; in every case keys that were not given resolve to the documented
//! defaults below, so nothing is left unset.
//!
//! | key                     | default                                      |
//! |-------------------------|----------------------------------------------|
//! | addresses               | `localhost` (broadcast addresses empty)      |
//! | cluster name            | `Harness Embedded Cluster`                   |
//! | folders                 | `target/cassandra_embedded/<kind>`           |
//! | clean data at startup   | `true`                                       |
//! | ports                   | `auto`                                       |
//! | keyspace                | `harness_embedded`, non durable              |
//! | concurrent reads/writes | `32` / `32`                                  |
//! | startup timeout         | 30 s                                         |

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{EngineSettings, PortMap, PortName};
use crate::error::{HarnessError, Result};
use crate::script::TemplateVariables;

pub const DEFAULT_ADDRESS: &str = "localhost";
pub const DEFAULT_CLUSTER_NAME: &str = "Harness Embedded Cluster";
pub const DEFAULT_KEYSPACE_NAME: &str = "harness_embedded";
pub const DEFAULT_FOLDER_ROOT: &str = "target/cassandra_embedded";
pub const DEFAULT_CONCURRENCY: u32 = 32;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
/// Token count of a regular node; unsafe mode runs with a single token.
pub const DEFAULT_NUM_TOKENS: u32 = 256;

/// Environment variable naming an externally managed instance.
pub const HOST_ENV: &str = "CQLHARNESS_HOST";

const KEYSPACE_NAME_PATTERN: &str = r"^[a-zA-Z][_a-zA-Z0-9]{0,31}$";

fn default_folder(kind: &str) -> PathBuf {
    Path::new(DEFAULT_FOLDER_ROOT).join(kind)
}

/// Folders the harness owns and may create or wipe.
pub fn default_test_folders() -> [PathBuf; 6] {
    [
        default_folder("data"),
        default_folder("commitlog"),
        default_folder("saved_caches"),
        default_folder("hints"),
        default_folder("cdc_raw"),
        default_folder("triggers"),
    ]
}

/// Reject blank names and names the engine would not accept as a keyspace.
pub fn validate_keyspace_name(name: &str) -> Result<()> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if name.trim().is_empty() {
        return Err(HarnessError::config("Keyspace name must not be blank"));
    }
    let pattern = PATTERN
        .get_or_init(|| Regex::new(KEYSPACE_NAME_PATTERN).expect("keyspace pattern is valid"));
    if !pattern.is_match(name) {
        return Err(HarnessError::config(format!(
            "The provided keyspace name '{name}' should match the regular expression '{KEYSPACE_NAME_PATTERN}'"
        )));
    }
    Ok(())
}

/// Requested value of one engine port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSetting {
    /// Let the allocator pick a free port.
    #[default]
    Auto,
    /// Caller-supplied value, checked when the port is resolved.
    Fixed(i64),
}

impl PortSetting {
    pub fn is_explicit(self) -> bool {
        matches!(self, Self::Fixed(_))
    }

    /// The explicit port, or `None` for [`PortSetting::Auto`].
    ///
    /// Fails when the value is not a positive TCP port number.
    pub fn resolve(self, name: PortName) -> Result<Option<u16>> {
        match self {
            Self::Auto => Ok(None),
            Self::Fixed(value) => match u16::try_from(value) {
                Ok(port) if port > 0 => Ok(Some(port)),
                _ => Err(HarnessError::config(format!(
                    "The {name} port should be a positive integer up to 65535, got '{value}'"
                ))),
            },
        }
    }
}

impl fmt::Display for PortSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(value) => write!(f, "{value}"),
        }
    }
}

impl From<u16> for PortSetting {
    fn from(port: u16) -> Self {
        Self::Fixed(i64::from(port))
    }
}

impl Serialize for PortSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Fixed(value) => serializer.serialize_i64(*value),
        }
    }
}

struct PortSettingVisitor;

impl<'de> Visitor<'de> for PortSettingVisitor {
    type Value = PortSetting;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer port or \"auto\"")
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<PortSetting, E> {
        Ok(PortSetting::Fixed(value))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<PortSetting, E> {
        i64::try_from(value)
            .map(PortSetting::Fixed)
            .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(value), &self))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<PortSetting, E> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("auto") {
            return Ok(PortSetting::Auto);
        }
        value
            .parse::<i64>()
            .map(PortSetting::Fixed)
            .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<PortSetting, E> {
        Ok(PortSetting::Auto)
    }
}

impl<'de> Deserialize<'de> for PortSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(PortSettingVisitor)
    }
}

/// Requested values of the five engine ports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPortSettings")]
pub struct PortSettings {
    pub cql: PortSetting,
    pub storage: PortSetting,
    pub storage_ssl: PortSetting,
    pub jmx: PortSetting,
    pub rpc: PortSetting,
}

/// Untyped port values as read from a config file.
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawPortSettings {
    cql: Option<serde_json::Value>,
    storage: Option<serde_json::Value>,
    storage_ssl: Option<serde_json::Value>,
    jmx: Option<serde_json::Value>,
    rpc: Option<serde_json::Value>,
}

impl TryFrom<RawPortSettings> for PortSettings {
    type Error = String;

    fn try_from(raw: RawPortSettings) -> std::result::Result<Self, Self::Error> {
        let mut settings = PortSettings::default();
        let values = [
            (PortName::Cql, raw.cql),
            (PortName::Storage, raw.storage),
            (PortName::StorageSsl, raw.storage_ssl),
            (PortName::Jmx, raw.jmx),
            (PortName::Rpc, raw.rpc),
        ];
        for (name, value) in values {
            let Some(value) = value else { continue };
            let setting = PortSetting::deserialize(value)
                .map_err(|e| format!("invalid value for the {name} port: {e}"))?;
            settings.set(name, setting);
        }
        Ok(settings)
    }
}

impl PortSettings {
    pub fn get(&self, name: PortName) -> PortSetting {
        match name {
            PortName::Cql => self.cql,
            PortName::Storage => self.storage,
            PortName::StorageSsl => self.storage_ssl,
            PortName::Jmx => self.jmx,
            PortName::Rpc => self.rpc,
        }
    }

    pub fn set(&mut self, name: PortName, setting: PortSetting) {
        let slot = match name {
            PortName::Cql => &mut self.cql,
            PortName::Storage => &mut self.storage,
            PortName::StorageSsl => &mut self.storage_ssl,
            PortName::Jmx => &mut self.jmx,
            PortName::Rpc => &mut self.rpc,
        };
        *slot = setting;
    }

    /// Ports the caller pinned, in bring-up order.
    pub fn explicit(&self) -> impl Iterator<Item = (PortName, PortSetting)> + '_ {
        PortName::ALL
            .into_iter()
            .map(|name| (name, self.get(name)))
            .filter(|(_, setting)| setting.is_explicit())
    }
}

/// A script replayed with variable substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTemplate {
    pub location: String,
    #[serde(default)]
    pub values: TemplateVariables,
}

/// Complete harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub cluster_name: String,
    pub listen_address: String,
    pub rpc_address: String,
    pub broadcast_address: String,
    pub broadcast_rpc_address: String,

    pub data_folder: PathBuf,
    pub commit_log_folder: PathBuf,
    pub saved_caches_folder: PathBuf,
    pub hints_folder: PathBuf,
    pub cdc_raw_folder: PathBuf,
    pub triggers_folder: PathBuf,
    /// Empty the data, commit log and saved caches folders before starting.
    pub clean_data_at_startup: bool,

    pub ports: PortSettings,

    pub keyspace_name: String,
    pub durable_writes: bool,

    pub concurrent_reads: u32,
    pub concurrent_writes: u32,

    /// Plain scripts, replayed in order before the templates.
    pub scripts: Vec<String>,
    pub script_templates: Vec<ScriptTemplate>,
    /// Folders searched for relative script locations.
    pub script_roots: Vec<PathBuf>,

    pub unsafe_mode: bool,
    pub startup_timeout_ms: u64,

    /// Connect to this host instead of starting an embedded engine.
    pub external_host: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.into(),
            listen_address: DEFAULT_ADDRESS.into(),
            rpc_address: DEFAULT_ADDRESS.into(),
            broadcast_address: String::new(),
            broadcast_rpc_address: String::new(),
            data_folder: default_folder("data"),
            commit_log_folder: default_folder("commitlog"),
            saved_caches_folder: default_folder("saved_caches"),
            hints_folder: default_folder("hints"),
            cdc_raw_folder: default_folder("cdc_raw"),
            triggers_folder: default_folder("triggers"),
            clean_data_at_startup: true,
            ports: PortSettings::default(),
            keyspace_name: DEFAULT_KEYSPACE_NAME.into(),
            durable_writes: false,
            concurrent_reads: DEFAULT_CONCURRENCY,
            concurrent_writes: DEFAULT_CONCURRENCY,
            scripts: Vec::new(),
            script_templates: Vec::new(),
            script_roots: Vec::new(),
            unsafe_mode: false,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            external_host: None,
        }
    }
}

impl HarnessConfig {
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| HarnessError::config(format!("Invalid harness configuration: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), "Loaded harness configuration");
        Ok(config)
    }

    /// Apply `CQLHARNESS_HOST` when it is set to a non-blank value.
    pub fn with_env_overrides(self) -> Self {
        let host = std::env::var(HOST_ENV).ok();
        self.with_external_host_override(host)
    }

    fn with_external_host_override(mut self, host: Option<String>) -> Self {
        if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
            info!(host = %host, "Using externally managed instance from {HOST_ENV}");
            self.external_host = Some(host.trim().to_string());
        }
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// The six engine folders with their config key names.
    pub fn folders(&self) -> [(&'static str, &Path); 6] {
        [
            ("data_folder", self.data_folder.as_path()),
            ("commit_log_folder", self.commit_log_folder.as_path()),
            ("saved_caches_folder", self.saved_caches_folder.as_path()),
            ("hints_folder", self.hints_folder.as_path()),
            ("cdc_raw_folder", self.cdc_raw_folder.as_path()),
            ("triggers_folder", self.triggers_folder.as_path()),
        ]
    }

    /// The folders holding engine state, wiped by `clean_data_at_startup`.
    pub fn physical_data_folders(&self) -> [&Path; 3] {
        [
            self.data_folder.as_path(),
            self.commit_log_folder.as_path(),
            self.saved_caches_folder.as_path(),
        ]
    }

    /// `true` for the default folders the harness creates on its own.
    pub fn is_test_managed(folder: &Path) -> bool {
        default_test_folders().iter().any(|f| f == folder)
    }

    /// Assemble the settings handed to the engine once ports are known.
    pub fn engine_settings(&self, ports: PortMap) -> EngineSettings {
        EngineSettings {
            cluster_name: self.cluster_name.clone(),
            listen_address: self.listen_address.clone(),
            rpc_address: self.rpc_address.clone(),
            broadcast_address: self.broadcast_address.clone(),
            broadcast_rpc_address: self.broadcast_rpc_address.clone(),
            ports,
            data_folder: self.data_folder.clone(),
            commit_log_folder: self.commit_log_folder.clone(),
            saved_caches_folder: self.saved_caches_folder.clone(),
            hints_folder: self.hints_folder.clone(),
            cdc_raw_folder: self.cdc_raw_folder.clone(),
            triggers_folder: self.triggers_folder.clone(),
            concurrent_reads: self.concurrent_reads,
            concurrent_writes: self.concurrent_writes,
            unsafe_mode: self.unsafe_mode,
            num_tokens: if self.unsafe_mode { 1 } else { DEFAULT_NUM_TOKENS },
        }
    }
}

/// Fluent construction of a [`HarnessConfig`].
///
/// Unset values fall back to the defaults in [`HarnessConfig::build`]. Input
/// errors are collected and reported by `build()` so the chain stays fluent.
#[derive(Debug, Default)]
pub struct HarnessConfigBuilder {
    cluster_name: Option<String>,
    listen_address: Option<String>,
    rpc_address: Option<String>,
    broadcast_address: Option<String>,
    broadcast_rpc_address: Option<String>,
    data_folder: Option<PathBuf>,
    commit_log_folder: Option<PathBuf>,
    saved_caches_folder: Option<PathBuf>,
    hints_folder: Option<PathBuf>,
    cdc_raw_folder: Option<PathBuf>,
    triggers_folder: Option<PathBuf>,
    clean_data_at_startup: Option<bool>,
    ports: PortSettings,
    keyspace_name: Option<String>,
    durable_writes: Option<bool>,
    concurrent_reads: Option<u32>,
    concurrent_writes: Option<u32>,
    scripts: Vec<String>,
    script_templates: Vec<ScriptTemplate>,
    script_roots: Vec<PathBuf>,
    unsafe_mode: Option<bool>,
    startup_timeout: Option<Duration>,
    external_host: Option<String>,
    errors: Vec<String>,
}

impl HarnessConfigBuilder {
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    pub fn listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = Some(address.into());
        self
    }

    pub fn rpc_address(mut self, address: impl Into<String>) -> Self {
        self.rpc_address = Some(address.into());
        self
    }

    pub fn broadcast_address(mut self, address: impl Into<String>) -> Self {
        self.broadcast_address = Some(address.into());
        self
    }

    pub fn broadcast_rpc_address(mut self, address: impl Into<String>) -> Self {
        self.broadcast_rpc_address = Some(address.into());
        self
    }

    pub fn data_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.data_folder = Some(folder.into());
        self
    }

    pub fn commit_log_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.commit_log_folder = Some(folder.into());
        self
    }

    pub fn saved_caches_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.saved_caches_folder = Some(folder.into());
        self
    }

    pub fn hints_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.hints_folder = Some(folder.into());
        self
    }

    pub fn cdc_raw_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.cdc_raw_folder = Some(folder.into());
        self
    }

    pub fn triggers_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.triggers_folder = Some(folder.into());
        self
    }

    /// Put every engine folder under `root`.
    pub fn folders_under(self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.data_folder(root.join("data"))
            .commit_log_folder(root.join("commitlog"))
            .saved_caches_folder(root.join("saved_caches"))
            .hints_folder(root.join("hints"))
            .cdc_raw_folder(root.join("cdc_raw"))
            .triggers_folder(root.join("triggers"))
    }

    pub fn clean_data_at_startup(mut self, clean: bool) -> Self {
        self.clean_data_at_startup = Some(clean);
        self
    }

    pub fn port(mut self, name: PortName, port: impl Into<PortSetting>) -> Self {
        self.ports.set(name, port.into());
        self
    }

    pub fn cql_port(self, port: u16) -> Self {
        self.port(PortName::Cql, port)
    }

    pub fn jmx_port(self, port: u16) -> Self {
        self.port(PortName::Jmx, port)
    }

    pub fn keyspace_name(mut self, name: impl Into<String>) -> Self {
        self.keyspace_name = Some(name.into());
        self
    }

    pub fn durable_writes(mut self, durable: bool) -> Self {
        self.durable_writes = Some(durable);
        self
    }

    pub fn concurrent_reads(mut self, reads: u32) -> Self {
        self.concurrent_reads = Some(reads);
        self
    }

    pub fn concurrent_writes(mut self, writes: u32) -> Self {
        self.concurrent_writes = Some(writes);
        self
    }

    /// Add a plain script, replayed without variable substitution.
    pub fn with_script(mut self, location: impl Into<String>) -> Self {
        let location = location.into();
        if location.trim().is_empty() {
            self.errors.push("Script location should not be blank".into());
        } else {
            self.scripts.push(location);
        }
        self
    }

    /// Add a script replayed with `values` substituted into its placeholders.
    pub fn with_script_template(
        mut self,
        location: impl Into<String>,
        values: TemplateVariables,
    ) -> Self {
        let location = location.into();
        if location.trim().is_empty() {
            self.errors
                .push("Script template location should not be blank".into());
        } else {
            self.script_templates.push(ScriptTemplate { location, values });
        }
        self
    }

    pub fn script_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.script_roots.push(root.into());
        self
    }

    pub fn unsafe_mode(mut self, unsafe_mode: bool) -> Self {
        self.unsafe_mode = Some(unsafe_mode);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn external_host(mut self, host: impl Into<String>) -> Self {
        self.external_host = Some(host.into());
        self
    }

    /// Merge the given values with the defaults.
    pub fn build(self) -> Result<HarnessConfig> {
        if !self.errors.is_empty() {
            return Err(HarnessError::config(self.errors.join("; ")));
        }
        if self.concurrent_reads == Some(0) || self.concurrent_writes == Some(0) {
            return Err(HarnessError::config(
                "Concurrent reads and writes should be greater than zero",
            ));
        }

        let defaults = HarnessConfig::default();
        Ok(HarnessConfig {
            cluster_name: self.cluster_name.unwrap_or(defaults.cluster_name),
            listen_address: self.listen_address.unwrap_or(defaults.listen_address),
            rpc_address: self.rpc_address.unwrap_or(defaults.rpc_address),
            broadcast_address: self.broadcast_address.unwrap_or(defaults.broadcast_address),
            broadcast_rpc_address: self
                .broadcast_rpc_address
                .unwrap_or(defaults.broadcast_rpc_address),
            data_folder: self.data_folder.unwrap_or(defaults.data_folder),
            commit_log_folder: self.commit_log_folder.unwrap_or(defaults.commit_log_folder),
            saved_caches_folder: self
                .saved_caches_folder
                .unwrap_or(defaults.saved_caches_folder),
            hints_folder: self.hints_folder.unwrap_or(defaults.hints_folder),
            cdc_raw_folder: self.cdc_raw_folder.unwrap_or(defaults.cdc_raw_folder),
            triggers_folder: self.triggers_folder.unwrap_or(defaults.triggers_folder),
            clean_data_at_startup: self
                .clean_data_at_startup
                .unwrap_or(defaults.clean_data_at_startup),
            ports: self.ports,
            keyspace_name: self.keyspace_name.unwrap_or(defaults.keyspace_name),
            durable_writes: self.durable_writes.unwrap_or(defaults.durable_writes),
            concurrent_reads: self.concurrent_reads.unwrap_or(defaults.concurrent_reads),
            concurrent_writes: self.concurrent_writes.unwrap_or(defaults.concurrent_writes),
            scripts: self.scripts,
            script_templates: self.script_templates,
            script_roots: self.script_roots,
            unsafe_mode: self.unsafe_mode.unwrap_or(defaults.unsafe_mode),
            startup_timeout_ms: self
                .startup_timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(defaults.startup_timeout_ms),
            external_host: self.external_host.or(defaults.external_host),
        })
    }
}
