//! External Server Process Engine
//!
//! Runs the database as a child process. The resolved settings are exported
//! to the child as `CQLHARNESS_*` environment variables (see
//! [`EngineSettings::to_env`]); a launcher script is expected to translate
//! them into the server's own configuration.
//!
//! Activation spawns the child and blocks until its native (CQL) port accepts
//! connections, or fails as soon as the child exits.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::probe::{is_listening, DEFAULT_PROBE_TIMEOUT};
use super::{Engine, EngineSettings, HeldSockets, PortName};

/// Launch configuration of a [`ProcessEngine`].
#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Upper bound for the child to open its CQL port.
    pub ready_timeout: Duration,
    /// Interval between two readiness probes.
    pub poll_interval: Duration,
    /// Time the child gets to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
}

impl ProcessEngineConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            ready_timeout: Duration::from_secs(25),
            poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(10),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// An [`Engine`] backed by an external server binary.
pub struct ProcessEngine {
    config: ProcessEngineConfig,
    env: Vec<(String, String)>,
    ready_target: Option<(String, u16)>,
    child: Option<Child>,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self {
            config,
            env: Vec::new(),
            ready_target: None,
            child: None,
        }
    }

    /// OS process id of the running child.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Kill and reap a child that never became ready.
    fn kill_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        warn!(pid = child.id(), "Killing engine process that failed to start");
        if let Err(e) = child.kill() {
            debug!(error = %e, "Engine process already gone");
        }
        if let Err(e) = child.wait() {
            warn!(error = %e, "Failed to reap engine process");
        }
    }

    fn wait_until_ready(&mut self) -> Result<()> {
        let Some((host, port)) = self.ready_target.clone() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait().context("Failed to poll engine process")? {
                    self.child = None;
                    bail!("engine process exited before becoming ready ({status})");
                }
            }
            if is_listening(&host, port, DEFAULT_PROBE_TIMEOUT) {
                debug!(host = %host, port, "Engine accepts native connections");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "engine process did not open {host}:{port} within {:?}",
                    self.config.ready_timeout
                );
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }
}

impl Engine for ProcessEngine {
    fn complete_setup(&mut self, settings: &EngineSettings, sockets: &mut HeldSockets) -> Result<()> {
        // A separate process cannot adopt our listeners; they are released by
        // the worker right after this call.
        debug!(held = sockets.held_count(), "External process engine leaves held ports");
        self.env = settings.to_env().into_iter().collect();
        self.ready_target = settings
            .port(PortName::Cql)
            .map(|port| (settings.rpc_address.clone(), port));
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if let Some(dir) = &self.config.workdir {
            cmd.current_dir(dir);
        }

        info!(program = %self.config.program.display(), "Spawning engine process");
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.program.display()))?;
        self.child = Some(child);
        if let Err(e) = self.wait_until_ready() {
            self.kill_child();
            return Err(e);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        let pid = Pid::from_raw(child.id() as i32);
        kill(pid, Signal::SIGTERM).context("Failed to signal engine process")?;

        let deadline = Instant::now() + self.config.stop_grace;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                info!(%status, "Engine process exited");
                return Ok(());
            }
            std::thread::sleep(self.config.poll_interval);
        }

        warn!(pid = child.id(), "Engine process ignored SIGTERM, killing it");
        child.kill().context("Failed to kill engine process")?;
        child.wait()?;
        Ok(())
    }

    fn kind(&self) -> &str {
        "process"
    }
}
