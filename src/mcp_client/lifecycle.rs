//! Process Supervisor: start, stop and reconcile provider processes.
//!
//! Each provider has exactly one [`ProcessOwnership`] state. `stop` dispatches
//! on it; status queries combine it with the liveness probe. Spawn and probe
//! failures become a status value and are never propagated to the caller, so
//! every operation can be repeated until the registry converges.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::config::{ProviderConfig, ProviderRegistry, ProviderStatus, TransportKind};
use super::errors::McpError;
use super::probe::LivenessProbe;
use super::process::{self, TerminateOutcome};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Wait between spawning a connection provider and probing it.
    pub settle: Duration,
    /// Graceful-exit wait before a forced kill.
    pub shutdown_timeout: Duration,
    /// Per-probe timeout.
    pub probe_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

// ─── Ownership ───────────────────────────────────────────────────────────────

/// What the supervisor holds for a provider's process.
#[derive(Debug)]
pub enum ProcessOwnership {
    /// Nothing launched by this supervisor.
    Unowned,
    /// Launched in this run; the handle is held.
    OwnedHandle(Child),
    /// Launched in an earlier run; only the pid survived in the document.
    /// `command` is the launch command the pid must still belong to.
    RecordedPid { pid: u32, command: String },
}

impl ProcessOwnership {
    /// Pid of the tracked process, if any.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Unowned => None,
            Self::OwnedHandle(child) => child.id(),
            Self::RecordedPid { pid, .. } => Some(*pid),
        }
    }

    /// `None` when nothing is tracked, else whether the process is alive.
    fn is_alive(&mut self) -> Option<bool> {
        match self {
            Self::Unowned => None,
            Self::OwnedHandle(child) => Some(matches!(child.try_wait(), Ok(None))),
            Self::RecordedPid { pid, command } => Some(process::process_matches(*pid, command)),
        }
    }
}

/// Status line for one provider, as shown by listings.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusReport {
    pub name: String,
    pub description: String,
    pub transport: String,
    pub status: ProviderStatus,
    pub pid: Option<u32>,
    pub endpoint: Option<String>,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Owns the provider registry and the process table.
pub struct Supervisor {
    registry: ProviderRegistry,
    processes: HashMap<String, ProcessOwnership>,
    probe: Arc<dyn LivenessProbe>,
    settings: SupervisorSettings,
}

impl Supervisor {
    /// Build a supervisor over a loaded registry. Pids recorded by an earlier
    /// run become [`ProcessOwnership::RecordedPid`] when the process at that
    /// pid still runs the provider's launch command; other pids are dropped
    /// and cleared on the next status write.
    pub fn new(
        registry: ProviderRegistry,
        probe: Arc<dyn LivenessProbe>,
        settings: SupervisorSettings,
    ) -> Self {
        let processes = registry
            .iter()
            .filter_map(|c| {
                let pid = c.pid?;
                let command = c.command.clone().unwrap_or_default();
                if !process::process_matches(pid, &command) {
                    tracing::info!(
                        provider = %c.name,
                        pid,
                        "recorded pid no longer runs the provider command, ignoring it"
                    );
                    return None;
                }
                Some((c.name.clone(), ProcessOwnership::RecordedPid { pid, command }))
            })
            .collect();

        Self {
            registry,
            processes,
            probe,
            settings,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProviderRegistry {
        &mut self.registry
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Current ownership state for a provider.
    pub fn ownership(&self, name: &str) -> &ProcessOwnership {
        self.processes.get(name).unwrap_or(&ProcessOwnership::Unowned)
    }

    fn config(&self, name: &str) -> Result<ProviderConfig, McpError> {
        self.registry.get(name).cloned().ok_or_else(|| McpError::UnknownProvider {
            name: name.to_string(),
        })
    }

    async fn probe_config(&self, config: &ProviderConfig) -> bool {
        if config.transport != TransportKind::PersistentConnection {
            return false;
        }
        match config.health_url() {
            Some(url) => self.probe.is_reachable(&url, self.settings.probe_timeout).await,
            None => false,
        }
    }

    /// Write status and the tracked pid back into the registry, then persist.
    fn record(&mut self, name: &str, status: ProviderStatus) {
        let pid = self.ownership(name).pid();
        if let Some(config) = self.registry.get_mut(name) {
            config.status = status;
            config.pid = pid;
        }
        if let Err(e) = self.registry.save() {
            tracing::warn!(provider = name, error = %e, "failed to persist provider status");
        }
    }

    // ─── Start ───────────────────────────────────────────────────────────────

    /// Start a provider. Returns the resulting status.
    ///
    /// Only an unknown name is an error; spawn and probe failures yield
    /// [`ProviderStatus::Error`].
    pub async fn start(&mut self, name: &str) -> Result<ProviderStatus, McpError> {
        let config = self.config(name)?;

        let status = match config.transport {
            TransportKind::ChildProcess => self.start_child_process(&config),
            TransportKind::PersistentConnection => self.start_connection(&config).await,
        };

        tracing::info!(provider = name, status = %status, pid = ?self.ownership(name).pid(), "provider start");
        self.record(name, status);
        Ok(status)
    }

    fn start_child_process(&mut self, config: &ProviderConfig) -> ProviderStatus {
        let name = config.name.as_str();
        if self.process_alive(name) {
            return ProviderStatus::Running;
        }

        match spawn_process(config) {
            Ok((child, stderr)) => {
                if let Some(stderr) = stderr {
                    tokio::spawn(forward_stderr(name.to_string(), stderr));
                }
                self.processes.insert(name.to_string(), ProcessOwnership::OwnedHandle(child));
                ProviderStatus::Running
            }
            Err(e) => {
                tracing::error!(provider = name, error = %e, "provider spawn failed");
                ProviderStatus::Error
            }
        }
    }

    async fn start_connection(&mut self, config: &ProviderConfig) -> ProviderStatus {
        let name = config.name.as_str();

        if self.probe_config(config).await {
            tracing::debug!(provider = name, "already reachable, not spawning");
            return ProviderStatus::Running;
        }

        // A process from an earlier start is still attached: probe it again
        // instead of launching a second copy.
        if self.process_alive(name) {
            tokio::time::sleep(self.settings.settle).await;
            return if self.probe_config(config).await {
                ProviderStatus::Running
            } else {
                ProviderStatus::Error
            };
        }

        match self.launch_and_settle(config).await {
            Ok(()) => ProviderStatus::Running,
            Err(e) => {
                tracing::error!(provider = name, error = %e, "provider did not become reachable");
                ProviderStatus::Error
            }
        }
    }

    /// Spawn the launch command, wait the settle interval, then probe.
    ///
    /// On probe failure the process stays attached so it can be inspected
    /// or stopped later.
    async fn launch_and_settle(&mut self, config: &ProviderConfig) -> Result<(), McpError> {
        let name = config.name.as_str();
        let (child, stderr) = spawn_process(config)?;
        self.processes.insert(name.to_string(), ProcessOwnership::OwnedHandle(child));

        tokio::time::sleep(self.settings.settle).await;

        if self.probe_config(config).await {
            if let Some(stderr) = stderr {
                tokio::spawn(forward_stderr(name.to_string(), stderr));
            }
            return Ok(());
        }

        let exited = !self.process_alive(name);
        let reason = if exited {
            let stderr_ctx = read_stderr_on_failure(stderr).await;
            format!("process exited during settle{}", format_stderr_suffix(&stderr_ctx))
        } else {
            if let Some(stderr) = stderr {
                tokio::spawn(forward_stderr(name.to_string(), stderr));
            }
            format!(
                "no responder at {} after {}ms",
                config.health_url().unwrap_or_default(),
                self.settings.settle.as_millis()
            )
        };

        Err(McpError::ProviderUnreachable {
            name: name.to_string(),
            reason,
        })
    }

    fn process_alive(&mut self, name: &str) -> bool {
        self.processes
            .get_mut(name)
            .and_then(ProcessOwnership::is_alive)
            .unwrap_or(false)
    }

    // ─── Stop ────────────────────────────────────────────────────────────────

    /// Stop a provider, dispatching on its ownership state.
    pub async fn stop(&mut self, name: &str) -> Result<ProviderStatus, McpError> {
        let config = self.config(name)?;
        let ownership = self
            .processes
            .remove(name)
            .unwrap_or(ProcessOwnership::Unowned);

        let status = match ownership {
            ProcessOwnership::OwnedHandle(mut child) => {
                shutdown_child(name, &mut child, self.settings.shutdown_timeout).await;
                ProviderStatus::Stopped
            }
            ProcessOwnership::RecordedPid { pid, command } => {
                let outcome = if process::process_matches(pid, &command) {
                    process::terminate_pid(pid, self.settings.shutdown_timeout).await
                } else {
                    TerminateOutcome::AlreadyGone
                };
                if outcome == TerminateOutcome::AlreadyGone {
                    tracing::info!(provider = name, pid, "recorded process already gone");
                }
                ProviderStatus::Stopped
            }
            // Only connection providers are probed; a stdio provider with
            // nothing tracked is simply stopped.
            ProcessOwnership::Unowned => {
                if self.probe_config(&config).await {
                    tracing::warn!(
                        provider = name,
                        "provider still reachable but was not launched here, cannot stop it"
                    );
                    ProviderStatus::Unknown
                } else {
                    ProviderStatus::Stopped
                }
            }
        };

        tracing::info!(provider = name, status = %status, "provider stop");
        self.record(name, status);
        Ok(status)
    }

    /// Stop then start.
    pub async fn restart(&mut self, name: &str) -> Result<ProviderStatus, McpError> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Start every provider with `auto_start` set, in registry order.
    pub async fn start_all(&mut self) -> Vec<(String, ProviderStatus)> {
        let mut results = Vec::new();
        for name in self.registry.names() {
            let auto_start = self.registry.get(&name).is_some_and(|c| c.auto_start);
            if !auto_start {
                continue;
            }
            let status = self.start(&name).await.unwrap_or(ProviderStatus::Error);
            results.push((name, status));
        }
        results
    }

    /// Stop every registered provider, including ones known only by pid.
    pub async fn stop_all(&mut self) -> Vec<(String, ProviderStatus)> {
        let mut results = Vec::new();
        for name in self.registry.names() {
            let status = self.stop(&name).await.unwrap_or(ProviderStatus::Unknown);
            results.push((name, status));
        }
        results
    }

    /// Stop a provider and delete it from the registry.
    pub async fn remove(&mut self, name: &str) -> Result<ProviderConfig, McpError> {
        self.stop(name).await?;
        self.processes.remove(name);
        self.registry
            .remove_entry(name)?
            .ok_or_else(|| McpError::UnknownProvider {
                name: name.to_string(),
            })
    }

    // ─── Status ──────────────────────────────────────────────────────────────

    /// Recompute a provider's status from the probe and the process table.
    pub async fn status(&mut self, name: &str) -> Result<ProviderStatus, McpError> {
        let config = self.config(name)?;

        let process_alive = self.processes.get_mut(name).and_then(ProcessOwnership::is_alive);
        if process_alive == Some(false) {
            tracing::debug!(provider = name, "tracked process has exited");
            self.processes.remove(name);
        }

        let status = match config.transport {
            TransportKind::PersistentConnection => {
                if self.probe_config(&config).await {
                    ProviderStatus::Running
                } else if process_alive == Some(true) {
                    ProviderStatus::Error
                } else {
                    settled_status(config.status)
                }
            }
            TransportKind::ChildProcess => match process_alive {
                Some(true) => ProviderStatus::Running,
                _ => settled_status(config.status),
            },
        };

        if status != config.status || process_alive == Some(false) {
            self.record(name, status);
        }
        Ok(status)
    }

    /// Live status for every provider.
    pub async fn status_report(&mut self) -> Vec<ProviderStatusReport> {
        let mut report = Vec::new();
        for name in self.registry.names() {
            let Ok(status) = self.status(&name).await else {
                continue;
            };
            let Some(config) = self.registry.get(&name) else {
                continue;
            };
            report.push(ProviderStatusReport {
                name: name.clone(),
                description: config.description.clone(),
                transport: config.transport.to_string(),
                status,
                pid: self.ownership(&name).pid(),
                endpoint: config.endpoint(),
                checked_at: chrono::Utc::now(),
            });
        }
        report
    }

    /// Providers whose recomputed status is Running.
    pub async fn live_providers(&mut self) -> Vec<ProviderConfig> {
        let mut live = Vec::new();
        for name in self.registry.names() {
            if let Ok(ProviderStatus::Running) = self.status(&name).await {
                if let Some(config) = self.registry.get(&name) {
                    live.push(config.clone());
                }
            }
        }
        live
    }
}

/// With no live evidence either way, a previous Error stays visible;
/// anything else settles to Stopped.
fn settled_status(previous: ProviderStatus) -> ProviderStatus {
    match previous {
        ProviderStatus::Error => ProviderStatus::Error,
        _ => ProviderStatus::Stopped,
    }
}

// ─── Process Helpers ─────────────────────────────────────────────────────────

/// Spawn a provider's launch command with its working directory and
/// environment overrides. Stdin is held open; stdout is discarded.
fn spawn_process(config: &ProviderConfig) -> Result<(Child, Option<ChildStderr>), McpError> {
    let name = config.name.as_str();
    let command_line = config.command.as_deref().unwrap_or_default();
    let mut parts = command_line.split_whitespace();
    let program = parts.next().ok_or_else(|| McpError::SpawnFailed {
        name: name.to_string(),
        reason: "no launch command configured".into(),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(parts);
    cmd.envs(&config.env_vars);
    if let Some(dir) = config.working_directory.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{command_line}: {e}"),
    })?;
    let stderr = child.stderr.take();

    tracing::info!(provider = name, pid = ?child.id(), command = command_line, "provider process spawned");
    Ok((child, stderr))
}

/// Graceful terminate, bounded wait, then forced kill.
async fn shutdown_child(name: &str, child: &mut Child, timeout: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(provider = name, status = %status, "process had already exited");
        return;
    }

    if let Some(pid) = child.id() {
        process::signal_terminate(pid);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(provider = name, status = %status, "process exited");
        }
        _ => {
            tracing::warn!(provider = name, "process did not exit in time, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(provider = name, error = %e, "failed to kill provider process");
            }
        }
    }
}

/// Forward a provider's stderr to the log, one line per event.
async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(provider = %name, "{line}");
    }
}

/// Read whatever a failed process wrote to stderr, bounded in time and size.
async fn read_stderr_on_failure(stderr_handle: Option<ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > 2000 {
                let mut cut = 2000;
                while !buf.is_char_boundary(cut) {
                    cut -= 1;
                }
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
