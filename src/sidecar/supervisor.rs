//! Lifecycle facade over provisioning, process control, health and API calls.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::sidecar::client::{ApiClient, Method, NODE_INFO_PATH, NodeInfo};
use crate::sidecar::config::SupervisorConfig;
use crate::sidecar::error::{HealthError, Result, SupervisorError};
use crate::sidecar::health::{HealthMonitor, HealthState};
use crate::sidecar::process::{LogSink, ProcessController, ProcessHandle, TracingLogSink};
use crate::sidecar::provisioner::{BinaryArtifact, BinaryProvisioner};

/// What `start` does with the process when its health wait is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Keep the process tracked in `Starting`; the caller decides later.
    #[default]
    LeaveRunning,
    /// Terminate the process and return to `Stopped`.
    Terminate,
}

/// Snapshot returned by [`Supervisor::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarStatus {
    /// Whether the tracked process is alive.
    pub alive: bool,
    /// Whether a probe succeeded. Only probed when alive.
    pub healthy: bool,
}

/// Supervises exactly one sidecar process.
///
/// Lifecycle: `Stopped -> Starting -> Running(Healthy | Unhealthy | Unknown)
/// -> Stopped`. Lifecycle methods take `&mut self`; share a supervisor
/// behind a mutex if several tasks need it.
pub struct Supervisor {
    config: SupervisorConfig,
    provisioner: BinaryProvisioner,
    process: ProcessController,
    health: HealthMonitor,
    api: ApiClient,
    state: HealthState,
}

impl Supervisor {
    /// Create a supervisor that logs child output through `tracing`.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_log_sink(config, Arc::new(TracingLogSink))
    }

    /// Create a supervisor with a custom sink for child output.
    pub fn with_log_sink(config: SupervisorConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            provisioner: BinaryProvisioner::new(&config),
            process: ProcessController::new(sink),
            health: HealthMonitor::new(&config),
            api: ApiClient::new(&config),
            state: HealthState::Stopped,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Current lifecycle state.
    ///
    /// Checks liveness first: a process that exited on its own reads as
    /// `Stopped` whatever its last probe said.
    pub fn state(&mut self) -> HealthState {
        self.refresh_liveness();
        self.state
    }

    /// Poll the tracked process and drop to `Stopped` if it has exited.
    fn refresh_liveness(&mut self) -> bool {
        let alive = self.process.is_alive();
        if !alive && self.state != HealthState::Stopped {
            if let Some(handle) = self.process.handle() {
                tracing::warn!(pid = handle.pid(), previous = ?self.state, "Sidecar process is gone");
            }
            self.state = HealthState::Stopped;
        }
        alive
    }

    /// Base URL of the sidecar's HTTP API.
    pub fn base_url(&self) -> String {
        self.api.base_url()
    }

    /// The tracked process, if any.
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.handle()
    }

    /// Make sure the executable is present locally.
    pub async fn ensure_binary(&self) -> Result<BinaryArtifact> {
        Ok(self.provisioner.ensure_binary().await?)
    }

    /// Provision, spawn and optionally wait for readiness.
    ///
    /// `timeout` defaults to the configured health timeout. On any failure
    /// the spawned process is terminated before the error is returned.
    pub async fn start(&mut self, wait_for_health: bool, timeout: Option<Duration>) -> Result<()> {
        self.start_inner(wait_for_health, timeout, None, CancelPolicy::Terminate)
            .await
    }

    /// Like [`start`](Self::start), but the health wait can be cancelled.
    ///
    /// On cancellation returns `HealthError::Cancelled`; `policy` decides
    /// whether the process is left running or terminated.
    pub async fn start_with_cancel(
        &mut self,
        wait_for_health: bool,
        timeout: Option<Duration>,
        cancel: watch::Receiver<bool>,
        policy: CancelPolicy,
    ) -> Result<()> {
        self.start_inner(wait_for_health, timeout, Some(cancel), policy)
            .await
    }

    async fn start_inner(
        &mut self,
        wait_for_health: bool,
        timeout: Option<Duration>,
        cancel: Option<watch::Receiver<bool>>,
        policy: CancelPolicy,
    ) -> Result<()> {
        self.config.require_credentials()?;
        self.config.validate()?;

        if self.process.is_alive() {
            let pid = self.process.handle().map(ProcessHandle::pid).unwrap_or_default();
            return Err(SupervisorError::AlreadyRunning { pid });
        }
        // Reap a previous process that died on its own.
        self.process.terminate(self.config.stop_timeout).await?;
        self.state = HealthState::Stopped;

        let artifact = self.provisioner.ensure_binary().await?;
        let pid = self.process.spawn(&artifact.path, &self.config).await?.pid();
        self.state = HealthState::Starting;

        if !wait_for_health {
            tracing::info!(pid, port = self.config.port, "Sidecar started without health wait");
            self.state = HealthState::Unknown;
            return Ok(());
        }

        let timeout = timeout.unwrap_or(self.config.health_timeout);
        let process = &mut self.process;
        let waited = self
            .health
            .wait_until_healthy(
                timeout,
                self.config.health_poll_interval,
                || process.is_alive(),
                cancel,
            )
            .await;

        match waited {
            Ok(_) => {
                self.state = HealthState::Healthy;
                tracing::info!(pid, url = %self.base_url(), "Sidecar started");
                Ok(())
            }
            Err(HealthError::Cancelled) if policy == CancelPolicy::LeaveRunning => {
                tracing::info!(pid, "Health wait cancelled; leaving sidecar running");
                Err(HealthError::Cancelled.into())
            }
            Err(err) => {
                if let Some(status) = self.process.handle().and_then(ProcessHandle::exit_status) {
                    tracing::warn!(pid, status = %status, error = %err, "Sidecar failed to start");
                } else {
                    tracing::warn!(pid, error = %err, "Sidecar failed to start; terminating");
                }
                if let Err(term_err) = self.process.terminate(self.config.stop_timeout).await {
                    tracing::error!(pid, error = %term_err, "Failed to clean up sidecar after failed start");
                }
                self.state = HealthState::Stopped;
                Err(err.into())
            }
        }
    }

    /// Stop the sidecar. A no-op when nothing is tracked.
    ///
    /// The state is `Stopped` afterwards even if termination reported an error.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(pid) = self.process.handle().map(ProcessHandle::pid) else {
            self.state = HealthState::Stopped;
            return Ok(());
        };

        tracing::info!(pid, "Stopping sidecar");
        let result = self.process.terminate(self.config.stop_timeout).await;
        self.state = HealthState::Stopped;
        result?;
        tracing::info!(pid, "Sidecar stopped");
        Ok(())
    }

    /// Stop, then start with a health wait.
    pub async fn restart(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stop().await?;
        self.start(true, timeout).await
    }

    /// Liveness of the tracked process. Never blocks.
    pub fn is_running(&mut self) -> bool {
        self.refresh_liveness()
    }

    /// Process liveness and, when alive, one probe. The probe result is not
    /// recorded; a dead process still moves the state to `Stopped`.
    pub async fn status(&mut self) -> SidecarStatus {
        let alive = self.refresh_liveness();
        let healthy = alive && self.health.probe_once().await.is_healthy();
        SidecarStatus { alive, healthy }
    }

    /// Probe the endpoint once.
    ///
    /// Probes whatever listens on the port, tracked or not. When a process is
    /// tracked the result is recorded as its health state.
    pub async fn check_health(&mut self) -> bool {
        let healthy = self.health.probe_once().await.is_healthy();
        if self.refresh_liveness() {
            self.state = if healthy {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            };
        }
        healthy
    }

    /// Run a named query against the running sidecar.
    ///
    /// Known names: `node-info`, `health`. Requires a live process and never
    /// starts one.
    pub async fn query(&mut self, name: &str) -> Result<Value> {
        let path = query_path(name, &self.config.health_check.path).ok_or_else(|| {
            SupervisorError::UnknownQuery {
                name: name.to_string(),
            }
        })?
        .to_string();
        if !self.refresh_liveness() {
            return Err(SupervisorError::NotRunning);
        }
        Ok(self.api.call(&path, Method::GET, None).await?)
    }

    /// Arbitrary API call against the running sidecar.
    pub async fn call(&mut self, endpoint: &str, method: Method, body: Option<&Value>) -> Result<Value> {
        if !self.refresh_liveness() {
            return Err(SupervisorError::NotRunning);
        }
        Ok(self.api.call(endpoint, method, body).await?)
    }

    /// Node information from the running sidecar.
    pub async fn get_node_info(&mut self) -> Result<NodeInfo> {
        if !self.refresh_liveness() {
            return Err(SupervisorError::NotRunning);
        }
        Ok(self.api.node_info().await?)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.process.handle()
            && handle.alive()
        {
            tracing::warn!(
                pid = handle.pid(),
                "Supervisor dropped without stop(); killing sidecar"
            );
        }
    }
}

fn query_path<'a>(name: &str, health_path: &'a str) -> Option<&'a str> {
    match name {
        "node-info" | "node_info" => Some(NODE_INFO_PATH),
        "health" => Some(health_path),
        _ => None,
    }
}
