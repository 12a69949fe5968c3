//! Readiness probing against the sidecar's health endpoint.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::sidecar::config::SupervisorConfig;
use crate::sidecar::error::HealthError;

/// Health of the supervised sidecar.
///
/// Only the health monitor and the process controller move this; callers of
/// the supervisor read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Running, but no probe has been made yet.
    Unknown,
    /// Spawned and waiting for readiness.
    Starting,
    /// Running and the last probe succeeded.
    Healthy,
    /// Running and the last probe failed.
    Unhealthy,
    /// No process.
    Stopped,
}

impl HealthState {
    /// Whether a process is expected to be running in this state.
    pub fn is_running(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Result of a single readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy {
        /// Why the probe failed.
        reason: String,
    },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Polls the sidecar's readiness endpoint.
pub struct HealthMonitor {
    url: String,
    marker: String,
    probe_timeout: Duration,
    /// Reusable HTTP client for health checks (avoids per-request allocation).
    http_client: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(config: &SupervisorConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: config.endpoint().url_for(&config.health_check.path),
            marker: config.health_check.marker.clone(),
            probe_timeout: config.probe_timeout,
            http_client,
        }
    }

    /// Probed URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// One bounded GET. Never fails: every problem is `Unhealthy`.
    pub async fn probe_once(&self) -> ProbeOutcome {
        self.probe_within(self.probe_timeout).await
    }

    async fn probe_within(&self, timeout: Duration) -> ProbeOutcome {
        let request = self.http_client.get(&self.url).timeout(timeout);
        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let reason = if e.is_connect() {
                    "connection refused".to_string()
                } else if e.is_timeout() {
                    "probe timed out".to_string()
                } else {
                    e.to_string()
                };
                return ProbeOutcome::Unhealthy { reason };
            }
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::Unhealthy {
                reason: format!("http status {}", status.as_u16()),
            };
        }

        match response.text().await {
            Ok(body) if body_has_marker(&body, &self.marker) => ProbeOutcome::Healthy,
            Ok(body) => ProbeOutcome::Unhealthy {
                reason: format!("unexpected readiness body: {}", truncate(&body, 120)),
            },
            Err(e) => ProbeOutcome::Unhealthy {
                reason: format!("failed to read body: {}", e),
            },
        }
    }

    /// Poll until healthy, the budget runs out, the process dies or the
    /// caller cancels.
    ///
    /// `is_alive` is consulted before every probe so a crashed process fails
    /// fast. Each probe is capped by the remaining budget, so a probe timeout
    /// longer than `timeout` is fine. Returns the time it took to become
    /// healthy.
    pub async fn wait_until_healthy<F>(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        mut is_alive: F,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Duration, HealthError>
    where
        F: FnMut() -> bool,
    {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = 0u32;
        let mut last_error = String::from("no probe completed");

        tracing::debug!(
            url = %self.url,
            timeout_ms = timeout.as_millis() as u64,
            interval_ms = poll_interval.as_millis() as u64,
            "Waiting for sidecar readiness"
        );

        loop {
            if !is_alive() {
                return Err(HealthError::ProcessExited);
            }

            attempts += 1;
            let budget = self
                .probe_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            let outcome = tokio::select! {
                biased;
                _ = cancelled(cancel.as_mut()) => return Err(HealthError::Cancelled),
                outcome = self.probe_within(budget) => outcome,
            };

            match outcome {
                ProbeOutcome::Healthy => {
                    let elapsed = started.elapsed();
                    tracing::info!(
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Sidecar is healthy"
                    );
                    return Ok(elapsed);
                }
                ProbeOutcome::Unhealthy { reason } => {
                    tracing::trace!(attempt = attempts, reason = %reason, "Sidecar not ready");
                    last_error = reason;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HealthError::Timeout {
                    timeout,
                    attempts,
                    last_error,
                });
            }

            let pause = poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancelled(cancel.as_mut()) => return Err(HealthError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

/// Resolves once the signal reads `true`. Never resolves without a signal or
/// after the sender is dropped.
async fn cancelled(signal: Option<&mut watch::Receiver<bool>>) {
    match signal {
        Some(rx) => {
            if rx.wait_for(|cancel| *cancel).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

fn body_has_marker(body: &str, marker: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => {
            map.get("status").and_then(|v| v.as_str()) == Some(marker)
        }
        Ok(serde_json::Value::String(s)) => s == marker,
        Ok(_) => false,
        Err(_) => body.trim() == marker,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> SupervisorConfig {
        // Bind then drop to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = SupervisorConfig::new(None, port as u32).unwrap();
        config.probe_timeout = Duration::from_millis(200);
        config
    }

    #[test]
    fn test_body_has_marker() {
        assert!(body_has_marker(r#"{"status":"ok"}"#, "ok"));
        assert!(body_has_marker(r#"{"status":"ok","version":"0.3"}"#, "ok"));
        assert!(body_has_marker("ok\n", "ok"));
        assert!(body_has_marker(r#""ok""#, "ok"));
        assert!(!body_has_marker(r#"{"status":"starting"}"#, "ok"));
        assert!(!body_has_marker("[]", "ok"));
        assert!(!body_has_marker("", "ok"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn test_health_state_running() {
        assert!(HealthState::Healthy.is_running());
        assert!(HealthState::Starting.is_running());
        assert!(!HealthState::Stopped.is_running());
        assert_eq!(HealthState::Unhealthy.to_string(), "unhealthy");
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_unhealthy() {
        let monitor = HealthMonitor::new(&unreachable_config());
        assert!(!monitor.probe_once().await.is_healthy());
    }

    #[tokio::test]
    async fn test_wait_times_out_within_budget() {
        let monitor = HealthMonitor::new(&unreachable_config());
        let started = Instant::now();

        let err = monitor
            .wait_until_healthy(
                Duration::from_millis(600),
                Duration::from_millis(100),
                || true,
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HealthError::Timeout { attempts, .. } if attempts >= 2));
        // Budget plus one probe timeout, plus scheduling slack.
        assert!(started.elapsed() < Duration::from_millis(600 + 200 + 500));
    }

    #[tokio::test]
    async fn test_wait_budget_caps_each_request() {
        // Accepts connections but never answers, so only the timeout ends a request.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = SupervisorConfig::new(None, port as u32).unwrap();
        config.probe_timeout = Duration::from_secs(5);
        let monitor = HealthMonitor::new(&config);
        let started = Instant::now();

        let err = monitor
            .wait_until_healthy(
                Duration::from_millis(300),
                Duration::from_millis(100),
                || true,
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HealthError::Timeout { attempts: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(listener);
    }

    #[tokio::test]
    async fn test_wait_fails_fast_when_process_dies() {
        let monitor = HealthMonitor::new(&unreachable_config());
        let mut checks = 0;
        let started = Instant::now();

        let err = monitor
            .wait_until_healthy(
                Duration::from_secs(30),
                Duration::from_millis(50),
                || {
                    checks += 1;
                    checks < 3
                },
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HealthError::ProcessExited));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let monitor = HealthMonitor::new(&unreachable_config());
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(true);
        });

        let started = Instant::now();
        let err = monitor
            .wait_until_healthy(Duration::from_secs(30), Duration::from_secs(1), || true, Some(rx))
            .await
            .unwrap_err();

        assert!(matches!(err, HealthError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_dropped_cancel_sender_is_ignored() {
        let monitor = HealthMonitor::new(&unreachable_config());
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let err = monitor
            .wait_until_healthy(
                Duration::from_millis(400),
                Duration::from_millis(100),
                || true,
                Some(rx),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HealthError::Timeout { .. }));
    }
}
