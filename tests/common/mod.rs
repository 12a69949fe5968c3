//! Shared fixtures: an in-process fake sidecar and stand-in executables.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use lexe_sidecar::SupervisorConfig;
use serde_json::json;

pub const TOKEN: &str = "test-token";

/// Runs until killed by SIGTERM.
pub const SLEEPER_SCRIPT: &str = "#!/bin/sh\nexec sleep 30\n";

/// Dies right away with a message on stderr.
pub const CRASHING_SCRIPT: &str = "#!/bin/sh\necho 'fatal: bad credentials' >&2\nexit 3\n";

/// Knobs and counters shared with the fake's handlers.
#[derive(Default)]
pub struct FakeState {
    pub healthy: AtomicBool,
    pub garbage_node_info: AtomicBool,
    pub fail_downloads: AtomicBool,
    pub downloads: AtomicUsize,
    pub artifact: Mutex<Vec<u8>>,
}

impl FakeState {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

/// Health, node-info and release-download endpoints on an ephemeral loopback port.
pub struct FakeSidecar {
    pub port: u16,
    pub state: Arc<FakeState>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeSidecar {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        *state.artifact.lock().unwrap() = SLEEPER_SCRIPT.as_bytes().to_vec();

        let app = Router::new()
            .route("/v2/health", get(health_handler))
            .route("/v2/node/node_info", get(node_info_handler))
            .route("/releases/{version}/{platform}", get(download_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { port, state, task }
    }

    pub fn set_artifact(&self, bytes: impl Into<Vec<u8>>) {
        *self.state.artifact.lock().unwrap() = bytes.into();
    }

    /// Config pointed at this fake, with test-sized timeouts.
    pub fn config(&self, binary_dir: &Path) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(Some(TOKEN.to_string().into()), self.port as u32)
            .unwrap()
            .with_binary_dir(binary_dir)
            .with_download_url_template(format!(
                "http://127.0.0.1:{}/releases/{{version}}/{{platform}}",
                self.port
            ))
            .with_health_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(100))
            .with_stop_timeout(Duration::from_secs(2));
        config.probe_timeout = Duration::from_millis(500);
        config
    }
}

impl Drop for FakeSidecar {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn health_handler(State(state): State<Arc<FakeState>>) -> Response {
    if state.healthy.load(Ordering::SeqCst) {
        Json(json!({ "status": "ok" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "starting" })),
        )
            .into_response()
    }
}

async fn node_info_handler(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    let expected = format!("Bearer {}", TOKEN);
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "invalid client credentials").into_response();
    }
    if state.garbage_node_info.load(Ordering::SeqCst) {
        return (StatusCode::OK, "<html>definitely not json").into_response();
    }
    Json(json!({
        "version": "0.3.0",
        "measurement": "d2a1b3",
        "user_pk": "63ad1661bfa2f0d5e2d6a6a0b2ff",
        "node_pk": "02c6a6d5c5b3f5d2e1b0a7f6",
        "balance": "1000",
        "num_channels": 1
    }))
    .into_response()
}

async fn download_handler(State(state): State<Arc<FakeState>>) -> Response {
    state.downloads.fetch_add(1, Ordering::SeqCst);
    if state.fail_downloads.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "release storage unavailable").into_response();
    }
    let bytes = state.artifact.lock().unwrap().clone();
    (StatusCode::OK, bytes).into_response()
}

/// Place an executable script where the provisioner will find it.
#[cfg(unix)]
pub fn install_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Files in `dir`, sorted. Empty if it does not exist.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
