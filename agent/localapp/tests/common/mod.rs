//! Shared fixtures: a fake download endpoint, a fake helper RPC server and
//! configuration pointed at scratch directories.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use localapp::rpc::{
    AutoTunnelRequest, AutoTunnelResponse, ResolveSshConnectionRequest,
    ResolveSshConnectionResponse, RpcStatus,
};
use localapp::RemoteHost;
use localapp_config::Config;
use tokio::net::TcpListener;

pub async fn serve(router: Router, listener: TcpListener) {
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
}

/// Serves `GET /static/bin/:name` with a configurable body and `ETag`.
#[derive(Clone)]
pub struct FakeDownloads {
    pub addr: SocketAddr,
    state: Arc<DownloadState>,
}

struct DownloadState {
    requests: AtomicUsize,
    failing: AtomicBool,
    etag: Mutex<String>,
    body: Mutex<Vec<u8>>,
}

impl FakeDownloads {
    pub async fn start(etag: &str, body: impl Into<Vec<u8>>) -> Result<Self> {
        let state = Arc::new(DownloadState {
            requests: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            etag: Mutex::new(etag.to_string()),
            body: Mutex::new(body.into()),
        });
        let router = Router::new()
            .route("/static/bin/:name", get(download))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        serve(router, listener).await;
        Ok(Self { addr, state })
    }

    pub fn host(&self) -> RemoteHost {
        RemoteHost::parse(&format!("http://{}", self.addr)).expect("valid test host")
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn publish(&self, etag: &str, body: impl Into<Vec<u8>>) {
        *self.state.etag.lock().unwrap() = etag.to_string();
        *self.state.body.lock().unwrap() = body.into();
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }
}

async fn download(State(state): State<Arc<DownloadState>>) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if state.failing.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let etag = state.etag.lock().unwrap().clone();
    let body = state.body.lock().unwrap().clone();
    ([(header::ETAG, etag)], body).into_response()
}

/// Answers helper RPCs, reporting `unavailable` for the first
/// `unavailable_for` calls.
#[derive(Clone)]
pub struct FakeHelper {
    state: Arc<HelperState>,
}

struct HelperState {
    calls: AtomicUsize,
    unavailable_for: usize,
    tunnel_enabled: Mutex<Option<bool>>,
}

impl FakeHelper {
    pub fn new(unavailable_for: usize) -> Self {
        Self {
            state: Arc::new(HelperState {
                calls: AtomicUsize::new(0),
                unavailable_for,
                tunnel_enabled: Mutex::new(None),
            }),
        }
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn tunnel_enabled(&self) -> Option<bool> {
        *self.state.tunnel_enabled.lock().unwrap()
    }

    pub async fn listen(&self, port: u16) -> Result<()> {
        let router = Router::new()
            .route(
                "/localapp.v1.LocalApp/ResolveSSHConnection",
                post(resolve_ssh),
            )
            .route("/localapp.v1.LocalApp/AutoTunnel", post(auto_tunnel))
            .with_state(Arc::clone(&self.state));
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        serve(router, listener).await;
        Ok(())
    }
}

fn unavailable(state: &HelperState) -> Option<Response> {
    let call = state.calls.fetch_add(1, Ordering::SeqCst);
    (call < state.unavailable_for).then(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RpcStatus {
                code: "unavailable".to_string(),
                message: "still starting".to_string(),
            }),
        )
            .into_response()
    })
}

async fn resolve_ssh(
    State(state): State<Arc<HelperState>>,
    Json(request): Json<ResolveSshConnectionRequest>,
) -> Response {
    if let Some(response) = unavailable(&state) {
        return response;
    }
    if request.workspace_id.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(RpcStatus {
                code: "not_found".to_string(),
                message: "unknown workspace".to_string(),
            }),
        )
            .into_response();
    }
    Json(ResolveSshConnectionResponse {
        host: format!("{}.ssh", request.workspace_id),
        config_file: format!("/tmp/{}.conf", request.instance_id),
    })
    .into_response()
}

async fn auto_tunnel(
    State(state): State<Arc<HelperState>>,
    Json(request): Json<AutoTunnelRequest>,
) -> Response {
    if let Some(response) = unavailable(&state) {
        return response;
    }
    *state.tunnel_enabled.lock().unwrap() = Some(request.enabled);
    Json(AutoTunnelResponse {}).into_response()
}

/// Testing profile with every directory inside `root`.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::testing();
    config.store.state_dir = root.join("state");
    config.installer.install_dir = root.join("bin");
    config.supervisor.log_dir = root.join("logs");
    config
}

/// A helper stand-in that records each launch in `marker` and then idles.
#[cfg(unix)]
pub fn idle_helper_script(marker: &Path) -> Vec<u8> {
    format!(
        "#!/bin/sh\necho \"$LCA_HOST $LCA_API_PORT\" >> '{}'\nexec sleep 30\n",
        marker.display()
    )
    .into_bytes()
}

/// Write an executable script at `path`.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, body)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}
