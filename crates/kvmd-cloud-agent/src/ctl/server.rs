//! Control socket routes and server.

use std::io;
use std::path::{Path, PathBuf};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::tunnel::{AgentHandle, AgentIdentity, LinkContext};

#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    #[error("unable to bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("control socket server failed: {0}")]
    Serve(#[from] io::Error),
}

/// Shared state of the control socket handlers.
#[derive(Clone)]
pub struct CtlState {
    pub agent: AgentHandle,
    pub version: String,
    pub instance_uuid: String,
}

impl CtlState {
    pub fn new(agent: AgentHandle, identity: &AgentIdentity) -> Self {
        Self {
            agent,
            version: identity.version.clone(),
            instance_uuid: identity.instance_uuid.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ready: bool,
    pub version: String,
    pub instance_uuid: String,
}

/// Body of `POST /certbotAdd`, as sent by `kvmd-cloudctl`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertbotAddRequest {
    pub domain_name: String,
    pub txt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertbotDelRequest {
    pub domain_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertbotResponse {
    pub ok: bool,
    pub error: String,
}

type Reply = (StatusCode, Json<CertbotResponse>);

fn reply<E: std::fmt::Display>(result: Result<(), E>) -> Reply {
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(CertbotResponse {
                ok: true,
                error: String::new(),
            }),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(CertbotResponse {
                ok: false,
                error: e.to_string(),
            }),
        ),
    }
}

pub fn router(state: CtlState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/certbotAdd", post(certbot_add))
        .route("/certbotDel", post(certbot_del))
        .with_state(state)
}

/// `GET /status`
async fn status(State(state): State<CtlState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        ready: state.agent.ready(),
        version: state.version,
        instance_uuid: state.instance_uuid,
    })
}

/// `POST /certbotAdd`
async fn certbot_add(
    State(state): State<CtlState>,
    payload: Result<Json<CertbotAddRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return reply(Err(rejection.body_text())),
    };
    let result = state
        .agent
        .forward_certbot_add(&request.domain_name, &request.txt)
        .await;
    if let Err(e) = &result {
        warn!(domain_name = %request.domain_name, error = %e, "certbot add failed");
    }
    reply(result)
}

/// `POST /certbotDel`
async fn certbot_del(
    State(state): State<CtlState>,
    payload: Result<Json<CertbotDelRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return reply(Err(rejection.body_text())),
    };
    let result = state.agent.forward_certbot_del(&request.domain_name).await;
    if let Err(e) = &result {
        warn!(domain_name = %request.domain_name, error = %e, "certbot del failed");
    }
    reply(result)
}

/// Serve `router` on the Unix socket at `path` until `ctx` is cancelled.
/// A stale socket left by a previous run is replaced; any other file at
/// `path` is left alone and fails the bind.
#[cfg(unix)]
pub async fn serve(path: &Path, router: Router, ctx: LinkContext) -> Result<(), CtlError> {
    let bind_error = |source: io::Error| CtlError::Bind {
        path: path.to_path_buf(),
        source,
    };

    remove_stale_socket(path).await.map_err(bind_error)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(bind_error)?;
    }
    let listener = tokio::net::UnixListener::bind(path).map_err(bind_error)?;
    info!(path = %path.display(), "Control socket listening");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await;
    let _ = tokio::fs::remove_file(path).await;
    info!("Control socket stopped");
    result.map_err(CtlError::Serve)
}

/// Unlink `path` only if it is a socket.
#[cfg(unix)]
async fn remove_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_socket() => tokio::fs::remove_file(path).await,
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "server_tests.rs"]
mod tests;
