// Tunnel Panel - REST API Module
// Handles HTTP endpoints for the tunnel list, status and logs

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use tunnel_panel_common::{
    is_valid_log_id, log_file_name, read_tail_lines, BackupEntry, ConfigStore, Error,
    FingerprintProtocol, LogStatusProvider, RemoteStatusProvider, StatusAggregator,
    StatusProvider, Tunnel, TunnelAction, TunnelConfig, TunnelEntry,
};

use crate::config::{DaemonConfig, StatusMode, StatusSettings};

/// Lines returned by the log endpoint when `lines` is not given
pub const DEFAULT_LOG_LINES: usize = 200;
/// Upper bound on `lines` for the log endpoint
pub const MAX_LOG_LINES: usize = 1000;

/// Shared application state
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub aggregator: StatusAggregator,
    /// Tunnel runner client, present in remote mode
    pub remote: Option<RemoteStatusProvider>,
    pub logs_dir: PathBuf,
    pub status: StatusSettings,
}

impl AppState {
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let store = Arc::new(ConfigStore::new(
            config.config_file_path(),
            config.backup_dir_path(),
        ));

        let remote = match config.status.mode {
            StatusMode::Logs => None,
            StatusMode::Remote => Some(RemoteStatusProvider::new(
                config.status.remote_base_url.clone(),
                config.status.remote_api_key.clone(),
                config.status.remote_timeout(),
            )?),
        };

        let provider: Arc<dyn StatusProvider> = match &remote {
            None => Arc::new(LogStatusProvider::new(config.logs_dir.clone())),
            Some(remote) => Arc::new(remote.clone()),
        };

        Ok(Self {
            store,
            remote,
            aggregator: StatusAggregator::new(provider, config.fingerprint_protocol),
            logs_dir: config.logs_dir.clone(),
            status: config.status.clone(),
        })
    }

    fn protocol(&self) -> FingerprintProtocol {
        self.aggregator.protocol()
    }
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Tunnel list with each tunnel's log id
#[derive(Serialize)]
struct ConfigResponse {
    tunnels: Vec<TunnelEntry>,
}

/// Body of `POST /api/config`
#[derive(Deserialize)]
struct ConfigUpdate {
    tunnels: Vec<Tunnel>,
}

#[derive(Serialize)]
struct SaveResponse {
    status: &'static str,
    backup: Option<String>,
}

#[derive(Serialize)]
struct BackupsResponse {
    backups: Vec<BackupEntry>,
}

/// Status source settings without the key itself
#[derive(Serialize)]
struct StatusSourceResponse {
    mode: StatusMode,
    base_url: Option<String>,
    api_key_configured: bool,
}

#[derive(Serialize)]
struct ControlResponse {
    status: &'static str,
    action: TunnelAction,
    log_id: String,
}

#[derive(Deserialize)]
struct LogQuery {
    lines: Option<usize>,
}

#[derive(Serialize)]
struct LogResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into() })).into_response()
}

fn log_error(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(LogResponse {
            status: "error",
            log: None,
            error: Some(error.into()),
        }),
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/config/backups", get(list_backups))
        .route("/api/config/api", get(status_source))
        .route("/api/status", get(get_status))
        .route("/api/tunnels/:name/:action", post(control_tunnel))
        .route("/api/logs/:log_id", get(get_log))
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// Current tunnel list, each entry tagged with its log id
async fn get_config(State(state): State<Arc<AppState>>) -> Response {
    let protocol = state.protocol();
    match state.store.spawn_load().await {
        Ok(config) => {
            let tunnels = config
                .tunnels
                .into_iter()
                .map(|tunnel| TunnelEntry {
                    hash: protocol.fingerprint(&tunnel).as_str().to_string(),
                    tunnel,
                })
                .collect();
            Json(ConfigResponse { tunnels }).into_response()
        }
        Err(e) => {
            error!("Failed to load tunnel config: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Replace the tunnel list, backing up the previous document
async fn update_config(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!("Rejected config update: {}", rejection.body_text());
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid data: {}", rejection.body_text()),
            );
        }
    };

    let config = TunnelConfig::new(update.tunnels);
    if let Err(e) = config.validate() {
        warn!("Rejected config update: {}", e);
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let count = config.tunnels.len();
    let save_state = state.clone();
    let result = tokio::task::spawn_blocking(move || save_state.store.save(&config)).await;

    match result {
        Ok(Ok(outcome)) => {
            let backup = outcome
                .backup
                .as_deref()
                .and_then(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned());
            info!("Saved {} tunnel(s), backup: {:?}", count, backup);
            (
                StatusCode::OK,
                Json(SaveResponse {
                    status: "success",
                    backup,
                }),
            )
                .into_response()
        }
        Ok(Err(e)) => {
            error!("Failed to save tunnel config: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!("Config save task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "config save task failed")
        }
    }
}

/// Backups of earlier documents, oldest first
async fn list_backups(State(state): State<Arc<AppState>>) -> Response {
    match state.store.spawn_list_backups().await {
        Ok(backups) => Json(BackupsResponse { backups }).into_response(),
        Err(e) => {
            error!("Failed to list backups: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn status_source(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusSourceResponse {
        mode: state.status.mode,
        base_url: state.status.remote_base_url.clone(),
        api_key_configured: state
            .status
            .remote_api_key
            .as_deref()
            .is_some_and(|key| !key.is_empty()),
    })
}

/// Status of every configured tunnel
async fn get_status(State(state): State<Arc<AppState>>) -> Response {
    match state.aggregator.report(&state.store).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            error!("Failed to build status report: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Forward start, stop or restart of a named tunnel to the tunnel runner
async fn control_tunnel(
    State(state): State<Arc<AppState>>,
    Path((name, action)): Path<(String, String)>,
) -> Response {
    let action: TunnelAction = match action.parse() {
        Ok(action) => action,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let Some(remote) = &state.remote else {
        return error_response(
            StatusCode::CONFLICT,
            "tunnel control requires status mode 'remote'",
        );
    };

    let config = match state.store.spawn_load().await {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load tunnel config: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let Some(tunnel) = config.find(&name) else {
        return error_response(StatusCode::NOT_FOUND, format!("tunnel '{}' not found", name));
    };

    let log_id = state.protocol().fingerprint(tunnel).value;
    match remote.control(action, &log_id).await {
        Ok(()) => {
            info!("{} of tunnel '{}' ({}) accepted", action, name, log_id);
            Json(ControlResponse {
                status: "success",
                action,
                log_id,
            })
            .into_response()
        }
        Err(e @ Error::RemoteUnavailable(_)) => {
            warn!("{} of tunnel '{}' failed: {}", action, name, e);
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(e) => {
            error!("{} of tunnel '{}' failed: {}", action, name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Last `lines` lines of one tunnel's log
async fn get_log(
    State(state): State<Arc<AppState>>,
    Path(log_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Response {
    if !is_valid_log_id(&log_id) {
        return log_error(StatusCode::BAD_REQUEST, format!("invalid log id '{}'", log_id));
    }

    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
    let path = state.logs_dir.join(log_file_name(&log_id));

    let result = tokio::task::spawn_blocking(move || read_tail_lines(&path, lines)).await;

    match result {
        Ok(Ok(tail)) => Json(LogResponse {
            status: "success",
            log: Some(tail.join("\n")),
            error: None,
        })
        .into_response(),
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            log_error(StatusCode::NOT_FOUND, format!("no log for tunnel {}", log_id))
        }
        Ok(Err(e)) => {
            error!("Failed to read log {}: {}", log_id, e);
            log_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!("Log read task failed: {}", e);
            log_error(StatusCode::INTERNAL_SERVER_ERROR, "log read task failed")
        }
    }
}
