//! Daemon front end: the session API under {base_path}/api, the portal at
//! {base_path}, and a fallback that re-resolves every other request against the
//! live registry and proxies it (HTTP or WebSocket) to the matching worker.
//! Also owns daemon bootstrap: registry load, control socket, graceful shutdown.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path as UrlPath, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};

use common::config::Config;
use common::control;
use common::manager::{SessionError, SessionManager};
use common::process::{CommandSpawner, SignalProbe};
use common::registry::{DaemonInfo, SessionRecord, SessionRegistry};

use crate::control_channel::{self, ShutdownRequest};
use crate::portal;
use crate::proxy;
use crate::router::{self, RouteDecision};

/// Drain window between acknowledging a shutdown and exiting. In-flight responses
/// get this long to flush; connections still open when it closes are dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

/// Everything the handlers need, built once at startup and cloned into the router.
#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
    config: Arc<RwLock<Config>>,
    client: reqwest::Client,
    shutdown_tx: tokio::sync::mpsc::Sender<ShutdownRequest>,
}

#[derive(serde::Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    name: Option<String>,
    dir: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(serde::Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    force: bool,
}

/// Session record as the API reports it: the record plus the full URL path
/// a browser would use (base path + mount path).
#[derive(serde::Serialize)]
struct SessionView {
    #[serde(flatten)]
    record: SessionRecord,
    #[serde(rename = "fullPath")]
    full_path: String,
}

fn view(record: SessionRecord, base_path: &str) -> SessionView {
    let full_path = format!("{base_path}{}", record.url_path);
    SessionView { record, full_path }
}

fn error_response(err: &SessionError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        SessionError::Validation(_) | SessionError::Conflict(_) => StatusCode::BAD_REQUEST,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Process(_) | SessionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}

/// Session name from an explicit request field, else the directory basename with
/// anything outside [A-Za-z0-9_-] squashed to '-'.
fn derive_name(explicit: Option<&str>, dir: &str) -> String {
    let raw = match explicit {
        Some(name) => name.to_string(),
        None => Path::new(dir)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn base_path_of(state: &AppState) -> String {
    state.config.read().expect("config lock").base_path.clone()
}

/// Run the daemon until a shutdown command arrives: load settings and state, bind
/// the control socket and the HTTP listener, then serve.
pub async fn run_daemon(home_dir: PathBuf) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(&home_dir)?;
    let config = Config::load(&home_dir);
    let socket_path = config.control_socket();
    if control::ping(&socket_path).await {
        return Err(format!(
            "another ttymux daemon already owns {}",
            home_dir.display()
        )
        .into());
    }
    // Socket file left behind by a crashed daemon.
    let _ = std::fs::remove_file(&socket_path);

    let registry = SessionRegistry::open(
        config.state_dir(),
        DaemonInfo {
            pid: std::process::id(),
            http_port: config.base_port,
            started_at: chrono::Utc::now(),
        },
    )?;
    let base_port = config.base_port;
    let base_path = config.base_path.clone();
    let config = Arc::new(RwLock::new(config));
    let manager = SessionManager::new(
        registry,
        Arc::new(SignalProbe),
        Arc::new(CommandSpawner),
        config.clone(),
    );

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<ShutdownRequest>(4);
    control_channel::spawn(socket_path.clone(), config.clone(), shutdown_tx.clone())?;

    // The proxy must pass 30x through to the browser, not chase them.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let state = AppState {
        manager: manager.clone(),
        config,
        client,
        shutdown_tx,
    };
    let app = build_router(state, &base_path);

    let addr = SocketAddr::from(([127, 0, 0, 1], base_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("[ttymux] daemon listening on http://127.0.0.1:{base_port}{base_path}");

    let (acked_tx, acked_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown = async move {
        if let Some(req) = shutdown_rx.recv().await {
            if req.with_sessions {
                manager.stop_all_sessions();
            }
            println!("[ttymux] shutting down");
            let _ = acked_tx.send(());
        }
    };
    // The graceful drain is bounded: a client holding a connection open (say, a
    // request body that never arrives) must not keep an acked shutdown from
    // completing, so the serve future is raced against the grace window.
    let mut serve = std::pin::pin!(axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .into_future());
    let served = tokio::select! {
        result = &mut serve => result,
        _ = async {
            let _ = acked_rx.await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => Ok(()),
    };
    let _ = std::fs::remove_file(&socket_path);
    served?;
    Ok(())
}

fn build_router(state: AppState, base_path: &str) -> Router {
    let api = Router::new()
        .route("/status", get(status_handler))
        .route(
            "/sessions",
            get(list_sessions_handler).post(create_session_handler),
        )
        .route("/sessions/{name}", delete(delete_session_handler))
        .route("/shutdown", post(shutdown_handler))
        .fallback(api_not_found);
    Router::new()
        .nest(&format!("{base_path}/api"), api)
        .fallback(any(dispatch))
        .with_state(state)
}

/// GET /api/status
async fn status_handler(State(state): State<AppState>) -> Response {
    let base_path = base_path_of(&state);
    match state.manager.list_sessions() {
        Ok(records) => {
            let sessions: Vec<_> = records.into_iter().map(|r| view(r, &base_path)).collect();
            Json(serde_json::json!({
                "daemon": state.manager.daemon_info(),
                "sessions": sessions,
            }))
            .into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

/// GET /api/sessions
async fn list_sessions_handler(State(state): State<AppState>) -> Response {
    let base_path = base_path_of(&state);
    match state.manager.list_sessions() {
        Ok(records) => {
            let sessions: Vec<_> = records.into_iter().map(|r| view(r, &base_path)).collect();
            Json(sessions).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

/// POST /api/sessions
async fn create_session_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    let base_path = base_path_of(&state);
    let name = derive_name(body.name.as_deref(), &body.dir);
    match state
        .manager
        .start_session(&name, Path::new(&body.dir), body.path.as_deref())
    {
        Ok(record) => (StatusCode::CREATED, Json(view(record, &base_path))).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// DELETE /api/sessions/{name}?force=
async fn delete_session_handler(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Query(query): Query<DeleteQuery>,
) -> Response {
    match state.manager.stop_session(&name, query.force) {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// POST /api/shutdown: acknowledge first, exit after the grace delay.
async fn shutdown_handler(State(state): State<AppState>) -> Response {
    let _ = state
        .shutdown_tx
        .send(ShutdownRequest {
            with_sessions: false,
        })
        .await;
    Json(serde_json::json!({ "success": true })).into_response()
}

async fn api_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
        .into_response()
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Everything that is not the API: recompute the routing decision from the live
/// registry and either render the portal, proxy to a worker, or 404.
async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let (base_path, inject) = {
        let cfg = state.config.read().expect("config lock");
        (cfg.base_path.clone(), cfg.inject_ime_helper)
    };
    let records = match state.manager.list_sessions() {
        Ok(records) => records,
        Err(e) => return error_response(&e).into_response(),
    };
    let path = req.uri().path().to_string();
    match router::resolve(&records, &base_path, &path) {
        // Known API paths never reach the fallback; an Api decision here is a
        // method/path combination the nested router does not serve.
        RouteDecision::Api => api_not_found().await,
        RouteDecision::Portal => Html(portal::render(
            &state.manager.daemon_info(),
            &records,
            &base_path,
        ))
        .into_response(),
        RouteDecision::NotFound => (StatusCode::NOT_FOUND, "no such session").into_response(),
        RouteDecision::Session(record) => {
            if is_websocket_upgrade(req.headers()) {
                let protocol = req.headers().get(header::SEC_WEBSOCKET_PROTOCOL).cloned();
                let path_and_query = req
                    .uri()
                    .path_and_query()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or(path);
                let (mut parts, _body) = req.into_parts();
                match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                    Ok(ws) => {
                        let port = record.port;
                        // ttyd speaks the "tty" subprotocol; accept it on our side and
                        // forward whatever the client offered upstream.
                        ws.protocols(["tty"]).on_upgrade(move |socket| {
                            proxy::bridge_websocket(socket, port, path_and_query, protocol)
                        })
                    }
                    Err(rejection) => rejection.into_response(),
                }
            } else {
                proxy::forward_http(&state.client, &record, req, inject).await
            }
        }
    }
}
