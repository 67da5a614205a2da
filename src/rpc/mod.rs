pub mod models;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use base64::Engine;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cipher_manager::{find_access_user, Transport};
use crate::error::Error;
use crate::proxy_manager::ProxyManager;
use crate::registry::UserRegistry;
use crate::replay::ReplayGuard;

use models::{
    CreateUserRequest, ErrorResponse, FindAccessUserRequest, FindAccessUserResponse,
    HealthResponse, ListUsersResponse, UpdateUserRequest, UserResponse,
};

#[derive(Clone)]
struct AppState {
    registry: Arc<UserRegistry>,
    replay_guard: Arc<ReplayGuard>,
    proxy_manager: Arc<ProxyManager>,
}

/// Thin JSON-over-HTTP façade over the registry — `GetUser`, `ListUser`,
/// `CreateUser`, `UpdateUser`, `DeleteUser`, `FindAccessUser`,
/// `HealthCheck` — bound to `rpc_host:rpc_port` (the `SS_GRPC_*` env vars;
/// see the config module for why the names don't match the transport).
pub fn spawn(
    rpc_host: String,
    rpc_port: u16,
    registry: Arc<UserRegistry>,
    replay_guard: Arc<ReplayGuard>,
    proxy_manager: Arc<ProxyManager>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let state = AppState {
        registry,
        replay_guard,
        proxy_manager,
    };

    let app = axum::Router::new()
        .route("/health", get(health))
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/find-access-user", post(find_access_user_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let bind_addr = format!("{rpc_host}:{rpc_port}");
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = bind_addr, error = %e, "rpc server bind failed");
                return;
            }
        };
        info!(addr = bind_addr, "rpc server listening");
        let serve = axum::serve(listener, app);
        tokio::select! {
            result = serve => {
                if let Err(e) = result {
                    error!(error = %e, "rpc server error");
                }
            }
            _ = cancel.cancelled() => {
                info!("rpc server shutting down");
            }
        }
    })
}

fn to_response(user: &crate::registry::User) -> UserResponse {
    UserResponse {
        user_id: user.user_id,
        port: user.port(),
        method: format!("{:?}", user.method()),
        enable: user.enabled(),
        tcp_conn_num: user.tcp_conn_num.load(Ordering::Relaxed),
        upload_bytes: user.upload_bytes.load(Ordering::Relaxed),
        download_bytes: user.download_bytes.load(Ordering::Relaxed),
        used_traffic: user.used_traffic(),
        access_order: user.access_order.load(Ordering::Relaxed),
    }
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(ErrorResponse { error: err.to_string() })).into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_ports: state.registry.enabled_ports().len(),
    })
}

async fn list_users(State(state): State<AppState>) -> Json<ListUsersResponse> {
    let users = state.registry.list().iter().map(|u| to_response(u)).collect();
    Json(ListUsersResponse { users })
}

async fn get_user(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.registry.get(id) {
        Some(user) => Json(to_response(&user)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("user {id} not found")),
    }
}

async fn create_user(State(state): State<AppState>, Json(req): Json<CreateUserRequest>) -> Response {
    match state.registry.create_user(req.into()) {
        Ok(()) => {
            state.proxy_manager.reconcile().await;
            StatusCode::CREATED.into_response()
        }
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> Response {
    let record = crate::registry::UserRecord {
        user_id: id,
        port: req.port,
        method: req.method,
        password: req.password,
        enable: req.enable,
    };
    match state.registry.upsert(record) {
        Ok(()) => {
            state.proxy_manager.reconcile().await;
            StatusCode::OK.into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn delete_user(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.registry.delete_user(id) {
        Some(_) => {
            state.proxy_manager.reconcile().await;
            StatusCode::NO_CONTENT.into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("user {id} not found")),
    }
}

async fn find_access_user_handler(
    State(state): State<AppState>,
    Json(req): Json<FindAccessUserRequest>,
) -> Response {
    let transport = match req.transport.to_ascii_lowercase().as_str() {
        "tcp" => Transport::Tcp,
        "udp" => Transport::Udp,
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown transport: {other}"),
            )
        }
    };
    let first_data = match base64::engine::general_purpose::STANDARD.decode(&req.first_data) {
        Ok(bytes) => bytes,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid base64: {e}")),
    };

    match find_access_user(&state.registry, &state.replay_guard, req.port, transport, &first_data) {
        Ok(user) => Json(FindAccessUserResponse { user_id: user.user_id }).into_response(),
        Err(e @ Error::Replayed) => error_response(StatusCode::CONFLICT, e),
        Err(e) => error_response(StatusCode::NOT_FOUND, e),
    }
}
