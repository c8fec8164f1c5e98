use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use dispatch::{DispatchEngine, DispatchRequest, EarlyResponse, RequestContext};
use shared::{
    domain::ConnectionId,
    error::ErrorBody,
    protocol::{ActionRequest, ActionResponse, NewConnectionResponse, PONG},
};
use storage::open_store;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod config;
mod modules;

use config::load_settings;

#[derive(Clone)]
struct AppState {
    engine: DispatchEngine,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings()?;
    let backend = settings.backend_config()?;
    let store = open_store(&backend).await.map_err(|error| {
        error!(
            backend = %backend.kind,
            %error,
            "failed to open session store; check the backend settings"
        );
        error
    })?;
    let registry = modules::registry()?;
    let engine = DispatchEngine::new(registry, store)
        .with_connection_serialization(settings.serialize_connections);

    let app = build_router(Arc::new(AppState { engine }), settings.body_limit_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(
        %addr,
        backend = %backend.kind,
        ttl_seconds = backend.connection_ttl.as_secs(),
        ping_seconds = settings.ping_interval().as_secs(),
        "server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/connections", post(new_connection))
        .route("/ping/:connection_id", put(ping))
        .route("/:module/:action", post(run_action))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody::internal())).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn new_connection(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.new_connection().await {
        Ok(connection_id) => Json(NewConnectionResponse { connection_id }).into_response(),
        Err(error) => {
            error!(%error, "failed to create connection");
            internal_error()
        }
    }
}

async fn ping(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> Response {
    let id = ConnectionId::from(connection_id);
    match state.engine.renew(&id).await {
        Ok(()) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "no-cache")],
            PONG,
        )
            .into_response(),
        Err(error) => {
            warn!(connection = %id, %error, "renew failed");
            internal_error()
        }
    }
}

async fn run_action(
    State(state): State<Arc<AppState>>,
    Path((module, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Json<ActionRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(%module, %action, error = %rejection.body_text(), "malformed action request");
            return internal_error();
        }
    };
    let context = RequestContext::new().with_headers(
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?.to_string()))),
    );
    let request = DispatchRequest::new(req.connection_id, module, action, req.payload)
        .with_context(context.clone());

    let outcome = state.engine.dispatch(request).await;
    if let Some(sent) = context.response().sent() {
        if let Err(error) = &outcome {
            warn!(%error, "action failed after a response was sent");
        }
        return early_response(sent);
    }

    match outcome {
        Ok(outcome) => Json(ActionResponse {
            action_result: outcome.action_result,
            mutations: outcome.mutations,
        })
        .into_response(),
        Err(error) => {
            error!(error = ?error, "action failed");
            internal_error()
        }
    }
}

fn early_response(sent: EarlyResponse) -> Response {
    let status = StatusCode::from_u16(sent.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    for (name, value) in &sent.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    (status, headers, sent.body).into_response()
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
