//! HTTP facade over the gateway: health, discovery, invocation, and an SSE
//! stream that announces the tool list on connect.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Value, json};
use toolgate_core::{Gateway, InvokeOutcome};
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/tools/{name}", post(call_tool))
        .route("/events", get(events))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

pub async fn serve(addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let app = router(gateway);
    info!(addr = %addr, "starting HTTP facade");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn list_tools(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    Json(json!({"tools": gateway.list_tools()}))
}

async fn call_tool(
    State(gateway): State<Arc<Gateway>>,
    AxumPath(name): AxumPath<String>,
    Json(body): Json<Value>,
) -> Response {
    let Some(args) = body.as_object() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "code": "validation_error",
                "message": "request body must be a JSON object",
            })),
        )
            .into_response();
    };

    let outcome = gateway.invoke(&name, args.clone()).await;
    let status = match &outcome {
        InvokeOutcome::Success { .. } => StatusCode::OK,
        InvokeOutcome::Error { code, .. } => StatusCode::from_u16(code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    };
    (status, Json(outcome)).into_response()
}

async fn events(
    State(gateway): State<Arc<Gateway>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let payload = serde_json::to_string(&json!({"tools": gateway.list_tools()}))
        .unwrap_or_else(|_| "{}".to_string());
    let stream = stream::once(async move {
        Ok(Event::default().event("connected").data(payload))
    })
    .chain(stream::pending());
    Sse::new(stream).keep_alive(KeepAlive::default())
}
