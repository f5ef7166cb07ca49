use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, IntoMakeService};
use axum::{Json, Router};
use hyper::server::conn::AddrIncoming;
use serde_json::Value;

use crate::router::RequestRouter;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcError};

pub async fn serve(
    router: Arc<RequestRouter>,
    host: &SocketAddr,
) -> eyre::Result<()> {
    let server = spawn_server(router, host).await?;

    tracing::info!("Listening on {}", server.local_addr());

    server.await?;

    Ok(())
}

pub async fn spawn_server(
    router: Arc<RequestRouter>,
    host: &SocketAddr,
) -> eyre::Result<axum::Server<AddrIncoming, IntoMakeService<Router>>> {
    let app = Router::new()
        .route("/", post(rpc))
        .route("/health", get(health))
        .with_state(router)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let server = axum::Server::try_bind(host)?.serve(app.into_make_service());

    Ok(server)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Accepts a single request object or a batch array
async fn rpc(
    State(router): State<Arc<RequestRouter>>,
    body: Bytes,
) -> Json<Value> {
    let body = match serde_json::from_slice::<Value>(&body) {
        Ok(body) => body,
        Err(err) => {
            tracing::debug!(error = %err, "Unparsable request body");
            return respond(JsonRpcResponse::error(
                Value::Null,
                RpcError::Parse,
            ));
        }
    };

    match body {
        Value::Array(batch) if batch.is_empty() => {
            respond(JsonRpcResponse::error(
                Value::Null,
                RpcError::InvalidRequest,
            ))
        }
        Value::Array(batch) => {
            let responses = futures::future::join_all(
                batch.into_iter().map(|item| handle_one(&router, item)),
            )
            .await;

            Json(serde_json::to_value(responses).unwrap_or(Value::Null))
        }
        item => respond(handle_one(&router, item).await),
    }
}

async fn handle_one(router: &RequestRouter, item: Value) -> JsonRpcResponse {
    let id = item.get("id").cloned().unwrap_or(Value::Null);

    match serde_json::from_value::<JsonRpcRequest>(item) {
        Ok(request) => router.handle(request).await,
        Err(err) => {
            tracing::debug!(error = %err, "Invalid JSON-RPC request");
            JsonRpcResponse::error(id, RpcError::InvalidRequest)
        }
    }
}

fn respond(response: JsonRpcResponse) -> Json<Value> {
    Json(serde_json::to_value(response).unwrap_or(Value::Null))
}
