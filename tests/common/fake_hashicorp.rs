use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tokio::task::JoinHandle;

pub const VAULT_TOKEN: &str = "s.fake-root-token";
pub const SECRET_PATH: &str = "/v1/secret/data/ethsignerSigningKey";

struct FakeVault {
    private_key: String,
}

pub struct FakeHashicorpHandle {
    pub local_addr: SocketAddr,
    _server_handle: JoinHandle<Result<(), hyper::Error>>,
}

/// Serves `private_key` as a KV version 2 secret at [`SECRET_PATH`]
pub async fn setup_fake_hashicorp(
    private_key: &str,
) -> eyre::Result<FakeHashicorpHandle> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let local_addr = listener.local_addr()?;

    let state = Arc::new(FakeVault {
        private_key: private_key.to_string(),
    });

    let router = Router::new().fallback(secret).with_state(state);

    let server =
        axum::Server::from_tcp(listener)?.serve(router.into_make_service());

    Ok(FakeHashicorpHandle {
        local_addr,
        _server_handle: tokio::spawn(server),
    })
}

async fn secret(
    State(vault): State<Arc<FakeVault>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get("X-Vault-Token")
        .and_then(|value| value.to_str().ok());

    if token != Some(VAULT_TOKEN) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "errors": ["permission denied"] })),
        )
            .into_response();
    }

    if uri.path() != SECRET_PATH {
        return (StatusCode::NOT_FOUND, Json(json!({ "errors": [] })))
            .into_response();
    }

    Json(json!({
        "request_id": "8d9a6b2e-2f1c-4c47-9d0b-2c1b3f1f0a11",
        "lease_id": "",
        "renewable": false,
        "lease_duration": 0,
        "data": {
            "data": { "value": vault.private_key },
            "metadata": { "version": 1, "destroyed": false }
        }
    }))
    .into_response()
}

/// Accepts connections at the TCP level and never answers
pub struct UnresponsiveServer {
    pub local_addr: SocketAddr,
    _listener: TcpListener,
}

pub fn setup_unresponsive_server() -> eyre::Result<UnresponsiveServer> {
    let listener = TcpListener::bind("127.0.0.1:0")?;

    Ok(UnresponsiveServer {
        local_addr: listener.local_addr()?,
        _listener: listener,
    })
}
