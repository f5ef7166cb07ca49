use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ethers::core::k256::ecdsa::signature::hazmat::PrehashSigner;
use ethers::core::k256::ecdsa::{Signature, SigningKey};
use ethers::types::Address;
use ethers::utils::secret_key_to_address;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;

pub const TENANT: &str = "tenant-a";
pub const CLIENT_SECRET: &str = "correct-client-secret";
pub const KEY_NAME: &str = "signing-key";
pub const KEY_VERSION: &str = "7c1e2f";

/// Key vault and token authority in one server
pub struct FakeAzure {
    key: SigningKey,
    authority: String,
    tokens: Mutex<HashSet<String>>,
    token_requests: AtomicUsize,
    sign_requests: AtomicUsize,
    sign_delay: Mutex<Duration>,
}

impl FakeAzure {
    pub fn address(&self) -> Address {
        secret_key_to_address(&self.key)
    }

    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }

    pub fn sign_requests(&self) -> usize {
        self.sign_requests.load(Ordering::SeqCst)
    }

    /// Holds every authorized sign request for `delay` before answering
    pub fn set_sign_delay(&self, delay: Duration) {
        *self.sign_delay.lock().unwrap() = delay;
    }

    /// Every issued token is rejected from now on
    pub fn revoke_tokens(&self) {
        self.tokens.lock().unwrap().clear();
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| self.tokens.lock().unwrap().contains(token))
            .unwrap_or(false)
    }

    fn challenge(&self) -> Response {
        let challenge = format!(
            r#"Bearer authorization="{}{TENANT}", resource="https://vault.azure.net""#,
            self.authority
        );

        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, challenge)],
            Json(json!({
                "error": {
                    "code": "Unauthorized",
                    "message": "AKV10000: Request is missing a Bearer or PoP token.",
                }
            })),
        )
            .into_response()
    }
}

pub struct FakeAzureHandle {
    pub azure: Arc<FakeAzure>,
    pub local_addr: SocketAddr,
    _server_handle: JoinHandle<Result<(), hyper::Error>>,
}

impl FakeAzureHandle {
    /// Base url of both the vault and the authority
    pub fn url(&self) -> String {
        format!("http://{}/", self.local_addr)
    }
}

pub async fn setup_fake_azure(
    key: SigningKey,
) -> eyre::Result<FakeAzureHandle> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let local_addr = listener.local_addr()?;

    let azure = Arc::new(FakeAzure {
        key,
        authority: format!("http://{local_addr}/"),
        tokens: Mutex::new(HashSet::new()),
        token_requests: AtomicUsize::new(0),
        sign_requests: AtomicUsize::new(0),
        sign_delay: Mutex::new(Duration::ZERO),
    });

    let router = Router::new()
        .route("/:tenant/oauth2/v2.0/token", post(token))
        .route("/keys/:name/:version", get(get_key))
        .route("/keys/:name/:version/sign", post(sign))
        .with_state(azure.clone());

    let server =
        axum::Server::from_tcp(listener)?.serve(router.into_make_service());
    let server_handle = tokio::spawn(server);

    Ok(FakeAzureHandle {
        azure,
        local_addr,
        _server_handle: server_handle,
    })
}

async fn token(
    State(azure): State<Arc<FakeAzure>>,
    Path(tenant): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let request = azure.token_requests.fetch_add(1, Ordering::SeqCst);

    let field = |name: &str| form.get(name).map(String::as_str);

    if tenant != TENANT
        || field("grant_type") != Some("client_credentials")
        || field("scope") != Some("https://vault.azure.net/.default")
        || field("client_secret") != Some(CLIENT_SECRET)
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "invalid_client",
                "error_description": "AADSTS7000215: Invalid client secret provided.",
            })),
        )
            .into_response();
    }

    let access_token = format!("token-{request}");
    azure.tokens.lock().unwrap().insert(access_token.clone());

    Json(json!({
        "token_type": "Bearer",
        "expires_in": 3599,
        "access_token": access_token,
    }))
    .into_response()
}

async fn get_key(
    State(azure): State<Arc<FakeAzure>>,
    Path((name, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !azure.is_authorized(&headers) {
        return azure.challenge();
    }

    if name != KEY_NAME || version != KEY_VERSION {
        return StatusCode::NOT_FOUND.into_response();
    }

    let point = azure.key.verifying_key().to_encoded_point(false);
    let bytes = point.as_bytes();

    Json(json!({
        "key": {
            "kid": format!("{}keys/{name}/{version}", azure.authority),
            "kty": "EC-HSM",
            "key_ops": ["sign", "verify"],
            "crv": "P-256K",
            "x": URL_SAFE_NO_PAD.encode(&bytes[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&bytes[33..65]),
        },
        "attributes": { "enabled": true }
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct SignBody {
    alg: String,
    value: String,
}

async fn sign(
    State(azure): State<Arc<FakeAzure>>,
    headers: HeaderMap,
    Json(body): Json<SignBody>,
) -> Response {
    if !azure.is_authorized(&headers) {
        return azure.challenge();
    }

    azure.sign_requests.fetch_add(1, Ordering::SeqCst);

    let delay = *azure.sign_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    let digest = match URL_SAFE_NO_PAD.decode(&body.value) {
        Ok(digest) if body.alg == "ES256K" && digest.len() == 32 => digest,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    let signature: Signature = match azure.key.sign_prehash(&digest) {
        Ok(signature) => signature,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    Json(json!({
        "kid": format!("{}keys/{KEY_NAME}/{KEY_VERSION}", azure.authority),
        "value": URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    }))
    .into_response()
}
