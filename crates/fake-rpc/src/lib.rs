//! A minimal in-process Ethereum node.
//!
//! Answers the handful of methods a signing proxy relies on and records
//! every raw transaction it is sent.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{post, IntoMakeService};
use axum::{Json, Router};
use ethers::types::{Bytes, H256, U256, U64};
use ethers::utils::keccak256;
use hyper::server::conn::AddrIncoming;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

pub const DEFAULT_CHAIN_ID: u64 = 1337;
pub const BLOCK_NUMBER: u64 = 42;

pub struct FakeNode {
    chain_id: u64,
    raw_txs: Mutex<Vec<Bytes>>,
    methods: Mutex<Vec<String>>,
}

impl FakeNode {
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Raw transactions received through `eth_sendRawTransaction`
    pub async fn raw_txs(&self) -> Vec<Bytes> {
        self.raw_txs.lock().await.clone()
    }

    /// Every method called so far, in order
    pub async fn methods(&self) -> Vec<String> {
        self.methods.lock().await.clone()
    }

    async fn call(&self, method: &str, params: &Value) -> Result<Value, Value> {
        match method {
            "eth_chainId" => Ok(json!(U64::from(self.chain_id))),
            "eth_blockNumber" => Ok(json!(U64::from(BLOCK_NUMBER))),
            // Every accepted transaction bumps the nonce of all senders alike
            "eth_getTransactionCount" => {
                let count = self.raw_txs.lock().await.len();
                Ok(json!(U256::from(count)))
            }
            "eth_sendRawTransaction" => {
                let raw: Bytes = params
                    .get(0)
                    .cloned()
                    .and_then(|raw| serde_json::from_value(raw).ok())
                    .ok_or_else(|| error(-32602, "invalid raw transaction"))?;

                let hash = H256::from(keccak256(&raw));
                self.raw_txs.lock().await.push(raw);

                Ok(json!(hash))
            }
            _ => Err(error(-32601, "the method does not exist")),
        }
    }
}

fn error(code: i64, message: &str) -> Value {
    json!({ "code": code, "message": message })
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct JsonRpcReq {
    #[serde(default)]
    pub id: Value,
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

async fn rpc(
    State(node): State<Arc<FakeNode>>,
    Json(req): Json<JsonRpcReq>,
) -> Json<Value> {
    tracing::info!(?req, "{}", req.method);

    node.methods.lock().await.push(req.method.clone());

    let response = match node.call(&req.method, &req.params).await {
        Ok(result) => {
            json!({ "jsonrpc": "2.0", "id": req.id, "result": result })
        }
        Err(error) => json!({ "jsonrpc": "2.0", "id": req.id, "error": error }),
    };

    tracing::info!(?response, "{}.response", req.method);

    Json(response)
}

/// Binds on localhost, port 0 picks a free port
pub async fn serve(
    port: u16,
) -> (
    Arc<FakeNode>,
    axum::Server<AddrIncoming, IntoMakeService<Router>>,
) {
    serve_with_chain_id(port, DEFAULT_CHAIN_ID).await
}

pub async fn serve_with_chain_id(
    port: u16,
    chain_id: u64,
) -> (
    Arc<FakeNode>,
    axum::Server<AddrIncoming, IntoMakeService<Router>>,
) {
    let state = Arc::new(FakeNode {
        chain_id,
        raw_txs: Mutex::new(Vec::new()),
        methods: Mutex::new(Vec::new()),
    });

    let router = Router::new()
        .route("/", post(rpc))
        .with_state(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let host = Ipv4Addr::new(127, 0, 0, 1);
    let socket_addr = SocketAddr::new(host.into(), port);

    let server =
        axum::Server::bind(&socket_addr).serve(router.into_make_service());

    (state, server)
}
