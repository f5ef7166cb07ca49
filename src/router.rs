//! JSON-RPC interception.
//!
//! Signing methods are answered with keys held by the registry, every
//! other method goes to the upstream node untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ethers::signers::Signer;
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Bytes, Signature, U256, U64};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::instrument;

pub use self::transaction::TransactionCall;
use crate::keys::{BackendError, UniversalError, UniversalSigner};
use crate::registry::SignerRegistry;
use crate::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcError};
use crate::upstream::Upstream;

pub mod transaction;

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Used for transactions without a chain id, queried from the node
    /// when unset
    pub chain_id: Option<u64>,
}

pub struct RequestRouter {
    registry: Arc<SignerRegistry>,
    upstream: Arc<dyn Upstream>,
    config: RouterConfig,
    chain_id: OnceCell<u64>,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<SignerRegistry>,
        upstream: Arc<dyn Upstream>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            upstream,
            config,
            chain_id: OnceCell::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SignerRegistry> {
        &self.registry
    }

    /// Answers a single request. Never fails, errors become error responses
    /// carrying the request id.
    #[instrument(skip_all, fields(method = %request.method, id = %request.id))]
    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        metrics::counter!("signer_proxy_requests").increment(1);

        let id = request.id.clone();

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(
                    code = error.code,
                    message = %error.message,
                    "Request failed"
                );
                JsonRpcResponse::error(id, error)
            }
        }
    }

    async fn dispatch(
        &self,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        let id = request.id.clone();

        let result = match request.method.as_str() {
            "eth_accounts" => json!(self.registry.list().await),
            "eth_sendTransaction" => {
                let raw = self.sign_transaction(&request.params).await?;
                let submit = JsonRpcRequest::new(
                    id.clone(),
                    "eth_sendRawTransaction",
                    json!([raw]),
                );

                return self.forward(submit).await;
            }
            "eth_signTransaction" => {
                json!(self.sign_transaction(&request.params).await?)
            }
            "eth_sign" => {
                let params = params_array(&request.params, 2)?;
                let address: Address = param(params, 0)?;
                let message = message_bytes(&param::<String>(params, 1)?)?;

                json!(self.sign_message(address, message).await?)
            }
            "personal_sign" => {
                let params = params_array(&request.params, 2)?;
                let message = message_bytes(&param::<String>(params, 0)?)?;
                let address: Address = param(params, 1)?;

                json!(self.sign_message(address, message).await?)
            }
            "eth_signTypedData_v4" => {
                let params = params_array(&request.params, 2)?;
                let address: Address = param(params, 0)?;
                let typed_data = typed_data(&params[1])?;

                json!(self.sign_typed_data(address, typed_data).await?)
            }
            _ => return self.forward(request).await,
        };

        Ok(JsonRpcResponse::result(id, result))
    }

    async fn forward(
        &self,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        let id = request.id.clone();

        let response = self.upstream.forward(request).await.map_err(|err| {
            tracing::warn!(error = ?err, "Upstream request failed");
            RpcError::Upstream
        })?;

        Ok(response.with_id(id))
    }

    /// Calls the node on behalf of the proxy and unwraps the result
    async fn query<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, JsonRpcError> {
        let value = self
            .forward(JsonRpcRequest::new(json!(1), method, params))
            .await?
            .into_result()?;

        serde_json::from_value(value).map_err(|err| {
            tracing::warn!(method, error = %err, "Unexpected upstream result");
            RpcError::Internal.into()
        })
    }

    async fn chain_id(&self) -> Result<u64, JsonRpcError> {
        if let Some(chain_id) = self.config.chain_id {
            return Ok(chain_id);
        }

        let chain_id = self
            .chain_id
            .get_or_try_init(|| async {
                let chain_id: U64 = self.query("eth_chainId", json!([])).await?;
                Ok::<_, JsonRpcError>(chain_id.as_u64())
            })
            .await?;

        Ok(*chain_id)
    }

    async fn resolve(
        &self,
        address: Address,
    ) -> Result<Arc<UniversalSigner>, RpcError> {
        self.registry.resolve(address).await.map_err(|err| {
            tracing::warn!(error = %err, "Cannot sign");
            RpcError::from(err)
        })
    }

    /// Signs the transaction of `eth_sendTransaction` and
    /// `eth_signTransaction` and returns it RLP encoded
    async fn sign_transaction(
        &self,
        params: &Value,
    ) -> Result<Bytes, JsonRpcError> {
        let params = params_array(params, 1)?;
        let call: TransactionCall = param(params, 0)?;
        call.validate()?;

        let signer = self.resolve(call.from).await?;

        let nonce = match call.nonce {
            Some(nonce) => nonce,
            None => {
                self.query::<U256>(
                    "eth_getTransactionCount",
                    json!([call.from, "pending"]),
                )
                .await?
            }
        };

        let chain_id = match call.chain_id {
            Some(chain_id) => chain_id.as_u64(),
            None => self.chain_id().await?,
        };

        let tx = call.into_typed(nonce, chain_id);

        tracing::info!(
            from = ?tx.from(),
            ?nonce,
            chain_id,
            "Signing transaction"
        );

        let raw = sign_in_task(signer.address(), signer.timeout(), {
            let signer = signer.clone();
            async move { signer.raw_signed_tx(&tx).await }
        })
        .await?;

        Ok(raw)
    }

    async fn sign_message(
        &self,
        address: Address,
        message: Vec<u8>,
    ) -> Result<Bytes, JsonRpcError> {
        let signer = self.resolve(address).await?;

        let signature = sign_in_task(signer.address(), signer.timeout(), {
            let signer = signer.clone();
            async move { signer.sign_message(message).await }
        })
        .await?;

        Ok(signature_bytes(&signature))
    }

    async fn sign_typed_data(
        &self,
        address: Address,
        typed_data: TypedData,
    ) -> Result<Bytes, JsonRpcError> {
        let signer = self.resolve(address).await?;

        let signature = sign_in_task(signer.address(), signer.timeout(), {
            let signer = signer.clone();
            async move { signer.sign_typed_data(&typed_data).await }
        })
        .await?;

        Ok(signature_bytes(&signature))
    }
}

/// Runs a signing operation for `address` on its own task, bounded by the
/// backend's timeout.
///
/// Neither the timeout nor dropping the returned future cancels the
/// operation, it finishes in the background and its result is discarded.
async fn sign_in_task<T, F>(
    address: Address,
    limit: Option<Duration>,
    operation: F,
) -> Result<T, RpcError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, UniversalError>> + Send + 'static,
{
    let handle = tokio::spawn(operation);

    let joined = match limit {
        Some(limit) => {
            tokio::time::timeout(limit, handle).await.map_err(|_| {
                tracing::warn!(?address, ?limit, "Signing timed out");
                signing_failed(RpcError::Timeout)
            })?
        }
        None => handle.await,
    };

    let result = joined.map_err(|err| {
        tracing::error!(?address, error = %err, "Signing task failed");
        signing_failed(RpcError::Internal)
    })?;

    result.map_err(|err| {
        let err = BackendError::from(err);
        tracing::warn!(?address, error = %err, "Signing failed");
        signing_failed(RpcError::from(&err))
    })
}

fn signing_failed(error: RpcError) -> RpcError {
    let code = error.code().to_string();
    metrics::counter!("signer_proxy_signing_errors", "code" => code)
        .increment(1);
    error
}

fn signature_bytes(signature: &Signature) -> Bytes {
    Bytes::from(signature.to_vec())
}

fn params_array(params: &Value, len: usize) -> Result<&[Value], RpcError> {
    match params {
        Value::Array(params) if params.len() >= len => Ok(params),
        Value::Array(params) => Err(RpcError::invalid_params(format!(
            "expected {len} parameters, got {}",
            params.len()
        ))),
        _ => Err(RpcError::invalid_params("expected a parameter array")),
    }
}

fn param<T: DeserializeOwned>(
    params: &[Value],
    index: usize,
) -> Result<T, RpcError> {
    let value = params.get(index).cloned().unwrap_or(Value::Null);

    serde_json::from_value(value).map_err(|err| {
        RpcError::invalid_params(format!("parameter {index}: {err}"))
    })
}

/// Hex payloads are signed as bytes, anything else as its UTF-8 text
fn message_bytes(data: &str) -> Result<Vec<u8>, RpcError> {
    match data.strip_prefix("0x") {
        Some(hex_data) => hex::decode(hex_data)
            .map_err(|err| RpcError::invalid_params(format!("data: {err}"))),
        None => Ok(data.as_bytes().to_vec()),
    }
}

/// Typed data arrives either as an object or as its JSON string
fn typed_data(value: &Value) -> Result<TypedData, RpcError> {
    let parsed = match value {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };

    parsed.map_err(|err| RpcError::invalid_params(format!("typed data: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use ethers::signers::LocalWallet;
    use ethers::types::transaction::eip712::Eip712;
    use indoc::indoc;
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::utils::rlp::Rlp;
    use test_case::test_case;

    use super::*;
    use crate::keys::utils::signing_key_from_hex;
    use crate::keys::BackendFactory;
    use crate::metadata::{MetadataStore, SigningMetadata};

    const KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    struct StaticFactory;

    #[async_trait::async_trait]
    impl BackendFactory for StaticFactory {
        async fn create(
            &self,
            _metadata: &SigningMetadata,
        ) -> Result<UniversalSigner, BackendError> {
            let wallet: LocalWallet =
                signing_key_from_hex(KEY).map_err(|err| {
                    BackendError::Signing(err.to_string())
                })?.into();

            Ok(UniversalSigner::Local(wallet))
        }
    }

    /// Answers the node queries the router makes and records everything
    #[derive(Default)]
    struct RecordingUpstream {
        requests: Mutex<Vec<JsonRpcRequest>>,
    }

    impl RecordingUpstream {
        fn methods(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|request| request.method.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Upstream for RecordingUpstream {
        async fn forward(
            &self,
            request: JsonRpcRequest,
        ) -> eyre::Result<JsonRpcResponse> {
            self.requests.lock().unwrap().push(request.clone());

            let result = match request.method.as_str() {
                "eth_chainId" => json!("0x539"),
                "eth_getTransactionCount" => json!("0x7"),
                "eth_sendRawTransaction" => {
                    json!(format!("0x{}", "ab".repeat(32)))
                }
                "eth_fail" => eyre::bail!("connection refused"),
                _ => json!("0x1234"),
            };

            Ok(JsonRpcResponse::result(json!(99), result))
        }
    }

    async fn router(
    ) -> (RequestRouter, Arc<RecordingUpstream>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(format!("{ADDRESS}.toml")),
            indoc! {r#"
                [signing]
                type = "file-based-signer"
                key-file = "key.json"
                password-file = "password"
            "#},
        )
        .unwrap();

        let registry = SignerRegistry::load(
            MetadataStore::new(dir.path()),
            Arc::new(StaticFactory),
        )
        .await
        .unwrap();

        let upstream = Arc::new(RecordingUpstream::default());
        let router = RequestRouter::new(
            Arc::new(registry),
            upstream.clone(),
            RouterConfig::default(),
        );

        (router, upstream, dir)
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(json!(1), method, params)
    }

    fn address() -> Address {
        ADDRESS.parse().unwrap()
    }

    #[tokio::test]
    async fn lists_accounts() {
        let (router, upstream, _dir) = router().await;

        let response = router.handle(request("eth_accounts", json!([]))).await;

        assert_eq!(response.into_result().unwrap(), json!([ADDRESS]));
        assert!(upstream.methods().is_empty());
    }

    #[tokio::test]
    async fn signs_transaction_with_node_nonce_and_chain_id(
    ) -> eyre::Result<()> {
        let (router, upstream, _dir) = router().await;

        let response = router
            .handle(request(
                "eth_signTransaction",
                json!([{
                    "from": ADDRESS,
                    "to": "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
                    "value": "0x1",
                }]),
            ))
            .await;

        let raw: Bytes =
            serde_json::from_value(response.into_result().unwrap())?;
        let (tx, signature) =
            TypedTransaction::decode_signed(&Rlp::new(raw.as_ref()))?;

        assert_eq!(signature.recover(tx.sighash())?, address());
        assert_eq!(tx.nonce(), Some(&U256::from(7)));
        assert_eq!(tx.chain_id(), Some(U64::from(1337)));
        assert_eq!(
            upstream.methods(),
            vec!["eth_getTransactionCount", "eth_chainId"]
        );

        Ok(())
    }

    #[tokio::test]
    async fn send_transaction_submits_raw_transaction() {
        let (router, upstream, _dir) = router().await;

        let response = router
            .handle(
                request(
                    "eth_sendTransaction",
                    json!([{
                        "from": ADDRESS,
                        "nonce": "0x0",
                        "chainId": "0x1",
                    }]),
                )
                .with_id(json!("send")),
            )
            .await;

        assert_eq!(response.id, json!("send"));
        assert_eq!(
            response.into_result().unwrap(),
            json!(format!("0x{}", "ab".repeat(32)))
        );
        assert_eq!(upstream.methods(), vec!["eth_sendRawTransaction"]);
    }

    #[tokio::test]
    async fn unknown_sender_is_never_forwarded() {
        let (router, upstream, _dir) = router().await;

        let response = router
            .handle(request(
                "eth_sendTransaction",
                json!([{
                    "from": "0x0000000000000000000000000000000000000001",
                }]),
            ))
            .await;

        assert_eq!(response.into_result().unwrap_err().code, -32000);
        assert!(upstream.methods().is_empty());
    }

    #[test_case(
        "eth_sign",
        json!([ADDRESS, "0x68656c6c6f"]) ;
        "eth_sign hex"
    )]
    #[test_case(
        "personal_sign",
        json!(["0x68656c6c6f", ADDRESS]) ;
        "personal_sign hex"
    )]
    #[test_case(
        "personal_sign",
        json!(["hello", ADDRESS]) ;
        "personal_sign text"
    )]
    #[tokio::test]
    async fn signs_messages(method: &str, params: Value) -> eyre::Result<()> {
        let (router, _upstream, _dir) = router().await;

        let response = router.handle(request(method, params)).await;

        let signature: Bytes =
            serde_json::from_value(response.into_result().unwrap())?;
        let signature = Signature::try_from(signature.as_ref())?;

        signature.verify("hello", address())?;

        Ok(())
    }

    #[tokio::test]
    async fn signs_typed_data_given_as_string() -> eyre::Result<()> {
        let (router, _upstream, _dir) = router().await;
        let typed_data = json!({
            "types": {
                "EIP712Domain": [
                    { "name": "name", "type": "string" },
                    { "name": "chainId", "type": "uint256" }
                ],
                "Mail": [{ "name": "contents", "type": "string" }]
            },
            "primaryType": "Mail",
            "domain": { "name": "Mailer", "chainId": 1 },
            "message": { "contents": "hello" }
        });

        let response = router
            .handle(request(
                "eth_signTypedData_v4",
                json!([ADDRESS, typed_data.to_string()]),
            ))
            .await;

        let signature: Bytes =
            serde_json::from_value(response.into_result().unwrap())?;
        let signature = Signature::try_from(signature.as_ref())?;
        let parsed: TypedData = serde_json::from_value(typed_data)?;
        let digest = parsed.encode_eip712()?;

        assert_eq!(signature.recover(digest)?, address());

        Ok(())
    }

    #[test_case(json!({}) ; "not an array")]
    #[test_case(json!([]) ; "missing transaction")]
    #[test_case(json!([{ "to": ADDRESS }]) ; "missing from")]
    #[tokio::test]
    async fn malformed_params_are_invalid(params: Value) {
        let (router, _upstream, _dir) = router().await;

        let response =
            router.handle(request("eth_signTransaction", params)).await;

        assert_eq!(response.into_result().unwrap_err().code, -32602);
    }

    #[tokio::test]
    async fn other_methods_pass_through() {
        let (router, upstream, _dir) = router().await;

        let response = router
            .handle(request("eth_blockNumber", json!([])).with_id(json!(42)))
            .await;

        assert_eq!(response.id, json!(42));
        assert_eq!(response.into_result().unwrap(), json!("0x1234"));
        assert_eq!(upstream.methods(), vec!["eth_blockNumber"]);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_reported() {
        let (router, _upstream, _dir) = router().await;

        let response = router.handle(request("eth_fail", json!([]))).await;

        assert_eq!(response.into_result().unwrap_err().code, -32004);
    }

    #[tokio::test]
    async fn signing_timeout_detaches_operation() {
        let finished = Arc::new(AtomicBool::new(false));
        let limit = Duration::from_millis(100);

        let started = std::time::Instant::now();
        let result = sign_in_task(address(), Some(limit), {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<_, UniversalError>(())
            }
        })
        .await;

        assert_eq!(result, Err(RpcError::Timeout));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn signing_within_limit_returns_result() {
        let result = sign_in_task(
            address(),
            Some(Duration::from_secs(1)),
            async { Ok::<_, UniversalError>(7) },
        )
        .await;

        assert_eq!(result, Ok(7));
    }
}
