// Each test crate uses a different subset of these helpers
#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eth_signer_proxy::config::{
    Config, ServerConfig, ServiceConfig, SigningConfig, UpstreamConfig,
};
use eth_signer_proxy::rpc::{JsonRpcRequest, JsonRpcResponse};
use eth_signer_proxy::service::Service;
use ethers::core::k256::ecdsa::SigningKey;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H160};
use fake_rpc::FakeNode;
use indoc::formatdoc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use self::fake_azure::FakeAzureHandle;

pub mod fake_azure;
pub mod fake_hashicorp;

pub mod prelude {
    pub use std::time::{Duration, Instant};

    pub use eth_signer_proxy::rpc::{JsonRpcRequest, JsonRpcResponse};
    pub use ethers::core::k256::ecdsa::SigningKey;
    pub use ethers::signers::Signer;
    pub use ethers::types::transaction::eip2718::TypedTransaction;
    pub use ethers::types::{Address, Bytes, Signature, H160, U256};
    pub use ethers::utils::rlp::Rlp;
    pub use serde_json::{json, Value};

    pub use super::fake_azure::{setup_fake_azure, CLIENT_SECRET};
    pub use super::fake_hashicorp::{
        setup_fake_hashicorp, setup_unresponsive_server,
    };
    pub use super::*;
}

pub const PASSWORD: &str = "keystore-password";

pub const DEFAULT_ANVIL_ACCOUNT: Address = H160(hex_literal::hex!(
    "f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
));

pub const DEFAULT_ANVIL_PRIVATE_KEY: &[u8] = &hex_literal::hex!(
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
);

pub const SECOND_ANVIL_PRIVATE_KEY: &[u8] = &hex_literal::hex!(
    "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
);

pub const ARBITRARY_ADDRESS: Address = H160(hex_literal::hex!(
    "1Ed53d680B8890DAe2a63f673a85fFDE1FD5C7a2"
));

pub fn setup_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().compact())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

pub struct FakeNodeHandle {
    pub node: Arc<FakeNode>,
    local_addr: SocketAddr,
    server_handle: JoinHandle<eyre::Result<()>>,
}

impl FakeNodeHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }
}

pub async fn setup_fake_node() -> eyre::Result<FakeNodeHandle> {
    let (node, server) = fake_rpc::serve(0).await;

    let local_addr = server.local_addr();

    let server_handle = tokio::spawn(async move {
        server.await?;
        Ok(())
    });

    Ok(FakeNodeHandle {
        node,
        local_addr,
        server_handle,
    })
}

pub async fn setup_service(
    node: &FakeNodeHandle,
    metadata_dir: &Path,
) -> eyre::Result<Service> {
    let config = Config {
        service: ServiceConfig::default(),
        server: ServerConfig {
            host: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                0,
            )),
        },
        upstream: UpstreamConfig {
            url: node.url(),
            timeout: Duration::from_secs(5),
        },
        signing: SigningConfig {
            directory: metadata_dir.to_owned(),
            chain_id: None,
        },
    };

    let service = Service::new(config).await?;

    Ok(service)
}

/// Posts a single request to the proxy
pub async fn call(
    service: &Service,
    method: &str,
    params: Value,
) -> eyre::Result<JsonRpcResponse> {
    let request = JsonRpcRequest::new(json!(1), method, params);

    let response = reqwest::Client::new()
        .post(format!("http://{}/", service.local_addr()))
        .json(&request)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(response)
}

/// Posts a raw body and returns the raw JSON answer
pub async fn call_raw(service: &Service, body: &str) -> eyre::Result<Value> {
    let response = reqwest::Client::new()
        .post(format!("http://{}/", service.local_addr()))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .send()
        .await?
        .json()
        .await?;

    Ok(response)
}

pub fn metadata_file_name(address: Address) -> String {
    format!("{}.toml", hex::encode(address))
}

/// Encrypts `private_key` into a keystore next to the metadata and
/// describes it with a `file-based-signer` metadata file named by its
/// address
pub fn write_file_based_identity(
    dir: &Path,
    private_key: &[u8],
) -> eyre::Result<Address> {
    let keys_dir = dir.join("keys");
    std::fs::create_dir_all(&keys_dir)?;

    let address =
        LocalWallet::from(SigningKey::from_slice(private_key)?).address();
    let key_name = format!("{}.json", hex::encode(address));

    LocalWallet::encrypt_keystore(
        &keys_dir,
        &mut rand::thread_rng(),
        private_key,
        PASSWORD,
        Some(&key_name),
    )?;
    std::fs::write(keys_dir.join("password"), format!("{PASSWORD}\n"))?;

    std::fs::write(
        dir.join(metadata_file_name(address)),
        formatdoc! {r#"
            [signing]
            type = "file-based-signer"
            key-file = "keys/{key_name}"
            password-file = "keys/password"
        "#},
    )?;

    Ok(address)
}

pub fn write_azure_identity(
    dir: &Path,
    azure: &FakeAzureHandle,
    client_secret: &str,
) -> eyre::Result<Address> {
    write_azure_identity_with_timeout(dir, azure, client_secret, 2000)
}

pub fn write_azure_identity_with_timeout(
    dir: &Path,
    azure: &FakeAzureHandle,
    client_secret: &str,
    timeout_ms: u64,
) -> eyre::Result<Address> {
    let address = azure.azure.address();

    std::fs::write(
        dir.join(metadata_file_name(address)),
        formatdoc! {r#"
            [signing]
            type = "azure-signer"
            key-vault-name = "ethsigner-tests"
            key-name = "{key_name}"
            key-version = "{key_version}"
            client-id = "47efee5c-8079-4b48-bbaa-ff2bd9e6c0bb"
            client-secret = "{client_secret}"
            vault-url = "{url}"
            authority-host = "{url}"
            timeout = {timeout_ms}
        "#,
            key_name = fake_azure::KEY_NAME,
            key_version = fake_azure::KEY_VERSION,
            url = azure.url(),
        },
    )?;

    Ok(address)
}

pub fn write_hashicorp_identity(
    dir: &Path,
    address: Address,
    local_addr: SocketAddr,
    timeout_ms: u64,
) -> eyre::Result<()> {
    std::fs::write(dir.join("vault-token"), fake_hashicorp::VAULT_TOKEN)?;

    std::fs::write(
        dir.join(metadata_file_name(address)),
        formatdoc! {r#"
            [signing]
            type = "hashicorp-signer"
            signing-key-path = "{path}"
            host = "{host}"
            port = {port}
            auth-file = "vault-token"
            timeout = {timeout_ms}
        "#,
            path = fake_hashicorp::SECRET_PATH,
            host = local_addr.ip(),
            port = local_addr.port(),
        },
    )?;

    Ok(())
}

pub fn address_of(private_key: &[u8]) -> eyre::Result<Address> {
    Ok(LocalWallet::from(SigningKey::from_slice(private_key)?).address())
}
