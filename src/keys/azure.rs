//! Azure Key Vault based Signer

use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ethers::core::k256::ecdsa::{
    Error as K256Error, Signature as KSig, VerifyingKey,
};
use ethers::core::types::transaction::eip2718::TypedTransaction;
use ethers::core::types::transaction::eip712::Eip712;
use ethers::core::types::{Address, Signature as EthSig, H256};
use ethers::core::utils::hash_message;
use ethers::utils::public_key_to_address;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use url::Url;

use super::utils::{
    apply_eip155, apply_legacy_v, sig_from_digest_bytes_trial_recovery,
};
use crate::metadata::{AzureMetadata, ConfigError};
use crate::types::SecretString;

const API_VERSION: &str = "7.4";
const VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const SIGNING_ALGORITHM: &str = "ES256K";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// Token and sign request, then both again after a rejected token
const SIGNING_ROUND_TRIPS: u32 = 4;

/// An ethers Signer that uses a secp256k1 key held in Azure Key Vault.
///
/// The private key never leaves the vault, every digest is sent to the
/// vault's `sign` operation. The public key (and with it the address) is
/// fetched once on instantiation, so `connect` is `async`.
///
/// Access tokens are obtained with the OAuth2 client credentials flow and
/// cached until shortly before they expire. A token the vault rejects is
/// dropped and the request is retried once with a fresh one.
pub struct AzureSigner {
    vault: KeyVaultClient,
    chain_id: u64,
    pubkey: VerifyingKey,
    address: Address,
}

impl std::fmt::Debug for AzureSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureSigner")
            .field("key_url", &self.vault.key_url.as_str())
            .field("client_id", &self.vault.client_id)
            .field("chain_id", &self.chain_id)
            .field("address", &self.address)
            .finish()
    }
}

/// Errors produced by the AzureSigner
#[derive(thiserror::Error, Debug)]
pub enum AzureSignerError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("key vault returned {status}: {body}")]
    Vault { status: StatusCode, body: String },
    #[error("unsupported key: {0}")]
    UnsupportedKey(String),
    #[error("{0}")]
    K256(#[from] K256Error),
    #[error("{0}")]
    Base64(#[from] base64::DecodeError),
    #[error("could not determine the tenant of the key vault")]
    UnknownTenant,
    #[error("signature does not recover to the vault key")]
    Recovery,
    /// Error type from Eip712Error message
    #[error("error encoding eip712 struct: {0:?}")]
    Eip712Error(String),
}

#[derive(Debug)]
struct AccessToken {
    value: SecretString,
    /// `None` when the lifetime does not fit an `Instant`, such a token is
    /// never considered fresh
    expires_at: Option<Instant>,
}

impl AccessToken {
    fn new(value: SecretString, expires_in: u64) -> Self {
        Self {
            value,
            expires_at: Instant::now()
                .checked_add(Duration::from_secs(expires_in)),
        }
    }

    fn is_fresh(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| {
            Instant::now() + TOKEN_EXPIRY_MARGIN < expires_at
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyBundle {
    key: JsonWebKey,
}

#[derive(Debug, Deserialize)]
struct JsonWebKey {
    kty: String,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    value: String,
}

/// The session with one vault key, owned by a single signer
struct KeyVaultClient {
    http: reqwest::Client,
    key_url: Url,
    sign_url: Url,
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
    token: Mutex<Option<AccessToken>>,
    timeout: Duration,
}

impl KeyVaultClient {
    async fn new(metadata: &AzureMetadata) -> Result<Self, AzureSignerError> {
        let timeout = metadata.request_timeout().unwrap_or(DEFAULT_TIMEOUT);
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        let vault_url = metadata.vault_url()?;
        let key_path =
            format!("keys/{}/{}", metadata.key_name, metadata.key_version);
        let key_url = join(&vault_url, "vault-url", &key_path)?;
        let sign_url =
            join(&vault_url, "vault-url", &format!("{key_path}/sign"))?;

        let tenant_id = match &metadata.tenant_id {
            Some(tenant_id) => tenant_id.clone(),
            None => discover_tenant(&http, &key_url).await?,
        };

        let token_url = join(
            &metadata.authority_host()?,
            "authority-host",
            &format!("{tenant_id}/oauth2/v2.0/token"),
        )?;

        Ok(Self {
            http,
            key_url,
            sign_url,
            token_url,
            client_id: metadata.client_id.clone(),
            client_secret: metadata.client_secret.clone(),
            token: Mutex::new(None),
            timeout,
        })
    }

    /// Returns a cached token or authenticates.
    ///
    /// The lock is held across the token request so concurrent callers of
    /// the same identity wait for one authentication instead of racing.
    async fn access_token(&self) -> Result<SecretString, AzureSignerError> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.value.clone());
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *cached = Some(token);

        Ok(value)
    }

    /// Drops the cached token, unless another caller already replaced the
    /// rejected one
    async fn invalidate_token(&self, rejected: &SecretString) {
        let mut cached = self.token.lock().await;

        if cached
            .as_ref()
            .is_some_and(|token| token.value.expose() == rejected.expose())
        {
            *cached = None;
        }
    }

    #[instrument(err, skip(self), fields(client_id = %self.client_id))]
    async fn request_token(&self) -> Result<AccessToken, AzureSignerError> {
        debug!("Requesting key vault access token");

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose()),
                ("scope", VAULT_SCOPE),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;

            let reason = match serde_json::from_str::<TokenErrorResponse>(&body)
            {
                Ok(err) => match err.error_description {
                    Some(description) => {
                        format!("{}: {description}", err.error)
                    }
                    None => err.error,
                },
                Err(_) => format!("{status}: {body}"),
            };

            return Err(if status.is_client_error() {
                AzureSignerError::Authentication(reason)
            } else {
                AzureSignerError::Vault { status, body }
            });
        }

        let token: TokenResponse = response.json().await?;

        Ok(AccessToken::new(
            SecretString::new(token.access_token),
            token.expires_in,
        ))
    }

    async fn send_with_token<F>(
        &self,
        build: &F,
    ) -> Result<(Response, SecretString), AzureSignerError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = build(token.expose()).send().await?;

        Ok((response, token))
    }

    async fn send_authorized<F>(
        &self,
        build: F,
    ) -> Result<Response, AzureSignerError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let (response, token) = self.send_with_token(&build).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        warn!(
            key_url = %self.key_url,
            "Key vault rejected access token, re-authenticating"
        );
        self.invalidate_token(&token).await;

        let (response, _) = self.send_with_token(&build).await?;

        check_status(response).await
    }

    #[instrument(err, skip(self), fields(key_url = %self.key_url))]
    async fn get_public_key(&self) -> Result<VerifyingKey, AzureSignerError> {
        debug!("Fetching key vault public key");

        let response = self
            .send_authorized(|token| {
                self.http
                    .get(self.key_url.clone())
                    .query(&[("api-version", API_VERSION)])
                    .bearer_auth(token)
            })
            .await?;

        let bundle: KeyBundle = response.json().await?;

        decode_jwk(&bundle.key)
    }

    #[instrument(
        err,
        skip(self, digest),
        fields(digest = %hex::encode(digest), key_url = %self.key_url)
    )]
    async fn sign_digest(
        &self,
        digest: [u8; 32],
    ) -> Result<KSig, AzureSignerError> {
        debug!("Dispatching sign");

        let request = SignRequest {
            alg: SIGNING_ALGORITHM,
            value: URL_SAFE_NO_PAD.encode(digest),
        };

        let response = self
            .send_authorized(|token| {
                self.http
                    .post(self.sign_url.clone())
                    .query(&[("api-version", API_VERSION)])
                    .bearer_auth(token)
                    .json(&request)
            })
            .await?;

        let response: SignResponse = response.json().await?;
        let bytes = decode_base64url(&response.value)?;

        Ok(KSig::from_slice(&bytes)?)
    }
}

impl AzureSigner {
    /// Authenticates against the vault and derives the address from the
    /// vault key.
    pub async fn connect(
        metadata: &AzureMetadata,
    ) -> Result<AzureSigner, AzureSignerError> {
        let vault = KeyVaultClient::new(metadata).await?;
        let pubkey = vault.get_public_key().await?;
        let address = public_key_to_address(&pubkey);

        debug!(
            key_url = %vault.key_url,
            ?address,
            "Instantiated Azure signer"
        );

        Ok(Self {
            vault,
            chain_id: 1,
            pubkey,
            address,
        })
    }

    pub fn signing_timeout(&self) -> Duration {
        self.vault.timeout * SIGNING_ROUND_TRIPS
    }

    /// Sign a digest, `v` is the recovery id plus 27
    pub async fn sign_hash(
        &self,
        digest: H256,
    ) -> Result<EthSig, AzureSignerError> {
        let mut sig = self.sign_recoverable(digest.into()).await?;
        apply_legacy_v(&mut sig);

        Ok(sig)
    }

    async fn sign_recoverable(
        &self,
        digest: [u8; 32],
    ) -> Result<EthSig, AzureSignerError> {
        let sig = self.vault.sign_digest(digest).await?;

        sig_from_digest_bytes_trial_recovery(&sig, digest, &self.pubkey)
            .ok_or(AzureSignerError::Recovery)
    }
}

#[async_trait::async_trait]
impl ethers::signers::Signer for AzureSigner {
    type Error = AzureSignerError;

    #[instrument(err, skip(message))]
    async fn sign_message<S: Send + Sync + AsRef<[u8]>>(
        &self,
        message: S,
    ) -> Result<EthSig, Self::Error> {
        let message_hash = hash_message(message.as_ref());

        self.sign_hash(message_hash).await
    }

    #[instrument(err)]
    async fn sign_transaction(
        &self,
        tx: &TypedTransaction,
    ) -> Result<EthSig, Self::Error> {
        let mut tx_with_chain = tx.clone();
        let chain_id = tx_with_chain
            .chain_id()
            .map(|id| id.as_u64())
            .unwrap_or(self.chain_id);
        tx_with_chain.set_chain_id(chain_id);

        let sighash = tx_with_chain.sighash();
        let mut sig = self.sign_recoverable(sighash.into()).await?;
        apply_eip155(&mut sig, chain_id);

        Ok(sig)
    }

    async fn sign_typed_data<T: Eip712 + Send + Sync>(
        &self,
        payload: &T,
    ) -> Result<EthSig, Self::Error> {
        let digest = payload
            .encode_eip712()
            .map_err(|e| Self::Error::Eip712Error(e.to_string()))?;

        self.sign_hash(H256::from(digest)).await
    }

    fn address(&self) -> Address {
        self.address
    }

    /// Returns the signer's chain id
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sets the signer's chain id
    fn with_chain_id<T: Into<u64>>(mut self, chain_id: T) -> Self {
        self.chain_id = chain_id.into();
        self
    }
}

async fn check_status(
    response: Response,
) -> Result<Response, AzureSignerError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AzureSignerError::Authentication(format!(
            "{status}: {body}"
        )));
    }

    Err(AzureSignerError::Vault { status, body })
}

/// Asks the vault who to authenticate with.
///
/// An unauthenticated request is answered with a bearer challenge naming
/// the authority, whose last path segment is the tenant.
#[instrument(err, skip(http))]
async fn discover_tenant(
    http: &reqwest::Client,
    key_url: &Url,
) -> Result<String, AzureSignerError> {
    let response = http
        .get(key_url.clone())
        .query(&[("api-version", API_VERSION)])
        .send()
        .await?;

    response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .and_then(tenant_from_challenge)
        .ok_or(AzureSignerError::UnknownTenant)
}

fn tenant_from_challenge(challenge: &str) -> Option<String> {
    let challenge = challenge.trim().strip_prefix("Bearer")?;

    challenge
        .split(',')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| {
            let key = key.trim();
            key == "authorization" || key == "authorization_uri"
        })
        .and_then(|(_, value)| Url::parse(value.trim().trim_matches('"')).ok())
        .and_then(|authority| {
            authority
                .path_segments()?
                .filter(|segment| !segment.is_empty())
                .last()
                .map(ToOwned::to_owned)
        })
}

fn decode_jwk(jwk: &JsonWebKey) -> Result<VerifyingKey, AzureSignerError> {
    let curve = jwk.crv.as_deref().unwrap_or_default();

    if !jwk.kty.starts_with("EC") || curve != "P-256K" {
        return Err(AzureSignerError::UnsupportedKey(format!(
            "kty {} crv {curve}",
            jwk.kty
        )));
    }

    let (Some(x), Some(y)) = (&jwk.x, &jwk.y) else {
        return Err(AzureSignerError::UnsupportedKey(
            "missing public key coordinates".to_string(),
        ));
    };

    let mut sec1 = vec![0x04];
    sec1.extend(decode_base64url(x)?);
    sec1.extend(decode_base64url(y)?);

    Ok(VerifyingKey::from_sec1_bytes(&sec1)?)
}

fn decode_base64url(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(value.trim_end_matches('='))
}

fn join(
    base: &Url,
    field: &'static str,
    path: &str,
) -> Result<Url, ConfigError> {
    base.join(path)
        .map_err(|source| ConfigError::InvalidUrl { field, source })
}
