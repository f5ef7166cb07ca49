use ethers::core::k256::ecdsa::SigningKey;
use ethers::signers::Wallet;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::instrument;

use super::utils::signing_key_from_hex;
use super::BackendError;
use crate::metadata::HashicorpMetadata;
use crate::types::SecretString;

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Debug, Deserialize)]
struct SecretResponse {
    data: SecretData,
}

/// KV version 2 nests the secret one level deeper than version 1
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SecretData {
    V2 { data: KeyValue },
    V1(KeyValue),
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    value: String,
}

impl SecretData {
    fn into_value(self) -> String {
        match self {
            Self::V2 { data } | Self::V1(data) => data.value,
        }
    }
}

/// Fetches the private key stored at `signing-key-path` and keeps it as an
/// in-memory wallet.
///
/// The request runs on a client owned by this identity and is bounded by
/// the configured timeout.
#[instrument(
    err,
    skip(metadata),
    fields(
        host = %metadata.host,
        port = metadata.port,
        path = %metadata.signing_key_path,
    )
)]
pub async fn load_wallet(
    metadata: &HashicorpMetadata,
) -> Result<Wallet<SigningKey>, BackendError> {
    let url = metadata.secret_url()?;
    let token = read_token(metadata).await?;

    let client = reqwest::Client::builder()
        .timeout(metadata.request_timeout())
        .build()
        .map_err(BackendError::from_http)?;

    let response = client
        .get(url)
        .header(TOKEN_HEADER, token.expose())
        .send()
        .await
        .map_err(BackendError::from_http)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();

        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                BackendError::Authentication(format!("{status}: {body}"))
            }
            _ => BackendError::Unavailable(format!(
                "secret server returned {status}: {body}"
            )),
        });
    }

    let secret: SecretResponse =
        response.json().await.map_err(BackendError::from_http)?;
    let key = SecretString::new(secret.data.into_value());

    let signing_key = signing_key_from_hex(key.expose()).map_err(|err| {
        BackendError::Signing(format!("invalid key in secret: {err}"))
    })?;

    Ok(Wallet::from(signing_key))
}

async fn read_token(
    metadata: &HashicorpMetadata,
) -> Result<SecretString, BackendError> {
    let contents = tokio::fs::read_to_string(&metadata.auth_file)
        .await
        .map_err(|source| BackendError::Io {
            path: metadata.auth_file.clone(),
            source,
        })?;

    Ok(SecretString::from(contents.trim()))
}
