use std::path::Path;

use ethers::core::k256::ecdsa::SigningKey;
use ethers::signers::{LocalWallet, Wallet};
use ethers::types::Address;
use serde::Deserialize;

use super::BackendError;
use crate::metadata::FileBasedMetadata;
use crate::types::SecretString;

#[derive(Debug, Deserialize)]
struct KeystoreHeader {
    #[serde(default)]
    address: Option<String>,
}

/// Decrypts the V3 keystore referenced by the metadata.
///
/// The password is the first line of the password file. Decryption runs on
/// the blocking pool since the key derivation is deliberately expensive.
pub async fn load_wallet(
    metadata: &FileBasedMetadata,
) -> Result<Wallet<SigningKey>, BackendError> {
    let password = read_password(&metadata.password_file).await?;
    let key_file = metadata.key_file.clone();

    if !tokio::fs::try_exists(&key_file).await.unwrap_or(false) {
        return Err(BackendError::Io {
            path: key_file,
            source: std::io::ErrorKind::NotFound.into(),
        });
    }

    let wallet = tokio::task::spawn_blocking(move || {
        LocalWallet::decrypt_keystore(&key_file, password.expose())
    })
    .await
    .map_err(|err| BackendError::Unavailable(err.to_string()))??;

    tracing::debug!(
        key_file = %metadata.key_file.display(),
        "Decrypted keystore"
    );

    Ok(wallet)
}

/// Reads the `address` field keystores written by geth carry, without
/// decrypting anything.
pub fn keystore_address(key_file: &Path) -> Option<Address> {
    let text = std::fs::read_to_string(key_file).ok()?;
    let header: KeystoreHeader = serde_json::from_str(&text).ok()?;
    let address = header.address?;
    let address = address.strip_prefix("0x").unwrap_or(&address);

    let bytes = hex::decode(address).ok()?;
    (bytes.len() == Address::len_bytes()).then(|| Address::from_slice(&bytes))
}

async fn read_password(path: &Path) -> Result<SecretString, BackendError> {
    let contents =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| BackendError::Io {
                path: path.to_owned(),
                source,
            })?;

    let password = contents.lines().next().unwrap_or_default();

    Ok(SecretString::from(password))
}
