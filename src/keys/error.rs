use std::path::PathBuf;

use ethers::signers::WalletError;
use ethers::types::Address;
use thiserror::Error;

use super::azure::AzureSignerError;
use super::universal_signer::UniversalError;
use crate::metadata::ConfigError;

/// Failure to instantiate a backend or to sign with it.
///
/// `Config` and `AddressMismatch` need an operator to fix the metadata,
/// every other variant may succeed on the next attempt.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid signing metadata: {0}")]
    Config(#[from] ConfigError),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("request timed out")]
    Timeout,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("keystore error: {0}")]
    Keystore(#[from] WalletError),

    #[error("backend key belongs to {actual:?}, expected {expected:?}")]
    AddressMismatch { expected: Address, actual: Address },

    #[error("signing failed: {0}")]
    Signing(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::AddressMismatch { .. })
    }

    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl From<AzureSignerError> for BackendError {
    fn from(err: AzureSignerError) -> Self {
        match err {
            AzureSignerError::Authentication(reason) => {
                Self::Authentication(reason)
            }
            AzureSignerError::Http(err) => Self::from_http(err),
            AzureSignerError::Config(err) => Self::Config(err),
            err @ AzureSignerError::Vault { .. } => {
                Self::Unavailable(err.to_string())
            }
            err => Self::Signing(err.to_string()),
        }
    }
}

impl From<UniversalError> for BackendError {
    fn from(err: UniversalError) -> Self {
        match err {
            UniversalError::Azure(err) => err.into(),
            UniversalError::Local(err) => Self::Signing(err.to_string()),
        }
    }
}
