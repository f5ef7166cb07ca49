use std::time::Duration;

use ethers::core::k256::ecdsa::SigningKey;
use ethers::core::types::transaction::eip2718::TypedTransaction;
use ethers::core::types::transaction::eip712::Eip712;
use ethers::core::types::{Address, Signature as EthSig, H256};
use ethers::signers::{Signer, Wallet, WalletError};
use ethers::types::Bytes;
use thiserror::Error;

use super::azure::{AzureSigner, AzureSignerError};

/// A signing identity, whichever backend holds its key.
///
/// File based and HashiCorp identities end up as an in-memory wallet, Azure
/// identities keep delegating every signature to the vault.
#[derive(Debug)]
pub enum UniversalSigner {
    Local(Wallet<SigningKey>),
    Azure(AzureSigner),
}

impl UniversalSigner {
    /// Signs a 32 byte digest, `v` is the bare recovery id plus 27
    pub async fn sign_hash(
        &self,
        digest: H256,
    ) -> Result<EthSig, UniversalError> {
        Ok(match self {
            Self::Local(signer) => signer.sign_hash(digest)?,
            Self::Azure(signer) => signer.sign_hash(digest).await?,
        })
    }

    pub async fn raw_signed_tx(
        &self,
        tx: &TypedTransaction,
    ) -> Result<Bytes, UniversalError> {
        let signature = self.sign_transaction(tx).await?;

        Ok(tx.rlp_signed(&signature))
    }

    /// Upper bound for a single signing operation, `None` for local keys
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Local(_) => None,
            Self::Azure(signer) => Some(signer.signing_timeout()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Azure(_) => "azure",
        }
    }
}

#[derive(Debug, Error)]
pub enum UniversalError {
    #[error("Azure Signer Error: {0}")]
    Azure(#[from] AzureSignerError),
    #[error("Local Signer Error: {0}")]
    Local(#[from] WalletError),
}

#[async_trait::async_trait]
impl Signer for UniversalSigner {
    type Error = UniversalError;

    async fn sign_message<S: Send + Sync + AsRef<[u8]>>(
        &self,
        message: S,
    ) -> Result<EthSig, Self::Error> {
        Ok(match self {
            Self::Azure(signer) => signer.sign_message(message).await?,
            Self::Local(signer) => signer.sign_message(message).await?,
        })
    }

    async fn sign_transaction(
        &self,
        tx: &TypedTransaction,
    ) -> Result<EthSig, Self::Error> {
        Ok(match self {
            Self::Azure(signer) => signer.sign_transaction(tx).await?,
            Self::Local(signer) => signer.sign_transaction(tx).await?,
        })
    }

    async fn sign_typed_data<T: Eip712 + Send + Sync>(
        &self,
        payload: &T,
    ) -> Result<EthSig, Self::Error> {
        Ok(match self {
            Self::Azure(signer) => signer.sign_typed_data(payload).await?,
            Self::Local(signer) => signer.sign_typed_data(payload).await?,
        })
    }

    fn address(&self) -> Address {
        match self {
            Self::Azure(signer) => signer.address(),
            Self::Local(signer) => signer.address(),
        }
    }

    /// Returns the signer's chain id
    fn chain_id(&self) -> u64 {
        match self {
            Self::Azure(signer) => signer.chain_id(),
            Self::Local(signer) => signer.chain_id(),
        }
    }

    /// Sets the signer's chain id
    fn with_chain_id<T: Into<u64>>(self, chain_id: T) -> Self {
        match self {
            Self::Azure(signer) => Self::Azure(signer.with_chain_id(chain_id)),
            Self::Local(signer) => Self::Local(signer.with_chain_id(chain_id)),
        }
    }
}
