use super::{
    file_based, hashicorp, AzureSigner, BackendError, BackendFactory,
    UniversalSigner,
};
use crate::metadata::SigningMetadata;

/// Builds the real backends: keystore files, Azure Key Vault and HashiCorp
/// Vault.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

#[async_trait::async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(
        &self,
        metadata: &SigningMetadata,
    ) -> Result<UniversalSigner, BackendError> {
        metadata.validate()?;

        tracing::info!(kind = metadata.kind(), "Creating signing backend");

        let signer = match metadata {
            SigningMetadata::FileBased(metadata) => {
                UniversalSigner::Local(file_based::load_wallet(metadata).await?)
            }
            SigningMetadata::Azure(metadata) => {
                UniversalSigner::Azure(AzureSigner::connect(metadata).await?)
            }
            SigningMetadata::Hashicorp(metadata) => {
                UniversalSigner::Local(hashicorp::load_wallet(metadata).await?)
            }
        };

        Ok(signer)
    }
}
