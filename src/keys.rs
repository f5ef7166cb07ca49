pub mod azure;
pub mod error;
pub mod factory;
pub mod file_based;
pub mod hashicorp;
pub mod universal_signer;
pub mod utils;

pub use self::azure::AzureSigner;
pub use self::error::BackendError;
pub use self::factory::DefaultBackendFactory;
pub use self::universal_signer::{UniversalError, UniversalSigner};
use crate::metadata::SigningMetadata;

#[async_trait::async_trait]
pub trait BackendFactory: Send + Sync + 'static {
    /// Instantiates the backend described by the metadata
    async fn create(
        &self,
        metadata: &SigningMetadata,
    ) -> Result<UniversalSigner, BackendError>;
}
