//! Address to signer index.
//!
//! The registry is built from an explicit scan of the metadata directory.
//! Backends are instantiated on first use, at most once per address, and
//! cached until a reload replaces their metadata.
//!
//! Files that do not name their address are instantiated at load. When that
//! fails for a reason that may go away, the file is kept as pending and
//! retried whenever an address is missed or the accounts are listed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ethers::signers::Signer;
use ethers::types::Address;
use eyre::Context;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};

use crate::keys::{file_based, BackendError, BackendFactory, UniversalSigner};
use crate::metadata::{
    MetadataFile, MetadataFileError, MetadataStore, SigningMetadata,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no signing identity for {0:?}")]
    NotFound(Address),

    #[error("signing backend for {address:?} failed: {source}")]
    Backend {
        address: Address,
        source: BackendError,
    },
}

#[derive(Debug)]
pub struct RegistryEntry {
    pub source: PathBuf,
    pub metadata: SigningMetadata,
    signer: OnceCell<Arc<UniversalSigner>>,
}

impl RegistryEntry {
    fn new(
        source: PathBuf,
        metadata: SigningMetadata,
        signer: Option<Arc<UniversalSigner>>,
    ) -> Self {
        Self {
            source,
            metadata,
            signer: OnceCell::new_with(signer),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.signer.initialized()
    }

    /// Instantiates the backend once, checking it holds the key of
    /// `address`. Failures leave the cell empty.
    async fn realize(
        &self,
        factory: &dyn BackendFactory,
        address: Address,
    ) -> Result<Arc<UniversalSigner>, BackendError> {
        let signer = self
            .signer
            .get_or_try_init(|| async {
                let signer = factory.create(&self.metadata).await?;

                if signer.address() != address {
                    return Err(BackendError::AddressMismatch {
                        expected: address,
                        actual: signer.address(),
                    });
                }

                tracing::info!(
                    ?address,
                    kind = self.metadata.kind(),
                    "Signing backend ready"
                );

                Ok(Arc::new(signer))
            })
            .await?;

        Ok(signer.clone())
    }
}

/// A valid metadata file whose address is not known yet
#[derive(Debug)]
struct PendingEntry {
    source: PathBuf,
    metadata: SigningMetadata,
    address: OnceCell<Address>,
}

#[derive(Debug)]
pub enum LoadRejection {
    Invalid(MetadataFileError),
    Duplicate { address: Address, first: PathBuf },
    Unrealized(BackendError),
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<Address>,
    /// Files kept for a later attempt after a retryable backend failure
    pub pending: Vec<PathBuf>,
    pub rejected: Vec<(PathBuf, LoadRejection)>,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    entries: HashMap<Address, Arc<RegistryEntry>>,
    pending: Vec<Arc<PendingEntry>>,
}

type SharedSnapshot = Arc<RwLock<Arc<Snapshot>>>;

pub struct SignerRegistry {
    store: MetadataStore,
    factory: Arc<dyn BackendFactory>,
    snapshot: SharedSnapshot,
}

impl SignerRegistry {
    /// An empty registry, nothing is signable until `reload` runs
    pub fn new(store: MetadataStore, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            store,
            factory,
            snapshot: Arc::new(RwLock::new(Arc::default())),
        }
    }

    pub async fn load(
        store: MetadataStore,
        factory: Arc<dyn BackendFactory>,
    ) -> eyre::Result<Self> {
        let registry = Self::new(store, factory);
        registry.reload().await?;

        Ok(registry)
    }

    /// Rescans the metadata directory and swaps in the new index.
    ///
    /// Files are visited in name order and the first file claiming an
    /// address wins. Entries whose metadata did not change keep their
    /// instantiated backend. Fails only when the directory itself cannot be
    /// read, in which case the current index stays in place.
    pub async fn reload(&self) -> eyre::Result<LoadReport> {
        let directory = self.store.directory().display().to_string();
        let files = self.store.scan().with_context(|| {
            format!("Failed to read metadata directory {directory}")
        })?;

        let current = self.snapshot().await;
        let mut next = Snapshot::default();
        let mut report = LoadReport::default();

        for file in files {
            let file = match file {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "Skipping invalid metadata file"
                    );
                    let path = err.path().to_owned();
                    report.rejected.push((path, LoadRejection::Invalid(err)));
                    continue;
                }
            };

            let (address, entry) = match self.identify(&current, &file).await {
                Ok(identified) => identified,
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        path = %file.path.display(),
                        error = %err,
                        "Signing backend not reachable, will retry on use"
                    );
                    report.pending.push(file.path.clone());
                    next.pending.push(Arc::new(PendingEntry {
                        source: file.path,
                        metadata: file.metadata,
                        address: OnceCell::new(),
                    }));
                    continue;
                }
                Err(err) => {
                    tracing::warn!(
                        path = %file.path.display(),
                        error = %err,
                        "Skipping metadata file without a known address"
                    );
                    report
                        .rejected
                        .push((file.path, LoadRejection::Unrealized(err)));
                    continue;
                }
            };

            if let Some(first) = next.entries.get(&address) {
                tracing::warn!(
                    ?address,
                    path = %file.path.display(),
                    first = %first.source.display(),
                    "Rejecting duplicate signing identity"
                );
                report.rejected.push((
                    file.path,
                    LoadRejection::Duplicate {
                        address,
                        first: first.source.clone(),
                    },
                ));
                continue;
            }

            report.loaded.push(address);
            next.entries.insert(address, entry);
        }

        tracing::info!(
            directory,
            loaded = report.loaded.len(),
            pending = report.pending.len(),
            rejected = report.rejected.len(),
            "Loaded signing identities"
        );

        *self.snapshot.write().await = Arc::new(next);

        Ok(report)
    }

    /// Works out the address of a metadata file.
    ///
    /// In order: the file name, an unchanged entry of the current index,
    /// the `address` field of a keystore file and finally instantiating
    /// the backend, whose signer is then kept.
    async fn identify(
        &self,
        current: &Snapshot,
        file: &MetadataFile,
    ) -> Result<(Address, Arc<RegistryEntry>), BackendError> {
        let unchanged = |address: &Address| {
            current.entries.get(address).filter(|entry| {
                entry.source == file.path && entry.metadata == file.metadata
            })
        };

        let declared = file.declared_address.or_else(|| {
            current
                .entries
                .keys()
                .find(|address| unchanged(*address).is_some())
                .copied()
        });

        let declared = declared.or_else(|| match &file.metadata {
            SigningMetadata::FileBased(metadata) => {
                file_based::keystore_address(&metadata.key_file)
            }
            _ => None,
        });

        if let Some(address) = declared {
            let entry = match unchanged(&address) {
                Some(entry) => entry.clone(),
                None => Arc::new(RegistryEntry::new(
                    file.path.clone(),
                    file.metadata.clone(),
                    None,
                )),
            };

            return Ok((address, entry));
        }

        let signer = self.factory.create(&file.metadata).await?;
        let address = signer.address();
        let entry = RegistryEntry::new(
            file.path.clone(),
            file.metadata.clone(),
            Some(Arc::new(signer)),
        );

        Ok((address, Arc::new(entry)))
    }

    async fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    /// Returns the signer for an address, instantiating it on first use.
    ///
    /// Concurrent first resolutions of one address share a single backend
    /// instantiation. A failed instantiation is not cached, the next call
    /// tries again. The instantiation runs on its own task and completes
    /// even if the caller goes away.
    pub async fn resolve(
        &self,
        address: Address,
    ) -> Result<Arc<UniversalSigner>, RegistryError> {
        let entry = match self.entry(address).await {
            Some(entry) => entry,
            None => {
                self.retry_pending().await;
                self.entry(address)
                    .await
                    .ok_or(RegistryError::NotFound(address))?
            }
        };

        if let Some(signer) = entry.signer.get() {
            return Ok(signer.clone());
        }

        let factory = self.factory.clone();
        let task = tokio::spawn(async move {
            entry.realize(factory.as_ref(), address).await
        });

        let result = task.await.unwrap_or_else(|err| {
            Err(BackendError::Unavailable(format!(
                "instantiation task failed: {err}"
            )))
        });

        result.map_err(|source| {
            tracing::warn!(
                ?address,
                error = %source,
                retryable = source.is_retryable(),
                "Failed to instantiate signing backend"
            );

            RegistryError::Backend { address, source }
        })
    }

    /// Attempts every pending file once more, each on its own task.
    ///
    /// A file whose backend comes up is moved into the index unless another
    /// file already claims its address. Files that still fail stay pending.
    async fn retry_pending(&self) {
        let pending = self.snapshot().await.pending.clone();
        if pending.is_empty() {
            return;
        }

        let tasks = pending.into_iter().map(|pending| {
            let snapshot = self.snapshot.clone();
            let factory = self.factory.clone();

            tokio::spawn(async move {
                let result =
                    realize_pending(&snapshot, factory.as_ref(), &pending)
                        .await;
                (pending, result)
            })
        });

        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((pending, Err(err))) => tracing::warn!(
                    path = %pending.source.display(),
                    error = %err,
                    "Pending signing backend still not reachable"
                ),
                Err(err) => tracing::error!(
                    error = %err,
                    "Pending signing backend task failed"
                ),
            }
        }
    }

    /// All signable addresses, sorted, whether or not their backend exists
    /// yet
    pub async fn list(&self) -> Vec<Address> {
        self.retry_pending().await;

        let mut addresses = self
            .snapshot()
            .await
            .entries
            .keys()
            .copied()
            .collect::<Vec<_>>();
        addresses.sort();
        addresses
    }

    pub async fn contains(&self, address: Address) -> bool {
        self.snapshot().await.entries.contains_key(&address)
    }

    pub async fn entry(&self, address: Address) -> Option<Arc<RegistryEntry>> {
        self.snapshot().await.entries.get(&address).cloned()
    }

    /// Number of files waiting for their backend to come up
    pub async fn pending(&self) -> usize {
        self.snapshot().await.pending.len()
    }
}

/// Instantiates a pending file at most once and promotes it into the index.
///
/// Promotion only happens while the file is still part of the current
/// snapshot, so a reload that raced with it wins.
async fn realize_pending(
    snapshot: &SharedSnapshot,
    factory: &dyn BackendFactory,
    pending: &Arc<PendingEntry>,
) -> Result<Address, BackendError> {
    let address = pending
        .address
        .get_or_try_init(|| async {
            let signer = factory.create(&pending.metadata).await?;
            let address = signer.address();

            let mut current = snapshot.write().await;
            if !current.pending.iter().any(|p| Arc::ptr_eq(p, pending)) {
                return Ok(address);
            }

            let mut next = Snapshot::clone(&current);
            next.pending.retain(|p| !Arc::ptr_eq(p, pending));

            match next.entries.get(&address) {
                Some(first) => tracing::warn!(
                    ?address,
                    path = %pending.source.display(),
                    first = %first.source.display(),
                    "Rejecting duplicate signing identity"
                ),
                None => {
                    tracing::info!(
                        ?address,
                        path = %pending.source.display(),
                        kind = pending.metadata.kind(),
                        "Pending signing backend ready"
                    );
                    next.entries.insert(
                        address,
                        Arc::new(RegistryEntry::new(
                            pending.source.clone(),
                            pending.metadata.clone(),
                            Some(Arc::new(signer)),
                        )),
                    );
                }
            }

            *current = Arc::new(next);

            Ok::<_, BackendError>(address)
        })
        .await?;

    Ok(*address)
}
