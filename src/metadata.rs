//! Per identity metadata files.
//!
//! A metadata directory holds one TOML document per signing identity:
//!
//! ```toml
//! [signing]
//! type = "file-based-signer"
//! key-file = "/keys/78e6e236592597c09d5c137c2af40aecd42d12a2.json"
//! password-file = "/keys/password"
//! ```
//!
//! When the file name is an address (`78e6...d12a2.toml`, with or without
//! a `0x` prefix) that address is the identity's declared address and can
//! be listed before the backend is ever contacted.

use std::path::{Path, PathBuf};

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod signing;

pub use self::signing::{
    AzureMetadata, ConfigError, FileBasedMetadata, HashicorpMetadata,
    SigningMetadata,
};

const METADATA_EXTENSION: &str = "toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFile {
    pub path: PathBuf,
    pub declared_address: Option<Address>,
    pub metadata: SigningMetadata,
}

#[derive(Debug, Error)]
pub enum MetadataFileError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid metadata in {}: {source}", path.display())]
    Invalid { path: PathBuf, source: ConfigError },
}

impl MetadataFileError {
    pub fn path(&self) -> &Path {
        match self {
            Self::Io { path, .. }
            | Self::Parse { path, .. }
            | Self::Invalid { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataDocument {
    signing: SigningMetadata,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    directory: PathBuf,
}

impl MetadataStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Lists the metadata files of the directory in file name order.
    ///
    /// Only failing to read the directory itself is an error here, every
    /// file is parsed lazily and independently by the returned iterator.
    pub fn scan(
        &self,
    ) -> std::io::Result<
        impl Iterator<Item = Result<MetadataFile, MetadataFileError>>,
    > {
        let mut paths = vec![];

        for entry in std::fs::read_dir(&self.directory)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    tracing::warn!(
                        directory = %self.directory.display(),
                        error = %err,
                        "Skipping unreadable directory entry"
                    );
                    continue;
                }
            };

            if is_metadata_file(&path) {
                paths.push(path);
            }
        }

        paths.sort();

        Ok(paths.into_iter().map(|path| parse_file(&path)))
    }
}

pub fn parse_file(path: &Path) -> Result<MetadataFile, MetadataFileError> {
    let text =
        std::fs::read_to_string(path).map_err(|source| MetadataFileError::Io {
            path: path.to_owned(),
            source,
        })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let metadata = parse_str(&text, base_dir).map_err(|source| {
        MetadataFileError::Parse {
            path: path.to_owned(),
            source,
        }
    })?;

    metadata
        .validate()
        .map_err(|source| MetadataFileError::Invalid {
            path: path.to_owned(),
            source,
        })?;

    Ok(MetadataFile {
        path: path.to_owned(),
        declared_address: address_from_file_name(path),
        metadata,
    })
}

pub fn parse_str(
    text: &str,
    base_dir: &Path,
) -> Result<SigningMetadata, toml::de::Error> {
    let document: MetadataDocument = toml::from_str(text)?;

    Ok(document.signing.resolve_paths(base_dir))
}

pub fn address_from_file_name(path: &Path) -> Option<Address> {
    let stem = path.file_stem()?.to_str()?;
    let stem = stem
        .strip_prefix("0x")
        .or_else(|| stem.strip_prefix("0X"))
        .unwrap_or(stem);

    if stem.len() != 40 {
        return None;
    }

    let bytes = hex::decode(stem).ok()?;

    Some(Address::from_slice(&bytes))
}

fn is_metadata_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|extension| extension == METADATA_EXTENSION)
}
