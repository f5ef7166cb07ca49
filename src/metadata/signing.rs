use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::types::SecretString;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com/";

/// The `[signing]` table of a metadata file.
///
/// The `type` key selects the backend, every other key is specific to
/// that backend.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr,
)]
#[serde(tag = "type")]
pub enum SigningMetadata {
    #[serde(rename = "file-based-signer")]
    #[strum(serialize = "file-based-signer")]
    FileBased(FileBasedMetadata),

    #[serde(rename = "azure-signer")]
    #[strum(serialize = "azure-signer")]
    Azure(AzureMetadata),

    #[serde(rename = "hashicorp-signer")]
    #[strum(serialize = "hashicorp-signer")]
    Hashicorp(HashicorpMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileBasedMetadata {
    pub key_file: PathBuf,
    pub password_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AzureMetadata {
    pub key_vault_name: String,
    pub key_name: String,
    pub key_version: String,
    pub client_id: String,
    pub client_secret: SecretString,

    /// Discovered from the vault's authentication challenge when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Defaults to `https://{key-vault-name}.vault.azure.net/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_host: Option<String>,

    /// Per request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HashicorpMetadata {
    pub signing_key_path: String,
    pub host: String,
    pub port: u16,
    pub auth_file: PathBuf,

    /// Per request timeout in milliseconds
    pub timeout: u64,

    #[serde(default)]
    pub tls_enabled: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("field `{0}` must not be empty")]
    Empty(&'static str),

    #[error("field `{0}` must be greater than zero")]
    Zero(&'static str),

    #[error("field `{field}` is not a valid url: {source}")]
    InvalidUrl {
        field: &'static str,
        source: url::ParseError,
    },
}

impl SigningMetadata {
    pub fn kind(&self) -> &str {
        self.as_ref()
    }

    /// Checks every field required by the backend kind without touching
    /// the filesystem or the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::FileBased(metadata) => {
                non_empty_path("key-file", &metadata.key_file)?;
                non_empty_path("password-file", &metadata.password_file)?;
            }
            Self::Azure(metadata) => {
                non_empty("key-vault-name", &metadata.key_vault_name)?;
                non_empty("key-name", &metadata.key_name)?;
                non_empty("key-version", &metadata.key_version)?;
                non_empty("client-id", &metadata.client_id)?;
                non_empty("client-secret", metadata.client_secret.expose())?;

                if let Some(tenant_id) = &metadata.tenant_id {
                    non_empty("tenant-id", tenant_id)?;
                }

                if metadata.timeout == Some(0) {
                    return Err(ConfigError::Zero("timeout"));
                }

                metadata.vault_url()?;
                metadata.authority_host()?;
            }
            Self::Hashicorp(metadata) => {
                non_empty("signing-key-path", &metadata.signing_key_path)?;
                non_empty("host", &metadata.host)?;
                non_empty_path("auth-file", &metadata.auth_file)?;

                if metadata.port == 0 {
                    return Err(ConfigError::Zero("port"));
                }

                if metadata.timeout == 0 {
                    return Err(ConfigError::Zero("timeout"));
                }

                metadata.secret_url()?;
            }
        }

        Ok(())
    }

    /// Resolves relative file references against the directory holding
    /// the metadata file.
    pub fn resolve_paths(self, base_dir: &Path) -> Self {
        match self {
            Self::FileBased(metadata) => Self::FileBased(FileBasedMetadata {
                key_file: resolve(base_dir, metadata.key_file),
                password_file: resolve(base_dir, metadata.password_file),
            }),
            Self::Hashicorp(metadata) => Self::Hashicorp(HashicorpMetadata {
                auth_file: resolve(base_dir, metadata.auth_file),
                ..metadata
            }),
            azure @ Self::Azure(_) => azure,
        }
    }
}

impl AzureMetadata {
    pub fn vault_url(&self) -> Result<Url, ConfigError> {
        let url = match &self.vault_url {
            Some(url) => url.clone(),
            None => format!("https://{}.vault.azure.net/", self.key_vault_name),
        };

        parse_base_url("vault-url", &url)
    }

    pub fn authority_host(&self) -> Result<Url, ConfigError> {
        let url = self
            .authority_host
            .as_deref()
            .unwrap_or(DEFAULT_AUTHORITY_HOST);

        parse_base_url("authority-host", url)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

impl HashicorpMetadata {
    pub fn secret_url(&self) -> Result<Url, ConfigError> {
        let scheme = if self.tls_enabled { "https" } else { "http" };
        let path = if self.signing_key_path.starts_with('/') {
            self.signing_key_path.clone()
        } else {
            format!("/{}", self.signing_key_path)
        };

        let url = format!("{scheme}://{}:{}{path}", self.host, self.port);

        Url::parse(&url).map_err(|source| ConfigError::InvalidUrl {
            field: "host",
            source,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

fn parse_base_url(field: &'static str, url: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(url)
        .map_err(|source| ConfigError::InvalidUrl { field, source })?;

    // `Url::join` replaces the last segment unless the base ends with a slash
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty(field));
    }

    Ok(())
}

fn non_empty_path(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::Empty(field));
    }

    Ok(())
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() || path.as_os_str().is_empty() {
        path
    } else {
        base_dir.join(path)
    }
}
