use std::fmt;

use serde::{Deserialize, Serialize};

/// A credential that must never end up in logs.
///
/// Both `Debug` and `Display` redact the value, so metadata and config
/// structs holding one can be logged with `?config`.
#[derive(Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    #[must_use]
    pub fn new(str: String) -> Self {
        Self(str)
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("********")
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(********)")
    }
}

impl From<String> for SecretString {
    fn from(str: String) -> Self {
        Self::new(str)
    }
}

impl From<&str> for SecretString {
    fn from(str: &str) -> Self {
        Self::new(str.to_owned())
    }
}
