//! JSON-RPC 2.0 envelope and the error codes the proxy answers with.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::keys::BackendError;
use crate::registry::RegistryError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: Value, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(flatten)]
    pub payload: JsonRpcPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonRpcPayload {
    Result(Value),
    Error(JsonRpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} ({code})")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: JsonRpcPayload::Result(result),
        }
    }

    pub fn error(id: Value, error: impl Into<JsonRpcError>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: JsonRpcPayload::Error(error.into()),
        }
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = id;
        self
    }

    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.payload {
            JsonRpcPayload::Result(value) => Ok(value),
            JsonRpcPayload::Error(error) => Err(error),
        }
    }
}

/// Every error the proxy itself answers with.
///
/// Codes of the standard range follow JSON-RPC 2.0, the signing specific
/// codes live in the server error range starting at -32000.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("Parse error")]
    Parse,

    #[error("Invalid request")]
    InvalidRequest,

    #[error("Method not found")]
    MethodNotFound,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error")]
    Internal,

    #[error("Unknown signing address")]
    UnknownAddress,

    #[error("Signing backend authentication failed")]
    Authentication,

    #[error("Signing backend timed out")]
    Timeout,

    #[error("Signing backend unavailable")]
    Unavailable,

    #[error("Failed to connect to upstream node")]
    Upstream,
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams(_) => -32602,
            Self::Internal => -32603,
            Self::UnknownAddress => -32000,
            Self::Authentication => -32001,
            Self::Timeout => -32002,
            Self::Unavailable => -32003,
            Self::Upstream => -32004,
        }
    }

    pub fn invalid_params(message: impl std::fmt::Display) -> Self {
        Self::InvalidParams(message.to_string())
    }
}

impl From<RpcError> for JsonRpcError {
    fn from(error: RpcError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            data: None,
        }
    }
}

impl From<&BackendError> for RpcError {
    fn from(error: &BackendError) -> Self {
        match error {
            BackendError::Authentication(_) => Self::Authentication,
            BackendError::Timeout => Self::Timeout,
            _ => Self::Unavailable,
        }
    }
}

impl From<RegistryError> for RpcError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotFound(_) => Self::UnknownAddress,
            RegistryError::Backend { source, .. } => Self::from(&source),
        }
    }
}
