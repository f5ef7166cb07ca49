use std::time::Duration;

use eyre::Context;
use tracing::instrument;

use crate::config::UpstreamConfig;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

/// The node behind the proxy
#[async_trait::async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn forward(
        &self,
        request: JsonRpcRequest,
    ) -> eyre::Result<JsonRpcResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
    ) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build upstream client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> eyre::Result<Self> {
        Self::new(config.url.clone(), config.timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    #[instrument(skip(self, request), fields(method = %request.method))]
    async fn forward(
        &self,
        request: JsonRpcRequest,
    ) -> eyre::Result<JsonRpcResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("Failed to read upstream response")?;

        // Nodes answer JSON-RPC errors with non 2xx statuses too, so only
        // an unparsable body counts as a failure
        let response: JsonRpcResponse = serde_json::from_slice(&body)
            .with_context(|| {
                format!(
                    "Invalid upstream response ({status}): {}",
                    String::from_utf8_lossy(&body)
                )
            })?;

        Ok(response)
    }
}
