use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::ingest::error::ProviderError;
use crate::ingest::providers::ProviderPayload;
use crate::ingest::types::{IngestionOptions, IngestionResult, Provider, ProviderContext};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin adapter over an upstream service that already speaks the normalized
/// payload. POSTs `{symbols, since, rag}`; the bearer key is optional.
pub struct HttpJsonProvider {
    id: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpJsonProvider {
    pub fn new(id: &str, endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building http client")?;
        Ok(Self {
            id: id.to_string(),
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl Provider for HttpJsonProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ingest(
        &self,
        ctx: &ProviderContext,
        opts: &IngestionOptions,
    ) -> Result<IngestionResult, ProviderError> {
        let body = json!({
            "symbols": opts.symbols,
            "since": opts.since,
            "rag": opts.rag_enabled,
        });
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &opts.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited {
                provider: ctx.provider_id().to_string(),
            });
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!(
                "{} answered {status}",
                self.endpoint
            )));
        }
        if status.is_client_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Validation(format!(
                "{} answered {status}: {}",
                self.endpoint,
                text.chars().take(200).collect::<String>()
            )));
        }

        let payload: ProviderPayload = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(payload.into_result(ctx.provider_id(), opts))
    }
}
