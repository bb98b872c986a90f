use async_trait::async_trait;
use serde::Deserialize;

use crate::{GatewayError, Result};

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    async fn embed_single(&self, text: String) -> Result<Vec<f32>> {
        let embeddings = self.embed(vec![text]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Internal("embedding response is empty".to_string()))
    }
}

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Embeddings client for the OpenAI `/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbeddings {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingsItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsItem {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddings {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
                "dimensions": self.dimensions,
            }))
            .send()
            .await
            .map_err(|err| GatewayError::Internal(format!("embedding request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Internal(format!(
                "embedding request failed (status {status}): {body}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::Internal(format!("invalid embedding response: {err}")))?;
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn embeds_against_the_embeddings_endpoint() -> Result<()> {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/embeddings")
                    .header("authorization", "Bearer test-key")
                    .json_body_partial(r#"{"model":"text-embedding-3-small","dimensions":4}"#);
                then.status(200).json_body(serde_json::json!({
                    "data": [{ "embedding": [0.1, 0.2, 0.3, 0.4] }]
                }));
            })
            .await;

        let client = OpenAiEmbeddings::new("test-key", "text-embedding-3-small", 4)
            .with_base_url(server.url("/v1"));
        let embedding = client.embed_single("ping".to_string()).await?;

        mock.assert_async().await;
        assert_eq!(embedding.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn non_success_status_surfaces_as_internal_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(500).body("upstream exploded");
            })
            .await;

        let client =
            OpenAiEmbeddings::new("k", "text-embedding-3-small", 4).with_base_url(server.url("/v1"));
        let err = client.embed_single("ping".to_string()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert!(err.to_string().contains("500"));
    }
}
