use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::model::{LanguageModel, StreamHandle};
use crate::types::{GenerateRequest, GenerateResponse, ProviderId, StreamChunk, Usage};
use crate::utils::sse::sse_data_stream;
use crate::{GatewayError, Result};

/// Chat-completions adapter for any OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiCompatibleModel {
    provider: ProviderId,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkWire {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleModel {
    pub fn new(
        provider: ProviderId,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, request: &GenerateRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| {
                serde_json::json!({
                    "role": message.role.as_str(),
                    "content": message.content,
                })
            })
            .collect();

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(request.model.clone()));
        body.insert("messages".to_string(), Value::Array(messages));
        if let Some(temperature) = request.temperature {
            if let Some(number) = serde_json::Number::from_f64(temperature) {
                body.insert("temperature".to_string(), Value::Number(number));
            }
        }
        if let Some(top_p) = request.top_p {
            if let Some(number) = serde_json::Number::from_f64(top_p) {
                body.insert("top_p".to_string(), Value::Number(number));
            }
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_string(), Value::Number(max_tokens.into()));
        }
        if !request.stop.is_empty() {
            body.insert(
                "stop".to_string(),
                Value::Array(request.stop.iter().cloned().map(Value::String).collect()),
            );
        }
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
            body.insert(
                "stream_options".to_string(),
                serde_json::json!({ "include_usage": true }),
            );
        }
        Value::Object(body)
    }

    async fn send(&self, request: &GenerateRequest, stream: bool) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request, stream))
            .send()
            .await
            .map_err(|err| GatewayError::Upstream {
                provider: self.provider,
                status: None,
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                provider: self.provider,
                status: Some(status.as_u16()),
                message: body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let response = self.send(&request, false).await?;
        let parsed: ChatResponse = response.json().await.map_err(|err| GatewayError::Upstream {
            provider: self.provider,
            status: None,
            message: format!("invalid completion response: {err}"),
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        let usage = parsed
            .usage
            .map(|usage| Usage::new(usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or_default();

        Ok(GenerateResponse { text, usage })
    }

    async fn stream(&self, request: GenerateRequest) -> Result<StreamHandle> {
        let response = self.send(&request, true).await?;
        let provider = self.provider;
        let (usage_tx, usage_rx) = oneshot::channel::<Usage>();

        let data = sse_data_stream(response);
        let chunks = stream::try_unfold(
            (data, Some(usage_tx), Usage::default()),
            move |(mut data, mut usage_tx, mut usage)| async move {
                loop {
                    match data.next().await {
                        Some(Ok(payload)) => {
                            let wire: ChunkWire = serde_json::from_str(&payload).map_err(|err| {
                                GatewayError::Upstream {
                                    provider,
                                    status: None,
                                    message: format!("invalid stream payload: {err}"),
                                }
                            })?;
                            if let Some(observed) = wire.usage {
                                usage =
                                    Usage::new(observed.prompt_tokens, observed.completion_tokens);
                            }
                            let delta = wire
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|choice| choice.delta.content)
                                .unwrap_or_default();
                            if delta.is_empty() {
                                continue;
                            }
                            return Ok(Some((
                                StreamChunk { delta },
                                (data, usage_tx, usage),
                            )));
                        }
                        Some(Err(err)) => return Err(err),
                        None => {
                            if let Some(tx) = usage_tx.take() {
                                let _ = tx.send(usage);
                            }
                            return Ok(None);
                        }
                    }
                }
            },
        )
        .boxed();

        Ok(StreamHandle {
            chunks,
            usage: usage_rx,
        })
    }
}
