use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::{Message, ProviderId, Role, RoutingStrategy, Usage};
use crate::{GatewayError, Result};

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    /// Routing hint; not part of the standard schema.
    #[serde(default)]
    pub routing_strategy: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::One(stop) => vec![stop],
            StopSequences::Many(stops) => stops,
        }
    }
}

pub fn parse_request(body: &[u8]) -> Result<ChatCompletionRequest> {
    let request: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|err| GatewayError::Validation(format!("malformed request body: {err}")))?;
    validate(&request)?;
    Ok(request)
}

fn validate(request: &ChatCompletionRequest) -> Result<()> {
    if request.model.trim().is_empty() {
        return Err(GatewayError::Validation("model is required".to_string()));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::Validation(
            "messages must not be empty".to_string(),
        ));
    }
    for (idx, message) in request.messages.iter().enumerate() {
        if Role::parse(&message.role).is_none() {
            return Err(GatewayError::Validation(format!(
                "messages[{idx}].role must be one of system, user, assistant, tool"
            )));
        }
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(GatewayError::Validation(
                "temperature must be between 0 and 2".to_string(),
            ));
        }
    }
    if let Some(top_p) = request.top_p {
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(GatewayError::Validation(
                "top_p must be in (0, 1]".to_string(),
            ));
        }
    }
    if request.max_tokens == Some(0) {
        return Err(GatewayError::Validation(
            "max_tokens must be at least 1".to_string(),
        ));
    }
    if let Some(strategy) = request.routing_strategy.as_deref() {
        if RoutingStrategy::parse(strategy).is_none() {
            return Err(GatewayError::Validation(format!(
                "unknown routing_strategy: {strategy}"
            )));
        }
    }
    Ok(())
}

pub fn to_messages(incoming: &[IncomingMessage]) -> Vec<Message> {
    incoming
        .iter()
        .filter_map(|message| {
            Role::parse(&message.role).map(|role| Message {
                role,
                content: message.content.clone(),
            })
        })
        .collect()
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn usage_value(usage: Usage) -> Value {
    serde_json::json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens(),
    })
}

pub struct ResponseMetadata {
    pub provider: Option<ProviderId>,
    pub cached: bool,
    pub attempts: usize,
}

pub fn completion_response(
    id: &str,
    model: &str,
    created: u64,
    text: &str,
    usage: Usage,
    metadata: ResponseMetadata,
) -> Value {
    let mut message = Map::<String, Value>::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));
    message.insert("content".to_string(), Value::String(text.to_string()));

    let mut choice = Map::<String, Value>::new();
    choice.insert("index".to_string(), Value::Number(0.into()));
    choice.insert("message".to_string(), Value::Object(message));
    choice.insert(
        "finish_reason".to_string(),
        Value::String("stop".to_string()),
    );

    let mut meta = Map::<String, Value>::new();
    meta.insert("cached".to_string(), Value::Bool(metadata.cached));
    if let Some(provider) = metadata.provider {
        meta.insert(
            "provider".to_string(),
            Value::String(provider.as_str().to_string()),
        );
    }
    meta.insert(
        "attempts".to_string(),
        Value::Number(metadata.attempts.into()),
    );

    let mut out = Map::<String, Value>::new();
    out.insert("id".to_string(), Value::String(id.to_string()));
    out.insert(
        "object".to_string(),
        Value::String("chat.completion".to_string()),
    );
    out.insert(
        "created".to_string(),
        Value::Number((created as i64).into()),
    );
    out.insert("model".to_string(), Value::String(model.to_string()));
    out.insert(
        "choices".to_string(),
        Value::Array(vec![Value::Object(choice)]),
    );
    out.insert("usage".to_string(), usage_value(usage));
    out.insert("metadata".to_string(), Value::Object(meta));

    Value::Object(out)
}

pub fn chunk_bytes(
    id: &str,
    model: &str,
    created: u64,
    delta_content: Option<&str>,
    finish_reason: Option<&str>,
) -> Bytes {
    let mut delta = Map::<String, Value>::new();
    if let Some(content) = delta_content {
        delta.insert("content".to_string(), Value::String(content.to_string()));
    }

    let mut choice = Map::<String, Value>::new();
    choice.insert("index".to_string(), Value::Number(0.into()));
    choice.insert("delta".to_string(), Value::Object(delta));
    choice.insert(
        "finish_reason".to_string(),
        match finish_reason {
            Some(reason) => Value::String(reason.to_string()),
            None => Value::Null,
        },
    );

    let mut out = Map::<String, Value>::new();
    out.insert("id".to_string(), Value::String(id.to_string()));
    out.insert(
        "object".to_string(),
        Value::String("chat.completion.chunk".to_string()),
    );
    out.insert(
        "created".to_string(),
        Value::Number((created as i64).into()),
    );
    out.insert("model".to_string(), Value::String(model.to_string()));
    out.insert(
        "choices".to_string(),
        Value::Array(vec![Value::Object(choice)]),
    );

    let json = Value::Object(out).to_string();
    Bytes::from(format!("data: {json}\n\n"))
}

pub fn done_bytes() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// The error envelope every non-2xx response carries.
pub fn error_body(error: &GatewayError) -> Value {
    let mut detail = Map::<String, Value>::new();
    detail.insert("message".to_string(), Value::String(error.to_string()));
    detail.insert(
        "type".to_string(),
        Value::String(error.error_type().to_string()),
    );
    detail.insert(
        "code".to_string(),
        Value::Number(error.http_status().into()),
    );

    match error {
        GatewayError::Timeout {
            timeout_ms,
            provider,
        } => {
            detail.insert("timeout_ms".to_string(), Value::Number((*timeout_ms).into()));
            if let Some(provider) = provider {
                detail.insert(
                    "provider".to_string(),
                    Value::String(provider.as_str().to_string()),
                );
            }
        }
        GatewayError::RateLimited { retry_after_ms } => {
            detail.insert(
                "retry_after_ms".to_string(),
                Value::Number((*retry_after_ms).into()),
            );
        }
        GatewayError::AllFailed { attempts } => {
            let mut providers: Vec<String> = Vec::new();
            for attempt in attempts {
                let name = attempt.provider.as_str().to_string();
                if !providers.contains(&name) {
                    providers.push(name);
                }
            }
            detail.insert(
                "providers_tried".to_string(),
                Value::Array(providers.into_iter().map(Value::String).collect()),
            );
            if let Some(last_error) = attempts.iter().rev().find_map(|a| a.error.clone()) {
                detail.insert("last_error".to_string(), Value::String(last_error));
            }
            detail.insert(
                "attempt_count".to_string(),
                Value::Number(attempts.len().into()),
            );
        }
        _ => {}
    }

    let mut out = Map::<String, Value>::new();
    out.insert("error".to_string(), Value::Object(detail));
    Value::Object(out)
}
