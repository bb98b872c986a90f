use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::core::{error_response, extract_header, request_id_from, AppState};
use crate::gateway::openai::{self, ResponseMetadata, StopSequences};
use crate::gateway::semantic_cache::params_fingerprint;
use crate::gateway::timeout::RequestDeadline;
use crate::model::{ChunkStream, StreamHandle};
use crate::stream::cancellable_stream;
use crate::types::{
    GenerateRequest, Message, ProviderId, RequestMetadata, RoutingStrategy, Usage,
};
use crate::utils::now_millis;
use crate::{GatewayError, Result};

pub(crate) async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from(&headers);
    state.counters.requests.fetch_add(1, Ordering::Relaxed);

    match handle(&state, &headers, &body, &request_id).await {
        Ok(response) => response,
        Err(error) => {
            state.counters.record_error(&error);
            warn!(request_id, %error, "chat dispatch failed");
            error_response(&error, &request_id)
        }
    }
}

async fn handle(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
    request_id: &str,
) -> Result<Response> {
    let request = openai::parse_request(body)?;

    let stop = request
        .stop
        .map(StopSequences::into_vec)
        .unwrap_or_default();
    let messages = openai::to_messages(&request.messages);
    let strategy_override = request
        .routing_strategy
        .as_deref()
        .and_then(RoutingStrategy::parse);

    let meta = RequestMetadata {
        model: request.model.clone(),
        messages: messages.clone(),
        stream: request.stream,
        strategy_override,
    };
    let generate = GenerateRequest {
        model: request.model.clone(),
        messages,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens,
        stop: stop.clone(),
    };
    let fingerprint = params_fingerprint(request.temperature, request.top_p, request.max_tokens, &stop);
    let query_text = cache_query_text(&generate.messages);

    let skip_cache = extract_header(headers, "x-skip-cache")
        .map(|value| !value.eq_ignore_ascii_case("false"))
        .unwrap_or(false);
    let use_cache = state.cache.is_some() && !skip_cache;

    let provider_hint = state.pricing.provider_for(&request.model);
    let timeout_ms = state.governor.resolve(
        extract_header(headers, "x-timeout-ms").as_deref(),
        provider_hint,
    );

    if let Some(cache) = state.cache.as_ref().filter(|_| use_cache) {
        match cache.lookup(&query_text, &request.model, &fingerprint).await {
            Ok(lookup) if lookup.hit => {
                state.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                info!(request_id, distance = lookup.distance, "semantic cache hit");
                let text = lookup.response.unwrap_or_default();
                return Ok(cached_response(
                    &request.model,
                    request.stream,
                    &text,
                    request_id,
                ));
            }
            Ok(_) => {
                state.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                // A broken cache never blocks dispatch.
                warn!(request_id, %error, "semantic cache lookup failed");
                state.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    let deadline = state.governor.arm(timeout_ms);
    let cache_args = use_cache.then(|| (query_text, fingerprint));

    if request.stream {
        dispatch_stream(
            state,
            &request.model,
            generate,
            &meta,
            deadline,
            timeout_ms,
            cache_args,
            request_id,
        )
        .await
    } else {
        dispatch_json(
            state,
            &request.model,
            generate,
            &meta,
            deadline,
            timeout_ms,
            cache_args,
            request_id,
        )
        .await
    }
}

/// The text key a completion is cached under. Covers the whole
/// conversation, not just the last user turn, so requests with different
/// context never collide.
fn cache_query_text(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(message.role.as_str());
        out.push_str(": ");
        out.push_str(&message.content);
    }
    out
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_json(
    state: &AppState,
    requested_model: &str,
    generate: GenerateRequest,
    meta: &RequestMetadata,
    deadline: RequestDeadline,
    timeout_ms: u64,
    cache_args: Option<(String, String)>,
    request_id: &str,
) -> Result<Response> {
    let models = state.models.clone();
    let token = deadline.token().clone();

    let outcome = state
        .selector
        .select_with_fallback(meta, deadline.token(), timeout_ms, move |candidate| {
            let models = models.clone();
            let token = token.clone();
            let mut generate = generate.clone();
            async move {
                let Some(model) = models.get(&candidate.provider).cloned() else {
                    return Err(GatewayError::Internal(format!(
                        "no adapter registered for {}",
                        candidate.provider
                    )));
                };
                generate.model = candidate.model.clone();
                tokio::select! {
                    _ = token.cancelled() => Err(GatewayError::Timeout {
                        timeout_ms,
                        provider: Some(candidate.provider),
                    }),
                    result = model.generate(generate) => result,
                }
            }
        })
        .await?;

    let response = outcome.value;
    let record = state.cost.record(outcome.provider, &outcome.model, response.usage);
    info!(
        request_id,
        provider = %outcome.provider,
        model = %outcome.model,
        attempts = outcome.attempts.len(),
        cost_usd = record.cost_usd,
        "chat completion served"
    );

    if let (Some((query_text, fingerprint)), Some(cache)) = (cache_args, state.cache.as_ref()) {
        if !response.text.is_empty() {
            if let Err(error) = cache
                .store(&query_text, requested_model, &fingerprint, &response.text)
                .await
            {
                warn!(request_id, %error, "semantic cache store failed");
            }
        }
    }

    let body = openai::completion_response(
        &openai::completion_id(),
        requested_model,
        now_millis() / 1000,
        &response.text,
        response.usage,
        ResponseMetadata {
            provider: Some(outcome.provider),
            cached: false,
            attempts: outcome.attempts.len(),
        },
    );

    let mut http_response = Json(body).into_response();
    let headers = http_response.headers_mut();
    insert_header(headers, "x-request-id", request_id);
    insert_header(headers, "x-cost-usd", &record.cost_usd.to_string());
    insert_header(headers, "x-input-tokens", &response.usage.input_tokens.to_string());
    insert_header(headers, "x-output-tokens", &response.usage.output_tokens.to_string());
    Ok(http_response)
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_stream(
    state: &AppState,
    requested_model: &str,
    generate: GenerateRequest,
    meta: &RequestMetadata,
    deadline: RequestDeadline,
    timeout_ms: u64,
    cache_args: Option<(String, String)>,
    request_id: &str,
) -> Result<Response> {
    let models = state.models.clone();
    let token = deadline.token().clone();

    let outcome = state
        .selector
        .select_with_fallback(meta, deadline.token(), timeout_ms, move |candidate| {
            let models = models.clone();
            let token = token.clone();
            let mut generate = generate.clone();
            async move {
                let Some(model) = models.get(&candidate.provider).cloned() else {
                    return Err(GatewayError::Internal(format!(
                        "no adapter registered for {}",
                        candidate.provider
                    )));
                };
                generate.model = candidate.model.clone();
                // Obtaining the handle is the commit point: failures before
                // this return are still eligible for failover, afterwards
                // the stream is non-resumable.
                tokio::select! {
                    _ = token.cancelled() => Err(GatewayError::Timeout {
                        timeout_ms,
                        provider: Some(candidate.provider),
                    }),
                    result = model.stream(generate) => result,
                }
            }
        })
        .await?;

    let StreamHandle { chunks, usage } = outcome.value;
    let chunks = cancellable_stream(chunks, deadline.token().clone());

    let dispatch = SseDispatch {
        chunks,
        usage,
        phase: SsePhase::Streaming,
        id: openai::completion_id(),
        envelope_model: requested_model.to_string(),
        created: now_millis() / 1000,
        state: state.clone(),
        provider: outcome.provider,
        resolved_model: outcome.model.clone(),
        request_id: request_id.to_string(),
        collected: String::new(),
        cache_args: cache_args.map(|(query, fingerprint)| {
            (query, requested_model.to_string(), fingerprint)
        }),
        deadline: Some(deadline),
        finalized: false,
    };

    let body_stream = futures_util::stream::unfold(dispatch, |mut dispatch| async move {
        loop {
            match dispatch.phase {
                SsePhase::Streaming => match dispatch.chunks.next().await {
                    Some(Ok(chunk)) => {
                        dispatch.collected.push_str(&chunk.delta);
                        let bytes = openai::chunk_bytes(
                            &dispatch.id,
                            &dispatch.envelope_model,
                            dispatch.created,
                            Some(&chunk.delta),
                            None,
                        );
                        return Some((Ok::<_, std::io::Error>(bytes), dispatch));
                    }
                    Some(Err(error)) => {
                        // Bytes already sent cannot be unsent; terminate the
                        // stream without a synthetic finish_reason.
                        warn!(request_id = %dispatch.request_id, %error, "upstream stream failed mid-flight");
                        dispatch.phase = SsePhase::Done;
                    }
                    None => {
                        dispatch.phase = SsePhase::Stop;
                    }
                },
                SsePhase::Stop => {
                    dispatch.phase = SsePhase::Done;
                    let bytes = openai::chunk_bytes(
                        &dispatch.id,
                        &dispatch.envelope_model,
                        dispatch.created,
                        None,
                        Some("stop"),
                    );
                    return Some((Ok(bytes), dispatch));
                }
                SsePhase::Done => {
                    dispatch.phase = SsePhase::Finalize;
                    return Some((Ok(openai::done_bytes()), dispatch));
                }
                SsePhase::Finalize => {
                    dispatch.finalize().await;
                    return None;
                }
            }
        }
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    let headers = response.headers_mut();
    insert_header(headers, "content-type", "text/event-stream");
    insert_header(headers, "cache-control", "no-cache");
    insert_header(headers, "x-request-id", request_id);
    Ok(response)
}

#[derive(Clone, Copy, Debug)]
enum SsePhase {
    Streaming,
    Stop,
    Done,
    Finalize,
}

struct SseDispatch {
    chunks: ChunkStream,
    usage: oneshot::Receiver<Usage>,
    phase: SsePhase,
    id: String,
    envelope_model: String,
    created: u64,
    state: AppState,
    provider: ProviderId,
    resolved_model: String,
    request_id: String,
    collected: String,
    cache_args: Option<(String, String, String)>,
    deadline: Option<RequestDeadline>,
    finalized: bool,
}

impl SseDispatch {
    /// Runs after the final chunk: resolve usage, record cost, feed the
    /// cache. Cost accounting for streams happens here and nowhere else.
    async fn finalize(&mut self) {
        self.finalized = true;

        let usage = match tokio::time::timeout(Duration::from_secs(2), &mut self.usage).await {
            Ok(Ok(usage)) => usage,
            _ => {
                warn!(
                    request_id = %self.request_id,
                    "stream ended without usage totals; recording zero usage"
                );
                Usage::default()
            }
        };

        let record = self.state.cost.record(self.provider, &self.resolved_model, usage);
        info!(
            request_id = %self.request_id,
            provider = %self.provider,
            model = %self.resolved_model,
            cost_usd = record.cost_usd,
            "stream completed"
        );

        if let (Some((query, model, fingerprint)), Some(cache)) =
            (self.cache_args.take(), self.state.cache.clone())
        {
            if !self.collected.is_empty() {
                if let Err(error) = cache.store(&query, &model, &fingerprint, &self.collected).await
                {
                    warn!(request_id = %self.request_id, %error, "semantic cache store failed");
                }
            }
        }

        // Disarms the deadline timer.
        self.deadline.take();
    }
}

impl Drop for SseDispatch {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        // The client went away mid-stream: cancel the request token so
        // in-flight upstream work aborts and billing stops accruing.
        if let Some(deadline) = self.deadline.take() {
            deadline.cancel();
        }
    }
}

fn cached_response(model: &str, stream: bool, text: &str, request_id: &str) -> Response {
    let id = openai::completion_id();
    let created = now_millis() / 1000;

    if stream {
        let frames = vec![
            Ok::<_, std::io::Error>(openai::chunk_bytes(&id, model, created, Some(text), None)),
            Ok(openai::chunk_bytes(&id, model, created, None, Some("stop"))),
            Ok(openai::done_bytes()),
        ];
        let mut response = Response::new(Body::from_stream(futures_util::stream::iter(frames)));
        let headers = response.headers_mut();
        insert_header(headers, "content-type", "text/event-stream");
        insert_header(headers, "cache-control", "no-cache");
        insert_header(headers, "x-request-id", request_id);
        return response;
    }

    let body = openai::completion_response(
        &id,
        model,
        created,
        text,
        Usage::default(),
        ResponseMetadata {
            provider: None,
            cached: true,
            attempts: 0,
        },
    );
    let mut response = Json(body).into_response();
    let headers = response.headers_mut();
    insert_header(headers, "x-request-id", request_id);
    insert_header(headers, "x-cost-usd", "0");
    insert_header(headers, "x-input-tokens", "0");
    insert_header(headers, "x-output-tokens", "0");
    response
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = value.parse() {
        headers.insert(name, value);
    }
}
