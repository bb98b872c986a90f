use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::embedding::EmbeddingModel;
use crate::utils::now_millis;
use crate::{GatewayError, Result};

const INDEX_NAME: &str = "idx:semantic-cache";
const KEY_PREFIX: &str = "cache:";

#[derive(Clone, Debug)]
pub struct SemanticCacheConfig {
    pub enabled: bool,
    pub url: String,
    pub ttl_seconds: u64,
    /// Maximum cosine distance for a hit.
    pub similarity_threshold: f64,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://localhost:6379".to_string(),
            ttl_seconds: 3_600,
            similarity_threshold: 0.15,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CacheLookup {
    pub hit: bool,
    pub response: Option<String>,
    pub distance: Option<f64>,
}

/// Redis-backed semantic cache: JSON documents under `cache:` keyed by a
/// fresh uuid, searched through an HNSW cosine index. Entries are scoped by
/// model and by a generation-parameter fingerprint, so only requests that
/// would produce comparable output can share a hit.
pub struct SemanticCache {
    client: redis::Client,
    config: SemanticCacheConfig,
    embedder: Arc<dyn EmbeddingModel>,
}

impl SemanticCache {
    pub fn new(config: SemanticCacheConfig, embedder: Arc<dyn EmbeddingModel>) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| GatewayError::Internal(format!("invalid redis url: {err}")))?;
        Ok(Self {
            client,
            config,
            embedder,
        })
    }

    pub fn config(&self) -> &SemanticCacheConfig {
        &self.config
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| GatewayError::Internal(format!("redis connection failed: {err}")))
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| GatewayError::Internal(format!("redis ping failed: {err}")))
    }

    /// Creates the vector index. Safe to call on every boot; an existing
    /// index is left untouched.
    pub async fn ensure_index(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("FT.CREATE")
            .arg(INDEX_NAME)
            .arg("ON")
            .arg("JSON")
            .arg("PREFIX")
            .arg(1)
            .arg(KEY_PREFIX)
            .arg("SCHEMA")
            .arg("$.embedding")
            .arg("AS")
            .arg("vector")
            .arg("VECTOR")
            .arg("HNSW")
            .arg(6)
            .arg("TYPE")
            .arg("FLOAT32")
            .arg("DIM")
            .arg(self.config.embedding_dimensions)
            .arg("DISTANCE_METRIC")
            .arg("COSINE")
            .arg("$.model")
            .arg("AS")
            .arg("model")
            .arg("TAG")
            .arg("$.params")
            .arg("AS")
            .arg("params")
            .arg("TAG")
            .arg("$.query")
            .arg("AS")
            .arg("query")
            .arg("TEXT")
            .query_async::<()>(&mut conn)
            .await;

        match result {
            Ok(()) => {
                debug!(index = INDEX_NAME, "vector index created");
                Ok(())
            }
            Err(err) if err.to_string().to_ascii_lowercase().contains("already exists") => Ok(()),
            Err(err) => Err(GatewayError::Internal(format!(
                "failed to create vector index: {err}"
            ))),
        }
    }

    pub async fn store(
        &self,
        query: &str,
        model: &str,
        params_fingerprint: &str,
        response: &str,
    ) -> Result<()> {
        let embedding = self.embedder.embed_single(query.to_string()).await?;
        if embedding.len() != self.config.embedding_dimensions {
            return Err(GatewayError::Internal(format!(
                "embedding dimension mismatch: got {}, index expects {}",
                embedding.len(),
                self.config.embedding_dimensions
            )));
        }

        let document = serde_json::json!({
            "query": query,
            "model": model,
            "params": params_fingerprint,
            "response": response,
            "embedding": embedding,
            "created_ts": now_millis(),
        });

        let key = format!("{KEY_PREFIX}{}", Uuid::new_v4());
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("JSON.SET")
            .arg(&key)
            .arg("$")
            .arg(document.to_string())
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.ttl_seconds);
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| GatewayError::Internal(format!("cache write failed: {err}")))?;

        debug!(key, model, "cached completion");
        Ok(())
    }

    pub async fn lookup(
        &self,
        query: &str,
        model: &str,
        params_fingerprint: &str,
    ) -> Result<CacheLookup> {
        let embedding = self.embedder.embed_single(query.to_string()).await?;
        if embedding.len() != self.config.embedding_dimensions {
            return Err(GatewayError::Internal(format!(
                "embedding dimension mismatch: got {}, index expects {}",
                embedding.len(),
                self.config.embedding_dimensions
            )));
        }

        let filter = format!(
            "(@model:{{{}}} @params:{{{}}})=>[KNN 1 @vector $blob AS score]",
            escape_tag(model),
            escape_tag(params_fingerprint),
        );

        let mut conn = self.connection().await?;
        let reply: redis::Value = redis::cmd("FT.SEARCH")
            .arg(INDEX_NAME)
            .arg(&filter)
            .arg("PARAMS")
            .arg(2)
            .arg("blob")
            .arg(embedding_blob(&embedding))
            .arg("SORTBY")
            .arg("score")
            .arg("ASC")
            .arg("RETURN")
            .arg(6)
            .arg("score")
            .arg("AS")
            .arg("score")
            .arg("$.response")
            .arg("AS")
            .arg("response")
            .arg("DIALECT")
            .arg(2)
            .query_async(&mut conn)
            .await
            .map_err(|err| GatewayError::Internal(format!("cache search failed: {err}")))?;

        let Some((distance, response)) = parse_knn_reply(&reply) else {
            return Ok(CacheLookup::default());
        };

        if distance < self.config.similarity_threshold {
            Ok(CacheLookup {
                hit: true,
                response: Some(response),
                distance: Some(distance),
            })
        } else {
            Ok(CacheLookup {
                hit: false,
                response: None,
                distance: Some(distance),
            })
        }
    }
}

/// Escapes a value for use inside a TAG filter. Everything outside
/// `[A-Za-z0-9]` is backslash-escaped, which neutralizes the full query
/// metacharacter set rather than a handpicked subset.
pub fn escape_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 2);
    for ch in raw.chars() {
        if !ch.is_ascii_alphanumeric() {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Stable fingerprint over the generation parameters that shape output.
pub fn params_fingerprint(
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u32>,
    stop: &[String],
) -> String {
    let canonical = format!(
        "t={:?}|p={:?}|m={:?}|s={}",
        temperature,
        top_p,
        max_tokens,
        stop.join("\u{1f}"),
    );
    format!("{:016x}", hash64_fnv1a(canonical.as_bytes()))
}

fn hash64_fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn embedding_blob(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

fn value_as_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(text) => Some(text.clone()),
        _ => None,
    }
}

/// `FT.SEARCH` reply: `[count, key, [field, value, ...], ...]`. Returns the
/// best hit's `(distance, response)` when one document came back.
fn parse_knn_reply(reply: &redis::Value) -> Option<(f64, String)> {
    let redis::Value::Array(items) = reply else {
        return None;
    };
    let mut iter = items.iter();
    let _count = iter.next()?;
    let _key = iter.next()?;
    let redis::Value::Array(fields) = iter.next()? else {
        return None;
    };

    let mut distance = None;
    let mut response = None;
    for pair in fields.chunks(2) {
        let [field, value] = pair else { continue };
        match value_as_string(field)?.as_str() {
            "score" => distance = value_as_string(value)?.parse::<f64>().ok(),
            "response" => response = value_as_string(value),
            _ => {}
        }
    }
    match (distance, response) {
        (Some(distance), Some(response)) => Some((distance, response)),
        _ => {
            warn!("cache search returned a document without score/response fields");
            None
        }
    }
}
