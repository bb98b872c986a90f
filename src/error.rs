use thiserror::Error;

use crate::types::{ProviderId, RetryAttempt};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        timeout_ms: u64,
        provider: Option<ProviderId>,
    },

    #[error("rate limited; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("upstream error from {provider}{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Upstream {
        provider: ProviderId,
        status: Option<u16>,
        message: String,
    },

    #[error("no providers available for model {model}")]
    NoProviders { model: String },

    #[error("all providers failed after {} attempts", attempts.len())]
    AllFailed { attempts: Vec<RetryAttempt> },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::Timeout { .. } => 408,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::NoProviders { .. } | GatewayError::AllFailed { .. } => 503,
            GatewayError::Upstream { .. } | GatewayError::Internal(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_request_error",
            GatewayError::Timeout { .. } => "timeout_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::NoProviders { .. } | GatewayError::AllFailed { .. } => "provider_error",
            GatewayError::Upstream { .. } | GatewayError::Internal(_) => "server_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_type_mapping_follows_the_envelope_contract() {
        let cases: Vec<(GatewayError, u16, &str)> = vec![
            (
                GatewayError::Validation("bad".to_string()),
                400,
                "invalid_request_error",
            ),
            (
                GatewayError::Timeout {
                    timeout_ms: 50,
                    provider: None,
                },
                408,
                "timeout_error",
            ),
            (
                GatewayError::RateLimited { retry_after_ms: 10 },
                429,
                "rate_limit_error",
            ),
            (
                GatewayError::NoProviders {
                    model: "gpt-4o".to_string(),
                },
                503,
                "provider_error",
            ),
            (
                GatewayError::AllFailed {
                    attempts: Vec::new(),
                },
                503,
                "provider_error",
            ),
            (
                GatewayError::Internal("boom".to_string()),
                500,
                "server_error",
            ),
        ];

        for (err, status, kind) in cases {
            assert_eq!(err.http_status(), status, "{err}");
            assert_eq!(err.error_type(), kind, "{err}");
        }
    }
}
