//! Source error classification.
//!
//! [`classify`] is the single place that decides how a failed source call is
//! handled. The agent only consults the resulting flags. HTTP status is the
//! primary signal; message patterns are a fallback for transport errors that
//! carry no status.

use super::{QueryResult, SourceMetadata};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Category of a classified source failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    RateLimit,
    Validation,
    NotFound,
    Timeout,
    Server,
    Network,
    Other,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::Network => "network",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// A classified source failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub category: ErrorCategory,
    pub http_code: Option<u16>,
    pub message: String,
    /// Whether an LLM rewrite of the query params may fix this
    pub is_reformulable: bool,
    /// Whether retrying the same params (with backoff) may fix this
    pub is_retryable: bool,
    /// Cool-down from a Retry-After header, when present
    pub retry_after: Option<Duration>,
}

const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Classify a failed query result. Returns `None` for successes.
///
/// Deterministic and idempotent: the same input always yields the same
/// `ApiError`. Reformulation is only ever offered for validation failures
/// (HTTP 400/422); auth, rate-limit, and server errors are never
/// reformulated because a query rewrite cannot fix them.
pub fn classify(result: &QueryResult, meta: &SourceMetadata) -> Option<ApiError> {
    if result.success {
        return None;
    }

    let message = result
        .error
        .clone()
        .unwrap_or_else(|| "unknown source error".to_string());

    let (category, mut is_retryable, mut is_reformulable) = match result.http_code {
        Some(400) | Some(422) => (ErrorCategory::Validation, false, true),
        Some(401) | Some(403) => (ErrorCategory::Auth, false, false),
        Some(404) => (ErrorCategory::NotFound, false, false),
        Some(408) | Some(504) => (ErrorCategory::Timeout, true, false),
        Some(429) => (ErrorCategory::RateLimit, true, false),
        Some(500) | Some(502) | Some(503) => (ErrorCategory::Server, true, false),
        Some(_) => (ErrorCategory::Other, false, false),
        None => classify_message(&message),
    };

    // Codes the source itself declares unfixable: no retry, no rewrite.
    if let Some(code) = result.http_code {
        if meta.unfixable_http_codes.contains(&code) {
            is_retryable = false;
            is_reformulable = false;
        }
    }

    let retry_after = match category {
        ErrorCategory::RateLimit => Some(
            result
                .retry_after_s
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN),
        ),
        _ => None,
    };

    Some(ApiError {
        category,
        http_code: result.http_code,
        message,
        is_reformulable,
        is_retryable,
        retry_after,
    })
}

fn timeout_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\btime[d]?\s*out\b|\bdeadline\b").expect("valid regex"))
}

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\brate.?limit|too many requests|quota exceeded").expect("valid regex")
    })
}

fn network_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bconnection\b|\bdns\b|\bnetwork\b|\brefused\b|\breset\b|\bunreachable\b")
            .expect("valid regex")
    })
}

fn auth_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bunauthorized\b|\bforbidden\b|\bapi.?key\b|\bauth\b").expect("valid regex")
    })
}

/// Message-pattern fallback for failures without an HTTP status.
fn classify_message(message: &str) -> (ErrorCategory, bool, bool) {
    if rate_limit_re().is_match(message) {
        (ErrorCategory::RateLimit, true, false)
    } else if timeout_re().is_match(message) {
        (ErrorCategory::Timeout, true, false)
    } else if auth_re().is_match(message) {
        (ErrorCategory::Auth, false, false)
    } else if network_re().is_match(message) {
        (ErrorCategory::Network, true, false)
    } else {
        // Transport failure of unknown shape: treat as network, retryable.
        (ErrorCategory::Network, true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceCategory;

    fn meta() -> SourceMetadata {
        SourceMetadata {
            id: "sam".to_string(),
            display_name: "SAM.gov".to_string(),
            category: SourceCategory::Government,
            requires_api_key: true,
            api_key_env_var: Some("SAM_API_KEY".to_string()),
            supports_date_filter: true,
            characteristics: "Federal contract opportunities".to_string(),
            query_strategies: vec![],
            unfixable_http_codes: vec![],
        }
    }

    fn failed(code: Option<u16>, msg: &str) -> QueryResult {
        QueryResult {
            success: false,
            source_id: "sam".to_string(),
            total: 0,
            results: Vec::new(),
            error: Some(msg.to_string()),
            http_code: code,
            retry_after_s: None,
        }
    }

    #[test]
    fn test_success_is_not_classified() {
        let ok = QueryResult::ok("sam", 0, Vec::new());
        assert!(classify(&ok, &meta()).is_none());
    }

    #[test]
    fn test_http_code_table() {
        let cases: &[(u16, ErrorCategory, bool, bool)] = &[
            (400, ErrorCategory::Validation, false, true),
            (422, ErrorCategory::Validation, false, true),
            (401, ErrorCategory::Auth, false, false),
            (403, ErrorCategory::Auth, false, false),
            (404, ErrorCategory::NotFound, false, false),
            (408, ErrorCategory::Timeout, true, false),
            (504, ErrorCategory::Timeout, true, false),
            (429, ErrorCategory::RateLimit, true, false),
            (500, ErrorCategory::Server, true, false),
            (502, ErrorCategory::Server, true, false),
            (503, ErrorCategory::Server, true, false),
        ];
        for &(code, category, retryable, reformulable) in cases {
            let err = classify(&failed(Some(code), "boom"), &meta()).unwrap();
            assert_eq!(err.category, category, "code {code}");
            assert_eq!(err.is_retryable, retryable, "code {code}");
            assert_eq!(err.is_reformulable, reformulable, "code {code}");
        }
    }

    #[test]
    fn test_auth_is_never_reformulable() {
        let err = classify(&failed(Some(403), "forbidden"), &meta()).unwrap();
        assert!(!err.is_reformulable);
        assert!(!err.is_retryable);
    }

    #[test]
    fn test_rate_limit_respects_retry_after() {
        let mut result = failed(Some(429), "slow down");
        result.retry_after_s = Some(17);
        let err = classify(&result, &meta()).unwrap();
        assert_eq!(err.retry_after, Some(Duration::from_secs(17)));

        let err = classify(&failed(Some(429), "slow down"), &meta()).unwrap();
        assert_eq!(err.retry_after, Some(DEFAULT_RATE_LIMIT_COOLDOWN));
    }

    #[test]
    fn test_message_fallback() {
        let err = classify(&failed(None, "connection refused"), &meta()).unwrap();
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.is_retryable);

        let err = classify(&failed(None, "request timed out after 30s"), &meta()).unwrap();
        assert_eq!(err.category, ErrorCategory::Timeout);

        let err = classify(&failed(None, "Too Many Requests"), &meta()).unwrap();
        assert_eq!(err.category, ErrorCategory::RateLimit);

        let err = classify(&failed(None, "invalid api key"), &meta()).unwrap();
        assert_eq!(err.category, ErrorCategory::Auth);
        assert!(!err.is_reformulable);
    }

    #[test]
    fn test_unfixable_codes_override() {
        let mut m = meta();
        m.unfixable_http_codes = vec![422];
        let err = classify(&failed(Some(422), "bad params"), &m).unwrap();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(!err.is_reformulable);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let result = failed(Some(429), "slow down");
        let a = classify(&result, &meta()).unwrap();
        let b = classify(&result, &meta()).unwrap();
        assert_eq!(a, b);
    }
}
