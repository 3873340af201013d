//! The registry error taxonomy. Distribution spec errors arrive as a JSON
//! body `{"errors":[{"code":...,"message":...,"detail":...}]}`; everything
//! else (connection failures, timeouts, malformed responses) gets its own
//! variant so callers can match on "do I retry this" without string-sniffing
//! an HTTP status.

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct RegistryErrorDetail {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct RegistryErrorBody {
    #[serde(default)]
    pub errors: Vec<RegistryErrorDetail>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("http transport error: {0}")]
    Http(String),
    #[error("registry returned status {status}: {body}")]
    Unexpected { status: u16, body: String },
    #[error("registry error {status}: {errors:?}")]
    Distribution {
        status: u16,
        errors: Vec<RegistryErrorDetail>,
    },
    #[error("authentication required ({scope}): {reason}")]
    Unauthorized { scope: String, reason: String },
    #[error("authentication failed after scope escalation: {0}")]
    InsufficientScopeRetryFailed(String),
    #[error("no endpoint in {0:?} could be reached")]
    NoReachableEndpoint(Vec<String>),
    #[error("malformed WWW-Authenticate header: {0:?}")]
    MalformedAuthHeader(String),
    #[error("download stalled: no bytes received for {0:?}")]
    DownloadStalled(std::time::Duration),
    #[error("server response had malformed Content-Range {0:?}")]
    MalformedContentRange(String),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Option<std::time::Duration>),
}

impl RegistryError {
    /// `MANIFEST_UNKNOWN`, or a 404 with no parseable distribution error
    /// body (some registries omit the JSON body entirely on a plain 404).
    pub fn is_manifest_unknown(&self) -> bool {
        match self {
            RegistryError::Distribution { status, errors } => {
                *status == 404 && errors.iter().any(|e| e.code == "MANIFEST_UNKNOWN")
            }
            RegistryError::Unexpected { status, .. } => *status == 404,
            _ => false,
        }
    }

    pub fn is_blob_unknown(&self) -> bool {
        matches!(self, RegistryError::Distribution { errors, .. } if errors.iter().any(|e| e.code == "BLOB_UNKNOWN"))
    }

    /// Whether the retry policy (§4.6) should retry this error: 429, 5xx,
    /// and a 401 that hasn't already gone through one insufficient-scope
    /// retry round.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::RateLimited(_) => true,
            RegistryError::Unexpected { status, .. } => *status == 429 || *status >= 500,
            RegistryError::Http(_) => true,
            _ => false,
        }
    }
}

pub fn parse_error_body(status: u16, body: &[u8]) -> RegistryError {
    match serde_json::from_slice::<RegistryErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => RegistryError::Distribution {
            status,
            errors: parsed.errors,
        },
        _ => RegistryError::Unexpected {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_manifest_unknown() {
        let err = parse_error_body(
            404,
            br#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#,
        );
        assert!(err.is_manifest_unknown());
    }

    #[test]
    fn plain_404_with_no_body_is_also_manifest_unknown() {
        let err = parse_error_body(404, b"");
        assert!(err.is_manifest_unknown());
    }

    #[test]
    fn non_404_distribution_error_is_not_manifest_unknown() {
        let err = parse_error_body(
            400,
            br#"{"errors":[{"code":"DIGEST_INVALID","message":"bad digest"}]}"#,
        );
        assert!(!err.is_manifest_unknown());
    }

    #[test]
    fn retry_policy_covers_429_and_5xx() {
        assert!(RegistryError::Unexpected { status: 429, body: String::new() }.is_retryable());
        assert!(RegistryError::Unexpected { status: 503, body: String::new() }.is_retryable());
        assert!(!RegistryError::Unexpected { status: 400, body: String::new() }.is_retryable());
    }
}
