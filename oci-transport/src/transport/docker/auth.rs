//! Basic and bearer authentication against a v2 registry, including
//! `WWW-Authenticate` challenge parsing and scope accumulation across a
//! connection's lifetime.

use super::error::RegistryError;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub resource_type: String,
    pub remote_name: String,
    pub actions: String,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.resource_type, self.remote_name, self.actions)
    }
}

impl Scope {
    pub fn repository(remote_name: impl Into<String>, actions: impl Into<String>) -> Self {
        Scope {
            resource_type: "repository".to_string(),
            remote_name: remote_name.into(),
            actions: actions.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<Scope>,
    /// The `error` parameter a 401 challenge carries when it's a retry of
    /// an already-authenticated request, e.g. `insufficient_scope` or
    /// `invalid_token`. `None` on the initial, unauthenticated challenge.
    pub error: Option<String>,
}

impl BearerChallenge {
    pub fn is_insufficient_scope(&self) -> bool {
        self.error.as_deref() == Some("insufficient_scope")
    }
}

/// Parse a `WWW-Authenticate: Bearer realm="...",service="...",scope="...",error="..."`
/// header value.
pub fn parse_www_authenticate_bearer(header: &str) -> Result<BearerChallenge, RegistryError> {
    let rest = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| RegistryError::MalformedAuthHeader(header.to_string()))?;
    let pairs =
        parse_params(rest).ok_or_else(|| RegistryError::MalformedAuthHeader(header.to_string()))?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    let mut error = None;
    for (k, v) in pairs {
        match k {
            "realm" => realm = Some(v.to_string()),
            "service" => service = Some(v.to_string()),
            "scope" => scope = parse_scope(v),
            "error" => error = Some(v.to_string()),
            _ => {}
        }
    }
    Ok(BearerChallenge {
        realm: realm.ok_or_else(|| RegistryError::MalformedAuthHeader(header.to_string()))?,
        service,
        scope,
        error,
    })
}

fn parse_scope(s: &str) -> Option<Scope> {
    let mut parts = s.splitn(3, ':');
    Some(Scope {
        resource_type: parts.next()?.to_string(),
        remote_name: parts.next()?.to_string(),
        actions: parts.next()?.to_string(),
    })
}

/// Parse a comma-separated list of `key="value"` pairs as used by
/// `WWW-Authenticate` challenge parameters. Not a general HTTP
/// quoted-string parser: values containing an escaped `"` are not
/// supported, which matches what every registry we've seen actually sends.
fn parse_params(input: &str) -> Option<Vec<(&str, &str)>> {
    let mut pairs = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after_eq = &rest[eq + 1..];
        let after_quote = after_eq.strip_prefix('"')?;
        let close = after_quote.find('"')?;
        let value = &after_quote[..close];
        pairs.push((key, value));
        rest = after_quote[close + 1..].trim_start();
        if let Some(stripped) = rest.strip_prefix(',') {
            rest = stripped.trim_start();
        } else if !rest.is_empty() {
            return None;
        }
    }
    Some(pairs)
}

#[derive(Debug, Clone)]
pub struct BearerToken {
    pub token: String,
    pub expires_at: Instant,
}

impl BearerToken {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Minimum `expires_in` a registry is allowed to hand back; shorter values
/// are clamped up so a misconfigured or hostile auth server can't force a
/// token refresh on every single request.
const MIN_EXPIRES_IN: u64 = 60;

#[derive(serde::Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    issued_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub fn compute_expiry(expires_in: Option<u64>, issued_at: Option<chrono::DateTime<chrono::Utc>>) -> Instant {
    let expires_in = expires_in.unwrap_or(MIN_EXPIRES_IN).max(MIN_EXPIRES_IN);
    let lag = issued_at
        .map(|t| {
            let now = chrono::Utc::now();
            (now - t).to_std().unwrap_or(Duration::ZERO)
        })
        .unwrap_or(Duration::ZERO);
    let remaining = Duration::from_secs(expires_in).saturating_sub(lag);
    Instant::now() + remaining
}

pub fn parse_token_response(body: &[u8]) -> Result<BearerToken, RegistryError> {
    let parsed: TokenResponse = serde_json::from_slice(body)
        .map_err(|e| RegistryError::Http(format!("malformed token response: {e}")))?;
    Ok(BearerToken {
        token: parsed.token,
        expires_at: compute_expiry(parsed.expires_in, parsed.issued_at),
    })
}

#[derive(Debug, Clone, Default)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn header_value(&self) -> String {
        use base64::Engine;
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_with_scope() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:library/busybox:pull""#;
        let challenge = parse_www_authenticate_bearer(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.example.com"));
        let scope = challenge.scope.unwrap();
        assert_eq!(scope.remote_name, "library/busybox");
        assert_eq!(scope.actions, "pull");
    }

    #[test]
    fn parses_insufficient_scope_error() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:library/busybox:pull",error="insufficient_scope""#;
        let challenge = parse_www_authenticate_bearer(header).unwrap();
        assert!(challenge.is_insufficient_scope());
    }

    #[test]
    fn challenge_without_error_is_not_insufficient_scope() {
        let header = r#"Bearer realm="https://auth.example.com/token""#;
        let challenge = parse_www_authenticate_bearer(header).unwrap();
        assert!(!challenge.is_insufficient_scope());
    }

    #[test]
    fn rejects_non_bearer_header() {
        assert!(parse_www_authenticate_bearer("Basic realm=\"x\"").is_err());
    }

    #[test]
    fn rejects_missing_realm() {
        assert!(parse_www_authenticate_bearer(r#"Bearer service="x""#).is_err());
    }

    #[test]
    fn expires_in_is_clamped_to_minimum() {
        let expiry = compute_expiry(Some(5), None);
        assert!(expiry >= Instant::now() + Duration::from_secs(MIN_EXPIRES_IN - 1));
    }

    #[test]
    fn issued_at_lag_is_subtracted_from_expiry() {
        let issued = chrono::Utc::now() - chrono::Duration::seconds(30);
        let expiry = compute_expiry(Some(120), Some(issued));
        // roughly 90s remaining, definitely less than the full 120s
        assert!(expiry < Instant::now() + Duration::from_secs(120));
    }

    #[test]
    fn basic_header_value_is_base64_user_colon_pass() {
        let creds = BasicCredentials { username: "alice".to_string(), password: "hunter2".to_string() };
        assert!(creds.header_value().starts_with("Basic "));
    }
}
