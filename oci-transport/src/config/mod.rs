//! The configuration layer: typed parsers for `registries.d` and the
//! docker `auths` JSON file, plus [`SystemContext`], the one aggregate
//! threaded explicitly through every constructor that needs shared state
//! instead of reaching for a global.

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed registries.d YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("malformed docker auth JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("conflicting {what} between {file_a} and {file_b}")]
    Conflict { what: &'static str, file_a: String, file_b: String },
    #[error("malformed base64 auth entry for {host}")]
    MalformedAuth { host: String },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Namespace {
    #[serde(default)]
    pub lookaside: Option<String>,
    #[serde(rename = "lookaside-staging", default)]
    pub lookaside_staging: Option<String>,
    #[serde(default)]
    pub sigstore: Option<String>,
    #[serde(rename = "sigstore-staging", default)]
    pub sigstore_staging: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RegistriesDConfig {
    #[serde(rename = "default-docker", default)]
    pub default_docker: Option<Namespace>,
    #[serde(default)]
    pub docker: BTreeMap<String, Namespace>,
}

pub fn parse_registries_d(bytes: &[u8]) -> Result<RegistriesDConfig, ConfigError> {
    Ok(serde_yaml::from_slice(bytes)?)
}

/// Fold multiple `registries.d/*.yaml` files into one table. A later file
/// defining `default-docker` when an earlier one already did, or the same
/// namespace pattern key appearing twice, is a `Conflict`: silently
/// preferring one file's value over another's would make registry lookup
/// depend on directory listing order.
pub fn merge_registries_d(
    files: impl IntoIterator<Item = (String, RegistriesDConfig)>,
) -> Result<RegistriesDConfig, ConfigError> {
    let mut merged = RegistriesDConfig::default();
    let mut default_from: Option<String> = None;
    let mut pattern_from: BTreeMap<String, String> = BTreeMap::new();

    for (file, config) in files {
        if let Some(default_docker) = config.default_docker {
            if let Some(prev) = &default_from {
                return Err(ConfigError::Conflict { what: "default-docker", file_a: prev.clone(), file_b: file });
            }
            default_from = Some(file.clone());
            merged.default_docker = Some(default_docker);
        }
        for (pattern, ns) in config.docker {
            if let Some(prev) = pattern_from.get(&pattern) {
                return Err(ConfigError::Conflict { what: "namespace pattern", file_a: prev.clone(), file_b: file });
            }
            pattern_from.insert(pattern.clone(), file.clone());
            merged.docker.insert(pattern, ns);
        }
    }
    Ok(merged)
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerAuthEntry {
    pub auth: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerAuthConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, DockerAuthEntry>,
}

pub fn parse_docker_auth(bytes: &[u8]) -> Result<DockerAuthConfig, ConfigError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decode one entry's `auth` field (base64 `user:pass`) on demand, not
/// eagerly at parse time, so a malformed entry for a registry nobody is
/// contacting never surfaces as an error.
pub fn decode_auth_entry(host: &str, entry: &DockerAuthEntry) -> Result<(String, String), ConfigError> {
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&entry.auth)
        .map_err(|_| ConfigError::MalformedAuth { host: host.to_string() })?;
    let text = String::from_utf8(decoded).map_err(|_| ConfigError::MalformedAuth { host: host.to_string() })?;
    text.split_once(':')
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .ok_or_else(|| ConfigError::MalformedAuth { host: host.to_string() })
}

/// Locates candidate config file paths for a given kind of config. A real
/// implementation walks `$HOME`, XDG dirs, and `/etc`; this crate only
/// specifies the contract other callers (the CLI, embedding applications)
/// fulfil.
pub trait ConfigLocator: Send + Sync {
    fn registries_d_paths(&self) -> Vec<std::path::PathBuf>;
    fn docker_auth_paths(&self) -> Vec<std::path::PathBuf>;
}

/// A narrow call-through to an external credential helper (e.g.
/// `docker-credential-osxkeychain`); this crate never spawns a process
/// itself.
pub trait CredentialHelper: Send + Sync {
    fn get(&self, host: &str) -> Option<(String, String)>;
}

pub struct CredentialResolver<'a> {
    pub auth_config: &'a DockerAuthConfig,
    pub helper: Option<&'a dyn CredentialHelper>,
    pub override_creds: Option<(&'a str, &'a str)>,
}

impl<'a> CredentialResolver<'a> {
    /// Resolution order: explicit override, then a credential helper, then
    /// the auths file (remapping `docker.io` to the legacy
    /// `index.docker.io/v1/` key some older auth files use), then
    /// anonymous (`None`).
    pub fn resolve(&self, host: &str) -> Option<(String, String)> {
        if let Some((u, p)) = self.override_creds {
            return Some((u.to_string(), p.to_string()));
        }
        if let Some(helper) = self.helper {
            if let Some(creds) = helper.get(host) {
                return Some(creds);
            }
        }
        let lookup_host = if host == "docker.io" { "index.docker.io/v1/" } else { host };
        for key in [host, lookup_host] {
            if let Some(entry) = self.auth_config.auths.get(key) {
                if let Ok(creds) = decode_auth_entry(key, entry) {
                    return Some(creds);
                }
            }
        }
        None
    }
}

/// A no-op or test-double signer; real signature creation/verification is
/// a narrow call-through the same way credential helpers are.
pub trait Signer: Send + Sync {
    fn sign(&self, manifest_digest: &crate::digest::Digest) -> Option<Vec<u8>>;
    fn verify(&self, manifest_digest: &crate::digest::Digest, signature: &[u8]) -> bool;
}

pub struct NoopSigner;
impl Signer for NoopSigner {
    fn sign(&self, _manifest_digest: &crate::digest::Digest) -> Option<Vec<u8>> {
        None
    }
    fn verify(&self, _manifest_digest: &crate::digest::Digest, _signature: &[u8]) -> bool {
        false
    }
}

/// Shared, explicitly-threaded state: a handle to the process-wide
/// blob-info cache, resolved auth/registries.d tables, an optional signer,
/// and tunables. Never a global — every constructor that needs this state
/// takes a `&SystemContext`, the same way the registry client takes its
/// cache and auth map as constructor arguments instead of touching statics.
pub struct SystemContext {
    pub blob_info_cache: crate::cache::Cache,
    pub registries_d: RegistriesDConfig,
    pub docker_auth: DockerAuthConfig,
    pub signer: Box<dyn Signer>,
    pub max_parallel_downloads: usize,
    pub insecure_registries: Vec<String>,
    pub user_agent: String,
}

impl Default for SystemContext {
    fn default() -> Self {
        SystemContext {
            blob_info_cache: crate::cache::Cache::new(),
            registries_d: RegistriesDConfig::default(),
            docker_auth: DockerAuthConfig::default(),
            signer: Box::new(NoopSigner),
            max_parallel_downloads: 4,
            insecure_registries: Vec::new(),
            user_agent: "oci-transport/0.1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registries_d_yaml() {
        let yaml = br#"
default-docker:
  lookaside: https://lookaside.example.com
docker:
  registry.example.com:
    sigstore: https://sigstore.example.com
"#;
        let config = parse_registries_d(yaml).unwrap();
        assert!(config.default_docker.is_some());
        assert_eq!(config.docker.len(), 1);
    }

    #[test]
    fn merge_rejects_duplicate_default_docker() {
        let a = RegistriesDConfig { default_docker: Some(Namespace::default()), docker: BTreeMap::new() };
        let b = RegistriesDConfig { default_docker: Some(Namespace::default()), docker: BTreeMap::new() };
        let result = merge_registries_d([("a.yaml".to_string(), a), ("b.yaml".to_string(), b)]);
        assert!(result.is_err());
    }

    #[test]
    fn merge_rejects_duplicate_namespace_pattern() {
        let mut a_docker = BTreeMap::new();
        a_docker.insert("example.com".to_string(), Namespace::default());
        let mut b_docker = BTreeMap::new();
        b_docker.insert("example.com".to_string(), Namespace::default());
        let a = RegistriesDConfig { default_docker: None, docker: a_docker };
        let b = RegistriesDConfig { default_docker: None, docker: b_docker };
        assert!(merge_registries_d([("a.yaml".to_string(), a), ("b.yaml".to_string(), b)]).is_err());
    }

    #[test]
    fn decodes_base64_auth_lazily_and_correctly() {
        use base64::Engine;
        let raw = base64::engine::general_purpose::STANDARD.encode("alice:hunter2");
        let entry = DockerAuthEntry { auth: raw };
        let (user, pass) = decode_auth_entry("registry.example.com", &entry).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn malformed_auth_is_only_an_error_when_queried() {
        let mut auths = BTreeMap::new();
        auths.insert("bad.example.com".to_string(), DockerAuthEntry { auth: "not base64!!".to_string() });
        let config = DockerAuthConfig { auths };
        // parse_docker_auth never touches `auth` eagerly, so the malformed
        // entry alone doesn't fail parsing; only decode_auth_entry does.
        assert!(decode_auth_entry("bad.example.com", &config.auths["bad.example.com"]).is_err());
    }

    #[test]
    fn resolver_prefers_override_then_helper_then_auths_file() {
        use base64::Engine;
        let mut auths = BTreeMap::new();
        auths.insert(
            "registry.example.com".to_string(),
            DockerAuthEntry { auth: base64::engine::general_purpose::STANDARD.encode("file:filepass") },
        );
        let config = DockerAuthConfig { auths };
        let resolver = CredentialResolver { auth_config: &config, helper: None, override_creds: Some(("override", "pass")) };
        assert_eq!(resolver.resolve("registry.example.com"), Some(("override".to_string(), "pass".to_string())));

        let resolver = CredentialResolver { auth_config: &config, helper: None, override_creds: None };
        assert_eq!(resolver.resolve("registry.example.com"), Some(("file".to_string(), "filepass".to_string())));
    }

    #[test]
    fn resolver_remaps_docker_io_to_legacy_key() {
        use base64::Engine;
        let mut auths = BTreeMap::new();
        auths.insert(
            "index.docker.io/v1/".to_string(),
            DockerAuthEntry { auth: base64::engine::general_purpose::STANDARD.encode("legacy:pass") },
        );
        let config = DockerAuthConfig { auths };
        let resolver = CredentialResolver { auth_config: &config, helper: None, override_creds: None };
        assert_eq!(resolver.resolve("docker.io"), Some(("legacy".to_string(), "pass".to_string())));
    }
}
