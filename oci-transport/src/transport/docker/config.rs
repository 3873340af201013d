//! Per-host registry connection configuration: which scheme to try, whether
//! plaintext HTTP is acceptable, and which client certificate to present.
//! Resolution walks from the most specific host pattern (`host:port`) down
//! to the least (a bare `*` wildcard), most-specific wins, mirroring how
//! `registries.d` namespace lookups in [`crate::config`] are resolved.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct CertPair {
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub insecure: bool,
    pub ca_file: Option<std::path::PathBuf>,
    pub client_certs: Vec<CertPair>,
}

#[derive(Debug, Clone, Default)]
pub struct HostConfigTable {
    entries: BTreeMap<String, HostConfig>,
}

impl HostConfigTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host_pattern: impl Into<String>, config: HostConfig) {
        self.entries.insert(host_pattern.into(), config);
    }

    /// Resolve configuration for `host` (already including `:port` if
    /// non-default). Tries, in order: exact host match, then progressively
    /// shorter wildcard suffixes (`*.example.com`, `*.com`), then the bare
    /// `*` wildcard. Returns the default (secure, no client cert) if
    /// nothing matches.
    pub fn resolve(&self, host: &str) -> HostConfig {
        if let Some(c) = self.entries.get(host) {
            return c.clone();
        }
        let mut labels: Vec<&str> = host.split('.').collect();
        while labels.len() > 1 {
            labels.remove(0);
            let pattern = format!("*.{}", labels.join("."));
            if let Some(c) = self.entries.get(&pattern) {
                return c.clone();
            }
        }
        self.entries.get("*").cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_host_match_wins_over_wildcard() {
        let mut table = HostConfigTable::new();
        table.insert("*.example.com", HostConfig { insecure: false, ..Default::default() });
        table.insert("registry.example.com", HostConfig { insecure: true, ..Default::default() });
        assert!(table.resolve("registry.example.com").insecure);
    }

    #[test]
    fn wildcard_suffix_matches() {
        let mut table = HostConfigTable::new();
        table.insert("*.example.com", HostConfig { insecure: true, ..Default::default() });
        assert!(table.resolve("mirror.internal.example.com").insecure);
    }

    #[test]
    fn falls_back_to_global_wildcard_then_default() {
        let mut table = HostConfigTable::new();
        table.insert("*", HostConfig { insecure: true, ..Default::default() });
        assert!(table.resolve("anything.at.all").insecure);

        let empty = HostConfigTable::new();
        assert!(!empty.resolve("anything.at.all").insecure);
    }
}
