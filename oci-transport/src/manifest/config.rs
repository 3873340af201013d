//! The image configuration blob pointed to by a schema2/OCI1 manifest's
//! `config` descriptor. Shared shape across Docker and OCI: the on-wire
//! field names happen to coincide except for the rootfs type tag.

use crate::digest::Digest;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<std::collections::BTreeMap<String, serde_json::Value>>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty_layer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfiguration {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageConfig>,
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<History>,
}

impl ImageConfiguration {
    /// How many history entries actually added a layer. Used to validate
    /// `len(diff_ids) == non_empty_history_count` when the manifest schema
    /// requires the correspondence (schema2/OCI1; schema1 carries no
    /// rootfs at all).
    pub fn non_empty_history_count(&self) -> usize {
        self.history.iter().filter(|h| !h.empty_layer).count()
    }

    pub fn validate_diff_id_count(&self) -> Result<(), super::ManifestError> {
        let expected = self.non_empty_history_count();
        if !self.history.is_empty() && expected != self.rootfs.diff_ids.len() {
            return Err(super::ManifestError::SchemaCorruption(format!(
                "rootfs has {} diff_ids but history has {expected} non-empty-layer entries",
                self.rootfs.diff_ids.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;

    fn config(history: Vec<History>, diff_id_count: usize) -> ImageConfiguration {
        ImageConfiguration {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
            created: None,
            author: None,
            config: None,
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: (0..diff_id_count)
                    .map(|i| Digest::new(Algorithm::Sha256, format!("{i}").repeat(64)[..64].to_string()).unwrap())
                    .collect(),
            },
            history,
        }
    }

    #[test]
    fn validates_matching_diff_id_count() {
        let history = vec![
            History { empty_layer: false, ..Default::default() },
            History { empty_layer: true, ..Default::default() },
            History { empty_layer: false, ..Default::default() },
        ];
        let c = config(history, 2);
        assert!(c.validate_diff_id_count().is_ok());
    }

    #[test]
    fn rejects_mismatched_diff_id_count() {
        let history = vec![History { empty_layer: false, ..Default::default() }];
        let c = config(history, 0);
        assert!(c.validate_diff_id_count().is_err());
    }

    #[test]
    fn empty_history_is_not_validated() {
        let c = config(vec![], 3);
        assert!(c.validate_diff_id_count().is_ok());
    }
}
