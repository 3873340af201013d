//! OCI v1 image manifest and image index. Structurally near-identical to
//! Schema2/Schema2List; kept as distinct types (rather than a shared struct
//! with a mediaType field swap) so conversions are explicit call sites
//! instead of silent field reinterpretation.

use super::Descriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oci1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u64,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Oci1Manifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Oci1Manifest {
            schema_version: 2,
            media_type: Some(super::MT_OCI1_MANIFEST.to_string()),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oci1Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u64,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Oci1Index {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Oci1Index {
            schema_version: 2,
            media_type: Some(super::MT_OCI1_INDEX.to_string()),
            manifests,
            annotations: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{Algorithm, Digest};

    fn d() -> Digest {
        Digest::new(Algorithm::Sha256, "7".repeat(64)).unwrap()
    }

    #[test]
    fn round_trips_through_json_without_media_type() {
        let mut m = Oci1Manifest::new(
            Descriptor::new(super::super::MT_OCI1_CONFIG, 10, d()),
            vec![Descriptor::new(super::super::MT_OCI1_LAYER_GZIP, 20, d())],
        );
        m.media_type = None;
        let bytes = serde_json::to_vec(&m).unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("mediaType"));
        let back: Oci1Manifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(m, back);
    }
}
