//! Docker Schema2 manifest and manifest list.

use super::Descriptor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema2 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u64,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Schema2 {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Schema2 {
            schema_version: 2,
            media_type: super::MT_DOCKER_SCHEMA2.to_string(),
            config,
            layers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema2List {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u64,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl Schema2List {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Schema2List {
            schema_version: 2,
            media_type: super::MT_DOCKER_SCHEMA2_LIST.to_string(),
            manifests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{Algorithm, Digest};

    fn d() -> Digest {
        Digest::new(Algorithm::Sha256, "6".repeat(64)).unwrap()
    }

    #[test]
    fn round_trips_through_json() {
        let m = Schema2::new(
            Descriptor::new(super::super::MT_DOCKER_CONTAINER_CONFIG, 100, d()),
            vec![Descriptor::new(super::super::MT_DOCKER_LAYER_GZIP, 200, d())],
        );
        let bytes = serde_json::to_vec(&m).unwrap();
        let back: Schema2 = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn list_requires_at_least_one_entry_by_caller_convention() {
        let list = Schema2List::new(vec![]);
        assert!(list.manifests.is_empty());
    }
}
