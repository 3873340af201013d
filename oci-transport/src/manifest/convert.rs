//! Lossy-but-deterministic conversions between manifest variants.
//!
//! Supported directions:
//! - `OCI1 <-> Schema2`: structurally trivial, just a media-type and
//!   descriptor media-type remap (OCI layer/config media types have no
//!   Docker equivalent for some compression kinds, which is gated here).
//! - `Schema1Signed/Unsigned -> Schema2`: requires synthesizing a config
//!   blob from the embedded per-layer `v1Compatibility` history, since
//!   schema1 has no config descriptor at all. The synthesized config's
//!   bytes are new data the caller must store as a new blob; this function
//!   returns it alongside the manifest.
//! - `Schema1 -> OCI1`: only ever performed by first converting to Schema2,
//!   then OCI1 (see [`Open Question`] resolution in the design notes) —
//!   there is no direct Schema1->OCI1 path here, to keep exactly one
//!   codepath that knows how to synthesize a config blob.
//! - `Schema2List <-> Oci1Index`: a per-entry descriptor media-type remap.
//!
//! Schema2 -> Schema1 and list -> non-list are not offered: going from a
//! multi-platform list to a single manifest requires a platform choice,
//! which is the copy orchestrator's job, not this module's.

use super::config::{History as ConfigHistory, ImageConfiguration, RootFs};
use super::schema1::Schema1;
use super::schema2::{Schema2, Schema2List};
use super::oci1::{Oci1Index, Oci1Manifest};
use super::{Descriptor, ManifestError, MT_DOCKER_CONTAINER_CONFIG, MT_OCI1_CONFIG};
use crate::digest::{Algorithm, Digest};

/// The result of converting schema1 to schema2: a manifest plus the newly
/// synthesized config blob bytes, which the caller is responsible for
/// uploading/storing and then referencing by the returned descriptor.
pub struct Schema1ToSchema2 {
    pub manifest: Schema2,
    pub config_bytes: Vec<u8>,
}

/// Synthesize a schema2 manifest (and its config blob) from a schema1
/// manifest. `layer_sizes_and_diff_ids` must supply, in the same
/// bottom-to-top order as the synthesized manifest's layers, the
/// uncompressed digest (diff_id) and on-the-wire size of each layer;
/// the copy pipeline is expected to have these on hand since it already
/// has to fetch every blob to re-push it.
pub fn schema1_to_schema2(
    m: &Schema1,
    layer_descriptors: Vec<Descriptor>,
    diff_ids: Vec<Digest>,
) -> Result<Schema1ToSchema2, ManifestError> {
    if layer_descriptors.len() != m.fs_layers.len() {
        return Err(ManifestError::IncompatibleConversion {
            from: "schema1",
            to: "schema2",
            reason: "caller-supplied layer descriptor count does not match fsLayers".to_string(),
        });
    }
    if diff_ids.len() != m.fs_layers.len() {
        return Err(ManifestError::IncompatibleConversion {
            from: "schema1",
            to: "schema2",
            reason: "caller-supplied diff_id count does not match fsLayers".to_string(),
        });
    }

    #[derive(serde::Deserialize)]
    struct V1Compat {
        #[serde(default)]
        created: Option<chrono::DateTime<chrono::Utc>>,
        #[serde(default)]
        author: Option<String>,
        #[serde(default)]
        container_config: Option<V1ContainerConfig>,
        #[serde(default)]
        comment: Option<String>,
        #[serde(default)]
        throwaway: Option<bool>,
    }

    #[derive(serde::Deserialize)]
    struct V1ContainerConfig {
        #[serde(default)]
        cmd: Option<Vec<String>>,
    }

    // history[0] is the newest layer in schema1 (top-to-bottom); reverse it
    // to get the bottom-to-top order schema2/OCI expect.
    let mut history = Vec::with_capacity(m.history.len());
    for h in m.history.iter().rev() {
        let compat: V1Compat = serde_json::from_str(&h.v1_compatibility).map_err(|e| {
            ManifestError::SchemaCorruption(format!("history entry is not valid JSON: {e}"))
        })?;
        history.push(ConfigHistory {
            created: compat.created,
            author: compat.author,
            created_by: compat
                .container_config
                .and_then(|c| c.cmd)
                .map(|cmd| cmd.join(" ")),
            comment: compat.comment,
            empty_layer: compat.throwaway.unwrap_or(false),
        });
    }

    let newest: serde_json::Value = serde_json::from_str(
        &m.history
            .first()
            .ok_or_else(|| ManifestError::SchemaCorruption("no history entries".to_string()))?
            .v1_compatibility,
    )?;

    let config = ImageConfiguration {
        architecture: m.architecture.clone(),
        os: newest
            .get("os")
            .and_then(|v| v.as_str())
            .unwrap_or("linux")
            .to_string(),
        variant: None,
        created: history.last().and_then(|h| h.created),
        author: history.last().and_then(|h| h.author.clone()),
        config: None,
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids,
        },
        history,
    };
    let config_bytes = serde_json::to_vec(&config)?;
    let config_digest = Digest::of_bytes(Algorithm::Sha256, &config_bytes);

    Ok(Schema1ToSchema2 {
        manifest: Schema2::new(
            Descriptor::new(
                MT_DOCKER_CONTAINER_CONFIG,
                config_bytes.len() as i64,
                config_digest,
            ),
            layer_descriptors,
        ),
        config_bytes,
    })
}

fn remap_layer_media_type(mt: &str, to_oci: bool) -> String {
    match (mt, to_oci) {
        (super::MT_DOCKER_LAYER_GZIP, true) => super::MT_OCI1_LAYER_GZIP.to_string(),
        (super::MT_OCI1_LAYER_GZIP, false) => super::MT_DOCKER_LAYER_GZIP.to_string(),
        (super::MT_OCI1_LAYER, false) => super::MT_DOCKER_LAYER_GZIP.to_string(),
        _ => mt.to_string(),
    }
}

pub fn schema2_to_oci1(m: &Schema2) -> Oci1Manifest {
    let mut config = m.config.clone();
    config.media_type = MT_OCI1_CONFIG.to_string();
    let layers = m
        .layers
        .iter()
        .map(|l| {
            let mut l = l.clone();
            l.media_type = remap_layer_media_type(&l.media_type, true);
            l
        })
        .collect();
    Oci1Manifest::new(config, layers)
}

pub fn oci1_to_schema2(m: &Oci1Manifest) -> Result<Schema2, ManifestError> {
    if !m.annotations.is_empty() {
        // schema2 has no manifest-level annotations field; dropping them is
        // a lossy but accepted conversion per the documented direction.
    }
    let mut config = m.config.clone();
    config.media_type = MT_DOCKER_CONTAINER_CONFIG.to_string();
    let mut layers = Vec::with_capacity(m.layers.len());
    for l in &m.layers {
        if l.media_type == super::MT_OCI1_LAYER {
            return Err(ManifestError::IncompatibleConversion {
                from: "oci1",
                to: "schema2",
                reason: format!(
                    "layer {} is uncompressed OCI tar, which docker schema2 has no media type for",
                    l.digest
                ),
            });
        }
        let mut l = l.clone();
        l.media_type = remap_layer_media_type(&l.media_type, false);
        layers.push(l);
    }
    Ok(Schema2::new(config, layers))
}

fn remap_instance_media_type(mt: &str, to_oci: bool) -> String {
    match (mt, to_oci) {
        (super::MT_DOCKER_SCHEMA2, true) => super::MT_OCI1_MANIFEST.to_string(),
        (super::MT_OCI1_MANIFEST, false) => super::MT_DOCKER_SCHEMA2.to_string(),
        _ => mt.to_string(),
    }
}

pub fn schema2_list_to_oci1_index(l: &Schema2List) -> Oci1Index {
    let manifests = l
        .manifests
        .iter()
        .map(|d| {
            let mut d = d.clone();
            d.media_type = remap_instance_media_type(&d.media_type, true);
            d
        })
        .collect();
    Oci1Index::new(manifests)
}

pub fn oci1_index_to_schema2_list(i: &Oci1Index) -> Result<Schema2List, ManifestError> {
    if i.manifests.is_empty() {
        return Err(ManifestError::EmptyList);
    }
    let manifests = i
        .manifests
        .iter()
        .map(|d| {
            let mut d = d.clone();
            d.media_type = remap_instance_media_type(&d.media_type, false);
            d
        })
        .collect();
    Ok(Schema2List::new(manifests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::schema1::{FsLayer, History as S1History};

    fn digest(b: u8) -> Digest {
        Digest::new(Algorithm::Sha256, format!("{b:02x}").repeat(32)).unwrap()
    }

    fn sample_schema1() -> Schema1 {
        Schema1 {
            schema_version: 1,
            name: "library/busybox".to_string(),
            tag: "latest".to_string(),
            architecture: "amd64".to_string(),
            fs_layers: vec![
                FsLayer { blob_sum: digest(2) },
                FsLayer { blob_sum: digest(1) },
            ],
            history: vec![
                S1History {
                    v1_compatibility:
                        r#"{"os":"linux","created":"2020-01-02T00:00:00Z","container_config":{"cmd":["/bin/sh","-c","echo hi"]}}"#
                            .to_string(),
                },
                S1History {
                    v1_compatibility: r#"{"os":"linux","created":"2020-01-01T00:00:00Z"}"#.to_string(),
                },
            ],
        }
    }

    #[test]
    fn schema1_to_schema2_synthesizes_config_in_bottom_to_top_order() {
        let m = sample_schema1();
        let layers = vec![
            Descriptor::new(super::super::MT_DOCKER_LAYER_GZIP, 10, digest(1)),
            Descriptor::new(super::super::MT_DOCKER_LAYER_GZIP, 20, digest(2)),
        ];
        let diff_ids = vec![digest(1), digest(2)];
        let out = schema1_to_schema2(&m, layers, diff_ids).unwrap();
        assert_eq!(out.manifest.layers.len(), 2);
        let config: ImageConfiguration = serde_json::from_slice(&out.config_bytes).unwrap();
        assert_eq!(config.rootfs.diff_ids.len(), 2);
        assert_eq!(config.history.len(), 2);
        assert_eq!(
            config.history[1].created_by.as_deref(),
            Some("/bin/sh -c echo hi")
        );
    }

    #[test]
    fn rejects_mismatched_layer_descriptor_count() {
        let m = sample_schema1();
        let out = schema1_to_schema2(&m, vec![], vec![]);
        assert!(out.is_err());
    }

    #[test]
    fn schema2_oci1_round_trip_preserves_descriptors() {
        let s2 = Schema2::new(
            Descriptor::new(MT_DOCKER_CONTAINER_CONFIG, 5, digest(3)),
            vec![Descriptor::new(super::super::MT_DOCKER_LAYER_GZIP, 6, digest(4))],
        );
        let oci = schema2_to_oci1(&s2);
        assert_eq!(oci.config.media_type, MT_OCI1_CONFIG);
        let back = oci1_to_schema2(&oci).unwrap();
        assert_eq!(back.config.digest, s2.config.digest);
        assert_eq!(back.layers[0].media_type, super::super::MT_DOCKER_LAYER_GZIP);
    }

    #[test]
    fn oci1_to_schema2_rejects_uncompressed_layer() {
        let oci = Oci1Manifest::new(
            Descriptor::new(MT_OCI1_CONFIG, 1, digest(5)),
            vec![Descriptor::new(super::super::MT_OCI1_LAYER, 2, digest(6))],
        );
        assert!(oci1_to_schema2(&oci).is_err());
    }

    #[test]
    fn list_index_round_trip() {
        let list = Schema2List::new(vec![Descriptor::new(
            super::super::MT_DOCKER_SCHEMA2,
            1,
            digest(7),
        )]);
        let idx = schema2_list_to_oci1_index(&list);
        assert_eq!(idx.manifests[0].media_type, super::super::MT_OCI1_MANIFEST);
        let back = oci1_index_to_schema2_list(&idx).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn empty_index_rejected() {
        let idx = Oci1Index::new(vec![]);
        assert!(oci1_index_to_schema2_list(&idx).is_err());
    }
}
