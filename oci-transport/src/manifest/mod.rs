//! The manifest model: a closed tagged union over the six on-wire manifest
//! kinds plus the image configuration blob, with MIME sniffing and
//! conversions between variants. See [`convert`] for the conversion engine
//! and [`schema1`] for the `fixManifestLayers` sanitization algorithm.

pub mod config;
pub mod convert;
pub mod schema1;
pub mod schema2;
pub mod oci1;

use crate::digest::Digest;
use std::collections::BTreeMap;

pub const MT_DOCKER_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MT_DOCKER_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MT_DOCKER_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MT_DOCKER_SCHEMA2_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MT_DOCKER_CONTAINER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MT_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MT_OCI1_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MT_OCI1_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MT_OCI1_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MT_OCI1_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MT_OCI1_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MT_OCI1_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("malformed manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown manifest format")]
    UnknownManifestFormat,
    #[error("schema1 corruption: {0}")]
    SchemaCorruption(String),
    #[error("schema1 history entry {index} has parent {parent:?}, expected {expected}")]
    InvalidParentID {
        index: usize,
        parent: String,
        expected: String,
    },
    #[error("manifest list has no entries")]
    EmptyList,
    #[error("{from} cannot be converted to {to}: {reason}")]
    IncompatibleConversion {
        from: &'static str,
        to: &'static str,
        reason: String,
    },
    #[error("no manifest in the list matches the requested platform")]
    NoMatchingPlatform,
    #[error("missing uncompressed digest for layer {0}; caller must supply it")]
    MissingUncompressedDigest(Digest),
}

/// A content descriptor: digest, size, media type, plus optional annotations
/// and (for list/index entries) a target platform.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: i64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, size: i64, digest: Digest) -> Self {
        Descriptor {
            media_type: media_type.into(),
            size,
            digest,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            platform: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// The tagged union over every manifest kind this system understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Schema1Unsigned(schema1::Schema1),
    Schema1Signed(schema1::Schema1, schema1::Signature),
    Schema2(schema2::Schema2),
    Schema2List(schema2::Schema2List),
    Oci1(oci1::Oci1Manifest),
    Oci1Index(oci1::Oci1Index),
}

impl Manifest {
    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Schema1Unsigned(_) => MT_DOCKER_SCHEMA1,
            Manifest::Schema1Signed(_, _) => MT_DOCKER_SCHEMA1_SIGNED,
            Manifest::Schema2(_) => MT_DOCKER_SCHEMA2,
            Manifest::Schema2List(_) => MT_DOCKER_SCHEMA2_LIST,
            Manifest::Oci1(_) => MT_OCI1_MANIFEST,
            Manifest::Oci1Index(_) => MT_OCI1_INDEX,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Manifest::Schema2List(_) | Manifest::Oci1Index(_))
    }

    /// Layer descriptors in bottom-to-top order. Empty for list manifests.
    pub fn layers(&self) -> Vec<Descriptor> {
        match self {
            Manifest::Schema1Unsigned(s) | Manifest::Schema1Signed(s, _) => s
                .fs_layers
                .iter()
                .rev()
                .map(|l| Descriptor::new("", -1, l.blob_sum.clone()))
                .collect(),
            Manifest::Schema2(s) => s.layers.clone(),
            Manifest::Oci1(o) => o.layers.clone(),
            Manifest::Schema2List(_) | Manifest::Oci1Index(_) => Vec::new(),
        }
    }

    pub fn config(&self) -> Option<&Descriptor> {
        match self {
            Manifest::Schema2(s) => Some(&s.config),
            Manifest::Oci1(o) => Some(&o.config),
            _ => None,
        }
    }

    /// Instance descriptors for list manifests, empty otherwise.
    pub fn instances(&self) -> Vec<Descriptor> {
        match self {
            Manifest::Schema2List(l) => l.manifests.clone(),
            Manifest::Oci1Index(i) => i.manifests.clone(),
            _ => Vec::new(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ManifestError> {
        let v = match self {
            Manifest::Schema1Unsigned(s) => serde_json::to_vec(s)?,
            Manifest::Schema1Signed(s, sig) => sig.embed(s)?,
            Manifest::Schema2(s) => serde_json::to_vec(s)?,
            Manifest::Schema2List(s) => serde_json::to_vec(s)?,
            Manifest::Oci1(s) => serde_json::to_vec(s)?,
            Manifest::Oci1Index(s) => serde_json::to_vec(s)?,
        };
        Ok(v)
    }
}

/// MIME sniffing per the priority order in the spec: explicit Content-Type
/// (stripped of parameters) wins; otherwise inspect JSON structure.
pub fn sniff_media_type(explicit_content_type: Option<&str>, body: &[u8]) -> Result<String, ManifestError> {
    if let Some(ct) = explicit_content_type {
        let stripped = ct.split(';').next().unwrap_or(ct).trim();
        if !stripped.is_empty() {
            return Ok(stripped.to_string());
        }
    }
    sniff_from_body(body)
}

#[derive(serde::Deserialize)]
struct Probe {
    #[serde(default)]
    schema_version: Option<u64>,
    #[serde(rename = "schemaVersion", default)]
    schema_version_camel: Option<u64>,
    #[serde(default)]
    manifests: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    signatures: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(rename = "mediaType", default)]
    media_type_camel: Option<String>,
    #[serde(default)]
    config: Option<ConfigProbe>,
}

#[derive(serde::Deserialize)]
struct ConfigProbe {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
}

fn sniff_from_body(body: &[u8]) -> Result<String, ManifestError> {
    let probe: Probe = serde_json::from_slice(body)?;
    let schema_version = probe.schema_version_camel.or(probe.schema_version);
    let top_media_type = probe.media_type_camel.or(probe.media_type);

    if let Some(manifests) = &probe.manifests {
        let _ = manifests;
        return Ok(match top_media_type.as_deref() {
            Some(MT_OCI1_INDEX) => MT_OCI1_INDEX.to_string(),
            _ => MT_DOCKER_SCHEMA2_LIST.to_string(),
        });
    }
    if schema_version == Some(1) {
        return Ok(if probe.signatures.is_some() {
            MT_DOCKER_SCHEMA1_SIGNED.to_string()
        } else {
            MT_DOCKER_SCHEMA1.to_string()
        });
    }
    let config_media_type = probe.config.and_then(|c| c.media_type);
    if config_media_type.as_deref() == Some(MT_OCI1_CONFIG)
        || top_media_type.as_deref() == Some(MT_OCI1_MANIFEST)
    {
        return Ok(MT_OCI1_MANIFEST.to_string());
    }
    if schema_version == Some(2) {
        return Ok(MT_DOCKER_SCHEMA2.to_string());
    }
    Err(ManifestError::UnknownManifestFormat)
}

/// Parse raw bytes into a [`Manifest`], using the sniffed or supplied media
/// type to pick the variant.
pub fn parse(media_type: &str, body: &[u8]) -> Result<Manifest, ManifestError> {
    match media_type {
        MT_DOCKER_SCHEMA1 => Ok(Manifest::Schema1Unsigned(serde_json::from_slice(body)?)),
        MT_DOCKER_SCHEMA1_SIGNED => {
            let (s, sig) = schema1::Signature::parse_signed(body)?;
            Ok(Manifest::Schema1Signed(s, sig))
        }
        MT_DOCKER_SCHEMA2 => Ok(Manifest::Schema2(serde_json::from_slice(body)?)),
        MT_DOCKER_SCHEMA2_LIST => Ok(Manifest::Schema2List(serde_json::from_slice(body)?)),
        MT_OCI1_MANIFEST => Ok(Manifest::Oci1(serde_json::from_slice(body)?)),
        MT_OCI1_INDEX => Ok(Manifest::Oci1Index(serde_json::from_slice(body)?)),
        _ => {
            // media type header lied, or was absent and our caller didn't
            // sniff first; fall back to body sniffing once.
            let sniffed = sniff_from_body(body)?;
            if sniffed == media_type {
                return Err(ManifestError::UnknownManifestFormat);
            }
            parse(&sniffed, body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_schema2_by_schema_version_and_media_type() {
        let body = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{"mediaType":"application/vnd.docker.container.image.v1+json","size":1,"digest":"sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3"},"layers":[]}"#;
        assert_eq!(sniff_from_body(body).unwrap(), MT_DOCKER_SCHEMA2);
    }

    #[test]
    fn sniffs_oci1_by_config_media_type() {
        let body = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","size":1,"digest":"sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3"},"layers":[]}"#;
        assert_eq!(sniff_from_body(body).unwrap(), MT_OCI1_MANIFEST);
    }

    #[test]
    fn sniffs_list_vs_index_by_media_type() {
        let docker = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.list.v2+json","manifests":[]}"#;
        assert_eq!(sniff_from_body(docker).unwrap(), MT_DOCKER_SCHEMA2_LIST);

        let oci = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#;
        assert_eq!(sniff_from_body(oci).unwrap(), MT_OCI1_INDEX);
    }

    #[test]
    fn sniffs_schema1_with_and_without_signatures() {
        let unsigned = br#"{"schemaVersion":1,"name":"library/busybox","tag":"latest","architecture":"amd64","fsLayers":[],"history":[]}"#;
        assert_eq!(sniff_from_body(unsigned).unwrap(), MT_DOCKER_SCHEMA1);

        let signed = br#"{"schemaVersion":1,"name":"library/busybox","tag":"latest","architecture":"amd64","fsLayers":[],"history":[],"signatures":[]}"#;
        assert_eq!(sniff_from_body(signed).unwrap(), MT_DOCKER_SCHEMA1_SIGNED);
    }

    #[test]
    fn unknown_body_is_rejected() {
        assert!(sniff_from_body(br#"{"foo":"bar"}"#).is_err());
    }

    #[test]
    fn explicit_content_type_wins_and_strips_parameters() {
        let mt = sniff_media_type(
            Some("application/vnd.docker.distribution.manifest.v2+json; charset=utf-8"),
            br#"{"foo":"bar"}"#,
        )
        .unwrap();
        assert_eq!(mt, MT_DOCKER_SCHEMA2);
    }
}
