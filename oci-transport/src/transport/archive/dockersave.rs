//! Reading the `docker save` tar layout: a top-level `manifest.json` naming
//! a single image's config (`<hex>.json`) and layers (`<hex>/layer.tar`) by
//! path, per spec.md §6.

use super::tarhelpers::read_entry;
use super::ArchiveSource;
use crate::digest::{Algorithm, Digest};
use crate::manifest::schema2::Schema2;
use crate::manifest::Descriptor;
use crate::reference::ArchiveSelector;
use crate::transport::{BlobStream, TransportError};
use bytes::Bytes;
use serde::Deserialize;

#[derive(Deserialize)]
struct ManifestItem {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Item selection per spec.md §4.7.1: an explicit `NamedTagged` reference
/// scans for a matching `RepoTag`; a numeric source index indexes directly;
/// neither requires exactly one item in the archive.
fn select_item<'a>(items: &'a [ManifestItem], selector: &ArchiveSelector) -> Result<&'a ManifestItem, TransportError> {
    match selector {
        ArchiveSelector::NamedTagged { domain, path, tag } => {
            let wanted = format!("{domain}/{path}:{tag}");
            items
                .iter()
                .find(|item| item.repo_tags.iter().any(|t| *t == wanted))
                .ok_or(TransportError::ManifestUnknown)
        }
        ArchiveSelector::SourceIndex(i) => items.get(*i).ok_or(TransportError::ManifestUnknown),
        ArchiveSelector::None => match items {
            [single] => Ok(single),
            _ => Err(TransportError::ManifestUnknown),
        },
    }
}

pub fn read_manifest(
    source: &ArchiveSource,
    instance_digest: Option<&Digest>,
) -> Result<(Vec<u8>, String), TransportError> {
    if instance_digest.is_some() {
        // docker-save archives hold exactly one platform; there is no list
        // to index into.
        return Err(TransportError::ManifestUnknown);
    }
    source.with_locked_file(|file| {
        let raw = read_entry(file, "manifest.json")?.ok_or(TransportError::ManifestUnknown)?;
        let items: Vec<ManifestItem> = serde_json::from_slice(&raw)?;
        let item = select_item(&items, &source.reference.archive_selector)?;

        let config_bytes = read_entry(file, &item.config)?.ok_or(TransportError::ManifestUnknown)?;
        let config_digest = Digest::of_bytes(Algorithm::Sha256, &config_bytes);
        let config = Descriptor::new(
            crate::manifest::MT_DOCKER_CONTAINER_CONFIG,
            config_bytes.len() as i64,
            config_digest,
        );

        let mut layers = Vec::with_capacity(item.layers.len());
        for layer_path in &item.layers {
            let bytes = read_entry(file, layer_path)?.ok_or(TransportError::ManifestUnknown)?;
            let digest = Digest::of_bytes(Algorithm::Sha256, &bytes);
            let media_type = if bytes.starts_with(&[0x1f, 0x8b]) {
                crate::manifest::MT_DOCKER_LAYER_GZIP
            } else {
                // docker save's legacy uncompressed layer form has no
                // distinct Docker media type; label it the same as gzip,
                // matching how schema2 manifests are required to declare it
                // regardless of the bytes' actual compression.
                crate::manifest::MT_DOCKER_LAYER_GZIP
            };
            layers.push(Descriptor::new(media_type, bytes.len() as i64, digest));
        }

        let manifest = Schema2::new(config, layers);
        let bytes = serde_json::to_vec(&manifest)?;
        Ok((bytes, crate::manifest::MT_DOCKER_SCHEMA2.to_string()))
    })
}

pub fn read_layer_blob(source: &ArchiveSource, digest: &Digest) -> Result<(BlobStream, i64), TransportError> {
    source.with_locked_file(|file| {
        let bytes = read_entry(file, &super::tarhelpers::legacy_layer_path(digest))?
            .ok_or_else(|| TransportError::BlobUnknown(digest.clone()))?;
        let size = bytes.len() as i64;
        let stream = futures_util::stream::once(async move { Ok(Bytes::from(bytes)) });
        Ok((Box::pin(stream) as BlobStream, size))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_item_parses_expected_shape() {
        let raw = br#"[{"Config":"aa.json","RepoTags":["docker.io/library/busybox:latest"],"Layers":["bb/layer.tar"]}]"#;
        let items: Vec<ManifestItem> = serde_json::from_slice(raw).unwrap();
        assert_eq!(items[0].config, "aa.json");
        assert_eq!(items[0].layers, vec!["bb/layer.tar"]);
    }

    #[test]
    fn select_item_matches_named_tagged_repo_tag() {
        let items = vec![
            ManifestItem { config: "a.json".to_string(), repo_tags: vec!["docker.io/library/alpine:latest".to_string()], layers: vec![] },
            ManifestItem { config: "b.json".to_string(), repo_tags: vec!["docker.io/library/busybox:latest".to_string()], layers: vec![] },
        ];
        let selector = ArchiveSelector::NamedTagged {
            domain: "docker.io".to_string(),
            path: "library/busybox".to_string(),
            tag: "latest".to_string(),
        };
        let chosen = select_item(&items, &selector).unwrap();
        assert_eq!(chosen.config, "b.json");
    }

    #[test]
    fn select_item_requires_exactly_one_when_no_selector() {
        let items = vec![
            ManifestItem { config: "a.json".to_string(), repo_tags: vec![], layers: vec![] },
            ManifestItem { config: "b.json".to_string(), repo_tags: vec![], layers: vec![] },
        ];
        assert!(select_item(&items, &ArchiveSelector::None).is_err());
    }
}
