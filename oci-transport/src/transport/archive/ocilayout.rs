//! OCI image-layout reading, both from inside a tar (the `oci-archive:`
//! transport) and, via [`crate::transport::dir`], straight off a directory.

use super::tarhelpers::{blob_path, read_entry};
use super::ArchiveSource;
use crate::digest::Digest;
use crate::manifest::oci1::Oci1Index;
use crate::manifest::Descriptor;
use crate::reference::ArchiveSelector;
use crate::transport::{BlobStream, TransportError};
use bytes::Bytes;

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Selects an entry out of `index.json` the same way [`super::dockersave`]
/// selects out of `manifest.json`: `NamedTagged` matches the conventional
/// `org.opencontainers.image.ref.name` annotation, a numeric index indexes
/// directly, and no selector requires exactly one entry.
fn select_descriptor<'a>(manifests: &'a [Descriptor], selector: &ArchiveSelector) -> Result<&'a Descriptor, TransportError> {
    match selector {
        ArchiveSelector::NamedTagged { tag, .. } => manifests
            .iter()
            .find(|d| d.annotations.get(REF_NAME_ANNOTATION).map(|v| v.as_str()) == Some(tag.as_str()))
            .ok_or(TransportError::ManifestUnknown),
        ArchiveSelector::SourceIndex(i) => manifests.get(*i).ok_or(TransportError::ManifestUnknown),
        ArchiveSelector::None => match manifests {
            [single] => Ok(single),
            _ => Err(TransportError::ManifestUnknown),
        },
    }
}

pub fn read_manifest_from_tar(
    source: &ArchiveSource,
    instance_digest: Option<&Digest>,
) -> Result<(Vec<u8>, String), TransportError> {
    source.with_locked_file(|file| {
        if let Some(digest) = instance_digest {
            let bytes = read_entry(file, &blob_path(digest))?.ok_or(TransportError::ManifestUnknown)?;
            let media_type = crate::manifest::sniff_media_type(None, &bytes)?;
            return Ok((bytes, media_type));
        }
        let index_bytes = read_entry(file, "index.json")?.ok_or(TransportError::ManifestUnknown)?;
        let index: Oci1Index = serde_json::from_slice(&index_bytes)?;
        let chosen = select_descriptor(&index.manifests, &source.reference.archive_selector)?;
        let bytes = read_entry(file, &blob_path(&chosen.digest))?.ok_or(TransportError::ManifestUnknown)?;
        Ok((bytes, chosen.media_type.clone()))
    })
}

pub fn read_blob_from_tar(source: &ArchiveSource, digest: &Digest) -> Result<(BlobStream, i64), TransportError> {
    source.with_locked_file(|file| {
        let bytes = read_entry(file, &blob_path(digest))?.ok_or_else(|| TransportError::BlobUnknown(digest.clone()))?;
        let size = bytes.len() as i64;
        let stream = futures_util::stream::once(async move { Ok(Bytes::from(bytes)) });
        Ok((Box::pin(stream) as BlobStream, size))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Descriptor;

    #[test]
    fn index_with_no_manifests_is_manifest_unknown() {
        let index = Oci1Index::new(vec![]);
        assert!(select_descriptor(&index.manifests, &ArchiveSelector::None).is_err());
    }

    #[test]
    fn select_descriptor_matches_ref_name_annotation() {
        let digest_a = Digest::of_bytes(crate::digest::Algorithm::Sha256, b"a");
        let digest_b = Digest::of_bytes(crate::digest::Algorithm::Sha256, b"b");
        let mut a = Descriptor::new(crate::manifest::MT_OCI1_MANIFEST, 1, digest_a);
        a.annotations.insert(REF_NAME_ANNOTATION.to_string(), "v1".to_string());
        let mut b = Descriptor::new(crate::manifest::MT_OCI1_MANIFEST, 1, digest_b.clone());
        b.annotations.insert(REF_NAME_ANNOTATION.to_string(), "latest".to_string());
        let manifests = vec![a, b];
        let selector = ArchiveSelector::NamedTagged { domain: "docker.io".to_string(), path: "library/x".to_string(), tag: "latest".to_string() };
        let chosen = select_descriptor(&manifests, &selector).unwrap();
        assert_eq!(chosen.digest, digest_b);
    }

    #[test]
    fn blob_path_uses_algorithm_and_hex() {
        let digest = Digest::of_bytes(crate::digest::Algorithm::Sha256, b"x");
        assert_eq!(blob_path(&digest), format!("blobs/sha256/{}", digest.hex()));
    }

    #[test]
    fn descriptor_platform_is_optional_in_index_entries() {
        let digest = Digest::of_bytes(crate::digest::Algorithm::Sha256, b"y");
        let d = Descriptor::new(crate::manifest::MT_OCI1_MANIFEST, 1, digest);
        assert!(d.platform.is_none());
    }
}
