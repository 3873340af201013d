//! The copy orchestrator: moves a manifest and its blobs from one
//! [`ImageSource`] to one [`ImageDestination`], converting the manifest
//! format and selecting a platform out of a list as needed.
//!
//! Eight steps, mirroring the shape every image-copy tool converges on:
//! resolve the source manifest, pick a destination manifest type, copy the
//! config blob, copy each layer (deduplicating against blobs the
//! destination or the blob-info cache already has), convert the manifest,
//! carry over signatures, put the manifest, and commit.

pub mod platform;
pub mod progress;

use crate::blobinfo::BlobInfo;
use crate::cache::{Cache, Location};
use crate::digest::Digest;
use crate::manifest::{self, convert, Manifest, Platform};
use crate::signing::Signer;
use crate::transport::{ImageDestination, ImageSource, TransportError};
use progress::{ProgressEvent, RateLimitedProgress};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Manifest(#[from] manifest::ManifestError),
    #[error("no destination manifest type is compatible with the source manifest")]
    NoCompatibleManifestType,
    #[error("destination does not support forced manifest type {0:?}")]
    UnsupportedForcedManifestMime(String),
}

pub struct CopyOptions {
    pub platform_selector: Option<Platform>,
    /// Upper bound on concurrent layer copies. Only honored when the source
    /// advertises `has_thread_safe_get_blob() == true`; archive sources
    /// share one file handle and are always copied one layer at a time
    /// regardless of this value.
    pub max_parallel_layers: usize,
    /// Drop the source's signatures instead of carrying them over.
    pub remove_signatures: bool,
    /// Sign the pushed manifest and add the result as an additional
    /// signature, independent of `remove_signatures`.
    pub sign_by: Option<Arc<dyn Signer>>,
    /// Force the destination manifest to a specific media type rather than
    /// letting step 2 pick the first one both sides agree on. An error if
    /// the destination doesn't list it in `supported_manifest_mime_types()`.
    pub force_manifest_mime: Option<String>,
    /// Skip any layer edits even if `layer_editor` is set; used when the
    /// caller needs the destination's blobs to match the source exactly
    /// (e.g. for digest-pinned mirrors).
    pub preserve_digests: bool,
    /// Rewrite the layer list (e.g. to drop or reorder blobs) right before
    /// the per-layer copy loop. Ignored when `preserve_digests` is set.
    pub layer_editor: Option<Box<dyn Fn(Vec<BlobInfo>) -> Vec<BlobInfo> + Send + Sync>>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            platform_selector: None,
            max_parallel_layers: 4,
            remove_signatures: false,
            sign_by: None,
            force_manifest_mime: None,
            preserve_digests: false,
            layer_editor: None,
        }
    }
}

pub async fn copy_image(
    source: &dyn ImageSource,
    destination: &dyn ImageDestination,
    cache: &Cache,
    options: &CopyOptions,
    progress: &RateLimitedProgress<impl progress::ProgressSink>,
) -> Result<(), CopyError> {
    // 1. resolve the source manifest, dereferencing a list down to one
    // platform instance if needed.
    let (top_bytes, top_media_type) = source.get_manifest(None).await?;
    let top = manifest::parse(&top_media_type, &top_bytes)?;

    let (manifest_bytes, media_type, manifest_obj, instance_digest) = if top.is_list() {
        let want = options
            .platform_selector
            .clone()
            .unwrap_or_else(|| Platform { architecture: "amd64".to_string(), os: "linux".to_string(), os_version: None, os_features: vec![], variant: None });
        let chosen = platform::select(&top.instances(), &want).ok_or(manifest::ManifestError::NoMatchingPlatform)?;
        let (bytes, mt) = source.get_manifest(Some(&chosen.digest)).await?;
        let parsed = manifest::parse(&mt, &bytes)?;
        (bytes, mt, parsed, Some(chosen.digest))
    } else {
        (top_bytes, top_media_type, top, None)
    };

    // 2. determine the destination manifest type: keep the source type if
    // the destination accepts it, otherwise convert. `force_manifest_mime`
    // narrows the accepted set down to exactly one candidate up front.
    let mut supported = destination.supported_manifest_mime_types();
    if let Some(forced) = &options.force_manifest_mime {
        if !supported.iter().any(|s| s == forced) {
            return Err(CopyError::UnsupportedForcedManifestMime(forced.clone()));
        }
        supported = vec![forced.clone()];
    }
    let (final_manifest, final_media_type, config_bytes, fallback) =
        prepare_manifest_for_destination(source, &manifest_obj, &supported).await?;

    // 3 & 4: copy the config blob (if any) and every layer, checking the
    // blob-info cache and the destination's own knowledge of what it
    // already has before re-uploading bytes.
    if let Some(config) = final_manifest.config() {
        if let Some(bytes) = &config_bytes {
            put_prepared_blob(destination, cache, config.digest.clone(), bytes.clone(), config.media_type.clone()).await?;
        } else {
            copy_blob(source, destination, cache, config, None).await?;
        }
    }

    let mut layers = final_manifest.layers();
    if !options.preserve_digests {
        if let Some(editor) = &options.layer_editor {
            let infos: Vec<BlobInfo> = layers
                .iter()
                .map(|d| BlobInfo::new(d.digest.clone(), d.size).with_media_type(d.media_type.clone()))
                .collect();
            layers = editor(infos)
                .into_iter()
                .map(|info| crate::manifest::Descriptor::new(info.media_type.unwrap_or_default(), info.size, info.digest.expect("edited layer retains a digest")))
                .collect();
        }
    }
    let total = layers.len();
    let parallelism = if source.has_thread_safe_get_blob() { options.max_parallel_layers.max(1) } else { 1 };
    {
        use futures_util::{stream, TryStreamExt};
        stream::iter(layers.into_iter().enumerate().map(Ok::<_, CopyError>))
            .try_for_each_concurrent(Some(parallelism), |(i, layer)| async move {
                progress.report(ProgressEvent::LayerStarted { index: i, total });
                copy_blob(source, destination, cache, &layer, Some((i, progress))).await?;
                progress.report(ProgressEvent::LayerFinished { index: i });
                Ok(())
            })
            .await?;
    }

    let final_bytes = final_manifest.serialize()?;

    // 5 & 6. signatures: drop, carry over, or add a fresh one from
    // `sign_by`, independent of whether the source's were kept.
    let mut signatures = if options.remove_signatures { Vec::new() } else { source.get_signatures(instance_digest.as_ref()).await? };
    if let Some(signer) = &options.sign_by {
        let manifest_digest = Digest::of_bytes(crate::digest::Algorithm::Sha256, &final_bytes);
        if let Some(sig) = signer.sign(&manifest_digest) {
            signatures.push(sig);
        }
    }
    destination.put_signatures(&signatures, instance_digest.as_ref()).await?;

    // 7. put the manifest, falling back to a less-preferred encoding (e.g.
    // schema2 after an OCI1 conversion) if the destination rejects the
    // first candidate despite advertising support for it.
    let mut candidates = vec![(final_bytes, final_media_type)];
    if let Some((fallback_manifest, fallback_media_type)) = fallback {
        candidates.push((fallback_manifest.serialize()?, fallback_media_type));
    }
    destination.put_manifest_with_fallback(&candidates, instance_digest.as_ref()).await?;
    progress.report(ProgressEvent::ManifestPut);

    // 8. commit (archive transports flush their staged tar here).
    destination.commit().await?;

    let _ = manifest_bytes;
    let _ = media_type;
    Ok(())
}

/// Decide how to get from the source manifest's format to one the
/// destination accepts, returning the manifest to actually push, its media
/// type, the freshly synthesized config blob bytes when schema1 was
/// converted to schema2 (since schema1 has none to copy from the source),
/// and a fallback (manifest, media type) to retry with if the destination
/// rejects the first candidate despite listing it as supported.
async fn prepare_manifest_for_destination(
    source: &dyn ImageSource,
    manifest: &Manifest,
    supported: &[String],
) -> Result<(Manifest, String, Option<Vec<u8>>, Option<(Manifest, String)>), CopyError> {
    if supported.iter().any(|s| s == manifest.media_type()) {
        return Ok((manifest.clone(), manifest.media_type().to_string(), None, None));
    }

    match manifest {
        Manifest::Schema1Unsigned(s1) | Manifest::Schema1Signed(s1, _) => {
            // Schema1 -> OCI1 always goes through Schema2 first: there is
            // exactly one codepath that knows how to synthesize a config
            // blob from embedded v1Compatibility history, and duplicating
            // it for a direct Schema1 -> OCI1 conversion would be two ways
            // to get the same bytes.
            let mut layer_descriptors = Vec::with_capacity(s1.fs_layers.len());
            let mut diff_ids = Vec::with_capacity(s1.fs_layers.len());
            for fs_layer in s1.fs_layers.iter().rev() {
                let info = BlobInfo::new(fs_layer.blob_sum.clone(), -1);
                let (stream, size) = source.get_blob(&info, None).await?;
                let bytes = drain(stream).await?;
                let digest = crate::digest::Digest::of_bytes(crate::digest::Algorithm::Sha256, &bytes);
                layer_descriptors.push(crate::manifest::Descriptor::new(
                    crate::manifest::MT_DOCKER_LAYER_GZIP,
                    size.max(bytes.len() as i64),
                    fs_layer.blob_sum.clone(),
                ));
                diff_ids.push(digest);
            }
            let converted = convert::schema1_to_schema2(s1, layer_descriptors, diff_ids)?;
            if supported.iter().any(|s| s == manifest::MT_DOCKER_SCHEMA2) {
                return Ok((Manifest::Schema2(converted.manifest), manifest::MT_DOCKER_SCHEMA2.to_string(), Some(converted.config_bytes), None));
            }
            let oci = convert::schema2_to_oci1(&converted.manifest);
            // A registry that claims OCI1 support but actually enforces
            // Docker media types (MANIFEST_INVALID) can still take the
            // Schema2 we already built along the way.
            let fallback = Some((Manifest::Schema2(converted.manifest.clone()), manifest::MT_DOCKER_SCHEMA2.to_string()));
            Ok((Manifest::Oci1(oci), manifest::MT_OCI1_MANIFEST.to_string(), Some(converted.config_bytes), fallback))
        }
        Manifest::Schema2(s2) => {
            let oci = convert::schema2_to_oci1(s2);
            Ok((Manifest::Oci1(oci), manifest::MT_OCI1_MANIFEST.to_string(), None, None))
        }
        Manifest::Oci1(oci) => {
            let s2 = convert::oci1_to_schema2(oci)
                .map_err(|_| CopyError::NoCompatibleManifestType)?;
            Ok((Manifest::Schema2(s2), manifest::MT_DOCKER_SCHEMA2.to_string(), None, None))
        }
        Manifest::Schema2List(_) | Manifest::Oci1Index(_) => Err(CopyError::NoCompatibleManifestType),
    }
}

async fn drain(mut stream: crate::transport::BlobStream) -> Result<Vec<u8>, TransportError> {
    use futures_util::StreamExt;
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk.map_err(TransportError::Io)?);
    }
    Ok(buf)
}

async fn put_prepared_blob(
    destination: &dyn ImageDestination,
    cache: &Cache,
    digest: Digest,
    bytes: Vec<u8>,
    media_type: String,
) -> Result<(), CopyError> {
    let info = BlobInfo::new(digest.clone(), bytes.len() as i64).with_media_type(media_type);
    let stream = Box::pin(futures_util::stream::once(async move { Ok(bytes::Bytes::from(bytes)) }));
    destination.put_blob(stream, &info).await?;
    cache.record_known_location(&digest, Location { transport_scope: destination.transport_scope(), opaque_reference: digest.to_string() });
    Ok(())
}

/// Given a candidate's cache scope and the destination's own scope, derive a
/// docker registry cross-repo mount source (`from=` on the blob-mount API),
/// which only makes sense between two `docker://` scopes on the same host.
fn docker_mount_from(candidate_scope: &str, dest_scope: &str) -> Option<String> {
    let candidate_path = candidate_scope.strip_prefix("docker://")?;
    let dest_path = dest_scope.strip_prefix("docker://")?;
    let (candidate_host, candidate_repo) = candidate_path.split_once('/')?;
    let (dest_host, dest_repo) = dest_path.split_once('/')?;
    if candidate_host == dest_host && candidate_repo != dest_repo {
        Some(candidate_repo.to_string())
    } else {
        None
    }
}

async fn copy_blob(
    source: &dyn ImageSource,
    destination: &dyn ImageDestination,
    cache: &Cache,
    descriptor: &crate::manifest::Descriptor,
    progress: Option<(usize, &RateLimitedProgress<impl progress::ProgressSink>)>,
) -> Result<(), CopyError> {
    let info = BlobInfo::new(descriptor.digest.clone(), descriptor.size).with_media_type(descriptor.media_type.clone());

    if destination.try_reuse_blob(&info).await?.is_some() {
        return Ok(());
    }

    let dest_scope = destination.transport_scope();
    let mount_from = cache
        .candidate_locations(&descriptor.digest, &dest_scope)
        .iter()
        .find_map(|loc| docker_mount_from(&loc.transport_scope, &dest_scope));

    let (mut stream, _size) = source.get_blob(&info, None).await?;
    if let Some((index, sink)) = progress {
        use futures_util::StreamExt;
        let mut delivered: u64 = 0;
        let instrumented = async_stream_adapter(&mut stream, &mut delivered, index, sink);
        destination.put_blob_from(Box::pin(instrumented), &info, mount_from.as_deref()).await?;
    } else {
        destination.put_blob_from(stream, &info, mount_from.as_deref()).await?;
    }

    cache.record_known_location(&descriptor.digest, Location { transport_scope: dest_scope, opaque_reference: descriptor.digest.to_string() });
    Ok(())
}

/// Wrap a blob stream so each chunk also reports progress, without
/// buffering the whole blob in memory the way [`drain`] does for the
/// schema1 synthesis path (which genuinely needs the full bytes to hash).
fn async_stream_adapter<'a>(
    stream: &'a mut crate::transport::BlobStream,
    delivered: &'a mut u64,
    index: usize,
    sink: &'a RateLimitedProgress<impl progress::ProgressSink>,
) -> impl futures_core::Stream<Item = std::io::Result<bytes::Bytes>> + 'a {
    use futures_util::StreamExt;
    stream.by_ref().map(move |chunk| {
        if let Ok(c) = &chunk {
            *delivered += c.len() as u64;
            sink.report(ProgressEvent::LayerBytes { index, bytes_done: *delivered, bytes_total: -1 });
        }
        chunk
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_options_default_parallelism_is_positive() {
        assert!(CopyOptions::default().max_parallel_layers > 0);
    }

    #[test]
    fn copy_options_defaults_do_not_alter_copy_semantics() {
        let options = CopyOptions::default();
        assert!(!options.remove_signatures);
        assert!(options.sign_by.is_none());
        assert!(options.force_manifest_mime.is_none());
        assert!(!options.preserve_digests);
        assert!(options.layer_editor.is_none());
        assert!(options.platform_selector.is_none());
    }
}
