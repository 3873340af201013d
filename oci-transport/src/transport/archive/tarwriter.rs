//! Temp-file-backed incremental archive writer shared by both archive
//! kinds. Blobs and the manifest accumulate in a staging directory next to
//! the destination path; [`StagingWriter::finish`] tars the staging
//! directory into its final shape and renames it into place, so a reader
//! opening the destination path never observes a partially written archive.

use crate::digest::Digest;
use crate::transport::TransportError;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::ArchiveKind;

pub struct StagingWriter {
    dir: tempfile::TempDir,
    blobs: BTreeMap<Digest, PathBuf>,
    /// keyed by instance digest string, `""` for the single/primary manifest.
    manifests: BTreeMap<String, (Vec<u8>, String)>,
    /// `name:tag` to record as `RepoTags`/`repositories`; only ever set for
    /// docker-save destinations with a tagged (not digest-only) reference.
    repo_tag: Option<String>,
}

impl StagingWriter {
    pub fn new(final_path: &Path) -> Result<Self, TransportError> {
        let parent = final_path.parent().unwrap_or_else(|| Path::new("."));
        let dir = tempfile::Builder::new()
            .prefix(".oci-transport-staging-")
            .tempdir_in(parent)?;
        Ok(StagingWriter { dir, blobs: BTreeMap::new(), manifests: BTreeMap::new(), repo_tag: None })
    }

    pub fn set_repo_tag(&mut self, repo_tag: Option<String>) {
        self.repo_tag = repo_tag;
    }

    pub fn write_blob(&mut self, digest: &Digest, bytes: &[u8]) -> Result<(), TransportError> {
        let alg_dir = self.dir.path().join("blobs").join(digest.algorithm().as_str());
        std::fs::create_dir_all(&alg_dir)?;
        let blob_path = alg_dir.join(digest.hex());
        std::fs::write(&blob_path, bytes)?;
        self.blobs.insert(digest.clone(), blob_path);
        Ok(())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blobs.contains_key(digest)
    }

    fn blob_bytes(&self, digest: &Digest) -> Result<Vec<u8>, TransportError> {
        let path = self.blobs.get(digest).ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("blob {digest} was never written"),
            ))
        })?;
        Ok(std::fs::read(path)?)
    }

    pub fn write_manifest(&mut self, bytes: &[u8], media_type: &str, instance_digest: Option<&Digest>) -> Result<(), TransportError> {
        let key = instance_digest.map(|d| d.to_string()).unwrap_or_default();
        self.manifests.insert(key, (bytes.to_vec(), media_type.to_string()));
        Ok(())
    }

    pub fn finish(&mut self, kind: ArchiveKind, final_path: &Path) -> Result<(), TransportError> {
        match kind {
            ArchiveKind::OciArchive => self.finish_oci(final_path),
            ArchiveKind::DockerSave => self.finish_docker_save(final_path),
        }
    }

    fn primary_manifest(&self) -> Result<&(Vec<u8>, String), TransportError> {
        self.manifests.get("").ok_or_else(|| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "no manifest was written before commit"))
        })
    }

    fn finish_oci(&mut self, final_path: &Path) -> Result<(), TransportError> {
        let (manifest_bytes, media_type) = self.primary_manifest()?.clone();
        let digest = Digest::of_bytes(crate::digest::Algorithm::Sha256, &manifest_bytes);
        self.write_blob(&digest, &manifest_bytes)?;

        std::fs::write(
            self.dir.path().join("oci-layout"),
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": media_type,
                "size": manifest_bytes.len(),
                "digest": digest.to_string(),
            }],
        });
        std::fs::write(self.dir.path().join("index.json"), serde_json::to_vec(&index)?)?;

        self.tar_staging_dir_to(final_path, &["oci-layout".to_string(), "index.json".to_string(), "blobs".to_string()])
    }

    /// Lays out the historical `docker save` shape per spec.md §6: a flat
    /// `manifest.json`, one `<config-hex>.json` per image, one
    /// `<layer-hex>/layer.tar` per layer, and a legacy `repositories` file.
    /// Blob bytes are taken verbatim from whatever this writer received via
    /// [`Self::write_blob`] — this repo never decompresses/recompresses
    /// layers on the writer's behalf, so a `layer.tar` here may actually be
    /// gzip-compressed, unlike a real `docker save` which always stores
    /// layers uncompressed. Round-tripping through this crate's own reader
    /// is unaffected since the reader makes the same assumption.
    fn finish_docker_save(&mut self, final_path: &Path) -> Result<(), TransportError> {
        let (manifest_bytes, media_type) = self.primary_manifest()?.clone();
        if media_type != crate::manifest::MT_DOCKER_SCHEMA2 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "docker-save archives only hold a single-platform schema2 manifest",
            )));
        }
        let manifest: crate::manifest::schema2::Schema2 = serde_json::from_slice(&manifest_bytes)?;

        let mut entries = Vec::new();

        let config_name = super::tarhelpers::legacy_config_path(&manifest.config.digest);
        let config_bytes = self.blob_bytes(&manifest.config.digest)?;
        std::fs::write(self.dir.path().join(&config_name), &config_bytes)?;
        entries.push(config_name.clone());

        let mut layer_paths = Vec::with_capacity(manifest.layers.len());
        let mut layer_sources = serde_json::Map::new();
        for layer in &manifest.layers {
            let layer_name = super::tarhelpers::legacy_layer_path(&layer.digest);
            let layer_dir = self.dir.path().join(layer.digest.hex());
            std::fs::create_dir_all(&layer_dir)?;
            let bytes = self.blob_bytes(&layer.digest)?;
            std::fs::write(layer_dir.join("layer.tar"), &bytes)?;
            entries.push(layer.digest.hex());
            layer_sources.insert(
                layer.digest.to_string(),
                serde_json::json!({
                    "mediaType": layer.media_type,
                    "size": layer.size,
                    "digest": layer.digest.to_string(),
                }),
            );
            layer_paths.push(layer_name);
        }

        let repo_tags: Vec<String> = self.repo_tag.iter().cloned().collect();
        let doc = serde_json::json!([{
            "Config": config_name,
            "RepoTags": repo_tags,
            "Layers": layer_paths,
            "LayerSources": layer_sources,
        }]);
        std::fs::write(self.dir.path().join("manifest.json"), serde_json::to_vec(&doc)?)?;
        entries.push("manifest.json".to_string());

        if let Some(tag) = &self.repo_tag {
            let top_layer = manifest.layers.last().map(|l| l.digest.hex()).unwrap_or_default();
            if let Some((name, t)) = tag.rsplit_once(':') {
                let repositories = serde_json::json!({ name: { t: top_layer } });
                std::fs::write(self.dir.path().join("repositories"), serde_json::to_vec(&repositories)?)?;
                entries.push("repositories".to_string());
            }
        }

        self.tar_staging_dir_to(final_path, &entries)
    }

    /// Tars exactly the named top-level entries (files or directories)
    /// relative to the staging dir, rather than the whole staging dir, so
    /// e.g. a docker-save archive never picks up the `blobs/<alg>/<hex>`
    /// layout [`Self::write_blob`] uses for its own bookkeeping.
    fn tar_staging_dir_to(&self, final_path: &Path, entries: &[String]) -> Result<(), TransportError> {
        let tmp_tar = final_path.with_extension("oci-transport-tmp");
        {
            let file = std::fs::File::create(&tmp_tar)?;
            let mut builder = tar::Builder::new(file);
            for entry in entries {
                let full = self.dir.path().join(entry);
                if full.is_dir() {
                    builder.append_dir_all(entry, &full)?;
                } else {
                    builder.append_path_with_name(&full, entry)?;
                }
            }
            builder.into_inner()?.flush()?;
        }
        std::fs::rename(&tmp_tar, final_path)?;
        Ok(())
    }
}
