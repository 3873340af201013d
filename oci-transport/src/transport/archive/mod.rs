//! The tar archive layer: `docker save`-format tarballs and OCI
//! image-layout archives, both backed by a temp-file-staged writer so a
//! half-finished copy never leaves behind a half-written tar.

pub mod dockersave;
pub mod ocilayout;
mod tarhelpers;
pub mod tarwriter;

use crate::blobinfo::BlobInfo;
use crate::digest::Digest;
use crate::manifest::Descriptor;
use crate::reference::{Reference, TagOrDigest};
use crate::transport::{BlobStream, ByteRange, ImageDestination, ImageSource, TransportError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;

/// Shared state for both the docker-save and OCI-archive sources: the path
/// to the archive and, once opened, its index of name -> tar entry offset.
/// Archive reads share one open file handle, so [`ImageSource::has_thread_safe_get_blob`]
/// is `false` for both and the copy pipeline serializes blob reads from them.
pub struct ArchiveSource {
    pub path: PathBuf,
    pub reference: Reference,
    pub kind: ArchiveKind,
    file: Mutex<std::fs::File>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    DockerSave,
    OciArchive,
}

impl ArchiveSource {
    pub fn open(path: PathBuf, reference: Reference, kind: ArchiveKind) -> Result<Self, TransportError> {
        let file = std::fs::File::open(&path)?;
        Ok(ArchiveSource { path, reference, kind, file: Mutex::new(file) })
    }

    fn with_locked_file<T>(&self, f: impl FnOnce(&mut std::fs::File) -> Result<T, TransportError>) -> Result<T, TransportError> {
        let mut guard = self.file.lock().expect("archive file lock poisoned");
        f(&mut guard)
    }
}

#[async_trait]
impl ImageSource for ArchiveSource {
    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> Result<(Vec<u8>, String), TransportError> {
        match self.kind {
            ArchiveKind::DockerSave => dockersave::read_manifest(self, instance_digest),
            ArchiveKind::OciArchive => ocilayout::read_manifest_from_tar(self, instance_digest),
        }
    }

    async fn get_blob(&self, info: &BlobInfo, _range: Option<ByteRange>) -> Result<(BlobStream, i64), TransportError> {
        let digest = info.digest.clone().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "blob has no digest"))
        })?;
        match self.kind {
            ArchiveKind::DockerSave => dockersave::read_layer_blob(self, &digest),
            ArchiveKind::OciArchive => ocilayout::read_blob_from_tar(self, &digest),
        }
    }

    async fn get_signatures(&self, _instance_digest: Option<&Digest>) -> Result<Vec<Vec<u8>>, TransportError> {
        Ok(Vec::new())
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        false
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }
}

/// A staged archive write: blobs and the manifest are buffered under a
/// [`tarwriter::StagingWriter`] and only renamed into place on
/// [`ImageDestination::commit`], so a reader never observes a partially
/// written archive.
pub struct ArchiveDestination {
    pub path: PathBuf,
    pub reference: Reference,
    pub kind: ArchiveKind,
    writer: Mutex<tarwriter::StagingWriter>,
}

impl ArchiveDestination {
    pub fn create(path: PathBuf, reference: Reference, kind: ArchiveKind) -> Result<Self, TransportError> {
        let mut writer = tarwriter::StagingWriter::new(&path)?;
        if kind == ArchiveKind::DockerSave {
            let repo_tag = match &reference.tag_or_digest {
                TagOrDigest::Tag(_) | TagOrDigest::Both(_, _) => Some(reference.docker_name()),
                TagOrDigest::Digest(_) | TagOrDigest::None => None,
            };
            writer.set_repo_tag(repo_tag);
        }
        Ok(ArchiveDestination { path, reference, kind, writer: Mutex::new(writer) })
    }
}

#[async_trait]
impl ImageDestination for ArchiveDestination {
    fn supported_manifest_mime_types(&self) -> Vec<String> {
        match self.kind {
            ArchiveKind::DockerSave => vec![crate::manifest::MT_DOCKER_SCHEMA2.to_string()],
            ArchiveKind::OciArchive => vec![
                crate::manifest::MT_OCI1_MANIFEST.to_string(),
                crate::manifest::MT_OCI1_INDEX.to_string(),
            ],
        }
    }

    fn transport_scope(&self) -> String {
        let prefix = match self.kind {
            ArchiveKind::DockerSave => "docker-archive",
            ArchiveKind::OciArchive => "oci-archive",
        };
        format!("{prefix}://{}", self.path.display())
    }

    async fn put_blob(&self, mut stream: BlobStream, info: &BlobInfo) -> Result<Descriptor, TransportError> {
        use futures_util::StreamExt;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(TransportError::Io)?);
        }
        let digest = info
            .digest
            .clone()
            .unwrap_or_else(|| Digest::of_bytes(crate::digest::Algorithm::Sha256, &buf));
        let size = buf.len() as i64;
        let mut writer = self.writer.lock().expect("archive writer lock poisoned");
        writer.write_blob(&digest, &buf)?;
        Ok(Descriptor::new(info.media_type.clone().unwrap_or_default(), size, digest))
    }

    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<Descriptor>, TransportError> {
        let Some(digest) = &info.digest else { return Ok(None) };
        let writer = self.writer.lock().expect("archive writer lock poisoned");
        Ok(writer.has_blob(digest).then(|| Descriptor::new(info.media_type.clone().unwrap_or_default(), info.size, digest.clone())))
    }

    async fn put_manifest(&self, manifest: &[u8], media_type: &str, instance_digest: Option<&Digest>) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().expect("archive writer lock poisoned");
        writer.write_manifest(manifest, media_type, instance_digest)
    }

    async fn put_signatures(&self, signatures: &[Vec<u8>], _instance_digest: Option<&Digest>) -> Result<(), TransportError> {
        if !signatures.is_empty() {
            log::warn!("archive transports do not persist signatures");
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().expect("archive writer lock poisoned");
        writer.finish(self.kind, &self.path)
    }
}
