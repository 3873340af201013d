//! The `dir:` transport: an OCI image-layout written straight to a
//! directory via ordinary filesystem calls, reusing the same
//! `oci-layout`/`index.json`/`blobs/<alg>/<hex>` shape the archive variant
//! tars up. No outer framing, so no staging writer is needed: writes are
//! visible immediately, same tradeoff docker-save's sibling `dir:`
//! transport always made.

use crate::blobinfo::BlobInfo;
use crate::digest::Digest;
use crate::manifest::oci1::Oci1Index;
use crate::manifest::Descriptor;
use crate::reference::Reference;
use crate::transport::{BlobStream, ByteRange, ImageDestination, ImageSource, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

pub struct DirSource {
    pub path: PathBuf,
    pub reference: Reference,
}

fn blob_path(root: &std::path::Path, digest: &Digest) -> PathBuf {
    root.join("blobs").join(digest.algorithm().as_str()).join(digest.hex())
}

#[async_trait]
impl ImageSource for DirSource {
    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> Result<(Vec<u8>, String), TransportError> {
        if let Some(digest) = instance_digest {
            let bytes = tokio::fs::read(blob_path(&self.path, digest)).await?;
            let media_type = crate::manifest::sniff_media_type(None, &bytes)?;
            return Ok((bytes, media_type));
        }
        let index_bytes = tokio::fs::read(self.path.join("index.json")).await?;
        let index: Oci1Index = serde_json::from_slice(&index_bytes)?;
        let first = index.manifests.first().ok_or(TransportError::ManifestUnknown)?;
        let bytes = tokio::fs::read(blob_path(&self.path, &first.digest)).await?;
        Ok((bytes, first.media_type.clone()))
    }

    async fn get_blob(&self, info: &BlobInfo, _range: Option<ByteRange>) -> Result<(BlobStream, i64), TransportError> {
        let digest = info.digest.clone().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "blob has no digest"))
        })?;
        let bytes = tokio::fs::read(blob_path(&self.path, &digest))
            .await
            .map_err(|_| TransportError::BlobUnknown(digest.clone()))?;
        let size = bytes.len() as i64;
        let stream = futures_util::stream::once(async move { Ok(Bytes::from(bytes)) });
        Ok((Box::pin(stream) as BlobStream, size))
    }

    async fn get_signatures(&self, _instance_digest: Option<&Digest>) -> Result<Vec<Vec<u8>>, TransportError> {
        Ok(Vec::new())
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }
}

pub struct DirDestination {
    pub path: PathBuf,
    pub reference: Reference,
}

impl DirDestination {
    pub async fn create(path: PathBuf, reference: Reference) -> Result<Self, TransportError> {
        tokio::fs::create_dir_all(path.join("blobs")).await?;
        tokio::fs::write(path.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#).await?;
        Ok(DirDestination { path, reference })
    }
}

#[async_trait]
impl ImageDestination for DirDestination {
    fn supported_manifest_mime_types(&self) -> Vec<String> {
        vec![
            crate::manifest::MT_OCI1_MANIFEST.to_string(),
            crate::manifest::MT_OCI1_INDEX.to_string(),
        ]
    }

    fn transport_scope(&self) -> String {
        format!("dir://{}", self.path.display())
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
        let path = blob_path(&self.path, &digest);
        tokio::fs::create_dir_all(path.parent().expect("blob path has a parent")).await?;
        tokio::fs::write(&path, &buf).await?;
        Ok(Descriptor::new(info.media_type.clone().unwrap_or_default(), buf.len() as i64, digest))
    }

    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<Descriptor>, TransportError> {
        let Some(digest) = &info.digest else { return Ok(None) };
        let path = blob_path(&self.path, digest);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(Descriptor::new(info.media_type.clone().unwrap_or_default(), meta.len() as i64, digest.clone()))),
            Err(_) => Ok(None),
        }
    }

    async fn put_manifest(&self, manifest: &[u8], media_type: &str, instance_digest: Option<&Digest>) -> Result<(), TransportError> {
        let digest = Digest::of_bytes(crate::digest::Algorithm::Sha256, manifest);
        let path = blob_path(&self.path, &digest);
        tokio::fs::create_dir_all(path.parent().expect("blob path has a parent")).await?;
        tokio::fs::write(&path, manifest).await?;

        if instance_digest.is_none() {
            let index = Oci1Index::new(vec![Descriptor::new(media_type, manifest.len() as i64, digest)]);
            tokio::fs::write(self.path.join("index.json"), serde_json::to_vec(&index)?).await?;
        }
        Ok(())
    }

    async fn put_signatures(&self, signatures: &[Vec<u8>], _instance_digest: Option<&Digest>) -> Result<(), TransportError> {
        if !signatures.is_empty() {
            log::warn!("the dir: transport does not persist signatures");
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
