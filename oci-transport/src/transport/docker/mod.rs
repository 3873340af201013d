//! The Docker Registry v2 transport: a concrete [`crate::transport::ImageSource`]
//! / [`crate::transport::ImageDestination`] pair built on [`client::Client`].

pub mod auth;
pub mod bodyreader;
pub mod client;
pub mod config;
pub mod error;

use crate::blobinfo::BlobInfo;
use crate::digest::Digest;
use crate::manifest::Descriptor;
use crate::reference::Reference;
use crate::transport::{BlobStream, ByteRange, ImageDestination, ImageSource, TransportError};
use async_trait::async_trait;
use std::sync::Arc;

pub struct DockerSource {
    client: Arc<client::Client>,
    reference: Reference,
    tag_or_digest: String,
}

impl DockerSource {
    pub fn new(client: Arc<client::Client>, reference: Reference, tag_or_digest: String) -> Self {
        DockerSource { client, reference, tag_or_digest }
    }
}

#[async_trait]
impl ImageSource for DockerSource {
    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> Result<(Vec<u8>, String), TransportError> {
        let reference = match instance_digest {
            Some(d) => d.to_string(),
            None => self.tag_or_digest.clone(),
        };
        self.client.get_manifest(&reference).await
    }

    async fn get_blob(&self, info: &BlobInfo, range: Option<ByteRange>) -> Result<(BlobStream, i64), TransportError> {
        let digest = info.digest.clone().ok_or_else(|| {
            TransportError::Docker(error::RegistryError::Unexpected { status: 0, body: "blob has no digest".to_string() })
        })?;
        let _ = range; // full-blob resumable reconnect is internal to get_blob
        self.client.get_blob(&digest, info.size).await
    }

    async fn get_signatures(&self, _instance_digest: Option<&Digest>) -> Result<Vec<Vec<u8>>, TransportError> {
        // Signature storage (the `sigstore`/lookaside mechanism) is a
        // separate fetch against a URL resolved from registries.d, not the
        // registry API itself; callers that need signatures go through
        // crate::config's lookaside resolution instead.
        Ok(Vec::new())
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }
}

pub struct DockerDestination {
    client: Arc<client::Client>,
    reference: Reference,
    tag_or_digest: String,
}

impl DockerDestination {
    pub fn new(client: Arc<client::Client>, reference: Reference, tag_or_digest: String) -> Self {
        DockerDestination { client, reference, tag_or_digest }
    }
}

#[async_trait]
impl ImageDestination for DockerDestination {
    fn supported_manifest_mime_types(&self) -> Vec<String> {
        client::MANIFEST_ACCEPT_ORDER.iter().map(|s| s.to_string()).collect()
    }

    fn transport_scope(&self) -> String {
        format!("docker://{}/{}", self.reference.domain, self.reference.path)
    }

    async fn put_blob(&self, stream: BlobStream, info: &BlobInfo) -> Result<Descriptor, TransportError> {
        self.put_blob_from(stream, info, None).await
    }

    async fn put_blob_from(&self, mut stream: BlobStream, info: &BlobInfo, mount_from: Option<&str>) -> Result<Descriptor, TransportError> {
        use futures_util::StreamExt;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(TransportError::Io)?;
            buf.extend_from_slice(&chunk);
        }
        let digest = info.digest.clone().unwrap_or_else(|| crate::digest::Digest::of_bytes(crate::digest::Algorithm::Sha256, &buf));
        self.client.put_blob(info, bytes::Bytes::from(buf.clone()), mount_from).await?;
        Ok(Descriptor::new(
            info.media_type.clone().unwrap_or_default(),
            buf.len() as i64,
            digest,
        ))
    }

    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<Descriptor>, TransportError> {
        let Some(digest) = &info.digest else { return Ok(None) };
        match self.client.blob_exists(digest).await? {
            Some(size) => Ok(Some(Descriptor::new(info.media_type.clone().unwrap_or_default(), size, digest.clone()))),
            None => Ok(None),
        }
    }

    async fn put_manifest(&self, manifest: &[u8], media_type: &str, instance_digest: Option<&Digest>) -> Result<(), TransportError> {
        self.put_manifest_with_fallback(&[(manifest.to_vec(), media_type.to_string())], instance_digest).await
    }

    async fn put_manifest_with_fallback(&self, candidates: &[(Vec<u8>, String)], instance_digest: Option<&Digest>) -> Result<(), TransportError> {
        let reference = match instance_digest {
            Some(d) => d.to_string(),
            None => self.tag_or_digest.clone(),
        };
        self.client.put_manifest_with_fallback(&reference, candidates).await
    }

    async fn put_signatures(&self, signatures: &[Vec<u8>], _instance_digest: Option<&Digest>) -> Result<(), TransportError> {
        if !signatures.is_empty() {
            log::warn!("signature upload to a sigstore/lookaside location is not implemented by the registry transport");
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl DockerDestination {
    pub fn reference(&self) -> &Reference {
        &self.reference
    }
}
