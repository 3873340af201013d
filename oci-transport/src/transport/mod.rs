//! The generic image interface: every concrete transport (registry, tar
//! archive, OCI directory, and the contract-only stubs) implements
//! [`ImageSource`] and/or [`ImageDestination`]. The copy orchestrator is
//! written entirely against these traits and never downcasts to a concrete
//! transport, mirroring how the registry client and the OCI directory
//! reader are driven through one shared contract rather than each caller
//! hand-rolling its own glue.

pub mod archive;
pub mod dir;
pub mod docker;

use crate::blobinfo::BlobInfo;
use crate::digest::Digest;
use crate::manifest::Descriptor;
use crate::reference::Reference;
use async_trait::async_trait;
use bytes::Bytes;
use futures_core::stream::BoxStream;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport {0:?} is not implemented")]
    NotImplemented(&'static str),
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),
    #[error(transparent)]
    Reference(#[from] crate::reference::ReferenceError),
    #[error(transparent)]
    Manifest(#[from] crate::manifest::ManifestError),
    #[error(transparent)]
    Digest(#[from] crate::digest::DigestError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Docker(#[from] docker::error::RegistryError),
    #[error("manifest unknown")]
    ManifestUnknown,
    #[error("blob unknown: {0}")]
    BlobUnknown(Digest),
    #[error(transparent)]
    DigestMismatch(#[from] crate::digest::DigestMismatch),
}

/// A byte range request for a resumable blob read.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    /// `None` means to the end.
    pub end: Option<u64>,
}

pub type BlobStream = BoxStream<'static, std::io::Result<Bytes>>;

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch the manifest for this reference, or for a specific instance
    /// digest out of a list manifest if `instance_digest` is given.
    async fn get_manifest(
        &self,
        instance_digest: Option<&Digest>,
    ) -> Result<(Vec<u8>, String), TransportError>;

    async fn get_blob(
        &self,
        info: &BlobInfo,
        range: Option<ByteRange>,
    ) -> Result<(BlobStream, i64), TransportError>;

    async fn get_signatures(
        &self,
        instance_digest: Option<&Digest>,
    ) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Whether concurrent `get_blob` calls against this source are safe
    /// without external synchronization. Archive-backed sources that share
    /// one file handle return `false` so the copy pipeline serializes them.
    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }

    fn reference(&self) -> &Reference;
}

#[async_trait]
pub trait ImageDestination: Send + Sync {
    fn supported_manifest_mime_types(&self) -> Vec<String>;

    /// Identifies this destination for blob-info cache scoping, e.g.
    /// `docker://registry.example.com/ns/repo` or `dir:///path/to/layout`.
    /// A cache hit at this scope is already reachable here; a hit at any
    /// other scope is only useful as a cross-repo mount source.
    fn transport_scope(&self) -> String;

    /// How this destination wants layer compression handled absent an
    /// explicit per-blob override; `None` means preserve whatever the
    /// source used.
    fn desired_layer_compression(&self) -> Option<crate::blobinfo::CompressionAlgo> {
        None
    }

    async fn put_blob(
        &self,
        stream: BlobStream,
        info: &BlobInfo,
    ) -> Result<Descriptor, TransportError>;

    /// Like [`Self::put_blob`], but with a hint that the bytes are also
    /// known to already exist at `mount_from` (an opaque, transport-specific
    /// reference, e.g. another repository on the same docker registry host).
    /// A transport that can act on the hint (cross-repo blob mount) may skip
    /// re-uploading the bytes; the default ignores it and streams normally.
    async fn put_blob_from(
        &self,
        stream: BlobStream,
        info: &BlobInfo,
        mount_from: Option<&str>,
    ) -> Result<Descriptor, TransportError> {
        let _ = mount_from;
        self.put_blob(stream, info).await
    }

    /// Re-associate a blob already known to exist at this destination (by
    /// digest, perhaps reported by the blob-info cache) without resending
    /// its bytes. Returns `Ok(None)` if the destination cannot confirm this
    /// and the caller must fall back to `put_blob`.
    async fn try_reuse_blob(&self, info: &BlobInfo) -> Result<Option<Descriptor>, TransportError>;

    async fn put_manifest(
        &self,
        manifest: &[u8],
        media_type: &str,
        instance_digest: Option<&Digest>,
    ) -> Result<(), TransportError>;

    /// PUT a manifest, trying each of `candidates` (bytes, media type) in
    /// order until one is accepted. Lets the copy orchestrator offer a
    /// downgraded encoding (e.g. schema2 after an OCI1 conversion) when a
    /// registry that claims to support the first candidate's media type
    /// rejects it anyway.
    async fn put_manifest_with_fallback(
        &self,
        candidates: &[(Vec<u8>, String)],
        instance_digest: Option<&Digest>,
    ) -> Result<(), TransportError> {
        let mut last_err = None;
        for (bytes, media_type) in candidates {
            match self.put_manifest(bytes, media_type, instance_digest).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no manifest candidates supplied",
        ))))
    }

    async fn put_signatures(
        &self,
        signatures: &[Vec<u8>],
        instance_digest: Option<&Digest>,
    ) -> Result<(), TransportError>;

    /// Finalize a multi-step write (e.g. flush a tar writer or rename a
    /// staging directory into place). Destinations that write eagerly may
    /// no-op.
    async fn commit(&self) -> Result<(), TransportError>;
}

/// Maps a transport name (as used in reference strings, e.g. `"docker"`)
/// to the logic that opens a source/destination for a parsed [`Reference`].
/// Mirrors the registry client's own table-of-constructors approach to
/// dispatching on scheme, just one level up.
pub struct TransportRegistry {
    names: BTreeMap<&'static str, crate::reference::Transport>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        use crate::reference::Transport::*;
        let mut names = BTreeMap::new();
        for t in [
            Docker,
            DockerArchive,
            DockerDaemon,
            Oci,
            OciArchive,
            Dir,
            Sif,
            ContainersStorage,
        ] {
            names.insert(t.name(), t);
        }
        TransportRegistry { names }
    }

    pub fn resolve(&self, name: &str) -> Result<crate::reference::Transport, TransportError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| TransportError::UnknownTransport(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_known_transport_name() {
        let registry = TransportRegistry::new();
        for name in [
            "docker",
            "docker-archive",
            "docker-daemon",
            "oci",
            "oci-archive",
            "dir",
            "sif",
            "containers-storage",
        ] {
            assert!(registry.resolve(name).is_ok(), "{name} should resolve");
        }
    }

    #[test]
    fn registry_rejects_unknown_name() {
        let registry = TransportRegistry::new();
        assert!(registry.resolve("ftp").is_err());
    }
}
