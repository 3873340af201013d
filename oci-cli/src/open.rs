//! Wires a parsed [`Reference`] to a concrete [`ImageSource`]/[`ImageDestination`].
//!
//! The library deliberately stops at a reference grammar and a transport
//! registry (`oci_transport::transport::TransportRegistry`) that only names
//! the eight transports; constructing the right concrete type — discovering
//! a registry endpoint, opening a tar file, creating a staging directory —
//! is left to an external collaborator per spec.md §6. This binary is that
//! collaborator.

use anyhow::{anyhow, bail, Context, Result};
use oci_transport::reference::{Reference, TagOrDigest, Transport};
use oci_transport::transport::archive::{ArchiveDestination, ArchiveKind, ArchiveSource};
use oci_transport::transport::dir::{DirDestination, DirSource};
use oci_transport::transport::docker::auth::BasicCredentials;
use oci_transport::transport::docker::client::{Client, ClientBuilder};
use oci_transport::transport::docker::{DockerDestination, DockerSource};
use oci_transport::transport::{ImageDestination, ImageSource};
use std::sync::Arc;

/// The wire-format string the registry API expects in a manifest/blob URL
/// path segment: a tag name or a digest, never both even if the reference
/// carries both (the digest is what actually pins the request).
fn wire_ref(tag_or_digest: &TagOrDigest) -> String {
    match tag_or_digest {
        TagOrDigest::Tag(t) => t.clone(),
        TagOrDigest::Digest(d) => d.to_string(),
        TagOrDigest::Both(_, d) => d.to_string(),
        TagOrDigest::None => "latest".to_string(),
    }
}

async fn docker_client(reference: &Reference) -> Result<Arc<Client>> {
    let mut builder = ClientBuilder::new(reference.domain.clone(), reference.path.clone());
    if let Ok(user) = std::env::var("OCI_CLI_USERNAME") {
        let pass = std::env::var("OCI_CLI_PASSWORD").unwrap_or_default();
        builder = builder.credentials(BasicCredentials { username: user, password: pass });
    }
    let client = builder
        .discover()
        .await
        .with_context(|| format!("discovering registry endpoint for {}", reference.domain))?;
    Ok(Arc::new(client))
}

pub async fn open_source(reference: &Reference) -> Result<Box<dyn ImageSource>> {
    match reference.transport {
        Transport::Docker => {
            let client = docker_client(reference).await?;
            Ok(Box::new(DockerSource::new(client, reference.clone(), wire_ref(&reference.tag_or_digest))))
        }
        Transport::DockerArchive | Transport::OciArchive | Transport::Dir => {
            let path = reference
                .archive_path
                .clone()
                .ok_or_else(|| anyhow!("archive reference is missing a filesystem path"))?;
            if reference.transport == Transport::Dir {
                return Ok(Box::new(DirSource { path: path.into(), reference: reference.clone() }));
            }
            let kind = if reference.transport == Transport::DockerArchive { ArchiveKind::DockerSave } else { ArchiveKind::OciArchive };
            let source = ArchiveSource::open(path.into(), reference.clone(), kind).with_context(|| "opening archive".to_string())?;
            Ok(Box::new(source))
        }
        Transport::Oci => {
            let path = reference.archive_path.clone().ok_or_else(|| anyhow!("oci: reference is missing a directory path"))?;
            Ok(Box::new(DirSource { path: path.into(), reference: reference.clone() }))
        }
        Transport::DockerDaemon => bail!("docker-daemon: requires a local docker daemon IPC this crate does not implement"),
        Transport::Sif => bail!("sif: (Singularity Image Format) is not implemented"),
        Transport::ContainersStorage => bail!("containers-storage: requires a local storage driver this crate does not implement"),
    }
}

pub async fn open_destination(reference: &Reference) -> Result<Box<dyn ImageDestination>> {
    match reference.transport {
        Transport::Docker => {
            let client = docker_client(reference).await?;
            Ok(Box::new(DockerDestination::new(client, reference.clone(), wire_ref(&reference.tag_or_digest))))
        }
        Transport::DockerArchive | Transport::OciArchive => {
            let path = reference
                .archive_path
                .clone()
                .ok_or_else(|| anyhow!("archive reference is missing a filesystem path"))?;
            let kind = if reference.transport == Transport::DockerArchive { ArchiveKind::DockerSave } else { ArchiveKind::OciArchive };
            let dest = ArchiveDestination::create(path.into(), reference.clone(), kind).with_context(|| "creating archive".to_string())?;
            Ok(Box::new(dest))
        }
        Transport::Dir | Transport::Oci => {
            let path = reference.archive_path.clone().ok_or_else(|| anyhow!("reference is missing a directory path"))?;
            let dest = DirDestination::create(path.into(), reference.clone()).await.with_context(|| "creating directory layout".to_string())?;
            Ok(Box::new(dest))
        }
        Transport::DockerDaemon => bail!("docker-daemon: requires a local docker daemon IPC this crate does not implement"),
        Transport::Sif => bail!("sif: (Singularity Image Format) is not implemented"),
        Transport::ContainersStorage => bail!("containers-storage: requires a local storage driver this crate does not implement"),
    }
}
