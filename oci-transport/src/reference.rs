//! Parses an image name of the form `transport:body` into a canonical
//! `(transport, domain, path, tag|digest)` tuple. Body grammar is
//! transport-specific; see the module-level match in [`Reference::parse`].

use crate::digest::Digest;
use std::fmt;

const DEFAULT_DOMAIN: &str = "docker.io";
const DEFAULT_NAMESPACE: &str = "library";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("malformed reference {0:?}")]
    MalformedReference(String),
    #[error("reference {0:?} has both a tag and a digest")]
    TagAndDigestBothPresent(String),
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),
    #[error("unsupported transport {0:?}")]
    UnsupportedTransport(String),
    #[error("invalid repository path component {0:?}")]
    InvalidPathComponent(String),
    #[error("invalid source index {0:?}")]
    InvalidSourceIndex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Docker,
    DockerArchive,
    DockerDaemon,
    Oci,
    OciArchive,
    Dir,
    Sif,
    ContainersStorage,
}

impl Transport {
    pub fn name(self) -> &'static str {
        match self {
            Transport::Docker => "docker",
            Transport::DockerArchive => "docker-archive",
            Transport::DockerDaemon => "docker-daemon",
            Transport::Oci => "oci",
            Transport::OciArchive => "oci-archive",
            Transport::Dir => "dir",
            Transport::Sif => "sif",
            Transport::ContainersStorage => "containers-storage",
        }
    }

    fn from_name(name: &str) -> Result<Self, ReferenceError> {
        Ok(match name {
            "docker" => Transport::Docker,
            "docker-archive" => Transport::DockerArchive,
            "docker-daemon" => Transport::DockerDaemon,
            "oci" => Transport::Oci,
            "oci-archive" => Transport::OciArchive,
            "dir" => Transport::Dir,
            "sif" => Transport::Sif,
            "containers-storage" => Transport::ContainersStorage,
            other => return Err(ReferenceError::UnsupportedTransport(other.to_string())),
        })
    }

    /// Only `docker` references carry a registry domain on the wire.
    fn requires_domain(self) -> bool {
        matches!(self, Transport::Docker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOrDigest {
    Tag(String),
    Digest(Digest),
    /// tag plus an expected digest, used internally for "pull this tag but
    /// pin it to this digest" without ever appearing on the wire in that form
    Both(String, Digest),
    None,
}

/// `path[:name:tag]` / `path[@sourceIndex]` / bare `path` addressing into an
/// archive that may contain more than one named image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSelector {
    NamedTagged { domain: String, path: String, tag: String },
    SourceIndex(usize),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub transport: Transport,
    pub domain: String,
    pub path: String,
    pub tag_or_digest: TagOrDigest,
    /// Populated only for archive transports: the filesystem path to the
    /// archive or directory itself, distinct from `path` (the repository
    /// path inside it).
    pub archive_path: Option<String>,
    pub archive_selector: ArchiveSelector,
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let (transport_name, body) = s
            .split_once(':')
            .ok_or_else(|| ReferenceError::MalformedReference(s.to_string()))?;
        let transport = Transport::from_name(transport_name)?;
        match transport {
            Transport::Docker => Self::parse_docker(body),
            Transport::DockerArchive | Transport::OciArchive | Transport::Dir | Transport::Sif => {
                Self::parse_archive(transport, body)
            }
            Transport::DockerDaemon => Self::parse_docker_daemon(body),
            Transport::Oci => Self::parse_oci_layout(body),
            Transport::ContainersStorage => Self::parse_containers_storage(body),
        }
    }

    fn parse_docker(body: &str) -> Result<Self, ReferenceError> {
        let body = body.strip_prefix("//").unwrap_or(body);
        let (authority_and_path, rest_is_path_only) = (body, true);
        let _ = rest_is_path_only;

        // split off a trailing :tag or @digest, being careful that `:` also
        // separates an explicit port in the domain component.
        let (path_part, tag_or_digest) = split_tag_or_digest(authority_and_path)?;

        let (domain, path) = split_domain_and_path(path_part);
        let domain = domain.to_lowercase();

        let (domain, path) = if domain.is_empty() {
            (
                DEFAULT_DOMAIN.to_string(),
                if path.contains('/') {
                    path.to_string()
                } else {
                    format!("{DEFAULT_NAMESPACE}/{path}")
                },
            )
        } else {
            (domain, path.to_string())
        };

        validate_path(&path)?;

        let tag_or_digest = match tag_or_digest {
            TagOrDigest::None => TagOrDigest::Tag("latest".to_string()),
            other => other,
        };

        Ok(Reference {
            transport: Transport::Docker,
            domain,
            path,
            tag_or_digest,
            archive_path: None,
            archive_selector: ArchiveSelector::None,
        })
    }

    fn parse_docker_daemon(body: &str) -> Result<Self, ReferenceError> {
        if let Some((algo, hex)) = body.split_once(':') {
            if algo == "sha256" || algo == "sha512" {
                let digest: Digest = format!("{algo}:{hex}")
                    .parse()
                    .map_err(|_| ReferenceError::InvalidDigest(body.to_string()))?;
                return Ok(Reference {
                    transport: Transport::DockerDaemon,
                    domain: String::new(),
                    path: String::new(),
                    tag_or_digest: TagOrDigest::Digest(digest),
                    archive_path: None,
                    archive_selector: ArchiveSelector::None,
                });
            }
        }
        // otherwise name:tag, reusing the docker grammar without a domain
        let inner = Self::parse_docker(body)?;
        Ok(Reference {
            transport: Transport::DockerDaemon,
            ..inner
        })
    }

    fn parse_oci_layout(body: &str) -> Result<Self, ReferenceError> {
        let (path, reference) = split_archive_path(body);
        Ok(Reference {
            transport: Transport::Oci,
            domain: String::new(),
            path: String::new(),
            tag_or_digest: TagOrDigest::None,
            archive_path: Some(path.to_string()),
            archive_selector: parse_archive_reference(reference)?,
        })
    }

    fn parse_archive(transport: Transport, body: &str) -> Result<Self, ReferenceError> {
        let (path, reference) = split_archive_path(body);
        Ok(Reference {
            transport,
            domain: String::new(),
            path: String::new(),
            tag_or_digest: TagOrDigest::None,
            archive_path: Some(path.to_string()),
            archive_selector: parse_archive_reference(reference)?,
        })
    }

    fn parse_containers_storage(body: &str) -> Result<Self, ReferenceError> {
        // `[[storage-opts]]image` — storage-opts are an external collaborator's
        // concern (the storage driver config); we only split them off.
        let image = if let Some(rest) = body.strip_prefix('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| ReferenceError::MalformedReference(body.to_string()))?;
            &rest[close + 1..]
        } else {
            body
        };
        let inner = Self::parse_docker(image)?;
        Ok(Reference {
            transport: Transport::ContainersStorage,
            ..inner
        })
    }

    /// Render back to `transport:body` form. Used for archive source
    /// selection round-trips (S2 in the testable-properties section).
    pub fn to_reference_string(&self) -> String {
        match self.transport {
            Transport::Docker | Transport::DockerDaemon | Transport::ContainersStorage => {
                let td = match &self.tag_or_digest {
                    TagOrDigest::Tag(t) => format!(":{t}"),
                    TagOrDigest::Digest(d) => format!("@{d}"),
                    TagOrDigest::Both(t, d) => format!(":{t}@{d}"),
                    TagOrDigest::None => String::new(),
                };
                format!(
                    "{}://{}/{}{}",
                    self.transport.name(),
                    self.domain,
                    self.path,
                    td
                )
            }
            Transport::DockerArchive | Transport::OciArchive | Transport::Dir | Transport::Sif
            | Transport::Oci => {
                let archive_path = self.archive_path.as_deref().unwrap_or_default();
                match &self.archive_selector {
                    ArchiveSelector::None => format!("{}:{}", self.transport.name(), archive_path),
                    ArchiveSelector::SourceIndex(i) => {
                        format!("{}:{}@{}", self.transport.name(), archive_path, i)
                    }
                    ArchiveSelector::NamedTagged { domain, path, tag } => {
                        let name = if domain.is_empty() || domain == DEFAULT_DOMAIN {
                            format!("{DEFAULT_DOMAIN}/{path}")
                        } else {
                            format!("{domain}/{path}")
                        };
                        format!("{}:{}:{}:{}", self.transport.name(), archive_path, name, tag)
                    }
                }
            }
        }
    }

    /// The fully qualified `name:tag` or `name@digest` string docker-save
    /// and registry clients print / index by.
    pub fn docker_name(&self) -> String {
        match &self.tag_or_digest {
            TagOrDigest::Tag(t) => format!("{}/{}:{}", self.domain, self.path, t),
            TagOrDigest::Digest(d) => format!("{}/{}@{}", self.domain, self.path, d),
            TagOrDigest::Both(t, _) => format!("{}/{}:{}", self.domain, self.path, t),
            TagOrDigest::None => format!("{}/{}", self.domain, self.path),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_reference_string())
    }
}

fn split_domain_and_path(s: &str) -> (&str, &str) {
    match s.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            (first, rest)
        }
        _ => ("", s),
    }
}

fn split_tag_or_digest(s: &str) -> Result<(&str, TagOrDigest), ReferenceError> {
    let at = s.rfind('@');
    let digest_part = at.map(|i| &s[i + 1..]);
    let before_at = at.map(|i| &s[..i]).unwrap_or(s);

    // a `:` after the last `/` is a tag separator; one before it (or none) is
    // either absent or part of a port in the domain, handled by the caller.
    let last_slash = before_at.rfind('/');
    let colon = before_at[last_slash.map(|i| i + 1).unwrap_or(0)..]
        .rfind(':')
        .map(|i| i + last_slash.map(|j| j + 1).unwrap_or(0));

    let (path_part, tag_part) = match colon {
        Some(i) => (&before_at[..i], Some(&before_at[i + 1..])),
        None => (before_at, None),
    };

    match (tag_part, digest_part) {
        (Some(tag), Some(digest)) => {
            validate_tag(tag)?;
            let digest: Digest = digest
                .parse()
                .map_err(|_| ReferenceError::InvalidDigest(digest.to_string()))?;
            Ok((path_part, TagOrDigest::Both(tag.to_string(), digest)))
        }
        (Some(tag), None) => {
            validate_tag(tag)?;
            Ok((path_part, TagOrDigest::Tag(tag.to_string())))
        }
        (None, Some(digest)) => {
            let digest: Digest = digest
                .parse()
                .map_err(|_| ReferenceError::InvalidDigest(digest.to_string()))?;
            Ok((path_part, TagOrDigest::Digest(digest)))
        }
        (None, None) => Ok((path_part, TagOrDigest::None)),
    }
}

fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let mut chars = tag.chars();
    let ok_first = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_');
    let ok_rest = !tag.is_empty()
        && tag.len() <= 128
        && tag[1..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok_first && ok_rest {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_string()))
    }
}

fn validate_path(path: &str) -> Result<(), ReferenceError> {
    if path.is_empty() {
        return Err(ReferenceError::InvalidPathComponent(path.to_string()));
    }
    for component in path.split('/') {
        if !is_valid_path_component(component) {
            return Err(ReferenceError::InvalidPathComponent(component.to_string()));
        }
    }
    Ok(())
}

/// `[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*`
fn is_valid_path_component(c: &str) -> bool {
    if c.is_empty() {
        return false;
    }
    let bytes = c.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let mut i = 0;
    if !is_alnum(bytes[0]) {
        return false;
    }
    i += 1;
    while i < bytes.len() {
        if !is_alnum(bytes[i]) {
            // consume one separator run: `.`, `_`, `__`, or `-+`
            let start = i;
            match bytes[i] {
                b'.' | b'_' => i += 1,
                b'-' => {
                    while i < bytes.len() && bytes[i] == b'-' {
                        i += 1;
                    }
                }
                _ => return false,
            }
            if i == start || i >= bytes.len() || !is_alnum(bytes[i]) {
                return false;
            }
        } else {
            i += 1;
        }
    }
    true
}

fn split_archive_path(body: &str) -> (&str, &str) {
    // a bare filesystem path may itself contain `:` only in a `name:tag`
    // suffix we add ourselves, so split on the *last* colon that is followed
    // by something that isn't a path separator-looking remainder is
    // ambiguous; archive refs instead split on the first colon not inside a
    // leading absolute path. The archive grammar here splits on the first
    // colon after the last `/`, matching the tag-separator rule used for
    // docker references.
    match body.rfind('@') {
        Some(i) if body[i + 1..].chars().all(|c| c.is_ascii_digit()) && i + 1 < body.len() => {
            (&body[..i], &body[i..])
        }
        _ => match body.split_once(':') {
            Some((p, r)) => (p, r),
            None => (body, ""),
        },
    }
}

fn parse_archive_reference(reference: &str) -> Result<ArchiveSelector, ReferenceError> {
    if reference.is_empty() {
        return Ok(ArchiveSelector::None);
    }
    if let Some(idx) = reference.strip_prefix('@') {
        let i: usize = idx
            .parse()
            .map_err(|_| ReferenceError::InvalidSourceIndex(idx.to_string()))?;
        return Ok(ArchiveSelector::SourceIndex(i));
    }
    let body = reference.strip_prefix(':').unwrap_or(reference);
    let inner = Reference::parse_docker(body)?;
    let tag = match inner.tag_or_digest {
        TagOrDigest::Tag(t) => t,
        _ => return Err(ReferenceError::MalformedReference(reference.to_string())),
    };
    Ok(ArchiveSelector::NamedTagged {
        domain: inner.domain,
        path: inner.path,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_image_name() {
        let r = Reference::parse("docker://busybox").unwrap();
        assert_eq!(r.domain, "docker.io");
        assert_eq!(r.path, "library/busybox");
        assert_eq!(r.tag_or_digest, TagOrDigest::Tag("latest".to_string()));
    }

    #[test]
    fn parses_domain_and_tag() {
        let r = Reference::parse("docker://quay.io/fedora/fedora:42").unwrap();
        assert_eq!(r.domain, "quay.io");
        assert_eq!(r.path, "fedora/fedora");
        assert_eq!(r.tag_or_digest, TagOrDigest::Tag("42".to_string()));
    }

    #[test]
    fn parses_domain_with_port() {
        let r = Reference::parse("docker://localhost:5000/my/app:v1").unwrap();
        assert_eq!(r.domain, "localhost:5000");
        assert_eq!(r.path, "my/app");
    }

    #[test]
    fn lowercases_domain_only() {
        let r = Reference::parse("docker://Quay.IO/fedora/fedora:42").unwrap();
        assert_eq!(r.domain, "quay.io");
    }

    #[test]
    fn rejects_tag_and_digest_together_on_the_wire() {
        // tag+digest both present is accepted internally as `Both`
        let r = Reference::parse(
            "docker://quay.io/fedora/fedora:latest@sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3",
        )
        .unwrap();
        assert!(matches!(r.tag_or_digest, TagOrDigest::Both(_, _)));
    }

    #[test]
    fn rejects_invalid_tag() {
        assert!(Reference::parse("docker://busybox:-bad").is_err());
    }

    #[test]
    fn rejects_empty_tag_instead_of_panicking() {
        assert!(Reference::parse("docker://busybox:").is_err());
    }

    #[test]
    fn rejects_invalid_path_component() {
        assert!(Reference::parse("docker://quay.io/Bad/repo").is_err());
    }

    #[test]
    fn s2_docker_archive_round_trip() {
        let r = Reference::parse("docker-archive:/tmp/img.tar:busybox:latest").unwrap();
        assert_eq!(r.archive_path.as_deref(), Some("/tmp/img.tar"));
        match &r.archive_selector {
            ArchiveSelector::NamedTagged { domain, path, tag } => {
                assert_eq!(domain, "docker.io");
                assert_eq!(path, "library/busybox");
                assert_eq!(tag, "latest");
            }
            other => panic!("unexpected selector {other:?}"),
        }
        assert_eq!(
            r.to_reference_string(),
            "docker-archive:/tmp/img.tar:docker.io/library/busybox:latest"
        );
    }

    #[test]
    fn archive_source_index() {
        let r = Reference::parse("docker-archive:/tmp/img.tar@3").unwrap();
        assert_eq!(r.archive_selector, ArchiveSelector::SourceIndex(3));
    }

    #[test]
    fn rejects_negative_source_index() {
        assert!(Reference::parse("docker-archive:/tmp/img.tar@-1").is_err());
    }

    #[test]
    fn oci_layout_reference() {
        let r = Reference::parse("oci:/tmp/layout:latest").unwrap();
        assert_eq!(r.archive_path.as_deref(), Some("/tmp/layout"));
    }

    #[test]
    fn docker_daemon_by_digest() {
        let r = Reference::parse(
            "docker-daemon:sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3",
        )
        .unwrap();
        assert!(matches!(r.tag_or_digest, TagOrDigest::Digest(_)));
    }
}
