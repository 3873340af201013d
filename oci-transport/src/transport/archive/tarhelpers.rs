//! Shared tar-entry lookup used by both archive kinds. OCI image-layout
//! blobs live at `blobs/<alg>/<hex>`; docker-save uses the legacy
//! per-layer-directory shape (see [`super::tarwriter`]).

use crate::transport::TransportError;
use std::io::{Read, Seek, SeekFrom};

pub fn read_entry(file: &mut std::fs::File, wanted_path: &str) -> Result<Option<Vec<u8>>, TransportError> {
    file.seek(SeekFrom::Start(0))?;
    let mut archive = tar::Archive::new(&mut *file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        if path == wanted_path {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

pub fn blob_path(digest: &crate::digest::Digest) -> String {
    format!("blobs/{}/{}", digest.algorithm(), digest.hex())
}

/// `docker save`'s per-layer-directory layer path, keyed by the layer's own
/// digest hex rather than a `diffID` the way the historical format keys it
/// by an image-internal layer id; this crate has no separate layer-id
/// concept so the content digest doubles as the directory name.
pub fn legacy_layer_path(digest: &crate::digest::Digest) -> String {
    format!("{}/layer.tar", digest.hex())
}

/// `docker save`'s per-config file path.
pub fn legacy_config_path(digest: &crate::digest::Digest) -> String {
    format!("{}.json", digest.hex())
}
