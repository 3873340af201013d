//! [`BlobInfo`]: what a copy operation knows about a blob before it has
//! necessarily read any bytes of it.

use crate::digest::Digest;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOp {
    Preserve,
    Compress,
    Decompress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgo {
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlobInfo {
    pub digest: Option<Digest>,
    /// -1 means unknown.
    pub size: i64,
    pub media_type: Option<String>,
    pub urls: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub compression_op: Option<CompressionOp>,
    pub compression_algo: Option<CompressionAlgo>,
}

impl BlobInfo {
    pub fn new(digest: Digest, size: i64) -> Self {
        BlobInfo {
            digest: Some(digest),
            size,
            ..Default::default()
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }
}
