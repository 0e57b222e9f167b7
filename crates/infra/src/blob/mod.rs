//! Blob storage for uploaded and generated CSV objects.
//!
//! The contract mirrors an S3-style object store: ranged reads report the
//! full object size, and large objects are written with multipart uploads
//! whose parts may arrive in any order but must be completed in part-number
//! order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod local;
pub mod memory;

pub use local::LocalFsBlobStore;
pub use memory::InMemoryBlobStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("unknown multipart upload: {0}")]
    UnknownUpload(String),

    #[error("invalid part: {0}")]
    InvalidPart(String),

    #[error("blob io error: {0}")]
    Io(String),
}

/// Bytes of a ranged read and the size of the whole object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRead {
    pub bytes: Vec<u8>,
    pub total_size: u64,
}

/// Handle of an open multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
}

/// Acknowledgement of one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bytes `[from, to)` of `key`, clamped to the object size.
    async fn read_range(&self, key: &str, from: u64, to: u64) -> Result<RangeRead, BlobError>;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn start_multipart(&self, key: &str) -> Result<MultipartUpload, BlobError>;

    /// Part numbers start at 1.
    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        bytes: Vec<u8>,
    ) -> Result<CompletedPart, BlobError>;

    /// Concatenate `parts` into the object. Parts must be in ascending
    /// part-number order. Completing an already completed upload is a no-op.
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> Result<(), BlobError>;
}

/// Keys are relative, `/`-separated and never climb out of the store root.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad { Err(BlobError::InvalidKey(key.to_string())) } else { Ok(()) }
}

pub(crate) fn check_part_order(parts: &[CompletedPart]) -> Result<(), BlobError> {
    if parts.is_empty() {
        return Err(BlobError::InvalidPart("no parts to complete".to_string()));
    }
    if parts.first().is_some_and(|p| p.part_number == 0) {
        return Err(BlobError::InvalidPart("part numbers start at 1".to_string()));
    }
    match parts.windows(2).find(|w| w[0].part_number >= w[1].part_number) {
        Some(w) => Err(BlobError::InvalidPart(format!(
            "parts out of order: {} before {}",
            w[0].part_number, w[1].part_number
        ))),
        None => Ok(()),
    }
}

pub(crate) fn new_etag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
