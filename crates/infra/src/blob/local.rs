//! Filesystem-backed blob store.
//!
//! Objects live at `{root}/{key}`. Parts of an open multipart upload are
//! staged under `{root}/.multipart/{upload_id}/{part}.{etag}` and removed
//! once the upload completes.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

use super::{
    check_part_order, new_etag, validate_key, BlobError, BlobStore, CompletedPart, MultipartUpload,
    RangeRead,
};

const STAGING_DIR: &str = ".multipart";

#[derive(Debug, Clone)]
pub struct LocalFsBlobStore {
    root: PathBuf,
}

fn io_error(context: &str, e: std::io::Error) -> BlobError {
    BlobError::Io(format!("{context}: {e}"))
}

fn not_found_or(key: &str, e: std::io::Error) -> BlobError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BlobError::NotFound(key.to_string())
    } else {
        io_error(key, e)
    }
}

impl LocalFsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        if key.starts_with(STAGING_DIR) {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn staging_path(&self, upload_id: &str) -> Result<PathBuf, BlobError> {
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(BlobError::UnknownUpload(upload_id.to_string()));
        }
        Ok(self.root.join(STAGING_DIR).join(upload_id))
    }

    async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), BlobError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create dir", e))?;
        }
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| io_error("create file", e))?;
        file.write_all(bytes).await.map_err(|e| io_error("write", e))?;
        file.flush().await.map_err(|e| io_error("flush", e))
    }
}

#[async_trait]
impl BlobStore for LocalFsBlobStore {
    #[instrument(skip(self), err)]
    async fn read_range(&self, key: &str, from: u64, to: u64) -> Result<RangeRead, BlobError> {
        let path = self.object_path(key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found_or(key, e))?;
        let total_size = file
            .metadata()
            .await
            .map_err(|e| io_error("metadata", e))?
            .len();

        let start = from.min(total_size);
        let end = to.min(total_size).max(start);
        let mut bytes = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| io_error("seek", e))?;
        file.read_exact(&mut bytes)
            .await
            .map_err(|e| io_error("read", e))?;
        Ok(RangeRead { bytes, total_size })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.object_path(key)?;
        Self::write_file(&path, &bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.object_path(key)?;
        tokio::fs::read(&path).await.map_err(|e| not_found_or(key, e))
    }

    async fn start_multipart(&self, key: &str) -> Result<MultipartUpload, BlobError> {
        self.object_path(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(self.staging_path(&upload_id)?)
            .await
            .map_err(|e| io_error("create staging dir", e))?;
        debug!(key, upload_id = %upload_id, "multipart upload started");
        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        bytes: Vec<u8>,
    ) -> Result<CompletedPart, BlobError> {
        if part_number == 0 {
            return Err(BlobError::InvalidPart("part numbers start at 1".to_string()));
        }
        let dir = self.staging_path(&upload.upload_id)?;
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(BlobError::UnknownUpload(upload.upload_id.clone()));
        }
        let etag = new_etag();
        Self::write_file(&dir.join(format!("{part_number}.{etag}")), &bytes).await?;
        Ok(CompletedPart { part_number, etag })
    }

    #[instrument(skip(self, parts), fields(key = %upload.key, parts = parts.len()), err)]
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> Result<(), BlobError> {
        let dir = self.staging_path(&upload.upload_id)?;
        let target = self.object_path(&upload.key)?;
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                Ok(())
            } else {
                Err(BlobError::UnknownUpload(upload.upload_id.clone()))
            };
        }
        check_part_order(parts)?;

        let mut object = Vec::new();
        for part in parts {
            let path = dir.join(format!("{}.{}", part.part_number, part.etag));
            let bytes = tokio::fs::read(&path).await.map_err(|_| {
                BlobError::InvalidPart(format!("part {} missing or stale", part.part_number))
            })?;
            object.extend_from_slice(&bytes);
        }
        Self::write_file(&target, &object).await?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| io_error("remove staging dir", e))
    }
}
