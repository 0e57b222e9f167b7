//! In-memory blob store for tests/dev.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    check_part_order, new_etag, validate_key, BlobError, BlobStore, CompletedPart, MultipartUpload,
    RangeRead,
};

#[derive(Debug, Default)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, Upload>,
    completed: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    state: Mutex<State>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, BlobError> {
        self.state
            .lock()
            .map_err(|_| BlobError::Io("blob store lock poisoned".to_string()))
    }

    /// Multipart uploads started but not yet completed.
    pub fn open_uploads(&self) -> usize {
        self.lock().map(|s| s.uploads.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn read_range(&self, key: &str, from: u64, to: u64) -> Result<RangeRead, BlobError> {
        let state = self.lock()?;
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| BlobError::NotFound(key.to_string()))?;
        let total_size = object.len() as u64;
        let start = from.min(total_size) as usize;
        let end = (to.min(total_size) as usize).max(start);
        Ok(RangeRead {
            bytes: object[start..end].to_vec(),
            total_size,
        })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        validate_key(key)?;
        self.lock()?.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        self.lock()?
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn start_multipart(&self, key: &str) -> Result<MultipartUpload, BlobError> {
        validate_key(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.lock()?.uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                ..Default::default()
            },
        );
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
        let mut state = self.lock()?;
        let open = state
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| BlobError::UnknownUpload(upload.upload_id.clone()))?;
        let etag = new_etag();
        open.parts.insert(part_number, (etag.clone(), bytes));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> Result<(), BlobError> {
        let mut state = self.lock()?;
        if state.completed.contains(&upload.upload_id) {
            return Ok(());
        }
        check_part_order(parts)?;
        let open = state
            .uploads
            .get(&upload.upload_id)
            .ok_or_else(|| BlobError::UnknownUpload(upload.upload_id.clone()))?;

        let mut object = Vec::new();
        for part in parts {
            match open.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => object.extend_from_slice(bytes),
                _ => return Err(BlobError::InvalidPart(format!("part {} missing or stale", part.part_number))),
            }
        }
        let key = open.key.clone();
        state.uploads.remove(&upload.upload_id);
        state.completed.insert(upload.upload_id.clone());
        state.objects.insert(key, object);
        Ok(())
    }
}
