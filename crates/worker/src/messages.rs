//! Typed queue messages.
//!
//! Every unit payload is an [`Envelope`] around one [`StageMessage`]
//! variant; the variant decides the queue. Payloads are decoded once, when a
//! handler picks the unit up.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use herald_core::{JobId, User};
use herald_infra::MultipartUpload;
use herald_infra::tokens::TokenQuery;

use crate::error::StageError;

/// Current envelope version.
pub const MESSAGE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    CsvSplit,
    DbToCsv,
    CreateBatches,
    CreateBatchesFromFilters,
    Dispatch,
    DirectDispatch,
    JobCompleted,
    ResumeJob,
}

impl QueueName {
    pub const ALL: [QueueName; 8] = [
        QueueName::CsvSplit,
        QueueName::DbToCsv,
        QueueName::CreateBatches,
        QueueName::CreateBatchesFromFilters,
        QueueName::Dispatch,
        QueueName::DirectDispatch,
        QueueName::JobCompleted,
        QueueName::ResumeJob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::CsvSplit => "csv_split",
            QueueName::DbToCsv => "db_to_csv",
            QueueName::CreateBatches => "create_batches",
            QueueName::CreateBatchesFromFilters => "create_batches_from_filters",
            QueueName::Dispatch => "dispatch",
            QueueName::DirectDispatch => "direct_dispatch",
            QueueName::JobCompleted => "job_completed",
            QueueName::ResumeJob => "resume_job",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {s}"))
    }
}

/// One byte range of a job's CSV, handled by one Batch Creation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPart {
    pub job_id: JobId,
    pub start: u64,
    pub size: u64,
    pub total_parts: u64,
    pub total_size: u64,
    pub part: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "payload", rename_all = "snake_case")]
pub enum StageMessage {
    CsvSplit {
        job_id: JobId,
    },
    DbToCsv {
        job_id: JobId,
        query: TokenQuery,
        upload: MultipartUpload,
        part_number: u32,
        total_parts: u32,
    },
    CreateBatches(BatchPart),
    CreateBatchesFromFilters {
        job_id: JobId,
    },
    Dispatch {
        job_id: JobId,
        app_name: String,
        /// Users as JSON, zlib-compressed, base64-encoded.
        compressed_users: String,
    },
    DirectDispatch {
        job_id: JobId,
        smallest_seq_id: i64,
        biggest_seq_id: i64,
    },
    JobCompleted {
        job_id: JobId,
    },
    ResumeJob {
        job_id: JobId,
    },
}

impl StageMessage {
    pub fn queue(&self) -> QueueName {
        match self {
            StageMessage::CsvSplit { .. } => QueueName::CsvSplit,
            StageMessage::DbToCsv { .. } => QueueName::DbToCsv,
            StageMessage::CreateBatches(_) => QueueName::CreateBatches,
            StageMessage::CreateBatchesFromFilters { .. } => QueueName::CreateBatchesFromFilters,
            StageMessage::Dispatch { .. } => QueueName::Dispatch,
            StageMessage::DirectDispatch { .. } => QueueName::DirectDispatch,
            StageMessage::JobCompleted { .. } => QueueName::JobCompleted,
            StageMessage::ResumeJob { .. } => QueueName::ResumeJob,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            StageMessage::CsvSplit { job_id }
            | StageMessage::DbToCsv { job_id, .. }
            | StageMessage::CreateBatchesFromFilters { job_id }
            | StageMessage::Dispatch { job_id, .. }
            | StageMessage::DirectDispatch { job_id, .. }
            | StageMessage::JobCompleted { job_id }
            | StageMessage::ResumeJob { job_id } => *job_id,
            StageMessage::CreateBatches(part) => part.job_id,
        }
    }

    /// Build a bucket dispatch message.
    pub fn dispatch(job_id: JobId, app_name: &str, users: &[User]) -> Result<Self, StageError> {
        Ok(StageMessage::Dispatch {
            job_id,
            app_name: app_name.to_string(),
            compressed_users: compress_users(users)?,
        })
    }
}

/// Versioned wrapper stored as the unit payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub message: StageMessage,
}

impl Envelope {
    pub fn new(message: StageMessage) -> Self {
        Self {
            version: MESSAGE_VERSION,
            message,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, StageError> {
        serde_json::to_value(self).map_err(|e| StageError::message(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, StageError> {
        serde_json::to_string(self).map_err(|e| StageError::message(e.to_string()))
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, StageError> {
        let envelope: Envelope =
            serde_json::from_value(value.clone()).map_err(|e| StageError::message(e.to_string()))?;
        envelope.checked()
    }

    pub fn from_json(raw: &str) -> Result<Self, StageError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(|e| StageError::message(e.to_string()))?;
        envelope.checked()
    }

    fn checked(self) -> Result<Self, StageError> {
        if self.version == MESSAGE_VERSION {
            Ok(self)
        } else {
            Err(StageError::message(format!(
                "unsupported message version {} (expected {MESSAGE_VERSION})",
                self.version
            )))
        }
    }
}

/// Users as JSON, zlib-compressed, base64-encoded.
pub fn compress_users(users: &[User]) -> Result<String, StageError> {
    let json = serde_json::to_vec(users).map_err(|e| StageError::message(e.to_string()))?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| StageError::message(format!("compress users: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| StageError::message(format!("compress users: {e}")))?;
    Ok(STANDARD.encode(compressed))
}

pub fn decompress_users(encoded: &str) -> Result<Vec<User>, StageError> {
    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| StageError::message(format!("decode users: {e}")))?;
    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| StageError::message(format!("decompress users: {e}")))?;
    serde_json::from_slice(&json).map_err(|e| StageError::message(format!("decode users: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_round_trip_through_strings() {
        for queue in QueueName::ALL {
            assert_eq!(queue.as_str().parse::<QueueName>(), Ok(queue));
        }
        assert!("process_batch".parse::<QueueName>().is_err());
    }

    #[test]
    fn envelope_wire_shape() {
        let job_id = JobId::new();
        let value = Envelope::new(StageMessage::CsvSplit { job_id }).to_value().unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["message"]["stage"], "csv_split");
        assert_eq!(value["message"]["payload"]["job_id"], job_id.to_string());
    }

    #[test]
    fn rejects_unknown_versions_and_stages() {
        let job_id = JobId::new();
        let mut value = Envelope::new(StageMessage::ResumeJob { job_id }).to_value().unwrap();
        value["version"] = serde_json::json!(2);
        assert!(Envelope::from_value(&value).unwrap_err().is_fatal());

        let bogus = serde_json::json!({"version": 1, "message": {"stage": "nope", "payload": {}}});
        assert!(Envelope::from_value(&bogus).is_err());
    }

    #[test]
    fn compressed_users_survive_the_trip() {
        let users = vec![
            User::new("u1", "t1").with_locale("en").with_tz("-0300"),
            User::new("u2", "t2").with_locale("pt"),
        ];
        let message = StageMessage::dispatch(JobId::new(), "game", &users).unwrap();
        let StageMessage::Dispatch { compressed_users, .. } = &message else {
            panic!("expected dispatch");
        };
        assert_eq!(decompress_users(compressed_users).unwrap(), users);
        assert_eq!(message.queue(), QueueName::Dispatch);
    }

    #[test]
    fn garbage_users_are_rejected() {
        assert!(decompress_users("not base64!").is_err());
        assert!(decompress_users(&STANDARD.encode(b"plain")).is_err());
    }
}
