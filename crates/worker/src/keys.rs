//! Coordination keys shared by every worker instance.

use herald_core::JobId;

pub fn processed_pages(job: JobId) -> String {
    format!("{job}-processedpages")
}

pub fn paused_jobs(job: JobId) -> String {
    format!("{job}-pausedjobs")
}

pub fn failed_batches(job: JobId) -> String {
    format!("{job}-failedbatches")
}

pub fn circuit_break(job: JobId) -> String {
    format!("{job}-circuitbreak")
}

pub fn control_group(job: JobId) -> String {
    format!("{job}-controlgroup")
}

pub fn created_parts(job: JobId) -> String {
    format!("{job}-createdparts")
}

pub fn uploaded_parts(job: JobId) -> String {
    format!("{job}-uploadedparts")
}

/// Hash of user id to the DB-to-CSV part that exported it.
pub fn exported_users(job: JobId) -> String {
    format!("{job}-exportedusers")
}

/// Hash listing the top-level stages of a job.
pub fn stage_index(job: JobId) -> String {
    job.to_string()
}

/// Hash of one stage; `key` is the dotted stage path (`1`, `1.2`).
pub fn stage(job: JobId, key: &str) -> String {
    format!("{job}-{key}")
}
