//! Campaign (job) model.
//!
//! A [`Job`] is the single source of truth for a campaign. Every stage of the
//! pipeline reads it on entry and mutates its counters only through atomic
//! increments at the repository layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};
use crate::id::{AppId, JobId};

/// Metadata key that switches a job into dry-run mode.
pub const DRY_RUN_KEY: &str = "dryRun";

/// Push provider family of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Apns,
    Gcm,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Apns => "apns",
            Service::Gcm => "gcm",
        }
    }
}

impl core::fmt::Display for Service {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Service {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apns" => Ok(Service::Apns),
            "gcm" => Ok(Service::Gcm),
            other => Err(DomainError::validation(format!(
                "service should be apns or gcm, got '{other}'"
            ))),
        }
    }
}

/// Lifecycle status of a job.
///
/// Terminal success is not a status: it is `completed_at != 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    #[serde(rename = "")]
    Running,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "circuitbreak")]
    CircuitBreak,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
            JobStatus::CircuitBreak => "circuitbreak",
        }
    }

    /// Units received while in this status are parked for later replay.
    pub fn parks_units(&self) -> bool {
        matches!(self, JobStatus::Paused | JobStatus::CircuitBreak)
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "stopped" => Ok(JobStatus::Stopped),
            "circuitbreak" => Ok(JobStatus::CircuitBreak),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// What to do with a localized bucket whose send time is already past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PastTimeStrategy {
    /// Drop the bucket.
    Skip,
    /// Send at the same wall-clock time on the next day.
    #[default]
    NextDay,
}

impl PastTimeStrategy {
    pub fn parse(s: &str) -> Self {
        if s == "skip" { Self::Skip } else { Self::NextDay }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PastTimeStrategy::Skip => "skip",
            PastTimeStrategy::NextDay => "nextday",
        }
    }
}

/// Where the target audience of a job comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource<'a> {
    Filters(&'a BTreeMap<String, String>),
    Csv(&'a str),
}

/// A push campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub app_id: AppId,
    /// Name of the owning app; also the prefix of the device-token table.
    pub app_name: String,
    pub service: Service,
    /// One or more comma-separated template names.
    pub template_name: String,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub csv_path: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Epoch nanoseconds, 0 = never.
    #[serde(default)]
    pub expires_at: i64,
    /// Epoch nanoseconds of the local wall-clock send time, used when `localized`.
    #[serde(default)]
    pub starts_at: i64,
    #[serde(default)]
    pub localized: bool,
    #[serde(default)]
    pub past_time_strategy: PastTimeStrategy,
    #[serde(default)]
    pub control_group: f64,
    /// Page size override, 0 = use the configured default.
    #[serde(default)]
    pub db_page_size: u32,
    pub total_batches: Option<i64>,
    #[serde(default)]
    pub completed_batches: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub total_users: i64,
    #[serde(default)]
    pub completed_tokens: i64,
    /// Epoch nanoseconds, 0 until the job completes.
    #[serde(default)]
    pub completed_at: i64,
    #[serde(default)]
    pub control_group_csv_path: String,
    /// Set once every batch of the job has been scheduled.
    #[serde(default)]
    pub batches_ready: bool,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a running job with empty counters.
    pub fn new(
        app_id: AppId,
        app_name: impl Into<String>,
        service: Service,
        template_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            app_id,
            app_name: app_name.into(),
            service,
            template_name: template_name.into(),
            filters: BTreeMap::new(),
            csv_path: String::new(),
            context: Map::new(),
            metadata: Map::new(),
            expires_at: 0,
            starts_at: 0,
            localized: false,
            past_time_strategy: PastTimeStrategy::default(),
            control_group: 0.0,
            db_page_size: 0,
            total_batches: None,
            completed_batches: 0,
            total_tokens: 0,
            total_users: 0,
            completed_tokens: 0,
            completed_at: 0,
            control_group_csv_path: String::new(),
            batches_ready: false,
            status: JobStatus::Running,
            created_by: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_filters(mut self, filters: BTreeMap<String, String>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_csv_path(mut self, csv_path: impl Into<String>) -> Self {
        self.csv_path = csv_path.into();
        self
    }

    pub fn with_control_group(mut self, ratio: f64) -> Self {
        self.control_group = ratio;
        self
    }

    pub fn with_db_page_size(mut self, size: u32) -> Self {
        self.db_page_size = size;
        self
    }

    /// Validate construction-time invariants.
    pub fn validate(&self) -> DomainResult<()> {
        if self.app_name.trim().is_empty() {
            return Err(DomainError::validation("app name is required"));
        }
        if self.template_names().is_empty() {
            return Err(DomainError::validation("template name is required"));
        }
        if !(0.0..1.0).contains(&self.control_group) {
            return Err(DomainError::validation("control group should be in [0, 1)"));
        }
        match (self.filters.is_empty(), self.csv_path.is_empty()) {
            (false, false) => Err(DomainError::validation(
                "filters and csv path cannot be used at the same time",
            )),
            (true, true) => Err(DomainError::validation(
                "either filters or csv path must be provided",
            )),
            _ => Ok(()),
        }
    }

    pub fn source(&self) -> JobSource<'_> {
        if self.csv_path.is_empty() {
            JobSource::Filters(&self.filters)
        } else {
            JobSource::Csv(&self.csv_path)
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > 0 && self.expires_at < now.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at != 0
    }

    /// `dryRun` flag from metadata, only when it is a JSON boolean.
    pub fn dry_run(&self) -> Option<bool> {
        self.metadata.get(DRY_RUN_KEY).and_then(Value::as_bool)
    }

    /// Template names, split on commas with blanks dropped.
    pub fn template_names(&self) -> Vec<&str> {
        self.template_name
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Name of the device-token table for this job: `{app}_{service}`.
    pub fn token_table(&self) -> String {
        format!("{}_{}", self.app_name, self.service)
    }

    pub fn page_size(&self, default: u32) -> u32 {
        if self.db_page_size > 0 { self.db_page_size } else { default }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(AppId::new(), "game", Service::Apns, "welcome")
    }

    #[test]
    fn filters_and_csv_are_mutually_exclusive() {
        let mut filters = BTreeMap::new();
        filters.insert("locale".to_string(), "en".to_string());

        let both = job().with_filters(filters.clone()).with_csv_path("a.csv");
        assert!(matches!(both.validate(), Err(DomainError::Validation(_))));

        let neither = job();
        assert!(neither.validate().is_err());

        assert!(job().with_filters(filters).validate().is_ok());
        assert!(job().with_csv_path("a.csv").validate().is_ok());
    }

    #[test]
    fn control_group_must_be_below_one() {
        let j = job().with_csv_path("a.csv").with_control_group(1.0);
        assert!(j.validate().is_err());
        let j = job().with_csv_path("a.csv").with_control_group(0.4);
        assert!(j.validate().is_ok());
    }

    #[test]
    fn expiry_zero_means_never() {
        let mut j = job();
        assert!(!j.is_expired(Utc::now()));
        j.expires_at = 1;
        assert!(j.is_expired(Utc::now()));
    }

    #[test]
    fn status_serializes_to_legacy_strings() {
        assert_eq!(serde_json::to_string(&JobStatus::Running).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&JobStatus::CircuitBreak).unwrap(),
            "\"circuitbreak\""
        );
        assert_eq!("paused".parse::<JobStatus>().unwrap(), JobStatus::Paused);
        assert!(JobStatus::Paused.parks_units());
        assert!(!JobStatus::Stopped.parks_units());
    }

    #[test]
    fn dry_run_requires_a_boolean() {
        let mut j = job();
        assert_eq!(j.dry_run(), None);
        j.metadata.insert(DRY_RUN_KEY.into(), Value::String("true".into()));
        assert_eq!(j.dry_run(), None);
        j.metadata.insert(DRY_RUN_KEY.into(), Value::Bool(true));
        assert_eq!(j.dry_run(), Some(true));
    }

    #[test]
    fn token_table_and_template_names() {
        let mut j = job();
        j.template_name = "a, b,,c".into();
        assert_eq!(j.template_names(), vec!["a", "b", "c"]);
        assert_eq!(j.token_table(), "game_apns");
        assert_eq!(j.page_size(1000), 1000);
        assert_eq!(j.with_db_page_size(50).page_size(1000), 50);
    }
}
