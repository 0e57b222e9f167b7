//! Worker configuration, read from `HERALD_*` environment variables.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use herald_infra::queue::RetryPolicy;
use tracing::{debug, warn};

use crate::messages::QueueName;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// How filter jobs find their audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterPipeline {
    /// Materialise the filtered table into a CSV, then run the CSV path.
    #[default]
    Csv,
    /// Page the filtered table straight into dispatch batches.
    Pages,
    /// Schedule fixed `seq_id` ranges; dispatch queries each range itself.
    Direct,
}

impl FromStr for FilterPipeline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "pages" => Ok(Self::Pages),
            "direct" => Ok(Self::Direct),
            other => Err(format!("expected csv, pages or direct, got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 5,
        }
    }
}

/// Upper bound of `completed_job_delay`.
pub const MAX_COMPLETED_JOB_DELAY: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: String,
    /// Root directory of the filesystem blob store.
    pub blob_root: String,
    pub bus_stream_prefix: String,
    pub queue_prefix: String,
    /// Push topic, `%s` replaced by app name then service.
    pub topic_template: String,
    pub db_page_size: u32,
    pub page_processing_concurrency: usize,
    pub csv_part_size: u64,
    pub direct_batch_size: i64,
    pub queues: BTreeMap<QueueName, QueueSettings>,
    /// Share of failed batches that trips the circuit breaker.
    pub max_batch_failure: f64,
    /// Share of failed publishes that makes a batch count as failed.
    pub max_user_failure_in_batch: f64,
    /// Delay between completion and the Job-Completed stage.
    pub completed_job_delay: Duration,
    pub control_group_folder: String,
    pub csv_folder: String,
    pub filter_pipeline: FilterPipeline,
    pub poll_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: "redis://localhost:6379".to_string(),
            blob_root: "./data/blobs".to_string(),
            bus_stream_prefix: "herald:push".to_string(),
            queue_prefix: "herald:queue".to_string(),
            topic_template: "push-%s_%s".to_string(),
            db_page_size: 1000,
            page_processing_concurrency: 1,
            csv_part_size: 10 * 1024 * 1024,
            direct_batch_size: 100_000,
            queues: QueueName::ALL
                .into_iter()
                .map(|q| (q, QueueSettings::default()))
                .collect(),
            max_batch_failure: 0.5,
            max_user_failure_in_batch: 0.05,
            completed_job_delay: Duration::from_secs(60),
            control_group_folder: "control-groups".to_string(),
            csv_folder: "csv".to_string(),
            filter_pipeline: FilterPipeline::Csv,
            poll_interval: Duration::from_millis(100),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    /// Load from the environment. Only `HERALD_DATABASE_URL` is mandatory.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("HERALD_DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("HERALD_DATABASE_URL"))?;

        let mut queues = BTreeMap::new();
        for queue in QueueName::ALL {
            let prefix = format!("HERALD_QUEUE_{}", queue.as_str().to_ascii_uppercase());
            let base = defaults.queues.get(&queue).copied().unwrap_or_default();
            queues.insert(
                queue,
                QueueSettings {
                    concurrency: env_or(&format!("{prefix}_CONCURRENCY"), base.concurrency)?,
                    max_retries: env_or(&format!("{prefix}_MAX_RETRIES"), base.max_retries)?,
                },
            );
        }

        let config = Self {
            database_url,
            redis_url: env_or("HERALD_REDIS_URL", defaults.redis_url)?,
            blob_root: env_or("HERALD_BLOB_ROOT", defaults.blob_root)?,
            bus_stream_prefix: env_or("HERALD_BUS_STREAM_PREFIX", defaults.bus_stream_prefix)?,
            queue_prefix: env_or("HERALD_QUEUE_PREFIX", defaults.queue_prefix)?,
            topic_template: env_or("HERALD_TOPIC_TEMPLATE", defaults.topic_template)?,
            db_page_size: env_or("HERALD_DB_PAGE_SIZE", defaults.db_page_size)?,
            page_processing_concurrency: env_or(
                "HERALD_PAGE_PROCESSING_CONCURRENCY",
                defaults.page_processing_concurrency,
            )?,
            csv_part_size: env_or("HERALD_CSV_PART_SIZE", defaults.csv_part_size)?,
            direct_batch_size: env_or("HERALD_DIRECT_BATCH_SIZE", defaults.direct_batch_size)?,
            queues,
            max_batch_failure: env_or("HERALD_MAX_BATCH_FAILURE", defaults.max_batch_failure)?,
            max_user_failure_in_batch: env_or(
                "HERALD_MAX_USER_FAILURE_IN_BATCH",
                defaults.max_user_failure_in_batch,
            )?,
            completed_job_delay: Duration::from_secs(env_or(
                "HERALD_COMPLETED_JOB_DELAY_SECS",
                defaults.completed_job_delay.as_secs(),
            )?),
            control_group_folder: env_or("HERALD_CONTROL_GROUP_FOLDER", defaults.control_group_folder)?,
            csv_folder: env_or("HERALD_CSV_FOLDER", defaults.csv_folder)?,
            filter_pipeline: env_or("HERALD_FILTER_PIPELINE", FilterPipeline::Csv)?,
            poll_interval: Duration::from_millis(env_or(
                "HERALD_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            retry_base_delay: defaults.retry_base_delay,
            retry_max_delay: defaults.retry_max_delay,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.db_page_size == 0 {
            return Err(invalid("HERALD_DB_PAGE_SIZE", "must be positive"));
        }
        if self.page_processing_concurrency == 0 {
            return Err(invalid("HERALD_PAGE_PROCESSING_CONCURRENCY", "must be positive"));
        }
        if self.csv_part_size == 0 {
            return Err(invalid("HERALD_CSV_PART_SIZE", "must be positive"));
        }
        if self.direct_batch_size <= 0 {
            return Err(invalid("HERALD_DIRECT_BATCH_SIZE", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.max_batch_failure) {
            return Err(invalid("HERALD_MAX_BATCH_FAILURE", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.max_user_failure_in_batch) {
            return Err(invalid("HERALD_MAX_USER_FAILURE_IN_BATCH", "must be in [0, 1]"));
        }
        if self.completed_job_delay > MAX_COMPLETED_JOB_DELAY {
            return Err(invalid("HERALD_COMPLETED_JOB_DELAY_SECS", "must be at most 30 days"));
        }
        Ok(())
    }

    pub fn queue(&self, queue: QueueName) -> QueueSettings {
        self.queues.get(&queue).copied().unwrap_or_default()
    }

    /// Retry policy of units enqueued on `queue`.
    pub fn retry_policy(&self, queue: QueueName) -> RetryPolicy {
        RetryPolicy::exponential(
            self.queue(queue).max_retries + 1,
            self.retry_base_delay,
            self.retry_max_delay,
        )
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e: T::Err| {
            warn!(key, value = %raw, error = %e, "invalid configuration value");
            ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            }
        }),
        _ => {
            debug!(key, default = %default, "configuration key not set; using default");
            Ok(default)
        }
    }
}

impl Display for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FilterPipeline::Csv => "csv",
            FilterPipeline::Pages => "pages",
            FilterPipeline::Direct => "direct",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absurd_completed_job_delay_is_rejected() {
        let config = WorkerConfig {
            completed_job_delay: Duration::from_secs(u64::MAX / 2),
            ..WorkerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("HERALD_COMPLETED_JOB_DELAY_SECS"));

        let config = WorkerConfig {
            completed_job_delay: MAX_COMPLETED_JOB_DELAY,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topic_template, "push-%s_%s");
        assert_eq!(config.csv_part_size, 10 * 1024 * 1024);
        assert_eq!(config.queues.len(), QueueName::ALL.len());
    }

    #[test]
    fn filter_pipeline_parses() {
        assert_eq!("CSV".parse::<FilterPipeline>(), Ok(FilterPipeline::Csv));
        assert_eq!(" pages ".parse::<FilterPipeline>(), Ok(FilterPipeline::Pages));
        assert_eq!("direct".parse::<FilterPipeline>(), Ok(FilterPipeline::Direct));
        assert!("s3".parse::<FilterPipeline>().is_err());
    }

    #[test]
    fn rejects_out_of_range_ratios() {
        let config = WorkerConfig {
            max_batch_failure: 1.5,
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn retry_policy_counts_the_first_attempt() {
        let mut config = WorkerConfig::default();
        config.queues.insert(
            QueueName::Dispatch,
            QueueSettings {
                concurrency: 1,
                max_retries: 2,
            },
        );
        assert_eq!(config.retry_policy(QueueName::Dispatch).max_attempts, 3);
    }
}
