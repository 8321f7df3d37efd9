use std::time::Duration;

use crate::config::{Config, PipelineSettings};
use crate::executor::RetryPolicy;
use crate::planner::OutlineLimits;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Units generated concurrently per batch.
    pub batch_size: usize,
    /// Wall-clock ceiling on the unit generation phase of one run.
    pub unit_phase_timeout: Duration,
    pub limits: OutlineLimits,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self::from_settings(&config.pipeline, RetryPolicy::from(&config.retry))
    }

    pub fn from_settings(settings: &PipelineSettings, retry: RetryPolicy) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            unit_phase_timeout: Duration::from_secs(settings.unit_phase_timeout_secs),
            limits: OutlineLimits {
                max_units: settings.max_units,
                default_target_size: settings.default_target_size,
            },
            retry,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default(), RetryPolicy::default())
    }
}
