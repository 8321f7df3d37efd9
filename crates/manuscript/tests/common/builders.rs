//! Builder patterns for creating test data programmatically.

#![allow(dead_code)]

use std::time::Duration;

use manuscript::executor::RetryPolicy;
use manuscript::planner::OutlineLimits;
use manuscript::store::{Outline, OutlineUnit, UnitKind};
use manuscript::PipelineConfig;

/// Builds outlines and the planner replies that encode them.
pub struct OutlineBuilder {
    title: String,
    units: Vec<String>,
}

impl OutlineBuilder {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            units: vec![],
        }
    }

    /// An outline with `count` units named `Part 1..=count`.
    pub fn with_units(title: &str, count: usize) -> Self {
        let mut builder = Self::new(title);
        for i in 0..count {
            builder = builder.unit(&format!("Part {}", i + 1));
        }
        builder
    }

    pub fn unit(mut self, title: &str) -> Self {
        self.units.push(title.to_string());
        self
    }

    fn kind(&self, index: usize) -> UnitKind {
        if index == 0 {
            UnitKind::Opening
        } else if index + 1 == self.units.len() {
            UnitKind::Closing
        } else {
            UnitKind::Body
        }
    }

    pub fn build(&self) -> Outline {
        Outline {
            title: self.title.clone(),
            units: self
                .units
                .iter()
                .enumerate()
                .map(|(index, title)| OutlineUnit {
                    index,
                    title: title.clone(),
                    kind: self.kind(index),
                    target_size: 200,
                    summary: None,
                })
                .collect(),
        }
    }

    /// The JSON reply a planner model would give for this outline.
    pub fn reply(&self) -> String {
        let units: Vec<serde_json::Value> = self
            .units
            .iter()
            .enumerate()
            .map(|(index, title)| {
                serde_json::json!({
                    "index": index,
                    "title": title,
                    "kind": self.kind(index).as_str(),
                    "target_size": 200,
                })
            })
            .collect();
        format!(
            "Here is the outline:\n{}",
            serde_json::json!({"title": self.title, "units": units})
        )
    }
}

/// Builder for `PipelineConfig` with short retry delays.
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig {
                batch_size: 2,
                unit_phase_timeout: Duration::from_secs(60),
                limits: OutlineLimits {
                    max_units: 20,
                    default_target_size: 200,
                },
                retry: fast_retry(2),
            },
        }
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn unit_phase_timeout(mut self, timeout: Duration) -> Self {
        self.config.unit_phase_timeout = timeout;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry policy with millisecond backoff.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        call_timeout: Duration::from_secs(5),
    }
}

/// The header the unit prompt for `index` (0-based) starts with.
pub fn section(index: usize, total: usize) -> String {
    format!("Section {} of {}", index + 1, total)
}
