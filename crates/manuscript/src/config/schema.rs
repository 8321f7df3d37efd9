use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub admission: AdmissionSettings,
    #[serde(default)]
    pub stall: StallSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default = "default_model_name")]
    pub default_model: String,
}

fn default_model_name() -> String {
    "default".to_string()
}

impl Config {
    /// The configured database path, or `~/.manuscript/data/manuscript.db`.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_units")]
    pub max_units: usize,
    #[serde(default = "default_target_size")]
    pub default_target_size: u32,
    #[serde(default = "default_unit_phase_timeout")]
    pub unit_phase_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    2
}

fn default_max_units() -> usize {
    40
}

fn default_target_size() -> u32 {
    600
}

fn default_unit_phase_timeout() -> u64 {
    3600
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_units: default_max_units(),
            default_target_size: default_target_size(),
            unit_phase_timeout_secs: default_unit_phase_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_call_timeout() -> u64 {
    180
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSettings {
    #[serde(default = "default_max_active_jobs")]
    pub max_active_jobs_per_owner: u32,
    #[serde(default = "default_daily_quota")]
    pub daily_quota_per_owner: u32,
}

fn default_max_active_jobs() -> u32 {
    3
}

fn default_daily_quota() -> u32 {
    20
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_active_jobs_per_owner: default_max_active_jobs(),
            daily_quota_per_owner: default_daily_quota(),
        }
    }
}

/// Idle budgets per non-terminal status before a job is reported stalled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallSettings {
    #[serde(default = "default_pending_secs")]
    pub pending_secs: u64,
    #[serde(default = "default_planning_secs")]
    pub planning_secs: u64,
    #[serde(default = "default_generating_secs")]
    pub generating_units_secs: u64,
    #[serde(default = "default_assembling_secs")]
    pub assembling_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_pending_secs() -> u64 {
    120
}

fn default_planning_secs() -> u64 {
    300
}

fn default_generating_secs() -> u64 {
    600
}

fn default_assembling_secs() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for StallSettings {
    fn default() -> Self {
        Self {
            pending_secs: default_pending_secs(),
            planning_secs: default_planning_secs(),
            generating_units_secs: default_generating_secs(),
            assembling_secs: default_assembling_secs(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StallSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// An OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

/// What a `model_selector` resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub primary: ModelTarget,
    #[serde(default)]
    pub fallback: Option<ModelTarget>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}
