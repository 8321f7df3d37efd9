pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use schema::{
    AdmissionSettings, Config, ModelConfig, ModelTarget, PipelineSettings, ProviderConfig,
    RetrySettings, StallSettings,
};
