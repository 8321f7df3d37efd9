use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManuscriptError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("Service error: {0}")]
    Service(#[from] crate::service::ServiceError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Unknown provider '{name}' referenced by model '{model}'")]
    UnknownProvider { model: String, name: String },

    #[error("Provider '{name}' could not be built: {reason}")]
    ProviderSetup { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Job {0} is already running")]
    AlreadyRunning(String),
}

pub type Result<T> = std::result::Result<T, ManuscriptError>;
