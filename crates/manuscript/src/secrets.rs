//! Provider credential resolution.
//!
//! An API key can be given in the config three ways, checked in this order:
//!
//! 1. **Direct value** (`apiKey`) for local experiments
//! 2. **File reference** (`apiKeyFile`) for mounted secrets
//! 3. **Env var reference** (`apiKeyEnvVar`) for deployments
//!
//! Resolved keys are wrapped in [`SecretString`] so they never reach logs.

use secrecy::SecretString;
use std::fs;

/// Error type for secret resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Secret file '{path}' is empty")]
    EmptyFile { path: String },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where a provider's API key comes from. Empty strings count as unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretSource<'a> {
    pub direct: Option<&'a str>,
    pub file_path: Option<&'a str>,
    pub env_var: Option<&'a str>,
}

impl<'a> SecretSource<'a> {
    fn non_empty(value: Option<&'a str>) -> Option<&'a str> {
        value.filter(|s| !s.is_empty())
    }

    /// Returns true if at least one source is configured.
    pub fn is_configured(&self) -> bool {
        Self::non_empty(self.direct).is_some()
            || Self::non_empty(self.file_path).is_some()
            || Self::non_empty(self.env_var).is_some()
    }
}

/// Resolves a secret from the first configured source.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    let source = SecretSource {
        direct,
        file_path,
        env_var,
    };

    if let Some(value) = SecretSource::non_empty(source.direct) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = SecretSource::non_empty(source.file_path) {
        let expanded = expand_home(path);
        let content = fs::read_to_string(&expanded).map_err(|e| SecretError::FileReadError {
            path: expanded.clone(),
            source: e,
        })?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SecretError::EmptyFile { path: expanded });
        }
        return Ok(SecretString::from(trimmed.to_string()));
    }

    if let Some(name) = SecretSource::non_empty(source.env_var) {
        return match std::env::var(name) {
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Like [`resolve_secret`], but an unconfigured key is `None`.
///
/// Local OpenAI-compatible servers often run without a key.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Expands a leading `~` or `~/` to the home directory.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy();
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}
