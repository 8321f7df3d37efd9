use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::secrets::SecretSource;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.pipeline.batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "pipeline.batch_size must be at least 1".to_string(),
        });
    }

    if config.retry.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry.max_attempts must be at least 1".to_string(),
        });
    }

    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return Err(ConfigError::Validation {
            message: format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                config.retry.max_delay_ms, config.retry.base_delay_ms
            ),
        });
    }

    let mut names = HashSet::new();
    for provider in &config.providers {
        if !names.insert(provider.name.as_str()) {
            return Err(ConfigError::Validation {
                message: format!("Duplicate provider name: {}", provider.name),
            });
        }
        if let Err(e) = reqwest::Url::parse(&provider.base_url) {
            return Err(ConfigError::ProviderSetup {
                name: provider.name.clone(),
                reason: format!("invalid base_url: {}", e),
            });
        }
        let key_source = SecretSource {
            direct: provider.api_key.as_deref(),
            file_path: provider.api_key_file.as_deref(),
            env_var: provider.api_key_env_var.as_deref(),
        };
        if !key_source.is_configured() {
            log::debug!("Provider '{}' has no API key configured", provider.name);
        }
    }

    for (selector, model) in &config.models {
        let targets = std::iter::once(&model.primary).chain(model.fallback.iter());
        for target in targets {
            if !names.contains(target.provider.as_str()) {
                return Err(ConfigError::UnknownProvider {
                    model: selector.clone(),
                    name: target.provider.clone(),
                });
            }
        }
    }

    if !config.models.contains_key(&config.default_model) {
        return Err(ConfigError::Validation {
            message: format!(
                "default_model '{}' is not defined under models",
                config.default_model
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
    {
        "version": "1.0",
        "pipeline": { "batch_size": 3, "max_units": 12 },
        "retry": { "max_attempts": 4, "base_delay_ms": 500, "max_delay_ms": 8000 },
        "providers": [
            { "name": "main", "base_url": "https://api.example.com/v1", "api_key_env_var": "MAIN_KEY" },
            { "name": "backup", "base_url": "http://localhost:8080/v1" }
        ],
        "models": {
            "default": {
                "primary": { "provider": "main", "model": "writer-large" },
                "fallback": { "provider": "backup", "model": "writer-small" },
                "temperature": 0.7,
                "max_tokens": 4096
            }
        }
    }
    "#;

    #[test]
    fn test_load_valid_config() {
        let config = load_config_from_str(VALID).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.pipeline.batch_size, 3);
        assert_eq!(config.pipeline.max_units, 12);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.providers.len(), 2);
        let model = &config.models["default"];
        assert_eq!(model.primary.model, "writer-large");
        assert_eq!(model.fallback.as_ref().unwrap().provider, "backup");
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manuscript.json");
        std::fs::write(&path, VALID).unwrap();
        assert!(load_config(&path).is_ok());
        assert!(matches!(
            load_config(dir.path().join("missing.json")),
            Err(ConfigError::ReadFile { .. })
        ));
    }

    #[test]
    fn test_invalid_version() {
        let json = VALID.replace("\"1.0\"", "\"2.0\"");
        assert!(load_config_from_str(&json).is_err());
    }

    #[test]
    fn test_schema_rejects_zero_batch_size() {
        let json = VALID.replace("\"batch_size\": 3", "\"batch_size\": 0");
        assert!(matches!(
            load_config_from_str(&json),
            Err(ConfigError::SchemaValidation { .. })
        ));
    }

    #[test]
    fn test_schema_rejects_unknown_field() {
        let json = VALID.replace("\"max_units\": 12", "\"max_units\": 12, \"workers\": 4");
        assert!(matches!(
            load_config_from_str(&json),
            Err(ConfigError::SchemaValidation { .. })
        ));
    }

    #[test]
    fn test_unknown_provider_reference() {
        let json = VALID.replace("\"provider\": \"backup\"", "\"provider\": \"nowhere\"");
        assert!(matches!(
            load_config_from_str(&json),
            Err(ConfigError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn test_missing_default_model() {
        let json = VALID.replace("\"default\": {", "\"fast\": {");
        assert!(matches!(
            load_config_from_str(&json),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_delay_bounds() {
        let json = VALID.replace("\"max_delay_ms\": 8000", "\"max_delay_ms\": 100");
        assert!(matches!(
            load_config_from_str(&json),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_duplicate_provider_names() {
        let json = VALID.replace("\"name\": \"backup\"", "\"name\": \"main\"");
        assert!(load_config_from_str(&json).is_err());
    }

    #[test]
    fn test_invalid_base_url() {
        let json = VALID.replace("http://localhost:8080/v1", "not a url");
        assert!(matches!(
            load_config_from_str(&json),
            Err(ConfigError::ProviderSetup { .. })
        ));
    }
}
