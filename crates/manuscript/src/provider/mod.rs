//! Generation provider adapter.
//!
//! A provider turns `(prompt, model params)` into text. It knows nothing
//! about jobs; retry and fallback live in [`crate::executor`].

pub mod http;
pub mod stub;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{Config, ModelConfig, ModelTarget};
use crate::error::ConfigError;

pub use http::OpenAiCompatibleProvider;
pub use stub::StubProvider;

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    Unavailable,
    Timeout,
    Network,
    Upstream,
    InvalidResponse,
    InvalidCredentials,
    MalformedRequest,
}

impl ProviderErrorKind {
    /// Infers the kind from an HTTP status code and the response body.
    /// An auth failure stays fatal even if its body mentions rate limits.
    pub fn infer(status_code: u16, body: &str) -> Self {
        if matches!(status_code, 401 | 403) {
            return Self::InvalidCredentials;
        }
        let normalized = body.to_lowercase();
        if normalized.contains("rate limit") || normalized.contains("too many requests") {
            return Self::RateLimited;
        }

        match status_code {
            400 | 404 | 413 | 422 => Self::MalformedRequest,
            429 => Self::RateLimited,
            408 | 504 => Self::Timeout,
            502 | 503 => Self::Unavailable,
            _ => Self::Upstream,
        }
    }

    pub fn retryable(self) -> bool {
        !matches!(self, Self::InvalidCredentials | Self::MalformedRequest)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimited => "rate limited",
            Self::Unavailable => "upstream unavailable",
            Self::Timeout => "timeout",
            Self::Network => "network error",
            Self::Upstream => "upstream error",
            Self::InvalidResponse => "invalid response",
            Self::InvalidCredentials => "invalid credentials",
            Self::MalformedRequest => "malformed request",
        };
        f.write_str(s)
    }
}

/// A failed provider call.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn from_status(status_code: u16, body: &str) -> Self {
        Self {
            kind: ProviderErrorKind::infer(status_code, body),
            message: format!("HTTP {}: {}", status_code, body),
            status_code: Some(status_code),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// Per-call model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub params: ModelParams,
}

/// A text-generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

/// A provider plus the model parameters to call it with.
#[derive(Clone)]
pub struct RouteTarget {
    pub provider: Arc<dyn GenerationProvider>,
    pub params: ModelParams,
}

impl fmt::Debug for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTarget")
            .field("provider", &self.provider.name())
            .field("params", &self.params)
            .finish()
    }
}

/// Primary and optional alternate target for one model selector.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub primary: RouteTarget,
    pub fallback: Option<RouteTarget>,
}

impl ModelRoute {
    pub fn single(provider: Arc<dyn GenerationProvider>, model: &str) -> Self {
        Self {
            primary: RouteTarget {
                provider,
                params: ModelParams::new(model),
            },
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, provider: Arc<dyn GenerationProvider>, model: &str) -> Self {
        self.fallback = Some(RouteTarget {
            provider,
            params: ModelParams::new(model),
        });
        self
    }
}

/// Resolves a job's `model_selector` to a route.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    routes: HashMap<String, ModelRoute>,
    default_selector: String,
}

impl ModelRouter {
    pub fn new(default_selector: impl Into<String>) -> Self {
        Self {
            routes: HashMap::new(),
            default_selector: default_selector.into(),
        }
    }

    pub fn with_route(mut self, selector: impl Into<String>, route: ModelRoute) -> Self {
        self.routes.insert(selector.into(), route);
        self
    }

    pub fn default_selector(&self) -> &str {
        &self.default_selector
    }

    pub fn contains(&self, selector: &str) -> bool {
        self.routes.contains_key(selector)
    }

    pub fn resolve(&self, selector: &str) -> Option<&ModelRoute> {
        self.routes.get(selector)
    }

    /// Builds HTTP providers and routes from the config.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut providers: HashMap<&str, Arc<dyn GenerationProvider>> = HashMap::new();
        for provider_config in &config.providers {
            let provider = OpenAiCompatibleProvider::from_config(provider_config)?;
            providers.insert(provider_config.name.as_str(), Arc::new(provider));
        }

        let build_target = |selector: &str,
                      model: &ModelConfig,
                      target: &ModelTarget|
         -> Result<RouteTarget, ConfigError> {
            let provider = providers.get(target.provider.as_str()).cloned().ok_or_else(|| {
                ConfigError::UnknownProvider {
                    model: selector.to_string(),
                    name: target.provider.clone(),
                }
            })?;
            Ok(RouteTarget {
                provider,
                params: ModelParams {
                    model: target.model.clone(),
                    temperature: model.temperature,
                    max_tokens: model.max_tokens,
                },
            })
        };

        let mut router = ModelRouter::new(config.default_model.clone());
        for (selector, model) in &config.models {
            let primary = build_target(selector, model, &model.primary)?;
            let fallback = match &model.fallback {
                Some(fb) => Some(build_target(selector, model, fb)?),
                None => None,
            };
            router.routes.insert(selector.clone(), ModelRoute { primary, fallback });
        }

        log::info!(
            "Configured {} provider(s) and {} model route(s)",
            providers.len(),
            router.routes.len()
        );
        Ok(router)
    }
}
