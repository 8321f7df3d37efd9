//! OpenAI-compatible chat-completions provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{GenerationProvider, GenerationRequest, ProviderError, ProviderErrorKind};
use crate::config::ProviderConfig;
use crate::error::ConfigError;
use crate::secrets::resolve_secret_optional;

/// Maximum length of an error body kept in messages and logs.
const MAX_ERROR_BODY_LENGTH: usize = 200;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Talks to `{base_url}/chat/completions`.
pub struct OpenAiCompatibleProvider {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::ProviderSetup {
                name: name.clone(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            name,
            client,
            api_key,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let api_key = resolve_secret_optional(
            config.api_key.as_deref(),
            config.api_key_file.as_deref(),
            config.api_key_env_var.as_deref(),
        )
        .map_err(|e| ConfigError::ProviderSetup {
            name: config.name.clone(),
            reason: e.to_string(),
        })?;

        Self::new(
            config.name.clone(),
            &config.base_url,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_transport_error(e: &reqwest::Error) -> ProviderError {
    let kind = if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else if e.is_builder() {
        ProviderErrorKind::MalformedRequest
    } else {
        ProviderErrorKind::Network
    };
    ProviderError::new(kind, e.to_string())
}

#[async_trait]
impl GenerationProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &request.params.model,
            messages,
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let err = ProviderError::from_status(status, &truncate_body(&body));
            log::debug!("Provider '{}' returned {}", self.name, err);
            return Err(err);
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::InvalidResponse,
                format!("Failed to decode response: {}", e),
            )
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::InvalidResponse,
                    "Response contained no message content",
                )
            })
    }
}
