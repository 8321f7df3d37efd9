//! Retry and fallback around provider calls.
//!
//! Retryable failures are retried with exponential backoff up to
//! `max_attempts`. When the primary target is exhausted the same call is
//! issued once more against the route's fallback target under the same
//! policy. Every call resolves within its retry and timeout budget.

use std::time::Duration;

use thiserror::Error;

use crate::config::RetrySettings;
use crate::provider::{GenerationRequest, ModelRoute, ProviderError, ProviderErrorKind, RouteTarget};

/// Backoff and attempt limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Ceiling on a single provider call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            call_timeout: Duration::from_secs(settings.call_timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// All targets were exhausted.
#[derive(Debug, Clone, Error)]
#[error("generation failed after {attempts} attempt(s): {message}")]
pub struct ExecutorError {
    /// Message of the last failure.
    pub message: String,
    pub kind: ProviderErrorKind,
    /// Attempts across primary and fallback.
    pub attempts: u32,
}

/// A successful call.
#[derive(Debug, Clone)]
pub struct Execution {
    pub text: String,
    pub attempts: u32,
    pub used_fallback: bool,
}

/// Issues calls against a model route.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    policy: RetryPolicy,
}

impl Executor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs one logical call: primary with retries, then the fallback.
    pub async fn execute(
        &self,
        route: &ModelRoute,
        system: Option<&str>,
        prompt: &str,
    ) -> Result<Execution, ExecutorError> {
        let mut attempts = 0u32;

        let last = match self
            .execute_target(&route.primary, system, prompt, &mut attempts)
            .await
        {
            Ok(text) => {
                return Ok(Execution {
                    text,
                    attempts,
                    used_fallback: false,
                })
            }
            Err(e) => e,
        };

        let Some(fallback) = &route.fallback else {
            return Err(exhausted(last, attempts));
        };

        log::warn!(
            "Primary provider '{}' exhausted ({}), switching to '{}'",
            route.primary.provider.name(),
            last,
            fallback.provider.name()
        );

        match self
            .execute_target(fallback, system, prompt, &mut attempts)
            .await
        {
            Ok(text) => Ok(Execution {
                text,
                attempts,
                used_fallback: true,
            }),
            Err(e) => Err(exhausted(e, attempts)),
        }
    }

    async fn execute_target(
        &self,
        target: &RouteTarget,
        system: Option<&str>,
        prompt: &str,
        attempts: &mut u32,
    ) -> Result<String, ProviderError> {
        let request = GenerationRequest {
            system: system.map(str::to_string),
            prompt: prompt.to_string(),
            params: target.params.clone(),
        };

        let mut tries = 0u32;
        loop {
            tries += 1;
            *attempts += 1;

            let outcome =
                match tokio::time::timeout(self.policy.call_timeout, target.provider.generate(&request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(format!(
                        "call exceeded {}s",
                        self.policy.call_timeout.as_secs()
                    ))),
                };

            let err = match outcome {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };

            tracing::warn!(
                provider = target.provider.name(),
                model = %target.params.model,
                attempt = tries,
                max_attempts = self.policy.max_attempts,
                retryable = err.is_retryable(),
                "provider call failed: {}",
                err
            );

            if !err.is_retryable() || tries >= self.policy.max_attempts {
                return Err(err);
            }

            tokio::time::sleep(self.policy.backoff_delay(tries)).await;
        }
    }
}

fn exhausted(err: ProviderError, attempts: u32) -> ExecutorError {
    ExecutorError {
        message: err.message,
        kind: err.kind,
        attempts,
    }
}
