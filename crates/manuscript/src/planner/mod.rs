//! Outline planning.
//!
//! One generation call through the executor, decoded into an [`Outline`].
//! A reply that does not decode fails planning; there is no re-prompt
//! beyond the executor's own retries.

pub mod outline;
pub mod prompt;

use thiserror::Error;

use crate::executor::{ExecutorError, Executor};
use crate::provider::ModelRoute;
use crate::store::{GenerationInput, Outline};

pub use outline::{decode_outline, extract_json, OutlineLimits};
pub use prompt::{
    build_plan_prompt, build_unit_prompt, fallback_placeholder, PLAN_SYSTEM_PROMPT,
    UNIT_SYSTEM_PROMPT,
};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("provider call failed: {0}")]
    Provider(#[from] ExecutorError),

    #[error("reply contained no JSON object")]
    NoJson,

    #[error("reply is not a valid outline: {0}")]
    Malformed(String),

    #[error("outline has no units")]
    Empty,

    #[error("outline has {count} units, more than the limit of {max}")]
    TooManyUnits { count: usize, max: usize },

    #[error("unit index {index} is outside 0..{count}")]
    IndexOutOfRange { index: i64, count: usize },

    #[error("unit index {0} appears more than once")]
    DuplicateIndex(usize),

    #[error("unit {0} has an empty title")]
    EmptyTitle(usize),

    #[error("regenerated outline has {actual} units but {expected} are already planned")]
    OutlineMismatch { expected: usize, actual: usize },
}

/// Produces outlines for generation inputs.
#[derive(Debug, Clone)]
pub struct Planner {
    executor: Executor,
    limits: OutlineLimits,
}

impl Planner {
    pub fn new(executor: Executor, limits: OutlineLimits) -> Self {
        Self { executor, limits }
    }

    /// Issues the planning call and decodes the reply.
    pub async fn plan(
        &self,
        route: &ModelRoute,
        input: &GenerationInput,
    ) -> Result<Outline, PlanError> {
        let prompt = build_plan_prompt(
            input,
            self.limits.max_units,
            self.limits.default_target_size,
        );
        let execution = self
            .executor
            .execute(route, Some(PLAN_SYSTEM_PROMPT), &prompt)
            .await?;

        let fallback_title = input.title.as_deref().unwrap_or("Untitled");
        let outline = decode_outline(&execution.text, fallback_title, &self.limits)?;
        log::info!(
            "Planned outline '{}' with {} unit(s) after {} attempt(s)",
            outline.title,
            outline.total_units(),
            execution.attempts
        );
        Ok(outline)
    }

    /// Plans again for a resumed job. The unit count must match the stored
    /// outline; persisted units are never renumbered.
    pub async fn replan(
        &self,
        route: &ModelRoute,
        input: &GenerationInput,
        existing: &Outline,
    ) -> Result<Outline, PlanError> {
        let fresh = self.plan(route, input).await?;
        if fresh.total_units() != existing.total_units() {
            return Err(PlanError::OutlineMismatch {
                expected: existing.total_units(),
                actual: fresh.total_units(),
            });
        }
        Ok(fresh)
    }
}
