//! Per-owner admission: active-job limit and daily submission quota.

use thiserror::Error;

use crate::config::AdmissionSettings;
use crate::db::DatabaseError;
use crate::store::{Admission, GenerationInput, GenerationJob, JobStore};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Daily quota of {limit} submissions reached")]
    QuotaExceeded { limit: u32 },

    #[error("{active} jobs already running, the limit is {limit}")]
    ConcurrencyLimitReached { active: u64, limit: u32 },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl AdmissionError {
    /// True for the two user-visible rejections.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, AdmissionError::Database(_))
    }
}

/// Gate in front of job creation and job resumption.
#[derive(Clone)]
pub struct AdmissionGate {
    store: JobStore,
    settings: AdmissionSettings,
}

impl AdmissionGate {
    pub fn new(store: JobStore, settings: AdmissionSettings) -> Self {
        Self { store, settings }
    }

    /// Creates a pending job if the owner is under both limits. The new job
    /// counts against today's quota; a rejected request does not.
    pub fn admit_new(
        &self,
        owner_id: &str,
        input: &GenerationInput,
        model_selector: &str,
    ) -> Result<GenerationJob, AdmissionError> {
        let outcome = self.store.create_admitted_job(
            owner_id,
            input,
            model_selector,
            u64::from(self.settings.max_active_jobs_per_owner),
            u64::from(self.settings.daily_quota_per_owner),
        )?;
        match outcome {
            Admission::Created(job) => Ok(job),
            Admission::TooManyActive(active) => Err(self.too_many(owner_id, active)),
            Admission::QuotaReached(used) => {
                log::info!(
                    "Rejecting submission from {}: {} submission(s) today",
                    owner_id,
                    used
                );
                Err(AdmissionError::QuotaExceeded {
                    limit: self.settings.daily_quota_per_owner,
                })
            }
        }
    }

    /// Checks that reactivating one of the owner's inactive jobs stays within
    /// the active-job limit. Resuming does not consume quota.
    pub fn admit_reactivation(&self, owner_id: &str) -> Result<(), AdmissionError> {
        let active = self.store.count_active(owner_id)?;
        if active >= u64::from(self.settings.max_active_jobs_per_owner) {
            return Err(self.too_many(owner_id, active));
        }
        Ok(())
    }

    fn too_many(&self, owner_id: &str, active: u64) -> AdmissionError {
        log::info!("Rejecting work for {}: {} active job(s)", owner_id, active);
        AdmissionError::ConcurrencyLimitReached {
            active,
            limit: self.settings.max_active_jobs_per_owner,
        }
    }
}
