use thiserror::Error;

use crate::assembler::AssemblyError;
use crate::db::DatabaseError;
use crate::planner::PlanError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Unknown model selector '{0}'")]
    UnknownModel(String),

    #[error("Outline planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("Job {0} has units but no stored outline")]
    MissingOutline(String),

    #[error("Unit generation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
