//! Domain types of the job read model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Planning,
    GeneratingUnits,
    Assembling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Planning,
        JobStatus::GeneratingUnits,
        JobStatus::Assembling,
    ];

    pub const TERMINAL: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Planning => "planning",
            JobStatus::GeneratingUnits => "generating_units",
            JobStatus::Assembling => "assembling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "planning" => Ok(JobStatus::Planning),
            "generating_units" => Ok(JobStatus::GeneratingUnits),
            "assembling" => Ok(JobStatus::Assembling),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Returns the string form of each status, for SQL `IN` lists.
pub fn status_strs(statuses: &[JobStatus]) -> Vec<&'static str> {
    statuses.iter().map(JobStatus::as_str).collect()
}

/// Optional behaviours requested alongside the prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlags {
    #[serde(default)]
    pub deep_research: bool,
    #[serde(default)]
    pub include_references: bool,
}

/// What the client asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub mode: ModeFlags,
}

/// Position of a unit in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Opening,
    Body,
    Closing,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Opening => "opening",
            UnitKind::Body => "body",
            UnitKind::Closing => "closing",
        }
    }

    /// Lenient parse used for provider output and stored rows.
    pub fn parse_lenient(s: &str) -> UnitKind {
        match s.trim().to_ascii_lowercase().as_str() {
            "opening" | "introduction" | "intro" => UnitKind::Opening,
            "closing" | "conclusion" | "summary" => UnitKind::Closing,
            _ => UnitKind::Body,
        }
    }
}

/// One planned unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineUnit {
    pub index: usize,
    pub title: String,
    pub kind: UnitKind,
    pub target_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// The plan produced by the outline planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub title: String,
    pub units: Vec<OutlineUnit>,
}

impl Outline {
    pub fn total_units(&self) -> usize {
        self.units.len()
    }
}

/// A generation job as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub owner_id: String,
    pub input: GenerationInput,
    pub model_selector: String,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub total_units: usize,
    pub completed_units: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub outline: Option<Outline>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
}

impl GenerationJob {
    /// Title used for the artifact: the outline's, then the input's, then a default.
    pub fn document_title(&self) -> String {
        self.outline
            .as_ref()
            .map(|o| o.title.clone())
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.input.title.clone())
            .unwrap_or_else(|| "Untitled".to_string())
    }
}

/// One persisted piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub job_id: String,
    pub index: usize,
    pub title: String,
    pub kind: UnitKind,
    pub content: String,
    pub size: usize,
    pub is_fallback: bool,
    pub created_at: DateTime<Utc>,
}

/// An assembled document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub job_id: String,
    pub content: String,
    pub is_partial: bool,
    pub created_at: DateTime<Utc>,
}

/// Word count used as unit size.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in JobStatus::ACTIVE.iter().chain(JobStatus::TERMINAL.iter()) {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), *status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::GeneratingUnits.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::GeneratingUnits).unwrap();
        assert_eq!(json, "\"generating_units\"");
    }

    #[test]
    fn test_unit_kind_lenient_parse() {
        assert_eq!(UnitKind::parse_lenient("Introduction"), UnitKind::Opening);
        assert_eq!(UnitKind::parse_lenient("closing"), UnitKind::Closing);
        assert_eq!(UnitKind::parse_lenient("chapter"), UnitKind::Body);
    }

    #[test]
    fn test_input_defaults() {
        let input: GenerationInput = serde_json::from_str(r#"{"prompt": "Write"}"#).unwrap();
        assert_eq!(input.prompt, "Write");
        assert!(!input.mode.deep_research);
        assert!(input.title.is_none());
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count("one two\nthree  four"), 4);
        assert_eq!(word_count("   "), 0);
    }
}
