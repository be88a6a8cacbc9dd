// Fathom Domain Types
// Entities persisted by the durable store, plus their status enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Job
// ============================================================================

/// Lifecycle status of a research job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the shared queue for a worker slot
    Queued,
    /// Claimed by a worker, pipeline in flight
    Running,
    /// Halted by the control plane; resumable
    Paused,
    /// Halted by the control plane; terminal for the executor
    Cancelled,
    /// Report published
    Completed,
    /// Fatal pipeline failure, `error` text set
    Error,
    /// Intake is missing clarification metadata; the executor refuses to run
    ClarificationRequired,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::ClarificationRequired => "clarification_required",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "cancelled" => Ok(JobStatus::Cancelled),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            "clarification_required" => Ok(JobStatus::ClarificationRequired),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Per-job execution options supplied at intake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A deep-research job: the unit the queue, sweeper and executor operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub question: String,
    pub options: JobOptions,
    /// Free-form mapping; the five clarification keys live here.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub final_report: Option<String>,
    pub report_assets: Option<ReportAssets>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

// ============================================================================
// Step
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    /// Finished without usable results (e.g. no search hits)
    Partial,
    Error,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Partial => "partial",
            StepStatus::Error => "error",
        }
    }

    /// Terminal steps are skipped on resume.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Partial | StepStatus::Error
        )
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "partial" => Ok(StepStatus::Partial),
            "error" => Ok(StepStatus::Error),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// One investigative step of a job's plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub job_id: String,
    pub title: String,
    /// Search objective the planner attached; drives query synthesis.
    pub objective: String,
    pub tool_hint: Option<String>,
    pub status: StepStatus,
    /// 1-based, dense within a job.
    pub step_order: i64,
    pub theme: Option<String>,
    /// 0 for the original plan, >= 1 for planner expansions.
    pub iteration: i64,
    pub result: Option<serde_json::Value>,
}

// ============================================================================
// Note / Source
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteRole {
    PageSummary,
    StepSummary,
    CriticNote,
    CrossJobSummary,
}

impl NoteRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NoteRole::PageSummary => "page_summary",
            NoteRole::StepSummary => "step_summary",
            NoteRole::CriticNote => "critic_note",
            NoteRole::CrossJobSummary => "cross_job_summary",
        }
    }
}

impl std::str::FromStr for NoteRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "page_summary" => Ok(NoteRole::PageSummary),
            "step_summary" => Ok(NoteRole::StepSummary),
            "critic_note" => Ok(NoteRole::CriticNote),
            "cross_job_summary" => Ok(NoteRole::CrossJobSummary),
            other => Err(format!("unknown note role '{}'", other)),
        }
    }
}

/// Append-only evidence produced while executing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub job_id: String,
    /// None for job-level notes (critic, cross-job summaries).
    pub step_id: Option<String>,
    pub role: NoteRole,
    /// Clamped to [1, 5].
    pub importance: i64,
    pub token_count: i64,
    pub content: String,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A fetched document backing a page-summary note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub note_id: String,
    pub url: String,
    pub title: String,
    pub snippet: String,
    /// Pointer into the artifact store (raw fetched document).
    pub raw_storage_url: String,
}

// ============================================================================
// Citation ledger
// ============================================================================

/// One row of the per-job citation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationEntry {
    pub id: String,
    pub job_id: String,
    /// Stable digest over url | title | raw_storage_url.
    pub source_hash: String,
    /// 1-based, dense within the job.
    pub citation_number: i64,
    pub title: String,
    pub url: String,
    pub accessed_at: DateTime<Utc>,
}

// ============================================================================
// Section drafts
// ============================================================================

/// The fixed report sections the longform synthesis path produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKey {
    ExecutiveSummary,
    Background,
    Analysis,
    Recommendations,
}

impl SectionKey {
    pub const ALL: [SectionKey; 4] = [
        SectionKey::ExecutiveSummary,
        SectionKey::Background,
        SectionKey::Analysis,
        SectionKey::Recommendations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SectionKey::ExecutiveSummary => "executive_summary",
            SectionKey::Background => "background",
            SectionKey::Analysis => "analysis",
            SectionKey::Recommendations => "recommendations",
        }
    }

    pub fn heading(self) -> &'static str {
        match self {
            SectionKey::ExecutiveSummary => "Executive Summary",
            SectionKey::Background => "Background",
            SectionKey::Analysis => "Analysis",
            SectionKey::Recommendations => "Recommendations",
        }
    }

    /// Note roles eligible for this section.
    pub fn allowed_roles(self) -> &'static [NoteRole] {
        match self {
            SectionKey::ExecutiveSummary => &[NoteRole::StepSummary, NoteRole::CrossJobSummary],
            SectionKey::Background => &[NoteRole::PageSummary, NoteRole::CrossJobSummary],
            SectionKey::Analysis => &[NoteRole::PageSummary, NoteRole::StepSummary],
            SectionKey::Recommendations => &[NoteRole::StepSummary, NoteRole::CriticNote],
        }
    }
}

impl std::str::FromStr for SectionKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "executive_summary" => Ok(SectionKey::ExecutiveSummary),
            "background" => Ok(SectionKey::Background),
            "analysis" => Ok(SectionKey::Analysis),
            "recommendations" => Ok(SectionKey::Recommendations),
            other => Err(format!("unknown section key '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Pending,
    Completed,
}

impl SectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionStatus::Pending => "pending",
            SectionStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for SectionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SectionStatus::Pending),
            "completed" => Ok(SectionStatus::Completed),
            other => Err(format!("unknown section status '{}'", other)),
        }
    }
}

/// Which citations a note contributed to a section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationMapEntry {
    pub note_id: String,
    pub citation_numbers: Vec<i64>,
}

/// A persisted fragment of the final report (longform mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionDraft {
    pub id: String,
    pub job_id: String,
    pub section_key: SectionKey,
    pub status: SectionStatus,
    pub tokens: i64,
    pub content: String,
    pub citation_map: Vec<CitationMapEntry>,
}

// ============================================================================
// Report assets
// ============================================================================

/// One rendered report artifact with its integrity checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRef {
    pub key: String,
    pub url: String,
    /// SHA-256 hex digest of the stored bytes.
    pub sha256: String,
}

/// Asset descriptor persisted on the job at publication.
///
/// PDF and DOCX renditions are produced by the external renderer; the engine
/// only guarantees the markdown entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAssets {
    pub markdown: AssetRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf: Option<AssetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docx: Option<AssetRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Cancelled,
            JobStatus::Completed,
            JobStatus::Error,
            JobStatus::ClarificationRequired,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_steps_are_skippable() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Partial.is_terminal());
        assert!(StepStatus::Error.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn section_keys_cover_all_roles() {
        let mut covered = std::collections::HashSet::new();
        for key in SectionKey::ALL {
            for role in key.allowed_roles() {
                covered.insert(role.as_str());
            }
        }
        assert!(covered.contains("page_summary"));
        assert!(covered.contains("step_summary"));
        assert!(covered.contains("critic_note"));
        assert!(covered.contains("cross_job_summary"));
    }
}
