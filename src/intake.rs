// Job Intake
// Creates jobs and enforces the clarification gate: a job missing any of the
// recognized clarification keys is created clarification_required, never
// queued, and the control plane flips it to queued once metadata arrives.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{FathomError, Result};
use crate::store::Store;
use crate::types::{Job, JobOptions, JobStatus};

/// The five metadata keys a job must carry before it may run.
pub const CLARIFICATION_KEYS: [(&str, &str); 5] = [
    (
        "time_horizon",
        "What time horizon should the research cover?",
    ),
    (
        "region_focus",
        "Which regions or markets should be prioritized?",
    ),
    (
        "data_modalities",
        "Which data modalities (news, papers, blogs, PDFs) matter most?",
    ),
    (
        "integration_targets",
        "Where should the findings be delivered or integrated?",
    ),
    (
        "quality_constraints",
        "What tone or quality constraints apply to the report?",
    ),
];

/// A question the caller must answer before the job can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClarificationPrompt {
    pub key: &'static str,
    pub prompt: &'static str,
}

fn has_value(metadata: &serde_json::Map<String, serde_json::Value>, key: &str) -> bool {
    match metadata.get(key) {
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(serde_json::Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Prompts for every clarification key the metadata does not answer.
pub fn missing_clarifications(
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Vec<ClarificationPrompt> {
    CLARIFICATION_KEYS
        .iter()
        .filter(|(key, _)| !has_value(metadata, key))
        .map(|(key, prompt)| ClarificationPrompt { key, prompt })
        .collect()
}

/// Create a job. Complete metadata queues it; anything less parks it in
/// clarification_required with the prompts the caller needs to answer.
pub async fn create_job(
    store: &Store,
    question: &str,
    options: JobOptions,
    metadata: serde_json::Map<String, serde_json::Value>,
) -> Result<(Job, Vec<ClarificationPrompt>)> {
    let question = question.trim();
    if question.is_empty() {
        return Err(FathomError::InvalidOperation(
            "job question must not be empty".to_string(),
        ));
    }

    let prompts = missing_clarifications(&metadata);
    let status = if prompts.is_empty() {
        JobStatus::Queued
    } else {
        JobStatus::ClarificationRequired
    };

    let now = Utc::now();
    let job = Job {
        id: Uuid::new_v4().to_string(),
        question: question.to_string(),
        options,
        metadata,
        status,
        error: None,
        final_report: None,
        report_assets: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
        last_heartbeat: None,
    };
    store.insert_job(&job).await?;
    Ok((job, prompts))
}

/// Merge newly supplied metadata; once every clarification key is answered a
/// waiting job returns to the queue.
pub async fn resupply_metadata(
    store: &Store,
    job_id: &str,
    patch: serde_json::Map<String, serde_json::Value>,
) -> Result<Job> {
    let mut job = store.get_job(job_id).await?;
    for (key, value) in patch {
        job.metadata.insert(key, value);
    }
    store.update_job_metadata(job_id, &job.metadata).await?;

    if job.status == JobStatus::ClarificationRequired && missing_clarifications(&job.metadata).is_empty()
    {
        store.control_set_status(job_id, JobStatus::Queued).await?;
    }
    store.get_job(job_id).await
}

// ============================================================================
// Tests
// ============================================================================
