// Rescue Sweeper
// Periodic scan for running jobs whose start time or heartbeat went stale:
// a dead worker leaves its job in running forever otherwise. Rescue returns
// the job to the queue and resets its running steps; the next claim resumes
// from the first non-terminal step.

use chrono::{DateTime, Duration, Utc};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::metrics::{Metrics, RescueReason};
use crate::store::Store;
use crate::types::{Job, JobStatus};

/// Sweep with the current clock.
pub async fn sweep(store: &Store, config: &EngineConfig, metrics: &Metrics) -> Result<usize> {
    sweep_at(store, config, metrics, Utc::now()).await
}

/// Sweep against an explicit `now`, so stall detection is testable without
/// waiting out real thresholds.
pub async fn sweep_at(
    store: &Store,
    config: &EngineConfig,
    metrics: &Metrics,
    now: DateTime<Utc>,
) -> Result<usize> {
    let running = store.list_jobs_by_status(JobStatus::Running).await?;
    let mut rescued = 0usize;

    for job in running {
        let step_count = store.count_steps(&job.id).await?;
        let Some(reason) = stall_reason(&job, step_count, config, now) else {
            continue;
        };

        store.rescue_requeue(&job.id).await?;
        metrics.record_rescue(reason);
        rescued += 1;
        tracing::warn!(
            job_id = %job.id,
            reason = reason.as_str(),
            "rescued stalled job back to the queue"
        );
    }

    Ok(rescued)
}

/// Why a running job counts as stalled, if it does.
fn stall_reason(
    job: &Job,
    step_count: i64,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<RescueReason> {
    if step_count == 0 {
        // Never planned anything: measure from the later of start/creation.
        let base = job.started_at.map_or(job.created_at, |started| started.max(job.created_at));
        if now - base > Duration::seconds(config.rescue.start_seconds as i64) {
            return Some(RescueReason::Start);
        }
        return None;
    }

    let base = [
        job.last_heartbeat,
        Some(job.updated_at),
        job.started_at,
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(job.created_at);

    // A job past its own duration budget is rescued even while the worker
    // still heartbeats.
    let duration_budget = job
        .options
        .max_duration_seconds
        .unwrap_or(config.max_job_seconds);
    let threshold = Duration::seconds(
        (config.rescue.heartbeat_seconds.min(duration_budget + config.rescue.grace_seconds)) as i64,
    );

    if now - base > threshold {
        return Some(RescueReason::Heartbeat);
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewStep;
    use crate::types::{JobOptions, StepStatus};

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.rescue.start_seconds = 300;
        config.rescue.heartbeat_seconds = 60;
        config.rescue.grace_seconds = 60;
        config
    }

    async fn running_job(store: &Store, id: &str) -> Job {
        let now = Utc::now();
        let job = Job {
            id: id.to_string(),
            question: "q".to_string(),
            options: JobOptions::default(),
            metadata: serde_json::Map::new(),
            status: JobStatus::Queued,
            error: None,
            final_report: None,
            report_assets: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
        };
        store.insert_job(&job).await.unwrap();
        store.claim_next_queued().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn fresh_job_is_not_rescued() {
        let store = Store::open_in_memory().await.unwrap();
        let metrics = Metrics::new();
        running_job(&store, "job-1").await;

        let rescued = sweep(&store, &config(), &metrics).await.unwrap();
        assert_eq!(rescued, 0);
        assert_eq!(
            store.get_job("job-1").await.unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn stale_heartbeat_rescues_job_and_steps() {
        let store = Store::open_in_memory().await.unwrap();
        let metrics = Metrics::new();
        running_job(&store, "job-1").await;
        let steps = store
            .insert_steps(
                "job-1",
                &[NewStep {
                    title: "a".to_string(),
                    objective: "a".to_string(),
                    tool_hint: None,
                    theme: None,
                    iteration: 0,
                }],
            )
            .await
            .unwrap();
        store
            .update_step_status("job-1", &steps[0].id, StepStatus::Running, None)
            .await
            .unwrap();

        // heartbeatThreshold is 60s; advance the clock 120s past all liveness stamps
        let rescued = sweep_at(
            &store,
            &config(),
            &metrics,
            Utc::now() + Duration::seconds(120),
        )
        .await
        .unwrap();
        assert_eq!(rescued, 1);
        assert_eq!(metrics.snapshot().rescues_heartbeat, 1);

        let job = store.get_job("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());

        let steps = store.list_steps("job-1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Pending);

        // next tick claims it again
        let reclaimed = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, "job-1");
    }

    #[tokio::test]
    async fn stepless_job_uses_start_threshold() {
        let store = Store::open_in_memory().await.unwrap();
        let metrics = Metrics::new();
        running_job(&store, "job-1").await;

        // Past the heartbeat threshold but under the start threshold: a
        // stepless job is still planning, leave it alone.
        let rescued = sweep_at(
            &store,
            &config(),
            &metrics,
            Utc::now() + Duration::seconds(120),
        )
        .await
        .unwrap();
        assert_eq!(rescued, 0);

        let rescued = sweep_at(
            &store,
            &config(),
            &metrics,
            Utc::now() + Duration::seconds(400),
        )
        .await
        .unwrap();
        assert_eq!(rescued, 1);
        assert_eq!(metrics.snapshot().rescues_start, 1);
    }

    #[tokio::test]
    async fn job_duration_budget_tightens_threshold() {
        let store = Store::open_in_memory().await.unwrap();
        let metrics = Metrics::new();

        let now = Utc::now();
        let job = Job {
            id: "job-1".to_string(),
            question: "q".to_string(),
            options: JobOptions {
                // 10s budget + 60s grace = 70s, tighter than the 1800s default
                max_duration_seconds: Some(10),
                ..JobOptions::default()
            },
            metadata: serde_json::Map::new(),
            status: JobStatus::Queued,
            error: None,
            final_report: None,
            report_assets: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
        };
        store.insert_job(&job).await.unwrap();
        store.claim_next_queued().await.unwrap().unwrap();
        store
            .insert_steps(
                "job-1",
                &[NewStep {
                    title: "a".to_string(),
                    objective: "a".to_string(),
                    tool_hint: None,
                    theme: None,
                    iteration: 0,
                }],
            )
            .await
            .unwrap();

        let mut wide = config();
        wide.rescue.heartbeat_seconds = 3600;

        let rescued = sweep_at(
            &store,
            &wide,
            &metrics,
            Utc::now() + Duration::seconds(100),
        )
        .await
        .unwrap();
        assert_eq!(rescued, 1);
    }
}
