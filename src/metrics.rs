// Engine Metrics
// Process-local counters; surfaced through tracing and the snapshot API.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ControlSignal;

/// Why the sweeper rescued a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescueReason {
    /// Never produced a step within the start threshold
    Start,
    /// Heartbeat went stale
    Heartbeat,
}

impl RescueReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RescueReason::Start => "start",
            RescueReason::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Default)]
pub struct Metrics {
    search_errors: AtomicU64,
    fetch_errors: AtomicU64,
    chat_errors: AtomicU64,
    embed_errors: AtomicU64,
    rescues_start: AtomicU64,
    rescues_heartbeat: AtomicU64,
    halts_paused: AtomicU64,
    halts_cancelled: AtomicU64,
    halts_clarification: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub search_errors: u64,
    pub fetch_errors: u64,
    pub chat_errors: u64,
    pub embed_errors: u64,
    pub rescues_start: u64,
    pub rescues_heartbeat: u64,
    pub halts_paused: u64,
    pub halts_cancelled: u64,
    pub halts_clarification: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_error(&self, tool: &str) {
        let counter = match tool {
            "search" => &self.search_errors,
            "fetch" => &self.fetch_errors,
            "chat" => &self.chat_errors,
            "embed" => &self.embed_errors,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_latency(&self, tool: &str, elapsed_ms: u128) {
        tracing::debug!(tool = tool, elapsed_ms = elapsed_ms as u64, "tool call finished");
    }

    pub fn record_rescue(&self, reason: RescueReason) {
        match reason {
            RescueReason::Start => self.rescues_start.fetch_add(1, Ordering::Relaxed),
            RescueReason::Heartbeat => self.rescues_heartbeat.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_halt(&self, signal: ControlSignal) {
        match signal {
            ControlSignal::Paused => self.halts_paused.fetch_add(1, Ordering::Relaxed),
            ControlSignal::Cancelled => self.halts_cancelled.fetch_add(1, Ordering::Relaxed),
            ControlSignal::ClarificationRequired => {
                self.halts_clarification.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            search_errors: self.search_errors.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            chat_errors: self.chat_errors.load(Ordering::Relaxed),
            embed_errors: self.embed_errors.load(Ordering::Relaxed),
            rescues_start: self.rescues_start.load(Ordering::Relaxed),
            rescues_heartbeat: self.rescues_heartbeat.load(Ordering::Relaxed),
            halts_paused: self.halts_paused.load(Ordering::Relaxed),
            halts_cancelled: self.halts_cancelled.load(Ordering::Relaxed),
            halts_clarification: self.halts_clarification.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_by_label() {
        let metrics = Metrics::new();
        metrics.record_tool_error("search");
        metrics.record_tool_error("search");
        metrics.record_tool_error("embed");
        metrics.record_rescue(RescueReason::Heartbeat);
        metrics.record_halt(ControlSignal::Paused);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.search_errors, 2);
        assert_eq!(snapshot.embed_errors, 1);
        assert_eq!(snapshot.fetch_errors, 0);
        assert_eq!(snapshot.rescues_heartbeat, 1);
        assert_eq!(snapshot.halts_paused, 1);
    }

    #[test]
    fn unknown_tool_label_is_ignored() {
        let metrics = Metrics::new();
        metrics.record_tool_error("teleport");
        assert_eq!(metrics.snapshot().search_errors, 0);
    }
}
