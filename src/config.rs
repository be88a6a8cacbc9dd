// Engine Configuration
// Recognized options for worker slots, planning caps, rescue thresholds,
// synthesis budgets and the external tool endpoints.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Rescue sweeper thresholds, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescueConfig {
    /// A running job with no steps yet is rescued after this long.
    #[serde(default = "default_start_seconds")]
    pub start_seconds: u64,
    /// A running job whose heartbeat is older than this is rescued.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    /// Slack added on top of a job's own duration budget.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

fn default_start_seconds() -> u64 {
    300
}
fn default_heartbeat_seconds() -> u64 {
    120
}
fn default_grace_seconds() -> u64 {
    60
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            start_seconds: default_start_seconds(),
            heartbeat_seconds: default_heartbeat_seconds(),
            grace_seconds: default_grace_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Produce persisted per-section drafts instead of one classic synthesis call.
    #[serde(default)]
    pub longform_enabled: bool,
}

/// Planner expansion rounds after the original plan completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationConfig {
    /// 0 disables expansion entirely.
    #[serde(default)]
    pub max_iterations: u32,
    /// Stop expanding once accumulated note tokens exceed this.
    #[serde(default = "default_iteration_token_budget")]
    pub token_budget: i64,
}

fn default_iteration_token_budget() -> i64 {
    60_000
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            token_budget: default_iteration_token_budget(),
        }
    }
}

/// External collaborator endpoints for the tool gateway.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolEndpoints {
    /// Primary search endpoint (searxng-compatible JSON API).
    #[serde(default)]
    pub search_url: Option<String>,
    /// Workflow search endpoint (POST {query, k}).
    #[serde(default)]
    pub workflow_search_url: Option<String>,
    /// Fetch workflow endpoint (POST {url}).
    #[serde(default)]
    pub fetch_url: Option<String>,
    /// OpenAI-compatible chat completions base URL.
    #[serde(default)]
    pub llm_url: Option<String>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Embedding endpoint (POST {input}).
    #[serde(default)]
    pub embed_url: Option<String>,
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    /// Vector store base URL (collections/points REST shape).
    #[serde(default)]
    pub vector_url: Option<String>,
    #[serde(default = "default_vector_collection")]
    pub vector_collection: String,
}

fn default_embed_dim() -> usize {
    384
}
fn default_vector_collection() -> String {
    "fathom_notes".to_string()
}

/// Configuration for the job engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent worker slots.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Planner cap on steps per plan (original or expansion round).
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Default per-job duration budget feeding the rescue threshold.
    #[serde(default = "default_max_job_seconds")]
    pub max_job_seconds: u64,
    /// Completion cap passed to language-model calls.
    #[serde(default = "default_max_llm_tokens")]
    pub max_llm_tokens: i64,
    /// Model context window the synthesis budget is derived from.
    #[serde(default = "default_max_context")]
    pub max_context: i64,
    /// Hard cap on notes packed into a synthesis call.
    #[serde(default = "default_max_notes_for_synth")]
    pub max_notes_for_synth: usize,
    /// Cross-job archive notes retrieved for planner warm-up.
    #[serde(default = "default_warm_notes_limit")]
    pub warm_notes_limit: usize,
    #[serde(default = "default_warm_importance_min")]
    pub warm_importance_min: i64,
    /// Scheduler tick driving the sweeper and claimer.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub rescue: RescueConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub iteration: IterationConfig,
    #[serde(default)]
    pub tools: ToolEndpoints,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_max_steps() -> u32 {
    5
}
fn default_max_job_seconds() -> u64 {
    1800
}
fn default_max_llm_tokens() -> i64 {
    2048
}
fn default_max_context() -> i64 {
    16_000
}
fn default_max_notes_for_synth() -> usize {
    40
}
fn default_warm_notes_limit() -> usize {
    8
}
fn default_warm_importance_min() -> i64 {
    3
}
fn default_tick_interval_ms() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_steps: default_max_steps(),
            max_job_seconds: default_max_job_seconds(),
            max_llm_tokens: default_max_llm_tokens(),
            max_context: default_max_context(),
            max_notes_for_synth: default_max_notes_for_synth(),
            warm_notes_limit: default_warm_notes_limit(),
            warm_importance_min: default_warm_importance_min(),
            tick_interval_ms: default_tick_interval_ms(),
            rescue: RescueConfig::default(),
            features: FeatureFlags::default(),
            iteration: IterationConfig::default(),
            tools: ToolEndpoints::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Token budget available for notes in one synthesis call.
    pub fn synthesis_budget(&self) -> i64 {
        (self.max_context - 2000 - self.max_llm_tokens).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.rescue.heartbeat_seconds, 120);
        assert!(!config.features.longform_enabled);
        assert_eq!(config.iteration.max_iterations, 0);
    }

    #[test]
    fn synthesis_budget_subtracts_reserve_and_completion() {
        let config = EngineConfig {
            max_context: 16_000,
            max_llm_tokens: 2048,
            ..EngineConfig::default()
        };
        assert_eq!(config.synthesis_budget(), 16_000 - 2000 - 2048);
    }

    #[test]
    fn synthesis_budget_never_negative() {
        let config = EngineConfig {
            max_context: 1000,
            max_llm_tokens: 2048,
            ..EngineConfig::default()
        };
        assert_eq!(config.synthesis_budget(), 0);
    }

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"max_concurrent": 2, "rescue": {"heartbeat_seconds": 60}, "features": {"longform_enabled": true}}"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.rescue.heartbeat_seconds, 60);
        assert_eq!(config.rescue.start_seconds, 300);
        assert!(config.features.longform_enabled);
    }
}
