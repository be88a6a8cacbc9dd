// Pipeline Executor
// Advances a claimed job to a terminal status: Load -> Plan/Resume ->
// Execute(step...) -> Synthesize -> Finalize -> Published. Every phase
// boundary re-reads the job and honors pause/cancel/clarify signals; all
// progress lives on durable rows so a rescued job resumes from whatever
// state exists.

use std::sync::Arc;
use uuid::Uuid;

use crate::artifacts::{self, ArtifactStore};
use crate::config::EngineConfig;
use crate::error::{ControlSignal, FathomError, Result};
use crate::ledger::{self, CitationLedger, CitationSource};
use crate::metrics::Metrics;
use crate::packer;
use crate::prompts::{self, PageNote, SummarizerOutput};
use crate::store::{NewNote, NewSource, NewStep, Store};
use crate::tools::{ChatMessage, ChatOptions, FetchedPage, SearchResult, ToolGateway};
use crate::types::{
    CitationMapEntry, Job, JobStatus, Note, NoteRole, SectionDraft, SectionKey, SectionStatus,
    Step, StepStatus,
};
use crate::vector::{NotePayload, VectorQuery, VectorStore};

/// Fetch at most this many search hits per step.
const MAX_PAGES_PER_STEP: usize = 3;

/// Longform sections draw on at most this many notes each.
const SECTION_NOTE_CAP: usize = 12;

/// Raw page text offered to the summarizer, per page.
const RAW_EXCERPT_CHARS: usize = 4000;

/// Characters of a page kept in a heuristic note when the summarizer output
/// is unusable.
const HEURISTIC_NOTE_CHARS: usize = 600;

const BRIDGING_SENTENCE: &str = "_The next section builds on the evidence above._";

pub struct PipelineExecutor {
    job_id: String,
    store: Store,
    tools: Arc<dyn ToolGateway>,
    artifacts: Arc<dyn ArtifactStore>,
    vectors: Arc<dyn VectorStore>,
    config: EngineConfig,
    metrics: Arc<Metrics>,
}

impl PipelineExecutor {
    pub fn new(
        job_id: String,
        store: Store,
        tools: Arc<dyn ToolGateway>,
        artifacts: Arc<dyn ArtifactStore>,
        vectors: Arc<dyn VectorStore>,
        config: EngineConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            job_id,
            store,
            tools,
            artifacts,
            vectors,
            config,
            metrics,
        }
    }

    /// Run the pipeline to a terminal outcome.
    ///
    /// Control halts return Ok: the job row already carries the status the
    /// control plane set. True failures mark the job as error and bubble up.
    pub async fn run(&self) -> Result<()> {
        match self.drive().await {
            Ok(()) => {
                self.metrics.record_job_completed();
                Ok(())
            }
            Err(FathomError::Halted(signal)) => {
                self.metrics.record_halt(signal);
                tracing::info!(job_id = %self.job_id, signal = %signal, "pipeline halted cooperatively");
                Ok(())
            }
            Err(err) => {
                self.metrics.record_job_failed();
                tracing::error!(job_id = %self.job_id, error = %err, "pipeline failed");
                if let Err(store_err) = self.store.fail_job(&self.job_id, &err.to_string()).await {
                    tracing::error!(job_id = %self.job_id, error = %store_err, "failed to record job error");
                }
                Err(err)
            }
        }
    }

    async fn drive(&self) -> Result<()> {
        self.control_check().await?;
        let job = self.store.get_job(&self.job_id).await?;

        let existing = self.store.list_steps(&self.job_id).await?;
        if existing.is_empty() {
            self.plan(&job).await?;
        } else {
            tracing::info!(
                job_id = %self.job_id,
                steps = existing.len(),
                "resuming job with existing steps"
            );
        }

        let mut expansions: u32 = 0;
        loop {
            let steps = self.store.list_steps(&self.job_id).await?;
            for step in &steps {
                if step.status.is_terminal() {
                    continue;
                }
                self.control_check().await?;
                self.execute_step(&job, step).await?;
            }

            if expansions >= self.config.iteration.max_iterations {
                break;
            }
            self.control_check().await?;
            expansions += 1;
            if self.expand_plan(&job, expansions).await? == 0 {
                break;
            }
        }

        self.control_check().await?;
        let draft = self.synthesize(&job).await?;

        self.control_check().await?;
        let report = self.finalize(&job, draft).await?;

        self.record_cross_job_summary(&job, &report).await;
        Ok(())
    }

    /// The cooperative control check: reload the job, raise a typed halt if
    /// the control plane moved it out of running.
    async fn control_check(&self) -> Result<()> {
        let job = self.store.get_job(&self.job_id).await?;
        match job.status {
            JobStatus::Paused => Err(FathomError::Halted(ControlSignal::Paused)),
            JobStatus::Cancelled => Err(FathomError::Halted(ControlSignal::Cancelled)),
            JobStatus::ClarificationRequired => {
                Err(FathomError::Halted(ControlSignal::ClarificationRequired))
            }
            _ => Ok(()),
        }
    }

    async fn chat(&self, prompt: String, temperature: f32) -> Result<String> {
        let messages = [
            ChatMessage::system(
                "You are one stage of an automated research pipeline. \
                 Follow the requested output format exactly.",
            ),
            ChatMessage::user(prompt),
        ];
        self.tools
            .chat(
                &messages,
                ChatOptions {
                    max_tokens: self.config.max_llm_tokens,
                    temperature,
                },
            )
            .await
    }

    // ========================================================================
    // Plan
    // ========================================================================

    async fn plan(&self, job: &Job) -> Result<Vec<Step>> {
        let max_steps = job
            .options
            .max_steps
            .unwrap_or(self.config.max_steps)
            .min(self.config.max_steps)
            .max(1);

        let prior_context = self.assemble_prior_context(job).await;
        let prompt = prompts::build_planner_prompt(&job.question, max_steps, &prior_context);

        let response = match self.chat(prompt, 0.2).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "planner call failed");
                String::new()
            }
        };

        let mut planned = match prompts::parse_plan(&response) {
            Some(steps) if !steps.is_empty() => steps,
            _ => {
                tracing::warn!(
                    job_id = %self.job_id,
                    "planner output unusable, falling back to a single research step"
                );
                prompts::fallback_plan(&job.question)
            }
        };
        planned.truncate(max_steps as usize);

        let new_steps: Vec<NewStep> = planned
            .into_iter()
            .map(|step| NewStep {
                title: step.title,
                objective: step.objective,
                tool_hint: step.tool_hint,
                theme: step.theme,
                iteration: 0,
            })
            .collect();

        let inserted = self.store.insert_steps(&self.job_id, &new_steps).await?;
        tracing::info!(job_id = %self.job_id, steps = inserted.len(), "plan persisted");
        Ok(inserted)
    }

    /// Step and cross-job summaries already on this job, plus warm archive
    /// notes from the vector collaborator. Degrades to whatever is
    /// available; never fails the job.
    async fn assemble_prior_context(&self, job: &Job) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Ok(notes) = self.store.list_notes(&self.job_id).await {
            for note in notes {
                if matches!(note.role, NoteRole::StepSummary | NoteRole::CrossJobSummary) {
                    parts.push(format!("- {}", note.content));
                }
            }
        }

        match self.tools.embed(&job.question).await {
            Ok(vector) => {
                let query = VectorQuery {
                    vector,
                    limit: self.config.warm_notes_limit,
                    min_importance: Some(self.config.warm_importance_min),
                };
                match self.vectors.search(query).await {
                    Ok(hits) => {
                        for hit in hits {
                            parts.push(format!("- (archive) {}", hit.payload.content));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(job_id = %self.job_id, error = %err, "warm note lookup failed");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "question embedding failed");
            }
        }

        parts.join("\n")
    }

    /// One planner expansion round. Quietly adds nothing once the token
    /// budget is spent or the planner has no follow-ups.
    async fn expand_plan(&self, job: &Job, iteration: u32) -> Result<usize> {
        let notes = self.store.list_notes(&self.job_id).await?;
        let spent: i64 = notes.iter().map(|n| n.token_count).sum();
        if spent >= self.config.iteration.token_budget {
            tracing::info!(job_id = %self.job_id, spent, "iteration token budget exhausted");
            return Ok(0);
        }

        let summaries: String = notes
            .iter()
            .filter(|n| n.role == NoteRole::StepSummary)
            .map(|n| format!("- {}", n.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = prompts::build_expansion_prompt(
            &job.question,
            iteration,
            &summaries,
            self.config.max_steps,
        );
        let response = match self.chat(prompt, 0.2).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "expansion planner call failed");
                return Ok(0);
            }
        };

        let mut planned = match prompts::parse_plan(&response) {
            Some(steps) => steps,
            None => return Ok(0),
        };
        planned.truncate(self.config.max_steps as usize);
        if planned.is_empty() {
            return Ok(0);
        }

        let new_steps: Vec<NewStep> = planned
            .into_iter()
            .map(|step| NewStep {
                title: step.title,
                objective: step.objective,
                tool_hint: step.tool_hint,
                theme: step.theme,
                iteration: iteration as i64,
            })
            .collect();
        let inserted = self.store.insert_steps(&self.job_id, &new_steps).await?;
        tracing::info!(
            job_id = %self.job_id,
            iteration,
            steps = inserted.len(),
            "expansion steps persisted"
        );
        Ok(inserted.len())
    }

    // ========================================================================
    // Execute
    // ========================================================================

    async fn execute_step(&self, job: &Job, step: &Step) -> Result<()> {
        tracing::info!(
            job_id = %self.job_id,
            step = step.step_order,
            title = %step.title,
            "executing step"
        );
        self.store
            .update_step_status(&self.job_id, &step.id, StepStatus::Running, None)
            .await?;

        let query = format!("{} :: {}", job.question, step.objective);
        let results = self
            .tools
            .search(&query, step.tool_hint.as_deref())
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(job_id = %self.job_id, error = %err, "search chain failed");
                Vec::new()
            });

        if results.is_empty() {
            self.store
                .update_step_status(
                    &self.job_id,
                    &step.id,
                    StepStatus::Partial,
                    Some(&serde_json::json!({ "reason": "No search results" })),
                )
                .await?;
            return Ok(());
        }

        let mut pages: Vec<(SearchResult, FetchedPage, String)> = Vec::new();
        for (index, result) in results.iter().take(MAX_PAGES_PER_STEP).enumerate() {
            let page = match self.tools.fetch(&result.url).await {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(job_id = %self.job_id, url = %result.url, error = %err, "fetch failed");
                    continue;
                }
            };

            // A URL already fetched by an earlier step keeps its first raw
            // artifact so repeat citations hash identically.
            let raw_storage_url = match self
                .store
                .find_source_by_url(&self.job_id, &result.url)
                .await?
            {
                Some(existing) => existing.raw_storage_url,
                None => {
                    let key = artifacts::raw_page_key(&self.job_id, step.step_order, index);
                    self.artifacts
                        .put(&key, &serde_json::to_vec(&page)?, "application/json")
                        .await?
                }
            };
            pages.push((result.clone(), page, raw_storage_url));
        }

        if pages.is_empty() {
            self.store
                .update_step_status(
                    &self.job_id,
                    &step.id,
                    StepStatus::Partial,
                    Some(&serde_json::json!({ "reason": "No fetchable sources" })),
                )
                .await?;
            return Ok(());
        }

        let summary = self.summarize_pages(job, step, &pages).await;

        let mut source_count = 0usize;
        for (index, page_note) in summary.page_notes.iter().enumerate() {
            let matched = pages
                .iter()
                .find(|(result, page, _)| {
                    page_note.url.as_deref() == Some(page.url.as_str())
                        || page_note.url.as_deref() == Some(result.url.as_str())
                })
                .or_else(|| pages.get(index));

            let content = page_note.summary.trim();
            if content.is_empty() {
                continue;
            }

            let note = self
                .store
                .insert_note(NewNote {
                    job_id: self.job_id.clone(),
                    step_id: Some(step.id.clone()),
                    role: NoteRole::PageSummary,
                    importance: page_note.importance.unwrap_or(3),
                    token_count: packer::estimate_tokens(content),
                    content: content.to_string(),
                    source_url: matched
                        .map(|(_, page, _)| page.url.clone())
                        .or_else(|| page_note.url.clone()),
                })
                .await?;

            if let Some((result, page, raw_storage_url)) = matched {
                let title = if page.title.trim().is_empty() {
                    result.title.clone()
                } else {
                    page.title.clone()
                };
                self.store
                    .insert_source(NewSource {
                        note_id: note.id.clone(),
                        url: page.url.clone(),
                        title,
                        snippet: result.snippet.clone(),
                        raw_storage_url: raw_storage_url.clone(),
                    })
                    .await?;
                source_count += 1;
            }

            self.index_note(&note).await;
        }

        if let Some(step_summary) = summary
            .step_summary
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let note = self
                .store
                .insert_note(NewNote {
                    job_id: self.job_id.clone(),
                    step_id: Some(step.id.clone()),
                    role: NoteRole::StepSummary,
                    importance: 3,
                    token_count: packer::estimate_tokens(step_summary),
                    content: step_summary.to_string(),
                    source_url: None,
                })
                .await?;
            self.index_note(&note).await;
        }

        self.store
            .update_step_status(
                &self.job_id,
                &step.id,
                StepStatus::Completed,
                Some(&serde_json::json!({ "sources": source_count })),
            )
            .await?;
        Ok(())
    }

    async fn summarize_pages(
        &self,
        job: &Job,
        step: &Step,
        pages: &[(SearchResult, FetchedPage, String)],
    ) -> SummarizerOutput {
        let mut rendered = String::new();
        for (result, page, _) in pages {
            let excerpt: String = page.content.chars().take(RAW_EXCERPT_CHARS).collect();
            let title = if page.title.trim().is_empty() {
                result.title.as_str()
            } else {
                page.title.as_str()
            };
            rendered.push_str(&format!("### {}\nURL: {}\n{}\n\n", title, page.url, excerpt));
        }

        let prompt = prompts::build_summarizer_prompt(&job.question, &step.objective, &rendered);
        let response = match self.chat(prompt, 0.3).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "summarizer call failed");
                String::new()
            }
        };

        match prompts::parse_summary(&response) {
            Some(summary) => summary,
            None => {
                tracing::warn!(
                    job_id = %self.job_id,
                    step = step.step_order,
                    "summarizer output unusable, keeping heuristic page notes"
                );
                heuristic_summary(pages)
            }
        }
    }

    async fn index_note(&self, note: &Note) {
        let payload = NotePayload {
            job_id: note.job_id.clone(),
            role: note.role.as_str().to_string(),
            importance: note.importance,
            content: note.content.clone(),
        };
        let vector = match self.tools.embed(&note.content).await {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "note embedding failed");
                return;
            }
        };
        if let Err(err) = self.vectors.upsert(&note.id, &vector, payload).await {
            tracing::warn!(job_id = %self.job_id, error = %err, "note indexing failed");
        }
    }

    // ========================================================================
    // Synthesize
    // ========================================================================

    async fn synthesize(&self, job: &Job) -> Result<String> {
        let notes = self.store.list_notes(&self.job_id).await?;
        let packed = packer::pack_notes(
            &notes,
            self.config.synthesis_budget(),
            self.config.max_notes_for_synth,
        );

        let mut draft = if self.config.features.longform_enabled {
            self.longform_draft(job, &notes).await?
        } else {
            self.classic_draft(job, &packed).await?
        };

        let critic_prompt = prompts::build_critic_prompt(&draft, &prompts::render_notes(&packed));
        let critic = match self.chat(critic_prompt, 0.2).await {
            Ok(response) => prompts::parse_critic(&response),
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "critic call failed");
                None
            }
        };

        if let Some(critic) = critic {
            let limitations = critic.limitations.trim();
            if !limitations.is_empty() {
                draft.push_str(&format!(
                    "\n\n## Limitations & Critic Notes\n\n{}",
                    limitations
                ));
            }
            if !critic.is_empty() {
                let mut content = String::new();
                for issue in &critic.issues {
                    content.push_str(&format!("issue: {}\n", issue));
                }
                for follow_up in &critic.follow_up {
                    content.push_str(&format!("follow-up: {}\n", follow_up));
                }
                if !limitations.is_empty() {
                    content.push_str(&format!("limitations: {}\n", limitations));
                }
                self.store
                    .insert_note(NewNote {
                        job_id: self.job_id.clone(),
                        step_id: None,
                        role: NoteRole::CriticNote,
                        importance: 3,
                        token_count: packer::estimate_tokens(&content),
                        content,
                        source_url: None,
                    })
                    .await?;
            }
        }

        Ok(draft)
    }

    async fn classic_draft(&self, job: &Job, packed: &[Note]) -> Result<String> {
        let prompt = prompts::build_synthesis_prompt(&job.question, &prompts::render_notes(packed));
        match self.chat(prompt, 0.4).await {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(_) | Err(_) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    "synthesis call unusable, assembling report from notes directly"
                );
                let mut fallback = format!("# {}\n\n## Findings\n\n", job.question);
                for note in packed {
                    fallback.push_str(&format!("- {}\n", note.content));
                }
                Ok(fallback)
            }
        }
    }

    async fn longform_draft(&self, job: &Job, notes: &[Note]) -> Result<String> {
        let citations = CitationLedger::new(&self.store, &self.job_id);
        let sources = self.store.list_sources_in_note_order(&self.job_id).await?;

        let mut sections: Vec<(SectionKey, String)> = Vec::new();
        for section in SectionKey::ALL {
            self.control_check().await?;

            let mut selected: Vec<&Note> = notes
                .iter()
                .filter(|note| section.allowed_roles().contains(&note.role))
                .collect();
            selected.sort_by(|a, b| {
                b.importance
                    .cmp(&a.importance)
                    .then(b.token_count.cmp(&a.token_count))
            });
            selected.truncate(SECTION_NOTE_CAP);

            let mut rendered = String::new();
            let mut citation_map: Vec<CitationMapEntry> = Vec::new();
            for note in &selected {
                let mut numbers: Vec<i64> = Vec::new();
                for source in sources.iter().filter(|s| s.note_id == note.id) {
                    let number = citations
                        .assign(&CitationSource {
                            url: source.url.clone(),
                            title: source.title.clone(),
                            raw_storage_url: source.raw_storage_url.clone(),
                        })
                        .await?;
                    if !numbers.contains(&number) {
                        numbers.push(number);
                    }
                }
                let markers: String = numbers.iter().map(|n| format!("[{}]", n)).collect();
                rendered.push_str(&format!("- {} {}\n", note.content, markers));
                citation_map.push(CitationMapEntry {
                    note_id: note.id.clone(),
                    citation_numbers: numbers,
                });
            }

            let content = if selected.is_empty() {
                "No supporting evidence was collected for this section.".to_string()
            } else {
                let prompt =
                    prompts::build_section_prompt(&job.question, section, &rendered);
                match self.chat(prompt, 0.4).await {
                    Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                    Ok(_) | Err(_) => {
                        tracing::warn!(
                            job_id = %self.job_id,
                            section = section.as_str(),
                            "section call unusable, keeping cited note list"
                        );
                        rendered.trim().to_string()
                    }
                }
            };

            self.store
                .upsert_section_draft(&SectionDraft {
                    id: Uuid::new_v4().to_string(),
                    job_id: self.job_id.clone(),
                    section_key: section,
                    status: SectionStatus::Completed,
                    tokens: packer::estimate_tokens(&content),
                    content: content.clone(),
                    citation_map,
                })
                .await?;
            sections.push((section, content));
        }

        let mut draft = format!("# {}\n", job.question);
        for (index, (section, content)) in sections.iter().enumerate() {
            if index > 0 {
                draft.push_str(&format!("\n{}\n", BRIDGING_SENTENCE));
            }
            draft.push_str(&format!("\n## {}\n\n{}\n", section.heading(), content));
        }
        Ok(draft)
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    async fn finalize(&self, _job: &Job, draft: String) -> Result<String> {
        let citations = CitationLedger::new(&self.store, &self.job_id);
        let mut entries = self.store.list_citations(&self.job_id).await?;
        if entries.is_empty() {
            // Classic mode may have produced no inline citations; derive the
            // ledger from the job's sources in note creation order.
            entries = citations.derive_from_sources().await?;
        }

        let mut report = ledger::linkify_citations(&draft, &entries);
        if !entries.is_empty() {
            report.push_str(&ledger::references_section(&entries));
        }

        let assets =
            artifacts::publish_report(self.artifacts.as_ref(), &self.job_id, &report).await?;
        self.store
            .complete_job(&self.job_id, &report, &assets)
            .await?;
        tracing::info!(
            job_id = %self.job_id,
            citations = entries.len(),
            "report published"
        );
        Ok(report)
    }

    /// Post-publication archive note so future jobs can warm-start from this
    /// one. The job is already terminal; failures only log.
    async fn record_cross_job_summary(&self, job: &Job, report: &str) {
        let summary: String = report.chars().take(800).collect();
        let content = serde_json::json!({
            "question": job.question,
            "summary": summary,
        })
        .to_string();

        let note = match self
            .store
            .insert_note(NewNote {
                job_id: self.job_id.clone(),
                step_id: None,
                role: NoteRole::CrossJobSummary,
                importance: 4,
                token_count: packer::estimate_tokens(&content),
                content,
                source_url: None,
            })
            .await
        {
            Ok(note) => note,
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "cross-job summary insert failed");
                return;
            }
        };
        self.index_note(&note).await;
    }
}

/// Page notes derived directly from fetched content, used when the
/// summarizer response cannot be parsed.
fn heuristic_summary(pages: &[(SearchResult, FetchedPage, String)]) -> SummarizerOutput {
    let page_notes = pages
        .iter()
        .map(|(result, page, _)| {
            let text = if page.content.trim().is_empty() {
                result.snippet.clone()
            } else {
                page.content.chars().take(HEURISTIC_NOTE_CHARS).collect()
            };
            PageNote {
                url: Some(page.url.clone()),
                summary: text,
                importance: Some(3),
            }
        })
        .filter(|note| !note.summary.trim().is_empty())
        .collect();
    SummarizerOutput {
        page_notes,
        step_summary: None,
    }
}
