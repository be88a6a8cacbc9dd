// Durable Store
// SQLite-backed authoritative state: jobs, steps, notes, sources, the
// citation ledger and section drafts. Every executor mutation funnels
// through here; claim/rescue/ledger operations run inside immediate
// transactions behind one mutexed connection, which serializes writers and
// yields the claim-one-queued-row-excluding-others semantics.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{FathomError, Result};
use crate::types::{
    CitationEntry, Job, JobOptions, JobStatus, Note, NoteRole, ReportAssets, SectionDraft,
    SectionKey, SectionStatus, Source, Step, StepStatus,
};

/// Connection manager over the engine database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// A step the planner proposed but the store has not numbered yet.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub title: String,
    pub objective: String,
    pub tool_hint: Option<String>,
    pub theme: Option<String>,
    pub iteration: i64,
}

/// Note fields supplied by the executor; id/timestamps assigned here.
#[derive(Debug, Clone)]
pub struct NewNote {
    pub job_id: String,
    pub step_id: Option<String>,
    pub role: NoteRole,
    pub importance: i64,
    pub token_count: i64,
    pub content: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSource {
    pub note_id: String,
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub raw_storage_url: String,
}

impl Store {
    /// Open or create the database at the given path.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn).await
    }

    /// In-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        // WAL mode returns a row, so query_row and ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                options TEXT NOT NULL,
                metadata TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                final_report TEXT,
                report_assets TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                last_heartbeat TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                objective TEXT NOT NULL,
                tool_hint TEXT,
                status TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                theme TEXT,
                iteration INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                UNIQUE(job_id, step_order)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS notes (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                step_id TEXT,
                role TEXT NOT NULL,
                importance INTEGER NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL,
                source_url TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                note_id TEXT NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                snippet TEXT NOT NULL,
                raw_storage_url TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS citations (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                source_hash TEXT NOT NULL,
                citation_number INTEGER NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                accessed_at TEXT NOT NULL,
                UNIQUE(job_id, source_hash),
                UNIQUE(job_id, citation_number)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS section_drafts (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                section_key TEXT NOT NULL,
                status TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL,
                citation_map TEXT NOT NULL,
                UNIQUE(job_id, section_key)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_job ON steps(job_id, step_order)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_notes_job ON notes(job_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_citations_job ON citations(job_id, citation_number)",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs (id, question, options, metadata, status, error, final_report,
                               report_assets, created_at, updated_at, started_at, completed_at,
                               last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id,
                job.question,
                serde_json::to_string(&job.options)?,
                serde_json::to_string(&job.metadata)?,
                job.status.as_str(),
                job.error,
                job.final_report,
                job.report_assets
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                ts(job.created_at),
                ts(job.updated_at),
                job.started_at.map(ts),
                job.completed_at.map(ts),
                job.last_heartbeat.map(ts),
            ],
        )?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, question, options, metadata, status, error, final_report, report_assets,
                    created_at, updated_at, started_at, completed_at, last_heartbeat
             FROM jobs WHERE id = ?1",
            params![job_id],
            job_from_row,
        )
        .optional()?
        .ok_or_else(|| FathomError::NotFound(format!("job {}", job_id)))
    }

    pub async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, question, options, metadata, status, error, final_report, report_assets,
                    created_at, updated_at, started_at, completed_at, last_heartbeat
             FROM jobs WHERE status = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![status.as_str()], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Atomically claim the oldest queued job for a worker slot.
    ///
    /// SELECT-then-UPDATE inside an immediate transaction: at most one
    /// claimer can transition a given row to running.
    pub async fn claim_next_queued(&self) -> Result<Option<Job>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let picked: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs WHERE status = 'queued' ORDER BY created_at, id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(job_id) = picked else {
            tx.commit()?;
            return Ok(None);
        };

        let now = ts(Utc::now());
        tx.execute(
            "UPDATE jobs SET status = 'running', started_at = ?1, updated_at = ?1,
                             last_heartbeat = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![now, job_id],
        )?;

        let job = tx.query_row(
            "SELECT id, question, options, metadata, status, error, final_report, report_assets,
                    created_at, updated_at, started_at, completed_at, last_heartbeat
             FROM jobs WHERE id = ?1",
            params![job_id],
            job_from_row,
        )?;
        tx.commit()?;
        Ok(Some(job))
    }

    /// Liveness signal: bump heartbeat and updated_at.
    pub async fn touch_heartbeat(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = ts(Utc::now());
        conn.execute(
            "UPDATE jobs SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, job_id],
        )?;
        Ok(())
    }

    /// Control-plane status transition.
    ///
    /// Requeueing clears report fields and the error text so a resumed run
    /// starts clean; other transitions only touch the status.
    pub async fn control_set_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = ts(Utc::now());
        let changed = if status == JobStatus::Queued {
            conn.execute(
                "UPDATE jobs SET status = 'queued', error = NULL, final_report = NULL,
                                 report_assets = NULL, completed_at = NULL, started_at = NULL,
                                 updated_at = ?1, last_heartbeat = ?1
                 WHERE id = ?2",
                params![now, job_id],
            )?
        } else {
            conn.execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, job_id],
            )?
        };
        if changed == 0 {
            return Err(FathomError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }

    /// Sweeper action: return a stalled job to the queue and reset its
    /// running steps, in one transaction.
    pub async fn rescue_requeue(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = ts(Utc::now());
        tx.execute(
            "UPDATE jobs SET status = 'queued', started_at = NULL, last_heartbeat = ?1,
                             updated_at = ?1
             WHERE id = ?2 AND status = 'running'",
            params![now, job_id],
        )?;
        tx.execute(
            "UPDATE steps SET status = 'pending' WHERE job_id = ?1 AND status = 'running'",
            params![job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fatal pipeline failure: terminal error status with the cause captured.
    pub async fn fail_job(&self, job_id: &str, error_text: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = ts(Utc::now());
        conn.execute(
            "UPDATE jobs SET status = 'error', error = ?1, updated_at = ?2, last_heartbeat = ?2
             WHERE id = ?3",
            params![error_text, now, job_id],
        )?;
        Ok(())
    }

    /// Terminal success: report, assets and completion stamp in one write.
    pub async fn complete_job(
        &self,
        job_id: &str,
        final_report: &str,
        assets: &ReportAssets,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = ts(Utc::now());
        conn.execute(
            "UPDATE jobs SET status = 'completed', final_report = ?1, report_assets = ?2,
                             completed_at = ?3, updated_at = ?3, last_heartbeat = ?3, error = NULL
             WHERE id = ?4",
            params![final_report, serde_json::to_string(assets)?, now, job_id],
        )?;
        Ok(())
    }

    pub async fn update_job_metadata(
        &self,
        job_id: &str,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = ts(Utc::now());
        let changed = conn.execute(
            "UPDATE jobs SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(metadata)?, now, job_id],
        )?;
        if changed == 0 {
            return Err(FathomError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }

    /// Cascades to steps, notes, sources, citations and section drafts.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        Ok(())
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Append planned steps with dense, continuing step_order numbers.
    pub async fn insert_steps(&self, job_id: &str, planned: &[NewStep]) -> Result<Vec<Step>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let base: i64 = tx.query_row(
            "SELECT COALESCE(MAX(step_order), 0) FROM steps WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;

        let mut inserted = Vec::with_capacity(planned.len());
        for (offset, step) in planned.iter().enumerate() {
            let record = Step {
                id: Uuid::new_v4().to_string(),
                job_id: job_id.to_string(),
                title: step.title.clone(),
                objective: step.objective.clone(),
                tool_hint: step.tool_hint.clone(),
                status: StepStatus::Pending,
                step_order: base + offset as i64 + 1,
                theme: step.theme.clone(),
                iteration: step.iteration,
                result: None,
            };
            tx.execute(
                "INSERT INTO steps (id, job_id, title, objective, tool_hint, status, step_order,
                                    theme, iteration, result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)",
                params![
                    record.id,
                    record.job_id,
                    record.title,
                    record.objective,
                    record.tool_hint,
                    record.status.as_str(),
                    record.step_order,
                    record.theme,
                    record.iteration,
                ],
            )?;
            inserted.push(record);
        }

        let now = ts(Utc::now());
        tx.execute(
            "UPDATE jobs SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, job_id],
        )?;
        tx.commit()?;
        Ok(inserted)
    }

    pub async fn list_steps(&self, job_id: &str) -> Result<Vec<Step>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, title, objective, tool_hint, status, step_order, theme,
                    iteration, result
             FROM steps WHERE job_id = ?1 ORDER BY step_order",
        )?;
        let rows = stmt.query_map(params![job_id], step_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn count_steps(&self, job_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM steps WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?)
    }

    /// Step transition; also heartbeats the owning job.
    pub async fn update_step_status(
        &self,
        job_id: &str,
        step_id: &str,
        status: StepStatus,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(result) = result {
            tx.execute(
                "UPDATE steps SET status = ?1, result = ?2 WHERE id = ?3",
                params![status.as_str(), serde_json::to_string(result)?, step_id],
            )?;
        } else {
            tx.execute(
                "UPDATE steps SET status = ?1 WHERE id = ?2",
                params![status.as_str(), step_id],
            )?;
        }
        let now = ts(Utc::now());
        tx.execute(
            "UPDATE jobs SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Notes & sources
    // ========================================================================

    pub async fn insert_note(&self, note: NewNote) -> Result<Note> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = Note {
            id: Uuid::new_v4().to_string(),
            job_id: note.job_id,
            step_id: note.step_id,
            role: note.role,
            importance: note.importance.clamp(1, 5),
            token_count: note.token_count.max(0),
            content: note.content,
            source_url: note.source_url,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO notes (id, job_id, step_id, role, importance, token_count, content,
                                source_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.job_id,
                record.step_id,
                record.role.as_str(),
                record.importance,
                record.token_count,
                record.content,
                record.source_url,
                ts(record.created_at),
            ],
        )?;
        let now = ts(Utc::now());
        tx.execute(
            "UPDATE jobs SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, record.job_id],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Notes for a job in creation order.
    pub async fn list_notes(&self, job_id: &str) -> Result<Vec<Note>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, step_id, role, importance, token_count, content, source_url,
                    created_at
             FROM notes WHERE job_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![job_id], note_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn insert_source(&self, source: NewSource) -> Result<Source> {
        let conn = self.conn.lock().await;
        let record = Source {
            id: Uuid::new_v4().to_string(),
            note_id: source.note_id,
            url: source.url,
            title: source.title,
            snippet: source.snippet,
            raw_storage_url: source.raw_storage_url,
        };
        conn.execute(
            "INSERT INTO sources (id, note_id, url, title, snippet, raw_storage_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.note_id,
                record.url,
                record.title,
                record.snippet,
                record.raw_storage_url,
            ],
        )?;
        Ok(record)
    }

    /// First source recorded for a URL within a job, if any.
    ///
    /// Lets a later step reuse the raw artifact of an already-fetched page so
    /// the citation hash stays stable across repeat appearances.
    pub async fn find_source_by_url(&self, job_id: &str, url: &str) -> Result<Option<Source>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT s.id, s.note_id, s.url, s.title, s.snippet, s.raw_storage_url
                 FROM sources s JOIN notes n ON n.id = s.note_id
                 WHERE n.job_id = ?1 AND s.url = ?2
                 ORDER BY s.rowid LIMIT 1",
                params![job_id, url],
                source_from_row,
            )
            .optional()?)
    }

    /// All sources of a job, ordered by the creation order of their notes.
    pub async fn list_sources_in_note_order(&self, job_id: &str) -> Result<Vec<Source>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.note_id, s.url, s.title, s.snippet, s.raw_storage_url
             FROM sources s JOIN notes n ON n.id = s.note_id
             WHERE n.job_id = ?1 ORDER BY n.rowid, s.rowid",
        )?;
        let rows = stmt.query_map(params![job_id], source_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Citation ledger
    // ========================================================================

    pub async fn find_citation(
        &self,
        job_id: &str,
        source_hash: &str,
    ) -> Result<Option<CitationEntry>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT id, job_id, source_hash, citation_number, title, url, accessed_at
                 FROM citations WHERE job_id = ?1 AND source_hash = ?2",
                params![job_id, source_hash],
                citation_from_row,
            )
            .optional()?)
    }

    pub async fn max_citation_number(&self, job_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(citation_number), 0) FROM citations WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?)
    }

    /// Insert one ledger row. A unique-constraint rejection surfaces as
    /// `FathomError::Conflict`; the ledger manager retries around it.
    pub async fn insert_citation(
        &self,
        job_id: &str,
        source_hash: &str,
        citation_number: i64,
        title: &str,
        url: &str,
    ) -> Result<CitationEntry> {
        let conn = self.conn.lock().await;
        let record = CitationEntry {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            source_hash: source_hash.to_string(),
            citation_number,
            title: title.to_string(),
            url: url.to_string(),
            accessed_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO citations (id, job_id, source_hash, citation_number, title, url,
                                    accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.job_id,
                record.source_hash,
                record.citation_number,
                record.title,
                record.url,
                ts(record.accessed_at),
            ],
        )?;
        Ok(record)
    }

    pub async fn list_citations(&self, job_id: &str) -> Result<Vec<CitationEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, source_hash, citation_number, title, url, accessed_at
             FROM citations WHERE job_id = ?1 ORDER BY citation_number",
        )?;
        let rows = stmt.query_map(params![job_id], citation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Section drafts
    // ========================================================================

    /// Insert-or-replace on (job_id, section_key); heartbeats the job.
    pub async fn upsert_section_draft(&self, draft: &SectionDraft) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO section_drafts (id, job_id, section_key, status, tokens, content,
                                         citation_map)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(job_id, section_key) DO UPDATE SET
                 status = excluded.status,
                 tokens = excluded.tokens,
                 content = excluded.content,
                 citation_map = excluded.citation_map",
            params![
                draft.id,
                draft.job_id,
                draft.section_key.as_str(),
                draft.status.as_str(),
                draft.tokens,
                draft.content,
                serde_json::to_string(&draft.citation_map)?,
            ],
        )?;
        let now = ts(Utc::now());
        tx.execute(
            "UPDATE jobs SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, draft.job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn list_section_drafts(&self, job_id: &str) -> Result<Vec<SectionDraft>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, section_key, status, tokens, content, citation_map
             FROM section_drafts WHERE job_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![job_id], section_draft_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

}

// Fixed-precision RFC 3339 so text ordering matches time ordering.
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: String) -> rusqlite::Result<T> {
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let options: JobOptions = parse_json(row.get::<_, String>(2)?)?;
    let metadata: serde_json::Map<String, serde_json::Value> =
        parse_json(row.get::<_, String>(3)?)?;
    let status: JobStatus = parse_enum(row.get::<_, String>(4)?)?;
    let report_assets: Option<ReportAssets> = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(parse_json(raw)?),
        None => None,
    };
    Ok(Job {
        id: row.get(0)?,
        question: row.get(1)?,
        options,
        metadata,
        status,
        error: row.get(5)?,
        final_report: row.get(6)?,
        report_assets,
        created_at: parse_ts(row.get(8)?)?,
        updated_at: parse_ts(row.get(9)?)?,
        started_at: row.get::<_, Option<String>>(10)?.map(parse_ts).transpose()?,
        completed_at: row.get::<_, Option<String>>(11)?.map(parse_ts).transpose()?,
        last_heartbeat: row.get::<_, Option<String>>(12)?.map(parse_ts).transpose()?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    let status: StepStatus = parse_enum(row.get::<_, String>(5)?)?;
    let result: Option<serde_json::Value> = match row.get::<_, Option<String>>(9)? {
        Some(raw) => Some(parse_json(raw)?),
        None => None,
    };
    Ok(Step {
        id: row.get(0)?,
        job_id: row.get(1)?,
        title: row.get(2)?,
        objective: row.get(3)?,
        tool_hint: row.get(4)?,
        status,
        step_order: row.get(6)?,
        theme: row.get(7)?,
        iteration: row.get(8)?,
        result,
    })
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    let role: NoteRole = parse_enum(row.get::<_, String>(3)?)?;
    Ok(Note {
        id: row.get(0)?,
        job_id: row.get(1)?,
        step_id: row.get(2)?,
        role,
        importance: row.get(4)?,
        token_count: row.get(5)?,
        content: row.get(6)?,
        source_url: row.get(7)?,
        created_at: parse_ts(row.get(8)?)?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        note_id: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        snippet: row.get(4)?,
        raw_storage_url: row.get(5)?,
    })
}

fn citation_from_row(row: &Row<'_>) -> rusqlite::Result<CitationEntry> {
    Ok(CitationEntry {
        id: row.get(0)?,
        job_id: row.get(1)?,
        source_hash: row.get(2)?,
        citation_number: row.get(3)?,
        title: row.get(4)?,
        url: row.get(5)?,
        accessed_at: parse_ts(row.get(6)?)?,
    })
}

fn section_draft_from_row(row: &Row<'_>) -> rusqlite::Result<SectionDraft> {
    let section_key: SectionKey = parse_enum(row.get::<_, String>(2)?)?;
    let status: SectionStatus = parse_enum(row.get::<_, String>(3)?)?;
    let citation_map = parse_json(row.get::<_, String>(6)?)?;
    Ok(SectionDraft {
        id: row.get(0)?,
        job_id: row.get(1)?,
        section_key,
        status,
        tokens: row.get(4)?,
        content: row.get(5)?,
        citation_map,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetRef;

    fn make_job(id: &str) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            question: "test question".to_string(),
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
        }
    }

    fn make_new_step(title: &str) -> NewStep {
        NewStep {
            title: title.to_string(),
            objective: format!("{} objective", title),
            tool_hint: None,
            theme: None,
            iteration: 0,
        }
    }

    #[tokio::test]
    async fn job_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let job = make_job("job-1");
        store.insert_job(&job).await.unwrap();

        let loaded = store.get_job("job-1").await.unwrap();
        assert_eq!(loaded.question, "test question");
        assert_eq!(loaded.status, JobStatus::Queued);
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn claim_transitions_exactly_one_queued_job() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-a")).await.unwrap();

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());
        assert!(claimed.last_heartbeat.is_some());

        assert!(store.claim_next_queued().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_prefers_oldest_job() {
        let store = Store::open_in_memory().await.unwrap();
        let mut first = make_job("job-old");
        first.created_at = Utc::now() - chrono::Duration::seconds(60);
        store.insert_job(&first).await.unwrap();
        store.insert_job(&make_job("job-new")).await.unwrap();

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.id, "job-old");
    }

    #[tokio::test]
    async fn step_order_is_dense_across_insert_batches() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-1")).await.unwrap();

        store
            .insert_steps("job-1", &[make_new_step("a"), make_new_step("b")])
            .await
            .unwrap();
        store
            .insert_steps(
                "job-1",
                &[NewStep {
                    iteration: 1,
                    ..make_new_step("c")
                }],
            )
            .await
            .unwrap();

        let steps = store.list_steps("job-1").await.unwrap();
        let orders: Vec<i64> = steps.iter().map(|s| s.step_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(steps[2].iteration, 1);
    }

    #[tokio::test]
    async fn note_importance_is_clamped() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-1")).await.unwrap();

        let note = store
            .insert_note(NewNote {
                job_id: "job-1".to_string(),
                step_id: None,
                role: NoteRole::PageSummary,
                importance: 11,
                token_count: 10,
                content: "content".to_string(),
                source_url: None,
            })
            .await
            .unwrap();
        assert_eq!(note.importance, 5);

        let low = store
            .insert_note(NewNote {
                job_id: "job-1".to_string(),
                step_id: None,
                role: NoteRole::PageSummary,
                importance: -3,
                token_count: 10,
                content: "content".to_string(),
                source_url: None,
            })
            .await
            .unwrap();
        assert_eq!(low.importance, 1);
    }

    #[tokio::test]
    async fn durable_writes_bump_heartbeat() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-1")).await.unwrap();
        assert!(store.get_job("job-1").await.unwrap().last_heartbeat.is_none());

        store
            .insert_note(NewNote {
                job_id: "job-1".to_string(),
                step_id: None,
                role: NoteRole::StepSummary,
                importance: 3,
                token_count: 5,
                content: "note".to_string(),
                source_url: None,
            })
            .await
            .unwrap();
        assert!(store.get_job("job-1").await.unwrap().last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn control_requeue_clears_report_fields() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-1")).await.unwrap();
        let assets = ReportAssets {
            markdown: AssetRef {
                key: "reports/job-1/report.md".to_string(),
                url: "file:///tmp/report.md".to_string(),
                sha256: "abc".to_string(),
            },
            pdf: None,
            docx: None,
        };
        store.complete_job("job-1", "# Report", &assets).await.unwrap();

        let completed = store.get_job("job-1").await.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.final_report.is_some());
        assert!(completed.report_assets.is_some());
        assert!(completed.completed_at.is_some());

        store
            .control_set_status("job-1", JobStatus::Queued)
            .await
            .unwrap();
        let requeued = store.get_job("job-1").await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.final_report.is_none());
        assert!(requeued.report_assets.is_none());
        assert!(requeued.completed_at.is_none());
        assert!(requeued.started_at.is_none());
    }

    #[tokio::test]
    async fn rescue_requeue_resets_running_steps() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-1")).await.unwrap();
        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);

        let steps = store
            .insert_steps("job-1", &[make_new_step("a"), make_new_step("b")])
            .await
            .unwrap();
        store
            .update_step_status("job-1", &steps[0].id, StepStatus::Completed, None)
            .await
            .unwrap();
        store
            .update_step_status("job-1", &steps[1].id, StepStatus::Running, None)
            .await
            .unwrap();

        store.rescue_requeue("job-1").await.unwrap();

        let job = store.get_job("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());

        let steps = store.list_steps("job-1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn citation_uniqueness_is_enforced() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-1")).await.unwrap();

        store
            .insert_citation("job-1", "hash-a", 1, "A", "https://a")
            .await
            .unwrap();

        // same hash
        let dup_hash = store
            .insert_citation("job-1", "hash-a", 2, "A", "https://a")
            .await;
        assert!(matches!(dup_hash, Err(FathomError::Conflict(_))));

        // same number
        let dup_number = store
            .insert_citation("job-1", "hash-b", 1, "B", "https://b")
            .await;
        assert!(matches!(dup_number, Err(FathomError::Conflict(_))));

        // same hash in another job is fine
        store.insert_job(&make_job("job-2")).await.unwrap();
        store
            .insert_citation("job-2", "hash-a", 1, "A", "https://a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn section_draft_upsert_replaces_by_key() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-1")).await.unwrap();

        let mut draft = SectionDraft {
            id: Uuid::new_v4().to_string(),
            job_id: "job-1".to_string(),
            section_key: SectionKey::Background,
            status: SectionStatus::Completed,
            tokens: 100,
            content: "v1".to_string(),
            citation_map: Vec::new(),
        };
        store.upsert_section_draft(&draft).await.unwrap();
        draft.content = "v2".to_string();
        draft.id = Uuid::new_v4().to_string();
        store.upsert_section_draft(&draft).await.unwrap();

        let drafts = store.list_section_drafts("job-1").await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].content, "v2");
    }

    #[tokio::test]
    async fn delete_job_cascades_to_children() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_job(&make_job("job-1")).await.unwrap();
        let steps = store
            .insert_steps("job-1", &[make_new_step("a")])
            .await
            .unwrap();
        let note = store
            .insert_note(NewNote {
                job_id: "job-1".to_string(),
                step_id: Some(steps[0].id.clone()),
                role: NoteRole::PageSummary,
                importance: 3,
                token_count: 4,
                content: "note".to_string(),
                source_url: Some("https://a".to_string()),
            })
            .await
            .unwrap();
        store
            .insert_source(NewSource {
                note_id: note.id.clone(),
                url: "https://a".to_string(),
                title: "A".to_string(),
                snippet: "snippet".to_string(),
                raw_storage_url: "file:///raw".to_string(),
            })
            .await
            .unwrap();
        store
            .insert_citation("job-1", "hash-a", 1, "A", "https://a")
            .await
            .unwrap();

        store.delete_job("job-1").await.unwrap();

        assert!(store.get_job("job-1").await.is_err());
        assert!(store.list_steps("job-1").await.unwrap().is_empty());
        assert!(store.list_notes("job-1").await.unwrap().is_empty());
        assert!(store.list_citations("job-1").await.unwrap().is_empty());
        assert!(store
            .list_sources_in_note_order("job-1")
            .await
            .unwrap()
            .is_empty());
    }
}
