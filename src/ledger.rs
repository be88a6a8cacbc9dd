// Citation Ledger Manager
// Per-job, dense, monotonically numbered source list with deterministic
// dedup by content hash, plus the report-side rendering helpers
// (marker linkification and the anchored references section).

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{FathomError, Result};
use crate::store::Store;
use crate::types::CitationEntry;

/// Concurrent writers can race between read-max and insert; the unique
/// constraints reject the loser and we retry the lookup-then-insert.
const ASSIGN_RETRIES: usize = 16;

/// Fields a citation is derived from.
#[derive(Debug, Clone)]
pub struct CitationSource {
    pub url: String,
    pub title: String,
    pub raw_storage_url: String,
}

/// Stable digest over url | title | raw_storage_url. Any component may be
/// empty; the separator keeps field boundaries unambiguous.
pub fn source_hash(source: &CitationSource) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.url.as_bytes());
    hasher.update(b"|");
    hasher.update(source.title.as_bytes());
    hasher.update(b"|");
    hasher.update(source.raw_storage_url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Assigns citation numbers for one job's ledger.
pub struct CitationLedger<'a> {
    store: &'a Store,
    job_id: &'a str,
}

impl<'a> CitationLedger<'a> {
    pub fn new(store: &'a Store, job_id: &'a str) -> Self {
        Self { store, job_id }
    }

    /// Return the citation number for a source, assigning `max + 1` on first
    /// sight. Idempotent: repeat appearances of the same source hash resolve
    /// to the already-assigned number.
    pub async fn assign(&self, source: &CitationSource) -> Result<i64> {
        let hash = source_hash(source);

        for _ in 0..ASSIGN_RETRIES {
            if let Some(entry) = self.store.find_citation(self.job_id, &hash).await? {
                return Ok(entry.citation_number);
            }

            let next = self.store.max_citation_number(self.job_id).await? + 1;
            match self
                .store
                .insert_citation(self.job_id, &hash, next, &source.title, &source.url)
                .await
            {
                Ok(entry) => return Ok(entry.citation_number),
                // Another writer advanced the sequence or inserted this
                // hash first; re-read and try again.
                Err(FathomError::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(FathomError::Conflict(format!(
            "citation assignment for job {} did not converge",
            self.job_id
        )))
    }

    /// Finalize-time fallback: when nothing cited inline (classic mode),
    /// derive the ledger from the job's sources in note creation order.
    pub async fn derive_from_sources(&self) -> Result<Vec<CitationEntry>> {
        let sources = self.store.list_sources_in_note_order(self.job_id).await?;
        for source in sources {
            self.assign(&CitationSource {
                url: source.url,
                title: source.title,
                raw_storage_url: source.raw_storage_url,
            })
            .await?;
        }
        self.store.list_citations(self.job_id).await
    }
}

/// Rewrite bare `[n]` markers as markdown links `[n](#ref-n)` for every n
/// present in the ledger. Markers already followed by a link target are left
/// untouched.
pub fn linkify_citations(text: &str, ledger: &[CitationEntry]) -> String {
    let known: std::collections::HashSet<i64> =
        ledger.iter().map(|entry| entry.citation_number).collect();

    let marker = Regex::new(r"\[(\d+)\]").expect("citation marker pattern");
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for captures in marker.captures_iter(text) {
        let whole = captures.get(0).expect("whole match");
        // Skip markers that already carry a link target.
        if text[whole.end()..].starts_with('(') {
            continue;
        }
        let number: i64 = match captures[1].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if !known.contains(&number) {
            continue;
        }
        out.push_str(&text[last..whole.start()]);
        out.push_str(&format!("[{}](#ref-{})", number, number));
        last = whole.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Render the anchored `## References` section.
pub fn references_section(ledger: &[CitationEntry]) -> String {
    let mut out = String::from("\n\n## References\n\n");
    for entry in ledger {
        let label = if entry.title.trim().is_empty() {
            entry.url.clone()
        } else {
            entry.title.clone()
        };
        if entry.url.trim().is_empty() {
            out.push_str(&format!(
                "<a id=\"ref-{}\"></a>[{}] {}\n",
                entry.citation_number, entry.citation_number, label
            ));
        } else {
            out.push_str(&format!(
                "<a id=\"ref-{}\"></a>[{}] [{}]({})\n",
                entry.citation_number, entry.citation_number, label, entry.url
            ));
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewNote, NewSource, Store};
    use crate::types::{Job, JobOptions, JobStatus, NoteRole};
    use chrono::Utc;

    async fn store_with_job(job_id: &str) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store
            .insert_job(&Job {
                id: job_id.to_string(),
                question: "q".to_string(),
                options: JobOptions::default(),
                metadata: serde_json::Map::new(),
                status: JobStatus::Running,
                error: None,
                final_report: None,
                report_assets: None,
                created_at: now,
                updated_at: now,
                started_at: Some(now),
                completed_at: None,
                last_heartbeat: Some(now),
            })
            .await
            .unwrap();
        store
    }

    fn source(url: &str) -> CitationSource {
        CitationSource {
            url: url.to_string(),
            title: format!("Title for {}", url),
            raw_storage_url: format!("file:///raw{}", url.len()),
        }
    }

    #[test]
    fn hash_is_stable_and_field_sensitive() {
        let a = source("https://a");
        assert_eq!(source_hash(&a), source_hash(&a));

        let mut b = source("https://a");
        b.title = "other".to_string();
        assert_ne!(source_hash(&a), source_hash(&b));
    }

    #[tokio::test]
    async fn assign_is_dense_and_dedups_by_hash() {
        let store = store_with_job("job-1").await;
        let ledger = CitationLedger::new(&store, "job-1");

        let first = ledger.assign(&source("https://a")).await.unwrap();
        let second = ledger.assign(&source("https://b")).await.unwrap();
        let repeat = ledger.assign(&source("https://a")).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(repeat, 1);

        let entries = store.list_citations("job-1").await.unwrap();
        let numbers: Vec<i64> = entries.iter().map(|e| e.citation_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn numbering_restarts_per_job() {
        let store = store_with_job("job-1").await;
        {
            let now = Utc::now();
            store
                .insert_job(&Job {
                    id: "job-2".to_string(),
                    question: "q".to_string(),
                    options: JobOptions::default(),
                    metadata: serde_json::Map::new(),
                    status: JobStatus::Running,
                    error: None,
                    final_report: None,
                    report_assets: None,
                    created_at: now,
                    updated_at: now,
                    started_at: Some(now),
                    completed_at: None,
                    last_heartbeat: Some(now),
                })
                .await
                .unwrap();
        }

        let first = CitationLedger::new(&store, "job-1")
            .assign(&source("https://a"))
            .await
            .unwrap();
        let other_job = CitationLedger::new(&store, "job-2")
            .assign(&source("https://a"))
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(other_job, 1);
    }

    #[tokio::test]
    async fn concurrent_assignment_stays_dense() {
        let store = store_with_job("job-1").await;

        let mut handles = Vec::new();
        for i in 0..12 {
            let store = store.clone();
            // Half the writers share a source so dedup and the retry path
            // both get exercised.
            let url = if i % 2 == 0 {
                "https://shared".to_string()
            } else {
                format!("https://distinct-{}", i)
            };
            handles.push(tokio::spawn(async move {
                CitationLedger::new(&store, "job-1")
                    .assign(&source(&url))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entries = store.list_citations("job-1").await.unwrap();
        // 1 shared + 6 distinct
        assert_eq!(entries.len(), 7);
        let numbers: Vec<i64> = entries.iter().map(|e| e.citation_number).collect();
        assert_eq!(numbers, (1..=7).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn fallback_ledger_follows_note_creation_order() {
        let store = store_with_job("job-1").await;
        for url in ["https://first", "https://second"] {
            let note = store
                .insert_note(NewNote {
                    job_id: "job-1".to_string(),
                    step_id: None,
                    role: NoteRole::PageSummary,
                    importance: 3,
                    token_count: 5,
                    content: format!("summary of {}", url),
                    source_url: Some(url.to_string()),
                })
                .await
                .unwrap();
            store
                .insert_source(NewSource {
                    note_id: note.id,
                    url: url.to_string(),
                    title: format!("Title {}", url),
                    snippet: "snippet".to_string(),
                    raw_storage_url: "file:///raw".to_string(),
                })
                .await
                .unwrap();
        }

        let entries = CitationLedger::new(&store, "job-1")
            .derive_from_sources()
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://first");
        assert_eq!(entries[0].citation_number, 1);
        assert_eq!(entries[1].url, "https://second");
        assert_eq!(entries[1].citation_number, 2);
    }

    fn entry(number: i64, title: &str, url: &str) -> CitationEntry {
        CitationEntry {
            id: format!("c{}", number),
            job_id: "job-1".to_string(),
            source_hash: format!("h{}", number),
            citation_number: number,
            title: title.to_string(),
            url: url.to_string(),
            accessed_at: Utc::now(),
        }
    }

    #[test]
    fn linkify_rewrites_known_markers_only() {
        let ledger = vec![entry(1, "A", "https://a"), entry(2, "B", "https://b")];
        let text = "Finding one [1] and two [2], but [9] is unknown.";
        let linked = linkify_citations(text, &ledger);
        assert!(linked.contains("[1](#ref-1)"));
        assert!(linked.contains("[2](#ref-2)"));
        assert!(linked.contains("[9]"));
        assert!(!linked.contains("[9](#ref-9)"));
    }

    #[test]
    fn linkify_leaves_existing_links_alone() {
        let ledger = vec![entry(1, "A", "https://a")];
        let text = "Already linked [1](#ref-1) here.";
        assert_eq!(linkify_citations(text, &ledger), text);
    }

    #[test]
    fn references_section_anchors_every_entry() {
        let ledger = vec![entry(1, "A", "https://a"), entry(2, "", "https://b")];
        let section = references_section(&ledger);
        assert!(section.contains("## References"));
        assert!(section.contains("<a id=\"ref-1\"></a>[1] [A](https://a)"));
        // Empty title falls back to the link itself.
        assert!(section.contains("<a id=\"ref-2\"></a>[2] [https://b](https://b)"));
    }
}
