// Vector Store Collaborator
// Nearest-neighbor archive for cross-job note retrieval. Consulted only for
// plan-phase warm context and note indexing; unavailability degrades planner
// quality but never fails a job, so callers treat every method as
// best-effort.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FathomError, Result};

/// Payload stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotePayload {
    pub job_id: String,
    pub role: String,
    pub importance: i64,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub limit: usize,
    /// Minimum payload importance, applied as a server-side filter.
    pub min_importance: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorHit {
    pub score: f32,
    pub payload: NotePayload,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, dim: usize) -> Result<()>;

    async fn upsert(&self, id: &str, vector: &[f32], payload: NotePayload) -> Result<()>;

    async fn search(&self, query: VectorQuery) -> Result<Vec<VectorHit>>;
}

/// No-op implementation for degraded operation and tests.
pub struct NoopVectorStore;

#[async_trait]
impl VectorStore for NoopVectorStore {
    async fn ensure_collection(&self, _dim: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, _id: &str, _vector: &[f32], _payload: NotePayload) -> Result<()> {
        Ok(())
    }

    async fn search(&self, _query: VectorQuery) -> Result<Vec<VectorHit>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// HTTP implementation (collections/points REST shape)
// ============================================================================

pub struct HttpVectorStore {
    http: reqwest::Client,
    base_url: String,
    collection: String,
}

impl HttpVectorStore {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            collection: collection.into(),
        }
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/collections/{}",
            self.base_url.trim_end_matches('/'),
            self.collection
        )
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn ensure_collection(&self, dim: usize) -> Result<()> {
        let response = self
            .http
            .put(self.collection_url())
            .json(&serde_json::json!({
                "vectors": { "size": dim, "distance": "Cosine" }
            }))
            .send()
            .await?;
        // Conflict means the collection already exists.
        if response.status().is_success() || response.status().as_u16() == 409 {
            return Ok(());
        }
        Err(FathomError::Tool(format!(
            "vector collection create returned {}",
            response.status()
        )))
    }

    async fn upsert(&self, id: &str, vector: &[f32], payload: NotePayload) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/points", self.collection_url()))
            .json(&serde_json::json!({
                "points": [{ "id": id, "vector": vector, "payload": payload }]
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FathomError::Tool(format!(
                "vector upsert returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn search(&self, query: VectorQuery) -> Result<Vec<VectorHit>> {
        let mut body = serde_json::json!({
            "vector": query.vector,
            "limit": query.limit,
            "with_payload": true,
        });
        if let Some(min) = query.min_importance {
            body["filter"] = serde_json::json!({
                "must": [{ "key": "importance", "range": { "gte": min } }]
            });
        }

        let response = self
            .http
            .post(format!("{}/points/search", self.collection_url()))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FathomError::Tool(format!(
                "vector search returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct SearchResponse {
            #[serde(default)]
            result: Vec<VectorHit>,
        }
        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.result)
    }
}
