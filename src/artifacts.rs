// Artifact Store
// Blob sink for raw fetched documents and rendered report files. The engine
// only needs `put` and `get_signed`; the filesystem implementation below is
// what workers run with locally, anything S3-shaped slots in behind the
// same trait.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{FathomError, Result};
use crate::types::{AssetRef, ReportAssets};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes under a key; returns a stable URL for the object.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String>;

    /// A retrieval URL for an existing object. TTL is advisory; the local
    /// implementation ignores it.
    async fn get_signed(&self, key: &str, ttl_seconds: u64) -> Result<String>;
}

/// Key for a raw fetched document.
pub fn raw_page_key(job_id: &str, step_order: i64, index: usize) -> String {
    format!("raw/{}/{}-{}.json", job_id, step_order, index)
}

/// Key for the rendered markdown report.
pub fn report_key(job_id: &str) -> String {
    format!("reports/{}/report.md", job_id)
}

/// Store the finalized report and build the persisted asset descriptor.
///
/// PDF/DOCX renditions come from the external renderer; their slots stay
/// empty until it fills them.
pub async fn publish_report(
    store: &dyn ArtifactStore,
    job_id: &str,
    markdown: &str,
) -> Result<ReportAssets> {
    let key = report_key(job_id);
    let bytes = markdown.as_bytes();
    let url = store.put(&key, bytes, "text/markdown").await?;
    Ok(ReportAssets {
        markdown: AssetRef {
            key,
            url,
            sha256: sha256_hex(bytes),
        },
        pdf: None,
        docx: None,
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Local filesystem implementation
// ============================================================================

pub struct LocalArtifactStore {
    base_dir: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        // Keys are engine-generated, but refuse traversal anyway.
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(FathomError::InvalidOperation(format!(
                "artifact key '{}' escapes the store",
                key
            )));
        }
        Ok(self.base_dir.join(key))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        atomic_write(&path, bytes).await?;
        Ok(format!("file://{}", path.display()))
    }

    async fn get_signed(&self, key: &str, _ttl_seconds: u64) -> Result<String> {
        let path = self.object_path(key)?;
        if !path.exists() {
            return Err(FathomError::NotFound(format!("artifact {}", key)));
        }
        Ok(format!("file://{}", path.display()))
    }
}

/// Atomic write using temp file and rename.
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, bytes).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_get_signed_round_trip() {
        let temp = tempdir().unwrap();
        let store = LocalArtifactStore::new(temp.path());

        let url = store
            .put("raw/job-1/1-0.json", b"{\"url\":\"x\"}", "application/json")
            .await
            .unwrap();
        assert!(url.starts_with("file://"));

        let signed = store.get_signed("raw/job-1/1-0.json", 60).await.unwrap();
        assert_eq!(signed, url);

        let missing = store.get_signed("raw/job-1/9-9.json", 60).await;
        assert!(matches!(missing, Err(FathomError::NotFound(_))));
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let temp = tempdir().unwrap();
        let store = LocalArtifactStore::new(temp.path());
        let result = store.put("../outside", b"x", "text/plain").await;
        assert!(matches!(result, Err(FathomError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn publish_report_writes_markdown_with_checksum() {
        let temp = tempdir().unwrap();
        let store = LocalArtifactStore::new(temp.path());

        let assets = publish_report(&store, "job-1", "# Report\n\nbody").await.unwrap();
        assert_eq!(assets.markdown.key, "reports/job-1/report.md");
        assert_eq!(assets.markdown.sha256, sha256_hex(b"# Report\n\nbody"));
        assert!(assets.pdf.is_none());
        assert!(assets.docx.is_none());

        let stored = std::fs::read_to_string(temp.path().join("reports/job-1/report.md")).unwrap();
        assert_eq!(stored, "# Report\n\nbody");
    }

    #[test]
    fn key_layout() {
        assert_eq!(raw_page_key("j", 2, 1), "raw/j/2-1.json");
        assert_eq!(report_key("j"), "reports/j/report.md");
    }
}
