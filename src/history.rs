use crate::types::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Durable record of what a collection has already processed.
///
/// Append-only per run: `commit` replaces the file with the union of the
/// known and newly staged identifiers, so the set never shrinks except by
/// deleting the file externally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub processed: BTreeSet<Uuid>,
    pub last_digest: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    pub fn contains(&self, id: &Uuid) -> bool {
        self.processed.contains(id)
    }
}

/// One JSON file per collection under `dir`. Commit is a tmp-write plus
/// atomic rename, invoked exactly once per collection per run, only after
/// the caller confirms the full pipeline succeeded.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", slug(collection)))
    }

    /// Returns the stored record, or an empty default if none exists yet.
    pub async fn load(&self, collection: &str) -> Result<HistoryRecord> {
        let path = self.record_path(collection);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record: HistoryRecord = serde_json::from_slice(&bytes)?;
                debug!(
                    collection,
                    known = record.processed.len(),
                    "loaded history"
                );
                Ok(record)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(collection, "no history file, starting empty");
                Ok(HistoryRecord::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replaces the record with `known ∪ staged` and sets
    /// `last_digest = now`. A failure here leaves the on-disk state
    /// untouched, so the next run retries the same entries.
    pub async fn commit(
        &self,
        collection: &str,
        staged: &BTreeSet<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut record = self.load(collection).await?;
        record.processed.extend(staged.iter().copied());
        record.last_digest = Some(now);

        let path = self.record_path(collection);
        self.write_atomic(&path, &record)
            .await
            .map_err(|e| PipelineError::Commit {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;

        info!(
            collection,
            staged = staged.len(),
            total = record.processed.len(),
            "committed history"
        );
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, record: &HistoryRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Collection names become file names; keep only safe characters.
fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[tokio::test]
    async fn load_missing_returns_empty_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let record = store.load("news").await.unwrap();
        assert!(record.processed.is_empty());
        assert!(record.last_digest.is_none());
    }

    #[tokio::test]
    async fn commit_unions_and_sets_last_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();

        store
            .commit("news", &BTreeSet::from([id(1), id(2)]), t1)
            .await
            .unwrap();
        store
            .commit("news", &BTreeSet::from([id(2), id(3)]), t2)
            .await
            .unwrap();

        let record = store.load("news").await.unwrap();
        assert_eq!(record.processed, BTreeSet::from([id(1), id(2), id(3)]));
        assert_eq!(record.last_digest, Some(t2));
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let now = Utc::now();

        store
            .commit("tech", &BTreeSet::from([id(1)]), now)
            .await
            .unwrap();

        let other = store.load("finance").await.unwrap();
        assert!(other.processed.is_empty());
    }

    #[test]
    fn slug_sanitizes_names() {
        assert_eq!(slug("Morning News / EU"), "morning_news___eu");
        assert_eq!(slug("tech_daily-2"), "tech_daily-2");
    }
}
