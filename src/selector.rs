use crate::llm::{extract_json, ModelClient, ModelRequest};
use crate::types::Entry;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Caps a collection's admitted entries to the N most worthwhile before
/// any content extraction happens, using only titles and feed summaries.
/// Model trouble never loses entries to an error: the fallback is the N
/// most recently published, with feed order breaking timestamp ties.
pub struct ArticleSelector {
    client: Arc<dyn ModelClient>,
    model: String,
}

const SUMMARY_SNIPPET_WORDS: usize = 60;

impl ArticleSelector {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// `n == 0` disables the stage; the entries pass through untouched.
    pub async fn select(&self, entries: Vec<Entry>, n: usize) -> Vec<Entry> {
        if n == 0 || entries.len() <= n {
            return entries;
        }

        let prompt = build_prompt(&entries, n);
        match self.client.complete(&self.model, ModelRequest::text(prompt)).await {
            Ok(response) => match parse_selection(&response, entries.len(), n) {
                Some(picked) => {
                    info!(total = entries.len(), picked = picked.len(), "selector chose subset");
                    entries
                        .into_iter()
                        .enumerate()
                        .filter(|(i, _)| picked.contains(i))
                        .map(|(_, e)| e)
                        .collect()
                }
                None => {
                    warn!("selector response unparseable, falling back to recency");
                    fallback_by_recency(entries, n)
                }
            },
            Err(e) => {
                warn!(error = %e, "selector call failed, falling back to recency");
                fallback_by_recency(entries, n)
            }
        }
    }
}

fn build_prompt(entries: &[Entry], n: usize) -> String {
    let mut lines = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let snippet: String = entry
            .summary
            .split_whitespace()
            .take(SUMMARY_SNIPPET_WORDS)
            .collect::<Vec<_>>()
            .join(" ");
        lines.push_str(&format!("{i}. [{}] {} — {}\n", entry.feed_name, entry.title, snippet));
    }
    format!(
        "You are selecting articles for a daily digest. From the numbered \
         list below, pick the {n} most newsworthy and substantive items. \
         Respond with a JSON array of the chosen item numbers, nothing else.\n\n{lines}"
    )
}

/// Accepts a JSON array of indices; rejects anything out of range rather
/// than silently guessing.
fn parse_selection(response: &str, len: usize, n: usize) -> Option<BTreeSet<usize>> {
    let value = extract_json(response)?;
    let array = value.as_array()?;
    let mut picked = BTreeSet::new();
    for item in array {
        let idx = item.as_u64()? as usize;
        if idx >= len {
            debug!(idx, len, "selector index out of range");
            return None;
        }
        picked.insert(idx);
    }
    if picked.is_empty() {
        return None;
    }
    // Keep at most N even if the model over-delivered.
    while picked.len() > n {
        let last = *picked.iter().next_back()?;
        picked.remove(&last);
    }
    Some(picked)
}

/// Deterministic fallback: most recently published first. The sort is
/// stable, so entries sharing a timestamp keep their feed order.
fn fallback_by_recency(mut entries: Vec<Entry>, n: usize) -> Vec<Entry> {
    entries.sort_by_key(|e| std::cmp::Reverse(e.published));
    entries.truncate(n);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentKind, ExtractionStatus, PipelineError, Result};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    struct CannedModel(Option<&'static str>);

    #[async_trait]
    impl ModelClient for CannedModel {
        async fn complete(&self, _model: &str, _request: ModelRequest) -> Result<String> {
            match self.0 {
                Some(s) => Ok(s.to_string()),
                None => Err(PipelineError::Model("canned failure".to_string())),
            }
        }
    }

    fn entries(count: usize) -> Vec<Entry> {
        let now = Utc::now();
        (0..count)
            .map(|n| Entry {
                id: Uuid::from_u128(n as u128),
                title: format!("title {n}"),
                feed_name: "feed".to_string(),
                link: format!("https://example.com/{n}"),
                // Feed order is newest-first.
                published: now - Duration::hours(n as i64),
                published_uncertain: false,
                summary: format!("summary {n}"),
                content: None,
                raw_content: None,
                content_kind: ContentKind::Text,
                extraction: ExtractionStatus::Pending,
            })
            .collect()
    }

    #[tokio::test]
    async fn zero_n_skips_the_stage() {
        let selector = ArticleSelector::new(Arc::new(CannedModel(None)), "m");
        let picked = selector.select(entries(4), 0).await;
        assert_eq!(picked.len(), 4);
    }

    #[tokio::test]
    async fn model_selection_is_honored_in_feed_order() {
        let selector = ArticleSelector::new(Arc::new(CannedModel(Some("[3, 1]"))), "m");
        let picked = selector.select(entries(5), 2).await;
        let ids: Vec<u128> = picked.iter().map(|e| e.id.as_u128()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn unparseable_response_falls_back_to_recency() {
        let selector =
            ArticleSelector::new(Arc::new(CannedModel(Some("the first two look great"))), "m");
        let picked = selector.select(entries(5), 2).await;
        let ids: Vec<u128> = picked.iter().map(|e| e.id.as_u128()).collect();
        // Newest-first fallback keeps entries 0 and 1.
        assert_eq!(ids, vec![0, 1]);
    }

    #[tokio::test]
    async fn call_failure_falls_back_to_recency() {
        let selector = ArticleSelector::new(Arc::new(CannedModel(None)), "m");
        let picked = selector.select(entries(4), 3).await;
        assert_eq!(picked.len(), 3);
    }

    #[tokio::test]
    async fn out_of_range_index_triggers_fallback() {
        let selector = ArticleSelector::new(Arc::new(CannedModel(Some("[0, 99]"))), "m");
        let picked = selector.select(entries(4), 2).await;
        assert_eq!(picked.len(), 2);
        let ids: Vec<u128> = picked.iter().map(|e| e.id.as_u128()).collect();
        assert_eq!(ids, vec![0, 1]);
    }
}
