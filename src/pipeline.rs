use crate::admission::AdmissionFilter;
use crate::config::{CollectionConfig, FeedSettings};
use crate::extractor::ContentExtractor;
use crate::fetcher::FeedFetcher;
use crate::history::HistoryStore;
use crate::llm::ModelClient;
use crate::relevance::RelevanceFilter;
use crate::render::PageRenderer;
use crate::selector::ArticleSelector;
use crate::types::{
    DecisionOrigin, Entry, ExtractionStatus, FetchReport, PipelineError, Result,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Concurrent feed fetches per collection.
const FEED_CONCURRENCY: usize = 4;

/// Everything one collection run produced, held until the caller decides
/// whether to commit. History is untouched until [`Pipeline::commit`].
#[derive(Debug)]
pub struct CollectionRun {
    pub entries: Vec<Entry>,
    pub report: FetchReport,
    /// Identifiers to record as processed on commit.
    pub staged: BTreeSet<Uuid>,
    pub started_at: DateTime<Utc>,
}

/// Sequences one collection through fetch → admission → selection →
/// extraction → relevance, and commits history only on full success.
/// Collections are independent: a failure here never touches siblings.
pub struct Pipeline {
    fetcher: Arc<FeedFetcher>,
    extractor: ContentExtractor,
    model: Arc<dyn ModelClient>,
    history: HistoryStore,
}

impl Pipeline {
    pub fn new(
        history: HistoryStore,
        model: Arc<dyn ModelClient>,
        renderer: Option<Arc<dyn PageRenderer>>,
    ) -> Self {
        let fetcher = Arc::new(FeedFetcher::new());
        let extractor = ContentExtractor::new(fetcher.clone(), renderer);
        Self {
            fetcher,
            extractor,
            model,
            history,
        }
    }

    /// Runs every stage for one collection without committing. Feed
    /// failures are folded into the report; only collection-level
    /// problems (history unreadable) surface as errors.
    pub async fn run_collection(&self, config: &CollectionConfig) -> Result<CollectionRun> {
        let started_at = Utc::now();
        let history = self.history.load(&config.name).await?;
        info!(
            collection = %config.name,
            feeds = config.feeds.len(),
            known = history.processed.len(),
            "starting collection run"
        );

        // Fetch all feeds concurrently; admission runs per feed as each
        // fetch completes. Indexed so the report keeps config order.
        let mut fetched: Vec<(usize, Vec<Entry>, crate::types::FeedOutcome)> =
            stream::iter(config.feeds.iter().enumerate())
                .map(|(idx, feed)| {
                    let settings = config.settings_for(feed);
                    let fetcher = self.fetcher.clone();
                    let history = &history;
                    async move {
                        let (entries, mut outcome) = fetcher.fetch_feed(feed, &settings).await;
                        let admitted =
                            AdmissionFilter::admit(entries, history, &settings, started_at);
                        outcome.admitted = admitted.len();
                        (idx, admitted, outcome)
                    }
                })
                .buffer_unordered(FEED_CONCURRENCY)
                .collect()
                .await;
        fetched.sort_by_key(|(idx, _, _)| *idx);

        let mut report = FetchReport {
            collection: config.name.clone(),
            ..Default::default()
        };
        let mut entries = Vec::new();
        for (_, admitted, outcome) in fetched {
            report.admitted += outcome.admitted;
            report.feeds.push(outcome);
            entries.extend(admitted);
        }
        debug!(collection = %config.name, admitted = entries.len(), "admission complete");

        // Optional selection cap, before any extraction cost is paid.
        let n = config.defaults.selection_count;
        if n > 0 {
            let selector = ArticleSelector::new(self.model.clone(), config.llm.model.clone());
            entries = selector.select(entries, n).await;
        }

        // Extraction, bounded fan-out; `buffered` keeps entry order.
        let settings_by_feed: HashMap<String, FeedSettings> = config
            .feeds
            .iter()
            .map(|f| (f.name.clone(), config.settings_for(f)))
            .collect();
        let mut entries: Vec<Entry> = stream::iter(entries)
            .map(|mut entry| {
                let settings = settings_by_feed
                    .get(&entry.feed_name)
                    .cloned()
                    .unwrap_or_default();
                let extractor = &self.extractor;
                async move {
                    extractor.extract(&mut entry, &settings).await;
                    entry
                }
            })
            .buffered(config.defaults.extraction_concurrency.max(1))
            .collect()
            .await;

        // Entries with no usable content at all are dropped; link-derived
        // identifiers mean the next run retries them.
        entries.retain(|entry| {
            if entry.extraction == ExtractionStatus::Failed {
                warn!(link = %entry.link, "no content from any tier, dropping entry");
                false
            } else {
                true
            }
        });
        report.extracted = entries.len();

        // Optional relevance filter. Fail-closed exclusions are not
        // staged, so a model outage does not permanently bury an entry.
        let mut staged: BTreeSet<Uuid> = BTreeSet::new();
        let filter_model = config
            .llm
            .filter_model
            .clone()
            .unwrap_or_else(|| config.llm.model.clone());
        let filter = RelevanceFilter::new(self.model.clone(), filter_model);

        let mut surviving = Vec::with_capacity(entries.len());
        for entry in entries {
            let settings = settings_by_feed
                .get(&entry.feed_name)
                .cloned()
                .unwrap_or_default();
            match settings.filter_query.as_deref() {
                None => {
                    staged.insert(entry.id);
                    surviving.push(entry);
                }
                Some(query) => {
                    let decision = filter.decide(&entry, query).await;
                    match (decision.include, decision.origin) {
                        (true, _) => {
                            staged.insert(entry.id);
                            surviving.push(entry);
                        }
                        (false, DecisionOrigin::FailClosed) => {
                            report.filtered_out += 1;
                            debug!(link = %entry.link, "excluded fail-closed, will retry next run");
                        }
                        (false, _) => {
                            // A real model decision is final; record it so
                            // the entry is not refetched every run.
                            report.filtered_out += 1;
                            staged.insert(entry.id);
                        }
                    }
                }
            }
        }

        info!(
            collection = %config.name,
            admitted = report.admitted,
            extracted = report.extracted,
            filtered_out = report.filtered_out,
            surviving = surviving.len(),
            "collection run complete"
        );

        Ok(CollectionRun {
            entries: surviving,
            report,
            staged,
            started_at,
        })
    }

    /// Records the run's staged identifiers. Call exactly once per
    /// collection, only after downstream work succeeded.
    pub async fn commit(&self, config: &CollectionConfig, run: &CollectionRun) -> Result<()> {
        self.history
            .commit(&config.name, &run.staged, Utc::now())
            .await
    }

    /// Convenience wrapper: run the pipeline, hand the surviving entries
    /// to `downstream` (summarization/output, external to this core), and
    /// commit only if it succeeds. A downstream failure blocks this
    /// collection's commit and nothing else.
    pub async fn run_and_commit<F, Fut>(
        &self,
        config: &CollectionConfig,
        downstream: F,
    ) -> Result<CollectionRun>
    where
        F: FnOnce(Vec<Entry>, FetchReport) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let run = self.run_collection(config).await?;
        downstream(run.entries.clone(), run.report.clone())
            .await
            .map_err(|e| PipelineError::Downstream(e.to_string()))?;
        self.commit(config, &run).await?;
        Ok(run)
    }
}
