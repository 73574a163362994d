use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single feed item moving through the pipeline. Created at feed-parse
/// time and progressively enriched by the extraction and filter stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Deterministic identifier derived from the canonicalized link.
    /// Stable across runs, so a failed run naturally retries the entry.
    pub id: Uuid,
    pub title: String,
    pub feed_name: String,
    pub link: String,
    pub published: DateTime<Utc>,
    /// Set when no publish date could be parsed and fetch time was used.
    pub published_uncertain: bool,
    /// Summary text as supplied by the feed (may be empty).
    pub summary: String,
    /// Extracted readable text, once an extraction tier has produced it.
    pub content: Option<String>,
    /// Raw bytes for binary documents (PDF); text extraction is skipped.
    pub raw_content: Option<Vec<u8>>,
    pub content_kind: ContentKind,
    pub extraction: ExtractionStatus,
}

impl Entry {
    /// Best available text for prompts and downstream output.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or(&self.summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Pdf,
}

/// Which extraction tier produced the entry's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Extraction has not run yet.
    Pending,
    /// Feed-supplied summary was long enough; no network call made.
    FeedSummary,
    /// Lightweight static fetch succeeded.
    Static,
    /// Headless rendered fetch succeeded.
    Rendered,
    /// Binary document captured as raw bytes.
    Binary,
    /// Every network tier failed; fell back to the feed summary.
    SummaryFallback,
    /// No tier produced content and the feed supplied none.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Success,
    /// Fetch succeeded after at least one retry, or some entries were
    /// dropped for parse reasons.
    Partial,
    Failed,
}

/// Per-feed outcome, aggregated into the run's [`FetchReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedOutcome {
    pub feed_name: String,
    pub status: FeedStatus,
    /// Entries found in the parsed feed document.
    pub found: usize,
    /// Entries surviving the admission filter.
    pub admitted: usize,
    pub retries: u32,
    pub error: Option<String>,
}

/// Aggregate report for one collection run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchReport {
    pub collection: String,
    pub feeds: Vec<FeedOutcome>,
    pub admitted: usize,
    pub extracted: usize,
    /// Entries removed by the relevance filter.
    pub filtered_out: usize,
}

impl FetchReport {
    pub fn outcome_for(&self, feed_name: &str) -> Option<&FeedOutcome> {
        self.feeds.iter().find(|o| o.feed_name == feed_name)
    }
}

/// Where a relevance decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOrigin {
    /// Parsed from a model response (possibly after the strict retry).
    Model,
    /// No filter configured for this entry's feed.
    Fallback,
    /// Model output was unusable; defaulted to exclusion.
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDecision {
    pub include: bool,
    pub origin: DecisionOrigin,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Model call failed: {0}")]
    Model(String),

    #[error("Rendered fetch failed: {0}")]
    Render(String),

    #[error("History commit failed for collection '{collection}': {reason}")]
    Commit { collection: String, reason: String },

    #[error("Downstream stage failed: {0}")]
    Downstream(String),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
