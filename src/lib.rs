pub mod admission;
pub mod config;
pub mod extractor;
pub mod fetcher;
pub mod history;
pub mod llm;
pub mod pipeline;
pub mod relevance;
pub mod render;
pub mod selector;
pub mod types;

pub use admission::AdmissionFilter;
pub use config::{CollectionConfig, FeedConfig, FeedSettings, LlmSettings, MaxAge};
pub use extractor::ContentExtractor;
pub use fetcher::FeedFetcher;
pub use history::{HistoryRecord, HistoryStore};
pub use llm::{HttpModelClient, ModelClient, ModelRequest};
pub use pipeline::{CollectionRun, Pipeline};
pub use relevance::RelevanceFilter;
pub use render::{ChromiumRenderer, PageRenderer};
pub use selector::ArticleSelector;
pub use types::*;
