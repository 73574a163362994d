use crate::types::{PipelineError, Result};
use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Resolved configuration for one collection. The pipeline treats this as
/// immutable input; loading and merging happen before any stage runs.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub defaults: FeedSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    pub feeds: Vec<FeedConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    // Per-feed overrides; anything unset falls back to collection defaults.
    pub max_articles: Option<usize>,
    pub max_age: Option<MaxAge>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub follow_article_links: Option<bool>,
    pub link_filter_pattern: Option<String>,
    pub filter_query: Option<String>,
}

/// Effective per-feed settings after layering feed overrides on top of
/// collection defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Cap on admitted entries per feed; 0 = unlimited.
    pub max_articles: usize,
    pub max_age: Option<MaxAge>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_initial_secs: u64,
    pub follow_article_links: bool,
    pub link_filter_pattern: Option<String>,
    pub filter_query: Option<String>,
    /// Target size N for the article selector; 0 disables the stage.
    pub selection_count: usize,
    /// K words per entry summary, forwarded to downstream prompts.
    pub words_per_summary: usize,
    /// Max concurrent content extractions per collection.
    pub extraction_concurrency: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            max_articles: 10,
            max_age: None,
            timeout_secs: 30,
            max_retries: 3,
            retry_initial_secs: 2,
            follow_article_links: false,
            link_filter_pattern: None,
            filter_query: None,
            selection_count: 0,
            words_per_summary: 150,
            extraction_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub api_url: String,
    /// Environment variable holding the API key, not the key itself.
    pub api_key_env: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Optional cheaper model for the boolean relevance filter.
    pub filter_model: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key_env: "LLM_API_KEY".to_string(),
            temperature: 0.2,
            timeout_secs: 60,
            filter_model: None,
        }
    }
}

/// Age-window policy for admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaxAge {
    /// Absolute window, e.g. "2d", "36h", "90m".
    Window(Duration),
    /// Everything published after the collection's last digest.
    SinceLastDigest,
}

impl<'de> Deserialize<'de> for MaxAge {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_max_age(&s).map_err(serde::de::Error::custom)
    }
}

fn parse_max_age(s: &str) -> std::result::Result<MaxAge, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("since_last_digest") {
        return Ok(MaxAge::SinceLastDigest);
    }
    parse_duration(s).map(MaxAge::Window)
}

/// Parses short duration strings: "2d", "36h", "90m", "45s".
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.len() < 2 {
        return Err(format!("invalid duration '{s}'"));
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let value: i64 = num
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    match unit {
        "d" => Ok(Duration::days(value)),
        "h" => Ok(Duration::hours(value)),
        "m" => Ok(Duration::minutes(value)),
        "s" => Ok(Duration::seconds(value)),
        _ => Err(format!("invalid duration unit in '{s}'")),
    }
}

impl CollectionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: CollectionConfig = toml::from_str(&raw)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        if config.feeds.is_empty() {
            return Err(PipelineError::Config(format!(
                "{}: collection '{}' has no feeds",
                path.display(),
                config.name
            )));
        }
        Ok(config)
    }

    /// Effective settings for one feed: per-feed overrides layered on the
    /// collection defaults.
    pub fn settings_for(&self, feed: &FeedConfig) -> FeedSettings {
        let mut s = self.defaults.clone();
        if let Some(v) = feed.max_articles {
            s.max_articles = v;
        }
        if let Some(v) = &feed.max_age {
            s.max_age = Some(v.clone());
        }
        if let Some(v) = feed.timeout_secs {
            s.timeout_secs = v;
        }
        if let Some(v) = feed.max_retries {
            s.max_retries = v;
        }
        if let Some(v) = feed.follow_article_links {
            s.follow_article_links = v;
        }
        if let Some(v) = &feed.link_filter_pattern {
            s.link_filter_pattern = Some(v.clone());
        }
        // Feed-level filter query overrides the collection-level one.
        if let Some(v) = &feed.filter_query {
            s.filter_query = Some(v.clone());
        }
        s
    }
}
