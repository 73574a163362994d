use crate::config::{FeedConfig, FeedSettings};
use crate::types::{ContentKind, Entry, ExtractionStatus, FeedOutcome, FeedStatus};
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Minimum gap between requests to the same host.
const POLITENESS_GAP: Duration = Duration::from_secs(1);

const USER_AGENT: &str = "better-morning/0.1 (+https://github.com/better-morning)";

/// Fetches and parses one feed into candidate entries, with exponential
/// backoff on transient failures and a per-host politeness delay.
pub struct FeedFetcher {
    client: Client,
    next_allowed: Arc<Mutex<HashMap<String, Instant>>>,
}

impl FeedFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("reqwest client");
        Self {
            client,
            next_allowed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch one feed. Never returns an error: failures are folded into
    /// the [`FeedOutcome`] so one feed can't take down its siblings.
    pub async fn fetch_feed(
        &self,
        feed: &FeedConfig,
        settings: &FeedSettings,
    ) -> (Vec<Entry>, FeedOutcome) {
        debug!(feed = %feed.name, url = %feed.url, "fetching feed");

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(settings.retry_initial_secs),
            initial_interval: Duration::from_secs(settings.retry_initial_secs),
            max_interval: Duration::from_secs(settings.retry_initial_secs * 32),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut retries = 0u32;
        let mut last_error: Option<String> = None;

        for attempt in 0..=settings.max_retries {
            if attempt > 0 {
                retries = attempt;
                if let Some(delay) = backoff.next_backoff() {
                    warn!(feed = %feed.name, attempt, delay = ?delay, "retrying feed fetch");
                    tokio::time::sleep(delay).await;
                }
            }

            self.politeness_delay(&feed.url).await;

            match self.try_fetch(&feed.url, settings.timeout_secs).await {
                Ok(body) => match parse_entries(&body, &feed.name) {
                    Ok(entries) => {
                        info!(feed = %feed.name, found = entries.len(), retries, "feed fetched");
                        let outcome = FeedOutcome {
                            feed_name: feed.name.clone(),
                            status: if retries == 0 {
                                FeedStatus::Success
                            } else {
                                FeedStatus::Partial
                            },
                            found: entries.len(),
                            admitted: 0,
                            retries,
                            error: None,
                        };
                        return (entries, outcome);
                    }
                    // Malformed document: permanent, no retry.
                    Err(e) => {
                        last_error = Some(e);
                        break;
                    }
                },
                Err(FetchFailure::Permanent(e)) => {
                    last_error = Some(e);
                    break;
                }
                Err(FetchFailure::Transient(e)) => {
                    last_error = Some(e);
                }
            }
        }

        warn!(feed = %feed.name, retries, error = ?last_error, "feed fetch failed");
        (
            Vec::new(),
            FeedOutcome {
                feed_name: feed.name.clone(),
                status: FeedStatus::Failed,
                found: 0,
                admitted: 0,
                retries,
                error: last_error,
            },
        )
    }

    async fn try_fetch(&self, url: &str, timeout_secs: u64) -> std::result::Result<String, FetchFailure> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchFailure::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchFailure::Permanent(format!("HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| FetchFailure::Transient(format!("body read: {e}")))
    }

    /// Sleeps as needed to keep at least [`POLITENESS_GAP`] between
    /// requests to the same host. Shared with the content extractor.
    pub async fn politeness_delay(&self, url: &str) {
        let host = match Url::parse(url) {
            Ok(u) => u.host_str().unwrap_or("").to_string(),
            Err(_) => return,
        };

        let wait = {
            let mut map = self.next_allowed.lock().await;
            let now = Instant::now();
            // Reserve the next slot so concurrent requests queue up
            // rather than all firing at once.
            let allowed_at = map.get(&host).copied().unwrap_or(now);
            let start = allowed_at.max(now);
            map.insert(host.clone(), start + POLITENESS_GAP);
            start.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            debug!(%host, ?wait, "politeness delay");
            tokio::time::sleep(wait).await;
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl Default for FeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

enum FetchFailure {
    /// Timeout, connection error, 5xx: retried up to `max_retries`.
    Transient(String),
    /// 4xx or anything a retry can't fix.
    Permanent(String),
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchFailure {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        FetchFailure::Transient(e.to_string())
    } else {
        FetchFailure::Permanent(e.to_string())
    }
}

/// Parse a feed document into entries, preserving feed order and dropping
/// in-document duplicates by identifier.
fn parse_entries(body: &str, feed_name: &str) -> std::result::Result<Vec<Entry>, String> {
    let feed = feed_rs::parser::parse(body.as_bytes())
        .map_err(|e| format!("feed parse: {e}"))?;

    let fetched_at = Utc::now();
    let raw_dates = raw_item_dates(body, feed.entries.len());

    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for (idx, item) in feed.entries.into_iter().enumerate() {
        let Some(link) = item.links.first().map(|l| l.href.clone()) else {
            debug!(feed = feed_name, "skipping entry without link");
            continue;
        };
        let Ok(id) = entry_id(&link) else {
            debug!(feed = feed_name, %link, "skipping entry with unparseable link");
            continue;
        };
        if !seen.insert(id) {
            debug!(feed = feed_name, %link, "skipping in-feed duplicate");
            continue;
        }

        let title = item
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled".to_string());
        let summary = item
            .summary
            .map(|s| s.content)
            .or_else(|| item.content.and_then(|c| c.body))
            .map(|s| crate::extractor::html_to_text(&s))
            .unwrap_or_default();

        let raw_date = raw_dates.get(idx).copied().flatten();
        let (published, published_uncertain) = resolve_published(
            item.published.map(|d| d.with_timezone(&Utc)),
            item.updated.map(|d| d.with_timezone(&Utc)),
            raw_date,
            fetched_at,
        );

        entries.push(Entry {
            id,
            title,
            feed_name: feed_name.to_string(),
            link,
            published,
            published_uncertain,
            summary,
            content: None,
            raw_content: None,
            content_kind: ContentKind::Text,
            extraction: ExtractionStatus::Pending,
        });
    }

    Ok(entries)
}

/// published → updated → loosely parsed raw date → fetch time (uncertain).
fn resolve_published(
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    raw: Option<DateTime<Utc>>,
    fetched_at: DateTime<Utc>,
) -> (DateTime<Utc>, bool) {
    match published.or(updated).or(raw) {
        Some(ts) => (ts, false),
        None => (fetched_at, true),
    }
}

/// feed-rs drops dates it can't parse. As a second chance, pull the raw
/// `<pubDate>`/`<dc:date>` strings per item and loose-parse them. Only
/// trusted when the match count lines up with the entry count.
fn raw_item_dates(body: &str, entry_count: usize) -> Vec<Option<DateTime<Utc>>> {
    let re = Regex::new(r"<(?:pubDate|dc:date)>\s*([^<]+?)\s*</(?:pubDate|dc:date)>")
        .expect("static regex");
    let matches: Vec<&str> = re
        .captures_iter(body)
        .map(|c| c.get(1).map(|m| m.as_str()).unwrap_or(""))
        .collect();

    // RSS channels often carry one channel-level pubDate before the items.
    let item_dates: &[&str] = if matches.len() == entry_count {
        &matches
    } else if matches.len() == entry_count + 1 {
        &matches[1..]
    } else {
        return vec![None; entry_count];
    };

    item_dates.iter().map(|s| parse_date_loose(s)).collect()
}

/// Tries the date formats that show up in feeds in the wild.
pub fn parse_date_loose(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Canonical form of an entry link: lowercased scheme/host (the `url`
/// crate normalizes those), fragment stripped, trailing slash trimmed on
/// non-root paths.
pub fn canonicalize_link(link: &str) -> crate::types::Result<String> {
    let mut url = Url::parse(link.trim())?;
    url.set_fragment(None);
    let mut s = url.to_string();
    if s.ends_with('/') && url.path() != "/" {
        s.pop();
    }
    Ok(s)
}

/// Deterministic entry identifier: UUIDv5 over the canonicalized link.
/// Stable across runs, which is what makes failed runs retry naturally.
pub fn entry_id(link: &str) -> crate::types::Result<Uuid> {
    let canonical = canonicalize_link(link)?;
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_URL, canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_are_stable_and_canonical() {
        let a = entry_id("https://Example.com/news/story/#comments").unwrap();
        let b = entry_id("https://example.com/news/story/").unwrap();
        let c = entry_id("https://example.com/news/story").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);

        let other = entry_id("https://example.com/news/other").unwrap();
        assert_ne!(a, other);

        // Rerunning yields the identical identifier.
        assert_eq!(a, entry_id("https://Example.com/news/story/#comments").unwrap());
    }

    #[test]
    fn root_path_keeps_slash() {
        assert_eq!(
            canonicalize_link("https://example.com/").unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn loose_date_formats() {
        assert!(parse_date_loose("Tue, 03 Jun 2025 09:00:00 GMT").is_some());
        assert!(parse_date_loose("2025-06-03T09:00:00Z").is_some());
        assert!(parse_date_loose("2025-06-03 09:00:00").is_some());
        assert!(parse_date_loose("2025-06-03").is_some());
        assert!(parse_date_loose("next tuesday").is_none());
    }

    #[test]
    fn unparseable_date_falls_back_to_fetch_time() {
        let now = Utc::now();
        let (ts, uncertain) = resolve_published(None, None, None, now);
        assert_eq!(ts, now);
        assert!(uncertain);

        let (ts, uncertain) = resolve_published(None, None, parse_date_loose("2025-06-03"), now);
        assert!(!uncertain);
        assert_eq!(ts, parse_date_loose("2025-06-03").unwrap());
    }

    #[test]
    fn parses_rss_preserving_order_and_dropping_duplicates() {
        let body = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
              <title>Test</title>
              <item>
                <title>First</title>
                <link>https://example.com/a</link>
                <pubDate>Tue, 03 Jun 2025 09:00:00 GMT</pubDate>
                <description>alpha</description>
              </item>
              <item>
                <title>Second</title>
                <link>https://example.com/b</link>
                <pubDate>Mon, 02 Jun 2025 09:00:00 GMT</pubDate>
              </item>
              <item>
                <title>First again</title>
                <link>https://example.com/a#frag</link>
                <pubDate>Sun, 01 Jun 2025 09:00:00 GMT</pubDate>
              </item>
            </channel></rss>"#;

        let entries = parse_entries(body, "test").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "First");
        assert_eq!(entries[1].title, "Second");
        assert_eq!(entries[0].summary, "alpha");
        assert!(!entries[0].published_uncertain);
        assert_eq!(entries[0].feed_name, "test");
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        assert!(parse_entries("this is not xml at all", "bad").is_err());
    }
}
