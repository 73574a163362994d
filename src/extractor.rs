use crate::config::FeedSettings;
use crate::fetcher::FeedFetcher;
use crate::render::PageRenderer;
use crate::types::{ContentKind, Entry, ExtractionStatus, Result};
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Feed summaries at or above this word count are used as-is, without any
/// network call.
const SUMMARY_WORD_THRESHOLD: usize = 400;

/// Static extraction shorter than this escalates to the rendered tier.
const MIN_CONTENT_CHARS: usize = 150;

/// Cap on followed links per entry.
const MAX_FOLLOWED_LINKS: usize = 5;

/// Tiered content extraction: feed summary → static fetch → rendered
/// fetch → summary fallback, with binary (PDF) capture short-circuiting
/// the text path. An entry only ends up without content when the feed
/// itself supplied none and every network tier failed.
pub struct ContentExtractor {
    fetcher: Arc<FeedFetcher>,
    renderer: Option<Arc<dyn PageRenderer>>,
}

enum StrategyOutcome {
    Done(Extracted),
    Continue,
}

enum Extracted {
    Text {
        text: String,
        status: ExtractionStatus,
    },
    Binary(Vec<u8>),
}

impl ContentExtractor {
    pub fn new(fetcher: Arc<FeedFetcher>, renderer: Option<Arc<dyn PageRenderer>>) -> Self {
        Self { fetcher, renderer }
    }

    /// Runs the tier list for one entry and mutates it in place. Never
    /// fails the entry outright: the last tier is the feed summary.
    pub async fn extract(&self, entry: &mut Entry, settings: &FeedSettings) {
        let outcome = self.run_tiers(&entry.link, &entry.summary, settings).await;

        match outcome {
            Extracted::Binary(bytes) => {
                debug!(link = %entry.link, bytes = bytes.len(), "captured binary document");
                entry.raw_content = Some(bytes);
                entry.content_kind = ContentKind::Pdf;
                entry.extraction = ExtractionStatus::Binary;
                // No text to scan; link following does not apply.
                return;
            }
            Extracted::Text { text, status } => {
                if status == ExtractionStatus::Failed {
                    entry.extraction = ExtractionStatus::Failed;
                    return;
                }
                entry.content = Some(text);
                entry.extraction = status;
            }
        }

        if settings.follow_article_links {
            self.follow_links(entry, settings).await;
        }
    }

    async fn run_tiers(&self, link: &str, summary: &str, settings: &FeedSettings) -> Extracted {
        // Tier 1: a long feed summary needs no network at all.
        if let StrategyOutcome::Done(done) = summary_strategy(summary) {
            return done;
        }
        // Tier 2: lightweight static fetch.
        match self.static_strategy(link, settings).await {
            Ok(StrategyOutcome::Done(done)) => return done,
            Ok(StrategyOutcome::Continue) => {}
            Err(e) => debug!(%link, error = %e, "static fetch failed"),
        }
        // Tier 3: rendered fetch, when a renderer is available.
        match self.rendered_strategy(link).await {
            Ok(StrategyOutcome::Done(done)) => return done,
            Ok(StrategyOutcome::Continue) => {}
            Err(e) => warn!(%link, error = %e, "rendered fetch failed"),
        }
        // Final fallback: whatever the feed gave us.
        if summary.trim().is_empty() {
            Extracted::Text {
                text: String::new(),
                status: ExtractionStatus::Failed,
            }
        } else {
            Extracted::Text {
                text: summary.to_string(),
                status: ExtractionStatus::SummaryFallback,
            }
        }
    }

    async fn static_strategy(
        &self,
        link: &str,
        settings: &FeedSettings,
    ) -> Result<StrategyOutcome> {
        self.fetcher.politeness_delay(link).await;

        let response = self
            .fetcher
            .client()
            .get(link)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .send()
            .await?;
        if !response.status().is_success() {
            debug!(%link, status = %response.status(), "static fetch non-success");
            return Ok(StrategyOutcome::Continue);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let bytes = response.bytes().await?;

        if is_pdf(&content_type, &bytes) {
            return Ok(StrategyOutcome::Done(Extracted::Binary(bytes.to_vec())));
        }

        let html = String::from_utf8_lossy(&bytes);
        let text = extract_main_content(&html);
        if text.len() >= MIN_CONTENT_CHARS {
            Ok(StrategyOutcome::Done(Extracted::Text {
                text,
                status: ExtractionStatus::Static,
            }))
        } else {
            debug!(%link, chars = text.len(), "static extraction too short, escalating");
            Ok(StrategyOutcome::Continue)
        }
    }

    async fn rendered_strategy(&self, link: &str) -> Result<StrategyOutcome> {
        let Some(renderer) = &self.renderer else {
            return Ok(StrategyOutcome::Continue);
        };
        let html = renderer.render(link).await?;
        let text = extract_main_content(&html);
        if text.len() >= MIN_CONTENT_CHARS {
            Ok(StrategyOutcome::Done(Extracted::Text {
                text,
                status: ExtractionStatus::Rendered,
            }))
        } else {
            Ok(StrategyOutcome::Continue)
        }
    }

    /// Depth-1 link expansion: scan the extracted text for embedded URLs
    /// (optionally filtered by the feed's pattern), fetch each once
    /// through the network tiers, and append the extracted text. Turns
    /// "alert" feeds whose items are link lists into full articles.
    async fn follow_links(&self, entry: &mut Entry, settings: &FeedSettings) {
        let Some(content) = entry.content.clone() else {
            return;
        };
        // The feed summary kept its anchor hrefs through html_to_text.
        let links = scan_links(
            &content,
            &entry.link,
            settings.link_filter_pattern.as_deref(),
        );
        if links.is_empty() {
            return;
        }
        debug!(link = %entry.link, count = links.len(), "following embedded links");

        let mut merged = content;
        for followed in links {
            match self.run_tiers(&followed, "", settings).await {
                Extracted::Text { text, status } if status != ExtractionStatus::Failed => {
                    merged.push_str("\n\n");
                    merged.push_str(&text);
                }
                Extracted::Binary(_) => {
                    debug!(link = %followed, "followed link is binary, skipping");
                }
                _ => debug!(link = %followed, "followed link produced no content"),
            }
        }
        entry.content = Some(merged);
    }
}

fn summary_strategy(summary: &str) -> StrategyOutcome {
    if summary.split_whitespace().count() >= SUMMARY_WORD_THRESHOLD {
        StrategyOutcome::Done(Extracted::Text {
            text: summary.to_string(),
            status: ExtractionStatus::FeedSummary,
        })
    } else {
        StrategyOutcome::Continue
    }
}

fn is_pdf(content_type: &str, bytes: &[u8]) -> bool {
    content_type.contains("application/pdf") || bytes.starts_with(b"%PDF-")
}

/// Strips boilerplate and keeps the main article text: paragraphs under
/// `article`/`main`/`[role=main]` when present, all paragraphs otherwise.
pub fn extract_main_content(html: &str) -> String {
    let document = Html::parse_document(html);
    let main_selector =
        Selector::parse("article p, main p, [role=\"main\"] p").expect("static selector");
    let any_p = Selector::parse("p").expect("static selector");

    let mut paragraphs: Vec<String> = document
        .select(&main_selector)
        .map(|p| normalize_whitespace(&p.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .collect();
    if paragraphs.is_empty() {
        paragraphs = document
            .select(&any_p)
            .map(|p| normalize_whitespace(&p.text().collect::<String>()))
            .filter(|t| !t.is_empty())
            .collect();
    }
    paragraphs.join("\n\n")
}

/// Flattens an HTML fragment (feed summaries are usually HTML) to plain
/// text, keeping anchor targets so link following can find them.
pub fn html_to_text(html: &str) -> String {
    if !html.contains('<') {
        return normalize_whitespace(html);
    }
    let fragment = Html::parse_fragment(html);
    let anchors = Selector::parse("a[href]").expect("static selector");

    let mut text = normalize_whitespace(&fragment.root_element().text().collect::<String>());
    for a in fragment.select(&anchors) {
        if let Some(href) = a.value().attr("href") {
            if href.starts_with("http") && !text.contains(href) {
                text.push(' ');
                text.push_str(href);
            }
        }
    }
    text
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Embedded http(s) URLs in document order, deduplicated, excluding the
/// entry's own link, optionally narrowed by a configured pattern.
fn scan_links(text: &str, own_link: &str, pattern: Option<&str>) -> Vec<String> {
    let url_re = Regex::new(r#"https?://[^\s"'<>\)\]]+"#).expect("static regex");
    let filter = pattern.and_then(|p| match Regex::new(p) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = p, error = %e, "bad link filter pattern, ignoring links");
            None
        }
    });
    if pattern.is_some() && filter.is_none() {
        return Vec::new();
    }

    let own = crate::fetcher::canonicalize_link(own_link).unwrap_or_else(|_| own_link.to_string());
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for m in url_re.find_iter(text) {
        let raw = m.as_str().trim_end_matches(['.', ',', ';']);
        let canonical = match crate::fetcher::canonicalize_link(raw) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if canonical == own || !seen.insert(canonical.clone()) {
            continue;
        }
        if let Some(re) = &filter {
            if !re.is_match(raw) {
                continue;
            }
        }
        links.push(raw.to_string());
        if links.len() >= MAX_FOLLOWED_LINKS {
            break;
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_content_prefers_article_over_boilerplate() {
        let html = r#"
            <html><body>
              <nav><p>Home | About | Subscribe</p></nav>
              <article>
                <p>First real paragraph of the story.</p>
                <p>Second paragraph with more detail.</p>
              </article>
              <footer><p>Copyright</p></footer>
            </body></html>"#;
        let text = extract_main_content(html);
        assert!(text.contains("First real paragraph"));
        assert!(text.contains("Second paragraph"));
        assert!(!text.contains("Subscribe"));
        assert!(!text.contains("Copyright"));
    }

    #[test]
    fn falls_back_to_all_paragraphs_without_article_tag() {
        let html = "<div><p>Plain page paragraph.</p></div>";
        assert_eq!(extract_main_content(html), "Plain page paragraph.");
    }

    #[test]
    fn html_to_text_keeps_anchor_targets() {
        let text = html_to_text(
            "<p>Security alert: see <a href=\"https://example.com/advisory\">the advisory</a></p>",
        );
        assert!(text.starts_with("Security alert"));
        assert!(text.contains("https://example.com/advisory"));
    }

    #[test]
    fn pdf_detection_by_type_and_magic() {
        assert!(is_pdf("application/pdf", b""));
        assert!(is_pdf("application/octet-stream", b"%PDF-1.7 rest"));
        assert!(!is_pdf("text/html", b"<html>"));
    }

    #[test]
    fn summary_threshold_short_circuits() {
        let long = "word ".repeat(SUMMARY_WORD_THRESHOLD);
        assert!(matches!(
            summary_strategy(&long),
            StrategyOutcome::Done(Extracted::Text {
                status: ExtractionStatus::FeedSummary,
                ..
            })
        ));
        assert!(matches!(
            summary_strategy("too short"),
            StrategyOutcome::Continue
        ));
    }

    #[test]
    fn scan_links_dedupes_and_filters() {
        let text = "See https://example.com/a and https://example.com/a again, \
                    plus https://other.org/b and https://example.com/self";
        let links = scan_links(text, "https://example.com/self", None);
        assert_eq!(
            links,
            vec!["https://example.com/a".to_string(), "https://other.org/b".to_string()]
        );

        let filtered = scan_links(text, "https://example.com/self", Some("other\\.org"));
        assert_eq!(filtered, vec!["https://other.org/b".to_string()]);
    }
}
