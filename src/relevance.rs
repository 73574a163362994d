use crate::llm::{extract_json, ModelClient, ModelRequest};
use crate::types::{ContentKind, DecisionOrigin, Entry, FilterDecision};
use std::sync::Arc;
use tracing::{debug, warn};

/// Boolean inclusion pass against a configured query. The decision needs
/// full text, so the orchestrator runs extraction (and link merging)
/// before this stage. An unusable model answer never aborts the run: one
/// strict repair retry, then fail-closed exclusion.
pub struct RelevanceFilter {
    client: Arc<dyn ModelClient>,
    model: String,
}

impl RelevanceFilter {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub async fn decide(&self, entry: &Entry, query: &str) -> FilterDecision {
        let prompt = build_prompt(entry, query, false);
        let response = match self
            .client
            .complete(&self.model, ModelRequest::text(prompt))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(link = %entry.link, error = %e, "relevance call failed, excluding");
                return FilterDecision {
                    include: false,
                    origin: DecisionOrigin::FailClosed,
                };
            }
        };

        if let Some(include) = parse_include(&response) {
            return FilterDecision {
                include,
                origin: DecisionOrigin::Model,
            };
        }

        // Repair pass: stricter, JSON-only instruction.
        debug!(link = %entry.link, "relevance response unparseable, retrying stricter");
        let strict = build_prompt(entry, query, true);
        match self
            .client
            .complete(&self.model, ModelRequest::text(strict))
            .await
        {
            Ok(response) => match parse_include(&response) {
                Some(include) => FilterDecision {
                    include,
                    origin: DecisionOrigin::Model,
                },
                None => {
                    warn!(link = %entry.link, "relevance response still unparseable, excluding");
                    FilterDecision {
                        include: false,
                        origin: DecisionOrigin::FailClosed,
                    }
                }
            },
            Err(e) => {
                warn!(link = %entry.link, error = %e, "relevance retry failed, excluding");
                FilterDecision {
                    include: false,
                    origin: DecisionOrigin::FailClosed,
                }
            }
        }
    }
}

fn build_prompt(entry: &Entry, query: &str, strict: bool) -> String {
    // PDFs carry no extracted text at this layer; decide from the feed's
    // own description of the item.
    let body = match entry.content_kind {
        ContentKind::Pdf => &entry.summary,
        ContentKind::Text => entry.text(),
    };
    let instruction = if strict {
        "Respond with ONLY a JSON object, no prose, no code fences: \
         {\"include\": true} or {\"include\": false}."
    } else {
        "Respond with a JSON object of the form {\"include\": true} or \
         {\"include\": false}."
    };
    format!(
        "Decide whether the following article matches this filter: {query}\n\n\
         Title: {title}\n\n{body}\n\n{instruction}",
        title = entry.title,
    )
}

fn parse_include(response: &str) -> Option<bool> {
    extract_json(response)?.get("include")?.as_bool()
}
