use crate::config::LlmSettings;
use crate::types::{PipelineError, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// One model call: prompt text plus an optional binary attachment (used
/// for PDF entries downstream). Provider retry policy is not owned here;
/// callers decide what a failure means for their stage.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: String,
    pub attachment: Option<Attachment>,
}

impl ModelRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            attachment: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

/// Seam for everything that talks to a model. Production uses
/// [`HttpModelClient`]; tests script responses.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, model: &str, request: ModelRequest) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
pub struct HttpModelClient {
    client: reqwest::Client,
    settings: LlmSettings,
    api_key: Option<String>,
}

impl HttpModelClient {
    pub fn new(settings: LlmSettings) -> Self {
        let api_key = std::env::var(&settings.api_key_env).ok();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            client,
            settings,
            api_key,
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, model: &str, request: ModelRequest) -> Result<String> {
        let content = match &request.attachment {
            None => json!(request.prompt),
            Some(attachment) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&attachment.bytes);
                json!([
                    { "type": "text", "text": request.prompt },
                    {
                        "type": "file",
                        "file": {
                            "file_data": format!("data:{};base64,{encoded}", attachment.mime)
                        }
                    }
                ])
            }
        };

        let body = json!({
            "model": model,
            "temperature": self.settings.temperature,
            "messages": [{ "role": "user", "content": content }],
        });

        debug!(model, url = %self.settings.api_url, "model call");
        let mut req = self.client.post(&self.settings.api_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Model(format!("HTTP {status}")));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::Model("response missing message content".to_string()))
    }
}

/// Pulls the first balanced JSON object or array out of model output,
/// tolerating code fences and surrounding prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    for open in ['{', '['] {
        let close = if open == '{' { '}' } else { ']' };
        let Some(start) = trimmed.find(open) else {
            continue;
        };
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, c) in trimmed[start..].char_indices() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                c if c == open => depth += 1,
                c if c == close => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &trimmed[start..start + offset + c.len_utf8()];
                        if let Ok(value) = serde_json::from_str(candidate) {
                            return Some(value);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_json() {
        let v = extract_json(r#"{"include": true}"#).unwrap();
        assert_eq!(v["include"], true);
    }

    #[test]
    fn extracts_fenced_json() {
        let v = extract_json("Sure! Here you go:\n```json\n{\"include\": false}\n```").unwrap();
        assert_eq!(v["include"], false);
    }

    #[test]
    fn extracts_array_from_prose() {
        let v = extract_json("The best picks are [2, 0, 1] based on relevance.").unwrap();
        assert_eq!(v.as_array().unwrap().len(), 3);
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let v = extract_json(r#"note {"reason": "a } inside", "include": true} end"#).unwrap();
        assert_eq!(v["include"], true);
    }

    #[test]
    fn rejects_non_json() {
        assert!(extract_json("yes, include it").is_none());
    }
}
