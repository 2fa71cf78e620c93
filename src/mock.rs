//! Mock response engine. Loads an ordered regex ruleset once at
//! construction and short-circuits matching requests with a synthesized
//! HTTP/1.1 response. Grounded in
//! `original_source/proxy_tool/mock_engine.py`.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProxyResult;

#[derive(Debug, Deserialize)]
struct RawRule {
    pattern: String,
    response: RawResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

fn default_status() -> u16 {
    200
}

struct Rule {
    pattern: Regex,
    response: RawResponse,
}

/// Immutable after load; safe to share across handlers without
/// synchronization.
pub struct MockEngine {
    rules: Vec<Rule>,
}

impl MockEngine {
    /// An engine with no rules; every `match_url` call returns `None`.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Loads rules from a JSON file. A missing file is not an error — it
    /// produces an empty ruleset, matching `mock_engine.py`'s
    /// load-if-exists behavior.
    pub async fn load(path: &Path) -> ProxyResult<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Self::empty());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&raw)
    }

    fn from_json_str(raw: &str) -> ProxyResult<Self> {
        let parsed: Vec<RawRule> = serde_json::from_str(raw)
            .map_err(|e| crate::error::ProxyError::MockLoadFailed(e.to_string()))?;
        let mut rules = Vec::with_capacity(parsed.len());
        for rule in parsed {
            let pattern = Regex::new(&rule.pattern)
                .map_err(|e| crate::error::ProxyError::MockLoadFailed(e.to_string()))?;
            rules.push(Rule {
                pattern,
                response: rule.response,
            });
        }
        Ok(Self { rules })
    }

    /// First rule (in load order) whose pattern searches (not anchors-match)
    /// `url`. Returning `None` is non-terminal — the caller proceeds as if
    /// no mock engine were configured.
    pub fn match_url(&self, url: &str) -> Option<&RawResponse> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(url))
            .map(|rule| &rule.response)
    }

    /// Renders `response` as raw HTTP/1.1 bytes. The reason phrase is
    /// always the literal `OK` regardless of status code — a known defect
    /// carried over unchanged from the source behavior.
    pub fn render(response: &RawResponse) -> Vec<u8> {
        let mut headers = response.headers.clone();
        let body = match &response.body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => {
                if !headers.contains_key("Content-Type") {
                    headers.insert("Content-Type".to_string(), "application/json".to_string());
                }
                other.to_string()
            }
        };

        let mut out = format!("HTTP/1.1 {} OK\r\n", response.status);
        for (k, v) in &headers {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&body);
        out.into_bytes()
    }
}
