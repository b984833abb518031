//! Web search behind `search_web`.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::obs;

pub const DEFAULT_MAX_RESULTS: usize = 5;

const DUCKDUCKGO_API: &str = "https://api.duckduckgo.com/";

/// One hit, shaped the way sandboxed code reads it: `title`, `href`, `body`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub href: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search provider returned {status}")]
    Status { status: u16 },

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, SearchError>;
}

/// The single error record returned in place of results.
pub fn error_record(err: &dyn Display) -> serde_json::Value {
    serde_json::json!({ "error": err.to_string() })
}

/// Runs a search and converts every failure into `[{"error": ...}]`.
pub async fn search_web(
    provider: Option<&dyn SearchProvider>,
    query: &str,
    max_results: usize,
) -> Vec<serde_json::Value> {
    let Some(provider) = provider else {
        return vec![error_record(&"no search provider configured")];
    };
    match provider.search(query, max_results).await {
        Ok(results) => results
            .into_iter()
            .take(max_results)
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect(),
        Err(e) => {
            obs::emit_tool_failed("search_web", &e);
            vec![error_record(&e)]
        }
    }
}

/// DuckDuckGo's keyless instant-answer API.
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    client: Client,
    endpoint: String,
}

impl Default for DuckDuckGoSearch {
    fn default() -> Self {
        Self::new(DUCKDUCKGO_API)
    }
}

impl DuckDuckGoSearch {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(concat!("rlm/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default)]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default)]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelatedTopic {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "FirstURL")]
    first_url: Option<String>,
    /// Present on category groups instead of `text`.
    #[serde(default)]
    topics: Vec<RelatedTopic>,
}

impl InstantAnswer {
    fn into_results(self, max_results: usize) -> Vec<SearchResult> {
        let mut results = Vec::new();
        if !self.abstract_text.is_empty() {
            results.push(SearchResult {
                title: self.heading.clone(),
                href: self.abstract_url,
                body: self.abstract_text,
            });
        }
        let mut stack: Vec<RelatedTopic> = self.related_topics.into_iter().rev().collect();
        while let Some(topic) = stack.pop() {
            if results.len() >= max_results {
                break;
            }
            if let (Some(text), Some(href)) = (topic.text, topic.first_url) {
                // Text reads "Title - description".
                let (title, body) = match text.split_once(" - ") {
                    Some((t, b)) => (t.to_string(), b.to_string()),
                    None => (text.clone(), text),
                };
                results.push(SearchResult { title, href, body });
            }
            stack.extend(topic.topics.into_iter().rev());
        }
        results.truncate(max_results);
        results
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, SearchError> {
        tracing::debug!(query, max_results, "duckduckgo search");
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SearchError::Status {
                status: response.status().as_u16(),
            });
        }
        let answer: InstantAnswer = response.json().await?;
        Ok(answer.into_results(max_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeSearch;

    const SAMPLE: &str = r#"{
        "Heading": "Rust",
        "AbstractText": "Rust is a systems language.",
        "AbstractURL": "https://en.wikipedia.org/wiki/Rust",
        "RelatedTopics": [
            {"Text": "Cargo - The Rust package manager", "FirstURL": "https://doc.rust-lang.org/cargo"},
            {"Name": "Tools", "Topics": [
                {"Text": "Clippy - A linter", "FirstURL": "https://github.com/rust-lang/rust-clippy"}
            ]}
        ]
    }"#;

    #[test]
    fn test_instant_answer_flattens_topics() {
        let answer: InstantAnswer = serde_json::from_str(SAMPLE).unwrap();
        let results = answer.into_results(5);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].title, "Rust");
        assert_eq!(results[1].title, "Cargo");
        assert_eq!(results[1].body, "The Rust package manager");
        assert_eq!(results[2].href, "https://github.com/rust-lang/rust-clippy");
    }

    #[test]
    fn test_instant_answer_respects_max_results() {
        let answer: InstantAnswer = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(answer.into_results(2).len(), 2);
    }

    #[tokio::test]
    async fn test_failures_become_error_record() {
        let provider = FakeSearch::failing("network down");
        let records = search_web(Some(&provider), "q", 5).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["error"], "network down");
    }

    #[tokio::test]
    async fn test_missing_provider_is_error_record() {
        let records = search_web(None, "q", 5).await;
        assert!(records[0]["error"].is_string());
    }
}
