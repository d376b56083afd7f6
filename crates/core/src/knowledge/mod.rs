//! Knowledge-similarity lookup abstraction
//!
//! The storage and embedding search service is an external collaborator.
//! Grounding only needs `search(text, limit)`; this module provides:
//! - An HTTP client for the indexing service search API
//! - An in-memory store for offline use and tests

use crate::config::KnowledgeConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A single similarity match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeMatch {
    pub id: String,
    pub score: f64,
}

/// Trait for knowledge-similarity lookup
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Find up to `limit` indexed items similar to `text`
    async fn search(&self, text: &str, limit: usize) -> Result<Vec<KnowledgeMatch>>;
}

/// Client for the indexing service's hybrid search endpoint
pub struct SearchServiceClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    options: SearchOptions<'a>,
}

#[derive(Serialize)]
struct SearchOptions<'a> {
    mode: &'a str,
    limit: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<SearchResultItem>,
}

#[derive(Deserialize)]
struct SearchResultItem {
    chunk_id: String,
    score: f64,
}

impl SearchServiceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl KnowledgeBase for SearchServiceClient {
    async fn search(&self, text: &str, limit: usize) -> Result<Vec<KnowledgeMatch>> {
        let url = format!("{}/v2/search", self.base_url.trim_end_matches('/'));

        let request = SearchRequest {
            query: text,
            options: SearchOptions {
                mode: "hybrid",
                limit,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::KnowledgeLookup {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::KnowledgeLookup {
                message: format!("Search error {}: {}", status, body),
            });
        }

        let result: SearchResponse = response.json().await.map_err(|e| {
            AppError::KnowledgeLookup {
                message: format!("Failed to parse response: {}", e),
            }
        })?;

        Ok(result
            .results
            .into_iter()
            .take(limit)
            .map(|r| KnowledgeMatch {
                id: r.chunk_id,
                score: r.score,
            })
            .collect())
    }
}

/// In-memory knowledge store with token-overlap scoring
#[derive(Default)]
pub struct InMemoryKnowledgeBase {
    entries: RwLock<Vec<(String, String)>>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `text` under `id`
    pub async fn insert(&self, id: impl Into<String>, text: impl Into<String>) {
        self.entries.write().await.push((id.into(), text.into().to_lowercase()));
    }

    fn score(query: &str, text: &str) -> f64 {
        let query_terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        if query_terms.is_empty() {
            return 0.0;
        }

        let hits = query_terms
            .iter()
            .filter(|t| text.split_whitespace().any(|w| w == t.as_str()))
            .count();

        hits as f64 / query_terms.len() as f64
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn search(&self, text: &str, limit: usize) -> Result<Vec<KnowledgeMatch>> {
        let entries = self.entries.read().await;

        let mut matches: Vec<KnowledgeMatch> = entries
            .iter()
            .map(|(id, body)| KnowledgeMatch {
                id: id.clone(),
                score: Self::score(text, body),
            })
            .filter(|m| m.score > 0.0)
            .collect();

        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(limit);
        Ok(matches)
    }
}

/// Create a knowledge base based on configuration
pub fn create_knowledge_base(config: &KnowledgeConfig) -> Result<Arc<dyn KnowledgeBase>> {
    match &config.search_url {
        Some(url) => Ok(Arc::new(SearchServiceClient::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => {
            tracing::warn!("No search service configured, knowledge lookups will find nothing");
            Ok(Arc::new(InMemoryKnowledgeBase::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_in_memory_ranking() {
        let kb = InMemoryKnowledgeBase::new();
        kb.insert("doc:parse", "parse function reference").await;
        kb.insert("doc:safety", "function safety guide").await;
        kb.insert("doc:other", "unrelated page").await;

        let matches = kb.search("function safety", 5).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "doc:safety");
        assert_eq!(matches[0].score, 1.0);
        assert_eq!(matches[1].score, 0.5);
    }

    #[tokio::test]
    async fn test_in_memory_respects_limit() {
        let kb = InMemoryKnowledgeBase::new();
        kb.insert("a", "function").await;
        kb.insert("b", "function").await;

        let matches = kb.search("function", 1).await.unwrap();
        assert_eq!(matches, vec![KnowledgeMatch { id: "a".into(), score: 1.0 }]);
    }

    #[tokio::test]
    async fn test_search_service_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/search"))
            .and(body_partial_json(json!({ "query": "function", "options": { "limit": 2 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query": "function",
                "mode": "hybrid",
                "total_results": 1,
                "results": [{
                    "chunk_id": "9f1c2f7e-2d0c-4a52-9b1e-1f0a3c9d7e11",
                    "paper_id": "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
                    "paper_title": "Function reference",
                    "content": "...",
                    "chunk_index": 0,
                    "score": 0.82
                }],
                "processing_time_ms": 4
            })))
            .mount(&server)
            .await;

        let client = SearchServiceClient::new(server.uri(), Duration::from_secs(2)).unwrap();
        let matches = client.search("function", 2).await.unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "9f1c2f7e-2d0c-4a52-9b1e-1f0a3c9d7e11");
        assert_eq!(matches[0].score, 0.82);
    }

    #[tokio::test]
    async fn test_search_service_error_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = SearchServiceClient::new(server.uri(), Duration::from_secs(2)).unwrap();
        let err = client.search("function", 2).await.unwrap_err();
        assert!(matches!(err, AppError::KnowledgeLookup { .. }));
    }
}
