//! Smart-routing vector index.
//!
//! Every enabled tool across every connected upstream is embedded
//! (description + name + input-schema summary) and stored in a
//! similarity-search backend. Smart scopes answer `search_tools` queries
//! from this index instead of returning the full catalog.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::settings::SmartRoutingConfig;

/// Results below this cosine similarity are dropped, unless the caller asked
/// for a single result (single-result searches always return the best match).
const SCORE_THRESHOLD: f32 = 0.25;

/// Embedding failures are logged at most once per this interval.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to reach embedding provider: {0}")]
    Connection(String),
    #[error("embedding provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected embedding response: {0}")]
    Response(String),
}

/// A tool to be indexed, keyed by its qualified name.
#[derive(Debug, Clone)]
pub struct ToolDocument {
    pub qualified_name: String,
    pub server: String,
    pub tool: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDocument {
    /// The text handed to the embedding provider.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        let mut text = format!("{}: {}", self.tool, self.description);
        if let Some(properties) = self
            .input_schema
            .get("properties")
            .and_then(serde_json::Value::as_object)
        {
            let names: Vec<&str> = properties.keys().map(String::as_str).collect();
            if !names.is_empty() {
                text.push_str("\nInput: ");
                text.push_str(&names.join(", "));
            }
        }
        text
    }
}

/// A search hit: the qualified tool plus its raw description and schema.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub qualified_name: String,
    pub server: String,
    pub tool: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub score: f32,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed each input string into a vector.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn name(&self) -> &str;
}

/// OpenAI-compatible embeddings endpoint.
pub struct OpenAiEmbeddingProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiEmbeddingProvider {
    #[must_use]
    pub fn new(http: reqwest::Client, config: &SmartRoutingConfig) -> Self {
        Self {
            http,
            api_key: config.openai_api_key.clone(),
            base_url: config.openai_api_base_url.clone(),
            model: config.openai_api_embedding_model.clone(),
        }
    }
}

#[derive(Serialize)]
struct WireEmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct WireEmbeddingResponse {
    data: Vec<WireEmbeddingData>,
}

#[derive(Deserialize)]
struct WireEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));

        tracing::debug!(model = %self.model, inputs = inputs.len(), "sending embeddings request");

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&WireEmbeddingRequest {
                input: inputs,
                model: &self.model,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let wire: WireEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Response(e.to_string()))?;

        let mut data = wire.data;
        data.sort_by_key(|d| d.index);
        if data.len() != inputs.len() {
            return Err(EmbeddingError::Response(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                data.len()
            )));
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Debug, Clone)]
struct StoredVector {
    vector: Vec<f32>,
    document: ToolDocument,
}

/// Similarity-search backend interface. The in-memory implementation is the
/// default; an external vector-capable database can sit behind the same
/// surface.
pub trait VectorStore: Send + Sync {
    fn upsert(&self, document: ToolDocument, vector: Vec<f32>);
    /// Top-k by cosine similarity, optionally restricted to a server-name
    /// allowlist.
    fn search(&self, vector: &[f32], k: usize, servers: Option<&HashSet<String>>)
    -> Vec<SearchHit>;
    fn delete(&self, qualified_name: &str);
    /// Drop every entry whose id is not in `keep`.
    fn retain(&self, keep: &HashSet<String>);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<HashMap<String, StoredVector>>,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl VectorStore for InMemoryVectorStore {
    fn upsert(&self, document: ToolDocument, vector: Vec<f32>) {
        self.entries
            .write()
            .insert(document.qualified_name.clone(), StoredVector { vector, document });
    }

    fn search(
        &self,
        vector: &[f32],
        k: usize,
        servers: Option<&HashSet<String>>,
    ) -> Vec<SearchHit> {
        let entries = self.entries.read();
        let mut hits: Vec<SearchHit> = entries
            .values()
            .filter(|e| servers.is_none_or(|allow| allow.contains(&e.document.server)))
            .map(|e| SearchHit {
                qualified_name: e.document.qualified_name.clone(),
                server: e.document.server.clone(),
                tool: e.document.tool.clone(),
                description: e.document.description.clone(),
                input_schema: e.document.input_schema.clone(),
                score: cosine_similarity(vector, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }

    fn delete(&self, qualified_name: &str) {
        self.entries.write().remove(qualified_name);
    }

    fn retain(&self, keep: &HashSet<String>) {
        self.entries.write().retain(|id, _| keep.contains(id));
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// The tool index: embedding provider + vector store + rebuild/search
/// orchestration.
pub struct ToolIndex {
    provider: RwLock<Option<Arc<dyn EmbeddingProvider>>>,
    store: Arc<dyn VectorStore>,
    last_error_log: Mutex<Option<Instant>>,
}

impl ToolIndex {
    #[must_use]
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            provider: RwLock::new(None),
            store,
            last_error_log: Mutex::new(None),
        }
    }

    /// Apply smart-routing configuration: install or clear the provider.
    pub fn configure(&self, config: &SmartRoutingConfig, http: &reqwest::Client) {
        let mut slot = self.provider.write();
        if config.enabled && !config.openai_api_key.is_empty() {
            *slot = Some(Arc::new(OpenAiEmbeddingProvider::new(
                http.clone(),
                config,
            )));
        } else {
            *slot = None;
        }
    }

    #[cfg(test)]
    fn with_provider(store: Arc<dyn VectorStore>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let index = Self::new(store);
        *index.provider.write() = Some(provider);
        index
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.provider.read().is_some()
    }

    /// Re-embed the full catalog. Stale entries (tools no longer present)
    /// are deleted; fresh ones are upserted.
    pub async fn rebuild(&self, documents: Vec<ToolDocument>) {
        let Some(provider) = self.provider.read().clone() else {
            return;
        };

        let keep: HashSet<String> = documents
            .iter()
            .map(|d| d.qualified_name.clone())
            .collect();
        self.store.retain(&keep);

        if documents.is_empty() {
            return;
        }

        let texts: Vec<String> = documents.iter().map(ToolDocument::embedding_text).collect();
        match provider.embed(&texts).await {
            Ok(vectors) => {
                for (document, vector) in documents.into_iter().zip(vectors) {
                    self.store.upsert(document, vector);
                }
                tracing::debug!(indexed = self.store.len(), "rebuilt tool index");
            }
            Err(e) => self.log_throttled(&e),
        }
    }

    /// Embed `query` and return the top-k tools, optionally restricted to a
    /// server allowlist. Unavailable providers yield an empty list; the
    /// caller falls back to full listings.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        servers: Option<HashSet<String>>,
    ) -> Vec<SearchHit> {
        let Some(provider) = self.provider.read().clone() else {
            return Vec::new();
        };

        let vectors = match provider.embed(&[query.to_string()]).await {
            Ok(v) => v,
            Err(e) => {
                self.log_throttled(&e);
                return Vec::new();
            }
        };
        let Some(query_vector) = vectors.first() else {
            return Vec::new();
        };

        let mut hits = self.store.search(query_vector, k, servers.as_ref());
        if k > 1 {
            hits.retain(|h| h.score >= SCORE_THRESHOLD);
        }
        hits
    }

    fn log_throttled(&self, error: &EmbeddingError) {
        let mut last = self.last_error_log.lock();
        let now = Instant::now();
        if last.is_none_or(|t| now.duration_since(t) >= ERROR_LOG_INTERVAL) {
            tracing::warn!(error = %error, "embedding provider unavailable; smart search degraded");
            *last = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubProvider;

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            // Deterministic toy embedding: direction keyed on a few words.
            Ok(inputs
                .iter()
                .map(|text| {
                    let t = text.to_lowercase();
                    vec![
                        if t.contains("file") { 1.0 } else { 0.0 },
                        if t.contains("weather") { 1.0 } else { 0.0 },
                        if t.contains("search") { 1.0 } else { 0.1 },
                    ]
                })
                .collect())
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(&self, _inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Connection("boom".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn doc(server: &str, tool: &str, description: &str) -> ToolDocument {
        ToolDocument {
            qualified_name: format!("{server}::{tool}"),
            server: server.to_string(),
            tool: tool.to_string(),
            description: description.to_string(),
            input_schema: json!({ "type": "object", "properties": { "path": {} } }),
        }
    }

    fn index_with_stub() -> ToolIndex {
        ToolIndex::with_provider(Arc::new(InMemoryVectorStore::default()), Arc::new(StubProvider))
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn embedding_text_includes_schema_property_names() {
        let text = doc("fs", "read_file", "Read a file from disk").embedding_text();
        assert!(text.starts_with("read_file: Read a file from disk"));
        assert!(text.contains("Input: path"));
    }

    #[tokio::test]
    async fn rebuild_then_search_ranks_by_similarity() {
        let index = index_with_stub();
        index
            .rebuild(vec![
                doc("fs", "read_file", "Read a file from disk"),
                doc("meteo", "forecast", "Get the weather forecast"),
            ])
            .await;

        let hits = index.search("weather tomorrow", 5, None).await;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].qualified_name, "meteo::forecast");
    }

    #[tokio::test]
    async fn search_honours_server_filter() {
        let index = index_with_stub();
        index
            .rebuild(vec![
                doc("fs", "read_file", "Read a file from disk"),
                doc("meteo", "forecast", "Get the weather forecast"),
            ])
            .await;

        let only_fs: HashSet<String> = ["fs".to_string()].into_iter().collect();
        let hits = index.search("weather tomorrow", 5, Some(only_fs)).await;
        assert!(hits.iter().all(|h| h.server == "fs"));
    }

    #[tokio::test]
    async fn single_result_search_bypasses_threshold() {
        let index = index_with_stub();
        index
            .rebuild(vec![doc("fs", "read_file", "Read a file from disk")])
            .await;

        // An orthogonal query scores ~0 but k=1 still returns the best match.
        let hits = index.search("weather", 1, None).await;
        assert_eq!(hits.len(), 1);
        let hits = index.search("weather", 5, None).await;
        assert!(hits.iter().all(|h| h.score >= SCORE_THRESHOLD));
    }

    #[tokio::test]
    async fn rebuild_drops_stale_entries() {
        let index = index_with_stub();
        index
            .rebuild(vec![
                doc("fs", "read_file", "Read a file"),
                doc("fs", "write_file", "Write a file"),
            ])
            .await;
        index.rebuild(vec![doc("fs", "read_file", "Read a file")]).await;

        let hits = index.search("file", 10, None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].qualified_name, "fs::read_file");
    }

    #[tokio::test]
    async fn provider_failure_yields_empty_results() {
        let index = ToolIndex::with_provider(
            Arc::new(InMemoryVectorStore::default()),
            Arc::new(FailingProvider),
        );
        assert!(index.search("anything", 5, None).await.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_index_is_disabled() {
        let index = ToolIndex::new(Arc::new(InMemoryVectorStore::default()));
        assert!(!index.enabled());
        assert!(index.search("anything", 5, None).await.is_empty());
    }
}
