//! Similarity Memory
//!
//! Vector store collaborator: a Qdrant REST client for real runs and an
//! in-process cosine store for offline runs and tests. Both return hits
//! best-first.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";
pub const DEFAULT_COLLECTION: &str = "pvt_memory";
pub const DEFAULT_VECTOR_SIZE: usize = 768;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    /// Similarity in [0, 1] for cosine collections
    pub score: f32,
    pub payload: Value,
}

#[async_trait]
pub trait VectorMemory: Send + Sync {
    /// Store one point. The backing collection is created on first use.
    async fn upsert(&self, vector: Vec<f32>, payload: Value) -> Result<(), MemoryError>;

    /// Nearest neighbours, best first. A missing collection yields no hits.
    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<MemoryHit>, MemoryError>;
}

/// Qdrant over REST
pub struct QdrantMemory {
    base_url: String,
    collection: String,
    vector_size: usize,
    api_key: Option<String>,
    client: Client,
    last_id: AtomicU64,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

impl QdrantMemory {
    pub fn new(url: &str, collection: &str, vector_size: usize) -> Self {
        Self {
            base_url: url.trim_end_matches('/').into(),
            collection: collection.into(),
            vector_size,
            api_key: None,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            last_id: AtomicU64::new(0),
        }
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Millisecond timestamp, bumped when two points land in the same millisecond
    fn next_id(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last_id.load(Ordering::Relaxed);
        loop {
            let id = now.max(prev + 1);
            match self
                .last_id
                .compare_exchange(prev, id, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return id,
                Err(actual) => prev = actual,
            }
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/collections/{}{}", self.base_url, self.collection, path);
        let req = self.client.request(method, url);
        match self.api_key {
            Some(ref key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn put_point(&self, body: &Value) -> Result<StatusCode, MemoryError> {
        let response = self
            .request(reqwest::Method::PUT, "/points?wait=true")
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        let text = response.text().await.unwrap_or_default();
        Err(MemoryError::Unavailable(format!("{}: {}", status, text)))
    }

    pub async fn create_collection(&self) -> Result<(), MemoryError> {
        info!(collection = %self.collection, size = self.vector_size, "creating memory collection");
        let response = self
            .request(reqwest::Method::PUT, "")
            .json(&json!({"vectors": {"size": self.vector_size, "distance": "Cosine"}}))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MemoryError::Unavailable(format!("{}: {}", status, text)));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorMemory for QdrantMemory {
    async fn upsert(&self, vector: Vec<f32>, payload: Value) -> Result<(), MemoryError> {
        let id = self.next_id();
        let body = json!({"points": [{"id": id, "vector": vector, "payload": payload}]});

        if self.put_point(&body).await? == StatusCode::NOT_FOUND {
            self.create_collection().await?;
            if self.put_point(&body).await? == StatusCode::NOT_FOUND {
                return Err(MemoryError::Unavailable(format!(
                    "collection {} still missing after create",
                    self.collection
                )));
            }
        }
        debug!(id, collection = %self.collection, "point stored");
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<MemoryHit>, MemoryError> {
        let response = self
            .request(reqwest::Method::POST, "/points/search")
            .json(&json!({"vector": vector, "limit": limit, "with_payload": true}))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(collection = %self.collection, "collection not created yet");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MemoryError::Unavailable(format!("{}: {}", status, text)));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::Decode(e.to_string()))?;
        Ok(body
            .result
            .into_iter()
            .map(|p| MemoryHit {
                score: p.score,
                payload: p.payload.unwrap_or(Value::Null),
            })
            .collect())
    }
}

/// In-process store with brute-force cosine search
#[derive(Default)]
pub struct InMemoryStore {
    points: RwLock<Vec<(Vec<f32>, Value)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.points
            .read()
            .map(|p| p.iter().map(|(_, payload)| payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorMemory for InMemoryStore {
    async fn upsert(&self, vector: Vec<f32>, payload: Value) -> Result<(), MemoryError> {
        self.points
            .write()
            .map_err(|_| MemoryError::Unavailable("store lock poisoned".into()))?
            .push((vector, payload));
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<MemoryHit>, MemoryError> {
        let points = self
            .points
            .read()
            .map_err(|_| MemoryError::Unavailable("store lock poisoned".into()))?;
        let mut hits: Vec<MemoryHit> = points
            .iter()
            .map(|(v, payload)| MemoryHit {
                score: cosine_similarity(vector, v),
                payload: payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Cosine similarity; 0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_in_memory_best_first() {
        let store = InMemoryStore::new();
        store.upsert(vec![1.0, 0.0], json!({"fact": "a"})).await.unwrap();
        store.upsert(vec![0.6, 0.8], json!({"fact": "b"})).await.unwrap();
        store.upsert(vec![0.0, 1.0], json!({"fact": "c"})).await.unwrap();

        let hits = store.search(&[0.0, 1.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload["fact"], "c");
        assert_eq!(hits[1].payload["fact"], "b");
        assert!(InMemoryStore::new().search(&[1.0], 1).await.unwrap().is_empty());
    }

    #[test]
    fn test_ids_strictly_increase() {
        let memory = QdrantMemory::new(DEFAULT_QDRANT_URL, DEFAULT_COLLECTION, 4);
        let a = memory.next_id();
        let b = memory.next_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_qdrant_search() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/collections/pvt_memory/points/search")
            .match_body(mockito::Matcher::PartialJson(json!({"limit": 1, "with_payload": true})))
            .with_status(200)
            .with_body(r#"{"result": [{"id": 1, "version": 0, "score": 0.93, "payload": {"goal": "Open Start"}}], "status": "ok"}"#)
            .create_async()
            .await;

        let memory = QdrantMemory::new(&server.url(), DEFAULT_COLLECTION, 3);
        let hits = memory.search(&[0.1, 0.2, 0.3], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.93).abs() < 1e-6);
        assert_eq!(hits[0].payload["goal"], "Open Start");
    }

    #[tokio::test]
    async fn test_qdrant_search_missing_collection_is_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/collections/pvt_memory/points/search")
            .with_status(404)
            .with_body(r#"{"status": {"error": "Not found: Collection `pvt_memory` doesn't exist!"}}"#)
            .create_async()
            .await;

        let memory = QdrantMemory::new(&server.url(), DEFAULT_COLLECTION, 3);
        assert!(memory.search(&[0.1, 0.2, 0.3], 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_qdrant_upsert_provisions_collection_and_retries_once() {
        let mut server = mockito::Server::new_async().await;
        let points = server
            .mock("PUT", "/collections/pvt_memory/points?wait=true")
            .with_status(404)
            .expect(2)
            .create_async()
            .await;
        let create = server
            .mock("PUT", "/collections/pvt_memory")
            .match_body(mockito::Matcher::PartialJson(json!({"vectors": {"size": 3, "distance": "Cosine"}})))
            .with_status(200)
            .with_body(r#"{"result": true, "status": "ok"}"#)
            .expect(1)
            .create_async()
            .await;

        let memory = QdrantMemory::new(&server.url(), DEFAULT_COLLECTION, 3);
        let result = memory.upsert(vec![0.1, 0.2, 0.3], json!({"goal": "g"})).await;
        assert!(matches!(result, Err(MemoryError::Unavailable(_))));
        points.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_qdrant_upsert_success() {
        let mut server = mockito::Server::new_async().await;
        let points = server
            .mock("PUT", "/collections/pvt_memory/points?wait=true")
            .with_status(200)
            .with_body(r#"{"result": {"operation_id": 1, "status": "completed"}, "status": "ok"}"#)
            .expect(1)
            .create_async()
            .await;

        let memory = QdrantMemory::new(&server.url(), DEFAULT_COLLECTION, 3);
        memory.upsert(vec![0.1, 0.2, 0.3], json!({"goal": "g"})).await.unwrap();
        points.assert_async().await;
    }
}
