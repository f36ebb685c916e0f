//! Vector signal backed by an OpenAI-compatible embeddings endpoint.
//!
//! Chunk vectors are stored as little-endian `f32` BLOBs in
//! `readme_vectors`, keyed by the chunk rowid and tagged with the model that
//! produced them. [`EmbeddingScorer`] embeds the query and scores every stored
//! chunk by cosine similarity.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::search::{ChunkScore, VectorScorer};

/// Client for `POST {url}` with an OpenAI-shaped request body.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    /// Build from config. Fails when the provider is not `openai`, when
    /// `model`/`dims` are missing, or when `OPENAI_API_KEY` is unset.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        match config.provider.as_str() {
            "openai" => {}
            "disabled" => bail!("Embedding provider is disabled"),
            other => bail!("Unknown embedding provider: {}", other),
        }
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key,
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed one batch, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = parse_embedding_response(&json)?;
                        if vectors.len() != texts.len() {
                            bail!(
                                "Embedding response has {} vectors for {} inputs",
                                vectors.len(),
                                texts.len()
                            );
                        }
                        if let Some(v) = vectors.iter().find(|v| v.len() != self.dims) {
                            bail!(
                                "Embedding has {} dimensions, expected {}",
                                v.len(),
                                self.dims
                            );
                        }
                        return Ok(vectors);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::debug!(%status, attempt, "embedding request will be retried");
                        last_err = Some(anyhow!("Embedding API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid embedding response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid embedding response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Embed every chunk that has no vector for the current model.
///
/// Returns the number of chunks embedded.
pub async fn embed_pending(pool: &SqlitePool, embedder: &OpenAiEmbedder) -> Result<usize> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.repo_id, c.chunk_text
        FROM readme_chunks c
        LEFT JOIN readme_vectors v ON v.chunk_id = c.id AND v.model = ?
        WHERE v.chunk_id IS NULL
        ORDER BY c.id
        "#,
    )
    .bind(embedder.model())
    .fetch_all(pool)
    .await?;

    let pending: Vec<(i64, String, String)> = rows
        .iter()
        .map(|r| (r.get("id"), r.get("repo_id"), r.get("chunk_text")))
        .collect();

    let mut embedded = 0;
    for batch in pending.chunks(embedder.batch_size) {
        let texts: Vec<String> = batch.iter().map(|(_, _, t)| t.clone()).collect();
        let vectors = embedder.embed(&texts).await?;

        let mut tx = pool.begin().await?;
        for ((chunk_id, repo_id, _), vector) in batch.iter().zip(vectors) {
            sqlx::query(
                r#"
                INSERT INTO readme_vectors (chunk_id, repo_id, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    repo_id = excluded.repo_id,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(chunk_id)
            .bind(repo_id)
            .bind(embedder.model())
            .bind(vector.len() as i64)
            .bind(vec_to_blob(&vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        embedded += batch.len();
        tracing::debug!(embedded, total = pending.len(), "embedded README chunks");
    }

    Ok(embedded)
}

/// Cosine similarity of `query` against every stored vector for `model`.
pub async fn score_stored(pool: &SqlitePool, model: &str, query: &[f32]) -> Result<Vec<ChunkScore>> {
    let rows = sqlx::query("SELECT chunk_id, repo_id, embedding FROM readme_vectors WHERE model = ?")
        .bind(model)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            ChunkScore {
                chunk_id: row.get("chunk_id"),
                repo_id: row.get("repo_id"),
                score: cosine_similarity(query, &blob_to_vec(&blob)) as f64,
            }
        })
        .collect())
}

/// The vector signal used by `search`.
pub struct EmbeddingScorer {
    embedder: OpenAiEmbedder,
}

impl EmbeddingScorer {
    pub fn new(embedder: OpenAiEmbedder) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl VectorScorer for EmbeddingScorer {
    async fn score_chunks(&self, pool: &SqlitePool, query: &str) -> Result<Vec<ChunkScore>> {
        let query_vec = self.embedder.embed_query(query).await?;
        score_stored(pool, self.embedder.model(), &query_vec).await
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
