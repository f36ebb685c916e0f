//! README search index.
//!
//! Chunks live in `readme_chunks`; `readme_fts` is an FTS5 table whose
//! content is linked to that table by rowid. Three query modes:
//!
//! - **bm25**: the FTS5 `rank` (lower is better), displayed as
//!   `s / (1 + s)` with `s = -rank`.
//! - **vector**: per-chunk similarity from a [`VectorScorer`].
//! - **hybrid**: Reciprocal Rank Fusion of both repo rankings,
//!   `blend / (K + rank_bm25) + (1 - blend) / (K + rank_vector)`, summed only
//!   over the signals a candidate actually has.
//!
//! Ranking is per repository: each repo is represented by its best chunk in
//! each signal.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::{AppConfig, Paths};
use crate::db;
use crate::embedding::{EmbeddingScorer, OpenAiEmbedder};
use crate::git_url::split_repo_id;
use crate::models::{Explain, SearchResult};

/// RRF smoothing constant.
pub const RRF_K: f64 = 60.0;
pub const DEFAULT_LIMIT: usize = 10;
pub const DEFAULT_BLEND: f64 = 0.5;

/// Chunk candidates fetched per signal before grouping by repo.
const CANDIDATE_CHUNKS: i64 = 500;
const SNIPPET_CHARS: usize = 160;

pub async fn ensure_search_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readme_chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repo_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_text TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            UNIQUE(repo_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='readme_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE readme_fts USING fts5(
                chunk_text,
                content='readme_chunks',
                content_rowid='id'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readme_vectors (
            chunk_id INTEGER PRIMARY KEY,
            repo_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_readme_vectors_repo ON readme_vectors(repo_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Remove a repo's FTS rows, vectors and chunks, in that order.
///
/// The FTS `'delete'` command needs each row's original rowid and text, which
/// are gone once the backing chunk rows are deleted.
pub async fn delete_repo_chunks(conn: &mut SqliteConnection, repo_id: &str) -> Result<u64> {
    let rows = sqlx::query("SELECT id, chunk_text FROM readme_chunks WHERE repo_id = ?")
        .bind(repo_id)
        .fetch_all(&mut *conn)
        .await?;

    for row in &rows {
        let id: i64 = row.get("id");
        let text: String = row.get("chunk_text");
        sqlx::query("INSERT INTO readme_fts(readme_fts, rowid, chunk_text) VALUES('delete', ?, ?)")
            .bind(id)
            .bind(text)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("DELETE FROM readme_vectors WHERE repo_id = ?")
        .bind(repo_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM readme_chunks WHERE repo_id = ?")
        .bind(repo_id)
        .execute(&mut *conn)
        .await?;

    Ok(rows.len() as u64)
}

/// Replace a repo's chunks unless `content_hash` matches what is stored.
///
/// Returns `true` when the index was rewritten.
pub async fn index_readme(
    pool: &SqlitePool,
    repo_id: &str,
    content_hash: &str,
    chunks: &[String],
) -> Result<bool> {
    let stored: Option<String> = sqlx::query_scalar(
        "SELECT content_hash FROM readme_chunks WHERE repo_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(repo_id)
    .fetch_optional(pool)
    .await?;

    if stored.as_deref() == Some(content_hash) {
        return Ok(false);
    }

    let mut tx = pool.begin().await?;
    delete_repo_chunks(&mut *tx, repo_id).await?;

    for (index, text) in chunks.iter().enumerate() {
        let result = sqlx::query(
            "INSERT INTO readme_chunks (repo_id, chunk_index, chunk_text, content_hash) VALUES (?, ?, ?, ?)",
        )
        .bind(repo_id)
        .bind(index as i64)
        .bind(text)
        .bind(content_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO readme_fts (rowid, chunk_text) VALUES (?, ?)")
            .bind(result.last_insert_rowid())
            .bind(text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// Drop every chunk, vector and FTS row.
pub async fn clear_index(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO readme_fts(readme_fts) VALUES('delete-all')")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM readme_vectors")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM readme_chunks")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn chunk_count(pool: &SqlitePool, repo_id: Option<&str>) -> Result<i64> {
    let count = match repo_id {
        Some(id) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM readme_chunks WHERE repo_id = ?")
                .bind(id)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM readme_chunks")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

/// Turn free text into an FTS5 expression that cannot be a syntax error.
///
/// Every token becomes a quoted phrase; only the last one gets a prefix `*`
/// so the word being typed still matches. Tokens without any alphanumeric
/// character are dropped. Blank input gives an empty string.
pub fn sanitize_fts_query(input: &str) -> String {
    let tokens: Vec<&str> = input
        .split_whitespace()
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .collect();
    let last = tokens.len().saturating_sub(1);
    tokens
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let quoted = format!("\"{}\"", t.replace('"', "\"\""));
            if i == last {
                quoted + "*"
            } else {
                quoted
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Bm25,
    Vector,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bm25" => Ok(SearchMode::Bm25),
            "vector" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => bail!(
                "Unknown search mode: {}. Use bm25, vector, or hybrid.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub limit: usize,
    /// Lexical weight in hybrid fusion; the vector signal gets `1 - blend`.
    pub blend: f64,
    pub rerank_top: usize,
    /// Reorder the reranked head by rerank score instead of fused score.
    pub order_by_rerank: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Hybrid,
            limit: DEFAULT_LIMIT,
            blend: DEFAULT_BLEND,
            rerank_top: 0,
            order_by_rerank: false,
        }
    }
}

impl SearchOptions {
    /// Build options from raw command-line values, rejecting anything out of
    /// range before a query runs.
    pub fn from_args(mode: &str, limit: i64, blend: f64, rerank_top: i64) -> Result<Self> {
        let mode: SearchMode = mode.parse()?;
        if limit < 1 {
            bail!("--limit must be a positive integer (got {})", limit);
        }
        if !blend.is_finite() || !(0.0..=1.0).contains(&blend) {
            bail!("--blend must be between 0 and 1 (got {})", blend);
        }
        if rerank_top < 0 {
            bail!("--rerank-top must be >= 0 (got {})", rerank_top);
        }
        Ok(Self {
            mode,
            limit: limit as usize,
            blend,
            rerank_top: rerank_top as usize,
            order_by_rerank: false,
        })
    }
}

/// Similarity of one stored chunk to a query; higher is better.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkScore {
    pub chunk_id: i64,
    pub repo_id: String,
    pub score: f64,
}

/// Supplies the vector signal.
#[async_trait]
pub trait VectorScorer: Send + Sync {
    async fn score_chunks(&self, pool: &SqlitePool, query: &str) -> Result<Vec<ChunkScore>>;
}

/// Scores `(query, document)` pairs; one score per document, higher is better.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>>;
}

/// Optional collaborators for a search.
#[derive(Default, Clone, Copy)]
pub struct SearchSignals<'a> {
    pub vector: Option<&'a dyn VectorScorer>,
    pub reranker: Option<&'a dyn Reranker>,
}

/// A repository's best chunk within one signal.
#[derive(Debug, Clone)]
struct RepoHit {
    repo_id: String,
    chunk_id: i64,
    raw: f64,
    snippet: Option<String>,
}

#[derive(Debug)]
struct Candidate {
    repo_id: String,
    chunk_id: i64,
    snippet: Option<String>,
    score: f64,
    explain: Explain,
}

async fn bm25_hits(pool: &SqlitePool, fts_query: &str) -> Result<Vec<RepoHit>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.repo_id AS repo_id, readme_fts.rank AS rank,
               snippet(readme_fts, 0, '[', ']', '...', 16) AS snippet
        FROM readme_fts
        JOIN readme_chunks c ON c.id = readme_fts.rowid
        WHERE readme_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(fts_query)
    .bind(CANDIDATE_CHUNKS)
    .fetch_all(pool)
    .await?;

    let mut seen = std::collections::HashSet::new();
    let mut hits = Vec::new();
    for row in &rows {
        let repo_id: String = row.get("repo_id");
        if seen.insert(repo_id.clone()) {
            hits.push(RepoHit {
                repo_id,
                chunk_id: row.get("chunk_id"),
                raw: row.get("rank"),
                snippet: Some(row.get("snippet")),
            });
        }
    }
    Ok(hits)
}

fn vector_hits(mut scores: Vec<ChunkScore>) -> Vec<RepoHit> {
    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    let mut seen = std::collections::HashSet::new();
    scores
        .into_iter()
        .filter(|s| seen.insert(s.repo_id.clone()))
        .map(|s| RepoHit {
            repo_id: s.repo_id,
            chunk_id: s.chunk_id,
            raw: s.score,
            snippet: None,
        })
        .collect()
}

/// BM25 rank (negative, lower is better) mapped onto `[0, 1)`.
pub fn bm25_display_score(rank: f64) -> f64 {
    let s = (-rank).max(0.0);
    s / (1.0 + s)
}

/// Fuse per-signal repo rankings with Reciprocal Rank Fusion.
///
/// Ranks are 1-based. A repo missing from one list contributes nothing for
/// that signal.
fn fuse(lexical: &[RepoHit], vector: &[RepoHit], blend: f64) -> Vec<Candidate> {
    let mut by_repo: HashMap<String, Candidate> = HashMap::new();

    for (i, hit) in lexical.iter().enumerate() {
        let rank = i + 1;
        let c = by_repo.entry(hit.repo_id.clone()).or_insert_with(|| Candidate {
            repo_id: hit.repo_id.clone(),
            chunk_id: hit.chunk_id,
            snippet: hit.snippet.clone(),
            score: 0.0,
            explain: Explain::default(),
        });
        c.score += blend / (RRF_K + rank as f64);
        c.explain.bm25_rank = Some(rank);
        c.explain.bm25_raw_score = Some(hit.raw);
    }

    for (i, hit) in vector.iter().enumerate() {
        let rank = i + 1;
        let c = by_repo.entry(hit.repo_id.clone()).or_insert_with(|| Candidate {
            repo_id: hit.repo_id.clone(),
            chunk_id: hit.chunk_id,
            snippet: None,
            score: 0.0,
            explain: Explain::default(),
        });
        c.score += (1.0 - blend) / (RRF_K + rank as f64);
        c.explain.vector_rank = Some(rank);
        c.explain.vector_score = Some(hit.raw);
    }

    let mut fused: Vec<Candidate> = by_repo
        .into_values()
        .map(|mut c| {
            c.explain.rrf_score = Some(c.score);
            c
        })
        .collect();
    sort_candidates(&mut fused);
    fused
}

fn single_signal(hits: Vec<RepoHit>, lexical: bool) -> Vec<Candidate> {
    hits.into_iter()
        .enumerate()
        .map(|(i, hit)| {
            let mut explain = Explain::default();
            let score = if lexical {
                explain.bm25_rank = Some(i + 1);
                explain.bm25_raw_score = Some(hit.raw);
                bm25_display_score(hit.raw)
            } else {
                explain.vector_rank = Some(i + 1);
                explain.vector_score = Some(hit.raw);
                hit.raw
            };
            Candidate {
                repo_id: hit.repo_id,
                chunk_id: hit.chunk_id,
                snippet: hit.snippet,
                score,
                explain,
            }
        })
        .collect()
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.repo_id.cmp(&b.repo_id))
    });
}

async fn chunk_text_by_id(pool: &SqlitePool, chunk_id: i64) -> Result<String> {
    let text: Option<String> = sqlx::query_scalar("SELECT chunk_text FROM readme_chunks WHERE id = ?")
        .bind(chunk_id)
        .fetch_optional(pool)
        .await?;
    Ok(text.unwrap_or_default())
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        flat
    } else {
        format!("{}...", flat.chars().take(SNIPPET_CHARS).collect::<String>())
    }
}

/// Rank repositories against `query`.
///
/// Vector mode needs `signals.vector`; hybrid without it fuses the lexical
/// signal alone. A reranker, when given and `rerank_top > 0`, scores the top
/// fused candidates and fills `explain.rerank_score`.
pub async fn search_repos(
    pool: &SqlitePool,
    query: &str,
    opts: &SearchOptions,
    signals: &SearchSignals<'_>,
) -> Result<Vec<SearchResult>> {
    let fts_query = sanitize_fts_query(query);
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    if opts.mode == SearchMode::Vector && signals.vector.is_none() {
        bail!("Mode 'vector' requires embeddings. Set the embedding provider in config.json.");
    }

    let lexical = match opts.mode {
        SearchMode::Bm25 | SearchMode::Hybrid => bm25_hits(pool, &fts_query)
            .await
            .with_context(|| format!("full-text query failed: {}", fts_query))?,
        SearchMode::Vector => Vec::new(),
    };
    let vector = match (opts.mode, signals.vector) {
        (SearchMode::Vector | SearchMode::Hybrid, Some(scorer)) => {
            vector_hits(scorer.score_chunks(pool, query).await?)
        }
        _ => Vec::new(),
    };

    let mut candidates = match opts.mode {
        SearchMode::Bm25 => single_signal(lexical, true),
        SearchMode::Vector => single_signal(vector, false),
        SearchMode::Hybrid => fuse(&lexical, &vector, opts.blend),
    };

    if let (Some(reranker), true) = (signals.reranker, opts.rerank_top > 0) {
        let head = opts.rerank_top.min(candidates.len());
        let mut documents = Vec::with_capacity(head);
        for c in &candidates[..head] {
            documents.push(chunk_text_by_id(pool, c.chunk_id).await?);
        }
        let scores = reranker.rerank(query, &documents).await?;
        for (c, s) in candidates[..head].iter_mut().zip(scores) {
            c.explain.rerank_score = Some(s);
        }
        if opts.order_by_rerank {
            candidates[..head].sort_by(|a, b| {
                b.explain
                    .rerank_score
                    .partial_cmp(&a.explain.rerank_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    candidates.truncate(opts.limit);

    let mut results = Vec::with_capacity(candidates.len());
    for c in candidates {
        let snippet = match c.snippet {
            Some(s) => s.replace('\n', " ").trim().to_string(),
            None => excerpt(&chunk_text_by_id(pool, c.chunk_id).await?),
        };
        let (owner, repo) = split_repo_id(&c.repo_id)
            .map(|(_, o, r)| (o.to_string(), r.to_string()))
            .unwrap_or_default();
        results.push(SearchResult {
            repo_id: c.repo_id,
            owner,
            repo,
            snippet,
            score: c.score,
            explain: c.explain,
        });
    }
    Ok(results)
}

/// BM25-only ranking for live filtering. Never fails: invalid syntax or a
/// database error yields an empty ranking.
pub async fn rank_repos_by_query(pool: &SqlitePool, query: &str, limit: usize) -> Vec<(String, f64)> {
    let fts_query = sanitize_fts_query(query);
    if fts_query.is_empty() {
        return Vec::new();
    }
    match bm25_hits(pool, &fts_query).await {
        Ok(hits) => hits
            .into_iter()
            .take(limit)
            .map(|h| (h.repo_id, bm25_display_score(h.raw)))
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, query, "live ranking query failed");
            Vec::new()
        }
    }
}

/// The `search` command.
pub async fn run_search(
    paths: &Paths,
    config: &AppConfig,
    query: &str,
    opts: &SearchOptions,
    explain: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let scorer = if config.embedding.is_enabled() && opts.mode != SearchMode::Bm25 {
        Some(EmbeddingScorer::new(OpenAiEmbedder::new(&config.embedding)?))
    } else {
        None
    };
    match (opts.mode, &scorer) {
        (SearchMode::Vector, None) => bail!(
            "Mode 'vector' requires embeddings. Set the embedding provider in config.json."
        ),
        (SearchMode::Hybrid, None) => {
            tracing::warn!("no embedding provider configured; hybrid search uses BM25 only")
        }
        _ => {}
    }
    if opts.rerank_top > 0 {
        tracing::warn!("--rerank-top ignored: no reranker is configured");
    }

    let signals = SearchSignals {
        vector: scorer.as_ref().map(|s| s as &dyn VectorScorer),
        reranker: None,
    };
    let results = db::with_db(&paths.db_file(), |pool| async move {
        search_repos(&pool, query, opts, &signals).await
    })
    .await?;

    print_results(&results, explain);
    Ok(())
}

/// Print results the way the `search` command shows them.
pub fn print_results(results: &[SearchResult], explain: bool) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, r) in results.iter().enumerate() {
        println!("{}. [{:.4}] {}/{}", i + 1, r.score, r.owner, r.repo);
        println!("    id: {}", r.repo_id);
        println!("    excerpt: \"{}\"", r.snippet);
        if explain {
            let e = &r.explain;
            println!(
                "    bm25: rank={} raw={}",
                fmt_opt(e.bm25_rank),
                fmt_opt(e.bm25_raw_score.map(|v| format!("{:.4}", v)))
            );
            println!(
                "    vector: rank={} score={}",
                fmt_opt(e.vector_rank),
                fmt_opt(e.vector_score.map(|v| format!("{:.4}", v)))
            );
            println!(
                "    rerank: {}  rrf: {}",
                fmt_opt(e.rerank_score.map(|v| format!("{:.4}", v))),
                fmt_opt(e.rrf_score.map(|v| format!("{:.6}", v)))
            );
        }
        println!();
    }
}

fn fmt_opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use tempfile::TempDir;

    async fn test_pool(tmp: &TempDir) -> SqlitePool {
        let pool = db::connect(&tmp.path().join("clones.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn hit(repo: &str, chunk: i64, raw: f64) -> RepoHit {
        RepoHit {
            repo_id: repo.to_string(),
            chunk_id: chunk,
            raw,
            snippet: None,
        }
    }

    struct FixedScorer(Vec<ChunkScore>);

    #[async_trait]
    impl VectorScorer for FixedScorer {
        async fn score_chunks(&self, _pool: &SqlitePool, _query: &str) -> Result<Vec<ChunkScore>> {
            Ok(self.0.clone())
        }
    }

    struct LengthReranker;

    #[async_trait]
    impl Reranker for LengthReranker {
        async fn rerank(&self, _query: &str, documents: &[String]) -> Result<Vec<f64>> {
            Ok(documents.iter().map(|d| d.len() as f64).collect())
        }
    }

    #[test]
    fn sanitize_quotes_and_prefixes_last() {
        assert_eq!(sanitize_fts_query("foo bar"), "\"foo\" \"bar\"*");
        assert_eq!(sanitize_fts_query("say \"hi\""), "\"say\" \"\"\"hi\"\"\"*");
        assert_eq!(sanitize_fts_query("AND OR NOT"), "\"AND\" \"OR\" \"NOT\"*");
        assert_eq!(sanitize_fts_query("   "), "");
        assert_eq!(sanitize_fts_query("( - )"), "");
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("bm25".parse::<SearchMode>().unwrap(), SearchMode::Bm25);
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("semantic".parse::<SearchMode>().is_err());
    }

    #[test]
    fn option_validation() {
        assert!(SearchOptions::from_args("bm25", 10, 0.5, 0).is_ok());
        assert!(SearchOptions::from_args("bm25", 0, 0.5, 0).is_err());
        assert!(SearchOptions::from_args("bm25", 10, 1.5, 0).is_err());
        assert!(SearchOptions::from_args("bm25", 10, f64::NAN, 0).is_err());
        assert!(SearchOptions::from_args("bm25", 10, 0.5, -1).is_err());
        assert!(SearchOptions::from_args("fuzzy", 10, 0.5, 0).is_err());
    }

    #[test]
    fn rrf_sums_only_present_signals() {
        let lexical = vec![hit("a", 1, -3.0), hit("b", 2, -2.0)];
        let vector = vec![hit("b", 2, 0.9), hit("c", 3, 0.8)];
        let fused = fuse(&lexical, &vector, 0.5);

        let score = |id: &str| fused.iter().find(|c| c.repo_id == id).unwrap().score;
        assert!((score("a") - 0.5 / 61.0).abs() < 1e-12);
        assert!((score("b") - (0.5 / 62.0 + 0.5 / 61.0)).abs() < 1e-12);
        assert!((score("c") - 0.5 / 62.0).abs() < 1e-12);
        assert_eq!(fused[0].repo_id, "b");

        let c = fused.iter().find(|c| c.repo_id == "c").unwrap();
        assert_eq!(c.explain.bm25_rank, None);
        assert_eq!(c.explain.vector_rank, Some(2));
    }

    #[test]
    fn blend_weights_signals() {
        let lexical = vec![hit("a", 1, -3.0), hit("b", 2, -2.0)];
        let vector = vec![hit("b", 2, 0.9), hit("a", 1, 0.1)];
        assert_eq!(fuse(&lexical, &vector, 1.0)[0].repo_id, "a");
        assert_eq!(fuse(&lexical, &vector, 0.0)[0].repo_id, "b");
    }

    #[test]
    fn bm25_score_is_normalized() {
        assert_eq!(bm25_display_score(0.0), 0.0);
        assert!((bm25_display_score(-1.0) - 0.5).abs() < 1e-12);
        assert!(bm25_display_score(-100.0) < 1.0);
    }

    #[tokio::test]
    async fn bm25_finds_readme() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let chunks = vec!["This README has important information about widgets.".to_string()];
        assert!(index_readme(&pool, "github.com:acme/widgets", "h1", &chunks).await.unwrap());
        index_readme(&pool, "github.com:acme/other", "h2", &["Unrelated text.".to_string()])
            .await
            .unwrap();

        let opts = SearchOptions {
            mode: SearchMode::Bm25,
            limit: 10,
            blend: 0.5,
            rerank_top: 0,
            order_by_rerank: false,
        };
        let results = search_repos(&pool, "important", &opts, &SearchSignals::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.repo_id, "github.com:acme/widgets");
        assert_eq!((r.owner.as_str(), r.repo.as_str()), ("acme", "widgets"));
        assert!(r.score > 0.0);
        assert!(r.explain.bm25_raw_score.is_some());
        assert_eq!(r.explain.vector_score, None);
        assert_eq!(r.explain.rrf_score, None);
        assert!(r.snippet.contains("[important]"));
    }

    #[tokio::test]
    async fn unchanged_hash_skips_reindex() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let id = "github.com:acme/widgets";
        let chunks = vec!["one".to_string(), "two".to_string()];

        assert!(index_readme(&pool, id, "h1", &chunks).await.unwrap());
        assert_eq!(chunk_count(&pool, Some(id)).await.unwrap(), 2);
        assert!(!index_readme(&pool, id, "h1", &["three".to_string()]).await.unwrap());
        assert_eq!(chunk_count(&pool, Some(id)).await.unwrap(), 2);

        // A new hash replaces chunks and the FTS rows follow.
        assert!(index_readme(&pool, id, "h2", &["three".to_string()]).await.unwrap());
        assert_eq!(chunk_count(&pool, Some(id)).await.unwrap(), 1);
        assert!(rank_repos_by_query(&pool, "one", 10).await.is_empty());
        assert_eq!(rank_repos_by_query(&pool, "three", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn hybrid_fuses_vector_signal_and_reranks() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        index_readme(&pool, "github.com:a/lexical", "h", &["parser for tokens".to_string()])
            .await
            .unwrap();
        index_readme(&pool, "github.com:b/semantic", "h", &["a much longer grammar engine text".to_string()])
            .await
            .unwrap();
        let semantic_chunk: i64 =
            sqlx::query_scalar("SELECT id FROM readme_chunks WHERE repo_id = 'github.com:b/semantic'")
                .fetch_one(&pool)
                .await
                .unwrap();

        let scorer = FixedScorer(vec![ChunkScore {
            chunk_id: semantic_chunk,
            repo_id: "github.com:b/semantic".to_string(),
            score: 0.93,
        }]);
        let reranker = LengthReranker;
        let signals = SearchSignals {
            vector: Some(&scorer),
            reranker: Some(&reranker),
        };
        let opts = SearchOptions {
            rerank_top: 2,
            ..Default::default()
        };

        let results = search_repos(&pool, "parser", &opts, &signals).await.unwrap();
        assert_eq!(results.len(), 2);
        // Equal RRF contributions; ties break on repo id.
        assert_eq!(results[0].repo_id, "github.com:a/lexical");
        assert!(results.iter().all(|r| r.explain.rrf_score.is_some()));
        assert!(results.iter().all(|r| r.explain.rerank_score.is_some()));
        assert_eq!(results[1].explain.vector_score, Some(0.93));
        assert_eq!(results[1].explain.bm25_rank, None);
        assert_eq!(results[1].snippet, "a much longer grammar engine text");

        let reordered = SearchOptions {
            order_by_rerank: true,
            ..opts
        };
        let results = search_repos(&pool, "parser", &reordered, &signals).await.unwrap();
        assert_eq!(results[0].repo_id, "github.com:b/semantic");
    }

    #[tokio::test]
    async fn vector_mode_requires_scorer() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let opts = SearchOptions {
            mode: SearchMode::Vector,
            ..Default::default()
        };
        assert!(search_repos(&pool, "x", &opts, &SearchSignals::default()).await.is_err());
    }

    #[tokio::test]
    async fn clear_index_empties_everything() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        index_readme(&pool, "github.com:acme/widgets", "h", &["alpha beta".to_string()])
            .await
            .unwrap();
        clear_index(&pool).await.unwrap();
        assert_eq!(chunk_count(&pool, None).await.unwrap(), 0);
        assert!(rank_repos_by_query(&pool, "alpha", 10).await.is_empty());
    }
}
