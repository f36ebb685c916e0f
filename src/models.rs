//! Row and result types shared between the mirror, the index and the CLI.

/// A `repos` row: the registry projection plus derived and cached columns.
#[derive(Debug, Clone, PartialEq)]
pub struct DbRepoRow {
    pub id: String,
    pub host: String,
    pub owner: String,
    pub repo: String,
    pub clone_url: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub default_remote_name: String,
    pub update_strategy: String,
    pub submodules: String,
    pub lfs: String,
    pub source: String,
    pub starred_at: Option<String>,
    pub managed: bool,
    pub content_hash: Option<String>,
    pub readme_indexed_at: Option<String>,
    pub status_exists: Option<bool>,
    pub status_is_dirty: Option<bool>,
    pub status_checked_at: Option<String>,
}

/// One stored README chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadmeChunk {
    pub rowid: i64,
    pub repo_id: String,
    pub chunk_index: i64,
    pub chunk_text: String,
    pub content_hash: String,
}

/// Per-signal diagnostics behind a search score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Explain {
    /// 1-based position in the lexical ranking.
    pub bm25_rank: Option<usize>,
    /// FTS5 `rank` (lower is better).
    pub bm25_raw_score: Option<f64>,
    /// 1-based position in the vector ranking.
    pub vector_rank: Option<usize>,
    pub vector_score: Option<f64>,
    pub rerank_score: Option<f64>,
    pub rrf_score: Option<f64>,
}

/// A repository matched by a search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub repo_id: String,
    pub owner: String,
    pub repo: String,
    pub snippet: String,
    pub score: f64,
    pub explain: Explain,
}
