//! README ingestion.
//!
//! Finds each cloned repository's README, hashes it, chunks it and hands the
//! chunks to the search index. The content hash gates the work: an unchanged
//! README costs one query. Embedding failures are non-fatal; chunks simply
//! stay pending until the next run.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::atomic::LoadMode;
use crate::chunk::{chunk_text, content_hash, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP};
use crate::config::{AppConfig, Paths};
use crate::db;
use crate::embedding::{self, OpenAiEmbedder};
use crate::local_state::now_rfc3339;
use crate::mirror;
use crate::progress::{ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::registry::{load_registry, Registry};
use crate::search;

const README_PREFERENCE: &[&str] = &["readme.md", "readme.markdown", "readme.rst", "readme.txt", "readme"];

/// Locate the README in `dir`, case-insensitively.
///
/// `README.md` wins, then the other common spellings, then any other
/// `README*` file in name order.
pub fn find_readme(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_lowercase();
            name.starts_with("readme").then(|| (name, e.path()))
        })
        .collect();

    candidates.sort_by(|(a, _), (b, _)| {
        let rank = |n: &str| {
            README_PREFERENCE
                .iter()
                .position(|p| *p == n)
                .unwrap_or(README_PREFERENCE.len())
        };
        rank(a).cmp(&rank(b)).then(a.cmp(b))
    });
    candidates.into_iter().next().map(|(_, path)| path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed,
    Unchanged,
    NoReadme,
}

/// Index one repository's README.
pub async fn index_repo(pool: &SqlitePool, repo_id: &str, dir: &Path) -> Result<IndexOutcome> {
    let row = mirror::get_repo(pool, repo_id).await?;

    let Some(path) = find_readme(dir) else {
        // A README that vanished takes its chunks with it.
        let mut tx = pool.begin().await?;
        let removed = search::delete_repo_chunks(&mut *tx, repo_id).await?;
        tx.commit().await?;
        if removed > 0 || row.as_ref().and_then(|r| r.content_hash.as_ref()).is_some() {
            mirror::set_readme_hash(pool, repo_id, None, None).await?;
        }
        return Ok(IndexOutcome::NoReadme);
    };

    let bytes = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    let hash = content_hash(&content);
    let chunks = chunk_text(&content, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP);

    let changed = search::index_readme(pool, repo_id, &hash, &chunks).await?;
    let recorded = row.as_ref().and_then(|r| r.content_hash.as_deref()) == Some(hash.as_str());
    if changed || !recorded {
        mirror::set_readme_hash(pool, repo_id, Some(&hash), Some(&now_rfc3339())).await?;
    }

    Ok(if changed {
        IndexOutcome::Indexed
    } else {
        IndexOutcome::Unchanged
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    pub indexed: usize,
    pub unchanged: usize,
    pub no_readme: usize,
    pub not_cloned: usize,
    pub failed: usize,
    pub embedded: usize,
}

/// Index every cloned registry entry under `clones_dir`.
///
/// `force` clears the whole index first, so every README is re-chunked.
pub async fn index_all(
    pool: &SqlitePool,
    registry: &Registry,
    clones_dir: &Path,
    force: bool,
    embedder: Option<&OpenAiEmbedder>,
    reporter: &dyn SyncProgressReporter,
) -> Result<IndexStats> {
    if force {
        search::clear_index(pool).await?;
    }

    let mut stats = IndexStats::default();
    let entries: Vec<_> = registry
        .repos
        .iter()
        .filter(|e| !registry.is_tombstoned(&e.id))
        .collect();
    let total = entries.len() as u64;

    for (i, entry) in entries.iter().enumerate() {
        let dir = entry.local_path(clones_dir);
        if !dir.join(".git").exists() {
            stats.not_cloned += 1;
        } else {
            match index_repo(pool, &entry.id, &dir).await {
                Ok(IndexOutcome::Indexed) => stats.indexed += 1,
                Ok(IndexOutcome::Unchanged) => stats.unchanged += 1,
                Ok(IndexOutcome::NoReadme) => stats.no_readme += 1,
                Err(e) => {
                    tracing::warn!(repo = %entry.id, error = %e, "README indexing failed");
                    stats.failed += 1;
                }
            }
        }
        reporter.report(SyncProgressEvent::Indexing {
            n: i as u64 + 1,
            total,
        });
    }

    if let Some(embedder) = embedder {
        match embedding::embed_pending(pool, embedder).await {
            Ok(n) => stats.embedded = n,
            Err(e) => tracing::warn!(error = %e, "embedding failed; chunks remain pending"),
        }
    }

    Ok(stats)
}

/// The `index rebuild` command: clear the index and re-chunk every README.
pub async fn run_index_rebuild(paths: &Paths, config: &AppConfig, progress: ProgressMode) -> Result<()> {
    let registry = load_registry(paths, LoadMode::Repair)?.data;
    let embedder = if config.embedding.is_enabled() {
        Some(OpenAiEmbedder::new(&config.embedding)?)
    } else {
        None
    };
    let reporter = progress.reporter();

    let stats = db::with_db(&paths.db_file(), |pool| async move {
        mirror::sync_registry(&pool, &registry).await?;
        index_all(
            &pool,
            &registry,
            &paths.clones_dir,
            true,
            embedder.as_ref(),
            reporter.as_ref(),
        )
        .await
    })
    .await?;

    println!("index rebuild");
    println!("  readmes indexed: {}", stats.indexed);
    println!("  without readme: {}", stats.no_readme);
    println!("  not cloned: {}", stats.not_cloned);
    if stats.failed > 0 {
        println!("  failed: {}", stats.failed);
    }
    if config.embedding.is_enabled() {
        println!("  chunks embedded: {}", stats.embedded);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::registry::{EntrySource, RegistryEntry};
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn test_pool(tmp: &TempDir) -> SqlitePool {
        let pool = db::connect(&tmp.path().join("clones.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    #[test]
    fn readme_preference() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(find_readme(tmp.path()), None);

        std::fs::write(tmp.path().join("README.txt"), "txt").unwrap();
        assert_eq!(find_readme(tmp.path()).unwrap().file_name().unwrap(), "README.txt");

        std::fs::write(tmp.path().join("Readme.MD"), "md").unwrap();
        assert_eq!(find_readme(tmp.path()).unwrap().file_name().unwrap(), "Readme.MD");

        std::fs::create_dir(tmp.path().join("readme.markdown")).unwrap();
        assert_eq!(find_readme(tmp.path()).unwrap().file_name().unwrap(), "Readme.MD");
    }

    #[tokio::test]
    async fn index_all_is_incremental() {
        let tmp = TempDir::new().unwrap();
        let clones = tmp.path().join("clones");
        let pool = test_pool(&tmp).await;

        let mut registry = Registry::default();
        for url in ["https://github.com/acme/widgets", "https://github.com/acme/gears"] {
            registry.upsert(RegistryEntry::from_clone_url(url, EntrySource::Manual, true).unwrap());
        }
        mirror::sync_registry(&pool, &registry).await.unwrap();

        let widgets = clones.join("acme/widgets");
        std::fs::create_dir_all(widgets.join(".git")).unwrap();
        std::fs::write(widgets.join("README.md"), "# Widgets\n\nSprockets and cogs.\n").unwrap();

        let stats = index_all(&pool, &registry, &clones, false, None, &NoProgress)
            .await
            .unwrap();
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.not_cloned, 1);

        let row = mirror::get_repo(&pool, "github.com:acme/widgets").await.unwrap().unwrap();
        assert!(row.content_hash.is_some());
        assert!(row.readme_indexed_at.is_some());

        let again = index_all(&pool, &registry, &clones, false, None, &NoProgress)
            .await
            .unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(again.indexed, 0);

        let forced = index_all(&pool, &registry, &clones, true, None, &NoProgress)
            .await
            .unwrap();
        assert_eq!(forced.indexed, 1);
    }

    #[tokio::test]
    async fn vanished_readme_drops_chunks() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let dir = tmp.path().join("repo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("README"), "plain readme").unwrap();
        let id = "github.com:acme/plain";

        assert_eq!(index_repo(&pool, id, &dir).await.unwrap(), IndexOutcome::Indexed);
        assert_eq!(search::chunk_count(&pool, Some(id)).await.unwrap(), 1);

        std::fs::remove_file(dir.join("README")).unwrap();
        assert_eq!(index_repo(&pool, id, &dir).await.unwrap(), IndexOutcome::NoReadme);
        assert_eq!(search::chunk_count(&pool, Some(id)).await.unwrap(), 0);
    }
}
