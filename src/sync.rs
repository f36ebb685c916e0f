//! Sync reconciliation engine.
//!
//! One invocation runs these phases in order:
//!
//! 1. **Star import** (optional): add starred repositories as unmanaged
//!    entries. Failure degrades to a warning.
//! 2. **Scan**: walk the clones root and adopt checkouts whose remote matches
//!    their `<owner>/<repo>` directory. Checkouts whose remote is tombstoned
//!    are scheduled for removal.
//! 3. **Tombstone enforcement**: delete scheduled checkouts (unless `keep`,
//!    or the tree is dirty and `force` is off) and make sure no tombstoned
//!    id survives in `repos`.
//! 4. **Per-repo sync**: clone or update every managed entry inside the
//!    bounded pool. Dirty, detached and untracked checkouts are skipped.
//!    Failures are collected per repository.
//! 5. **Metadata refresh** (optional): pull description and topics from the
//!    host.
//! 6. **Commit**: write the registry and local state atomically.
//!
//! With `dry_run` the registry and local state are loaded read-only, only
//! read-only git commands (`remote get-url`, `status`) run, nothing is
//! deleted and nothing touches the network.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::atomic::LoadMode;
use crate::concurrency::{install_handlers, run_with_concurrency, CancelSignal};
use crate::config::{get_github_config, AppConfig, GitHubConfig, Paths};
use crate::db;
use crate::embedding::OpenAiEmbedder;
use crate::error::HostError;
use crate::git::{self, GitCli, GitRunner, RepoAction};
use crate::git_url::{parse_git_url, split_repo_id};
use crate::github::{GitHubClient, HostApi, RepoMetadata};
use crate::ingest::{self, IndexStats};
use crate::local_state::{load_local_state, now_rfc3339, save_local_state};
use crate::mirror::{self, MirrorSummary};
use crate::progress::{ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::registry::{load_registry, save_registry, EntrySource, Registry, RegistryEntry};
use crate::scan::{is_nested_repo, scan_clones_dir, SkippedPath};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub refresh: bool,
    /// Keep tombstoned checkouts on disk.
    pub keep: bool,
    /// Update or delete checkouts even when they have local changes.
    pub force: bool,
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            refresh: false,
            keep: false,
            force: false,
            concurrency: crate::concurrency::DEFAULT_CONCURRENCY,
        }
    }
}

/// Collaborators for one sync run.
pub struct SyncContext {
    pub paths: Paths,
    pub git: Arc<dyn GitRunner>,
    pub host: Option<Arc<dyn HostApi>>,
    pub github: GitHubConfig,
    pub cancel: CancelSignal,
    pub progress: Box<dyn SyncProgressReporter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepoFailure {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub stars_added: Vec<String>,
    pub adopted: Vec<String>,
    /// Checkouts deleted because their id is tombstoned (would be, on a dry run).
    pub removed_dirs: Vec<PathBuf>,
    /// Tombstoned checkouts left alone because of `keep`.
    pub kept_dirs: Vec<PathBuf>,
    pub skipped: Vec<SkippedPath>,
    pub cloned: Vec<String>,
    pub updated: Vec<String>,
    pub failed: Vec<RepoFailure>,
    /// Managed entries never started because the run was cancelled.
    pub not_started: usize,
    pub refreshed: Vec<String>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
    pub registry_written: bool,
    pub local_state_written: bool,
}

impl SyncReport {
    fn warn(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Run every phase and return the report plus the registry as committed.
pub async fn run_sync(ctx: &SyncContext, opts: &SyncOptions) -> Result<(SyncReport, Registry)> {
    let mode = if opts.dry_run {
        LoadMode::ReadOnly
    } else {
        LoadMode::Repair
    };
    let mut report = SyncReport::default();

    let loaded = load_registry(&ctx.paths, mode)?;
    for issue in &loaded.issues {
        report.warn(format!("registry: {}", issue));
    }
    let mut registry = loaded.data;

    let loaded_state = load_local_state(&ctx.paths, mode)?;
    for issue in &loaded_state.issues {
        report.warn(format!("local state: {}", issue));
    }
    let mut local_state = loaded_state.data;

    import_stars(ctx, opts, &mut registry, &mut report).await;

    let doomed = scan_and_adopt(ctx, &mut registry, &mut report).await;

    enforce_tombstones(ctx, opts, &mut registry, doomed, &mut report).await;

    let synced = sync_managed(ctx, opts, &registry, &mut report).await;
    let now = now_rfc3339();
    for id in &synced {
        local_state.mark_synced(id, &now);
    }

    if opts.refresh {
        refresh_metadata(ctx, opts, &mut registry, &mut report).await;
    }

    report.cancelled = ctx.cancel.is_cancelled();

    if !opts.dry_run {
        let pruned = local_state.prune(|id| registry.get(id).is_some());
        if pruned > 0 {
            tracing::debug!(pruned, "pruned local state");
        }
        local_state.last_sync_run = Some(now);
        report.registry_written = save_registry(&ctx.paths, &registry)?;
        report.local_state_written = save_local_state(&ctx.paths, &local_state)?;
    }

    Ok((report, registry))
}

async fn import_stars(
    ctx: &SyncContext,
    opts: &SyncOptions,
    registry: &mut Registry,
    report: &mut SyncReport,
) {
    if !(ctx.github.sync_stars && ctx.github.is_authenticated()) {
        return;
    }
    let Some(host) = &ctx.host else {
        return;
    };
    if opts.dry_run {
        tracing::info!("dry run: skipping star import");
        return;
    }

    let stars = match host.starred_repos().await {
        Ok(stars) => stars,
        Err(e) => {
            report.warn(format!("Phase 0 failed: star import skipped ({})", e));
            return;
        }
    };

    for star in stars {
        let Some(mut entry) = RegistryEntry::from_clone_url(&star.clone_url, EntrySource::GithubStar, false)
        else {
            tracing::debug!(url = %star.clone_url, "ignoring star with unparseable clone URL");
            continue;
        };
        if registry.is_tombstoned(&entry.id) || registry.get(&entry.id).is_some() {
            continue;
        }
        entry.description = star.description.filter(|d| !d.trim().is_empty());
        entry.tags = dedup_tags(star.topics);
        entry.starred_at = star.starred_at;
        report.stars_added.push(entry.id.clone());
        registry.upsert(entry);
    }
}

/// Scan the clones root, adopt matching checkouts and return the checkouts
/// whose remote is tombstoned.
async fn scan_and_adopt(
    ctx: &SyncContext,
    registry: &mut Registry,
    report: &mut SyncReport,
) -> Vec<(String, PathBuf)> {
    let root = &ctx.paths.clones_dir;
    ctx.progress.report(SyncProgressEvent::Scanning {
        root: root.display().to_string(),
    });

    let scan = scan_clones_dir(root);
    report.skipped.extend(scan.skipped);
    let mut doomed = Vec::new();

    for found in scan.discovered {
        let path = found.local_path;
        if is_nested_repo(&path, root) {
            report.skipped.push(skipped(&path, "Nested repository"));
            continue;
        }

        let remote_name = registry
            .find_by_owner_repo(&found.owner, &found.repo)
            .first()
            .map(|e| e.default_remote_name.clone())
            .unwrap_or_else(|| "origin".to_string());
        let url = match git::remote_url(ctx.git.as_ref(), &path, &remote_name).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                report.skipped.push(skipped(&path, &format!("No '{}' remote", remote_name)));
                continue;
            }
            Err(e) => {
                report.skipped.push(skipped(&path, &e.to_string()));
                continue;
            }
        };
        let Some(parsed) = parse_git_url(&url) else {
            report.skipped.push(skipped(&path, &format!("Unrecognized remote URL: {}", url)));
            continue;
        };
        let id = parsed.id();

        // A checkout only speaks for the id its directory names.
        if parsed.owner != found.owner.to_lowercase() || parsed.repo != found.repo.to_lowercase() {
            report.skipped.push(skipped(
                &path,
                &format!("Remote {}/{} does not match directory", parsed.owner, parsed.repo),
            ));
            continue;
        }

        if registry.is_tombstoned(&id) {
            doomed.push((id, path));
            continue;
        }

        match registry.get_mut(&id) {
            Some(entry) if entry.managed => {}
            Some(entry) => {
                entry.managed = true;
                report.adopted.push(id);
            }
            None => {
                if let Some(entry) = RegistryEntry::from_clone_url(&url, EntrySource::Manual, true) {
                    report.adopted.push(entry.id.clone());
                    registry.upsert(entry);
                }
            }
        }
    }

    doomed
}

fn skipped(path: &Path, reason: &str) -> SkippedPath {
    SkippedPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

async fn enforce_tombstones(
    ctx: &SyncContext,
    opts: &SyncOptions,
    registry: &mut Registry,
    doomed: Vec<(String, PathBuf)>,
    report: &mut SyncReport,
) {
    for id in registry.drop_tombstoned() {
        tracing::debug!(%id, "dropped tombstoned entry");
    }

    for (id, path) in doomed {
        if opts.keep {
            tracing::info!(%id, path = %path.display(), "keeping tombstoned checkout");
            report.kept_dirs.push(path);
            continue;
        }
        if !opts.force {
            match git::is_dirty(ctx.git.as_ref(), &path).await {
                Ok(false) => {}
                Ok(true) => {
                    report.skipped.push(skipped(&path, "dirty working tree"));
                    continue;
                }
                Err(e) => {
                    report.skipped.push(skipped(&path, &format!("could not read status: {}", e)));
                    continue;
                }
            }
        }
        if opts.dry_run {
            report.removed_dirs.push(path);
        } else {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!(%id, path = %path.display(), "removed tombstoned checkout");
                    report.removed_dirs.push(path);
                }
                Err(e) => report.warn(format!("failed to remove {}: {}", path.display(), e)),
            }
        }
    }
}

/// Clone or update every managed entry. Returns the ids that succeeded.
async fn sync_managed(
    ctx: &SyncContext,
    opts: &SyncOptions,
    registry: &Registry,
    report: &mut SyncReport,
) -> Vec<String> {
    let work: Vec<(RegistryEntry, PathBuf)> = registry
        .repos
        .iter()
        .filter(|e| e.managed && !registry.is_tombstoned(&e.id))
        .map(|e| (e.clone(), e.local_path(&ctx.paths.clones_dir)))
        .collect();

    if opts.dry_run {
        for (entry, path) in work {
            if !path.join(".git").exists() {
                report.cloned.push(entry.id);
                continue;
            }
            match git::preflight(ctx.git.as_ref(), &path, opts.force).await {
                Ok(None) => report.updated.push(entry.id),
                Ok(Some(reason)) => report.skipped.push(skipped(&path, reason)),
                Err(e) => report.failed.push(RepoFailure {
                    id: entry.id,
                    message: e.to_string(),
                }),
            }
        }
        return Vec::new();
    }

    let total = work.len() as u64;
    let git = Arc::clone(&ctx.git);
    let force = opts.force;
    let mut results = run_with_concurrency(work, opts.concurrency, ctx.cancel.clone(), move |(entry, path)| {
        let git = Arc::clone(&git);
        async move {
            let result = git::sync_repo(git.as_ref(), &entry, &path, force).await;
            (entry.id, path, result)
        }
    });

    let mut synced = Vec::new();
    let mut done = 0u64;
    while let Some((id, path, result)) = results.recv().await {
        done += 1;
        let ok = result.is_ok();
        let mut fresh = ok;
        match result {
            Ok(RepoAction::Cloned) => report.cloned.push(id.clone()),
            Ok(RepoAction::Updated) => report.updated.push(id.clone()),
            Ok(RepoAction::Skipped(reason)) => {
                tracing::info!(repo = %id, reason, "left checkout alone");
                report.skipped.push(skipped(&path, reason));
                fresh = false;
            }
            Err(e) => {
                tracing::warn!(repo = %id, error = %e, "sync failed");
                report.failed.push(RepoFailure {
                    id: id.clone(),
                    message: e.to_string(),
                });
            }
        }
        ctx.progress.report(SyncProgressEvent::Syncing {
            n: done,
            total,
            repo: id.clone(),
            ok,
        });
        if fresh {
            synced.push(id);
        }
    }

    report.not_started = (total - done) as usize;
    synced
}

async fn refresh_metadata(
    ctx: &SyncContext,
    opts: &SyncOptions,
    registry: &mut Registry,
    report: &mut SyncReport,
) {
    if opts.dry_run {
        tracing::info!("dry run: skipping metadata refresh");
        return;
    }
    let Some(host) = ctx.host.clone() else {
        report.warn("metadata refresh needs GitHub access; skipped".to_string());
        return;
    };

    let targets: Vec<(String, String, String)> = registry
        .repos
        .iter()
        .filter(|e| e.host == "github.com")
        .map(|e| (e.id.clone(), e.owner.clone(), e.repo.clone()))
        .collect();

    let mut results = run_with_concurrency(targets, opts.concurrency, ctx.cancel.clone(), move |(id, owner, repo)| {
        let host = Arc::clone(&host);
        async move {
            let result = host.repo_metadata(&owner, &repo).await;
            (id, result)
        }
    });

    let mut access_error: Option<HostError> = None;
    while let Some((id, result)) = results.recv().await {
        match result {
            Ok(meta) => {
                if let Some(entry) = registry.get_mut(&id) {
                    if apply_metadata(entry, meta) {
                        report.refreshed.push(id);
                    }
                }
            }
            Err(e @ (HostError::InvalidToken | HostError::RateLimited)) => {
                access_error.get_or_insert(e);
            }
            Err(e) => tracing::warn!(repo = %id, error = %e, "metadata refresh failed"),
        }
    }

    if let Some(e) = access_error {
        report.warn(format!("metadata refresh incomplete: {}", e));
    }
}

/// Merge host metadata into an entry. Topics are added to existing tags so
/// hand-written tags survive. Returns whether anything changed.
fn apply_metadata(entry: &mut RegistryEntry, meta: RepoMetadata) -> bool {
    let mut changed = false;
    if meta.description.is_some() && meta.description != entry.description {
        entry.description = meta.description;
        changed = true;
    }
    let mut tags = entry.tags.clone();
    tags.extend(meta.topics);
    let tags = dedup_tags(tags);
    if tags != entry.tags {
        entry.tags = tags;
        changed = true;
    }
    changed
}

fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct DatabaseRefresh {
    pub mirror: MirrorSummary,
    pub index: IndexStats,
}

/// Post-sync bookkeeping: mirror the registry, record on-disk status and
/// index changed READMEs.
pub async fn refresh_database(
    pool: &SqlitePool,
    registry: &Registry,
    clones_dir: &Path,
    git: Arc<dyn GitRunner>,
    concurrency: usize,
    embedder: Option<&OpenAiEmbedder>,
    reporter: &dyn SyncProgressReporter,
) -> Result<DatabaseRefresh> {
    let mirror = mirror::sync_registry(pool, registry).await?;

    let checks: Vec<(String, PathBuf)> = registry
        .repos
        .iter()
        .map(|e| (e.id.clone(), e.local_path(clones_dir)))
        .collect();
    let mut statuses = run_with_concurrency(checks, concurrency, CancelSignal::new(), move |(id, path)| {
        let git = Arc::clone(&git);
        async move {
            let exists = path.join(".git").exists();
            let dirty = if exists {
                git::is_dirty(git.as_ref(), &path).await.ok()
            } else {
                None
            };
            (id, exists, dirty)
        }
    });
    let checked_at = now_rfc3339();
    while let Some((id, exists, dirty)) = statuses.recv().await {
        mirror::update_status(pool, &id, exists, dirty, &checked_at).await?;
    }

    let index = ingest::index_all(pool, registry, clones_dir, false, embedder, reporter).await?;
    Ok(DatabaseRefresh { mirror, index })
}

/// The `sync` command: run the engine with real git and GitHub clients, then
/// bring `clones.db` up to date unless this is a dry run.
pub async fn run_sync_command(
    paths: &Paths,
    config: &AppConfig,
    opts: &SyncOptions,
    progress: ProgressMode,
) -> Result<()> {
    let github = get_github_config(config).clone();
    let host: Option<Arc<dyn HostApi>> = if github.is_authenticated() {
        Some(Arc::new(GitHubClient::new(&github)?))
    } else {
        None
    };
    let git: Arc<dyn GitRunner> = Arc::new(GitCli);
    let ctx = SyncContext {
        paths: paths.clone(),
        git: Arc::clone(&git),
        host,
        github,
        cancel: CancelSignal::new(),
        progress: progress.reporter(),
    };

    let (report, registry) = {
        let _guard = install_handlers(&ctx.cancel);
        run_sync(&ctx, opts).await?
    };
    print_report(&report, opts.dry_run);

    if opts.dry_run || report.cancelled {
        return Ok(());
    }

    let embedder = if config.embedding.is_enabled() {
        match OpenAiEmbedder::new(&config.embedding) {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, "embeddings disabled for this run");
                None
            }
        }
    } else {
        None
    };

    let reporter = ctx.progress;
    let refreshed = db::with_db(&paths.db_file(), |pool| async move {
        refresh_database(
            &pool,
            &registry,
            &paths.clones_dir,
            git,
            opts.concurrency,
            embedder.as_ref(),
            reporter.as_ref(),
        )
        .await
    })
    .await?;

    if !refreshed.mirror.removed.is_empty() {
        println!("  database rows removed: {}", refreshed.mirror.removed.len());
    }
    let index = &refreshed.index;
    println!(
        "  readmes indexed: {} (unchanged {}, none {})",
        index.indexed, index.unchanged, index.no_readme
    );
    if config.embedding.is_enabled() {
        println!("  chunks embedded: {}", index.embedded);
    }
    println!("ok");
    Ok(())
}

/// Print the run summary to stdout.
pub fn print_report(report: &SyncReport, dry_run: bool) {
    let tag = if dry_run { " (dry-run)" } else { "" };
    println!("sync{}", tag);
    if !report.stars_added.is_empty() {
        println!("  stars imported: {}", report.stars_added.len());
    }
    for id in &report.adopted {
        println!("  adopted: {}", display_id(id));
    }
    for path in &report.removed_dirs {
        let verb = if dry_run { "would remove" } else { "removed" };
        println!("  {}: {}", verb, path.display());
    }
    for path in &report.kept_dirs {
        println!("  kept (tombstoned): {}", path.display());
    }
    for skip in &report.skipped {
        println!("  skipped: {} ({})", skip.path.display(), skip.reason);
    }
    if dry_run {
        println!("  would clone: {}", report.cloned.len());
        println!("  would update: {}", report.updated.len());
    } else {
        println!("  cloned: {}", report.cloned.len());
        println!("  updated: {}", report.updated.len());
    }
    if !report.refreshed.is_empty() {
        println!("  metadata refreshed: {}", report.refreshed.len());
    }
    if !report.failed.is_empty() {
        println!("  failed: {}", report.failed.len());
        for f in &report.failed {
            println!("    {}: {}", display_id(&f.id), f.message);
        }
    }
    if report.cancelled {
        println!("  cancelled: {} not started", report.not_started);
    }
    if !report.warnings.is_empty() {
        println!("  warnings: {}", report.warnings.len());
    }
}

fn display_id(id: &str) -> String {
    split_repo_id(id)
        .map(|(host, owner, repo)| format!("{}/{} ({})", owner, repo, host))
        .unwrap_or_else(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> RegistryEntry {
        RegistryEntry::from_clone_url("https://github.com/acme/widgets", EntrySource::Manual, true).unwrap()
    }

    #[test]
    fn metadata_merges_topics_into_tags() {
        let mut e = entry();
        e.tags = vec!["mine".to_string()];
        let changed = apply_metadata(
            &mut e,
            RepoMetadata {
                description: Some("Widgets".to_string()),
                topics: vec!["rust".to_string(), "mine".to_string()],
            },
        );
        assert!(changed);
        assert_eq!(e.tags, vec!["mine".to_string(), "rust".to_string()]);
        assert_eq!(e.description.as_deref(), Some("Widgets"));

        assert!(!apply_metadata(
            &mut e,
            RepoMetadata {
                description: None,
                topics: vec!["rust".to_string()],
            }
        ));
        assert_eq!(e.description.as_deref(), Some("Widgets"));
    }

    #[test]
    fn tags_are_trimmed_and_deduped() {
        assert_eq!(
            dedup_tags(vec![" a ".into(), "a".into(), "".into(), "b".into()]),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn ids_display_as_owner_repo() {
        assert_eq!(display_id("github.com:acme/widgets"), "acme/widgets (github.com)");
        assert_eq!(display_id("weird"), "weird");
    }
}
