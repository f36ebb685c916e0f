//! Registry editing commands (`add`, `list`, `rm`), the `doctor` repair
//! flow for the persisted files and the `stars` status report.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::atomic::{self, LoadMode, Persisted};
use crate::config::{get_github_config, AppConfig, Paths};
use crate::db;
use crate::git_url::{normalize_repo_id, parse_git_url, split_repo_id};
use crate::github::{GitHubClient, HostApi, StarredRepo};
use crate::local_state::{load_local_state, save_local_state, LocalState};
use crate::mirror;
use crate::models::DbRepoRow;
use crate::registry::{load_registry, save_registry, EntrySource, Registry, RegistryEntry};
use crate::search;

/// Resolve `owner/repo` (or a full `host:owner/repo` id) to a registry id.
pub fn resolve_target(registry: &Registry, target: &str) -> Result<String> {
    let target = target.trim();
    if let Some(id) = normalize_repo_id(target).filter(|_| target.contains(':')) {
        if registry.get(&id).is_some() {
            return Ok(id);
        }
        bail!("{} is not in the registry", id);
    }

    let Some((owner, repo)) = target.split_once('/') else {
        bail!("expected <owner>/<repo>, got '{}'", target);
    };
    let matches = registry.find_by_owner_repo(owner, repo.trim_end_matches(".git"));
    match matches.as_slice() {
        [] => bail!("{} is not in the registry", target),
        [one] => Ok(one.id.clone()),
        many => {
            let ids: Vec<&str> = many.iter().map(|e| e.id.as_str()).collect();
            bail!(
                "{} is ambiguous; use one of: {}",
                target,
                ids.join(", ")
            )
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct RemoveOutcome {
    pub id: String,
    pub dir_removed: bool,
    pub db_row_removed: bool,
}

/// Remove an entry, tombstone it, prune local state, drop its mirror row and
/// index, and delete the checkout unless `keep_disk`.
pub async fn remove_repo(paths: &Paths, pool: &SqlitePool, id: &str, keep_disk: bool) -> Result<RemoveOutcome> {
    let mut registry = load_registry(paths, LoadMode::Repair)?.data;
    let Some(entry) = registry.remove_with_tombstone(id) else {
        bail!("{} is not in the registry", id);
    };

    let mut state = load_local_state(paths, LoadMode::Repair)?.data;
    state.prune(|other| other != id);

    let mut dir_removed = false;
    let dir = entry.local_path(&paths.clones_dir);
    if !keep_disk && dir.exists() {
        std::fs::remove_dir_all(&dir)
            .map_err(|e| anyhow::anyhow!("failed to remove {}: {}", dir.display(), e))?;
        dir_removed = true;
        // Drop an owner directory left empty.
        if let Some(owner_dir) = dir.parent() {
            let _ = std::fs::remove_dir(owner_dir);
        }
    }

    save_registry(paths, &registry)?;
    save_local_state(paths, &state)?;
    let db_row_removed = mirror::delete_repo(pool, id).await?;

    Ok(RemoveOutcome {
        id: id.to_string(),
        dir_removed,
        db_row_removed,
    })
}

fn confirm(prompt: &str) -> Result<bool> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{} [y/N] ", prompt)?;
    stdout.flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

pub async fn run_remove(paths: &Paths, target: &str, keep_disk: bool, yes: bool) -> Result<()> {
    let registry = load_registry(paths, LoadMode::ReadOnly)?.data;
    let id = resolve_target(&registry, target)?;

    if !yes {
        if !atty::is(atty::Stream::Stdin) {
            bail!("refusing to remove {} without --yes when not running interactively", id);
        }
        let what = if keep_disk {
            format!("Remove {} from the registry (keeping files)?", id)
        } else {
            format!("Remove {} and delete its checkout?", id)
        };
        if !confirm(&what)? {
            println!("Aborted.");
            return Ok(());
        }
    }

    let outcome = db::with_db(&paths.db_file(), |pool| async move {
        remove_repo(paths, &pool, &id, keep_disk).await
    })
    .await?;

    println!("removed {}", outcome.id);
    if outcome.dir_removed {
        println!("  deleted checkout");
    }
    println!("  tombstoned; it will not be re-adopted");
    Ok(())
}

/// Add a managed manual entry. Returns the new id.
pub fn add_repo(paths: &Paths, clone_url: &str, tags: &[String]) -> Result<String> {
    let Some(mut entry) = RegistryEntry::from_clone_url(clone_url, EntrySource::Manual, true) else {
        bail!("not a recognizable git URL: {}", clone_url);
    };
    let mut registry = load_registry(paths, LoadMode::Repair)?.data;

    if let Some(existing) = registry.get(&entry.id) {
        entry = existing.clone();
        entry.managed = true;
    }
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !entry.tags.iter().any(|t| t == tag) {
            entry.tags.push(tag.to_string());
        }
    }
    let id = entry.id.clone();
    registry.upsert(entry);
    save_registry(paths, &registry)?;
    Ok(id)
}

pub fn run_add(paths: &Paths, clone_url: &str, tags: &[String]) -> Result<()> {
    let id = add_repo(paths, clone_url, tags)?;
    println!("added {}", id);
    println!("  run `clones sync` to clone it");
    Ok(())
}

fn status_label(row: &DbRepoRow) -> &'static str {
    match (row.status_exists, row.status_is_dirty) {
        (Some(true), Some(true)) => "dirty",
        (Some(true), _) => "clean",
        (Some(false), _) if row.managed => "missing",
        (Some(false), _) => "not cloned",
        (None, _) => "unknown",
    }
}

/// Print the mirror, optionally ranked by a README query.
pub async fn run_list(paths: &Paths, filter: Option<&str>) -> Result<()> {
    let rows = db::with_db(&paths.db_file(), |pool| async move {
        let rows = mirror::list_repos(&pool).await?;
        let Some(query) = filter.filter(|q| !q.trim().is_empty()) else {
            return Ok(rows);
        };
        let ranking = search::rank_repos_by_query(&pool, query, rows.len().max(1)).await;
        let ordered = ranking
            .iter()
            .filter_map(|(id, _)| rows.iter().find(|r| &r.id == id).cloned())
            .collect();
        Ok(ordered)
    })
    .await?;

    if rows.is_empty() {
        println!("No repositories.");
        return Ok(());
    }
    for row in &rows {
        let description = row.description.as_deref().unwrap_or("");
        println!(
            "{:<40} {:<10} {}",
            format!("{}/{}", row.owner, row.repo),
            status_label(row),
            description
        );
    }
    Ok(())
}

/// What `doctor` did to one persisted file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileRepair {
    Created,
    /// A legacy `registry.json`/`registry.toml` was converted.
    Migrated,
    Unchanged,
    Normalized,
    /// The corrupt original was moved to `backup` and an empty file written.
    Reset { backup: PathBuf },
}

#[derive(Debug)]
pub struct FileCheck {
    pub label: &'static str,
    pub path: PathBuf,
    pub repair: FileRepair,
    pub issues: Vec<String>,
}

fn check_file<T: Persisted>(
    label: &'static str,
    path: &Path,
    confirm_reset: &mut dyn FnMut(&Path) -> Result<bool>,
) -> Result<FileCheck> {
    let done = |repair: FileRepair, issues: Vec<String>| FileCheck {
        label,
        path: path.to_path_buf(),
        repair,
        issues,
    };

    let Some(raw) = atomic::read_text(path)? else {
        atomic::write_atomic(path, &T::empty().serialize())?;
        return Ok(done(FileRepair::Created, Vec::new()));
    };

    match atomic::normalize_raw::<T>(path, &raw) {
        Ok(loaded) => {
            let canonical = loaded.data.serialize();
            if canonical == raw {
                return Ok(done(FileRepair::Unchanged, loaded.issues));
            }
            atomic::write_atomic(path, &canonical)?;
            Ok(done(FileRepair::Normalized, loaded.issues))
        }
        Err(e) if e.is_corrupt() => {
            if !confirm_reset(path)? {
                bail!("{}; not reset (rerun `clones doctor --yes` to reset it)", e);
            }
            let backup = backup_path(path);
            std::fs::rename(path, &backup)
                .with_context(|| format!("Failed to move {} aside", path.display()))?;
            atomic::write_atomic(path, &T::empty().serialize())?;
            Ok(done(FileRepair::Reset { backup }, vec![e.to_string()]))
        }
        Err(e) => Err(e.into()),
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}.corrupt-{}", name, Utc::now().format("%Y%m%dT%H%M%S")))
}

/// Create missing files, migrate a legacy registry, rewrite anything not in
/// canonical form, and reset corrupt files the caller agrees to lose.
pub fn doctor_files(
    paths: &Paths,
    confirm_reset: &mut dyn FnMut(&Path) -> Result<bool>,
) -> Result<Vec<FileCheck>> {
    let registry_path = paths.registry_file();
    let legacy = paths.legacy_registry_json().exists() || paths.legacy_registry_toml().exists();

    let registry = if !registry_path.exists() && legacy {
        let loaded = load_registry(paths, LoadMode::Repair)?;
        FileCheck {
            label: "registry",
            path: registry_path,
            repair: FileRepair::Migrated,
            issues: loaded.issues,
        }
    } else {
        check_file::<Registry>("registry", &registry_path, confirm_reset)?
    };
    let state = check_file::<LocalState>("local state", &paths.local_state_file(), confirm_reset)?;
    Ok(vec![registry, state])
}

/// The `doctor` command: repair both files, then re-mirror the registry.
/// A database failure is reported but does not fail the command.
pub async fn run_doctor(paths: &Paths, yes: bool) -> Result<()> {
    println!("doctor");
    let interactive = atty::is(atty::Stream::Stdin);
    let mut confirm_reset = |path: &Path| -> Result<bool> {
        if yes {
            return Ok(true);
        }
        if !interactive {
            return Ok(false);
        }
        confirm(&format!(
            "{} is corrupt. Reset it to empty? Existing entries will be lost (a backup is kept).",
            path.display()
        ))
    };

    for check in doctor_files(paths, &mut confirm_reset)? {
        let what = match &check.repair {
            FileRepair::Created => "created".to_string(),
            FileRepair::Migrated => "migrated".to_string(),
            FileRepair::Unchanged => "ok".to_string(),
            FileRepair::Normalized => "normalized".to_string(),
            FileRepair::Reset { backup } => format!("reset (backup: {})", backup.display()),
        };
        println!("  {} {}: {}", check.label, what, check.path.display());
        for issue in &check.issues {
            println!("    - {}", issue);
        }
    }

    let registry = load_registry(paths, LoadMode::ReadOnly)?.data;
    let mirrored = db::with_db(&paths.db_file(), |pool| async move {
        mirror::sync_registry(&pool, &registry).await
    })
    .await;
    match mirrored {
        Ok(summary) => println!(
            "  database: {} mirrored, {} removed",
            summary.upserted,
            summary.removed.len()
        ),
        Err(e) => {
            tracing::warn!(error = %e, "database not updated");
            println!("  database not updated: {:#}", e);
        }
    }
    println!("ok");
    Ok(())
}

/// Starred repositories compared with the registry.
#[derive(Debug, Default, PartialEq)]
pub struct StarReport {
    pub stars: usize,
    pub registry_total: usize,
    pub registry_github: usize,
    /// Starred but not registered; the next sync imports these.
    pub missing: Vec<String>,
    /// Starred but tombstoned, so never imported.
    pub tombstoned: Vec<String>,
    /// Registered GitHub repositories that are not starred.
    pub unstarred: Vec<String>,
}

pub fn compare_stars(stars: &[StarredRepo], registry: &Registry) -> StarReport {
    let starred: Vec<String> = stars
        .iter()
        .filter_map(|s| parse_git_url(&s.clone_url))
        .filter(|p| p.host == "github.com")
        .map(|p| p.id())
        .collect();
    let starred_set: HashSet<&str> = starred.iter().map(String::as_str).collect();

    let mut report = StarReport {
        stars: stars.len(),
        registry_total: registry.repos.len(),
        ..StarReport::default()
    };
    for id in &starred {
        if registry.get(id).is_some() {
            continue;
        }
        if registry.is_tombstoned(id) {
            report.tombstoned.push(id.clone());
        } else {
            report.missing.push(id.clone());
        }
    }
    for entry in registry.repos.iter().filter(|e| e.host == "github.com") {
        report.registry_github += 1;
        if !starred_set.contains(entry.id.as_str()) {
            report.unstarred.push(entry.id.clone());
        }
    }
    report
}

const STAR_LIST_LIMIT: usize = 20;

fn print_ids(ids: &[String], marker: &str) {
    for id in ids.iter().take(STAR_LIST_LIMIT) {
        let name = split_repo_id(id)
            .map(|(_, owner, repo)| format!("{}/{}", owner, repo))
            .unwrap_or_else(|| id.clone());
        println!("    {} {}", marker, name);
    }
    if ids.len() > STAR_LIST_LIMIT {
        println!("    ... and {} more", ids.len() - STAR_LIST_LIMIT);
    }
}

/// The `stars` command.
pub async fn run_stars(paths: &Paths, config: &AppConfig) -> Result<()> {
    let github = get_github_config(config);
    if !github.is_authenticated() {
        println!("Not authenticated with GitHub");
        println!("  set github.token in {}", paths.config_file().display());
        return Ok(());
    }

    let registry = load_registry(paths, LoadMode::ReadOnly)?.data;
    let client = GitHubClient::new(github)?;
    let stars = client.starred_repos().await?;
    let report = compare_stars(&stars, &registry);

    println!("stars");
    println!("  GitHub stars: {}", report.stars);
    println!(
        "  registry repos: {} ({} from GitHub)",
        report.registry_total, report.registry_github
    );
    if report.missing.is_empty() {
        println!("  all starred repos are in the registry");
    } else {
        println!("  starred, not in registry: {}", report.missing.len());
        print_ids(&report.missing, "*");
        println!("  run `clones sync` to add them");
    }
    if !report.tombstoned.is_empty() {
        println!("  starred but removed (tombstoned): {}", report.tombstoned.len());
        print_ids(&report.tombstoned, "x");
    }
    if report.unstarred.is_empty() {
        println!("  all GitHub registry repos are starred");
    } else {
        println!("  in registry, not starred: {}", report.unstarred.len());
        print_ids(&report.unstarred, "o");
    }
    println!(
        "  in sync: {}/{}",
        report.registry_github - report.unstarred.len(),
        report.registry_github
    );
    if github.sync_stars {
        println!("  auto-import: enabled (stars are imported during `clones sync`)");
    } else {
        println!("  auto-import: disabled (set github.syncStars in config.json)");
    }
    Ok(())
}
