//! Git subprocess operations.
//!
//! Every git call goes through the [`GitRunner`] trait so the sync engine can
//! be exercised without a git binary or network. [`GitCli`] is the real
//! implementation; the operations below turn non-zero exits into
//! [`GitError::Failed`] with a remediation hint where one is known.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::GitError;
use crate::registry::{LfsMode, RegistryEntry, Submodules, UpdateStrategy};

/// Captured output of one git invocation.
#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run `git <args>` in `cwd` (or the process cwd when `None`).
    async fn run(&self, cwd: Option<&Path>, args: &[String]) -> Result<GitOutput, GitError>;
}

/// Runs the `git` binary found on `PATH`.
pub struct GitCli;

#[async_trait]
impl GitRunner for GitCli {
    async fn run(&self, cwd: Option<&Path>, args: &[String]) -> Result<GitOutput, GitError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        tracing::debug!(cwd = ?cwd, args = ?args, "git");
        let output = cmd.output().await.map_err(GitError::Spawn)?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Map well-known git failure text to a user-facing hint.
pub fn classify_git_failure(stderr: &str) -> Option<&'static str> {
    let s = stderr.to_lowercase();
    if s.contains("authentication failed")
        || s.contains("could not read username")
        || s.contains("permission denied (publickey)")
        || s.contains("invalid username or password")
    {
        Some("authentication failed; check your credentials or SSH keys")
    } else if s.contains("could not resolve host")
        || s.contains("network is unreachable")
        || s.contains("connection timed out")
        || s.contains("connection refused")
        || s.contains("unable to access")
    {
        Some("host unreachable; check your network connection")
    } else if s.contains("repository not found") || s.contains("does not appear to be a git repository") {
        Some("repository not found or access denied")
    } else if s.contains("not possible to fast-forward") || s.contains("diverg") {
        Some("local branch has diverged; resolve manually or use the hard-reset strategy")
    } else if s.contains("no upstream") || s.contains("no tracking information") {
        Some("no upstream branch is configured for the current branch")
    } else {
        None
    }
}

async fn run_checked(
    git: &dyn GitRunner,
    cwd: Option<&Path>,
    op: &str,
    args: &[&str],
) -> Result<GitOutput, GitError> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let output = git.run(cwd, &args).await?;
    if !output.success {
        let stderr = output.stderr.trim().to_string();
        return Err(GitError::Failed {
            op: op.to_string(),
            hint: classify_git_failure(&stderr),
            stderr,
        });
    }
    Ok(output)
}

/// URL of `remote`, or `None` when the remote does not exist.
pub async fn remote_url(
    git: &dyn GitRunner,
    repo_dir: &Path,
    remote: &str,
) -> Result<Option<String>, GitError> {
    let args = vec!["remote".to_string(), "get-url".to_string(), remote.to_string()];
    let output = git.run(Some(repo_dir), &args).await?;
    if !output.success {
        return Ok(None);
    }
    let url = output.stdout.trim();
    Ok((!url.is_empty()).then(|| url.to_string()))
}

pub async fn clone_repo(git: &dyn GitRunner, entry: &RegistryEntry, dest: &Path) -> Result<(), GitError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|source| GitError::Prepare {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let dest = dest.to_string_lossy().to_string();
    let mut args = vec!["clone", "--origin", entry.default_remote_name.as_str()];
    if entry.submodules == Submodules::Recursive {
        args.push("--recurse-submodules");
    }
    args.push("--");
    args.push(entry.clone_url.as_str());
    args.push(dest.as_str());
    run_checked(git, None, "clone", &args).await?;
    Ok(())
}

pub async fn fetch_prune(git: &dyn GitRunner, repo_dir: &Path, remote: &str) -> Result<(), GitError> {
    run_checked(git, Some(repo_dir), "fetch", &["fetch", "--prune", remote]).await?;
    Ok(())
}

pub async fn reset_hard_upstream(git: &dyn GitRunner, repo_dir: &Path) -> Result<(), GitError> {
    run_checked(git, Some(repo_dir), "reset", &["reset", "--hard", "@{upstream}"]).await?;
    Ok(())
}

pub async fn merge_ff_only(git: &dyn GitRunner, repo_dir: &Path) -> Result<(), GitError> {
    run_checked(git, Some(repo_dir), "merge", &["merge", "--ff-only", "@{upstream}"]).await?;
    Ok(())
}

pub async fn update_submodules(git: &dyn GitRunner, repo_dir: &Path) -> Result<(), GitError> {
    run_checked(
        git,
        Some(repo_dir),
        "submodule update",
        &["submodule", "update", "--init", "--recursive"],
    )
    .await?;
    Ok(())
}

/// Whether `.gitattributes` routes any path through the LFS filter.
pub fn uses_lfs(repo_dir: &Path) -> bool {
    std::fs::read_to_string(repo_dir.join(".gitattributes"))
        .map(|attrs| attrs.contains("filter=lfs"))
        .unwrap_or(false)
}

pub async fn lfs_pull(git: &dyn GitRunner, repo_dir: &Path) -> Result<(), GitError> {
    run_checked(git, Some(repo_dir), "lfs pull", &["lfs", "pull"]).await?;
    Ok(())
}

/// Working tree state from `git status --porcelain --branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoStatus {
    pub dirty: bool,
    pub detached: bool,
    pub has_upstream: bool,
}

impl RepoStatus {
    pub fn parse(porcelain: &str) -> Self {
        let mut status = RepoStatus {
            dirty: false,
            detached: false,
            has_upstream: false,
        };
        for line in porcelain.lines() {
            if let Some(branch) = line.strip_prefix("## ") {
                status.detached = branch.starts_with("HEAD (no branch)");
                status.has_upstream = !status.detached && branch.contains("...");
            } else if !line.trim().is_empty() {
                status.dirty = true;
            }
        }
        status
    }
}

pub async fn repo_status(git: &dyn GitRunner, repo_dir: &Path) -> Result<RepoStatus, GitError> {
    let args = ["status", "--porcelain", "--branch"];
    let output = run_checked(git, Some(repo_dir), "status", &args).await?;
    Ok(RepoStatus::parse(&output.stdout))
}

pub async fn is_dirty(git: &dyn GitRunner, repo_dir: &Path) -> Result<bool, GitError> {
    Ok(repo_status(git, repo_dir).await?.dirty)
}

/// Why an existing checkout must not be updated, if anything. Detached and
/// untracked branches are never touched; local changes only with `force`.
pub async fn preflight(
    git: &dyn GitRunner,
    repo_dir: &Path,
    force: bool,
) -> Result<Option<&'static str>, GitError> {
    let status = repo_status(git, repo_dir).await?;
    Ok(if status.detached {
        Some("detached HEAD")
    } else if !status.has_upstream {
        Some("no upstream tracking")
    } else if status.dirty && !force {
        Some("dirty working tree")
    } else {
        None
    })
}

/// What [`sync_repo`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoAction {
    Cloned,
    Updated,
    /// Left alone; the reason is shown to the user.
    Skipped(&'static str),
}

/// Clone a missing repository, or fetch and update an existing one
/// according to the entry's strategy, then handle submodules and LFS.
///
/// Existing checkouts go through [`preflight`] first, so local work is
/// never reset away unless `force` is set.
pub async fn sync_repo(
    git: &dyn GitRunner,
    entry: &RegistryEntry,
    repo_dir: &Path,
    force: bool,
) -> Result<RepoAction, GitError> {
    let action = if repo_dir.join(".git").exists() {
        if let Some(reason) = preflight(git, repo_dir, force).await? {
            return Ok(RepoAction::Skipped(reason));
        }
        fetch_prune(git, repo_dir, &entry.default_remote_name).await?;
        match entry.update_strategy {
            UpdateStrategy::HardReset => reset_hard_upstream(git, repo_dir).await?,
            UpdateStrategy::FfOnly => merge_ff_only(git, repo_dir).await?,
        }
        if entry.submodules == Submodules::Recursive {
            update_submodules(git, repo_dir).await?;
        }
        RepoAction::Updated
    } else {
        clone_repo(git, entry, repo_dir).await?;
        RepoAction::Cloned
    };

    let pull_lfs = match entry.lfs {
        LfsMode::Always => true,
        LfsMode::Auto => uses_lfs(repo_dir),
        LfsMode::Never => false,
    };
    if pull_lfs {
        lfs_pull(git, repo_dir).await?;
    }

    Ok(action)
}
