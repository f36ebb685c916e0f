//! Clone URL parsing and repository ids.
//!
//! A repository id is `host:owner/repo`, all lowercased. It is derived from
//! the clone URL, never from the directory a clone happens to live in.

use crate::scan::is_safe_path_segment;

/// Host, owner and repository name extracted from a clone URL (lowercased).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedGitUrl {
    pub host: String,
    pub owner: String,
    pub repo: String,
}

impl ParsedGitUrl {
    pub fn id(&self) -> String {
        make_repo_id(&self.host, &self.owner, &self.repo)
    }
}

/// Parse the common clone URL shapes:
///
/// - `https://github.com/owner/repo(.git)`
/// - `ssh://git@github.com[:22]/owner/repo(.git)`
/// - `git://github.com/owner/repo(.git)`
/// - `git@github.com:owner/repo(.git)`
///
/// Returns `None` for anything else, including URLs whose owner or repo
/// would not be a safe single path segment.
pub fn parse_git_url(url: &str) -> Option<ParsedGitUrl> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let (host, path) = if let Some((_, rest)) = url.split_once("://") {
        let (authority, path) = rest.split_once('/')?;
        let host = authority.rsplit('@').next()?;
        let host = host.split(':').next()?;
        (host, path)
    } else {
        // scp-like syntax: [user@]host:owner/repo
        let (authority, path) = url.split_once(':')?;
        if authority.contains('/') {
            return None;
        }
        let host = authority.rsplit('@').next()?;
        (host, path)
    };

    let path = path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.split('/');
    let owner = parts.next()?;
    let repo = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    if host.is_empty() || !is_safe_path_segment(owner) || !is_safe_path_segment(repo) {
        return None;
    }

    Some(ParsedGitUrl {
        host: host.to_lowercase(),
        owner: owner.to_lowercase(),
        repo: repo.to_lowercase(),
    })
}

pub fn make_repo_id(host: &str, owner: &str, repo: &str) -> String {
    format!(
        "{}:{}/{}",
        host.to_lowercase(),
        owner.to_lowercase(),
        repo.to_lowercase()
    )
}

/// Split `host:owner/repo` back into its parts.
pub fn split_repo_id(id: &str) -> Option<(&str, &str, &str)> {
    let (host, rest) = id.split_once(':')?;
    let (owner, repo) = rest.split_once('/')?;
    if host.is_empty() || !is_safe_path_segment(owner) || !is_safe_path_segment(repo) {
        return None;
    }
    Some((host, owner, repo))
}

/// Normalize a user-supplied id; `None` if it is not of the `host:owner/repo` shape.
pub fn normalize_repo_id(id: &str) -> Option<String> {
    let lowered = id.trim().to_lowercase();
    split_repo_id(&lowered).map(|(h, o, r)| make_repo_id(h, o, r))
}
