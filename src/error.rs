//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else flows through `anyhow::Result` with context attached.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the atomic file store.
///
/// A missing file is never an error (it materialises an empty default), so
/// the only outcomes a caller sees are I/O failures and corruption.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but could not be parsed. Surfaced to the user so a
    /// repair flow can decide whether to reset it.
    #[error("{path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
}

impl StoreError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// Errors from git subprocesses.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to execute git: {0}. Is git installed?")]
    Spawn(#[source] std::io::Error),

    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git {op} failed: {stderr}{}", hint_suffix(.hint))]
    Failed {
        op: String,
        stderr: String,
        hint: Option<&'static str>,
    },
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    match hint {
        Some(h) => format!(" (hint: {h})"),
        None => String::new(),
    }
}

/// Errors from the hosting provider API.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("GitHub token is invalid or expired (401)")]
    InvalidToken,

    #[error("GitHub API rate limit exceeded or access forbidden (403)")]
    RateLimited,

    #[error("GitHub API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub is not configured: {0}")]
    NotConfigured(&'static str),
}
