//! # clones
//!
//! A local-first manager for a directory of git clones.
//!
//! `clones` keeps a portable registry of repositories (`registry.jsonl`, meant
//! to be shared between machines), mirrors it into a per-machine SQLite
//! database, keeps every managed checkout cloned and fast-forwarded, and
//! indexes each repository's README for keyword, semantic, and hybrid search.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌────────────┐
//! │  Registry  │──▶│ Sync engine │──▶│  Checkouts │
//! │  (jsonl)   │   │ scan/adopt  │   │ host/owner │
//! └────────────┘   └──────┬──────┘   └─────┬──────┘
//!                         ▼                ▼
//!                   ┌──────────┐     ┌───────────┐
//!                   │  Mirror  │◀────│  README   │
//!                   │ (SQLite) │     │  ingest   │
//!                   └────┬─────┘     └───────────┘
//!                        ▼
//!                   ┌──────────┐
//!                   │  Search  │
//!                   │ FTS5+Vec │
//!                   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! clones add https://github.com/acme/widgets
//! clones sync
//! clones search -q "terminal ui"
//! clones rm acme/widgets --yes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Paths and `config.json` |
//! | [`atomic`] | Crash-safe JSON/JSONL file store |
//! | [`registry`] | Portable registry and tombstones |
//! | [`local_state`] | Per-machine sync timestamps |
//! | [`git_url`] | Clone URL parsing and repo ids |
//! | [`scan`] | Discovering checkouts under the clones root |
//! | [`git`] | Git subprocess runner |
//! | [`github`] | Stars and metadata from the GitHub API |
//! | [`concurrency`] | Bounded worker pool and cancellation |
//! | [`sync`] | The sync engine |
//! | [`manage`] | `add`, `rm` and `list` |
//! | [`mirror`] | Registry mirror in SQLite |
//! | [`chunk`] | README chunking |
//! | [`ingest`] | README indexing |
//! | [`search`] | BM25, vector, and hybrid search |
//! | [`embedding`] | OpenAI embeddings |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod atomic;
pub mod chunk;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod git;
pub mod git_url;
pub mod github;
pub mod ingest;
pub mod local_state;
pub mod manage;
pub mod migrate;
pub mod mirror;
pub mod models;
pub mod progress;
pub mod registry;
pub mod scan;
pub mod search;
pub mod sync;
