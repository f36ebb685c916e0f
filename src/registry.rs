//! The shared registry of desired repositories.
//!
//! The registry is the portable source of truth: it lives in the clones root
//! (`registry.jsonl`) so it can travel between machines, and everything else
//! (the SQLite mirror, local state) is derived from it.
//!
//! # File layout
//!
//! ```text
//! {"kind":"meta","version":1}
//! {"kind":"repo","id":"github.com:acme/widgets","host":"github.com",...}
//! {"kind":"tombstone","id":"github.com:acme/old-thing"}
//! ```
//!
//! Entries are sorted by id and tombstones are sorted, so the file diffs
//! cleanly under version control.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::atomic::{self, LoadMode, Loaded, Persisted};
use crate::config::Paths;
use crate::error::StoreError;
use crate::git_url::{normalize_repo_id, parse_git_url};

pub const REGISTRY_VERSION: u64 = 1;

/// How an existing clone is brought up to date with its upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    #[default]
    HardReset,
    FfOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Submodules {
    #[default]
    None,
    Recursive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LfsMode {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntrySource {
    #[default]
    Manual,
    GithubStar,
}

macro_rules! kebab_enum_text {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(Value::String(s)) => f.write_str(&s),
                    _ => Err(fmt::Error),
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                serde_json::from_value(Value::String(s.trim().to_lowercase()))
                    .map_err(|_| format!("invalid value '{}'", s))
            }
        }
    };
}

kebab_enum_text!(UpdateStrategy);
kebab_enum_text!(Submodules);
kebab_enum_text!(LfsMode);
kebab_enum_text!(EntrySource);

/// One desired repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub id: String,
    pub host: String,
    pub owner: String,
    pub repo: String,
    pub clone_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub default_remote_name: String,
    pub update_strategy: UpdateStrategy,
    pub submodules: Submodules,
    pub lfs: LfsMode,
    pub source: EntrySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starred_at: Option<String>,
    /// `true` once the repository has actually been cloned on some machine.
    pub managed: bool,
}

impl RegistryEntry {
    /// Build a fresh entry from a clone URL with default behavior knobs.
    pub fn from_clone_url(clone_url: &str, source: EntrySource, managed: bool) -> Option<Self> {
        let parsed = parse_git_url(clone_url)?;
        Some(Self {
            id: parsed.id(),
            host: parsed.host,
            owner: parsed.owner,
            repo: parsed.repo,
            clone_url: clone_url.trim().to_string(),
            description: None,
            tags: Vec::new(),
            default_remote_name: "origin".to_string(),
            update_strategy: UpdateStrategy::default(),
            submodules: Submodules::default(),
            lfs: LfsMode::default(),
            source,
            starred_at: None,
            managed,
        })
    }

    /// Where this repository lives under the clones root (`<root>/<owner>/<repo>`).
    pub fn local_path(&self, clones_dir: &Path) -> PathBuf {
        clones_dir.join(&self.owner).join(&self.repo)
    }
}

/// The desired-state document.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    pub version: u64,
    pub repos: Vec<RegistryEntry>,
    pub tombstones: Vec<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            repos: Vec::new(),
            tombstones: Vec::new(),
        }
    }
}

impl Registry {
    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.repos.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RegistryEntry> {
        self.repos.iter_mut().find(|e| e.id == id)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.iter().any(|t| t == id)
    }

    /// Entries whose owner/repo match, across all hosts.
    pub fn find_by_owner_repo(&self, owner: &str, repo: &str) -> Vec<&RegistryEntry> {
        let owner = owner.to_lowercase();
        let repo = repo.to_lowercase();
        self.repos
            .iter()
            .filter(|e| e.owner == owner && e.repo == repo)
            .collect()
    }

    /// Insert or replace an entry; clears a tombstone with the same id.
    pub fn upsert(&mut self, entry: RegistryEntry) {
        self.tombstones.retain(|t| *t != entry.id);
        match self.get_mut(&entry.id) {
            Some(existing) => *existing = entry,
            None => self.repos.push(entry),
        }
        self.sort();
    }

    /// Remove an entry and record a tombstone so it is not re-adopted.
    pub fn remove_with_tombstone(&mut self, id: &str) -> Option<RegistryEntry> {
        let removed = self
            .repos
            .iter()
            .position(|e| e.id == id)
            .map(|idx| self.repos.remove(idx));
        if !self.is_tombstoned(id) {
            self.tombstones.push(id.to_string());
            self.tombstones.sort();
        }
        removed
    }

    /// Drop every entry that is tombstoned.
    pub fn drop_tombstoned(&mut self) -> Vec<String> {
        let tombstones: BTreeSet<&String> = self.tombstones.iter().collect();
        let mut dropped = Vec::new();
        self.repos.retain(|e| {
            let keep = !tombstones.contains(&e.id);
            if !keep {
                dropped.push(e.id.clone());
            }
            keep
        });
        dropped
    }

    fn sort(&mut self) {
        self.repos.sort_by(|a, b| a.id.cmp(&b.id));
        self.tombstones.sort();
    }
}

impl Persisted for Registry {
    fn empty() -> Self {
        Registry::default()
    }

    /// Assemble JSON lines into `{version, repos, tombstones}`. Records are
    /// tagged with `kind`; files written by older tools use `_type`.
    fn parse(raw: &str) -> Result<Value, String> {
        let mut version = Value::from(REGISTRY_VERSION);
        let mut repos = Vec::new();
        let mut tombstones = Vec::new();
        let mut unknown = Vec::new();

        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .map_err(|e| format!("line {}: {}", idx + 1, e))?;
            let Value::Object(mut obj) = value else {
                return Err(format!("line {}: expected a JSON object", idx + 1));
            };

            let kind = obj.remove("kind");
            let legacy_kind = obj.remove("_type");
            match kind.or(legacy_kind).as_ref().and_then(|k| k.as_str()) {
                Some("meta") => {
                    if let Some(v) = obj.remove("version") {
                        version = v;
                    }
                }
                Some("tombstone") => tombstones.push(obj.remove("id").unwrap_or(Value::Null)),
                Some("repo") => repos.push(Value::Object(obj)),
                None if obj.contains_key("cloneUrl") || obj.contains_key("clone_url") => {
                    repos.push(Value::Object(obj))
                }
                _ => unknown.push(Value::from(idx + 1)),
            }
        }

        Ok(json!({
            "version": version,
            "repos": repos,
            "tombstones": tombstones,
            "unknownLines": unknown,
        }))
    }

    fn normalize(raw: Value) -> (Self, Vec<String>) {
        normalize_registry(raw)
    }

    fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&json!({ "kind": "meta", "version": self.version }).to_string());
        out.push('\n');
        for entry in &self.repos {
            let mut obj = Map::new();
            obj.insert("kind".to_string(), Value::from("repo"));
            if let Ok(Value::Object(fields)) = serde_json::to_value(entry) {
                obj.extend(fields);
            }
            out.push_str(&Value::Object(obj).to_string());
            out.push('\n');
        }
        for id in &self.tombstones {
            out.push_str(&json!({ "kind": "tombstone", "id": id }).to_string());
            out.push('\n');
        }
        out
    }
}

/// Repair a loose registry value.
///
/// Guarantees on the result: ids are unique and lowercased, every entry's
/// host/owner/repo agree with its clone URL, tombstones are unique, and no id
/// is both an entry and a tombstone.
pub fn normalize_registry(raw: Value) -> (Registry, Vec<String>) {
    let mut issues = Vec::new();

    let version = raw
        .get("version")
        .and_then(parse_version)
        .unwrap_or_else(|| {
            issues.push("missing or invalid version; assuming 1".to_string());
            REGISTRY_VERSION
        });

    if let Some(lines) = raw.get("unknownLines").and_then(|v| v.as_array()) {
        for line in lines {
            issues.push(format!("line {}: unknown record kind, dropped", line));
        }
    }

    let mut entries: BTreeMap<String, RegistryEntry> = BTreeMap::new();
    for (idx, value) in raw
        .get("repos")
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
        .iter()
        .enumerate()
    {
        let Some(entry) = normalize_entry(value, idx, &mut issues) else {
            continue;
        };
        match entries.get_mut(&entry.id) {
            Some(existing) => {
                issues.push(format!("duplicate entry {} collapsed", entry.id));
                existing.managed |= entry.managed;
            }
            None => {
                entries.insert(entry.id.clone(), entry);
            }
        }
    }

    let mut tombstones = BTreeSet::new();
    for value in raw
        .get("tombstones")
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        let Some(id) = value.as_str().and_then(normalize_repo_id) else {
            issues.push(format!("invalid tombstone {} dropped", value));
            continue;
        };
        if entries.contains_key(&id) {
            issues.push(format!(
                "{} is both registered and tombstoned; keeping the entry",
                id
            ));
            continue;
        }
        if !tombstones.insert(id.clone()) {
            issues.push(format!("duplicate tombstone {} collapsed", id));
        }
    }

    let registry = Registry {
        version,
        repos: entries.into_values().collect(),
        tombstones: tombstones.into_iter().collect(),
    };
    (registry, issues)
}

/// A numeric version, or the major component of a semver string such as
/// `"1.0.0"`.
fn parse_version(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        let text = value.as_str()?.trim();
        text.split('.').next()?.parse().ok()
    })
}

fn normalize_entry(value: &Value, idx: usize, issues: &mut Vec<String>) -> Option<RegistryEntry> {
    let Some(obj) = value.as_object() else {
        issues.push(format!("repo #{}: not an object, dropped", idx));
        return None;
    };
    let field = |camel: &str, snake: &str| obj.get(camel).or_else(|| obj.get(snake));
    let text = |camel: &str, snake: &str| {
        field(camel, snake)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let Some(clone_url) = text("cloneUrl", "clone_url") else {
        issues.push(format!("repo #{}: missing cloneUrl, dropped", idx));
        return None;
    };
    let Some(parsed) = parse_git_url(&clone_url) else {
        issues.push(format!(
            "repo #{}: unparseable cloneUrl '{}', dropped",
            idx, clone_url
        ));
        return None;
    };
    let id = parsed.id();
    if let Some(stated) = text("id", "id") {
        if stated.to_lowercase() != id {
            issues.push(format!("{}: id '{}' rewritten from cloneUrl", id, stated));
        }
    }

    fn knob<T: FromStr + Default>(
        raw: Option<&Value>,
        id: &str,
        name: &str,
        issues: &mut Vec<String>,
    ) -> T {
        match raw {
            None | Some(Value::Null) => T::default(),
            Some(v) => match v.as_str().and_then(|s| s.parse().ok()) {
                Some(parsed) => parsed,
                None => {
                    issues.push(format!("{}: invalid {} {}, using default", id, name, v));
                    T::default()
                }
            },
        }
    }

    let update_strategy = knob(
        field("updateStrategy", "update_strategy"),
        &id,
        "updateStrategy",
        issues,
    );
    let submodules = knob(field("submodules", "submodules"), &id, "submodules", issues);
    let lfs = knob(field("lfs", "lfs"), &id, "lfs", issues);
    let source = knob(field("source", "source"), &id, "source", issues);

    let mut tags: Vec<String> = Vec::new();
    if let Some(raw_tags) = field("tags", "tags").and_then(|v| v.as_array()) {
        for tag in raw_tags.iter().filter_map(|t| t.as_str()) {
            let tag = tag.trim().to_string();
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }

    Some(RegistryEntry {
        id,
        host: parsed.host,
        owner: parsed.owner,
        repo: parsed.repo,
        clone_url,
        description: text("description", "description"),
        tags,
        default_remote_name: text("defaultRemoteName", "default_remote_name")
            .unwrap_or_else(|| "origin".to_string()),
        update_strategy,
        submodules,
        lfs,
        source,
        starred_at: text("starredAt", "starred_at"),
        managed: field("managed", "managed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

/// Load the registry, migrating a legacy `registry.json`/`registry.toml`
/// the first time one is found without a `registry.jsonl`.
pub fn load_registry(paths: &Paths, mode: LoadMode) -> Result<Loaded<Registry>> {
    let path = paths.registry_file();
    if path.exists() {
        return Ok(atomic::load(&path, mode)?);
    }

    if let Some(loaded) = migrate_legacy(paths, mode)? {
        return Ok(loaded);
    }

    Ok(atomic::load(&path, mode)?)
}

fn migrate_legacy(paths: &Paths, mode: LoadMode) -> Result<Option<Loaded<Registry>>> {
    let candidates = [
        (paths.legacy_registry_json(), LegacyFormat::Json),
        (paths.legacy_registry_toml(), LegacyFormat::Toml),
    ];

    for (legacy, format) in candidates {
        let Some(raw) = atomic::read_text(&legacy)? else {
            continue;
        };
        let value = match format {
            LegacyFormat::Json => serde_json::from_str::<Value>(&raw).map_err(|e| e.to_string()),
            LegacyFormat::Toml => toml::from_str::<toml::Value>(&raw)
                .map_err(|e| e.to_string())
                .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
        }
        .map_err(|message| StoreError::Corrupt {
            path: legacy.clone(),
            message,
        })?;

        let (data, issues) = normalize_registry(value);
        tracing::info!(from = %legacy.display(), repos = data.repos.len(), "migrating legacy registry");

        let mut rewritten = false;
        if mode == LoadMode::Repair {
            atomic::write_atomic(&paths.registry_file(), &data.serialize())?;
            let mut done = legacy.clone().into_os_string();
            done.push(".migrated");
            std::fs::rename(&legacy, &done)
                .with_context(|| format!("Failed to rename {}", legacy.display()))?;
            rewritten = true;
        }

        return Ok(Some(Loaded {
            data,
            issues,
            existed: true,
            rewritten,
        }));
    }

    Ok(None)
}

enum LegacyFormat {
    Json,
    Toml,
}

pub fn save_registry(paths: &Paths, registry: &Registry) -> Result<bool> {
    Ok(atomic::save(&paths.registry_file(), registry)?)
}
