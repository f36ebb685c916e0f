//! Machine-local sync state (`local.json`). Never shared between machines.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic::{self, LoadMode, Loaded, Persisted};
use crate::config::Paths;

pub const LOCAL_STATE_VERSION: u64 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoLocalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalState {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_run: Option<String>,
    #[serde(default)]
    pub repos: BTreeMap<String, RepoLocalState>,
}

impl Default for LocalState {
    fn default() -> Self {
        Self {
            version: LOCAL_STATE_VERSION,
            last_sync_run: None,
            repos: BTreeMap::new(),
        }
    }
}

impl LocalState {
    pub fn mark_synced(&mut self, id: &str, at: &str) {
        self.repos.entry(id.to_string()).or_default().last_synced_at = Some(at.to_string());
    }

    /// Drop state for ids that are no longer wanted. Returns how many were removed.
    pub fn prune<F: Fn(&str) -> bool>(&mut self, keep: F) -> usize {
        let before = self.repos.len();
        self.repos.retain(|id, _| keep(id));
        before - self.repos.len()
    }
}

impl Persisted for LocalState {
    fn empty() -> Self {
        LocalState::default()
    }

    fn normalize(raw: Value) -> (Self, Vec<String>) {
        let mut issues = Vec::new();
        let mut state = LocalState::default();

        if !raw.is_object() {
            issues.push("local state is not an object; starting empty".to_string());
            return (state, issues);
        }

        match raw.get("version").and_then(|v| v.as_u64()) {
            Some(v) => state.version = v,
            None => issues.push("missing version; assuming 1".to_string()),
        }

        state.last_sync_run = timestamp(raw.get("lastSyncRun"), "lastSyncRun", &mut issues);

        if let Some(repos) = raw.get("repos").and_then(|v| v.as_object()) {
            for (id, value) in repos {
                let last = timestamp(value.get("lastSyncedAt"), id, &mut issues);
                state.repos.insert(
                    id.to_lowercase(),
                    RepoLocalState {
                        last_synced_at: last,
                    },
                );
            }
        }

        (state, issues)
    }

    fn serialize(&self) -> String {
        let mut out = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string());
        out.push('\n');
        out
    }
}

fn timestamp(value: Option<&Value>, what: &str, issues: &mut Vec<String>) -> Option<String> {
    let raw = value?;
    if raw.is_null() {
        return None;
    }
    match raw.as_str().map(DateTime::parse_from_rfc3339) {
        Some(Ok(ts)) => Some(ts.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true)),
        _ => {
            issues.push(format!("{}: invalid timestamp {}, dropped", what, raw));
            None
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn load_local_state(paths: &Paths, mode: LoadMode) -> Result<Loaded<LocalState>> {
    Ok(atomic::load(&paths.local_state_file(), mode)?)
}

pub fn save_local_state(paths: &Paths, state: &LocalState) -> Result<bool> {
    Ok(atomic::save(&paths.local_state_file(), state)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_drops_bad_timestamps() {
        let (state, issues) = LocalState::normalize(json!({
            "version": 1,
            "lastSyncRun": "yesterday",
            "repos": {
                "GitHub.com:o/r": { "lastSyncedAt": "2024-05-01T10:00:00Z" },
                "github.com:x/y": { "lastSyncedAt": 42 }
            }
        }));
        assert_eq!(state.last_sync_run, None);
        assert_eq!(
            state.repos["github.com:o/r"].last_synced_at.as_deref(),
            Some("2024-05-01T10:00:00.000Z")
        );
        assert_eq!(state.repos["github.com:x/y"].last_synced_at, None);
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn serialize_roundtrips_without_issues() {
        let mut state = LocalState::default();
        state.mark_synced("github.com:o/r", "2024-05-01T10:00:00.000Z");
        state.last_sync_run = Some("2024-05-01T10:00:01.000Z".to_string());

        let text = Persisted::serialize(&state);
        let (back, issues) = LocalState::normalize(LocalState::parse(&text).unwrap());
        assert!(issues.is_empty(), "{:?}", issues);
        assert_eq!(back, state);
        assert_eq!(Persisted::serialize(&back), text);
    }

    #[test]
    fn prune_keeps_wanted() {
        let mut state = LocalState::default();
        state.mark_synced("a", "2024-05-01T10:00:00.000Z");
        state.mark_synced("b", "2024-05-01T10:00:00.000Z");
        assert_eq!(state.prune(|id| id == "a"), 1);
        assert!(state.repos.contains_key("a"));
    }
}
