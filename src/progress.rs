//! Sync progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts. The
//! sync engine reports one event when scanning starts and one per finished
//! repository; the README indexer reports one per indexed repository.

use std::io::Write;

#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Walking the clones root. Total unknown.
    Scanning { root: String },
    /// `n` of `total` repositories finished; `repo` is the one that just did.
    Syncing {
        n: u64,
        total: u64,
        repo: String,
        ok: bool,
    },
    /// READMEs indexed so far.
    Indexing { n: u64, total: u64 },
}

pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  syncing  12 / 1,024  github.com:acme/widgets".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Scanning { root } => format!("sync  scanning {}...\n", root),
            SyncProgressEvent::Syncing { n, total, repo, ok } => format!(
                "sync  syncing  {} / {}  {}{}\n",
                format_number(*n),
                format_number(*total),
                repo,
                if *ok { "" } else { "  (failed)" }
            ),
            SyncProgressEvent::Indexing { n, total } => format!(
                "sync  indexing  {} / {} readmes\n",
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Scanning { root } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "root": root
            }),
            SyncProgressEvent::Syncing { n, total, repo, ok } => serde_json::json!({
                "event": "progress",
                "phase": "syncing",
                "n": n,
                "total": total,
                "repo": repo,
                "ok": ok
            }),
            SyncProgressEvent::Indexing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
