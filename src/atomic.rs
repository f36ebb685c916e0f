//! Atomic file store.
//!
//! Every persisted artifact (registry, local state) goes through the same
//! read → normalize → maybe-rewrite cycle:
//!
//! 1. Read the file. Absent means "use the empty default", never an error.
//! 2. Parse it into a loose [`serde_json::Value`]. A parse failure is
//!    [`StoreError::Corrupt`], distinct from absence.
//! 3. Normalize the value into the typed form, collecting repair issues
//!    instead of failing on malformed or legacy-shaped fields.
//! 4. If writing is allowed and the canonical serialization differs from the
//!    bytes on disk, rewrite it.
//!
//! Writes go to a sibling temp file which is then renamed over the target,
//! so no reader ever observes a half-written file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::StoreError;

/// A document type that can be persisted through the atomic store.
pub trait Persisted: Sized {
    /// The value used when the file does not exist.
    fn empty() -> Self;

    /// Parse raw file content into a loose JSON value.
    fn parse(raw: &str) -> Result<Value, String> {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }

    /// Repair a loose value into the typed form. Never fails; anything that
    /// had to be dropped or rewritten is reported as an issue.
    fn normalize(raw: Value) -> (Self, Vec<String>);

    /// Canonical on-disk form.
    fn serialize(&self) -> String;
}

/// Whether a load may touch the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Never write (used by dry runs).
    ReadOnly,
    /// Materialize a missing file and rewrite a repaired one.
    Repair,
}

/// Result of loading a persisted document.
#[derive(Debug)]
pub struct Loaded<T> {
    pub data: T,
    pub issues: Vec<String>,
    /// `false` when the file did not exist and `data` is the empty default.
    pub existed: bool,
    /// `true` when the canonical form was written back during the load.
    pub rewritten: bool,
}

/// Read a file, mapping "not found" to `None`.
pub fn read_text(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Write `content` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }

    let tmp = temp_path(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

/// Load and normalize a document.
pub fn load<T: Persisted>(path: &Path, mode: LoadMode) -> Result<Loaded<T>, StoreError> {
    let Some(raw) = read_text(path)? else {
        let data = T::empty();
        let rewritten = if mode == LoadMode::Repair {
            write_atomic(path, &data.serialize())?;
            true
        } else {
            false
        };
        return Ok(Loaded {
            data,
            issues: Vec::new(),
            existed: false,
            rewritten,
        });
    };

    let loaded = normalize_raw::<T>(path, &raw)?;
    let canonical = loaded.data.serialize();
    let rewritten = mode == LoadMode::Repair && canonical != raw;
    if rewritten {
        tracing::info!(path = %path.display(), issues = loaded.issues.len(), "rewriting normalized file");
        write_atomic(path, &canonical)?;
    }

    Ok(Loaded {
        rewritten,
        ..loaded
    })
}

/// Parse and normalize already-read content without touching the disk.
pub fn normalize_raw<T: Persisted>(path: &Path, raw: &str) -> Result<Loaded<T>, StoreError> {
    let value = T::parse(raw).map_err(|message| StoreError::Corrupt {
        path: path.to_path_buf(),
        message,
    })?;
    let (data, issues) = T::normalize(value);
    Ok(Loaded {
        data,
        issues,
        existed: true,
        rewritten: false,
    })
}

/// Persist a document, skipping the write when the bytes are unchanged.
///
/// Returns `true` if the file was written.
pub fn save<T: Persisted>(path: &Path, data: &T) -> Result<bool, StoreError> {
    let canonical = data.serialize();
    if read_text(path)?.as_deref() == Some(canonical.as_str()) {
        return Ok(false);
    }
    write_atomic(path, &canonical)?;
    Ok(true)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
