//! Configuration and path resolution.
//!
//! Two directories matter:
//!
//! - the **config directory** (machine-local): `config.json`, `local.json`, `clones.db`;
//! - the **clones root** (portable content): `<owner>/<repo>` clones plus `registry.jsonl`.
//!
//! `config.json` is written by the onboarding/auth flows; this module only reads it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::concurrency::{normalize_concurrency, parse_concurrency};

pub const REGISTRY_FILE: &str = "registry.jsonl";
pub const LEGACY_REGISTRY_JSON: &str = "registry.json";
pub const LEGACY_REGISTRY_TOML: &str = "registry.toml";
/// Names at the top of the clones root that are never treated as owners.
pub const RESERVED_NAMES: &[&str] = &[REGISTRY_FILE, LEGACY_REGISTRY_JSON, LEGACY_REGISTRY_TOML];

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub content_dir: Option<PathBuf>,
    #[serde(default)]
    pub sync_concurrency: Option<f64>,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GitHubConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub sync_stars: bool,
}

impl GitHubConfig {
    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_url")]
    pub url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: default_embedding_url(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embedding_url() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}

/// Resolved locations of every persisted artifact.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub clones_dir: PathBuf,
}

impl Paths {
    pub fn new(config_dir: impl Into<PathBuf>, clones_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            clones_dir: clones_dir.into(),
        }
    }

    pub fn registry_file(&self) -> PathBuf {
        self.clones_dir.join(REGISTRY_FILE)
    }
    pub fn legacy_registry_json(&self) -> PathBuf {
        self.clones_dir.join(LEGACY_REGISTRY_JSON)
    }
    pub fn legacy_registry_toml(&self) -> PathBuf {
        self.clones_dir.join(LEGACY_REGISTRY_TOML)
    }
    pub fn local_state_file(&self) -> PathBuf {
        self.config_dir.join("local.json")
    }
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }
    pub fn db_file(&self) -> PathBuf {
        self.config_dir.join("clones.db")
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory; set $HOME"))
}

/// `CLONES_CONFIG_DIR`, else `$XDG_CONFIG_HOME/clones`, else `~/.config/clones`.
pub fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = env_path("CLONES_CONFIG_DIR") {
        return Ok(dir);
    }
    if let Some(xdg) = env_path("XDG_CONFIG_HOME") {
        return Ok(xdg.join("clones"));
    }
    Ok(home_dir()?.join(".config").join("clones"))
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AppConfig::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file: {}", path.display()))
        }
    };

    let config: AppConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}

/// `CLONES_CONTENT_DIR`, else `CLONES_DIR`, else `contentDir`, else `~/clones`.
pub fn get_clones_dir(config: &AppConfig) -> Result<PathBuf> {
    if let Some(dir) = env_path("CLONES_CONTENT_DIR").or_else(|| env_path("CLONES_DIR")) {
        return Ok(dir);
    }
    if let Some(dir) = &config.content_dir {
        return Ok(dir.clone());
    }
    Ok(home_dir()?.join("clones"))
}

/// Concurrency from the CLI, else `CLONES_SYNC_CONCURRENCY`, else config.
/// Out-of-range values are normalized and the warning logged.
pub fn get_sync_concurrency(config: &AppConfig, cli_override: Option<&str>) -> usize {
    let raw = match cli_override {
        Some(v) => parse_concurrency(v),
        None => match std::env::var("CLONES_SYNC_CONCURRENCY") {
            Ok(v) if !v.trim().is_empty() => parse_concurrency(&v),
            _ => config.sync_concurrency,
        },
    };
    let normalized = normalize_concurrency(raw);
    if let Some(warning) = &normalized.warning {
        tracing::warn!("sync concurrency {}", warning);
    }
    normalized.value
}

pub fn get_github_config(config: &AppConfig) -> &GitHubConfig {
    &config.github
}

/// Resolve paths and load `config.json` in one step.
pub fn resolve() -> Result<(Paths, AppConfig)> {
    let config_dir = config_dir()?;
    let config = load_config(&config_dir.join("config.json"))?;
    let clones_dir = get_clones_dir(&config)?;
    Ok((Paths::new(config_dir, clones_dir), config))
}
