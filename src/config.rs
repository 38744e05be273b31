//! Configuration parsing and environment wiring.
//!
//! Hivemind is configured via an optional TOML file (default:
//! `~/.hivemind/hivemind.toml`) plus a handful of environment variables.
//! Every section has working defaults so a missing file yields a functional
//! keyword-only store.
//!
//! # Environment variables
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `HIVEMIND_DIR` | Base directory (default `~/.hivemind`) |
//! | `HIVEMIND_REPO_PATH` | Worktree of the active source repository |
//! | `HIVEMIND_INSTANCE_ID` | Identifier of the calling agent instance |
//! | `HIVEMIND_TIER` | 1–3; gates which tools are registered |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load from `path`, or from `<base>/hivemind.toml` when unset. A
    /// missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => base_dir().join("hivemind.toml"),
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"remote"`, or `"local"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint override. Remote defaults to the vendor endpoint, local to a
    /// loopback server.
    #[serde(default)]
    pub url: Option<String>,
    /// Overrides the per-provider default timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: None,
            batch_size: 64,
            max_retries: 5,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Remote providers get 30 s unless overridden.
    pub fn remote_timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(30)
    }

    /// Local inference is slower to warm up; 60 s unless overridden.
    pub fn local_timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(60)
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

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            min_score: 0.0,
        }
    }
}

fn default_max_results() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RerankerConfig {
    /// External command to invoke; unset disables reranking.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_rerank_timeout")]
    pub timeout_secs: u64,
}

fn default_rerank_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}

// ============ Environment ============

/// Base directory: `HIVEMIND_DIR`, defaulting to `~/.hivemind`.
pub fn base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HIVEMIND_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hivemind")
}

/// Global store directory under the base dir.
pub fn global_store_dir() -> PathBuf {
    base_dir().join("memory")
}

/// The active source repository worktree, when the host provided one.
pub fn repo_path() -> Option<PathBuf> {
    std::env::var("HIVEMIND_REPO_PATH")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// Identifier of the calling agent instance.
pub fn instance_id() -> Option<String> {
    std::env::var("HIVEMIND_INSTANCE_ID")
        .ok()
        .filter(|s| !s.is_empty())
}

/// Tool-registration tier, clamped to 1–3 (default 3: everything).
pub fn tier() -> u8 {
    std::env::var("HIVEMIND_TIER")
        .ok()
        .and_then(|s| s.parse::<u8>().ok())
        .map(|t| t.clamp(1, 3))
        .unwrap_or(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.embedding.provider, "disabled");
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.retrieval.max_results, 8);
        assert_eq!(config.watcher.debounce_ms, 500);
        assert!(config.reranker.command.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
[embedding]
provider = "local"
model = "nomic-embed-text"
dims = 768

[retrieval]
max_results = 12
min_score = 0.1

[reranker]
command = "rerank-cli"
args = ["--fast"]

[watcher]
debounce_ms = 250
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.embedding.dims, Some(768));
        assert_eq!(config.embedding.local_timeout_secs(), 60);
        assert_eq!(config.embedding.remote_timeout_secs(), 30);
        assert_eq!(config.retrieval.max_results, 12);
        assert_eq!(config.reranker.command.as_deref(), Some("rerank-cli"));
        assert_eq!(config.watcher.debounce_ms, 250);
    }

    #[test]
    fn test_timeout_override_applies_to_both() {
        let raw = "[embedding]\nprovider = \"remote\"\ntimeout_secs = 5\n";
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.embedding.remote_timeout_secs(), 5);
        assert_eq!(config.embedding.local_timeout_secs(), 5);
    }

    #[test]
    fn test_tier_clamped() {
        // No env manipulation here; just the clamp arithmetic.
        assert_eq!(7u8.clamp(1, 3), 3);
        assert_eq!(0u8.clamp(1, 3), 1);
    }
}
