use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CACHE_BUDGET: u64 = 512 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Runtime settings for every component of the hoard.
#[derive(Debug, Clone)]
pub struct HoardConfig {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Packs shipped next to the application.
    pub bundled_packs_dir: PathBuf,
    /// Packs the user dropped into their config directory.
    pub user_packs_dir: PathBuf,
    pub cache_budget_bytes: u64,
    pub http_concurrency: usize,
    pub http_timeout: Duration,
    pub max_redirects: u8,
    pub max_body_bytes: u64,
    pub peer_concurrency: usize,
    pub chunk_size: usize,
    /// The host yields to the scheduler after this many chunks.
    pub chunks_per_yield: usize,
    pub peer_streaming: bool,
}

/// Optional `packrat.toml` overrides. Every field may be omitted.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    cache_dir: Option<PathBuf>,
    bundled_packs_dir: Option<PathBuf>,
    user_packs_dir: Option<PathBuf>,
    cache_budget: Option<String>,
    http_concurrency: Option<usize>,
    http_timeout_secs: Option<u64>,
    max_redirects: Option<u8>,
    max_body: Option<String>,
    peer_concurrency: Option<usize>,
    chunk_size: Option<usize>,
    chunks_per_yield: Option<usize>,
    peer_streaming: Option<bool>,
}

impl HoardConfig {
    /// Everything rooted under one directory. Used by tests and portable installs.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.to_path_buf(),
            cache_dir: root.join("cache"),
            bundled_packs_dir: root.join("packs"),
            user_packs_dir: root.join("user_packs"),
            cache_budget_bytes: DEFAULT_CACHE_BUDGET,
            http_concurrency: 3,
            http_timeout: Duration::from_secs(60),
            max_redirects: 5,
            max_body_bytes: 512 * 1024 * 1024,
            peer_concurrency: 2,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_per_yield: 4,
            peer_streaming: true,
        }
    }

    /// Defaults, then `packrat.toml`, then environment overrides.
    pub fn load() -> Result<Self> {
        let config_dir = if let Ok(home) = std::env::var("PACKRAT_HOME") {
            PathBuf::from(home)
        } else {
            dirs::config_dir()
                .context("Could not find config directory")?
                .join("packrat")
        };

        let mut config = Self::with_root(&config_dir);
        config.user_packs_dir = config_dir.join("packs");
        config.bundled_packs_dir = PathBuf::from("packs");

        let file_path = config_dir.join("packrat.toml");
        if file_path.exists() {
            let content = fs::read_to_string(&file_path)
                .with_context(|| format!("Failed to read {:?}", file_path))?;
            let parsed: FileConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", file_path))?;
            config.apply_file(parsed)?;
        }

        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(dir) = file.cache_dir {
            self.cache_dir = dir;
        }
        if let Some(dir) = file.bundled_packs_dir {
            self.bundled_packs_dir = dir;
        }
        if let Some(dir) = file.user_packs_dir {
            self.user_packs_dir = dir;
        }
        if let Some(raw) = file.cache_budget {
            self.cache_budget_bytes = parse_byte_size(&raw)
                .with_context(|| format!("Invalid cache_budget '{}'", raw))?;
        }
        if let Some(raw) = file.max_body {
            self.max_body_bytes =
                parse_byte_size(&raw).with_context(|| format!("Invalid max_body '{}'", raw))?;
        }
        if let Some(n) = file.http_concurrency {
            self.http_concurrency = n.max(1);
        }
        if let Some(secs) = file.http_timeout_secs {
            self.http_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = file.max_redirects {
            self.max_redirects = n;
        }
        if let Some(n) = file.peer_concurrency {
            self.peer_concurrency = n.max(1);
        }
        if let Some(n) = file.chunk_size {
            self.chunk_size = n.max(1);
        }
        if let Some(n) = file.chunks_per_yield {
            self.chunks_per_yield = n.max(1);
        }
        if let Some(enabled) = file.peer_streaming {
            self.peer_streaming = enabled;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(cache) = std::env::var("PACKRAT_CACHE") {
            self.cache_dir = PathBuf::from(cache);
        }
        if let Ok(packs) = std::env::var("PACKRAT_PACKS") {
            self.bundled_packs_dir = PathBuf::from(packs);
        }
        if let Ok(raw) = std::env::var("PACKRAT_CACHE_BUDGET") {
            self.cache_budget_bytes = parse_byte_size(&raw)
                .with_context(|| format!("Invalid PACKRAT_CACHE_BUDGET '{}'", raw))?;
        }
        if let Ok(raw) = std::env::var("PACKRAT_PEER_STREAMING") {
            self.peer_streaming = !matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }
        Ok(())
    }

    pub fn pack_dirs(&self) -> Vec<PathBuf> {
        vec![self.bundled_packs_dir.clone(), self.user_packs_dir.clone()]
    }
}

/// Parses `1048576`, `512k`, `64 MiB`, `2g` and similar into bytes.
pub fn parse_byte_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '_'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    let digits: String = number.chars().filter(|c| *c != '_').collect();
    if digits.is_empty() {
        return None;
    }
    let base = digits.parse::<u64>().ok()?;

    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024u64.pow(2),
        "g" | "gb" | "gib" => 1024u64.pow(3),
        _ => return None,
    };
    base.checked_mul(multiplier)
}
