use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::scan::{SessionRoot, SessionStyle};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub server: ServerConfig,
    pub workspace: WorkspaceConfig,
    pub index: IndexConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Host profile: `"copilot"` (workspace at `~/.copilot`) or `"claude"` (`~/.claude`).
    pub profile: String,
    /// Explicit workspace directory. Overrides the profile default.
    pub dir: Option<String>,
    /// Explicit database path. Defaults to `<workspace>/memory.db`.
    pub db_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    /// Chunk window in tokens. Changing it rebuilds the index.
    pub chunk_size: usize,
    /// Default response token budget for search.
    pub token_max: usize,
    /// Only index session transcripts modified within this many days. 0 disables the window.
    pub session_days: u64,
    /// Cap on the number of session transcripts. -1 = unbounded, 0 = no session indexing.
    pub session_max: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub cache_dir: String,
}

pub const CHUNK_SIZE_RANGE: (usize, usize) = (64, 4096);
pub const TOKEN_MAX_RANGE: (usize, usize) = (100, 16384);

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            workspace: WorkspaceConfig::default(),
            index: IndexConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            profile: "copilot".into(),
            dir: None,
            db_path: None,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            token_max: 4096,
            session_days: 30,
            session_max: -1,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = home_dir()
            .join(".mnemo/models")
            .to_string_lossy()
            .into_owned();
        Self {
            model: "all-mpnet-base-v2".into(),
            cache_dir,
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().expect("home directory must exist")
}

impl MemoryConfig {
    /// Load config from the workspace TOML file (if present) then apply env overrides.
    ///
    /// The config file is looked up at `<workspace>/config.toml`, where the
    /// workspace comes from `MEMORY_WORKSPACE` or the first existing profile
    /// dot-directory (`~/.copilot`, then `~/.claude`).
    pub fn load() -> Result<Self> {
        let candidate = match std::env::var("MEMORY_WORKSPACE") {
            Ok(ws) => PathBuf::from(ws).join("config.toml"),
            Err(_) => {
                let copilot = home_dir().join(".copilot");
                let claude = home_dir().join(".claude");
                if !copilot.exists() && claude.exists() {
                    claude.join("config.toml")
                } else {
                    copilot.join("config.toml")
                }
            }
        };
        Self::load_from(candidate)
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemoryConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply the `MEMORY_*` environment variable overrides.
    ///
    /// Numeric values are clamped to their documented ranges; unparseable
    /// values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMORY_WORKSPACE") {
            self.workspace.dir = Some(val);
        }
        if let Ok(val) = std::env::var("MEMORY_DB_PATH") {
            self.workspace.db_path = Some(val);
        }
        if let Ok(val) = std::env::var("MEMORY_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Some(n) = env_usize("MEMORY_CHUNK_SIZE") {
            self.index.chunk_size = n.clamp(CHUNK_SIZE_RANGE.0, CHUNK_SIZE_RANGE.1);
        }
        if let Some(n) = env_usize("MEMORY_TOKEN_MAX") {
            self.index.token_max = n.clamp(TOKEN_MAX_RANGE.0, TOKEN_MAX_RANGE.1);
        }
        if let Some(n) = env_i64("MEMORY_SESSION_DAYS") {
            self.index.session_days = n.max(0) as u64;
        }
        if let Some(n) = env_i64("MEMORY_SESSION_MAX") {
            self.index.session_max = n.max(-1);
        }
    }

    /// Resolve the workspace root directory.
    pub fn workspace_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.workspace.dir {
            return expand_tilde(dir);
        }
        match self.workspace.profile.as_str() {
            "claude" => home_dir().join(".claude"),
            _ => home_dir().join(".copilot"),
        }
    }

    /// Resolve the database path.
    pub fn db_path(&self) -> PathBuf {
        match self.workspace.db_path {
            Some(ref p) => expand_tilde(p),
            None => self.workspace_dir().join("memory.db"),
        }
    }

    /// The well-known session transcript roots under the home directory.
    pub fn session_roots(&self) -> Vec<SessionRoot> {
        vec![
            SessionRoot {
                dir: home_dir().join(".copilot/history-session-state"),
                style: SessionStyle::Copilot,
            },
            SessionRoot {
                dir: home_dir().join(".claude/projects"),
                style: SessionStyle::Claude,
            },
        ]
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

fn env_i64(name: &str) -> Option<i64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(path)
    }
}
