use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::merge::SquashSummary;
use crate::types::MergeStyle;

/// Main configuration structure for the merge engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub git: GitConfig,
    pub workspace: WorkspaceConfig,
    pub merge: MergeConfig,
    pub lfs: LfsConfig,
    pub auto_merge: AutoMergeConfig,
    pub observability: ObservabilityConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitConfig {
    /// Path to the git binary
    pub binary: PathBuf,
    /// Upper bound for any single git invocation
    pub timeout_seconds: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            timeout_seconds: 600,
        }
    }
}

impl GitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory scratch repositories are created under
    pub temp_root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("pull-merge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDetection {
    /// Tree merge, falling back to a trial merge when libgit2 fails
    #[default]
    Auto,
    TreeMerge,
    WorkspaceTrial,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeConfig {
    pub allowed_styles: Vec<MergeStyle>,
    pub default_style: MergeStyle,
    pub add_co_committer_trailers: bool,
    pub max_conflicted_files: usize,
    pub conflict_detection: ConflictDetection,
    pub wip_prefixes: Vec<String>,
    /// Directory on the base branch holding `<STYLE>_TEMPLATE.md` files
    pub message_template_dir: String,
    /// Default squash bodies list commit messages instead of the description
    pub squash_commit_messages: bool,
    /// 0 walks every commit
    pub message_commits_limit: usize,
    pub message_size_limit: usize,
    pub message_all_authors: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            allowed_styles: MergeStyle::ALL.to_vec(),
            default_style: MergeStyle::Merge,
            add_co_committer_trailers: true,
            max_conflicted_files: 10,
            conflict_detection: ConflictDetection::Auto,
            wip_prefixes: vec!["WIP:".to_string(), "[WIP]".to_string()],
            message_template_dir: ".pull-merge/default_merge_message".to_string(),
            squash_commit_messages: false,
            message_commits_limit: 50,
            message_size_limit: 5120,
            message_all_authors: false,
        }
    }
}

impl MergeConfig {
    pub fn is_style_allowed(&self, style: MergeStyle) -> bool {
        self.allowed_styles.contains(&style)
    }

    pub fn squash_summary(&self) -> SquashSummary {
        SquashSummary {
            commit_messages: self.squash_commit_messages,
            commits_limit: self.message_commits_limit,
            size_limit: self.message_size_limit,
            all_authors: self.message_all_authors,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LfsConfig {
    pub enabled: bool,
    /// Blobs above this size can never be pointer files
    pub pointer_size_limit: u64,
    /// Capacity of each channel between pipeline stages
    pub channel_capacity: usize,
}

impl Default for LfsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pointer_size_limit: 1024,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoMergeConfig {
    pub enabled: bool,
    /// How often the worker polls a queue that cannot notify
    pub poll_interval_ms: u64,
}

impl Default for AutoMergeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite file path or connection string
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl EngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `pull-merge.toml` in the working directory, or `path` when given
    /// 3. Environment variables (prefixed with PULL_MERGE__)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None if Path::new("pull-merge.toml").exists() => {
                builder = builder.add_source(File::with_name("pull-merge"));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("PULL_MERGE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
