use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pull_merge::collaborators::TracingNotifier;
use pull_merge::git::RepositoryReader;
use pull_merge::memory::{
    MemoryLfsMetaStore, MemoryPolicy, MemoryPullStore, MemoryScheduleStore, MemoryUserDirectory,
};
use pull_merge::{
    init_telemetry, Collaborators, ConflictDetection, EngineConfig, Git2Backend, MergeOptions, MergeStyle,
    NoSigning, PullRequest, PullRequestStatus, PullService, Repository, ShutdownCoordinator, User,
};

#[derive(Parser)]
#[command(name = "pull-merge")]
#[command(about = "Check and merge pull requests between local git repositories")]
#[command(long_about = "pull-merge classifies a head branch against a base branch and lands it with one of \
                       six merge styles. Results are printed as JSON on stdout, logs go to stderr.")]
struct Cli {
    /// Configuration file (defaults to ./pull-merge.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct PullArgs {
    /// Repository holding the base branch
    #[arg(long)]
    repo: PathBuf,
    /// Branch to merge into
    #[arg(long, default_value = "main")]
    base: String,
    /// Branch to merge
    #[arg(long)]
    head: String,
    /// Repository holding the head branch when it is a fork
    #[arg(long)]
    head_repo: Option<PathBuf>,
    /// Pull request title used in default messages
    #[arg(long, default_value = "Local pull request")]
    title: String,
    /// Pull request number used in default messages
    #[arg(long, default_value = "1")]
    index: i64,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify whether the head branch merges cleanly into base
    Check {
        #[command(flatten)]
        pull: PullArgs,
        /// Detection algorithm: auto, tree_merge or workspace_trial
        #[arg(long)]
        mode: Option<String>,
    },
    /// Merge the head branch into base and push the result
    Merge {
        #[command(flatten)]
        pull: PullArgs,
        /// fast-forward-only, merge, squash, rebase, rebase-merge or rebase-update
        #[arg(long, default_value = "merge")]
        style: MergeStyle,
        /// Commit message (defaults to the style's default message)
        #[arg(long, short = 'm')]
        message: Option<String>,
        #[arg(long, default_value = "pull-merge")]
        user_name: String,
        #[arg(long, default_value = "pull-merge@localhost")]
        user_email: String,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    EngineConfig::load_env_file()?;
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if cli.json_logs {
        config.observability.json = true;
    }
    init_telemetry(&config.observability)?;

    match cli.command {
        Commands::Check { pull, mode } => {
            if let Some(mode) = mode {
                config.merge.conflict_detection = parse_mode(&mode)?;
            }
            tokio::runtime::Runtime::new()?.block_on(async { check_command(&config, pull).await })
        }
        Commands::Merge {
            pull,
            style,
            message,
            user_name,
            user_email,
        } => {
            let doer = User {
                id: 1,
                name: user_name,
                email: user_email,
            };
            tokio::runtime::Runtime::new()?
                .block_on(async { merge_command(&config, pull, style, message, doer).await })
        }
        Commands::Config { output } => config_command(&config, output.as_deref()),
    }
}

fn parse_mode(mode: &str) -> Result<ConflictDetection> {
    match mode.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "auto" => Ok(ConflictDetection::Auto),
        "tree_merge" => Ok(ConflictDetection::TreeMerge),
        "workspace_trial" => Ok(ConflictDetection::WorkspaceTrial),
        other => Err(anyhow!("unknown detection mode: {other}")),
    }
}

struct LocalSetup {
    service: PullService,
    pull_id: i64,
}

async fn local_setup(config: &EngineConfig, args: PullArgs, poster: User) -> Result<LocalSetup> {
    let base_repo = local_repository(1, &args.repo)?;
    let head_repo = match &args.head_repo {
        Some(path) => local_repository(2, path)?,
        None => base_repo.clone(),
    };

    let head_commit_id = Git2Backend::open(&head_repo.path)?
        .branch_commit_id(&args.head)?
        .ok_or_else(|| anyhow!("head branch {} not found in {}", args.head, head_repo.path.display()))?;

    let pr = PullRequest {
        id: args.index,
        index: args.index,
        title: args.title,
        description: String::new(),
        poster,
        base_repo,
        base_branch: args.base,
        head_repo: Some(head_repo),
        head_branch: args.head,
        head_commit_id,
        merge_base: String::new(),
        status: PullRequestStatus::Checking,
        conflicted_files: Vec::new(),
        changed_protected_files: Vec::new(),
        merge_style: None,
        is_draft: false,
        issue_closed: false,
        has_merged: false,
        merged_commit_id: None,
        merger: None,
        merged_at: None,
    };

    let pulls = Arc::new(MemoryPullStore::new());
    pulls.insert(pr).await;

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers()?;

    let collaborators = Collaborators {
        pulls: pulls.clone(),
        policy: Arc::new(MemoryPolicy::new()),
        users: Arc::new(MemoryUserDirectory::new()),
        schedules: Arc::new(MemoryScheduleStore::new()),
        lfs: Arc::new(MemoryLfsMetaStore::new()),
        signer: Arc::new(NoSigning),
        notifier: Arc::new(TracingNotifier),
    };
    let service = PullService::new(config, collaborators, shutdown.token());

    Ok(LocalSetup {
        service,
        pull_id: args.index,
    })
}

fn local_repository(id: i64, path: &Path) -> Result<Repository> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Repository {} does not exist", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().trim_end_matches(".git").to_string())
        .unwrap_or_else(|| "repo".to_string());
    Ok(Repository {
        id,
        owner: "local".to_string(),
        name,
        path,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn check_command(config: &EngineConfig, args: PullArgs) -> Result<()> {
    let poster = User {
        id: 1,
        name: "pull-merge".to_string(),
        email: "pull-merge@localhost".to_string(),
    };
    let setup = local_setup(config, args, poster).await?;
    let report = setup.service.test_pull(setup.pull_id).await?;
    print_json(&report)
}

async fn merge_command(
    config: &EngineConfig,
    args: PullArgs,
    style: MergeStyle,
    message: Option<String>,
    doer: User,
) -> Result<()> {
    let setup = local_setup(config, args, doer.clone()).await?;
    let options = MergeOptions {
        style: Some(style),
        message,
        ..Default::default()
    };
    let outcome = setup.service.merge(setup.pull_id, &doer, options).await?;
    setup.service.metrics().log_stats();

    let pr = setup.service.pull(setup.pull_id).await?;
    tracing::debug!(pull_id = pr.id, status = %pr.status, "Final pull request state");
    print_json(&outcome)
}

fn config_command(config: &EngineConfig, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            config.save_to_file(path)?;
            eprintln!("Configuration written to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}
