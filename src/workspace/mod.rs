//! Temporary repository builder
//!
//! A merge never touches the base repository's working copy. Instead a
//! throwaway repository is initialised next to it, linked to the base and
//! head object stores through `objects/info/alternates`, and only the paths
//! the pull request touches are checked out.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{MergeError, Result};
use crate::git::command::{CommandOutput, GitCommand, GitRunner};
use crate::git::objects_dir;
use crate::types::PullRequest;

/// Branch holding the base branch tip, later moved by the merge.
pub const BASE_BRANCH: &str = "base";
/// Snapshot of the base branch before the merge.
pub const ORIGINAL_BASE_BRANCH: &str = "original_base";
/// Head branch tip.
pub const TRACKING_BRANCH: &str = "tracking";
/// Scratch branch rebases are replayed on.
pub const STAGING_BRANCH: &str = "staging";

pub const BASE_REMOTE: &str = "origin";
pub const HEAD_REMOTE: &str = "head_repo";

/// Fallback identity for commits made in a workspace. Merges that land
/// override it through `GIT_AUTHOR_*` and `GIT_COMMITTER_*`.
pub const WORKSPACE_IDENTITY: (&str, &str) = ("pull-merge", "pull-merge@localhost");

static SPARSE_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([*\[?! \\])").expect("valid sparse checkout escape pattern"));

/// A scratch repository exclusively owned by one operation.
///
/// The directory is removed by [`TemporaryRepo::cleanup`] or, failing that,
/// on drop, so an early return, a panic or a cancelled future all release it.
#[derive(Debug)]
pub struct TemporaryRepo {
    dir: Option<TempDir>,
    path: PathBuf,
    base_commit_id: String,
    head_commit_id: String,
}

impl TemporaryRepo {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git_dir(&self) -> PathBuf {
        self.path.join(".git")
    }

    /// Base branch tip at the time the workspace was built.
    pub fn base_commit_id(&self) -> &str {
        &self.base_commit_id
    }

    /// Head branch tip at the time the workspace was built.
    pub fn head_commit_id(&self) -> &str {
        &self.head_commit_id
    }

    /// Removes the workspace. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if let Some(dir) = self.dir.take() {
            debug!(path = %self.path.display(), "Removing temporary repository");
            if let Err(e) = dir.close() {
                warn!(path = %self.path.display(), error = %e, "Failed to remove temporary repository");
            }
        }
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.dir.is_none()
    }

    /// A command running inside the workspace.
    pub fn git<I, S>(&self, args: I) -> GitCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GitCommand::new(args).current_dir(&self.path)
    }

    pub fn has_sentinel(&self, name: &str) -> bool {
        self.git_dir().join(name).exists()
    }

    /// Files left unmerged in the index after a failed merge or rebase.
    pub async fn unmerged_files(&self, git: &GitRunner) -> Result<Vec<String>> {
        let output = git
            .run(&self.git(["diff", "--name-only", "-z", "--diff-filter=U"]))
            .await
            .map_err(|e| MergeError::command("diff --diff-filter=U", e))?;
        let mut files = split_nul(&output.stdout);
        files.sort();
        files.dedup();
        Ok(files)
    }

    pub async fn rev_parse(&self, git: &GitRunner, rev: &str) -> Result<String> {
        let output = git
            .run(&self.git(["rev-parse", "--verify", rev]))
            .await
            .map_err(|e| MergeError::command(format!("rev-parse {rev}"), e))?;
        Ok(output.stdout_trimmed().to_string())
    }
}

impl Drop for TemporaryRepo {
    fn drop(&mut self) {
        self.cleanup();
    }
}

pub(crate) fn split_nul(output: &str) -> Vec<String> {
    output
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Formats a changed-path list as a sparse-checkout file. Each entry is
/// anchored at the root so same-named files in subdirectories stay out.
pub fn sparse_checkout_list(paths: &[String]) -> String {
    paths
        .iter()
        .map(|path| format!("/{}\n", SPARSE_ESCAPE.replace_all(path, r"\$1")))
        .collect()
}

/// Builds temporary repositories for pull requests.
#[derive(Clone)]
pub struct RepoBuilder {
    git: GitRunner,
    temp_root: PathBuf,
}

impl RepoBuilder {
    pub fn new(git: GitRunner, temp_root: impl Into<PathBuf>) -> Self {
        Self {
            git,
            temp_root: temp_root.into(),
        }
    }

    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    /// Materialises a workspace with `base`, `original_base` and `tracking`
    /// branches for `pr`. On failure nothing is left on disk.
    pub async fn build(&self, pr: &PullRequest) -> Result<TemporaryRepo> {
        let head_repo = pr.head_repo.as_ref().ok_or_else(|| {
            MergeError::Internal(anyhow::anyhow!(
                "head repository of pull request {} no longer exists",
                pr.id
            ))
        })?;

        tokio::fs::create_dir_all(&self.temp_root).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("pull-{}-", pr.id))
            .tempdir_in(&self.temp_root)?;
        let mut repo = TemporaryRepo {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
            base_commit_id: String::new(),
            head_commit_id: String::new(),
        };

        match self.populate(&mut repo, pr, &head_repo.path).await {
            Ok(()) => {
                info!(
                    pull_id = pr.id,
                    path = %repo.path().display(),
                    base = %repo.base_commit_id,
                    head = %repo.head_commit_id,
                    "Temporary repository ready"
                );
                Ok(repo)
            }
            Err(e) => {
                repo.cleanup();
                Err(e)
            }
        }
    }

    async fn populate(&self, repo: &mut TemporaryRepo, pr: &PullRequest, head_path: &Path) -> Result<()> {
        self.step(repo, ["init", "--quiet"], "init").await?;

        let alternates = format!(
            "{}\n{}\n",
            objects_dir(&pr.base_repo.path).display(),
            objects_dir(head_path).display()
        );
        let info_dir = repo.git_dir().join("objects").join("info");
        tokio::fs::create_dir_all(&info_dir).await?;
        tokio::fs::write(info_dir.join("alternates"), alternates).await?;

        let base_path = pr.base_repo.path.to_string_lossy().to_string();
        self.step(repo, ["remote", "add", "-t", &pr.base_branch, "-m", &pr.base_branch, BASE_REMOTE, &base_path], "remote add origin")
            .await?;
        self.step(
            repo,
            [
                "fetch",
                BASE_REMOTE,
                "--no-tags",
                "--",
                &format!("{}:{}", pr.base_branch, BASE_BRANCH),
                &format!("{}:{}", pr.base_branch, ORIGINAL_BASE_BRANCH),
            ],
            "fetch base",
        )
        .await?;
        self.step(repo, ["symbolic-ref", "HEAD", &format!("refs/heads/{BASE_BRANCH}")], "symbolic-ref")
            .await?;

        let head_path = head_path.to_string_lossy().to_string();
        self.step(repo, ["remote", "add", HEAD_REMOTE, &head_path], "remote add head_repo")
            .await?;
        self.step(
            repo,
            [
                "fetch",
                HEAD_REMOTE,
                "--no-tags",
                "--",
                &format!("{}:{}", pr.head_branch, TRACKING_BRANCH),
            ],
            "fetch head",
        )
        .await?;

        repo.base_commit_id = repo.rev_parse(&self.git, BASE_BRANCH).await?;
        repo.head_commit_id = repo.rev_parse(&self.git, TRACKING_BRANCH).await?;

        let changed = self
            .step(
                repo,
                ["diff-tree", "--no-commit-id", "--name-only", "-r", "-z", "--root", BASE_BRANCH, TRACKING_BRANCH],
                "diff-tree",
            )
            .await?;
        let info = repo.git_dir().join("info");
        tokio::fs::create_dir_all(&info).await?;
        tokio::fs::write(info.join("sparse-checkout"), sparse_checkout_list(&split_nul(&changed.stdout))).await?;

        // LFS objects are migrated explicitly, never through filters.
        for (key, value) in [
            ("filter.lfs.process", ""),
            ("filter.lfs.required", "false"),
            ("filter.lfs.clean", ""),
            ("filter.lfs.smudge", ""),
            ("commit.gpgsign", "false"),
            ("core.sparseCheckout", "true"),
            ("user.name", WORKSPACE_IDENTITY.0),
            ("user.email", WORKSPACE_IDENTITY.1),
        ] {
            self.step(repo, ["config", "--local", key, value], "config").await?;
        }

        self.step(repo, ["read-tree", "HEAD"], "read-tree").await?;
        Ok(())
    }

    async fn step<const N: usize>(&self, repo: &TemporaryRepo, args: [&str; N], context: &str) -> Result<CommandOutput> {
        self.git.run(&repo.git(args)).await.map_err(|e| {
            let (stdout, stderr) = e.output();
            warn!(path = %repo.path().display(), %stdout, %stderr, "Failed to prepare temporary repository: {context}");
            MergeError::command(context, e)
        })
    }
}
