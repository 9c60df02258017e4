//! Classification by performing the real merge or rebase in a workspace.
//!
//! Used when an in-memory merge is unavailable or explicitly configured. The
//! exit status of git decides success; on failure the unmerged index entries
//! and the sentinel files git leaves in `.git` identify a conflict.

use tracing::debug;

use crate::error::{MergeError, Result};
use crate::git::GitRunner;
use crate::types::{MergeStyle, PullRequest, PullRequestStatus};
use crate::workspace::{RepoBuilder, TemporaryRepo, BASE_BRANCH, STAGING_BRANCH, TRACKING_BRANCH};

use super::Classification;

pub const MERGE_HEAD: &str = "MERGE_HEAD";
pub const REBASE_HEAD: &str = "REBASE_HEAD";

/// Where git records the commit a rebase stopped on. The first layout is
/// written by git < 2.26, the second by later versions.
const STOPPED_COMMIT_FILES: [&str; 2] = ["rebase-apply/original-commit", "rebase-merge/stopped-sha"];

/// Reads the commit a conflicted rebase stopped on.
pub async fn rebase_stopped_commit(workspace: &TemporaryRepo, git: &GitRunner) -> Result<Option<String>> {
    for relative in STOPPED_COMMIT_FILES {
        let path = workspace.git_dir().join(relative);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let sha = content.trim();
                if !sha.is_empty() {
                    // Some versions record an abbreviated id.
                    return Ok(Some(workspace.rev_parse(git, &format!("{sha}^{{commit}}")).await?));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }

    // Neither layout present; ask git directly.
    if workspace.has_sentinel(REBASE_HEAD) {
        return Ok(Some(workspace.rev_parse(git, REBASE_HEAD).await?));
    }
    Ok(None)
}

pub async fn classify(
    builder: &RepoBuilder,
    pr: &PullRequest,
    style: MergeStyle,
    max_files: usize,
) -> Result<Classification> {
    let mut workspace = builder.build(pr).await?;
    let result = run_trial(builder.git(), &workspace, style, max_files).await;
    workspace.cleanup();
    result
}

async fn run_trial(
    git: &GitRunner,
    workspace: &TemporaryRepo,
    style: MergeStyle,
    max_files: usize,
) -> Result<Classification> {
    let (output, result_rev) = if style.is_rebase() {
        git.run(&workspace.git(["checkout", "-q", "-b", STAGING_BRANCH, TRACKING_BRANCH]))
            .await
            .map_err(|e| MergeError::command("checkout staging", e))?;
        let output = git.output(&workspace.git(["rebase", "-q", BASE_BRANCH])).await?;
        (output, format!("{STAGING_BRANCH}^{{tree}}"))
    } else {
        let output = git
            .output(&workspace.git(["merge", "--no-ff", "--no-commit", "-q", TRACKING_BRANCH]))
            .await?;
        (output, String::new())
    };

    if !output.success() {
        let mut files = workspace.unmerged_files(git).await?;
        let rebase_stopped = style.is_rebase() && workspace.has_sentinel(REBASE_HEAD);
        let merge_stopped = !style.is_rebase() && workspace.has_sentinel(MERGE_HEAD);

        if files.is_empty() && !rebase_stopped && !merge_stopped {
            if output.stderr.contains("refusing to merge unrelated histories") {
                return Err(MergeError::UnrelatedHistories {
                    style,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }
            return Err(MergeError::command(
                format!("trial {style}"),
                crate::git::CommandError::ExecutionFailed {
                    command: format!("trial {style}"),
                    status_code: output.status_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                },
            ));
        }

        let conflicting_commit = if rebase_stopped {
            rebase_stopped_commit(workspace, git).await?
        } else {
            None
        };
        files.truncate(max_files);
        debug!(?files, ?conflicting_commit, "Trial {style} stopped on conflicts");
        return Ok(Classification {
            status: PullRequestStatus::Conflict,
            tree_id: None,
            conflicted_files: files,
            conflicting_commit,
        });
    }

    let tree = if style.is_rebase() {
        workspace.rev_parse(git, &result_rev).await?
    } else {
        let written = git
            .run(&workspace.git(["write-tree"]))
            .await
            .map_err(|e| MergeError::command("write-tree", e))?;
        written.stdout_trimmed().to_string()
    };
    let base_tree = workspace.rev_parse(git, &format!("{BASE_BRANCH}^{{tree}}")).await?;

    let status = if tree == base_tree {
        PullRequestStatus::Empty
    } else {
        PullRequestStatus::Mergeable
    };
    Ok(Classification {
        status,
        tree_id: Some(tree),
        conflicted_files: Vec::new(),
        conflicting_commit: None,
    })
}
