//! The six ways a pull request can land.
//!
//! Each function runs inside a prepared workspace and leaves its result on
//! the `base` branch, except [`rebase`] under `RebaseUpdate`, which leaves
//! it on `staging` for pushing back to the head branch.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::collaborators::UserDirectory;
use crate::conflict::trial::{rebase_stopped_commit, MERGE_HEAD, REBASE_HEAD};
use crate::error::{MergeError, Result};
use crate::git::{CommandError, CommandOutput};
use crate::types::{MergeStyle, PullRequest, Signature};
use crate::workspace::{BASE_BRANCH, STAGING_BRANCH, TRACKING_BRANCH};

use super::context::MergeContext;
use super::message::{with_squash_body, SquashSummary, SquashedCommit};

/// How to settle one conflicted path during a `Merge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Ours,
    Theirs,
    Add,
    Delete,
}

impl FromStr for ResolutionAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ours" => Ok(ResolutionAction::Ours),
            "theirs" => Ok(ResolutionAction::Theirs),
            "add" => Ok(ResolutionAction::Add),
            "delete" => Ok(ResolutionAction::Delete),
            other => Err(format!("invalid resolution: {other}")),
        }
    }
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionAction::Ours => "ours",
            ResolutionAction::Theirs => "theirs",
            ResolutionAction::Add => "add",
            ResolutionAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResolution {
    pub path: String,
    pub action: ResolutionAction,
}

impl FromStr for FileResolution {
    type Err = String;

    /// Parses `action:path`, e.g. `theirs:src/lib.rs`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (action, path) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <action>:<path>, got {s}"))?;
        if path.is_empty() {
            return Err(format!("missing path in {s}"));
        }
        Ok(FileResolution {
            path: path.to_string(),
            action: action.parse()?,
        })
    }
}

/// Interprets a failed merge: a conflict, unrelated histories, or a plain
/// command failure.
async fn merge_failure(ctx: &MergeContext, style: MergeStyle, output: CommandOutput) -> Result<MergeError> {
    let files = ctx.workspace.unmerged_files(&ctx.git).await?;
    if ctx.workspace.has_sentinel(MERGE_HEAD) || !files.is_empty() {
        debug!(pull_id = ctx.pull_id, ?files, "Merge stopped on conflicts");
        return Ok(MergeError::Conflict {
            style,
            files,
            commit_sha: None,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    if output.stderr.contains("refusing to merge unrelated histories") {
        return Ok(MergeError::UnrelatedHistories {
            style,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(MergeError::command(
        format!("{style} merge"),
        CommandError::ExecutionFailed {
            command: format!("merge {TRACKING_BRANCH}"),
            status_code: output.status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        },
    ))
}

/// Moves `base` to the head tip; refuses if that is not a fast-forward.
pub async fn fast_forward_only(ctx: &mut MergeContext) -> Result<()> {
    let check = ctx.command(["merge-base", "--is-ancestor", BASE_BRANCH, TRACKING_BRANCH]);
    let ancestry = ctx.output_of(&check).await?;
    if !ancestry.success() {
        return Err(MergeError::DivergingFastForward {
            stdout: ancestry.stdout,
            stderr: ancestry.stderr,
        });
    }

    let command = ctx.command(["merge", "--ff-only", "-q", TRACKING_BRANCH]);
    let output = ctx.output_of(&command).await?;
    if output.success() {
        return Ok(());
    }
    if output.stderr.contains("Not possible to fast-forward") {
        return Err(MergeError::DivergingFastForward {
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Err(merge_failure(ctx, MergeStyle::FastForwardOnly, output).await?)
}

/// Two-parent merge commit. Conflicts are fatal unless `resolutions`
/// settle every conflicted path.
pub async fn merge(ctx: &mut MergeContext, message: &str, resolutions: &[FileResolution]) -> Result<()> {
    let command = ctx.command(["merge", "--no-ff", "--no-commit", "-q", TRACKING_BRANCH]);
    let output = ctx.output_of(&command).await?;
    if !output.success() {
        let err = merge_failure(ctx, MergeStyle::Merge, output).await?;
        if !matches!(err, MergeError::Conflict { .. }) || resolutions.is_empty() {
            return Err(err);
        }
    }

    for resolution in resolutions {
        info!(pull_id = ctx.pull_id, path = %resolution.path, action = %resolution.action, "Applying conflict resolution");
        apply_resolution(ctx, resolution).await?;
    }

    let remaining = ctx.workspace.unmerged_files(&ctx.git).await?;
    if !remaining.is_empty() {
        let (stdout, stderr) = ctx.output();
        return Err(MergeError::Conflict {
            style: MergeStyle::Merge,
            files: remaining,
            commit_sha: None,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    ctx.commit(message, None).await
}

async fn apply_resolution(ctx: &mut MergeContext, resolution: &FileResolution) -> Result<()> {
    let path = resolution.path.as_str();
    match resolution.action {
        ResolutionAction::Ours | ResolutionAction::Theirs => {
            let side = format!("--{}", resolution.action);
            ctx.run_args(["checkout", side.as_str(), "--", path]).await?;
            ctx.run_args(["add", "--", path]).await?;
        }
        ResolutionAction::Add => {
            ctx.run_args(["add", "--", path]).await?;
        }
        ResolutionAction::Delete => {
            ctx.run_args(["rm", "-q", "--", path]).await?;
        }
    }
    Ok(())
}

/// One commit with the combined changes, parented on the old base tip.
///
/// With a `summary`, the message gets a generated body crediting the other
/// authors of the squashed commits.
pub async fn squash(
    ctx: &mut MergeContext,
    pr: &PullRequest,
    message: &str,
    users: &dyn UserDirectory,
    add_co_committer_trailers: bool,
    summary: Option<&SquashSummary>,
) -> Result<()> {
    let command = ctx.command(["merge", "--squash", "-q", TRACKING_BRANCH]);
    let output = ctx.output_of(&command).await?;
    if !output.success() {
        return Err(merge_failure(ctx, MergeStyle::Squash, output).await?);
    }

    let commits = squashed_commits(ctx).await?;
    let author = squash_author(&commits, pr, users).await?;
    let message = match summary {
        Some(summary) => {
            let co_authors = co_authors(summary.credited(&commits), pr, users).await?;
            with_squash_body(message, &summary.body(&pr.description, &commits, &co_authors))
        }
        None => message.to_string(),
    };
    let message = with_co_committer_trailers(&message, &author, &ctx.committer, add_co_committer_trailers);
    ctx.commit(&message, Some(&author)).await
}

pub fn with_co_committer_trailers(message: &str, author: &Signature, committer: &Signature, enabled: bool) -> String {
    if !enabled || author == committer {
        return message.to_string();
    }
    let mut message = message.to_string();
    let co_author = format!("Co-authored-by: {author}");
    // a generated squash message may already credit them
    if !message.contains(&co_author) {
        message.push('\n');
        message.push_str(&co_author);
    }
    message.push_str(&format!("\nCo-committed-by: {author}\n"));
    message
}

/// Head commits not on the base branch, newest first.
async fn squashed_commits(ctx: &mut MergeContext) -> Result<Vec<SquashedCommit>> {
    let range = format!("{BASE_BRANCH}..{TRACKING_BRANCH}");
    let output = ctx.run_args(["log", "--format=%an%x1f%ae%x1f%B%x1e", range.as_str()]).await?;
    Ok(parse_log_records(&output.stdout))
}

fn parse_log_records(stdout: &str) -> Vec<SquashedCommit> {
    stdout
        .split('\u{1e}')
        .filter_map(|record| {
            let mut fields = record.trim_start_matches('\n').splitn(3, '\u{1f}');
            let name = fields.next()?;
            let email = fields.next()?;
            let message = fields.next()?;
            Some(SquashedCommit {
                author: Signature {
                    name: name.to_string(),
                    email: email.to_string(),
                },
                message: message.to_string(),
            })
        })
        .collect()
}

/// Picks the squash commit author.
///
/// Prefers the identity the poster actually committed with, since their
/// account email may be private or differ from the one in their commits.
/// Walks the head commits newest first, one lookup per distinct email.
async fn squash_author(commits: &[SquashedCommit], pr: &PullRequest, users: &dyn UserDirectory) -> Result<Signature> {
    let mut seen = HashSet::new();
    for commit in commits {
        if !seen.insert(commit.author.email.as_str()) {
            continue;
        }
        if let Some(user) = users.user_by_email(&commit.author.email).await? {
            if user.id == pr.poster.id {
                return Ok(commit.author.clone());
            }
        }
    }
    Ok(pr.poster.signature())
}

/// Distinct commit authors other than the poster, in walk order. An author
/// whose email resolves to the poster's account is the poster.
async fn co_authors(commits: &[SquashedCommit], pr: &PullRequest, users: &dyn UserDirectory) -> Result<Vec<String>> {
    let poster = pr.poster.signature().to_string();
    let mut seen = HashSet::new();
    let mut authors = Vec::new();
    for commit in commits {
        let author = commit.author.to_string();
        if author == poster || !seen.insert(author.clone()) {
            continue;
        }
        let account = users.user_by_email(&commit.author.email).await?;
        if !matches!(account, Some(user) if user.id == pr.poster.id) {
            authors.push(author);
        }
    }
    Ok(authors)
}

/// Replays the head commits onto base on a staging branch, then lands them
/// with a fast-forward (`Rebase`) or a merge commit (`RebaseMerge`).
/// `RebaseUpdate` stops after the replay.
pub async fn rebase(ctx: &mut MergeContext, style: MergeStyle, message: &str) -> Result<()> {
    ctx.run_args(["checkout", "-q", "-b", STAGING_BRANCH, TRACKING_BRANCH]).await?;

    let command = ctx.command(["rebase", "-q", BASE_BRANCH]);
    let output = ctx.output_of(&command).await?;
    if !output.success() {
        let files = ctx.workspace.unmerged_files(&ctx.git).await?;
        if ctx.workspace.has_sentinel(REBASE_HEAD) || !files.is_empty() {
            let commit_sha = rebase_stopped_commit(&ctx.workspace, &ctx.git).await?;
            debug!(pull_id = ctx.pull_id, ?files, ?commit_sha, "Rebase stopped on conflicts");
            return Err(MergeError::Conflict {
                style,
                files,
                commit_sha,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        return Err(MergeError::command(
            "rebase",
            CommandError::ExecutionFailed {
                command: command.display(),
                status_code: output.status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            },
        ));
    }

    match style {
        MergeStyle::RebaseUpdate => Ok(()),
        MergeStyle::RebaseMerge => {
            ctx.run_args(["checkout", "-q", BASE_BRANCH]).await?;
            let command = ctx.command(["merge", "--no-ff", "--no-commit", "-q", STAGING_BRANCH]);
            let output = ctx.output_of(&command).await?;
            if !output.success() {
                return Err(merge_failure(ctx, style, output).await?);
            }
            ctx.commit(message, None).await
        }
        _ => {
            ctx.run_args(["checkout", "-q", BASE_BRANCH]).await?;
            ctx.run_args(["merge", "--ff-only", "-q", STAGING_BRANCH]).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockUserDirectory;
    use crate::types::{PullRequestStatus, Repository, User};

    fn sig(name: &str) -> Signature {
        Signature {
            name: name.into(),
            email: format!("{name}@example.com"),
        }
    }

    #[test]
    fn test_resolution_parsing() {
        let resolution: FileResolution = "theirs:src/lib.rs".parse().unwrap();
        assert_eq!(resolution.action, ResolutionAction::Theirs);
        assert_eq!(resolution.path, "src/lib.rs");

        assert!("merge:src/lib.rs".parse::<FileResolution>().is_err());
        assert!("ours:".parse::<FileResolution>().is_err());
        assert!("ours".parse::<FileResolution>().is_err());
    }

    #[test]
    fn test_trailers_only_when_committer_differs() {
        let alice = sig("alice");
        assert_eq!(with_co_committer_trailers("Fix (#1)", &alice, &alice, true), "Fix (#1)");
        assert_eq!(
            with_co_committer_trailers("Fix (#1)", &alice, &sig("bob"), true),
            "Fix (#1)\nCo-authored-by: alice <alice@example.com>\nCo-committed-by: alice <alice@example.com>\n"
        );
        assert_eq!(with_co_committer_trailers("Fix (#1)", &alice, &sig("bob"), false), "Fix (#1)");
    }

    fn pull_by(poster: User) -> PullRequest {
        let repo = Repository {
            id: 1,
            owner: "acme".into(),
            name: "widgets".into(),
            path: "/srv/widgets.git".into(),
        };
        PullRequest {
            id: 1,
            index: 1,
            title: "Fix".into(),
            description: String::new(),
            poster,
            base_repo: repo.clone(),
            base_branch: "main".into(),
            head_repo: Some(repo),
            head_branch: "fix".into(),
            head_commit_id: String::new(),
            merge_base: String::new(),
            status: PullRequestStatus::Mergeable,
            conflicted_files: vec![],
            changed_protected_files: vec![],
            merge_style: None,
            is_draft: false,
            issue_closed: false,
            has_merged: false,
            merged_commit_id: None,
            merger: None,
            merged_at: None,
        }
    }

    #[tokio::test]
    async fn test_co_authors_skip_the_poster_under_any_email() {

        let poster = User {
            id: 1,
            name: "alice".into(),
            email: "alice@example.com".into(),
        };
        let mut users = MockUserDirectory::new();
        let account = poster.clone();
        users.expect_user_by_email().returning(move |email| {
            Ok((email == "alice@work.example").then(|| account.clone()))
        });

        let pr = pull_by(poster);
        let commits = vec![
            SquashedCommit {
                author: sig("bob"),
                message: "Third".into(),
            },
            SquashedCommit {
                author: sig("alice"),
                message: "Second".into(),
            },
            SquashedCommit {
                author: Signature {
                    name: "alice".into(),
                    email: "alice@work.example".into(),
                },
                message: "First".into(),
            },
            SquashedCommit {
                author: sig("bob"),
                message: "Zeroth".into(),
            },
        ];

        let authors = co_authors(&commits, &pr, &users).await.unwrap();
        assert_eq!(authors, vec!["bob <bob@example.com>".to_string()]);
    }

    #[test]
    fn test_log_records_keep_multi_line_messages() {
        let stdout = "alice\u{1f}alice@example.com\u{1f}Second\n\nWith body\n\u{1e}\nbob\u{1f}bob@example.com\u{1f}First\n\u{1e}\n";
        let commits = parse_log_records(stdout);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].author, sig("alice"));
        assert_eq!(commits[0].message, "Second\n\nWith body\n");
        assert_eq!(commits[1].author, sig("bob"));
        assert_eq!(commits[1].message, "First\n");
    }

    #[test]
    fn test_existing_co_author_trailer_is_not_repeated() {
        let alice = sig("alice");
        let message = "Fix (#1)\n\n---------\n\nCo-authored-by: alice <alice@example.com>";
        let trailed = with_co_committer_trailers(message, &alice, &sig("bob"), true);
        assert_eq!(trailed.matches("Co-authored-by: alice").count(), 1);
        assert!(trailed.ends_with("\nCo-committed-by: alice <alice@example.com>\n"));
    }
}
