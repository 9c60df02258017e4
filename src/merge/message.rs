//! Default merge commit messages.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::git::RepositoryReader;
use crate::types::{MergeStyle, PullRequest, Signature};

static TEMPLATE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_]+)\}|\$([A-Za-z0-9_]+)").expect("valid template variable pattern")
});

/// A message that already ends in a block of `Key: value` trailers.
static TRAILERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\n\n)(?:[\w-]+[ \t]*:[^\n]+\n*(?:[ \t]+[^\n]+\n*)*)+$").expect("valid trailer pattern")
});

const CO_AUTHORS_SEPARATOR: &str = "---------\n\n";

/// Message with its optional body, joined by a blank line on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeMessage {
    pub title: String,
    pub body: String,
}

impl MergeMessage {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.body.is_empty()
    }

    pub fn full(&self) -> String {
        if self.body.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.body)
        }
    }
}

/// Variables available to message templates.
pub fn template_vars(pr: &PullRequest) -> HashMap<&'static str, String> {
    let (head_owner, head_name) = pr
        .head_repo
        .as_ref()
        .map(|repo| (repo.owner.clone(), repo.name.clone()))
        .unwrap_or_default();

    HashMap::from([
        ("BaseRepoOwnerName", pr.base_repo.owner.clone()),
        ("BaseRepoName", pr.base_repo.name.clone()),
        ("BaseBranch", pr.base_branch.clone()),
        ("HeadRepoOwnerName", head_owner),
        ("HeadRepoName", head_name),
        ("HeadBranch", pr.head_branch.clone()),
        ("PullRequestTitle", pr.title.clone()),
        ("PullRequestDescription", pr.description.clone()),
        ("PullRequestPosterName", pr.poster.name.clone()),
        ("PullRequestIndex", pr.index.to_string()),
        ("PullRequestReference", format!("#{}", pr.index)),
    ])
}

/// Expands `${Var}` and `$Var`; unknown variables become empty. The first
/// line of the trimmed template is the title, the rest the body.
pub fn expand_template(template: &str, vars: &HashMap<&'static str, String>) -> MergeMessage {
    let expand = |text: &str| {
        TEMPLATE_VAR
            .replace_all(text, |caps: &Captures<'_>| {
                let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
                vars.get(name).cloned().unwrap_or_default()
            })
            .into_owned()
    };

    let trimmed = template.trim();
    match trimmed.split_once('\n') {
        Some((title, body)) => MergeMessage {
            title: expand(title.trim_end()),
            body: expand(body.trim()),
        },
        None => MergeMessage::new(expand(trimmed)),
    }
}

/// Message used when the caller supplies none and no template exists.
pub fn fallback_message(pr: &PullRequest, style: MergeStyle) -> MergeMessage {
    match style {
        // A fast-forward rebase keeps the replayed commits untouched.
        MergeStyle::Rebase | MergeStyle::FastForwardOnly | MergeStyle::RebaseUpdate => MergeMessage::default(),
        MergeStyle::Squash => MergeMessage::new(format!("{} (#{})", pr.title, pr.index)),
        MergeStyle::Merge | MergeStyle::RebaseMerge => {
            let source = match &pr.head_repo {
                _ if pr.is_same_repo() => pr.head_branch.clone(),
                Some(head) => format!("{}:{}", head.full_name(), pr.head_branch),
                None => format!("<deleted>:{}", pr.head_branch),
            };
            MergeMessage::new(format!(
                "Merge pull request '{}' (#{}) from {} into {}",
                pr.title, pr.index, source, pr.base_branch
            ))
        }
    }
}

/// How the body of a generated squash message is put together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashSummary {
    /// List the squashed commit messages instead of the description.
    pub commit_messages: bool,
    /// Newest commits considered for messages and co-authors; 0 for all.
    pub commits_limit: usize,
    /// Listed commit messages are cut off past this many bytes; 0 for no limit.
    pub size_limit: usize,
    /// Credit authors of commits past `commits_limit` as well.
    pub all_authors: bool,
}

impl Default for SquashSummary {
    fn default() -> Self {
        Self {
            commit_messages: false,
            commits_limit: 50,
            size_limit: 5120,
            all_authors: false,
        }
    }
}

impl SquashSummary {
    /// Commits, newest first, whose authors may be credited.
    pub fn credited<'a>(&self, commits: &'a [SquashedCommit]) -> &'a [SquashedCommit] {
        if self.all_authors {
            commits
        } else {
            self.listed(commits)
        }
    }

    fn listed<'a>(&self, commits: &'a [SquashedCommit]) -> &'a [SquashedCommit] {
        match self.commits_limit {
            0 => commits,
            limit => &commits[..limit.min(commits.len())],
        }
    }

    /// Body for a squash commit: the description or the commit list,
    /// then a `Co-authored-by:` trailer per co-author.
    pub fn body(&self, description: &str, commits: &[SquashedCommit], co_authors: &[String]) -> String {
        let mut body = String::new();
        if self.commit_messages {
            for commit in self.listed(commits).iter().rev() {
                let message = commit.message.trim();
                if message.is_empty() {
                    continue;
                }
                body.push_str(&format!("* {message}\n\n"));
                if self.size_limit > 0 && body.len() >= self.size_limit {
                    let mut end = self.size_limit;
                    while !body.is_char_boundary(end) {
                        end -= 1;
                    }
                    body.truncate(end);
                    body.push_str("...");
                    break;
                }
            }
        } else {
            let description = description.trim();
            body.push_str(description);
            if !body.is_empty() {
                body.push('\n');
                if !TRAILERS.is_match(description) {
                    body.push('\n');
                }
            }
        }

        if !body.is_empty() && !co_authors.is_empty() {
            body.push_str(CO_AUTHORS_SEPARATOR);
        }
        for author in co_authors {
            body.push_str(&format!("Co-authored-by: {author}\n"));
        }
        body
    }
}

/// A commit folded into a squash, as read from `git log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashedCommit {
    pub author: Signature,
    pub message: String,
}

/// Appends a generated squash body to `message`.
pub fn with_squash_body(message: &str, body: &str) -> String {
    let body = body.trim_end();
    match (message.trim_end(), body) {
        (message, "") => message.to_string(),
        ("", body) => body.to_string(),
        (message, body) => format!("{message}\n\n{body}"),
    }
}

pub fn template_path(dir: &str, style: MergeStyle) -> String {
    format!(
        "{}/{}_TEMPLATE.md",
        dir.trim_end_matches('/'),
        style.as_str().to_uppercase()
    )
}

/// Default message for merging `pr` with `style`, honouring a template
/// committed on the base branch under `template_dir`.
pub fn default_merge_message<R: RepositoryReader + ?Sized>(
    reader: &R,
    pr: &PullRequest,
    style: MergeStyle,
    template_dir: &str,
) -> anyhow::Result<MergeMessage> {
    if let Some(base_tip) = reader.branch_commit_id(&pr.base_branch)? {
        if let Some(template) = reader.file_content(&base_tip, &template_path(template_dir, style))? {
            return Ok(expand_template(&template, &template_vars(pr)));
        }
    }
    Ok(fallback_message(pr, style))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PullRequestStatus, Repository, User};
    use std::path::PathBuf;

    fn repo(id: i64, owner: &str) -> Repository {
        Repository {
            id,
            owner: owner.into(),
            name: "widgets".into(),
            path: PathBuf::from("/srv/widgets.git"),
        }
    }

    fn pull() -> PullRequest {
        PullRequest {
            id: 10,
            index: 5,
            title: "Fix parser".into(),
            description: "Handles empty input".into(),
            poster: User {
                id: 3,
                name: "bob".into(),
                email: "bob@example.com".into(),
            },
            base_repo: repo(1, "acme"),
            base_branch: "main".into(),
            head_repo: Some(repo(1, "acme")),
            head_branch: "fix-parser".into(),
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

    #[test]
    fn test_fallback_messages_per_style() {
        let mut pr = pull();
        assert_eq!(fallback_message(&pr, MergeStyle::Squash).title, "Fix parser (#5)");
        assert!(fallback_message(&pr, MergeStyle::Rebase).is_empty());
        assert_eq!(
            fallback_message(&pr, MergeStyle::Merge).title,
            "Merge pull request 'Fix parser' (#5) from fix-parser into main"
        );

        pr.head_repo = Some(repo(2, "bob"));
        assert_eq!(
            fallback_message(&pr, MergeStyle::RebaseMerge).title,
            "Merge pull request 'Fix parser' (#5) from bob/widgets:fix-parser into main"
        );

        pr.head_repo = None;
        assert_eq!(
            fallback_message(&pr, MergeStyle::Merge).title,
            "Merge pull request 'Fix parser' (#5) from <deleted>:fix-parser into main"
        );
    }

    #[test]
    fn test_template_expansion_splits_title_and_body() {
        let template = "\n${PullRequestTitle} ($PullRequestReference)\n\n$PullRequestDescription\nby ${PullRequestPosterName} ${Unknown}\n";
        let message = expand_template(template, &template_vars(&pull()));
        assert_eq!(message.title, "Fix parser (#5)");
        assert_eq!(message.body, "Handles empty input\nby bob ");
        assert_eq!(message.full(), "Fix parser (#5)\n\nHandles empty input\nby bob ");
    }

    fn squashed(name: &str, message: &str) -> SquashedCommit {
        SquashedCommit {
            author: Signature {
                name: name.into(),
                email: format!("{name}@example.com"),
            },
            message: message.into(),
        }
    }

    #[test]
    fn test_squash_body_from_description_with_co_authors() {
        let summary = SquashSummary::default();
        let co_authors = vec!["carol <carol@example.com>".to_string()];
        assert_eq!(
            summary.body("  Handles empty input\n", &[], &co_authors),
            "Handles empty input\n\n---------\n\nCo-authored-by: carol <carol@example.com>\n"
        );
        assert_eq!(summary.body("", &[], &co_authors), "Co-authored-by: carol <carol@example.com>\n");
        assert_eq!(summary.body("", &[], &[]), "");
    }

    #[test]
    fn test_description_ending_in_trailers_gets_one_newline() {
        let body = SquashSummary::default().body("Fix it\n\nReviewed-by: dave <dave@example.com>", &[], &[]);
        assert_eq!(body, "Fix it\n\nReviewed-by: dave <dave@example.com>\n");
    }

    #[test]
    fn test_squash_body_lists_commits_oldest_first() {
        let summary = SquashSummary {
            commit_messages: true,
            commits_limit: 2,
            ..Default::default()
        };
        // newest first, as git log prints them
        let commits = vec![
            squashed("alice", "Third\n"),
            squashed("alice", "  "),
            squashed("alice", "First"),
        ];
        assert_eq!(summary.body("ignored", &commits, &[]), "* Third\n\n");
        assert_eq!(summary.credited(&commits).len(), 2);

        let summary = SquashSummary {
            commits_limit: 0,
            ..summary
        };
        assert_eq!(summary.body("ignored", &commits, &[]), "* First\n\n* Third\n\n");
    }

    #[test]
    fn test_long_commit_list_is_cut_on_a_char_boundary() {
        let summary = SquashSummary {
            commit_messages: true,
            size_limit: 4,
            ..Default::default()
        };
        let body = summary.body("", &[squashed("alice", "héllo")], &[]);
        assert_eq!(body, "* h...");
    }

    #[test]
    fn test_squash_body_is_appended_after_a_blank_line() {
        assert_eq!(with_squash_body("Fix (#1)", "Body\n"), "Fix (#1)\n\nBody");
        assert_eq!(with_squash_body("Fix (#1)", ""), "Fix (#1)");
        assert_eq!(with_squash_body("", "Body"), "Body");
    }

    #[test]
    fn test_template_path_uses_upper_case_style() {
        assert_eq!(
            template_path(".pull-merge/default_merge_message/", MergeStyle::RebaseMerge),
            ".pull-merge/default_merge_message/REBASE-MERGE_TEMPLATE.md"
        );
    }
}
