//! Mergeability classification against real repositories, for both the
//! in-memory tree merge and the workspace trial.

mod fixtures;

use fixtures::*;
use pull_merge::{BranchProtection, ConflictDetection, MergeStyle, PullRequestStatus};

const MODES: [ConflictDetection; 2] = [ConflictDetection::TreeMerge, ConflictDetection::WorkspaceTrial];

fn engine(fixture: &GitFixture, mode: ConflictDetection) -> Engine {
    let mut config = fixture.config();
    config.merge.conflict_detection = mode;
    Engine::new(&config)
}

/// `feature` edits the middle line of shared.txt; `main` edits it differently.
fn conflicting_branches(fixture: &GitFixture) {
    fixture.branch("feature", "main");
    fixture.commit_file("shared.txt", "line one\nfeature two\nline three\n", "Change line two on feature");
    fixture.push("feature");
    fixture.checkout("main");
    fixture.commit_file("shared.txt", "line one\nmain two\nline three\n", "Change line two on main");
    fixture.push("main");
}

#[tokio::test]
async fn test_clean_change_is_mergeable() {
    for mode in MODES {
        let fixture = GitFixture::new();
        fixture.branch("feature", "main");
        fixture.commit_file("feature.txt", "new\n", "Add feature");
        fixture.push("feature");
        fixture.checkout("main");
        fixture.commit_file("README.md", "# Project\n\nMore docs\n", "Update docs");
        fixture.push("main");

        let engine = engine(&fixture, mode);
        let pr = engine.open(fixture.pull_request(1, "feature", "Add feature")).await;

        assert_eq!(pr.status, PullRequestStatus::Mergeable, "mode {mode:?}");
        assert!(pr.conflicted_files.is_empty());
        assert_eq!(pr.head_commit_id, fixture.tip("feature"));
        assert!(!pr.merge_base.is_empty());
        assert_eq!(fixture.leftover_workspaces(), 0);
    }
}

#[tokio::test]
async fn test_head_contained_in_base_is_ancestor() {
    for mode in MODES {
        let fixture = GitFixture::new();
        fixture.branch("feature", "main");
        fixture.push("feature");
        fixture.checkout("main");
        fixture.commit_file("later.txt", "later\n", "Later work on main");
        fixture.push("main");

        let engine = engine(&fixture, mode);
        let pr = engine.open(fixture.pull_request(1, "feature", "Stale branch")).await;
        assert_eq!(pr.status, PullRequestStatus::Ancestor, "mode {mode:?}");
    }
}

#[tokio::test]
async fn test_change_already_in_base_is_empty() {
    for mode in MODES {
        let fixture = GitFixture::new();
        fixture.branch("feature", "main");
        fixture.commit_file("fix.txt", "fixed\n", "Fix on feature");
        fixture.push("feature");
        fixture.checkout("main");
        fixture.commit_file("fix.txt", "fixed\n", "Same fix on main");
        fixture.push("main");

        let engine = engine(&fixture, mode);
        let pr = engine.open(fixture.pull_request(1, "feature", "Duplicate fix")).await;
        assert_eq!(pr.status, PullRequestStatus::Empty, "mode {mode:?}");
    }
}

#[tokio::test]
async fn test_conflicting_change_lists_files() {
    for mode in MODES {
        let fixture = GitFixture::new();
        conflicting_branches(&fixture);

        let engine = engine(&fixture, mode);
        let pr = engine.open(fixture.pull_request(1, "feature", "Conflicting change")).await;

        assert_eq!(pr.status, PullRequestStatus::Conflict, "mode {mode:?}");
        assert_eq!(pr.conflicted_files, vec!["shared.txt".to_string()]);
        assert_eq!(fixture.leftover_workspaces(), 0);
    }
}

#[tokio::test]
async fn test_unrelated_histories_do_not_block() {
    for mode in MODES {
        let fixture = GitFixture::new();
        git(&fixture.work, &["checkout", "-q", "--orphan", "orphan"]);
        git(&fixture.work, &["rm", "-q", "-r", "-f", "."]);
        fixture.commit_file("other.txt", "unrelated\n", "Unrelated root");
        fixture.push("orphan");

        let engine = engine(&fixture, mode);
        let pr = engine.open(fixture.pull_request(1, "orphan", "Unrelated")).await;
        assert_eq!(pr.status, PullRequestStatus::Empty, "mode {mode:?}");
        assert!(pr.merge_base.is_empty());
    }
}

#[tokio::test]
async fn test_detection_is_idempotent() {
    let fixture = GitFixture::new();
    conflicting_branches(&fixture);

    let engine = engine(&fixture, ConflictDetection::TreeMerge);
    engine.pulls.insert(fixture.pull_request(1, "feature", "Conflicting change")).await;
    let first = engine.service.test_pull(1).await.unwrap();
    let second = engine.service.test_pull(1).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_rebase_trial_reports_stopped_commit() {
    let fixture = GitFixture::new();
    fixture.branch("feature", "main");
    fixture.commit_file("notes.txt", "notes\n", "Add notes");
    let conflicting = fixture.commit_file("shared.txt", "line one\nfeature two\nline three\n", "Edit shared");
    fixture.push("feature");
    fixture.checkout("main");
    fixture.commit_file("shared.txt", "line one\nmain two\nline three\n", "Edit shared on main");
    fixture.push("main");

    let engine = engine(&fixture, ConflictDetection::WorkspaceTrial);
    let mut pr = fixture.pull_request(1, "feature", "Rebase me");
    pr.merge_style = Some(MergeStyle::Rebase);
    engine.pulls.insert(pr).await;

    let report = engine.service.test_pull(1).await.unwrap();
    assert_eq!(report.status, PullRequestStatus::Conflict);
    assert_eq!(report.conflicting_commit.as_deref(), Some(conflicting.as_str()));
    assert_eq!(report.conflicted_files, vec!["shared.txt".to_string()]);
}

#[tokio::test]
async fn test_changed_protected_files_are_recorded() {
    let fixture = GitFixture::new();
    fixture.branch("feature", "main");
    fixture.commit_file("config/App.toml", "debug = true\n", "Touch config");
    fixture.commit_file("src/lib.rs", "pub fn f() {}\n", "Touch code");
    fixture.push("feature");

    let engine = engine(&fixture, ConflictDetection::TreeMerge);
    engine
        .policy
        .set_protection(
            1,
            BranchProtection {
                branch_name: "main".to_string(),
                protected_file_patterns: vec!["config/*.toml".to_string()],
                ..Default::default()
            },
        )
        .await;

    let pr = engine.open(fixture.pull_request(1, "feature", "Config change")).await;
    assert_eq!(pr.status, PullRequestStatus::Mergeable);
    assert_eq!(pr.changed_protected_files, vec!["config/App.toml".to_string()]);
}
