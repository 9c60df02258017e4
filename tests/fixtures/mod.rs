//! Shared fixtures for integration tests: a bare base repository, a work
//! clone to author commits in, and a pull service wired with in-memory
//! collaborators.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Once};

use pull_merge::memory::{
    MemoryLfsMetaStore, MemoryPolicy, MemoryPullStore, MemoryScheduleStore, MemoryUniqueQueue,
    MemoryUserDirectory, RecordingNotifier,
};
use pull_merge::{
    AutoMergeService, Collaborators, EngineConfig, NoSigning, PullRequest, PullRequestStatus, PullService,
    Repository, User,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const AUTHOR_NAME: &str = "Test User";
pub const AUTHOR_EMAIL: &str = "test@example.com";

static ISOLATE: Once = Once::new();

/// Hides the user's global and system git configuration from every git the
/// tests spawn, the library's included, so nothing relies on a configured
/// identity. Runs before any test process spawns git.
pub fn isolate_git_config() {
    ISOLATE.call_once(|| {
        let empty = std::env::temp_dir().join(format!("pull-merge-tests-{}.gitconfig", std::process::id()));
        std::fs::write(&empty, "").unwrap();
        std::env::set_var("GIT_CONFIG_GLOBAL", &empty);
        std::env::set_var("GIT_CONFIG_NOSYSTEM", "1");
        for var in [
            "GIT_AUTHOR_NAME",
            "GIT_AUTHOR_EMAIL",
            "GIT_COMMITTER_NAME",
            "GIT_COMMITTER_EMAIL",
            "EMAIL",
        ] {
            std::env::remove_var(var);
        }
    });
}

/// Runs git in `dir` with a fixed identity and no signing; panics on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", &format!("user.name={AUTHOR_NAME}")])
        .args(["-c", &format!("user.email={AUTHOR_EMAIL}")])
        .args(["-c", "init.defaultBranch=main", "-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub struct GitFixture {
    dir: TempDir,
    pub base: PathBuf,
    pub work: PathBuf,
}

impl GitFixture {
    /// Base repository with one commit on `main` holding `README.md` and
    /// `shared.txt`.
    pub fn new() -> Self {
        isolate_git_config();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.git");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        git(dir.path(), &["init", "-q", "--bare", base.to_str().unwrap()]);
        git(&work, &["init", "-q"]);
        git(&work, &["remote", "add", "origin", base.to_str().unwrap()]);

        let fixture = Self { dir, base, work };
        fixture.write("README.md", "# Project\n");
        fixture.write("shared.txt", "line one\nline two\nline three\n");
        fixture.commit("Initial commit");
        fixture.push("main");
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn temp_root(&self) -> PathBuf {
        self.dir.path().join("workspaces")
    }

    pub fn write(&self, path: &str, content: &str) {
        let file = self.work.join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(file, content).unwrap();
    }

    /// Commits everything in the work tree, returning the new sha.
    pub fn commit(&self, message: &str) -> String {
        git(&self.work, &["add", "-A"]);
        git(&self.work, &["commit", "-q", "-m", message]);
        git(&self.work, &["rev-parse", "HEAD"])
    }

    pub fn commit_file(&self, path: &str, content: &str, message: &str) -> String {
        self.write(path, content);
        self.commit(message)
    }

    pub fn checkout(&self, branch: &str) {
        git(&self.work, &["checkout", "-q", branch]);
    }

    pub fn branch(&self, name: &str, from: &str) {
        git(&self.work, &["checkout", "-q", "-b", name, from]);
    }

    pub fn push(&self, branch: &str) {
        git(&self.work, &["push", "-q", "-f", "origin", branch]);
    }

    /// Tip of `branch` in the bare base repository.
    pub fn tip(&self, branch: &str) -> String {
        self.tip_in(&self.base, branch)
    }

    pub fn tip_in(&self, repo: &Path, branch: &str) -> String {
        git(repo, &["rev-parse", &format!("refs/heads/{branch}")])
    }

    /// Parents of `rev` in the base repository.
    pub fn parents(&self, rev: &str) -> Vec<String> {
        git(&self.base, &["rev-list", "--parents", "-n", "1", rev])
            .split_whitespace()
            .skip(1)
            .map(str::to_string)
            .collect()
    }

    pub fn subject(&self, rev: &str) -> String {
        git(&self.base, &["log", "-1", "--format=%s", rev])
    }

    pub fn file_at(&self, rev: &str, path: &str) -> String {
        git(&self.base, &["show", &format!("{rev}:{path}")])
    }

    /// Bare fork of the base repository.
    pub fn fork(&self) -> PathBuf {
        let fork = self.dir.path().join("fork.git");
        git(
            self.dir.path(),
            &["clone", "-q", "--bare", self.base.to_str().unwrap(), fork.to_str().unwrap()],
        );
        git(&self.work, &["remote", "add", "fork", fork.to_str().unwrap()]);
        fork
    }

    pub fn push_to(&self, remote: &str, branch: &str) {
        git(&self.work, &["push", "-q", "-f", remote, branch]);
    }

    pub fn repository(&self) -> Repository {
        Repository {
            id: 1,
            owner: "acme".to_string(),
            name: "project".to_string(),
            path: self.base.clone(),
        }
    }

    /// Same-repository pull request from `head` into `main`.
    pub fn pull_request(&self, id: i64, head: &str, title: &str) -> PullRequest {
        let repo = self.repository();
        PullRequest {
            id,
            index: id,
            title: title.to_string(),
            description: String::new(),
            poster: poster(),
            base_repo: repo.clone(),
            base_branch: "main".to_string(),
            head_commit_id: self.tip(head),
            head_repo: Some(repo),
            head_branch: head.to_string(),
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
        }
    }

    /// Pull request from `head` in the fork at `fork` into `main`.
    pub fn fork_pull_request(&self, id: i64, fork: &Path, head: &str, title: &str) -> PullRequest {
        let mut pr = self.pull_request_base(id, title);
        pr.head_repo = Some(Repository {
            id: 2,
            owner: "contributor".to_string(),
            name: "project".to_string(),
            path: fork.to_path_buf(),
        });
        pr.head_branch = head.to_string();
        pr.head_commit_id = self.tip_in(fork, head);
        pr
    }

    fn pull_request_base(&self, id: i64, title: &str) -> PullRequest {
        let mut pr = self.pull_request(id, "main", title);
        pr.head_commit_id = String::new();
        pr
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.workspace.temp_root = self.temp_root();
        config
    }

    /// Leftover workspaces under the temp root.
    pub fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.temp_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn poster() -> User {
    User {
        id: 1,
        name: AUTHOR_NAME.to_string(),
        email: AUTHOR_EMAIL.to_string(),
    }
}

pub fn merger() -> User {
    User {
        id: 2,
        name: "Merge Bot".to_string(),
        email: "merge-bot@example.com".to_string(),
    }
}

/// Pull service plus handles on every in-memory collaborator.
pub struct Engine {
    pub service: Arc<PullService>,
    pub pulls: Arc<MemoryPullStore>,
    pub policy: Arc<MemoryPolicy>,
    pub users: Arc<MemoryUserDirectory>,
    pub schedules: Arc<MemoryScheduleStore>,
    pub lfs: Arc<MemoryLfsMetaStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub queue: Arc<MemoryUniqueQueue>,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        let pulls = Arc::new(MemoryPullStore::new());
        let policy = Arc::new(MemoryPolicy::new());
        let users = Arc::new(MemoryUserDirectory::new());
        let schedules = Arc::new(MemoryScheduleStore::new());
        let lfs = Arc::new(MemoryLfsMetaStore::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let collaborators = Collaborators {
            pulls: pulls.clone(),
            policy: policy.clone(),
            users: users.clone(),
            schedules: schedules.clone(),
            lfs: lfs.clone(),
            signer: Arc::new(NoSigning),
            notifier: notifier.clone(),
        };
        let service = Arc::new(PullService::new(config, collaborators, CancellationToken::new()));

        Self {
            service,
            pulls,
            policy,
            users,
            schedules,
            lfs,
            notifier,
            queue: Arc::new(MemoryUniqueQueue::new()),
        }
    }

    pub fn auto_merge(&self) -> Arc<AutoMergeService> {
        Arc::new(AutoMergeService::new(
            self.pulls.clone(),
            self.schedules.clone(),
            self.queue.clone(),
            self.notifier.clone(),
            self.service.clone(),
        ))
    }

    /// Stores `pr` and classifies it.
    pub async fn open(&self, pr: PullRequest) -> PullRequest {
        let id = pr.id;
        self.pulls.insert(pr).await;
        self.service.test_pull(id).await.unwrap();
        self.service.pull(id).await.unwrap()
    }
}
