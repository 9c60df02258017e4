use anyhow::{Context, Result};
use git2::{Oid, Repository};
use std::path::{Path, PathBuf};

/// Read-only repository capabilities the engine depends on.
pub trait RepositoryReader {
    /// Tip of a local branch, `None` if the branch does not exist.
    fn branch_commit_id(&self, branch: &str) -> Result<Option<String>>;

    fn commit_exists(&self, commit_id: &str) -> Result<bool>;

    /// Nearest common ancestor, `None` for unrelated histories.
    fn merge_base(&self, one: &str, two: &str) -> Result<Option<String>>;

    /// True when `ancestor` is reachable from `descendant` (or equal to it).
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;

    fn tree_id(&self, commit_id: &str) -> Result<String>;

    /// Paths touched between two commits, like `git diff --name-only`.
    fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>>;

    /// Content of a file at a commit, `None` if it does not exist.
    fn file_content(&self, commit_id: &str, path: &str) -> Result<Option<String>>;
}

/// Result of an in-memory three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMergeOutcome {
    /// Written tree, only present when the merge was clean.
    pub tree_id: Option<String>,
    pub conflicted_files: Vec<String>,
}

impl TreeMergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicted_files.is_empty()
    }
}

/// Computes a merge result without a working copy.
pub trait MergeTreeEngine {
    fn merge_tree(&self, merge_base: &str, ours: &str, theirs: &str) -> Result<TreeMergeOutcome>;
}

/// Object directory of a repository at `path`, bare or not.
pub fn objects_dir(path: &Path) -> PathBuf {
    let bare = path.join("objects");
    if bare.is_dir() && path.join("HEAD").is_file() {
        bare
    } else {
        path.join(".git").join("objects")
    }
}

/// git2 implementation of the repository capabilities
pub struct Git2Backend {
    repo: Repository,
}

impl Git2Backend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path)
            .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
        Ok(Self { repo })
    }

    /// Opens `base` with the objects of `head` linked in, so commits from a
    /// fork can be resolved without fetching them.
    pub fn open_with_alternate<P: AsRef<Path>, Q: AsRef<Path>>(base: P, head: Q) -> Result<Self> {
        let backend = Self::open(base)?;
        let head_objects = objects_dir(head.as_ref());
        backend
            .repo
            .odb()
            .and_then(|odb| odb.add_disk_alternate(&head_objects.to_string_lossy()))
            .with_context(|| format!("Failed to link objects from {}", head_objects.display()))?;
        Ok(backend)
    }

    fn oid(&self, id: &str) -> Result<Oid> {
        self.repo
            .revparse_single(id)
            .and_then(|object| object.peel_to_commit())
            .map(|commit| commit.id())
            .with_context(|| format!("Failed to resolve commit {id}"))
    }

    fn tree(&self, id: &str) -> Result<git2::Tree<'_>> {
        let oid = self.oid(id)?;
        let commit = self.repo.find_commit(oid)?;
        Ok(commit.tree()?)
    }
}

impl RepositoryReader for Git2Backend {
    fn branch_commit_id(&self, branch: &str) -> Result<Option<String>> {
        match self.repo.find_branch(branch, git2::BranchType::Local) {
            Ok(branch) => Ok(branch.get().target().map(|oid| oid.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read branch {branch}")),
        }
    }

    fn commit_exists(&self, commit_id: &str) -> Result<bool> {
        let Ok(oid) = Oid::from_str(commit_id) else {
            return Ok(false);
        };
        Ok(self.repo.find_commit(oid).is_ok())
    }

    fn merge_base(&self, one: &str, two: &str) -> Result<Option<String>> {
        let (one, two) = (self.oid(one)?, self.oid(two)?);
        match self.repo.merge_base(one, two) {
            Ok(oid) => Ok(Some(oid.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to compute merge base"),
        }
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let (ancestor, descendant) = (self.oid(ancestor)?, self.oid(descendant)?);
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(descendant, ancestor)?)
    }

    fn tree_id(&self, commit_id: &str) -> Result<String> {
        Ok(self.tree(commit_id)?.id().to_string())
    }

    fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let (old, new) = (self.tree(from)?, self.tree(to)?);
        let diff = self
            .repo
            .diff_tree_to_tree(Some(&old), Some(&new), None)
            .context("Failed to diff trees")?;

        let mut files: Vec<String> = diff
            .deltas()
            .filter_map(|delta| delta.new_file().path().or_else(|| delta.old_file().path()))
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        files.dedup();
        Ok(files)
    }

    fn file_content(&self, commit_id: &str, path: &str) -> Result<Option<String>> {
        let tree = self.tree(commit_id)?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = self.repo.find_blob(entry.id())?;
        Ok(Some(String::from_utf8_lossy(blob.content()).to_string()))
    }
}

impl MergeTreeEngine for Git2Backend {
    fn merge_tree(&self, merge_base: &str, ours: &str, theirs: &str) -> Result<TreeMergeOutcome> {
        let ancestor = self.tree(merge_base)?;
        let our_tree = self.tree(ours)?;
        let their_tree = self.tree(theirs)?;

        let mut index = self
            .repo
            .merge_trees(&ancestor, &our_tree, &their_tree, None)
            .context("Failed to merge trees")?;

        if !index.has_conflicts() {
            let tree = index.write_tree_to(&self.repo)?;
            return Ok(TreeMergeOutcome {
                tree_id: Some(tree.to_string()),
                conflicted_files: Vec::new(),
            });
        }

        let mut conflicted_files = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref());
            if let Some(entry) = entry {
                conflicted_files.push(String::from_utf8_lossy(&entry.path).to_string());
            }
        }
        conflicted_files.sort();
        conflicted_files.dedup();

        Ok(TreeMergeOutcome {
            tree_id: None,
            conflicted_files,
        })
    }
}
