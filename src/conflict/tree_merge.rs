//! In-memory classification through a libgit2 three-way merge.

use anyhow::Result;

use crate::git::{Git2Backend, MergeTreeEngine, RepositoryReader};
use crate::types::PullRequestStatus;

use super::Classification;

/// Merges `head` into `base` on top of `merge_base` without a workspace.
///
/// A clean result whose tree equals the base tree is an empty patch.
pub fn classify<E>(engine: &E, base: &str, head: &str, merge_base: &str, max_files: usize) -> Result<Classification>
where
    E: MergeTreeEngine + RepositoryReader,
{
    let outcome = engine.merge_tree(merge_base, base, head)?;

    if outcome.has_conflicts() {
        let mut files = outcome.conflicted_files;
        files.truncate(max_files);
        return Ok(Classification {
            status: PullRequestStatus::Conflict,
            tree_id: None,
            conflicted_files: files,
            conflicting_commit: None,
        });
    }

    let base_tree = engine.tree_id(base)?;
    let status = match &outcome.tree_id {
        Some(tree) if *tree == base_tree => PullRequestStatus::Empty,
        _ => PullRequestStatus::Mergeable,
    };

    Ok(Classification {
        status,
        tree_id: outcome.tree_id,
        conflicted_files: Vec::new(),
        conflicting_commit: None,
    })
}

/// Opens the base repository with the head objects linked in and classifies.
pub fn classify_paths(
    base_path: &std::path::Path,
    head_path: &std::path::Path,
    base: &str,
    head: &str,
    merge_base: &str,
    max_files: usize,
) -> Result<Classification> {
    let backend = Git2Backend::open_with_alternate(base_path, head_path)?;
    classify(&backend, base, head, merge_base, max_files)
}
