//! Git access
//!
//! Two narrow capabilities: [`command`] shells out to the git binary for the
//! operations that need a working copy, [`repository`] reads objects and
//! computes merges in-process through libgit2.

pub mod command;
pub mod repository;

pub use command::{CommandError, CommandExecutor, CommandOutput, GitCommand, GitRunner, ProcessCommandExecutor};
pub use repository::{objects_dir, Git2Backend, MergeTreeEngine, RepositoryReader, TreeMergeOutcome};
