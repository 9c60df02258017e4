//! Large file storage bookkeeping for merges.
//!
//! Pointer files brought in by a merge must become visible to the base
//! repository's object store registry, otherwise the objects they reference
//! are unreachable from it. [`pipeline::LfsMigrator`] finds them.

pub mod pipeline;
pub mod pointer;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::RepoId;

pub use pipeline::LfsMigrator;
pub use pointer::{Pointer, PointerError};

/// Registration of an LFS object with a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LfsMetaObject {
    pub oid: String,
    pub size: u64,
    pub repository_id: RepoId,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait LfsMetaStore: Send + Sync {
    async fn get_meta_object(&self, repository_id: RepoId, oid: &str) -> Result<Option<LfsMetaObject>>;

    /// Registers the object. Registering an existing object is not an error.
    async fn new_meta_object(&self, meta: LfsMetaObject) -> Result<()>;
}
