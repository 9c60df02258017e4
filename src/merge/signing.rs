use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Repository, Signature, User};

/// How a repository decides whose identity a signed commit carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustModel {
    #[default]
    Default,
    Collaborator,
    /// The signer is recorded as committer.
    Committer,
    CollaboratorCommitter,
}

impl TrustModel {
    pub fn signer_is_committer(self) -> bool {
        matches!(self, TrustModel::Committer | TrustModel::CollaboratorCommitter)
    }
}

/// Key used to sign the merge commit and the identity behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    pub key_id: String,
    pub signer: Signature,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    /// Key for merges into `repo` by `doer`, `None` when merges are unsigned.
    async fn signing_key(&self, repo: &Repository, doer: &User) -> Result<Option<SigningKey>>;

    fn trust_model(&self, repo: &Repository) -> TrustModel;
}

/// Signer for deployments without commit signing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSigning;

#[async_trait]
impl Signer for NoSigning {
    async fn signing_key(&self, _repo: &Repository, _doer: &User) -> Result<Option<SigningKey>> {
        Ok(None)
    }

    fn trust_model(&self, _repo: &Repository) -> TrustModel {
        TrustModel::Default
    }
}

/// Author and committer recorded on commits the engine creates.
///
/// The doer is both unless a signing key is used under a committer trust
/// model, in which case the signer commits.
pub fn commit_identities(doer: &User, key: Option<&SigningKey>, trust: TrustModel) -> (Signature, Signature) {
    let author = doer.signature();
    let committer = match key {
        Some(key) if trust.signer_is_committer() => key.signer.clone(),
        _ => author.clone(),
    };
    (author, committer)
}
