// Pull Merge Library - pull request merge engine over local git repositories
// This exposes the core components for hosts, the CLI and integration tests

pub mod automerge;
pub mod collaborators;
pub mod config;
pub mod conflict;
pub mod database;
pub mod error;
pub mod gate;
pub mod git;
pub mod lfs;
pub mod memory;
pub mod merge;
pub mod observability;
pub mod service;
pub mod shutdown;
pub mod telemetry;
pub mod types;
pub mod workspace;

// Re-export key types for easy access
pub use automerge::{AutoMergeService, AutoMergeWorker, ScheduleOutcome, ScheduleStore, UniqueQueue};
pub use collaborators::{MergeEvent, Notifier, PolicyService, PullRequestStore, TracingNotifier, UserDirectory};
pub use config::{ConflictDetection, EngineConfig};
pub use conflict::ConflictDetector;
pub use error::{ErrorClass, MergeError, Result};
pub use gate::{BranchProtection, GateRejection, PermissionSnapshot, ReviewSummary};
pub use git::{Git2Backend, GitRunner};
pub use lfs::{LfsMetaObject, LfsMetaStore, LfsMigrator, Pointer};
pub use merge::attempt::AttemptPhase;
pub use merge::signing::{NoSigning, Signer, SigningKey, TrustModel};
pub use merge::strategies::FileResolution;
pub use merge::{MergeExecutor, MergeMessage, MergeOutcome, MergeRequest, ResolutionAction};
pub use observability::{MergeMetrics, OperationTimer};
pub use service::{Collaborators, MergeOptions, PullService};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use types::{
    CommitStatus, CommitStatusState, ConflictReport, MergeStyle, PullId, PullRequest, PullRequestStatus, RepoId,
    Repository, ScheduledAutoMerge, Signature, User,
};
pub use workspace::{RepoBuilder, TemporaryRepo};
