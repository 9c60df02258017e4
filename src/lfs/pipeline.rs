//! Six-stage scan for LFS pointers introduced by a merge.
//!
//! ```text
//! rev-list --objects ─▶ named objects ─▶ cat-file --batch-check
//!     ─▶ small blobs ─▶ cat-file --batch ─▶ register pointers
//! ```
//!
//! Stages are tasks joined by bounded channels and share one cancellation
//! token. A stage that fails records its error in a shared slot and then
//! cancels the others. Errors raised after the cancellation, such as a
//! broken pipe to a `cat-file` whose reader already stopped, count as
//! `Cancelled` and never displace the recorded cause. Every task is joined
//! before [`LfsMigrator::migrate`] returns.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LfsConfig;
use crate::error::{MergeError, Result};
use crate::git::{GitCommand, GitRunner};
use crate::types::RepoId;

use super::{LfsMetaObject, LfsMetaStore, Pointer};

/// One line of `cat-file --batch-check` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub sha: String,
    pub kind: String,
    pub size: u64,
}

/// Parses `<sha> <type> <size>`; `<sha> missing` and junk yield `None`.
pub fn parse_batch_header(line: &str) -> Option<ObjectInfo> {
    let mut fields = line.split_whitespace();
    let sha = fields.next()?;
    let kind = fields.next()?;
    let size = fields.next()?.parse().ok()?;
    Some(ObjectInfo {
        sha: sha.to_string(),
        kind: kind.to_string(),
        size,
    })
}

/// Object id of a `rev-list --objects` line that names a path.
pub fn named_object(line: &str) -> Option<&str> {
    let (sha, name) = line.split_once(' ')?;
    (!name.is_empty()).then_some(sha)
}

/// Range and repositories for one migration.
#[derive(Debug, Clone)]
pub struct MigrationRange {
    pub workspace: PathBuf,
    /// Tip after the merge.
    pub head: String,
    /// Base tip before the merge.
    pub base: String,
    pub head_repo_id: RepoId,
    pub base_repo_id: RepoId,
}

/// First failure of a pipeline run, shared by its stages.
#[derive(Clone)]
struct FirstFailure {
    slot: Arc<Mutex<Option<MergeError>>>,
    cancel: CancellationToken,
}

impl FirstFailure {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    /// Stores `error` unless a cause is already known, then cancels the
    /// pipeline. The slot is written before the token fires.
    fn record(&self, error: MergeError) {
        let error = if self.cancel.is_cancelled() {
            debug!(error = %error, "LFS pipeline stage failed after cancellation");
            MergeError::Cancelled
        } else {
            error
        };
        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            let replace = match slot.as_ref() {
                None => true,
                Some(MergeError::Cancelled) => !matches!(error, MergeError::Cancelled),
                Some(_) => false,
            };
            if replace {
                if !matches!(error, MergeError::Cancelled) {
                    warn!(error = %error, "LFS migration stage failed, cancelling pipeline");
                }
                *slot = Some(error);
            }
        }
        self.cancel.cancel();
    }

    fn take(&self) -> Option<MergeError> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn spawn<F>(&self, tasks: &mut JoinSet<usize>, stage: F)
    where
        F: Future<Output = Result<usize>> + Send + 'static,
    {
        let failure = self.clone();
        tasks.spawn(async move {
            match stage.await {
                Ok(count) => count,
                Err(e) => {
                    failure.record(e);
                    0
                }
            }
        });
    }
}

pub struct LfsMigrator {
    git: GitRunner,
    store: Arc<dyn LfsMetaStore>,
    size_limit: u64,
    capacity: usize,
}

impl LfsMigrator {
    pub fn new(git: GitRunner, store: Arc<dyn LfsMetaStore>, config: &LfsConfig) -> Self {
        Self {
            git,
            store,
            size_limit: config.pointer_size_limit,
            capacity: config.channel_capacity.max(1),
        }
    }

    /// Registers with the base repository every pointer reachable from
    /// `range.head` but not `range.base` that the head repository knows.
    /// Returns how many pointers were registered.
    pub async fn migrate(&self, range: &MigrationRange) -> Result<usize> {
        let cancel = self.git.cancellation().child_token();
        let failure = FirstFailure::new(cancel.clone());
        let mut tasks: JoinSet<usize> = JoinSet::new();

        let (lines_tx, lines_rx) = mpsc::channel::<String>(self.capacity);
        let (named_tx, named_rx) = mpsc::channel::<String>(self.capacity);
        let (info_tx, info_rx) = mpsc::channel::<ObjectInfo>(self.capacity);
        let (small_tx, small_rx) = mpsc::channel::<String>(self.capacity);
        let (blob_tx, blob_rx) = mpsc::channel::<(String, Vec<u8>)>(self.capacity);

        // 1. every object reachable from head and not from base
        let rev_list = self.git.spawn(
            &GitCommand::new(["rev-list", "--objects", range.head.as_str(), "--not", range.base.as_str()])
                .current_dir(&range.workspace),
            false,
        )?;
        failure.spawn(&mut tasks, read_lines(rev_list, "rev-list --objects", lines_tx, cancel.clone()));

        // 2. keep objects that have a path
        failure.spawn(&mut tasks, named_objects(lines_rx, named_tx));

        // 3. type and size of each candidate
        let batch_check = self.git.spawn(
            &GitCommand::new(["cat-file", "--batch-check"]).current_dir(&range.workspace),
            true,
        )?;
        spawn_batch_check(&mut tasks, &failure, batch_check, named_rx, info_tx)?;

        // 4. blobs small enough to be pointers
        failure.spawn(&mut tasks, small_blobs(info_rx, small_tx, self.size_limit));

        // 5. content of the survivors
        let batch = self
            .git
            .spawn(&GitCommand::new(["cat-file", "--batch"]).current_dir(&range.workspace), true)?;
        spawn_batch(&mut tasks, &failure, batch, small_rx, blob_tx)?;

        // 6. register pointers known to the head repository
        failure.spawn(
            &mut tasks,
            register_pointers(
                blob_rx,
                self.store.clone(),
                range.head_repo_id,
                range.base_repo_id,
                failure.clone(),
            ),
        );

        let mut migrated = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(count) => migrated += count,
                Err(e) => failure.record(MergeError::Lfs(format!("pipeline task failed: {e}"))),
            }
        }

        match failure.take() {
            Some(e) => Err(e),
            None => {
                info!(migrated, head = %range.head, base = %range.base, "LFS pointers migrated");
                Ok(migrated)
            }
        }
    }
}

fn take_stdout(child: &mut Child, what: &str) -> Result<ChildStdout> {
    child
        .stdout
        .take()
        .ok_or_else(|| MergeError::Lfs(format!("{what}: stdout not captured")))
}

fn take_stdin(child: &mut Child, what: &str) -> Result<ChildStdin> {
    child
        .stdin
        .take()
        .ok_or_else(|| MergeError::Lfs(format!("{what}: stdin not captured")))
}

/// Waits for `child` and turns a non-zero exit into an error.
async fn finish(mut child: Child, what: &str) -> Result<()> {
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_string(&mut stderr).await?;
    }
    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(MergeError::Lfs(format!("{what} exited with {status}: {}", stderr.trim())))
    }
}

async fn read_lines(
    mut child: Child,
    what: &'static str,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<usize> {
    let mut lines = BufReader::new(take_stdout(&mut child, what)?).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = cancel.cancelled() => return Err(MergeError::Cancelled),
        };
        let Some(line) = line else { break };
        if tx.send(line).await.is_err() {
            // Downstream is gone; its own error explains why.
            return Ok(0);
        }
    }
    drop(tx);
    finish(child, what).await?;
    Ok(0)
}

async fn named_objects(mut rx: mpsc::Receiver<String>, tx: mpsc::Sender<String>) -> Result<usize> {
    while let Some(line) = rx.recv().await {
        if let Some(sha) = named_object(&line) {
            if tx.send(sha.to_string()).await.is_err() {
                break;
            }
        }
    }
    Ok(0)
}

/// Feeds object ids to a `cat-file` process, closing its stdin when the
/// input ends so the process can finish.
async fn feed_ids(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>, cancel: CancellationToken) -> Result<usize> {
    loop {
        let sha = tokio::select! {
            sha = rx.recv() => sha,
            _ = cancel.cancelled() => return Ok(0),
        };
        let Some(sha) = sha else { break };
        stdin.write_all(sha.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
    }
    stdin.shutdown().await?;
    Ok(0)
}

fn spawn_batch_check(
    tasks: &mut JoinSet<usize>,
    failure: &FirstFailure,
    mut child: Child,
    rx: mpsc::Receiver<String>,
    tx: mpsc::Sender<ObjectInfo>,
) -> Result<()> {
    const WHAT: &str = "cat-file --batch-check";
    let stdin = take_stdin(&mut child, WHAT)?;
    let stdout = take_stdout(&mut child, WHAT)?;
    let cancel = failure.cancel.clone();
    failure.spawn(tasks, feed_ids(stdin, rx, cancel.clone()));
    failure.spawn(tasks, async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = cancel.cancelled() => return Err(MergeError::Cancelled),
            };
            let Some(line) = line else { break };
            let Some(info) = parse_batch_header(&line) else {
                debug!(%line, "Skipping unreadable object");
                continue;
            };
            if tx.send(info).await.is_err() {
                return Ok(0);
            }
        }
        drop(tx);
        finish(child, WHAT).await?;
        Ok(0)
    });
    Ok(())
}

async fn small_blobs(mut rx: mpsc::Receiver<ObjectInfo>, tx: mpsc::Sender<String>, limit: u64) -> Result<usize> {
    while let Some(info) = rx.recv().await {
        if info.kind == "blob" && info.size <= limit && tx.send(info.sha).await.is_err() {
            break;
        }
    }
    Ok(0)
}

fn spawn_batch(
    tasks: &mut JoinSet<usize>,
    failure: &FirstFailure,
    mut child: Child,
    rx: mpsc::Receiver<String>,
    tx: mpsc::Sender<(String, Vec<u8>)>,
) -> Result<()> {
    const WHAT: &str = "cat-file --batch";
    let stdin = take_stdin(&mut child, WHAT)?;
    let stdout = take_stdout(&mut child, WHAT)?;
    let cancel = failure.cancel.clone();
    failure.spawn(tasks, feed_ids(stdin, rx, cancel.clone()));
    failure.spawn(tasks, async move {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut header = String::new();
            let read = tokio::select! {
                read = reader.read_line(&mut header) => read?,
                _ = cancel.cancelled() => return Err(MergeError::Cancelled),
            };
            if read == 0 {
                break;
            }
            let Some(info) = parse_batch_header(&header) else {
                if header.trim_end().ends_with("missing") {
                    continue;
                }
                return Err(MergeError::Lfs(format!("{WHAT}: malformed header {:?}", header.trim_end())));
            };

            let size = usize::try_from(info.size)
                .map_err(|_| MergeError::Lfs(format!("{WHAT}: object {} too large", info.sha)))?;
            let mut content = vec![0; size];
            reader.read_exact(&mut content).await?;
            // Each object is followed by a newline.
            let mut newline = [0u8; 1];
            reader.read_exact(&mut newline).await?;

            if tx.send((info.sha, content)).await.is_err() {
                return Ok(0);
            }
        }
        drop(tx);
        finish(child, WHAT).await?;
        Ok(0)
    });
    Ok(())
}

/// Final consumer. A store failure is recorded at once, before upstream
/// stages notice the cancellation, and the channel is then drained so no
/// producer stays blocked on it.
async fn register_pointers(
    mut rx: mpsc::Receiver<(String, Vec<u8>)>,
    store: Arc<dyn LfsMetaStore>,
    head_repo_id: RepoId,
    base_repo_id: RepoId,
    failure: FirstFailure,
) -> Result<usize> {
    let mut failed = false;
    let mut migrated = 0;

    while let Some((sha, content)) = rx.recv().await {
        if failed {
            continue;
        }
        // Most small blobs are ordinary files.
        let Ok(pointer) = Pointer::parse(&content) else {
            continue;
        };
        match register(store.as_ref(), &pointer, head_repo_id, base_repo_id).await {
            Ok(true) => migrated += 1,
            Ok(false) => {
                warn!(blob = %sha, oid = %pointer.oid, head_repo_id, "LFS object not registered with head repository, skipping");
            }
            Err(e) => {
                failure.record(e);
                failed = true;
            }
        }
    }

    Ok(if failed { 0 } else { migrated })
}

async fn register(
    store: &dyn LfsMetaStore,
    pointer: &Pointer,
    head_repo_id: RepoId,
    base_repo_id: RepoId,
) -> Result<bool> {
    if store.get_meta_object(head_repo_id, &pointer.oid).await?.is_none() {
        return Ok(false);
    }
    store
        .new_meta_object(LfsMetaObject {
            oid: pointer.oid.clone(),
            size: pointer.size,
            repository_id: base_repo_id,
        })
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_object_skips_commits_and_root_tree() {
        assert_eq!(named_object("1111111111111111111111111111111111111111"), None);
        assert_eq!(named_object("2222222222222222222222222222222222222222 "), None);
        assert_eq!(
            named_object("3333333333333333333333333333333333333333 assets/logo.png"),
            Some("3333333333333333333333333333333333333333")
        );
        assert_eq!(named_object("4444 dir/with space.txt"), Some("4444"));
    }

    #[test]
    fn test_parse_batch_header() {
        assert_eq!(
            parse_batch_header("abc blob 130\n"),
            Some(ObjectInfo {
                sha: "abc".into(),
                kind: "blob".into(),
                size: 130
            })
        );
        assert_eq!(parse_batch_header("abc missing"), None);
        assert_eq!(parse_batch_header(""), None);
    }

    #[test]
    fn test_fallout_after_cancellation_keeps_cause() {
        let failure = FirstFailure::new(CancellationToken::new());
        failure.record(MergeError::Lfs("db down".into()));
        assert!(failure.cancel.is_cancelled());

        let broken_pipe = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        failure.record(MergeError::from(broken_pipe));
        failure.record(MergeError::Cancelled);

        match failure.take() {
            Some(MergeError::Lfs(message)) => assert_eq!(message, "db down"),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[test]
    fn test_failure_after_outside_cancellation_is_cancelled() {
        let cancel = CancellationToken::new();
        let failure = FirstFailure::new(cancel.child_token());
        cancel.cancel();

        failure.record(MergeError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)));
        assert!(matches!(failure.take(), Some(MergeError::Cancelled)));
    }
}
