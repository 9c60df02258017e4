//! Pushing results back and classifying push failures.

use crate::error::MergeError;
use crate::git::{CommandError, CommandOutput};
use crate::types::{PullRequest, User};

const REMOTE_PREFIX: &str = "remote: ";

/// Turns a failed push into the matching error class.
pub fn classify_push_failure(command: &str, output: CommandOutput) -> MergeError {
    let CommandOutput {
        status_code,
        stdout,
        stderr,
    } = output;

    // "fetch first" when the new remote tip is not in the local object store
    if stderr.contains("non-fast-forward") || stderr.contains("(fetch first)") {
        MergeError::PushOutOfDate { stdout, stderr }
    } else if stderr.contains("! [remote rejected]") {
        MergeError::PushRejected {
            message: rejection_message(&stderr),
            stdout,
            stderr,
        }
    } else {
        MergeError::command(
            "push",
            CommandError::ExecutionFailed {
                command: command.to_string(),
                status_code,
                stdout,
                stderr,
            },
        )
    }
}

/// Collects the run of `remote: ` lines starting at the first one, which is
/// where server hooks explain a rejection.
pub fn rejection_message(stderr: &str) -> String {
    let Some(start) = stderr.find(REMOTE_PREFIX) else {
        return String::new();
    };

    let mut message = String::new();
    for line in stderr[start..].split_inclusive('\n') {
        let Some(text) = line.strip_prefix(REMOTE_PREFIX) else {
            break;
        };
        message.push_str(text);
    }
    message.trim().to_string()
}

/// Environment for pushes so receiving hooks can attribute the update.
pub fn pushing_env(pr: &PullRequest, doer: &User, internal: bool) -> Vec<(String, String)> {
    vec![
        ("PULL_MERGE_PUSHER_ID".into(), doer.id.to_string()),
        ("PULL_MERGE_PUSHER_NAME".into(), doer.name.clone()),
        ("PULL_MERGE_PUSHER_EMAIL".into(), doer.email.clone()),
        ("PULL_MERGE_REPO_ID".into(), pr.base_repo.id.to_string()),
        ("PULL_MERGE_REPO_NAME".into(), pr.base_repo.full_name()),
        ("PULL_MERGE_PR_ID".into(), pr.id.to_string()),
        ("PULL_MERGE_IS_INTERNAL".into(), internal.to_string()),
    ]
}
