use serde::{Deserialize, Serialize};
use statig::prelude::*;

use crate::types::{MergeStyle, PullId};

/// Observable phase of one merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Prepared,
    Merging,
    Committed,
    Pushed,
    Done,
    ConflictDuringMerge,
    PushOutOfDate,
    PushRejected,
}

impl AttemptPhase {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            AttemptPhase::ConflictDuringMerge | AttemptPhase::PushOutOfDate | AttemptPhase::PushRejected
        )
    }

    pub fn is_terminal(self) -> bool {
        self == AttemptPhase::Done || self.is_failure()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    Start,
    Conflicted { files: Vec<String>, commit: Option<String> },
    Committed { commit_id: String },
    Pushed,
    PushOutOfDate,
    PushRejected { message: String },
    Finish,
}

/// Lifecycle of a merge attempt:
/// `Prepared -> Merging -> Committed -> Pushed -> Done`, with
/// `ConflictDuringMerge` reachable from `Merging` and both push failures
/// reachable from `Committed`. Events that do not apply are ignored.
#[derive(Debug, Clone)]
pub struct MergeAttempt {
    pull_id: PullId,
    style: MergeStyle,
    phase: AttemptPhase,
    commit_id: Option<String>,
    conflicted_files: Vec<String>,
    conflicting_commit: Option<String>,
    rejection: Option<String>,
}

impl MergeAttempt {
    pub fn new(pull_id: PullId, style: MergeStyle) -> Self {
        Self {
            pull_id,
            style,
            phase: AttemptPhase::Prepared,
            commit_id: None,
            conflicted_files: Vec::new(),
            conflicting_commit: None,
            rejection: None,
        }
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    pub fn commit_id(&self) -> Option<&str> {
        self.commit_id.as_deref()
    }

    pub fn conflicted_files(&self) -> &[String] {
        &self.conflicted_files
    }

    pub fn conflicting_commit(&self) -> Option<&str> {
        self.conflicting_commit.as_deref()
    }

    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    fn enter(&mut self, phase: AttemptPhase) {
        tracing::debug!(
            pull_id = self.pull_id,
            style = %self.style,
            from = ?self.phase,
            to = ?phase,
            "Merge attempt transition"
        );
        self.phase = phase;
    }
}

#[state_machine(initial = "State::prepared()")]
impl MergeAttempt {
    #[state]
    fn prepared(&mut self, event: &AttemptEvent) -> Outcome<State> {
        match event {
            AttemptEvent::Start => {
                self.enter(AttemptPhase::Merging);
                Transition(State::merging())
            }
            _ => Handled,
        }
    }

    #[state]
    fn merging(&mut self, event: &AttemptEvent) -> Outcome<State> {
        match event {
            AttemptEvent::Conflicted { files, commit } => {
                self.conflicted_files = files.clone();
                self.conflicting_commit = commit.clone();
                self.enter(AttemptPhase::ConflictDuringMerge);
                Transition(State::conflict_during_merge())
            }
            AttemptEvent::Committed { commit_id } => {
                self.commit_id = Some(commit_id.clone());
                self.enter(AttemptPhase::Committed);
                Transition(State::committed())
            }
            _ => Handled,
        }
    }

    #[state]
    fn committed(&mut self, event: &AttemptEvent) -> Outcome<State> {
        match event {
            AttemptEvent::Pushed => {
                self.enter(AttemptPhase::Pushed);
                Transition(State::pushed())
            }
            AttemptEvent::PushOutOfDate => {
                self.enter(AttemptPhase::PushOutOfDate);
                Transition(State::push_out_of_date())
            }
            AttemptEvent::PushRejected { message } => {
                self.rejection = Some(message.clone());
                self.enter(AttemptPhase::PushRejected);
                Transition(State::push_rejected())
            }
            _ => Handled,
        }
    }

    #[state]
    fn pushed(&mut self, event: &AttemptEvent) -> Outcome<State> {
        match event {
            AttemptEvent::Finish => {
                self.enter(AttemptPhase::Done);
                Transition(State::done())
            }
            _ => Handled,
        }
    }

    #[state]
    fn done(&mut self) -> Outcome<State> {
        Handled
    }

    #[state]
    fn conflict_during_merge(&mut self) -> Outcome<State> {
        Handled
    }

    #[state]
    fn push_out_of_date(&mut self) -> Outcome<State> {
        Handled
    }

    #[state]
    fn push_rejected(&mut self) -> Outcome<State> {
        Handled
    }
}
