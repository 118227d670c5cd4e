//! Checkpoints tie iterations to commits; rollback walks the chain back.

use super::git::GitTracker;
use crate::errors::CheckpointError;
use crate::orchestrator::state::{Checkpoint, SessionState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A whole-iteration rollback, planned by a review and carried out as its
/// own step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollback {
    pub from_iteration: u32,
    pub to_iteration: u32,
    /// Commit the workspace is reset to.
    pub commit: String,
    pub floor: u8,
    /// Consecutive falling reviews that triggered it.
    pub reviews: usize,
}

pub struct CheckpointManager {
    git: GitTracker,
}

impl CheckpointManager {
    pub fn open(root: &Path) -> Result<Self, CheckpointError> {
        Ok(Self {
            git: GitTracker::open_or_init(root)?,
        })
    }

    pub fn git(&self) -> &GitTracker {
        &self.git
    }

    /// Commit any pre-existing workspace content so the session has a base
    /// to diff against and roll back to.
    pub fn ensure_base(&self) -> Result<String, CheckpointError> {
        if let Some(sha) = self.git.commit_all("tandem: session base")? {
            return Ok(sha);
        }
        self.git
            .head_sha()
            .ok_or_else(|| CheckpointError::UnknownCommit("HEAD".into()))
    }

    /// Checkpoint the in-flight iteration.
    ///
    /// Idempotent: if the tree is already committed and HEAD is the last
    /// recorded commit, nothing happens. A HEAD that moved without being
    /// recorded (the implementer committed, or a previous run committed and
    /// stopped before persisting) is adopted instead of re-committed.
    pub fn checkpoint(&self, state: &SessionState) -> Result<Option<Checkpoint>, CheckpointError> {
        let iteration = state.iteration() + 1;
        let message = format!(
            "tandem: iteration {} (score {})",
            iteration,
            state
                .latest_score()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "n/a".into())
        );

        let (commit, adopted) = match self.git.commit_all(&message)? {
            Some(sha) => (sha, false),
            None => {
                let head = self.git.head_sha();
                let known = state
                    .latest_checkpoint()
                    .map(|c| c.commit.clone())
                    .or_else(|| state.last_reviewed_commit.clone())
                    .or_else(|| state.base_commit.clone());
                match head {
                    Some(head) if Some(&head) != known.as_ref() => {
                        tracing::info!(iteration, commit = %head, "Adopting unrecorded HEAD as checkpoint");
                        (head, true)
                    }
                    _ => return Ok(None),
                }
            }
        };

        tracing::info!(iteration, commit = %commit, "Checkpoint");
        Ok(Some(Checkpoint {
            iteration,
            commit,
            score: None,
            created_at: Utc::now(),
            adopted,
        }))
    }

    /// Plan a rollback to the most recent reviewed iteration scoring at or
    /// above `floor`. Nothing is touched; [`CheckpointManager::restore`]
    /// carries the plan out.
    ///
    /// Returns `None` when no earlier iteration qualifies.
    pub fn plan_rollback(
        &self,
        state: &SessionState,
        floor: u8,
        reviews: usize,
    ) -> Result<Option<Rollback>, CheckpointError> {
        let from_iteration = state.iteration();
        let Some(target) = state
            .score_history()
            .iter()
            .rev()
            .skip(1)
            .find(|entry| entry.score >= floor)
            .map(|entry| entry.iteration)
        else {
            return Ok(None);
        };

        let commit = state
            .commit_log
            .iter()
            .rev()
            .find(|c| c.iteration <= target)
            .map(|c| c.commit.clone())
            .or_else(|| state.base_commit.clone())
            .ok_or_else(|| CheckpointError::UnknownCommit("no checkpoint at or before target".into()))?;

        if !self.git.commit_exists(&commit) {
            return Err(CheckpointError::UnknownCommit(commit));
        }
        Ok(Some(Rollback {
            from_iteration,
            to_iteration: target,
            commit,
            floor,
            reviews,
        }))
    }

    /// Reset the workspace to the rollback's commit. Safe to repeat: a
    /// second reset to the same commit changes nothing.
    pub fn restore(&self, rollback: &Rollback) -> Result<(), CheckpointError> {
        self.git.reset_hard(&rollback.commit)?;
        tracing::warn!(
            from_iteration = rollback.from_iteration,
            to_iteration = rollback.to_iteration,
            commit = %rollback.commit,
            floor = rollback.floor,
            "Rolled back"
        );
        Ok(())
    }
}
