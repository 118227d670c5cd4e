//! The session state record owned by the orchestrator.
//!
//! Phase, iteration and score history are private: they change only through
//! named operations (`apply`, `record_review`, `rewind_to`) so that the
//! transition table and the `score_history.len() == iteration` invariant
//! cannot be bypassed.

use crate::agents::{ReviewVerdict, TodoDelta};
use crate::errors::StateError;
use crate::phase::{PauseReason, Phase, PhaseEvent, PhasePolicy, TransitionError, transition};
use crate::tracker::Rollback;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Bumped whenever the on-disk shape changes incompatibly.
pub const STATE_VERSION: u32 = 1;

/// Notes kept per role; older notes are dropped first.
pub const MAX_NOTES_PER_ROLE: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub iteration: u32,
    /// Phase the review ran in (before any transition it caused).
    pub phase: Phase,
    pub score: u8,
    pub timestamp: DateTime<Utc>,
}

/// A version-control commit tied to an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub iteration: u32,
    pub commit: String,
    /// Review score of the tree at this checkpoint, once reviewed.
    pub score: Option<u8>,
    pub created_at: DateTime<Utc>,
    /// An existing HEAD taken over as the checkpoint rather than a new
    /// commit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub adopted: bool,
}

/// Next undone step of the in-flight iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Implement,
    Checkpoint,
    Review,
    /// Restore the workspace to the scheduled rollback target.
    Rollback,
    Align,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub session_id: Uuid,
    /// SHA-256 of the idea specification the session was started with.
    pub idea_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    paused_from: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,

    iteration: u32,
    pub cursor: Step,
    score_history: Vec<ScoreEntry>,

    pub pending_instructions: String,
    #[serde(default)]
    pub memory_notes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub todos: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_turn_summary: Option<String>,

    #[serde(default)]
    pub commit_log: Vec<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed_commit: Option<String>,
    #[serde(default)]
    pub total_commits: u32,
    #[serde(default)]
    pub rollbacks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_rollback: Option<Rollback>,
    #[serde(default)]
    pub active_runtime_secs: u64,
}

impl SessionState {
    /// Fresh state for a new session.
    pub fn new(idea_hash: &str, initial_instructions: &str, base_commit: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            session_id: Uuid::new_v4(),
            idea_hash: idea_hash.to_string(),
            created_at: now,
            updated_at: now,
            phase: Phase::Implementation,
            paused_from: None,
            pause_reason: None,
            failure: None,
            iteration: 0,
            cursor: Step::Implement,
            score_history: Vec::new(),
            pending_instructions: initial_instructions.to_string(),
            memory_notes: BTreeMap::new(),
            todos: Vec::new(),
            last_turn_summary: None,
            commit_log: Vec::new(),
            last_reviewed_commit: base_commit.clone(),
            base_commit,
            total_commits: 0,
            rollbacks: 0,
            pending_rollback: None,
            active_runtime_secs: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn paused_from(&self) -> Option<Phase> {
        self.paused_from
    }

    /// Number of completed (reviewed) iterations.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn score_history(&self) -> &[ScoreEntry] {
        &self.score_history
    }

    pub fn scores(&self) -> Vec<u8> {
        self.score_history.iter().map(|e| e.score).collect()
    }

    pub fn latest_score(&self) -> Option<u8> {
        self.score_history.last().map(|e| e.score)
    }

    /// The phase iterations run in: the current phase, or the phase a paused
    /// session will resume into.
    pub fn working_phase(&self) -> Phase {
        self.paused_from.unwrap_or(self.phase)
    }

    /// Apply a non-review event through the transition table.
    pub fn apply(&mut self, event: PhaseEvent, policy: &PhasePolicy) -> Result<Phase, TransitionError> {
        let next = transition(self.phase, self.paused_from, &event, policy)?;
        match &event {
            PhaseEvent::Pause(reason) => {
                self.paused_from = Some(self.phase);
                self.pause_reason = Some(*reason);
            }
            PhaseEvent::Resume => {
                self.paused_from = None;
                self.pause_reason = None;
            }
            PhaseEvent::Fail(reason) => {
                self.paused_from = None;
                self.failure = Some(reason.clone());
            }
            PhaseEvent::Reviewed { .. } | PhaseEvent::Rollback { .. } => {}
        }
        self.phase = next;
        self.touch();
        Ok(next)
    }

    /// Fold a review verdict into the state and evaluate the transition
    /// table. Returns `(phase_before, phase_after)`.
    ///
    /// Nothing is mutated if the transition is rejected.
    pub fn record_review(
        &mut self,
        verdict: &ReviewVerdict,
        memory_role: &str,
        policy: &PhasePolicy,
    ) -> Result<(Phase, Phase), TransitionError> {
        let before = self.phase;
        let prior_testing_score = match (before, self.score_history.last()) {
            (Phase::Testing, Some(last)) if last.phase == Phase::Testing => Some(last.score),
            _ => None,
        };
        let event = PhaseEvent::Reviewed {
            score: verdict.score,
            prior_testing_score,
        };
        let after = transition(before, self.paused_from, &event, policy)?;

        self.iteration += 1;
        self.score_history.push(ScoreEntry {
            iteration: self.iteration,
            phase: before,
            score: verdict.score,
            timestamp: Utc::now(),
        });
        if !verdict.next_instructions.trim().is_empty() {
            self.pending_instructions = verdict.next_instructions.trim().to_string();
        }
        self.apply_todo_deltas(&verdict.todo_deltas);
        self.remember(memory_role, verdict.memory_notes.iter().cloned());
        self.phase = after;
        self.touch();
        Ok((before, after))
    }

    /// Replace the implementer's task, e.g. after drift was detected.
    pub fn override_instructions(&mut self, instructions: &str) {
        self.pending_instructions = instructions.trim().to_string();
        self.touch();
    }

    /// Append notes to a role's memory, keeping the newest
    /// `MAX_NOTES_PER_ROLE`.
    pub fn remember<I>(&mut self, role: &str, notes: I)
    where
        I: IntoIterator<Item = String>,
    {
        let bucket = self.memory_notes.entry(role.to_string()).or_default();
        for note in notes {
            let note = note.trim();
            if !note.is_empty() && !bucket.iter().any(|n| n == note) {
                bucket.push(note.to_string());
            }
        }
        if bucket.len() > MAX_NOTES_PER_ROLE {
            let excess = bucket.len() - MAX_NOTES_PER_ROLE;
            bucket.drain(..excess);
        }
        if bucket.is_empty() {
            self.memory_notes.remove(role);
        }
    }

    pub fn memory_for(&self, role: &str) -> &[String] {
        self.memory_notes
            .get(role)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn apply_todo_deltas(&mut self, deltas: &[TodoDelta]) {
        for delta in deltas {
            match delta {
                TodoDelta::Add(item) => {
                    let item = item.trim();
                    if !item.is_empty() && !self.todos.iter().any(|t| t == item) {
                        self.todos.push(item.to_string());
                    }
                }
                TodoDelta::Done(item) => {
                    let item = item.trim();
                    self.todos.retain(|t| !t.eq_ignore_ascii_case(item));
                }
            }
        }
    }

    /// Record a checkpoint commit for the in-flight iteration. Adopted
    /// commits were counted when they were made.
    pub fn push_checkpoint(&mut self, checkpoint: Checkpoint) {
        if !checkpoint.adopted {
            self.total_commits += 1;
        }
        self.commit_log.push(checkpoint);
        self.touch();
    }

    /// Count commits the implementer made through `vcs_commit`.
    pub fn record_implementer_commits(&mut self, commits: u32) {
        if commits > 0 {
            self.total_commits += commits;
            self.touch();
        }
    }

    /// Attach the review score of `iteration` to its checkpoint, if any.
    pub fn score_checkpoint(&mut self, iteration: u32, score: u8) {
        if let Some(checkpoint) = self
            .commit_log
            .iter_mut()
            .rev()
            .find(|c| c.iteration == iteration)
        {
            checkpoint.score = Some(score);
        }
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.commit_log.last()
    }

    /// Schedule a rollback decided by the latest review. The workspace is
    /// restored by the `Rollback` step that follows.
    pub fn schedule_rollback(&mut self, rollback: Rollback) {
        self.pending_rollback = Some(rollback);
        self.cursor = Step::Rollback;
        self.touch();
    }

    pub fn pending_rollback(&self) -> Option<&Rollback> {
        self.pending_rollback.as_ref()
    }

    /// Rewind to the end of iteration `target`, discarding later reviews and
    /// checkpoints. Used by whole-iteration rollback.
    ///
    /// The phase moves through the transition table to the one iteration
    /// `target + 1` originally ran in, i.e. the outcome of review `target`.
    /// Nothing is mutated if the transition is rejected.
    pub fn rewind_to(
        &mut self,
        target: u32,
        restored_commit: Option<String>,
        policy: &PhasePolicy,
    ) -> Result<Phase, TransitionError> {
        let target = target.min(self.iteration);
        let restored = self
            .score_history
            .get(target as usize)
            .map(|entry| entry.phase)
            .unwrap_or(self.phase);
        let next = transition(
            self.phase,
            self.paused_from,
            &PhaseEvent::Rollback { restored },
            policy,
        )?;

        self.score_history.truncate(target as usize);
        self.iteration = target;
        self.commit_log.retain(|c| c.iteration <= target);
        self.last_reviewed_commit = restored_commit;
        self.rollbacks += 1;
        self.pending_rollback = None;
        self.cursor = Step::Implement;
        self.phase = next;
        self.touch();
        Ok(next)
    }

    pub fn advance(&mut self, step: Step) {
        self.cursor = step;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Check the structural invariants of a loaded state.
    ///
    /// `idea_hash` is the hash of the idea specification on disk; a mismatch
    /// means the immutable input changed underneath the session.
    pub fn validate(&self, idea_hash: Option<&str>) -> Result<(), StateError> {
        let fail = |msg: String| Err(StateError::Validation(msg));

        if self.version != STATE_VERSION {
            return fail(format!(
                "unsupported state version {} (expected {})",
                self.version, STATE_VERSION
            ));
        }
        if self.score_history.len() != self.iteration as usize {
            return fail(format!(
                "score_history has {} entries but iteration is {}",
                self.score_history.len(),
                self.iteration
            ));
        }
        for (index, entry) in self.score_history.iter().enumerate() {
            if entry.iteration != index as u32 + 1 {
                return fail(format!(
                    "score_history entry {} is labelled iteration {}",
                    index + 1,
                    entry.iteration
                ));
            }
            if entry.score > 100 {
                return fail(format!(
                    "score {} at iteration {} is out of range",
                    entry.score, entry.iteration
                ));
            }
            if !entry.phase.is_active() {
                return fail(format!(
                    "review at iteration {} recorded in non-active phase {}",
                    entry.iteration, entry.phase
                ));
            }
        }
        match (self.phase, self.paused_from) {
            (Phase::Paused, Some(previous)) if previous.is_active() => {}
            (Phase::Paused, _) => return fail("paused state has no resumable phase".into()),
            (_, Some(previous)) => {
                return fail(format!(
                    "phase {} carries a paused_from of {}",
                    self.phase, previous
                ));
            }
            _ => {}
        }
        let mut last_iteration = 0;
        for checkpoint in &self.commit_log {
            if checkpoint.iteration < last_iteration {
                return fail("commit_log is not ordered by iteration".into());
            }
            if checkpoint.iteration > self.iteration + 1 {
                return fail(format!(
                    "checkpoint for iteration {} is ahead of iteration {}",
                    checkpoint.iteration, self.iteration
                ));
            }
            if checkpoint.commit.is_empty() {
                return fail("checkpoint with empty commit id".into());
            }
            last_iteration = checkpoint.iteration;
        }
        if self.cursor == Step::Align && self.iteration == 0 {
            return fail("alignment step pending before any review".into());
        }
        match (&self.pending_rollback, self.cursor) {
            (None, Step::Rollback) => return fail("rollback step pending without a target".into()),
            (Some(rollback), Step::Rollback) => {
                if rollback.to_iteration >= self.iteration || rollback.from_iteration != self.iteration {
                    return fail(format!(
                        "pending rollback {} -> {} does not fit iteration {}",
                        rollback.from_iteration, rollback.to_iteration, self.iteration
                    ));
                }
                if rollback.commit.is_empty() {
                    return fail("pending rollback with empty commit id".into());
                }
            }
            (Some(_), _) => return fail("pending rollback outside the rollback step".into()),
            (None, _) => {}
        }
        if let Some(expected) = idea_hash
            && expected != self.idea_hash
        {
            return fail("idea specification changed since the session started".into());
        }
        Ok(())
    }
}
