//! Session phases and the transition table that governs them.
//!
//! `transition` is the only function that computes a new phase. Session
//! state applies its result through a named operation, so no caller can
//! set a phase ad hoc.
//!
//! | From             | Event                                        | To               |
//! |------------------|----------------------------------------------|------------------|
//! | `IMPLEMENTATION` | review score >= phase threshold              | `TESTING`        |
//! | `TESTING`        | two consecutive reviews >= completion        | `COMPLETE`       |
//! | `TESTING`        | review score < phase threshold - margin      | `IMPLEMENTATION` |
//! | active           | rollback to an earlier iteration             | restored active  |
//! | active           | resource limit or pause request              | `PAUSED`         |
//! | `PAUSED`         | resume                                       | previous active  |
//! | non-terminal     | unrecoverable condition                      | `FAILED`         |

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Implementation,
    Testing,
    Complete,
    Paused,
    Failed,
}

impl Phase {
    /// `COMPLETE` and `FAILED` end a session for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    /// Phases in which iterations run.
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Implementation | Phase::Testing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Implementation => "IMPLEMENTATION",
            Phase::Testing => "TESTING",
            Phase::Complete => "COMPLETE",
            Phase::Paused => "PAUSED",
            Phase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Why a session paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    MaxIterations,
    MaxRuntime,
    MaxCommits,
    Requested,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PauseReason::MaxIterations => "iteration limit reached",
            PauseReason::MaxRuntime => "runtime limit reached",
            PauseReason::MaxCommits => "commit limit reached",
            PauseReason::Requested => "pause requested",
        };
        f.write_str(text)
    }
}

/// Inputs to the transition table.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEvent {
    /// A review verdict was folded in. `prior_testing_score` is the score of
    /// the immediately preceding review if that review also ran in `TESTING`.
    Reviewed {
        score: u8,
        prior_testing_score: Option<u8>,
    },
    /// The workspace was restored to an earlier iteration. `restored` is
    /// the phase the following iteration originally ran in.
    Rollback {
        restored: Phase,
    },
    Pause(PauseReason),
    Resume,
    Fail(String),
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseEvent::Reviewed { score, .. } => write!(f, "reviewed({})", score),
            PhaseEvent::Rollback { restored } => write!(f, "rollback({})", restored),
            PhaseEvent::Pause(reason) => write!(f, "pause({})", reason),
            PhaseEvent::Resume => f.write_str("resume"),
            PhaseEvent::Fail(reason) => write!(f, "fail({})", reason),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Phase transition {from} -> {event} is not permitted")]
pub struct TransitionError {
    pub from: Phase,
    pub event: String,
}

/// Tunable thresholds for phase advancement, regression and rollback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhasePolicy {
    /// Score that moves IMPLEMENTATION to TESTING.
    pub phase_threshold: u8,
    /// Score required on two consecutive TESTING reviews to complete.
    pub completion_threshold: u8,
    /// How far below `phase_threshold` a TESTING review must fall before
    /// the session drops back to IMPLEMENTATION.
    pub regression_margin: u8,
    /// Number of consecutive falling reviews that trigger a rollback.
    /// Zero disables rollback.
    pub regression_window: usize,
}

impl Default for PhasePolicy {
    fn default() -> Self {
        Self {
            phase_threshold: 70,
            completion_threshold: 95,
            regression_margin: 10,
            regression_window: 3,
        }
    }
}

/// A run of consecutive falling review scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regression {
    /// Score of the review just before the decline started.
    pub floor: u8,
    /// Number of falling reviews observed.
    pub reviews: usize,
}

impl PhasePolicy {
    /// Detect `regression_window` consecutive reviews each scoring below the
    /// one before it.
    pub fn detect_regression(&self, scores: &[u8]) -> Option<Regression> {
        let window = self.regression_window;
        if window == 0 || scores.len() < window + 1 {
            return None;
        }
        let tail = &scores[scores.len() - window - 1..];
        let falling = tail.windows(2).all(|pair| pair[1] < pair[0]);
        falling.then(|| Regression {
            floor: tail[0],
            reviews: window,
        })
    }
}

/// Compute the phase that follows `current` on `event`.
///
/// `paused_from` is the active phase a paused session returns to.
pub fn transition(
    current: Phase,
    paused_from: Option<Phase>,
    event: &PhaseEvent,
    policy: &PhasePolicy,
) -> Result<Phase, TransitionError> {
    let invalid = || TransitionError {
        from: current,
        event: event.to_string(),
    };

    match (current, event) {
        (Phase::Implementation, PhaseEvent::Reviewed { score, .. }) => {
            if *score >= policy.phase_threshold {
                Ok(Phase::Testing)
            } else {
                Ok(Phase::Implementation)
            }
        }
        (
            Phase::Testing,
            PhaseEvent::Reviewed {
                score,
                prior_testing_score,
            },
        ) => {
            let completes = *score >= policy.completion_threshold
                && prior_testing_score.is_some_and(|prior| prior >= policy.completion_threshold);
            let regression_floor = policy
                .phase_threshold
                .saturating_sub(policy.regression_margin);
            if completes {
                Ok(Phase::Complete)
            } else if *score < regression_floor {
                Ok(Phase::Implementation)
            } else {
                Ok(Phase::Testing)
            }
        }
        (Phase::Implementation | Phase::Testing, PhaseEvent::Rollback { restored })
            if restored.is_active() =>
        {
            Ok(*restored)
        }
        (Phase::Implementation | Phase::Testing, PhaseEvent::Pause(_)) => Ok(Phase::Paused),
        (Phase::Paused, PhaseEvent::Resume) => match paused_from {
            Some(previous) if previous.is_active() => Ok(previous),
            _ => Err(invalid()),
        },
        (phase, PhaseEvent::Fail(_)) if !phase.is_terminal() => Ok(Phase::Failed),
        _ => Err(invalid()),
    }
}
