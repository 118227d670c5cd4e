//! The control loop.
//!
//! One iteration is four persisted steps: implement, checkpoint, review and
//! (every `alignment_interval` iterations) align. A review that detects a
//! regression schedules a rollback step in place of alignment. The cursor in the session
//! state names the next undone step, and state is saved after every step,
//! so a resumed session re-runs at most the step that was in flight.

use super::state::{ScoreEntry, SessionState, Step};
use super::store::StateStore;
use super::watchdog::{Limits, Watchdog, WatchdogHandle};
use crate::agents::context::{ReviewEvidence, reviewer_memory_role};
use crate::agents::{AlignmentChecker, ContextBuilder, Implementer, Reviewer, Role, TurnEnd};
use crate::audit::{AuditLogger, IterationAudit, RollbackAudit, TurnAudit};
use crate::config::Config;
use crate::errors::{GatewayError, OrchestratorError, RoleError, SandboxError};
use crate::gateway::ModelGateway;
use crate::phase::{PauseReason, Phase, PhaseEvent, PhasePolicy};
use crate::sandbox::{Sandbox, ToolRegistry};
use crate::tracker::CheckpointManager;
use crate::util::sha256_hex;
use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const INITIAL_INSTRUCTIONS: &str = "Start implementing the idea specification. Set up the project \
skeleton first, then build the core features one at a time.";

/// Loop settings that are not phase policy.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub limits: Limits,
    /// 0 disables the alignment check.
    pub alignment_interval: u32,
    pub max_rollbacks: u32,
    pub max_violations_per_iteration: usize,
    pub review_command: Option<String>,
    pub pause_file: PathBuf,
    pub watchdog_poll: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        let toml = &config.toml;
        Self {
            limits: Limits {
                max_iterations: toml.limits.max_iterations,
                max_runtime: toml.limits.max_runtime(),
                max_commits: toml.limits.max_commits,
            },
            alignment_interval: toml.session.alignment_interval,
            max_rollbacks: toml.session.max_rollbacks,
            max_violations_per_iteration: toml.limits.max_violations_per_iteration,
            review_command: toml.context.review_command.clone(),
            pause_file: config.pause_file(),
            watchdog_poll: Duration::from_millis(500),
        }
    }

    fn alignment_due(&self, iteration: u32) -> bool {
        self.alignment_interval > 0 && iteration > 0 && iteration % self.alignment_interval == 0
    }
}

/// What every termination reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub session_id: Uuid,
    pub phase: Phase,
    pub iteration: u32,
    pub score_history: Vec<ScoreEntry>,
    pub pause_reason: Option<PauseReason>,
    pub failure: Option<String>,
    pub total_commits: u32,
    pub rollbacks: u32,
}

impl RunReport {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id,
            phase: state.phase(),
            iteration: state.iteration(),
            score_history: state.score_history().to_vec(),
            pause_reason: state.pause_reason,
            failure: state.failure.clone(),
            total_commits: state.total_commits,
            rollbacks: state.rollbacks,
        }
    }

    pub fn render(&self) -> String {
        let mut phase = self.phase.to_string();
        if let Some(reason) = self.pause_reason {
            phase.push_str(&format!(" ({})", reason));
        }
        if let Some(failure) = &self.failure {
            phase.push_str(&format!(" ({})", failure));
        }
        let scores = if self.score_history.is_empty() {
            "(none)".to_string()
        } else {
            self.score_history
                .iter()
                .map(|e| e.score.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        };
        format!(
            "Phase:      {}\nIterations: {}\nCommits:    {} (rollbacks: {})\nScores:     {}",
            phase, self.iteration, self.total_commits, self.rollbacks, scores
        )
    }
}

/// What this run knows about the iteration in flight. Lost on restart; the
/// audit line then omits the turn counts.
struct InFlight {
    started_at: DateTime<Utc>,
    clock: Instant,
    phase_before: Phase,
    turn: Option<TurnAudit>,
    checkpoint: Option<String>,
    aligned: Option<bool>,
    rollback: Option<RollbackAudit>,
}

impl InFlight {
    fn new(phase: Phase) -> Self {
        Self {
            started_at: Utc::now(),
            clock: Instant::now(),
            phase_before: phase,
            turn: None,
            checkpoint: None,
            aligned: None,
            rollback: None,
        }
    }
}

enum StepOutcome {
    Continue,
    /// Cancelled at a safe point.
    Interrupted,
    Fail(String),
}

fn role_outcome(err: RoleError) -> StepOutcome {
    match err {
        RoleError::Gateway(GatewayError::Cancelled) => StepOutcome::Interrupted,
        other => StepOutcome::Fail(other.to_string()),
    }
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

pub struct Orchestrator {
    idea: String,
    idea_hash: String,
    store: StateStore,
    checkpoints: CheckpointManager,
    sandbox: Sandbox,
    registry: ToolRegistry,
    context: ContextBuilder,
    implementer: Implementer,
    reviewer: Reviewer,
    alignment: AlignmentChecker,
    audit: AuditLogger,
    policy: PhasePolicy,
    settings: LoopSettings,
    run_id: Uuid,
    in_flight: Option<InFlight>,
}

impl Orchestrator {
    /// Wire up a controller for `config.project_dir`. Takes the workspace
    /// lock for as long as the orchestrator lives.
    pub fn new(config: &Config, gateway: Arc<dyn ModelGateway>) -> Result<Self, OrchestratorError> {
        config.ensure_directories()?;
        let toml = &config.toml;
        let idea_path = config.idea_file();
        let idea = std::fs::read_to_string(&idea_path)
            .with_context(|| format!("Failed to read idea specification: {}", idea_path.display()))?;
        if idea.trim().is_empty() {
            return Err(anyhow!("Idea specification is empty: {}", idea_path.display()).into());
        }
        let idea_rel = idea_path
            .strip_prefix(&config.project_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| toml.project.idea_file.clone());

        let store = StateStore::open(&config.state_file(), &config.lock_file())?;
        let checkpoints = CheckpointManager::open(&config.project_dir)?;
        let sandbox = Sandbox::new(
            &config.project_dir,
            Duration::from_secs(toml.sandbox.shell_timeout_secs),
            toml.sandbox.max_output_bytes,
        )
        .map_err(anyhow::Error::from)?
        .with_read_only(idea_rel.clone());
        let context = ContextBuilder::new(
            sandbox.root(),
            &idea_rel,
            toml.context.max_file_bytes,
            toml.context.max_context_chars,
            &toml.context.ignore,
        );
        let retry = toml.backend.retry();
        let parse_retries = toml.backend.parse_retries;

        Ok(Self {
            idea_hash: sha256_hex(idea.as_bytes()),
            idea,
            store,
            checkpoints,
            sandbox,
            registry: ToolRegistry::with_core_tools(),
            context,
            implementer: Implementer::new(gateway.clone(), retry, toml.sandbox.max_tool_calls_per_turn),
            reviewer: Reviewer::new(gateway.clone(), retry, parse_retries),
            alignment: AlignmentChecker::new(gateway, retry, parse_retries),
            audit: AuditLogger::new(&config.audit_dir()),
            policy: toml.session.policy(),
            settings: LoopSettings::from_config(config),
            run_id: Uuid::new_v4(),
            in_flight: None,
        })
    }

    pub fn settings_mut(&mut self) -> &mut LoopSettings {
        &mut self.settings
    }

    /// Extension tools beyond the core set.
    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// Start a new session. An existing snapshot is only replaced when
    /// `fresh` is set.
    pub fn start(&mut self, fresh: bool) -> Result<SessionState, OrchestratorError> {
        if self.store.exists() {
            if !fresh {
                return Err(anyhow!(
                    "A session already exists at {}; use `tandem resume` or `tandem run --fresh`",
                    self.store.path().display()
                )
                .into());
            }
            self.store.discard()?;
        }
        let base = self.checkpoints.ensure_base()?;
        let state = SessionState::new(&self.idea_hash, INITIAL_INSTRUCTIONS, Some(base));
        self.store.save(&state)?;
        tracing::info!(session = %state.session_id, "Session started");
        Ok(state)
    }

    /// Load the persisted session for another run.
    ///
    /// A snapshot that parses but fails validation ends the session: the
    /// original is kept as `state.json.invalid` and a FAILED record replaces
    /// it. A snapshot that does not parse is only reported.
    pub fn resume(&mut self) -> Result<SessionState, OrchestratorError> {
        let mut state = self.store.read()?;
        if state.phase().is_terminal() {
            return Err(anyhow!("Session is {}; there is nothing to resume", state.phase()).into());
        }
        if let Err(err) = state.validate(Some(&self.idea_hash)) {
            let kept = self.store.preserve_invalid()?;
            state.apply(PhaseEvent::Fail(err.to_string()), &self.policy)?;
            self.store.save(&state)?;
            tracing::error!(kept = %kept.display(), "Session marked FAILED: {}", err);
            return Err(err.into());
        }
        if state.phase() == Phase::Paused {
            state.apply(PhaseEvent::Resume, &self.policy)?;
        } else {
            tracing::warn!(phase = %state.phase(), cursor = ?state.cursor, "Session was not paused cleanly; continuing at the next undone step");
        }
        self.store.save(&state)?;
        tracing::info!(
            session = %state.session_id,
            iteration = state.iteration(),
            phase = %state.phase(),
            "Session resumed"
        );
        Ok(state)
    }

    /// Drive the session until it completes, pauses or fails.
    pub async fn run(&mut self, state: &mut SessionState) -> Result<RunReport, OrchestratorError> {
        // A pause request from an earlier run has been honoured already.
        let _ = std::fs::remove_file(&self.settings.pause_file);

        let handle = WatchdogHandle::new(state.iteration(), state.total_commits);
        let watchdog = Watchdog::spawn(
            handle.clone(),
            self.settings.limits,
            Some(self.settings.pause_file.clone()),
            self.settings.watchdog_poll,
        );
        let runtime_base = state.active_runtime_secs;
        let result = self.drive(state, &handle, runtime_base).await;
        watchdog.stop();
        result?;

        let report = RunReport::from_state(state);
        tracing::info!(
            phase = %report.phase,
            iteration = report.iteration,
            commits = report.total_commits,
            "Session stopped"
        );
        Ok(report)
    }

    async fn drive(
        &mut self,
        state: &mut SessionState,
        handle: &WatchdogHandle,
        runtime_base: u64,
    ) -> Result<(), OrchestratorError> {
        loop {
            if !state.phase().is_active() {
                return Ok(());
            }
            if state.cursor == Step::Implement {
                handle.record_progress(state.iteration(), state.total_commits);
                handle.check(&self.settings.limits);
            }

            let outcome = if handle.is_tripped() {
                StepOutcome::Interrupted
            } else {
                let token = handle.token().clone();
                let step = match state.cursor {
                    Step::Implement => self.implement(state, &token).await,
                    Step::Checkpoint => self.checkpoint(state),
                    Step::Review => self.review(state, &token).await,
                    Step::Rollback => self.rollback(state),
                    Step::Align => self.align(state, &token).await,
                };
                step.unwrap_or_else(|e| StepOutcome::Fail(e.to_string()))
            };

            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Interrupted => {
                    let reason = handle.reason().unwrap_or(PauseReason::Requested);
                    state.apply(PhaseEvent::Pause(reason), &self.policy)?;
                    tracing::warn!(%reason, iteration = state.iteration(), cursor = ?state.cursor, "Session paused");
                }
                StepOutcome::Fail(reason) => {
                    tracing::error!(iteration = state.iteration(), cursor = ?state.cursor, "Session failed: {}", reason);
                    state.apply(PhaseEvent::Fail(reason), &self.policy)?;
                }
            }
            state.active_runtime_secs = runtime_base + handle.elapsed().as_secs();
            self.store.save(state)?;
        }
    }

    fn in_flight(&mut self, state: &SessionState) -> &mut InFlight {
        self.in_flight
            .get_or_insert_with(|| InFlight::new(state.phase()))
    }

    async fn implement(
        &mut self,
        state: &mut SessionState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        self.in_flight = Some(InFlight::new(state.phase()));
        tracing::info!(iteration = state.iteration() + 1, phase = %state.phase(), "Implementer turn");

        let messages = self.context.implementer_view(&self.idea, state);
        let memory = state.memory_for(Role::Implementer.as_str()).to_vec();
        let outcome = match self
            .implementer
            .run_turn(messages, &self.sandbox, &self.registry, &memory, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return Ok(role_outcome(e)),
        };
        state.record_implementer_commits(outcome.commits);
        if outcome.end == TurnEnd::Cancelled {
            return Ok(StepOutcome::Interrupted);
        }

        let violations = outcome.violations();
        if violations > self.settings.max_violations_per_iteration {
            return Ok(StepOutcome::Fail(format!(
                "{} sandbox violations in one iteration (limit {})",
                violations, self.settings.max_violations_per_iteration
            )));
        }
        state.remember(Role::Implementer.as_str(), outcome.memory_notes.iter().cloned());
        state.last_turn_summary = Some(outcome.summary());
        self.in_flight(state).turn = Some(TurnAudit::from(&outcome));
        state.advance(Step::Checkpoint);
        Ok(StepOutcome::Continue)
    }

    fn checkpoint(&mut self, state: &mut SessionState) -> Result<StepOutcome, OrchestratorError> {
        if let Some(checkpoint) = self.checkpoints.checkpoint(state)? {
            self.in_flight(state).checkpoint = Some(checkpoint.commit.clone());
            state.push_checkpoint(checkpoint);
        } else {
            tracing::debug!(iteration = state.iteration() + 1, "Workspace unchanged; no checkpoint");
        }
        state.advance(Step::Review);
        Ok(StepOutcome::Continue)
    }

    async fn review_command_output(&self, command: &str) -> String {
        match self.sandbox.run_shell(command).await {
            Ok(output) => self.sandbox.cap(&output.render()).0,
            Err(SandboxError::Timeout { secs, partial_output }) => {
                format!("timed out after {}s\n{}", secs, self.sandbox.cap(&partial_output).0)
            }
            Err(e) => format!("ERROR ({}): {}", e.kind(), e),
        }
    }

    async fn review(
        &mut self,
        state: &mut SessionState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        let diff = self
            .checkpoints
            .git()
            .diff_since(state.last_reviewed_commit.as_deref(), |p| self.context.reviewer_sees(p))?;
        let command_output = match self.settings.review_command.clone() {
            Some(command) => Some(self.review_command_output(&command).await),
            None => None,
        };
        let evidence = ReviewEvidence { diff, command_output };
        let memory_role = reviewer_memory_role(state.working_phase());
        let messages = self.context.reviewer_view(&self.idea, state, &evidence, memory_role);

        let verdict = match self.reviewer.review(messages, cancel).await {
            Ok(verdict) => verdict,
            Err(e) => return Ok(role_outcome(e)),
        };
        let (before, after) = state.record_review(&verdict, memory_role, &self.policy)?;
        let reviewed = state.iteration();
        state.score_checkpoint(reviewed, verdict.score);
        state.last_reviewed_commit = self.checkpoints.git().head_sha();
        if before != after {
            tracing::info!(iteration = reviewed, score = verdict.score, from = %before, to = %after, "Phase transition");
        } else {
            tracing::info!(iteration = reviewed, score = verdict.score, phase = %after, "Reviewed");
        }

        self.in_flight(state).phase_before = before;
        if after.is_active()
            && let Some(regression) = self.policy.detect_regression(&state.scores())
        {
            if state.rollbacks >= self.settings.max_rollbacks {
                tracing::warn!(
                    rollbacks = state.rollbacks,
                    "Score regression detected but the rollback limit is reached"
                );
            } else if let Some(rollback) =
                self.checkpoints
                    .plan_rollback(state, regression.floor, regression.reviews)?
            {
                tracing::info!(
                    iteration = reviewed,
                    to_iteration = rollback.to_iteration,
                    "Score regression; rollback scheduled"
                );
                state.schedule_rollback(rollback);
                return Ok(StepOutcome::Continue);
            }
        }

        if after.is_active() && self.settings.alignment_due(state.iteration()) {
            state.advance(Step::Align);
        } else {
            state.advance(Step::Implement);
            self.finish_iteration(state, reviewed, verdict.score, after);
        }
        Ok(StepOutcome::Continue)
    }

    /// Carry out the rollback the last review scheduled. The review result
    /// is already persisted; repeating this step after an interruption
    /// resets to the same commit again.
    fn rollback(&mut self, state: &mut SessionState) -> Result<StepOutcome, OrchestratorError> {
        let Some(rollback) = state.pending_rollback().cloned() else {
            return Ok(StepOutcome::Fail("rollback step pending without a target".into()));
        };
        let score = state.latest_score().unwrap_or_default();
        self.checkpoints.restore(&rollback)?;
        let phase = state.rewind_to(rollback.to_iteration, Some(rollback.commit.clone()), &self.policy)?;

        let note = format!(
            "The workspace was rolled back to the end of iteration {} (commit {}) after {} consecutive falling review scores. Redo the lost work carefully.\n\n{}",
            rollback.to_iteration,
            short(&rollback.commit),
            rollback.reviews,
            state.pending_instructions
        );
        state.override_instructions(&note);
        self.in_flight(state).rollback = Some(RollbackAudit::from(&rollback));
        self.finish_iteration(state, rollback.from_iteration, score, phase);
        Ok(StepOutcome::Continue)
    }

    async fn align(
        &mut self,
        state: &mut SessionState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        let messages = self.context.alignment_view(&self.idea, state);
        let verdict = match self.alignment.check(messages, cancel).await {
            Ok(verdict) => verdict,
            Err(e) => return Ok(role_outcome(e)),
        };
        if let Some(correction) = verdict.correction_instructions.as_deref()
            && !verdict.aligned
        {
            tracing::warn!(iteration = state.iteration(), "Drift detected; overriding instructions");
            state.override_instructions(correction);
        }
        self.in_flight(state).aligned = Some(verdict.aligned);
        state.advance(Step::Implement);
        let score = state.latest_score().unwrap_or_default();
        self.finish_iteration(state, state.iteration(), score, state.phase());
        Ok(StepOutcome::Continue)
    }

    /// Append the audit line for a completed iteration.
    fn finish_iteration(&mut self, state: &SessionState, iteration: u32, score: u8, phase_after: Phase) {
        let flight = self
            .in_flight
            .take()
            .unwrap_or_else(|| InFlight::new(state.phase()));
        let entry = IterationAudit {
            run_id: self.run_id,
            session_id: state.session_id,
            iteration,
            phase_before: flight.phase_before,
            phase_after,
            started_at: flight.started_at,
            duration_secs: flight.clock.elapsed().as_secs_f64(),
            turn: flight.turn,
            checkpoint: flight.checkpoint,
            score,
            aligned: flight.aligned,
            rollback: flight.rollback,
        };
        if let Err(e) = self.audit.append(&entry) {
            tracing::warn!("Failed to write audit entry: {:#}", e);
        }
    }
}
