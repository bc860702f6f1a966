use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RecordError;
use crate::resources::ResourceRequest;

/// Minimum number of poll observations kept per record for diagnosing lost
/// jobs. Records keep at least `max_unresolved` notes so the full streak of
/// misses behind a `Lost` verdict is always available.
pub const MAX_POLL_NOTES: usize = 32;

/// Engine-assigned job id, stable for the lifetime of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler-assigned job id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    /// Wrap a scheduler id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, not yet seen by either scheduler view.
    Pending,
    /// Queued or running according to the active view.
    Active,
    /// Missing from both views on the most recent poll.
    Unresolved,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure status.
    Failed,
    /// Missing from both views for too many consecutive polls.
    Lost,
    /// Cancelled by the executor.
    Cancelled,
}

impl JobState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Lost | JobState::Cancelled
        )
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Unresolved => "unresolved",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Lost => "lost",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work handed over by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Engine job id.
    pub job_id: JobId,
    /// Rule that produced the job.
    pub rule: String,
    /// Group id when several rules run as one job.
    #[serde(default)]
    pub group: Option<String>,
    /// Wildcard values, used to lay out log directories.
    #[serde(default)]
    pub wildcards: BTreeMap<String, String>,
    /// Requested cores.
    #[serde(default)]
    pub threads: Option<i64>,
    /// Requested resources.
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Command line the scheduler runs.
    pub command: String,
}

/// What one poll cycle saw for a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollNote {
    /// Query issue ticket.
    pub ticket: u64,
    /// When the result was applied.
    pub at_ms: i64,
    /// Human-readable verdict, e.g. `active:RUNNING` or `absent`.
    pub verdict: String,
}

/// Lifecycle record of one submitted job.
///
/// Mutated by the submission manager (creation, external id), the status
/// poller (`apply_resolution`, see `reconcile`) and the cancellation manager
/// (`cancel`). Transitions out of a terminal state are refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Engine job id.
    pub job_id: JobId,
    /// Rule name, for logs.
    pub rule: String,
    pub(crate) external_id: Option<ExternalId>,
    pub(crate) state: JobState,
    /// Exact submit argv.
    pub submit_argv: Vec<String>,
    /// Captured stdout. Donau writes both streams to one file, so this
    /// equals `stderr_log`.
    pub stdout_log: PathBuf,
    /// Captured stderr.
    pub stderr_log: PathBuf,
    /// When the record was created (first submission attempt).
    pub created_at_ms: i64,
    pub(crate) submitted_at_ms: Option<i64>,
    pub(crate) last_polled_at_ms: Option<i64>,
    /// Submission attempts used.
    pub submit_attempts: u32,
    pub(crate) unresolved_cycles: u32,
    pub(crate) last_status: Option<String>,
    pub(crate) last_applied_ticket: u64,
    pub(crate) in_flight: Option<u64>,
    pub(crate) cancel_requested: bool,
    pub(crate) notes: VecDeque<PollNote>,
}

impl JobRecord {
    /// A record for a job about to be submitted. It has no external id yet.
    pub fn new(
        job_id: JobId,
        rule: impl Into<String>,
        submit_argv: Vec<String>,
        log_path: PathBuf,
        created_at_ms: i64,
    ) -> Self {
        Self {
            job_id,
            rule: rule.into(),
            external_id: None,
            state: JobState::Pending,
            submit_argv,
            stdout_log: log_path.clone(),
            stderr_log: log_path,
            created_at_ms,
            submitted_at_ms: None,
            last_polled_at_ms: None,
            submit_attempts: 0,
            unresolved_cycles: 0,
            last_status: None,
            last_applied_ticket: 0,
            in_flight: None,
            cancel_requested: false,
            notes: VecDeque::new(),
        }
    }

    /// Record the scheduler id after a successful submit. Write-once.
    pub fn assign_external_id(&mut self, id: ExternalId, now_ms: i64) -> Result<(), RecordError> {
        if let Some(existing) = &self.external_id {
            return Err(RecordError::ExternalIdAlreadyAssigned {
                job_id: self.job_id.0,
                existing: existing.to_string(),
            });
        }
        self.external_id = Some(id);
        self.submitted_at_ms = Some(now_ms);
        Ok(())
    }

    /// Scheduler id, once submitted.
    pub fn external_id(&self) -> Option<&ExternalId> {
        self.external_id.as_ref()
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// When the scheduler accepted the job.
    pub fn submitted_at_ms(&self) -> Option<i64> {
        self.submitted_at_ms
    }

    /// When a poll result was last applied.
    pub fn last_polled_at_ms(&self) -> Option<i64> {
        self.last_polled_at_ms
    }

    /// Consecutive polls that found the job in neither view.
    pub fn unresolved_cycles(&self) -> u32 {
        self.unresolved_cycles
    }

    /// Last status string reported by the scheduler.
    pub fn last_status(&self) -> Option<&str> {
        self.last_status.as_deref()
    }

    /// Ticket of the query currently outstanding for this record.
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// True once the record is queued for cancellation.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Recent poll observations, oldest first.
    pub fn notes(&self) -> impl Iterator<Item = &PollNote> {
        self.notes.iter()
    }

    /// Whether the poller should include this record in a new batch.
    pub fn is_pollable(&self, now_ms: i64, initial_delay_ms: i64) -> bool {
        let Some(submitted) = self.submitted_at_ms else {
            return false;
        };
        !self.state.is_terminal()
            && !self.cancel_requested
            && self.in_flight.is_none()
            && now_ms - submitted >= initial_delay_ms
    }

    /// Mark a query as outstanding. Returns false if one already is.
    pub fn begin_query(&mut self, ticket: u64) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        self.in_flight = Some(ticket);
        true
    }

    /// Release the in-flight slot without applying anything, e.g. when a
    /// claimed batch is abandoned at shutdown.
    pub fn end_query(&mut self, ticket: u64) {
        if self.in_flight == Some(ticket) {
            self.in_flight = None;
        }
    }

    /// Stop the poller from applying non-terminal updates.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    /// Move to `Cancelled`. Already-terminal records are left alone and
    /// yield `None`.
    pub fn cancel(&mut self, now_ms: i64) -> Option<JobEvent> {
        self.cancel_requested = true;
        self.in_flight = None;
        self.transition(JobState::Cancelled, now_ms)
    }

    /// Engine-facing result, available once the record is terminal.
    pub fn outcome(&self) -> Option<JobOutcome> {
        if !self.state.is_terminal() {
            return None;
        }
        let failure = match self.state {
            JobState::Succeeded => None,
            JobState::Failed => Some(JobFailure::Scheduler {
                status: self.last_status.clone().unwrap_or_default(),
            }),
            JobState::Lost => Some(JobFailure::Lost {
                cycles: self.unresolved_cycles,
            }),
            _ => Some(JobFailure::Cancelled),
        };
        Some(JobOutcome {
            job_id: self.job_id,
            external_id: self.external_id.clone(),
            state: self.state,
            stdout_log: self.stdout_log.clone(),
            stderr_log: self.stderr_log.clone(),
            failure,
        })
    }

    /// Append a note, keeping at most `keep` of the newest ones.
    pub(crate) fn push_note(&mut self, note: PollNote, keep: usize) {
        while self.notes.len() >= keep.max(1) {
            self.notes.pop_front();
        }
        self.notes.push_back(note);
    }

    pub(crate) fn transition(&mut self, to: JobState, now_ms: i64) -> Option<JobEvent> {
        if self.state.is_terminal() || self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(JobEvent {
            job_id: self.job_id,
            external_id: self.external_id.clone(),
            from,
            to,
            scheduler_status: self.last_status.clone(),
            at_ms: now_ms,
        })
    }
}

/// A state change, emitted to the engine-facing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Engine job id.
    pub job_id: JobId,
    /// Scheduler id.
    pub external_id: Option<ExternalId>,
    /// Previous state.
    pub from: JobState,
    /// New state.
    pub to: JobState,
    /// Scheduler status string behind the change, if any.
    pub scheduler_status: Option<String>,
    /// When the change was applied.
    pub at_ms: i64,
}

/// Why a job did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// The scheduler reported a failure status.
    #[error("scheduler reported status {status}")]
    Scheduler {
        /// Raw status string.
        status: String,
    },
    /// The job vanished from both scheduler views.
    #[error("job lost: absent from active and historical views for {cycles} polls")]
    Lost {
        /// Consecutive unresolved polls.
        cycles: u32,
    },
    /// The executor cancelled the job.
    #[error("job cancelled")]
    Cancelled,
}

/// Terminal result handed back to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Engine job id.
    pub job_id: JobId,
    /// Scheduler id.
    pub external_id: Option<ExternalId>,
    /// Terminal state.
    pub state: JobState,
    /// Captured stdout.
    pub stdout_log: PathBuf,
    /// Captured stderr.
    pub stderr_log: PathBuf,
    /// Set unless the job succeeded.
    pub failure: Option<JobFailure>,
}

impl JobOutcome {
    /// True for `Succeeded`.
    pub fn is_success(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(JobId(1), "r", vec!["dsub".into()], PathBuf::from("/l/1.log"), 100)
    }

    #[test]
    fn external_id_is_write_once() {
        let mut rec = record();
        assert!(rec.external_id().is_none());
        rec.assign_external_id("42".into(), 200).unwrap();
        assert_eq!(rec.external_id().map(ExternalId::as_str), Some("42"));
        assert_eq!(rec.submitted_at_ms(), Some(200));

        let err = rec.assign_external_id("43".into(), 300).unwrap_err();
        assert_eq!(
            err,
            RecordError::ExternalIdAlreadyAssigned {
                job_id: 1,
                existing: "42".into()
            }
        );
        assert_eq!(rec.external_id().map(ExternalId::as_str), Some("42"));
    }

    #[test]
    fn unsubmitted_records_are_not_pollable() {
        let rec = record();
        assert!(!rec.is_pollable(10_000, 0));
    }

    #[test]
    fn initial_delay_gates_polling() {
        let mut rec = record();
        rec.assign_external_id("1".into(), 1_000).unwrap();
        assert!(!rec.is_pollable(5_999, 5_000));
        assert!(rec.is_pollable(6_000, 5_000));
    }

    #[test]
    fn one_query_in_flight_at_a_time() {
        let mut rec = record();
        rec.assign_external_id("1".into(), 0).unwrap();
        assert!(rec.begin_query(1));
        assert!(!rec.begin_query(2));
        assert!(!rec.is_pollable(10, 0));
        rec.end_query(2);
        assert_eq!(rec.in_flight(), Some(1));
        rec.end_query(1);
        assert!(rec.is_pollable(10, 0));
    }

    #[test]
    fn cancel_is_a_noop_for_terminal_records() {
        let mut rec = record();
        rec.assign_external_id("1".into(), 0).unwrap();
        let ev = rec.cancel(5).unwrap();
        assert_eq!((ev.from, ev.to), (JobState::Pending, JobState::Cancelled));
        assert!(rec.cancel(6).is_none());
        assert_eq!(rec.state(), JobState::Cancelled);
    }

    #[test]
    fn outcome_only_for_terminal_records() {
        let mut rec = record();
        assert!(rec.outcome().is_none());
        rec.cancel(1);
        let out = rec.outcome().unwrap();
        assert_eq!(out.failure, Some(JobFailure::Cancelled));
        assert!(!out.is_success());
        assert_eq!(out.stdout_log, out.stderr_log);
    }

    #[test]
    fn notes_are_bounded() {
        let mut rec = record();
        for i in 0..(MAX_POLL_NOTES as u64 + 5) {
            rec.push_note(
                PollNote {
                    ticket: i,
                    at_ms: i as i64,
                    verdict: "absent".into(),
                },
                MAX_POLL_NOTES,
            );
        }
        assert_eq!(rec.notes().count(), MAX_POLL_NOTES);
        assert_eq!(rec.notes().next().map(|n| n.ticket), Some(5));
    }

    #[test]
    fn state_serde_is_snake_case() {
        assert_eq!(serde_json::to_string(&JobState::Unresolved).unwrap(), r#""unresolved""#);
        assert!(JobState::Lost.is_terminal());
        assert!(!JobState::Unresolved.is_terminal());
    }
}
